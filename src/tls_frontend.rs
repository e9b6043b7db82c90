//! TLS front-end
//!
//! Binds the dispatcher to :443 behind rustls with SNI-driven certificate
//! lookup. Certificates themselves come from an external source that writes
//! `<host>.crt` / `<host>.key` PEM pairs into the certificate directory and
//! keeps HTTP-01 challenge tokens in the shared [`ChallengeMap`]; the only
//! admission decision the core makes is the routing store's host policy,
//! which is the sole rejection source for issuance.
//!
//! The :80 listener serves exactly the challenge path and redirects every
//! other request to HTTPS.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use axum::{
    extract::{Host, Path as AxumPath, State},
    http::{StatusCode, Uri},
    response::{IntoResponse, Redirect, Response},
    routing::get,
    Router,
};
use axum_server::tls_rustls::RustlsConfig;
use parking_lot::RwLock;
use rustls::pki_types::CertificateDer;
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use tracing::{debug, info, warn};

use crate::rules::RuleStore;

const ACME_CHALLENGE_PREFIX: &str = "/.well-known/acme-challenge";

/// Pending HTTP-01 challenges, shared with the external certificate source.
#[derive(Clone, Default)]
pub struct ChallengeMap {
    tokens: Arc<RwLock<HashMap<String, String>>>,
}

impl ChallengeMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, token: &str, key_authorization: &str) {
        self.tokens
            .write()
            .insert(token.to_string(), key_authorization.to_string());
    }

    pub fn remove(&self, token: &str) {
        self.tokens.write().remove(token);
    }

    pub fn get(&self, token: &str) -> Option<String> {
        self.tokens.read().get(token).cloned()
    }
}

/// SNI certificate resolver gated by the routing store's host policy.
pub struct CertResolver {
    rules: Arc<RuleStore>,
    certs_dir: PathBuf,
    cache: RwLock<HashMap<String, Arc<CertifiedKey>>>,
}

impl CertResolver {
    pub fn new(rules: Arc<RuleStore>, certs_dir: impl Into<PathBuf>) -> Arc<Self> {
        Arc::new(Self {
            rules,
            certs_dir: certs_dir.into(),
            cache: RwLock::new(HashMap::new()),
        })
    }

    /// Certificate for `host`, if the host is admitted and a PEM pair exists.
    fn resolve_host(&self, host: &str) -> Option<Arc<CertifiedKey>> {
        if let Err(err) = self.rules.host_policy(host) {
            debug!("refusing certificate lookup: {err}");
            return None;
        }
        if let Some(key) = self.cache.read().get(host) {
            return Some(key.clone());
        }
        match self.load_certified_key(host) {
            Ok(key) => {
                let key = Arc::new(key);
                self.cache.write().insert(host.to_string(), key.clone());
                Some(key)
            }
            Err(err) => {
                debug!("no usable certificate for {host}: {err}");
                None
            }
        }
    }

    fn load_certified_key(&self, host: &str) -> anyhow::Result<CertifiedKey> {
        let cert_path = self.certs_dir.join(format!("{host}.crt"));
        let key_path = self.certs_dir.join(format!("{host}.key"));

        let cert_file = std::fs::File::open(&cert_path)?;
        let mut cert_reader = std::io::BufReader::new(cert_file);
        let cert_chain: Vec<CertificateDer<'static>> =
            rustls_pemfile::certs(&mut cert_reader).collect::<Result<Vec<_>, _>>()?;
        if cert_chain.is_empty() {
            anyhow::bail!("no certificates in {cert_path:?}");
        }

        let key_file = std::fs::File::open(&key_path)?;
        let mut key_reader = std::io::BufReader::new(key_file);
        let private_key = rustls_pemfile::private_key(&mut key_reader)?
            .ok_or_else(|| anyhow::anyhow!("no private key in {key_path:?}"))?;
        let signing_key = rustls::crypto::ring::sign::any_supported_type(&private_key)
            .map_err(|err| anyhow::anyhow!("unsupported key in {key_path:?}: {err}"))?;

        Ok(CertifiedKey::new(cert_chain, signing_key))
    }

    /// Drop a cached certificate so the next handshake reloads it from disk
    /// (the external source calls this after renewal).
    pub fn invalidate(&self, host: &str) {
        self.cache.write().remove(host);
    }
}

impl std::fmt::Debug for CertResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertResolver")
            .field("certs_dir", &self.certs_dir)
            .finish_non_exhaustive()
    }
}

impl ResolvesServerCert for CertResolver {
    fn resolve(&self, client_hello: ClientHello) -> Option<Arc<CertifiedKey>> {
        let sni = client_hello.server_name()?;
        self.resolve_host(sni)
    }
}

/// Serve the dispatcher over TLS with SNI certificate resolution.
pub async fn run_tls_listener(
    addr: SocketAddr,
    app: Router,
    resolver: Arc<CertResolver>,
) -> anyhow::Result<()> {
    let mut server_config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_cert_resolver(resolver);
    server_config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];

    info!("HTTPS listener ready on {addr}");
    axum_server::bind_rustls(addr, RustlsConfig::from_config(Arc::new(server_config)))
        .serve(app.into_make_service_with_connect_info::<SocketAddr>())
        .await?;
    Ok(())
}

async fn challenge_handler(
    State(challenges): State<ChallengeMap>,
    AxumPath(token): AxumPath<String>,
) -> Response {
    match challenges.get(&token) {
        Some(key_authorization) => (StatusCode::OK, key_authorization).into_response(),
        None => {
            debug!("unknown acme challenge token {token:?}");
            (StatusCode::NOT_FOUND, "Not Found").into_response()
        }
    }
}

async fn redirect_to_https(Host(host): Host, uri: Uri) -> Redirect {
    let path = uri.path();
    let query = uri.query().map(|q| format!("?{q}")).unwrap_or_default();
    Redirect::permanent(&format!("https://{host}{path}{query}"))
}

/// The :80 router: challenge tokens only, everything else redirects.
pub fn challenge_router(challenges: ChallengeMap) -> Router {
    Router::new()
        .route(
            &format!("{ACME_CHALLENGE_PREFIX}/:token"),
            get(challenge_handler),
        )
        .fallback(redirect_to_https)
        .with_state(challenges)
}

/// Run the plain-HTTP challenge listener.
pub async fn run_challenge_listener(addr: SocketAddr, challenges: ChallengeMap) -> anyhow::Result<()> {
    let app = challenge_router(challenges);
    info!("HTTP challenge listener ready on {addr}");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app.into_make_service()).await?;
    Ok(())
}

/// Log (rather than fail) when the certificate directory is missing; the
/// external source creates it on first issuance.
pub fn ensure_certs_dir(dir: &std::path::Path) {
    if let Err(err) = std::fs::create_dir_all(dir) {
        warn!("could not create certificate directory {dir:?}: {err}");
    }
}
