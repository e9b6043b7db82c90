//! Request country attribution
//!
//! Fronting CDNs usually hand us the country in a header; when they do not,
//! a short external lookup runs with a hard 400 ms cap so the dispatch path
//! can never hang on it. Results are cached per IP for a day. Anything that
//! fails resolves to `"UN"`; non-public client IPs resolve to `"LOCAL"`.

use std::net::IpAddr;
use std::time::Duration;

use axum::body::Body;
use axum::http::{HeaderMap, Request};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use http_body_util::BodyExt;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use serde::Deserialize;
use tracing::debug;

use crate::client_ip::is_public_ip;

/// Country used when attribution fails.
pub const UNKNOWN_COUNTRY: &str = "UN";

/// Country used for loopback and private client addresses.
pub const LOCAL_COUNTRY: &str = "LOCAL";

const CACHE_TTL_HOURS: i64 = 24;
const LOOKUP_TIMEOUT: Duration = Duration::from_millis(400);
const COUNTRY_HEADERS: [&str; 3] = ["cf-ipcountry", "x-country-code", "x-country"];

struct CachedCountry {
    code: String,
    expires_at: DateTime<Utc>,
}

#[derive(Deserialize)]
struct LookupResponse {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    country_code: String,
}

/// Resolves the country of a request's client IP.
pub struct CountryResolver {
    client: Client<hyper_rustls::HttpsConnector<HttpConnector>, Body>,
    cache: DashMap<String, CachedCountry>,
}

impl CountryResolver {
    pub fn new() -> Self {
        let https = hyper_rustls::HttpsConnectorBuilder::new()
            .with_webpki_roots()
            .https_only()
            .enable_http1()
            .build();
        let client = Client::builder(TokioExecutor::new()).build(https);
        Self {
            client,
            cache: DashMap::new(),
        }
    }

    /// Country code for a request, preferring CDN headers over lookups.
    pub async fn resolve(&self, headers: &HeaderMap, client_ip: IpAddr) -> String {
        if let Some(code) = country_from_headers(headers) {
            return normalize_country(&code);
        }
        if !is_public_ip(client_ip) {
            return LOCAL_COUNTRY.to_string();
        }

        let ip = client_ip.to_string();
        if let Some(cached) = self.cached(&ip) {
            return cached;
        }

        let code = match tokio::time::timeout(LOOKUP_TIMEOUT, self.lookup(&ip)).await {
            Ok(code) => code,
            Err(_) => {
                debug!("country lookup for {ip} timed out");
                UNKNOWN_COUNTRY.to_string()
            }
        };
        self.cache_put(&ip, &code);
        code
    }

    async fn lookup(&self, ip: &str) -> String {
        let uri = format!("https://ipwho.is/{ip}");
        let request = match Request::builder().uri(uri).body(Body::empty()) {
            Ok(request) => request,
            Err(_) => return UNKNOWN_COUNTRY.to_string(),
        };

        let response = match self.client.request(request).await {
            Ok(response) if response.status().is_success() => response,
            Ok(response) => {
                debug!("country lookup for {ip}: status {}", response.status());
                return UNKNOWN_COUNTRY.to_string();
            }
            Err(err) => {
                debug!("country lookup for {ip} failed: {err}");
                return UNKNOWN_COUNTRY.to_string();
            }
        };

        let body = match response.into_body().collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(_) => return UNKNOWN_COUNTRY.to_string(),
        };
        match serde_json::from_slice::<LookupResponse>(&body) {
            Ok(payload) if payload.success => normalize_country(&payload.country_code),
            _ => UNKNOWN_COUNTRY.to_string(),
        }
    }

    fn cached(&self, ip: &str) -> Option<String> {
        let entry = self.cache.get(ip)?;
        if Utc::now() > entry.expires_at {
            drop(entry);
            self.cache.remove(ip);
            return None;
        }
        Some(entry.code.clone())
    }

    fn cache_put(&self, ip: &str, code: &str) {
        self.cache.insert(
            ip.to_string(),
            CachedCountry {
                code: code.to_string(),
                expires_at: Utc::now() + chrono::Duration::hours(CACHE_TTL_HOURS),
            },
        );
    }
}

impl Default for CountryResolver {
    fn default() -> Self {
        Self::new()
    }
}

fn country_from_headers(headers: &HeaderMap) -> Option<String> {
    for name in COUNTRY_HEADERS {
        let value = headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .unwrap_or("");
        // XX and T1 are Cloudflare's "unknown" and "Tor" placeholders.
        if !value.is_empty() && value != "XX" && value != "T1" {
            return Some(value.to_string());
        }
    }
    None
}

/// Uppercased country code, `"UN"` when empty.
pub fn normalize_country(code: &str) -> String {
    let code = code.trim().to_uppercase();
    if code.is_empty() {
        UNKNOWN_COUNTRY.to_string()
    } else {
        code
    }
}
