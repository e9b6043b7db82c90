//! Service configuration
//!
//! Everything operationally interesting is externalized: bind addresses,
//! state-file paths, the static asset and certificate directories, and the
//! operator credentials. Values arrive through CLI flags or environment
//! variables (`PANEL_ADDR`, `ADMIN_USER`, `ADMIN_PASS`); this module holds
//! the resolved configuration and its sanity checks.

use std::net::SocketAddr;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::warn;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Plain-HTTP listener; serves only the certificate challenge.
    pub http_addr: SocketAddr,
    /// TLS listener carrying the dispatch pipeline.
    pub https_addr: SocketAddr,
    /// Operator surface bind address; private by default.
    pub panel_addr: SocketAddr,
    pub rules_path: PathBuf,
    pub reputation_path: PathBuf,
    /// Directory holding the maintenance page stylesheet.
    pub static_dir: PathBuf,
    /// Directory the external certificate source writes PEM pairs into.
    pub certs_dir: PathBuf,
    pub admin_user: Option<String>,
    pub admin_pass: Option<String>,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            http_addr: "0.0.0.0:80".parse().expect("static addr"),
            https_addr: "0.0.0.0:443".parse().expect("static addr"),
            panel_addr: "127.0.0.1:8162".parse().expect("static addr"),
            rules_path: PathBuf::from("rules.json"),
            reputation_path: PathBuf::from("ip_reputation.json"),
            static_dir: PathBuf::from("static"),
            certs_dir: PathBuf::from("certs"),
            admin_user: None,
            admin_pass: None,
        }
    }
}

impl ServiceConfig {
    /// Operator credentials when both halves are present.
    pub fn credentials(&self) -> Option<(String, String)> {
        match (&self.admin_user, &self.admin_pass) {
            (Some(user), Some(pass)) if !user.is_empty() && !pass.is_empty() => {
                Some((user.clone(), pass.clone()))
            }
            _ => None,
        }
    }

    /// Surface configuration smells without refusing to start.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.credentials().is_none() {
            warn!("ADMIN_USER/ADMIN_PASS not set; operator surface runs unauthenticated");
        }
        if !self.panel_addr.ip().is_loopback() {
            warn!(
                "operator surface bound to non-loopback address {}",
                self.panel_addr
            );
        }
        if self.http_addr.port() == self.https_addr.port() {
            anyhow::bail!("http and https listeners cannot share a port");
        }
        Ok(())
    }
}
