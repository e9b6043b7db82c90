//! Gatehouse - host-routing edge proxy with an IP reputation engine
//!
//! A single-binary edge service that:
//! - Terminates HTTPS on :443 and routes each request by its Host header
//! - Drops traffic from banned IPs before it reaches any backend
//! - Auto-bans IPs that probe for admin panels and dotfiles
//! - Serves maintenance pages globally or per routing rule
//! - Streams its own log output to operator WebSocket subscribers

pub mod admin;
pub mod client_ip;
pub mod config;
pub mod country;
pub mod dispatch;
pub mod logbus;
pub mod notify;
pub mod reputation;
pub mod rules;
pub mod stats;
pub mod tls_frontend;

// Re-export commonly used types
pub use client_ip::{append_forwarded_for, best_client_ip, is_public_ip};
pub use config::ServiceConfig;
pub use country::CountryResolver;
pub use dispatch::DispatcherState;
pub use logbus::{LogBus, LogSubscriber};
pub use notify::{LogNotifier, Notifier};
pub use reputation::{ReputationStore, SuspiciousIp};
pub use rules::{RuleSnapshot, RuleStore};
pub use stats::Stats;
pub use tls_frontend::{CertResolver, ChallengeMap};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
