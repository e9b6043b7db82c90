//! Gatehouse - host-routing edge proxy with an IP reputation engine
//!
//! Wires the file-backed stores, the log bus, the telemetry aggregator and
//! the notifier into the dispatch pipeline, then runs three listeners: the
//! certificate-challenge handler on :80, the TLS dispatcher on :443 and the
//! private operator surface.

use std::sync::Arc;

use clap::Parser;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::fmt::writer::MakeWriterExt;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use gatehouse::admin::{run_admin_server, AdminState};
use gatehouse::config::ServiceConfig;
use gatehouse::country::CountryResolver;
use gatehouse::dispatch::{self, DispatcherState};
use gatehouse::logbus::LogBus;
use gatehouse::notify::LogNotifier;
use gatehouse::reputation::ReputationStore;
use gatehouse::rules::{run_health_probes, RuleStore};
use gatehouse::stats::{run_collector, Stats};
use gatehouse::tls_frontend::{
    ensure_certs_dir, run_challenge_listener, run_tls_listener, CertResolver, ChallengeMap,
};

/// Gatehouse - host-routing edge proxy with IP reputation
#[derive(Parser, Debug)]
#[command(name = "gatehouse")]
#[command(version, about, long_about = None)]
struct Args {
    /// Plain-HTTP bind address (certificate challenge only)
    #[arg(long, default_value = "0.0.0.0:80")]
    http_addr: std::net::SocketAddr,

    /// HTTPS bind address (dispatch pipeline)
    #[arg(long, default_value = "0.0.0.0:443")]
    https_addr: std::net::SocketAddr,

    /// Operator surface bind address
    #[arg(long, default_value = "127.0.0.1:8162", env = "PANEL_ADDR")]
    panel_addr: std::net::SocketAddr,

    /// Routing rules state file
    #[arg(long, default_value = "rules.json")]
    rules: std::path::PathBuf,

    /// IP reputation state file
    #[arg(long, default_value = "ip_reputation.json")]
    reputation: std::path::PathBuf,

    /// Static assets directory (maintenance stylesheet)
    #[arg(long, default_value = "static")]
    static_dir: std::path::PathBuf,

    /// Directory the certificate source keeps PEM pairs in
    #[arg(long, default_value = "certs")]
    certs_dir: std::path::PathBuf,

    /// Operator username
    #[arg(long, env = "ADMIN_USER")]
    admin_user: Option<String>,

    /// Operator password
    #[arg(long, env = "ADMIN_PASS")]
    admin_pass: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", env = "GATEHOUSE_LOG_LEVEL")]
    log_level: String,

    /// Enable JSON log format
    #[arg(long, env = "GATEHOUSE_JSON_LOGS")]
    json_logs: bool,
}

impl Args {
    fn into_config(self) -> ServiceConfig {
        ServiceConfig {
            http_addr: self.http_addr,
            https_addr: self.https_addr,
            panel_addr: self.panel_addr,
            rules_path: self.rules,
            reputation_path: self.reputation,
            static_dir: self.static_dir,
            certs_dir: self.certs_dir,
            admin_user: self.admin_user,
            admin_pass: self.admin_pass,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install the rustls CryptoProvider before any TLS operations.
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("Failed to install rustls crypto provider");

    let args = Args::parse();
    let log_level = args.log_level.clone();
    let json_logs = args.json_logs;
    let config = args.into_config();

    // The log bus must exist before logging starts so every line reaches
    // operator subscribers as well as stderr.
    let logs = LogBus::new();
    init_logging(&log_level, json_logs, &logs)?;

    info!("Starting gatehouse v{}", env!("CARGO_PKG_VERSION"));
    config.validate()?;

    let rules = Arc::new(RuleStore::new(&config.rules_path));
    let reputation = Arc::new(ReputationStore::new(&config.reputation_path));
    let stats = Arc::new(Stats::new());
    let country = Arc::new(CountryResolver::new());
    let notifier = LogNotifier::new();

    info!(
        "loaded {} routing rules, {} reputation records",
        rules.all().len(),
        reputation.list().len()
    );

    // Background duties: system gauges and backend health probes.
    tokio::spawn(run_collector(stats.clone()));
    tokio::spawn(run_health_probes(rules.clone()));

    // Operator surface.
    let admin_state = AdminState {
        rules: rules.clone(),
        reputation: reputation.clone(),
        stats: stats.clone(),
        logs: logs.clone(),
        notifier: notifier.clone(),
        credentials: config.credentials(),
    };
    let panel_addr = config.panel_addr;
    tokio::spawn(async move {
        if let Err(err) = run_admin_server(panel_addr, admin_state).await {
            error!("operator surface error: {err}");
        }
    });

    // Certificate challenge listener on :80.
    ensure_certs_dir(&config.certs_dir);
    let challenges = ChallengeMap::new();
    let http_addr = config.http_addr;
    let challenge_map = challenges.clone();
    tokio::spawn(async move {
        if let Err(err) = run_challenge_listener(http_addr, challenge_map).await {
            error!("challenge listener error: {err}");
        }
    });

    // Dispatch pipeline behind TLS on :443.
    let dispatcher = DispatcherState {
        rules: rules.clone(),
        reputation,
        stats,
        country,
        notifier,
        http_client: dispatch::new_http_client(),
        static_dir: config.static_dir.clone(),
    };
    let resolver = CertResolver::new(rules, &config.certs_dir);
    let https_addr = config.https_addr;
    let app = dispatch::router(dispatcher);
    tokio::spawn(async move {
        if let Err(err) = run_tls_listener(https_addr, app, resolver).await {
            error!("HTTPS listener error: {err}");
        }
    });

    info!(
        "listeners up: http={} https={} panel={}",
        config.http_addr, config.https_addr, config.panel_addr
    );

    tokio::select! {
        _ = signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
        }
        _ = shutdown_signal() => {
            info!("Received shutdown signal, shutting down");
        }
    }

    Ok(())
}

/// Initialize logging to stderr and the log bus.
fn init_logging(level: &str, json: bool, logs: &Arc<LogBus>) -> anyhow::Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let writer = std::io::stderr.and(logs.make_writer());

    if json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().json().with_writer(writer))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().with_ansi(false).with_target(true).with_writer(writer))
            .init();
    }

    Ok(())
}

/// Wait for an OS shutdown signal.
#[cfg(unix)]
async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate()).expect("Failed to install SIGTERM handler");
    let mut sigquit = signal(SignalKind::quit()).expect("Failed to install SIGQUIT handler");

    tokio::select! {
        _ = sigterm.recv() => {
            info!("Received SIGTERM");
        }
        _ = sigquit.recv() => {
            info!("Received SIGQUIT");
        }
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() {
    std::future::pending::<()>().await;
}
