//! Request dispatch pipeline
//!
//! Every request passes an ordered gate chain, stopping at the first gate
//! that responds:
//!
//! 1. client-IP derivation
//! 2. ban enforcement
//! 3. global maintenance
//! 4. host-rule lookup
//! 5. probe-path detection (marks, never blocks)
//! 6. per-rule maintenance
//! 7. reverse-proxy forward
//!
//! The order is load-bearing: banned IPs must never see maintenance pages,
//! maintenance must answer even unknown hosts, and probe detection only
//! runs once a rule matched so a nonexistent host is not tagged twice.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Body,
    extract::{ConnectInfo, State},
    http::{header, HeaderValue, Method, Request, StatusCode, Uri},
    response::{Html, IntoResponse, Response},
    routing::any,
    Router,
};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use tracing::{error, info, warn};

use crate::client_ip::{append_forwarded_for, best_client_ip};
use crate::country::CountryResolver;
use crate::notify::{
    build_proxy_alert, Notifier, EVENT_BLOCKED_IP_HIT, EVENT_SUSPICIOUS_PROBE,
    EVENT_UNKNOWN_HOST,
};
use crate::reputation::ReputationStore;
use crate::rules::RuleStore;
use crate::stats::Stats;

/// Path fragments attackers probe for. Matching is a case-insensitive
/// substring check against the path, query string excluded. The list may
/// grow but must never shrink.
pub const PROBE_TOKENS: &[&str] = &[
    ".env",
    "wp-admin",
    "wp-login",
    "phpmyadmin",
    "adminer",
    "/etc/passwd",
    "/.git",
];

/// Request headers that must not be copied to the upstream hop.
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "host",
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

const MAINTENANCE_PAGE: &str = r#"<!DOCTYPE html>
<html lang="en">
<head>
  <meta charset="utf-8">
  <meta name="viewport" content="width=device-width, initial-scale=1">
  <title>Maintenance</title>
  <link rel="stylesheet" href="/static/styles.css">
</head>
<body>
  <main class="maintenance">
    <h1>We&rsquo;ll be right back</h1>
    <p>This service is down for scheduled maintenance. Please try again in a few minutes.</p>
  </main>
</body>
</html>
"#;

/// Shared collaborators of the dispatch pipeline. The dispatcher owns no
/// persistent state of its own; it borrows the stores wired in at startup.
#[derive(Clone)]
pub struct DispatcherState {
    pub rules: Arc<RuleStore>,
    pub reputation: Arc<ReputationStore>,
    pub stats: Arc<Stats>,
    pub country: Arc<CountryResolver>,
    pub notifier: Arc<dyn Notifier>,
    pub http_client: Client<HttpConnector, Body>,
    pub static_dir: PathBuf,
}

/// Pooled plain-HTTP client for backend forwarding.
pub fn new_http_client() -> Client<HttpConnector, Body> {
    Client::builder(TokioExecutor::new())
        .pool_max_idle_per_host(100)
        .pool_idle_timeout(Duration::from_secs(90))
        .build_http()
}

/// The data-plane router: every request funnels into the gate chain.
pub fn router(state: DispatcherState) -> Router {
    Router::new()
        .fallback(any(dispatch_handler))
        .with_state(state)
}

/// `Host` header value with any port stripped, IPv6 literals included.
fn request_host(request: &Request<Body>) -> String {
    let raw = request
        .headers()
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .or_else(|| request.uri().host().map(str::to_string))
        .unwrap_or_default();

    if let Some(end) = raw.rfind(']') {
        // [v6-literal] with or without a port suffix
        return raw[..=end].to_string();
    }
    match raw.rsplit_once(':') {
        Some((host, port)) if port.chars().all(|c| c.is_ascii_digit()) => host.to_string(),
        _ => raw,
    }
}

fn is_probe_path(path: &str) -> bool {
    let lowered = path.to_lowercase();
    PROBE_TOKENS.iter().any(|token| lowered.contains(token))
}

async fn dispatch_handler(
    State(state): State<DispatcherState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    request: Request<Body>,
) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let host = request_host(&request);

    // 1. Client-IP derivation.
    let client_ip = best_client_ip(request.headers(), peer.ip());
    let client_ip_text = client_ip.to_string();

    // 2. Ban gate. Banned traffic is dropped before anything else, so a
    // banned IP never even sees the maintenance page.
    if state.reputation.is_banned(&client_ip_text) {
        warn!(
            method = %method, path = %path, host = %host,
            remote_addr = %peer, client_ip = %client_ip_text,
            "blocked-ip request rejected"
        );
        state.notifier.notify(
            EVENT_BLOCKED_IP_HIT,
            &format!("blocked:{client_ip_text}"),
            &build_proxy_alert(method.as_str(), &path, &host, &client_ip_text, "banned ip hit"),
            None,
        );
        return (StatusCode::FORBIDDEN, "Forbidden").into_response();
    }

    // 3. Global maintenance gate.
    if state.rules.maintenance_mode() {
        info!(
            method = %method, path = %path, host = %host,
            remote_addr = %peer, client_ip = %client_ip_text,
            "maintenance mode response"
        );
        return maintenance_response(&state, &method, &path).await;
    }

    // 4. Host-rule lookup.
    let Some(rule) = state.rules.get_rule(&host) else {
        warn!(
            method = %method, path = %path, host = %host,
            remote_addr = %peer, client_ip = %client_ip_text,
            "no routing rule for host"
        );
        state.reputation.mark_suspicious(&client_ip_text, "unknown host");
        state.notifier.notify(
            EVENT_UNKNOWN_HOST,
            &format!("unknown:{host}:{client_ip_text}"),
            &build_proxy_alert(method.as_str(), &path, &host, &client_ip_text, "unknown host"),
            Some(&client_ip_text),
        );
        return (StatusCode::NOT_FOUND, "Not Found").into_response();
    };

    // 5. Probe detection. The request still forwards; only the mark and the
    // notification happen here.
    if is_probe_path(&path) {
        let (just_banned, ban_until) = state
            .reputation
            .mark_suspicious(&client_ip_text, "suspicious path probe");
        warn!(
            method = %method, path = %path, host = %host,
            remote_addr = %peer, client_ip = %client_ip_text,
            auto_banned = just_banned,
            "suspicious path probe"
        );
        if just_banned {
            info!(
                client_ip = %client_ip_text,
                ban_until = ?ban_until,
                "auto-banned after repeated probes"
            );
        }
        state.notifier.notify(
            EVENT_SUSPICIOUS_PROBE,
            &format!("probe:{client_ip_text}"),
            &build_proxy_alert(
                method.as_str(),
                &path,
                &host,
                &client_ip_text,
                "suspicious path probe",
            ),
            Some(&client_ip_text),
        );
    }

    // 6. Per-rule maintenance gate.
    if rule.maintenance {
        info!(
            method = %method, path = %path, host = %host,
            remote_addr = %peer, client_ip = %client_ip_text,
            "rule maintenance response"
        );
        return maintenance_response(&state, &method, &path).await;
    }

    // 7. Forward.
    let country = state.country.resolve(request.headers(), client_ip).await;
    state.stats.add_request(&host, &country);

    forward(&state, request, &rule.target, &host, client_ip, peer).await
}

/// Maintenance answer: the HTML page, except for its own stylesheet which
/// must load from disk for the page to render.
async fn maintenance_response(state: &DispatcherState, method: &Method, path: &str) -> Response {
    if path == "/static/styles.css" {
        if method != Method::GET && method != Method::HEAD {
            return (StatusCode::METHOD_NOT_ALLOWED, "Method Not Allowed").into_response();
        }
        let file = state.static_dir.join("styles.css");
        return match tokio::fs::read(&file).await {
            Ok(contents) => (
                StatusCode::OK,
                [(header::CONTENT_TYPE, "text/css; charset=utf-8")],
                contents,
            )
                .into_response(),
            Err(err) => {
                warn!("maintenance stylesheet {file:?} unreadable: {err}");
                (StatusCode::NOT_FOUND, "Not Found").into_response()
            }
        };
    }
    (StatusCode::SERVICE_UNAVAILABLE, Html(MAINTENANCE_PAGE)).into_response()
}

async fn forward(
    state: &DispatcherState,
    request: Request<Body>,
    target: &str,
    original_host: &str,
    client_ip: std::net::IpAddr,
    peer: SocketAddr,
) -> Response {
    let path_and_query = request
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| "/".to_string());

    let upstream_uri: Uri = match format!("http://{target}{path_and_query}").parse() {
        Ok(uri) => uri,
        Err(err) => {
            error!("unparsable target {target:?} for host {original_host}: {err}");
            return (StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error").into_response();
        }
    };
    let upstream_host = upstream_uri
        .authority()
        .map(|a| a.as_str().to_string())
        .unwrap_or_else(|| target.to_string());

    let (parts, body) = request.into_parts();

    let mut proxy_req = Request::builder()
        .method(parts.method.clone())
        .uri(upstream_uri.clone());

    if let Some(headers) = proxy_req.headers_mut() {
        let existing_xff = parts
            .headers
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();

        for (name, value) in &parts.headers {
            if !HOP_BY_HOP_HEADERS.contains(&name.as_str()) {
                headers.insert(name.clone(), value.clone());
            }
        }

        if let Ok(v) = HeaderValue::from_str(&upstream_host) {
            headers.insert(header::HOST, v);
        }
        if let Ok(v) = HeaderValue::from_str(&client_ip.to_string()) {
            headers.insert("x-real-ip", v);
        }
        if let Ok(v) = HeaderValue::from_str(original_host) {
            headers.insert("x-forwarded-host", v);
        }
        if let Ok(v) = HeaderValue::from_str(&append_forwarded_for(&existing_xff, peer.ip())) {
            headers.insert("x-forwarded-for", v);
        }
    }

    let proxy_request = match proxy_req.body(body) {
        Ok(req) => req,
        Err(err) => {
            error!("failed to build upstream request for {original_host}: {err}");
            return (StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error").into_response();
        }
    };

    match state.http_client.request(proxy_request).await {
        Ok(upstream_response) => {
            let (parts, incoming) = upstream_response.into_parts();
            Response::from_parts(parts, Body::new(incoming))
        }
        Err(err) => {
            error!(
                host = %original_host, target = %target,
                remote_addr = %peer, client_ip = %client_ip,
                "upstream request failed: {err}"
            );
            (StatusCode::BAD_GATEWAY, "Bad Gateway").into_response()
        }
    }
}
