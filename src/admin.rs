//! Operator surface
//!
//! Private-bound HTTP API consumed by the admin panel and the bot webhook:
//! routing mutations, reputation mutations, the composed stats snapshot and
//! a WebSocket log stream. Browser-facing mutations answer with redirects,
//! API-style mutations with bare status codes.
//!
//! Authentication is HTTP Basic against `ADMIN_USER`/`ADMIN_PASS`; the bot
//! webhook is mounted outside the auth layer because its transport carries
//! its own authentication and hands us pre-trusted input.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    http::{header, HeaderMap, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Json, Redirect, Response},
    routing::{get, post},
    Form, Router,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use serde::Deserialize;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::logbus::{LogBus, DEFAULT_SUBSCRIBER_CAPACITY};
use crate::notify::{Notifier, EVENT_MANUAL_BAN, EVENT_MANUAL_REMOVE, EVENT_MANUAL_UNBAN};
use crate::reputation::ReputationStore;
use crate::rules::RuleStore;
use crate::stats::Stats;

/// Shared state of the operator surface.
#[derive(Clone)]
pub struct AdminState {
    pub rules: Arc<RuleStore>,
    pub reputation: Arc<ReputationStore>,
    pub stats: Arc<Stats>,
    pub logs: Arc<LogBus>,
    pub notifier: Arc<dyn Notifier>,
    /// `ADMIN_USER` / `ADMIN_PASS`; `None` disables authentication (tests,
    /// setups fronted by their own auth).
    pub credentials: Option<(String, String)>,
}

#[derive(Deserialize)]
struct IpForm {
    ip: String,
}

#[derive(Deserialize)]
struct AddRuleForm {
    host: String,
    target: String,
}

#[derive(Deserialize)]
struct HostForm {
    host: String,
}

#[derive(Deserialize)]
struct RuleMaintenanceForm {
    host: String,
    maintenance: Option<String>,
}

#[derive(Deserialize)]
struct MaintenanceForm {
    maintenance: Option<String>,
}

/// Validate and apply a ban arriving from the bot callback. The transport
/// has already authenticated the caller; only the IP syntax is ours to
/// check.
pub fn apply_ban_from_callback(
    reputation: &ReputationStore,
    notifier: &dyn Notifier,
    ip: &str,
) -> Result<bool, ()> {
    let parsed: IpAddr = ip.trim().parse().map_err(|_| ())?;
    let normalized = parsed.to_string();
    let changed = reputation.ban(&normalized);
    if changed {
        notifier.notify(
            EVENT_MANUAL_BAN,
            "",
            &format!("IP {normalized} banned via bot callback"),
            None,
        );
    }
    Ok(changed)
}

fn parse_operator_ip(raw: &str) -> Option<String> {
    raw.trim().parse::<IpAddr>().ok().map(|ip| ip.to_string())
}

fn checkbox_on(value: &Option<String>) -> bool {
    matches!(value.as_deref(), Some("on") | Some("true") | Some("1"))
}

async fn ban_ip(State(state): State<AdminState>, Form(form): Form<IpForm>) -> Response {
    let Some(ip) = parse_operator_ip(&form.ip) else {
        return (StatusCode::BAD_REQUEST, "invalid ip").into_response();
    };
    if state.reputation.ban(&ip) {
        info!(ip = %ip, "operator banned ip");
        state
            .notifier
            .notify(EVENT_MANUAL_BAN, "", &format!("IP {ip} banned"), None);
    }
    StatusCode::NO_CONTENT.into_response()
}

async fn unban_ip(State(state): State<AdminState>, Form(form): Form<IpForm>) -> Response {
    let Some(ip) = parse_operator_ip(&form.ip) else {
        return (StatusCode::BAD_REQUEST, "invalid ip").into_response();
    };
    if state.reputation.unban(&ip) {
        info!(ip = %ip, "operator unbanned ip");
        state
            .notifier
            .notify(EVENT_MANUAL_UNBAN, "", &format!("IP {ip} unbanned"), None);
    }
    StatusCode::NO_CONTENT.into_response()
}

async fn remove_ip(State(state): State<AdminState>, Form(form): Form<IpForm>) -> Response {
    let Some(ip) = parse_operator_ip(&form.ip) else {
        return (StatusCode::BAD_REQUEST, "invalid ip").into_response();
    };
    // A banned record must be unbanned first; silent deletion would drop
    // the ban with it.
    if state.reputation.is_banned(&ip) {
        return (StatusCode::BAD_REQUEST, "ip is banned; unban first").into_response();
    }
    if state.reputation.remove(&ip) {
        info!(ip = %ip, "operator removed ip record");
        state.notifier.notify(
            EVENT_MANUAL_REMOVE,
            "",
            &format!("IP {ip} record removed"),
            None,
        );
    }
    StatusCode::NO_CONTENT.into_response()
}

async fn add_rule(State(state): State<AdminState>, Form(form): Form<AddRuleForm>) -> Redirect {
    state.rules.add(form.host.trim(), form.target.trim());
    info!(host = %form.host, target = %form.target, "operator added routing rule");
    Redirect::to("/")
}

async fn remove_rule(State(state): State<AdminState>, Form(form): Form<HostForm>) -> Redirect {
    state.rules.remove(form.host.trim());
    info!(host = %form.host, "operator removed routing rule");
    Redirect::to("/")
}

async fn set_rule_maintenance(
    State(state): State<AdminState>,
    Form(form): Form<RuleMaintenanceForm>,
) -> Redirect {
    let enabled = checkbox_on(&form.maintenance);
    if !state.rules.set_rule_maintenance(form.host.trim(), enabled) {
        warn!(host = %form.host, "maintenance toggle for unknown rule ignored");
    } else {
        info!(host = %form.host, enabled, "operator toggled rule maintenance");
    }
    Redirect::to("/")
}

async fn set_maintenance_mode(
    State(state): State<AdminState>,
    Form(form): Form<MaintenanceForm>,
) -> Redirect {
    let enabled = checkbox_on(&form.maintenance);
    state.rules.set_maintenance_mode(enabled);
    info!(enabled, "operator toggled global maintenance");
    Redirect::to("/")
}

async fn list_rules(State(state): State<AdminState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "maintenanceMode": state.rules.maintenance_mode(),
        "rules": state.rules.all(),
    }))
}

async fn stats_data(State(state): State<AdminState>) -> Json<serde_json::Value> {
    Json(state.stats.snapshot(&state.reputation))
}

async fn bot_webhook(State(state): State<AdminState>, Form(form): Form<IpForm>) -> Response {
    match apply_ban_from_callback(state.reputation.as_ref(), state.notifier.as_ref(), &form.ip) {
        Ok(_) => StatusCode::NO_CONTENT.into_response(),
        Err(()) => (StatusCode::BAD_REQUEST, "invalid ip").into_response(),
    }
}

async fn logs_ws(State(state): State<AdminState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| stream_logs(socket, state.logs))
}

async fn stream_logs(mut socket: WebSocket, bus: Arc<LogBus>) {
    let mut sub = bus.subscribe(DEFAULT_SUBSCRIBER_CAPACITY);
    loop {
        tokio::select! {
            record = sub.rx.recv() => {
                let Some(record) = record else { break };
                let line = String::from_utf8_lossy(&record).into_owned();
                if socket.send(Message::Text(line)).await.is_err() {
                    break;
                }
            }
            incoming = socket.recv() => {
                // Clients only ever close or ping; any error ends the stream.
                match incoming {
                    Some(Ok(_)) => {}
                    _ => break,
                }
            }
        }
    }
    bus.unsubscribe(sub.id);
}

fn basic_auth_ok(headers: &HeaderMap, user: &str, pass: &str) -> bool {
    let Some(value) = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
    else {
        return false;
    };
    let Some(encoded) = value.strip_prefix("Basic ") else {
        return false;
    };
    let Ok(decoded) = BASE64.decode(encoded.trim()) else {
        return false;
    };
    let Ok(decoded) = String::from_utf8(decoded) else {
        return false;
    };
    match decoded.split_once(':') {
        Some((u, p)) => u == user && p == pass,
        None => false,
    }
}

async fn auth_middleware(
    State(state): State<AdminState>,
    request: axum::extract::Request,
    next: Next,
) -> Response {
    if let Some((user, pass)) = &state.credentials {
        if !basic_auth_ok(request.headers(), user, pass) {
            return (
                StatusCode::UNAUTHORIZED,
                [(header::WWW_AUTHENTICATE, "Basic realm=\"gatehouse\"")],
                "Unauthorized",
            )
                .into_response();
        }
    }
    next.run(request).await
}

/// Build the operator router. The webhook sits outside the auth layer.
pub fn router(state: AdminState) -> Router {
    let protected = Router::new()
        .route("/ip/ban", post(ban_ip))
        .route("/ip/unban", post(unban_ip))
        .route("/ip/remove", post(remove_ip))
        .route("/rules", get(list_rules))
        .route("/rules/add", post(add_rule))
        .route("/rules/remove", post(remove_rule))
        .route("/rules/maintenance", post(set_rule_maintenance))
        .route("/maintenance", post(set_maintenance_mode))
        .route("/stats/data", get(stats_data))
        .route("/ws/logs", get(logs_ws))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth_middleware,
        ));

    Router::new()
        .route("/hooks/bot", post(bot_webhook))
        .merge(protected)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Run the operator surface on its private bind address.
pub async fn run_admin_server(addr: SocketAddr, state: AdminState) -> anyhow::Result<()> {
    let app = router(state);
    info!("operator surface listening on {addr}");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app.into_make_service()).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::NullNotifier;
    use axum::body::Body;
    use axum::http::Request;
    use tempfile::tempdir;
    use tower::ServiceExt;

    fn state(credentials: Option<(String, String)>) -> (AdminState, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let state = AdminState {
            rules: Arc::new(RuleStore::new(dir.path().join("rules.json"))),
            reputation: Arc::new(ReputationStore::new(dir.path().join("rep.json"))),
            stats: Arc::new(Stats::new()),
            logs: LogBus::new(),
            notifier: Arc::new(NullNotifier),
            credentials,
        };
        (state, dir)
    }

    fn form_post(uri: &str, body: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn send(state: &AdminState, req: Request<Body>) -> Response {
        router(state.clone()).oneshot(req).await.unwrap()
    }

    #[tokio::test]
    async fn ban_unban_round_trip() {
        let (state, _dir) = state(None);

        let resp = send(&state, form_post("/ip/ban", "ip=9.8.7.6")).await;
        assert_eq!(resp.status(), StatusCode::NO_CONTENT);
        assert!(state.reputation.is_banned("9.8.7.6"));

        let resp = send(&state, form_post("/ip/unban", "ip=9.8.7.6")).await;
        assert_eq!(resp.status(), StatusCode::NO_CONTENT);
        assert!(!state.reputation.is_banned("9.8.7.6"));
    }

    #[tokio::test]
    async fn invalid_operator_ip_is_400() {
        let (state, _dir) = state(None);
        let resp = send(&state, form_post("/ip/ban", "ip=not-an-ip")).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn remove_refused_until_unbanned() {
        let (state, _dir) = state(None);
        state.reputation.ban("9.8.7.6");

        let resp = send(&state, form_post("/ip/remove", "ip=9.8.7.6")).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert_eq!(state.reputation.list().len(), 1);

        state.reputation.unban("9.8.7.6");
        let resp = send(&state, form_post("/ip/remove", "ip=9.8.7.6")).await;
        assert_eq!(resp.status(), StatusCode::NO_CONTENT);
        assert!(state.reputation.list().is_empty());
    }

    #[tokio::test]
    async fn rule_mutations_redirect() {
        let (state, _dir) = state(None);

        let resp = send(
            &state,
            form_post("/rules/add", "host=a.test&target=127.0.0.1:9000"),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::SEE_OTHER);
        assert_eq!(
            state.rules.get("a.test"),
            Some("127.0.0.1:9000".to_string())
        );

        let resp = send(
            &state,
            form_post("/rules/maintenance", "host=a.test&maintenance=on"),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::SEE_OTHER);
        assert!(state.rules.get_rule("a.test").unwrap().maintenance);

        // Absent checkbox turns maintenance back off.
        let resp = send(&state, form_post("/rules/maintenance", "host=a.test")).await;
        assert_eq!(resp.status(), StatusCode::SEE_OTHER);
        assert!(!state.rules.get_rule("a.test").unwrap().maintenance);

        let resp = send(&state, form_post("/rules/remove", "host=a.test")).await;
        assert_eq!(resp.status(), StatusCode::SEE_OTHER);
        assert_eq!(state.rules.get("a.test"), None);
    }

    #[tokio::test]
    async fn global_maintenance_toggle() {
        let (state, _dir) = state(None);
        send(&state, form_post("/maintenance", "maintenance=on")).await;
        assert!(state.rules.maintenance_mode());
        send(&state, form_post("/maintenance", "")).await;
        assert!(!state.rules.maintenance_mode());
    }

    #[tokio::test]
    async fn stats_snapshot_shape() {
        let (state, _dir) = state(None);
        state.stats.add_request("a.test", "DE");
        state.reputation.mark_suspicious("1.2.3.4", "unknown host");

        let resp = send(
            &state,
            Request::builder()
                .uri("/stats/data")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::OK);

        let bytes = http_body_util::BodyExt::collect(resp.into_body())
            .await
            .unwrap()
            .to_bytes();
        let value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        for key in [
            "requests",
            "memory",
            "cpu",
            "disks",
            "countries",
            "ssh",
            "suspicious",
        ] {
            assert!(value.get(key).is_some(), "missing {key}");
        }
    }

    #[tokio::test]
    async fn webhook_validates_and_bans() {
        let (state, _dir) = state(None);

        let resp = send(&state, form_post("/hooks/bot", "ip=203.0.113.80")).await;
        assert_eq!(resp.status(), StatusCode::NO_CONTENT);
        assert!(state.reputation.is_banned("203.0.113.80"));

        let resp = send(&state, form_post("/hooks/bot", "ip=***")).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn basic_auth_guards_protected_routes_only() {
        let (state, _dir) = state(Some(("admin".to_string(), "secret".to_string())));

        let resp = send(&state, form_post("/ip/ban", "ip=9.8.7.6")).await;
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

        let authorized = Request::builder()
            .method("POST")
            .uri("/ip/ban")
            .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
            .header(
                header::AUTHORIZATION,
                format!("Basic {}", BASE64.encode("admin:secret")),
            )
            .body(Body::from("ip=9.8.7.6"))
            .unwrap();
        let resp = send(&state, authorized).await;
        assert_eq!(resp.status(), StatusCode::NO_CONTENT);

        // The webhook authenticates at the transport, not here.
        let resp = send(&state, form_post("/hooks/bot", "ip=203.0.113.80")).await;
        assert_eq!(resp.status(), StatusCode::NO_CONTENT);
    }
}
