//! HTTP surface for status, actuation, long-poll updates, and metrics
//!
//! Uses hyper for the HTTP server. Actuation endpoints never touch the doors
//! directly; they enqueue commands for the controller task, so the single-
//! writer discipline holds no matter how many requests arrive at once.

use crate::domain::types::{epoch_ms, DoorState};
use crate::infra::config::Config;
use crate::infra::metrics::Metrics;
use crate::services::broker::UpdateBroker;
use crate::services::controller::{ControlCmd, DoorTarget};
use crate::services::door::Registry;
use bytes::Bytes;
use http_body_util::Full;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use parking_lot::RwLock;
use serde_json::json;
use std::collections::HashMap;
use std::convert::Infallible;
use std::fmt::Write;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};

/// Shared state handed to every request handler
pub struct HttpState {
    registry: Arc<RwLock<Registry>>,
    broker: Arc<UpdateBroker>,
    cmd_tx: mpsc::Sender<ControlCmd>,
    metrics: Arc<Metrics>,
    config: Config,
}

impl HttpState {
    pub fn new(
        registry: Arc<RwLock<Registry>>,
        broker: Arc<UpdateBroker>,
        cmd_tx: mpsc::Sender<ControlCmd>,
        metrics: Arc<Metrics>,
        config: Config,
    ) -> Self {
        Self { registry, broker, cmd_tx, metrics, config }
    }
}

/// Split a raw query string into key/value pairs. Values are taken verbatim;
/// door ids and cursors never need percent-decoding.
fn query_params(query: Option<&str>) -> HashMap<String, String> {
    let mut params = HashMap::new();
    let Some(query) = query else {
        return params;
    };
    for pair in query.split('&') {
        match pair.split_once('=') {
            Some((key, value)) if !key.is_empty() => {
                params.insert(key.to_string(), value.to_string());
            }
            _ => {}
        }
    }
    params
}

fn text_response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header("Content-Type", "text/plain; charset=utf-8")
        .body(Full::new(body.into()))
        .expect("static response should not fail")
}

fn json_response(body: String, jsonp: bool) -> Response<Full<Bytes>> {
    let content_type = if jsonp { "application/javascript" } else { "application/json" };
    Response::builder()
        .status(StatusCode::OK)
        .header("Content-Type", content_type)
        .body(Full::new(Bytes::from(body)))
        .expect("static response should not fail")
}

/// `GET /st?id=<door>` — bare state string, empty for an unknown id
fn handle_state(params: &HashMap<String, String>, state: &HttpState) -> Response<Full<Bytes>> {
    let body = params
        .get("id")
        .and_then(|id| state.registry.read().door(id).map(|d| d.last_state.as_str()))
        .unwrap_or("");
    text_response(StatusCode::OK, body)
}

/// `GET /clk?id=<door>` — enqueue a toggle for the controller
async fn handle_click(
    params: &HashMap<String, String>,
    state: &HttpState,
) -> Response<Full<Bytes>> {
    let Some(id) = params.get("id") else {
        return text_response(StatusCode::BAD_REQUEST, "Error: Missing id");
    };
    enqueue(state, ControlCmd::Toggle(DoorTarget::Door(id.clone()))).await
}

async fn enqueue(state: &HttpState, cmd: ControlCmd) -> Response<Full<Bytes>> {
    match state.cmd_tx.send(cmd).await {
        Ok(()) => text_response(StatusCode::OK, "OK"),
        Err(e) => {
            error!(error = %e, "command_channel_closed");
            text_response(StatusCode::INTERNAL_SERVER_ERROR, "Error: Internal")
        }
    }
}

/// `GET /cfg` — door inventory with current states
fn handle_config(state: &HttpState) -> Response<Full<Bytes>> {
    let rows: Vec<_> = {
        let registry = state.registry.read();
        registry
            .doors()
            .iter()
            .map(|d| json!([d.id, d.name, d.last_state, d.last_state_time]))
            .collect()
    };
    json_response(json!(rows).to_string(), false)
}

/// `GET /upd?lastupdate=<ms>&callback=<name>` — long-poll for transitions
async fn handle_updates(
    params: &HashMap<String, String>,
    state: Arc<HttpState>,
) -> Response<Full<Bytes>> {
    let cursor = params.get("lastupdate").and_then(|v| v.parse::<u64>().ok()).unwrap_or(0);
    let callback = params.get("callback").cloned();
    let jsonp = callback.is_some();

    let snapshot = state.registry.read().snapshot();
    let updates = UpdateBroker::updates_since(&snapshot, cursor);
    if !updates.is_empty() {
        state.metrics.record_immediate_update();
        return json_response(
            UpdateBroker::envelope(&updates, callback.as_deref(), epoch_ms()),
            jsonp,
        );
    }

    let parked = state.broker.park(cursor, callback.clone());

    // A tick may have landed between the check above and the park; answer from
    // a fresh snapshot so that transition is not missed.
    let snapshot = state.registry.read().snapshot();
    let updates = UpdateBroker::updates_since(&snapshot, cursor);
    if !updates.is_empty() {
        state.metrics.record_immediate_update();
        return json_response(
            UpdateBroker::envelope(&updates, callback.as_deref(), epoch_ms()),
            jsonp,
        );
    }

    match parked.wait().await {
        Some(body) => json_response(body, jsonp),
        None => text_response(StatusCode::INTERNAL_SERVER_ERROR, "Error: Internal"),
    }
}

/// `GET /api?key=..&command=..&id=..` — keyed remote control
async fn handle_api(
    params: &HashMap<String, String>,
    state: &HttpState,
) -> Response<Full<Bytes>> {
    if !state.config.api_enabled() {
        return text_response(StatusCode::NOT_FOUND, "Not Found");
    }
    if params.get("key").map(String::as_str) != state.config.api_key() {
        warn!("api_key_rejected");
        return text_response(StatusCode::FORBIDDEN, "Error: API error");
    }

    let target = match params.get("id").map(String::as_str) {
        None => return text_response(StatusCode::BAD_REQUEST, "Error: Missing id"),
        Some("all") => DoorTarget::All,
        Some(id) => DoorTarget::Door(id.to_string()),
    };
    let cmd = match params.get("command").map(String::as_str) {
        Some("toggle") => ControlCmd::Toggle(target),
        Some("open") => ControlCmd::Open(target),
        Some("close") => ControlCmd::Close(target),
        _ => return text_response(StatusCode::BAD_REQUEST, "Error: Command not implemented"),
    };
    enqueue(state, cmd).await
}

/// Prometheus metric type
enum MetricType {
    Counter,
    Gauge,
}

impl MetricType {
    fn as_str(&self) -> &'static str {
        match self {
            MetricType::Counter => "counter",
            MetricType::Gauge => "gauge",
        }
    }
}

/// Write a simple metric (counter or gauge) with site label
fn write_metric(
    output: &mut String,
    name: &str,
    help: &str,
    typ: MetricType,
    site: &str,
    val: u64,
) {
    let _ = writeln!(output, "# HELP {name} {help}");
    let _ = writeln!(output, "# TYPE {name} {}", typ.as_str());
    let _ = writeln!(output, "{name}{{site=\"{site}\"}} {val}");
}

fn state_code(state: DoorState) -> u64 {
    match state {
        DoorState::Unknown => 0,
        DoorState::Open => 1,
        DoorState::Closed => 2,
        DoorState::Opening => 3,
        DoorState::Closing => 4,
    }
}

/// Format metrics in Prometheus text exposition format
fn format_prometheus_metrics(state: &HttpState) -> String {
    let summary = state.metrics.report();
    let site = state.config.site_id();
    let mut output = String::with_capacity(4096);

    write_metric(
        &mut output,
        "doorwatch_ticks_total",
        "Controller polling ticks completed",
        MetricType::Counter,
        site,
        summary.ticks_total,
    );
    write_metric(
        &mut output,
        "doorwatch_transitions_total",
        "Door state transitions observed",
        MetricType::Counter,
        site,
        summary.transitions_total,
    );
    write_metric(
        &mut output,
        "doorwatch_toggles_total",
        "Relay toggle pulses issued",
        MetricType::Counter,
        site,
        summary.toggles_total,
    );
    write_metric(
        &mut output,
        "doorwatch_alerts_total",
        "Alerts dispatched",
        MetricType::Counter,
        site,
        summary.alerts_total,
    );
    write_metric(
        &mut output,
        "doorwatch_alert_failures_total",
        "Per-channel alert send failures",
        MetricType::Counter,
        site,
        summary.alert_failures_total,
    );
    write_metric(
        &mut output,
        "doorwatch_updates_immediate_total",
        "Long-poll requests answered immediately",
        MetricType::Counter,
        site,
        summary.updates_immediate_total,
    );
    write_metric(
        &mut output,
        "doorwatch_updates_resolved_total",
        "Long-poll waiters resolved by a transition",
        MetricType::Counter,
        site,
        summary.updates_resolved_total,
    );
    write_metric(
        &mut output,
        "doorwatch_updates_cancelled_total",
        "Long-poll waiters removed on disconnect",
        MetricType::Counter,
        site,
        summary.updates_cancelled_total,
    );
    write_metric(
        &mut output,
        "doorwatch_waiters_parked",
        "Currently parked long-poll waiters",
        MetricType::Gauge,
        site,
        summary.waiters_parked,
    );
    write_metric(
        &mut output,
        "doorwatch_close_unconfirmed_total",
        "Commanded closes that timed out unconfirmed",
        MetricType::Counter,
        site,
        summary.close_unconfirmed_total,
    );

    let _ = writeln!(
        output,
        "# HELP doorwatch_door_state Current door state (0=unknown, 1=open, 2=closed, 3=opening, 4=closing)"
    );
    let _ = writeln!(output, "# TYPE doorwatch_door_state gauge");
    for update in state.registry.read().snapshot() {
        let _ = writeln!(
            output,
            "doorwatch_door_state{{site=\"{site}\",door=\"{}\"}} {}",
            update.id,
            state_code(update.state)
        );
    }

    output
}

async fn route(
    method: &Method,
    path: &str,
    query: Option<&str>,
    state: Arc<HttpState>,
) -> Response<Full<Bytes>> {
    if method != Method::GET {
        return text_response(StatusCode::METHOD_NOT_ALLOWED, "Method Not Allowed");
    }
    let params = query_params(query);
    match path {
        "/st" => handle_state(&params, &state),
        "/clk" => handle_click(&params, &state).await,
        "/cfg" => handle_config(&state),
        "/upd" => handle_updates(&params, state).await,
        "/api" => handle_api(&params, &state).await,
        "/health" => text_response(StatusCode::OK, "ok"),
        "/metrics" => Response::builder()
            .status(StatusCode::OK)
            .header("Content-Type", "text/plain; version=0.0.4; charset=utf-8")
            .body(Full::new(Bytes::from(format_prometheus_metrics(&state))))
            .expect("static response should not fail"),
        _ => text_response(StatusCode::NOT_FOUND, "Not Found"),
    }
}

/// Handle HTTP requests
async fn handle_request(
    req: Request<hyper::body::Incoming>,
    state: Arc<HttpState>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let query = req.uri().query().map(str::to_string);
    Ok(route(&method, &path, query.as_deref(), state).await)
}

/// Start the HTTP server on the configured port
pub async fn start_http_server(
    state: Arc<HttpState>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let port = state.config.http_port();
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await?;

    info!(port = %port, site = %state.config.site_id(), "http_server_started");

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, _addr)) => {
                        let io = TokioIo::new(stream);
                        let state = state.clone();

                        tokio::spawn(async move {
                            let service = service_fn(move |req| {
                                let state = state.clone();
                                async move { handle_request(req, state).await }
                            });

                            if let Err(e) = http1::Builder::new()
                                .serve_connection(io, service)
                                .await
                            {
                                error!(error = %e, "http_connection_error");
                            }
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "http_accept_error");
                    }
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("http_server_shutdown");
                    return Ok(());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;

    fn test_state(config: Config) -> (Arc<HttpState>, mpsc::Receiver<ControlCmd>) {
        let metrics = Arc::new(Metrics::new());
        let registry = Arc::new(RwLock::new(Registry::from_config(&config, 1_000)));
        let broker = Arc::new(UpdateBroker::new(metrics.clone()));
        let (cmd_tx, cmd_rx) = mpsc::channel(8);
        (Arc::new(HttpState::new(registry, broker, cmd_tx, metrics, config)), cmd_rx)
    }

    async fn get(state: &Arc<HttpState>, path: &str, query: Option<&str>) -> (StatusCode, String) {
        let response = route(&Method::GET, path, query, state.clone()).await;
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        (status, String::from_utf8(bytes.to_vec()).unwrap())
    }

    #[test]
    fn test_query_params() {
        let params = query_params(Some("id=left&lastupdate=1000&callback=cb"));
        assert_eq!(params.get("id").unwrap(), "left");
        assert_eq!(params.get("lastupdate").unwrap(), "1000");
        assert_eq!(params.get("callback").unwrap(), "cb");

        assert!(query_params(None).is_empty());
        assert!(query_params(Some("")).is_empty());
        // Valueless and keyless fragments are dropped
        assert!(query_params(Some("flag&=x")).is_empty());
    }

    #[tokio::test]
    async fn test_state_endpoint() {
        let (state, _rx) = test_state(Config::default());
        state.registry.write().door_mut("left").unwrap().last_state = DoorState::Open;

        let (status, body) = get(&state, "/st", Some("id=left")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "open");

        // Unknown door and missing id both answer with an empty body
        let (status, body) = get(&state, "/st", Some("id=attic")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "");
        let (_, body) = get(&state, "/st", None).await;
        assert_eq!(body, "");
    }

    #[tokio::test]
    async fn test_click_enqueues_toggle() {
        let (state, mut rx) = test_state(Config::default());

        let (status, body) = get(&state, "/clk", Some("id=left")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "OK");
        assert_eq!(
            rx.recv().await.unwrap(),
            ControlCmd::Toggle(DoorTarget::Door("left".to_string()))
        );
    }

    #[tokio::test]
    async fn test_click_requires_id() {
        let (state, _rx) = test_state(Config::default());
        let (status, body) = get(&state, "/clk", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body, "Error: Missing id");
    }

    #[tokio::test]
    async fn test_config_endpoint() {
        let (state, _rx) = test_state(Config::default());
        {
            let mut registry = state.registry.write();
            let door = registry.door_mut("left").unwrap();
            door.last_state = DoorState::Closed;
            door.last_state_time = 42;
        }

        let (status, body) = get(&state, "/cfg", None).await;
        assert_eq!(status, StatusCode::OK);
        let parsed: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(parsed.as_array().unwrap().len(), 2);
        assert_eq!(parsed[0][0], "left");
        assert_eq!(parsed[0][1], "Left");
        assert_eq!(parsed[0][2], "closed");
        assert_eq!(parsed[0][3], 42);
    }

    #[tokio::test]
    async fn test_updates_immediate_when_cursor_satisfied() {
        let (state, _rx) = test_state(Config::default());
        {
            let mut registry = state.registry.write();
            let door = registry.door_mut("left").unwrap();
            door.last_state = DoorState::Open;
            door.last_state_time = 5_000;
        }

        let (status, body) = get(&state, "/upd", Some("lastupdate=5000")).await;
        assert_eq!(status, StatusCode::OK);
        let parsed: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(parsed["update"][0][0], "left");
        assert_eq!(state.metrics.report().updates_immediate_total, 1);
    }

    #[tokio::test]
    async fn test_updates_park_until_notify() {
        let (state, _rx) = test_state(Config::default());

        let poll_state = state.clone();
        let request =
            tokio::spawn(async move { get(&poll_state, "/upd", Some("lastupdate=0")).await });

        // Let the request park before publishing the transition
        while state.broker.pending_count() == 0 {
            tokio::task::yield_now().await;
        }

        {
            let mut registry = state.registry.write();
            let door = registry.door_mut("right").unwrap();
            door.last_state = DoorState::Closed;
            door.last_state_time = 7_000;
        }
        let snapshot = state.registry.read().snapshot();
        state.broker.notify(&snapshot, 7_000);

        let (status, body) = request.await.unwrap();
        assert_eq!(status, StatusCode::OK);
        let parsed: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(parsed["update"][0][0], "right");
        assert_eq!(parsed["update"][0][1], "closed");
    }

    #[tokio::test]
    async fn test_updates_jsonp_callback() {
        let (state, _rx) = test_state(Config::default());
        {
            let mut registry = state.registry.write();
            let door = registry.door_mut("left").unwrap();
            door.last_state = DoorState::Open;
            door.last_state_time = 5_000;
        }

        let (_, body) = get(&state, "/upd", Some("lastupdate=0&callback=render")).await;
        assert!(body.starts_with("render({"));
        assert!(body.ends_with(")"));
    }

    #[tokio::test]
    async fn test_api_disabled_is_not_found() {
        let (state, _rx) = test_state(Config::default());
        let (status, _) = get(&state, "/api", Some("key=x&command=toggle&id=all")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_api_rejects_bad_key() {
        let (state, _rx) = test_state(Config::default().with_api_key("s3cret"));
        let (status, body) = get(&state, "/api", Some("key=wrong&command=toggle&id=all")).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body, "Error: API error");
    }

    #[tokio::test]
    async fn test_api_commands() {
        let (state, mut rx) = test_state(Config::default().with_api_key("s3cret"));

        let (status, body) = get(&state, "/api", Some("key=s3cret&command=open&id=all")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "OK");
        assert_eq!(rx.recv().await.unwrap(), ControlCmd::Open(DoorTarget::All));

        let (status, _) = get(&state, "/api", Some("key=s3cret&command=close&id=left")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            rx.recv().await.unwrap(),
            ControlCmd::Close(DoorTarget::Door("left".to_string()))
        );
    }

    #[tokio::test]
    async fn test_api_unknown_command() {
        let (state, _rx) = test_state(Config::default().with_api_key("s3cret"));
        let (status, body) = get(&state, "/api", Some("key=s3cret&command=vent&id=all")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body, "Error: Command not implemented");
    }

    #[tokio::test]
    async fn test_metrics_endpoint() {
        let (state, _rx) = test_state(Config::default());
        state.metrics.record_tick();

        let (status, body) = get(&state, "/metrics", None).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.contains("doorwatch_ticks_total{site=\"garage\"} 1"));
        assert!(body.contains("doorwatch_door_state{site=\"garage\",door=\"left\"} 0"));
    }

    #[tokio::test]
    async fn test_health_and_not_found() {
        let (state, _rx) = test_state(Config::default());
        let (status, body) = get(&state, "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "ok");

        let (status, _) = get(&state, "/nope", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
