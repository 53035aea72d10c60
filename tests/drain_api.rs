//! Drain controller against a local stand-in for the tunnel status API
//!
//! An axum server scripted with a sequence of responses plays the control
//! plane, so the real reqwest transport is exercised end-to-end.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::routing::get;
use axum::Router;
use serde_json::json;

use outpost::drain::{
    CloudflareTunnelApi, DrainConfig, DrainError, DrainPhase, DrainReason, DrainStrategy,
    TunnelDrainer, TunnelHealth,
};
use outpost::tunnel::{TunnelRecord, TunnelSecret};

const TOKEN: &str = "test-api-token";

#[derive(Clone, Debug)]
struct SeenRequest {
    account: String,
    tunnel: String,
    authorization: Option<String>,
    content_type: Option<String>,
}

#[derive(Default)]
struct ScriptedApi {
    responses: Mutex<VecDeque<(StatusCode, String)>>,
    seen: Mutex<Vec<SeenRequest>>,
}

impl ScriptedApi {
    fn requests(&self) -> Vec<SeenRequest> {
        self.seen.lock().unwrap().clone()
    }
}

async fn tunnel_status(
    State(api): State<Arc<ScriptedApi>>,
    Path((account, tunnel)): Path<(String, String)>,
    headers: HeaderMap,
) -> (StatusCode, String) {
    let header_value = |name| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    };
    api.seen.lock().unwrap().push(SeenRequest {
        account,
        tunnel,
        authorization: header_value(header::AUTHORIZATION),
        content_type: header_value(header::CONTENT_TYPE),
    });
    api.responses
        .lock()
        .unwrap()
        .pop_front()
        .unwrap_or((StatusCode::INTERNAL_SERVER_ERROR, "script exhausted".to_string()))
}

async fn serve(script: Vec<(StatusCode, String)>) -> (CloudflareTunnelApi, Arc<ScriptedApi>) {
    let api = Arc::new(ScriptedApi {
        responses: Mutex::new(script.into()),
        ..Default::default()
    });
    let app = Router::new()
        .route(
            "/client/v4/accounts/:account/cfd_tunnel/:tunnel",
            get(tunnel_status),
        )
        .with_state(api.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    let client = reqwest::Client::builder().no_proxy().build().unwrap();
    let base = format!("http://{}/client/v4", addr);
    (CloudflareTunnelApi::with_client(client, base), api)
}

fn status(s: &str) -> (StatusCode, String) {
    let body = json!({
        "success": true,
        "errors": [],
        "result": { "id": "tun-1", "name": "main", "status": s, "connections": [] }
    });
    (StatusCode::OK, body.to_string())
}

fn connections(n: usize) -> (StatusCode, String) {
    let conns: Vec<_> = (0..n)
        .map(|i| json!({ "colo_name": "ams01", "id": format!("conn-{}", i) }))
        .collect();
    let body = json!({ "success": true, "result": { "id": "tun-1", "connections": conns } });
    (StatusCode::OK, body.to_string())
}

fn fast(strategy: DrainStrategy) -> DrainConfig {
    DrainConfig {
        interval: Duration::from_millis(10),
        strategy,
        max_attempts: None,
    }
}

fn record() -> TunnelRecord {
    TunnelRecord::new("acct-1", "tun-1", TunnelSecret::generate())
}

// =============================================================================
// Story Tests: Teardown Gate
// =============================================================================

#[tokio::test]
async fn story_release_waits_for_inactive_status() {
    let (api, server) = serve(vec![
        status("healthy"),
        status("degraded"),
        status("inactive"),
    ])
    .await;
    let drainer = TunnelDrainer::new(api, fast(DrainStrategy::Status));

    let mut lease = drainer.acquire(&record(), TOKEN);
    assert_eq!(lease.id(), "drainer-tun-1");
    // Acquire does no I/O
    assert!(server.requests().is_empty());

    let report = drainer.release(&mut lease).await.unwrap();
    assert_eq!(report.polls, 3);
    assert_eq!(report.reason, DrainReason::Status(TunnelHealth::Inactive));
    assert_eq!(lease.phase(), DrainPhase::Drained);

    let requests = server.requests();
    assert_eq!(requests.len(), 3);
    for request in &requests {
        assert_eq!(request.account, "acct-1");
        assert_eq!(request.tunnel, "tun-1");
        assert_eq!(request.authorization.as_deref(), Some("Bearer test-api-token"));
        assert_eq!(request.content_type.as_deref(), Some("application/json"));
    }
}

#[tokio::test]
async fn story_deleted_tunnel_counts_as_drained() {
    let (api, server) = serve(vec![(StatusCode::NOT_FOUND, "{}".to_string())]).await;
    let drainer = TunnelDrainer::new(api, fast(DrainStrategy::Status));

    let mut lease = drainer.acquire(&record(), TOKEN);
    let report = drainer.release(&mut lease).await.unwrap();

    assert_eq!(report.polls, 1);
    assert_eq!(report.reason, DrainReason::NotFound);
    assert_eq!(server.requests().len(), 1);
}

#[tokio::test]
async fn story_server_errors_are_retried() {
    let (api, server) = serve(vec![
        (StatusCode::INTERNAL_SERVER_ERROR, "oops".to_string()),
        (StatusCode::TOO_MANY_REQUESTS, "slow down".to_string()),
        (StatusCode::UNAUTHORIZED, "{}".to_string()),
        status("down"),
    ])
    .await;
    let drainer = TunnelDrainer::new(api, fast(DrainStrategy::Status));

    let mut lease = drainer.acquire(&record(), TOKEN);
    let report = drainer.release(&mut lease).await.unwrap();

    assert_eq!(report.polls, 4);
    assert_eq!(report.reason, DrainReason::Status(TunnelHealth::Down));
    assert_eq!(server.requests().len(), 4);
}

#[tokio::test]
async fn story_connection_count_waits_for_empty_list() {
    let (api, _server) = serve(vec![connections(2), connections(1), connections(0)]).await;
    let drainer = TunnelDrainer::new(api, fast(DrainStrategy::ConnectionCount));

    let mut lease = drainer.acquire(&record(), TOKEN);
    let report = drainer.release(&mut lease).await.unwrap();

    assert_eq!(report.polls, 3);
    assert_eq!(report.reason, DrainReason::NoConnections);
}

// =============================================================================
// Protocol Errors
// =============================================================================

#[tokio::test]
async fn non_json_success_body_is_a_protocol_error() {
    let (api, server) = serve(vec![(StatusCode::OK, "<html>gateway</html>".to_string())]).await;
    let drainer = TunnelDrainer::new(api, fast(DrainStrategy::Status));

    let mut lease = drainer.acquire(&record(), TOKEN);
    let result = drainer.release(&mut lease).await;

    assert!(matches!(result, Err(DrainError::Protocol(_))));
    assert_eq!(server.requests().len(), 1);
}

#[tokio::test]
async fn missing_connections_field_is_a_protocol_error() {
    let body = json!({ "success": true, "result": { "id": "tun-1" } }).to_string();
    let (api, server) = serve(vec![(StatusCode::OK, body)]).await;
    let drainer = TunnelDrainer::new(api, fast(DrainStrategy::ConnectionCount));

    let mut lease = drainer.acquire(&record(), TOKEN);
    let result = drainer.release(&mut lease).await;

    assert!(matches!(result, Err(DrainError::Protocol(msg)) if msg.contains("connections")));
    assert_eq!(server.requests().len(), 1);
}

#[tokio::test]
async fn attempt_ceiling_reports_last_error() {
    let (api, server) = serve(vec![]).await;
    let config = DrainConfig {
        max_attempts: Some(3),
        ..fast(DrainStrategy::Status)
    };
    let drainer = TunnelDrainer::new(api, config);

    let mut lease = drainer.acquire(&record(), TOKEN);
    match drainer.release(&mut lease).await {
        Err(DrainError::AttemptsExhausted { attempts, last, .. }) => {
            assert_eq!(attempts, 3);
            assert!(last.contains("500"), "{}", last);
        }
        other => panic!("Expected AttemptsExhausted, got {:?}", other),
    }
    assert_eq!(server.requests().len(), 3);
}
