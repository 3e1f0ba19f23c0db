//! Fake control server
//!
//! Serves one desired state per host group with ETag/304 semantics, rejects
//! unknown API keys with 401 and records every request and PATCH.

use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, patch};
use axum::{Json, Router};
use meshagent_common::crypto::fingerprint;
use meshagent_common::Host;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{info, warn};

use crate::error::{E2eError, E2eResult};

/// One GET as seen by the server
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedRequest {
    pub host_id: String,
    pub api_key: Option<String>,
    pub if_none_match: Option<String>,
    pub user_agent: Option<String>,
    pub status: u16,
}

#[derive(Debug, Default)]
struct ServerState {
    body: Vec<u8>,
    etag: String,
    api_keys: HashSet<String>,
    forced_status: Option<StatusCode>,
    requests: Vec<RecordedRequest>,
    patches: Vec<Host>,
}

type Shared = Arc<Mutex<ServerState>>;

/// Handle to a running fake control server
pub struct FakeControlServer {
    state: Shared,
    base_url: String,
    task: JoinHandle<()>,
}

impl FakeControlServer {
    /// Start on an ephemeral localhost port and wait until it answers
    pub async fn start() -> E2eResult<Self> {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .map_err(|e| E2eError::ServerStartup(e.to_string()))?;
        let addr = listener.local_addr()?;
        let base_url = format!("http://{}", addr);

        let state = Shared::default();
        let router = router(state.clone());
        let task = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, router).await {
                warn!("Fake control server stopped: {}", e);
            }
        });

        let server = Self {
            state,
            base_url,
            task,
        };
        server.wait_for_healthy(Duration::from_secs(5)).await?;
        info!("Fake control server at {}", server.base_url);
        Ok(server)
    }

    async fn wait_for_healthy(&self, timeout: Duration) -> E2eResult<()> {
        let health_url = format!("{}/health", self.base_url);
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(2))
            .build()?;

        let start = std::time::Instant::now();
        let mut attempts = 0;
        while start.elapsed() < timeout {
            attempts += 1;
            match client.get(&health_url).send().await {
                Ok(resp) if resp.status().is_success() => return Ok(()),
                Ok(resp) => warn!("Health check returned {}", resp.status()),
                Err(e) if !e.is_connect() => warn!("Health check error: {}", e),
                Err(_) => {}
            }
            sleep(Duration::from_millis(50)).await;
        }
        Err(E2eError::ServerHealthCheck(attempts))
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Publish a new desired state body; the ETag follows its content
    pub fn set_state(&self, body: &[u8]) {
        let mut state = self.state.lock();
        state.body = body.to_vec();
        state.etag = format!("\"{}\"", fingerprint(body));
    }

    /// Current ETag
    pub fn etag(&self) -> String {
        self.state.lock().etag.clone()
    }

    /// Replace the set of accepted API keys
    pub fn accept_keys(&self, keys: &[&str]) {
        self.state.lock().api_keys = keys.iter().map(|k| k.to_string()).collect();
    }

    /// Answer every status poll with this code until cleared
    pub fn force_status(&self, status: Option<StatusCode>) {
        self.state.lock().forced_status = status;
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.state.lock().requests.clone()
    }

    pub fn patches(&self) -> Vec<Host> {
        self.state.lock().patches.clone()
    }
}

impl Drop for FakeControlServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

fn router(state: Shared) -> Router {
    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/api/v1.0/host/:host_id/status", get(status_handler))
        .route("/api/v1.0/host/:id", patch(update_host_handler))
        .with_state(state)
}

fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

async fn status_handler(
    State(state): State<Shared>,
    Path(host_id): Path<String>,
    headers: HeaderMap,
) -> Response {
    let mut state = state.lock();

    let api_key = header_value(&headers, "x-api-key");
    let if_none_match = header_value(&headers, header::IF_NONE_MATCH.as_str());

    let authorized = api_key
        .as_deref()
        .is_some_and(|k| state.api_keys.contains(k));
    let status = if let Some(forced) = state.forced_status {
        forced
    } else if !authorized {
        StatusCode::UNAUTHORIZED
    } else if if_none_match.as_deref() == Some(state.etag.as_str()) {
        StatusCode::NOT_MODIFIED
    } else {
        StatusCode::OK
    };

    state.requests.push(RecordedRequest {
        host_id,
        api_key,
        if_none_match,
        user_agent: header_value(&headers, header::USER_AGENT.as_str()),
        status: status.as_u16(),
    });

    if status == StatusCode::OK {
        (
            status,
            [
                (header::ETAG, state.etag.clone()),
                (header::CONTENT_TYPE, "application/json".to_string()),
            ],
            state.body.clone(),
        )
            .into_response()
    } else {
        status.into_response()
    }
}

async fn update_host_handler(
    State(state): State<Shared>,
    Path(id): Path<String>,
    headers: HeaderMap,
    Json(host): Json<Host>,
) -> StatusCode {
    let mut state = state.lock();
    let authorized = header_value(&headers, "x-api-key").is_some_and(|k| k == host.api_key);
    if id != host.id || !authorized {
        return StatusCode::BAD_REQUEST;
    }
    state.patches.push(host);
    StatusCode::OK
}
