/*!
Mock collection endpoint

A real HTTP server on 127.0.0.1 with an ephemeral port. Records every
payload posted to it and answers 201, or 500 for parameters it was told
to reject.
*/

use anyhow::Result;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Json, Router};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

pub const READINGS_PATH: &str = "/api/readings";

#[derive(Clone, Default)]
struct CollectorState {
    received: Arc<Mutex<Vec<Value>>>,
    accepted: Arc<Mutex<Vec<Value>>>,
    reject: Arc<HashSet<String>>,
}

async fn ingest(State(state): State<CollectorState>, Json(payload): Json<Value>) -> (StatusCode, Json<Value>) {
    state.received.lock().push(payload.clone());

    let parameter = payload.get("parameter").and_then(Value::as_str).unwrap_or_default();
    if state.reject.contains(parameter) {
        log::info!("❌ [COLLECTOR] Rejected {}", parameter);
        return (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({ "error": "rejected" })));
    }

    log::info!("📥 [COLLECTOR] Stored {}", parameter);
    state.accepted.lock().push(payload);
    (StatusCode::CREATED, Json(json!({ "status": "created" })))
}

pub struct MockCollector {
    addr: SocketAddr,
    state: CollectorState,
    shutdown: Option<oneshot::Sender<()>>,
    server: Option<JoinHandle<()>>,
}

impl MockCollector {
    /// Accepts everything.
    pub async fn start() -> Result<Self> {
        Self::rejecting(Vec::<String>::new()).await
    }

    /// Answers 500 for readings whose `parameter` is listed.
    pub async fn rejecting<I, S>(parameters: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let state = CollectorState {
            reject: Arc::new(parameters.into_iter().map(Into::into).collect()),
            ..CollectorState::default()
        };

        let app = Router::new()
            .route(READINGS_PATH, post(ingest))
            .with_state(state.clone());

        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let (tx, rx) = oneshot::channel::<()>();

        let server = tokio::spawn(async move {
            let serve = axum::serve(listener, app).with_graceful_shutdown(async {
                rx.await.ok();
            });
            if let Err(e) = serve.await {
                log::error!("Mock collector stopped: {}", e);
            }
        });

        log::info!("🚀 [COLLECTOR] Listening on {}", addr);
        Ok(Self {
            addr,
            state,
            shutdown: Some(tx),
            server: Some(server),
        })
    }

    pub fn url(&self) -> String {
        format!("http://{}{}", self.addr, READINGS_PATH)
    }

    /// Every payload posted, accepted or not.
    pub fn received(&self) -> Vec<Value> {
        self.state.received.lock().clone()
    }

    pub fn accepted(&self) -> Vec<Value> {
        self.state.accepted.lock().clone()
    }

    pub fn accepted_parameters(&self) -> Vec<String> {
        self.state
            .accepted
            .lock()
            .iter()
            .filter_map(|p| p.get("parameter").and_then(Value::as_str).map(str::to_string))
            .collect()
    }

    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown.take() {
            tx.send(()).ok();
        }
        if let Some(server) = self.server.take() {
            server.await.ok();
        }
    }
}

impl Drop for MockCollector {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            tx.send(()).ok();
        }
    }
}
