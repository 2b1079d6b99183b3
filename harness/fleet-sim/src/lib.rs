//! In-process simulator of the Fleet (ingest manager) API served by Kibana.
//!
//! Agents, enrollment keys and datastreams live in memory and converge over
//! a configurable number of queries, which makes the eventually-consistent
//! checks of the harness testable without Docker.

pub mod state;

use axum::{
    Json, Router,
    extract::{Path, RawQuery, Request, State},
    http::{HeaderMap, StatusCode, header},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
};
use base64::Engine as _;
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::{net::TcpListener, sync::oneshot, task::JoinHandle};
use tracing::debug;

pub use state::{DEFAULT_CONFIG_ID, EnrollError, FleetState, SimAgent, SimConfig, SimKey};

pub fn router(state: FleetState) -> Router {
    Router::new()
        .route(
            "/api/ingest_manager/fleet/setup",
            get(setup_status).post(force_setup),
        )
        .route("/api/ingest_manager/agent_configs", get(agent_configs))
        .route(
            "/api/ingest_manager/fleet/enrollment-api-keys",
            post(create_key),
        )
        .route(
            "/api/ingest_manager/fleet/enrollment-api-keys/{id}",
            delete(revoke_key),
        )
        .route("/api/ingest_manager/fleet/agents", get(list_agents))
        .route(
            "/api/ingest_manager/fleet/agents/{id}/unenroll",
            post(unenroll),
        )
        .route("/api/ingest_manager/data_streams", get(data_streams))
        .layer(middleware::from_fn_with_state(state.clone(), guard))
        .with_state(state)
}

fn kibana_error(status: StatusCode, message: impl Into<String>) -> Response {
    let body = json!({
        "statusCode": status.as_u16(),
        "error": status.canonical_reason().unwrap_or("Error"),
        "message": message.into(),
    });
    (status, Json(body)).into_response()
}

fn authorized(headers: &HeaderMap, config: &SimConfig) -> bool {
    let expected = base64::engine::general_purpose::STANDARD
        .encode(format!("{}:{}", config.username, config.password));
    headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Basic "))
        .is_some_and(|credentials| credentials == expected)
}

async fn guard(State(state): State<FleetState>, request: Request, next: Next) -> Response {
    if !authorized(request.headers(), state.config()) {
        return kibana_error(StatusCode::UNAUTHORIZED, "missing or invalid credentials");
    }
    if !request.headers().contains_key("kbn-xsrf") {
        return kibana_error(StatusCode::BAD_REQUEST, "Request must contain a kbn-xsrf header.");
    }
    debug!(method = %request.method(), uri = %request.uri(), "fleet-sim request");
    next.run(request).await
}

async fn setup_status(State(state): State<FleetState>) -> Json<Value> {
    Json(state.setup_json())
}

async fn force_setup(State(state): State<FleetState>) -> Json<Value> {
    state.force_setup();
    Json(json!({"isInitialized": true}))
}

async fn agent_configs() -> Json<Value> {
    Json(json!({
        "items": [{"id": DEFAULT_CONFIG_ID, "name": "Default config", "is_default": true}],
        "total": 1,
        "page": 1,
        "perPage": 20,
    }))
}

#[derive(Debug, Deserialize)]
struct CreateKey {
    config_id: String,
    name: String,
}

async fn create_key(State(state): State<FleetState>, Json(body): Json<CreateKey>) -> Response {
    if body.config_id != DEFAULT_CONFIG_ID {
        return kibana_error(
            StatusCode::BAD_REQUEST,
            format!("agent config {} not found", body.config_id),
        );
    }
    let key = state.create_key(&body.name, &body.config_id);
    Json(json!({
        "action": "created",
        "item": {
            "id": key.id,
            "api_key": key.api_key,
            "api_key_id": key.api_key_id,
            "name": key.name,
            "config_id": key.config_id,
            "active": key.active,
        }
    }))
    .into_response()
}

async fn revoke_key(State(state): State<FleetState>, Path(id): Path<String>) -> Response {
    if state.revoke_key(&id) {
        Json(json!({"action": "deleted"})).into_response()
    } else {
        kibana_error(StatusCode::NOT_FOUND, format!("enrollment key {id} not found"))
    }
}

async fn list_agents(State(state): State<FleetState>, RawQuery(query): RawQuery) -> Response {
    // Kibana rejects the percent-encoded form of this query.
    if query.as_deref().is_some_and(|q| q.contains('%')) {
        return kibana_error(
            StatusCode::BAD_REQUEST,
            "[request query]: definition for this key is missing",
        );
    }
    Json(state.poll_agents()).into_response()
}

async fn unenroll(State(state): State<FleetState>, Path(id): Path<String>) -> Response {
    if state.unenroll(&id) {
        Json(json!({"success": true})).into_response()
    } else {
        kibana_error(StatusCode::NOT_FOUND, format!("agent {id} not found"))
    }
}

async fn data_streams(State(state): State<FleetState>) -> Json<Value> {
    Json(state.poll_data_streams())
}

/// A running simulator bound to a local port; stops when dropped.
pub struct SimServer {
    url: String,
    state: FleetState,
    shutdown: Option<oneshot::Sender<()>>,
    handle: JoinHandle<()>,
}

impl SimServer {
    /// Base URL, e.g. `http://127.0.0.1:39111`.
    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn state(&self) -> &FleetState {
        &self.state
    }

    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        let _ = (&mut self.handle).await;
    }
}

impl Drop for SimServer {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
    }
}

/// Serve `state` on `127.0.0.1:0`.
pub async fn spawn(state: FleetState) -> anyhow::Result<SimServer> {
    serve_on("127.0.0.1:0", state).await
}

pub async fn serve_on(addr: &str, state: FleetState) -> anyhow::Result<SimServer> {
    let listener = TcpListener::bind(addr).await?;
    let addr = listener.local_addr()?;
    let url = format!("http://{addr}");
    let router = router(state.clone());

    let (tx, rx) = oneshot::channel::<()>();
    let handle = tokio::spawn(async move {
        let server = axum::serve(listener, router.into_make_service());
        let _ = server
            .with_graceful_shutdown(async move {
                let _ = rx.await;
            })
            .await;
    });
    debug!(%url, "fleet-sim listening");

    Ok(SimServer {
        url,
        state,
        shutdown: Some(tx),
        handle,
    })
}
