//! Operator HTTP API: live status, the persisted snapshot, and control
//! intent submission.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json};
use axum::routing::{get, post};
use axum::Router;
use std::env;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;

use crate::intent::{ControlIntent, DispositionKind};
use crate::scheduler::Hub;
use crate::state::SharedState;
use crate::store::StateStore;

// ---------------------------------------------------------------------------
// Composite app state shared across all handlers
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct AppState {
    pub shared: SharedState,
    pub hub: Arc<Hub>,
    pub store: StateStore,
}

// ---------------------------------------------------------------------------
// Routes
// ---------------------------------------------------------------------------

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/status", get(api_status))
        .route("/api/snapshot", get(api_snapshot))
        .route("/api/intent", post(api_intent))
        .with_state(state)
}

async fn api_status(State(state): State<AppState>) -> impl IntoResponse {
    let st = state.shared.read().await;
    Json(st.to_status())
}

async fn api_snapshot(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.store.snapshot())
}

async fn api_intent(
    State(state): State<AppState>,
    Json(intent): Json<ControlIntent>,
) -> impl IntoResponse {
    let resp = state.hub.submit(intent).await;
    let code = match resp.disposition {
        DispositionKind::Accepted | DispositionKind::Queued => StatusCode::OK,
        DispositionKind::Locked => StatusCode::CONFLICT,
        DispositionKind::Rejected => match resp.reason.as_deref() {
            Some("UNKNOWN_ACTUATOR") => StatusCode::NOT_FOUND,
            Some("OUT_OF_RANGE") => StatusCode::BAD_REQUEST,
            _ => StatusCode::CONFLICT,
        },
    };
    (code, Json(resp))
}

// ---------------------------------------------------------------------------
// Server entry-point
// ---------------------------------------------------------------------------

pub async fn serve(shared: SharedState, hub: Arc<Hub>, store: StateStore) {
    let port: u16 = env::var("UECS_HTTP_PORT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(8520);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .expect("failed to bind operator api port");

    info!("operator api listening on http://{addr}");

    let state = AppState { shared, hub, store };
    axum::serve(listener, router(state))
        .await
        .expect("operator api server error");
}

// ===========================================================================
// Tests
// ===========================================================================
