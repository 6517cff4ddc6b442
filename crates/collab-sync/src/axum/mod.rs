use axum::{
    extract::{Query, State, WebSocketUpgrade},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use serde::Deserialize;
use std::sync::Arc;
use tracing::warn;
use uuid::Uuid;

pub mod handler;

pub use handler::WebSocketHandler;

use crate::gateway::LocalPushGateway;
use crate::session::SyncEngine;
use crate::SyncError;

/// Axum state: the engine plus the gateway its WebSocket transports attach to.
/// The engine must have been built with this same gateway.
#[derive(Clone)]
pub struct SyncState {
    engine: SyncEngine,
    gateway: Arc<LocalPushGateway>,
}

impl SyncState {
    pub fn new(engine: SyncEngine, gateway: Arc<LocalPushGateway>) -> Self {
        Self { engine, gateway }
    }

    pub fn engine(&self) -> &SyncEngine {
        &self.engine
    }

    pub fn gateway(&self) -> &Arc<LocalPushGateway> {
        &self.gateway
    }
}

#[derive(Debug, Deserialize)]
pub struct ConnectParams {
    token: Option<String>,
}

/// Create a router exposing the sync WebSocket at `/sync?token=...`
pub fn router_with_sync(state: SyncState) -> Router {
    Router::new()
        .route("/sync", get(websocket_handler))
        .with_state(state)
}

/// Authenticate before upgrading; a bad token never gets a socket
async fn websocket_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<ConnectParams>,
    State(state): State<SyncState>,
) -> Response {
    let token = params.token.unwrap_or_default();
    let endpoint = format!("ws-{}", Uuid::new_v4());
    let outlet = state.gateway.open(endpoint.clone());

    match state.engine.connect(&token, &endpoint).await {
        Ok(session) => ws.on_upgrade(move |socket| {
            WebSocketHandler::new(socket, state, session, outlet).handle()
        }),
        Err(err) => {
            state.gateway.close(&endpoint);
            let status = match &err {
                SyncError::Auth(_) => StatusCode::UNAUTHORIZED,
                _ => {
                    warn!("Connection setup failed: {}", err);
                    StatusCode::INTERNAL_SERVER_ERROR
                }
            };
            (status, err.client_message()).into_response()
        }
    }
}
