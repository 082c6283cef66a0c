use std::sync::Arc;

use application::SessionAttributes;
use axum::{
    extract::{ws::WebSocketUpgrade, RawQuery, State},
    response::Response,
    routing::get,
    Json, Router,
};
use serde::Serialize;
use tower_http::trace::TraceLayer;

use crate::{error::ApiError, state::AppState, ws_connection::WebSocketConnection};

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .nest("/api/v1", api_routes())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn api_routes() -> Router<AppState> {
    Router::new().route("/ws", get(websocket_upgrade))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct HealthBody {
    status: &'static str,
    connected_users: usize,
    online_users: usize,
}

async fn health(State(state): State<AppState>) -> Json<HealthBody> {
    Json(HealthBody {
        status: "ok",
        connected_users: state.gateway.delivery().connected_users().len(),
        online_users: state.gateway.presence().online_users().len(),
    })
}

/// 握手：升级前校验凭证，失败直接返回 401，不建立连接
async fn websocket_upgrade(
    State(state): State<AppState>,
    RawQuery(query): RawQuery,
    ws: WebSocketUpgrade,
) -> Result<Response, ApiError> {
    let session = Arc::new(SessionAttributes::new());
    let subject = state.gateway.handshake(query.as_deref(), &session)?;

    Ok(ws.on_upgrade(move |socket| async move {
        WebSocketConnection::new(socket, state, subject, session)
            .run()
            .await;
    }))
}
