//! WebSocket upgrade for the push service

use axum::extract::{State, WebSocketUpgrade};
use axum::response::Response;

use crate::state::ActivityState;

/// `GET /api/push` — upgrade and hand the socket to the push service. The
/// socket authenticates itself with its first frame.
pub async fn push_handler(
    State(state): State<ActivityState>,
    upgrade: WebSocketUpgrade,
) -> Response {
    let service = state.push_service();
    upgrade.on_upgrade(move |socket| service.handle_socket(socket))
}
