use axum::{
    Router,
    extract::{Path, State, WebSocketUpgrade},
    response::IntoResponse,
    routing::get,
};

use crate::{services::feed_service, state::SharedState};

#[utoipa::path(
    get,
    path = "/ws/{guild_id}/{queue_number}",
    tag = "feed",
    params(
        ("guild_id" = String, Path, description = "Chat guild that owns the queue"),
        ("queue_number" = u32, Path, description = "Queue slot inside the guild")
    ),
    responses((status = 101, description = "Switching protocols to WebSocket"))
)]
/// Upgrade the HTTP connection into a live session feed.
pub async fn feed_handler(
    State(state): State<SharedState>,
    Path((guild_id, queue_number)): Path<(String, u32)>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let shared_state = state.clone();
    ws.on_upgrade(move |socket| {
        feed_service::handle_socket(shared_state.clone(), socket, guild_id, queue_number)
    })
}

/// Configure the WebSocket endpoint.
pub fn router() -> Router<SharedState> {
    Router::<SharedState>::new().route("/ws/{guild_id}/{queue_number}", get(feed_handler))
}
