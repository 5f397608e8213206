use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::dto::view::SessionView;

/// Frames pushed to feed subscribers.
#[derive(Debug, Serialize, ToSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FeedOutbound {
    /// Full session view, sent whenever the view fingerprint moves.
    State {
        /// Epoch milliseconds at which the frame was built.
        timestamp: i64,
        data: SessionView,
    },
    /// Reply to an inbound ping.
    Pong,
}

/// Messages accepted from feed clients.
///
/// The parser is deliberately strict: legacy shapes such as a lone
/// `{"type":"stopped"}` fail to decode and are dropped by the socket
/// handler instead of being partially applied.
#[derive(Debug, PartialEq, Eq, Deserialize, ToSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FeedInbound {
    /// Liveness probe.
    Ping,
}
