use tracing::warn;

use crate::{dto::health::HealthResponse, state::SharedState};

/// Respond with a health payload while logging connectivity issues.
pub async fn health_status(state: &SharedState) -> HealthResponse {
    match state.kv_store().await {
        Some(store) => {
            if let Err(err) = store.health_check().await {
                warn!(error = %err, "storage health check failed");
            }
        }
        None => warn!("storage unavailable (degraded mode)"),
    }

    let live_sessions = state.trackers().len();
    if state.is_degraded().await {
        HealthResponse::degraded(live_sessions)
    } else {
        HealthResponse::ok(live_sessions)
    }
}
