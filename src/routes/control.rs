use axum::{
    Json, Router,
    extract::{Path, State},
    routing::{get, post},
};
use axum_valid::Valid;

use crate::{
    dto::control::{
        ControlResponse, RefreshRequest, RepostRequest, RepostResponse, StartRequest,
        StatusResponse, SubstitutionRequest, SubstitutionResponse, SubstitutionResult,
    },
    dto::view::SessionSummary,
    error::AppError,
    services::{
        tracker_actor::RefreshOutcome,
        tracker_service, view_service,
    },
    state::SharedState,
};

/// Routes driving the tracker lifecycle for one guild queue.
pub fn router() -> Router<SharedState> {
    Router::new()
        .route("/trackers", get(list_trackers))
        .route("/trackers/{guild_id}/{queue_number}/start", post(start_tracker))
        .route("/trackers/{guild_id}/{queue_number}/pause", post(pause_tracker))
        .route("/trackers/{guild_id}/{queue_number}/resume", post(resume_tracker))
        .route("/trackers/{guild_id}/{queue_number}/stop", post(stop_tracker))
        .route("/trackers/{guild_id}/{queue_number}/refresh", post(refresh_tracker))
        .route(
            "/trackers/{guild_id}/{queue_number}/substitution",
            post(substitute_player),
        )
        .route("/trackers/{guild_id}/{queue_number}/repost", post(repost_message))
        .route("/trackers/{guild_id}/{queue_number}/status", get(tracker_status))
}

/// Begin tracking a queue and post its live message.
#[utoipa::path(
    post,
    path = "/trackers/{guild_id}/{queue_number}/start",
    tag = "trackers",
    params(
        ("guild_id" = String, Path, description = "Chat guild that owns the queue"),
        ("queue_number" = u32, Path, description = "Queue slot inside the guild")
    ),
    request_body = StartRequest,
    responses(
        (status = 200, description = "Tracking started", body = ControlResponse)
    )
)]
pub async fn start_tracker(
    State(state): State<SharedState>,
    Path((guild_id, queue_number)): Path<(String, u32)>,
    Valid(Json(payload)): Valid<Json<StartRequest>>,
) -> Result<Json<ControlResponse>, AppError> {
    let session = tracker_service::start(&state, &guild_id, queue_number, payload).await?;
    let view = view_service::session_view(&state, &session).await;
    Ok(Json(ControlResponse::ok(view)))
}

/// Suspend timer polls without losing session state.
#[utoipa::path(
    post,
    path = "/trackers/{guild_id}/{queue_number}/pause",
    tag = "trackers",
    params(
        ("guild_id" = String, Path, description = "Chat guild that owns the queue"),
        ("queue_number" = u32, Path, description = "Queue slot inside the guild")
    ),
    responses(
        (status = 200, description = "Session paused", body = ControlResponse)
    )
)]
pub async fn pause_tracker(
    State(state): State<SharedState>,
    Path((guild_id, queue_number)): Path<(String, u32)>,
) -> Result<Json<ControlResponse>, AppError> {
    let reply = tracker_service::pause(&state, &guild_id, queue_number).await?;
    let view = view_service::session_view(&state, &reply.session).await;
    Ok(Json(ControlResponse::ok_with_embed(view, reply.embed_data)))
}

/// Resume a paused session and re-arm its poll timer.
#[utoipa::path(
    post,
    path = "/trackers/{guild_id}/{queue_number}/resume",
    tag = "trackers",
    params(
        ("guild_id" = String, Path, description = "Chat guild that owns the queue"),
        ("queue_number" = u32, Path, description = "Queue slot inside the guild")
    ),
    responses(
        (status = 200, description = "Session resumed", body = ControlResponse)
    )
)]
pub async fn resume_tracker(
    State(state): State<SharedState>,
    Path((guild_id, queue_number)): Path<(String, u32)>,
) -> Result<Json<ControlResponse>, AppError> {
    let reply = tracker_service::resume(&state, &guild_id, queue_number).await?;
    let view = view_service::session_view(&state, &reply.session).await;
    Ok(Json(ControlResponse::ok_with_embed(view, reply.embed_data)))
}

/// Stop the session for good and render the final embed.
#[utoipa::path(
    post,
    path = "/trackers/{guild_id}/{queue_number}/stop",
    tag = "trackers",
    params(
        ("guild_id" = String, Path, description = "Chat guild that owns the queue"),
        ("queue_number" = u32, Path, description = "Queue slot inside the guild")
    ),
    responses(
        (status = 200, description = "Session stopped", body = ControlResponse)
    )
)]
pub async fn stop_tracker(
    State(state): State<SharedState>,
    Path((guild_id, queue_number)): Path<(String, u32)>,
) -> Result<Json<ControlResponse>, AppError> {
    let reply = tracker_service::stop(&state, &guild_id, queue_number).await?;
    let view = view_service::session_view(&state, &reply.session).await;
    Ok(Json(ControlResponse::ok_with_embed(view, reply.embed_data)))
}

/// Poll upstream immediately instead of waiting for the timer.
///
/// A refresh inside the cooldown window is reported in the body rather
/// than as an HTTP error so callers can surface the retry delay.
#[utoipa::path(
    post,
    path = "/trackers/{guild_id}/{queue_number}/refresh",
    tag = "trackers",
    params(
        ("guild_id" = String, Path, description = "Chat guild that owns the queue"),
        ("queue_number" = u32, Path, description = "Queue slot inside the guild")
    ),
    request_body = RefreshRequest,
    responses(
        (status = 200, description = "Refresh attempted", body = ControlResponse)
    )
)]
pub async fn refresh_tracker(
    State(state): State<SharedState>,
    Path((guild_id, queue_number)): Path<(String, u32)>,
    Valid(Json(payload)): Valid<Json<RefreshRequest>>,
) -> Result<Json<ControlResponse>, AppError> {
    let outcome =
        tracker_service::refresh(&state, &guild_id, queue_number, payload.match_completed).await?;
    let response = match outcome {
        RefreshOutcome::Refreshed(session) => {
            ControlResponse::ok(view_service::session_view(&state, &session).await)
        }
        RefreshOutcome::Cooldown { retry_in } => ControlResponse::cooldown(format!(
            "refresh available in {}s",
            retry_in.as_secs().max(1)
        )),
        RefreshOutcome::Failed(session) => {
            ControlResponse::failed(view_service::session_view(&state, &session).await)
        }
    };
    Ok(Json(response))
}

/// Swap one roster player for another mid-series.
#[utoipa::path(
    post,
    path = "/trackers/{guild_id}/{queue_number}/substitution",
    tag = "trackers",
    params(
        ("guild_id" = String, Path, description = "Chat guild that owns the queue"),
        ("queue_number" = u32, Path, description = "Queue slot inside the guild")
    ),
    request_body = SubstitutionRequest,
    responses(
        (status = 200, description = "Substitution applied", body = SubstitutionResponse)
    )
)]
pub async fn substitute_player(
    State(state): State<SharedState>,
    Path((guild_id, queue_number)): Path<(String, u32)>,
    Valid(Json(payload)): Valid<Json<SubstitutionRequest>>,
) -> Result<Json<SubstitutionResponse>, AppError> {
    let team_index = tracker_service::substitute(
        &state,
        &guild_id,
        queue_number,
        payload.player_out_id.clone(),
        payload.player_in_id.clone(),
        payload.display_name,
    )
    .await?;
    Ok(Json(SubstitutionResponse {
        success: true,
        substitution: SubstitutionResult {
            player_out_id: payload.player_out_id,
            player_in_id: payload.player_in_id,
            team_index,
        },
    }))
}

/// Point the session at a freshly posted chat message.
#[utoipa::path(
    post,
    path = "/trackers/{guild_id}/{queue_number}/repost",
    tag = "trackers",
    params(
        ("guild_id" = String, Path, description = "Chat guild that owns the queue"),
        ("queue_number" = u32, Path, description = "Queue slot inside the guild")
    ),
    request_body = RepostRequest,
    responses(
        (status = 200, description = "Live message moved", body = RepostResponse)
    )
)]
pub async fn repost_message(
    State(state): State<SharedState>,
    Path((guild_id, queue_number)): Path<(String, u32)>,
    Valid(Json(payload)): Valid<Json<RepostRequest>>,
) -> Result<Json<RepostResponse>, AppError> {
    let outcome =
        tracker_service::repost(&state, &guild_id, queue_number, payload.new_message_id).await?;
    Ok(Json(RepostResponse {
        success: true,
        old_message_id: outcome.old_message_id,
        new_message_id: outcome.new_message_id,
    }))
}

/// Current snapshot of one session, live or stored.
#[utoipa::path(
    get,
    path = "/trackers/{guild_id}/{queue_number}/status",
    tag = "trackers",
    params(
        ("guild_id" = String, Path, description = "Chat guild that owns the queue"),
        ("queue_number" = u32, Path, description = "Queue slot inside the guild")
    ),
    responses(
        (status = 200, description = "Session snapshot", body = StatusResponse)
    )
)]
pub async fn tracker_status(
    State(state): State<SharedState>,
    Path((guild_id, queue_number)): Path<(String, u32)>,
) -> Result<Json<StatusResponse>, AppError> {
    let session = tracker_service::status(&state, &guild_id, queue_number).await?;
    let view = view_service::session_view(&state, &session).await;
    Ok(Json(StatusResponse { state: view }))
}

/// All known sessions, stored and live merged.
#[utoipa::path(
    get,
    path = "/trackers",
    tag = "trackers",
    responses(
        (status = 200, description = "Known sessions", body = Vec<SessionSummary>)
    )
)]
pub async fn list_trackers(
    State(state): State<SharedState>,
) -> Result<Json<Vec<SessionSummary>>, AppError> {
    let summaries = tracker_service::list(&state).await?;
    Ok(Json(summaries))
}
