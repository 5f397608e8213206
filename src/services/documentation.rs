use utoipa::OpenApi;

#[derive(OpenApi)]
/// Aggregated OpenAPI specification for Series Scope Back.
#[openapi(
    paths(
        crate::routes::health::healthcheck,
        crate::routes::control::start_tracker,
        crate::routes::control::pause_tracker,
        crate::routes::control::resume_tracker,
        crate::routes::control::stop_tracker,
        crate::routes::control::refresh_tracker,
        crate::routes::control::substitute_player,
        crate::routes::control::repost_message,
        crate::routes::control::tracker_status,
        crate::routes::control::list_trackers,
        crate::routes::websocket::feed_handler,
    ),
    components(
        schemas(
            crate::dto::health::HealthResponse,
            crate::dto::control::StartRequest,
            crate::dto::control::PlayerInput,
            crate::dto::control::TeamInput,
            crate::dto::control::RefreshRequest,
            crate::dto::control::SubstitutionRequest,
            crate::dto::control::RepostRequest,
            crate::dto::control::ControlResponse,
            crate::dto::control::SubstitutionResponse,
            crate::dto::control::SubstitutionResult,
            crate::dto::control::RepostResponse,
            crate::dto::control::StatusResponse,
            crate::dto::view::SessionView,
            crate::dto::view::SessionSummary,
            crate::dto::feed::FeedOutbound,
            crate::dto::feed::FeedInbound,
            crate::state::SessionStatus,
        )
    ),
    tags(
        (name = "trackers", description = "Session lifecycle and control actions"),
        (name = "feed", description = "WebSocket state feed per session"),
        (name = "health", description = "Health check endpoints"),
    )
)]
pub struct ApiDoc;
