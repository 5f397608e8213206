/// OpenAPI documentation generation.
pub mod documentation;
/// Push-socket feed serving live session views.
pub mod feed_service;
/// Health check service.
pub mod health_service;
/// One poll cycle of the match discovery pipeline.
pub mod poll_service;
/// Storage backend supervisor and degraded-mode bookkeeping.
pub mod storage_supervisor;
/// Per-session actor owning the tracker state machine.
pub mod tracker_actor;
/// Session registry and control dispatch.
pub mod tracker_service;
/// Session projections: feed frames and the live chat embed.
pub mod view_service;
