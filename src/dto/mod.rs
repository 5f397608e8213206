/// Control protocol request and response payloads.
pub mod control;
/// WebSocket feed frames.
pub mod feed;
/// Health check payloads.
pub mod health;
/// Validation helpers for DTOs.
pub mod validation;
/// Session projections served to clients.
pub mod view;
