//! Error taxonomy for the realtime engine.

use thiserror::Error;

/// Failures surfaced to the initiating caller.
///
/// State-mutation failures are never broadcast to a group; the caller sees
/// the denial and nobody else does. Operations whose absence of a target is
/// an expected outcome (toggle, leave, receipt insert) report `Ok(false)` /
/// `Ok(None)` instead of an error.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Unknown call, message, or participant.
    #[error("Not found: {0}")]
    NotFound(String),

    /// The action conflicts with current state.
    #[error("Conflict: {0}")]
    Conflict(String),

    /// The caller may not perform this action.
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// A signaling payload was rejected before relay (empty or oversized).
    #[error("Rejected payload: {0}")]
    Payload(String),

    /// A persistence collaborator is unavailable; retry later.
    #[error("Storage unavailable: {0}")]
    Transient(String),

    /// Unexpected internal failure.
    #[error("Internal error: {0}")]
    Internal(String),
}
