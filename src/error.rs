//! Error taxonomy for the ingestion and scheduling core.
//!
//! Mirrors the kinds distinguished by callers: fatal construction-time
//! failures (`Config`, `SensorValidation`), the orderly `EndOfStream`
//! signal (not a failure), and the per-reading outcomes a producer loop
//! must tell apart (`LockContention` vs. `Deadline` vs. `Native`).

use std::time::Duration;

use thiserror::Error;

/// Errors surfaced by configuration resolution, sensor binding, the
/// engine facade, and the ingestion loops.
#[derive(Error, Debug)]
pub enum CoreError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("sensor validation error: {0}")]
    SensorValidation(String),

    /// Orderly termination signal. Not a failure: only the owning loop
    /// should ever match on this, and it should never be logged as an
    /// error.
    #[error("end of stream")]
    EndOfStream,

    /// The native engine's internal mutex was busy. Callers decide
    /// between skip (online) and retry (offline).
    #[error("engine lock contention")]
    LockContention,

    /// A single engine call exceeded its deadline.
    #[error("engine call exceeded deadline of {0:?}")]
    Deadline(Duration),

    /// Any other engine-reported failure.
    #[error("native engine error: {0}")]
    Native(String),

    /// External cancellation observed at a suspension point.
    #[error("cancelled")]
    Cancelled,

    #[error("failed to read configuration file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse configuration: {0}")]
    Json(#[from] serde_json::Error),
}

impl CoreError {
    pub fn is_end_of_stream(&self) -> bool {
        matches!(self, CoreError::EndOfStream)
    }

    pub fn is_lock_contention(&self) -> bool {
        matches!(self, CoreError::LockContention)
    }
}
