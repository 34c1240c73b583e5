//! Progress reporting.
//!
//! Percent values are coarse stage markers, not measured progress; the
//! terminal sentinel `-1` signals that the conversion will not complete.

use serde::{Deserialize, Serialize};

pub const PERCENT_FAILED: i8 = -1;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub stage: String,
    /// 0..=100, or -1 once the conversion is abandoned.
    pub percent: i8,
}

impl ProgressEvent {
    pub fn new(stage: impl Into<String>, percent: i8) -> Self {
        Self {
            stage: stage.into(),
            percent,
        }
    }

    pub fn is_terminal_failure(&self) -> bool {
        self.percent == PERCENT_FAILED
    }
}

/// Receives progress callbacks. Implemented for plain closures so callers can
/// pass `|event| ...` directly.
pub trait ProgressSink: Send + Sync {
    fn emit(&self, event: ProgressEvent);
}

impl<F> ProgressSink for F
where
    F: Fn(ProgressEvent) + Send + Sync,
{
    fn emit(&self, event: ProgressEvent) {
        self(event)
    }
}

/// Discards everything.
pub struct NullSink;

impl ProgressSink for NullSink {
    fn emit(&self, _event: ProgressEvent) {}
}

/// Stage markers shared by the orchestrator. Kept in one place so batch
/// percent mapping and tests agree on the milestones.
pub mod stages {
    pub const STARTING: (&str, i8) = ("starting session", 5);
    pub const SESSION_READY: (&str, i8) = ("session ready", 10);
    pub const SUBMITTING: (&str, i8) = ("submitting input", 15);
    pub const SUBMITTED: (&str, i8) = ("generation requested", 20);
    pub const AWAITING: (&str, i8) = ("awaiting generation", 40);
    pub const DOWNLOADING: (&str, i8) = ("downloading artifact", 85);
    pub const COMPLETE: (&str, i8) = ("complete", 100);
}
