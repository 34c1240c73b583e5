//! Pipeline error taxonomy.
//!
//! Classification happens where the failure is observed; only the orchestrator
//! in [`crate::pipeline`] decides whether a given error consumes a retry
//! attempt or ends the conversion.

use cdp_driver::DriverError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConvertError {
    /// Session could not be established or was rejected by the service.
    #[error("authentication failed: {0}")]
    Authentication(String),

    /// An input-submission step failed (element missing, upload rejected).
    #[error("submission failed: {0}")]
    Submission(String),

    /// The wait budget elapsed with no artifact surfacing.
    #[error("generation timed out after {waited_s}s")]
    GenerationTimeout { waited_s: u64 },

    /// Downloaded payload failed the plausibility check.
    #[error("artifact implausibly small: {got} bytes (minimum {min})")]
    CorruptArtifact { got: u64, min: u64 },

    /// Transfer-level failure while fetching the artifact.
    #[error("transfer failed: {0}")]
    Transport(String),

    #[error(transparent)]
    Driver(#[from] DriverError),
}

impl ConvertError {
    /// Whether a fresh attempt against a recovered page could plausibly
    /// succeed. Download-side errors never reach this; they are handled
    /// entirely inside the download manager.
    pub fn consumes_attempt(&self) -> bool {
        match self {
            ConvertError::Submission(_) | ConvertError::GenerationTimeout { .. } => true,
            ConvertError::Driver(err) => err.retriable,
            ConvertError::Authentication(_) => true,
            ConvertError::CorruptArtifact { .. } | ConvertError::Transport(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cdp_driver::{DriverError, DriverErrorKind};

    #[test]
    fn submission_and_timeout_consume_attempts() {
        assert!(ConvertError::Submission("no button".into()).consumes_attempt());
        assert!(ConvertError::GenerationTimeout { waited_s: 180 }.consumes_attempt());
    }

    #[test]
    fn driver_errors_follow_their_retriable_flag() {
        let retriable = DriverError::new(DriverErrorKind::NavTimeout).retriable(true);
        let fatal = DriverError::new(DriverErrorKind::Internal);
        assert!(ConvertError::Driver(retriable).consumes_attempt());
        assert!(!ConvertError::Driver(fatal).consumes_attempt());
    }

    #[test]
    fn download_side_errors_never_consume_attempts() {
        assert!(!ConvertError::CorruptArtifact { got: 10, min: 500_000 }.consumes_attempt());
        assert!(!ConvertError::Transport("status 503".into()).consumes_attempt());
    }
}
