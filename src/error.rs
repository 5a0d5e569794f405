//! Failure taxonomy for the monitoring pipeline.
//!
//! Most operations return `anyhow::Result`. The variants here are attached to
//! those errors where a caller needs to classify the failure (for example the
//! gateway mapping configuration errors to `400`), and are recovered with
//! `anyhow::Error::downcast_ref::<SentinelError>()`.

use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SentinelError {
    /// No frame was ready; retried on the next iteration.
    FrameUnavailable,
    /// No model loaded, or the model call failed.
    DetectorUnavailable(String),
    /// A violation write did not reach durable storage.
    Persistence(String),
    /// A single observer could not be reached.
    Delivery { observer_id: String, reason: String },
    /// Invalid zone geometry, unknown model name, out-of-range threshold.
    Configuration(String),
    /// A response referenced an unknown or already-resolved violation.
    ResponseRouting { violation_id: String },
}

impl SentinelError {
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    /// Returns true when `err` carries a configuration failure.
    pub fn is_configuration(err: &anyhow::Error) -> bool {
        matches!(
            err.downcast_ref::<SentinelError>(),
            Some(SentinelError::Configuration(_))
        )
    }
}

impl fmt::Display for SentinelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::FrameUnavailable => write!(f, "no frame available"),
            Self::DetectorUnavailable(reason) => write!(f, "detector unavailable: {}", reason),
            Self::Persistence(reason) => write!(f, "persistence failure: {}", reason),
            Self::Delivery {
                observer_id,
                reason,
            } => write!(f, "delivery to observer {} failed: {}", observer_id, reason),
            Self::Configuration(reason) => write!(f, "invalid configuration: {}", reason),
            Self::ResponseRouting { violation_id } => {
                write!(f, "violation {} not found or already resolved", violation_id)
            }
        }
    }
}

impl std::error::Error for SentinelError {}
