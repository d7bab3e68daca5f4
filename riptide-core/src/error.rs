//! Error types surfaced through flow terminals.
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

/// Terminal error of a flow.
///
/// Errors are cloneable so that processors can broadcast a single terminal
/// to every attached subscriber; user payloads are held behind an [Arc].
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FlowError {
    /// A user-supplied callback failed. Upstream is cancelled and pending
    /// items are discarded.
    #[error("callback failed: {0}")]
    Callback(Arc<str>),
    /// The flow-control contract was broken by a participant.
    #[error("protocol violation: {0}")]
    Protocol(ProtocolViolation),
    /// Upstream produced faster than downstream requested and no overflow
    /// policy absorbed the excess.
    #[error("could not emit value due to lack of requests")]
    MissingBackpressure,
    /// No item arrived within the configured window.
    #[error("no item arrived within {0:?}")]
    Timeout(Duration),
    /// Multiple concurrent errors, in order of arrival.
    #[error("{} concurrent errors", .errors.len())]
    Composite {
        /// The collected errors in arrival order.
        errors: Arc<[FlowError]>,
    },
}

impl FlowError {
    /// A [FlowError::Callback] from any displayable reason.
    pub fn callback(reason: impl std::fmt::Display) -> Self {
        FlowError::Callback(Arc::from(reason.to_string().as_str()))
    }

    /// Collapse collected errors into a single terminal: the sole error
    /// stays as-is, two or more become [FlowError::Composite].
    pub fn composite(mut errors: Vec<FlowError>) -> Self {
        if errors.len() == 1 {
            errors.pop().unwrap_or(FlowError::MissingBackpressure)
        } else {
            FlowError::Composite {
                errors: errors.into(),
            }
        }
    }
}

/// Contract breaches detected eagerly by the runtime.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolViolation {
    /// A subscriber which already holds a subscription was handed a second
    /// one. The second subscription is cancelled.
    #[error("subscriber already holds a subscription")]
    DoubleSubscribe,
    /// `request(0)` is not a valid demand.
    #[error("request amount must be positive")]
    InvalidRequest,
}
