//! Error types for marketbus.
//!
//! All errors are strongly typed using thiserror. Broker-side recoverable
//! faults (decode errors, slow subscribers, peer partitions) are handled
//! in-line via counters and log lines and never surface here; these types
//! cover the failures callers can actually act on.

use thiserror::Error;

/// Validation errors raised when a subscription is rejected at registration.
#[derive(Debug, Error)]
pub enum ValidationError {
    /// Subscription carries no filter conditions.
    #[error("subscription '{subscription_id}' has no conditions")]
    EmptyConditions {
        /// Offending subscription id.
        subscription_id: String,
    },

    /// Complex subscription without a window configuration.
    #[error("complex subscription '{subscription_id}' is missing its window configuration")]
    MissingWindowConfig {
        /// Offending subscription id.
        subscription_id: String,
    },

    /// Complex subscription without any windowed condition.
    #[error("complex subscription '{subscription_id}' has no windowed condition")]
    MissingWindowedCondition {
        /// Offending subscription id.
        subscription_id: String,
    },

    /// Simple subscription carrying a windowed condition.
    #[error("simple subscription '{subscription_id}' carries a windowed condition")]
    UnexpectedWindowedCondition {
        /// Offending subscription id.
        subscription_id: String,
    },

    /// Window size below the minimum of 1.
    #[error("window size {window_size} is invalid (must be >= 1)")]
    WindowTooSmall {
        /// The rejected size.
        window_size: i64,
    },

    /// Aggregation name not one of avg/max/min/sum/count.
    #[error("unknown aggregation '{name}'")]
    UnknownAggregation {
        /// The rejected aggregation name.
        name: String,
    },

    /// Required field missing.
    #[error("required field '{field}' is missing")]
    MissingField {
        /// Name of the missing field.
        field: String,
    },
}

/// Execution errors raised by the matcher and the broker core.
#[derive(Debug, Error)]
pub enum ExecutionError {
    /// A subscription with this id is already registered.
    #[error("subscription already registered: {subscription_id}")]
    DuplicateSubscription {
        /// The duplicate id.
        subscription_id: String,
    },

    /// No subscription with this id is registered.
    #[error("subscription not found: {subscription_id}")]
    SubscriptionNotFound {
        /// The missing id.
        subscription_id: String,
    },

    /// A bounded queue refused the message.
    #[error("queue is full for {path} path (capacity={capacity})")]
    QueueFull {
        /// Queue name.
        path: String,
        /// Queue capacity.
        capacity: usize,
    },

    /// The peer worker or broker core went away before replying.
    #[error("worker disconnected for {path} path")]
    Disconnected {
        /// Queue name.
        path: String,
    },

    /// Operation timed out.
    #[error("operation timed out after {duration_ms}ms")]
    Timeout {
        /// Duration before timeout.
        duration_ms: u64,
    },
}

/// Wire errors raised while decoding framed messages.
#[derive(Debug, Error)]
pub enum WireError {
    /// The protobuf body could not be decoded.
    #[error("message decode failed: {0}")]
    Decode(#[from] prost::DecodeError),

    /// A frame length prefix exceeded the allowed maximum.
    #[error("frame of {len} bytes exceeds maximum of {max}")]
    FrameTooLarge {
        /// Declared frame length.
        len: usize,
        /// Allowed maximum.
        max: usize,
    },

    /// The envelope decoded but its oneof payload was absent.
    #[error("message '{message_id}' carries no payload")]
    MissingPayload {
        /// Envelope message id.
        message_id: String,
    },

    /// An enum field held a value outside the closed set.
    #[error("field '{field}' holds unknown enum value {value}")]
    UnknownEnumValue {
        /// Field name.
        field: &'static str,
        /// The raw wire value.
        value: i32,
    },
}

/// Transport errors for socket I/O between nodes.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Underlying socket failure.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Connecting to a remote endpoint failed.
    #[error("connection to {endpoint} failed: {message}")]
    ConnectionFailed {
        /// Target endpoint.
        endpoint: String,
        /// Error details.
        message: String,
    },

    /// The broker rejected a management request.
    #[error("broker rejected request: {reason}")]
    Rejected {
        /// Reason string from the management reply.
        reason: String,
    },
}

/// Top-level error type for marketbus.
#[derive(Debug, Error)]
pub enum BusError {
    /// Input validation failed.
    #[error("validation error: {0}")]
    Validation(#[from] ValidationError),

    /// Execution failure.
    #[error("execution error: {0}")]
    Execution(#[from] ExecutionError),

    /// Wire decoding failure.
    #[error("wire error: {0}")]
    Wire(#[from] WireError),

    /// Communication failure.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// Internal invariant violation.
    #[error("internal error: {message}")]
    Internal {
        /// Error description.
        message: String,
    },
}

impl BusError {
    /// Creates an internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Returns true if this is a validation error.
    #[must_use]
    pub const fn is_validation(&self) -> bool {
        matches!(self, Self::Validation(_))
    }

    /// Returns true if this is a wire decoding error.
    #[must_use]
    pub const fn is_wire(&self) -> bool {
        matches!(self, Self::Wire(_))
    }

    /// Returns true if retrying the operation can succeed.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::Execution(e) => matches!(
                e,
                ExecutionError::Timeout { .. } | ExecutionError::QueueFull { .. }
            ),
            Self::Transport(t) => matches!(
                t,
                TransportError::Io(_) | TransportError::ConnectionFailed { .. }
            ),
            Self::Validation(_) | Self::Wire(_) | Self::Internal { .. } => false,
        }
    }
}

/// Result type alias for marketbus operations.
pub type BusResult<T> = Result<T, BusError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_error_messages_name_the_subscription() {
        let err = ValidationError::EmptyConditions {
            subscription_id: "sub-1".to_string(),
        };
        assert!(format!("{err}").contains("sub-1"));

        let err = ValidationError::WindowTooSmall { window_size: 0 };
        assert!(format!("{err}").contains('0'));
    }

    #[test]
    fn bus_error_from_validation_is_not_retryable() {
        let err: BusError = ValidationError::MissingField {
            field: "window_config".to_string(),
        }
        .into();
        assert!(err.is_validation());
        assert!(!err.is_retryable());
    }

    #[test]
    fn queue_full_and_timeout_are_retryable() {
        let full: BusError = ExecutionError::QueueFull {
            path: "ingress".to_string(),
            capacity: 1024,
        }
        .into();
        assert!(full.is_retryable());

        let timeout: BusError = ExecutionError::Timeout { duration_ms: 250 }.into();
        assert!(timeout.is_retryable());

        let missing: BusError = ExecutionError::SubscriptionNotFound {
            subscription_id: "s".to_string(),
        }
        .into();
        assert!(!missing.is_retryable());
    }

    #[test]
    fn transport_io_is_retryable() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset");
        let err: BusError = TransportError::from(io).into();
        assert!(err.is_retryable());
    }

    #[test]
    fn wire_errors_are_terminal() {
        let err: BusError = WireError::FrameTooLarge {
            len: 2 << 20,
            max: 1 << 20,
        }
        .into();
        assert!(err.is_wire());
        assert!(!err.is_retryable());
    }
}
