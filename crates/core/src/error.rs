use crate::protocol::OperationKind;

/// Result alias that carries the custom [`AudioWorkerError`] type.
pub type Result<T> = std::result::Result<T, AudioWorkerError>;

/// Common error type for the core crate.
///
/// The variants that describe how a dispatched request failed keep the exact
/// texts callers historically matched on, while still letting Rust callers
/// match structurally.
#[derive(Debug, thiserror::Error)]
pub enum AudioWorkerError {
    /// No worker is running, the service is disabled, or the environment does
    /// not support background workers.
    #[error("Worker not initialized")]
    NotInitialized,
    /// No response arrived within the configured window.
    #[error("Worker request timeout: {0}")]
    Timeout(OperationKind),
    /// The request was the oldest in flight when the queue ceiling was hit.
    #[error("Request dropped due to queue overflow")]
    QueueOverflow,
    /// The worker was terminated while the request was in flight.
    #[error("Worker terminated")]
    Terminated,
    /// The processing function reported a failure.
    #[error("{0}")]
    Worker(String),
    /// The message could not be handed to the worker.
    #[error("worker channel closed: {0}")]
    Disconnected(String),
    /// Timers require a tokio runtime and none was found.
    #[error("no tokio runtime available for worker timers")]
    NoRuntime,
    /// Degenerate input handed to a processing function.
    #[error("invalid input: {0}")]
    InvalidInput(&'static str),
    /// The worker received an operation name it does not know.
    #[error("Unknown message type: {0}")]
    UnknownOperation(String),
    /// Payload or result (de)serialization failed.
    #[error("{0}")]
    Codec(#[from] serde_json::Error),
    /// Free-form error message.
    #[error("{0}")]
    Message(String),
    /// Wrapper around standard IO errors.
    #[error("{0}")]
    Io(#[from] std::io::Error),
}

impl AudioWorkerError {
    /// Creates a new error that simply wraps the provided message.
    pub fn msg<T: Into<String>>(msg: T) -> Self {
        Self::Message(msg.into())
    }

    /// True when the request ran out of time waiting for the worker.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }

    /// True when the request was evicted to make room for newer work.
    pub fn is_overflow(&self) -> bool {
        matches!(self, Self::QueueOverflow)
    }

    /// True when the request was drained by a terminate.
    pub fn is_terminated(&self) -> bool {
        matches!(self, Self::Terminated)
    }
}

impl From<&str> for AudioWorkerError {
    fn from(value: &str) -> Self {
        Self::msg(value)
    }
}

impl From<String> for AudioWorkerError {
    fn from(value: String) -> Self {
        Self::Message(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dispatch_failures_keep_their_messages() {
        assert_eq!(
            AudioWorkerError::Timeout(OperationKind::DetectBeat).to_string(),
            "Worker request timeout: detectBeat"
        );
        assert_eq!(
            AudioWorkerError::QueueOverflow.to_string(),
            "Request dropped due to queue overflow"
        );
        assert_eq!(AudioWorkerError::Terminated.to_string(), "Worker terminated");
        assert_eq!(
            AudioWorkerError::NotInitialized.to_string(),
            "Worker not initialized"
        );
    }

    #[test]
    fn predicates_distinguish_kinds() {
        let timeout = AudioWorkerError::Timeout(OperationKind::ProcessFft);
        assert!(timeout.is_timeout());
        assert!(!timeout.is_overflow());
        assert!(AudioWorkerError::QueueOverflow.is_overflow());
        assert!(AudioWorkerError::Terminated.is_terminated());
        assert!(!AudioWorkerError::from("boom").is_terminated());
    }
}
