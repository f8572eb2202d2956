use crate::frames::ProtocolFault;

/// The outcome of a failed session operation. Every suspended operation observes exactly one
///  of these when the session reaches a terminal state.
#[derive(Debug, Clone, Eq, PartialEq, thiserror::Error)]
pub enum SessionError {
    #[error("the next sequence number would exceed the rollover limit")]
    Rollover,
    #[error("protocol fault: {0}")]
    ProtocolFault(ProtocolFault),
    #[error("quota exceeded: {0}")]
    QuotaExceeded(String),
    #[error("operation timed out")]
    Timeout,
    #[error("operation was cancelled")]
    Cancelled,
    #[error("maximum number of retries exceeded (last transport error: {})", .0.as_deref().unwrap_or("none"))]
    MaxRetryExceeded(Option<String>),
    #[error("session was aborted")]
    Aborted,
    #[error("session is closed")]
    Closed,
    #[error("session faulted: {0}")]
    Faulted(Box<SessionError>),
    #[error("invalid operation: {0}")]
    InvalidOperation(&'static str),
    #[error("transport error: {0}")]
    Transport(String),
}

impl SessionError {
    /// wraps a cause so that callers can tell a faulted session from the fault's immediate
    ///  outcome
    pub fn faulted(cause: SessionError) -> SessionError {
        match cause {
            SessionError::Faulted(_) => cause,
            other => SessionError::Faulted(Box::new(other)),
        }
    }
}

pub type SessionResult<T> = Result<T, SessionError>;
