use thiserror::Error;

/// Failures raised while building or configuring the delivery core.
///
/// Delivery itself never fails with an error: every submitted envelope
/// resolves to an [`Outcome`](crate::Outcome).
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("invalid url '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("no tokio runtime available; construct the dispatcher inside a runtime")]
    NoRuntime,

    #[error("transport setup failed: {0}")]
    Transport(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Failures of the request/response exchanges made by the event builders.
#[derive(Debug, Error)]
pub enum EventError {
    #[error("server refused the request (status {status:?})")]
    Refused { status: Option<u16> },

    #[error("malformed response: {0}")]
    MalformedResponse(String),

    #[error(transparent)]
    Dispatch(#[from] DispatchError),
}

/// Failure of a single transport attempt.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("request timed out")]
    Timeout,

    #[error("network error: {0}")]
    Network(String),
}

impl TransportError {
    pub fn network(message: impl Into<String>) -> Self {
        TransportError::Network(message.into())
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, TransportError::Timeout)
    }
}

#[cfg(feature = "http")]
impl From<reqwest::Error> for TransportError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            TransportError::Timeout
        } else {
            TransportError::Network(e.to_string())
        }
    }
}
