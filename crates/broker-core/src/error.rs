use std::fmt;

/// Error kinds surfaced by the repository and queue.
///
/// Each variant maps to exactly one HTTP status at the control-plane layer;
/// see `broker-http::ApiError`.
#[derive(Debug)]
pub enum BrokerError {
    InvalidInput(String),
    NotFound(String),
    Unauthorized(String),
    Conflict(String),
    StoreUnavailable(String),
    Internal(String),
}

pub type Result<T> = std::result::Result<T, BrokerError>;

impl BrokerError {
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput(message.into())
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound(message.into())
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::Unauthorized(message.into())
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::Conflict(message.into())
    }

    pub fn store_unavailable(message: impl Into<String>) -> Self {
        Self::StoreUnavailable(message.into())
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    pub fn message(&self) -> &str {
        match self {
            Self::InvalidInput(m)
            | Self::NotFound(m)
            | Self::Unauthorized(m)
            | Self::Conflict(m)
            | Self::StoreUnavailable(m)
            | Self::Internal(m) => m,
        }
    }
}

impl fmt::Display for BrokerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message())
    }
}

impl std::error::Error for BrokerError {}
