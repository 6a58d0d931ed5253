use thiserror::Error;

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("delivery failed: {0}")]
    Delivery(String),

    #[error("parse error: {0}")]
    Parse(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("token refresh failed for inbox {inbox_id}: {reason}")]
    TokenRefresh { inbox_id: i64, reason: String },

    #[error("internal error: {0}")]
    Internal(String),
}

impl ChannelError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn auth(msg: impl Into<String>) -> Self {
        Self::Auth(msg.into())
    }

    pub fn network(msg: impl Into<String>) -> Self {
        Self::Network(msg.into())
    }

    pub fn delivery(msg: impl Into<String>) -> Self {
        Self::Delivery(msg.into())
    }

    pub fn parse(msg: impl Into<String>) -> Self {
        Self::Parse(msg.into())
    }

    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn token_refresh(inbox_id: i64, reason: impl Into<String>) -> Self {
        Self::TokenRefresh {
            inbox_id,
            reason: reason.into(),
        }
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Stable tag for log correlation.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Config(_) => "CONFIG_ERROR",
            Self::Auth(_) => "AUTH_ERROR",
            Self::Network(_) => "NETWORK_ERROR",
            Self::Delivery(_) => "DELIVERY_ERROR",
            Self::Parse(_) => "PARSE_ERROR",
            Self::Storage(_) => "STORAGE_ERROR",
            Self::NotFound(_) => "NOT_FOUND",
            Self::TokenRefresh { .. } => "TOKEN_REFRESH_ERROR",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// Whether a later attempt could plausibly succeed without operator
    /// intervention. Configuration and credential errors are not transient;
    /// retrying them only repeats the failure.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Network(_) | Self::Delivery(_) | Self::Storage(_) | Self::Internal(_)
        )
    }
}
