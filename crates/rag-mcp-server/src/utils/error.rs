use thiserror::Error;

use crate::security::rate_limit::RateLimitDenial;

/// JSON-RPC error codes surfaced by the dispatcher.
pub const RPC_INVALID_REQUEST: i32 = -32600;
pub const RPC_METHOD_NOT_FOUND: i32 = -32601;
pub const RPC_INVALID_PARAMS: i32 = -32602;
pub const RPC_INTERNAL_ERROR: i32 = -32603;
pub const RPC_RATE_LIMIT_EXCEEDED: i32 = -32001;

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Invalid params: {0}")]
    InvalidParams(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Rate limit exceeded")]
    RateLimited(Box<RateLimitDenial>),

    #[error("Provider error: {0}")]
    ProviderError(String),

    #[error("Store error: {0}")]
    StoreError(String),

    #[error("Identity error: {0}")]
    IdentityError(String),

    #[error("Internal error: {0}")]
    InternalError(String),
}

impl ServiceError {
    /// Numeric JSON-RPC code for this error.
    pub fn rpc_code(&self) -> i32 {
        match self {
            Self::InvalidRequest(_) => RPC_INVALID_REQUEST,
            Self::InvalidParams(_) | Self::NotFound(_) => RPC_INVALID_PARAMS,
            Self::RateLimited(_) => RPC_RATE_LIMIT_EXCEEDED,
            Self::ProviderError(_)
            | Self::StoreError(_)
            | Self::IdentityError(_)
            | Self::InternalError(_) => RPC_INTERNAL_ERROR,
        }
    }

    /// Message safe to return to the caller. Backend details stay in the logs.
    pub fn public_message(&self) -> String {
        match self {
            Self::InvalidRequest(msg) | Self::InvalidParams(msg) | Self::NotFound(msg) => {
                msg.clone()
            }
            Self::RateLimited(_) => "Rate limit exceeded".to_string(),
            Self::ProviderError(msg) => {
                tracing::error!("Provider error: {}", msg);
                "Internal error".to_string()
            }
            Self::StoreError(msg) => {
                tracing::error!("Store error: {}", msg);
                "Internal error".to_string()
            }
            Self::IdentityError(msg) => {
                tracing::error!("Identity error: {}", msg);
                "Internal error".to_string()
            }
            Self::InternalError(msg) => {
                tracing::error!("Internal error: {}", msg);
                "Internal error".to_string()
            }
        }
    }

    /// Stable machine-readable code recorded in usage logs.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::InvalidRequest(_) => "INVALID_REQUEST",
            Self::InvalidParams(_) => "INVALID_PARAMS",
            Self::NotFound(_) => "NOT_FOUND",
            Self::RateLimited(_) => "RATE_LIMIT_EXCEEDED",
            Self::ProviderError(_) => "PROVIDER_ERROR",
            Self::StoreError(_) => "STORE_ERROR",
            Self::IdentityError(_) => "IDENTITY_ERROR",
            Self::InternalError(_) => "INTERNAL_ERROR",
        }
    }

    /// HTTP-class status recorded in usage logs (the RPC response itself is
    /// always served with HTTP 200).
    pub fn status_code(&self) -> i16 {
        match self {
            Self::InvalidRequest(_) | Self::InvalidParams(_) => 400,
            Self::NotFound(_) => 404,
            Self::RateLimited(_) => 429,
            Self::ProviderError(_)
            | Self::StoreError(_)
            | Self::IdentityError(_)
            | Self::InternalError(_) => 500,
        }
    }
}
