use thiserror::Error;

pub type LimiterResult<T> = Result<T, LimiterError>;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum LimiterError {
    #[error("invalid rate limit configuration: {0}")]
    Configuration(String),
    #[error("bucket store unavailable: {0}")]
    StoreUnavailable(String),
    #[error("malformed bucket state: {0}")]
    Encoding(String),
    #[error("unknown rate limit class: {0}")]
    UnknownClass(String),
}

impl LimiterError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::Configuration(_) => "configuration_error",
            Self::StoreUnavailable(_) => "store_unavailable",
            Self::Encoding(_) => "encoding_error",
            Self::UnknownClass(_) => "unknown_class",
        }
    }
}

impl From<redis::RedisError> for LimiterError {
    fn from(err: redis::RedisError) -> Self {
        Self::StoreUnavailable(err.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for LimiterError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        Self::StoreUnavailable("store operation timed out".to_string())
    }
}
