use thiserror::Error;

/// Engine-wide error taxonomy. Variants map one-to-one onto HTTP statuses at
/// the API boundary; everything unexpected funnels through `Internal`.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("validation: {0}")]
    Validation(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("gone: {0}")]
    Gone(String),

    #[error("exhausted: {0}")]
    Exhausted(String),

    #[error("database: {0}")]
    Database(#[from] diesel::result::Error),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl EngineError {
    pub fn validation(msg: impl Into<String>) -> Self {
        EngineError::Validation(msg.into())
    }

    pub fn unauthorized(msg: impl Into<String>) -> Self {
        EngineError::Unauthorized(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        EngineError::NotFound(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        EngineError::Conflict(msg.into())
    }

    pub fn gone(msg: impl Into<String>) -> Self {
        EngineError::Gone(msg.into())
    }

    pub fn exhausted(msg: impl Into<String>) -> Self {
        EngineError::Exhausted(msg.into())
    }

    /// Short machine code used in API error bodies and logs.
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::Validation(_) => "validation",
            EngineError::Unauthorized(_) => "unauthorized",
            EngineError::NotFound(_) => "not_found",
            EngineError::Conflict(_) => "conflict",
            EngineError::Gone(_) => "gone",
            EngineError::Exhausted(_) => "exhausted",
            EngineError::Database(_) | EngineError::Internal(_) => "internal",
        }
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
