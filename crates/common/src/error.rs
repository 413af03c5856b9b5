use thiserror::Error;

/// Common error types used across the application.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Upstream error: {0}")]
    Upstream(String),

    #[error("Send error: {0}")]
    Send(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Idempotency guard error: {0}")]
    Guard(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// Errors raised by the persistent store. These abort the current unit of work.
    pub fn is_persistence(&self) -> bool {
        matches!(self, AppError::Database(_) | AppError::Persistence(_))
    }

    /// Errors raised by the idempotency backing store.
    pub fn is_guard(&self) -> bool {
        matches!(self, AppError::Guard(_) | AppError::Redis(_))
    }
}
