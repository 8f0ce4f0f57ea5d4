use thiserror::Error;

#[derive(Debug, Error)]
pub enum TaskdistError {
    #[error("io error: {0}")]
    Io(String),
    #[error("config parse error: {0}")]
    ConfigParse(String),
    #[error("invalid config: {0}")]
    InvalidConfig(String),
    #[error("cli error: {0}")]
    Cli(String),
    #[error("database error: {0}")]
    Database(String),
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("forbidden: {0}")]
    Forbidden(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("coordination store unavailable: {0}")]
    TransientUnavailable(String),
}

impl TaskdistError {
    /// Errors a client may retry without changing its request.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Database(_) | Self::TransientUnavailable(_))
    }
}
