use thiserror::Error;

/// The custom error type for the application.
#[derive(Debug, Error)]
pub enum Error {
    /// An error originating from the sqlx library.
    #[error("SQLx error: {0}")]
    Sqlx(#[from] sqlx::Error),

    /// A database migration error.
    #[error("Migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    /// An error originating from IO operations.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A JSON serialization error.
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    /// A configuration error.
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    /// A not found error (resource does not exist).
    #[error("Not found: {0}")]
    NotFound(String),

    /// A conflict error (e.g. a sync operation is already running).
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Empty or malformed input (failed extraction, bad parameters).
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// No usable LLM provider at construction time. Fatal at startup.
    #[error("No LLM provider configured: {0}")]
    ProviderNotConfigured(String),

    /// An LLM call or response-parsing error.
    #[error("LLM error: {0}")]
    Llm(String),

    /// A mail provider error.
    #[error("Mail provider error: {0}")]
    Mail(String),

    /// An embedding or reranking service error.
    #[error("Embedding error: {0}")]
    Embedding(String),

    /// An internal server error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// A type alias for `Result<T, Error>` to simplify function signatures.
pub type Result<T> = std::result::Result<T, Error>;

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Error::Internal(format!("HTTP error: {}", e))
    }
}
