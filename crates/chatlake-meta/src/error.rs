use thiserror::Error;

#[derive(Debug, Error)]
pub enum MetaError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Write lock unavailable: {0}")]
    Lock(String),

    #[error("Encoding error: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("Run not found: {id}")]
    RunNotFound { id: String },
}

pub type Result<T> = std::result::Result<T, MetaError>;
