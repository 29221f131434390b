use thiserror::Error;

pub type StoreResult<T> = Result<T, StoreError>;

/// Errors from the blob store and the progress snapshot backends.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("record not found: {0}")]
    NotFound(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("backend error: {0}")]
    Backend(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        StoreError::Backend(format!("sql: {}", e))
    }
}

impl From<anyhow::Error> for StoreError {
    fn from(e: anyhow::Error) -> Self {
        StoreError::Backend(format!("kv: {:#}", e))
    }
}

/// Errors that can escape the verification engine. Everything else is
/// recovered into tool output strings or placeholder verifications.
#[derive(Debug, Error)]
pub enum VerifyError {
    #[error("missing required credential: {0}")]
    MissingCredential(&'static str),

    #[error("model error: {0}")]
    Model(String),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("progress actor for {0} is gone")]
    ActorGone(String),
}
