use thiserror::Error;

/// Errors that can occur in the state store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("{what} not found")]
    NotFound { what: String },

    #[error("username already taken: {0}")]
    UsernameTaken(String),

    #[error("channel name already taken: {0}")]
    ChannelTaken(String),

    #[error("password hashing error: {0}")]
    PasswordHash(String),

    #[error("invalid credentials")]
    InvalidCredentials,

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StoreError {
    pub(crate) fn not_found(what: impl Into<String>) -> Self {
        StoreError::NotFound { what: what.into() }
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;
