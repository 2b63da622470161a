use thiserror::Error;

/// Errors from the mind registry.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// The name fails the `^[A-Za-z0-9][A-Za-z0-9._-]*$` (1..=64) rule.
    #[error("invalid mind name: {0:?}")]
    InvalidName(String),

    #[error("mind already exists: {0}")]
    DuplicateName(String),

    #[error("port {0} is already assigned")]
    PortInUse(u16),

    #[error("mind not found: {0}")]
    NotFound(String),

    #[error("variant not found: {mind}@{variant}")]
    VariantNotFound { mind: String, variant: String },

    /// Registry writes must not fail silently; loss of registry integrity is
    /// fatal to the caller.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, RegistryError>;
