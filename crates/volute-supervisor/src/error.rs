use thiserror::Error;

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("mind not found: {0}")]
    UnknownMind(String),

    #[error("mind already running: {0}")]
    AlreadyRunning(String),

    #[error("mind not running: {0}")]
    NotRunning(String),

    #[error("daemon is shutting down")]
    ShuttingDown,

    #[error("mind {0} did not report listening within the startup window")]
    StartupTimeout(String),

    #[error("mind {name} exited during startup (code {code:?})")]
    StartupFailed { name: String, code: Option<i32> },

    /// Something unidentified owns the mind's port; refusing to kill it.
    #[error("port {port} is held by a process that is not a mind (pid {pid:?})")]
    PortConflict { port: u16, pid: Option<i32> },

    #[error("failed to spawn mind process: {0}")]
    Spawn(std::io::Error),

    #[error(transparent)]
    Registry(#[from] volute_registry::RegistryError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, SupervisorError>;
