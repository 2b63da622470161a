//! Mind process supervision.
//!
//! Spawns each mind in its own process group, watches stdout for the
//! readiness line, pipes output into rotating logs, reconciles stale PID
//! files without ever killing an unrelated process, restarts crashed minds
//! with exponential backoff, and tears everything down on daemon shutdown.

pub mod env;
mod error;
mod logrot;
mod procinfo;
mod supervisor;

pub use error::{Result, SupervisorError};
pub use logrot::RotatingLog;
pub use procinfo::{find_port_owner, reconcile_stale_pid};
pub use supervisor::{MindSupervisor, MindTarget, Tuning};
