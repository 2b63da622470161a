//! On-disk layout of the daemon's home directory.
//!
//! ```text
//! <home>/
//!   daemon.json          config + token
//!   daemon.pid           daemon PID
//!   minds.json           registry
//!   variants.json        variant table
//!   volute.db            state store
//!   env.json             shared env
//!   scheduler-state.json last-fired memo
//!   crash-attempts.json  supervisor backoff counters
//!   state/<mind>/        per-mind state owned by the daemon
//! ```

use std::path::{Path, PathBuf};

/// Resolved home directory with typed accessors for everything the daemon
/// persists. Cheap to clone.
#[derive(Debug, Clone)]
pub struct VoluteHome {
    root: PathBuf,
}

impl VoluteHome {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Default location: `$VOLUTE_HOME`, falling back to `~/.volute`.
    pub fn resolve(explicit: Option<&str>) -> Self {
        if let Some(path) = explicit {
            return Self::new(path);
        }
        if let Ok(path) = std::env::var("VOLUTE_HOME") {
            if !path.is_empty() {
                return Self::new(path);
            }
        }
        let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
        Self::new(format!("{}/.volute", home))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn daemon_config(&self) -> PathBuf {
        self.root.join("daemon.json")
    }

    pub fn daemon_pid(&self) -> PathBuf {
        self.root.join("daemon.pid")
    }

    pub fn registry_file(&self) -> PathBuf {
        self.root.join("minds.json")
    }

    pub fn variants_file(&self) -> PathBuf {
        self.root.join("variants.json")
    }

    pub fn database(&self) -> PathBuf {
        self.root.join("volute.db")
    }

    pub fn shared_env_file(&self) -> PathBuf {
        self.root.join("env.json")
    }

    pub fn scheduler_state(&self) -> PathBuf {
        self.root.join("scheduler-state.json")
    }

    pub fn crash_attempts(&self) -> PathBuf {
        self.root.join("crash-attempts.json")
    }

    /// Directory holding every mind's working tree (`<home>/minds/<name>`).
    pub fn minds_dir(&self) -> PathBuf {
        self.root.join("minds")
    }

    pub fn mind_dir(&self, mind: &str) -> PathBuf {
        self.minds_dir().join(mind)
    }

    pub fn pages_dir(&self, mind: &str) -> PathBuf {
        self.mind_dir(mind).join("pages")
    }

    pub fn mind_config(&self, mind: &str) -> PathBuf {
        self.mind_dir(mind).join("volute.json")
    }

    /// Daemon-owned state for one mind (`<home>/state/<name>`).
    pub fn state_dir(&self, mind: &str) -> PathBuf {
        self.root.join("state").join(mind)
    }

    pub fn mind_pid(&self, mind: &str) -> PathBuf {
        self.state_dir(mind).join("mind.pid")
    }

    pub fn mind_env_file(&self, mind: &str) -> PathBuf {
        self.state_dir(mind).join("env.json")
    }

    pub fn mind_channels_file(&self, mind: &str) -> PathBuf {
        self.state_dir(mind).join("channels.json")
    }

    pub fn budget_file(&self, mind: &str) -> PathBuf {
        self.state_dir(mind).join("token-budget.json")
    }

    pub fn log_dir(&self, mind: &str) -> PathBuf {
        self.state_dir(mind).join("logs")
    }

    pub fn log_file(&self, mind: &str) -> PathBuf {
        self.log_dir(mind).join("mind.log")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_paths() {
        let home = VoluteHome::new("/tmp/vh");
        assert_eq!(home.registry_file(), PathBuf::from("/tmp/vh/minds.json"));
        assert_eq!(
            home.mind_pid("alice"),
            PathBuf::from("/tmp/vh/state/alice/mind.pid")
        );
        assert_eq!(
            home.log_file("alice"),
            PathBuf::from("/tmp/vh/state/alice/logs/mind.log")
        );
        assert_eq!(
            home.mind_config("alice"),
            PathBuf::from("/tmp/vh/minds/alice/volute.json")
        );
    }

    #[test]
    fn resolve_prefers_explicit() {
        let home = VoluteHome::resolve(Some("/opt/volute"));
        assert_eq!(home.root(), Path::new("/opt/volute"));
    }
}
