use figment::{
    providers::{Env, Format, Json},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Port the daemon's HTTP API binds by default.
pub const DEFAULT_PORT: u16 = 4200;
/// Lowest port handed out to minds and variants.
pub const DEFAULT_BASE_PORT: u16 = 4100;
pub const DEFAULT_HOSTNAME: &str = "127.0.0.1";

/// Top-level daemon config (`<home>/daemon.json` + `VOLUTE_*` env overrides).
///
/// Unknown keys are tolerated so older daemons can read configs written by
/// newer ones.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_hostname")]
    pub hostname: String,
    /// Bearer token for CLI and connector clients. Generated on first boot
    /// and written back so it survives restarts.
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default = "default_base_port")]
    pub base_port: u16,
    #[serde(default)]
    pub mind: MindSpawnConfig,
    /// When true, state directories are chowned to a per-mind OS user at
    /// spawn time.
    #[serde(default)]
    pub os_user_isolation: bool,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            hostname: DEFAULT_HOSTNAME.to_string(),
            token: None,
            base_port: DEFAULT_BASE_PORT,
            mind: MindSpawnConfig::default(),
            os_user_isolation: false,
        }
    }
}

/// How mind child processes are launched.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MindSpawnConfig {
    /// Program run inside the mind's working directory. The same string is
    /// what stale-PID reconciliation requires in a candidate's command line
    /// before it will kill anything.
    #[serde(default = "default_mind_command")]
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
}

impl Default for MindSpawnConfig {
    fn default() -> Self {
        Self {
            command: default_mind_command(),
            args: Vec::new(),
        }
    }
}

fn default_port() -> u16 {
    DEFAULT_PORT
}
fn default_hostname() -> String {
    DEFAULT_HOSTNAME.to_string()
}
fn default_base_port() -> u16 {
    DEFAULT_BASE_PORT
}
fn default_mind_command() -> String {
    "volute-mind".to_string()
}

impl DaemonConfig {
    /// Load from a JSON file with `VOLUTE_*` env var overrides. A missing
    /// file yields the defaults; a malformed one is an error.
    pub fn load(path: &Path) -> crate::Result<Self> {
        let config: DaemonConfig = Figment::new()
            .merge(Json::file(path))
            .merge(Env::prefixed("VOLUTE_"))
            .extract()
            .map_err(|e| crate::CoreError::Config(e.to_string()))?;
        Ok(config)
    }

    /// Ensure a bearer token exists, generating and persisting one on first
    /// boot. Returns the active token.
    pub fn ensure_token(&mut self, path: &Path) -> crate::Result<String> {
        if let Some(token) = &self.token {
            return Ok(token.clone());
        }
        let token = generate_token();
        self.token = Some(token.clone());
        self.save(path)?;
        Ok(token)
    }

    /// Write the config back to disk (temp file then rename, same directory).
    pub fn save(&self, path: &Path) -> crate::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self)?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }

    /// `scheme://host:port` of the daemon itself, for CSRF origin checks.
    pub fn origin(&self) -> String {
        format!("http://{}:{}", self.hostname, self.port)
    }
}

/// Random 256-bit hex token.
fn generate_token() -> String {
    format!(
        "{}{}",
        uuid::Uuid::new_v4().simple(),
        uuid::Uuid::new_v4().simple()
    )
}

/// Per-mind config (`<mind dir>/volute.json`). Unknown keys are ignored.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MindConfig {
    #[serde(default)]
    pub schedules: Vec<ScheduleConfig>,
}

impl MindConfig {
    /// Load the mind's config file, returning the empty default when the
    /// file does not exist.
    pub fn load(path: &Path) -> crate::Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(raw) => Ok(serde_json::from_str(&raw)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e.into()),
        }
    }
}

/// One cron-driven trigger owned by a mind.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleConfig {
    pub id: String,
    pub cron: String,
    #[serde(default = "bool_true")]
    pub enabled: bool,
    /// Literal message text, used when no script is set.
    #[serde(default)]
    pub message: Option<String>,
    /// Script run in the mind's home directory; its stdout becomes the
    /// message text.
    #[serde(default)]
    pub script: Option<String>,
}

fn bool_true() -> bool {
    true
}
