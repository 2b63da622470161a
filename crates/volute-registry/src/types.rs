use serde::{Deserialize, Serialize};
use volute_core::types::Stage;

/// One registered mind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MindEntry {
    pub name: String,
    pub port: u16,
    /// RFC3339 creation timestamp.
    pub created: String,
    /// True when the supervisor owns a child for this mind, or intends to
    /// after a restart.
    #[serde(default)]
    pub running: bool,
    #[serde(default)]
    pub stage: Stage,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<String>,
}

/// An alternate branch of a mind with its own working directory and port.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariantEntry {
    pub mind: String,
    pub variant: String,
    pub branch: String,
    /// Filesystem path of the variant's working tree.
    pub path: String,
    pub port: u16,
    pub created: String,
}

impl VariantEntry {
    /// Canonical `base@variant` form used by the supervisor.
    pub fn canonical(&self) -> String {
        format!("{}@{}", self.mind, self.variant)
    }
}
