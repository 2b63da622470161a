//! Env var files: shared (`<home>/env.json`) and per-mind
//! (`<home>/state/<mind>/env.json`), both flat JSON string maps.

use std::collections::HashMap;
use std::path::Path;

use tracing::warn;

/// Env vars the daemon always injects; user files cannot override them.
pub const VAR_MIND: &str = "VOLUTE_MIND";
pub const VAR_MIND_DIR: &str = "VOLUTE_MIND_DIR";
pub const VAR_STATE_DIR: &str = "VOLUTE_STATE_DIR";
pub const VAR_MIND_PORT: &str = "VOLUTE_MIND_PORT";

/// Reserved by a downstream SDK; always stripped from the child env.
pub const STRIPPED_VARS: &[&str] = &["CLAUDECODE"];

/// Read an env file, treating a missing or malformed file as empty.
pub fn read_env_file(path: &Path) -> HashMap<String, String> {
    match std::fs::read_to_string(path) {
        Ok(raw) => match serde_json::from_str(&raw) {
            Ok(map) => map,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "unparseable env file, ignoring");
                HashMap::new()
            }
        },
        Err(_) => HashMap::new(),
    }
}

/// Atomically replace an env file.
pub fn write_env_file(path: &Path, env: &HashMap<String, String>) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(env).unwrap_or_else(|_| "{}".to_string());
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, json)?;
    std::fs::rename(&tmp, path)
}

/// Merge shared and per-mind env, per-mind winning, and strip reserved vars.
pub fn merged_env(shared: &Path, per_mind: &Path) -> HashMap<String, String> {
    let mut env = read_env_file(shared);
    env.extend(read_env_file(per_mind));
    for var in STRIPPED_VARS {
        env.remove(*var);
    }
    env
}
