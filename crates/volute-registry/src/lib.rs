//! Durable registry of minds and their assigned ports.
//!
//! Backed by two JSON files under the daemon home (`minds.json` and
//! `variants.json`), rewritten atomically on every mutation. Minds and
//! variants share one port namespace.

mod error;
mod types;

pub use error::{RegistryError, Result};
pub use types::{MindEntry, VariantEntry};

use std::path::PathBuf;
use std::sync::Mutex;

use tracing::warn;
use volute_core::types::Stage;

const MAX_NAME_LEN: usize = 64;

/// `^[A-Za-z0-9][A-Za-z0-9._-]*$`, 1..=64 chars.
pub fn valid_mind_name(name: &str) -> bool {
    if name.is_empty() || name.len() > MAX_NAME_LEN {
        return false;
    }
    let mut chars = name.chars();
    let first = chars.next().unwrap();
    if !first.is_ascii_alphanumeric() {
        return false;
    }
    chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
}

#[derive(Debug, Default)]
struct Inner {
    entries: Vec<MindEntry>,
    variants: Vec<VariantEntry>,
}

/// Thread-safe registry handle. All mutations write through to disk before
/// returning; write failures propagate to the caller.
pub struct Registry {
    minds_file: PathBuf,
    variants_file: PathBuf,
    base_port: u16,
    inner: Mutex<Inner>,
}

impl Registry {
    /// Open the registry, loading both files. Unreadable or malformed files
    /// are treated as empty so a damaged registry never blocks boot.
    pub fn open(minds_file: PathBuf, variants_file: PathBuf, base_port: u16) -> Self {
        let entries = load_json_list(&minds_file);
        let variants = load_json_list(&variants_file);
        Self {
            minds_file,
            variants_file,
            base_port,
            inner: Mutex::new(Inner { entries, variants }),
        }
    }

    pub fn list(&self) -> Vec<MindEntry> {
        self.inner.lock().unwrap().entries.clone()
    }

    pub fn find(&self, name: &str) -> Option<MindEntry> {
        self.inner
            .lock()
            .unwrap()
            .entries
            .iter()
            .find(|e| e.name == name)
            .cloned()
    }

    /// Register a new mind. The port must not collide with any entry or
    /// variant.
    pub fn add(
        &self,
        name: &str,
        port: u16,
        stage: Stage,
        template: Option<String>,
    ) -> Result<MindEntry> {
        if !valid_mind_name(name) {
            return Err(RegistryError::InvalidName(name.to_string()));
        }
        let mut inner = self.inner.lock().unwrap();
        if inner.entries.iter().any(|e| e.name == name) {
            return Err(RegistryError::DuplicateName(name.to_string()));
        }
        if port_in_use(&inner, port) {
            return Err(RegistryError::PortInUse(port));
        }
        let entry = MindEntry {
            name: name.to_string(),
            port,
            created: chrono::Utc::now().to_rfc3339(),
            running: false,
            stage,
            template,
        };
        inner.entries.push(entry.clone());
        self.persist_minds(&inner)?;
        Ok(entry)
    }

    pub fn remove(&self, name: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let before = inner.entries.len();
        inner.entries.retain(|e| e.name != name);
        if inner.entries.len() == before {
            return Err(RegistryError::NotFound(name.to_string()));
        }
        // A removed mind takes its variants with it.
        inner.variants.retain(|v| v.mind != name);
        self.persist_minds(&inner)?;
        self.persist_variants(&inner)?;
        Ok(())
    }

    pub fn set_running(&self, name: &str, running: bool) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let entry = inner
            .entries
            .iter_mut()
            .find(|e| e.name == name)
            .ok_or_else(|| RegistryError::NotFound(name.to_string()))?;
        entry.running = running;
        self.persist_minds(&inner)
    }

    pub fn set_stage(&self, name: &str, stage: Stage) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let entry = inner
            .entries
            .iter_mut()
            .find(|e| e.name == name)
            .ok_or_else(|| RegistryError::NotFound(name.to_string()))?;
        entry.stage = stage;
        self.persist_minds(&inner)
    }

    /// Smallest port >= base that no mind or variant holds.
    pub fn next_port(&self) -> u16 {
        let inner = self.inner.lock().unwrap();
        let mut port = self.base_port;
        while port_in_use(&inner, port) {
            port += 1;
        }
        port
    }

    // --- variants ----------------------------------------------------------

    pub fn list_variants(&self, mind: &str) -> Vec<VariantEntry> {
        self.inner
            .lock()
            .unwrap()
            .variants
            .iter()
            .filter(|v| v.mind == mind)
            .cloned()
            .collect()
    }

    pub fn find_variant(&self, mind: &str, variant: &str) -> Option<VariantEntry> {
        self.inner
            .lock()
            .unwrap()
            .variants
            .iter()
            .find(|v| v.mind == mind && v.variant == variant)
            .cloned()
    }

    /// Register a variant of an existing mind. Variant names follow the same
    /// rule as mind names; ports share the mind namespace.
    pub fn add_variant(
        &self,
        mind: &str,
        variant: &str,
        branch: &str,
        path: &str,
        port: u16,
    ) -> Result<VariantEntry> {
        if !valid_mind_name(variant) {
            return Err(RegistryError::InvalidName(variant.to_string()));
        }
        let mut inner = self.inner.lock().unwrap();
        if !inner.entries.iter().any(|e| e.name == mind) {
            return Err(RegistryError::NotFound(mind.to_string()));
        }
        if inner
            .variants
            .iter()
            .any(|v| v.mind == mind && v.variant == variant)
        {
            return Err(RegistryError::DuplicateName(format!("{}@{}", mind, variant)));
        }
        if port_in_use(&inner, port) {
            return Err(RegistryError::PortInUse(port));
        }
        let entry = VariantEntry {
            mind: mind.to_string(),
            variant: variant.to_string(),
            branch: branch.to_string(),
            path: path.to_string(),
            port,
            created: chrono::Utc::now().to_rfc3339(),
        };
        inner.variants.push(entry.clone());
        self.persist_variants(&inner)?;
        Ok(entry)
    }

    pub fn remove_variant(&self, mind: &str, variant: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let before = inner.variants.len();
        inner
            .variants
            .retain(|v| !(v.mind == mind && v.variant == variant));
        if inner.variants.len() == before {
            return Err(RegistryError::VariantNotFound {
                mind: mind.to_string(),
                variant: variant.to_string(),
            });
        }
        self.persist_variants(&inner)
    }

    // --- persistence -------------------------------------------------------

    fn persist_minds(&self, inner: &Inner) -> Result<()> {
        write_json_atomic(&self.minds_file, &inner.entries)
    }

    fn persist_variants(&self, inner: &Inner) -> Result<()> {
        write_json_atomic(&self.variants_file, &inner.variants)
    }
}

fn port_in_use(inner: &Inner, port: u16) -> bool {
    inner.entries.iter().any(|e| e.port == port)
        || inner.variants.iter().any(|v| v.port == port)
}

fn load_json_list<T: serde::de::DeserializeOwned>(path: &std::path::Path) -> Vec<T> {
    match std::fs::read_to_string(path) {
        Ok(raw) => match serde_json::from_str(&raw) {
            Ok(list) => list,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "unparseable registry file, starting empty");
                Vec::new()
            }
        },
        Err(e) => {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %path.display(), error = %e, "unreadable registry file, starting empty");
            }
            Vec::new()
        }
    }
}

/// Write-to-temp-then-rename on the same filesystem.
fn write_json_atomic<T: serde::Serialize>(path: &std::path::Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(value)?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, json)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry(dir: &std::path::Path) -> Registry {
        Registry::open(dir.join("minds.json"), dir.join("variants.json"), 4100)
    }

    #[test]
    fn add_then_find_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let reg = registry(dir.path());

        reg.add("alice", 4100, Stage::Seed, None).unwrap();
        let entry = reg.find("alice").unwrap();
        assert_eq!(entry.port, 4100);
        assert_eq!(entry.stage, Stage::Seed);
        assert!(!entry.running);
    }

    #[test]
    fn add_remove_find_returns_none() {
        let dir = tempfile::tempdir().unwrap();
        let reg = registry(dir.path());

        reg.add("alice", 4100, Stage::Seed, None).unwrap();
        reg.remove("alice").unwrap();
        assert!(reg.find("alice").is_none());
    }

    #[test]
    fn duplicate_name_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let reg = registry(dir.path());

        reg.add("alice", 4100, Stage::Seed, None).unwrap();
        let err = reg.add("alice", 4101, Stage::Seed, None).unwrap_err();
        assert!(matches!(err, RegistryError::DuplicateName(_)));
    }

    #[test]
    fn invalid_names_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let reg = registry(dir.path());

        for bad in ["", ".alice", "-alice", "al ice", "al@ice", &"x".repeat(65)] {
            let err = reg.add(bad, 4100, Stage::Seed, None).unwrap_err();
            assert!(matches!(err, RegistryError::InvalidName(_)), "{:?}", bad);
        }
        assert!(valid_mind_name("a"));
        assert!(valid_mind_name("Alice.2_x-y"));
    }

    #[test]
    fn port_collision_rejected_across_variants() {
        let dir = tempfile::tempdir().unwrap();
        let reg = registry(dir.path());

        reg.add("alice", 4100, Stage::Sprouted, None).unwrap();
        reg.add_variant("alice", "exp", "exp-branch", "/tmp/alice-exp", 4101)
            .unwrap();

        let err = reg.add("bob", 4101, Stage::Seed, None).unwrap_err();
        assert!(matches!(err, RegistryError::PortInUse(4101)));
        let err = reg
            .add_variant("alice", "exp2", "b", "/tmp/x", 4100)
            .unwrap_err();
        assert!(matches!(err, RegistryError::PortInUse(4100)));
    }

    #[test]
    fn next_port_skips_entries_and_variants() {
        let dir = tempfile::tempdir().unwrap();
        let reg = registry(dir.path());

        assert_eq!(reg.next_port(), 4100);
        reg.add("alice", 4100, Stage::Seed, None).unwrap();
        reg.add("bob", 4101, Stage::Seed, None).unwrap();
        reg.add_variant("alice", "exp", "b", "/tmp/x", 4102).unwrap();
        assert_eq!(reg.next_port(), 4103);
    }

    #[test]
    fn state_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let reg = registry(dir.path());
            reg.add("alice", 4100, Stage::Seed, Some("default".into()))
                .unwrap();
            reg.set_running("alice", true).unwrap();
            reg.set_stage("alice", Stage::Sprouted).unwrap();
        }
        let reg = registry(dir.path());
        let entry = reg.find("alice").unwrap();
        assert!(entry.running);
        assert_eq!(entry.stage, Stage::Sprouted);
        assert_eq!(entry.template.as_deref(), Some("default"));
    }

    #[test]
    fn corrupt_file_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("minds.json"), "not json").unwrap();
        let reg = registry(dir.path());
        assert!(reg.list().is_empty());
    }

    #[test]
    fn removing_mind_drops_its_variants() {
        let dir = tempfile::tempdir().unwrap();
        let reg = registry(dir.path());

        reg.add("alice", 4100, Stage::Sprouted, None).unwrap();
        reg.add_variant("alice", "exp", "b", "/tmp/x", 4101).unwrap();
        reg.remove("alice").unwrap();
        assert!(reg.find_variant("alice", "exp").is_none());
        assert_eq!(reg.next_port(), 4100);
    }
}
