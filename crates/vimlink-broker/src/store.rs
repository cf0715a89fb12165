//! Small on-disk state shared with other processes: the last selected
//! instance and a snapshot of the connected instances.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{
    collections::BTreeMap,
    fs, io,
    path::{Path, PathBuf},
};

pub const PREFERENCE_FILE: &str = "vim-mcp-preference.txt";
pub const REGISTRY_FILE: &str = "vim-mcp-registry.json";

/// One entry of the registry snapshot, keyed by instance id.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InstanceRecord {
    pub pid: Option<u32>,
    pub cwd: Option<String>,
    pub main_file: Option<String>,
    pub buffers: Vec<Value>,
    pub started: String,
    pub last_seen: String,
}

pub type RegistrySnapshot = BTreeMap<String, InstanceRecord>;

pub trait BrokerStore: Send + Sync {
    fn load_preference(&self) -> io::Result<Option<String>>;
    fn save_preference(&self, instance_id: &str) -> io::Result<()>;
    fn save_registry(&self, snapshot: &RegistrySnapshot) -> io::Result<()>;
    fn clear_registry(&self) -> io::Result<()>;
}

#[derive(Debug, Clone)]
pub struct FileStore {
    preference_path: PathBuf,
    registry_path: PathBuf,
}

impl FileStore {
    pub fn new(state_dir: impl AsRef<Path>) -> Self {
        let dir = state_dir.as_ref();
        Self {
            preference_path: dir.join(PREFERENCE_FILE),
            registry_path: dir.join(REGISTRY_FILE),
        }
    }

    pub fn preference_path(&self) -> &Path {
        &self.preference_path
    }

    pub fn registry_path(&self) -> &Path {
        &self.registry_path
    }
}

impl BrokerStore for FileStore {
    fn load_preference(&self) -> io::Result<Option<String>> {
        match fs::read_to_string(&self.preference_path) {
            Ok(raw) => {
                let id = raw.trim();
                Ok((!id.is_empty()).then(|| id.to_string()))
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err),
        }
    }

    fn save_preference(&self, instance_id: &str) -> io::Result<()> {
        write_atomic(&self.preference_path, instance_id.as_bytes())
    }

    fn save_registry(&self, snapshot: &RegistrySnapshot) -> io::Result<()> {
        let payload = serde_json::to_vec_pretty(snapshot)
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
        write_atomic(&self.registry_path, &payload)
    }

    fn clear_registry(&self) -> io::Result<()> {
        match fs::remove_file(&self.registry_path) {
            Err(err) if err.kind() != io::ErrorKind::NotFound => Err(err),
            _ => Ok(()),
        }
    }
}

fn write_atomic(path: &Path, payload: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let temp_path = match path.file_name() {
        Some(name) => path.with_file_name(format!("{}.tmp", name.to_string_lossy())),
        None => path.with_extension("tmp"),
    };
    fs::write(&temp_path, payload)?;
    fs::rename(&temp_path, path)
}

/// In-process store for tests.
#[cfg(test)]
#[derive(Debug, Default)]
pub struct MemoryStore {
    pub preference: std::sync::Mutex<Option<String>>,
    pub registry: std::sync::Mutex<Option<RegistrySnapshot>>,
}

#[cfg(test)]
impl MemoryStore {
    pub fn with_preference(id: &str) -> Self {
        let store = Self::default();
        *store.preference.lock().expect("lock") = Some(id.to_string());
        store
    }

    pub fn saved_preference(&self) -> Option<String> {
        self.preference.lock().expect("lock").clone()
    }

    pub fn saved_ids(&self) -> Vec<String> {
        self.registry
            .lock()
            .expect("lock")
            .as_ref()
            .map(|snapshot| snapshot.keys().cloned().collect())
            .unwrap_or_default()
    }
}

#[cfg(test)]
impl BrokerStore for MemoryStore {
    fn load_preference(&self) -> io::Result<Option<String>> {
        Ok(self.saved_preference())
    }

    fn save_preference(&self, instance_id: &str) -> io::Result<()> {
        *self.preference.lock().expect("lock") = Some(instance_id.to_string());
        Ok(())
    }

    fn save_registry(&self, snapshot: &RegistrySnapshot) -> io::Result<()> {
        *self.registry.lock().expect("lock") = Some(snapshot.clone());
        Ok(())
    }

    fn clear_registry(&self) -> io::Result<()> {
        *self.registry.lock().expect("lock") = None;
        Ok(())
    }
}
