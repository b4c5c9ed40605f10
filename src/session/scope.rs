//! Key-value storage scopes
//!
//! Sessions live in two tiers. The primary tier is ephemeral, cleared at
//! logical session end. The durable tier survives restarts and is only
//! consulted when the primary has nothing.

use dashmap::DashMap;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use super::error::SessionError;

pub trait KvScope: Send + Sync {
    fn read(&self, key: &str) -> Result<Option<String>, SessionError>;
    fn write(&self, key: &str, value: &str) -> Result<(), SessionError>;
    fn remove(&self, key: &str) -> Result<(), SessionError>;
    /// Drop every key in the scope
    fn clear(&self) -> Result<(), SessionError>;
}

/// In-process scope
#[derive(Default)]
pub struct MemoryScope {
    entries: DashMap<String, String>,
}

impl MemoryScope {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl KvScope for MemoryScope {
    fn read(&self, key: &str) -> Result<Option<String>, SessionError> {
        Ok(self.entries.get(key).map(|v| v.clone()))
    }

    fn write(&self, key: &str, value: &str) -> Result<(), SessionError> {
        self.entries.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), SessionError> {
        self.entries.remove(key);
        Ok(())
    }

    fn clear(&self) -> Result<(), SessionError> {
        self.entries.clear();
        Ok(())
    }
}

/// One JSON object file per user. Writes go to a temp file and are renamed
/// into place so a crash never leaves a half-written file.
pub struct FileScope {
    path: PathBuf,
    lock: Mutex<()>,
}

impl FileScope {
    /// Scope for `user_id` under `dir`; the directory is created if missing
    pub fn open(dir: impl AsRef<Path>, user_id: &str) -> Result<Self, SessionError> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir)?;
        let file_name: String = user_id
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        Ok(Self {
            path: dir.join(format!("{}.json", file_name)),
            lock: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(&self) -> Result<BTreeMap<String, String>, SessionError> {
        match fs::read(&self.path) {
            Ok(bytes) => serde_json::from_slice(&bytes).or_else(|e| {
                // unreadable file: start over rather than block every flow
                tracing::warn!(path = %self.path.display(), error = %e, "Discarding unreadable session file");
                Ok(BTreeMap::new())
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(BTreeMap::new()),
            Err(e) => Err(e.into()),
        }
    }

    fn store(&self, map: &BTreeMap<String, String>) -> Result<(), SessionError> {
        let bytes = serde_json::to_vec(map).map_err(|e| SessionError::Scope(e.to_string()))?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, bytes)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    fn modify<F>(&self, f: F) -> Result<(), SessionError>
    where
        F: FnOnce(&mut BTreeMap<String, String>),
    {
        let _guard = self
            .lock
            .lock()
            .map_err(|_| SessionError::Scope("session file lock poisoned".into()))?;
        let mut map = self.load()?;
        f(&mut map);
        self.store(&map)
    }
}

impl KvScope for FileScope {
    fn read(&self, key: &str) -> Result<Option<String>, SessionError> {
        let _guard = self
            .lock
            .lock()
            .map_err(|_| SessionError::Scope("session file lock poisoned".into()))?;
        Ok(self.load()?.remove(key))
    }

    fn write(&self, key: &str, value: &str) -> Result<(), SessionError> {
        self.modify(|map| {
            map.insert(key.to_string(), value.to_string());
        })
    }

    fn remove(&self, key: &str) -> Result<(), SessionError> {
        self.modify(|map| {
            map.remove(key);
        })
    }

    fn clear(&self) -> Result<(), SessionError> {
        self.modify(BTreeMap::clear)
    }
}
