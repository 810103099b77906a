//! Durable cursor store.
//!
//! A single state file persists every follower's read position across
//! restarts. The file holds one logical bucket, `logfiles`, mapping a log
//! file path (or the reserved journal key) to an opaque cursor string.
//! Mutations are applied to an in-memory map under a lock and persisted by
//! writing a temporary sibling file and atomically renaming it over the live
//! one, so a crash can never leave a half-written state file behind.

use std::{collections::BTreeMap, fs, io, path::PathBuf, sync::Mutex};

use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};
use tracing::warn;

const TMP_FILE_SUFFIX: &str = ".new";

#[derive(Debug, Snafu)]
pub enum StorageError {
    #[snafu(display("unable to open cursor state file {}: {source}", path.display()))]
    Open { path: PathBuf, source: io::Error },

    #[snafu(display("unable to persist cursor state to {}: {source}", path.display()))]
    Persist { path: PathBuf, source: io::Error },

    #[snafu(display("unable to serialize cursor state: {source}"))]
    Serialize { source: serde_json::Error },
}

/// Serialized shape of the state file. The single `logfiles` bucket is kept
/// explicit so the file stays self-describing.
#[derive(Debug, Default, Serialize, Deserialize)]
struct State {
    logfiles: BTreeMap<String, String>,
}

/// Thread-safe cursor store over one state file. Callers may invoke any
/// operation from any task; operations are serialized internally.
#[derive(Debug)]
pub struct CursorStore {
    path: PathBuf,
    tmp_path: PathBuf,
    entries: Mutex<BTreeMap<String, String>>,
}

impl CursorStore {
    /// Opens the store, creating the state file if absent. An existing but
    /// unreadable state file is logged and treated as empty; I/O errors are
    /// fatal.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let path = path.into();
        let mut tmp_name = path
            .file_name()
            .map(|name| name.to_os_string())
            .unwrap_or_default();
        tmp_name.push(TMP_FILE_SUFFIX);
        let tmp_path = path.with_file_name(tmp_name);

        let entries = match fs::read(&path) {
            Ok(contents) => match serde_json::from_slice::<State>(&contents) {
                Ok(state) => state.logfiles,
                Err(error) => {
                    warn!(
                        message = "Unreadable cursor state file, starting empty.",
                        path = %path.display(),
                        %error,
                    );
                    BTreeMap::new()
                }
            },
            Err(error) if error.kind() == io::ErrorKind::NotFound => BTreeMap::new(),
            Err(source) => return Err(StorageError::Open { path, source }),
        };

        let store = Self {
            path,
            tmp_path,
            entries: Mutex::new(entries),
        };

        // Surface permission and disk problems at startup rather than on the
        // first commit.
        {
            let entries = store.entries.lock().expect("cursor store lock poisoned");
            store.persist(&entries)?;
        }

        Ok(store)
    }

    /// Returns the value under `key`, or the empty string if the key was
    /// never set.
    pub fn get(&self, key: &str) -> String {
        let entries = self.entries.lock().expect("cursor store lock poisoned");
        entries.get(key).cloned().unwrap_or_default()
    }

    pub fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        let mut entries = self.entries.lock().expect("cursor store lock poisoned");
        entries.insert(key.to_string(), value.to_string());
        self.persist(&entries)
    }

    /// Removes `key`. Deleting an absent key is not an error.
    pub fn delete(&self, key: &str) -> Result<(), StorageError> {
        let mut entries = self.entries.lock().expect("cursor store lock poisoned");
        if entries.remove(key).is_none() {
            return Ok(());
        }
        self.persist(&entries)
    }

    /// Returns all keys currently present.
    pub fn keys(&self) -> Vec<String> {
        let entries = self.entries.lock().expect("cursor store lock poisoned");
        entries.keys().cloned().collect()
    }

    /// Writes the current state out one final time.
    pub fn close(&self) -> Result<(), StorageError> {
        let entries = self.entries.lock().expect("cursor store lock poisoned");
        self.persist(&entries)
    }

    fn persist(&self, entries: &BTreeMap<String, String>) -> Result<(), StorageError> {
        let state = State {
            logfiles: entries.clone(),
        };
        let contents = serde_json::to_vec(&state).context(SerializeSnafu)?;

        fs::write(&self.tmp_path, contents).context(PersistSnafu {
            path: self.tmp_path.clone(),
        })?;
        fs::rename(&self.tmp_path, &self.path).context(PersistSnafu {
            path: self.path.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_key_reads_as_empty_string() {
        let dir = tempfile::tempdir().unwrap();
        let store = CursorStore::open(dir.path().join("cursors.pos")).unwrap();

        assert_eq!(store.get("/var/log/pods/a.log"), "");
        assert!(store.keys().is_empty());
    }

    #[test]
    fn set_get_delete_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = CursorStore::open(dir.path().join("cursors.pos")).unwrap();

        store.set("/a.log", "1;2;3").unwrap();
        store.set("/b.log", "4;5;6").unwrap();

        assert_eq!(store.get("/a.log"), "1;2;3");
        assert_eq!(store.keys(), vec!["/a.log".to_string(), "/b.log".into()]);

        store.delete("/a.log").unwrap();
        assert_eq!(store.get("/a.log"), "");
        store.delete("/a.log").unwrap();
    }

    #[test]
    fn state_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cursors.pos");

        {
            let store = CursorStore::open(&path).unwrap();
            store.set("system.journal", "opaque-token").unwrap();
            store.set("/a.log", "7;8;9").unwrap();
            store.close().unwrap();
        }

        let store = CursorStore::open(&path).unwrap();
        assert_eq!(store.get("system.journal"), "opaque-token");
        assert_eq!(store.get("/a.log"), "7;8;9");
    }

    #[test]
    fn corrupt_state_file_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cursors.pos");
        fs::write(&path, b"not json at all").unwrap();

        let store = CursorStore::open(&path).unwrap();
        assert!(store.keys().is_empty());
    }
}
