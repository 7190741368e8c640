use crate::cart::CartSnapshot;
use crate::errors::StorageError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::warn;

/// Key under which the cart state is stored
pub const STORAGE_KEY: &str = "saucy-storage";

/// Version written in the envelope. Blobs with another version are not loaded.
pub const STORAGE_VERSION: u32 = 0;

/// Trait hiding where the cart state lives
///
/// The store reads once when it is opened and writes after each mutation.
pub trait CartStorage {
    /// Read the stored state, `None` if nothing was ever saved
    fn load(&self) -> Result<Option<CartSnapshot>, StorageError>;

    /// Replace the stored state
    fn save(&mut self, snapshot: &CartSnapshot) -> Result<(), StorageError>;
}

#[derive(Serialize)]
struct Envelope<'a> {
    state: &'a CartSnapshot,
    version: u32,
}

#[derive(Deserialize)]
struct StoredEnvelope {
    state: CartSnapshot,
    #[serde(default)]
    version: u32,
}

fn encode(snapshot: &CartSnapshot) -> Result<String, StorageError> {
    Ok(serde_json::to_string(&Envelope {
        state: snapshot,
        version: STORAGE_VERSION,
    })?)
}

fn decode(blob: &str) -> Result<CartSnapshot, StorageError> {
    let envelope: StoredEnvelope = serde_json::from_str(blob)?;
    if envelope.version != STORAGE_VERSION {
        return Err(StorageError::UnsupportedVersion {
            found: envelope.version,
            expected: STORAGE_VERSION,
        });
    }
    Ok(envelope.state)
}

/// Key/value JSON file holding string blobs, one of them being the cart state
///
/// Other keys found in the file are kept untouched when saving.
pub struct JsonFileStorage {
    path: PathBuf,
    key: String,
}

type Entries = serde_json::Map<String, serde_json::Value>;

impl JsonFileStorage {
    pub fn new(path: impl Into<PathBuf>) -> JsonFileStorage {
        JsonFileStorage {
            path: path.into(),
            key: STORAGE_KEY.to_string(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_entries(&self) -> Result<Option<Entries>, StorageError> {
        match fs::read_to_string(&self.path) {
            Ok(content) => Ok(Some(serde_json::from_str(&content)?)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    /// Entries to write back on save
    ///
    /// A file that does not parse is moved to `<name>.json.corrupt` and replaced, otherwise
    /// every later save would fail on it.
    fn entries_for_save(&self) -> Result<Entries, StorageError> {
        match self.read_entries() {
            Ok(entries) => Ok(entries.unwrap_or_default()),
            Err(StorageError::Json(err)) => {
                let backup = self.path.with_extension("json.corrupt");
                warn!(
                    path = %self.path.display(),
                    backup = %backup.display(),
                    error = %err,
                    "Storage file is not valid JSON, moving it aside"
                );
                fs::rename(&self.path, &backup)?;
                Ok(Entries::new())
            }
            Err(err) => Err(err),
        }
    }
}

impl CartStorage for JsonFileStorage {
    fn load(&self) -> Result<Option<CartSnapshot>, StorageError> {
        let entries = match self.read_entries()? {
            Some(entries) => entries,
            None => return Ok(None),
        };
        match entries.get(&self.key) {
            Some(serde_json::Value::String(blob)) => decode(blob).map(Some),
            Some(other) => decode(&other.to_string()).map(Some),
            None => Ok(None),
        }
    }

    fn save(&mut self, snapshot: &CartSnapshot) -> Result<(), StorageError> {
        let mut entries = self.entries_for_save()?;
        entries.insert(self.key.clone(), serde_json::Value::String(encode(snapshot)?));

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        // Write next to the target and rename, a crash never leaves a truncated file
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(&entries)?)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

/// In-memory storage. Clones share the same entries, which lets a test reopen a store.
#[derive(Clone, Default)]
pub struct MemoryStorage {
    entries: Arc<Mutex<HashMap<String, String>>>,
}

impl MemoryStorage {
    /// Raw blob stored under `key`
    pub fn get(&self, key: &str) -> Option<String> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    /// Overwrite the raw blob stored under `key`
    pub fn put(&self, key: &str, blob: &str) {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_string(), blob.to_string());
    }
}

impl CartStorage for MemoryStorage {
    fn load(&self) -> Result<Option<CartSnapshot>, StorageError> {
        self.get(STORAGE_KEY).as_deref().map(decode).transpose()
    }

    fn save(&mut self, snapshot: &CartSnapshot) -> Result<(), StorageError> {
        let blob = encode(snapshot)?;
        self.put(STORAGE_KEY, &blob);
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::api::fixtures::item;
    use crate::api::CartLine;
    use crate::cart::CartStore;

    fn sample() -> CartSnapshot {
        let mut snapshot = CartSnapshot::default();
        let json = serde_json::json!({
            "A": CartLine::new(item("A", 5.0), 2),
            "B": CartLine::new(item("B", 3.5), 1),
        });
        snapshot.cart = serde_json::from_value(json).unwrap();
        snapshot.favorites = vec!["B".to_string()];
        snapshot
    }

    #[test]
    fn test_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let mut storage = JsonFileStorage::new(dir.path().join("nested").join("storage.json"));

        assert!(storage.load().unwrap().is_none());
        storage.save(&sample()).unwrap();
        assert_eq!(storage.load().unwrap(), Some(sample()));
    }

    #[test]
    fn test_file_keeps_other_keys() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("storage.json");
        fs::write(&path, r#"{"theme": "dark"}"#).unwrap();

        let mut storage = JsonFileStorage::new(&path);
        storage.save(&sample()).unwrap();

        let entries: Entries = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(entries["theme"], "dark");
        assert!(entries[STORAGE_KEY].is_string());
    }

    #[test]
    fn test_corrupt_file_is_replaced_on_save() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("storage.json");
        fs::write(&path, "{ truncated").unwrap();

        let mut store = CartStore::open(Box::new(JsonFileStorage::new(&path)));
        assert!(store.cart().is_empty());
        store.add_item(&item("A", 5.0));

        let reopened = CartStore::open(Box::new(JsonFileStorage::new(&path)));
        assert_eq!(reopened.cart().len(), 1);
        assert_eq!(reopened.total_items(), 1);
        assert_eq!(
            fs::read_to_string(dir.path().join("storage.json.corrupt")).unwrap(),
            "{ truncated"
        );
    }

    #[test]
    fn test_blob_layout() {
        let mut storage = MemoryStorage::default();
        storage.save(&sample()).unwrap();

        let blob: serde_json::Value =
            serde_json::from_str(&storage.get(STORAGE_KEY).unwrap()).unwrap();
        assert_eq!(blob["version"], STORAGE_VERSION);
        assert_eq!(blob["state"]["cart"]["A"]["quantity"], 2);
        assert_eq!(blob["state"]["favorites"][0], "B");
    }

    #[test]
    fn test_unknown_version_is_refused() {
        let storage = MemoryStorage::default();
        storage.put(STORAGE_KEY, r#"{"state": {"cart": {}, "favorites": []}, "version": 3}"#);
        assert!(matches!(
            storage.load(),
            Err(StorageError::UnsupportedVersion { found: 3, .. })
        ));
    }
}
