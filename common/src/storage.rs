use std::{
    collections::BTreeMap,
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::Mutex,
};

use serde_json::Value;

use crate::error::StorageError;

pub const HC_URL_KEY: &str = "hc.url";

pub fn setpoint_key(zone: &str) -> String {
    format!("tset.{zone}")
}

pub fn relay_key(zone: &str) -> String {
    format!("rpin.{zone}")
}

pub trait Storage: Send + Sync {
    fn read_string(&self, key: &str) -> Result<Option<String>, StorageError>;
    fn write_string(&self, key: &str, value: &str) -> Result<(), StorageError>;
    fn read_i8(&self, key: &str) -> Result<Option<i8>, StorageError>;
    fn write_i8(&self, key: &str, value: i8) -> Result<(), StorageError>;
    fn remove(&self, key: &str) -> Result<(), StorageError>;
}

fn as_string(key: &str, value: Option<&Value>) -> Result<Option<String>, StorageError> {
    match value {
        None => Ok(None),
        Some(Value::String(text)) => Ok(Some(text.clone())),
        Some(_) => Err(StorageError::WrongType(key.to_string())),
    }
}

fn as_i8(key: &str, value: Option<&Value>) -> Result<Option<i8>, StorageError> {
    match value {
        None => Ok(None),
        Some(value) => value
            .as_i64()
            .and_then(|raw| i8::try_from(raw).ok())
            .map(Some)
            .ok_or_else(|| StorageError::WrongType(key.to_string())),
    }
}

#[derive(Debug, Default)]
pub struct MemoryStorage {
    entries: Mutex<BTreeMap<String, Value>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries
            .lock()
            .map(|entries| entries.contains_key(key))
            .unwrap_or(false)
    }
}

impl Storage for MemoryStorage {
    fn read_string(&self, key: &str) -> Result<Option<String>, StorageError> {
        let entries = self.entries.lock().unwrap_or_else(|err| err.into_inner());
        as_string(key, entries.get(key))
    }

    fn write_string(&self, key: &str, value: &str) -> Result<(), StorageError> {
        let mut entries = self.entries.lock().unwrap_or_else(|err| err.into_inner());
        entries.insert(key.to_string(), Value::String(value.to_string()));
        Ok(())
    }

    fn read_i8(&self, key: &str) -> Result<Option<i8>, StorageError> {
        let entries = self.entries.lock().unwrap_or_else(|err| err.into_inner());
        as_i8(key, entries.get(key))
    }

    fn write_i8(&self, key: &str, value: i8) -> Result<(), StorageError> {
        let mut entries = self.entries.lock().unwrap_or_else(|err| err.into_inner());
        entries.insert(key.to_string(), Value::from(value));
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StorageError> {
        let mut entries = self.entries.lock().unwrap_or_else(|err| err.into_inner());
        entries.remove(key);
        Ok(())
    }
}

/// Key-value store persisted as a single JSON object, rewritten on every change.
#[derive(Debug)]
pub struct FileStorage {
    path: PathBuf,
    entries: Mutex<BTreeMap<String, Value>>,
}

impl FileStorage {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let path = path.into();
        let entries = match std::fs::read(&path) {
            Ok(raw) => serde_json::from_slice(&raw)?,
            Err(err) if err.kind() == ErrorKind::NotFound => BTreeMap::new(),
            Err(err) => return Err(err.into()),
        };
        Ok(Self {
            path,
            entries: Mutex::new(entries),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn update(&self, apply: impl FnOnce(&mut BTreeMap<String, Value>)) -> Result<(), StorageError> {
        let mut entries = self.entries.lock().unwrap_or_else(|err| err.into_inner());
        apply(&mut entries);
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let payload = serde_json::to_vec_pretty(&*entries)?;
        std::fs::write(&self.path, payload)?;
        Ok(())
    }
}

impl Storage for FileStorage {
    fn read_string(&self, key: &str) -> Result<Option<String>, StorageError> {
        let entries = self.entries.lock().unwrap_or_else(|err| err.into_inner());
        as_string(key, entries.get(key))
    }

    fn write_string(&self, key: &str, value: &str) -> Result<(), StorageError> {
        self.update(|entries| {
            entries.insert(key.to_string(), Value::String(value.to_string()));
        })
    }

    fn read_i8(&self, key: &str) -> Result<Option<i8>, StorageError> {
        let entries = self.entries.lock().unwrap_or_else(|err| err.into_inner());
        as_i8(key, entries.get(key))
    }

    fn write_i8(&self, key: &str, value: i8) -> Result<(), StorageError> {
        self.update(|entries| {
            entries.insert(key.to_string(), Value::from(value));
        })
    }

    fn remove(&self, key: &str) -> Result<(), StorageError> {
        self.update(|entries| {
            entries.remove(key);
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_path(tag: &str) -> PathBuf {
        std::env::temp_dir()
            .join(format!("heatzone-storage-{tag}-{}", std::process::id()))
            .join("kv.json")
    }

    #[test]
    fn memory_storage_round_trips_typed_values() {
        let storage = MemoryStorage::new();
        storage.write_string("tset.bedroom", "22.5").unwrap();
        storage.write_i8("rpin.bedroom", 3).unwrap();

        assert_eq!(
            storage.read_string("tset.bedroom").unwrap().as_deref(),
            Some("22.5")
        );
        assert_eq!(storage.read_i8("rpin.bedroom").unwrap(), Some(3));
        assert!(storage.read_i8("tset.bedroom").is_err());

        storage.remove("rpin.bedroom").unwrap();
        assert_eq!(storage.read_i8("rpin.bedroom").unwrap(), None);
    }

    #[test]
    fn file_storage_survives_reopen() {
        let path = scratch_path("reopen");
        let _ = std::fs::remove_file(&path);

        {
            let storage = FileStorage::open(&path).unwrap();
            storage.write_string(HC_URL_KEY, "http://hc/hc?value=0").unwrap();
            storage.write_i8(&relay_key("hall"), 5).unwrap();
        }

        let storage = FileStorage::open(&path).unwrap();
        assert_eq!(
            storage.read_string(HC_URL_KEY).unwrap().as_deref(),
            Some("http://hc/hc?value=0")
        );
        assert_eq!(storage.read_i8(&relay_key("hall")).unwrap(), Some(5));

        let _ = std::fs::remove_dir_all(path.parent().unwrap());
    }
}
