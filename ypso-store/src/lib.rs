//! Key/value persistence seam for the YpsoPump engine.
//!
//! Everything the engine must remember across restarts (session keys,
//! counters, the paired device, the relay URL) goes through the [`Store`]
//! trait so hosts can back it with whatever they have. [`FileStore`]
//! persists to a single JSON file; [`MemoryStore`] backs the test suites.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use thiserror::Error;

/// Well-known store keys, grouped by namespace.
pub mod keys {
    // crypto: the symmetric session
    pub const SHARED_KEY: &str = "crypto.shared_key";
    pub const SHARED_KEY_EXPIRES_AT: &str = "crypto.shared_key_expires_at";
    pub const READ_COUNTER: &str = "crypto.read_counter";
    pub const WRITE_COUNTER: &str = "crypto.write_counter";
    pub const REBOOT_COUNTER: &str = "crypto.reboot_counter";

    // key_exchange: device identity towards the relay
    pub const DEVICE_ID: &str = "key_exchange.device_id";
    pub const X25519_PRIV: &str = "key_exchange.x25519_priv";
    pub const X25519_PUB: &str = "key_exchange.x25519_pub_raw";
    pub const RELAY_URL: &str = "key_exchange.relay_url";

    // device: the paired pump
    pub const DEVICE_MAC: &str = "device.device_mac";
    pub const DEVICE_NAME: &str = "device.device_name";
    pub const DEVICE_SERIAL: &str = "device.device_serial";
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store io: {0}")]
    Io(#[from] std::io::Error),
    #[error("store entry for {key} is not valid {expected}")]
    Corrupt { key: String, expected: &'static str },
}

/// Persistent key/value storage.
///
/// Implementations must be usable behind a shared reference; writes from
/// this engine are already serialized by the command mutex above it.
pub trait Store: Send + Sync {
    fn get_bytes(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;
    fn put_bytes(&self, key: &str, value: &[u8]) -> Result<(), StoreError>;
    fn get_u64(&self, key: &str) -> Result<Option<u64>, StoreError>;
    fn put_u64(&self, key: &str, value: u64) -> Result<(), StoreError>;
    fn get_string(&self, key: &str) -> Result<Option<String>, StoreError>;
    fn put_string(&self, key: &str, value: &str) -> Result<(), StoreError>;
    fn remove(&self, key: &str) -> Result<(), StoreError>;
}

/// In-memory store for tests and throwaway sessions.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn encode_bytes(value: &[u8]) -> String {
    data_encoding::HEXLOWER.encode(value)
}

fn decode_bytes(key: &str, raw: &str) -> Result<Vec<u8>, StoreError> {
    data_encoding::HEXLOWER
        .decode(raw.as_bytes())
        .map_err(|_| StoreError::Corrupt { key: key.to_string(), expected: "hex" })
}

fn decode_u64(key: &str, raw: &str) -> Result<u64, StoreError> {
    raw.parse()
        .map_err(|_| StoreError::Corrupt { key: key.to_string(), expected: "u64" })
}

impl Store for MemoryStore {
    fn get_bytes(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        self.entries
            .lock()
            .unwrap()
            .get(key)
            .map(|raw| decode_bytes(key, raw))
            .transpose()
    }

    fn put_bytes(&self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        self.entries
            .lock()
            .unwrap()
            .insert(key.to_string(), encode_bytes(value));
        Ok(())
    }

    fn get_u64(&self, key: &str) -> Result<Option<u64>, StoreError> {
        self.entries
            .lock()
            .unwrap()
            .get(key)
            .map(|raw| decode_u64(key, raw))
            .transpose()
    }

    fn put_u64(&self, key: &str, value: u64) -> Result<(), StoreError> {
        self.entries
            .lock()
            .unwrap()
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn get_string(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.entries.lock().unwrap().get(key).cloned())
    }

    fn put_string(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.entries
            .lock()
            .unwrap()
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        self.entries.lock().unwrap().remove(key);
        Ok(())
    }
}

/// JSON-file-backed store. The whole map is rewritten on every put, which
/// is fine at the handful-of-keys scale this engine uses.
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    entries: Mutex<HashMap<String, String>>,
}

impl FileStore {
    /// Open a store at `path`, loading existing entries if the file is
    /// present.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let entries = if path.exists() {
            let raw = std::fs::read_to_string(&path)?;
            serde_json::from_str(&raw).map_err(|_| StoreError::Corrupt {
                key: path.display().to_string(),
                expected: "json object",
            })?
        } else {
            HashMap::new()
        };
        Ok(Self { path, entries: Mutex::new(entries) })
    }

    fn save(&self, entries: &HashMap<String, String>) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let raw = serde_json::to_string_pretty(entries).expect("string map serializes");
        std::fs::write(&self.path, raw)?;
        Ok(())
    }

    fn put_raw(&self, key: &str, value: String) -> Result<(), StoreError> {
        let mut entries = self.entries.lock().unwrap();
        entries.insert(key.to_string(), value);
        self.save(&entries)
    }
}

impl Store for FileStore {
    fn get_bytes(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        self.entries
            .lock()
            .unwrap()
            .get(key)
            .map(|raw| decode_bytes(key, raw))
            .transpose()
    }

    fn put_bytes(&self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        self.put_raw(key, encode_bytes(value))
    }

    fn get_u64(&self, key: &str) -> Result<Option<u64>, StoreError> {
        self.entries
            .lock()
            .unwrap()
            .get(key)
            .map(|raw| decode_u64(key, raw))
            .transpose()
    }

    fn put_u64(&self, key: &str, value: u64) -> Result<(), StoreError> {
        self.put_raw(key, value.to_string())
    }

    fn get_string(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.entries.lock().unwrap().get(key).cloned())
    }

    fn put_string(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.put_raw(key, value.to_string())
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        let mut entries = self.entries.lock().unwrap();
        entries.remove(key);
        self.save(&entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_store_roundtrips() {
        let store = MemoryStore::new();
        store.put_bytes(keys::SHARED_KEY, &[0xAB; 32]).unwrap();
        store.put_u64(keys::WRITE_COUNTER, 41).unwrap();
        store.put_string(keys::RELAY_URL, "https://relay.example").unwrap();

        assert_eq!(store.get_bytes(keys::SHARED_KEY).unwrap(), Some(vec![0xAB; 32]));
        assert_eq!(store.get_u64(keys::WRITE_COUNTER).unwrap(), Some(41));
        assert_eq!(
            store.get_string(keys::RELAY_URL).unwrap().as_deref(),
            Some("https://relay.example")
        );

        store.remove(keys::SHARED_KEY).unwrap();
        assert_eq!(store.get_bytes(keys::SHARED_KEY).unwrap(), None);
        assert_eq!(store.get_u64(keys::READ_COUNTER).unwrap(), None);
    }

    #[test]
    fn corrupt_number_is_an_error() {
        let store = MemoryStore::new();
        store.put_string(keys::WRITE_COUNTER, "not a number").unwrap();
        assert!(store.get_u64(keys::WRITE_COUNTER).is_err());
    }

    #[test]
    fn file_store_survives_reopen() {
        let path = std::env::temp_dir().join(format!(
            "ypso-store-test-{}-{:?}.json",
            std::process::id(),
            std::thread::current().id()
        ));
        let _ = std::fs::remove_file(&path);

        {
            let store = FileStore::open(&path).unwrap();
            store.put_bytes(keys::SHARED_KEY, &[1, 2, 3]).unwrap();
            store.put_u64(keys::REBOOT_COUNTER, 7).unwrap();
        }
        {
            let store = FileStore::open(&path).unwrap();
            assert_eq!(store.get_bytes(keys::SHARED_KEY).unwrap(), Some(vec![1, 2, 3]));
            assert_eq!(store.get_u64(keys::REBOOT_COUNTER).unwrap(), Some(7));

            store.remove(keys::SHARED_KEY).unwrap();
        }
        {
            let store = FileStore::open(&path).unwrap();
            assert_eq!(store.get_bytes(keys::SHARED_KEY).unwrap(), None);
        }

        let _ = std::fs::remove_file(&path);
    }
}
