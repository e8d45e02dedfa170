//! Storage shim: an opaque key-value contract shared by all rooms.
//!
//! Values are small strings (base64 keys, JSON blobs). Implementations
//! must be safe for concurrent access.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::warn;

/// Persisted key for the base64 multiparty identity secret.
pub const KEY_IDENTITY: &str = "mp";
/// Persisted key for the base64 pairwise-auth key.
pub const KEY_PAIRWISE: &str = "otr";
/// Persisted key for the display color.
pub const KEY_COLOR: &str = "color";
/// Persisted key for the JSON moderator fingerprint list.
pub const KEY_MODS: &str = "mods";
/// Persisted key for the JSON room-to-nick map used for auto-rejoin.
pub const KEY_ROOMS: &str = "rooms";

pub trait Database: Send + Sync {
    fn load(&self, key: &str) -> Option<String>;
    fn store(&self, key: &str, value: &str);
    fn delete(&self, key: &str);
}

/// Volatile in-process store; the default when no path is configured.
#[derive(Default)]
pub struct MemoryDb {
    map: Mutex<HashMap<String, String>>,
}

impl MemoryDb {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Database for MemoryDb {
    fn load(&self, key: &str) -> Option<String> {
        self.map.lock().expect("db lock poisoned").get(key).cloned()
    }

    fn store(&self, key: &str, value: &str) {
        self.map
            .lock()
            .expect("db lock poisoned")
            .insert(key.to_string(), value.to_string());
    }

    fn delete(&self, key: &str) {
        self.map.lock().expect("db lock poisoned").remove(key);
    }
}

/// One file per key under a base directory, filename = key.
///
/// Writes go to a temp file in the same directory and are renamed into
/// place, so a concurrent `load` sees either the old or the new value,
/// never a torn one. Same-key writers are last-writer-wins.
pub struct DiskDb {
    base: PathBuf,
}

impl DiskDb {
    pub fn open<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let base = path.as_ref().to_path_buf();
        fs::create_dir_all(&base)?;
        if !base.is_dir() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{} is not a directory", base.display()),
            ));
        }
        Ok(DiskDb { base })
    }

    fn key_path(&self, key: &str) -> PathBuf {
        self.base.join(key)
    }
}

impl Database for DiskDb {
    fn load(&self, key: &str) -> Option<String> {
        fs::read(self.key_path(key))
            .ok()
            .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
    }

    fn store(&self, key: &str, value: &str) {
        let tmp = self.base.join(format!(".{key}.tmp"));
        let result = fs::write(&tmp, value).and_then(|_| fs::rename(&tmp, self.key_path(key)));
        if let Err(e) = result {
            warn!(key, error = %e, "disk store failed");
        }
    }

    fn delete(&self, key: &str) {
        if let Err(e) = fs::remove_file(self.key_path(key)) {
            if e.kind() != io::ErrorKind::NotFound {
                warn!(key, error = %e, "disk delete failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_store_load_delete() {
        let db = MemoryDb::new();
        assert_eq!(db.load("mp"), None);
        db.store("mp", "secret");
        assert_eq!(db.load("mp").as_deref(), Some("secret"));
        db.store("mp", "replaced");
        assert_eq!(db.load("mp").as_deref(), Some("replaced"));
        db.delete("mp");
        assert_eq!(db.load("mp"), None);
    }

    #[test]
    fn disk_store_load_delete() {
        let dir = tempfile::tempdir().unwrap();
        let db = DiskDb::open(dir.path()).unwrap();
        db.store("rooms", r#"{"lobby":"alice"}"#);
        assert_eq!(db.load("rooms").as_deref(), Some(r#"{"lobby":"alice"}"#));
        // value is a plain file named after the key
        assert!(dir.path().join("rooms").is_file());
        db.delete("rooms");
        assert_eq!(db.load("rooms"), None);
        // deleting a missing key is not an error
        db.delete("rooms");
    }

    #[test]
    fn disk_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let db = DiskDb::open(dir.path()).unwrap();
            db.store("color", "#413ed1");
        }
        let db = DiskDb::open(dir.path()).unwrap();
        assert_eq!(db.load("color").as_deref(), Some("#413ed1"));
    }
}
