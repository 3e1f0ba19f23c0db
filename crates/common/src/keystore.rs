//! Persistent WireGuard key store
//!
//! Maps public keys to private keys so that a node keeps its identity across
//! reconciliation cycles even though the control server never stores private
//! keys. Every operation, including the disk round trip, runs under one lock.

use crate::Result;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{debug, error};

/// Public key to private key map backed by a JSON file
#[derive(Debug)]
pub struct KeyStore {
    path: PathBuf,
    keys: Mutex<HashMap<String, String>>,
}

impl KeyStore {
    /// Create an empty key store persisted at `path`
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            keys: Mutex::new(HashMap::new()),
        }
    }

    /// Create a key store and load whatever is on disk.
    ///
    /// A missing file is the normal first-run case and yields an empty store.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let store = Self::new(path);
        match store.load() {
            Ok(()) => Ok(store),
            Err(e) if e.is_not_found() => Ok(store),
            Err(e) => Err(e),
        }
    }

    /// Path of the backing file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Look up the private key for a public key
    pub fn lookup(&self, public_key: &str) -> Option<String> {
        self.keys.lock().get(public_key).cloned()
    }

    /// Insert or replace a key pair
    pub fn add(&self, public_key: &str, private_key: &str) {
        self.keys
            .lock()
            .insert(public_key.to_string(), private_key.to_string());
    }

    /// Remove a public key. Returns true if it was present.
    pub fn delete(&self, public_key: &str) -> bool {
        self.keys.lock().remove(public_key).is_some()
    }

    /// Number of stored pairs
    pub fn len(&self) -> usize {
        self.keys.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Write the whole map to disk
    pub fn save(&self) -> Result<()> {
        let keys = self.keys.lock();
        let data = serde_json::to_vec(&*keys)?;

        if let Err(e) = write_private(&self.path, &data) {
            error!("Error writing key store {:?}: {}", self.path, e);
            return Err(e.into());
        }

        debug!("Saved {} keys to {:?}", keys.len(), self.path);
        Ok(())
    }

    /// Replace the in-memory map with the file contents.
    ///
    /// On any failure the in-memory map is left untouched.
    pub fn load(&self) -> Result<()> {
        let mut keys = self.keys.lock();

        let data = std::fs::read(&self.path).map_err(|e| {
            if e.kind() != std::io::ErrorKind::NotFound {
                error!("Error reading key store {:?}: {}", self.path, e);
            }
            e
        })?;
        let loaded: HashMap<String, String> = serde_json::from_slice(&data).map_err(|e| {
            error!("Error decoding key store {:?}: {}", self.path, e);
            e
        })?;

        debug!("Loaded {} keys from {:?}", loaded.len(), self.path);
        *keys = loaded;
        Ok(())
    }
}

/// Write `data` to `path` with owner-only permissions, creating parents
pub fn write_private(path: &Path, data: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let mut options = std::fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }

    use std::io::Write;
    let mut file = options.open(path)?;
    file.write_all(data)?;
    file.sync_all()
}
