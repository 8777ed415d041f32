//! Directory-backed stash
//!
//! One JSON file per key:
//!
//! ```json
//! { "key": "chronology:v1:ab12..", "value": "<base64>", "expires_at_ms": 1760000000000 }
//! ```
//!
//! File names are the SHA-256 hex digest of the key. Writes go to a
//! temporary file that is renamed over the entry, so readers in other
//! processes never see a partial entry. Expired entries are removed when read.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use super::{Stash, StashError, StashResult};

#[derive(Debug, Serialize, Deserialize)]
struct StoredEntry {
    key: String,
    value: String,
    expires_at_ms: i64,
}

/// Stash keeping one file per key under a shared directory.
#[derive(Debug, Clone)]
pub struct FileStash {
    root: PathBuf,
}

impl FileStash {
    /// Open a stash rooted at `root`, creating the directory if needed.
    pub fn open(root: impl Into<PathBuf>) -> StashResult<Self> {
        let root = root.into();
        fs::create_dir_all(&root)
            .map_err(|e| StashError::Unavailable(format!("{}: {}", root.display(), e)))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn entry_path(&self, key: &str) -> PathBuf {
        let digest = Sha256::digest(key.as_bytes());
        let name: String = digest.iter().map(|b| format!("{:02x}", b)).collect();
        self.root.join(format!("{}.json", name))
    }

    fn remove(&self, key: &str, path: &Path) -> StashResult<()> {
        match fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StashError::io(key, e)),
        }
    }
}

impl Stash for FileStash {
    fn get(&self, key: &str) -> StashResult<Option<Vec<u8>>> {
        let path = self.entry_path(key);
        let raw = match fs::read(&path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(StashError::io(key, e)),
        };

        let entry: StoredEntry =
            serde_json::from_slice(&raw).map_err(|e| StashError::corrupt(key, e))?;
        if entry.key != key {
            return Err(StashError::corrupt(key, "entry belongs to another key"));
        }
        if entry.expires_at_ms <= Utc::now().timestamp_millis() {
            self.remove(key, &path)?;
            return Ok(None);
        }

        let value = STANDARD
            .decode(entry.value.as_bytes())
            .map_err(|e| StashError::corrupt(key, e))?;
        Ok(Some(value))
    }

    fn set(&self, key: &str, value: &[u8], ttl: Duration) -> StashResult<()> {
        let ttl_ms = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);
        let entry = StoredEntry {
            key: key.to_string(),
            value: STANDARD.encode(value),
            expires_at_ms: Utc::now().timestamp_millis().saturating_add(ttl_ms),
        };
        let json = serde_json::to_vec(&entry).map_err(|e| StashError::corrupt(key, e))?;

        let path = self.entry_path(key);
        let temp = self.root.join(format!(".{}.tmp", Uuid::new_v4()));
        fs::write(&temp, json).map_err(|e| StashError::io(key, e))?;
        if let Err(e) = fs::rename(&temp, &path) {
            let _ = fs::remove_file(&temp);
            return Err(StashError::io(key, e));
        }
        Ok(())
    }

    fn delete(&self, key: &str) -> StashResult<()> {
        self.remove(key, &self.entry_path(key))
    }
}
