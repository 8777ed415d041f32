//! Process-local stash

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use super::{Stash, StashResult};

#[derive(Debug)]
struct Entry {
    value: Vec<u8>,
    /// `None` when the TTL reaches past what the clock can represent
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| at > now)
    }
}

/// In-memory stash with lazy expiry.
#[derive(Debug, Default)]
pub struct MemoryStash {
    entries: Mutex<HashMap<String, Entry>>,
}

impl MemoryStash {
    pub fn new() -> Self {
        Self::default()
    }

    /// Live entries
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|entry| entry.is_live(now))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Stash for MemoryStash {
    fn get(&self, key: &str) -> StashResult<Option<Vec<u8>>> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        match entries.get(key) {
            Some(entry) if entry.is_live(Instant::now()) => Ok(Some(entry.value.clone())),
            Some(_) => {
                entries.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    fn set(&self, key: &str, value: &[u8], ttl: Duration) -> StashResult<()> {
        let entry = Entry {
            value: value.to_vec(),
            expires_at: Instant::now().checked_add(ttl),
        };
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_string(), entry);
        Ok(())
    }

    fn delete(&self, key: &str) -> StashResult<()> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_get_delete() {
        let stash = MemoryStash::new();
        stash.set("a", b"1", Duration::from_secs(60)).unwrap();

        assert_eq!(stash.get("a").unwrap(), Some(b"1".to_vec()));
        assert_eq!(stash.len(), 1);

        stash.delete("a").unwrap();
        assert_eq!(stash.get("a").unwrap(), None);
        stash.delete("a").unwrap();
    }

    #[test]
    fn test_expired_entries_are_gone() {
        let stash = MemoryStash::new();
        stash.set("a", b"1", Duration::ZERO).unwrap();

        assert_eq!(stash.get("a").unwrap(), None);
        assert!(stash.is_empty());
    }

    #[test]
    fn test_unrepresentable_ttl_never_expires() {
        let stash = MemoryStash::new();
        stash.set("a", b"1", Duration::MAX).unwrap();

        assert_eq!(stash.get("a").unwrap(), Some(b"1".to_vec()));
        assert_eq!(stash.len(), 1);
    }
}
