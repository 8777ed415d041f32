//! Shared stash
//!
//! A low-latency key/value store shared by every process serving the same
//! clients. Entries carry a TTL. Losing entries degrades consistency (stale
//! reads become possible) but never corrupts writes.
//!
//! Implementations:
//! - `EmptyStash`: stores nothing; chronology protection turns itself off
//! - `MemoryStash`: process-local
//! - `FileStash`: one file per key in a shared directory

mod errors;
mod file;
mod memory;

use std::time::Duration;

pub use errors::{StashError, StashResult};
pub use file::FileStash;
pub use memory::MemoryStash;

/// Key/value store with per-entry TTL.
pub trait Stash: Send + Sync {
    /// Value stored under `key`, if present and not expired
    fn get(&self, key: &str) -> StashResult<Option<Vec<u8>>>;

    /// Store `value` under `key` for `ttl`
    fn set(&self, key: &str, value: &[u8], ttl: Duration) -> StashResult<()>;

    /// Remove `key`; removing a missing key succeeds
    fn delete(&self, key: &str) -> StashResult<()>;

    /// True when the stash never stores anything
    fn is_noop(&self) -> bool {
        false
    }
}

/// Stash that stores nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct EmptyStash;

impl Stash for EmptyStash {
    fn get(&self, _key: &str) -> StashResult<Option<Vec<u8>>> {
        Ok(None)
    }

    fn set(&self, _key: &str, _value: &[u8], _ttl: Duration) -> StashResult<()> {
        Ok(())
    }

    fn delete(&self, _key: &str) -> StashResult<()> {
        Ok(())
    }

    fn is_noop(&self) -> bool {
        true
    }
}
