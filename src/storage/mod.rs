//! Key/value storage interface consumed by the write path.
//!
//! The storage engine is an external collaborator. The write path needs versioned
//! point reads, newest-version prefix scans, atomic timestamped write batches, and
//! prefix drops; [`KvStore`] captures exactly that. [`MemStore`] is an in-process
//! implementation used by single-node deployments and tests.

mod key;
mod mem;

pub use key::{Key, KeyPrefix};
pub use mem::MemStore;

use crate::types::{Result, Ts};

/// Flag bits stored alongside every version.
pub mod meta {
    /// Complete posting list that holds no postings.
    pub const EMPTY_POSTING: u8 = 0x01;
    /// Schema or type record.
    pub const SCHEMA_POSTING: u8 = 0x02;
    /// Delta on top of older versions.
    pub const DELTA_POSTING: u8 = 0x04;
    /// Complete posting list; older versions are irrelevant.
    pub const COMPLETE_POSTING: u8 = 0x08;
}

/// One version of a key.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Version {
    /// Commit timestamp of the version.
    pub ts: Ts,
    /// Bitset of [`meta`] flags.
    pub meta: u8,
    /// Encoded payload.
    pub value: Vec<u8>,
}

impl Version {
    /// Creates a version.
    pub fn new(ts: Ts, meta: u8, value: Vec<u8>) -> Self {
        Self { ts, meta, value }
    }

    /// Returns `true` for complete posting lists.
    pub fn is_complete(&self) -> bool {
        self.meta & meta::COMPLETE_POSTING != 0
    }

    /// Returns `true` for complete posting lists known to be empty.
    pub fn is_empty_posting(&self) -> bool {
        self.meta & meta::EMPTY_POSTING != 0
    }
}

/// Versioned key/value store.
pub trait KvStore: Send + Sync {
    /// Returns the versions of `key` visible at `read_ts`, newest first.
    fn versions(&self, key: &Key, read_ts: Ts) -> Result<Vec<Version>>;

    /// Visits the newest version visible at `read_ts` of every key under `prefix`,
    /// in key order. Visiting stops early when `visit` returns `false`.
    fn scan(
        &self,
        prefix: &KeyPrefix,
        read_ts: Ts,
        visit: &mut dyn FnMut(&Key, &Version) -> Result<bool>,
    ) -> Result<()>;

    /// Applies a batch of versions atomically.
    fn write_batch(&self, writes: Vec<(Key, Version)>) -> Result<()>;

    /// Removes every version of every key under `prefix`.
    fn drop_prefix(&self, prefix: &KeyPrefix) -> Result<()>;

    /// Returns the newest version of `key` visible at `read_ts`.
    fn latest(&self, key: &Key, read_ts: Ts) -> Result<Option<Version>> {
        Ok(self.versions(key, read_ts)?.into_iter().next())
    }
}

/// Scoped, timestamp-qualified write transaction.
///
/// Writes are buffered until [`StoreTxn::commit_at`]; dropping the transaction
/// without committing discards them.
pub struct StoreTxn<'a> {
    store: &'a dyn KvStore,
    read_ts: Ts,
    pending: Vec<(Key, u8, Vec<u8>)>,
}

impl<'a> StoreTxn<'a> {
    /// Opens a transaction reading at `read_ts`.
    pub fn new(store: &'a dyn KvStore, read_ts: Ts) -> Self {
        Self {
            store,
            read_ts,
            pending: Vec::new(),
        }
    }

    /// Timestamp reads are evaluated at.
    pub fn read_ts(&self) -> Ts {
        self.read_ts
    }

    /// Reads the newest committed version of `key` at the read timestamp.
    pub fn get(&self, key: &Key) -> Result<Option<Version>> {
        self.store.latest(key, self.read_ts)
    }

    /// Buffers a write.
    pub fn set(&mut self, key: Key, meta: u8, value: Vec<u8>) {
        self.pending.push((key, meta, value));
    }

    /// Number of buffered writes.
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Returns `true` when nothing is buffered.
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Writes every buffered entry at `commit_ts`.
    pub fn commit_at(self, commit_ts: Ts) -> Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let writes = self
            .pending
            .into_iter()
            .map(|(key, meta, value)| (key, Version::new(commit_ts, meta, value)))
            .collect();
        self.store.write_batch(writes)
    }

    /// Drops buffered writes.
    pub fn discard(self) {}
}
