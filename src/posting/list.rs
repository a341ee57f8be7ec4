use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use xxhash_rust::xxh64::xxh64;

use crate::model::EdgeOp;
use crate::storage::{meta, Key, KvStore, Version};
use crate::types::{MutationError, Result, Ts, ValueType};

/// Posting id of the single value of a non-list scalar predicate.
pub const SCALAR_POSTING_UID: u64 = u64::MAX;

/// One entry of a posting list.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Posting {
    /// Entity for uid postings; a value fingerprint for scalar postings.
    pub uid: u64,
    /// Type of `value`.
    pub value_type: ValueType,
    /// Encoded scalar value; empty for uid postings.
    pub value: Vec<u8>,
    /// Language tag of the value.
    pub lang: Option<String>,
    /// Whether this entry adds or removes `uid`.
    pub op: EdgeOp,
}

impl Posting {
    /// Posting pointing at an entity.
    pub fn uid(uid: u64, op: EdgeOp) -> Self {
        Self {
            uid,
            value_type: ValueType::Uid,
            value: Vec::new(),
            lang: None,
            op,
        }
    }

    /// Returns the same posting with a different operation.
    pub fn with_op(mut self, op: EdgeOp) -> Self {
        self.op = op;
        self
    }

    /// Returns `true` for uid postings.
    pub fn is_uid(&self) -> bool {
        self.value_type == ValueType::Uid
    }
}

/// Posting id for a scalar value.
///
/// Language-tagged values are keyed by their tag, list values by their content,
/// and the single value of a non-list predicate by [`SCALAR_POSTING_UID`].
pub fn scalar_posting_uid(value: &[u8], lang: Option<&str>, list: bool) -> u64 {
    match lang {
        Some(lang) => xxh64(lang.as_bytes(), 0),
        None if list => xxh64(value, 0),
        None => SCALAR_POSTING_UID,
    }
}

pub(crate) fn encode_postings(postings: &[Posting]) -> Result<Vec<u8>> {
    serde_json::to_vec(postings).map_err(MutationError::storage)
}

pub(crate) fn decode_postings(raw: &[u8]) -> Result<Vec<Posting>> {
    serde_json::from_slice(raw).map_err(MutationError::storage)
}

/// How much of the committed history a cached list has read.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd)]
pub enum ReadMode {
    /// Nothing read; the list only records new deltas.
    Facade,
    /// Newest committed version only.
    Newest,
    /// Every committed version merged.
    Full,
}

/// Committed postings of one key plus the deltas written by the current transaction.
#[derive(Clone, Debug)]
pub struct PostingList {
    key: Key,
    committed: BTreeMap<u64, Posting>,
    pending: Vec<Posting>,
    mode: ReadMode,
}

impl PostingList {
    /// List that reads nothing from storage.
    pub fn facade(key: Key) -> Self {
        Self {
            key,
            committed: BTreeMap::new(),
            pending: Vec::new(),
            mode: ReadMode::Facade,
        }
    }

    /// Reads the committed state of `key` at `read_ts`.
    pub fn read(store: &dyn KvStore, key: Key, read_ts: Ts, mode: ReadMode) -> Result<Self> {
        let mut list = Self::facade(key);
        list.reload(store, read_ts, mode)?;
        Ok(list)
    }

    /// Re-reads committed state with `mode`, keeping pending deltas.
    pub fn reload(&mut self, store: &dyn KvStore, read_ts: Ts, mode: ReadMode) -> Result<()> {
        self.committed = match mode {
            ReadMode::Facade => BTreeMap::new(),
            ReadMode::Newest => match store.latest(&self.key, read_ts)? {
                Some(version) => merge_versions(std::slice::from_ref(&version))?,
                None => BTreeMap::new(),
            },
            ReadMode::Full => {
                let versions = store.versions(&self.key, read_ts)?;
                let base = versions
                    .iter()
                    .position(Version::is_complete)
                    .map_or(versions.len(), |pos| pos + 1);
                merge_versions(&versions[..base])?
            }
        };
        self.mode = mode;
        Ok(())
    }

    /// Key of the list.
    pub fn key(&self) -> &Key {
        &self.key
    }

    /// Read mode the list was loaded with.
    pub fn mode(&self) -> ReadMode {
        self.mode
    }

    /// Records a delta.
    pub fn add(&mut self, posting: Posting) {
        self.pending.push(posting);
    }

    /// Deltas recorded by the current transaction.
    pub fn pending(&self) -> &[Posting] {
        &self.pending
    }

    /// Committed postings with pending deltas applied.
    pub fn postings(&self) -> Vec<Posting> {
        let mut merged = self.committed.clone();
        apply_delta(&mut merged, &self.pending);
        merged.into_values().collect()
    }

    /// Posting with id `uid`, if present after pending deltas.
    pub fn find(&self, uid: u64) -> Option<Posting> {
        let mut current = self.committed.get(&uid).cloned();
        for posting in self.pending.iter().filter(|p| p.uid == uid) {
            current = match posting.op {
                EdgeOp::Set => Some(posting.clone()),
                EdgeOp::Del => None,
            };
        }
        current
    }

    /// Number of postings after pending deltas.
    pub fn len(&self) -> usize {
        self.postings().len()
    }

    /// Returns `true` when no postings remain.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Merges versions given newest first; a complete version, if any, must be last.
fn merge_versions(versions: &[Version]) -> Result<BTreeMap<u64, Posting>> {
    let mut merged = BTreeMap::new();
    for version in versions.iter().rev() {
        let postings = decode_postings(&version.value)?;
        if version.is_complete() {
            merged.clear();
        }
        apply_delta(&mut merged, &postings);
    }
    Ok(merged)
}

fn apply_delta(merged: &mut BTreeMap<u64, Posting>, delta: &[Posting]) {
    for posting in delta {
        match posting.op {
            EdgeOp::Set => {
                merged.insert(posting.uid, posting.clone());
            }
            EdgeOp::Del => {
                merged.remove(&posting.uid);
            }
        }
    }
}

/// Writes the fully merged state of `key` at `ts` as a complete version.
pub fn rollup(store: &dyn KvStore, key: &Key, ts: Ts) -> Result<()> {
    let list = PostingList::read(store, key.clone(), ts, ReadMode::Full)?;
    write_complete(store, key.clone(), list.postings(), ts)
}

pub(crate) fn write_complete(
    store: &dyn KvStore,
    key: Key,
    postings: Vec<Posting>,
    ts: Ts,
) -> Result<()> {
    let mut bits = meta::COMPLETE_POSTING;
    if postings.is_empty() {
        bits |= meta::EMPTY_POSTING;
    }
    let value = encode_postings(&postings)?;
    store.write_batch(vec![(key, Version::new(ts, bits, value))])
}
