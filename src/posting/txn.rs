use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rustc_hash::{FxHashMap, FxHashSet};

use super::list::{encode_postings, PostingList, ReadMode};
use crate::model::TxnContext;
use crate::storage::{meta, Key, KvStore, StoreTxn};
use crate::types::{Result, ShardId, Ts};

/// Shared handle to a cached posting list.
pub type ListHandle = Arc<Mutex<PostingList>>;

/// Per-transaction cache of posting lists and conflict bookkeeping.
///
/// Every mutation applied under one start timestamp shares a `Txn`. Lists are read
/// lazily with the weakest read mode a caller asks for and upgraded on demand;
/// deltas stay in memory until [`Txn::commit_to_store`].
pub struct Txn {
    start_ts: Ts,
    store: Arc<dyn KvStore>,
    cache: Mutex<FxHashMap<Key, ListHandle>>,
    conflicts: Mutex<FxHashSet<u64>>,
    preds: Mutex<FxHashSet<String>>,
    last_read: Mutex<Duration>,
}

impl Txn {
    /// Creates an empty transaction reading at `start_ts`.
    pub fn new(start_ts: Ts, store: Arc<dyn KvStore>) -> Self {
        Self {
            start_ts,
            store,
            cache: Mutex::new(FxHashMap::default()),
            conflicts: Mutex::new(FxHashSet::default()),
            preds: Mutex::new(FxHashSet::default()),
            last_read: Mutex::new(Duration::ZERO),
        }
    }

    /// Start timestamp.
    pub fn start_ts(&self) -> Ts {
        self.start_ts
    }

    /// Full list: every committed version merged.
    pub fn get(&self, key: &Key) -> Result<ListHandle> {
        self.fetch(key, ReadMode::Full)
    }

    /// Newest committed version only; exact for single-valued scalar keys.
    pub fn get_scalar_list(&self, key: &Key) -> Result<ListHandle> {
        self.fetch(key, ReadMode::Newest)
    }

    /// Facade that records deltas without reading storage.
    pub fn get_from_delta(&self, key: &Key) -> Result<ListHandle> {
        self.fetch(key, ReadMode::Facade)
    }

    fn fetch(&self, key: &Key, mode: ReadMode) -> Result<ListHandle> {
        let started = Instant::now();
        let handle = {
            let mut cache = self.cache.lock();
            match cache.get(key) {
                Some(handle) => handle.clone(),
                None => {
                    let list = PostingList::read(self.store.as_ref(), key.clone(), self.start_ts, mode)?;
                    let handle = Arc::new(Mutex::new(list));
                    cache.insert(key.clone(), handle.clone());
                    *self.last_read.lock() = started.elapsed();
                    return Ok(handle);
                }
            }
        };
        {
            let mut list = handle.lock();
            if list.mode() < mode {
                list.reload(self.store.as_ref(), self.start_ts, mode)?;
            }
        }
        *self.last_read.lock() = started.elapsed();
        Ok(handle)
    }

    /// Time spent by the most recent list fetch.
    pub fn last_read_latency(&self) -> Duration {
        *self.last_read.lock()
    }

    /// Records a conflict fingerprint.
    pub fn add_conflict_key(&self, fingerprint: u64) {
        self.conflicts.lock().insert(fingerprint);
    }

    /// Records a predicate touched by the transaction.
    pub fn touch_predicate(&self, attr: &str) {
        let mut preds = self.preds.lock();
        if !preds.contains(attr) {
            preds.insert(attr.to_owned());
        }
    }

    /// Number of lists holding deltas.
    pub fn dirty_lists(&self) -> usize {
        self.cache
            .lock()
            .values()
            .filter(|handle| !handle.lock().pending().is_empty())
            .count()
    }

    /// Copies conflict keys and touched predicates into `ctx`, qualified by `shard`.
    ///
    /// An errored transaction still reports its keys so the coordinator can abort it.
    pub fn fill_context(&self, ctx: &mut TxnContext, shard: ShardId, is_errored: bool) {
        ctx.start_ts = self.start_ts;
        let mut keys: Vec<String> = self
            .conflicts
            .lock()
            .iter()
            .map(|fp| format!("{shard}-{fp:x}"))
            .collect();
        keys.sort();
        ctx.keys.extend(keys);
        if !is_errored {
            let mut preds: Vec<String> = self
                .preds
                .lock()
                .iter()
                .map(|p| format!("{shard}-{p}"))
                .collect();
            preds.sort();
            ctx.preds.extend(preds);
        }
    }

    /// Writes every pending delta at `commit_ts`.
    pub fn commit_to_store(&self, commit_ts: Ts) -> Result<()> {
        let mut batch = StoreTxn::new(self.store.as_ref(), self.start_ts);
        for (key, handle) in self.cache.lock().iter() {
            let list = handle.lock();
            if list.pending().is_empty() {
                continue;
            }
            batch.set(key.clone(), meta::DELTA_POSTING, encode_postings(list.pending())?);
        }
        batch.commit_at(commit_ts)
    }
}
