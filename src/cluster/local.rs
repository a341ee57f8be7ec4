//! Single-node implementations of the cluster collaborators.
//!
//! A single node owns its shard, leads it, and acts as its own coordinator:
//! proposals apply immediately, and commits are decided by [`LocalOracle`] with
//! conflict detection on the keys reported in the transaction context.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;
use tokio::sync::watch;
use tracing::debug;

use super::{
    Consensus, Context, Membership, Oracle, ProposalApplier, ShardClient, ZeroClient,
};
use crate::metrics::CounterMetrics;
use crate::model::{Mutations, TxnContext};
use crate::options::WorkerOptions;
use crate::posting::Txn;
use crate::storage::KvStore;
use crate::types::{MutationError, Result, ShardId, Ts};
use crate::worker::Worker;

/// Timestamp oracle and commit coordinator for one node.
pub struct LocalOracle {
    store: Arc<dyn KvStore>,
    next_ts: AtomicU64,
    max_assigned: watch::Sender<Ts>,
    pending: Mutex<FxHashMap<Ts, Arc<Txn>>>,
    /// Commit timestamp of the last commit touching each conflict key.
    committed: Mutex<FxHashMap<String, Ts>>,
}

impl LocalOracle {
    /// Creates an oracle whose first timestamp is 1.
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        let (max_assigned, _) = watch::channel(0);
        Self {
            store,
            next_ts: AtomicU64::new(1),
            max_assigned,
            pending: Mutex::new(FxHashMap::default()),
            committed: Mutex::new(FxHashMap::default()),
        }
    }

    /// Hands out a fresh timestamp and marks it as done.
    pub fn timestamp(&self) -> Ts {
        let ts = self.next_ts.fetch_add(1, Ordering::SeqCst);
        self.advance(ts);
        ts
    }

    /// Raises the done watermark to `ts`.
    pub fn advance(&self, ts: Ts) {
        self.max_assigned.send_if_modified(|current| {
            if *current < ts {
                *current = ts;
                true
            } else {
                false
            }
        });
    }

    /// Highest timestamp known to be done.
    pub fn max_assigned(&self) -> Ts {
        *self.max_assigned.borrow()
    }

    /// Number of registered, undecided transactions.
    pub fn pending_txns(&self) -> usize {
        self.pending.lock().len()
    }

    /// Writes the deltas of `start_ts` at `commit_ts`.
    pub fn commit(&self, start_ts: Ts, commit_ts: Ts) -> Result<()> {
        let txn = self.pending.lock().remove(&start_ts);
        if let Some(txn) = txn {
            txn.commit_to_store(commit_ts)?;
        }
        self.advance(commit_ts);
        Ok(())
    }

    /// Drops the deltas of `start_ts`.
    pub fn abort(&self, start_ts: Ts) {
        self.pending.lock().remove(&start_ts);
    }
}

#[async_trait]
impl Oracle for LocalOracle {
    async fn wait_for_ts(&self, ctx: &Context, ts: Ts) -> Result<()> {
        let mut rx = self.max_assigned.subscribe();
        loop {
            if *rx.borrow_and_update() >= ts {
                return Ok(());
            }
            tokio::select! {
                changed = rx.changed() => {
                    changed.map_err(|_| MutationError::Invariant("oracle watermark closed"))?;
                }
                err = ctx.cancelled() => return Err(err),
            }
        }
    }

    fn get_txn(&self, start_ts: Ts) -> Option<Arc<Txn>> {
        self.pending.lock().get(&start_ts).cloned()
    }

    fn register_start_ts(&self, start_ts: Ts) -> Arc<Txn> {
        self.pending
            .lock()
            .entry(start_ts)
            .or_insert_with(|| Arc::new(Txn::new(start_ts, self.store.clone())))
            .clone()
    }
}

#[async_trait]
impl ZeroClient for LocalOracle {
    async fn commit_or_abort(&self, ctx: &Context, mut tc: TxnContext) -> Result<TxnContext> {
        if let Some(err) = ctx.err() {
            return Err(err);
        }
        if tc.aborted {
            self.abort(tc.start_ts);
            return Ok(tc);
        }
        let commit_ts = {
            let mut committed = self.committed.lock();
            let conflict = tc
                .keys
                .iter()
                .any(|key| committed.get(key).is_some_and(|ts| *ts > tc.start_ts));
            if conflict {
                None
            } else {
                let commit_ts = self.next_ts.fetch_add(1, Ordering::SeqCst);
                for key in &tc.keys {
                    committed.insert(key.clone(), commit_ts);
                }
                Some(commit_ts)
            }
        };
        match commit_ts {
            Some(commit_ts) => {
                self.commit(tc.start_ts, commit_ts)?;
                tc.commit_ts = commit_ts;
                debug!(start_ts = tc.start_ts, commit_ts, "cluster.local.committed");
            }
            None => {
                self.abort(tc.start_ts);
                tc.aborted = true;
                debug!(start_ts = tc.start_ts, "cluster.local.conflict");
            }
        }
        Ok(tc)
    }
}

/// Consensus log that applies proposals in-process, one at a time and in the
/// order they acquire the log.
pub struct LocalConsensus {
    applier: OnceLock<Weak<dyn ProposalApplier>>,
    apply: tokio::sync::Mutex<()>,
    leader: AtomicBool,
    proposals: AtomicU64,
    snapshots: AtomicU64,
}

impl Default for LocalConsensus {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalConsensus {
    /// Creates an unbound log that considers itself leader.
    pub fn new() -> Self {
        Self {
            applier: OnceLock::new(),
            apply: tokio::sync::Mutex::new(()),
            leader: AtomicBool::new(true),
            proposals: AtomicU64::new(0),
            snapshots: AtomicU64::new(0),
        }
    }

    /// Binds the state machine proposals are applied to. Later binds are ignored.
    pub fn bind(&self, applier: Weak<dyn ProposalApplier>) {
        let _ = self.applier.set(applier);
    }

    /// Sets leadership.
    pub fn set_leader(&self, leader: bool) {
        self.leader.store(leader, Ordering::Relaxed);
    }

    /// Number of proposals applied.
    pub fn proposals(&self) -> u64 {
        self.proposals.load(Ordering::Relaxed)
    }

    /// Number of snapshots proposed.
    pub fn snapshots(&self) -> u64 {
        self.snapshots.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl Consensus for LocalConsensus {
    async fn propose_and_wait(&self, ctx: &Context, m: Mutations) -> Result<()> {
        if let Some(err) = ctx.err() {
            return Err(err);
        }
        let applier = self
            .applier
            .get()
            .and_then(Weak::upgrade)
            .ok_or(MutationError::Invariant("consensus log has no state machine"))?;
        let _applying = self.apply.lock().await;
        self.proposals.fetch_add(1, Ordering::Relaxed);
        applier.apply_proposal(m).await
    }

    fn am_leader(&self) -> bool {
        self.leader.load(Ordering::Relaxed)
    }

    async fn propose_snapshot(&self) -> Result<()> {
        self.snapshots.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

/// Fixed shard map.
pub struct StaticMembership {
    local: ShardId,
    default_shard: Option<ShardId>,
    tablets: RwLock<FxHashMap<String, ShardId>>,
    shards: RwLock<BTreeSet<ShardId>>,
    leaders: RwLock<FxHashMap<ShardId, Arc<dyn ShardClient>>>,
    zero: RwLock<Option<Arc<dyn ZeroClient>>>,
}

impl StaticMembership {
    /// Membership of a node in `local` that serves no predicates yet.
    pub fn new(local: ShardId) -> Self {
        let mut shards = BTreeSet::new();
        shards.insert(local);
        Self {
            local,
            default_shard: None,
            tablets: RwLock::new(FxHashMap::default()),
            shards: RwLock::new(shards),
            leaders: RwLock::new(FxHashMap::default()),
            zero: RwLock::new(None),
        }
    }

    /// Assigns unknown predicates to `shard` on first write.
    pub fn assign_new_to(mut self, shard: ShardId) -> Self {
        self.default_shard = Some(shard);
        self.shards.get_mut().insert(shard);
        self
    }

    /// Pins `predicate` to `shard`.
    pub fn assign(&self, predicate: impl Into<String>, shard: ShardId) {
        self.tablets.write().insert(predicate.into(), shard);
        self.shards.write().insert(shard);
    }

    /// Registers the leader connection of a remote shard.
    pub fn add_leader(&self, shard: ShardId, client: Arc<dyn ShardClient>) {
        self.leaders.write().insert(shard, client);
        self.shards.write().insert(shard);
    }

    /// Registers the coordinator connection.
    pub fn set_zero(&self, zero: Arc<dyn ZeroClient>) {
        *self.zero.write() = Some(zero);
    }
}

impl Membership for StaticMembership {
    fn belongs_to(&self, predicate: &str) -> Result<ShardId> {
        if let Some(shard) = self.tablets.read().get(predicate) {
            return Ok(*shard);
        }
        match self.default_shard {
            Some(shard) => {
                self.tablets.write().insert(predicate.to_owned(), shard);
                Ok(shard)
            }
            None => Ok(ShardId::NONE),
        }
    }

    fn belongs_to_read_only(&self, predicate: &str) -> Result<ShardId> {
        Ok(self
            .tablets
            .read()
            .get(predicate)
            .copied()
            .unwrap_or(ShardId::NONE))
    }

    fn serves_shard(&self, shard: ShardId) -> bool {
        shard == self.local
    }

    fn local_shard(&self) -> ShardId {
        self.local
    }

    fn known_shards(&self) -> Vec<ShardId> {
        self.shards.read().iter().copied().collect()
    }

    fn leader(&self, shard: ShardId) -> Option<Arc<dyn ShardClient>> {
        self.leaders.read().get(&shard).cloned()
    }

    fn zero(&self) -> Option<Arc<dyn ZeroClient>> {
        self.zero.read().clone()
    }
}

/// A worker wired to single-node collaborators.
pub struct LocalNode {
    /// The worker.
    pub worker: Arc<Worker>,
    /// Oracle and commit coordinator.
    pub oracle: Arc<LocalOracle>,
    /// Consensus log bound to the worker.
    pub consensus: Arc<LocalConsensus>,
    /// Shard map; unknown predicates are assigned to the local shard.
    pub membership: Arc<StaticMembership>,
    /// Backing store.
    pub store: Arc<dyn KvStore>,
    /// Counters fed by the worker.
    pub metrics: Arc<CounterMetrics>,
}

impl LocalNode {
    /// Starts a node serving shard 1 over `store`.
    pub fn start(opts: WorkerOptions, store: Arc<dyn KvStore>) -> Result<Self> {
        let local = ShardId(1);
        Self::start_with_membership(
            opts,
            store,
            Arc::new(StaticMembership::new(local).assign_new_to(local)),
        )
    }

    /// Starts a node with a caller-supplied shard map.
    pub fn start_with_membership(
        opts: WorkerOptions,
        store: Arc<dyn KvStore>,
        membership: Arc<StaticMembership>,
    ) -> Result<Self> {
        let oracle = Arc::new(LocalOracle::new(store.clone()));
        let consensus = Arc::new(LocalConsensus::new());
        let metrics = Arc::new(CounterMetrics::default());
        membership.set_zero(oracle.clone());
        let worker = Arc::new(
            Worker::new(
                opts,
                store.clone(),
                oracle.clone(),
                membership.clone(),
                consensus.clone(),
            )?
            .with_metrics(metrics.clone()),
        );
        let applier: Arc<dyn ProposalApplier> = worker.clone();
        consensus.bind(Arc::downgrade(&applier));
        Ok(Self {
            worker,
            oracle,
            consensus,
            membership,
            store,
            metrics,
        })
    }
}
