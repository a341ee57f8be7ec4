//! Cluster collaborators consumed by the write path.
//!
//! Consensus, the timestamp oracle, membership, and the RPC clients for remote
//! shard leaders and the cluster coordinator are external systems. The worker
//! talks to them only through the traits below; [`local`] provides single-node
//! implementations.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::time::Instant;

use crate::model::{Mutations, TxnContext};
use crate::posting::Txn;
use crate::schema::SchemaUpdate;
use crate::types::{MutationError, Result, ShardId, Ts};

pub mod local;

/// Cancellation scope of one caller request.
#[derive(Clone, Debug, Default)]
pub struct Context {
    deadline: Option<Instant>,
    cancel: Option<watch::Receiver<bool>>,
}

/// Cancels the [`Context`] it was created with.
#[derive(Debug)]
pub struct CancelHandle(watch::Sender<bool>);

impl CancelHandle {
    /// Signals cancellation to every clone of the context.
    pub fn cancel(&self) {
        self.0.send_replace(true);
    }
}

impl Context {
    /// Context that is never cancelled.
    pub fn background() -> Self {
        Self::default()
    }

    /// Returns a copy that expires after `timeout`.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.deadline = Some(Instant::now() + timeout);
        self
    }

    /// Returns a cancellable context and its handle.
    pub fn with_cancel() -> (Self, CancelHandle) {
        let (tx, rx) = watch::channel(false);
        (
            Self {
                deadline: None,
                cancel: Some(rx),
            },
            CancelHandle(tx),
        )
    }

    /// Returns the cancellation error if the context is already done.
    pub fn err(&self) -> Option<MutationError> {
        if self.cancel.as_ref().is_some_and(|rx| *rx.borrow()) {
            return Some(MutationError::Cancelled);
        }
        if self.deadline.is_some_and(|d| Instant::now() >= d) {
            return Some(MutationError::DeadlineExceeded);
        }
        None
    }

    /// Resolves once the context is cancelled or its deadline passes.
    pub async fn cancelled(&self) -> MutationError {
        let cancel = async {
            match self.cancel.clone() {
                Some(mut rx) => loop {
                    if *rx.borrow_and_update() {
                        return;
                    }
                    if rx.changed().await.is_err() {
                        // Handle dropped without cancelling.
                        std::future::pending::<()>().await;
                    }
                },
                None => std::future::pending::<()>().await,
            }
        };
        let deadline = async {
            match self.deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::select! {
            _ = cancel => MutationError::Cancelled,
            _ = deadline => MutationError::DeadlineExceeded,
        }
    }
}

/// RPC client for the leader of a remote shard.
#[async_trait]
pub trait ShardClient: Send + Sync {
    /// Proposes a shard-local mutation batch on the remote leader.
    async fn mutate(&self, ctx: &Context, m: Mutations) -> Result<TxnContext>;

    /// Returns the schema of the requested predicates served by the remote shard.
    async fn schema(&self, ctx: &Context, predicates: &[String]) -> Result<Vec<SchemaUpdate>>;
}

/// RPC client for the cluster coordinator that decides commits.
#[async_trait]
pub trait ZeroClient: Send + Sync {
    /// Commits or aborts the transaction described by `tc`.
    async fn commit_or_abort(&self, ctx: &Context, tc: TxnContext) -> Result<TxnContext>;
}

/// Shard ownership and connection discovery.
pub trait Membership: Send + Sync {
    /// Shard owning `predicate`, assigning one if the cluster does so on first write.
    /// Returns [`ShardId::NONE`] when no shard serves it.
    fn belongs_to(&self, predicate: &str) -> Result<ShardId>;

    /// Shard owning `predicate` without assigning one.
    fn belongs_to_read_only(&self, predicate: &str) -> Result<ShardId> {
        self.belongs_to(predicate)
    }

    /// Returns `true` if this node is a member of `shard`.
    fn serves_shard(&self, shard: ShardId) -> bool;

    /// Shard this node belongs to.
    fn local_shard(&self) -> ShardId;

    /// Every shard known to the cluster.
    fn known_shards(&self) -> Vec<ShardId>;

    /// Connection to the leader of `shard`.
    fn leader(&self, shard: ShardId) -> Option<Arc<dyn ShardClient>>;

    /// Connection to the cluster coordinator.
    fn zero(&self) -> Option<Arc<dyn ZeroClient>>;
}

/// Replication log of the local shard.
#[async_trait]
pub trait Consensus: Send + Sync {
    /// Proposes `m` and waits until it has been applied locally.
    async fn propose_and_wait(&self, ctx: &Context, m: Mutations) -> Result<()>;

    /// Returns `true` if this node leads its shard.
    fn am_leader(&self) -> bool;

    /// Proposes a snapshot of the local state.
    async fn propose_snapshot(&self) -> Result<()>;
}

/// Transaction oracle.
#[async_trait]
pub trait Oracle: Send + Sync {
    /// Waits until every transaction that committed before `ts` is visible.
    async fn wait_for_ts(&self, ctx: &Context, ts: Ts) -> Result<()>;

    /// Transaction registered for `start_ts`, if any.
    fn get_txn(&self, start_ts: Ts) -> Option<Arc<Txn>>;

    /// Returns the transaction for `start_ts`, registering it if needed.
    fn register_start_ts(&self, start_ts: Ts) -> Arc<Txn>;
}

/// Applies committed consensus entries to local state.
#[async_trait]
pub trait ProposalApplier: Send + Sync {
    /// Applies one proposal.
    async fn apply_proposal(&self, m: Mutations) -> Result<()>;
}
