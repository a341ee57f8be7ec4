//! The write path of one shard member.
//!
//! A [`Worker`] routes client batches to shard leaders, applies proposals that
//! consensus hands back, validates and converts edges, and coordinates schema
//! changes with their background index rebuilds.

use std::sync::Arc;

use async_trait::async_trait;

use crate::cluster::{Consensus, Membership, Oracle, ProposalApplier};
use crate::metrics::{default_metrics, MutationMetrics};
use crate::model::Mutations;
use crate::options::WorkerOptions;
use crate::schema::{initial_schema, SchemaCtx, SchemaState};
use crate::storage::KvStore;
use crate::types::Result;

mod apply;
mod commit;
mod router;
mod schema;
pub mod task;
mod validate;

pub use router::BatchOutcome;
pub use task::{IndexingSlot, TaskHandle};
pub use validate::validate_and_convert;

/// Mutation worker bound to one node.
pub struct Worker {
    opts: WorkerOptions,
    store: Arc<dyn KvStore>,
    schema: Arc<SchemaState>,
    oracle: Arc<dyn Oracle>,
    membership: Arc<dyn Membership>,
    node: Arc<dyn Consensus>,
    indexing: Arc<IndexingSlot>,
    metrics: Arc<dyn MutationMetrics>,
}

impl Worker {
    /// Creates a worker, loading every durable schema record and installing the
    /// reserved predicates that have none.
    pub fn new(
        opts: WorkerOptions,
        store: Arc<dyn KvStore>,
        oracle: Arc<dyn Oracle>,
        membership: Arc<dyn Membership>,
        node: Arc<dyn Consensus>,
    ) -> Result<Self> {
        opts.validate()?;
        let schema = Arc::new(SchemaState::new(store.clone()));
        schema.load_all()?;
        install_initial_schema(&schema, opts.acl_enabled);
        Ok(Self {
            opts,
            store,
            schema,
            oracle,
            membership,
            node,
            indexing: Arc::new(IndexingSlot::new()),
            metrics: default_metrics(),
        })
    }

    /// Replaces the metrics sink.
    pub fn with_metrics(mut self, metrics: Arc<dyn MutationMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Worker options.
    pub fn options(&self) -> &WorkerOptions {
        &self.opts
    }

    /// Live schema.
    pub fn schema(&self) -> &Arc<SchemaState> {
        &self.schema
    }

    /// Backing store.
    pub fn store(&self) -> &Arc<dyn KvStore> {
        &self.store
    }

    /// Returns `true` while a schema batch holds the indexing slot.
    pub fn indexing_running(&self) -> bool {
        self.indexing.is_running()
    }

    /// Waits until background index rebuilds have finished.
    pub async fn wait_for_indexing(&self) {
        self.indexing.wait_idle().await;
    }
}

fn install_initial_schema(schema: &SchemaState, acl_enabled: bool) {
    for su in initial_schema(acl_enabled) {
        if schema.get(SchemaCtx::Read, &su.predicate).is_none() {
            schema.set(su);
        }
    }
}

#[async_trait]
impl ProposalApplier for Worker {
    async fn apply_proposal(&self, m: Mutations) -> Result<()> {
        Worker::apply_proposal(self, m).await
    }
}
