//! Schema changes and their index rebuilds.

use std::sync::Arc;

use tokio::sync::Semaphore;
use tracing::{error, info, warn};

use super::task::{IndexingSlot, TaskHandle};
use super::Worker;
use crate::cluster::Consensus;
use crate::metrics::MutationMetrics;
use crate::options::WorkerOptions;
use crate::posting::IndexRebuild;
use crate::primitives::retry::retry_or_abort;
use crate::schema::{check_schema, SchemaCtx, SchemaState, SchemaUpdate, TypeUpdate};
use crate::storage::KvStore;
use crate::types::{MutationError, Result, Ts, ValueType};

/// Everything a background rebuild needs once the batch has returned.
#[derive(Clone)]
struct RebuildCtx {
    opts: WorkerOptions,
    store: Arc<dyn KvStore>,
    schema: Arc<SchemaState>,
    node: Arc<dyn Consensus>,
    metrics: Arc<dyn MutationMetrics>,
    handle: Option<Arc<TaskHandle>>,
}

impl Worker {
    /// Validates and installs a batch of schema updates.
    ///
    /// Updates that need no index work are persisted before this returns. The rest
    /// are published as mutation schema and rebuilt in the background, one batch at
    /// a time per node; their failures only show up in logs and in the schema
    /// falling back to its durable record.
    pub async fn run_schema_mutation(&self, updates: Vec<SchemaUpdate>, start_ts: Ts) -> Result<()> {
        if updates.is_empty() {
            return Ok(());
        }
        self.indexing.wait_idle().await;

        let mut handle: Option<Arc<TaskHandle>> = None;
        let mut rebuilds = Vec::new();
        let setup = self
            .setup_schema_updates(updates, start_ts, &mut handle, &mut rebuilds)
            .await;

        if !rebuilds.is_empty() {
            let ctx = RebuildCtx {
                opts: self.opts.clone(),
                store: self.store.clone(),
                schema: self.schema.clone(),
                node: self.node.clone(),
                metrics: self.metrics.clone(),
                handle,
            };
            spawn_rebuilds(ctx, rebuilds);
        }
        setup
    }

    async fn setup_schema_updates(
        &self,
        updates: Vec<SchemaUpdate>,
        start_ts: Ts,
        handle: &mut Option<Arc<TaskHandle>>,
        rebuilds: &mut Vec<IndexRebuild>,
    ) -> Result<()> {
        let local = self.membership.local_shard();
        for mut su in updates {
            let owner = self.membership.belongs_to(&su.predicate)?;
            if owner != local {
                return Err(MutationError::UnservedTablet(su.predicate));
            }
            check_schema(&self.schema, self.store.as_ref(), &mut su)?;

            let old = self.schema.get(SchemaCtx::Read, &su.predicate);
            let had_schema = old.is_some();
            let plan = IndexRebuild::new(start_ts, old, su.clone());
            let needs_rebuild = plan.need_index_rebuild();
            if needs_rebuild && handle.is_none() {
                *handle = Some(Arc::new(acquire_slot(&self.indexing, start_ts).await));
            }

            self.schema.set(plan.query_schema());
            self.schema.set_mut_schema(su.clone());

            if had_schema {
                if let Err(err) = run_blocking(self.store.clone(), plan.clone(), |store, plan| {
                    plan.drop_indexes(store)?;
                    plan.build_data(store)
                })
                .await
                {
                    warn!(predicate = %su.predicate, error = %err, "worker.schema.setup_failed");
                    undo_schema_update(&self.schema, &self.opts, &su.predicate).await;
                    return Err(err);
                }
            }

            if needs_rebuild {
                rebuilds.push(plan);
            } else {
                update_schema(&self.schema, self.metrics.as_ref(), &su, start_ts)?;
            }
        }
        Ok(())
    }

    /// Installs a schema for `attr` derived from the first edge written to it.
    /// Uid predicates default to lists.
    pub(crate) fn create_schema(&self, attr: &str, value_type: ValueType, ts: Ts) -> Result<()> {
        let mut su = match self.schema.get(SchemaCtx::Write, attr) {
            Some(mut existing) => {
                existing.value_type = value_type;
                existing
            }
            None => {
                let mut su = SchemaUpdate::new(attr, value_type);
                su.list = value_type == ValueType::Uid;
                su
            }
        };
        check_schema(&self.schema, self.store.as_ref(), &mut su)?;
        update_schema(&self.schema, self.metrics.as_ref(), &su, ts)
    }

    /// Installs a type definition.
    pub fn run_type_mutation(&self, tu: &TypeUpdate, ts: Ts) -> Result<()> {
        self.update_type(tu, ts)
    }

    fn update_type(&self, tu: &TypeUpdate, ts: Ts) -> Result<()> {
        self.schema.set_type(tu.clone());
        self.schema.persist_type(tu, ts)
    }
}

async fn acquire_slot(slot: &Arc<IndexingSlot>, start_ts: Ts) -> TaskHandle {
    if let Some(running) = slot.running_ts() {
        info!(start_ts, running, "worker.schema.waiting_for_indexing");
    }
    slot.acquire(start_ts).await
}

fn update_schema(
    schema: &SchemaState,
    metrics: &dyn MutationMetrics,
    su: &SchemaUpdate,
    ts: Ts,
) -> Result<()> {
    schema.set(su.clone());
    schema.delete_mut_schema(&su.predicate);
    schema.persist(su, ts)?;
    metrics.schema_updated();
    Ok(())
}

async fn undo_schema_update(schema: &SchemaState, opts: &WorkerOptions, predicate: &str) {
    retry_or_abort(
        "reload schema",
        opts.schema_reload_retries,
        opts.schema_reload_backoff,
        || schema.load(predicate),
    )
    .await;
}

async fn run_blocking<T, F>(store: Arc<dyn KvStore>, plan: IndexRebuild, work: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce(&dyn KvStore, &IndexRebuild) -> Result<T> + Send + 'static,
{
    let predicate = plan.attr.clone();
    tokio::task::spawn_blocking(move || work(store.as_ref(), &plan))
        .await
        .map_err(|err| MutationError::Rebuild {
            predicate,
            reason: err.to_string(),
        })?
}

fn spawn_rebuilds(ctx: RebuildCtx, rebuilds: Vec<IndexRebuild>) {
    let permits = rebuilds.len().min(ctx.opts.max_rebuilds_per_batch).max(1);
    let throttle = Arc::new(Semaphore::new(permits));
    for plan in rebuilds {
        let ctx = ctx.clone();
        let throttle = throttle.clone();
        tokio::spawn(async move {
            let Ok(_permit) = throttle.acquire_owned().await else {
                return;
            };
            rebuild(&ctx, plan).await;
            complete_if_idle(&ctx).await;
        });
    }
}

async fn rebuild(ctx: &RebuildCtx, plan: IndexRebuild) {
    ctx.metrics.rebuild_started();
    let predicate = plan.attr.clone();
    let su = plan.current_schema.clone();
    let start_ts = plan.start_ts;

    let built = run_blocking(ctx.store.clone(), plan, |store, plan| plan.build_indexes(store))
        .await
        .and_then(|written| {
            update_schema(&ctx.schema, ctx.metrics.as_ref(), &su, start_ts)?;
            Ok(written)
        });
    match built {
        Ok(written) => info!(predicate = %predicate, written, "worker.schema.rebuild_done"),
        Err(err) => {
            ctx.metrics.rebuild_failed();
            let err = MutationError::Rebuild {
                predicate: predicate.clone(),
                reason: err.to_string(),
            };
            error!(predicate = %predicate, error = %err, "worker.schema.rebuild_failed");
            undo_schema_update(&ctx.schema, &ctx.opts, &predicate).await;
        }
    }
}

async fn complete_if_idle(ctx: &RebuildCtx) {
    let Some(handle) = &ctx.handle else {
        return;
    };
    if ctx.schema.indexing_in_progress() || !handle.finish() {
        return;
    }
    let elapsed = handle.elapsed();
    info!(?elapsed, generation = handle.generation(), "worker.schema.indexing_done");
    if elapsed >= ctx.opts.snapshot_after_indexing && ctx.node.am_leader() {
        if let Err(err) = ctx.node.propose_snapshot().await {
            warn!(error = %err, "worker.schema.snapshot_failed");
        }
    }
}
