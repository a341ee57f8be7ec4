//! Partitioning client batches by shard and dispatching them to shard leaders.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use rustc_hash::FxHashSet;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::Worker;
use crate::cluster::{Context, ShardClient};
use crate::model::{Mutations, TxnContext};
use crate::schema::{type_sanity_check, SchemaCtx, SchemaUpdate};
use crate::types::{MutationError, Result, ShardId, Ts, ValidationError};

/// Result of [`Worker::mutate_over_network`].
///
/// The transaction context is returned even when the batch failed so that the
/// caller can abort with every key the successful shards reported.
#[derive(Debug)]
pub struct BatchOutcome {
    /// Keys and predicates reported by the shards.
    pub txn: TxnContext,
    /// First error observed, if any shard failed.
    pub result: Result<()>,
}

impl BatchOutcome {
    /// Returns the context, or the error if the batch failed.
    pub fn into_result(self) -> Result<TxnContext> {
        self.result.map(|()| self.txn)
    }
}

struct ShardReply {
    shard: ShardId,
    txn: Option<TxnContext>,
    result: Result<()>,
}

impl Worker {
    /// Splits `m` by owning shard, proposes every part on its shard leader, and
    /// merges the transaction contexts they report.
    pub async fn mutate_over_network(self: &Arc<Self>, ctx: &Context, m: Mutations) -> BatchOutcome {
        let mut txn = TxnContext::new(m.start_ts);
        let result = self.dispatch(ctx, m, &mut txn).await;
        BatchOutcome { txn, result }
    }

    async fn dispatch(self: &Arc<Self>, ctx: &Context, m: Mutations, txn: &mut TxnContext) -> Result<()> {
        self.verify_types(ctx, &m).await?;
        let partitions = self.populate_mutation_map(m)?;
        if partitions.contains_key(&ShardId::NONE) {
            return Err(MutationError::NonExistentTablet);
        }

        let expected = partitions.len();
        let (tx, mut rx) = mpsc::channel(expected.max(1));
        for (shard, part) in partitions {
            let worker = self.clone();
            let ctx = ctx.clone();
            let tx = tx.clone();
            tokio::spawn(async move {
                let reply = worker.propose_or_send(&ctx, shard, part).await;
                let _ = tx.send(reply).await;
            });
        }
        drop(tx);

        let mut merged = TxnContext::new(txn.start_ts);
        let mut failure = None;
        for _ in 0..expected {
            tokio::select! {
                reply = rx.recv() => {
                    let Some(reply) = reply else {
                        return Err(MutationError::Invariant("shard task ended without a reply"));
                    };
                    if let Err(err) = reply.result {
                        warn!(shard = %reply.shard, error = %err, "worker.router.shard_failed");
                        failure = Some(err);
                    }
                    if let Some(reported) = reply.txn {
                        merged.merge(reported);
                    }
                }
                err = ctx.cancelled() => return Err(err),
            }
        }
        txn.merge(merged);
        match failure {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Checks that every field of every type update names a known predicate,
    /// either defined in this batch or already present in the cluster schema.
    async fn verify_types(&self, ctx: &Context, m: &Mutations) -> Result<()> {
        if m.types.is_empty() {
            return Ok(());
        }
        let in_batch: FxHashSet<&str> = m.schema.iter().map(|su| su.predicate.as_str()).collect();
        let mut wanted: Vec<(String, &str)> = Vec::new();
        for tu in &m.types {
            type_sanity_check(tu)?;
            for field in &tu.fields {
                let name = field
                    .predicate
                    .strip_prefix('~')
                    .unwrap_or(&field.predicate);
                if !in_batch.contains(name) {
                    wanted.push((name.to_owned(), tu.type_name.as_str()));
                }
            }
        }
        if wanted.is_empty() {
            return Ok(());
        }

        let predicates: Vec<String> = wanted.iter().map(|(name, _)| name.clone()).collect();
        let known: FxHashSet<String> = self
            .get_schema_over_network(ctx, &predicates)
            .await?
            .into_iter()
            .map(|su| su.predicate)
            .collect();
        for (field, type_name) in wanted {
            if !known.contains(&field) {
                return Err(ValidationError::UnknownTypeField {
                    field,
                    type_name: type_name.to_owned(),
                }
                .into());
            }
        }
        Ok(())
    }

    /// Edges and schema updates go to the shard owning their predicate; drop
    /// operations and type updates go to every known shard.
    fn populate_mutation_map(&self, src: Mutations) -> Result<BTreeMap<ShardId, Mutations>> {
        let start_ts = src.start_ts;
        let mut parts: BTreeMap<ShardId, Mutations> = BTreeMap::new();
        for edge in src.edges {
            let shard = self.membership.belongs_to(&edge.attr)?;
            part_for(&mut parts, shard, start_ts).edges.push(edge);
        }
        for su in src.schema {
            let shard = self.membership.belongs_to(&su.predicate)?;
            part_for(&mut parts, shard, start_ts).schema.push(su);
        }
        if src.drop_op.is_some() || !src.types.is_empty() {
            for shard in self.membership.known_shards() {
                let target = part_for(&mut parts, shard, start_ts);
                target.drop_op = src.drop_op.clone();
                target.types = src.types.clone();
            }
        }
        Ok(parts)
    }

    async fn propose_or_send(&self, ctx: &Context, shard: ShardId, m: Mutations) -> ShardReply {
        if self.membership.serves_shard(shard) {
            let mut txn = TxnContext::new(m.start_ts);
            let result = self.propose_and_wait(ctx, &mut txn, m).await;
            return ShardReply {
                shard,
                txn: Some(txn),
                result,
            };
        }
        let Some(leader) = self.membership.leader(shard) else {
            return ShardReply {
                shard,
                txn: None,
                result: Err(MutationError::NoConnection),
            };
        };
        debug!(shard = %shard, edges = m.edges.len(), "worker.router.forward");
        let (txn, result) = tokio::select! {
            reply = leader.mutate(ctx, m) => match reply {
                Ok(txn) => (Some(txn), Ok(())),
                Err(err) => (None, Err(err)),
            },
            err = ctx.cancelled() => (None, Err(err)),
        };
        ShardReply { shard, txn, result }
    }

    /// Proposes a shard-local batch and fills `txn` from the oracle's transaction,
    /// also when the proposal failed.
    async fn propose_and_wait(&self, ctx: &Context, txn: &mut TxnContext, m: Mutations) -> Result<()> {
        if self.opts.strict_mutations {
            for edge in &m.edges {
                self.schema.type_of(&edge.attr)?;
            }
        }
        self.validate_batch(&m)?;
        let start_ts = m.start_ts;
        self.oracle.wait_for_ts(ctx, start_ts).await?;
        let result = self.node.propose_and_wait(ctx, m).await;
        if let Some(handle) = self.oracle.get_txn(start_ts) {
            handle.fill_context(txn, self.membership.local_shard(), result.is_err());
        }
        result
    }

    /// Handles a batch forwarded by another node for a shard this node serves.
    pub async fn mutate(&self, ctx: &Context, m: Mutations) -> Result<TxnContext> {
        if let Some(err) = ctx.err() {
            return Err(err);
        }
        if !self.membership.serves_shard(m.shard) {
            return Err(MutationError::UnservedTablet(format!("shard {}", m.shard)));
        }
        let mut txn = TxnContext::new(m.start_ts);
        self.propose_and_wait(ctx, &mut txn, m).await?;
        Ok(txn)
    }

    /// Returns the schema of `predicates`, asking the owning shard leaders for the
    /// ones this node does not serve. Predicates no shard owns are skipped.
    pub async fn get_schema_over_network(
        &self,
        ctx: &Context,
        predicates: &[String],
    ) -> Result<Vec<SchemaUpdate>> {
        let mut by_shard: BTreeMap<ShardId, Vec<String>> = BTreeMap::new();
        for predicate in predicates {
            let shard = self.membership.belongs_to_read_only(predicate)?;
            if shard.is_none() {
                continue;
            }
            by_shard.entry(shard).or_default().push(predicate.clone());
        }

        let mut out = Vec::new();
        for (shard, wanted) in by_shard {
            if self.membership.serves_shard(shard) {
                out.extend(self.local_schema(&wanted));
                continue;
            }
            let leader = self
                .membership
                .leader(shard)
                .ok_or(MutationError::NoConnection)?;
            let remote = tokio::select! {
                reply = leader.schema(ctx, &wanted) => reply?,
                err = ctx.cancelled() => return Err(err),
            };
            out.extend(remote);
        }
        Ok(out)
    }

    fn local_schema(&self, predicates: &[String]) -> Vec<SchemaUpdate> {
        predicates
            .iter()
            .filter_map(|p| self.schema.get(SchemaCtx::Read, p))
            .collect()
    }
}

fn part_for(
    parts: &mut BTreeMap<ShardId, Mutations>,
    shard: ShardId,
    start_ts: Ts,
) -> &mut Mutations {
    parts.entry(shard).or_insert_with(|| Mutations {
        shard,
        start_ts,
        ..Mutations::default()
    })
}

#[async_trait]
impl ShardClient for Worker {
    async fn mutate(&self, ctx: &Context, m: Mutations) -> Result<TxnContext> {
        Worker::mutate(self, ctx, m).await
    }

    async fn schema(&self, ctx: &Context, predicates: &[String]) -> Result<Vec<SchemaUpdate>> {
        if let Some(err) = ctx.err() {
            return Err(err);
        }
        Ok(self.local_schema(predicates))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::local::{LocalNode, StaticMembership};
    use crate::model::{DropOp, Edge};
    use crate::options::WorkerOptions;
    use crate::schema::TypeUpdate;
    use crate::storage::MemStore;
    use crate::types::ValueType;

    fn two_shard_node() -> Result<LocalNode> {
        let membership = Arc::new(StaticMembership::new(ShardId(1)).assign_new_to(ShardId(1)));
        membership.assign("remote", ShardId(2));
        LocalNode::start_with_membership(WorkerOptions::new(), Arc::new(MemStore::new()), membership)
    }

    #[tokio::test]
    async fn partitions_follow_ownership_and_broadcast() -> Result<()> {
        let node = two_shard_node()?;
        let mut m = Mutations::new(3);
        m.edges.push(Edge::scalar("name", 1, ValueType::String, "a"));
        m.edges.push(Edge::scalar("remote", 1, ValueType::String, "b"));
        m.schema.push(SchemaUpdate::new("age", ValueType::Int));
        m.types.push(TypeUpdate::new("Person", &["name"]));
        m.drop_op = Some(DropOp::Attr("old".into()));

        let parts = node.worker.populate_mutation_map(m)?;
        assert_eq!(parts.len(), 2);
        let local = &parts[&ShardId(1)];
        assert_eq!(local.edges.len(), 1);
        assert_eq!(local.schema.len(), 1);
        assert_eq!(local.start_ts, 3);
        let remote = &parts[&ShardId(2)];
        assert_eq!(remote.edges[0].attr, "remote");
        assert_eq!(remote.types.len(), 1);
        assert_eq!(remote.drop_op, Some(DropOp::Attr("old".into())));
        Ok(())
    }

    #[tokio::test]
    async fn remote_shard_without_leader_is_no_connection() -> Result<()> {
        let node = two_shard_node()?;
        let mut m = Mutations::new(node.oracle.timestamp());
        m.edges.push(Edge::scalar("remote", 1, ValueType::String, "b"));
        let outcome = node.worker.mutate_over_network(&Context::background(), m).await;
        assert!(matches!(outcome.result, Err(MutationError::NoConnection)));
        Ok(())
    }

    #[tokio::test]
    async fn forwarded_batch_for_other_shard_is_refused() -> Result<()> {
        let node = two_shard_node()?;
        let mut m = Mutations::new(1);
        m.shard = ShardId(2);
        let err = node.worker.mutate(&Context::background(), m).await.unwrap_err();
        assert!(matches!(err, MutationError::UnservedTablet(_)));
        Ok(())
    }

    #[tokio::test]
    async fn strict_mutations_require_schema() -> Result<()> {
        let node = LocalNode::start(
            WorkerOptions::new().strict_mutations(true),
            Arc::new(MemStore::new()),
        )?;
        let mut m = Mutations::new(node.oracle.timestamp());
        m.edges.push(Edge::scalar("name", 1, ValueType::String, "a"));
        let outcome = node.worker.mutate_over_network(&Context::background(), m).await;
        assert!(matches!(
            outcome.result,
            Err(MutationError::Validation(ValidationError::MissingSchema { .. }))
        ));
        assert_eq!(node.consensus.proposals(), 0);
        Ok(())
    }
}
