#![allow(missing_docs)]

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use sombra_mutation::cluster::local::{LocalNode, StaticMembership};
use sombra_mutation::cluster::{Context, ShardClient};
use sombra_mutation::schema::TypeUpdate;
use sombra_mutation::storage::MemStore;
use sombra_mutation::types::{
    ErrorKind, MutationError, Result, ShardId, ValidationError, ValueType,
};
use sombra_mutation::{Edge, Mutations, SchemaUpdate, TxnContext, WorkerOptions};

/// Remote leader whose RPCs always fail.
struct UnreachableShard;

#[async_trait]
impl ShardClient for UnreachableShard {
    async fn mutate(&self, _ctx: &Context, _m: Mutations) -> Result<TxnContext> {
        Err(MutationError::Network("connection reset by peer".into()))
    }

    async fn schema(&self, _ctx: &Context, _predicates: &[String]) -> Result<Vec<SchemaUpdate>> {
        Err(MutationError::Network("connection reset by peer".into()))
    }
}

/// Remote leader that never answers.
struct HungShard;

#[async_trait]
impl ShardClient for HungShard {
    async fn mutate(&self, _ctx: &Context, _m: Mutations) -> Result<TxnContext> {
        std::future::pending::<Result<TxnContext>>().await
    }

    async fn schema(&self, _ctx: &Context, _predicates: &[String]) -> Result<Vec<SchemaUpdate>> {
        std::future::pending::<Result<Vec<SchemaUpdate>>>().await
    }
}

fn node_with_remote(remote: Arc<dyn ShardClient>) -> Result<LocalNode> {
    let membership = Arc::new(StaticMembership::new(ShardId(1)).assign_new_to(ShardId(1)));
    membership.assign("city", ShardId(2));
    membership.add_leader(ShardId(2), remote);
    LocalNode::start_with_membership(WorkerOptions::new(), Arc::new(MemStore::new()), membership)
}

fn two_shard_batch(node: &LocalNode) -> Mutations {
    let mut m = Mutations::new(node.oracle.timestamp());
    m.edges.push(Edge::scalar("name", 1, ValueType::String, "Alice"));
    m.edges.push(Edge::scalar("city", 1, ValueType::String, "Oslo"));
    m
}

#[tokio::test]
async fn failing_shard_fails_batch_but_keeps_local_keys() -> Result<()> {
    let node = node_with_remote(Arc::new(UnreachableShard))?;
    let m = two_shard_batch(&node);

    let outcome = node
        .worker
        .mutate_over_network(&Context::background(), m)
        .await;
    let err = outcome.result.as_ref().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Network);
    assert!(!outcome.txn.keys.is_empty());
    assert!(outcome.txn.keys.iter().all(|k| k.starts_with("1-")));
    assert!(outcome.txn.preds.contains(&"1-name".to_string()));
    Ok(())
}

#[tokio::test]
async fn cancellation_returns_without_partial_results() -> Result<()> {
    let node = node_with_remote(Arc::new(HungShard))?;
    let m = two_shard_batch(&node);
    let (ctx, cancel) = Context::with_cancel();

    let worker = node.worker.clone();
    let task = tokio::spawn(async move { worker.mutate_over_network(&ctx, m).await });
    tokio::time::sleep(Duration::from_millis(20)).await;
    cancel.cancel();

    let outcome = tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .expect("aggregator returns after cancellation")
        .expect("task joins");
    assert!(matches!(outcome.result, Err(MutationError::Cancelled)));
    assert!(outcome.txn.keys.is_empty());
    assert!(outcome.txn.preds.is_empty());
    Ok(())
}

#[tokio::test]
async fn unowned_predicate_fails_before_any_proposal() -> Result<()> {
    let membership = Arc::new(StaticMembership::new(ShardId(1)));
    membership.assign("name", ShardId(1));
    let node =
        LocalNode::start_with_membership(WorkerOptions::new(), Arc::new(MemStore::new()), membership)?;

    let mut m = Mutations::new(node.oracle.timestamp());
    m.edges.push(Edge::scalar("name", 1, ValueType::String, "Alice"));
    m.edges.push(Edge::scalar("orphan", 1, ValueType::String, "x"));
    let outcome = node
        .worker
        .mutate_over_network(&Context::background(), m)
        .await;
    assert!(matches!(outcome.result, Err(MutationError::NonExistentTablet)));
    assert_eq!(node.consensus.proposals(), 0);
    Ok(())
}

#[tokio::test]
async fn remote_worker_reports_its_own_keys() -> Result<()> {
    let remote = LocalNode::start_with_membership(
        WorkerOptions::new(),
        Arc::new(MemStore::new()),
        Arc::new(StaticMembership::new(ShardId(2)).assign_new_to(ShardId(2))),
    )?;
    let node = node_with_remote(remote.worker.clone())?;
    let m = two_shard_batch(&node);
    remote.oracle.advance(m.start_ts);

    let tc = node
        .worker
        .mutate_over_network(&Context::background(), m)
        .await
        .into_result()?;
    assert!(tc.keys.iter().any(|k| k.starts_with("1-")));
    assert!(tc.keys.iter().any(|k| k.starts_with("2-")));
    assert!(tc.preds.contains(&"2-city".to_string()));

    let schema = node
        .worker
        .get_schema_over_network(
            &Context::background(),
            &["city".to_string(), "name".to_string(), "unknown".to_string()],
        )
        .await?;
    let mut names: Vec<String> = schema.into_iter().map(|su| su.predicate).collect();
    names.sort();
    assert_eq!(names, vec!["city".to_string(), "name".to_string()]);
    Ok(())
}

#[tokio::test]
async fn type_fields_must_name_known_predicates() -> Result<()> {
    let node = node_with_remote(Arc::new(UnreachableShard))?;
    let ctx = Context::background();

    let mut m = Mutations::new(node.oracle.timestamp());
    m.schema.push(SchemaUpdate::new("friend", ValueType::Uid).list());
    node.worker.mutate_over_network(&ctx, m).await.result?;

    let mut m = Mutations::new(node.oracle.timestamp());
    m.schema.push(SchemaUpdate::new("age", ValueType::Int));
    m.types.push(TypeUpdate::new("Person", &["~friend", "age"]));
    let outcome = node.worker.mutate_over_network(&ctx, m).await;
    assert!(matches!(outcome.result, Err(MutationError::Network(_))));

    let mut m = Mutations::new(node.oracle.timestamp());
    m.types.push(TypeUpdate::new("Pet", &["~friend", "species"]));
    let outcome = node.worker.mutate_over_network(&ctx, m).await;
    assert!(matches!(
        outcome.result,
        Err(MutationError::Validation(ValidationError::UnknownTypeField { ref field, .. })) if field == "species"
    ));

    let mut m = Mutations::new(node.oracle.timestamp());
    m.types.push(TypeUpdate::new("", &["friend"]));
    let outcome = node.worker.mutate_over_network(&ctx, m).await;
    assert!(matches!(
        outcome.result,
        Err(MutationError::Validation(ValidationError::TypeNameMissing))
    ));
    Ok(())
}
