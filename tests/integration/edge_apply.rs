#![allow(missing_docs)]

use std::sync::Arc;

use sombra_mutation::cluster::local::LocalNode;
use sombra_mutation::cluster::Context;
use sombra_mutation::posting::{has_edges, PostingList, ReadMode, Txn};
use sombra_mutation::schema::{SchemaCtx, PERMISSION_PREDICATE};
use sombra_mutation::storage::{Key, KvStore, MemStore};
use sombra_mutation::telemetry::init_tracing;
use sombra_mutation::types::{MutationError, Result, Ts, Uid, ValidationError, ValueType};
use sombra_mutation::{DropOp, Edge, Mutations, SchemaUpdate, WorkerOptions};

fn start(opts: WorkerOptions) -> Result<LocalNode> {
    init_tracing("sombra_mutation=debug");
    LocalNode::start(opts, Arc::new(MemStore::new()))
}

async fn define(node: &LocalNode, su: SchemaUpdate) -> Result<()> {
    let mut m = Mutations::new(node.oracle.timestamp());
    m.schema.push(su);
    node.worker
        .mutate_over_network(&Context::background(), m)
        .await
        .result
}

async fn write(node: &LocalNode, edges: Vec<Edge>) -> Result<Ts> {
    let ctx = Context::background();
    let mut m = Mutations::new(node.oracle.timestamp());
    m.edges = edges;
    let tc = node.worker.mutate_over_network(&ctx, m).await.into_result()?;
    node.worker.commit_over_network(&ctx, tc).await
}

fn read(node: &LocalNode, attr: &str, entity: u64) -> Result<PostingList> {
    PostingList::read(
        node.store.as_ref(),
        Key::data(attr, Uid(entity)),
        Ts::MAX,
        ReadMode::Full,
    )
}

#[tokio::test]
async fn lang_edge_without_directive_never_touches_storage() -> Result<()> {
    let node = start(WorkerOptions::new())?;
    define(&node, SchemaUpdate::new("name", ValueType::String)).await?;

    let edge = Edge::scalar("name", 1, ValueType::String, "Alice").with_lang("en");
    let err = write(&node, vec![edge]).await.unwrap_err();
    assert!(matches!(
        err,
        MutationError::Validation(ValidationError::LangNotAllowed { .. })
    ));
    assert!(read(&node, "name", 1)?.is_empty());
    assert!(!has_edges(node.store.as_ref(), "name", Ts::MAX)?);
    Ok(())
}

#[tokio::test]
async fn default_string_becomes_little_endian_int() -> Result<()> {
    let node = start(WorkerOptions::new())?;
    define(&node, SchemaUpdate::new("age", ValueType::Int)).await?;

    write(&node, vec![Edge::scalar("age", 1, ValueType::Default, "30")]).await?;

    let postings = read(&node, "age", 1)?.postings();
    assert_eq!(postings.len(), 1);
    assert_eq!(postings[0].value_type, ValueType::Int);
    assert_eq!(postings[0].value, 30i64.to_le_bytes().to_vec());
    Ok(())
}

#[tokio::test]
async fn reapplying_identical_edge_is_a_no_op() -> Result<()> {
    let node = start(WorkerOptions::new())?;
    define(
        &node,
        SchemaUpdate::new("name", ValueType::String).indexed(&["exact"]),
    )
    .await?;
    write(&node, vec![Edge::scalar("name", 1, ValueType::String, "Alice")]).await?;
    let before = read(&node, "name", 1)?.postings();

    let txn = Txn::new(node.oracle.timestamp(), node.store.clone());
    let mut edge = Edge::scalar("name", 1, ValueType::String, "Alice");
    node.worker.run_mutation(&mut edge, &txn)?;
    assert_eq!(txn.dirty_lists(), 0);

    txn.commit_to_store(node.oracle.timestamp())?;
    assert_eq!(read(&node, "name", 1)?.postings(), before);
    Ok(())
}

#[tokio::test]
async fn permission_value_must_be_in_range() -> Result<()> {
    let node = start(WorkerOptions::new().acl_enabled(true))?;

    let nine = Edge::scalar(PERMISSION_PREDICATE, 7, ValueType::Default, "9");
    let err = write(&node, vec![nine]).await.unwrap_err();
    assert!(matches!(
        err,
        MutationError::Validation(ValidationError::PermissionOutOfRange { value: 9, .. })
    ));

    let seven = Edge::scalar(PERMISSION_PREDICATE, 7, ValueType::Default, "7");
    write(&node, vec![seven]).await?;
    let postings = read(&node, PERMISSION_PREDICATE, 7)?.postings();
    assert_eq!(postings[0].value, 7i64.to_le_bytes().to_vec());
    Ok(())
}

#[tokio::test]
async fn uid_edges_accumulate_in_lists() -> Result<()> {
    let node = start(WorkerOptions::new())?;
    write(
        &node,
        vec![Edge::uid("friend", 1, 2), Edge::uid("friend", 1, 3)],
    )
    .await?;
    write(&node, vec![Edge::uid("friend", 1, 4)]).await?;
    write(&node, vec![Edge::uid("friend", 1, 3).deleting()]).await?;

    let uids: Vec<u64> = read(&node, "friend", 1)?
        .postings()
        .iter()
        .map(|p| p.uid)
        .collect();
    assert_eq!(uids, vec![2, 4]);
    Ok(())
}

#[tokio::test]
async fn rejected_edge_leaves_rest_of_batch_unapplied() -> Result<()> {
    let node = start(WorkerOptions::new())?;
    let ctx = Context::background();
    define(&node, SchemaUpdate::new("name", ValueType::String)).await?;
    write(&node, vec![Edge::scalar("name", 1, ValueType::String, "Alice")]).await?;

    let mut m = Mutations::new(node.oracle.timestamp());
    m.schema.push(SchemaUpdate::new("age", ValueType::Int));
    m.edges
        .push(Edge::scalar("name", 2, ValueType::String, "Bob").with_lang("en"));
    let outcome = node.worker.mutate_over_network(&ctx, m).await;
    assert!(matches!(
        outcome.result,
        Err(MutationError::Validation(ValidationError::LangNotAllowed { .. }))
    ));
    assert!(node.worker.schema().get(SchemaCtx::Read, "age").is_none());
    assert!(node.store.latest(&Key::Schema("age".into()), Ts::MAX)?.is_none());

    let mut m = Mutations::new(node.oracle.timestamp());
    m.drop_op = Some(DropOp::Attr("name".into()));
    m.edges
        .push(Edge::scalar("name", 3, ValueType::String, "Eve").with_lang("en"));
    let outcome = node.worker.mutate_over_network(&ctx, m).await;
    assert!(matches!(
        outcome.result,
        Err(MutationError::Validation(ValidationError::LangNotAllowed { .. }))
    ));
    assert!(node.worker.schema().get(SchemaCtx::Read, "name").is_some());
    assert_eq!(read(&node, "name", 1)?.postings().len(), 1);
    Ok(())
}

#[tokio::test]
async fn uid_edge_refused_by_untyped_predicate() -> Result<()> {
    let node = start(WorkerOptions::new())?;
    write(&node, vec![Edge::scalar("note", 1, ValueType::Default, "hello")]).await?;

    let err = write(&node, vec![Edge::uid("note", 1, 2)]).await.unwrap_err();
    assert!(matches!(
        err,
        MutationError::Validation(ValidationError::ScalarGotUid { .. })
    ));
    let postings = read(&node, "note", 1)?.postings();
    assert_eq!(postings.len(), 1);
    assert_eq!(postings[0].value, b"hello".to_vec());
    Ok(())
}
