#![allow(missing_docs)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use sombra_mutation::cluster::local::LocalNode;
use sombra_mutation::cluster::Context;
use sombra_mutation::schema::{Directive, SchemaCtx, VectorIndexSpec};
use sombra_mutation::storage::{Key, KeyPrefix, KvStore, MemStore, Version};
use sombra_mutation::telemetry::init_tracing;
use sombra_mutation::types::{MutationError, Result, Ts, ValidationError, ValueType};
use sombra_mutation::{Edge, Mutations, SchemaUpdate, WorkerOptions};

/// Store wrapper that slows down and counts full scans of data keys, logs scans
/// and drops in order, and can be armed to fail either.
#[derive(Default)]
struct ProbeStore {
    inner: MemStore,
    scan_delay: Duration,
    active_scans: AtomicUsize,
    max_active_scans: AtomicUsize,
    fail_data_scans: AtomicBool,
    fail_drops: AtomicBool,
    events: Mutex<Vec<String>>,
}

impl ProbeStore {
    fn slow(delay: Duration) -> Self {
        Self {
            scan_delay: delay,
            ..Self::default()
        }
    }
}

impl KvStore for ProbeStore {
    fn versions(&self, key: &Key, read_ts: Ts) -> Result<Vec<Version>> {
        self.inner.versions(key, read_ts)
    }

    fn scan(
        &self,
        prefix: &KeyPrefix,
        read_ts: Ts,
        visit: &mut dyn FnMut(&Key, &Version) -> Result<bool>,
    ) -> Result<()> {
        if !matches!(prefix, KeyPrefix::Data(_)) {
            return self.inner.scan(prefix, read_ts, visit);
        }
        if self.fail_data_scans.load(Ordering::SeqCst) {
            return Err(MutationError::Storage("injected scan failure".into()));
        }
        self.events.lock().push("scan".to_string());
        let active = self.active_scans.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active_scans.fetch_max(active, Ordering::SeqCst);
        std::thread::sleep(self.scan_delay);
        let out = self.inner.scan(prefix, read_ts, visit);
        self.active_scans.fetch_sub(1, Ordering::SeqCst);
        out
    }

    fn write_batch(&self, writes: Vec<(Key, Version)>) -> Result<()> {
        self.inner.write_batch(writes)
    }

    fn drop_prefix(&self, prefix: &KeyPrefix) -> Result<()> {
        if self.fail_drops.load(Ordering::SeqCst) {
            return Err(MutationError::Storage("injected drop failure".into()));
        }
        self.events.lock().push("drop".to_string());
        self.inner.drop_prefix(prefix)
    }
}

fn start(store: Arc<dyn KvStore>) -> Result<LocalNode> {
    start_with(WorkerOptions::new(), store)
}

fn start_with(opts: WorkerOptions, store: Arc<dyn KvStore>) -> Result<LocalNode> {
    init_tracing("sombra_mutation=debug");
    LocalNode::start(opts, store)
}

async fn alter(node: &LocalNode, su: SchemaUpdate) -> Result<()> {
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

fn live_keys(store: &dyn KvStore, prefix: KeyPrefix) -> Result<usize> {
    let mut count = 0;
    store.scan(&prefix, Ts::MAX, &mut |_, version| {
        if !version.is_empty_posting() {
            count += 1;
        }
        Ok(true)
    })?;
    Ok(count)
}

fn schema_of(node: &LocalNode, predicate: &str) -> SchemaUpdate {
    node.worker
        .schema()
        .get(SchemaCtx::Read, predicate)
        .expect("predicate has a schema")
}

#[tokio::test]
async fn dropping_index_with_data_removes_entries() -> Result<()> {
    let node = start(Arc::new(MemStore::new()))?;
    alter(&node, SchemaUpdate::new("name", ValueType::String).indexed(&["exact"])).await?;
    write(
        &node,
        vec![
            Edge::scalar("name", 1, ValueType::String, "Alice"),
            Edge::scalar("name", 2, ValueType::String, "Bob"),
        ],
    )
    .await?;
    assert_eq!(live_keys(node.store.as_ref(), KeyPrefix::Index("name".into()))?, 2);

    alter(&node, SchemaUpdate::new("name", ValueType::String)).await?;
    node.worker.wait_for_indexing().await;

    assert_eq!(live_keys(node.store.as_ref(), KeyPrefix::Index("name".into()))?, 0);
    assert!(schema_of(&node, "name").tokenizers.is_empty());
    assert_eq!(live_keys(node.store.as_ref(), KeyPrefix::Data("name".into()))?, 2);
    Ok(())
}

#[tokio::test]
async fn one_indexing_generation_at_a_time() -> Result<()> {
    let store = Arc::new(ProbeStore::slow(Duration::from_millis(30)));
    let node = start(store.clone())?;
    let predicates = ["title", "author", "genre", "publisher"];
    for (i, predicate) in predicates.iter().enumerate() {
        alter(&node, SchemaUpdate::new(*predicate, ValueType::String)).await?;
        write(
            &node,
            vec![Edge::scalar(*predicate, i as u64 + 1, ValueType::String, "some words")],
        )
        .await?;
    }

    let mut batches = Vec::new();
    for predicate in predicates {
        let worker = node.worker.clone();
        let ts = node.oracle.timestamp();
        batches.push(tokio::spawn(async move {
            let mut m = Mutations::new(ts);
            m.schema
                .push(SchemaUpdate::new(predicate, ValueType::String).indexed(&["term"]));
            worker
                .mutate_over_network(&Context::background(), m)
                .await
                .result
        }));
    }
    for batch in batches {
        batch.await.expect("batch task")?;
    }
    node.worker.wait_for_indexing().await;
    while node.metrics.rebuilds_started.load(Ordering::SeqCst) < predicates.len() as u64
        || node.worker.indexing_running()
    {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    assert_eq!(store.max_active_scans.load(Ordering::SeqCst), 1);
    for predicate in predicates {
        assert!(schema_of(&node, predicate).is_indexed());
        assert_eq!(
            live_keys(store.as_ref(), KeyPrefix::Index(predicate.into()))?,
            2,
            "term index of {predicate}"
        );
    }
    Ok(())
}

#[tokio::test]
async fn batch_rebuilds_after_setup_and_snapshots_once() -> Result<()> {
    let store = Arc::new(ProbeStore::slow(Duration::from_millis(10)));
    let opts = WorkerOptions::new()
        .max_rebuilds_per_batch(1)
        .snapshot_after_indexing(Duration::ZERO);
    let node = start_with(opts, store.clone())?;
    let predicates = ["title", "author", "genre"];
    for (i, predicate) in predicates.iter().enumerate() {
        alter(&node, SchemaUpdate::new(*predicate, ValueType::String).indexed(&["exact"])).await?;
        write(
            &node,
            vec![Edge::scalar(*predicate, i as u64 + 1, ValueType::String, "some words")],
        )
        .await?;
    }
    store.events.lock().clear();

    let mut m = Mutations::new(node.oracle.timestamp());
    for predicate in predicates {
        m.schema
            .push(SchemaUpdate::new(predicate, ValueType::String).indexed(&["term"]));
    }
    node.worker
        .mutate_over_network(&Context::background(), m)
        .await
        .result?;
    node.worker.wait_for_indexing().await;
    while node.metrics.rebuilds_started.load(Ordering::SeqCst) < predicates.len() as u64
        || node.worker.indexing_running()
    {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let events = store.events.lock().clone();
    let last_drop = events.iter().rposition(|e| e == "drop").expect("index drops");
    let first_scan = events.iter().position(|e| e == "scan").expect("rebuild scans");
    assert!(last_drop < first_scan, "events: {events:?}");
    assert_eq!(events.iter().filter(|e| *e == "scan").count(), predicates.len());
    assert_eq!(store.max_active_scans.load(Ordering::SeqCst), 1);
    assert_eq!(node.consensus.snapshots(), 1);
    for predicate in predicates {
        assert_eq!(schema_of(&node, predicate).tokenizers, vec!["term".to_string()]);
        assert_eq!(live_keys(store.as_ref(), KeyPrefix::Index(predicate.into()))?, 2);
    }
    Ok(())
}

#[tokio::test]
async fn failed_setup_restores_durable_schema() -> Result<()> {
    let store = Arc::new(ProbeStore::default());
    let node = start(store.clone())?;
    alter(&node, SchemaUpdate::new("name", ValueType::String).indexed(&["exact"])).await?;
    write(&node, vec![Edge::scalar("name", 1, ValueType::String, "Alice")]).await?;

    store.fail_drops.store(true, Ordering::SeqCst);
    let err = alter(&node, SchemaUpdate::new("name", ValueType::String).indexed(&["term"]))
        .await
        .unwrap_err();
    assert!(matches!(err, MutationError::Storage(_)));

    assert_eq!(schema_of(&node, "name").tokenizers, vec!["exact".to_string()]);
    assert!(!node.worker.schema().indexing_in_progress());
    node.worker.wait_for_indexing().await;
    assert!(!node.worker.indexing_running());
    Ok(())
}

#[tokio::test]
async fn failed_rebuild_reverts_in_background() -> Result<()> {
    let store = Arc::new(ProbeStore::default());
    let node = start(store.clone())?;
    alter(&node, SchemaUpdate::new("name", ValueType::String).indexed(&["exact"])).await?;
    write(&node, vec![Edge::scalar("name", 1, ValueType::String, "Alice")]).await?;

    store.fail_data_scans.store(true, Ordering::SeqCst);
    alter(
        &node,
        SchemaUpdate::new("name", ValueType::String).indexed(&["exact", "term"]),
    )
    .await?;
    node.worker.wait_for_indexing().await;

    assert_eq!(node.metrics.rebuilds_failed.load(Ordering::SeqCst), 1);
    assert_eq!(schema_of(&node, "name").tokenizers, vec!["exact".to_string()]);
    assert!(!node.worker.schema().indexing_in_progress());
    Ok(())
}

#[tokio::test]
async fn uid_scalar_flip_needs_empty_predicate() -> Result<()> {
    let node = start(Arc::new(MemStore::new()))?;
    alter(&node, SchemaUpdate::new("friend", ValueType::Uid).list()).await?;
    write(&node, vec![Edge::uid("friend", 1, 2)]).await?;

    let err = alter(&node, SchemaUpdate::new("friend", ValueType::String))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        MutationError::Validation(ValidationError::ShapeChangeWithData { .. })
    ));
    assert_eq!(schema_of(&node, "friend").value_type, ValueType::Uid);

    alter(&node, SchemaUpdate::new("spare", ValueType::Uid)).await?;
    alter(&node, SchemaUpdate::new("spare", ValueType::String)).await?;
    node.worker.wait_for_indexing().await;
    assert_eq!(schema_of(&node, "spare").value_type, ValueType::String);
    Ok(())
}

#[tokio::test]
async fn index_directive_needs_tokenizer_or_vector_spec() -> Result<()> {
    let node = start(Arc::new(MemStore::new()))?;

    let mut bare = SchemaUpdate::new("title", ValueType::String);
    bare.directive = Directive::Index;
    let err = alter(&node, bare).await.unwrap_err();
    assert!(matches!(
        err,
        MutationError::Validation(ValidationError::TokenizerRequired { .. })
    ));

    let mut vector = SchemaUpdate::new("embedding", ValueType::VFloat);
    vector.directive = Directive::Index;
    vector.index_specs.push(VectorIndexSpec {
        name: "hnsw".into(),
        options: vec![("metric".into(), "euclidean".into())],
    });
    alter(&node, vector).await?;
    assert_eq!(schema_of(&node, "embedding").index_specs.len(), 1);
    Ok(())
}
