//! Write path of a sharded graph database.
//!
//! Client batches of edges, schema updates, type definitions, and drop operations
//! are partitioned by owning shard, proposed through each shard's consensus log,
//! validated and converted against the live schema, and applied to posting lists
//! together with their index, reverse, and count keys. Schema changes that need
//! new indexes are published immediately and rebuilt in the background.
//!
//! The entry point is [`worker::Worker`]; [`cluster::local::LocalNode`] wires it to
//! single-node collaborators over an in-memory [`storage::MemStore`].

#![warn(missing_docs)]

pub mod cluster;
pub mod metrics;
pub mod model;
pub mod options;
pub mod posting;
pub mod primitives;
pub mod schema;
pub mod storage;
pub mod telemetry;
pub mod types;
pub mod worker;

pub use cluster::Context;
pub use model::{DropOp, Edge, EdgeOp, EdgeValue, Mutations, TxnContext};
pub use options::WorkerOptions;
pub use schema::{SchemaUpdate, TypeUpdate};
pub use types::{ErrorKind, MutationError, Result, ShardId, Ts, Uid, ValueType};
pub use worker::{BatchOutcome, Worker};
