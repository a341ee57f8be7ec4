//! Batch-level data model: edges, per-shard mutation batches, and transaction context.

use serde::{Deserialize, Serialize};

use crate::schema::{SchemaUpdate, TypeUpdate};
use crate::types::{ShardId, Ts, Uid, ValueType};

/// Value marker meaning "all values" on delete edges.
pub const STAR: &[u8] = b"_STAR_ALL";

/// Operation carried by an edge.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum EdgeOp {
    /// Write the fact.
    Set,
    /// Retract the fact.
    Del,
}

/// Object of an edge: either another entity or a scalar payload.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum EdgeValue {
    /// Reference to another entity.
    Uid(Uid),
    /// Raw scalar bytes, interpreted according to the edge's value type.
    Bytes(Vec<u8>),
}

/// One fact to write or retract.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Edge {
    /// Predicate name.
    pub attr: String,
    /// Subject entity; zero for predicate-wide operations.
    pub entity: Uid,
    /// Object value.
    pub value: EdgeValue,
    /// Storage type of `value`; rewritten to the schema type by validation.
    pub value_type: ValueType,
    /// Optional language tag.
    pub lang: Option<String>,
    /// Set or delete.
    pub op: EdgeOp,
}

impl Edge {
    /// Builds a scalar edge.
    pub fn scalar(
        attr: impl Into<String>,
        entity: u64,
        value_type: ValueType,
        value: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            attr: attr.into(),
            entity: Uid(entity),
            value: EdgeValue::Bytes(value.into()),
            value_type,
            lang: None,
            op: EdgeOp::Set,
        }
    }

    /// Builds an entity-to-entity edge.
    pub fn uid(attr: impl Into<String>, entity: u64, object: u64) -> Self {
        Self {
            attr: attr.into(),
            entity: Uid(entity),
            value: EdgeValue::Uid(Uid(object)),
            value_type: ValueType::Uid,
            lang: None,
            op: EdgeOp::Set,
        }
    }

    /// Builds the wildcard edge that deletes an entire predicate.
    pub fn delete_predicate(attr: impl Into<String>) -> Self {
        Self {
            attr: attr.into(),
            entity: Uid(0),
            value: EdgeValue::Bytes(STAR.to_vec()),
            value_type: ValueType::Default,
            lang: None,
            op: EdgeOp::Del,
        }
    }

    /// Sets the language tag.
    pub fn with_lang(mut self, lang: impl Into<String>) -> Self {
        self.lang = Some(lang.into());
        self
    }

    /// Turns the edge into a delete.
    pub fn deleting(mut self) -> Self {
        self.op = EdgeOp::Del;
        self
    }

    /// Type implied by the edge payload: uid for entity references, else the tag.
    pub fn storage_type(&self) -> ValueType {
        match self.value {
            EdgeValue::Uid(_) => ValueType::Uid,
            EdgeValue::Bytes(_) => self.value_type,
        }
    }

    /// Returns `true` when the value is the "all values" marker.
    pub fn is_star(&self) -> bool {
        matches!(&self.value, EdgeValue::Bytes(bytes) if bytes.as_slice() == STAR)
    }

    /// Wildcard edge removing every value of the predicate for every entity.
    pub fn is_delete_predicate(&self) -> bool {
        self.entity.0 == 0 && self.is_star()
    }

    /// Raw payload bytes, empty for entity references.
    pub fn value_bytes(&self) -> &[u8] {
        match &self.value {
            EdgeValue::Bytes(bytes) => bytes,
            EdgeValue::Uid(_) => &[],
        }
    }
}

/// Destructive operation broadcast to every shard.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum DropOp {
    /// Remove all data and schema.
    All,
    /// Remove all data, keep schema and types.
    Data,
    /// Remove one predicate with its schema.
    Attr(String),
    /// Remove one type definition.
    Type(String),
}

/// A mutation batch, either as submitted or after partitioning for one shard.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Mutations {
    /// Destination shard; zero on client-submitted batches.
    pub shard: ShardId,
    /// Start timestamp of the transaction.
    pub start_ts: Ts,
    /// Edge writes and retractions.
    pub edges: Vec<Edge>,
    /// Predicate schema changes.
    pub schema: Vec<SchemaUpdate>,
    /// Type definitions.
    pub types: Vec<TypeUpdate>,
    /// Optional drop operation.
    pub drop_op: Option<DropOp>,
}

impl Mutations {
    /// Creates an empty batch for `start_ts`.
    pub fn new(start_ts: Ts) -> Self {
        Self {
            start_ts,
            ..Self::default()
        }
    }

    /// Returns `true` if the batch carries nothing to apply.
    pub fn is_empty(&self) -> bool {
        self.edges.is_empty()
            && self.schema.is_empty()
            && self.types.is_empty()
            && self.drop_op.is_none()
    }
}

/// Commit bookkeeping aggregated across every shard a batch touched.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxnContext {
    /// Start timestamp.
    pub start_ts: Ts,
    /// Commit timestamp; zero until committed.
    pub commit_ts: Ts,
    /// Conflict keys, formatted as `<shard>-<fingerprint>`.
    pub keys: Vec<String>,
    /// Touched predicates, formatted as `<shard>-<predicate>`.
    pub preds: Vec<String>,
    /// Whether the transaction was aborted (or discarded by the client).
    pub aborted: bool,
}

impl TxnContext {
    /// Creates an empty context for `start_ts`.
    pub fn new(start_ts: Ts) -> Self {
        Self {
            start_ts,
            ..Self::default()
        }
    }

    /// Appends the keys and predicates reported by a shard.
    pub fn merge(&mut self, other: TxnContext) {
        self.keys.extend(other.keys);
        self.preds.extend(other.preds);
    }

    /// Sorts and de-duplicates keys and predicates.
    pub fn dedup(&mut self) {
        self.keys.sort();
        self.keys.dedup();
        self.preds.sort();
        self.preds.dedup();
    }
}
