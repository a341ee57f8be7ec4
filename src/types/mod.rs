//! Shared identifiers, value types, and the crate error type.

use std::fmt;

use serde::{Deserialize, Serialize};

pub mod convert;
mod error;

pub use convert::{convert, decode, marshal, Val, Value};
pub use error::{ConvertError, ErrorKind, MutationError, Result, ValidationError};

/// Entity identifier in the graph.
#[derive(
    Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Default, Serialize, Deserialize,
)]
pub struct Uid(pub u64);

/// Logical timestamp handed out by the transaction oracle.
pub type Ts = u64;

/// Identifier of a shard (replication group) owning a disjoint set of predicates.
#[derive(
    Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Default, Serialize, Deserialize,
)]
pub struct ShardId(pub u32);

impl ShardId {
    /// Sentinel returned by membership when no shard owns a predicate.
    pub const NONE: ShardId = ShardId(0);

    /// Returns `true` for the "no owning shard" sentinel.
    pub fn is_none(self) -> bool {
        self == Self::NONE
    }
}

impl fmt::Display for Uid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl fmt::Display for ShardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for Uid {
    fn from(value: u64) -> Self {
        Uid(value)
    }
}

impl From<u32> for ShardId {
    fn from(value: u32) -> Self {
        ShardId(value)
    }
}

/// Declared or stored type of a predicate value.
///
/// The same enum is used for schema types and for the storage type carried by an
/// edge; after validation an edge's type is always its predicate's schema type.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Default, Serialize, Deserialize)]
pub enum ValueType {
    /// No concrete type yet; values are untyped strings.
    #[default]
    Default,
    /// Opaque bytes.
    Binary,
    /// Signed 64-bit integer.
    Int,
    /// 64-bit float.
    Float,
    /// Boolean.
    Bool,
    /// RFC 3339 timestamp.
    DateTime,
    /// UTF-8 string.
    String,
    /// Password; may never change type once declared.
    Password,
    /// Vector of 32-bit floats.
    VFloat,
    /// Reference to another entity.
    Uid,
    /// Nested object; only meaningful in type definitions.
    Object,
}

impl ValueType {
    /// Every type except uid (and object references) holds a scalar value.
    pub fn is_scalar(self) -> bool {
        !matches!(self, ValueType::Uid | ValueType::Object)
    }

    /// Lower-case name used in error messages and schema dumps.
    pub fn name(self) -> &'static str {
        match self {
            ValueType::Default => "default",
            ValueType::Binary => "binary",
            ValueType::Int => "int",
            ValueType::Float => "float",
            ValueType::Bool => "bool",
            ValueType::DateTime => "datetime",
            ValueType::String => "string",
            ValueType::Password => "password",
            ValueType::VFloat => "float32vector",
            ValueType::Uid => "uid",
            ValueType::Object => "object",
        }
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
