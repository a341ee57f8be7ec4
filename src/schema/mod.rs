//! Predicate and type schema definitions.
//!
//! [`SchemaUpdate`] is the declared shape of one predicate, [`TypeUpdate`] a named
//! composite type. [`SchemaState`] holds the live in-memory view and [`check`]
//! validates proposed changes against it.

use serde::{Deserialize, Serialize};

use crate::types::ValueType;

pub mod check;
mod state;

pub use check::{check_schema, type_sanity_check, validate_schema_for_unique};
pub use state::{SchemaCtx, SchemaState};

/// Predicate holding access-control permission bits.
pub const PERMISSION_PREDICATE: &str = "sombra.rule.permission";

/// Predicates reserved for internal use; user schema may not redefine them.
pub const RESERVED_PREDICATES: &[&str] = &[
    "sombra.type",
    "sombra.xid",
    "sombra.password",
    "sombra.user.group",
    "sombra.acl.rule",
    "sombra.rule.predicate",
    PERMISSION_PREDICATE,
    "sombra.graphql.schema",
];

/// Returns `true` if `predicate` is reserved for internal use.
pub fn is_internal_predicate(predicate: &str) -> bool {
    RESERVED_PREDICATES.contains(&predicate)
}

/// Indexing directive attached to a predicate.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum Directive {
    /// No index or reverse edges.
    #[default]
    None,
    /// Tokenized secondary index.
    Index,
    /// Reverse edges for uid predicates.
    Reverse,
}

/// Vector index declaration (e.g. `hnsw`), validated and recorded but built elsewhere.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct VectorIndexSpec {
    /// Index family name.
    pub name: String,
    /// Free-form options such as metric or exponent.
    pub options: Vec<(String, String)>,
}

/// Declared shape and indexing of one predicate.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SchemaUpdate {
    pub predicate: String,
    pub value_type: ValueType,
    pub list: bool,
    pub directive: Directive,
    pub tokenizers: Vec<String>,
    pub count: bool,
    pub upsert: bool,
    pub lang: bool,
    pub unique: bool,
    pub index_specs: Vec<VectorIndexSpec>,
}

impl SchemaUpdate {
    /// Creates a schema with no directives.
    pub fn new(predicate: impl Into<String>, value_type: ValueType) -> Self {
        Self {
            predicate: predicate.into(),
            value_type,
            ..Self::default()
        }
    }

    /// Adds an index directive with the given tokenizers.
    pub fn indexed(mut self, tokenizers: &[&str]) -> Self {
        self.directive = Directive::Index;
        self.tokenizers = tokenizers.iter().map(|t| (*t).to_owned()).collect();
        self
    }

    /// Adds the reverse directive.
    pub fn reversed(mut self) -> Self {
        self.directive = Directive::Reverse;
        self
    }

    /// Marks the predicate as a list.
    pub fn list(mut self) -> Self {
        self.list = true;
        self
    }

    /// Enables the count index.
    pub fn counted(mut self) -> Self {
        self.count = true;
        self
    }

    /// Enables language-tagged values.
    pub fn with_lang(mut self) -> Self {
        self.lang = true;
        self
    }

    /// Enables the upsert directive.
    pub fn upsert(mut self) -> Self {
        self.upsert = true;
        self
    }

    /// Enables the uniqueness directive.
    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    /// Returns `true` if the schema declares tokenizers or a vector index.
    pub fn has_tokenizer_or_vector_spec(&self) -> bool {
        !self.tokenizers.is_empty() || !self.index_specs.is_empty()
    }

    /// Returns `true` if the schema builds a tokenized index.
    pub fn is_indexed(&self) -> bool {
        self.directive == Directive::Index && !self.tokenizers.is_empty()
    }

    /// Returns `true` if reverse edges are maintained.
    pub fn is_reversed(&self) -> bool {
        self.directive == Directive::Reverse
    }
}

/// One field of a [`TypeUpdate`].
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TypeField {
    /// Predicate backing the field; `~name` refers to the reverse of `name`.
    pub predicate: String,
    pub value_type: ValueType,
    /// Target type for object fields.
    pub object_type_name: Option<String>,
    pub directive: Directive,
    pub tokenizers: Vec<String>,
}

impl TypeField {
    /// Creates a field backed by `predicate`.
    pub fn new(predicate: impl Into<String>) -> Self {
        Self {
            predicate: predicate.into(),
            ..Self::default()
        }
    }
}

/// Named composite type.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TypeUpdate {
    pub type_name: String,
    pub fields: Vec<TypeField>,
}

impl TypeUpdate {
    /// Creates a type over the given predicates.
    pub fn new(type_name: impl Into<String>, predicates: &[&str]) -> Self {
        Self {
            type_name: type_name.into(),
            fields: predicates.iter().map(|p| TypeField::new(*p)).collect(),
        }
    }
}

/// Schema installed for reserved predicates at start-up.
pub fn initial_schema(acl_enabled: bool) -> Vec<SchemaUpdate> {
    let mut out = vec![
        SchemaUpdate::new("sombra.type", ValueType::String)
            .list()
            .indexed(&["exact"]),
        SchemaUpdate::new("sombra.graphql.schema", ValueType::String),
    ];
    if acl_enabled {
        out.extend([
            SchemaUpdate::new("sombra.xid", ValueType::String)
                .indexed(&["exact"])
                .upsert(),
            SchemaUpdate::new("sombra.password", ValueType::Password),
            SchemaUpdate::new("sombra.user.group", ValueType::Uid)
                .list()
                .reversed(),
            SchemaUpdate::new("sombra.acl.rule", ValueType::Uid).list(),
            SchemaUpdate::new("sombra.rule.predicate", ValueType::String)
                .indexed(&["exact"])
                .upsert(),
            SchemaUpdate::new(PERMISSION_PREDICATE, ValueType::Int),
        ]);
    }
    out
}
