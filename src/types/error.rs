use thiserror::Error;

use super::ValueType;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, MutationError>;

/// Errors surfaced by the write path.
///
/// The variants form a closed taxonomy; [`MutationError::kind`] groups them into the
/// categories callers branch on (retry, report, abort).
#[derive(Debug, Error)]
pub enum MutationError {
    /// No shard currently serves the predicate.
    #[error("Requested predicate is not being served by any tablet")]
    NonExistentTablet,
    /// The contacted node does not own the predicate or shard.
    #[error("tablet isn't being served by this instance: {0}")]
    UnservedTablet(String),
    /// Edge or schema failed a validation rule.
    #[error(transparent)]
    Validation(#[from] ValidationError),
    /// Value could not be converted to the schema's declared type.
    #[error("predicate {predicate}: cannot convert {from} to {to}: {source}")]
    Conversion {
        /// Predicate the edge was written to.
        predicate: String,
        /// Storage type carried by the edge.
        from: ValueType,
        /// Schema type the value was converted to.
        to: ValueType,
        /// Underlying conversion failure.
        #[source]
        source: ConvertError,
    },
    /// RPC to a remote shard leader failed.
    #[error("network error: {0}")]
    Network(String),
    /// No connection to the leader of the requested shard.
    #[error("no connection available")]
    NoConnection,
    /// Caller cancelled the operation.
    #[error("context canceled")]
    Cancelled,
    /// Caller deadline elapsed.
    #[error("context deadline exceeded")]
    DeadlineExceeded,
    /// Index rebuild failed after the schema was published in memory.
    #[error("index rebuild for {predicate} failed: {reason}")]
    Rebuild {
        /// Predicate being rebuilt.
        predicate: String,
        /// Failure description.
        reason: String,
    },
    /// The oracle refused to commit the transaction.
    #[error("Transaction has been aborted. Please retry")]
    Aborted,
    /// Storage engine failure.
    #[error("storage: {0}")]
    Storage(String),
    /// Internal invariant violated.
    #[error("invariant violated: {0}")]
    Invariant(&'static str),
    /// Invalid worker configuration.
    #[error("config: {0}")]
    Config(String),
}

/// Coarse classification of [`MutationError`] variants.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ErrorKind {
    /// Predicate routing failed.
    Routing,
    /// Edge or schema rejected.
    Validation,
    /// Value conversion failed.
    Conversion,
    /// Transport failure or caller cancellation.
    Network,
    /// Background index rebuild failed.
    Rebuild,
    /// Transaction aborted by the oracle.
    Conflict,
    /// Storage, configuration, or invariant failures.
    Internal,
}

impl MutationError {
    /// Returns the category of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            MutationError::NonExistentTablet | MutationError::UnservedTablet(_) => {
                ErrorKind::Routing
            }
            MutationError::Validation(_) => ErrorKind::Validation,
            MutationError::Conversion { .. } => ErrorKind::Conversion,
            MutationError::Network(_)
            | MutationError::NoConnection
            | MutationError::Cancelled
            | MutationError::DeadlineExceeded => ErrorKind::Network,
            MutationError::Rebuild { .. } => ErrorKind::Rebuild,
            MutationError::Aborted => ErrorKind::Conflict,
            MutationError::Storage(_) | MutationError::Invariant(_) | MutationError::Config(_) => {
                ErrorKind::Internal
            }
        }
    }

    /// Builds a [`MutationError::Storage`] from any displayable error.
    pub fn storage(err: impl std::fmt::Display) -> Self {
        MutationError::Storage(err.to_string())
    }
}

/// Validation failures for edges, schema updates, and type updates.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    /// Language-tagged edge against a predicate without `@lang`.
    #[error("Attr: [{predicate}] should have @lang directive in schema to mutate edge with lang tag")]
    LangNotAllowed { predicate: String },
    /// Scalar value written to a uid predicate.
    #[error("Input for predicate {predicate:?} of type uid is scalar")]
    UidGotScalar { predicate: String },
    /// Uid value written to a scalar predicate.
    #[error("Input for predicate {predicate:?} of type scalar is uid")]
    ScalarGotUid { predicate: String },
    /// Non-vector value written to a vector predicate.
    #[error("Input for predicate {predicate:?} of type vector is not vector. Did you forget to add quotes before []?")]
    VectorExpected { predicate: String },
    /// Permission predicate value is not an integer.
    #[error("Value for predicate <{predicate}> should be of type int")]
    PermissionNotInt { predicate: String },
    /// Permission predicate value outside `[0, 7]`.
    #[error("Can't set <{predicate}> to {value}, Value for this predicate should be between 0 and 7")]
    PermissionOutOfRange { predicate: String, value: i64 },
    /// Edge arrived for a predicate without a schema.
    #[error("Unable to find schema for {predicate}")]
    MissingSchema { predicate: String },
    /// Schema update without a predicate name.
    #[error("No predicate specified in schema mutation")]
    NoPredicate,
    /// Schema update targets a reserved internal predicate.
    #[error("Cannot create user-defined predicate with internal name {predicate}")]
    InternalPredicate { predicate: String },
    /// Index directive without tokenizers.
    #[error("Tokenizer must be specified while indexing predicate {predicate}")]
    TokenizerRequired { predicate: String },
    /// Tokenizers without the index directive.
    #[error("Directive must be @index when a tokenizer is specified on {predicate}")]
    IndexDirectiveRequired { predicate: String },
    /// Index directive on a uid predicate.
    #[error("Index not allowed on predicate of type uid on predicate {predicate}")]
    IndexOnUid { predicate: String },
    /// Reverse directive on a scalar predicate.
    #[error("Cannot reverse for non-uid type on predicate {predicate}")]
    ReverseOnScalar { predicate: String },
    /// Upsert without tokenizer or unique.
    #[error("Index tokenizer is mandatory for: [{predicate}] when specifying @upsert directive")]
    UpsertWithoutIndex { predicate: String },
    /// Unique predicate update drops upsert.
    #[error("could not drop @upsert from [{predicate}] predicate when @unique directive specified")]
    UniqueDropsUpsert { predicate: String },
    /// Unique predicate update drops its unique-compatible index.
    #[error("could not drop index {tokenizers:?} from [{predicate}] predicate when @unique directive specified")]
    UniqueDropsIndex {
        predicate: String,
        tokenizers: Vec<String>,
    },
    /// Unique predicate lacks the required tokenizer.
    #[error("index for predicate [{predicate}] is missing, add {hint} index with @unique")]
    UniqueIndexMissing {
        predicate: String,
        hint: &'static str,
    },
    /// Unique on an unsupported value type.
    #[error("@unique directive not supported on [{value_type}] type predicate")]
    UniqueUnsupportedType { value_type: ValueType },
    /// Tokenizer name not recognised.
    #[error("Invalid tokenizer {tokenizer} on predicate {predicate}")]
    UnknownTokenizer {
        predicate: String,
        tokenizer: String,
    },
    /// Tokenizer cannot index the predicate's value type.
    #[error("Tokenizer {tokenizer} isn't valid for predicate {predicate} of type {value_type}")]
    TokenizerTypeMismatch {
        predicate: String,
        tokenizer: String,
        value_type: ValueType,
    },
    /// Password type changed to or from another type.
    #[error("Schema change not allowed from {from} to {to}")]
    PasswordTypeChange { from: ValueType, to: ValueType },
    /// List predicate turned into a scalar while it has data.
    #[error("Schema change not allowed from [{from}] => {to} without deleting pred: {predicate}")]
    ListChangeWithData {
        predicate: String,
        from: ValueType,
        to: ValueType,
    },
    /// Uid/scalar flip while the predicate has data.
    #[error("Schema change not allowed from scalar to uid or vice versa while there is data for pred: {predicate}")]
    ShapeChangeWithData { predicate: String },
    /// Type update without a name.
    #[error("Type name must be specified in type update")]
    TypeNameMissing,
    /// Type field without a predicate name.
    #[error("Field in type definition must have a name")]
    FieldNameMissing,
    /// Object field without object type name.
    #[error("Field with value type OBJECT must specify the name of the object type")]
    ObjectTypeNameMissing,
    /// Type field carrying a directive.
    #[error("Field in type definition cannot have a directive")]
    FieldDirective,
    /// Type field carrying tokenizers.
    #[error("Field in type definition cannot have tokenizers")]
    FieldTokenizer,
    /// Type field with no matching predicate.
    #[error("Schema does not contain a matching predicate for field {field} in type {type_name}")]
    UnknownTypeField { field: String, type_name: String },
}

/// Failures of the shared value-conversion routine.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConvertError {
    /// No conversion exists between the two types.
    #[error("conversion from {from} to {to} is not supported")]
    Unsupported { from: ValueType, to: ValueType },
    /// Textual input could not be parsed.
    #[error("unable to parse {input:?} as {to}")]
    Parse { input: String, to: ValueType },
    /// Stored bytes do not match the type's binary layout.
    #[error("malformed {ty} payload: {reason}")]
    Malformed { ty: ValueType, reason: &'static str },
    /// NaN or infinite floats are rejected.
    #[error("got invalid value: {0}")]
    NonFinite(String),
    /// Numeric value outside the target range.
    #[error("value out of range for {to}")]
    OutOfRange { to: ValueType },
    /// Password shorter than the minimum length.
    #[error("password too short, i.e. should have at least {min} chars")]
    PasswordTooShort { min: usize },
}
