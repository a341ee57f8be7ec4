use std::fmt;

use xxhash_rust::xxh64::xxh64;

use crate::types::Uid;

const TAG_SCHEMA: u8 = 0x01;
const TAG_TYPE: u8 = 0x02;
const TAG_DATA: u8 = 0x10;
const TAG_INDEX: u8 = 0x11;
const TAG_REVERSE: u8 = 0x12;
const TAG_COUNT: u8 = 0x13;

/// Logical storage key.
///
/// Keys order by kind, then predicate, then payload, so every key of one kind for
/// one predicate is contiguous.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Key {
    /// Durable schema record of a predicate.
    Schema(String),
    /// Durable type definition.
    Type(String),
    /// Values of `attr` on entity `uid`.
    Data {
        /// Predicate.
        attr: String,
        /// Subject entity.
        uid: Uid,
    },
    /// Entities whose `attr` value produced `term`.
    Index {
        /// Predicate.
        attr: String,
        /// Tokenizer-prefixed term bytes.
        term: Vec<u8>,
    },
    /// Entities pointing at `uid` through `attr`.
    Reverse {
        /// Predicate.
        attr: String,
        /// Object entity.
        uid: Uid,
    },
    /// Entities having exactly `count` values of `attr`.
    Count {
        /// Predicate.
        attr: String,
        /// Number of values.
        count: u32,
        /// Counts reverse edges instead of forward ones.
        reverse: bool,
    },
}

impl Key {
    /// Data key for `attr` on `uid`.
    pub fn data(attr: impl Into<String>, uid: Uid) -> Self {
        Key::Data {
            attr: attr.into(),
            uid,
        }
    }

    /// Index key for `term` of `attr`.
    pub fn index(attr: impl Into<String>, term: Vec<u8>) -> Self {
        Key::Index {
            attr: attr.into(),
            term,
        }
    }

    /// Reverse key for object `uid` of `attr`.
    pub fn reverse(attr: impl Into<String>, uid: Uid) -> Self {
        Key::Reverse {
            attr: attr.into(),
            uid,
        }
    }

    /// Count key.
    pub fn count(attr: impl Into<String>, count: u32, reverse: bool) -> Self {
        Key::Count {
            attr: attr.into(),
            count,
            reverse,
        }
    }

    /// Predicate or type name the key belongs to.
    pub fn attr(&self) -> &str {
        match self {
            Key::Schema(attr) | Key::Type(attr) => attr,
            Key::Data { attr, .. }
            | Key::Index { attr, .. }
            | Key::Reverse { attr, .. }
            | Key::Count { attr, .. } => attr,
        }
    }

    /// Byte encoding of the key.
    pub fn encode(&self) -> Vec<u8> {
        let (tag, attr) = match self {
            Key::Schema(attr) => (TAG_SCHEMA, attr),
            Key::Type(attr) => (TAG_TYPE, attr),
            Key::Data { attr, .. } => (TAG_DATA, attr),
            Key::Index { attr, .. } => (TAG_INDEX, attr),
            Key::Reverse { attr, .. } => (TAG_REVERSE, attr),
            Key::Count { attr, .. } => (TAG_COUNT, attr),
        };
        let mut out = Vec::with_capacity(3 + attr.len() + 9);
        out.push(tag);
        out.extend_from_slice(&(attr.len() as u16).to_be_bytes());
        out.extend_from_slice(attr.as_bytes());
        match self {
            Key::Schema(_) | Key::Type(_) => {}
            Key::Data { uid, .. } | Key::Reverse { uid, .. } => {
                out.extend_from_slice(&uid.0.to_be_bytes())
            }
            Key::Index { term, .. } => out.extend_from_slice(term),
            Key::Count { count, reverse, .. } => {
                out.push(u8::from(*reverse));
                out.extend_from_slice(&count.to_be_bytes());
            }
        }
        out
    }

    /// Stable 64-bit fingerprint used for conflict detection.
    pub fn fingerprint(&self) -> u64 {
        xxh64(&self.encode(), 0)
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Key::Schema(attr) => write!(f, "schema/{attr}"),
            Key::Type(name) => write!(f, "type/{name}"),
            Key::Data { attr, uid } => write!(f, "data/{attr}/{uid}"),
            Key::Index { attr, term } => write!(f, "index/{attr}/{}", term.len()),
            Key::Reverse { attr, uid } => write!(f, "reverse/{attr}/{uid}"),
            Key::Count {
                attr,
                count,
                reverse,
            } => write!(f, "count/{attr}/{count}/{reverse}"),
        }
    }
}

/// Selects a contiguous family of keys.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum KeyPrefix {
    /// Data keys of one predicate.
    Data(String),
    /// Index keys of one predicate.
    Index(String),
    /// Reverse keys of one predicate.
    Reverse(String),
    /// Count keys of one predicate.
    Count(String),
    /// Index keys of one predicate whose term starts with a tokenizer identifier.
    Tokenizer(String, u8),
    /// Every data and derived key of one predicate, plus its schema record.
    Predicate(String),
    /// Every schema record.
    Schema,
    /// Every type record.
    Type,
    /// Every data and derived key of every predicate.
    AllData,
    /// Everything.
    All,
}

impl KeyPrefix {
    /// Returns `true` if `key` falls under the prefix.
    pub fn matches(&self, key: &Key) -> bool {
        match (self, key) {
            (KeyPrefix::All, _) => true,
            (KeyPrefix::Schema, Key::Schema(_)) | (KeyPrefix::Type, Key::Type(_)) => true,
            (KeyPrefix::AllData, key) => !matches!(key, Key::Schema(_) | Key::Type(_)),
            (KeyPrefix::Data(p), Key::Data { attr, .. })
            | (KeyPrefix::Index(p), Key::Index { attr, .. })
            | (KeyPrefix::Reverse(p), Key::Reverse { attr, .. })
            | (KeyPrefix::Count(p), Key::Count { attr, .. }) => p == attr,
            (KeyPrefix::Tokenizer(p, id), Key::Index { attr, term }) => {
                p == attr && term.first() == Some(id)
            }
            (KeyPrefix::Predicate(p), key) => !matches!(key, Key::Type(_)) && key.attr() == p,
            _ => false,
        }
    }
}
