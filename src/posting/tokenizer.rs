//! Index tokenizers.
//!
//! A tokenizer turns a value into the terms under which its entity is indexed.
//! Every term is prefixed with the tokenizer's identifier byte so that several
//! tokenizers can share one predicate's index key space.

use xxhash_rust::xxh64::xxh64;

use crate::types::{convert, ConvertError, Val, Value, ValueType};

/// Built-in tokenizers.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum Tokenizer {
    /// Whole string.
    Exact,
    /// 64-bit hash of the whole string.
    Hash,
    /// Lower-cased words.
    Term,
    /// Integer value.
    Int,
    /// Floor of a float value.
    Float,
    /// Boolean value.
    Bool,
    /// Calendar year of a timestamp.
    Year,
}

impl Tokenizer {
    /// Every built-in tokenizer.
    pub const ALL: [Tokenizer; 7] = [
        Tokenizer::Exact,
        Tokenizer::Hash,
        Tokenizer::Term,
        Tokenizer::Int,
        Tokenizer::Float,
        Tokenizer::Bool,
        Tokenizer::Year,
    ];

    /// Looks up a tokenizer by its schema name.
    pub fn by_name(name: &str) -> Option<Tokenizer> {
        Self::ALL.into_iter().find(|t| t.name() == name)
    }

    /// Schema name.
    pub fn name(self) -> &'static str {
        match self {
            Tokenizer::Exact => "exact",
            Tokenizer::Hash => "hash",
            Tokenizer::Term => "term",
            Tokenizer::Int => "int",
            Tokenizer::Float => "float",
            Tokenizer::Bool => "bool",
            Tokenizer::Year => "year",
        }
    }

    pub(crate) fn identifier(self) -> u8 {
        match self {
            Tokenizer::Exact => 0x02,
            Tokenizer::Hash => 0x03,
            Tokenizer::Term => 0x01,
            Tokenizer::Int => 0x06,
            Tokenizer::Float => 0x07,
            Tokenizer::Bool => 0x09,
            Tokenizer::Year => 0x04,
        }
    }

    /// Type values are converted to before tokenizing.
    pub fn value_type(self) -> ValueType {
        match self {
            Tokenizer::Exact | Tokenizer::Hash | Tokenizer::Term => ValueType::String,
            Tokenizer::Int => ValueType::Int,
            Tokenizer::Float => ValueType::Float,
            Tokenizer::Bool => ValueType::Bool,
            Tokenizer::Year => ValueType::DateTime,
        }
    }

    /// Returns `true` if the tokenizer can index predicates of type `ty`.
    pub fn accepts(self, ty: ValueType) -> bool {
        match self.value_type() {
            ValueType::String => matches!(ty, ValueType::String | ValueType::Default),
            other => other == ty,
        }
    }

    /// Produces the prefixed index terms of `val`.
    pub fn tokens(self, val: &Val) -> Result<Vec<Vec<u8>>, ConvertError> {
        let val = convert(val, self.value_type())?;
        let id = self.identifier();
        let with_id = |body: &[u8]| {
            let mut term = Vec::with_capacity(1 + body.len());
            term.push(id);
            term.extend_from_slice(body);
            term
        };
        let terms = match (self, &val.value) {
            (Tokenizer::Exact, Value::Str(s)) => vec![with_id(s.as_bytes())],
            (Tokenizer::Hash, Value::Str(s)) => {
                vec![with_id(&xxh64(s.as_bytes(), 0).to_be_bytes())]
            }
            (Tokenizer::Term, Value::Str(s)) => {
                let mut words: Vec<String> = s
                    .split(|c: char| !c.is_alphanumeric())
                    .filter(|w| !w.is_empty())
                    .map(str::to_lowercase)
                    .collect();
                words.sort();
                words.dedup();
                words.iter().map(|w| with_id(w.as_bytes())).collect()
            }
            (Tokenizer::Int, Value::Int(i)) => vec![with_id(&sortable(*i))],
            (Tokenizer::Float, Value::Float(f)) => vec![with_id(&sortable(f.floor() as i64))],
            (Tokenizer::Bool, Value::Bool(b)) => vec![with_id(&[u8::from(*b)])],
            (Tokenizer::Year, Value::DateTime(dt)) => {
                vec![with_id(&sortable(i64::from(dt.year())))]
            }
            _ => {
                return Err(ConvertError::Unsupported {
                    from: val.tid,
                    to: self.value_type(),
                })
            }
        };
        Ok(terms)
    }
}

/// Big-endian encoding that sorts signed integers in numeric order.
fn sortable(v: i64) -> [u8; 8] {
    ((v as u64) ^ (1 << 63)).to_be_bytes()
}
