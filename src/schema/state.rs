use std::sync::Arc;

use parking_lot::RwLock;
use rustc_hash::FxHashMap;

use super::{SchemaUpdate, TypeUpdate};
use crate::storage::{meta, Key, KeyPrefix, KvStore, StoreTxn};
use crate::types::{MutationError, Result, Ts, ValidationError, ValueType};

/// Which schema version a lookup should observe.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SchemaCtx {
    /// Readers see the query schema only.
    Read,
    /// Writers see the mutation schema while a rebuild is pending.
    Write,
}

#[derive(Default)]
struct Inner {
    predicates: FxHashMap<String, SchemaUpdate>,
    mutable: FxHashMap<String, SchemaUpdate>,
    types: FxHashMap<String, TypeUpdate>,
}

/// Live in-memory schema, backed by durable records in the store.
///
/// Each predicate has one query schema. While an index rebuild is pending it also
/// has a mutation schema, which writers must observe so that new writes maintain
/// the index being built.
pub struct SchemaState {
    store: Arc<dyn KvStore>,
    inner: RwLock<Inner>,
}

impl SchemaState {
    /// Creates an empty state over `store`.
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self {
            store,
            inner: RwLock::new(Inner::default()),
        }
    }

    /// Returns the schema of `predicate` as seen from `ctx`.
    pub fn get(&self, ctx: SchemaCtx, predicate: &str) -> Option<SchemaUpdate> {
        let inner = self.inner.read();
        if ctx == SchemaCtx::Write {
            if let Some(su) = inner.mutable.get(predicate) {
                return Some(su.clone());
            }
        }
        inner.predicates.get(predicate).cloned()
    }

    /// Publishes the query schema of a predicate.
    pub fn set(&self, su: SchemaUpdate) {
        self.inner.write().predicates.insert(su.predicate.clone(), su);
    }

    /// Publishes the mutation schema of a predicate.
    pub fn set_mut_schema(&self, su: SchemaUpdate) {
        self.inner.write().mutable.insert(su.predicate.clone(), su);
    }

    /// Clears the mutation schema of a predicate.
    pub fn delete_mut_schema(&self, predicate: &str) {
        self.inner.write().mutable.remove(predicate);
    }

    /// Forgets both schema versions of a predicate.
    pub fn delete(&self, predicate: &str) {
        let mut inner = self.inner.write();
        inner.predicates.remove(predicate);
        inner.mutable.remove(predicate);
    }

    /// Forgets every predicate and type.
    pub fn delete_all(&self) {
        *self.inner.write() = Inner::default();
    }

    /// Query-schema type of a predicate.
    pub fn type_of(&self, predicate: &str) -> Result<ValueType> {
        self.inner
            .read()
            .predicates
            .get(predicate)
            .map(|su| su.value_type)
            .ok_or_else(|| {
                ValidationError::MissingSchema {
                    predicate: predicate.to_owned(),
                }
                .into()
            })
    }

    /// Returns `true` if the query schema declares a list.
    pub fn is_list(&self, predicate: &str) -> bool {
        self.inner
            .read()
            .predicates
            .get(predicate)
            .is_some_and(|su| su.list)
    }

    /// Returns `true` while any predicate has a pending mutation schema.
    pub fn indexing_in_progress(&self) -> bool {
        !self.inner.read().mutable.is_empty()
    }

    /// Names of every predicate with a query schema.
    pub fn predicates(&self) -> Vec<String> {
        let mut out: Vec<String> = self.inner.read().predicates.keys().cloned().collect();
        out.sort();
        out
    }

    /// Publishes a type definition.
    pub fn set_type(&self, tu: TypeUpdate) {
        self.inner.write().types.insert(tu.type_name.clone(), tu);
    }

    /// Returns a type definition.
    pub fn get_type(&self, name: &str) -> Option<TypeUpdate> {
        self.inner.read().types.get(name).cloned()
    }

    /// Forgets a type definition.
    pub fn delete_type(&self, name: &str) {
        self.inner.write().types.remove(name);
    }

    /// Writes the durable schema record of `su` at `ts`.
    pub fn persist(&self, su: &SchemaUpdate, ts: Ts) -> Result<()> {
        let data = serde_json::to_vec(su).map_err(MutationError::storage)?;
        let mut txn = StoreTxn::new(self.store.as_ref(), ts);
        txn.set(Key::Schema(su.predicate.clone()), meta::SCHEMA_POSTING, data);
        txn.commit_at(ts)
    }

    /// Writes the durable record of type `tu` at `ts`.
    pub fn persist_type(&self, tu: &TypeUpdate, ts: Ts) -> Result<()> {
        let data = serde_json::to_vec(tu).map_err(MutationError::storage)?;
        let mut txn = StoreTxn::new(self.store.as_ref(), ts);
        txn.set(Key::Type(tu.type_name.clone()), meta::SCHEMA_POSTING, data);
        txn.commit_at(ts)
    }

    /// Removes type `name` from memory and writes an empty record for it at `ts`.
    pub fn remove_type(&self, name: &str, ts: Ts) -> Result<()> {
        self.delete_type(name);
        let mut txn = StoreTxn::new(self.store.as_ref(), ts);
        txn.set(
            Key::Type(name.to_owned()),
            meta::SCHEMA_POSTING | meta::EMPTY_POSTING,
            Vec::new(),
        );
        txn.commit_at(ts)
    }

    /// Re-reads the durable schema of `predicate`, replacing the in-memory
    /// versions. A missing record removes the predicate from memory.
    pub fn load(&self, predicate: &str) -> Result<()> {
        let record = self
            .store
            .latest(&Key::Schema(predicate.to_owned()), Ts::MAX)?;
        let mut inner = self.inner.write();
        inner.mutable.remove(predicate);
        match record {
            Some(version) if !version.is_empty_posting() => {
                let su: SchemaUpdate =
                    serde_json::from_slice(&version.value).map_err(MutationError::storage)?;
                inner.predicates.insert(predicate.to_owned(), su);
            }
            _ => {
                inner.predicates.remove(predicate);
            }
        }
        Ok(())
    }

    /// Replaces the in-memory state with every durable schema and type record.
    pub fn load_all(&self) -> Result<()> {
        let mut fresh = Inner::default();
        self.store
            .scan(&KeyPrefix::Schema, Ts::MAX, &mut |key, version| {
                if version.is_empty_posting() {
                    return Ok(true);
                }
                if let Key::Schema(predicate) = key {
                    let su: SchemaUpdate = serde_json::from_slice(&version.value)
                        .map_err(MutationError::storage)?;
                    fresh.predicates.insert(predicate.clone(), su);
                }
                Ok(true)
            })?;
        self.store.scan(&KeyPrefix::Type, Ts::MAX, &mut |key, version| {
            if version.is_empty_posting() {
                return Ok(true);
            }
            if let Key::Type(name) = key {
                let tu: TypeUpdate =
                    serde_json::from_slice(&version.value).map_err(MutationError::storage)?;
                fresh.types.insert(name.clone(), tu);
            }
            Ok(true)
        })?;
        *self.inner.write() = fresh;
        Ok(())
    }
}
