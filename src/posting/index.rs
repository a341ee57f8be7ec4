//! Index maintenance on live writes and index rebuilds after schema changes.

use std::collections::{BTreeMap, BTreeSet};

use tracing::debug;
use xxhash_rust::xxh64::xxh64;

use super::list::{scalar_posting_uid, write_complete, Posting, PostingList, ReadMode, SCALAR_POSTING_UID};
use super::tokenizer::Tokenizer;
use super::txn::{ListHandle, Txn};
use crate::model::{Edge, EdgeOp, EdgeValue};
use crate::schema::SchemaUpdate;
use crate::storage::{Key, KeyPrefix, KvStore};
use crate::types::{decode, MutationError, Result, Ts, Uid};

/// Net effect of an edge on one posting of the data list.
struct Change {
    old: Option<Posting>,
    new: Option<Posting>,
}

/// Applies `edge` to the data list `list` and maintains the predicate's index,
/// reverse, and count keys according to `su`.
///
/// Re-applying an edge whose effect is already visible changes nothing.
pub fn add_mutation_with_index(
    txn: &Txn,
    list: &ListHandle,
    edge: &Edge,
    su: &SchemaUpdate,
) -> Result<()> {
    if edge.attr.is_empty() {
        return Err(MutationError::Invariant("edge without predicate"));
    }
    txn.touch_predicate(&edge.attr);

    let (changes, before, after) = {
        let mut list = list.lock();
        let before = list.len();
        let changes = if edge.op == EdgeOp::Del && edge.is_star() {
            delete_all(&mut list, edge)
        } else {
            apply_edge(&mut list, edge, su)
        };
        for change in &changes {
            let uid = change
                .new
                .as_ref()
                .or(change.old.as_ref())
                .map_or(SCALAR_POSTING_UID, |p| p.uid);
            txn.add_conflict_key(conflict_fingerprint(list.key(), uid, su));
        }
        (changes, before, list.len())
    };

    for change in &changes {
        if su.is_indexed() {
            update_index(txn, edge, su, change)?;
        }
        if su.is_reversed() {
            update_reverse(txn, edge, su, change)?;
        }
    }
    if su.count && before != after {
        update_count(txn, &edge.attr, edge.entity, before, after, false)?;
    }
    Ok(())
}

fn conflict_fingerprint(key: &Key, uid: u64, su: &SchemaUpdate) -> u64 {
    if su.list {
        let mut buf = key.encode();
        buf.extend_from_slice(&uid.to_be_bytes());
        xxh64(&buf, 0)
    } else {
        key.fingerprint()
    }
}

fn edge_posting(edge: &Edge, su: &SchemaUpdate) -> Posting {
    match &edge.value {
        EdgeValue::Uid(object) => Posting::uid(object.0, edge.op),
        EdgeValue::Bytes(bytes) => Posting {
            uid: scalar_posting_uid(bytes, edge.lang.as_deref(), su.list),
            value_type: edge.value_type,
            value: bytes.clone(),
            lang: edge.lang.clone(),
            op: edge.op,
        },
    }
}

fn apply_edge(list: &mut PostingList, edge: &Edge, su: &SchemaUpdate) -> Vec<Change> {
    let posting = edge_posting(edge, su);
    let mut changes = Vec::new();
    match edge.op {
        EdgeOp::Set => {
            if posting.is_uid() && !su.list {
                for stale in list.postings().into_iter().filter(|p| p.uid != posting.uid) {
                    list.add(stale.clone().with_op(EdgeOp::Del));
                    changes.push(Change {
                        old: Some(stale),
                        new: None,
                    });
                }
            }
            let old = list.find(posting.uid);
            if old.as_ref() == Some(&posting) {
                return changes;
            }
            list.add(posting.clone());
            changes.push(Change {
                old,
                new: Some(posting),
            });
        }
        EdgeOp::Del => {
            let Some(existing) = list.find(posting.uid) else {
                return changes;
            };
            if !posting.is_uid() && existing.value != posting.value {
                return changes;
            }
            list.add(posting);
            changes.push(Change {
                old: Some(existing),
                new: None,
            });
        }
    }
    changes
}

fn delete_all(list: &mut PostingList, edge: &Edge) -> Vec<Change> {
    list.postings()
        .into_iter()
        .filter(|p| edge.lang.is_none() || p.lang == edge.lang)
        .map(|p| {
            list.add(p.clone().with_op(EdgeOp::Del));
            Change {
                old: Some(p),
                new: None,
            }
        })
        .collect()
}

fn index_terms(attr: &str, su: &SchemaUpdate, posting: &Posting) -> Result<Vec<Vec<u8>>> {
    if posting.is_uid() {
        return Ok(Vec::new());
    }
    let val = decode(posting.value_type, &posting.value).map_err(|source| {
        MutationError::Conversion {
            predicate: attr.to_owned(),
            from: posting.value_type,
            to: posting.value_type,
            source,
        }
    })?;
    let mut terms = Vec::new();
    for tokenizer in su.tokenizers.iter().filter_map(|name| Tokenizer::by_name(name)) {
        let tokens = tokenizer.tokens(&val).map_err(|source| MutationError::Conversion {
            predicate: attr.to_owned(),
            from: posting.value_type,
            to: tokenizer.value_type(),
            source,
        })?;
        terms.extend(tokens);
    }
    Ok(terms)
}

fn update_index(txn: &Txn, edge: &Edge, su: &SchemaUpdate, change: &Change) -> Result<()> {
    let entity = edge.entity.0;
    if let Some(old) = &change.old {
        for term in index_terms(&edge.attr, su, old)? {
            let key = Key::index(edge.attr.clone(), term);
            txn.get_from_delta(&key)?
                .lock()
                .add(Posting::uid(entity, EdgeOp::Del));
        }
    }
    if let Some(new) = &change.new {
        for term in index_terms(&edge.attr, su, new)? {
            let key = Key::index(edge.attr.clone(), term);
            if su.upsert {
                txn.add_conflict_key(key.fingerprint());
            }
            txn.get_from_delta(&key)?
                .lock()
                .add(Posting::uid(entity, EdgeOp::Set));
        }
    }
    Ok(())
}

fn update_reverse(txn: &Txn, edge: &Edge, su: &SchemaUpdate, change: &Change) -> Result<()> {
    let entity = edge.entity.0;
    let targets = [
        change.old.as_ref().map(|p| (p.uid, EdgeOp::Del)),
        change.new.as_ref().map(|p| (p.uid, EdgeOp::Set)),
    ];
    for (object, op) in targets.into_iter().flatten() {
        let key = Key::reverse(edge.attr.clone(), Uid(object));
        if su.count {
            let handle = txn.get(&key)?;
            let (before, after) = {
                let mut list = handle.lock();
                let before = list.len();
                list.add(Posting::uid(entity, op));
                (before, list.len())
            };
            if before != after {
                update_count(txn, &edge.attr, Uid(object), before, after, true)?;
            }
        } else {
            txn.get_from_delta(&key)?.lock().add(Posting::uid(entity, op));
        }
    }
    Ok(())
}

fn update_count(
    txn: &Txn,
    attr: &str,
    entity: Uid,
    before: usize,
    after: usize,
    reverse: bool,
) -> Result<()> {
    if before > 0 {
        let key = Key::count(attr, before as u32, reverse);
        txn.get_from_delta(&key)?
            .lock()
            .add(Posting::uid(entity.0, EdgeOp::Del));
    }
    if after > 0 {
        let key = Key::count(attr, after as u32, reverse);
        txn.get_from_delta(&key)?
            .lock()
            .add(Posting::uid(entity.0, EdgeOp::Set));
    }
    Ok(())
}

/// Plan for bringing a predicate's derived keys in line with a new schema.
#[derive(Clone, Debug)]
pub struct IndexRebuild {
    /// Predicate being changed.
    pub attr: String,
    /// Timestamp data is read at and rebuilt entries are written at.
    pub start_ts: Ts,
    /// Durable schema before the change, if any.
    pub old_schema: Option<SchemaUpdate>,
    /// Schema being installed.
    pub current_schema: SchemaUpdate,
}

impl IndexRebuild {
    /// Creates a plan.
    pub fn new(start_ts: Ts, old_schema: Option<SchemaUpdate>, current_schema: SchemaUpdate) -> Self {
        Self {
            attr: current_schema.predicate.clone(),
            start_ts,
            old_schema,
            current_schema,
        }
    }

    fn type_changed(&self) -> bool {
        self.old_schema
            .as_ref()
            .is_some_and(|old| old.value_type != self.current_schema.value_type)
    }

    fn list_changed(&self) -> bool {
        self.old_schema
            .as_ref()
            .is_some_and(|old| old.list != self.current_schema.list)
    }

    fn index_tokenizers(su: &SchemaUpdate) -> Vec<String> {
        if su.directive == crate::schema::Directive::Index {
            su.tokenizers.clone()
        } else {
            Vec::new()
        }
    }

    fn tokenizers_to_delete(&self) -> Vec<String> {
        let Some(old) = &self.old_schema else {
            return Vec::new();
        };
        let current = Self::index_tokenizers(&self.current_schema);
        Self::index_tokenizers(old)
            .into_iter()
            .filter(|t| self.type_changed() || !current.contains(t))
            .collect()
    }

    fn tokenizers_to_build(&self) -> Vec<String> {
        let Some(old) = &self.old_schema else {
            return Vec::new();
        };
        let previous = Self::index_tokenizers(old);
        Self::index_tokenizers(&self.current_schema)
            .into_iter()
            .filter(|t| self.type_changed() || !previous.contains(t))
            .collect()
    }

    fn count_plan(&self) -> (bool, bool) {
        let Some(old) = &self.old_schema else {
            return (false, false);
        };
        let reshaped = self.type_changed() || self.list_changed();
        let cur = self.current_schema.count;
        (old.count && (!cur || reshaped), cur && (!old.count || reshaped))
    }

    fn reverse_plan(&self) -> (bool, bool) {
        let Some(old) = &self.old_schema else {
            return (false, false);
        };
        let cur = self.current_schema.is_reversed();
        let was = old.is_reversed();
        (
            was && (!cur || self.type_changed()),
            cur && (!was || self.type_changed()),
        )
    }

    /// Returns `true` if derived keys must be dropped or rebuilt.
    pub fn need_index_rebuild(&self) -> bool {
        if self.old_schema.is_none() {
            return false;
        }
        let (drop_count, build_count) = self.count_plan();
        let (drop_reverse, build_reverse) = self.reverse_plan();
        !self.tokenizers_to_delete().is_empty()
            || !self.tokenizers_to_build().is_empty()
            || drop_count
            || build_count
            || drop_reverse
            || build_reverse
            || self.list_changed()
    }

    /// Schema readers may use while the rebuild runs: only the indexes valid under
    /// both the old and the new schema.
    pub fn query_schema(&self) -> SchemaUpdate {
        let mut query = self.current_schema.clone();
        let Some(old) = &self.old_schema else {
            return query;
        };
        let deleted = self.tokenizers_to_delete();
        query.tokenizers = Self::index_tokenizers(old)
            .into_iter()
            .filter(|t| !deleted.contains(t))
            .collect();
        if self.count_plan().1 {
            query.count = false;
        }
        if self.reverse_plan().1 {
            query.directive = crate::schema::Directive::None;
        }
        query
    }

    /// Removes index, reverse, and count keys the new schema no longer supports.
    pub fn drop_indexes(&self, store: &dyn KvStore) -> Result<()> {
        for name in self.tokenizers_to_delete() {
            if let Some(tokenizer) = Tokenizer::by_name(&name) {
                store.drop_prefix(&KeyPrefix::Tokenizer(self.attr.clone(), tokenizer.identifier()))?;
            }
        }
        if self.count_plan().0 {
            store.drop_prefix(&KeyPrefix::Count(self.attr.clone()))?;
        }
        if self.reverse_plan().0 {
            store.drop_prefix(&KeyPrefix::Reverse(self.attr.clone()))?;
        }
        debug!(predicate = %self.attr, "posting.index.dropped");
        Ok(())
    }

    /// Rebuilds data-dependent structures. A scalar predicate that became a list
    /// has its single value re-keyed by content.
    pub fn build_data(&self, store: &dyn KvStore) -> Result<()> {
        let Some(old) = &self.old_schema else {
            return Ok(());
        };
        if old.list || !self.current_schema.list || !self.current_schema.value_type.is_scalar() {
            return Ok(());
        }
        for key in self.data_keys(store)? {
            let list = PostingList::read(store, key.clone(), self.start_ts, ReadMode::Full)?;
            let postings: Vec<Posting> = list
                .postings()
                .into_iter()
                .map(|mut p| {
                    if p.uid == SCALAR_POSTING_UID {
                        p.uid = scalar_posting_uid(&p.value, None, true);
                    }
                    p
                })
                .collect();
            write_complete(store, key, postings, self.start_ts)?;
        }
        Ok(())
    }

    /// Scans the predicate's data at the start timestamp and writes every index,
    /// reverse, and count entry the new schema adds. Returns the number of keys written.
    pub fn build_indexes(&self, store: &dyn KvStore) -> Result<usize> {
        let tokenizers = self.tokenizers_to_build();
        let (_, build_count) = self.count_plan();
        let (_, build_reverse) = self.reverse_plan();
        if tokenizers.is_empty() && !build_count && !build_reverse {
            return Ok(0);
        }
        let token_schema = SchemaUpdate {
            tokenizers,
            ..self.current_schema.clone()
        };

        let mut out: BTreeMap<Key, BTreeSet<u64>> = BTreeMap::new();
        let mut reverse: BTreeMap<u64, BTreeSet<u64>> = BTreeMap::new();
        for key in self.data_keys(store)? {
            let Key::Data { uid: entity, .. } = &key else {
                continue;
            };
            let entity = entity.0;
            let list = PostingList::read(store, key.clone(), self.start_ts, ReadMode::Full)?;
            let postings = list.postings();
            for posting in &postings {
                for term in index_terms(&self.attr, &token_schema, posting)? {
                    out.entry(Key::index(self.attr.clone(), term))
                        .or_default()
                        .insert(entity);
                }
                if build_reverse && posting.is_uid() {
                    reverse.entry(posting.uid).or_default().insert(entity);
                }
            }
            if build_count && !postings.is_empty() {
                out.entry(Key::count(self.attr.clone(), postings.len() as u32, false))
                    .or_default()
                    .insert(entity);
            }
        }

        if build_count && self.current_schema.is_reversed() {
            if !build_reverse {
                self.existing_reverse(store, &mut reverse)?;
            }
            for (object, subjects) in &reverse {
                out.entry(Key::count(self.attr.clone(), subjects.len() as u32, true))
                    .or_default()
                    .insert(*object);
            }
        }
        if build_reverse {
            for (object, subjects) in reverse {
                out.insert(Key::reverse(self.attr.clone(), Uid(object)), subjects);
            }
        }

        let written = out.len();
        for (key, uids) in out {
            let postings = uids.into_iter().map(|uid| Posting::uid(uid, EdgeOp::Set)).collect();
            write_complete(store, key, postings, self.start_ts)?;
        }
        debug!(predicate = %self.attr, keys = written, "posting.index.built");
        Ok(written)
    }

    fn data_keys(&self, store: &dyn KvStore) -> Result<Vec<Key>> {
        let mut keys = Vec::new();
        store.scan(&KeyPrefix::Data(self.attr.clone()), self.start_ts, &mut |key, _| {
            keys.push(key.clone());
            Ok(true)
        })?;
        Ok(keys)
    }

    fn existing_reverse(
        &self,
        store: &dyn KvStore,
        reverse: &mut BTreeMap<u64, BTreeSet<u64>>,
    ) -> Result<()> {
        let mut keys = Vec::new();
        store.scan(&KeyPrefix::Reverse(self.attr.clone()), self.start_ts, &mut |key, _| {
            keys.push(key.clone());
            Ok(true)
        })?;
        for key in keys {
            let Key::Reverse { uid: object, .. } = &key else {
                continue;
            };
            let object = object.0;
            let list = PostingList::read(store, key, self.start_ts, ReadMode::Full)?;
            let subjects = reverse.entry(object).or_default();
            subjects.extend(list.postings().iter().map(|p| p.uid));
        }
        Ok(())
    }
}
