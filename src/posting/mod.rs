//! Posting lists: the per-key value sets the write path mutates.
//!
//! A data key holds the values of one predicate on one entity. Index, reverse, and
//! count keys are derived from data keys and kept in step by
//! [`add_mutation_with_index`] on live writes and by [`IndexRebuild`] after schema
//! changes.

mod index;
mod list;
pub mod tokenizer;
mod txn;

pub use index::{add_mutation_with_index, IndexRebuild};
pub use list::{rollup, scalar_posting_uid, Posting, PostingList, ReadMode, SCALAR_POSTING_UID};
pub use tokenizer::Tokenizer;
pub use txn::{ListHandle, Txn};

use crate::storage::{KeyPrefix, KvStore};
use crate::types::{Result, Ts};

/// Returns `true` if any data key of `attr` has a non-empty newest version at `read_ts`.
///
/// This is approximate: a key whose newest version is a delta is counted even if
/// the deltas sum to an empty list. Only rolled-up empty lists are skipped.
pub fn has_edges(store: &dyn KvStore, attr: &str, read_ts: Ts) -> Result<bool> {
    let mut found = false;
    store.scan(&KeyPrefix::Data(attr.to_owned()), read_ts, &mut |_, version| {
        if !version.is_empty_posting() {
            found = true;
            return Ok(false);
        }
        Ok(true)
    })?;
    Ok(found)
}
