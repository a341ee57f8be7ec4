use std::collections::BTreeMap;

use parking_lot::RwLock;

use super::{Key, KeyPrefix, KvStore, Version};
use crate::types::{Result, Ts};

/// In-memory multi-version store.
///
/// Versions of a key are kept in ascending timestamp order; writing an existing
/// `(key, ts)` pair replaces that version.
#[derive(Default)]
pub struct MemStore {
    inner: RwLock<BTreeMap<Key, Vec<Version>>>,
}

impl MemStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of keys with at least one version.
    pub fn key_count(&self) -> usize {
        self.inner.read().len()
    }
}

impl KvStore for MemStore {
    fn versions(&self, key: &Key, read_ts: Ts) -> Result<Vec<Version>> {
        let guard = self.inner.read();
        Ok(guard
            .get(key)
            .map(|versions| {
                versions
                    .iter()
                    .rev()
                    .filter(|v| v.ts <= read_ts)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    fn scan(
        &self,
        prefix: &KeyPrefix,
        read_ts: Ts,
        visit: &mut dyn FnMut(&Key, &Version) -> Result<bool>,
    ) -> Result<()> {
        // Snapshot under the lock so visitors may write back into the store.
        let snapshot: Vec<(Key, Version)> = {
            let guard = self.inner.read();
            guard
                .iter()
                .filter(|(key, _)| prefix.matches(key))
                .filter_map(|(key, versions)| {
                    versions
                        .iter()
                        .rev()
                        .find(|v| v.ts <= read_ts)
                        .map(|v| (key.clone(), v.clone()))
                })
                .collect()
        };
        for (key, version) in &snapshot {
            if !visit(key, version)? {
                break;
            }
        }
        Ok(())
    }

    fn write_batch(&self, writes: Vec<(Key, Version)>) -> Result<()> {
        let mut guard = self.inner.write();
        for (key, version) in writes {
            let versions = guard.entry(key).or_default();
            match versions.binary_search_by_key(&version.ts, |v| v.ts) {
                Ok(pos) => versions[pos] = version,
                Err(pos) => versions.insert(pos, version),
            }
        }
        Ok(())
    }

    fn drop_prefix(&self, prefix: &KeyPrefix) -> Result<()> {
        self.inner.write().retain(|key, _| !prefix.matches(key));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::meta;
    use crate::types::Uid;

    #[test]
    fn versions_are_newest_first_and_bounded() -> Result<()> {
        let store = MemStore::new();
        let key = Key::data("name", Uid(1));
        store.write_batch(vec![
            (key.clone(), Version::new(9, meta::DELTA_POSTING, b"b".to_vec())),
            (key.clone(), Version::new(3, meta::DELTA_POSTING, b"a".to_vec())),
        ])?;
        let all: Vec<Ts> = store.versions(&key, u64::MAX)?.iter().map(|v| v.ts).collect();
        assert_eq!(all, vec![9, 3]);
        assert_eq!(store.versions(&key, 5)?.len(), 1);
        Ok(())
    }

    #[test]
    fn scan_sees_newest_visible_and_can_stop() -> Result<()> {
        let store = MemStore::new();
        for uid in 1..=3 {
            store.write_batch(vec![(
                Key::data("name", Uid(uid)),
                Version::new(uid, meta::DELTA_POSTING, vec![uid as u8]),
            )])?;
        }
        let mut seen = Vec::new();
        store.scan(&KeyPrefix::Data("name".into()), 2, &mut |key, _| {
            seen.push(key.clone());
            Ok(true)
        })?;
        assert_eq!(seen.len(), 2);

        let mut first = 0;
        store.scan(&KeyPrefix::Data("name".into()), u64::MAX, &mut |_, _| {
            first += 1;
            Ok(false)
        })?;
        assert_eq!(first, 1);
        Ok(())
    }

    #[test]
    fn drop_prefix_removes_only_matching_keys() -> Result<()> {
        let store = MemStore::new();
        store.write_batch(vec![
            (Key::data("a", Uid(1)), Version::new(1, 0, vec![])),
            (Key::data("b", Uid(1)), Version::new(1, 0, vec![])),
        ])?;
        store.drop_prefix(&KeyPrefix::Predicate("a".into()))?;
        assert_eq!(store.key_count(), 1);
        Ok(())
    }
}
