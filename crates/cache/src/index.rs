//! Secondary indexes: named key-derivation functions and the reverse maps
//! they maintain.

use mirador_core::{CacheError, Identity, IndexFn};
use rustc_hash::{FxHashMap, FxHashSet};

struct Index<T> {
    func: IndexFn<T>,
    /// derived key -> identities whose current object produces that key
    postings: FxHashMap<String, FxHashSet<Identity>>,
}

/// All registered indexes for one cache, maintained incrementally as the
/// object store mutates.
pub struct IndexTable<T> {
    indexes: FxHashMap<String, Index<T>>,
}

impl<T> IndexTable<T> {
    pub fn new() -> Self {
        Self { indexes: FxHashMap::default() }
    }

    /// Number of registered index definitions.
    pub fn len(&self) -> usize {
        self.indexes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indexes.is_empty()
    }

    /// Register a named key-derivation function. Names are unique.
    pub fn register(&mut self, name: &str, func: IndexFn<T>) -> Result<(), CacheError> {
        if self.indexes.contains_key(name) {
            return Err(CacheError::DuplicateIndex(name.to_string()));
        }
        let index = Index { func, postings: FxHashMap::default() };
        self.indexes.insert(name.to_string(), index);
        Ok(())
    }

    /// Move `id` between posting sets according to the key difference between
    /// the old and new object. Keys present in both are untouched, so the
    /// cost is proportional to the two key sets, not the table.
    ///
    /// `old = None` covers inserts, `new = None` covers deletes. A posting
    /// set that becomes empty is dropped from the table.
    pub fn reindex(&mut self, id: &Identity, old: Option<&T>, new: Option<&T>) {
        for index in self.indexes.values_mut() {
            let old_keys = derive_keys(&index.func, old);
            let new_keys = derive_keys(&index.func, new);
            for key in old_keys.difference(&new_keys) {
                let emptied = match index.postings.get_mut(key) {
                    Some(set) => {
                        set.remove(id);
                        set.is_empty()
                    }
                    None => false,
                };
                if emptied {
                    index.postings.remove(key);
                }
            }
            for key in new_keys.difference(&old_keys) {
                index.postings.entry(key.clone()).or_default().insert(id.clone());
            }
        }
    }

    /// Identities currently stored under `key`. An unknown key yields an
    /// empty vec; an unknown index NAME is a caller error.
    pub fn lookup(&self, name: &str, key: &str) -> Result<Vec<Identity>, CacheError> {
        let index = self
            .indexes
            .get(name)
            .ok_or_else(|| CacheError::UnknownIndex(name.to_string()))?;
        Ok(index
            .postings
            .get(key)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default())
    }

    /// All keys of index `name` with at least one member.
    pub fn keys(&self, name: &str) -> Result<Vec<String>, CacheError> {
        let index = self
            .indexes
            .get(name)
            .ok_or_else(|| CacheError::UnknownIndex(name.to_string()))?;
        Ok(index.postings.keys().cloned().collect())
    }
}

impl<T> Default for IndexTable<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Duplicate keys within one return collapse here; an absent object derives
/// the empty set.
fn derive_keys<T>(func: &IndexFn<T>, obj: Option<&T>) -> FxHashSet<String> {
    match obj {
        Some(o) => func(o).into_iter().collect(),
        None => FxHashSet::default(),
    }
}
