use std::collections::hash_map::DefaultHasher;
use std::collections::BTreeMap;
use std::hash::{Hash, Hasher};

/// Stable 64-bit hash of a string key, shared by every ring in the process.
pub fn hash_key(key: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    hasher.finish()
}

/// Consistent-hash ring: lookup returns the first entry at or after the key,
/// wrapping to the smallest entry when the key is past the end.
#[derive(Debug, Clone)]
pub struct HashRing<V> {
    entries: BTreeMap<u64, V>,
}

impl<V> Default for HashRing<V> {
    fn default() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }
}

impl<V> HashRing<V> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: u64, value: V) -> Option<V> {
        self.entries.insert(key, value)
    }

    /// Removes the entry at `key` only when `pred` holds for its value.
    pub fn remove_if(&mut self, key: u64, pred: impl FnOnce(&V) -> bool) -> Option<V> {
        match self.entries.get(&key) {
            Some(value) if pred(value) => self.entries.remove(&key),
            _ => None,
        }
    }

    pub fn contains_key(&self, key: u64) -> bool {
        self.entries.contains_key(&key)
    }

    pub fn lookup(&self, key: u64) -> Option<&V> {
        self.entries
            .range(key..)
            .next()
            .or_else(|| self.entries.iter().next())
            .map(|(_, v)| v)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn values(&self) -> impl Iterator<Item = &V> {
        self.entries.values()
    }
}
