use crate::key::KeyId;
use smallvec::SmallVec;

/// Sorted set of interned `(key, value)` pairs. One value per key.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct TagSet {
    // Most series carry a handful of tags (scenario, group, name, method, status).
    pub(crate) tags: SmallVec<[(KeyId, KeyId); 6]>,
}

impl TagSet {
    /// Builds a tag set from pairs in any order. Later pairs win on duplicate keys.
    pub fn from_pairs(iter: impl IntoIterator<Item = (KeyId, KeyId)>) -> Self {
        let mut tags: SmallVec<[(KeyId, KeyId); 6]> = SmallVec::new();
        for (k, v) in iter {
            match tags.binary_search_by(|(existing, _)| existing.cmp(&k)) {
                Ok(idx) => tags[idx].1 = v,
                Err(idx) => tags.insert(idx, (k, v)),
            }
        }
        Self { tags }
    }

    pub fn is_empty(&self) -> bool {
        self.tags.is_empty()
    }

    pub fn len(&self) -> usize {
        self.tags.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (KeyId, KeyId)> + '_ {
        self.tags.iter().copied()
    }

    pub fn get(&self, key: KeyId) -> Option<KeyId> {
        self.tags
            .binary_search_by(|(k, _)| k.cmp(&key))
            .ok()
            .map(|idx| self.tags[idx].1)
    }

    pub fn contains(&self, key: KeyId, value: KeyId) -> bool {
        self.get(key) == Some(value)
    }

    /// Returns a copy with `key` set to `value`.
    #[must_use]
    pub fn with(&self, key: KeyId, value: KeyId) -> Self {
        Self::from_pairs(self.iter().chain(std::iter::once((key, value))))
    }
}
