use std::hash::Hash;

use lru::LruCache;
use parking_lot::Mutex;

/// Tracks the set of eviction-eligible frames in recency order. `insert`
/// makes an element most-recently-used, `victim` pops the least-recently-used
/// end. All operations are O(1) on the underlying ordered map.
pub struct LruReplacer<T: Hash + Eq> {
    inner: Mutex<LruCache<T, ()>>,
}

impl<T: Hash + Eq + Copy> LruReplacer<T> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(LruCache::unbounded()),
        }
    }

    /// Inserts `value`, or touches it to most-recently-used if present.
    pub fn insert(&self, value: T) {
        self.inner.lock().put(value, ());
    }

    /// Removes and returns the least-recently-used element, if any.
    pub fn victim(&self) -> Option<T> {
        self.inner.lock().pop_lru().map(|(value, ())| value)
    }

    /// Removes `value`; true iff it was present.
    pub fn erase(&self, value: T) -> bool {
        self.inner.lock().pop(&value).is_some()
    }

    pub fn size(&self) -> usize {
        self.inner.lock().len()
    }
}

impl<T: Hash + Eq + Copy> Default for LruReplacer<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn evicts_in_lru_order() {
        let replacer = LruReplacer::new();
        for v in [1, 2, 3, 4, 5, 6] {
            replacer.insert(v);
        }
        assert_eq!(replacer.size(), 6);

        assert_eq!(replacer.victim(), Some(1));
        assert_eq!(replacer.victim(), Some(2));
        assert_eq!(replacer.victim(), Some(3));
        assert_eq!(replacer.size(), 3);
    }

    #[test]
    fn insert_touches_existing_to_mru() {
        let replacer = LruReplacer::new();
        replacer.insert(1);
        replacer.insert(2);
        replacer.insert(1);

        assert_eq!(replacer.victim(), Some(2));
        assert_eq!(replacer.victim(), Some(1));
        assert_eq!(replacer.victim(), None);
    }

    #[test]
    fn erase_removes_only_present_elements() {
        let replacer = LruReplacer::new();
        replacer.insert(1);
        replacer.insert(2);

        assert!(replacer.erase(1));
        assert!(!replacer.erase(1));
        assert_eq!(replacer.size(), 1);
        assert_eq!(replacer.victim(), Some(2));
    }
}
