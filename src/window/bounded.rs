//! A map that remembers insertion order and never grows past its capacity.
//!
//! Inserting a new key into a full map evicts the oldest key. Updating an
//! existing key keeps its place in line.

use std::{
    collections::{HashMap, VecDeque},
    hash::Hash,
};

#[derive(Clone, Debug)]
pub struct BoundedMap<K, V> {
    capacity: usize,
    order: VecDeque<K>,
    entries: HashMap<K, V>,
}

impl<K, V> BoundedMap<K, V>
where
    K: Copy + Eq + Hash,
{
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "capacity must be positive");
        Self {
            capacity,
            order: VecDeque::with_capacity(capacity),
            entries: HashMap::with_capacity(capacity),
        }
    }

    /// Inserts or updates `key`. Returns the entry evicted to make room, if
    /// any.
    pub fn insert(&mut self, key: K, value: V) -> Option<(K, V)> {
        if let Some(existing) = self.entries.get_mut(&key) {
            *existing = value;
            return None;
        }

        let evicted = if self.entries.len() >= self.capacity {
            self.order.pop_front().and_then(|oldest| {
                self.entries
                    .remove(&oldest)
                    .map(|value| (oldest, value))
            })
        } else {
            None
        };

        self.order.push_back(key);
        self.entries.insert(key, value);
        evicted
    }

    #[must_use]
    pub fn get(&self, key: &K) -> Option<&V> {
        self.entries.get(key)
    }

    pub fn values_mut(&mut self) -> impl Iterator<Item = &mut V> {
        self.entries.values_mut()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn evicts_oldest_first() {
        let mut map = BoundedMap::new(3);
        assert_eq!(map.insert(1, 'a'), None);
        assert_eq!(map.insert(2, 'b'), None);
        assert_eq!(map.insert(3, 'c'), None);
        assert_eq!(map.insert(4, 'd'), Some((1, 'a')));
        assert_eq!(map.insert(5, 'e'), Some((2, 'b')));

        assert_eq!(map.len(), 3);
        assert_eq!(map.get(&1), None);
        assert_eq!(map.get(&5), Some(&'e'));
    }

    #[test]
    fn updates_keep_their_place() {
        let mut map = BoundedMap::new(2);
        map.insert(1, 'a');
        map.insert(2, 'b');
        assert_eq!(map.insert(1, 'z'), None);
        assert_eq!(map.insert(3, 'c'), Some((1, 'z')));
    }

    #[test]
    fn never_exceeds_capacity() {
        let mut map = BoundedMap::new(150);
        for i in 0..1_000 {
            map.insert(i, i * 2);
        }
        assert_eq!(map.len(), 150);
        assert_eq!(map.get(&999), Some(&1_998));
        assert_eq!(map.get(&849), None);
        assert_eq!(map.get(&850), Some(&1_700));

        for value in map.values_mut() {
            *value = 0;
        }
        assert_eq!(map.get(&900), Some(&0));
        assert!(!map.is_empty());
    }
}
