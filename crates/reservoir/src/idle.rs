//! Ordered store of idle objects
//!
//! Insertion-ordered container with O(log n) arbitrary removal and a
//! persistent oldest-first cursor for the evictor. The borrow end is the
//! front: LIFO pools return objects to the front and take from the front,
//! FIFO pools return to the back and take from the front.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use crate::object::PooledObject;

pub(crate) struct IdleStore<T> {
    entries: BTreeMap<i64, Arc<PooledObject<T>>>,
    /// wrapper id -> current slot key, for idempotent removal.
    index: HashMap<u64, i64>,
    front: i64,
    back: i64,
}

impl<T> IdleStore<T> {
    pub(crate) fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
            index: HashMap::new(),
            front: -1,
            back: 0,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    /// Insert at the borrow end.
    pub(crate) fn add_first(&mut self, object: Arc<PooledObject<T>>) {
        let key = self.front;
        self.front -= 1;
        self.index.insert(object.id(), key);
        self.entries.insert(key, object);
    }

    /// Insert at the far end.
    pub(crate) fn add_last(&mut self, object: Arc<PooledObject<T>>) {
        let key = self.back;
        self.back += 1;
        self.index.insert(object.id(), key);
        self.entries.insert(key, object);
    }

    /// Take from the borrow end.
    pub(crate) fn take_first(&mut self) -> Option<Arc<PooledObject<T>>> {
        let (key, object) = self.entries.pop_first()?;
        debug_assert_eq!(self.index.get(&object.id()), Some(&key));
        self.index.remove(&object.id());
        Some(object)
    }

    /// Remove a specific object. Idempotent: removing an object that is not
    /// in the store is a no-op.
    pub(crate) fn remove(&mut self, id: u64) -> bool {
        match self.index.remove(&id) {
            Some(key) => self.entries.remove(&key).is_some(),
            None => false,
        }
    }

    /// The oldest idle object without removing it.
    ///
    /// LIFO pools insert returns at the front, so the oldest entry sits at
    /// the back; FIFO pools insert at the back, so the oldest sits at the
    /// front.
    pub(crate) fn oldest(&self, lifo: bool) -> Option<Arc<PooledObject<T>>> {
        let entry = if lifo {
            self.entries.last_key_value()
        } else {
            self.entries.first_key_value()
        };
        entry.map(|(_, object)| Arc::clone(object))
    }

    /// Collect the next `n` eviction candidates, oldest first, continuing
    /// from `cursor`. When the walk reaches the young end of the store the
    /// cursor resets so the next run starts over from the oldest entry.
    pub(crate) fn eviction_batch(
        &self,
        cursor: &mut Option<i64>,
        n: usize,
        lifo: bool,
    ) -> Vec<Arc<PooledObject<T>>> {
        if n == 0 || self.entries.is_empty() {
            return Vec::new();
        }
        let keys: Vec<i64> = if lifo {
            // Oldest first = descending keys, strictly below the cursor.
            match *cursor {
                Some(c) => self.entries.range(..c).rev().take(n).map(|(k, _)| *k).collect(),
                None => self.entries.iter().rev().take(n).map(|(k, _)| *k).collect(),
            }
        } else {
            // Oldest first = ascending keys, strictly above the cursor.
            match *cursor {
                Some(c) => self
                    .entries
                    .range(c.saturating_add(1)..)
                    .take(n)
                    .map(|(k, _)| *k)
                    .collect(),
                None => self.entries.iter().take(n).map(|(k, _)| *k).collect(),
            }
        };
        *cursor = if keys.len() < n { None } else { keys.last().copied() };
        keys.iter()
            .filter_map(|k| self.entries.get(k).map(Arc::clone))
            .collect()
    }

    /// Remove and return every entry, oldest last (insertion order is not
    /// meaningful to callers draining the store).
    pub(crate) fn drain(&mut self) -> Vec<Arc<PooledObject<T>>> {
        self.index.clear();
        let entries = std::mem::take(&mut self.entries);
        entries.into_values().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn obj(id: u64) -> Arc<PooledObject<u32>> {
        Arc::new(PooledObject::new(id, id as u32, 0))
    }

    #[test]
    fn lifo_order() {
        let mut store = IdleStore::new();
        store.add_first(obj(1));
        store.add_first(obj(2));
        store.add_first(obj(3));
        // Front is the borrow end: most recently added comes out first.
        assert_eq!(store.take_first().unwrap().id(), 3);
        assert_eq!(store.take_first().unwrap().id(), 2);
        assert_eq!(store.take_first().unwrap().id(), 1);
        assert!(store.take_first().is_none());
    }

    #[test]
    fn fifo_order() {
        let mut store = IdleStore::new();
        store.add_last(obj(1));
        store.add_last(obj(2));
        store.add_last(obj(3));
        assert_eq!(store.take_first().unwrap().id(), 1);
        assert_eq!(store.take_first().unwrap().id(), 2);
        assert_eq!(store.take_first().unwrap().id(), 3);
    }

    #[test]
    fn remove_is_idempotent() {
        let mut store = IdleStore::new();
        store.add_first(obj(1));
        store.add_first(obj(2));
        assert!(store.remove(1));
        assert!(!store.remove(1));
        assert!(!store.remove(42));
        assert_eq!(store.len(), 1);
        assert_eq!(store.take_first().unwrap().id(), 2);
    }

    #[test]
    fn oldest_respects_discipline() {
        let mut lifo = IdleStore::new();
        lifo.add_first(obj(1));
        lifo.add_first(obj(2));
        assert_eq!(lifo.oldest(true).unwrap().id(), 1);

        let mut fifo = IdleStore::new();
        fifo.add_last(obj(1));
        fifo.add_last(obj(2));
        assert_eq!(fifo.oldest(false).unwrap().id(), 1);
    }

    #[test]
    fn eviction_batch_walks_oldest_first_lifo() {
        let mut store = IdleStore::new();
        for id in 1..=5 {
            store.add_first(obj(id));
        }
        let mut cursor = None;
        let batch = store.eviction_batch(&mut cursor, 2, true);
        let ids: Vec<u64> = batch.iter().map(|o| o.id()).collect();
        assert_eq!(ids, vec![1, 2]);
        assert!(cursor.is_some());

        let batch = store.eviction_batch(&mut cursor, 2, true);
        let ids: Vec<u64> = batch.iter().map(|o| o.id()).collect();
        assert_eq!(ids, vec![3, 4]);

        // Short batch: cursor resets for the next run.
        let batch = store.eviction_batch(&mut cursor, 2, true);
        let ids: Vec<u64> = batch.iter().map(|o| o.id()).collect();
        assert_eq!(ids, vec![5]);
        assert!(cursor.is_none());

        let batch = store.eviction_batch(&mut cursor, 2, true);
        let ids: Vec<u64> = batch.iter().map(|o| o.id()).collect();
        assert_eq!(ids, vec![1, 2]);
    }

    #[test]
    fn eviction_batch_walks_oldest_first_fifo() {
        let mut store = IdleStore::new();
        for id in 1..=4 {
            store.add_last(obj(id));
        }
        let mut cursor = None;
        let batch = store.eviction_batch(&mut cursor, 3, false);
        let ids: Vec<u64> = batch.iter().map(|o| o.id()).collect();
        assert_eq!(ids, vec![1, 2, 3]);

        let batch = store.eviction_batch(&mut cursor, 3, false);
        let ids: Vec<u64> = batch.iter().map(|o| o.id()).collect();
        assert_eq!(ids, vec![4]);
        assert!(cursor.is_none());
    }

    #[test]
    fn cursor_survives_removals() {
        let mut store = IdleStore::new();
        for id in 1..=4 {
            store.add_first(obj(id));
        }
        let mut cursor = None;
        let _ = store.eviction_batch(&mut cursor, 1, true); // visited id 1
        assert!(store.remove(2));
        let batch = store.eviction_batch(&mut cursor, 1, true);
        assert_eq!(batch[0].id(), 3);
    }

    #[test]
    fn drain_empties_the_store() {
        let mut store = IdleStore::new();
        store.add_first(obj(1));
        store.add_last(obj(2));
        let drained = store.drain();
        assert_eq!(drained.len(), 2);
        assert_eq!(store.len(), 0);
        assert!(!store.remove(1));
    }
}
