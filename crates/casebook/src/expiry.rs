use std::{
    collections::{BTreeMap, HashMap},
    hash::Hash,
};

struct Slot<V> {
    seq: u64,
    deadline: u64,
    value: V,
}

/// An insertion-ordered keyed set whose items carry an absolute deadline.
///
/// Only the *oldest* item is ever considered for expiry. Callers insert with
/// `deadline = now + timeout` for a fixed timeout, which keeps insertion order
/// and deadline order identical.
///
/// Re-inserting an existing key moves it to the tail.
pub struct ExpiryQueue<K, V> {
    seq: u64,
    order: BTreeMap<u64, K>,
    items: HashMap<K, Slot<V>>,
}

impl<K, V> Default for ExpiryQueue<K, V> {
    fn default() -> Self {
        Self {
            seq: 0,
            order: BTreeMap::new(),
            items: HashMap::new(),
        }
    }
}

impl<K: Hash + Eq + Clone, V> ExpiryQueue<K, V> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.items.contains_key(key)
    }

    /// Inserts `value` at the tail, returning the value previously stored
    /// under `key`.
    pub fn insert(&mut self, key: K, value: V, deadline: u64) -> Option<V> {
        let previous = self.remove(&key);
        let seq = self.seq;
        self.seq += 1;
        self.order.insert(seq, key.clone());
        self.items.insert(
            key,
            Slot {
                seq,
                deadline,
                value,
            },
        );
        previous
    }

    pub fn remove(&mut self, key: &K) -> Option<V> {
        let slot = self.items.remove(key)?;
        self.order.remove(&slot.seq);
        Some(slot.value)
    }

    /// Deadline of the oldest item.
    pub fn next_deadline(&self) -> Option<u64> {
        let (_, key) = self.order.first_key_value()?;
        self.items.get(key).map(|slot| slot.deadline)
    }

    /// Removes and returns the oldest item if its deadline is at or before
    /// `now`.
    pub fn pop_expired(&mut self, now: u64) -> Option<(K, V)> {
        if self.next_deadline()? > now {
            return None;
        }
        let (_, key) = self.order.pop_first()?;
        let slot = self.items.remove(&key)?;
        Some((key, slot.value))
    }

    /// Removes and returns the oldest item regardless of its deadline.
    pub fn pop_oldest(&mut self) -> Option<(K, V)> {
        let (_, key) = self.order.pop_first()?;
        let slot = self.items.remove(&key)?;
        Some((key, slot.value))
    }

    pub fn drain(&mut self) -> impl Iterator<Item = (K, V)> + '_ {
        core::iter::from_fn(|| self.pop_oldest())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_the_oldest_item_expires() {
        let mut q = ExpiryQueue::new();
        q.insert("a", 1, 10);
        q.insert("b", 2, 20);

        assert_eq!(q.pop_expired(9), None);
        assert_eq!(q.pop_expired(10), Some(("a", 1)));
        assert_eq!(q.pop_expired(15), None);
        assert_eq!(q.next_deadline(), Some(20));
    }

    #[test]
    fn reinsert_moves_to_tail() {
        let mut q = ExpiryQueue::new();
        q.insert(1, 'x', 10);
        q.insert(2, 'y', 11);
        assert_eq!(q.insert(1, 'z', 12), Some('x'));
        assert_eq!(q.pop_oldest(), Some((2, 'y')));
        assert_eq!(q.pop_oldest(), Some((1, 'z')));
        assert!(q.is_empty());
    }

    #[test]
    fn remove_unlinks_order() {
        let mut q = ExpiryQueue::new();
        q.insert(1, (), 5);
        q.insert(2, (), 6);
        assert_eq!(q.remove(&1), Some(()));
        assert_eq!(q.next_deadline(), Some(6));
        assert_eq!(q.len(), 1);
        assert_eq!(q.drain().count(), 1);
    }
}
