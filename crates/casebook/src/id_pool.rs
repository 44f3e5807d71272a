//! Bounded, weak-keyed identity allocator.
//!
//! An [`IdPool`] hands out small dense integer IDs to owner objects without
//! keeping those owners alive. Once every strong reference to an owner is
//! gone, its ID becomes a *zombie*; zombies are swept opportunistically the
//! next time a new owner needs an ID, and a caller-supplied hook is invoked for
//! each freed ID (e.g. to tell a peer the ID is no longer in use).

use crate::{Error, Result};
use std::{
    collections::HashMap,
    sync::{Arc, Weak},
};

/// Default capacity, matching the 12-bit solver field of a result word.
pub const DEFAULT_POOL_CAPACITY: usize = 1 << 12;

struct Mapping<T: ?Sized> {
    owner: Weak<T>,
    id: u32,
}

/// A bounded pool of integer identities keyed weakly by `Arc<T>` identity.
///
/// Lookups compare owners by allocation address, so two distinct `Arc`s with
/// equal contents receive different IDs.
///
/// The pool is not internally synchronized; wrap it in a mutex when sharing.
///
/// # Example
///
/// ```
/// use casebook::IdPool;
/// use std::sync::Arc;
///
/// let mut pool = IdPool::new(2);
/// let a = Arc::new("a");
/// let b = Arc::new("b");
/// assert_eq!(pool.map(&a).unwrap(), 0);
/// assert_eq!(pool.map(&b).unwrap(), 1);
/// assert_eq!(pool.map(&a).unwrap(), 0);
///
/// // The pool is full until an owner goes away.
/// assert!(pool.map(&Arc::new("c")).is_err());
/// drop(a);
/// let mut freed = Vec::new();
/// assert_eq!(pool.map_with(&Arc::new("c"), |id| freed.push(id)).unwrap(), 0);
/// assert_eq!(freed, [0]);
/// ```
pub struct IdPool<T: ?Sized> {
    capacity: usize,
    taken: Vec<u64>,
    mappings: HashMap<usize, Mapping<T>>,
    next: usize,
}

impl<T: ?Sized> IdPool<T> {
    /// Creates a pool handing out IDs in `0..capacity`.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            taken: vec![0; capacity.div_ceil(64)],
            mappings: HashMap::new(),
            next: 0,
        }
    }

    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of IDs currently held, including zombies not yet swept.
    pub fn len(&self) -> usize {
        self.mappings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mappings.is_empty()
    }

    fn key(owner: &Arc<T>) -> usize {
        Arc::as_ptr(owner).cast::<()>() as usize
    }

    fn live(&self, owner: &Arc<T>) -> Option<&Mapping<T>> {
        // A dead mapping may share its address with a fresh allocation.
        self.mappings
            .get(&Self::key(owner))
            .filter(|m| m.owner.strong_count() > 0)
    }

    /// Returns `true` if `owner` currently holds an ID.
    pub fn contains_key(&self, owner: &Arc<T>) -> bool {
        self.live(owner).is_some()
    }

    /// Returns the ID held by `owner`, if any.
    pub fn try_get(&self, owner: &Arc<T>) -> Option<u32> {
        self.live(owner).map(|m| m.id)
    }

    /// Returns the ID held by `owner`.
    ///
    /// # Panics
    ///
    /// Panics if `owner` holds no ID. Use [`Self::contains_key`] or
    /// [`Self::try_get`] when absence is expected.
    pub fn get(&self, owner: &Arc<T>) -> u32 {
        match self.try_get(owner) {
            Some(id) => id,
            None => panic!("no ID mapped for owner"),
        }
    }

    /// Returns the ID of `owner`, allocating one if needed.
    ///
    /// Equivalent to [`Self::map_with`] with a no-op reclaim hook.
    pub fn map(&mut self, owner: &Arc<T>) -> Result<u32> {
        self.map_with(owner, |_| {})
    }

    /// Returns the ID of `owner`, allocating one if needed.
    ///
    /// Before allocating, IDs of owners that have since been dropped are
    /// released and `on_reclaim` is called once per released ID. The new ID
    /// is the lowest free one at or after the rotating allocation pointer,
    /// wrapping around to the start of the range.
    ///
    /// # Errors
    ///
    /// Returns [`Error::PoolExhausted`] if every ID is held by a live owner.
    pub fn map_with(&mut self, owner: &Arc<T>, on_reclaim: impl FnMut(u32)) -> Result<u32> {
        if let Some(id) = self.try_get(owner) {
            return Ok(id);
        }

        self.sweep(on_reclaim);

        let id = self
            .next_clear(self.next)
            .or_else(|| self.next_clear(0))
            .ok_or(Error::PoolExhausted {
                capacity: self.capacity,
            })?;

        self.set(id, true);
        self.next = id + 1;
        self.mappings.insert(
            Self::key(owner),
            Mapping {
                owner: Arc::downgrade(owner),
                id: id as u32,
            },
        );
        Ok(id as u32)
    }

    /// Releases the IDs of all owners that have been dropped, calling
    /// `on_reclaim` for each. Returns the number of IDs released.
    pub fn sweep(&mut self, mut on_reclaim: impl FnMut(u32)) -> usize {
        let mut freed = Vec::new();
        self.mappings.retain(|_, m| {
            let alive = m.owner.strong_count() > 0;
            if !alive {
                freed.push(m.id);
            }
            alive
        });
        for &id in &freed {
            self.set(id as usize, false);
            on_reclaim(id);
        }
        freed.len()
    }

    fn set(&mut self, id: usize, taken: bool) {
        let (word, bit) = (id / 64, id % 64);
        if taken {
            self.taken[word] |= 1 << bit;
        } else {
            self.taken[word] &= !(1 << bit);
        }
    }

    fn next_clear(&self, from: usize) -> Option<usize> {
        let mut id = from;
        while id < self.capacity {
            let (word, bit) = (id / 64, id % 64);
            let free = !self.taken[word] >> bit;
            if free != 0 {
                let found = id + free.trailing_zeros() as usize;
                return (found < self.capacity).then_some(found);
            }
            id += 64 - bit;
        }
        None
    }
}
