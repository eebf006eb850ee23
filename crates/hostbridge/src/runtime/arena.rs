//! Handle table for interpreter values

use super::RawHandle;
use serde::Serialize;
use std::collections::HashMap;

/// Allocation and release counters of a [`HandleArena`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ArenaStats {
    /// Handles handed out
    pub allocated: u64,
    /// Handles released
    pub released: u64,
    /// Allocations refused because the arena was full
    pub refused: u64,
    /// Releases of unknown handles (double frees)
    pub rejected: u64,
    /// Handles currently live
    pub live: usize,
}

/// Slot table mapping handles to values.
///
/// Handle ids are never reused, so a stale handle cannot alias a newer value.
#[derive(Debug)]
pub struct HandleArena<T> {
    slots: HashMap<u64, T>,
    next: u64,
    capacity: usize,
    stats: ArenaStats,
}

impl<T> HandleArena<T> {
    /// Create an arena holding at most `capacity` live values
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            slots: HashMap::new(),
            next: 1,
            capacity,
            stats: ArenaStats::default(),
        }
    }

    /// Store a value, `None` when the arena is full
    pub fn insert(&mut self, value: T) -> Option<RawHandle> {
        if self.slots.len() >= self.capacity {
            self.stats.refused += 1;
            return None;
        }

        let id = self.next;
        self.next += 1;
        self.slots.insert(id, value);
        self.stats.allocated += 1;

        Some(RawHandle::from_raw(id))
    }

    /// Borrow a live value
    pub fn get(&self, handle: RawHandle) -> Option<&T> {
        self.slots.get(&handle.id())
    }

    /// Mutably borrow a live value
    pub fn get_mut(&mut self, handle: RawHandle) -> Option<&mut T> {
        self.slots.get_mut(&handle.id())
    }

    /// Release a handle, returning its value
    pub fn remove(&mut self, handle: RawHandle) -> Option<T> {
        match self.slots.remove(&handle.id()) {
            Some(value) => {
                self.stats.released += 1;
                Some(value)
            }
            None => {
                self.stats.rejected += 1;
                None
            }
        }
    }

    /// Whether a handle is live
    pub fn contains(&self, handle: RawHandle) -> bool {
        self.slots.contains_key(&handle.id())
    }

    /// Number of live handles
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Whether no handle is live
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Counters snapshot
    pub fn stats(&self) -> ArenaStats {
        ArenaStats {
            live: self.slots.len(),
            ..self.stats
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_and_remove() {
        let mut arena = HandleArena::with_capacity(4);
        let a = arena.insert("a").unwrap();
        let b = arena.insert("b").unwrap();

        assert_ne!(a, b);
        assert!(!a.is_null());
        assert_eq!(arena.get(a), Some(&"a"));
        assert_eq!(arena.remove(a), Some("a"));
        assert!(!arena.contains(a));
        assert_eq!(arena.len(), 1);
    }

    #[test]
    fn test_double_release_is_counted() {
        let mut arena = HandleArena::with_capacity(4);
        let a = arena.insert(1).unwrap();

        assert_eq!(arena.remove(a), Some(1));
        assert_eq!(arena.remove(a), None);

        let stats = arena.stats();
        assert_eq!(stats.allocated, 1);
        assert_eq!(stats.released, 1);
        assert_eq!(stats.rejected, 1);
        assert_eq!(stats.live, 0);
    }

    #[test]
    fn test_capacity_refuses_allocation() {
        let mut arena = HandleArena::with_capacity(1);
        let a = arena.insert(1).unwrap();

        assert!(arena.insert(2).is_none());
        assert_eq!(arena.stats().refused, 1);

        arena.remove(a);
        assert!(arena.insert(3).is_some());
    }

    #[test]
    fn test_handles_are_not_reused() {
        let mut arena = HandleArena::with_capacity(2);
        let a = arena.insert(1).unwrap();
        arena.remove(a);
        let b = arena.insert(2).unwrap();

        assert_ne!(a, b);
        assert_eq!(arena.get(a), None);
    }
}
