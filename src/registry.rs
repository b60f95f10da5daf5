//! Session registry
//!
//! An insertion-ordered, capacity-bounded list of weak references.
//! The registry never keeps a member alive: once the last strong reference
//! is gone, the entry is pruned the next time the registry is walked.

use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::error::RelayError;

/// Registry shared between the accept loop and every session
pub type SharedRegistry<T> = Arc<Mutex<Registry<T>>>;

#[derive(Debug)]
pub struct Registry<T> {
    entries: Vec<Weak<T>>,
    capacity: usize,
}

impl<T> Registry<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Vec::with_capacity(capacity),
            capacity,
        }
    }

    /// New registry behind the shared lock
    pub fn shared(capacity: usize) -> SharedRegistry<T> {
        Arc::new(Mutex::new(Self::new(capacity)))
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of entries, dead ones included
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop dead entries, returning how many were removed
    pub fn prune(&mut self) -> usize {
        let before = self.entries.len();
        self.entries.retain(|w| w.strong_count() > 0);
        before - self.entries.len()
    }

    /// Number of members still alive
    pub fn live_count(&self) -> usize {
        self.entries.iter().filter(|w| w.strong_count() > 0).count()
    }

    /// Whether another member would exceed the capacity (after pruning)
    pub fn is_full(&mut self) -> bool {
        self.prune();
        self.entries.len() >= self.capacity
    }

    /// Append a weak reference to `member`
    pub fn admit(&mut self, member: &Arc<T>) -> Result<(), RelayError> {
        if self.is_full() {
            return Err(RelayError::Capacity {
                capacity: self.capacity,
            });
        }
        self.entries.push(Arc::downgrade(member));
        Ok(())
    }

    /// Visit every live member in insertion order, pruning dead ones
    pub fn for_each_live(&mut self, mut f: impl FnMut(&Arc<T>)) {
        self.entries.retain(|weak| match weak.upgrade() {
            Some(member) => {
                f(&member);
                true
            }
            None => false,
        });
    }

    /// Strong references to every live member, pruning dead ones
    pub fn live(&mut self) -> Vec<Arc<T>> {
        let mut members = Vec::with_capacity(self.entries.len());
        self.for_each_live(|m| members.push(m.clone()));
        members
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_admit_until_full() {
        let mut registry = Registry::new(2);
        let a = Arc::new("a");
        let b = Arc::new("b");
        let c = Arc::new("c");

        registry.admit(&a).unwrap();
        registry.admit(&b).unwrap();

        assert!(matches!(
            registry.admit(&c),
            Err(RelayError::Capacity { capacity: 2 })
        ));
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_dead_entry_frees_a_slot() {
        let mut registry = Registry::new(1);
        let a = Arc::new(1);
        registry.admit(&a).unwrap();
        drop(a);

        let b = Arc::new(2);
        registry.admit(&b).unwrap();
        assert_eq!(registry.live(), vec![b]);
    }

    #[test]
    fn test_walk_prunes_exactly_the_dead() {
        let mut registry = Registry::new(3);
        let a = Arc::new("a");
        let b = Arc::new("b");
        let c = Arc::new("c");
        registry.admit(&a).unwrap();
        registry.admit(&b).unwrap();
        registry.admit(&c).unwrap();

        drop(b);
        assert_eq!(registry.live_count(), 2);
        assert_eq!(registry.len(), 3);

        let mut visited = Vec::new();
        registry.for_each_live(|m| visited.push(**m));

        assert_eq!(visited, vec!["a", "c"]);
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_registry_does_not_keep_members_alive() {
        let mut registry = Registry::new(1);
        let a = Arc::new(String::from("a"));
        let weak = Arc::downgrade(&a);
        registry.admit(&a).unwrap();

        drop(a);

        assert!(weak.upgrade().is_none());
        assert_eq!(registry.prune(), 1);
        assert!(registry.is_empty());
    }
}
