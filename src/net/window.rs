//! Client-side window of recent snapshots
//!
//! Keyed by sequence, so out-of-order arrivals land in the right slot. The
//! reconciler is the only owner; snapshots are never modified once stored.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::debug;

use crate::state::{Sequence, StateSnapshot};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreOutcome {
    Inserted,
    /// Identical state was already stored under this sequence
    Duplicate,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WindowError {
    #[error("Different snapshot already stored at sequence {sequence}")]
    Conflict { sequence: Sequence },
}

#[derive(Debug)]
pub struct SnapshotWindow {
    entries: BTreeMap<Sequence, Arc<StateSnapshot>>,
    capacity: usize,
}

impl SnapshotWindow {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: BTreeMap::new(),
            capacity: capacity.max(1),
        }
    }

    /// Store a snapshot under its sequence.
    ///
    /// Storing the same state twice is a no-op. A different state under an
    /// existing sequence means client and server disagree about history.
    pub fn store(&mut self, snapshot: Arc<StateSnapshot>) -> Result<StoreOutcome, WindowError> {
        let sequence = snapshot.sequence();
        if let Some(existing) = self.entries.get(&sequence) {
            return if existing.same_state(&snapshot) {
                Ok(StoreOutcome::Duplicate)
            } else {
                Err(WindowError::Conflict { sequence })
            };
        }

        self.entries.insert(sequence, snapshot);
        while self.entries.len() > self.capacity {
            let evict = self.entries.keys().copied().find(|s| *s != sequence);
            match evict {
                Some(oldest) => {
                    self.entries.remove(&oldest);
                    debug!(sequence = oldest, capacity = self.capacity, "Window full, evicted snapshot");
                }
                None => break,
            }
        }
        Ok(StoreOutcome::Inserted)
    }

    pub fn lookup(&self, sequence: Sequence) -> Option<&Arc<StateSnapshot>> {
        self.entries.get(&sequence)
    }

    pub fn contains(&self, sequence: Sequence) -> bool {
        self.entries.contains_key(&sequence)
    }

    /// Discard every entry below `below`; returns how many were removed
    pub fn prune(&mut self, below: Sequence) -> usize {
        let kept = self.entries.split_off(&below);
        let removed = self.entries.len();
        self.entries = kept;
        removed
    }

    /// Drop everything except `sequence`
    pub fn retain_only(&mut self, sequence: Sequence) {
        self.entries.retain(|s, _| *s == sequence);
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn latest(&self) -> Option<&Arc<StateSnapshot>> {
        self.entries.values().next_back()
    }

    pub fn oldest(&self) -> Option<&Arc<StateSnapshot>> {
        self.entries.values().next()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Stored sequences in ascending order
    pub fn sequences(&self) -> impl Iterator<Item = Sequence> + '_ {
        self.entries.keys().copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{ComponentState, EntityState};
    use crate::util::vec2::Vec2;

    fn snap(sequence: Sequence, x: f32) -> Arc<StateSnapshot> {
        let entity =
            EntityState::new(1).with_component(ComponentState::transform(Vec2::new(x, 0.0), 0.0));
        Arc::new(StateSnapshot::from_records(sequence, 0.0, vec![entity], vec![]).unwrap())
    }

    fn window_with(sequences: &[Sequence]) -> SnapshotWindow {
        let mut window = SnapshotWindow::new(64);
        for &seq in sequences {
            window.store(snap(seq, seq as f32)).unwrap();
        }
        window
    }

    #[test]
    fn test_store_and_lookup() {
        let window = window_with(&[3, 1, 2]);
        assert_eq!(window.len(), 3);
        assert_eq!(window.lookup(2).map(|s| s.sequence()), Some(2));
        assert!(window.lookup(4).is_none());
        assert_eq!(window.sequences().collect::<Vec<_>>(), vec![1, 2, 3]);
        assert_eq!(window.latest().map(|s| s.sequence()), Some(3));
        assert_eq!(window.oldest().map(|s| s.sequence()), Some(1));
    }

    #[test]
    fn test_duplicate_store_is_idempotent() {
        let mut window = window_with(&[1]);
        let original = snap(1, 1.0);
        // Same records reconstructed at a different local time
        let later =
            StateSnapshot::from_records(1, 42.0, original.entities().values().cloned(), vec![])
                .unwrap();

        assert_eq!(window.store(Arc::new(later)), Ok(StoreOutcome::Duplicate));
        assert_eq!(window.len(), 1);
        assert_eq!(window.lookup(1).map(|s| s.game_time()), Some(0.0));
    }

    #[test]
    fn test_conflicting_store_rejected() {
        let mut window = window_with(&[1]);
        assert_eq!(
            window.store(snap(1, 99.0)),
            Err(WindowError::Conflict { sequence: 1 })
        );
        assert_eq!(window.lookup(1).map(|s| s.sequence()), Some(1));
        assert!(window.lookup(1).unwrap().same_state(&snap(1, 1.0)));
    }

    #[test]
    fn test_prune_removes_older_entries() {
        let mut window = window_with(&[1, 2, 3, 4, 5]);
        assert_eq!(window.prune(3), 2);

        assert!(window.lookup(1).is_none());
        assert!(window.lookup(2).is_none());
        assert!(window.lookup(3).is_some());
        assert_eq!(window.prune(3), 0);
    }

    #[test]
    fn test_prune_everything() {
        let mut window = window_with(&[1, 2]);
        assert_eq!(window.prune(10), 2);
        assert!(window.is_empty());
    }

    #[test]
    fn test_retain_only() {
        let mut window = window_with(&[1, 2, 3]);
        window.retain_only(2);
        assert_eq!(window.sequences().collect::<Vec<_>>(), vec![2]);

        window.clear();
        assert!(window.is_empty());
    }

    #[test]
    fn test_capacity_evicts_oldest() {
        let mut window = SnapshotWindow::new(3);
        for seq in 1..=4 {
            window.store(snap(seq, 0.0)).unwrap();
        }
        assert_eq!(window.sequences().collect::<Vec<_>>(), vec![2, 3, 4]);
    }

    #[test]
    fn test_capacity_never_evicts_just_stored() {
        let mut window = SnapshotWindow::new(2);
        window.store(snap(5, 0.0)).unwrap();
        window.store(snap(6, 0.0)).unwrap();

        // An old sequence arriving late is kept; the oldest other entry goes
        window.store(snap(2, 0.0)).unwrap();
        assert_eq!(window.sequences().collect::<Vec<_>>(), vec![2, 6]);
    }
}
