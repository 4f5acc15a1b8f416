//! Server-side delta compilation
//!
//! The server keeps a bounded history of the snapshots it published. For each
//! client, the snapshot that client last acknowledged is looked up in that
//! history and diffed against the current tick. A client whose base has
//! already fallen out of the history needs a full state instead.

use std::collections::VecDeque;
use std::sync::Arc;

use crate::state::{Sequence, StateDelta, StateSnapshot, Tombstone};

// ============================================================================
// Delta Generation
// ============================================================================

/// Diff `base` against `current`.
///
/// Records are compared field for field with no tolerance, so applying the
/// result to `base` reproduces `current` exactly. Updates and tombstones are
/// emitted in ascending identity order.
pub fn compute_delta(base: &StateSnapshot, current: &StateSnapshot) -> StateDelta {
    let mut delta = StateDelta::new(base.sequence(), current.sequence());

    for (id, entity) in current.entities() {
        if base.entity(*id) != Some(entity) {
            delta.entities.push(entity.clone());
        }
    }
    for (id, player) in current.players() {
        if base.player(*id) != Some(player) {
            delta.players.push(player.clone());
        }
    }

    delta.tombstones.extend(
        base.entities()
            .keys()
            .filter(|id| current.entity(**id).is_none())
            .map(|id| Tombstone::Entity(*id)),
    );
    delta.tombstones.extend(
        base.players()
            .keys()
            .filter(|id| current.player(**id).is_none())
            .map(|id| Tombstone::Player(*id)),
    );

    delta
}

// ============================================================================
// Snapshot History
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HistoryError {
    #[error("Snapshot {sequence} is not newer than {newest}")]
    OutOfOrder { sequence: Sequence, newest: Sequence },
}

/// Bounded ring of published snapshots, oldest first
#[derive(Debug)]
pub struct SnapshotHistory {
    entries: VecDeque<Arc<StateSnapshot>>,
    capacity: usize,
}

impl SnapshotHistory {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Append a snapshot. Sequences must be strictly increasing; the oldest
    /// entry is dropped once the ring is full.
    pub fn push(&mut self, snapshot: Arc<StateSnapshot>) -> Result<(), HistoryError> {
        if let Some(newest) = self.entries.back() {
            if snapshot.sequence() <= newest.sequence() {
                return Err(HistoryError::OutOfOrder {
                    sequence: snapshot.sequence(),
                    newest: newest.sequence(),
                });
            }
        }

        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(snapshot);
        Ok(())
    }

    pub fn get(&self, sequence: Sequence) -> Option<&Arc<StateSnapshot>> {
        self.entries
            .binary_search_by_key(&sequence, |s| s.sequence())
            .ok()
            .and_then(|idx| self.entries.get(idx))
    }

    pub fn contains(&self, sequence: Sequence) -> bool {
        self.get(sequence).is_some()
    }

    pub fn latest(&self) -> Option<&Arc<StateSnapshot>> {
        self.entries.back()
    }

    pub fn oldest_sequence(&self) -> Option<Sequence> {
        self.entries.front().map(|s| s.sequence())
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
}

// ============================================================================
// Compiler
// ============================================================================

/// What to send a client this tick
#[derive(Debug, Clone, PartialEq)]
pub enum DeltaOutcome {
    Delta(StateDelta),
    /// No usable base: the client must receive a full state
    NeedsFullState,
    /// The client already acknowledged the current snapshot
    UpToDate,
}

#[derive(Debug)]
pub struct DeltaCompiler {
    history: SnapshotHistory,
}

impl DeltaCompiler {
    pub fn new(history_capacity: usize) -> Self {
        Self {
            history: SnapshotHistory::new(history_capacity),
        }
    }

    pub fn record(&mut self, snapshot: Arc<StateSnapshot>) -> Result<(), HistoryError> {
        self.history.push(snapshot)
    }

    pub fn latest(&self) -> Option<&Arc<StateSnapshot>> {
        self.history.latest()
    }

    pub fn history(&self) -> &SnapshotHistory {
        &self.history
    }

    /// Compile the update for a client whose last acknowledgement is `last_acked`
    pub fn compile(&self, last_acked: Option<Sequence>, current: &StateSnapshot) -> DeltaOutcome {
        let Some(acked) = last_acked else {
            return DeltaOutcome::NeedsFullState;
        };
        if acked >= current.sequence() {
            return DeltaOutcome::UpToDate;
        }
        match self.history.get(acked) {
            Some(base) => DeltaOutcome::Delta(compute_delta(base, current)),
            None => DeltaOutcome::NeedsFullState,
        }
    }
}
