//! Client-side state reconciliation
//!
//! Incoming deltas are applied to a base snapshot from the window, the
//! result is stored under its own sequence, and when it is the newest state
//! seen the live objects are converged to it. Every applied snapshot is
//! acknowledged so the server can move its delta base forward.
//!
//! Loss and reordering are expected: a delta whose base is unknown is
//! dropped (and parked for a few ticks in case its base shows up), never
//! treated as an error. The only error is a desync, where the server sent
//! two different states under one sequence.

use std::collections::VecDeque;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::net::ack::AckChannel;
use crate::net::protocol::FullState;
use crate::net::registry::EntityRegistry;
use crate::net::window::{SnapshotWindow, StoreOutcome, WindowError};
use crate::state::{DeltaError, Sequence, StateDelta, StateSnapshot};
use crate::util::clock::Clock;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconcilerConfig {
    pub window_capacity: usize,
    /// Deltas held back waiting for their base (0 disables parking)
    pub pending_capacity: usize,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            window_capacity: 64,
            pending_capacity: 8,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPhase {
    /// No full state yet; deltas have nothing to apply to
    AwaitingInitialState,
    Synchronized,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DropReason {
    AwaitingInitialState,
    /// The delta's base is not in the window
    UnknownBase(Sequence),
    Malformed(DeltaError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileOutcome {
    Applied {
        sequence: Sequence,
        /// Newest state seen so far; live objects were converged to it
        became_current: bool,
    },
    /// Identical state was already stored (re-acked)
    Duplicate { sequence: Sequence },
    Dropped(DropReason),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReconcileError {
    #[error("Desync at sequence {sequence}: conflicting snapshot, full state requested")]
    Desync { sequence: Sequence },
}

/// Running counters, read by the client for metrics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileStats {
    pub full_states_applied: u64,
    pub deltas_applied: u64,
    pub duplicates: u64,
    pub dropped_unknown_base: u64,
    pub dropped_malformed: u64,
    pub dropped_awaiting_initial: u64,
    pub desyncs: u64,
    pub parked_recovered: u64,
    pub parked_discarded: u64,
}

pub struct StateReconciler<R, A, C> {
    phase: SyncPhase,
    window: SnapshotWindow,
    current: Option<Arc<StateSnapshot>>,
    /// Parked deltas below this base can never apply again
    prune_floor: Sequence,
    pending: VecDeque<StateDelta>,
    pending_capacity: usize,
    stats: ReconcileStats,
    registry: R,
    acks: A,
    clock: C,
}

impl<R: EntityRegistry, A: AckChannel, C: Clock> StateReconciler<R, A, C> {
    pub fn new(config: ReconcilerConfig, registry: R, acks: A, clock: C) -> Self {
        Self {
            phase: SyncPhase::AwaitingInitialState,
            window: SnapshotWindow::new(config.window_capacity),
            current: None,
            prune_floor: 0,
            pending: VecDeque::with_capacity(config.pending_capacity),
            pending_capacity: config.pending_capacity,
            stats: ReconcileStats::default(),
            registry,
            acks,
            clock,
        }
    }

    pub fn phase(&self) -> SyncPhase {
        self.phase
    }

    /// Newest snapshot the live objects were converged to
    pub fn current(&self) -> Option<&Arc<StateSnapshot>> {
        self.current.as_ref()
    }

    pub fn current_sequence(&self) -> Option<Sequence> {
        self.current.as_ref().map(|s| s.sequence())
    }

    pub fn window(&self) -> &SnapshotWindow {
        &self.window
    }

    pub fn registry(&self) -> &R {
        &self.registry
    }

    pub fn ack_channel(&self) -> &A {
        &self.acks
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn stats(&self) -> ReconcileStats {
        self.stats
    }

    /// Install a full state: it replaces all history and always becomes current
    pub fn apply_full_state(&mut self, full: FullState) -> Result<ReconcileOutcome, ReconcileError> {
        let snapshot = match full.into_snapshot(self.clock.now()) {
            Ok(snapshot) => Arc::new(snapshot),
            Err(e) => {
                warn!(error = %e, "Dropping malformed full state");
                self.stats.dropped_malformed += 1;
                return Ok(ReconcileOutcome::Dropped(DropReason::Malformed(e.into())));
            }
        };
        let sequence = snapshot.sequence();

        self.window.clear();
        // Cannot conflict: the window is empty
        let _ = self.window.store(Arc::clone(&snapshot));

        if self.phase == SyncPhase::AwaitingInitialState {
            info!(sequence, entities = snapshot.entity_count(), "Initial full state applied");
        } else {
            info!(sequence, entities = snapshot.entity_count(), "Resynchronized from full state");
        }
        self.phase = SyncPhase::Synchronized;
        self.current = Some(Arc::clone(&snapshot));
        converge(&mut self.registry, &snapshot);
        self.acks.send_ack(sequence);
        self.stats.full_states_applied += 1;

        self.prune_floor = sequence;
        let before = self.pending.len();
        self.pending.retain(|d| d.from >= sequence);
        self.stats.parked_discarded += (before - self.pending.len()) as u64;
        self.retry_pending();

        Ok(ReconcileOutcome::Applied {
            sequence,
            became_current: true,
        })
    }

    pub fn apply_delta(&mut self, delta: &StateDelta) -> Result<ReconcileOutcome, ReconcileError> {
        if self.phase == SyncPhase::AwaitingInitialState {
            debug!(from = delta.from, to = delta.to, "Delta before initial state, dropped");
            self.stats.dropped_awaiting_initial += 1;
            return Ok(ReconcileOutcome::Dropped(DropReason::AwaitingInitialState));
        }
        if let Err(e) = delta.validate() {
            warn!(from = delta.from, to = delta.to, error = %e, "Dropping malformed delta");
            self.stats.dropped_malformed += 1;
            return Ok(ReconcileOutcome::Dropped(DropReason::Malformed(e)));
        }

        let outcome = match self.reconcile(delta)? {
            Some(outcome) => outcome,
            None => {
                debug!(from = delta.from, to = delta.to, "Delta base unknown, dropped");
                self.stats.dropped_unknown_base += 1;
                self.park(delta);
                return Ok(ReconcileOutcome::Dropped(DropReason::UnknownBase(delta.from)));
            }
        };

        if matches!(outcome, ReconcileOutcome::Applied { .. }) {
            self.retry_pending();
        }
        Ok(outcome)
    }

    /// Apply a validated delta if its base is stored; `None` when it is not
    fn reconcile(&mut self, delta: &StateDelta) -> Result<Option<ReconcileOutcome>, ReconcileError> {
        let Some(base) = self.window.lookup(delta.from) else {
            return Ok(None);
        };
        let snapshot = match delta.apply(base, self.clock.now()) {
            Ok(snapshot) => Arc::new(snapshot),
            Err(e) => {
                warn!(from = delta.from, to = delta.to, error = %e, "Dropping malformed delta");
                self.stats.dropped_malformed += 1;
                return Ok(Some(ReconcileOutcome::Dropped(DropReason::Malformed(e))));
            }
        };
        let sequence = snapshot.sequence();

        match self.window.store(Arc::clone(&snapshot)) {
            Ok(StoreOutcome::Inserted) => {}
            Ok(StoreOutcome::Duplicate) => {
                self.stats.duplicates += 1;
                self.acks.send_ack(sequence);
                return Ok(Some(ReconcileOutcome::Duplicate { sequence }));
            }
            Err(WindowError::Conflict { sequence }) => {
                warn!(sequence, "Snapshot conflict, requesting full state");
                self.stats.desyncs += 1;
                self.acks.request_full_state();
                return Err(ReconcileError::Desync { sequence });
            }
        }

        let became_current = self.current_sequence().map_or(true, |c| sequence > c);
        if became_current {
            self.current = Some(Arc::clone(&snapshot));
            converge(&mut self.registry, &snapshot);
        }
        self.acks.send_ack(sequence);
        self.stats.deltas_applied += 1;

        let pruned = self.window.prune(delta.from);
        self.prune_floor = self.prune_floor.max(delta.from);
        if pruned > 0 {
            debug!(below = delta.from, pruned, "Pruned snapshot window");
        }

        Ok(Some(ReconcileOutcome::Applied {
            sequence,
            became_current,
        }))
    }

    fn park(&mut self, delta: &StateDelta) {
        if self.pending_capacity == 0 || delta.from < self.prune_floor {
            return;
        }
        if self
            .pending
            .iter()
            .any(|d| d.from == delta.from && d.to == delta.to)
        {
            return;
        }
        if self.pending.len() == self.pending_capacity {
            self.pending.pop_front();
            self.stats.parked_discarded += 1;
        }
        self.pending.push_back(delta.clone());
    }

    /// Apply parked deltas whose base has since been stored, until none is left
    fn retry_pending(&mut self) {
        loop {
            let floor = self.prune_floor;
            let before = self.pending.len();
            self.pending.retain(|d| d.from >= floor);
            self.stats.parked_discarded += (before - self.pending.len()) as u64;

            let Some(idx) = self
                .pending
                .iter()
                .position(|d| self.window.contains(d.from))
            else {
                return;
            };
            let Some(delta) = self.pending.remove(idx) else {
                return;
            };

            match self.reconcile(&delta) {
                Ok(Some(ReconcileOutcome::Applied { sequence, .. })) => {
                    debug!(from = delta.from, sequence, "Applied parked delta");
                    self.stats.parked_recovered += 1;
                }
                Ok(_) => {}
                // Full state already requested; stop building on this history
                Err(_) => return,
            }
        }
    }
}

/// Make the live objects show exactly `snapshot`.
///
/// Anything live but absent from the snapshot was removed at some point,
/// possibly by a tombstone in a delta this client never received.
fn converge<R: EntityRegistry>(registry: &mut R, snapshot: &StateSnapshot) {
    for id in registry.entity_ids() {
        if snapshot.entity(id).is_none() {
            registry.destroy_entity(id);
        }
    }
    for id in registry.player_ids() {
        if snapshot.player(id).is_none() {
            registry.retire_player(id);
        }
    }

    for (id, state) in snapshot.entities() {
        if !registry.contains_entity(*id) {
            registry.create_entity(*id);
        }
        registry.apply_state_to_entity(*id, state);
    }
    for (id, state) in snapshot.players() {
        registry.apply_state_to_player(*id, state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::ack::AckLog;
    use crate::net::compiler::compute_delta;
    use crate::net::registry::LiveWorld;
    use crate::state::{
        ComponentFamily, ComponentState, EntityState, PlayerState, SessionStatus, SnapshotError,
        Tombstone,
    };
    use crate::util::clock::ManualClock;
    use crate::util::vec2::Vec2;

    type TestReconciler<'a> = StateReconciler<LiveWorld, AckLog, &'a ManualClock>;

    fn reconciler(clock: &ManualClock, pending_capacity: usize) -> TestReconciler<'_> {
        StateReconciler::new(
            ReconcilerConfig {
                window_capacity: 32,
                pending_capacity,
            },
            LiveWorld::new(),
            AckLog::default(),
            clock,
        )
    }

    fn at(id: u32, x: f32) -> EntityState {
        EntityState::new(id).with_component(ComponentState::transform(Vec2::new(x, 0.0), 0.0))
    }

    fn visible(id: u32) -> EntityState {
        EntityState::new(id).with_component(ComponentState::sprite(true, 0, "barrel"))
    }

    fn snap(sequence: Sequence, entities: Vec<EntityState>) -> StateSnapshot {
        StateSnapshot::from_records(sequence, 0.0, entities, vec![]).unwrap()
    }

    fn full(snapshot: &StateSnapshot) -> FullState {
        FullState::from_snapshot(snapshot)
    }

    fn synced<'a>(clock: &'a ManualClock, base: &StateSnapshot) -> TestReconciler<'a> {
        let mut r = reconciler(clock, 8);
        r.apply_full_state(full(base)).unwrap();
        r
    }

    #[test]
    fn test_starts_awaiting_initial_state() {
        let clock = ManualClock::new(0.0);
        let mut r = reconciler(&clock, 8);

        assert_eq!(r.phase(), SyncPhase::AwaitingInitialState);
        let outcome = r.apply_delta(&StateDelta::new(1, 2)).unwrap();
        assert_eq!(outcome, ReconcileOutcome::Dropped(DropReason::AwaitingInitialState));
        assert!(r.window().is_empty());
        assert!(r.ack_channel().acks.is_empty());
    }

    #[test]
    fn test_full_state_synchronizes_and_converges() {
        let clock = ManualClock::new(7.0);
        let mut r = reconciler(&clock, 8);
        let mut player = PlayerState::new(1, "Alice");
        player.controlled_entity = Some(1);
        let snapshot =
            StateSnapshot::from_records(4, 0.0, vec![at(1, 2.0), visible(2)], vec![player]).unwrap();

        let outcome = r.apply_full_state(full(&snapshot)).unwrap();

        assert_eq!(
            outcome,
            ReconcileOutcome::Applied {
                sequence: 4,
                became_current: true
            }
        );
        assert_eq!(r.phase(), SyncPhase::Synchronized);
        assert_eq!(r.current().map(|s| s.game_time()), Some(7.0));
        assert!(r.registry().matches(&snapshot));
        assert_eq!(r.ack_channel().acks, vec![4]);
    }

    #[test]
    fn test_full_state_clears_window() {
        let clock = ManualClock::new(0.0);
        let base = snap(1, vec![at(1, 0.0)]);
        let mut r = synced(&clock, &base);
        r.apply_delta(&compute_delta(&base, &snap(2, vec![at(1, 1.0)])))
            .unwrap();
        assert_eq!(r.window().len(), 2);

        r.apply_full_state(full(&snap(10, vec![at(5, 0.0)]))).unwrap();

        assert_eq!(r.phase(), SyncPhase::Synchronized);
        assert_eq!(r.window().sequences().collect::<Vec<_>>(), vec![10]);
        assert!(r.registry().contains_entity(5));
        assert!(!r.registry().contains_entity(1));
    }

    #[test]
    fn test_delta_moves_entity() {
        let clock = ManualClock::new(0.0);
        let base = snap(1, vec![at(1, 0.0)]);
        let mut r = synced(&clock, &base);

        let mut delta = StateDelta::new(1, 2);
        delta.entities.push(at(1, 5.0));
        clock.advance(0.1);
        let outcome = r.apply_delta(&delta).unwrap();

        assert_eq!(
            outcome,
            ReconcileOutcome::Applied {
                sequence: 2,
                became_current: true
            }
        );
        let current = r.current().unwrap();
        assert_eq!(current.sequence(), 2);
        assert_eq!(current.entity(1), Some(&at(1, 5.0)));
        assert_eq!(current.game_time(), 0.1);
        assert_eq!(
            r.registry().entity(1).and_then(|e| e.position),
            Some(Vec2::new(5.0, 0.0))
        );
        assert_eq!(r.ack_channel().acks, vec![1, 2]);
    }

    #[test]
    fn test_tombstone_destroys_live_entity() {
        let clock = ManualClock::new(0.0);
        let base = snap(1, vec![visible(1), visible(2)]);
        let mut r = synced(&clock, &base);
        assert!(r.registry().contains_entity(2));

        let mut delta = StateDelta::new(1, 2);
        delta.tombstones.push(Tombstone::Entity(2));
        r.apply_delta(&delta).unwrap();

        let current = r.current().unwrap();
        assert_eq!(current.entities().keys().copied().collect::<Vec<_>>(), vec![1]);
        assert!(!r.registry().contains_entity(2));
        assert_eq!(r.registry().entities_destroyed(), 1);
    }

    #[test]
    fn test_unknown_base_dropped_window_unchanged() {
        let clock = ManualClock::new(0.0);
        let base = snap(1, vec![at(1, 0.0)]);
        let mut r = synced(&clock, &base);
        let before: Vec<_> = r.window().sequences().collect();

        let mut delta = StateDelta::new(7, 8);
        delta.entities.push(at(1, 3.0));
        let outcome = r.apply_delta(&delta).unwrap();

        assert_eq!(outcome, ReconcileOutcome::Dropped(DropReason::UnknownBase(7)));
        assert_eq!(r.window().sequences().collect::<Vec<_>>(), before);
        assert_eq!(r.current_sequence(), Some(1));
        assert_eq!(r.ack_channel().acks, vec![1]);
        assert_eq!(r.stats().dropped_unknown_base, 1);
    }

    #[test]
    fn test_duplicate_delta_is_idempotent() {
        let clock = ManualClock::new(0.0);
        let base = snap(1, vec![at(1, 0.0)]);
        let mut r = synced(&clock, &base);
        let delta = compute_delta(&base, &snap(2, vec![at(1, 4.0), visible(3)]));

        r.apply_delta(&delta).unwrap();
        let first = Arc::clone(r.current().unwrap());
        clock.advance(1.0);
        let outcome = r.apply_delta(&delta).unwrap();

        assert_eq!(outcome, ReconcileOutcome::Duplicate { sequence: 2 });
        assert!(r.current().unwrap().same_state(&first));
        assert_eq!(r.window().len(), 2);
        assert_eq!(r.registry().entity_count(), 2);
        // Re-acked in case the first ack was lost
        assert_eq!(r.ack_channel().acks, vec![1, 2, 2]);
    }

    #[test]
    fn test_conflict_is_desync() {
        let clock = ManualClock::new(0.0);
        let base = snap(1, vec![at(1, 0.0)]);
        let mut r = synced(&clock, &base);

        let mut a = StateDelta::new(1, 2);
        a.entities.push(at(1, 1.0));
        let mut b = StateDelta::new(1, 2);
        b.entities.push(at(1, 2.0));

        r.apply_delta(&a).unwrap();
        let err = r.apply_delta(&b).unwrap_err();

        assert_eq!(err, ReconcileError::Desync { sequence: 2 });
        assert_eq!(r.phase(), SyncPhase::Synchronized);
        assert_eq!(r.current().unwrap().entity(1), Some(&at(1, 1.0)));
        assert_eq!(r.ack_channel().full_state_requests, 1);
        assert_eq!(r.stats().desyncs, 1);
    }

    #[test]
    fn test_older_delta_stored_but_not_current() {
        let clock = ManualClock::new(0.0);
        let base = snap(1, vec![at(1, 0.0)]);
        let mut r = synced(&clock, &base);
        let s2 = snap(2, vec![at(1, 2.0)]);
        let s3 = snap(3, vec![at(1, 3.0)]);

        r.apply_delta(&compute_delta(&base, &s3)).unwrap();
        let outcome = r.apply_delta(&compute_delta(&base, &s2)).unwrap();

        assert_eq!(
            outcome,
            ReconcileOutcome::Applied {
                sequence: 2,
                became_current: false
            }
        );
        assert_eq!(r.current_sequence(), Some(3));
        assert!(r.window().contains(2));
        assert!(r.registry().matches(&s3));
        assert_eq!(r.ack_channel().acks, vec![1, 3, 2]);
    }

    #[test]
    fn test_prune_below_delta_base() {
        let clock = ManualClock::new(0.0);
        let s1 = snap(1, vec![at(1, 1.0)]);
        let s2 = snap(2, vec![at(1, 2.0)]);
        let s3 = snap(3, vec![at(1, 3.0)]);
        let mut r = synced(&clock, &s1);

        r.apply_delta(&compute_delta(&s1, &s2)).unwrap();
        r.apply_delta(&compute_delta(&s2, &s3)).unwrap();

        assert_eq!(r.window().sequences().collect::<Vec<_>>(), vec![2, 3]);
        assert!(r.window().lookup(1).is_none());
    }

    #[test]
    fn test_out_of_order_deltas_converge() {
        let clock = ManualClock::new(0.0);
        let s1 = snap(1, vec![at(1, 0.0), visible(2)]);
        let s2 = snap(2, vec![at(1, 1.0), visible(2)]);
        let s3 = snap(3, vec![at(1, 2.0), visible(4)]);
        let d12 = compute_delta(&s1, &s2);
        let d23 = compute_delta(&s2, &s3);

        let mut in_order = synced(&clock, &s1);
        in_order.apply_delta(&d12).unwrap();
        in_order.apply_delta(&d23).unwrap();

        let mut reordered = synced(&clock, &s1);
        assert_eq!(
            reordered.apply_delta(&d23).unwrap(),
            ReconcileOutcome::Dropped(DropReason::UnknownBase(2))
        );
        assert_eq!(reordered.pending_count(), 1);
        reordered.apply_delta(&d12).unwrap();

        let a = in_order.current().unwrap();
        let b = reordered.current().unwrap();
        assert_eq!(b.sequence(), 3);
        assert!(a.same_state(b));
        assert!(reordered.registry().matches(&s3));
        assert_eq!(reordered.pending_count(), 0);
        assert_eq!(reordered.stats().parked_recovered, 1);
        assert_eq!(reordered.ack_channel().acks, vec![1, 2, 3]);
    }

    #[test]
    fn test_parking_disabled() {
        let clock = ManualClock::new(0.0);
        let s1 = snap(1, vec![at(1, 0.0)]);
        let s2 = snap(2, vec![at(1, 1.0)]);
        let s3 = snap(3, vec![at(1, 2.0)]);
        let mut r = reconciler(&clock, 0);
        r.apply_full_state(full(&s1)).unwrap();

        r.apply_delta(&compute_delta(&s2, &s3)).unwrap();
        r.apply_delta(&compute_delta(&s1, &s2)).unwrap();

        assert_eq!(r.pending_count(), 0);
        assert_eq!(r.current_sequence(), Some(2));
    }

    #[test]
    fn test_parked_overflow_drops_oldest() {
        let clock = ManualClock::new(0.0);
        let mut r = reconciler(&clock, 2);
        r.apply_full_state(full(&snap(1, vec![]))).unwrap();

        for from in 5..8 {
            r.apply_delta(&StateDelta::new(from, from + 1)).unwrap();
        }
        assert_eq!(r.pending_count(), 2);
        assert_eq!(r.stats().parked_discarded, 1);
    }

    #[test]
    fn test_full_state_discards_older_parked() {
        let clock = ManualClock::new(0.0);
        let mut r = synced(&clock, &snap(1, vec![]));
        r.apply_delta(&StateDelta::new(3, 4)).unwrap();
        r.apply_delta(&StateDelta::new(12, 13)).unwrap();
        assert_eq!(r.pending_count(), 2);

        r.apply_full_state(full(&snap(10, vec![]))).unwrap();
        assert_eq!(r.pending_count(), 1);
    }

    #[test]
    fn test_converges_after_skipped_tombstone() {
        let clock = ManualClock::new(0.0);
        let s1 = snap(1, vec![visible(1), visible(2)]);
        // 2 was removed in an intermediate tick the client never saw
        let s3 = snap(3, vec![visible(1), visible(5)]);
        let mut r = synced(&clock, &s1);

        let delta = compute_delta(&s1, &s3);
        r.apply_delta(&delta).unwrap();

        assert!(!r.registry().contains_entity(2));
        assert!(r.registry().contains_entity(5));
        assert!(r.registry().matches(&s3));
    }

    #[test]
    fn test_players_converge() {
        let clock = ManualClock::new(0.0);
        let base = StateSnapshot::from_records(
            1,
            0.0,
            vec![],
            vec![PlayerState::new(1, "Alice"), PlayerState::new(2, "Bob")],
        )
        .unwrap();
        let mut r = synced(&clock, &base);

        let mut delta = StateDelta::new(1, 2);
        let mut alice = PlayerState::new(1, "Alice");
        alice.status = SessionStatus::InGame;
        delta.players.push(alice);
        delta.tombstones.push(Tombstone::Player(2));
        r.apply_delta(&delta).unwrap();

        assert_eq!(
            r.registry().player(1).map(|p| p.status),
            Some(SessionStatus::InGame)
        );
        assert!(r.registry().player(2).is_none());
    }

    #[test]
    fn test_malformed_delta_dropped() {
        let clock = ManualClock::new(0.0);
        let mut r = synced(&clock, &snap(1, vec![at(1, 0.0)]));

        let mut delta = StateDelta::new(1, 2);
        delta.entities.push(at(1, 1.0));
        delta.entities.push(at(1, 2.0));
        let outcome = r.apply_delta(&delta).unwrap();

        assert_eq!(
            outcome,
            ReconcileOutcome::Dropped(DropReason::Malformed(DeltaError::Record(
                SnapshotError::DuplicateEntity(1)
            )))
        );
        assert_eq!(r.current_sequence(), Some(1));
        assert_eq!(r.pending_count(), 0);
    }

    #[test]
    fn test_non_finite_delta_dropped_on_every_delivery() {
        let clock = ManualClock::new(0.0);
        let mut r = synced(&clock, &snap(1, vec![at(1, 0.0)]));

        let mut delta = StateDelta::new(1, 2);
        delta
            .entities
            .push(at(1, 1.0).with_component(ComponentState::Physics { mass: f32::NAN }));
        let expected = ReconcileOutcome::Dropped(DropReason::Malformed(DeltaError::Record(
            SnapshotError::NonFinite {
                entity: 1,
                family: ComponentFamily::Physics,
            },
        )));

        assert_eq!(r.apply_delta(&delta), Ok(expected.clone()));
        assert_eq!(r.apply_delta(&delta), Ok(expected));
        assert_eq!(r.current_sequence(), Some(1));
        assert!(!r.window().contains(2));
        assert_eq!(r.ack_channel().full_state_requests, 0);
        assert_eq!(r.stats().desyncs, 0);
    }

    #[test]
    fn test_malformed_full_state_dropped() {
        let clock = ManualClock::new(0.0);
        let mut r = reconciler(&clock, 8);
        let bad = FullState {
            sequence: 1,
            time: 0.0,
            entities: vec![visible(1), visible(1)],
            players: vec![],
        };

        let outcome = r.apply_full_state(bad).unwrap();
        assert!(matches!(
            outcome,
            ReconcileOutcome::Dropped(DropReason::Malformed(_))
        ));
        assert_eq!(r.phase(), SyncPhase::AwaitingInitialState);
    }

    #[test]
    fn test_round_trip_through_reconciler() {
        let clock = ManualClock::new(0.0);
        let a = StateSnapshot::from_records(
            5,
            0.0,
            vec![at(1, 0.0), visible(2), at(3, 1.0)],
            vec![PlayerState::new(1, "Alice")],
        )
        .unwrap();
        let b = StateSnapshot::from_records(
            9,
            0.0,
            vec![at(1, 4.0), at(3, 1.0), visible(8)],
            vec![PlayerState::new(2, "Bob")],
        )
        .unwrap();
        let mut r = synced(&clock, &a);

        r.apply_delta(&compute_delta(&a, &b)).unwrap();

        assert!(r.current().unwrap().same_state(&b));
        assert!(r.registry().matches(&b));
    }
}
