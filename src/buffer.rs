//! Logical, device-independent buffers with per-location coherence tracking.
//!
//! A [`Buffer`] is a handle to an array of elements. It records, per device
//! location, whether that location's copy is invalid, valid, or the
//! authoritative source of truth, plus a hazard index of the most recent
//! operations touching it. All of it is mutated under the buffer's own lock;
//! submissions on unrelated buffers never contend.

use std::sync::{Arc, Mutex};

use derive_more::Display;
use rustc_hash::FxHashMap as HashMap;
use thiserror::Error;

use crate::{access::AccessMode, device::DeviceLoc, graph::NodeId};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct BufferId(pub uuid::Uuid);

impl BufferId {
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum CoherenceState {
    Invalid,
    Valid,
    Authoritative,
}

#[derive(Debug, Error)]
pub enum BufferError {
    #[error("buffer {0} was finalized")]
    Finalized(BufferId),
    #[error("buffer {0} has no authoritative copy")]
    NoAuthoritative(BufferId),
}

/// Per-location coherence records. Locations absent from a map hold no valid
/// copy. Exactly one location is authoritative at a time.
///
/// Two views are kept: `entries` reflects copies that exist right now and is
/// updated on retirement; `projected` reflects what the pending operations
/// will leave behind and is updated at planning time. Migration decisions
/// must use the projected view, or a read submitted behind an unretired
/// write would copy from the stale authoritative location.
#[derive(Debug, Default, Clone)]
struct Coherence {
    entries: HashMap<DeviceLoc, CoherenceState>,
    projected: HashMap<DeviceLoc, CoherenceState>,
    /// Copies in flight, so a location is migrated to at most once between
    /// writes.
    pending: HashMap<DeviceLoc, NodeId>,
    generation: u64,
}

fn is_valid(entries: &HashMap<DeviceLoc, CoherenceState>, loc: DeviceLoc) -> bool {
    matches!(
        entries.get(&loc),
        Some(CoherenceState::Valid | CoherenceState::Authoritative)
    )
}

fn authoritative(entries: &HashMap<DeviceLoc, CoherenceState>) -> Option<DeviceLoc> {
    entries
        .iter()
        .find(|&(_, &state)| state == CoherenceState::Authoritative)
        .map(|(&loc, _)| loc)
}

impl Coherence {
    /// A planned write leaves the target as the sole projected copy; a
    /// completed write invalidates every other live copy and bumps the
    /// generation.
    fn plan_write(&mut self, loc: DeviceLoc) {
        self.projected.clear();
        self.projected.insert(loc, CoherenceState::Authoritative);
        self.pending.clear();
    }

    fn record_write(&mut self, loc: DeviceLoc) {
        self.entries.clear();
        self.entries.insert(loc, CoherenceState::Authoritative);
        self.generation += 1;
    }

    /// A copy leaves the source authoritative and the destination valid.
    fn plan_copy(&mut self, to: DeviceLoc, node: NodeId) {
        self.projected.entry(to).or_insert(CoherenceState::Valid);
        self.pending.insert(to, node);
    }

    fn record_copy(&mut self, to: DeviceLoc) {
        self.entries.entry(to).or_insert(CoherenceState::Valid);
    }
}

/// Most recent operations touching the buffer. Kept small on purpose: hazard
/// edges only ever reach the last writer and the readers since it.
#[derive(Debug, Default, Clone)]
struct HazardIndex {
    last_writer: Option<NodeId>,
    readers: Vec<NodeId>,
}

#[derive(Debug)]
struct BufferInner {
    coherence: Coherence,
    hazards: HazardIndex,
    finalized: bool,
}

#[derive(Debug)]
struct BufferState {
    id: BufferId,
    extent: usize,
    elem_size: usize,
    inner: Mutex<BufferInner>,
}

/// Hazard dependencies of one planned access, plus the migration it needs, if
/// any.
#[derive(Debug, Default)]
pub(crate) struct AccessPlan {
    pub deps: Vec<NodeId>,
    pub migration: Option<MigrationPlan>,
}

#[derive(Debug)]
pub(crate) struct MigrationPlan {
    pub node: NodeId,
    pub from: DeviceLoc,
    /// Hazard dependencies of the migration itself: a migration is a read.
    pub deps: Vec<NodeId>,
}

#[derive(Debug, Clone)]
pub struct Buffer {
    state: Arc<BufferState>,
}

impl PartialEq for Buffer {
    fn eq(&self, other: &Self) -> bool {
        self.state.id == other.state.id
    }
}

impl Eq for Buffer {}

fn push_unique(deps: &mut Vec<NodeId>, id: NodeId) {
    if !deps.contains(&id) {
        deps.push(id);
    }
}

impl Buffer {
    /// Declares a buffer of `extent` elements of `elem_size` bytes each. The
    /// host holds the authoritative copy until a device writes.
    pub(crate) fn new(extent: usize, elem_size: usize) -> Self {
        let mut coherence = Coherence::default();
        coherence
            .entries
            .insert(DeviceLoc::Host, CoherenceState::Authoritative);
        coherence
            .projected
            .insert(DeviceLoc::Host, CoherenceState::Authoritative);
        let inner = BufferInner {
            coherence,
            hazards: HazardIndex::default(),
            finalized: false,
        };
        let state = BufferState {
            id: BufferId::new(),
            extent,
            elem_size,
            inner: Mutex::new(inner),
        };
        Self {
            state: Arc::new(state),
        }
    }

    #[inline]
    pub fn id(&self) -> BufferId {
        self.state.id
    }

    #[inline]
    pub fn extent(&self) -> usize {
        self.state.extent
    }

    #[inline]
    pub fn elem_size(&self) -> usize {
        self.state.elem_size
    }

    #[inline]
    pub fn data_size(&self) -> usize {
        self.state.extent * self.state.elem_size
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BufferInner> {
        self.state.inner.lock().expect("failed to lock")
    }

    pub fn is_finalized(&self) -> bool {
        self.lock().finalized
    }

    /// Marks the handle destroyed; later accessor creation fails.
    pub(crate) fn finalize(&self) {
        self.lock().finalized = true;
    }

    pub fn state_of(&self, loc: DeviceLoc) -> CoherenceState {
        self.lock()
            .coherence
            .entries
            .get(&loc)
            .copied()
            .unwrap_or(CoherenceState::Invalid)
    }

    pub fn generation(&self) -> u64 {
        self.lock().coherence.generation
    }

    /// The location holding the authoritative copy right now.
    pub fn authoritative(&self) -> Option<DeviceLoc> {
        authoritative(&self.lock().coherence.entries)
    }

    /// Whether `loc` holds a valid copy right now.
    pub fn valid_at(&self, loc: DeviceLoc) -> bool {
        is_valid(&self.lock().coherence.entries, loc)
    }

    /// Computes hazard edges and migration needs for a new operation `node`
    /// accessing this buffer with `mode` on `loc`, and updates the hazard
    /// index accordingly. Edge computation and index update happen in one
    /// critical section, so hazard resolution is totally ordered under
    /// concurrent submission.
    pub(crate) fn plan_access(
        &self,
        node: NodeId,
        mode: AccessMode,
        loc: DeviceLoc,
        migration: impl FnOnce() -> NodeId,
    ) -> Result<AccessPlan, BufferError> {
        let mut inner = self.lock();
        if inner.finalized {
            return Err(BufferError::Finalized(self.id()));
        }

        let mut plan = AccessPlan::default();

        // a discarding write never needs a prior valid copy
        let needs_valid = matches!(mode, AccessMode::ReadOnly | AccessMode::ReadWrite);
        if needs_valid {
            if let Some(&pending) = inner.coherence.pending.get(&loc) {
                // ride the copy already in flight
                push_unique(&mut plan.deps, pending);
            } else if !is_valid(&inner.coherence.projected, loc) {
                let from = authoritative(&inner.coherence.projected)
                    .ok_or(BufferError::NoAuthoritative(self.id()))?;
                let id = migration();
                // a migration reads the buffer for hazard purposes
                let deps = inner.hazards.last_writer.into_iter().collect();
                inner.hazards.readers.push(id);
                inner.coherence.plan_copy(loc, id);
                push_unique(&mut plan.deps, id);
                plan.migration = Some(MigrationPlan {
                    node: id,
                    from,
                    deps,
                });
            }
        }

        match mode {
            AccessMode::ReadOnly => {
                if let Some(writer) = inner.hazards.last_writer {
                    push_unique(&mut plan.deps, writer);
                }
                inner.hazards.readers.push(node);
            }
            AccessMode::WriteOnly | AccessMode::ReadWrite => {
                if let Some(writer) = inner.hazards.last_writer {
                    push_unique(&mut plan.deps, writer);
                }
                for reader in inner.hazards.readers.drain(..) {
                    if reader != node && !plan.deps.contains(&reader) {
                        plan.deps.push(reader);
                    }
                }
                inner.hazards.last_writer = Some(node);
                inner.coherence.plan_write(loc);
            }
        }
        Ok(plan)
    }

    /// Applies a retired operation's effect to the coherence table.
    pub(crate) fn mark_retired(&self, node: NodeId, mode: AccessMode, loc: DeviceLoc) {
        let mut inner = self.lock();
        inner.hazards.readers.retain(|&reader| reader != node);
        match mode {
            AccessMode::ReadOnly => {}
            AccessMode::WriteOnly | AccessMode::ReadWrite => {
                debug_assert!(
                    matches!(mode, AccessMode::WriteOnly) || is_valid(&inner.coherence.entries, loc),
                    "a read-write op must have been preceded by a migration"
                );
                inner.coherence.record_write(loc);
                if inner.hazards.last_writer == Some(node) {
                    // a re-targeted write may retire on a different device
                    // than planned; re-project unless a later write claimed
                    // the projection since
                    if authoritative(&inner.coherence.projected) != Some(loc) {
                        inner.coherence.plan_write(loc);
                    }
                    // later operations take no edge to a retired writer
                    inner.hazards.last_writer = None;
                }
            }
        }
    }

    /// Applies a retired migration: the destination now holds a valid copy.
    pub(crate) fn mark_copied(&self, node: NodeId, to: DeviceLoc) {
        let mut inner = self.lock();
        inner.hazards.readers.retain(|&reader| reader != node);
        if inner.coherence.pending.get(&to) == Some(&node) {
            inner.coherence.pending.remove(&to);
        }
        inner.coherence.record_copy(to);
    }

    /// Removes a node that will never retire from the hazard index, leaving
    /// the coherence table untouched. Used for failed readers, whose target
    /// copies are still intact.
    pub(crate) fn forget(&self, node: NodeId) {
        let mut inner = self.lock();
        inner.hazards.readers.retain(|&reader| reader != node);
        if inner.hazards.last_writer == Some(node) {
            inner.hazards.last_writer = None;
        }
    }

    /// Drops the copy a failed writer may have clobbered. The authoritative
    /// copy is left untouched.
    pub(crate) fn invalidate(&self, node: NodeId, loc: DeviceLoc) {
        let mut inner = self.lock();
        inner.hazards.readers.retain(|&reader| reader != node);
        if inner.coherence.pending.get(&loc) == Some(&node) {
            inner.coherence.pending.remove(&loc);
        }
        if inner.coherence.entries.get(&loc) != Some(&CoherenceState::Authoritative) {
            inner.coherence.entries.remove(&loc);
        }
        if inner.coherence.projected.get(&loc) != Some(&CoherenceState::Authoritative) {
            inner.coherence.projected.remove(&loc);
        }
        // roll the projection back to the surviving copies, so operations
        // planned after the failure source real data rather than the write
        // that never happened
        if inner.hazards.last_writer == Some(node) {
            inner.hazards.last_writer = None;
            inner.coherence.projected = inner.coherence.entries.clone();
            inner.coherence.pending.clear();
        }
    }
}

impl std::fmt::Display for Buffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "buffer {} ({}x{} bytes)",
            self.id(),
            self.extent(),
            self.elem_size()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::{Buffer, CoherenceState};
    use crate::{
        access::AccessMode,
        device::{DeviceId, DeviceLoc},
        graph::NodeId,
    };

    fn device() -> DeviceLoc {
        DeviceLoc::Device(DeviceId::new())
    }

    #[test]
    fn test_declare() {
        let buffer = Buffer::new(4, 4);
        assert_eq!(buffer.data_size(), 16);
        assert_eq!(buffer.state_of(DeviceLoc::Host), CoherenceState::Authoritative);
        assert_eq!(buffer.authoritative(), Some(DeviceLoc::Host));
        assert_eq!(buffer.generation(), 0);
    }

    #[test]
    fn test_raw_war_waw() {
        let buffer = Buffer::new(4, 4);
        let d1 = device();

        let w1 = NodeId::new();
        let plan = buffer
            .plan_access(w1, AccessMode::WriteOnly, d1, NodeId::new)
            .expect("plan");
        // a discarding write needs neither a migration nor prior readers
        assert!(plan.deps.is_empty());
        assert!(plan.migration.is_none());

        // read-after-write
        let r1 = NodeId::new();
        let plan = buffer
            .plan_access(r1, AccessMode::ReadOnly, d1, NodeId::new)
            .expect("plan");
        assert_eq!(plan.deps, vec![w1]);

        let r2 = NodeId::new();
        let plan = buffer
            .plan_access(r2, AccessMode::ReadOnly, d1, NodeId::new)
            .expect("plan");
        // read-after-read adds no edge between the two readers
        assert_eq!(plan.deps, vec![w1]);

        // write-after-read depends on the last writer and all readers since
        let w2 = NodeId::new();
        let plan = buffer
            .plan_access(w2, AccessMode::WriteOnly, d1, NodeId::new)
            .expect("plan");
        assert_eq!(plan.deps, vec![w1, r1, r2]);

        // write-after-write
        let w3 = NodeId::new();
        let plan = buffer
            .plan_access(w3, AccessMode::WriteOnly, d1, NodeId::new)
            .expect("plan");
        assert_eq!(plan.deps, vec![w2]);
    }

    #[test]
    fn test_migration_synthesis() {
        let buffer = Buffer::new(4, 4);
        let d1 = device();

        // read-write on a device without a valid copy synthesizes exactly one
        // migration sourced from the authoritative location
        let w = NodeId::new();
        let plan = buffer
            .plan_access(w, AccessMode::ReadWrite, d1, NodeId::new)
            .expect("plan");
        let migration = plan.migration.expect("migration");
        assert_eq!(migration.from, DeviceLoc::Host);
        assert_eq!(plan.deps, vec![migration.node]);

        buffer.mark_copied(migration.node, d1);
        assert_eq!(buffer.state_of(d1), CoherenceState::Valid);
        assert_eq!(buffer.authoritative(), Some(DeviceLoc::Host));

        buffer.mark_retired(w, AccessMode::ReadWrite, d1);
        assert_eq!(buffer.state_of(d1), CoherenceState::Authoritative);
        assert_eq!(buffer.state_of(DeviceLoc::Host), CoherenceState::Invalid);
        assert_eq!(buffer.generation(), 1);
    }

    #[test]
    fn test_retired_writer_leaves_index() {
        let buffer = Buffer::new(4, 4);
        let d1 = device();

        let w = NodeId::new();
        buffer
            .plan_access(w, AccessMode::WriteOnly, d1, NodeId::new)
            .expect("plan");
        buffer.mark_retired(w, AccessMode::WriteOnly, d1);

        // a read planned after the writer retired takes no edge to it
        let r = NodeId::new();
        let plan = buffer
            .plan_access(r, AccessMode::ReadOnly, d1, NodeId::new)
            .expect("plan");
        assert!(plan.deps.is_empty());
        assert!(plan.migration.is_none());
    }

    #[test]
    fn test_forgotten_reader_dropped() {
        let buffer = Buffer::new(4, 4);
        let d1 = device();

        let r = NodeId::new();
        buffer
            .plan_access(r, AccessMode::ReadOnly, DeviceLoc::Host, NodeId::new)
            .expect("plan");
        buffer.forget(r);

        // a reader that will never retire must not order a later write
        let w = NodeId::new();
        let plan = buffer
            .plan_access(w, AccessMode::WriteOnly, d1, NodeId::new)
            .expect("plan");
        assert!(plan.deps.is_empty());
    }

    #[test]
    fn test_pending_migration_reused() {
        let buffer = Buffer::new(4, 4);
        let d1 = device();

        let r1 = NodeId::new();
        let plan = buffer
            .plan_access(r1, AccessMode::ReadOnly, d1, NodeId::new)
            .expect("plan");
        let migration = plan.migration.expect("migration");

        // a second read on the same stale location rides the copy in flight
        let r2 = NodeId::new();
        let plan = buffer
            .plan_access(r2, AccessMode::ReadOnly, d1, NodeId::new)
            .expect("plan");
        assert!(plan.migration.is_none());
        assert_eq!(plan.deps, vec![migration.node]);
    }

    #[test]
    fn test_finalized() {
        let buffer = Buffer::new(4, 4);
        buffer.finalize();
        let result = buffer.plan_access(NodeId::new(), AccessMode::ReadOnly, DeviceLoc::Host, NodeId::new);
        assert!(result.is_err());
    }
}
