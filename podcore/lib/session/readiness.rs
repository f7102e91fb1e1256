use std::collections::HashSet;

use tracing::warn;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The kinds of resources whose provisioning gates pod start.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    /// A container being created by the image collaborator.
    Container,

    /// A volume being prepared by the storage collaborator.
    Volume,

    /// A block device being inserted through the monitor.
    BlockDev,

    /// A network link being allocated and inserted.
    Network,
}

/// Tracks which resource instances are pending per kind, and exposes
/// "all clear" to unblock pod start.
///
/// Invariant: a resource id appears in exactly one of "adding" or "finished"
/// for its kind at any time, never both.
#[derive(Debug, Default)]
pub struct ReadinessTracker {
    /// Resources whose provisioning is in flight.
    adding: KindSets,

    /// Resources whose removal is in flight.
    deleting: KindSets,

    /// Resources whose provisioning has completed.
    finished: KindSets,
}

/// One set of resource ids per resource kind.
#[derive(Debug, Default)]
struct KindSets {
    containers: HashSet<String>,
    volumes: HashSet<String>,
    blockdevs: HashSet<String>,
    networks: HashSet<String>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl KindSets {
    fn set(&mut self, kind: ResourceKind) -> &mut HashSet<String> {
        match kind {
            ResourceKind::Container => &mut self.containers,
            ResourceKind::Volume => &mut self.volumes,
            ResourceKind::BlockDev => &mut self.blockdevs,
            ResourceKind::Network => &mut self.networks,
        }
    }

    fn is_empty(&self) -> bool {
        self.containers.is_empty()
            && self.volumes.is_empty()
            && self.blockdevs.is_empty()
            && self.networks.is_empty()
    }
}

impl ReadinessTracker {
    /// Creates an empty tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records that a resource's provisioning has started.
    ///
    /// A resource that already finished is not re-added; that would break the
    /// adding/finished exclusivity invariant.
    pub fn start_adding(&mut self, kind: ResourceKind, id: impl Into<String>) {
        let id = id.into();
        if self.finished.set(kind).contains(&id) {
            warn!(?kind, id = %id, "resource already finished, not re-adding");
            return;
        }
        self.adding.set(kind).insert(id);
    }

    /// Records that a resource's removal has started.
    pub fn start_deleting(&mut self, kind: ResourceKind, id: impl Into<String>) {
        let id = id.into();
        self.finished.set(kind).remove(&id);
        self.deleting.set(kind).insert(id);
    }

    /// Moves a resource from "adding" to "finished" for its kind.
    pub fn finish(&mut self, kind: ResourceKind, id: &str) {
        if !self.adding.set(kind).remove(id) {
            warn!(?kind, id = %id, "finishing a resource that was not pending");
        }
        self.finished.set(kind).insert(id.to_string());
    }

    /// Records that a resource's removal has completed.
    pub fn finish_deleting(&mut self, kind: ResourceKind, id: &str) {
        self.deleting.set(kind).remove(id);
    }

    /// Returns whether a resource is currently pending.
    pub fn is_adding(&mut self, kind: ResourceKind, id: &str) -> bool {
        self.adding.set(kind).contains(id)
    }

    /// Returns whether "adding" is empty across all kinds, i.e. every
    /// provisioning operation for the current phase has completed.
    pub fn all_clear(&self) -> bool {
        self.adding.is_empty()
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_in_exactly_one_of_adding_or_finished() {
        let mut tracker = ReadinessTracker::new();
        tracker.start_adding(ResourceKind::Container, "c-1");
        assert!(tracker.is_adding(ResourceKind::Container, "c-1"));

        tracker.finish(ResourceKind::Container, "c-1");
        assert!(!tracker.is_adding(ResourceKind::Container, "c-1"));

        // Re-adding a finished resource is refused.
        tracker.start_adding(ResourceKind::Container, "c-1");
        assert!(!tracker.is_adding(ResourceKind::Container, "c-1"));
    }

    #[test]
    fn test_all_clear_flips_when_last_resource_finishes() {
        let mut tracker = ReadinessTracker::new();
        assert!(tracker.all_clear());

        tracker.start_adding(ResourceKind::Container, "c-1");
        tracker.start_adding(ResourceKind::Network, "net-0");
        assert!(!tracker.all_clear());

        tracker.finish(ResourceKind::Container, "c-1");
        assert!(!tracker.all_clear());

        tracker.finish(ResourceKind::Network, "net-0");
        assert!(tracker.all_clear());
    }

    #[test]
    fn test_kinds_are_tracked_independently() {
        let mut tracker = ReadinessTracker::new();
        tracker.start_adding(ResourceKind::Volume, "data");
        tracker.start_adding(ResourceKind::BlockDev, "data");

        tracker.finish(ResourceKind::Volume, "data");
        assert!(!tracker.all_clear());
        assert!(tracker.is_adding(ResourceKind::BlockDev, "data"));

        tracker.finish(ResourceKind::BlockDev, "data");
        assert!(tracker.all_clear());
    }
}
