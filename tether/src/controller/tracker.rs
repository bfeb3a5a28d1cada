use std::sync::Arc;

use dashmap::{DashMap, DashSet};

use crate::binding::BindingKey;

/// What a reconciliation finds for a key.
#[derive(Debug)]
pub enum Observed<K> {
    /// The object exists; `first_seen` is set the first time this process
    /// handles the key, and again after each deletion.
    Present { object: Arc<K>, first_seen: bool },

    /// The object was deleted and created again before the deletion was
    /// handled.
    Replaced { previous: Arc<K>, object: Arc<K> },

    /// The object was deleted; carries its last known state.
    Removed(Arc<K>),

    /// The object is absent and its final state is unknown.
    Gone,
}

/// Turns level-triggered lookups into create, update and delete
/// observations.
///
/// Watch delete events leave a tombstone so the reconciliation handling the
/// key can still read the deleted object.
#[derive(Debug)]
pub struct Tracker<K> {
    seen: DashSet<BindingKey>,
    tombstones: DashMap<BindingKey, Arc<K>>,
}

impl<K> Default for Tracker<K> {
    fn default() -> Self { Self { seen: DashSet::new(), tombstones: DashMap::new() } }
}

impl<K> Tracker<K> {
    pub fn record_deletion(&self, key: BindingKey, object: Arc<K>) {
        let _unused = self.seen.remove(&key);
        let _unused = self.tombstones.insert(key, object);
    }

    /// Classifies `current`, the cached state of `key`.
    pub fn observe(&self, key: &BindingKey, current: Option<Arc<K>>) -> Observed<K> {
        let previous = self.tombstones.remove(key).map(|(_, object)| object);
        match (current, previous) {
            (Some(object), Some(previous)) => {
                let _unused = self.seen.insert(key.clone());
                Observed::Replaced { previous, object }
            }
            (Some(object), None) => {
                let first_seen = self.seen.insert(key.clone());
                Observed::Present { object, first_seen }
            }
            (None, previous) => {
                let _unused = self.seen.remove(key);
                previous.map_or(Observed::Gone, Observed::Removed)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use k8s_openapi::api::core::v1::Service;

    use super::*;
    use crate::store::memory::named;

    fn service() -> Arc<Service> { Arc::new(named("ns1", "svc-a", &[])) }

    #[test]
    fn test_observe_distinguishes_first_sighting_updates_and_removal() {
        let key: BindingKey = "ns1:svc-a".parse().expect("valid key");
        let tracker = Tracker::default();

        assert!(matches!(
            tracker.observe(&key, Some(service())),
            Observed::Present { first_seen: true, .. }
        ));
        assert!(matches!(
            tracker.observe(&key, Some(service())),
            Observed::Present { first_seen: false, .. }
        ));

        tracker.record_deletion(key.clone(), service());
        assert!(matches!(tracker.observe(&key, None), Observed::Removed(_)));
        assert!(matches!(tracker.observe(&key, None), Observed::Gone));
    }

    #[test]
    fn test_recreated_object_is_seen_again_as_new() {
        let key: BindingKey = "ns1:svc-a".parse().expect("valid key");
        let tracker = Tracker::default();
        let _unused = tracker.observe(&key, Some(service()));

        assert!(matches!(tracker.observe(&key, None), Observed::Gone));
        assert!(matches!(
            tracker.observe(&key, Some(service())),
            Observed::Present { first_seen: true, .. }
        ));
    }

    #[test]
    fn test_deletion_followed_by_recreation_reports_both() {
        let key: BindingKey = "ns1:svc-a".parse().expect("valid key");
        let tracker = Tracker::default();
        let _unused = tracker.observe(&key, Some(service()));

        tracker.record_deletion(key.clone(), service());
        assert!(matches!(tracker.observe(&key, Some(service())), Observed::Replaced { .. }));
        assert!(matches!(
            tracker.observe(&key, Some(service())),
            Observed::Present { first_seen: false, .. }
        ));
    }

    #[test]
    fn test_deletion_clears_first_sighting() {
        let key: BindingKey = "ns1:svc-a".parse().expect("valid key");
        let tracker = Tracker::default();
        let _unused = tracker.observe(&key, Some(service()));

        tracker.record_deletion(key.clone(), service());
        assert!(matches!(tracker.observe(&key, None), Observed::Removed(_)));
        assert!(matches!(
            tracker.observe(&key, Some(service())),
            Observed::Present { first_seen: true, .. }
        ));
    }
}
