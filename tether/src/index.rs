//! Process-local index of the workloads each service binds to.
//!
//! The service reconciler records, per service, the set of deployments its
//! target annotation resolved to. The pod reconciler asks the reverse
//! question: which services target a given deployment. Both directions are
//! kept under one lock so readers never observe a forward entry without its
//! reverse edges.

use std::collections::{BTreeSet, HashMap};

use parking_lot::RwLock;

use crate::binding::BindingKey;

#[derive(Debug, Default)]
struct Edges {
    /// service -> deployments it targets
    forward: HashMap<BindingKey, BTreeSet<BindingKey>>,

    /// deployment -> services targeting it
    reverse: HashMap<BindingKey, BTreeSet<BindingKey>>,
}

impl Edges {
    fn unlink(&mut self, service: &BindingKey, deployments: &BTreeSet<BindingKey>) {
        for deployment in deployments {
            if let Some(services) = self.reverse.get_mut(deployment) {
                let _unused = services.remove(service);
                if services.is_empty() {
                    let _unused = self.reverse.remove(deployment);
                }
            }
        }
    }
}

/// Shared `service -> deployments` index with an incrementally maintained
/// reverse map.
///
/// The index is empty after a restart and is rebuilt as the initial watch
/// replays every service through the reconciler.
#[derive(Debug, Default)]
pub struct WorkloadIndex {
    edges: RwLock<Edges>,
}

impl WorkloadIndex {
    pub fn new() -> Self { Self::default() }

    /// Replaces the deployments targeted by `service`.
    ///
    /// The previous set is discarded, not merged.
    pub fn put(&self, service: BindingKey, deployments: BTreeSet<BindingKey>) {
        let mut edges = self.edges.write();
        if let Some(previous) = edges.forward.remove(&service) {
            edges.unlink(&service, &previous);
        }
        for deployment in &deployments {
            let _unused =
                edges.reverse.entry(deployment.clone()).or_default().insert(service.clone());
        }
        let _unused = edges.forward.insert(service, deployments);
    }

    /// Drops the entry of `service`, returning `true` if one existed.
    pub fn delete(&self, service: &BindingKey) -> bool {
        let mut edges = self.edges.write();
        let Some(previous) = edges.forward.remove(service) else {
            return false;
        };
        edges.unlink(service, &previous);
        true
    }

    /// Services whose current entry contains `deployment`.
    pub fn find_services_targeting(&self, deployment: &BindingKey) -> BTreeSet<BindingKey> {
        self.edges.read().reverse.get(deployment).cloned().unwrap_or_default()
    }

    /// Deployments currently recorded for `service`.
    pub fn deployments_of(&self, service: &BindingKey) -> Option<BTreeSet<BindingKey>> {
        self.edges.read().forward.get(service).cloned()
    }

    /// Number of services with an entry.
    pub fn service_count(&self) -> usize { self.edges.read().forward.len() }
}
