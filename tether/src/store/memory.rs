//! In-memory stand-ins for the cluster used by reconciler tests.

use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
};

use futures::{FutureExt, future::BoxFuture};
use kube::{Resource, ResourceExt};
use parking_lot::Mutex;

use super::{NamespaceScope, ObjectStore, StoreError};
use crate::binding::{BindingKey, Selector};

#[derive(Debug)]
struct State<K> {
    objects: BTreeMap<BindingKey, K>,
    writes: Vec<BindingKey>,
    conflicts: BTreeSet<BindingKey>,
}

/// Object store backed by a map, recording every successful write.
#[derive(Debug)]
pub struct MemoryStore<K> {
    kind: &'static str,
    state: Mutex<State<K>>,
}

impl<K> MemoryStore<K>
where
    K: Resource + Clone,
{
    pub fn new(kind: &'static str) -> Self {
        Self {
            kind,
            state: Mutex::new(State {
                objects: BTreeMap::new(),
                writes: Vec::new(),
                conflicts: BTreeSet::new(),
            }),
        }
    }

    pub fn with_objects(kind: &'static str, objects: impl IntoIterator<Item = K>) -> Self {
        let store = Self::new(kind);
        for object in objects {
            store.insert(object);
        }
        store
    }

    /// Adds or replaces an object without recording a write.
    pub fn insert(&self, object: K) {
        let _unused = self.state.lock().objects.insert(BindingKey::of(&object), object);
    }

    pub fn remove(&self, key: &BindingKey) {
        let _unused = self.state.lock().objects.remove(key);
    }

    /// Makes the next write of `key` fail with a conflict.
    pub fn fail_next_update(&self, key: BindingKey) {
        let _unused = self.state.lock().conflicts.insert(key);
    }

    pub fn object(&self, key: &BindingKey) -> Option<K> {
        self.state.lock().objects.get(key).cloned()
    }

    /// Keys written through [`ObjectStore::update`], in order.
    pub fn writes(&self) -> Vec<BindingKey> { self.state.lock().writes.clone() }
}

impl<K> ObjectStore<K> for MemoryStore<K>
where
    K: Resource + Clone + Send + Sync + 'static,
{
    fn list(&self, namespace: &str, selector: &Selector) -> Result<Vec<Arc<K>>, StoreError> {
        Ok(self
            .state
            .lock()
            .objects
            .iter()
            .filter(|(key, object)| {
                key.namespace == namespace && selector.matches(object.meta().labels.as_ref())
            })
            .map(|(_, object)| Arc::new(object.clone()))
            .collect())
    }

    fn get(&self, namespace: &str, name: &str) -> Result<Arc<K>, StoreError> {
        let key = BindingKey::new(namespace, name);
        self.state
            .lock()
            .objects
            .get(&key)
            .cloned()
            .map(Arc::new)
            .ok_or(StoreError::NotFound { kind: self.kind, key })
    }

    fn update(&self, object: K) -> BoxFuture<'_, Result<K, StoreError>> {
        let result = {
            let mut state = self.state.lock();
            let key = BindingKey::of(&object);
            if state.conflicts.remove(&key) {
                Err(StoreError::Conflict { kind: self.kind, key })
            } else if state.objects.contains_key(&key) {
                let _unused = state.objects.insert(key.clone(), object.clone());
                state.writes.push(key);
                Ok(object)
            } else {
                Err(StoreError::NotFound { kind: self.kind, key })
            }
        };
        futures::future::ready(result).boxed()
    }
}

/// Namespace scope with a fixed visibility set, identical for every
/// namespace apart from the namespace itself.
#[derive(Debug, Default)]
pub struct StaticNamespaces(pub BTreeSet<String>);

impl NamespaceScope for StaticNamespaces {
    fn visible_namespaces(&self, namespace: &str) -> Result<BTreeSet<String>, StoreError> {
        let mut visible = self.0.clone();
        let _unused = visible.insert(namespace.to_string());
        Ok(visible)
    }
}

/// Builds a namespaced object of kind `K` from its metadata.
pub fn named<K>(namespace: &str, name: &str, labels: &[(&str, &str)]) -> K
where
    K: Resource + Default,
{
    let mut object = K::default();
    let meta = object.meta_mut();
    meta.namespace = Some(namespace.to_string());
    meta.name = Some(name.to_string());
    if !labels.is_empty() {
        meta.labels = Some(
            labels.iter().map(|(key, value)| ((*key).to_string(), (*value).to_string())).collect(),
        );
    }
    object
}

/// Sets a deletion timestamp on `object`, as the API server does once a
/// delete has been requested.
pub fn mark_terminating<K>(object: &mut K)
where
    K: Resource,
{
    object.meta_mut().deletion_timestamp = Some(
        serde_json::from_value(serde_json::json!("2024-01-01T00:00:00Z"))
            .expect("valid timestamp"),
    );
}

/// Labels of `object`, empty when unset.
pub fn labels_of<K>(object: &K) -> BTreeMap<String, String>
where
    K: Resource,
{
    object.labels().clone()
}
