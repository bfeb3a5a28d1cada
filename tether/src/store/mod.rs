//! Access to cluster objects for the reconcilers.
//!
//! Reads are served from the local watch cache and are synchronous; writes go
//! to the API server, which rejects stale writes through `resourceVersion`.
//! Retrying a rejected write is left to the controller's error policy.

mod cache;
mod error;
#[cfg(test)]
pub mod memory;

use std::{collections::BTreeSet, sync::Arc};

use futures::future::BoxFuture;

pub use self::{
    cache::{KubeStore, ProjectNamespaces},
    error::StoreError,
};
use crate::binding::Selector;

/// Cached reads and optimistic writes for one kind of namespaced object.
pub trait ObjectStore<K>: Send + Sync {
    /// Objects in `namespace` whose labels satisfy `selector`.
    ///
    /// # Errors
    ///
    /// Returns an error if the backing store cannot be read.
    fn list(&self, namespace: &str, selector: &Selector) -> Result<Vec<Arc<K>>, StoreError>;

    /// The object named `name` in `namespace`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] if no such object exists.
    fn get(&self, namespace: &str, name: &str) -> Result<Arc<K>, StoreError>;

    /// Writes `object` back, returning the stored version.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] if the object was deleted,
    /// [`StoreError::Conflict`] if it changed since it was read, or another
    /// [`StoreError`] if the API server rejected the write.
    fn update(&self, object: K) -> BoxFuture<'_, Result<K, StoreError>>;
}

/// Decides which namespaces a service may bind workloads from.
pub trait NamespaceScope: Send + Sync {
    /// Namespaces visible to objects in `namespace`, `namespace` included.
    ///
    /// # Errors
    ///
    /// Returns an error if the namespace cache cannot be read.
    fn visible_namespaces(&self, namespace: &str) -> Result<BTreeSet<String>, StoreError>;
}
