use std::{collections::BTreeSet, fmt::Debug, sync::Arc};

use futures::{FutureExt, future::BoxFuture};
use k8s_openapi::{NamespaceResourceScope, api::core::v1::Namespace};
use kube::{
    Api, Resource, ResourceExt,
    api::PostParams,
    runtime::reflector::{ObjectRef, Store},
};
use serde::{Serialize, de::DeserializeOwned};
use tether_base::consts::k8s::annotations;

use super::{NamespaceScope, ObjectStore, StoreError};
use crate::binding::{BindingKey, Selector};

/// [`ObjectStore`] reading from a reflector cache and writing through the
/// API server.
pub struct KubeStore<K>
where
    K: Resource<DynamicType = ()> + 'static,
{
    cache: Store<K>,
    client: kube::Client,
}

impl<K> KubeStore<K>
where
    K: Resource<DynamicType = ()> + 'static,
{
    pub const fn new(cache: Store<K>, client: kube::Client) -> Self { Self { cache, client } }
}

impl<K> ObjectStore<K> for KubeStore<K>
where
    K: Resource<DynamicType = (), Scope = NamespaceResourceScope>
        + k8s_openapi::Resource
        + Clone
        + Debug
        + DeserializeOwned
        + Serialize
        + Send
        + Sync
        + 'static,
{
    fn list(&self, namespace: &str, selector: &Selector) -> Result<Vec<Arc<K>>, StoreError> {
        Ok(self
            .cache
            .state()
            .into_iter()
            .filter(|object| object.namespace().as_deref() == Some(namespace))
            .filter(|object| selector.matches(object.meta().labels.as_ref()))
            .collect())
    }

    fn get(&self, namespace: &str, name: &str) -> Result<Arc<K>, StoreError> {
        self.cache.get(&ObjectRef::new(name).within(namespace)).ok_or_else(|| {
            StoreError::NotFound {
                kind: <K as k8s_openapi::Resource>::KIND,
                key: BindingKey::new(namespace, name),
            }
        })
    }

    fn update(&self, object: K) -> BoxFuture<'_, Result<K, StoreError>> {
        async move {
            let key = BindingKey::of(&object);
            let api = Api::<K>::namespaced(self.client.clone(), &key.namespace);
            api.replace(&key.name, &PostParams::default(), &object)
                .await
                .map_err(|source| {
                    StoreError::from_api(<K as k8s_openapi::Resource>::KIND, key, source)
                })
        }
        .boxed()
    }
}

/// Namespace visibility derived from project membership.
///
/// Namespaces carrying the same project-id annotation see each other; a
/// namespace outside any project, or not cached yet, sees only itself.
pub struct ProjectNamespaces {
    cache: Store<Namespace>,
}

impl ProjectNamespaces {
    pub const fn new(cache: Store<Namespace>) -> Self { Self { cache } }
}

impl NamespaceScope for ProjectNamespaces {
    fn visible_namespaces(&self, namespace: &str) -> Result<BTreeSet<String>, StoreError> {
        let project_id = self
            .cache
            .get(&ObjectRef::new(namespace))
            .and_then(|object| object.annotations().get(annotations::PROJECT_ID.as_str()).cloned());

        let mut visible = BTreeSet::from([namespace.to_string()]);
        if let Some(project_id) = project_id {
            visible.extend(
                self.cache
                    .state()
                    .iter()
                    .filter(|object| {
                        object.annotations().get(annotations::PROJECT_ID.as_str())
                            == Some(&project_id)
                    })
                    .map(|object| object.name_any()),
            );
        }
        Ok(visible)
    }
}
