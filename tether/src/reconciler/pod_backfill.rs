use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
};

use k8s_openapi::api::{
    apps::v1::Deployment,
    core::v1::{Pod, Service},
};
use kube::ResourceExt;
use snafu::ResultExt;

use super::{Error, error, is_terminating};
use crate::{
    binding::{BindingKey, Selector},
    index::WorkloadIndex,
    store::ObjectStore,
};

/// Labels pods created after the services targeting their deployment were
/// bound.
pub struct PodBackfillReconciler {
    pods: Arc<dyn ObjectStore<Pod>>,
    deployments: Arc<dyn ObjectStore<Deployment>>,
    services: Arc<dyn ObjectStore<Service>>,
    index: Arc<WorkloadIndex>,
}

impl PodBackfillReconciler {
    pub fn new(
        pods: Arc<dyn ObjectStore<Pod>>,
        deployments: Arc<dyn ObjectStore<Deployment>>,
        services: Arc<dyn ObjectStore<Service>>,
        index: Arc<WorkloadIndex>,
    ) -> Self {
        Self { pods, deployments, services, index }
    }

    /// Adds the selectors of every service bound to one of the pod's
    /// deployments, writing the pod at most once.
    ///
    /// Returns `true` if the pod was written.
    ///
    /// # Errors
    ///
    /// Fails if the deployments cannot be listed, a service cannot be read
    /// for a reason other than absence, or the pod update is rejected.
    pub async fn reconcile(&self, pod: &Pod) -> Result<bool, Error> {
        if is_terminating(pod) {
            return Ok(false);
        }
        let pod_key = BindingKey::of(pod);
        let pod_labels = pod.metadata.labels.as_ref();

        let services = self
            .deployments
            .list(&pod_key.namespace, &Selector::default())
            .context(error::ListDeploymentsSnafu { namespace: pod_key.namespace.clone() })?
            .into_iter()
            .filter(|deployment| {
                Selector::of_deployment(deployment)
                    .is_some_and(|selector| selector.matches(pod_labels))
            })
            .flat_map(|deployment| {
                self.index.find_services_targeting(&BindingKey::of(&*deployment))
            })
            .collect::<BTreeSet<_>>();

        let mut missing = BTreeMap::new();
        for service_key in services {
            let service = match self.services.get(&service_key.namespace, &service_key.name) {
                Ok(service) => service,
                Err(err) if err.is_not_found() => {
                    tracing::debug!(pod = %pod_key, service = %service_key, "Stale binding, {err}");
                    continue;
                }
                Err(source) => return Err(Error::GetService { service: service_key, source }),
            };
            missing.extend(Selector::of_service(&service).missing_from(pod_labels));
        }
        if missing.is_empty() {
            return Ok(false);
        }

        let mut pod = pod.clone();
        let added = missing.keys().cloned().collect::<Vec<_>>();
        pod.labels_mut().extend(missing);
        match self.pods.update(pod).await {
            Ok(_) => {
                tracing::info!(pod = %pod_key, labels = ?added, "Backfilled service selector labels");
                Ok(true)
            }
            Err(err) if err.is_not_found() => {
                tracing::info!(pod = %pod_key, "{err}, skipping");
                Ok(false)
            }
            Err(source) => Err(Error::UpdatePod { pod: pod_key, source }),
        }
    }
}
