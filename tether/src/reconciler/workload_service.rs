use std::{collections::BTreeSet, sync::Arc};

use k8s_openapi::api::{
    apps::v1::Deployment,
    core::v1::{Pod, Service},
};
use kube::ResourceExt;
use snafu::ResultExt;
use tether_base::consts::k8s::{annotations, labels};

use super::{Error, error, is_terminating};
use crate::{
    binding::{self, BindingKey, Selector},
    index::WorkloadIndex,
    store::{NamespaceScope, ObjectStore},
};

/// Binds services to the deployments named in their target workload
/// annotation.
pub struct WorkloadServiceReconciler {
    pods: Arc<dyn ObjectStore<Pod>>,
    deployments: Arc<dyn ObjectStore<Deployment>>,
    namespaces: Arc<dyn NamespaceScope>,
    index: Arc<WorkloadIndex>,
}

impl WorkloadServiceReconciler {
    pub fn new(
        pods: Arc<dyn ObjectStore<Pod>>,
        deployments: Arc<dyn ObjectStore<Deployment>>,
        namespaces: Arc<dyn NamespaceScope>,
        index: Arc<WorkloadIndex>,
    ) -> Self {
        Self { pods, deployments, namespaces, index }
    }

    /// Reconciles a created or updated service.
    ///
    /// Returns the service with the synthetic selector label added when its
    /// selector lacked it; the caller must persist that object.
    ///
    /// # Errors
    ///
    /// Fails without touching any pod if the annotation is malformed, and
    /// fails mid-way if listing or updating pods fails. Unknown namespaces and
    /// missing or terminating deployments are logged and skipped.
    pub async fn reconcile(&self, service: &Service) -> Result<Option<Service>, Error> {
        let service_key = BindingKey::of(service);
        let Some(value) = service.annotations().get(annotations::TARGET_WORKLOAD_IDS.as_str())
        else {
            if self.index.delete(&service_key) {
                tracing::info!(
                    service = %service_key,
                    "Target workload annotation removed, workload binding dropped"
                );
            }
            return Ok(None);
        };
        let targets = binding::parse_binding_list(value)
            .context(error::ParseTargetWorkloadsSnafu { service: service_key.clone() })?;

        let mut service = service.clone();
        let selector_changed = {
            let label = binding::synthetic_label_key(&service_key.name);
            let selector =
                service.spec.get_or_insert_default().selector.get_or_insert_default();
            if selector.get(&label).map(String::as_str) == Some(labels::WORKLOAD_ID_VALUE) {
                false
            } else {
                let _unused = selector.insert(label, labels::WORKLOAD_ID_VALUE.to_string());
                true
            }
        };
        let selector = Selector::of_service(&service);

        let visible_namespaces = self
            .namespaces
            .visible_namespaces(&service_key.namespace)
            .context(error::ResolveNamespacesSnafu { namespace: service_key.namespace.clone() })?;

        let mut resolved = BTreeSet::new();
        for target in targets {
            if !visible_namespaces.contains(&target.namespace) {
                tracing::warn!(
                    service = %service_key,
                    workload = %target,
                    "Namespace {} is not visible to the service, skipping",
                    target.namespace
                );
                continue;
            }

            let deployment = match self.deployments.get(&target.namespace, &target.name) {
                Ok(deployment) => deployment,
                Err(err) if err.is_not_found() => {
                    tracing::warn!(service = %service_key, workload = %target, "{err}, skipping");
                    continue;
                }
                Err(source) => {
                    return Err(Error::GetDeployment { deployment: target, source });
                }
            };
            if is_terminating(&*deployment) {
                tracing::warn!(
                    service = %service_key,
                    workload = %target,
                    "Deployment is being removed, skipping"
                );
                continue;
            }

            let Some(deployment_selector) = Selector::of_deployment(&deployment) else {
                tracing::warn!(
                    service = %service_key,
                    workload = %target,
                    "Deployment selector has no equality labels or uses expressions, skipping"
                );
                continue;
            };
            self.label_pods(&service_key, &target, &deployment_selector, &selector).await?;
            let _unused = resolved.insert(target);
        }

        if self.index.deployments_of(&service_key).as_ref() != Some(&resolved) {
            tracing::info!(
                service = %service_key,
                workloads = ?resolved.iter().map(ToString::to_string).collect::<Vec<_>>(),
                "Service workload binding changed"
            );
        }
        self.index.put(service_key, resolved);

        Ok(selector_changed.then_some(service))
    }

    /// Forgets the binding of a deleted service.
    ///
    /// Labels already applied to pods are left in place.
    pub fn remove(&self, service_key: &BindingKey) {
        if self.index.delete(service_key) {
            tracing::info!(service = %service_key, "Service removed, workload binding dropped");
        }
    }

    /// Adds the service selector to every live pod of `deployment` lacking
    /// part of it.
    async fn label_pods(
        &self,
        service_key: &BindingKey,
        deployment: &BindingKey,
        deployment_selector: &Selector,
        service_selector: &Selector,
    ) -> Result<(), Error> {
        let pods = self
            .pods
            .list(&deployment.namespace, deployment_selector)
            .context(error::ListPodsSnafu { deployment: deployment.clone() })?;

        for pod in pods {
            if is_terminating(&*pod) {
                continue;
            }
            let missing = service_selector.missing_from(pod.metadata.labels.as_ref());
            if missing.is_empty() {
                continue;
            }

            let pod_key = BindingKey::of(&*pod);
            let mut pod = Pod::clone(&pod);
            pod.labels_mut().extend(missing);
            match self.pods.update(pod).await {
                Ok(_) => {
                    tracing::info!(
                        service = %service_key,
                        workload = %deployment,
                        pod = %pod_key,
                        "Labelled pod with service selector"
                    );
                }
                Err(err) if err.is_not_found() => {
                    tracing::info!(pod = %pod_key, "{err}, skipping");
                }
                Err(source) => return Err(Error::UpdatePod { pod: pod_key, source }),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelectorRequirement;

    use super::*;
    use crate::{
        reconciler::PodBackfillReconciler,
        store::memory::{MemoryStore, StaticNamespaces, labels_of, mark_terminating, named},
    };

    struct Fixture {
        pods: Arc<MemoryStore<Pod>>,
        deployments: Arc<MemoryStore<Deployment>>,
        index: Arc<WorkloadIndex>,
        reconciler: WorkloadServiceReconciler,
    }

    impl Fixture {
        fn new(visible: &[&str]) -> Self {
            let pods = Arc::new(MemoryStore::new("Pod"));
            let deployments = Arc::new(MemoryStore::new("Deployment"));
            let index = Arc::new(WorkloadIndex::new());
            let namespaces = StaticNamespaces(visible.iter().map(ToString::to_string).collect());
            let reconciler = WorkloadServiceReconciler::new(
                pods.clone(),
                deployments.clone(),
                Arc::new(namespaces),
                index.clone(),
            );
            Self { pods, deployments, index, reconciler }
        }
    }

    fn key(value: &str) -> BindingKey { value.parse().expect("valid key") }

    fn service(namespace: &str, name: &str, targets: Option<&str>) -> Service {
        let mut service: Service = named(namespace, name, &[]);
        if let Some(targets) = targets {
            let _unused = service
                .annotations_mut()
                .insert(annotations::TARGET_WORKLOAD_IDS.to_string(), targets.to_string());
        }
        service
    }

    fn deployment(namespace: &str, name: &str, selector: &[(&str, &str)]) -> Deployment {
        let mut deployment: Deployment = named(namespace, name, &[]);
        deployment.spec.get_or_insert_default().selector.match_labels = Some(
            selector.iter().map(|(key, value)| ((*key).to_string(), (*value).to_string())).collect(),
        );
        deployment
    }

    fn expression_deployment(namespace: &str, name: &str, key: &str, values: &[&str]) -> Deployment {
        let mut deployment: Deployment = named(namespace, name, &[]);
        deployment.spec.get_or_insert_default().selector.match_expressions =
            Some(vec![LabelSelectorRequirement {
                key: key.to_string(),
                operator: "In".to_string(),
                values: Some(values.iter().map(ToString::to_string).collect()),
            }]);
        deployment
    }

    fn pod(namespace: &str, name: &str, labels: &[(&str, &str)]) -> Pod {
        named(namespace, name, labels)
    }

    fn selector_of(service: &Service) -> BTreeMap<String, String> {
        service.spec.as_ref().and_then(|spec| spec.selector.clone()).unwrap_or_default()
    }

    #[tokio::test]
    async fn test_binds_service_to_deployment_pods() {
        let fixture = Fixture::new(&[]);
        fixture.deployments.insert(deployment("ns1", "dep1", &[("app", "a")]));
        fixture.pods.insert(pod("ns1", "pod-a", &[("app", "a")]));
        fixture.pods.insert(pod("ns1", "pod-b", &[("app", "b")]));

        let updated = fixture
            .reconciler
            .reconcile(&service("ns1", "svc-a", Some("ns1:dep1")))
            .await
            .expect("reconcile succeeds")
            .expect("selector gains the synthetic label");

        assert_eq!(selector_of(&updated).get("workloadID_svc-a").map(String::as_str), Some("true"));
        let pod_a = fixture.pods.object(&key("ns1:pod-a")).expect("pod-a");
        assert_eq!(labels_of(&pod_a).get("workloadID_svc-a").map(String::as_str), Some("true"));
        assert_eq!(labels_of(&pod_a).get("app").map(String::as_str), Some("a"));
        let pod_b = fixture.pods.object(&key("ns1:pod-b")).expect("pod-b");
        assert!(!labels_of(&pod_b).contains_key("workloadID_svc-a"));
        assert_eq!(
            fixture.index.deployments_of(&key("ns1:svc-a")),
            Some(BTreeSet::from([key("ns1:dep1")]))
        );
    }

    #[tokio::test]
    async fn test_second_reconcile_is_idempotent() {
        let fixture = Fixture::new(&[]);
        fixture.deployments.insert(deployment("ns1", "dep1", &[("app", "a")]));
        fixture.pods.insert(pod("ns1", "pod-a", &[("app", "a")]));

        let first = fixture
            .reconciler
            .reconcile(&service("ns1", "svc-a", Some("ns1:dep1")))
            .await
            .expect("first reconcile")
            .expect("selector updated");
        assert_eq!(fixture.pods.writes(), vec![key("ns1:pod-a")]);

        let second = fixture.reconciler.reconcile(&first).await.expect("second reconcile");
        assert!(second.is_none(), "selector already carries the synthetic label");
        assert_eq!(fixture.pods.writes(), vec![key("ns1:pod-a")], "no additional pod writes");
    }

    #[tokio::test]
    async fn test_service_without_annotation_is_ignored() {
        let fixture = Fixture::new(&[]);
        fixture.pods.insert(pod("ns1", "pod-a", &[("app", "a")]));

        let result =
            fixture.reconciler.reconcile(&service("ns1", "svc-a", None)).await.expect("no-op");

        assert!(result.is_none());
        assert!(fixture.pods.writes().is_empty());
        assert_eq!(fixture.index.service_count(), 0);
    }

    #[tokio::test]
    async fn test_removing_annotation_drops_binding() {
        let fixture = Fixture::new(&[]);
        fixture.deployments.insert(deployment("ns1", "dep1", &[("app", "a")]));
        let bound = fixture
            .reconciler
            .reconcile(&service("ns1", "svc-a", Some("ns1:dep1")))
            .await
            .expect("bind")
            .expect("selector updated");
        assert_eq!(fixture.index.service_count(), 1);

        let mut unannotated = bound;
        let _unused = unannotated.annotations_mut().remove(annotations::TARGET_WORKLOAD_IDS.as_str());
        let result = fixture.reconciler.reconcile(&unannotated).await.expect("unbind");

        assert!(result.is_none());
        assert_eq!(fixture.index.deployments_of(&key("ns1:svc-a")), None);
        assert!(fixture.index.find_services_targeting(&key("ns1:dep1")).is_empty());

        let services = Arc::new(MemoryStore::with_objects("Service", [unannotated]));
        let backfill = PodBackfillReconciler::new(
            fixture.pods.clone(),
            fixture.deployments.clone(),
            services,
            fixture.index.clone(),
        );
        let late = pod("ns1", "pod-late", &[("app", "a")]);
        fixture.pods.insert(late.clone());
        assert!(!backfill.reconcile(&late).await.expect("backfill succeeds"));
        assert!(fixture.pods.writes().is_empty());
    }

    #[tokio::test]
    async fn test_deployment_with_selector_expressions_is_skipped() {
        let fixture = Fixture::new(&[]);
        fixture.deployments.insert(expression_deployment("ns1", "dep1", "app", &["a"]));
        fixture.pods.insert(pod("ns1", "pod-a", &[("app", "a")]));
        fixture.pods.insert(pod("ns1", "unrelated-db", &[("app", "postgres")]));

        let _updated = fixture
            .reconciler
            .reconcile(&service("ns1", "svc-a", Some("ns1:dep1")))
            .await
            .expect("unresolvable deployments are not fatal");

        assert!(fixture.pods.writes().is_empty());
        assert_eq!(fixture.index.deployments_of(&key("ns1:svc-a")), Some(BTreeSet::new()));
    }

    #[tokio::test]
    async fn test_malformed_annotation_fails_without_labelling() {
        let fixture = Fixture::new(&[]);
        fixture.deployments.insert(deployment("ns1", "dep1", &[("app", "a")]));
        fixture.pods.insert(pod("ns1", "pod-a", &[("app", "a")]));

        let err = fixture
            .reconciler
            .reconcile(&service("ns1", "svc-a", Some("ns1:dep1,badtoken")))
            .await
            .unwrap_err();

        assert!(matches!(err, Error::ParseTargetWorkloads { .. }));
        assert!(fixture.pods.writes().is_empty());
        assert_eq!(fixture.index.deployments_of(&key("ns1:svc-a")), None);
    }

    #[tokio::test]
    async fn test_unresolvable_targets_are_skipped() {
        let fixture = Fixture::new(&["ns2"]);
        let mut terminating = deployment("ns1", "dep-gone", &[("app", "gone")]);
        mark_terminating(&mut terminating);
        fixture.deployments.insert(terminating);
        fixture.deployments.insert(deployment("ns2", "dep2", &[("app", "b")]));
        fixture.deployments.insert(deployment("ns3", "dep3", &[("app", "c")]));
        fixture.pods.insert(pod("ns1", "pod-gone", &[("app", "gone")]));
        fixture.pods.insert(pod("ns2", "pod-b", &[("app", "b")]));
        fixture.pods.insert(pod("ns3", "pod-c", &[("app", "c")]));

        let annotation = "ns1:missing, ns1:dep-gone, ns3:dep3, ns2:dep2";
        let _updated = fixture
            .reconciler
            .reconcile(&service("ns1", "svc-a", Some(annotation)))
            .await
            .expect("per-target failures are not fatal");

        assert_eq!(fixture.pods.writes(), vec![key("ns2:pod-b")]);
        assert_eq!(
            fixture.index.deployments_of(&key("ns1:svc-a")),
            Some(BTreeSet::from([key("ns2:dep2")]))
        );
    }

    #[tokio::test]
    async fn test_terminating_pods_are_not_labelled() {
        let fixture = Fixture::new(&[]);
        fixture.deployments.insert(deployment("ns1", "dep1", &[("app", "a")]));
        let mut leaving = pod("ns1", "pod-leaving", &[("app", "a")]);
        mark_terminating(&mut leaving);
        fixture.pods.insert(leaving);

        let _updated = fixture
            .reconciler
            .reconcile(&service("ns1", "svc-a", Some("ns1:dep1")))
            .await
            .expect("reconcile succeeds");

        assert!(fixture.pods.writes().is_empty());
    }

    #[tokio::test]
    async fn test_pod_update_conflict_is_surfaced() {
        let fixture = Fixture::new(&[]);
        fixture.deployments.insert(deployment("ns1", "dep1", &[("app", "a")]));
        fixture.pods.insert(pod("ns1", "pod-a", &[("app", "a")]));
        fixture.pods.fail_next_update(key("ns1:pod-a"));

        let err = fixture
            .reconciler
            .reconcile(&service("ns1", "svc-a", Some("ns1:dep1")))
            .await
            .unwrap_err();

        assert!(matches!(err, Error::UpdatePod { .. }));
        assert_eq!(fixture.index.deployments_of(&key("ns1:svc-a")), None);
    }

    #[tokio::test]
    async fn test_index_entry_is_replaced_and_removed() {
        let fixture = Fixture::new(&[]);
        fixture.deployments.insert(deployment("ns1", "dep1", &[("app", "a")]));
        fixture.deployments.insert(deployment("ns1", "dep2", &[("app", "b")]));
        fixture.pods.insert(pod("ns1", "pod-a", &[("app", "a")]));

        let _updated = fixture
            .reconciler
            .reconcile(&service("ns1", "svc-a", Some("ns1:dep1,ns1:dep2")))
            .await
            .expect("first reconcile");
        let _updated = fixture
            .reconciler
            .reconcile(&service("ns1", "svc-a", Some("ns1:dep2")))
            .await
            .expect("second reconcile");
        assert_eq!(
            fixture.index.deployments_of(&key("ns1:svc-a")),
            Some(BTreeSet::from([key("ns1:dep2")]))
        );

        fixture.reconciler.remove(&key("ns1:svc-a"));
        assert_eq!(fixture.index.deployments_of(&key("ns1:svc-a")), None);
        let pod_a = fixture.pods.object(&key("ns1:pod-a")).expect("pod-a");
        assert!(labels_of(&pod_a).contains_key("workloadID_svc-a"), "labels are append-only");
    }
}
