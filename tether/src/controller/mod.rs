//! Runs one `kube` runtime controller per reconciled kind.
//!
//! Services, pods and endpoints each drive a controller fed by their own
//! reflector. Deletions reach a controller as reconciliations of objects that
//! are no longer cached, which is where the service index and the endpoint
//! tombstones are cleaned up. Deployments and namespaces are only cached.
//! A successful reconciliation is scheduled again after the resync interval;
//! a failed one is retried with per-object exponential backoff.
// `Endpoints` is deprecated upstream in favour of `EndpointSlice`; the
// reverse DNS annotations are still published on it.
#![allow(deprecated)]

mod error;
mod retry;
mod tracker;

use std::{fmt::Debug, sync::Arc, time::Duration};

use futures::{StreamExt, TryStreamExt, channel::mpsc};
use k8s_openapi::api::{
    apps::v1::Deployment,
    core::v1::{Endpoints, Namespace, Pod, Service},
};
use kube::{
    Api, Resource,
    runtime::{
        self, WatchStreamExt,
        controller::{self, Action},
        reflector::{self, ObjectRef, Store, store::Writer},
        watcher,
    },
};
use serde::de::DeserializeOwned;
use sigfinn::{ExitStatus, LifecycleManager, Shutdown};

pub use self::{error::Error, retry::Backoff};
use self::{
    retry::Retries,
    tracker::{Observed, Tracker},
};
use crate::{
    binding::BindingKey,
    config::Config,
    index::WorkloadIndex,
    reconciler::{
        EndpointEvent, EndpointTriggerReconciler, PodBackfillReconciler,
        WorkloadServiceReconciler,
    },
    store::{KubeStore, NamespaceScope, ObjectStore, ProjectNamespaces},
};

/// Watches time out before the client read timeout so idle watches are
/// restarted cleanly.
const WATCH_TIMEOUT_SECS: u32 = 25;

fn watcher_config() -> watcher::Config { watcher::Config::default().timeout(WATCH_TIMEOUT_SECS) }

/// Reflector caches of every kind the reconcilers read.
#[derive(Clone)]
struct Caches {
    services: Store<Service>,
    pods: Store<Pod>,
    endpoints: Store<Endpoints>,
    deployments: Store<Deployment>,
    namespaces: Store<Namespace>,
}

impl Caches {
    async fn wait_until_ready(&self) -> Result<(), Error> {
        let _unused = futures::try_join!(
            wait_until_ready(&self.services),
            wait_until_ready(&self.pods),
            wait_until_ready(&self.endpoints),
            wait_until_ready(&self.deployments),
            wait_until_ready(&self.namespaces),
        )?;
        Ok(())
    }
}

async fn wait_until_ready<K>(store: &Store<K>) -> Result<(), Error>
where
    K: Resource<DynamicType = ()> + k8s_openapi::Resource + Clone + 'static,
{
    store
        .wait_until_ready()
        .await
        .map_err(|_| Error::CacheClosed { kind: <K as k8s_openapi::Resource>::KIND })
}

/// Object access handed to the reconcilers.
struct Stores {
    services: Arc<dyn ObjectStore<Service>>,
    pods: Arc<dyn ObjectStore<Pod>>,
    deployments: Arc<dyn ObjectStore<Deployment>>,
    namespaces: Arc<dyn NamespaceScope>,
}

impl Stores {
    fn new(caches: &Caches, client: &kube::Client) -> Self {
        Self {
            services: Arc::new(KubeStore::new(caches.services.clone(), client.clone())),
            pods: Arc::new(KubeStore::new(caches.pods.clone(), client.clone())),
            deployments: Arc::new(KubeStore::new(caches.deployments.clone(), client.clone())),
            namespaces: Arc::new(ProjectNamespaces::new(caches.namespaces.clone())),
        }
    }
}

/// State shared by the reconciliations of all controllers.
struct Context {
    services: Arc<dyn ObjectStore<Service>>,
    index: Arc<WorkloadIndex>,
    workload_service: WorkloadServiceReconciler,
    pod_backfill: PodBackfillReconciler,
    endpoint_trigger: EndpointTriggerReconciler,
    endpoint_tracker: Tracker<Endpoints>,
    service_triggers: mpsc::UnboundedSender<ObjectRef<Service>>,
    retries: Retries,
    resync_interval: Duration,
}

impl Context {
    fn new(
        stores: Stores,
        index: Arc<WorkloadIndex>,
        service_triggers: mpsc::UnboundedSender<ObjectRef<Service>>,
        settings: &Settings,
    ) -> Self {
        let Stores { services, pods, deployments, namespaces } = stores;
        Self {
            workload_service: WorkloadServiceReconciler::new(
                Arc::clone(&pods),
                Arc::clone(&deployments),
                namespaces,
                Arc::clone(&index),
            ),
            pod_backfill: PodBackfillReconciler::new(
                pods,
                deployments,
                Arc::clone(&services),
                Arc::clone(&index),
            ),
            endpoint_trigger: EndpointTriggerReconciler::new(Arc::clone(&services)),
            endpoint_tracker: Tracker::default(),
            services,
            index,
            service_triggers,
            retries: Retries::new(settings.backoff),
            resync_interval: settings.resync_interval,
        }
    }

    async fn sync_service(&self, service: &Service) -> Result<Action, Error> {
        let key = BindingKey::of(service);
        if let Some(updated) = self.workload_service.reconcile(service).await? {
            match self.services.update(updated).await {
                Ok(_) => {
                    tracing::info!(service = %key, "Added workload selector label to service");
                }
                Err(err) if err.is_not_found() => {
                    tracing::debug!(service = %key, "Service was deleted before its selector was saved");
                }
                Err(source) => return Err(Error::UpdateService { service: key, source }),
            }
        }
        Ok(self.settled::<Service>(&key))
    }

    fn service_removed(&self, key: &BindingKey) {
        self.workload_service.remove(key);
        tracing::debug!(service = %key, bound_services = self.index.service_count(), "Service removed");
    }

    async fn sync_pod(&self, pod: &Pod) -> Result<Action, Error> {
        let key = BindingKey::of(pod);
        if self.pod_backfill.reconcile(pod).await? {
            tracing::debug!(pod = %key, "Backfilled workload labels");
        }
        Ok(self.settled::<Pod>(&key))
    }

    fn record_endpoints_deletion(&self, endpoints: &Endpoints) {
        self.endpoint_tracker.record_deletion(BindingKey::of(endpoints), Arc::new(endpoints.clone()));
    }

    /// Triggers the services depending on the endpoints at `key`, given the
    /// endpoints' cached state.
    fn sync_endpoints(
        &self,
        key: &BindingKey,
        current: Option<Arc<Endpoints>>,
    ) -> Result<Action, Error> {
        let changes = match self.endpoint_tracker.observe(key, current) {
            Observed::Present { object, first_seen: true } => vec![(object, EndpointEvent::Created)],
            Observed::Present { object, first_seen: false } => vec![(object, EndpointEvent::Updated)],
            Observed::Replaced { previous, object } => {
                vec![(previous, EndpointEvent::Removed), (object, EndpointEvent::Created)]
            }
            Observed::Removed(object) => vec![(object, EndpointEvent::Removed)],
            Observed::Gone => Vec::new(),
        };

        for (endpoints, event) in changes {
            let triggered = self.endpoint_trigger.reconcile(&endpoints, event)?;
            for service in &triggered {
                self.trigger_service(service);
            }
            if !triggered.is_empty() {
                tracing::debug!(
                    endpoints = %key,
                    ?event,
                    services = triggered.len(),
                    "Triggered services depending on endpoints"
                );
            }
        }
        Ok(self.settled::<Endpoints>(key))
    }

    fn endpoints_removed(&self, key: &BindingKey) {
        if let Err(err) = self.sync_endpoints(key, None) {
            tracing::warn!(endpoints = %key, "Failed to handle removed endpoints, error: {err}");
        }
    }

    fn trigger_service(&self, key: &BindingKey) {
        let object_ref = ObjectRef::new(&key.name).within(&key.namespace);
        if self.service_triggers.unbounded_send(object_ref).is_err() {
            tracing::debug!(service = %key, "Service controller stopped, dropping trigger");
        }
    }

    /// Clears the failure count of a reconciled object and schedules its
    /// resync.
    fn settled<K>(&self, key: &BindingKey) -> Action
    where
        K: k8s_openapi::Resource,
    {
        self.retries.forget(K::KIND, key);
        Action::requeue(self.resync_interval)
    }
}

#[allow(clippy::needless_pass_by_value)]
fn error_policy<K>(object: Arc<K>, error: &Error, context: Arc<Context>) -> Action
where
    K: Resource + k8s_openapi::Resource,
{
    let kind = <K as k8s_openapi::Resource>::KIND;
    let key = BindingKey::of(&*object);
    let delay = context.retries.failed(kind, key.clone());
    tracing::warn!(
        kind,
        object = %key,
        retry_in = ?delay,
        "Reconciliation failed, error: {error}"
    );
    Action::requeue(delay)
}

/// Logs the outcome of one reconciliation and returns the key of an object
/// that was scheduled but is no longer cached.
fn removed_object<K>(
    kind: &'static str,
    result: Result<(ObjectRef<K>, Action), controller::Error<Error, watcher::Error>>,
) -> Option<BindingKey>
where
    K: Resource,
{
    match result {
        Ok((object, action)) => {
            tracing::trace!(kind, %object, ?action, "Reconciled");
            None
        }
        Err(controller::Error::ObjectNotFound(object)) => {
            Some(BindingKey::new(object.namespace.unwrap_or_default(), object.name))
        }
        Err(controller::Error::ReconcilerFailed(_, object)) => {
            tracing::trace!(kind, %object, "Reconciliation scheduled for retry");
            None
        }
        Err(err) => {
            tracing::warn!(kind, "{err}");
            None
        }
    }
}

/// Runs `controller` until `shutdown_signal` fires.
///
/// `on_removed` is called for every object found deleted, after its failure
/// count was cleared.
async fn drive<K, ReconcileFn, Fut, RemovedFn>(
    controller: runtime::Controller<K>,
    workers: u16,
    shutdown_signal: Shutdown,
    reconcile: ReconcileFn,
    context: &Arc<Context>,
    on_removed: RemovedFn,
) where
    K: Resource<DynamicType = ()>
        + k8s_openapi::Resource
        + Clone
        + Debug
        + DeserializeOwned
        + Send
        + Sync
        + 'static,
    ReconcileFn: FnMut(Arc<K>, Arc<Context>) -> Fut + Send + 'static,
    Fut: Future<Output = Result<Action, Error>> + Send + 'static,
    RemovedFn: Fn(&Context, &BindingKey) + Send + Sync,
{
    let kind = <K as k8s_openapi::Resource>::KIND;
    tracing::info!(kind, workers, "Starting controller");
    controller
        .with_config(controller::Config::default().concurrency(workers))
        .graceful_shutdown_on(shutdown_signal)
        .run(reconcile, error_policy::<K>, Arc::clone(context))
        .for_each(|result| {
            if let Some(key) = removed_object(kind, result) {
                context.retries.forget(kind, &key);
                on_removed(context, &key);
            }
            futures::future::ready(())
        })
        .await;
    tracing::info!(kind, "Controller stopped");
}

/// Keeps the cache behind `writer` in sync with the cluster.
fn spawn_cache<K>(lifecycle_manager: &LifecycleManager<Error>, api: Api<K>, writer: Writer<K>)
where
    K: Resource<DynamicType = ()>
        + k8s_openapi::Resource
        + Clone
        + Debug
        + DeserializeOwned
        + Send
        + Sync
        + 'static,
{
    let kind = <K as k8s_openapi::Resource>::KIND;
    let _handle = lifecycle_manager.spawn(format!("{kind} cache"), move |shutdown_signal| async move {
        reflector::reflector(writer, watcher(api, watcher_config()).default_backoff())
            .take_until(shutdown_signal)
            .for_each(|event| {
                if let Err(err) = event {
                    tracing::warn!(kind, "Watch stream failed, error: {err}");
                }
                futures::future::ready(())
            })
            .await;
        tracing::debug!(kind, "Cache stopped");
        ExitStatus::Success
    });
}

/// Tuning knobs of a [`Controller`].
#[derive(Clone, Copy, Debug)]
pub struct Settings {
    pub resync_interval: Duration,

    pub service_workers: u16,

    pub pod_workers: u16,

    pub endpoint_workers: u16,

    pub backoff: Backoff,
}

impl From<&Config> for Settings {
    fn from(config: &Config) -> Self {
        Self {
            resync_interval: config.resync_interval,
            service_workers: config.workers.services,
            pod_workers: config.workers.pods,
            endpoint_workers: config.workers.endpoints,
            backoff: config.retry.backoff(),
        }
    }
}

pub struct Controller {
    client: kube::Client,
    settings: Settings,
}

impl Controller {
    pub fn new(client: kube::Client, config: &Config) -> Self {
        Self { client, settings: Settings::from(config) }
    }

    /// Runs the controllers until a termination signal arrives.
    ///
    /// # Errors
    ///
    /// Returns an error if a controller task fails.
    pub async fn serve(self) -> Result<(), Error> {
        let Self { client, settings } = self;
        let lifecycle_manager = LifecycleManager::<Error>::new();

        let (services, services_writer) = reflector::store::<Service>();
        let (pods, pods_writer) = reflector::store::<Pod>();
        let (endpoints, endpoints_writer) = reflector::store::<Endpoints>();
        let (deployments, deployments_writer) = reflector::store::<Deployment>();
        let (namespaces, namespaces_writer) = reflector::store::<Namespace>();
        let caches = Caches { services, pods, endpoints, deployments, namespaces };

        let (service_triggers, triggered_services) = mpsc::unbounded();
        let context = Arc::new(Context::new(
            Stores::new(&caches, &client),
            Arc::new(WorkloadIndex::new()),
            service_triggers,
            &settings,
        ));

        spawn_cache(&lifecycle_manager, Api::<Deployment>::all(client.clone()), deployments_writer);
        spawn_cache(&lifecycle_manager, Api::<Namespace>::all(client.clone()), namespaces_writer);

        let _handle = lifecycle_manager.spawn("Service controller", {
            let (client, caches, context) = (client.clone(), caches.clone(), Arc::clone(&context));
            move |shutdown_signal| async move {
                let events = reflector::reflector(
                    services_writer,
                    watcher(Api::all(client), watcher_config()).default_backoff(),
                );
                let controller = runtime::Controller::for_stream(
                    events.touched_objects(),
                    caches.services.clone(),
                )
                .reconcile_on(triggered_services);
                let reconcile = move |service: Arc<Service>, context: Arc<Context>| {
                    let caches = caches.clone();
                    async move {
                        caches.wait_until_ready().await?;
                        context.sync_service(&service).await
                    }
                };
                drive(
                    controller,
                    settings.service_workers,
                    shutdown_signal,
                    reconcile,
                    &context,
                    Context::service_removed,
                )
                .await;
                ExitStatus::Success
            }
        });

        let _handle = lifecycle_manager.spawn("Pod controller", {
            let (client, caches, context) = (client.clone(), caches.clone(), Arc::clone(&context));
            move |shutdown_signal| async move {
                let events = reflector::reflector(
                    pods_writer,
                    watcher(Api::all(client), watcher_config()).default_backoff(),
                );
                let controller =
                    runtime::Controller::for_stream(events.touched_objects(), caches.pods.clone());
                let reconcile = move |pod: Arc<Pod>, context: Arc<Context>| {
                    let caches = caches.clone();
                    async move {
                        caches.wait_until_ready().await?;
                        context.sync_pod(&pod).await
                    }
                };
                drive(
                    controller,
                    settings.pod_workers,
                    shutdown_signal,
                    reconcile,
                    &context,
                    |_: &Context, _: &BindingKey| {},
                )
                .await;
                ExitStatus::Success
            }
        });

        let _handle =
            lifecycle_manager.spawn("Endpoints controller", move |shutdown_signal| async move {
                let events = reflector::reflector(
                    endpoints_writer,
                    watcher(Api::all(client), watcher_config()).default_backoff(),
                )
                .inspect_ok({
                    let context = Arc::clone(&context);
                    move |event| {
                        if let watcher::Event::Delete(endpoints) = event {
                            context.record_endpoints_deletion(endpoints);
                        }
                    }
                });
                let controller = runtime::Controller::for_stream(
                    events.touched_objects(),
                    caches.endpoints.clone(),
                );
                let reconcile = move |endpoints: Arc<Endpoints>, context: Arc<Context>| {
                    let caches = caches.clone();
                    async move {
                        caches.wait_until_ready().await?;
                        context.sync_endpoints(&BindingKey::of(&*endpoints), Some(endpoints))
                    }
                };
                drive(
                    controller,
                    settings.endpoint_workers,
                    shutdown_signal,
                    reconcile,
                    &context,
                    Context::endpoints_removed,
                )
                .await;
                ExitStatus::Success
            });

        tracing::info!(
            resync_interval = ?settings.resync_interval,
            service_workers = settings.service_workers,
            pod_workers = settings.pod_workers,
            endpoint_workers = settings.endpoint_workers,
            "Controller started"
        );

        if let Ok(Err(err)) = lifecycle_manager.serve().await {
            tracing::error!("{err}");
            return Err(err);
        }
        tracing::info!("Controller stopped");
        Ok(())
    }
}
