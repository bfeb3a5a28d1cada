//! Reconciliation logic keeping services, their target workloads and pods
//! labelled consistently.
//!
//! - [`WorkloadServiceReconciler`] applies a service's synthetic selector
//!   label to the pods of the deployments the service targets and records the
//!   binding in the [`WorkloadIndex`](crate::index::WorkloadIndex).
//! - [`PodBackfillReconciler`] labels pods that appear after a binding was
//!   recorded.
//! - [`EndpointTriggerReconciler`] selects the DNS-record services to
//!   reconcile again when the endpoints they depend on change.
//!
//! Reconcilers re-read current state on every call and never retry
//! internally; a returned error is retried by the controller with backoff.
//! Labels are only ever added, never removed.

mod endpoint_trigger;
mod error;
mod pod_backfill;
mod workload_service;

pub use self::{
    endpoint_trigger::{EndpointEvent, EndpointTriggerReconciler},
    error::Error,
    pod_backfill::PodBackfillReconciler,
    workload_service::WorkloadServiceReconciler,
};

fn is_terminating<K>(object: &K) -> bool
where
    K: kube::Resource,
{
    object.meta().deletion_timestamp.is_some()
}
