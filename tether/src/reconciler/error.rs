use snafu::Snafu;

use crate::{
    binding::{BindingKey, ParseError},
    store::StoreError,
};

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    #[snafu(display("Service {service} has a malformed target workload annotation, error: {source}"))]
    ParseTargetWorkloads { service: BindingKey, source: ParseError },

    #[snafu(display("Failed to resolve namespaces visible from {namespace}, error: {source}"))]
    ResolveNamespaces { namespace: String, source: StoreError },

    #[snafu(display("Failed to get deployment {deployment}, error: {source}"))]
    GetDeployment { deployment: BindingKey, source: StoreError },

    #[snafu(display("Failed to list deployments in namespace {namespace}, error: {source}"))]
    ListDeployments { namespace: String, source: StoreError },

    #[snafu(display("Failed to list pods of deployment {deployment}, error: {source}"))]
    ListPods { deployment: BindingKey, source: StoreError },

    #[snafu(display("Failed to update labels of pod {pod}, error: {source}"))]
    UpdatePod { pod: BindingKey, source: StoreError },

    #[snafu(display("Failed to list services in namespace {namespace}, error: {source}"))]
    ListServices { namespace: String, source: StoreError },

    #[snafu(display("Failed to get service {service}, error: {source}"))]
    GetService { service: BindingKey, source: StoreError },
}
