//! Finds the DNS-record services to reconcile when the endpoints they resolve
//! change.
// core/v1 `Endpoints` is superseded upstream by `EndpointSlice`; DNS-record
// services still publish their dependencies against it.
#![allow(deprecated)]

use std::{collections::BTreeSet, sync::Arc};

use k8s_openapi::api::core::v1::{Endpoints, Service};
use kube::ResourceExt;
use snafu::ResultExt;
use tether_base::consts::k8s::annotations;

use super::{Error, error};
use crate::{
    binding::{BindingKey, Selector},
    store::ObjectStore,
};

/// How an endpoints object changed since this process last saw it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EndpointEvent {
    Created,
    Updated,
    Removed,
}

/// Only selects services to trigger; never writes to the cluster.
pub struct EndpointTriggerReconciler {
    services: Arc<dyn ObjectStore<Service>>,
}

impl EndpointTriggerReconciler {
    pub fn new(services: Arc<dyn ObjectStore<Service>>) -> Self { Self { services } }

    /// Returns the keys of every existing service that depends on
    /// `endpoints`.
    ///
    /// A new endpoints object is matched against the forward DNS annotation
    /// of every service in its namespace; otherwise the endpoints' own reverse
    /// annotation names the services directly.
    ///
    /// # Errors
    ///
    /// Fails if services cannot be listed or read for a reason other than
    /// absence.
    pub fn reconcile(
        &self,
        endpoints: &Endpoints,
        event: EndpointEvent,
    ) -> Result<BTreeSet<BindingKey>, Error> {
        let endpoints_key = BindingKey::of(endpoints);
        let candidates = match event {
            EndpointEvent::Created => self.services_referencing(&endpoints_key)?,
            EndpointEvent::Updated | EndpointEvent::Removed => {
                Self::services_referenced_by(&endpoints_key, endpoints)
            }
        };

        let mut triggered = BTreeSet::new();
        for service_key in candidates {
            match self.services.get(&service_key.namespace, &service_key.name) {
                Ok(_) => {
                    tracing::info!(
                        endpoints = %endpoints_key,
                        service = %service_key,
                        ?event,
                        "Triggering reconciliation of DNS record service"
                    );
                    let _unused = triggered.insert(service_key);
                }
                Err(err) if err.is_not_found() => {
                    tracing::info!(endpoints = %endpoints_key, "DNS record {err}, skipping");
                }
                Err(source) => return Err(Error::GetService { service: service_key, source }),
            }
        }
        Ok(triggered)
    }

    /// Services in the endpoints' namespace whose forward DNS annotation
    /// lists `endpoints_key`.
    fn services_referencing(
        &self,
        endpoints_key: &BindingKey,
    ) -> Result<BTreeSet<BindingKey>, Error> {
        let services = self
            .services
            .list(&endpoints_key.namespace, &Selector::default())
            .context(error::ListServicesSnafu { namespace: endpoints_key.namespace.clone() })?;

        Ok(services
            .iter()
            .filter_map(|service| {
                let records = service.annotations().get(annotations::DNS_RECORD_FORWARD.as_str())?;
                let service_key = BindingKey::of(&**service);
                let references =
                    parse_records(records, &service_key).any(|record| &record == endpoints_key);
                references.then_some(service_key)
            })
            .collect())
    }

    /// Services named by the reverse DNS annotation of `endpoints`.
    fn services_referenced_by(
        endpoints_key: &BindingKey,
        endpoints: &Endpoints,
    ) -> BTreeSet<BindingKey> {
        endpoints
            .annotations()
            .get(annotations::DNS_RECORD_REVERSE.as_str())
            .map(|records| parse_records(records, endpoints_key).collect())
            .unwrap_or_default()
    }
}

/// Parses a comma-separated DNS record annotation of `owner`, logging and
/// skipping malformed tokens.
fn parse_records<'a>(
    records: &'a str,
    owner: &'a BindingKey,
) -> impl Iterator<Item = BindingKey> + 'a {
    records.split(',').map(str::trim).filter(|record| !record.is_empty()).filter_map(
        move |record| match record.parse::<BindingKey>() {
            Ok(key) => Some(key),
            Err(err) => {
                tracing::warn!(object = %owner, "Malformed DNS record: {err}, skipping");
                None
            }
        },
    )
}
