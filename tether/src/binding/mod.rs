//! Identities and annotation lists that tie services to workloads.
//!
//! A [`BindingKey`] is the `namespace:name` identity of a namespaced object.
//! Bindings between services, deployments and endpoints are declared as
//! comma-separated lists of such keys in annotations.

mod selector;

use std::{fmt, str::FromStr};

use kube::{Resource, ResourceExt};
use snafu::Snafu;
use tether_base::consts::k8s::labels;

pub use self::selector::Selector;

/// `namespace:name` identity of a namespaced object.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BindingKey {
    pub namespace: String,

    pub name: String,
}

impl BindingKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self { namespace: namespace.into(), name: name.into() }
    }

    /// Builds the key of a namespaced object.
    ///
    /// Objects without a namespace get an empty namespace component.
    pub fn of<K>(object: &K) -> Self
    where
        K: Resource,
    {
        Self::new(object.namespace().unwrap_or_default(), object.name_any())
    }
}

impl fmt::Display for BindingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.namespace, self.name)
    }
}

impl FromStr for BindingKey {
    type Err = ParseError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let token = input.trim();
        let mut parts = token.split(':');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(namespace), Some(name), None) if !namespace.is_empty() && !name.is_empty() => {
                Ok(Self::new(namespace, name))
            }
            _ => InvalidFormatSnafu { token }.fail(),
        }
    }
}

/// Parses a comma-separated list of `namespace:name` tokens.
///
/// Whitespace around tokens is ignored and empty tokens are skipped. The first
/// malformed token fails the whole list, so callers never act on a prefix of
/// a broken annotation.
///
/// # Errors
///
/// Returns [`ParseError::InvalidFormat`] naming the first token that does not
/// contain exactly one `:` between a non-empty namespace and name.
pub fn parse_binding_list(value: &str) -> Result<Vec<BindingKey>, ParseError> {
    value
        .split(',')
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .map(BindingKey::from_str)
        .collect()
}

/// Key of the synthetic selector label a service uses to select the pods of
/// the workloads it targets.
///
/// The key depends on the service name only, so reconciling the same service
/// always yields the same label.
pub fn synthetic_label_key(service_name: &str) -> String {
    format!("{}_{service_name}", labels::WORKLOAD_ID_PREFIX)
}

#[derive(Debug, Snafu, PartialEq, Eq)]
#[snafu(visibility(pub))]
pub enum ParseError {
    #[snafu(display("Invalid binding '{token}': expected 'NAMESPACE:NAME'"))]
    InvalidFormat { token: String },
}
