use snafu::Snafu;

use crate::binding::BindingKey;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum StoreError {
    #[snafu(display("{kind} {key} is not found"))]
    NotFound { kind: &'static str, key: BindingKey },

    #[snafu(display("{kind} {key} has been modified since it was read"))]
    Conflict { kind: &'static str, key: BindingKey },

    #[snafu(display("Failed to update {kind} {key}, error: {source}"))]
    Update {
        kind: &'static str,
        key: BindingKey,
        #[snafu(source(from(kube::Error, Box::new)))]
        source: Box<kube::Error>,
    },
}

impl StoreError {
    /// Classifies an API server error returned for `key`.
    pub fn from_api(kind: &'static str, key: BindingKey, source: kube::Error) -> Self {
        match &source {
            kube::Error::Api(response) if response.code == 404 => Self::NotFound { kind, key },
            kube::Error::Api(response) if response.code == 409 => Self::Conflict { kind, key },
            _ => Self::Update { kind, key, source: Box::new(source) },
        }
    }

    pub const fn is_not_found(&self) -> bool { matches!(self, Self::NotFound { .. }) }
}
