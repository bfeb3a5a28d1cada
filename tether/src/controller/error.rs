use snafu::Snafu;

use crate::{binding::BindingKey, store::StoreError};

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    #[snafu(display("{source}"))]
    Reconcile { source: crate::reconciler::Error },

    #[snafu(display("Failed to persist selector of service {service}, error: {source}"))]
    UpdateService { service: BindingKey, source: StoreError },

    #[snafu(display("Watch cache of {kind} was closed before it became ready"))]
    CacheClosed { kind: &'static str },
}

impl From<crate::reconciler::Error> for Error {
    fn from(source: crate::reconciler::Error) -> Self { Self::Reconcile { source } }
}
