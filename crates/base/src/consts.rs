pub mod k8s {
    pub mod labels {
        /// Prefix of the synthetic selector label injected into services and
        /// the pods they target.
        pub const WORKLOAD_ID_PREFIX: &str = "workloadID";

        /// Value carried by every synthetic selector label.
        pub const WORKLOAD_ID_VALUE: &str = "true";
    }

    pub mod annotations {
        use std::sync::LazyLock;

        use crate::PROJECT_NAME;

        /// Service annotation listing the deployments (`ns:name,...`) the
        /// service binds to.
        pub static TARGET_WORKLOAD_IDS: LazyLock<String> =
            LazyLock::new(|| format!("{PROJECT_NAME}.io/target-workload-ids"));

        /// Service annotation listing the endpoints (`ns:name,...`) its DNS
        /// record depends on.
        pub static DNS_RECORD_FORWARD: LazyLock<String> =
            LazyLock::new(|| format!("{PROJECT_NAME}.io/dns-record-forward"));

        /// Endpoints annotation listing the services (`ns:name,...`) to notify
        /// when the endpoints change.
        pub static DNS_RECORD_REVERSE: LazyLock<String> =
            LazyLock::new(|| format!("{PROJECT_NAME}.io/dns-record-reverse"));

        /// Namespace annotation naming the project a namespace belongs to.
        pub static PROJECT_ID: LazyLock<String> =
            LazyLock::new(|| format!("{PROJECT_NAME}.io/project-id"));
    }
}
