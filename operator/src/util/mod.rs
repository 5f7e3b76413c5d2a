use std::time::Duration;

#[cfg(feature = "metrics")]
pub mod metrics;
pub mod patch;

pub(crate) mod colors;

mod error;

pub use error::*;

/// Requeue delay while cluster mutations settle or a workload comes up.
pub(crate) const REQUEUE_DELAY: Duration = Duration::from_secs(10);

/// The default interval for requeuing a settled resource.
pub(crate) const PROBE_INTERVAL: Duration = Duration::from_secs(30);

/// Name of the kubernetes resource manager.
pub(crate) const MANAGER_NAME: &str = "snaprestore-operator";

/// Owner identity every restore-target StatefulSet must carry.
pub(crate) const ELASTICSEARCH_KIND: &str = "Elasticsearch";
pub(crate) const ELASTICSEARCH_API_VERSION: &str = "elasticsearch.k8s.elastic.co/v1";

/// ECK derives the StatefulSet name from the cluster and node-set names.
pub fn workload_name(es_name: &str, node_name: &str) -> String {
    format!("{es_name}-es-{node_name}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn workload_name_follows_eck_convention() {
        assert_eq!(workload_name("es", "restore-abc"), "es-es-restore-abc");
    }
}
