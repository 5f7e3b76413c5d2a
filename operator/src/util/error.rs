#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Kubernetes reported error: {source}")]
    Kube {
        #[from]
        source: kube::Error,
    },

    #[error("Invalid user input: {0}")]
    UserInput(String),

    #[error("Json error: {source}")]
    Json {
        #[from]
        source: serde_json::Error,
    },

    #[error("Invalid storage quantity: {0}")]
    Quantity(String),

    #[error("Elasticsearch {name} not found in namespace {namespace}")]
    ElasticsearchNotFound { namespace: String, name: String },

    #[error("StatefulSet {0} is not owned by an Elasticsearch resource")]
    OwnershipMismatch(String),

    #[error("Task store error: {0}")]
    Store(#[source] anyhow::Error),

    #[error("Elasticsearch request failed: {0}")]
    Elastic(#[source] anyhow::Error),
}
