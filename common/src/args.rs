use clap::Parser;

#[derive(Parser, Debug, Clone)]
pub struct PostgresArgs {
    #[arg(long, env = "POSTGRES_HOST", default_value = "localhost")]
    pub postgres_host: String,

    #[arg(long, env = "POSTGRES_PORT", default_value_t = 5432)]
    pub postgres_port: u16,

    #[arg(long, env = "POSTGRES_DATABASE", default_value = "postgres")]
    pub postgres_database: String,

    #[arg(long, env = "POSTGRES_USERNAME", default_value = "postgres")]
    pub postgres_username: String,

    #[arg(long, env = "POSTGRES_PASSWORD")]
    pub postgres_password: Option<String>,

    #[arg(long, env = "POSTGRES_CA_CERT")]
    pub postgres_ca_cert: Option<String>,

    #[arg(long, env = "POSTGRES_SSL_MODE", default_value = "prefer")]
    pub postgres_ssl_mode: String,
}

#[derive(Parser, Debug, Clone)]
pub struct ElasticArgs {
    /// Base URL of the Elasticsearch HTTP endpoint
    #[arg(long, env = "ES_URL", default_value = "https://localhost:9200")]
    pub es_url: String,

    #[arg(long, env = "ES_USERNAME", default_value = "elastic")]
    pub es_username: String,

    #[arg(long, env = "ES_PASSWORD")]
    pub es_password: Option<String>,

    /// Skip TLS certificate verification (self-signed ECK clusters)
    #[arg(
        long,
        env = "ES_SKIP_TLS_VERIFY",
        action = clap::ArgAction::Set,
        default_value_t = true
    )]
    pub es_skip_tls_verify: bool,
}

/// Restore orchestration knobs plus everything the node-set planner needs to
/// shape the isolated data nodes.
#[derive(Parser, Debug, Clone)]
pub struct RestoreArgs {
    /// Name of the Elasticsearch resource the restore nodes are added to
    #[arg(long, env = "ES_NAME", default_value = "es")]
    pub es_name: String,

    /// Node attribute key used to pin restored shards to restore nodes
    #[arg(long, env = "RESTORE_KEY", default_value = "restore")]
    pub restore_key: String,

    /// Replica count of each spawned restore node set
    #[arg(long, env = "RESTORE_COUNT", default_value_t = 2)]
    pub restore_count: i32,

    /// Per-task recovery deadline, minutes
    #[arg(long, env = "RESTORE_TIMEOUT_MINUTES", default_value_t = 60)]
    pub timeout: u64,

    /// Recovery poll period, seconds
    #[arg(long, env = "RESTORE_POLL_SECONDS", default_value_t = 30)]
    pub interval: u64,

    /// Maximum restores executing at once
    #[arg(long, env = "RESTORE_CONCURRENCY", default_value_t = 2)]
    pub concurrency: usize,

    /// Capacity of the pending task channel
    #[arg(long, env = "RESTORE_MAX_TASKS", default_value_t = 16)]
    pub max_tasks: usize,

    /// Catalog indexer period, seconds
    #[arg(long, env = "CATALOG_SYNC_SECONDS", default_value_t = 300)]
    pub catalog_sync_interval: u64,

    #[arg(long, env = "RESTORE_TOPOLOGY_KEY", default_value = "kubernetes.io/hostname")]
    pub topology_key: String,

    #[arg(long, env = "RESTORE_STORAGE_CLASS", default_value = "standard")]
    pub storage_class: String,

    #[arg(long, env = "RESTORE_CONTAINER_NAME", default_value = "elasticsearch")]
    pub container_name: String,

    #[arg(long, env = "RESTORE_SERVICE_ACCOUNT", default_value = "default")]
    pub service_account: String,

    /// Plugins installed by the init container, comma separated
    #[arg(long, env = "RESTORE_PLUGINS", value_delimiter = ',', default_value = "repository-s3")]
    pub plugins: Vec<String>,

    #[arg(long, env = "RESTORE_LIMIT_CPU", default_value = "4")]
    pub limit_cpu: String,

    #[arg(long, env = "RESTORE_LIMIT_MEM", default_value = "8Gi")]
    pub limit_mem: String,

    #[arg(long, env = "RESTORE_REQUEST_CPU", default_value = "2")]
    pub request_cpu: String,

    #[arg(long, env = "RESTORE_REQUEST_MEM", default_value = "4Gi")]
    pub request_mem: String,

    /// Extra pod labels, repeated key=value
    #[arg(long = "label", env = "RESTORE_LABELS", value_delimiter = ',', value_parser = parse_key_val)]
    pub labels: Vec<(String, String)>,

    /// Extra pod annotations, repeated key=value
    #[arg(long = "annotation", env = "RESTORE_ANNOTATIONS", value_delimiter = ',', value_parser = parse_key_val)]
    pub annotations: Vec<(String, String)>,

    /// Tolerations, repeated key=value (expanded to Equal tolerations)
    #[arg(long = "toleration", env = "RESTORE_TOLERATIONS", value_delimiter = ',', value_parser = parse_key_val)]
    pub tolerations: Vec<(String, String)>,

    /// Node affinity as a JSON document (k8s NodeAffinity schema)
    #[arg(long, env = "RESTORE_NODE_AFFINITY")]
    pub node_affinity: Option<String>,
}

fn parse_key_val(s: &str) -> Result<(String, String), String> {
    let (k, v) = s
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got '{s}'"))?;
    if k.is_empty() {
        return Err(format!("empty key in '{s}'"));
    }
    Ok((k.to_string(), v.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_val_pairs_parse() {
        assert_eq!(
            parse_key_val("team=search").unwrap(),
            ("team".to_string(), "search".to_string())
        );
        assert!(parse_key_val("no-separator").is_err());
        assert!(parse_key_val("=value").is_err());
    }
}
