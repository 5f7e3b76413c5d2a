//! Pure planning of the isolated restore node set: same inputs, same output.
//! All cluster interaction lives in the reconcile/actions layer.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{
    Affinity, Container, NodeAffinity, PersistentVolumeClaim, PersistentVolumeClaimSpec,
    PodAffinityTerm, PodAntiAffinity, PodSpec, PodTemplateSpec, ResourceRequirements, Toleration,
    VolumeResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use serde_json::json;

use snaprestore_common::args::RestoreArgs;
use snaprestore_types::NodeSet;

use crate::util::{Error, workload_name};

/// Label ECK stamps on every pod of a node-set's StatefulSet.
const STATEFUL_SET_NAME_LABEL: &str = "elasticsearch.k8s.elastic.co/statefulset-name";

const INSTANCE_LABEL: &str = "app.kubernetes.io/instance";

const DATA_VOLUME_NAME: &str = "elasticsearch-data";

/// Planner inputs, resolved once from the configuration surface.
#[derive(Debug, Clone)]
pub struct PlannerConfig {
    pub es_name: String,
    pub restore_key: String,
    pub restore_count: i32,
    pub topology_key: String,
    pub storage_class: String,
    pub container_name: String,
    pub service_account: String,
    pub plugins: Vec<String>,
    pub limit_cpu: String,
    pub limit_mem: String,
    pub request_cpu: String,
    pub request_mem: String,
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
    pub tolerations: BTreeMap<String, String>,
    pub node_affinity: Option<NodeAffinity>,
}

impl PlannerConfig {
    pub fn from_args(args: &RestoreArgs) -> Result<Self, Error> {
        let node_affinity = match args.node_affinity.as_deref() {
            Some(raw) => Some(serde_json::from_str::<NodeAffinity>(raw)?),
            None => None,
        };
        Ok(PlannerConfig {
            es_name: args.es_name.clone(),
            restore_key: args.restore_key.clone(),
            restore_count: args.restore_count,
            topology_key: args.topology_key.clone(),
            storage_class: args.storage_class.clone(),
            container_name: args.container_name.clone(),
            service_account: args.service_account.clone(),
            plugins: args.plugins.clone(),
            limit_cpu: args.limit_cpu.clone(),
            limit_mem: args.limit_mem.clone(),
            request_cpu: args.request_cpu.clone(),
            request_mem: args.request_mem.clone(),
            labels: args.labels.iter().cloned().collect(),
            annotations: args.annotations.iter().cloned().collect(),
            tolerations: args.tolerations.iter().cloned().collect(),
            node_affinity,
        })
    }
}

/// Produce the node-set entry for one restore task. Deterministic and
/// side-effect free.
pub fn plan_node_set(cfg: &PlannerConfig, node_name: &str, store_size: &str) -> NodeSet {
    let mut labels = cfg.labels.clone();
    labels.insert(INSTANCE_LABEL.to_string(), node_name.to_string());

    let mut config = BTreeMap::new();
    config.insert(
        format!("node.attr.{}", cfg.restore_key),
        json!(node_name),
    );
    config.insert("node.store.allow_mmap".to_string(), json!(false));
    config.insert("node.roles".to_string(), json!(["data"]));

    let tolerations: Vec<Toleration> = cfg
        .tolerations
        .iter()
        .map(|(k, v)| Toleration {
            key: Some(k.clone()),
            operator: Some("Equal".to_string()),
            value: Some(v.clone()),
            ..Default::default()
        })
        .collect();

    // Each replica on its own topology domain among this node set's pods.
    let anti_affinity = PodAntiAffinity {
        required_during_scheduling_ignored_during_execution: Some(vec![PodAffinityTerm {
            topology_key: cfg.topology_key.clone(),
            label_selector: Some(LabelSelector {
                match_labels: Some(
                    [(
                        STATEFUL_SET_NAME_LABEL.to_string(),
                        workload_name(&cfg.es_name, node_name),
                    )]
                    .into(),
                ),
                ..Default::default()
            }),
            ..Default::default()
        }]),
        ..Default::default()
    };

    let pod_template = PodTemplateSpec {
        metadata: Some(ObjectMeta {
            name: Some(node_name.to_string()),
            labels: Some(labels.clone()),
            annotations: Some(cfg.annotations.clone()),
            ..Default::default()
        }),
        spec: Some(PodSpec {
            affinity: Some(Affinity {
                node_affinity: cfg.node_affinity.clone(),
                pod_anti_affinity: Some(anti_affinity),
                ..Default::default()
            }),
            tolerations: if tolerations.is_empty() {
                None
            } else {
                Some(tolerations)
            },
            service_account_name: Some(cfg.service_account.clone()),
            init_containers: Some(vec![Container {
                name: "install-plugins".to_string(),
                command: Some(vec![
                    "sh".to_string(),
                    "-c".to_string(),
                    format!(
                        "bin/elasticsearch-plugin install --batch {}",
                        cfg.plugins.join(" ")
                    ),
                ]),
                ..Default::default()
            }]),
            containers: vec![Container {
                name: cfg.container_name.clone(),
                resources: Some(ResourceRequirements {
                    limits: Some(
                        [
                            ("cpu".to_string(), Quantity(cfg.limit_cpu.clone())),
                            ("memory".to_string(), Quantity(cfg.limit_mem.clone())),
                        ]
                        .into(),
                    ),
                    requests: Some(
                        [
                            ("cpu".to_string(), Quantity(cfg.request_cpu.clone())),
                            ("memory".to_string(), Quantity(cfg.request_mem.clone())),
                        ]
                        .into(),
                    ),
                    ..Default::default()
                }),
                ..Default::default()
            }],
            ..Default::default()
        }),
    };

    let volume_claim = PersistentVolumeClaim {
        metadata: ObjectMeta {
            name: Some(DATA_VOLUME_NAME.to_string()),
            labels: Some(labels),
            annotations: Some(cfg.annotations.clone()),
            ..Default::default()
        },
        spec: Some(PersistentVolumeClaimSpec {
            access_modes: Some(vec!["ReadWriteOnce".to_string()]),
            resources: Some(VolumeResourceRequirements {
                requests: Some([("storage".to_string(), Quantity(store_size.to_string()))].into()),
                ..Default::default()
            }),
            storage_class_name: Some(cfg.storage_class.clone()),
            ..Default::default()
        }),
        ..Default::default()
    };

    NodeSet {
        name: node_name.to_string(),
        count: Some(cfg.restore_count),
        config: Some(config),
        pod_template: Some(pod_template),
        volume_claim_templates: vec![volume_claim],
        extra: BTreeMap::new(),
    }
}

/// Bytes represented by a storage quantity string. Accepts the Kubernetes
/// binary/decimal suffixes and the lowercase forms Elasticsearch reports in
/// `store.size` (1024-based).
pub fn quantity_to_bytes(q: &str) -> Result<f64, Error> {
    let q = q.trim();
    let split = q
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(q.len());
    let (num, suffix) = q.split_at(split);
    let value: f64 = num
        .parse()
        .map_err(|_| Error::Quantity(q.to_string()))?;
    let multiplier: f64 = match suffix {
        "" | "b" | "B" => 1.0,
        "Ki" | "kb" => 1024.0,
        "Mi" | "mb" => 1024.0_f64.powi(2),
        "Gi" | "gb" => 1024.0_f64.powi(3),
        "Ti" | "tb" => 1024.0_f64.powi(4),
        "Pi" | "pb" => 1024.0_f64.powi(5),
        "k" | "K" => 1e3,
        "M" => 1e6,
        "G" => 1e9,
        "T" => 1e12,
        "P" => 1e15,
        _ => return Err(Error::Quantity(q.to_string())),
    };
    Ok(value * multiplier)
}

/// Whether the requested size is strictly larger than the current request.
/// Equal or smaller never triggers a patch: shrinking is not performed.
pub fn exceeds(requested: &str, current: &Quantity) -> Result<bool, Error> {
    Ok(quantity_to_bytes(requested)? > quantity_to_bytes(&current.0)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> PlannerConfig {
        PlannerConfig {
            es_name: "es".to_string(),
            restore_key: "restore".to_string(),
            restore_count: 2,
            topology_key: "kubernetes.io/hostname".to_string(),
            storage_class: "fast-ssd".to_string(),
            container_name: "elasticsearch".to_string(),
            service_account: "restore-sa".to_string(),
            plugins: vec!["repository-s3".to_string(), "analysis-icu".to_string()],
            limit_cpu: "4".to_string(),
            limit_mem: "8Gi".to_string(),
            request_cpu: "2".to_string(),
            request_mem: "4Gi".to_string(),
            labels: [("team".to_string(), "search".to_string())].into(),
            annotations: BTreeMap::new(),
            tolerations: [("dedicated".to_string(), "restore".to_string())].into(),
            node_affinity: None,
        }
    }

    #[test]
    fn planned_node_set_carries_pinning_config() {
        let ns = plan_node_set(&config(), "restore-abc", "100Gi");
        assert_eq!(ns.name, "restore-abc");
        assert_eq!(ns.count, Some(2));
        let cfg = ns.config.unwrap();
        assert_eq!(cfg["node.attr.restore"], serde_json::json!("restore-abc"));
        assert_eq!(cfg["node.store.allow_mmap"], serde_json::json!(false));
        assert_eq!(cfg["node.roles"], serde_json::json!(["data"]));
    }

    #[test]
    fn planned_node_set_requests_storage() {
        let ns = plan_node_set(&config(), "restore-abc", "100Gi");
        assert_eq!(ns.storage_request().unwrap().0, "100Gi");
        let vct = &ns.volume_claim_templates[0];
        let spec = vct.spec.as_ref().unwrap();
        assert_eq!(spec.access_modes.as_deref(), Some(&["ReadWriteOnce".to_string()][..]));
        assert_eq!(spec.storage_class_name.as_deref(), Some("fast-ssd"));
    }

    #[test]
    fn anti_affinity_spreads_the_workload_pods() {
        let ns = plan_node_set(&config(), "restore-abc", "100Gi");
        let pod = ns.pod_template.unwrap();
        let spec = pod.spec.unwrap();
        let term = &spec
            .affinity
            .unwrap()
            .pod_anti_affinity
            .unwrap()
            .required_during_scheduling_ignored_during_execution
            .unwrap()[0];
        assert_eq!(term.topology_key, "kubernetes.io/hostname");
        assert_eq!(
            term.label_selector
                .as_ref()
                .unwrap()
                .match_labels
                .as_ref()
                .unwrap()[STATEFUL_SET_NAME_LABEL],
            "es-es-restore-abc"
        );
    }

    #[test]
    fn tolerations_expand_to_equal_operator() {
        let ns = plan_node_set(&config(), "restore-abc", "100Gi");
        let spec = ns.pod_template.unwrap().spec.unwrap();
        let tolerations = spec.tolerations.unwrap();
        assert_eq!(tolerations.len(), 1);
        assert_eq!(tolerations[0].key.as_deref(), Some("dedicated"));
        assert_eq!(tolerations[0].operator.as_deref(), Some("Equal"));
        assert_eq!(tolerations[0].value.as_deref(), Some("restore"));
    }

    #[test]
    fn instance_label_names_the_node_set() {
        let ns = plan_node_set(&config(), "restore-abc", "100Gi");
        let labels = ns.pod_template.unwrap().metadata.unwrap().labels.unwrap();
        assert_eq!(labels[INSTANCE_LABEL], "restore-abc");
        assert_eq!(labels["team"], "search");
    }

    #[test]
    fn init_container_installs_plugins_in_one_shell() {
        let ns = plan_node_set(&config(), "restore-abc", "100Gi");
        let spec = ns.pod_template.unwrap().spec.unwrap();
        let init = &spec.init_containers.unwrap()[0];
        assert_eq!(init.name, "install-plugins");
        assert_eq!(
            init.command.as_ref().unwrap()[2],
            "bin/elasticsearch-plugin install --batch repository-s3 analysis-icu"
        );
    }

    #[test]
    fn planner_is_deterministic() {
        let a = plan_node_set(&config(), "restore-abc", "100Gi");
        let b = plan_node_set(&config(), "restore-abc", "100Gi");
        assert_eq!(a, b);
        assert_eq!(
            serde_json::to_string(&a).unwrap(),
            serde_json::to_string(&b).unwrap()
        );
    }

    #[test]
    fn quantities_parse_binary_and_es_suffixes() {
        assert_eq!(quantity_to_bytes("1Ki").unwrap(), 1024.0);
        assert_eq!(quantity_to_bytes("100Gi").unwrap(), 100.0 * 1024f64.powi(3));
        assert_eq!(quantity_to_bytes("1.5Ti").unwrap(), 1.5 * 1024f64.powi(4));
        assert_eq!(quantity_to_bytes("500mb").unwrap(), 500.0 * 1024f64.powi(2));
        assert_eq!(quantity_to_bytes("1073741824").unwrap(), 1073741824.0);
        assert!(quantity_to_bytes("ten gigs").is_err());
        assert!(quantity_to_bytes("100Qx").is_err());
    }

    #[test]
    fn expansion_requires_strictly_larger_request() {
        let current = Quantity("50Gi".to_string());
        assert!(exceeds("100Gi", &current).unwrap());
        assert!(!exceeds("50Gi", &current).unwrap());
        assert!(!exceeds("10Gi", &current).unwrap());
        // Mixed units compare by bytes.
        assert!(exceeds("1Ti", &Quantity("900Gi".to_string())).unwrap());
    }
}
