//! Partial typed view of the ECK `Elasticsearch` custom resource.
//!
//! Only the `spec.nodeSets` subtree is modeled; everything else the resource
//! carries is captured into flattened maps so a read-modify-patch cycle never
//! drops fields this schema does not know about. The CRD itself is owned by
//! the ECK operator, so no schema is generated here.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{PersistentVolumeClaim, PodTemplateSpec};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use kube::CustomResource;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(CustomResource, Serialize, Deserialize, Default, Debug, PartialEq, Clone)]
#[kube(
    group = "elasticsearch.k8s.elastic.co",
    version = "v1",
    kind = "Elasticsearch",
    plural = "elasticsearches",
    derive = "PartialEq",
    namespaced,
    schema = "disabled"
)]
#[kube(derive = "Default")]
#[serde(rename_all = "camelCase")]
pub struct ElasticsearchSpec {
    #[serde(default)]
    pub node_sets: Vec<NodeSet>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

/// One homogeneous group of Elasticsearch pods inside the cluster.
#[derive(Serialize, Deserialize, Default, Debug, PartialEq, Clone)]
#[serde(rename_all = "camelCase")]
pub struct NodeSet {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub count: Option<i32>,
    /// elasticsearch.yml overlay for the node set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<BTreeMap<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod_template: Option<PodTemplateSpec>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volume_claim_templates: Vec<PersistentVolumeClaim>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl NodeSet {
    /// Storage request of the data volume claim, if one is declared.
    pub fn storage_request(&self) -> Option<&Quantity> {
        self.volume_claim_templates
            .first()?
            .spec
            .as_ref()?
            .resources
            .as_ref()?
            .requests
            .as_ref()?
            .get("storage")
    }

    pub fn set_storage_request(&mut self, storage: Quantity) {
        if let Some(requests) = self
            .volume_claim_templates
            .first_mut()
            .and_then(|vct| vct.spec.as_mut())
            .and_then(|spec| spec.resources.as_mut())
            .and_then(|resources| resources.requests.as_mut())
        {
            requests.insert("storage".to_string(), storage);
        }
    }
}
