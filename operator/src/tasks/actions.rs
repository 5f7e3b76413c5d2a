use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use k8s_openapi::jiff::Timestamp;
use kube::{Api, Client, api::Patch, api::PatchParams};
use owo_colors::OwoColorize;

use snaprestore_common::wait::backoff_full_jitter;
use snaprestore_types::*;

use crate::tasks::planner;
use crate::util::{
    ELASTICSEARCH_API_VERSION, ELASTICSEARCH_KIND, Error, patch::patch_status,
};

/// Stamp startAt on first observation. Never moves once set.
pub async fn start(client: Client, instance: &RestoreTask) -> Result<(), Error> {
    patch_status(client, instance, |status: &mut RestoreTaskStatus| {
        if status.start_at.is_none() {
            status.start_at = Some(Time::from(Timestamp::now()));
        }
    })
    .await?;
    Ok(())
}

/// Mark the resource running once its work item is accepted.
pub async fn running(client: Client, instance: &RestoreTask) -> Result<(), Error> {
    patch_status(client, instance, |status: &mut RestoreTaskStatus| {
        status.status = RestorePhase::Running;
    })
    .await?;
    Ok(())
}

pub async fn fail(client: Client, instance: &RestoreTask, message: String) -> Result<(), Error> {
    patch_status(client, instance, |status: &mut RestoreTaskStatus| {
        if !status.status.is_terminal() {
            status.status = RestorePhase::Failed;
            status.finished_at = Some(Time::from(Timestamp::now()));
        }
        status.reason = Some(message);
    })
    .await?;
    Ok(())
}

/// Terminal write-back from the worker: read fresh, flip to the terminal
/// phase, stamp finishedAt exactly once. Conflicts retry a bounded number of
/// times; the task-store row stays authoritative if they keep losing.
pub async fn finish(
    client: Client,
    namespace: &str,
    name: &str,
    phase: RestorePhase,
    reason: Option<String>,
) -> Result<(), Error> {
    const ATTEMPTS: usize = 3;
    let api: Api<RestoreTask> = Api::namespaced(client.clone(), namespace);
    for attempt in 0..ATTEMPTS {
        let instance = match api.get(name).await {
            Ok(instance) => instance,
            Err(kube::Error::Api(ae)) if ae.code == 404 => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        if instance
            .status
            .as_ref()
            .is_some_and(|s| s.status.is_terminal())
        {
            return Ok(());
        }
        let reason = reason.clone();
        match patch_status(client.clone(), &instance, move |status: &mut RestoreTaskStatus| {
            status.status = phase;
            status.finished_at = Some(Time::from(Timestamp::now()));
            status.reason = reason;
        })
        .await
        {
            Ok(_) => return Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 409 && attempt + 1 < ATTEMPTS => {
                tokio::time::sleep(backoff_full_jitter(
                    std::time::Duration::from_millis(250),
                    std::time::Duration::from_secs(2),
                    attempt,
                ))
                .await;
            }
            Err(e) => {
                eprintln!(
                    "{}",
                    format!("dropping status write for {namespace}/{name}: {e}").red()
                );
                return Ok(());
            }
        }
    }
    Ok(())
}

pub async fn get_elasticsearch(
    client: Client,
    namespace: &str,
    name: &str,
) -> Result<Option<Elasticsearch>, Error> {
    let api: Api<Elasticsearch> = Api::namespaced(client, namespace);
    match api.get(name).await {
        Ok(es) => Ok(Some(es)),
        Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(None),
        Err(e) => Err(e.into()),
    }
}

pub async fn get_statefulset(
    client: Client,
    namespace: &str,
    name: &str,
) -> Result<Option<StatefulSet>, Error> {
    let api: Api<StatefulSet> = Api::namespaced(client, namespace);
    match api.get(name).await {
        Ok(sts) => Ok(Some(sts)),
        Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Whether the workload's owner references include the Elasticsearch kind.
pub fn owned_by_elasticsearch(sts: &StatefulSet) -> bool {
    sts.metadata
        .owner_references
        .as_deref()
        .unwrap_or_default()
        .iter()
        .any(|owner| {
            owner.kind == ELASTICSEARCH_KIND && owner.api_version == ELASTICSEARCH_API_VERSION
        })
}

/// Append the planned node set. The patch is a merge of the full nodeSets
/// sequence computed from a freshly fetched snapshot.
pub async fn append_node_set(
    client: Client,
    namespace: &str,
    es_name: &str,
    node_set: NodeSet,
) -> Result<(), Error> {
    let api: Api<Elasticsearch> = Api::namespaced(client.clone(), namespace);
    let mut es = api.get(es_name).await?;
    if es.spec.node_sets.iter().any(|n| n.name == node_set.name) {
        return Ok(());
    }
    es.spec.node_sets.push(node_set);
    patch_node_sets(&api, es_name, &es.spec.node_sets).await
}

/// Raise the node set's storage request in place. Shrinking never happens:
/// the request is re-checked against the fresh snapshot before patching.
pub async fn expand_storage(
    client: Client,
    namespace: &str,
    es_name: &str,
    node_name: &str,
    store_size: &str,
) -> Result<(), Error> {
    let api: Api<Elasticsearch> = Api::namespaced(client.clone(), namespace);
    let mut es = api.get(es_name).await?;
    let Some(node_set) = es.spec.node_sets.iter_mut().find(|n| n.name == node_name) else {
        return Ok(());
    };
    let needs_expand = match node_set.storage_request() {
        Some(current) => planner::exceeds(store_size, current)?,
        None => true,
    };
    if !needs_expand {
        return Ok(());
    }
    node_set.set_storage_request(Quantity(store_size.to_string()));
    patch_node_sets(&api, es_name, &es.spec.node_sets).await
}

async fn patch_node_sets(
    api: &Api<Elasticsearch>,
    es_name: &str,
    node_sets: &[NodeSet],
) -> Result<(), Error> {
    let patch = serde_json::json!({
        "spec": { "nodeSets": node_sets }
    });
    api.patch(es_name, &PatchParams::default(), &Patch::Merge(&patch))
        .await?;
    Ok(())
}
