use std::collections::BTreeMap;

use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
};
use chrono::{DateTime, Utc};
use kube::{Api, api::PostParams};
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

use snaprestore_common::annotations;
use snaprestore_types::{ElasticsearchRef, RestoreTask, RestoreTaskSpec, SnapshotRef};

use crate::indexer::parse_es_time;
use crate::server::AppState;
use crate::store;
use crate::tasks::planner::quantity_to_bytes;

/// Health check endpoint
pub async fn health() -> impl IntoResponse {
    "OK"
}

#[derive(Debug, Deserialize)]
pub struct QueryIndexParams {
    /// Comma-separated name patterns
    pub name: String,
    #[serde(default)]
    pub start_at: Option<String>,
    #[serde(default)]
    pub end_at: Option<String>,
}

fn split_names(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn parse_window_time(
    field: &str,
    raw: &Option<String>,
) -> Result<Option<DateTime<Utc>>, (StatusCode, String)> {
    match raw.as_deref().filter(|s| !s.is_empty()) {
        None => Ok(None),
        Some(raw) => parse_es_time(raw).map(Some).ok_or_else(|| {
            (
                StatusCode::BAD_REQUEST,
                format!("invalid {field} timestamp: {raw}"),
            )
        }),
    }
}

/// Catalog lookup by name pattern and creation-time window.
pub async fn query_indices(
    State(state): State<AppState>,
    Query(params): Query<QueryIndexParams>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let names = split_names(&params.name);
    if names.is_empty() {
        return Err((
            StatusCode::BAD_REQUEST,
            "at least one name pattern is required".to_string(),
        ));
    }
    let start_at = parse_window_time("start_at", &params.start_at)?;
    let end_at = parse_window_time("end_at", &params.end_at)?;

    let all_index = store::query_indices(&state.pool, &names, start_at, end_at)
        .await
        .map_err(|e| {
            tracing::error!("failed to query indices: {e:?}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("failed to query indices: {e}"),
            )
        })?;
    Ok(Json(json!({ "all_index": all_index })))
}

#[derive(Debug, Deserialize)]
pub struct RestoreRequest {
    pub name: Vec<String>,
    #[serde(default)]
    pub start_at: Option<String>,
    #[serde(default)]
    pub end_at: Option<String>,
}

/// Create a restore task: resolve the matching indices, find the latest
/// successful snapshot containing each, record one task row per index, and
/// create one RestoreTask resource per source snapshot.
pub async fn restore_snapshot(
    State(state): State<AppState>,
    Json(req): Json<RestoreRequest>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    if req.name.is_empty() {
        return Err((
            StatusCode::BAD_REQUEST,
            "at least one name pattern is required".to_string(),
        ));
    }
    let start_at = parse_window_time("start_at", &req.start_at)?;
    let end_at = parse_window_time("end_at", &req.end_at)?;

    let matched = store::query_indices(&state.pool, &req.name, start_at, end_at)
        .await
        .map_err(|e| {
            tracing::error!("failed to query indices: {e:?}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("failed to query indices: {e}"),
            )
        })?;
    if matched.is_empty() {
        return Err((
            StatusCode::NOT_FOUND,
            "no indices matched the given patterns and window".to_string(),
        ));
    }

    // Group matched indices by their newest successful snapshot; each group
    // becomes one joint restore.
    let mut groups: BTreeMap<(String, String), Vec<String>> = BTreeMap::new();
    let mut total_bytes = 0f64;
    for index in &matched {
        let snapshot = store::latest_success_snapshot(&state.pool, &index.name)
            .await
            .map_err(|e| {
                tracing::error!("failed to query snapshots: {e:?}");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    format!("failed to query snapshots: {e}"),
                )
            })?;
        match snapshot {
            Some(snapshot) => {
                groups
                    .entry((snapshot.repository, snapshot.snapshot))
                    .or_default()
                    .push(index.name.clone());
                if let Some(size) = &index.store_size {
                    total_bytes += quantity_to_bytes(size).unwrap_or(0.0);
                }
            }
            None => {
                tracing::warn!(index = %index.name, "no successful snapshot contains index; skipping");
            }
        }
    }
    if groups.is_empty() {
        return Err((
            StatusCode::NOT_FOUND,
            "no successful snapshot contains any matched index".to_string(),
        ));
    }

    let task_id = Uuid::new_v4().to_string();
    let short = &task_id[..8];
    let node_name = format!("{}-{}", state.restore_key, random_suffix(6));
    let store_size = node_store_size(total_bytes);

    let api: Api<RestoreTask> = Api::namespaced(state.kube.clone(), &state.namespace);
    let mut tasks = Vec::new();
    for (i, ((repository, snapshot), indices)) in groups.into_iter().enumerate() {
        for index in &indices {
            store::insert_task_row(&state.pool, &task_id, index, &repository, &snapshot)
                .await
                .map_err(|e| {
                    tracing::error!("failed to insert task row: {e:?}");
                    (
                        StatusCode::INTERNAL_SERVER_ERROR,
                        format!("failed to insert task row: {e}"),
                    )
                })?;
        }
        let name = if i == 0 {
            format!("restore-{short}")
        } else {
            format!("restore-{short}-{i}")
        };
        let mut task = RestoreTask::new(
            &name,
            RestoreTaskSpec {
                task_id: task_id.clone(),
                node_name: node_name.clone(),
                store_size: store_size.clone(),
                snapshot: SnapshotRef {
                    repository: repository.clone(),
                    snapshot: snapshot.clone(),
                },
                indices: indices.clone(),
                elasticsearch_ref: ElasticsearchRef {
                    namespace: None,
                    name: state.es_name.clone(),
                },
            },
        );
        task.metadata.annotations =
            Some([(annotations::TASK_ID.to_string(), task_id.clone())].into());
        api.create(&PostParams::default(), &task)
            .await
            .map_err(|e| {
                tracing::error!("failed to create RestoreTask {name}: {e:?}");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    format!("failed to create RestoreTask: {e}"),
                )
            })?;
        tasks.push(json!({
            "name": name,
            "repository": repository,
            "snapshot": snapshot,
            "indices": indices,
        }));
    }

    Ok((
        StatusCode::CREATED,
        Json(json!({
            "task_id": task_id,
            "node_name": node_name,
            "store_size": store_size,
            "tasks": tasks,
        })),
    ))
}

/// Per-index rows of one task, for diagnosis.
pub async fn get_task(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let rows = store::rows_for_task(&state.pool, &task_id)
        .await
        .map_err(|e| {
            tracing::error!("failed to query task rows: {e:?}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("failed to query task rows: {e}"),
            )
        })?;
    if rows.is_empty() {
        return Err((StatusCode::NOT_FOUND, format!("task {task_id} not found")));
    }
    Ok(Json(json!({ "task_id": task_id, "rows": rows })))
}

/// Node storage request covering the summed index sizes with headroom for
/// translog and replica overhead during recovery.
fn node_store_size(total_bytes: f64) -> String {
    let gib = total_bytes / 1024f64.powi(3);
    let with_headroom = (gib * 1.2).ceil() as u64;
    format!("{}Gi", with_headroom.max(10))
}

fn random_suffix(length: usize) -> String {
    use rand::Rng;
    const CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
    let mut rng = rand::rng();
    (0..length)
        .map(|_| CHARSET[rng.random_range(0..CHARSET.len())] as char)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_size_adds_headroom_and_rounds_up() {
        assert_eq!(node_store_size(100.0 * 1024f64.powi(3)), "120Gi");
        assert_eq!(node_store_size(50.5 * 1024f64.powi(3)), "61Gi");
    }

    #[test]
    fn store_size_has_a_floor() {
        assert_eq!(node_store_size(0.0), "10Gi");
        assert_eq!(node_store_size(1024.0), "10Gi");
    }

    #[test]
    fn suffixes_are_lowercase_dns_safe() {
        let s = random_suffix(6);
        assert_eq!(s.len(), 6);
        assert!(s.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()));
    }

    #[test]
    fn name_lists_split_and_trim() {
        assert_eq!(split_names("a, b ,,c"), vec!["a", "b", "c"]);
        assert!(split_names("").is_empty());
    }
}
