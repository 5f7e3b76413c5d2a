//! Task store and cluster catalog on Postgres.
//!
//! One `restore_tasks` row per (task_id, index) records the per-index outcome.
//! The catalog tables are periodically refreshed copies of the cluster's
//! index and snapshot listings, queried by the intake API.

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use deadpool_postgres::Pool;
use serde::Serialize;
use tokio_postgres::types::ToSql;

use snaprestore_types::{TaskStage, TaskStatus};

#[derive(Debug, Clone, Serialize)]
pub struct TaskRow {
    pub task_id: String,
    pub index: String,
    pub repository: String,
    pub snapshot: String,
    pub status: TaskStatus,
    pub current_stage: Option<TaskStage>,
    pub error_message: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CatalogIndex {
    pub name: String,
    pub created_at: Option<DateTime<Utc>>,
    pub store_size: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CatalogSnapshot {
    pub snapshot: String,
    pub repository: String,
    pub state: String,
    pub start_time: Option<DateTime<Utc>>,
    pub indices: Vec<String>,
}

/// Initialize the schema. Safe to run on every start.
pub async fn init_schema(pool: &Pool) -> Result<()> {
    let client = pool.get().await.context("failed to get db connection")?;

    client
        .execute(
            r#"
            CREATE TABLE IF NOT EXISTS restore_tasks (
                id BIGSERIAL PRIMARY KEY,
                task_id TEXT NOT NULL,
                index_name TEXT NOT NULL,
                repository TEXT NOT NULL,
                snapshot TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'PENDING',
                current_stage TEXT NOT NULL DEFAULT 'INIT',
                payload JSONB,
                error_message TEXT,
                started_at TIMESTAMPTZ,
                finished_at TIMESTAMPTZ,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                updated_at TIMESTAMPTZ,
                UNIQUE (task_id, index_name)
            )
            "#,
            &[],
        )
        .await
        .context("failed to create restore_tasks table")?;

    client
        .execute(
            r#"
            CREATE INDEX IF NOT EXISTS idx_restore_tasks_status
            ON restore_tasks (status)
            "#,
            &[],
        )
        .await
        .context("failed to create restore_tasks status index")?;

    client
        .execute(
            r#"
            CREATE TABLE IF NOT EXISTS es_indices (
                name TEXT PRIMARY KEY,
                index_created_at TIMESTAMPTZ,
                store_size TEXT,
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
            &[],
        )
        .await
        .context("failed to create es_indices table")?;

    client
        .execute(
            r#"
            CREATE TABLE IF NOT EXISTS es_snapshots (
                snapshot TEXT PRIMARY KEY,
                repository TEXT NOT NULL,
                state TEXT NOT NULL,
                start_time TIMESTAMPTZ,
                indices JSONB NOT NULL DEFAULT '[]'::jsonb,
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
            &[],
        )
        .await
        .context("failed to create es_snapshots table")?;

    Ok(())
}

fn task_row(row: &tokio_postgres::Row) -> TaskRow {
    let status: String = row.get("status");
    let stage: Option<String> = row.get("current_stage");
    TaskRow {
        task_id: row.get("task_id"),
        index: row.get("index_name"),
        repository: row.get("repository"),
        snapshot: row.get("snapshot"),
        status: status.parse().unwrap_or_default(),
        current_stage: stage.as_deref().and_then(|s| s.parse().ok()),
        error_message: row.get("error_message"),
        started_at: row.get("started_at"),
        finished_at: row.get("finished_at"),
    }
}

const TASK_COLUMNS: &str = "task_id, index_name, repository, snapshot, status, current_stage, \
                            error_message, started_at, finished_at";

/// Rows keyed by (task_id, index). The caller decides what a count other
/// than one means.
pub async fn rows_for(pool: &Pool, task_id: &str, index: &str) -> Result<Vec<TaskRow>> {
    let client = pool.get().await.context("failed to get db connection")?;
    let rows = client
        .query(
            &format!(
                "SELECT {TASK_COLUMNS} FROM restore_tasks WHERE task_id = $1 AND index_name = $2"
            ),
            &[&task_id, &index],
        )
        .await
        .context("failed to query task rows")?;
    Ok(rows.iter().map(task_row).collect())
}

pub async fn rows_for_task(pool: &Pool, task_id: &str) -> Result<Vec<TaskRow>> {
    let client = pool.get().await.context("failed to get db connection")?;
    let rows = client
        .query(
            &format!(
                "SELECT {TASK_COLUMNS} FROM restore_tasks WHERE task_id = $1 ORDER BY index_name"
            ),
            &[&task_id],
        )
        .await
        .context("failed to query task rows")?;
    Ok(rows.iter().map(task_row).collect())
}

pub async fn insert_task_row(
    pool: &Pool,
    task_id: &str,
    index: &str,
    repository: &str,
    snapshot: &str,
) -> Result<()> {
    let client = pool.get().await.context("failed to get db connection")?;
    client
        .execute(
            r#"
            INSERT INTO restore_tasks (task_id, index_name, repository, snapshot, status, current_stage)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
            &[
                &task_id,
                &index,
                &repository,
                &snapshot,
                &TaskStatus::Pending.to_string(),
                &TaskStage::Init.to_string(),
            ],
        )
        .await
        .context("failed to insert task row")?;
    Ok(())
}

pub async fn mark_running(pool: &Pool, task_id: &str, index: &str) -> Result<()> {
    let client = pool.get().await.context("failed to get db connection")?;
    client
        .execute(
            r#"
            UPDATE restore_tasks
            SET status = $3, started_at = COALESCE(started_at, NOW()), updated_at = NOW()
            WHERE task_id = $1 AND index_name = $2
            "#,
            &[&task_id, &index, &TaskStatus::Running.to_string()],
        )
        .await
        .context("failed to mark task row running")?;
    Ok(())
}

/// Write a terminal status and stamp finished_at.
pub async fn mark_terminal(
    pool: &Pool,
    task_id: &str,
    index: &str,
    status: TaskStatus,
    error_message: Option<&str>,
) -> Result<()> {
    let client = pool.get().await.context("failed to get db connection")?;
    client
        .execute(
            r#"
            UPDATE restore_tasks
            SET status = $3, error_message = $4, finished_at = NOW(), updated_at = NOW()
            WHERE task_id = $1 AND index_name = $2
            "#,
            &[&task_id, &index, &status.to_string(), &error_message],
        )
        .await
        .context("failed to mark task row terminal")?;
    Ok(())
}

/// Advance the advisory stage. A write that would regress is logged and
/// dropped; it never fails the caller.
pub async fn advance_stage(pool: &Pool, task_id: &str, index: &str, stage: TaskStage) -> Result<()> {
    let client = pool.get().await.context("failed to get db connection")?;
    let row = client
        .query_opt(
            "SELECT current_stage FROM restore_tasks WHERE task_id = $1 AND index_name = $2",
            &[&task_id, &index],
        )
        .await
        .context("failed to read current stage")?;
    let Some(row) = row else {
        bail!("no task row for task {task_id} index {index}");
    };
    let current: Option<String> = row.get(0);
    let current = current
        .as_deref()
        .and_then(|s| s.parse::<TaskStage>().ok())
        .unwrap_or_default();
    if !current.can_advance_to(stage) {
        tracing::warn!(
            task_id,
            index,
            current = %current,
            requested = %stage,
            "dropping stage write that would not advance"
        );
        return Ok(());
    }
    client
        .execute(
            r#"
            UPDATE restore_tasks
            SET current_stage = $3, updated_at = NOW()
            WHERE task_id = $1 AND index_name = $2
            "#,
            &[&task_id, &index, &stage.to_string()],
        )
        .await
        .context("failed to advance stage")?;
    Ok(())
}

pub async fn upsert_indices(pool: &Pool, indices: &[CatalogIndex]) -> Result<()> {
    let client = pool.get().await.context("failed to get db connection")?;
    for i in indices {
        client
            .execute(
                r#"
                INSERT INTO es_indices (name, index_created_at, store_size, updated_at)
                VALUES ($1, $2, $3, NOW())
                ON CONFLICT (name) DO UPDATE
                SET store_size = EXCLUDED.store_size, updated_at = EXCLUDED.updated_at
                "#,
                &[&i.name, &i.created_at, &i.store_size],
            )
            .await
            .context("failed to upsert index record")?;
    }
    Ok(())
}

pub async fn upsert_snapshots(pool: &Pool, snapshots: &[CatalogSnapshot]) -> Result<()> {
    let client = pool.get().await.context("failed to get db connection")?;
    for s in snapshots {
        let indices = serde_json::to_value(&s.indices).context("failed to encode indices")?;
        client
            .execute(
                r#"
                INSERT INTO es_snapshots (snapshot, repository, state, start_time, indices, updated_at)
                VALUES ($1, $2, $3, $4, $5, NOW())
                ON CONFLICT (snapshot) DO UPDATE
                SET repository = EXCLUDED.repository,
                    state = EXCLUDED.state,
                    start_time = EXCLUDED.start_time,
                    indices = EXCLUDED.indices,
                    updated_at = EXCLUDED.updated_at
                "#,
                &[&s.snapshot, &s.repository, &s.state, &s.start_time, &indices],
            )
            .await
            .context("failed to upsert snapshot record")?;
    }
    Ok(())
}

fn catalog_index(row: &tokio_postgres::Row) -> CatalogIndex {
    CatalogIndex {
        name: row.get("name"),
        created_at: row.get("index_created_at"),
        store_size: row.get("store_size"),
    }
}

/// `(name LIKE $1 OR name LIKE $2 ...)` starting at the given parameter index.
fn name_clause(count: usize, first_param: usize) -> String {
    let conds: Vec<String> = (0..count)
        .map(|i| format!("name LIKE ${}", first_param + i))
        .collect();
    format!("({})", conds.join(" OR "))
}

/// Catalog lookup by name patterns and creation-time window. With a window
/// start, the newest index created at or before the start is included as
/// well, so a window never misses the index that was current when it opened.
pub async fn query_indices(
    pool: &Pool,
    names: &[String],
    start_at: Option<DateTime<Utc>>,
    end_at: Option<DateTime<Utc>>,
) -> Result<Vec<CatalogIndex>> {
    if names.is_empty() {
        bail!("at least one index name pattern is required");
    }
    let client = pool.get().await.context("failed to get db connection")?;

    let patterns: Vec<String> = names.iter().map(|n| format!("%{n}%")).collect();
    let clause = name_clause(patterns.len(), 1);
    let mut params: Vec<&(dyn ToSql + Sync)> = patterns
        .iter()
        .map(|p| p as &(dyn ToSql + Sync))
        .collect();
    let time_param = params.len() + 1;

    let mut result = Vec::new();
    match (start_at.as_ref(), end_at.as_ref()) {
        (Some(start), None) => {
            params.push(start);
            let newest_before = client
                .query(
                    &format!(
                        "SELECT name, index_created_at, store_size FROM es_indices \
                         WHERE {clause} AND index_created_at <= ${time_param} \
                         ORDER BY index_created_at DESC LIMIT 1"
                    ),
                    &params,
                )
                .await
                .context("failed to query newest index before window")?;
            result.extend(newest_before.iter().map(catalog_index));
            let in_window = client
                .query(
                    &format!(
                        "SELECT name, index_created_at, store_size FROM es_indices \
                         WHERE {clause} AND index_created_at >= ${time_param} \
                         ORDER BY index_created_at DESC"
                    ),
                    &params,
                )
                .await
                .context("failed to query indices after window start")?;
            result.extend(in_window.iter().map(catalog_index));
        }
        (Some(start), Some(end)) => {
            params.push(start);
            let newest_before = client
                .query(
                    &format!(
                        "SELECT name, index_created_at, store_size FROM es_indices \
                         WHERE {clause} AND index_created_at <= ${time_param} \
                         ORDER BY index_created_at DESC LIMIT 1"
                    ),
                    &params,
                )
                .await
                .context("failed to query newest index before window")?;
            result.extend(newest_before.iter().map(catalog_index));
            params.push(end);
            let in_window = client
                .query(
                    &format!(
                        "SELECT name, index_created_at, store_size FROM es_indices \
                         WHERE {clause} AND index_created_at >= ${time_param} \
                         AND index_created_at <= ${}  \
                         ORDER BY index_created_at DESC",
                        time_param + 1
                    ),
                    &params,
                )
                .await
                .context("failed to query indices inside window")?;
            result.extend(in_window.iter().map(catalog_index));
        }
        (None, Some(end)) => {
            params.push(end);
            let before_end = client
                .query(
                    &format!(
                        "SELECT name, index_created_at, store_size FROM es_indices \
                         WHERE {clause} AND index_created_at <= ${time_param} \
                         ORDER BY index_created_at DESC"
                    ),
                    &params,
                )
                .await
                .context("failed to query indices before window end")?;
            result.extend(before_end.iter().map(catalog_index));
        }
        (None, None) => {
            let all = client
                .query(
                    &format!(
                        "SELECT name, index_created_at, store_size FROM es_indices \
                         WHERE {clause} ORDER BY index_created_at DESC"
                    ),
                    &params,
                )
                .await
                .context("failed to query indices by name")?;
            result.extend(all.iter().map(catalog_index));
        }
    }

    // The window-start probe can duplicate an in-window index.
    let mut seen = std::collections::HashSet::new();
    result.retain(|i| seen.insert(i.name.clone()));
    Ok(result)
}

/// Newest successful snapshot containing the given index.
pub async fn latest_success_snapshot(pool: &Pool, index: &str) -> Result<Option<CatalogSnapshot>> {
    let client = pool.get().await.context("failed to get db connection")?;
    let row = client
        .query_opt(
            r#"
            SELECT snapshot, repository, state, start_time, indices
            FROM es_snapshots
            WHERE state = 'SUCCESS' AND indices @> jsonb_build_array($1::text)
            ORDER BY start_time DESC NULLS LAST
            LIMIT 1
            "#,
            &[&index],
        )
        .await
        .context("failed to query latest snapshot")?;
    Ok(row.map(|row| {
        let indices: serde_json::Value = row.get("indices");
        CatalogSnapshot {
            snapshot: row.get("snapshot"),
            repository: row.get("repository"),
            state: row.get("state"),
            start_time: row.get("start_time"),
            indices: serde_json::from_value(indices).unwrap_or_default(),
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_clause_numbers_parameters() {
        assert_eq!(name_clause(1, 1), "(name LIKE $1)");
        assert_eq!(name_clause(3, 1), "(name LIKE $1 OR name LIKE $2 OR name LIKE $3)");
        assert_eq!(name_clause(2, 4), "(name LIKE $4 OR name LIKE $5)");
    }
}
