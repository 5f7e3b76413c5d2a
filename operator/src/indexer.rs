//! Periodic snapshot of the cluster catalog into the task store. The intake
//! API answers from these tables instead of hitting Elasticsearch directly.

use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use deadpool_postgres::Pool;
use tokio_util::sync::CancellationToken;

use crate::elastic::EsClient;
use crate::store::{self, CatalogIndex, CatalogSnapshot};

pub async fn run(es: EsClient, pool: Pool, period: Duration, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                match sync_indices(&es, &pool).await {
                    Ok(count) => tracing::info!(count, "synced index catalog"),
                    Err(e) => tracing::error!("failed to sync index catalog: {e:?}"),
                }
                match sync_snapshots(&es, &pool).await {
                    Ok(count) => tracing::info!(count, "synced snapshot catalog"),
                    Err(e) => tracing::error!("failed to sync snapshot catalog: {e:?}"),
                }
            }
        }
    }
}

async fn sync_indices(es: &EsClient, pool: &Pool) -> Result<usize> {
    let indices: Vec<CatalogIndex> = es
        .all_indices()
        .await?
        .into_iter()
        .map(|i| CatalogIndex {
            name: i.index,
            created_at: i.creation_date.as_deref().and_then(parse_es_time),
            store_size: i.store_size,
        })
        .collect();
    store::upsert_indices(pool, &indices).await?;
    Ok(indices.len())
}

async fn sync_snapshots(es: &EsClient, pool: &Pool) -> Result<usize> {
    let snapshots: Vec<CatalogSnapshot> = es
        .all_snapshot_details()
        .await?
        .into_iter()
        .map(|s| CatalogSnapshot {
            snapshot: s.snapshot,
            repository: s.repository,
            state: s.state,
            start_time: s.start_time.as_deref().and_then(parse_es_time),
            indices: s.indices,
        })
        .collect();
    store::upsert_snapshots(pool, &snapshots).await?;
    Ok(snapshots.len())
}

/// Timestamps as Elasticsearch prints them; a handful of layouts show up
/// depending on the API and version.
pub fn parse_es_time(s: &str) -> Option<DateTime<Utc>> {
    if let Ok(t) = DateTime::parse_from_rfc3339(s) {
        return Some(t.with_timezone(&Utc));
    }
    if let Ok(t) = NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return Some(Utc.from_utc_datetime(&t));
    }
    if let Ok(d) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        return Some(Utc.from_utc_datetime(&d.and_hms_opt(0, 0, 0)?));
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_the_layouts_elasticsearch_emits() {
        assert!(parse_es_time("2024-01-15T10:30:00.000Z").is_some());
        assert!(parse_es_time("2024-01-15T10:30:00+08:00").is_some());
        assert!(parse_es_time("2024-01-15 10:30:00").is_some());
        assert!(parse_es_time("2024-01-15").is_some());
        assert!(parse_es_time("last tuesday").is_none());
    }

    #[test]
    fn rfc3339_normalizes_to_utc() {
        let t = parse_es_time("2024-01-15T10:00:00+02:00").unwrap();
        assert_eq!(t.to_rfc3339(), "2024-01-15T08:00:00+00:00");
    }
}
