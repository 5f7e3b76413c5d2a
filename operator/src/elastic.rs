//! Thin HTTP client for the Elasticsearch surfaces the orchestrator touches:
//! snapshot restore, recovery progress, and the catalog reads feeding the
//! task store.

use anyhow::{Context, Result, bail};
use reqwest::Client;
use serde::Deserialize;
use serde_json::{Value, json};

use snaprestore_common::args::ElasticArgs;

#[derive(Clone)]
pub struct EsClient {
    client: Client,
    base_url: String,
    username: String,
    password: Option<String>,
}

/// One `_cat/indices` row, reduced to the catalog columns.
#[derive(Debug, Clone, Deserialize)]
pub struct CatIndex {
    pub index: String,
    #[serde(rename = "creation.date.string")]
    pub creation_date: Option<String>,
    #[serde(rename = "store.size")]
    pub store_size: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CatRepository {
    pub id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CatSnapshot {
    pub id: String,
}

/// Snapshot detail as returned by `GET _snapshot/{repo}/{names}`.
#[derive(Debug, Clone, Deserialize)]
pub struct SnapshotDetail {
    pub snapshot: String,
    #[serde(default)]
    pub repository: String,
    pub state: String,
    #[serde(default)]
    pub start_time: Option<String>,
    #[serde(default)]
    pub indices: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct SnapshotDetails {
    snapshots: Vec<SnapshotDetail>,
}

/// One `_cat/recovery` row for an index being restored.
#[derive(Debug, Clone, Deserialize)]
pub struct RecoveryEntry {
    pub index: String,
    #[serde(rename = "bytes_percent")]
    pub recovered_percent: String,
}

impl EsClient {
    pub fn new(args: &ElasticArgs) -> Result<Self> {
        let mut builder = Client::builder();
        if args.es_skip_tls_verify {
            builder = builder.danger_accept_invalid_certs(true);
        }
        let client = builder.build().context("failed to build http client")?;
        Ok(Self {
            client,
            base_url: args.es_url.trim_end_matches('/').to_string(),
            username: args.es_username.clone(),
            password: args.es_password.clone(),
        })
    }

    fn get(&self, url: String) -> reqwest::RequestBuilder {
        self.client
            .get(url)
            .basic_auth(&self.username, self.password.as_deref())
    }

    /// Submit a snapshot restore that pins the restored copies to the nodes
    /// carrying `{restore_key} = {node_name}`. Restored indices are renamed
    /// with the matching prefix so the originals are never touched.
    pub async fn restore(
        &self,
        repository: &str,
        snapshot: &str,
        restore_key: &str,
        node_name: &str,
        indices: &[String],
    ) -> Result<()> {
        let url = format!("{}/_snapshot/{}/{}/_restore", self.base_url, repository, snapshot);
        let resp = self
            .client
            .post(&url)
            .basic_auth(&self.username, self.password.as_deref())
            .json(&restore_body(restore_key, node_name, indices))
            .send()
            .await
            .context("failed to send restore request")?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            bail!(
                "restore of {} from snapshot {} failed with status {}: {}",
                indices.join(","),
                snapshot,
                status,
                body
            );
        }
        Ok(())
    }

    /// Recovery progress of the given (already renamed) indices. Indices whose
    /// recovery record has not appeared yet are simply absent from the result.
    pub async fn recovery(&self, indices: &[String]) -> Result<Vec<RecoveryEntry>> {
        let url = format!(
            "{}/_cat/recovery/{}?format=json&h=index,bytes_percent&ignore_unavailable=true",
            self.base_url,
            indices.join(",")
        );
        let resp = self
            .get(url)
            .send()
            .await
            .context("failed to send recovery request")?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(Vec::new());
        }
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            bail!("recovery query failed with status {}: {}", status, body);
        }
        resp.json::<Vec<RecoveryEntry>>()
            .await
            .context("failed to parse recovery response")
    }

    /// All indices in the cluster, sorted by creation date.
    pub async fn all_indices(&self) -> Result<Vec<CatIndex>> {
        let url = format!(
            "{}/_cat/indices?format=json&h=index,creation.date.string,store.size&s=creation.date.string&expand_wildcards=all",
            self.base_url
        );
        let resp = self
            .get(url)
            .send()
            .await
            .context("failed to send cat indices request")?;
        if !resp.status().is_success() {
            bail!("cat indices failed with status {}", resp.status());
        }
        resp.json::<Vec<CatIndex>>()
            .await
            .context("failed to parse cat indices response")
    }

    async fn all_repositories(&self) -> Result<Vec<CatRepository>> {
        let url = format!("{}/_cat/repositories?format=json&h=id", self.base_url);
        let resp = self
            .get(url)
            .send()
            .await
            .context("failed to send cat repositories request")?;
        if !resp.status().is_success() {
            bail!("cat repositories failed with status {}", resp.status());
        }
        resp.json::<Vec<CatRepository>>()
            .await
            .context("failed to parse cat repositories response")
    }

    async fn snapshots_of_repository(&self, repository: &str) -> Result<Vec<CatSnapshot>> {
        let url = format!(
            "{}/_cat/snapshots/{}?format=json&ignore_unavailable=true&s=id&h=id,repository,status",
            self.base_url, repository
        );
        let resp = self
            .get(url)
            .send()
            .await
            .context("failed to send cat snapshots request")?;
        if !resp.status().is_success() {
            bail!("cat snapshots of {repository} failed with status {}", resp.status());
        }
        resp.json::<Vec<CatSnapshot>>()
            .await
            .context("failed to parse cat snapshots response")
    }

    async fn snapshot_details(
        &self,
        repository: &str,
        snapshots: &[String],
    ) -> Result<Vec<SnapshotDetail>> {
        let url = format!(
            "{}/_snapshot/{}/{}?index_names=true",
            self.base_url,
            repository,
            snapshots.join(",")
        );
        let resp = self
            .get(url)
            .send()
            .await
            .context("failed to send snapshot detail request")?;
        if !resp.status().is_success() {
            bail!(
                "snapshot detail of repo {repository} failed with status {}",
                resp.status()
            );
        }
        let details = resp
            .json::<SnapshotDetails>()
            .await
            .context("failed to parse snapshot detail response")?;
        Ok(details.snapshots)
    }

    /// Every snapshot of every registered repository. A repository that fails
    /// to answer is skipped, not fatal.
    pub async fn all_snapshot_details(&self) -> Result<Vec<SnapshotDetail>> {
        let mut all = Vec::new();
        for repo in self.all_repositories().await? {
            let names = match self.snapshots_of_repository(&repo.id).await {
                Ok(snapshots) => snapshots.into_iter().map(|s| s.id).collect::<Vec<_>>(),
                Err(e) => {
                    tracing::error!(repository = %repo.id, "failed to list snapshots: {e:?}");
                    continue;
                }
            };
            if names.is_empty() {
                continue;
            }
            match self.snapshot_details(&repo.id, &names).await {
                Ok(mut details) => {
                    for d in &mut details {
                        if d.repository.is_empty() {
                            d.repository = repo.id.clone();
                        }
                    }
                    all.extend(details);
                }
                Err(e) => {
                    tracing::error!(repository = %repo.id, "failed to fetch snapshot details: {e:?}");
                }
            }
        }
        Ok(all)
    }
}

/// Name a restored copy so it can never collide with the live index.
pub fn restored_index_name(restore_key: &str, node_name: &str, index: &str) -> String {
    format!("{restore_key}_{node_name}_{index}")
}

/// Restore request body: rename every index with the pin prefix, drop ILM,
/// and require allocation onto the isolated node attribute.
pub fn restore_body(restore_key: &str, node_name: &str, indices: &[String]) -> Value {
    let mut settings = serde_json::Map::new();
    settings.insert("index.hidden".to_string(), json!(false));
    settings.insert(
        "index.routing.allocation.include._tier_preference".to_string(),
        Value::Null,
    );
    settings.insert(
        format!("index.routing.allocation.exclude.{restore_key}"),
        Value::Null,
    );
    settings.insert(
        format!("index.routing.allocation.require.{restore_key}"),
        json!(node_name),
    );
    json!({
        "indices": indices.join(","),
        "rename_pattern": "(.+)",
        "rename_replacement": format!("{restore_key}_{node_name}_$1"),
        "ignore_index_settings": ["index.lifecycle.name"],
        "index_settings": settings,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn restore_body_pins_to_node_attribute() {
        let body = restore_body("restore", "restore-abc", &["idx-a".into(), "idx-b".into()]);
        assert_eq!(body["indices"], "idx-a,idx-b");
        assert_eq!(body["rename_pattern"], "(.+)");
        assert_eq!(body["rename_replacement"], "restore_restore-abc_$1");
        assert_eq!(
            body["ignore_index_settings"],
            serde_json::json!(["index.lifecycle.name"])
        );
        let settings = &body["index_settings"];
        assert_eq!(settings["index.routing.allocation.include._tier_preference"], Value::Null);
        assert_eq!(settings["index.routing.allocation.exclude.restore"], Value::Null);
        assert_eq!(settings["index.routing.allocation.require.restore"], "restore-abc");
    }

    #[test]
    fn restored_names_carry_key_and_node() {
        assert_eq!(
            restored_index_name("restore", "restore-abc", "logs-2024"),
            "restore_restore-abc_logs-2024"
        );
    }
}
