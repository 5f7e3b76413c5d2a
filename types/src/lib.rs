use k8s_openapi::apimachinery::pkg::apis::meta::v1::{Condition, Time};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};

mod elasticsearch;

pub use elasticsearch::*;

/// Source snapshot coordinates.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct SnapshotRef {
    pub repository: String,
    pub snapshot: String,
}

/// Reference to the Elasticsearch resource the restore nodes are attached to.
/// The namespace defaults to the RestoreTask's own namespace.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct ElasticsearchRef {
    pub namespace: Option<String>,
    pub name: String,
}

#[derive(CustomResource, Serialize, Deserialize, Default, Debug, PartialEq, Clone, JsonSchema)]
#[kube(
    group = "restore.elastic.co",
    version = "v1",
    kind = "RestoreTask",
    plural = "restoretasks",
    derive = "PartialEq",
    status = "RestoreTaskStatus",
    namespaced
)]
#[kube(derive = "Default")]
#[kube(
    printcolumn = "{\"jsonPath\": \".status.status\", \"name\": \"STATUS\", \"type\": \"string\" }"
)]
#[kube(
    printcolumn = "{\"jsonPath\": \".status.start_at\", \"name\": \"AGE\", \"type\": \"date\" }"
)]
#[serde(rename_all = "camelCase")]
pub struct RestoreTaskSpec {
    /// Opaque task identifier, stable across retries. Keys the task-store rows.
    pub task_id: String,
    /// Node-set identifier inside the target Elasticsearch resource.
    pub node_name: String,
    /// Requested storage per restore node, e.g. "100Gi".
    pub store_size: String,
    pub snapshot: SnapshotRef,
    /// Indices to restore; non-empty, order preserved.
    pub indices: Vec<String>,
    pub elasticsearch_ref: ElasticsearchRef,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Default, JsonSchema)]
pub struct RestoreTaskStatus {
    pub reason: Option<String>,
    /// Set once on first observation, never moved afterwards.
    pub start_at: Option<Time>,
    /// Set exactly once, when status turns terminal.
    pub finished_at: Option<Time>,
    pub status: RestorePhase,
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

/// User-visible outcome of a RestoreTask resource.
#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, JsonSchema, Default)]
#[serde(rename_all = "lowercase")]
pub enum RestorePhase {
    #[default]
    Pending,
    Running,
    Done,
    Failed,
}

impl RestorePhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RestorePhase::Done | RestorePhase::Failed)
    }
}

impl FromStr for RestorePhase {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(RestorePhase::Pending),
            "running" => Ok(RestorePhase::Running),
            "done" => Ok(RestorePhase::Done),
            "failed" => Ok(RestorePhase::Failed),
            _ => Err(()),
        }
    }
}

impl fmt::Display for RestorePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RestorePhase::Pending => write!(f, "pending"),
            RestorePhase::Running => write!(f, "running"),
            RestorePhase::Done => write!(f, "done"),
            RestorePhase::Failed => write!(f, "failed"),
        }
    }
}

/// Per-index outcome recorded in the task store.
#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    #[default]
    Pending,
    Running,
    Success,
    Failed,
    Timeout,
    Canceled,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Success | TaskStatus::Failed | TaskStatus::Timeout | TaskStatus::Canceled
        )
    }
}

impl FromStr for TaskStatus {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(TaskStatus::Pending),
            "RUNNING" => Ok(TaskStatus::Running),
            "SUCCESS" => Ok(TaskStatus::Success),
            "FAILED" => Ok(TaskStatus::Failed),
            "TIMEOUT" => Ok(TaskStatus::Timeout),
            "CANCELED" => Ok(TaskStatus::Canceled),
            _ => Err(()),
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskStatus::Pending => write!(f, "PENDING"),
            TaskStatus::Running => write!(f, "RUNNING"),
            TaskStatus::Success => write!(f, "SUCCESS"),
            TaskStatus::Failed => write!(f, "FAILED"),
            TaskStatus::Timeout => write!(f, "TIMEOUT"),
            TaskStatus::Canceled => write!(f, "CANCELED"),
        }
    }
}

/// Coarse milestone of a task-store row. Advances in one direction only;
/// regressing writes are dropped by the store.
#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStage {
    #[default]
    Init,
    CreateEsNode,
    CheckEsNode,
    RestoreIndex,
}

impl TaskStage {
    fn rank(&self) -> u8 {
        match self {
            TaskStage::Init => 0,
            TaskStage::CreateEsNode => 1,
            TaskStage::CheckEsNode => 2,
            TaskStage::RestoreIndex => 3,
        }
    }

    /// Whether a row currently at `self` may move to `next`.
    pub fn can_advance_to(&self, next: TaskStage) -> bool {
        next.rank() > self.rank()
    }
}

impl FromStr for TaskStage {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "INIT" => Ok(TaskStage::Init),
            "CREATE_ES_NODE" => Ok(TaskStage::CreateEsNode),
            "CHECK_ES_NODE" => Ok(TaskStage::CheckEsNode),
            "RESTORE_INDEX" => Ok(TaskStage::RestoreIndex),
            _ => Err(()),
        }
    }
}

impl fmt::Display for TaskStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskStage::Init => write!(f, "INIT"),
            TaskStage::CreateEsNode => write!(f, "CREATE_ES_NODE"),
            TaskStage::CheckEsNode => write!(f, "CHECK_ES_NODE"),
            TaskStage::RestoreIndex => write!(f, "RESTORE_INDEX"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_only_moves_forward() {
        assert!(TaskStage::Init.can_advance_to(TaskStage::CreateEsNode));
        assert!(TaskStage::Init.can_advance_to(TaskStage::RestoreIndex));
        assert!(TaskStage::CheckEsNode.can_advance_to(TaskStage::RestoreIndex));
        assert!(!TaskStage::RestoreIndex.can_advance_to(TaskStage::Init));
        assert!(!TaskStage::CheckEsNode.can_advance_to(TaskStage::CheckEsNode));
        assert!(!TaskStage::CreateEsNode.can_advance_to(TaskStage::Init));
    }

    #[test]
    fn status_round_trips_wire_form() {
        for s in [
            TaskStatus::Pending,
            TaskStatus::Running,
            TaskStatus::Success,
            TaskStatus::Failed,
            TaskStatus::Timeout,
            TaskStatus::Canceled,
        ] {
            assert_eq!(s.to_string().parse::<TaskStatus>(), Ok(s));
        }
        assert!("SUSPENDED".parse::<TaskStatus>().is_err());
    }

    #[test]
    fn terminal_statuses() {
        assert!(!TaskStatus::Pending.is_terminal());
        assert!(!TaskStatus::Running.is_terminal());
        assert!(TaskStatus::Timeout.is_terminal());
        assert!(RestorePhase::Done.is_terminal());
        assert!(!RestorePhase::Running.is_terminal());
    }
}
