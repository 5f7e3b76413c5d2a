//! Bounded execution of restore work items.
//!
//! The dispatcher drains the task channel in FIFO order and gates execution
//! with a counting semaphore, so at most `concurrency` restores run at once.
//! Each work item runs the restore state machine to a terminal status and
//! writes that status back to both the task-store rows and the RestoreTask.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use deadpool_postgres::Pool;
use kube::Client;
use owo_colors::OwoColorize;
use tokio::sync::{Semaphore, mpsc};
use tokio_util::sync::CancellationToken;

use snaprestore_types::{RestorePhase, TaskStage, TaskStatus};

use crate::elastic::{EsClient, RecoveryEntry, restored_index_name};
use crate::store;
use crate::tasks::actions;
use crate::util::colors::{FG1, FG2};

/// In-memory unit of work. Lives from enqueue to the terminal status write.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkItem {
    pub task_id: String,
    pub namespace: String,
    pub name: String,
    pub node_name: String,
    pub indices: Vec<String>,
}

pub struct WorkerDeps {
    pub client: Client,
    pub es: EsClient,
    pub pool: Pool,
    pub restore_key: String,
    pub poll_interval: Duration,
    pub timeout: Duration,
    pub cancel: CancellationToken,
    #[cfg(feature = "metrics")]
    pub running_workers: prometheus::IntGauge,
}

/// Dequeue work items and run `job` for each, at most `concurrency` at a
/// time. FIFO by arrival; completion order is unspecified.
pub fn start_dispatcher<F, Fut>(
    mut rx: mpsc::Receiver<WorkItem>,
    concurrency: usize,
    cancel: CancellationToken,
    job: F,
) -> tokio::task::JoinHandle<()>
where
    F: Fn(WorkItem) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        let semaphore = Arc::new(Semaphore::new(concurrency));
        loop {
            let item = tokio::select! {
                _ = cancel.cancelled() => break,
                item = rx.recv() => match item {
                    Some(item) => item,
                    None => break,
                },
            };
            let permit = tokio::select! {
                _ = cancel.cancelled() => break,
                permit = semaphore.clone().acquire_owned() => {
                    permit.expect("worker semaphore never closes")
                }
            };
            let fut = job(item);
            tokio::spawn(async move {
                fut.await;
                drop(permit);
            });
        }
    })
}

enum Outcome {
    Success,
    Failed(String),
    Timeout(String),
    Canceled,
}

/// Run one work item to a terminal state and propagate it everywhere.
pub async fn run_restore(deps: Arc<WorkerDeps>, item: WorkItem) {
    #[cfg(feature = "metrics")]
    deps.running_workers.inc();

    let outcome = execute(&deps, &item).await;

    let (phase, reason) = match outcome {
        Outcome::Success => (RestorePhase::Done, None),
        Outcome::Failed(message) => (RestorePhase::Failed, Some(message)),
        Outcome::Timeout(message) => (RestorePhase::Failed, Some(message)),
        Outcome::Canceled => (
            RestorePhase::Failed,
            Some("restore interrupted by shutdown".to_string()),
        ),
    };
    if let Err(e) =
        actions::finish(deps.client.clone(), &item.namespace, &item.name, phase, reason).await
    {
        eprintln!(
            "{}",
            format!(
                "failed to write terminal status for {}/{}: {e}",
                item.namespace, item.name
            )
            .red()
        );
    }

    #[cfg(feature = "metrics")]
    deps.running_workers.dec();
}

async fn execute(deps: &WorkerDeps, item: &WorkItem) -> Outcome {
    if item.indices.is_empty() {
        return Outcome::Failed(format!("task {} has no indices", item.task_id));
    }

    // The item only exists because the node set was created and its workload
    // went ready; record those milestones on the advisory trail.
    advance_all(deps, item, TaskStage::CreateEsNode).await;
    advance_all(deps, item, TaskStage::CheckEsNode).await;

    // Exactly one row per (task, index) or the task is inconsistent.
    let mut first_row = None;
    for index in &item.indices {
        let rows = match store::rows_for(&deps.pool, &item.task_id, index).await {
            Ok(rows) => rows,
            Err(e) => {
                return fail_all(deps, item, format!("task store unavailable: {e}")).await;
            }
        };
        if rows.len() != 1 {
            let message = format!(
                "expected 1 task row for task {} index {index}, found {}",
                item.task_id,
                rows.len()
            );
            return fail_all(deps, item, message).await;
        }
        first_row.get_or_insert(rows.into_iter().next().unwrap());
    }
    let row = first_row.expect("indices are never empty");

    for index in &item.indices {
        if let Err(e) = store::mark_running(&deps.pool, &item.task_id, index).await {
            eprintln!("{}", format!("failed to mark row running: {e}").red());
        }
    }
    advance_all(deps, item, TaskStage::RestoreIndex).await;

    println!(
        "📦 {}{}{}{}{}",
        item.task_id.color(FG2),
        " restoring ".color(FG1),
        item.indices.join(",").color(FG2),
        " from snapshot ".color(FG1),
        row.snapshot.color(FG2),
    );
    if let Err(e) = deps
        .es
        .restore(
            &row.repository,
            &row.snapshot,
            &deps.restore_key,
            &item.node_name,
            &item.indices,
        )
        .await
    {
        return fail_all(deps, item, format!("restore submission rejected: {e}")).await;
    }

    poll(deps, item).await
}

async fn poll(deps: &WorkerDeps, item: &WorkItem) -> Outcome {
    let renamed: Vec<String> = item
        .indices
        .iter()
        .map(|index| restored_index_name(&deps.restore_key, &item.node_name, index))
        .collect();
    let deadline = tokio::time::Instant::now() + deps.timeout;
    let mut ticker = tokio::time::interval(deps.poll_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.tick().await; // the first tick completes immediately

    loop {
        tokio::select! {
            _ = deps.cancel.cancelled() => {
                mark_all(deps, item, TaskStatus::Canceled, Some("shutdown before recovery completed")).await;
                return Outcome::Canceled;
            }
            _ = tokio::time::sleep_until(deadline) => {
                let message = format!(
                    "recovery did not complete within {} minutes",
                    deps.timeout.as_secs() / 60
                );
                mark_all(deps, item, TaskStatus::Timeout, Some(&message)).await;
                return Outcome::Timeout(message);
            }
            _ = ticker.tick() => {
                let entries = match deps.es.recovery(&renamed).await {
                    Ok(entries) => entries,
                    Err(e) => {
                        // Transient query failures just wait for the next tick.
                        eprintln!("{}", format!("recovery query failed: {e}").red());
                        continue;
                    }
                };
                match poll_verdict(&entries) {
                    PollVerdict::Complete => {
                        mark_all(deps, item, TaskStatus::Success, None).await;
                        println!(
                            "✅ {}{}",
                            item.task_id.color(FG2),
                            " recovery complete".color(FG1),
                        );
                        return Outcome::Success;
                    }
                    PollVerdict::Pending => {
                        for entry in &entries {
                            println!(
                                "⏳ {}{}{}",
                                entry.index.color(FG2),
                                " recovered ".color(FG1),
                                entry.recovered_percent.color(FG2),
                            );
                        }
                    }
                }
            }
        }
    }
}

#[derive(Debug, PartialEq)]
enum PollVerdict {
    Pending,
    Complete,
}

/// Recovery records appear with a small lag, so an empty observation set is
/// not progress and not an error.
fn poll_verdict(entries: &[RecoveryEntry]) -> PollVerdict {
    if entries.is_empty() {
        return PollVerdict::Pending;
    }
    if entries
        .iter()
        .all(|entry| entry.recovered_percent.trim() == "100%")
    {
        PollVerdict::Complete
    } else {
        PollVerdict::Pending
    }
}

async fn advance_all(deps: &WorkerDeps, item: &WorkItem, stage: TaskStage) {
    for index in &item.indices {
        if let Err(e) = store::advance_stage(&deps.pool, &item.task_id, index, stage).await {
            eprintln!("{}", format!("failed to advance stage: {e}").red());
        }
    }
}

async fn mark_all(deps: &WorkerDeps, item: &WorkItem, status: TaskStatus, message: Option<&str>) {
    for index in &item.indices {
        if let Err(e) =
            store::mark_terminal(&deps.pool, &item.task_id, index, status, message).await
        {
            eprintln!("{}", format!("failed to write terminal row status: {e}").red());
        }
    }
}

async fn fail_all(deps: &WorkerDeps, item: &WorkItem, message: String) -> Outcome {
    eprintln!("{}", message.red());
    mark_all(deps, item, TaskStatus::Failed, Some(&message)).await;
    Outcome::Failed(message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn entry(index: &str, percent: &str) -> RecoveryEntry {
        RecoveryEntry {
            index: index.to_string(),
            recovered_percent: percent.to_string(),
        }
    }

    fn item(n: usize) -> WorkItem {
        WorkItem {
            task_id: format!("T{n}"),
            namespace: "default".to_string(),
            name: format!("restore-{n}"),
            node_name: "restore-abc".to_string(),
            indices: vec!["idx-a".to_string()],
        }
    }

    #[test]
    fn missing_observations_keep_polling() {
        assert_eq!(poll_verdict(&[]), PollVerdict::Pending);
    }

    #[test]
    fn partial_recovery_keeps_polling() {
        let entries = vec![entry("a", "100%"), entry("b", "42.0%")];
        assert_eq!(poll_verdict(&entries), PollVerdict::Pending);
    }

    #[test]
    fn full_recovery_completes() {
        let entries = vec![entry("a", "100%"), entry("b", "100%")];
        assert_eq!(poll_verdict(&entries), PollVerdict::Complete);
        assert_eq!(poll_verdict(&[entry("a", " 100% ")]), PollVerdict::Complete);
    }

    #[tokio::test(start_paused = true)]
    async fn dispatcher_bounds_parallelism() {
        let (tx, rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let done = Arc::new(AtomicUsize::new(0));

        let handle = {
            let (running, peak, done) = (running.clone(), peak.clone(), done.clone());
            start_dispatcher(rx, 2, cancel.clone(), move |_item| {
                let (running, peak, done) = (running.clone(), peak.clone(), done.clone());
                async move {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                    done.fetch_add(1, Ordering::SeqCst);
                }
            })
        };

        for n in 0..5 {
            tx.send(item(n)).await.unwrap();
        }
        while done.load(Ordering::SeqCst) < 5 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(peak.load(Ordering::SeqCst), 2);

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn dispatcher_starts_items_in_fifo_order() {
        let (tx, rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();
        let order = Arc::new(tokio::sync::Mutex::new(Vec::new()));

        let handle = {
            let order = order.clone();
            start_dispatcher(rx, 1, cancel.clone(), move |item| {
                let order = order.clone();
                async move {
                    order.lock().await.push(item.task_id);
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
            })
        };

        for n in 0..4 {
            tx.send(item(n)).await.unwrap();
        }
        loop {
            tokio::time::sleep(Duration::from_millis(10)).await;
            if order.lock().await.len() == 4 {
                break;
            }
        }
        assert_eq!(*order.lock().await, vec!["T0", "T1", "T2", "T3"]);

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn full_channel_rejects_without_blocking() {
        let (tx, _rx) = mpsc::channel(2);
        tx.try_send(item(0)).unwrap();
        tx.try_send(item(1)).unwrap();
        assert!(matches!(
            tx.try_send(item(2)),
            Err(mpsc::error::TrySendError::Full(_))
        ));
    }

    #[tokio::test]
    async fn dispatcher_stops_on_cancellation() {
        let (_tx, rx) = mpsc::channel::<WorkItem>(2);
        let cancel = CancellationToken::new();
        let handle = start_dispatcher(rx, 1, cancel.clone(), |_item| async {});
        cancel.cancel();
        handle.await.unwrap();
    }
}
