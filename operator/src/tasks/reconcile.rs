use futures::stream::StreamExt;
use kube::{
    Api, ResourceExt,
    client::Client,
    runtime::{Controller, controller::Action},
};
use kube_leader_election::{LeaseLock, LeaseLockParams, LeaseLockResult};
use owo_colors::OwoColorize;
use std::{collections::HashMap, sync::Arc, time::Instant};
use tokio::sync::{Mutex, mpsc, mpsc::error::TrySendError};
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;

use snaprestore_types::*;

use super::{actions, planner::PlannerConfig, worker, worker::WorkItem};
use crate::args::ControllerArgs;
use crate::elastic::EsClient;
use crate::store;
use crate::util::{
    Error, PROBE_INTERVAL, REQUEUE_DELAY,
    colors::{FG1, FG2},
    workload_name,
};

#[cfg(feature = "metrics")]
use crate::util::metrics::ControllerMetrics;

/// Entrypoint for the `RestoreTask` controller and its worker pool.
pub async fn run_controller(args: ControllerArgs) -> anyhow::Result<()> {
    println!("{}", "⚙️ Starting RestoreTask controller...".green());

    let pool = snaprestore_common::postgres::create_pool(args.postgres.clone()).await;
    store::init_schema(&pool).await?;
    let es = EsClient::new(&args.elastic)?;
    let planner = PlannerConfig::from_args(&args.restore)?;
    let client = Client::try_default().await?;

    let shutdown = CancellationToken::new();
    let shutdown_signal = shutdown.clone();
    tokio::spawn(async move {
        snaprestore_common::shutdown::shutdown_signal().await;
        shutdown_signal.cancel();
    });

    #[cfg(feature = "metrics")]
    let metrics = ControllerMetrics::new("restoretask_controller");
    #[cfg(feature = "metrics")]
    crate::util::metrics::maybe_spawn_metrics_server();

    // Bounded task channel plus semaphore: the reconciler submits without
    // blocking, the pool executes at most `concurrency` restores at a time.
    let (queue, rx) = mpsc::channel::<WorkItem>(args.restore.max_tasks.max(1));
    let worker_deps = Arc::new(worker::WorkerDeps {
        client: client.clone(),
        es,
        pool,
        restore_key: args.restore.restore_key.clone(),
        poll_interval: Duration::from_secs(args.restore.interval.max(1)),
        timeout: Duration::from_secs(args.restore.timeout.max(1) * 60),
        cancel: shutdown.clone(),
        #[cfg(feature = "metrics")]
        running_workers: metrics.running_workers.clone(),
    });
    let dispatcher = worker::start_dispatcher(
        rx,
        args.restore.concurrency.max(1),
        shutdown.clone(),
        move |item| worker::run_restore(worker_deps.clone(), item),
    );

    let context: Arc<ContextData> = Arc::new(ContextData::new(
        client.clone(),
        queue,
        planner,
        #[cfg(feature = "metrics")]
        metrics,
    ));

    // Namespace where we run both leader election and the controller.
    // This lets us keep RBAC namespaced rather than cluster-scoped.
    let lease_namespace = std::env::var("NAMESPACE").unwrap_or_else(|_| "default".to_string());
    // Unique identity per replica (Downward API POD_NAME is ideal).
    // Fallback to hostname if not present.
    let holder_id = std::env::var("POD_NAME")
        .or_else(|_| std::env::var("HOSTNAME"))
        .unwrap_or_else(|_| format!("snaprestore-task-controller-{}", uuid::Uuid::new_v4()));
    // The shared lock name across all replicas
    let lease_name = "snaprestore-task-controller-lock".to_string();
    // TTL: how long leadership is considered valid without renewal.
    // Renew should happen well before TTL expires.
    let lease_ttl = Duration::from_secs(15);
    let renew_every = Duration::from_secs(5);
    let leadership = LeaseLock::new(
        client.clone(),
        &lease_namespace,
        LeaseLockParams {
            holder_id,
            lease_name,
            lease_ttl,
        },
    );

    snaprestore_common::signal_ready();
    println!("{}", "🌱 RestoreTask controller standing by...".green());
    // We run indefinitely; only the leader runs the controller.
    // On leadership loss, we abort the controller and go back to standby.
    let mut controller_task: Option<tokio::task::JoinHandle<()>> = None;
    let mut tick = tokio::time::interval(renew_every);
    let result: anyhow::Result<()> = loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                if let Some(task) = controller_task.take() {
                    task.abort();
                    task.await.ok();
                }
                break Ok(());
            },
            _ = tick.tick() => {}
        }
        let lease = match leadership.try_acquire_or_renew().await {
            Ok(l) => l,
            Err(e) => {
                // If we can't talk to the apiserver / update Lease, assume we are not safe to lead.
                eprintln!("leader election renew/acquire failed: {e}");
                if let Some(task) = controller_task.take() {
                    task.abort();
                    eprintln!("aborted controller due to leader election error");
                }
                continue;
            }
        };
        if matches!(lease, LeaseLockResult::Acquired(_)) {
            // We are leader; ensure controller is running
            if controller_task.is_none() {
                println!("{}", "👑 Acquired leadership; starting controller".green());
                let context_for_controller = context.clone();
                let crd_api: Api<RestoreTask> =
                    Api::namespaced(client.clone(), &lease_namespace);
                controller_task = Some(tokio::spawn(async move {
                    println!("{}", "🚀 RestoreTask controller started.".green());
                    Controller::new(crd_api, Default::default())
                        .run(reconcile, on_error, context_for_controller)
                        .for_each(|_res| async move {})
                        .await;
                }));
            }
        } else if let Some(task) = controller_task.take() {
            // We are NOT leader; ensure controller is stopped
            eprintln!("lost leadership; stopping controller");
            task.abort();
        }
    };
    // In-flight restores observe the cancellation and record their state
    // before the dispatcher drains.
    dispatcher.await.ok();
    result
}

/// Context injected with each `reconcile` and `on_error` method invocation.
struct ContextData {
    /// Kubernetes client to make Kubernetes API requests with.
    client: Client,

    /// Bounded channel into the worker pool.
    queue: mpsc::Sender<WorkItem>,

    planner: PlannerConfig,

    /// Spec generation last handed to the worker pool, per resource.
    /// Re-reconciles of the same generation never enqueue twice.
    enqueued: Mutex<HashMap<(String, String), i64>>,

    #[cfg(feature = "metrics")]
    metrics: ControllerMetrics,

    last_action: Mutex<HashMap<(String, String), (TaskAction, Instant)>>,
}

impl ContextData {
    fn new(
        client: Client,
        queue: mpsc::Sender<WorkItem>,
        planner: PlannerConfig,
        #[cfg(feature = "metrics")] metrics: ControllerMetrics,
    ) -> Self {
        ContextData {
            client,
            queue,
            planner,
            enqueued: Mutex::new(HashMap::new()),
            #[cfg(feature = "metrics")]
            metrics,
            last_action: Mutex::new(HashMap::new()),
        }
    }
}

/// Action to be taken upon a `RestoreTask` resource during reconciliation
#[derive(Debug, PartialEq, Clone)]
enum TaskAction {
    /// First observation: stamp status.startAt and wait for the update.
    SetStartAt,

    /// The target node set does not exist yet.
    CreateNodeSet { node_set: Box<NodeSet> },

    /// The node set exists but asks for less storage than the task needs.
    ExpandStorage { store_size: String },

    /// Cluster mutation applied, workload not ready yet.
    AwaitWorkload { reason: String },

    /// Preconditions met: hand the task to the worker pool.
    Enqueue { generation: i64 },

    /// An unrecoverable condition was found.
    Failed { message: String },

    /// The resource is settled and requires no actions to be taken.
    NoOp,

    Requeue(Duration),
}

impl TaskAction {
    fn to_str(&self) -> &str {
        match self {
            TaskAction::SetStartAt => "SetStartAt",
            TaskAction::CreateNodeSet { .. } => "CreateNodeSet",
            TaskAction::ExpandStorage { .. } => "ExpandStorage",
            TaskAction::AwaitWorkload { .. } => "AwaitWorkload",
            TaskAction::Enqueue { .. } => "Enqueue",
            TaskAction::Failed { .. } => "Failed",
            TaskAction::NoOp => "NoOp",
            TaskAction::Requeue(_) => "Requeue",
        }
    }
}

/// Reconciliation function for the `RestoreTask` resource.
async fn reconcile(instance: Arc<RestoreTask>, context: Arc<ContextData>) -> Result<Action, Error> {
    let client: Client = context.client.clone();

    let namespace: String = match instance.namespace() {
        None => {
            return Err(Error::UserInput(
                "Expected RestoreTask resource to be namespaced.".to_owned(),
            ));
        }
        Some(namespace) => namespace,
    };

    let name = instance.name_any();

    #[cfg(feature = "metrics")]
    context
        .metrics
        .reconcile_counter
        .with_label_values(&[&name, &namespace])
        .inc();

    // Benchmark the read phase of reconciliation.
    #[cfg(feature = "metrics")]
    let start = std::time::Instant::now();

    // Read phase of reconciliation determines goal during the write phase.
    let action = determine_action(client.clone(), &name, &namespace, &instance, &context).await?;

    if action != TaskAction::NoOp {
        let value = {
            let mut la = context.last_action.lock().await;
            la.insert(
                (namespace.clone(), name.clone()),
                (action.clone(), Instant::now()),
            )
        };
        if value.is_none_or(|(last_action, last_instant)| {
            action != last_action || last_instant.elapsed() > Duration::from_secs(300)
        }) {
            println!(
                "🔧 {}{}{}{}{}",
                namespace.color(FG2),
                "/".color(FG1),
                name.color(FG2),
                " ACTION: ".color(FG1),
                action.to_str().color(FG2),
            );
        }
    }

    #[cfg(feature = "metrics")]
    context
        .metrics
        .read_histogram
        .with_label_values(&[&name, &namespace, action.to_str()])
        .observe(start.elapsed().as_secs_f64());

    #[cfg(feature = "metrics")]
    context
        .metrics
        .action_counter
        .with_label_values(&[&name, &namespace, action.to_str()])
        .inc();

    // Benchmark the write phase of reconciliation.
    #[cfg(feature = "metrics")]
    let timer = match action {
        TaskAction::NoOp => None,
        _ => Some(
            context
                .metrics
                .write_histogram
                .with_label_values(&[&name, &namespace, action.to_str()])
                .start_timer(),
        ),
    };

    let es_namespace = elasticsearch_namespace(&instance, &namespace);
    let es_name = instance.spec.elasticsearch_ref.name.clone();

    // Performs action as decided by the `determine_action` function.
    // This is the write phase of reconciliation.
    let result = match action {
        TaskAction::Requeue(duration) => Action::requeue(duration),
        TaskAction::SetStartAt => {
            actions::start(client, &instance).await?;
            // The status update triggers the next pass.
            Action::await_change()
        }
        TaskAction::CreateNodeSet { node_set } => {
            actions::append_node_set(client, &es_namespace, &es_name, *node_set).await?;
            Action::requeue(REQUEUE_DELAY)
        }
        TaskAction::ExpandStorage { store_size } => {
            actions::expand_storage(
                client,
                &es_namespace,
                &es_name,
                &instance.spec.node_name,
                &store_size,
            )
            .await?;
            Action::requeue(REQUEUE_DELAY)
        }
        TaskAction::AwaitWorkload { .. } => Action::requeue(REQUEUE_DELAY),
        TaskAction::Enqueue { generation } => {
            let item = WorkItem {
                task_id: instance.spec.task_id.clone(),
                namespace: namespace.clone(),
                name: name.clone(),
                node_name: instance.spec.node_name.clone(),
                indices: instance.spec.indices.clone(),
            };
            match context.queue.try_send(item) {
                Ok(()) => {
                    context
                        .enqueued
                        .lock()
                        .await
                        .insert((namespace.clone(), name.clone()), generation);
                    actions::running(client, &instance).await?;
                    Action::await_change()
                }
                Err(TrySendError::Full(_)) => {
                    // Backpressure: leave the resource on the queue's cadence
                    // instead of blocking the reconcile dispatcher.
                    println!(
                        "⏸️ {}{}{}{}",
                        namespace.color(FG2),
                        "/".color(FG1),
                        name.color(FG2),
                        " task channel full; requeueing".color(FG1),
                    );
                    Action::requeue(REQUEUE_DELAY)
                }
                Err(TrySendError::Closed(_)) => Action::requeue(REQUEUE_DELAY),
            }
        }
        TaskAction::Failed { message } => {
            actions::fail(client, &instance, message).await?;
            Action::await_change()
        }
        TaskAction::NoOp => Action::requeue(PROBE_INTERVAL),
    };

    #[cfg(feature = "metrics")]
    if let Some(timer) = timer {
        timer.observe_duration();
    }

    Ok(result)
}

fn elasticsearch_namespace(instance: &RestoreTask, namespace: &str) -> String {
    instance
        .spec
        .elasticsearch_ref
        .namespace
        .clone()
        .filter(|ns| !ns.is_empty())
        .unwrap_or_else(|| namespace.to_string())
}

/// Resources arrive into the reconciliation queue in a certain state. This
/// function looks at the observed state and decides the next action. The
/// finite set of possible actions is represented by the `TaskAction` enum.
async fn determine_action(
    client: Client,
    name: &str,
    namespace: &str,
    instance: &RestoreTask,
    context: &ContextData,
) -> Result<TaskAction, Error> {
    // Don't do anything while being deleted.
    if instance.metadata.deletion_timestamp.is_some() {
        return Ok(TaskAction::Requeue(Duration::from_secs(2)));
    }

    // A finished task never re-enters the pipeline.
    if instance
        .status
        .as_ref()
        .is_some_and(|s| s.status.is_terminal())
    {
        return Ok(TaskAction::NoOp);
    }

    if instance
        .status
        .as_ref()
        .is_none_or(|s| s.start_at.is_none())
    {
        return Ok(TaskAction::SetStartAt);
    }

    let es_namespace = elasticsearch_namespace(instance, namespace);
    let es_name = &instance.spec.elasticsearch_ref.name;
    let es = actions::get_elasticsearch(client.clone(), &es_namespace, es_name)
        .await?
        .ok_or_else(|| Error::ElasticsearchNotFound {
            namespace: es_namespace.clone(),
            name: es_name.clone(),
        })?;

    if let Some(action) = node_set_action(&context.planner, instance, &es)? {
        return Ok(action);
    }

    let sts = actions::get_statefulset(
        client,
        &es_namespace,
        &workload_name(es_name, &instance.spec.node_name),
    )
    .await?;
    if let Some(action) = workload_action(instance, es_name, sts.as_ref()) {
        return Ok(action);
    }

    // All preconditions hold; enqueue once per spec generation.
    let generation = instance.metadata.generation.unwrap_or_default();
    let already = {
        let enqueued = context.enqueued.lock().await;
        enqueued.get(&(namespace.to_string(), name.to_string())) == Some(&generation)
    };
    if already {
        return Ok(TaskAction::NoOp);
    }
    Ok(TaskAction::Enqueue { generation })
}

/// Node-set portion of the read phase: create it, grow it, or move on.
fn node_set_action(
    planner: &PlannerConfig,
    instance: &RestoreTask,
    es: &Elasticsearch,
) -> Result<Option<TaskAction>, Error> {
    let node_name = &instance.spec.node_name;
    let store_size = &instance.spec.store_size;
    let Some(existing) = es.spec.node_sets.iter().find(|n| &n.name == node_name) else {
        let node_set = super::planner::plan_node_set(planner, node_name, store_size);
        return Ok(Some(TaskAction::CreateNodeSet {
            node_set: Box::new(node_set),
        }));
    };
    let needs_expand = match existing.storage_request() {
        Some(current) => super::planner::exceeds(store_size, current)?,
        None => true,
    };
    if needs_expand {
        return Ok(Some(TaskAction::ExpandStorage {
            store_size: store_size.clone(),
        }));
    }
    Ok(None)
}

/// Workload portion of the read phase. `None` means ready to enqueue.
fn workload_action(
    instance: &RestoreTask,
    es_name: &str,
    sts: Option<&k8s_openapi::api::apps::v1::StatefulSet>,
) -> Option<TaskAction> {
    let sts_name = workload_name(es_name, &instance.spec.node_name);
    let Some(sts) = sts else {
        return Some(TaskAction::AwaitWorkload {
            reason: format!("StatefulSet {sts_name} not created yet"),
        });
    };
    // A StatefulSet with our derived name but a foreign owner means the name
    // collided with something we must not touch.
    if !actions::owned_by_elasticsearch(sts) {
        return Some(TaskAction::Failed {
            message: format!("StatefulSet {sts_name} is not owned by an Elasticsearch resource"),
        });
    }
    let desired = sts.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1);
    let ready = sts
        .status
        .as_ref()
        .and_then(|s| s.ready_replicas)
        .unwrap_or(0);
    if ready < desired {
        return Some(TaskAction::AwaitWorkload {
            reason: format!("StatefulSet {sts_name} ready {ready}/{desired}"),
        });
    }
    None
}

/// Actions to be taken when a reconciliation fails - for whatever reason.
/// Prints out the error to `stderr` and requeues the resource for another
/// reconciliation after five seconds.
fn on_error(instance: Arc<RestoreTask>, error: &Error, _context: Arc<ContextData>) -> Action {
    eprintln!(
        "{}",
        format!(
            "Reconciliation error for {}/{}: {error}",
            instance.namespace().unwrap_or_default(),
            instance.name_any()
        )
        .red()
    );
    Action::requeue(Duration::from_secs(5))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tasks::planner::plan_node_set;
    use k8s_openapi::api::apps::v1::{StatefulSet, StatefulSetSpec, StatefulSetStatus};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
    use std::collections::BTreeMap;

    fn planner() -> PlannerConfig {
        PlannerConfig {
            es_name: "es".to_string(),
            restore_key: "restore".to_string(),
            restore_count: 2,
            topology_key: "kubernetes.io/hostname".to_string(),
            storage_class: "standard".to_string(),
            container_name: "elasticsearch".to_string(),
            service_account: "default".to_string(),
            plugins: vec!["repository-s3".to_string()],
            limit_cpu: "4".to_string(),
            limit_mem: "8Gi".to_string(),
            request_cpu: "2".to_string(),
            request_mem: "4Gi".to_string(),
            labels: BTreeMap::new(),
            annotations: BTreeMap::new(),
            tolerations: BTreeMap::new(),
            node_affinity: None,
        }
    }

    fn task(store_size: &str) -> RestoreTask {
        RestoreTask::new(
            "restore-t1",
            RestoreTaskSpec {
                task_id: "T1".to_string(),
                node_name: "restore-abc".to_string(),
                store_size: store_size.to_string(),
                snapshot: SnapshotRef {
                    repository: "repo-1".to_string(),
                    snapshot: "snap-1".to_string(),
                },
                indices: vec!["idx-a".to_string()],
                elasticsearch_ref: ElasticsearchRef {
                    namespace: None,
                    name: "es".to_string(),
                },
            },
        )
    }

    fn cluster(node_sets: Vec<NodeSet>) -> Elasticsearch {
        let mut es = Elasticsearch::new("es", ElasticsearchSpec::default());
        es.spec.node_sets = node_sets;
        es
    }

    fn workload(owner_kind: &str, desired: i32, ready: i32) -> StatefulSet {
        let mut sts = StatefulSet::default();
        sts.metadata.name = Some("es-es-restore-abc".to_string());
        sts.metadata.owner_references = Some(vec![OwnerReference {
            api_version: "elasticsearch.k8s.elastic.co/v1".to_string(),
            kind: owner_kind.to_string(),
            name: "es".to_string(),
            uid: "uid-1".to_string(),
            ..Default::default()
        }]);
        sts.spec = Some(StatefulSetSpec {
            replicas: Some(desired),
            ..Default::default()
        });
        sts.status = Some(StatefulSetStatus {
            ready_replicas: Some(ready),
            ..Default::default()
        });
        sts
    }

    #[test]
    fn absent_node_set_is_created_with_requested_storage() {
        let action = node_set_action(&planner(), &task("100Gi"), &cluster(vec![]))
            .unwrap()
            .unwrap();
        let TaskAction::CreateNodeSet { node_set } = action else {
            panic!("expected CreateNodeSet, got {action:?}");
        };
        assert_eq!(node_set.name, "restore-abc");
        assert_eq!(node_set.count, Some(2));
        assert_eq!(node_set.storage_request().unwrap().0, "100Gi");
    }

    #[test]
    fn undersized_node_set_is_expanded() {
        let existing = plan_node_set(&planner(), "restore-abc", "50Gi");
        let action = node_set_action(&planner(), &task("100Gi"), &cluster(vec![existing]))
            .unwrap()
            .unwrap();
        assert_eq!(
            action,
            TaskAction::ExpandStorage {
                store_size: "100Gi".to_string()
            }
        );
    }

    #[test]
    fn sufficient_node_set_is_never_shrunk() {
        // Same size and larger-than-requested both fall through untouched.
        for current in ["100Gi", "200Gi"] {
            let existing = plan_node_set(&planner(), "restore-abc", current);
            let action = node_set_action(&planner(), &task("100Gi"), &cluster(vec![existing]))
                .unwrap();
            assert_eq!(action, None, "current {current} must not be patched");
        }
    }

    #[test]
    fn missing_workload_waits() {
        let action = workload_action(&task("100Gi"), "es", None).unwrap();
        assert!(matches!(action, TaskAction::AwaitWorkload { .. }));
    }

    #[test]
    fn unready_workload_waits() {
        let sts = workload("Elasticsearch", 2, 1);
        let action = workload_action(&task("100Gi"), "es", Some(&sts)).unwrap();
        assert!(matches!(action, TaskAction::AwaitWorkload { .. }));
    }

    #[test]
    fn ready_workload_clears_the_gate() {
        let sts = workload("Elasticsearch", 2, 2);
        assert_eq!(workload_action(&task("100Gi"), "es", Some(&sts)), None);
    }

    #[test]
    fn foreign_owner_is_terminal() {
        let sts = workload("Deployment", 2, 2);
        let action = workload_action(&task("100Gi"), "es", Some(&sts)).unwrap();
        assert!(matches!(action, TaskAction::Failed { .. }));
    }
}
