//! CLI and boot wiring for the Deployable propagation controller: argument
//! parsing, `tracing` setup, construction of the Kubernetes-backed stores,
//! and the worker pool that drives `deployable_core::controller::reconcile`.

mod kube_store;

use std::{sync::Arc, time::Duration};

use clap::Parser;
use deployable_core::{
    controller::{self, Drivers, ReconcileOutcome, WorkQueue},
    model::{Cluster, Deployable, ObjectKey, PlacementRule},
    store::{EventSink, ObjectStore, TracingEventSink, Watch, WatchEvent},
};
use futures::StreamExt;
use kube::{Client, ResourceExt};
use tokio::sync::Mutex;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use kube_store::KubeStore;

/// CLI arguments, modeled on `stackable_operator::cli::RunArguments`: the
/// shape is a namespace restriction, a worker-count knob, and a resync
/// interval.
#[derive(Debug, Parser)]
#[command(author, version, long_about = None)]
struct RunArguments {
    /// Restrict the controller to a single namespace. Unset watches every
    /// namespace the client's credentials can see.
    #[arg(long, env)]
    watch_namespace: Option<String>,

    /// Number of concurrent reconcile workers draining the work-queue.
    #[arg(long, env, default_value_t = 4)]
    workers: usize,

    /// Fallback full-resync interval, in seconds. Covers changes this
    /// controller does not watch directly (Cluster/PlacementRule edits),
    /// since placement is re-resolved from live state on every tick.
    #[arg(long, env, default_value_t = 300)]
    resync_interval_secs: u64,
}

/// The driver's three typed stores plus its event sink, owned for the
/// lifetime of the process. Each worker borrows from its own `Arc` clone for
/// the duration of one `reconcile` call; see [`Drivers`].
struct AppState {
    deployables: KubeStore<Deployable>,
    clusters: KubeStore<Cluster>,
    placement_rules: KubeStore<PlacementRule>,
    events: TracingEventSink,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env("DEPLOYABLE_CONTROLLER_LOG")
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn now() -> String {
    chrono::Utc::now().to_rfc3339()
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let args = RunArguments::parse();

    let client = Client::try_default().await?;

    let state = Arc::new(AppState {
        deployables: KubeStore::new(client.clone()),
        clusters: KubeStore::new(client.clone()),
        placement_rules: KubeStore::new(client.clone()),
        events: TracingEventSink,
    });

    let (queue, receiver) = WorkQueue::new();
    let queue = Arc::new(queue);
    let receiver = Arc::new(Mutex::new(receiver));

    for worker_id in 0..args.workers.max(1) {
        spawn_worker(worker_id, Arc::clone(&state), Arc::clone(&queue), Arc::clone(&receiver));
    }

    spawn_deployable_watch(Arc::clone(&state), Arc::clone(&queue), args.watch_namespace.clone());
    spawn_resync_loop(
        Arc::clone(&state),
        Arc::clone(&queue),
        args.watch_namespace.clone(),
        Duration::from_secs(args.resync_interval_secs),
    );

    tracing::info!(
        workers = args.workers,
        watch_namespace = args.watch_namespace.as_deref().unwrap_or("<all>"),
        "deployable-controller started"
    );

    std::future::pending::<()>().await;
    Ok(())
}

/// One of `args.workers` cooperative workers: pulls the next parent key off
/// the shared receiver, frees it from the pending set so a concurrent event
/// can re-queue it, then runs one reconcile tick.
fn spawn_worker(
    worker_id: usize,
    state: Arc<AppState>,
    queue: Arc<WorkQueue>,
    receiver: Arc<Mutex<tokio::sync::mpsc::UnboundedReceiver<ObjectKey>>>,
) {
    tokio::spawn(async move {
        loop {
            let key = {
                let mut receiver = receiver.lock().await;
                receiver.recv().await
            };
            let Some(key) = key else {
                break;
            };

            queue.mark_in_flight(&key).await;

            let drivers = Drivers {
                deployables: &state.deployables,
                clusters: &state.clusters,
                placement_rules: &state.placement_rules,
                events: &state.events,
            };

            match controller::reconcile(&drivers, &key, now).await {
                Ok(ReconcileOutcome::Settled) => {
                    tracing::debug!(worker_id, key = %key, "reconcile settled");
                }
                Ok(ReconcileOutcome::Requeue) => {
                    tracing::debug!(worker_id, key = %key, "requeueing after conflict");
                    queue.enqueue(key).await;
                }
                Err(err) => {
                    state
                        .events
                        .record(&key, deployable_core::store::EventType::Warning, "ReconcileError", &err.to_string())
                        .await;
                    tracing::error!(worker_id, key = %key, error = %err, "reconcile failed");
                }
            }
        }
    });
}

/// Subscribes to Deployable add/update/delete and runs every change through
/// the inverse-index mapper to enqueue the parent keys it affects.
fn spawn_deployable_watch(state: Arc<AppState>, queue: Arc<WorkQueue>, watch_namespace: Option<String>) {
    tokio::spawn(async move {
        let mut events = state.deployables.watch(watch_namespace.as_deref()).await;
        while let Some(event) = events.next().await {
            let changed = match event {
                WatchEvent::Added { new } => new,
                WatchEvent::Modified { old, new } => {
                    if !controller::should_enqueue_update(&old, &new) {
                        continue;
                    }
                    new
                }
                WatchEvent::Deleted { old } => old,
            };

            let namespace = changed.namespace().unwrap_or_default();
            let siblings = match state.deployables.list(Some(&namespace), None).await {
                Ok(siblings) => siblings,
                Err(err) => {
                    tracing::warn!(error = %err, namespace, "failed listing siblings for inverse-index mapping");
                    continue;
                }
            };

            for key in controller::map_change_to_parent_keys(&changed, &siblings) {
                queue.enqueue(key).await;
            }
        }
    });
}

/// A periodic full re-list, enqueueing every Deployable in scope. Covers
/// drift this controller has no direct watch for -- Cluster/PlacementRule
/// edits -- since placement is re-resolved from live state every tick
/// regardless of what triggered it.
fn spawn_resync_loop(
    state: Arc<AppState>,
    queue: Arc<WorkQueue>,
    watch_namespace: Option<String>,
    interval: Duration,
) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            match state.deployables.list(watch_namespace.as_deref(), None).await {
                Ok(all) => {
                    for obj in &all {
                        let key = ObjectKey::new(obj.namespace().unwrap_or_default(), obj.name_any());
                        queue.enqueue(key).await;
                    }
                }
                Err(err) => tracing::warn!(error = %err, "full resync listing failed"),
            }
        }
    });
}
