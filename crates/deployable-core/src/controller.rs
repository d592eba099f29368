//! Reconciler driver and the work-queue around it: a dedup work-queue that
//! keeps at most one worker active per parent key, with events arriving
//! mid-reconcile coalescing into a single pending re-entry.
//!
//! The queue is hand-rolled rather than handed to `kube::runtime::Controller`'s
//! built-in scheduler, because the dedup/coalescing semantics wanted here
//! (one worker per key, exactly one pending re-entry) are precise enough
//! that a bespoke `tokio::sync::mpsc` loop is the more direct translation.

use std::{
    collections::HashSet,
    sync::Arc,
};

use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::{Resource, ResourceExt};
use tokio::sync::{mpsc, Mutex};

use crate::{
    diff::{self, ChildAction},
    error::store::StoreError,
    kvp,
    model::{Cluster, ClusterName, Deployable, DeployablePhase, DeployableSpec, ObjectKey, PlacementRule},
    placement,
    rolling,
    status::{self, ChildObservation},
    store::{EventSink, EventType, ObjectStore, ResourceVersion},
    Error, Result,
};

/// The collaborators a reconcile needs: three typed object stores and an
/// event sink. Borrowed for the duration of one [`reconcile`] call.
pub struct Drivers<'a> {
    pub deployables: &'a dyn ObjectStore<Deployable>,
    pub clusters: &'a dyn ObjectStore<Cluster>,
    pub placement_rules: &'a dyn ObjectStore<PlacementRule>,
    pub events: &'a dyn EventSink,
}

#[derive(Debug, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// Nothing further to do until the next event.
    Settled,
    /// An optimistic-concurrency conflict was observed; re-run against the
    /// latest state without treating this as an error.
    Requeue,
}

/// Runs one full reconcile tick for `key`: resolve placement, diff and sync
/// the child set, aggregate status, and -- if a rolling-update target is
/// named -- advance the planner by one tick.
#[tracing::instrument(skip(drivers, now), fields(namespace = %key.namespace, name = %key.name))]
pub async fn reconcile(
    drivers: &Drivers<'_>,
    key: &ObjectKey,
    now: impl Fn() -> String,
) -> Result<ReconcileOutcome> {
    let (mut parent, version) = match drivers.deployables.get(key).await {
        Ok(found) => found,
        Err(StoreError::NotFound { .. }) => return reap_orphaned_children(drivers, key).await,
        Err(source) => {
            return Err(Error::TransientStore {
                action: "fetching parent deployable".to_string(),
                source,
            })
        }
    };

    let parent_key = key.to_string();
    let annotations = parent.annotations().clone();
    let has_finalizers = !parent.finalizers().is_empty();

    let mut status = parent.status.clone().unwrap_or_default();
    parent.spec.overrides =
        rolling::validate_overrides_for_rolling_update(&parent.spec.overrides, &status.propagated_status);

    let original_template = parent.spec.template.clone();
    let original_overrides = parent.spec.overrides.clone();

    match handle_deployable(drivers, &parent, &annotations, &parent_key, &status).await {
        Ok(Outcome {
            template,
            overrides,
            observations,
            target_cluster_count,
        }) => {
            parent.spec.template = Some(template);
            parent.spec.overrides = overrides;
            status.reason = None;
            status.message = None;
            status::apply_aggregate(&mut status, &observations, target_cluster_count, &now);
        }
        Err(Error::MalformedOverride { cluster, path, reason }) => {
            status.phase = Some(DeployablePhase::Failed);
            status.propagated_status.clear();
            status.reason = Some(format!(
                "malformed override {path:?} for cluster {cluster}: {reason}"
            ));
            status.last_update_time = Some(now());
        }
        Err(Error::OverridePathUnsupported { cluster, path }) => {
            status.phase = Some(DeployablePhase::Failed);
            status.propagated_status.clear();
            status.reason = Some(format!(
                "override path {path:?} for cluster {cluster} is unsupported"
            ));
            status.last_update_time = Some(now());
        }
        Err(Error::MalformedTemplate { key, reason }) => {
            status.phase = Some(DeployablePhase::Failed);
            status.propagated_status.clear();
            status.reason = Some(format!("malformed template for {key}: {reason}"));
            status.last_update_time = Some(now());
        }
        Err(other) => return Err(other),
    }

    let spec_changed =
        parent.spec.template != original_template || parent.spec.overrides != original_overrides;

    let mut current_version = version;

    if spec_changed {
        match drivers.deployables.update(parent.clone(), &current_version).await {
            Ok(saved) => {
                current_version = ResourceVersion(saved.resource_version().unwrap_or_default());
                parent = saved;
            }
            Err(StoreError::Conflict { .. }) => return Ok(ReconcileOutcome::Requeue),
            Err(source) => {
                return Err(Error::TransientStore {
                    action: "writing parent spec".to_string(),
                    source,
                })
            }
        }
    }

    let status_changed = parent.status.as_ref() != Some(&status);
    if status_changed && !has_finalizers {
        parent.status = Some(status);
        match drivers
            .deployables
            .update_status(parent, &current_version)
            .await
        {
            Ok(_) => {}
            Err(StoreError::Conflict { .. }) => return Ok(ReconcileOutcome::Requeue),
            Err(source) => {
                return Err(Error::TransientStore {
                    action: "writing parent status".to_string(),
                    source,
                })
            }
        }
    }

    Ok(ReconcileOutcome::Settled)
}

/// The parent named by `key` is gone: sweeps every Deployable still carrying
/// `host-deployable = key` and deletes it. Mirrors
/// `ClusterResources::delete_orphaned_resources_of_kind` with an empty
/// desired set -- there is no parent left to keep anything for.
async fn reap_orphaned_children(drivers: &Drivers<'_>, key: &ObjectKey) -> Result<ReconcileOutcome> {
    let parent_key = key.to_string();
    let observed = drivers
        .deployables
        .list(None, None)
        .await
        .map_err(|source| Error::TransientStore {
            action: "listing children for orphan sweep".to_string(),
            source,
        })?;

    for child in observed {
        if kvp::host_deployable(child.annotations()) != Some(parent_key.as_str()) {
            continue;
        }
        let child_key = ObjectKey::new(
            child.namespace().unwrap_or_default(),
            child.name_any(),
        );
        if let Err(source) = drivers.deployables.delete(&child_key).await {
            tracing::warn!(child = %child_key, error = %source, "failed deleting orphaned child");
        }
    }

    Ok(ReconcileOutcome::Settled)
}

struct Outcome {
    template: serde_json::Value,
    overrides: Vec<crate::model::Overrides>,
    observations: Vec<ChildObservation>,
    target_cluster_count: usize,
}

async fn handle_deployable(
    drivers: &Drivers<'_>,
    parent: &Deployable,
    annotations: &std::collections::BTreeMap<String, String>,
    parent_key: &str,
    status: &crate::model::DeployableStatus,
) -> Result<Outcome> {
    let clusters = match &parent.spec.placement {
        Some(p) => {
            placement::resolve_clusters(
                &parent.namespace().unwrap_or_default(),
                p,
                drivers.placement_rules,
                drivers.clusters,
            )
            .await?
        }
        None => Vec::new(),
    };

    let template = parent.spec.decoded_template();
    let desired = diff::desired_children(parent_key, &template, &parent.spec.overrides, &clusters)?;

    let observed = drivers
        .deployables
        .list(None, None)
        .await
        .map_err(|source| Error::TransientStore {
            action: "listing children".to_string(),
            source,
        })?;

    let actions = diff::diff_children(parent_key, desired, observed)?;

    let mut observations = Vec::with_capacity(actions.len());
    for action in actions {
        if let Some(observation) = apply_child_action(drivers, parent, parent_key, action).await {
            observations.push(observation);
        }
    }

    let (final_template, final_overrides) = match kvp::rolling_update_target(annotations) {
        Some(target_name) => {
            let target_key = ObjectKey::new(parent.namespace().unwrap_or_default(), target_name);
            match drivers.deployables.get(&target_key).await {
                Ok((target, _)) => {
                    let pct = kvp::max_unavailable_percent(annotations);
                    let plan = rolling::plan_rolling_update(
                        pct,
                        &template,
                        &parent.spec.overrides,
                        &status.propagated_status,
                        &target.spec.decoded_template(),
                        &target.spec.overrides,
                    );
                    (plan.template, plan.overrides)
                }
                Err(StoreError::NotFound { .. }) => (template, parent.spec.overrides.clone()),
                Err(source) => {
                    return Err(Error::TransientStore {
                        action: "fetching rolling-update target".to_string(),
                        source,
                    })
                }
            }
        }
        None => (template, parent.spec.overrides.clone()),
    };

    Ok(Outcome {
        template: final_template,
        overrides: final_overrides,
        observations,
        target_cluster_count: clusters.len(),
    })
}

async fn apply_child_action(
    drivers: &Drivers<'_>,
    parent: &Deployable,
    parent_key: &str,
    action: ChildAction,
) -> Option<ChildObservation> {
    match action {
        ChildAction::Create(desired) => {
            let mut child = Deployable::new(
                "",
                DeployableSpec {
                    template: Some(desired.template),
                    placement: None,
                    overrides: Vec::new(),
                },
            );
            child.meta_mut().namespace = Some(desired.cluster.namespace.clone());
            child.meta_mut().generate_name = Some(format!("{}-", parent.name_any()));
            child.meta_mut().annotations = Some(desired.annotations);
            if !desired.labels.is_empty() {
                child.meta_mut().labels = Some(desired.labels);
            }
            child.meta_mut().owner_references = Some(vec![owner_reference(parent)]);

            match drivers.deployables.create(child).await {
                Ok(created) => {
                    drivers
                        .events
                        .record(
                            &ObjectKey::new(parent.namespace().unwrap_or_default(), parent.name_any()),
                            EventType::Normal,
                            "ChildCreated",
                            &format!("created child deployable in {}", desired.cluster.namespace),
                        )
                        .await;
                    Some(observation_from(&desired.cluster.name, &created))
                }
                Err(source) => {
                    drivers
                        .events
                        .record(
                            &ObjectKey::new(parent.namespace().unwrap_or_default(), parent.name_any()),
                            EventType::Warning,
                            "ChildCreateFailed",
                            &source.to_string(),
                        )
                        .await;
                    None
                }
            }
        }
        ChildAction::Update { existing, desired } => {
            let expected = ResourceVersion(existing.resource_version().unwrap_or_default());
            let mut updated = existing;
            updated.spec.template = Some(desired.template);
            updated.meta_mut().annotations = Some(desired.annotations);
            if !desired.labels.is_empty() {
                updated.meta_mut().labels = Some(desired.labels);
            }

            match drivers.deployables.update(updated, &expected).await {
                Ok(saved) => Some(observation_from(&desired.cluster.name, &saved)),
                Err(_conflict_or_transient) => None,
            }
        }
        ChildAction::Delete(existing) => {
            let key = ObjectKey::new(
                existing.namespace().unwrap_or_default(),
                existing.name_any(),
            );
            let _ = drivers.deployables.delete(&key).await;
            None
        }
        ChildAction::Unchanged(existing) => {
            let cluster = existing.namespace().unwrap_or_default();
            Some(observation_from(&cluster, &existing))
        }
    }
}

/// Builds the controller [`OwnerReference`] stamped on every created child,
/// so a real Kubernetes cluster's own garbage collector cascades the delete
/// when the parent goes away, independent of [`reap_orphaned_children`].
fn owner_reference(parent: &Deployable) -> OwnerReference {
    OwnerReference {
        api_version: Deployable::api_version(&()).to_string(),
        kind: Deployable::kind(&()).to_string(),
        name: parent.name_any(),
        uid: parent.uid().unwrap_or_default(),
        controller: Some(true),
        block_owner_deletion: Some(true),
    }
}

/// The §4.4 update-suppression predicate: a parent-watch event is worth a
/// reconcile only if it carries a finalizer, a hosting back-reference, or a
/// change to the non-system annotations/labels/decoded template -- anything
/// else (status-only writes, system label churn) is noise this controller
/// doesn't act on.
pub fn should_enqueue_update(old: &Deployable, new: &Deployable) -> bool {
    !new.finalizers().is_empty()
        || kvp::host_deployable(new.annotations()).is_some()
        || kvp::non_system(old.annotations()) != kvp::non_system(new.annotations())
        || kvp::non_system(old.labels()) != kvp::non_system(new.labels())
        || old.spec.decoded_template() != new.spec.decoded_template()
}

fn observation_from(cluster: &ClusterName, child: &Deployable) -> ChildObservation {
    let status = child
        .status
        .clone()
        .map(|s| crate::model::ResourceUnitStatus {
            phase: s.phase.or(Some(DeployablePhase::Propagating)),
            last_update: s.last_update_time,
            reason: s.reason,
        })
        .unwrap_or(crate::model::ResourceUnitStatus {
            phase: Some(DeployablePhase::Propagating),
            last_update: None,
            reason: None,
        });
    ChildObservation {
        cluster: cluster.clone(),
        status,
    }
}

/// Inverse-index mapper: translates a change on child/parent
/// `x` into the set of parent keys that must be re-enqueued -- `x` itself,
/// every Deployable in `x`'s namespace whose `rolling-update-target` names
/// `x` (rolling watchers), and the parent `x.host-deployable` points at.
pub fn map_change_to_parent_keys(
    changed: &Deployable,
    siblings_in_namespace: &[Deployable],
) -> Vec<ObjectKey> {
    let mut keys = Vec::new();
    let own_key = ObjectKey::new(
        changed.namespace().unwrap_or_default(),
        changed.name_any(),
    );
    keys.push(own_key.clone());

    for sibling in siblings_in_namespace {
        let annotations = sibling.annotations();
        if kvp::rolling_update_target(annotations) == Some(changed.name_any().as_str()) {
            keys.push(ObjectKey::new(
                sibling.namespace().unwrap_or_default(),
                sibling.name_any(),
            ));
        }
    }

    if let Some(parent_key) = kvp::host_deployable(changed.annotations()) {
        if let Some((namespace, name)) = parent_key.split_once('/') {
            keys.push(ObjectKey::new(namespace, name));
        }
    }

    keys
}

/// A deduplicating work-queue keyed by parent `(namespace, name)`: at most
/// one worker is active per key, and events arriving while a key is in
/// flight coalesce into a single pending re-entry rather than queuing once
/// per event.
pub struct WorkQueue {
    sender: mpsc::UnboundedSender<ObjectKey>,
    pending: Arc<Mutex<HashSet<ObjectKey>>>,
}

impl WorkQueue {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ObjectKey>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (
            Self {
                sender,
                pending: Arc::new(Mutex::new(HashSet::new())),
            },
            receiver,
        )
    }

    /// Enqueues `key` unless it is already pending (queued or actively being
    /// worked). Returns `false` if the enqueue coalesced into existing work.
    pub async fn enqueue(&self, key: ObjectKey) -> bool {
        let mut pending = self.pending.lock().await;
        if pending.insert(key.clone()) {
            let _ = self.sender.send(key);
            true
        } else {
            false
        }
    }

    /// Called by a worker once it has fetched `key` off the channel and is
    /// about to reconcile it, freeing the key up to be re-queued by a
    /// concurrent event without racing the reconcile that's about to start.
    pub async fn mark_in_flight(&self, key: &ObjectKey) {
        self.pending.lock().await.remove(key);
    }
}
