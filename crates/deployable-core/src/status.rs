//! Status aggregator: folds each child's observed phase into the parent's.
//!
//! If any child failed, the parent failed; if any child is still
//! propagating, so is the parent; only a fully-deployed, fully-populated
//! child set promotes the parent to `Deployed`. Callers compare the folded
//! result against the previously-saved status before writing it back, the
//! way a reconcile loop avoids a needless status update when nothing
//! actually changed.

use std::collections::BTreeMap;

use crate::model::{ClusterName, DeployablePhase, DeployableStatus, ResourceUnitStatus};

/// One child's observed phase, keyed by the cluster it lives in.
pub struct ChildObservation {
    pub cluster: ClusterName,
    pub status: ResourceUnitStatus,
}

/// Folds child observations into the parent phase. `target_cluster_count`
/// is `|target clusters|` from the current placement resolution -- needed to
/// distinguish "every existing child is deployed" from "every desired child
/// is deployed" when children are still being created.
pub fn aggregate_phase(
    observations: &[ChildObservation],
    target_cluster_count: usize,
) -> DeployablePhase {
    if observations
        .iter()
        .any(|o| o.status.phase == Some(DeployablePhase::Failed))
    {
        return DeployablePhase::Failed;
    }

    let propagating_or_unacknowledged = observations
        .iter()
        .any(|o| !matches!(o.status.phase, Some(DeployablePhase::Deployed)));

    if propagating_or_unacknowledged {
        return DeployablePhase::Propagating;
    }

    if observations.len() == target_cluster_count && target_cluster_count > 0 {
        return DeployablePhase::Deployed;
    }

    DeployablePhase::Unknown
}

/// Builds the `propagatedStatus` map from child observations: exactly the
/// set of currently existing children's clusters.
pub fn propagated_status_map(
    observations: &[ChildObservation],
) -> BTreeMap<ClusterName, ResourceUnitStatus> {
    observations
        .iter()
        .map(|o| (o.cluster.clone(), o.status.clone()))
        .collect()
}

/// Applies the aggregate to `status` in place, returning whether anything
/// changed. Callers only persist the status write when this returns `true`
/// and the parent carries no finalizers.
pub fn apply_aggregate(
    status: &mut DeployableStatus,
    observations: &[ChildObservation],
    target_cluster_count: usize,
    now: impl Fn() -> String,
) -> bool {
    let new_phase = aggregate_phase(observations, target_cluster_count);
    let new_propagated = propagated_status_map(observations);

    let changed = status.phase != Some(new_phase) || status.propagated_status != new_propagated;

    status.phase = Some(new_phase);
    status.propagated_status = new_propagated;

    if changed {
        status.last_update_time = Some(now());
    }

    changed
}
