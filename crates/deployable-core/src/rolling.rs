//! Rolling-update planner: advances a bounded share of clusters per
//! reconcile tick toward a successor template.
//!
//! Works in stages -- subscription normalization, rolling initialization,
//! health gating, then the per-cluster advancement walk -- mirroring how
//! `stackable_operator`'s own multi-stage reconcilers (for example cluster
//! resource provisioning) thread intermediate state through a sequence of
//! small functions rather than one monolithic pass. The budget arithmetic
//! uses integer math -- `(len*pct+99)/100` -- rather than a floating-point
//! `ceil`, and stays a signed integer because the walk can drive it negative
//! (pre-existing overrides "spend" budget before the walk even starts).

use std::collections::BTreeMap;

use serde_json::Value;

use crate::model::{ClusterName, ClusterOverride, Overrides, ResourceUnitStatus};

const SUBSCRIPTION_KIND: &str = "Subscription";
const PACKAGE_OVERRIDES_PATH: &str = "spec.packageOverrides";

/// `ceil(propagated_len * pct / 100)`, computed with the same integer
/// formula as the Go source rather than floating-point division.
pub fn max_unavailable_budget(propagated_len: usize, pct: u32) -> i64 {
    ((propagated_len as u64) * (pct as u64) + 99) as i64 / 100
}

/// The result of one planning tick: the template and override list the
/// parent's spec should be written back with.
pub struct RollingUpdatePlan {
    pub template: Value,
    pub overrides: Vec<Overrides>,
}

/// Strips `spec.packageOverrides` from `template` if present, returning its
/// elements. Leaves `template` untouched (and returns nothing) if there is
/// no such array.
fn take_package_overrides(template: &mut Value) -> Vec<Value> {
    let Some(Value::Object(spec)) = template.get_mut("spec") else {
        return Vec::new();
    };
    match spec.remove("packageOverrides") {
        Some(Value::Array(items)) => items,
        Some(other) => {
            spec.insert("packageOverrides".to_string(), other);
            Vec::new()
        }
        None => Vec::new(),
    }
}

fn is_subscription(template: &Value) -> bool {
    template.get("kind").and_then(Value::as_str) == Some(SUBSCRIPTION_KIND)
}

/// Step 1: if the parent's template is a `Subscription`, strip
/// `spec.packageOverrides` from both templates and synthesize one
/// [`ClusterOverride`] per extracted package-override entry.
fn normalize_subscription_templates(
    parent_template: &mut Value,
    target_template: &mut Value,
) -> Vec<ClusterOverride> {
    if !is_subscription(parent_template) {
        return Vec::new();
    }

    let extracted = take_package_overrides(target_template);
    take_package_overrides(parent_template);

    extracted
        .into_iter()
        .map(|value| ClusterOverride {
            path: PACKAGE_OVERRIDES_PATH.to_string(),
            value,
        })
        .collect()
}

/// The full diff from the new (target) template back to the old (parent)
/// template, expressed as one override patch per top-level field that
/// differs -- the granularity the override engine itself works at. Applied
/// over the target template this reconstructs the parent's current
/// (pre-roll) effective template, which is exactly what a not-yet-advanced
/// cluster should keep seeing.
fn holdback_patches(old_template: &Value, new_template: &Value) -> Vec<ClusterOverride> {
    let old_fields = old_template.as_object();
    let new_fields = new_template.as_object();

    let Some(old_fields) = old_fields else {
        return Vec::new();
    };

    old_fields
        .iter()
        .filter(|(key, value)| {
            new_fields
                .and_then(|new_fields| new_fields.get(key.as_str()))
                .map(|new_value| new_value != *value)
                .unwrap_or(true)
        })
        .map(|(key, value)| ClusterOverride {
            path: key.clone(),
            value: value.clone(),
        })
        .collect()
}

/// Runs one rolling-update tick. `parent_template`/`parent_overrides` and
/// `target_template`/`target_overrides` are the current decoded state of
/// the hub Deployable and its rolling-update target, respectively.
/// `propagated_status` is the parent's current `status.propagatedStatus`.
pub fn plan_rolling_update(
    max_unavailable_pct: u32,
    parent_template: &Value,
    parent_overrides: &[Overrides],
    propagated_status: &BTreeMap<ClusterName, ResourceUnitStatus>,
    target_template: &Value,
    target_overrides: &[Overrides],
) -> RollingUpdatePlan {
    let mut parent_template = parent_template.clone();
    let mut target_template = target_template.clone();

    let synthesized = normalize_subscription_templates(&mut parent_template, &mut target_template);

    let mut budget = max_unavailable_budget(propagated_status.len(), max_unavailable_pct);

    let (mut working_template, mut working_overrides) = if parent_template != target_template {
        let holdback = holdback_patches(&parent_template, &target_template);

        let mut override_map: BTreeMap<ClusterName, Overrides> = propagated_status
            .keys()
            .map(|cluster| {
                (
                    cluster.clone(),
                    Overrides {
                        cluster_name: cluster.clone(),
                        cluster_overrides: holdback.clone(),
                    },
                )
            })
            .collect();

        budget -= parent_overrides.len() as i64;
        budget -= target_overrides.len() as i64;

        for ov in target_overrides {
            override_map.insert(ov.cluster_name.clone(), ov.clone());
        }

        for ov in override_map.values_mut() {
            ov.cluster_overrides.extend(synthesized.iter().cloned());
        }

        (target_template.clone(), override_map.into_values().collect())
    } else {
        (parent_template.clone(), parent_overrides.to_vec())
    };

    for status in propagated_status.values() {
        if status.phase != Some(crate::model::DeployablePhase::Deployed) {
            budget -= 1;
        }
    }

    let mut target_override_map: BTreeMap<ClusterName, Overrides> = BTreeMap::new();
    for ov in target_overrides {
        let mut ov = ov.clone();
        ov.cluster_overrides.extend(synthesized.iter().cloned());
        target_override_map.insert(ov.cluster_name.clone(), ov);
    }

    let mut advanced = Vec::with_capacity(working_overrides.len());
    for ov in working_overrides.drain(..) {
        if let Some(target_ov) = target_override_map.get(&ov.cluster_name) {
            advanced.push(target_ov.clone());
        } else if budget > 0 {
            budget -= 1;
        } else {
            advanced.push(ov);
        }
    }

    RollingUpdatePlan {
        template: working_template,
        overrides: advanced,
    }
}

/// Override validation companion to the planner: drop entries whose
/// `clusterName` is no longer in `propagatedStatus` before any non-rolling
/// reconcile.
pub fn validate_overrides_for_rolling_update(
    overrides: &[Overrides],
    propagated_status: &BTreeMap<ClusterName, ResourceUnitStatus>,
) -> Vec<Overrides> {
    overrides
        .iter()
        .filter(|ov| propagated_status.contains_key(&ov.cluster_name))
        .cloned()
        .collect()
}
