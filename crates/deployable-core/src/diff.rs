//! Child identity and diff.
//!
//! A child's identity is the `host-deployable` annotation it carries, set to
//! the parent's `namespace/name`; the child's own name comes from the
//! `generateName` the store assigns on creation. This mirrors the
//! label-scoped desired-vs-observed reconciliation
//! `ClusterResources::delete_orphaned_resources_of_kind` runs in
//! `stackable_operator`, except keyed on one annotation per parent instead of
//! a cluster-wide label set.

use std::collections::BTreeMap;

use kube::ResourceExt;

use crate::{
    kvp::{self, host_deployable, HOST_DEPLOYABLE_ANNOTATION},
    model::{ClusterCoordinate, Deployable},
    overrides::apply_overrides,
    Error, Result,
};

/// A child Deployable this parent should have, before being matched against
/// what's observed.
#[derive(Clone, Debug, PartialEq)]
pub struct DesiredChild {
    pub cluster: ClusterCoordinate,
    pub template: serde_json::Value,
    pub annotations: BTreeMap<String, String>,
    pub labels: BTreeMap<String, String>,
}

/// The outcome of comparing desired children against the observed set in
/// one cluster namespace.
#[derive(Debug)]
pub enum ChildAction {
    Create(DesiredChild),
    Update { existing: Deployable, desired: DesiredChild },
    Delete(Deployable),
    Unchanged(Deployable),
}

/// Builds the desired child set: one entry per resolved cluster, with the
/// per-cluster override patches already applied to the template and the
/// identity annotation (`host-deployable = parent_key`) that every child of
/// `parent_key` must carry.
pub fn desired_children(
    parent_key: &str,
    template: &serde_json::Value,
    overrides: &[crate::model::Overrides],
    clusters: &[ClusterCoordinate],
) -> Result<Vec<DesiredChild>> {
    let overrides_by_cluster: BTreeMap<_, _> = overrides
        .iter()
        .map(|o| (o.cluster_name.clone(), o.cluster_overrides.as_slice()))
        .collect();

    clusters
        .iter()
        .map(|cluster| {
            let patches = overrides_by_cluster
                .get(&cluster.name)
                .copied()
                .unwrap_or_default();
            let merged = apply_overrides(template, &cluster.name, patches)?;
            Ok(DesiredChild {
                cluster: cluster.clone(),
                template: merged,
                annotations: child_annotations(parent_key),
                labels: BTreeMap::new(),
            })
        })
        .collect()
}

/// Matches `desired` against `observed` (everything currently carrying
/// `host-deployable = parent_key` across the resolved namespaces) and
/// classifies each pairing. `observed` need not be pre-filtered by cluster;
/// entries whose cluster no longer appears in `desired` are slated for
/// deletion -- this is how a placement change garbage-collects children.
pub fn diff_children(
    parent_key: &str,
    desired: Vec<DesiredChild>,
    observed: Vec<Deployable>,
) -> Result<Vec<ChildAction>> {
    // One child per cluster namespace: identity is the namespace the child
    // lives in, not the generated name it happens to carry.
    let mut observed_by_namespace: BTreeMap<String, Deployable> = BTreeMap::new();
    for child in observed {
        let annotations = child.annotations();
        let matches_parent = host_deployable(annotations) == Some(parent_key);
        if !matches_parent {
            continue;
        }
        let namespace = child.namespace().ok_or(Error::MissingObjectKey {
            key: "namespace",
        })?;
        observed_by_namespace.insert(namespace, child);
    }

    let mut actions = Vec::with_capacity(desired.len());
    let mut remaining = observed_by_namespace;

    for child in desired {
        match remaining.remove(&child.cluster.namespace) {
            Some(existing) => {
                if child_matches_desired(&existing, &child) {
                    actions.push(ChildAction::Unchanged(existing));
                } else {
                    actions.push(ChildAction::Update {
                        existing,
                        desired: child,
                    });
                }
            }
            None => actions.push(ChildAction::Create(child)),
        }
    }

    actions.extend(remaining.into_values().map(ChildAction::Delete));
    Ok(actions)
}

/// A child is unchanged only if its template, non-system annotations and
/// non-system labels all match what's desired -- template equality alone
/// would miss a cluster-override-only change or a manual label/annotation
/// edit the next sync needs to repair. System-managed keys
/// (`kvp::is_system_key`) are excluded on both sides so the API server's own
/// bookkeeping never reads as drift.
fn child_matches_desired(existing: &Deployable, desired: &DesiredChild) -> bool {
    existing.spec.decoded_template() == desired.template
        && kvp::non_system(existing.annotations()) == kvp::non_system(&desired.annotations)
        && kvp::non_system(existing.labels()) == kvp::non_system(&desired.labels)
}

/// Annotations a newly created child carries: identity back-pointer to the
/// parent plus whatever the caller wants layered on top.
pub fn child_annotations(parent_key: &str) -> std::collections::BTreeMap<String, String> {
    let mut annotations = std::collections::BTreeMap::new();
    annotations.insert(HOST_DEPLOYABLE_ANNOTATION.to_string(), parent_key.to_string());
    annotations
}
