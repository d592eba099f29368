//! The Deployable CRD (parent and child share the same shape; only the
//! fields that are populated differ), its collaborator CRDs `Cluster` and
//! `PlacementRule`, and the small value types threaded through the
//! reconciler.

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// A cluster's name, used both as a `propagatedStatus` key and as the
/// `clusterName` on an [`Overrides`] entry.
pub type ClusterName = String;

/// A stable (namespace, name) identity for a Deployable.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectKey {
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl std::fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// The coordinate a placement strategy resolves a cluster to: the cluster's
/// own (namespace, name). Children are materialized into `namespace`.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ClusterCoordinate {
    pub namespace: String,
    pub name: ClusterName,
}

/// A Deployable, in either its hub (parent) or propagated (child) form. The
/// two forms share a schema; which fields are populated distinguishes them.
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "apps.open-cluster-management.io",
    version = "v1",
    kind = "Deployable",
    plural = "deployables",
    namespaced
)]
#[kube(status = "DeployableStatus")]
#[serde(rename_all = "camelCase")]
pub struct DeployableSpec {
    /// Opaque encoded workload descriptor. Stored verbatim; `decoded_template`
    /// below gives callers a structured view of it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<serde_json::Value>,

    /// Placement policy. Absent on children (they are leaves).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub placement: Option<Placement>,

    /// Per-cluster override patches, ordered.
    #[serde(default)]
    pub overrides: Vec<Overrides>,
}

impl DeployableSpec {
    /// The decoded view of `template`, or an empty object if unset.
    pub fn decoded_template(&self) -> serde_json::Value {
        self.template.clone().unwrap_or(serde_json::Value::Null)
    }
}

/// Placement policy: exactly one of `placement_ref`, `clusters`,
/// `cluster_selector` is consulted, in that priority order.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Placement {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub placement_ref: Option<PlacementRef>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub clusters: Option<Vec<GenericClusterReference>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_selector: Option<LabelSelector>,
}

/// A reference to a `PlacementRule` object in the parent's namespace.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PlacementRef {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_version: Option<String>,

    pub name: String,
}

#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct GenericClusterReference {
    pub name: String,
}

/// One cluster's set of override patches.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Overrides {
    pub cluster_name: ClusterName,
    #[serde(default)]
    pub cluster_overrides: Vec<ClusterOverride>,
}

/// A single dot-path patch applied to a template.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct ClusterOverride {
    pub path: String,
    pub value: serde_json::Value,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DeployableStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<DeployablePhase>,

    #[serde(default)]
    pub propagated_status: BTreeMap<ClusterName, ResourceUnitStatus>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_update_time: Option<String>,
}

#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq, strum::Display)]
pub enum DeployablePhase {
    Propagating,
    Deployed,
    Failed,
    Unknown,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ResourceUnitStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<DeployablePhase>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_update: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// A target cluster, carrying only what placement resolution reads: its
/// identity and labels.
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "clusterregistry.k8s.io",
    version = "v1alpha1",
    kind = "Cluster",
    plural = "clusters",
    namespaced
)]
pub struct ClusterSpec {}

/// A placement decision source, consulted when `placement.placementRef` is set.
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "apps.open-cluster-management.io",
    version = "v1",
    kind = "PlacementRule",
    plural = "placementrules",
    namespaced,
    status = "PlacementRuleStatus"
)]
pub struct PlacementRuleSpec {}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PlacementRuleStatus {
    #[serde(default)]
    pub decisions: Vec<ClusterDecision>,
}

#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClusterDecision {
    pub cluster_name: String,
    pub cluster_namespace: String,
}

impl From<&ClusterDecision> for ClusterCoordinate {
    fn from(d: &ClusterDecision) -> Self {
        ClusterCoordinate {
            namespace: d.cluster_namespace.clone(),
            name: d.cluster_name.clone(),
        }
    }
}
