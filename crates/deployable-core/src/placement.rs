//! Placement resolution: decides which clusters a Deployable should be
//! propagated to.
//!
//! Priority order: `placementRef` wins outright; otherwise an explicit
//! `clusters` list becomes a synthetic `name in (...)` selector; otherwise
//! `clusterSelector` is used as-is. Any `NotFound` against the referenced
//! `PlacementRule`, and any unsupported `placementRef.kind`/`apiVersion`,
//! resolve to an empty cluster set rather than an error, treating these as
//! "there is currently nowhere to deploy" and not as reconcile failures.

use kube::ResourceExt;

use crate::{
    error::store::StoreError,
    kvp::{name_in_selector, LabelSelectorExt},
    model::{Cluster, ClusterCoordinate, Placement, PlacementRule},
    store::ObjectStore,
};

const SUPPORTED_PLACEMENT_REF_KIND: &str = "PlacementRule";
const SUPPORTED_PLACEMENT_REF_API_VERSION: &str = "apps.open-cluster-management.io/v1";

/// Resolves a [`Placement`] to the set of clusters it currently designates.
pub async fn resolve_clusters(
    namespace: &str,
    placement: &Placement,
    placement_rules: &dyn ObjectStore<PlacementRule>,
    clusters: &dyn ObjectStore<Cluster>,
) -> crate::Result<Vec<ClusterCoordinate>> {
    if let Some(placement_ref) = &placement.placement_ref {
        let kind_ok = placement_ref
            .kind
            .as_deref()
            .map(|k| k == SUPPORTED_PLACEMENT_REF_KIND)
            .unwrap_or(true);
        let api_version_ok = placement_ref
            .api_version
            .as_deref()
            .map(|v| v == SUPPORTED_PLACEMENT_REF_API_VERSION)
            .unwrap_or(true);

        if !kind_ok || !api_version_ok {
            tracing::warn!(
                kind = ?placement_ref.kind,
                api_version = ?placement_ref.api_version,
                "unsupported placement reference, resolving to no clusters"
            );
            return Ok(Vec::new());
        }

        let key = crate::model::ObjectKey::new(namespace, &placement_ref.name);
        return match placement_rules.get(&key).await {
            Ok((rule, _version)) => Ok(rule
                .status
                .unwrap_or_default()
                .decisions
                .iter()
                .map(ClusterCoordinate::from)
                .collect()),
            Err(StoreError::NotFound { .. }) => {
                tracing::warn!(placement_rule = %key, "referenced placement rule not found");
                Ok(Vec::new())
            }
            Err(source) => Err(crate::Error::TransientStore {
                action: "fetching referenced placement rule".to_string(),
                source,
            }),
        };
    }

    let selector = if let Some(refs) = &placement.clusters {
        let names = refs.iter().map(|c| c.name.clone()).collect::<Vec<_>>();
        name_in_selector(&names)
    } else if let Some(selector) = &placement.cluster_selector {
        selector.clone()
    } else {
        return Ok(Vec::new());
    };

    let query = selector
        .to_query_string()
        .map_err(|source| crate::Error::MalformedTemplate {
            key: namespace.to_string(),
            reason: source.to_string(),
        })?;

    let query = (!query.is_empty()).then_some(query.as_str());

    match clusters.list(None, query).await {
        Ok(found) => Ok(found
            .iter()
            .map(|c| ClusterCoordinate {
                namespace: c.namespace().unwrap_or_default(),
                name: c.name_any(),
            })
            .collect()),
        Err(StoreError::NotFound { .. }) => Ok(Vec::new()),
        Err(source) => Err(crate::Error::TransientStore {
            action: "listing clusters".to_string(),
            source,
        }),
    }
}
