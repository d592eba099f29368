//! End-to-end reconcile scenarios driven against the in-memory `ObjectStore`
//! fake: a real persistence substrate is out of scope for these tests, so an
//! in-memory fake stands in for it here the way `stackable-operator` leaves
//! envtest-backed coverage to integration suites it does not ship inline.

use deployable_core::{
    controller::{reconcile, Drivers, ReconcileOutcome},
    model::{
        Cluster, ClusterDecision, ClusterOverride, Deployable, DeployablePhase, DeployableSpec,
        DeployableStatus, GenericClusterReference, ObjectKey, Overrides, Placement, PlacementRef,
        PlacementRule, PlacementRuleStatus, ResourceUnitStatus,
    },
    store::{InMemoryStore, NullEventSink, ObjectStore},
};
use kube::ResourceExt;
use serde_json::json;

fn cluster(name: &str) -> Cluster {
    let mut c = Cluster::new(name, deployable_core::model::ClusterSpec {});
    c.meta_mut().namespace = Some(name.to_string());
    c
}

fn clock(tick: &'static str) -> impl Fn() -> String {
    move || tick.to_string()
}

async fn reconcile_once(
    deployables: &InMemoryStore<Deployable>,
    clusters: &InMemoryStore<Cluster>,
    placement_rules: &InMemoryStore<PlacementRule>,
    key: &ObjectKey,
) -> ReconcileOutcome {
    let events = NullEventSink;
    let drivers = Drivers {
        deployables,
        clusters,
        placement_rules,
        events: &events,
    };
    reconcile(&drivers, key, clock("t1")).await.unwrap()
}

fn children_of(all: &[Deployable], parent_key: &str) -> Vec<Deployable> {
    all.iter()
        .filter(|d| {
            d.annotations().get("host-deployable").map(String::as_str) == Some(parent_key)
        })
        .cloned()
        .collect()
}

// Single-cluster propagation: exactly one child lands in the one resolved
// cluster's namespace, carrying the parent's template verbatim.
#[tokio::test]
async fn single_cluster_propagation_creates_one_child() {
    let deployables = InMemoryStore::<Deployable>::new();
    let clusters = InMemoryStore::<Cluster>::new();
    let placement_rules = InMemoryStore::<PlacementRule>::new();

    clusters.seed(cluster("e1")).await;
    clusters.seed(cluster("e2")).await;

    let mut parent = Deployable::new(
        "payload",
        DeployableSpec {
            template: Some(json!({"kind": "ConfigMap", "data": {"purpose": "for test"}})),
            placement: Some(Placement {
                placement_ref: None,
                clusters: Some(vec![GenericClusterReference {
                    name: "e1".to_string(),
                }]),
                cluster_selector: None,
            }),
            overrides: Vec::new(),
        },
    );
    parent.meta_mut().namespace = Some("default".to_string());
    deployables.seed(parent).await;

    let key = ObjectKey::new("default", "payload");
    let outcome = reconcile_once(&deployables, &clusters, &placement_rules, &key).await;
    assert_eq!(outcome, ReconcileOutcome::Settled);

    let all = deployables.all().await;
    let children = children_of(&all, "default/payload");
    assert_eq!(children.len(), 1);
    let child = &children[0];
    assert_eq!(child.namespace().as_deref(), Some("e1"));
    assert!(child.name_any().starts_with("payload-"));
    assert_eq!(
        child.spec.decoded_template(),
        json!({"kind": "ConfigMap", "data": {"purpose": "for test"}})
    );

    let (reloaded_parent, _) = deployables.get(&key).await.unwrap();
    assert_eq!(
        reloaded_parent.status.unwrap().propagated_status.len(),
        1,
        "propagatedStatus must track the one existing child"
    );
}

// Per-cluster override: e2's patch replaces `data`, e1 keeps the parent's
// template untouched.
#[tokio::test]
async fn override_per_cluster_only_affects_named_cluster() {
    let deployables = InMemoryStore::<Deployable>::new();
    let clusters = InMemoryStore::<Cluster>::new();
    let placement_rules = InMemoryStore::<PlacementRule>::new();

    clusters.seed(cluster("e1")).await;
    clusters.seed(cluster("e2")).await;

    let mut parent = Deployable::new(
        "payload",
        DeployableSpec {
            template: Some(json!({"kind": "ConfigMap", "data": {"purpose": "for test"}})),
            placement: Some(Placement {
                placement_ref: None,
                clusters: None,
                cluster_selector: Some(k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector::default()),
            }),
            overrides: vec![Overrides {
                cluster_name: "e2".to_string(),
                cluster_overrides: vec![ClusterOverride {
                    path: "data".to_string(),
                    value: json!({"foo": "bar"}),
                }],
            }],
        },
    );
    parent.meta_mut().namespace = Some("default".to_string());
    deployables.seed(parent).await;

    let key = ObjectKey::new("default", "payload");
    reconcile_once(&deployables, &clusters, &placement_rules, &key).await;

    let all = deployables.all().await;
    let children = children_of(&all, "default/payload");
    assert_eq!(children.len(), 2);

    let e1 = children.iter().find(|c| c.namespace().as_deref() == Some("e1")).unwrap();
    let e2 = children.iter().find(|c| c.namespace().as_deref() == Some("e2")).unwrap();
    assert_eq!(
        e1.spec.decoded_template(),
        json!({"kind": "ConfigMap", "data": {"purpose": "for test"}})
    );
    assert_eq!(
        e2.spec.decoded_template(),
        json!({"kind": "ConfigMap", "data": {"foo": "bar"}})
    );
}

// Placement-ref wins: a PlacementRule resolving to {e1} takes priority over
// a simultaneously-set `clusters: [e2]`.
#[tokio::test]
async fn placement_ref_takes_priority_over_clusters_list() {
    let deployables = InMemoryStore::<Deployable>::new();
    let clusters = InMemoryStore::<Cluster>::new();
    let placement_rules = InMemoryStore::<PlacementRule>::new();

    clusters.seed(cluster("e1")).await;
    clusters.seed(cluster("e2")).await;

    let mut rule = PlacementRule::new("pr1", deployable_core::model::PlacementRuleSpec {});
    rule.meta_mut().namespace = Some("default".to_string());
    rule.status = Some(PlacementRuleStatus {
        decisions: vec![ClusterDecision {
            cluster_name: "e1".to_string(),
            cluster_namespace: "e1".to_string(),
        }],
    });
    placement_rules.seed(rule).await;

    let mut parent = Deployable::new(
        "payload",
        DeployableSpec {
            template: Some(json!({"kind": "ConfigMap", "data": {}})),
            placement: Some(Placement {
                placement_ref: Some(PlacementRef {
                    kind: None,
                    api_version: None,
                    name: "pr1".to_string(),
                }),
                clusters: Some(vec![GenericClusterReference {
                    name: "e2".to_string(),
                }]),
                cluster_selector: None,
            }),
            overrides: Vec::new(),
        },
    );
    parent.meta_mut().namespace = Some("default".to_string());
    deployables.seed(parent).await;

    let key = ObjectKey::new("default", "payload");
    reconcile_once(&deployables, &clusters, &placement_rules, &key).await;

    let all = deployables.all().await;
    let children = children_of(&all, "default/payload");
    assert_eq!(children.len(), 1);
    assert_eq!(children[0].namespace().as_deref(), Some("e1"));
}

// Rolling update budget: 4 deployed children, 25% max-unavailable, one
// reconcile tick advances exactly one cluster.
#[tokio::test]
async fn rolling_update_budget_advances_one_of_four_clusters() {
    let deployables = InMemoryStore::<Deployable>::new();
    let clusters = InMemoryStore::<Cluster>::new();
    let placement_rules = InMemoryStore::<PlacementRule>::new();

    for name in ["e1", "e2", "e3", "e4"] {
        clusters.seed(cluster(name)).await;
    }

    let mut status = DeployableStatus::default();
    for name in ["e1", "e2", "e3", "e4"] {
        status.propagated_status.insert(
            name.to_string(),
            ResourceUnitStatus {
                phase: Some(DeployablePhase::Deployed),
                last_update: Some("t0".to_string()),
                reason: None,
            },
        );
    }

    let mut target = Deployable::new(
        "payload-v2",
        DeployableSpec {
            template: Some(json!({"kind": "ConfigMap", "data": {"v": "new"}})),
            placement: None,
            overrides: Vec::new(),
        },
    );
    target.meta_mut().namespace = Some("default".to_string());
    deployables.seed(target).await;

    let mut parent = Deployable::new(
        "payload-v1",
        DeployableSpec {
            template: Some(json!({"kind": "ConfigMap", "data": {"v": "old"}})),
            placement: Some(Placement {
                placement_ref: None,
                clusters: Some(
                    ["e1", "e2", "e3", "e4"]
                        .into_iter()
                        .map(|n| GenericClusterReference { name: n.to_string() })
                        .collect(),
                ),
                cluster_selector: None,
            }),
            overrides: Vec::new(),
        },
    );
    parent.meta_mut().namespace = Some("default".to_string());
    parent.meta_mut().annotations = Some(
        [("rolling-update-target".to_string(), "payload-v2".to_string())]
            .into_iter()
            .collect(),
    );
    parent.status = Some(status);
    deployables.seed(parent).await;

    let key = ObjectKey::new("default", "payload-v1");
    reconcile_once(&deployables, &clusters, &placement_rules, &key).await;

    let (reloaded, _) = deployables.get(&key).await.unwrap();
    assert_eq!(reloaded.spec.template, Some(json!({"kind": "ConfigMap", "data": {"v": "new"}})));
    // ceil(4*25/100) = 1, so exactly 3 of the 4 clusters must still carry a
    // holdback override (the fourth has none and picks up the new template).
    assert_eq!(reloaded.spec.overrides.len(), 3);
}

// Subscription package-overrides: rolling initialization extracts
// `spec.packageOverrides` from the target and synthesizes it as a patch on
// every per-cluster override, stripping it from both stored templates.
#[tokio::test]
async fn subscription_package_overrides_synthesized_as_holdback_patch() {
    let deployables = InMemoryStore::<Deployable>::new();
    let clusters = InMemoryStore::<Cluster>::new();
    let placement_rules = InMemoryStore::<PlacementRule>::new();

    for name in ["e1", "e2", "e3", "e4"] {
        clusters.seed(cluster(name)).await;
    }

    let mut status = DeployableStatus::default();
    for name in ["e1", "e2", "e3", "e4"] {
        status.propagated_status.insert(
            name.to_string(),
            ResourceUnitStatus {
                phase: Some(DeployablePhase::Deployed),
                last_update: Some("t0".to_string()),
                reason: None,
            },
        );
    }

    let mut target = Deployable::new(
        "sub-v2",
        DeployableSpec {
            template: Some(json!({
                "kind": "Subscription",
                "spec": {"channel": "beta", "packageOverrides": [{"packageName": "k"}]}
            })),
            placement: None,
            overrides: Vec::new(),
        },
    );
    target.meta_mut().namespace = Some("default".to_string());
    deployables.seed(target).await;

    let mut parent = Deployable::new(
        "sub-v1",
        DeployableSpec {
            template: Some(json!({"kind": "Subscription", "spec": {"channel": "alpha"}})),
            placement: Some(Placement {
                placement_ref: None,
                clusters: Some(
                    ["e1", "e2", "e3", "e4"]
                        .into_iter()
                        .map(|n| GenericClusterReference { name: n.to_string() })
                        .collect(),
                ),
                cluster_selector: None,
            }),
            overrides: Vec::new(),
        },
    );
    parent.meta_mut().namespace = Some("default".to_string());
    parent.meta_mut().annotations = Some(
        [("rolling-update-target".to_string(), "sub-v2".to_string())]
            .into_iter()
            .collect(),
    );
    parent.status = Some(status);
    deployables.seed(parent).await;

    let key = ObjectKey::new("default", "sub-v1");
    reconcile_once(&deployables, &clusters, &placement_rules, &key).await;

    let (reloaded, _) = deployables.get(&key).await.unwrap();
    let stored_template = reloaded.spec.decoded_template();
    assert_eq!(stored_template.get("spec").unwrap().get("packageOverrides"), None);

    // ceil(4*25/100) = 1, so 3 of the 4 clusters are held back this tick --
    // every one of them must carry the synthesized packageOverrides patch.
    assert_eq!(reloaded.spec.overrides.len(), 3);
    for ov in &reloaded.spec.overrides {
        let has_synth = ov
            .cluster_overrides
            .iter()
            .any(|p| p.path == "spec.packageOverrides" && p.value == json!({"packageName": "k"}));
        assert!(has_synth, "override for {} missing synthesized patch", ov.cluster_name);
    }
}

// Stale override cleanup: an override naming a cluster no longer in
// `propagatedStatus` is dropped before the rest of the tick runs.
#[tokio::test]
async fn stale_override_for_removed_cluster_is_dropped() {
    let deployables = InMemoryStore::<Deployable>::new();
    let clusters = InMemoryStore::<Cluster>::new();
    let placement_rules = InMemoryStore::<PlacementRule>::new();

    clusters.seed(cluster("live")).await;

    let mut status = DeployableStatus::default();
    status.propagated_status.insert(
        "live".to_string(),
        ResourceUnitStatus {
            phase: Some(DeployablePhase::Deployed),
            last_update: Some("t0".to_string()),
            reason: None,
        },
    );

    let mut parent = Deployable::new(
        "payload",
        DeployableSpec {
            template: Some(json!({"kind": "ConfigMap", "data": {}})),
            placement: Some(Placement {
                placement_ref: None,
                clusters: Some(vec![GenericClusterReference {
                    name: "live".to_string(),
                }]),
                cluster_selector: None,
            }),
            overrides: vec![
                Overrides {
                    cluster_name: "gone".to_string(),
                    cluster_overrides: vec![],
                },
                Overrides {
                    cluster_name: "live".to_string(),
                    cluster_overrides: vec![],
                },
            ],
        },
    );
    parent.meta_mut().namespace = Some("default".to_string());
    parent.status = Some(status);
    deployables.seed(parent).await;

    let key = ObjectKey::new("default", "payload");
    let outcome = reconcile_once(&deployables, &clusters, &placement_rules, &key).await;
    assert_eq!(outcome, ReconcileOutcome::Settled);

    let (reloaded, _) = deployables.get(&key).await.unwrap();
    assert!(reloaded
        .spec
        .overrides
        .iter()
        .all(|ov| ov.cluster_name != "gone"));

    let all = deployables.all().await;
    let children = children_of(&all, "default/payload");
    assert_eq!(children.len(), 1);
    assert_eq!(children[0].namespace().as_deref(), Some("live"));
}

// A no-finalizers parent writes status; one with finalizers present
// suppresses the status write even though child sync still runs.
#[tokio::test]
async fn finalizers_suppress_status_writes_but_not_sync() {
    let deployables = InMemoryStore::<Deployable>::new();
    let clusters = InMemoryStore::<Cluster>::new();
    let placement_rules = InMemoryStore::<PlacementRule>::new();

    clusters.seed(cluster("e1")).await;

    let mut parent = Deployable::new(
        "payload",
        DeployableSpec {
            template: Some(json!({"kind": "ConfigMap", "data": {}})),
            placement: Some(Placement {
                placement_ref: None,
                clusters: Some(vec![GenericClusterReference {
                    name: "e1".to_string(),
                }]),
                cluster_selector: None,
            }),
            overrides: Vec::new(),
        },
    );
    parent.meta_mut().namespace = Some("default".to_string());
    parent.meta_mut().finalizers = Some(vec!["deployable.cleanup".to_string()]);
    deployables.seed(parent).await;

    let key = ObjectKey::new("default", "payload");
    reconcile_once(&deployables, &clusters, &placement_rules, &key).await;

    let all = deployables.all().await;
    let children = children_of(&all, "default/payload");
    assert_eq!(children.len(), 1, "child sync still runs with finalizers present");

    let (reloaded, _) = deployables.get(&key).await.unwrap();
    assert!(
        reloaded.status.is_none(),
        "status write must be suppressed while finalizers are present"
    );
}

// Deleting the parent: a reconcile against its now-missing key must reap
// every child it left behind rather than leaving them orphaned.
#[tokio::test]
async fn deleting_the_parent_reaps_its_children() {
    let deployables = InMemoryStore::<Deployable>::new();
    let clusters = InMemoryStore::<Cluster>::new();
    let placement_rules = InMemoryStore::<PlacementRule>::new();

    clusters.seed(cluster("e1")).await;

    let mut parent = Deployable::new(
        "payload",
        DeployableSpec {
            template: Some(json!({"kind": "ConfigMap", "data": {}})),
            placement: Some(Placement {
                placement_ref: None,
                clusters: Some(vec![GenericClusterReference {
                    name: "e1".to_string(),
                }]),
                cluster_selector: None,
            }),
            overrides: Vec::new(),
        },
    );
    parent.meta_mut().namespace = Some("default".to_string());
    deployables.seed(parent).await;

    let key = ObjectKey::new("default", "payload");
    reconcile_once(&deployables, &clusters, &placement_rules, &key).await;

    let all = deployables.all().await;
    assert_eq!(children_of(&all, "default/payload").len(), 1);

    deployables.delete(&key).await.unwrap();
    let outcome = reconcile_once(&deployables, &clusters, &placement_rules, &key).await;
    assert_eq!(outcome, ReconcileOutcome::Settled);

    let all = deployables.all().await;
    assert_eq!(
        children_of(&all, "default/payload").len(),
        0,
        "orphaned children must be reaped once the parent is gone"
    );
}
