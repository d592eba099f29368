//! Recognized annotations and label-selector utilities.
//!
//! The selector-to-query-string conversion mirrors
//! `stackable_operator::kvp::label::selector::LabelSelectorExt`.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, LabelSelectorRequirement};
use snafu::Snafu;

use crate::model::ClusterName;

/// Set on children: `namespace/name` of the parent Deployable.
pub const HOST_DEPLOYABLE_ANNOTATION: &str = "host-deployable";

/// Set on a hub Deployable to name a successor to roll toward.
pub const ROLLING_UPDATE_TARGET_ANNOTATION: &str = "rolling-update-target";

/// Integer percent (1-100) cap on clusters advanced per tick. Default 25.
pub const ROLLING_UPDATE_MAX_UNAVAILABLE_ANNOTATION: &str = "rolling-update-max-unavailable";

pub const DEFAULT_ROLLING_UPDATE_MAX_UNAVAILABLE_PERCENT: u32 = 25;

/// Reads `rolling-update-max-unavailable`, falling back to the default on
/// absence or on a value that doesn't parse as an integer (matches the Go
/// source's `strconv.Atoi` fallback in `rollingUpdate`).
pub fn max_unavailable_percent(annotations: &std::collections::BTreeMap<String, String>) -> u32 {
    annotations
        .get(ROLLING_UPDATE_MAX_UNAVAILABLE_ANNOTATION)
        .and_then(|v| v.parse::<u32>().ok())
        .unwrap_or(DEFAULT_ROLLING_UPDATE_MAX_UNAVAILABLE_PERCENT)
}

pub fn rolling_update_target(annotations: &std::collections::BTreeMap<String, String>) -> Option<&str> {
    annotations
        .get(ROLLING_UPDATE_TARGET_ANNOTATION)
        .map(String::as_str)
        .filter(|s| !s.is_empty())
}

pub fn host_deployable(annotations: &std::collections::BTreeMap<String, String>) -> Option<&str> {
    annotations
        .get(HOST_DEPLOYABLE_ANNOTATION)
        .map(String::as_str)
        .filter(|s| !s.is_empty())
}

/// Keys Kubernetes itself stamps on objects (`kubernetes.io/...` and its
/// subdomains, e.g. `app.kubernetes.io/...`), not under this controller's or
/// the user's control. Excluded when comparing a child against its desired
/// state, so a value the API server injects never reads as drift.
pub fn is_system_key(key: &str) -> bool {
    key.contains("kubernetes.io/")
}

/// `map` with every [`is_system_key`] entry removed, for comparing the
/// labels/annotations a user or this controller actually manages.
pub fn non_system(
    map: &std::collections::BTreeMap<String, String>,
) -> std::collections::BTreeMap<String, String> {
    map.iter()
        .filter(|(k, _)| !is_system_key(k))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

#[derive(Debug, PartialEq, Snafu)]
pub enum SelectorError {
    #[snafu(display("label selector with binary operator {operator:?} must have values"))]
    BinaryOperatorWithoutValues { operator: String },

    #[snafu(display("label selector with unary operator {operator:?} must not have values"))]
    UnaryOperatorWithValues { operator: String },

    #[snafu(display("labelSelector has an invalid operator {operator:?}"))]
    InvalidOperator { operator: String },
}

/// Extends [`LabelSelector`] with the query-string conversion the object
/// store's `list(namespace, selector)` operation consumes.
pub trait LabelSelectorExt {
    fn to_query_string(&self) -> Result<String, SelectorError>;
}

impl LabelSelectorExt for LabelSelector {
    fn to_query_string(&self) -> Result<String, SelectorError> {
        let mut query_string = String::new();

        if let Some(label_map) = &self.match_labels {
            query_string.push_str(
                &label_map
                    .iter()
                    .map(|(key, value)| format!("{key}={value}"))
                    .collect::<Vec<_>>()
                    .join(","),
            );
        }

        if let Some(requirements) = &self.match_expressions {
            if !requirements.is_empty() && !query_string.is_empty() {
                query_string.push(',');
            }

            let expression_strings = requirements
                .iter()
                .map(render_requirement)
                .collect::<Result<Vec<String>, SelectorError>>()?;

            query_string.push_str(&expression_strings.join(","));
        }

        Ok(query_string)
    }
}

fn render_requirement(requirement: &LabelSelectorRequirement) -> Result<String, SelectorError> {
    match requirement.operator.as_str() {
        operator @ ("In" | "NotIn") => match &requirement.values {
            Some(values) if !values.is_empty() => Ok(format!(
                "{} {} ({})",
                requirement.key,
                operator.to_ascii_lowercase(),
                values.join(", ")
            )),
            _ => BinaryOperatorWithoutValuesSnafu {
                operator: operator.to_owned(),
            }
            .fail(),
        },
        operator @ "Exists" => match &requirement.values {
            Some(values) if !values.is_empty() => UnaryOperatorWithValuesSnafu {
                operator: operator.to_owned(),
            }
            .fail(),
            _ => Ok(requirement.key.clone()),
        },
        operator @ "DoesNotExist" => match &requirement.values {
            Some(values) if !values.is_empty() => UnaryOperatorWithValuesSnafu {
                operator: operator.to_owned(),
            }
            .fail(),
            _ => Ok(format!("!{}", requirement.key)),
        },
        other => InvalidOperatorSnafu {
            operator: other.to_owned(),
        }
        .fail(),
    }
}

/// Builds the synthetic `name IN (...)` selector used by the `clusters`
/// placement branch: a single `In` `LabelSelectorRequirement` on key
/// `"name"`, listing every referenced cluster name.
pub fn name_in_selector(names: &[ClusterName]) -> LabelSelector {
    LabelSelector {
        match_expressions: Some(vec![LabelSelectorRequirement {
            key: "name".to_string(),
            operator: "In".to_string(),
            values: Some(names.to_vec()),
        }]),
        match_labels: None,
    }
}
