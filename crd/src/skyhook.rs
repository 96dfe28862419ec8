use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::Toleration;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Condition;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::{BatchProcessingState, Budget, Compartment, Package, PackageState};

/// The declarative resource describing packages and node selection.
/// Cluster-scoped: a `Skyhook` is not namespaced, matching the fact that
/// it reaches across every node it selects.
#[derive(CustomResource, Serialize, Deserialize, Default, Debug, PartialEq, Clone, JsonSchema)]
#[kube(
    group = "skyhook.nvidia.com",
    version = "v1alpha1",
    kind = "Skyhook",
    plural = "skyhooks",
    derive = "PartialEq",
    status = "SkyhookStatus",
    shortname = "sh"
)]
#[kube(derive = "Default")]
#[kube(
    printcolumn = "{\"jsonPath\": \".status.status\", \"name\": \"STATUS\", \"type\": \"string\" }"
)]
#[kube(
    printcolumn = "{\"jsonPath\": \".status.completeNodes\", \"name\": \"COMPLETE\", \"type\": \"string\" }"
)]
#[kube(
    printcolumn = "{\"jsonPath\": \".spec.priority\", \"name\": \"PRIORITY\", \"type\": \"integer\" }"
)]
pub struct SkyhookSpec {
    pub packages: BTreeMap<String, Package>,

    /// Exact-match label query selecting the nodes this Skyhook targets.
    #[serde(rename = "nodeSelectors", default)]
    pub node_selectors: BTreeMap<String, String>,

    /// Pods carrying any of these labels are never evicted by an
    /// interrupt (§4.6, "Protected pod").
    #[serde(rename = "podNonInterruptLabels", default)]
    pub pod_non_interrupt_labels: BTreeMap<String, String>,

    #[serde(rename = "interruptionBudget", default)]
    pub interruption_budget: Budget,

    /// Lower values win when Skyhooks contend for the same node (§4.1).
    #[serde(default)]
    pub priority: i32,

    /// Caps global in-progress nodes to 1 regardless of the budget
    /// ceiling (§4.4, "Concurrency interaction").
    #[serde(default)]
    pub serial: bool,

    #[serde(default)]
    pub pause: bool,

    /// Whether new nodes are tainted `runtime-required` until a package
    /// satisfies the runtime dependency.
    #[serde(rename = "runtimeRequired", default)]
    pub runtime_required: bool,

    #[serde(
        rename = "reapplyOnReboot",
        default
    )]
    pub reapply_on_reboot: bool,

    #[serde(rename = "additionalTolerations", default)]
    pub additional_tolerations: Vec<Toleration>,

    /// Secondary groupings of the selected nodes, each with its own
    /// budget/strategy (§3, §4.4). A default compartment (no selector)
    /// is assumed even if not listed explicitly.
    #[serde(default)]
    pub compartments: Vec<Compartment>,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub enum SkyhookPhase {
    #[default]
    Unknown,
    InProgress,
    Complete,
    Erroring,
}

impl std::fmt::Display for SkyhookPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SkyhookPhase::Unknown => "unknown",
            SkyhookPhase::InProgress => "in_progress",
            SkyhookPhase::Complete => "complete",
            SkyhookPhase::Erroring => "erroring",
        };
        f.write_str(s)
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct SkyhookStatus {
    #[serde(default)]
    pub status: SkyhookPhase,

    /// `nodeName -> packageKey -> PackageState`.
    #[serde(rename = "nodeState", default)]
    pub node_state: BTreeMap<String, BTreeMap<String, PackageState>>,

    #[serde(rename = "nodeStatus", default)]
    pub node_status: BTreeMap<String, SkyhookPhase>,

    /// `packageName -> configMap keys changed since last apply`.
    #[serde(rename = "configUpdates", default)]
    pub config_updates: BTreeMap<String, Vec<String>>,

    #[serde(rename = "nodeBootIds", default)]
    pub node_boot_ids: BTreeMap<String, String>,

    /// Sticky interrupt-budget slot assignment: `nodeName -> RFC3339
    /// timestamp of when the node was admitted into the active set`.
    #[serde(rename = "nodePriority", default)]
    pub node_priority: BTreeMap<String, String>,

    /// `compartmentName -> BatchProcessingState`.
    #[serde(default)]
    pub compartments: BTreeMap<String, BatchProcessingState>,

    #[serde(rename = "completeNodes", default)]
    pub complete_nodes: String,

    #[serde(rename = "packageList", default)]
    pub package_list: Vec<String>,

    #[serde(rename = "nodesInProgress", default)]
    pub nodes_in_progress: i64,

    #[serde(default)]
    pub conditions: Vec<Condition>,

    #[serde(rename = "observedGeneration", default)]
    pub observed_generation: i64,
}
