use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::ResourceRequirements;
use schemars::JsonSchema;
use semver::Version;
use serde::{Deserialize, Serialize};

use crate::Stage;

/// One versioned unit of host change. Package identity for state keying
/// is `name|version` (see [`crate::package_key`]).
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, JsonSchema)]
pub struct Package {
    pub name: String,

    #[schemars(with = "String")]
    pub version: Version,

    pub image: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env: Option<BTreeMap<String, String>>,

    #[serde(rename = "configMap", default, skip_serializing_if = "Option::is_none")]
    pub config_map: Option<BTreeMap<String, String>>,

    /// Maps a `configMap` key to the interrupt that must run if that key
    /// changes between reconciles.
    #[serde(
        rename = "configInterrupts",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub config_interrupts: Option<BTreeMap<String, Interrupt>>,

    /// Package-level interrupt forced once per install/upgrade/uninstall
    /// cycle, independent of any config-triggered interrupt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interrupt: Option<Interrupt>,

    /// `name -> version` of packages that must be `complete` before this
    /// one may begin its own trigger path.
    #[serde(rename = "dependsOn", default, skip_serializing_if = "Option::is_none")]
    #[schemars(with = "Option<BTreeMap<String, String>>")]
    pub depends_on: Option<BTreeMap<String, Version>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceRequirements>,

    #[serde(
        rename = "gracefulShutdown",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub graceful_shutdown: Option<GracefulShutdown>,

    #[serde(
        rename = "agentImageOverride",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub agent_image_override: Option<String>,
}

impl Package {
    /// `name|version`, the key used throughout §4.2 for per-node state.
    pub fn key(&self) -> String {
        package_key(&self.name, &self.version)
    }
}

pub fn package_key(name: &str, version: &Version) -> String {
    format!("{name}|{version}")
}

/// Splits a persisted `name|version` key back into its parts.
pub fn split_package_key(key: &str) -> Option<(&str, &str)> {
    key.split_once('|')
}

/// The bit-exact JSON body of the `skyhook.nvidia.com/package` runner
/// pod annotation (§4.5, §6): `{name, version, skyhook, stage, image}`.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, JsonSchema)]
pub struct PodPackageAnnotation {
    pub name: String,
    pub version: String,
    pub skyhook: String,
    pub stage: Stage,
    pub image: String,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, JsonSchema)]
pub struct GracefulShutdown {
    #[serde(rename = "gracePeriodSeconds")]
    pub grace_period_seconds: i64,
}

/// An interrupt kind. Opaque to the interrupt coordinator (§4.6) — these
/// are parameters for the runner pod, not behavior the coordinator
/// interprets itself.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Interrupt {
    pub kind: InterruptKind,

    /// For `kind = service`, the services this interrupt restarts. Used
    /// by `ProgressSkipped` (§4.2) to decide whether a later package's
    /// elided interrupt is covered by this one.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub services: Vec<String>,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub enum InterruptKind {
    Service,
    Reboot,
    RestartAllServices,
    Noop,
}

/// `count` xor `percent`, used both for the Skyhook-wide interruption
/// budget and a compartment's `DeploymentBudget`.
#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, JsonSchema)]
pub struct Budget {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub count: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub percent: Option<u8>,
}

impl Budget {
    /// `ceiling = count if set else max(1, floor(|nodes|*percent/100))`.
    ///
    /// Saturates at `total_nodes` so a configured count larger than the
    /// selected node set never inflates capacity, and a 0% budget still
    /// admits one node (spec.md §8, boundary behaviors).
    pub fn ceiling(&self, total_nodes: usize) -> usize {
        let raw = if let Some(count) = self.count {
            count as usize
        } else {
            let percent = self.percent.unwrap_or(0) as usize;
            ((total_nodes * percent) / 100).max(1)
        };
        raw.min(total_nodes.max(1))
    }
}

/// A runtime grouping of a Skyhook's selected nodes with its own budget
/// and optional rollout strategy. `node_selector = None` denotes the
/// default compartment that catches every node unmatched by the others.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, JsonSchema)]
pub struct Compartment {
    pub name: String,

    #[serde(rename = "nodeSelector", default, skip_serializing_if = "Option::is_none")]
    pub node_selector: Option<BTreeMap<String, String>>,

    #[serde(rename = "deploymentBudget")]
    pub deployment_budget: Budget,

    #[serde(
        rename = "deploymentStrategy",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub deployment_strategy: Option<DeploymentStrategy>,
}

/// Progressive fixed-batch rollout policy layered on top of a
/// compartment's budget (§4.4).
#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, JsonSchema)]
pub struct DeploymentStrategy {
    #[serde(rename = "initialBatch")]
    pub initial_batch: u32,

    /// Minimum success percentage for a batch to count as healthy.
    #[serde(rename = "batchThreshold")]
    pub batch_threshold: u8,

    /// Consecutive unhealthy batches before the rollout may stop.
    #[serde(rename = "failureThreshold")]
    pub failure_threshold: u32,

    /// Rollout-progress percentage past which noisy batches no longer
    /// halt the rollout (§4.4, "Batch evaluation").
    #[serde(rename = "safetyLimit")]
    pub safety_limit: u8,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(Budget { count: Some(1), percent: None }, 3, 1)]
    #[case(Budget { count: Some(10), percent: None }, 3, 3)] // saturates at node count
    #[case(Budget { count: None, percent: Some(0) }, 10, 1)] // 0% rounds up to 1
    #[case(Budget { count: None, percent: Some(50) }, 10, 5)]
    #[case(Budget { count: None, percent: Some(34) }, 10, 3)]
    fn budget_ceiling(#[case] budget: Budget, #[case] total_nodes: usize, #[case] expect: usize) {
        assert_eq!(budget.ceiling(total_nodes), expect);
    }

    #[test]
    fn package_key_round_trip() {
        let pkg = Package {
            name: "nvidia-driver".to_owned(),
            version: Version::parse("1.2.3").unwrap(),
            image: "example/driver:1.2.3".to_owned(),
            env: None,
            config_map: None,
            config_interrupts: None,
            interrupt: None,
            depends_on: None,
            resources: None,
            graceful_shutdown: None,
            agent_image_override: None,
        };
        let key = pkg.key();
        assert_eq!(key, "nvidia-driver|1.2.3");
        let (name, version) = split_package_key(&key).unwrap();
        assert_eq!(name, "nvidia-driver");
        assert_eq!(version, "1.2.3");
    }
}
