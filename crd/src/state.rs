use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// One step of a package's lifecycle. Strict order within a single
/// trigger path (§3, §4.2):
/// `uninstall -> apply -> config -> interrupt -> post_interrupt` on a
/// fresh install/change, or `upgrade -> config -> interrupt ->
/// post_interrupt` on a semver increase. `config`, `interrupt`, and
/// `post_interrupt` are conditional — see `crate::state::next_stage`.
#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, Hash, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub enum Stage {
    Uninstall,
    Apply,
    Upgrade,
    Config,
    Interrupt,
    PostInterrupt,
}

impl Stage {
    /// The ordered stage sequence for a fresh install, uninstall, or
    /// downgrade-then-reinstall trigger path.
    pub const INSTALL_SEQUENCE: &'static [Stage] = &[
        Stage::Apply,
        Stage::Config,
        Stage::Interrupt,
        Stage::PostInterrupt,
    ];

    /// The ordered stage sequence for a semver-increase trigger path.
    pub const UPGRADE_SEQUENCE: &'static [Stage] = &[
        Stage::Upgrade,
        Stage::Config,
        Stage::Interrupt,
        Stage::PostInterrupt,
    ];

    pub const UNINSTALL_SEQUENCE: &'static [Stage] = &[Stage::Uninstall];

    /// A `configMap` change with no `configInterrupts` entry: re-run
    /// `config` only (§4.2, "config-triggered re-entry").
    pub const CONFIG_ONLY_SEQUENCE: &'static [Stage] = &[Stage::Config];

    /// A `configMap` change whose key maps to a `configInterrupts` entry:
    /// `config` followed by the interrupt pair again.
    pub const CONFIG_INTERRUPT_SEQUENCE: &'static [Stage] =
        &[Stage::Config, Stage::Interrupt, Stage::PostInterrupt];
}

/// Lifecycle state of a (node, package) pair at its current stage.
#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub enum State {
    #[default]
    Unknown,
    InProgress,
    Complete,
    Erroring,
    /// Elided because an earlier package's interrupt already covered the
    /// same services; promoted to `Complete` via `ProgressSkipped` once
    /// that package's interrupt succeeds (§4.2).
    Skipped,
}

/// Persisted per (node, package|version) state, the value type of the
/// `nodeState_<skyhook>` annotation's object (§6).
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, JsonSchema)]
pub struct PackageState {
    pub name: String,
    pub version: String,
    pub image: String,
    pub stage: Stage,
    pub state: State,
    #[serde(default)]
    pub restarts: u32,
}

impl PackageState {
    pub fn new(name: &str, version: &str, image: &str, stage: Stage) -> Self {
        PackageState {
            name: name.to_owned(),
            version: version.to_owned(),
            image: image.to_owned(),
            stage,
            state: State::Unknown,
            restarts: 0,
        }
    }
}

/// Runtime bookkeeping for a compartment's current rollout batch
/// (§3, §4.4). Persisted in `SkyhookStatus::compartments` so a restart
/// does not re-pick a fresh, unrelated batch mid-rollout.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct BatchProcessingState {
    #[serde(rename = "currentBatch", default)]
    pub current_batch: u32,

    #[serde(rename = "currentBatchNodes", default)]
    pub current_batch_nodes: Vec<String>,

    #[serde(rename = "processedNodes", default)]
    pub processed_nodes: u32,

    #[serde(rename = "consecutiveFailures", default)]
    pub consecutive_failures: u32,

    #[serde(rename = "successfulInBatch", default)]
    pub successful_in_batch: u32,

    #[serde(rename = "failedInBatch", default)]
    pub failed_in_batch: u32,

    #[serde(rename = "shouldStop", default)]
    pub should_stop: bool,
}
