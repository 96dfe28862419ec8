//! Types for the `Skyhook` custom resource and the annotations/labels the
//! operator persists alongside it. This crate has no Kubernetes client
//! logic — it is consumed by the `operator` crate and by anything that
//! needs to read or render a `Skyhook`.

mod package;
mod skyhook;
mod state;

pub use package::*;
pub use skyhook::*;
pub use state::*;

/// Name used in `PatchParams::apply` and as the `createdBy`-style marker
/// on every object this operator manages.
pub const MANAGER_NAME: &str = "skyhook-operator";

/// Operator build version, stamped into `version_<skyhook>` annotations so
/// the migration component (§4.8) can detect a mismatch on restart.
pub const BUILD_VERSION: &str = env!("CARGO_PKG_VERSION");

pub mod annotations {
    /// Prefix for `skyhook.nvidia.com/nodeState_<skyhook>`.
    pub const NODE_STATE_PREFIX: &str = "skyhook.nvidia.com/nodeState_";
    /// Prefix for `skyhook.nvidia.com/status_<skyhook>`.
    pub const STATUS_PREFIX: &str = "skyhook.nvidia.com/status_";
    /// Prefix for `skyhook.nvidia.com/cordon_<skyhook>`.
    pub const CORDON_PREFIX: &str = "skyhook.nvidia.com/cordon_";
    /// Prefix for `skyhook.nvidia.com/version_<skyhook>`.
    pub const VERSION_PREFIX: &str = "skyhook.nvidia.com/version_";
    /// Internal bookkeeping, not part of the bit-exact external set in
    /// spec.md §6: the last `configMap` snapshot per package this
    /// Skyhook computed `configUpdates` against, so the diff stays
    /// stable across reconciles until the whole rollout completes
    /// (§4.2, "configUpdates").
    pub const CONFIG_SNAPSHOT_PREFIX: &str = "skyhook.nvidia.com/configSnapshot_";
    /// Administrative pause toggle.
    pub const PAUSE: &str = "skyhook.nvidia.com/pause";
    /// Administrative disable toggle.
    pub const DISABLE: &str = "skyhook.nvidia.com/disable";
    /// JSON-encoded `{name, version, skyhook, stage, image}` on a runner pod.
    pub const POD_PACKAGE: &str = "skyhook.nvidia.com/package";
    /// SHA-256 of the runner pod spec the dispatcher last rendered, used
    /// for idempotent drift detection.
    pub const POD_SPEC_HASH: &str = "skyhook.nvidia.com/spec-hash";

    pub fn node_state_key(skyhook: &str) -> String {
        format!("{NODE_STATE_PREFIX}{skyhook}")
    }

    pub fn status_key(skyhook: &str) -> String {
        format!("{STATUS_PREFIX}{skyhook}")
    }

    pub fn cordon_key(skyhook: &str) -> String {
        format!("{CORDON_PREFIX}{skyhook}")
    }

    pub fn version_key(skyhook: &str) -> String {
        format!("{VERSION_PREFIX}{skyhook}")
    }

    pub fn config_snapshot_key(skyhook: &str) -> String {
        format!("{CONFIG_SNAPSHOT_PREFIX}{skyhook}")
    }
}

pub mod labels {
    /// Pod label carrying the owning Skyhook's name.
    pub const NAME: &str = "skyhook/name";
    /// Pod label carrying `<package-name>-<package-version>`.
    pub const PACKAGE: &str = "skyhook/package";
}

pub mod taints {
    /// Applied to new nodes until the runtime they need is present;
    /// removed once a package satisfies `runtimeRequired`.
    pub const RUNTIME_REQUIRED: &str = "skyhook.nvidia.com/runtime-required";
    /// Applied for the duration of an interrupt to keep replacement pods
    /// from landing mid-drain.
    pub const UNSCHEDULABLE: &str = "skyhook.nvidia.com/unschedulable";
}
