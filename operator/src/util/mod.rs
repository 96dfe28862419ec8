use std::time::Duration;

mod error;
pub mod merge;
pub mod metrics;
pub mod patch;

pub use error::*;
pub use skyhook_crd::MANAGER_NAME;

/// Default requeue interval once a Skyhook has settled into steady
/// state (§5, "typical: ... longer for steady state").
pub(crate) const STEADY_STATE_INTERVAL: Duration = Duration::from_secs(30);

/// Requeue interval while a node is mid-stage, so progress is observed
/// promptly without busy-polling (§5, "a few seconds for in-progress
/// stages").
pub(crate) const IN_PROGRESS_INTERVAL: Duration = Duration::from_secs(5);

pub fn hash_spec<T: serde::Serialize>(spec: &T) -> String {
    use sha2::{Digest, Sha256};
    let spec_bytes = serde_json::to_vec(spec).expect("spec is always serializable");
    let mut hasher = Sha256::new();
    hasher.update(&spec_bytes);
    hex::encode(hasher.finalize())
}
