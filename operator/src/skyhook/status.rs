use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::NodeCondition;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Condition;
use skyhook_crd::{PackageState, Skyhook, SkyhookPhase, State};

/// Derives one node's roll-up phase from its package states (§4.7):
/// `complete` if every package is `complete` (or `skipped`, which is
/// `ProgressSkipped`'s terminal value for an elided interrupt);
/// `erroring` if any package is `erroring`; `in_progress` if any package
/// is actively running; `unknown` otherwise (including no state yet).
pub fn node_phase(packages: &BTreeMap<String, PackageState>) -> SkyhookPhase {
    if packages.is_empty() {
        return SkyhookPhase::Unknown;
    }
    if packages.values().any(|p| p.state == State::Erroring) {
        return SkyhookPhase::Erroring;
    }
    if packages
        .values()
        .all(|p| matches!(p.state, State::Complete | State::Skipped))
    {
        return SkyhookPhase::Complete;
    }
    if packages.values().any(|p| p.state == State::InProgress) {
        return SkyhookPhase::InProgress;
    }
    SkyhookPhase::Unknown
}

/// Derives the Skyhook-wide phase from every selected node's phase and
/// whether this reconcile caught up to the current `generation` (§4.7).
/// `complete` requires both: a Skyhook whose nodes finished reconciling
/// against a stale generation is still `in_progress` in spirit.
pub fn skyhook_phase(
    node_status: &BTreeMap<String, SkyhookPhase>,
    observed_generation: i64,
    generation: i64,
) -> SkyhookPhase {
    if node_status.is_empty() {
        return SkyhookPhase::Unknown;
    }
    let any_erroring = node_status.values().any(|p| *p == SkyhookPhase::Erroring);
    let any_progress = node_status
        .values()
        .any(|p| matches!(p, SkyhookPhase::InProgress | SkyhookPhase::Unknown));
    let all_complete = node_status.values().all(|p| *p == SkyhookPhase::Complete);

    if all_complete && observed_generation == generation {
        return SkyhookPhase::Complete;
    }
    if any_erroring && !any_progress {
        return SkyhookPhase::Erroring;
    }
    if any_progress || any_erroring {
        return SkyhookPhase::InProgress;
    }
    SkyhookPhase::Unknown
}

/// `"<k>/<n>"` complete-node fraction (§4.7).
pub fn complete_nodes_fraction(node_status: &BTreeMap<String, SkyhookPhase>) -> String {
    let total = node_status.len();
    let complete = node_status
        .values()
        .filter(|p| **p == SkyhookPhase::Complete)
        .count();
    format!("{complete}/{total}")
}

pub fn nodes_in_progress(node_status: &BTreeMap<String, SkyhookPhase>) -> i64 {
    node_status
        .values()
        .filter(|p| **p == SkyhookPhase::InProgress)
        .count() as i64
}

pub fn sorted_package_list(skyhook: &Skyhook) -> Vec<String> {
    let mut names: Vec<String> = skyhook.spec.packages.keys().cloned().collect();
    names.sort();
    names
}

/// The two Node conditions a Skyhook emits for one node, namespaced by
/// its own name so multiple Skyhooks touching the same node never clash
/// (§4.7). `NotReady` is `True` until the node is `complete`. These are
/// real `Node.status.conditions` entries, not annotations — the node
/// wrapper merges them in alongside any other Skyhook's conditions.
pub fn node_conditions(skyhook_name: &str, phase: SkyhookPhase, message: &str, now: chrono::DateTime<chrono::Utc>) -> Vec<NodeCondition> {
    let not_ready_status = if phase == SkyhookPhase::Complete { "False" } else { "True" };
    let erroring_status = if phase == SkyhookPhase::Erroring { "True" } else { "False" };
    let time = k8s_openapi::apimachinery::pkg::apis::meta::v1::Time(now);
    vec![
        NodeCondition {
            type_: format!("{skyhook_name}/NotReady"),
            status: not_ready_status.to_owned(),
            reason: Some(format!("{phase}")),
            message: Some(message.to_owned()),
            last_transition_time: Some(time.clone()),
            last_heartbeat_time: Some(time.clone()),
        },
        NodeCondition {
            type_: format!("{skyhook_name}/Erroring"),
            status: erroring_status.to_owned(),
            reason: Some(format!("{phase}")),
            message: Some(message.to_owned()),
            last_transition_time: Some(time.clone()),
            last_heartbeat_time: Some(time),
        },
    ]
}

/// A Skyhook-wide summary condition pair, stored on `SkyhookStatus`
/// itself (distinct from the per-node conditions of §4.7, which live on
/// each `Node` instead).
pub fn skyhook_conditions(overall: SkyhookPhase, now: chrono::DateTime<chrono::Utc>) -> Vec<Condition> {
    let not_ready_status = if overall == SkyhookPhase::Complete { "False" } else { "True" };
    let erroring_status = if overall == SkyhookPhase::Erroring { "True" } else { "False" };
    let time = k8s_openapi::apimachinery::pkg::apis::meta::v1::Time(now);
    vec![
        Condition {
            type_: "NotReady".to_owned(),
            status: not_ready_status.to_owned(),
            reason: format!("{overall}"),
            message: format!("skyhook is {overall}"),
            last_transition_time: time.clone(),
            observed_generation: None,
        },
        Condition {
            type_: "Erroring".to_owned(),
            status: erroring_status.to_owned(),
            reason: format!("{overall}"),
            message: format!("skyhook is {overall}"),
            last_transition_time: time,
            observed_generation: None,
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(state: State) -> PackageState {
        PackageState {
            name: "driver".to_owned(),
            version: "1.0.0".to_owned(),
            image: "example/driver".to_owned(),
            stage: skyhook_crd::Stage::Apply,
            state,
            restarts: 0,
        }
    }

    #[test]
    fn node_phase_reflects_worst_package() {
        let mut packages = BTreeMap::new();
        packages.insert("a|1.0.0".to_owned(), state(State::Complete));
        packages.insert("b|1.0.0".to_owned(), state(State::InProgress));
        assert_eq!(node_phase(&packages), SkyhookPhase::InProgress);

        packages.insert("c|1.0.0".to_owned(), state(State::Erroring));
        assert_eq!(node_phase(&packages), SkyhookPhase::Erroring);
    }

    #[test]
    fn skipped_counts_toward_complete() {
        let mut packages = BTreeMap::new();
        packages.insert("a|1.0.0".to_owned(), state(State::Complete));
        packages.insert("b|1.0.0".to_owned(), state(State::Skipped));
        assert_eq!(node_phase(&packages), SkyhookPhase::Complete);
    }

    #[test]
    fn skyhook_complete_requires_generation_match() {
        let mut node_status = BTreeMap::new();
        node_status.insert("n1".to_owned(), SkyhookPhase::Complete);
        assert_eq!(skyhook_phase(&node_status, 2, 2), SkyhookPhase::Complete);
        assert_eq!(skyhook_phase(&node_status, 1, 2), SkyhookPhase::InProgress);
    }

    #[test]
    fn fraction_and_in_progress_count() {
        let mut node_status = BTreeMap::new();
        node_status.insert("n1".to_owned(), SkyhookPhase::Complete);
        node_status.insert("n2".to_owned(), SkyhookPhase::InProgress);
        assert_eq!(complete_nodes_fraction(&node_status), "1/2");
        assert_eq!(nodes_in_progress(&node_status), 1);
    }
}
