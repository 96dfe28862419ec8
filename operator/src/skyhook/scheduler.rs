use std::collections::BTreeMap;

use skyhook_crd::{BatchProcessingState, Compartment, DeploymentStrategy};

/// Coarse priority bucket for a node competing for a scarce interruption
/// budget slot (§4.4, "priority order: in_progress > unknown > blocked >
/// erroring"). Declared low-to-high so the derived `Ord` sorts a
/// descending comparison straight into priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum NodePriority {
    Erroring,
    Blocked,
    Unknown,
    InProgress,
}

/// One node under consideration for this reconcile's active set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeCandidate {
    pub name: String,
    pub priority: NodePriority,
    /// Whether `status.nodePriority` already held this node from a prior
    /// reconcile — sticky selection keeps a node working once it starts
    /// rather than thrashing the active set every pass.
    pub previously_selected: bool,
}

/// Finds the first compartment whose `nodeSelector` is a subset of
/// `node_labels`, falling back to the one compartment (if any) with no
/// selector at all — the catch-all default (§4.4, "first-matching-
/// selector wins, unmatched nodes fall to the default compartment").
pub fn assign_compartment<'a>(
    node_labels: &BTreeMap<String, String>,
    compartments: &'a [Compartment],
) -> Option<&'a Compartment> {
    compartments
        .iter()
        .find(|c| matches_selector(node_labels, c.node_selector.as_ref()))
        .or_else(|| compartments.iter().find(|c| c.node_selector.is_none()))
}

fn matches_selector(node_labels: &BTreeMap<String, String>, selector: Option<&BTreeMap<String, String>>) -> bool {
    match selector {
        None => false,
        Some(sel) if sel.is_empty() => false,
        Some(sel) => sel.iter().all(|(k, v)| node_labels.get(k) == Some(v)),
    }
}

/// Picks which candidates get a budget slot this reconcile: previously
/// selected nodes keep their slot first, then the remaining slots go to
/// the highest-priority candidates, ties broken by name for determinism.
pub fn select_active_nodes(mut candidates: Vec<NodeCandidate>, ceiling: usize) -> Vec<String> {
    candidates.sort_by(|a, b| {
        b.previously_selected
            .cmp(&a.previously_selected)
            .then(b.priority.cmp(&a.priority))
            .then(a.name.cmp(&b.name))
    });
    candidates.into_iter().take(ceiling).map(|c| c.name).collect()
}

/// A Skyhook marked `serial` never runs more than one node at a time,
/// regardless of any compartment or interruption budget (§4.4, "serial
/// Skyhooks cap at one in-flight node cluster-wide").
pub fn apply_serial_cap(ceiling: usize, serial: bool) -> usize {
    if serial { ceiling.min(1) } else { ceiling }
}

/// The size of the next rollout batch under a [`DeploymentStrategy`]:
/// `initialBatch` every batch — "fixed" names the strategy — capped by
/// how many selected nodes remain (§4.4, "Batch sizing"; §8 Scenario 5
/// runs two same-sized `initialBatch:3` batches back to back).
pub fn next_batch_size(strategy: &DeploymentStrategy, _last_batch_size: usize, remaining_selected: usize) -> usize {
    (strategy.initial_batch as usize).min(remaining_selected).max(remaining_selected.min(1))
}

/// Whether the current batch met `batchThreshold`. With no results yet
/// the batch is treated as healthy — only failures fail a batch.
pub fn batch_is_healthy(strategy: &DeploymentStrategy, state: &BatchProcessingState) -> bool {
    let total = state.successful_in_batch + state.failed_in_batch;
    if total == 0 {
        return true;
    }
    let success_percent = (state.successful_in_batch * 100) / total;
    success_percent >= strategy.batch_threshold as u32
}

/// Whether the rollout should halt: `failureThreshold` consecutive
/// unhealthy batches, unless the rollout has already passed
/// `safetyLimit` percent completion, past which noisy batches no longer
/// stop the rollout (§4.4, "Batch evaluation").
pub fn should_stop_rollout(strategy: &DeploymentStrategy, state: &BatchProcessingState, progress_percent: u8) -> bool {
    if progress_percent >= strategy.safety_limit {
        return false;
    }
    state.consecutive_failures >= strategy.failure_threshold
}
