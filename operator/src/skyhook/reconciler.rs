use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use chrono::Utc;
use futures::StreamExt;
use k8s_openapi::api::core::v1::{Node, Pod};
use kube::api::{ListParams, Patch, PatchParams};
use kube::runtime::controller::Action;
use kube::runtime::finalizer::{self, Event as FinalizerEvent};
use kube::runtime::Controller;
use kube::{Api, Client, Resource, ResourceExt};
use kube_leader_election::{LeaseLock, LeaseLockParams};
use serde_json::json;
use skyhook_common::{Config, log};
use skyhook_crd::{
    BatchProcessingState, Compartment, DeploymentStrategy, Package, PackageState, Skyhook,
    SkyhookPhase, Stage, State, annotations,
};
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;

use super::dag::Dag;
use super::dispatcher::{self, DispatchContext};
use super::interrupt;
use super::migration;
use super::node_wrapper::NodeWrapper;
use super::scheduler::{self, NodeCandidate};
use super::state_machine::{self, Trigger};
use super::status;
use crate::util::metrics::ControllerMetrics;
use crate::util::patch::patch_object;
use crate::util::{Error, IN_PROGRESS_INTERVAL, MANAGER_NAME, STEADY_STATE_INTERVAL};

const FINALIZER_NAME: &str = "skyhook.nvidia.com/finalizer";

/// Context shared by every `reconcile`/`on_error` invocation, built once
/// at startup — the same shape as the teacher's `ContextData`.
pub struct ContextData {
    client: Client,
    config: Arc<Config>,
    metrics: ControllerMetrics,
}

impl ContextData {
    pub fn new(client: Client, config: Arc<Config>) -> Self {
        ContextData {
            client,
            config,
            metrics: ControllerMetrics::new("skyhook"),
        }
    }
}

/// Entrypoint for the Skyhook controller (§4.1, §5). Leader election
/// gates which replica actually runs the `Controller` loop; the losing
/// replicas sit idle here, matching the teacher's lease-lock pattern in
/// its `strims::run`.
pub async fn run(client: Client, config: Arc<Config>) -> Result<(), Error> {
    log::info(config.log_level, "🌱 Starting Skyhook controller...");
    let context = Arc::new(ContextData::new(client.clone(), config.clone()));

    if !config.leader_election {
        skyhook_common::signal_ready();
        run_controller(client, context).await;
        return Ok(());
    }

    let lease_namespace = config.namespace.clone();
    let holder_id = std::env::var("POD_NAME")
        .or_else(|_| std::env::var("HOSTNAME"))
        .unwrap_or_else(|_| format!("skyhook-operator-{}", uuid::Uuid::new_v4()));
    let leadership = LeaseLock::new(
        client.clone(),
        &lease_namespace,
        LeaseLockParams {
            holder_id,
            lease_name: "skyhook-operator-lock".to_owned(),
            lease_ttl: Duration::from_secs(15),
        },
    );

    let shutdown = CancellationToken::new();
    let shutdown_signal = shutdown.clone();
    tokio::spawn(async move {
        skyhook_common::shutdown::shutdown_signal().await;
        shutdown_signal.cancel();
    });
    skyhook_common::signal_ready();

    let mut controller_task: Option<tokio::task::JoinHandle<()>> = None;
    let mut tick = tokio::time::interval(Duration::from_secs(5));
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                if let Some(task) = controller_task.take() {
                    task.abort();
                    task.await.ok();
                }
                break Ok(());
            }
            _ = tick.tick() => {}
        }

        let lease = match leadership.try_acquire_or_renew().await {
            Ok(lease) => lease,
            Err(e) => {
                log::warn(config.log_level, &format!("leader election renew/acquire failed: {e}"));
                if let Some(task) = controller_task.take() {
                    task.abort();
                }
                continue;
            }
        };

        if lease.acquired_lease {
            if controller_task.is_none() {
                log::info(config.log_level, "acquired leadership; starting controller");
                let client = client.clone();
                let context = context.clone();
                controller_task = Some(tokio::spawn(async move {
                    run_controller(client, context).await;
                }));
            }
        } else if let Some(task) = controller_task.take() {
            log::warn(config.log_level, "lost leadership; stopping controller");
            task.abort();
        }
    }
}

async fn run_controller(client: Client, context: Arc<ContextData>) {
    let skyhooks: Api<Skyhook> = Api::all(client.clone());
    let pods: Api<Pod> = Api::all(client);
    let log_level = context.config.log_level;
    log::info(log_level, "🚀 Skyhook controller started.");
    Controller::new(skyhooks, Default::default())
        .owns(pods, Default::default())
        .run(reconcile, on_error, context)
        .for_each(|res| async move {
            if let Err(e) = res {
                log::warn(log_level, &format!("reconcile failed: {e:?}"));
            }
        })
        .await;
}

/// Top-level reconcile: every event funnels through the finalizer
/// wrapper so deletion always runs `cleanup` before the object is
/// actually removed (§3, "finalizer removes all taints/cordons/
/// annotations/runner pods first").
async fn reconcile(skyhook: Arc<Skyhook>, ctx: Arc<ContextData>) -> Result<Action, Error> {
    let client = ctx.client.clone();
    let api: Api<Skyhook> = Api::all(client);
    finalizer::finalizer(&api, FINALIZER_NAME, skyhook, |event| async {
        match event {
            FinalizerEvent::Apply(skyhook) => apply(skyhook, ctx.clone()).await,
            FinalizerEvent::Cleanup(skyhook) => cleanup(skyhook, ctx.clone()).await,
        }
    })
    .await
    .map_err(|e| Error::Finalizer(e.to_string()))
}

fn on_error(skyhook: Arc<Skyhook>, error: &Error, ctx: Arc<ContextData>) -> Action {
    log::warn(
        ctx.config.log_level,
        &format!(
            "reconciliation error for {:?}: {error} (kind={:?})",
            skyhook.name_any(),
            error.kind()
        ),
    );
    match error.kind() {
        crate::util::ErrorKind::Conflict => Action::requeue(Duration::from_millis(200)),
        _ => Action::requeue(Duration::from_secs(10)),
    }
}

/// §4.1 step 1 (finalizer cleanup path): remove every taint/cordon/
/// annotation/runner pod this Skyhook placed, across every node it
/// might still be touching, before the finalizer is lifted.
async fn cleanup(skyhook: Arc<Skyhook>, ctx: Arc<ContextData>) -> Result<Action, Error> {
    let client = ctx.client.clone();
    let name = skyhook.name_any();
    let nodes_api: Api<Node> = Api::all(client.clone());
    let all_nodes = nodes_api.list(&ListParams::default()).await?;

    for node in all_nodes.items {
        let original = node.clone();
        let mut wrapper = NodeWrapper::new(node, &name);
        if wrapper.state().is_empty() && !wrapper.has_own_cordon_marker() && !wrapper.has_unschedulable_taint() {
            continue;
        }
        for key in wrapper.state().keys().cloned().collect::<Vec<_>>() {
            wrapper.remove_state(&key);
        }
        interrupt::release_cordon(&mut wrapper);
        wrapper.remove_unschedulable_taint();
        if wrapper.changed() {
            let updated = wrapper.finalize();
            patch_object(client.clone(), &original, |n| *n = updated).await?;
        }
    }

    dispatcher::delete_all_runner_pods(client, &ctx.config.namespace, &name).await?;
    Ok(Action::await_change())
}

fn label_selector(selectors: &BTreeMap<String, String>) -> String {
    selectors
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(",")
}

fn effective_compartments(skyhook: &Skyhook) -> Vec<Compartment> {
    let mut compartments = skyhook.spec.compartments.clone();
    if !compartments.iter().any(|c| c.node_selector.is_none()) {
        compartments.push(Compartment {
            name: "default".to_owned(),
            node_selector: None,
            deployment_budget: skyhook.spec.interruption_budget,
            deployment_strategy: None,
        });
    }
    compartments
}

fn classify_priority(states: &BTreeMap<String, PackageState>) -> scheduler::NodePriority {
    use scheduler::NodePriority;
    if states.values().any(|s| s.state == State::Erroring) {
        NodePriority::Erroring
    } else if states.values().any(|s| s.state == State::InProgress) {
        NodePriority::InProgress
    } else if states.is_empty() {
        NodePriority::Unknown
    } else {
        // Awaiting a drain slot: not yet picked up, not complete. §9 Open
        // Question: `blocked` is an alias for a node held at a batch slot
        // pending interruption of a protected workload.
        NodePriority::Blocked
    }
}

/// §4.1 step 2 (pause), §3 (Skyhook resource). The full decision
/// procedure for one reconcile.
async fn apply(skyhook: Arc<Skyhook>, ctx: Arc<ContextData>) -> Result<Action, Error> {
    let client = ctx.client.clone();
    let name = skyhook.name_any();
    ctx.metrics.record_reconcile(&name);
    let read_start = std::time::Instant::now();

    let generation = skyhook.meta().generation.unwrap_or(0);
    let disabled = skyhook
        .annotations()
        .get(annotations::DISABLE)
        .map(|v| v == "true")
        .unwrap_or(false);
    if disabled {
        return Ok(Action::requeue(STEADY_STATE_INTERVAL));
    }
    let paused = skyhook.spec.pause
        || skyhook
            .annotations()
            .get(annotations::PAUSE)
            .map(|v| v == "true")
            .unwrap_or(false);

    // §4.3: validate the dependency DAG before anything else is scheduled.
    let dag = Dag::new(&skyhook.spec.packages);
    if let Err(e) = dag.valid() {
        patch_skyhook_status(client.clone(), &skyhook, |s| {
            s.status = SkyhookPhase::Erroring;
            s.conditions = vec![];
            s.observed_generation = generation;
        })
        .await?;
        log::warn(ctx.config.log_level, &format!("{name}: invalid dependency graph: {e}"));
        return Ok(Action::requeue(STEADY_STATE_INTERVAL));
    }

    // §4.1 step 4: select nodes.
    let selector = label_selector(&skyhook.spec.node_selectors);
    let nodes_api: Api<Node> = Api::all(client.clone());
    let selected = nodes_api
        .list(&ListParams::default().labels(&selector))
        .await?;
    let selected_names: BTreeSet<String> = selected.items.iter().map(|n| n.name_any()).collect();
    skyhook_common::metrics::mark_ready();

    // §4.1 step 5: reset any node deselected since the last reconcile.
    let all_nodes = nodes_api.list(&ListParams::default()).await?;
    for node in all_nodes.items {
        let node_name = node.name_any();
        if selected_names.contains(&node_name) {
            continue;
        }
        let original = node.clone();
        let mut wrapper = NodeWrapper::new(node, &name);
        if wrapper.state().is_empty() && !wrapper.has_own_cordon_marker() {
            continue;
        }
        for key in wrapper.state().keys().cloned().collect::<Vec<_>>() {
            wrapper.remove_state(&key);
        }
        interrupt::release_cordon(&mut wrapper);
        wrapper.remove_unschedulable_taint();
        dispatcher::delete_runner_pods_for_node(client.clone(), &ctx.config.namespace, &name, &node_name).await?;
        if wrapper.changed() {
            let updated = wrapper.finalize();
            patch_object(client.clone(), &original, |n| *n = updated).await?;
        }
    }

    // Wrap every selected node, applying any pending migration (§4.8).
    let recorded_version = skyhook.annotations().get(&annotations::version_key(&name)).cloned();
    let pending_migration = migration::needs_migration(recorded_version.as_deref());
    let mut entries: Vec<(Node, NodeWrapper)> = Vec::with_capacity(selected.items.len());
    for node in selected.items {
        let original = node.clone();
        let mut wrapper = NodeWrapper::new(node, &name);
        if pending_migration {
            let mut state = wrapper.state().clone();
            migration::migrate(&mut state, &skyhook.spec.packages);
            for (key, entry) in state {
                wrapper.upsert(&key, |e| *e = entry);
            }
        }
        if skyhook.spec.reapply_on_reboot
            && let Some(boot_id) = wrapper.boot_id()
            && skyhook
                .status
                .as_ref()
                .and_then(|s| s.node_boot_ids.get(&original.name_any()))
                != Some(&boot_id)
        {
            for key in wrapper.state().keys().cloned().collect::<Vec<_>>() {
                wrapper.upsert(&key, |e| {
                    if e.state == State::Complete {
                        e.stage = Stage::Apply;
                        e.state = State::Unknown;
                    }
                });
            }
        }
        entries.push((original, wrapper));
    }

    ctx.metrics.observe_read(&name, read_start.elapsed().as_secs_f64());
    let write_start = std::time::Instant::now();

    // §4.2 "configUpdates": diff every package's configMap against the
    // snapshot this Skyhook last recorded, so a trigger can re-enter
    // `config` for a package otherwise settled. The snapshot only
    // advances once the whole rollout reaches `complete`, so the diff
    // (and the trigger it drives) stays stable across every reconcile
    // in between, however many the interruption budget spreads it over.
    let config_snapshot_key = annotations::config_snapshot_key(&name);
    let previous_config: BTreeMap<String, BTreeMap<String, String>> = skyhook
        .annotations()
        .get(&config_snapshot_key)
        .and_then(|raw| serde_json::from_str(raw).ok())
        .unwrap_or_default();
    let mut config_updates: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for (pkg_name, pkg) in &skyhook.spec.packages {
        let current_map = pkg.config_map.clone().unwrap_or_default();
        let prev_map = previous_config.get(pkg_name).cloned().unwrap_or_default();
        let changed: Vec<String> = current_map
            .iter()
            .filter(|(k, v)| prev_map.get(*k) != Some(*v))
            .map(|(k, _)| k.clone())
            .collect();
        if !changed.is_empty() {
            config_updates.insert(pkg_name.clone(), changed);
        }
    }

    let mut batch_states = skyhook.status.as_ref().map(|s| s.compartments.clone()).unwrap_or_default();
    if !paused {
        batch_states = dispatch_cycle(&skyhook, &ctx, &mut entries, &config_updates).await?;
        poll_terminal_pods(&skyhook, &ctx, &mut entries).await?;
    }

    // §4.7 status aggregation.
    let mut node_state: BTreeMap<String, BTreeMap<String, PackageState>> = BTreeMap::new();
    let mut node_status: BTreeMap<String, SkyhookPhase> = BTreeMap::new();
    let mut node_boot_ids: BTreeMap<String, String> = BTreeMap::new();
    let mut node_priority = skyhook
        .status
        .as_ref()
        .map(|s| s.node_priority.clone())
        .unwrap_or_default();
    let now = Utc::now().to_rfc3339();
    let now_dt = Utc::now();

    for (node, wrapper) in entries.iter_mut() {
        let node_name = node.name_any();
        let phase = status::node_phase(wrapper.state());
        node_state.insert(node_name.clone(), wrapper.state().clone());
        node_status.insert(node_name.clone(), phase);
        if let Some(boot_id) = wrapper.boot_id() {
            node_boot_ids.insert(node_name.clone(), boot_id);
        }
        match phase {
            SkyhookPhase::Complete => {
                node_priority.remove(&node_name);
                if skyhook.spec.runtime_required {
                    wrapper.remove_runtime_required_taint(&ctx.config.runtime_required_taint);
                }
            }
            SkyhookPhase::InProgress => {
                node_priority.entry(node_name).or_insert_with(|| now.clone());
            }
            _ => {}
        }
        let message = format!("{} of {} packages complete", wrapper.get_complete().len(), skyhook.spec.packages.len());
        // §6, §4.7: mirror this node's roll-up onto the Node itself, not
        // just the Skyhook's own status.
        wrapper.set_status_label(phase);
        wrapper.set_conditions(status::node_conditions(&name, phase, &message, now_dt));
    }

    ctx.metrics.set_nodes_in_progress(&name, status::nodes_in_progress(&node_status));
    ctx.metrics.observe_write(&name, write_start.elapsed().as_secs_f64());

    let overall = status::skyhook_phase(&node_status, generation, generation);
    let package_list = status::sorted_package_list(&skyhook);
    let complete_nodes = status::complete_nodes_fraction(&node_status);
    let nodes_in_progress = status::nodes_in_progress(&node_status);
    let skyhook_conditions = status::skyhook_conditions(overall, now_dt);

    patch_skyhook_status(client.clone(), &skyhook, |s| {
        s.node_state = node_state;
        s.node_status = node_status;
        s.node_boot_ids = node_boot_ids;
        s.node_priority = node_priority;
        s.status = overall;
        s.package_list = package_list;
        s.complete_nodes = complete_nodes;
        s.nodes_in_progress = nodes_in_progress;
        s.conditions = skyhook_conditions;
        s.observed_generation = generation;
        s.config_updates = config_updates.clone();
        s.compartments = batch_states.clone();
    })
    .await?;

    if overall == SkyhookPhase::Complete {
        commit_config_snapshot(client.clone(), &skyhook, &config_snapshot_key).await?;
    }

    // §5, "all mutations are expressed as... patches applied at the very
    // end of reconcile after the full decision is computed": every
    // wrapper mutation accumulated across this reconcile — stage
    // dispatch, pod-outcome application, status-label/condition mirroring
    // — is persisted here, in one pass, after every decision is final.
    for (node, wrapper) in entries.iter_mut() {
        if wrapper.changed() {
            let updated = wrapper.clone().finalize();
            patch_object(client.clone(), node, |n| *n = updated).await?;
        }
        if wrapper.conditions_changed()
            && let Some(node_conditions) = wrapper.take_conditions()
        {
            crate::util::patch::patch_status(client.clone(), node, |s: &mut k8s_openapi::api::core::v1::NodeStatus| {
                s.conditions = Some(node_conditions);
            })
            .await?;
        }
    }

    if pending_migration {
        stamp_version(client.clone(), &skyhook).await?;
    }

    let requeue = if nodes_in_progress > 0 {
        IN_PROGRESS_INTERVAL
    } else {
        STEADY_STATE_INTERVAL
    };
    Ok(Action::requeue(requeue))
}

async fn patch_skyhook_status(
    client: Client,
    skyhook: &Skyhook,
    f: impl FnOnce(&mut skyhook_crd::SkyhookStatus),
) -> Result<(), Error> {
    crate::util::patch::patch_status(client, skyhook, f).await?;
    Ok(())
}

/// Records the configMap state `config_updates` was just diffed against,
/// so the next reconcile only reports genuinely new changes (§4.2).
async fn commit_config_snapshot(client: Client, skyhook: &Skyhook, key: &str) -> Result<(), Error> {
    let snapshot: BTreeMap<String, BTreeMap<String, String>> = skyhook
        .spec
        .packages
        .iter()
        .map(|(name, pkg)| (name.clone(), pkg.config_map.clone().unwrap_or_default()))
        .collect();
    let raw = serde_json::to_string(&snapshot).expect("snapshot is always serializable");
    let api: Api<Skyhook> = Api::all(client);
    let patch = json!({ "metadata": { "annotations": { key: raw } } });
    api.patch(&skyhook.name_any(), &PatchParams::apply(MANAGER_NAME), &Patch::Merge(patch))
        .await?;
    Ok(())
}

async fn stamp_version(client: Client, skyhook: &Skyhook) -> Result<(), Error> {
    let api: Api<Skyhook> = Api::all(client);
    let key = annotations::version_key(&skyhook.name_any());
    let patch = json!({ "metadata": { "annotations": { key: skyhook_crd::BUILD_VERSION } } });
    api.patch(
        &skyhook.name_any(),
        &PatchParams::apply(MANAGER_NAME),
        &Patch::Merge(patch),
    )
    .await?;
    Ok(())
}

/// §4.1 steps 6–7, §4.3, §4.4, §4.6: for each compartment, ask the
/// scheduler which nodes may advance this cycle, then drive the DAG and
/// state machine for each to decide the next (package, stage) and
/// dispatch it. Returns the updated per-compartment batch bookkeeping
/// for compartments running a [`DeploymentStrategy`] (§4.4).
async fn dispatch_cycle(
    skyhook: &Skyhook,
    ctx: &ContextData,
    entries: &mut [(Node, NodeWrapper)],
    config_updates: &BTreeMap<String, Vec<String>>,
) -> Result<BTreeMap<String, BatchProcessingState>, Error> {
    let name = skyhook.name_any();
    let compartments = effective_compartments(skyhook);
    let mut batch_states = skyhook.status.as_ref().map(|s| s.compartments.clone()).unwrap_or_default();

    let mut groups: BTreeMap<String, Vec<usize>> = BTreeMap::new();
    for (idx, (node, _)) in entries.iter().enumerate() {
        let labels = node.labels().clone();
        let compartment_name = scheduler::assign_compartment(&labels, &compartments)
            .map(|c| c.name.clone())
            .unwrap_or_else(|| "default".to_owned());
        groups.entry(compartment_name).or_default().push(idx);
    }

    for (compartment_name, idxs) in groups {
        let compartment = compartments.iter().find(|c| c.name == compartment_name);
        let budget = compartment
            .map(|c| c.deployment_budget)
            .unwrap_or(skyhook.spec.interruption_budget);
        let ceiling = scheduler::apply_serial_cap(budget.ceiling(idxs.len()), skyhook.spec.serial);
        ctx.metrics.set_interrupt_budget_ceiling(&name, ceiling);

        let previously_selected: BTreeSet<String> = skyhook
            .status
            .as_ref()
            .map(|s| s.node_priority.keys().cloned().collect())
            .unwrap_or_default();

        let active: BTreeSet<String> = if let Some(strategy) = compartment.and_then(|c| c.deployment_strategy) {
            let state = batch_states.entry(compartment_name.clone()).or_default();
            fixed_strategy_active_set(&strategy, state, entries, &idxs, &ctx.metrics, &name, &compartment_name)
        } else {
            let candidates: Vec<NodeCandidate> = idxs
                .iter()
                .filter(|&&idx| status::node_phase(entries[idx].1.state()) != SkyhookPhase::Complete)
                .map(|&idx| {
                    let node_name = entries[idx].0.name_any();
                    NodeCandidate {
                        previously_selected: previously_selected.contains(&node_name),
                        priority: classify_priority(entries[idx].1.state()),
                        name: node_name,
                    }
                })
                .collect();
            scheduler::select_active_nodes(candidates, ceiling).into_iter().collect()
        };

        for idx in idxs {
            let node_name = entries[idx].0.name_any();
            if !active.contains(&node_name) {
                continue;
            }
            let (node, wrapper) = (entries[idx].0.clone(), &mut entries[idx].1);
            run_node_cycle(skyhook, ctx, &node, wrapper, config_updates).await?;
        }
    }
    Ok(batch_states)
}

/// Decides which nodes in one compartment may advance this cycle under a
/// [`DeploymentStrategy`] (§4.4, "Strategy"): re-yield an in-flight
/// batch's nodes unresolved; once every node in the batch reaches a
/// terminal phase, score the batch, fold it into `consecutive_failures`/
/// `should_stop`, and either halt or start the next (doubled, capped)
/// batch. Node order within a compartment is alphabetical and stable, so
/// `processed_nodes` alone can resume the walk after a restart.
fn fixed_strategy_active_set(
    strategy: &DeploymentStrategy,
    state: &mut BatchProcessingState,
    entries: &[(Node, NodeWrapper)],
    idxs: &[usize],
    metrics: &ControllerMetrics,
    skyhook_name: &str,
    compartment_name: &str,
) -> BTreeSet<String> {
    let mut candidate_names: Vec<String> = idxs.iter().map(|&i| entries[i].0.name_any()).collect();
    candidate_names.sort();

    let phase_of = |name: &str| -> SkyhookPhase {
        idxs.iter()
            .map(|&i| &entries[i])
            .find(|(n, _)| n.name_any() == name)
            .map(|(_, w)| status::node_phase(w.state()))
            .unwrap_or(SkyhookPhase::Unknown)
    };

    if !state.current_batch_nodes.is_empty() {
        let unresolved = state
            .current_batch_nodes
            .iter()
            .filter(|n| matches!(phase_of(n), SkyhookPhase::InProgress | SkyhookPhase::Unknown))
            .count();
        if unresolved > 0 {
            state.successful_in_batch =
                state.current_batch_nodes.iter().filter(|n| phase_of(n) == SkyhookPhase::Complete).count() as u32;
            state.failed_in_batch =
                state.current_batch_nodes.iter().filter(|n| phase_of(n) == SkyhookPhase::Erroring).count() as u32;
            return state.current_batch_nodes.iter().cloned().collect();
        }

        state.successful_in_batch =
            state.current_batch_nodes.iter().filter(|n| phase_of(n) == SkyhookPhase::Complete).count() as u32;
        state.failed_in_batch =
            state.current_batch_nodes.iter().filter(|n| phase_of(n) == SkyhookPhase::Erroring).count() as u32;
        let healthy = scheduler::batch_is_healthy(strategy, state);
        metrics.record_batch_evaluation(skyhook_name, compartment_name, healthy);
        state.consecutive_failures = if healthy { 0 } else { state.consecutive_failures + 1 };
        let last_batch_size = state.current_batch_nodes.len();
        state.processed_nodes += last_batch_size as u32;
        let progress_percent = ((state.processed_nodes as usize * 100) / candidate_names.len().max(1)) as u8;
        state.should_stop = scheduler::should_stop_rollout(strategy, state, progress_percent);
        state.current_batch += 1;
        state.current_batch_nodes.clear();
        state.successful_in_batch = 0;
        state.failed_in_batch = 0;
        if state.should_stop {
            return BTreeSet::new();
        }
        return start_next_batch(strategy, state, &candidate_names, last_batch_size);
    }

    if state.should_stop {
        return BTreeSet::new();
    }
    start_next_batch(strategy, state, &candidate_names, 0)
}

fn start_next_batch(
    strategy: &DeploymentStrategy,
    state: &mut BatchProcessingState,
    candidate_names: &[String],
    last_batch_size: usize,
) -> BTreeSet<String> {
    let remaining = candidate_names.len().saturating_sub(state.processed_nodes as usize);
    if remaining == 0 {
        return BTreeSet::new();
    }
    let size = scheduler::next_batch_size(strategy, last_batch_size, remaining);
    let batch: Vec<String> = candidate_names
        .iter()
        .skip(state.processed_nodes as usize)
        .take(size)
        .cloned()
        .collect();
    state.current_batch_nodes = batch.clone();
    batch.into_iter().collect()
}

/// §4.2, §4.3, §4.5, §4.6: decide and dispatch the next stage for a
/// single node, or advance bookkeeping when its trigger path is
/// already exhausted.
async fn run_node_cycle(
    skyhook: &Skyhook,
    ctx: &ContextData,
    node: &Node,
    wrapper: &mut NodeWrapper,
    config_updates: &BTreeMap<String, Vec<String>>,
) -> Result<(), Error> {
    let skyhook_name = skyhook.name_any();
    let node_name = node.name_any();
    let packages = &skyhook.spec.packages;
    let dag = Dag::new(packages);
    let runnable = dag.run_next(&wrapper.get_complete());
    let Some(package_name) = runnable.first() else {
        return Ok(());
    };
    let Some(package) = packages.get(package_name) else {
        return Ok(());
    };
    let package_key = package.key();
    let changed_keys: &[String] = config_updates.get(package_name).map(Vec::as_slice).unwrap_or_default();

    let trigger = state_machine::decide_trigger(wrapper.get(&package_key), Some(package), changed_keys);
    let sequence = state_machine::sequence_for(&trigger, Some(package), changed_keys);
    let stage = match state_machine::next_stage(wrapper.get(&package_key), &trigger, sequence) {
        Some(stage) => stage,
        None => {
            match trigger {
                Trigger::Install | Trigger::Upgrade | Trigger::ConfigChange => {
                    wrapper.upsert(&package_key, |e| e.state = State::Complete);
                }
                Trigger::Uninstall => wrapper.remove_state(&package_key),
                Trigger::Continue | Trigger::Settled => {}
            }
            return Ok(());
        }
    };

    wrapper.upsert(&package_key, |e| {
        e.name = package.name.clone();
        e.version = package.version.to_string();
        e.image = package.image.clone();
        e.stage = stage;
        if matches!(e.state, State::Complete | State::Unknown | State::Skipped) {
            e.state = State::InProgress;
        }
    });
    ctx.metrics
        .record_package_stage(&skyhook_name, package_name, &format!("{stage:?}"), "in_progress");

    match stage {
        Stage::Interrupt => {
            interrupt::cordon_node(wrapper);
            let outcome =
                interrupt::evict_workloads(ctx.client.clone(), &node_name, &skyhook.spec.pod_non_interrupt_labels).await?;
            if !outcome.is_clear() {
                // Protected or PDB-blocked workloads remain; stay
                // in_progress without placing the unschedulable taint
                // or dispatching the interrupt pod yet (§4.6 scenario 2,
                // §7 EvictionBlocked).
                return Ok(());
            }
            wrapper.ensure_unschedulable_taint();
            mark_skipped_siblings(wrapper, packages, package);
        }
        Stage::PostInterrupt => {
            wrapper.ensure_unschedulable_taint();
        }
        _ => {}
    }

    dispatch_stage(ctx, skyhook, node, package, stage).await
}

/// §4.2 "Skipped packages": when `package`'s interrupt is about to run,
/// pre-mark any sibling package whose own interrupt would restart the
/// same services as `Skipped` rather than `InProgress` — so the DAG
/// walker's next pass over it dispatches nothing, and its stage is
/// promoted straight to `Complete` once `package`'s interrupt succeeds
/// (see `promote_skipped_siblings`).
fn mark_skipped_siblings(wrapper: &mut NodeWrapper, packages: &BTreeMap<String, Package>, package: &Package) {
    let Some(interrupt) = &package.interrupt else { return };
    for (other_name, other) in packages {
        if other_name == &package.name {
            continue;
        }
        let Some(other_interrupt) = &other.interrupt else { continue };
        if !state_machine::interrupts_overlap(interrupt, other_interrupt) {
            continue;
        }
        let other_key = other.key();
        let already_done = wrapper.get(&other_key).is_some_and(|e| e.state == State::Complete);
        if already_done {
            continue;
        }
        wrapper.upsert(&other_key, |e| {
            e.name = other.name.clone();
            e.version = other.version.to_string();
            e.image = other.image.clone();
            e.stage = Stage::Interrupt;
            e.state = State::Skipped;
        });
    }
}

/// The other half of `mark_skipped_siblings`: once `completed`'s
/// interrupt actually succeeds, promote every sibling its interrupt
/// covers from `Skipped` to `Complete` (§4.2, `ProgressSkipped`).
fn promote_skipped_siblings(wrapper: &mut NodeWrapper, packages: &BTreeMap<String, Package>, completed: &Package) {
    let Some(interrupt) = &completed.interrupt else { return };
    let skipped_keys: Vec<String> = wrapper
        .state()
        .iter()
        .filter(|(_, e)| e.state == State::Skipped)
        .map(|(k, _)| k.clone())
        .collect();
    for key in skipped_keys {
        let Some((name, _)) = skyhook_crd::split_package_key(&key) else { continue };
        let Some(pkg) = packages.get(name) else { continue };
        let Some(pkg_interrupt) = &pkg.interrupt else { continue };
        if state_machine::interrupts_overlap(interrupt, pkg_interrupt) {
            wrapper.progress_skipped(&key);
        }
    }
}

async fn dispatch_stage(ctx: &ContextData, skyhook: &Skyhook, node: &Node, package: &Package, stage: Stage) -> Result<(), Error> {
    let node_name = node.name_any();
    let skyhook_name = skyhook.name_any();
    let namespace = &ctx.config.namespace;
    let existing = dispatcher::find_runner_pod(ctx.client.clone(), namespace, &skyhook_name, &node_name).await?;
    let tolerations =
        dispatcher::runner_tolerations(&skyhook.spec.additional_tolerations, &ctx.config.runtime_required_taint);
    let dispatch_ctx = DispatchContext {
        namespace: namespace.clone(),
        pause_image: ctx.config.pause_image.clone(),
        default_agent_image: ctx.config.agent_image.clone(),
        image_pull_secret: ctx.config.image_pull_secret.clone(),
        copy_dir_root: ctx.config.copy_dir_root.clone(),
        agent_log_root: ctx.config.agent_log_root.clone(),
    };
    let pod = dispatcher::build_runner_pod(&dispatch_ctx, skyhook, &node_name, package, stage, tolerations);
    dispatcher::ensure_runner_pod(ctx.client.clone(), namespace, pod, existing).await
}

/// §4.1 step 8, §4.2 "Transitions": apply every terminal runner pod's
/// outcome into the relevant wrapper, then delete the pod (I1).
async fn poll_terminal_pods(skyhook: &Skyhook, ctx: &ContextData, entries: &mut [(Node, NodeWrapper)]) -> Result<(), Error> {
    let skyhook_name = skyhook.name_any();
    let namespace = &ctx.config.namespace;
    for (node, wrapper) in entries.iter_mut() {
        let node_name = node.name_any();
        let in_progress: Vec<String> = wrapper
            .state()
            .iter()
            .filter(|(_, s)| s.state == State::InProgress)
            .map(|(k, _)| k.clone())
            .collect();
        for package_key in in_progress {
            let Some(pod) = dispatcher::find_runner_pod(ctx.client.clone(), namespace, &skyhook_name, &node_name).await? else {
                continue;
            };
            let Some(succeeded) = dispatcher::terminal_outcome(&pod) else {
                continue;
            };
            let stage_before = wrapper.get(&package_key).map(|e| e.stage);
            wrapper.upsert(&package_key, |e| state_machine::apply_pod_outcome(e, succeeded));
            ctx.metrics.record_package_stage(
                &skyhook_name,
                &package_key,
                &format!("{:?}", stage_before.unwrap_or(Stage::Apply)),
                if succeeded { "complete" } else { "erroring" },
            );

            let pods: Api<Pod> = Api::namespaced(ctx.client.clone(), namespace);
            pods.delete(&pod.name_any(), &Default::default()).await?;

            if succeeded && stage_before == Some(Stage::PostInterrupt) {
                interrupt::release_cordon(wrapper);
                wrapper.remove_unschedulable_taint();
                wrapper.progress_skipped(&package_key);
                if let Some((pkg_name, _)) = skyhook_crd::split_package_key(&package_key)
                    && let Some(pkg) = skyhook.spec.packages.get(pkg_name)
                {
                    promote_skipped_siblings(wrapper, &skyhook.spec.packages, pkg);
                }
            }
            if succeeded && stage_before == Some(Stage::Uninstall) {
                wrapper.remove_state(&package_key);
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod skipped_siblings_tests {
    use k8s_openapi::api::core::v1::Node;
    use semver::Version;
    use skyhook_crd::InterruptKind;

    use super::*;

    fn pkg(name: &str, services: &[&str]) -> Package {
        Package {
            name: name.to_owned(),
            version: Version::parse("1.0.0").unwrap(),
            image: format!("example/{name}:1.0.0"),
            env: None,
            config_map: None,
            config_interrupts: None,
            interrupt: Some(skyhook_crd::Interrupt {
                kind: InterruptKind::Service,
                services: services.iter().map(|s| s.to_string()).collect(),
            }),
            depends_on: None,
            resources: None,
            graceful_shutdown: None,
            agent_image_override: None,
        }
    }

    fn bare_node() -> Node {
        Node {
            metadata: kube::api::ObjectMeta { name: Some("node-a".to_owned()), ..Default::default() },
            ..Default::default()
        }
    }

    /// §8 Scenario-adjacent: two packages whose interrupts both restart
    /// `nvidia-fabricmanager`. Running A's interrupt pre-marks B
    /// `Skipped`; once A's post-interrupt succeeds, B is promoted to
    /// `Complete` without ever dispatching its own interrupt pod.
    #[test]
    fn sibling_with_overlapping_service_is_skipped_then_promoted() {
        let a = pkg("driver-a", &["nvidia-fabricmanager"]);
        let b = pkg("driver-b", &["nvidia-fabricmanager", "kubelet"]);
        let unrelated = pkg("driver-c", &["containerd"]);
        let packages: BTreeMap<String, Package> =
            [(a.name.clone(), a.clone()), (b.name.clone(), b.clone()), (unrelated.name.clone(), unrelated.clone())]
                .into_iter()
                .collect();

        let mut wrapper = NodeWrapper::new(bare_node(), "gpu-driver");
        mark_skipped_siblings(&mut wrapper, &packages, &a);

        assert_eq!(wrapper.get(&b.key()).unwrap().state, State::Skipped);
        assert!(wrapper.get(&unrelated.key()).is_none(), "non-overlapping sibling must not be touched");

        promote_skipped_siblings(&mut wrapper, &packages, &a);
        assert_eq!(wrapper.get(&b.key()).unwrap().state, State::Complete);
    }

    #[test]
    fn already_complete_sibling_is_left_alone() {
        let a = pkg("driver-a", &["nvidia-fabricmanager"]);
        let b = pkg("driver-b", &["nvidia-fabricmanager"]);
        let packages: BTreeMap<String, Package> =
            [(a.name.clone(), a.clone()), (b.name.clone(), b.clone())].into_iter().collect();

        let mut wrapper = NodeWrapper::new(bare_node(), "gpu-driver");
        wrapper.upsert(&b.key(), |e| {
            e.name = b.name.clone();
            e.version = b.version.to_string();
            e.image = b.image.clone();
            e.state = State::Complete;
        });
        mark_skipped_siblings(&mut wrapper, &packages, &a);
        assert_eq!(wrapper.get(&b.key()).unwrap().state, State::Complete, "must not regress a completed sibling");
    }
}
