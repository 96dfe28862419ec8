use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{Node, NodeCondition, Taint};
use kube::{Resource, ResourceExt};
use skyhook_crd::{PackageState, SkyhookPhase, Stage, State, annotations, taints};

use crate::util::merge::{ensure_taint, remove_taint, set_annotation};

/// Projects a raw cluster `Node` plus the parsed `nodeState_<skyhook>`
/// annotation for one Skyhook, so every taint/label/annotation/state
/// mutation during one reconcile is coalesced onto a single object and
/// the wrapper can report whether a write-back is needed (§3, "Node
/// wrapper"). No mutation of the underlying Node happens outside this
/// type during reconciliation (invariant).
#[derive(Debug, Clone)]
pub struct NodeWrapper {
    node: Node,
    skyhook_name: String,
    state: BTreeMap<String, PackageState>,
    changed: bool,
    /// Set when [`Self::set_conditions`] computes a merged condition list
    /// that differs from what's on the wrapped Node — `status.conditions`
    /// is a subresource, so it needs its own patch call, separate from
    /// `changed` (§4.7, "Conditions emitted per node").
    pending_conditions: Option<Vec<NodeCondition>>,
}

impl NodeWrapper {
    pub fn new(node: Node, skyhook_name: &str) -> Self {
        let state = node
            .annotations()
            .get(&annotations::node_state_key(skyhook_name))
            .and_then(|raw| serde_json::from_str::<BTreeMap<String, PackageState>>(raw).ok())
            .unwrap_or_default();
        NodeWrapper {
            node,
            skyhook_name: skyhook_name.to_owned(),
            state,
            changed: false,
            pending_conditions: None,
        }
    }

    pub fn name(&self) -> String {
        self.node.name_any()
    }

    pub fn node(&self) -> &Node {
        &self.node
    }

    pub fn changed(&self) -> bool {
        self.changed
    }

    pub fn state(&self) -> &BTreeMap<String, PackageState> {
        &self.state
    }

    pub fn get(&self, package_key: &str) -> Option<&PackageState> {
        self.state.get(package_key)
    }

    /// Inserts or mutates the entry for `package_key`, setting `changed`
    /// only when the entry actually differs afterward (§4.2 invariant,
    /// bounding annotation rewrites).
    pub fn upsert(&mut self, package_key: &str, f: impl FnOnce(&mut PackageState)) {
        let mut entry = self
            .state
            .get(package_key)
            .cloned()
            .unwrap_or_else(|| PackageState::new("", "", "", Stage::Apply));
        let before = entry.clone();
        f(&mut entry);
        if entry != before || !self.state.contains_key(package_key) {
            self.state.insert(package_key.to_owned(), entry);
            self.changed = true;
        }
    }

    /// Drops `package_key` from state. Used on successful uninstall and
    /// on deselection.
    pub fn remove_state(&mut self, package_key: &str) {
        if self.state.remove(package_key).is_some() {
            self.changed = true;
        }
    }

    /// Package *names* (not keys) whose current entry is `Complete`,
    /// the `completed` set `RunNext` hands to the DAG walker.
    pub fn get_complete(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .state
            .values()
            .filter(|s| s.state == State::Complete)
            .map(|s| s.name.clone())
            .collect();
        names.sort();
        names.dedup();
        names
    }

    /// Promotes a `Skipped` entry to `Complete` for the given package
    /// key (§4.2, `ProgressSkipped`).
    pub fn progress_skipped(&mut self, package_key: &str) {
        self.upsert(package_key, |s| {
            if s.state == State::Skipped {
                s.state = State::Complete;
            }
        });
    }

    pub fn boot_id(&self) -> Option<String> {
        self.node
            .status
            .as_ref()
            .and_then(|s| s.node_info.as_ref())
            .map(|i| i.boot_id.clone())
    }

    pub fn set_cordon(&mut self, cordoned: bool) {
        let spec = self.node.spec.get_or_insert_with(Default::default);
        if spec.unschedulable.unwrap_or(false) != cordoned {
            spec.unschedulable = Some(cordoned);
            self.changed = true;
        }
    }

    pub fn is_cordoned(&self) -> bool {
        self.node
            .spec
            .as_ref()
            .and_then(|s| s.unschedulable)
            .unwrap_or(false)
    }

    /// Marks this Skyhook's own cordon annotation (§6, `cordon_<skyhook>`),
    /// distinct from the spec-level `unschedulable` flag so a reconcile
    /// can tell whether *this* Skyhook asked for the cordon (I6).
    pub fn set_own_cordon_marker(&mut self, cordoned: bool) {
        let annotations = self.node.meta_mut().annotations.get_or_insert_with(Default::default);
        let key = annotations::cordon_key(&self.skyhook_name);
        let changed = if cordoned {
            set_annotation(annotations, &key, "true".to_owned())
        } else {
            annotations.remove(&key).is_some()
        };
        self.changed |= changed;
    }

    pub fn has_own_cordon_marker(&self) -> bool {
        self.node
            .annotations()
            .get(&annotations::cordon_key(&self.skyhook_name))
            .map(|v| v == "true")
            .unwrap_or(false)
    }

    /// Any *other* Skyhook's cordon marker is still present — per I6,
    /// only the last remover may uncordon the node spec.
    pub fn other_skyhook_holds_cordon(&self) -> bool {
        let prefix = annotations::CORDON_PREFIX;
        let mine = annotations::cordon_key(&self.skyhook_name);
        self.node
            .annotations()
            .iter()
            .any(|(k, v)| k.starts_with(prefix) && k != &mine && v == "true")
    }

    pub fn ensure_unschedulable_taint(&mut self) {
        let spec = self.node.spec.get_or_insert_with(Default::default);
        let taints = spec.taints.get_or_insert_with(Vec::new);
        self.changed |= ensure_taint(
            taints,
            Taint {
                key: taints::UNSCHEDULABLE.to_owned(),
                effect: "NoSchedule".to_owned(),
                value: None,
                time_added: None,
            },
        );
    }

    pub fn remove_unschedulable_taint(&mut self) {
        if let Some(spec) = self.node.spec.as_mut()
            && let Some(taints) = spec.taints.as_mut()
        {
            self.changed |= remove_taint(taints, taints::UNSCHEDULABLE);
        }
    }

    pub fn has_unschedulable_taint(&self) -> bool {
        self.node
            .spec
            .as_ref()
            .and_then(|s| s.taints.as_ref())
            .is_some_and(|taints| taints.iter().any(|t| t.key == taints::UNSCHEDULABLE))
    }

    /// Lifts the runtime-required gate taint (§6) once a `runtimeRequired`
    /// Skyhook finishes on this node. The key is configurable
    /// (`RUNTIME_REQUIRED_TAINT`), so unlike the unschedulable taint this
    /// is not a fixed constant.
    pub fn remove_runtime_required_taint(&mut self, key: &str) {
        if let Some(spec) = self.node.spec.as_mut()
            && let Some(taints) = spec.taints.as_mut()
        {
            self.changed |= remove_taint(taints, key);
        }
    }

    /// Mirrors this Skyhook's roll-up phase for the node onto both the
    /// `status_<skyhook>` annotation and the identically-keyed label
    /// (§6, "also mirrored as a Node label with the same key").
    pub fn set_status_label(&mut self, phase: SkyhookPhase) {
        let key = annotations::status_key(&self.skyhook_name);
        let value = phase.to_string();
        let annotations = self.node.meta_mut().annotations.get_or_insert_with(Default::default);
        self.changed |= set_annotation(annotations, &key, value.clone());
        let labels = self.node.meta_mut().labels.get_or_insert_with(Default::default);
        self.changed |= set_annotation(labels, &key, value);
    }

    /// Merges `new_conditions` (this Skyhook's own, namespaced by type)
    /// into whatever conditions other Skyhooks (or the kubelet) already
    /// placed on the node, replacing only entries with a matching
    /// `type_`. Queues a status-subresource patch if the merged list
    /// differs from what's currently on the Node.
    pub fn set_conditions(&mut self, new_conditions: Vec<NodeCondition>) {
        let existing = self
            .node
            .status
            .as_ref()
            .and_then(|s| s.conditions.clone())
            .unwrap_or_default();
        let new_types: std::collections::BTreeSet<&str> =
            new_conditions.iter().map(|c| c.type_.as_str()).collect();
        let mut merged: Vec<NodeCondition> = existing
            .into_iter()
            .filter(|c| !new_types.contains(c.type_.as_str()))
            .collect();
        merged.extend(new_conditions);
        let current = self.node.status.as_ref().and_then(|s| s.conditions.as_ref());
        if current != Some(&merged) {
            self.pending_conditions = Some(merged);
        }
    }

    pub fn conditions_changed(&self) -> bool {
        self.pending_conditions.is_some()
    }

    /// Takes the merged condition list queued by [`Self::set_conditions`],
    /// for the caller to apply via a status-subresource patch.
    pub fn take_conditions(&mut self) -> Option<Vec<NodeCondition>> {
        self.pending_conditions.take()
    }

    /// Serializes `state` and stamps it back onto the wrapped Node's
    /// annotations if it changed since construction. Call immediately
    /// before persisting (§5, "all mutations are expressed as... patches
    /// applied at the very end of reconcile").
    pub fn finalize(mut self) -> Node {
        if self.changed {
            let key = annotations::node_state_key(&self.skyhook_name);
            let raw = serde_json::to_string(&self.state).expect("state is always serializable");
            let annotations = self.node.meta_mut().annotations.get_or_insert_with(Default::default);
            annotations.insert(key, raw);
        }
        self.node
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bare_node() -> Node {
        Node {
            metadata: kube::api::ObjectMeta {
                name: Some("node-a".to_owned()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn upsert_only_marks_changed_on_actual_change() {
        let mut wrapper = NodeWrapper::new(bare_node(), "gpu-driver");
        wrapper.upsert("driver|1.0.0", |s| {
            s.name = "driver".to_owned();
            s.version = "1.0.0".to_owned();
            s.state = State::InProgress;
        });
        assert!(wrapper.changed());

        let mut wrapper2 = NodeWrapper::new(wrapper.clone().finalize(), "gpu-driver");
        assert!(!wrapper2.changed());
        wrapper2.upsert("driver|1.0.0", |s| {
            s.state = State::InProgress;
        });
        assert!(!wrapper2.changed(), "re-applying the same state must not mark changed");
    }

    #[test]
    fn remove_state_drops_key() {
        let mut wrapper = NodeWrapper::new(bare_node(), "gpu-driver");
        wrapper.upsert("driver|1.0.0", |s| s.state = State::Complete);
        let node = wrapper.finalize();
        let mut wrapper = NodeWrapper::new(node, "gpu-driver");
        assert!(wrapper.get("driver|1.0.0").is_some());
        wrapper.remove_state("driver|1.0.0");
        assert!(wrapper.get("driver|1.0.0").is_none());
        assert!(wrapper.changed());
    }

    #[test]
    fn get_complete_returns_sorted_names() {
        let mut wrapper = NodeWrapper::new(bare_node(), "gpu-driver");
        wrapper.upsert("b|1.0.0", |s| {
            s.name = "b".to_owned();
            s.state = State::Complete;
        });
        wrapper.upsert("a|1.0.0", |s| {
            s.name = "a".to_owned();
            s.state = State::Complete;
        });
        wrapper.upsert("c|1.0.0", |s| {
            s.name = "c".to_owned();
            s.state = State::InProgress;
        });
        assert_eq!(wrapper.get_complete(), vec!["a".to_owned(), "b".to_owned()]);
    }

    #[test]
    fn status_label_sets_annotation_and_label_alike() {
        let mut wrapper = NodeWrapper::new(bare_node(), "gpu-driver");
        wrapper.set_status_label(SkyhookPhase::InProgress);
        let node = wrapper.finalize();
        let key = annotations::status_key("gpu-driver");
        assert_eq!(node.annotations().get(&key).map(String::as_str), Some("in_progress"));
        assert_eq!(node.labels().get(&key).map(String::as_str), Some("in_progress"));
    }

    #[test]
    fn conditions_merge_preserves_other_skyhooks_entries() {
        let mut node = bare_node();
        node.status = Some(k8s_openapi::api::core::v1::NodeStatus {
            conditions: Some(vec![NodeCondition {
                type_: "other-skyhook/NotReady".to_owned(),
                status: "True".to_owned(),
                ..Default::default()
            }]),
            ..Default::default()
        });
        let mut wrapper = NodeWrapper::new(node, "gpu-driver");
        wrapper.set_conditions(vec![NodeCondition {
            type_: "gpu-driver/NotReady".to_owned(),
            status: "False".to_owned(),
            ..Default::default()
        }]);
        assert!(wrapper.conditions_changed());
        let merged = wrapper.take_conditions().unwrap();
        assert_eq!(merged.len(), 2);
        assert!(merged.iter().any(|c| c.type_ == "other-skyhook/NotReady"));
        assert!(merged.iter().any(|c| c.type_ == "gpu-driver/NotReady"));
    }

    #[test]
    fn removes_configured_runtime_required_taint() {
        let mut node = bare_node();
        node.spec = Some(k8s_openapi::api::core::v1::NodeSpec {
            taints: Some(vec![Taint {
                key: "skyhook.nvidia.com/runtime-required".to_owned(),
                effect: "NoSchedule".to_owned(),
                value: None,
                time_added: None,
            }]),
            ..Default::default()
        });
        let mut wrapper = NodeWrapper::new(node, "gpu-driver");
        wrapper.remove_runtime_required_taint("skyhook.nvidia.com/runtime-required");
        assert!(wrapper.changed());
        let node = wrapper.finalize();
        assert!(node.spec.unwrap().taints.unwrap().is_empty());
    }

    #[test]
    fn cordon_marker_is_keyed_by_skyhook_name() {
        let mut a = NodeWrapper::new(bare_node(), "sh-a");
        a.set_own_cordon_marker(true);
        let node = a.finalize();

        let b = NodeWrapper::new(node.clone(), "sh-b");
        assert!(b.other_skyhook_holds_cordon());

        let a2 = NodeWrapper::new(node, "sh-a");
        assert!(!a2.other_skyhook_holds_cordon());
        assert!(a2.has_own_cordon_marker());
    }
}
