use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::Pod;
use kube::api::{EvictParams, ListParams};
use kube::{Api, Client, ResourceExt};

use crate::skyhook::node_wrapper::NodeWrapper;
use crate::util::Error;

/// Labels identifying workload pods a Skyhook must never evict (§3,
/// `podNonInterruptLabels`) — e.g. the operator's own runner pods, or a
/// user's pinned system daemons. A pod is protected if it carries every
/// key/value pair in the selector.
pub fn is_protected_pod(pod: &Pod, non_interrupt_labels: &BTreeMap<String, String>) -> bool {
    if non_interrupt_labels.is_empty() {
        return false;
    }
    let pod_labels = pod.labels();
    non_interrupt_labels.iter().all(|(k, v)| pod_labels.get(k) == Some(v))
}

/// Mirror pods (static pods reflected by the kubelet) and DaemonSet pods
/// are not evictable in any meaningful sense — deleting them just gets
/// them immediately recreated by their controller, so skip them rather
/// than burn a PDB check on them.
pub fn is_skippable_for_eviction(pod: &Pod) -> bool {
    let is_mirror = pod.annotations().contains_key("kubernetes.io/config.mirror");
    let is_daemonset = pod
        .owner_references()
        .iter()
        .any(|owner| owner.kind == "DaemonSet");
    let terminal = matches!(
        pod.status.as_ref().and_then(|s| s.phase.as_deref()),
        Some("Succeeded") | Some("Failed")
    );
    is_mirror || is_daemonset || terminal
}

/// Outcome of one attempt to clear a node of interruptible workloads.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct EvictionOutcome {
    pub evicted: Vec<String>,
    pub blocked: Vec<String>,
}

impl EvictionOutcome {
    pub fn is_clear(&self) -> bool {
        self.blocked.is_empty()
    }
}

/// Evicts every interruptible pod running on `node_name`, honoring
/// PodDisruptionBudgets. A 429 from the eviction subresource means a
/// PDB would be violated; that pod is recorded as blocked rather than
/// treated as a hard failure, so the caller can keep the node in
/// `in_progress` and retry next reconcile (§4.6, §7 EvictionBlocked).
pub async fn evict_workloads(
    client: Client,
    node_name: &str,
    non_interrupt_labels: &BTreeMap<String, String>,
) -> Result<EvictionOutcome, Error> {
    let pods: Api<Pod> = Api::all(client.clone());
    let list = pods
        .list(&ListParams::default().fields(&format!("spec.nodeName={node_name}")))
        .await?;

    let mut outcome = EvictionOutcome::default();
    for pod in list.items {
        if is_skippable_for_eviction(&pod) || is_protected_pod(&pod, non_interrupt_labels) {
            continue;
        }
        let name = pod.name_any();
        let namespace = pod.namespace().unwrap_or_default();
        let namespaced_pods: Api<Pod> = Api::namespaced(client.clone(), &namespace);
        match namespaced_pods.evict(&name, &EvictParams::default()).await {
            Ok(_) => outcome.evicted.push(name),
            Err(kube::Error::Api(resp)) if resp.code == 429 => outcome.blocked.push(name),
            Err(e) => return Err(e.into()),
        }
    }
    Ok(outcome)
}

/// Marks this Skyhook's cordon on the node (own annotation marker plus
/// `spec.unschedulable`) ahead of an interrupt (§4.6).
pub fn cordon_node(wrapper: &mut NodeWrapper) {
    wrapper.set_own_cordon_marker(true);
    wrapper.set_cordon(true);
}

/// Releases this Skyhook's cordon. The node spec itself is only
/// uncordoned once no other Skyhook still holds a cordon marker (I6).
pub fn release_cordon(wrapper: &mut NodeWrapper) {
    wrapper.set_own_cordon_marker(false);
    if !wrapper.other_skyhook_holds_cordon() {
        wrapper.set_cordon(false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::PodStatus;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::{OwnerReference, ObjectMeta};

    fn labeled_pod(labels: &[(&str, &str)]) -> Pod {
        Pod {
            metadata: ObjectMeta {
                labels: Some(labels.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn protected_requires_every_label() {
        let mut selector = BTreeMap::new();
        selector.insert("skyhook/protected".to_owned(), "true".to_owned());
        let protected = labeled_pod(&[("skyhook/protected", "true")]);
        let unprotected = labeled_pod(&[("app", "nginx")]);
        assert!(is_protected_pod(&protected, &selector));
        assert!(!is_protected_pod(&unprotected, &selector));
    }

    #[test]
    fn daemonset_and_mirror_and_terminal_pods_are_skippable() {
        let mut daemonset_pod = Pod::default();
        daemonset_pod.metadata.owner_references = Some(vec![OwnerReference {
            kind: "DaemonSet".to_owned(),
            name: "d".to_owned(),
            api_version: "apps/v1".to_owned(),
            uid: "u".to_owned(),
            ..Default::default()
        }]);
        assert!(is_skippable_for_eviction(&daemonset_pod));

        let mut mirror_pod = Pod::default();
        mirror_pod.metadata.annotations = Some(
            [("kubernetes.io/config.mirror".to_owned(), "x".to_owned())]
                .into_iter()
                .collect(),
        );
        assert!(is_skippable_for_eviction(&mirror_pod));

        let mut finished_pod = Pod::default();
        finished_pod.status = Some(PodStatus {
            phase: Some("Succeeded".to_owned()),
            ..Default::default()
        });
        assert!(is_skippable_for_eviction(&finished_pod));

        assert!(!is_skippable_for_eviction(&Pod::default()));
    }
}
