use k8s_openapi::api::core::v1::{
    Container, EmptyDirVolumeSource, EnvVar, EnvVarSource, LocalObjectReference, ObjectFieldSelector, Pod, PodSpec,
    Toleration, Volume, VolumeMount,
};
use kube::api::{ListParams, ObjectMeta};
use kube::{Api, Client, Resource, ResourceExt};
use sha2::{Digest, Sha256};
use skyhook_crd::{Package, PodPackageAnnotation, Skyhook, Stage, annotations, labels};

use crate::util::Error;

/// Well-known in-pod path where the package image's filesystem is
/// staged for every agent sub-step to read from (§4.5).
const PACKAGE_ROOT_DIR: &str = "/var/lib/skyhook/package-root";

/// Ambient image/namespace configuration the dispatcher needs but that
/// does not belong on the `Skyhook` spec itself (§6).
#[derive(Debug, Clone)]
pub struct DispatchContext {
    pub namespace: String,
    pub pause_image: String,
    pub default_agent_image: String,
    pub image_pull_secret: Option<String>,
    pub copy_dir_root: String,
    pub agent_log_root: String,
}

/// Deterministic pod name for one (skyhook, node, package, stage) —
/// hashed because node and package names together easily exceed the
/// 63-character DNS label limit.
pub fn pod_name(skyhook_name: &str, node_name: &str, package: &Package, stage: Stage) -> String {
    let mut hasher = Sha256::new();
    hasher.update(skyhook_name.as_bytes());
    hasher.update(b"|");
    hasher.update(node_name.as_bytes());
    hasher.update(b"|");
    hasher.update(package.key().as_bytes());
    hasher.update(b"|");
    hasher.update(format!("{stage:?}").as_bytes());
    let digest = hasher.finalize();
    format!("skyhook-{}", hex::encode(&digest[..10]))
}

/// Hashes the runner-relevant inputs for one dispatch so the reconciler
/// can detect drift between the pod that is running and the one the
/// current spec would produce (§4.5, "idempotent ensure").
pub fn spec_hash(package: &Package, stage: Stage) -> String {
    crate::util::hash_spec(&(package, stage))
}

/// Builds the runner pod for one (node, package, stage) dispatch. Work
/// happens in a chain of init containers: first `package-copy`, which
/// runs the *package's* own image just long enough to stage its
/// filesystem onto a shared volume at [`PACKAGE_ROOT_DIR`]; then one
/// init container per agent sub-step of the stage, each running the
/// *agent* image with arguments `(step, rootdir)` against that staged
/// filesystem. The main container is the cluster's pause image, present
/// only so the pod has a long-lived process to report phase against
/// (§4.5).
pub fn build_runner_pod(
    ctx: &DispatchContext,
    skyhook: &Skyhook,
    node_name: &str,
    package: &Package,
    stage: Stage,
    tolerations: Vec<Toleration>,
) -> Pod {
    let skyhook_name = skyhook.name_any();
    let name = pod_name(&skyhook_name, node_name, package, stage);
    let hash = spec_hash(package, stage);
    let agent_image = package
        .agent_image_override
        .clone()
        .unwrap_or_else(|| ctx.default_agent_image.clone());

    let mut env = vec![
        env_field("NODE_NAME", "spec.nodeName"),
        env_value("SKYHOOK_NAME", &skyhook_name),
        env_value("PACKAGE_NAME", &package.name),
        env_value("PACKAGE_VERSION", &package.version.to_string()),
        env_value("STAGE", stage_arg(stage)),
        env_value("COPY_DIR_ROOT", &ctx.copy_dir_root),
    ];
    if let Some(pkg_env) = &package.env {
        for (k, v) in pkg_env {
            env.push(env_value(k, v));
        }
    }

    let volumes = vec![
        host_path_volume("copy-dir", &ctx.copy_dir_root),
        host_path_volume("agent-log-root", &ctx.agent_log_root),
        Volume {
            name: "package-root".to_owned(),
            empty_dir: Some(EmptyDirVolumeSource::default()),
            ..Default::default()
        },
    ];
    let agent_volume_mounts = vec![
        VolumeMount {
            name: "copy-dir".to_owned(),
            mount_path: ctx.copy_dir_root.clone(),
            ..Default::default()
        },
        VolumeMount {
            name: "agent-log-root".to_owned(),
            mount_path: ctx.agent_log_root.clone(),
            ..Default::default()
        },
    ];
    let package_root_mount = VolumeMount {
        name: "package-root".to_owned(),
        mount_path: PACKAGE_ROOT_DIR.to_owned(),
        ..Default::default()
    };

    let package_copy_container = Container {
        name: "package-copy".to_owned(),
        image: Some(package.image.clone()),
        command: Some(vec![
            "cp".to_owned(),
            "-a".to_owned(),
            "/.".to_owned(),
            PACKAGE_ROOT_DIR.to_owned(),
        ]),
        volume_mounts: Some(vec![package_root_mount.clone()]),
        ..Default::default()
    };

    let mut init_containers = vec![package_copy_container];
    for step in sub_steps(stage) {
        let mut volume_mounts = agent_volume_mounts.clone();
        volume_mounts.push(package_root_mount.clone());
        init_containers.push(Container {
            name: format!("runner-{step}"),
            image: Some(agent_image.clone()),
            args: Some(vec![(*step).to_owned(), PACKAGE_ROOT_DIR.to_owned()]),
            env: Some(env.clone()),
            volume_mounts: Some(volume_mounts),
            resources: package.resources.clone(),
            ..Default::default()
        });
    }

    let main_container = Container {
        name: "pause".to_owned(),
        image: Some(ctx.pause_image.clone()),
        ..Default::default()
    };

    let mut pod_labels = std::collections::BTreeMap::new();
    pod_labels.insert(labels::NAME.to_owned(), skyhook_name.clone());
    pod_labels.insert(
        labels::PACKAGE.to_owned(),
        format!("{}-{}", package.name, package.version),
    );

    let pod_package = PodPackageAnnotation {
        name: package.name.clone(),
        version: package.version.to_string(),
        skyhook: skyhook_name.clone(),
        stage,
        image: package.image.clone(),
    };
    let mut pod_annotations = std::collections::BTreeMap::new();
    pod_annotations.insert(
        annotations::POD_PACKAGE.to_owned(),
        serde_json::to_string(&pod_package).expect("PodPackageAnnotation always serializes"),
    );
    pod_annotations.insert(annotations::POD_SPEC_HASH.to_owned(), hash);

    let image_pull_secrets = ctx.image_pull_secret.as_ref().map(|secret| {
        vec![LocalObjectReference {
            name: secret.clone(),
        }]
    });

    let termination_grace_period_seconds = package
        .graceful_shutdown
        .as_ref()
        .map(|g| g.grace_period_seconds);

    Pod {
        metadata: ObjectMeta {
            name: Some(name),
            namespace: Some(ctx.namespace.clone()),
            labels: Some(pod_labels),
            annotations: Some(pod_annotations),
            owner_references: Some(vec![skyhook.controller_owner_ref(&()).expect("skyhook has a name")]),
            ..Default::default()
        },
        spec: Some(PodSpec {
            node_name: Some(node_name.to_owned()),
            host_network: Some(true),
            host_pid: Some(true),
            restart_policy: Some("Never".to_owned()),
            init_containers: Some(init_containers),
            containers: vec![main_container],
            volumes: Some(volumes),
            tolerations: Some(tolerations),
            image_pull_secrets,
            termination_grace_period_seconds,
            ..Default::default()
        }),
        status: None,
    }
}

/// Agent sub-steps dispatched for one stage (§4.5: "one per sub-step of
/// the stage, e.g. `apply`, `applycheck`"). Stages that install, change,
/// or remove a package run a verification half after the action half;
/// `interrupt` and `post-interrupt` are themselves a single step each.
fn sub_steps(stage: Stage) -> &'static [&'static str] {
    match stage {
        Stage::Uninstall => &["uninstall", "uninstallcheck"],
        Stage::Apply => &["apply", "applycheck"],
        Stage::Upgrade => &["upgrade", "upgradecheck"],
        Stage::Config => &["config", "configcheck"],
        Stage::Interrupt => &["interrupt"],
        Stage::PostInterrupt => &["post-interrupt"],
    }
}

fn stage_arg(stage: Stage) -> &'static str {
    match stage {
        Stage::Uninstall => "uninstall",
        Stage::Apply => "apply",
        Stage::Upgrade => "upgrade",
        Stage::Config => "config",
        Stage::Interrupt => "interrupt",
        Stage::PostInterrupt => "post-interrupt",
    }
}

fn env_value(name: &str, value: &str) -> EnvVar {
    EnvVar {
        name: name.to_owned(),
        value: Some(value.to_owned()),
        ..Default::default()
    }
}

fn env_field(name: &str, field_path: &str) -> EnvVar {
    EnvVar {
        name: name.to_owned(),
        value_from: Some(EnvVarSource {
            field_ref: Some(ObjectFieldSelector {
                field_path: field_path.to_owned(),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn host_path_volume(name: &str, path: &str) -> Volume {
    Volume {
        name: name.to_owned(),
        host_path: Some(k8s_openapi::api::core::v1::HostPathVolumeSource {
            path: path.to_owned(),
            type_: Some("DirectoryOrCreate".to_owned()),
        }),
        ..Default::default()
    }
}

/// Whether the running pod was built from a different package/stage
/// input than `desired_hash` — the reconciler deletes and re-dispatches
/// rather than patching a running pod's immutable spec (§4.5).
pub fn needs_redispatch(existing: &Pod, desired_hash: &str) -> bool {
    existing
        .annotations()
        .get(annotations::POD_SPEC_HASH)
        .map(|h| h != desired_hash)
        .unwrap_or(true)
}

/// `Some(true)` on success, `Some(false)` on failure, `None` while the
/// pod is still pending or running (§4.5, "terminal-pod polling").
pub fn terminal_outcome(pod: &Pod) -> Option<bool> {
    match pod.status.as_ref().and_then(|s| s.phase.as_deref()) {
        Some("Succeeded") => Some(true),
        Some("Failed") => Some(false),
        _ => None,
    }
}

/// Merges a Skyhook's `additionalTolerations` with the two tolerations
/// every runner pod always needs: the configured runtime-required taint
/// (so dispatch still lands on a node gated pending its own runtime
/// package) and this Skyhook's own unschedulable taint (so dispatch
/// still lands on a node it has just cordoned) (§4.5, §4.6).
pub fn runner_tolerations(additional: &[Toleration], runtime_required_taint: &str) -> Vec<Toleration> {
    let mut tolerations = additional.to_vec();
    tolerations.push(Toleration {
        key: Some(runtime_required_taint.to_owned()),
        operator: Some("Exists".to_owned()),
        effect: Some("NoSchedule".to_owned()),
        ..Default::default()
    });
    tolerations.push(Toleration {
        key: Some(skyhook_crd::taints::UNSCHEDULABLE.to_owned()),
        operator: Some("Exists".to_owned()),
        effect: Some("NoSchedule".to_owned()),
        ..Default::default()
    });
    tolerations
}

/// The at-most-one runner pod for this (skyhook, node) pair (I1), found
/// by the `skyhook/name` label plus a `spec.nodeName` field selector —
/// there is exactly one because the dispatcher enforces it, but listing
/// rather than `get`-by-name keeps this independent of the pod-name
/// hashing scheme.
pub async fn find_runner_pod(client: Client, namespace: &str, skyhook_name: &str, node_name: &str) -> Result<Option<Pod>, Error> {
    let pods: Api<Pod> = Api::namespaced(client, namespace);
    let list = pods
        .list(
            &ListParams::default()
                .labels(&format!("{}={skyhook_name}", labels::NAME))
                .fields(&format!("spec.nodeName={node_name}")),
        )
        .await?;
    Ok(list.items.into_iter().next())
}

/// Idempotent ensure (§4.5): creates the pod if absent, leaves it alone
/// if its spec-hash annotation matches, deletes and lets the next
/// reconcile recreate it on drift.
pub async fn ensure_runner_pod(client: Client, namespace: &str, desired: Pod, existing: Option<Pod>) -> Result<(), Error> {
    let pods: Api<Pod> = Api::namespaced(client, namespace);
    let desired_hash = desired
        .annotations()
        .get(annotations::POD_SPEC_HASH)
        .cloned()
        .unwrap_or_default();
    match existing {
        None => {
            pods.create(&Default::default(), &desired).await?;
        }
        Some(existing) if needs_redispatch(&existing, &desired_hash) => {
            let name = existing.name_any();
            pods.delete(&name, &Default::default()).await?;
        }
        Some(_) => {}
    }
    Ok(())
}

/// Deletes every runner pod for `(skyhook_name, node_name)`, used on
/// deselection and on Skyhook cleanup (§4.1 step 5, §3 finalizer).
pub async fn delete_runner_pods_for_node(client: Client, namespace: &str, skyhook_name: &str, node_name: &str) -> Result<(), Error> {
    let pods: Api<Pod> = Api::namespaced(client.clone(), namespace);
    let list = pods
        .list(
            &ListParams::default()
                .labels(&format!("{}={skyhook_name}", labels::NAME))
                .fields(&format!("spec.nodeName={node_name}")),
        )
        .await?;
    for pod in list.items {
        pods.delete(&pod.name_any(), &Default::default()).await?;
    }
    Ok(())
}

/// Deletes every runner pod this Skyhook owns, across every node —
/// used by the finalizer (§3, "finalizer removes all... runner pods
/// first").
pub async fn delete_all_runner_pods(client: Client, namespace: &str, skyhook_name: &str) -> Result<(), Error> {
    let pods: Api<Pod> = Api::namespaced(client.clone(), namespace);
    let list = pods
        .list(&ListParams::default().labels(&format!("{}={skyhook_name}", labels::NAME)))
        .await?;
    for pod in list.items {
        pods.delete(&pod.name_any(), &Default::default()).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use semver::Version;

    fn ctx() -> DispatchContext {
        DispatchContext {
            namespace: "skyhook".to_owned(),
            pause_image: "registry.k8s.io/pause:3.9".to_owned(),
            default_agent_image: "example/agent:latest".to_owned(),
            image_pull_secret: None,
            copy_dir_root: "/var/lib/skyhook".to_owned(),
            agent_log_root: "/var/log/skyhook".to_owned(),
        }
    }

    fn package() -> Package {
        Package {
            name: "nvidia-driver".to_owned(),
            version: Version::parse("1.0.0").unwrap(),
            image: "example/driver:1.0.0".to_owned(),
            env: None,
            config_map: None,
            config_interrupts: None,
            interrupt: None,
            depends_on: None,
            resources: None,
            graceful_shutdown: None,
            agent_image_override: None,
        }
    }

    #[test]
    fn pod_name_is_deterministic_and_stage_sensitive() {
        let pkg = package();
        let a = pod_name("gpu-operator", "node-1", &pkg, Stage::Apply);
        let b = pod_name("gpu-operator", "node-1", &pkg, Stage::Apply);
        let c = pod_name("gpu-operator", "node-1", &pkg, Stage::Config);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.len() < 40);
    }

    #[test]
    fn spec_hash_changes_with_stage_and_package_contents() {
        let pkg = package();
        let mut other = pkg.clone();
        other.image = "example/driver:2.0.0".to_owned();
        assert_ne!(spec_hash(&pkg, Stage::Apply), spec_hash(&pkg, Stage::Config));
        assert_ne!(spec_hash(&pkg, Stage::Apply), spec_hash(&other, Stage::Apply));
    }

    #[test]
    fn redispatch_triggers_on_hash_mismatch_or_missing_annotation() {
        let mut pod = Pod::default();
        assert!(needs_redispatch(&pod, "abc"));
        pod.metadata.annotations = Some(
            [(annotations::POD_SPEC_HASH.to_owned(), "abc".to_owned())]
                .into_iter()
                .collect(),
        );
        assert!(!needs_redispatch(&pod, "abc"));
        assert!(needs_redispatch(&pod, "def"));
    }

    #[test]
    fn terminal_outcome_reads_pod_phase() {
        let mut pod = Pod::default();
        assert_eq!(terminal_outcome(&pod), None);
        pod.status = Some(k8s_openapi::api::core::v1::PodStatus {
            phase: Some("Succeeded".to_owned()),
            ..Default::default()
        });
        assert_eq!(terminal_outcome(&pod), Some(true));
        pod.status.as_mut().unwrap().phase = Some("Failed".to_owned());
        assert_eq!(terminal_outcome(&pod), Some(false));
    }

    #[test]
    fn runner_tolerations_always_includes_unschedulable_and_runtime_required() {
        let tolerations = runner_tolerations(&[], "skyhook.nvidia.com/runtime-required");
        assert!(
            tolerations
                .iter()
                .any(|t| t.key.as_deref() == Some(skyhook_crd::taints::UNSCHEDULABLE))
        );
        assert!(
            tolerations
                .iter()
                .any(|t| t.key.as_deref() == Some("skyhook.nvidia.com/runtime-required"))
        );
    }

    fn skyhook(name: &str) -> Skyhook {
        let mut sh = Skyhook::default();
        sh.metadata.name = Some(name.to_owned());
        sh
    }

    #[test]
    fn init_containers_run_the_agent_image_against_the_staged_package_root() {
        let ctx = ctx();
        let sh = skyhook("gpu-operator");
        let pkg = package();
        let pod = build_runner_pod(&ctx, &sh, "node-1", &pkg, Stage::Apply, vec![]);
        let init_containers = pod.spec.unwrap().init_containers.unwrap();

        // package-copy stages the package image's filesystem; it does
        // not run the agent.
        assert_eq!(init_containers[0].name, "package-copy");
        assert_eq!(init_containers[0].image.as_deref(), Some(pkg.image.as_str()));

        // one agent container per sub-step of the stage, each pointed at
        // the shared package root.
        let agent_steps = &init_containers[1..];
        assert_eq!(agent_steps.len(), sub_steps(Stage::Apply).len());
        for (container, step) in agent_steps.iter().zip(sub_steps(Stage::Apply)) {
            assert_eq!(container.image.as_deref(), Some(ctx.default_agent_image.as_str()));
            assert_eq!(
                container.args.as_deref(),
                Some([step.to_string(), PACKAGE_ROOT_DIR.to_owned()].as_slice())
            );
            assert!(
                container
                    .volume_mounts
                    .as_ref()
                    .unwrap()
                    .iter()
                    .any(|m| m.mount_path == PACKAGE_ROOT_DIR)
            );
        }
    }

    #[test]
    fn init_containers_use_agent_image_override_when_set() {
        let ctx = ctx();
        let sh = skyhook("gpu-operator");
        let mut pkg = package();
        pkg.agent_image_override = Some("example/custom-agent:1.0.0".to_owned());
        let pod = build_runner_pod(&ctx, &sh, "node-1", &pkg, Stage::Interrupt, vec![]);
        let init_containers = pod.spec.unwrap().init_containers.unwrap();
        assert_eq!(init_containers.len(), 2); // package-copy + single "interrupt" step
        assert_eq!(
            init_containers[1].image.as_deref(),
            Some("example/custom-agent:1.0.0")
        );
    }

    #[test]
    fn pod_package_annotation_is_bit_exact_json() {
        let ctx = ctx();
        let sh = skyhook("gpu-operator");
        let pkg = package();
        let pod = build_runner_pod(&ctx, &sh, "node-1", &pkg, Stage::Apply, vec![]);
        let raw = pod.metadata.annotations.unwrap().remove(annotations::POD_PACKAGE).unwrap();
        let parsed: skyhook_crd::PodPackageAnnotation = serde_json::from_str(&raw).unwrap();
        assert_eq!(parsed.name, pkg.name);
        assert_eq!(parsed.version, pkg.version.to_string());
        assert_eq!(parsed.skyhook, "gpu-operator");
        assert_eq!(parsed.stage, Stage::Apply);
        assert_eq!(parsed.image, pkg.image);
    }
}
