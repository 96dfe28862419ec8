use k8s_openapi::api::core::v1::{Node, NodeStatus};
use kube::{
    Api, Client, Error as KubeError,
    api::{Patch, PatchParams, Resource},
    core::ClusterResourceScope,
};
use serde::{Serialize, de::DeserializeOwned};
use skyhook_crd::{Skyhook, SkyhookStatus};
use std::fmt::Debug;

use super::MANAGER_NAME;

pub trait HasStatus<S> {
    fn mut_status(&mut self) -> &mut S;
}

impl HasStatus<SkyhookStatus> for Skyhook {
    fn mut_status(&mut self) -> &mut SkyhookStatus {
        self.status.get_or_insert_with(Default::default)
    }
}

/// Lets [`patch_status`] also drive the Node conditions update (§4.7):
/// `Node.status` is a subresource just like a CRD's, so the same
/// diff-and-patch helper applies.
impl HasStatus<NodeStatus> for Node {
    fn mut_status(&mut self) -> &mut NodeStatus {
        self.status.get_or_insert_with(Default::default)
    }
}

/// Diffs `instance` against `f(instance.clone())` and applies the result
/// as a JSON patch to the object's status subresource, generalizing the
/// teacher's `patch_status` to a cluster-scoped resource (a `Skyhook` has
/// no namespace).
pub async fn patch_status<S, T>(
    client: Client,
    instance: &T,
    f: impl FnOnce(&mut S),
) -> Result<T, KubeError>
where
    <T as Resource>::DynamicType: Default,
    T: Clone
        + Resource<Scope = ClusterResourceScope>
        + HasStatus<S>
        + Serialize
        + DeserializeOwned
        + Debug,
{
    let patch = Patch::Json::<T>({
        let mut modified = instance.clone();
        f(modified.mut_status());
        json_patch::diff(
            &serde_json::to_value(instance).expect("instance is always serializable"),
            &serde_json::to_value(&modified).expect("modified is always serializable"),
        )
    });
    let name = instance.meta().name.clone().expect("instance has a name");
    let api: Api<T> = Api::all(client);
    api.patch_status(&name, &PatchParams::apply(MANAGER_NAME), &patch)
        .await
}

/// Diffs `instance` against `f(instance.clone())` and applies the result
/// as a JSON patch to the object itself (metadata/spec), used for Node
/// annotation/label/taint/cordon mutations by the node wrapper.
pub async fn patch_object<T>(
    client: Client,
    instance: &T,
    f: impl FnOnce(&mut T),
) -> Result<T, KubeError>
where
    <T as Resource>::DynamicType: Default,
    T: Clone
        + Resource<Scope = ClusterResourceScope>
        + Serialize
        + DeserializeOwned
        + Debug,
{
    let patch = Patch::Json::<T>({
        let mut modified = instance.clone();
        f(&mut modified);
        json_patch::diff(
            &serde_json::to_value(instance).expect("instance is always serializable"),
            &serde_json::to_value(&modified).expect("modified is always serializable"),
        )
    });
    let name = instance.meta().name.clone().expect("instance has a name");
    let api: Api<T> = Api::all(client);
    api.patch(&name, &PatchParams::apply(MANAGER_NAME), &patch)
        .await
}
