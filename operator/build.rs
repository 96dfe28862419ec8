use kube::CustomResourceExt;
use skyhook_crd::Skyhook;
use std::fs;

fn main() {
    let _ = fs::create_dir("../crds");
    fs::write(
        "../crds/skyhook.nvidia.com_skyhooks_crd.yaml",
        serde_yaml::to_string(&Skyhook::crd()).unwrap(),
    )
    .unwrap();
}
