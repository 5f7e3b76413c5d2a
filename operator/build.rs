use kube::CustomResourceExt;
use snaprestore_types::*;
use std::fs;

fn main() {
    let _ = fs::create_dir("../crds");
    fs::write(
        "../crds/restore.elastic.co_restoretask_crd.yaml",
        serde_yaml::to_string(&RestoreTask::crd()).unwrap(),
    )
    .unwrap();
}
