use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::json;
use vmshape_core::labels::{DEFAULT_INSTANCETYPE_KIND_LABEL, DEFAULT_INSTANCETYPE_LABEL, DEFAULT_PREFERENCE_LABEL};
use vmshape_core::{Error, VirtualMachine};
use vmshape_infer::Inferencer;
use vmshape_store::{MemVolumeSourceClient, SourceKind, SourcePointer, VolumeSource};

fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
    pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
}

fn vm(instancetype: serde_json::Value, volumes: serde_json::Value, templates: serde_json::Value) -> VirtualMachine {
    serde_json::from_value(json!({
        "metadata": { "name": "vm", "namespace": "ns" },
        "spec": {
            "instancetype": instancetype,
            "preference": { "inferFromVolume": "root" },
            "dataVolumeTemplates": templates,
            "template": { "spec": { "volumes": volumes } }
        }
    }))
    .unwrap()
}

#[tokio::test]
async fn pvc_labels_fill_the_reference() {
    let client = Arc::new(MemVolumeSourceClient::new());
    client.insert(
        "ns",
        "root-pvc",
        VolumeSource {
            kind: SourceKind::PersistentVolumeClaim,
            labels: labels(&[(DEFAULT_INSTANCETYPE_LABEL, "u1.large"), (DEFAULT_INSTANCETYPE_KIND_LABEL, "VirtualMachineInstancetype")]),
            next: None,
        },
    );
    let mut v = vm(
        json!({ "inferFromVolume": "root" }),
        json!([ { "name": "root", "persistentVolumeClaim": { "claimName": "root-pvc" } } ]),
        json!([]),
    );
    Inferencer::new(client).infer_instancetype(&mut v).await.unwrap();
    let m = v.spec.instancetype.unwrap();
    assert_eq!(m.name, "u1.large");
    assert_eq!(m.kind, "VirtualMachineInstancetype");
    assert!(m.infer_from_volume.is_empty());
}

#[tokio::test]
async fn data_volume_template_follows_its_data_source() {
    let client = Arc::new(MemVolumeSourceClient::new());
    client.insert(
        "images",
        "fedora",
        VolumeSource {
            kind: SourceKind::DataSource,
            labels: labels(&[(DEFAULT_PREFERENCE_LABEL, "fedora")]),
            next: Some(SourcePointer { kind: SourceKind::PersistentVolumeClaim, namespace: "images".into(), name: "fedora-pvc".into() }),
        },
    );
    let mut v = vm(
        json!({ "name": "u1.small" }),
        json!([ { "name": "root", "dataVolume": { "name": "root-dv" } } ]),
        json!([ {
            "metadata": { "name": "root-dv" },
            "spec": { "sourceRef": { "kind": "DataSource", "namespace": "images", "name": "fedora" } }
        } ]),
    );
    Inferencer::new(client).infer_preference(&mut v).await.unwrap();
    assert_eq!(v.spec.preference.as_ref().unwrap().name, "fedora");
}

#[tokio::test]
async fn named_reference_is_left_alone() {
    let client = Arc::new(MemVolumeSourceClient::new());
    let mut v = vm(json!({ "name": "u1.small", "inferFromVolume": "root" }), json!([]), json!([]));
    let before = v.clone();
    Inferencer::new(client).infer_instancetype(&mut v).await.unwrap();
    assert_eq!(v, before);
}

#[tokio::test]
async fn unresolved_volume_rejects_by_default() {
    let client = Arc::new(MemVolumeSourceClient::new());
    let mut v = vm(json!({ "inferFromVolume": "missing" }), json!([]), json!([]));
    let err = Inferencer::new(client).infer_instancetype(&mut v).await.unwrap_err();
    assert!(matches!(err, Error::Inference { family: "instancetype", .. }));
    assert_eq!(err.to_string(), "failed to infer default instancetype: unable to find volume missing to infer defaults");
}

#[tokio::test]
async fn ignore_policy_drops_the_reference() {
    let client = Arc::new(MemVolumeSourceClient::new());
    client.insert("ns", "root-pvc", VolumeSource { kind: SourceKind::PersistentVolumeClaim, labels: BTreeMap::new(), next: None });
    let mut v = vm(
        json!({ "inferFromVolume": "root", "inferFromVolumeFailurePolicy": "Ignore" }),
        json!([ { "name": "root", "persistentVolumeClaim": { "claimName": "root-pvc" } } ]),
        json!([]),
    );
    Inferencer::new(client).infer_instancetype(&mut v).await.unwrap();
    assert!(v.spec.instancetype.is_none());
    assert!(v.spec.preference.is_some());
}
