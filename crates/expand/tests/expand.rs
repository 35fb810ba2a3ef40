use std::sync::Arc;

use serde_json::json;
use vmshape_apply::VmApplier;
use vmshape_core::object::CLUSTER_INSTANCETYPE_KIND;
use vmshape_core::vm::Cpu;
use vmshape_core::{EngineConfig, Error, Instancetype, InstancetypeSpec, Matcher, Preference, VirtualMachine};
use vmshape_expand::Expander;
use vmshape_find::{Sources, SpecFinder};
use vmshape_store::{MemCache, MemObjectClient, MemRevisionStore};

fn expander(config: EngineConfig) -> Expander {
    let revisions = Arc::new(MemRevisionStore::new());
    let its = Arc::new(MemCache::<Instancetype>::new());
    let spec: InstancetypeSpec = serde_json::from_value(json!({
        "cpu": { "guest": 2 },
        "memory": { "guest": "2Gi" }
    }))
    .unwrap();
    its.upsert(None, "u1.medium", Instancetype::new(CLUSTER_INSTANCETYPE_KIND, None, "u1.medium", spec));
    let it_client = Arc::new(MemObjectClient::<Instancetype>::new());
    let pref_client = Arc::new(MemObjectClient::<Preference>::new());
    let instancetypes = SpecFinder::new(
        Sources::new(its, it_client.clone()),
        Sources::new(Arc::new(MemCache::new()), it_client),
        revisions.clone(),
    );
    let preferences = SpecFinder::new(
        Sources::new(Arc::new(MemCache::new()), pref_client.clone()),
        Sources::new(Arc::new(MemCache::new()), pref_client),
        revisions,
    );
    Expander::new(VmApplier::new(instancetypes, preferences), config)
}

fn vm() -> VirtualMachine {
    serde_json::from_value(json!({
        "apiVersion": "kubevirt.io/v1",
        "kind": "VirtualMachine",
        "metadata": { "name": "vm", "namespace": "default" },
        "spec": {
            "instancetype": { "name": "u1.medium" },
            "template": { "spec": {
                "volumes": [ { "name": "root", "containerDisk": { "image": "quay.io/containerdisks/fedora" } } ]
            } }
        }
    }))
    .unwrap()
}

#[tokio::test]
async fn expands_instancetype_only() {
    let cfg = EngineConfig { default_machine_type: Some("q35".into()), ..Default::default() };
    let input = vm();
    let out = expander(cfg).expand(&input).await.unwrap();
    assert!(out.spec.instancetype.is_none());
    assert!(out.spec.preference.is_none());

    let spec = &out.spec.template.as_ref().unwrap().spec;
    let cpu = spec.domain.cpu.as_ref().unwrap();
    assert_eq!((cpu.sockets, cpu.cores, cpu.threads), (2, 1, 1));
    assert_eq!(spec.domain.memory.as_ref().unwrap().guest.as_ref().unwrap().0, "2Gi");
    assert_eq!(spec.domain.devices.disks[0].name, "root");
    assert!(spec.domain.devices.interfaces[0].masquerade.is_some());
    assert_eq!(spec.networks[0].name, "default");
    assert_eq!(spec.domain.machine.as_ref().unwrap().machine_type, "q35");

    // input untouched
    assert_eq!(input, vm());
}

#[tokio::test]
async fn no_reference_is_returned_unchanged() {
    let mut input = vm();
    input.spec.instancetype = None;
    let out = expander(EngineConfig::default()).expand(&input).await.unwrap();
    assert_eq!(out, input);
}

#[tokio::test]
async fn conflicts_fail_the_expansion() {
    let mut input = vm();
    input.template_mut().spec.domain.cpu = Some(Cpu { sockets: 4, ..Default::default() });
    let err = expander(EngineConfig::default()).expand(&input).await.unwrap_err();
    assert!(matches!(err, Error::FieldConflicts(ref c) if c.contains_path("spec.template.spec.domain.cpu.sockets")));
}

#[tokio::test]
async fn missing_reference_fails_closed() {
    let mut input = vm();
    input.spec.instancetype = Some(Matcher::named("large", ""));
    let err = expander(EngineConfig::default()).expand(&input).await.unwrap_err();
    assert_eq!(err.to_string(), "VirtualMachineClusterInstancetype large not found");
}
