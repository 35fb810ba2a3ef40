use std::sync::Arc;

use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use serde_json::json;
use vmshape_apply::{apply_to_vmi, template_spec_path, VmApplier};
use vmshape_core::object::{CLUSTER_INSTANCETYPE_KIND, CLUSTER_PREFERENCE_KIND};
use vmshape_core::vm::{Bootloader, Clock, ClockOffset, Cpu, CpuFeature, Disk, DiskTarget, Firmware, Gpu, Interface, Memory};
use vmshape_core::{Error, Instancetype, InstancetypeSpec, Matcher, Preference, PreferenceSpec, VirtualMachine, VirtualMachineInstanceSpec};
use vmshape_find::{Sources, SpecFinder};
use vmshape_store::{MemCache, MemObjectClient, MemRevisionStore};

fn instancetype() -> InstancetypeSpec {
    serde_json::from_value(json!({
        "cpu": { "guest": 4, "model": "host-passthrough" },
        "memory": { "guest": "4Gi" },
        "nodeSelector": { "zone": "a" },
        "annotations": { "shape": "u1" }
    }))
    .unwrap()
}

fn preference() -> PreferenceSpec {
    serde_json::from_value(json!({
        "cpu": {
            "preferredCPUTopology": "cores",
            "preferredCPUFeatures": [ { "name": "vmx", "policy": "require" } ]
        },
        "devices": {
            "preferredDiskBus": "virtio",
            "preferredInterfaceModel": "virtio",
            "preferredAutoattachGraphicsDevice": false,
            "preferredRng": {}
        },
        "firmware": { "preferredUseEfi": true, "preferredUseSecureBoot": true },
        "machine": { "preferredMachineType": "q35" },
        "preferredTerminationGracePeriodSeconds": 30,
        "annotations": { "os": "fedora" }
    }))
    .unwrap()
}

#[test]
fn instancetype_fills_an_empty_spec() {
    let mut vmi = VirtualMachineInstanceSpec::default();
    let mut meta = ObjectMeta::default();
    let c = apply_to_vmi(&template_spec_path(), Some(&instancetype()), None, &mut vmi, &mut meta).unwrap();
    assert!(c.is_empty());
    let cpu = vmi.domain.cpu.as_ref().unwrap();
    assert_eq!((cpu.sockets, cpu.cores, cpu.threads), (4, 1, 1));
    assert_eq!(cpu.model, "host-passthrough");
    assert_eq!(vmi.domain.memory.as_ref().unwrap().guest, Some(Quantity("4Gi".into())));
    assert_eq!(vmi.node_selector.as_ref().unwrap()["zone"], "a");
    assert_eq!(meta.annotations.unwrap()["shape"], "u1");
}

#[test]
fn preference_shapes_topology_and_devices() {
    let mut vmi = VirtualMachineInstanceSpec::default();
    vmi.domain.devices.disks = vec![
        Disk { name: "root".into(), disk: Some(DiskTarget::default()), ..Default::default() },
        Disk { name: "data".into(), disk: Some(DiskTarget { bus: "sata".into() }), ..Default::default() },
    ];
    vmi.domain.devices.interfaces = vec![Interface { name: "default".into(), ..Default::default() }];
    let mut meta = ObjectMeta::default();
    let c = apply_to_vmi(&template_spec_path(), Some(&instancetype()), Some(&preference()), &mut vmi, &mut meta).unwrap();
    assert!(c.is_empty());

    let cpu = vmi.domain.cpu.as_ref().unwrap();
    assert_eq!((cpu.sockets, cpu.cores, cpu.threads), (1, 4, 1));
    assert_eq!(cpu.features, vec![CpuFeature { name: "vmx".into(), policy: "require".into() }]);
    let d = &vmi.domain.devices;
    assert_eq!(d.disks[0].disk.as_ref().unwrap().bus, "virtio");
    assert_eq!(d.disks[1].disk.as_ref().unwrap().bus, "sata");
    assert_eq!(d.interfaces[0].model, "virtio");
    assert_eq!(d.autoattach_graphics_device, Some(false));
    assert!(d.rng.is_some());
    let efi = vmi.domain.firmware.as_ref().unwrap().bootloader.as_ref().unwrap().efi.as_ref().unwrap();
    assert_eq!(efi.secure_boot, Some(true));
    assert_eq!(vmi.domain.machine.as_ref().unwrap().machine_type, "q35");
    assert_eq!(vmi.termination_grace_period_seconds, Some(30));
    let a = meta.annotations.unwrap();
    assert_eq!(a["os"], "fedora");
    assert_eq!(a["shape"], "u1");
}

#[test]
fn user_values_conflict_and_block_preferences() {
    let mut vmi = VirtualMachineInstanceSpec::default();
    vmi.domain.cpu = Some(Cpu { sockets: 2, ..Default::default() });
    vmi.domain.resources.requests.insert("memory".into(), Quantity("1Gi".into()));
    vmi.domain.devices.gpus = vec![Gpu { name: "g".into(), device_name: "nvidia".into() }];
    let mut it = instancetype();
    it.gpus = vec![Gpu { name: "g0".into(), device_name: "nvidia".into() }];
    let mut meta = ObjectMeta::default();
    meta.annotations = Some([("shape".to_string(), "other".to_string())].into_iter().collect());

    let c = apply_to_vmi(&template_spec_path(), Some(&it), Some(&preference()), &mut vmi, &mut meta).unwrap();
    assert_eq!(
        c.paths(),
        vec![
            "spec.template.spec.domain.cpu.sockets",
            "spec.template.spec.domain.resources.requests.memory",
            "spec.template.spec.domain.devices.gpus",
            "spec.template.metadata.annotations[shape]",
        ]
    );
    assert!(c.iter().all(|x| !x.is_requirement()));
    // nothing from the preference landed
    assert!(vmi.domain.machine.is_none());
    assert!(vmi.termination_grace_period_seconds.is_none());
}

#[test]
fn matching_annotation_is_not_a_conflict() {
    let mut vmi = VirtualMachineInstanceSpec::default();
    let mut meta = ObjectMeta::default();
    meta.annotations = Some([("shape".to_string(), "u1".to_string())].into_iter().collect());
    let c = apply_to_vmi(&template_spec_path(), Some(&instancetype()), None, &mut vmi, &mut meta).unwrap();
    assert!(c.is_empty());
}

#[test]
fn overcommit_lowers_the_memory_request() {
    let mut it = instancetype();
    it.memory.overcommit_percent = 25;
    let mut vmi = VirtualMachineInstanceSpec::default();
    apply_to_vmi(&template_spec_path(), Some(&it), None, &mut vmi, &mut ObjectMeta::default()).unwrap();
    assert_eq!(vmi.domain.resources.requests["memory"], Quantity("3Gi".into()));
}

#[test]
fn user_maximums_conflict_with_instancetype_maximums() {
    let mut it = instancetype();
    it.cpu.max_sockets = Some(8);
    it.memory.max_guest = Some(Quantity("8Gi".into()));
    let mut vmi = VirtualMachineInstanceSpec::default();
    vmi.domain.cpu = Some(Cpu { max_sockets: 16, ..Default::default() });
    vmi.domain.memory = Some(Memory { max_guest: Some(Quantity("32Gi".into())), ..Default::default() });
    let c = apply_to_vmi(&template_spec_path(), Some(&it), None, &mut vmi, &mut ObjectMeta::default()).unwrap();
    assert!(c.contains_path("spec.template.spec.domain.cpu.maxSockets"));
    assert!(c.contains_path("spec.template.spec.domain.memory.maxGuest"));
    assert_eq!(vmi.domain.cpu.as_ref().unwrap().max_sockets, 16);
    assert_eq!(vmi.domain.memory.as_ref().unwrap().max_guest, Some(Quantity("32Gi".into())));
}

#[test]
fn instancetype_maximums_fill_unset_fields() {
    let mut it = instancetype();
    it.cpu.max_sockets = Some(8);
    it.memory.max_guest = Some(Quantity("8Gi".into()));
    let mut vmi = VirtualMachineInstanceSpec::default();
    let c = apply_to_vmi(&template_spec_path(), Some(&it), None, &mut vmi, &mut ObjectMeta::default()).unwrap();
    assert!(c.is_empty());
    assert_eq!(vmi.domain.cpu.as_ref().unwrap().max_sockets, 8);
    assert_eq!(vmi.domain.memory.as_ref().unwrap().max_guest, Some(Quantity("8Gi".into())));
}

#[test]
fn preferences_never_overwrite() {
    let mut vmi = VirtualMachineInstanceSpec::default();
    vmi.termination_grace_period_seconds = Some(5);
    vmi.domain.devices.autoattach_graphics_device = Some(true);
    vmi.domain.cpu = Some(Cpu { features: vec![CpuFeature { name: "vmx".into(), policy: "disable".into() }], ..Default::default() });
    let c = apply_to_vmi(&template_spec_path(), None, Some(&preference()), &mut vmi, &mut ObjectMeta::default()).unwrap();
    assert!(c.is_empty());
    assert_eq!(vmi.termination_grace_period_seconds, Some(5));
    assert_eq!(vmi.domain.devices.autoattach_graphics_device, Some(true));
    let features = &vmi.domain.cpu.as_ref().unwrap().features;
    assert_eq!(features.len(), 1);
    assert_eq!(features[0].policy, "disable");
}

#[test]
fn empty_user_firmware_is_kept() {
    let pref: PreferenceSpec = serde_json::from_value(json!({
        "firmware": { "preferredUseBiosSerial": true, "preferredUseSecureBoot": true }
    }))
    .unwrap();
    let mut vmi = VirtualMachineInstanceSpec::default();
    vmi.domain.firmware = Some(Firmware { bootloader: Some(Bootloader::default()), ..Default::default() });
    apply_to_vmi(&template_spec_path(), None, Some(&pref), &mut vmi, &mut ObjectMeta::default()).unwrap();
    assert_eq!(vmi.domain.firmware, Some(Firmware { bootloader: Some(Bootloader::default()), ..Default::default() }));
}

#[test]
fn preferred_timer_creates_the_clock() {
    let pref: PreferenceSpec = serde_json::from_value(json!({
        "clock": { "preferredTimer": { "hpet": { "present": false } } }
    }))
    .unwrap();
    let mut vmi = VirtualMachineInstanceSpec::default();
    apply_to_vmi(&template_spec_path(), None, Some(&pref), &mut vmi, &mut ObjectMeta::default()).unwrap();
    let clock = vmi.domain.clock.as_ref().unwrap();
    assert_eq!(clock.timer, Some(json!({ "hpet": { "present": false } })));
    assert_eq!(clock.offset, ClockOffset::default());
}

#[test]
fn user_clock_offset_and_timer_are_kept() {
    let pref: PreferenceSpec = serde_json::from_value(json!({
        "clock": { "preferredClockOffset": { "utc": {} }, "preferredTimer": { "hpet": { "present": false } } }
    }))
    .unwrap();
    let mut vmi = VirtualMachineInstanceSpec::default();
    vmi.domain.clock = Some(Clock { offset: ClockOffset { timezone: Some("Europe/Berlin".into()), ..Default::default() }, timer: None });
    apply_to_vmi(&template_spec_path(), None, Some(&pref), &mut vmi, &mut ObjectMeta::default()).unwrap();
    let clock = vmi.domain.clock.as_ref().unwrap();
    assert_eq!(clock.offset.timezone.as_deref(), Some("Europe/Berlin"));
    assert!(clock.offset.utc.is_none());
    assert_eq!(clock.timer, Some(json!({ "hpet": { "present": false } })));
}

fn applier(it: Instancetype, pref: Preference) -> VmApplier {
    let revisions = Arc::new(MemRevisionStore::new());
    let it_client = Arc::new(MemObjectClient::new());
    it_client.insert(None, it.name(), it.clone());
    let pref_client = Arc::new(MemObjectClient::new());
    pref_client.insert(None, pref.name(), pref.clone());
    let its = SpecFinder::new(
        Sources::new(Arc::new(MemCache::new()), it_client.clone()),
        Sources::new(Arc::new(MemCache::new()), it_client),
        revisions.clone(),
    );
    let prefs = SpecFinder::new(
        Sources::new(Arc::new(MemCache::new()), pref_client.clone()),
        Sources::new(Arc::new(MemCache::new()), pref_client),
        revisions,
    );
    VmApplier::new(its, prefs)
}

#[tokio::test]
async fn apply_to_vm_merges_into_template() {
    let a = applier(
        Instancetype::new(CLUSTER_INSTANCETYPE_KIND, None, "u1", instancetype()),
        Preference::new(CLUSTER_PREFERENCE_KIND, None, "fedora", preference()),
    );
    let mut vm = VirtualMachine::new("ns", "vm");
    vm.spec.instancetype = Some(Matcher::named("u1", ""));
    vm.spec.preference = Some(Matcher::named("fedora", ""));
    a.apply_to_vm(&mut vm).await.unwrap();
    let cpu = vm.spec.template.as_ref().unwrap().spec.domain.cpu.as_ref().unwrap();
    assert_eq!(cpu.cores, 4);
}

#[tokio::test]
async fn apply_to_vm_conflict_leaves_vm_untouched() {
    let a = applier(
        Instancetype::new(CLUSTER_INSTANCETYPE_KIND, None, "u1", instancetype()),
        Preference::new(CLUSTER_PREFERENCE_KIND, None, "fedora", preference()),
    );
    let mut vm = VirtualMachine::new("ns", "vm");
    vm.spec.instancetype = Some(Matcher::named("u1", ""));
    vm.template_mut().spec.domain.cpu = Some(Cpu { threads: 2, ..Default::default() });
    let before = vm.clone();
    let err = a.apply_to_vm(&mut vm).await.unwrap_err();
    assert_eq!(err.to_string(), "VM field spec.template.spec.domain.cpu.threads conflicts with selected instance type");
    assert!(matches!(err, Error::FieldConflicts(_)));
    assert_eq!(vm, before);
}
