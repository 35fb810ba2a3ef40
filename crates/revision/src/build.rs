//! Snapshotting an instancetype/preference into a ControllerRevision owned by a workload.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::ControllerRevision;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use k8s_openapi::apimachinery::pkg::runtime::RawExtension;
use vmshape_core::labels;
use vmshape_core::object::{API_VERSION_V1BETA1, LATEST_VERSION};
use vmshape_core::vm::{VM_API_VERSION, VM_KIND};
use vmshape_core::{Error, Result, TypedObject, VirtualMachine};

use crate::codec::{self, RevisionFamily};
use crate::name::generate_name;

/// Controller owner reference pointing at `vm`.
pub fn owner_reference(vm: &VirtualMachine) -> OwnerReference {
    OwnerReference {
        api_version: VM_API_VERSION.to_string(),
        kind: VM_KIND.to_string(),
        name: vm.name().to_string(),
        uid: vm.uid().to_string(),
        controller: Some(true),
        block_owner_deletion: Some(true),
    }
}

/// Build (but do not store) the revision pinning `object` for `vm`.
pub fn create_revision<F: RevisionFamily>(vm: &VirtualMachine, object: &TypedObject<F::Spec>) -> Result<ControllerRevision> {
    if object.kind.is_empty() {
        return Err(Error::InvalidInput(format!("{} {} has no kind", F::NAME, object.name())));
    }
    if vm.uid().is_empty() {
        return Err(Error::InvalidInput(format!("VirtualMachine {} has no uid", vm.name())));
    }
    let mut snapshot = object.clone();
    snapshot.api_version = API_VERSION_V1BETA1.to_string();
    snapshot.metadata = ObjectMeta {
        labels: None,
        annotations: None,
        finalizers: None,
        owner_references: None,
        managed_fields: None,
        ..snapshot.metadata
    };

    let name = generate_name(vm.name(), object.name(), object.version(), object.uid(), object.generation())?;
    let data = codec::encode(&F::wrap(snapshot))?;

    let mut l = BTreeMap::new();
    l.insert(labels::REVISION_OBJECT_NAME_LABEL.to_string(), object.name().to_string());
    l.insert(labels::REVISION_OBJECT_KIND_LABEL.to_string(), object.kind.clone());
    l.insert(labels::REVISION_OBJECT_UID_LABEL.to_string(), object.uid().to_string());
    l.insert(labels::REVISION_OBJECT_VERSION_LABEL.to_string(), LATEST_VERSION.to_string());
    l.insert(labels::REVISION_OBJECT_GENERATION_LABEL.to_string(), object.generation().to_string());

    Ok(ControllerRevision {
        metadata: ObjectMeta {
            name: Some(name),
            namespace: Some(vm.namespace().to_string()),
            labels: Some(l),
            owner_references: Some(vec![owner_reference(vm)]),
            ..Default::default()
        },
        data: Some(RawExtension(data)),
        revision: 0,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use vmshape_core::object::CLUSTER_INSTANCETYPE_KIND;
    use vmshape_core::{Instancetype, InstancetypeFamily, InstancetypeSpec};

    fn vm() -> VirtualMachine {
        let mut vm = VirtualMachine::new("ns", "vm");
        vm.metadata.uid = Some("vm-uid".into());
        vm
    }

    fn it() -> Instancetype {
        let mut it = Instancetype::new(CLUSTER_INSTANCETYPE_KIND, None, "u1", InstancetypeSpec::default());
        it.metadata.uid = Some("it-uid".into());
        it.metadata.generation = Some(2);
        it.metadata.labels = Some([("team".to_string(), "a".to_string())].into_iter().collect());
        it.metadata.annotations = Some([("note".to_string(), "b".to_string())].into_iter().collect());
        it
    }

    #[test]
    fn snapshot_is_stripped_and_labelled() {
        let rev = create_revision::<InstancetypeFamily>(&vm(), &it()).unwrap();
        let data = &rev.data.as_ref().unwrap().0;
        assert!(data["metadata"].get("labels").is_none());
        assert!(data["metadata"].get("annotations").is_none());
        assert_eq!(data["metadata"]["uid"], "it-uid");
        let l = rev.metadata.labels.as_ref().unwrap();
        assert_eq!(l[labels::REVISION_OBJECT_KIND_LABEL], CLUSTER_INSTANCETYPE_KIND);
        assert_eq!(l[labels::REVISION_OBJECT_VERSION_LABEL], "v1beta1");
        assert_eq!(l[labels::REVISION_OBJECT_GENERATION_LABEL], "2");
        let owner = &rev.metadata.owner_references.as_ref().unwrap()[0];
        assert_eq!(owner.uid, "vm-uid");
        assert_eq!(owner.controller, Some(true));
        assert!(rev.metadata.name.as_deref().unwrap().starts_with("vm-u1-"));
    }

    #[test]
    fn object_without_uid_is_rejected() {
        let mut o = it();
        o.metadata.uid = None;
        assert!(matches!(create_revision::<InstancetypeFamily>(&vm(), &o), Err(Error::InvalidInput(_))));
    }
}
