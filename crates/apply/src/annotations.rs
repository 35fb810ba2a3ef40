//! Name annotations recording which instancetype/preference shaped an instance.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use vmshape_core::{Family, InstancetypeFamily, PreferenceFamily, Scope, VirtualMachine};

/// Write the `kubevirt.io/[cluster-]<family>-name` annotation for one family.
/// Unknown kinds and empty references are skipped.
pub fn add_name_annotation<F: Family>(vm: &VirtualMachine, target: &mut ObjectMeta) {
    let Some(m) = F::reference(&vm.spec) else { return };
    let key = match F::scope(&m.kind) {
        Ok(Scope::Namespaced) => F::NAME_ANNOTATION,
        Ok(Scope::Cluster) => F::CLUSTER_NAME_ANNOTATION,
        Err(_) => return,
    };
    target.annotations.get_or_insert_with(Default::default).insert(key.to_string(), m.name.clone());
}

pub fn add_instancetype_name_annotations(vm: &VirtualMachine, target: &mut ObjectMeta) {
    add_name_annotation::<InstancetypeFamily>(vm, target);
}

pub fn add_preference_name_annotations(vm: &VirtualMachine, target: &mut ObjectMeta) {
    add_name_annotation::<PreferenceFamily>(vm, target);
}

/// Both families at once.
pub fn set(vm: &VirtualMachine, target: &mut ObjectMeta) {
    add_instancetype_name_annotations(vm, target);
    add_preference_name_annotations(vm, target);
}
