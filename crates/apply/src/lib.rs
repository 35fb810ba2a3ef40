//! vmshape apply: merge instancetype and preference specs into an instance spec.
//!
//! The instance type wins over nothing: a workload value for any field it
//! owns is a conflict. Preferences only fill gaps. When the instance type
//! conflicts, preferences are not applied at all.

#![forbid(unsafe_code)]

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use metrics::counter;
use tracing::debug;
use vmshape_core::{Conflicts, Error, FieldPath, InstancetypeFamily, InstancetypeSpec, PreferenceFamily, PreferenceSpec, Result, VirtualMachine, VirtualMachineInstanceSpec};
use vmshape_find::SpecFinder;

pub mod annotations;
mod instancetype;
mod preference;
pub mod requirements;
pub mod topology;

pub use preference::apply_device_preferences;
pub use requirements::check as check_preference_requirements;

/// Where a VirtualMachine keeps its instance spec.
pub fn template_spec_path() -> FieldPath { FieldPath::new(&["spec", "template", "spec"]) }

/// Merge into `vmi`/`meta` in place. Conflicts are returned as values; the
/// only error is an instance type whose memory quantity cannot be parsed.
pub fn apply_to_vmi(
    path: &FieldPath,
    it: Option<&InstancetypeSpec>,
    pref: Option<&PreferenceSpec>,
    vmi: &mut VirtualMachineInstanceSpec,
    meta: &mut ObjectMeta,
) -> Result<Conflicts> {
    if let Some(it) = it {
        let conflicts = instancetype::apply(path, it, pref, vmi, meta)?;
        if !conflicts.is_empty() {
            counter!("apply_conflicts_total", conflicts.len() as u64);
            debug!(path = %path, conflicts = %conflicts, "instancetype conflicts, preferences skipped");
            return Ok(conflicts);
        }
    }
    if let Some(pref) = pref {
        preference::apply(pref, vmi, meta);
    }
    Ok(Conflicts::new())
}

/// Resolves both references of a VirtualMachine and merges them into its template.
#[derive(Clone)]
pub struct VmApplier {
    instancetypes: SpecFinder<InstancetypeFamily>,
    preferences: SpecFinder<PreferenceFamily>,
}

impl VmApplier {
    pub fn new(instancetypes: SpecFinder<InstancetypeFamily>, preferences: SpecFinder<PreferenceFamily>) -> Self {
        Self { instancetypes, preferences }
    }

    pub fn instancetypes(&self) -> &SpecFinder<InstancetypeFamily> { &self.instancetypes }
    pub fn preferences(&self) -> &SpecFinder<PreferenceFamily> { &self.preferences }

    /// Apply both specs to `spec.template`. The template is only replaced when
    /// the merge is clean; on conflict the VM is left untouched.
    pub async fn apply_to_vm(&self, vm: &mut VirtualMachine) -> Result<()> {
        let it = self.instancetypes.find(vm).await?;
        let pref = self.preferences.find(vm).await?;
        self.apply_found(vm, it.as_ref(), pref.as_ref())
    }

    /// Same as `apply_to_vm` with specs the caller already resolved.
    pub fn apply_found(&self, vm: &mut VirtualMachine, it: Option<&InstancetypeSpec>, pref: Option<&PreferenceSpec>) -> Result<()> {
        if it.is_none() && pref.is_none() {
            return Ok(());
        }
        let mut template = vm.spec.template.clone().unwrap_or_default();
        let conflicts = apply_to_vmi(&template_spec_path(), it, pref, &mut template.spec, &mut template.metadata)?;
        if !conflicts.is_empty() {
            return Err(Error::FieldConflicts(conflicts));
        }
        vm.spec.template = Some(template);
        debug!(vm = %vm.name(), "instancetype and preference applied");
        Ok(())
    }
}
