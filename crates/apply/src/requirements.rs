//! Preference requirements: minimum CPU and memory the resolved shape must provide.

use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use vmshape_core::preference::PreferredCpuTopology;
use vmshape_core::{quantity, Conflict, Conflicts, FieldPath, InstancetypeSpec, PreferenceSpec, Result, VirtualMachineInstanceSpec};

fn instancetype_path() -> FieldPath { FieldPath::new(&["spec", "instancetype"]) }
fn domain_path() -> FieldPath { FieldPath::new(&["spec", "template", "spec", "domain"]) }

/// Unmet requirements come back as `Requirement` conflicts; only an
/// unparsable quantity is an error.
pub fn check(it: Option<&InstancetypeSpec>, pref: Option<&PreferenceSpec>, vmi: &VirtualMachineInstanceSpec) -> Result<Conflicts> {
    let mut c = Conflicts::new();
    let Some(req) = pref.and_then(|p| p.requirements.as_ref()) else { return Ok(c) };
    if let Some(cpu) = &req.cpu {
        if let Some(found) = check_cpu(it, pref, cpu.guest, vmi) {
            c.push(found);
        }
    }
    if let Some(mem) = &req.memory {
        if let Some(found) = check_memory(it, &mem.guest, vmi)? {
            c.push(found);
        }
    }
    Ok(c)
}

fn check_cpu(it: Option<&InstancetypeSpec>, pref: Option<&PreferenceSpec>, required: u32, vmi: &VirtualMachineInstanceSpec) -> Option<Conflict> {
    if let Some(it) = it {
        return (it.cpu.guest < required).then(|| {
            Conflict::requirement(
                instancetype_path(),
                format!("insufficient CPU resources of {} vCPU provided by instance type, preference requires {} vCPU", it.cpu.guest, required),
            )
        });
    }
    let cpu = vmi.domain.cpu.as_ref()?;
    let provided = cpu.vcpus();
    if provided >= u64::from(required) {
        return None;
    }
    let topology = pref.map(PreferenceSpec::preferred_topology).unwrap_or_default();
    let (field, label) = match topology {
        PreferredCpuTopology::Sockets => ("cpu.sockets", "sockets"),
        PreferredCpuTopology::Cores => ("cpu.cores", "cores"),
        PreferredCpuTopology::Threads => ("cpu.threads", "threads"),
        PreferredCpuTopology::Spread => ("cpu", "spread"),
        PreferredCpuTopology::Any => ("cpu", "any"),
    };
    Some(Conflict::requirement(
        domain_path().child(field),
        format!(
            "insufficient CPU resources of {} vCPU provided by VirtualMachine, preference requires {} vCPU provided as {}",
            provided, required, label
        ),
    ))
}

fn check_memory(it: Option<&InstancetypeSpec>, required: &Quantity, vmi: &VirtualMachineInstanceSpec) -> Result<Option<Conflict>> {
    let need = quantity::to_bytes(required)?;
    if let Some(it) = it {
        let have = quantity::to_bytes(&it.memory.guest)?;
        return Ok((have < need).then(|| {
            Conflict::requirement(
                instancetype_path(),
                format!(
                    "insufficient Memory resources of {} provided by instance type, preference requires {}",
                    it.memory.guest.0, required.0
                ),
            )
        }));
    }
    let Some(guest) = vmi.domain.memory.as_ref().and_then(|m| m.guest.as_ref()) else { return Ok(None) };
    let have = quantity::to_bytes(guest)?;
    Ok((have < need).then(|| {
        Conflict::requirement(
            domain_path().child("memory"),
            format!("insufficient Memory resources of {} provided by VirtualMachine, preference requires {}", guest.0, required.0),
        )
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use vmshape_core::preference::{CpuPreferenceRequirement, MemoryPreferenceRequirement, PreferenceRequirements};
    use vmshape_core::vm::{Cpu, Memory};

    fn pref(cpu: Option<u32>, mem: Option<&str>) -> PreferenceSpec {
        PreferenceSpec {
            requirements: Some(PreferenceRequirements {
                cpu: cpu.map(|guest| CpuPreferenceRequirement { guest }),
                memory: mem.map(|m| MemoryPreferenceRequirement { guest: Quantity(m.to_string()) }),
            }),
            ..Default::default()
        }
    }

    #[test]
    fn instancetype_with_too_few_vcpus() {
        let mut it = InstancetypeSpec::default();
        it.cpu.guest = 1;
        it.memory.guest = Quantity("1Gi".into());
        let c = check(Some(&it), Some(&pref(Some(2), None)), &VirtualMachineInstanceSpec::default()).unwrap();
        assert_eq!(c.len(), 1);
        assert_eq!(c.paths(), vec!["spec.instancetype"]);
        assert_eq!(
            c.requirement_messages(),
            vec!["insufficient CPU resources of 1 vCPU provided by instance type, preference requires 2 vCPU"]
        );
    }

    #[test]
    fn workload_topology_is_checked_without_instancetype() {
        let mut vmi = VirtualMachineInstanceSpec::default();
        vmi.domain.cpu = Some(Cpu { sockets: 1, ..Default::default() });
        vmi.domain.memory = Some(Memory { guest: Some(Quantity("512Mi".into())), ..Default::default() });
        let c = check(None, Some(&pref(Some(2), Some("1Gi"))), &vmi).unwrap();
        assert_eq!(c.paths(), vec!["spec.template.spec.domain.cpu.sockets", "spec.template.spec.domain.memory"]);
        assert!(c.iter().all(|x| x.is_requirement()));
    }

    #[test]
    fn satisfied_requirements_are_silent() {
        let mut it = InstancetypeSpec::default();
        it.cpu.guest = 4;
        it.memory.guest = Quantity("2Gi".into());
        assert!(check(Some(&it), Some(&pref(Some(2), Some("1Gi"))), &VirtualMachineInstanceSpec::default()).unwrap().is_empty());
        assert!(check(Some(&it), None, &VirtualMachineInstanceSpec::default()).unwrap().is_empty());
    }

    #[test]
    fn exact_guest_resources_meet_requirements() {
        let mut vmi = VirtualMachineInstanceSpec::default();
        vmi.domain.cpu = Some(Cpu { cores: 2, ..Default::default() });
        vmi.domain.memory = Some(Memory { guest: Some(Quantity("2Gi".into())), ..Default::default() });
        assert!(check(None, Some(&pref(Some(2), Some("2Gi"))), &vmi).unwrap().is_empty());
    }

    #[test]
    fn huge_topology_counts_as_enough_vcpus() {
        let mut vmi = VirtualMachineInstanceSpec::default();
        vmi.domain.cpu = Some(Cpu { sockets: 65536, cores: 65536, ..Default::default() });
        assert!(check(None, Some(&pref(Some(2), None)), &vmi).unwrap().is_empty());
    }

    #[test]
    fn bad_quantity_is_an_error() {
        let it = InstancetypeSpec::default();
        assert!(check(Some(&it), Some(&pref(None, Some("lots"))), &VirtualMachineInstanceSpec::default()).is_err());
    }
}
