//! Instance-type merge. The instance type owns the fields it sets: any value
//! the workload already carries for one of them is reported as a conflict.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use vmshape_core::instancetype::{CpuInstancetype, MemoryInstancetype};
use vmshape_core::quantity;
use vmshape_core::vm::{Cpu, Memory};
use vmshape_core::{Conflicts, Error, FieldPath, InstancetypeSpec, PreferenceSpec, Result, VirtualMachineInstanceSpec};

use crate::topology;

const CPU: &str = "cpu";
const MEMORY: &str = "memory";

pub(crate) fn apply(
    path: &FieldPath,
    it: &InstancetypeSpec,
    pref: Option<&PreferenceSpec>,
    vmi: &mut VirtualMachineInstanceSpec,
    meta: &mut ObjectMeta,
) -> Result<Conflicts> {
    let mut c = Conflicts::new();
    node_selector(path, it, vmi, &mut c);
    scheduler_name(path, it, vmi, &mut c);
    cpu(path, &it.cpu, pref, vmi, &mut c);
    memory(path, &it.memory, vmi, &mut c)?;
    io_threads_policy(path, it, vmi, &mut c);
    launch_security(path, it, vmi, &mut c);
    gpus(path, it, vmi, &mut c);
    host_devices(path, it, vmi, &mut c);
    annotations(path, it, meta, &mut c);
    Ok(c)
}

fn node_selector(path: &FieldPath, it: &InstancetypeSpec, vmi: &mut VirtualMachineInstanceSpec, c: &mut Conflicts) {
    let Some(sel) = &it.node_selector else { return };
    if vmi.node_selector.is_some() {
        c.conflict(path.child("nodeSelector"));
        return;
    }
    vmi.node_selector = Some(sel.clone());
}

fn scheduler_name(path: &FieldPath, it: &InstancetypeSpec, vmi: &mut VirtualMachineInstanceSpec, c: &mut Conflicts) {
    if it.scheduler_name.is_empty() {
        return;
    }
    if !vmi.scheduler_name.is_empty() {
        c.conflict(path.child("schedulerName"));
        return;
    }
    vmi.scheduler_name = it.scheduler_name.clone();
}

fn cpu_conflicts(path: &FieldPath, it: &CpuInstancetype, vmi: &VirtualMachineInstanceSpec) -> Conflicts {
    let mut c = Conflicts::new();
    let res = &vmi.domain.resources;
    if res.requests.contains_key(CPU) {
        c.conflict(path.child("domain.resources.requests").child(CPU));
    }
    if res.limits.contains_key(CPU) {
        c.conflict(path.child("domain.resources.limits").child(CPU));
    }
    let Some(cpu) = &vmi.domain.cpu else { return c };
    let base = path.child("domain.cpu");
    if cpu.sockets != 0 { c.conflict(base.child("sockets")); }
    if cpu.cores != 0 { c.conflict(base.child("cores")); }
    if cpu.threads != 0 { c.conflict(base.child("threads")); }
    if cpu.max_sockets != 0 && it.max_sockets.is_some() { c.conflict(base.child("maxSockets")); }
    if !cpu.model.is_empty() && it.model.is_some() { c.conflict(base.child("model")); }
    if cpu.dedicated_cpu_placement && it.dedicated_cpu_placement.is_some() { c.conflict(base.child("dedicatedCpuPlacement")); }
    if cpu.isolate_emulator_thread && it.isolate_emulator_thread.is_some() { c.conflict(base.child("isolateEmulatorThread")); }
    if cpu.numa.is_some() && it.numa.is_some() { c.conflict(base.child("numa")); }
    if cpu.realtime.is_some() && it.realtime.is_some() { c.conflict(base.child("realtime")); }
    c
}

fn cpu(path: &FieldPath, it: &CpuInstancetype, pref: Option<&PreferenceSpec>, vmi: &mut VirtualMachineInstanceSpec, c: &mut Conflicts) {
    let found = cpu_conflicts(path, it, vmi);
    if !found.is_empty() {
        c.extend(found);
        return;
    }
    let cpu = vmi.domain.cpu.get_or_insert_with(Cpu::default);
    topology::apply(it.guest, pref, cpu);
    if let Some(max) = it.max_sockets {
        cpu.max_sockets = max;
    }
    if let Some(model) = &it.model {
        cpu.model = model.clone();
    }
    if let Some(v) = it.dedicated_cpu_placement {
        cpu.dedicated_cpu_placement = v;
    }
    if let Some(v) = it.isolate_emulator_thread {
        cpu.isolate_emulator_thread = v;
    }
    if let Some(numa) = &it.numa {
        cpu.numa = Some(numa.clone());
    }
    if let Some(rt) = &it.realtime {
        cpu.realtime = Some(rt.clone());
    }
}

fn memory(path: &FieldPath, it: &MemoryInstancetype, vmi: &mut VirtualMachineInstanceSpec, c: &mut Conflicts) -> Result<()> {
    let mut found = Conflicts::new();
    let base = path.child("domain.memory");
    if let Some(m) = &vmi.domain.memory {
        if m.guest.is_some() {
            found.conflict(base.child("guest"));
        }
        if m.hugepages.is_some() && it.hugepages.is_some() {
            found.conflict(base.child("hugepages"));
        }
        if m.max_guest.is_some() && it.max_guest.is_some() {
            found.conflict(base.child("maxGuest"));
        }
    }
    let res = &vmi.domain.resources;
    if res.requests.contains_key(MEMORY) {
        found.conflict(path.child("domain.resources.requests").child(MEMORY));
    }
    if res.limits.contains_key(MEMORY) {
        found.conflict(path.child("domain.resources.limits").child(MEMORY));
    }
    if !found.is_empty() {
        c.extend(found);
        return Ok(());
    }

    let mem = vmi.domain.memory.get_or_insert_with(Memory::default);
    mem.guest = Some(it.guest.clone());
    if let Some(h) = &it.hugepages {
        mem.hugepages = Some(h.clone());
    }
    if let Some(max) = &it.max_guest {
        mem.max_guest = Some(max.clone());
    }
    if it.overcommit_percent > 0 {
        let guest = quantity::to_bytes(&it.guest)?;
        let pct = u128::from(it.overcommit_percent.min(100));
        let request = guest
            .checked_mul(100 - pct)
            .ok_or_else(|| Error::Quantity { value: it.guest.0.clone(), reason: "overflow".into() })?
            / 100;
        vmi.domain.resources.requests.insert(MEMORY.to_string(), quantity::from_bytes(request));
    }
    Ok(())
}

fn io_threads_policy(path: &FieldPath, it: &InstancetypeSpec, vmi: &mut VirtualMachineInstanceSpec, c: &mut Conflicts) {
    let Some(policy) = it.io_threads_policy else { return };
    if vmi.domain.io_threads_policy.is_some() {
        c.conflict(path.child("domain.ioThreadsPolicy"));
        return;
    }
    vmi.domain.io_threads_policy = Some(policy);
}

fn launch_security(path: &FieldPath, it: &InstancetypeSpec, vmi: &mut VirtualMachineInstanceSpec, c: &mut Conflicts) {
    let Some(ls) = &it.launch_security else { return };
    if vmi.domain.launch_security.is_some() {
        c.conflict(path.child("domain.launchSecurity"));
        return;
    }
    vmi.domain.launch_security = Some(ls.clone());
}

fn gpus(path: &FieldPath, it: &InstancetypeSpec, vmi: &mut VirtualMachineInstanceSpec, c: &mut Conflicts) {
    if it.gpus.is_empty() {
        return;
    }
    if !vmi.domain.devices.gpus.is_empty() {
        c.conflict(path.child("domain.devices.gpus"));
        return;
    }
    vmi.domain.devices.gpus = it.gpus.clone();
}

fn host_devices(path: &FieldPath, it: &InstancetypeSpec, vmi: &mut VirtualMachineInstanceSpec, c: &mut Conflicts) {
    if it.host_devices.is_empty() {
        return;
    }
    if !vmi.domain.devices.host_devices.is_empty() {
        c.conflict(path.child("domain.devices.hostDevices"));
        return;
    }
    vmi.domain.devices.host_devices = it.host_devices.clone();
}

/// Existing keys with the same value are fine; a different value conflicts.
fn annotations(path: &FieldPath, it: &InstancetypeSpec, meta: &mut ObjectMeta, c: &mut Conflicts) {
    let Some(wanted) = &it.annotations else { return };
    let target = meta.annotations.get_or_insert_with(Default::default);
    let base = path.parent().child("metadata.annotations");
    for (k, v) in wanted {
        match target.get(k) {
            Some(existing) if existing != v => c.conflict(base.key(k)),
            Some(_) => {}
            None => {
                target.insert(k.clone(), v.clone());
            }
        }
    }
}
