//! Preference merge. Preferences are soft defaults: they fill what the
//! workload left unset and never produce conflicts.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use vmshape_core::preference::DevicePreferences;
use vmshape_core::vm::{Bios, Bootloader, Clock, ClockOffset, Cpu, DiskTarget, Efi, Features, Firmware, Machine};
use vmshape_core::{PreferenceSpec, VirtualMachineInstanceSpec};

pub(crate) fn apply(pref: &PreferenceSpec, vmi: &mut VirtualMachineInstanceSpec, meta: &mut ObjectMeta) {
    apply_device_preferences(pref, vmi);
    features(pref, vmi);
    firmware(pref, vmi);
    machine(pref, vmi);
    clock(pref, vmi);
    if let Some(sub) = &pref.preferred_subdomain {
        if vmi.subdomain.is_empty() {
            vmi.subdomain = sub.clone();
        }
    }
    if vmi.termination_grace_period_seconds.is_none() {
        vmi.termination_grace_period_seconds = pref.preferred_termination_grace_period_seconds;
    }
    cpu_features(pref, vmi);
    annotations(pref, meta);
}

fn set_if_unset<T: Clone>(slot: &mut Option<T>, preferred: &Option<T>) {
    if slot.is_none() {
        slot.clone_from(preferred);
    }
}

fn set_str_if_empty(slot: &mut String, preferred: &str) {
    if slot.is_empty() && !preferred.is_empty() {
        *slot = preferred.to_string();
    }
}

/// Device-level defaults; exposed on its own for callers that only shape devices.
pub fn apply_device_preferences(pref: &PreferenceSpec, vmi: &mut VirtualMachineInstanceSpec) {
    let Some(p) = &pref.devices else { return };
    let d = &mut vmi.domain.devices;
    set_if_unset(&mut d.autoattach_graphics_device, &p.preferred_autoattach_graphics_device);
    set_if_unset(&mut d.autoattach_mem_balloon, &p.preferred_autoattach_mem_balloon);
    set_if_unset(&mut d.autoattach_pod_interface, &p.preferred_autoattach_pod_interface);
    set_if_unset(&mut d.autoattach_serial_console, &p.preferred_autoattach_serial_console);
    set_if_unset(&mut d.autoattach_input_device, &p.preferred_autoattach_input_device);
    set_if_unset(&mut d.use_virtio_transitional, &p.preferred_use_virtio_transitional);
    set_if_unset(&mut d.block_multi_queue, &p.preferred_block_multi_queue);
    set_if_unset(&mut d.network_interface_multiqueue, &p.preferred_network_interface_multi_queue);
    set_if_unset(&mut d.tpm, &p.preferred_tpm);
    set_if_unset(&mut d.rng, &p.preferred_rng);
    disks(p, vmi);
    interfaces(p, vmi);
    inputs(p, vmi);
}

fn disks(p: &DevicePreferences, vmi: &mut VirtualMachineInstanceSpec) {
    for disk in vmi.domain.devices.disks.iter_mut() {
        if let Some(t) = disk.disk.as_mut() {
            set_str_if_empty(&mut t.bus, &p.preferred_disk_bus);
        } else if let Some(t) = disk.cdrom.as_mut() {
            set_str_if_empty(&mut t.bus, &p.preferred_cdrom_bus);
        } else if let Some(t) = disk.lun.as_mut() {
            set_str_if_empty(&mut t.bus, &p.preferred_lun_bus);
        } else {
            // no target: treat as a plain disk so the preferences can land
            disk.disk = Some(DiskTarget { bus: p.preferred_disk_bus.clone() });
        }
        if disk.disk.is_some() {
            set_if_unset(&mut disk.dedicated_io_thread, &p.preferred_disk_dedicated_io_thread);
        }
        set_str_if_empty(&mut disk.cache, &p.preferred_disk_cache);
        set_str_if_empty(&mut disk.io, &p.preferred_disk_io);
    }
}

fn interfaces(p: &DevicePreferences, vmi: &mut VirtualMachineInstanceSpec) {
    for iface in vmi.domain.devices.interfaces.iter_mut() {
        set_str_if_empty(&mut iface.model, &p.preferred_interface_model);
    }
}

fn inputs(p: &DevicePreferences, vmi: &mut VirtualMachineInstanceSpec) {
    for input in vmi.domain.devices.inputs.iter_mut() {
        set_str_if_empty(&mut input.bus, &p.preferred_input_bus);
        set_str_if_empty(&mut input.input_type, &p.preferred_input_type);
    }
}

fn features(pref: &PreferenceSpec, vmi: &mut VirtualMachineInstanceSpec) {
    let Some(p) = &pref.features else { return };
    if p.preferred_acpi.is_none() && p.preferred_apic.is_none() && p.preferred_smm.is_none() {
        return;
    }
    let f = vmi.domain.features.get_or_insert_with(Features::default);
    set_if_unset(&mut f.acpi, &p.preferred_acpi);
    set_if_unset(&mut f.apic, &p.preferred_apic);
    set_if_unset(&mut f.smm, &p.preferred_smm);
}

fn firmware(pref: &PreferenceSpec, vmi: &mut VirtualMachineInstanceSpec) {
    let Some(p) = &pref.firmware else { return };
    let has_loader = vmi
        .domain
        .firmware
        .as_ref()
        .and_then(|f| f.bootloader.as_ref())
        .map(|b| b.bios.is_some() || b.efi.is_some())
        .unwrap_or(false);
    if !has_loader {
        let loader = if p.preferred_use_bios == Some(true) {
            Some(Bootloader { bios: Some(Bios::default()), efi: None })
        } else if p.preferred_use_efi == Some(true) {
            Some(Bootloader { bios: None, efi: Some(Efi::default()) })
        } else {
            None
        };
        if let Some(l) = loader {
            vmi.domain.firmware.get_or_insert_with(Firmware::default).bootloader = Some(l);
        }
    }
    let Some(bl) = vmi.domain.firmware.as_mut().and_then(|f| f.bootloader.as_mut()) else { return };
    if let Some(bios) = bl.bios.as_mut() {
        set_if_unset(&mut bios.use_serial, &p.preferred_use_bios_serial);
    }
    if let Some(efi) = bl.efi.as_mut() {
        set_if_unset(&mut efi.secure_boot, &p.preferred_use_secure_boot);
    }
}

fn machine(pref: &PreferenceSpec, vmi: &mut VirtualMachineInstanceSpec) {
    let Some(p) = &pref.machine else { return };
    if p.preferred_machine_type.is_empty() {
        return;
    }
    let m = vmi.domain.machine.get_or_insert_with(Machine::default);
    set_str_if_empty(&mut m.machine_type, &p.preferred_machine_type);
}

fn clock(pref: &PreferenceSpec, vmi: &mut VirtualMachineInstanceSpec) {
    let Some(p) = &pref.clock else { return };
    if p.preferred_clock_offset.is_none() && p.preferred_timer.is_none() {
        return;
    }
    let clock = vmi.domain.clock.get_or_insert_with(Clock::default);
    if let Some(offset) = &p.preferred_clock_offset {
        if clock.offset == ClockOffset::default() {
            clock.offset = offset.clone();
        }
    }
    if clock.timer.is_none() {
        clock.timer = p.preferred_timer.clone();
    }
}

fn cpu_features(pref: &PreferenceSpec, vmi: &mut VirtualMachineInstanceSpec) {
    let Some(p) = &pref.cpu else { return };
    if p.preferred_cpu_features.is_empty() {
        return;
    }
    let cpu = vmi.domain.cpu.get_or_insert_with(Cpu::default);
    for f in &p.preferred_cpu_features {
        if !cpu.features.iter().any(|have| have.name == f.name) {
            cpu.features.push(f.clone());
        }
    }
}

fn annotations(pref: &PreferenceSpec, meta: &mut ObjectMeta) {
    let Some(wanted) = &pref.annotations else { return };
    let target = meta.annotations.get_or_insert_with(Default::default);
    for (k, v) in wanted {
        target.entry(k.clone()).or_insert_with(|| v.clone());
    }
}
