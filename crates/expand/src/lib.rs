//! vmshape expand: produce a standalone VirtualMachine with its instancetype
//! and preference folded into the template and both references removed.

#![forbid(unsafe_code)]

use tracing::debug;
use vmshape_apply::VmApplier;
use vmshape_core::vm::{Disk, Empty, Interface, Machine, Network, PodNetwork};
use vmshape_core::{EngineConfig, NetworkBinding, Result, VirtualMachine, VirtualMachineInstanceSpec};

/// Name shared by the default pod network and its interface.
pub const DEFAULT_NETWORK_NAME: &str = "default";

#[derive(Clone)]
pub struct Expander {
    applier: VmApplier,
    config: EngineConfig,
}

impl Expander {
    pub fn new(applier: VmApplier, config: EngineConfig) -> Self { Self { applier, config } }

    /// The expanded copy; `vm` itself is never modified. A VM without references comes back as-is.
    pub async fn expand(&self, vm: &VirtualMachine) -> Result<VirtualMachine> {
        if vm.spec.instancetype.is_none() && vm.spec.preference.is_none() {
            return Ok(vm.clone());
        }
        let it = self.applier.instancetypes().find(vm).await?;
        let pref = self.applier.preferences().find(vm).await?;

        let mut out = vm.clone();
        {
            let spec = &mut out.template_mut().spec;
            add_default_disks(spec);
            add_default_network(spec, self.config.default_network_binding);
        }
        self.applier.apply_found(&mut out, it.as_ref(), pref.as_ref())?;
        apply_cluster_defaults(&self.config, &mut out.template_mut().spec);
        out.spec.instancetype = None;
        out.spec.preference = None;
        debug!(vm = %vm.name(), "expanded");
        Ok(out)
    }
}

/// Every volume gets a disk of the same name; the target is left for preferences.
pub fn add_default_disks(spec: &mut VirtualMachineInstanceSpec) {
    let missing: Vec<String> = spec
        .volumes
        .iter()
        .filter(|v| !spec.domain.devices.disks.iter().any(|d| d.name == v.name))
        .map(|v| v.name.clone())
        .collect();
    for name in missing {
        spec.domain.devices.disks.push(Disk { name, ..Default::default() });
    }
}

/// Pod network plus interface, only when the workload declares neither and
/// has not turned pod interface autoattach off.
pub fn add_default_network(spec: &mut VirtualMachineInstanceSpec, binding: NetworkBinding) {
    if spec.domain.devices.autoattach_pod_interface == Some(false) {
        return;
    }
    if !spec.networks.is_empty() || !spec.domain.devices.interfaces.is_empty() {
        return;
    }
    let mut iface = Interface { name: DEFAULT_NETWORK_NAME.to_string(), ..Default::default() };
    match binding {
        NetworkBinding::Masquerade => iface.masquerade = Some(Empty {}),
        NetworkBinding::Bridge => iface.bridge = Some(Empty {}),
    }
    spec.domain.devices.interfaces.push(iface);
    spec.networks.push(Network { name: DEFAULT_NETWORK_NAME.to_string(), pod: Some(PodNetwork::default()), multus: None });
}

/// Cluster defaults applied after the merge so they never conflict with the instance type.
pub fn apply_cluster_defaults(config: &EngineConfig, spec: &mut VirtualMachineInstanceSpec) {
    let Some(default_type) = &config.default_machine_type else { return };
    let machine = spec.domain.machine.get_or_insert_with(Machine::default);
    if machine.machine_type.is_empty() {
        machine.machine_type = default_type.clone();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vmshape_core::vm::Volume;

    #[test]
    fn disks_are_added_once() {
        let mut spec = VirtualMachineInstanceSpec::default();
        spec.volumes = vec![Volume { name: "root".into(), ..Default::default() }, Volume { name: "cloudinit".into(), ..Default::default() }];
        spec.domain.devices.disks = vec![Disk { name: "root".into(), ..Default::default() }];
        add_default_disks(&mut spec);
        add_default_disks(&mut spec);
        let names: Vec<_> = spec.domain.devices.disks.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, vec!["root", "cloudinit"]);
    }

    #[test]
    fn network_respects_autoattach_and_existing() {
        let mut spec = VirtualMachineInstanceSpec::default();
        add_default_network(&mut spec, NetworkBinding::Bridge);
        assert!(spec.domain.devices.interfaces[0].bridge.is_some());
        assert!(spec.networks[0].pod.is_some());

        let mut off = VirtualMachineInstanceSpec::default();
        off.domain.devices.autoattach_pod_interface = Some(false);
        add_default_network(&mut off, NetworkBinding::Masquerade);
        assert!(off.networks.is_empty());
    }

    #[test]
    fn machine_default_only_fills_empty() {
        let cfg = EngineConfig { default_machine_type: Some("q35".into()), ..Default::default() };
        let mut spec = VirtualMachineInstanceSpec::default();
        apply_cluster_defaults(&cfg, &mut spec);
        assert_eq!(spec.domain.machine.as_ref().unwrap().machine_type, "q35");
        spec.domain.machine = Some(Machine { machine_type: "pc".into() });
        apply_cluster_defaults(&cfg, &mut spec);
        assert_eq!(spec.domain.machine.unwrap().machine_type, "pc");
    }
}
