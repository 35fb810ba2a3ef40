//! vmshape infer: fill an empty instancetype/preference reference from the
//! default-* labels on the boot volume's PVC, DataVolume or DataSource.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::debug;
use vmshape_core::vm::{CdiSource, CdiSourceRef, InferFailurePolicy};
use vmshape_core::{Error, Family, InstancetypeFamily, PreferenceFamily, Result, VirtualMachine};
use vmshape_store::{SourceKind, SourcePointer, VolumeSourceClient};

/// Limit on DataVolume -> DataSource -> PVC hops.
const MAX_HOPS: usize = 4;

/// Why inference stopped. Only `Unresolved` honours the `Ignore` policy.
enum Failure {
    Unresolved(String),
    Fatal(Error),
}

impl From<vmshape_core::StoreError> for Failure {
    fn from(e: vmshape_core::StoreError) -> Self { Failure::Fatal(e.into()) }
}

#[derive(Clone)]
pub struct Inferencer {
    sources: Arc<dyn VolumeSourceClient>,
}

impl Inferencer {
    pub fn new(sources: Arc<dyn VolumeSourceClient>) -> Self { Self { sources } }

    pub async fn infer_instancetype(&self, vm: &mut VirtualMachine) -> Result<()> { self.infer::<InstancetypeFamily>(vm).await }

    pub async fn infer_preference(&self, vm: &mut VirtualMachine) -> Result<()> { self.infer::<PreferenceFamily>(vm).await }

    /// No-op unless the matcher has no name and an `inferFromVolume` hint.
    pub async fn infer<F: Family>(&self, vm: &mut VirtualMachine) -> Result<()> {
        let Some(m) = F::matcher(&vm.spec) else { return Ok(()) };
        if !m.name.is_empty() || m.infer_from_volume.is_empty() {
            return Ok(());
        }
        let volume = m.infer_from_volume.clone();
        let policy = m.infer_from_volume_failure_policy.unwrap_or_default();

        match self.from_volume::<F>(vm, &volume).await {
            Ok((name, kind)) => {
                debug!(vm = %vm.name(), family = F::NAME, volume = %volume, name = %name, "default inferred");
                if let Some(m) = F::matcher_slot(&mut vm.spec).as_mut() {
                    m.name = name;
                    m.kind = kind;
                    m.infer_from_volume.clear();
                    m.infer_from_volume_failure_policy = None;
                }
                Ok(())
            }
            Err(Failure::Unresolved(reason)) if policy == InferFailurePolicy::Ignore => {
                debug!(vm = %vm.name(), family = F::NAME, %reason, "inference failed, reference dropped");
                *F::matcher_slot(&mut vm.spec) = None;
                Ok(())
            }
            Err(Failure::Unresolved(reason)) => Err(Error::Inference { family: F::NAME, reason }),
            Err(Failure::Fatal(e)) => Err(e),
        }
    }

    async fn from_volume<F: Family>(&self, vm: &VirtualMachine, volume: &str) -> std::result::Result<(String, String), Failure> {
        let ns = vm.namespace();
        let vol = vm
            .spec
            .template
            .as_ref()
            .and_then(|t| t.spec.volumes.iter().find(|v| v.name == volume))
            .ok_or_else(|| Failure::Unresolved(format!("unable to find volume {} to infer defaults", volume)))?;

        if let Some(pvc) = &vol.persistent_volume_claim {
            return self.follow::<F>(SourcePointer { kind: SourceKind::PersistentVolumeClaim, namespace: ns.to_string(), name: pvc.claim_name.clone() }).await;
        }
        if let Some(dv) = &vol.data_volume {
            if let Some(tpl) = vm.spec.data_volume_templates.iter().find(|t| t.metadata.name.as_deref() == Some(dv.name.as_str())) {
                if let Some(found) = defaults_from::<F>(tpl.metadata.labels.as_ref()) {
                    return Ok(found);
                }
                let next = pointer_from_spec(ns, tpl.spec.source_ref.as_ref(), tpl.spec.source.as_ref())?
                    .ok_or_else(|| Failure::Unresolved(format!("unable to find default {} labels on DataVolumeTemplate {}", F::NAME, dv.name)))?;
                return self.follow::<F>(next).await;
            }
            return self.follow::<F>(SourcePointer { kind: SourceKind::DataVolume, namespace: ns.to_string(), name: dv.name.clone() }).await;
        }
        Err(Failure::Unresolved(format!("volume {} is not a PersistentVolumeClaim or DataVolume", volume)))
    }

    async fn follow<F: Family>(&self, start: SourcePointer) -> std::result::Result<(String, String), Failure> {
        let mut at = start;
        for _ in 0..MAX_HOPS {
            let src = self
                .sources
                .get(at.kind, &at.namespace, &at.name)
                .await?
                .ok_or_else(|| Failure::Unresolved(format!("{} {}/{} not found", at.kind, at.namespace, at.name)))?;
            if let Some(found) = defaults_from::<F>(Some(&src.labels)) {
                return Ok(found);
            }
            match src.next {
                Some(next) => at = next,
                None => {
                    return Err(Failure::Unresolved(format!(
                        "unable to find default {} labels on {} {}/{}",
                        F::NAME, at.kind, at.namespace, at.name
                    )))
                }
            }
        }
        Err(Failure::Unresolved(format!("gave up following volume sources after {} hops", MAX_HOPS)))
    }
}

fn defaults_from<F: Family>(labels: Option<&BTreeMap<String, String>>) -> Option<(String, String)> {
    let labels = labels?;
    let name = labels.get(F::DEFAULT_NAME_LABEL).filter(|n| !n.is_empty())?;
    let kind = labels.get(F::DEFAULT_KIND_LABEL).cloned().unwrap_or_default();
    Some((name.clone(), kind))
}

/// Where a DataVolume spec was cloned from: `sourceRef` first, then `source.pvc`.
fn pointer_from_spec(ns: &str, source_ref: Option<&CdiSourceRef>, source: Option<&CdiSource>) -> std::result::Result<Option<SourcePointer>, Failure> {
    if let Some(r) = source_ref {
        if r.kind != "DataSource" {
            return Err(Failure::Unresolved(format!("unsupported sourceRef kind {}", r.kind)));
        }
        let namespace = r.namespace.clone().filter(|n| !n.is_empty()).unwrap_or_else(|| ns.to_string());
        return Ok(Some(SourcePointer { kind: SourceKind::DataSource, namespace, name: r.name.clone() }));
    }
    Ok(source.and_then(|s| s.pvc.as_ref()).map(|pvc| SourcePointer {
        kind: SourceKind::PersistentVolumeClaim,
        namespace: if pvc.namespace.is_empty() { ns.to_string() } else { pvc.namespace.clone() },
        name: pvc.name.clone(),
    }))
}
