//! vmshape upgrade: rewrite a workload's legacy revision payloads in the latest shape.

#![forbid(unsafe_code)]

use std::sync::Arc;

use k8s_openapi::api::apps::v1::ControllerRevision;
use k8s_openapi::apimachinery::pkg::runtime::RawExtension;
use metrics::counter;
use tracing::{debug, info};
use vmshape_core::labels;
use vmshape_core::object::LATEST_VERSION;
use vmshape_core::{Error, Family, InstancetypeFamily, PreferenceFamily, Result, VirtualMachine};
use vmshape_revision::{decode, encode, is_latest_version};
use vmshape_store::RevisionStore;

pub use vmshape_revision::is_latest_version as is_latest_revision_version;

#[derive(Clone)]
pub struct Upgrader {
    store: Arc<dyn RevisionStore>,
}

fn is_family_kind(kind: &str) -> bool { InstancetypeFamily::owns_kind(kind) || PreferenceFamily::owns_kind(kind) }

impl Upgrader {
    pub fn new(store: Arc<dyn RevisionStore>) -> Self { Self { store } }

    /// Upgrade every instancetype/preference revision owned by `vm`; returns how
    /// many were rewritten. Failures do not stop the others and are reported together.
    pub async fn upgrade(&self, vm: &VirtualMachine) -> Result<usize> {
        if vm.uid().is_empty() {
            return Err(Error::InvalidInput(format!("VirtualMachine {} has no uid", vm.name())));
        }
        let pinned: Vec<&str> = [vm.spec.instancetype.as_ref(), vm.spec.preference.as_ref()]
            .into_iter()
            .flatten()
            .map(|m| m.revision_name.as_str())
            .filter(|n| !n.is_empty())
            .collect();
        let owned = self.store.list_owned(vm.namespace(), vm.uid()).await?;

        let mut rewritten = 0usize;
        let mut failures = Vec::new();
        for rev in owned {
            let name = rev.metadata.name.clone().unwrap_or_default();
            let kind_label = rev.metadata.labels.as_ref().and_then(|l| l.get(labels::REVISION_OBJECT_KIND_LABEL));
            if !kind_label.map(|k| is_family_kind(k)).unwrap_or(false) && !pinned.contains(&name.as_str()) {
                continue;
            }
            if is_latest_version(&rev) {
                debug!(revision = %name, "controllerrevision already latest");
                continue;
            }
            match self.rewrite(rev).await {
                Ok(()) => {
                    rewritten += 1;
                    counter!("upgrade_rewritten_total", 1u64);
                    info!(vm = %vm.name(), revision = %name, "controllerrevision upgraded");
                }
                Err(e) => failures.push((name, e.to_string())),
            }
        }
        if failures.is_empty() {
            Ok(rewritten)
        } else {
            Err(Error::Upgrade { failures })
        }
    }

    async fn rewrite(&self, rev: ControllerRevision) -> Result<()> {
        let upgraded = upgrade_revision(&rev)?;
        self.store.update(upgraded).await?;
        Ok(())
    }
}

/// The same revision (name, owner, labels) carrying the payload in the latest shape.
pub fn upgrade_revision(rev: &ControllerRevision) -> Result<ControllerRevision> {
    let decoded = decode(rev)?;
    let data = encode(&decoded.object)?;
    let mut out = rev.clone();
    let l = out.metadata.labels.get_or_insert_with(Default::default);
    l.insert(labels::REVISION_OBJECT_VERSION_LABEL.to_string(), LATEST_VERSION.to_string());
    l.entry(labels::REVISION_OBJECT_KIND_LABEL.to_string()).or_insert_with(|| decoded.object.kind().to_string());
    out.data = Some(RawExtension(data));
    Ok(out)
}
