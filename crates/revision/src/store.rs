//! Create-or-fetch at the store boundary, plus payload comparison.

use std::sync::Arc;
use std::time::Instant;

use k8s_openapi::api::apps::v1::ControllerRevision;
use metrics::{counter, histogram};
use tracing::{debug, info};
use vmshape_core::{Error, Result, TypedObject, VirtualMachine};
use vmshape_store::{CreateOutcome, RevisionStore};

use crate::build::create_revision;
use crate::codec::{self, RevisionFamily};

/// True when both payloads decode to the same family and spec.
pub fn compare(a: &ControllerRevision, b: &ControllerRevision) -> Result<bool> {
    let a = codec::decode(a)?;
    let b = codec::decode(b)?;
    Ok(a.object.same_content(&b.object))
}

/// Store `rev`, tolerating an identical revision already under that name.
pub async fn store(store: &dyn RevisionStore, rev: ControllerRevision) -> Result<ControllerRevision> {
    let started = Instant::now();
    let name = rev.metadata.name.clone().unwrap_or_default();
    let outcome = store.create_or_get(rev.clone()).await?;
    histogram!("revision_store_ms", started.elapsed().as_secs_f64() * 1000.0);
    match outcome {
        CreateOutcome::Created(created) => {
            counter!("revision_created_total", 1u64);
            info!(revision = %name, "controllerrevision created");
            Ok(created)
        }
        CreateOutcome::Existing(existing) => {
            if compare(&existing, &rev)? {
                debug!(revision = %name, "controllerrevision already present");
                Ok(existing)
            } else {
                Err(Error::RevisionIntegrity { name })
            }
        }
    }
}

/// Pins workloads to revisions of the objects they reference.
#[derive(Clone)]
pub struct RevisionHandler {
    store: Arc<dyn RevisionStore>,
}

impl RevisionHandler {
    pub fn new(store: Arc<dyn RevisionStore>) -> Self { Self { store } }

    pub fn store_handle(&self) -> &Arc<dyn RevisionStore> { &self.store }

    /// Snapshot `object`, store it and record the revision name on the workload's matcher.
    /// A matcher that is absent or already pinned is left alone.
    pub async fn pin<F: RevisionFamily>(&self, vm: &mut VirtualMachine, object: &TypedObject<F::Spec>) -> Result<Option<String>> {
        match F::matcher(&vm.spec) {
            Some(m) if m.revision_name.is_empty() => {}
            _ => return Ok(None),
        }
        let rev = create_revision::<F>(vm, object)?;
        let stored = store(self.store.as_ref(), rev).await?;
        let name = stored.metadata.name.unwrap_or_default();
        if let Some(m) = F::matcher_slot(&mut vm.spec).as_mut() {
            m.revision_name = name.clone();
        }
        debug!(vm = %vm.name(), family = F::NAME, revision = %name, "matcher pinned");
        Ok(Some(name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::runtime::RawExtension;
    use vmshape_core::object::CLUSTER_INSTANCETYPE_KIND;
    use vmshape_core::{Instancetype, InstancetypeFamily, InstancetypeSpec, Matcher};
    use vmshape_store::MemRevisionStore;

    fn vm() -> VirtualMachine {
        let mut vm = VirtualMachine::new("ns", "vm");
        vm.metadata.uid = Some("vm-uid".into());
        vm.spec.instancetype = Some(Matcher::named("u1", ""));
        vm
    }

    fn it(guest: u32) -> Instancetype {
        let mut spec = InstancetypeSpec::default();
        spec.cpu.guest = guest;
        let mut it = Instancetype::new(CLUSTER_INSTANCETYPE_KIND, None, "u1", spec);
        it.metadata.uid = Some("it-uid".into());
        it.metadata.generation = Some(1);
        it
    }

    #[test]
    fn compare_ignores_metadata() {
        let a = create_revision::<InstancetypeFamily>(&vm(), &it(2)).unwrap();
        let mut b = a.clone();
        b.metadata.resource_version = Some("99".into());
        if let Some(RawExtension(v)) = b.data.as_mut() {
            v["metadata"]["resourceVersion"] = "42".into();
        }
        assert!(compare(&a, &b).unwrap());
        let c = create_revision::<InstancetypeFamily>(&vm(), &it(4)).unwrap();
        assert!(!compare(&a, &c).unwrap());
    }

    #[tokio::test]
    async fn pin_is_idempotent() {
        let s = Arc::new(MemRevisionStore::new());
        let h = RevisionHandler::new(s.clone());
        let mut first = vm();
        let name = h.pin::<InstancetypeFamily>(&mut first, &it(2)).await.unwrap().unwrap();
        assert_eq!(first.spec.instancetype.as_ref().unwrap().revision_name, name);

        let mut second = vm();
        let again = h.pin::<InstancetypeFamily>(&mut second, &it(2)).await.unwrap().unwrap();
        assert_eq!(again, name);
        assert_eq!(s.writes(), 1);

        // already pinned: nothing to do
        assert!(h.pin::<InstancetypeFamily>(&mut first, &it(2)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn differing_payload_under_same_name_is_an_integrity_error() {
        let s = MemRevisionStore::new();
        let rev = create_revision::<InstancetypeFamily>(&vm(), &it(2)).unwrap();
        store(&s, rev.clone()).await.unwrap();
        let mut tampered = rev;
        tampered.data = create_revision::<InstancetypeFamily>(&vm(), &it(8)).unwrap().data;
        let err = store(&s, tampered).await.unwrap_err();
        assert!(matches!(err, Error::RevisionIntegrity { .. }));
    }
}
