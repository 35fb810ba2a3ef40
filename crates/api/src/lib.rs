//! vmshape public API façade (in-process).
//!
//! `Methods` is the one surface controllers, webhooks and the CLI depend on.
//! `InstancetypeMethods` wires it to whatever collaborators the caller
//! provides: in-memory ones for tests, Kubernetes-backed ones in production.

#![forbid(unsafe_code)]

use std::sync::Arc;

use k8s_openapi::api::apps::v1::ControllerRevision;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use tracing::info;
use vmshape_apply::VmApplier;
use vmshape_core::preference::{PreferredCpuTopology, SpreadAcross};
use vmshape_core::{
    Conflicts, EngineConfig, FieldPath, Instancetype, InstancetypeFamily, InstancetypeSpec, Preference, PreferenceFamily, PreferenceSpec, Result,
    VirtualMachine, VirtualMachineInstanceSpec,
};
use vmshape_expand::Expander;
use vmshape_find::{Sources, SpecFinder};
use vmshape_infer::Inferencer;
use vmshape_revision::{RevisionHandler, RevisionObject};
use vmshape_store::{MemCache, MemObjectClient, MemRevisionStore, MemVolumeSourceClient, ObjectCache, RevisionStore, VolumeSourceClient};
use vmshape_upgrade::Upgrader;

pub use vmshape_core::Error;

/// Instancetype/preference operations on VirtualMachines.
#[async_trait::async_trait]
pub trait Methods: Send + Sync {
    async fn find_instancetype_spec(&self, vm: &VirtualMachine) -> Result<Option<InstancetypeSpec>>;

    async fn find_preference_spec(&self, vm: &VirtualMachine) -> Result<Option<PreferenceSpec>>;

    /// Merge into an instance spec in place; conflicts are returned, not raised.
    fn apply_to_vmi(
        &self,
        path: &FieldPath,
        instancetype: Option<&InstancetypeSpec>,
        preference: Option<&PreferenceSpec>,
        vmi: &mut VirtualMachineInstanceSpec,
        meta: &mut ObjectMeta,
    ) -> Result<Conflicts>;

    async fn apply_to_vm(&self, vm: &mut VirtualMachine) -> Result<()>;

    fn check_preference_requirements(
        &self,
        instancetype: Option<&InstancetypeSpec>,
        preference: Option<&PreferenceSpec>,
        vmi: &VirtualMachineInstanceSpec,
    ) -> Result<Conflicts>;

    /// Pin every unpinned reference to a ControllerRevision. The caller persists the VM.
    async fn store_revisions(&self, vm: &mut VirtualMachine) -> Result<()>;

    async fn infer_default_instancetype(&self, vm: &mut VirtualMachine) -> Result<()>;

    async fn infer_default_preference(&self, vm: &mut VirtualMachine) -> Result<()>;

    async fn upgrade(&self, vm: &VirtualMachine) -> Result<()>;

    async fn expand(&self, vm: &VirtualMachine) -> Result<VirtualMachine>;
}

/// Everything the engine reads through.
pub struct Collaborators {
    pub cluster_instancetypes: Sources<Instancetype>,
    pub instancetypes: Sources<Instancetype>,
    pub cluster_preferences: Sources<Preference>,
    pub preferences: Sources<Preference>,
    pub revisions: Arc<dyn RevisionStore>,
    pub revision_cache: Option<Arc<dyn ObjectCache<ControllerRevision>>>,
    pub volume_sources: Arc<dyn VolumeSourceClient>,
}

/// In-memory collaborators; objects are served from the caches only.
#[derive(Default)]
pub struct MemCollaborators {
    pub cluster_instancetypes: Arc<MemCache<Instancetype>>,
    pub instancetypes: Arc<MemCache<Instancetype>>,
    pub cluster_preferences: Arc<MemCache<Preference>>,
    pub preferences: Arc<MemCache<Preference>>,
    pub revisions: Arc<MemRevisionStore>,
    pub volume_sources: Arc<MemVolumeSourceClient>,
}

impl MemCollaborators {
    pub fn new() -> Self { Self::default() }

    /// Route an object into the cache matching its kind.
    pub fn insert_instancetype(&self, o: Instancetype) {
        let cache = if o.kind == vmshape_core::object::CLUSTER_INSTANCETYPE_KIND { &self.cluster_instancetypes } else { &self.instancetypes };
        let (ns, name) = (o.metadata.namespace.clone(), o.name().to_string());
        cache.upsert(ns.as_deref(), &name, o);
    }

    pub fn insert_preference(&self, o: Preference) {
        let cache = if o.kind == vmshape_core::object::CLUSTER_PREFERENCE_KIND { &self.cluster_preferences } else { &self.preferences };
        let (ns, name) = (o.metadata.namespace.clone(), o.name().to_string());
        cache.upsert(ns.as_deref(), &name, o);
    }

    pub fn collaborators(&self) -> Collaborators {
        fn sources<T: Clone + Send + Sync + 'static>(cache: &Arc<MemCache<T>>) -> Sources<T> {
            Sources::new(cache.clone(), Arc::new(MemObjectClient::<T>::new()))
        }
        Collaborators {
            cluster_instancetypes: sources(&self.cluster_instancetypes),
            instancetypes: sources(&self.instancetypes),
            cluster_preferences: sources(&self.cluster_preferences),
            preferences: sources(&self.preferences),
            revisions: self.revisions.clone(),
            revision_cache: None,
            volume_sources: self.volume_sources.clone(),
        }
    }
}

#[derive(Clone)]
pub struct InstancetypeMethods {
    applier: VmApplier,
    revisions: RevisionHandler,
    upgrader: Upgrader,
    inferencer: Inferencer,
    expander: Expander,
}

impl InstancetypeMethods {
    pub fn new(c: Collaborators, config: EngineConfig) -> Self {
        let mut instancetypes = SpecFinder::<InstancetypeFamily>::new(c.cluster_instancetypes, c.instancetypes, Arc::clone(&c.revisions));
        let mut preferences = SpecFinder::<PreferenceFamily>::new(c.cluster_preferences, c.preferences, Arc::clone(&c.revisions));
        if let Some(cache) = c.revision_cache {
            instancetypes = instancetypes.with_revision_cache(Arc::clone(&cache));
            preferences = preferences.with_revision_cache(cache);
        }
        let applier = VmApplier::new(instancetypes, preferences);
        Self {
            expander: Expander::new(applier.clone(), config),
            applier,
            revisions: RevisionHandler::new(Arc::clone(&c.revisions)),
            upgrader: Upgrader::new(c.revisions),
            inferencer: Inferencer::new(c.volume_sources),
        }
    }
}

#[async_trait::async_trait]
impl Methods for InstancetypeMethods {
    async fn find_instancetype_spec(&self, vm: &VirtualMachine) -> Result<Option<InstancetypeSpec>> {
        self.applier.instancetypes().find(vm).await
    }

    async fn find_preference_spec(&self, vm: &VirtualMachine) -> Result<Option<PreferenceSpec>> {
        self.applier.preferences().find(vm).await
    }

    fn apply_to_vmi(
        &self,
        path: &FieldPath,
        instancetype: Option<&InstancetypeSpec>,
        preference: Option<&PreferenceSpec>,
        vmi: &mut VirtualMachineInstanceSpec,
        meta: &mut ObjectMeta,
    ) -> Result<Conflicts> {
        vmshape_apply::apply_to_vmi(path, instancetype, preference, vmi, meta)
    }

    async fn apply_to_vm(&self, vm: &mut VirtualMachine) -> Result<()> { self.applier.apply_to_vm(vm).await }

    fn check_preference_requirements(
        &self,
        instancetype: Option<&InstancetypeSpec>,
        preference: Option<&PreferenceSpec>,
        vmi: &VirtualMachineInstanceSpec,
    ) -> Result<Conflicts> {
        vmshape_apply::check_preference_requirements(instancetype, preference, vmi)
    }

    async fn store_revisions(&self, vm: &mut VirtualMachine) -> Result<()> {
        if needs_pin(vm.spec.instancetype.as_ref()) {
            if let Some(object) = self.applier.instancetypes().find_object(vm).await? {
                self.revisions.pin::<InstancetypeFamily>(vm, &object).await?;
            }
        }
        if needs_pin(vm.spec.preference.as_ref()) {
            if let Some(object) = self.applier.preferences().find_object(vm).await? {
                self.revisions.pin::<PreferenceFamily>(vm, &object).await?;
            }
        }
        Ok(())
    }

    async fn infer_default_instancetype(&self, vm: &mut VirtualMachine) -> Result<()> { self.inferencer.infer_instancetype(vm).await }

    async fn infer_default_preference(&self, vm: &mut VirtualMachine) -> Result<()> { self.inferencer.infer_preference(vm).await }

    async fn upgrade(&self, vm: &VirtualMachine) -> Result<()> {
        let n = self.upgrader.upgrade(vm).await?;
        if n > 0 {
            info!(vm = %vm.name(), rewritten = n, "api: upgrade done");
        }
        Ok(())
    }

    async fn expand(&self, vm: &VirtualMachine) -> Result<VirtualMachine> { self.expander.expand(vm).await }
}

fn needs_pin(m: Option<&vmshape_core::Matcher>) -> bool { m.map(|m| !m.name.is_empty() && m.revision_name.is_empty()).unwrap_or(false) }

// ----------------- Pure helpers -----------------

pub fn generate_revision_name(owner: &str, resource: &str, resource_version: &str, resource_uid: &str, resource_generation: i64) -> Result<String> {
    vmshape_revision::generate_name(owner, resource, resource_version, resource_uid, resource_generation)
}

pub fn compare_revisions(a: &ControllerRevision, b: &ControllerRevision) -> Result<bool> { vmshape_revision::compare(a, b) }

pub fn is_latest_revision_version(rev: &ControllerRevision) -> bool { vmshape_revision::is_latest_version(rev) }

/// Build the revision pinning `object` for `vm` without storing it.
pub fn create_revision(vm: &VirtualMachine, object: &RevisionObject) -> Result<ControllerRevision> {
    match object {
        RevisionObject::Instancetype(o) => vmshape_revision::create_revision::<InstancetypeFamily>(vm, o),
        RevisionObject::Preference(o) => vmshape_revision::create_revision::<PreferenceFamily>(vm, o),
    }
}

pub fn add_instancetype_name_annotations(vm: &VirtualMachine, target: &mut ObjectMeta) {
    vmshape_apply::annotations::add_instancetype_name_annotations(vm, target)
}

pub fn add_preference_name_annotations(vm: &VirtualMachine, target: &mut ObjectMeta) {
    vmshape_apply::annotations::add_preference_name_annotations(vm, target)
}

pub fn apply_device_preferences(preference: &PreferenceSpec, vmi: &mut VirtualMachineInstanceSpec) {
    vmshape_apply::apply_device_preferences(preference, vmi)
}

pub fn preferred_topology(preference: Option<&PreferenceSpec>) -> PreferredCpuTopology { vmshape_apply::topology::preferred_topology(preference) }

pub fn spread_options(preference: Option<&PreferenceSpec>) -> (u32, SpreadAcross) { vmshape_apply::topology::spread_options(preference) }
