//! vmshape find: resolve a workload's instancetype/preference reference to a spec.
//!
//! Resolution order: pinned revision (revision cache, then store), then the
//! scope's cache, then the live client. A pinned revision that cannot be
//! found is an error; it never falls back to the live object.

#![forbid(unsafe_code)]

use std::sync::Arc;

use k8s_openapi::api::apps::v1::ControllerRevision;
use metrics::counter;
use tracing::debug;
use vmshape_core::{Error, Family, Matcher, Result, Scope, TypedObject, VirtualMachine};
use vmshape_revision::{decode_as, RevisionFamily};
use vmshape_store::{ObjectCache, ObjectClient, RevisionStore};

/// Cache plus live client for one scope of one family.
pub struct Sources<T> {
    pub cache: Arc<dyn ObjectCache<T>>,
    pub client: Arc<dyn ObjectClient<T>>,
}

impl<T> Clone for Sources<T> {
    fn clone(&self) -> Self { Self { cache: Arc::clone(&self.cache), client: Arc::clone(&self.client) } }
}

impl<T> Sources<T> {
    pub fn new(cache: Arc<dyn ObjectCache<T>>, client: Arc<dyn ObjectClient<T>>) -> Self { Self { cache, client } }
}

pub struct SpecFinder<F: Family> {
    cluster: Sources<TypedObject<F::Spec>>,
    namespaced: Sources<TypedObject<F::Spec>>,
    revisions: Arc<dyn RevisionStore>,
    revision_cache: Option<Arc<dyn ObjectCache<ControllerRevision>>>,
}

impl<F: Family> Clone for SpecFinder<F> {
    fn clone(&self) -> Self {
        Self {
            cluster: self.cluster.clone(),
            namespaced: self.namespaced.clone(),
            revisions: Arc::clone(&self.revisions),
            revision_cache: self.revision_cache.clone(),
        }
    }
}

impl<F: RevisionFamily> SpecFinder<F> {
    pub fn new(cluster: Sources<TypedObject<F::Spec>>, namespaced: Sources<TypedObject<F::Spec>>, revisions: Arc<dyn RevisionStore>) -> Self {
        Self { cluster, namespaced, revisions, revision_cache: None }
    }

    pub fn with_revision_cache(mut self, cache: Arc<dyn ObjectCache<ControllerRevision>>) -> Self {
        self.revision_cache = Some(cache);
        self
    }

    /// The referenced spec, or `None` when the workload references nothing.
    pub async fn find(&self, vm: &VirtualMachine) -> Result<Option<F::Spec>> {
        let Some(m) = F::reference(&vm.spec) else { return Ok(None) };
        if !m.revision_name.is_empty() {
            let pinned = self.find_pinned(vm.namespace(), &m.revision_name).await?;
            return Ok(Some(pinned.spec));
        }
        let object = self.resolve(vm.namespace(), m).await?;
        Ok(Some(object.spec))
    }

    /// The full referenced object from cache or live client, ignoring any pin.
    pub async fn find_object(&self, vm: &VirtualMachine) -> Result<Option<TypedObject<F::Spec>>> {
        match F::reference(&vm.spec) {
            Some(m) => self.resolve(vm.namespace(), m).await.map(Some),
            None => Ok(None),
        }
    }

    async fn find_pinned(&self, namespace: &str, name: &str) -> Result<TypedObject<F::Spec>> {
        if let Some(cached) = self.revision_cache.as_ref().and_then(|c| c.get(Some(namespace), name)) {
            counter!("find_cache_hit_total", 1u64, "family" => F::NAME, "source" => "revision");
            return decode_as::<F>(&cached);
        }
        let rev = self
            .revisions
            .get(namespace, name)
            .await?
            .ok_or_else(|| Error::PinnedRevisionMissing { family: F::NAME, name: name.to_string() })?;
        debug!(family = F::NAME, revision = %name, "pinned revision fetched");
        decode_as::<F>(&rev)
    }

    async fn resolve(&self, vm_namespace: &str, m: &Matcher) -> Result<TypedObject<F::Spec>> {
        let scope = F::scope(&m.kind)?;
        let (sources, namespace, source) = match scope {
            Scope::Cluster => (&self.cluster, None, "cluster"),
            Scope::Namespaced => (&self.namespaced, Some(vm_namespace), "namespaced"),
        };
        if let Some(hit) = sources.cache.get(namespace, &m.name) {
            counter!("find_cache_hit_total", 1u64, "family" => F::NAME, "source" => source);
            return Ok(with_kind::<F>((*hit).clone(), scope));
        }
        counter!("find_live_fetch_total", 1u64, "family" => F::NAME, "source" => source);
        debug!(family = F::NAME, name = %m.name, scope = source, "cache miss, fetching live");
        match sources.client.get(namespace, &m.name).await? {
            Some(object) => Ok(with_kind::<F>(object, scope)),
            None => Err(Error::ReferenceNotFound { kind: F::kind_for(scope).to_string(), name: m.name.clone() }),
        }
    }
}

fn with_kind<F: Family>(mut object: TypedObject<F::Spec>, scope: Scope) -> TypedObject<F::Spec> {
    if object.kind.is_empty() {
        object.kind = F::kind_for(scope).to_string();
    }
    object
}
