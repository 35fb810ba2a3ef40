//! In-memory collaborators: snapshot caches and a revision store that behaves
//! like the API server for create/get/update/list.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use arc_swap::ArcSwap;
use k8s_openapi::api::apps::v1::ControllerRevision;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use rustc_hash::FxHashMap;
use tracing::debug;
use vmshape_core::StoreError;

use crate::{CreateOutcome, ObjectCache, ObjectClient, RevisionStore, SourceKind, VolumeSource, VolumeSourceClient};

type Key = (Option<String>, String);

fn key(namespace: Option<&str>, name: &str) -> Key { (namespace.map(|s| s.to_string()), name.to_string()) }

/// Copy-on-write cache: readers load an immutable map, writers swap in a new one.
pub struct MemCache<T> {
    snap: ArcSwap<FxHashMap<Key, Arc<T>>>,
}

impl<T> Default for MemCache<T> {
    fn default() -> Self { Self { snap: ArcSwap::from_pointee(FxHashMap::default()) } }
}

impl<T> MemCache<T> {
    pub fn new() -> Self { Self::default() }

    pub fn len(&self) -> usize { self.snap.load().len() }
    pub fn is_empty(&self) -> bool { self.snap.load().is_empty() }

    pub fn upsert(&self, namespace: Option<&str>, name: &str, obj: T) {
        let obj = Arc::new(obj);
        let k = key(namespace, name);
        self.snap.rcu(|cur| {
            let mut next = FxHashMap::clone(cur);
            next.insert(k.clone(), Arc::clone(&obj));
            next
        });
    }

    pub fn remove(&self, namespace: Option<&str>, name: &str) {
        let k = key(namespace, name);
        self.snap.rcu(|cur| {
            let mut next = FxHashMap::clone(cur);
            next.remove(&k);
            next
        });
    }

    /// Replace the whole content, as after a relist.
    pub fn replace_all<I>(&self, items: I)
    where
        I: IntoIterator<Item = (Option<String>, String, T)>,
    {
        let map: FxHashMap<Key, Arc<T>> = items.into_iter().map(|(ns, name, o)| ((ns, name), Arc::new(o))).collect();
        debug!(count = map.len(), "cache replaced");
        self.snap.store(Arc::new(map));
    }
}

impl<T: Send + Sync> ObjectCache<T> for MemCache<T> {
    fn get(&self, namespace: Option<&str>, name: &str) -> Option<Arc<T>> {
        self.snap.load().get(&key(namespace, name)).cloned()
    }
}

/// Live-client stand-in backed by a `MemCache`; counts fetches.
pub struct MemObjectClient<T> {
    objects: MemCache<T>,
    fetches: AtomicUsize,
}

impl<T> Default for MemObjectClient<T> {
    fn default() -> Self { Self { objects: MemCache::default(), fetches: AtomicUsize::new(0) } }
}

impl<T> MemObjectClient<T> {
    pub fn new() -> Self { Self::default() }
    pub fn insert(&self, namespace: Option<&str>, name: &str, obj: T) { self.objects.upsert(namespace, name, obj); }
    pub fn fetches(&self) -> usize { self.fetches.load(Ordering::Relaxed) }
}

#[async_trait::async_trait]
impl<T: Clone + Send + Sync> ObjectClient<T> for MemObjectClient<T> {
    async fn get(&self, namespace: Option<&str>, name: &str) -> Result<Option<T>, StoreError> {
        self.fetches.fetch_add(1, Ordering::Relaxed);
        Ok(self.objects.get(namespace, name).map(|o| (*o).clone()))
    }
}

/// Revision store with API-server-like semantics: server-assigned uid,
/// resourceVersion and creationTimestamp; create never overwrites.
#[derive(Default)]
pub struct MemRevisionStore {
    items: Mutex<FxHashMap<(String, String), ControllerRevision>>,
    writes: AtomicUsize,
    rv: AtomicU64,
}

impl MemRevisionStore {
    pub fn new() -> Self { Self::default() }

    /// Number of successful creates and updates.
    pub fn writes(&self) -> usize { self.writes.load(Ordering::Relaxed) }

    /// Insert as-is, bypassing server-side stamping (seeding legacy data in tests).
    pub fn seed(&self, rev: ControllerRevision) -> Result<(), StoreError> {
        let k = Self::key_of(&rev)?;
        self.lock()?.insert(k, rev);
        Ok(())
    }

    fn lock(&self) -> Result<MutexGuard<'_, FxHashMap<(String, String), ControllerRevision>>, StoreError> {
        self.items.lock().map_err(|_| StoreError::Backend("revision store lock poisoned".into()))
    }

    fn key_of(rev: &ControllerRevision) -> Result<(String, String), StoreError> {
        let name = rev.metadata.name.clone().ok_or_else(|| StoreError::Backend("revision without metadata.name".into()))?;
        Ok((rev.metadata.namespace.clone().unwrap_or_default(), name))
    }

    fn next_rv(&self) -> String { (self.rv.fetch_add(1, Ordering::Relaxed) + 1).to_string() }
}

#[async_trait::async_trait]
impl RevisionStore for MemRevisionStore {
    async fn create_or_get(&self, mut rev: ControllerRevision) -> Result<CreateOutcome, StoreError> {
        let k = Self::key_of(&rev)?;
        let mut items = self.lock()?;
        if let Some(existing) = items.get(&k) {
            return Ok(CreateOutcome::Existing(existing.clone()));
        }
        rev.metadata.uid = Some(uuid::Uuid::new_v4().to_string());
        rev.metadata.resource_version = Some(self.next_rv());
        rev.metadata.creation_timestamp = Some(Time(chrono::Utc::now()));
        items.insert(k, rev.clone());
        self.writes.fetch_add(1, Ordering::Relaxed);
        Ok(CreateOutcome::Created(rev))
    }

    async fn get(&self, namespace: &str, name: &str) -> Result<Option<ControllerRevision>, StoreError> {
        Ok(self.lock()?.get(&(namespace.to_string(), name.to_string())).cloned())
    }

    async fn update(&self, mut rev: ControllerRevision) -> Result<ControllerRevision, StoreError> {
        let k = Self::key_of(&rev)?;
        let mut items = self.lock()?;
        let cur = items.get(&k).ok_or_else(|| StoreError::NotFound(format!("controllerrevision {}/{}", k.0, k.1)))?;
        if let (Some(want), Some(have)) = (&rev.metadata.resource_version, &cur.metadata.resource_version) {
            if want != have {
                return Err(StoreError::Conflict(format!("controllerrevision {} resourceVersion {} != {}", k.1, want, have)));
            }
        }
        rev.metadata.uid = cur.metadata.uid.clone();
        rev.metadata.creation_timestamp = cur.metadata.creation_timestamp.clone();
        rev.metadata.resource_version = Some(self.next_rv());
        items.insert(k, rev.clone());
        self.writes.fetch_add(1, Ordering::Relaxed);
        Ok(rev)
    }

    async fn list_owned(&self, namespace: &str, owner_uid: &str) -> Result<Vec<ControllerRevision>, StoreError> {
        let items = self.lock()?;
        let mut out: Vec<ControllerRevision> = items
            .iter()
            .filter(|((ns, _), _)| ns == namespace)
            .filter(|(_, r)| r.metadata.owner_references.iter().flatten().any(|o| o.uid == owner_uid))
            .map(|(_, r)| r.clone())
            .collect();
        out.sort_by(|a, b| a.metadata.name.cmp(&b.metadata.name));
        Ok(out)
    }
}

#[derive(Default)]
pub struct MemVolumeSourceClient {
    items: Mutex<FxHashMap<(SourceKind, String, String), VolumeSource>>,
}

impl MemVolumeSourceClient {
    pub fn new() -> Self { Self::default() }

    pub fn insert(&self, namespace: &str, name: &str, src: VolumeSource) {
        let mut items = self.items.lock().unwrap_or_else(PoisonError::into_inner);
        items.insert((src.kind, namespace.to_string(), name.to_string()), src);
    }
}

#[async_trait::async_trait]
impl VolumeSourceClient for MemVolumeSourceClient {
    async fn get(&self, kind: SourceKind, namespace: &str, name: &str) -> Result<Option<VolumeSource>, StoreError> {
        // Entries are whole values; a panic elsewhere cannot leave one half-written.
        let items = self.items.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(items.get(&(kind, namespace.to_string(), name.to_string())).cloned())
    }
}
