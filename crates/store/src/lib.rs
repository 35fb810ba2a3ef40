//! vmshape store: collaborator interfaces the engine reads through.
//!
//! Caches are synchronous, read-only lookups fed by someone else (informers,
//! a one-shot list, tests). Clients and the revision store are async and are
//! the only places the engine suspends.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::sync::Arc;

use k8s_openapi::api::apps::v1::ControllerRevision;
use serde::{Deserialize, Serialize};
use vmshape_core::StoreError;

mod mem;

pub use mem::{MemCache, MemObjectClient, MemRevisionStore, MemVolumeSourceClient};

/// Read-only keyed lookup; `namespace` is `None` for cluster-scoped objects.
pub trait ObjectCache<T>: Send + Sync {
    fn get(&self, namespace: Option<&str>, name: &str) -> Option<Arc<T>>;
}

/// Live fetch used on cache miss. `Ok(None)` is a clean not-found.
#[async_trait::async_trait]
pub trait ObjectClient<T>: Send + Sync {
    async fn get(&self, namespace: Option<&str>, name: &str) -> Result<Option<T>, StoreError>;
}

/// Result of an atomic create-or-fetch.
#[derive(Debug, Clone)]
pub enum CreateOutcome {
    Created(ControllerRevision),
    /// A revision with the same name already existed; it is returned untouched.
    Existing(ControllerRevision),
}

impl CreateOutcome {
    pub fn revision(&self) -> &ControllerRevision {
        match self {
            Self::Created(r) | Self::Existing(r) => r,
        }
    }

    pub fn into_revision(self) -> ControllerRevision {
        match self {
            Self::Created(r) | Self::Existing(r) => r,
        }
    }
}

#[async_trait::async_trait]
pub trait RevisionStore: Send + Sync {
    /// Create `rev`, or return the existing object if its name is taken. Never overwrites.
    async fn create_or_get(&self, rev: ControllerRevision) -> Result<CreateOutcome, StoreError>;
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<ControllerRevision>, StoreError>;
    /// Replace the content of an existing revision, keeping its name.
    async fn update(&self, rev: ControllerRevision) -> Result<ControllerRevision, StoreError>;
    /// Revisions in `namespace` whose owner references include `owner_uid`.
    async fn list_owned(&self, namespace: &str, owner_uid: &str) -> Result<Vec<ControllerRevision>, StoreError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SourceKind {
    PersistentVolumeClaim,
    DataVolume,
    DataSource,
}

impl std::fmt::Display for SourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::PersistentVolumeClaim => "PersistentVolumeClaim",
            Self::DataVolume => "DataVolume",
            Self::DataSource => "DataSource",
        };
        f.write_str(s)
    }
}

/// Pointer from one volume source to the object it was populated from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourcePointer {
    pub kind: SourceKind,
    pub namespace: String,
    pub name: String,
}

/// The parts of a PVC / DataVolume / DataSource inference looks at.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeSource {
    pub kind: SourceKind,
    pub labels: BTreeMap<String, String>,
    /// `sourceRef` or `source.pvc`, when the object was cloned from something.
    pub next: Option<SourcePointer>,
}

#[async_trait::async_trait]
pub trait VolumeSourceClient: Send + Sync {
    async fn get(&self, kind: SourceKind, namespace: &str, name: &str) -> Result<Option<VolumeSource>, StoreError>;
}
