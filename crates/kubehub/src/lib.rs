//! vmshape kubehub: Kubernetes-backed collaborators for the engine.
//!
//! Objects are read through `Api<DynamicObject>` and converted with serde so
//! the engine's own types stay free of kube-derive.

#![forbid(unsafe_code)]

use std::marker::PhantomData;

use anyhow::{anyhow, Context, Result};
use k8s_openapi::api::apps::v1::ControllerRevision;
use k8s_openapi::api::core::v1::PersistentVolumeClaim;
use kube::{
    api::{Api, ListParams, PostParams},
    core::{ApiResource, DynamicObject, GroupVersionKind},
    Client,
};
use metrics::counter;
use once_cell::sync::Lazy;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::OnceCell;
use tracing::{debug, info};
use vmshape_core::object::{CLUSTER_INSTANCETYPE_KIND, CLUSTER_PREFERENCE_KIND, GROUP, INSTANCETYPE_KIND, LATEST_VERSION, PREFERENCE_KIND};
use vmshape_core::{StoreError, VirtualMachine};
use vmshape_store::{CreateOutcome, MemCache, ObjectClient, RevisionStore, SourceKind, SourcePointer, VolumeSource, VolumeSourceClient};

fn ar(group: &str, version: &str, kind: &str, plural: &str) -> ApiResource {
    ApiResource::from_gvk_with_plural(&GroupVersionKind::gvk(group, version, kind), plural)
}

pub static CLUSTER_INSTANCETYPES: Lazy<ApiResource> =
    Lazy::new(|| ar(GROUP, LATEST_VERSION, CLUSTER_INSTANCETYPE_KIND, "virtualmachineclusterinstancetypes"));
pub static INSTANCETYPES: Lazy<ApiResource> = Lazy::new(|| ar(GROUP, LATEST_VERSION, INSTANCETYPE_KIND, "virtualmachineinstancetypes"));
pub static CLUSTER_PREFERENCES: Lazy<ApiResource> =
    Lazy::new(|| ar(GROUP, LATEST_VERSION, CLUSTER_PREFERENCE_KIND, "virtualmachineclusterpreferences"));
pub static PREFERENCES: Lazy<ApiResource> = Lazy::new(|| ar(GROUP, LATEST_VERSION, PREFERENCE_KIND, "virtualmachinepreferences"));
static VIRTUAL_MACHINES: Lazy<ApiResource> = Lazy::new(|| ar("kubevirt.io", "v1", "VirtualMachine", "virtualmachines"));
static DATA_VOLUMES: Lazy<ApiResource> = Lazy::new(|| ar("cdi.kubevirt.io", "v1beta1", "DataVolume", "datavolumes"));
static DATA_SOURCES: Lazy<ApiResource> = Lazy::new(|| ar("cdi.kubevirt.io", "v1beta1", "DataSource", "datasources"));

static CLIENT: OnceCell<Client> = OnceCell::const_new();

/// Process-wide client from the ambient kubeconfig / in-cluster config.
pub async fn shared_client() -> Result<Client> {
    let c = CLIENT.get_or_try_init(|| async { Client::try_default().await.context("building kube client") }).await?;
    Ok(c.clone())
}

fn dynamic_api(client: Client, ar: &ApiResource, namespace: Option<&str>) -> Api<DynamicObject> {
    match namespace {
        Some(ns) => Api::namespaced_with(client, ns, ar),
        None => Api::all_with(client, ar),
    }
}

fn convert<T: DeserializeOwned>(obj: &DynamicObject) -> Result<T> {
    let mut raw = serde_json::to_value(obj).context("serializing DynamicObject")?;
    if let Some(meta) = raw.get_mut("metadata").and_then(|m| m.as_object_mut()) {
        meta.remove("managedFields");
    }
    serde_json::from_value(raw).context("decoding object")
}

fn backend(e: anyhow::Error) -> StoreError { StoreError::backend(format!("{:#}", e)) }

fn is_status(e: &kube::Error, code: u16) -> bool { matches!(e, kube::Error::Api(ae) if ae.code == code) }

/// Live reads of one instancetype/preference kind.
pub struct KubeObjectClient<T> {
    client: Client,
    ar: ApiResource,
    _t: PhantomData<fn() -> T>,
}

impl<T> KubeObjectClient<T> {
    pub fn new(client: Client, ar: &ApiResource) -> Self { Self { client, ar: ar.clone(), _t: PhantomData } }
}

#[async_trait::async_trait]
impl<T: DeserializeOwned + Send> ObjectClient<T> for KubeObjectClient<T> {
    async fn get(&self, namespace: Option<&str>, name: &str) -> std::result::Result<Option<T>, StoreError> {
        counter!("kube_get_total", 1u64, "kind" => self.ar.kind.clone());
        let api = dynamic_api(self.client.clone(), &self.ar, namespace);
        let found = api.get_opt(name).await.with_context(|| format!("get {} {}", self.ar.kind, name)).map_err(backend)?;
        found.as_ref().map(convert::<T>).transpose().map_err(backend)
    }
}

/// List every object of `ar` into `cache`, replacing what was there. Returns the count.
pub async fn prime_cache<T: DeserializeOwned>(client: Client, ar: &ApiResource, cache: &MemCache<T>) -> Result<usize> {
    let list = dynamic_api(client, ar, None).list(&ListParams::default()).await.with_context(|| format!("listing {}", ar.plural))?;
    let mut items = Vec::with_capacity(list.items.len());
    for o in &list.items {
        let name = o.metadata.name.clone().ok_or_else(|| anyhow!("{} without a name", ar.kind))?;
        items.push((o.metadata.namespace.clone(), name, convert::<T>(o)?));
    }
    let n = items.len();
    cache.replace_all(items);
    info!(kind = %ar.kind, count = n, "cache primed");
    Ok(n)
}

pub async fn get_virtual_machine(client: Client, namespace: &str, name: &str) -> Result<VirtualMachine> {
    let o = dynamic_api(client, &VIRTUAL_MACHINES, Some(namespace))
        .get(name)
        .await
        .with_context(|| format!("get VirtualMachine {}/{}", namespace, name))?;
    convert(&o)
}

/// ControllerRevisions through the API server. A 409 on create fetches the existing object.
pub struct KubeRevisionStore {
    client: Client,
}

impl KubeRevisionStore {
    pub fn new(client: Client) -> Self { Self { client } }

    fn api(&self, namespace: &str) -> Api<ControllerRevision> { Api::namespaced(self.client.clone(), namespace) }
}

fn revision_ns(rev: &ControllerRevision) -> std::result::Result<&str, StoreError> {
    rev.metadata.namespace.as_deref().ok_or_else(|| StoreError::Backend("ControllerRevision without a namespace".into()))
}

#[async_trait::async_trait]
impl RevisionStore for KubeRevisionStore {
    async fn create_or_get(&self, rev: ControllerRevision) -> std::result::Result<CreateOutcome, StoreError> {
        let ns = revision_ns(&rev)?;
        let name = rev.metadata.name.clone().unwrap_or_default();
        let api = self.api(ns);
        match api.create(&PostParams::default(), &rev).await {
            Ok(created) => Ok(CreateOutcome::Created(created)),
            Err(e) if is_status(&e, 409) => {
                debug!(ns = %ns, revision = %name, "revision exists, fetching");
                let existing = api.get(&name).await.with_context(|| format!("get ControllerRevision {}/{}", ns, name)).map_err(backend)?;
                Ok(CreateOutcome::Existing(existing))
            }
            Err(e) => Err(backend(anyhow::Error::new(e).context(format!("create ControllerRevision {}/{}", ns, name)))),
        }
    }

    async fn get(&self, namespace: &str, name: &str) -> std::result::Result<Option<ControllerRevision>, StoreError> {
        self.api(namespace).get_opt(name).await.with_context(|| format!("get ControllerRevision {}/{}", namespace, name)).map_err(backend)
    }

    async fn update(&self, rev: ControllerRevision) -> std::result::Result<ControllerRevision, StoreError> {
        let ns = revision_ns(&rev)?;
        let name = rev.metadata.name.clone().unwrap_or_default();
        match self.api(ns).replace(&name, &PostParams::default(), &rev).await {
            Ok(r) => Ok(r),
            Err(e) if is_status(&e, 409) => Err(StoreError::Conflict(name)),
            Err(e) if is_status(&e, 404) => Err(StoreError::NotFound(name)),
            Err(e) => Err(backend(anyhow::Error::new(e).context(format!("replace ControllerRevision {}/{}", ns, name)))),
        }
    }

    async fn list_owned(&self, namespace: &str, owner_uid: &str) -> std::result::Result<Vec<ControllerRevision>, StoreError> {
        let list = self
            .api(namespace)
            .list(&ListParams::default())
            .await
            .with_context(|| format!("list ControllerRevisions in {}", namespace))
            .map_err(backend)?;
        let mut owned: Vec<_> = list
            .items
            .into_iter()
            .filter(|r| r.metadata.owner_references.as_ref().map(|o| o.iter().any(|o| o.uid == owner_uid)).unwrap_or(false))
            .collect();
        owned.sort_by(|a, b| a.metadata.name.cmp(&b.metadata.name));
        Ok(owned)
    }
}

/// PVCs, DataVolumes and DataSources for volume inference.
pub struct KubeVolumeSourceClient {
    client: Client,
}

impl KubeVolumeSourceClient {
    pub fn new(client: Client) -> Self { Self { client } }
}

#[async_trait::async_trait]
impl VolumeSourceClient for KubeVolumeSourceClient {
    async fn get(&self, kind: SourceKind, namespace: &str, name: &str) -> std::result::Result<Option<VolumeSource>, StoreError> {
        counter!("kube_get_total", 1u64, "kind" => kind.to_string());
        let ctx = || format!("get {} {}/{}", kind, namespace, name);
        match kind {
            SourceKind::PersistentVolumeClaim => {
                let api: Api<PersistentVolumeClaim> = Api::namespaced(self.client.clone(), namespace);
                let pvc = api.get_opt(name).await.with_context(ctx).map_err(backend)?;
                Ok(pvc.map(|p| VolumeSource { kind, labels: p.metadata.labels.unwrap_or_default(), next: None }))
            }
            SourceKind::DataVolume | SourceKind::DataSource => {
                let ar = if kind == SourceKind::DataVolume { &*DATA_VOLUMES } else { &*DATA_SOURCES };
                let found = dynamic_api(self.client.clone(), ar, Some(namespace)).get_opt(name).await.with_context(ctx).map_err(backend)?;
                Ok(found.map(|o| VolumeSource {
                    kind,
                    labels: o.metadata.labels.clone().unwrap_or_default(),
                    next: next_source(kind, namespace, &o.data),
                }))
            }
        }
    }
}

/// DataVolume: `spec.sourceRef` (DataSource) then `spec.source.pvc`. DataSource: `spec.source.pvc`.
pub fn next_source(kind: SourceKind, namespace: &str, data: &Value) -> Option<SourcePointer> {
    let spec = data.get("spec")?;
    let ns_or = |v: &Value| v.get("namespace").and_then(Value::as_str).filter(|s| !s.is_empty()).unwrap_or(namespace).to_string();
    if kind == SourceKind::DataVolume {
        if let Some(r) = spec.get("sourceRef").filter(|r| r.get("kind").and_then(Value::as_str) == Some("DataSource")) {
            let name = r.get("name").and_then(Value::as_str)?;
            return Some(SourcePointer { kind: SourceKind::DataSource, namespace: ns_or(r), name: name.to_string() });
        }
    }
    let pvc = spec.get("source")?.get("pvc")?;
    let name = pvc.get("name").and_then(Value::as_str)?;
    Some(SourcePointer { kind: SourceKind::PersistentVolumeClaim, namespace: ns_or(pvc), name: name.to_string() })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn data_volume_prefers_source_ref() {
        let data = json!({ "spec": {
            "sourceRef": { "kind": "DataSource", "name": "fedora", "namespace": "images" },
            "source": { "pvc": { "name": "ignored" } }
        }});
        let next = next_source(SourceKind::DataVolume, "ns", &data).unwrap();
        assert_eq!(next, SourcePointer { kind: SourceKind::DataSource, namespace: "images".into(), name: "fedora".into() });
    }

    #[test]
    fn pvc_source_defaults_namespace() {
        let data = json!({ "spec": { "source": { "pvc": { "name": "golden" } } } });
        let next = next_source(SourceKind::DataSource, "ns", &data).unwrap();
        assert_eq!(next, SourcePointer { kind: SourceKind::PersistentVolumeClaim, namespace: "ns".into(), name: "golden".into() });
        assert!(next_source(SourceKind::DataSource, "ns", &json!({ "spec": {} })).is_none());
    }

    #[test]
    fn resources_use_latest_version() {
        assert_eq!(CLUSTER_INSTANCETYPES.api_version, "instancetype.kubevirt.io/v1beta1");
        assert_eq!(PREFERENCES.plural, "virtualmachinepreferences");
    }
}
