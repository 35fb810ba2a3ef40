//! Revision payload codec.
//!
//! Payloads written by older releases are still read: an ordered list of
//! decoders is tried newest first and the first one that recognises the
//! payload shape wins. Encoding always produces the latest shape.

use base64::Engine as _;
use k8s_openapi::api::apps::v1::ControllerRevision;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use serde_json::Value;
use vmshape_core::labels;
use vmshape_core::object::{
    API_VERSION_V1ALPHA1, API_VERSION_V1ALPHA2, API_VERSION_V1BETA1, CLUSTER_INSTANCETYPE_KIND, CLUSTER_PREFERENCE_KIND,
    INSTANCETYPE_KIND, PREFERENCE_KIND,
};
use vmshape_core::preference::PreferredCpuTopology;
use vmshape_core::{Error, Family, Instancetype, InstancetypeFamily, Preference, PreferenceFamily, Result, TypedObject};

/// A decoded revision payload of either family.
#[derive(Debug, Clone, PartialEq)]
pub enum RevisionObject {
    Instancetype(Instancetype),
    Preference(Preference),
}

impl RevisionObject {
    pub fn kind(&self) -> &str {
        match self {
            Self::Instancetype(o) => &o.kind,
            Self::Preference(o) => &o.kind,
        }
    }

    pub fn family(&self) -> &'static str {
        match self {
            Self::Instancetype(_) => InstancetypeFamily::NAME,
            Self::Preference(_) => PreferenceFamily::NAME,
        }
    }

    /// Same family and same spec; metadata is not considered.
    pub fn same_content(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Instancetype(a), Self::Instancetype(b)) => a.spec == b.spec,
            (Self::Preference(a), Self::Preference(b)) => a.spec == b.spec,
            _ => false,
        }
    }

    fn set_latest(&mut self) {
        match self {
            Self::Instancetype(o) => o.api_version = API_VERSION_V1BETA1.to_string(),
            Self::Preference(o) => o.api_version = API_VERSION_V1BETA1.to_string(),
        }
    }
}

/// Moves typed objects in and out of `RevisionObject` for one family.
pub trait RevisionFamily: Family {
    fn wrap(object: TypedObject<Self::Spec>) -> RevisionObject;
    fn unwrap(object: RevisionObject) -> std::result::Result<TypedObject<Self::Spec>, RevisionObject>;
}

impl RevisionFamily for InstancetypeFamily {
    fn wrap(object: Instancetype) -> RevisionObject { RevisionObject::Instancetype(object) }
    fn unwrap(object: RevisionObject) -> std::result::Result<Instancetype, RevisionObject> {
        match object {
            RevisionObject::Instancetype(o) => Ok(o),
            other => Err(other),
        }
    }
}

impl RevisionFamily for PreferenceFamily {
    fn wrap(object: Preference) -> RevisionObject { RevisionObject::Preference(object) }
    fn unwrap(object: RevisionObject) -> std::result::Result<Preference, RevisionObject> {
        match object {
            RevisionObject::Preference(o) => Ok(o),
            other => Err(other),
        }
    }
}

/// Result of decoding: the object in its latest in-memory form and the shape it came from.
#[derive(Debug, Clone, PartialEq)]
pub struct Decoded {
    pub object: RevisionObject,
    pub shape: &'static str,
    pub latest: bool,
}

/// One known payload shape.
pub trait PayloadDecoder: Send + Sync {
    fn shape(&self) -> &'static str;
    /// Cheap structural check; `decode` is only called when this returns true.
    fn accepts(&self, raw: &Value) -> bool;
    fn decode(&self, rev: &ControllerRevision, raw: &Value) -> Result<RevisionObject>;
}

fn api_version(raw: &Value) -> &str { raw.get("apiVersion").and_then(Value::as_str).unwrap_or("") }
fn kind(raw: &Value) -> &str { raw.get("kind").and_then(Value::as_str).unwrap_or("") }

fn rev_name(rev: &ControllerRevision) -> &str { rev.metadata.name.as_deref().unwrap_or("") }

fn from_kind(rev: &ControllerRevision, kind: &str, raw: Value) -> Result<RevisionObject> {
    let name = rev_name(rev);
    match kind {
        INSTANCETYPE_KIND | CLUSTER_INSTANCETYPE_KIND => {
            serde_json::from_value(raw).map(RevisionObject::Instancetype).map_err(|e| Error::decode(name, e))
        }
        PREFERENCE_KIND | CLUSTER_PREFERENCE_KIND => {
            serde_json::from_value(raw).map(RevisionObject::Preference).map_err(|e| Error::decode(name, e))
        }
        other => Err(Error::decode(name, format!("unsupported kind {:?}", other))),
    }
}

/// `instancetype.kubevirt.io/v1beta1` typed object.
pub struct LatestObject;

impl PayloadDecoder for LatestObject {
    fn shape(&self) -> &'static str { "v1beta1" }
    fn accepts(&self, raw: &Value) -> bool { api_version(raw) == API_VERSION_V1BETA1 && !kind(raw).is_empty() }
    fn decode(&self, rev: &ControllerRevision, raw: &Value) -> Result<RevisionObject> {
        from_kind(rev, kind(raw), raw.clone())
    }
}

/// `v1alpha2` and `v1alpha1` typed objects; same layout, older topology spellings.
pub struct LegacyObject;

impl PayloadDecoder for LegacyObject {
    fn shape(&self) -> &'static str { "v1alpha2" }
    fn accepts(&self, raw: &Value) -> bool {
        matches!(api_version(raw), API_VERSION_V1ALPHA2 | API_VERSION_V1ALPHA1) && !kind(raw).is_empty()
    }
    fn decode(&self, rev: &ControllerRevision, raw: &Value) -> Result<RevisionObject> {
        let mut raw = raw.clone();
        normalize_topology(&mut raw);
        raw["apiVersion"] = Value::String(API_VERSION_V1BETA1.to_string());
        let k = kind(&raw).to_string();
        from_kind(rev, &k, raw)
    }
}

/// `v1alpha1` spec-only wrapper: `{apiVersion, spec: base64(json)}` with the
/// object identity carried in the revision labels.
pub struct SpecRevision;

impl PayloadDecoder for SpecRevision {
    fn shape(&self) -> &'static str { "v1alpha1-spec-revision" }
    fn accepts(&self, raw: &Value) -> bool {
        api_version(raw) == API_VERSION_V1ALPHA1 && kind(raw).is_empty() && raw.get("spec").map(Value::is_string).unwrap_or(false)
    }
    fn decode(&self, rev: &ControllerRevision, raw: &Value) -> Result<RevisionObject> {
        let name = rev_name(rev);
        let encoded = raw.get("spec").and_then(Value::as_str).unwrap_or("");
        let bytes = base64::engine::general_purpose::STANDARD.decode(encoded).map_err(|e| Error::decode(name, e))?;
        let mut spec: Value = serde_json::from_slice(&bytes).map_err(|e| Error::decode(name, e))?;
        if let Some(t) = spec.pointer_mut("/cpu/preferredCPUTopology") {
            normalize_value(t);
        }
        let label = |key: &str| rev.metadata.labels.as_ref().and_then(|l| l.get(key)).cloned();
        let kind = label(labels::REVISION_OBJECT_KIND_LABEL)
            .ok_or_else(|| Error::decode(name, format!("spec revision without {} label", labels::REVISION_OBJECT_KIND_LABEL)))?;
        let metadata = ObjectMeta {
            name: label(labels::REVISION_OBJECT_NAME_LABEL),
            uid: label(labels::REVISION_OBJECT_UID_LABEL),
            generation: label(labels::REVISION_OBJECT_GENERATION_LABEL).and_then(|g| g.parse().ok()),
            ..Default::default()
        };
        let object = serde_json::json!({
            "apiVersion": API_VERSION_V1BETA1,
            "kind": kind,
            "metadata": metadata,
            "spec": spec,
        });
        from_kind(rev, &kind, object)
    }
}

fn normalize_topology(raw: &mut Value) {
    if let Some(t) = raw.pointer_mut("/spec/cpu/preferredCPUTopology") {
        normalize_value(t);
    }
}

fn normalize_value(t: &mut Value) {
    let current = t.as_str().map(|s| PreferredCpuTopology::normalize_legacy(s).to_string());
    if let Some(s) = current {
        *t = Value::String(s);
    }
}

static DECODERS: &[&dyn PayloadDecoder] = &[&LatestObject, &LegacyObject, &SpecRevision];

/// Known decoders, newest first.
pub fn decoders() -> &'static [&'static dyn PayloadDecoder] { DECODERS }

fn raw_payload(rev: &ControllerRevision) -> Result<&Value> {
    match rev.data.as_ref() {
        Some(d) if !d.0.is_null() => Ok(&d.0),
        _ => Err(Error::decode(rev_name(rev), "revision has no data")),
    }
}

/// Decode any known payload shape.
pub fn decode(rev: &ControllerRevision) -> Result<Decoded> {
    let raw = raw_payload(rev)?;
    for (i, d) in decoders().iter().enumerate() {
        if d.accepts(raw) {
            let object = d.decode(rev, raw)?;
            return Ok(Decoded { object, shape: d.shape(), latest: i == 0 });
        }
    }
    Err(Error::decode(
        rev_name(rev),
        format!("unrecognised payload (apiVersion {:?}, kind {:?})", api_version(raw), kind(raw)),
    ))
}

/// Decode and narrow to one family.
pub fn decode_as<F: RevisionFamily>(rev: &ControllerRevision) -> Result<TypedObject<F::Spec>> {
    let decoded = decode(rev)?;
    F::unwrap(decoded.object).map_err(|found| Error::UnexpectedRevisionPayload {
        family: F::NAME,
        name: rev_name(rev).to_string(),
        found: found.family().to_string(),
    })
}

/// True when the payload is already in the latest shape.
pub fn is_latest_version(rev: &ControllerRevision) -> bool {
    let Ok(raw) = raw_payload(rev) else { return false };
    let latest = &LatestObject;
    latest.accepts(raw) && latest.decode(rev, raw).is_ok()
}

/// Serialize in the latest shape.
pub fn encode(object: &RevisionObject) -> Result<Value> {
    let mut object = object.clone();
    object.set_latest();
    let v = match &object {
        RevisionObject::Instancetype(o) => serde_json::to_value(o),
        RevisionObject::Preference(o) => serde_json::to_value(o),
    };
    v.map_err(|e| Error::encode(object.kind(), e))
}
