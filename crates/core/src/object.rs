//! Typed instancetype/preference objects and the `Family` parameter that lets
//! one algorithm serve both.

use std::fmt::Debug;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::instancetype::InstancetypeSpec;
use crate::labels;
use crate::preference::PreferenceSpec;
use crate::vm::{Matcher, VirtualMachineSpec};

pub const GROUP: &str = "instancetype.kubevirt.io";
pub const LATEST_VERSION: &str = "v1beta1";
pub const API_VERSION_V1BETA1: &str = "instancetype.kubevirt.io/v1beta1";
pub const API_VERSION_V1ALPHA2: &str = "instancetype.kubevirt.io/v1alpha2";
pub const API_VERSION_V1ALPHA1: &str = "instancetype.kubevirt.io/v1alpha1";

pub const INSTANCETYPE_KIND: &str = "VirtualMachineInstancetype";
pub const CLUSTER_INSTANCETYPE_KIND: &str = "VirtualMachineClusterInstancetype";
pub const PREFERENCE_KIND: &str = "VirtualMachinePreference";
pub const CLUSTER_PREFERENCE_KIND: &str = "VirtualMachineClusterPreference";

/// An instancetype or preference object as stored in the cluster and in revisions.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypedObject<S> {
    #[serde(default)]
    pub api_version: String,
    #[serde(default)]
    pub kind: String,
    #[serde(default)]
    pub metadata: ObjectMeta,
    pub spec: S,
}

pub type Instancetype = TypedObject<InstancetypeSpec>;
pub type Preference = TypedObject<PreferenceSpec>;

impl<S> TypedObject<S> {
    pub fn new(kind: &str, namespace: Option<&str>, name: &str, spec: S) -> Self {
        Self {
            api_version: API_VERSION_V1BETA1.to_string(),
            kind: kind.to_string(),
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: namespace.map(|s| s.to_string()),
                ..Default::default()
            },
            spec,
        }
    }

    pub fn name(&self) -> &str { self.metadata.name.as_deref().unwrap_or("") }
    pub fn namespace(&self) -> Option<&str> { self.metadata.namespace.as_deref() }
    pub fn uid(&self) -> &str { self.metadata.uid.as_deref().unwrap_or("") }
    pub fn generation(&self) -> i64 { self.metadata.generation.unwrap_or(0) }

    /// The version part of `apiVersion` (`v1beta1` for `instancetype.kubevirt.io/v1beta1`).
    pub fn version(&self) -> &str {
        self.api_version.rsplit_once('/').map(|(_, v)| v).unwrap_or(&self.api_version)
    }
}

/// Where a reference is resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Scope {
    Cluster,
    Namespaced,
}

/// Parameterizes the engine over instance types and preferences.
pub trait Family: Send + Sync + 'static {
    type Spec: Clone + Debug + PartialEq + Serialize + DeserializeOwned + Send + Sync + 'static;

    /// Lowercase family name used in messages and metrics.
    const NAME: &'static str;
    const CLUSTER_KIND: &'static str;
    const NAMESPACED_KIND: &'static str;
    /// Label on volume sources naming the default object of this family.
    const DEFAULT_NAME_LABEL: &'static str;
    const DEFAULT_KIND_LABEL: &'static str;
    const NAME_ANNOTATION: &'static str;
    const CLUSTER_NAME_ANNOTATION: &'static str;

    fn matcher(spec: &VirtualMachineSpec) -> Option<&Matcher>;
    fn matcher_slot(spec: &mut VirtualMachineSpec) -> &mut Option<Matcher>;

    /// Resolve a matcher kind; empty means cluster-scoped. Singular and plural
    /// forms are accepted case-insensitively.
    fn scope(kind: &str) -> Result<Scope> {
        let k = kind.to_ascii_lowercase();
        let matches = |canonical: &str| {
            let c = canonical.to_ascii_lowercase();
            k == c || k == format!("{}s", c)
        };
        if k.is_empty() || matches(Self::CLUSTER_KIND) {
            Ok(Scope::Cluster)
        } else if matches(Self::NAMESPACED_KIND) {
            Ok(Scope::Namespaced)
        } else {
            Err(Error::UnexpectedKind { family: Self::NAME, kind: kind.to_string() })
        }
    }

    fn kind_for(scope: Scope) -> &'static str {
        match scope {
            Scope::Cluster => Self::CLUSTER_KIND,
            Scope::Namespaced => Self::NAMESPACED_KIND,
        }
    }

    fn owns_kind(kind: &str) -> bool { kind == Self::CLUSTER_KIND || kind == Self::NAMESPACED_KIND }

    /// The matcher only if it actually names something.
    fn reference(spec: &VirtualMachineSpec) -> Option<&Matcher> {
        Self::matcher(spec).filter(|m| !m.name.is_empty())
    }
}

pub struct InstancetypeFamily;
pub struct PreferenceFamily;

impl Family for InstancetypeFamily {
    type Spec = InstancetypeSpec;
    const NAME: &'static str = "instancetype";
    const CLUSTER_KIND: &'static str = CLUSTER_INSTANCETYPE_KIND;
    const NAMESPACED_KIND: &'static str = INSTANCETYPE_KIND;
    const DEFAULT_NAME_LABEL: &'static str = labels::DEFAULT_INSTANCETYPE_LABEL;
    const DEFAULT_KIND_LABEL: &'static str = labels::DEFAULT_INSTANCETYPE_KIND_LABEL;
    const NAME_ANNOTATION: &'static str = labels::INSTANCETYPE_NAME_ANNOTATION;
    const CLUSTER_NAME_ANNOTATION: &'static str = labels::CLUSTER_INSTANCETYPE_NAME_ANNOTATION;

    fn matcher(spec: &VirtualMachineSpec) -> Option<&Matcher> { spec.instancetype.as_ref() }
    fn matcher_slot(spec: &mut VirtualMachineSpec) -> &mut Option<Matcher> { &mut spec.instancetype }
}

impl Family for PreferenceFamily {
    type Spec = PreferenceSpec;
    const NAME: &'static str = "preference";
    const CLUSTER_KIND: &'static str = CLUSTER_PREFERENCE_KIND;
    const NAMESPACED_KIND: &'static str = PREFERENCE_KIND;
    const DEFAULT_NAME_LABEL: &'static str = labels::DEFAULT_PREFERENCE_LABEL;
    const DEFAULT_KIND_LABEL: &'static str = labels::DEFAULT_PREFERENCE_KIND_LABEL;
    const NAME_ANNOTATION: &'static str = labels::PREFERENCE_NAME_ANNOTATION;
    const CLUSTER_NAME_ANNOTATION: &'static str = labels::CLUSTER_PREFERENCE_NAME_ANNOTATION;

    fn matcher(spec: &VirtualMachineSpec) -> Option<&Matcher> { spec.preference.as_ref() }
    fn matcher_slot(spec: &mut VirtualMachineSpec) -> &mut Option<Matcher> { &mut spec.preference }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scope_accepts_plural_and_case() {
        assert_eq!(InstancetypeFamily::scope("").unwrap(), Scope::Cluster);
        assert_eq!(InstancetypeFamily::scope("virtualmachineclusterinstancetypes").unwrap(), Scope::Cluster);
        assert_eq!(InstancetypeFamily::scope("VirtualMachineInstancetype").unwrap(), Scope::Namespaced);
        assert_eq!(PreferenceFamily::scope("virtualmachinepreferences").unwrap(), Scope::Namespaced);
        let err = PreferenceFamily::scope("VirtualMachineInstancetype").unwrap_err();
        assert_eq!(err.to_string(), "got unexpected kind in preference matcher: VirtualMachineInstancetype");
    }

    #[test]
    fn version_is_taken_from_api_version() {
        let o = Instancetype::new(CLUSTER_INSTANCETYPE_KIND, None, "u1", InstancetypeSpec::default());
        assert_eq!(o.version(), "v1beta1");
    }
}
