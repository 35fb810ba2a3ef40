//! Well-known label and annotation keys.

// Stamped on every ControllerRevision the engine creates.
pub const REVISION_OBJECT_NAME_LABEL: &str = "instancetype.kubevirt.io/object-name";
pub const REVISION_OBJECT_KIND_LABEL: &str = "instancetype.kubevirt.io/object-kind";
pub const REVISION_OBJECT_UID_LABEL: &str = "instancetype.kubevirt.io/object-uid";
pub const REVISION_OBJECT_VERSION_LABEL: &str = "instancetype.kubevirt.io/object-version";
pub const REVISION_OBJECT_GENERATION_LABEL: &str = "instancetype.kubevirt.io/object-generation";

// Carried by volume sources (PVC, DataVolume, DataSource) for inference.
pub const DEFAULT_INSTANCETYPE_LABEL: &str = "instancetype.kubevirt.io/default-instancetype";
pub const DEFAULT_INSTANCETYPE_KIND_LABEL: &str = "instancetype.kubevirt.io/default-instancetype-kind";
pub const DEFAULT_PREFERENCE_LABEL: &str = "instancetype.kubevirt.io/default-preference";
pub const DEFAULT_PREFERENCE_KIND_LABEL: &str = "instancetype.kubevirt.io/default-preference-kind";

// Written onto instance metadata to record what was applied.
pub const INSTANCETYPE_NAME_ANNOTATION: &str = "kubevirt.io/instancetype-name";
pub const CLUSTER_INSTANCETYPE_NAME_ANNOTATION: &str = "kubevirt.io/cluster-instancetype-name";
pub const PREFERENCE_NAME_ANNOTATION: &str = "kubevirt.io/preference-name";
pub const CLUSTER_PREFERENCE_NAME_ANNOTATION: &str = "kubevirt.io/cluster-preference-name";
