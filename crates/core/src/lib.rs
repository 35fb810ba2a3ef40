//! vmshape core: workload model, instancetype/preference specs, paths and errors.

#![forbid(unsafe_code)]

pub mod config;
pub mod error;
pub mod instancetype;
pub mod labels;
pub mod object;
pub mod path;
pub mod preference;
pub mod quantity;
pub mod vm;

pub use config::{EngineConfig, NetworkBinding};
pub use error::{Error, Result, StoreError};
pub use instancetype::InstancetypeSpec;
pub use object::{Family, Instancetype, InstancetypeFamily, Preference, PreferenceFamily, Scope, TypedObject};
pub use path::{Conflict, ConflictKind, Conflicts, FieldPath};
pub use preference::PreferenceSpec;
pub use vm::{Matcher, VirtualMachine, VirtualMachineInstanceSpec};

pub mod prelude {
    pub use super::{
        Conflict, ConflictKind, Conflicts, Error, FieldPath, Family, Instancetype, InstancetypeFamily, InstancetypeSpec,
        Matcher, Preference, PreferenceFamily, PreferenceSpec, Result, Scope, StoreError, TypedObject, VirtualMachine,
        VirtualMachineInstanceSpec,
    };
}
