//! vmshape revision: naming, payload codec and create-or-fetch storage of
//! ControllerRevisions that pin a workload to an instancetype/preference.

#![forbid(unsafe_code)]

pub mod build;
pub mod codec;
pub mod name;
pub mod store;

pub use build::{create_revision, owner_reference};
pub use codec::{decode, decode_as, decoders, encode, is_latest_version, Decoded, PayloadDecoder, RevisionFamily, RevisionObject};
pub use name::generate_name;
pub use store::{compare, store, RevisionHandler};
