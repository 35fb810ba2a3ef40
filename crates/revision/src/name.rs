//! Deterministic revision names.

use sha2::{Digest, Sha256};
use vmshape_core::{Error, Result};

/// Kubernetes DNS subdomain limit.
pub const MAX_NAME_LEN: usize = 253;
const DIGEST_LEN: usize = 16;

/// `{owner}-{resource}-{digest}`; the digest covers the whole identity tuple so a
/// new version or generation of the same object never reuses a name.
pub fn generate_name(owner: &str, resource: &str, resource_version: &str, resource_uid: &str, resource_generation: i64) -> Result<String> {
    for (what, v) in [("owner name", owner), ("resource name", resource), ("resource version", resource_version), ("resource uid", resource_uid)] {
        if v.is_empty() {
            return Err(Error::InvalidInput(format!("revision name needs a non-empty {}", what)));
        }
    }
    let mut h = Sha256::new();
    let generation = resource_generation.to_string();
    for part in [owner, resource, resource_version, resource_uid, generation.as_str()] {
        h.update(part.as_bytes());
        h.update([0u8]);
    }
    let digest = hex::encode(h.finalize());
    let digest = &digest[..DIGEST_LEN];

    let mut prefix = format!("{}-{}", owner, resource);
    let room = MAX_NAME_LEN - DIGEST_LEN - 1;
    if prefix.len() > room {
        let mut cut = room;
        while !prefix.is_char_boundary(cut) {
            cut -= 1;
        }
        prefix.truncate(cut);
        while prefix.ends_with(['-', '.']) {
            prefix.pop();
        }
    }
    Ok(format!("{}-{}", prefix, digest))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_inputs_same_name() {
        let a = generate_name("vm", "u1.medium", "v1beta1", "uid-1", 1).unwrap();
        let b = generate_name("vm", "u1.medium", "v1beta1", "uid-1", 1).unwrap();
        assert_eq!(a, b);
        assert!(a.starts_with("vm-u1.medium-"));
        assert_eq!(a.len(), "vm-u1.medium-".len() + DIGEST_LEN);
    }

    #[test]
    fn version_and_generation_change_the_name() {
        let base = generate_name("vm", "u1", "v1beta1", "uid", 1).unwrap();
        assert_ne!(base, generate_name("vm", "u1", "v1beta1", "uid", 2).unwrap());
        assert_ne!(base, generate_name("vm", "u1", "v1alpha2", "uid", 1).unwrap());
    }

    #[test]
    fn empty_identity_is_rejected() {
        assert!(matches!(generate_name("", "u1", "v1beta1", "uid", 1), Err(Error::InvalidInput(_))));
        assert!(matches!(generate_name("vm", "u1", "v1beta1", "", 1), Err(Error::InvalidInput(_))));
    }

    #[test]
    fn long_names_fit_a_subdomain() {
        let owner = "a".repeat(200);
        let resource = "b".repeat(200);
        let n = generate_name(&owner, &resource, "v1beta1", "uid", 1).unwrap();
        assert!(n.len() <= MAX_NAME_LEN);
        assert!(!n.contains("--"));
    }
}
