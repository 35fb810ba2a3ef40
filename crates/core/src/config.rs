//! Cluster-level defaults the expander applies around the merge.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkBinding {
    #[default]
    Masquerade,
    Bridge,
}

impl std::str::FromStr for NetworkBinding {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "masquerade" => Ok(Self::Masquerade),
            "bridge" => Ok(Self::Bridge),
            other => Err(format!("unsupported network binding {:?} (expect masquerade|bridge)", other)),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Binding used for the default pod interface added during expansion.
    pub default_network_binding: NetworkBinding,
    /// Machine type set after the merge when neither workload nor preference chose one.
    pub default_machine_type: Option<String>,
}

impl EngineConfig {
    /// Read `VMSHAPE_DEFAULT_NETWORK_BINDING` and `VMSHAPE_DEFAULT_MACHINE_TYPE`.
    /// Unparsable values fall back to defaults.
    pub fn from_env() -> Self {
        let default_network_binding = std::env::var("VMSHAPE_DEFAULT_NETWORK_BINDING")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or_default();
        let default_machine_type = std::env::var("VMSHAPE_DEFAULT_MACHINE_TYPE").ok().filter(|s| !s.is_empty());
        Self { default_network_binding, default_machine_type }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn binding_parses_case_insensitively() {
        assert_eq!("Bridge".parse::<NetworkBinding>().unwrap(), NetworkBinding::Bridge);
        assert!("slirp".parse::<NetworkBinding>().is_err());
    }
}
