//! Declarative judge configuration loaded from YAML: a document wrapping
//! the engine's ordered `seccomp::Policy` plus the minimum kernel version
//! a run requires. Time and resource limits are a caller concern (see
//! `Listener::on_sigalrm_signal`), not a configured knob here.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};
use crate::seccomp::Policy;
use crate::tracee::Arch;

fn default_minimum_kernel() -> (u32, u32) {
    (3, 19)
}

/// The document a `--config` file deserializes into: the policy to
/// compile plus the minimum kernel version the host must satisfy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JudgeConfig {
    pub policy: Policy,
    #[serde(default = "default_minimum_kernel")]
    pub minimum_kernel: (u32, u32),
}

impl JudgeConfig {
    /// The default used when no config file is given: allow everything.
    pub fn allow_all(arch: Arch) -> Self {
        JudgeConfig { policy: Policy::allow(arch), minimum_kernel: default_minimum_kernel() }
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)
            .map_err(|err| EngineError::config(format!("reading config {}: {err}", path.display())))?;
        serde_yaml::from_str(&raw)
            .map_err(|err| EngineError::config(format!("parsing config {}: {err}", path.display())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allow_all_has_no_rules() {
        let config = JudgeConfig::allow_all(Arch::X86_64);
        assert!(config.policy.rules.is_empty());
    }

    #[test]
    fn round_trips_through_yaml() {
        let config = JudgeConfig::allow_all(Arch::X86_64);
        let text = serde_yaml::to_string(&config).expect("serialize");
        let parsed: JudgeConfig = serde_yaml::from_str(&text).expect("deserialize");
        assert_eq!(parsed.minimum_kernel, config.minimum_kernel);
    }

    #[test]
    fn missing_file_is_a_config_error() {
        assert!(JudgeConfig::from_file("/nonexistent/judgebox.yaml").is_err());
    }
}
