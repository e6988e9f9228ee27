//! Behavior-Affecting Surface: the declared environment registry
//!
//! Every environment variable the kernel, worker, or validators consult is
//! declared here with a classification. `Contractual` keys feed the execution
//! contract; `NonContractual` keys tune runtime behavior without affecting
//! decisions. In strict mode (`DEEPRUN_STRICT_BAS=true`) reading an
//! undeclared key is an error rather than a silent `None`.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Classification of a declared environment key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Classification {
    /// Participates in execution-contract resolution.
    Contractual,
    /// Runtime tuning only; never part of the contract hash.
    NonContractual,
}

/// A declared environment key.
#[derive(Debug, Clone, Copy)]
pub struct EnvKey {
    pub name: &'static str,
    pub classification: Classification,
    pub description: &'static str,
}

/// The complete declared environment surface.
pub const DECLARED_ENV: &[EnvKey] = &[
    EnvKey {
        name: "AGENT_EXECUTION_PROFILE",
        classification: Classification::Contractual,
        description: "Fallback execution profile (full|ci|smoke)",
    },
    EnvKey {
        name: "AGENT_LIGHT_VALIDATION_MODE",
        classification: Classification::Contractual,
        description: "Fallback light validation mode (off|full)",
    },
    EnvKey {
        name: "AGENT_HEAVY_VALIDATION_MODE",
        classification: Classification::Contractual,
        description: "Fallback heavy validation mode (off|full)",
    },
    EnvKey {
        name: "AGENT_HEAVY_INSTALL_DEPS",
        classification: Classification::Contractual,
        description: "Whether heavy validation runs npm ci first",
    },
    EnvKey {
        name: "AGENT_GOAL_MAX_CORRECTIONS",
        classification: Classification::Contractual,
        description: "Fallback runtime correction budget for the goal phase",
    },
    EnvKey {
        name: "AGENT_OPTIMIZATION_MAX_CORRECTIONS",
        classification: Classification::Contractual,
        description: "Fallback heavy correction budget for the optimization phase",
    },
    EnvKey {
        name: "NODE_ID",
        classification: Classification::NonContractual,
        description: "Worker node identifier",
    },
    EnvKey {
        name: "NODE_ROLE",
        classification: Classification::NonContractual,
        description: "Worker role (compute|eval)",
    },
    EnvKey {
        name: "WORKER_CAPABILITIES",
        classification: Classification::NonContractual,
        description: "Comma-separated worker capability tags",
    },
    EnvKey {
        name: "WORKER_POLL_MS",
        classification: Classification::NonContractual,
        description: "Job poll interval in milliseconds",
    },
    EnvKey {
        name: "WORKER_HEARTBEAT_MS",
        classification: Classification::NonContractual,
        description: "Worker heartbeat interval in milliseconds",
    },
    EnvKey {
        name: "WORKER_JOB_LEASE_SECONDS",
        classification: Classification::NonContractual,
        description: "Job lease duration in seconds",
    },
    EnvKey {
        name: "V1_DOCKER_BIN",
        classification: Classification::NonContractual,
        description: "Docker CLI binary used by V1 readiness checks",
    },
    EnvKey {
        name: "V1_DOCKER_HEALTH_PATH",
        classification: Classification::NonContractual,
        description: "Health endpoint polled inside the container",
    },
    EnvKey {
        name: "V1_DOCKER_KEEP_IMAGE",
        classification: Classification::NonContractual,
        description: "Skip image teardown after V1 readiness",
    },
    EnvKey {
        name: "DEEPRUN_STRICT_BAS",
        classification: Classification::NonContractual,
        description: "Reject environment reads outside the declared registry",
    },
    EnvKey {
        name: "DATABASE_URL",
        classification: Classification::NonContractual,
        description: "Store / migration database URL",
    },
];

/// Error for undeclared reads in strict mode.
#[derive(Debug, Error)]
pub enum BasError {
    #[error("environment key '{0}' is not in the declared registry")]
    Undeclared(String),
}

/// Look up a key's declaration.
pub fn declaration(name: &str) -> Option<&'static EnvKey> {
    DECLARED_ENV.iter().find(|k| k.name == name)
}

/// Whether a key is declared.
pub fn is_declared(name: &str) -> bool {
    declaration(name).is_some()
}

/// Whether strict mode is enabled. `DEEPRUN_STRICT_BAS` is itself declared,
/// so this read always goes through the registry.
pub fn strict_mode() -> bool {
    std::env::var("DEEPRUN_STRICT_BAS")
        .map(|v| v == "true" || v == "1")
        .unwrap_or(false)
}

/// Read a declared environment key.
///
/// Undeclared keys return `Err` in strict mode and `Ok(None)` otherwise,
/// with a warning either way: an undeclared read is a registry gap.
pub fn read(name: &str) -> Result<Option<String>, BasError> {
    if !is_declared(name) {
        if strict_mode() {
            return Err(BasError::Undeclared(name.to_string()));
        }
        tracing::warn!(key = name, "environment read outside declared registry");
        return Ok(None);
    }
    Ok(std::env::var(name).ok())
}

/// Read a declared key, treating empty values as absent.
pub fn read_non_empty(name: &str) -> Result<Option<String>, BasError> {
    Ok(read(name)?.filter(|v| !v.trim().is_empty()))
}

/// Read a declared boolean key (`true`/`1` are truthy).
pub fn read_bool(name: &str) -> Result<Option<bool>, BasError> {
    Ok(read_non_empty(name)?.map(|v| v == "true" || v == "1"))
}

/// Read a declared numeric key, ignoring unparseable values.
pub fn read_u64(name: &str) -> Result<Option<u64>, BasError> {
    Ok(read_non_empty(name)?.and_then(|v| v.parse().ok()))
}

/// All declared keys with a given classification, sorted by name.
pub fn keys_with(classification: Classification) -> Vec<&'static str> {
    let mut keys: Vec<&'static str> = DECLARED_ENV
        .iter()
        .filter(|k| k.classification == classification)
        .map(|k| k.name)
        .collect();
    keys.sort_unstable();
    keys
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_declares_core_keys() {
        for key in [
            "AGENT_LIGHT_VALIDATION_MODE",
            "AGENT_HEAVY_VALIDATION_MODE",
            "AGENT_GOAL_MAX_CORRECTIONS",
            "NODE_ROLE",
            "WORKER_JOB_LEASE_SECONDS",
            "V1_DOCKER_BIN",
            "DEEPRUN_STRICT_BAS",
            "DATABASE_URL",
        ] {
            assert!(is_declared(key), "{key} must be declared");
        }
    }

    #[test]
    fn test_undeclared_read_is_none_without_strict() {
        std::env::remove_var("DEEPRUN_STRICT_BAS");
        assert!(read("DEFINITELY_NOT_DECLARED").unwrap().is_none());
    }

    #[test]
    fn test_contractual_keys_sorted() {
        let keys = keys_with(Classification::Contractual);
        let mut sorted = keys.clone();
        sorted.sort_unstable();
        assert_eq!(keys, sorted);
        assert!(keys.contains(&"AGENT_HEAVY_VALIDATION_MODE"));
        assert!(!keys.contains(&"NODE_ID"));
    }
}
