//! Execution contract: versioned, hashed run configuration
//!
//! A run's behavior is pinned by an `ExecutionConfig` plus the policy
//! versions active when it was created. The wrapped material is hashed over
//! canonical JSON; resuming a run in place requires the requested contract
//! to equal the persisted one unless an explicit override is given.

use crate::bas;
use crate::canon;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const EXECUTION_CONFIG_SCHEMA_VERSION: u32 = 1;
pub const DETERMINISM_POLICY_VERSION: u32 = 1;
pub const PLANNER_POLICY_VERSION: u32 = 2;
pub const CORRECTION_RECIPE_VERSION: u32 = 3;
pub const VALIDATION_POLICY_VERSION: u32 = 2;

/// Part of the contract material so the no-randomness intent is explicit
/// and hash-visible.
pub const RANDOMNESS_SEED: &str = "forbidden:no-random-branching";

/// Execution profile presets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionProfile {
    Full,
    Ci,
    Smoke,
}

impl ExecutionProfile {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "full" => Some(Self::Full),
            "ci" => Some(Self::Ci),
            "smoke" => Some(Self::Smoke),
            _ => None,
        }
    }
}

/// Validation layer toggle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationMode {
    Off,
    Full,
}

impl ValidationMode {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "off" => Some(Self::Off),
            "full" => Some(Self::Full),
            _ => None,
        }
    }

    pub fn is_off(self) -> bool {
        matches!(self, Self::Off)
    }
}

/// How correction recipes are selected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CorrectionPolicyMode {
    Balanced,
    Strict,
}

/// Whether a non-improving correction attempt fails the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConvergenceMode {
    Observe,
    Enforce,
}

/// Execution mode for resolution: `Builder` runs (scaffolding-only) force
/// both validation layers off regardless of any other source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    Standard,
    Builder,
}

/// The complete per-run configuration. Every knob lives here with a bounded
/// range; there are no ambient settings beyond the declared BAS registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionConfig {
    pub schema_version: u32,
    pub profile: ExecutionProfile,
    pub light_validation_mode: ValidationMode,
    pub heavy_validation_mode: ValidationMode,
    /// Goal-phase runtime correction budget, 0..=5.
    pub max_runtime_correction_attempts: u32,
    /// Optimization-phase heavy correction budget, 0..=3.
    pub max_heavy_correction_attempts: u32,
    pub correction_policy_mode: CorrectionPolicyMode,
    pub correction_convergence_mode: ConvergenceMode,
    /// 1_000..=300_000.
    pub planner_timeout_ms: u64,
    /// 1..=100.
    pub max_files_per_step: usize,
    /// 1_000..=10_000_000.
    pub max_total_diff_bytes: usize,
    /// 1_000..=20_000_000.
    pub max_file_bytes: usize,
    pub allow_env_mutation: bool,
}

/// Pure profile → config map.
pub fn execution_config_preset(profile: ExecutionProfile) -> ExecutionConfig {
    match profile {
        ExecutionProfile::Full => ExecutionConfig {
            schema_version: EXECUTION_CONFIG_SCHEMA_VERSION,
            profile,
            light_validation_mode: ValidationMode::Full,
            heavy_validation_mode: ValidationMode::Full,
            max_runtime_correction_attempts: 3,
            max_heavy_correction_attempts: 2,
            correction_policy_mode: CorrectionPolicyMode::Balanced,
            correction_convergence_mode: ConvergenceMode::Enforce,
            planner_timeout_ms: 120_000,
            max_files_per_step: 25,
            max_total_diff_bytes: 1_500_000,
            max_file_bytes: 2_000_000,
            allow_env_mutation: false,
        },
        ExecutionProfile::Ci => ExecutionConfig {
            schema_version: EXECUTION_CONFIG_SCHEMA_VERSION,
            profile,
            light_validation_mode: ValidationMode::Full,
            heavy_validation_mode: ValidationMode::Full,
            max_runtime_correction_attempts: 2,
            max_heavy_correction_attempts: 1,
            correction_policy_mode: CorrectionPolicyMode::Balanced,
            correction_convergence_mode: ConvergenceMode::Enforce,
            planner_timeout_ms: 90_000,
            max_files_per_step: 20,
            max_total_diff_bytes: 1_000_000,
            max_file_bytes: 2_000_000,
            allow_env_mutation: false,
        },
        ExecutionProfile::Smoke => ExecutionConfig {
            schema_version: EXECUTION_CONFIG_SCHEMA_VERSION,
            profile,
            light_validation_mode: ValidationMode::Full,
            heavy_validation_mode: ValidationMode::Off,
            max_runtime_correction_attempts: 1,
            max_heavy_correction_attempts: 1,
            correction_policy_mode: CorrectionPolicyMode::Balanced,
            correction_convergence_mode: ConvergenceMode::Observe,
            planner_timeout_ms: 30_000,
            max_files_per_step: 10,
            max_total_diff_bytes: 500_000,
            max_file_bytes: 1_000_000,
            allow_env_mutation: false,
        },
    }
}

/// Requested per-field overrides. Absent fields fall through the
/// resolution precedence chain.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ExecutionConfigOverride {
    pub profile: Option<ExecutionProfile>,
    pub light_validation_mode: Option<ValidationMode>,
    pub heavy_validation_mode: Option<ValidationMode>,
    pub max_runtime_correction_attempts: Option<u32>,
    pub max_heavy_correction_attempts: Option<u32>,
    pub correction_policy_mode: Option<CorrectionPolicyMode>,
    pub correction_convergence_mode: Option<ConvergenceMode>,
    pub planner_timeout_ms: Option<u64>,
    pub max_files_per_step: Option<usize>,
    pub max_total_diff_bytes: Option<usize>,
    pub max_file_bytes: Option<usize>,
    pub allow_env_mutation: Option<bool>,
}

impl ExecutionConfigOverride {
    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }
}

/// Environment-derived fallbacks, read through the declared BAS registry.
#[derive(Debug, Clone, Default)]
pub struct EnvFallback {
    pub profile: Option<ExecutionProfile>,
    pub light_validation_mode: Option<ValidationMode>,
    pub heavy_validation_mode: Option<ValidationMode>,
    pub max_runtime_correction_attempts: Option<u32>,
    pub max_heavy_correction_attempts: Option<u32>,
}

impl EnvFallback {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Read the contractual fallbacks from the declared environment surface.
    pub fn from_bas() -> Self {
        let read = |key: &str| bas::read_non_empty(key).ok().flatten();
        Self {
            profile: read("AGENT_EXECUTION_PROFILE").and_then(|v| ExecutionProfile::parse(&v)),
            light_validation_mode: read("AGENT_LIGHT_VALIDATION_MODE")
                .and_then(|v| ValidationMode::parse(&v)),
            heavy_validation_mode: read("AGENT_HEAVY_VALIDATION_MODE")
                .and_then(|v| ValidationMode::parse(&v)),
            max_runtime_correction_attempts: read("AGENT_GOAL_MAX_CORRECTIONS")
                .and_then(|v| v.parse().ok()),
            max_heavy_correction_attempts: read("AGENT_OPTIMIZATION_MAX_CORRECTIONS")
                .and_then(|v| v.parse().ok()),
        }
    }
}

/// Options controlling resolution.
#[derive(Debug, Clone)]
pub struct ResolveOptions {
    pub execution_mode: ExecutionMode,
    /// When true, persisted values win over preset values for fields the
    /// override does not set.
    pub preserve_base_profile: bool,
    /// Skip the resume-in-place equality guard.
    pub allow_contract_override: bool,
}

impl Default for ResolveOptions {
    fn default() -> Self {
        Self {
            execution_mode: ExecutionMode::Standard,
            preserve_base_profile: true,
            allow_contract_override: false,
        }
    }
}

/// A single differing field between persisted and requested configs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldDiff {
    pub field: String,
    pub persisted: serde_json::Value,
    pub requested: serde_json::Value,
}

/// Contract-level failures.
#[derive(Debug, Error)]
pub enum ContractError {
    #[error("execution contract mismatch on resume ({} field(s) differ)", diff.len())]
    Mismatch {
        persisted_hash: String,
        requested_hash: String,
        diff: Vec<FieldDiff>,
    },

    #[error("unsupported execution contract: {}", unsupported_fields.join(", "))]
    Unsupported { unsupported_fields: Vec<String> },

    #[error("config field '{field}' value {value} outside [{min}, {max}]")]
    InvalidValue {
        field: &'static str,
        value: u64,
        min: u64,
        max: u64,
    },

    #[error("contract serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl ContractError {
    /// Stable reason code for governance consumers.
    pub fn reason_code(&self) -> &'static str {
        match self {
            Self::Mismatch { .. } => "EXECUTION_CONTRACT_MISMATCH",
            Self::Unsupported { .. } => "UNSUPPORTED_CONTRACT",
            Self::InvalidValue { .. } => "INVALID_EXECUTION_CONFIG",
            Self::Serialization(_) => "CONTRACT_SERIALIZATION_FAILED",
        }
    }
}

fn resolve_field<T: Copy>(
    raw: Option<T>,
    preset_value: T,
    base: Option<T>,
    env_value: Option<T>,
    profile_explicit: bool,
    preserve_base: bool,
) -> T {
    if let Some(v) = raw {
        return v;
    }
    if profile_explicit {
        return preset_value;
    }
    if preserve_base {
        if let Some(v) = base {
            return v;
        }
    }
    env_value.unwrap_or(preset_value)
}

/// Resolve the effective config from persisted state, a requested override,
/// and environment fallbacks.
///
/// Precedence per field: explicit raw > profile preset > persisted base
/// (when `preserve_base_profile`) > env fallback > preset default. The
/// profile itself resolves first: raw > base > env > `full`.
pub fn resolve_execution_config(
    persisted: Option<&ExecutionConfig>,
    requested: Option<&ExecutionConfigOverride>,
    env: &EnvFallback,
    options: &ResolveOptions,
) -> Result<ExecutionConfig, ContractError> {
    let raw = requested.cloned().unwrap_or_default();
    let profile_explicit = raw.profile.is_some();
    let profile = raw
        .profile
        .or(persisted.map(|p| p.profile))
        .or(env.profile)
        .unwrap_or(ExecutionProfile::Full);

    let preset = execution_config_preset(profile);
    let base = persisted;
    let preserve = options.preserve_base_profile;

    let mut config = ExecutionConfig {
        schema_version: EXECUTION_CONFIG_SCHEMA_VERSION,
        profile,
        light_validation_mode: resolve_field(
            raw.light_validation_mode,
            preset.light_validation_mode,
            base.map(|b| b.light_validation_mode),
            env.light_validation_mode,
            profile_explicit,
            preserve,
        ),
        heavy_validation_mode: resolve_field(
            raw.heavy_validation_mode,
            preset.heavy_validation_mode,
            base.map(|b| b.heavy_validation_mode),
            env.heavy_validation_mode,
            profile_explicit,
            preserve,
        ),
        max_runtime_correction_attempts: resolve_field(
            raw.max_runtime_correction_attempts,
            preset.max_runtime_correction_attempts,
            base.map(|b| b.max_runtime_correction_attempts),
            env.max_runtime_correction_attempts,
            profile_explicit,
            preserve,
        ),
        max_heavy_correction_attempts: resolve_field(
            raw.max_heavy_correction_attempts,
            preset.max_heavy_correction_attempts,
            base.map(|b| b.max_heavy_correction_attempts),
            env.max_heavy_correction_attempts,
            profile_explicit,
            preserve,
        ),
        correction_policy_mode: resolve_field(
            raw.correction_policy_mode,
            preset.correction_policy_mode,
            base.map(|b| b.correction_policy_mode),
            None,
            profile_explicit,
            preserve,
        ),
        correction_convergence_mode: resolve_field(
            raw.correction_convergence_mode,
            preset.correction_convergence_mode,
            base.map(|b| b.correction_convergence_mode),
            None,
            profile_explicit,
            preserve,
        ),
        planner_timeout_ms: resolve_field(
            raw.planner_timeout_ms,
            preset.planner_timeout_ms,
            base.map(|b| b.planner_timeout_ms),
            None,
            profile_explicit,
            preserve,
        ),
        max_files_per_step: resolve_field(
            raw.max_files_per_step,
            preset.max_files_per_step,
            base.map(|b| b.max_files_per_step),
            None,
            profile_explicit,
            preserve,
        ),
        max_total_diff_bytes: resolve_field(
            raw.max_total_diff_bytes,
            preset.max_total_diff_bytes,
            base.map(|b| b.max_total_diff_bytes),
            None,
            profile_explicit,
            preserve,
        ),
        max_file_bytes: resolve_field(
            raw.max_file_bytes,
            preset.max_file_bytes,
            base.map(|b| b.max_file_bytes),
            None,
            profile_explicit,
            preserve,
        ),
        allow_env_mutation: resolve_field(
            raw.allow_env_mutation,
            preset.allow_env_mutation,
            base.map(|b| b.allow_env_mutation),
            None,
            profile_explicit,
            preserve,
        ),
    };

    if options.execution_mode == ExecutionMode::Builder {
        config.light_validation_mode = ValidationMode::Off;
        config.heavy_validation_mode = ValidationMode::Off;
    }

    validate_bounds(&config)?;
    Ok(config)
}

fn validate_bounds(config: &ExecutionConfig) -> Result<(), ContractError> {
    let check = |field: &'static str, value: u64, min: u64, max: u64| {
        if value < min || value > max {
            Err(ContractError::InvalidValue {
                field,
                value,
                min,
                max,
            })
        } else {
            Ok(())
        }
    };
    check(
        "maxRuntimeCorrectionAttempts",
        config.max_runtime_correction_attempts as u64,
        0,
        5,
    )?;
    check(
        "maxHeavyCorrectionAttempts",
        config.max_heavy_correction_attempts as u64,
        0,
        3,
    )?;
    check("plannerTimeoutMs", config.planner_timeout_ms, 1_000, 300_000)?;
    check("maxFilesPerStep", config.max_files_per_step as u64, 1, 100)?;
    check(
        "maxTotalDiffBytes",
        config.max_total_diff_bytes as u64,
        1_000,
        10_000_000,
    )?;
    check("maxFileBytes", config.max_file_bytes as u64, 1_000, 20_000_000)?;
    Ok(())
}

/// The immutable material the contract hash covers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionContractMaterial {
    pub determinism_policy_version: u32,
    pub planner_policy_version: u32,
    pub correction_recipe_version: u32,
    pub validation_policy_version: u32,
    pub randomness_seed: String,
    pub execution_config: ExecutionConfig,
}

/// A hashed execution contract.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionContract {
    pub material: ExecutionContractMaterial,
    pub hash: String,
}

/// Wrap a resolved config with the active policy versions.
pub fn build_execution_contract_material(config: &ExecutionConfig) -> ExecutionContractMaterial {
    ExecutionContractMaterial {
        determinism_policy_version: DETERMINISM_POLICY_VERSION,
        planner_policy_version: PLANNER_POLICY_VERSION,
        correction_recipe_version: CORRECTION_RECIPE_VERSION,
        validation_policy_version: VALIDATION_POLICY_VERSION,
        randomness_seed: RANDOMNESS_SEED.to_string(),
        execution_config: config.clone(),
    }
}

/// SHA-256 over the canonical JSON of the material.
pub fn hash_execution_contract_material(
    material: &ExecutionContractMaterial,
) -> Result<String, ContractError> {
    Ok(canon::hash_canonical(material)?)
}

/// Build and hash a contract from a resolved config.
pub fn build_execution_contract(config: &ExecutionConfig) -> Result<ExecutionContract, ContractError> {
    let material = build_execution_contract_material(config);
    let hash = hash_execution_contract_material(&material)?;
    Ok(ExecutionContract { material, hash })
}

/// Supported range for a contract version field.
#[derive(Debug, Clone, Copy)]
pub struct SupportedRange {
    pub field: &'static str,
    pub min: u32,
    pub max: u32,
}

pub const SUPPORTED_EXECUTION_CONTRACT_RANGES: &[SupportedRange] = &[
    SupportedRange {
        field: "determinismPolicyVersion",
        min: 1,
        max: DETERMINISM_POLICY_VERSION,
    },
    SupportedRange {
        field: "plannerPolicyVersion",
        min: 1,
        max: PLANNER_POLICY_VERSION,
    },
    SupportedRange {
        field: "correctionRecipeVersion",
        min: 1,
        max: CORRECTION_RECIPE_VERSION,
    },
    SupportedRange {
        field: "validationPolicyVersion",
        min: 1,
        max: VALIDATION_POLICY_VERSION,
    },
    SupportedRange {
        field: "executionConfig.schemaVersion",
        min: 1,
        max: EXECUTION_CONFIG_SCHEMA_VERSION,
    },
];

/// Result of a contract-support evaluation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContractSupport {
    pub supported: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub unsupported_fields: Vec<String>,
}

/// Check every version field against the supported ranges.
pub fn evaluate_execution_contract_support(
    material: &ExecutionContractMaterial,
) -> ContractSupport {
    let values = [
        ("determinismPolicyVersion", material.determinism_policy_version),
        ("plannerPolicyVersion", material.planner_policy_version),
        ("correctionRecipeVersion", material.correction_recipe_version),
        ("validationPolicyVersion", material.validation_policy_version),
        (
            "executionConfig.schemaVersion",
            material.execution_config.schema_version,
        ),
    ];

    let mut unsupported = Vec::new();
    for (field, value) in values {
        let range = SUPPORTED_EXECUTION_CONTRACT_RANGES
            .iter()
            .find(|r| r.field == field)
            .expect("every version field has a declared range");
        if value < range.min || value > range.max {
            unsupported.push(field.to_string());
        }
    }
    unsupported.sort();

    if unsupported.is_empty() {
        ContractSupport {
            supported: true,
            code: None,
            unsupported_fields: Vec::new(),
        }
    } else {
        ContractSupport {
            supported: false,
            code: Some("UNSUPPORTED_CONTRACT".to_string()),
            unsupported_fields: unsupported,
        }
    }
}

/// Field-level diff of two configs.
///
/// When the override omits `profile`, only the fields the override actually
/// set are compared; a full-profile override diffs every differing field.
pub fn diff_configs(
    persisted: &ExecutionConfig,
    resolved: &ExecutionConfig,
    requested: Option<&ExecutionConfigOverride>,
) -> Vec<FieldDiff> {
    let persisted_value = serde_json::to_value(persisted).unwrap_or_default();
    let resolved_value = serde_json::to_value(resolved).unwrap_or_default();
    let overlapping_only = requested.map(|r| r.profile.is_none()).unwrap_or(false);
    let requested_fields: Vec<String> = requested
        .and_then(|r| serde_json::to_value(r).ok())
        .and_then(|v| {
            v.as_object().map(|m| {
                m.iter()
                    .filter(|(_, v)| !v.is_null())
                    .map(|(k, _)| k.clone())
                    .collect()
            })
        })
        .unwrap_or_default();

    let (Some(p), Some(r)) = (persisted_value.as_object(), resolved_value.as_object()) else {
        return Vec::new();
    };

    let mut diffs = Vec::new();
    for (field, persisted_field) in p {
        if overlapping_only && !requested_fields.contains(field) {
            continue;
        }
        let requested_field = r.get(field).cloned().unwrap_or(serde_json::Value::Null);
        if *persisted_field != requested_field {
            diffs.push(FieldDiff {
                field: field.clone(),
                persisted: persisted_field.clone(),
                requested: requested_field,
            });
        }
    }
    diffs.sort_by(|a, b| a.field.cmp(&b.field));
    diffs
}

/// Resume guard: the requested contract must equal the persisted one unless
/// `allow_contract_override` is set.
pub fn guard_resume(
    persisted: &ExecutionConfig,
    persisted_hash: &str,
    requested: Option<&ExecutionConfigOverride>,
    env: &EnvFallback,
    options: &ResolveOptions,
) -> Result<ExecutionContract, ContractError> {
    let resolved = resolve_execution_config(Some(persisted), requested, env, options)?;
    let contract = build_execution_contract(&resolved)?;

    let support = evaluate_execution_contract_support(&contract.material);
    if !support.supported {
        return Err(ContractError::Unsupported {
            unsupported_fields: support.unsupported_fields,
        });
    }

    if contract.hash != persisted_hash && !options.allow_contract_override {
        return Err(ContractError::Mismatch {
            persisted_hash: persisted_hash.to_string(),
            requested_hash: contract.hash,
            diff: diff_configs(persisted, &resolved, requested),
        });
    }

    Ok(contract)
}
