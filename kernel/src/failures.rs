//! Failure parsing and classification
//!
//! Turns raw command output from failed checks into typed failures, then
//! clusters a validation outcome into a correction intent plus a bounded
//! `CorrectionConstraint` the planner must stay inside.

use crate::findings::Violation;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::LazyLock;

/// Cap on typed failures per parse.
const MAX_FAILURES: usize = 20;

/// Fallback excerpt size for unparseable output.
const EXCERPT_BYTES: usize = 6_000;

static TS_ERROR_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^(.+?)\((\d+),(\d+)\): error (TS\d+): (.+)$").unwrap()
});

static TEST_FAIL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^\s*(?:✗|✘|×|FAIL)\s+(.+)$").unwrap());

static ASSERTION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^(?:\s*)(AssertionError:?[^\n]*|expected [^\n]+? to [^\n]+)$").unwrap()
});

static LOCATION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"([\w./-]+\.[a-z]+):(\d+):(\d+)").unwrap());

static BOOT_ERROR_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^Error: (.+)$").unwrap());

static BOOT_CODE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"code: '([A-Z0-9_]+)'").unwrap());

static PRISMA_CODE_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\b(P\d{4})\b").unwrap());

static MIGRATE_LINE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?mi)^.*\b(migration|migrate)\b.*$").unwrap());

static INSTALL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(ERESOLVE|ENOTFOUND|No matching version)").unwrap());

/// Typed failure kinds per source check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    TypescriptError,
    TestFailure,
    BootError,
    MigrationError,
    InstallError,
    Unknown,
}

/// A typed failure extracted from check output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationFailure {
    /// Source check id, e.g. `typecheck`, `tests`, `boot`.
    pub source: String,
    pub kind: FailureKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub col: Option<usize>,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub excerpt: Option<String>,
}

impl ValidationFailure {
    fn dedup_key(&self) -> String {
        format!(
            "{}|{:?}|{}|{}|{}|{}|{}",
            self.source,
            self.kind,
            self.code.as_deref().unwrap_or(""),
            self.file.as_deref().unwrap_or(""),
            self.line.unwrap_or(0),
            self.col.unwrap_or(0),
            self.message
        )
    }
}

/// Parse a failed check's combined output into typed failures.
///
/// Unparseable output falls back to a single `unknown` entry carrying the
/// last 6k characters of the output.
pub fn parse_check_output(source: &str, output: &str) -> Vec<ValidationFailure> {
    let mut failures = match source {
        "typecheck" | "build" | "check" => parse_typescript(source, output),
        "tests" | "test" => parse_tests(source, output),
        "boot" => parse_boot(source, output),
        "migration" | "migrate" | "seed" => parse_migration(source, output),
        "install" => parse_install(source, output),
        _ => Vec::new(),
    };

    if failures.is_empty() {
        failures.push(ValidationFailure {
            source: source.to_string(),
            kind: FailureKind::Unknown,
            code: None,
            file: None,
            line: None,
            col: None,
            message: format!("{source} command failed."),
            excerpt: Some(tail(output, EXCERPT_BYTES)),
        });
    }

    let mut seen = BTreeSet::new();
    failures.retain(|f| seen.insert(f.dedup_key()));
    failures.truncate(MAX_FAILURES);
    failures
}

fn tail(text: &str, bytes: usize) -> String {
    if text.len() <= bytes {
        return text.to_string();
    }
    let mut start = text.len() - bytes;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    text[start..].to_string()
}

fn parse_typescript(source: &str, output: &str) -> Vec<ValidationFailure> {
    TS_ERROR_RE
        .captures_iter(output)
        .map(|cap| ValidationFailure {
            source: source.to_string(),
            kind: FailureKind::TypescriptError,
            code: Some(cap[4].to_string()),
            file: Some(cap[1].trim().to_string()),
            line: cap[2].parse().ok(),
            col: cap[3].parse().ok(),
            message: cap[5].trim().to_string(),
            excerpt: None,
        })
        .collect()
}

fn parse_tests(source: &str, output: &str) -> Vec<ValidationFailure> {
    let mut failures: Vec<ValidationFailure> = TEST_FAIL_RE
        .captures_iter(output)
        .map(|cap| ValidationFailure {
            source: source.to_string(),
            kind: FailureKind::TestFailure,
            code: None,
            file: None,
            line: None,
            col: None,
            message: cap[1].trim().to_string(),
            excerpt: None,
        })
        .collect();

    failures.extend(ASSERTION_RE.captures_iter(output).map(|cap| ValidationFailure {
        source: source.to_string(),
        kind: FailureKind::TestFailure,
        code: None,
        file: None,
        line: None,
        col: None,
        message: cap[1].trim().to_string(),
        excerpt: None,
    }));

    // Attach the first file:line:col seen in the output to entries that
    // have no location of their own.
    if let Some(loc) = LOCATION_RE.captures(output) {
        for failure in &mut failures {
            if failure.file.is_none() {
                failure.file = Some(loc[1].to_string());
                failure.line = loc[2].parse().ok();
                failure.col = loc[3].parse().ok();
            }
        }
    }

    failures
}

fn parse_boot(source: &str, output: &str) -> Vec<ValidationFailure> {
    let code = BOOT_CODE_RE
        .captures(output)
        .map(|cap| cap[1].to_string());
    BOOT_ERROR_RE
        .captures_iter(output)
        .map(|cap| ValidationFailure {
            source: source.to_string(),
            kind: FailureKind::BootError,
            code: code.clone(),
            file: None,
            line: None,
            col: None,
            message: cap[1].trim().to_string(),
            excerpt: None,
        })
        .collect()
}

fn parse_migration(source: &str, output: &str) -> Vec<ValidationFailure> {
    let mut failures: Vec<ValidationFailure> = PRISMA_CODE_RE
        .captures_iter(output)
        .map(|cap| ValidationFailure {
            source: source.to_string(),
            kind: FailureKind::MigrationError,
            code: Some(cap[1].to_string()),
            file: None,
            line: None,
            col: None,
            message: format!("prisma error {}", &cap[1]),
            excerpt: None,
        })
        .collect();

    if failures.is_empty() {
        failures.extend(MIGRATE_LINE_RE.captures_iter(output).take(3).map(|cap| {
            ValidationFailure {
                source: source.to_string(),
                kind: FailureKind::MigrationError,
                code: None,
                file: None,
                line: None,
                col: None,
                message: cap[0].trim().to_string(),
                excerpt: None,
            }
        }));
    }

    failures
}

fn parse_install(source: &str, output: &str) -> Vec<ValidationFailure> {
    INSTALL_RE
        .captures_iter(output)
        .map(|cap| ValidationFailure {
            source: source.to_string(),
            kind: FailureKind::InstallError,
            code: Some(cap[1].to_string()),
            file: None,
            line: None,
            col: None,
            message: format!("npm install failed: {}", &cap[1]),
            excerpt: None,
        })
        .collect()
}

/// Correction clusters a failed validation maps into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureCluster {
    Architecture,
    Typecheck,
    Test,
    Runtime,
    ImportResolution,
    Debt,
}

impl std::fmt::Display for FailureCluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Architecture => "architecture",
            Self::Typecheck => "typecheck",
            Self::Test => "test",
            Self::Runtime => "runtime",
            Self::ImportResolution => "import_resolution",
            Self::Debt => "debt",
        };
        write!(f, "{s}")
    }
}

/// Correction intent the planner is asked to address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CorrectionIntent {
    RuntimeBoot,
    RuntimeHealth,
    TypescriptCompile,
    TestFailure,
    MigrationFailure,
    ArchitectureViolation,
    SecurityBaseline,
    Unknown,
}

impl std::fmt::Display for CorrectionIntent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::RuntimeBoot => "runtime_boot",
            Self::RuntimeHealth => "runtime_health",
            Self::TypescriptCompile => "typescript_compile",
            Self::TestFailure => "test_failure",
            Self::MigrationFailure => "migration_failure",
            Self::ArchitectureViolation => "architecture_violation",
            Self::SecurityBaseline => "security_baseline",
            Self::Unknown => "unknown",
        };
        write!(f, "{s}")
    }
}

/// Classification of a failed validation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureClassification {
    pub intent: CorrectionIntent,
    pub rationale: String,
    pub failed_checks: Vec<String>,
    pub failure_kinds: Vec<FailureKind>,
}

/// Bounded scope a correction step must stay inside.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CorrectionConstraint {
    pub intent: CorrectionIntent,
    pub max_files: usize,
    pub max_total_diff_bytes: usize,
    /// Normalized path prefixes the correction may touch; empty = unscoped.
    pub allowed_path_prefixes: Vec<String>,
    pub guidance: Vec<String>,
}

impl CorrectionConstraint {
    /// Whether a normalized path is inside the constraint.
    pub fn allows(&self, path: &str) -> bool {
        self.allowed_path_prefixes.is_empty()
            || self
                .allowed_path_prefixes
                .iter()
                .any(|prefix| path == prefix.trim_end_matches('/') || path.starts_with(prefix.as_str()))
    }
}

/// Input to classification: everything the failed validation produced.
#[derive(Debug, Clone, Default)]
pub struct ClassifierInput<'a> {
    pub failures: &'a [ValidationFailure],
    pub failed_checks: Vec<String>,
    pub violations: &'a [Violation],
    pub cycles: usize,
    pub runtime_log_tail: Option<&'a str>,
}

/// Classify a failed validation into a correction intent.
pub fn classify(input: &ClassifierInput<'_>) -> FailureClassification {
    let kinds: Vec<FailureKind> = {
        let mut set = BTreeSet::new();
        let mut ordered = Vec::new();
        for failure in input.failures {
            if set.insert(format!("{:?}", failure.kind)) {
                ordered.push(failure.kind);
            }
        }
        ordered
    };

    let has_arch = input
        .violations
        .iter()
        .any(|v| {
            v.rule_id.starts_with("ARCH.")
                || v.rule_id.starts_with("IMPORT.")
                || v.rule_id.starts_with("INVARIANT.")
        })
        || input.cycles > 0;
    let has_security = input.violations.iter().any(|v| v.rule_id.starts_with("SEC."));
    let has = |kind: FailureKind| kinds.contains(&kind);

    let (intent, rationale) = if has_arch {
        (
            CorrectionIntent::ArchitectureViolation,
            "architecture contract violations dominate the failure".to_string(),
        )
    } else if has_security {
        (
            CorrectionIntent::SecurityBaseline,
            "security baseline checks failed".to_string(),
        )
    } else if has(FailureKind::TypescriptError) {
        (
            CorrectionIntent::TypescriptCompile,
            "typecheck/build emitted compiler errors".to_string(),
        )
    } else if has(FailureKind::MigrationError) {
        (
            CorrectionIntent::MigrationFailure,
            "database migration or seed failed".to_string(),
        )
    } else if has(FailureKind::TestFailure) {
        (
            CorrectionIntent::TestFailure,
            "test suite reported failures".to_string(),
        )
    } else if has(FailureKind::BootError) || input.runtime_log_tail.is_some() {
        let health = input
            .runtime_log_tail
            .map(|logs| logs.contains("health"))
            .unwrap_or(false);
        if health {
            (
                CorrectionIntent::RuntimeHealth,
                "the service booted but the health probe failed".to_string(),
            )
        } else {
            (
                CorrectionIntent::RuntimeBoot,
                "the service failed to boot".to_string(),
            )
        }
    } else {
        (
            CorrectionIntent::Unknown,
            "no typed failure matched a known cluster".to_string(),
        )
    };

    FailureClassification {
        intent,
        rationale,
        failed_checks: input.failed_checks.clone(),
        failure_kinds: kinds,
    }
}

/// Clusters implied by a classification, sorted and deduplicated.
pub fn clusters(input: &ClassifierInput<'_>, classification: &FailureClassification) -> Vec<FailureCluster> {
    let mut set = BTreeSet::new();
    if input
        .violations
        .iter()
        .any(|v| {
            v.rule_id.starts_with("ARCH.")
                || v.rule_id.starts_with("SEC.")
                || v.rule_id.starts_with("INVARIANT.LAYER")
                || v.rule_id.starts_with("INVARIANT.CROSS_MODULE")
        })
        || input.cycles > 0
    {
        set.insert(FailureCluster::Architecture);
    }
    if input
        .violations
        .iter()
        .any(|v| v.rule_id.contains("IMPORT"))
    {
        set.insert(FailureCluster::ImportResolution);
    }
    for kind in &classification.failure_kinds {
        match kind {
            FailureKind::TypescriptError => {
                set.insert(FailureCluster::Typecheck);
            }
            FailureKind::TestFailure => {
                set.insert(FailureCluster::Test);
            }
            FailureKind::BootError | FailureKind::MigrationError | FailureKind::InstallError => {
                set.insert(FailureCluster::Runtime);
            }
            FailureKind::Unknown => {}
        }
    }
    if matches!(
        classification.intent,
        CorrectionIntent::RuntimeBoot | CorrectionIntent::RuntimeHealth
    ) {
        set.insert(FailureCluster::Runtime);
    }
    set.into_iter().collect()
}

/// Modules implicated by architecture violations, sorted.
pub fn implicated_modules(violations: &[Violation]) -> Vec<String> {
    let mut modules = BTreeSet::new();
    for violation in violations {
        for path in std::iter::once(violation.file.as_str())
            .chain(violation.target.as_deref())
        {
            if let Some(rest) = path.strip_prefix("src/modules/") {
                if let Some(module) = rest.split('/').next() {
                    if !module.is_empty() {
                        modules.insert(module.to_string());
                    }
                }
            }
        }
    }
    modules.into_iter().collect()
}

/// Strip worktree- and temp-scoped prefixes so constraint paths are always
/// project-relative.
pub fn strip_workspace_prefix(path: &str, worktree_root: Option<&str>) -> String {
    let mut cleaned = path.to_string();
    if let Some(root) = worktree_root {
        if let Some(rest) = cleaned.strip_prefix(root) {
            cleaned = rest.trim_start_matches('/').to_string();
        }
    }
    for marker in ["/.deeprun/worktrees/", "/tmp/", "/var/folders/"] {
        if let Some(idx) = cleaned.find(marker) {
            let rest = &cleaned[idx + marker.len()..];
            // Skip the scoping segment (run id / temp dir name).
            if let Some(slash) = rest.find('/') {
                cleaned = rest[slash + 1..].to_string();
            }
        }
    }
    cleaned
}

/// Assemble the correction constraint for a classification.
///
/// Allowed prefixes come from implicated modules, violation files, and the
/// canonical layer subdirectories of each implicated module.
pub fn build_constraint(
    classification: &FailureClassification,
    violations: &[Violation],
    worktree_root: Option<&str>,
    max_files: usize,
    max_total_diff_bytes: usize,
) -> CorrectionConstraint {
    let mut prefixes = BTreeSet::new();

    let modules = implicated_modules(violations);
    for module in &modules {
        prefixes.insert(format!("src/modules/{module}/"));
        for layer_dir in crate::arch::layers::CANONICAL_LAYER_DIRS {
            prefixes.insert(format!("src/modules/{module}/{layer_dir}/"));
        }
    }

    for violation in violations {
        let cleaned = strip_workspace_prefix(&violation.file, worktree_root);
        if cleaned.starts_with("src/") {
            prefixes.insert(cleaned);
        }
    }

    let guidance = match classification.intent {
        CorrectionIntent::ArchitectureViolation => vec![
            "restore the layer matrix: controller → service → repository → db".to_string(),
            "keep modules isolated; no cross-module service imports".to_string(),
        ],
        CorrectionIntent::TypescriptCompile => {
            vec!["fix the listed compiler errors without restructuring modules".to_string()]
        }
        CorrectionIntent::TestFailure => {
            vec!["make the failing tests pass; do not delete tests".to_string()]
        }
        CorrectionIntent::MigrationFailure => {
            vec!["repair the schema/migration mismatch".to_string()]
        }
        CorrectionIntent::RuntimeBoot => {
            vec!["make the service boot cleanly under NODE_ENV=production".to_string()]
        }
        CorrectionIntent::RuntimeHealth => {
            vec!["make GET /health return 200 once the service is up".to_string()]
        }
        CorrectionIntent::SecurityBaseline => {
            vec!["wire the missing security middleware in src/app.ts".to_string()]
        }
        CorrectionIntent::Unknown => Vec::new(),
    };

    CorrectionConstraint {
        intent: classification.intent,
        max_files,
        max_total_diff_bytes,
        allowed_path_prefixes: prefixes.into_iter().collect(),
        guidance,
    }
}
