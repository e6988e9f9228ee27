//! AST, security, and structural checks
//!
//! Regex-level scans over production sources for patterns that break the
//! error-handling and security baselines, plus a required-file inventory.
//! These run as part of light validation alongside the architecture pass.

use crate::arch::layers::{placement, Layer};
use crate::findings::{sort_and_dedup, Violation};
use crate::walker::SortedWalker;
use regex::Regex;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::LazyLock;

/// Files every generated service must carry.
pub const REQUIRED_FILES: &[&str] = &[
    "package.json",
    "tsconfig.json",
    "src/app.ts",
    "src/server.ts",
    "src/config/env.ts",
    "src/errors/errorHandler.ts",
];

static RAW_THROW_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"throw\s+new\s+Error\s*\("#).unwrap());

static PRISMA_IMPORT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?m)^\s*import\s+[^'"\n]*?\bfrom\s+['"](@prisma/client|[^'"]*/db/[^'"]*)['"]"#)
        .unwrap()
});

static HELMET_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"helmet\s*\(").unwrap());
static CORS_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\bcors\s*\(").unwrap());
static RATE_LIMIT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"rateLimit\s*\(|rate-limit").unwrap());
static ENV_VALIDATION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"z\.object\s*\(|\.parse\s*\(\s*process\.env").unwrap());

/// Run every check over an in-memory source tree.
pub fn check_sources(files: &BTreeMap<String, String>) -> Vec<Violation> {
    let mut violations = Vec::new();
    violations.extend(raw_throw_violations(files));
    violations.extend(prisma_in_controller_violations(files));
    violations.extend(security_baseline_violations(files));
    violations.extend(required_file_violations(files));
    sort_and_dedup(violations)
}

/// Run every check over a project on disk.
pub fn check_project(root: &Path) -> Vec<Violation> {
    let walker = SortedWalker::new(root);
    let mut files = BTreeMap::new();
    for relative in walker.relative_source_files(&["ts", "tsx", "js", "json"]) {
        if let Ok(content) = std::fs::read_to_string(root.join(&relative)) {
            files.insert(relative, content);
        }
    }
    // Required-file presence is about the tree, not readable content.
    for required in REQUIRED_FILES {
        if root.join(required).exists() {
            files.entry(required.to_string()).or_default();
        }
    }
    check_sources(&files)
}

/// Raw `throw new Error(…)` in controllers and services: typed domain
/// errors are required so the error handler can map status codes.
fn raw_throw_violations(files: &BTreeMap<String, String>) -> Vec<Violation> {
    let mut violations = Vec::new();
    for (path, content) in files {
        let layer = placement(path).layer;
        if !matches!(layer, Layer::Controller | Layer::Service) {
            continue;
        }
        if RAW_THROW_RE.is_match(content) {
            violations.push(Violation::error(
                "AST.RAW_THROW",
                path.as_str(),
                "raw `throw new Error(...)`; throw a typed domain error instead",
            ));
        }
    }
    violations
}

/// Controllers must not touch the database client directly.
fn prisma_in_controller_violations(files: &BTreeMap<String, String>) -> Vec<Violation> {
    let mut violations = Vec::new();
    for (path, content) in files {
        if placement(path).layer != Layer::Controller {
            continue;
        }
        if let Some(capture) = PRISMA_IMPORT_RE.captures(content) {
            violations.push(
                Violation::error(
                    "SEC.PRISMA_IN_CONTROLLER",
                    path.as_str(),
                    "controller imports the database client; route data access through the repository",
                )
                .with_target(capture[1].to_string()),
            );
        }
    }
    violations
}

/// App entry must wire helmet, CORS, and rate limiting; the env module must
/// validate `process.env`.
fn security_baseline_violations(files: &BTreeMap<String, String>) -> Vec<Violation> {
    let mut violations = Vec::new();

    let app = files.get("src/app.ts").map(String::as_str).unwrap_or("");
    if !app.is_empty() {
        if !HELMET_RE.is_match(app) {
            violations.push(Violation::error(
                "SEC.HELMET_MISSING",
                "src/app.ts",
                "helmet() is not applied to the app",
            ));
        }
        if !CORS_RE.is_match(app) {
            violations.push(Violation::error(
                "SEC.CORS_MISSING",
                "src/app.ts",
                "cors() is not applied to the app",
            ));
        }
        if !RATE_LIMIT_RE.is_match(app) {
            violations.push(Violation::error(
                "SEC.RATE_LIMIT_MISSING",
                "src/app.ts",
                "no rate limiter is applied to the app",
            ));
        }
    }

    if let Some(env) = files.get("src/config/env.ts") {
        if !ENV_VALIDATION_RE.is_match(env) {
            violations.push(Violation::error(
                "SEC.ENV_VALIDATION_MISSING",
                "src/config/env.ts",
                "environment variables are read without schema validation",
            ));
        }
    }

    violations
}

fn required_file_violations(files: &BTreeMap<String, String>) -> Vec<Violation> {
    REQUIRED_FILES
        .iter()
        .filter(|required| !files.contains_key(**required))
        .map(|required| {
            Violation::error(
                "STRUCT.REQUIRED_FILE_MISSING",
                *required,
                format!("required file {required} is missing"),
            )
        })
        .collect()
}

/// Production-config checks used by the heavy validator: the env module
/// must accept `NODE_ENV=production` and the error handler must guard
/// stack exposure behind a non-production branch.
pub fn production_config_violations(files: &BTreeMap<String, String>) -> Vec<Violation> {
    let mut violations = Vec::new();

    match files.get("src/config/env.ts") {
        Some(env) if env.contains("production") => {}
        Some(_) => violations.push(Violation::error(
            "PROD.ENV_PRODUCTION_MISSING",
            "src/config/env.ts",
            "env schema does not validate NODE_ENV=production",
        )),
        None => violations.push(Violation::error(
            "PROD.ENV_PRODUCTION_MISSING",
            "src/config/env.ts",
            "src/config/env.ts is missing",
        )),
    }

    match files.get("src/errors/errorHandler.ts") {
        Some(handler)
            if handler.contains("NODE_ENV") && handler.contains("production") && handler.contains("stack") => {}
        Some(_) => violations.push(Violation::error(
            "PROD.STACK_EXPOSURE_UNGUARDED",
            "src/errors/errorHandler.ts",
            "stack traces are not guarded behind a NODE_ENV !== \"production\" branch",
        )),
        None => violations.push(Violation::error(
            "PROD.STACK_EXPOSURE_UNGUARDED",
            "src/errors/errorHandler.ts",
            "src/errors/errorHandler.ts is missing",
        )),
    }

    violations
}

#[cfg(test)]
mod tests {
    use super::*;

    fn baseline() -> BTreeMap<String, String> {
        let mut files = BTreeMap::new();
        files.insert("package.json".to_string(), "{}".to_string());
        files.insert("tsconfig.json".to_string(), "{}".to_string());
        files.insert(
            "src/app.ts".to_string(),
            "app.use(helmet());\napp.use(cors());\napp.use(rateLimit({}));\n".to_string(),
        );
        files.insert("src/server.ts".to_string(), "app.listen();\n".to_string());
        files.insert(
            "src/config/env.ts".to_string(),
            "export const env = z.object({ NODE_ENV: z.enum([\"development\", \"production\"]) }).parse(process.env);\n"
                .to_string(),
        );
        files.insert(
            "src/errors/errorHandler.ts".to_string(),
            "if (process.env.NODE_ENV !== \"production\") { body.stack = err.stack; }\n"
                .to_string(),
        );
        files
    }

    #[test]
    fn test_baseline_is_clean() {
        let violations = check_sources(&baseline());
        assert!(violations.is_empty(), "{violations:?}");
    }

    #[test]
    fn test_raw_throw_in_service() {
        let mut files = baseline();
        files.insert(
            "src/modules/user/service/user-service.ts".to_string(),
            "throw new Error(\"nope\");\n".to_string(),
        );
        let violations = check_sources(&files);
        assert!(violations.iter().any(|v| v.rule_id == "AST.RAW_THROW"));
    }

    #[test]
    fn test_raw_throw_outside_layers_allowed() {
        let mut files = baseline();
        files.insert(
            "src/modules/user/repository/user-repository.ts".to_string(),
            "throw new Error(\"db down\");\n".to_string(),
        );
        let violations = check_sources(&files);
        assert!(!violations.iter().any(|v| v.rule_id == "AST.RAW_THROW"));
    }

    #[test]
    fn test_prisma_in_controller() {
        let mut files = baseline();
        files.insert(
            "src/modules/user/controller/user-controller.ts".to_string(),
            "import { prisma } from \"../../../db/client.js\";\n".to_string(),
        );
        let violations = check_sources(&files);
        assert!(violations
            .iter()
            .any(|v| v.rule_id == "SEC.PRISMA_IN_CONTROLLER"));
    }

    #[test]
    fn test_security_baseline_missing_pieces() {
        let mut files = baseline();
        files.insert("src/app.ts".to_string(), "app.use(express.json());\n".to_string());
        let violations = check_sources(&files);
        for rule in ["SEC.HELMET_MISSING", "SEC.CORS_MISSING", "SEC.RATE_LIMIT_MISSING"] {
            assert!(violations.iter().any(|v| v.rule_id == rule), "missing {rule}");
        }
    }

    #[test]
    fn test_required_files() {
        let mut files = baseline();
        files.remove("src/server.ts");
        let violations = check_sources(&files);
        assert!(violations
            .iter()
            .any(|v| v.rule_id == "STRUCT.REQUIRED_FILE_MISSING" && v.file == "src/server.ts"));
    }

    #[test]
    fn test_production_config_checks() {
        let files = baseline();
        assert!(production_config_violations(&files).is_empty());

        let mut bad = files.clone();
        bad.insert(
            "src/errors/errorHandler.ts".to_string(),
            "body.stack = err.stack;\n".to_string(),
        );
        let violations = production_config_violations(&bad);
        assert!(violations
            .iter()
            .any(|v| v.rule_id == "PROD.STACK_EXPOSURE_UNGUARDED"));
    }
}
