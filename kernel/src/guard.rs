//! Pre-commit invariant guard
//!
//! Runs over the in-memory staged set plus the project tree before a step
//! commit. A blocking violation fails the step without committing, which
//! keeps layer breaks, cross-module reaches, and dangling imports out of
//! the run branch entirely.

use crate::arch::imports::{self, SpecKind};
use crate::arch::layers::{placement, Layer};
use crate::findings::{sort_and_dedup, Violation};
use crate::plan::ChangeType;
use crate::session::StagedFileChange;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::Path;

/// Guard verdict over one staged set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuardReport {
    pub ok: bool,
    pub blocking_count: usize,
    pub violations: Vec<Violation>,
    /// First violation, as a one-line summary.
    pub summary: String,
}

impl GuardReport {
    fn from_violations(violations: Vec<Violation>) -> Self {
        let violations = sort_and_dedup(violations);
        let blocking_count = violations.iter().filter(|v| v.is_blocking()).count();
        let summary = violations
            .first()
            .map(|v| format!("{}: {} ({})", v.rule_id, v.message, v.file))
            .unwrap_or_else(|| "no invariant violations".to_string());
        Self {
            ok: blocking_count == 0,
            blocking_count,
            violations,
            summary,
        }
    }
}

/// Check staged changes against the import and layer invariants.
pub fn check_staged_changes(project_root: &Path, staged: &[&StagedFileChange]) -> GuardReport {
    let staged_creates: BTreeSet<&str> = staged
        .iter()
        .filter(|c| !matches!(c.change_type, ChangeType::Delete))
        .map(|c| c.path.as_str())
        .collect();
    let staged_deletes: BTreeSet<&str> = staged
        .iter()
        .filter(|c| matches!(c.change_type, ChangeType::Delete))
        .map(|c| c.path.as_str())
        .collect();

    // A path exists if it is staged for create/update, or on disk and not
    // staged for deletion.
    let exists = |path: &str| {
        if staged_creates.contains(path) {
            return true;
        }
        if staged_deletes.contains(path) {
            return false;
        }
        project_root.join(path).is_file()
    };

    let mut violations = Vec::new();

    for change in staged {
        if matches!(change.change_type, ChangeType::Delete) {
            continue;
        }
        let Some(content) = change.new_content.as_deref() else {
            continue;
        };
        let file = change.path.as_str();
        let source = placement(file);

        if file.contains("/tests/") && !content.contains("vitest") {
            violations.push(Violation::error(
                "INVARIANT.TEST_MISSING_VITEST_IMPORT",
                file,
                "test file does not import the test framework",
            ));
        }

        for spec in imports::scan_specifiers(content) {
            match imports::classify(&spec) {
                SpecKind::Malformed => {
                    violations.push(
                        Violation::error(
                            "INVARIANT.IMPORT_MALFORMED_SPECIFIER",
                            file,
                            format!("import specifier '{spec}' does not parse"),
                        )
                        .with_target(spec.clone()),
                    );
                    continue;
                }
                SpecKind::AbsoluteOutsideSrc => {
                    violations.push(
                        Violation::error(
                            "INVARIANT.IMPORT_ABSOLUTE_OUTSIDE_SRC",
                            file,
                            format!("absolute import '{spec}' is not under src/"),
                        )
                        .with_target(spec.clone()),
                    );
                    continue;
                }
                SpecKind::External | SpecKind::Alias => continue,
                SpecKind::Relative | SpecKind::ProjectAbsolute => {}
            }

            if imports::has_malformed_js_suffix(&spec) {
                violations.push(
                    Violation::error(
                        "INVARIANT.IMPORT_MALFORMED_JS_SUFFIX",
                        file,
                        format!("import '{spec}' carries a doubled source suffix"),
                    )
                    .with_target(spec.clone()),
                );
                continue;
            }

            let Some(base) = imports::local_base(file, &spec) else {
                violations.push(
                    Violation::error(
                        "INVARIANT.IMPORT_MALFORMED_SPECIFIER",
                        file,
                        format!("import '{spec}' escapes the project root"),
                    )
                    .with_target(spec.clone()),
                );
                continue;
            };

            match imports::resolve(&base, &exists) {
                Some(resolved) => {
                    violations.extend(layer_violations(file, &source, &resolved));
                }
                None => {
                    violations.push(
                        Violation::error(
                            "INVARIANT.IMPORT_MISSING_TARGET",
                            file,
                            missing_target_message(&spec, &base, &exists),
                        )
                        .with_target(spec.clone()),
                    );
                }
            }
        }
    }

    GuardReport::from_violations(violations)
}

/// Tailored guidance for a dangling import.
fn missing_target_message(spec: &str, base: &str, exists: &dyn Fn(&str) -> bool) -> String {
    // Doubled src/ segment: the fix is usually to drop the inner one.
    let segments: Vec<&str> = base.split('/').collect();
    let src_positions: Vec<usize> = segments
        .iter()
        .enumerate()
        .filter(|(_, s)| **s == "src")
        .map(|(i, _)| i)
        .collect();
    if src_positions.len() >= 2 {
        for &pos in src_positions.iter().skip(1) {
            // Either the inner `src` segment is spurious, or everything
            // before it is a doubled prefix; try both readings.
            let dropped: Vec<&str> = segments
                .iter()
                .enumerate()
                .filter(|(i, _)| *i != pos)
                .map(|(_, s)| *s)
                .collect();
            let rerooted = segments[pos..].to_vec();
            if imports::resolve(&dropped.join("/"), exists).is_some()
                || imports::resolve(&rerooted.join("/"), exists).is_some()
            {
                return format!(
                    "import '{spec}' does not resolve; remove the extra src/ segment from the path"
                );
            }
        }
    }

    if base.starts_with("src/db/") {
        return format!(
            "import '{spec}' does not resolve; do not invent per-domain files under src/db — the shared client lives at src/db/client"
        );
    }

    if let Some(rest) = base.strip_prefix("src/modules/") {
        let parts: Vec<&str> = rest.split('/').collect();
        if parts.len() >= 2 && matches!(parts[1], "dto" | "schema") {
            return format!(
                "import '{spec}' does not resolve; the module has no {}/ directory yet — create the module-local {} file it expects",
                parts[1], parts[1]
            );
        }
    }

    format!("import '{spec}' does not resolve to an existing file under src/")
}

/// Layer and module invariants, reported under their specific rule ids.
fn layer_violations(
    file: &str,
    source: &crate::arch::layers::FilePlacement,
    resolved: &str,
) -> Vec<Violation> {
    let target = placement(resolved);
    let mut violations = Vec::new();

    let cross_module = match (&source.module, &target.module) {
        (Some(a), Some(b)) => a != b,
        _ => false,
    };

    match (source.layer, target.layer) {
        (Layer::Repository, Layer::Service) => violations.push(
            Violation::error(
                "INVARIANT.LAYER_REPOSITORY_TO_SERVICE",
                file,
                "repository imports a service; dependencies flow service → repository",
            )
            .with_target(resolved.to_string()),
        ),
        (Layer::Db, Layer::Service) => violations.push(
            Violation::error(
                "INVARIANT.LAYER_DB_TO_SERVICE",
                file,
                "db layer imports a service",
            )
            .with_target(resolved.to_string()),
        ),
        (Layer::Controller, Layer::Db) => violations.push(
            Violation::error(
                "INVARIANT.LAYER_CONTROLLER_TO_DB",
                file,
                "controller imports the db layer; route data access through the repository",
            )
            .with_target(resolved.to_string()),
        ),
        (Layer::Db, _) if target.module.is_some() => violations.push(
            Violation::error(
                "INVARIANT.LAYER_DB_TO_MODULE",
                file,
                "db layer imports module code",
            )
            .with_target(resolved.to_string()),
        ),
        (Layer::Service, Layer::Service) if cross_module => violations.push(
            Violation::error(
                "INVARIANT.LAYER_SERVICE_TO_SERVICE_CROSS_MODULE",
                file,
                "service imports a service from another module",
            )
            .with_target(resolved.to_string()),
        ),
        _ => {}
    }

    if cross_module
        && target.layer == Layer::Service
        && !matches!(source.layer, Layer::Service)
    {
        violations.push(
            Violation::error(
                "INVARIANT.CROSS_MODULE_DIRECT_SERVICE_IMPORT",
                file,
                "direct import of another module's service",
            )
            .with_target(resolved.to_string()),
        );
    }

    violations
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::ChangeType;

    fn staged(path: &str, content: &str) -> StagedFileChange {
        StagedFileChange {
            path: path.to_string(),
            change_type: ChangeType::Create,
            new_content: Some(content.to_string()),
            previous_content: None,
            previous_content_hash: None,
            next_content_hash: None,
            diff_preview: String::new(),
            diff_bytes: 0,
        }
    }

    fn run_guard(changes: &[StagedFileChange]) -> GuardReport {
        let dir = tempfile::tempdir().unwrap();
        let refs: Vec<&StagedFileChange> = changes.iter().collect();
        check_staged_changes(dir.path(), &refs)
    }

    #[test]
    fn test_clean_staged_set() {
        let changes = vec![
            staged(
                "src/modules/user/service/user-service.ts",
                "import { UserRepository } from \"../repository/user-repository.js\";\n",
            ),
            staged(
                "src/modules/user/repository/user-repository.ts",
                "export class UserRepository {}\n",
            ),
        ];
        let report = run_guard(&changes);
        assert!(report.ok, "{:?}", report.violations);
        assert_eq!(report.blocking_count, 0);
        assert_eq!(report.summary, "no invariant violations");
    }

    #[test]
    fn test_missing_target_blocks() {
        let changes = vec![staged(
            "src/modules/project/service/project-service.ts",
            "import { ProjectDto } from \"../dto/project-dto.js\";\n",
        )];
        let report = run_guard(&changes);
        assert!(!report.ok);
        assert_eq!(report.violations[0].rule_id, "INVARIANT.IMPORT_MISSING_TARGET");
        assert!(report.violations[0].message.contains("dto"));
        assert!(report.summary.starts_with("INVARIANT.IMPORT_MISSING_TARGET"));
    }

    #[test]
    fn test_extra_src_segment_hint() {
        let changes = vec![
            staged(
                "src/modules/user/service/user-service.ts",
                "import { dto } from \"./src/modules/user/dto/user-dto.js\";\n",
            ),
            staged("src/modules/user/dto/user-dto.ts", "export const dto = 1;\n"),
        ];
        let report = run_guard(&changes);
        assert!(!report.ok);
        assert!(report.violations[0]
            .message
            .contains("remove the extra src/ segment"));
    }

    #[test]
    fn test_db_domain_file_hint() {
        let changes = vec![staged(
            "src/modules/user/repository/user-repository.ts",
            "import { userDb } from \"../../../db/user.js\";\n",
        )];
        let report = run_guard(&changes);
        assert!(!report.ok);
        assert!(report.violations[0].message.contains("src/db"));
    }

    #[test]
    fn test_layer_rules() {
        let changes = vec![
            staged(
                "src/modules/user/repository/user-repository.ts",
                "import { UserService } from \"../service/user-service.js\";\n",
            ),
            staged("src/modules/user/service/user-service.ts", "export class UserService {}\n"),
        ];
        let report = run_guard(&changes);
        assert!(report
            .violations
            .iter()
            .any(|v| v.rule_id == "INVARIANT.LAYER_REPOSITORY_TO_SERVICE"));
    }

    #[test]
    fn test_cross_module_service_import() {
        let changes = vec![
            staged(
                "src/modules/order/service/order-service.ts",
                "import { UserService } from \"../../user/service/user-service.js\";\n",
            ),
            staged("src/modules/user/service/user-service.ts", "export class UserService {}\n"),
        ];
        let report = run_guard(&changes);
        assert!(report
            .violations
            .iter()
            .any(|v| v.rule_id == "INVARIANT.LAYER_SERVICE_TO_SERVICE_CROSS_MODULE"));
    }

    #[test]
    fn test_absolute_outside_src() {
        let changes = vec![staged(
            "src/modules/user/service/user-service.ts",
            "import { x } from \"/etc/config.js\";\n",
        )];
        let report = run_guard(&changes);
        assert!(report
            .violations
            .iter()
            .any(|v| v.rule_id == "INVARIANT.IMPORT_ABSOLUTE_OUTSIDE_SRC"));
    }

    #[test]
    fn test_malformed_js_suffix() {
        let changes = vec![
            staged(
                "src/modules/user/service/user-service.ts",
                "import { dto } from \"../dto/user-dto.ts.js\";\n",
            ),
            staged("src/modules/user/dto/user-dto.ts", "export const dto = 1;\n"),
        ];
        let report = run_guard(&changes);
        assert!(report
            .violations
            .iter()
            .any(|v| v.rule_id == "INVARIANT.IMPORT_MALFORMED_JS_SUFFIX"));
    }

    #[test]
    fn test_test_file_requires_framework_import() {
        let changes = vec![staged(
            "src/modules/user/tests/user-service.test.ts",
            "describe(\"user\", () => {});\n",
        )];
        let report = run_guard(&changes);
        assert!(report
            .violations
            .iter()
            .any(|v| v.rule_id == "INVARIANT.TEST_MISSING_VITEST_IMPORT"));

        let ok = vec![staged(
            "src/modules/user/tests/user-service.test.ts",
            "import { describe, it, expect } from \"vitest\";\n",
        )];
        assert!(run_guard(&ok).ok);
    }

    #[test]
    fn test_staged_delete_invalidates_target() {
        let dir = tempfile::tempdir().unwrap();
        let dto_dir = dir.path().join("src/modules/user/dto");
        std::fs::create_dir_all(&dto_dir).unwrap();
        std::fs::write(dto_dir.join("user-dto.ts"), "export const dto = 1;\n").unwrap();

        let importer = staged(
            "src/modules/user/service/user-service.ts",
            "import { dto } from \"../dto/user-dto.js\";\n",
        );
        let mut delete = staged("src/modules/user/dto/user-dto.ts", "");
        delete.change_type = ChangeType::Delete;
        delete.new_content = None;

        let refs: Vec<&StagedFileChange> = vec![&importer, &delete];
        let report = check_staged_changes(dir.path(), &refs);
        assert!(report
            .violations
            .iter()
            .any(|v| v.rule_id == "INVARIANT.IMPORT_MISSING_TARGET"));
    }
}
