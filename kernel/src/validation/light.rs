//! Light validation: architecture + AST + security + structural checks
//!
//! No subprocess execution; everything here is a static pass over the tree.

use crate::arch::{self, ArchContract};
use crate::checks;
use crate::validation::{CheckResult, ValidationReport};
use serde_json::json;
use std::path::Path;

/// Run the full light pass over a project tree.
pub fn run_light_validation(root: &Path, contract: &ArchContract) -> ValidationReport {
    let mut report = ValidationReport::new();

    let arch_report = arch::validate_project(root, contract);
    let arch_blocking = arch_report.blocking_count();
    report.add_check(
        if arch_blocking == 0 {
            CheckResult::pass(
                "architecture",
                format!(
                    "{} files, {} edges, no violations",
                    arch_report.nodes.len(),
                    arch_report.edges.len()
                ),
            )
        } else {
            CheckResult::fail(
                "architecture",
                format!(
                    "{} blocking finding(s): {} violation(s), {} cycle(s)",
                    arch_blocking,
                    arch_report.violations.len(),
                    arch_report.cycles.len()
                ),
            )
        }
        .with_details(json!({
            "nodes": arch_report.nodes.len(),
            "edges": arch_report.edges.len(),
            "cycles": arch_report.cycles.len(),
        })),
    );
    report.cycles = arch_report.cycles;
    report.add_violations(arch_report.violations);

    let static_violations = checks::check_project(root);
    report.add_check(if static_violations.iter().any(|v| v.is_blocking()) {
        CheckResult::fail(
            "static_checks",
            format!("{} static finding(s)", static_violations.len()),
        )
    } else {
        CheckResult::pass("static_checks", "ast/security/structure clean")
    });
    report.add_violations(static_violations);

    report.finalize();
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn write(root: &Path, path: &str, content: &str) {
        let full = root.join(path);
        fs::create_dir_all(full.parent().unwrap()).unwrap();
        fs::write(full, content).unwrap();
    }

    fn scaffold(root: &Path) {
        write(root, "package.json", "{\"name\": \"svc\"}");
        write(root, "tsconfig.json", "{}");
        write(
            root,
            "src/app.ts",
            "app.use(helmet());\napp.use(cors());\napp.use(rateLimit({}));\n",
        );
        write(root, "src/server.ts", "app.listen(env.PORT);\n");
        write(
            root,
            "src/config/env.ts",
            "export const env = z.object({ NODE_ENV: z.enum([\"development\", \"production\"]) }).parse(process.env);\n",
        );
        write(
            root,
            "src/errors/errorHandler.ts",
            "if (process.env.NODE_ENV !== \"production\") { body.stack = err.stack; }\n",
        );
    }

    #[test]
    fn test_clean_scaffold_passes() {
        let dir = tempfile::tempdir().unwrap();
        scaffold(dir.path());
        let report = run_light_validation(dir.path(), &ArchContract::default());
        assert!(report.ok(), "{}", report.summary());
    }

    #[test]
    fn test_arch_violation_blocks() {
        let dir = tempfile::tempdir().unwrap();
        scaffold(dir.path());
        write(
            dir.path(),
            "src/modules/user/service/user-service.ts",
            "import { dto } from \"../dto/user-dto.js\";\n",
        );
        let report = run_light_validation(dir.path(), &ArchContract::default());
        assert!(!report.ok());
        assert!(report.failed_check_ids().contains(&"architecture".to_string()));
        assert!(report
            .violations
            .iter()
            .any(|v| v.rule_id == "IMPORT.MISSING_TARGET"));
    }

    #[test]
    fn test_missing_required_file_blocks() {
        let dir = tempfile::tempdir().unwrap();
        scaffold(dir.path());
        fs::remove_file(dir.path().join("src/server.ts")).unwrap();
        let report = run_light_validation(dir.path(), &ArchContract::default());
        assert!(!report.ok());
        assert!(report
            .violations
            .iter()
            .any(|v| v.rule_id == "STRUCT.REQUIRED_FILE_MISSING"));
    }
}
