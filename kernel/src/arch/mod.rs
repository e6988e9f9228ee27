//! Architecture validator
//!
//! Builds the import graph over production sources and enforces the layer
//! matrix, module isolation, relative-import discipline, and acyclicity.
//! Output is fully deterministic: nodes, edges, cycles, and violations are
//! all sorted.

pub mod graph;
pub mod imports;
pub mod layers;

use crate::findings::{sort_and_dedup, Violation};
use crate::walker::SortedWalker;
use self::graph::ImportGraph;
use self::imports::SpecKind;
use self::layers::{placement, Layer};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// Contract options for architecture validation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchContract {
    /// Emit `IMPORT.NON_RELATIVE` for project-absolute and alias imports.
    pub forbid_non_relative: bool,
    /// Include `tests` layers in the graph.
    pub include_tests: bool,
}

impl Default for ArchContract {
    fn default() -> Self {
        Self {
            forbid_non_relative: true,
            include_tests: false,
        }
    }
}

/// Deterministic architecture report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchReport {
    pub nodes: Vec<String>,
    pub edges: Vec<(String, String)>,
    pub cycles: Vec<Vec<String>>,
    pub violations: Vec<Violation>,
}

impl ArchReport {
    pub fn blocking_count(&self) -> usize {
        self.violations.iter().filter(|v| v.is_blocking()).count() + self.cycles.len()
    }
}

/// Validate a project tree on disk.
pub fn validate_project(root: &Path, contract: &ArchContract) -> ArchReport {
    let walker = SortedWalker::new(root);
    let mut files = BTreeMap::new();
    for relative in walker.relative_source_files(imports::RESOLUTION_EXTENSIONS) {
        if let Ok(content) = std::fs::read_to_string(root.join(&relative)) {
            files.insert(relative, content);
        }
    }
    let tsconfig = std::fs::read_to_string(root.join("tsconfig.json")).ok();
    validate_sources(&files, tsconfig.as_deref(), contract)
}

/// Validate an in-memory source tree (path → content).
pub fn validate_sources(
    files: &BTreeMap<String, String>,
    tsconfig: Option<&str>,
    contract: &ArchContract,
) -> ArchReport {
    let mut violations = Vec::new();

    // Production file set: everything under src/, tests by contract.
    let production: BTreeMap<&String, &String> = files
        .iter()
        .filter(|(path, _)| path.starts_with("src/"))
        .filter(|(path, _)| contract.include_tests || placement(path).layer != Layer::Tests)
        .collect();

    let exists = |p: &str| files.contains_key(p);

    let nodes: Vec<String> = production.keys().map(|p| (*p).to_string()).collect();
    let mut edges: Vec<(String, String)> = Vec::new();

    for (path, content) in &production {
        for spec in imports::scan_specifiers(content) {
            match imports::classify(&spec) {
                SpecKind::External | SpecKind::Malformed => continue,
                SpecKind::Alias => {
                    if contract.forbid_non_relative {
                        violations.push(
                            Violation::error(
                                "IMPORT.NON_RELATIVE",
                                path.as_str(),
                                format!("alias import '{spec}' is forbidden; use a relative path"),
                            )
                            .with_target(spec.clone()),
                        );
                    }
                    continue;
                }
                SpecKind::AbsoluteOutsideSrc => {
                    if contract.forbid_non_relative {
                        violations.push(
                            Violation::error(
                                "IMPORT.NON_RELATIVE",
                                path.as_str(),
                                format!("absolute import '{spec}' points outside src/"),
                            )
                            .with_target(spec.clone()),
                        );
                    }
                    continue;
                }
                SpecKind::ProjectAbsolute => {
                    if contract.forbid_non_relative {
                        violations.push(
                            Violation::error(
                                "IMPORT.NON_RELATIVE",
                                path.as_str(),
                                format!(
                                    "project-absolute import '{spec}' is forbidden; use a relative path"
                                ),
                            )
                            .with_target(spec.clone()),
                        );
                    }
                }
                SpecKind::Relative => {}
            }

            let Some(base) = imports::local_base(path, &spec) else {
                continue;
            };
            match imports::resolve(&base, &exists) {
                Some(resolved) => {
                    if production.contains_key(&resolved) {
                        edges.push(((*path).clone(), resolved));
                    }
                }
                None => {
                    violations.push(
                        Violation::error(
                            "IMPORT.MISSING_TARGET",
                            path.as_str(),
                            format!("import '{spec}' does not resolve to an existing file"),
                        )
                        .with_target(spec.clone()),
                    );
                }
            }
        }
    }

    edges.sort();
    edges.dedup();

    // Layer matrix and module isolation over resolved edges.
    for (from, to) in &edges {
        if from == to {
            continue;
        }
        let source = placement(from);
        let target = placement(to);

        let cross_module = match (&source.module, &target.module) {
            (Some(a), Some(b)) => a != b,
            _ => false,
        };

        if cross_module {
            violations.push(
                Violation::error(
                    "ARCH.MODULE_ISOLATION",
                    from.as_str(),
                    format!(
                        "module '{}' imports module '{}' directly; modules are isolated",
                        source.module.as_deref().unwrap_or("?"),
                        target.module.as_deref().unwrap_or("?")
                    ),
                )
                .with_target(to.clone()),
            );
        } else if !layers::edge_allowed(source.layer, target.layer) {
            violations.push(
                Violation::error(
                    "ARCH.LAYER_MATRIX",
                    from.as_str(),
                    format!("layer {} may not import layer {}", source.layer, target.layer),
                )
                .with_target(to.clone()),
            );
        }
    }

    // tsconfig path aliases undermine the relative-import discipline.
    if let Some(raw) = tsconfig {
        if let Ok(parsed) = serde_json::from_str::<serde_json::Value>(raw) {
            let compiler = parsed.get("compilerOptions");
            let has_alias = compiler
                .map(|c| c.get("baseUrl").is_some() || c.get("paths").is_some())
                .unwrap_or(false);
            if has_alias && contract.forbid_non_relative {
                violations.push(Violation::error(
                    "IMPORT.PATH_ALIAS_CONFIG",
                    "tsconfig.json",
                    "tsconfig declares baseUrl/paths; path aliases are forbidden",
                ));
            }
        }
    }

    let graph = ImportGraph::build(&nodes, &edges);
    let cycles = graph.cycles();

    ArchReport {
        nodes,
        edges,
        cycles,
        violations: sort_and_dedup(violations),
    }
}

/// Build the import graph alone (used by debt paydown rewiring checks).
pub fn build_import_graph(files: &BTreeMap<String, String>) -> ImportGraph {
    let report = validate_sources(
        files,
        None,
        &ArchContract {
            forbid_non_relative: false,
            include_tests: true,
        },
    );
    ImportGraph::build(&report.nodes, &report.edges)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tree(entries: &[(&str, &str)]) -> BTreeMap<String, String> {
        entries
            .iter()
            .map(|(p, c)| (p.to_string(), c.to_string()))
            .collect()
    }

    #[test]
    fn test_clean_module_passes() {
        let files = tree(&[
            (
                "src/modules/user/controller/user-controller.ts",
                "import { UserService } from \"../service/user-service.js\";\n",
            ),
            (
                "src/modules/user/service/user-service.ts",
                "import { UserRepository } from \"../repository/user-repository.js\";\n",
            ),
            (
                "src/modules/user/repository/user-repository.ts",
                "import { db } from \"../../../db/client.js\";\n",
            ),
            ("src/db/client.ts", "export const db = {};\n"),
        ]);
        let report = validate_sources(&files, None, &ArchContract::default());
        assert!(report.violations.is_empty(), "{:?}", report.violations);
        assert!(report.cycles.is_empty());
        assert_eq!(report.edges.len(), 3);
    }

    #[test]
    fn test_missing_target() {
        let files = tree(&[(
            "src/modules/user/service/user-service.ts",
            "import { dto } from \"../dto/user-dto.js\";\n",
        )]);
        let report = validate_sources(&files, None, &ArchContract::default());
        assert_eq!(report.violations.len(), 1);
        assert_eq!(report.violations[0].rule_id, "IMPORT.MISSING_TARGET");
        assert_eq!(report.violations[0].target.as_deref(), Some("../dto/user-dto.js"));
    }

    #[test]
    fn test_module_isolation() {
        let files = tree(&[
            (
                "src/modules/order/service/order-service.ts",
                "import { UserService } from \"../../user/service/user-service.js\";\n",
            ),
            (
                "src/modules/user/service/user-service.ts",
                "export class UserService {}\n",
            ),
        ]);
        let report = validate_sources(&files, None, &ArchContract::default());
        assert!(report
            .violations
            .iter()
            .any(|v| v.rule_id == "ARCH.MODULE_ISOLATION"));
    }

    #[test]
    fn test_layer_matrix_violation() {
        let files = tree(&[
            (
                "src/modules/user/repository/user-repository.ts",
                "import { UserService } from \"../service/user-service.js\";\n",
            ),
            (
                "src/modules/user/service/user-service.ts",
                "export class UserService {}\n",
            ),
        ]);
        let report = validate_sources(&files, None, &ArchContract::default());
        assert!(report
            .violations
            .iter()
            .any(|v| v.rule_id == "ARCH.LAYER_MATRIX"));
    }

    #[test]
    fn test_cycle_detection_and_canonical_form() {
        let files = tree(&[
            (
                "src/modules/user/service/a.ts",
                "import { b } from \"./b.js\";\nexport const a = 1;\n",
            ),
            (
                "src/modules/user/service/b.ts",
                "import { a } from \"./a.js\";\nexport const b = 1;\n",
            ),
        ]);
        let report = validate_sources(&files, None, &ArchContract::default());
        assert_eq!(report.cycles.len(), 1);
        assert_eq!(
            report.cycles[0],
            vec![
                "src/modules/user/service/a.ts".to_string(),
                "src/modules/user/service/b.ts".to_string(),
                "src/modules/user/service/a.ts".to_string(),
            ]
        );
        assert!(report.blocking_count() >= 1);
    }

    #[test]
    fn test_non_relative_and_alias_rules() {
        let files = tree(&[
            (
                "src/modules/user/service/user-service.ts",
                "import { db } from \"src/db/client\";\nimport { x } from \"@/modules/user/dto/x\";\n",
            ),
            ("src/db/client.ts", "export const db = {};\n"),
        ]);
        let report = validate_sources(&files, None, &ArchContract::default());
        let non_relative: Vec<_> = report
            .violations
            .iter()
            .filter(|v| v.rule_id == "IMPORT.NON_RELATIVE")
            .collect();
        assert_eq!(non_relative.len(), 2);
    }

    #[test]
    fn test_path_alias_config_detected() {
        let files = tree(&[("src/app.ts", "export {}\n")]);
        let tsconfig = r#"{"compilerOptions": {"baseUrl": ".", "paths": {"@/*": ["src/*"]}}}"#;
        let report = validate_sources(&files, Some(tsconfig), &ArchContract::default());
        assert!(report
            .violations
            .iter()
            .any(|v| v.rule_id == "IMPORT.PATH_ALIAS_CONFIG"));
    }

    #[test]
    fn test_tests_excluded_by_default() {
        let files = tree(&[
            (
                "src/modules/user/tests/user.test.ts",
                "import { broken } from \"../service/missing.js\";\n",
            ),
            ("src/modules/user/service/user-service.ts", "export {}\n"),
        ]);
        let report = validate_sources(&files, None, &ArchContract::default());
        assert!(report.violations.is_empty());
        assert!(!report
            .nodes
            .contains(&"src/modules/user/tests/user.test.ts".to_string()));
    }

    #[test]
    fn test_external_imports_ignored() {
        let files = tree(&[(
            "src/app.ts",
            "import express from \"express\";\nimport { z } from \"zod\";\n",
        )]);
        let report = validate_sources(&files, None, &ArchContract::default());
        assert!(report.violations.is_empty());
        assert!(report.edges.is_empty());
    }
}
