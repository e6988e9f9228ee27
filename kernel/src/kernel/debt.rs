//! Provisional-stub tracking and debt paydown
//!
//! Corrections may unblock an import by writing a stub file marked with
//! `// @deeprun-stub {json}` on its first line. That is provisional debt:
//! a later commit pays it down by replacing the stub with real content,
//! removing it, or rewiring every referrer away from it.

use crate::arch;
use crate::canon::sha256_hex;
use crate::plan::ChangeType;
use crate::session::StagedFileChange;
use crate::walker::SortedWalker;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// Marker token on the first line of a stub file.
pub const STUB_MARKER: &str = "@deeprun-stub";

/// The JSON payload carried by a stub marker line.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StubMarker {
    pub created_by_run_id: String,
    pub stub_path: String,
}

/// Format the first line of a stub file.
pub fn format_stub_marker(run_id: &str, stub_path: &str) -> String {
    let marker = StubMarker {
        created_by_run_id: run_id.to_string(),
        stub_path: stub_path.to_string(),
    };
    format!(
        "// {STUB_MARKER} {}",
        serde_json::to_string(&marker).expect("marker serialization is infallible")
    )
}

/// Parse a stub marker from a file's first line.
pub fn parse_stub_marker(content: &str) -> Option<StubMarker> {
    let first_line = content.lines().next()?;
    let idx = first_line.find(STUB_MARKER)?;
    let json = first_line[idx + STUB_MARKER.len()..].trim();
    serde_json::from_str(json).ok()
}

/// Whether content is a stub (marker on the first line).
pub fn is_stub_content(content: &str) -> bool {
    content
        .lines()
        .next()
        .map(|line| line.contains(STUB_MARKER))
        .unwrap_or(false)
}

/// How a stub was paid down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DebtPaydownAction {
    ReplacedStub,
    RemovedStub,
    RewiredImport,
}

impl std::fmt::Display for DebtPaydownAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::ReplacedStub => "replaced_stub",
            Self::RemovedStub => "removed_stub",
            Self::RewiredImport => "rewired_import",
        };
        write!(f, "{s}")
    }
}

/// A debt-relevant observation from one commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DebtEvent {
    StubCreated { path: String },
    PaidDown { path: String, action: DebtPaydownAction },
}

#[derive(Debug, Clone)]
struct StubRecord {
    content_hash: String,
}

/// Tracks outstanding stubs for one run.
#[derive(Debug, Default)]
pub struct DebtLedger {
    stubs: BTreeMap<String, StubRecord>,
}

impl DebtLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild ledger state from a worktree on resume: any file carrying
    /// the marker is outstanding debt.
    pub fn scan_worktree(root: &Path) -> Self {
        let mut ledger = Self::new();
        let walker = SortedWalker::new(root);
        for relative in walker.relative_source_files(&["ts", "tsx", "js", "jsx", "mjs", "cjs"]) {
            if let Ok(content) = std::fs::read_to_string(root.join(&relative)) {
                if is_stub_content(&content) {
                    ledger.stubs.insert(
                        relative,
                        StubRecord {
                            content_hash: sha256_hex(content.as_bytes()),
                        },
                    );
                }
            }
        }
        ledger
    }

    pub fn outstanding(&self) -> Vec<String> {
        self.stubs.keys().cloned().collect()
    }

    /// Observe one committed staged set and emit debt events.
    pub fn observe_commit(&mut self, changes: &[StagedFileChange]) -> Vec<DebtEvent> {
        let mut events = Vec::new();

        for change in changes {
            match change.change_type {
                ChangeType::Create | ChangeType::Update => {
                    let Some(content) = change.new_content.as_deref() else {
                        continue;
                    };
                    let hash = sha256_hex(content.as_bytes());
                    let was_stub = self.stubs.contains_key(&change.path);
                    let now_stub = is_stub_content(content);
                    match (was_stub, now_stub) {
                        (false, true) => {
                            self.stubs
                                .insert(change.path.clone(), StubRecord { content_hash: hash });
                            events.push(DebtEvent::StubCreated {
                                path: change.path.clone(),
                            });
                        }
                        (true, false) => {
                            let previous = self.stubs.remove(&change.path);
                            if previous.map(|p| p.content_hash != hash).unwrap_or(true) {
                                events.push(DebtEvent::PaidDown {
                                    path: change.path.clone(),
                                    action: DebtPaydownAction::ReplacedStub,
                                });
                            }
                        }
                        (true, true) => {
                            // Stub rewritten as a stub: still outstanding.
                            self.stubs
                                .insert(change.path.clone(), StubRecord { content_hash: hash });
                        }
                        (false, false) => {}
                    }
                }
                ChangeType::Delete => {
                    if self.stubs.remove(&change.path).is_some() {
                        events.push(DebtEvent::PaidDown {
                            path: change.path.clone(),
                            action: DebtPaydownAction::RemovedStub,
                        });
                    }
                }
            }
        }

        events
    }

    /// After a correction, a stub with no remaining referrers has been
    /// rewired away even though the file itself still exists. Stubs in
    /// `exclude` (typically the ones created by the commit being observed)
    /// are not considered: their referrer may land in a later commit.
    pub fn check_rewired(&mut self, root: &Path, exclude: &[String]) -> Vec<DebtEvent> {
        if self.stubs.is_empty() {
            return Vec::new();
        }

        let walker = SortedWalker::new(root);
        let mut files = BTreeMap::new();
        for relative in walker.relative_source_files(&["ts", "tsx", "js", "jsx", "mjs", "cjs"]) {
            if let Ok(content) = std::fs::read_to_string(root.join(&relative)) {
                files.insert(relative, content);
            }
        }
        let graph = arch::build_import_graph(&files);

        let mut events = Vec::new();
        let outstanding: Vec<String> = self
            .stubs
            .keys()
            .filter(|path| !exclude.contains(path))
            .cloned()
            .collect();
        for path in outstanding {
            if graph.referrers(&path).is_empty() {
                self.stubs.remove(&path);
                events.push(DebtEvent::PaidDown {
                    path,
                    action: DebtPaydownAction::RewiredImport,
                });
            }
        }
        events
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn staged(path: &str, change_type: ChangeType, content: Option<&str>) -> StagedFileChange {
        StagedFileChange {
            path: path.to_string(),
            change_type,
            new_content: content.map(String::from),
            previous_content: None,
            previous_content_hash: None,
            next_content_hash: None,
            diff_preview: String::new(),
            diff_bytes: 0,
        }
    }

    #[test]
    fn test_marker_roundtrip() {
        let line = format_stub_marker("run-9", "src/modules/a/dto/a-dto.ts");
        let content = format!("{line}\nexport type ADto = unknown;\n");
        assert!(is_stub_content(&content));
        let marker = parse_stub_marker(&content).unwrap();
        assert_eq!(marker.created_by_run_id, "run-9");
        assert_eq!(marker.stub_path, "src/modules/a/dto/a-dto.ts");
    }

    #[test]
    fn test_create_then_replace() {
        let mut ledger = DebtLedger::new();
        let stub = format!("{}\nexport {{}};\n", format_stub_marker("r", "src/a.ts"));

        let events = ledger.observe_commit(&[staged("src/a.ts", ChangeType::Create, Some(&stub))]);
        assert_eq!(
            events,
            vec![DebtEvent::StubCreated {
                path: "src/a.ts".into()
            }]
        );
        assert_eq!(ledger.outstanding(), vec!["src/a.ts"]);

        let events = ledger.observe_commit(&[staged(
            "src/a.ts",
            ChangeType::Update,
            Some("export const real = 1;\n"),
        )]);
        assert_eq!(
            events,
            vec![DebtEvent::PaidDown {
                path: "src/a.ts".into(),
                action: DebtPaydownAction::ReplacedStub
            }]
        );
        assert!(ledger.outstanding().is_empty());
    }

    #[test]
    fn test_remove_pays_down() {
        let mut ledger = DebtLedger::new();
        let stub = format!("{}\n", format_stub_marker("r", "src/a.ts"));
        ledger.observe_commit(&[staged("src/a.ts", ChangeType::Create, Some(&stub))]);

        let events = ledger.observe_commit(&[staged("src/a.ts", ChangeType::Delete, None)]);
        assert_eq!(
            events,
            vec![DebtEvent::PaidDown {
                path: "src/a.ts".into(),
                action: DebtPaydownAction::RemovedStub
            }]
        );
    }

    #[test]
    fn test_stub_rewritten_as_stub_stays_outstanding() {
        let mut ledger = DebtLedger::new();
        let stub = format!("{}\nv1\n", format_stub_marker("r", "src/a.ts"));
        ledger.observe_commit(&[staged("src/a.ts", ChangeType::Create, Some(&stub))]);

        let stub2 = format!("{}\nv2\n", format_stub_marker("r", "src/a.ts"));
        let events = ledger.observe_commit(&[staged("src/a.ts", ChangeType::Update, Some(&stub2))]);
        assert!(events.is_empty());
        assert_eq!(ledger.outstanding(), vec!["src/a.ts"]);
    }

    #[test]
    fn test_rewired_import_paydown() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        let dto_dir = root.join("src/modules/a/dto");
        let svc_dir = root.join("src/modules/a/service");
        std::fs::create_dir_all(&dto_dir).unwrap();
        std::fs::create_dir_all(&svc_dir).unwrap();

        let stub_path = "src/modules/a/dto/a-dto.ts";
        let stub = format!("{}\nexport {{}};\n", format_stub_marker("r", stub_path));
        std::fs::write(root.join(stub_path), &stub).unwrap();
        std::fs::write(
            svc_dir.join("a-service.ts"),
            "import { ADto } from \"../dto/a-dto.js\";\n",
        )
        .unwrap();

        let mut ledger = DebtLedger::scan_worktree(root);
        assert_eq!(ledger.outstanding(), vec![stub_path]);

        // Still referenced: no paydown.
        assert!(ledger.check_rewired(root, &[]).is_empty());

        // Excluded stubs are never considered.
        assert!(ledger.check_rewired(root, &[stub_path.to_string()]).is_empty());

        // Rewire the service off the stub.
        std::fs::write(svc_dir.join("a-service.ts"), "export const a = 1;\n").unwrap();
        let events = ledger.check_rewired(root, &[]);
        assert_eq!(
            events,
            vec![DebtEvent::PaidDown {
                path: stub_path.into(),
                action: DebtPaydownAction::RewiredImport
            }]
        );
        assert!(ledger.outstanding().is_empty());
    }
}
