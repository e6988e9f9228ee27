//! Deterministic file discovery
//!
//! All filesystem walks in decision paths go through this module so that
//! every traversal returns entries in a stable, lexicographic order
//! regardless of platform or directory-entry ordering.

use ignore::WalkBuilder;
use std::path::{Path, PathBuf};

/// Directory names excluded from production-source walks.
const EXCLUDED_DIRS: &[&str] = &["node_modules", "dist", "build", "coverage", ".deeprun"];

/// Gitignore-respecting walker returning sorted results.
pub struct SortedWalker {
    root: PathBuf,
}

impl SortedWalker {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    /// All files under the root, sorted by path.
    pub fn all_files(&self) -> Vec<PathBuf> {
        self.walk(|_| true)
    }

    /// Production source files: the given extensions, with hidden dirs,
    /// gitignored entries, and build artifacts excluded.
    pub fn source_files(&self, extensions: &[&str]) -> Vec<PathBuf> {
        self.walk(|path| {
            path.extension()
                .and_then(|e| e.to_str())
                .map(|ext| extensions.contains(&ext))
                .unwrap_or(false)
        })
    }

    /// Files under the root relative to it, sorted, POSIX-separated.
    pub fn relative_source_files(&self, extensions: &[&str]) -> Vec<String> {
        self.source_files(extensions)
            .iter()
            .filter_map(|p| p.strip_prefix(&self.root).ok())
            .map(|p| p.to_string_lossy().replace('\\', "/"))
            .collect()
    }

    fn walk(&self, keep: impl Fn(&Path) -> bool) -> Vec<PathBuf> {
        let mut files = Vec::new();
        let walker = WalkBuilder::new(&self.root)
            .hidden(true)
            .git_ignore(true)
            .filter_entry(|entry| {
                let name = entry.file_name().to_string_lossy();
                !(entry.file_type().map(|t| t.is_dir()).unwrap_or(false)
                    && EXCLUDED_DIRS.contains(&name.as_ref()))
            })
            .build();

        for entry in walker.flatten() {
            let path = entry.path();
            if path.is_file() && keep(path) {
                files.push(path.to_path_buf());
            }
        }

        files.sort();
        files
    }
}

/// Sorted immediate entries of a directory (names only). Missing or
/// unreadable directories yield an empty listing.
pub fn sorted_dir_entries(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = std::fs::read_dir(dir)
        .map(|entries| {
            entries
                .flatten()
                .map(|e| e.file_name().to_string_lossy().into_owned())
                .collect()
        })
        .unwrap_or_default();
    names.sort();
    names
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_source_files_sorted_and_filtered() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src");
        fs::create_dir_all(src.join("modules")).unwrap();
        fs::write(src.join("zz.ts"), "export const z = 1;").unwrap();
        fs::write(src.join("aa.ts"), "export const a = 1;").unwrap();
        fs::write(src.join("notes.md"), "# notes").unwrap();

        let walker = SortedWalker::new(dir.path());
        let files = walker.relative_source_files(&["ts"]);
        assert_eq!(files, vec!["src/aa.ts", "src/zz.ts"]);
    }

    #[test]
    fn test_node_modules_excluded() {
        let dir = tempfile::tempdir().unwrap();
        let nm = dir.path().join("node_modules").join("pkg");
        fs::create_dir_all(&nm).unwrap();
        fs::write(nm.join("index.ts"), "export {}").unwrap();
        fs::create_dir_all(dir.path().join("src")).unwrap();
        fs::write(dir.path().join("src/a.ts"), "export {}").unwrap();

        let walker = SortedWalker::new(dir.path());
        assert_eq!(walker.relative_source_files(&["ts"]), vec!["src/a.ts"]);
    }

    #[test]
    fn test_sorted_dir_entries() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("b.txt"), "").unwrap();
        fs::write(dir.path().join("a.txt"), "").unwrap();
        assert_eq!(sorted_dir_entries(dir.path()), vec!["a.txt", "b.txt"]);
        assert!(sorted_dir_entries(&dir.path().join("missing")).is_empty());
    }
}
