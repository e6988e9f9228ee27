//! Isolated git worktrees
//!
//! Every run mutates files inside an ephemeral worktree checked out at the
//! run's base commit on a dedicated branch, so concurrent runs never touch
//! the project checkout. The kernel reattaches to an existing worktree on
//! resume and hard-resets it during dirty recovery.

use std::path::{Path, PathBuf};
use std::process::Command;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum WorktreeError {
    #[error("not a git repository: {0}")]
    NotARepo(String),

    #[error("worktree already exists at {0}")]
    AlreadyExists(String),

    #[error("git {operation} failed: {message}")]
    Git { operation: String, message: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type WorktreeResult<T> = Result<T, WorktreeError>;

fn git_error(operation: &str, message: impl Into<String>) -> WorktreeError {
    WorktreeError::Git {
        operation: operation.to_string(),
        message: message.into(),
    }
}

/// Run a git command in a directory and return trimmed stdout.
pub fn run_git(dir: &Path, args: &[&str]) -> WorktreeResult<String> {
    let output = Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .map_err(|e| git_error("execute", e.to_string()))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(git_error(&args.join(" "), stderr.to_string()));
    }

    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

/// Full commit hash of HEAD in a repository.
pub fn current_commit(dir: &Path) -> WorktreeResult<String> {
    run_git(dir, &["rev-parse", "HEAD"])
}

/// Whether `dir` is inside a git work tree.
pub fn is_git_repo(dir: &Path) -> bool {
    Command::new("git")
        .args(["rev-parse", "--git-dir"])
        .current_dir(dir)
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

/// An ephemeral git worktree bound to one run.
#[derive(Debug, Clone)]
pub struct IsolatedWorktree {
    path: PathBuf,
    branch: String,
    repo_root: PathBuf,
}

impl IsolatedWorktree {
    /// Worktree path for a run under the workspace artifacts directory.
    pub fn path_for(workspace_root: &Path, run_id: &str) -> PathBuf {
        workspace_root
            .join(".deeprun")
            .join("worktrees")
            .join(run_id)
    }

    /// Branch name for a run.
    pub fn branch_for(run_id: &str) -> String {
        format!("deeprun/{run_id}")
    }

    /// Create a worktree for a run at `base_ref`.
    pub fn create(
        repo_root: &Path,
        workspace_root: &Path,
        run_id: &str,
        base_ref: &str,
    ) -> WorktreeResult<Self> {
        if !is_git_repo(repo_root) {
            return Err(WorktreeError::NotARepo(repo_root.display().to_string()));
        }

        let path = Self::path_for(workspace_root, run_id);
        let branch = Self::branch_for(run_id);

        if path.exists() {
            return Err(WorktreeError::AlreadyExists(path.display().to_string()));
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        // Keep run artifacts invisible to the project checkout.
        exclude_artifacts_dir(repo_root)?;

        // -B: a leftover branch from a removed worktree is reset, not fatal.
        run_git(
            repo_root,
            &[
                "worktree",
                "add",
                "-B",
                &branch,
                &path.display().to_string(),
                base_ref,
            ],
        )?;

        tracing::info!(run_id, path = %path.display(), branch, "created worktree");

        Ok(Self {
            path,
            branch,
            repo_root: repo_root.to_path_buf(),
        })
    }

    /// Reattach to a worktree that already exists on disk.
    pub fn reattach(repo_root: &Path, path: &Path, branch: &str) -> WorktreeResult<Self> {
        if !path.exists() {
            return Err(git_error(
                "reattach",
                format!("worktree path missing: {}", path.display()),
            ));
        }
        Ok(Self {
            path: path.to_path_buf(),
            branch: branch.to_string(),
            repo_root: repo_root.to_path_buf(),
        })
    }

    /// Create a fresh worktree, or reattach when the run already has one.
    pub fn create_or_reattach(
        repo_root: &Path,
        workspace_root: &Path,
        run_id: &str,
        base_ref: &str,
    ) -> WorktreeResult<Self> {
        let path = Self::path_for(workspace_root, run_id);
        if path.exists() {
            Self::reattach(repo_root, &path, &Self::branch_for(run_id))
        } else {
            Self::create(repo_root, workspace_root, run_id, base_ref)
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn branch(&self) -> &str {
        &self.branch
    }

    /// Full hash of the worktree's HEAD.
    pub fn current_commit(&self) -> WorktreeResult<String> {
        current_commit(&self.path)
    }

    /// Whether the worktree has staged, unstaged, or untracked changes.
    pub fn has_uncommitted_changes(&self) -> WorktreeResult<bool> {
        let status = run_git(&self.path, &["status", "--porcelain"])?;
        Ok(!status.is_empty())
    }

    /// Hard reset to a ref and discard untracked files. The dirty-recovery
    /// primitive: after a crash between apply and commit, the worktree is
    /// restored to the last valid commit.
    pub fn hard_reset(&self, commit_ref: &str) -> WorktreeResult<()> {
        run_git(&self.path, &["reset", "--hard", commit_ref])?;
        run_git(&self.path, &["clean", "-fd"])?;
        Ok(())
    }

    /// Stage everything and commit with the given message. Fails when there
    /// is nothing to commit.
    pub fn commit_all(&self, message: &str) -> WorktreeResult<String> {
        run_git(&self.path, &["add", "-A"])?;
        if !self.has_uncommitted_changes()? {
            return Err(git_error("commit", "nothing to commit"));
        }
        run_git(&self.path, &["commit", "-m", message])?;
        self.current_commit()
    }

    /// Whether `ancestor` is reachable from `descendant` on this branch.
    pub fn is_ancestor(&self, ancestor: &str, descendant: &str) -> WorktreeResult<bool> {
        let output = Command::new("git")
            .args(["merge-base", "--is-ancestor", ancestor, descendant])
            .current_dir(&self.path)
            .output()
            .map_err(|e| git_error("merge-base", e.to_string()))?;
        Ok(output.status.success())
    }

    /// Remove the worktree directory and prune the registration. The branch
    /// is kept: it anchors the run's commit history for forensics.
    pub fn remove(self) -> WorktreeResult<()> {
        let remove = Command::new("git")
            .args([
                "worktree",
                "remove",
                "--force",
                &self.path.display().to_string(),
            ])
            .current_dir(&self.repo_root)
            .output()
            .map_err(|e| git_error("worktree remove", e.to_string()))?;
        if !remove.status.success() {
            let stderr = String::from_utf8_lossy(&remove.stderr);
            tracing::warn!("git worktree remove warning: {stderr}");
            // Fall back to deleting the directory so reruns are not blocked.
            let _ = std::fs::remove_dir_all(&self.path);
            let _ = run_git(&self.repo_root, &["worktree", "prune"]);
        }
        Ok(())
    }
}

/// Add `.deeprun/` to the repo's local exclude file so run artifacts never
/// show up as untracked changes in the project checkout.
fn exclude_artifacts_dir(repo_root: &Path) -> WorktreeResult<()> {
    let git_dir = run_git(repo_root, &["rev-parse", "--git-dir"])?;
    let exclude = repo_root.join(git_dir).join("info").join("exclude");
    let existing = std::fs::read_to_string(&exclude).unwrap_or_default();
    if !existing.lines().any(|l| l.trim() == ".deeprun/") {
        if let Some(parent) = exclude.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut updated = existing;
        if !updated.is_empty() && !updated.ends_with('\n') {
            updated.push('\n');
        }
        updated.push_str(".deeprun/\n");
        std::fs::write(&exclude, updated)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    pub(crate) fn init_repo(dir: &Path) {
        let run = |args: &[&str]| {
            Command::new("git")
                .args(args)
                .current_dir(dir)
                .output()
                .unwrap();
        };
        run(&["init", "-b", "main"]);
        run(&["config", "user.email", "test@test.com"]);
        run(&["config", "user.name", "Test"]);
        fs::write(dir.join("README.md"), "# project").unwrap();
        run(&["add", "."]);
        run(&["commit", "-m", "initial commit"]);
    }

    #[test]
    fn test_create_commit_and_recover() {
        let repo = tempfile::tempdir().unwrap();
        init_repo(repo.path());
        let base = current_commit(repo.path()).unwrap();

        let wt =
            IsolatedWorktree::create(repo.path(), repo.path(), "run-1", &base).unwrap();
        assert!(wt.path().exists());
        assert_eq!(wt.branch(), "deeprun/run-1");
        assert_eq!(wt.current_commit().unwrap(), base);

        // Commit a change on the run branch
        fs::write(wt.path().join("file.txt"), "generated").unwrap();
        let hash = wt.commit_all("agentRunId=run-1 stepIndex=0 stepId=s1 :: add file").unwrap();
        assert_ne!(hash, base);
        assert!(wt.is_ancestor(&base, &hash).unwrap());

        // Dirty the tree, then hard reset back to base
        fs::write(wt.path().join("junk.txt"), "junk").unwrap();
        wt.hard_reset(&base).unwrap();
        assert_eq!(wt.current_commit().unwrap(), base);
        assert!(!wt.path().join("junk.txt").exists());
        assert!(!wt.path().join("file.txt").exists());
    }

    #[test]
    fn test_create_twice_fails_then_reattach() {
        let repo = tempfile::tempdir().unwrap();
        init_repo(repo.path());
        let base = current_commit(repo.path()).unwrap();

        let wt = IsolatedWorktree::create(repo.path(), repo.path(), "run-2", &base).unwrap();
        assert!(matches!(
            IsolatedWorktree::create(repo.path(), repo.path(), "run-2", &base),
            Err(WorktreeError::AlreadyExists(_))
        ));

        let again =
            IsolatedWorktree::create_or_reattach(repo.path(), repo.path(), "run-2", &base)
                .unwrap();
        assert_eq!(again.path(), wt.path());
    }

    #[test]
    fn test_commit_with_nothing_staged_fails() {
        let repo = tempfile::tempdir().unwrap();
        init_repo(repo.path());
        let base = current_commit(repo.path()).unwrap();
        let wt = IsolatedWorktree::create(repo.path(), repo.path(), "run-3", &base).unwrap();
        assert!(wt.commit_all("empty").is_err());
    }

    #[test]
    fn test_remove_cleans_up() {
        let repo = tempfile::tempdir().unwrap();
        init_repo(repo.path());
        let base = current_commit(repo.path()).unwrap();
        let wt = IsolatedWorktree::create(repo.path(), repo.path(), "run-4", &base).unwrap();
        let path = wt.path().to_path_buf();
        wt.remove().unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn test_not_a_repo() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            IsolatedWorktree::create(dir.path(), dir.path(), "run-5", "HEAD"),
            Err(WorktreeError::NotARepo(_))
        ));
    }
}
