//! Isolated workspace management.
//!
//! Every work item runs in its own checkout of the source repository,
//! rooted at `<workspace_root>/<project>/<branch>`. Creation normally
//! recycles the branch (delete local + remote, start fresh), but the
//! review-cycle guard blocks that destruction while any pending or
//! claimed work item still references the branch: deleting it would
//! invalidate an in-flight review, rework, or merge.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

use crate::storage::{ItemFilter, Storage};
use hive_core::metadata;

#[derive(Debug, Error)]
pub enum GitError {
    #[error("git command failed: {0}")]
    CommandFailed(String),
    #[error("failed to execute git: {0}")]
    Execution(#[from] std::io::Error),
    #[error("invalid utf-8 in git output")]
    InvalidUtf8,
}

pub type Result<T> = std::result::Result<T, GitError>;

/// Queries whether a branch belongs to an active review cycle.
///
/// Injected at construction so the workspace layer never depends on the
/// queue directly.
#[async_trait]
pub trait ReviewCycleQuery: Send + Sync {
    async fn branch_in_active_cycle(&self, branch: &str) -> bool;
}

/// Store-backed guard: a branch is protected while any open item whose
/// source or metadata marks a review cycle references it.
#[derive(Debug, Clone)]
pub struct StoreCycleQuery {
    storage: Arc<Storage>,
}

impl StoreCycleQuery {
    pub fn new(storage: Arc<Storage>) -> Self {
        Self { storage }
    }
}

#[async_trait]
impl ReviewCycleQuery for StoreCycleQuery {
    async fn branch_in_active_cycle(&self, branch: &str) -> bool {
        // Open items only: available or claimed.
        let Ok(items) = self.storage.list_work_items(&ItemFilter::default()).await else {
            // Reads can fail during shutdown; err on the safe side and
            // keep the branch.
            return true;
        };
        items.iter().any(|item| {
            metadata::is_review_cycle_item(item.source.as_deref(), item.metadata.as_deref())
                && metadata::cycle_branch(item.metadata.as_deref()).as_deref() == Some(branch)
        })
    }
}

/// A guard that never protects anything. For flows that already know no
/// cycle exists (and for tests).
#[derive(Debug, Clone, Copy, Default)]
pub struct NoCycleQuery;

#[async_trait]
impl ReviewCycleQuery for NoCycleQuery {
    async fn branch_in_active_cycle(&self, _branch: &str) -> bool {
        false
    }
}

fn run_git(dir: &Path, args: &[&str]) -> Result<String> {
    let output = Command::new("git").args(args).current_dir(dir).output()?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(GitError::CommandFailed(format!(
            "git {}: {}",
            args.join(" "),
            stderr.trim()
        )));
    }
    String::from_utf8(output.stdout)
        .map(|s| s.trim().to_string())
        .map_err(|_| GitError::InvalidUtf8)
}

/// Best-effort git invocation: failure is expected in some flows
/// (missing branch, no remote) and only logged.
fn run_git_best_effort(dir: &Path, args: &[&str]) -> bool {
    match run_git(dir, args) {
        Ok(_) => true,
        Err(e) => {
            debug!(error = %e, "best-effort git command failed");
            false
        }
    }
}

/// Filesystem-safe branch component (slashes become hyphens).
fn sanitize_branch(branch: &str) -> String {
    branch.replace('/', "-")
}

/// Workspace manager bound to a root directory and a review-cycle guard.
pub struct Workspaces {
    root: PathBuf,
    guard: Arc<dyn ReviewCycleQuery>,
}

impl std::fmt::Debug for Workspaces {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Workspaces")
            .field("root", &self.root)
            .finish_non_exhaustive()
    }
}

impl Workspaces {
    pub fn new(root: impl Into<PathBuf>, guard: Arc<dyn ReviewCycleQuery>) -> Self {
        Self {
            root: root.into(),
            guard,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Deterministic workspace location for `(project, branch)`.
    pub fn workspace_path(&self, project_key: &str, branch: &str) -> PathBuf {
        self.root.join(project_key).join(sanitize_branch(branch))
    }

    /// Create an isolated checkout of `parent` on `branch`.
    ///
    /// A pre-existing checkout at the target path is force-removed. When
    /// the branch is not part of an active review cycle, the local and
    /// remote branches are deleted first so the workspace starts from a
    /// fresh branch; a guarded branch is reused as-is.
    pub async fn create_workspace(
        &self,
        parent: &Path,
        branch: &str,
        project_key: &str,
    ) -> Result<PathBuf> {
        let path = self.workspace_path(project_key, branch);
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }

        if path.exists() {
            self.remove_workspace(parent, &path)?;
        }

        let guarded = self.guard.branch_in_active_cycle(branch).await;
        if guarded {
            warn!(branch, "branch is part of an active review cycle; reusing it");
        } else {
            run_git_best_effort(parent, &["branch", "-D", branch]);
            run_git_best_effort(parent, &["push", "origin", "--delete", branch]);
        }

        run_git_best_effort(parent, &["fetch", "origin"]);

        let path_str = path.to_string_lossy();
        if guarded && branch_exists(parent, branch) {
            run_git(parent, &["worktree", "add", path_str.as_ref(), branch])?;
        } else {
            run_git(parent, &["worktree", "add", "-b", branch, path_str.as_ref()])?;
        }
        Ok(path)
    }

    /// Force-remove a checkout; prune the registration if removal fails.
    pub fn remove_workspace(&self, parent: &Path, path: &Path) -> Result<()> {
        let path_str = path.to_string_lossy();
        if !run_git_best_effort(parent, &["worktree", "remove", "--force", path_str.as_ref()]) {
            run_git_best_effort(parent, &["worktree", "prune"]);
            if path.exists() {
                std::fs::remove_dir_all(path)?;
                run_git_best_effort(parent, &["worktree", "prune"]);
            }
        }
        Ok(())
    }

    /// Reuse a checkout when it is still registered; recreate it on the
    /// same branch otherwise.
    pub async fn ensure_workspace(&self, parent: &Path, path: &Path, branch: &str) -> Result<()> {
        if path.exists() && worktree_registered(parent, path) {
            return Ok(());
        }
        run_git_best_effort(parent, &["worktree", "prune"]);
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let path_str = path.to_string_lossy();
        if branch_exists(parent, branch) {
            run_git(parent, &["worktree", "add", path_str.as_ref(), branch])?;
        } else {
            run_git(parent, &["worktree", "add", "-b", branch, path_str.as_ref()])?;
        }
        Ok(())
    }

    /// Stash uncommitted parent-repo state. Returns whether a stash frame
    /// was created (pop only when it was).
    pub fn stash_if_dirty(&self, parent: &Path) -> Result<bool> {
        if is_clean(parent)? {
            return Ok(false);
        }
        run_git(parent, &["stash", "push", "-u", "-m", "hive-autostash"])?;
        Ok(true)
    }

    /// Pop the most recent stash frame. Returns false when the pop fails
    /// (e.g. conflicts); the stash frame is left intact in that case.
    pub fn pop_stash(&self, parent: &Path) -> Result<bool> {
        Ok(run_git_best_effort(parent, &["stash", "pop"]))
    }

    /// Stage everything and commit. Returns the commit id, or None when
    /// there was nothing to commit.
    pub fn commit_all(&self, path: &Path, message: &str) -> Result<Option<String>> {
        run_git(path, &["add", "-A"])?;
        let staged = Command::new("git")
            .args(["diff", "--cached", "--quiet"])
            .current_dir(path)
            .output()?;
        if staged.status.success() {
            return Ok(None);
        }
        run_git(path, &["commit", "-m", message])?;
        let sha = run_git(path, &["rev-parse", "HEAD"])?;
        Ok(Some(sha))
    }

    pub fn push_branch(&self, path: &Path, branch: &str) -> Result<()> {
        run_git(path, &["push", "-u", "origin", branch])?;
        Ok(())
    }

    pub fn force_push_branch(&self, path: &Path, branch: &str) -> Result<()> {
        run_git(path, &["push", "--force-with-lease", "origin", branch])?;
        Ok(())
    }

    /// Pull the merged branch back into the parent checkout.
    pub fn pull_main(&self, parent: &Path, branch: &str) -> Result<()> {
        run_git(parent, &["pull", "origin", branch])?;
        Ok(())
    }

    /// Rebase onto `origin/<main_branch>`. On conflict the rebase is
    /// aborted and false is returned; the caller escalates to an
    /// agent-driven resolution.
    pub fn rebase_on_main(&self, path: &Path, main_branch: &str) -> Result<bool> {
        run_git_best_effort(path, &["fetch", "origin"]);
        let target = format!("origin/{main_branch}");
        match run_git(path, &["rebase", &target]) {
            Ok(_) => Ok(true),
            Err(e) => {
                debug!(error = %e, "rebase failed; aborting");
                run_git_best_effort(path, &["rebase", "--abort"]);
                Ok(false)
            }
        }
    }

    /// Merge `origin/<main_branch>` without committing, leaving conflict
    /// markers in the tree for an agent to resolve. The non-zero exit on
    /// conflict is expected.
    pub fn merge_main_no_commit(&self, path: &Path, main_branch: &str) -> Result<()> {
        run_git_best_effort(path, &["fetch", "origin"]);
        let target = format!("origin/{main_branch}");
        run_git_best_effort(path, &["merge", &target, "--no-commit"]);
        Ok(())
    }

    pub fn get_conflicted_files(&self, path: &Path) -> Result<Vec<String>> {
        let out = run_git(path, &["diff", "--name-only", "--diff-filter=U"])?;
        Ok(out.lines().map(String::from).collect())
    }

    /// Stat-style diff summary between the base branch and HEAD.
    pub fn get_diff_summary(&self, path: &Path, base: &str) -> Result<String> {
        let range = format!("{base}...HEAD");
        run_git(path, &["diff", "--stat", &range])
    }

    /// Files changed between the base branch and HEAD.
    pub fn get_changed_files(&self, path: &Path, base: &str) -> Result<Vec<String>> {
        let range = format!("{base}...HEAD");
        let out = run_git(path, &["diff", "--name-only", &range])?;
        Ok(out.lines().filter(|l| !l.is_empty()).map(String::from).collect())
    }

    pub fn current_branch(&self, path: &Path) -> Result<String> {
        run_git(path, &["branch", "--show-current"])
    }

    pub fn is_clean(&self, path: &Path) -> Result<bool> {
        is_clean(path)
    }

    /// Make sure the checkout is on `branch`, creating it if missing.
    pub fn ensure_branch(&self, path: &Path, branch: &str) -> Result<()> {
        if self.current_branch(path)? == branch {
            return Ok(());
        }
        if branch_exists(path, branch) {
            run_git(path, &["checkout", branch])?;
        } else {
            run_git(path, &["checkout", "-b", branch])?;
        }
        Ok(())
    }
}

fn is_clean(path: &Path) -> Result<bool> {
    let out = run_git(path, &["status", "--porcelain"])?;
    Ok(out.is_empty())
}

fn branch_exists(repo: &Path, branch: &str) -> bool {
    let reference = format!("refs/heads/{branch}");
    Command::new("git")
        .args(["rev-parse", "--verify", &reference])
        .current_dir(repo)
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

fn worktree_registered(parent: &Path, path: &Path) -> bool {
    let Ok(out) = run_git(parent, &["worktree", "list", "--porcelain"]) else {
        return false;
    };
    let needle = path.to_string_lossy();
    out.lines().any(|line| {
        line.strip_prefix("worktree ")
            .is_some_and(|registered| registered == needle)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    /// A guard with a fixed answer.
    struct FixedGuard(bool);

    #[async_trait]
    impl ReviewCycleQuery for FixedGuard {
        async fn branch_in_active_cycle(&self, _branch: &str) -> bool {
            self.0
        }
    }

    fn git(dir: &Path, args: &[&str]) {
        let ok = Command::new("git")
            .args(args)
            .current_dir(dir)
            .output()
            .unwrap()
            .status
            .success();
        assert!(ok, "git {args:?} failed in {dir:?}");
    }

    /// Create a test repository with one commit.
    fn setup_test_repo() -> TempDir {
        let dir = TempDir::new().unwrap();
        git(dir.path(), &["init", "-b", "main"]);
        git(dir.path(), &["config", "user.email", "test@test.com"]);
        git(dir.path(), &["config", "user.name", "Test"]);
        std::fs::write(dir.path().join("README.md"), "# Test").unwrap();
        git(dir.path(), &["add", "."]);
        git(dir.path(), &["commit", "-m", "Initial commit"]);
        dir
    }

    fn workspaces(root: &Path, guarded: bool) -> Workspaces {
        Workspaces::new(root, Arc::new(FixedGuard(guarded)))
    }

    #[test]
    fn workspace_path_sanitizes_branch() {
        let ws = workspaces(Path::new("/tmp/wt"), false);
        assert_eq!(
            ws.workspace_path("pai", "fix/issue-7"),
            PathBuf::from("/tmp/wt/pai/fix-issue-7")
        );
    }

    #[tokio::test]
    async fn create_workspace_makes_isolated_checkout() {
        let repo = setup_test_repo();
        let root = TempDir::new().unwrap();
        let ws = workspaces(root.path(), false);

        let path = ws
            .create_workspace(repo.path(), "fix/issue-1", "proj")
            .await
            .unwrap();
        assert!(path.join("README.md").exists());
        assert_eq!(ws.current_branch(&path).unwrap(), "fix/issue-1");

        ws.remove_workspace(repo.path(), &path).unwrap();
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn create_workspace_replaces_existing_checkout() {
        let repo = setup_test_repo();
        let root = TempDir::new().unwrap();
        let ws = workspaces(root.path(), false);

        let first = ws
            .create_workspace(repo.path(), "fix/issue-2", "proj")
            .await
            .unwrap();
        std::fs::write(first.join("scratch.txt"), "leftover").unwrap();

        let second = ws
            .create_workspace(repo.path(), "fix/issue-2", "proj")
            .await
            .unwrap();
        assert_eq!(first, second);
        // Fresh branch: leftover state is gone.
        assert!(!second.join("scratch.txt").exists());
    }

    #[tokio::test]
    async fn guard_preserves_branch_and_its_commits() {
        let repo = setup_test_repo();
        let root = TempDir::new().unwrap();

        // First pass, unguarded: create a workspace and commit to it.
        let ws = workspaces(root.path(), false);
        let path = ws
            .create_workspace(repo.path(), "fix/issue-3", "proj")
            .await
            .unwrap();
        std::fs::write(path.join("work.txt"), "in-review changes").unwrap();
        ws.commit_all(&path, "Fix in review").unwrap();
        ws.remove_workspace(repo.path(), &path).unwrap();

        // Second pass, guarded: the branch (and its commit) must survive.
        let guarded = workspaces(root.path(), true);
        let path = guarded
            .create_workspace(repo.path(), "fix/issue-3", "proj")
            .await
            .unwrap();
        assert!(path.join("work.txt").exists(), "guarded branch was recycled");
    }

    #[tokio::test]
    async fn ensure_workspace_reuses_registered_checkout() {
        let repo = setup_test_repo();
        let root = TempDir::new().unwrap();
        let ws = workspaces(root.path(), false);

        let path = ws
            .create_workspace(repo.path(), "fix/issue-4", "proj")
            .await
            .unwrap();
        std::fs::write(path.join("keep.txt"), "keep").unwrap();

        ws.ensure_workspace(repo.path(), &path, "fix/issue-4")
            .await
            .unwrap();
        assert!(path.join("keep.txt").exists());
    }

    #[tokio::test]
    async fn ensure_workspace_recreates_missing_checkout() {
        let repo = setup_test_repo();
        let root = TempDir::new().unwrap();
        let ws = workspaces(root.path(), false);

        let path = ws
            .create_workspace(repo.path(), "fix/issue-5", "proj")
            .await
            .unwrap();
        ws.remove_workspace(repo.path(), &path).unwrap();

        ws.ensure_workspace(repo.path(), &path, "fix/issue-5")
            .await
            .unwrap();
        assert!(path.join("README.md").exists());
        assert_eq!(ws.current_branch(&path).unwrap(), "fix/issue-5");
    }

    #[test]
    fn stash_round_trip_restores_dirty_state() {
        let repo = setup_test_repo();
        let ws = workspaces(Path::new("/tmp"), false);

        assert!(!ws.stash_if_dirty(repo.path()).unwrap());

        std::fs::write(repo.path().join("wip.txt"), "uncommitted").unwrap();
        assert!(ws.stash_if_dirty(repo.path()).unwrap());
        assert!(ws.is_clean(repo.path()).unwrap());

        assert!(ws.pop_stash(repo.path()).unwrap());
        assert!(repo.path().join("wip.txt").exists());
    }

    #[test]
    fn commit_all_returns_none_when_clean() {
        let repo = setup_test_repo();
        let ws = workspaces(Path::new("/tmp"), false);
        assert!(ws.commit_all(repo.path(), "noop").unwrap().is_none());

        std::fs::write(repo.path().join("new.txt"), "content").unwrap();
        let sha = ws.commit_all(repo.path(), "Add new file").unwrap();
        assert!(sha.is_some());
        assert!(ws.is_clean(repo.path()).unwrap());
    }

    #[test]
    fn changed_files_and_summary_against_base() {
        let repo = setup_test_repo();
        let ws = workspaces(Path::new("/tmp"), false);
        git(repo.path(), &["checkout", "-b", "feature"]);
        std::fs::write(repo.path().join("src.rs"), "fn main() {}").unwrap();
        ws.commit_all(repo.path(), "Add source").unwrap();

        let files = ws.get_changed_files(repo.path(), "main").unwrap();
        assert_eq!(files, vec!["src.rs"]);
        let summary = ws.get_diff_summary(repo.path(), "main").unwrap();
        assert!(summary.contains("src.rs"));
    }

    #[test]
    fn ensure_branch_creates_and_switches() {
        let repo = setup_test_repo();
        let ws = workspaces(Path::new("/tmp"), false);

        ws.ensure_branch(repo.path(), "side").unwrap();
        assert_eq!(ws.current_branch(repo.path()).unwrap(), "side");

        git(repo.path(), &["checkout", "main"]);
        ws.ensure_branch(repo.path(), "side").unwrap();
        assert_eq!(ws.current_branch(repo.path()).unwrap(), "side");
    }

    #[test]
    fn conflicted_files_lists_unmerged_paths() {
        let repo = setup_test_repo();
        let ws = workspaces(Path::new("/tmp"), false);

        // Conflicting edits to the same file on two branches.
        git(repo.path(), &["checkout", "-b", "left"]);
        std::fs::write(repo.path().join("README.md"), "# Left").unwrap();
        ws.commit_all(repo.path(), "Left edit").unwrap();
        git(repo.path(), &["checkout", "main"]);
        std::fs::write(repo.path().join("README.md"), "# Right").unwrap();
        ws.commit_all(repo.path(), "Right edit").unwrap();

        // Merge left into main without committing; expect a conflict.
        let _ = Command::new("git")
            .args(["merge", "left", "--no-commit"])
            .current_dir(repo.path())
            .output()
            .unwrap();
        let conflicted = ws.get_conflicted_files(repo.path()).unwrap();
        assert_eq!(conflicted, vec!["README.md"]);
    }

    #[tokio::test]
    async fn store_cycle_query_matches_open_branch_references() {
        use crate::queue::{CreateItem, Queue};
        use hive_core::types::Priority;

        let dir = TempDir::new().unwrap();
        let storage = Storage::open(&dir.path().join("t.db")).await.unwrap();
        storage.migrate().await.unwrap();
        let storage = Arc::new(storage);
        let queue = Queue::new(Arc::clone(&storage));

        let mut opts = CreateItem::new("review-p-pr-8", "Review PR 8");
        opts.source = Some("code_review".to_string());
        opts.priority = Priority::P1;
        opts.metadata = Some(serde_json::json!({
            "pr_number": 8, "repo": "o/r", "branch": "fix/issue-8"
        }));
        queue.create(opts).await.unwrap();

        let guard = StoreCycleQuery::new(Arc::clone(&storage));
        assert!(guard.branch_in_active_cycle("fix/issue-8").await);
        assert!(!guard.branch_in_active_cycle("fix/issue-9").await);
    }
}
