//! Git operations for the orchestrator daemon: worktree lifecycle, branch
//! naming, and the merge/rebase primitives the merge serializer drives.

use loop_core::prompt::sanitize_branch_name;
use loop_core::types::MergeStrategy;
use std::path::Path;
use std::process::Command;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GitError {
    #[error("git command failed: {0}")]
    CommandFailed(String),
    #[error("not a git repository: {0}")]
    NotARepo(String),
    #[error("failed to execute git: {0}")]
    Execution(#[from] std::io::Error),
    #[error("invalid utf-8 in git output")]
    InvalidUtf8,
    #[error("merge conflict: {0}")]
    MergeConflict(String),
    #[error("dirty working tree: {0}")]
    DirtyWorkingTree(String),
    #[error("rebase produced conflicts in {0:?}")]
    RebaseConflict(Vec<String>),
    #[error("push rejected, remote moved: {0}")]
    PushRejected(String),
}

pub type Result<T> = std::result::Result<T, GitError>;

fn run(workspace_root: &Path, args: &[&str]) -> Result<std::process::Output> {
    Command::new("git")
        .args(args)
        .current_dir(workspace_root)
        .output()
        .map_err(GitError::from)
}

fn stderr_of(output: &std::process::Output) -> String {
    String::from_utf8_lossy(&output.stderr).to_string()
}

/// Detect the default branch for a repository.
pub fn detect_default_branch(workspace_root: &Path) -> Result<String> {
    let output = run(workspace_root, &["symbolic-ref", "refs/remotes/origin/HEAD"])?;
    if output.status.success() {
        let full_ref = String::from_utf8(output.stdout)
            .map_err(|_| GitError::InvalidUtf8)?
            .trim()
            .to_string();
        if let Some(branch) = full_ref.strip_prefix("refs/remotes/origin/") {
            return Ok(branch.to_string());
        }
    }

    if run(workspace_root, &["rev-parse", "--verify", "refs/heads/main"])?
        .status
        .success()
    {
        return Ok("main".to_string());
    }

    if run(workspace_root, &["rev-parse", "--verify", "refs/heads/master"])?
        .status
        .success()
    {
        return Ok("master".to_string());
    }

    Ok("main".to_string())
}

/// Get the repository directory name from workspace root.
pub fn repo_name(workspace_root: &Path) -> String {
    workspace_root
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("repo")
        .to_string()
}

/// Expand the worktree path template.
///
/// Template variables: `{{ repo }}` (repository directory name) and
/// `{{ branch | sanitize }}` / `{{ branch }}` (unit branch name, sanitized
/// or raw).
pub fn expand_worktree_template(template: &str, workspace_root: &Path, branch: &str) -> String {
    let repo = repo_name(workspace_root);
    let sanitized = sanitize_branch_name(branch);

    template
        .replace("{{ repo }}", &repo)
        .replace("{{repo}}", &repo)
        .replace("{{ branch | sanitize }}", &sanitized)
        .replace("{{branch | sanitize}}", &sanitized)
        .replace("{{ branch }}", branch)
        .replace("{{branch}}", branch)
}

/// Resolve the worktree path to an absolute path.
pub fn resolve_worktree_path(expanded: &str, workspace_root: &Path) -> std::path::PathBuf {
    let path = std::path::Path::new(expanded);
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        workspace_root
            .join(expanded)
            .canonicalize()
            .unwrap_or_else(|_| normalize_path(&workspace_root.join(expanded)))
    }
}

/// Normalize a path by resolving `.` and `..` components.
fn normalize_path(path: &Path) -> std::path::PathBuf {
    let mut components = Vec::new();
    for component in path.components() {
        match component {
            std::path::Component::ParentDir => {
                components.pop();
            }
            std::path::Component::CurDir => {}
            c => components.push(c),
        }
    }
    components.iter().collect()
}

/// Create a slug from a unit key (lowercase, alphanumeric, hyphens).
pub fn slugify(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '-' })
        .collect::<String>()
        .split('-')
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("-")
}

/// Check if a branch exists locally.
pub fn branch_exists(workspace_root: &Path, branch: &str) -> Result<bool> {
    Ok(run(workspace_root, &["rev-parse", "--verify", &format!("refs/heads/{branch}")])?
        .status
        .success())
}

/// Create a new branch from base without checking it out.
pub fn create_branch(workspace_root: &Path, branch: &str, base: &str) -> Result<()> {
    let output = run(workspace_root, &["branch", branch, base])?;
    if !output.status.success() {
        return Err(GitError::CommandFailed(format!(
            "git branch {branch} {base}: {}",
            stderr_of(&output)
        )));
    }
    Ok(())
}

/// Force-delete a local branch (its worktree, if any, must already be removed).
pub fn delete_branch(workspace_root: &Path, branch: &str) -> Result<()> {
    let output = run(workspace_root, &["branch", "-D", branch])?;
    if !output.status.success() {
        return Err(GitError::CommandFailed(format!(
            "git branch -D {branch}: {}",
            stderr_of(&output)
        )));
    }
    Ok(())
}

/// Create a git worktree at the specified path for the given branch,
/// creating the branch from `base_branch` if it doesn't exist.
pub fn create_worktree(
    workspace_root: &Path,
    worktree_path: &Path,
    branch: &str,
    base_branch: &str,
) -> Result<()> {
    if let Some(parent) = worktree_path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| GitError::CommandFailed(format!("failed to create parent directory: {e}")))?;
    }

    if !branch_exists(workspace_root, branch)? {
        create_branch(workspace_root, branch, base_branch)?;
    }

    let output = run(
        workspace_root,
        &["worktree", "add", worktree_path.to_string_lossy().as_ref(), branch],
    )?;
    if !output.status.success() {
        return Err(GitError::CommandFailed(format!("git worktree add: {}", stderr_of(&output))));
    }
    Ok(())
}

/// Remove a git worktree.
pub fn remove_worktree(workspace_root: &Path, worktree_path: &Path) -> Result<()> {
    let output = run(workspace_root, &["worktree", "remove", worktree_path.to_string_lossy().as_ref()])?;
    if !output.status.success() {
        return Err(GitError::CommandFailed(format!("git worktree remove: {}", stderr_of(&output))));
    }
    Ok(())
}

/// Force remove a git worktree (even with local changes).
pub fn remove_worktree_force(workspace_root: &Path, worktree_path: &Path) -> Result<()> {
    let output = run(
        workspace_root,
        &["worktree", "remove", "--force", worktree_path.to_string_lossy().as_ref()],
    )?;
    if !output.status.success() {
        return Err(GitError::CommandFailed(format!(
            "git worktree remove --force: {}",
            stderr_of(&output)
        )));
    }
    Ok(())
}

/// Information about a git worktree.
#[derive(Debug, Clone)]
pub struct WorktreeInfo {
    pub path: String,
    pub branch: Option<String>,
    pub commit: String,
}

/// List all git worktrees for a repository.
pub fn list_worktrees(workspace_root: &Path) -> Result<Vec<WorktreeInfo>> {
    let output = run(workspace_root, &["worktree", "list", "--porcelain"])?;
    if !output.status.success() {
        return Err(GitError::CommandFailed(format!("git worktree list: {}", stderr_of(&output))));
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    let mut worktrees = Vec::new();
    let mut current_path: Option<String> = None;
    let mut current_commit: Option<String> = None;
    let mut current_branch: Option<String> = None;

    for line in stdout.lines() {
        if let Some(path) = line.strip_prefix("worktree ") {
            if let (Some(path), Some(commit)) = (current_path.take(), current_commit.take()) {
                worktrees.push(WorktreeInfo { path, commit, branch: current_branch.take() });
            }
            current_path = Some(path.to_string());
        } else if let Some(commit) = line.strip_prefix("HEAD ") {
            current_commit = Some(commit.to_string());
        } else if let Some(branch) = line.strip_prefix("branch refs/heads/") {
            current_branch = Some(branch.to_string());
        }
    }

    if let (Some(path), Some(commit)) = (current_path, current_commit) {
        worktrees.push(WorktreeInfo { path, commit, branch: current_branch });
    }

    Ok(worktrees)
}

/// Check if the working tree is clean (no uncommitted changes).
pub fn is_working_tree_clean(workspace_root: &Path) -> Result<bool> {
    let output = run(workspace_root, &["status", "--porcelain"])?;
    if !output.status.success() {
        return Err(GitError::CommandFailed(format!("git status: {}", stderr_of(&output))));
    }
    let stdout = String::from_utf8(output.stdout).map_err(|_| GitError::InvalidUtf8)?;
    Ok(stdout.trim().is_empty())
}

/// Stage every change in the worktree (tracked and untracked).
pub fn stage_all(worktree_path: &Path) -> Result<()> {
    let output = run(worktree_path, &["add", "-A"])?;
    if !output.status.success() {
        return Err(GitError::CommandFailed(format!("git add -A: {}", stderr_of(&output))));
    }
    Ok(())
}

/// Commit staged changes with a hook-suppressing flag (`--no-verify`), so a
/// project's client-side pre-commit hooks never run inside an agent-driven
/// worktree.
pub fn commit(worktree_path: &Path, message: &str) -> Result<()> {
    let output = run(worktree_path, &["commit", "--no-verify", "-m", message])?;
    if !output.status.success() {
        return Err(GitError::CommandFailed(format!("git commit: {}", stderr_of(&output))));
    }
    Ok(())
}

/// Checkout a branch in the workspace.
pub fn checkout_branch(workspace_root: &Path, branch: &str) -> Result<()> {
    let output = run(workspace_root, &["checkout", branch])?;
    if !output.status.success() {
        return Err(GitError::CommandFailed(format!("git checkout {branch}: {}", stderr_of(&output))));
    }
    Ok(())
}

/// Fetch from the given remote (default `origin`).
pub fn fetch(workspace_root: &Path, remote: &str) -> Result<()> {
    let output = run(workspace_root, &["fetch", remote])?;
    if !output.status.success() {
        return Err(GitError::CommandFailed(format!("git fetch {remote}: {}", stderr_of(&output))));
    }
    Ok(())
}

/// Push a branch to the given remote.
pub fn push(workspace_root: &Path, remote: &str, branch: &str) -> Result<()> {
    let output = run(workspace_root, &["push", remote, branch])?;
    if !output.status.success() {
        let stderr = stderr_of(&output);
        if stderr.contains("[rejected]") || stderr.contains("non-fast-forward") {
            return Err(GitError::PushRejected(stderr));
        }
        return Err(GitError::CommandFailed(format!("git push {remote} {branch}: {stderr}")));
    }
    Ok(())
}

/// Force-push a branch with a lease, refusing if the remote moved since our
/// last fetch.
pub fn force_push_with_lease(workspace_root: &Path, remote: &str, branch: &str) -> Result<()> {
    let output = run(
        workspace_root,
        &["push", "--force-with-lease", remote, branch],
    )?;
    if !output.status.success() {
        let stderr = stderr_of(&output);
        if stderr.contains("stale info") || stderr.contains("[rejected]") {
            return Err(GitError::PushRejected(stderr));
        }
        return Err(GitError::CommandFailed(format!(
            "git push --force-with-lease {remote} {branch}: {stderr}"
        )));
    }
    Ok(())
}

/// Rebase the current branch onto `onto`, returning the list of unmerged
/// files if conflicts occur (the rebase is left in-progress so the caller
/// can delegate resolution).
pub fn rebase_onto(workspace_root: &Path, onto: &str) -> Result<()> {
    let output = run(workspace_root, &["rebase", onto])?;
    if !output.status.success() {
        let stderr = stderr_of(&output);
        if stderr.contains("CONFLICT") || rebase_in_progress(workspace_root) {
            return Err(GitError::RebaseConflict(unmerged_files(workspace_root)?));
        }
        return Err(GitError::CommandFailed(format!("git rebase {onto}: {stderr}")));
    }
    Ok(())
}

/// Continue an in-progress rebase after conflicts have been staged.
pub fn rebase_continue(workspace_root: &Path) -> Result<()> {
    let output = run(workspace_root, &["rebase", "--continue"])?;
    if !output.status.success() {
        let stderr = stderr_of(&output);
        if stderr.contains("CONFLICT") || rebase_in_progress(workspace_root) {
            return Err(GitError::RebaseConflict(unmerged_files(workspace_root)?));
        }
        return Err(GitError::CommandFailed(format!("git rebase --continue: {stderr}")));
    }
    Ok(())
}

/// Abort an in-progress rebase, returning the branch to its pre-rebase tip.
pub fn rebase_abort(workspace_root: &Path) -> Result<()> {
    let output = run(workspace_root, &["rebase", "--abort"])?;
    if !output.status.success() {
        return Err(GitError::CommandFailed(format!("git rebase --abort: {}", stderr_of(&output))));
    }
    Ok(())
}

/// List files with unresolved merge conflicts.
pub fn unmerged_files(workspace_root: &Path) -> Result<Vec<String>> {
    let output = run(workspace_root, &["diff", "--name-only", "--diff-filter=U"])?;
    if !output.status.success() {
        return Err(GitError::CommandFailed(format!(
            "git diff --diff-filter=U: {}",
            stderr_of(&output)
        )));
    }
    let stdout = String::from_utf8_lossy(&output.stdout);
    Ok(stdout.lines().map(str::to_string).filter(|l| !l.is_empty()).collect())
}

/// Check whether a rebase is currently in progress in this worktree,
/// following the `gitdir:` pointer file when `.git` is a file (as it is
/// inside a worktree) rather than a directory.
pub fn rebase_in_progress(workspace_root: &Path) -> bool {
    let git_dir = resolve_git_dir(workspace_root);
    git_dir.join("rebase-merge").is_dir() || git_dir.join("rebase-apply").is_dir()
}

fn resolve_git_dir(workspace_root: &Path) -> std::path::PathBuf {
    let dot_git = workspace_root.join(".git");
    if dot_git.is_dir() {
        return dot_git;
    }
    if let Ok(content) = std::fs::read_to_string(&dot_git) {
        if let Some(rest) = content.trim().strip_prefix("gitdir: ") {
            let candidate = std::path::Path::new(rest);
            return if candidate.is_absolute() {
                candidate.to_path_buf()
            } else {
                workspace_root.join(candidate)
            };
        }
    }
    dot_git
}

/// Merge a source branch into the current branch using a regular merge.
pub fn merge_branch(workspace_root: &Path, source_branch: &str) -> Result<()> {
    let output = run(workspace_root, &["merge", source_branch, "--no-edit"])?;
    if !output.status.success() {
        let stderr = stderr_of(&output);
        if stderr.contains("CONFLICT") || stderr.contains("Automatic merge failed") {
            let _ = run(workspace_root, &["merge", "--abort"]);
            return Err(GitError::MergeConflict(format!("merge from {source_branch} failed: {stderr}")));
        }
        return Err(GitError::CommandFailed(format!("git merge {source_branch}: {stderr}")));
    }
    Ok(())
}

/// Rebase a source branch onto the target branch, then fast-forward the
/// target branch to include it, leaving a linear history instead of a merge
/// commit. Leaves `target_branch` checked out whether it succeeds or fails.
pub fn rebase_merge_branch(workspace_root: &Path, target_branch: &str, source_branch: &str) -> Result<()> {
    checkout_branch(workspace_root, source_branch)?;
    if let Err(err) = rebase_onto(workspace_root, target_branch) {
        let _ = checkout_branch(workspace_root, target_branch);
        return Err(err);
    }

    checkout_branch(workspace_root, target_branch)?;
    let output = run(workspace_root, &["merge", "--ff-only", source_branch])?;
    if !output.status.success() {
        return Err(GitError::CommandFailed(format!(
            "git merge --ff-only {source_branch}: {}",
            stderr_of(&output)
        )));
    }
    Ok(())
}

/// Squash merge a source branch into the current branch.
pub fn squash_merge_branch(workspace_root: &Path, source_branch: &str) -> Result<()> {
    let output = run(workspace_root, &["merge", "--squash", source_branch])?;
    if !output.status.success() {
        let stderr = stderr_of(&output);
        if stderr.contains("CONFLICT") || stderr.contains("Automatic merge failed") {
            let _ = run(workspace_root, &["reset", "--hard", "HEAD"]);
            return Err(GitError::MergeConflict(format!(
                "squash merge from {source_branch} failed: {stderr}"
            )));
        }
        return Err(GitError::CommandFailed(format!("git merge --squash {source_branch}: {stderr}")));
    }

    let status_output = run(workspace_root, &["diff", "--cached", "--quiet"])?;
    if !status_output.status.success() {
        let commit_msg = format!("Squash merge from {source_branch}");
        let commit_output = run(workspace_root, &["commit", "-m", &commit_msg])?;
        if !commit_output.status.success() {
            return Err(GitError::CommandFailed(format!(
                "git commit after squash: {}",
                stderr_of(&commit_output)
            )));
        }
    }
    Ok(())
}

/// Perform the merge-to-target flow once a unit's pull request is approved:
/// ensure the target branch exists, merge or squash from the unit branch,
/// and leave the target branch checked out.
pub fn merge_to_target(
    workspace_root: &Path,
    unit_branch: &str,
    target_branch: &str,
    base_branch: &str,
    strategy: MergeStrategy,
) -> Result<()> {
    if !is_working_tree_clean(workspace_root)? {
        return Err(GitError::DirtyWorkingTree("cannot merge with uncommitted changes".to_string()));
    }

    if !branch_exists(workspace_root, target_branch)? {
        create_branch(workspace_root, target_branch, base_branch)?;
    }

    checkout_branch(workspace_root, target_branch)?;

    let result = match strategy {
        MergeStrategy::Merge => merge_branch(workspace_root, unit_branch),
        MergeStrategy::Rebase => rebase_merge_branch(workspace_root, target_branch, unit_branch),
        MergeStrategy::Squash => squash_merge_branch(workspace_root, unit_branch),
    };

    if let Err(e) = &result {
        tracing::warn!(
            "merge failed, unit branch {} preserved for manual recovery: {}",
            unit_branch,
            e
        );
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn setup_test_repo() -> TempDir {
        let dir = TempDir::new().unwrap();
        Command::new("git").args(["init"]).current_dir(dir.path()).output().unwrap();
        Command::new("git").args(["config", "user.email", "test@test.com"]).current_dir(dir.path()).output().unwrap();
        Command::new("git").args(["config", "user.name", "Test"]).current_dir(dir.path()).output().unwrap();
        std::fs::write(dir.path().join("README.md"), "# Test").unwrap();
        Command::new("git").args(["add", "."]).current_dir(dir.path()).output().unwrap();
        Command::new("git").args(["commit", "-m", "Initial commit"]).current_dir(dir.path()).output().unwrap();
        dir
    }

    #[test]
    fn test_repo_name() {
        assert_eq!(repo_name(Path::new("/home/user/my-project")), "my-project");
        assert_eq!(repo_name(Path::new("/workspace")), "workspace");
    }

    #[test]
    fn test_expand_worktree_template_default() {
        let template = "../{{ repo }}.{{ branch | sanitize }}";
        let expanded = expand_worktree_template(template, Path::new("/home/user/my-project"), "unit/feature-x");
        assert_eq!(expanded, "../my-project.unit-feature-x");
    }

    #[test]
    fn test_slugify() {
        assert_eq!(slugify("My Feature"), "my-feature");
        assert_eq!(slugify("Fix Bug #123"), "fix-bug-123");
    }

    #[test]
    fn test_normalize_path() {
        let path = normalize_path(Path::new("/home/user/project/../other"));
        assert_eq!(path, PathBuf::from("/home/user/other"));
    }

    #[test]
    fn test_resolve_worktree_path_absolute() {
        let resolved = resolve_worktree_path("/absolute/path", Path::new("/workspace"));
        assert_eq!(resolved, PathBuf::from("/absolute/path"));
    }

    #[test]
    fn test_is_working_tree_clean() {
        let dir = setup_test_repo();
        assert!(is_working_tree_clean(dir.path()).unwrap());
        std::fs::write(dir.path().join("untracked.txt"), "data").unwrap();
        assert!(!is_working_tree_clean(dir.path()).unwrap());
    }

    #[test]
    fn test_checkout_branch() {
        let dir = setup_test_repo();
        create_branch(dir.path(), "feature", "HEAD").unwrap();
        checkout_branch(dir.path(), "feature").unwrap();
        let output = Command::new("git").args(["branch", "--show-current"]).current_dir(dir.path()).output().unwrap();
        assert_eq!(String::from_utf8_lossy(&output.stdout).trim(), "feature");
    }

    #[test]
    fn test_merge_branch_no_conflict() {
        let dir = setup_test_repo();
        create_branch(dir.path(), "feature", "HEAD").unwrap();
        checkout_branch(dir.path(), "feature").unwrap();
        std::fs::write(dir.path().join("feature.txt"), "feature content").unwrap();
        Command::new("git").args(["add", "feature.txt"]).current_dir(dir.path()).output().unwrap();
        Command::new("git").args(["commit", "-m", "Add feature"]).current_dir(dir.path()).output().unwrap();

        let main_branch = detect_default_branch(dir.path()).unwrap();
        checkout_branch(dir.path(), &main_branch).unwrap();
        merge_branch(dir.path(), "feature").unwrap();
        assert!(dir.path().join("feature.txt").exists());
    }

    #[test]
    fn test_squash_merge_branch() {
        let dir = setup_test_repo();
        create_branch(dir.path(), "feature", "HEAD").unwrap();
        checkout_branch(dir.path(), "feature").unwrap();
        std::fs::write(dir.path().join("file1.txt"), "content1").unwrap();
        Command::new("git").args(["add", "file1.txt"]).current_dir(dir.path()).output().unwrap();
        Command::new("git").args(["commit", "-m", "Add file1"]).current_dir(dir.path()).output().unwrap();

        let main_branch = detect_default_branch(dir.path()).unwrap();
        checkout_branch(dir.path(), &main_branch).unwrap();
        squash_merge_branch(dir.path(), "feature").unwrap();
        assert!(dir.path().join("file1.txt").exists());

        let output = Command::new("git").args(["rev-list", "--count", "HEAD"]).current_dir(dir.path()).output().unwrap();
        let count: i32 = String::from_utf8_lossy(&output.stdout).trim().parse().unwrap();
        assert_eq!(count, 2);
    }

    #[test]
    fn test_rebase_merge_branch_produces_linear_history() {
        let dir = setup_test_repo();
        let main_branch = detect_default_branch(dir.path()).unwrap();

        create_branch(dir.path(), "feature", "HEAD").unwrap();
        checkout_branch(dir.path(), "feature").unwrap();
        std::fs::write(dir.path().join("feature.txt"), "feature content").unwrap();
        Command::new("git").args(["add", "feature.txt"]).current_dir(dir.path()).output().unwrap();
        Command::new("git").args(["commit", "-m", "Add feature"]).current_dir(dir.path()).output().unwrap();

        checkout_branch(dir.path(), &main_branch).unwrap();
        std::fs::write(dir.path().join("main.txt"), "main content").unwrap();
        Command::new("git").args(["add", "main.txt"]).current_dir(dir.path()).output().unwrap();
        Command::new("git").args(["commit", "-m", "Add main file"]).current_dir(dir.path()).output().unwrap();

        rebase_merge_branch(dir.path(), &main_branch, "feature").unwrap();
        assert!(dir.path().join("feature.txt").exists());
        assert!(dir.path().join("main.txt").exists());

        let output = Command::new("git").args(["branch", "--show-current"]).current_dir(dir.path()).output().unwrap();
        assert_eq!(String::from_utf8_lossy(&output.stdout).trim(), main_branch);

        // No merge commit: the rebased feature commit lands directly on top
        // of main's history.
        let output = Command::new("git")
            .args(["log", "--merges", "--oneline"])
            .current_dir(dir.path())
            .output()
            .unwrap();
        assert!(String::from_utf8_lossy(&output.stdout).trim().is_empty());
    }

    #[test]
    fn test_merge_to_target_creates_branch() {
        let dir = setup_test_repo();
        create_branch(dir.path(), "unit/test", "HEAD").unwrap();
        checkout_branch(dir.path(), "unit/test").unwrap();
        std::fs::write(dir.path().join("run.txt"), "run content").unwrap();
        Command::new("git").args(["add", "run.txt"]).current_dir(dir.path()).output().unwrap();
        Command::new("git").args(["commit", "-m", "Unit changes"]).current_dir(dir.path()).output().unwrap();

        let main_branch = detect_default_branch(dir.path()).unwrap();
        checkout_branch(dir.path(), &main_branch).unwrap();

        merge_to_target(dir.path(), "unit/test", "agent/my-feature", &main_branch, MergeStrategy::Squash).unwrap();

        assert!(branch_exists(dir.path(), "agent/my-feature").unwrap());
        assert!(dir.path().join("run.txt").exists());
    }

    #[test]
    fn test_merge_to_target_dirty_tree_fails() {
        let dir = setup_test_repo();
        std::fs::write(dir.path().join("dirty.txt"), "uncommitted").unwrap();

        let main_branch = detect_default_branch(dir.path()).unwrap();
        let result = merge_to_target(dir.path(), "nonexistent", "target", &main_branch, MergeStrategy::Merge);
        assert!(matches!(result, Err(GitError::DirtyWorkingTree(_))));
    }

    #[test]
    fn rebase_in_progress_false_on_clean_repo() {
        let dir = setup_test_repo();
        assert!(!rebase_in_progress(dir.path()));
    }

    #[test]
    fn unmerged_files_empty_on_clean_repo() {
        let dir = setup_test_repo();
        assert!(unmerged_files(dir.path()).unwrap().is_empty());
    }
}
