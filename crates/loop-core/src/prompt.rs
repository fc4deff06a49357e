//! Prompt assembly for coding-agent invocations.

use std::path::Path;

/// Generate a slug from a spec path for naming purposes.
pub fn spec_slug(spec_path: &Path) -> String {
    spec_path
        .file_stem()
        .and_then(|s| s.to_str())
        .map(|s| {
            s.chars()
                .map(|c| if c.is_alphanumeric() { c } else { '-' })
                .collect::<String>()
                .to_lowercase()
        })
        .unwrap_or_else(|| "unnamed".to_string())
}

/// Sanitize a branch name for filesystem use (replace slashes with dashes).
pub fn sanitize_branch_name(branch: &str) -> String {
    branch.replace('/', "-")
}

/// One task in the ready set, as enumerated in the task-loop prompt.
#[derive(Debug, Clone)]
pub struct ReadyTaskSummary<'a> {
    pub task_number: u32,
    pub title: &'a str,
    pub spec_path: &'a str,
    pub validation: &'a str,
}

/// Build the prompt handed to the coding agent for one task-loop iteration.
///
/// Enumerates every ready task and lets the agent pick exactly one to
/// implement; the worker discovers which one advanced by re-reading task
/// headers afterward, not from the agent's choice of words.
pub fn task_prompt(unit_title: &str, ready: &[ReadyTaskSummary<'_>], attempt: u32) -> String {
    let mut listing = String::new();
    for task in ready {
        listing.push_str(&format!(
            "- task {}: {} (spec: {}, validation: `{}`)\n",
            task.task_number, task.title, task.spec_path, task.validation
        ));
    }

    let retry_note = if attempt <= 1 {
        String::new()
    } else {
        format!(
            "\nThis is attempt {attempt}: a previous invocation returned without completing any of these tasks. Re-read them and finish the remaining work."
        )
    };

    format!(
        "Unit: {unit_title}\n\nThe following tasks are ready to implement. Choose exactly one, implement it, and run its validation command until it passes:\n\n{listing}\nDo not run tests in watch mode.\n\nWhen the chosen task is done, update its status field to \"complete\" in its own spec file header. If you cannot complete it, set status to \"failed\" and record why in the error field.{retry_note}"
    )
}

/// Build the prompt handed to the coding agent to fix a failing baseline
/// check, including the command's captured tail output.
pub fn baseline_fix_prompt(failing_command: &str, tail_output: &str) -> String {
    format!(
        "The baseline check `{failing_command}` is failing. Fix the underlying issue without reverting completed task work.\n\n--- command output (tail) ---\n{tail_output}"
    )
}

/// Build the prompt handed to the coding agent to resolve a merge conflict.
pub fn conflict_resolution_prompt(unit_title: &str, unmerged_files: &[String]) -> String {
    let files = unmerged_files.join("\n- ");
    format!(
        "Unit: {unit_title}\n\nRebasing this branch produced merge conflicts in the following files:\n- {files}\n\nResolve the conflicts, keeping the intent of both sides where they overlap, then stage the resolved files. Do not run `git rebase --abort`."
    )
}

/// Build the prompt handed to the coding agent to open a pull request for a
/// completed unit, once every task is complete and baseline checks pass.
pub fn pr_creation_prompt(unit_title: &str, branch: &str, target_branch: &str, completed_tasks: &[&str]) -> String {
    let summary = completed_tasks
        .iter()
        .map(|t| format!("- {t}"))
        .collect::<Vec<_>>()
        .join("\n");
    format!(
        "Unit: {unit_title}\n\nEvery task in this unit is complete and baseline checks pass. Push branch `{branch}` and open a pull request against `{target_branch}` summarizing the following completed work:\n\n{summary}\n\nWrite a concise title and description; do not include this prompt in the PR body."
    )
}

/// Build the prompt handed to the coding agent when reviewer comments are
/// left on an open pull request (review state `changes_requested`).
pub fn review_feedback_prompt(unit_title: &str, comments: &[(String, String)]) -> String {
    let listing = comments
        .iter()
        .map(|(author, body)| format!("- {author}: {body}"))
        .collect::<Vec<_>>()
        .join("\n");
    format!(
        "Unit: {unit_title}\n\nThe open pull request received review feedback:\n\n{listing}\n\nAddress every comment, then commit and leave the branch ready to be pushed again. Do not open a new pull request."
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spec_slug_extracts_name() {
        assert_eq!(spec_slug(Path::new("specs/my-feature.md")), "my-feature");
        assert_eq!(
            spec_slug(Path::new("/path/to/orchestrator-daemon.md")),
            "orchestrator-daemon"
        );
        assert_eq!(spec_slug(Path::new("no_extension")), "no-extension");
    }

    #[test]
    fn sanitize_branch_name_replaces_slashes() {
        assert_eq!(sanitize_branch_name("run/my-feature"), "run-my-feature");
        assert_eq!(sanitize_branch_name("feature/sub/deep"), "feature-sub-deep");
        assert_eq!(sanitize_branch_name("no-slashes"), "no-slashes");
    }

    #[test]
    fn task_prompt_first_attempt_has_no_retry_language() {
        let ready = [ReadyTaskSummary {
            task_number: 1,
            title: "Write login handler",
            spec_path: "specs/add-auth/01-login.md",
            validation: "cargo test login",
        }];
        let prompt = task_prompt("Add auth", &ready, 1);
        assert!(!prompt.contains("attempt 1:"));
        assert!(prompt.contains("Write login handler"));
        assert!(prompt.contains("watch mode"));
    }

    #[test]
    fn task_prompt_retry_mentions_attempt_number() {
        let ready = [ReadyTaskSummary {
            task_number: 1,
            title: "Write login handler",
            spec_path: "specs/add-auth/01-login.md",
            validation: "cargo test login",
        }];
        let prompt = task_prompt("Add auth", &ready, 2);
        assert!(prompt.contains("attempt 2"));
    }

    #[test]
    fn task_prompt_enumerates_every_ready_task() {
        let ready = [
            ReadyTaskSummary {
                task_number: 1,
                title: "First",
                spec_path: "specs/u/01.md",
                validation: "true",
            },
            ReadyTaskSummary {
                task_number: 2,
                title: "Second",
                spec_path: "specs/u/02.md",
                validation: "true",
            },
        ];
        let prompt = task_prompt("Add auth", &ready, 1);
        assert!(prompt.contains("First"));
        assert!(prompt.contains("Second"));
    }

    #[test]
    fn conflict_resolution_prompt_lists_files() {
        let prompt = conflict_resolution_prompt(
            "Add auth",
            &["src/lib.rs".to_string(), "src/main.rs".to_string()],
        );
        assert!(prompt.contains("src/lib.rs"));
        assert!(prompt.contains("src/main.rs"));
    }

    #[test]
    fn pr_creation_prompt_includes_branch_and_target() {
        let prompt = pr_creation_prompt("Add auth", "unit/add-auth-1a2b", "main", &["task 1: login"]);
        assert!(prompt.contains("unit/add-auth-1a2b"));
        assert!(prompt.contains("main"));
        assert!(prompt.contains("task 1: login"));
    }

    #[test]
    fn review_feedback_prompt_lists_every_comment() {
        let prompt = review_feedback_prompt(
            "Add auth",
            &[("alice".to_string(), "please add a test".to_string())],
        );
        assert!(prompt.contains("alice"));
        assert!(prompt.contains("please add a test"));
    }
}
