//! Git-host API access via the `gh` CLI subprocess (spec Section 4.3/6).
//!
//! Every operation here shells out to `gh` rather than talking to a REST or
//! GraphQL endpoint directly: authentication (token from environment or a
//! logged-in `gh` session), retries, and pagination are all handled by the
//! CLI. This module only knows how to invoke it and parse its `--json`
//! output.

use std::path::Path;
use std::process::Stdio;

use loop_core::types::{MergeStrategy, ReviewState};
use serde::Deserialize;
use thiserror::Error;
use tokio::process::Command;
use tracing::warn;

#[derive(Debug, Error)]
pub enum PrHostError {
    #[error("gh CLI not found on PATH")]
    GhNotFound,
    #[error("gh command failed: {0}")]
    CommandFailed(String),
    #[error("failed to parse gh output: {0}")]
    InvalidJson(#[from] serde_json::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("could not determine PR number from: {0}")]
    UnparsablePrNumber(String),
}

pub type Result<T> = std::result::Result<T, PrHostError>;

async fn run(workspace_root: &Path, args: &[&str]) -> Result<std::process::Output> {
    Command::new("gh")
        .args(args)
        .current_dir(workspace_root)
        .stdin(Stdio::null())
        .output()
        .await
        .map_err(|err| {
            if err.kind() == std::io::ErrorKind::NotFound {
                PrHostError::GhNotFound
            } else {
                PrHostError::Io(err)
            }
        })
}

/// Create a pull request for `head_branch` against `base_branch`. Returns
/// the host-assigned PR number and its web URL.
pub async fn create_pr(
    workspace_root: &Path,
    head_branch: &str,
    base_branch: &str,
    title: &str,
    body: &str,
) -> Result<(u64, String)> {
    let output = run(
        workspace_root,
        &[
            "pr", "create", "--head", head_branch, "--base", base_branch, "--title", title, "--body", body,
        ],
    )
    .await?;

    if !output.status.success() {
        return Err(PrHostError::CommandFailed(
            String::from_utf8_lossy(&output.stderr).to_string(),
        ));
    }

    let url = String::from_utf8_lossy(&output.stdout).trim().to_string();
    let number = pr_number_from_url(&url)
        .ok_or_else(|| PrHostError::UnparsablePrNumber(url.clone()))?;
    Ok((number, url))
}

fn pr_number_from_url(url: &str) -> Option<u64> {
    url.trim_end_matches('/').rsplit('/').next()?.parse().ok()
}

#[derive(Debug, Deserialize)]
struct PrForBranchResponse {
    number: u64,
    url: String,
}

/// Resolve the PR number and URL for a branch that already has an open pull
/// request, without trusting the agent's free-text output to report it.
pub async fn pr_number_for_branch(workspace_root: &Path, branch: &str) -> Result<(u64, String)> {
    let output = run(
        workspace_root,
        &["pr", "view", branch, "--json", "number,url"],
    )
    .await?;

    if !output.status.success() {
        return Err(PrHostError::CommandFailed(
            String::from_utf8_lossy(&output.stderr).to_string(),
        ));
    }

    let parsed: PrForBranchResponse = serde_json::from_slice(&output.stdout)?;
    Ok((parsed.number, parsed.url))
}

#[derive(Debug, Deserialize)]
struct ReactionUsers {
    #[serde(rename = "totalCount")]
    total_count: u32,
}

#[derive(Debug, Deserialize)]
struct ReactionGroup {
    content: String,
    users: ReactionUsers,
}

#[derive(Debug, Deserialize)]
struct PrViewResponse {
    #[serde(rename = "reactionGroups", default)]
    reaction_groups: Vec<ReactionGroup>,
    #[serde(default)]
    comments: Vec<serde_json::Value>,
}

/// One reviewer comment surfaced back to the coding agent as feedback, in
/// the order `gh` returned them.
#[derive(Debug, Clone)]
pub struct ReviewComment {
    pub author: String,
    pub body: String,
}

/// Poll the derived review state of an open pull request, applying the
/// precedence rule: approved (👍 reaction) > in-progress (👀 reaction) >
/// changes-requested (review comments present, no 👍) > pending.
pub async fn review_state(workspace_root: &Path, pr_number: u64) -> Result<ReviewState> {
    let output = run(
        workspace_root,
        &[
            "pr",
            "view",
            &pr_number.to_string(),
            "--json",
            "reactionGroups,comments",
        ],
    )
    .await?;

    if !output.status.success() {
        return Err(PrHostError::CommandFailed(
            String::from_utf8_lossy(&output.stderr).to_string(),
        ));
    }

    let parsed: PrViewResponse = serde_json::from_slice(&output.stdout)?;

    let has_thumbs_up = parsed
        .reaction_groups
        .iter()
        .any(|g| g.content == "THUMBS_UP" && g.users.total_count > 0);
    let has_eyes = parsed
        .reaction_groups
        .iter()
        .any(|g| g.content == "EYES" && g.users.total_count > 0);
    let has_comments = !parsed.comments.is_empty();

    Ok(if has_thumbs_up {
        ReviewState::Approved
    } else if has_eyes {
        ReviewState::InProgress
    } else if has_comments {
        ReviewState::ChangesRequested
    } else {
        ReviewState::Pending
    })
}

/// Fetch review comments to hand to the agent as feedback when
/// `review_state` comes back `ChangesRequested`.
pub async fn list_review_comments(workspace_root: &Path, pr_number: u64) -> Result<Vec<ReviewComment>> {
    #[derive(Debug, Deserialize)]
    struct CommentsResponse {
        #[serde(default)]
        comments: Vec<RawComment>,
    }
    #[derive(Debug, Deserialize)]
    struct RawComment {
        author: RawAuthor,
        body: String,
    }
    #[derive(Debug, Deserialize)]
    struct RawAuthor {
        login: String,
    }

    let output = run(
        workspace_root,
        &["pr", "view", &pr_number.to_string(), "--json", "comments"],
    )
    .await?;

    if !output.status.success() {
        return Err(PrHostError::CommandFailed(
            String::from_utf8_lossy(&output.stderr).to_string(),
        ));
    }

    let parsed: CommentsResponse = serde_json::from_slice(&output.stdout)?;
    Ok(parsed
        .comments
        .into_iter()
        .map(|c| ReviewComment {
            author: c.author.login,
            body: c.body,
        })
        .collect())
}

/// Squash-merge an approved pull request, returning the resulting merge
/// commit SHA.
pub async fn squash_merge(workspace_root: &Path, pr_number: u64) -> Result<String> {
    merge_pr(workspace_root, pr_number, MergeStrategy::Squash).await
}

/// Merge an approved pull request using the unit's configured strategy,
/// returning the resulting merge commit SHA.
pub async fn merge_pr(workspace_root: &Path, pr_number: u64, strategy: MergeStrategy) -> Result<String> {
    let strategy_flag = match strategy {
        MergeStrategy::Squash => "--squash",
        MergeStrategy::Merge => "--merge",
        MergeStrategy::Rebase => "--rebase",
    };

    let output = run(
        workspace_root,
        &["pr", "merge", &pr_number.to_string(), strategy_flag, "--delete-branch=false"],
    )
    .await?;

    if !output.status.success() {
        return Err(PrHostError::CommandFailed(
            String::from_utf8_lossy(&output.stderr).to_string(),
        ));
    }

    merge_commit_sha(workspace_root, pr_number).await
}

async fn merge_commit_sha(workspace_root: &Path, pr_number: u64) -> Result<String> {
    #[derive(Debug, Deserialize)]
    struct MergeCommitResponse {
        #[serde(rename = "mergeCommit")]
        merge_commit: Option<MergeCommitOid>,
    }
    #[derive(Debug, Deserialize)]
    struct MergeCommitOid {
        oid: String,
    }

    let output = run(
        workspace_root,
        &["pr", "view", &pr_number.to_string(), "--json", "mergeCommit"],
    )
    .await?;

    if !output.status.success() {
        warn!(pr_number, "could not re-query merge commit after merge");
        return Ok(String::new());
    }

    let parsed: MergeCommitResponse = serde_json::from_slice(&output.stdout)?;
    Ok(parsed.merge_commit.map(|c| c.oid).unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pr_number_parses_from_trailing_path_segment() {
        assert_eq!(pr_number_from_url("https://github.com/acme/repo/pull/42"), Some(42));
        assert_eq!(pr_number_from_url("https://github.com/acme/repo/pull/42/"), Some(42));
        assert_eq!(pr_number_from_url("not a url"), None);
    }

    #[test]
    fn review_state_precedence_parses_from_json() {
        let parsed: PrViewResponse = serde_json::from_str(
            r#"{"reactionGroups":[{"content":"THUMBS_UP","users":{"totalCount":1}},{"content":"EYES","users":{"totalCount":0}}],"comments":[]}"#,
        )
        .unwrap();
        let has_thumbs_up = parsed
            .reaction_groups
            .iter()
            .any(|g| g.content == "THUMBS_UP" && g.users.total_count > 0);
        assert!(has_thumbs_up);
    }
}
