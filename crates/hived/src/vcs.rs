//! Typed operations against a repository host.
//!
//! One narrow command surface over `gh` (GitHub) or `glab` (GitLab),
//! selected by the origin URL. Every call runs under a timeout; non-zero
//! exits surface as typed errors carrying stderr.

use async_trait::async_trait;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;
use tracing::debug;

#[derive(Debug, Error)]
pub enum VcsError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("{command} failed: {stderr}")]
    CommandFailed { command: String, stderr: String },
    #[error("{command} timed out after {timeout:?}")]
    Timeout { command: String, timeout: Duration },
    #[error("unexpected output from {command}: {detail}")]
    Parse { command: String, detail: String },
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, VcsError>;

/// Merge/pull request state, normalized across hosts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MrState {
    Merged,
    Open,
    Closed,
}

impl MrState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Merged => "MERGED",
            Self::Open => "OPEN",
            Self::Closed => "CLOSED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_uppercase().as_str() {
            "MERGED" => Some(Self::Merged),
            "OPEN" | "OPENED" => Some(Self::Open),
            "CLOSED" => Some(Self::Closed),
            _ => None,
        }
    }
}

/// A created merge/pull request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeRequest {
    pub number: i64,
    pub url: String,
}

/// Review verdict submitted through the host API.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReviewEvent {
    Approve,
    RequestChanges,
}

/// A top-level review on a merge request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReviewInfo {
    pub id: String,
    /// Normalized: APPROVED | CHANGES_REQUESTED | COMMENTED.
    pub state: String,
    pub body: String,
    pub author: String,
    pub submitted_at: Option<String>,
}

/// A per-file inline review comment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InlineComment {
    pub path: String,
    pub line: i64,
    pub body: String,
    pub author: String,
    pub created_at: Option<String>,
}

/// Parameters for creating a merge request.
#[derive(Debug, Clone)]
pub struct CreateMr<'a> {
    pub cwd: &'a Path,
    pub title: &'a str,
    pub body: &'a str,
    pub base: &'a str,
    pub head: Option<&'a str>,
}

/// Narrow host abstraction consumed by the worker pipelines.
#[async_trait]
pub trait VcsHost: Send + Sync {
    async fn create_mr(&self, params: CreateMr<'_>) -> Result<MergeRequest>;
    /// Squash-merge and delete the source branch. Returns whether the
    /// merge went through.
    async fn merge_mr(&self, cwd: &Path, number: i64) -> Result<bool>;
    async fn mr_state(&self, cwd: &Path, number: i64) -> Result<Option<MrState>>;
    async fn mr_diff(&self, cwd: &Path, number: i64) -> Result<String>;
    async fn mr_files(&self, cwd: &Path, number: i64) -> Result<Vec<String>>;
    async fn submit_review(
        &self,
        cwd: &Path,
        number: i64,
        event: ReviewEvent,
        body: &str,
    ) -> Result<()>;
    async fn post_review_comment(&self, cwd: &Path, number: i64, body: &str) -> Result<()>;
    async fn fetch_reviews(&self, cwd: &Path, number: i64) -> Result<Vec<ReviewInfo>>;
    async fn fetch_inline_comments(&self, cwd: &Path, number: i64) -> Result<Vec<InlineComment>>;
    async fn comment_on_issue(&self, cwd: &Path, number: i64, body: &str) -> Result<()>;
    /// Issue state for `owner/repo`, normalized uppercase (OPEN | CLOSED).
    async fn issue_status(&self, owner_repo: &str, number: i64) -> Result<String>;
    /// Raw API escape hatch.
    async fn api(
        &self,
        cwd: &Path,
        endpoint: &str,
        timeout: Option<Duration>,
    ) -> Result<serde_json::Value>;
}

/// Pick a host implementation by scanning the origin URL.
pub fn detect_host(parent: &Path, timeout: Duration) -> Box<dyn VcsHost> {
    host_for_url(&origin_url(parent), timeout)
}

fn origin_url(parent: &Path) -> String {
    std::process::Command::new("git")
        .args(["remote", "get-url", "origin"])
        .current_dir(parent)
        .output()
        .ok()
        .filter(|o| o.status.success())
        .map(|o| String::from_utf8_lossy(&o.stdout).trim().to_string())
        .unwrap_or_default()
}

/// Host that re-detects gh vs glab per call from the working directory's
/// origin remote. Repositories from different hosts can share one daemon.
#[derive(Debug, Clone)]
pub struct AutoVcs {
    timeout: Duration,
}

impl AutoVcs {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    fn select(&self, cwd: &Path) -> Box<dyn VcsHost> {
        detect_host(cwd, self.timeout)
    }
}

#[async_trait]
impl VcsHost for AutoVcs {
    async fn create_mr(&self, params: CreateMr<'_>) -> Result<MergeRequest> {
        self.select(params.cwd).create_mr(params.clone()).await
    }
    async fn merge_mr(&self, cwd: &Path, number: i64) -> Result<bool> {
        self.select(cwd).merge_mr(cwd, number).await
    }
    async fn mr_state(&self, cwd: &Path, number: i64) -> Result<Option<MrState>> {
        self.select(cwd).mr_state(cwd, number).await
    }
    async fn mr_diff(&self, cwd: &Path, number: i64) -> Result<String> {
        self.select(cwd).mr_diff(cwd, number).await
    }
    async fn mr_files(&self, cwd: &Path, number: i64) -> Result<Vec<String>> {
        self.select(cwd).mr_files(cwd, number).await
    }
    async fn submit_review(
        &self,
        cwd: &Path,
        number: i64,
        event: ReviewEvent,
        body: &str,
    ) -> Result<()> {
        self.select(cwd).submit_review(cwd, number, event, body).await
    }
    async fn post_review_comment(&self, cwd: &Path, number: i64, body: &str) -> Result<()> {
        self.select(cwd).post_review_comment(cwd, number, body).await
    }
    async fn fetch_reviews(&self, cwd: &Path, number: i64) -> Result<Vec<ReviewInfo>> {
        self.select(cwd).fetch_reviews(cwd, number).await
    }
    async fn fetch_inline_comments(&self, cwd: &Path, number: i64) -> Result<Vec<InlineComment>> {
        self.select(cwd).fetch_inline_comments(cwd, number).await
    }
    async fn comment_on_issue(&self, cwd: &Path, number: i64, body: &str) -> Result<()> {
        self.select(cwd).comment_on_issue(cwd, number, body).await
    }
    async fn issue_status(&self, owner_repo: &str, number: i64) -> Result<String> {
        // No working directory to scan; GitHub syntax is the default.
        GithubCli::new(self.timeout).issue_status(owner_repo, number).await
    }
    async fn api(
        &self,
        cwd: &Path,
        endpoint: &str,
        timeout: Option<Duration>,
    ) -> Result<serde_json::Value> {
        self.select(cwd).api(cwd, endpoint, timeout).await
    }
}

/// Host selection from a remote URL. GitHub is the fallback.
pub fn host_for_url(url: &str, timeout: Duration) -> Box<dyn VcsHost> {
    if url.contains("gitlab") {
        Box::new(GitlabCli::new(timeout))
    } else {
        Box::new(GithubCli::new(timeout))
    }
}

async fn run_cli(
    bin: &Path,
    cwd: &Path,
    args: &[&str],
    timeout: Duration,
) -> Result<String> {
    let command = format!("{} {}", bin.display(), args.join(" "));
    debug!(%command, "running vcs command");

    let mut cmd = Command::new(bin);
    cmd.args(args)
        .current_dir(cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let output = tokio::time::timeout(timeout, cmd.output())
        .await
        .map_err(|_| VcsError::Timeout {
            command: command.clone(),
            timeout,
        })??;

    if !output.status.success() {
        return Err(VcsError::CommandFailed {
            command,
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

/// Trailing number of an MR/PR URL (`.../pull/101` or `.../merge_requests/7`).
fn number_from_url(url: &str) -> Option<i64> {
    url.trim_end_matches('/')
        .rsplit('/')
        .next()
        .and_then(|tail| tail.parse().ok())
}

// --- GitHub (`gh`) ---

#[derive(Debug, Clone)]
pub struct GithubCli {
    bin: PathBuf,
    timeout: Duration,
}

impl GithubCli {
    pub fn new(timeout: Duration) -> Self {
        Self {
            bin: PathBuf::from("gh"),
            timeout,
        }
    }

    async fn gh(&self, cwd: &Path, args: &[&str]) -> Result<String> {
        run_cli(&self.bin, cwd, args, self.timeout).await
    }
}

#[derive(Deserialize)]
struct GhReviewList {
    #[serde(default)]
    reviews: Vec<GhReview>,
}

#[derive(Deserialize)]
struct GhReview {
    #[serde(default)]
    id: serde_json::Value,
    #[serde(default)]
    state: String,
    #[serde(default)]
    body: String,
    #[serde(default)]
    author: GhAuthor,
    #[serde(rename = "submittedAt", default)]
    submitted_at: Option<String>,
}

#[derive(Deserialize, Default)]
struct GhAuthor {
    #[serde(default)]
    login: String,
}

#[derive(Deserialize)]
struct GhInlineComment {
    #[serde(default)]
    path: String,
    #[serde(default)]
    line: Option<i64>,
    #[serde(default)]
    original_line: Option<i64>,
    #[serde(default)]
    body: String,
    #[serde(default)]
    user: GhUser,
    #[serde(default)]
    created_at: Option<String>,
}

#[derive(Deserialize, Default)]
struct GhUser {
    #[serde(default)]
    login: String,
}

#[async_trait]
impl VcsHost for GithubCli {
    async fn create_mr(&self, params: CreateMr<'_>) -> Result<MergeRequest> {
        let mut args = vec![
            "pr",
            "create",
            "--title",
            params.title,
            "--body",
            params.body,
            "--base",
            params.base,
        ];
        if let Some(head) = params.head {
            args.push("--head");
            args.push(head);
        }
        let url = self.gh(params.cwd, &args).await?;
        let number = number_from_url(&url).ok_or_else(|| VcsError::Parse {
            command: "gh pr create".to_string(),
            detail: format!("no PR number in {url}"),
        })?;
        Ok(MergeRequest { number, url })
    }

    async fn merge_mr(&self, cwd: &Path, number: i64) -> Result<bool> {
        let num = number.to_string();
        match self
            .gh(cwd, &["pr", "merge", &num, "--squash", "--delete-branch"])
            .await
        {
            Ok(_) => Ok(true),
            Err(VcsError::CommandFailed { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn mr_state(&self, cwd: &Path, number: i64) -> Result<Option<MrState>> {
        let num = number.to_string();
        let out = self
            .gh(cwd, &["pr", "view", &num, "--json", "state", "-q", ".state"])
            .await;
        match out {
            Ok(state) => Ok(MrState::parse(&state)),
            Err(VcsError::CommandFailed { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn mr_diff(&self, cwd: &Path, number: i64) -> Result<String> {
        let num = number.to_string();
        self.gh(cwd, &["pr", "diff", &num]).await
    }

    async fn mr_files(&self, cwd: &Path, number: i64) -> Result<Vec<String>> {
        let num = number.to_string();
        let out = self
            .gh(
                cwd,
                &["pr", "view", &num, "--json", "files", "-q", ".files[].path"],
            )
            .await?;
        Ok(out.lines().filter(|l| !l.is_empty()).map(String::from).collect())
    }

    async fn submit_review(
        &self,
        cwd: &Path,
        number: i64,
        event: ReviewEvent,
        body: &str,
    ) -> Result<()> {
        let num = number.to_string();
        let flag = match event {
            ReviewEvent::Approve => "--approve",
            ReviewEvent::RequestChanges => "--request-changes",
        };
        self.gh(cwd, &["pr", "review", &num, flag, "--body", body])
            .await?;
        Ok(())
    }

    async fn post_review_comment(&self, cwd: &Path, number: i64, body: &str) -> Result<()> {
        let num = number.to_string();
        self.gh(cwd, &["pr", "comment", &num, "--body", body]).await?;
        Ok(())
    }

    async fn fetch_reviews(&self, cwd: &Path, number: i64) -> Result<Vec<ReviewInfo>> {
        let num = number.to_string();
        let out = self
            .gh(cwd, &["pr", "view", &num, "--json", "reviews"])
            .await?;
        let parsed: GhReviewList = serde_json::from_str(&out)?;
        Ok(parsed.reviews.into_iter().map(|r| ReviewInfo {
            id: r.id.to_string(),
            state: r.state,
            body: r.body,
            author: r.author.login,
            submitted_at: r.submitted_at,
        }).collect())
    }

    async fn fetch_inline_comments(&self, cwd: &Path, number: i64) -> Result<Vec<InlineComment>> {
        let endpoint = format!("repos/{{owner}}/{{repo}}/pulls/{number}/comments");
        let out = self.gh(cwd, &["api", &endpoint]).await?;
        let parsed: Vec<GhInlineComment> = serde_json::from_str(&out)?;
        Ok(parsed
            .into_iter()
            .map(|c| InlineComment {
                path: c.path,
                line: c.line.or(c.original_line).unwrap_or(0),
                body: c.body,
                author: c.user.login,
                created_at: c.created_at,
            })
            .collect())
    }

    async fn comment_on_issue(&self, cwd: &Path, number: i64, body: &str) -> Result<()> {
        let num = number.to_string();
        self.gh(cwd, &["issue", "comment", &num, "--body", body])
            .await?;
        Ok(())
    }

    async fn issue_status(&self, owner_repo: &str, number: i64) -> Result<String> {
        let num = number.to_string();
        let out = self
            .gh(
                Path::new("."),
                &[
                    "issue", "view", &num, "--repo", owner_repo, "--json", "state", "-q", ".state",
                ],
            )
            .await?;
        Ok(out.to_uppercase())
    }

    async fn api(
        &self,
        cwd: &Path,
        endpoint: &str,
        timeout: Option<Duration>,
    ) -> Result<serde_json::Value> {
        let out = run_cli(
            &self.bin,
            cwd,
            &["api", endpoint],
            timeout.unwrap_or(self.timeout),
        )
        .await?;
        Ok(serde_json::from_str(&out)?)
    }
}

// --- GitLab (`glab`) ---

#[derive(Debug, Clone)]
pub struct GitlabCli {
    bin: PathBuf,
    timeout: Duration,
}

impl GitlabCli {
    pub fn new(timeout: Duration) -> Self {
        Self {
            bin: PathBuf::from("glab"),
            timeout,
        }
    }

    async fn glab(&self, cwd: &Path, args: &[&str]) -> Result<String> {
        run_cli(&self.bin, cwd, args, self.timeout).await
    }
}

#[async_trait]
impl VcsHost for GitlabCli {
    async fn create_mr(&self, params: CreateMr<'_>) -> Result<MergeRequest> {
        let mut args = vec![
            "mr",
            "create",
            "--title",
            params.title,
            "--description",
            params.body,
            "--target-branch",
            params.base,
            "--yes",
        ];
        if let Some(head) = params.head {
            args.push("--source-branch");
            args.push(head);
        }
        let out = self.glab(params.cwd, &args).await?;
        // glab prints the MR URL on the last line.
        let url = out.lines().last().unwrap_or_default().trim().to_string();
        let number = number_from_url(&url).ok_or_else(|| VcsError::Parse {
            command: "glab mr create".to_string(),
            detail: format!("no MR number in {url}"),
        })?;
        Ok(MergeRequest { number, url })
    }

    async fn merge_mr(&self, cwd: &Path, number: i64) -> Result<bool> {
        let num = number.to_string();
        match self
            .glab(
                cwd,
                &["mr", "merge", &num, "--squash", "--remove-source-branch", "--yes"],
            )
            .await
        {
            Ok(_) => Ok(true),
            Err(VcsError::CommandFailed { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn mr_state(&self, cwd: &Path, number: i64) -> Result<Option<MrState>> {
        let num = number.to_string();
        let out = self
            .glab(cwd, &["mr", "view", &num, "--output", "json"])
            .await;
        match out {
            Ok(raw) => {
                let value: serde_json::Value = serde_json::from_str(&raw)?;
                Ok(value
                    .get("state")
                    .and_then(serde_json::Value::as_str)
                    .and_then(MrState::parse))
            }
            Err(VcsError::CommandFailed { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn mr_diff(&self, cwd: &Path, number: i64) -> Result<String> {
        let num = number.to_string();
        self.glab(cwd, &["mr", "diff", &num]).await
    }

    async fn mr_files(&self, cwd: &Path, number: i64) -> Result<Vec<String>> {
        let endpoint = format!("projects/:id/merge_requests/{number}/changes");
        let value = self.api(cwd, &endpoint, None).await?;
        Ok(value
            .get("changes")
            .and_then(serde_json::Value::as_array)
            .map(|changes| {
                changes
                    .iter()
                    .filter_map(|c| c.get("new_path").and_then(serde_json::Value::as_str))
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn submit_review(
        &self,
        cwd: &Path,
        number: i64,
        event: ReviewEvent,
        body: &str,
    ) -> Result<()> {
        let num = number.to_string();
        match event {
            ReviewEvent::Approve => {
                self.glab(cwd, &["mr", "note", &num, "--message", body]).await?;
                self.glab(cwd, &["mr", "approve", &num]).await?;
            }
            ReviewEvent::RequestChanges => {
                self.glab(cwd, &["mr", "note", &num, "--message", body]).await?;
            }
        }
        Ok(())
    }

    async fn post_review_comment(&self, cwd: &Path, number: i64, body: &str) -> Result<()> {
        let num = number.to_string();
        self.glab(cwd, &["mr", "note", &num, "--message", body]).await?;
        Ok(())
    }

    async fn fetch_reviews(&self, cwd: &Path, number: i64) -> Result<Vec<ReviewInfo>> {
        let endpoint = format!("projects/:id/merge_requests/{number}/approvals");
        let value = self.api(cwd, &endpoint, None).await?;
        let approved = value
            .get("approved")
            .and_then(serde_json::Value::as_bool)
            .unwrap_or(false);
        let state = if approved { "APPROVED" } else { "COMMENTED" };
        Ok(value
            .get("approved_by")
            .and_then(serde_json::Value::as_array)
            .map(|users| {
                users
                    .iter()
                    .filter_map(|u| u.get("user"))
                    .map(|user| ReviewInfo {
                        id: user
                            .get("id")
                            .map(std::string::ToString::to_string)
                            .unwrap_or_default(),
                        state: state.to_string(),
                        body: String::new(),
                        author: user
                            .get("username")
                            .and_then(serde_json::Value::as_str)
                            .unwrap_or_default()
                            .to_string(),
                        submitted_at: None,
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn fetch_inline_comments(&self, cwd: &Path, number: i64) -> Result<Vec<InlineComment>> {
        let endpoint = format!("projects/:id/merge_requests/{number}/notes");
        let value = self.api(cwd, &endpoint, None).await?;
        Ok(value
            .as_array()
            .map(|notes| {
                notes
                    .iter()
                    .filter_map(|note| {
                        let position = note.get("position")?;
                        Some(InlineComment {
                            path: position
                                .get("new_path")
                                .and_then(serde_json::Value::as_str)
                                .unwrap_or_default()
                                .to_string(),
                            line: position
                                .get("new_line")
                                .and_then(serde_json::Value::as_i64)
                                .unwrap_or(0),
                            body: note
                                .get("body")
                                .and_then(serde_json::Value::as_str)
                                .unwrap_or_default()
                                .to_string(),
                            author: note
                                .get("author")
                                .and_then(|a| a.get("username"))
                                .and_then(serde_json::Value::as_str)
                                .unwrap_or_default()
                                .to_string(),
                            created_at: note
                                .get("created_at")
                                .and_then(serde_json::Value::as_str)
                                .map(String::from),
                        })
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn comment_on_issue(&self, cwd: &Path, number: i64, body: &str) -> Result<()> {
        let num = number.to_string();
        self.glab(cwd, &["issue", "note", &num, "--message", body])
            .await?;
        Ok(())
    }

    async fn issue_status(&self, owner_repo: &str, number: i64) -> Result<String> {
        let num = number.to_string();
        let out = self
            .glab(
                Path::new("."),
                &["issue", "view", &num, "--repo", owner_repo, "--output", "json"],
            )
            .await?;
        let value: serde_json::Value = serde_json::from_str(&out)?;
        Ok(value
            .get("state")
            .and_then(serde_json::Value::as_str)
            .unwrap_or("UNKNOWN")
            .to_uppercase())
    }

    async fn api(
        &self,
        cwd: &Path,
        endpoint: &str,
        timeout: Option<Duration>,
    ) -> Result<serde_json::Value> {
        let out = run_cli(
            &self.bin,
            cwd,
            &["api", endpoint],
            timeout.unwrap_or(self.timeout),
        )
        .await?;
        Ok(serde_json::from_str(&out)?)
    }
}
