//! Phase executors.
//!
//! One executor runs each active phase inside the feature's workspace.
//! The orchestrator only depends on the trait; the default implementation
//! drives the external coding agent with a per-phase prompt.

use async_trait::async_trait;
use hive_core::types::{Feature, FeaturePhase};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::launcher::Launcher;

/// Execution context handed to a phase executor.
#[derive(Debug, Clone)]
pub struct PhaseContext {
    pub worktree_path: PathBuf,
    pub project_path: PathBuf,
    pub timeout: Duration,
    pub session_id: String,
}

/// Result of one phase execution.
#[derive(Debug, Clone, Default)]
pub struct PhaseOutcome {
    pub succeeded: bool,
    pub error: Option<String>,
    pub pr_number: Option<i64>,
    pub pr_url: Option<String>,
    pub commit_sha: Option<String>,
}

impl PhaseOutcome {
    pub fn success() -> Self {
        Self {
            succeeded: true,
            ..Self::default()
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            succeeded: false,
            error: Some(error.into()),
            ..Self::default()
        }
    }
}

/// Runs one active phase of a feature to completion.
#[async_trait]
pub trait PhaseExecutor: Send + Sync {
    async fn execute(&self, feature: &Feature, ctx: &PhaseContext) -> eyre::Result<PhaseOutcome>;
}

/// Default executor: one coding-agent launch per phase.
pub struct LauncherExecutor {
    launcher: Arc<dyn Launcher>,
}

impl std::fmt::Debug for LauncherExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LauncherExecutor").finish_non_exhaustive()
    }
}

impl LauncherExecutor {
    pub fn new(launcher: Arc<dyn Launcher>) -> Self {
        Self { launcher }
    }

    fn phase_prompt(feature: &Feature) -> String {
        let header = format!(
            "Feature: {} ({})\nProject: {}\n\n{}\n\n",
            feature.title, feature.feature_id, feature.project_id, feature.description
        );
        let instructions = match feature.phase {
            FeaturePhase::Specifying => {
                "Write the feature specification. Produce spec.md in this feature's \
                 directory under .specify/specs/, covering user stories, acceptance \
                 criteria, and edge cases. Do not write implementation code."
            }
            FeaturePhase::Planning => {
                "Write the implementation plan. Produce plan.md next to the existing \
                 spec.md, breaking the work into ordered steps with file-level detail. \
                 Do not write implementation code."
            }
            FeaturePhase::Tasking => {
                "Break the plan into tasks. Produce tasks.md next to plan.md with one \
                 checklist entry per task, each independently verifiable."
            }
            FeaturePhase::Implementing => {
                "Implement the tasks in tasks.md on the current branch. Commit as you \
                 complete each task. Run the project's tests before finishing."
            }
            FeaturePhase::Completing => {
                "Finalize the feature: make sure all work is committed and pushed, and \
                 open a pull request to the main branch if one does not exist yet. \
                 Print the PR number as 'PR_NUMBER: <n>' and its URL as 'PR_URL: <url>'."
            }
            _ => "No work to do for this phase.",
        };
        format!("{header}{instructions}")
    }
}

/// Last `<TAG>: value` match in agent output. Agents sometimes echo the
/// prompt template, so earlier matches are untrustworthy.
pub fn last_tagged_value(stdout: &str, tag: &str) -> Option<String> {
    let prefix = format!("{tag}:");
    stdout
        .lines()
        .rev()
        .find_map(|line| line.trim().strip_prefix(&prefix).map(|v| v.trim().to_string()))
        .filter(|v| !v.is_empty())
}

#[async_trait]
impl PhaseExecutor for LauncherExecutor {
    async fn execute(&self, feature: &Feature, ctx: &PhaseContext) -> eyre::Result<PhaseOutcome> {
        let prompt = Self::phase_prompt(feature);
        let outcome = self
            .launcher
            .launch(&ctx.worktree_path, &prompt, ctx.timeout, &ctx.session_id, true)
            .await?;

        if !outcome.success() {
            return Ok(PhaseOutcome::failure(format!(
                "phase {} agent exited with {}",
                feature.phase.as_str(),
                outcome.exit_code
            )));
        }

        let mut result = PhaseOutcome::success();
        result.pr_number =
            last_tagged_value(&outcome.stdout, "PR_NUMBER").and_then(|v| v.parse().ok());
        result.pr_url = last_tagged_value(&outcome.stdout, "PR_URL");
        result.commit_sha = last_tagged_value(&outcome.stdout, "COMMIT_SHA");
        Ok(result)
    }
}
