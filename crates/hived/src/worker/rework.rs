//! Review-driven rework pipeline and rework-item creation.
//!
//! Rework cycles are bounded twice: an effective budget (project or item
//! override, defaulting from config) and a hard cap that no override can
//! exceed. Exhausting the budget escalates the implementation item to a
//! human instead of looping forever.

use hive_core::events::{EventType, TargetType};
use hive_core::ids;
use hive_core::metadata::{InlineCommentMeta, ReworkMeta};
use hive_core::types::{Priority, WorkItem};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::queue::CreateItem;
use crate::worker::{prompts, Cleanup, PipelineOutcome, Worker, WorkerEnv};

/// Everything needed to create the next rework cycle.
#[derive(Debug, Clone)]
pub(crate) struct ReworkRequest {
    pub project_id: String,
    pub pr_number: i64,
    pub pr_url: String,
    pub repo: String,
    pub branch: String,
    pub main_branch: String,
    pub implementation_work_item_id: String,
    pub review_feedback: String,
    pub rework_cycle: u32,
    pub inline_comments: Vec<InlineCommentMeta>,
    pub worktree_path: Option<String>,
    pub max_rework_cycles: Option<u32>,
}

/// Create a rework item for the given cycle, or return None when the
/// cycle budget is exhausted (hard cap: silently dropped; effective max:
/// escalated to a human). Idempotent on `(pr_number, rework_cycle)`.
pub(crate) async fn create_rework_work_item(
    env: &WorkerEnv,
    req: ReworkRequest,
) -> eyre::Result<Option<String>> {
    let hard_cap = env.config.max_rework_cycles_hard;
    let project_override = env
        .storage
        .maybe_project(&req.project_id)
        .await?
        .and_then(|p| p.settings().max_rework_cycles);
    let configured = project_override
        .or(req.max_rework_cycles)
        .unwrap_or(env.config.default_max_rework_cycles);
    let effective_max = configured.min(hard_cap);

    if req.rework_cycle > hard_cap {
        warn!(
            pr_number = req.pr_number,
            cycle = req.rework_cycle,
            hard_cap,
            "rework cycle past hard cap; not creating"
        );
        return Ok(None);
    }
    if req.rework_cycle > effective_max {
        let reason = format!(
            "rework cycles exhausted for PR #{} (cycle {} > max {})",
            req.pr_number, req.rework_cycle, effective_max
        );
        if let Err(e) = env
            .queue
            .update_metadata(
                &req.implementation_work_item_id,
                &serde_json::json!({
                    "human_review_required": true,
                    "escalation_reason": reason,
                }),
            )
            .await
        {
            warn!(error = %e, "could not mark implementation item for human review");
        }
        env.storage
            .append_event(
                EventType::HumanEscalation.as_str(),
                None,
                Some(&req.implementation_work_item_id),
                Some(TargetType::WorkItem.as_str()),
                &format!("Escalating PR #{} to human review: {reason}", req.pr_number),
                Some(&serde_json::json!({
                    "pr_number": req.pr_number,
                    "rework_cycle": req.rework_cycle,
                    "effective_max": effective_max,
                })),
            )
            .await?;
        return Ok(None);
    }

    // Idempotency: an open item for the same (pr, cycle) wins.
    if let Some(existing) = env
        .queue
        .find_open_rework(req.pr_number, req.rework_cycle)
        .await?
    {
        return Ok(Some(existing.item_id));
    }

    let id = ids::rework_item(&req.project_id, req.pr_number, req.rework_cycle);
    let mut opts = CreateItem::new(
        &id,
        format!(
            "Address review feedback for PR #{} (cycle {})",
            req.pr_number, req.rework_cycle
        ),
    );
    opts.project = Some(req.project_id.clone());
    opts.source = Some("rework".to_string());
    opts.priority = Priority::P1;
    opts.metadata = Some(serde_json::json!({
        "rework": true,
        "pr_number": req.pr_number,
        "pr_url": req.pr_url,
        "repo": req.repo,
        "branch": req.branch,
        "main_branch": req.main_branch,
        "implementation_work_item_id": req.implementation_work_item_id,
        "review_feedback": req.review_feedback,
        "rework_cycle": req.rework_cycle,
        "project_id": req.project_id,
        "worktree_path": req.worktree_path,
        "inline_comments": req.inline_comments,
        "max_rework_cycles": req.max_rework_cycles,
    }));
    env.queue.create_if_absent(opts).await?;
    Ok(Some(id))
}

pub(crate) async fn run(
    worker: &Worker,
    item: &WorkItem,
    meta: &ReworkMeta,
    cleanup: &mut Cleanup,
) -> eyre::Result<PipelineOutcome> {
    let env = &worker.env;
    let project = env.storage.get_project(&meta.project_id).await?;
    let parent = project
        .local_path
        .as_deref()
        .map(PathBuf::from)
        .ok_or_else(|| eyre::eyre!("project {} has no local path", meta.project_id))?;

    // Reuse the recorded worktree when it still exists; it may hold
    // uncommitted context from the implementation run. Only a workspace
    // this run creates is cleaned up afterwards.
    let path = match meta.worktree_path.as_deref().filter(|p| Path::new(p).exists()) {
        Some(existing) => {
            let path = PathBuf::from(existing);
            env.workspaces.ensure_branch(&path, &meta.branch)?;
            path
        }
        None => {
            if env.workspaces.stash_if_dirty(&parent)? {
                cleanup.stashed = Some(parent.clone());
            }
            let path = env
                .workspaces
                .create_workspace(&parent, &meta.branch, &meta.project_id)
                .await?;
            cleanup.workspace = Some((parent.clone(), path.clone()));
            path
        }
    };

    let prompt = prompts::rework_prompt(meta);
    let outcome = env
        .launcher
        .launch(&path, &prompt, worker.timeout, &worker.session_id, true)
        .await?;
    if !outcome.success() {
        warn!(
            pr_number = meta.pr_number,
            exit_code = outcome.exit_code,
            "rework agent failed"
        );
        return Ok(PipelineOutcome::Released);
    }

    let commit = env.workspaces.commit_all(
        &path,
        &format!(
            "Address review feedback for PR #{} (cycle {})",
            meta.pr_number, meta.rework_cycle
        ),
    )?;
    if commit.is_some() {
        env.workspaces.push_branch(&path, &meta.branch)?;
        info!(pr_number = meta.pr_number, "pushed rework changes");
    }

    // Always queue the re-review so the feedback loop continues, even
    // when the agent pushed its own commits.
    let review_id = ids::review_item(&meta.project_id, meta.pr_number, Some(meta.rework_cycle));
    let mut opts = CreateItem::new(
        &review_id,
        format!(
            "Re-review PR #{} after rework cycle {}",
            meta.pr_number, meta.rework_cycle
        ),
    );
    opts.project = Some(meta.project_id.clone());
    opts.source = Some("code_review".to_string());
    opts.priority = Priority::P1;
    opts.metadata = Some(serde_json::json!({
        "pr_number": meta.pr_number,
        "pr_url": meta.pr_url,
        "repo": meta.repo,
        "branch": meta.branch,
        "main_branch": meta.main_branch,
        "implementation_work_item_id": meta.implementation_work_item_id,
        "rework_cycle": meta.rework_cycle,
    }));
    env.queue.create_if_absent(opts).await?;

    Ok(PipelineOutcome::Completed)
}
