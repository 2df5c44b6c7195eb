//! Merge-fix recovery pipeline.
//!
//! A merge-fix item exists because an automated merge failed. The flow
//! rebases the branch on main and retries; when the rebase conflicts, it
//! stages a merge with conflict markers and hands the resolution to an
//! agent, then commits, pushes, and retries the merge once more.

use hive_core::events::TargetType;
use hive_core::metadata::MergeFixMeta;
use hive_core::types::{Priority, WorkItem};
use hive_core::ids;
use std::path::PathBuf;
use tracing::{info, warn};

use crate::queue::CreateItem;
use crate::worker::{prompts, Cleanup, PipelineOutcome, Worker, WorkerEnv};

/// Create (idempotently) the recovery item for a PR whose merge failed.
pub(crate) async fn create_merge_fix_item(
    env: &WorkerEnv,
    original_item_id: &str,
    project_id: &str,
    pr_number: i64,
    pr_url: &str,
    branch: &str,
    main_branch: &str,
) -> eyre::Result<String> {
    let id = ids::merge_fix_item(original_item_id, pr_number);
    let mut opts = CreateItem::new(&id, format!("Fix failed merge of PR #{pr_number}"));
    opts.project = Some(project_id.to_string());
    opts.source = Some("merge-fix".to_string());
    opts.priority = Priority::P1;
    opts.metadata = Some(serde_json::json!({
        "merge_fix": true,
        "pr_number": pr_number,
        "pr_url": pr_url,
        "branch": branch,
        "main_branch": main_branch,
        "original_item_id": original_item_id,
        "project_id": project_id,
    }));
    env.queue.create_if_absent(opts).await?;
    warn!(pr_number, branch, "merge failed; created merge-fix item {id}");
    Ok(id)
}

pub(crate) async fn run(
    worker: &Worker,
    item: &WorkItem,
    meta: &MergeFixMeta,
    cleanup: &mut Cleanup,
) -> eyre::Result<PipelineOutcome> {
    let env = &worker.env;
    let project = env.storage.get_project(&meta.project_id).await?;
    let parent = project
        .local_path
        .as_deref()
        .map(PathBuf::from)
        .ok_or_else(|| eyre::eyre!("project {} has no local path", meta.project_id))?;

    let path = env.workspaces.workspace_path(&meta.project_id, &meta.branch);
    env.workspaces
        .ensure_workspace(&parent, &path, &meta.branch)
        .await?;
    cleanup.workspace = Some((parent.clone(), path.clone()));

    // Fast path: a clean rebase often makes the merge go through.
    if env.workspaces.rebase_on_main(&path, &meta.main_branch)? {
        env.workspaces.force_push_branch(&path, &meta.branch)?;
        if env.vcs.merge_mr(&path, meta.pr_number).await? {
            let _ = env.workspaces.pull_main(&parent, &meta.main_branch);
            env.storage
                .append_event(
                    "pr_merged",
                    Some(&worker.session_id),
                    Some(&item.item_id),
                    Some(TargetType::WorkItem.as_str()),
                    &format!("Merged PR #{} after rebase", meta.pr_number),
                    None,
                )
                .await?;
            return Ok(PipelineOutcome::Completed);
        }
    }

    // Conflict path: stage the merge, let an agent resolve the markers.
    info!(pr_number = meta.pr_number, "rebase insufficient; escalating to agent resolution");
    env.workspaces
        .merge_main_no_commit(&path, &meta.main_branch)?;
    let conflicted = env.workspaces.get_conflicted_files(&path).unwrap_or_default();
    let prompt = prompts::conflict_prompt(&meta.branch, meta.pr_number, &conflicted);
    let outcome = env
        .launcher
        .launch(&path, &prompt, worker.timeout, &worker.session_id, true)
        .await?;
    if !outcome.success() {
        eyre::bail!(
            "conflict-resolution agent exited with {} for PR #{}",
            outcome.exit_code,
            meta.pr_number
        );
    }

    env.workspaces.commit_all(
        &path,
        &format!("Resolve merge conflicts for PR #{}", meta.pr_number),
    )?;
    env.workspaces.push_branch(&path, &meta.branch)?;
    if !env.vcs.merge_mr(&path, meta.pr_number).await? {
        eyre::bail!(
            "PR #{} still failed to merge after conflict resolution",
            meta.pr_number
        );
    }
    let _ = env.workspaces.pull_main(&parent, &meta.main_branch);
    env.storage
        .append_event(
            "pr_merged",
            Some(&worker.session_id),
            Some(&item.item_id),
            Some(TargetType::WorkItem.as_str()),
            &format!(
                "Merged PR #{} after agent conflict resolution",
                meta.pr_number
            ),
            None,
        )
        .await?;
    Ok(PipelineOutcome::Completed)
}
