//! Tracker-issue fix pipeline.
//!
//! The longest pipeline: stash the parent if dirty, build an isolated
//! workspace on `fix/issue-<n>`, run the fixing agent, then commit, push,
//! and open a PR. Trusted items (human review not required) auto-merge,
//! falling back to a merge-fix item when the merge fails. A short-lived
//! commenter agent and the Tana write-back run non-fatally at the end.

use hive_core::events::TargetType;
use hive_core::ids;
use hive_core::metadata::{self, IssueMeta};
use hive_core::types::WorkItem;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};

use crate::vcs::CreateMr;
use crate::worker::{merge_fix, prompts, Cleanup, PipelineOutcome, Worker};

/// Budget for the issue-commenter agent.
const COMMENTER_TIMEOUT: Duration = Duration::from_secs(120);

pub(crate) async fn run(
    worker: &Worker,
    item: &WorkItem,
    meta: &IssueMeta,
    cleanup: &mut Cleanup,
) -> eyre::Result<PipelineOutcome> {
    let env = &worker.env;
    let project_id = item
        .project_id
        .clone()
        .ok_or_else(|| eyre::eyre!("issue item {} has no project", item.item_id))?;
    let project = env.storage.get_project(&project_id).await?;
    let parent = project
        .local_path
        .as_deref()
        .map(PathBuf::from)
        .ok_or_else(|| eyre::eyre!("project {project_id} has no local path"))?;

    if env.workspaces.stash_if_dirty(&parent)? {
        cleanup.stashed = Some(parent.clone());
    }

    let main_branch = env.workspaces.current_branch(&parent)?;
    let branch = ids::issue_branch(meta.issue_number);
    let path = env
        .workspaces
        .create_workspace(&parent, &branch, &project_id)
        .await?;
    cleanup.workspace = Some((parent.clone(), path.clone()));

    let tana_meta = item.metadata_value().as_ref().and_then(metadata::parse_tana);

    let prompt = prompts::issue_prompt(item, meta, &worker.session_id);
    let outcome = env
        .launcher
        .launch(&path, &prompt, worker.timeout, &worker.session_id, true)
        .await?;

    if !outcome.success() {
        warn!(
            item_id = %item.item_id,
            exit_code = outcome.exit_code,
            "issue agent failed"
        );
        if let Some(tana) = &tana_meta {
            // Leave the node unchecked; the work is not done.
            let note = format!("agent failed (exit {}): {}", outcome.exit_code, item.title);
            if let Err(e) = env.tana.add_child_note(tana, &note).await {
                warn!(error = %e, "tana failure note did not post");
            }
        }
        return Ok(PipelineOutcome::Released);
    }

    let commit = env.workspaces.commit_all(
        &path,
        &format!("Fix #{}: {}", meta.issue_number, item.title),
    )?;
    let Some(_) = commit else {
        env.storage
            .append_event(
                "pr_skipped",
                Some(&worker.session_id),
                Some(&item.item_id),
                Some(TargetType::WorkItem.as_str()),
                &format!("No changes produced for {}; skipping PR", item.item_id),
                None,
            )
            .await?;
        return Ok(PipelineOutcome::Completed);
    };

    env.workspaces.push_branch(&path, &branch)?;
    let mr = env
        .vcs
        .create_mr(CreateMr {
            cwd: &path,
            title: &format!("Fix #{}: {}", meta.issue_number, item.title),
            body: &format!(
                "Fixes #{}\n\nAutomated fix for: {}",
                meta.issue_number, item.title
            ),
            base: &main_branch,
            head: Some(&branch),
        })
        .await?;
    info!(pr_number = mr.number, url = %mr.url, "created PR");
    env.storage
        .append_event(
            "pr_created",
            Some(&worker.session_id),
            Some(&item.item_id),
            Some(TargetType::WorkItem.as_str()),
            &format!("Created PR #{} for issue #{}", mr.number, meta.issue_number),
            Some(&serde_json::json!({"pr_number": mr.number, "pr_url": mr.url})),
        )
        .await?;

    if !meta.human_review_required {
        let merged = match env.vcs.merge_mr(&path, mr.number).await {
            Ok(merged) => merged,
            Err(e) => {
                warn!(pr_number = mr.number, error = %e, "merge attempt errored");
                false
            }
        };
        if merged {
            env.storage
                .append_event(
                    "pr_merged",
                    Some(&worker.session_id),
                    Some(&item.item_id),
                    Some(TargetType::WorkItem.as_str()),
                    &format!("Auto-merged PR #{}", mr.number),
                    None,
                )
                .await?;
            match env.workspaces.pull_main(&parent, &main_branch) {
                Ok(()) => {
                    env.storage
                        .append_event(
                            "merge_pulled",
                            Some(&worker.session_id),
                            Some(&item.item_id),
                            Some(TargetType::WorkItem.as_str()),
                            "Pulled merged changes",
                            None,
                        )
                        .await?;
                }
                Err(e) => {
                    // Non-fatal: the merge landed, the local checkout just
                    // lags behind.
                    warn!(error = %e, "pull after merge failed");
                }
            }
        } else {
            merge_fix::create_merge_fix_item(
                env,
                &item.item_id,
                &project_id,
                mr.number,
                &mr.url,
                &branch,
                &main_branch,
            )
            .await?;
        }
    }

    // Post a summary back to the issue through a short-lived agent.
    if let Ok(diff_summary) = env.workspaces.get_diff_summary(&path, &main_branch) {
        let commenter = prompts::commenter_prompt(meta.issue_number, &mr.url, &diff_summary);
        if let Err(e) = env
            .launcher
            .launch(&path, &commenter, COMMENTER_TIMEOUT, &worker.session_id, true)
            .await
        {
            warn!(error = %e, "commenter agent failed");
        }
    }

    if let Some(tana) = &tana_meta {
        let note = format!("completed: {}", item.title);
        if let Err(e) = env.tana.add_child_note(tana, &note).await {
            warn!(error = %e, "tana completion note did not post");
        }
        if let Err(e) = env.tana.check_node(tana).await {
            warn!(error = %e, "tana node check did not post");
        }
    }

    Ok(PipelineOutcome::Completed)
}
