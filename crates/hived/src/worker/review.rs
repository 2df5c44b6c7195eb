//! Code-review pipeline.
//!
//! Launches a review agent against an open PR, parses the structured
//! tail of its output, records the verdict on the review item, and keeps
//! the loop moving: approval produces a PR-merge item, changes-requested
//! produces the next rework cycle.

use hive_core::events::{EventType, TargetType};
use hive_core::ids;
use hive_core::metadata::{InlineCommentMeta, ReviewMeta};
use hive_core::types::{Priority, WorkItem};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::queue::CreateItem;
use crate::vcs::MrState;
use crate::worker::prompts::{self, ReviewVerdict};
use crate::worker::{rework, PipelineOutcome, Worker};

pub(crate) async fn run(
    worker: &Worker,
    item: &WorkItem,
    meta: &ReviewMeta,
) -> eyre::Result<PipelineOutcome> {
    let env = &worker.env;
    let project_id = item
        .project_id
        .clone()
        .ok_or_else(|| eyre::eyre!("review item {} has no project", item.item_id))?;
    let project = env.storage.get_project(&project_id).await?;
    let parent = project
        .local_path
        .as_deref()
        .map(PathBuf::from)
        .ok_or_else(|| eyre::eyre!("project {project_id} has no local path"))?;

    // A PR that already reached a terminal state needs no review.
    if let Some(state @ (MrState::Merged | MrState::Closed)) =
        env.vcs.mr_state(&parent, meta.pr_number).await?
    {
        env.storage
            .append_event(
                "review_skipped",
                Some(&worker.session_id),
                Some(&item.item_id),
                Some(TargetType::WorkItem.as_str()),
                &format!(
                    "Skipping review of PR #{}: PR is {}",
                    meta.pr_number,
                    state.as_str()
                ),
                None,
            )
            .await?;
        return Ok(PipelineOutcome::Completed);
    }

    let spec_context = meta
        .spec_path
        .as_deref()
        .map(Path::new)
        .and_then(prompts::load_spec_context);
    let prompt = prompts::review_prompt(meta, spec_context.as_deref());
    let outcome = env
        .launcher
        .launch(&parent, &prompt, worker.timeout, &worker.session_id, true)
        .await?;
    if !outcome.success() {
        eyre::bail!(
            "review agent exited with {} for PR #{}",
            outcome.exit_code,
            meta.pr_number
        );
    }

    let tail = prompts::parse_review_tail(&outcome.stdout).ok_or_else(|| {
        eyre::eyre!(
            "review agent produced no structured tail for PR #{}",
            meta.pr_number
        )
    })?;

    let review_status = match tail.verdict {
        ReviewVerdict::Approve => "approved",
        ReviewVerdict::ChangesRequested => "changes_requested",
    };
    env.queue
        .update_metadata(
            &item.item_id,
            &serde_json::json!({
                "review_status": review_status,
                "review_findings_count": tail.findings_count,
                "review_severity": tail.severity,
                "reviewer_session_id": worker.session_id,
            }),
        )
        .await?;

    let implementation_item = meta
        .implementation_work_item_id
        .clone()
        .unwrap_or_else(|| item.item_id.clone());
    let main_branch = meta.main_branch.clone().unwrap_or_else(|| "main".to_string());

    match tail.verdict {
        ReviewVerdict::Approve => {
            info!(pr_number = meta.pr_number, "review approved");
            env.storage
                .append_event(
                    EventType::WorkApproved.as_str(),
                    Some(&worker.session_id),
                    Some(&implementation_item),
                    Some(TargetType::WorkItem.as_str()),
                    &format!("Review approved PR #{}: {}", meta.pr_number, tail.summary),
                    Some(&serde_json::json!({
                        "pr_number": meta.pr_number,
                        "findings_count": tail.findings_count,
                        "severity": tail.severity,
                    })),
                )
                .await?;

            let mut opts = CreateItem::new(
                ids::pr_merge_item(&project_id, meta.pr_number),
                format!("Merge approved PR #{}", meta.pr_number),
            );
            opts.project = Some(project_id.clone());
            opts.source = Some("pr_merge".to_string());
            opts.priority = Priority::P1;
            opts.metadata = Some(serde_json::json!({
                "pr_merge": true,
                "pr_number": meta.pr_number,
                "pr_url": meta.pr_url.clone().unwrap_or_default(),
                "repo": meta.repo,
                "branch": meta.branch,
                "main_branch": main_branch,
                "implementation_work_item_id": implementation_item,
                "project_id": project_id,
            }));
            env.queue.create_if_absent(opts).await?;
        }
        ReviewVerdict::ChangesRequested => {
            info!(
                pr_number = meta.pr_number,
                findings = tail.findings_count,
                "review requested changes"
            );
            env.storage
                .append_event(
                    EventType::WorkRejected.as_str(),
                    Some(&worker.session_id),
                    Some(&implementation_item),
                    Some(TargetType::WorkItem.as_str()),
                    &format!(
                        "Review requested changes on PR #{}: {}",
                        meta.pr_number, tail.summary
                    ),
                    Some(&serde_json::json!({
                        "pr_number": meta.pr_number,
                        "findings_count": tail.findings_count,
                        "severity": tail.severity,
                    })),
                )
                .await?;

            let inline_comments: Vec<InlineCommentMeta> = match env
                .vcs
                .fetch_inline_comments(&parent, meta.pr_number)
                .await
            {
                Ok(comments) => comments
                    .into_iter()
                    .map(|c| InlineCommentMeta {
                        path: c.path,
                        line: c.line,
                        body: c.body,
                        author: c.author,
                    })
                    .collect(),
                Err(e) => {
                    warn!(error = %e, "could not fetch inline comments");
                    Vec::new()
                }
            };

            let next_cycle = meta.rework_cycle.unwrap_or(0) + 1;
            rework::create_rework_work_item(
                env,
                rework::ReworkRequest {
                    project_id,
                    pr_number: meta.pr_number,
                    pr_url: meta.pr_url.clone().unwrap_or_default(),
                    repo: meta.repo.clone(),
                    branch: meta.branch.clone(),
                    main_branch,
                    implementation_work_item_id: implementation_item,
                    review_feedback: tail.summary,
                    rework_cycle: next_cycle,
                    inline_comments,
                    worktree_path: None,
                    max_rework_cycles: None,
                },
            )
            .await?;
        }
    }

    Ok(PipelineOutcome::Completed)
}
