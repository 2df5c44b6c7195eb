//! Post-review merge pipeline: the review approved, so merge the PR and
//! pull the result back. A failed merge cascades into a merge-fix item
//! rather than failing this item.

use hive_core::events::TargetType;
use hive_core::metadata::PrMergeMeta;
use hive_core::types::WorkItem;
use std::path::PathBuf;
use tracing::info;

use crate::worker::{merge_fix, PipelineOutcome, Worker};

pub(crate) async fn run(
    worker: &Worker,
    item: &WorkItem,
    meta: &PrMergeMeta,
) -> eyre::Result<PipelineOutcome> {
    let env = &worker.env;
    let project = env.storage.get_project(&meta.project_id).await?;
    let parent = project
        .local_path
        .as_deref()
        .map(PathBuf::from)
        .ok_or_else(|| eyre::eyre!("project {} has no local path", meta.project_id))?;

    let merged = env.vcs.merge_mr(&parent, meta.pr_number).await.unwrap_or(false);
    if merged {
        info!(pr_number = meta.pr_number, "merged approved PR");
        env.storage
            .append_event(
                "pr_merged",
                Some(&worker.session_id),
                Some(&item.item_id),
                Some(TargetType::WorkItem.as_str()),
                &format!("Merged approved PR #{}", meta.pr_number),
                None,
            )
            .await?;
        if env.workspaces.pull_main(&parent, &meta.main_branch).is_ok() {
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
    } else {
        merge_fix::create_merge_fix_item(
            env,
            &meta.implementation_work_item_id,
            &meta.project_id,
            meta.pr_number,
            &meta.pr_url,
            &meta.branch,
            &meta.main_branch,
        )
        .await?;
    }
    Ok(PipelineOutcome::Completed)
}
