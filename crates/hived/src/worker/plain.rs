//! Pipeline for items with no recognized metadata variant: one generic
//! agent launch in the project directory, completed or released by exit
//! code.

use hive_core::types::WorkItem;
use std::path::PathBuf;
use tracing::info;

use crate::worker::{prompts, PipelineOutcome, Worker};

pub(crate) async fn run(worker: &Worker, item: &WorkItem) -> eyre::Result<PipelineOutcome> {
    let env = &worker.env;

    let work_dir = match &item.project_id {
        Some(project_id) => env
            .storage
            .maybe_project(project_id)
            .await?
            .and_then(|p| p.local_path.map(PathBuf::from)),
        None => None,
    };
    let work_dir = work_dir
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("/tmp"));

    let prompt = prompts::plain_prompt(item, &worker.session_id);
    let outcome = env
        .launcher
        .launch(&work_dir, &prompt, worker.timeout, &worker.session_id, true)
        .await?;

    info!(
        item_id = %item.item_id,
        exit_code = outcome.exit_code,
        "plain pipeline finished"
    );
    Ok(if outcome.success() {
        PipelineOutcome::Completed
    } else {
        PipelineOutcome::Released
    })
}
