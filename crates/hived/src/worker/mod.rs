//! Worker lifecycle engine.
//!
//! A worker owns exactly one claimed work item. It rewrites its session's
//! pid so the stale sweep probes the live process, keeps the session
//! alive with periodic heartbeats, routes the item through the pipeline
//! its metadata selects, and guarantees cleanup: the keep-alive stops,
//! any workspace it created is removed, any stash it made is popped, the
//! item never stays claimed by a finished session, and the session is
//! deregistered. Cleanup failures are recorded as non-fatal events and
//! never mask the primary outcome.

pub mod issue;
pub mod merge_fix;
pub mod plain;
pub mod pr_merge;
pub mod prompts;
pub mod review;
pub mod rework;

use hive_core::events::{EventType, TargetType};
use hive_core::metadata::{classify, ItemKind};
use hive_core::types::WorkItem;
use hive_core::Config;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::launcher::Launcher;
use crate::queue::Queue;
use crate::registry::{HeartbeatUpdate, Registry};
use crate::storage::Storage;
use crate::tana::TanaClient;
use crate::vcs::VcsHost;
use crate::workspace::Workspaces;

/// Shared dependencies for workers and the dispatcher.
pub struct WorkerEnv {
    pub storage: Arc<Storage>,
    pub queue: Queue,
    pub registry: Registry,
    pub workspaces: Arc<Workspaces>,
    pub launcher: Arc<dyn Launcher>,
    pub vcs: Arc<dyn VcsHost>,
    pub tana: Arc<dyn TanaClient>,
    pub config: Arc<Config>,
}

impl std::fmt::Debug for WorkerEnv {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerEnv").finish_non_exhaustive()
    }
}

/// How a pipeline wants the item to end up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineOutcome {
    Completed,
    Released,
}

/// Cleanup obligations a pipeline accumulates while running.
#[derive(Debug, Default)]
pub struct Cleanup {
    /// `(parent repo, workspace path)` of a checkout this run created.
    pub workspace: Option<(PathBuf, PathBuf)>,
    /// Parent repo whose dirty state this run stashed.
    pub stashed: Option<PathBuf>,
}

/// Executes the complete lifecycle of one work item.
pub struct Worker {
    pub env: Arc<WorkerEnv>,
    pub session_id: String,
    /// Budget for the main agent launch.
    pub timeout: Duration,
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("session_id", &self.session_id)
            .finish_non_exhaustive()
    }
}

impl Worker {
    pub fn new(env: Arc<WorkerEnv>, session_id: impl Into<String>, timeout: Duration) -> Self {
        Self {
            env,
            session_id: session_id.into(),
            timeout,
        }
    }

    /// Run the item to completion. Never propagates a pipeline error: all
    /// exits go through structured store updates.
    pub async fn run(&self, item_id: &str) -> eyre::Result<()> {
        // First writes: take ownership of the session's liveness probe.
        self.env
            .storage
            .rewrite_agent_pid(&self.session_id, i64::from(std::process::id()))
            .await?;

        let item = self.env.queue.get(item_id).await?;
        if item.claimed_by.as_deref() != Some(self.session_id.as_str()) {
            eyre::bail!(
                "work item {item_id} is not claimed by session {}",
                self.session_id
            );
        }

        let keepalive = self.spawn_keepalive(&item);
        let mut cleanup = Cleanup::default();
        let result = self.run_pipeline(&item, &mut cleanup).await;
        keepalive.cancel();

        let completed = match &result {
            Ok(PipelineOutcome::Completed) => {
                match self.env.queue.complete(item_id, &self.session_id).await {
                    Ok(()) => true,
                    Err(e) => {
                        error!(item_id, error = %e, "failed to complete work item");
                        false
                    }
                }
            }
            Ok(PipelineOutcome::Released) => false,
            Err(e) => {
                error!(item_id, error = %e, "pipeline failed");
                let _ = self
                    .env
                    .storage
                    .append_event(
                        "worker_error",
                        Some(&self.session_id),
                        Some(item_id),
                        Some(TargetType::WorkItem.as_str()),
                        &format!("Worker failed on {item_id}: {e}"),
                        None,
                    )
                    .await;
                false
            }
        };

        self.finish(item_id, completed, cleanup).await;
        Ok(())
    }

    async fn run_pipeline(
        &self,
        item: &WorkItem,
        cleanup: &mut Cleanup,
    ) -> eyre::Result<PipelineOutcome> {
        match classify(item) {
            ItemKind::SpecFlow(meta) => {
                info!(item_id = %item.item_id, feature_id = %meta.feature_id, "specflow pipeline");
                let orchestrator = crate::build_orchestrator(&self.env);
                let healthy =
                    crate::specflow::run_phase_for_item(&orchestrator, &meta, &self.session_id)
                        .await?;
                Ok(if healthy {
                    PipelineOutcome::Completed
                } else {
                    PipelineOutcome::Released
                })
            }
            ItemKind::MergeFix(meta) => merge_fix::run(self, item, &meta, cleanup).await,
            ItemKind::Issue(meta) => issue::run(self, item, &meta, cleanup).await,
            ItemKind::Review(meta) => review::run(self, item, &meta).await,
            ItemKind::Rework(meta) => rework::run(self, item, &meta, cleanup).await,
            ItemKind::PrMerge(meta) => pr_merge::run(self, item, &meta).await,
            ItemKind::Plain => plain::run(self, item).await,
        }
    }

    /// Keep-alive heartbeat until cancelled.
    fn spawn_keepalive(&self, item: &WorkItem) -> CancellationToken {
        let token = CancellationToken::new();
        let cancelled = token.clone();
        let registry = self.env.registry.clone();
        let session_id = self.session_id.clone();
        let item_id = item.item_id.clone();
        let title = item.title.clone();
        let period = self.env.config.heartbeat_interval;
        tokio::spawn(async move {
            let started = std::time::Instant::now();
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                tokio::select! {
                    () = cancelled.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let elapsed = started.elapsed().as_secs();
                let update = HeartbeatUpdate {
                    session_id: session_id.clone(),
                    progress: Some(format!("Working on \"{title}\" ({elapsed}s)")),
                    work_item_id: Some(item_id.clone()),
                };
                if let Err(e) = registry.heartbeat(update).await {
                    warn!(error = %e, "keep-alive heartbeat failed");
                }
            }
        });
        token
    }

    /// Best-effort cleanup. Failures become events, never errors.
    async fn finish(&self, item_id: &str, completed: bool, cleanup: Cleanup) {
        if let Some((parent, path)) = cleanup.workspace {
            match self.env.workspaces.remove_workspace(&parent, &path) {
                Ok(()) => {
                    let _ = self
                        .env
                        .storage
                        .append_event(
                            EventType::WorkspaceRemoved.as_str(),
                            Some(&self.session_id),
                            Some(item_id),
                            Some(TargetType::WorkItem.as_str()),
                            &format!("Removed workspace {}", path.display()),
                            None,
                        )
                        .await;
                }
                Err(e) => {
                    self.nonfatal(item_id, &format!("workspace removal failed: {e}"))
                        .await;
                }
            }
        }

        if let Some(parent) = cleanup.stashed {
            match self.env.workspaces.pop_stash(&parent) {
                Ok(true) => {
                    self.nonfatal(item_id, "restored stashed parent-repo changes").await;
                }
                Ok(false) | Err(_) => {
                    self.nonfatal(
                        item_id,
                        "failed to pop stash; stash frame left for manual recovery",
                    )
                    .await;
                }
            }
        }

        if !completed {
            if let Err(e) = self.env.queue.release(item_id, &self.session_id).await {
                // Already released (e.g. by the error path) is fine.
                info!(item_id, error = %e, "release on exit was a no-op");
            }
        }

        if let Err(e) = self.env.registry.deregister(&self.session_id).await {
            error!(session_id = %self.session_id, error = %e, "deregistration failed");
        }
    }

    async fn nonfatal(&self, item_id: &str, message: &str) {
        let _ = self
            .env
            .storage
            .append_event(
                "worker_cleanup",
                Some(&self.session_id),
                Some(item_id),
                Some(TargetType::WorkItem.as_str()),
                &format!("Cleanup note for {item_id}: {message}"),
                None,
            )
            .await;
    }
}
