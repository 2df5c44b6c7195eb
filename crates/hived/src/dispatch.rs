//! Dispatcher: claims available work items under a concurrency limit and
//! hands each to a worker, either inline or as a detached child process.
//!
//! Fire-and-forget children re-execute this binary's `worker` subcommand
//! with their own store handle on the same file; the child's first writes
//! rewrite the session pid so the stale sweep tracks the right process.

use chrono::{DateTime, Utc};
use hive_core::events::{EventType, TargetType};
use hive_core::types::{Priority, Project, WorkItem};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

use crate::registry::RegisterOpts;
use crate::storage::ItemFilter;
use crate::worker::{Worker, WorkerEnv};

/// Per-tick dispatch options.
#[derive(Debug, Clone)]
pub struct DispatchOptions {
    pub max_concurrent: usize,
    pub max_items: usize,
    /// Priority filter, e.g. "P1" or "P1,P2".
    pub priority: Option<String>,
    pub project: Option<String>,
    pub dry_run: bool,
    pub timeout_min: u64,
    pub fire_and_forget: bool,
}

impl Default for DispatchOptions {
    fn default() -> Self {
        Self {
            max_concurrent: 1,
            max_items: 1,
            priority: None,
            project: None,
            dry_run: false,
            timeout_min: 30,
            fire_and_forget: false,
        }
    }
}

/// One dispatched item.
#[derive(Debug, Clone)]
pub struct Dispatched {
    pub item_id: String,
    pub session_id: String,
    pub work_dir: PathBuf,
    /// "inline", "spawned", or "dry-run".
    pub mode: &'static str,
}

/// One skipped item with the reason.
#[derive(Debug, Clone)]
pub struct Skipped {
    pub item_id: String,
    pub reason: String,
}

/// Result of one dispatcher tick.
#[derive(Debug, Default)]
pub struct DispatchResult {
    pub timestamp: Option<DateTime<Utc>>,
    pub dispatched: Vec<Dispatched>,
    pub skipped: Vec<Skipped>,
    pub errors: Vec<String>,
    pub dry_run: bool,
}

pub struct Dispatcher {
    env: Arc<WorkerEnv>,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher").finish_non_exhaustive()
    }
}

impl Dispatcher {
    pub fn new(env: Arc<WorkerEnv>) -> Self {
        Self { env }
    }

    /// One dispatcher tick.
    pub async fn run(&self, opts: &DispatchOptions) -> eyre::Result<DispatchResult> {
        let mut result = DispatchResult {
            timestamp: Some(Utc::now()),
            dry_run: opts.dry_run,
            ..DispatchResult::default()
        };

        let filter = ItemFilter {
            priorities: opts
                .priority
                .as_deref()
                .map(Priority::parse_list)
                .unwrap_or_default(),
            project: opts.project.clone(),
            ..ItemFilter::available()
        };
        let items = self.env.queue.list(&filter).await?;
        if items.is_empty() {
            return Ok(result);
        }

        // Concurrency check against live sessions, excluding the
        // orchestrator's own heartbeat agent.
        if !opts.dry_run {
            let live = self
                .env
                .storage
                .count_live_agents_excluding(&self.env.config.orchestrator_agent_name)
                .await?;
            if live >= opts.max_concurrent {
                let reason = format!(
                    "concurrency limit reached ({live}/{})",
                    opts.max_concurrent
                );
                info!(reason, "skipping dispatch");
                result.skipped = items
                    .into_iter()
                    .map(|item| Skipped {
                        item_id: item.item_id,
                        reason: reason.clone(),
                    })
                    .collect();
                return Ok(result);
            }
        }

        let (selected, surplus) = if items.len() > opts.max_items {
            let mut items = items;
            let surplus = items.split_off(opts.max_items);
            (items, surplus)
        } else {
            (items, Vec::new())
        };
        for item in surplus {
            result.skipped.push(Skipped {
                item_id: item.item_id,
                reason: "exceeds max items per run".to_string(),
            });
        }

        for item in selected {
            if opts.dry_run {
                let work_dir = self.resolve_work_dir(&item).await;
                result.dispatched.push(Dispatched {
                    item_id: item.item_id,
                    session_id: String::new(),
                    work_dir,
                    mode: "dry-run",
                });
                continue;
            }
            match self.dispatch_one(&item, opts).await {
                Ok(Some(dispatched)) => result.dispatched.push(dispatched),
                Ok(None) => result.skipped.push(Skipped {
                    item_id: item.item_id,
                    reason: "already claimed".to_string(),
                }),
                Err(e) => {
                    error!(item_id = %item.item_id, error = %e, "dispatch failed");
                    result.errors.push(format!("{}: {e}", item.item_id));
                }
            }
        }
        Ok(result)
    }

    async fn resolve_project(&self, item: &WorkItem) -> Option<Project> {
        let project_id = item.project_id.as_deref()?;
        self.env.storage.maybe_project(project_id).await.ok().flatten()
    }

    /// Items without a project run from the home directory.
    async fn resolve_work_dir(&self, item: &WorkItem) -> PathBuf {
        self.resolve_project(item)
            .await
            .and_then(|p| p.local_path.map(PathBuf::from))
            .or_else(dirs::home_dir)
            .unwrap_or_else(|| PathBuf::from("/tmp"))
    }

    async fn dispatch_one(
        &self,
        item: &WorkItem,
        opts: &DispatchOptions,
    ) -> eyre::Result<Option<Dispatched>> {
        let work_dir = self.resolve_work_dir(item).await;

        let session = self
            .env
            .registry
            .register(RegisterOpts {
                name: format!("dispatch-{}", item.item_id),
                project: item.project_id.clone(),
                work: Some(item.title.clone()),
                parent_id: None,
                metadata: Some(serde_json::json!({
                    "log_path": self
                        .env
                        .config
                        .session_log_path(&format!("dispatch-{}", item.item_id))
                        .to_string_lossy(),
                })),
            })
            .await?;
        let session_id = session.session_id.as_ref().to_string();

        if !self.env.queue.claim(&item.item_id, &session_id).await? {
            // Lost the race; the agent we just registered has no work.
            let _ = self.env.registry.deregister(&session_id).await;
            return Ok(None);
        }

        self.env
            .storage
            .append_event(
                EventType::Dispatching.as_str(),
                Some(&session_id),
                Some(&item.item_id),
                Some(TargetType::WorkItem.as_str()),
                &format!("Dispatching {}: {}", item.item_id, item.title),
                Some(&serde_json::json!({
                    "work_dir": work_dir.to_string_lossy(),
                    "fire_and_forget": opts.fire_and_forget,
                })),
            )
            .await?;

        let timeout = Duration::from_secs(opts.timeout_min * 60);
        if opts.fire_and_forget {
            self.spawn_detached(&item.item_id, &session_id, timeout)?;
            Ok(Some(Dispatched {
                item_id: item.item_id.clone(),
                session_id,
                work_dir,
                mode: "spawned",
            }))
        } else {
            let worker = Worker::new(Arc::clone(&self.env), &session_id, timeout);
            worker.run(&item.item_id).await?;
            Ok(Some(Dispatched {
                item_id: item.item_id.clone(),
                session_id,
                work_dir,
                mode: "inline",
            }))
        }
    }

    /// Spawn a detached worker process running this binary's `worker`
    /// subcommand, with stderr redirected to the session log.
    fn spawn_detached(
        &self,
        item_id: &str,
        session_id: &str,
        timeout: Duration,
    ) -> eyre::Result<()> {
        let exe = std::env::current_exe()?;
        let log_path = self.env.config.session_log_path(session_id);
        if let Some(parent) = log_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let log = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)?;

        let child = std::process::Command::new(exe)
            .arg("worker")
            .arg("--session-id")
            .arg(session_id)
            .arg("--item-id")
            .arg(item_id)
            .arg("--timeout-ms")
            .arg(timeout.as_millis().to_string())
            .env("HIVE_DB_PATH", &self.env.config.db_path)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(log)
            .spawn()?;
        info!(
            item_id,
            session_id,
            pid = child.id(),
            "spawned detached worker"
        );
        // Intentionally not waited on; the child runs its own lifecycle
        // against the shared store file.
        drop(child);
        Ok(())
    }
}
