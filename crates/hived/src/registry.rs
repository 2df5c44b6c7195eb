//! Agent session registry.
//!
//! Sessions are the liveness anchor for everything else: work items stay
//! claimed only while their session is live, and the stale sweep releases
//! whatever a dead process left behind. A session is considered dead only
//! when both signals agree: `last_seen_at` is past the TTL and the
//! recorded pid no longer maps to a live OS process.

use chrono::Utc;
use hive_core::events::{EventType, TargetType};
use hive_core::types::{AgentSession, AgentStatus, Heartbeat, Id};
use hive_core::Config;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

use crate::storage::{Storage, StorageError};

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}

pub type Result<T> = std::result::Result<T, RegistryError>;

/// Options for registering a new session.
#[derive(Debug, Clone, Default)]
pub struct RegisterOpts {
    pub name: String,
    pub project: Option<String>,
    pub work: Option<String>,
    pub parent_id: Option<String>,
    /// JSON bag recorded on the session (e.g. `log_path`).
    pub metadata: Option<serde_json::Value>,
}

/// A heartbeat update from a running session.
#[derive(Debug, Clone, Default)]
pub struct HeartbeatUpdate {
    pub session_id: String,
    pub progress: Option<String>,
    pub work_item_id: Option<String>,
}

/// Registry over the shared store.
#[derive(Debug, Clone)]
pub struct Registry {
    storage: Arc<Storage>,
    config: Arc<Config>,
}

impl Registry {
    pub fn new(storage: Arc<Storage>, config: Arc<Config>) -> Self {
        Self { storage, config }
    }

    /// Register a new session. The pid recorded is this process; detached
    /// workers rewrite it to their own pid after spawn.
    pub async fn register(&self, opts: RegisterOpts) -> Result<AgentSession> {
        let now = Utc::now();
        let agent = AgentSession {
            session_id: Id::new(),
            agent_name: opts.name,
            project: opts.project,
            work: opts.work,
            parent_id: opts.parent_id,
            pid: i64::from(std::process::id()),
            status: AgentStatus::Active,
            last_seen_at: now,
            created_at: now,
            metadata: opts
                .metadata
                .as_ref()
                .map(serde_json::Value::to_string),
        };
        self.storage.insert_agent(&agent).await?;
        self.storage
            .append_event(
                EventType::AgentRegistered.as_str(),
                Some(agent.session_id.as_ref()),
                Some(agent.session_id.as_ref()),
                Some(TargetType::Agent.as_str()),
                &format!("Registered agent {}", agent.agent_name),
                Some(&serde_json::json!({
                    "agent_name": agent.agent_name,
                    "project": agent.project,
                    "pid": agent.pid,
                })),
            )
            .await?;
        Ok(agent)
    }

    /// Record a heartbeat: refresh `last_seen_at`, persist the heartbeat
    /// row, and append a `heartbeat_received` event.
    pub async fn heartbeat(&self, update: HeartbeatUpdate) -> Result<Heartbeat> {
        self.storage.touch_agent(&update.session_id).await?;
        let beat = self
            .storage
            .insert_heartbeat(
                &update.session_id,
                update.progress.as_deref(),
                update.work_item_id.as_deref(),
            )
            .await?;
        self.storage
            .append_event(
                EventType::HeartbeatReceived.as_str(),
                Some(&update.session_id),
                update.work_item_id.as_deref(),
                update.work_item_id.as_ref().map(|_| TargetType::WorkItem.as_str()),
                &format!(
                    "Heartbeat from {}: {}",
                    update.session_id,
                    update.progress.as_deref().unwrap_or("(no progress)")
                ),
                None,
            )
            .await?;
        Ok(beat)
    }

    /// Deregister a session: mark it completed and release every work
    /// item it still holds.
    pub async fn deregister(&self, session_id: &str) -> Result<()> {
        let agent = self.storage.get_agent(session_id).await?;
        let released = self.storage.release_items_claimed_by(session_id).await?;
        for item_id in &released {
            self.storage
                .append_event(
                    EventType::WorkItemReleased.as_str(),
                    Some(session_id),
                    Some(item_id),
                    Some(TargetType::WorkItem.as_str()),
                    &format!("Released work item {item_id} on deregistration"),
                    None,
                )
                .await?;
        }
        self.storage
            .update_agent_status(session_id, AgentStatus::Completed)
            .await?;

        let duration_secs = (Utc::now() - agent.created_at).num_seconds().max(0);
        self.storage
            .append_event(
                EventType::AgentDeregistered.as_str(),
                Some(session_id),
                Some(session_id),
                Some(TargetType::Agent.as_str()),
                &format!(
                    "Deregistered agent {} after {}s",
                    agent.agent_name, duration_secs
                ),
                Some(&serde_json::json!({
                    "duration_seconds": duration_secs,
                    "released_items": released,
                })),
            )
            .await?;
        info!(session_id, agent_name = %agent.agent_name, "agent deregistered");
        Ok(())
    }

    /// Sweep sessions whose `last_seen_at` is past the TTL and whose pid
    /// is no longer a live process. Returns the swept session ids.
    ///
    /// The orchestrator's own agent name is not exempt here; only the
    /// dispatcher concurrency count excludes it.
    pub async fn sweep_stale(&self) -> Result<Vec<String>> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(self.config.stale_ttl)
                .unwrap_or_else(|_| chrono::Duration::seconds(300));
        let candidates = self.storage.list_stale_candidates(cutoff).await?;

        let mut swept = Vec::new();
        for agent in candidates {
            if pid_alive(agent.pid) {
                continue;
            }
            let session_id = agent.session_id.as_ref().to_string();
            let released = self.storage.release_items_claimed_by(&session_id).await?;
            self.storage
                .update_agent_status(&session_id, AgentStatus::Stale)
                .await?;
            self.storage
                .append_event(
                    EventType::AgentDeregistered.as_str(),
                    None,
                    Some(&session_id),
                    Some(TargetType::Agent.as_str()),
                    &format!(
                        "Swept stale agent {} (pid {} dead, {} item(s) released)",
                        agent.agent_name,
                        agent.pid,
                        released.len()
                    ),
                    Some(&serde_json::json!({
                        "swept": true,
                        "released_items": released,
                    })),
                )
                .await?;
            warn!(
                session_id,
                agent_name = %agent.agent_name,
                pid = agent.pid,
                "swept stale agent"
            );
            swept.push(session_id);
        }
        Ok(swept)
    }
}

/// Probe whether a pid maps to a live process. Signal 0 performs the
/// permission check without delivering anything; EPERM still means alive.
pub fn pid_alive(pid: i64) -> bool {
    let Ok(pid) = i32::try_from(pid) else {
        return false;
    };
    if pid <= 0 {
        return false;
    }
    match nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid), None) {
        Ok(()) => true,
        Err(nix::errno::Errno::EPERM) => true,
        Err(_) => false,
    }
}
