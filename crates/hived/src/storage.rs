//! SQLite storage for the blackboard.
//!
//! Single-writer, read-concurrent persistence for projects, agent
//! sessions, work items, events, heartbeats, and SpecFlow features, plus
//! the full-text index over events. Every component coordinates through
//! this store; detached workers open their own pool on the same file.

use chrono::{DateTime, Utc};
use hive_core::types::{
    AgentSession, AgentStatus, Event, Feature, FeaturePhase, FeatureStatus, Heartbeat, Id,
    ItemStatus, Priority, Project, WorkItem,
};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Pool, QueryBuilder, Sqlite};
use std::path::Path;
use std::str::FromStr;
use thiserror::Error;

/// Explicit column list for work_items queries. Explicit columns keep row
/// mapping correct regardless of column order after ALTER TABLE.
const ITEM_COLUMNS: &str = "item_id, project_id, title, description, priority, status, \
    source, source_ref, claimed_by, created_at, updated_at, metadata";

const AGENT_COLUMNS: &str = "session_id, agent_name, project, work, parent_id, pid, status, \
    last_seen_at, created_at, metadata";

const EVENT_COLUMNS: &str =
    "id, ts, event_type, actor_id, target_id, target_type, summary, metadata";

const FEATURE_COLUMNS: &str = "feature_id, project_id, title, description, phase, status, \
    current_session, worktree_path, branch_name, main_branch, failure_count, max_failures, \
    last_error, phase_started_at, specify_score, plan_score, implement_score, pr_number, \
    pr_url, commit_sha, source_issue_number, source_issue_repo, created_at, updated_at";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(sqlx::Error),
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("constraint violated: {0}")]
    Constraint(String),
    #[error("project not found: {0}")]
    ProjectNotFound(String),
    #[error("agent not found: {0}")]
    AgentNotFound(String),
    #[error("work item not found: {0}")]
    ItemNotFound(String),
    #[error("work item {item} is not claimed by {session}")]
    NotClaimant { item: String, session: String },
    #[error("feature not found: {0}")]
    FeatureNotFound(String),
}

impl From<sqlx::Error> for StorageError {
    fn from(e: sqlx::Error) -> Self {
        if let Some(db) = e.as_database_error() {
            use sqlx::error::ErrorKind;
            match db.kind() {
                ErrorKind::UniqueViolation
                | ErrorKind::ForeignKeyViolation
                | ErrorKind::NotNullViolation
                | ErrorKind::CheckViolation => {
                    return Self::Constraint(db.message().to_string());
                }
                _ => {}
            }
        }
        Self::Database(e)
    }
}

pub type Result<T> = std::result::Result<T, StorageError>;

/// Filter for work-item listings.
#[derive(Debug, Clone, Default)]
pub struct ItemFilter {
    pub status: Option<ItemStatus>,
    pub priorities: Vec<Priority>,
    pub project: Option<String>,
    /// Return every item regardless of status, ordered by creation time.
    pub all: bool,
}

impl ItemFilter {
    pub fn available() -> Self {
        Self {
            status: Some(ItemStatus::Available),
            ..Self::default()
        }
    }
}

/// Storage backend shared by the dispatcher, orchestrator, and workers.
pub struct Storage {
    pool: Pool<Sqlite>,
}

impl std::fmt::Debug for Storage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Storage").finish_non_exhaustive()
    }
}

impl Storage {
    /// Open (creating if needed) the store at the given path.
    pub async fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).ok();
        }

        let options = SqliteConnectOptions::from_str(&format!("sqlite://{}", db_path.display()))
            .map_err(StorageError::from)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        Ok(Self { pool })
    }

    /// Run embedded migrations to initialize or update the schema.
    /// Idempotent; safe to call on every open.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    fn now_ms() -> i64 {
        Utc::now().timestamp_millis()
    }

    // --- Project operations ---

    /// Insert or update a project registration.
    pub async fn upsert_project(&self, project: &Project) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO projects (project_id, display_name, local_path, remote_repo, metadata, registered_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ON CONFLICT(project_id) DO UPDATE SET
                display_name = excluded.display_name,
                local_path = excluded.local_path,
                remote_repo = excluded.remote_repo,
                metadata = excluded.metadata
            "#,
        )
        .bind(&project.project_id)
        .bind(&project.display_name)
        .bind(&project.local_path)
        .bind(&project.remote_repo)
        .bind(&project.metadata)
        .bind(project.registered_at.timestamp_millis())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_project(&self, project_id: &str) -> Result<Project> {
        self.maybe_project(project_id)
            .await?
            .ok_or_else(|| StorageError::ProjectNotFound(project_id.to_string()))
    }

    pub async fn maybe_project(&self, project_id: &str) -> Result<Option<Project>> {
        let row = sqlx::query_as::<_, ProjectRow>(
            "SELECT project_id, display_name, local_path, remote_repo, metadata, registered_at \
             FROM projects WHERE project_id = ?1",
        )
        .bind(project_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(ProjectRow::into_project))
    }

    // --- Agent operations ---

    pub async fn insert_agent(&self, agent: &AgentSession) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO agents (session_id, agent_name, project, work, parent_id, pid, status,
                                last_seen_at, created_at, metadata)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            "#,
        )
        .bind(agent.session_id.as_ref())
        .bind(&agent.agent_name)
        .bind(&agent.project)
        .bind(&agent.work)
        .bind(&agent.parent_id)
        .bind(agent.pid)
        .bind(agent.status.as_str())
        .bind(agent.last_seen_at.timestamp_millis())
        .bind(agent.created_at.timestamp_millis())
        .bind(&agent.metadata)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_agent(&self, session_id: &str) -> Result<AgentSession> {
        let query = format!("SELECT {AGENT_COLUMNS} FROM agents WHERE session_id = ?1");
        let row = sqlx::query_as::<_, AgentRow>(&query)
            .bind(session_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StorageError::AgentNotFound(session_id.to_string()))?;
        Ok(row.into_agent())
    }

    pub async fn update_agent_status(&self, session_id: &str, status: AgentStatus) -> Result<()> {
        let result = sqlx::query("UPDATE agents SET status = ?1, last_seen_at = ?2 WHERE session_id = ?3")
            .bind(status.as_str())
            .bind(Self::now_ms())
            .bind(session_id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StorageError::AgentNotFound(session_id.to_string()));
        }
        Ok(())
    }

    /// Refresh a session's liveness timestamp.
    pub async fn touch_agent(&self, session_id: &str) -> Result<()> {
        let result = sqlx::query("UPDATE agents SET last_seen_at = ?1 WHERE session_id = ?2")
            .bind(Self::now_ms())
            .bind(session_id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StorageError::AgentNotFound(session_id.to_string()));
        }
        Ok(())
    }

    /// Rewrite the pid recorded for a session. Detached workers call this
    /// on startup so the stale sweep probes the live process.
    pub async fn rewrite_agent_pid(&self, session_id: &str, pid: i64) -> Result<()> {
        let result =
            sqlx::query("UPDATE agents SET pid = ?1, last_seen_at = ?2 WHERE session_id = ?3")
                .bind(pid)
                .bind(Self::now_ms())
                .bind(session_id)
                .execute(&self.pool)
                .await?;
        if result.rows_affected() == 0 {
            return Err(StorageError::AgentNotFound(session_id.to_string()));
        }
        Ok(())
    }

    /// Sessions in {active, idle} last seen before the cutoff.
    pub async fn list_stale_candidates(&self, cutoff: DateTime<Utc>) -> Result<Vec<AgentSession>> {
        let query = format!(
            "SELECT {AGENT_COLUMNS} FROM agents \
             WHERE status IN ('active', 'idle') AND last_seen_at < ?1 \
             ORDER BY last_seen_at ASC"
        );
        let rows = sqlx::query_as::<_, AgentRow>(&query)
            .bind(cutoff.timestamp_millis())
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(AgentRow::into_agent).collect())
    }

    /// Count of live sessions (active or idle), excluding the named
    /// orchestrator agent. Used for the dispatcher concurrency check.
    pub async fn count_live_agents_excluding(&self, excluded_name: &str) -> Result<usize> {
        let count: (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM agents \
             WHERE status IN ('active', 'idle') AND agent_name != ?1",
        )
        .bind(excluded_name)
        .fetch_one(&self.pool)
        .await?;
        Ok(count.0 as usize)
    }

    // --- Work item operations ---

    pub async fn insert_work_item(&self, item: &WorkItem) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO work_items (item_id, project_id, title, description, priority, status,
                                    source, source_ref, claimed_by, created_at, updated_at, metadata)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
            "#,
        )
        .bind(&item.item_id)
        .bind(&item.project_id)
        .bind(&item.title)
        .bind(&item.description)
        .bind(item.priority.as_str())
        .bind(item.status.as_str())
        .bind(&item.source)
        .bind(&item.source_ref)
        .bind(&item.claimed_by)
        .bind(item.created_at.timestamp_millis())
        .bind(item.updated_at.timestamp_millis())
        .bind(&item.metadata)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_work_item(&self, item_id: &str) -> Result<WorkItem> {
        self.maybe_work_item(item_id)
            .await?
            .ok_or_else(|| StorageError::ItemNotFound(item_id.to_string()))
    }

    pub async fn maybe_work_item(&self, item_id: &str) -> Result<Option<WorkItem>> {
        let query = format!("SELECT {ITEM_COLUMNS} FROM work_items WHERE item_id = ?1");
        let row = sqlx::query_as::<_, ItemRow>(&query)
            .bind(item_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(ItemRow::into_item))
    }

    /// List work items. Without `all`, unfiltered listings return open
    /// items only (available or claimed); ordering is strict
    /// `(priority, created_at, item_id)`.
    pub async fn list_work_items(&self, filter: &ItemFilter) -> Result<Vec<WorkItem>> {
        let mut builder: QueryBuilder<Sqlite> =
            QueryBuilder::new(format!("SELECT {ITEM_COLUMNS} FROM work_items WHERE 1=1"));

        if let Some(status) = filter.status {
            builder.push(" AND status = ");
            builder.push_bind(status.as_str());
        } else if !filter.all {
            builder.push(" AND status IN ('available', 'claimed')");
        }
        if !filter.priorities.is_empty() {
            builder.push(" AND priority IN (");
            let mut separated = builder.separated(", ");
            for priority in &filter.priorities {
                separated.push_bind(priority.as_str());
            }
            builder.push(")");
        }
        if let Some(project) = &filter.project {
            builder.push(" AND project_id = ");
            builder.push_bind(project);
        }
        if filter.all {
            builder.push(" ORDER BY created_at ASC, item_id ASC");
        } else {
            builder.push(" ORDER BY priority ASC, created_at ASC, item_id ASC");
        }

        let rows = builder
            .build_query_as::<ItemRow>()
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(ItemRow::into_item).collect())
    }

    /// Atomic claim: `available -> claimed` compare-and-set. Returns true
    /// when this session won the item; racing claimants see false.
    pub async fn claim_work_item(&self, item_id: &str, session_id: &str) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE work_items SET status = 'claimed', claimed_by = ?1, updated_at = ?2 \
             WHERE item_id = ?3 AND status = 'available'",
        )
        .bind(session_id)
        .bind(Self::now_ms())
        .bind(item_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Complete a claimed item. Only the claimant session may do this.
    pub async fn complete_work_item(&self, item_id: &str, session_id: &str) -> Result<()> {
        self.finish_claimed(item_id, session_id, ItemStatus::Completed)
            .await
    }

    /// Return a claimed item to the queue. Only the claimant session may
    /// do this.
    pub async fn release_work_item(&self, item_id: &str, session_id: &str) -> Result<()> {
        let result = sqlx::query(
            "UPDATE work_items SET status = 'available', claimed_by = NULL, updated_at = ?1 \
             WHERE item_id = ?2 AND status = 'claimed' AND claimed_by = ?3",
        )
        .bind(Self::now_ms())
        .bind(item_id)
        .bind(session_id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(self.claimant_error(item_id, session_id).await);
        }
        Ok(())
    }

    async fn finish_claimed(
        &self,
        item_id: &str,
        session_id: &str,
        status: ItemStatus,
    ) -> Result<()> {
        let result = sqlx::query(
            "UPDATE work_items SET status = ?1, updated_at = ?2 \
             WHERE item_id = ?3 AND status = 'claimed' AND claimed_by = ?4",
        )
        .bind(status.as_str())
        .bind(Self::now_ms())
        .bind(item_id)
        .bind(session_id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(self.claimant_error(item_id, session_id).await);
        }
        Ok(())
    }

    async fn claimant_error(&self, item_id: &str, session_id: &str) -> StorageError {
        match self.maybe_work_item(item_id).await {
            Ok(Some(_)) => StorageError::NotClaimant {
                item: item_id.to_string(),
                session: session_id.to_string(),
            },
            _ => StorageError::ItemNotFound(item_id.to_string()),
        }
    }

    /// Mark an item failed (terminal) from available or claimed.
    pub async fn fail_work_item(&self, item_id: &str) -> Result<()> {
        let result = sqlx::query(
            "UPDATE work_items SET status = 'failed', claimed_by = NULL, updated_at = ?1 \
             WHERE item_id = ?2 AND status IN ('available', 'claimed')",
        )
        .bind(Self::now_ms())
        .bind(item_id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StorageError::ItemNotFound(item_id.to_string()));
        }
        Ok(())
    }

    /// Release every item still claimed by a session; returns their ids.
    /// Used by deregistration and the stale sweep.
    pub async fn release_items_claimed_by(&self, session_id: &str) -> Result<Vec<String>> {
        let ids: Vec<(String,)> = sqlx::query_as(
            "UPDATE work_items SET status = 'available', claimed_by = NULL, updated_at = ?1 \
             WHERE claimed_by = ?2 AND status = 'claimed' RETURNING item_id",
        )
        .bind(Self::now_ms())
        .bind(session_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(ids.into_iter().map(|(id,)| id).collect())
    }

    /// Merge a JSON patch into an item's metadata bag (shallow, per key).
    pub async fn update_work_item_metadata(
        &self,
        item_id: &str,
        patch: &serde_json::Value,
    ) -> Result<()> {
        let item = self.get_work_item(item_id).await?;
        let mut merged = item
            .metadata_value()
            .unwrap_or_else(|| serde_json::json!({}));
        if let (Some(target), Some(source)) = (merged.as_object_mut(), patch.as_object()) {
            for (key, value) in source {
                target.insert(key.clone(), value.clone());
            }
        }
        let raw = serde_json::to_string(&merged)?;
        sqlx::query("UPDATE work_items SET metadata = ?1, updated_at = ?2 WHERE item_id = ?3")
            .bind(raw)
            .bind(Self::now_ms())
            .bind(item_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // --- Event operations ---

    /// Append an event with a server-side timestamp.
    pub async fn append_event(
        &self,
        event_type: &str,
        actor_id: Option<&str>,
        target_id: Option<&str>,
        target_type: Option<&str>,
        summary: &str,
        metadata: Option<&serde_json::Value>,
    ) -> Result<Event> {
        let now = Utc::now();
        let metadata_json = metadata.map(serde_json::Value::to_string);
        let id: (i64,) = sqlx::query_as(
            "INSERT INTO events (ts, event_type, actor_id, target_id, target_type, summary, metadata) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7) RETURNING id",
        )
        .bind(now.timestamp_millis())
        .bind(event_type)
        .bind(actor_id)
        .bind(target_id)
        .bind(target_type)
        .bind(summary)
        .bind(&metadata_json)
        .fetch_one(&self.pool)
        .await?;

        Ok(Event {
            id: id.0,
            timestamp: now,
            event_type: event_type.to_string(),
            actor_id: actor_id.map(String::from),
            target_id: target_id.map(String::from),
            target_type: target_type.map(String::from),
            summary: summary.to_string(),
            metadata: metadata_json,
        })
    }

    pub async fn recent_events(&self, limit: i64) -> Result<Vec<Event>> {
        let query =
            format!("SELECT {EVENT_COLUMNS} FROM events ORDER BY ts DESC, id DESC LIMIT ?1");
        let rows = sqlx::query_as::<_, EventRow>(&query)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(EventRow::into_event).collect())
    }

    pub async fn events_since(&self, since: DateTime<Utc>) -> Result<Vec<Event>> {
        let query =
            format!("SELECT {EVENT_COLUMNS} FROM events WHERE ts >= ?1 ORDER BY ts ASC, id ASC");
        let rows = sqlx::query_as::<_, EventRow>(&query)
            .bind(since.timestamp_millis())
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(EventRow::into_event).collect())
    }

    pub async fn events_by_type(
        &self,
        event_type: &str,
        limit: i64,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<Event>> {
        let query = format!(
            "SELECT {EVENT_COLUMNS} FROM events \
             WHERE event_type = ?1 AND ts >= ?2 ORDER BY ts DESC, id DESC LIMIT ?3"
        );
        let rows = sqlx::query_as::<_, EventRow>(&query)
            .bind(event_type)
            .bind(since.map_or(0, |t| t.timestamp_millis()))
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(EventRow::into_event).collect())
    }

    pub async fn events_by_actor(
        &self,
        actor_id: &str,
        limit: i64,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<Event>> {
        let query = format!(
            "SELECT {EVENT_COLUMNS} FROM events \
             WHERE actor_id = ?1 AND ts >= ?2 ORDER BY ts DESC, id DESC LIMIT ?3"
        );
        let rows = sqlx::query_as::<_, EventRow>(&query)
            .bind(actor_id)
            .bind(since.map_or(0, |t| t.timestamp_millis()))
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(EventRow::into_event).collect())
    }

    /// Ranked full-text search over event summaries and metadata.
    /// Results are ordered best-first (ascending bm25 rank).
    pub async fn search_events(
        &self,
        query: &str,
        limit: i64,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<(Event, f64)>> {
        let sql = "SELECT e.id, e.ts, e.event_type, e.actor_id, e.target_id, e.target_type, \
                    e.summary, e.metadata, bm25(events_fts) AS rank \
             FROM events_fts \
             JOIN events e ON e.id = events_fts.rowid \
             WHERE events_fts MATCH ?1 AND e.ts >= ?2 \
             ORDER BY rank ASC LIMIT ?3";
        let rows = sqlx::query_as::<_, SearchRow>(sql)
            .bind(query)
            .bind(since.map_or(0, |t| t.timestamp_millis()))
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(SearchRow::into_ranked).collect())
    }

    /// Rebuild the full-text index from the events table. Needed once when
    /// migrating a store that predates the index.
    pub async fn rebuild_search_index(&self) -> Result<()> {
        sqlx::query("INSERT INTO events_fts(events_fts) VALUES ('rebuild')")
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // --- Heartbeat operations ---

    pub async fn insert_heartbeat(
        &self,
        session_id: &str,
        progress: Option<&str>,
        work_item_id: Option<&str>,
    ) -> Result<Heartbeat> {
        let now = Utc::now();
        let id: (i64,) = sqlx::query_as(
            "INSERT INTO heartbeats (ts, session_id, progress, work_item_id) \
             VALUES (?1, ?2, ?3, ?4) RETURNING id",
        )
        .bind(now.timestamp_millis())
        .bind(session_id)
        .bind(progress)
        .bind(work_item_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(Heartbeat {
            id: id.0,
            timestamp: now,
            session_id: session_id.to_string(),
            progress: progress.map(String::from),
            work_item_id: work_item_id.map(String::from),
        })
    }

    // --- Feature operations ---

    pub async fn insert_feature(&self, feature: &Feature) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO features (feature_id, project_id, title, description, phase, status,
                                  current_session, worktree_path, branch_name, main_branch,
                                  failure_count, max_failures, last_error, phase_started_at,
                                  specify_score, plan_score, implement_score, pr_number, pr_url,
                                  commit_sha, source_issue_number, source_issue_repo,
                                  created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17,
                    ?18, ?19, ?20, ?21, ?22, ?23, ?24)
            "#,
        )
        .bind(&feature.feature_id)
        .bind(&feature.project_id)
        .bind(&feature.title)
        .bind(&feature.description)
        .bind(feature.phase.as_str())
        .bind(feature.status.as_str())
        .bind(&feature.current_session)
        .bind(&feature.worktree_path)
        .bind(&feature.branch_name)
        .bind(&feature.main_branch)
        .bind(i64::from(feature.failure_count))
        .bind(i64::from(feature.max_failures))
        .bind(&feature.last_error)
        .bind(feature.phase_started_at.map(|t| t.timestamp_millis()))
        .bind(feature.specify_score)
        .bind(feature.plan_score)
        .bind(feature.implement_score)
        .bind(feature.pr_number)
        .bind(&feature.pr_url)
        .bind(&feature.commit_sha)
        .bind(feature.source_issue_number)
        .bind(&feature.source_issue_repo)
        .bind(feature.created_at.timestamp_millis())
        .bind(feature.updated_at.timestamp_millis())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_feature(&self, feature_id: &str) -> Result<Feature> {
        let query = format!("SELECT {FEATURE_COLUMNS} FROM features WHERE feature_id = ?1");
        let row = sqlx::query_as::<_, FeatureRow>(&query)
            .bind(feature_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StorageError::FeatureNotFound(feature_id.to_string()))?;
        Ok(row.into_feature())
    }

    /// Persist every mutable field of a feature. All orchestrator state
    /// transitions flow through here; the drain loop re-reads between
    /// actions.
    pub async fn update_feature(&self, feature: &Feature) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE features SET
                phase = ?1, status = ?2, current_session = ?3, worktree_path = ?4,
                branch_name = ?5, main_branch = ?6, failure_count = ?7, max_failures = ?8,
                last_error = ?9, phase_started_at = ?10, specify_score = ?11, plan_score = ?12,
                implement_score = ?13, pr_number = ?14, pr_url = ?15, commit_sha = ?16,
                source_issue_number = ?17, source_issue_repo = ?18, updated_at = ?19
            WHERE feature_id = ?20
            "#,
        )
        .bind(feature.phase.as_str())
        .bind(feature.status.as_str())
        .bind(&feature.current_session)
        .bind(&feature.worktree_path)
        .bind(&feature.branch_name)
        .bind(&feature.main_branch)
        .bind(i64::from(feature.failure_count))
        .bind(i64::from(feature.max_failures))
        .bind(&feature.last_error)
        .bind(feature.phase_started_at.map(|t| t.timestamp_millis()))
        .bind(feature.specify_score)
        .bind(feature.plan_score)
        .bind(feature.implement_score)
        .bind(feature.pr_number)
        .bind(&feature.pr_url)
        .bind(&feature.commit_sha)
        .bind(feature.source_issue_number)
        .bind(&feature.source_issue_repo)
        .bind(Self::now_ms())
        .bind(&feature.feature_id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StorageError::FeatureNotFound(feature.feature_id.clone()));
        }
        Ok(())
    }

    /// Features the orchestrator could act on this tick, oldest first.
    pub async fn list_actionable_features(&self, limit: i64) -> Result<Vec<Feature>> {
        let query = format!(
            "SELECT {FEATURE_COLUMNS} FROM features \
             WHERE phase NOT IN ('completed', 'failed') \
               AND status IN ('pending', 'active', 'succeeded') \
             ORDER BY created_at ASC, feature_id ASC LIMIT ?1"
        );
        let rows = sqlx::query_as::<_, FeatureRow>(&query)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(FeatureRow::into_feature).collect())
    }

    /// Reset every active feature to pending, clearing its session.
    /// Returns the number of features released. Idempotent: a second call
    /// finds no active features and does nothing.
    pub async fn release_orphaned_features(&self, last_error: &str) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE features SET status = 'pending', current_session = NULL, \
             last_error = ?1, updated_at = ?2 WHERE status = 'active'",
        )
        .bind(last_error)
        .bind(Self::now_ms())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}

// --- Row types for SQLx ---

#[derive(sqlx::FromRow)]
struct ProjectRow {
    project_id: String,
    display_name: String,
    local_path: Option<String>,
    remote_repo: Option<String>,
    metadata: Option<String>,
    registered_at: i64,
}

impl ProjectRow {
    fn into_project(self) -> Project {
        Project {
            project_id: self.project_id,
            display_name: self.display_name,
            local_path: self.local_path,
            remote_repo: self.remote_repo,
            metadata: self.metadata,
            registered_at: DateTime::from_timestamp_millis(self.registered_at).unwrap_or_default(),
        }
    }
}

#[derive(sqlx::FromRow)]
struct AgentRow {
    session_id: String,
    agent_name: String,
    project: Option<String>,
    work: Option<String>,
    parent_id: Option<String>,
    pid: i64,
    status: String,
    last_seen_at: i64,
    created_at: i64,
    metadata: Option<String>,
}

impl AgentRow {
    fn into_agent(self) -> AgentSession {
        AgentSession {
            session_id: Id::from_string(self.session_id),
            agent_name: self.agent_name,
            project: self.project,
            work: self.work,
            parent_id: self.parent_id,
            pid: self.pid,
            status: AgentStatus::parse(&self.status).unwrap_or(AgentStatus::Stale),
            last_seen_at: DateTime::from_timestamp_millis(self.last_seen_at).unwrap_or_default(),
            created_at: DateTime::from_timestamp_millis(self.created_at).unwrap_or_default(),
            metadata: self.metadata,
        }
    }
}

#[derive(sqlx::FromRow)]
struct ItemRow {
    item_id: String,
    project_id: Option<String>,
    title: String,
    description: Option<String>,
    priority: String,
    status: String,
    source: Option<String>,
    source_ref: Option<String>,
    claimed_by: Option<String>,
    created_at: i64,
    updated_at: i64,
    metadata: Option<String>,
}

impl ItemRow {
    fn into_item(self) -> WorkItem {
        WorkItem {
            item_id: self.item_id,
            project_id: self.project_id,
            title: self.title,
            description: self.description,
            priority: Priority::parse(&self.priority).unwrap_or(Priority::P3),
            status: ItemStatus::parse(&self.status).unwrap_or(ItemStatus::Failed),
            source: self.source,
            source_ref: self.source_ref,
            claimed_by: self.claimed_by,
            created_at: DateTime::from_timestamp_millis(self.created_at).unwrap_or_default(),
            updated_at: DateTime::from_timestamp_millis(self.updated_at).unwrap_or_default(),
            metadata: self.metadata,
        }
    }
}

#[derive(sqlx::FromRow)]
struct EventRow {
    id: i64,
    ts: i64,
    event_type: String,
    actor_id: Option<String>,
    target_id: Option<String>,
    target_type: Option<String>,
    summary: String,
    metadata: Option<String>,
}

impl EventRow {
    fn into_event(self) -> Event {
        Event {
            id: self.id,
            timestamp: DateTime::from_timestamp_millis(self.ts).unwrap_or_default(),
            event_type: self.event_type,
            actor_id: self.actor_id,
            target_id: self.target_id,
            target_type: self.target_type,
            summary: self.summary,
            metadata: self.metadata,
        }
    }
}

#[derive(sqlx::FromRow)]
struct SearchRow {
    id: i64,
    ts: i64,
    event_type: String,
    actor_id: Option<String>,
    target_id: Option<String>,
    target_type: Option<String>,
    summary: String,
    metadata: Option<String>,
    rank: f64,
}

impl SearchRow {
    fn into_ranked(self) -> (Event, f64) {
        let rank = self.rank;
        let event = Event {
            id: self.id,
            timestamp: DateTime::from_timestamp_millis(self.ts).unwrap_or_default(),
            event_type: self.event_type,
            actor_id: self.actor_id,
            target_id: self.target_id,
            target_type: self.target_type,
            summary: self.summary,
            metadata: self.metadata,
        };
        (event, rank)
    }
}

#[derive(sqlx::FromRow)]
struct FeatureRow {
    feature_id: String,
    project_id: String,
    title: String,
    description: String,
    phase: String,
    status: String,
    current_session: Option<String>,
    worktree_path: Option<String>,
    branch_name: Option<String>,
    main_branch: Option<String>,
    failure_count: i64,
    max_failures: i64,
    last_error: Option<String>,
    phase_started_at: Option<i64>,
    specify_score: Option<f64>,
    plan_score: Option<f64>,
    implement_score: Option<f64>,
    pr_number: Option<i64>,
    pr_url: Option<String>,
    commit_sha: Option<String>,
    source_issue_number: Option<i64>,
    source_issue_repo: Option<String>,
    created_at: i64,
    updated_at: i64,
}

impl FeatureRow {
    fn into_feature(self) -> Feature {
        Feature {
            feature_id: self.feature_id,
            project_id: self.project_id,
            title: self.title,
            description: self.description,
            phase: FeaturePhase::parse(&self.phase).unwrap_or(FeaturePhase::Failed),
            status: FeatureStatus::parse(&self.status).unwrap_or(FeatureStatus::Failed),
            current_session: self.current_session,
            worktree_path: self.worktree_path,
            branch_name: self.branch_name,
            main_branch: self.main_branch,
            failure_count: self.failure_count as u32,
            max_failures: self.max_failures as u32,
            last_error: self.last_error,
            phase_started_at: self.phase_started_at.and_then(DateTime::from_timestamp_millis),
            specify_score: self.specify_score,
            plan_score: self.plan_score,
            implement_score: self.implement_score,
            pr_number: self.pr_number,
            pr_url: self.pr_url,
            commit_sha: self.commit_sha,
            source_issue_number: self.source_issue_number,
            source_issue_repo: self.source_issue_repo,
            created_at: DateTime::from_timestamp_millis(self.created_at).unwrap_or_default(),
            updated_at: DateTime::from_timestamp_millis(self.updated_at).unwrap_or_default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hive_core::events::EventType;
    use tempfile::TempDir;

    struct TestStorage {
        storage: Storage,
        _dir: TempDir, // Keep alive to prevent cleanup
    }

    async fn create_test_storage() -> TestStorage {
        let dir = TempDir::new().unwrap();
        let db_path = dir.path().join("test.db");
        let storage = Storage::open(&db_path).await.unwrap();
        storage.migrate().await.unwrap();
        TestStorage { storage, _dir: dir }
    }

    fn test_agent(name: &str) -> AgentSession {
        let now = Utc::now();
        AgentSession {
            session_id: Id::new(),
            agent_name: name.to_string(),
            project: Some("proj".to_string()),
            work: None,
            parent_id: None,
            pid: 4242,
            status: AgentStatus::Active,
            last_seen_at: now,
            created_at: now,
            metadata: None,
        }
    }

    fn test_item(id: &str) -> WorkItem {
        let now = Utc::now();
        WorkItem {
            item_id: id.to_string(),
            project_id: Some("proj".to_string()),
            title: format!("item {id}"),
            description: None,
            priority: Priority::P2,
            status: ItemStatus::Available,
            source: Some("github".to_string()),
            source_ref: None,
            claimed_by: None,
            created_at: now,
            updated_at: now,
            metadata: None,
        }
    }

    #[tokio::test]
    async fn migrate_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let storage = Storage::open(&dir.path().join("t.db")).await.unwrap();
        storage.migrate().await.unwrap();
        storage.migrate().await.unwrap();
    }

    #[tokio::test]
    async fn project_upsert_round_trips() {
        let ts = create_test_storage().await;
        let project = Project {
            project_id: "pai".to_string(),
            display_name: "PAI".to_string(),
            local_path: Some("/repos/pai".to_string()),
            remote_repo: None,
            metadata: Some(r#"{"specflow_enabled": true}"#.to_string()),
            registered_at: Utc::now(),
        };
        ts.storage.upsert_project(&project).await.unwrap();
        let loaded = ts.storage.get_project("pai").await.unwrap();
        assert_eq!(loaded.local_path.as_deref(), Some("/repos/pai"));
        assert!(loaded.settings().specflow_enabled);

        // Upsert replaces mutable fields.
        let updated = Project {
            display_name: "PAI v2".to_string(),
            ..project
        };
        ts.storage.upsert_project(&updated).await.unwrap();
        let loaded = ts.storage.get_project("pai").await.unwrap();
        assert_eq!(loaded.display_name, "PAI v2");
    }

    #[tokio::test]
    async fn agent_insert_and_pid_rewrite() {
        let ts = create_test_storage().await;
        let agent = test_agent("worker-1");
        ts.storage.insert_agent(&agent).await.unwrap();

        ts.storage
            .rewrite_agent_pid(agent.session_id.as_ref(), 999)
            .await
            .unwrap();
        let loaded = ts.storage.get_agent(agent.session_id.as_ref()).await.unwrap();
        assert_eq!(loaded.pid, 999);
    }

    #[tokio::test]
    async fn count_live_agents_excludes_orchestrator() {
        let ts = create_test_storage().await;
        ts.storage.insert_agent(&test_agent("worker-1")).await.unwrap();
        ts.storage.insert_agent(&test_agent("ivy-heartbeat")).await.unwrap();
        let mut done = test_agent("worker-2");
        done.status = AgentStatus::Completed;
        ts.storage.insert_agent(&done).await.unwrap();

        let count = ts
            .storage
            .count_live_agents_excluding("ivy-heartbeat")
            .await
            .unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn work_item_round_trips_with_defaults() {
        let ts = create_test_storage().await;
        let item = test_item("gh-proj-1");
        ts.storage.insert_work_item(&item).await.unwrap();

        let listed = ts
            .storage
            .list_work_items(&ItemFilter { all: true, ..ItemFilter::default() })
            .await
            .unwrap();
        let found = listed.iter().find(|i| i.item_id == "gh-proj-1").unwrap();
        assert_eq!(found.title, item.title);
        assert_eq!(found.priority, Priority::P2);
        assert_eq!(found.status, ItemStatus::Available);
        assert_eq!(found.source.as_deref(), Some("github"));
    }

    #[tokio::test]
    async fn duplicate_item_id_is_a_constraint_error() {
        let ts = create_test_storage().await;
        ts.storage.insert_work_item(&test_item("dup")).await.unwrap();
        let err = ts.storage.insert_work_item(&test_item("dup")).await.unwrap_err();
        assert!(matches!(err, StorageError::Constraint(_)), "got {err:?}");
    }

    #[tokio::test]
    async fn claim_is_exclusive_between_two_sessions() {
        let ts = create_test_storage().await;
        let a = test_agent("worker-a");
        let b = test_agent("worker-b");
        ts.storage.insert_agent(&a).await.unwrap();
        ts.storage.insert_agent(&b).await.unwrap();
        ts.storage.insert_work_item(&test_item("contested")).await.unwrap();

        let first = ts
            .storage
            .claim_work_item("contested", a.session_id.as_ref())
            .await
            .unwrap();
        let second = ts
            .storage
            .claim_work_item("contested", b.session_id.as_ref())
            .await
            .unwrap();
        assert!(first);
        assert!(!second);

        let item = ts.storage.get_work_item("contested").await.unwrap();
        assert_eq!(item.status, ItemStatus::Claimed);
        assert_eq!(item.claimed_by.as_deref(), Some(a.session_id.as_ref()));
    }

    #[tokio::test]
    async fn complete_requires_claimant() {
        let ts = create_test_storage().await;
        let a = test_agent("worker-a");
        let b = test_agent("worker-b");
        ts.storage.insert_agent(&a).await.unwrap();
        ts.storage.insert_agent(&b).await.unwrap();
        ts.storage.insert_work_item(&test_item("owned")).await.unwrap();
        ts.storage
            .claim_work_item("owned", a.session_id.as_ref())
            .await
            .unwrap();

        let err = ts
            .storage
            .complete_work_item("owned", b.session_id.as_ref())
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::NotClaimant { .. }));

        ts.storage
            .complete_work_item("owned", a.session_id.as_ref())
            .await
            .unwrap();
        let item = ts.storage.get_work_item("owned").await.unwrap();
        assert_eq!(item.status, ItemStatus::Completed);
    }

    #[tokio::test]
    async fn release_returns_item_to_queue() {
        let ts = create_test_storage().await;
        let a = test_agent("worker-a");
        ts.storage.insert_agent(&a).await.unwrap();
        ts.storage.insert_work_item(&test_item("bounce")).await.unwrap();
        ts.storage
            .claim_work_item("bounce", a.session_id.as_ref())
            .await
            .unwrap();
        ts.storage
            .release_work_item("bounce", a.session_id.as_ref())
            .await
            .unwrap();

        let item = ts.storage.get_work_item("bounce").await.unwrap();
        assert_eq!(item.status, ItemStatus::Available);
        assert!(item.claimed_by.is_none());
    }

    #[tokio::test]
    async fn release_items_claimed_by_session() {
        let ts = create_test_storage().await;
        let a = test_agent("worker-a");
        ts.storage.insert_agent(&a).await.unwrap();
        for id in ["one", "two"] {
            ts.storage.insert_work_item(&test_item(id)).await.unwrap();
            ts.storage
                .claim_work_item(id, a.session_id.as_ref())
                .await
                .unwrap();
        }

        let released = ts
            .storage
            .release_items_claimed_by(a.session_id.as_ref())
            .await
            .unwrap();
        assert_eq!(released.len(), 2);
        for id in ["one", "two"] {
            let item = ts.storage.get_work_item(id).await.unwrap();
            assert_eq!(item.status, ItemStatus::Available);
        }
    }

    #[tokio::test]
    async fn list_orders_by_priority_then_age() {
        let ts = create_test_storage().await;
        let mut p3 = test_item("c-old-p3");
        p3.priority = Priority::P3;
        p3.created_at = DateTime::from_timestamp_millis(1_000).unwrap();
        let mut p1 = test_item("b-new-p1");
        p1.priority = Priority::P1;
        p1.created_at = DateTime::from_timestamp_millis(9_000).unwrap();
        let mut p2 = test_item("a-mid-p2");
        p2.priority = Priority::P2;
        p2.created_at = DateTime::from_timestamp_millis(5_000).unwrap();

        for item in [&p3, &p1, &p2] {
            ts.storage.insert_work_item(item).await.unwrap();
        }

        let listed = ts
            .storage
            .list_work_items(&ItemFilter::available())
            .await
            .unwrap();
        let ids: Vec<&str> = listed.iter().map(|i| i.item_id.as_str()).collect();
        assert_eq!(ids, vec!["b-new-p1", "a-mid-p2", "c-old-p3"]);
    }

    #[tokio::test]
    async fn list_filters_by_priority_set() {
        let ts = create_test_storage().await;
        for (id, priority) in [("i1", Priority::P1), ("i2", Priority::P2), ("i3", Priority::P3)] {
            let mut item = test_item(id);
            item.priority = priority;
            ts.storage.insert_work_item(&item).await.unwrap();
        }

        let filter = ItemFilter {
            priorities: Priority::parse_list("P1,P2"),
            ..ItemFilter::available()
        };
        let listed = ts.storage.list_work_items(&filter).await.unwrap();
        let ids: Vec<&str> = listed.iter().map(|i| i.item_id.as_str()).collect();
        assert_eq!(ids, vec!["i1", "i2"]);
    }

    #[tokio::test]
    async fn metadata_merge_patches_existing_keys() {
        let ts = create_test_storage().await;
        let mut item = test_item("meta");
        item.metadata = Some(r#"{"keep": 1, "replace": "old"}"#.to_string());
        ts.storage.insert_work_item(&item).await.unwrap();

        ts.storage
            .update_work_item_metadata("meta", &serde_json::json!({"replace": "new", "added": true}))
            .await
            .unwrap();

        let loaded = ts.storage.get_work_item("meta").await.unwrap();
        let value = loaded.metadata_value().unwrap();
        assert_eq!(value["keep"], 1);
        assert_eq!(value["replace"], "new");
        assert_eq!(value["added"], true);
    }

    #[tokio::test]
    async fn events_append_and_query() {
        let ts = create_test_storage().await;
        ts.storage
            .append_event(
                EventType::WorkItemCreated.as_str(),
                Some("session-1"),
                Some("item-1"),
                Some("work_item"),
                "Created work item item-1",
                None,
            )
            .await
            .unwrap();
        ts.storage
            .append_event(
                EventType::WorkItemClaimed.as_str(),
                Some("session-1"),
                Some("item-1"),
                Some("work_item"),
                "Claimed work item item-1",
                None,
            )
            .await
            .unwrap();

        let recent = ts.storage.recent_events(10).await.unwrap();
        assert_eq!(recent.len(), 2);

        let by_type = ts
            .storage
            .events_by_type(EventType::WorkItemClaimed.as_str(), 10, None)
            .await
            .unwrap();
        assert_eq!(by_type.len(), 1);
        assert_eq!(by_type[0].summary, "Claimed work item item-1");

        let by_actor = ts.storage.events_by_actor("session-1", 10, None).await.unwrap();
        assert_eq!(by_actor.len(), 2);

        let since_epoch = ts
            .storage
            .events_since(DateTime::from_timestamp_millis(0).unwrap())
            .await
            .unwrap();
        assert_eq!(since_epoch.len(), 2);
        let since_future = ts
            .storage
            .events_since(Utc::now() + chrono::Duration::hours(1))
            .await
            .unwrap();
        assert!(since_future.is_empty());
    }

    #[tokio::test]
    async fn event_search_finds_fresh_appends() {
        let ts = create_test_storage().await;
        ts.storage
            .append_event(
                EventType::WorkItemCompleted.as_str(),
                None,
                Some("gh-pai-7"),
                Some("work_item"),
                "Completed zanzibar fix for issue 7",
                Some(&serde_json::json!({"pr": 101})),
            )
            .await
            .unwrap();
        ts.storage
            .append_event(
                EventType::WorkItemCreated.as_str(),
                None,
                Some("other"),
                Some("work_item"),
                "Unrelated summary",
                None,
            )
            .await
            .unwrap();

        let hits = ts.storage.search_events("zanzibar", 10, None).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].0.target_id.as_deref(), Some("gh-pai-7"));
    }

    #[tokio::test]
    async fn event_search_ranks_best_first() {
        let ts = create_test_storage().await;
        ts.storage
            .append_event("note", None, None, None, "merge merge merge", None)
            .await
            .unwrap();
        ts.storage
            .append_event("note", None, None, None, "one merge among many other words here", None)
            .await
            .unwrap();

        let hits = ts.storage.search_events("merge", 10, None).await.unwrap();
        assert_eq!(hits.len(), 2);
        assert!(hits[0].1 <= hits[1].1, "ranks not ascending");
    }

    #[tokio::test]
    async fn rebuild_search_index_preserves_results() {
        let ts = create_test_storage().await;
        ts.storage
            .append_event("note", None, None, None, "searchable quiddity", None)
            .await
            .unwrap();
        ts.storage.rebuild_search_index().await.unwrap();
        let hits = ts.storage.search_events("quiddity", 10, None).await.unwrap();
        assert_eq!(hits.len(), 1);
    }

    #[tokio::test]
    async fn heartbeat_rows_persist() {
        let ts = create_test_storage().await;
        let hb = ts
            .storage
            .insert_heartbeat("session-1", Some("Working"), Some("item-1"))
            .await
            .unwrap();
        assert_eq!(hb.session_id, "session-1");
        assert_eq!(hb.work_item_id.as_deref(), Some("item-1"));
    }

    #[tokio::test]
    async fn feature_round_trips_all_fields() {
        let ts = create_test_storage().await;
        let mut feature = Feature::new("FEAT-1", "proj", "Title", "Desc");
        feature.specify_score = Some(8.5);
        feature.pr_number = Some(12);
        ts.storage.insert_feature(&feature).await.unwrap();

        let loaded = ts.storage.get_feature("FEAT-1").await.unwrap();
        assert_eq!(loaded.phase, FeaturePhase::Queued);
        assert_eq!(loaded.status, FeatureStatus::Pending);
        assert_eq!(loaded.specify_score, Some(8.5));
        assert_eq!(loaded.pr_number, Some(12));
        assert_eq!(loaded.max_failures, 3);
    }

    #[tokio::test]
    async fn update_feature_persists_transitions() {
        let ts = create_test_storage().await;
        let mut feature = Feature::new("FEAT-2", "proj", "Title", "Desc");
        ts.storage.insert_feature(&feature).await.unwrap();

        feature.phase = FeaturePhase::Specifying;
        feature.status = FeatureStatus::Active;
        feature.current_session = Some("tick-1".to_string());
        feature.phase_started_at = Some(Utc::now());
        ts.storage.update_feature(&feature).await.unwrap();

        let loaded = ts.storage.get_feature("FEAT-2").await.unwrap();
        assert_eq!(loaded.phase, FeaturePhase::Specifying);
        assert_eq!(loaded.status, FeatureStatus::Active);
        assert!(loaded.phase_started_at.is_some());
    }

    #[tokio::test]
    async fn release_orphaned_features_is_idempotent() {
        let ts = create_test_storage().await;
        let mut feature = Feature::new("FEAT-3", "proj", "Title", "Desc");
        feature.phase = FeaturePhase::Specifying;
        feature.status = FeatureStatus::Active;
        feature.current_session = Some("dead-123".to_string());
        feature.phase_started_at = Some(Utc::now());
        ts.storage.insert_feature(&feature).await.unwrap();

        let first = ts
            .storage
            .release_orphaned_features("Released: server restarted")
            .await
            .unwrap();
        assert_eq!(first, 1);

        let loaded = ts.storage.get_feature("FEAT-3").await.unwrap();
        assert_eq!(loaded.status, FeatureStatus::Pending);
        assert!(loaded.current_session.is_none());
        assert_eq!(loaded.last_error.as_deref(), Some("Released: server restarted"));

        let second = ts
            .storage
            .release_orphaned_features("Released: server restarted")
            .await
            .unwrap();
        assert_eq!(second, 0);
    }

    #[tokio::test]
    async fn actionable_features_skip_terminal_and_blocked() {
        let ts = create_test_storage().await;
        let live = Feature::new("live", "proj", "T", "D");
        let mut done = Feature::new("done", "proj", "T", "D");
        done.phase = FeaturePhase::Completed;
        let mut blocked = Feature::new("blocked", "proj", "T", "D");
        blocked.status = FeatureStatus::Blocked;
        for f in [&live, &done, &blocked] {
            ts.storage.insert_feature(f).await.unwrap();
        }

        let actionable = ts.storage.list_actionable_features(10).await.unwrap();
        let ids: Vec<&str> = actionable.iter().map(|f| f.feature_id.as_str()).collect();
        assert_eq!(ids, vec!["live"]);
    }
}
