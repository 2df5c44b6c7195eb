//! Work queue over the blackboard store.
//!
//! Thin layer that pairs every queue mutation with its audit event and
//! hosts the idempotency checks producers rely on.

use chrono::Utc;
use hive_core::events::{EventType, TargetType};
use hive_core::metadata;
use hive_core::types::{ItemStatus, Priority, WorkItem};
use std::sync::Arc;
use thiserror::Error;

use crate::storage::{ItemFilter, Storage, StorageError};

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}

pub type Result<T> = std::result::Result<T, QueueError>;

/// Options for creating a work item. Ids should encode purpose (see the
/// id-derivation helpers) so duplicate creation is cheap to detect.
#[derive(Debug, Clone)]
pub struct CreateItem {
    pub id: String,
    pub title: String,
    pub description: Option<String>,
    pub project: Option<String>,
    pub source: Option<String>,
    pub source_ref: Option<String>,
    pub priority: Priority,
    pub metadata: Option<serde_json::Value>,
}

impl CreateItem {
    pub fn new(id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            description: None,
            project: None,
            source: None,
            source_ref: None,
            priority: Priority::P2,
            metadata: None,
        }
    }
}

/// Queue facade shared by producers, the dispatcher, and workers.
#[derive(Debug, Clone)]
pub struct Queue {
    storage: Arc<Storage>,
}

impl Queue {
    pub fn new(storage: Arc<Storage>) -> Self {
        Self { storage }
    }

    /// Create a work item in `available` status.
    pub async fn create(&self, opts: CreateItem) -> Result<WorkItem> {
        let now = Utc::now();
        let item = WorkItem {
            item_id: opts.id,
            project_id: opts.project,
            title: opts.title,
            description: opts.description,
            priority: opts.priority,
            status: ItemStatus::Available,
            source: opts.source,
            source_ref: opts.source_ref,
            claimed_by: None,
            created_at: now,
            updated_at: now,
            metadata: opts.metadata.as_ref().map(serde_json::Value::to_string),
        };
        self.storage.insert_work_item(&item).await?;
        self.storage
            .append_event(
                EventType::WorkItemCreated.as_str(),
                None,
                Some(&item.item_id),
                Some(TargetType::WorkItem.as_str()),
                &format!("Created work item {}: {}", item.item_id, item.title),
                Some(&serde_json::json!({
                    "priority": item.priority.as_str(),
                    "source": item.source,
                })),
            )
            .await?;
        Ok(item)
    }

    /// Create a work item unless one with the same id already exists; the
    /// existing row wins.
    pub async fn create_if_absent(&self, opts: CreateItem) -> Result<WorkItem> {
        if let Some(existing) = self.storage.maybe_work_item(&opts.id).await? {
            return Ok(existing);
        }
        self.create(opts).await
    }

    pub async fn get(&self, item_id: &str) -> Result<WorkItem> {
        Ok(self.storage.get_work_item(item_id).await?)
    }

    pub async fn list(&self, filter: &ItemFilter) -> Result<Vec<WorkItem>> {
        Ok(self.storage.list_work_items(filter).await?)
    }

    /// Atomic claim. Returns false when another session won the race.
    pub async fn claim(&self, item_id: &str, session_id: &str) -> Result<bool> {
        let claimed = self.storage.claim_work_item(item_id, session_id).await?;
        if claimed {
            self.storage
                .append_event(
                    EventType::WorkItemClaimed.as_str(),
                    Some(session_id),
                    Some(item_id),
                    Some(TargetType::WorkItem.as_str()),
                    &format!("Claimed work item {item_id}"),
                    None,
                )
                .await?;
        }
        Ok(claimed)
    }

    pub async fn complete(&self, item_id: &str, session_id: &str) -> Result<()> {
        self.storage.complete_work_item(item_id, session_id).await?;
        self.storage
            .append_event(
                EventType::WorkItemCompleted.as_str(),
                Some(session_id),
                Some(item_id),
                Some(TargetType::WorkItem.as_str()),
                &format!("Completed work item {item_id}"),
                None,
            )
            .await?;
        Ok(())
    }

    pub async fn release(&self, item_id: &str, session_id: &str) -> Result<()> {
        self.storage.release_work_item(item_id, session_id).await?;
        self.storage
            .append_event(
                EventType::WorkItemReleased.as_str(),
                Some(session_id),
                Some(item_id),
                Some(TargetType::WorkItem.as_str()),
                &format!("Released work item {item_id}"),
                None,
            )
            .await?;
        Ok(())
    }

    pub async fn fail(&self, item_id: &str, reason: &str) -> Result<()> {
        self.storage.fail_work_item(item_id).await?;
        self.storage
            .append_event(
                EventType::WorkItemFailed.as_str(),
                None,
                Some(item_id),
                Some(TargetType::WorkItem.as_str()),
                &format!("Failed work item {item_id}: {reason}"),
                None,
            )
            .await?;
        Ok(())
    }

    pub async fn update_metadata(&self, item_id: &str, patch: &serde_json::Value) -> Result<()> {
        Ok(self.storage.update_work_item_metadata(item_id, patch).await?)
    }

    /// Find an open (available or claimed) rework item for the same
    /// `(pr_number, rework_cycle)` pair. Creation is idempotent on that
    /// key.
    pub async fn find_open_rework(
        &self,
        pr_number: i64,
        rework_cycle: u32,
    ) -> Result<Option<WorkItem>> {
        let open = self.storage.list_work_items(&ItemFilter::default()).await?;
        Ok(open.into_iter().find(|item| {
            let Some(value) = item.metadata_value() else {
                return false;
            };
            metadata::parse_rework(&value)
                .is_some_and(|meta| meta.pr_number == pr_number && meta.rework_cycle == rework_cycle)
        }))
    }
}
