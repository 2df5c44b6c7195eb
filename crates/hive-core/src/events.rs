//! Well-known event types for the append-only log.
//!
//! The store column is an open string so producers can append types this
//! enum does not know about; the enum covers every type the daemon itself
//! writes. `heartbeat_received` keeps its historical name so existing
//! stores remain readable.

use serde::{Deserialize, Serialize};

/// Event type names written by the daemon.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    AgentRegistered,
    AgentDeregistered,
    HeartbeatReceived,
    WorkItemCreated,
    WorkItemClaimed,
    WorkItemCompleted,
    WorkItemReleased,
    WorkItemFailed,
    Dispatching,
    WorkApproved,
    WorkRejected,
    HumanEscalation,
    FeaturePhaseStarted,
    FeaturePhaseCompleted,
    FeatureGatePassed,
    FeatureGateFailed,
    FeatureAdvanced,
    FeaturesReleased,
    WorkspaceRemoved,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AgentRegistered => "agent_registered",
            Self::AgentDeregistered => "agent_deregistered",
            Self::HeartbeatReceived => "heartbeat_received",
            Self::WorkItemCreated => "work_item_created",
            Self::WorkItemClaimed => "work_item_claimed",
            Self::WorkItemCompleted => "work_item_completed",
            Self::WorkItemReleased => "work_item_released",
            Self::WorkItemFailed => "work_item_failed",
            Self::Dispatching => "dispatching",
            Self::WorkApproved => "work_approved",
            Self::WorkRejected => "work_rejected",
            Self::HumanEscalation => "human_escalation",
            Self::FeaturePhaseStarted => "feature_phase_started",
            Self::FeaturePhaseCompleted => "feature_phase_completed",
            Self::FeatureGatePassed => "feature_gate_passed",
            Self::FeatureGateFailed => "feature_gate_failed",
            Self::FeatureAdvanced => "feature_advanced",
            Self::FeaturesReleased => "features_released",
            Self::WorkspaceRemoved => "workspace_removed",
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Target entity kinds referenced by events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetType {
    WorkItem,
    Agent,
    Project,
    Feature,
}

impl TargetType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::WorkItem => "work_item",
            Self::Agent => "agent",
            Self::Project => "project",
            Self::Feature => "feature",
        }
    }
}
