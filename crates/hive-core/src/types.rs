//! Core types for the blackboard orchestrator.
//!
//! Entities persisted in the shared store: projects, agent sessions,
//! work items, events, heartbeats, and SpecFlow features.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for agent sessions.
/// Uses `UUIDv7` for time-ordered lexicographic sorting.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Id(pub String);

impl Id {
    pub fn new() -> Self {
        Self(Uuid::now_v7().to_string())
    }

    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }
}

impl Default for Id {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for Id {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for Id {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

// --- Enumerations ---

/// Work item priority. Ordering is `P1 < P2 < P3` (P1 dispatches first).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Priority {
    P1,
    P2,
    P3,
}

impl Default for Priority {
    fn default() -> Self {
        Self::P2
    }
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::P1 => "P1",
            Self::P2 => "P2",
            Self::P3 => "P3",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim() {
            "P1" | "p1" => Some(Self::P1),
            "P2" | "p2" => Some(Self::P2),
            "P3" | "p3" => Some(Self::P3),
            _ => None,
        }
    }

    /// Parse a comma-separated priority filter ("P1" or "P1,P2").
    /// Unknown tokens are dropped; an empty result means no filter.
    pub fn parse_list(s: &str) -> Vec<Self> {
        s.split(',').filter_map(Self::parse).collect()
    }
}

/// Work item lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    Available,
    Claimed,
    Completed,
    Failed,
}

impl ItemStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Available => "available",
            Self::Claimed => "claimed",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "available" => Some(Self::Available),
            "claimed" => Some(Self::Claimed),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// Agent session status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Active,
    Idle,
    Completed,
    Stale,
}

impl AgentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Idle => "idle",
            Self::Completed => "completed",
            Self::Stale => "stale",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(Self::Active),
            "idle" => Some(Self::Idle),
            "completed" => Some(Self::Completed),
            "stale" => Some(Self::Stale),
            _ => None,
        }
    }

    /// Whether this session counts toward the dispatcher concurrency limit.
    pub fn is_live(&self) -> bool {
        matches!(self, Self::Active | Self::Idle)
    }
}

/// SpecFlow feature phase.
///
/// Phases partition into "active" (`*ing`, a session is doing work) and
/// "resting" (`*ed` or terminal). The resting phases advance through
/// `advance_target`; each active phase has a gate that must pass before
/// the feature moves to its completed counterpart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeaturePhase {
    Queued,
    Specifying,
    Specified,
    Planning,
    Planned,
    Tasking,
    Tasked,
    Implementing,
    Implemented,
    Completing,
    Completed,
    Failed,
}

impl FeaturePhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Specifying => "specifying",
            Self::Specified => "specified",
            Self::Planning => "planning",
            Self::Planned => "planned",
            Self::Tasking => "tasking",
            Self::Tasked => "tasked",
            Self::Implementing => "implementing",
            Self::Implemented => "implemented",
            Self::Completing => "completing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(Self::Queued),
            "specifying" => Some(Self::Specifying),
            "specified" => Some(Self::Specified),
            "planning" => Some(Self::Planning),
            "planned" => Some(Self::Planned),
            "tasking" => Some(Self::Tasking),
            "tasked" => Some(Self::Tasked),
            "implementing" => Some(Self::Implementing),
            "implemented" => Some(Self::Implemented),
            "completing" => Some(Self::Completing),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    /// An in-progress phase (name ends with "ing").
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            Self::Specifying | Self::Planning | Self::Tasking | Self::Implementing | Self::Completing
        )
    }

    /// Terminal phases are absorbing; no further action is ever taken.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Next active phase from a resting phase.
    pub fn advance_target(&self) -> Option<Self> {
        match self {
            Self::Queued => Some(Self::Specifying),
            Self::Specified => Some(Self::Planning),
            Self::Planned => Some(Self::Tasking),
            Self::Tasked => Some(Self::Implementing),
            Self::Implemented => Some(Self::Completing),
            _ => None,
        }
    }

    /// Resting phase an active phase lands on after its gate passes.
    pub fn completed_phase(&self) -> Option<Self> {
        match self {
            Self::Specifying => Some(Self::Specified),
            Self::Planning => Some(Self::Planned),
            Self::Tasking => Some(Self::Tasked),
            Self::Implementing => Some(Self::Implemented),
            Self::Completing => Some(Self::Completed),
            _ => None,
        }
    }

    /// Gate run after this active phase succeeds.
    pub fn gate(&self) -> Option<GateKind> {
        match self {
            Self::Specifying | Self::Planning => Some(GateKind::Quality),
            Self::Tasking => Some(GateKind::Artifact),
            Self::Implementing => Some(GateKind::Code),
            Self::Completing => Some(GateKind::Pass),
            _ => None,
        }
    }
}

/// SpecFlow feature status, orthogonal to the phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeatureStatus {
    Pending,
    Active,
    Succeeded,
    Blocked,
    Failed,
}

impl FeatureStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Active => "active",
            Self::Succeeded => "succeeded",
            Self::Blocked => "blocked",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "active" => Some(Self::Active),
            "succeeded" => Some(Self::Succeeded),
            "blocked" => Some(Self::Blocked),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// Post-phase gate kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateKind {
    /// Score an artifact against a rubric; pass at or above threshold.
    Quality,
    /// Check that the expected artifact file exists.
    Artifact,
    /// Require at least one substantive file change on the branch.
    Code,
    /// Auto-pass.
    Pass,
}

impl GateKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Quality => "quality",
            Self::Artifact => "artifact",
            Self::Code => "code",
            Self::Pass => "pass",
        }
    }
}

// --- Core entities ---

/// A registered project (source repository).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub project_id: String,
    pub display_name: String,
    /// Filesystem root of the source repo (optional; general projects have none).
    pub local_path: Option<String>,
    /// Remote repository URL (optional).
    pub remote_repo: Option<String>,
    /// JSON bag. Recognized keys: `specflow_enabled`, `max_rework_cycles`.
    pub metadata: Option<String>,
    pub registered_at: DateTime<Utc>,
}

/// Recognized keys of a project's metadata bag.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProjectSettings {
    pub specflow_enabled: bool,
    pub max_rework_cycles: Option<u32>,
}

impl Project {
    /// Parse the recognized metadata keys; unknown keys are ignored,
    /// malformed JSON yields defaults.
    pub fn settings(&self) -> ProjectSettings {
        let Some(raw) = self.metadata.as_deref() else {
            return ProjectSettings::default();
        };
        let Ok(value) = serde_json::from_str::<serde_json::Value>(raw) else {
            return ProjectSettings::default();
        };
        ProjectSettings {
            specflow_enabled: value
                .get("specflow_enabled")
                .and_then(serde_json::Value::as_bool)
                .unwrap_or(false),
            max_rework_cycles: value
                .get("max_rework_cycles")
                .and_then(serde_json::Value::as_u64)
                .map(|n| n as u32),
        }
    }
}

/// An agent session: a logical actor with a liveness probe.
///
/// Exactly one row per session. The `pid` may be rewritten: a detached
/// worker rewrites it to its own process id right after spawn so the
/// stale sweep probes the live process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSession {
    pub session_id: Id,
    pub agent_name: String,
    pub project: Option<String>,
    /// Free-text description of the work in progress.
    pub work: Option<String>,
    pub parent_id: Option<String>,
    pub pid: i64,
    pub status: AgentStatus,
    pub last_seen_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    /// JSON bag; may hold `log_path`.
    pub metadata: Option<String>,
}

/// A unit of work acquired via atomic claim.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkItem {
    pub item_id: String,
    pub project_id: Option<String>,
    pub title: String,
    pub description: Option<String>,
    pub priority: Priority,
    pub status: ItemStatus,
    /// Producer tag, e.g. `github`, `rework`, `code_review`, `pr_merge`,
    /// `merge-fix`, `specflow`, `tana`.
    pub source: Option<String>,
    pub source_ref: Option<String>,
    pub claimed_by: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Variant-tagged JSON (see the metadata module).
    pub metadata: Option<String>,
}

impl WorkItem {
    /// Parsed metadata as a JSON object, or None when absent/malformed.
    pub fn metadata_value(&self) -> Option<serde_json::Value> {
        self.metadata
            .as_deref()
            .and_then(|raw| serde_json::from_str(raw).ok())
    }
}

/// An entry in the append-only event log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Store rowid; monotonically increasing append order.
    pub id: i64,
    pub timestamp: DateTime<Utc>,
    /// Open event-type string; see [`crate::events::EventType`] for the
    /// well-known set.
    pub event_type: String,
    pub actor_id: Option<String>,
    pub target_id: Option<String>,
    pub target_type: Option<String>,
    pub summary: String,
    pub metadata: Option<String>,
}

/// A keep-alive heartbeat row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Heartbeat {
    pub id: i64,
    pub timestamp: DateTime<Utc>,
    pub session_id: String,
    pub progress: Option<String>,
    pub work_item_id: Option<String>,
}

/// Default number of phase failures a feature tolerates before failing.
pub const DEFAULT_MAX_FAILURES: u32 = 3;

/// A SpecFlow feature: a multi-phase work program advancing through the
/// phase state machine with a gate after each active phase.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Feature {
    pub feature_id: String,
    pub project_id: String,
    pub title: String,
    pub description: String,
    pub phase: FeaturePhase,
    pub status: FeatureStatus,
    pub current_session: Option<String>,
    pub worktree_path: Option<String>,
    pub branch_name: Option<String>,
    pub main_branch: Option<String>,
    pub failure_count: u32,
    pub max_failures: u32,
    pub last_error: Option<String>,
    pub phase_started_at: Option<DateTime<Utc>>,
    pub specify_score: Option<f64>,
    pub plan_score: Option<f64>,
    pub implement_score: Option<f64>,
    pub pr_number: Option<i64>,
    pub pr_url: Option<String>,
    pub commit_sha: Option<String>,
    pub source_issue_number: Option<i64>,
    pub source_issue_repo: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Feature {
    /// A fresh feature in `(queued, pending)`.
    pub fn new(
        feature_id: impl Into<String>,
        project_id: impl Into<String>,
        title: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            feature_id: feature_id.into(),
            project_id: project_id.into(),
            title: title.into(),
            description: description.into(),
            phase: FeaturePhase::Queued,
            status: FeatureStatus::Pending,
            current_session: None,
            worktree_path: None,
            branch_name: None,
            main_branch: None,
            failure_count: 0,
            max_failures: DEFAULT_MAX_FAILURES,
            last_error: None,
            phase_started_at: None,
            specify_score: None,
            plan_score: None,
            implement_score: None,
            pr_number: None,
            pr_url: None,
            commit_sha: None,
            source_issue_number: None,
            source_issue_repo: None,
            created_at: now,
            updated_at: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_generates_unique_values() {
        let id1 = Id::new();
        let id2 = Id::new();
        assert_ne!(id1, id2);
    }

    #[test]
    fn priority_orders_p1_first() {
        assert!(Priority::P1 < Priority::P2);
        assert!(Priority::P2 < Priority::P3);
    }

    #[test]
    fn priority_parse_list_accepts_single_and_pairs() {
        assert_eq!(Priority::parse_list("P1"), vec![Priority::P1]);
        assert_eq!(
            Priority::parse_list("P1,P2"),
            vec![Priority::P1, Priority::P2]
        );
        assert!(Priority::parse_list("bogus").is_empty());
    }

    #[test]
    fn item_status_round_trips() {
        for status in [
            ItemStatus::Available,
            ItemStatus::Claimed,
            ItemStatus::Completed,
            ItemStatus::Failed,
        ] {
            assert_eq!(ItemStatus::parse(status.as_str()), Some(status));
        }
    }

    #[test]
    fn agent_status_liveness() {
        assert!(AgentStatus::Active.is_live());
        assert!(AgentStatus::Idle.is_live());
        assert!(!AgentStatus::Completed.is_live());
        assert!(!AgentStatus::Stale.is_live());
    }

    #[test]
    fn phase_active_and_terminal_partition() {
        assert!(FeaturePhase::Specifying.is_active());
        assert!(FeaturePhase::Implementing.is_active());
        assert!(!FeaturePhase::Queued.is_active());
        assert!(FeaturePhase::Completed.is_terminal());
        assert!(FeaturePhase::Failed.is_terminal());
        assert!(!FeaturePhase::Implemented.is_terminal());
    }

    #[test]
    fn advance_map_covers_all_resting_phases() {
        assert_eq!(
            FeaturePhase::Queued.advance_target(),
            Some(FeaturePhase::Specifying)
        );
        assert_eq!(
            FeaturePhase::Specified.advance_target(),
            Some(FeaturePhase::Planning)
        );
        assert_eq!(
            FeaturePhase::Planned.advance_target(),
            Some(FeaturePhase::Tasking)
        );
        assert_eq!(
            FeaturePhase::Tasked.advance_target(),
            Some(FeaturePhase::Implementing)
        );
        assert_eq!(
            FeaturePhase::Implemented.advance_target(),
            Some(FeaturePhase::Completing)
        );
        assert_eq!(FeaturePhase::Completed.advance_target(), None);
    }

    #[test]
    fn gate_map_matches_phase_kind() {
        assert_eq!(FeaturePhase::Specifying.gate(), Some(GateKind::Quality));
        assert_eq!(FeaturePhase::Planning.gate(), Some(GateKind::Quality));
        assert_eq!(FeaturePhase::Tasking.gate(), Some(GateKind::Artifact));
        assert_eq!(FeaturePhase::Implementing.gate(), Some(GateKind::Code));
        assert_eq!(FeaturePhase::Completing.gate(), Some(GateKind::Pass));
        assert_eq!(FeaturePhase::Queued.gate(), None);
    }

    #[test]
    fn completed_phase_maps_ing_to_ed() {
        assert_eq!(
            FeaturePhase::Specifying.completed_phase(),
            Some(FeaturePhase::Specified)
        );
        assert_eq!(
            FeaturePhase::Completing.completed_phase(),
            Some(FeaturePhase::Completed)
        );
        assert_eq!(FeaturePhase::Queued.completed_phase(), None);
    }

    #[test]
    fn project_settings_parse_recognized_keys() {
        let project = Project {
            project_id: "p".to_string(),
            display_name: "P".to_string(),
            local_path: None,
            remote_repo: None,
            metadata: Some(r#"{"specflow_enabled": true, "max_rework_cycles": 1}"#.to_string()),
            registered_at: Utc::now(),
        };
        let settings = project.settings();
        assert!(settings.specflow_enabled);
        assert_eq!(settings.max_rework_cycles, Some(1));
    }

    #[test]
    fn project_settings_default_on_missing_or_malformed() {
        let mut project = Project {
            project_id: "p".to_string(),
            display_name: "P".to_string(),
            local_path: None,
            remote_repo: None,
            metadata: None,
            registered_at: Utc::now(),
        };
        assert!(!project.settings().specflow_enabled);

        project.metadata = Some("not json".to_string());
        assert!(!project.settings().specflow_enabled);
        assert_eq!(project.settings().max_rework_cycles, None);
    }

    #[test]
    fn feature_new_starts_queued_pending() {
        let feature = Feature::new("FEAT-1", "proj", "Title", "Desc");
        assert_eq!(feature.phase, FeaturePhase::Queued);
        assert_eq!(feature.status, FeatureStatus::Pending);
        assert_eq!(feature.failure_count, 0);
        assert_eq!(feature.max_failures, DEFAULT_MAX_FAILURES);
        assert!(feature.current_session.is_none());
    }
}
