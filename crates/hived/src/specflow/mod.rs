//! SpecFlow feature orchestrator.
//!
//! Advances features through the phase state machine, one bounded drain
//! loop per feature per tick. Zero-cost transitions (advance, gate) are
//! drained immediately instead of burning a tick each; a phase run
//! happens inline through the executor, and its gate is checked in the
//! same pass.

pub mod action;
pub mod gate;
pub mod phase;

use chrono::Utc;
use hive_core::events::{EventType, TargetType};
use hive_core::types::{Feature, FeaturePhase, FeatureStatus, GateKind};
use hive_core::{ids, Config, SpecflowMeta};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::specflow::action::{determine_action, PhaseTimeouts, TickAction};
use crate::specflow::gate::QualityScorer;
use crate::specflow::phase::{PhaseContext, PhaseExecutor};
use crate::storage::Storage;
use crate::workspace::Workspaces;

/// Upper bound on drain-loop iterations per feature per tick. Guards
/// against a state being mis-classified as "continue" forever.
const MAX_DRAIN_STEPS: usize = 10;

/// Counters for one orchestrator tick.
#[derive(Debug, Clone, Copy, Default)]
pub struct TickReport {
    pub features_advanced: usize,
    pub phases_run: usize,
    pub gates_checked: usize,
    pub released: usize,
    pub failed: usize,
}

pub struct Orchestrator {
    storage: Arc<Storage>,
    workspaces: Arc<Workspaces>,
    executor: Arc<dyn PhaseExecutor>,
    scorer: Arc<dyn QualityScorer>,
    config: Arc<Config>,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator").finish_non_exhaustive()
    }
}

impl Orchestrator {
    pub fn new(
        storage: Arc<Storage>,
        workspaces: Arc<Workspaces>,
        executor: Arc<dyn PhaseExecutor>,
        scorer: Arc<dyn QualityScorer>,
        config: Arc<Config>,
    ) -> Self {
        Self {
            storage,
            workspaces,
            executor,
            scorer,
            config,
        }
    }

    fn timeouts(&self) -> PhaseTimeouts {
        PhaseTimeouts {
            default_min: self.config.phase_timeout_min_default,
            implementing_min: self.config.phase_timeout_min_implementing,
        }
    }

    /// Release features left `active` by a previous process. Call once at
    /// service start; the previous owner is known dead.
    pub async fn startup_release(&self) -> eyre::Result<u64> {
        let released = self
            .storage
            .release_orphaned_features("Released: server restarted while the phase was in flight")
            .await?;
        if released > 0 {
            self.storage
                .append_event(
                    EventType::FeaturesReleased.as_str(),
                    None,
                    None,
                    None,
                    &format!("Released {released} orphaned feature(s) on startup"),
                    None,
                )
                .await?;
            info!(released, "released orphaned features on startup");
        }
        Ok(released)
    }

    /// One orchestrator tick: release stuck sessions, then drain each
    /// actionable feature.
    pub async fn tick(&self, session_id: &str, max_concurrent: usize) -> eyre::Result<TickReport> {
        let mut report = TickReport::default();
        let timeouts = self.timeouts();
        let limit = max_concurrent as i64;

        // First pass: time out stuck active sessions so the second pass
        // sees them as pending.
        let features = self.storage.list_actionable_features(limit).await?;
        for feature in &features {
            if let TickAction::Release(reason) = determine_action(feature, &timeouts, Utc::now()) {
                self.release_feature(feature.feature_id.clone(), reason).await?;
                report.released += 1;
            }
        }

        let features = self.storage.list_actionable_features(limit).await?;
        for feature in features {
            let feature_id = feature.feature_id.clone();
            if let Err(e) = self.drain_feature(&feature_id, session_id, &mut report).await {
                error!(feature_id, error = %e, "feature drain failed; resetting to pending");
                if let Ok(mut current) = self.storage.get_feature(&feature_id).await {
                    if current.status == FeatureStatus::Active {
                        current.status = FeatureStatus::Pending;
                    }
                    current.failure_count += 1;
                    current.current_session = None;
                    current.last_error = Some(e.to_string());
                    let _ = self.storage.update_feature(&current).await;
                }
            }
        }
        Ok(report)
    }

    /// Keep acting on one feature until it waits, fails, or a phase run
    /// does not complete synchronously.
    pub async fn drain_feature(
        &self,
        feature_id: &str,
        session_id: &str,
        report: &mut TickReport,
    ) -> eyre::Result<()> {
        let timeouts = self.timeouts();
        for _ in 0..MAX_DRAIN_STEPS {
            let mut feature = self.storage.get_feature(feature_id).await?;
            match determine_action(&feature, &timeouts, Utc::now()) {
                TickAction::Wait(reason) => {
                    info!(feature_id, reason, "feature waiting");
                    break;
                }
                TickAction::Fail(message) => {
                    feature.phase = FeaturePhase::Failed;
                    feature.status = FeatureStatus::Failed;
                    feature.current_session = None;
                    feature.last_error = Some(message.clone());
                    self.storage.update_feature(&feature).await?;
                    self.feature_event(
                        &feature,
                        EventType::FeatureGateFailed,
                        &format!("Feature {feature_id} failed: {message}"),
                    )
                    .await?;
                    report.failed += 1;
                    break;
                }
                TickAction::Release(reason) => {
                    self.release_feature(feature_id.to_string(), reason).await?;
                    report.released += 1;
                }
                TickAction::Advance { from, to } => {
                    feature.phase = to;
                    self.storage.update_feature(&feature).await?;
                    self.feature_event(
                        &feature,
                        EventType::FeatureAdvanced,
                        &format!(
                            "Advanced feature {feature_id} from {} to {}",
                            from.as_str(),
                            to.as_str()
                        ),
                    )
                    .await?;
                    report.features_advanced += 1;
                }
                TickAction::CheckGate(kind) => {
                    report.gates_checked += 1;
                    self.check_gate(&mut feature, kind).await?;
                }
                TickAction::RunPhase(_) => {
                    report.phases_run += 1;
                    let succeeded = self.run_phase(&mut feature, session_id).await?;
                    if !succeeded {
                        break;
                    }
                    // Gate immediately; the next loop iteration sees
                    // status = succeeded and checks it.
                }
            }
        }
        Ok(())
    }

    async fn release_feature(&self, feature_id: String, reason: &str) -> eyre::Result<()> {
        let mut feature = self.storage.get_feature(&feature_id).await?;
        warn!(feature_id, reason, "releasing feature session");
        feature.status = FeatureStatus::Pending;
        feature.current_session = None;
        feature.last_error = Some(format!("Released: {reason}"));
        self.storage.update_feature(&feature).await?;
        self.feature_event(
            &feature,
            EventType::FeaturesReleased,
            &format!("Released feature {feature_id}: {reason}"),
        )
        .await?;
        Ok(())
    }

    /// Execute the feature's current phase: set up the workspace, mark
    /// the feature active, invoke the executor, record the outcome.
    pub async fn run_phase(&self, feature: &mut Feature, session_id: &str) -> eyre::Result<bool> {
        let project = self.storage.get_project(&feature.project_id).await?;
        let parent = project
            .local_path
            .as_deref()
            .map(PathBuf::from)
            .ok_or_else(|| eyre::eyre!("project {} has no local path", project.project_id))?;

        let worktree = self.setup_workspace(feature, &parent).await?;
        let main_branch = feature
            .main_branch
            .clone()
            .or_else(|| self.workspaces.current_branch(&parent).ok())
            .unwrap_or_else(|| "main".to_string());

        feature.status = FeatureStatus::Active;
        feature.current_session = Some(session_id.to_string());
        feature.phase_started_at = Some(Utc::now());
        feature.worktree_path = Some(worktree.to_string_lossy().to_string());
        feature.branch_name = Some(
            feature
                .branch_name
                .clone()
                .unwrap_or_else(|| ids::specflow_branch(&feature.feature_id)),
        );
        feature.main_branch = Some(main_branch);
        self.storage.update_feature(feature).await?;
        self.feature_event(
            feature,
            EventType::FeaturePhaseStarted,
            &format!(
                "Started phase {} for feature {}",
                feature.phase.as_str(),
                feature.feature_id
            ),
        )
        .await?;

        let ctx = PhaseContext {
            worktree_path: worktree,
            project_path: parent,
            timeout: Duration::from_secs(
                u64::from(self.config.phase_timeout_min(feature.phase)) * 60,
            ),
            session_id: session_id.to_string(),
        };
        let outcome = match self.executor.execute(feature, &ctx).await {
            Ok(outcome) => outcome,
            Err(e) => phase::PhaseOutcome::failure(e.to_string()),
        };

        if outcome.succeeded {
            if outcome.pr_number.is_some() {
                feature.pr_number = outcome.pr_number;
            }
            if outcome.pr_url.is_some() {
                feature.pr_url = outcome.pr_url;
            }
            if outcome.commit_sha.is_some() {
                feature.commit_sha = outcome.commit_sha;
            }
            feature.status = FeatureStatus::Succeeded;
            feature.current_session = None;
            self.storage.update_feature(feature).await?;
            self.feature_event(
                feature,
                EventType::FeaturePhaseCompleted,
                &format!(
                    "Completed phase {} for feature {}",
                    feature.phase.as_str(),
                    feature.feature_id
                ),
            )
            .await?;
            Ok(true)
        } else {
            let message = outcome.error.unwrap_or_else(|| "phase failed".to_string());
            feature.failure_count += 1;
            feature.status = FeatureStatus::Pending;
            feature.current_session = None;
            feature.last_error = Some(message.clone());
            self.storage.update_feature(feature).await?;
            self.feature_event(
                feature,
                EventType::FeaturePhaseCompleted,
                &format!(
                    "Phase {} failed for feature {}: {message}",
                    feature.phase.as_str(),
                    feature.feature_id
                ),
            )
            .await?;
            Ok(false)
        }
    }

    /// Reuse the recorded worktree when possible; otherwise create one on
    /// the feature branch. The per-project SpecFlow state and the
    /// feature's spec directory are linked into the workspace so the
    /// external phase tooling shares one source of truth.
    async fn setup_workspace(&self, feature: &Feature, parent: &Path) -> eyre::Result<PathBuf> {
        let branch = feature
            .branch_name
            .clone()
            .unwrap_or_else(|| ids::specflow_branch(&feature.feature_id));
        let path = match feature.worktree_path.as_deref() {
            Some(existing) => {
                let path = PathBuf::from(existing);
                self.workspaces
                    .ensure_workspace(parent, &path, &branch)
                    .await?;
                path
            }
            None => {
                self.workspaces
                    .create_workspace(parent, &branch, &feature.project_id)
                    .await?
            }
        };
        link_state_dirs(parent, &path, &feature.feature_id);
        Ok(path)
    }

    /// Run the gate for the feature's current phase and apply the result.
    pub async fn check_gate(&self, feature: &mut Feature, kind: GateKind) -> eyre::Result<bool> {
        let outcome = gate::run_gate(
            kind,
            feature,
            &self.workspaces,
            self.scorer.as_ref(),
            self.config.quality_threshold,
        )
        .await?;

        if let Some(score) = outcome.score {
            match feature.phase {
                FeaturePhase::Specifying => feature.specify_score = Some(score),
                FeaturePhase::Planning => feature.plan_score = Some(score),
                FeaturePhase::Implementing => feature.implement_score = Some(score),
                _ => {}
            }
        }

        if outcome.passed {
            let landed = feature
                .phase
                .completed_phase()
                .ok_or_else(|| eyre::eyre!("gate on non-active phase {}", feature.phase.as_str()))?;
            feature.phase = landed;
            feature.status = FeatureStatus::Pending;
            self.storage.update_feature(feature).await?;
            self.feature_event(
                feature,
                EventType::FeatureGatePassed,
                &format!(
                    "Gate {} passed for feature {}: {}",
                    kind.as_str(),
                    feature.feature_id,
                    outcome.detail
                ),
            )
            .await?;
            Ok(true)
        } else {
            feature.failure_count += 1;
            feature.status = FeatureStatus::Pending;
            feature.last_error = Some(outcome.detail.clone());
            self.storage.update_feature(feature).await?;
            self.feature_event(
                feature,
                EventType::FeatureGateFailed,
                &format!(
                    "Gate {} failed for feature {}: {}",
                    kind.as_str(),
                    feature.feature_id,
                    outcome.detail
                ),
            )
            .await?;
            Ok(false)
        }
    }

    async fn feature_event(
        &self,
        feature: &Feature,
        event_type: EventType,
        summary: &str,
    ) -> eyre::Result<()> {
        self.storage
            .append_event(
                event_type.as_str(),
                feature.current_session.as_deref(),
                Some(&feature.feature_id),
                Some(TargetType::Feature.as_str()),
                summary,
                Some(&serde_json::json!({
                    "phase": feature.phase.as_str(),
                    "status": feature.status.as_str(),
                    "failure_count": feature.failure_count,
                })),
            )
            .await?;
        Ok(())
    }
}

/// Drive the phase of a SpecFlow work item claimed by a worker. Returns
/// whether the feature is still healthy afterwards.
pub async fn run_phase_for_item(
    orchestrator: &Orchestrator,
    meta: &SpecflowMeta,
    session_id: &str,
) -> eyre::Result<bool> {
    let mut report = TickReport::default();
    orchestrator
        .drain_feature(&meta.feature_id, session_id, &mut report)
        .await?;
    let feature = orchestrator.storage.get_feature(&meta.feature_id).await?;
    Ok(feature.phase != FeaturePhase::Failed && feature.status != FeatureStatus::Failed)
}

/// Link the shared SpecFlow state into a workspace (best effort).
fn link_state_dirs(parent: &Path, workspace: &Path, feature_id: &str) {
    link_if_absent(&parent.join(".specflow"), &workspace.join(".specflow"));

    if let Some(spec_dir) = gate::find_feature_spec_dir(parent, feature_id) {
        if let Some(name) = spec_dir.file_name() {
            let target_parent = workspace.join(".specify").join("specs");
            if std::fs::create_dir_all(&target_parent).is_ok() {
                link_if_absent(&spec_dir, &target_parent.join(name));
            }
        }
    }
}

fn link_if_absent(source: &Path, target: &Path) {
    if !source.exists() || target.exists() {
        return;
    }
    #[cfg(unix)]
    if let Err(e) = std::os::unix::fs::symlink(source, target) {
        warn!(
            source = %source.display(),
            target = %target.display(),
            error = %e,
            "failed to link state directory"
        );
    }
}
