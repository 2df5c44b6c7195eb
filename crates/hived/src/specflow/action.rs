//! Pure tick-action decision for SpecFlow features.
//!
//! `determine_action` is a function of `(feature, timeouts, now)` and
//! nothing else; the orchestrator executes whatever it returns and
//! re-reads the feature before asking again.

use chrono::{DateTime, Utc};
use hive_core::types::{Feature, FeaturePhase, FeatureStatus, GateKind};

/// Phase timeout configuration in minutes.
#[derive(Debug, Clone, Copy)]
pub struct PhaseTimeouts {
    pub default_min: u32,
    pub implementing_min: u32,
}

impl PhaseTimeouts {
    pub fn for_phase(&self, phase: FeaturePhase) -> u32 {
        match phase {
            FeaturePhase::Implementing => self.implementing_min,
            _ => self.default_min,
        }
    }
}

impl Default for PhaseTimeouts {
    fn default() -> Self {
        Self {
            default_min: 20,
            implementing_min: 180,
        }
    }
}

/// What the orchestrator should do with a feature right now.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickAction {
    /// Nothing to do; the reason is recorded for observability.
    Wait(&'static str),
    /// Transition the feature to terminal failure.
    Fail(String),
    /// Release a stuck active session back to pending.
    Release(&'static str),
    /// Run the gate for the current active phase.
    CheckGate(GateKind),
    /// Move a resting phase to its next active phase.
    Advance {
        from: FeaturePhase,
        to: FeaturePhase,
    },
    /// Execute the current phase.
    RunPhase(FeaturePhase),
}

/// A phase start is stale when it never happened or its budget elapsed.
fn is_stale(started_at: Option<DateTime<Utc>>, minutes: u32, now: DateTime<Utc>) -> bool {
    match started_at {
        None => true,
        Some(started) => (now - started) > chrono::Duration::seconds(i64::from(minutes) * 60),
    }
}

/// Decision table, evaluated top to bottom; first match wins.
pub fn determine_action(feature: &Feature, timeouts: &PhaseTimeouts, now: DateTime<Utc>) -> TickAction {
    if feature.phase.is_terminal() {
        return TickAction::Wait("terminal state");
    }
    if feature.status == FeatureStatus::Blocked {
        return TickAction::Wait("blocked");
    }
    if feature.failure_count >= feature.max_failures {
        return TickAction::Fail(format!(
            "max failures exceeded ({}/{})",
            feature.failure_count, feature.max_failures
        ));
    }
    if feature.current_session.is_some() && feature.status == FeatureStatus::Active {
        let budget = timeouts.for_phase(feature.phase);
        if is_stale(feature.phase_started_at, budget, now) {
            return TickAction::Release("phase timeout exceeded");
        }
        return TickAction::Wait("session active");
    }
    if feature.phase.is_active() && feature.status == FeatureStatus::Succeeded {
        if let Some(gate) = feature.phase.gate() {
            return TickAction::CheckGate(gate);
        }
    }
    if feature.status == FeatureStatus::Pending {
        if let Some(to) = feature.phase.advance_target() {
            return TickAction::Advance {
                from: feature.phase,
                to,
            };
        }
        return TickAction::RunPhase(feature.phase);
    }
    TickAction::Wait("no action available")
}
