//! Post-phase gates.
//!
//! Each active phase ends with a gate: quality-score an artifact, check
//! an artifact exists, require substantive code change, or auto-pass.
//! A failed gate sends the feature back to pending with an incremented
//! failure count.

use async_trait::async_trait;
use hive_core::types::{Feature, FeaturePhase, GateKind};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::launcher::Launcher;
use crate::specflow::phase::last_tagged_value;
use crate::workspace::Workspaces;

/// Paths that do not count as substantive change for the code gate.
/// Tests are deliberately absent from this list.
pub const CODE_GATE_EXCLUSIONS: [&str; 8] = [
    ".specify/",
    "CHANGELOG.md",
    "Plans/",
    "docs/",
    "README.md",
    ".claude/",
    "verify.md",
    ".specflow/",
];

/// Result of a gate check.
#[derive(Debug, Clone)]
pub struct GateOutcome {
    pub passed: bool,
    pub score: Option<f64>,
    pub detail: String,
}

/// Scores an artifact against a named rubric on a 0-10 scale.
#[async_trait]
pub trait QualityScorer: Send + Sync {
    async fn score(&self, artifact: &Path, rubric: &str) -> eyre::Result<f64>;
}

/// Launcher-backed scorer: asks the agent for a `SCORE:` line.
pub struct LauncherScorer {
    launcher: Arc<dyn Launcher>,
    timeout: Duration,
}

impl std::fmt::Debug for LauncherScorer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LauncherScorer").finish_non_exhaustive()
    }
}

impl LauncherScorer {
    pub fn new(launcher: Arc<dyn Launcher>, timeout: Duration) -> Self {
        Self { launcher, timeout }
    }
}

#[async_trait]
impl QualityScorer for LauncherScorer {
    async fn score(&self, artifact: &Path, rubric: &str) -> eyre::Result<f64> {
        let content = std::fs::read_to_string(artifact)?;
        let prompt = format!(
            "Score the following artifact against the {rubric} rubric on a 0-10 \
             scale. Judge completeness, clarity, and testability. Reply with your \
             reasoning followed by a final line 'SCORE: <number>'.\n\n---\n{content}"
        );
        let work_dir = artifact.parent().unwrap_or_else(|| Path::new("."));
        let outcome = self
            .launcher
            .launch(work_dir, &prompt, self.timeout, "quality-gate", true)
            .await?;
        if !outcome.success() {
            eyre::bail!("scorer agent exited with {}", outcome.exit_code);
        }
        last_tagged_value(&outcome.stdout, "SCORE")
            .and_then(|v| v.parse::<f64>().ok())
            .ok_or_else(|| eyre::eyre!("no SCORE line in scorer output"))
    }
}

/// Quality-gate artifact for a phase (`spec.md` / `plan.md`).
pub fn quality_artifact(phase: FeaturePhase) -> Option<(&'static str, &'static str)> {
    match phase {
        FeaturePhase::Specifying => Some(("spec.md", "specification")),
        FeaturePhase::Planning => Some(("plan.md", "implementation-plan")),
        _ => None,
    }
}

/// Files that count toward the code gate: anything outside the exclusion
/// prefixes.
pub fn substantive_changes(files: &[String]) -> Vec<&String> {
    files
        .iter()
        .filter(|file| {
            !CODE_GATE_EXCLUSIONS
                .iter()
                .any(|excluded| match excluded.strip_suffix('/') {
                    Some(prefix) => {
                        file.as_str() == prefix || file.starts_with(excluded)
                    }
                    None => file.as_str() == *excluded,
                })
        })
        .collect()
}

/// Locate the feature's spec directory under `.specify/specs/`, matching
/// on the feature-id prefix (case-insensitive).
pub fn find_feature_spec_dir(root: &Path, feature_id: &str) -> Option<PathBuf> {
    let specs = root.join(".specify").join("specs");
    let needle = feature_id.to_lowercase();
    let entries = std::fs::read_dir(&specs).ok()?;
    for entry in entries.flatten() {
        let name = entry.file_name().to_string_lossy().to_lowercase();
        if name.starts_with(&needle) && entry.path().is_dir() {
            return Some(entry.path());
        }
    }
    None
}

/// Run a gate for a feature whose workspace is set up.
pub async fn run_gate(
    kind: GateKind,
    feature: &Feature,
    workspaces: &Workspaces,
    scorer: &dyn QualityScorer,
    quality_threshold: f64,
) -> eyre::Result<GateOutcome> {
    let worktree = feature
        .worktree_path
        .as_deref()
        .map(PathBuf::from)
        .ok_or_else(|| eyre::eyre!("feature has no workspace for gate"))?;

    match kind {
        GateKind::Quality => {
            let (file, rubric) = quality_artifact(feature.phase)
                .ok_or_else(|| eyre::eyre!("no quality artifact for {}", feature.phase.as_str()))?;
            let spec_dir = find_feature_spec_dir(&worktree, &feature.feature_id)
                .ok_or_else(|| eyre::eyre!("no spec directory for {}", feature.feature_id))?;
            let artifact = spec_dir.join(file);
            if !artifact.exists() {
                return Ok(GateOutcome {
                    passed: false,
                    score: None,
                    detail: format!("{file} missing"),
                });
            }
            let score = scorer.score(&artifact, rubric).await?;
            debug!(feature_id = %feature.feature_id, score, rubric, "quality gate scored");
            Ok(GateOutcome {
                passed: score >= quality_threshold,
                score: Some(score),
                detail: format!("{file} scored {score:.1} (threshold {quality_threshold:.1})"),
            })
        }
        GateKind::Artifact => {
            let spec_dir = find_feature_spec_dir(&worktree, &feature.feature_id)
                .ok_or_else(|| eyre::eyre!("no spec directory for {}", feature.feature_id))?;
            let exists = spec_dir.join("tasks.md").exists();
            Ok(GateOutcome {
                passed: exists,
                score: None,
                detail: if exists {
                    "tasks.md present".to_string()
                } else {
                    "tasks.md missing".to_string()
                },
            })
        }
        GateKind::Code => {
            let main_branch = feature.main_branch.as_deref().unwrap_or("main");
            let changed = workspaces.get_changed_files(&worktree, main_branch)?;
            let substantive = substantive_changes(&changed);
            Ok(GateOutcome {
                passed: !substantive.is_empty(),
                score: None,
                detail: format!(
                    "{} substantive file(s) changed against {main_branch}",
                    substantive.len()
                ),
            })
        }
        GateKind::Pass => Ok(GateOutcome {
            passed: true,
            score: None,
            detail: "auto-pass".to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn substantive_changes_apply_exclusions() {
        let files: Vec<String> = [
            ".specify/specs/feat-1/spec.md",
            "CHANGELOG.md",
            "Plans/roadmap.md",
            "docs/guide.md",
            "README.md",
            ".claude/settings.json",
            "verify.md",
            ".specflow/state.json",
            "src/lib.rs",
            "tests/integration.rs",
        ]
        .iter()
        .map(|s| (*s).to_string())
        .collect();

        let kept = substantive_changes(&files);
        let kept: Vec<&str> = kept.iter().map(|s| s.as_str()).collect();
        // Tests are NOT excluded.
        assert_eq!(kept, vec!["src/lib.rs", "tests/integration.rs"]);
    }

    #[test]
    fn substantive_changes_do_not_overmatch_filenames() {
        let files = vec![
            "README.md.bak".to_string(),
            "docs2/file.md".to_string(),
        ];
        let kept = substantive_changes(&files);
        assert_eq!(kept.len(), 2);
    }

    #[test]
    fn quality_artifact_per_phase() {
        assert_eq!(
            quality_artifact(FeaturePhase::Specifying),
            Some(("spec.md", "specification"))
        );
        assert_eq!(
            quality_artifact(FeaturePhase::Planning),
            Some(("plan.md", "implementation-plan"))
        );
        assert_eq!(quality_artifact(FeaturePhase::Tasking), None);
    }

    #[test]
    fn find_feature_spec_dir_matches_prefix() {
        let dir = tempfile::TempDir::new().unwrap();
        let specs = dir.path().join(".specify").join("specs");
        std::fs::create_dir_all(specs.join("feat-1-login-flow")).unwrap();
        std::fs::create_dir_all(specs.join("feat-2-other")).unwrap();

        let found = find_feature_spec_dir(dir.path(), "FEAT-1").unwrap();
        assert!(found.ends_with("feat-1-login-flow"));
        assert!(find_feature_spec_dir(dir.path(), "FEAT-9").is_none());
    }
}
