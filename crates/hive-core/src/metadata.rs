//! Typed views over work-item metadata.
//!
//! Work items carry a free-form JSON bag; a small set of mutually
//! exclusive keys tags which pipeline owns the item. Each parser returns
//! `Some` only when its discriminant is present and the required fields
//! decode; anything else falls through to the next variant.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::WorkItem;

/// Sources that participate in a review cycle for some branch.
pub const REVIEW_CYCLE_SOURCES: [&str; 4] = ["code_review", "rework", "pr_merge", "merge-fix"];

/// Metadata for an item imported from a tracker issue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssueMeta {
    pub issue_number: i64,
    pub repo: String,
    pub author: Option<String>,
    /// Trusted sources may set this false to allow auto-merge.
    pub human_review_required: bool,
}

/// Metadata for a SpecFlow phase work item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpecflowMeta {
    pub feature_id: String,
    pub phase: String,
    pub project_id: String,
}

/// Metadata for a merge-fix recovery item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeFixMeta {
    pub pr_number: i64,
    pub pr_url: String,
    pub branch: String,
    pub main_branch: String,
    pub original_item_id: String,
    pub project_id: String,
}

/// Metadata for a post-review merge item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrMergeMeta {
    pub pr_number: i64,
    pub pr_url: String,
    pub repo: String,
    pub branch: String,
    pub main_branch: String,
    pub implementation_work_item_id: String,
    pub project_id: String,
}

/// One inline review comment carried into a rework prompt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InlineCommentMeta {
    pub path: String,
    pub line: i64,
    pub body: String,
    pub author: String,
}

/// Metadata for a review-driven rework item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReworkMeta {
    pub pr_number: i64,
    pub pr_url: String,
    pub repo: String,
    pub branch: String,
    pub main_branch: String,
    pub implementation_work_item_id: String,
    pub review_feedback: String,
    pub rework_cycle: u32,
    pub project_id: String,
    pub worktree_path: Option<String>,
    pub inline_comments: Option<Vec<InlineCommentMeta>>,
    pub max_rework_cycles: Option<u32>,
}

/// Metadata for a code-review item (discriminated by `source = code_review`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviewMeta {
    pub pr_number: i64,
    pub repo: String,
    pub branch: String,
    pub pr_url: Option<String>,
    pub main_branch: Option<String>,
    pub implementation_work_item_id: Option<String>,
    pub rework_cycle: Option<u32>,
    /// Spec directory used to attach spec/plan/tasks context to the prompt.
    pub spec_path: Option<String>,
}

/// Metadata for a Tana-sourced item (write-back target).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TanaMeta {
    pub node_id: String,
    pub workspace_id: Option<String>,
    pub tag_id: Option<String>,
}

/// Pipeline-selecting classification of a work item. First match wins,
/// in this order.
#[derive(Debug, Clone, PartialEq)]
pub enum ItemKind {
    SpecFlow(SpecflowMeta),
    MergeFix(MergeFixMeta),
    Issue(IssueMeta),
    Review(ReviewMeta),
    Rework(ReworkMeta),
    PrMerge(PrMergeMeta),
    Plain,
}

fn as_object(raw: Option<&str>) -> Option<Value> {
    let value: Value = serde_json::from_str(raw?).ok()?;
    value.is_object().then_some(value)
}

fn str_field(value: &Value, key: &str) -> Option<String> {
    value.get(key).and_then(Value::as_str).map(String::from)
}

fn int_field(value: &Value, key: &str) -> Option<i64> {
    value.get(key).and_then(Value::as_i64)
}

fn flag(value: &Value, key: &str) -> bool {
    value.get(key).and_then(Value::as_bool).unwrap_or(false)
}

/// Parse an issue variant: requires `github_issue_number` and `github_repo`.
pub fn parse_issue(value: &Value) -> Option<IssueMeta> {
    let issue_number = int_field(value, "github_issue_number")?;
    let repo = str_field(value, "github_repo")?;
    Some(IssueMeta {
        issue_number,
        repo,
        author: str_field(value, "author"),
        human_review_required: value
            .get("human_review_required")
            .and_then(Value::as_bool)
            .unwrap_or(true),
    })
}

/// Parse a SpecFlow variant. Accepts the canonical `specflow_*` keys or
/// the shorthand `feature_id` / `phase` / `project_id`.
pub fn parse_specflow(value: &Value) -> Option<SpecflowMeta> {
    let feature_id =
        str_field(value, "specflow_feature_id").or_else(|| str_field(value, "feature_id"))?;
    let phase = str_field(value, "specflow_phase").or_else(|| str_field(value, "phase"))?;
    let project_id =
        str_field(value, "specflow_project_id").or_else(|| str_field(value, "project_id"))?;
    Some(SpecflowMeta {
        feature_id,
        phase,
        project_id,
    })
}

/// Parse a merge-fix variant: requires the `merge_fix: true` tag.
pub fn parse_merge_fix(value: &Value) -> Option<MergeFixMeta> {
    if !flag(value, "merge_fix") {
        return None;
    }
    serde_json::from_value(value.clone()).ok()
}

/// Parse a PR-merge variant: requires the `pr_merge: true` tag.
pub fn parse_pr_merge(value: &Value) -> Option<PrMergeMeta> {
    if !flag(value, "pr_merge") {
        return None;
    }
    serde_json::from_value(value.clone()).ok()
}

/// Parse a rework variant: requires the `rework: true` tag.
pub fn parse_rework(value: &Value) -> Option<ReworkMeta> {
    if !flag(value, "rework") {
        return None;
    }
    serde_json::from_value(value.clone()).ok()
}

/// Parse a review variant. The discriminant is the item source, so this
/// only checks the required fields.
pub fn parse_review(value: &Value) -> Option<ReviewMeta> {
    let pr_number = int_field(value, "pr_number")?;
    let repo = str_field(value, "repo")?;
    let branch = str_field(value, "branch")?;
    Some(ReviewMeta {
        pr_number,
        repo,
        branch,
        pr_url: str_field(value, "pr_url"),
        main_branch: str_field(value, "main_branch"),
        implementation_work_item_id: str_field(value, "implementation_work_item_id"),
        rework_cycle: value
            .get("rework_cycle")
            .and_then(Value::as_u64)
            .map(|n| n as u32),
        spec_path: str_field(value, "spec_path"),
    })
}

/// Parse a Tana write-back target: requires `tana_node_id`. Orthogonal to
/// the pipeline variants; issue items may carry it alongside.
pub fn parse_tana(value: &Value) -> Option<TanaMeta> {
    Some(TanaMeta {
        node_id: str_field(value, "tana_node_id")?,
        workspace_id: str_field(value, "tana_workspace_id"),
        tag_id: str_field(value, "tana_tag_id"),
    })
}

/// Classify a work item into its pipeline. First match wins.
pub fn classify(item: &WorkItem) -> ItemKind {
    let value = as_object(item.metadata.as_deref()).unwrap_or(Value::Null);

    if let Some(meta) = parse_specflow(&value) {
        return ItemKind::SpecFlow(meta);
    }
    if let Some(meta) = parse_merge_fix(&value) {
        return ItemKind::MergeFix(meta);
    }
    if let Some(meta) = parse_issue(&value) {
        return ItemKind::Issue(meta);
    }
    if item.source.as_deref() == Some("code_review") {
        if let Some(meta) = parse_review(&value) {
            return ItemKind::Review(meta);
        }
    }
    if let Some(meta) = parse_rework(&value) {
        return ItemKind::Rework(meta);
    }
    if let Some(meta) = parse_pr_merge(&value) {
        return ItemKind::PrMerge(meta);
    }
    ItemKind::Plain
}

/// Whether an item belongs to an active review cycle: its source is one of
/// the review-cycle sources, or its metadata carries any of the cycle tags.
pub fn is_review_cycle_item(source: Option<&str>, metadata: Option<&str>) -> bool {
    if source.is_some_and(|s| REVIEW_CYCLE_SOURCES.contains(&s)) {
        return true;
    }
    let Some(value) = as_object(metadata) else {
        return false;
    };
    ["rework", "pr_merge", "merge_fix", "review_status"]
        .iter()
        .any(|key| value.get(*key).is_some())
}

/// The branch a cycle item references, if any.
pub fn cycle_branch(metadata: Option<&str>) -> Option<String> {
    as_object(metadata).and_then(|value| str_field(&value, "branch"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ItemStatus, Priority};
    use chrono::Utc;

    fn item(source: Option<&str>, metadata: Option<&str>) -> WorkItem {
        let now = Utc::now();
        WorkItem {
            item_id: "item-1".to_string(),
            project_id: Some("proj".to_string()),
            title: "Test".to_string(),
            description: None,
            priority: Priority::P2,
            status: ItemStatus::Available,
            source: source.map(String::from),
            source_ref: None,
            claimed_by: None,
            created_at: now,
            updated_at: now,
            metadata: metadata.map(String::from),
        }
    }

    #[test]
    fn issue_meta_defaults_human_review_to_true() {
        let value: Value =
            serde_json::from_str(r#"{"github_issue_number": 7, "github_repo": "o/r"}"#).unwrap();
        let meta = parse_issue(&value).unwrap();
        assert_eq!(meta.issue_number, 7);
        assert_eq!(meta.repo, "o/r");
        assert!(meta.human_review_required);

        let trusted: Value = serde_json::from_str(
            r#"{"github_issue_number": 7, "github_repo": "o/r", "human_review_required": false}"#,
        )
        .unwrap();
        assert!(!parse_issue(&trusted).unwrap().human_review_required);
    }

    #[test]
    fn specflow_meta_accepts_shorthand_keys() {
        let canonical: Value = serde_json::from_str(
            r#"{"specflow_feature_id": "F1", "specflow_phase": "specifying", "specflow_project_id": "p"}"#,
        )
        .unwrap();
        let shorthand: Value =
            serde_json::from_str(r#"{"feature_id": "F1", "phase": "specifying", "project_id": "p"}"#)
                .unwrap();
        assert_eq!(parse_specflow(&canonical), parse_specflow(&shorthand));
    }

    #[test]
    fn merge_fix_requires_tag() {
        let untagged: Value = serde_json::from_str(
            r#"{"pr_number": 1, "pr_url": "u", "branch": "b", "main_branch": "main",
                "original_item_id": "i", "project_id": "p"}"#,
        )
        .unwrap();
        assert!(parse_merge_fix(&untagged).is_none());

        let tagged: Value = serde_json::from_str(
            r#"{"merge_fix": true, "pr_number": 1, "pr_url": "u", "branch": "b",
                "main_branch": "main", "original_item_id": "i", "project_id": "p"}"#,
        )
        .unwrap();
        let meta = parse_merge_fix(&tagged).unwrap();
        assert_eq!(meta.pr_number, 1);
        assert_eq!(meta.branch, "b");
    }

    #[test]
    fn rework_round_trips_inline_comments() {
        let meta = ReworkMeta {
            pr_number: 42,
            pr_url: "https://example.com/pr/42".to_string(),
            repo: "o/r".to_string(),
            branch: "fix/issue-9".to_string(),
            main_branch: "main".to_string(),
            implementation_work_item_id: "gh-p-9".to_string(),
            review_feedback: "tighten error handling".to_string(),
            rework_cycle: 2,
            project_id: "p".to_string(),
            worktree_path: None,
            inline_comments: Some(vec![InlineCommentMeta {
                path: "src/lib.rs".to_string(),
                line: 10,
                body: "unwrap here".to_string(),
                author: "reviewer".to_string(),
            }]),
            max_rework_cycles: None,
        };
        let mut json = serde_json::to_value(&meta).unwrap();
        json["rework"] = Value::Bool(true);
        let parsed = parse_rework(&json).unwrap();
        assert_eq!(parsed, meta);
    }

    #[test]
    fn classify_prefers_specflow_over_issue() {
        let both = item(
            Some("specflow"),
            Some(
                r#"{"specflow_feature_id": "F1", "specflow_phase": "specifying",
                    "specflow_project_id": "p", "github_issue_number": 7, "github_repo": "o/r"}"#,
            ),
        );
        assert!(matches!(classify(&both), ItemKind::SpecFlow(_)));
    }

    #[test]
    fn classify_review_requires_code_review_source() {
        let meta = r#"{"pr_number": 5, "repo": "o/r", "branch": "fix/issue-5"}"#;
        assert!(matches!(
            classify(&item(Some("code_review"), Some(meta))),
            ItemKind::Review(_)
        ));
        // Same metadata without the source is not a review item.
        assert!(matches!(
            classify(&item(Some("github"), Some(meta))),
            ItemKind::Plain
        ));
    }

    #[test]
    fn classify_falls_back_to_plain() {
        assert_eq!(classify(&item(None, None)), ItemKind::Plain);
        assert_eq!(classify(&item(None, Some("not json"))), ItemKind::Plain);
        assert_eq!(classify(&item(None, Some(r#"{"other": 1}"#))), ItemKind::Plain);
    }

    #[test]
    fn review_cycle_detection_by_source_and_tags() {
        assert!(is_review_cycle_item(Some("code_review"), None));
        assert!(is_review_cycle_item(Some("merge-fix"), None));
        assert!(!is_review_cycle_item(Some("github"), None));
        assert!(is_review_cycle_item(None, Some(r#"{"rework": true}"#)));
        assert!(is_review_cycle_item(
            None,
            Some(r#"{"review_status": "approved"}"#)
        ));
        assert!(!is_review_cycle_item(None, Some(r#"{"branch": "b"}"#)));
    }

    #[test]
    fn cycle_branch_reads_branch_key() {
        assert_eq!(
            cycle_branch(Some(r#"{"branch": "fix/issue-7"}"#)),
            Some("fix/issue-7".to_string())
        );
        assert_eq!(cycle_branch(Some("{}")), None);
        assert_eq!(cycle_branch(None), None);
    }

    #[test]
    fn tana_meta_is_orthogonal() {
        let value: Value = serde_json::from_str(
            r#"{"github_issue_number": 3, "github_repo": "o/r", "tana_node_id": "n1"}"#,
        )
        .unwrap();
        assert!(parse_issue(&value).is_some());
        let tana = parse_tana(&value).unwrap();
        assert_eq!(tana.node_id, "n1");
        assert!(tana.workspace_id.is_none());
    }
}
