//! Work-item id derivation.
//!
//! Item ids encode their purpose so idempotency checks reduce to string
//! equality: producers derive the same id for the same logical work.

/// Id for an issue-fix item: `gh-<project>-<issue>`.
pub fn issue_item(project: &str, issue_number: i64) -> String {
    format!("gh-{project}-{issue_number}")
}

/// Id for a rework item: `rework-<project>-pr-<n>-cycle-<k>`.
pub fn rework_item(project: &str, pr_number: i64, cycle: u32) -> String {
    format!("rework-{project}-pr-{pr_number}-cycle-{cycle}")
}

/// Id for a review item: `review-<project>-pr-<n>[-cycle-<k>]`.
/// The cycle suffix appears only on re-reviews.
pub fn review_item(project: &str, pr_number: i64, cycle: Option<u32>) -> String {
    match cycle {
        Some(k) => format!("review-{project}-pr-{pr_number}-cycle-{k}"),
        None => format!("review-{project}-pr-{pr_number}"),
    }
}

/// Id for a post-review merge item: `merge-<project>-pr-<n>`.
pub fn pr_merge_item(project: &str, pr_number: i64) -> String {
    format!("merge-{project}-pr-{pr_number}")
}

/// Id for a merge-fix recovery item: `merge-fix-<origId>-<pr>`.
pub fn merge_fix_item(original_item_id: &str, pr_number: i64) -> String {
    format!("merge-fix-{original_item_id}-{pr_number}")
}

/// Id for a SpecFlow phase item: `specflow-<feature>-<phase>`.
pub fn specflow_item(feature_id: &str, phase: &str) -> String {
    format!("specflow-{feature_id}-{phase}")
}

/// Branch name for an issue fix.
pub fn issue_branch(issue_number: i64) -> String {
    format!("fix/issue-{issue_number}")
}

/// Branch name for a SpecFlow feature (feature id lowercased).
pub fn specflow_branch(feature_id: &str) -> String {
    format!("specflow-{}", feature_id.to_lowercase())
}
