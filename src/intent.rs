//! Intent classification with degrading fallback.
//!
//! Primary path asks the inference service to label the query with one of
//! the fixed categories. When inference is unavailable (detected via the
//! failure sentinel, never via an exception), a deterministic ordered rule
//! set over the lower-cased query decides instead. Identifier-bearing
//! queries always route toward workflow analysis first: an identifier is the
//! strongest signal available without inference.

use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

use crate::error::{Result, ScanSageError};
use crate::inference::{is_failure_sentinel, Inference};

lazy_static! {
    /// "workflow X" — explicit workflow reference.
    pub static ref WORKFLOW_ID_PATTERN: Regex =
        Regex::new(r"(?i)workflow\s+([A-Za-z0-9_:-]+)").unwrap();
    /// "scan X" — explicit scan reference.
    pub static ref SCAN_ID_PATTERN: Regex =
        Regex::new(r"(?i)scan\s+([A-Za-z0-9_:-]+)").unwrap();
    /// Hyphenated UUID anywhere in the text.
    pub static ref UUID_PATTERN: Regex = Regex::new(
        r"(?i)([0-9a-f]{8}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{12})"
    )
    .unwrap();
    /// Long alphanumeric token, typically a workflow id (20+ chars).
    pub static ref LONG_ID_PATTERN: Regex =
        Regex::new(r"([A-Za-z0-9_:-]{20,})").unwrap();
    /// "team X" override in the query text.
    pub static ref TEAM_PATTERN: Regex = Regex::new(r"(?i)team\s+(\w+)").unwrap();
    /// "N days" window in the query text.
    pub static ref DAYS_PATTERN: Regex = Regex::new(r"(?i)(\d+)\s+days?").unwrap();
}

/// The fixed set of query categories. Closed on purpose: every consumer
/// matches exhaustively.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Intent {
    Duration,
    Changes,
    WeaknessStats,
    ExplainFinding,
    Policy,
    WorkflowResult,
    DependencyGraph,
    General,
}

impl Intent {
    /// Parse the single-word category an inference response is expected to
    /// carry. Unknown or malformed input maps to `General`.
    pub fn from_category(text: &str) -> Intent {
        match text.trim().to_uppercase().as_str() {
            "DURATION" => Intent::Duration,
            "CHANGES" => Intent::Changes,
            "WEAKNESS_STATS" => Intent::WeaknessStats,
            "EXPLAIN_FINDING" => Intent::ExplainFinding,
            "POLICY" => Intent::Policy,
            "WORKFLOW_RESULT" => Intent::WorkflowResult,
            "DEPENDENCY_GRAPH" => Intent::DependencyGraph,
            _ => Intent::General,
        }
    }
}

const CLASSIFY_TEMPLATE: &str = "Classify the following security analyst query into one of these categories:
- DURATION: Questions about why a scan took a certain amount of time
- CHANGES: Questions about what changed between scans
- WEAKNESS_STATS: Questions about weakness (CWE) counts, trends, or statistics
- EXPLAIN_FINDING: Questions asking to explain a specific finding
- POLICY: Questions about policies or policy creation
- WORKFLOW_RESULT: Questions about the results / outcome of a workflow
- DEPENDENCY_GRAPH: Questions about project dependencies, components, or SBOMs
- GENERAL: Other questions
Query: {query}

Respond with only the category name.";

/// Maps a free-text query to an [`Intent`].
pub struct IntentClassifier {
    inference: Arc<dyn Inference>,
}

impl IntentClassifier {
    pub fn new(inference: Arc<dyn Inference>) -> Self {
        Self { inference }
    }

    /// Classify a query: inference first, pattern rules when inference is
    /// unavailable.
    pub async fn classify(&self, query: &str) -> Intent {
        match self.classify_with_inference(query).await {
            Ok(intent) => intent,
            Err(_) => {
                debug!("Inference classification unavailable, using pattern fallback");
                classify_by_pattern(query)
            }
        }
    }

    async fn classify_with_inference(&self, query: &str) -> Result<Intent> {
        let prompt = CLASSIFY_TEMPLATE.replace("{query}", query);
        let response = self.inference.generate(&prompt).await;
        if is_failure_sentinel(&response) {
            return Err(ScanSageError::Inference(
                "classification unavailable".to_string(),
            ));
        }
        Ok(Intent::from_category(&response))
    }
}

/// True when the text carries a workflow/scan identifier signal: a
/// hyphenated UUID, a long alphanumeric token, or an explicit
/// "workflow"/"scan" keyword.
pub fn has_identifier_signal(query: &str) -> bool {
    let lower = query.to_lowercase();
    UUID_PATTERN.is_match(query)
        || LONG_ID_PATTERN.is_match(query)
        || lower.contains("workflow")
        || lower.contains("scan")
}

fn has_duration_vocabulary(lower: &str) -> bool {
    lower.contains("duration")
        || lower.contains("took")
        || lower.contains("time")
        || lower.contains("minutes")
        || lower.contains("hours")
        || lower.contains("long")
}

fn has_failure_vocabulary(lower: &str) -> bool {
    lower.contains("what happened")
        || lower.contains("why did")
        || lower.contains("why failed")
        || lower.contains("failed")
        || lower.contains("fail")
        || lower.contains("status")
        || lower.contains("result")
        || lower.contains("what went wrong")
        || lower.contains("last workflow")
}

/// Deterministic fallback classification. Rules are evaluated in a fixed
/// priority order; the first match wins.
pub fn classify_by_pattern(query: &str) -> Intent {
    let lower = query.to_lowercase();

    if has_identifier_signal(query) {
        if has_failure_vocabulary(&lower) {
            return Intent::WorkflowResult;
        }
        if has_duration_vocabulary(&lower) {
            return Intent::Duration;
        }
        // An identifier with no further qualifier is a workflow lookup.
        return Intent::WorkflowResult;
    }

    if has_duration_vocabulary(&lower) {
        return Intent::Duration;
    }
    if lower.contains("change")
        || lower.contains("different")
        || lower.contains("since")
        || lower.contains("compare")
        || lower.contains("between")
    {
        return Intent::Changes;
    }
    if lower.contains("cwe")
        || lower.contains("top")
        || lower.contains("recurring")
        || lower.contains("statistics")
        || lower.contains("count")
        || lower.contains("trend")
    {
        return Intent::WeaknessStats;
    }
    if lower.contains("explain")
        || lower.contains("what is")
        || lower.contains("finding")
        || lower.contains("vulnerability")
        || lower.contains("issue")
    {
        return Intent::ExplainFinding;
    }
    if lower.contains("policy")
        || lower.contains("rule")
        || lower.contains("block")
        || lower.contains("allow")
        || lower.contains("enforce")
    {
        return Intent::Policy;
    }

    Intent::General
}
