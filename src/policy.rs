//! Policy compilation: turn a natural-language policy request into a
//! structured, deterministic rule proposal.
//!
//! Compilation is intentionally inference-free. Policy text gates builds, so
//! the mapping from request to rule must be reproducible: the same request
//! always compiles to the same rule. Extraction is keyword and pattern based
//! over the lower-cased request.

use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::intent::TEAM_PATTERN;

lazy_static! {
    static ref CWE_PATTERN: Regex = Regex::new(r"(?i)(cwe-\d+)").unwrap();
    static ref PROJECT_PATTERN: Regex = Regex::new(r"(?i)project\s+([A-Za-z0-9_.-]+)").unwrap();
}

/// What the compiled rule does when its condition matches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PolicyAction {
    Block,
    Warn,
    Allow,
}

impl PolicyAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            PolicyAction::Block => "BLOCK",
            PolicyAction::Warn => "WARN",
            PolicyAction::Allow => "ALLOW",
        }
    }
}

/// A compiled policy rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompiledPolicy {
    pub action: PolicyAction,
    /// Condition expression, e.g. `severity >= HIGH` or `cwe == CWE-89`.
    pub condition: String,
    /// Where the rule applies: a team, a project, or all scans.
    pub scope: String,
    /// Human-readable rendering of the full rule.
    pub rule: String,
}

fn extract_action(lower: &str) -> PolicyAction {
    if lower.contains("block") || lower.contains("fail the build") || lower.contains("reject") {
        PolicyAction::Block
    } else if lower.contains("allow") || lower.contains("permit") || lower.contains("exempt") {
        PolicyAction::Allow
    } else {
        PolicyAction::Warn
    }
}

fn extract_condition(query: &str, lower: &str) -> String {
    if let Some(caps) = CWE_PATTERN.captures(query) {
        return format!("cwe == {}", caps[1].to_uppercase());
    }
    if lower.contains("critical") {
        return "severity >= CRITICAL".to_string();
    }
    if lower.contains("high") {
        return "severity >= HIGH".to_string();
    }
    if lower.contains("medium") {
        return "severity >= MEDIUM".to_string();
    }
    if lower.contains("low") {
        return "severity >= LOW".to_string();
    }
    "severity >= HIGH".to_string()
}

fn extract_scope(query: &str) -> String {
    if let Some(caps) = TEAM_PATTERN.captures(query) {
        return format!("team == {}", &caps[1]);
    }
    if let Some(caps) = PROJECT_PATTERN.captures(query) {
        return format!("project == {}", &caps[1]);
    }
    "all scans".to_string()
}

/// Compile a policy request into a structured rule proposal.
pub fn compile_policy(query: &str) -> CompiledPolicy {
    let lower = query.to_lowercase();
    let action = extract_action(&lower);
    let condition = extract_condition(query, &lower);
    let scope = extract_scope(query);
    let rule = format!("{} when {} for {}", action.as_str(), condition, scope);
    CompiledPolicy {
        action,
        condition,
        scope,
        rule,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_critical_for_team() {
        let policy = compile_policy("block builds with critical findings for team payments");
        assert_eq!(policy.action, PolicyAction::Block);
        assert_eq!(policy.condition, "severity >= CRITICAL");
        assert_eq!(policy.scope, "team == payments");
        assert_eq!(
            policy.rule,
            "BLOCK when severity >= CRITICAL for team == payments"
        );
    }

    #[test]
    fn cwe_condition_takes_precedence_over_severity() {
        let policy = compile_policy("block anything with CWE-89 even high severity");
        assert_eq!(policy.condition, "cwe == CWE-89");
    }

    #[test]
    fn defaults_are_warn_high_all_scans() {
        let policy = compile_policy("add a policy for new findings");
        assert_eq!(policy.action, PolicyAction::Warn);
        assert_eq!(policy.condition, "severity >= HIGH");
        assert_eq!(policy.scope, "all scans");
    }

    #[test]
    fn compilation_is_deterministic() {
        let a = compile_policy("block critical findings for project billing-api");
        let b = compile_policy("block critical findings for project billing-api");
        assert_eq!(a.rule, b.rule);
        assert_eq!(a.scope, "project == billing-api");
    }
}
