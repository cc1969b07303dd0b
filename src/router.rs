//! Query router: the resolution pipeline.
//!
//! Every query runs the same ladder: knowledge-base lookup first (a strong
//! match answers immediately and skips classification), then intent
//! classification, then a per-intent handler that gathers evidence and
//! synthesizes an answer. Handlers never fail on collaborator outages; they
//! degrade, and the response's confidence records how degraded the answer
//! is: evidence-backed answers carry 1.0, open inference 0.8, the canned
//! fallback 0.5, and an identifier the pipeline could not resolve 0.0.

use chrono::{Duration, Utc};
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::depgraph::{summarize_metrics, DependencyGraph};
use crate::error::{Result, ScanSageError};
use crate::explanation::{ExplanationCache, ExplanationService};
use crate::inference::{is_failure_sentinel, Inference};
use crate::intent::{
    has_identifier_signal, Intent, IntentClassifier, DAYS_PATTERN, LONG_ID_PATTERN,
    SCAN_ID_PATTERN, TEAM_PATTERN, UUID_PATTERN, WORKFLOW_ID_PATTERN,
};
use crate::knowledge::{KnowledgeEngine, AUTO_ANSWER_THRESHOLD};
use crate::policy::compile_policy;
use crate::store::EvidenceStore;
use crate::workflow::{WorkflowAnalyzer, WorkflowHistory, WorkflowStatus};

lazy_static! {
    static ref PROJECT_PATTERN: Regex =
        Regex::new(r"(?i)project\s+([A-Za-z0-9_.-]+)").unwrap();
}

/// Widest weakness window a query may request; larger values fall back to
/// the default rather than overflowing time arithmetic.
const MAX_WINDOW_DAYS: i64 = 3650;
const DEFAULT_WINDOW_DAYS: i64 = 30;

/// The query explicitly asks about the most recent workflow rather than a
/// named one. Only this phrasing may substitute a workflow the user did not
/// name; an unresolved identifier is otherwise a terminal zero-confidence
/// ask.
fn wants_latest_workflow(query: &str) -> bool {
    let lower = query.to_lowercase();
    lower.contains("last workflow") || lower.contains("latest workflow")
}

/// Where an answer came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AnswerSource {
    KnowledgeBase,
    EvidenceLayer,
    Inference,
}

/// The pipeline's answer to one query.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnswerResponse {
    pub source: AnswerSource,
    pub answer: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    pub confidence: f64,
}

impl AnswerResponse {
    fn evidence(answer: String, data: Option<serde_json::Value>) -> Self {
        Self {
            source: AnswerSource::EvidenceLayer,
            answer,
            data,
            confidence: 1.0,
        }
    }

    fn unresolved(answer: String) -> Self {
        Self {
            source: AnswerSource::EvidenceLayer,
            answer,
            data: None,
            confidence: 0.0,
        }
    }
}

const GENERAL_TEMPLATE: &str = "You are a security analyst assistant for scan results, \
workflows, and weaknesses. Answer the following question concisely.\nQuestion: {query}";

const SYNTHESIZE_TEMPLATE: &str = "Answer the analyst's question using only the evidence below. \
Be concise and factual.\n\nQuestion: {query}\n\nEvidence:\n{evidence}";

const EXTRACT_ID_TEMPLATE: &str = "Extract the workflow ID from this query. \
Respond with only the ID, or NONE if there is none.\nQuery: {query}";

const DEGRADED_ANSWER: &str = "I can help with scan durations, changes between scans, \
weakness statistics, finding explanations, policies, workflow results, and dependency \
insights. Advanced language features are temporarily unavailable, so please include a \
workflow or scan identifier, or ask about one of these topics directly.";

/// Dispatches queries through knowledge lookup, classification, and
/// per-intent evidence handlers.
pub struct QueryRouter {
    store: Arc<EvidenceStore>,
    inference: Arc<dyn Inference>,
    classifier: IntentClassifier,
    knowledge: KnowledgeEngine,
    analyzer: WorkflowAnalyzer,
    depgraph: Arc<dyn DependencyGraph>,
    explanations: ExplanationService,
    explanation_cache: Arc<ExplanationCache>,
}

impl QueryRouter {
    pub fn new(
        store: Arc<EvidenceStore>,
        inference: Arc<dyn Inference>,
        history: Arc<dyn WorkflowHistory>,
        depgraph: Arc<dyn DependencyGraph>,
    ) -> Self {
        let explanation_cache = Arc::new(ExplanationCache::new());
        Self {
            classifier: IntentClassifier::new(inference.clone()),
            knowledge: KnowledgeEngine::new(store.clone(), inference.clone()),
            analyzer: WorkflowAnalyzer::new(history),
            explanations: ExplanationService::new(
                store.clone(),
                inference.clone(),
                explanation_cache.clone(),
            ),
            explanation_cache,
            store,
            inference,
            depgraph,
        }
    }

    /// Drop all cached finding explanations.
    pub fn clear_explanations(&self) {
        self.explanation_cache.clear();
    }

    /// Resolve one query end to end.
    pub async fn process(&self, query: &str, team: Option<&str>) -> Result<AnswerResponse> {
        info!("Processing query: {}", query);

        if let Some(m) = self.knowledge.best_match(query, team).await? {
            if m.similarity >= AUTO_ANSWER_THRESHOLD {
                info!(
                    "Knowledge base answer (similarity {:.3}), skipping classification",
                    m.similarity
                );
                self.store.increment_usage(m.entry.kb_id)?;
                return Ok(AnswerResponse {
                    source: AnswerSource::KnowledgeBase,
                    answer: m.entry.answer,
                    data: None,
                    confidence: m.similarity,
                });
            }
            debug!(
                "Knowledge match below auto-answer threshold ({:.3}), continuing",
                m.similarity
            );
        }

        let intent = self.classifier.classify(query).await;
        info!("Classified intent: {:?}", intent);

        match intent {
            Intent::Duration => self.handle_duration(query, team).await,
            Intent::WorkflowResult => self.handle_workflow_result(query, team).await,
            Intent::Changes => self.handle_changes(query, team).await,
            Intent::WeaknessStats => self.handle_weakness_stats(query, team),
            Intent::DependencyGraph => self.handle_dependency_graph(query).await,
            Intent::ExplainFinding => self.handle_explain_finding(query).await,
            Intent::Policy => self.handle_policy(query),
            Intent::General => self.handle_general(query, team).await,
        }
    }

    /// Workflow-id resolution ladder: explicit "workflow X", explicit
    /// "scan X" resolved through the store, any UUID resolved through the
    /// store, a long bare token, and finally a single inference extraction
    /// whose output is discarded unless it looks like an id.
    async fn resolve_workflow_id(&self, query: &str) -> Option<String> {
        if let Some(caps) = WORKFLOW_ID_PATTERN.captures(query) {
            return Some(caps[1].to_string());
        }

        if let Some(caps) = SCAN_ID_PATTERN.captures(query) {
            if let Ok(scan_id) = Uuid::parse_str(&caps[1]) {
                if let Ok(Some(scan)) = self.store.scan_by_id(scan_id) {
                    return Some(scan.workflow_id);
                }
            }
        }

        if let Some(caps) = UUID_PATTERN.captures(query) {
            if let Ok(scan_id) = Uuid::parse_str(&caps[1]) {
                if let Ok(Some(scan)) = self.store.scan_by_id(scan_id) {
                    return Some(scan.workflow_id);
                }
                // Unknown to the store: treat the UUID itself as the
                // workflow id and let the history service decide.
                return Some(caps[1].to_string());
            }
        }

        if let Some(caps) = LONG_ID_PATTERN.captures(query) {
            return Some(caps[1].to_string());
        }

        let response = self
            .inference
            .generate(&EXTRACT_ID_TEMPLATE.replace("{query}", query))
            .await;
        let candidate = response.trim();
        if is_failure_sentinel(candidate)
            || candidate.is_empty()
            || candidate.eq_ignore_ascii_case("none")
            || candidate.contains(char::is_whitespace)
        {
            return None;
        }
        Some(candidate.to_string())
    }

    /// Latest workflow for the team, used by "last workflow" phrasings.
    /// Without a team the latest failed scan wins, then the latest completed.
    fn last_workflow_for_team(&self, team: Option<&str>) -> Option<String> {
        if let Some(team) = team {
            if let Ok(Some(scan)) = self.store.latest_scan_by_team(team) {
                return Some(scan.workflow_id);
            }
        }
        for status in ["FAILED", "COMPLETED"] {
            if let Ok(Some(scan)) = self.store.latest_scan_by_status(status) {
                return Some(scan.workflow_id);
            }
        }
        None
    }

    async fn synthesize(&self, query: &str, evidence: &str) -> String {
        let prompt = SYNTHESIZE_TEMPLATE
            .replace("{query}", query)
            .replace("{evidence}", evidence);
        let response = self.inference.generate(&prompt).await;
        if is_failure_sentinel(&response) {
            evidence.to_string()
        } else {
            response
        }
    }

    async fn handle_duration(&self, query: &str, team: Option<&str>) -> Result<AnswerResponse> {
        let workflow_id = if wants_latest_workflow(query) {
            self.last_workflow_for_team(team)
        } else {
            self.resolve_workflow_id(query).await
        };

        let workflow_id = match workflow_id {
            Some(id) => id,
            None => {
                return Ok(AnswerResponse::unresolved(
                    "I could not determine which workflow or scan you mean. \
                     Please include a workflow or scan identifier."
                        .to_string(),
                ))
            }
        };

        let duration = self.analyzer.analyze_duration(&workflow_id, None).await;
        if duration.status == WorkflowStatus::NotFound {
            return Ok(AnswerResponse::unresolved(format!(
                "No workflow found with id {}.",
                workflow_id
            )));
        }

        let answer = self.synthesize(query, &duration.analysis).await;
        let data = serde_json::to_value(&duration)?;
        Ok(AnswerResponse::evidence(answer, Some(data)))
    }

    async fn handle_workflow_result(
        &self,
        query: &str,
        team: Option<&str>,
    ) -> Result<AnswerResponse> {
        let workflow_id = if wants_latest_workflow(query) {
            self.last_workflow_for_team(team)
        } else {
            self.resolve_workflow_id(query).await
        };

        let workflow_id = match workflow_id {
            Some(id) => id,
            None => {
                return Ok(AnswerResponse::unresolved(
                    "I could not determine which workflow you mean. \
                     Please include a workflow or scan identifier."
                        .to_string(),
                ))
            }
        };

        let run = self.analyzer.analyze_run(&workflow_id, None).await;
        if run.status == WorkflowStatus::NotFound {
            return Ok(AnswerResponse::unresolved(format!(
                "No workflow found with id {}.",
                workflow_id
            )));
        }

        let answer = self.synthesize(query, &run.analysis).await;
        let data = serde_json::to_value(&run)?;
        Ok(AnswerResponse::evidence(answer, Some(data)))
    }

    async fn handle_changes(&self, query: &str, team: Option<&str>) -> Result<AnswerResponse> {
        let ids: Vec<Uuid> = UUID_PATTERN
            .captures_iter(query)
            .filter_map(|caps| Uuid::parse_str(&caps[1]).ok())
            .collect();

        let comparison = if ids.len() >= 2 {
            match self.store.compare_scans(ids[0], ids[1]) {
                Ok(comparison) => comparison,
                Err(ScanSageError::NotFound(what)) => {
                    return Ok(AnswerResponse::unresolved(format!(
                        "Could not compare scans: {} does not exist.",
                        what
                    )))
                }
                Err(e) => return Err(e),
            }
        } else {
            let team = TEAM_PATTERN
                .captures(query)
                .map(|caps| caps[1].to_string())
                .or_else(|| team.map(|t| t.to_string()));
            match team {
                Some(team) => match self.store.changes_since_last_green(&team) {
                    Ok(comparison) => comparison,
                    Err(ScanSageError::NotFound(_)) => {
                        return Ok(AnswerResponse::unresolved(format!(
                            "Not enough scan history for team {} to compare against \
                             the last green scan.",
                            team
                        )))
                    }
                    Err(e) => return Err(e),
                },
                None => return self.handle_general(query, None).await,
            }
        };

        let answer = self.synthesize(query, &comparison.summary).await;
        let data = serde_json::to_value(&comparison)?;
        Ok(AnswerResponse::evidence(answer, Some(data)))
    }

    fn handle_weakness_stats(&self, query: &str, team: Option<&str>) -> Result<AnswerResponse> {
        let team = match TEAM_PATTERN
            .captures(query)
            .map(|caps| caps[1].to_string())
            .or_else(|| team.map(|t| t.to_string()))
        {
            Some(team) => team,
            None => {
                return Ok(AnswerResponse::unresolved(
                    "Weakness statistics are per team. Please name a team, \
                     e.g. \"top CWEs for team payments\"."
                        .to_string(),
                ))
            }
        };

        let days: i64 = DAYS_PATTERN
            .captures(query)
            .and_then(|caps| caps[1].parse().ok())
            .filter(|d| (1..=MAX_WINDOW_DAYS).contains(d))
            .unwrap_or(DEFAULT_WINDOW_DAYS);
        let until = Utc::now();
        let since = until - Duration::days(days);

        let stats = self.store.top_weaknesses(&team, since, until, 10)?;
        if stats.is_empty() {
            return Ok(AnswerResponse::evidence(
                format!(
                    "No findings recorded for team {} in the last {} days.",
                    team, days
                ),
                None,
            ));
        }

        let mut answer = format!(
            "Top weaknesses for team {} over the last {} days:\n",
            team, days
        );
        for (i, stat) in stats.iter().enumerate() {
            answer.push_str(&format!(
                "{}. {} ({}): {} findings ({} critical, {} high)\n",
                i + 1,
                stat.cwe_id,
                stat.name,
                stat.total_count,
                stat.critical_count,
                stat.high_count
            ));
        }

        let data = serde_json::to_value(&stats)?;
        Ok(AnswerResponse::evidence(answer, Some(data)))
    }

    async fn handle_dependency_graph(&self, query: &str) -> Result<AnswerResponse> {
        let name = match PROJECT_PATTERN.captures(query) {
            Some(caps) => caps[1].to_string(),
            None => {
                return Ok(AnswerResponse::unresolved(
                    "Please name the project you want dependency information for, \
                     e.g. \"dependencies of project billing-api\"."
                        .to_string(),
                ))
            }
        };

        let project = match self.depgraph.lookup_project(&name, None).await {
            Ok(Some(project)) => project,
            Ok(None) => {
                return Ok(AnswerResponse::unresolved(format!(
                    "No project named {} in the dependency graph.",
                    name
                )))
            }
            Err(e) => {
                warn!("Dependency graph unavailable: {}", e);
                return Ok(AnswerResponse {
                    source: AnswerSource::EvidenceLayer,
                    answer: format!(
                        "The dependency graph service is currently unavailable, \
                         so I cannot look up project {} right now.",
                        name
                    ),
                    data: None,
                    confidence: 0.5,
                });
            }
        };

        let metrics = match self.depgraph.project_metrics(project.uuid).await {
            Ok(metrics) => metrics,
            Err(e) => {
                warn!("Dependency graph metrics unavailable: {}", e);
                return Ok(AnswerResponse {
                    source: AnswerSource::EvidenceLayer,
                    answer: format!(
                        "Found project {} but its metrics are currently unavailable.",
                        project.name
                    ),
                    data: Some(serde_json::to_value(&project)?),
                    confidence: 0.5,
                });
            }
        };

        let mut evidence = summarize_metrics(&project, &metrics);
        match self.depgraph.bom_history(project.uuid).await {
            Ok(uploads) if !uploads.is_empty() => {
                evidence.push_str(&format!(". {} BOM uploads recorded", uploads.len()));
            }
            Ok(_) => {}
            Err(e) => warn!("BOM history unavailable: {}", e),
        }

        let answer = self.synthesize(query, &evidence).await;
        let data = serde_json::json!({ "project": project, "metrics": metrics });
        Ok(AnswerResponse::evidence(answer, Some(data)))
    }

    async fn handle_explain_finding(&self, query: &str) -> Result<AnswerResponse> {
        let finding_id = UUID_PATTERN
            .captures(query)
            .and_then(|caps| Uuid::parse_str(&caps[1]).ok());

        let finding_id = match finding_id {
            Some(id) => id,
            None => {
                return Ok(AnswerResponse::unresolved(
                    "Please include the finding id (a UUID) you want explained."
                        .to_string(),
                ))
            }
        };

        match self.explanations.explain(finding_id).await {
            Ok(output) => {
                let data = serde_json::to_value(&output)?;
                Ok(AnswerResponse::evidence(output.render(), Some(data)))
            }
            Err(ScanSageError::NotFound(_)) => Ok(AnswerResponse::unresolved(format!(
                "No finding with id {}.",
                finding_id
            ))),
            Err(e) => Err(e),
        }
    }

    fn handle_policy(&self, query: &str) -> Result<AnswerResponse> {
        let policy = compile_policy(query);
        let answer = format!("Proposed policy rule: {}", policy.rule);
        let data = serde_json::to_value(&policy)?;
        Ok(AnswerResponse::evidence(answer, Some(data)))
    }

    async fn handle_general(&self, query: &str, team: Option<&str>) -> Result<AnswerResponse> {
        // An identifier in a general query usually means the classifier was
        // degraded; retry as a duration lookup before open-ended inference.
        if has_identifier_signal(query) {
            if let Some(workflow_id) = self.resolve_workflow_id(query).await {
                let duration = self.analyzer.analyze_duration(&workflow_id, None).await;
                if duration.duration_ms.is_some() {
                    let answer = self.synthesize(query, &duration.analysis).await;
                    let data = serde_json::to_value(&duration)?;
                    return Ok(AnswerResponse::evidence(answer, Some(data)));
                }
            }
        }

        let mut prompt = GENERAL_TEMPLATE.replace("{query}", query);
        if let Some(team) = team {
            prompt.push_str(&format!("\nTeam context: {}", team));
        }
        let response = self.inference.generate(&prompt).await;
        if is_failure_sentinel(&response) {
            return Ok(AnswerResponse {
                source: AnswerSource::Inference,
                answer: DEGRADED_ANSWER.to_string(),
                data: None,
                confidence: 0.5,
            });
        }

        Ok(AnswerResponse {
            source: AnswerSource::Inference,
            answer: response,
            data: None,
            confidence: 0.8,
        })
    }
}
