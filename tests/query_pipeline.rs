//! End-to-end pipeline tests with stubbed external collaborators.

use async_trait::async_trait;
use chrono::{Duration, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

use scansage::depgraph::{BomUpload, DependencyGraph, Project, ProjectMetrics};
use scansage::error::Result;
use scansage::inference::Inference;
use scansage::router::{AnswerSource, QueryRouter};
use scansage::store::{EvidenceStore, Finding, Scan};
use scansage::workflow::{
    EventKind, FailureDetail, HistoryEvent, WorkflowExecution, WorkflowHistory, WorkflowStatus,
};

const DOWN_SENTINEL: &str =
    "The inference service is currently unavailable. Error: connection refused";

/// Scripted inference: classification prompts return a fixed category (or
/// the sentinel), other generation either succeeds with a canned answer or
/// returns the sentinel, embeddings come from a lookup table (empty when the
/// text is unknown). Every generate prompt is recorded.
struct StubInference {
    classification: Option<&'static str>,
    generation_down: bool,
    embeddings: HashMap<String, Vec<f32>>,
    prompts: Mutex<Vec<String>>,
}

impl StubInference {
    fn up(category: &'static str) -> Self {
        Self {
            classification: Some(category),
            generation_down: false,
            embeddings: HashMap::new(),
            prompts: Mutex::new(Vec::new()),
        }
    }

    fn down() -> Self {
        Self {
            classification: None,
            generation_down: true,
            embeddings: HashMap::new(),
            prompts: Mutex::new(Vec::new()),
        }
    }

    /// Classification works but every other generation fails.
    fn classify_only(category: &'static str) -> Self {
        Self {
            classification: Some(category),
            generation_down: true,
            embeddings: HashMap::new(),
            prompts: Mutex::new(Vec::new()),
        }
    }

    fn with_embedding(mut self, text: &str, embedding: Vec<f32>) -> Self {
        self.embeddings.insert(text.to_string(), embedding);
        self
    }

    fn classification_prompts(&self) -> usize {
        self.prompts
            .lock()
            .unwrap()
            .iter()
            .filter(|p| p.starts_with("Classify"))
            .count()
    }
}

#[async_trait]
impl Inference for StubInference {
    async fn generate(&self, prompt: &str) -> String {
        self.prompts.lock().unwrap().push(prompt.to_string());
        if prompt.starts_with("Classify") {
            return match self.classification {
                Some(category) => category.to_string(),
                None => DOWN_SENTINEL.to_string(),
            };
        }
        if self.generation_down {
            return DOWN_SENTINEL.to_string();
        }
        "Here is a concise answer based on the evidence.".to_string()
    }

    async fn embed(&self, text: &str) -> Vec<f32> {
        self.embeddings.get(text).cloned().unwrap_or_default()
    }
}

struct StubHistory {
    executions: HashMap<String, WorkflowExecution>,
    events: HashMap<String, Vec<HistoryEvent>>,
}

impl StubHistory {
    fn empty() -> Self {
        Self {
            executions: HashMap::new(),
            events: HashMap::new(),
        }
    }

    fn with_failed_run(workflow_id: &str) -> Self {
        let mut stub = Self::empty();
        stub.executions.insert(
            workflow_id.to_string(),
            WorkflowExecution {
                workflow_id: workflow_id.to_string(),
                run_id: Some("run-1".to_string()),
                status: WorkflowStatus::Failed,
                started_at: Some(Utc::now() - Duration::minutes(45)),
                closed_at: Some(Utc::now()),
                duration_ms: Some(45 * 60 * 1000),
                memo: HashMap::from([("team".to_string(), "payments".to_string())]),
            },
        );
        stub.events.insert(
            workflow_id.to_string(),
            vec![
                HistoryEvent {
                    event_id: 5,
                    timestamp: None,
                    kind: EventKind::ActivityScheduled {
                        activity_name: "scan-step".to_string(),
                    },
                },
                HistoryEvent {
                    event_id: 9,
                    timestamp: None,
                    kind: EventKind::ActivityFailed {
                        scheduled_event_id: 5,
                        failure: Some(FailureDetail {
                            message: "connection refused".to_string(),
                            stack_trace: None,
                            cause: None,
                            info: None,
                        }),
                    },
                },
            ],
        );
        stub
    }
}

#[async_trait]
impl WorkflowHistory for StubHistory {
    async fn describe_execution(
        &self,
        workflow_id: &str,
        _run_id: Option<&str>,
    ) -> Result<Option<WorkflowExecution>> {
        Ok(self.executions.get(workflow_id).cloned())
    }

    async fn get_history(
        &self,
        workflow_id: &str,
        _run_id: Option<&str>,
    ) -> Result<Vec<HistoryEvent>> {
        Ok(self.events.get(workflow_id).cloned().unwrap_or_default())
    }
}

struct StubDepGraph;

#[async_trait]
impl DependencyGraph for StubDepGraph {
    async fn lookup_project(&self, name: &str, _version: Option<&str>) -> Result<Option<Project>> {
        if name != "billing-api" {
            return Ok(None);
        }
        Ok(Some(Project {
            uuid: Uuid::nil(),
            name: name.to_string(),
            version: Some("2.3.0".to_string()),
            description: None,
            last_bom_import: None,
        }))
    }

    async fn project_metrics(&self, _project: Uuid) -> Result<ProjectMetrics> {
        Ok(ProjectMetrics {
            critical: 1,
            high: 3,
            vulnerabilities: 4,
            components: 57,
            ..Default::default()
        })
    }

    async fn bom_history(&self, _project: Uuid) -> Result<Vec<BomUpload>> {
        Ok(Vec::new())
    }
}

fn router(
    store: Arc<EvidenceStore>,
    inference: Arc<StubInference>,
    history: StubHistory,
) -> QueryRouter {
    QueryRouter::new(store, inference, Arc::new(history), Arc::new(StubDepGraph))
}

fn seeded_store() -> Arc<EvidenceStore> {
    let store = EvidenceStore::open_in_memory().unwrap();
    store.insert_cwe("CWE-89", "SQL Injection").unwrap();
    store.insert_cwe("CWE-79", "Cross-site Scripting").unwrap();

    let green = Scan {
        scan_id: Uuid::new_v4(),
        workflow_id: "wf-green".to_string(),
        run_id: None,
        team: "payments".to_string(),
        project: Some("billing-api".to_string()),
        scan_type: Some("SAST".to_string()),
        status: "COMPLETED".to_string(),
        started_at: Utc::now() - Duration::days(3),
        completed_at: Some(Utc::now() - Duration::days(3)),
    };
    let latest = Scan {
        scan_id: Uuid::new_v4(),
        workflow_id: "wf-123".to_string(),
        run_id: None,
        team: "payments".to_string(),
        project: Some("billing-api".to_string()),
        scan_type: Some("SAST".to_string()),
        status: "FAILED".to_string(),
        started_at: Utc::now() - Duration::hours(2),
        completed_at: None,
    };
    store.insert_scan(&green).unwrap();
    store.insert_scan(&latest).unwrap();

    for (scan_id, cwe, severity) in [
        (green.scan_id, "CWE-89", "HIGH"),
        (latest.scan_id, "CWE-89", "HIGH"),
        (latest.scan_id, "CWE-89", "CRITICAL"),
        (latest.scan_id, "CWE-79", "MEDIUM"),
    ] {
        store
            .insert_finding(&Finding {
                finding_id: Uuid::new_v4(),
                scan_id,
                cwe_id: cwe.to_string(),
                severity: severity.to_string(),
                title: format!("{} finding", cwe),
                description: Some("Detected by static analysis.".to_string()),
            })
            .unwrap();
    }

    Arc::new(store)
}

#[tokio::test]
async fn strong_knowledge_match_answers_without_classification() {
    let store = seeded_store();
    store
        .create_knowledge_entry(
            "How do I rerun a failed scan?",
            "Use the retry button on the scan page.",
            None,
            Some("analyst"),
        )
        .unwrap();

    let inference = Arc::new(
        StubInference::up("GENERAL")
            .with_embedding("how do i rerun a scan that failed", vec![1.0, 0.0, 0.0])
            .with_embedding("How do I rerun a failed scan?", vec![1.0, 0.0, 0.0]),
    );
    let router = router(store.clone(), inference.clone(), StubHistory::empty());

    let response = router
        .process("how do i rerun a scan that failed", None)
        .await
        .unwrap();

    assert_eq!(response.source, AnswerSource::KnowledgeBase);
    assert_eq!(response.answer, "Use the retry button on the scan page.");
    assert!((response.confidence - 1.0).abs() < 1e-6);
    assert_eq!(inference.classification_prompts(), 0);

    let entry = &store.active_knowledge_entries(None).unwrap()[0];
    assert_eq!(entry.usage_count, 1);
}

#[tokio::test]
async fn weak_knowledge_match_falls_through_to_classification() {
    let store = seeded_store();
    store
        .create_knowledge_entry("How do I rerun a failed scan?", "Retry it.", None, None)
        .unwrap();

    // cos([1,0,0], [0.75, 0.66, 0]) ~= 0.75: a match, but below auto-answer.
    let inference = Arc::new(
        StubInference::up("GENERAL")
            .with_embedding("something only loosely related", vec![1.0, 0.0, 0.0])
            .with_embedding("How do I rerun a failed scan?", vec![0.75, 0.6614, 0.0]),
    );
    let router = router(store, inference.clone(), StubHistory::empty());

    let response = router
        .process("something only loosely related", None)
        .await
        .unwrap();

    assert_eq!(response.source, AnswerSource::Inference);
    assert!((response.confidence - 0.8).abs() < 1e-6);
    assert_eq!(inference.classification_prompts(), 1);
}

#[tokio::test]
async fn failed_workflow_query_names_the_failed_activity() {
    let store = seeded_store();
    let inference = Arc::new(StubInference::down());
    let router = router(store, inference, StubHistory::with_failed_run("wf-123"));

    let response = router
        .process("workflow wf-123 why did it fail?", Some("payments"))
        .await
        .unwrap();

    assert_eq!(response.source, AnswerSource::EvidenceLayer);
    assert!((response.confidence - 1.0).abs() < 1e-6);
    assert!(response.answer.contains("scan-step"));
    assert!(response.answer.contains("connection refused"));
    assert!(response.answer.contains("FAILED"));

    let data = response.data.unwrap();
    assert_eq!(data["status"], "FAILED");
    assert_eq!(data["failed_activities"][0]["name"], "scan-step");
}

#[tokio::test]
async fn every_intent_answers_while_generation_is_down() {
    let store = seeded_store();
    let finding_id = store
        .findings_by_scan(store.latest_scan_by_team("payments").unwrap().unwrap().scan_id)
        .unwrap()[0]
        .finding_id;

    let cases = [
        ("DURATION", "how long did workflow wf-123 take".to_string()),
        ("WORKFLOW_RESULT", "workflow wf-123 what happened".to_string()),
        ("CHANGES", "what changed since the last green scan".to_string()),
        (
            "WEAKNESS_STATS",
            "top cwes for team payments last 7 days".to_string(),
        ),
        ("EXPLAIN_FINDING", format!("explain finding {}", finding_id)),
        (
            "DEPENDENCY_GRAPH",
            "how risky is project billing-api".to_string(),
        ),
        (
            "POLICY",
            "block critical findings for team payments".to_string(),
        ),
        ("GENERAL", "hello there".to_string()),
    ];

    for (category, query) in &cases {
        let inference = Arc::new(StubInference::classify_only(*category));
        let router = router(
            store.clone(),
            inference,
            StubHistory::with_failed_run("wf-123"),
        );

        let response = router.process(query, Some("payments")).await.unwrap();
        assert!(
            !response.answer.is_empty(),
            "empty answer for intent {}",
            category
        );
        assert!(
            (response.confidence - 0.5).abs() < 1e-6
                || (response.confidence - 1.0).abs() < 1e-6,
            "intent {} degraded to confidence {}",
            category,
            response.confidence
        );
    }
}

#[tokio::test]
async fn general_query_degrades_to_canned_answer_at_half_confidence() {
    let store = seeded_store();
    let inference = Arc::new(StubInference::down());
    let router = router(store, inference, StubHistory::empty());

    let response = router.process("hello there", None).await.unwrap();

    assert_eq!(response.source, AnswerSource::Inference);
    assert!((response.confidence - 0.5).abs() < 1e-6);
    assert!(!response.answer.is_empty());
}

#[tokio::test]
async fn weakness_stats_are_ranked_and_windowed() {
    let store = seeded_store();
    let inference = Arc::new(StubInference::down());
    let router = router(store, inference, StubHistory::empty());

    let response = router
        .process("top cwes for team payments last 7 days", None)
        .await
        .unwrap();

    assert_eq!(response.source, AnswerSource::EvidenceLayer);
    assert!((response.confidence - 1.0).abs() < 1e-6);
    assert!(response.answer.contains("last 7 days"));

    // CWE-89 has three findings in the window, CWE-79 one.
    let pos_89 = response.answer.find("CWE-89").unwrap();
    let pos_79 = response.answer.find("CWE-79").unwrap();
    assert!(pos_89 < pos_79);

    let data = response.data.unwrap();
    assert_eq!(data[0]["cwe_id"], "CWE-89");
    assert_eq!(data[0]["total_count"], 3);
    assert_eq!(data[0]["critical_count"], 1);
}

#[tokio::test]
async fn changes_between_two_scan_ids() {
    let store = seeded_store();
    let green = store.scan_by_workflow_id("wf-green").unwrap().unwrap();
    let latest = store.scan_by_workflow_id("wf-123").unwrap().unwrap();

    let inference = Arc::new(StubInference::up("CHANGES"));
    let router = router(store, inference, StubHistory::empty());

    let query = format!(
        "what changed between scan {} and scan {}",
        green.scan_id, latest.scan_id
    );
    let response = router.process(&query, None).await.unwrap();

    assert_eq!(response.source, AnswerSource::EvidenceLayer);
    assert!((response.confidence - 1.0).abs() < 1e-6);
    let data = response.data.unwrap();
    assert_eq!(data["new_count"], 3);
    assert_eq!(data["resolved_count"], 1);
}

#[tokio::test]
async fn changes_since_last_green_uses_team_context() {
    let store = seeded_store();
    let inference = Arc::new(StubInference::up("CHANGES"));
    let router = router(store, inference, StubHistory::empty());

    let response = router
        .process("what changed since the last green scan", Some("payments"))
        .await
        .unwrap();

    assert_eq!(response.source, AnswerSource::EvidenceLayer);
    let data = response.data.unwrap();
    assert_eq!(data["new_count"], 3);
    assert_eq!(data["resolved_count"], 1);
}

#[tokio::test]
async fn missing_identifier_asks_instead_of_guessing() {
    let store = seeded_store();
    let inference = Arc::new(StubInference::down());
    // A failed run exists for the team; it must not be substituted for a
    // workflow the user never named.
    let router = router(store, inference, StubHistory::with_failed_run("wf-123"));

    let response = router
        .process("how long did it take", Some("payments"))
        .await
        .unwrap();

    assert!((response.confidence - 0.0).abs() < 1e-6);
    assert!(response.answer.contains("identifier"));
    assert!(response.data.is_none());
}

#[tokio::test]
async fn last_workflow_phrasing_uses_team_latest() {
    let store = seeded_store();
    let inference = Arc::new(StubInference::down());
    let router = router(store, inference, StubHistory::with_failed_run("wf-123"));

    let response = router
        .process("what happened in the last workflow", Some("payments"))
        .await
        .unwrap();

    assert_eq!(response.source, AnswerSource::EvidenceLayer);
    assert!((response.confidence - 1.0).abs() < 1e-6);
    assert!(response.answer.contains("scan-step"));
}

#[tokio::test]
async fn duration_for_unknown_workflow_is_zero_confidence() {
    let store = seeded_store();
    let inference = Arc::new(StubInference::down());
    let router = router(store, inference, StubHistory::empty());

    let response = router
        .process("how long did workflow wf-missing take", None)
        .await
        .unwrap();

    assert!((response.confidence - 0.0).abs() < 1e-6);
    assert!(response.answer.contains("wf-missing"));
}

#[tokio::test]
async fn oversized_day_window_falls_back_to_default() {
    let store = seeded_store();
    let inference = Arc::new(StubInference::down());
    let router = router(store, inference, StubHistory::empty());

    let response = router
        .process("top cwes for team payments last 1000000000000 days", None)
        .await
        .unwrap();

    assert_eq!(response.source, AnswerSource::EvidenceLayer);
    assert!((response.confidence - 1.0).abs() < 1e-6);
    assert!(response.answer.contains("last 30 days"));
}

#[tokio::test]
async fn unresolvable_identifier_has_zero_confidence() {
    let store = seeded_store();
    let inference = Arc::new(StubInference::down());
    let router = router(store, inference, StubHistory::empty());

    let response = router
        .process("workflow wf-does-not-exist what happened", None)
        .await
        .unwrap();

    assert!((response.confidence - 0.0).abs() < 1e-6);
    assert!(response.answer.contains("wf-does-not-exist"));
}

#[tokio::test]
async fn explain_finding_degrades_to_stored_fields() {
    let store = seeded_store();
    let finding_id = store
        .findings_by_scan(store.latest_scan_by_team("payments").unwrap().unwrap().scan_id)
        .unwrap()[0]
        .finding_id;

    let inference = Arc::new(StubInference::classify_only("EXPLAIN_FINDING"));
    let router = router(store, inference, StubHistory::empty());

    let response = router
        .process(&format!("explain finding {}", finding_id), None)
        .await
        .unwrap();

    assert_eq!(response.source, AnswerSource::EvidenceLayer);
    assert!((response.confidence - 1.0).abs() < 1e-6);
    assert!(response.answer.contains("CWE-89"));
}

#[tokio::test]
async fn explain_unknown_finding_is_zero_confidence() {
    let store = seeded_store();
    let inference = Arc::new(StubInference::up("EXPLAIN_FINDING"));
    let router = router(store, inference, StubHistory::empty());

    let missing = Uuid::new_v4();
    let response = router
        .process(&format!("explain finding {}", missing), None)
        .await
        .unwrap();

    assert!((response.confidence - 0.0).abs() < 1e-6);
    assert!(response.answer.contains(&missing.to_string()));
}

#[tokio::test]
async fn dependency_graph_query_reports_metrics() {
    let store = seeded_store();
    let inference = Arc::new(StubInference::classify_only("DEPENDENCY_GRAPH"));
    let router = router(store, inference, StubHistory::empty());

    let response = router
        .process("how many vulnerabilities in project billing-api", None)
        .await
        .unwrap();

    assert_eq!(response.source, AnswerSource::EvidenceLayer);
    assert!((response.confidence - 1.0).abs() < 1e-6);
    assert!(response.answer.contains("billing-api"));
    assert!(response.answer.contains("57 components"));
}

#[tokio::test]
async fn policy_query_compiles_a_deterministic_rule() {
    let store = seeded_store();
    let inference = Arc::new(StubInference::up("POLICY"));
    let router = router(store, inference, StubHistory::empty());

    let response = router
        .process("block builds with critical findings for team payments", None)
        .await
        .unwrap();

    assert_eq!(response.source, AnswerSource::EvidenceLayer);
    assert!((response.confidence - 1.0).abs() < 1e-6);
    assert!(response
        .answer
        .contains("BLOCK when severity >= CRITICAL for team == payments"));
}
