//! Workflow-history adapter: execution status and event-stream analysis.
//!
//! The orchestration service exposes describe-execution and get-history
//! endpoints. This module turns the ordered event list into a
//! [`WorkflowRun`]: per-activity failures, a top-level failure cause, and a
//! textual analysis. Failed and timed-out activity events are correlated to
//! their names strictly via the scheduled-event id recorded on the failure
//! event — event ids are the only reliable correlation key when activities
//! run interleaved.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::config::WorkflowConfig;
use crate::error::{Result, ScanSageError};

/// Terminal and non-terminal run states, plus the two adapter-synthesized
/// states (`NotFound`, `Error`) for unresolvable runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkflowStatus {
    Running,
    Completed,
    Failed,
    Canceled,
    Terminated,
    TimedOut,
    NotFound,
    Error,
}

impl WorkflowStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowStatus::Running => "RUNNING",
            WorkflowStatus::Completed => "COMPLETED",
            WorkflowStatus::Failed => "FAILED",
            WorkflowStatus::Canceled => "CANCELED",
            WorkflowStatus::Terminated => "TERMINATED",
            WorkflowStatus::TimedOut => "TIMED_OUT",
            WorkflowStatus::NotFound => "NOT_FOUND",
            WorkflowStatus::Error => "ERROR",
        }
    }
}

/// Typed failure metadata carried on failure events.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FailureInfo {
    Application {
        error_type: String,
        non_retryable: bool,
    },
    Timeout {
        timeout_kind: String,
    },
    Canceled {
        details: Option<String>,
    },
}

/// Structured failure detail: message, optional stack trace, optional cause
/// chain, optional typed metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureDetail {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack_trace: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cause: Option<Box<FailureDetail>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub info: Option<FailureInfo>,
}

/// Concatenate every piece of structured failure detail into one readable
/// block: message, stack trace, cause chain, typed metadata.
pub fn format_failure(failure: &FailureDetail) -> String {
    let mut parts = Vec::new();
    if !failure.message.is_empty() {
        parts.push(format!("Error: {}", failure.message));
    }
    if let Some(ref stack) = failure.stack_trace {
        if !stack.is_empty() {
            parts.push(format!("Stack Trace:\n{}", stack));
        }
    }
    if let Some(ref cause) = failure.cause {
        if !cause.message.is_empty() {
            parts.push(format!("Caused by: {}", cause.message));
        }
    }
    match failure.info {
        Some(FailureInfo::Application {
            ref error_type,
            non_retryable,
        }) => {
            if !error_type.is_empty() {
                parts.push(format!("Failure Type: {}", error_type));
            }
            if non_retryable {
                parts.push("Non-retryable failure".to_string());
            }
        }
        Some(FailureInfo::Timeout { ref timeout_kind }) => {
            parts.push(format!("Timeout Type: {}", timeout_kind));
        }
        Some(FailureInfo::Canceled { ref details }) => {
            parts.push("Canceled failure".to_string());
            if let Some(ref details) = details {
                parts.push(format!("Cancelation Details: {}", details));
            }
        }
        None => {}
    }
    if parts.is_empty() {
        parts.push("No failure details available".to_string());
    }
    parts.join("\n")
}

/// What happened in one history event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum EventKind {
    ActivityScheduled {
        activity_name: String,
    },
    ActivityCompleted {
        scheduled_event_id: i64,
    },
    ActivityFailed {
        scheduled_event_id: i64,
        failure: Option<FailureDetail>,
    },
    ActivityTimedOut {
        scheduled_event_id: i64,
        failure: Option<FailureDetail>,
    },
    WorkflowFailed {
        failure: Option<FailureDetail>,
    },
    Other,
}

/// One event in a workflow run's ordered history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEvent {
    pub event_id: i64,
    pub timestamp: Option<DateTime<Utc>>,
    pub kind: EventKind,
}

/// Execution-level metadata from describe-execution.
#[derive(Debug, Clone)]
pub struct WorkflowExecution {
    pub workflow_id: String,
    pub run_id: Option<String>,
    pub status: WorkflowStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub closed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    /// Team/project/scan-type metadata attached to the run.
    pub memo: HashMap<String, String>,
}

/// A failed or timed-out activity with its extracted failure description.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedActivity {
    pub name: String,
    pub error: String,
}

/// Full analysis of one workflow run, retrieved fresh per query.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowRun {
    pub workflow_id: String,
    pub run_id: Option<String>,
    pub status: WorkflowStatus,
    pub duration_ms: Option<i64>,
    pub analysis: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub failed_activities: Vec<FailedActivity>,
}

/// Duration-focused view of one workflow run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DurationAnalysis {
    pub workflow_id: String,
    pub run_id: Option<String>,
    pub status: WorkflowStatus,
    pub duration_ms: Option<i64>,
    pub analysis: String,
}

/// Seam for the external orchestration service.
#[async_trait]
pub trait WorkflowHistory: Send + Sync {
    /// Execution status and metadata; `Ok(None)` when the run is unknown.
    async fn describe_execution(
        &self,
        workflow_id: &str,
        run_id: Option<&str>,
    ) -> Result<Option<WorkflowExecution>>;

    /// Ordered event history for the run.
    async fn get_history(&self, workflow_id: &str, run_id: Option<&str>)
        -> Result<Vec<HistoryEvent>>;
}

/// Correlate failure events with their activity names and extract the
/// top-level workflow failure.
///
/// One forward pass records each scheduled event's id → activity name; a
/// second pass resolves every failed/timed-out event through that map.
pub fn extract_failures(events: &[HistoryEvent]) -> (Vec<FailedActivity>, Option<String>) {
    let mut scheduled: HashMap<i64, &str> = HashMap::new();
    for event in events {
        if let EventKind::ActivityScheduled { ref activity_name } = event.kind {
            scheduled.insert(event.event_id, activity_name.as_str());
        }
    }

    let mut failed_activities = Vec::new();
    let mut error_message = None;

    for event in events {
        match event.kind {
            EventKind::ActivityFailed {
                scheduled_event_id,
                ref failure,
            } => {
                let name = scheduled
                    .get(&scheduled_event_id)
                    .map(|n| n.to_string())
                    .unwrap_or_else(|| "Unknown Activity".to_string());
                let error = failure
                    .as_ref()
                    .map(format_failure)
                    .unwrap_or_else(|| "Failure details unavailable".to_string());
                failed_activities.push(FailedActivity { name, error });
            }
            EventKind::ActivityTimedOut {
                scheduled_event_id,
                ref failure,
            } => {
                let name = scheduled
                    .get(&scheduled_event_id)
                    .map(|n| n.to_string())
                    .unwrap_or_else(|| "Unknown Activity".to_string());
                let error = format!(
                    "Activity timed out. {}",
                    failure
                        .as_ref()
                        .map(format_failure)
                        .unwrap_or_else(|| "Timeout details unavailable".to_string())
                );
                failed_activities.push(FailedActivity { name, error });
            }
            EventKind::WorkflowFailed { ref failure } => {
                if let Some(failure) = failure {
                    error_message = Some(format_failure(failure));
                }
            }
            _ => {}
        }
    }

    (failed_activities, error_message)
}

fn count_events(events: &[HistoryEvent]) -> (usize, usize, usize) {
    let mut scheduled = 0;
    let mut completed = 0;
    let mut failed = 0;
    for event in events {
        match event.kind {
            EventKind::ActivityScheduled { .. } => scheduled += 1,
            EventKind::ActivityCompleted { .. } => completed += 1,
            EventKind::ActivityFailed { .. } | EventKind::ActivityTimedOut { .. } => failed += 1,
            _ => {}
        }
    }
    (scheduled, completed, failed)
}

fn memo_line(memo: &HashMap<String, String>) -> String {
    let mut line = String::new();
    if let Some(team) = memo.get("team") {
        line.push_str(&format!("Team: {}\n", team));
    }
    if let Some(project) = memo.get("project") {
        line.push_str(&format!("Project: {}\n", project));
    }
    if let Some(scan_type) = memo.get("scanType") {
        line.push_str(&format!("Scan Type: {}\n", scan_type));
    }
    line
}

/// Composes describe-execution and get-history into run analyses. Transport
/// failures never propagate: they degrade into `NotFound`/`Error` runs the
/// router can still answer from.
pub struct WorkflowAnalyzer {
    history: Arc<dyn WorkflowHistory>,
}

impl WorkflowAnalyzer {
    pub fn new(history: Arc<dyn WorkflowHistory>) -> Self {
        Self { history }
    }

    /// Full run analysis: status, duration, per-activity failures, top-level
    /// cause.
    pub async fn analyze_run(&self, workflow_id: &str, run_id: Option<&str>) -> WorkflowRun {
        info!("Analyzing workflow run: {} (run {:?})", workflow_id, run_id);

        let execution = match self.history.describe_execution(workflow_id, run_id).await {
            Ok(Some(execution)) => execution,
            Ok(None) => {
                warn!("Workflow not found: {}", workflow_id);
                return WorkflowRun {
                    workflow_id: workflow_id.to_string(),
                    run_id: run_id.map(|r| r.to_string()),
                    status: WorkflowStatus::NotFound,
                    duration_ms: None,
                    analysis: "Workflow not found. Check that the workflow ID is correct."
                        .to_string(),
                    error_message: None,
                    failed_activities: Vec::new(),
                };
            }
            Err(e) => {
                warn!("Workflow history service unavailable: {}", e);
                return WorkflowRun {
                    workflow_id: workflow_id.to_string(),
                    run_id: run_id.map(|r| r.to_string()),
                    status: WorkflowStatus::Error,
                    duration_ms: None,
                    analysis: format!("Error querying workflow history: {}", e),
                    error_message: Some(e.to_string()),
                    failed_activities: Vec::new(),
                };
            }
        };

        let mut analysis = format!("Workflow Status: {}\n", execution.status.as_str());

        let events = match self.history.get_history(workflow_id, run_id).await {
            Ok(events) => events,
            Err(e) => {
                warn!("Could not retrieve workflow history: {}", e);
                Vec::new()
            }
        };

        let (failed_activities, error_message) = extract_failures(&events);

        if events.is_empty() {
            analysis.push_str("Workflow history unavailable.\n");
        } else {
            let (scheduled, completed, failed) = count_events(&events);
            analysis.push_str(&format!(
                "Activities: {} scheduled, {} completed, {} failed\n",
                scheduled, completed, failed
            ));
            if let (Some(first), Some(last)) = (
                events.first().and_then(|e| e.timestamp),
                events.last().and_then(|e| e.timestamp),
            ) {
                let total = (last - first).num_seconds();
                analysis.push_str(&format!("Total execution time: {} seconds\n", total));
            }
            analysis.push_str(&format!("Total events: {}\n", events.len()));
        }

        analysis.push_str(&memo_line(&execution.memo));

        if error_message.is_some() || !failed_activities.is_empty() {
            analysis.push_str("\n=== Failure Analysis ===\n");
            if let Some(ref message) = error_message {
                analysis.push_str(&format!("Workflow Error: {}\n", message));
            }
            if !failed_activities.is_empty() {
                analysis.push_str("Failed Activities:\n");
                for (i, activity) in failed_activities.iter().enumerate() {
                    analysis.push_str(&format!(
                        "{}. {}\n   Error: {}\n",
                        i + 1,
                        activity.name,
                        activity.error
                    ));
                }
            }
        }

        WorkflowRun {
            workflow_id: workflow_id.to_string(),
            run_id: execution.run_id,
            status: execution.status,
            duration_ms: execution.duration_ms,
            analysis,
            error_message,
            failed_activities,
        }
    }

    /// Duration-focused analysis for DURATION queries.
    pub async fn analyze_duration(
        &self,
        workflow_id: &str,
        run_id: Option<&str>,
    ) -> DurationAnalysis {
        let execution = match self.history.describe_execution(workflow_id, run_id).await {
            Ok(Some(execution)) => execution,
            Ok(None) => {
                return DurationAnalysis {
                    workflow_id: workflow_id.to_string(),
                    run_id: run_id.map(|r| r.to_string()),
                    status: WorkflowStatus::NotFound,
                    duration_ms: None,
                    analysis: "Workflow not found. Check that the workflow ID is correct."
                        .to_string(),
                }
            }
            Err(e) => {
                warn!("Workflow history service unavailable: {}", e);
                return DurationAnalysis {
                    workflow_id: workflow_id.to_string(),
                    run_id: run_id.map(|r| r.to_string()),
                    status: WorkflowStatus::Error,
                    duration_ms: None,
                    analysis: format!("Error querying workflow history: {}", e),
                };
            }
        };

        let mut analysis = format!(
            "Workflow Status: {}. Duration: {:.2} seconds",
            execution.status.as_str(),
            execution.duration_ms.unwrap_or(0) as f64 / 1000.0
        );

        match self.history.get_history(workflow_id, run_id).await {
            Ok(events) if !events.is_empty() => {
                let (scheduled, completed, _) = count_events(&events);
                analysis.push_str(&format!(". Executed {} activities.", scheduled + completed));
            }
            Ok(_) | Err(_) => {
                analysis.push_str(". History details unavailable.");
            }
        }

        let memo = memo_line(&execution.memo);
        if !memo.is_empty() {
            analysis.push(' ');
            analysis.push_str(memo.trim_end().replace('\n', ", ").as_str());
        }

        DurationAnalysis {
            workflow_id: workflow_id.to_string(),
            run_id: execution.run_id,
            status: execution.status,
            duration_ms: execution.duration_ms,
            analysis,
        }
    }
}

// --- HTTP client -----------------------------------------------------------

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct DescribeResponse {
    status: String,
    #[serde(default)]
    run_id: Option<String>,
    #[serde(default)]
    start_time: Option<DateTime<Utc>>,
    #[serde(default)]
    close_time: Option<DateTime<Utc>>,
    #[serde(default)]
    memo: HashMap<String, String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireFailure {
    #[serde(default)]
    message: String,
    #[serde(default)]
    stack_trace: Option<String>,
    #[serde(default)]
    cause: Option<Box<WireFailure>>,
    #[serde(default)]
    application_failure_info: Option<WireApplicationFailure>,
    #[serde(default)]
    timeout_failure_info: Option<WireTimeoutFailure>,
    #[serde(default)]
    canceled_failure_info: Option<WireCanceledFailure>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireApplicationFailure {
    #[serde(default, rename = "type")]
    error_type: String,
    #[serde(default)]
    non_retryable: bool,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireTimeoutFailure {
    #[serde(default)]
    timeout_type: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireCanceledFailure {
    #[serde(default)]
    details: Option<String>,
}

impl WireFailure {
    fn into_detail(self) -> FailureDetail {
        let info = if let Some(app) = self.application_failure_info {
            Some(FailureInfo::Application {
                error_type: app.error_type,
                non_retryable: app.non_retryable,
            })
        } else if let Some(timeout) = self.timeout_failure_info {
            Some(FailureInfo::Timeout {
                timeout_kind: timeout.timeout_type,
            })
        } else {
            self.canceled_failure_info
                .map(|canceled| FailureInfo::Canceled {
                    details: canceled.details,
                })
        };
        FailureDetail {
            message: self.message,
            stack_trace: self.stack_trace,
            cause: self.cause.map(|c| Box::new(c.into_detail())),
            info,
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireEvent {
    event_id: i64,
    #[serde(default)]
    event_time: Option<DateTime<Utc>>,
    event_type: String,
    #[serde(default)]
    activity_name: Option<String>,
    #[serde(default)]
    scheduled_event_id: Option<i64>,
    #[serde(default)]
    failure: Option<WireFailure>,
}

#[derive(Deserialize)]
struct HistoryResponse {
    #[serde(default)]
    events: Vec<WireEvent>,
}

impl WireEvent {
    fn into_event(self) -> HistoryEvent {
        let kind = match self.event_type.as_str() {
            "ACTIVITY_TASK_SCHEDULED" => EventKind::ActivityScheduled {
                activity_name: self.activity_name.unwrap_or_default(),
            },
            "ACTIVITY_TASK_COMPLETED" => EventKind::ActivityCompleted {
                scheduled_event_id: self.scheduled_event_id.unwrap_or_default(),
            },
            "ACTIVITY_TASK_FAILED" => EventKind::ActivityFailed {
                scheduled_event_id: self.scheduled_event_id.unwrap_or_default(),
                failure: self.failure.map(WireFailure::into_detail),
            },
            "ACTIVITY_TASK_TIMED_OUT" => EventKind::ActivityTimedOut {
                scheduled_event_id: self.scheduled_event_id.unwrap_or_default(),
                failure: self.failure.map(WireFailure::into_detail),
            },
            "WORKFLOW_EXECUTION_FAILED" => EventKind::WorkflowFailed {
                failure: self.failure.map(WireFailure::into_detail),
            },
            _ => EventKind::Other,
        };
        HistoryEvent {
            event_id: self.event_id,
            timestamp: self.event_time,
            kind,
        }
    }
}

fn status_from_wire(status: &str) -> WorkflowStatus {
    match status {
        "RUNNING" => WorkflowStatus::Running,
        "COMPLETED" => WorkflowStatus::Completed,
        "FAILED" => WorkflowStatus::Failed,
        "CANCELED" => WorkflowStatus::Canceled,
        "TERMINATED" => WorkflowStatus::Terminated,
        "TIMED_OUT" => WorkflowStatus::TimedOut,
        _ => WorkflowStatus::Error,
    }
}

/// JSON-over-HTTP client for the orchestration service's describe/history
/// endpoints.
pub struct WorkflowHistoryClient {
    http: reqwest::Client,
    base_url: String,
    namespace: String,
}

impl WorkflowHistoryClient {
    pub fn new(config: &WorkflowConfig) -> Self {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(config.timeout)
            .build()
            .unwrap_or_default();
        Self {
            http,
            base_url: config.base_url.clone(),
            namespace: config.namespace.clone(),
        }
    }

    fn execution_url(&self, workflow_id: &str, run_id: Option<&str>) -> String {
        format!(
            "{}/api/v1/namespaces/{}/workflows/{}/runs/{}",
            self.base_url,
            self.namespace,
            workflow_id,
            run_id.unwrap_or("latest")
        )
    }
}

#[async_trait]
impl WorkflowHistory for WorkflowHistoryClient {
    async fn describe_execution(
        &self,
        workflow_id: &str,
        run_id: Option<&str>,
    ) -> Result<Option<WorkflowExecution>> {
        let url = self.execution_url(workflow_id, run_id);
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| ScanSageError::WorkflowHistory(e.to_string()))?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(ScanSageError::WorkflowHistory(format!(
                "describe-execution returned {}",
                response.status()
            )));
        }

        let body: DescribeResponse = response
            .json()
            .await
            .map_err(|e| ScanSageError::WorkflowHistory(e.to_string()))?;

        let duration_ms = match (body.start_time, body.close_time) {
            (Some(start), Some(close)) => Some((close - start).num_milliseconds()),
            _ => None,
        };

        Ok(Some(WorkflowExecution {
            workflow_id: workflow_id.to_string(),
            run_id: body.run_id,
            status: status_from_wire(&body.status),
            started_at: body.start_time,
            closed_at: body.close_time,
            duration_ms,
            memo: body.memo,
        }))
    }

    async fn get_history(
        &self,
        workflow_id: &str,
        run_id: Option<&str>,
    ) -> Result<Vec<HistoryEvent>> {
        let url = format!("{}/history", self.execution_url(workflow_id, run_id));
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| ScanSageError::WorkflowHistory(e.to_string()))?;

        if !response.status().is_success() {
            return Err(ScanSageError::WorkflowHistory(format!(
                "get-history returned {}",
                response.status()
            )));
        }

        let body: HistoryResponse = response
            .json()
            .await
            .map_err(|e| ScanSageError::WorkflowHistory(e.to_string()))?;
        Ok(body.events.into_iter().map(WireEvent::into_event).collect())
    }
}
