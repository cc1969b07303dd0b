//! Dependency graph (software composition analysis) client.
//!
//! Talks to a Dependency-Track-compatible REST API: project lookup by
//! name/version, current portfolio metrics, and BOM upload history. The
//! router treats this source as optional: lookups that fail degrade to
//! `None` with a warning rather than aborting the query.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::DependencyGraphConfig;
use crate::error::{Result, ScanSageError};

/// A tracked project in the dependency graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub uuid: Uuid,
    pub name: String,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub last_bom_import: Option<i64>,
}

/// Current vulnerability metrics for a project, bucketed by severity.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectMetrics {
    #[serde(default)]
    pub critical: i64,
    #[serde(default)]
    pub high: i64,
    #[serde(default)]
    pub medium: i64,
    #[serde(default)]
    pub low: i64,
    #[serde(default)]
    pub unassigned: i64,
    #[serde(default)]
    pub vulnerabilities: i64,
    #[serde(default)]
    pub components: i64,
    #[serde(default)]
    pub suppressed: i64,
    #[serde(default)]
    pub inherited_risk_score: f64,
}

/// One recorded BOM (bill of materials) upload for a project.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BomUpload {
    #[serde(default)]
    pub bom_format: Option<String>,
    #[serde(default)]
    pub spec_version: Option<String>,
    #[serde(default)]
    pub imported: Option<i64>,
}

/// Seam for the composition-analysis service.
#[async_trait]
pub trait DependencyGraph: Send + Sync {
    /// Resolve a project by name and optional version. `Ok(None)` when the
    /// project is unknown.
    async fn lookup_project(&self, name: &str, version: Option<&str>) -> Result<Option<Project>>;

    /// Current severity-bucketed metrics for a project.
    async fn project_metrics(&self, project: Uuid) -> Result<ProjectMetrics>;

    /// BOM upload history for a project, most recent first.
    async fn bom_history(&self, project: Uuid) -> Result<Vec<BomUpload>>;
}

/// REST client for a Dependency-Track-compatible API. Authentication is a
/// static API key in the `X-Api-Key` header.
pub struct DependencyGraphClient {
    http: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl DependencyGraphClient {
    pub fn new(config: &DependencyGraphConfig) -> Self {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(config.timeout)
            .build()
            .unwrap_or_default();
        Self {
            http,
            base_url: config.base_url.clone(),
            api_key: config.api_key.clone(),
        }
    }

    fn get(&self, url: String) -> reqwest::RequestBuilder {
        let mut request = self.http.get(url);
        if let Some(ref key) = self.api_key {
            request = request.header("X-Api-Key", key);
        }
        request
    }
}

#[async_trait]
impl DependencyGraph for DependencyGraphClient {
    async fn lookup_project(&self, name: &str, version: Option<&str>) -> Result<Option<Project>> {
        let mut url = format!("{}/api/v1/project/lookup?name={}", self.base_url, name);
        if let Some(version) = version {
            url.push_str(&format!("&version={}", version));
        }

        debug!("Dependency graph project lookup: {} {:?}", name, version);
        let response = self
            .get(url)
            .send()
            .await
            .map_err(|e| ScanSageError::DependencyGraph(e.to_string()))?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(ScanSageError::DependencyGraph(format!(
                "project lookup returned {}",
                response.status()
            )));
        }

        let project: Project = response
            .json()
            .await
            .map_err(|e| ScanSageError::DependencyGraph(e.to_string()))?;
        Ok(Some(project))
    }

    async fn project_metrics(&self, project: Uuid) -> Result<ProjectMetrics> {
        let url = format!(
            "{}/api/v1/metrics/project/{}/current",
            self.base_url, project
        );
        let response = self
            .get(url)
            .send()
            .await
            .map_err(|e| ScanSageError::DependencyGraph(e.to_string()))?;

        if !response.status().is_success() {
            return Err(ScanSageError::DependencyGraph(format!(
                "metrics returned {}",
                response.status()
            )));
        }

        response
            .json()
            .await
            .map_err(|e| ScanSageError::DependencyGraph(e.to_string()))
    }

    async fn bom_history(&self, project: Uuid) -> Result<Vec<BomUpload>> {
        let url = format!("{}/api/v1/bom?project={}", self.base_url, project);
        let response = self
            .get(url)
            .send()
            .await
            .map_err(|e| ScanSageError::DependencyGraph(e.to_string()))?;

        if !response.status().is_success() {
            warn!("BOM history returned {}", response.status());
            return Err(ScanSageError::DependencyGraph(format!(
                "bom history returned {}",
                response.status()
            )));
        }

        response
            .json()
            .await
            .map_err(|e| ScanSageError::DependencyGraph(e.to_string()))
    }
}

/// Render a metrics summary for inclusion in an answer.
pub fn summarize_metrics(project: &Project, metrics: &ProjectMetrics) -> String {
    format!(
        "Project {} (version {}): {} components, {} vulnerabilities \
         ({} critical, {} high, {} medium, {} low, {} unassigned). \
         Inherited risk score: {:.1}",
        project.name,
        project.version.as_deref().unwrap_or("unversioned"),
        metrics.components,
        metrics.vulnerabilities,
        metrics.critical,
        metrics.high,
        metrics.medium,
        metrics.low,
        metrics.unassigned,
        metrics.inherited_risk_score
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metrics_summary_includes_severity_buckets() {
        let project = Project {
            uuid: Uuid::nil(),
            name: "billing-api".to_string(),
            version: Some("2.3.0".to_string()),
            description: None,
            last_bom_import: None,
        };
        let metrics = ProjectMetrics {
            critical: 1,
            high: 4,
            medium: 9,
            low: 2,
            unassigned: 0,
            vulnerabilities: 16,
            components: 120,
            suppressed: 0,
            inherited_risk_score: 37.5,
        };
        let summary = summarize_metrics(&project, &metrics);
        assert!(summary.contains("billing-api"));
        assert!(summary.contains("1 critical"));
        assert!(summary.contains("120 components"));
        assert!(summary.contains("37.5"));
    }

    #[test]
    fn metrics_decode_defaults_missing_fields() {
        let metrics: ProjectMetrics =
            serde_json::from_str(r#"{"critical": 2, "vulnerabilities": 5}"#).unwrap();
        assert_eq!(metrics.critical, 2);
        assert_eq!(metrics.vulnerabilities, 5);
        assert_eq!(metrics.high, 0);
        assert_eq!(metrics.components, 0);
    }
}
