//! Configuration for external collaborators.
//!
//! Everything is env-backed with defaults that match a local dev setup
//! (Ollama on 11434, workflow service on 7233, Dependency-Track on 8080).
//! The binary loads `.env` via dotenv before calling `from_env`.

use std::time::Duration;

/// Inference (text generation + embeddings) endpoint configuration.
#[derive(Debug, Clone)]
pub struct InferenceConfig {
    pub base_url: String,
    pub model: String,
    pub timeout: Duration,
}

impl InferenceConfig {
    pub fn from_env() -> Self {
        Self {
            base_url: trim_base_url(
                std::env::var("INFERENCE_BASE_URL")
                    .unwrap_or_else(|_| "http://localhost:11434".to_string()),
            ),
            model: std::env::var("INFERENCE_MODEL").unwrap_or_else(|_| "llama2".to_string()),
            timeout: timeout_from_env("INFERENCE_TIMEOUT_MS", 30_000),
        }
    }
}

/// Workflow-history service endpoint configuration.
#[derive(Debug, Clone)]
pub struct WorkflowConfig {
    pub base_url: String,
    pub namespace: String,
    pub timeout: Duration,
}

impl WorkflowConfig {
    pub fn from_env() -> Self {
        Self {
            base_url: trim_base_url(
                std::env::var("WORKFLOW_BASE_URL")
                    .unwrap_or_else(|_| "http://localhost:7233".to_string()),
            ),
            namespace: std::env::var("WORKFLOW_NAMESPACE").unwrap_or_else(|_| "default".to_string()),
            timeout: timeout_from_env("WORKFLOW_TIMEOUT_MS", 30_000),
        }
    }
}

/// Dependency graph (composition analysis) service configuration.
#[derive(Debug, Clone)]
pub struct DependencyGraphConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub timeout: Duration,
}

impl DependencyGraphConfig {
    pub fn from_env() -> Self {
        Self {
            base_url: trim_base_url(
                std::env::var("DEPGRAPH_BASE_URL")
                    .unwrap_or_else(|_| "http://localhost:8080".to_string()),
            ),
            api_key: std::env::var("DEPGRAPH_API_KEY").ok().filter(|k| !k.is_empty()),
            timeout: timeout_from_env("DEPGRAPH_TIMEOUT_MS", 30_000),
        }
    }
}

/// Top-level configuration bundle.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub inference: InferenceConfig,
    pub workflow: WorkflowConfig,
    pub depgraph: DependencyGraphConfig,
    pub database_path: String,
}

impl AppConfig {
    pub fn from_env() -> Self {
        Self {
            inference: InferenceConfig::from_env(),
            workflow: WorkflowConfig::from_env(),
            depgraph: DependencyGraphConfig::from_env(),
            database_path: std::env::var("SCANSAGE_DB").unwrap_or_else(|_| "scansage.db".to_string()),
        }
    }
}

fn trim_base_url(url: String) -> String {
    url.trim_end_matches('/').to_string()
}

fn timeout_from_env(key: &str, default_ms: u64) -> Duration {
    let ms = std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(default_ms);
    Duration::from_millis(ms)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trailing_slash_is_stripped() {
        assert_eq!(trim_base_url("http://x:11434/".to_string()), "http://x:11434");
        assert_eq!(trim_base_url("http://x:11434".to_string()), "http://x:11434");
    }
}
