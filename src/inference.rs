//! Inference service client (text generation + embeddings).
//!
//! The client wraps an Ollama-style HTTP API. It deliberately never returns
//! an error from `generate`: transport failures come back as a sentinel
//! string the caller detects with [`is_failure_sentinel`]. Embedding
//! failures degrade to an empty vector so retrieval can fall back to
//! pattern-based strategies.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::InferenceConfig;

/// Seam for the remote text-generation and embedding endpoint.
#[async_trait]
pub trait Inference: Send + Sync {
    /// Generate a completion. Never fails; on transport failure the returned
    /// string is a failure sentinel (see [`is_failure_sentinel`]).
    async fn generate(&self, prompt: &str) -> String;

    /// Generate an embedding vector. Empty on failure.
    async fn embed(&self, text: &str) -> Vec<f32>;
}

/// Returns true when a generated response is a failure sentinel rather than
/// a usable answer.
pub fn is_failure_sentinel(text: &str) -> bool {
    let lower = text.to_lowercase();
    lower.is_empty()
        || lower.contains("unavailable")
        || lower.contains("error:")
        || lower.contains("inference service")
}

#[derive(Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    stream: bool,
}

#[derive(Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    response: String,
}

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    prompt: &'a str,
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    #[serde(default)]
    embedding: Vec<f32>,
}

/// HTTP client for an Ollama-compatible inference server.
pub struct OllamaClient {
    http: reqwest::Client,
    base_url: String,
    model: String,
}

impl OllamaClient {
    pub fn new(config: &InferenceConfig) -> Self {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(config.timeout)
            .build()
            .unwrap_or_default();
        Self {
            http,
            base_url: config.base_url.clone(),
            model: config.model.clone(),
        }
    }

    fn unavailable_message(&self, endpoint: &str, err: &str) -> String {
        format!(
            "The inference service is currently unavailable. \
             Attempted endpoint: {}{}. Error: {}",
            self.base_url, endpoint, err
        )
    }
}

#[async_trait]
impl Inference for OllamaClient {
    async fn generate(&self, prompt: &str) -> String {
        let request = GenerateRequest {
            model: &self.model,
            prompt,
            stream: false,
        };

        debug!("Calling inference generate endpoint, model: {}", self.model);
        let result = self
            .http
            .post(format!("{}/api/generate", self.base_url))
            .json(&request)
            .send()
            .await;

        match result {
            Ok(response) => {
                let status = response.status();
                if !status.is_success() {
                    warn!("Inference generate returned status {}", status);
                    return self.unavailable_message("/api/generate", status.as_str());
                }
                match response.json::<GenerateResponse>().await {
                    Ok(body) => body.response,
                    Err(e) => {
                        warn!("Failed to decode inference response: {}", e);
                        self.unavailable_message("/api/generate", &e.to_string())
                    }
                }
            }
            Err(e) => {
                warn!("Inference generate call failed: {}", e);
                self.unavailable_message("/api/generate", &e.to_string())
            }
        }
    }

    async fn embed(&self, text: &str) -> Vec<f32> {
        let request = EmbeddingRequest {
            model: &self.model,
            prompt: text,
        };

        debug!("Calling inference embedding endpoint, model: {}", self.model);
        let result = self
            .http
            .post(format!("{}/api/embeddings", self.base_url))
            .json(&request)
            .send()
            .await;

        match result {
            Ok(response) if response.status().is_success() => {
                match response.json::<EmbeddingResponse>().await {
                    Ok(body) => body.embedding,
                    Err(e) => {
                        warn!("Failed to decode embedding response: {}", e);
                        Vec::new()
                    }
                }
            }
            Ok(response) => {
                warn!("Embedding endpoint returned status {}", response.status());
                Vec::new()
            }
            Err(e) => {
                warn!("Embedding call failed: {}", e);
                Vec::new()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sentinel_detection() {
        assert!(is_failure_sentinel(""));
        assert!(is_failure_sentinel(
            "The inference service is currently unavailable. Error: connect refused"
        ));
        assert!(is_failure_sentinel("Error: timed out"));
        assert!(!is_failure_sentinel("The scan took 42 seconds because of retries."));
    }
}
