//! Finding explanation generation with a per-finding cache.
//!
//! Explanations are expensive inference calls, so results are cached by
//! finding id for the life of the process. The cache is invalidated only on
//! explicit request (`clear`), never by time. The inference response is
//! expected to be JSON with fixed fields; a response that fails to parse is
//! preserved verbatim as an unparsed explanation rather than discarded.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{Result, ScanSageError};
use crate::inference::{is_failure_sentinel, Inference};
use crate::store::{EvidenceStore, Finding};

/// The structured fields an explanation response is expected to carry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExplanationFields {
    pub summary: String,
    #[serde(default)]
    pub impact: String,
    #[serde(default)]
    pub remediation: String,
    #[serde(default)]
    pub references: Vec<String>,
}

/// A generated explanation: parsed when the response was well-formed JSON,
/// otherwise the raw text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "format", rename_all = "snake_case")]
pub enum ExplanationOutput {
    Parsed(ExplanationFields),
    Unparsed { text: String },
}

impl ExplanationOutput {
    /// One-block rendering for inclusion in an answer.
    pub fn render(&self) -> String {
        match self {
            ExplanationOutput::Parsed(fields) => {
                let mut out = format!("Summary: {}", fields.summary);
                if !fields.impact.is_empty() {
                    out.push_str(&format!("\nImpact: {}", fields.impact));
                }
                if !fields.remediation.is_empty() {
                    out.push_str(&format!("\nRemediation: {}", fields.remediation));
                }
                if !fields.references.is_empty() {
                    out.push_str(&format!("\nReferences: {}", fields.references.join(", ")));
                }
                out
            }
            ExplanationOutput::Unparsed { text } => text.clone(),
        }
    }
}

const EXPLAIN_TEMPLATE: &str = "You are a security analyst assistant. Explain the following finding.
Finding: {title}
Weakness: {cwe_id}
Severity: {severity}
Description: {description}

Respond with a JSON object with keys \"summary\", \"impact\", \"remediation\", and \"references\" (an array of URLs). Respond with only the JSON object.";

/// Process-lifetime cache of generated explanations, keyed by finding id.
#[derive(Default)]
pub struct ExplanationCache {
    entries: Mutex<HashMap<Uuid, ExplanationOutput>>,
}

impl ExplanationCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, finding_id: Uuid) -> Option<ExplanationOutput> {
        self.entries
            .lock()
            .ok()
            .and_then(|entries| entries.get(&finding_id).cloned())
    }

    pub fn put(&self, finding_id: Uuid, output: ExplanationOutput) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.insert(finding_id, output);
        }
    }

    /// Drop every cached explanation. Used when the underlying findings or
    /// the inference model change.
    pub fn clear(&self) {
        if let Ok(mut entries) = self.entries.lock() {
            let dropped = entries.len();
            entries.clear();
            info!("Cleared {} cached explanations", dropped);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|entries| entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Parse an inference response into an [`ExplanationOutput`]. Tolerates code
/// fences around the JSON; anything else survives as unparsed text.
pub fn parse_explanation(response: &str) -> ExplanationOutput {
    let trimmed = response
        .trim()
        .trim_start_matches("```json")
        .trim_start_matches("```")
        .trim_end_matches("```")
        .trim();
    match serde_json::from_str::<ExplanationFields>(trimmed) {
        Ok(fields) => ExplanationOutput::Parsed(fields),
        Err(e) => {
            debug!("Explanation response was not structured JSON: {}", e);
            ExplanationOutput::Unparsed {
                text: response.trim().to_string(),
            }
        }
    }
}

/// Generates and caches per-finding explanations.
pub struct ExplanationService {
    store: Arc<EvidenceStore>,
    inference: Arc<dyn Inference>,
    cache: Arc<ExplanationCache>,
}

impl ExplanationService {
    pub fn new(
        store: Arc<EvidenceStore>,
        inference: Arc<dyn Inference>,
        cache: Arc<ExplanationCache>,
    ) -> Self {
        Self {
            store,
            inference,
            cache,
        }
    }

    /// Explain a finding by id. Cache hit short-circuits inference entirely.
    /// Unknown finding ids are a hard `NotFound`; inference failure degrades
    /// to a deterministic explanation built from stored fields.
    pub async fn explain(&self, finding_id: Uuid) -> Result<ExplanationOutput> {
        if let Some(cached) = self.cache.get(finding_id) {
            debug!("Explanation cache hit for finding {}", finding_id);
            return Ok(cached);
        }

        let finding = self
            .store
            .finding_by_id(finding_id)?
            .ok_or_else(|| ScanSageError::NotFound(format!("finding {}", finding_id)))?;

        let prompt = EXPLAIN_TEMPLATE
            .replace("{title}", &finding.title)
            .replace("{cwe_id}", &finding.cwe_id)
            .replace("{severity}", &finding.severity)
            .replace(
                "{description}",
                finding.description.as_deref().unwrap_or("(no description)"),
            );

        let response = self.inference.generate(&prompt).await;
        let output = if is_failure_sentinel(&response) {
            warn!("Inference unavailable, building explanation from stored fields");
            ExplanationOutput::Unparsed {
                text: fallback_explanation(&finding),
            }
        } else {
            parse_explanation(&response)
        };

        self.cache.put(finding_id, output.clone());
        Ok(output)
    }
}

fn fallback_explanation(finding: &Finding) -> String {
    format!(
        "{} ({}, severity {}): {}",
        finding.title,
        finding.cwe_id,
        finding.severity,
        finding.description.as_deref().unwrap_or("no description recorded")
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn well_formed_json_parses_into_fields() {
        let output = parse_explanation(
            r#"{"summary": "SQL injection via user input", "impact": "data exfiltration", "remediation": "use prepared statements", "references": ["https://cwe.mitre.org/data/definitions/89.html"]}"#,
        );
        match output {
            ExplanationOutput::Parsed(fields) => {
                assert_eq!(fields.summary, "SQL injection via user input");
                assert_eq!(fields.references.len(), 1);
            }
            ExplanationOutput::Unparsed { .. } => panic!("expected parsed output"),
        }
    }

    #[test]
    fn code_fences_are_stripped_before_parsing() {
        let output = parse_explanation("```json\n{\"summary\": \"x\"}\n```");
        assert!(matches!(output, ExplanationOutput::Parsed(_)));
    }

    #[test]
    fn free_text_survives_as_unparsed() {
        let output = parse_explanation("This finding indicates improper input validation.");
        match output {
            ExplanationOutput::Unparsed { text } => {
                assert!(text.contains("improper input validation"))
            }
            ExplanationOutput::Parsed(_) => panic!("expected unparsed output"),
        }
    }

    #[test]
    fn cache_is_explicitly_cleared() {
        let cache = ExplanationCache::new();
        let id = Uuid::new_v4();
        cache.put(
            id,
            ExplanationOutput::Unparsed {
                text: "x".to_string(),
            },
        );
        assert!(cache.get(id).is_some());
        assert_eq!(cache.len(), 1);

        cache.clear();
        assert!(cache.get(id).is_none());
        assert!(cache.is_empty());
    }
}
