//! Advisory executors: run each function against the provider, persist the
//! artifact, record the lineage step. Nothing here can fail the request
//! that triggered it; every failure degrades to a placeholder artifact.

use std::sync::Arc;

use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use tracing::{info, warn};

use crate::concentration::ConcentrationDoc;
use crate::config::Settings;
use crate::llm::client::{strip_fences, LlmCallError, LlmClient};
use crate::llm::prompts;
use crate::registry::DatasetRegistry;
use crate::schema::SchemaDoc;

pub const ADVISORY_FUNCTIONS: [&str; 5] = [
    "narrative_insights",
    "risk_flags",
    "data_quality_report",
    "threshold_recommendations",
    "schema_description",
];

pub struct AdvisoryEngine {
    settings: Arc<Settings>,
    registry: Arc<DatasetRegistry>,
    client: Option<LlmClient>,
}

enum Outcome {
    Ok { response: Value, latency_ms: u64 },
    Disabled,
    Limit,
    Error { reason: &'static str, message: String },
}

impl AdvisoryEngine {
    pub fn new(settings: Arc<Settings>, registry: Arc<DatasetRegistry>) -> Self {
        let client = LlmClient::from_settings(&settings);
        Self {
            settings,
            registry,
            client,
        }
    }

    /// Run every advisory function for a finished analysis. Each function
    /// writes its own artifact and lineage step; none of them can error out
    /// of this call.
    pub async fn enrich(&self, dataset_id: &str, doc: &ConcentrationDoc, schema: &SchemaDoc) {
        for function in ADVISORY_FUNCTIONS {
            let prompt = match function {
                "narrative_insights" => prompts::narrative_insights(doc),
                "risk_flags" => prompts::risk_flags(doc),
                "data_quality_report" => prompts::data_quality_report(schema),
                "threshold_recommendations" => prompts::threshold_recommendations(doc),
                "schema_description" => prompts::schema_description(schema),
                _ => continue,
            };
            self.run_function(dataset_id, function, &prompt).await;
        }
    }

    async fn run_function(&self, dataset_id: &str, function: &str, prompt: &str) {
        let outcome = self.execute(dataset_id, prompt).await;

        let (status, reason) = match &outcome {
            Outcome::Ok { .. } => ("ok", "ok"),
            Outcome::Disabled => ("disabled", "disabled"),
            Outcome::Limit => ("limit", "usage_limit"),
            Outcome::Error { reason, .. } => ("error", *reason),
        };

        let mut artifact = json!({
            "function": function,
            "dataset_id": dataset_id,
            "generated_at": chrono::Utc::now().to_rfc3339(),
            "provider": self.client.as_ref().map(|c| c.provider().as_str()),
            "model": self.client.as_ref().map(|c| c.model().to_string()),
            "context_hash": context_hash(prompt),
            "status": status,
        });
        match &outcome {
            Outcome::Ok {
                response,
                latency_ms,
            } => {
                artifact["response"] = response.clone();
                artifact["latency_ms"] = json!(latency_ms);
            }
            Outcome::Error { message, .. } => {
                artifact["error"] = json!(message);
            }
            _ => {}
        }

        let saved = self
            .registry
            .save_llm_artifact(dataset_id, function, &artifact)
            .await;
        let artifact_path = match saved {
            Ok(path) => path.to_string_lossy().to_string(),
            Err(err) => {
                warn!(dataset_id, function, error = %err, "failed to persist advisory artifact");
                return;
            }
        };

        let step = self
            .registry
            .record_step(
                dataset_id,
                &format!("llm_{}", function),
                Some(json!({ "function": function, "reason": reason })),
                Some(json!({ "artifact": artifact_path, "status": status })),
                Vec::new(),
            )
            .await;
        if let Err(err) = step {
            warn!(dataset_id, function, error = %err, "failed to record advisory lineage step");
        }

        info!(dataset_id, function, status, "advisory function finished");
    }

    async fn execute(&self, dataset_id: &str, prompt: &str) -> Outcome {
        let client = match &self.client {
            Some(client) => client,
            None => return Outcome::Disabled,
        };

        match self.registry.llm_call_count(dataset_id) {
            Ok(count) if count >= self.settings.llm_call_budget => return Outcome::Limit,
            Ok(_) => {}
            Err(err) => {
                return Outcome::Error {
                    reason: "api_error",
                    message: err.to_string(),
                }
            }
        }

        let started = std::time::Instant::now();
        match client.complete(prompt).await {
            Ok(raw) => match serde_json::from_str::<Value>(strip_fences(&raw)) {
                Ok(response) => Outcome::Ok {
                    response,
                    latency_ms: started.elapsed().as_millis() as u64,
                },
                Err(err) => Outcome::Error {
                    reason: "validation_error",
                    message: format!("Provider returned non-JSON output: {}", err),
                },
            },
            Err(LlmCallError::Timeout) => Outcome::Error {
                reason: "timeout",
                message: "Provider call timed out".to_string(),
            },
            Err(LlmCallError::Api(message)) => Outcome::Error {
                reason: "api_error",
                message,
            },
        }
    }
}

/// Structured placeholder for a function with no stored artifact.
pub fn placeholder(function: &str, status: &str, message: &str) -> Value {
    json!({
        "function": function,
        "status": status,
        "message": message,
    })
}

fn context_hash(prompt: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(prompt.as_bytes());
    format!("{:x}", hasher.finalize())[..16].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::concentration::{AnalysisParams, ConcentrationAnalyzer};
    use crate::normalize::DataNormalizer;
    use polars::prelude::*;

    fn fixture() -> (tempfile::TempDir, Arc<Settings>, Arc<DatasetRegistry>) {
        let dir = tempfile::tempdir().unwrap();
        let settings = Arc::new(Settings {
            datasets_path: dir.path().to_path_buf(),
            use_llm: true,
            openai_api_key: Some("dummy-api-key".to_string()),
            ..Settings::default()
        });
        let registry = Arc::new(DatasetRegistry::new(settings.clone()));
        (dir, settings, registry)
    }

    fn sample_doc(dataset_id: &str) -> (ConcentrationDoc, SchemaDoc) {
        let raw = df![
            "entity" => ["ACME", "BETA"],
            "revenue" => ["100", "50"]
        ]
        .unwrap();
        let normalized = DataNormalizer::new().normalize(&raw, dataset_id).unwrap();
        let analyzer = ConcentrationAnalyzer::new(10_000);
        let doc = analyzer
            .analyze(
                &normalized.table,
                &normalized.schema,
                &AnalysisParams {
                    group_by: "entity".to_string(),
                    value: "revenue".to_string(),
                    time_column: None,
                    thresholds: vec![10, 50],
                },
            )
            .unwrap();
        (doc, normalized.schema)
    }

    #[tokio::test]
    async fn mock_client_produces_ok_artifacts_and_lineage() {
        let (_dir, settings, registry) = fixture();
        let dataset_id = registry.create_dataset("input.csv").unwrap();
        let (doc, schema) = sample_doc(&dataset_id);

        let engine = AdvisoryEngine::new(settings, registry.clone());
        engine.enrich(&dataset_id, &doc, &schema).await;

        let artifacts = registry.llm_artifacts(&dataset_id).unwrap();
        assert_eq!(artifacts.len(), ADVISORY_FUNCTIONS.len());

        let lineage = registry.get_lineage(&dataset_id).unwrap();
        let llm_steps: Vec<_> = lineage
            .steps
            .iter()
            .filter(|s| s.operation.starts_with("llm_"))
            .collect();
        assert_eq!(llm_steps.len(), ADVISORY_FUNCTIONS.len());
    }

    #[tokio::test]
    async fn disabled_layer_writes_placeholder_artifacts() {
        let dir = tempfile::tempdir().unwrap();
        let settings = Arc::new(Settings {
            datasets_path: dir.path().to_path_buf(),
            use_llm: false,
            ..Settings::default()
        });
        let registry = Arc::new(DatasetRegistry::new(settings.clone()));
        let dataset_id = registry.create_dataset("input.csv").unwrap();
        let (doc, schema) = sample_doc(&dataset_id);

        let engine = AdvisoryEngine::new(settings, registry.clone());
        engine.enrich(&dataset_id, &doc, &schema).await;

        let artifacts = registry.llm_artifacts(&dataset_id).unwrap();
        assert_eq!(artifacts.len(), ADVISORY_FUNCTIONS.len());
        let content = std::fs::read_to_string(&artifacts[0].path).unwrap();
        let value: Value = serde_json::from_str(&content).unwrap();
        assert_eq!(value["status"], "disabled");
    }

    #[tokio::test]
    async fn budget_exhaustion_yields_limit_status() {
        let (_dir, settings, registry) = fixture();
        let settings = Arc::new(Settings {
            llm_call_budget: 0,
            ..(*settings).clone()
        });
        let dataset_id = registry.create_dataset("input.csv").unwrap();
        let (doc, schema) = sample_doc(&dataset_id);

        let engine = AdvisoryEngine::new(settings, registry.clone());
        engine.enrich(&dataset_id, &doc, &schema).await;

        let artifacts = registry.llm_artifacts(&dataset_id).unwrap();
        let content = std::fs::read_to_string(&artifacts[0].path).unwrap();
        let value: Value = serde_json::from_str(&content).unwrap();
        assert_eq!(value["status"], "limit");
    }
}
