//! Pipeline controller: ingest -> normalize -> analyze -> export.
//!
//! Sequences the core components, records lineage around every stage,
//! enforces upload limits, and dispatches the advisory task only after the
//! analysis artifact is durably written. Export failures downgrade to
//! result warnings; advisory failures never surface at all.

use std::path::PathBuf;
use std::sync::Arc;

use serde_json::json;
use tracing::{info, warn};

use crate::concentration::{AnalysisParams, ConcentrationAnalyzer, ConcentrationDoc, ExportLinks};
use crate::config::Settings;
use crate::error::{EngineError, Result};
use crate::export::Exporter;
use crate::llm::insights::placeholder;
use crate::llm::{AdvisoryEngine, ADVISORY_FUNCTIONS};
use crate::models::{ConcentrationRequest, InsightsResponse, UploadResponse};
use crate::normalize::DataNormalizer;
use crate::registry::{DatasetRegistry, LineageDoc};
use crate::schema::SchemaDoc;
use crate::storage;

const CSV_EXPORT_LINK: &str = "analyses/concentration.csv";
const XLSX_EXPORT_LINK: &str = "analyses/concentration.xlsx";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportKind {
    Csv,
    Xlsx,
}

pub struct Pipeline {
    settings: Arc<Settings>,
    registry: Arc<DatasetRegistry>,
    normalizer: DataNormalizer,
    analyzer: ConcentrationAnalyzer,
}

impl Pipeline {
    pub fn new(settings: Arc<Settings>) -> Self {
        let registry = Arc::new(DatasetRegistry::new(settings.clone()));
        let analyzer = ConcentrationAnalyzer::new(settings.large_dataset_threshold);
        Self {
            settings,
            registry,
            normalizer: DataNormalizer::new(),
            analyzer,
        }
    }

    pub fn registry(&self) -> Arc<DatasetRegistry> {
        self.registry.clone()
    }

    /// Enforce the optional X-API-Key contract for the outer layer.
    pub fn authorize(&self, provided: Option<&str>) -> Result<()> {
        match &self.settings.api_key {
            Some(expected) if provided != Some(expected.as_str()) => {
                Err(EngineError::Unauthorized)
            }
            _ => Ok(()),
        }
    }

    /// Ingest an upload: validate, persist raw bytes, normalize, write the
    /// columnar table and schema, and record every step in lineage.
    pub async fn ingest(
        &self,
        filename: &str,
        bytes: &[u8],
        sheet: Option<&str>,
    ) -> Result<UploadResponse> {
        let extension = file_extension(filename);
        if !self.settings.allowed_extensions.contains(&extension) {
            return Err(EngineError::Validation(format!(
                "Unsupported file extension '{}'",
                extension
            )));
        }
        if bytes.len() as u64 > self.settings.max_file_size_bytes() {
            return Err(EngineError::PayloadTooLarge(format!(
                "File exceeds the {} MiB upload limit",
                self.settings.max_file_size_mb
            )));
        }

        let dataset_id = self.registry.create_dataset(filename)?;
        let raw_path = self.registry.raw_path(&dataset_id, filename)?;
        let digest = storage::save_upload(bytes, &raw_path)?;
        let raw_name = raw_path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();

        self.registry
            .record_step(
                &dataset_id,
                "ingest",
                Some(json!({
                    "filename": filename,
                    "size_bytes": bytes.len(),
                    "sha256": digest,
                })),
                Some(json!({ "raw": format!("raw/{}", raw_name) })),
                Vec::new(),
            )
            .await?;

        let raw_table = if extension == ".csv" {
            storage::read_delimited(&raw_path, None)?
        } else {
            storage::read_spreadsheet(&raw_path, sheet, None)?
        };

        let mut normalized = self.normalizer.normalize(&raw_table, &dataset_id)?;
        storage::write_columnar(
            &mut normalized.table,
            &self.settings.normalized_path(&dataset_id),
        )?;
        self.registry.save_schema(&dataset_id, &normalized.schema)?;

        self.registry
            .record_step(
                &dataset_id,
                "normalize",
                Some(json!({ "sheet": sheet })),
                Some(json!({
                    "normalized": "normalized.parquet",
                    "schema": "schema.json",
                    "rows": normalized.table.height(),
                    "columns": normalized.table.width(),
                    "period_grain": normalized.schema.period_grain,
                })),
                normalized.warnings.clone(),
            )
            .await?;

        info!(
            dataset_id = %dataset_id,
            rows = normalized.table.height(),
            columns = normalized.table.width(),
            "ingest complete"
        );

        Ok(UploadResponse {
            dataset_id,
            status: "completed".to_string(),
            message: Some("File ingested and normalized".to_string()),
            rows_processed: normalized.table.height(),
            columns_processed: raw_table.width(),
        })
    }

    /// Run concentration analysis, persist the result document and exports,
    /// then trigger advisory enrichment in the background.
    pub async fn analyze(
        &self,
        dataset_id: &str,
        request: &ConcentrationRequest,
    ) -> Result<ConcentrationDoc> {
        DatasetRegistry::validate_id(dataset_id)?;
        let schema = self.registry.get_schema(dataset_id)?;
        let table = storage::read_columnar(&self.settings.normalized_path(dataset_id))?;

        let params = AnalysisParams {
            group_by: request.group_by.clone(),
            value: request.value.clone(),
            time_column: request.time_column.clone(),
            thresholds: request
                .thresholds
                .clone()
                .unwrap_or_else(|| self.settings.default_thresholds.clone()),
        };

        let mut doc = self.analyzer.analyze(&table, &schema, &params)?;

        let analyses_dir = self.settings.analyses_path(dataset_id);
        std::fs::create_dir_all(&analyses_dir)?;
        let csv_path = analyses_dir.join("concentration.csv");
        let xlsx_path = analyses_dir.join("concentration.xlsx");

        let export_result = Exporter::export_csv(&doc, &csv_path)
            .and_then(|_| Exporter::export_workbook(&doc, &xlsx_path));
        match export_result {
            Ok(()) => {
                doc.export_links = Some(ExportLinks {
                    csv: CSV_EXPORT_LINK.to_string(),
                    xlsx: XLSX_EXPORT_LINK.to_string(),
                });
            }
            Err(err) => {
                warn!(dataset_id, error = %err, "export failed; analysis continues");
                doc.warnings.push(format!("Export failed: {}", err));
                doc.export_links = None;
            }
        }

        self.registry
            .save_analysis(dataset_id, "concentration", &doc)
            .await?;
        self.registry
            .record_step(
                dataset_id,
                "analyze_concentration",
                Some(json!({
                    "group_by": doc.group_by,
                    "value": doc.value_column,
                    "time_column": doc.time_column,
                    "thresholds": doc.thresholds,
                })),
                Some(json!({
                    "analysis": "analyses/concentration.json",
                    "export_links": doc.export_links,
                })),
                doc.warnings.clone(),
            )
            .await?;

        // The advisory task starts only after the analysis artifact is
        // durably written; its completion is never awaited here.
        if request.run_llm {
            let engine = AdvisoryEngine::new(self.settings.clone(), self.registry.clone());
            let task_doc = doc.clone();
            let task_schema = schema.clone();
            let task_dataset = dataset_id.to_string();
            tokio::spawn(async move {
                engine.enrich(&task_dataset, &task_doc, &task_schema).await;
            });
        }

        info!(
            dataset_id,
            periods = doc.by_period.len(),
            "analysis complete"
        );
        Ok(doc)
    }

    pub fn schema(&self, dataset_id: &str) -> Result<SchemaDoc> {
        self.registry.get_schema(dataset_id)
    }

    pub fn lineage(&self, dataset_id: &str) -> Result<LineageDoc> {
        self.registry.get_lineage(dataset_id)
    }

    /// Path of a download artifact; `NotFound` until an analysis produced it.
    pub fn export_path(&self, dataset_id: &str, kind: ExportKind) -> Result<PathBuf> {
        DatasetRegistry::validate_id(dataset_id)?;
        let name = match kind {
            ExportKind::Csv => "concentration.csv",
            ExportKind::Xlsx => "concentration.xlsx",
        };
        let path = self.settings.analyses_path(dataset_id).join(name);
        if !path.exists() {
            return Err(EngineError::NotFound(format!(
                "Export {} not found for dataset {}",
                name, dataset_id
            )));
        }
        Ok(path)
    }

    /// Union of the newest advisory artifacts; absent functions yield
    /// structured placeholders.
    pub fn insights(&self, dataset_id: &str) -> Result<InsightsResponse> {
        DatasetRegistry::validate_id(dataset_id)?;
        if !self.registry.dataset_exists(dataset_id) {
            return Err(EngineError::NotFound(format!(
                "Dataset {} not found",
                dataset_id
            )));
        }

        let stored = self.registry.llm_artifacts(dataset_id)?;
        let call_count = self.registry.llm_call_count(dataset_id)?;

        let mut functions = std::collections::BTreeMap::new();
        for function in ADVISORY_FUNCTIONS {
            let artifact = stored.iter().find(|a| a.function == function).and_then(|a| {
                std::fs::read_to_string(&a.path)
                    .ok()
                    .and_then(|content| serde_json::from_str(&content).ok())
            });
            let value = match artifact {
                Some(value) => value,
                None if !self.settings.use_llm => placeholder(
                    function,
                    "disabled",
                    "Advisory layer is disabled",
                ),
                None if call_count >= self.settings.llm_call_budget => placeholder(
                    function,
                    "limit",
                    "Advisory call budget exhausted for this dataset",
                ),
                None => placeholder(function, "error", "No advisory artifact available"),
            };
            functions.insert(function.to_string(), value);
        }

        Ok(InsightsResponse {
            dataset_id: dataset_id.to_string(),
            functions,
        })
    }
}

fn file_extension(filename: &str) -> String {
    filename
        .rsplit_once('.')
        .map(|(_, ext)| format!(".{}", ext.to_lowercase()))
        .unwrap_or_default()
}
