//! Dataset registry - directory layout, schema and lineage lifecycle.
//!
//! Each dataset owns one directory under the configured root:
//!
//! ```text
//! <root>/<dataset_id>/
//!   raw/<original-filename>
//!   normalized.parquet
//!   schema.json
//!   lineage.json
//!   analyses/concentration.{json,csv,xlsx}
//!   llm/<function>_<unix-seconds>.json
//! ```
//!
//! All writes to a dataset are serialized by a per-dataset async mutex and
//! land through temp-and-rename, so readers always see a consistent snapshot
//! and lineage stays append-only.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;
use uuid::Uuid;

use crate::config::Settings;
use crate::error::{EngineError, Result};
use crate::schema::SchemaDoc;

lazy_static! {
    static ref DATASET_ID_RE: Regex = Regex::new(r"^ds_[0-9a-f]{12}$").unwrap();
}

const ID_ALLOCATION_ATTEMPTS: usize = 8;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LineageStep {
    pub id: String,
    pub operation: String,
    /// RFC-3339; non-decreasing within a dataset.
    pub timestamp: String,
    #[serde(default)]
    pub parameters: Value,
    #[serde(default)]
    pub outputs: Value,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LineageDoc {
    pub dataset_id: String,
    pub created_at: String,
    pub original_filename: String,
    pub steps: Vec<LineageStep>,
}

/// Newest advisory artifact for one function.
#[derive(Debug, Clone)]
pub struct LlmArtifactRef {
    pub function: String,
    pub unix_seconds: i64,
    pub path: PathBuf,
}

pub struct DatasetRegistry {
    settings: Arc<Settings>,
    /// Per-dataset write locks; entries are created on first touch.
    locks: std::sync::Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl DatasetRegistry {
    pub fn new(settings: Arc<Settings>) -> Self {
        Self {
            settings,
            locks: std::sync::Mutex::new(HashMap::new()),
        }
    }

    /// Reject any id that does not match `^ds_[0-9a-f]{12}$` before touching
    /// the filesystem.
    pub fn validate_id(dataset_id: &str) -> Result<()> {
        if DATASET_ID_RE.is_match(dataset_id) {
            Ok(())
        } else {
            Err(EngineError::Validation(format!(
                "Invalid dataset id '{}'",
                dataset_id
            )))
        }
    }

    /// Allocate a dataset id, create the directory layout and write the
    /// initial lineage document.
    pub fn create_dataset(&self, original_filename: &str) -> Result<String> {
        let mut dataset_id = None;
        for _ in 0..ID_ALLOCATION_ATTEMPTS {
            let candidate = format!("ds_{}", &Uuid::new_v4().simple().to_string()[..12]);
            if !self.settings.dataset_path(&candidate).exists() {
                dataset_id = Some(candidate);
                break;
            }
        }
        let dataset_id = dataset_id.ok_or_else(|| {
            EngineError::Conflict("Could not allocate a unique dataset id".to_string())
        })?;

        let root = self.settings.dataset_path(&dataset_id);
        std::fs::create_dir_all(root.join("raw"))?;
        std::fs::create_dir_all(root.join("analyses"))?;
        std::fs::create_dir_all(root.join("llm"))?;

        let created_at = now_rfc3339();
        let lineage = LineageDoc {
            dataset_id: dataset_id.clone(),
            created_at: created_at.clone(),
            original_filename: original_filename.to_string(),
            steps: vec![LineageStep {
                id: "st_0001".to_string(),
                operation: "create".to_string(),
                timestamp: created_at,
                parameters: serde_json::json!({ "filename": original_filename }),
                outputs: Value::Null,
                warnings: Vec::new(),
            }],
        };
        write_json_atomic(&self.settings.lineage_path(&dataset_id), &lineage)?;

        info!(dataset_id = %dataset_id, filename = %original_filename, "dataset created");
        Ok(dataset_id)
    }

    /// Resolve the path for a raw upload, confined to the dataset directory.
    ///
    /// Only the final path component of `filename` is used, and the resolved
    /// parent must canonicalize to a descendant of the dataset directory.
    pub fn raw_path(&self, dataset_id: &str, filename: &str) -> Result<PathBuf> {
        Self::validate_id(dataset_id)?;

        // `file_name` yields the final component only and is `None` for
        // paths ending in `..`, which drops traversal attempts outright.
        let name = Path::new(filename)
            .file_name()
            .filter(|n| !n.is_empty())
            .ok_or_else(|| {
                EngineError::Validation(format!("Invalid upload filename '{}'", filename))
            })?;

        let dataset_dir = self.settings.dataset_path(dataset_id);
        let raw_dir = dataset_dir.join("raw");
        std::fs::create_dir_all(&raw_dir)?;

        let canonical_dataset = dataset_dir.canonicalize()?;
        let canonical_raw = raw_dir.canonicalize()?;
        if !canonical_raw.starts_with(&canonical_dataset) {
            return Err(EngineError::Validation(
                "Resolved path escapes the dataset directory".to_string(),
            ));
        }

        Ok(canonical_raw.join(name))
    }

    /// Append a lineage step under the per-dataset lock.
    pub async fn record_step(
        &self,
        dataset_id: &str,
        operation: &str,
        parameters: Option<Value>,
        outputs: Option<Value>,
        warnings: Vec<String>,
    ) -> Result<String> {
        Self::validate_id(dataset_id)?;
        let lock = self.lock_for(dataset_id);
        let _guard = lock.lock().await;

        let path = self.settings.lineage_path(dataset_id);
        let mut lineage: LineageDoc = read_json(&path).map_err(|_| {
            EngineError::NotFound(format!("Dataset {} not found", dataset_id))
        })?;

        // Clock skew must not break the non-decreasing timestamp invariant.
        let mut timestamp = now_rfc3339();
        if let Some(last) = lineage.steps.last() {
            if timestamp < last.timestamp {
                timestamp = last.timestamp.clone();
            }
        }

        let step_id = format!("st_{:04}", lineage.steps.len() + 1);
        lineage.steps.push(LineageStep {
            id: step_id.clone(),
            operation: operation.to_string(),
            timestamp,
            parameters: parameters.unwrap_or(Value::Null),
            outputs: outputs.unwrap_or(Value::Null),
            warnings,
        });
        write_json_atomic(&path, &lineage)?;
        Ok(step_id)
    }

    pub fn save_schema(&self, dataset_id: &str, schema: &SchemaDoc) -> Result<()> {
        Self::validate_id(dataset_id)?;
        write_json_atomic(&self.settings.schema_path(dataset_id), schema)
    }

    pub fn get_schema(&self, dataset_id: &str) -> Result<SchemaDoc> {
        Self::validate_id(dataset_id)?;
        let path = self.settings.schema_path(dataset_id);
        if !path.exists() {
            return Err(EngineError::NotFound(format!(
                "Dataset {} not found",
                dataset_id
            )));
        }
        read_json(&path)
    }

    pub fn get_lineage(&self, dataset_id: &str) -> Result<LineageDoc> {
        Self::validate_id(dataset_id)?;
        let path = self.settings.lineage_path(dataset_id);
        if !path.exists() {
            return Err(EngineError::NotFound(format!(
                "Dataset {} not found",
                dataset_id
            )));
        }
        read_json(&path)
    }

    /// Persist an analysis document under `analyses/<name>.json`.
    pub async fn save_analysis<T: Serialize>(
        &self,
        dataset_id: &str,
        name: &str,
        payload: &T,
    ) -> Result<PathBuf> {
        Self::validate_id(dataset_id)?;
        let lock = self.lock_for(dataset_id);
        let _guard = lock.lock().await;

        let dir = self.settings.analyses_path(dataset_id);
        std::fs::create_dir_all(&dir)?;
        let path = dir.join(format!("{}.json", name));
        write_json_atomic(&path, payload)?;
        Ok(path)
    }

    /// Persist an advisory artifact as `llm/<function>_<unix-seconds>.json`.
    pub async fn save_llm_artifact<T: Serialize>(
        &self,
        dataset_id: &str,
        function: &str,
        payload: &T,
    ) -> Result<PathBuf> {
        Self::validate_id(dataset_id)?;
        let lock = self.lock_for(dataset_id);
        let _guard = lock.lock().await;

        let dir = self.settings.llm_path(dataset_id);
        std::fs::create_dir_all(&dir)?;
        let path = dir.join(format!("{}_{}.json", function, chrono::Utc::now().timestamp()));
        write_json_atomic(&path, payload)?;
        Ok(path)
    }

    /// Newest advisory artifact per function.
    pub fn llm_artifacts(&self, dataset_id: &str) -> Result<Vec<LlmArtifactRef>> {
        Self::validate_id(dataset_id)?;
        let dir = self.settings.llm_path(dataset_id);
        let mut newest: HashMap<String, LlmArtifactRef> = HashMap::new();

        if dir.exists() {
            for entry in std::fs::read_dir(&dir)? {
                let entry = entry?;
                let file_name = entry.file_name().to_string_lossy().to_string();
                if let Some((function, ts)) = parse_artifact_name(&file_name) {
                    let replace = newest
                        .get(&function)
                        .map(|cur| ts > cur.unix_seconds)
                        .unwrap_or(true);
                    if replace {
                        newest.insert(
                            function.clone(),
                            LlmArtifactRef {
                                function,
                                unix_seconds: ts,
                                path: entry.path(),
                            },
                        );
                    }
                }
            }
        }

        let mut refs: Vec<LlmArtifactRef> = newest.into_values().collect();
        refs.sort_by(|a, b| a.function.cmp(&b.function));
        Ok(refs)
    }

    /// Total advisory artifacts for a dataset; the call budget counts these
    /// so it survives restarts.
    pub fn llm_call_count(&self, dataset_id: &str) -> Result<usize> {
        Self::validate_id(dataset_id)?;
        let dir = self.settings.llm_path(dataset_id);
        if !dir.exists() {
            return Ok(0);
        }
        Ok(std::fs::read_dir(&dir)?.count())
    }

    pub fn dataset_exists(&self, dataset_id: &str) -> bool {
        Self::validate_id(dataset_id).is_ok() && self.settings.dataset_path(dataset_id).exists()
    }

    fn lock_for(&self, dataset_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().expect("lock map poisoned");
        locks
            .entry(dataset_id.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }
}

fn parse_artifact_name(file_name: &str) -> Option<(String, i64)> {
    let stem = file_name.strip_suffix(".json")?;
    let (function, ts) = stem.rsplit_once('_')?;
    Some((function.to_string(), ts.parse().ok()?))
}

fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Micros, true)
}

fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T> {
    let content = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&content)?)
}

fn write_json_atomic<T: Serialize>(path: &Path, payload: &T) -> Result<()> {
    let content = serde_json::to_string_pretty(payload)?;
    let mut tmp_name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "artifact.json".to_string());
    tmp_name.push_str(".tmp");
    let tmp = path.with_file_name(tmp_name);
    std::fs::write(&tmp, content)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}
