//! Wire types shared with the outer HTTP layer: request/response bodies,
//! the error envelope and the kind-to-status mapping.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::error::{EngineError, Result};

pub const MAX_THRESHOLDS: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    ValidationError,
    NotFound,
    Conflict,
    RateLimited,
    PayloadTooLarge,
    InternalError,
    Unauthorized,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::ValidationError => "ValidationError",
            ErrorKind::NotFound => "NotFound",
            ErrorKind::Conflict => "Conflict",
            ErrorKind::RateLimited => "RateLimited",
            ErrorKind::PayloadTooLarge => "PayloadTooLarge",
            ErrorKind::InternalError => "InternalError",
            ErrorKind::Unauthorized => "Unauthorized",
        }
    }

    pub fn status_code(&self) -> u16 {
        match self {
            ErrorKind::ValidationError => 400,
            ErrorKind::NotFound => 404,
            ErrorKind::Conflict => 409,
            ErrorKind::RateLimited => 429,
            ErrorKind::PayloadTooLarge => 413,
            ErrorKind::InternalError => 500,
            ErrorKind::Unauthorized => 401,
        }
    }
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::Validation(_) => ErrorKind::ValidationError,
            EngineError::NotFound(_) => ErrorKind::NotFound,
            EngineError::Conflict(_) => ErrorKind::Conflict,
            EngineError::RateLimited { .. } => ErrorKind::RateLimited,
            EngineError::PayloadTooLarge(_) => ErrorKind::PayloadTooLarge,
            EngineError::Unauthorized => ErrorKind::Unauthorized,
            _ => ErrorKind::InternalError,
        }
    }
}

/// Standardized error envelope; the outer layer sets the status code from
/// the kind and echoes `Retry-After` when present.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorEnvelope {
    pub error: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
    pub request_id: String,
}

impl ErrorEnvelope {
    /// Build the envelope plus status code and optional Retry-After seconds.
    pub fn from_error(err: &EngineError, request_id: &str) -> (u16, Self, Option<u64>) {
        let kind = err.kind();
        let retry_after = match err {
            EngineError::RateLimited {
                retry_after_secs, ..
            } => Some(*retry_after_secs),
            _ => None,
        };
        let envelope = Self {
            error: kind.as_str().to_string(),
            message: err.to_string(),
            details: None,
            request_id: request_id.to_string(),
        };
        (kind.status_code(), envelope, retry_after)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadResponse {
    pub dataset_id: String,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub rows_processed: usize,
    pub columns_processed: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConcentrationRequest {
    pub group_by: String,
    pub value: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time_column: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thresholds: Option<Vec<i64>>,
    #[serde(default = "default_true")]
    pub run_llm: bool,
}

fn default_true() -> bool {
    true
}

/// Sort, deduplicate and bounds-check thresholds: integers in [1, 100],
/// at most ten entries after deduplication.
pub fn validate_thresholds(thresholds: &[i64]) -> Result<Vec<i64>> {
    if thresholds.is_empty() {
        return Err(EngineError::Validation(
            "Thresholds list cannot be empty".to_string(),
        ));
    }
    for &threshold in thresholds {
        if !(1..=100).contains(&threshold) {
            return Err(EngineError::Validation(
                "Thresholds must be between 1 and 100".to_string(),
            ));
        }
    }
    let mut sorted: Vec<i64> = thresholds.to_vec();
    sorted.sort_unstable();
    sorted.dedup();
    if sorted.len() > MAX_THRESHOLDS {
        return Err(EngineError::Validation(format!(
            "Maximum {} thresholds allowed",
            MAX_THRESHOLDS
        )));
    }
    Ok(sorted)
}

/// Union of newest advisory artifacts per function; missing functions carry
/// structured placeholders.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InsightsResponse {
    pub dataset_id: String,
    pub functions: BTreeMap<String, Value>,
}
