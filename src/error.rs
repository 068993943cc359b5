use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Conflict(String),

    #[error("Rate limit exceeded: {limit} requests per minute")]
    RateLimited { limit: usize, retry_after_secs: u64 },

    #[error("{0}")]
    PayloadTooLarge(String),

    #[error("Unauthorized")]
    Unauthorized,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Polars error: {0}")]
    Polars(String),

    #[error("{0}")]
    Internal(String),
}

impl From<polars::error::PolarsError> for EngineError {
    fn from(err: polars::error::PolarsError) -> Self {
        EngineError::Polars(err.to_string())
    }
}

impl From<rust_xlsxwriter::XlsxError> for EngineError {
    fn from(err: rust_xlsxwriter::XlsxError) -> Self {
        EngineError::Internal(format!("Workbook error: {}", err))
    }
}

impl From<calamine::Error> for EngineError {
    fn from(err: calamine::Error) -> Self {
        EngineError::Validation(format!("Spreadsheet error: {}", err))
    }
}

impl From<csv::Error> for EngineError {
    fn from(err: csv::Error) -> Self {
        EngineError::Internal(format!("CSV error: {}", err))
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
