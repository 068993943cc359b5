//! Schema document types shared by the normalizer, pipeline and exporters.

use serde::{Deserialize, Serialize};

/// Semantic role of a column after coercion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Numeric,
    Categorical,
    Datetime,
    Boolean,
    Identifier,
}

/// Granularity of the derived period keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeriodGrain {
    YearMonth,
    YearQuarter,
    Year,
    None,
}

impl PeriodGrain {
    pub fn as_str(&self) -> &'static str {
        match self {
            PeriodGrain::YearMonth => "year_month",
            PeriodGrain::YearQuarter => "year_quarter",
            PeriodGrain::Year => "year",
            PeriodGrain::None => "none",
        }
    }
}

/// Per-column coercion counters accumulated during normalization.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Coercions {
    pub currency_removed: u64,
    pub parentheses_to_negative: u64,
    pub scaling_applied: u64,
    pub percent_normalized: u64,
    pub datetime_parsed: u64,
    pub boolean_coerced: u64,
    pub failed_numeric: u64,
    pub unicode_minus_normalized: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnSchema {
    /// Normalized name, unique within the dataset.
    pub name: String,
    pub original_name: String,
    /// Physical type: integer | float | boolean | datetime | string.
    pub dtype: String,
    pub role: Role,
    pub cardinality: usize,
    pub null_count: usize,
    pub null_rate: f64,
    pub coercions: Coercions,
    /// "US", "EU" or "mixed" when a decimal convention was observed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub decimal_convention: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub currencies_detected: Vec<String>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub multi_currency: bool,
    /// Anomaly flags such as `high_null_rate` or `low_cardinality`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub flags: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchemaMetadata {
    pub row_count: usize,
    pub column_count: usize,
    pub multi_currency: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub currencies_detected: Vec<String>,
    pub has_time_dimension: bool,
}

/// The persisted `schema.json` document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchemaDoc {
    pub dataset_id: String,
    pub generated_at: String,
    pub columns: Vec<ColumnSchema>,
    pub period_grain: PeriodGrain,
    /// Computable grains in precedence order; the selected grain is first.
    pub period_grain_candidates: Vec<PeriodGrain>,
    /// Normalized names of columns that look temporal.
    pub time_candidates: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub selected_time_column: Option<String>,
    pub metadata: SchemaMetadata,
    pub warnings: Vec<String>,
    /// Reserved for advisory text; the deterministic path never writes it.
    #[serde(default)]
    pub notes: Vec<String>,
}

impl SchemaDoc {
    pub fn column(&self, name: &str) -> Option<&ColumnSchema> {
        self.columns.iter().find(|c| c.name == name)
    }
}

fn is_false(value: &bool) -> bool {
    !*value
}
