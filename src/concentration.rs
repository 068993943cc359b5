//! Concentration analysis - ranked distribution of a numeric metric across
//! a categorical entity, per period and overall.
//!
//! Grouping runs through polars; ranking and threshold bucketing run over
//! the extracted `(entity, value)` vector so the deterministic tie-break
//! (value descending, entity ascending on its string form) is explicit and
//! reproducible.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};

use polars::prelude::*;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::{EngineError, Result};
use crate::schema::{PeriodGrain, Role, SchemaDoc};
use crate::storage::format_float;
use crate::timegrain::PERIOD_KEY_COLUMN;

/// Tolerance for the unrounded cumulative-share comparison; protects exact
/// boundaries (e.g. the 100% row) from float drift.
const CUM_PCT_EPSILON: f64 = 1e-9;

pub const NON_POSITIVE_TOTAL_ERROR: &str =
    "Total value is non-positive; cannot compute concentration";

pub const TOTAL_PERIOD: &str = "TOTAL";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ThresholdMetrics {
    pub count: usize,
    pub value: f64,
    pub pct_of_total: f64,
}

/// Concentration results for one period (or the overall TOTAL).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeriodConcentration {
    pub period: String,
    pub total: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_entities: Option<usize>,
    /// Keyed `top_<X>` on the wire, ascending by threshold.
    #[serde(
        with = "threshold_map",
        default,
        skip_serializing_if = "BTreeMap::is_empty"
    )]
    pub concentration: BTreeMap<i64, ThresholdMetrics>,
    /// Up to ten top entities with running totals; keys are the actual
    /// group-by and value column names.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub head: Vec<serde_json::Map<String, Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportLinks {
    pub csv: String,
    pub xlsx: String,
}

/// The persisted `analyses/concentration.json` document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConcentrationDoc {
    pub dataset_id: String,
    pub period_grain: PeriodGrain,
    pub group_by: String,
    pub value_column: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time_column: Option<String>,
    pub thresholds: Vec<i64>,
    pub warnings: Vec<String>,
    pub by_period: Vec<PeriodConcentration>,
    pub totals: PeriodConcentration,
    pub computation_log: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub export_links: Option<ExportLinks>,
}

pub struct AnalysisParams {
    pub group_by: String,
    pub value: String,
    pub time_column: Option<String>,
    pub thresholds: Vec<i64>,
}

pub struct ConcentrationAnalyzer {
    large_dataset_threshold: usize,
}

impl ConcentrationAnalyzer {
    pub fn new(large_dataset_threshold: usize) -> Self {
        Self {
            large_dataset_threshold,
        }
    }

    pub fn analyze(
        &self,
        df: &DataFrame,
        schema: &SchemaDoc,
        params: &AnalysisParams,
    ) -> Result<ConcentrationDoc> {
        let group_by = params.group_by.as_str();
        let value = params.value.as_str();

        if schema.column(group_by).is_none() {
            return Err(EngineError::Validation(format!(
                "Column '{}' not found in dataset",
                group_by
            )));
        }
        let value_schema = schema.column(value).ok_or_else(|| {
            EngineError::Validation(format!("Column '{}' not found in dataset", value))
        })?;
        if value_schema.role != Role::Numeric {
            return Err(EngineError::Validation(format!(
                "Column '{}' is not numeric",
                value
            )));
        }

        let thresholds = crate::models::validate_thresholds(&params.thresholds)?;

        let time_column = self.resolve_time_column(df, schema, params)?;
        let mut warnings: Vec<String> = Vec::new();
        let mut computation_log: Vec<String> = Vec::new();

        let mut by_period: Vec<PeriodConcentration> = Vec::new();
        if let Some(ref time_col) = time_column {
            let labels = row_labels(df, time_col)?;
            let periods: BTreeSet<String> = labels.iter().flatten().cloned().collect();

            for period in &periods {
                let bits: Vec<bool> = labels
                    .iter()
                    .map(|l| l.as_deref() == Some(period.as_str()))
                    .collect();
                let mask = BooleanChunked::from_slice("__period_mask", &bits);
                let slice = df.filter(&mask)?;
                let rows = aggregate_entities(&slice, group_by, value)?;
                let outcome = compute_period(period, &rows, &thresholds, group_by, value, false);
                if outcome.error.is_none() {
                    computation_log
                        .push(format!("concentration_calculation_{}: completed", period));
                } else {
                    warn!(period = %period, "non-positive total; period skipped");
                }
                by_period.push(outcome);
            }
        }

        let total_rows = aggregate_entities(df, group_by, value)?;
        if total_rows.len() > self.large_dataset_threshold {
            warnings.push(format!(
                "Large dataset: {} entities exceed configured threshold",
                total_rows.len()
            ));
        }
        let totals = compute_period(TOTAL_PERIOD, &total_rows, &thresholds, group_by, value, true);
        if totals.error.is_none() {
            computation_log.push(format!(
                "concentration_calculation_{}: completed",
                TOTAL_PERIOD
            ));
        }

        debug!(
            periods = by_period.len(),
            entities = total_rows.len(),
            "concentration computed"
        );

        Ok(ConcentrationDoc {
            dataset_id: schema.dataset_id.clone(),
            period_grain: schema.period_grain,
            group_by: group_by.to_string(),
            value_column: value.to_string(),
            time_column,
            thresholds,
            warnings,
            by_period,
            totals,
            computation_log,
            export_links: None,
        })
    }

    fn resolve_time_column(
        &self,
        df: &DataFrame,
        schema: &SchemaDoc,
        params: &AnalysisParams,
    ) -> Result<Option<String>> {
        if let Some(ref requested) = params.time_column {
            if schema.column(requested).is_none() {
                return Err(EngineError::Validation(format!(
                    "Column '{}' not found in dataset",
                    requested
                )));
            }
            return Ok(Some(requested.clone()));
        }
        if schema.period_grain != PeriodGrain::None
            && df.get_column_names().contains(&PERIOD_KEY_COLUMN)
        {
            return Ok(Some(PERIOD_KEY_COLUMN.to_string()));
        }
        Ok(None)
    }
}

/// Group and sum, then rank: value descending, entity string ascending.
/// Null group keys are dropped; null values sum as zero.
fn aggregate_entities(df: &DataFrame, group_by: &str, value: &str) -> Result<Vec<(String, f64)>> {
    if df.height() == 0 {
        return Ok(Vec::new());
    }

    let grouped = df
        .clone()
        .lazy()
        .group_by([col(group_by)])
        .agg([col(value).cast(DataType::Float64).sum().alias("__agg")])
        .collect()?;

    let keys = grouped.column(group_by)?;
    let sums = grouped.column("__agg")?.f64()?;

    let mut rows: Vec<(String, f64)> = Vec::with_capacity(grouped.height());
    for idx in 0..grouped.height() {
        let key = keys.get(idx)?;
        if matches!(key, AnyValue::Null) {
            continue;
        }
        rows.push((entity_label(&key), sums.get(idx).unwrap_or(0.0)));
    }

    rows.sort_by(|a, b| {
        b.1.partial_cmp(&a.1)
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.0.cmp(&b.0))
    });
    Ok(rows)
}

fn compute_period(
    period: &str,
    rows: &[(String, f64)],
    thresholds: &[i64],
    group_by: &str,
    value_column: &str,
    with_entity_count: bool,
) -> PeriodConcentration {
    let total: f64 = rows.iter().map(|r| r.1).sum();
    let total_entities = with_entity_count.then_some(rows.len());

    if total <= 0.0 {
        return PeriodConcentration {
            period: period.to_string(),
            total,
            total_entities,
            concentration: BTreeMap::new(),
            head: Vec::new(),
            error: Some(NON_POSITIVE_TOTAL_ERROR.to_string()),
        };
    }

    let mut cumsum = Vec::with_capacity(rows.len());
    let mut running = 0.0f64;
    for (_, value) in rows {
        running += value;
        cumsum.push(running);
    }
    let cum_pct: Vec<f64> = cumsum.iter().map(|c| c / total * 100.0).collect();

    let mut concentration = BTreeMap::new();
    for &threshold in thresholds {
        let qualifying = cum_pct
            .iter()
            .take_while(|p| **p <= threshold as f64 + CUM_PCT_EPSILON)
            .count();
        let count = qualifying.max(1).min(rows.len());
        let value = cumsum[count - 1];
        concentration.insert(
            threshold,
            ThresholdMetrics {
                count,
                value,
                pct_of_total: round1(value / total * 100.0),
            },
        );
    }

    let head = rows
        .iter()
        .take(10)
        .enumerate()
        .map(|(idx, (entity, value))| {
            let mut row = serde_json::Map::new();
            row.insert(group_by.to_string(), Value::String(entity.clone()));
            row.insert(value_column.to_string(), json_number(*value));
            row.insert("cumsum".to_string(), json_number(cumsum[idx]));
            row.insert(
                "cumulative_pct".to_string(),
                json_number(round1(cum_pct[idx])),
            );
            row
        })
        .collect();

    PeriodConcentration {
        period: period.to_string(),
        total,
        total_entities,
        concentration,
        head,
        error: None,
    }
}

/// Per-row string labels of the time column, whatever its physical type.
fn row_labels(df: &DataFrame, column: &str) -> Result<Vec<Option<String>>> {
    let series = df.column(column)?;
    let mut labels = Vec::with_capacity(series.len());
    for idx in 0..series.len() {
        let value = series.get(idx)?;
        labels.push(match value {
            AnyValue::Null => None,
            other => Some(entity_label(&other)),
        });
    }
    Ok(labels)
}

/// String form of a group key; integral floats render without `.0` so
/// numeric entities compare the way the source renders them.
fn entity_label(value: &AnyValue) -> String {
    match value {
        AnyValue::String(s) => s.to_string(),
        AnyValue::Float64(f) => format_float(*f),
        AnyValue::Float32(f) => format_float(*f as f64),
        other => format!("{}", other),
    }
}

fn round1(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

fn json_number(value: f64) -> Value {
    serde_json::Number::from_f64(value)
        .map(Value::Number)
        .unwrap_or(Value::Null)
}

mod threshold_map {
    use super::ThresholdMetrics;
    use serde::de::Error as DeError;
    use serde::ser::SerializeMap;
    use serde::{Deserialize, Deserializer, Serializer};
    use std::collections::BTreeMap;

    pub fn serialize<S: Serializer>(
        map: &BTreeMap<i64, ThresholdMetrics>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        let mut out = serializer.serialize_map(Some(map.len()))?;
        for (threshold, metrics) in map {
            out.serialize_entry(&format!("top_{}", threshold), metrics)?;
        }
        out.end()
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<BTreeMap<i64, ThresholdMetrics>, D::Error> {
        let raw: BTreeMap<String, ThresholdMetrics> = Deserialize::deserialize(deserializer)?;
        raw.into_iter()
            .map(|(key, metrics)| {
                key.strip_prefix("top_")
                    .and_then(|s| s.parse().ok())
                    .map(|threshold| (threshold, metrics))
                    .ok_or_else(|| D::Error::custom(format!("invalid threshold key '{}'", key)))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rows(pairs: &[(&str, f64)]) -> Vec<(String, f64)> {
        pairs.iter().map(|(e, v)| (e.to_string(), *v)).collect()
    }

    #[test]
    fn single_period_with_ties() {
        // ACME 1000, then BETA/DELTA/GAMMA tied at 500 resolve alphabetically.
        let mut data = rows(&[("ACME", 1000.0), ("BETA", 500.0), ("GAMMA", 500.0), ("DELTA", 500.0)]);
        data.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap()
                .then_with(|| a.0.cmp(&b.0))
        });
        let entities: Vec<&str> = data.iter().map(|(e, _)| e.as_str()).collect();
        assert_eq!(entities, vec!["ACME", "BETA", "DELTA", "GAMMA"]);

        let outcome = compute_period("TOTAL", &data, &[10, 50], "entity", "revenue", true);
        assert_eq!(outcome.total, 2500.0);
        assert_eq!(outcome.total_entities, Some(4));

        let top_10 = &outcome.concentration[&10];
        assert_eq!(top_10.count, 1);
        assert_eq!(top_10.value, 1000.0);
        assert_eq!(top_10.pct_of_total, 40.0);

        // 40% already exceeds 10 and stays under 50, so both land on ACME.
        let top_50 = &outcome.concentration[&50];
        assert_eq!(top_50.count, 1);
        assert_eq!(top_50.value, 1000.0);
        assert_eq!(top_50.pct_of_total, 40.0);
    }

    #[test]
    fn counts_are_monotone_in_threshold() {
        let data = rows(&[
            ("a", 400.0),
            ("b", 300.0),
            ("c", 200.0),
            ("d", 100.0),
        ]);
        let outcome = compute_period("TOTAL", &data, &[10, 40, 70, 100], "g", "v", true);
        let counts: Vec<usize> = [10, 40, 70, 100]
            .iter()
            .map(|t| outcome.concentration[t].count)
            .collect();
        for pair in counts.windows(2) {
            assert!(pair[0] <= pair[1]);
        }
        assert_eq!(outcome.concentration[&100].count, 4);
        assert_eq!(outcome.concentration[&100].value, 1000.0);
    }

    #[test]
    fn non_positive_total_yields_error_not_panic() {
        let data = rows(&[("a", -10.0), ("b", 5.0)]);
        let outcome = compute_period("2024-M01", &data, &[10, 50], "g", "v", false);
        assert_eq!(outcome.error.as_deref(), Some(NON_POSITIVE_TOTAL_ERROR));
        assert!(outcome.concentration.is_empty());
        assert!(outcome.head.is_empty());
    }

    #[test]
    fn count_floor_is_one() {
        // The top entity alone holds 90%; a 10% threshold still reports it.
        let data = rows(&[("whale", 900.0), ("minnow", 100.0)]);
        let outcome = compute_period("TOTAL", &data, &[10], "g", "v", true);
        let metrics = &outcome.concentration[&10];
        assert_eq!(metrics.count, 1);
        assert_eq!(metrics.value, 900.0);
        assert_eq!(metrics.pct_of_total, 90.0);
    }

    #[test]
    fn head_caps_at_ten_rows() {
        let data: Vec<(String, f64)> = (0..15)
            .map(|i| (format!("e{:02}", i), (15 - i) as f64))
            .collect();
        let outcome = compute_period("TOTAL", &data, &[50], "g", "v", true);
        assert_eq!(outcome.head.len(), 10);
        assert_eq!(
            outcome.head[0].get("g").and_then(|v| v.as_str()),
            Some("e00")
        );
        assert!(outcome.head[0].contains_key("cumsum"));
        assert!(outcome.head[0].contains_key("cumulative_pct"));
    }

    #[test]
    fn threshold_keys_serialize_in_numeric_order() {
        let data = rows(&[("a", 60.0), ("b", 40.0)]);
        let outcome = compute_period("TOTAL", &data, &[5, 20, 100], "g", "v", true);
        let json = serde_json::to_string(&outcome).unwrap();
        let pos_5 = json.find("top_5").unwrap();
        let pos_20 = json.find("top_20").unwrap();
        let pos_100 = json.find("top_100").unwrap();
        assert!(pos_5 < pos_20 && pos_20 < pos_100);

        let back: PeriodConcentration = serde_json::from_str(&json).unwrap();
        assert_eq!(back.concentration[&20], outcome.concentration[&20]);
    }

    #[test]
    fn cumulative_boundary_is_inclusive() {
        // Exactly 50% cumulative share qualifies for the 50 threshold.
        let data = rows(&[("a", 50.0), ("b", 50.0)]);
        let outcome = compute_period("TOTAL", &data, &[50], "g", "v", true);
        assert_eq!(outcome.concentration[&50].count, 1);
    }
}
