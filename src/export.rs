//! Export of concentration results: a flat CSV and a three-sheet workbook.
//!
//! Both artifacts reflect the JSON result document faithfully; a threshold
//! missing from a period renders as empty cells, never zero.

use std::path::Path;

use polars::prelude::*;
use tracing::debug;

use crate::concentration::{ConcentrationDoc, PeriodConcentration};
use crate::error::Result;
use crate::storage;

/// One parsed row of the flat CSV; used for round-trip checks.
#[derive(Debug, Clone, PartialEq)]
pub struct FlatRow {
    pub period: String,
    pub threshold: i64,
    pub count: usize,
    pub value: f64,
    pub pct_of_total: f64,
}

pub struct Exporter;

impl Exporter {
    /// Flat export: `period, threshold, count, value, pct_of_total`, one row
    /// per period and threshold, periods first and TOTAL last.
    ///
    /// A transitional trailing `GroupBy,<column>` line is appended for
    /// legacy consumers; it is deprecated and will be dropped once those
    /// consumers migrate. Parsers should ignore extra columns.
    pub fn export_csv(doc: &ConcentrationDoc, path: &Path) -> Result<()> {
        let mut writer = csv::WriterBuilder::new().flexible(true).from_path(path)?;
        writer.write_record(["period", "threshold", "count", "value", "pct_of_total"])?;

        for period in doc.by_period.iter().chain(std::iter::once(&doc.totals)) {
            if period.error.is_some() {
                continue;
            }
            for (threshold, metrics) in &period.concentration {
                writer.write_record([
                    period.period.clone(),
                    threshold.to_string(),
                    metrics.count.to_string(),
                    format!("{}", metrics.value),
                    format!("{:.1}", metrics.pct_of_total),
                ])?;
            }
        }

        writer.write_record(["GroupBy", doc.group_by.as_str()])?;
        writer.flush()?;
        debug!(path = %path.display(), "flat export written");
        Ok(())
    }

    /// Reference parser for the flat export; skips the trailing
    /// compatibility line and any malformed record.
    pub fn parse_flat_csv(path: &Path) -> Result<Vec<FlatRow>> {
        let mut reader = csv::ReaderBuilder::new()
            .flexible(true)
            .has_headers(true)
            .from_path(path)?;

        let mut rows = Vec::new();
        for record in reader.records() {
            let record = record?;
            if record.len() != 5 || record.get(0) == Some("GroupBy") {
                continue;
            }
            let parse = || -> Option<FlatRow> {
                Some(FlatRow {
                    period: record.get(0)?.to_string(),
                    threshold: record.get(1)?.parse().ok()?,
                    count: record.get(2)?.parse().ok()?,
                    value: record.get(3)?.parse().ok()?,
                    pct_of_total: record.get(4)?.parse().ok()?,
                })
            };
            if let Some(row) = parse() {
                rows.push(row);
            }
        }
        Ok(rows)
    }

    /// Workbook export with `Summary`, `Top_Entities` and `Parameters`
    /// sheets, in that order.
    pub fn export_workbook(doc: &ConcentrationDoc, path: &Path) -> Result<()> {
        let sheets = vec![
            ("Summary".to_string(), Self::summary_sheet(doc)?),
            ("Top_Entities".to_string(), Self::top_entities_sheet(doc)?),
            ("Parameters".to_string(), Self::parameters_sheet(doc)?),
        ];
        storage::write_spreadsheet(&sheets, path)?;
        debug!(path = %path.display(), "workbook export written");
        Ok(())
    }

    fn summary_sheet(doc: &ConcentrationDoc) -> Result<DataFrame> {
        let periods: Vec<&PeriodConcentration> = doc
            .by_period
            .iter()
            .chain(std::iter::once(&doc.totals))
            .collect();

        let mut series: Vec<Series> = Vec::new();
        series.push(Series::new(
            "period",
            periods.iter().map(|p| p.period.clone()).collect::<Vec<_>>(),
        ));
        series.push(Series::new(
            "total",
            periods.iter().map(|p| p.total).collect::<Vec<_>>(),
        ));

        for &threshold in &doc.thresholds {
            let counts: Vec<Option<f64>> = periods
                .iter()
                .map(|p| p.concentration.get(&threshold).map(|m| m.count as f64))
                .collect();
            let values: Vec<Option<f64>> = periods
                .iter()
                .map(|p| p.concentration.get(&threshold).map(|m| m.value))
                .collect();
            let pcts: Vec<Option<f64>> = periods
                .iter()
                .map(|p| p.concentration.get(&threshold).map(|m| m.pct_of_total))
                .collect();
            series.push(Series::new(&format!("top_{}_count", threshold), counts));
            series.push(Series::new(&format!("top_{}_value", threshold), values));
            series.push(Series::new(&format!("top_{}_pct", threshold), pcts));
        }

        Ok(DataFrame::new(series)?)
    }

    fn top_entities_sheet(doc: &ConcentrationDoc) -> Result<DataFrame> {
        let mut periods: Vec<Option<String>> = Vec::new();
        let mut entities: Vec<Option<String>> = Vec::new();
        let mut values: Vec<Option<f64>> = Vec::new();
        let mut cumsums: Vec<Option<f64>> = Vec::new();
        let mut cum_pcts: Vec<Option<f64>> = Vec::new();

        for period in doc.by_period.iter().chain(std::iter::once(&doc.totals)) {
            for row in &period.head {
                periods.push(Some(period.period.clone()));
                entities.push(
                    row.get(&doc.group_by)
                        .and_then(|v| v.as_str())
                        .map(String::from),
                );
                values.push(row.get(&doc.value_column).and_then(|v| v.as_f64()));
                cumsums.push(row.get("cumsum").and_then(|v| v.as_f64()));
                cum_pcts.push(row.get("cumulative_pct").and_then(|v| v.as_f64()));
            }
        }

        Ok(DataFrame::new(vec![
            Series::new("period", periods),
            Series::new("entity", entities),
            Series::new("value", values),
            Series::new("cumsum", cumsums),
            Series::new("cumulative_pct", cum_pcts),
        ])?)
    }

    fn parameters_sheet(doc: &ConcentrationDoc) -> Result<DataFrame> {
        let thresholds = doc
            .thresholds
            .iter()
            .map(|t| t.to_string())
            .collect::<Vec<_>>()
            .join(", ");
        Ok(DataFrame::new(vec![
            Series::new(
                "Parameter",
                vec!["Group By", "Value Column", "Time Column", "Thresholds"],
            ),
            Series::new(
                "Value",
                vec![
                    doc.group_by.clone(),
                    doc.value_column.clone(),
                    doc.time_column.clone().unwrap_or_else(|| "none".to_string()),
                    format!("[{}]", thresholds),
                ],
            ),
        ])?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::concentration::{ThresholdMetrics, TOTAL_PERIOD};
    use crate::schema::PeriodGrain;
    use std::collections::BTreeMap;

    fn sample_doc() -> ConcentrationDoc {
        let mut concentration = BTreeMap::new();
        concentration.insert(
            10,
            ThresholdMetrics {
                count: 1,
                value: 1000.0,
                pct_of_total: 40.0,
            },
        );
        concentration.insert(
            50,
            ThresholdMetrics {
                count: 1,
                value: 1000.0,
                pct_of_total: 40.0,
            },
        );

        let mut head_row = serde_json::Map::new();
        head_row.insert("entity".to_string(), serde_json::json!("ACME"));
        head_row.insert("revenue".to_string(), serde_json::json!(1000.0));
        head_row.insert("cumsum".to_string(), serde_json::json!(1000.0));
        head_row.insert("cumulative_pct".to_string(), serde_json::json!(40.0));

        ConcentrationDoc {
            dataset_id: "ds_000000000000".to_string(),
            period_grain: PeriodGrain::None,
            group_by: "entity".to_string(),
            value_column: "revenue".to_string(),
            time_column: None,
            thresholds: vec![10, 50],
            warnings: Vec::new(),
            by_period: Vec::new(),
            totals: PeriodConcentration {
                period: TOTAL_PERIOD.to_string(),
                total: 2500.0,
                total_entities: Some(4),
                concentration,
                head: vec![head_row],
                error: None,
            },
            computation_log: Vec::new(),
            export_links: None,
        }
    }

    #[test]
    fn csv_round_trips_through_reference_parser() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("concentration.csv");
        let doc = sample_doc();

        Exporter::export_csv(&doc, &path).unwrap();
        let rows = Exporter::parse_flat_csv(&path).unwrap();

        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].period, "TOTAL");
        assert_eq!(rows[0].threshold, 10);
        assert_eq!(rows[0].count, 1);
        assert_eq!(rows[0].value, 1000.0);
        assert_eq!(rows[0].pct_of_total, 40.0);
        assert_eq!(rows[1].threshold, 50);

        let raw = std::fs::read_to_string(&path).unwrap();
        assert!(raw.trim_end().ends_with("GroupBy,entity"));
    }

    #[test]
    fn workbook_export_writes_three_sheets() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("concentration.xlsx");
        Exporter::export_workbook(&sample_doc(), &path).unwrap();
        assert!(path.exists());
        assert!(std::fs::metadata(&path).unwrap().len() > 0);
    }
}
