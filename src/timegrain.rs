//! Temporal dimension detection and period key derivation.
//!
//! A column is a time candidate when its normalized name hits a boundary
//! pattern (`date`, `dt`, `as_of`, `posting_date`, `transaction_date`,
//! `year`, `month`, `quarter`, `fiscal_period`) or when its values look like
//! years, `YYYY-MM` / `MM/YYYY` stamps or `Q1..Q4` markers. The grain is the
//! first computable entry of the precedence
//! `date > year+month > year+quarter > year > none`.

use std::collections::HashMap;

use lazy_static::lazy_static;
use polars::prelude::*;
use regex::Regex;

use crate::error::Result;
use crate::schema::{PeriodGrain, Role};

/// Column name added to the normalized table when a grain is detected.
pub const PERIOD_KEY_COLUMN: &str = "period_key";

/// Share of non-null values that must validate for a component column.
const VALIDATION_THRESHOLD: f64 = 0.7;

const YEAR_MIN: i64 = 1900;
const YEAR_MAX: i64 = 2100;

lazy_static! {
    static ref NAME_CANDIDATE_RE: Regex = Regex::new(
        r"(^|_)(date|dt|as_of|posting_date|transaction_date|year|month|quarter|fiscal_period)(_|$)"
    )
    .unwrap();
    static ref YEAR_VALUE_RE: Regex = Regex::new(r"^(19|20)\d{2}$").unwrap();
    static ref YEAR_MONTH_VALUE_RE: Regex = Regex::new(r"^\d{4}-(0?[1-9]|1[0-2])$").unwrap();
    static ref MONTH_YEAR_VALUE_RE: Regex = Regex::new(r"^(0?[1-9]|1[0-2])/\d{4}$").unwrap();
    static ref QUARTER_VALUE_RE: Regex = Regex::new(r"^[Qq][1-4]$").unwrap();
    static ref NAME_SEGMENT_YEAR_RE: Regex = Regex::new(r"(^|_)year(_|$)").unwrap();
    static ref NAME_SEGMENT_MONTH_RE: Regex = Regex::new(r"(^|_)month(_|$)").unwrap();
    static ref NAME_SEGMENT_QUARTER_RE: Regex = Regex::new(r"(^|_)quarter(_|$)").unwrap();
}

#[derive(Debug)]
pub struct TimeDetection {
    pub period_grain: PeriodGrain,
    /// Computable grains in precedence order, `none` always last.
    pub candidates: Vec<PeriodGrain>,
    pub time_candidates: Vec<String>,
    pub selected_time_column: Option<String>,
    /// Derived `period_key` column; absent when the grain is `none`.
    pub period_key: Option<Series>,
}

/// Detect the temporal dimension of a normalized table.
pub fn detect(df: &DataFrame, roles: &HashMap<String, Role>) -> Result<TimeDetection> {
    let names: Vec<String> = df
        .get_column_names()
        .iter()
        .map(|s| s.to_string())
        .collect();

    let mut time_candidates: Vec<String> = Vec::new();
    for name in &names {
        if NAME_CANDIDATE_RE.is_match(name) || column_has_temporal_values(df, name)? {
            time_candidates.push(name.clone());
        }
    }

    let date_col = names
        .iter()
        .find(|n| roles.get(*n) == Some(&Role::Datetime))
        .cloned();
    let year_col = find_component(df, &names, &NAME_SEGMENT_YEAR_RE, is_year_value)?;
    let month_col = find_component(df, &names, &NAME_SEGMENT_MONTH_RE, is_month_value)?;
    let quarter_col = find_component(df, &names, &NAME_SEGMENT_QUARTER_RE, is_quarter_value)?;

    let (candidates, selected) = if let Some(date) = date_col {
        (
            vec![PeriodGrain::YearMonth, PeriodGrain::Year, PeriodGrain::None],
            Some(date),
        )
    } else if year_col.is_some() && month_col.is_some() {
        (
            vec![PeriodGrain::YearMonth, PeriodGrain::Year, PeriodGrain::None],
            year_col.clone(),
        )
    } else if year_col.is_some() && quarter_col.is_some() {
        (
            vec![PeriodGrain::YearQuarter, PeriodGrain::Year, PeriodGrain::None],
            year_col.clone(),
        )
    } else if year_col.is_some() {
        (vec![PeriodGrain::Year, PeriodGrain::None], year_col.clone())
    } else {
        (vec![PeriodGrain::None], None)
    };

    let period_grain = candidates[0];
    let period_key = match period_grain {
        PeriodGrain::None => None,
        _ => Some(build_period_key(
            df,
            period_grain,
            selected.as_deref(),
            year_col.as_deref(),
            month_col.as_deref(),
            quarter_col.as_deref(),
        )?),
    };

    Ok(TimeDetection {
        period_grain,
        candidates,
        time_candidates,
        selected_time_column: selected,
        period_key,
    })
}

fn column_has_temporal_values(df: &DataFrame, name: &str) -> Result<bool> {
    let series = df.column(name)?;
    let non_null = series.len() - series.null_count();
    if non_null == 0 {
        return Ok(false);
    }

    let mut matches = 0usize;
    for idx in 0..series.len() {
        let value = series.get(idx)?;
        match value {
            AnyValue::Null => {}
            AnyValue::String(s) => {
                let s = s.trim();
                if YEAR_VALUE_RE.is_match(s)
                    || YEAR_MONTH_VALUE_RE.is_match(s)
                    || MONTH_YEAR_VALUE_RE.is_match(s)
                    || QUARTER_VALUE_RE.is_match(s)
                {
                    matches += 1;
                }
            }
            other => {
                if let Some(v) = any_to_i64(&other) {
                    if (YEAR_MIN..=YEAR_MAX).contains(&v) {
                        matches += 1;
                    }
                }
            }
        }
    }

    Ok(matches as f64 / non_null as f64 >= VALIDATION_THRESHOLD)
}

/// Find a component column by name segment, validated by value predicate.
fn find_component(
    df: &DataFrame,
    names: &[String],
    name_re: &Regex,
    validate: fn(&AnyValue) -> bool,
) -> Result<Option<String>> {
    for name in names {
        if !name_re.is_match(name) {
            continue;
        }
        let series = df.column(name)?;
        let non_null = series.len() - series.null_count();
        if non_null == 0 {
            continue;
        }
        let mut valid = 0usize;
        for idx in 0..series.len() {
            let value = series.get(idx)?;
            if !matches!(value, AnyValue::Null) && validate(&value) {
                valid += 1;
            }
        }
        if valid as f64 / non_null as f64 >= VALIDATION_THRESHOLD {
            return Ok(Some(name.clone()));
        }
    }
    Ok(None)
}

fn is_year_value(value: &AnyValue) -> bool {
    match value {
        AnyValue::String(s) => YEAR_VALUE_RE.is_match(s.trim()),
        other => any_to_i64(other)
            .map(|v| (YEAR_MIN..=YEAR_MAX).contains(&v))
            .unwrap_or(false),
    }
}

fn is_month_value(value: &AnyValue) -> bool {
    extract_month(value).is_some()
}

fn is_quarter_value(value: &AnyValue) -> bool {
    extract_quarter(value).is_some()
}

fn build_period_key(
    df: &DataFrame,
    grain: PeriodGrain,
    date_or_year_col: Option<&str>,
    year_col: Option<&str>,
    month_col: Option<&str>,
    quarter_col: Option<&str>,
) -> Result<Series> {
    let height = df.height();
    let mut keys: Vec<Option<String>> = Vec::with_capacity(height);

    // A datetime column takes precedence; its year and month drive the key.
    let datetime_col = date_or_year_col
        .filter(|name| {
            df.column(name)
                .map(|s| matches!(s.dtype(), DataType::Datetime(_, _) | DataType::Date))
                .unwrap_or(false)
        })
        .map(|s| s.to_string());

    for idx in 0..height {
        let key = if let Some(ref name) = datetime_col {
            datetime_parts(df, name, idx)?.map(|(year, month)| match grain {
                PeriodGrain::YearMonth => format!("{:04}-M{:02}", year, month),
                PeriodGrain::Year => format!("{:04}", year),
                _ => format!("{:04}-M{:02}", year, month),
            })
        } else {
            let year = year_col
                .map(|name| cell_i64(df, name, idx))
                .transpose()?
                .flatten();
            match (grain, year) {
                (PeriodGrain::YearMonth, Some(year)) => month_col
                    .map(|name| cell_value(df, name, idx))
                    .transpose()?
                    .and_then(|v| extract_month(&v))
                    .map(|month| format!("{:04}-M{:02}", year, month)),
                (PeriodGrain::YearQuarter, Some(year)) => quarter_col
                    .map(|name| cell_value(df, name, idx))
                    .transpose()?
                    .and_then(|v| extract_quarter(&v))
                    .map(|quarter| format!("{:04}-Q{}", year, quarter)),
                (PeriodGrain::Year, Some(year)) => Some(format!("{:04}", year)),
                _ => None,
            }
        };
        keys.push(key);
    }

    Ok(Series::new(PERIOD_KEY_COLUMN, keys))
}

fn datetime_parts(df: &DataFrame, name: &str, idx: usize) -> Result<Option<(i32, u32)>> {
    use chrono::Datelike;

    let series = df.column(name)?;
    let parts = match series.dtype() {
        DataType::Datetime(unit, _) => {
            let chunked = series.datetime()?;
            chunked.get(idx).and_then(|raw| {
                let ms = match unit {
                    TimeUnit::Milliseconds => raw,
                    TimeUnit::Microseconds => raw / 1_000,
                    TimeUnit::Nanoseconds => raw / 1_000_000,
                };
                chrono::DateTime::from_timestamp_millis(ms)
                    .map(|dt| (dt.year(), dt.month()))
            })
        }
        DataType::Date => {
            let chunked = series.date()?;
            chunked.get(idx).and_then(|days| {
                chrono::DateTime::from_timestamp((days as i64) * 86_400, 0)
                    .map(|dt| (dt.year(), dt.month()))
            })
        }
        _ => None,
    };
    Ok(parts)
}

fn cell_value<'a>(df: &'a DataFrame, name: &str, idx: usize) -> Result<AnyValue<'a>> {
    Ok(df.column(name)?.get(idx)?)
}

fn cell_i64(df: &DataFrame, name: &str, idx: usize) -> Result<Option<i64>> {
    Ok(any_to_i64(&cell_value(df, name, idx)?))
}

fn any_to_i64(value: &AnyValue) -> Option<i64> {
    match value {
        AnyValue::Int64(v) => Some(*v),
        AnyValue::Int32(v) => Some(*v as i64),
        AnyValue::UInt64(v) => Some(*v as i64),
        AnyValue::UInt32(v) => Some(*v as i64),
        AnyValue::Float64(v) if v.fract() == 0.0 => Some(*v as i64),
        AnyValue::Float32(v) if v.fract() == 0.0 => Some(*v as i64),
        AnyValue::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn extract_month(value: &AnyValue) -> Option<u32> {
    let month = match value {
        AnyValue::String(s) => s.trim().parse::<i64>().ok()?,
        other => any_to_i64(other)?,
    };
    if (1..=12).contains(&month) {
        Some(month as u32)
    } else {
        None
    }
}

fn extract_quarter(value: &AnyValue) -> Option<u32> {
    match value {
        AnyValue::String(s) => {
            let s = s.trim();
            if QUARTER_VALUE_RE.is_match(s) {
                s[1..].parse().ok()
            } else {
                let q = s.parse::<i64>().ok()?;
                (1..=4).contains(&q).then_some(q as u32)
            }
        }
        other => {
            let q = any_to_i64(other)?;
            (1..=4).contains(&q).then_some(q as u32)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roles_of(pairs: &[(&str, Role)]) -> HashMap<String, Role> {
        pairs.iter().map(|(n, r)| (n.to_string(), *r)).collect()
    }

    #[test]
    fn year_month_grain_from_component_columns() -> Result<()> {
        let df = df![
            "year" => [2024i64, 2024, 2024],
            "month" => [1i64, 2, 12],
            "revenue" => [10.0, 20.0, 30.0]
        ]?;
        let roles = roles_of(&[
            ("year", Role::Numeric),
            ("month", Role::Numeric),
            ("revenue", Role::Numeric),
        ]);

        let detection = detect(&df, &roles)?;
        assert_eq!(detection.period_grain, PeriodGrain::YearMonth);
        assert_eq!(
            detection.candidates,
            vec![PeriodGrain::YearMonth, PeriodGrain::Year, PeriodGrain::None]
        );
        assert!(detection.time_candidates.contains(&"year".to_string()));

        let keys = detection.period_key.unwrap();
        let keys = keys.str()?;
        assert_eq!(keys.get(0), Some("2024-M01"));
        assert_eq!(keys.get(2), Some("2024-M12"));
        Ok(())
    }

    #[test]
    fn year_quarter_grain_with_q_markers() -> Result<()> {
        let df = df![
            "fiscal_year" => [2023i64, 2023],
            "quarter" => ["Q1", "Q4"],
            "amount" => [5.0, 6.0]
        ]?;
        let roles = roles_of(&[
            ("fiscal_year", Role::Numeric),
            ("quarter", Role::Categorical),
            ("amount", Role::Numeric),
        ]);

        let detection = detect(&df, &roles)?;
        assert_eq!(detection.period_grain, PeriodGrain::YearQuarter);
        let keys = detection.period_key.unwrap();
        let keys = keys.str()?;
        assert_eq!(keys.get(0), Some("2023-Q1"));
        assert_eq!(keys.get(1), Some("2023-Q4"));
        Ok(())
    }

    #[test]
    fn no_temporal_columns_means_no_grain() -> Result<()> {
        let df = df![
            "entity" => ["a", "b"],
            "value" => [1.0, 2.0]
        ]?;
        let roles = roles_of(&[("entity", Role::Categorical), ("value", Role::Numeric)]);

        let detection = detect(&df, &roles)?;
        assert_eq!(detection.period_grain, PeriodGrain::None);
        assert_eq!(detection.candidates, vec![PeriodGrain::None]);
        assert!(detection.period_key.is_none());
        Ok(())
    }

    #[test]
    fn datetime_column_drives_year_month() -> Result<()> {
        let ms = |y: i64, m: i64, d: i64| -> i64 {
            chrono::NaiveDate::from_ymd_opt(y as i32, m as u32, d as u32)
                .unwrap()
                .and_hms_opt(0, 0, 0)
                .unwrap()
                .and_utc()
                .timestamp_millis()
        };
        let stamps = Series::new("posting_date", vec![Some(ms(2024, 3, 15)), Some(ms(2024, 4, 1))])
            .cast(&DataType::Datetime(TimeUnit::Milliseconds, None))?;
        let values = Series::new("value", vec![1.0, 2.0]);
        let df = DataFrame::new(vec![stamps, values])?;
        let roles = roles_of(&[("posting_date", Role::Datetime), ("value", Role::Numeric)]);

        let detection = detect(&df, &roles)?;
        assert_eq!(detection.period_grain, PeriodGrain::YearMonth);
        assert_eq!(detection.selected_time_column.as_deref(), Some("posting_date"));
        let keys = detection.period_key.unwrap();
        let keys = keys.str()?;
        assert_eq!(keys.get(0), Some("2024-M03"));
        assert_eq!(keys.get(1), Some("2024-M04"));
        Ok(())
    }
}
