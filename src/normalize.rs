//! Deterministic data normalization.
//!
//! Turns an all-string table into a typed table plus a schema document.
//! Every cleaning decision is counted per column so the transformation is
//! auditable from the schema alone: currency strips, parenthesized
//! negatives, scale suffixes, locale decimal conventions, percent
//! normalization, datetime and boolean coercion.

use std::collections::{BTreeSet, HashMap};

use lazy_static::lazy_static;
use polars::prelude::*;
use regex::Regex;
use tracing::debug;

use crate::error::Result;
use crate::schema::{
    Coercions, ColumnSchema, PeriodGrain, Role, SchemaDoc, SchemaMetadata,
};
use crate::timegrain;

lazy_static! {
    static ref NON_ALNUM_RE: Regex = Regex::new(r"[^a-z0-9]+").unwrap();
    static ref PERCENT_HEADER_RE: Regex = Regex::new(r"(?i)(percent|pct|percentage)").unwrap();
    static ref TEMPORAL_HEADER_RE: Regex =
        Regex::new(r"(^|_)(date|dt|time|timestamp|created|updated|modified|as_of|posting)(_|$)")
            .unwrap();
    static ref SCALE_SUFFIX_RE: Regex = Regex::new(r"^(.*\d)\s*(mm|bn|k|K|m|M|b|B)$").unwrap();
    static ref EU_DECIMAL_COMMA_RE: Regex = Regex::new(r",\d{1,2}$").unwrap();
    static ref NEGATIVE_FLAGGED_RE: Regex = Regex::new(r"revenue|sales|turnover").unwrap();
}

const CURRENCY_SYMBOLS: [char; 4] = ['$', '€', '£', '¥'];
const NUMERIC_FAILURE_CEILING: f64 = 0.5;
const BOOLEAN_COVERAGE_FLOOR: f64 = 0.95;
const DATETIME_COVERAGE_FLOOR: f64 = 0.7;
const HIGH_NULL_RATE: f64 = 0.5;

const DATETIME_FORMATS: [&str; 3] = ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S", "%m/%d/%Y %H:%M:%S"];
const DATE_FORMATS: [&str; 4] = ["%Y-%m-%d", "%Y/%m/%d", "%m/%d/%Y", "%m-%d-%Y"];

/// Output of the normalization pipeline.
pub struct NormalizedData {
    pub table: DataFrame,
    pub schema: SchemaDoc,
    pub warnings: Vec<String>,
}

pub struct DataNormalizer;

impl DataNormalizer {
    pub fn new() -> Self {
        Self
    }

    /// Normalize a raw string table into a typed table and schema document.
    pub fn normalize(&self, raw: &DataFrame, dataset_id: &str) -> Result<NormalizedData> {
        let mut warnings: Vec<String> = Vec::new();

        let originals: Vec<String> = raw
            .get_column_names()
            .iter()
            .map(|s| s.to_string())
            .collect();
        let headers = standardize_headers(&originals);

        let mut series_out: Vec<Series> = Vec::with_capacity(headers.len());
        let mut outcomes: Vec<ColumnOutcome> = Vec::with_capacity(headers.len());

        for (idx, (name, _original)) in headers.iter().enumerate() {
            let cells = series_to_cells(&raw.get_columns()[idx]);
            let outcome = coerce_column(name, &cells);
            warnings.extend(outcome.warnings.iter().cloned());
            series_out.push(outcome.to_series(name));
            outcomes.push(outcome);
        }

        let table = DataFrame::new(series_out)?;

        let mut roles: HashMap<String, Role> = HashMap::new();
        for ((name, _), outcome) in headers.iter().zip(&outcomes) {
            roles.insert(name.clone(), outcome.provisional_role());
        }

        // Column-level warnings can repeat across columns; keep first
        // occurrences only.
        let mut seen_warnings = BTreeSet::new();
        warnings.retain(|w| seen_warnings.insert(w.clone()));

        let detection = timegrain::detect(&table, &roles)?;
        let mut table = table;
        if let Some(period_key) = &detection.period_key {
            table.with_column(period_key.clone())?;
        }

        let row_count = table.height();
        let mut columns: Vec<ColumnSchema> = Vec::with_capacity(headers.len());
        let mut all_currencies: BTreeSet<String> = BTreeSet::new();

        for ((name, original), outcome) in headers.iter().zip(&outcomes) {
            let series = table.column(name)?;
            let null_count = series.null_count();
            let null_rate = if row_count > 0 {
                null_count as f64 / row_count as f64
            } else {
                0.0
            };
            let cardinality = non_null_cardinality(series)?;

            let role = finalize_role(outcome, cardinality, null_count, row_count);

            // Negative-value policy: revenue-like columns must not go negative.
            if role == Role::Numeric
                && NEGATIVE_FLAGGED_RE.is_match(name)
                && has_negative(series)?
            {
                warnings.push(format!("Unexpected negative values in column '{}'", name));
            }

            let mut flags = Vec::new();
            if null_rate > HIGH_NULL_RATE {
                flags.push("high_null_rate".to_string());
            }
            if row_count > 100 && cardinality < 5 {
                flags.push("low_cardinality".to_string());
            }

            all_currencies.extend(outcome.currencies.iter().cloned());

            columns.push(ColumnSchema {
                name: name.clone(),
                original_name: original.clone(),
                dtype: outcome.dtype().to_string(),
                role,
                cardinality,
                null_count,
                null_rate,
                coercions: outcome.coercions.clone(),
                decimal_convention: outcome.decimal_convention(),
                currencies_detected: outcome.currencies.iter().cloned().collect(),
                multi_currency: outcome.currencies.len() > 1,
                flags,
            });
        }

        // `with_column` replaces an existing column of the same name, so a
        // source column that normalized to `period_key` must not produce a
        // second schema entry.
        let user_period_key = headers
            .iter()
            .any(|(name, _)| name == timegrain::PERIOD_KEY_COLUMN);
        if detection.period_key.is_some() && !user_period_key {
            let series = table.column(timegrain::PERIOD_KEY_COLUMN)?;
            columns.push(ColumnSchema {
                name: timegrain::PERIOD_KEY_COLUMN.to_string(),
                original_name: timegrain::PERIOD_KEY_COLUMN.to_string(),
                dtype: "string".to_string(),
                role: Role::Categorical,
                cardinality: non_null_cardinality(series)?,
                null_count: series.null_count(),
                null_rate: if row_count > 0 {
                    series.null_count() as f64 / row_count as f64
                } else {
                    0.0
                },
                coercions: Coercions::default(),
                decimal_convention: None,
                currencies_detected: Vec::new(),
                multi_currency: false,
                flags: Vec::new(),
            });
        }

        let has_time_dimension = detection.period_grain != PeriodGrain::None;
        let schema = SchemaDoc {
            dataset_id: dataset_id.to_string(),
            generated_at: chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Micros, true),
            columns,
            period_grain: detection.period_grain,
            period_grain_candidates: detection.candidates,
            time_candidates: detection.time_candidates,
            selected_time_column: detection.selected_time_column,
            metadata: SchemaMetadata {
                row_count,
                column_count: headers.len(),
                multi_currency: all_currencies.len() > 1,
                currencies_detected: all_currencies.into_iter().collect(),
                has_time_dimension,
            },
            warnings: warnings.clone(),
            notes: Vec::new(),
        };

        debug!(
            rows = row_count,
            columns = schema.columns.len(),
            grain = schema.period_grain.as_str(),
            "normalization complete"
        );

        Ok(NormalizedData {
            table,
            schema,
            warnings,
        })
    }
}

impl Default for DataNormalizer {
    fn default() -> Self {
        Self::new()
    }
}

/// Trim, lowercase, collapse non-alphanumerics to `_`, prefix a leading
/// digit with `col_`, and deduplicate with numeric suffixes.
fn standardize_headers(originals: &[String]) -> Vec<(String, String)> {
    let mut seen: BTreeSet<String> = BTreeSet::new();
    let mut out = Vec::with_capacity(originals.len());

    for original in originals {
        let mut clean = original.trim().to_lowercase();
        clean = NON_ALNUM_RE.replace_all(&clean, "_").to_string();
        clean = clean.trim_matches('_').to_string();
        if clean.is_empty() {
            clean = "column".to_string();
        }
        if clean.chars().next().map(|c| c.is_ascii_digit()).unwrap_or(false) {
            clean = format!("col_{}", clean);
        }
        if seen.contains(&clean) {
            let mut i = 2;
            while seen.contains(&format!("{}_{}", clean, i)) {
                i += 1;
            }
            clean = format!("{}_{}", clean, i);
        }
        seen.insert(clean.clone());
        out.push((clean, original.clone()));
    }
    out
}

fn series_to_cells(series: &Series) -> Vec<Option<String>> {
    match series.str() {
        Ok(chunked) => chunked
            .into_iter()
            .map(|v| v.map(|s| s.to_string()))
            .collect(),
        Err(_) => (0..series.len())
            .map(|idx| match series.get(idx) {
                Ok(AnyValue::Null) | Err(_) => None,
                Ok(value) => Some(format!("{}", value)),
            })
            .collect(),
    }
}

#[derive(Debug)]
enum TypedColumn {
    Numeric(Vec<Option<f64>>),
    Datetime(Vec<Option<i64>>),
    Boolean(Vec<Option<bool>>),
    Text(Vec<Option<String>>),
}

struct ColumnOutcome {
    typed: TypedColumn,
    coercions: Coercions,
    conventions: BTreeSet<&'static str>,
    currencies: BTreeSet<String>,
    warnings: Vec<String>,
}

impl ColumnOutcome {
    fn to_series(&self, name: &str) -> Series {
        match &self.typed {
            TypedColumn::Numeric(values) => Series::new(name, values.clone()),
            TypedColumn::Datetime(values) => Series::new(name, values.clone())
                .cast(&DataType::Datetime(TimeUnit::Milliseconds, None))
                .unwrap_or_else(|_| Series::new(name, values.clone())),
            TypedColumn::Boolean(values) => Series::new(name, values.clone()),
            TypedColumn::Text(values) => Series::new(name, values.clone()),
        }
    }

    fn dtype(&self) -> &'static str {
        match self.typed {
            TypedColumn::Numeric(_) => "float",
            TypedColumn::Datetime(_) => "datetime",
            TypedColumn::Boolean(_) => "boolean",
            TypedColumn::Text(_) => "string",
        }
    }

    fn provisional_role(&self) -> Role {
        match self.typed {
            TypedColumn::Numeric(_) => Role::Numeric,
            TypedColumn::Datetime(_) => Role::Datetime,
            TypedColumn::Boolean(_) => Role::Boolean,
            TypedColumn::Text(_) => Role::Categorical,
        }
    }

    fn decimal_convention(&self) -> Option<String> {
        match self.conventions.len() {
            0 => None,
            1 => Some(self.conventions.iter().next().unwrap().to_string()),
            _ => Some("mixed".to_string()),
        }
    }
}

fn finalize_role(
    outcome: &ColumnOutcome,
    cardinality: usize,
    null_count: usize,
    row_count: usize,
) -> Role {
    match outcome.typed {
        TypedColumn::Text(_)
            if row_count > 0 && null_count == 0 && cardinality == row_count =>
        {
            Role::Identifier
        }
        _ => outcome.provisional_role(),
    }
}

/// Run the coercion ladder for one column: numeric, datetime, boolean, text.
fn coerce_column(name: &str, cells: &[Option<String>]) -> ColumnOutcome {
    let percent_header = PERCENT_HEADER_RE.is_match(name);

    if let Some(outcome) = try_numeric(name, cells, percent_header) {
        return outcome;
    }
    if let Some(outcome) = try_datetime(name, cells) {
        return outcome;
    }
    if let Some(outcome) = try_boolean(cells) {
        return outcome;
    }

    ColumnOutcome {
        typed: TypedColumn::Text(cells.to_vec()),
        coercions: Coercions::default(),
        conventions: BTreeSet::new(),
        currencies: BTreeSet::new(),
        warnings: Vec::new(),
    }
}

struct ParsedNumber {
    value: f64,
    currency: Vec<char>,
    parens: bool,
    scaled: bool,
    unicode_minus: bool,
    percent: bool,
    convention: Option<&'static str>,
}

fn try_numeric(name: &str, cells: &[Option<String>], percent_header: bool) -> Option<ColumnOutcome> {
    let mut values: Vec<Option<f64>> = Vec::with_capacity(cells.len());
    let mut coercions = Coercions::default();
    let mut conventions: BTreeSet<&'static str> = BTreeSet::new();
    let mut currencies: BTreeSet<String> = BTreeSet::new();
    let mut parsed = 0u64;
    let mut failed = 0u64;

    for cell in cells {
        let raw = match cell {
            Some(raw) if !raw.trim().is_empty() => raw,
            _ => {
                values.push(None);
                continue;
            }
        };

        match parse_numeric_cell(raw) {
            Some(number) => {
                parsed += 1;
                if !number.currency.is_empty() {
                    coercions.currency_removed += 1;
                    for symbol in &number.currency {
                        currencies.insert(symbol.to_string());
                    }
                }
                if number.parens {
                    coercions.parentheses_to_negative += 1;
                }
                if number.scaled {
                    coercions.scaling_applied += 1;
                }
                if number.unicode_minus {
                    coercions.unicode_minus_normalized += 1;
                }
                if number.percent {
                    coercions.percent_normalized += 1;
                }
                if let Some(convention) = number.convention {
                    conventions.insert(convention);
                }
                values.push(Some(number.value));
            }
            None => {
                failed += 1;
                values.push(None);
            }
        }
    }

    let considered = parsed + failed;
    if parsed == 0 || considered == 0 {
        return None;
    }
    if failed as f64 / considered as f64 > NUMERIC_FAILURE_CEILING {
        return None;
    }
    coercions.failed_numeric = failed;

    // Header-declared percent columns: values in (1, 100] are rescaled,
    // values already in [0, 1] pass through.
    if percent_header {
        for value in values.iter_mut().flatten() {
            if *value > 1.0 && *value <= 100.0 {
                *value /= 100.0;
                coercions.percent_normalized += 1;
            }
        }
    }

    let mut warnings = Vec::new();
    if conventions.len() > 1 {
        warnings.push(format!(
            "Mixed decimal conventions within column '{}'",
            name
        ));
    }
    if currencies.len() > 1 {
        warnings.push("Multi-currency data detected".to_string());
    }

    Some(ColumnOutcome {
        typed: TypedColumn::Numeric(values),
        coercions,
        conventions,
        currencies,
        warnings,
    })
}

/// Parse one cell to a float, recording which cleanups fired.
fn parse_numeric_cell(raw: &str) -> Option<ParsedNumber> {
    let mut s = raw.trim().to_string();
    let mut currency: Vec<char> = Vec::new();
    let mut parens = false;
    let mut unicode_minus = false;
    let mut percent = false;
    let mut negative = false;

    if s.contains('\u{2212}') {
        s = s.replace('\u{2212}', "-");
        unicode_minus = true;
    }

    if let Some(stripped) = s.strip_suffix('%') {
        percent = true;
        s = stripped.trim().to_string();
    }

    strip_currency(&mut s, &mut currency);

    if s.starts_with('(') && s.ends_with(')') && s.len() >= 2 {
        parens = true;
        negative = true;
        s = s[1..s.len() - 1].trim().to_string();
    }

    strip_currency(&mut s, &mut currency);

    if let Some(stripped) = s.strip_suffix('-') {
        negative = true;
        s = stripped.trim().to_string();
    }

    let mut scale = 1.0f64;
    let mut scaled = false;
    if let Some(caps) = SCALE_SUFFIX_RE.captures(&s) {
        let suffix = caps.get(2).unwrap().as_str();
        scale = match suffix {
            "k" | "K" => 1e3,
            "m" | "M" | "mm" => 1e6,
            "b" | "B" | "bn" => 1e9,
            _ => 1.0,
        };
        scaled = true;
        s = caps.get(1).unwrap().as_str().trim().to_string();
    }

    // Whitespace (incl. NBSP / NNBSP) and apostrophes act as thousands
    // separators in several locales.
    s.retain(|c| !c.is_whitespace() && c != '\u{00A0}' && c != '\u{202F}' && c != '\'');

    let mut convention: Option<&'static str> = None;
    if s.contains('.') && s.contains(',') {
        let last_dot = s.rfind('.').unwrap();
        let last_comma = s.rfind(',').unwrap();
        if last_dot > last_comma {
            s = s.replace(',', "");
            convention = Some("US");
        } else {
            s = s.replace('.', "").replace(',', ".");
            convention = Some("EU");
        }
    } else if s.contains(',') {
        if EU_DECIMAL_COMMA_RE.is_match(&s) {
            s = s.replace(',', ".");
            convention = Some("EU");
        } else {
            s = s.replace(',', "");
            convention = Some("US");
        }
    }

    let mut value: f64 = s.parse().ok()?;
    value *= scale;
    if negative && value > 0.0 {
        value = -value;
    }
    if percent {
        value /= 100.0;
    }

    Some(ParsedNumber {
        value,
        currency,
        parens,
        scaled,
        unicode_minus,
        percent,
        convention,
    })
}

/// Strip at most one leading and one trailing currency symbol.
fn strip_currency(s: &mut String, seen: &mut Vec<char>) {
    if let Some(first) = s.chars().next() {
        if CURRENCY_SYMBOLS.contains(&first) {
            seen.push(first);
            *s = s[first.len_utf8()..].trim().to_string();
        }
    }
    if let Some(last) = s.chars().last() {
        if CURRENCY_SYMBOLS.contains(&last) {
            seen.push(last);
            *s = s[..s.len() - last.len_utf8()].trim().to_string();
        }
    }
}

fn try_datetime(name: &str, cells: &[Option<String>]) -> Option<ColumnOutcome> {
    let header_temporal = TEMPORAL_HEADER_RE.is_match(name);

    let mut values: Vec<Option<i64>> = Vec::with_capacity(cells.len());
    let mut formats_seen: BTreeSet<usize> = BTreeSet::new();
    let mut parsed = 0u64;
    let mut non_null = 0u64;

    for cell in cells {
        let raw = match cell {
            Some(raw) if !raw.trim().is_empty() => raw.trim(),
            _ => {
                values.push(None);
                continue;
            }
        };
        non_null += 1;
        match parse_datetime_cell(raw) {
            Some((ms, format_idx)) => {
                parsed += 1;
                formats_seen.insert(format_idx);
                values.push(Some(ms));
            }
            None => values.push(None),
        }
    }

    if non_null == 0 || parsed == 0 {
        return None;
    }
    let ratio = parsed as f64 / non_null as f64;
    if !header_temporal && ratio < DATETIME_COVERAGE_FLOOR {
        return None;
    }

    let mut coercions = Coercions::default();
    coercions.datetime_parsed = parsed;

    let mut warnings = Vec::new();
    if formats_seen.len() > 1 {
        warnings.push("Ambiguous date formats; defaulted to dayfirst=False".to_string());
    }

    Some(ColumnOutcome {
        typed: TypedColumn::Datetime(values),
        coercions,
        conventions: BTreeSet::new(),
        currencies: BTreeSet::new(),
        warnings,
    })
}

/// Parse with `dayfirst = false`; returns epoch millis and the format index
/// that matched, so mixed-format columns can be flagged.
fn parse_datetime_cell(raw: &str) -> Option<(i64, usize)> {
    for (idx, format) in DATETIME_FORMATS.iter().enumerate() {
        if let Ok(dt) = chrono::NaiveDateTime::parse_from_str(raw, format) {
            return Some((dt.and_utc().timestamp_millis(), idx));
        }
    }
    for (idx, format) in DATE_FORMATS.iter().enumerate() {
        if let Ok(date) = chrono::NaiveDate::parse_from_str(raw, format) {
            let dt = date.and_hms_opt(0, 0, 0)?;
            return Some((dt.and_utc().timestamp_millis(), DATETIME_FORMATS.len() + idx));
        }
    }
    None
}

fn try_boolean(cells: &[Option<String>]) -> Option<ColumnOutcome> {
    let mut values: Vec<Option<bool>> = Vec::with_capacity(cells.len());
    let mut matched = 0u64;
    let mut non_null = 0u64;

    for cell in cells {
        let raw = match cell {
            Some(raw) if !raw.trim().is_empty() => raw.trim().to_lowercase(),
            _ => {
                values.push(None);
                continue;
            }
        };
        non_null += 1;
        let value = match raw.as_str() {
            "true" | "yes" | "y" | "1" => Some(true),
            "false" | "no" | "n" | "0" => Some(false),
            _ => None,
        };
        if value.is_some() {
            matched += 1;
        }
        values.push(value);
    }

    if non_null == 0 || (matched as f64 / non_null as f64) < BOOLEAN_COVERAGE_FLOOR {
        return None;
    }

    let mut coercions = Coercions::default();
    coercions.boolean_coerced = matched;

    Some(ColumnOutcome {
        typed: TypedColumn::Boolean(values),
        coercions,
        conventions: BTreeSet::new(),
        currencies: BTreeSet::new(),
        warnings: Vec::new(),
    })
}

fn non_null_cardinality(series: &Series) -> Result<usize> {
    let unique = series.n_unique()?;
    Ok(if series.null_count() > 0 {
        unique.saturating_sub(1)
    } else {
        unique
    })
}

fn has_negative(series: &Series) -> Result<bool> {
    let floats = series.f64()?;
    Ok(floats.into_iter().flatten().any(|v| v < 0.0))
}
