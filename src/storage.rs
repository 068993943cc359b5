//! Typed table I/O and digest computation.
//!
//! Delimited and spreadsheet reads deliberately produce all-string tables:
//! type coercion is owned by the normalizer so every cleaning decision is
//! counted and auditable. The columnar (parquet) round-trip preserves the
//! typed table exactly.

use std::fs::File;
use std::path::Path;

use calamine::{open_workbook_auto, Data, Reader};
use polars::prelude::*;
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::error::{EngineError, Result};

/// Read a delimited text file into an all-string table.
///
/// Empty unquoted fields become null; leading zeros survive because schema
/// inference is disabled. Files over `max_bytes` fail before any parse.
pub fn read_delimited(path: &Path, max_bytes: Option<u64>) -> Result<DataFrame> {
    check_size(path, max_bytes)?;

    let df = LazyCsvReader::new(path)
        .with_has_header(true)
        .with_infer_schema_length(Some(0))
        .finish()?
        .collect()?;

    debug!(rows = df.height(), columns = df.width(), "read delimited file");
    Ok(df)
}

/// Read a spreadsheet sheet into an all-string table.
///
/// The first row supplies headers. Blank cells are null; an explicit empty
/// string cell stays an empty string. Integral numeric cells render without
/// a trailing `.0` so years and identifiers keep their source form.
pub fn read_spreadsheet(path: &Path, sheet: Option<&str>, max_bytes: Option<u64>) -> Result<DataFrame> {
    check_size(path, max_bytes)?;

    let mut workbook = open_workbook_auto(path)?;
    let sheet_name = match sheet {
        Some(name) => name.to_string(),
        None => workbook
            .sheet_names()
            .first()
            .cloned()
            .ok_or_else(|| EngineError::Validation("Workbook has no sheets".to_string()))?,
    };
    let range = workbook
        .worksheet_range(&sheet_name)
        .map_err(|e| EngineError::Validation(format!("Sheet '{}' not readable: {}", sheet_name, e)))?;

    let mut rows = range.rows();
    let header_row = rows
        .next()
        .ok_or_else(|| EngineError::Validation(format!("Sheet '{}' is empty", sheet_name)))?;

    let headers: Vec<String> = header_row
        .iter()
        .map(|cell| cell_to_string(cell).unwrap_or_default())
        .collect();

    let mut columns: Vec<Vec<Option<String>>> = vec![Vec::new(); headers.len()];
    for row in rows {
        for (idx, column) in columns.iter_mut().enumerate() {
            column.push(row.get(idx).and_then(cell_to_string));
        }
    }

    let series: Vec<Series> = headers
        .iter()
        .zip(columns)
        .map(|(name, cells)| Series::new(name, cells))
        .collect();

    let df = DataFrame::new(series)?;
    debug!(rows = df.height(), columns = df.width(), sheet = %sheet_name, "read spreadsheet");
    Ok(df)
}

fn cell_to_string(cell: &Data) -> Option<String> {
    match cell {
        Data::Empty => None,
        Data::String(s) => Some(s.clone()),
        Data::Float(f) => Some(format_float(*f)),
        Data::Int(i) => Some(i.to_string()),
        Data::Bool(b) => Some(b.to_string()),
        Data::DateTime(dt) => dt
            .as_datetime()
            .map(|naive| naive.format("%Y-%m-%d %H:%M:%S").to_string()),
        Data::DateTimeIso(s) => Some(s.clone()),
        Data::DurationIso(s) => Some(s.clone()),
        Data::Error(e) => Some(format!("{:?}", e)),
    }
}

/// Render an f64 the way the cell was typed: integral values without `.0`.
pub fn format_float(value: f64) -> String {
    if value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{}", value as i64)
    } else {
        format!("{}", value)
    }
}

/// Read the canonical columnar file. Missing target is `NotFound`.
pub fn read_columnar(path: &Path) -> Result<DataFrame> {
    if !path.exists() {
        return Err(EngineError::NotFound(format!(
            "Columnar file not found: {}",
            path.display()
        )));
    }
    let file = File::open(path)?;
    Ok(ParquetReader::new(file).finish()?)
}

/// Write the canonical columnar file through temp-and-rename so readers
/// never observe a torn file.
pub fn write_columnar(df: &mut DataFrame, path: &Path) -> Result<()> {
    let tmp = temp_sibling(path);
    {
        let mut file = File::create(&tmp)?;
        ParquetWriter::new(&mut file).finish(df)?;
    }
    std::fs::rename(&tmp, path)?;
    Ok(())
}

pub fn write_delimited(df: &mut DataFrame, path: &Path) -> Result<()> {
    let mut file = File::create(path)?;
    CsvWriter::new(&mut file).include_header(true).finish(df)?;
    Ok(())
}

/// Write an ordered set of sheets as a workbook. Null cells are left empty.
pub fn write_spreadsheet(sheets: &[(String, DataFrame)], path: &Path) -> Result<()> {
    let mut workbook = rust_xlsxwriter::Workbook::new();

    for (sheet_name, df) in sheets {
        let worksheet = workbook.add_worksheet();
        worksheet.set_name(sheet_name)?;

        for (col_idx, name) in df.get_column_names().iter().enumerate() {
            worksheet.write_string(0, col_idx as u16, *name)?;
        }

        for col_idx in 0..df.width() {
            let series = &df.get_columns()[col_idx];
            for row_idx in 0..df.height() {
                let value = series.get(row_idx)?;
                write_cell(worksheet, (row_idx + 1) as u32, col_idx as u16, value)?;
            }
        }
    }

    workbook.save(path)?;
    Ok(())
}

fn write_cell(
    worksheet: &mut rust_xlsxwriter::Worksheet,
    row: u32,
    col: u16,
    value: AnyValue,
) -> Result<()> {
    match value {
        AnyValue::Null => {}
        AnyValue::Boolean(b) => {
            worksheet.write_boolean(row, col, b)?;
        }
        AnyValue::Float64(f) => {
            worksheet.write_number(row, col, f)?;
        }
        AnyValue::Float32(f) => {
            worksheet.write_number(row, col, f as f64)?;
        }
        AnyValue::Int64(i) => {
            worksheet.write_number(row, col, i as f64)?;
        }
        AnyValue::Int32(i) => {
            worksheet.write_number(row, col, i as f64)?;
        }
        AnyValue::UInt64(u) => {
            worksheet.write_number(row, col, u as f64)?;
        }
        AnyValue::UInt32(u) => {
            worksheet.write_number(row, col, u as f64)?;
        }
        AnyValue::String(s) => {
            worksheet.write_string(row, col, s)?;
        }
        other => {
            worksheet.write_string(row, col, format!("{}", other))?;
        }
    }
    Ok(())
}

/// SHA-256 of a file as 64 lowercase hex chars.
pub fn sha256(path: &Path) -> Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    std::io::copy(&mut file, &mut hasher)?;
    Ok(format!("{:x}", hasher.finalize()))
}

/// Persist raw upload bytes and return their digest.
pub fn save_upload(bytes: &[u8], path: &Path) -> Result<String> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = temp_sibling(path);
    std::fs::write(&tmp, bytes)?;
    std::fs::rename(&tmp, path)?;
    sha256(path)
}

fn check_size(path: &Path, max_bytes: Option<u64>) -> Result<()> {
    if let Some(limit) = max_bytes {
        let size = std::fs::metadata(path)?.len();
        if size > limit {
            return Err(EngineError::PayloadTooLarge(format!(
                "File exceeds size limit: {} > {} bytes",
                size, limit
            )));
        }
    }
    Ok(())
}

fn temp_sibling(path: &Path) -> std::path::PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "artifact".to_string());
    name.push_str(".tmp");
    path.with_file_name(name)
}
