//! Tabular parsing for CSV and Excel (.xlsx/.xlsm/.xlsb) uploads.
//!
//! Each sheet becomes a list of records keyed by the header row, with numeric
//! cells typed as JSON numbers so the schema analyzer sees the same shapes it
//! would get from a JSON export.

use anyhow::{Context, Result};
use calamine::{open_workbook_from_rs, Data, Reader, Xlsb, Xlsx};
use serde_json::{Map, Number, Value};
use std::io::{Cursor, Read, Seek};

/// One worksheet (or CSV file) before conversion to records.
#[derive(Debug, Clone)]
pub struct RawSheet {
    pub name: String,
    pub headers: Vec<String>,
    pub rows: Vec<Vec<Value>>,
}

impl RawSheet {
    /// Zip each row with the headers. Missing trailing cells become null.
    pub fn into_records(self) -> Vec<Map<String, Value>> {
        let headers = self.headers;
        self.rows
            .into_iter()
            .map(|row| {
                let mut cells = row.into_iter();
                headers
                    .iter()
                    .map(|h| (h.clone(), cells.next().unwrap_or(Value::Null)))
                    .collect()
            })
            .collect()
    }
}

/// Dispatch file parsing by extension.
pub fn parse_file(filename: &str, data: &[u8]) -> Result<Vec<RawSheet>> {
    match crate::document::extension(filename).as_str() {
        "csv" => parse_csv(filename, data),
        "xlsx" | "xlsm" => {
            let workbook: Xlsx<_> = open_workbook_from_rs(Cursor::new(data))
                .context("Failed to open Excel workbook")?;
            parse_workbook(workbook)
        }
        "xlsb" => {
            let workbook: Xlsb<_> = open_workbook_from_rs(Cursor::new(data))
                .context("Failed to open Excel workbook")?;
            parse_workbook(workbook)
        }
        other => anyhow::bail!(
            "Unsupported file type: .{}. Supported: .csv, .xlsx, .xlsm, .xlsb",
            other
        ),
    }
}

fn parse_csv(filename: &str, data: &[u8]) -> Result<Vec<RawSheet>> {
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .has_headers(true)
        .from_reader(data);

    let headers = normalize_headers(
        reader
            .headers()
            .context("Failed to read CSV headers")?
            .iter()
            .map(|h| h.to_string()),
    );

    if headers.is_empty() {
        anyhow::bail!("CSV file has no headers");
    }

    let mut rows = Vec::new();
    for result in reader.records() {
        let record = result.context("Failed to read CSV record")?;
        if record.iter().all(|f| f.trim().is_empty()) {
            continue;
        }
        rows.push(record.iter().map(text_cell).collect());
    }

    if rows.is_empty() {
        anyhow::bail!("CSV file has headers but no data rows");
    }

    let name = crate::document::file_name(filename)
        .trim_end_matches(".csv")
        .to_string();

    Ok(vec![RawSheet { name, headers, rows }])
}

/// Every worksheet with a header row and at least one data row becomes a sheet.
fn parse_workbook<RS, R>(mut workbook: R) -> Result<Vec<RawSheet>>
where
    RS: Read + Seek,
    R: Reader<RS>,
{
    let sheet_names: Vec<String> = workbook.sheet_names().to_vec();
    let mut sheets = Vec::new();

    for name in &sheet_names {
        let range = match workbook.worksheet_range(name) {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!("Skipping sheet '{}': {:?}", name, e);
                continue;
            }
        };

        let mut row_iter = range.rows();
        let Some(header_row) = row_iter.next() else {
            continue;
        };
        let headers = normalize_headers(header_row.iter().map(|c| match c {
            Data::Empty => String::new(),
            other => other.to_string(),
        }));

        let rows: Vec<Vec<Value>> = row_iter
            .map(|row| row.iter().map(excel_cell).collect::<Vec<_>>())
            .filter(|values| !values.iter().all(Value::is_null))
            .collect();

        if rows.is_empty() {
            tracing::debug!("Sheet '{}' has no data rows, skipping", name);
            continue;
        }

        sheets.push(RawSheet {
            name: name.clone(),
            headers,
            rows,
        });
    }

    if sheets.is_empty() {
        anyhow::bail!("No sheets with data found in workbook");
    }

    Ok(sheets)
}

/// Blank headers get positional names; repeated headers get a numeric suffix.
fn normalize_headers(raw: impl Iterator<Item = String>) -> Vec<String> {
    let mut headers: Vec<String> = Vec::new();
    for (i, header) in raw.enumerate() {
        let base = match header.trim() {
            "" => format!("column_{}", i + 1),
            h => h.to_string(),
        };
        let mut name = base.clone();
        let mut n = 2;
        while headers.contains(&name) {
            name = format!("{}_{}", base, n);
            n += 1;
        }
        headers.push(name);
    }
    if headers.iter().all(|h| h.starts_with("column_")) {
        return Vec::new();
    }
    headers
}

/// CSV cells are text; plain numbers are typed, blanks become null.
fn text_cell(raw: &str) -> Value {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Value::Null;
    }
    trimmed
        .parse::<f64>()
        .ok()
        .and_then(Number::from_f64)
        .map(Value::Number)
        .unwrap_or_else(|| Value::String(trimmed.to_string()))
}

fn excel_cell(cell: &Data) -> Value {
    match cell {
        Data::Empty => Value::Null,
        Data::String(s) => text_cell(s),
        Data::Int(i) => Value::from(*i),
        Data::Float(f) => Number::from_f64(*f).map(Value::Number).unwrap_or(Value::Null),
        Data::Bool(b) => Value::Bool(*b),
        Data::DateTime(dt) => Value::String(excel_serial_to_date(dt.as_f64())),
        Data::DateTimeIso(s) | Data::DurationIso(s) => Value::String(s.clone()),
        Data::Error(e) => {
            tracing::debug!("Excel cell error {:?} read as null", e);
            Value::Null
        }
    }
}

/// Convert an Excel serial day number to `YYYY-MM-DD`.
///
/// Serial 60 is Excel's phantom 1900-02-29; later serials are shifted by one.
fn excel_serial_to_date(serial: f64) -> String {
    let whole = serial.floor() as i64;
    let adjusted = if whole > 59 { whole - 1 } else { whole };
    // Serial 1 (after adjustment) is 1900-01-01, which is day -25567 from the unix epoch.
    let (y, m, d) = civil_from_days(adjusted - 25568);
    format!("{:04}-{:02}-{:02}", y, m, d)
}

/// Days since 1970-01-01 to a proleptic Gregorian date.
fn civil_from_days(days: i64) -> (i64, u32, u32) {
    let z = days + 719_468;
    let era = z.div_euclid(146_097);
    let doe = z.rem_euclid(146_097);
    let yoe = (doe - doe / 1460 + doe / 36_524 - doe / 146_096) / 365;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let d = (doy - (153 * mp + 2) / 5 + 1) as u32;
    let m = (if mp < 10 { mp + 3 } else { mp - 9 }) as u32;
    let y = yoe + era * 400 + if m <= 2 { 1 } else { 0 };
    (y, m, d)
}
