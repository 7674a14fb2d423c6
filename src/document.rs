//! Loaded documents and their content fingerprints.

use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use crate::classifier::category_from_hint;
use crate::error::{DashboardError, Result};
use crate::sheet_parser;

/// A record is one mapping from field name to value.
pub type Record = Map<String, Value>;

/// One parsed JSON/tabular payload.
///
/// The payload is kept as loaded; it is validated into records by the schema
/// analyzer, which is the stage allowed to reject it.
#[derive(Debug, Clone)]
pub struct Document {
    pub source_key: String,
    pub fingerprint: String,
    /// Worksheet name when the document came from a multi-sheet workbook.
    pub sheet: Option<String>,
    pub payload: Value,
}

impl Document {
    /// Parse raw bytes into one or more documents, dispatching by extension.
    ///
    /// Workbooks yield one document per worksheet, keyed `"{key}#{sheet}"`.
    pub fn load(source_key: &str, data: &[u8]) -> Result<Vec<Document>> {
        let ext = extension(source_key);
        let fp = fingerprint(data);

        match ext.as_str() {
            "json" => {
                let payload: Value = serde_json::from_slice(data)
                    .map_err(|e| DashboardError::malformed(source_key, e.to_string()))?;
                Ok(vec![Document {
                    source_key: source_key.to_string(),
                    fingerprint: fp,
                    sheet: None,
                    payload,
                }])
            }
            "csv" | "xlsx" | "xlsm" | "xlsb" => {
                let sheets = sheet_parser::parse_file(source_key, data)
                    .map_err(|e| DashboardError::malformed(source_key, format!("{:#}", e)))?;
                let multi = sheets.len() > 1 || ext != "csv";

                Ok(sheets
                    .into_iter()
                    .map(|sheet| {
                        let (key, fingerprint, sheet_name) = if multi {
                            (
                                format!("{}#{}", source_key, sheet.name),
                                fingerprint_parts(&[data, sheet.name.as_bytes()]),
                                Some(sheet.name.clone()),
                            )
                        } else {
                            (source_key.to_string(), fp.clone(), None)
                        };
                        Document {
                            source_key: key,
                            fingerprint,
                            sheet: sheet_name,
                            payload: Value::Array(
                                sheet.into_records().into_iter().map(Value::Object).collect(),
                            ),
                        }
                    })
                    .collect())
            }
            _ => Err(DashboardError::UnsupportedFormat(format!(
                ".{} (supported: .json, .csv, .xlsx, .xlsm, .xlsb)",
                ext
            ))),
        }
    }

    /// Build a document from an already-parsed value. The fingerprint covers
    /// the serialized form.
    #[cfg(test)]
    pub fn from_value(source_key: impl Into<String>, payload: Value) -> Self {
        let bytes = serde_json::to_vec(&payload).unwrap_or_default();
        Self {
            source_key: source_key.into(),
            fingerprint: fingerprint(&bytes),
            sheet: None,
            payload,
        }
    }

    /// Validate the payload as a non-empty sequence of mappings.
    pub fn records(&self) -> Result<Vec<&Record>> {
        let items = self.payload.as_array().ok_or_else(|| {
            DashboardError::malformed(
                &self.source_key,
                format!("expected an array of records, found {}", value_kind(&self.payload)),
            )
        })?;

        if items.is_empty() {
            return Err(DashboardError::malformed(&self.source_key, "document has zero records"));
        }

        items
            .iter()
            .enumerate()
            .map(|(i, item)| {
                item.as_object().ok_or_else(|| {
                    DashboardError::malformed(
                        &self.source_key,
                        format!("record {} is {}, not a mapping", i, value_kind(item)),
                    )
                })
            })
            .collect()
    }

    /// Naming hint for the classifier: the worksheet name when it implies a
    /// category, otherwise the file name.
    pub fn naming_hint(&self) -> String {
        match &self.sheet {
            Some(sheet) if category_from_hint(sheet).is_some() => sheet.clone(),
            _ => file_name(&self.source_key).to_string(),
        }
    }

    /// Human-readable title for a dashboard tab.
    pub fn title(&self) -> String {
        let name = match &self.sheet {
            Some(sheet) => sheet.clone(),
            None => file_name(&self.source_key).to_string(),
        };
        let stem = name.rsplit_once('.').map(|(s, _)| s).unwrap_or(&name);
        stem.replace(['_', '-'], " ").trim().to_string()
    }
}

/// SHA-256 hex digest of raw bytes.
pub fn fingerprint(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}

fn fingerprint_parts(parts: &[&[u8]]) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part);
        hasher.update([0u8]);
    }
    format!("{:x}", hasher.finalize())
}

/// Last path segment of an object key or file path.
pub fn file_name(key: &str) -> &str {
    let key = key.split('#').next().unwrap_or(key);
    key.rsplit(['/', '\\']).next().unwrap_or(key)
}

/// Lowercased extension, ignoring any `#sheet` suffix.
pub fn extension(key: &str) -> String {
    file_name(key)
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_lowercase())
        .unwrap_or_default()
}

fn value_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_load_json_array() {
        let data = br#"[{"customer": "Acme", "revenue": 10}]"#;
        let docs = Document::load("data/A._Quarterly.json", data).unwrap();
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].fingerprint, fingerprint(data));
        assert_eq!(docs[0].records().unwrap().len(), 1);
        assert_eq!(docs[0].naming_hint(), "A._Quarterly.json");
    }

    #[test]
    fn test_invalid_json_is_malformed() {
        let err = Document::load("broken.json", b"{not json").unwrap_err();
        assert!(matches!(err, DashboardError::MalformedDocument { .. }));
    }

    #[test]
    fn test_load_csv_as_records() {
        let docs = Document::load("country.csv", b"country,revenue\nIndia,100\nCanada,50\n").unwrap();
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].source_key, "country.csv");
        let records = docs[0].records().unwrap();
        assert_eq!(records[0]["country"], json!("India"));
        assert_eq!(records[0]["revenue"], json!(100.0));
    }

    #[test]
    fn test_unsupported_extension() {
        let err = Document::load("notes.txt", b"hello").unwrap_err();
        assert!(matches!(err, DashboardError::UnsupportedFormat(_)));
    }

    #[test]
    fn test_records_rejects_non_sequences() {
        let doc = Document::from_value("single.json", json!({"a": 1}));
        assert!(doc.records().is_err());

        let doc = Document::from_value("empty.json", json!([]));
        assert!(doc.records().is_err());

        let doc = Document::from_value("scalars.json", json!([1, 2, 3]));
        assert!(doc.records().is_err());
    }

    #[test]
    fn test_fingerprint_changes_with_content() {
        let a = Document::from_value("a.json", json!([{"x": 1}]));
        let b = Document::from_value("a.json", json!([{"x": 2}]));
        assert_ne!(a.fingerprint, b.fingerprint);
    }

    #[test]
    fn test_workbook_hint_prefers_meaningful_sheet_name() {
        let mut doc = Document::from_value(
            "portfolio/A._Quarterly_Revenue_and_QoQ_growth.xlsx#Sheet1",
            json!([]),
        );
        doc.sheet = Some("Sheet1".to_string());
        assert_eq!(doc.naming_hint(), "A._Quarterly_Revenue_and_QoQ_growth.xlsx");
        assert_eq!(doc.title(), "Sheet1");

        doc.sheet = Some("Churn Bridge".to_string());
        assert_eq!(doc.naming_hint(), "Churn Bridge");
    }

    #[test]
    fn test_title_and_file_name() {
        let doc = Document::from_value("bucket/portfolio/C._Country_wise.json", json!([]));
        assert_eq!(doc.title(), "C. Country wise");
        assert_eq!(file_name("a/b/c.xlsx#Sheet1"), "c.xlsx");
        assert_eq!(extension("a/b/c.XLSX#Sheet1"), "xlsx");
    }
}
