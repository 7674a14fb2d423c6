//! Schema inference over loaded documents.
//!
//! Every field gets exactly one [`FieldKind`], tested in a fixed priority
//! order so the same input always yields the same summary.

use std::collections::HashSet;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::document::{Document, Record};
use crate::error::{DashboardError, Result};

/// Maximum records inspected for kind inference.
pub const SCHEMA_SAMPLE_ROWS: usize = 100;

/// Distinct/non-null ratio below which a text field is categorical.
const CATEGORICAL_RATIO: f64 = 0.5;

const SAMPLE_VALUES: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldKind {
    Numeric,
    DateLike,
    Percentage,
    Categorical,
    Identifier,
    Unknown,
}

impl FieldKind {
    pub fn is_measure(self) -> bool {
        matches!(self, Self::Numeric | Self::Percentage)
    }

    pub fn is_label(self) -> bool {
        matches!(self, Self::DateLike | Self::Categorical | Self::Identifier)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NumericStats {
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub sum: f64,
    pub has_negative: bool,
}

/// Per-field observations from the sampled records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldProfile {
    pub name: String,
    pub kind: FieldKind,
    pub non_null: usize,
    pub distinct: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub numeric: Option<NumericStats>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub samples: Vec<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaSummary {
    /// Fields in first-seen order.
    pub fields: Vec<FieldProfile>,
    pub record_count: usize,
    pub sampled: usize,
    /// 1 for flat records, +1 per level of nested objects/arrays.
    pub max_depth: usize,
    /// 0-100.
    pub confidence: u8,
}

impl SchemaSummary {
    pub fn field(&self, name: &str) -> Option<&FieldProfile> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn fields_of_kind(&self, kind: FieldKind) -> Vec<&str> {
        self.fields
            .iter()
            .filter(|f| f.kind == kind)
            .map(|f| f.name.as_str())
            .collect()
    }
}

/// Infer the structural summary of a document.
///
/// Fails with `MalformedDocument` when the payload is not a non-empty array of
/// mappings or when the records carry no fields at all.
pub fn analyze(document: &Document) -> Result<SchemaSummary> {
    let records = document.records()?;
    let sample: Vec<&Record> = records.iter().take(SCHEMA_SAMPLE_ROWS).copied().collect();

    let mut names: Vec<&str> = Vec::new();
    let mut seen: HashSet<&str> = HashSet::new();
    for record in &sample {
        for key in record.keys() {
            if seen.insert(key.as_str()) {
                names.push(key.as_str());
            }
        }
    }

    if names.is_empty() {
        return Err(DashboardError::malformed(
            &document.source_key,
            "records contain no fields",
        ));
    }

    let fields: Vec<FieldProfile> = names
        .iter()
        .map(|name| profile_field(name, &sample))
        .collect();

    let max_depth = sample
        .iter()
        .map(|r| 1 + r.values().map(depth).max().unwrap_or(0))
        .max()
        .unwrap_or(1);

    let confidence = confidence_score(&fields);

    debug!(
        "Analyzed '{}': {} records, {} fields, depth {}, confidence {}",
        document.source_key,
        records.len(),
        fields.len(),
        max_depth,
        confidence
    );

    Ok(SchemaSummary {
        fields,
        record_count: records.len(),
        sampled: sample.len(),
        max_depth,
        confidence,
    })
}

fn profile_field(name: &str, sample: &[&Record]) -> FieldProfile {
    let values: Vec<&Value> = sample
        .iter()
        .filter_map(|r| r.get(name))
        .filter(|v| !is_blank(v))
        .collect();

    let distinct = values
        .iter()
        .map(|v| match v {
            Value::String(s) => s.trim().to_string(),
            other => other.to_string(),
        })
        .collect::<HashSet<_>>()
        .len();

    let numbers: Vec<f64> = values.iter().filter_map(|v| parse_number(v)).collect();
    let kind = infer_kind(name, &values, numbers.len(), distinct);

    let numeric = (kind == FieldKind::Numeric && !numbers.is_empty()).then(|| {
        let sum: f64 = numbers.iter().sum();
        NumericStats {
            min: numbers.iter().copied().fold(f64::INFINITY, f64::min),
            max: numbers.iter().copied().fold(f64::NEG_INFINITY, f64::max),
            mean: sum / numbers.len() as f64,
            sum,
            has_negative: numbers.iter().any(|n| *n < 0.0),
        }
    });

    FieldProfile {
        name: name.to_string(),
        kind,
        non_null: values.len(),
        distinct,
        numeric,
        samples: values.iter().take(SAMPLE_VALUES).map(|v| (*v).clone()).collect(),
    }
}

fn infer_kind(name: &str, values: &[&Value], numeric_count: usize, distinct: usize) -> FieldKind {
    if values.is_empty() || values.iter().any(|v| v.is_object() || v.is_array()) {
        return FieldKind::Unknown;
    }

    if numeric_count == values.len() {
        return FieldKind::Numeric;
    }

    if values.iter().all(|v| v.as_str().map(is_date_like).unwrap_or(false)) {
        return FieldKind::DateLike;
    }

    let has_percent_marker = values
        .iter()
        .any(|v| v.as_str().map(|s| s.contains('%')).unwrap_or(false));
    if has_percent_marker || is_ratio_name(name) {
        return FieldKind::Percentage;
    }

    if (distinct as f64) < values.len() as f64 * CATEGORICAL_RATIO {
        return FieldKind::Categorical;
    }

    if is_identifier_name(name) {
        return FieldKind::Identifier;
    }

    FieldKind::Unknown
}

fn confidence_score(fields: &[FieldProfile]) -> u8 {
    let mut score = 0usize;
    if fields.iter().any(|f| f.kind.is_measure()) {
        score += 30;
    }
    score += (fields.len() * 2).min(20);
    let recognized = fields.iter().filter(|f| f.kind != FieldKind::Unknown).count();
    score += (recognized * 5).min(30);
    if fields.iter().any(|f| f.kind.is_label()) {
        score += 20;
    }
    score.min(100) as u8
}

fn is_blank(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.trim().is_empty(),
        _ => false,
    }
}

fn depth(value: &Value) -> usize {
    match value {
        Value::Object(map) => 1 + map.values().map(depth).max().unwrap_or(0),
        Value::Array(items) => 1 + items.iter().map(depth).max().unwrap_or(0),
        _ => 0,
    }
}

/// Read a JSON number, or a string holding one once currency symbols,
/// thousands separators and accounting parentheses are removed.
pub fn parse_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => parse_numeric_text(s),
        _ => None,
    }
}

fn parse_numeric_text(raw: &str) -> Option<f64> {
    let mut text = raw.trim();
    let negative = text.starts_with('(') && text.ends_with(')');
    if negative {
        text = &text[1..text.len() - 1];
    }
    let cleaned: String = text
        .chars()
        .filter(|c| !matches!(c, '$' | '€' | '£' | '₹' | ',' | ' ' | '\u{a0}'))
        .collect();
    if cleaned.is_empty() || !cleaned.chars().any(|c| c.is_ascii_digit()) {
        return None;
    }
    let n: f64 = cleaned.parse().ok()?;
    if !n.is_finite() {
        return None;
    }
    Some(if negative { -n } else { n })
}

fn date_patterns() -> &'static [Regex] {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            // 2024-03-01, 2024-03, 2024-03-01T10:00:00Z
            r"^\d{4}-\d{1,2}(-\d{1,2})?([T ]\d{1,2}:\d{2}(:\d{2}(\.\d+)?)?(Z|[+-]\d{2}:?\d{2})?)?$",
            // 01/03/2024, 1-3-24, 01.03.2024
            r"^\d{1,2}[/.-]\d{1,2}[/.-](\d{2}|\d{4})$",
            // 03/2024, 3-2024
            r"^\d{1,2}[/-]\d{4}$",
            // Jan, January 2024, Sep-24, Mar '24
            r"(?i)^(jan(uary)?|feb(ruary)?|mar(ch)?|apr(il)?|may|june?|july?|aug(ust)?|sep(t(ember)?)?|oct(ober)?|nov(ember)?|dec(ember)?)\.?([\s/,'-]+'?(\d{2}|\d{4}))?$",
            // Q3, Q3 2024, Q3-24, 2024 Q3
            r"(?i)^(q[1-4]([\s'-]+'?(\d{2}|\d{4}))?|\d{4}[\s-]*q[1-4])$",
        ]
        .iter()
        .map(|p| Regex::new(p).expect("date pattern must compile"))
        .collect()
    })
}

pub fn is_date_like(raw: &str) -> bool {
    let text = raw.trim();
    !text.is_empty() && date_patterns().iter().any(|re| re.is_match(text))
}

/// Lowercase alphanumeric words of a field name.
pub fn name_tokens(name: &str) -> Vec<String> {
    name.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}

/// Whether a field name carries any of the keywords. Alphanumeric keywords
/// of three characters or fewer (`q3`, `mom`, `jan`) must match a whole word;
/// symbols such as `%` match anywhere.
pub fn name_matches_any(name: &str, keywords: &[&str]) -> bool {
    let lower = name.to_lowercase();
    let tokens = name_tokens(name);
    keywords.iter().any(|k| {
        if k.chars().count() <= 3 && k.chars().all(char::is_alphanumeric) {
            tokens.iter().any(|t| t == k)
        } else {
            lower.contains(k)
        }
    })
}

fn is_ratio_name(name: &str) -> bool {
    let lower = name.to_lowercase();
    lower.contains('%')
        || ["percent", "rate", "ratio", "share", "growth"]
            .iter()
            .any(|k| lower.contains(k))
}

fn is_identifier_name(name: &str) -> bool {
    let lower = name.to_lowercase();
    name_tokens(name).iter().any(|t| t == "id")
        || name.ends_with("Id")
        || ["name", "customer", "client", "company", "account"]
            .iter()
            .any(|k| lower.contains(k))
}
