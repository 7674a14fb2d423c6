//! Resolves a category's recipe against an actual document.
//!
//! Each chart role is bound to a concrete field; charts whose roles cannot be
//! bound are omitted by title instead of failing the plan. Plans are memoized
//! in the shared stage cache under `(source key, fingerprint, "router")`.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use crate::cache::{CacheKey, StageCache, StageOutput, STAGE_ROUTER};
use crate::classifier::{AnalysisCategory, ENTITY_TERMS, GEO_TERMS, PERIOD_TERMS, QUARTER_TERMS, REVENUE_TERMS, SHARE_TERMS};
use crate::document::{Document, Record};
use crate::error::Result;
use crate::recipes::{ChartKind, ChartTemplate, DashboardRecipe, FieldRole, RecipeBook, StatKind, StatSpec};
use crate::schema::{name_matches_any, name_tokens, parse_number, FieldKind, FieldProfile, SchemaSummary};

/// Rows copied into the trailing data table.
pub const TABLE_ROWS: usize = 50;

/// Records carried into the narrative context.
pub const CONTEXT_SAMPLE_ROWS: usize = 50;

const DEFAULT_TOP_N_SHARE: usize = 5;

const GROWTH_TERMS: &[&str] = &["growth", "change", "variance", "delta", "diff"];
const PRIOR_TERMS: &[&str] = &["prior", "previous", "prev", "last", "starting", "beginning", "opening", "start"];
const CURRENT_TERMS: &[&str] = &["current", "latest", "ending", "closing", "end"];
const MOVEMENT_TERMS: &[&str] = &[
    "new", "expansion", "upsell", "contraction", "downsell", "churn", "starting", "beginning",
    "opening", "ending", "closing",
];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataPoint {
    pub label: String,
    pub values: Vec<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedChart {
    pub kind: ChartKind,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub x_field: Option<String>,
    pub y_fields: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub points: Vec<DataPoint>,
    /// Only populated for tables.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rows: Vec<Record>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SummaryStat {
    pub key: String,
    pub label: String,
    pub value: Value,
    pub display: String,
}

/// What the narrative builder needs to describe the dataset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NarrativeContext {
    pub title: String,
    pub record_count: usize,
    pub field_count: usize,
    /// Schema confidence, 0-100.
    pub confidence: u8,
    pub numeric_fields: Vec<String>,
    pub percentage_fields: Vec<String>,
    pub date_fields: Vec<String>,
    pub categorical_fields: Vec<String>,
    pub identifier_fields: Vec<String>,
    pub sample: Vec<Record>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RenderPlan {
    pub source_key: String,
    pub category: AnalysisCategory,
    pub title: String,
    pub charts: Vec<ResolvedChart>,
    pub stats: Vec<SummaryStat>,
    /// Titles of recipe charts whose roles could not be bound.
    pub omitted: Vec<String>,
    pub context: NarrativeContext,
}

impl RenderPlan {
    pub fn stat(&self, key: &str) -> Option<&SummaryStat> {
        self.stats.iter().find(|s| s.key == key)
    }
}

#[derive(Debug, Clone)]
pub struct Router {
    recipes: Arc<RecipeBook>,
    cache: StageCache,
}

impl Router {
    pub fn new(recipes: Arc<RecipeBook>, cache: StageCache) -> Self {
        Self { recipes, cache }
    }

    pub fn recipes(&self) -> &RecipeBook {
        &self.recipes
    }

    /// Plan for `document`, served from cache when a live entry exists.
    pub fn route(
        &self,
        category: AnalysisCategory,
        document: &Document,
        summary: &SchemaSummary,
    ) -> Result<Arc<RenderPlan>> {
        let key = CacheKey::new(&document.source_key, &document.fingerprint, STAGE_ROUTER);
        if let Some(StageOutput::Plan(plan)) = self.cache.get(&key) {
            debug!("Router cache hit for '{}'", document.source_key);
            return Ok(plan);
        }

        let plan = Arc::new(build_plan(self.recipes.get(category), category, document, summary)?);
        self.cache.insert(key, StageOutput::Plan(plan.clone()));
        Ok(plan)
    }
}

/// Compute a plan without touching the cache.
pub fn build_plan(
    recipe: &DashboardRecipe,
    category: AnalysisCategory,
    document: &Document,
    summary: &SchemaSummary,
) -> Result<RenderPlan> {
    let records = document.records()?;
    let bindings = Bindings::new(summary);

    let mut charts = Vec::new();
    let mut omitted = Vec::new();
    for template in &recipe.charts {
        match resolve_chart(template, &bindings, &records) {
            Some(chart) => charts.push(chart),
            None => {
                debug!("Omitting chart '{}' for '{}'", template.title, document.source_key);
                omitted.push(template.title.clone());
            }
        }
    }

    let stats: Vec<SummaryStat> = recipe
        .stats
        .iter()
        .filter_map(|spec| compute_stat(spec, &bindings, &records))
        .collect();

    info!(
        "Routed '{}' as {}: {} charts, {} stats, {} omitted",
        document.source_key,
        category,
        charts.len(),
        stats.len(),
        omitted.len()
    );

    Ok(RenderPlan {
        source_key: document.source_key.clone(),
        category,
        title: recipe.title.clone(),
        charts,
        stats,
        omitted,
        context: narrative_context(document, summary, &records),
    })
}

fn narrative_context(document: &Document, summary: &SchemaSummary, records: &[&Record]) -> NarrativeContext {
    let names = |kind: FieldKind| -> Vec<String> {
        summary.fields_of_kind(kind).into_iter().map(str::to_string).collect()
    };
    NarrativeContext {
        title: document.title(),
        record_count: summary.record_count,
        field_count: summary.fields.len(),
        confidence: summary.confidence,
        numeric_fields: names(FieldKind::Numeric),
        percentage_fields: names(FieldKind::Percentage),
        date_fields: names(FieldKind::DateLike),
        categorical_fields: names(FieldKind::Categorical),
        identifier_fields: names(FieldKind::Identifier),
        sample: records.iter().take(CONTEXT_SAMPLE_ROWS).map(|r| (*r).clone()).collect(),
    }
}

// ---------------------------------------------------------------------------
// Role binding
// ---------------------------------------------------------------------------

struct Bindings<'a> {
    summary: &'a SchemaSummary,
    period_pair: Option<(String, String)>,
}

impl<'a> Bindings<'a> {
    fn new(summary: &'a SchemaSummary) -> Self {
        Self {
            summary,
            period_pair: period_pair(summary),
        }
    }

    /// Fields bound to `role`, or `None` when nothing qualifies.
    fn resolve(&self, role: FieldRole) -> Option<Vec<String>> {
        let single = |name: Option<&str>| name.map(|n| vec![n.to_string()]);
        match role {
            FieldRole::Entity => single(self.entity()),
            FieldRole::Geography => single(self.first(|f| is_text_label(f) && name_matches_any(&f.name, GEO_TERMS))),
            FieldRole::Period => single(self.period()),
            FieldRole::Measure => single(self.measure()),
            FieldRole::PriorPeriod => self.period_pair.as_ref().map(|(p, _)| vec![p.clone()]),
            FieldRole::CurrentPeriod => self.period_pair.as_ref().map(|(_, c)| vec![c.clone()]),
            FieldRole::Growth => single(self.first(|f| f.kind.is_measure() && name_matches_any(&f.name, GROWTH_TERMS))),
            FieldRole::Share => single(self.first(|f| f.kind.is_measure() && name_matches_any(&f.name, SHARE_TERMS))),
            FieldRole::Movement => {
                let fields: Vec<String> = self
                    .summary
                    .fields
                    .iter()
                    .filter(|f| f.kind == FieldKind::Numeric && name_matches_any(&f.name, MOVEMENT_TERMS))
                    .map(|f| f.name.clone())
                    .collect();
                (fields.len() >= 2).then_some(fields)
            }
            FieldRole::AnyNumeric => single(self.first(|f| f.kind == FieldKind::Numeric)),
            FieldRole::AnyLabel => single(self.first(is_text_label)),
        }
    }

    fn first(&self, pred: impl Fn(&FieldProfile) -> bool) -> Option<&'a str> {
        self.summary.fields.iter().find(|f| pred(f)).map(|f| f.name.as_str())
    }

    fn entity(&self) -> Option<&'a str> {
        self.first(|f| f.kind == FieldKind::Identifier && name_matches_any(&f.name, ENTITY_TERMS))
            .or_else(|| self.first(|f| f.kind == FieldKind::Identifier))
            .or_else(|| self.first(|f| is_text_label(f) && name_matches_any(&f.name, ENTITY_TERMS)))
    }

    fn period(&self) -> Option<&'a str> {
        self.first(|f| f.kind == FieldKind::DateLike).or_else(|| {
            self.first(|f| {
                is_text_label(f)
                    && (name_matches_any(&f.name, PERIOD_TERMS) || name_matches_any(&f.name, QUARTER_TERMS))
            })
        })
    }

    fn measure(&self) -> Option<&'a str> {
        if let Some((_, current)) = &self.period_pair {
            return self.summary.field(current).map(|f| f.name.as_str());
        }
        let plain = |f: &FieldProfile| {
            f.kind == FieldKind::Numeric
                && !name_matches_any(&f.name, GROWTH_TERMS)
                && !name_matches_any(&f.name, SHARE_TERMS)
        };
        self.first(|f| plain(f) && name_matches_any(&f.name, REVENUE_TERMS))
            .or_else(|| self.first(plain))
            .or_else(|| self.first(|f| f.kind == FieldKind::Numeric))
    }
}

/// Text fields usable as chart labels, including free-text columns whose
/// values were too varied to be categorical.
fn is_text_label(field: &FieldProfile) -> bool {
    field.kind.is_label()
        || (field.kind == FieldKind::Unknown
            && field.non_null > 0
            && field.samples.iter().all(Value::is_string))
}

/// Pick the (prior, current) numeric columns.
///
/// Explicit wording (`starting`/`ending`, `prior`/`current`) wins; otherwise
/// columns tagged with quarters or years are ordered chronologically and the
/// last two are taken.
fn period_pair(summary: &SchemaSummary) -> Option<(String, String)> {
    let numeric: Vec<&FieldProfile> = summary
        .fields
        .iter()
        .filter(|f| f.kind == FieldKind::Numeric && !name_matches_any(&f.name, GROWTH_TERMS))
        .collect();

    let prior = numeric.iter().find(|f| name_matches_any(&f.name, PRIOR_TERMS));
    let current = numeric.iter().find(|f| name_matches_any(&f.name, CURRENT_TERMS));
    if let (Some(p), Some(c)) = (prior, current) {
        if p.name != c.name {
            return Some((p.name.clone(), c.name.clone()));
        }
    }

    let mut tagged: Vec<((u32, u32), &str)> = numeric
        .iter()
        .filter_map(|f| period_tag(&f.name).map(|tag| (tag, f.name.as_str())))
        .collect();
    tagged.sort_by_key(|(tag, _)| *tag);
    let distinct: HashSet<(u32, u32)> = tagged.iter().map(|(tag, _)| *tag).collect();
    if tagged.len() < 2 || distinct.len() < 2 {
        return None;
    }
    let (_, prior) = tagged[tagged.len() - 2];
    let (_, current) = tagged[tagged.len() - 1];
    Some((prior.to_string(), current.to_string()))
}

/// `(year, quarter)` encoded in a column name, `0` where absent.
fn period_tag(name: &str) -> Option<(u32, u32)> {
    let tokens = name_tokens(name);
    let mut year = None;
    let mut quarters = Vec::new();

    for (i, token) in tokens.iter().enumerate() {
        if let Some(q) = token.strip_prefix('q').and_then(|q| q.parse::<u32>().ok()) {
            if (1..=4).contains(&q) {
                quarters.push(q);
            }
        } else if token == "quarter" {
            if let Some(q) = tokens.get(i + 1).and_then(|t| t.parse::<u32>().ok()) {
                if (1..=4).contains(&q) {
                    quarters.push(q);
                }
            }
        } else if let Some(fy) = token.strip_prefix("fy").and_then(|y| y.parse::<u32>().ok()) {
            year = Some(if fy < 100 { 2000 + fy } else { fy });
        } else if token.len() == 4 {
            if let Ok(y) = token.parse::<u32>() {
                if (1990..=2100).contains(&y) {
                    year = Some(y);
                }
            }
        }
    }

    // "Q4 vs Q3" style names compare periods rather than hold one.
    if quarters.len() > 1 {
        return None;
    }
    let quarter = quarters.first().copied();
    if year.is_none() && quarter.is_none() {
        return None;
    }
    Some((year.unwrap_or(0), quarter.unwrap_or(0)))
}

// ---------------------------------------------------------------------------
// Charts
// ---------------------------------------------------------------------------

fn resolve_chart(template: &ChartTemplate, bindings: &Bindings<'_>, records: &[&Record]) -> Option<ResolvedChart> {
    let x_field = match template.x {
        Some(role) => Some(bindings.resolve(role)?.into_iter().next()?),
        None => None,
    };
    let mut y_fields = Vec::new();
    for role in &template.y {
        y_fields.extend(bindings.resolve(*role)?);
    }

    let mut chart = ResolvedChart {
        kind: template.kind,
        title: template.title.clone(),
        x_field: x_field.clone(),
        y_fields: y_fields.clone(),
        points: Vec::new(),
        rows: Vec::new(),
    };

    let needs_axes = !matches!(template.kind, ChartKind::Table | ChartKind::Waterfall);
    if needs_axes && (x_field.is_none() || y_fields.is_empty()) {
        return None;
    }
    let x = x_field.as_deref().unwrap_or_default();

    let mut points = match template.kind {
        ChartKind::Table => {
            chart.y_fields = bindings.summary.fields.iter().map(|f| f.name.clone()).collect();
            chart.rows = records.iter().take(TABLE_ROWS).map(|r| (*r).clone()).collect();
            return Some(chart);
        }
        ChartKind::Waterfall => waterfall(records, &y_fields),
        ChartKind::Line => series(records, x, &y_fields),
        ChartKind::Bar | ChartKind::GroupedBar => {
            let mut points = aggregate(records, x, &y_fields);
            // Periods keep chronological order.
            if template.x != Some(FieldRole::Period) {
                sort_desc(&mut points, y_fields.len() - 1);
            }
            points
        }
        ChartKind::Pie => pie(aggregate(records, x, &y_fields[..1]), template.top_n),
        ChartKind::Treemap => {
            let mut points = aggregate(records, x, &y_fields[..1]);
            points.retain(|p| p.values[0] > 0.0);
            sort_desc(&mut points, 0);
            points
        }
        ChartKind::Pareto => pareto(aggregate(records, x, &y_fields[..1]))?,
        ChartKind::Variance if y_fields.len() >= 2 => variance(aggregate(records, x, &y_fields[..2])),
        ChartKind::Variance => return None,
        ChartKind::Growth if y_fields.len() >= 2 => growth_between(aggregate(records, x, &y_fields[..2])),
        ChartKind::Growth => growth_sequential(aggregate(records, x, &y_fields[..1])),
    };

    if let Some(n) = template.top_n {
        if template.kind != ChartKind::Pie {
            points.truncate(n);
        }
    }
    if points.is_empty() {
        return None;
    }
    chart.points = points;
    Some(chart)
}

fn label_of(value: Option<&Value>) -> String {
    match value {
        None | Some(Value::Null) => "(blank)".to_string(),
        Some(Value::String(s)) if s.trim().is_empty() => "(blank)".to_string(),
        Some(Value::String(s)) => s.trim().to_string(),
        Some(other) => other.to_string(),
    }
}

fn number_of(record: &Record, field: &str) -> Option<f64> {
    record.get(field).and_then(parse_number)
}

fn column(records: &[&Record], field: &str) -> Vec<f64> {
    records.iter().filter_map(|r| number_of(r, field)).collect()
}

/// Sum every series per label, keeping first-seen label order. Records with
/// no value in any series are skipped.
fn aggregate(records: &[&Record], x: &str, ys: &[String]) -> Vec<DataPoint> {
    let mut index: HashMap<String, usize> = HashMap::new();
    let mut points: Vec<DataPoint> = Vec::new();

    for record in records {
        let values: Vec<Option<f64>> = ys.iter().map(|y| number_of(record, y)).collect();
        if values.iter().all(Option::is_none) {
            continue;
        }
        let label = label_of(record.get(x));
        let slot = *index.entry(label.clone()).or_insert_with(|| {
            points.push(DataPoint {
                label,
                values: vec![0.0; ys.len()],
            });
            points.len() - 1
        });
        for (total, value) in points[slot].values.iter_mut().zip(values) {
            *total += value.unwrap_or(0.0);
        }
    }
    points
}

/// Stable descending sort on one series.
fn sort_desc(points: &mut [DataPoint], series: usize) {
    points.sort_by(|a, b| b.values[series].total_cmp(&a.values[series]));
}

/// One point per record, in record order, for records with every series set.
fn series(records: &[&Record], x: &str, ys: &[String]) -> Vec<DataPoint> {
    records
        .iter()
        .filter_map(|record| {
            let values: Option<Vec<f64>> = ys.iter().map(|y| number_of(record, y)).collect();
            values.map(|values| DataPoint {
                label: label_of(record.get(x)),
                values,
            })
        })
        .collect()
}

fn pie(mut points: Vec<DataPoint>, top_n: Option<usize>) -> Vec<DataPoint> {
    points.retain(|p| p.values[0] > 0.0);
    sort_desc(&mut points, 0);
    if let Some(n) = top_n {
        if points.len() > n {
            let other: f64 = points[n..].iter().map(|p| p.values[0]).sum();
            points.truncate(n);
            points.push(DataPoint {
                label: "Other".to_string(),
                values: vec![other],
            });
        }
    }
    points
}

/// Values sorted descending, each with its cumulative share of the positive total.
fn pareto(mut points: Vec<DataPoint>) -> Option<Vec<DataPoint>> {
    sort_desc(&mut points, 0);
    let total: f64 = points.iter().map(|p| p.values[0].max(0.0)).sum();
    if total <= 0.0 {
        return None;
    }
    let mut cumulative = 0.0;
    for point in &mut points {
        cumulative += point.values[0].max(0.0);
        point.values.push(cumulative / total * 100.0);
    }
    Some(points)
}

fn variance(points: Vec<DataPoint>) -> Vec<DataPoint> {
    let mut out: Vec<DataPoint> = points
        .into_iter()
        .map(|p| DataPoint {
            values: vec![p.values[1] - p.values[0]],
            label: p.label,
        })
        .collect();
    sort_desc(&mut out, 0);
    out
}

fn growth_between(points: Vec<DataPoint>) -> Vec<DataPoint> {
    let mut out: Vec<DataPoint> = points
        .into_iter()
        .filter_map(|p| {
            let (prior, current) = (p.values[0], p.values[1]);
            pct_change(prior, current).map(|g| DataPoint {
                label: p.label,
                values: vec![g],
            })
        })
        .collect();
    sort_desc(&mut out, 0);
    out
}

fn growth_sequential(points: Vec<DataPoint>) -> Vec<DataPoint> {
    points
        .windows(2)
        .filter_map(|pair| {
            pct_change(pair[0].values[0], pair[1].values[0]).map(|g| DataPoint {
                label: pair[1].label.clone(),
                values: vec![g],
            })
        })
        .collect()
}

fn waterfall(records: &[&Record], fields: &[String]) -> Vec<DataPoint> {
    fields
        .iter()
        .filter_map(|field| {
            let values = column(records, field);
            (!values.is_empty()).then(|| DataPoint {
                label: field.clone(),
                values: vec![values.iter().sum()],
            })
        })
        .collect()
}

fn pct_change(prior: f64, current: f64) -> Option<f64> {
    (prior != 0.0).then(|| (current - prior) / prior.abs() * 100.0)
}

// ---------------------------------------------------------------------------
// Statistics
// ---------------------------------------------------------------------------

fn compute_stat(spec: &StatSpec, bindings: &Bindings<'_>, records: &[&Record]) -> Option<SummaryStat> {
    let field = |role: Option<FieldRole>| -> Option<String> {
        bindings.resolve(role?)?.into_iter().next()
    };
    let make = |value: Value, display: String| SummaryStat {
        key: spec.key.clone(),
        label: spec.label.clone(),
        value,
        display,
    };
    let count = |n: usize| make(Value::from(n), n.to_string());
    let amount = |v: f64| make(Value::from(round2(v)), format_amount(v));
    let percent = |v: f64| make(Value::from(round2(v)), format_percent(v));

    let summary = bindings.summary;
    let stat = match spec.kind {
        StatKind::RecordCount => count(summary.record_count),
        StatKind::FieldCount => count(summary.fields.len()),
        StatKind::NumericFieldCount => count(summary.fields_of_kind(FieldKind::Numeric).len()),
        StatKind::Sum => {
            let values = column(records, &field(spec.role)?);
            if values.is_empty() {
                return None;
            }
            amount(values.iter().sum())
        }
        StatKind::Mean => {
            let values = column(records, &field(spec.role)?);
            if values.is_empty() {
                return None;
            }
            amount(values.iter().sum::<f64>() / values.len() as f64)
        }
        StatKind::Max => {
            let values = column(records, &field(spec.role)?);
            amount(values.into_iter().reduce(f64::max)?)
        }
        StatKind::Distinct => {
            let name = field(spec.role)?;
            let distinct: HashSet<String> = records
                .iter()
                .map(|r| label_of(r.get(&name)))
                .filter(|l| l != "(blank)")
                .collect();
            count(distinct.len())
        }
        StatKind::TopEntity => {
            let by = field(spec.by)?;
            let value = field(spec.role)?;
            let mut points = aggregate(records, &by, &[value]);
            sort_desc(&mut points, 0);
            let top = points.into_iter().next()?;
            let display = format!("{} ({})", top.label, format_amount(top.values[0]));
            make(Value::String(top.label), display)
        }
        StatKind::TopNShare => {
            let by = field(spec.by)?;
            let value = field(spec.role)?;
            let mut points = aggregate(records, &by, &[value]);
            points.retain(|p| p.values[0] > 0.0);
            sort_desc(&mut points, 0);
            let total: f64 = points.iter().map(|p| p.values[0]).sum();
            if total <= 0.0 {
                return None;
            }
            let n = spec.top_n.unwrap_or(DEFAULT_TOP_N_SHARE);
            let top: f64 = points.iter().take(n).map(|p| p.values[0]).sum();
            percent(top / total * 100.0)
        }
        StatKind::TotalGrowth => match spec.role {
            Some(_) => {
                let values = column(records, &field(spec.role)?);
                percent(pct_change(*values.first()?, *values.last()?)?)
            }
            None => {
                let (prior, current) = bindings.period_pair.as_ref()?;
                let prior_total: f64 = column(records, prior).iter().sum();
                let current_total: f64 = column(records, current).iter().sum();
                percent(pct_change(prior_total, current_total)?)
            }
        },
        StatKind::PositiveGrowthCount => {
            let (prior, current) = bindings.period_pair.as_ref()?;
            let growing = records
                .iter()
                .filter(|r| match (number_of(r, prior), number_of(r, current)) {
                    (Some(p), Some(c)) => c > p,
                    _ => false,
                })
                .count();
            count(growing)
        }
    };
    Some(stat)
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Thousands-separated amount; whole units at or above 100, cents below.
pub fn format_amount(value: f64) -> String {
    let decimals = if value.abs() >= 100.0 { 0 } else { 2 };
    let text = format!("{:.*}", decimals, value.abs());
    let (whole, fraction) = match text.split_once('.') {
        Some((w, f)) => (w, Some(f)),
        None => (text.as_str(), None),
    };

    let mut grouped = String::with_capacity(text.len() + whole.len() / 3);
    for (i, c) in whole.chars().enumerate() {
        if i > 0 && (whole.len() - i) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(c);
    }
    if let Some(f) = fraction {
        grouped.push('.');
        grouped.push_str(f);
    }

    if value < 0.0 {
        format!("-{}", grouped)
    } else {
        grouped
    }
}

pub fn format_percent(value: f64) -> String {
    format!("{:.1}%", value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::TtlCache;
    use crate::schema::analyze;
    use serde_json::json;
    use std::time::Duration;

    fn plan_for(category: AnalysisCategory, key: &str, payload: Value) -> RenderPlan {
        let document = Document::from_value(key, payload);
        let summary = analyze(&document).unwrap();
        let book = RecipeBook::builtin();
        build_plan(book.get(category), category, &document, &summary).unwrap()
    }

    fn chart<'a>(plan: &'a RenderPlan, kind: ChartKind) -> &'a ResolvedChart {
        plan.charts
            .iter()
            .find(|c| c.kind == kind)
            .unwrap_or_else(|| panic!("missing {:?} chart, omitted: {:?}", kind, plan.omitted))
    }

    fn quarterly_payload() -> Value {
        json!([
            {"Customer Name": "Acme", "Q3 FY24 Revenue": 100, "Q4 FY24 Revenue": 150},
            {"Customer Name": "Globex", "Q3 FY24 Revenue": 200, "Q4 FY24 Revenue": 180},
            {"Customer Name": "Initech", "Q3 FY24 Revenue": 50, "Q4 FY24 Revenue": 90},
        ])
    }

    #[test]
    fn test_quarterly_plan() {
        let plan = plan_for(AnalysisCategory::QuarterlyRevenue, "quarterly.json", quarterly_payload());
        assert!(plan.omitted.is_empty(), "omitted: {:?}", plan.omitted);

        let variance = chart(&plan, ChartKind::Variance);
        assert_eq!(variance.x_field.as_deref(), Some("Customer Name"));
        assert_eq!(variance.y_fields, vec!["Q3 FY24 Revenue", "Q4 FY24 Revenue"]);
        let labels: Vec<&str> = variance.points.iter().map(|p| p.label.as_str()).collect();
        assert_eq!(labels, vec!["Acme", "Initech", "Globex"]);
        assert_eq!(variance.points[2].values, vec![-20.0]);

        let growth = chart(&plan, ChartKind::Growth);
        assert_eq!(growth.points[0].label, "Initech");
        assert_eq!(growth.points[0].values, vec![80.0]);

        assert_eq!(plan.stat("prior_total").unwrap().value, json!(350.0));
        assert_eq!(plan.stat("current_total").unwrap().value, json!(420.0));
        assert_eq!(plan.stat("total_growth_pct").unwrap().display, "20.0%");
        assert_eq!(plan.stat("growing_count").unwrap().value, json!(2));
        assert_eq!(plan.stat("top_entity").unwrap().value, json!("Globex"));
    }

    #[test]
    fn test_country_plan() {
        let plan = plan_for(
            AnalysisCategory::CountryWise,
            "markets.json",
            json!([
                {"Country": "India", "Revenue": 500},
                {"Country": "Canada", "Revenue": 300},
                {"Country": "Brazil", "Revenue": 200},
                {"Country": "India", "Revenue": 100},
            ]),
        );
        let bar = chart(&plan, ChartKind::Bar);
        assert_eq!(bar.points[0].label, "India");
        assert_eq!(bar.points[0].values, vec![600.0]);
        assert_eq!(plan.stat("market_count").unwrap().value, json!(3));
        assert_eq!(plan.stat("top_market").unwrap().display, "India (600)");
        assert_eq!(plan.stat("top3_share_pct").unwrap().value, json!(100.0));
    }

    #[test]
    fn test_monthly_growth_is_sequential() {
        let plan = plan_for(
            AnalysisCategory::MonthlyRevenue,
            "monthly.json",
            json!([
                {"Month": "Jan 2024", "Revenue": 100},
                {"Month": "Feb 2024", "Revenue": 120},
                {"Month": "Mar 2024", "Revenue": 90},
            ]),
        );
        let line = chart(&plan, ChartKind::Line);
        assert_eq!(line.points.len(), 3);
        let growth = chart(&plan, ChartKind::Growth);
        assert_eq!(growth.points[0].label, "Feb 2024");
        assert_eq!(growth.points[0].values, vec![20.0]);
        assert_eq!(growth.points[1].values, vec![-25.0]);
        assert_eq!(plan.stat("overall_growth_pct").unwrap().display, "-10.0%");
    }

    #[test]
    fn test_bridge_waterfall() {
        let plan = plan_for(
            AnalysisCategory::RevenueBridge,
            "bridge.json",
            json!([
                {"Customer": "A", "Starting Revenue": 100, "Expansion": 20, "Churn": -10, "Ending Revenue": 110},
                {"Customer": "B", "Starting Revenue": 50, "Expansion": 0, "Churn": -50, "Ending Revenue": 0},
            ]),
        );
        let waterfall = chart(&plan, ChartKind::Waterfall);
        let labels: Vec<&str> = waterfall.points.iter().map(|p| p.label.as_str()).collect();
        assert_eq!(labels, vec!["Starting Revenue", "Expansion", "Churn", "Ending Revenue"]);
        assert_eq!(waterfall.points[2].values, vec![-60.0]);
        assert_eq!(plan.stat("starting_total").unwrap().value, json!(150.0));
        assert_eq!(plan.stat("expanding_count").unwrap().value, json!(1));
    }

    #[test]
    fn test_every_category_yields_a_plan() {
        for category in AnalysisCategory::ALL {
            let plan = plan_for(category, "mystery.json", json!([{"foo": "x", "bar": "y"}]));
            assert!(!plan.charts.is_empty(), "{} produced no charts", category);
            assert_eq!(plan.charts.last().unwrap().kind, ChartKind::Table);
            if category != AnalysisCategory::Unknown {
                assert!(!plan.omitted.is_empty());
            }
        }
    }

    #[test]
    fn test_table_and_context() {
        let plan = plan_for(AnalysisCategory::Unknown, "foo.json", json!([{"foo": 1, "bar": "y"}]));
        let table = chart(&plan, ChartKind::Table);
        assert_eq!(table.y_fields, vec!["foo", "bar"]);
        assert_eq!(table.rows.len(), 1);
        assert_eq!(plan.context.numeric_fields, vec!["foo"]);
        assert_eq!(plan.context.sample.len(), 1);
        assert_eq!(plan.context.title, "foo");
    }

    #[test]
    fn test_pareto_and_pie() {
        let plan = plan_for(
            AnalysisCategory::CustomerConcentration,
            "customers.json",
            json!([
                {"Customer": "A", "Revenue": 60},
                {"Customer": "B", "Revenue": 30},
                {"Customer": "C", "Revenue": 10},
            ]),
        );
        let pareto = chart(&plan, ChartKind::Pareto);
        assert_eq!(pareto.points[0].values, vec![60.0, 60.0]);
        assert_eq!(pareto.points[2].values, vec![10.0, 100.0]);
        assert_eq!(plan.stat("top5_share_pct").unwrap().value, json!(100.0));
        assert_eq!(plan.stat("avg_per_customer").unwrap().display, "33.33");
    }

    #[test]
    fn test_period_tag() {
        assert_eq!(period_tag("Q3 FY24 Revenue"), Some((2024, 3)));
        assert_eq!(period_tag("Revenue 2023"), Some((2023, 0)));
        assert_eq!(period_tag("Quarter 2 Sales"), Some((0, 2)));
        assert_eq!(period_tag("Q4 vs Q3"), None);
        assert_eq!(period_tag("Revenue"), None);
    }

    #[test]
    fn test_format_amount() {
        assert_eq!(format_amount(1_234_567.0), "1,234,567");
        assert_eq!(format_amount(-950.0), "-950");
        assert_eq!(format_amount(12.5), "12.50");
        assert_eq!(format_amount(100.0), "100");
        assert_eq!(format_percent(12.345), "12.3%");
    }

    #[test]
    fn test_route_uses_cache() {
        let cache: StageCache = TtlCache::new(Duration::from_secs(300));
        let router = Router::new(Arc::new(RecipeBook::builtin()), cache.clone());
        let document = Document::from_value("quarterly.json", quarterly_payload());
        let summary = analyze(&document).unwrap();

        let first = router.route(AnalysisCategory::QuarterlyRevenue, &document, &summary).unwrap();
        let second = router.route(AnalysisCategory::QuarterlyRevenue, &document, &summary).unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(cache.stats().hits, 1);
        assert_eq!(cache.stats().misses, 1);
    }

    #[test]
    fn test_route_recomputes_after_expiry() {
        let cache: StageCache = TtlCache::new(Duration::ZERO);
        let router = Router::new(Arc::new(RecipeBook::builtin()), cache);
        let document = Document::from_value("quarterly.json", quarterly_payload());
        let summary = analyze(&document).unwrap();

        let first = router.route(AnalysisCategory::QuarterlyRevenue, &document, &summary).unwrap();
        let second = router.route(AnalysisCategory::QuarterlyRevenue, &document, &summary).unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(first, second);
    }
}
