//! Dashboard recipes: which charts and statistics each category renders.
//!
//! The built-in table covers every [`AnalysisCategory`]. A recipes directory
//! may replace individual categories with JSON files shaped like
//! [`DashboardRecipe`].

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::OnceLock;
use tracing::{info, warn};

use crate::classifier::AnalysisCategory;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChartKind {
    Bar,
    GroupedBar,
    Line,
    Pie,
    Treemap,
    Waterfall,
    /// Current minus prior per label.
    Variance,
    /// Percentage change per label, or period over period for a single series.
    Growth,
    /// Sorted values with cumulative share of total.
    Pareto,
    Table,
}

/// Semantic slot a chart or statistic needs filled by an actual field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldRole {
    Entity,
    Geography,
    Period,
    Measure,
    PriorPeriod,
    CurrentPeriod,
    Growth,
    Share,
    /// All bridge movement columns, in field order.
    Movement,
    AnyNumeric,
    AnyLabel,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChartTemplate {
    pub kind: ChartKind,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub x: Option<FieldRole>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub y: Vec<FieldRole>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_n: Option<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatKind {
    RecordCount,
    FieldCount,
    NumericFieldCount,
    Sum,
    Mean,
    Max,
    Distinct,
    /// Label with the largest aggregated `role` value, grouped by `by`.
    TopEntity,
    /// Percentage of the `role` total held by the top `top_n` labels of `by`.
    TopNShare,
    /// First to last value of `role`, or prior to current period totals.
    TotalGrowth,
    /// Records whose current period exceeds the prior period.
    PositiveGrowthCount,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatSpec {
    pub key: String,
    pub label: String,
    pub kind: StatKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<FieldRole>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub by: Option<FieldRole>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_n: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DashboardRecipe {
    pub category: AnalysisCategory,
    pub title: String,
    pub charts: Vec<ChartTemplate>,
    #[serde(default)]
    pub stats: Vec<StatSpec>,
}

impl DashboardRecipe {
    /// Guarantee the recipe ends with a role-free data table.
    fn ensure_table(&mut self) {
        let ends_with_table = self
            .charts
            .last()
            .map(|c| c.kind == ChartKind::Table && c.x.is_none() && c.y.is_empty())
            .unwrap_or(false);
        if !ends_with_table {
            warn!("Recipe '{}' has no trailing table, appending one", self.category);
            self.charts.push(table());
        }
    }
}

/// Recipes for every category. `get` never fails: unmapped categories use
/// the generic recipe.
#[derive(Debug, Clone)]
pub struct RecipeBook {
    recipes: BTreeMap<AnalysisCategory, DashboardRecipe>,
}

impl RecipeBook {
    pub fn builtin() -> Self {
        let recipes = AnalysisCategory::ALL
            .into_iter()
            .map(|c| (c, builtin_recipe(c)))
            .collect();
        Self { recipes }
    }

    /// Replace built-in recipes with every `*.json` recipe found in `dir`.
    pub fn with_overrides_from_dir(mut self, dir: &Path) -> Result<Self> {
        if !dir.is_dir() {
            anyhow::bail!("Recipes directory does not exist: {:?}", dir);
        }

        let mut paths: Vec<_> = std::fs::read_dir(dir)?
            .filter_map(|e| e.ok().map(|e| e.path()))
            .filter(|p| p.extension().map(|e| e == "json").unwrap_or(false))
            .collect();
        paths.sort();

        for path in paths {
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read recipe: {:?}", path))?;
            let mut recipe: DashboardRecipe = serde_json::from_str(&content)
                .with_context(|| format!("Failed to parse recipe: {:?}", path))?;
            recipe.ensure_table();
            info!("Loaded recipe override: {} from {:?}", recipe.category, path);
            self.recipes.insert(recipe.category, recipe);
        }

        Ok(self)
    }

    pub fn get(&self, category: AnalysisCategory) -> &DashboardRecipe {
        self.recipes
            .get(&category)
            .or_else(|| self.recipes.get(&AnalysisCategory::Unknown))
            .unwrap_or_else(|| generic_fallback())
    }

    pub fn all(&self) -> Vec<&DashboardRecipe> {
        self.recipes.values().collect()
    }
}

impl Default for RecipeBook {
    fn default() -> Self {
        Self::builtin()
    }
}

fn generic_fallback() -> &'static DashboardRecipe {
    static GENERIC: OnceLock<DashboardRecipe> = OnceLock::new();
    GENERIC.get_or_init(|| builtin_recipe(AnalysisCategory::Unknown))
}

fn chart(kind: ChartKind, title: &str, x: Option<FieldRole>, y: &[FieldRole], top_n: Option<usize>) -> ChartTemplate {
    ChartTemplate {
        kind,
        title: title.to_string(),
        x,
        y: y.to_vec(),
        top_n,
    }
}

fn table() -> ChartTemplate {
    chart(ChartKind::Table, "Data table", None, &[], None)
}

fn stat(key: &str, label: &str, kind: StatKind) -> StatSpec {
    StatSpec {
        key: key.to_string(),
        label: label.to_string(),
        kind,
        role: None,
        by: None,
        top_n: None,
    }
}

impl StatSpec {
    fn of(mut self, role: FieldRole) -> Self {
        self.role = Some(role);
        self
    }

    fn by(mut self, role: FieldRole) -> Self {
        self.by = Some(role);
        self
    }

    fn top(mut self, n: usize) -> Self {
        self.top_n = Some(n);
        self
    }
}

fn builtin_recipe(category: AnalysisCategory) -> DashboardRecipe {
    use ChartKind::*;
    use FieldRole::*;

    let (title, charts, stats) = match category {
        AnalysisCategory::QuarterlyRevenue => (
            "Quarterly Revenue Analysis",
            vec![
                chart(GroupedBar, "Prior vs current period by customer", Some(Entity), &[PriorPeriod, CurrentPeriod], Some(15)),
                chart(Variance, "Top 10 customers by absolute growth", Some(Entity), &[PriorPeriod, CurrentPeriod], Some(10)),
                chart(ChartKind::Growth, "Top 10 customers by growth rate", Some(Entity), &[PriorPeriod, CurrentPeriod], Some(10)),
                chart(Bar, "Revenue by customer", Some(Entity), &[Measure], Some(15)),
                table(),
            ],
            vec![
                stat("records", "Customers analyzed", StatKind::RecordCount),
                stat("prior_total", "Prior period total", StatKind::Sum).of(PriorPeriod),
                stat("current_total", "Current period total", StatKind::Sum).of(CurrentPeriod),
                stat("total_growth_pct", "Total growth", StatKind::TotalGrowth),
                stat("top_entity", "Largest customer", StatKind::TopEntity).of(CurrentPeriod).by(Entity),
                stat("growing_count", "Customers growing", StatKind::PositiveGrowthCount),
            ],
        ),
        AnalysisCategory::RevenueBridge => (
            "Revenue Bridge Analysis",
            vec![
                chart(Waterfall, "Revenue bridge", None, &[Movement], None),
                chart(GroupedBar, "Starting vs ending revenue", Some(Entity), &[PriorPeriod, CurrentPeriod], Some(15)),
                chart(Variance, "Largest net movements", Some(Entity), &[PriorPeriod, CurrentPeriod], Some(10)),
                table(),
            ],
            vec![
                stat("records", "Accounts", StatKind::RecordCount),
                stat("starting_total", "Starting revenue", StatKind::Sum).of(PriorPeriod),
                stat("ending_total", "Ending revenue", StatKind::Sum).of(CurrentPeriod),
                stat("net_change_pct", "Net change", StatKind::TotalGrowth),
                stat("expanding_count", "Accounts expanding", StatKind::PositiveGrowthCount),
            ],
        ),
        AnalysisCategory::CountryWise => (
            "Geographic Revenue Analysis",
            vec![
                chart(Bar, "Revenue by market", Some(Geography), &[Measure], Some(15)),
                chart(Pie, "Market share", Some(Geography), &[Measure], Some(8)),
                chart(Treemap, "Revenue distribution", Some(Geography), &[Measure], None),
                table(),
            ],
            vec![
                stat("total_revenue", "Total revenue", StatKind::Sum).of(Measure),
                stat("market_count", "Markets", StatKind::Distinct).of(Geography),
                stat("top_market", "Top market", StatKind::TopEntity).of(Measure).by(Geography),
                stat("top3_share_pct", "Top 3 market share", StatKind::TopNShare).of(Measure).by(Geography).top(3),
            ],
        ),
        AnalysisCategory::CustomerConcentration => (
            "Customer Concentration Analysis",
            vec![
                chart(Pareto, "Customer concentration (Pareto)", Some(Entity), &[Measure], Some(20)),
                chart(Pie, "Top customers by revenue share", Some(Entity), &[Measure], Some(10)),
                chart(Bar, "Revenue by customer", Some(Entity), &[Measure], Some(15)),
                table(),
            ],
            vec![
                stat("total_revenue", "Total revenue", StatKind::Sum).of(Measure),
                stat("customer_count", "Customers", StatKind::Distinct).of(Entity),
                stat("avg_per_customer", "Average revenue per customer", StatKind::Mean).of(Measure),
                stat("top_customer", "Largest customer", StatKind::TopEntity).of(Measure).by(Entity),
                stat("top5_share_pct", "Top 5 customer share", StatKind::TopNShare).of(Measure).by(Entity).top(5),
            ],
        ),
        AnalysisCategory::MonthlyRevenue => (
            "Monthly Revenue Analysis",
            vec![
                chart(Line, "Revenue trend", Some(Period), &[Measure], None),
                chart(Bar, "Revenue by period", Some(Period), &[Measure], None),
                chart(ChartKind::Growth, "Period-over-period growth", Some(Period), &[Measure], None),
                table(),
            ],
            vec![
                stat("periods", "Periods", StatKind::RecordCount),
                stat("total_revenue", "Total revenue", StatKind::Sum).of(Measure),
                stat("avg_per_period", "Average per period", StatKind::Mean).of(Measure),
                stat("peak_value", "Peak period value", StatKind::Max).of(Measure),
                stat("overall_growth_pct", "Growth first to last period", StatKind::TotalGrowth).of(Measure),
            ],
        ),
        AnalysisCategory::Unknown => (
            "Data Overview",
            vec![
                chart(Bar, "Overview", Some(AnyLabel), &[AnyNumeric], Some(20)),
                table(),
            ],
            vec![
                stat("records", "Records", StatKind::RecordCount),
                stat("fields", "Attributes", StatKind::FieldCount),
                stat("numeric_fields", "Numeric attributes", StatKind::NumericFieldCount),
                stat("total_value", "Total of first numeric attribute", StatKind::Sum).of(AnyNumeric),
            ],
        ),
    };

    DashboardRecipe {
        category,
        title: title.to_string(),
        charts,
        stats,
    }
}
