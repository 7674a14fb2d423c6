//! Executive summaries and chat answers for a render plan.
//!
//! Generated text comes from a [`TextGenerator`]; every failure path lands on
//! a deterministic narrative built only from the plan's statistics, so a
//! summary is always produced.

use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::classifier::AnalysisCategory;
use crate::error::GenerationError;
use crate::openai::{GenerationRequest, TextGenerator};
use crate::router::RenderPlan;

pub const SUMMARY_SYSTEM_PROMPT: &str = "You are a world-class financial analyst and business intelligence expert with 15+ years of experience in revenue operations, customer analytics, and strategic business planning. Provide actionable insights with specific metrics and recommendations.";

pub const CHAT_SYSTEM_PROMPT: &str =
    "You are a data analyst assistant. Provide clear, specific answers based on the data provided.";

const PROMPT_SAMPLE_CHARS: usize = 8000;
const CHAT_SAMPLE_ROWS: usize = 10;
const CHAT_SAMPLE_CHARS: usize = 2000;
const MAX_SUGGESTIONS: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GenerationOptions {
    pub max_tokens: u32,
    pub temperature: f32,
    pub timeout: Duration,
}

impl GenerationOptions {
    pub fn summary_defaults() -> Self {
        Self {
            max_tokens: 1500,
            temperature: 0.2,
            timeout: Duration::from_secs(30),
        }
    }

    pub fn chat_defaults() -> Self {
        Self {
            max_tokens: 500,
            temperature: 0.3,
            timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NarrativeSource {
    Generated,
    Fallback,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Narrative {
    pub text: String,
    pub source: NarrativeSource,
}

impl Narrative {
    fn fallback(text: String) -> Self {
        Self {
            text,
            source: NarrativeSource::Fallback,
        }
    }
}

#[derive(Clone)]
pub struct Narrator {
    generator: Arc<dyn TextGenerator>,
    summary: GenerationOptions,
    chat: GenerationOptions,
}

impl Narrator {
    pub fn new(generator: Arc<dyn TextGenerator>, summary: GenerationOptions) -> Self {
        let chat = GenerationOptions {
            timeout: summary.timeout,
            ..GenerationOptions::chat_defaults()
        };
        Self {
            generator,
            summary,
            chat,
        }
    }

    pub fn generator_name(&self) -> &str {
        self.generator.name()
    }

    /// Executive summary for the plan. Never fails.
    pub async fn narrate(&self, plan: &RenderPlan) -> Narrative {
        let request = summary_request(plan, &self.summary);
        self.generate_or(request, self.summary.timeout, || fallback_narrative(plan))
            .await
    }

    /// Answer a free-form question about the plan. Never fails.
    pub async fn answer(&self, plan: &RenderPlan, question: &str) -> Narrative {
        let request = chat_request(plan, question, &self.chat);
        self.generate_or(request, self.chat.timeout, || fallback_answer(plan, question))
            .await
    }

    async fn generate_or(
        &self,
        request: GenerationRequest,
        timeout: Duration,
        fallback: impl FnOnce() -> String,
    ) -> Narrative {
        let outcome = match tokio::time::timeout(timeout, self.generator.generate(&request)).await {
            Ok(Ok(text)) if !text.trim().is_empty() => Ok(text),
            Ok(Ok(_)) => Err(GenerationError::Empty),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(GenerationError::Timeout(timeout)),
        };

        match outcome {
            Ok(text) => {
                info!("Generated narrative via {} ({} chars)", self.generator.name(), text.len());
                Narrative {
                    text,
                    source: NarrativeSource::Generated,
                }
            }
            Err(e) => {
                warn!("Generation unavailable via {}, using fallback: {}", self.generator.name(), e);
                Narrative::fallback(fallback())
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Prompts
// ---------------------------------------------------------------------------

pub fn summary_request(plan: &RenderPlan, options: &GenerationOptions) -> GenerationRequest {
    GenerationRequest {
        system: SUMMARY_SYSTEM_PROMPT.to_string(),
        prompt: build_prompt(plan),
        max_tokens: options.max_tokens,
        temperature: options.temperature,
    }
}

/// Dataset description, computed statistics, a truncated data sample and the
/// analysis sections the available field kinds support.
pub fn build_prompt(plan: &RenderPlan) -> String {
    let ctx = &plan.context;
    let has_numeric = !ctx.numeric_fields.is_empty();

    let mut sections = Vec::new();
    if has_numeric {
        sections.push(
            "## Financial Performance Analysis\n\
             - Calculate total and average values for revenue metrics\n\
             - Identify top performers and key contributors\n\
             - Analyze revenue distribution patterns",
        );
    }
    if has_numeric && !ctx.date_fields.is_empty() {
        sections.push(
            "## Temporal Analysis\n\
             - Identify trends and patterns over time\n\
             - Highlight seasonal variations or growth periods\n\
             - Assess consistency and volatility",
        );
    }
    if !ctx.categorical_fields.is_empty() {
        sections.push(
            "## Segmentation Analysis\n\
             - Break down performance by key segments\n\
             - Identify high-performing categories\n\
             - Assess concentration and diversification",
        );
    }
    if has_numeric && !ctx.identifier_fields.is_empty() {
        sections.push(
            "## Performance Ranking\n\
             - Rank entities by key performance metrics\n\
             - Identify outliers and exceptional cases\n\
             - Assess competitive positioning",
        );
    }
    sections.push(
        "## Risks & Opportunities\n\
         - Flag potential risks based on data patterns\n\
         - Identify growth opportunities and optimization areas\n\
         - Assess data quality and completeness issues",
    );
    sections.push(
        "## Strategic Recommendations\n\
         - Provide actionable next steps based on findings\n\
         - Suggest optimization strategies\n\
         - Recommend areas for deeper investigation",
    );

    let stats: Vec<String> = plan
        .stats
        .iter()
        .map(|s| format!("- {}: {}", s.label, s.display))
        .collect();
    let charts: Vec<&str> = plan.charts.iter().map(|c| c.title.as_str()).collect();
    let sample = serde_json::to_string_pretty(&ctx.sample).unwrap_or_default();

    format!(
        "You are analyzing a {label} dataset (\"{title}\") with automatically detected schema.\n\n\
         {description}\n\n\
         Computed metrics:\n{stats}\n\n\
         Data Context:\n{sample}\n\n\
         Schema Confidence: {confidence}%\n\
         Suggested Visualizations: {charts}\n\n\
         Please provide a comprehensive executive summary with the following sections:\n\n\
         {sections}\n\n\
         Focus on the actual data patterns you observe and provide specific, actionable insights \
         based on the metrics and dimensions available in this dataset.",
        label = plan.category.label(),
        title = ctx.title,
        description = describe_dataset(plan),
        stats = if stats.is_empty() { "- none".to_string() } else { stats.join("\n") },
        sample = truncate_chars(&sample, PROMPT_SAMPLE_CHARS),
        confidence = ctx.confidence,
        charts = charts.join(", "),
        sections = sections.join("\n\n"),
    )
}

fn describe_dataset(plan: &RenderPlan) -> String {
    let ctx = &plan.context;
    let mut text = format!(
        "This dataset contains {} columns with {} records.",
        ctx.field_count, ctx.record_count
    );
    let lists = [
        ("Key numeric columns", &ctx.numeric_fields),
        ("Percentage columns", &ctx.percentage_fields),
        ("Time-based columns", &ctx.date_fields),
        ("Identifier columns", &ctx.identifier_fields),
        ("Categorical dimensions", &ctx.categorical_fields),
    ];
    for (label, fields) in lists {
        if !fields.is_empty() {
            text.push_str(&format!(" {}: {}.", label, fields.join(", ")));
        }
    }
    text
}

pub fn chat_request(plan: &RenderPlan, question: &str, options: &GenerationOptions) -> GenerationRequest {
    let ctx = &plan.context;
    let rows: Vec<_> = ctx.sample.iter().take(CHAT_SAMPLE_ROWS).collect();
    let sample = serde_json::to_string_pretty(&rows).unwrap_or_default();

    let mut context_info = format!("Dataset has {} columns.", ctx.field_count);
    if !ctx.numeric_fields.is_empty() {
        context_info.push_str(&format!(" Numeric columns: {}.", ctx.numeric_fields.join(", ")));
    }
    if !ctx.categorical_fields.is_empty() {
        context_info.push_str(&format!(" Categories: {}.", ctx.categorical_fields.join(", ")));
    }

    GenerationRequest {
        system: CHAT_SYSTEM_PROMPT.to_string(),
        prompt: format!(
            "You are analyzing {} data. {}\n\nQuestion: {}\n\nData sample:\n{}\n\n\
             Provide a helpful, specific answer based on the data. Include numbers and insights where relevant.",
            plan.category.label(),
            context_info,
            question.trim(),
            truncate_chars(&sample, CHAT_SAMPLE_CHARS)
        ),
        max_tokens: options.max_tokens,
        temperature: options.temperature,
    }
}

// ---------------------------------------------------------------------------
// Deterministic fallbacks
// ---------------------------------------------------------------------------

/// Summary built only from the plan's statistics.
pub fn fallback_narrative(plan: &RenderPlan) -> String {
    let insights: Vec<String> = headline_templates(plan.category)
        .iter()
        .filter_map(|(template, keys)| fill(plan, template, keys))
        .collect();

    let mut out = String::from("## Key Insights\n");
    if insights.is_empty() {
        out.push_str(&format!(
            "- {} records analyzed; no {} metrics could be computed from the available fields\n",
            plan.context.record_count,
            plan.category.label()
        ));
    }
    for line in &insights {
        out.push_str(&format!("- {}\n", line));
    }

    if plan.category == AnalysisCategory::CustomerConcentration {
        if let Some(share) = plan.stat("top5_share_pct").and_then(|s| s.value.as_f64()) {
            out.push_str(&format!(
                "- Concentration risk: {}\n",
                concentration_risk(share)
            ));
        }
    }

    if !plan.stats.is_empty() {
        out.push_str("\n## Key Metrics\n");
        for stat in &plan.stats {
            out.push_str(&format!("- {}: {}\n", stat.label, stat.display));
        }
    }

    out.push_str("\n## Strategic Recommendations\n");
    for line in recommendations(plan.category) {
        out.push_str(&format!("- {}\n", line));
    }
    out.trim_end().to_string()
}

/// Share of revenue held by the top customers, as a risk level.
pub fn concentration_risk(top_share_pct: f64) -> &'static str {
    if top_share_pct > 80.0 {
        "High"
    } else if top_share_pct > 60.0 {
        "Medium"
    } else {
        "Low"
    }
}

type Headline = (&'static str, &'static [&'static str]);

fn headline_templates(category: AnalysisCategory) -> &'static [Headline] {
    match category {
        AnalysisCategory::QuarterlyRevenue => &[
            ("Analyzed {} customers across the prior and current period", &["records"]),
            ("Total revenue moved from {} to {} ({})", &["prior_total", "current_total", "total_growth_pct"]),
            ("{} customers showed positive growth", &["growing_count"]),
            ("Largest customer in the current period: {}", &["top_entity"]),
        ],
        AnalysisCategory::RevenueBridge => &[
            ("Revenue moved from {} to {} ({})", &["starting_total", "ending_total", "net_change_pct"]),
            ("{} of {} accounts expanded", &["expanding_count", "records"]),
        ],
        AnalysisCategory::CountryWise => &[
            ("Total revenue of {} across {} markets", &["total_revenue", "market_count"]),
            ("Top market: {}", &["top_market"]),
            ("The top 3 markets account for {} of revenue", &["top3_share_pct"]),
        ],
        AnalysisCategory::CustomerConcentration => &[
            ("Total revenue of {} across {} customers", &["total_revenue", "customer_count"]),
            ("Average revenue per customer: {}", &["avg_per_customer"]),
            ("Largest customer: {}", &["top_customer"]),
            ("The top 5 customers hold {} of revenue", &["top5_share_pct"]),
        ],
        AnalysisCategory::MonthlyRevenue => &[
            ("{} periods analyzed with total revenue of {}", &["periods", "total_revenue"]),
            ("Average per period: {}; peak period value: {}", &["avg_per_period", "peak_value"]),
            ("Growth from first to last period: {}", &["overall_growth_pct"]),
        ],
        AnalysisCategory::Unknown => &[
            ("Dataset contains {} records with {} attributes", &["records", "fields"]),
            ("{} attributes are numeric", &["numeric_fields"]),
        ],
    }
}

/// Fill each `{}` with a statistic's display value; `None` if any is missing.
fn fill(plan: &RenderPlan, template: &str, keys: &[&str]) -> Option<String> {
    let mut out = template.to_string();
    for key in keys {
        let display = &plan.stat(key)?.display;
        out = out.replacen("{}", display, 1);
    }
    Some(out)
}

fn recommendations(category: AnalysisCategory) -> [&'static str; 2] {
    match category {
        AnalysisCategory::QuarterlyRevenue => [
            "Focus on replicating success patterns of top performers",
            "Investigate factors behind customer growth variance",
        ],
        AnalysisCategory::RevenueBridge => [
            "Prioritize retention programs for contracting and churned accounts",
            "Scale the upsell motions that drove expansion",
        ],
        AnalysisCategory::CountryWise => [
            "Deepen investment in the leading markets",
            "Review underperforming regions for growth or exit decisions",
        ],
        AnalysisCategory::CustomerConcentration => [
            "Diversify the customer base to reduce dependency on top accounts",
            "Strengthen relationships with the largest customers",
        ],
        AnalysisCategory::MonthlyRevenue => [
            "Investigate periods with unusual declines",
            "Plan capacity and spend around peak periods",
        ],
        AnalysisCategory::Unknown => [
            "Add revenue and period columns to enable category-specific analysis",
            "Review data quality and completeness before drawing conclusions",
        ],
    }
}

/// Answer from computed statistics when text generation is unavailable.
/// Statistics whose label shares a word with the question come first.
pub fn fallback_answer(plan: &RenderPlan, question: &str) -> String {
    let question = question.to_lowercase();
    let relevant: Vec<_> = plan
        .stats
        .iter()
        .filter(|s| {
            s.label
                .to_lowercase()
                .split_whitespace()
                .any(|w| w.len() > 3 && question.contains(w))
        })
        .collect();
    let chosen = if relevant.is_empty() {
        plan.stats.iter().collect()
    } else {
        relevant
    };

    if chosen.is_empty() {
        return format!(
            "I can help you analyze {} data. Try asking about totals, averages, or top performers.",
            plan.category.label()
        );
    }

    let facts: Vec<String> = chosen
        .iter()
        .map(|s| format!("{}: {}", s.label, s.display))
        .collect();
    format!(
        "Text generation is currently unavailable. Key figures for {}: {}.",
        plan.context.title,
        facts.join("; ")
    )
}

/// Up to five follow-up questions suited to the plan's fields.
pub fn suggested_questions(plan: &RenderPlan) -> Vec<String> {
    let ctx = &plan.context;
    let mut out: Vec<String> = Vec::new();
    let numeric_named = |needle: &str| {
        ctx.numeric_fields
            .iter()
            .chain(&ctx.percentage_fields)
            .any(|f| f.to_lowercase().contains(needle))
    };

    if !ctx.date_fields.is_empty() || plan.category == AnalysisCategory::MonthlyRevenue {
        out.extend([
            "What are the key trends in this time series data?".to_string(),
            "Show me the growth pattern over time".to_string(),
            "What are the highest and lowest periods?".to_string(),
        ]);
    }
    if numeric_named("revenue") {
        out.extend([
            "What is the total revenue and growth rate?".to_string(),
            "Show me revenue performance analysis".to_string(),
            "What factors influenced revenue changes?".to_string(),
        ]);
    }
    if numeric_named("variance") {
        out.extend([
            "Explain the variance patterns".to_string(),
            "What caused the significant variances?".to_string(),
        ]);
    }
    if !ctx.categorical_fields.is_empty() {
        out.extend([
            format!("What are the key categories in {}?", ctx.title),
            "Show me the distribution breakdown".to_string(),
        ]);
    }
    if out.is_empty() {
        out = vec![
            format!("What insights can you provide about {}?", ctx.title),
            "Summarize the key findings".to_string(),
            "What are the most important metrics?".to_string(),
        ];
    }
    out.truncate(MAX_SUGGESTIONS);
    out
}

/// Prefix of at most `max` characters, never splitting a code point.
pub fn truncate_chars(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::Document;
    use crate::recipes::RecipeBook;
    use crate::router::build_plan;
    use crate::schema::analyze;
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use std::sync::Mutex;

    fn plan(category: AnalysisCategory, key: &str, payload: Value) -> RenderPlan {
        let document = Document::from_value(key, payload);
        let summary = analyze(&document).unwrap();
        build_plan(RecipeBook::builtin().get(category), category, &document, &summary).unwrap()
    }

    fn customer_plan() -> RenderPlan {
        plan(
            AnalysisCategory::CustomerConcentration,
            "customers.json",
            json!([
                {"Customer": "A", "Revenue": 900},
                {"Customer": "B", "Revenue": 50},
                {"Customer": "C", "Revenue": 30},
                {"Customer": "D", "Revenue": 10},
                {"Customer": "E", "Revenue": 5},
                {"Customer": "F", "Revenue": 5},
            ]),
        )
    }

    struct Failing;

    #[async_trait]
    impl TextGenerator for Failing {
        fn name(&self) -> &str {
            "failing"
        }

        async fn generate(&self, _request: &GenerationRequest) -> Result<String, GenerationError> {
            Err(GenerationError::Auth("invalid key".to_string()))
        }
    }

    struct Slow;

    #[async_trait]
    impl TextGenerator for Slow {
        fn name(&self) -> &str {
            "slow"
        }

        async fn generate(&self, _request: &GenerationRequest) -> Result<String, GenerationError> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok("too late".to_string())
        }
    }

    #[derive(Default)]
    struct Recording {
        seen: Mutex<Vec<GenerationRequest>>,
        reply: String,
    }

    #[async_trait]
    impl TextGenerator for Recording {
        fn name(&self) -> &str {
            "recording"
        }

        async fn generate(&self, request: &GenerationRequest) -> Result<String, GenerationError> {
            self.seen.lock().unwrap().push(request.clone());
            Ok(self.reply.clone())
        }
    }

    fn options(timeout: Duration) -> GenerationOptions {
        GenerationOptions {
            timeout,
            ..GenerationOptions::summary_defaults()
        }
    }

    #[tokio::test]
    async fn test_failing_generator_falls_back() {
        let plan = customer_plan();
        let narrator = Narrator::new(Arc::new(Failing), options(Duration::from_secs(1)));
        let narrative = narrator.narrate(&plan).await;
        assert_eq!(narrative.source, NarrativeSource::Fallback);
        assert_eq!(narrative.text, fallback_narrative(&plan));
    }

    #[tokio::test]
    async fn test_slow_generator_times_out() {
        let plan = customer_plan();
        let narrator = Narrator::new(Arc::new(Slow), options(Duration::from_millis(20)));
        let narrative = narrator.narrate(&plan).await;
        assert_eq!(narrative.source, NarrativeSource::Fallback);
    }

    #[tokio::test]
    async fn test_blank_reply_falls_back() {
        let plan = customer_plan();
        let generator = Arc::new(Recording {
            reply: "   ".to_string(),
            ..Default::default()
        });
        let narrator = Narrator::new(generator, options(Duration::from_secs(1)));
        assert_eq!(narrator.narrate(&plan).await.source, NarrativeSource::Fallback);
    }

    #[tokio::test]
    async fn test_generated_narrative_and_request() {
        let plan = customer_plan();
        let generator = Arc::new(Recording {
            reply: "Revenue is concentrated.".to_string(),
            ..Default::default()
        });
        let narrator = Narrator::new(generator.clone(), options(Duration::from_secs(1)));

        let narrative = narrator.narrate(&plan).await;
        assert_eq!(narrative.source, NarrativeSource::Generated);
        assert_eq!(narrative.text, "Revenue is concentrated.");

        let answer = narrator.answer(&plan, "Who is the largest customer?").await;
        assert_eq!(answer.source, NarrativeSource::Generated);

        let seen = generator.seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].max_tokens, 1500);
        assert_eq!(seen[0].system, SUMMARY_SYSTEM_PROMPT);
        assert_eq!(seen[1].max_tokens, 500);
        assert!(seen[1].prompt.contains("Question: Who is the largest customer?"));
    }

    #[test]
    fn test_prompt_sections_follow_field_kinds() {
        let monthly = plan(
            AnalysisCategory::MonthlyRevenue,
            "monthly.json",
            json!([
                {"Month": "Jan 2024", "Revenue": 100},
                {"Month": "Feb 2024", "Revenue": 120},
            ]),
        );
        let prompt = build_prompt(&monthly);
        assert!(prompt.contains("## Financial Performance Analysis"));
        assert!(prompt.contains("## Temporal Analysis"));
        assert!(prompt.contains("Time-based columns: Month."));
        assert!(prompt.contains("Strategic Recommendations"));

        let generic = plan(AnalysisCategory::Unknown, "foo.json", json!([{"foo": "x", "bar": "y"}]));
        let prompt = build_prompt(&generic);
        assert!(!prompt.contains("Financial Performance"));
        assert!(prompt.contains("## Risks & Opportunities"));
    }

    #[test]
    fn test_customer_fallback_reports_concentration() {
        let text = fallback_narrative(&customer_plan());
        assert!(text.contains("Total revenue of 1,000 across 6 customers"));
        assert!(text.contains("Largest customer: A (900)"));
        assert!(text.contains("Concentration risk: High"));
        assert!(text.contains("## Strategic Recommendations"));
    }

    #[test]
    fn test_fallback_without_stats_is_not_empty() {
        let generic = plan(
            AnalysisCategory::CountryWise,
            "foo.json",
            json!([{"foo": "x", "bar": "y"}]),
        );
        let text = fallback_narrative(&generic);
        assert!(text.contains("no country-wise revenue metrics could be computed"));
    }

    #[test]
    fn test_fallback_answer_prefers_matching_stats() {
        let answer = fallback_answer(&customer_plan(), "What is the total revenue?");
        assert!(answer.contains("Total revenue: 1,000"));
        assert!(!answer.contains("Largest customer"));
    }

    #[test]
    fn test_suggested_questions() {
        let questions = suggested_questions(&customer_plan());
        assert!(questions.iter().any(|q| q.contains("total revenue")));
        assert!(questions.len() <= 5);

        let generic = plan(AnalysisCategory::Unknown, "foo.json", json!([{"foo": "x", "bar": "y"}]));
        assert_eq!(suggested_questions(&generic)[0], "What insights can you provide about foo?");
    }

    #[test]
    fn test_concentration_risk_levels() {
        assert_eq!(concentration_risk(85.0), "High");
        assert_eq!(concentration_risk(70.0), "Medium");
        assert_eq!(concentration_risk(60.0), "Low");
    }

    #[test]
    fn test_truncate_chars() {
        assert_eq!(truncate_chars("₹₹₹₹", 2), "₹₹");
        assert_eq!(truncate_chars("abc", 10), "abc");
    }
}
