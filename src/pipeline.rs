//! Stage orchestration.
//!
//! For one document the stages always run in the same order: schema
//! analysis, classification, routing, narrative. Schema and plan are served
//! from the shared stage cache when a live entry exists for the document's
//! fingerprint. Portfolio builds isolate failures per document.

use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::cache::{CacheKey, StageCache, StageOutput, STAGE_SCHEMA};
use crate::classifier::{classify_detailed, Classification};
use crate::document::Document;
use crate::error::{DashboardError, Result};
use crate::narrative::{suggested_questions, Narrative, Narrator};
use crate::recipes::RecipeBook;
use crate::router::{RenderPlan, Router};
use crate::schema::{self, SchemaSummary};
use crate::source::DocumentSource;

/// One rendered dashboard tab.
#[derive(Debug, Clone, Serialize)]
pub struct DashboardTab {
    pub key: String,
    pub title: String,
    pub classification: Classification,
    pub schema: Arc<SchemaSummary>,
    pub plan: Arc<RenderPlan>,
    pub narrative: Narrative,
    pub suggested_questions: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DocumentFailure {
    pub key: String,
    pub error: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct DashboardReport {
    pub id: String,
    pub source: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    pub tabs: Vec<DashboardTab>,
    /// Documents that could not be fetched, parsed or classified.
    pub failures: Vec<DocumentFailure>,
}

impl DashboardReport {
    fn new(source: &str, scope: Option<&str>) -> Self {
        Self {
            id: format!("dash_{}", Uuid::new_v4()),
            source: source.to_string(),
            scope: scope.map(str::to_string),
            tabs: Vec::new(),
            failures: Vec::new(),
        }
    }

    fn fail(&mut self, key: &str, error: impl std::fmt::Display) {
        warn!("Skipping '{}': {}", key, error);
        self.failures.push(DocumentFailure {
            key: key.to_string(),
            error: error.to_string(),
        });
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ChatReply {
    pub key: String,
    pub answer: Narrative,
    pub suggested_questions: Vec<String>,
}

/// Everything before the narrative: deterministic and cacheable.
#[derive(Debug, Clone)]
pub struct Planned {
    pub classification: Classification,
    pub schema: Arc<SchemaSummary>,
    pub plan: Arc<RenderPlan>,
}

#[derive(Clone)]
pub struct Pipeline {
    cache: StageCache,
    router: Router,
    narrator: Narrator,
}

impl Pipeline {
    pub fn new(recipes: Arc<RecipeBook>, cache: StageCache, narrator: Narrator) -> Self {
        let router = Router::new(recipes, cache.clone());
        Self {
            cache,
            router,
            narrator,
        }
    }

    pub fn cache(&self) -> &StageCache {
        &self.cache
    }

    pub fn recipes(&self) -> &RecipeBook {
        self.router.recipes()
    }

    /// Schema stage, memoized under `"schema"`.
    pub fn analyze(&self, document: &Document) -> Result<Arc<SchemaSummary>> {
        let key = CacheKey::new(&document.source_key, &document.fingerprint, STAGE_SCHEMA);
        if let Some(StageOutput::Schema(summary)) = self.cache.get(&key) {
            debug!("Schema cache hit for '{}'", document.source_key);
            return Ok(summary);
        }
        let summary = Arc::new(schema::analyze(document)?);
        self.cache.insert(key, StageOutput::Schema(summary.clone()));
        Ok(summary)
    }

    /// Schema, classification and routing for one document.
    pub fn plan(&self, document: &Document) -> Result<Planned> {
        let schema = self.analyze(document)?;
        let hint = document.naming_hint();
        let classification = classify_detailed(&schema, Some(&hint));
        let plan = self.router.route(classification.category, document, &schema)?;
        Ok(Planned {
            classification,
            schema,
            plan,
        })
    }

    /// All stages for one document.
    pub async fn run(&self, document: &Document) -> Result<DashboardTab> {
        let Planned {
            classification,
            schema,
            plan,
        } = self.plan(document)?;
        let narrative = self.narrator.narrate(&plan).await;

        info!(
            "Built tab '{}' ({}, narrative {:?})",
            document.source_key, classification.category, narrative.source
        );

        Ok(DashboardTab {
            key: document.source_key.clone(),
            title: document.title(),
            suggested_questions: suggested_questions(&plan),
            classification,
            schema,
            plan,
            narrative,
        })
    }

    /// Dashboard for an uploaded file.
    pub async fn build_upload(&self, key: &str, data: &[u8]) -> DashboardReport {
        let mut report = DashboardReport::new("upload", None);
        self.run_bytes(&mut report, key, data).await;
        report
    }

    /// Run every document parsed from `data` into the report.
    async fn run_bytes(&self, report: &mut DashboardReport, key: &str, data: &[u8]) {
        let documents = match Document::load(key, data) {
            Ok(documents) => documents,
            Err(e) => return report.fail(key, e),
        };
        for document in documents {
            match self.run(&document).await {
                Ok(tab) => report.tabs.push(tab),
                Err(e) => report.fail(&document.source_key, e),
            }
        }
    }

    /// Dashboard for every document under `scope`.
    ///
    /// Fails only when the source itself cannot be listed.
    pub async fn build_all(&self, source: &dyn DocumentSource, scope: Option<&str>) -> Result<DashboardReport> {
        let entries = source.list(scope).await?;
        let mut report = DashboardReport::new(source.name(), scope);

        for entry in entries {
            match source.fetch(&entry.key).await {
                Ok(data) => self.run_bytes(&mut report, &entry.key, &data).await,
                Err(e) => report.fail(&entry.key, e),
            }
        }

        info!(
            "Dashboard {}: {} tabs, {} failures",
            report.id,
            report.tabs.len(),
            report.failures.len()
        );
        Ok(report)
    }

    /// Dashboard for a single key. A `#sheet` suffix selects one worksheet.
    pub async fn build_document(&self, source: &dyn DocumentSource, key: &str) -> Result<DashboardReport> {
        let documents = load_documents(source, key).await?;
        let mut report = DashboardReport::new(source.name(), None);
        for document in documents {
            match self.run(&document).await {
                Ok(tab) => report.tabs.push(tab),
                Err(e) => report.fail(&document.source_key, e),
            }
        }
        Ok(report)
    }

    /// Answer a question about one document.
    pub async fn chat(&self, source: &dyn DocumentSource, key: &str, question: &str) -> Result<ChatReply> {
        let documents = load_documents(source, key).await?;
        let document = documents
            .first()
            .ok_or_else(|| DashboardError::NotFound(key.to_string()))?;
        let Planned { plan, .. } = self.plan(document)?;

        Ok(ChatReply {
            key: document.source_key.clone(),
            answer: self.narrator.answer(&plan, question).await,
            suggested_questions: suggested_questions(&plan),
        })
    }
}

async fn load_documents(source: &dyn DocumentSource, key: &str) -> Result<Vec<Document>> {
    let (file_key, sheet) = match key.split_once('#') {
        Some((file, sheet)) => (file, Some(sheet)),
        None => (key, None),
    };
    let data = source.fetch(file_key).await?;
    let documents = Document::load(file_key, &data)?;

    match sheet {
        None => Ok(documents),
        Some(sheet) => {
            let selected: Vec<Document> = documents
                .into_iter()
                .filter(|d| d.sheet.as_deref() == Some(sheet))
                .collect();
            if selected.is_empty() {
                return Err(DashboardError::NotFound(key.to_string()));
            }
            Ok(selected)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::TtlCache;
    use crate::classifier::{AnalysisCategory, ClassificationBasis};
    use crate::error::GenerationError;
    use crate::narrative::{GenerationOptions, NarrativeSource};
    use crate::openai::{GenerationRequest, TextGenerator, Unconfigured};
    use crate::recipes::ChartKind;
    use crate::source::LocalDirSource;
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use std::time::Duration;

    struct Canned;

    #[async_trait]
    impl TextGenerator for Canned {
        fn name(&self) -> &str {
            "canned"
        }

        async fn generate(&self, _request: &GenerationRequest) -> std::result::Result<String, GenerationError> {
            Ok("Generated summary.".to_string())
        }
    }

    fn pipeline_with(generator: Arc<dyn TextGenerator>) -> Pipeline {
        let options = GenerationOptions {
            timeout: Duration::from_secs(1),
            ..GenerationOptions::summary_defaults()
        };
        Pipeline::new(
            Arc::new(RecipeBook::builtin()),
            TtlCache::new(Duration::from_secs(300)),
            Narrator::new(generator, options),
        )
    }

    fn pipeline() -> Pipeline {
        pipeline_with(Arc::new(Unconfigured))
    }

    fn quarterly_payload() -> Value {
        json!([
            {"Customer Name": "Acme", "Q3 Revenue": 100, "Q4 Revenue": 150, "Percentage of Variance": 50.0},
            {"Customer Name": "Globex", "Q3 Revenue": 200, "Q4 Revenue": 180, "Percentage of Variance": -10.0},
            {"Customer Name": "Initech", "Q3 Revenue": 50, "Q4 Revenue": 90, "Percentage of Variance": 80.0},
        ])
    }

    #[tokio::test]
    async fn test_quarterly_file_by_hint() {
        let document = Document::from_value("acme/Quarterly Revenue Q3-Q4.json", quarterly_payload());
        let tab = pipeline().run(&document).await.unwrap();

        assert_eq!(tab.classification.category, AnalysisCategory::QuarterlyRevenue);
        assert_eq!(tab.classification.basis, ClassificationBasis::Hint);
        let variance = tab
            .plan
            .charts
            .iter()
            .find(|c| c.kind == ChartKind::Variance)
            .unwrap();
        assert_eq!(variance.y_fields, vec!["Q3 Revenue", "Q4 Revenue"]);
        assert_eq!(tab.narrative.source, NarrativeSource::Fallback);
        assert!(tab.narrative.text.contains("## Key Insights"));
        assert_eq!(tab.title, "Quarterly Revenue Q3 Q4");
    }

    #[tokio::test]
    async fn test_quarterly_revenue_export() {
        let document = Document::from_value(
            "A._Quarterly_Revenue_and_QoQ_growth.json",
            json!([
                {"customer": "Acme", "q3_revenue": 100, "q4_revenue": 150},
                {"customer": "Globex", "q3_revenue": 200, "q4_revenue": 180},
            ]),
        );
        let tab = pipeline().run(&document).await.unwrap();

        assert_eq!(tab.classification.category, AnalysisCategory::QuarterlyRevenue);
        assert_eq!(tab.classification.basis, ClassificationBasis::Hint);
        let kinds: Vec<ChartKind> = tab.plan.charts.iter().map(|c| c.kind).collect();
        assert!(kinds.contains(&ChartKind::Variance));
        assert_eq!(kinds.last(), Some(&ChartKind::Table));
        assert!(!tab.narrative.text.is_empty());
    }

    #[tokio::test]
    async fn test_workbook_sheet_uses_file_name_hint() {
        let mut document = Document::from_value(
            "A._Quarterly_Revenue_and_QoQ_growth.xlsx#Sheet1",
            json!([
                {"Customer": "Acme", "Q3 Revenue": 100, "Q4 Revenue": 150},
                {"Customer": "Globex", "Q3 Revenue": 200, "Q4 Revenue": 180},
            ]),
        );
        document.sheet = Some("Sheet1".to_string());

        let planned = pipeline().plan(&document).unwrap();
        assert_eq!(planned.classification.category, AnalysisCategory::QuarterlyRevenue);
        assert_eq!(planned.classification.basis, ClassificationBasis::Hint);
    }

    #[tokio::test]
    async fn test_country_by_content() {
        let document = Document::from_value(
            "data.json",
            json!([
                {"country": "India", "revenue": 500},
                {"country": "Canada", "revenue": 300},
            ]),
        );
        let tab = pipeline().run(&document).await.unwrap();
        assert_eq!(tab.classification.category, AnalysisCategory::CountryWise);
        assert_eq!(tab.plan.charts[0].x_field.as_deref(), Some("country"));
    }

    #[tokio::test]
    async fn test_unrecognized_fields_use_generic_plan() {
        let document = Document::from_value("data.json", json!([{"foo": "x", "bar": "y"}]));
        let tab = pipeline().run(&document).await.unwrap();
        assert_eq!(tab.classification.category, AnalysisCategory::Unknown);
        assert!(!tab.plan.charts.is_empty());
        assert!(!tab.narrative.text.is_empty());
    }

    #[tokio::test]
    async fn test_generated_narrative_used_when_available() {
        let document = Document::from_value("quarterly.json", quarterly_payload());
        let tab = pipeline_with(Arc::new(Canned)).run(&document).await.unwrap();
        assert_eq!(tab.narrative.source, NarrativeSource::Generated);
        assert_eq!(tab.narrative.text, "Generated summary.");
    }

    #[tokio::test]
    async fn test_zero_records_is_malformed() {
        let document = Document::from_value("empty.json", json!([]));
        let err = pipeline().run(&document).await.unwrap_err();
        assert!(matches!(err, DashboardError::MalformedDocument { .. }));
    }

    #[tokio::test]
    async fn test_stages_are_cached() {
        let pipeline = pipeline();
        let document = Document::from_value("quarterly.json", quarterly_payload());

        let first = pipeline.plan(&document).unwrap();
        let second = pipeline.plan(&document).unwrap();

        assert!(Arc::ptr_eq(&first.schema, &second.schema));
        assert!(Arc::ptr_eq(&first.plan, &second.plan));
        let stats = pipeline.cache().stats();
        assert_eq!(stats.hits, 2);
        assert_eq!(stats.entries, 2);
    }

    #[tokio::test]
    async fn test_build_all_isolates_failures() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("customer_concentration.json"),
            r#"[{"Customer": "A", "Revenue": 10}, {"Customer": "B", "Revenue": 5}]"#,
        )
        .unwrap();
        std::fs::write(dir.path().join("broken.json"), "{ nope").unwrap();
        std::fs::write(dir.path().join("empty.json"), "[]").unwrap();
        std::fs::write(dir.path().join("monthly.csv"), "Month,Revenue\nJan 2024,10\nFeb 2024,12\n").unwrap();

        let source = LocalDirSource::new(dir.path());
        let report = pipeline().build_all(&source, None).await.unwrap();

        assert!(report.id.starts_with("dash_"));
        let tab_keys: Vec<&str> = report.tabs.iter().map(|t| t.key.as_str()).collect();
        assert_eq!(tab_keys, vec!["customer_concentration.json", "monthly.csv"]);
        let failed: Vec<&str> = report.failures.iter().map(|f| f.key.as_str()).collect();
        assert_eq!(failed, vec!["broken.json", "empty.json"]);
        assert_eq!(report.tabs[1].classification.category, AnalysisCategory::MonthlyRevenue);
    }

    #[tokio::test]
    async fn test_build_all_without_source_fails() {
        let dir = tempfile::tempdir().unwrap();
        let source = LocalDirSource::new(dir.path().join("missing"));
        let err = pipeline().build_all(&source, None).await.unwrap_err();
        assert!(matches!(err, DashboardError::SourceUnavailable { .. }));
    }

    #[tokio::test]
    async fn test_upload_records_unsupported_format() {
        let pipeline = pipeline();
        let report = pipeline.build_upload("notes.txt", b"hello").await;
        assert_eq!(report.source, "upload");
        assert!(report.tabs.is_empty());
        assert_eq!(report.failures.len(), 1);
        assert!(report.failures[0].error.contains("unsupported file type"));

        let report = pipeline
            .build_upload("Customer list.csv", b"Customer,Revenue\nA,10\nB,20\n")
            .await;
        assert_eq!(report.tabs.len(), 1);
        assert_eq!(
            report.tabs[0].classification.category,
            AnalysisCategory::CustomerConcentration
        );
    }

    #[tokio::test]
    async fn test_chat_falls_back_to_statistics() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("markets.json"),
            r#"[{"Country": "India", "Revenue": 10}, {"Country": "Canada", "Revenue": 5}]"#,
        )
        .unwrap();
        let source = LocalDirSource::new(dir.path());

        let reply = pipeline()
            .chat(&source, "markets.json", "Which is the top market?")
            .await
            .unwrap();
        assert_eq!(reply.answer.source, NarrativeSource::Fallback);
        assert!(reply.answer.text.contains("Top market: India (10.00)"));

        let missing = pipeline().chat(&source, "markets.json#Sheet9", "?").await;
        assert!(matches!(missing, Err(DashboardError::NotFound(_))));
    }
}
