//! Portfolio Dashboard - classifies financial datasets and renders dashboards with narratives.

mod cache;
mod classifier;
mod config;
mod document;
mod error;
mod narrative;
mod openai;
mod pipeline;
mod recipes;
mod router;
mod schema;
mod sheet_parser;
mod source;

use axum::{
    extract::{DefaultBodyLimit, Multipart, Path, Query, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use cache::{CacheStats, TtlCache};
use classifier::AnalysisCategory;
use config::{AppConfig, ConfigValidation};
use error::DashboardError;
use narrative::Narrator;
use openai::{OpenAiClient, TextGenerator, Unconfigured};
use pipeline::{ChatReply, DashboardReport, Pipeline};
use recipes::{DashboardRecipe, RecipeBook};
use serde::{Deserialize, Serialize};
use source::{DocumentSource, FallbackSource, LocalDirSource, MemoizedSource, S3Source, SourceEntry};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const S3_PROBE_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_PURGE_INTERVAL: Duration = Duration::from_secs(3600);

/// Application state shared across handlers.
#[derive(Clone)]
struct AppState {
    pipeline: Arc<Pipeline>,
    source: Arc<MemoizedSource>,
    /// Present only when S3 settings are complete; checked by `/config/status`.
    s3: Option<Arc<S3Source>>,
    config: Arc<AppConfig>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| "portfolio_dashboard=debug,tower_http=debug".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = AppConfig::from_env()?;

    let mut recipes = RecipeBook::builtin();
    if let Some(dir) = &config.recipes_dir {
        recipes = recipes.with_overrides_from_dir(dir)?;
    }
    info!("Loaded {} dashboard recipes", recipes.all().len());

    let cache = TtlCache::new(config.cache_ttl);
    spawn_purge_task(cache.clone(), config.cache_ttl);

    let generator: Arc<dyn TextGenerator> = match &config.openai_api_key {
        Some(key) => {
            let client = OpenAiClient::new(key.clone(), config.generation.timeout)?
                .with_model(config.openai_model.clone());
            info!("OpenAI client initialized (model {})", client.model());
            Arc::new(client)
        }
        None => {
            warn!("OPENAI_API_KEY not set; narratives will use computed statistics only");
            Arc::new(Unconfigured)
        }
    };
    let narrator = Narrator::new(generator, config.generation);
    info!("Narratives generated via {}", narrator.generator_name());
    let pipeline = Pipeline::new(Arc::new(recipes), cache, narrator);

    let local: Arc<dyn DocumentSource> = Arc::new(LocalDirSource::new(config.local_data_dir.clone()));
    let s3 = if config.s3.is_configured() {
        match S3Source::from_settings(&config.s3) {
            Ok(source) => Some(Arc::new(source)),
            Err(e) => {
                warn!("S3 source disabled: {:#}", e);
                None
            }
        }
    } else {
        None
    };
    let inner: Arc<dyn DocumentSource> = match &s3 {
        Some(s3) => Arc::new(FallbackSource::new(s3.clone(), local)),
        None => local,
    };
    info!("Reading documents from {}", inner.name());
    let source = Arc::new(MemoizedSource::new(inner, config.data_refresh));

    let bind_addr = config.bind_addr.clone();
    let state = AppState {
        pipeline: Arc::new(pipeline),
        source,
        s3,
        config: Arc::new(config),
    };

    let app = Router::new()
        .route("/health", get(health))
        .route("/config/status", get(config_status))
        .route("/recipes", get(list_recipes))
        .route("/recipes/:category", get(get_recipe))
        .route("/documents", get(list_documents))
        .route("/dashboard", get(build_dashboard))
        .route("/dashboard/*key", get(build_document_dashboard))
        .route("/analyze", post(analyze_upload))
        .route("/chat", post(chat))
        .route("/cache", get(cache_stats).delete(clear_cache))
        .layer(DefaultBodyLimit::max(100 * 1024 * 1024)) // 100MB
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!("Server listening on http://{}", bind_addr);
    axum::serve(listener, app).await?;

    Ok(())
}

/// Evict expired stage outputs once per TTL period, at least hourly.
fn spawn_purge_task<V: Clone + Send + Sync + 'static>(cache: TtlCache<V>, ttl: Duration) {
    if ttl.is_zero() {
        return;
    }
    let period = ttl.min(MAX_PURGE_INTERVAL);
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        loop {
            interval.tick().await;
            let purged = cache.purge_expired();
            if purged > 0 {
                info!("Purged {} expired cache entries", purged);
            }
        }
    });
}

// ============================================================================
// Handlers
// ============================================================================

/// Health check endpoint.
async fn health() -> &'static str {
    "ok"
}

/// Validate S3 settings and, when complete, try listing the bucket.
async fn config_status(State(state): State<AppState>) -> Json<ConfigValidation> {
    let mut validation = state.config.s3.validate();

    if validation.is_valid {
        match &state.s3 {
            Some(s3) => match tokio::time::timeout(S3_PROBE_TIMEOUT, s3.list(None)).await {
                Ok(Ok(entries)) => info!("S3 connection check listed {} documents", entries.len()),
                Ok(Err(e)) => validation.connection_failed(e),
                Err(_) => validation.connection_failed(format!("no response within {:?}", S3_PROBE_TIMEOUT)),
            },
            None => validation.connection_failed("client could not be built from the settings"),
        }
    }

    Json(validation)
}

async fn list_recipes(State(state): State<AppState>) -> Json<Vec<DashboardRecipe>> {
    Json(state.pipeline.recipes().all().into_iter().cloned().collect())
}

async fn get_recipe(
    State(state): State<AppState>,
    Path(category): Path<String>,
) -> Result<Json<DashboardRecipe>, (StatusCode, String)> {
    let category: AnalysisCategory = category
        .parse()
        .map_err(|e: String| (StatusCode::NOT_FOUND, e))?;
    Ok(Json(state.pipeline.recipes().get(category).clone()))
}

#[derive(Deserialize)]
struct ListQuery {
    scope: Option<String>,
    #[serde(default)]
    refresh: bool,
}

#[derive(Serialize)]
struct DocumentListing {
    source: String,
    total: usize,
    groups: BTreeMap<AnalysisCategory, Vec<SourceEntry>>,
}

/// Supported documents under a scope, grouped by the category their names imply.
async fn list_documents(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Result<Json<DocumentListing>, (StatusCode, String)> {
    let entries = state
        .source
        .list_with(query.scope.as_deref(), query.refresh)
        .await
        .map_err(error_response)?;

    Ok(Json(DocumentListing {
        source: state.source.name().to_string(),
        total: entries.len(),
        groups: source::group_by_hint(entries),
    }))
}

/// One dashboard tab per document under the scope.
async fn build_dashboard(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Result<Json<DashboardReport>, (StatusCode, String)> {
    if query.refresh {
        state.source.invalidate();
    }

    let report = state
        .pipeline
        .build_all(state.source.as_ref(), query.scope.as_deref())
        .await
        .map_err(error_response)?;
    Ok(Json(report))
}

/// Dashboard for a single document; `file.xlsx#Sheet1` selects one sheet.
async fn build_document_dashboard(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> Result<Json<DashboardReport>, (StatusCode, String)> {
    let key = key.trim_start_matches('/');
    let report = state
        .pipeline
        .build_document(state.source.as_ref(), key)
        .await
        .map_err(error_response)?;
    Ok(Json(report))
}

/// Upload a document and build its dashboard without storing it.
async fn analyze_upload(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<DashboardReport>, (StatusCode, String)> {
    let mut filename = String::new();
    let mut file_data = Vec::new();

    while let Some(field) = multipart.next_field().await.map_err(|e| {
        (StatusCode::BAD_REQUEST, format!("Multipart error: {}", e))
    })? {
        if field.name() == Some("file") {
            filename = field.file_name().unwrap_or("upload.json").to_string();
            file_data = field.bytes().await.map_err(|e| {
                (StatusCode::BAD_REQUEST, format!("Failed to read file: {}", e))
            })?.to_vec();
            break;
        }
    }

    if file_data.is_empty() {
        return Err((StatusCode::BAD_REQUEST, "No file uploaded".to_string()));
    }

    info!("Received file: {} ({} bytes)", filename, file_data.len());
    let report = state.pipeline.build_upload(&filename, &file_data).await;

    if report.tabs.is_empty() {
        let reasons: Vec<&str> = report.failures.iter().map(|f| f.error.as_str()).collect();
        return Err((StatusCode::UNPROCESSABLE_ENTITY, reasons.join("; ")));
    }
    Ok(Json(report))
}

#[derive(Deserialize)]
struct ChatRequest {
    key: String,
    question: String,
}

/// Answer a question about one document.
async fn chat(
    State(state): State<AppState>,
    Json(request): Json<ChatRequest>,
) -> Result<Json<ChatReply>, (StatusCode, String)> {
    if request.question.trim().is_empty() {
        return Err((StatusCode::BAD_REQUEST, "Question must not be empty".to_string()));
    }

    let reply = state
        .pipeline
        .chat(state.source.as_ref(), &request.key, &request.question)
        .await
        .map_err(error_response)?;
    Ok(Json(reply))
}

async fn cache_stats(State(state): State<AppState>) -> Json<CacheStats> {
    Json(state.pipeline.cache().stats())
}

/// Drop every cached stage output and remembered listing.
async fn clear_cache(State(state): State<AppState>) -> Json<CacheStats> {
    let stats = state.pipeline.cache().stats();
    state.pipeline.cache().clear();
    state.source.invalidate();
    info!("Cleared {} cache entries", stats.entries);
    Json(stats)
}

// ============================================================================
// Helper functions
// ============================================================================

fn error_response(e: DashboardError) -> (StatusCode, String) {
    let status = match &e {
        DashboardError::SourceUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
        DashboardError::NotFound(_) => StatusCode::NOT_FOUND,
        DashboardError::MalformedDocument { .. }
        | DashboardError::UnsupportedFormat(_) => StatusCode::UNPROCESSABLE_ENTITY,
        DashboardError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };

    match &e {
        DashboardError::SourceUnavailable { .. } => {
            error!("No document source available: {}", e);
            (
                status,
                format!(
                    "{}. Configure S3 via S3_BUCKET_NAME, AWS_ACCESS_KEY_ID and AWS_SECRET_ACCESS_KEY, \
                     or place documents in LOCAL_DATA_DIR. See /config/status for details.",
                    e
                ),
            )
        }
        _ => (status, e.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_status_mapping() {
        let (status, body) = error_response(DashboardError::unavailable("local:data", "missing"));
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert!(body.contains("/config/status"));

        let (status, _) = error_response(DashboardError::NotFound("a.json".to_string()));
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = error_response(DashboardError::malformed("a.json", "empty"));
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    }
}
