//! Document sources: a local directory, an S3 bucket, and combinators.
//!
//! Keys are `/`-separated paths relative to the source root. Fingerprints
//! change whenever the content does: SHA-256 for local files, the ETag for
//! S3 objects.

use async_trait::async_trait;
use futures::TryStreamExt;
use object_store::aws::AmazonS3Builder;
use object_store::path::Path as ObjectPath;
use object_store::{ObjectMeta, ObjectStore};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::classifier::{category_from_hint, AnalysisCategory};
use crate::config::S3Settings;
use crate::document::{extension, file_name, fingerprint};
use crate::error::{DashboardError, Result};

pub const SUPPORTED_EXTENSIONS: &[&str] = &["json", "csv", "xlsx", "xlsm", "xlsb"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceEntry {
    pub key: String,
    pub fingerprint: String,
    pub size: u64,
    /// Parent folder relative to the source root, empty at the top level.
    pub folder: String,
}

#[async_trait]
pub trait DocumentSource: Send + Sync {
    fn name(&self) -> &str;

    /// Supported documents under `scope` (a folder), sorted by key.
    async fn list(&self, scope: Option<&str>) -> Result<Vec<SourceEntry>>;

    async fn fetch(&self, key: &str) -> Result<Vec<u8>>;
}

pub fn is_supported(key: &str) -> bool {
    SUPPORTED_EXTENSIONS.contains(&extension(key).as_str())
}

/// Group entries by the category their file name implies; names without a
/// hint land under `Unknown` until their content is analyzed.
pub fn group_by_hint(entries: Vec<SourceEntry>) -> BTreeMap<AnalysisCategory, Vec<SourceEntry>> {
    let mut groups: BTreeMap<AnalysisCategory, Vec<SourceEntry>> = BTreeMap::new();
    for entry in entries {
        let category = category_from_hint(file_name(&entry.key)).unwrap_or(AnalysisCategory::Unknown);
        groups.entry(category).or_default().push(entry);
    }
    groups
}

fn folder_of(relative_key: &str) -> String {
    relative_key
        .rsplit_once('/')
        .map(|(folder, _)| folder.to_string())
        .unwrap_or_default()
}

/// `raw` as a relative path with no `..`, root or prefix components.
fn safe_relative(raw: &str) -> Option<PathBuf> {
    let path = Path::new(raw.trim_matches('/'));
    let clean = path.components().all(|c| matches!(c, Component::Normal(_)));
    (clean && !raw.trim_matches('/').is_empty()).then(|| path.to_path_buf())
}

fn scope_of(scope: Option<&str>) -> Option<&str> {
    scope.map(|s| s.trim_matches('/')).filter(|s| !s.is_empty())
}

// ============================================================================
// Local directory
// ============================================================================

#[derive(Debug, Clone)]
pub struct LocalDirSource {
    root: PathBuf,
    label: String,
}

impl LocalDirSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let label = format!("local:{}", root.display());
        Self { root, label }
    }

    fn key_for(&self, path: &Path) -> Option<String> {
        let relative = path.strip_prefix(&self.root).ok()?;
        let parts: Option<Vec<&str>> = relative
            .components()
            .map(|c| match c {
                Component::Normal(s) => s.to_str(),
                _ => None,
            })
            .collect();
        Some(parts?.join("/"))
    }
}

#[async_trait]
impl DocumentSource for LocalDirSource {
    fn name(&self) -> &str {
        &self.label
    }

    async fn list(&self, scope: Option<&str>) -> Result<Vec<SourceEntry>> {
        let base = match scope_of(scope) {
            Some(s) => self
                .root
                .join(safe_relative(s).ok_or_else(|| DashboardError::NotFound(s.to_string()))?),
            None => self.root.clone(),
        };

        if let Err(e) = tokio::fs::metadata(&base).await {
            return Err(match scope_of(scope) {
                Some(s) => DashboardError::NotFound(s.to_string()),
                None => DashboardError::unavailable(&self.label, e.to_string()),
            });
        }

        let mut entries = Vec::new();
        let mut pending = vec![base];
        while let Some(dir) = pending.pop() {
            let mut reader = tokio::fs::read_dir(&dir).await?;
            while let Some(entry) = reader.next_entry().await? {
                let path = entry.path();
                if entry.file_name().to_string_lossy().starts_with('.') {
                    continue;
                }
                if entry.file_type().await?.is_dir() {
                    pending.push(path);
                    continue;
                }
                let Some(key) = self.key_for(&path) else {
                    continue;
                };
                if !is_supported(&key) {
                    continue;
                }
                let data = tokio::fs::read(&path).await?;
                entries.push(SourceEntry {
                    folder: folder_of(&key),
                    fingerprint: fingerprint(&data),
                    size: data.len() as u64,
                    key,
                });
            }
        }

        entries.sort_by(|a, b| a.key.cmp(&b.key));
        debug!("{}: listed {} documents", self.label, entries.len());
        Ok(entries)
    }

    async fn fetch(&self, key: &str) -> Result<Vec<u8>> {
        let relative = safe_relative(key).ok_or_else(|| DashboardError::NotFound(key.to_string()))?;
        match tokio::fs::read(self.root.join(relative)).await {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(DashboardError::NotFound(key.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }
}

// ============================================================================
// S3
// ============================================================================

pub struct S3Source {
    store: Arc<dyn ObjectStore>,
    label: String,
    prefix: Option<String>,
}

impl S3Source {
    pub fn from_settings(settings: &S3Settings) -> anyhow::Result<Self> {
        use anyhow::Context;

        let bucket = settings
            .bucket
            .as_deref()
            .context("S3_BUCKET_NAME is not set")?;

        let mut builder = AmazonS3Builder::new()
            .with_bucket_name(bucket)
            .with_region(settings.region.as_str());
        if let (Some(key), Some(secret)) = (&settings.access_key_id, &settings.secret_access_key) {
            builder = builder
                .with_access_key_id(key.as_str())
                .with_secret_access_key(secret.as_str());
        }
        let store = builder.build().context("Failed to build S3 client")?;

        info!("S3 source: bucket={} region={}", bucket, settings.region);
        Ok(Self::with_store(
            Arc::new(store),
            format!("s3://{}", bucket),
            settings.prefix.clone(),
        ))
    }

    pub fn with_store(store: Arc<dyn ObjectStore>, label: impl Into<String>, prefix: Option<String>) -> Self {
        let prefix = prefix
            .map(|p| p.trim_matches('/').to_string())
            .filter(|p| !p.is_empty());
        Self {
            store,
            label: label.into(),
            prefix,
        }
    }

    fn scoped_prefix(&self, scope: Option<&str>) -> Option<ObjectPath> {
        let parts: Vec<&str> = [self.prefix.as_deref(), scope_of(scope)]
            .into_iter()
            .flatten()
            .collect();
        (!parts.is_empty()).then(|| ObjectPath::from(parts.join("/")))
    }

    fn entry(&self, meta: ObjectMeta) -> SourceEntry {
        let key = meta.location.to_string();
        let relative = match &self.prefix {
            Some(prefix) => key
                .strip_prefix(prefix.as_str())
                .map(|k| k.trim_start_matches('/'))
                .unwrap_or(&key),
            None => &key,
        };
        let fingerprint = meta
            .e_tag
            .as_deref()
            .map(|tag| tag.trim_matches('"').to_string())
            .unwrap_or_else(|| format!("{}-{}", meta.size, meta.last_modified.timestamp()));

        SourceEntry {
            folder: folder_of(relative),
            fingerprint,
            size: meta.size as u64,
            key,
        }
    }
}

#[async_trait]
impl DocumentSource for S3Source {
    fn name(&self) -> &str {
        &self.label
    }

    async fn list(&self, scope: Option<&str>) -> Result<Vec<SourceEntry>> {
        let prefix = self.scoped_prefix(scope);
        let metas: Vec<ObjectMeta> = self
            .store
            .list(prefix.as_ref())
            .try_collect()
            .await
            .map_err(|e| DashboardError::unavailable(&self.label, e.to_string()))?;

        let mut entries: Vec<SourceEntry> = metas
            .into_iter()
            .filter(|m| is_supported(m.location.as_ref()))
            .map(|m| self.entry(m))
            .collect();
        entries.sort_by(|a, b| a.key.cmp(&b.key));
        debug!("{}: listed {} documents", self.label, entries.len());
        Ok(entries)
    }

    async fn fetch(&self, key: &str) -> Result<Vec<u8>> {
        if let Some(prefix) = &self.prefix {
            let inside = key
                .strip_prefix(prefix.as_str())
                .map(|rest| rest.starts_with('/'))
                .unwrap_or(false);
            if !inside {
                debug!("{}: '{}' is outside prefix '{}'", self.label, key, prefix);
                return Err(DashboardError::NotFound(key.to_string()));
            }
        }
        let path = ObjectPath::from(key);
        let result = self.store.get(&path).await.map_err(|e| match e {
            object_store::Error::NotFound { .. } => DashboardError::NotFound(key.to_string()),
            other => DashboardError::unavailable(&self.label, other.to_string()),
        })?;
        let bytes = result
            .bytes()
            .await
            .map_err(|e| DashboardError::unavailable(&self.label, e.to_string()))?;
        Ok(bytes.to_vec())
    }
}

// ============================================================================
// Combinators
// ============================================================================

/// Tries `primary` first and falls back to `secondary` on any failure.
pub struct FallbackSource {
    primary: Arc<dyn DocumentSource>,
    secondary: Arc<dyn DocumentSource>,
    label: String,
}

impl FallbackSource {
    pub fn new(primary: Arc<dyn DocumentSource>, secondary: Arc<dyn DocumentSource>) -> Self {
        let label = format!("{} (fallback {})", primary.name(), secondary.name());
        Self {
            primary,
            secondary,
            label,
        }
    }
}

#[async_trait]
impl DocumentSource for FallbackSource {
    fn name(&self) -> &str {
        &self.label
    }

    async fn list(&self, scope: Option<&str>) -> Result<Vec<SourceEntry>> {
        match self.primary.list(scope).await {
            Ok(entries) => Ok(entries),
            Err(primary_err) => {
                warn!("{}; falling back to {}", primary_err, self.secondary.name());
                self.secondary.list(scope).await.map_err(|e| {
                    DashboardError::unavailable(&self.label, format!("{}; {}", primary_err, e))
                })
            }
        }
    }

    async fn fetch(&self, key: &str) -> Result<Vec<u8>> {
        match self.primary.fetch(key).await {
            Ok(data) => Ok(data),
            Err(e) => {
                debug!("{} could not fetch '{}': {}", self.primary.name(), key, e);
                self.secondary.fetch(key).await
            }
        }
    }
}

/// Reuses each scope's listing for `ttl`; fetches pass straight through.
pub struct MemoizedSource {
    inner: Arc<dyn DocumentSource>,
    ttl: Duration,
    listings: RwLock<HashMap<String, (Instant, Vec<SourceEntry>)>>,
}

impl MemoizedSource {
    pub fn new(inner: Arc<dyn DocumentSource>, ttl: Duration) -> Self {
        Self {
            inner,
            ttl,
            listings: RwLock::new(HashMap::new()),
        }
    }

    /// List `scope`, bypassing any remembered listing when `refresh` is set.
    pub async fn list_with(&self, scope: Option<&str>, refresh: bool) -> Result<Vec<SourceEntry>> {
        let memo_key = scope_of(scope).unwrap_or_default().to_string();

        if !refresh {
            let listings = self.listings.read().unwrap_or_else(PoisonError::into_inner);
            if let Some((listed_at, entries)) = listings.get(&memo_key) {
                if listed_at.elapsed() < self.ttl {
                    return Ok(entries.clone());
                }
            }
        }

        let entries = self.inner.list(scope).await?;
        let mut listings = self.listings.write().unwrap_or_else(PoisonError::into_inner);
        listings.retain(|_, (listed_at, _)| listed_at.elapsed() < self.ttl);
        // Empty listings are not remembered, so unknown scopes leave no entry.
        if !entries.is_empty() {
            listings.insert(memo_key, (Instant::now(), entries.clone()));
        }
        Ok(entries)
    }

    pub fn invalidate(&self) {
        self.listings
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

#[async_trait]
impl DocumentSource for MemoizedSource {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn list(&self, scope: Option<&str>) -> Result<Vec<SourceEntry>> {
        self.list_with(scope, false).await
    }

    async fn fetch(&self, key: &str) -> Result<Vec<u8>> {
        self.inner.fetch(key).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use object_store::memory::InMemory;
    use object_store::PutPayload;

    fn write(dir: &Path, relative: &str, content: &str) {
        let path = dir.join(relative);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, content).unwrap();
    }

    #[tokio::test]
    async fn test_local_list_and_fetch() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "acme/quarterly_revenue.json", "[]");
        write(dir.path(), "acme/notes.txt", "skip");
        write(dir.path(), "country_wise.csv", "Country,Revenue\nIndia,1\n");
        write(dir.path(), ".hidden.json", "[]");

        let source = LocalDirSource::new(dir.path());
        let entries = source.list(None).await.unwrap();
        let keys: Vec<&str> = entries.iter().map(|e| e.key.as_str()).collect();
        assert_eq!(keys, vec!["acme/quarterly_revenue.json", "country_wise.csv"]);
        assert_eq!(entries[0].folder, "acme");
        assert_eq!(entries[0].fingerprint, fingerprint(b"[]"));
        assert_eq!(entries[1].folder, "");

        let scoped = source.list(Some("acme")).await.unwrap();
        assert_eq!(scoped.len(), 1);

        assert_eq!(source.fetch("acme/quarterly_revenue.json").await.unwrap(), b"[]");
        assert!(matches!(
            source.fetch("missing.json").await,
            Err(DashboardError::NotFound(_))
        ));
        assert!(matches!(
            source.fetch("../etc/passwd").await,
            Err(DashboardError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_local_missing_root_is_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let source = LocalDirSource::new(dir.path().join("nope"));
        assert!(matches!(
            source.list(None).await,
            Err(DashboardError::SourceUnavailable { .. })
        ));
    }

    async fn memory_store() -> Arc<dyn ObjectStore> {
        let store = InMemory::new();
        for (key, body) in [
            ("data/acme/monthly.json", "[1]"),
            ("data/acme/readme.md", "#"),
            ("data/globex/customers.csv", "a\n1\n"),
            ("other/x.json", "[]"),
        ] {
            store
                .put(&ObjectPath::from(key), PutPayload::from(body.as_bytes().to_vec()))
                .await
                .unwrap();
        }
        Arc::new(store)
    }

    #[tokio::test]
    async fn test_s3_list_scoped_by_prefix() {
        let source = S3Source::with_store(memory_store().await, "s3://test", Some("data/".to_string()));

        let entries = source.list(None).await.unwrap();
        let keys: Vec<&str> = entries.iter().map(|e| e.key.as_str()).collect();
        assert_eq!(keys, vec!["data/acme/monthly.json", "data/globex/customers.csv"]);
        assert_eq!(entries[0].folder, "acme");
        assert!(!entries[0].fingerprint.is_empty());

        let scoped = source.list(Some("globex")).await.unwrap();
        assert_eq!(scoped.len(), 1);

        assert_eq!(source.fetch("data/acme/monthly.json").await.unwrap(), b"[1]");
        assert!(matches!(
            source.fetch("data/none.json").await,
            Err(DashboardError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_s3_fetch_stays_inside_prefix() {
        let source = S3Source::with_store(memory_store().await, "s3://test", Some("data".to_string()));
        for key in ["other/x.json", "database.json", "data"] {
            assert!(matches!(source.fetch(key).await, Err(DashboardError::NotFound(_))));
        }

        let unscoped = S3Source::with_store(memory_store().await, "s3://test", None);
        assert_eq!(unscoped.fetch("other/x.json").await.unwrap(), b"[]");
    }

    #[tokio::test]
    async fn test_memoized_listings_do_not_accumulate() {
        let s3 = Arc::new(S3Source::with_store(memory_store().await, "s3://test", Some("data".to_string())));
        let source = MemoizedSource::new(s3.clone(), Duration::from_secs(60));

        for scope in ["nope-1", "nope-2", "nope-3"] {
            assert!(source.list(Some(scope)).await.unwrap().is_empty());
        }
        assert_eq!(source.listings.read().unwrap().len(), 0);
        assert_eq!(source.list(Some("acme")).await.unwrap().len(), 1);
        assert_eq!(source.listings.read().unwrap().len(), 1);

        let expiring = MemoizedSource::new(s3, Duration::ZERO);
        expiring.list(Some("acme")).await.unwrap();
        expiring.list(Some("globex")).await.unwrap();
        assert_eq!(expiring.listings.read().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_fallback_uses_secondary_when_primary_fails() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "bridge.json", "[]");

        let broken = Arc::new(LocalDirSource::new(dir.path().join("missing")));
        let local = Arc::new(LocalDirSource::new(dir.path()));
        let source = FallbackSource::new(broken, local);

        let entries = source.list(None).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(source.fetch("bridge.json").await.unwrap(), b"[]");
    }

    #[tokio::test]
    async fn test_fallback_with_no_usable_source() {
        let dir = tempfile::tempdir().unwrap();
        let source = FallbackSource::new(
            Arc::new(LocalDirSource::new(dir.path().join("a"))),
            Arc::new(LocalDirSource::new(dir.path().join("b"))),
        );
        assert!(matches!(
            source.list(None).await,
            Err(DashboardError::SourceUnavailable { .. })
        ));
    }

    #[tokio::test]
    async fn test_memoized_listing_and_refresh() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "a.json", "[]");
        let source = MemoizedSource::new(Arc::new(LocalDirSource::new(dir.path())), Duration::from_secs(60));

        assert_eq!(source.list(None).await.unwrap().len(), 1);
        write(dir.path(), "b.json", "[]");
        assert_eq!(source.list(None).await.unwrap().len(), 1);
        assert_eq!(source.list_with(None, true).await.unwrap().len(), 2);

        write(dir.path(), "c.json", "[]");
        source.invalidate();
        assert_eq!(source.list(None).await.unwrap().len(), 3);
    }

    #[test]
    fn test_group_by_hint() {
        let entry = |key: &str| SourceEntry {
            key: key.to_string(),
            fingerprint: String::new(),
            size: 0,
            folder: String::new(),
        };
        let groups = group_by_hint(vec![
            entry("acme/Quarterly Revenue.json"),
            entry("acme/churn_bridge.json"),
            entry("acme/misc.json"),
        ]);
        assert_eq!(groups[&AnalysisCategory::QuarterlyRevenue].len(), 1);
        assert_eq!(groups[&AnalysisCategory::RevenueBridge].len(), 1);
        assert_eq!(groups[&AnalysisCategory::Unknown].len(), 1);
    }
}
