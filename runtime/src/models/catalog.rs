use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::error::ModelError;
use crate::notify::Notifier;

/// Manifest consulted when no override is configured.
pub const DEFAULT_MANIFEST_URL: &str = "https://models.localmind.app/v1/manifest.json";

/// How long a fetched catalog is served from memory.
pub const CATALOG_CACHE_TTL: Duration = Duration::from_secs(60 * 60);

/// One downloadable encoding of a model's weights.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Quantization {
    /// File name in the managed models directory (e.g., "llama-3.2-3b-q4_k_m.gguf")
    pub file_name: String,
    pub url: String,
    /// Size of the file in bytes, as advertised by the manifest
    pub size_bytes: u64,
    /// Quantization level label (e.g., "Q4_K_M")
    pub level: String,
    /// SHA-256 checksum (hex string), when the manifest provides one
    pub sha256: Option<String>,
}

/// A model available for download.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CatalogEntry {
    /// Unique identifier, no spaces (e.g., "llama-3.2-3b-instruct")
    pub id: String,
    /// Human-readable name
    pub name: String,
    pub description: String,
    pub quantizations: Vec<Quantization>,
}

impl CatalogEntry {
    pub fn quantization(&self, level: &str) -> Option<&Quantization> {
        self.quantizations
            .iter()
            .find(|q| q.level.eq_ignore_ascii_case(level))
    }
}

// Wire shapes: keys are lower-cased before these are deserialized.

#[derive(Deserialize)]
struct ManifestEntry {
    id: String,
    name: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    quantizations: Vec<ManifestQuantization>,
}

#[derive(Deserialize)]
struct ManifestQuantization {
    #[serde(alias = "file_name")]
    filename: String,
    url: String,
    #[serde(default, alias = "sizebytes", alias = "size_bytes")]
    size: u64,
    #[serde(default, alias = "quantization")]
    level: String,
    #[serde(default)]
    sha256: Option<String>,
}

impl From<ManifestQuantization> for Quantization {
    fn from(q: ManifestQuantization) -> Self {
        Self {
            file_name: q.filename,
            url: q.url,
            size_bytes: q.size,
            level: q.level,
            sha256: q.sha256.filter(|s| !s.is_empty()),
        }
    }
}

impl From<ManifestEntry> for CatalogEntry {
    fn from(e: ManifestEntry) -> Self {
        Self {
            id: e.id,
            name: e.name,
            description: e.description,
            quantizations: e.quantizations.into_iter().map(Into::into).collect(),
        }
    }
}

fn lowercase_keys(value: Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(k, v)| (k.to_lowercase(), lowercase_keys(v)))
                .collect::<Map<_, _>>(),
        ),
        Value::Array(items) => Value::Array(items.into_iter().map(lowercase_keys).collect()),
        other => other,
    }
}

/// Parse a manifest body. Field names are matched case-insensitively.
pub fn parse_manifest(body: &str) -> Result<Vec<CatalogEntry>, ModelError> {
    let value: Value = serde_json::from_str(body)
        .map_err(|e| ModelError::CatalogUnavailable(format!("Invalid manifest: {}", e)))?;

    let entries: Vec<ManifestEntry> = serde_json::from_value(lowercase_keys(value))
        .map_err(|e| ModelError::CatalogUnavailable(format!("Invalid manifest: {}", e)))?;

    Ok(entries.into_iter().map(Into::into).collect())
}

/// Where the raw manifest comes from.
#[async_trait]
pub trait ManifestSource: Send + Sync {
    async fn fetch(&self) -> Result<String, ModelError>;
}

/// Fetches the manifest with an HTTP GET.
pub struct HttpManifestSource {
    client: reqwest::Client,
    url: String,
}

impl HttpManifestSource {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

impl Default for HttpManifestSource {
    fn default() -> Self {
        Self::new(DEFAULT_MANIFEST_URL)
    }
}

#[async_trait]
impl ManifestSource for HttpManifestSource {
    async fn fetch(&self) -> Result<String, ModelError> {
        debug!("Fetching model manifest from {}", self.url);

        let response = self
            .client
            .get(&self.url)
            .send()
            .await
            .map_err(|e| ModelError::CatalogUnavailable(format!("Request failed: {}", e)))?;

        if !response.status().is_success() {
            return Err(ModelError::CatalogUnavailable(format!(
                "Manifest request failed with status: {}",
                response.status()
            )));
        }

        response
            .text()
            .await
            .map_err(|e| ModelError::CatalogUnavailable(format!("Failed to read body: {}", e)))
    }
}

struct CachedCatalog {
    models: Vec<CatalogEntry>,
    fetched_at: Instant,
}

/// Cached view of the downloadable model catalog.
///
/// Never fails: a fetch or parse error yields an empty list and a warning
/// notification. Failed fetches are not cached, so the next call retries.
pub struct CatalogClient {
    source: Box<dyn ManifestSource>,
    notifier: Notifier,
    ttl: Duration,
    // Held across the fetch so concurrent callers share one request
    cache: Mutex<Option<CachedCatalog>>,
}

impl CatalogClient {
    pub fn new(source: impl ManifestSource + 'static, notifier: Notifier) -> Self {
        Self {
            source: Box::new(source),
            notifier,
            ttl: CATALOG_CACHE_TTL,
            cache: Mutex::new(None),
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Get the catalog, from cache when it is younger than the TTL.
    pub async fn fetch_models(&self) -> Vec<CatalogEntry> {
        let mut cache = self.cache.lock().await;

        if let Some(cached) = cache.as_ref() {
            if cached.fetched_at.elapsed() < self.ttl {
                debug!("Serving {} catalog entries from cache", cached.models.len());
                return cached.models.clone();
            }
        }

        match self.fetch_uncached().await {
            Ok(models) => {
                info!("Fetched model catalog: {} entries", models.len());
                *cache = Some(CachedCatalog {
                    models: models.clone(),
                    fetched_at: Instant::now(),
                });
                models
            }
            Err(e) => {
                warn!("Failed to fetch model catalog: {}", e);
                self.notifier
                    .warning("Model catalog unavailable", &e.user_message());
                Vec::new()
            }
        }
    }

    async fn fetch_uncached(&self) -> Result<Vec<CatalogEntry>, ModelError> {
        let body = self.source.fetch().await?;
        parse_manifest(&body)
    }

    /// Look up a catalog entry by id.
    pub async fn find(&self, id: &str) -> Option<CatalogEntry> {
        self.fetch_models().await.into_iter().find(|e| e.id == id)
    }

    /// Drop the cached catalog so the next call fetches again.
    pub async fn invalidate(&self) {
        *self.cache.lock().await = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::NotificationSeverity;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;

    const MANIFEST: &str = r#"[
        {
            "Id": "llama-3.2-3b-instruct",
            "NAME": "Llama 3.2 3B Instruct",
            "description": "Small general-purpose chat model",
            "Quantizations": [
                {
                    "FileName": "llama-3.2-3b-instruct-q4_k_m.gguf",
                    "Url": "https://example.invalid/llama-q4.gguf",
                    "Size": 2019377696,
                    "Level": "Q4_K_M"
                },
                {
                    "file_name": "llama-3.2-3b-instruct-q8_0.gguf",
                    "url": "https://example.invalid/llama-q8.gguf",
                    "size": 3421899456,
                    "level": "Q8_0",
                    "sha256": "abc123"
                }
            ]
        }
    ]"#;

    #[derive(Clone)]
    struct CountingSource {
        calls: Arc<AtomicUsize>,
        fail: Arc<AtomicBool>,
    }

    impl CountingSource {
        fn new() -> Self {
            Self {
                calls: Arc::new(AtomicUsize::new(0)),
                fail: Arc::new(AtomicBool::new(false)),
            }
        }
    }

    #[async_trait]
    impl ManifestSource for CountingSource {
        async fn fetch(&self) -> Result<String, ModelError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail.load(Ordering::SeqCst) {
                return Err(ModelError::CatalogUnavailable("connection refused".into()));
            }
            Ok(MANIFEST.to_string())
        }
    }

    #[test]
    fn test_parse_manifest_matches_fields_case_insensitively() {
        let models = parse_manifest(MANIFEST).unwrap();

        assert_eq!(models.len(), 1);
        let model = &models[0];
        assert_eq!(model.id, "llama-3.2-3b-instruct");
        assert_eq!(model.name, "Llama 3.2 3B Instruct");
        assert_eq!(model.quantizations.len(), 2);

        let q4 = model.quantization("q4_k_m").unwrap();
        assert_eq!(q4.file_name, "llama-3.2-3b-instruct-q4_k_m.gguf");
        assert_eq!(q4.size_bytes, 2_019_377_696);
        assert_eq!(q4.sha256, None);

        let q8 = model.quantization("Q8_0").unwrap();
        assert_eq!(q8.sha256.as_deref(), Some("abc123"));
    }

    #[test]
    fn test_parse_manifest_rejects_garbage() {
        let test_cases = vec![
            ("not json", "{{{"),
            ("not an array", r#"{"id": "x"}"#),
            ("missing url", r#"[{"id": "x", "name": "X", "quantizations": [{"filename": "x.gguf"}]}]"#),
        ];

        for (description, body) in test_cases {
            assert!(
                matches!(parse_manifest(body), Err(ModelError::CatalogUnavailable(_))),
                "{} should fail",
                description
            );
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_fetch_is_cached_for_an_hour() {
        let source = CountingSource::new();
        let client = CatalogClient::new(source.clone(), Notifier::new());

        assert_eq!(client.fetch_models().await.len(), 1);
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);

        tokio::time::advance(Duration::from_secs(10 * 60)).await;
        assert_eq!(client.fetch_models().await.len(), 1);
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);

        tokio::time::advance(Duration::from_secs(51 * 60)).await;
        assert_eq!(client.fetch_models().await.len(), 1);
        assert_eq!(source.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_failure_yields_empty_list_and_notification() {
        let source = CountingSource::new();
        source.fail.store(true, Ordering::SeqCst);
        let notifier = Notifier::new();
        let mut notifications = notifier.subscribe();
        let client = CatalogClient::new(source.clone(), notifier);

        assert!(client.fetch_models().await.is_empty());

        let notification = notifications.try_recv().unwrap();
        assert_eq!(notification.severity, NotificationSeverity::Warning);
        assert!(!notification.message.contains("connection refused"));

        // Failures are not cached
        source.fail.store(false, Ordering::SeqCst);
        assert_eq!(client.fetch_models().await.len(), 1);
        assert_eq!(source.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_invalidate_forces_refetch() {
        let source = CountingSource::new();
        let client = CatalogClient::new(source.clone(), Notifier::new());

        client.fetch_models().await;
        client.invalidate().await;
        assert!(client.find("llama-3.2-3b-instruct").await.is_some());
        assert_eq!(source.calls.load(Ordering::SeqCst), 2);
    }
}
