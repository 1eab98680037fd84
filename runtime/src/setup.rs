use std::path::PathBuf;
use std::sync::Arc;

use localmind_native_log::{LogLevel, NativeLogBridge, NativeLogHook, SubscriptionId};
use log::{info, warn};

use crate::config::{ConfigKey, ConfigStore, RuntimeConfig};
use crate::error::Error;
use crate::models::{
    CatalogClient, DownloadError, DownloadManager, HttpManifestSource, InferenceBackend,
    JsonModelRegistry, ModelLoader, ModelRegistry, SessionManager, DEFAULT_MANIFEST_URL,
};
use crate::notify::Notifier;

/// Target native runtime records are forwarded under.
pub const NATIVE_LOG_TARGET: &str = "llama";

/// Where the runtime keeps models and finds its catalog.
#[derive(Debug, Clone, PartialEq)]
pub struct LocalRuntimeConfig {
    pub models_dir: PathBuf,
    pub manifest_url: String,
}

impl LocalRuntimeConfig {
    /// `<data dir>/localmind/models`, or `./localmind/models` when the
    /// platform has no data directory.
    pub fn default_models_dir() -> PathBuf {
        dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("localmind")
            .join("models")
    }

    /// Defaults, overridden by whatever the store holds under `runtimeConfig`.
    pub fn from_store(store: &impl ConfigStore) -> Self {
        let stored = store.get(&ConfigKey::RUNTIME).unwrap_or_default();
        Self::from(stored)
    }
}

impl From<RuntimeConfig> for LocalRuntimeConfig {
    fn from(config: RuntimeConfig) -> Self {
        Self {
            models_dir: config
                .models_dir
                .unwrap_or_else(Self::default_models_dir),
            manifest_url: config
                .manifest_url
                .unwrap_or_else(|| DEFAULT_MANIFEST_URL.to_string()),
        }
    }
}

impl Default for LocalRuntimeConfig {
    fn default() -> Self {
        Self::from(RuntimeConfig::default())
    }
}

/// The local model subsystem, wired together.
///
/// Build one at startup with [`initialize`](Self::initialize), share it, and
/// call [`shutdown`](Self::shutdown) before exit.
pub struct LocalRuntime {
    notifier: Notifier,
    native_logs: NativeLogBridge,
    log_forwarding: SubscriptionId,
    registry: Arc<dyn ModelRegistry>,
    catalog: CatalogClient,
    downloads: DownloadManager,
    loader: ModelLoader,
    sessions: SessionManager,
}

impl LocalRuntime {
    /// Wire up the subsystem over `backend`.
    ///
    /// When `hook` is given, native runtime logs are captured and forwarded
    /// to the `log` facade. A hook that fails to install is logged and
    /// otherwise ignored.
    pub fn initialize(
        config: LocalRuntimeConfig,
        backend: Arc<dyn InferenceBackend>,
        hook: Option<&dyn NativeLogHook>,
    ) -> Result<Self, Error> {
        info!("localmind v{}", env!("CARGO_PKG_VERSION"));

        let notifier = Notifier::new();

        let native_logs = NativeLogBridge::new();
        if let Some(hook) = hook {
            if let Err(e) = native_logs.initialize(hook) {
                warn!("Native runtime logs will not be captured: {}", e);
            }
        }
        let log_forwarding = native_logs.subscribe(|entry| {
            let level = match entry.level {
                LogLevel::Info => log::Level::Debug,
                LogLevel::Warning => log::Level::Warn,
                LogLevel::Error => log::Level::Error,
            };
            log::log!(target: NATIVE_LOG_TARGET, level, "{}", entry.message);
        });

        std::fs::create_dir_all(&config.models_dir)?;
        let registry: Arc<dyn ModelRegistry> =
            Arc::new(JsonModelRegistry::open(&config.models_dir)?);

        let catalog = CatalogClient::new(
            HttpManifestSource::new(config.manifest_url.clone()),
            notifier.clone(),
        );
        let downloads =
            DownloadManager::new(config.models_dir.clone(), registry.clone(), notifier.clone())?;
        let loader = ModelLoader::new(backend, notifier.clone());
        let sessions = SessionManager::new(loader.clone());

        Ok(Self {
            notifier,
            native_logs,
            log_forwarding,
            registry,
            catalog,
            downloads,
            loader,
            sessions,
        })
    }

    /// [`initialize`](Self::initialize) over llama.cpp, capturing its logs.
    #[cfg(feature = "llama")]
    pub fn initialize_llama(config: LocalRuntimeConfig) -> Result<Self, Error> {
        let hook = localmind_native_log::LlamaLogHook;
        let backend = crate::models::LlamaCppBackend::new()?;
        Self::initialize(config, Arc::new(backend), Some(&hook))
    }

    pub fn notifier(&self) -> &Notifier {
        &self.notifier
    }

    pub fn native_logs(&self) -> &NativeLogBridge {
        &self.native_logs
    }

    pub fn registry(&self) -> &Arc<dyn ModelRegistry> {
        &self.registry
    }

    pub fn catalog(&self) -> &CatalogClient {
        &self.catalog
    }

    pub fn downloads(&self) -> &DownloadManager {
        &self.downloads
    }

    pub fn loader(&self) -> &ModelLoader {
        &self.loader
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    /// Delete a downloaded model, unloading it first if it is the loaded one.
    pub fn delete_model(&self, file_name: &str) -> Result<(), DownloadError> {
        let target = self.downloads.models_dir().join(file_name);
        if self.loader.loaded_path().as_deref() == Some(target.as_path()) {
            info!("Unloading {:?} before deleting it", target);
            self.sessions.end_all_sessions();
            self.loader.unload_model();
        }
        self.downloads.delete_model(file_name)
    }

    /// Cancel transfers, end sessions, and release the model.
    ///
    /// The native log sink stays installed: the native runtime may still log
    /// while it tears down.
    pub fn shutdown(&self) {
        info!("Shutting down local model runtime");
        self.downloads.cancel_all();
        self.sessions.end_all_sessions();
        self.loader.unload_model();
        self.native_logs.unsubscribe(self.log_forwarding);
    }
}
