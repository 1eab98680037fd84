use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use crate::models::LoadParams;

/// Errors returned by a [`ConfigStore`].
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read or write config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Invalid config value: {0}")]
    Json(#[from] serde_json::Error),
}

/// Type-safe configuration key that associates a key name with its value type
#[derive(Debug, Clone, Copy)]
pub struct ConfigKey<T> {
    name: &'static str,
    _phantom: PhantomData<T>,
}

impl<T> ConfigKey<T> {
    const fn new(name: &'static str) -> Self {
        Self {
            name,
            _phantom: PhantomData,
        }
    }

    pub fn key_name(&self) -> &'static str {
        self.name
    }
}

// ===== Local Model Settings =====

/// Settings that control how the local model is loaded and evicted.
///
/// Owned by the host application's settings store; the loader only reads it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct LocalModelSettings {
    /// GGUF weights file to load
    pub model_path: Option<PathBuf>,
    /// Context window in tokens, shared by all sessions
    pub context_size: u32,
    /// Layers to offload to the GPU (None = let the runtime decide)
    pub gpu_layers: Option<u32>,
    /// Worker threads (None = available parallelism)
    pub thread_count: Option<u32>,
    pub use_mmap: bool,
    pub use_mlock: bool,
    /// Upper bound on concurrent sessions over the shared context
    pub max_sessions: u32,
    /// Unload the model after a period without activity
    pub auto_unload: bool,
    pub idle_timeout_minutes: u64,
}

impl Default for LocalModelSettings {
    fn default() -> Self {
        Self {
            model_path: None,
            context_size: 4096,
            gpu_layers: None,
            thread_count: None,
            use_mmap: true,
            use_mlock: false,
            max_sessions: 8,
            auto_unload: true,
            idle_timeout_minutes: 10,
        }
    }
}

impl LocalModelSettings {
    /// Native load parameters derived from these settings.
    pub fn load_params(&self) -> LoadParams {
        let threads = self
            .thread_count
            .filter(|n| *n > 0)
            .unwrap_or_else(|| {
                std::thread::available_parallelism()
                    .map(|n| n.get() as u32)
                    .unwrap_or(4)
            });

        LoadParams {
            context_size: self.context_size.max(1),
            gpu_layers: self.gpu_layers,
            threads,
            use_mmap: self.use_mmap,
            use_mlock: self.use_mlock,
            max_sequences: self.max_sessions.max(1),
        }
    }

    /// Idle eviction delay, if eviction is enabled.
    pub fn idle_timeout(&self) -> Option<Duration> {
        if self.auto_unload && self.idle_timeout_minutes > 0 {
            Some(Duration::from_secs(self.idle_timeout_minutes * 60))
        } else {
            None
        }
    }
}

impl ConfigKey<LocalModelSettings> {
    pub const LOCAL_MODEL: Self = Self::new("localModelSettings");
}

// ===== Runtime Configuration =====

/// Where the runtime keeps its files and finds its catalog.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeConfig {
    /// Override for the managed models directory
    pub models_dir: Option<PathBuf>,
    /// Override for the catalog manifest URL
    pub manifest_url: Option<String>,
}

impl ConfigKey<RuntimeConfig> {
    pub const RUNTIME: Self = Self::new("runtimeConfig");
}

// ===== Type-Safe Config Store =====

pub trait ConfigStore {
    fn get<T: DeserializeOwned>(&self, key: &ConfigKey<T>) -> Option<T>;
    fn set<T: Serialize>(&self, key: &ConfigKey<T>, value: T) -> Result<(), ConfigError>;
    fn delete<T>(&self, key: &ConfigKey<T>) -> Result<(), ConfigError>;
}

/// Config store persisted as a single JSON object on disk.
pub struct FileConfigStore {
    path: PathBuf,
    values: Mutex<serde_json::Map<String, serde_json::Value>>,
}

impl FileConfigStore {
    /// Open (or start) the store at `path`. A missing file is an empty store.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref().to_path_buf();
        let values = if path.exists() {
            let raw = std::fs::read_to_string(&path)?;
            if raw.trim().is_empty() {
                serde_json::Map::new()
            } else {
                serde_json::from_str(&raw)?
            }
        } else {
            serde_json::Map::new()
        };

        Ok(Self {
            path,
            values: Mutex::new(values),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn save(&self, values: &serde_json::Map<String, serde_json::Value>) -> Result<(), ConfigError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let raw = serde_json::to_string_pretty(values)?;
        std::fs::write(&self.path, raw)?;
        Ok(())
    }
}

impl ConfigStore for FileConfigStore {
    fn get<T: DeserializeOwned>(&self, key: &ConfigKey<T>) -> Option<T> {
        self.values
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key.key_name())
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    fn set<T: Serialize>(&self, key: &ConfigKey<T>, value: T) -> Result<(), ConfigError> {
        let val = serde_json::to_value(value)?;
        let mut values = self.values.lock().unwrap_or_else(PoisonError::into_inner);
        values.insert(key.key_name().to_string(), val);
        self.save(&values)
    }

    fn delete<T>(&self, key: &ConfigKey<T>) -> Result<(), ConfigError> {
        let mut values = self.values.lock().unwrap_or_else(PoisonError::into_inner);
        values.remove(key.key_name());
        self.save(&values)
    }
}

/// Load local model settings, falling back to defaults.
pub fn load_local_model_settings(store: &impl ConfigStore) -> LocalModelSettings {
    store.get(&ConfigKey::LOCAL_MODEL).unwrap_or_default()
}
