use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use std::time::{SystemTime, UNIX_EPOCH};

use log::{debug, info};
use serde::{Deserialize, Serialize};

use super::catalog::CatalogEntry;

pub const REGISTRY_FILE_NAME: &str = "registry.json";

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("Failed to access model registry: {0}")]
    Io(#[from] std::io::Error),
    #[error("Model registry is corrupted: {0}")]
    Json(#[from] serde_json::Error),
}

/// A downloaded model the application manages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisteredModel {
    /// Catalog id the file was downloaded for
    pub catalog_id: String,
    pub name: String,
    pub path: PathBuf,
    pub size_bytes: u64,
    /// Seconds since the Unix epoch
    pub registered_at: u64,
}

/// Persistence for completed downloads.
pub trait ModelRegistry: Send + Sync {
    /// Record `path` as a managed model downloaded for `entry`.
    ///
    /// Registering the same path again replaces the earlier record.
    fn register(&self, entry: &CatalogEntry, path: &Path)
        -> Result<RegisteredModel, RegistryError>;

    fn models(&self) -> Vec<RegisteredModel>;

    /// Forget the model stored at `path`. Returns whether a record existed.
    fn remove(&self, path: &Path) -> Result<bool, RegistryError>;
}

/// Registry kept as a JSON array next to the model files.
pub struct JsonModelRegistry {
    path: PathBuf,
    models: Mutex<Vec<RegisteredModel>>,
}

impl JsonModelRegistry {
    /// Open `registry.json` inside `models_dir`, starting empty if it does not exist.
    pub fn open(models_dir: &Path) -> Result<Self, RegistryError> {
        let path = models_dir.join(REGISTRY_FILE_NAME);

        let models = match std::fs::read_to_string(&path) {
            Ok(contents) => serde_json::from_str(&contents)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e.into()),
        };

        debug!("Opened model registry {:?}", path);

        Ok(Self {
            path,
            models: Mutex::new(models),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn persist(&self, models: &[RegisteredModel]) -> Result<(), RegistryError> {
        let contents = serde_json::to_string_pretty(models)?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, contents)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

impl ModelRegistry for JsonModelRegistry {
    fn register(
        &self,
        entry: &CatalogEntry,
        path: &Path,
    ) -> Result<RegisteredModel, RegistryError> {
        let size_bytes = std::fs::metadata(path)?.len();
        let registered_at = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);

        let record = RegisteredModel {
            catalog_id: entry.id.clone(),
            name: entry.name.clone(),
            path: path.to_path_buf(),
            size_bytes,
            registered_at,
        };

        let mut models = self.models.lock().unwrap_or_else(PoisonError::into_inner);
        let mut updated = models.clone();
        updated.retain(|m| m.path != record.path);
        updated.push(record.clone());
        self.persist(&updated)?;
        *models = updated;

        info!("Registered model '{}' at {:?}", entry.id, path);
        Ok(record)
    }

    fn models(&self) -> Vec<RegisteredModel> {
        self.models
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn remove(&self, path: &Path) -> Result<bool, RegistryError> {
        let mut models = self.models.lock().unwrap_or_else(PoisonError::into_inner);
        if !models.iter().any(|m| m.path == path) {
            return Ok(false);
        }

        let updated: Vec<_> = models.iter().filter(|m| m.path != path).cloned().collect();
        self.persist(&updated)?;
        *models = updated;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry() -> CatalogEntry {
        CatalogEntry {
            id: "qwen2.5-1.5b-instruct".into(),
            name: "Qwen 2.5 1.5B".into(),
            description: String::new(),
            quantizations: Vec::new(),
        }
    }

    #[test]
    fn test_register_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let model_path = dir.path().join("qwen-q4.gguf");
        std::fs::write(&model_path, b"GGUF0123").unwrap();

        let registry = JsonModelRegistry::open(dir.path()).unwrap();
        let record = registry.register(&entry(), &model_path).unwrap();
        assert_eq!(record.size_bytes, 8);
        assert_eq!(record.catalog_id, "qwen2.5-1.5b-instruct");

        let reopened = JsonModelRegistry::open(dir.path()).unwrap();
        assert_eq!(reopened.models(), vec![record]);
    }

    #[test]
    fn test_register_same_path_replaces_record() {
        let dir = tempfile::tempdir().unwrap();
        let model_path = dir.path().join("qwen-q4.gguf");
        std::fs::write(&model_path, b"GGUF").unwrap();

        let registry = JsonModelRegistry::open(dir.path()).unwrap();
        registry.register(&entry(), &model_path).unwrap();
        registry.register(&entry(), &model_path).unwrap();

        assert_eq!(registry.models().len(), 1);
    }

    #[test]
    fn test_remove() {
        let dir = tempfile::tempdir().unwrap();
        let model_path = dir.path().join("qwen-q4.gguf");
        std::fs::write(&model_path, b"GGUF").unwrap();

        let registry = JsonModelRegistry::open(dir.path()).unwrap();
        registry.register(&entry(), &model_path).unwrap();

        assert!(registry.remove(&model_path).unwrap());
        assert!(!registry.remove(&model_path).unwrap());
        assert!(JsonModelRegistry::open(dir.path()).unwrap().models().is_empty());
    }

    #[test]
    fn test_register_missing_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        let registry = JsonModelRegistry::open(dir.path()).unwrap();

        let result = registry.register(&entry(), &dir.path().join("missing.gguf"));
        assert!(matches!(result, Err(RegistryError::Io(_))));
        assert!(registry.models().is_empty());
    }
}
