pub(crate) mod backend;
mod catalog;
mod downloads;
pub mod events;
#[cfg(feature = "llama")]
mod llama;
mod loader;
mod registry;
mod sessions;
mod status;

pub use backend::{BackendError, Conversation, Executor, InferenceBackend, LoadParams, ModelWeights};
pub use catalog::{
    parse_manifest, CatalogClient, CatalogEntry, HttpManifestSource, ManifestSource, Quantization,
    CATALOG_CACHE_TTL, DEFAULT_MANIFEST_URL,
};
pub use downloads::{
    speed_mbps, DownloadError, DownloadId, DownloadManager, DownloadSnapshot, DownloadStatus,
    PROGRESS_INTERVAL,
};
pub use events::{DownloadsChanged, ModelStateChanged};
#[cfg(feature = "llama")]
pub use llama::{LlamaConversation, LlamaCppBackend, LlamaExecutor, LlamaWeights};
pub use loader::ModelLoader;
pub use registry::{JsonModelRegistry, ModelRegistry, RegisteredModel, RegistryError, REGISTRY_FILE_NAME};
pub use sessions::{Session, SessionId, SessionManager};
pub use status::ModelStatus;
