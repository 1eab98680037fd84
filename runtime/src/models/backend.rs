//! Seam between the lifecycle code and the native inference runtime.
//!
//! A load is two native steps: read the weights, then build one execution
//! context over them. Sessions are conversations minted from that context.
//! Ownership mirrors the native dependencies: an [`Executor`] keeps its
//! weights alive, and a [`Conversation`] must not keep its executor alive
//! (it should hold a weak reference and fail with [`BackendError::Unloaded`]
//! once the executor is gone).

use std::any::Any;
use std::path::Path;
use std::sync::Arc;

/// Native load parameters, derived from `LocalModelSettings`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadParams {
    pub context_size: u32,
    pub gpu_layers: Option<u32>,
    pub threads: u32,
    pub use_mmap: bool,
    pub use_mlock: bool,
    /// Sequences the shared context is sized for
    pub max_sequences: u32,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum BackendError {
    #[error("Inference runtime unavailable: {0}")]
    Unavailable(String),
    #[error("Failed to load weights: {0}")]
    WeightsLoad(String),
    #[error("Failed to create execution context: {0}")]
    ContextCreate(String),
    #[error("Failed to create conversation: {0}")]
    Conversation(String),
    #[error("Inference failed: {0}")]
    Inference(String),
    #[error("Model was unloaded")]
    Unloaded,
}

/// Loaded model weights.
pub trait ModelWeights: Send + Sync + 'static {
    /// Short human-readable summary for logs.
    fn describe(&self) -> String;

    /// Lets a backend recover its concrete weights type.
    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

/// The shared execution context all sessions run on.
pub trait Executor: Send + Sync {
    /// Carve a new independent conversation out of this context.
    fn create_conversation(self: Arc<Self>) -> Result<Box<dyn Conversation>, BackendError>;

    /// Conversations currently alive on this context.
    fn active_conversations(&self) -> usize;
}

/// One conversation's slice of the shared context.
///
/// Dropping it releases the slice.
pub trait Conversation: Send {
    /// Feed text into this conversation.
    fn prompt(&mut self, text: &str) -> Result<(), BackendError>;

    /// Tokens held by this conversation.
    fn token_count(&self) -> usize;
}

/// A native inference runtime.
pub trait InferenceBackend: Send + Sync + 'static {
    fn name(&self) -> &str;

    /// Load weights from `path`, reporting progress in `0.0..=1.0`.
    fn load_weights(
        &self,
        path: &Path,
        params: &LoadParams,
        progress: &mut dyn FnMut(f32),
    ) -> Result<Arc<dyn ModelWeights>, BackendError>;

    /// Build the shared execution context over `weights`.
    fn create_executor(
        &self,
        weights: Arc<dyn ModelWeights>,
        params: &LoadParams,
    ) -> Result<Arc<dyn Executor>, BackendError>;
}
