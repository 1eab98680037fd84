//! llama.cpp backend.
//!
//! One `LlamaContext` is shared by every conversation; each conversation owns
//! a sequence id in that context's KV cache and clears it when dropped.

use std::any::Any;
use std::num::NonZeroU32;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use llama_cpp_2::context::params::LlamaContextParams;
use llama_cpp_2::context::LlamaContext;
use llama_cpp_2::llama_backend::LlamaBackend;
use llama_cpp_2::llama_batch::LlamaBatch;
use llama_cpp_2::model::params::LlamaModelParams;
use llama_cpp_2::model::{AddBos, LlamaModel};
use log::{debug, warn};

use super::backend::{
    BackendError, Conversation, Executor, InferenceBackend, LoadParams, ModelWeights,
};

/// Backend over the process-wide llama.cpp runtime.
pub struct LlamaCppBackend {
    backend: Arc<LlamaBackend>,
}

impl LlamaCppBackend {
    /// Initialize llama.cpp. Fails if it was already initialized in this process.
    pub fn new() -> Result<Self, BackendError> {
        let backend = LlamaBackend::init().map_err(|e| BackendError::Unavailable(e.to_string()))?;
        Ok(Self {
            backend: Arc::new(backend),
        })
    }
}

/// Weights loaded by llama.cpp.
///
/// `model` is declared before `backend` so models are freed before the
/// backend can be.
pub struct LlamaWeights {
    model: LlamaModel,
    backend: Arc<LlamaBackend>,
    description: String,
}

impl ModelWeights for LlamaWeights {
    fn describe(&self) -> String {
        self.description.clone()
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

/// The shared llama.cpp context.
pub struct LlamaExecutor {
    // Borrows from `weights`; declared first so it is dropped first
    context: Mutex<LlamaContext<'static>>,
    weights: Arc<LlamaWeights>,
    free_sequences: Mutex<Vec<i32>>,
    max_sequences: usize,
    batch_size: usize,
}

// SAFETY: the context is only reached through its mutex, and llama.cpp
// contexts may be used from any thread as long as calls are not concurrent.
unsafe impl Send for LlamaExecutor {}
unsafe impl Sync for LlamaExecutor {}

impl LlamaExecutor {
    fn lock_context(&self) -> MutexGuard<'_, LlamaContext<'static>> {
        self.context.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn release_sequence(&self, seq_id: i32) {
        if let Err(e) = self
            .lock_context()
            .clear_kv_cache_seq(Some(seq_id as u32), None, None)
        {
            warn!("Failed to clear KV cache for sequence {}: {}", seq_id, e);
        }
        self.free_sequences
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(seq_id);
    }
}

impl Executor for LlamaExecutor {
    fn create_conversation(self: Arc<Self>) -> Result<Box<dyn Conversation>, BackendError> {
        let seq_id = self
            .free_sequences
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop()
            .ok_or_else(|| {
                BackendError::Conversation(format!(
                    "all {} sequences are in use",
                    self.max_sequences
                ))
            })?;

        debug!("Conversation assigned sequence {}", seq_id);
        Ok(Box::new(LlamaConversation {
            executor: Arc::downgrade(&self),
            seq_id,
            n_past: 0,
        }))
    }

    fn active_conversations(&self) -> usize {
        let free = self
            .free_sequences
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len();
        self.max_sequences - free
    }
}

/// A conversation's sequence in the shared context.
pub struct LlamaConversation {
    executor: Weak<LlamaExecutor>,
    seq_id: i32,
    n_past: i32,
}

impl Conversation for LlamaConversation {
    fn prompt(&mut self, text: &str) -> Result<(), BackendError> {
        let executor = self.executor.upgrade().ok_or(BackendError::Unloaded)?;
        let add_bos = if self.n_past == 0 {
            AddBos::Always
        } else {
            AddBos::Never
        };

        let tokens = executor
            .weights
            .model
            .str_to_token(text, add_bos)
            .map_err(|e| BackendError::Inference(e.to_string()))?;

        let mut context = executor.lock_context();
        let chunk_count = tokens.len().div_ceil(executor.batch_size.max(1));
        for (chunk_index, chunk) in tokens.chunks(executor.batch_size.max(1)).enumerate() {
            let mut batch = LlamaBatch::new(chunk.len(), 1);
            let last_chunk = chunk_index + 1 == chunk_count;
            for (i, token) in chunk.iter().enumerate() {
                let logits = last_chunk && i + 1 == chunk.len();
                batch
                    .add(*token, self.n_past, &[self.seq_id], logits)
                    .map_err(|e| BackendError::Inference(e.to_string()))?;
                self.n_past += 1;
            }
            context
                .decode(&mut batch)
                .map_err(|e| BackendError::Inference(e.to_string()))?;
        }

        Ok(())
    }

    fn token_count(&self) -> usize {
        self.n_past as usize
    }
}

impl Drop for LlamaConversation {
    fn drop(&mut self) {
        if let Some(executor) = self.executor.upgrade() {
            executor.release_sequence(self.seq_id);
        }
    }
}

impl InferenceBackend for LlamaCppBackend {
    fn name(&self) -> &str {
        "llama.cpp"
    }

    fn load_weights(
        &self,
        path: &Path,
        params: &LoadParams,
        progress: &mut dyn FnMut(f32),
    ) -> Result<Arc<dyn ModelWeights>, BackendError> {
        let mut model_params = LlamaModelParams::default();
        if let Some(layers) = params.gpu_layers {
            model_params = model_params.with_n_gpu_layers(layers);
        }
        if params.use_mlock {
            model_params = model_params.with_use_mlock(true);
        }
        if !params.use_mmap {
            debug!("Memory mapping is left to the llama.cpp default");
        }

        progress(0.1);
        let model = LlamaModel::load_from_file(&self.backend, path, &model_params)
            .map_err(|e| BackendError::WeightsLoad(e.to_string()))?;
        progress(0.8);

        let description = format!(
            "{} ({} parameters, trained context {})",
            path.file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            model.n_params(),
            model.n_ctx_train()
        );

        Ok(Arc::new(LlamaWeights {
            model,
            backend: self.backend.clone(),
            description,
        }))
    }

    fn create_executor(
        &self,
        weights: Arc<dyn ModelWeights>,
        params: &LoadParams,
    ) -> Result<Arc<dyn Executor>, BackendError> {
        let weights: Arc<LlamaWeights> = weights
            .into_any()
            .downcast::<LlamaWeights>()
            .map_err(|_| BackendError::ContextCreate("weights were not loaded by llama.cpp".into()))?;

        let threads = params.threads as i32;
        let context_params = LlamaContextParams::default()
            .with_n_ctx(NonZeroU32::new(params.context_size))
            .with_n_threads(threads)
            .with_n_threads_batch(threads)
            .with_n_seq_max(params.max_sequences);

        let context = weights
            .model
            .new_context(&weights.backend, context_params)
            .map_err(|e| BackendError::ContextCreate(e.to_string()))?;
        let batch_size = context.n_batch() as usize;

        // SAFETY: the context borrows `weights.model`. The executor holds an
        // `Arc` to those weights and drops the context first, so the borrow
        // never outlives the model.
        let context: LlamaContext<'static> = unsafe { std::mem::transmute(context) };

        let max_sequences = params.max_sequences.max(1) as usize;
        Ok(Arc::new(LlamaExecutor {
            context: Mutex::new(context),
            weights,
            free_sequences: Mutex::new((0..max_sequences as i32).rev().collect()),
            max_sequences,
            batch_size,
        }))
    }
}
