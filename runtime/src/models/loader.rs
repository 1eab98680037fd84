use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use log::{debug, error, info, warn};
use tokio::sync::{broadcast, watch, Notify};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::backend::{BackendError, Executor, InferenceBackend, ModelWeights};
use super::events::ModelStateChanged;
use super::status::ModelStatus;
use crate::config::LocalModelSettings;
use crate::error::ModelError;
use crate::notify::Notifier;

const EVENT_CAPACITY: usize = 64;

/// The native handles of the loaded model.
///
/// Fields drop in declaration order: the executor goes before the weights
/// it was built from.
struct LoadedModel {
    executor: Arc<dyn Executor>,
    weights: Arc<dyn ModelWeights>,
    path: PathBuf,
}

/// Eviction countdown, restarted through `reset`.
struct IdleTimer {
    reset: Arc<Notify>,
    cancel: CancellationToken,
    /// Last activity; checked again under the state lock before evicting
    last_reset: Instant,
}

impl IdleTimer {
    fn disarm(self) {
        self.cancel.cancel();
    }
}

struct LoaderState {
    status: ModelStatus,
    progress: f32,
    error_message: Option<String>,
    loaded: Option<LoadedModel>,
    idle: Option<IdleTimer>,
    /// Bumped when a load starts or an in-flight load is abandoned
    generation: u64,
    /// Bumped on every successful load
    load_epoch: u64,
}

struct LoaderInner {
    backend: Arc<dyn InferenceBackend>,
    notifier: Notifier,
    state: Mutex<LoaderState>,
    events: broadcast::Sender<ModelStateChanged>,
    status_tx: watch::Sender<ModelStatus>,
}

/// Owns the one loaded model.
///
/// Loading is idempotent while a model is loading or loaded, and no failure
/// escapes as an error: it becomes the `Error` status, a message, and a user
/// notification. Cloning shares the same model.
#[derive(Clone)]
pub struct ModelLoader {
    inner: Arc<LoaderInner>,
}

impl ModelLoader {
    pub fn new(backend: Arc<dyn InferenceBackend>, notifier: Notifier) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (status_tx, _) = watch::channel(ModelStatus::Unloaded);

        Self {
            inner: Arc::new(LoaderInner {
                backend,
                notifier,
                state: Mutex::new(LoaderState {
                    status: ModelStatus::Unloaded,
                    progress: 0.0,
                    error_message: None,
                    loaded: None,
                    idle: None,
                    generation: 0,
                    load_epoch: 0,
                }),
                events,
                status_tx,
            }),
        }
    }

    /// Load the model file named by `settings`.
    ///
    /// No-op while a model is loading or loaded. The native load runs on a
    /// blocking worker; this resolves once it has finished either way. The
    /// load still completes if this future is dropped early.
    pub async fn load_model(&self, settings: &LocalModelSettings) {
        let (generation, path) = {
            let mut state = self.inner.lock_state();

            if state.status.is_busy() {
                debug!("Ignoring load request: model is {}", state.status);
                return;
            }

            let path = match validate_model_path(settings) {
                Ok(path) => path,
                Err(e) => {
                    warn!("Cannot load model: {}", e);
                    let message = e.user_message();
                    state.status = ModelStatus::Error;
                    state.progress = 0.0;
                    state.error_message = Some(message.clone());
                    self.inner.publish(&state);
                    drop(state);
                    self.inner.notifier.error("Model failed to load", &message);
                    return;
                }
            };

            state.status = ModelStatus::Loading;
            state.progress = 0.0;
            state.error_message = None;
            state.generation += 1;
            self.inner.publish(&state);
            (state.generation, path)
        };

        debug!(">>> LOAD START: {:?}", path);
        info!(
            "Loading model {:?} with the {} backend",
            path,
            self.inner.backend.name()
        );

        let params = settings.load_params();
        let idle_timeout = settings.idle_timeout();
        let inner = self.inner.clone();
        let load = tokio::spawn(async move {
            let worker = inner.clone();
            let result = tokio::task::spawn_blocking(move || {
                let mut on_progress = |fraction: f32| worker.report_progress(generation, fraction);
                let weights = worker.backend.load_weights(&path, &params, &mut on_progress)?;
                debug!("Weights loaded: {}", weights.describe());
                // Weights are released on the error path too
                let executor = worker.backend.create_executor(weights.clone(), &params)?;
                Ok::<_, BackendError>(LoadedModel {
                    executor,
                    weights,
                    path,
                })
            })
            .await;

            let outcome = match result {
                Ok(Ok(model)) => Ok(model),
                Ok(Err(e)) => Err(ModelError::NativeLoadFailure(e.to_string())),
                Err(e) => Err(ModelError::NativeLoadFailure(format!(
                    "Task panicked while loading model: {}",
                    e
                ))),
            };

            inner.finish_load(generation, outcome, idle_timeout);
        });

        if let Err(e) = load.await {
            error!("Model load task failed: {}", e);
        }
    }

    /// Release the model. Safe to call in any state, any number of times.
    ///
    /// An in-flight load is abandoned: its result is dropped when it finishes.
    pub fn unload_model(&self) {
        let released = {
            let mut state = self.inner.lock_state();
            self.inner.unload_locked(&mut state)
        };

        if let Some(model) = released {
            debug!(">>> UNLOAD START: {:?}", model.path);
            drop(model);
            debug!("<<< UNLOAD COMPLETE");
        }
    }

    /// Restart the idle countdown, if one is armed.
    pub fn reset_idle_timer(&self) {
        let mut state = self.inner.lock_state();
        if let Some(timer) = &mut state.idle {
            timer.last_reset = Instant::now();
            timer.reset.notify_one();
        }
    }

    pub fn status(&self) -> ModelStatus {
        self.inner.lock_state().status
    }

    pub fn error_message(&self) -> Option<String> {
        self.inner.lock_state().error_message.clone()
    }

    /// Fraction of the native load completed, 0.0 outside of `Loading`.
    pub fn progress(&self) -> f32 {
        self.inner.lock_state().progress
    }

    pub fn is_loaded(&self) -> bool {
        self.status() == ModelStatus::Loaded
    }

    /// Counter bumped on every successful load.
    pub fn load_epoch(&self) -> u64 {
        self.inner.lock_state().load_epoch
    }

    /// Path of the loaded model file.
    pub fn loaded_path(&self) -> Option<PathBuf> {
        self.inner
            .lock_state()
            .loaded
            .as_ref()
            .map(|m| m.path.clone())
    }

    /// Summary of the loaded weights, for logs and diagnostics.
    pub fn loaded_description(&self) -> Option<String> {
        self.inner
            .lock_state()
            .loaded
            .as_ref()
            .map(|m| m.weights.describe())
    }

    /// The shared executor, while a model is loaded.
    pub fn executor(&self) -> Option<Arc<dyn Executor>> {
        self.executor_with_epoch().map(|(executor, _)| executor)
    }

    /// Epoch of the loaded model, `None` unless `Loaded`.
    pub(crate) fn loaded_epoch(&self) -> Option<u64> {
        let state = self.inner.lock_state();
        (state.status == ModelStatus::Loaded && state.loaded.is_some()).then_some(state.load_epoch)
    }

    pub(crate) fn executor_with_epoch(&self) -> Option<(Arc<dyn Executor>, u64)> {
        let state = self.inner.lock_state();
        state
            .loaded
            .as_ref()
            .filter(|_| state.status == ModelStatus::Loaded)
            .map(|m| (m.executor.clone(), state.load_epoch))
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ModelStateChanged> {
        self.inner.events.subscribe()
    }

    pub fn watch_status(&self) -> watch::Receiver<ModelStatus> {
        self.inner.status_tx.subscribe()
    }

    /// Wait until no load is in progress and return the resulting status.
    pub async fn wait_until_settled(&self) -> ModelStatus {
        let mut rx = self.watch_status();
        let settled = match rx.wait_for(|status| *status != ModelStatus::Loading).await {
            Ok(status) => *status,
            Err(_) => self.status(),
        };
        settled
    }
}

impl LoaderInner {
    fn lock_state(&self) -> MutexGuard<'_, LoaderState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Publish the current state. Called with the state locked so events
    /// keep the order of the transitions.
    fn publish(&self, state: &LoaderState) {
        self.status_tx.send_replace(state.status);
        // No subscribers is fine
        let _ = self.events.send(ModelStateChanged {
            status: state.status,
            progress: state.progress,
            error_message: state.error_message.clone(),
        });
    }

    fn finish_load(
        self: &Arc<Self>,
        generation: u64,
        outcome: Result<LoadedModel, ModelError>,
        idle_timeout: Option<Duration>,
    ) {
        let mut state = self.lock_state();

        if state.generation != generation || state.status != ModelStatus::Loading {
            info!("Discarding model load that was superseded by an unload");
            drop(state);
            drop(outcome);
            return;
        }

        match outcome {
            Ok(model) => {
                info!("Model {:?} loaded successfully", model.path);
                state.loaded = Some(model);
                state.status = ModelStatus::Loaded;
                state.progress = 0.0;
                state.load_epoch += 1;
                if let Some(timeout) = idle_timeout {
                    state.idle = Some(self.arm_idle_timer(timeout));
                }
                self.publish(&state);
                debug!("<<< LOAD COMPLETE");
            }
            Err(e) => {
                error!("Failed to load model: {}", e);
                let message = e.user_message();
                state.status = ModelStatus::Error;
                state.progress = 0.0;
                state.error_message = Some(message.clone());
                self.publish(&state);

                // Anything partially acquired goes; the status stays Error
                let leftover = state.loaded.take();
                if let Some(timer) = state.idle.take() {
                    timer.disarm();
                }
                drop(state);
                drop(leftover);

                self.notifier.error("Model failed to load", &message);
            }
        }
    }

    fn report_progress(&self, generation: u64, fraction: f32) {
        let mut state = self.lock_state();
        if state.generation != generation || state.status != ModelStatus::Loading {
            return;
        }
        let fraction = fraction.clamp(0.0, 1.0);
        if fraction != state.progress {
            state.progress = fraction;
            self.publish(&state);
        }
    }

    /// Move to `Unloaded`, handing back the model so it is released after
    /// the lock is dropped.
    fn unload_locked(&self, state: &mut LoaderState) -> Option<LoadedModel> {
        if let Some(timer) = state.idle.take() {
            timer.disarm();
        }

        let released = state.loaded.take();
        if state.status == ModelStatus::Loading {
            state.generation += 1;
            info!("Abandoning in-flight model load");
        }

        let changed = state.status != ModelStatus::Unloaded
            || state.progress != 0.0
            || state.error_message.is_some();

        state.status = ModelStatus::Unloaded;
        state.progress = 0.0;
        state.error_message = None;

        if changed {
            info!("Model unloaded");
            self.publish(state);
        } else {
            debug!("No model loaded to unload");
        }

        released
    }

    fn arm_idle_timer(self: &Arc<Self>, timeout: Duration) -> IdleTimer {
        let reset = Arc::new(Notify::new());
        let cancel = CancellationToken::new();
        let weak = Arc::downgrade(self);

        debug!("Idle timer armed for {:?}", timeout);
        tokio::spawn(run_idle_timer(
            weak,
            timeout,
            reset.clone(),
            cancel.clone(),
        ));

        IdleTimer {
            reset,
            cancel,
            last_reset: Instant::now(),
        }
    }

    /// Unload if the model has been idle for `timeout`. Returns how much
    /// longer to wait when activity arrived after the countdown fired.
    fn evict_idle(&self, timer: &CancellationToken, timeout: Duration) -> Option<Duration> {
        let released = {
            let mut state = self.lock_state();
            // Disarmed while we were waking up
            if timer.is_cancelled() {
                return None;
            }
            if let Some(idle) = &state.idle {
                let idle_for = idle.last_reset.elapsed();
                if idle_for < timeout {
                    return Some(timeout - idle_for);
                }
            }
            info!("Unloading model after idle timeout");
            self.unload_locked(&mut state)
        };
        drop(released);
        None
    }
}

async fn run_idle_timer(
    loader: Weak<LoaderInner>,
    timeout: Duration,
    reset: Arc<Notify>,
    cancel: CancellationToken,
) {
    let mut wait = timeout;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = reset.notified() => {
                debug!("Idle timer reset");
                wait = timeout;
                continue;
            }
            _ = tokio::time::sleep(wait) => {}
        }

        let Some(inner) = loader.upgrade() else { return };
        match inner.evict_idle(&cancel, timeout) {
            Some(remaining) => wait = remaining,
            None => return,
        }
    }
}

fn validate_model_path(settings: &LocalModelSettings) -> Result<PathBuf, ModelError> {
    let path = settings
        .model_path
        .as_ref()
        .filter(|p| !p.as_os_str().is_empty())
        .ok_or_else(|| ModelError::ModelPathInvalid(String::new()))?;

    if !path.is_file() {
        return Err(ModelError::ModelPathInvalid(path.display().to_string()));
    }

    Ok(path.clone())
}
