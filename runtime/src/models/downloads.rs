use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use futures_util::StreamExt;
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::catalog::{CatalogEntry, Quantization};
use super::events::DownloadsChanged;
use super::registry::ModelRegistry;
use crate::error::ModelError;
use crate::notify::Notifier;

/// How often speed and progress are published while bytes are flowing.
pub const PROGRESS_INTERVAL: Duration = Duration::from_millis(500);

const EVENT_CAPACITY: usize = 256;
const PARTIAL_SUFFIX: &str = "partial";
const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, derive_more::Display,
)]
#[serde(transparent)]
pub struct DownloadId(Uuid);

impl DownloadId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

/// ```text
/// Queued ──> Downloading ──> Completed | Canceled | Failed
/// ```
///
/// `Paused` is reserved; nothing moves a task into it yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "lowercase")]
pub enum DownloadStatus {
    Queued,
    Downloading,
    Paused,
    Canceled,
    Failed,
    Completed,
}

impl DownloadStatus {
    pub fn is_active(self) -> bool {
        matches!(self, Self::Queued | Self::Downloading | Self::Paused)
    }

    pub fn is_terminal(self) -> bool {
        !self.is_active()
    }
}

/// Read-only view of a tracked download.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadSnapshot {
    pub id: DownloadId,
    pub entry: CatalogEntry,
    pub quantization: Quantization,
    pub destination: PathBuf,
    pub status: DownloadStatus,
    pub bytes_downloaded: u64,
    /// From `Content-Length`, when the server sent one
    pub total_bytes: Option<u64>,
    /// Throughput over the last sample window, MB/s
    pub speed_mbps: f64,
    pub error: Option<String>,
}

impl DownloadSnapshot {
    /// Percentage in `0.0..=100.0`; 0 when the total size is unknown.
    pub fn progress_percent(&self) -> f64 {
        match self.total_bytes {
            Some(total) if total > 0 => self.bytes_downloaded as f64 / total as f64 * 100.0,
            _ => 0.0,
        }
    }
}

/// Throughput in MB/s, rounded to two decimal places.
pub fn speed_mbps(bytes: u64, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64();
    if secs <= 0.0 {
        return 0.0;
    }
    let mbps = bytes as f64 / BYTES_PER_MB / secs;
    (mbps * 100.0).round() / 100.0
}

#[derive(Debug, thiserror::Error)]
pub enum DownloadError {
    #[error("No download with id {0}")]
    NotFound(DownloadId),
    #[error("Download {0} is still in progress")]
    StillActive(DownloadId),
    #[error("Invalid model file name: {0}")]
    InvalidFileName(String),
    #[error("Model file {0} is being downloaded")]
    ModelInUse(String),
    #[error("Failed to delete model file: {0}")]
    Io(#[from] std::io::Error),
}

struct DownloadTask {
    info: DownloadSnapshot,
    cancel: CancellationToken,
}

struct Inner {
    models_dir: PathBuf,
    client: reqwest::Client,
    registry: Arc<dyn ModelRegistry>,
    notifier: Notifier,
    tasks: Mutex<Vec<DownloadTask>>,
    events: broadcast::Sender<DownloadsChanged>,
}

/// Manages model file transfers into the managed models directory.
///
/// Every change to the tracked set is published on [`subscribe`](Self::subscribe)
/// while the set is still locked, so observers see changes in the order they
/// were made.
#[derive(Clone)]
pub struct DownloadManager {
    inner: Arc<Inner>,
}

impl DownloadManager {
    /// Create a manager that stores models in `models_dir`, creating it if needed.
    pub fn new(
        models_dir: impl Into<PathBuf>,
        registry: Arc<dyn ModelRegistry>,
        notifier: Notifier,
    ) -> std::io::Result<Self> {
        Self::with_client(models_dir, registry, notifier, reqwest::Client::new())
    }

    /// Like [`new`](Self::new), transferring through `client`.
    pub fn with_client(
        models_dir: impl Into<PathBuf>,
        registry: Arc<dyn ModelRegistry>,
        notifier: Notifier,
        client: reqwest::Client,
    ) -> std::io::Result<Self> {
        let models_dir = models_dir.into();
        std::fs::create_dir_all(&models_dir)?;
        info!("Models directory: {:?}", models_dir);

        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        Ok(Self {
            inner: Arc::new(Inner {
                models_dir,
                client,
                registry,
                notifier,
                tasks: Mutex::new(Vec::new()),
                events,
            }),
        })
    }

    pub fn models_dir(&self) -> &Path {
        &self.inner.models_dir
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DownloadsChanged> {
        self.inner.events.subscribe()
    }

    pub fn tasks(&self) -> Vec<DownloadSnapshot> {
        self.lock_tasks().iter().map(|t| t.info.clone()).collect()
    }

    pub fn task(&self, id: DownloadId) -> Option<DownloadSnapshot> {
        self.lock_tasks()
            .iter()
            .find(|t| t.info.id == id)
            .map(|t| t.info.clone())
    }

    /// Download `quantization` of `entry` and wait for the transfer to end.
    ///
    /// Returns `None` without creating a task when the file already exists or
    /// another active task targets it. The outcome of the transfer is the
    /// task's final status.
    pub async fn start_download(
        &self,
        entry: &CatalogEntry,
        quantization: &Quantization,
    ) -> Option<DownloadId> {
        let (id, cancel) = self.enqueue(entry, quantization)?;
        self.run(id, entry, quantization, cancel).await;
        Some(id)
    }

    /// Like [`start_download`](Self::start_download), but runs the transfer
    /// on a background task and returns as soon as it is queued.
    pub fn spawn_download(
        &self,
        entry: CatalogEntry,
        quantization: Quantization,
    ) -> Option<DownloadId> {
        let (id, cancel) = self.enqueue(&entry, &quantization)?;
        let manager = self.clone();
        tokio::spawn(async move {
            manager.run(id, &entry, &quantization, cancel).await;
        });
        Some(id)
    }

    /// Request cancellation of an active download. Other tasks are unaffected.
    pub fn cancel_download(&self, id: DownloadId) -> bool {
        let tasks = self.lock_tasks();
        match tasks.iter().find(|t| t.info.id == id) {
            Some(task) if task.info.status.is_active() => {
                task.cancel.cancel();
                info!("Cancellation requested for download {}", id);
                true
            }
            Some(_) => false,
            None => {
                debug!("No download with id {} to cancel", id);
                false
            }
        }
    }

    /// Cancel every active download.
    pub fn cancel_all(&self) {
        for task in self.lock_tasks().iter() {
            if task.info.status.is_active() {
                task.cancel.cancel();
            }
        }
    }

    /// Drop a finished task and download the same file again from scratch.
    pub async fn retry_download(&self, id: DownloadId) -> Result<Option<DownloadId>, DownloadError> {
        let (entry, quantization) = {
            let mut tasks = self.lock_tasks();
            let index = Self::terminal_index(&tasks, id)?;
            let task = tasks.remove(index);
            self.publish(DownloadsChanged::Removed { id });
            (task.info.entry, task.info.quantization)
        };

        info!("Retrying download of {}", quantization.file_name);
        Ok(self.start_download(&entry, &quantization).await)
    }

    /// Stop tracking a finished task.
    pub fn clear_download(&self, id: DownloadId) -> Result<(), DownloadError> {
        let mut tasks = self.lock_tasks();
        let index = Self::terminal_index(&tasks, id)?;
        tasks.remove(index);
        self.publish(DownloadsChanged::Removed { id });
        Ok(())
    }

    /// Stop tracking every finished task. Returns how many were removed.
    pub fn clear_all_completed(&self) -> usize {
        let mut tasks = self.lock_tasks();
        let before = tasks.len();
        tasks.retain(|t| {
            if t.info.status.is_terminal() {
                self.publish(DownloadsChanged::Removed { id: t.info.id });
                false
            } else {
                true
            }
        });
        before - tasks.len()
    }

    /// Whether `file_name` is present in the managed directory.
    pub fn is_downloaded(&self, file_name: &str) -> bool {
        self.destination_for(file_name)
            .map(|path| path.is_file())
            .unwrap_or(false)
    }

    /// Model files (`*.gguf`) in the managed directory, sorted by path.
    pub fn local_models(&self) -> std::io::Result<Vec<PathBuf>> {
        let mut models = Vec::new();
        for entry in std::fs::read_dir(&self.inner.models_dir)? {
            let path = entry?.path();
            let is_gguf = path
                .extension()
                .map(|ext| ext.eq_ignore_ascii_case("gguf"))
                .unwrap_or(false);
            if is_gguf && path.is_file() {
                models.push(path);
            }
        }
        models.sort();
        Ok(models)
    }

    /// Delete a downloaded model file and forget its registry record.
    ///
    /// Refused while a download targets the same file.
    pub fn delete_model(&self, file_name: &str) -> Result<(), DownloadError> {
        let path = self
            .destination_for(file_name)
            .ok_or_else(|| DownloadError::InvalidFileName(file_name.to_string()))?;

        {
            let tasks = self.lock_tasks();
            if tasks
                .iter()
                .any(|t| t.info.status.is_active() && t.info.destination == path)
            {
                return Err(DownloadError::ModelInUse(file_name.to_string()));
            }
        }

        match std::fs::remove_file(&path) {
            Ok(()) => info!("Deleted model {:?}", path),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!("Model {:?} was already gone", path)
            }
            Err(e) => return Err(e.into()),
        }

        if let Err(e) = self.inner.registry.remove(&path) {
            error!("Failed to remove {:?} from registry: {}", path, e);
        }

        Ok(())
    }

    /// `models_dir/file_name`, if `file_name` is a plain file name.
    fn destination_for(&self, file_name: &str) -> Option<PathBuf> {
        let mut components = Path::new(file_name).components();
        match (components.next(), components.next()) {
            (Some(Component::Normal(_)), None) => Some(self.inner.models_dir.join(file_name)),
            _ => None,
        }
    }

    /// Create a `Queued` task unless the destination is taken.
    fn enqueue(
        &self,
        entry: &CatalogEntry,
        quantization: &Quantization,
    ) -> Option<(DownloadId, CancellationToken)> {
        let Some(destination) = self.destination_for(&quantization.file_name) else {
            warn!(
                "Refusing to download '{}': not a plain file name",
                quantization.file_name
            );
            self.inner.notifier.error(
                "Download failed",
                &format!("'{}' is not a valid model file name.", quantization.file_name),
            );
            return None;
        };

        let mut tasks = self.lock_tasks();

        if destination.exists() {
            info!("Model {:?} already downloaded", destination);
            return None;
        }

        if tasks
            .iter()
            .any(|t| t.info.status.is_active() && t.info.destination == destination)
        {
            warn!("Model {:?} is already being downloaded", destination);
            return None;
        }

        let id = DownloadId::new();
        let cancel = CancellationToken::new();
        let info = DownloadSnapshot {
            id,
            entry: entry.clone(),
            quantization: quantization.clone(),
            destination,
            status: DownloadStatus::Queued,
            bytes_downloaded: 0,
            total_bytes: None,
            speed_mbps: 0.0,
            error: None,
        };

        self.publish(DownloadsChanged::Added { task: info.clone() });
        tasks.push(DownloadTask {
            info,
            cancel: cancel.clone(),
        });

        Some((id, cancel))
    }

    async fn run(
        &self,
        id: DownloadId,
        entry: &CatalogEntry,
        quantization: &Quantization,
        cancel: CancellationToken,
    ) {
        let destination = self.inner.models_dir.join(&quantization.file_name);
        let partial = partial_path(&destination);

        self.update(id, true, |t| t.status = DownloadStatus::Downloading);
        info!(
            "Starting download of {} from {}",
            quantization.file_name, quantization.url
        );

        let result = match self.transfer(id, quantization, &partial, &cancel).await {
            Ok(()) => self.complete(id, &partial, &destination, &cancel),
            Err(e) => Err(e),
        };

        match result {
            Ok(()) => {
                info!("Download complete: {:?}", destination);

                if let Err(e) = self.inner.registry.register(entry, &destination) {
                    error!("Failed to register downloaded model {:?}: {}", destination, e);
                    self.inner.notifier.warning(
                        "Model downloaded",
                        &format!(
                            "{} was downloaded but could not be added to your models.",
                            entry.name
                        ),
                    );
                } else {
                    self.inner.notifier.info(
                        "Model downloaded",
                        &format!("{} is ready to use.", entry.name),
                    );
                }
            }
            Err(ModelError::TransferCanceled) => {
                remove_partial(&partial).await;
                self.update(id, true, |t| {
                    t.status = DownloadStatus::Canceled;
                    t.speed_mbps = 0.0;
                    t.error = None;
                });
                info!("Download cancelled: {:?}", destination);
            }
            Err(e) => {
                remove_partial(&partial).await;
                error!("Download of {} failed: {}", quantization.file_name, e);
                let message = e.user_message();
                self.update(id, true, |t| {
                    t.status = DownloadStatus::Failed;
                    t.speed_mbps = 0.0;
                    t.error = Some(message);
                });
            }
        }
    }

    /// Stream the file into `<destination>.partial` and verify it.
    async fn transfer(
        &self,
        id: DownloadId,
        quantization: &Quantization,
        partial: &Path,
        cancel: &CancellationToken,
    ) -> Result<(), ModelError> {
        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(ModelError::TransferCanceled),
            response = self.inner.client.get(&quantization.url).send() => response
                .map_err(|e| ModelError::TransferFailure(format!("could not connect ({})", e)))?,
        };

        if !response.status().is_success() {
            return Err(ModelError::TransferFailure(format!(
                "server responded with {}",
                response.status()
            )));
        }

        let total = response.content_length();
        self.update(id, true, |t| t.total_bytes = total);

        let file = tokio::fs::File::create(partial)
            .await
            .map_err(|e| ModelError::TransferFailure(format!("could not create file ({})", e)))?;
        let mut file = tokio::io::BufWriter::new(file);
        let mut stream = response.bytes_stream();

        let mut downloaded = 0u64;
        let mut sample_bytes = 0u64;
        let mut sample_at = Instant::now();

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(ModelError::TransferCanceled),
                next = stream.next() => next,
            };

            let Some(chunk) = next else { break };
            let chunk = chunk
                .map_err(|e| ModelError::TransferFailure(format!("connection lost ({})", e)))?;

            file.write_all(&chunk)
                .await
                .map_err(|e| ModelError::TransferFailure(format!("could not write file ({})", e)))?;
            downloaded += chunk.len() as u64;

            let elapsed = sample_at.elapsed();
            if elapsed >= PROGRESS_INTERVAL {
                let speed = speed_mbps(downloaded - sample_bytes, elapsed);
                if let Some(task) = self.update(id, true, |t| {
                    t.bytes_downloaded = downloaded;
                    t.speed_mbps = speed;
                }) {
                    debug!(
                        "Download progress: {:.1}% ({} bytes, {} MB/s)",
                        task.progress_percent(),
                        downloaded,
                        speed
                    );
                }
                sample_bytes = downloaded;
                sample_at = Instant::now();
            } else {
                self.update(id, false, |t| t.bytes_downloaded = downloaded);
            }
        }

        file.flush()
            .await
            .map_err(|e| ModelError::TransferFailure(format!("could not write file ({})", e)))?;
        drop(file);

        if cancel.is_cancelled() {
            return Err(ModelError::TransferCanceled);
        }

        self.update(id, true, |t| {
            t.bytes_downloaded = downloaded;
            t.speed_mbps = 0.0;
        });

        if let Some(expected) = &quantization.sha256 {
            debug!("Verifying checksum of {:?}", partial);
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(ModelError::TransferCanceled),
                verified = verify_checksum(partial, expected) => verified?,
            }
        }

        Ok(())
    }

    /// Move the verified file into place and mark the task completed.
    ///
    /// Holds the task lock throughout, so a cancel either lands before this
    /// and wins, or finds the task already completed and is refused.
    fn complete(
        &self,
        id: DownloadId,
        partial: &Path,
        destination: &Path,
        cancel: &CancellationToken,
    ) -> Result<(), ModelError> {
        let mut tasks = self.lock_tasks();
        if cancel.is_cancelled() {
            return Err(ModelError::TransferCanceled);
        }

        std::fs::rename(partial, destination)
            .map_err(|e| ModelError::TransferFailure(format!("could not finalize file ({})", e)))?;

        if let Some(task) = tasks.iter_mut().find(|t| t.info.id == id) {
            task.info.status = DownloadStatus::Completed;
            task.info.speed_mbps = 0.0;
            let task = task.info.clone();
            self.publish(DownloadsChanged::Updated { task });
        }
        Ok(())
    }

    /// Apply `f` to a task, publishing the result when `publish` is set.
    fn update<F>(&self, id: DownloadId, publish: bool, f: F) -> Option<DownloadSnapshot>
    where
        F: FnOnce(&mut DownloadSnapshot),
    {
        let mut tasks = self.lock_tasks();
        let task = tasks.iter_mut().find(|t| t.info.id == id)?;
        f(&mut task.info);
        let snapshot = task.info.clone();
        if publish {
            self.publish(DownloadsChanged::Updated {
                task: snapshot.clone(),
            });
        }
        Some(snapshot)
    }

    fn terminal_index(tasks: &[DownloadTask], id: DownloadId) -> Result<usize, DownloadError> {
        let index = tasks
            .iter()
            .position(|t| t.info.id == id)
            .ok_or(DownloadError::NotFound(id))?;
        if tasks[index].info.status.is_active() {
            return Err(DownloadError::StillActive(id));
        }
        Ok(index)
    }

    fn publish(&self, event: DownloadsChanged) {
        // No subscribers is fine
        let _ = self.inner.events.send(event);
    }

    fn lock_tasks(&self) -> MutexGuard<'_, Vec<DownloadTask>> {
        self.inner.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn partial_path(destination: &Path) -> PathBuf {
    let mut name = destination.as_os_str().to_owned();
    name.push(".");
    name.push(PARTIAL_SUFFIX);
    PathBuf::from(name)
}

async fn remove_partial(partial: &Path) {
    match tokio::fs::remove_file(partial).await {
        Ok(()) => debug!("Removed partial file {:?}", partial),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!("Failed to remove partial file {:?}: {}", partial, e),
    }
}

/// Verify SHA-256 checksum of a downloaded file.
async fn verify_checksum(path: &Path, expected: &str) -> Result<(), ModelError> {
    let mut file = tokio::fs::File::open(path)
        .await
        .map_err(|e| ModelError::TransferFailure(format!("could not verify file ({})", e)))?;

    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; 1024 * 1024];

    loop {
        let read = file
            .read(&mut buffer)
            .await
            .map_err(|e| ModelError::TransferFailure(format!("could not verify file ({})", e)))?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }

    let computed = format!("{:x}", hasher.finalize());
    if !computed.eq_ignore_ascii_case(expected) {
        return Err(ModelError::TransferFailure(format!(
            "checksum mismatch (expected {}, got {})",
            expected, computed
        )));
    }

    Ok(())
}
