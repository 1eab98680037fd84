//! Events published by the models module.
//!
//! Each source publishes on its own broadcast channel, so events from one
//! source arrive in the order they happened. Uses tagged enums for cleaner
//! event handling on the consumer side.

use serde::Serialize;

use super::downloads::{DownloadId, DownloadSnapshot};
use super::status::ModelStatus;

/// Model lifecycle change, published on every status or progress transition.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelStateChanged {
    pub status: ModelStatus,
    /// Fraction of the native load completed, 0.0 outside of `Loading`
    pub progress: f32,
    pub error_message: Option<String>,
}

/// Change to the tracked download set.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "change", rename_all = "camelCase")]
pub enum DownloadsChanged {
    /// A new task is being tracked
    #[serde(rename = "added")]
    Added { task: DownloadSnapshot },
    /// A tracked task changed status or progress
    #[serde(rename = "updated")]
    Updated { task: DownloadSnapshot },
    /// A task was cleared or replaced by a retry
    #[serde(rename = "removed")]
    Removed { id: DownloadId },
}
