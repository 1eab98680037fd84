use serde::{Deserialize, Serialize};

/// Lifecycle status of the local model.
///
/// ```text
/// Unloaded ──load──> Loading ──ok──> Loaded
///    ^                  │
///    │                  └──fail──> Error
///    └──────unload──── Loaded | Error | Loading
/// ```
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "lowercase")]
pub enum ModelStatus {
    #[default]
    Unloaded,
    Loading,
    Loaded,
    Error,
}

impl ModelStatus {
    /// A load request in this state is ignored.
    pub fn is_busy(self) -> bool {
        matches!(self, Self::Loading | Self::Loaded)
    }
}
