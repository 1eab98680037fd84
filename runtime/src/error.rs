use derive_more::{Display, From};

/// Failures of the local model subsystem.
///
/// None of these cross a component boundary as a fault: each one is turned
/// into observable state (a status, a task error, a notification) carrying
/// [`ModelError::user_message`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ModelError {
    #[error("Model path invalid: {0}")]
    ModelPathInvalid(String),
    #[error("Native load failed: {0}")]
    NativeLoadFailure(String),
    #[error("Session unavailable: {0}")]
    SessionUnavailable(String),
    #[error("Transfer failed: {0}")]
    TransferFailure(String),
    #[error("Transfer cancelled")]
    TransferCanceled,
    #[error("Catalog unavailable: {0}")]
    CatalogUnavailable(String),
}

impl ModelError {
    /// Returns a user-friendly error message suitable for display in the UI
    pub fn user_message(&self) -> String {
        match self {
            ModelError::ModelPathInvalid(path) if path.is_empty() => {
                "No model file is configured. Please choose a model in Settings.".to_string()
            }
            ModelError::ModelPathInvalid(path) => {
                format!(
                    "Model file not found: {}. Please download it again or choose another file.",
                    path
                )
            }
            ModelError::NativeLoadFailure(_) => {
                "The model could not be loaded. It may be corrupted or too large for this machine."
                    .to_string()
            }
            ModelError::SessionUnavailable(_) => {
                "The local model is not ready. Load a model and try again.".to_string()
            }
            ModelError::TransferFailure(reason) => format!("Download failed: {}.", reason),
            ModelError::TransferCanceled => "Download cancelled.".to_string(),
            ModelError::CatalogUnavailable(_) => {
                "Could not fetch the list of downloadable models. Check your connection."
                    .to_string()
            }
        }
    }
}

/// Errors surfaced while wiring the runtime together.
#[derive(Debug, From, Display)]
pub enum Error {
    #[from]
    #[display("{_0}")]
    Model(ModelError),

    #[from]
    #[display("{_0}")]
    Config(crate::config::ConfigError),

    #[from]
    #[display("{_0}")]
    Registry(crate::models::RegistryError),

    #[from]
    #[display("{_0}")]
    Backend(crate::models::BackendError),

    #[from]
    #[display("{_0}")]
    Io(std::io::Error),
}

impl std::error::Error for Error {}
