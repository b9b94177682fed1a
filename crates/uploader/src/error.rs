//! Upload error types.

use crate::types::Recovery;

/// Errors produced while selecting, transforming or sending files.
#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The selection was rejected before any transformation.
    #[error("{0}")]
    Validation(String),

    #[error("no upload target set")]
    NoParent,

    #[error("token request failed: {0}")]
    Token(String),

    #[error("chunk upload failed: {0}")]
    Chunk(String),

    #[error("remote error: {0}")]
    Remote(String),

    #[error("{task} is waiting for {recovery}")]
    NeedsRecovery { task: String, recovery: Recovery },

    #[error("invalid session state: {0}")]
    InvalidTransition(#[from] scrubdrop_transfer::TransferError),

    #[error("cancelled")]
    Cancelled,
}

impl UploadError {
    /// The user action that can recover from this error, if any.
    pub fn recovery(&self) -> Option<Recovery> {
        match self {
            UploadError::Token(_) => Some(Recovery::Restart),
            UploadError::Chunk(_) => Some(Recovery::Resume),
            UploadError::NeedsRecovery { recovery, .. } => Some(*recovery),
            _ => None,
        }
    }
}
