//! Wire types shared by the scrubdrop upload stack.
//!
//! `types` holds the session-facing vocabulary (targets, task status,
//! progress snapshots); `messages` holds the documents exchanged with the
//! remote storage service.

pub mod messages;
pub mod types;

pub use messages::{
    ErrorResponse, FileDocument, RemoteDocument, TokenGrant, UploadAck, UploadDocument,
    UploadToken, UploadTokenRequest,
};
pub use types::{FileReport, ParentRef, ParentType, TaskStatus, UploadProgress};

/// Errors produced while interpreting protocol values.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("unknown parent type: {0}")]
    UnknownParentType(String),
}
