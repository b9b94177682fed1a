use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::types::ParentType;

// ---------------------------------------------------------------------------
// Requests
// ---------------------------------------------------------------------------

/// Request for a new upload target beneath a parent object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadTokenRequest {
    pub parent_type: ParentType,
    pub parent_id: String,
    pub name: String,
    pub size: u64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub mime_type: String,
    /// Session-scoped parameters merged into the request verbatim.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

// ---------------------------------------------------------------------------
// Remote documents
// ---------------------------------------------------------------------------

/// A not-yet-complete upload as reported by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadDocument {
    #[serde(rename = "_id")]
    pub id: String,
    pub size: u64,
    #[serde(default)]
    pub received: u64,
    #[serde(default, rename = "fileId", skip_serializing_if = "Option::is_none")]
    pub file_id: Option<String>,
}

/// A finalized file object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileDocument {
    #[serde(rename = "_id")]
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub size: u64,
    #[serde(default, rename = "itemId", skip_serializing_if = "Option::is_none")]
    pub item_id: Option<String>,
    #[serde(default, rename = "mimeType", skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
}

/// Any document returned by the upload endpoints, discriminated by
/// `_modelType`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "_modelType", rename_all = "lowercase")]
pub enum RemoteDocument {
    Upload(UploadDocument),
    File(FileDocument),
}

/// Error body returned by the server on non-2xx responses.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub message: String,
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
}

// ---------------------------------------------------------------------------
// Transport-neutral results
// ---------------------------------------------------------------------------

/// Server-issued handle for an upload in progress.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadToken {
    pub upload_id: String,
    pub size: u64,
    /// Bytes the server already holds when the token was issued.
    #[serde(default)]
    pub received: u64,
}

/// Outcome of a token request.
#[derive(Debug, Clone, PartialEq)]
pub enum TokenGrant {
    /// Chunks must follow.
    Upload(UploadToken),
    /// Nothing to send: the server finalized the file immediately
    /// (zero-length content).
    Finished(FileDocument),
}

/// Acknowledgement of a chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadAck {
    /// More bytes are expected; `received` is authoritative.
    Partial { received: u64 },
    /// The final byte arrived and the file object now exists.
    Complete { file_id: String, size: u64 },
}

impl UploadAck {
    /// Total bytes the server reports holding.
    pub fn received(&self) -> u64 {
        match self {
            UploadAck::Partial { received } => *received,
            UploadAck::Complete { size, .. } => *size,
        }
    }
}

impl From<UploadDocument> for UploadToken {
    fn from(doc: UploadDocument) -> Self {
        Self {
            upload_id: doc.id,
            size: doc.size,
            received: doc.received,
        }
    }
}

impl From<RemoteDocument> for TokenGrant {
    fn from(doc: RemoteDocument) -> Self {
        match doc {
            RemoteDocument::Upload(upload) => TokenGrant::Upload(upload.into()),
            RemoteDocument::File(file) => TokenGrant::Finished(file),
        }
    }
}

impl From<RemoteDocument> for UploadAck {
    fn from(doc: RemoteDocument) -> Self {
        match doc {
            RemoteDocument::Upload(upload) => UploadAck::Partial {
                received: upload.received,
            },
            RemoteDocument::File(file) => UploadAck::Complete {
                file_id: file.id,
                size: file.size,
            },
        }
    }
}
