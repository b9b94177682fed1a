use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::ProtocolError;

/// Kind of remote resource an upload lands in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParentType {
    Folder,
    Item,
    /// An existing file whose contents are replaced in place.
    File,
}

impl ParentType {
    /// Returns the lowercase name used on the wire.
    pub fn as_str(&self) -> &'static str {
        match self {
            ParentType::Folder => "folder",
            ParentType::Item => "item",
            ParentType::File => "file",
        }
    }
}

impl fmt::Display for ParentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ParentType {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "folder" => Ok(ParentType::Folder),
            "item" => Ok(ParentType::Item),
            "file" => Ok(ParentType::File),
            other => Err(ProtocolError::UnknownParentType(other.to_string())),
        }
    }
}

/// Identity of the remote object uploads are delivered into.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParentRef {
    pub id: String,
    pub parent_type: ParentType,
}

impl ParentRef {
    pub fn new(id: impl Into<String>, parent_type: ParentType) -> Self {
        Self {
            id: id.into(),
            parent_type,
        }
    }

    pub fn folder(id: impl Into<String>) -> Self {
        Self::new(id, ParentType::Folder)
    }

    pub fn item(id: impl Into<String>) -> Self {
        Self::new(id, ParentType::Item)
    }

    pub fn file(id: impl Into<String>) -> Self {
        Self::new(id, ParentType::File)
    }

    /// Returns `true` when uploads overwrite this object instead of creating
    /// a new one beneath it.
    pub fn is_existing_file(&self) -> bool {
        self.parent_type == ParentType::File
    }
}

/// Lifecycle state of a single selected file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Transforming,
    Ready,
    RequestingToken,
    Sending,
    ErrorResume,
    ErrorRestart,
    Complete,
}

impl TaskStatus {
    /// Returns `true` while the task holds the session's single transfer slot.
    pub fn is_active(&self) -> bool {
        matches!(self, TaskStatus::RequestingToken | TaskStatus::Sending)
    }

    /// Returns `true` when the task is parked waiting for a user action.
    pub fn is_error(&self) -> bool {
        matches!(self, TaskStatus::ErrorResume | TaskStatus::ErrorRestart)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Transforming => "transforming",
            TaskStatus::Ready => "ready",
            TaskStatus::RequestingToken => "requesting_token",
            TaskStatus::Sending => "sending",
            TaskStatus::ErrorResume => "error_resume",
            TaskStatus::ErrorRestart => "error_restart",
            TaskStatus::Complete => "complete",
        };
        f.write_str(s)
    }
}

/// Summary of one task as reported to observers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileReport {
    pub name: String,
    /// Size recorded at selection time.
    pub declared_size: u64,
    /// Size of the payload actually sent.
    pub size: u64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub mime_type: String,
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
}

/// Read-only progress snapshot of an upload session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadProgress {
    pub session_id: String,
    /// Zero-based index of the task currently sequencing.
    pub current_index: usize,
    pub total_files: usize,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub current_file: String,
    /// Bytes acknowledged for the current file.
    pub current_sent: u64,
    /// Size of the current file's payload as it is sent.
    pub current_total: u64,
    pub overall_sent: u64,
    pub overall_total: u64,
    #[serde(default)]
    pub bytes_per_second: f64,
    /// Estimated seconds until the whole session is sent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eta_seconds: Option<u64>,
}

impl UploadProgress {
    /// Current file progress as a percentage (0-100).
    pub fn current_percentage(&self) -> f64 {
        percentage(self.current_sent, self.current_total)
    }

    /// Whole-session progress as a percentage (0-100).
    pub fn overall_percentage(&self) -> f64 {
        percentage(self.overall_sent, self.overall_total)
    }
}

fn percentage(done: u64, total: u64) -> f64 {
    if total == 0 {
        return 0.0;
    }
    done as f64 / total as f64 * 100.0
}
