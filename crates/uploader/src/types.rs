use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use scrubdrop_pipeline::TransformEvent;
use scrubdrop_protocol::{FileReport, ParentRef, ParentType, UploadProgress};
use scrubdrop_transfer::{DEFAULT_CHUNK_SIZE, DropEntry, UploadSession};
use serde_json::{Map, Value};

/// User action offered after a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recovery {
    /// Continue from the last acknowledged byte.
    Resume,
    /// Discard the partial upload and request a new token.
    Restart,
}

impl fmt::Display for Recovery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Recovery::Resume => f.write_str("resume"),
            Recovery::Restart => f.write_str("restart"),
        }
    }
}

/// Events emitted by the controller and sequencer for the UI.
#[derive(Debug, Clone)]
pub enum UploadEvent {
    /// The selection changed.
    FilesChanged(Vec<FileReport>),
    UploadStarted {
        session_id: String,
        total_files: usize,
        total_size: u64,
    },
    Transform(TransformEvent),
    Progress(UploadProgress),
    ItemComplete(FileReport),
    UploadFinished {
        files: Vec<FileReport>,
        total_size: u64,
    },
    Error {
        file: String,
        message: String,
        recovery: Recovery,
    },
}

/// Result of a session that ran to completion.
#[derive(Debug, Clone, PartialEq)]
pub struct UploadSummary {
    pub files: Vec<FileReport>,
    pub total_size: u64,
}

/// Parameters merged into every token request of a session.
#[derive(Clone, Default)]
pub enum ExtraParams {
    #[default]
    None,
    Static(Map<String, Value>),
    /// Evaluated once, when the session starts.
    Lazy(Arc<dyn Fn(&UploadSession) -> Map<String, Value> + Send + Sync>),
}

impl ExtraParams {
    pub fn lazy(f: impl Fn(&UploadSession) -> Map<String, Value> + Send + Sync + 'static) -> Self {
        ExtraParams::Lazy(Arc::new(f))
    }

    pub fn resolve(&self, session: &UploadSession) -> Map<String, Value> {
        match self {
            ExtraParams::None => Map::new(),
            ExtraParams::Static(map) => map.clone(),
            ExtraParams::Lazy(f) => f(session),
        }
    }
}

impl fmt::Debug for ExtraParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExtraParams::None => f.write_str("None"),
            ExtraParams::Static(map) => f.debug_tuple("Static").field(map).finish(),
            ExtraParams::Lazy(_) => f.write_str("Lazy(..)"),
        }
    }
}

/// Configuration accepted when a session is created.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Upload target. May be set later, before start.
    pub parent: Option<ParentRef>,
    /// Whether several files may be selected. Defaults to `true` unless the
    /// target is an existing file.
    pub multi_file: Option<bool>,
    pub extra_params: ExtraParams,
    pub chunk_size: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            parent: None,
            multi_file: None,
            extra_params: ExtraParams::None,
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }
}

impl SessionConfig {
    pub fn new(parent: Option<ParentRef>) -> Self {
        Self {
            parent,
            ..Self::default()
        }
    }

    pub fn multi_file(&self) -> bool {
        self.multi_file.unwrap_or_else(|| {
            self.parent
                .as_ref()
                .is_none_or(|p| p.parent_type != ParentType::File)
        })
    }
}

/// One entry of a drag-and-drop batch with its contents.
#[derive(Debug, Clone)]
pub struct DroppedFile {
    pub entry: DropEntry,
    pub mime_type: String,
    pub contents: Bytes,
}
