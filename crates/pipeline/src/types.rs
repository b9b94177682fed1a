use std::fmt;
use std::sync::Arc;

use bytes::Bytes;

/// One named member of a decoded container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveEntry {
    pub name: String,
    pub is_dir: bool,
    pub raw: Bytes,
    /// Set once scrubbing was attempted.
    pub transformed: Option<Bytes>,
}

impl ArchiveEntry {
    pub fn file(name: impl Into<String>, raw: impl Into<Bytes>) -> Self {
        Self {
            name: name.into(),
            is_dir: false,
            raw: raw.into(),
            transformed: None,
        }
    }

    pub fn dir(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            is_dir: true,
            raw: Bytes::new(),
            transformed: None,
        }
    }

    /// The bytes to encode: the transformed data if present.
    pub fn output(&self) -> &Bytes {
        self.transformed.as_ref().unwrap_or(&self.raw)
    }
}

/// Stage of an archive transformation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransformPhase {
    Decode,
    Encode,
}

impl fmt::Display for TransformPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransformPhase::Decode => f.write_str("decode"),
            TransformPhase::Encode => f.write_str("encode"),
        }
    }
}

/// Observable events emitted while transforming.
#[derive(Debug, Clone, PartialEq)]
pub enum TransformEvent {
    /// Fractional progress of an archive phase (0-100).
    Progress {
        file: String,
        phase: TransformPhase,
        percent: f64,
        /// Entry currently being processed, when known.
        entry: Option<String>,
    },
    /// The container could not be decoded or encoded; the original bytes
    /// are uploaded instead.
    CodecFailed { file: String, error: String },
    /// The file resolved. `changed` is `false` when the output is the
    /// original bytes.
    Finished {
        file: String,
        changed: bool,
        size: u64,
    },
}

/// Callback invoked for each [`TransformEvent`].
pub type TransformCallback = Arc<dyn Fn(TransformEvent) + Send + Sync>;
