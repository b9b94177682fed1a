use std::path::{Component, Path};

use crate::TransferError;

/// What a dropped item turned out to be.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Directory,
    /// A link or URI dragged in from another application.
    Uri,
    /// A plain text snippet.
    Text,
    /// The source could not tell; treated as a file.
    Unknown,
}

/// One item of a drag-and-drop batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DropEntry {
    pub name: String,
    pub kind: EntryKind,
}

impl DropEntry {
    pub fn new(name: impl Into<String>, kind: EntryKind) -> Self {
        Self {
            name: name.into(),
            kind,
        }
    }

    /// Classifies a local path. Missing paths come back as [`EntryKind::Unknown`]
    /// so the read that follows reports the real error.
    pub fn from_path(path: &Path) -> Self {
        let kind = match std::fs::metadata(path) {
            Ok(meta) if meta.is_dir() => EntryKind::Directory,
            Ok(meta) if meta.is_file() => EntryKind::File,
            Ok(_) | Err(_) => EntryKind::Unknown,
        };
        Self::new(path.to_string_lossy(), kind)
    }

    pub fn is_plain_file(&self) -> bool {
        matches!(self.kind, EntryKind::File | EntryKind::Unknown)
    }
}

/// Checks a whole drop batch. One non-file entry rejects everything.
pub fn validate_drop(entries: &[DropEntry]) -> Result<(), TransferError> {
    match entries.iter().find(|e| !e.is_plain_file()) {
        Some(bad) => Err(TransferError::NotAFile(bad.name.clone())),
        None => Ok(()),
    }
}

/// Validates the base name a file is uploaded under.
///
/// Rejects empty names, `.`/`..`, and anything containing a path separator
/// or NUL byte.
pub fn validate_upload_name(name: &str) -> Result<(), TransferError> {
    if name.is_empty() {
        return Err(TransferError::InvalidName("empty name".into()));
    }
    if name.contains(['/', '\\', '\0']) {
        return Err(TransferError::InvalidName(format!(
            "separator not allowed: {name}"
        )));
    }
    match Path::new(name).components().next() {
        Some(Component::Normal(_)) => Ok(()),
        _ => Err(TransferError::InvalidName(format!("not a file name: {name}"))),
    }
}
