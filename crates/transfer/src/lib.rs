//! Upload session model, chunking and selection validation.
//!
//! The [`UploadSession`] record owns every selected [`FileTask`] and the
//! cumulative counters. All state changes go through its checked
//! transition methods so the sequencing invariants live in one place.

mod chunked;
mod progress;
mod types;
mod validation;

pub use chunked::{Chunk, ChunkReader, checksum_bytes};
pub use progress::SpeedCalculator;
pub use types::{FileTask, UploadSession};
pub use validation::{DropEntry, EntryKind, validate_drop, validate_upload_name};

use scrubdrop_protocol::TaskStatus;

/// Default chunk size: 4 MiB.
pub const DEFAULT_CHUNK_SIZE: usize = 4 * 1024 * 1024;

/// Message shown when a drop batch contains something other than plain files.
pub const ONLY_FILES_MESSAGE: &str = "Only files may be uploaded.";

/// Errors produced by the transfer crate.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{ONLY_FILES_MESSAGE} Rejected: {0}")]
    NotAFile(String),

    #[error("invalid file name: {0}")]
    InvalidName(String),

    #[error("session already started")]
    SessionStarted,

    #[error("cannot {action} task {task} while {from}")]
    InvalidTransition {
        task: String,
        from: TaskStatus,
        action: &'static str,
    },

    #[error("another task is already transferring: {0}")]
    SlotBusy(String),

    #[error("no task at index {0}")]
    NoSuchTask(usize),

    #[error("acknowledged offset {received} is outside {sent}..={size}")]
    BadAck { received: u64, sent: u64, size: u64 },
}
