//! Pre-upload transformation pipeline.
//!
//! Every selected file passes through [`TransformPipeline::transform`] before
//! it is sent. Archives are decoded, each entry is scrubbed concurrently,
//! and the entries are re-encoded once all of them resolved. Anything else
//! is scrubbed directly. The pipeline always resolves with usable bytes:
//! unrecognized formats and codec failures fall back to the original data.

pub mod codec;
pub mod transform;
pub mod types;

pub use codec::{ArchiveCodec, ZipCodec};
pub use transform::TransformPipeline;
pub use types::{ArchiveEntry, TransformCallback, TransformEvent, TransformPhase};

/// Errors produced by an archive codec.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("zip error: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("entry {entry} declares {declared} bytes but holds {actual}")]
    SizeMismatch {
        entry: String,
        declared: u64,
        actual: u64,
    },

    #[error("codec task failed: {0}")]
    Task(String),
}
