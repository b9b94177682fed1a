//! Structured-metadata scrubbers.
//!
//! A [`Scrubber`] inspects raw bytes and either rewrites them with sensitive
//! fields cleared, or reports that the bytes are not its format. Callers keep
//! the original bytes on anything but [`ScrubOutcome::Recognized`].

mod chain;
mod dicom;
mod exif;

pub use chain::ScrubberChain;
pub use dicom::{DicomScrubber, Tag};
pub use exif::ExifScrubber;

/// Result of a single scrub attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScrubOutcome {
    /// The format was recognized; these are the scrubbed bytes.
    Recognized(Vec<u8>),
    /// Not this scrubber's format.
    Unrecognized,
    /// The format signature matched but the contents could not be parsed.
    Malformed(String),
}

impl ScrubOutcome {
    pub fn is_recognized(&self) -> bool {
        matches!(self, ScrubOutcome::Recognized(_))
    }
}

/// Clears sensitive fields from one payload format.
pub trait Scrubber: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    fn scrub(&self, data: &[u8]) -> ScrubOutcome;
}

/// Errors produced while configuring or running a scrubber.
#[derive(Debug, thiserror::Error)]
pub enum ScrubError {
    #[error("unknown DICOM tag: {0}")]
    UnknownTag(String),

    #[error("truncated element at offset {offset}")]
    Truncated { offset: usize },

    #[error("missing transfer syntax in file meta information")]
    MissingTransferSyntax,

    #[error("unsupported transfer syntax: {0}")]
    UnsupportedTransferSyntax(String),

    #[error("invalid value representation at offset {offset}")]
    InvalidVr { offset: usize },

    #[error("unexpected tag {tag} at offset {offset}")]
    UnexpectedTag { tag: Tag, offset: usize },

    #[error("sequences nested too deeply at offset {offset}")]
    NestingTooDeep { offset: usize },

    #[error("image rewrite failed: {0}")]
    Image(String),
}
