use std::sync::Arc;

use crate::{DicomScrubber, ExifScrubber, ScrubError, ScrubOutcome, Scrubber};

/// Tries each scrubber in order; the first one that recognizes the payload
/// wins.
#[derive(Clone, Default)]
pub struct ScrubberChain {
    scrubbers: Vec<Arc<dyn Scrubber>>,
}

impl std::fmt::Debug for ScrubberChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<_> = self.scrubbers.iter().map(|s| s.name()).collect();
        f.debug_struct("ScrubberChain")
            .field("scrubbers", &names)
            .finish()
    }
}

impl ScrubberChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, scrubber: impl Scrubber + 'static) -> Self {
        self.scrubbers.push(Arc::new(scrubber));
        self
    }

    /// DICOM scrubbing for the named tags, plus EXIF stripping when enabled.
    pub fn from_settings<S: AsRef<str>>(
        dicom_tags: &[S],
        strip_exif: bool,
    ) -> Result<Self, ScrubError> {
        let chain = Self::new().with(DicomScrubber::from_names(dicom_tags)?);
        Ok(if strip_exif {
            chain.with(ExifScrubber)
        } else {
            chain
        })
    }

    pub fn len(&self) -> usize {
        self.scrubbers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scrubbers.is_empty()
    }
}

impl Scrubber for ScrubberChain {
    fn name(&self) -> &'static str {
        "chain"
    }

    /// Returns the first `Recognized` outcome. Otherwise the first
    /// `Malformed` one, or `Unrecognized` if no scrubber claimed the bytes.
    fn scrub(&self, data: &[u8]) -> ScrubOutcome {
        let mut malformed = None;
        for scrubber in &self.scrubbers {
            match scrubber.scrub(data) {
                ScrubOutcome::Recognized(out) => return ScrubOutcome::Recognized(out),
                ScrubOutcome::Malformed(reason) if malformed.is_none() => {
                    malformed = Some(format!("{}: {reason}", scrubber.name()));
                }
                _ => {}
            }
        }
        malformed.map_or(ScrubOutcome::Unrecognized, ScrubOutcome::Malformed)
    }
}
