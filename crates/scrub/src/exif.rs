use bytes::Bytes;
use img_parts::ImageEXIF;
use img_parts::jpeg::Jpeg;
use img_parts::png::Png;
use tracing::debug;

use crate::{ScrubError, ScrubOutcome, Scrubber};

const JPEG_MAGIC: &[u8] = &[0xFF, 0xD8, 0xFF];
const PNG_MAGIC: &[u8] = &[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A];

/// Removes EXIF blocks from JPEG and PNG images.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExifScrubber;

impl ExifScrubber {
    fn strip_jpeg(data: &[u8]) -> Result<Option<Vec<u8>>, ScrubError> {
        let mut jpeg = Jpeg::from_bytes(Bytes::copy_from_slice(data))
            .map_err(|e| ScrubError::Image(e.to_string()))?;
        if jpeg.exif().is_none() {
            return Ok(None);
        }
        jpeg.set_exif(None);
        Ok(Some(jpeg.encoder().bytes().to_vec()))
    }

    fn strip_png(data: &[u8]) -> Result<Option<Vec<u8>>, ScrubError> {
        let mut png = Png::from_bytes(Bytes::copy_from_slice(data))
            .map_err(|e| ScrubError::Image(e.to_string()))?;
        if png.exif().is_none() {
            return Ok(None);
        }
        png.set_exif(None);
        Ok(Some(png.encoder().bytes().to_vec()))
    }
}

impl Scrubber for ExifScrubber {
    fn name(&self) -> &'static str {
        "exif"
    }

    fn scrub(&self, data: &[u8]) -> ScrubOutcome {
        let result = if data.starts_with(JPEG_MAGIC) {
            Self::strip_jpeg(data)
        } else if data.starts_with(PNG_MAGIC) {
            Self::strip_png(data)
        } else {
            return ScrubOutcome::Unrecognized;
        };

        match result {
            Ok(Some(out)) => {
                debug!(before = data.len(), after = out.len(), "stripped EXIF");
                ScrubOutcome::Recognized(out)
            }
            // Nothing to strip; keep the exact input bytes.
            Ok(None) => ScrubOutcome::Recognized(data.to_vec()),
            Err(e) => ScrubOutcome::Malformed(e.to_string()),
        }
    }
}
