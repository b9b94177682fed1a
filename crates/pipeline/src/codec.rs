use std::io::{Cursor, Read, Write};

use zip::write::FileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use crate::CodecError;
use crate::types::ArchiveEntry;

const ZIP_MIME: &str = "application/zip";

/// Decodes and re-encodes a container format.
///
/// Progress callbacks receive a percentage (0-100) and, while encoding, the
/// entry just written.
pub trait ArchiveCodec: Send + Sync {
    /// Returns `true` if this codec should handle the named file.
    fn handles(&self, name: &str, mime_hint: &str) -> bool;

    fn decode(
        &self,
        data: &[u8],
        progress: &dyn Fn(f64),
    ) -> Result<Vec<ArchiveEntry>, CodecError>;

    fn encode(
        &self,
        entries: &[ArchiveEntry],
        progress: &dyn Fn(f64, &str),
    ) -> Result<Vec<u8>, CodecError>;
}

/// ZIP archives, deflated on encode.
#[derive(Debug, Clone, Copy, Default)]
pub struct ZipCodec;

impl ArchiveCodec for ZipCodec {
    /// Matches the zip MIME type, or a `.zip` extension when no type is known.
    fn handles(&self, name: &str, mime_hint: &str) -> bool {
        if !mime_hint.is_empty() {
            return mime_hint.eq_ignore_ascii_case(ZIP_MIME);
        }
        name.to_ascii_lowercase().ends_with(".zip")
    }

    fn decode(
        &self,
        data: &[u8],
        progress: &dyn Fn(f64),
    ) -> Result<Vec<ArchiveEntry>, CodecError> {
        let mut archive = ZipArchive::new(Cursor::new(data))?;
        let total = archive.len();
        let mut entries = Vec::with_capacity(total);

        for i in 0..total {
            let mut file = archive.by_index(i)?;
            let name = file.name().to_string();
            if file.is_dir() {
                entries.push(ArchiveEntry::dir(name));
            } else {
                // The central directory size is untrusted: read at most one
                // byte past it and reject any mismatch.
                let declared = file.size();
                let mut buf = Vec::new();
                file.by_ref()
                    .take(declared.saturating_add(1))
                    .read_to_end(&mut buf)?;
                if buf.len() as u64 != declared {
                    return Err(CodecError::SizeMismatch {
                        entry: name,
                        declared,
                        actual: buf.len() as u64,
                    });
                }
                entries.push(ArchiveEntry::file(name, buf));
            }
            progress((i + 1) as f64 / total as f64 * 100.0);
        }
        Ok(entries)
    }

    fn encode(
        &self,
        entries: &[ArchiveEntry],
        progress: &dyn Fn(f64, &str),
    ) -> Result<Vec<u8>, CodecError> {
        let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
        let options = FileOptions::default().compression_method(CompressionMethod::Deflated);
        let total = entries.len();

        for (i, entry) in entries.iter().enumerate() {
            if entry.is_dir {
                writer.add_directory(entry.name.as_str(), options)?;
            } else {
                writer.start_file(entry.name.as_str(), options)?;
                writer.write_all(entry.output())?;
            }
            progress((i + 1) as f64 / total as f64 * 100.0, &entry.name);
        }

        let cursor = writer.finish()?;
        Ok(cursor.into_inner())
    }
}
