use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use futures_util::future::join_all;
use scrubdrop_protocol::TaskStatus;
use scrubdrop_scrub::{ScrubOutcome, Scrubber, ScrubberChain};
use scrubdrop_transfer::{TransferError, UploadSession};
use tracing::{debug, info, warn};

use crate::CodecError;
use crate::codec::{ArchiveCodec, ZipCodec};
use crate::types::{ArchiveEntry, TransformCallback, TransformEvent, TransformPhase};

/// Turns selected files into upload payloads.
#[derive(Clone)]
pub struct TransformPipeline {
    scrubber: Arc<dyn Scrubber>,
    codec: Arc<dyn ArchiveCodec>,
    callback: Option<TransformCallback>,
}

impl Default for TransformPipeline {
    /// Default DICOM scrubbing and ZIP recursion.
    fn default() -> Self {
        Self::new(
            ScrubberChain::new().with(scrubdrop_scrub::DicomScrubber::default()),
            ZipCodec,
        )
    }
}

impl TransformPipeline {
    pub fn new(scrubber: impl Scrubber + 'static, codec: impl ArchiveCodec + 'static) -> Self {
        Self {
            scrubber: Arc::new(scrubber),
            codec: Arc::new(codec),
            callback: None,
        }
    }

    /// Registers the sink for progress and warning events.
    pub fn with_callback(mut self, callback: TransformCallback) -> Self {
        self.callback = Some(callback);
        self
    }

    pub fn set_callback(&mut self, callback: Option<TransformCallback>) {
        self.callback = callback;
    }

    /// Transforms one file. Never fails: on any problem the original bytes
    /// come back.
    pub async fn transform(&self, name: &str, mime_hint: &str, data: Bytes) -> Bytes {
        let output = if self.codec.handles(name, mime_hint) {
            match self.transform_archive(name, data.clone()).await {
                Ok(out) => out,
                Err(e) => {
                    warn!(file = %name, error = %e, "archive codec failed, keeping original");
                    self.emit(TransformEvent::CodecFailed {
                        file: name.to_string(),
                        error: e.to_string(),
                    });
                    data.clone()
                }
            }
        } else {
            self.scrub_bytes(name, data.clone()).await
        };

        self.emit(TransformEvent::Finished {
            file: name.to_string(),
            changed: output != data,
            size: output.len() as u64,
        });
        output
    }

    /// Transforms every pending task of the session concurrently and installs
    /// the results. Returns the number of tasks transformed.
    pub async fn transform_all(&self, session: &mut UploadSession) -> Result<usize, TransferError> {
        let mut jobs = Vec::new();
        for index in 0..session.len() {
            let Some(task) = session.task(index) else {
                continue;
            };
            if task.status() != TaskStatus::Pending {
                continue;
            }
            let name = task.name().to_string();
            let mime = task.mime_hint().to_string();
            let payload = session.begin_transform(index)?;
            jobs.push((index, name, mime, payload));
        }

        info!(session = %session.id(), files = jobs.len(), "transforming selection");
        let results = join_all(jobs.into_iter().map(|(index, name, mime, payload)| async move {
            (index, self.transform(&name, &mime, payload).await)
        }))
        .await;

        let count = results.len();
        for (index, payload) in results {
            session.finish_transform(index, payload)?;
        }
        Ok(count)
    }

    async fn transform_archive(&self, name: &str, data: Bytes) -> Result<Bytes, CodecError> {
        let codec = Arc::clone(&self.codec);
        let callback = self.callback.clone();
        let file = name.to_string();
        let entries = tokio::task::spawn_blocking(move || {
            codec.decode(&data, &|percent| {
                if let Some(cb) = &callback {
                    cb(TransformEvent::Progress {
                        file: file.clone(),
                        phase: TransformPhase::Decode,
                        percent,
                        entry: None,
                    });
                }
            })
        })
        .await
        .map_err(|e| CodecError::Task(e.to_string()))??;

        let entries = flatten_names(entries.into_iter().filter(|e| !e.is_dir).collect());
        debug!(file = %name, entries = entries.len(), "archive decoded");

        // Barrier: encoding starts only after every entry resolved.
        let entries = join_all(entries.into_iter().map(|mut entry| async move {
            entry.transformed = Some(self.scrub_bytes(&entry.name, entry.raw.clone()).await);
            entry
        }))
        .await;

        let codec = Arc::clone(&self.codec);
        let callback = self.callback.clone();
        let file = name.to_string();
        let encoded = tokio::task::spawn_blocking(move || {
            codec.encode(&entries, &|percent, entry| {
                if let Some(cb) = &callback {
                    cb(TransformEvent::Progress {
                        file: file.clone(),
                        phase: TransformPhase::Encode,
                        percent,
                        entry: Some(entry.to_string()),
                    });
                }
            })
        })
        .await
        .map_err(|e| CodecError::Task(e.to_string()))??;

        Ok(Bytes::from(encoded))
    }

    /// One scrub attempt. Anything but a recognized result keeps `data`.
    async fn scrub_bytes(&self, name: &str, data: Bytes) -> Bytes {
        let scrubber = Arc::clone(&self.scrubber);
        let input = data.clone();
        match tokio::task::spawn_blocking(move || scrubber.scrub(&input)).await {
            Ok(ScrubOutcome::Recognized(out)) => {
                debug!(file = %name, before = data.len(), after = out.len(), "scrubbed");
                Bytes::from(out)
            }
            Ok(ScrubOutcome::Unrecognized) => {
                debug!(file = %name, "no structured metadata");
                data
            }
            Ok(ScrubOutcome::Malformed(reason)) => {
                debug!(file = %name, reason = %reason, "unparseable metadata, keeping original");
                data
            }
            Err(e) => {
                warn!(file = %name, error = %e, "scrub task failed, keeping original");
                data
            }
        }
    }

    fn emit(&self, event: TransformEvent) {
        if let Some(cb) = &self.callback {
            cb(event);
        }
    }
}

/// Strips directory components from entry names. Entries whose base names
/// collide keep their full path.
fn flatten_names(mut entries: Vec<ArchiveEntry>) -> Vec<ArchiveEntry> {
    let mut counts: HashMap<String, usize> = HashMap::new();
    for entry in &entries {
        *counts.entry(base_name(&entry.name).to_string()).or_default() += 1;
    }
    for entry in &mut entries {
        let base = base_name(&entry.name).to_string();
        if counts.get(&base) == Some(&1) {
            entry.name = base;
        }
    }
    entries
}

fn base_name(name: &str) -> &str {
    name.rsplit(['/', '\\']).next().unwrap_or(name)
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use bytes::Bytes;
    use scrubdrop_protocol::ParentRef;
    use scrubdrop_transfer::FileTask;

    use super::*;
    use crate::codec::tests::{build_zip, oversized_zip};

    /// Recognizes payloads starting with `SECRET` and replaces them.
    struct PrefixScrubber {
        seen: Mutex<Vec<Vec<u8>>>,
    }

    impl PrefixScrubber {
        fn new() -> Self {
            Self {
                seen: Mutex::new(Vec::new()),
            }
        }
    }

    impl Scrubber for PrefixScrubber {
        fn name(&self) -> &'static str {
            "prefix"
        }

        fn scrub(&self, data: &[u8]) -> ScrubOutcome {
            self.seen.lock().unwrap().push(data.to_vec());
            if data.starts_with(b"SECRET") {
                ScrubOutcome::Recognized(b"CLEAN".to_vec())
            } else if data.starts_with(b"BROKEN") {
                ScrubOutcome::Malformed("bad header".into())
            } else {
                ScrubOutcome::Unrecognized
            }
        }
    }

    struct FailingCodec;

    impl ArchiveCodec for FailingCodec {
        fn handles(&self, _name: &str, _mime_hint: &str) -> bool {
            true
        }

        fn decode(
            &self,
            _data: &[u8],
            _progress: &dyn Fn(f64),
        ) -> Result<Vec<ArchiveEntry>, CodecError> {
            Err(CodecError::Task("corrupt".into()))
        }

        fn encode(
            &self,
            _entries: &[ArchiveEntry],
            _progress: &dyn Fn(f64, &str),
        ) -> Result<Vec<u8>, CodecError> {
            unreachable!()
        }
    }

    /// Records the entries handed to encode.
    struct RecordingCodec {
        entries: Vec<ArchiveEntry>,
        encoded: Arc<Mutex<Vec<ArchiveEntry>>>,
    }

    impl ArchiveCodec for RecordingCodec {
        fn handles(&self, name: &str, _mime_hint: &str) -> bool {
            name.ends_with(".zip")
        }

        fn decode(
            &self,
            _data: &[u8],
            progress: &dyn Fn(f64),
        ) -> Result<Vec<ArchiveEntry>, CodecError> {
            progress(100.0);
            Ok(self.entries.clone())
        }

        fn encode(
            &self,
            entries: &[ArchiveEntry],
            _progress: &dyn Fn(f64, &str),
        ) -> Result<Vec<u8>, CodecError> {
            *self.encoded.lock().unwrap() = entries.to_vec();
            Ok(b"ENCODED".to_vec())
        }
    }

    fn collecting_callback() -> (TransformCallback, Arc<Mutex<Vec<TransformEvent>>>) {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        let cb: TransformCallback = Arc::new(move |e| sink.lock().unwrap().push(e));
        (cb, events)
    }

    #[tokio::test]
    async fn unrecognized_file_passes_through() {
        let pipeline = TransformPipeline::new(PrefixScrubber::new(), ZipCodec);
        let data = Bytes::from_static(b"just text");
        let out = pipeline.transform("a.txt", "text/plain", data.clone()).await;
        assert_eq!(out, data);
    }

    #[tokio::test]
    async fn malformed_file_passes_through() {
        let pipeline = TransformPipeline::new(PrefixScrubber::new(), ZipCodec);
        let data = Bytes::from_static(b"BROKEN payload");
        let out = pipeline.transform("a.dcm", "", data.clone()).await;
        assert_eq!(out, data);
    }

    #[tokio::test]
    async fn recognized_file_is_replaced() {
        let (cb, events) = collecting_callback();
        let pipeline = TransformPipeline::new(PrefixScrubber::new(), ZipCodec).with_callback(cb);
        let out = pipeline
            .transform("a.dcm", "application/dicom", Bytes::from_static(b"SECRET data"))
            .await;
        assert_eq!(&out[..], b"CLEAN");

        let events = events.lock().unwrap();
        assert!(matches!(
            events.last(),
            Some(TransformEvent::Finished { changed: true, size: 5, .. })
        ));
    }

    #[tokio::test]
    async fn archive_entries_scrubbed_and_flattened() {
        let zip = build_zip(&[
            ("study/one.dcm", b"SECRET one"),
            ("study/two.dcm", b"SECRET two"),
            ("notes.txt", b"plain notes"),
        ]);
        let (cb, events) = collecting_callback();
        let pipeline = TransformPipeline::new(PrefixScrubber::new(), ZipCodec).with_callback(cb);
        let out = pipeline
            .transform("batch.zip", "application/zip", Bytes::from(zip))
            .await;

        let entries = ZipCodec.decode(&out, &|_| {}).unwrap();
        // Three files out; the directory entry is dropped.
        assert_eq!(entries.len(), 3);
        let by_name: HashMap<_, _> = entries
            .iter()
            .map(|e| (e.name.as_str(), e.raw.clone()))
            .collect();
        assert_eq!(&by_name["one.dcm"][..], b"CLEAN");
        assert_eq!(&by_name["two.dcm"][..], b"CLEAN");
        assert_eq!(&by_name["notes.txt"][..], b"plain notes");

        let events = events.lock().unwrap();
        assert!(events.iter().any(|e| matches!(
            e,
            TransformEvent::Progress { phase: TransformPhase::Decode, .. }
        )));
        assert!(events.iter().any(|e| matches!(
            e,
            TransformEvent::Progress { phase: TransformPhase::Encode, entry: Some(_), .. }
        )));
    }

    #[tokio::test]
    async fn encode_waits_for_every_entry() {
        let encoded = Arc::new(Mutex::new(Vec::new()));
        let codec = RecordingCodec {
            entries: vec![
                ArchiveEntry::dir("d/"),
                ArchiveEntry::file("d/a", b"SECRET a".to_vec()),
                ArchiveEntry::file("b", b"keep".to_vec()),
                ArchiveEntry::file("c/b", b"keep too".to_vec()),
            ],
            encoded: Arc::clone(&encoded),
        };
        let pipeline = TransformPipeline::new(PrefixScrubber::new(), codec);
        let out = pipeline.transform("x.zip", "", Bytes::from_static(b"zip")).await;
        assert_eq!(&out[..], b"ENCODED");

        let encoded = encoded.lock().unwrap();
        assert_eq!(encoded.len(), 3);
        assert!(encoded.iter().all(|e| e.transformed.is_some()));
        assert_eq!(encoded[0].name, "a");
        // Colliding base names keep their path.
        assert_eq!(encoded[1].name, "b");
        assert_eq!(encoded[2].name, "c/b");
        assert_eq!(encoded[2].output(), &Bytes::from_static(b"keep too"));
    }

    #[tokio::test]
    async fn codec_failure_falls_back_to_original() {
        let (cb, events) = collecting_callback();
        let pipeline = TransformPipeline::new(PrefixScrubber::new(), FailingCodec).with_callback(cb);
        let data = Bytes::from_static(b"not really a zip");
        let out = pipeline.transform("bad.zip", "application/zip", data.clone()).await;
        assert_eq!(out, data);

        let events = events.lock().unwrap();
        assert!(events.iter().any(|e| matches!(
            e,
            TransformEvent::CodecFailed { file, .. } if file == "bad.zip"
        )));
        assert!(matches!(
            events.last(),
            Some(TransformEvent::Finished { changed: false, .. })
        ));
    }

    #[tokio::test]
    async fn corrupt_zip_falls_back_to_original() {
        let pipeline = TransformPipeline::new(PrefixScrubber::new(), ZipCodec);
        let data = Bytes::from_static(b"PK\x03\x04 truncated");
        let out = pipeline.transform("bad.zip", "", data.clone()).await;
        assert_eq!(out, data);
    }

    #[tokio::test]
    async fn lying_zip_entry_size_falls_back_to_original() {
        let (cb, events) = collecting_callback();
        let pipeline = TransformPipeline::default().with_callback(cb);
        let data = Bytes::from(oversized_zip(1 << 40));
        let out = pipeline.transform("evil.zip", "application/zip", data.clone()).await;
        assert_eq!(out, data);
        assert!(events
            .lock()
            .unwrap()
            .iter()
            .any(|e| matches!(e, TransformEvent::CodecFailed { .. })));
    }

    /// Part-10 header followed by `depth` nested undefined-length sequences
    /// that are never closed.
    fn deeply_nested_dicom(depth: usize) -> Vec<u8> {
        let syntax = b"1.2.840.10008.1.2.1\0";
        let mut out = vec![0u8; 128];
        out.extend_from_slice(b"DICM");
        out.extend_from_slice(&[0x02, 0x00, 0x10, 0x00, b'U', b'I']);
        out.extend_from_slice(&(syntax.len() as u16).to_le_bytes());
        out.extend_from_slice(syntax);
        for _ in 0..depth {
            out.extend_from_slice(&[0x08, 0x00, 0x15, 0x11, b'S', b'Q', 0, 0]);
            out.extend_from_slice(&u32::MAX.to_le_bytes());
            out.extend_from_slice(&[0xFE, 0xFF, 0x00, 0xE0]);
            out.extend_from_slice(&u32::MAX.to_le_bytes());
        }
        out
    }

    #[tokio::test]
    async fn deeply_nested_dicom_passes_through() {
        let pipeline = TransformPipeline::default();
        let data = Bytes::from(deeply_nested_dicom(20_000));
        let out = pipeline.transform("deep.dcm", "", data.clone()).await;
        assert_eq!(out, data);
    }

    #[tokio::test]
    async fn transform_all_installs_payloads() {
        let mut session = UploadSession::new(Some(ParentRef::folder("f1")));
        session
            .select(vec![
                FileTask::new("a.dcm", "", Bytes::from_static(b"SECRET a")),
                FileTask::new("b.txt", "text/plain", Bytes::from_static(b"text")),
            ])
            .unwrap();

        let pipeline = TransformPipeline::new(PrefixScrubber::new(), ZipCodec);
        let count = pipeline.transform_all(&mut session).await.unwrap();
        assert_eq!(count, 2);

        let a = session.task(0).unwrap();
        assert_eq!(a.status(), TaskStatus::Ready);
        assert_eq!(&a.payload()[..], b"CLEAN");
        assert_eq!(a.declared_size(), 8);
        let b = session.task(1).unwrap();
        assert_eq!(&b.payload()[..], b"text");

        // A second pass has nothing left to do.
        assert_eq!(pipeline.transform_all(&mut session).await.unwrap(), 0);
    }

    #[test]
    fn base_name_strips_both_separators() {
        assert_eq!(base_name("a/b/c.dcm"), "c.dcm");
        assert_eq!(base_name("a\\b.dcm"), "b.dcm");
        assert_eq!(base_name("plain"), "plain");
    }
}
