fn main() {
    println!("Run `cargo test -p scenarios` to execute the end-to-end upload scenarios.");
}

#[cfg(test)]
mod tests {
    use std::path::{Path, PathBuf};
    use std::sync::Arc;

    use bytes::Bytes;
    use scrubdrop_pipeline::{ArchiveCodec, ArchiveEntry, TransformEvent, TransformPipeline, ZipCodec};
    use scrubdrop_protocol::{ParentRef, TaskStatus, UploadProgress};
    use scrubdrop_scrub::ScrubberChain;
    use scrubdrop_uploader::{
        ExtraParams, MemoryStore, RemoteCall, SessionConfig, UploadController, UploadError,
        UploadEvent,
    };
    use tokio::sync::mpsc;

    const MB: u64 = 1024 * 1024;
    const IMPLICIT_VR_LE: &[u8] = b"1.2.840.10008.1.2\0";

    // --- Fixtures ---

    fn implicit_element(group: u16, element: u16, value: &[u8]) -> Vec<u8> {
        let mut value = value.to_vec();
        if value.len() % 2 == 1 {
            value.push(b' ');
        }
        let mut out = Vec::new();
        out.extend_from_slice(&group.to_le_bytes());
        out.extend_from_slice(&element.to_le_bytes());
        out.extend_from_slice(&(value.len() as u32).to_le_bytes());
        out.extend_from_slice(&value);
        out
    }

    /// Minimal Part-10 file in implicit VR little endian.
    fn dicom(patient: &str, birth_date: &str) -> Vec<u8> {
        let mut out = vec![0u8; 128];
        out.extend_from_slice(b"DICM");
        // (0002,0010) UI, explicit VR as required for the meta group.
        out.extend_from_slice(&0x0002u16.to_le_bytes());
        out.extend_from_slice(&0x0010u16.to_le_bytes());
        out.extend_from_slice(b"UI");
        out.extend_from_slice(&(IMPLICIT_VR_LE.len() as u16).to_le_bytes());
        out.extend_from_slice(IMPLICIT_VR_LE);

        out.extend(implicit_element(0x0008, 0x0060, b"MR"));
        out.extend(implicit_element(0x0010, 0x0010, patient.as_bytes()));
        out.extend(implicit_element(0x0010, 0x0020, b"PID-001"));
        out.extend(implicit_element(0x0010, 0x0030, birth_date.as_bytes()));
        out.extend(implicit_element(0x0020, 0x000D, b"1.2.3.4.5"));
        out
    }

    fn contains(haystack: &[u8], needle: &[u8]) -> bool {
        haystack.windows(needle.len()).any(|w| w == needle)
    }

    fn write(dir: &Path, name: &str, data: &[u8]) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, data).unwrap();
        path
    }

    fn controller(
        store: &Arc<MemoryStore>,
        chunk_size: usize,
    ) -> (UploadController, mpsc::UnboundedReceiver<UploadEvent>) {
        let mut config = SessionConfig::new(Some(ParentRef::folder("folder-1")));
        config.chunk_size = chunk_size;
        let scrubber = ScrubberChain::from_settings(&["PatientName", "PatientBirthDate"], true)
            .unwrap();
        let mut ctl = UploadController::new(
            config,
            store.clone(),
            TransformPipeline::new(scrubber, ZipCodec),
        );
        let events = ctl.take_events().unwrap();
        (ctl, events)
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<UploadEvent>) -> Vec<UploadEvent> {
        let mut events = Vec::new();
        while let Ok(e) = rx.try_recv() {
            events.push(e);
        }
        events
    }

    fn progress(events: &[UploadEvent]) -> Vec<UploadProgress> {
        events
            .iter()
            .filter_map(|e| match e {
                UploadEvent::Progress(p) => Some(p.clone()),
                _ => None,
            })
            .collect()
    }

    fn chunk_offsets(calls: &[RemoteCall]) -> Vec<u64> {
        calls
            .iter()
            .filter_map(|c| match c {
                RemoteCall::SendChunk { offset, .. } => Some(*offset),
                _ => None,
            })
            .collect()
    }

    // --- Transformation ---

    #[tokio::test]
    async fn unrecognized_file_uploaded_unchanged() {
        let tmp = tempfile::tempdir().unwrap();
        let original = b"plain notes, nothing to scrub here".to_vec();
        let path = write(tmp.path(), "notes.txt", &original);

        let store = Arc::new(MemoryStore::new());
        let (mut ctl, mut rx) = controller(&store, 8);
        ctl.select_paths(&[path]).await.unwrap();
        ctl.start().await.unwrap();

        assert_eq!(store.files()[0].data.as_ref(), original.as_slice());
        let finished = drain(&mut rx).into_iter().find_map(|e| match e {
            UploadEvent::Transform(TransformEvent::Finished { changed, .. }) => Some(changed),
            _ => None,
        });
        assert_eq!(finished, Some(false));
    }

    #[tokio::test]
    async fn dicom_identity_removed_before_upload() {
        let tmp = tempfile::tempdir().unwrap();
        let original = dicom("Doe^Jane", "19800101");
        let path = write(tmp.path(), "scan.dcm", &original);

        let store = Arc::new(MemoryStore::new());
        let (mut ctl, _rx) = controller(&store, 16);
        ctl.select_paths(&[path]).await.unwrap();
        let summary = ctl.start().await.unwrap();

        let stored = &store.files()[0];
        assert_eq!(stored.name, "scan.dcm");
        assert!(!contains(&stored.data, b"Doe^Jane"));
        assert!(!contains(&stored.data, b"19800101"));
        assert!(contains(&stored.data, b"PID-001"));
        assert!(stored.data.len() < original.len());

        // Declared size stays the original; the sent size is the scrubbed one.
        let report = &summary.files[0];
        assert_eq!(report.declared_size, original.len() as u64);
        assert_eq!(report.size, stored.data.len() as u64);
        assert_eq!(summary.total_size, original.len() as u64);
    }

    #[tokio::test]
    async fn archive_entries_scrubbed_individually() {
        let first = dicom("Roe^Richard", "19600505");
        let second = dicom("Poe^Edgar", "18090119");
        let notes = b"study readme".to_vec();
        let archive = ZipCodec
            .encode(
                &[
                    ArchiveEntry::dir("study/"),
                    ArchiveEntry::file("study/a.dcm", first.clone()),
                    ArchiveEntry::file("study/b.dcm", second.clone()),
                    ArchiveEntry::file("study/readme.txt", notes.clone()),
                ],
                &|_, _| {},
            )
            .unwrap();

        let tmp = tempfile::tempdir().unwrap();
        let path = write(tmp.path(), "study.zip", &archive);

        let store = Arc::new(MemoryStore::new());
        let (mut ctl, mut rx) = controller(&store, 64 * 1024);
        ctl.select_paths(&[path]).await.unwrap();
        ctl.start().await.unwrap();

        let uploaded = store.files()[0].data.clone();
        let entries = ZipCodec.decode(&uploaded, &|_| {}).unwrap();
        assert_eq!(entries.len(), 3);
        assert!(entries.iter().all(|e| !e.is_dir));

        let by_name = |name: &str| {
            entries
                .iter()
                .find(|e| e.name == name)
                .map(|e| e.raw.clone())
                .unwrap_or_else(|| panic!("missing entry {name}"))
        };
        assert_ne!(by_name("a.dcm").as_ref(), first.as_slice());
        assert!(!contains(&by_name("a.dcm"), b"Roe^Richard"));
        assert_ne!(by_name("b.dcm").as_ref(), second.as_slice());
        assert_eq!(by_name("readme.txt").as_ref(), notes.as_slice());

        let events = drain(&mut rx);
        assert!(events.iter().any(|e| matches!(
            e,
            UploadEvent::Transform(TransformEvent::Finished { changed: true, .. })
        )));
    }

    #[tokio::test]
    async fn corrupt_archive_uploaded_as_is() {
        let tmp = tempfile::tempdir().unwrap();
        let garbage = b"PK\x03\x04 this is not really a zip".to_vec();
        let path = write(tmp.path(), "broken.zip", &garbage);

        let store = Arc::new(MemoryStore::new());
        let (mut ctl, mut rx) = controller(&store, 1024);
        ctl.select_paths(&[path]).await.unwrap();
        ctl.start().await.unwrap();

        assert_eq!(store.files()[0].data.as_ref(), garbage.as_slice());
        assert!(drain(&mut rx).iter().any(|e| matches!(
            e,
            UploadEvent::Transform(TransformEvent::CodecFailed { .. })
        )));
    }

    // --- Sequencing ---

    #[tokio::test]
    async fn two_files_progress_in_eighths() {
        let tmp = tempfile::tempdir().unwrap();
        let a = write(tmp.path(), "a.bin", &vec![1u8; (5 * MB) as usize]);
        let b = write(tmp.path(), "b.bin", &vec![2u8; (3 * MB) as usize]);

        let store = Arc::new(MemoryStore::new());
        let (mut ctl, mut rx) = controller(&store, MB as usize);
        ctl.select_paths(&[a, b]).await.unwrap();
        let summary = ctl.start().await.unwrap();
        assert_eq!(summary.total_size, 8 * MB);

        let calls = store.calls();
        let tokens = calls
            .iter()
            .filter(|c| matches!(c, RemoteCall::RequestToken { .. }))
            .count();
        assert_eq!(tokens, 2);
        assert_eq!(chunk_offsets(&calls).len(), 8);

        // Chunks of one upload never interleave with another's.
        let mut uploads: Vec<&str> = calls
            .iter()
            .filter_map(|c| match c {
                RemoteCall::SendChunk { upload_id, .. } => Some(upload_id.as_str()),
                _ => None,
            })
            .collect();
        uploads.dedup();
        assert_eq!(uploads.len(), 2);

        let events = drain(&mut rx);
        let snapshots = progress(&events);
        let overall: Vec<u64> = snapshots.iter().map(|p| p.overall_sent).collect();
        assert!(overall.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(overall[0], 0);
        for step in 1..=8 {
            assert!(overall.contains(&(step * MB)), "missing {step}/8 step");
        }
        let last = snapshots.last().unwrap();
        assert_eq!(last.overall_sent, last.overall_total);
        assert!((last.overall_percentage() - 100.0).abs() < f64::EPSILON);

        assert!(matches!(
            events.last(),
            Some(UploadEvent::UploadFinished { total_size, .. }) if *total_size == 8 * MB
        ));
    }

    #[tokio::test]
    async fn zero_byte_file_needs_no_chunks() {
        let tmp = tempfile::tempdir().unwrap();
        let path = write(tmp.path(), "empty.dat", b"");

        let store = Arc::new(MemoryStore::new());
        let (mut ctl, _rx) = controller(&store, 1024);
        ctl.select_paths(&[path]).await.unwrap();
        let summary = ctl.start().await.unwrap();

        assert_eq!(summary.total_size, 0);
        assert_eq!(summary.files[0].status, TaskStatus::Complete);
        assert!(chunk_offsets(&store.calls()).is_empty());
        assert_eq!(store.files()[0].data.len(), 0);
    }

    #[tokio::test]
    async fn resume_continues_from_acknowledged_offset() {
        let tmp = tempfile::tempdir().unwrap();
        let data: Vec<u8> = (0..40u8).collect();
        let path = write(tmp.path(), "series.bin", &data);

        let store = Arc::new(MemoryStore::new());
        store.fail_chunk_at(20);
        let (mut ctl, mut rx) = controller(&store, 10);
        ctl.select_paths(&[path]).await.unwrap();

        let err = ctl.start().await.unwrap_err();
        assert!(matches!(err, UploadError::Chunk(_)));
        assert_eq!(ctl.session().tasks()[0].status(), TaskStatus::ErrorResume);
        assert_eq!(ctl.session().tasks()[0].sent_offset(), 20);

        ctl.resume().await.unwrap();
        assert_eq!(chunk_offsets(&store.calls()), vec![0, 10, 20, 20, 30]);
        assert_eq!(store.files()[0].data.as_ref(), data.as_slice());

        let overall: Vec<u64> = progress(&drain(&mut rx))
            .iter()
            .map(|p| p.overall_sent)
            .collect();
        assert!(overall.windows(2).all(|w| w[0] <= w[1]));
    }

    #[tokio::test]
    async fn close_discards_partial_upload() {
        let tmp = tempfile::tempdir().unwrap();
        let path = write(tmp.path(), "big.bin", &[9u8; 30]);

        let store = Arc::new(MemoryStore::new());
        store.fail_chunk_at(10);
        let (mut ctl, _rx) = controller(&store, 10);
        ctl.select_paths(&[path]).await.unwrap();
        assert!(ctl.start().await.is_err());
        assert_eq!(store.pending_uploads(), 1);

        ctl.close().await;
        assert_eq!(store.pending_uploads(), 0);
        assert!(store.files().is_empty());
        assert!(
            store
                .calls()
                .iter()
                .any(|c| matches!(c, RemoteCall::Abort { .. }))
        );
    }

    #[tokio::test]
    async fn extra_params_reach_every_token_request() {
        let tmp = tempfile::tempdir().unwrap();
        let a = write(tmp.path(), "a.txt", b"alpha");
        let b = write(tmp.path(), "b.txt", b"beta");

        let store = Arc::new(MemoryStore::new());
        let mut config = SessionConfig::new(Some(ParentRef::folder("folder-1")));
        config.extra_params = ExtraParams::lazy(|session| {
            let mut map = serde_json::Map::new();
            map.insert("batchSize".into(), session.len().into());
            map
        });
        let mut ctl = UploadController::new(config, store.clone(), TransformPipeline::default());
        ctl.select_paths(&[a, b]).await.unwrap();
        ctl.start().await.unwrap();

        let extras: Vec<_> = store
            .calls()
            .into_iter()
            .filter_map(|c| match c {
                RemoteCall::RequestToken { extra, .. } => Some(extra),
                _ => None,
            })
            .collect();
        assert_eq!(extras.len(), 2);
        assert!(extras.iter().all(|e| e["batchSize"] == 2));
    }

    // --- Selection ---

    #[tokio::test]
    async fn folder_in_selection_rejects_batch() {
        let tmp = tempfile::tempdir().unwrap();
        let file = write(tmp.path(), "scan.dcm", &dicom("Doe^Jane", "19800101"));
        let folder = tmp.path().join("series");
        std::fs::create_dir(&folder).unwrap();

        let store = Arc::new(MemoryStore::new());
        let (mut ctl, mut rx) = controller(&store, 1024);
        let err = ctl.select_paths(&[file, folder]).await.unwrap_err();

        assert!(matches!(err, UploadError::Validation(_)));
        assert!(ctl.session().is_empty());
        assert!(drain(&mut rx).is_empty());
        assert!(store.calls().is_empty());
    }

    #[tokio::test]
    async fn update_in_place_replaces_contents() {
        let store = Arc::new(MemoryStore::new());
        let existing = store.insert_file("scan.dcm", "item-1", Bytes::from_static(b"old"));

        let tmp = tempfile::tempdir().unwrap();
        let path = write(tmp.path(), "scan-v2.dcm", &dicom("Doe^Jane", "19800101"));

        let mut config = SessionConfig::new(Some(ParentRef::file(existing.clone())));
        config.chunk_size = 32;
        let scrubber = ScrubberChain::from_settings(&["PatientName"], false).unwrap();
        let mut ctl = UploadController::new(
            config,
            store.clone(),
            TransformPipeline::new(scrubber, ZipCodec),
        );
        ctl.select_paths(&[path]).await.unwrap();
        ctl.start().await.unwrap();

        let files = store.files();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].id, existing);
        assert!(!contains(&files[0].data, b"Doe^Jane"));
        assert!(contains(&files[0].data, b"19800101"));
        assert!(matches!(store.calls()[0], RemoteCall::OpenExisting { .. }));
    }
}
