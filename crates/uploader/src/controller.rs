//! Upload controller.
//!
//! Owns one [`UploadSession`] from selection to close: validates and reads
//! the selection, transforms every file, then hands the session to the
//! [`UploadSequencer`]. All observable changes are published as
//! [`UploadEvent`]s.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use scrubdrop_pipeline::TransformPipeline;
use scrubdrop_protocol::ParentRef;
use scrubdrop_transfer::{
    DropEntry, FileTask, UploadSession, validate_drop, validate_upload_name,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error::UploadError;
use crate::remote::RemoteStore;
use crate::sequencer::UploadSequencer;
use crate::types::{DroppedFile, SessionConfig, UploadEvent, UploadSummary};

/// Drives one upload session on behalf of a UI.
pub struct UploadController {
    config: SessionConfig,
    remote: Arc<dyn RemoteStore>,
    pipeline: TransformPipeline,
    session: UploadSession,
    sequencer: UploadSequencer,
    events_tx: mpsc::UnboundedSender<UploadEvent>,
    events_rx: Option<mpsc::UnboundedReceiver<UploadEvent>>,
    cancel: CancellationToken,
}

impl UploadController {
    pub fn new(
        config: SessionConfig,
        remote: Arc<dyn RemoteStore>,
        pipeline: TransformPipeline,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        // Transform progress is reported from blocking codec threads.
        let forward = events_tx.clone();
        let pipeline = pipeline.with_callback(Arc::new(move |e| {
            let _ = forward.send(UploadEvent::Transform(e));
        }));

        Self {
            session: UploadSession::new(config.parent.clone()),
            sequencer: UploadSequencer::new(config.chunk_size, cancel.clone()),
            config,
            remote,
            pipeline,
            events_tx,
            events_rx: Some(events_rx),
            cancel,
        }
    }

    /// Takes the event receiver. Can only be called once.
    pub fn take_events(&mut self) -> Option<mpsc::UnboundedReceiver<UploadEvent>> {
        self.events_rx.take()
    }

    /// Returns a token that interrupts the running upload between chunks.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn session(&self) -> &UploadSession {
        &self.session
    }

    /// Sets the upload target. Only allowed before start.
    pub fn set_parent(&mut self, parent: ParentRef) -> Result<(), UploadError> {
        self.session.set_parent(parent.clone())?;
        self.config.parent = Some(parent);
        Ok(())
    }

    /// Selects local files by path. Directories reject the whole batch.
    pub async fn select_paths(&mut self, paths: &[PathBuf]) -> Result<usize, UploadError> {
        let entries: Vec<DropEntry> = paths.iter().map(|p| DropEntry::from_path(p)).collect();
        validate_drop(&entries).map_err(|e| UploadError::Validation(e.to_string()))?;

        let mut tasks = Vec::with_capacity(paths.len());
        for path in self.limit(paths) {
            let name = file_name(path)?;
            let contents = tokio::fs::read(path).await?;
            tasks.push(FileTask::new(
                name.clone(),
                guess_mime(&name),
                Bytes::from(contents),
            ));
        }
        self.replace_selection(tasks)
    }

    /// Selects a drag-and-drop batch. Any entry that is not a plain file
    /// rejects the whole batch.
    pub fn select_dropped(&mut self, dropped: Vec<DroppedFile>) -> Result<usize, UploadError> {
        let entries: Vec<DropEntry> = dropped.iter().map(|d| d.entry.clone()).collect();
        if let Err(e) = validate_drop(&entries) {
            warn!(error = %e, "drop rejected");
            return Err(UploadError::Validation(e.to_string()));
        }

        let mut tasks = Vec::with_capacity(dropped.len());
        for file in self.limit(&dropped) {
            let name = base_name(&file.entry.name).to_string();
            validate_upload_name(&name)?;
            let mime = if file.mime_type.is_empty() {
                guess_mime(&name)
            } else {
                file.mime_type.clone()
            };
            tasks.push(FileTask::new(name, mime, file.contents.clone()));
        }
        self.replace_selection(tasks)
    }

    /// Selects in-memory files.
    pub fn select_files(&mut self, files: Vec<FileTask>) -> Result<usize, UploadError> {
        let files = self.limit(&files).to_vec();
        for file in &files {
            validate_upload_name(file.name())?;
        }
        self.replace_selection(files)
    }

    /// Starts the session: resolves extra parameters, transforms every file,
    /// then uploads them in order.
    pub async fn start(&mut self) -> Result<UploadSummary, UploadError> {
        if self.session.parent().is_none() {
            return Err(UploadError::NoParent);
        }
        let extra = self.config.extra_params.resolve(&self.session);
        self.session.start(extra)?;

        info!(
            session = %self.session.id(),
            files = self.session.len(),
            total_bytes = self.session.total_declared_size(),
            "upload started"
        );
        let _ = self.events_tx.send(UploadEvent::UploadStarted {
            session_id: self.session.id().to_string(),
            total_files: self.session.len(),
            total_size: self.session.total_declared_size(),
        });

        self.pipeline.transform_all(&mut self.session).await?;
        let _ = self
            .events_tx
            .send(UploadEvent::FilesChanged(self.session.reports()));

        self.sequencer
            .run(&mut self.session, self.remote.as_ref(), &self.events_tx)
            .await
    }

    /// Resumes the current task after a chunk failure.
    pub async fn resume(&mut self) -> Result<UploadSummary, UploadError> {
        self.sequencer
            .resume(&mut self.session, self.remote.as_ref(), &self.events_tx)
            .await
    }

    /// Restarts the current task from scratch.
    pub async fn restart(&mut self) -> Result<UploadSummary, UploadError> {
        self.sequencer
            .restart(&mut self.session, self.remote.as_ref(), &self.events_tx)
            .await
    }

    /// Closes the session, asking the server to discard a partially sent
    /// file. Remaining tasks are dropped.
    pub async fn close(&mut self) {
        self.cancel.cancel();
        if let Some(token) = self.session.close() {
            info!(upload = %token.upload_id, "discarding partial upload");
            if let Err(e) = self.remote.abort_upload(&token).await {
                warn!(upload = %token.upload_id, error = %e, "abort failed");
            }
        }
    }

    fn replace_selection(&mut self, tasks: Vec<FileTask>) -> Result<usize, UploadError> {
        self.session.select(tasks)?;
        let _ = self
            .events_tx
            .send(UploadEvent::FilesChanged(self.session.reports()));
        Ok(self.session.len())
    }

    /// Single-file sessions keep only the first selected item.
    fn limit<'a, T>(&self, items: &'a [T]) -> &'a [T] {
        if self.config.multi_file() || items.is_empty() {
            items
        } else {
            &items[..1]
        }
    }
}

fn file_name(path: &Path) -> Result<String, UploadError> {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| UploadError::Validation(format!("not a file: {}", path.display())))?;
    validate_upload_name(&name)?;
    Ok(name)
}

fn base_name(name: &str) -> &str {
    name.rsplit(['/', '\\']).next().unwrap_or(name)
}

/// MIME hint from the file extension; empty when unknown.
pub fn guess_mime(name: &str) -> String {
    let ext = name
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "zip" => "application/zip",
        "dcm" | "dicom" => "application/dicom",
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "txt" => "text/plain",
        "json" => "application/json",
        _ => "",
    }
    .to_string()
}

#[cfg(test)]
mod tests {
    use scrubdrop_pipeline::{TransformEvent, ZipCodec};
    use scrubdrop_protocol::TaskStatus;
    use scrubdrop_scrub::{ScrubOutcome, Scrubber};
    use scrubdrop_transfer::EntryKind;
    use serde_json::{Map, Value};

    use super::*;
    use crate::memory::{MemoryStore, RemoteCall};
    use crate::types::ExtraParams;

    struct Redactor;

    impl Scrubber for Redactor {
        fn name(&self) -> &'static str {
            "redactor"
        }

        fn scrub(&self, data: &[u8]) -> ScrubOutcome {
            if data.starts_with(b"PHI:") {
                ScrubOutcome::Recognized(b"PHI:".to_vec())
            } else {
                ScrubOutcome::Unrecognized
            }
        }
    }

    fn controller(config: SessionConfig) -> (UploadController, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let remote: Arc<dyn RemoteStore> = store.clone();
        let pipeline = TransformPipeline::new(Redactor, ZipCodec);
        (UploadController::new(config, remote, pipeline), store)
    }

    fn dropped(name: &str, kind: EntryKind, contents: &'static [u8]) -> DroppedFile {
        DroppedFile {
            entry: DropEntry::new(name, kind),
            mime_type: String::new(),
            contents: Bytes::from_static(contents),
        }
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<UploadEvent>) -> Vec<UploadEvent> {
        let mut events = Vec::new();
        while let Ok(e) = rx.try_recv() {
            events.push(e);
        }
        events
    }

    #[tokio::test]
    async fn select_transform_and_upload() {
        let (mut ctl, store) = controller(SessionConfig::new(Some(ParentRef::folder("f1"))));
        let mut rx = ctl.take_events().unwrap();
        assert!(ctl.take_events().is_none());

        let count = ctl
            .select_dropped(vec![
                dropped("a.dcm", EntryKind::File, b"PHI:Doe^John"),
                dropped("notes.txt", EntryKind::File, b"hello"),
            ])
            .unwrap();
        assert_eq!(count, 2);

        let summary = ctl.start().await.unwrap();
        assert_eq!(summary.total_size, 12 + 5);
        assert!(summary.files.iter().all(|f| f.status == TaskStatus::Complete));

        let stored = store.files();
        assert_eq!(stored.len(), 2);
        assert_eq!(&stored[0].data[..], b"PHI:");
        assert_eq!(&stored[1].data[..], b"hello");

        let events = drain(&mut rx);
        assert!(matches!(events[0], UploadEvent::FilesChanged(ref f) if f.len() == 2));
        assert!(events.iter().any(|e| matches!(e, UploadEvent::UploadStarted { total_files: 2, .. })));
        assert!(events.iter().any(|e| matches!(
            e,
            UploadEvent::Transform(TransformEvent::Finished { changed: true, .. })
        )));
        assert!(matches!(events.last(), Some(UploadEvent::UploadFinished { .. })));
    }

    #[tokio::test]
    async fn folder_in_drop_rejects_batch() {
        let (mut ctl, store) = controller(SessionConfig::new(Some(ParentRef::folder("f1"))));
        let mut rx = ctl.take_events().unwrap();

        let err = ctl
            .select_dropped(vec![
                dropped("scans", EntryKind::Directory, b""),
                dropped("a.dcm", EntryKind::File, b"PHI:x"),
            ])
            .unwrap_err();
        assert!(matches!(err, UploadError::Validation(_)));
        assert!(err.to_string().starts_with("Only files may be uploaded."));
        assert!(ctl.session().is_empty());
        assert!(drain(&mut rx).is_empty());
        assert!(store.calls().is_empty());
    }

    #[tokio::test]
    async fn select_paths_reads_files() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.zip");
        let b = dir.path().join("b.dcm");
        std::fs::write(&a, b"not a zip").unwrap();
        std::fs::write(&b, b"PHI:secret").unwrap();

        let (mut ctl, _store) = controller(SessionConfig::new(Some(ParentRef::folder("f1"))));
        assert_eq!(ctl.select_paths(&[a, b]).await.unwrap(), 2);
        let tasks = ctl.session().tasks();
        assert_eq!(tasks[0].name(), "a.zip");
        assert_eq!(tasks[0].mime_hint(), "application/zip");
        assert_eq!(tasks[1].declared_size(), 10);

        assert!(matches!(
            ctl.select_paths(&[dir.path().to_path_buf()]).await,
            Err(UploadError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn single_file_mode_keeps_first() {
        let (mut ctl, _store) = controller(SessionConfig::new(Some(ParentRef::file("existing"))));

        let count = ctl
            .select_dropped(vec![
                dropped("first.dcm", EntryKind::File, b"one"),
                dropped("second.dcm", EntryKind::File, b"two"),
            ])
            .unwrap();
        assert_eq!(count, 1);
        assert_eq!(ctl.session().tasks()[0].name(), "first.dcm");
    }

    #[tokio::test]
    async fn start_without_parent_fails() {
        let (mut ctl, _store) = controller(SessionConfig::default());
        ctl.select_dropped(vec![dropped("a", EntryKind::File, b"x")])
            .unwrap();
        assert!(matches!(ctl.start().await, Err(UploadError::NoParent)));

        ctl.set_parent(ParentRef::item("i1")).unwrap();
        ctl.start().await.unwrap();
        assert!(ctl.set_parent(ParentRef::item("i2")).is_err());
    }

    #[tokio::test]
    async fn lazy_extra_params_evaluated_at_start() {
        let mut config = SessionConfig::new(Some(ParentRef::folder("f1")));
        config.extra_params = ExtraParams::lazy(|session| {
            let mut m = Map::new();
            m.insert("files".into(), Value::from(session.len()));
            m
        });
        let (mut ctl, store) = controller(config);
        ctl.select_dropped(vec![
            dropped("a", EntryKind::File, b"x"),
            dropped("b", EntryKind::File, b"y"),
        ])
        .unwrap();
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
        assert!(extras.iter().all(|e| e["files"] == Value::from(2)));
    }

    #[tokio::test]
    async fn close_aborts_partial_upload() {
        let mut config = SessionConfig::new(Some(ParentRef::folder("f1")));
        config.chunk_size = 2;
        let (mut ctl, store) = controller(config);
        store.fail_chunk_at(2);
        ctl.select_dropped(vec![
            dropped("a", EntryKind::File, b"abcdef"),
            dropped("b", EntryKind::File, b"later"),
        ])
        .unwrap();

        let err = ctl.start().await.unwrap_err();
        assert!(matches!(err, UploadError::Chunk(_)));
        assert_eq!(store.pending_uploads(), 1);

        ctl.close().await;
        assert!(ctl.session().is_closed());
        assert_eq!(store.pending_uploads(), 0);
        assert!(matches!(
            store.calls().last(),
            Some(RemoteCall::Abort { .. })
        ));
        // The second file never reached the server.
        assert_eq!(
            store
                .calls()
                .iter()
                .filter(|c| matches!(c, RemoteCall::RequestToken { .. }))
                .count(),
            1
        );
        assert!(matches!(ctl.resume().await, Err(UploadError::Cancelled)));
    }

    #[test]
    fn mime_guessing() {
        assert_eq!(guess_mime("A.ZIP"), "application/zip");
        assert_eq!(guess_mime("scan.dcm"), "application/dicom");
        assert_eq!(guess_mime("noext"), "");
    }
}
