use bytes::Bytes;
use scrubdrop_protocol::{FileReport, ParentRef, TaskStatus, UploadProgress, UploadToken};
use serde_json::{Map, Value};
use tracing::debug;

use crate::TransferError;
use crate::chunked::checksum_bytes;

/// One selected file moving through transformation and upload.
#[derive(Debug, Clone)]
pub struct FileTask {
    name: String,
    declared_size: u64,
    mime_hint: String,
    payload: Bytes,
    transformed: bool,
    status: TaskStatus,
    sent_offset: u64,
    remote_id: Option<String>,
    token: Option<UploadToken>,
    sha256: Option<String>,
}

impl FileTask {
    /// Creates a pending task. The declared size is fixed to the length of
    /// the original contents.
    pub fn new(name: impl Into<String>, mime_hint: impl Into<String>, payload: Bytes) -> Self {
        Self {
            name: name.into(),
            declared_size: payload.len() as u64,
            mime_hint: mime_hint.into(),
            payload,
            transformed: false,
            status: TaskStatus::Pending,
            sent_offset: 0,
            remote_id: None,
            token: None,
            sha256: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn declared_size(&self) -> u64 {
        self.declared_size
    }

    pub fn mime_hint(&self) -> &str {
        &self.mime_hint
    }

    /// The bytes that will be (or were) sent.
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Length of the payload as sent, which differs from the declared size
    /// once scrubbing rewrote the contents.
    pub fn upload_size(&self) -> u64 {
        self.payload.len() as u64
    }

    pub fn is_transformed(&self) -> bool {
        self.transformed
    }

    pub fn status(&self) -> TaskStatus {
        self.status
    }

    pub fn sent_offset(&self) -> u64 {
        self.sent_offset
    }

    pub fn remote_id(&self) -> Option<&str> {
        self.remote_id.as_deref()
    }

    pub fn token(&self) -> Option<&UploadToken> {
        self.token.as_ref()
    }

    pub fn sha256(&self) -> Option<&str> {
        self.sha256.as_deref()
    }

    /// Per-task progress as a percentage (0-100).
    pub fn percentage(&self) -> f64 {
        match (self.status, self.upload_size()) {
            (TaskStatus::Complete, _) => 100.0,
            (_, 0) => 0.0,
            (_, size) => self.sent_offset as f64 / size as f64 * 100.0,
        }
    }

    /// Acknowledged bytes expressed in declared-size units, so the session
    /// total reaches exactly the declared sum at completion.
    fn declared_progress(&self) -> u64 {
        let size = self.upload_size();
        if size == 0 {
            return 0;
        }
        (self.sent_offset as u128 * self.declared_size as u128 / size as u128) as u64
    }

    pub fn report(&self) -> FileReport {
        FileReport {
            name: self.name.clone(),
            declared_size: self.declared_size,
            size: self.upload_size(),
            mime_type: self.mime_hint.clone(),
            status: self.status,
            remote_id: self.remote_id.clone(),
            sha256: self.sha256.clone(),
        }
    }

    fn invalid(&self, action: &'static str) -> TransferError {
        TransferError::InvalidTransition {
            task: self.name.clone(),
            from: self.status,
            action,
        }
    }

    fn require(&self, allowed: &[TaskStatus], action: &'static str) -> Result<(), TransferError> {
        if allowed.contains(&self.status) {
            Ok(())
        } else {
            Err(self.invalid(action))
        }
    }
}

/// The aggregate record for one upload operation.
///
/// Tasks are ordered by selection and fixed once the session starts. The
/// upload-side transitions only ever touch the task at `current_index`.
#[derive(Debug, Clone)]
pub struct UploadSession {
    id: String,
    parent: Option<ParentRef>,
    tasks: Vec<FileTask>,
    current_index: usize,
    total_declared_size: u64,
    completed_declared: u64,
    extra_params: Map<String, Value>,
    started: bool,
    closed: bool,
}

impl UploadSession {
    /// Creates an empty session. The parent may be unknown until start.
    pub fn new(parent: Option<ParentRef>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            parent,
            tasks: Vec::new(),
            current_index: 0,
            total_declared_size: 0,
            completed_declared: 0,
            extra_params: Map::new(),
            started: false,
            closed: false,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn parent(&self) -> Option<&ParentRef> {
        self.parent.as_ref()
    }

    /// Sets the upload target. Only allowed before start.
    pub fn set_parent(&mut self, parent: ParentRef) -> Result<(), TransferError> {
        self.ensure_not_started()?;
        self.parent = Some(parent);
        Ok(())
    }

    /// Replaces the current selection. Only allowed before start.
    pub fn select(&mut self, tasks: Vec<FileTask>) -> Result<(), TransferError> {
        self.ensure_not_started()?;
        self.total_declared_size = tasks.iter().map(FileTask::declared_size).sum();
        self.tasks = tasks;
        Ok(())
    }

    /// Appends a task to the selection. Only allowed before start.
    pub fn push_task(&mut self, task: FileTask) -> Result<(), TransferError> {
        self.ensure_not_started()?;
        self.total_declared_size += task.declared_size();
        self.tasks.push(task);
        Ok(())
    }

    /// Freezes the task list and records the session-scoped parameters.
    pub fn start(&mut self, extra_params: Map<String, Value>) -> Result<(), TransferError> {
        self.ensure_not_started()?;
        self.started = true;
        self.current_index = 0;
        self.extra_params = extra_params;
        debug!(
            session = %self.id,
            files = self.tasks.len(),
            total_bytes = self.total_declared_size,
            "session started"
        );
        Ok(())
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    /// Returns `true` once every task completed.
    pub fn is_finished(&self) -> bool {
        self.started && self.current_index >= self.tasks.len()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn tasks(&self) -> &[FileTask] {
        &self.tasks
    }

    pub fn task(&self, index: usize) -> Option<&FileTask> {
        self.tasks.get(index)
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn extra_params(&self) -> &Map<String, Value> {
        &self.extra_params
    }

    pub fn current_index(&self) -> usize {
        self.current_index
    }

    /// The task currently sequencing, if any remain.
    pub fn current(&self) -> Option<&FileTask> {
        self.tasks.get(self.current_index)
    }

    pub fn total_declared_size(&self) -> u64 {
        self.total_declared_size
    }

    /// Completed tasks' declared sizes plus the in-flight task's
    /// acknowledged bytes.
    pub fn overall_bytes_sent(&self) -> u64 {
        let in_flight = self
            .current()
            .filter(|t| t.status != TaskStatus::Complete)
            .map(FileTask::declared_progress)
            .unwrap_or(0);
        self.completed_declared + in_flight
    }

    /// Number of tasks holding the transfer slot. Never more than one.
    pub fn active_count(&self) -> usize {
        self.tasks.iter().filter(|t| t.status.is_active()).count()
    }

    /// Builds a progress snapshot.
    pub fn progress(&self, bytes_per_second: f64) -> UploadProgress {
        let (current_file, current_sent, current_total) = match self.current() {
            Some(t) => (t.name.clone(), t.sent_offset, t.upload_size()),
            None => (String::new(), 0, 0),
        };
        UploadProgress {
            session_id: self.id.clone(),
            current_index: self.current_index,
            total_files: self.tasks.len(),
            current_file,
            current_sent,
            current_total,
            overall_sent: self.overall_bytes_sent(),
            overall_total: self.total_declared_size,
            bytes_per_second,
            eta_seconds: None,
        }
    }

    pub fn reports(&self) -> Vec<FileReport> {
        self.tasks.iter().map(FileTask::report).collect()
    }

    // -----------------------------------------------------------------------
    // Transformation transitions
    // -----------------------------------------------------------------------

    /// Marks a task as transforming and hands out its original bytes.
    pub fn begin_transform(&mut self, index: usize) -> Result<Bytes, TransferError> {
        let task = self.task_mut(index)?;
        task.require(&[TaskStatus::Pending], "transform")?;
        task.status = TaskStatus::Transforming;
        Ok(task.payload.clone())
    }

    /// Installs the transformed payload. The original is dropped.
    pub fn finish_transform(&mut self, index: usize, payload: Bytes) -> Result<(), TransferError> {
        let task = self.task_mut(index)?;
        task.require(&[TaskStatus::Transforming], "finish transform")?;
        task.sha256 = Some(checksum_bytes(&payload));
        task.payload = payload;
        task.transformed = true;
        task.status = TaskStatus::Ready;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Upload transitions (current task only)
    // -----------------------------------------------------------------------

    /// `Pending | Ready -> RequestingToken`.
    pub fn begin_token_request(&mut self) -> Result<(), TransferError> {
        self.ensure_slot_free()?;
        let task = self.current_mut("request token")?;
        task.require(&[TaskStatus::Pending, TaskStatus::Ready], "request token")?;
        task.status = TaskStatus::RequestingToken;
        Ok(())
    }

    /// `RequestingToken -> Sending`, or `Pending | Ready -> Sending` when the
    /// target is an existing file and no creation step happens.
    pub fn token_acquired(&mut self, token: UploadToken) -> Result<(), TransferError> {
        self.ensure_slot_free()?;
        let task = self.current_mut("accept token")?;
        task.require(
            &[
                TaskStatus::RequestingToken,
                TaskStatus::Pending,
                TaskStatus::Ready,
            ],
            "accept token",
        )?;
        let size = task.upload_size();
        if token.received > size {
            return Err(TransferError::BadAck {
                received: token.received,
                sent: 0,
                size,
            });
        }
        task.sent_offset = token.received;
        task.token = Some(token);
        task.status = TaskStatus::Sending;
        Ok(())
    }

    /// `RequestingToken -> ErrorRestart`.
    pub fn token_failed(&mut self) -> Result<(), TransferError> {
        let task = self.current_mut("fail token")?;
        task.require(
            &[
                TaskStatus::RequestingToken,
                TaskStatus::Pending,
                TaskStatus::Ready,
            ],
            "fail token",
        )?;
        task.status = TaskStatus::ErrorRestart;
        Ok(())
    }

    /// Records the server's authoritative received count.
    pub fn acknowledge(&mut self, received: u64) -> Result<(), TransferError> {
        let task = self.current_mut("acknowledge")?;
        task.require(&[TaskStatus::Sending], "acknowledge")?;
        let size = task.upload_size();
        if received < task.sent_offset || received > size {
            return Err(TransferError::BadAck {
                received,
                sent: task.sent_offset,
                size,
            });
        }
        task.sent_offset = received;
        Ok(())
    }

    /// `Sending -> ErrorResume`. The acknowledged offset is kept.
    pub fn chunk_failed(&mut self) -> Result<(), TransferError> {
        let task = self.current_mut("fail chunk")?;
        task.require(&[TaskStatus::Sending], "fail chunk")?;
        task.status = TaskStatus::ErrorResume;
        Ok(())
    }

    /// `ErrorResume -> Sending`.
    pub fn resume(&mut self) -> Result<(), TransferError> {
        let task = self.current_mut("resume")?;
        task.require(&[TaskStatus::ErrorResume], "resume")?;
        task.status = TaskStatus::Sending;
        Ok(())
    }

    /// `ErrorRestart -> RequestingToken`. A task parked in `ErrorResume`
    /// keeps its acknowledged bytes and can only be resumed, so overall
    /// progress never moves backwards.
    pub fn restart(&mut self) -> Result<(), TransferError> {
        let task = self.current_mut("restart")?;
        task.require(&[TaskStatus::ErrorRestart], "restart")?;
        task.sent_offset = 0;
        task.token = None;
        task.status = TaskStatus::RequestingToken;
        Ok(())
    }

    /// Marks the current task complete and advances to the next one.
    ///
    /// `Pending | Ready` are accepted for an existing target the server
    /// reports as already finalized.
    pub fn complete(&mut self, remote_id: impl Into<String>) -> Result<&FileTask, TransferError> {
        let task = self.current_mut("complete")?;
        task.require(
            &[
                TaskStatus::RequestingToken,
                TaskStatus::Sending,
                TaskStatus::Pending,
                TaskStatus::Ready,
            ],
            "complete",
        )?;
        task.sent_offset = task.upload_size();
        task.remote_id = Some(remote_id.into());
        task.token = None;
        task.status = TaskStatus::Complete;
        let declared = task.declared_size;

        self.completed_declared += declared;
        let index = self.current_index;
        self.current_index += 1;
        Ok(&self.tasks[index])
    }

    /// Closes the session. Returns the live token of a partially sent task
    /// so the caller can ask the server to discard it. Tasks not yet
    /// reached need no cleanup.
    pub fn close(&mut self) -> Option<UploadToken> {
        self.closed = true;
        let index = self.current_index;
        let task = self.tasks.get_mut(index)?;
        match task.status {
            TaskStatus::Sending | TaskStatus::ErrorResume | TaskStatus::ErrorRestart => {
                task.token.take()
            }
            _ => None,
        }
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    fn ensure_not_started(&self) -> Result<(), TransferError> {
        if self.started {
            Err(TransferError::SessionStarted)
        } else {
            Ok(())
        }
    }

    fn ensure_slot_free(&self) -> Result<(), TransferError> {
        match self
            .tasks
            .iter()
            .enumerate()
            .find(|(i, t)| *i != self.current_index && t.status.is_active())
        {
            Some((_, busy)) => Err(TransferError::SlotBusy(busy.name.clone())),
            None => Ok(()),
        }
    }

    fn task_mut(&mut self, index: usize) -> Result<&mut FileTask, TransferError> {
        self.tasks
            .get_mut(index)
            .ok_or(TransferError::NoSuchTask(index))
    }

    fn current_mut(&mut self, action: &'static str) -> Result<&mut FileTask, TransferError> {
        let index = self.current_index;
        if !self.started {
            return Err(TransferError::InvalidTransition {
                task: self
                    .tasks
                    .get(index)
                    .map(|t| t.name.clone())
                    .unwrap_or_default(),
                from: TaskStatus::Pending,
                action,
            });
        }
        self.task_mut(index)
    }
}
