//! Upload sequencer: drives tasks one at a time through the chunked
//! transfer protocol.
//!
//! The sequencer is an explicit loop over the session's current task. Each
//! iteration inspects the task state and performs exactly one protocol step,
//! so completing a file simply lets the loop pick up the next one.

use scrubdrop_protocol::{TaskStatus, TokenGrant, UploadAck, UploadProgress, UploadTokenRequest};
use scrubdrop_transfer::{ChunkReader, DEFAULT_CHUNK_SIZE, SpeedCalculator, UploadSession};
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::UploadError;
use crate::remote::RemoteStore;
use crate::types::{Recovery, UploadEvent, UploadSummary};

/// Sends the tasks of a session in order.
pub struct UploadSequencer {
    chunk_size: usize,
    cancel: CancellationToken,
    speed: SpeedCalculator,
}

impl UploadSequencer {
    /// Creates a sequencer. A `chunk_size` of 0 uses the default.
    pub fn new(chunk_size: usize, cancel: CancellationToken) -> Self {
        Self {
            chunk_size: if chunk_size == 0 {
                DEFAULT_CHUNK_SIZE
            } else {
                chunk_size
            },
            cancel,
            speed: SpeedCalculator::default(),
        }
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Runs until every task completed, a task fails, or the sequencer is
    /// cancelled.
    ///
    /// A failure leaves the task in `ErrorResume` or `ErrorRestart`, emits an
    /// [`UploadEvent::Error`], and returns the error; call [`resume`] or
    /// [`restart`] afterwards.
    ///
    /// [`resume`]: Self::resume
    /// [`restart`]: Self::restart
    pub async fn run(
        &mut self,
        session: &mut UploadSession,
        remote: &dyn RemoteStore,
        events: &UnboundedSender<UploadEvent>,
    ) -> Result<UploadSummary, UploadError> {
        loop {
            self.check_cancelled()?;
            debug_assert!(session.active_count() <= 1);

            let Some(task) = session.current() else {
                return Ok(self.finish(session, events));
            };

            match task.status() {
                TaskStatus::Pending | TaskStatus::Ready | TaskStatus::RequestingToken => {
                    self.acquire(session, remote, events).await?;
                }
                TaskStatus::Sending => self.send_chunks(session, remote, events).await?,
                TaskStatus::ErrorResume => {
                    return Err(UploadError::NeedsRecovery {
                        task: task.name().to_string(),
                        recovery: Recovery::Resume,
                    });
                }
                TaskStatus::ErrorRestart => {
                    return Err(UploadError::NeedsRecovery {
                        task: task.name().to_string(),
                        recovery: Recovery::Restart,
                    });
                }
                status @ (TaskStatus::Transforming | TaskStatus::Complete) => {
                    return Err(UploadError::InvalidTransition(
                        scrubdrop_transfer::TransferError::InvalidTransition {
                            task: task.name().to_string(),
                            from: status,
                            action: "upload",
                        },
                    ));
                }
            }
        }
    }

    /// Continues a task stopped by a chunk failure from its acknowledged
    /// offset.
    pub async fn resume(
        &mut self,
        session: &mut UploadSession,
        remote: &dyn RemoteStore,
        events: &UnboundedSender<UploadEvent>,
    ) -> Result<UploadSummary, UploadError> {
        session.resume()?;
        if let Some(task) = session.current() {
            info!(file = %task.name(), offset = task.sent_offset(), "resuming upload");
        }
        self.run(session, remote, events).await
    }

    /// Starts a task stopped by a token failure over with a fresh token
    /// request.
    pub async fn restart(
        &mut self,
        session: &mut UploadSession,
        remote: &dyn RemoteStore,
        events: &UnboundedSender<UploadEvent>,
    ) -> Result<UploadSummary, UploadError> {
        session.restart()?;
        self.speed.reset();
        if let Some(task) = session.current() {
            info!(file = %task.name(), "restarting upload");
        }
        self.run(session, remote, events).await
    }

    // -----------------------------------------------------------------------
    // Protocol steps
    // -----------------------------------------------------------------------

    /// Obtains an upload token for the current task, or opens the existing
    /// target file when updating in place.
    async fn acquire(
        &mut self,
        session: &mut UploadSession,
        remote: &dyn RemoteStore,
        events: &UnboundedSender<UploadEvent>,
    ) -> Result<(), UploadError> {
        let parent = session.parent().cloned().ok_or(UploadError::NoParent)?;
        let Some(task) = session.current() else {
            return Ok(());
        };
        let name = task.name().to_string();
        let size = task.upload_size();

        let grant = if parent.is_existing_file() {
            debug!(file = %name, target = %parent.id, size, "opening existing file");
            remote.open_existing(&parent.id, size).await
        } else {
            let request = UploadTokenRequest {
                parent_type: parent.parent_type,
                parent_id: parent.id.clone(),
                name: name.clone(),
                size,
                mime_type: task.mime_hint().to_string(),
                extra: session.extra_params().clone(),
            };
            if task.status() != TaskStatus::RequestingToken {
                session.begin_token_request()?;
            }
            debug!(file = %name, size, "requesting upload token");
            remote.request_upload_token(&request).await
        };

        match grant {
            Ok(TokenGrant::Upload(token)) if size == 0 => {
                session.token_failed()?;
                if let Err(e) = remote.abort_upload(&token).await {
                    warn!(upload = %token.upload_id, error = %e, "failed to discard upload");
                }
                let message = format!(
                    "server expects chunks for empty file (upload {})",
                    token.upload_id
                );
                Err(self.fail(session, events, UploadError::Token(message)))
            }
            Ok(TokenGrant::Upload(token)) => {
                debug!(file = %name, upload = %token.upload_id, received = token.received, "token acquired");
                session.token_acquired(token)?;
                let _ = events.send(UploadEvent::Progress(self.snapshot(session)));
                Ok(())
            }
            Ok(TokenGrant::Finished(file)) => {
                debug!(file = %name, remote_id = %file.id, "finalized without chunks");
                self.complete(session, events, file.id)
            }
            Err(e) => {
                session.token_failed()?;
                Err(self.fail(session, events, UploadError::Token(e.to_string())))
            }
        }
    }

    /// Sends chunks of the current task from its acknowledged offset until
    /// the server finalizes the file.
    async fn send_chunks(
        &mut self,
        session: &mut UploadSession,
        remote: &dyn RemoteStore,
        events: &UnboundedSender<UploadEvent>,
    ) -> Result<(), UploadError> {
        let Some(task) = session.current() else {
            return Ok(());
        };
        let name = task.name().to_string();
        let token = task
            .token()
            .cloned()
            .ok_or_else(|| UploadError::Token(format!("no upload token for {name}")))?;
        let mut reader = ChunkReader::new(task.payload().clone(), self.chunk_size);
        reader.seek_to(task.sent_offset());

        loop {
            self.check_cancelled()?;
            let Some(chunk) = reader.next_chunk() else {
                session.chunk_failed()?;
                let message = format!("server did not finalize {name} after all bytes were sent");
                return Err(self.fail(session, events, UploadError::Chunk(message)));
            };
            debug!(file = %name, offset = chunk.offset, len = chunk.len(), "sending chunk");

            let before = chunk.offset;
            let ack = match remote.send_chunk(&token, chunk.offset, chunk.data).await {
                Ok(ack) => ack,
                Err(e) => {
                    session.chunk_failed()?;
                    return Err(self.fail(session, events, UploadError::Chunk(e.to_string())));
                }
            };

            match ack {
                UploadAck::Partial { received } => {
                    if received <= before {
                        session.chunk_failed()?;
                        let message =
                            format!("server made no progress on {name} past offset {before}");
                        return Err(self.fail(session, events, UploadError::Chunk(message)));
                    }
                    if let Err(e) = session.acknowledge(received) {
                        session.chunk_failed()?;
                        return Err(self.fail(session, events, UploadError::Chunk(e.to_string())));
                    }
                    self.speed.add_sample(received.saturating_sub(before));
                    let _ = events.send(UploadEvent::Progress(self.snapshot(session)));
                    reader.seek_to(received);
                }
                UploadAck::Complete { file_id, size } => {
                    self.speed.add_sample(size.saturating_sub(before));
                    return self.complete(session, events, file_id);
                }
            }
        }
    }

    fn complete(
        &mut self,
        session: &mut UploadSession,
        events: &UnboundedSender<UploadEvent>,
        remote_id: String,
    ) -> Result<(), UploadError> {
        let report = session.complete(remote_id)?.report();
        info!(file = %report.name, remote_id = ?report.remote_id, size = report.size, "file uploaded");
        let _ = events.send(UploadEvent::Progress(self.snapshot(session)));
        let _ = events.send(UploadEvent::ItemComplete(report));
        Ok(())
    }

    fn snapshot(&self, session: &UploadSession) -> UploadProgress {
        let mut progress = session.progress(self.speed.bytes_per_second());
        let remaining = progress.overall_total.saturating_sub(progress.overall_sent);
        progress.eta_seconds = self.speed.eta(remaining).map(|d| d.as_secs());
        progress
    }

    fn finish(&self, session: &UploadSession, events: &UnboundedSender<UploadEvent>) -> UploadSummary {
        let summary = UploadSummary {
            files: session.reports(),
            total_size: session.total_declared_size(),
        };
        info!(
            session = %session.id(),
            files = summary.files.len(),
            total_bytes = summary.total_size,
            "upload finished"
        );
        let _ = events.send(UploadEvent::UploadFinished {
            files: summary.files.clone(),
            total_size: summary.total_size,
        });
        summary
    }

    /// Emits the error event for a task that just moved to an error state.
    fn fail(
        &self,
        session: &UploadSession,
        events: &UnboundedSender<UploadEvent>,
        error: UploadError,
    ) -> UploadError {
        let file = session
            .current()
            .map(|t| t.name().to_string())
            .unwrap_or_default();
        let recovery = error.recovery().unwrap_or(Recovery::Restart);
        warn!(file = %file, error = %error, %recovery, "upload step failed");
        let _ = events.send(UploadEvent::Error {
            file,
            message: error.to_string(),
            recovery,
        });
        error
    }

    fn check_cancelled(&self) -> Result<(), UploadError> {
        if self.cancel.is_cancelled() {
            Err(UploadError::Cancelled)
        } else {
            Ok(())
        }
    }
}
