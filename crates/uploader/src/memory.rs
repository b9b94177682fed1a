//! In-memory [`RemoteStore`] used for dry runs and tests.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use bytes::Bytes;
use scrubdrop_protocol::{FileDocument, TokenGrant, UploadAck, UploadToken, UploadTokenRequest};
use serde_json::{Map, Value};

use crate::error::UploadError;
use crate::remote::{RemoteFuture, RemoteStore};

/// A request observed by the store.
#[derive(Debug, Clone, PartialEq)]
pub enum RemoteCall {
    RequestToken {
        name: String,
        size: u64,
        extra: Map<String, Value>,
    },
    OpenExisting {
        file_id: String,
        size: u64,
    },
    SendChunk {
        upload_id: String,
        offset: u64,
        len: u64,
    },
    Abort {
        upload_id: String,
    },
}

/// A finalized file held by the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredFile {
    pub id: String,
    pub name: String,
    pub parent_id: String,
    pub data: Bytes,
}

#[derive(Debug)]
struct PendingUpload {
    name: String,
    parent_id: String,
    size: u64,
    data: Vec<u8>,
    replaces: Option<String>,
}

#[derive(Debug, Default)]
struct State {
    next_id: u64,
    uploads: HashMap<String, PendingUpload>,
    files: HashMap<String, StoredFile>,
    calls: Vec<RemoteCall>,
    failing_tokens: u32,
    failing_offsets: Vec<u64>,
}

impl State {
    fn next_id(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{prefix}-{}", self.next_id)
    }

    fn store_file(&mut self, id: Option<String>, name: String, parent_id: String, data: Bytes) -> FileDocument {
        let id = id.unwrap_or_else(|| self.next_id("file"));
        let doc = FileDocument {
            id: id.clone(),
            name: name.clone(),
            size: data.len() as u64,
            item_id: None,
            mime_type: None,
        };
        self.files.insert(
            id.clone(),
            StoredFile {
                id,
                name,
                parent_id,
                data,
            },
        );
        doc
    }

    fn open_upload(&mut self, upload: PendingUpload) -> UploadToken {
        let id = self.next_id("upload");
        let token = UploadToken {
            upload_id: id.clone(),
            size: upload.size,
            received: 0,
        };
        self.uploads.insert(id, upload);
        token
    }
}

/// Keeps uploaded files in memory. Failures can be injected to exercise
/// resume and restart paths.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Adds a finalized file, returning its id.
    pub fn insert_file(&self, name: &str, parent_id: &str, data: Bytes) -> String {
        let mut state = self.state();
        state
            .store_file(None, name.to_string(), parent_id.to_string(), data)
            .id
    }

    /// Makes the next `n` token requests fail.
    pub fn fail_token_requests(&self, n: u32) {
        self.state().failing_tokens = n;
    }

    /// Makes the next chunk sent at `offset` fail, once.
    pub fn fail_chunk_at(&self, offset: u64) {
        self.state().failing_offsets.push(offset);
    }

    pub fn calls(&self) -> Vec<RemoteCall> {
        self.state().calls.clone()
    }

    pub fn file(&self, id: &str) -> Option<StoredFile> {
        self.state().files.get(id).cloned()
    }

    pub fn files(&self) -> Vec<StoredFile> {
        let mut files: Vec<_> = self.state().files.values().cloned().collect();
        files.sort_by(|a, b| a.id.cmp(&b.id));
        files
    }

    /// Number of uploads started but neither finished nor aborted.
    pub fn pending_uploads(&self) -> usize {
        self.state().uploads.len()
    }

    fn request_token_sync(&self, request: &UploadTokenRequest) -> Result<TokenGrant, UploadError> {
        let mut state = self.state();
        state.calls.push(RemoteCall::RequestToken {
            name: request.name.clone(),
            size: request.size,
            extra: request.extra.clone(),
        });
        if state.failing_tokens > 0 {
            state.failing_tokens -= 1;
            return Err(UploadError::Remote("token request rejected".into()));
        }
        if request.size == 0 {
            let doc = state.store_file(None, request.name.clone(), request.parent_id.clone(), Bytes::new());
            return Ok(TokenGrant::Finished(doc));
        }
        Ok(TokenGrant::Upload(state.open_upload(PendingUpload {
            name: request.name.clone(),
            parent_id: request.parent_id.clone(),
            size: request.size,
            data: Vec::new(),
            replaces: None,
        })))
    }

    fn open_existing_sync(&self, file_id: &str, size: u64) -> Result<TokenGrant, UploadError> {
        let mut state = self.state();
        state.calls.push(RemoteCall::OpenExisting {
            file_id: file_id.to_string(),
            size,
        });
        if state.failing_tokens > 0 {
            state.failing_tokens -= 1;
            return Err(UploadError::Remote("update rejected".into()));
        }
        let existing = state
            .files
            .get(file_id)
            .cloned()
            .ok_or_else(|| UploadError::Remote(format!("no such file: {file_id}")))?;
        if size == 0 {
            let doc = state.store_file(Some(existing.id), existing.name, existing.parent_id, Bytes::new());
            return Ok(TokenGrant::Finished(doc));
        }
        Ok(TokenGrant::Upload(state.open_upload(PendingUpload {
            name: existing.name,
            parent_id: existing.parent_id,
            size,
            data: Vec::new(),
            replaces: Some(existing.id),
        })))
    }

    fn send_chunk_sync(&self, token: &UploadToken, offset: u64, data: &[u8]) -> Result<UploadAck, UploadError> {
        let mut state = self.state();
        state.calls.push(RemoteCall::SendChunk {
            upload_id: token.upload_id.clone(),
            offset,
            len: data.len() as u64,
        });
        if let Some(pos) = state.failing_offsets.iter().position(|o| *o == offset) {
            state.failing_offsets.remove(pos);
            return Err(UploadError::Remote("connection reset".into()));
        }

        let upload = state
            .uploads
            .get_mut(&token.upload_id)
            .ok_or_else(|| UploadError::Remote(format!("no such upload: {}", token.upload_id)))?;
        if offset != upload.data.len() as u64 {
            return Err(UploadError::Remote(format!(
                "offset {offset} does not match received {}",
                upload.data.len()
            )));
        }
        upload.data.extend_from_slice(data);
        let received = upload.data.len() as u64;
        if received < upload.size {
            return Ok(UploadAck::Partial { received });
        }

        let upload = state
            .uploads
            .remove(&token.upload_id)
            .ok_or_else(|| UploadError::Remote(format!("no such upload: {}", token.upload_id)))?;
        let doc = state.store_file(upload.replaces, upload.name, upload.parent_id, Bytes::from(upload.data));
        Ok(UploadAck::Complete {
            file_id: doc.id,
            size: doc.size,
        })
    }

    fn abort_sync(&self, token: &UploadToken) {
        let mut state = self.state();
        state.calls.push(RemoteCall::Abort {
            upload_id: token.upload_id.clone(),
        });
        state.uploads.remove(&token.upload_id);
    }
}

impl RemoteStore for MemoryStore {
    fn request_upload_token<'a>(
        &'a self,
        request: &'a UploadTokenRequest,
    ) -> RemoteFuture<'a, TokenGrant> {
        Box::pin(async move { self.request_token_sync(request) })
    }

    fn open_existing<'a>(&'a self, file_id: &'a str, size: u64) -> RemoteFuture<'a, TokenGrant> {
        Box::pin(async move { self.open_existing_sync(file_id, size) })
    }

    fn send_chunk<'a>(
        &'a self,
        token: &'a UploadToken,
        offset: u64,
        data: Bytes,
    ) -> RemoteFuture<'a, UploadAck> {
        Box::pin(async move { self.send_chunk_sync(token, offset, &data) })
    }

    fn abort_upload<'a>(&'a self, token: &'a UploadToken) -> RemoteFuture<'a, ()> {
        Box::pin(async move {
            self.abort_sync(token);
            Ok(())
        })
    }
}
