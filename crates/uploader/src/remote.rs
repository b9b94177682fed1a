//! Remote storage trait.
//!
//! `RemoteStore` is implemented by the REST client. Keeping the sequencer
//! behind a trait lets it run against in-memory mocks.

use std::future::Future;
use std::pin::Pin;

use bytes::Bytes;
use scrubdrop_protocol::{TokenGrant, UploadAck, UploadToken, UploadTokenRequest};

use crate::error::UploadError;

/// Boxed future returned by [`RemoteStore`] methods.
pub type RemoteFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, UploadError>> + Send + 'a>>;

/// Abstract upload endpoint.
pub trait RemoteStore: Send + Sync {
    /// Creates an upload target beneath a parent. Zero-length content may be
    /// finalized immediately.
    fn request_upload_token<'a>(
        &'a self,
        request: &'a UploadTokenRequest,
    ) -> RemoteFuture<'a, TokenGrant>;

    /// Starts replacing the contents of an existing file.
    fn open_existing<'a>(&'a self, file_id: &'a str, size: u64) -> RemoteFuture<'a, TokenGrant>;

    /// Sends one chunk at `offset`. The returned acknowledgement carries the
    /// server's authoritative received count.
    fn send_chunk<'a>(
        &'a self,
        token: &'a UploadToken,
        offset: u64,
        data: Bytes,
    ) -> RemoteFuture<'a, UploadAck>;

    /// Asks the server to discard a partial upload.
    fn abort_upload<'a>(&'a self, token: &'a UploadToken) -> RemoteFuture<'a, ()>;
}
