//! Upload sequencing for scrubbed files.
//!
//! This crate implements the upload **business logic**: selecting files,
//! running them through the transformation pipeline, and sending them one
//! at a time through a resumable chunked protocol. It has no transport
//! dependency; the REST client provides a [`RemoteStore`] implementation.
//!
//! # Flow
//!
//! 1. **Select**: validate and read the chosen files
//! 2. **Transform**: scrub every file concurrently
//! 3. **Token**: request an upload target per file, in order
//! 4. **Chunks**: send fixed-size chunks, trusting the server's received count
//! 5. **Recover**: resume after chunk failures, restart after token failures

pub mod controller;
pub mod error;
pub mod memory;
pub mod remote;
pub mod sequencer;
pub mod types;

pub use controller::{UploadController, guess_mime};
pub use error::UploadError;
pub use memory::{MemoryStore, RemoteCall, StoredFile};
pub use remote::{RemoteFuture, RemoteStore};
pub use sequencer::UploadSequencer;
pub use types::{
    DroppedFile, ExtraParams, Recovery, SessionConfig, UploadEvent, UploadSummary,
};
