//! Remote append-only log store
//!
//! The delivery worker only sees [`RemoteSink`]: create a blob if it is
//! missing, append text to it within a timeout. [`AppendBlobSink`] provides
//! that on top of any [`BlobService`] and remembers which blobs already
//! exist so each monthly log is created at most once per process.
//!
//! Implementations:
//! - [`AzureBlobService`]: Azure Blob Storage append blobs over REST
//! - [`MemoryBlobService`]: in-process store for tests and dry runs

mod azure;
mod credentials;
mod memory;

pub use azure::AzureBlobService;
pub use credentials::{Auth, Credentials, StorageAccount};
pub use memory::MemoryBlobService;

use std::collections::HashSet;
use std::time::Duration;

use crate::error::{DeliveryError, Error, Result};

/// What the delivery worker needs from the remote store.
pub trait RemoteSink: Send {
    /// Create `blob_name` unless it already exists. Idempotent.
    fn ensure_exists(&mut self, blob_name: &str) -> std::result::Result<(), DeliveryError>;

    /// Append `text` to `blob_name`, creating the blob first if needed.
    fn append(
        &mut self,
        blob_name: &str,
        text: &str,
        timeout: Duration,
    ) -> std::result::Result<(), DeliveryError>;
}

impl<T: RemoteSink + ?Sized> RemoteSink for Box<T> {
    fn ensure_exists(&mut self, blob_name: &str) -> std::result::Result<(), DeliveryError> {
        (**self).ensure_exists(blob_name)
    }

    fn append(
        &mut self,
        blob_name: &str,
        text: &str,
        timeout: Duration,
    ) -> std::result::Result<(), DeliveryError> {
        (**self).append(blob_name, text, timeout)
    }
}

/// Raw blob operations of a container.
pub trait BlobService: Send {
    /// Names of every blob currently in the container
    fn list_blobs(&self) -> std::result::Result<Vec<String>, DeliveryError>;

    /// Create an empty append blob. Succeeds if it already exists.
    fn create_append_blob(&self, blob_name: &str) -> std::result::Result<(), DeliveryError>;

    /// Append one block to an existing append blob
    fn append_block(
        &self,
        blob_name: &str,
        data: &[u8],
        timeout: Duration,
    ) -> std::result::Result<(), DeliveryError>;
}

/// [`RemoteSink`] over a [`BlobService`] that tracks known blob names
pub struct AppendBlobSink<S> {
    service: S,
    known: HashSet<String>,
}

impl<S: BlobService> AppendBlobSink<S> {
    /// Connect eagerly: list the container once to learn which blobs exist.
    ///
    /// A listing failure means the store is unreachable or the credentials
    /// are wrong, and is returned as [`Error::Connection`].
    pub fn connect(service: S) -> Result<Self> {
        let existing = service
            .list_blobs()
            .map_err(|e| Error::Connection(format!("failed to list blobs: {}", e)))?;

        tracing::info!(existing = existing.len(), "Connected to blob store");

        Ok(Self {
            service,
            known: existing.into_iter().collect(),
        })
    }

    /// Whether `blob_name` is known to exist
    pub fn is_known(&self, blob_name: &str) -> bool {
        self.known.contains(blob_name)
    }
}

impl<S: BlobService> RemoteSink for AppendBlobSink<S> {
    fn ensure_exists(&mut self, blob_name: &str) -> std::result::Result<(), DeliveryError> {
        if self.known.contains(blob_name) {
            return Ok(());
        }
        self.service.create_append_blob(blob_name)?;
        tracing::info!(blob = %blob_name, "Created append blob");
        self.known.insert(blob_name.to_string());
        Ok(())
    }

    fn append(
        &mut self,
        blob_name: &str,
        text: &str,
        timeout: Duration,
    ) -> std::result::Result<(), DeliveryError> {
        self.ensure_exists(blob_name)?;
        self.service.append_block(blob_name, text.as_bytes(), timeout)
    }
}
