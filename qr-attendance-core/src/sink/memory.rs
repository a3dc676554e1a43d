//! In-process blob service
//!
//! Behaves like an append-blob container held in memory. Outages can be
//! simulated with [`MemoryBlobService::set_online`] and
//! [`MemoryBlobService::fail_next`].

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crate::error::DeliveryError;

use super::BlobService;

/// Cloneable handle; clones share the same blobs
#[derive(Debug, Clone, Default)]
pub struct MemoryBlobService {
    state: Arc<Mutex<MemoryState>>,
}

#[derive(Debug, Default)]
struct MemoryState {
    blobs: BTreeMap<String, String>,
    offline: bool,
    fail_remaining: usize,
    create_calls: usize,
    append_calls: usize,
}

impl MemoryBlobService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Put a blob in place without counting it as a create call
    pub fn seed_blob(&self, blob_name: &str, content: &str) {
        self.lock()
            .blobs
            .insert(blob_name.to_string(), content.to_string());
    }

    /// While offline every operation fails with `NotConnected`
    pub fn set_online(&self, online: bool) {
        self.lock().offline = !online;
    }

    /// Make the next `count` operations fail with a connection error
    pub fn fail_next(&self, count: usize) {
        self.lock().fail_remaining = count;
    }

    /// Current content of a blob
    pub fn blob(&self, blob_name: &str) -> Option<String> {
        self.lock().blobs.get(blob_name).cloned()
    }

    /// All blobs with their content, ordered by name
    pub fn blobs(&self) -> BTreeMap<String, String> {
        self.lock().blobs.clone()
    }

    pub fn create_calls(&self) -> usize {
        self.lock().create_calls
    }

    pub fn append_calls(&self) -> usize {
        self.lock().append_calls
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl MemoryState {
    fn check_available(&mut self) -> Result<(), DeliveryError> {
        if self.offline {
            return Err(DeliveryError::NotConnected);
        }
        if self.fail_remaining > 0 {
            self.fail_remaining -= 1;
            return Err(DeliveryError::Connection("simulated outage".to_string()));
        }
        Ok(())
    }
}

impl BlobService for MemoryBlobService {
    fn list_blobs(&self) -> Result<Vec<String>, DeliveryError> {
        let mut state = self.lock();
        state.check_available()?;
        Ok(state.blobs.keys().cloned().collect())
    }

    fn create_append_blob(&self, blob_name: &str) -> Result<(), DeliveryError> {
        let mut state = self.lock();
        state.check_available()?;
        state.create_calls += 1;
        state.blobs.entry(blob_name.to_string()).or_default();
        Ok(())
    }

    fn append_block(
        &self,
        blob_name: &str,
        data: &[u8],
        _timeout: Duration,
    ) -> Result<(), DeliveryError> {
        let mut state = self.lock();
        state.check_available()?;
        state.append_calls += 1;
        let blob = state
            .blobs
            .get_mut(blob_name)
            .ok_or_else(|| DeliveryError::Rejected {
                status: 404,
                message: "BlobNotFound".to_string(),
            })?;
        blob.push_str(&String::from_utf8_lossy(data));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_append_requires_existing_blob() {
        let service = MemoryBlobService::new();
        let err = service
            .append_block("missing.log", b"x", Duration::from_secs(1))
            .unwrap_err();
        assert_eq!(
            err,
            DeliveryError::Rejected {
                status: 404,
                message: "BlobNotFound".to_string()
            }
        );
    }

    #[test]
    fn test_fail_next_counts_down() {
        let service = MemoryBlobService::new();
        service.fail_next(2);
        assert!(service.list_blobs().is_err());
        assert!(service.list_blobs().is_err());
        assert!(service.list_blobs().is_ok());
    }

    #[test]
    fn test_offline_reports_not_connected() {
        let service = MemoryBlobService::new();
        service.set_online(false);
        assert_eq!(
            service.create_append_blob("a.log"),
            Err(DeliveryError::NotConnected)
        );
        service.set_online(true);
        assert!(service.create_append_blob("a.log").is_ok());
        assert_eq!(service.blob("a.log").as_deref(), Some(""));
    }
}
