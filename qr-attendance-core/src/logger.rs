//! Producer-facing facade
//!
//! [`AttendanceLogger`] timestamps incoming text, queues it, and owns the
//! delivery worker for its whole lifetime. `log` never blocks and never
//! fails: it only promises the record was accepted for eventual delivery.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::fallback::{FallbackStore, DEFAULT_FALLBACK_FILE};
use crate::queue::IngestQueue;
use crate::record::Record;
use crate::sink::RemoteSink;
use crate::worker::{DeliveryStats, DeliveryWorker, WorkerHandle, WorkerOptions};

/// Where the logger keeps local state and how its worker behaves
#[derive(Debug, Clone)]
pub struct LoggerOptions {
    /// Directory holding the fallback file
    pub working_dir: PathBuf,
    /// Fallback file name inside `working_dir`
    pub fallback_file: String,
    pub worker: WorkerOptions,
}

impl LoggerOptions {
    pub fn new(working_dir: impl Into<PathBuf>) -> Self {
        Self {
            working_dir: working_dir.into(),
            fallback_file: DEFAULT_FALLBACK_FILE.to_string(),
            worker: WorkerOptions::default(),
        }
    }

    /// Options for the per-installation data directory
    pub fn from_config(config: &Config) -> Self {
        Self {
            working_dir: Config::data_dir(),
            fallback_file: config.delivery.fallback_file.clone(),
            worker: WorkerOptions {
                blob_file_name: config.remote.blob_file_name.clone(),
                append_timeout: config.delivery.append_timeout(),
                cycle_delay: config.delivery.cycle_delay(),
            },
        }
    }

    pub fn fallback_path(&self) -> PathBuf {
        self.working_dir.join(&self.fallback_file)
    }
}

/// Accepts attendance entries and ships them in the background
pub struct AttendanceLogger {
    queue: IngestQueue,
    worker: Option<WorkerHandle>,
    working_dir: PathBuf,
    fallback_path: PathBuf,
    reported_dead_worker: AtomicBool,
}

impl AttendanceLogger {
    /// Prepare the working directory and start the delivery worker.
    ///
    /// A fallback file left over from an earlier run is only reported; the
    /// worker picks it up on its first cycle.
    pub fn start<S>(sink: S, options: LoggerOptions) -> Result<Self>
    where
        S: RemoteSink + 'static,
    {
        std::fs::create_dir_all(&options.working_dir)?;

        let fallback_path = options.fallback_path();
        let fallback = FallbackStore::new(&fallback_path);
        if fallback.exists() {
            tracing::warn!(
                path = %fallback_path.display(),
                pending = fallback.pending_lines().unwrap_or(0),
                "Failed attempts exist, they will be retried with the next record"
            );
        }

        let queue = IngestQueue::new();
        let worker = DeliveryWorker::new(queue.clone(), fallback, sink, options.worker).spawn()?;

        tracing::info!(working_dir = %options.working_dir.display(), "Attendance logger started");

        Ok(Self {
            queue,
            worker: Some(worker),
            working_dir: options.working_dir,
            fallback_path,
            reported_dead_worker: AtomicBool::new(false),
        })
    }

    /// Timestamp `text` now and queue it for delivery
    pub fn log(&self, text: impl Into<String>) {
        self.log_record(Record::now(text));
    }

    /// Queue an already built record
    pub fn log_record(&self, record: Record) {
        if !self.worker_running() && !self.reported_dead_worker.swap(true, Ordering::Relaxed) {
            tracing::error!("Delivery worker is not running, queued records will not be delivered");
        }
        tracing::trace!(record = %record, "Queued record");
        self.queue.push(record);
    }

    /// Wait until every queued record has been handled (delivered or moved
    /// to the fallback file). Returns false on timeout.
    pub fn flush(&self, timeout: Duration) -> bool {
        self.queue.wait_drained(timeout)
    }

    /// Live delivery counters
    pub fn stats(&self) -> DeliveryStats {
        self.worker
            .as_ref()
            .map(WorkerHandle::stats)
            .unwrap_or_default()
    }

    /// Records waiting in memory
    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    pub fn worker_running(&self) -> bool {
        self.worker.as_ref().is_some_and(|w| !w.is_finished())
    }

    pub fn working_dir(&self) -> &Path {
        &self.working_dir
    }

    pub fn fallback_path(&self) -> &Path {
        &self.fallback_path
    }

    /// Stop accepting work, drain the queue, and join the worker
    pub fn shutdown(mut self) -> Result<DeliveryStats> {
        let worker = self
            .worker
            .take()
            .ok_or_else(|| Error::Worker("delivery worker already stopped".to_string()))?;
        worker.stop()
    }
}

impl Drop for AttendanceLogger {
    fn drop(&mut self) {
        if let Some(worker) = self.worker.take() {
            if let Err(e) = worker.stop() {
                tracing::error!(error = %e, "Delivery worker did not stop cleanly");
            }
        }
    }
}
