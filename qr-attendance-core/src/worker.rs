//! Delivery worker
//!
//! A single consumer that drains the [`IngestQueue`] and ships each record
//! to the [`RemoteSink`]. Every cycle:
//!
//! 1. **Wait** for the next record.
//! 2. **Reingest** the fallback file if the record is new input: every
//!    parsable line goes back on the queue (behind whatever is already
//!    waiting), the file is removed.
//! 3. **Attempt delivery** of the record to its monthly blob.
//! 4. On **success** the record is done; on **failure** its line is appended
//!    to the fallback file, to be retried when the next record arrives.
//! 5. Pause for the configured cycle delay.
//!
//! Delivery failures never stop the worker. Records that came back from the
//! fallback file do not trigger another re-ingest, so during an outage each
//! failed record is retried once per new record instead of bouncing between
//! queue and file. The same rule lets a closed queue drain to completion,
//! leaving whatever still fails in the fallback file for the next run.

use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::error::{Error, Result};
use crate::fallback::FallbackStore;
use crate::queue::{IngestQueue, Origin};
use crate::record::{Record, DEFAULT_BLOB_FILE_NAME};
use crate::sink::RemoteSink;

const THREAD_NAME: &str = "attendance-delivery";

/// Tunables of the delivery loop
#[derive(Debug, Clone)]
pub struct WorkerOptions {
    /// File name of each monthly blob
    pub blob_file_name: String,
    /// Upper bound for one remote append
    pub append_timeout: Duration,
    /// Pause after every attempt, successful or not
    pub cycle_delay: Duration,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            blob_file_name: DEFAULT_BLOB_FILE_NAME.to_string(),
            append_timeout: Duration::from_secs(5),
            cycle_delay: Duration::from_millis(300),
        }
    }
}

/// Counters kept by the worker
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryStats {
    /// Records appended to the remote store
    pub delivered: usize,
    /// Delivery attempts that failed and went to the fallback file
    pub failed: usize,
    /// Records read back from the fallback file
    pub reingested: usize,
    /// Fallback lines that could not be parsed and were dropped
    pub dropped_lines: usize,
    /// Records that failed delivery and could not be written locally either
    pub lost: usize,
}

/// Shared, live view of a worker's [`DeliveryStats`]
#[derive(Debug, Clone, Default)]
pub struct StatsHandle(Arc<Mutex<DeliveryStats>>);

impl StatsHandle {
    pub fn snapshot(&self) -> DeliveryStats {
        *self.lock()
    }

    fn lock(&self) -> MutexGuard<'_, DeliveryStats> {
        self.0.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// What happened to one dequeued record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Appended to the remote store
    Delivered,
    /// Remote append failed, record kept in the fallback file
    Deferred,
    /// Remote append and fallback write both failed
    Lost,
}

/// The consumer side of the pipeline. Owns the sink and the fallback file.
pub struct DeliveryWorker<S> {
    queue: IngestQueue,
    fallback: FallbackStore,
    sink: S,
    options: WorkerOptions,
    stats: StatsHandle,
}

impl<S: RemoteSink> DeliveryWorker<S> {
    pub fn new(queue: IngestQueue, fallback: FallbackStore, sink: S, options: WorkerOptions) -> Self {
        Self {
            queue,
            fallback,
            sink,
            options,
            stats: StatsHandle::default(),
        }
    }

    pub fn stats(&self) -> StatsHandle {
        self.stats.clone()
    }

    /// Run until the queue is closed and empty, returning the final counters
    pub fn run(mut self) -> DeliveryStats {
        tracing::debug!(fallback = %self.fallback.path().display(), "Delivery worker started");

        while let Some(entry) = self.queue.pop() {
            self.process(entry.record, entry.origin);
            self.queue.task_done();
            if !self.options.cycle_delay.is_zero() {
                thread::sleep(self.options.cycle_delay);
            }
        }

        let stats = self.stats.snapshot();
        tracing::info!(
            delivered = stats.delivered,
            failed = stats.failed,
            reingested = stats.reingested,
            dropped_lines = stats.dropped_lines,
            lost = stats.lost,
            "Delivery worker stopped"
        );
        stats
    }

    /// One full cycle for a dequeued record
    pub fn process(&mut self, record: Record, origin: Origin) -> CycleOutcome {
        if origin == Origin::Live {
            self.reingest();
        }

        let blob_name = record.blob_name(&self.options.blob_file_name);
        let line = record.to_line();

        match self
            .sink
            .append(&blob_name, &line, self.options.append_timeout)
        {
            Ok(()) => {
                tracing::debug!(blob = %blob_name, record = %record, "Delivered record");
                self.stats.lock().delivered += 1;
                CycleOutcome::Delivered
            }
            Err(e) => {
                tracing::warn!(
                    blob = %blob_name,
                    record = %record,
                    kind = e.kind(),
                    error = %e,
                    "Delivery failed, will attempt later"
                );
                self.stats.lock().failed += 1;

                match self.fallback.append(&line) {
                    Ok(()) => CycleOutcome::Deferred,
                    Err(e) => {
                        tracing::error!(
                            path = %self.fallback.path().display(),
                            record = %record,
                            error = %e,
                            "Could not write record to fallback file, record lost"
                        );
                        self.stats.lock().lost += 1;
                        CycleOutcome::Lost
                    }
                }
            }
        }
    }

    /// Move every record from the fallback file back onto the queue.
    ///
    /// Returns the number of records re-added.
    fn reingest(&mut self) -> usize {
        let taken = match self.fallback.take_all() {
            Ok(Some(taken)) => taken,
            Ok(None) => return 0,
            Err(e) => {
                tracing::error!(
                    path = %self.fallback.path().display(),
                    error = %e,
                    "Could not read fallback file"
                );
                return 0;
            }
        };

        let mut added = 0;
        let mut dropped = taken.invalid;
        if taken.invalid > 0 {
            tracing::warn!(
                count = taken.invalid,
                "Fallback lines are not valid UTF-8, dropping them"
            );
        }
        for line in taken.lines {
            match Record::parse_line(&line) {
                Ok(record) => {
                    self.queue.requeue(record);
                    added += 1;
                }
                Err(e) => {
                    tracing::warn!(line = %line, error = %e, "Could not parse fallback line, dropping it");
                    dropped += 1;
                }
            }
        }

        {
            let mut stats = self.stats.lock();
            stats.reingested += added;
            stats.dropped_lines += dropped;
        }
        tracing::info!(added, dropped, "Re-added records from previously failed attempts");
        added
    }
}

impl<S: RemoteSink + 'static> DeliveryWorker<S> {
    /// Run the worker on its own named thread
    pub fn spawn(self) -> Result<WorkerHandle> {
        let queue = self.queue.clone();
        let stats = self.stats();
        let thread = thread::Builder::new()
            .name(THREAD_NAME.to_string())
            .spawn(move || self.run())
            .map_err(|e| Error::Worker(format!("failed to spawn delivery worker: {}", e)))?;

        Ok(WorkerHandle {
            thread,
            queue,
            stats,
        })
    }
}

/// Owned handle to a running worker thread
pub struct WorkerHandle {
    thread: JoinHandle<DeliveryStats>,
    queue: IngestQueue,
    stats: StatsHandle,
}

impl WorkerHandle {
    pub fn is_finished(&self) -> bool {
        self.thread.is_finished()
    }

    pub fn stats(&self) -> DeliveryStats {
        self.stats.snapshot()
    }

    /// Close the queue, let the worker drain it, and wait for it to exit
    pub fn stop(self) -> Result<DeliveryStats> {
        self.queue.close();
        self.thread
            .join()
            .map_err(|_| Error::Worker("delivery worker panicked".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::{AppendBlobSink, MemoryBlobService};
    use chrono::NaiveDate;
    use std::fs;
    use std::io::Write;
    use tempfile::TempDir;

    const JUNE_BLOB: &str = "year=2022/month=06/attendance.log";

    fn record(day: u32, hour: u32, text: &str) -> Record {
        let ts = NaiveDate::from_ymd_opt(2022, 6, day)
            .unwrap()
            .and_hms_opt(hour, 0, 0)
            .unwrap();
        Record::new(ts, text)
    }

    fn options() -> WorkerOptions {
        WorkerOptions {
            cycle_delay: Duration::ZERO,
            ..WorkerOptions::default()
        }
    }

    struct Fixture {
        _dir: TempDir,
        queue: IngestQueue,
        fallback: FallbackStore,
        service: MemoryBlobService,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = TempDir::new().unwrap();
            let fallback = FallbackStore::new(dir.path().join("failed_attendance.log"));
            Self {
                _dir: dir,
                queue: IngestQueue::new(),
                fallback,
                service: MemoryBlobService::new(),
            }
        }

        fn worker(&self) -> DeliveryWorker<AppendBlobSink<MemoryBlobService>> {
            let sink = AppendBlobSink::connect(self.service.clone()).unwrap();
            DeliveryWorker::new(self.queue.clone(), self.fallback.clone(), sink, options())
        }
    }

    #[test]
    fn test_delivers_in_order() {
        let fx = Fixture::new();
        for (hour, name) in [(8, "alice"), (9, "bob"), (10, "carol")] {
            fx.queue.push(record(1, hour, name));
        }
        fx.queue.close();

        let stats = fx.worker().run();

        assert_eq!(stats.delivered, 3);
        assert_eq!(
            fx.service.blob(JUNE_BLOB).as_deref(),
            Some("2022-06-01 08:00:00\talice\n2022-06-01 09:00:00\tbob\n2022-06-01 10:00:00\tcarol\n")
        );
        assert!(!fx.fallback.exists());
    }

    #[test]
    fn test_failure_writes_fallback_line() {
        let fx = Fixture::new();
        let mut worker = fx.worker();
        fx.service.set_online(false);

        let outcome = worker.process(record(1, 10, "alice"), Origin::Live);

        assert_eq!(outcome, CycleOutcome::Deferred);
        assert_eq!(
            fs::read_to_string(fx.fallback.path()).unwrap(),
            "2022-06-01 10:00:00\talice\n"
        );
        assert_eq!(worker.stats().snapshot().failed, 1);
    }

    #[test]
    fn test_reingest_appends_behind_waiting_records() {
        let fx = Fixture::new();
        fx.fallback.append(&record(1, 8, "old").to_line()).unwrap();
        fx.queue.push(record(1, 9, "waiting"));
        let mut worker = fx.worker();

        worker.process(record(1, 10, "current"), Origin::Live);

        assert!(!fx.fallback.exists());
        let order: Vec<String> = std::iter::from_fn(|| {
            if fx.queue.is_empty() {
                None
            } else {
                fx.queue.pop().map(|e| e.record.text().to_string())
            }
        })
        .collect();
        assert_eq!(order, vec!["waiting", "old"]);
        assert_eq!(
            fx.service.blob(JUNE_BLOB).as_deref(),
            Some("2022-06-01 10:00:00\tcurrent\n")
        );
    }

    #[test]
    fn test_corrupted_line_is_dropped() {
        let fx = Fixture::new();
        fx.fallback.append(&record(1, 8, "a").to_line()).unwrap();
        fx.fallback.append("not a record\n").unwrap();
        fx.fallback.append(&record(1, 9, "b").to_line()).unwrap();
        let mut worker = fx.worker();

        worker.process(record(1, 10, "c"), Origin::Live);

        let stats = worker.stats().snapshot();
        assert_eq!(stats.reingested, 2);
        assert_eq!(stats.dropped_lines, 1);
        assert_eq!(fx.queue.len(), 2);
        assert!(!fx.fallback.exists());
    }

    #[test]
    fn test_non_utf8_line_is_dropped() {
        let fx = Fixture::new();
        fx.fallback.append(&record(1, 8, "a").to_line()).unwrap();
        let mut raw = fs::OpenOptions::new()
            .append(true)
            .open(fx.fallback.path())
            .unwrap();
        raw.write_all(b"2022-06-01 09:00:00\tcaf\xe9\n").unwrap();
        drop(raw);
        let mut worker = fx.worker();

        worker.process(record(1, 10, "c"), Origin::Live);

        let stats = worker.stats().snapshot();
        assert_eq!(stats.reingested, 1);
        assert_eq!(stats.dropped_lines, 1);
        assert_eq!(fx.queue.pop().unwrap().record.text(), "a");
        assert!(fx.queue.is_empty());
        assert!(!fx.fallback.exists());
    }

    #[test]
    fn test_retry_after_failures_delivers_once() {
        let fx = Fixture::new();
        let mut worker = fx.worker();

        fx.service.set_online(false);
        worker.process(record(1, 8, "alice"), Origin::Live);
        // bob's cycle moved alice back onto the queue before failing itself
        worker.process(record(1, 9, "bob"), Origin::Live);
        assert_eq!(fx.fallback.pending_lines().unwrap(), 1);
        assert_eq!(fx.queue.len(), 1);

        fx.service.set_online(true);
        fx.queue.push(record(1, 10, "carol"));
        fx.queue.close();
        let stats = worker.run();

        let blob = fx.service.blob(JUNE_BLOB).unwrap();
        assert_eq!(blob.matches("alice").count(), 1);
        assert_eq!(blob.matches("bob").count(), 1);
        assert_eq!(blob.matches("carol").count(), 1);
        assert_eq!(stats.failed, 2);
        assert_eq!(stats.delivered, 3);
        assert!(!fx.fallback.exists());
    }

    #[test]
    fn test_drain_terminates_while_offline() {
        let fx = Fixture::new();
        fx.fallback.append(&record(1, 7, "older").to_line()).unwrap();
        for (hour, name) in [(8, "a"), (9, "b"), (10, "c")] {
            fx.queue.push(record(1, hour, name));
        }
        fx.service.set_online(false);
        fx.queue.close();

        let stats = fx.worker().run();

        assert_eq!(stats.delivered, 0);
        assert_eq!(stats.reingested, 3);
        assert_eq!(fx.fallback.pending_lines().unwrap(), 4);
    }

    #[test]
    fn test_fallback_write_failure_counts_lost() {
        let fx = Fixture::new();
        // A directory where the fallback file should be makes writes fail
        fs::create_dir_all(fx.fallback.path()).unwrap();
        let mut worker = fx.worker();
        fx.service.set_online(false);

        assert_eq!(worker.process(record(1, 10, "alice"), Origin::Live), CycleOutcome::Lost);
        assert_eq!(worker.stats().snapshot().lost, 1);
    }

    #[test]
    fn test_requeued_record_does_not_reingest() {
        let fx = Fixture::new();
        fx.fallback.append(&record(1, 7, "older").to_line()).unwrap();
        let mut worker = fx.worker();

        worker.process(record(1, 8, "retry"), Origin::Fallback);

        assert_eq!(fx.fallback.pending_lines().unwrap(), 1);
        assert!(fx.queue.is_empty());
        assert_eq!(worker.stats().snapshot().reingested, 0);
        assert_eq!(fx.service.blob(JUNE_BLOB).as_deref(), Some("2022-06-01 08:00:00\tretry\n"));
    }

    #[test]
    fn test_spawned_worker_stops_after_drain() {
        let fx = Fixture::new();
        let handle = fx.worker().spawn().unwrap();

        fx.queue.push(record(1, 10, "alice"));
        assert!(fx.queue.wait_drained(Duration::from_secs(5)));
        assert_eq!(handle.stats().delivered, 1);

        let stats = handle.stop().unwrap();
        assert_eq!(stats.delivered, 1);
    }
}
