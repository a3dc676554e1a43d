//! # qr-attendance-core
//!
//! Core library for the QR attendance logger: buffers scanned entries and
//! ships them to a remote append-only log, one blob per month.
//!
//! This library provides:
//! - The [`AttendanceLogger`] facade producers call
//! - An in-memory ingest queue and a single delivery worker
//! - A local fallback file for entries the remote store did not accept
//! - Remote sinks over Azure append blobs (or an in-memory store)
//! - Configuration management and logging infrastructure
//!
//! ## Data flow
//!
//! `log(text)` → [`IngestQueue`] → [`DeliveryWorker`] → remote append, or
//! the [`FallbackStore`] on failure. The fallback file is read back into the
//! queue at the start of the next cycle, so failed entries are retried
//! whenever a new entry arrives.
//!
//! ## Example
//!
//! ```rust,no_run
//! use qr_attendance_core::sink::{AppendBlobSink, AzureBlobService};
//! use qr_attendance_core::{AttendanceLogger, Config, LoggerOptions};
//!
//! let config = Config::load().expect("failed to load config");
//! let credentials = config.remote.credentials().expect("missing credentials");
//! let service = AzureBlobService::new(
//!     &credentials,
//!     &config.remote,
//!     config.delivery.append_timeout(),
//! )
//! .expect("invalid remote settings");
//! let sink = AppendBlobSink::connect(service).expect("failed to connect");
//!
//! let logger = AttendanceLogger::start(sink, LoggerOptions::from_config(&config))
//!     .expect("failed to start logger");
//! logger.log("student-42");
//! logger.shutdown().expect("worker failed");
//! ```

// Re-export commonly used items at the crate root
pub use config::Config;
pub use error::{DeliveryError, Error, Result};
pub use fallback::FallbackStore;
pub use logger::{AttendanceLogger, LoggerOptions};
pub use queue::IngestQueue;
pub use record::Record;
pub use worker::{DeliveryStats, DeliveryWorker, WorkerOptions};

// Public modules
pub mod config;
pub mod error;
pub mod fallback;
pub mod logger;
pub mod logging;
pub mod queue;
pub mod record;
pub mod sink;
pub mod worker;
