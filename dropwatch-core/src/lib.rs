//! # Dropwatch Core
//!
//! Watch-and-extract import pipeline: files dropped into a watched directory
//! are detected, waited on until their writes finish, extracted when they are
//! archives, and republished to downstream consumers.
//!
//! ## Overview
//!
//! - **Directory monitoring**: OS change notifications trigger a listing of
//!   the import directory (bounded depth, hidden and resource-fork entries
//!   ignored)
//! - **Write stability**: per-file size/mtime polling decides when a copy or
//!   download has finished
//! - **Extraction**: pluggable backends for zip, 7z, tar, bzip2 and gzip
//!   behind one streaming contract
//! - **Events**: status transitions, completed batches and firmware
//!   detections fan out to any number of subscribers
//!
//! ## Architecture
//!
//! - [`fs_watch`]: change subscriptions, [`DirectoryMonitor`],
//!   [`StabilityTracker`]
//! - [`archive`]: [`ArchiveKind`], [`ExtractorBackend`], [`ExtractorRegistry`]
//! - [`pipeline`]: [`ExtractionPipeline`] and result placement
//! - [`event_bus`]: [`InProcEventBus`]
//! - [`service`]: [`ImportService`] wiring everything together
//!
//! ## Examples
//!
//! ```no_run
//! use dropwatch_core::{DropwatchConfig, ImportService};
//! use futures::StreamExt;
//!
//! async fn run() -> dropwatch_core::Result<()> {
//!     let mut config = DropwatchConfig::default();
//!     config.watch.directory = "/srv/imports".into();
//!
//!     let service = ImportService::start(config)?;
//!     let mut batches = service.completed_batches();
//!     while let Some(batch) = batches.next().await {
//!         println!("ready: {:?}", batch.paths);
//!     }
//!     service.stop().await;
//!     Ok(())
//! }
//! ```

pub mod archive;
pub mod config;
pub mod error;
pub mod event_bus;
pub mod events;
pub mod firmware;
pub mod fs_watch;
pub mod pipeline;
pub mod service;

pub use archive::{ArchiveKind, ExtractedItem, ExtractionStream, ExtractorBackend, ExtractorRegistry};
pub use config::{DropwatchConfig, ExtractionConfig, StabilityConfig, WatchConfig};
pub use error::{FailureKind, IngestError, Result};
pub use event_bus::{ImportEventPublisher, InProcEventBus};
pub use events::{ExtractionStatus, FirmwareFile, ImportBatch, JobId};
pub use firmware::{FirmwareRegistry, NoFirmware, StaticFirmwareList};
pub use fs_watch::{DirectoryMonitor, MonitorHandle, StabilityTracker};
pub use pipeline::{ExtractionPipeline, ImportKickoff};
pub use service::ImportService;
