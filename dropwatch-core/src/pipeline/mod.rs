//! Per-file import lifecycle.
//!
//! A stable file is either claimed as firmware, passed through unchanged, or
//! extracted by the backend for its
//! [`ArchiveKind`](crate::archive::ArchiveKind). Archive jobs run as
//! independent tasks; each one owns a scratch directory that is reclaimed on
//! every exit path, and the original archive is only deleted once all of its
//! payload has been placed next to it.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures::StreamExt;
use tempfile::TempDir;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::archive::{ExtractRequest, ExtractionStream, ExtractorBackend, ExtractorRegistry};
use crate::config::ExtractionConfig;
use crate::error::{IngestError, Result};
use crate::event_bus::ImportEventPublisher;
use crate::events::{ExtractionStatus, FirmwareFile, ImportBatch};
use crate::firmware::{FirmwareRegistry, NoFirmware};
use crate::fs_watch::CandidateFilter;
use crate::fs_watch::filter::is_resource_fork;

mod jobs;
pub mod placement;

use jobs::{JobGuard, JobTable};
pub use placement::{PlacementObserver, sort_for_import};

/// Prefix of per-job scratch directories below the scratch root.
pub const SCRATCH_PREFIX: &str = ".dropwatch-";

/// What [`ExtractionPipeline::import_file`] did with a path.
#[derive(Debug)]
pub enum ImportKickoff {
    /// An extraction job was spawned. Awaiting the handle is optional.
    Started(JoinHandle<()>),
    /// A job for the same source is already running; nothing was done.
    AlreadyRunning,
    /// Not an archive; published as a single-file batch.
    PassedThrough,
    /// Claimed by the firmware registry and published on the firmware
    /// stream.
    Firmware,
    /// Excluded or no longer on disk.
    Skipped,
}

/// Builder for [`ExtractionPipeline`].
#[derive(Debug)]
pub struct PipelineBuilder {
    config: ExtractionConfig,
    events: Arc<dyn ImportEventPublisher>,
    registry: ExtractorRegistry,
    firmware: Arc<dyn FirmwareRegistry>,
    filter: Option<CandidateFilter>,
    observer: Option<Arc<dyn PlacementObserver>>,
}

impl PipelineBuilder {
    pub fn registry(mut self, registry: ExtractorRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn firmware(mut self, firmware: Arc<dyn FirmwareRegistry>) -> Self {
        self.firmware = firmware;
        self
    }

    /// Apply the watch layer's allow/deny prefixes again right before import.
    pub fn filter(mut self, filter: CandidateFilter) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn placement_observer(mut self, observer: Arc<dyn PlacementObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn build(self) -> ExtractionPipeline {
        ExtractionPipeline {
            shared: Arc::new(Shared {
                config: self.config,
                events: self.events,
                registry: self.registry,
                firmware: self.firmware,
                filter: self.filter,
                observer: self.observer,
                jobs: Arc::new(JobTable::default()),
            }),
        }
    }
}

/// Orchestrates classification, extraction, placement and reporting.
#[derive(Clone)]
pub struct ExtractionPipeline {
    shared: Arc<Shared>,
}

impl fmt::Debug for ExtractionPipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExtractionPipeline")
            .field("registry", &self.shared.registry)
            .field("active_jobs", &self.shared.jobs.len())
            .finish()
    }
}

struct Shared {
    config: ExtractionConfig,
    events: Arc<dyn ImportEventPublisher>,
    registry: ExtractorRegistry,
    firmware: Arc<dyn FirmwareRegistry>,
    filter: Option<CandidateFilter>,
    observer: Option<Arc<dyn PlacementObserver>>,
    jobs: Arc<JobTable>,
}

impl ExtractionPipeline {
    pub fn builder(config: ExtractionConfig, events: Arc<dyn ImportEventPublisher>) -> PipelineBuilder {
        PipelineBuilder {
            config,
            events,
            registry: ExtractorRegistry::default(),
            firmware: Arc::new(NoFirmware),
            filter: None,
            observer: None,
        }
    }

    pub fn new(config: ExtractionConfig, events: Arc<dyn ImportEventPublisher>) -> Self {
        Self::builder(config, events).build()
    }

    /// Hand one stable file to the pipeline. Returns as soon as the work is
    /// dispatched; must be called from within a Tokio runtime.
    pub fn import_file(&self, path: impl Into<PathBuf>) -> ImportKickoff {
        let path = path.into();
        let shared = &self.shared;

        if is_resource_fork(&path)
            || shared
                .filter
                .as_ref()
                .is_some_and(|filter| filter.is_excluded(&path))
        {
            debug!(path = %path.display(), "excluded from import");
            return ImportKickoff::Skipped;
        }
        if !path.is_file() {
            debug!(path = %path.display(), "gone before import");
            return ImportKickoff::Skipped;
        }

        let is_firmware = path
            .file_name()
            .and_then(|name| name.to_str())
            .is_some_and(|name| shared.firmware.is_known_firmware(name));
        if is_firmware {
            info!(path = %path.display(), "firmware file detected");
            shared.events.publish_firmware(FirmwareFile::new(path));
            return ImportKickoff::Firmware;
        }

        let Some(backend) = shared.registry.backend_for(&path) else {
            debug!(path = %path.display(), "not an archive, passing through");
            shared.events.publish_batch(ImportBatch::pass_through(path));
            return ImportKickoff::PassedThrough;
        };

        let Some(guard) = shared.jobs.try_begin(&path, Arc::clone(&shared.events)) else {
            debug!(path = %path.display(), "extraction already running");
            return ImportKickoff::AlreadyRunning;
        };

        let shared = Arc::clone(shared);
        ImportKickoff::Started(tokio::spawn(async move {
            shared.run_job(guard, backend, path).await;
        }))
    }

    /// Request cooperative cancellation of the job for `source`. Returns
    /// `false` when no such job is running.
    pub fn cancel(&self, source: &Path) -> bool {
        let cancelled = self.shared.jobs.cancel(source);
        if cancelled {
            info!(source = %source.display(), "cancellation requested");
        }
        cancelled
    }

    pub fn cancel_all(&self) {
        self.shared.jobs.cancel_all();
    }

    pub fn is_running(&self, source: &Path) -> bool {
        self.shared.jobs.is_active(source)
    }

    pub fn active_jobs(&self) -> usize {
        self.shared.jobs.len()
    }
}

impl Shared {
    async fn run_job(&self, guard: JobGuard, backend: Arc<dyn ExtractorBackend>, source: PathBuf) {
        let job = guard.id();
        let kind = backend.kind();
        info!(%job, source = %source.display(), %kind, "extraction started");
        self.events.publish_status(ExtractionStatus::Started {
            job,
            source: source.clone(),
            kind,
        });

        match self.extract_and_place(&guard, backend.as_ref(), &source).await {
            Ok(Placement {
                paths,
                source_removed,
            }) => {
                info!(%job, source = %source.display(), files = paths.len(), "extraction completed");
                self.events.publish_status(ExtractionStatus::Completed {
                    job,
                    source: source.clone(),
                    paths: paths.clone(),
                });
                self.events.publish_batch(ImportBatch::extracted(
                    source,
                    kind,
                    paths,
                    source_removed,
                ));
            }
            Err(err) => {
                if matches!(err, IngestError::Cancelled(_)) {
                    warn!(%job, source = %source.display(), "extraction cancelled");
                } else {
                    error!(%job, source = %source.display(), error = %err, "extraction failed");
                }
                self.events.publish_status(ExtractionStatus::Failed {
                    job,
                    source,
                    kind: err.kind(),
                    message: err.to_string(),
                });
            }
        }

        drop(guard);
    }

    async fn extract_and_place(
        &self,
        guard: &JobGuard,
        backend: &dyn ExtractorBackend,
        source: &Path,
    ) -> Result<Placement> {
        let scratch = self.create_scratch().await?;
        debug!(scratch = %scratch.path().display(), "scratch directory created");

        let outcome = self.extract_into(guard, backend, source, &scratch).await;
        let outcome = match outcome {
            Ok(files) => self.place(source, files).await,
            Err(err) => Err(err),
        };

        reclaim(scratch).await;
        outcome
    }

    async fn create_scratch(&self) -> Result<TempDir> {
        let root = self.config.scratch_root();
        tokio::fs::create_dir_all(&root).await?;
        let scratch = tokio::task::spawn_blocking(move || {
            tempfile::Builder::new()
                .prefix(SCRATCH_PREFIX)
                .tempdir_in(&root)
        })
        .await??;
        Ok(scratch)
    }

    async fn extract_into(
        &self,
        guard: &JobGuard,
        backend: &dyn ExtractorBackend,
        source: &Path,
        scratch: &TempDir,
    ) -> Result<Vec<PathBuf>> {
        let cancel = guard.cancel_token();
        let mut request = ExtractRequest::new(source, scratch.path())
            .with_cancel(cancel.clone())
            .with_size_ceiling(
                self.config
                    .ceiling_for(backend.kind(), backend.buffers_whole_archive()),
            );
        request.channel_capacity = self.config.channel_capacity;

        let mut stream = backend.extract(request);
        let mut extracted = Vec::new();
        let mut progress = 0.0f32;

        while let Some(item) = stream.next().await {
            if cancel.is_cancelled() {
                drain(stream).await;
                return Err(IngestError::Cancelled(format!(
                    "cancelled after {} entries",
                    extracted.len()
                )));
            }
            let item = match item {
                Ok(item) => item,
                Err(err) => {
                    drain(stream).await;
                    return Err(err);
                }
            };

            progress = progress.max(item.progress);
            self.events.publish_status(ExtractionStatus::ItemExtracted {
                job: guard.id(),
                source: source.to_path_buf(),
                path: item.path.clone(),
                progress,
            });
            extracted.push(item.path);
        }

        if cancel.is_cancelled() {
            return Err(IngestError::Cancelled(format!(
                "cancelled after {} entries",
                extracted.len()
            )));
        }
        if extracted.is_empty() {
            return Err(IngestError::ExtractionFailed(format!(
                "{} contains no files",
                source.display()
            )));
        }
        Ok(extracted)
    }

    /// Move payload next to the source, then remove the source.
    ///
    /// Once the payload is placed the job has succeeded; a source that cannot
    /// be removed afterwards is reported through
    /// [`ImportBatch::source_removed`] instead of failing the job.
    async fn place(&self, source: &Path, mut files: Vec<PathBuf>) -> Result<Placement> {
        sort_for_import(&mut files);
        let target = source
            .parent()
            .map(Path::to_path_buf)
            .ok_or_else(|| IngestError::Internal(format!("{} has no parent", source.display())))?;

        let placed =
            tokio::task::spawn_blocking(move || placement::place_files(&files, &target)).await??;

        if let Some(observer) = &self.observer {
            let settled: Vec<PathBuf> = placed
                .iter()
                .filter(|path| self.registry.backend_for(path).is_none())
                .cloned()
                .collect();
            observer.placed(&settled);
        }

        let source_removed = match tokio::fs::remove_file(source).await {
            Ok(()) => true,
            Err(err) => {
                warn!(source = %source.display(), error = %err, "could not remove extracted archive");
                false
            }
        };
        Ok(Placement {
            paths: placed,
            source_removed,
        })
    }
}

/// Outcome of a successful job.
struct Placement {
    paths: Vec<PathBuf>,
    source_removed: bool,
}

/// Consume whatever the backend still produces so its worker has finished
/// writing before the scratch directory is removed.
async fn drain(mut stream: ExtractionStream) {
    while stream.next().await.is_some() {}
}

async fn reclaim(scratch: TempDir) {
    let path = scratch.path().to_path_buf();
    match tokio::task::spawn_blocking(move || scratch.close()).await {
        Ok(Ok(())) => debug!(scratch = %path.display(), "scratch directory removed"),
        Ok(Err(err)) => warn!(scratch = %path.display(), error = %err, "scratch cleanup failed"),
        Err(err) => warn!(scratch = %path.display(), error = %err, "scratch cleanup task failed"),
    }
}
