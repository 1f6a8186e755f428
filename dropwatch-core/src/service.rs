use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::archive::ExtractorRegistry;
use crate::config::DropwatchConfig;
use crate::error::Result;
use crate::event_bus::InProcEventBus;
use crate::events::{ExtractionStatus, FirmwareFile, ImportBatch};
use crate::firmware::{FirmwareRegistry, NoFirmware};
use crate::fs_watch::{CandidateFilter, DirectoryMonitor, MonitorHandle, StabilityTracker};
use crate::pipeline::{ExtractionPipeline, ImportKickoff};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Running watch-and-extract service: monitor → tracker → pipeline → bus.
pub struct ImportService {
    bus: Arc<InProcEventBus>,
    pipeline: ExtractionPipeline,
    tracker: StabilityTracker,
    monitor: Option<MonitorHandle>,
    dispatcher: JoinHandle<()>,
    shutdown: CancellationToken,
}

impl fmt::Debug for ImportService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ImportService")
            .field("monitor", &self.monitor)
            .field("pipeline", &self.pipeline)
            .field("bus", &self.bus)
            .finish()
    }
}

impl ImportService {
    /// Start with the built-in backends and no firmware registry.
    pub fn start(config: DropwatchConfig) -> Result<Self> {
        Self::start_with(config, ExtractorRegistry::default(), Arc::new(NoFirmware))
    }

    /// Start watching. Fails synchronously when the directory cannot be
    /// created or subscribed to.
    pub fn start_with(
        config: DropwatchConfig,
        registry: ExtractorRegistry,
        firmware: Arc<dyn FirmwareRegistry>,
    ) -> Result<Self> {
        let bus = Arc::new(InProcEventBus::new());
        let (tracker, ready) = StabilityTracker::spawn(config.stability);

        let monitor = match DirectoryMonitor::start(&config.watch, tracker.clone()) {
            Ok(monitor) => monitor,
            Err(err) => {
                tracker.shutdown();
                return Err(err);
            }
        };

        let pipeline = ExtractionPipeline::builder(config.extraction, bus.clone())
            .registry(registry)
            .firmware(firmware)
            .filter(CandidateFilter::new(monitor.root(), &config.watch))
            .placement_observer(Arc::new(tracker.clone()))
            .build();

        let shutdown = CancellationToken::new();
        let dispatcher = tokio::spawn(dispatch(ready, pipeline.clone(), shutdown.clone()));

        info!(directory = %monitor.root().display(), "import service started");
        Ok(Self {
            bus,
            pipeline,
            tracker,
            monitor: Some(monitor),
            dispatcher,
            shutdown,
        })
    }

    pub fn watched_directory(&self) -> Option<&Path> {
        self.monitor.as_ref().map(MonitorHandle::root)
    }

    pub fn status_updates(&self) -> UnboundedReceiverStream<ExtractionStatus> {
        self.bus.status_updates()
    }

    pub fn completed_batches(&self) -> UnboundedReceiverStream<ImportBatch> {
        self.bus.completed_batches()
    }

    pub fn firmware_files(&self) -> UnboundedReceiverStream<FirmwareFile> {
        self.bus.firmware_files()
    }

    pub fn pipeline(&self) -> &ExtractionPipeline {
        &self.pipeline
    }

    pub fn tracker(&self) -> &StabilityTracker {
        &self.tracker
    }

    /// Import a file outside the watch flow, e.g. a manual retry.
    pub fn import_now(&self, path: impl Into<PathBuf>) -> ImportKickoff {
        self.pipeline.import_file(path)
    }

    pub fn cancel(&self, source: &Path) -> bool {
        self.pipeline.cancel(source)
    }

    /// Stop monitoring, cancel running jobs and wait for them to unwind.
    pub async fn stop(mut self) {
        if let Some(monitor) = self.monitor.take() {
            monitor.stop();
        }
        self.shutdown.cancel();
        self.tracker.shutdown();
        self.pipeline.cancel_all();

        if let Err(err) = (&mut self.dispatcher).await {
            debug!(error = %err, "dispatcher ended abnormally");
        }

        let deadline = Instant::now() + SHUTDOWN_GRACE;
        while self.pipeline.active_jobs() > 0 {
            if Instant::now() >= deadline {
                warn!(
                    remaining = self.pipeline.active_jobs(),
                    "jobs still unwinding at shutdown"
                );
                break;
            }
            time::sleep(Duration::from_millis(20)).await;
        }
        info!("import service stopped");
    }
}

impl Drop for ImportService {
    fn drop(&mut self) {
        self.shutdown.cancel();
        self.tracker.shutdown();
        self.dispatcher.abort();
    }
}

async fn dispatch(
    mut ready: mpsc::UnboundedReceiver<PathBuf>,
    pipeline: ExtractionPipeline,
    shutdown: CancellationToken,
) {
    loop {
        let path = tokio::select! {
            _ = shutdown.cancelled() => break,
            path = ready.recv() => match path {
                Some(path) => path,
                None => break,
            },
        };

        let kickoff = pipeline.import_file(&path);
        debug!(path = %path.display(), ?kickoff, "dispatched");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn start_reports_unusable_directory() {
        let tmp = tempfile::tempdir().unwrap();
        let file = tmp.path().join("file");
        std::fs::write(&file, b"x").unwrap();

        let mut config = DropwatchConfig::default();
        config.watch.directory = file.join("imports");
        assert!(ImportService::start(config).is_err());
    }

    #[tokio::test]
    async fn stop_shuts_everything_down() {
        let tmp = tempfile::tempdir().unwrap();
        let mut config = DropwatchConfig::default();
        config.watch.directory = tmp.path().join("imports");

        let service = ImportService::start(config).unwrap();
        let tracker = service.tracker().clone();
        assert!(service.watched_directory().is_some());

        service.stop().await;
        assert!(!tracker.has_any_tracked().await);
    }
}
