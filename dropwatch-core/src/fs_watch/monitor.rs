use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use super::filter::{CandidateFilter, is_hidden, is_resource_fork};
use super::{ChangeSignal, ChangeSubscription, StabilityTracker};
use crate::config::WatchConfig;
use crate::error::Result;

/// Lists the import directory whenever the OS reports a change below it and
/// hands every candidate to the [`StabilityTracker`].
#[derive(Debug)]
pub struct DirectoryMonitor;

impl DirectoryMonitor {
    /// Create the directory if needed, subscribe to it and run an initial
    /// scan. Subscription failures are returned here, never swallowed.
    pub fn start(config: &WatchConfig, tracker: StabilityTracker) -> Result<MonitorHandle> {
        std::fs::create_dir_all(&config.directory)?;
        let root = config.directory.canonicalize()?;
        let filter = CandidateFilter::new(root.clone(), config);

        // Capacity 1: bursts of OS events collapse into a single rescan.
        let (signal_tx, signal_rx) = mpsc::channel::<()>(1);
        let subscription = ChangeSubscription::open(&root, config.recursive, move |signal| {
            match signal {
                ChangeSignal::Changed(_) => {
                    let _ = signal_tx.try_send(());
                }
                ChangeSignal::Error(message) => {
                    warn!(error = %message, "watch backend reported an error");
                }
            }
        })?;

        let cancel = CancellationToken::new();
        let task = tokio::spawn(run_monitor(
            filter,
            tracker,
            signal_rx,
            config.reconcile_interval(),
            cancel.clone(),
        ));

        info!(
            directory = %root.display(),
            recursive = config.recursive,
            "directory monitor started"
        );

        Ok(MonitorHandle {
            root,
            cancel,
            task,
            subscription: Some(subscription),
        })
    }
}

/// Running monitor. Dropping it stops monitoring.
pub struct MonitorHandle {
    root: PathBuf,
    cancel: CancellationToken,
    task: JoinHandle<()>,
    subscription: Option<ChangeSubscription>,
}

impl fmt::Debug for MonitorHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MonitorHandle")
            .field("root", &self.root)
            .field("running", &!self.task.is_finished())
            .finish()
    }
}

impl MonitorHandle {
    /// Canonical path of the watched directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }

    pub fn stop(mut self) {
        if let Some(subscription) = self.subscription.take() {
            subscription.cancel();
        }
        self.cancel.cancel();
        info!(directory = %self.root.display(), "directory monitor stopped");
    }
}

impl Drop for MonitorHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
        self.task.abort();
    }
}

async fn run_monitor(
    filter: CandidateFilter,
    tracker: StabilityTracker,
    mut signals: mpsc::Receiver<()>,
    reconcile_every: Duration,
    cancel: CancellationToken,
) {
    scan(&filter, &tracker).await;

    let mut reconcile = time::interval_at(Instant::now() + reconcile_every, reconcile_every);
    reconcile.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            signal = signals.recv() => {
                if signal.is_none() {
                    break;
                }
                scan(&filter, &tracker).await;
            }
            _ = reconcile.tick() => tracker.reconcile(),
        }
    }

    debug!(directory = %filter.root().display(), "monitor loop exited");
}

async fn scan(filter: &CandidateFilter, tracker: &StabilityTracker) {
    let snapshot = filter.clone();
    let listed = tokio::task::spawn_blocking(move || list_candidates(&snapshot)).await;

    match listed {
        Ok(candidates) => {
            debug!(count = candidates.len(), "directory listed");
            for path in candidates {
                tracker.track(path);
            }
        }
        Err(err) => warn!(error = %err, "directory listing task failed"),
    }
}

/// Files below the root that pass the candidate filter. Hidden and
/// resource-fork directories are pruned without descending into them.
pub(crate) fn list_candidates(filter: &CandidateFilter) -> Vec<PathBuf> {
    let walker = WalkDir::new(filter.root())
        .min_depth(1)
        .max_depth(filter.max_depth())
        .follow_links(false)
        .into_iter()
        .filter_entry(|entry| {
            if entry.depth() == 0 {
                return true;
            }
            let name = entry.file_name().to_string_lossy();
            !is_hidden(&name) && !is_resource_fork(Path::new(entry.file_name()))
        });

    let mut candidates = Vec::new();
    for entry in walker {
        match entry {
            Ok(entry) => {
                if entry.file_type().is_file() && filter.accepts(entry.path()) {
                    candidates.push(entry.into_path());
                }
            }
            Err(err) => {
                warn!(error = %err, "skipping unreadable entry while listing");
            }
        }
    }
    candidates
}
