//! Filesystem watch layer.
//!
//! A thin wrapper around `notify` exposing a [`ChangeSubscription`]
//! capability and a multi-path [`WatchSet`], plus the two consumers built
//! on top of them: the [`DirectoryMonitor`] that lists the import directory whenever anything
//! under it changes, and the [`StabilityTracker`] that decides when a single
//! file has stopped growing.

use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};

use notify::event::{AccessKind, EventKind};
use notify::{Config as NotifyConfig, Event, RecommendedWatcher, RecursiveMode, Watcher};
use tracing::debug;

use crate::error::Result;

pub mod filter;
pub mod monitor;
pub mod stability;

pub use filter::CandidateFilter;
pub use monitor::{DirectoryMonitor, MonitorHandle};
pub use stability::{Fingerprint, StabilityTracker};

/// What a subscription reports. Signals are coalesced hints, not a faithful
/// per-file event log.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ChangeSignal {
    Changed(Vec<PathBuf>),
    Error(String),
}

/// OS-level change notification handle. Dropping it (or calling
/// [`ChangeSubscription::cancel`]) stops delivery.
pub struct ChangeSubscription {
    path: PathBuf,
    watcher: RecommendedWatcher,
}

impl fmt::Debug for ChangeSubscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChangeSubscription")
            .field("path", &self.path)
            .finish()
    }
}

impl ChangeSubscription {
    /// Subscribe to changes at `path`. `on_event` runs on the notify thread
    /// and must not block.
    pub fn open<F>(path: &Path, recursive: bool, on_event: F) -> Result<Self>
    where
        F: Fn(ChangeSignal) + Send + 'static,
    {
        let mut watcher = new_watcher(on_event)?;

        let mode = if recursive {
            RecursiveMode::Recursive
        } else {
            RecursiveMode::NonRecursive
        };
        watcher.watch(path, mode)?;
        debug!(path = %path.display(), recursive, "change subscription opened");

        Ok(Self {
            path: path.to_path_buf(),
            watcher,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn cancel(mut self) {
        let _ = self.watcher.unwatch(&self.path);
        debug!(path = %self.path.display(), "change subscription cancelled");
    }
}

/// One OS watcher covering any number of individually added paths. Adding a
/// path costs one backend watch, never another backend instance.
pub struct WatchSet {
    watcher: RecommendedWatcher,
    watched: HashSet<PathBuf>,
}

impl fmt::Debug for WatchSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WatchSet")
            .field("watched", &self.watched.len())
            .finish()
    }
}

impl WatchSet {
    /// `on_event` runs on the notify thread and must not block.
    pub fn new<F>(on_event: F) -> Result<Self>
    where
        F: Fn(ChangeSignal) + Send + 'static,
    {
        Ok(Self {
            watcher: new_watcher(on_event)?,
            watched: HashSet::new(),
        })
    }

    /// Start reporting changes to `path` itself (non-recursive).
    pub fn add(&mut self, path: &Path) -> Result<()> {
        if self.watched.contains(path) {
            return Ok(());
        }
        self.watcher.watch(path, RecursiveMode::NonRecursive)?;
        self.watched.insert(path.to_path_buf());
        Ok(())
    }

    /// Stop reporting changes to `path`. Unknown paths are ignored.
    pub fn remove(&mut self, path: &Path) {
        if self.watched.remove(path) {
            // The backend drops watches of deleted files on its own.
            let _ = self.watcher.unwatch(path);
        }
    }

    pub fn contains(&self, path: &Path) -> bool {
        self.watched.contains(path)
    }

    pub fn len(&self) -> usize {
        self.watched.len()
    }

    pub fn is_empty(&self) -> bool {
        self.watched.is_empty()
    }
}

fn new_watcher<F>(on_event: F) -> Result<RecommendedWatcher>
where
    F: Fn(ChangeSignal) + Send + 'static,
{
    let watcher = RecommendedWatcher::new(
        move |res: std::result::Result<Event, notify::Error>| match res {
            Ok(event) => {
                if is_relevant(&event.kind) {
                    on_event(ChangeSignal::Changed(event.paths));
                }
            }
            Err(err) => on_event(ChangeSignal::Error(err.to_string())),
        },
        NotifyConfig::default(),
    )?;
    Ok(watcher)
}

fn is_relevant(kind: &EventKind) -> bool {
    !matches!(
        kind,
        EventKind::Access(AccessKind::Read | AccessKind::Open(_) | AccessKind::Any)
    )
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::sync::mpsc;

    use super::*;

    #[test]
    fn access_events_are_ignored() {
        use notify::event::{AccessMode, CreateKind, ModifyKind};

        assert!(!is_relevant(&EventKind::Access(AccessKind::Read)));
        assert!(!is_relevant(&EventKind::Access(AccessKind::Open(
            AccessMode::Read
        ))));
        assert!(is_relevant(&EventKind::Access(AccessKind::Close(
            AccessMode::Write
        ))));
        assert!(is_relevant(&EventKind::Create(CreateKind::File)));
        assert!(is_relevant(&EventKind::Modify(ModifyKind::Any)));
    }

    #[tokio::test]
    async fn subscription_reports_writes_until_cancelled() {
        let tmp = tempfile::tempdir().unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let subscription = ChangeSubscription::open(tmp.path(), false, move |signal| {
            let _ = tx.send(signal);
        })
        .unwrap();

        std::fs::write(tmp.path().join("game.bin"), b"rom").unwrap();
        let signal = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("signal delivered")
            .expect("channel open");
        assert!(matches!(signal, ChangeSignal::Changed(_)));

        subscription.cancel();
    }

    #[tokio::test]
    async fn one_watch_set_reports_every_added_file() {
        let tmp = tempfile::tempdir().unwrap();
        let first = tmp.path().join("a.bin");
        let second = tmp.path().join("b.bin");
        std::fs::write(&first, b"a").unwrap();
        std::fs::write(&second, b"b").unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut set = WatchSet::new(move |signal| {
            if let ChangeSignal::Changed(paths) = signal {
                for path in paths {
                    let _ = tx.send(path);
                }
            }
        })
        .unwrap();
        set.add(&first).unwrap();
        set.add(&second).unwrap();
        set.add(&second).unwrap();
        assert_eq!(set.len(), 2);

        std::fs::write(&second, b"bb").unwrap();
        let changed = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("change delivered")
            .expect("channel open");
        assert_eq!(changed, second);

        set.remove(&second);
        set.remove(&second);
        assert!(!set.contains(&second));
        assert!(set.contains(&first));
        assert!(set.add(&tmp.path().join("missing.bin")).is_err());
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn missing_directory_fails_to_subscribe() {
        let tmp = tempfile::tempdir().unwrap();
        let missing = tmp.path().join("nope");
        assert!(ChangeSubscription::open(&missing, true, |_| {}).is_err());
    }
}
