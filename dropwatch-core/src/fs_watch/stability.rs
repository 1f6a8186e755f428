//! Write-completion detection.
//!
//! Every tracked path is owned by one actor task. The shared per-file
//! [`WatchSet`] and the poll timers only send messages into that task, so
//! the table of `WatchedPath` records never sees concurrent mutation.

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{ChangeSignal, WatchSet};
use crate::config::StabilityConfig;

/// Size and modification time captured by one stat.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Fingerprint {
    pub size: u64,
    pub modified: Option<SystemTime>,
}

impl Fingerprint {
    pub async fn read(path: &Path) -> io::Result<Self> {
        let meta = tokio::fs::metadata(path).await?;
        if !meta.is_file() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "not a regular file",
            ));
        }
        Ok(Self {
            size: meta.len(),
            modified: meta.modified().ok(),
        })
    }
}

enum Command {
    Track(PathBuf),
    Untrack(PathBuf),
    Settle(PathBuf),
    Changed(PathBuf),
    Check { path: PathBuf, generation: u64 },
    Reconcile,
    IsTracked(PathBuf, oneshot::Sender<bool>),
    HasAny(oneshot::Sender<bool>),
    WatchCount(oneshot::Sender<usize>),
}

/// Handle to the tracker actor. Cheap to clone; the actor stops once
/// [`StabilityTracker::shutdown`] is called or every handle is dropped.
#[derive(Clone)]
pub struct StabilityTracker {
    commands: mpsc::UnboundedSender<Command>,
    shutdown: CancellationToken,
}

impl fmt::Debug for StabilityTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StabilityTracker")
            .field("running", &!self.commands.is_closed())
            .finish()
    }
}

impl StabilityTracker {
    /// Start the actor. Paths judged stable are delivered on the returned
    /// receiver, each exactly once per arrival.
    pub fn spawn(config: StabilityConfig) -> (Self, mpsc::UnboundedReceiver<PathBuf>) {
        let (commands, inbox) = mpsc::unbounded_channel();
        let (ready, ready_rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();

        let actor = TrackerActor {
            config,
            commands: commands.downgrade(),
            shutdown: shutdown.clone(),
            watches: open_watch_set(commands.downgrade()),
            entries: HashMap::new(),
            settled: HashMap::new(),
            next_generation: 0,
            ready,
        };
        tokio::spawn(actor.run(inbox));

        (Self { commands, shutdown }, ready_rx)
    }

    /// Begin watching `path`. No-op when it is already tracked or was
    /// already handed off with the same fingerprint.
    pub fn track(&self, path: impl Into<PathBuf>) {
        let _ = self.commands.send(Command::Track(path.into()));
    }

    pub fn untrack(&self, path: impl Into<PathBuf>) {
        let _ = self.commands.send(Command::Untrack(path.into()));
    }

    /// Mark the file currently at `path` as handled so later listings skip
    /// it until it changes.
    pub fn settle(&self, path: impl Into<PathBuf>) {
        let _ = self.commands.send(Command::Settle(path.into()));
    }

    /// Release every record whose file no longer exists.
    pub fn reconcile(&self) {
        let _ = self.commands.send(Command::Reconcile);
    }

    pub async fn is_tracked(&self, path: impl Into<PathBuf>) -> bool {
        let (tx, rx) = oneshot::channel();
        if self.commands.send(Command::IsTracked(path.into(), tx)).is_err() {
            return false;
        }
        rx.await.unwrap_or(false)
    }

    pub async fn has_any_tracked(&self) -> bool {
        let (tx, rx) = oneshot::channel();
        if self.commands.send(Command::HasAny(tx)).is_err() {
            return false;
        }
        rx.await.unwrap_or(false)
    }

    /// Tracked files currently covered by change notifications. Files not
    /// covered still settle through polling.
    pub async fn per_file_watches(&self) -> usize {
        let (tx, rx) = oneshot::channel();
        if self.commands.send(Command::WatchCount(tx)).is_err() {
            return 0;
        }
        rx.await.unwrap_or(0)
    }

    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

fn open_watch_set(commands: mpsc::WeakUnboundedSender<Command>) -> Option<WatchSet> {
    let opened = WatchSet::new(move |signal| {
        let ChangeSignal::Changed(paths) = signal else {
            return;
        };
        let Some(tx) = commands.upgrade() else {
            return;
        };
        for path in paths {
            let _ = tx.send(Command::Changed(path));
        }
    });

    match opened {
        Ok(watches) => Some(watches),
        Err(err) => {
            warn!(error = %err, "per-file change notifications unavailable, polling only");
            None
        }
    }
}

/// Per-path record. Dropping it releases the poll timer; the actor removes
/// the path from its [`WatchSet`] in [`TrackerActor::release`].
struct WatchedPath {
    generation: u64,
    fingerprint: Fingerprint,
    checks: u32,
    dirty: bool,
    poller: JoinHandle<()>,
}

impl Drop for WatchedPath {
    fn drop(&mut self) {
        self.poller.abort();
    }
}

struct TrackerActor {
    config: StabilityConfig,
    commands: mpsc::WeakUnboundedSender<Command>,
    shutdown: CancellationToken,
    watches: Option<WatchSet>,
    entries: HashMap<PathBuf, WatchedPath>,
    settled: HashMap<PathBuf, Fingerprint>,
    next_generation: u64,
    ready: mpsc::UnboundedSender<PathBuf>,
}

impl TrackerActor {
    async fn run(mut self, mut inbox: mpsc::UnboundedReceiver<Command>) {
        loop {
            let command = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                command = inbox.recv() => match command {
                    Some(command) => command,
                    None => break,
                },
            };
            self.handle(command).await;
        }

        let released = self.entries.len();
        self.entries.clear();
        self.watches = None;
        debug!(released, "stability tracker stopped");
    }

    async fn handle(&mut self, command: Command) {
        match command {
            Command::Track(path) => self.track(path).await,
            Command::Untrack(path) => {
                if self.release(&path).is_some() {
                    debug!(path = %path.display(), "untracked");
                }
            }
            Command::Settle(path) => self.settle(path).await,
            Command::Changed(path) => self.changed(path).await,
            Command::Check { path, generation } => self.check(path, generation).await,
            Command::Reconcile => self.reconcile().await,
            Command::IsTracked(path, reply) => {
                let _ = reply.send(self.entries.contains_key(&path));
            }
            Command::HasAny(reply) => {
                let _ = reply.send(!self.entries.is_empty());
            }
            Command::WatchCount(reply) => {
                let _ = reply.send(self.watches.as_ref().map_or(0, WatchSet::len));
            }
        }
    }

    async fn track(&mut self, path: PathBuf) {
        if self.entries.contains_key(&path) {
            return;
        }

        let fingerprint = match Fingerprint::read(&path).await {
            Ok(fingerprint) => fingerprint,
            Err(err) => {
                debug!(path = %path.display(), error = %err, "not tracking");
                return;
            }
        };

        match self.settled.get(&path) {
            Some(previous) if *previous == fingerprint => return,
            Some(_) => {
                self.settled.remove(&path);
            }
            None => {}
        }

        self.next_generation += 1;
        let generation = self.next_generation;
        let per_file_events = self.watch(&path);
        let poller = self.spawn_poller(path.clone(), generation);

        debug!(
            path = %path.display(),
            size = fingerprint.size,
            per_file_events,
            "tracking"
        );
        self.entries.insert(
            path,
            WatchedPath {
                generation,
                fingerprint,
                checks: 0,
                dirty: false,
                poller,
            },
        );
    }

    async fn settle(&mut self, path: PathBuf) {
        self.release(&path);
        match Fingerprint::read(&path).await {
            Ok(fingerprint) => {
                self.settled.insert(path, fingerprint);
            }
            Err(_) => {
                self.settled.remove(&path);
            }
        }
    }

    /// A notification may outlive the record it was meant for; applied to
    /// a newer record it only delays stability by one tick.
    async fn changed(&mut self, path: PathBuf) {
        if !self.entries.contains_key(&path) {
            return;
        }
        match Fingerprint::read(&path).await {
            Ok(fingerprint) => {
                if let Some(entry) = self.entries.get_mut(&path) {
                    entry.fingerprint = fingerprint;
                    entry.dirty = true;
                }
            }
            Err(err) => {
                debug!(path = %path.display(), error = %err, "tracked file went away");
                self.release(&path);
            }
        }
    }

    async fn check(&mut self, path: PathBuf, generation: u64) {
        if !self.is_current(&path, generation) {
            return;
        }

        let observed = match Fingerprint::read(&path).await {
            Ok(fingerprint) => fingerprint,
            Err(err) => {
                debug!(path = %path.display(), error = %err, "tracked file went away");
                self.release(&path);
                return;
            }
        };

        let max_checks = self.config.max_checks.max(1);
        let Some(entry) = self.entries.get_mut(&path) else {
            return;
        };
        entry.checks += 1;

        if !entry.dirty && entry.fingerprint == observed && observed.size > 0 {
            let checks = entry.checks;
            self.release(&path);
            self.settled.insert(path.clone(), observed);
            info!(path = %path.display(), size = observed.size, checks, "file is stable");
            let _ = self.ready.send(path);
            return;
        }

        entry.fingerprint = observed;
        entry.dirty = false;

        if entry.checks >= max_checks {
            self.release(&path);
            warn!(
                path = %path.display(),
                size = observed.size,
                max_checks,
                "file never settled; released without processing"
            );
        }
    }

    async fn reconcile(&mut self) {
        let mut gone = Vec::new();
        for path in self.entries.keys().chain(self.settled.keys()) {
            if !tokio::fs::try_exists(path).await.unwrap_or(false) {
                gone.push(path.clone());
            }
        }
        for path in gone {
            if self.release(&path).is_some() {
                debug!(path = %path.display(), "released vanished path");
            }
            self.settled.remove(&path);
        }
    }

    fn is_current(&self, path: &Path, generation: u64) -> bool {
        self.entries
            .get(path)
            .is_some_and(|entry| entry.generation == generation)
    }

    /// Drop the record for `path` and its change notifications.
    fn release(&mut self, path: &Path) -> Option<WatchedPath> {
        if let Some(watches) = self.watches.as_mut() {
            watches.remove(path);
        }
        self.entries.remove(path)
    }

    /// Returns whether `path` is covered by change notifications.
    fn watch(&mut self, path: &Path) -> bool {
        let Some(watches) = self.watches.as_mut() else {
            return false;
        };
        match watches.add(path) {
            Ok(()) => true,
            Err(err) => {
                warn!(
                    path = %path.display(),
                    watched = watches.len(),
                    error = %err,
                    "per-file change notifications unavailable, polling only"
                );
                false
            }
        }
    }

    fn spawn_poller(&self, path: PathBuf, generation: u64) -> JoinHandle<()> {
        let commands = self.commands.clone();
        let period = self.config.poll_interval();
        tokio::spawn(async move {
            let mut ticker = time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(tx) = commands.upgrade() else {
                    break;
                };
                let check = Command::Check {
                    path: path.clone(),
                    generation,
                };
                if tx.send(check).is_err() {
                    break;
                }
            }
        })
    }
}
