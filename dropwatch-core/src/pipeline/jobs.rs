use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio_util::sync::CancellationToken;

use crate::event_bus::ImportEventPublisher;
use crate::events::{ExtractionStatus, JobId};

#[derive(Debug)]
struct ActiveJob {
    id: JobId,
    cancel: CancellationToken,
}

/// Source path → running job. The single place that enforces one job per
/// source.
#[derive(Debug, Default)]
pub(crate) struct JobTable {
    active: Mutex<HashMap<PathBuf, ActiveJob>>,
}

impl JobTable {
    /// Register a job for `source`, or `None` if one is already running.
    pub(crate) fn try_begin(
        self: &Arc<Self>,
        source: &Path,
        events: Arc<dyn ImportEventPublisher>,
    ) -> Option<JobGuard> {
        let mut active = self.lock();
        if active.contains_key(source) {
            return None;
        }

        let id = JobId::new();
        let cancel = CancellationToken::new();
        active.insert(
            source.to_path_buf(),
            ActiveJob {
                id,
                cancel: cancel.clone(),
            },
        );

        Some(JobGuard {
            table: Arc::clone(self),
            source: source.to_path_buf(),
            id,
            cancel,
            events,
        })
    }

    pub(crate) fn cancel(&self, source: &Path) -> bool {
        match self.lock().get(source) {
            Some(job) => {
                job.cancel.cancel();
                true
            }
            None => false,
        }
    }

    pub(crate) fn is_active(&self, source: &Path) -> bool {
        self.lock().contains_key(source)
    }

    pub(crate) fn len(&self) -> usize {
        self.lock().len()
    }

    pub(crate) fn cancel_all(&self) {
        for job in self.lock().values() {
            job.cancel.cancel();
        }
    }

    fn finish(&self, source: &Path, id: JobId) -> bool {
        let mut active = self.lock();
        if active.get(source).is_some_and(|job| job.id == id) {
            active.remove(source);
        }
        active.is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<PathBuf, ActiveJob>> {
        self.active
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Held by a running job. Dropping it frees the source path on every exit
/// path, including panics and task aborts, and announces `Idle` when it was
/// the last job.
pub(crate) struct JobGuard {
    table: Arc<JobTable>,
    source: PathBuf,
    id: JobId,
    cancel: CancellationToken,
    events: Arc<dyn ImportEventPublisher>,
}

impl fmt::Debug for JobGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobGuard")
            .field("source", &self.source)
            .field("id", &self.id)
            .field("cancelled", &self.cancel.is_cancelled())
            .finish()
    }
}

impl JobGuard {
    pub(crate) fn id(&self) -> JobId {
        self.id
    }

    pub(crate) fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

impl Drop for JobGuard {
    fn drop(&mut self) {
        if self.table.finish(&self.source, self.id) {
            self.events.publish_status(ExtractionStatus::Idle);
        }
    }
}
