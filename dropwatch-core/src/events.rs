use std::fmt;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::archive::ArchiveKind;
use crate::error::FailureKind;

/// Identity of one extraction run. A source path may see several jobs over
/// time (after a failure and a retry) but never two at once.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Lifecycle transitions of archive jobs.
///
/// Per job the order is `Started`, any number of `ItemExtracted`, then
/// exactly one of `Completed` or `Failed`. `Idle` is emitted whenever the
/// last running job has finished.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ExtractionStatus {
    Idle,
    Started {
        job: JobId,
        source: PathBuf,
        kind: ArchiveKind,
    },
    ItemExtracted {
        job: JobId,
        source: PathBuf,
        path: PathBuf,
        progress: f32,
    },
    Completed {
        job: JobId,
        source: PathBuf,
        paths: Vec<PathBuf>,
    },
    Failed {
        job: JobId,
        source: PathBuf,
        kind: FailureKind,
        message: String,
    },
}

impl ExtractionStatus {
    pub fn job(&self) -> Option<JobId> {
        match self {
            ExtractionStatus::Idle => None,
            ExtractionStatus::Started { job, .. }
            | ExtractionStatus::ItemExtracted { job, .. }
            | ExtractionStatus::Completed { job, .. }
            | ExtractionStatus::Failed { job, .. } => Some(*job),
        }
    }

    pub fn source(&self) -> Option<&Path> {
        match self {
            ExtractionStatus::Idle => None,
            ExtractionStatus::Started { source, .. }
            | ExtractionStatus::ItemExtracted { source, .. }
            | ExtractionStatus::Completed { source, .. }
            | ExtractionStatus::Failed { source, .. } => Some(source),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExtractionStatus::Completed { .. } | ExtractionStatus::Failed { .. }
        )
    }
}

/// Payload files made available by one import.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ImportBatch {
    pub id: Uuid,
    /// File that was handed to the pipeline.
    pub source: PathBuf,
    /// Container the paths came out of; `None` for pass-through files.
    pub archive: Option<ArchiveKind>,
    /// Ordered with playlists and cue sheets first.
    pub paths: Vec<PathBuf>,
    /// Whether the archive was deleted after its payload was placed. `false`
    /// for pass-through files, and for archives whose removal failed; such
    /// an archive is left in the watched directory and re-importing it
    /// collides with its own payload.
    pub source_removed: bool,
    pub published_at: DateTime<Utc>,
}

impl ImportBatch {
    pub fn pass_through(path: PathBuf) -> Self {
        Self {
            id: Uuid::now_v7(),
            source: path.clone(),
            archive: None,
            paths: vec![path],
            source_removed: false,
            published_at: Utc::now(),
        }
    }

    pub fn extracted(
        source: PathBuf,
        kind: ArchiveKind,
        paths: Vec<PathBuf>,
        source_removed: bool,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            source,
            archive: Some(kind),
            paths,
            source_removed,
            published_at: Utc::now(),
        }
    }
}

/// A file claimed by the firmware registry instead of the import pipeline.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FirmwareFile {
    pub path: PathBuf,
    pub detected_at: DateTime<Utc>,
}

impl FirmwareFile {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            detected_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_accessors_and_wire_shape() {
        let job = JobId::new();
        let failed = ExtractionStatus::Failed {
            job,
            source: PathBuf::from("/imports/broken.zip"),
            kind: FailureKind::ExtractionFailed,
            message: "bad header".into(),
        };
        assert!(failed.is_terminal());
        assert_eq!(failed.job(), Some(job));
        assert_eq!(failed.source(), Some(Path::new("/imports/broken.zip")));
        assert!(!ExtractionStatus::Idle.is_terminal());

        let json = serde_json::to_value(&failed).unwrap();
        assert_eq!(json["state"], "failed");
        assert_eq!(json["kind"], "ExtractionFailed");
    }

    #[test]
    fn pass_through_batch_has_single_path() {
        let batch = ImportBatch::pass_through(PathBuf::from("/imports/rom.nes"));
        assert_eq!(batch.paths, vec![PathBuf::from("/imports/rom.nes")]);
        assert_eq!(batch.archive, None);
        assert!(!batch.source_removed);
    }
}
