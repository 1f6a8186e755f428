use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::archive::ArchiveKind;

/// Top-level knobs for the import pipeline.
///
/// All fields carry defaults so a deployment only needs to name the watched
/// directory; everything else can be tuned progressively.
#[derive(Clone, Debug, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct DropwatchConfig {
    /// Which directory is watched and how deep.
    pub watch: WatchConfig,
    /// Write-completion detection policy.
    pub stability: StabilityConfig,
    /// Scratch space and backend limits.
    pub extraction: ExtractionConfig,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchConfig {
    /// Import directory. Created on start when missing.
    pub directory: PathBuf,
    /// Descend into sub-directories (bounded by `max_depth`).
    pub recursive: bool,
    /// Deepest level below the watch root still considered an import
    /// candidate. Direct children are depth 1.
    pub max_depth: usize,
    /// When non-empty, only paths under one of these prefixes are imported.
    pub allow_prefixes: Vec<PathBuf>,
    /// Paths under any of these prefixes are never imported.
    pub deny_prefixes: Vec<PathBuf>,
    /// Cadence (ms) of the reconciliation pass that forgets vanished files.
    pub reconcile_interval_ms: u64,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("imports"),
            recursive: false,
            max_depth: 2,
            allow_prefixes: Vec::new(),
            deny_prefixes: Vec::new(),
            reconcile_interval_ms: 5_000,
        }
    }
}

impl WatchConfig {
    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_millis(self.reconcile_interval_ms.max(1))
    }

    /// Depth actually walked when listing the directory.
    pub fn effective_depth(&self) -> usize {
        if self.recursive {
            self.max_depth.clamp(1, 2)
        } else {
            1
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct StabilityConfig {
    /// Interval (ms) between size checks of a tracked file.
    pub poll_interval_ms: u64,
    /// Checks performed before a still-growing file is abandoned.
    pub max_checks: u32,
}

impl Default for StabilityConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 2_000,
            max_checks: 30,
        }
    }
}

impl StabilityConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtractionConfig {
    /// Parent of per-job scratch directories. Falls back to the system temp
    /// directory.
    pub scratch_root: Option<PathBuf>,
    /// Ceiling applied to backends that load a whole container in memory.
    pub default_size_ceiling_bytes: u64,
    /// Per-kind ceilings. A kind listed here is checked even when its
    /// backend streams.
    pub size_ceilings: HashMap<ArchiveKind, u64>,
    /// Entries buffered between a backend and the pipeline.
    pub channel_capacity: usize,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            scratch_root: None,
            default_size_ceiling_bytes: 512 * 1024 * 1024,
            size_ceilings: HashMap::new(),
            channel_capacity: 8,
        }
    }
}

impl ExtractionConfig {
    /// Resolve the ceiling for a backend of `kind`.
    pub fn ceiling_for(&self, kind: ArchiveKind, buffers_whole_archive: bool) -> Option<u64> {
        match self.size_ceilings.get(&kind) {
            Some(limit) => Some(*limit),
            None if buffers_whole_archive => Some(self.default_size_ceiling_bytes),
            None => None,
        }
    }

    pub fn scratch_root(&self) -> PathBuf {
        self.scratch_root.clone().unwrap_or_else(std::env::temp_dir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_config_keeps_defaults() {
        let cfg: DropwatchConfig = serde_json::from_str(
            r#"{ "watch": { "directory": "/srv/imports", "recursive": true },
                 "extraction": { "size_ceilings": { "zip": 1024 } } }"#,
        )
        .unwrap();

        assert_eq!(cfg.watch.directory, PathBuf::from("/srv/imports"));
        assert_eq!(cfg.watch.max_depth, 2);
        assert_eq!(cfg.stability.max_checks, 30);
        assert_eq!(cfg.extraction.ceiling_for(ArchiveKind::Zip, false), Some(1024));
        assert_eq!(cfg.extraction.ceiling_for(ArchiveKind::Tar, false), None);
        assert_eq!(
            cfg.extraction.ceiling_for(ArchiveKind::SevenZip, true),
            Some(512 * 1024 * 1024)
        );
    }

    #[test]
    fn depth_is_bounded() {
        let mut watch = WatchConfig::default();
        assert_eq!(watch.effective_depth(), 1);
        watch.recursive = true;
        watch.max_depth = 10;
        assert_eq!(watch.effective_depth(), 2);
    }
}
