use std::path::{Component, Path, PathBuf};

use crate::config::WatchConfig;

/// Directory name macOS archivers use for resource-fork companions.
pub const RESOURCE_FORK_DIR: &str = "__MACOSX";

/// Hard upper bound on candidate depth below the watch root.
pub const MAX_CANDIDATE_DEPTH: usize = 2;

/// True for dot-files and dot-directories.
pub fn is_hidden(name: &str) -> bool {
    name.starts_with('.')
}

/// True when any component is a resource-fork directory or an AppleDouble
/// (`._name`) companion.
pub fn is_resource_fork(path: &Path) -> bool {
    path.components().any(|component| match component {
        Component::Normal(part) => {
            let part = part.to_string_lossy();
            part.eq_ignore_ascii_case(RESOURCE_FORK_DIR) || part.starts_with("._")
        }
        _ => false,
    })
}

/// Decides which paths under the watch root are import candidates.
#[derive(Clone, Debug)]
pub struct CandidateFilter {
    root: PathBuf,
    max_depth: usize,
    allow: Vec<PathBuf>,
    deny: Vec<PathBuf>,
}

impl CandidateFilter {
    pub fn new(root: impl Into<PathBuf>, config: &WatchConfig) -> Self {
        let root = root.into();
        let absolutize = |prefix: &PathBuf| {
            if prefix.is_absolute() {
                prefix.clone()
            } else {
                root.join(prefix)
            }
        };
        Self {
            max_depth: config.effective_depth(),
            allow: config.allow_prefixes.iter().map(absolutize).collect(),
            deny: config.deny_prefixes.iter().map(absolutize).collect(),
            root,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn max_depth(&self) -> usize {
        self.max_depth
    }

    /// Full candidate check used while listing the watch directory.
    pub fn accepts(&self, path: &Path) -> bool {
        let Ok(relative) = path.strip_prefix(&self.root) else {
            return false;
        };

        let mut depth = 0;
        for component in relative.components() {
            match component {
                Component::Normal(part) => {
                    if is_hidden(&part.to_string_lossy()) {
                        return false;
                    }
                    depth += 1;
                }
                _ => return false,
            }
        }
        if depth == 0 || depth > self.max_depth.min(MAX_CANDIDATE_DEPTH) {
            return false;
        }

        !self.is_excluded(path)
    }

    /// Cheap rejection applied again right before import: resource-fork
    /// paths and configured allow/deny prefixes.
    pub fn is_excluded(&self, path: &Path) -> bool {
        if is_resource_fork(path) {
            return true;
        }
        if self.deny.iter().any(|prefix| path.starts_with(prefix)) {
            return true;
        }
        !self.allow.is_empty() && !self.allow.iter().any(|prefix| path.starts_with(prefix))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filter(recursive: bool) -> CandidateFilter {
        let config = WatchConfig {
            recursive,
            deny_prefixes: vec![PathBuf::from("skip")],
            ..WatchConfig::default()
        };
        CandidateFilter::new("/imports", &config)
    }

    #[test]
    fn flat_mode_only_accepts_direct_children() {
        let filter = filter(false);
        assert!(filter.accepts(Path::new("/imports/game.zip")));
        assert!(!filter.accepts(Path::new("/imports/sub/game.zip")));
        assert!(!filter.accepts(Path::new("/imports")));
        assert!(!filter.accepts(Path::new("/elsewhere/game.zip")));
    }

    #[test]
    fn recursive_mode_stops_at_two_levels() {
        let filter = filter(true);
        assert!(filter.accepts(Path::new("/imports/psx/game.cue")));
        assert!(!filter.accepts(Path::new("/imports/psx/disc1/game.cue")));
    }

    #[test]
    fn hidden_forks_and_denied_prefixes_are_rejected() {
        let filter = filter(true);
        assert!(!filter.accepts(Path::new("/imports/.partial.zip")));
        assert!(!filter.accepts(Path::new("/imports/.scratch/game.bin")));
        assert!(!filter.accepts(Path::new("/imports/__MACOSX/game.bin")));
        assert!(!filter.accepts(Path::new("/imports/._game.bin")));
        assert!(!filter.accepts(Path::new("/imports/skip/game.bin")));
        assert!(filter.is_excluded(Path::new("/anywhere/__macosx/x")));
    }

    #[test]
    fn allow_list_narrows_candidates() {
        let config = WatchConfig {
            recursive: true,
            allow_prefixes: vec![PathBuf::from("roms")],
            ..WatchConfig::default()
        };
        let filter = CandidateFilter::new("/imports", &config);
        assert!(filter.accepts(Path::new("/imports/roms/a.nes")));
        assert!(!filter.accepts(Path::new("/imports/other/a.nes")));
    }
}
