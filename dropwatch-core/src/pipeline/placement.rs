use std::cmp::Ordering;
use std::collections::HashSet;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::error::{IngestError, Result};
use crate::fs_watch::StabilityTracker;

/// Told about files the pipeline placed into the watched directory and will
/// not process again, so the watch layer does not mistake them for new
/// arrivals.
pub trait PlacementObserver: Send + Sync + fmt::Debug {
    fn placed(&self, paths: &[PathBuf]);
}

impl PlacementObserver for StabilityTracker {
    fn placed(&self, paths: &[PathBuf]) {
        for path in paths {
            self.settle(path.clone());
        }
    }
}

/// Playlists first, then cue sheets, then everything else.
fn rank(path: &Path) -> u8 {
    match path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_ascii_lowercase)
        .as_deref()
    {
        Some("m3u") => 0,
        Some("cue") => 1,
        _ => 2,
    }
}

fn compare(a: &Path, b: &Path) -> Ordering {
    rank(a)
        .cmp(&rank(b))
        .then_with(|| a.file_name().cmp(&b.file_name()))
        .then_with(|| a.cmp(b))
}

/// Order extracted files the way importers expect to receive them.
pub fn sort_for_import(paths: &mut [PathBuf]) {
    paths.sort_by(|a, b| compare(a, b));
}

/// Move `files` (flattened by file name) into `target_dir`.
///
/// All destinations are checked before anything moves. If a move still
/// fails, files already moved are put back so nothing partial stays in
/// `target_dir`.
pub fn place_files(files: &[PathBuf], target_dir: &Path) -> Result<Vec<PathBuf>> {
    let mut plan = Vec::with_capacity(files.len());
    let mut seen = HashSet::new();

    for file in files {
        let name = file.file_name().ok_or_else(|| {
            IngestError::ExtractionFailed(format!("'{}' has no file name", file.display()))
        })?;
        let destination = target_dir.join(name);
        if !seen.insert(destination.clone()) || fs::symlink_metadata(&destination).is_ok() {
            return Err(IngestError::DestinationExists(destination));
        }
        plan.push((file.as_path(), destination));
    }

    let mut moved: Vec<(&Path, &Path)> = Vec::with_capacity(plan.len());
    for (from, to) in &plan {
        if let Err(err) = move_file(from, to) {
            rollback(&moved);
            return Err(err.into());
        }
        debug!(from = %from.display(), to = %to.display(), "placed");
        moved.push((*from, to.as_path()));
    }

    Ok(plan.into_iter().map(|(_, to)| to).collect())
}

fn rollback(moved: &[(&Path, &Path)]) {
    for (from, to) in moved.iter().rev() {
        if let Err(err) = move_file(to, from) {
            warn!(
                path = %to.display(),
                error = %err,
                "could not roll back placed file"
            );
        }
    }
}

/// Rename, falling back to copy + remove when scratch space lives on a
/// different filesystem.
fn move_file(from: &Path, to: &Path) -> io::Result<()> {
    match fs::rename(from, to) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::CrossesDevices => {
            fs::copy(from, to)?;
            fs::remove_file(from)
        }
        Err(err) => Err(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn playlists_and_cue_sheets_lead() {
        let mut paths = vec![
            PathBuf::from("/s/b/track02.bin"),
            PathBuf::from("/s/game.cue"),
            PathBuf::from("/s/a/track01.bin"),
            PathBuf::from("/s/disc.M3U"),
            PathBuf::from("/s/alpha.CUE"),
        ];
        sort_for_import(&mut paths);
        assert_eq!(
            paths,
            vec![
                PathBuf::from("/s/disc.M3U"),
                PathBuf::from("/s/alpha.CUE"),
                PathBuf::from("/s/game.cue"),
                PathBuf::from("/s/a/track01.bin"),
                PathBuf::from("/s/b/track02.bin"),
            ]
        );
    }

    #[test]
    fn places_flattened_files() {
        let tmp = tempfile::tempdir().unwrap();
        let scratch = tmp.path().join("scratch");
        let target = tmp.path().join("imports");
        fs::create_dir_all(scratch.join("disc")).unwrap();
        fs::create_dir_all(&target).unwrap();
        fs::write(scratch.join("disc/game.bin"), b"bin").unwrap();
        fs::write(scratch.join("game.cue"), b"cue").unwrap();

        let placed = place_files(
            &[scratch.join("game.cue"), scratch.join("disc/game.bin")],
            &target,
        )
        .unwrap();

        assert_eq!(placed, vec![target.join("game.cue"), target.join("game.bin")]);
        assert_eq!(fs::read(target.join("game.bin")).unwrap(), b"bin");
        assert!(!scratch.join("game.cue").exists());
    }

    #[test]
    fn collision_moves_nothing() {
        let tmp = tempfile::tempdir().unwrap();
        let scratch = tmp.path().join("scratch");
        let target = tmp.path().join("imports");
        fs::create_dir_all(&scratch).unwrap();
        fs::create_dir_all(&target).unwrap();
        fs::write(scratch.join("a.bin"), b"new a").unwrap();
        fs::write(scratch.join("b.bin"), b"new b").unwrap();
        fs::write(target.join("b.bin"), b"existing").unwrap();

        let err = place_files(&[scratch.join("a.bin"), scratch.join("b.bin")], &target)
            .unwrap_err();

        assert!(matches!(err, IngestError::DestinationExists(ref p) if p == &target.join("b.bin")));
        assert!(!target.join("a.bin").exists());
        assert_eq!(fs::read(target.join("b.bin")).unwrap(), b"existing");
    }

    #[test]
    fn duplicate_names_inside_one_archive_collide() {
        let tmp = tempfile::tempdir().unwrap();
        let scratch = tmp.path().join("scratch");
        fs::create_dir_all(scratch.join("d1")).unwrap();
        fs::create_dir_all(scratch.join("d2")).unwrap();
        fs::write(scratch.join("d1/x.bin"), b"1").unwrap();
        fs::write(scratch.join("d2/x.bin"), b"2").unwrap();

        let err = place_files(
            &[scratch.join("d1/x.bin"), scratch.join("d2/x.bin")],
            tmp.path(),
        )
        .unwrap_err();
        assert!(matches!(err, IngestError::DestinationExists(_)));
        assert!(!tmp.path().join("x.bin").exists());
    }

    #[test]
    fn failed_move_rolls_back() {
        let tmp = tempfile::tempdir().unwrap();
        let scratch = tmp.path().join("scratch");
        let target = tmp.path().join("imports");
        fs::create_dir_all(&scratch).unwrap();
        fs::create_dir_all(&target).unwrap();
        fs::write(scratch.join("a.bin"), b"a").unwrap();

        let missing = scratch.join("vanished.bin");
        let err = place_files(&[scratch.join("a.bin"), missing], &target).unwrap_err();

        assert!(matches!(err, IngestError::Io(_)));
        assert!(scratch.join("a.bin").exists());
        assert!(!target.join("a.bin").exists());
    }
}
