//! Archive classification and the uniform extractor contract.
//!
//! Every codec lives behind [`ExtractorBackend`]. A backend turns one source
//! container into a lazy [`ExtractionStream`] of files written below the
//! requested destination. The pipeline never branches on the archive type;
//! it asks the [`ExtractorRegistry`] for a backend and drives the stream.
//!
//! Codec crates are synchronous, so backends run on the blocking pool and
//! hand entries across a bounded channel as soon as each file is on disk.

use std::fmt;
use std::fs;
use std::io::{self, Read};
use std::path::{Component, Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use futures::Stream;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

use crate::error::{IngestError, Result};

pub mod bzip2;
pub mod gzip;
pub mod registry;
pub mod sevenz;
pub mod tar;
pub mod zip;

pub use registry::ExtractorRegistry;

/// Closed set of container formats the pipeline can dispatch.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ArchiveKind {
    #[serde(rename = "zip")]
    Zip,
    #[serde(rename = "7z")]
    SevenZip,
    #[serde(rename = "tar")]
    Tar,
    #[serde(rename = "bzip2")]
    Bzip2,
    #[serde(rename = "gzip")]
    Gzip,
}

impl ArchiveKind {
    pub const ALL: [ArchiveKind; 5] = [
        ArchiveKind::Zip,
        ArchiveKind::SevenZip,
        ArchiveKind::Tar,
        ArchiveKind::Bzip2,
        ArchiveKind::Gzip,
    ];

    /// Classify purely by lowercase extension.
    pub fn from_path(path: &Path) -> Option<Self> {
        let ext = path.extension()?.to_str()?.to_ascii_lowercase();
        Self::from_extension(&ext)
    }

    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext {
            "zip" => Some(ArchiveKind::Zip),
            "7z" => Some(ArchiveKind::SevenZip),
            "tar" => Some(ArchiveKind::Tar),
            "bz2" | "bzip2" => Some(ArchiveKind::Bzip2),
            "gz" | "gzip" => Some(ArchiveKind::Gzip),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ArchiveKind::Zip => "zip",
            ArchiveKind::SevenZip => "7z",
            ArchiveKind::Tar => "tar",
            ArchiveKind::Bzip2 => "bzip2",
            ArchiveKind::Gzip => "gzip",
        }
    }
}

impl fmt::Display for ArchiveKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One file materialised by a backend.
#[derive(Clone, Debug, PartialEq)]
pub struct ExtractedItem {
    /// Absolute path of the written file below the request destination.
    pub path: PathBuf,
    /// Fraction of the container processed so far, in `0.0..=1.0`.
    pub progress: f32,
}

/// Lazy sequence of extracted files.
pub type ExtractionStream = Pin<Box<dyn Stream<Item = Result<ExtractedItem>> + Send>>;

/// Everything a backend needs for one run.
#[derive(Clone, Debug)]
pub struct ExtractRequest {
    pub source: PathBuf,
    pub destination: PathBuf,
    pub cancel: CancellationToken,
    pub size_ceiling: Option<u64>,
    pub channel_capacity: usize,
}

impl ExtractRequest {
    pub fn new(source: impl Into<PathBuf>, destination: impl Into<PathBuf>) -> Self {
        Self {
            source: source.into(),
            destination: destination.into(),
            cancel: CancellationToken::new(),
            size_ceiling: None,
            channel_capacity: 8,
        }
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_size_ceiling(mut self, ceiling: Option<u64>) -> Self {
        self.size_ceiling = ceiling;
        self
    }
}

/// Uniform extractor contract.
pub trait ExtractorBackend: Send + Sync + fmt::Debug {
    fn kind(&self) -> ArchiveKind;

    /// Whether the codec must hold the whole container in memory. Such
    /// backends get the configured size ceiling by default.
    fn buffers_whole_archive(&self) -> bool {
        false
    }

    /// Start extracting. Entries become visible on the stream as each one is
    /// written. The stream yields at most one error and then ends.
    fn extract(&self, request: ExtractRequest) -> ExtractionStream;
}

/// Producer side handed to blocking codec loops.
pub struct EntrySink {
    tx: mpsc::Sender<Result<ExtractedItem>>,
    cancel: CancellationToken,
    emitted: usize,
}

impl fmt::Debug for EntrySink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntrySink")
            .field("emitted", &self.emitted)
            .field("cancelled", &self.cancel.is_cancelled())
            .finish()
    }
}

impl EntrySink {
    /// Called between entries. Cancellation is never observed mid-entry.
    pub fn checkpoint(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(IngestError::Cancelled(format!(
                "extraction stopped after {} entries",
                self.emitted
            )));
        }
        Ok(())
    }

    pub fn emit(&mut self, path: PathBuf, progress: f32) -> Result<()> {
        self.checkpoint()?;
        let item = ExtractedItem {
            path,
            progress: progress.clamp(0.0, 1.0),
        };
        self.tx
            .blocking_send(Ok(item))
            .map_err(|_| IngestError::Cancelled("extraction consumer went away".into()))?;
        self.emitted += 1;
        Ok(())
    }

    pub fn emitted(&self) -> usize {
        self.emitted
    }
}

/// Run a synchronous codec loop on the blocking pool and expose its output
/// as an [`ExtractionStream`]. Size ceilings are checked before any work.
pub fn blocking_stream<F>(request: ExtractRequest, work: F) -> ExtractionStream
where
    F: FnOnce(&ExtractRequest, &mut EntrySink) -> Result<()> + Send + 'static,
{
    let (tx, rx) = mpsc::channel(request.channel_capacity.max(1));
    let sink_tx = tx.clone();

    let worker = tokio::task::spawn_blocking(move || {
        check_size_ceiling(&request.source, request.size_ceiling)?;
        let mut sink = EntrySink {
            tx: sink_tx,
            cancel: request.cancel.clone(),
            emitted: 0,
        };
        work(&request, &mut sink)
    });

    tokio::spawn(async move {
        let outcome = match worker.await {
            Ok(result) => result,
            Err(join) => Err(IngestError::from(join)),
        };
        if let Err(err) = outcome {
            let _ = tx.send(Err(err)).await;
        }
    });

    Box::pin(ReceiverStream::new(rx))
}

pub(crate) fn check_size_ceiling(source: &Path, ceiling: Option<u64>) -> Result<()> {
    let Some(limit) = ceiling else {
        return Ok(());
    };
    let size = fs::metadata(source)?.len();
    if size > limit {
        return Err(IngestError::FileTooLarge {
            path: source.to_path_buf(),
            size,
            limit,
        });
    }
    Ok(())
}

/// Join an archive entry name onto `destination`, refusing names that would
/// land outside of it.
pub(crate) fn safe_join(destination: &Path, entry: &Path) -> Result<PathBuf> {
    let mut clean = PathBuf::new();
    for component in entry.components() {
        match component {
            Component::Normal(seg) => clean.push(seg),
            Component::CurDir => {}
            Component::ParentDir => {
                if !clean.pop() {
                    return Err(IngestError::ExtractionFailed(format!(
                        "entry '{}' escapes the extraction directory",
                        entry.display()
                    )));
                }
            }
            Component::RootDir | Component::Prefix(_) => {
                return Err(IngestError::ExtractionFailed(format!(
                    "entry '{}' is an absolute path",
                    entry.display()
                )));
            }
        }
    }

    if clean.as_os_str().is_empty() {
        return Err(IngestError::ExtractionFailed(format!(
            "entry '{}' has no file name",
            entry.display()
        )));
    }

    Ok(destination.join(clean))
}

/// Create parent directories and copy `reader` into a new file at `target`.
pub(crate) fn write_entry<R: Read + ?Sized>(reader: &mut R, target: &Path) -> Result<u64> {
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut out = fs::File::create(target)?;
    io::copy(reader, &mut out).map_err(|err| corrupt_or_io(err, target))
}

/// Codec read errors surface as `io::Error`; anything that is not an
/// environment problem means the container is damaged.
pub(crate) fn corrupt_or_io(err: io::Error, target: &Path) -> IngestError {
    match err.kind() {
        io::ErrorKind::PermissionDenied
        | io::ErrorKind::StorageFull
        | io::ErrorKind::ReadOnlyFilesystem
        | io::ErrorKind::NotFound => IngestError::Io(err),
        _ => IngestError::ExtractionFailed(format!("{}: {err}", target.display())),
    }
}

/// Decompress a single-stream codec (gzip, bzip2) into one file named after
/// the source stem.
pub(crate) fn extract_single_stream<D, F>(
    request: &ExtractRequest,
    sink: &mut EntrySink,
    decoder: F,
) -> Result<()>
where
    D: Read,
    F: FnOnce(io::BufReader<fs::File>) -> D,
{
    sink.checkpoint()?;

    let file = fs::File::open(&request.source)?;
    let name = request
        .source
        .file_stem()
        .filter(|stem| !stem.is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("payload"));
    let target = safe_join(&request.destination, &name)?;

    let mut reader = decoder(io::BufReader::new(file));
    write_entry(&mut reader, &target)?;
    sink.emit(target, 1.0)
}

pub(crate) fn fraction(done: u64, total: u64) -> f32 {
    if total == 0 {
        return 1.0;
    }
    (done as f64 / total as f64).clamp(0.0, 1.0) as f32
}

/// Reader wrapper counting consumed bytes of the compressed source, used for
/// byte-proportional progress when entry counts are unknown up front.
#[derive(Debug)]
pub(crate) struct CountingReader<R> {
    inner: R,
    consumed: Arc<AtomicU64>,
}

impl<R> CountingReader<R> {
    pub(crate) fn new(inner: R) -> (Self, Arc<AtomicU64>) {
        let consumed = Arc::new(AtomicU64::new(0));
        (
            Self {
                inner,
                consumed: Arc::clone(&consumed),
            },
            consumed,
        )
    }
}

impl<R: Read> Read for CountingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.consumed.fetch_add(n as u64, Ordering::Relaxed);
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_uses_lowercase_extension() {
        assert_eq!(
            ArchiveKind::from_path(Path::new("/in/Game.ZIP")),
            Some(ArchiveKind::Zip)
        );
        assert_eq!(
            ArchiveKind::from_path(Path::new("disc.7z")),
            Some(ArchiveKind::SevenZip)
        );
        assert_eq!(
            ArchiveKind::from_path(Path::new("dump.tar.gz")),
            Some(ArchiveKind::Gzip)
        );
        assert_eq!(
            ArchiveKind::from_path(Path::new("rom.bz2")),
            Some(ArchiveKind::Bzip2)
        );
        assert_eq!(ArchiveKind::from_path(Path::new("game.bin")), None);
        assert_eq!(ArchiveKind::from_path(Path::new("zip")), None);
    }

    #[test]
    fn safe_join_rejects_escapes() {
        let dest = Path::new("/scratch/job");
        assert_eq!(
            safe_join(dest, Path::new("disc/track01.bin")).unwrap(),
            PathBuf::from("/scratch/job/disc/track01.bin")
        );
        assert_eq!(
            safe_join(dest, Path::new("a/../b.bin")).unwrap(),
            PathBuf::from("/scratch/job/b.bin")
        );
        assert!(safe_join(dest, Path::new("../evil")).is_err());
        assert!(safe_join(dest, Path::new("/etc/passwd")).is_err());
        assert!(safe_join(dest, Path::new("./")).is_err());
    }

    #[test]
    fn fraction_is_clamped() {
        assert_eq!(fraction(0, 0), 1.0);
        assert_eq!(fraction(5, 10), 0.5);
        assert_eq!(fraction(20, 10), 1.0);
    }

    #[tokio::test]
    async fn ceiling_is_checked_before_work() {
        use futures::StreamExt;

        let tmp = tempfile::tempdir().unwrap();
        let source = tmp.path().join("big.bin");
        std::fs::write(&source, vec![0u8; 64]).unwrap();

        let request =
            ExtractRequest::new(&source, tmp.path().join("out")).with_size_ceiling(Some(16));
        let mut stream = blocking_stream(request, |_, _| {
            panic!("work must not start above the ceiling")
        });

        let first = stream.next().await.expect("error item");
        assert!(matches!(first, Err(IngestError::FileTooLarge { size: 64, limit: 16, .. })));
        assert!(stream.next().await.is_none());
    }
}
