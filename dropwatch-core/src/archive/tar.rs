use std::fs::File;
use std::io::BufReader;
use std::sync::atomic::Ordering;

use tracing::debug;

use super::{
    ArchiveKind, CountingReader, EntrySink, ExtractRequest, ExtractionStream, ExtractorBackend,
    blocking_stream, corrupt_or_io, fraction, safe_join, write_entry,
};
use crate::error::{IngestError, Result};
use crate::fs_watch::filter::is_resource_fork;

/// Plain tar containers. Tar has no index, so progress follows bytes read.
#[derive(Debug, Default, Clone, Copy)]
pub struct TarExtractor;

impl ExtractorBackend for TarExtractor {
    fn kind(&self) -> ArchiveKind {
        ArchiveKind::Tar
    }

    fn extract(&self, request: ExtractRequest) -> ExtractionStream {
        blocking_stream(request, extract_tar)
    }
}

fn extract_tar(request: &ExtractRequest, sink: &mut EntrySink) -> Result<()> {
    let file = File::open(&request.source)?;
    let total = file.metadata()?.len();
    let (reader, consumed) = CountingReader::new(BufReader::new(file));
    let mut archive = ::tar::Archive::new(reader);
    let source = request.source.as_path();

    for entry in archive.entries().map_err(|err| corrupt_or_io(err, source))? {
        sink.checkpoint()?;

        let mut entry = entry.map_err(|err| corrupt_or_io(err, source))?;
        if !entry.header().entry_type().is_file() {
            continue;
        }

        let name = entry
            .path()
            .map_err(|err| corrupt_or_io(err, source))?
            .into_owned();
        if is_resource_fork(&name) {
            continue;
        }

        let target = safe_join(&request.destination, &name)?;
        let expected = entry.size();
        let written = write_entry(&mut entry, &target)?;
        if written < expected {
            return Err(IngestError::ExtractionFailed(format!(
                "tar entry '{}' truncated: {written} of {expected} bytes",
                name.display()
            )));
        }
        debug!(entry = %name.display(), bytes = written, "tar entry extracted");

        sink.emit(target, fraction(consumed.load(Ordering::Relaxed), total))?;
    }

    Ok(())
}
