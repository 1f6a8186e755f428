use std::fs;
use std::io::{self, Cursor, Read};
use std::path::PathBuf;

use sevenz_rust::{Password, SevenZReader};
use tracing::debug;

use super::{
    ArchiveKind, EntrySink, ExtractRequest, ExtractionStream, ExtractorBackend, blocking_stream,
    fraction, safe_join, write_entry,
};
use crate::error::{IngestError, Result};
use crate::fs_watch::filter::is_resource_fork;

/// 7z containers. The codec needs random access over the whole container, so
/// the archive is loaded into memory and subject to the size ceiling.
#[derive(Debug, Default, Clone, Copy)]
pub struct SevenZipExtractor;

impl ExtractorBackend for SevenZipExtractor {
    fn kind(&self) -> ArchiveKind {
        ArchiveKind::SevenZip
    }

    fn buffers_whole_archive(&self) -> bool {
        true
    }

    fn extract(&self, request: ExtractRequest) -> ExtractionStream {
        blocking_stream(request, extract_7z)
    }
}

fn extract_7z(request: &ExtractRequest, sink: &mut EntrySink) -> Result<()> {
    let bytes = fs::read(&request.source)?;
    let len = bytes.len() as u64;
    let mut reader =
        SevenZReader::new(Cursor::new(bytes), len, Password::empty()).map_err(sevenz_error)?;

    let total = reader
        .archive()
        .files
        .iter()
        .filter(|entry| entry.has_stream() && !entry.is_directory())
        .count() as u64;

    let mut done = 0u64;
    let mut failure: Option<IngestError> = None;

    reader
        .for_each_entries(|entry, data| {
            if entry.is_directory() || !entry.has_stream() {
                return Ok(true);
            }

            done += 1;
            let step = extract_entry(request, sink, entry.name(), data, fraction(done, total));

            match step {
                Ok(()) => Ok(true),
                Err(err) => {
                    failure = Some(err);
                    Ok(false)
                }
            }
        })
        .map_err(sevenz_error)?;

    match failure {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

fn extract_entry(
    request: &ExtractRequest,
    sink: &mut EntrySink,
    name: &str,
    data: &mut dyn Read,
    progress: f32,
) -> Result<()> {
    sink.checkpoint()?;
    let name = PathBuf::from(name);
    if is_resource_fork(&name) {
        io::copy(data, &mut io::sink())?;
        return Ok(());
    }
    let target = safe_join(&request.destination, &name)?;
    let written = write_entry(data, &target)?;
    debug!(entry = %name.display(), bytes = written, "7z entry extracted");
    sink.emit(target, progress)
}

fn sevenz_error(err: sevenz_rust::Error) -> IngestError {
    IngestError::ExtractionFailed(format!("7z: {err}"))
}
