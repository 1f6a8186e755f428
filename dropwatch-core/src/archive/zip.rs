use std::fs::File;
use std::io::BufReader;

use tracing::debug;

use super::{
    ArchiveKind, EntrySink, ExtractRequest, ExtractionStream, ExtractorBackend, blocking_stream,
    fraction, safe_join, write_entry,
};
use crate::error::{IngestError, Result};
use crate::fs_watch::filter::is_resource_fork;

/// Zip containers; progress is proportional to entries processed.
#[derive(Debug, Default, Clone, Copy)]
pub struct ZipExtractor;

impl ExtractorBackend for ZipExtractor {
    fn kind(&self) -> ArchiveKind {
        ArchiveKind::Zip
    }

    fn extract(&self, request: ExtractRequest) -> ExtractionStream {
        blocking_stream(request, extract_zip)
    }
}

fn extract_zip(request: &ExtractRequest, sink: &mut EntrySink) -> Result<()> {
    let file = BufReader::new(File::open(&request.source)?);
    let mut archive = ::zip::ZipArchive::new(file).map_err(zip_error)?;
    let total = archive.len() as u64;

    for index in 0..archive.len() {
        sink.checkpoint()?;

        let mut entry = archive.by_index(index).map_err(zip_error)?;
        if entry.is_dir() {
            continue;
        }

        let Some(name) = entry.enclosed_name() else {
            return Err(IngestError::ExtractionFailed(format!(
                "zip entry '{}' escapes the extraction directory",
                entry.name()
            )));
        };
        if is_resource_fork(&name) {
            continue;
        }

        let target = safe_join(&request.destination, &name)?;
        let written = write_entry(&mut entry, &target)?;
        debug!(entry = %name.display(), bytes = written, "zip entry extracted");

        sink.emit(target, fraction(index as u64 + 1, total))?;
    }

    Ok(())
}

fn zip_error(err: ::zip::result::ZipError) -> IngestError {
    match err {
        ::zip::result::ZipError::Io(io) => {
            IngestError::ExtractionFailed(format!("zip read failed: {io}"))
        }
        other => IngestError::ExtractionFailed(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::path::Path;

    use futures::StreamExt;
    use ::zip::write::SimpleFileOptions;

    use super::*;

    fn build_zip(path: &Path, entries: &[(&str, &[u8])]) {
        let mut writer = ::zip::ZipWriter::new(File::create(path).unwrap());
        for (name, body) in entries {
            writer
                .start_file(*name, SimpleFileOptions::default())
                .unwrap();
            writer.write_all(body).unwrap();
        }
        writer.finish().unwrap();
    }

    #[tokio::test]
    async fn streams_entries_with_progress() {
        let tmp = tempfile::tempdir().unwrap();
        let source = tmp.path().join("pack.zip");
        build_zip(
            &source,
            &[
                ("disc/game.cue", b"FILE game.bin BINARY"),
                ("disc/game.bin", &[7u8; 2048]),
                ("__MACOSX/disc/._game.bin", b"fork"),
            ],
        );
        let out = tmp.path().join("out");

        let items: Vec<_> = ZipExtractor
            .extract(ExtractRequest::new(&source, &out))
            .collect()
            .await;

        let items: Vec<_> = items.into_iter().map(|item| item.unwrap()).collect();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].path, out.join("disc/game.cue"));
        assert_eq!(std::fs::read(&items[1].path).unwrap(), vec![7u8; 2048]);
        assert!(items[0].progress < items[1].progress);
        assert!(!out.join("__MACOSX").exists());
    }

    #[tokio::test]
    async fn garbage_is_reported_as_extraction_failure() {
        let tmp = tempfile::tempdir().unwrap();
        let source = tmp.path().join("broken.zip");
        std::fs::write(&source, b"PK\x03\x04 definitely not a zip").unwrap();

        let items: Vec<_> = ZipExtractor
            .extract(ExtractRequest::new(&source, tmp.path().join("out")))
            .collect()
            .await;

        assert_eq!(items.len(), 1);
        assert!(matches!(items[0], Err(IngestError::ExtractionFailed(_))));
    }
}
