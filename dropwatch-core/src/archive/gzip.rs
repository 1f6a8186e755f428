use flate2::read::MultiGzDecoder;

use super::{
    ArchiveKind, ExtractRequest, ExtractionStream, ExtractorBackend, blocking_stream,
    extract_single_stream,
};

/// Single gzip stream, written out under the source's stem.
#[derive(Debug, Default, Clone, Copy)]
pub struct GzipExtractor;

impl ExtractorBackend for GzipExtractor {
    fn kind(&self) -> ArchiveKind {
        ArchiveKind::Gzip
    }

    fn extract(&self, request: ExtractRequest) -> ExtractionStream {
        blocking_stream(request, |request, sink| {
            extract_single_stream(request, sink, MultiGzDecoder::new)
        })
    }
}
