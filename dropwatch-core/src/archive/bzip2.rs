use ::bzip2::read::MultiBzDecoder;

use super::{
    ArchiveKind, ExtractRequest, ExtractionStream, ExtractorBackend, blocking_stream,
    extract_single_stream,
};

/// Single bzip2 stream, written out under the source's stem.
#[derive(Debug, Default, Clone, Copy)]
pub struct Bzip2Extractor;

impl ExtractorBackend for Bzip2Extractor {
    fn kind(&self) -> ArchiveKind {
        ArchiveKind::Bzip2
    }

    fn extract(&self, request: ExtractRequest) -> ExtractionStream {
        blocking_stream(request, |request, sink| {
            extract_single_stream(request, sink, MultiBzDecoder::new)
        })
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use ::bzip2::Compression;
    use ::bzip2::write::BzEncoder;
    use futures::StreamExt;

    use super::*;

    #[tokio::test]
    async fn decompresses_single_payload() {
        let tmp = tempfile::tempdir().unwrap();
        let source = tmp.path().join("bios.rom.bz2");
        let mut encoder = BzEncoder::new(Vec::new(), Compression::best());
        encoder.write_all(&[0xAAu8; 10_000]).unwrap();
        std::fs::write(&source, encoder.finish().unwrap()).unwrap();
        let out = tmp.path().join("out");

        let items: Vec<_> = Bzip2Extractor
            .extract(ExtractRequest::new(&source, &out))
            .map(|item| item.unwrap())
            .collect()
            .await;

        assert_eq!(items.len(), 1);
        assert_eq!(items[0].path, out.join("bios.rom"));
        assert_eq!(std::fs::read(&items[0].path).unwrap(), vec![0xAAu8; 10_000]);
    }
}
