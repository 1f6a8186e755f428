use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;

use super::bzip2::Bzip2Extractor;
use super::gzip::GzipExtractor;
use super::sevenz::SevenZipExtractor;
use super::tar::TarExtractor;
use super::zip::ZipExtractor;
use super::{ArchiveKind, ExtractorBackend};

/// Dispatch table from [`ArchiveKind`] to backend.
#[derive(Clone)]
pub struct ExtractorRegistry {
    backends: HashMap<ArchiveKind, Arc<dyn ExtractorBackend>>,
}

impl fmt::Debug for ExtractorRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut kinds: Vec<_> = self.backends.keys().map(ArchiveKind::as_str).collect();
        kinds.sort_unstable();
        f.debug_struct("ExtractorRegistry")
            .field("kinds", &kinds)
            .finish()
    }
}

impl Default for ExtractorRegistry {
    fn default() -> Self {
        Self::with_builtin_backends()
    }
}

impl ExtractorRegistry {
    /// Registry without any backend; every file is a pass-through.
    pub fn empty() -> Self {
        Self {
            backends: HashMap::new(),
        }
    }

    pub fn with_builtin_backends() -> Self {
        let mut registry = Self::empty();
        registry.register(Arc::new(ZipExtractor));
        registry.register(Arc::new(SevenZipExtractor));
        registry.register(Arc::new(TarExtractor));
        registry.register(Arc::new(Bzip2Extractor));
        registry.register(Arc::new(GzipExtractor));
        registry
    }

    /// Install or replace the backend for its kind.
    pub fn register(&mut self, backend: Arc<dyn ExtractorBackend>) -> &mut Self {
        self.backends.insert(backend.kind(), backend);
        self
    }

    pub fn backend(&self, kind: ArchiveKind) -> Option<Arc<dyn ExtractorBackend>> {
        self.backends.get(&kind).cloned()
    }

    /// `None` means the file is not an archive and passes through untouched.
    pub fn backend_for(&self, path: &Path) -> Option<Arc<dyn ExtractorBackend>> {
        ArchiveKind::from_path(path).and_then(|kind| self.backend(kind))
    }
}
