//! Index lifecycle.
//!
//! An index directory either holds an index with the document schema or
//! is empty; opening one with any other schema fails instead of silently
//! writing documents the reader cannot decode.

use std::path::{Path, PathBuf};

use tantivy::directory::MmapDirectory;
use tantivy::{Index, IndexReader, IndexWriter, ReloadPolicy, TantivyError};
use tracing::{debug, info};

use crate::error::SearchError;
use crate::schema::{build_document_schema, SearchSchema};

/// Writer heap in MB. Tantivy needs at least 15MB per indexing thread.
const DEFAULT_WRITER_HEAP_MB: usize = 50;

#[derive(Debug, Clone)]
pub struct SearchIndexConfig {
    pub index_path: PathBuf,
    /// Writer heap budget, shared by all indexing threads
    pub writer_heap_mb: usize,
}

impl SearchIndexConfig {
    pub fn new(index_path: impl Into<PathBuf>) -> Self {
        Self {
            index_path: index_path.into(),
            writer_heap_mb: DEFAULT_WRITER_HEAP_MB,
        }
    }

    pub fn with_writer_heap_mb(mut self, mb: usize) -> Self {
        self.writer_heap_mb = mb;
        self
    }
}

/// A Tantivy index holding entity documents.
pub struct SearchIndex {
    index: Index,
    schema: SearchSchema,
    config: SearchIndexConfig,
}

impl SearchIndex {
    /// Open the index at the configured path, creating it if the directory
    /// holds none.
    pub fn open_or_create(config: SearchIndexConfig) -> Result<Self, SearchError> {
        let index = open_or_create_index(&config.index_path)?;
        let schema = SearchSchema::from_schema(index.schema())?;
        info!(path = ?config.index_path, "Opened search index");
        Ok(Self {
            index,
            schema,
            config,
        })
    }

    pub fn schema(&self) -> &SearchSchema {
        &self.schema
    }

    pub fn index(&self) -> &Index {
        &self.index
    }

    pub fn path(&self) -> &Path {
        &self.config.index_path
    }

    /// The single writer of this index.
    ///
    /// Tantivy admits one writer per index directory; while it is alive,
    /// further calls fail with [`SearchError::IndexLocked`].
    pub fn writer(&self) -> Result<IndexWriter, SearchError> {
        let heap = self.config.writer_heap_mb * 1024 * 1024;
        let writer = self.index.writer(heap).map_err(|e| match e {
            TantivyError::LockFailure(..) => SearchError::IndexLocked(e.to_string()),
            other => SearchError::Tantivy(other),
        })?;
        debug!(heap_mb = self.config.writer_heap_mb, "Created index writer");
        Ok(writer)
    }

    /// A reader that picks up commits shortly after they land.
    ///
    /// Call `reload` on it to see a commit immediately.
    pub fn reader(&self) -> Result<IndexReader, SearchError> {
        Ok(self
            .index
            .reader_builder()
            .reload_policy(ReloadPolicy::OnCommitWithDelay)
            .try_into()?)
    }
}

/// Open the index in `path` or create one with the document schema.
pub fn open_or_create_index(path: &Path) -> Result<Index, SearchError> {
    std::fs::create_dir_all(path)?;
    let directory = MmapDirectory::open(path).map_err(TantivyError::from)?;
    let schema = build_document_schema();

    Index::open_or_create(directory, schema.schema().clone()).map_err(|e| match e {
        TantivyError::SchemaError(reason) => SearchError::SchemaMismatch(reason),
        other => SearchError::Tantivy(other),
    })
}
