//! Document indexer for writing entity documents to the Tantivy index.
//!
//! The indexer wraps IndexWriter with shared access via Arc<Mutex>.
//! Documents are not visible until commit() is called.

use std::sync::{Arc, Mutex, MutexGuard};

use tantivy::{IndexWriter, Term};
use tracing::{debug, warn};

use crate::document::{DocumentChange, IndexedDocument};
use crate::error::SearchError;
use crate::index::SearchIndex;
use crate::schema::SearchSchema;

/// Manages document indexing operations.
///
/// Every write replaces by `doc_id`, which makes repeated application of
/// the same change harmless.
pub struct DocumentIndexer {
    writer: Arc<Mutex<IndexWriter>>,
    schema: SearchSchema,
}

impl DocumentIndexer {
    /// Create a new indexer from a SearchIndex.
    pub fn new(index: &SearchIndex) -> Result<Self, SearchError> {
        let writer = index.writer()?;
        let schema = index.schema().clone();

        Ok(Self {
            writer: Arc::new(Mutex::new(writer)),
            schema,
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, IndexWriter>, SearchError> {
        self.writer
            .lock()
            .map_err(|e| SearchError::IndexLocked(e.to_string()))
    }

    fn stage_upsert(&self, writer: &IndexWriter, doc: &IndexedDocument) -> Result<(), SearchError> {
        let tantivy_doc = doc.to_tantivy(&self.schema)?;
        writer.delete_term(Term::from_field_text(self.schema.doc_id, &doc.doc_id));
        writer.add_document(tantivy_doc)?;
        Ok(())
    }

    fn stage_delete(&self, writer: &IndexWriter, doc_id: &str) {
        writer.delete_term(Term::from_field_text(self.schema.doc_id, doc_id));
    }

    /// Index a document, replacing any document with the same id.
    pub fn upsert(&self, doc: &IndexedDocument) -> Result<(), SearchError> {
        let writer = self.lock()?;
        self.stage_upsert(&writer, doc)?;
        debug!(doc_id = %doc.doc_id, "Staged document upsert");
        Ok(())
    }

    /// Delete a document by ID.
    pub fn delete(&self, doc_id: &str) -> Result<(), SearchError> {
        let writer = self.lock()?;
        self.stage_delete(&writer, doc_id);
        debug!(doc_id, "Staged document delete");
        Ok(())
    }

    /// Stage and commit a set of changes as one unit.
    ///
    /// The writer stays locked for the whole call, so changes staged by
    /// other callers are never committed or rolled back halfway. On error
    /// everything uncommitted is rolled back.
    pub fn apply(&self, changes: &[DocumentChange]) -> Result<u64, SearchError> {
        let mut writer = self.lock()?;

        let staged: Result<(), SearchError> = changes.iter().try_for_each(|change| match change {
            DocumentChange::Upsert(doc) => self.stage_upsert(&writer, doc),
            DocumentChange::Delete { doc_id } => {
                self.stage_delete(&writer, doc_id);
                Ok(())
            }
        });

        let committed = staged.and_then(|_| writer.commit().map_err(SearchError::from));
        match committed {
            Ok(opstamp) => {
                debug!(opstamp, changes = changes.len(), "Committed change set");
                Ok(opstamp)
            }
            Err(e) => {
                if let Err(rollback_err) = writer.rollback() {
                    warn!(error = %rollback_err, "Rollback after failed change set failed");
                }
                warn!(error = %e, "Change set rolled back");
                Err(e)
            }
        }
    }

    /// Commit pending changes to make them searchable.
    pub fn commit(&self) -> Result<u64, SearchError> {
        let mut writer = self.lock()?;
        let opstamp = writer.commit()?;
        debug!(opstamp, "Committed index changes");
        Ok(opstamp)
    }

    /// Rollback uncommitted changes.
    pub fn rollback(&self) -> Result<u64, SearchError> {
        let mut writer = self.lock()?;
        let opstamp = writer.rollback()?;
        warn!(opstamp, "Rolled back index changes");
        Ok(opstamp)
    }
}
