//! Tantivy-backed index writer.
//!
//! Wraps DocumentIndexer from outbox-search. Each `apply` call becomes one
//! committed change set.

use std::sync::Arc;

use tracing::debug;

use outbox_search::{DocumentChange, DocumentIndexer, IndexedDocument};

use crate::error::IndexingError;
use crate::operation::IndexOperation;
use crate::writer::IndexWriter;

/// Index writer over the full-text search index.
pub struct SearchIndexWriter {
    indexer: Arc<DocumentIndexer>,
}

impl SearchIndexWriter {
    pub fn new(indexer: Arc<DocumentIndexer>) -> Self {
        Self { indexer }
    }

    fn to_change(operation: &IndexOperation) -> DocumentChange {
        match operation {
            IndexOperation::Upsert {
                document_id,
                entity_name,
                fields,
            } => DocumentChange::Upsert(IndexedDocument::new(
                document_id.clone(),
                entity_name.clone(),
                fields.clone(),
            )),
            IndexOperation::Delete { document_id } => DocumentChange::Delete {
                doc_id: document_id.clone(),
            },
        }
    }
}

impl IndexWriter for SearchIndexWriter {
    fn apply(&self, operations: &[IndexOperation]) -> Result<(), IndexingError> {
        if operations.is_empty() {
            return Ok(());
        }
        let changes: Vec<DocumentChange> = operations.iter().map(Self::to_change).collect();
        let opstamp = self.indexer.apply(&changes)?;
        debug!(opstamp, operations = operations.len(), "Applied index operations");
        Ok(())
    }

    fn name(&self) -> &str {
        "search"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use outbox_search::{DocumentReader, SearchIndex, SearchIndexConfig};
    use serde_json::json;
    use tempfile::TempDir;

    #[test]
    fn test_apply_upsert_and_delete() {
        let temp_dir = TempDir::new().unwrap();
        let index = SearchIndex::open_or_create(SearchIndexConfig::new(temp_dir.path())).unwrap();
        let writer = SearchIndexWriter::new(Arc::new(DocumentIndexer::new(&index).unwrap()));
        let reader = DocumentReader::new(&index).unwrap();

        let upsert = IndexOperation::Upsert {
            document_id: "book:1".into(),
            entity_name: "book".into(),
            fields: json!({"title": "Dune"}).as_object().unwrap().clone(),
        };
        writer.apply(&[upsert.clone()]).unwrap();
        writer.apply(&[upsert]).unwrap();
        reader.reload().unwrap();
        assert_eq!(reader.num_docs(), 1);
        assert_eq!(reader.get("book:1").unwrap().unwrap().entity_name, "book");

        writer
            .apply(&[IndexOperation::Delete {
                document_id: "book:1".into(),
            }])
            .unwrap();
        reader.reload().unwrap();
        assert!(reader.get("book:1").unwrap().is_none());
        assert_eq!(writer.name(), "search");
    }
}
