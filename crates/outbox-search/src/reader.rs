//! Read access to indexed documents by id.
//!
//! Query planning is out of scope; this reader exists so operators and
//! tests can check what the index holds for an entity.

use tantivy::collector::{Count, TopDocs};
use tantivy::query::{AllQuery, TermQuery};
use tantivy::schema::IndexRecordOption;
use tantivy::{IndexReader, TantivyDocument, Term};
use tracing::debug;

use crate::document::IndexedDocument;
use crate::error::SearchError;
use crate::index::SearchIndex;
use crate::schema::SearchSchema;

/// Reader over the current committed state of the index.
pub struct DocumentReader {
    reader: IndexReader,
    schema: SearchSchema,
}

impl DocumentReader {
    pub fn new(index: &SearchIndex) -> Result<Self, SearchError> {
        Ok(Self {
            reader: index.reader()?,
            schema: index.schema().clone(),
        })
    }

    /// Reload the reader to see recent commits.
    pub fn reload(&self) -> Result<(), SearchError> {
        self.reader.reload()?;
        debug!("Reloaded document reader");
        Ok(())
    }

    /// Look up the live document stored under `doc_id`.
    pub fn get(&self, doc_id: &str) -> Result<Option<IndexedDocument>, SearchError> {
        let searcher = self.reader.searcher();
        let query = TermQuery::new(
            Term::from_field_text(self.schema.doc_id, doc_id),
            IndexRecordOption::Basic,
        );

        let top_docs = searcher.search(&query, &TopDocs::with_limit(1))?;
        match top_docs.first() {
            Some((_, address)) => {
                let doc: TantivyDocument = searcher.doc(*address)?;
                Ok(Some(IndexedDocument::from_tantivy(&self.schema, &doc)?))
            }
            None => Ok(None),
        }
    }

    /// Every live document, ordered by id.
    pub fn all_documents(&self) -> Result<Vec<IndexedDocument>, SearchError> {
        let searcher = self.reader.searcher();
        let total = searcher.search(&AllQuery, &Count)?;
        if total == 0 {
            return Ok(Vec::new());
        }

        let top_docs = searcher.search(&AllQuery, &TopDocs::with_limit(total))?;
        let mut docs = Vec::with_capacity(top_docs.len());
        for (_, address) in top_docs {
            let doc: TantivyDocument = searcher.doc(address)?;
            docs.push(IndexedDocument::from_tantivy(&self.schema, &doc)?);
        }
        docs.sort_by(|a, b| a.doc_id.cmp(&b.doc_id));
        Ok(docs)
    }

    /// Get the number of live documents.
    pub fn num_docs(&self) -> u64 {
        let searcher = self.reader.searcher();
        searcher
            .segment_readers()
            .iter()
            .map(|r| r.num_docs() as u64)
            .sum()
    }
}
