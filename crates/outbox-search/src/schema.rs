//! Tantivy schema for entity documents.
//!
//! Every document carries:
//! - doc_id: stable `{entity}:{id}` key used for replace/delete
//! - entity_name: entity type, for filtering
//! - text: concatenated string values, for full-text matching
//! - source: the original JSON fields, stored for retrieval

use tantivy::schema::{Field, Schema, STORED, STRING, TEXT};

use crate::SearchError;

/// Schema field handles for efficient access
#[derive(Debug, Clone)]
pub struct SearchSchema {
    schema: Schema,
    /// Primary key (STRING | STORED)
    pub doc_id: Field,
    /// Entity type (STRING | STORED)
    pub entity_name: Field,
    /// Searchable text (TEXT)
    pub text: Field,
    /// JSON-encoded fields (STORED)
    pub source: Field,
}

impl SearchSchema {
    /// Get the underlying Tantivy schema
    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    /// Create a SearchSchema from an existing Tantivy Schema
    pub fn from_schema(schema: Schema) -> Result<Self, SearchError> {
        let doc_id = schema
            .get_field("doc_id")
            .map_err(|_| SearchError::SchemaMismatch("missing doc_id field".into()))?;
        let entity_name = schema
            .get_field("entity_name")
            .map_err(|_| SearchError::SchemaMismatch("missing entity_name field".into()))?;
        let text = schema
            .get_field("text")
            .map_err(|_| SearchError::SchemaMismatch("missing text field".into()))?;
        let source = schema
            .get_field("source")
            .map_err(|_| SearchError::SchemaMismatch("missing source field".into()))?;

        Ok(Self {
            schema,
            doc_id,
            entity_name,
            text,
            source,
        })
    }
}

/// Build the entity document schema.
pub fn build_document_schema() -> SearchSchema {
    let mut schema_builder = Schema::builder();

    let doc_id = schema_builder.add_text_field("doc_id", STRING | STORED);
    let entity_name = schema_builder.add_text_field("entity_name", STRING | STORED);
    let text = schema_builder.add_text_field("text", TEXT);
    let source = schema_builder.add_text_field("source", STORED);

    let schema = schema_builder.build();

    SearchSchema {
        schema,
        doc_id,
        entity_name,
        text,
        source,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_schema() {
        let schema = build_document_schema();
        assert!(schema.schema.get_field("doc_id").is_ok());
        assert!(schema.schema.get_field("entity_name").is_ok());
        assert!(schema.schema.get_field("text").is_ok());
        assert!(schema.schema.get_field("source").is_ok());
    }

    #[test]
    fn test_from_schema() {
        let original = build_document_schema();
        let rebuilt = SearchSchema::from_schema(original.schema().clone()).unwrap();
        assert_eq!(rebuilt.doc_id, original.doc_id);
        assert_eq!(rebuilt.source, original.source);
    }

    #[test]
    fn test_from_foreign_schema_fails() {
        let mut builder = Schema::builder();
        builder.add_text_field("title", TEXT);
        let result = SearchSchema::from_schema(builder.build());
        assert!(matches!(result, Err(SearchError::SchemaMismatch(_))));
    }
}
