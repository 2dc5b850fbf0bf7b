//! Document mapping between entity fields and Tantivy documents.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tantivy::doc;
use tantivy::schema::Value as _;
use tantivy::TantivyDocument;

use crate::error::SearchError;
use crate::schema::SearchSchema;

/// The indexable form of one entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexedDocument {
    /// Stable key; one live document per id
    pub doc_id: String,
    pub entity_name: String,
    pub fields: Map<String, Value>,
}

impl IndexedDocument {
    pub fn new(
        doc_id: impl Into<String>,
        entity_name: impl Into<String>,
        fields: Map<String, Value>,
    ) -> Self {
        Self {
            doc_id: doc_id.into(),
            entity_name: entity_name.into(),
            fields,
        }
    }

    /// All string and number leaves, space-joined, for the text field.
    pub fn searchable_text(&self) -> String {
        let mut parts = Vec::new();
        for value in self.fields.values() {
            collect_text(value, &mut parts);
        }
        parts.join(" ")
    }

    /// Convert to a Tantivy document.
    pub fn to_tantivy(&self, schema: &SearchSchema) -> Result<TantivyDocument, SearchError> {
        let source = serde_json::to_string(&self.fields)?;
        Ok(doc!(
            schema.doc_id => self.doc_id.clone(),
            schema.entity_name => self.entity_name.clone(),
            schema.text => self.searchable_text(),
            schema.source => source
        ))
    }

    /// Rebuild from a stored Tantivy document.
    pub fn from_tantivy(schema: &SearchSchema, doc: &TantivyDocument) -> Result<Self, SearchError> {
        let doc_id = doc
            .get_first(schema.doc_id)
            .and_then(|v| v.as_str())
            .ok_or_else(|| SearchError::InvalidDocument("missing doc_id".into()))?
            .to_string();
        let entity_name = doc
            .get_first(schema.entity_name)
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string();
        let source = doc
            .get_first(schema.source)
            .and_then(|v| v.as_str())
            .unwrap_or("{}");
        let fields: Map<String, Value> = serde_json::from_str(source)?;

        Ok(Self {
            doc_id,
            entity_name,
            fields,
        })
    }
}

fn collect_text(value: &Value, parts: &mut Vec<String>) {
    match value {
        Value::String(s) => parts.push(s.clone()),
        Value::Number(n) => parts.push(n.to_string()),
        Value::Array(items) => items.iter().for_each(|v| collect_text(v, parts)),
        Value::Object(map) => map.values().for_each(|v| collect_text(v, parts)),
        Value::Bool(_) | Value::Null => {}
    }
}

/// One change to the index.
#[derive(Debug, Clone, PartialEq)]
pub enum DocumentChange {
    /// Replace whatever is stored under the document's id
    Upsert(IndexedDocument),
    /// Remove the document with this id, if any
    Delete { doc_id: String },
}

impl DocumentChange {
    pub fn doc_id(&self) -> &str {
        match self {
            DocumentChange::Upsert(doc) => &doc.doc_id,
            DocumentChange::Delete { doc_id } => doc_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::build_document_schema;
    use serde_json::json;

    fn book() -> IndexedDocument {
        let fields = json!({
            "title": "Dune",
            "year": 1965,
            "tags": ["sf", "classic"],
            "meta": {"publisher": "Chilton", "reprint": false}
        });
        IndexedDocument::new("book:1", "book", fields.as_object().unwrap().clone())
    }

    #[test]
    fn test_searchable_text_collects_leaves() {
        let text = book().searchable_text();
        for word in ["Dune", "1965", "sf", "classic", "Chilton"] {
            assert!(text.contains(word), "missing {} in {}", word, text);
        }
        assert!(!text.contains("false"));
    }

    #[test]
    fn test_tantivy_roundtrip() {
        let schema = build_document_schema();
        let original = book();
        let doc = original.to_tantivy(&schema).unwrap();
        let decoded = IndexedDocument::from_tantivy(&schema, &doc).unwrap();
        assert_eq!(decoded, original);
    }

    #[test]
    fn test_change_doc_id() {
        assert_eq!(DocumentChange::Upsert(book()).doc_id(), "book:1");
        let delete = DocumentChange::Delete {
            doc_id: "book:2".into(),
        };
        assert_eq!(delete.doc_id(), "book:2");
    }
}
