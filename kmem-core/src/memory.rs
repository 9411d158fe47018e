//! Memory records stored in vector databases, and the filters used to
//! select them.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::tags::{TAG_DOCUMENT_ID, TagCollection};

pub const PAYLOAD_TEXT: &str = "text";
pub const PAYLOAD_FILE: &str = "file";
pub const PAYLOAD_LAST_UPDATE: &str = "last_update";
pub const PAYLOAD_VECTOR_PROVIDER: &str = "vector_provider";

/// One embedded, indexed chunk.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MemoryRecord {
    pub id: String,
    pub vector: Vec<f32>,
    #[serde(default)]
    pub tags: TagCollection,
    #[serde(default)]
    pub payload: Map<String, Value>,
}

impl MemoryRecord {
    /// Deterministic record id for a partition of an uploaded file.
    ///
    /// The same document, file and partition number always map to the same
    /// id, so re-running a pipeline overwrites records instead of adding
    /// new ones.
    pub fn build_id(document_id: &str, file_name: &str, partition_number: u32) -> String {
        format!("d={document_id}//f={file_name}//p={partition_number}")
    }

    pub fn document_id(&self) -> Option<&str> {
        self.tags.first(TAG_DOCUMENT_ID)
    }

    pub fn text(&self) -> Option<&str> {
        self.payload.get(PAYLOAD_TEXT).and_then(Value::as_str)
    }
}

/// Tag based filter: a record matches when it carries every pair.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MemoryFilter(TagCollection);

impl MemoryFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn by_document(document_id: &str) -> Self {
        Self::new().by_tag(TAG_DOCUMENT_ID, document_id)
    }

    pub fn by_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.0.add(key, value);
        self
    }

    pub fn tags(&self) -> &TagCollection {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn matches(&self, tags: &TagCollection) -> bool {
        self.0.pairs().all(|(k, v)| tags.contains(k, v))
    }
}

/// A record matches a filter list when any filter matches; an empty list
/// matches everything.
pub fn matches_any(filters: &[MemoryFilter], tags: &TagCollection) -> bool {
    filters.is_empty() || filters.iter().any(|f| f.matches(tags))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record_tags() -> TagCollection {
        TagCollection::new()
            .with(TAG_DOCUMENT_ID, "doc1")
            .with("user", "alice")
            .with("user", "bob")
    }

    #[test]
    fn record_id_is_deterministic() {
        let a = MemoryRecord::build_id("doc1", "report.pdf", 3);
        let b = MemoryRecord::build_id("doc1", "report.pdf", 3);
        assert_eq!(a, b);
        assert_ne!(a, MemoryRecord::build_id("doc1", "report.pdf", 4));
    }

    #[test]
    fn filter_requires_all_pairs() {
        let tags = record_tags();
        assert!(MemoryFilter::by_document("doc1").by_tag("user", "bob").matches(&tags));
        assert!(!MemoryFilter::by_document("doc1").by_tag("user", "carol").matches(&tags));
    }

    #[test]
    fn filter_list_is_a_disjunction() {
        let tags = record_tags();
        let filters = vec![
            MemoryFilter::by_document("doc2"),
            MemoryFilter::new().by_tag("user", "alice"),
        ];
        assert!(matches_any(&filters, &tags));
        assert!(matches_any(&[], &tags));
        assert!(!matches_any(&filters[..1], &tags));
    }
}
