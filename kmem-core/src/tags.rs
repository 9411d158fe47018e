//! Multi-valued tag collections attached to documents and memory records.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Tag holding the id of the document a record was derived from.
pub const TAG_DOCUMENT_ID: &str = "__document_id";
/// Tag holding the id of the uploaded file a record was derived from.
pub const TAG_FILE_ID: &str = "__file_id";
/// Tag holding the name of the uploaded file.
pub const TAG_FILE_NAME: &str = "__file_name";
/// Tag holding the mime type of the uploaded file.
pub const TAG_FILE_TYPE: &str = "__file_type";
/// Tag holding the id of the partition artifact.
pub const TAG_FILE_PART: &str = "__file_part";
/// Tag holding the partition number inside the uploaded file.
pub const TAG_PARTITION_NUMBER: &str = "__part_n";
/// Tag holding the section (page) number the partition came from.
pub const TAG_SECTION_NUMBER: &str = "__sect_n";

/// Prefix reserved for tags set by the pipeline itself.
pub const RESERVED_TAG_PREFIX: &str = "__";

/// Ordered `key -> [values]` map. A key may carry several values.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TagCollection(BTreeMap<String, Vec<String>>);

impl TagCollection {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a value under `key`, ignoring exact duplicates.
    pub fn add(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let values = self.0.entry(key.into()).or_default();
        let value = value.into();
        if !values.contains(&value) {
            values.push(value);
        }
    }

    /// Builder-style variant of [`TagCollection::add`].
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.add(key, value);
        self
    }

    /// Replace every value under `key` with a single value.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), vec![value.into()]);
    }

    pub fn get(&self, key: &str) -> Option<&[String]> {
        self.0.get(key).map(Vec::as_slice)
    }

    /// First value stored under `key`.
    pub fn first(&self, key: &str) -> Option<&str> {
        self.0
            .get(key)
            .and_then(|values| values.first())
            .map(String::as_str)
    }

    pub fn contains(&self, key: &str, value: &str) -> bool {
        self.0
            .get(key)
            .is_some_and(|values| values.iter().any(|v| v == value))
    }

    /// Merge every pair of `other` into `self`.
    pub fn extend(&mut self, other: &TagCollection) {
        for (key, value) in other.pairs() {
            self.add(key, value);
        }
    }

    /// Iterate over flattened `(key, value)` pairs.
    pub fn pairs(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0
            .iter()
            .flat_map(|(k, values)| values.iter().map(move |v| (k.as_str(), v.as_str())))
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the collection uses a key reserved for the pipeline.
    pub fn has_reserved_keys(&self) -> bool {
        self.0.keys().any(|k| k.starts_with(RESERVED_TAG_PREFIX))
    }
}

impl<K, V> FromIterator<(K, V)> for TagCollection
where
    K: Into<String>,
    V: Into<String>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut tags = TagCollection::new();
        for (k, v) in iter {
            tags.add(k, v);
        }
        tags
    }
}
