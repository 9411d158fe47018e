//! Content decoders turn uploaded bytes into text sections.
//!
//! Decoders are looked up by normalized mime type in a [`DecoderRegistry`].
//! A file whose type has no decoder is skipped during extraction.

mod html;
pub(crate) mod pdf;
mod text;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use kmem_core::mime;
use serde::{Deserialize, Serialize};

use crate::errors::{PipelineError, PipelineResult};

pub use html::HtmlDecoder;
pub use pdf::PdfDecoder;
pub use text::{MarkdownDecoder, PlainTextDecoder};

/// One page or logical section of a decoded file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileSection {
    /// 1-based page or section number.
    pub number: u32,
    pub text: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileContent {
    pub mime_type: String,
    pub sections: Vec<FileSection>,
}

impl FileContent {
    pub fn new(mime_type: impl Into<String>) -> Self {
        Self {
            mime_type: mime_type.into(),
            sections: Vec::new(),
        }
    }

    /// Append a section; blank text is dropped.
    pub fn push_section(&mut self, number: u32, text: impl Into<String>) {
        let text = text.into();
        let text = text.trim();
        if !text.is_empty() {
            self.sections.push(FileSection {
                number,
                text: text.to_string(),
            });
        }
    }

    pub fn is_empty(&self) -> bool {
        self.sections.is_empty()
    }
}

#[async_trait]
pub trait ContentDecoder: Send + Sync {
    /// Mime types this decoder accepts.
    fn mime_types(&self) -> &[&'static str];

    async fn extract_content(
        &self,
        name: &str,
        bytes: &[u8],
        mime_type: &str,
    ) -> PipelineResult<FileContent>;
}

/// Lookup table from mime type to decoder.
#[derive(Clone, Default)]
pub struct DecoderRegistry {
    decoders: HashMap<String, Arc<dyn ContentDecoder>>,
}

impl DecoderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in text, markdown, html and pdf decoders.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(PlainTextDecoder));
        registry.register(Arc::new(MarkdownDecoder));
        registry.register(Arc::new(HtmlDecoder::default()));
        registry.register(Arc::new(PdfDecoder));
        registry
    }

    /// Register `decoder` for every mime type it declares, replacing any
    /// previous entry.
    pub fn register(&mut self, decoder: Arc<dyn ContentDecoder>) {
        for mime_type in decoder.mime_types() {
            self.decoders
                .insert(mime::normalize(mime_type), Arc::clone(&decoder));
        }
    }

    pub fn get(&self, mime_type: &str) -> Option<Arc<dyn ContentDecoder>> {
        self.decoders.get(&mime::normalize(mime_type)).cloned()
    }

    pub fn supports(&self, mime_type: &str) -> bool {
        self.decoders.contains_key(&mime::normalize(mime_type))
    }

    pub async fn extract_content(
        &self,
        name: &str,
        bytes: &[u8],
        mime_type: &str,
    ) -> PipelineResult<FileContent> {
        let decoder = self
            .get(mime_type)
            .ok_or_else(|| PipelineError::UnsupportedFormat(mime_type.to_string()))?;
        decoder.extract_content(name, bytes, mime_type).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn looks_up_by_normalized_mime_type() {
        let registry = DecoderRegistry::with_defaults();
        assert!(registry.supports("text/plain; charset=utf-8"));
        assert!(registry.supports(mime::PDF));
        assert!(!registry.supports(mime::IMAGE_PNG));

        let content = registry
            .extract_content("a.txt", b"  hello  ", "Text/Plain")
            .await
            .unwrap();
        assert_eq!(content.sections.len(), 1);
        assert_eq!(content.sections[0].text, "hello");
    }

    #[tokio::test]
    async fn unknown_mime_type_is_unsupported() {
        let registry = DecoderRegistry::with_defaults();
        let result = registry
            .extract_content("a.png", b"\x89PNG", mime::IMAGE_PNG)
            .await;
        assert!(matches!(result, Err(PipelineError::UnsupportedFormat(_))));
    }
}
