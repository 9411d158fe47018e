use async_trait::async_trait;
use kmem_core::mime;

use super::{ContentDecoder, FileContent};
use crate::errors::{PipelineError, PipelineResult};

fn utf8(name: &str, bytes: &[u8]) -> PipelineResult<String> {
    String::from_utf8(bytes.to_vec())
        .map_err(|e| PipelineError::Decode(format!("{name} is not valid UTF-8: {e}")))
}

/// Plain text, CSV and JSON: the whole file is one section.
#[derive(Debug, Clone, Copy, Default)]
pub struct PlainTextDecoder;

#[async_trait]
impl ContentDecoder for PlainTextDecoder {
    fn mime_types(&self) -> &[&'static str] {
        &[mime::PLAIN_TEXT, mime::CSV, mime::JSON]
    }

    async fn extract_content(
        &self,
        name: &str,
        bytes: &[u8],
        mime_type: &str,
    ) -> PipelineResult<FileContent> {
        let mut content = FileContent::new(mime::normalize(mime_type));
        content.push_section(1, utf8(name, bytes)?);
        Ok(content)
    }
}

/// Markdown is kept as-is so headings and lists survive into the chunks.
#[derive(Debug, Clone, Copy, Default)]
pub struct MarkdownDecoder;

#[async_trait]
impl ContentDecoder for MarkdownDecoder {
    fn mime_types(&self) -> &[&'static str] {
        &[mime::MARKDOWN]
    }

    async fn extract_content(
        &self,
        name: &str,
        bytes: &[u8],
        _mime_type: &str,
    ) -> PipelineResult<FileContent> {
        let mut content = FileContent::new(mime::MARKDOWN);
        content.push_section(1, utf8(name, bytes)?);
        Ok(content)
    }
}
