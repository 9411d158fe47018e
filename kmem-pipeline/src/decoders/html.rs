use async_trait::async_trait;
use kmem_core::mime;

use super::{ContentDecoder, FileContent};
use crate::errors::PipelineResult;

#[derive(Debug, Clone, Copy)]
pub struct HtmlDecoder {
    width: usize,
}

impl Default for HtmlDecoder {
    fn default() -> Self {
        Self { width: 80 }
    }
}

#[async_trait]
impl ContentDecoder for HtmlDecoder {
    fn mime_types(&self) -> &[&'static str] {
        &[mime::HTML]
    }

    async fn extract_content(
        &self,
        _name: &str,
        bytes: &[u8],
        _mime_type: &str,
    ) -> PipelineResult<FileContent> {
        let text = html2text::from_read(bytes, self.width);
        let mut content = FileContent::new(mime::PLAIN_TEXT);
        content.push_section(1, text);
        Ok(content)
    }
}
