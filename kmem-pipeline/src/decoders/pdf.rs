use async_trait::async_trait;
use kmem_core::mime;
use lopdf::Document;

use super::{ContentDecoder, FileContent};
use crate::errors::{PipelineError, PipelineResult};

/// Text layer of a PDF, one section per page. Scanned pages without a
/// text layer produce no section.
#[derive(Debug, Clone, Copy, Default)]
pub struct PdfDecoder;

fn extract_pages(name: &str, bytes: &[u8]) -> PipelineResult<FileContent> {
    let document = Document::load_mem(bytes)
        .map_err(|e| PipelineError::Decode(format!("{name}: {e}")))?;

    let mut content = FileContent::new(mime::PLAIN_TEXT);
    for page_number in document.get_pages().keys() {
        let text = document
            .extract_text(&[*page_number])
            .map_err(|e| PipelineError::Decode(format!("{name} page {page_number}: {e}")))?;
        content.push_section(*page_number, text);
    }
    Ok(content)
}

#[async_trait]
impl ContentDecoder for PdfDecoder {
    fn mime_types(&self) -> &[&'static str] {
        &[mime::PDF]
    }

    async fn extract_content(
        &self,
        name: &str,
        bytes: &[u8],
        _mime_type: &str,
    ) -> PipelineResult<FileContent> {
        let name = name.to_string();
        let bytes = bytes.to_vec();
        tokio::task::spawn_blocking(move || extract_pages(&name, &bytes))
            .await
            .map_err(|e| PipelineError::Decode(format!("pdf worker failed: {e}")))?
    }
}
