//! Mime types understood by the built-in content decoders.

pub const PLAIN_TEXT: &str = "text/plain";
pub const MARKDOWN: &str = "text/markdown";
pub const HTML: &str = "text/html";
pub const JSON: &str = "application/json";
pub const CSV: &str = "text/csv";
pub const PDF: &str = "application/pdf";
pub const IMAGE_PNG: &str = "image/png";
pub const IMAGE_JPEG: &str = "image/jpeg";
pub const MS_WORD_X: &str =
    "application/vnd.openxmlformats-officedocument.wordprocessingml.document";
pub const MS_EXCEL_X: &str = "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet";
pub const MS_POWERPOINT_X: &str =
    "application/vnd.openxmlformats-officedocument.presentationml.presentation";
pub const OCTET_STREAM: &str = "application/octet-stream";

const EXTENSIONS: &[(&str, &str)] = &[
    ("txt", PLAIN_TEXT),
    ("text", PLAIN_TEXT),
    ("log", PLAIN_TEXT),
    ("md", MARKDOWN),
    ("markdown", MARKDOWN),
    ("htm", HTML),
    ("html", HTML),
    ("json", JSON),
    ("csv", CSV),
    ("pdf", PDF),
    ("png", IMAGE_PNG),
    ("jpg", IMAGE_JPEG),
    ("jpeg", IMAGE_JPEG),
    ("docx", MS_WORD_X),
    ("xlsx", MS_EXCEL_X),
    ("pptx", MS_POWERPOINT_X),
];

/// Guess a mime type from a file name extension.
///
/// Unknown extensions map to `application/octet-stream`, which no decoder
/// accepts, so the file is skipped during extraction.
pub fn from_file_name(name: &str) -> &'static str {
    let Some((_, ext)) = name.rsplit_once('.') else {
        return OCTET_STREAM;
    };
    let ext = ext.to_ascii_lowercase();
    EXTENSIONS
        .iter()
        .find(|(candidate, _)| *candidate == ext)
        .map(|(_, mime)| *mime)
        .unwrap_or(OCTET_STREAM)
}

/// Strip parameters such as `; charset=utf-8` and normalize case.
pub fn normalize(mime_type: &str) -> String {
    mime_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase()
}
