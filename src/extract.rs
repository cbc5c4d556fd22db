//! Plain-text extraction for uploaded files.
//!
//! The local extractor needs UTF-8 text before it can chunk. This module
//! recognizes the allowed upload formats by extension (or media type) and
//! returns their text. Extraction never panics; failures come back as
//! [`RagError::DocumentProcessingFailed`].

use std::io::Read;

use ragline_core::error::{RagError, Result};

pub const MIME_TEXT: &str = "text/plain";
pub const MIME_MARKDOWN: &str = "text/markdown";
pub const MIME_HTML: &str = "text/html";
pub const MIME_PDF: &str = "application/pdf";
pub const MIME_DOCX: &str =
    "application/vnd.openxmlformats-officedocument.wordprocessingml.document";

/// Maximum decompressed bytes to read from a single ZIP entry (zip-bomb protection).
const MAX_XML_ENTRY_BYTES: u64 = 50 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentFormat {
    Text,
    Markdown,
    Html,
    Pdf,
    Docx,
}

impl DocumentFormat {
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_ascii_lowercase().as_str() {
            "txt" | "text" => Some(Self::Text),
            "md" | "markdown" => Some(Self::Markdown),
            "html" | "htm" => Some(Self::Html),
            "pdf" => Some(Self::Pdf),
            "docx" => Some(Self::Docx),
            _ => None,
        }
    }

    pub fn from_media_type(media_type: &str) -> Option<Self> {
        let base = media_type.split(';').next().unwrap_or("").trim();
        match base {
            MIME_TEXT => Some(Self::Text),
            MIME_MARKDOWN => Some(Self::Markdown),
            MIME_HTML => Some(Self::Html),
            MIME_PDF => Some(Self::Pdf),
            MIME_DOCX => Some(Self::Docx),
            _ => None,
        }
    }

    /// Canonical extension, as listed in `storage.allowed_types`.
    pub fn extension(&self) -> &'static str {
        match self {
            Self::Text => "txt",
            Self::Markdown => "md",
            Self::Html => "html",
            Self::Pdf => "pdf",
            Self::Docx => "docx",
        }
    }

    pub fn media_type(&self) -> &'static str {
        match self {
            Self::Text => MIME_TEXT,
            Self::Markdown => MIME_MARKDOWN,
            Self::Html => MIME_HTML,
            Self::Pdf => MIME_PDF,
            Self::Docx => MIME_DOCX,
        }
    }
}

/// Format of a file by its name's extension.
pub fn detect_format(filename: &str) -> Option<DocumentFormat> {
    std::path::Path::new(filename)
        .extension()
        .and_then(|e| e.to_str())
        .and_then(DocumentFormat::from_extension)
}

/// Extracts plain text from `bytes` in the given format.
pub fn extract_text(bytes: &[u8], format: DocumentFormat) -> Result<String> {
    match format {
        DocumentFormat::Text | DocumentFormat::Markdown => decode_utf8(bytes),
        DocumentFormat::Html => Ok(strip_html(&decode_utf8(bytes)?)),
        DocumentFormat::Pdf => extract_pdf(bytes),
        DocumentFormat::Docx => extract_docx(bytes),
    }
}

fn decode_utf8(bytes: &[u8]) -> Result<String> {
    String::from_utf8(bytes.to_vec()).map_err(|e| {
        RagError::DocumentProcessingFailed(format!("content is not valid UTF-8: {}", e))
    })
}

fn extract_pdf(bytes: &[u8]) -> Result<String> {
    pdf_extract::extract_text_from_mem(bytes)
        .map_err(|e| RagError::DocumentProcessingFailed(format!("PDF extraction failed: {}", e)))
}

fn ooxml_err(e: impl ToString) -> RagError {
    RagError::DocumentProcessingFailed(format!("DOCX extraction failed: {}", e.to_string()))
}

fn extract_docx(bytes: &[u8]) -> Result<String> {
    let mut archive = zip::ZipArchive::new(std::io::Cursor::new(bytes)).map_err(ooxml_err)?;
    let entry = archive.by_name("word/document.xml").map_err(ooxml_err)?;
    let mut doc_xml = Vec::new();
    entry
        .take(MAX_XML_ENTRY_BYTES)
        .read_to_end(&mut doc_xml)
        .map_err(ooxml_err)?;
    if doc_xml.len() as u64 >= MAX_XML_ENTRY_BYTES {
        return Err(ooxml_err("word/document.xml exceeds size limit"));
    }
    extract_paragraphs(&doc_xml)
}

/// Text of `<w:t>` runs, one line per `<w:p>` paragraph.
fn extract_paragraphs(xml: &[u8]) -> Result<String> {
    use quick_xml::events::Event;

    let mut out = String::new();
    let mut reader = quick_xml::Reader::from_reader(xml);
    let mut buf = Vec::new();
    let mut in_text = false;
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) if e.local_name().as_ref() == b"t" => in_text = true,
            Ok(Event::Text(te)) if in_text => {
                out.push_str(te.unescape().unwrap_or_default().as_ref());
            }
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"t" => in_text = false,
                b"p" => out.push('\n'),
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(e) => return Err(ooxml_err(e)),
            _ => {}
        }
        buf.clear();
    }
    Ok(out.trim().to_string())
}

/// Drop tags, `<script>`/`<style>` bodies and decode the common entities.
pub fn strip_html(html: &str) -> String {
    let mut out = String::with_capacity(html.len());
    let mut rest = html;

    while let Some(open) = rest.find('<') {
        out.push_str(&rest[..open]);
        let after = &rest[open..];
        let Some(close) = after.find('>') else {
            rest = "";
            break;
        };
        let tag = after[1..close].trim().to_ascii_lowercase();
        rest = &after[close + 1..];

        for skipped in ["script", "style"] {
            if tag == skipped || tag.starts_with(&format!("{} ", skipped)) {
                let end_tag = format!("</{}", skipped);
                let lower = rest.to_ascii_lowercase();
                rest = match lower.find(&end_tag) {
                    Some(pos) => {
                        let tail = &rest[pos..];
                        tail.find('>').map(|i| &tail[i + 1..]).unwrap_or("")
                    }
                    None => "",
                };
            }
        }

        // Block-level tags become whitespace so words never fuse.
        out.push(' ');
    }
    out.push_str(rest);

    let decoded = out
        .replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&amp;", "&");
    decoded.split_whitespace().collect::<Vec<_>>().join(" ")
}
