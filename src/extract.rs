//! Upload-to-text extraction for the multipart analyze endpoint.
//!
//! Supported inputs:
//!
//! | Kind | Detected by |
//! |------|-------------|
//! | plain text | `text/*` content type, or `.txt` / `.md` / `.markdown` |
//! | Word document | DOCX content type, or `.docx` |
//!
//! DOCX paragraphs become lines, so the chunker still sees speaker turns.
//! Anything else is rejected with [`ExtractError::Unsupported`].

use std::io::Read;

use quick_xml::events::Event;
use thiserror::Error;

pub const MIME_DOCX: &str = "application/vnd.openxmlformats-officedocument.wordprocessingml.document";

/// Maximum decompressed bytes to read from a single ZIP entry (zip-bomb protection).
const MAX_XML_ENTRY_BYTES: u64 = 50 * 1024 * 1024;

#[derive(Error, Debug)]
pub enum ExtractError {
    #[error("unsupported file type: {0}")]
    Unsupported(String),

    #[error("file is not valid UTF-8 text")]
    InvalidUtf8,

    #[error("DOCX extraction failed: {0}")]
    Docx(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    Text,
    Docx,
}

fn detect(filename: Option<&str>, content_type: Option<&str>) -> Option<Kind> {
    let content_type = content_type
        .map(|ct| ct.split(';').next().unwrap_or_default().trim().to_lowercase())
        .unwrap_or_default();
    if content_type == MIME_DOCX {
        return Some(Kind::Docx);
    }

    let extension = filename
        .and_then(|name| name.rsplit_once('.'))
        .map(|(_, ext)| ext.to_lowercase());
    match extension.as_deref() {
        Some("docx") => return Some(Kind::Docx),
        Some("txt") | Some("md") | Some("markdown") => return Some(Kind::Text),
        _ => {}
    }

    if content_type.starts_with("text/") {
        return Some(Kind::Text);
    }
    None
}

/// Extract plain text from an uploaded file.
pub fn extract_text(
    bytes: &[u8],
    filename: Option<&str>,
    content_type: Option<&str>,
) -> Result<String, ExtractError> {
    match detect(filename, content_type) {
        Some(Kind::Text) => extract_plain(bytes),
        Some(Kind::Docx) => extract_docx(bytes),
        None => Err(ExtractError::Unsupported(
            filename
                .or(content_type)
                .unwrap_or("unknown")
                .to_string(),
        )),
    }
}

fn extract_plain(bytes: &[u8]) -> Result<String, ExtractError> {
    let bytes = bytes.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(bytes);
    let text = std::str::from_utf8(bytes).map_err(|_| ExtractError::InvalidUtf8)?;
    Ok(text.replace("\r\n", "\n"))
}

fn extract_docx(bytes: &[u8]) -> Result<String, ExtractError> {
    let mut archive = zip::ZipArchive::new(std::io::Cursor::new(bytes))
        .map_err(|e| ExtractError::Docx(e.to_string()))?;
    let entry = archive
        .by_name("word/document.xml")
        .map_err(|_| ExtractError::Docx("word/document.xml not found".to_string()))?;

    let mut doc_xml = Vec::new();
    entry
        .take(MAX_XML_ENTRY_BYTES)
        .read_to_end(&mut doc_xml)
        .map_err(|e| ExtractError::Docx(e.to_string()))?;
    if doc_xml.len() as u64 >= MAX_XML_ENTRY_BYTES {
        return Err(ExtractError::Docx(
            "word/document.xml exceeds size limit".to_string(),
        ));
    }
    paragraphs_text(&doc_xml)
}

/// Concatenate `w:t` runs, one line per `w:p` paragraph.
fn paragraphs_text(xml: &[u8]) -> Result<String, ExtractError> {
    let mut reader = quick_xml::Reader::from_reader(xml);
    let mut buf = Vec::new();
    let mut lines: Vec<String> = Vec::new();
    let mut current = String::new();
    let mut in_text = false;

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) if e.local_name().as_ref() == b"t" => in_text = true,
            Ok(Event::Text(te)) if in_text => {
                let text = te.unescape().map_err(|e| ExtractError::Docx(e.to_string()))?;
                current.push_str(&text);
            }
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"t" => in_text = false,
                b"p" => lines.push(std::mem::take(&mut current)),
                _ => {}
            },
            Ok(Event::Empty(e)) => match e.local_name().as_ref() {
                b"tab" => current.push('\t'),
                b"br" | b"cr" => current.push('\n'),
                b"p" => lines.push(String::new()),
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(e) => return Err(ExtractError::Docx(e.to_string())),
            _ => {}
        }
        buf.clear();
    }
    if !current.is_empty() {
        lines.push(current);
    }
    Ok(lines.join("\n"))
}
