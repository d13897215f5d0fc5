use anyhow::{anyhow, Context, Result};
use log::{debug, info, warn};
use quick_xml::events::Event;
use quick_xml::Reader;
use std::fmt;
use std::fs;
use std::io::{Cursor, Read};
use std::panic;
use std::path::Path;
use zip::ZipArchive;

const DOCX_MIME: &str = "application/vnd.openxmlformats-officedocument.wordprocessingml.document";
const DOCX_BODY: &str = "word/document.xml";

/// Document formats the processor knows how to read
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentKind {
    Pdf,
    Text,
    Docx,
}

impl DocumentKind {
    /// MIME type used to label this kind of document
    pub fn mime_type(self) -> &'static str {
        match self {
            DocumentKind::Pdf => "application/pdf",
            DocumentKind::Text => "text/plain",
            DocumentKind::Docx => DOCX_MIME,
        }
    }

    fn from_mime(mime: &str) -> Option<Self> {
        match mime {
            "application/pdf" => Some(DocumentKind::Pdf),
            "text/plain" => Some(DocumentKind::Text),
            DOCX_MIME => Some(DocumentKind::Docx),
            _ => None,
        }
    }
}

impl fmt::Display for DocumentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.mime_type())
    }
}

/// Represents a document with its content and metadata
#[derive(Debug, Clone)]
pub struct Document {
    /// The extracted text content of the document
    pub content: String,
    /// The document's file name (used as document ID)
    pub document_id: String,
    /// The document's MIME type
    pub mime_type: String,
}

impl Document {
    /// Create a new document from a file path
    pub fn from_file<P: AsRef<Path>>(file_path: P) -> Result<Self> {
        let path = file_path.as_ref();
        let file_name = path
            .file_name()
            .context("Invalid file name")?
            .to_str()
            .context("Invalid file name encoding")?
            .to_string();

        let bytes =
            fs::read(path).with_context(|| format!("Failed to read file: {}", path.display()))?;

        Self::from_bytes(&bytes, &file_name)
    }

    /// Create a new document from raw bytes and the name it was uploaded under
    pub fn from_bytes(bytes: &[u8], file_name: &str) -> Result<Self> {
        let kind = detect_kind(bytes, Some(file_name));
        debug!("Detected document type: {}", kind);

        let content = DocumentProcessor.extract(bytes, kind)?;

        Ok(Document {
            content,
            document_id: file_name.to_string(),
            mime_type: kind.mime_type().to_string(),
        })
    }
}

/// Turns uploaded files into plain text
#[derive(Debug, Clone, Copy, Default)]
pub struct DocumentProcessor;

impl DocumentProcessor {
    /// Read a file from disk and return its text content
    pub fn process_path<P: AsRef<Path>>(&self, file_path: P) -> Result<String> {
        let path = file_path.as_ref();
        let bytes =
            fs::read(path).with_context(|| format!("Failed to read file: {}", path.display()))?;
        let name = path.file_name().and_then(|n| n.to_str());

        self.process_bytes(&bytes, name)
    }

    /// Return the text content of an in-memory document
    ///
    /// The name, when present, decides the format by its extension. Without a
    /// recognised extension the format is sniffed from the content.
    pub fn process_bytes(&self, bytes: &[u8], name: Option<&str>) -> Result<String> {
        let kind = detect_kind(bytes, name);
        info!(
            "Processing {} document: {}",
            kind,
            name.unwrap_or("<unnamed>")
        );
        self.extract(bytes, kind)
    }

    fn extract(&self, bytes: &[u8], kind: DocumentKind) -> Result<String> {
        let structured = match kind {
            DocumentKind::Text => return read_text(bytes),
            DocumentKind::Pdf => read_pdf(bytes),
            DocumentKind::Docx => read_docx(bytes),
        };

        match structured {
            Ok(content) => Ok(content),
            Err(parse_err) => {
                warn!("{} parsing failed ({:#}), retrying as plain text", kind, parse_err);
                read_text(bytes).map_err(|_| anyhow!("Failed to process file: {:#}", parse_err))
            }
        }
    }
}

/// Decide the document format from its name, falling back to its content
pub fn detect_kind(bytes: &[u8], name: Option<&str>) -> DocumentKind {
    let by_name = name.and_then(|n| {
        mime_guess::from_path(n)
            .iter()
            .find_map(|mime| DocumentKind::from_mime(mime.essence_str()))
    });
    if let Some(kind) = by_name {
        return kind;
    }

    if bytes.starts_with(b"%PDF") {
        DocumentKind::Pdf
    } else if is_docx(bytes) {
        DocumentKind::Docx
    } else {
        DocumentKind::Text
    }
}

fn is_docx(bytes: &[u8]) -> bool {
    match ZipArchive::new(Cursor::new(bytes)) {
        Ok(mut archive) => {
            let has_body = archive.by_name(DOCX_BODY).is_ok();
            has_body
        }
        Err(_) => false,
    }
}

/// Decode UTF-8 text, always ending with a newline
fn read_text(bytes: &[u8]) -> Result<String> {
    let mut content = std::str::from_utf8(bytes)
        .context("File is not valid UTF-8 text")?
        .to_string();
    if !content.ends_with('\n') {
        content.push('\n');
    }
    Ok(content)
}

fn read_pdf(bytes: &[u8]) -> Result<String> {
    // pdf-extract panics on some malformed files instead of returning an error
    let content = panic::catch_unwind(|| pdf_extract::extract_text_from_mem(bytes))
        .map_err(|_| anyhow!("PDF parser aborted on malformed input"))?
        .context("Failed to extract text from PDF")?;

    // PDF extraction can sometimes include excessive whitespace
    let cleaned_content = normalize_whitespace(&content);
    if cleaned_content.is_empty() {
        warn!("Extracted PDF content is empty or contains only whitespace");
    }

    Ok(cleaned_content + "\n")
}

/// Paragraph text of a Word document, one paragraph per line
fn read_docx(bytes: &[u8]) -> Result<String> {
    let mut archive = ZipArchive::new(Cursor::new(bytes)).context("Not a DOCX archive")?;
    let mut xml = String::new();
    archive
        .by_name(DOCX_BODY)
        .context("DOCX archive has no document body")?
        .read_to_string(&mut xml)
        .context("Failed to read DOCX document body")?;

    let mut reader = Reader::from_str(&xml);
    let mut text = String::new();
    let mut in_text_run = false;

    loop {
        match reader.read_event().context("Malformed DOCX XML")? {
            Event::Start(e) if e.name().as_ref() == b"w:t" => in_text_run = true,
            Event::End(e) => match e.name().as_ref() {
                b"w:t" => in_text_run = false,
                b"w:p" => text.push('\n'),
                _ => {}
            },
            Event::Empty(e) => match e.name().as_ref() {
                b"w:tab" => text.push('\t'),
                b"w:br" | b"w:cr" => text.push('\n'),
                // an empty paragraph still counts as a line
                b"w:p" => text.push('\n'),
                _ => {}
            },
            Event::Text(e) if in_text_run => {
                text.push_str(&e.unescape().context("Malformed DOCX text")?);
            }
            Event::Eof => break,
            _ => {}
        }
    }

    Ok(text)
}

/// Normalize whitespace in text (remove multiple consecutive spaces, newlines, etc.)
fn normalize_whitespace(text: &str) -> String {
    let result = text.replace('\r', "");

    // Replace multiple consecutive newlines with double newlines (paragraph separator)
    let mut prev_char = ' ';
    let mut newline_count = 0;
    let mut normalized = String::with_capacity(result.len());

    for c in result.chars() {
        if c == '\n' {
            newline_count += 1;
        } else {
            if newline_count > 0 {
                if newline_count >= 2 {
                    normalized.push_str("\n\n");
                } else {
                    normalized.push('\n');
                }
                newline_count = 0;
            }

            // Don't add consecutive spaces
            if !(c == ' ' && prev_char == ' ') {
                normalized.push(c);
            }

            prev_char = c;
        }
    }

    normalized.trim().to_string()
}
