//! Plain-text extraction for the document loader.
//!
//! Maps a file extension to a content type and turns the file's bytes into
//! UTF-8 text. Plain text formats are decoded as UTF-8; PDF goes through
//! `pdf-extract`; DOCX is unzipped and the `w:t` runs of
//! `word/document.xml` are joined, one paragraph per line.

use std::io::Read;

use thiserror::Error;

pub const MIME_TEXT: &str = "text/plain";
pub const MIME_MARKDOWN: &str = "text/markdown";
pub const MIME_PDF: &str = "application/pdf";
pub const MIME_DOCX: &str =
    "application/vnd.openxmlformats-officedocument.wordprocessingml.document";

/// Decompressed size cap for a single ZIP entry (zip-bomb guard).
const MAX_XML_ENTRY_BYTES: u64 = 50 * 1024 * 1024;

const TEXT_EXTENSIONS: &[&str] = &[
    "txt", "text", "log", "csv", "tsv", "json", "toml", "yaml", "yml", "rst", "html", "htm",
    "xml", "rs", "py", "js", "ts", "go", "java", "c", "h", "cpp", "sh",
];

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("unsupported content type: {0}")]
    UnsupportedContentType(String),

    #[error("not valid UTF-8 text")]
    InvalidUtf8(#[from] std::string::FromUtf8Error),

    #[error("PDF extraction failed: {0}")]
    Pdf(String),

    #[error("DOCX extraction failed: {0}")]
    Docx(String),
}

/// Content type for a file extension, or `None` when unsupported.
pub fn content_type_for_extension(ext: &str) -> Option<&'static str> {
    let ext = ext.to_ascii_lowercase();
    match ext.as_str() {
        "md" | "markdown" => Some(MIME_MARKDOWN),
        "pdf" => Some(MIME_PDF),
        "docx" => Some(MIME_DOCX),
        e if TEXT_EXTENSIONS.contains(&e) => Some(MIME_TEXT),
        _ => None,
    }
}

/// Extract UTF-8 text from `bytes` of the given content type.
pub fn extract_text(bytes: Vec<u8>, content_type: &str) -> Result<String, ExtractError> {
    match content_type {
        MIME_TEXT | MIME_MARKDOWN => Ok(String::from_utf8(bytes)?),
        MIME_PDF => pdf_extract::extract_text_from_mem(&bytes)
            .map_err(|e| ExtractError::Pdf(e.to_string())),
        MIME_DOCX => extract_docx(&bytes),
        other => Err(ExtractError::UnsupportedContentType(other.to_string())),
    }
}

fn extract_docx(bytes: &[u8]) -> Result<String, ExtractError> {
    let docx_err = |e: &dyn std::fmt::Display| ExtractError::Docx(e.to_string());

    let mut archive =
        zip::ZipArchive::new(std::io::Cursor::new(bytes)).map_err(|e| docx_err(&e))?;
    let entry = archive
        .by_name("word/document.xml")
        .map_err(|_| ExtractError::Docx("word/document.xml not found".to_string()))?;

    let mut xml = Vec::new();
    entry
        .take(MAX_XML_ENTRY_BYTES)
        .read_to_end(&mut xml)
        .map_err(|e| docx_err(&e))?;
    if xml.len() as u64 >= MAX_XML_ENTRY_BYTES {
        return Err(ExtractError::Docx(
            "word/document.xml exceeds size limit".to_string(),
        ));
    }

    paragraphs_from_document_xml(&xml)
}

/// Collect `w:t` text, ending a line at each `w:p` close.
fn paragraphs_from_document_xml(xml: &[u8]) -> Result<String, ExtractError> {
    use quick_xml::events::Event;

    let mut reader = quick_xml::Reader::from_reader(xml);
    let mut buf = Vec::new();
    let mut out = String::new();
    let mut line = String::new();
    let mut in_text = false;

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) if e.local_name().as_ref() == b"t" => in_text = true,
            Ok(Event::Text(t)) if in_text => {
                let text = t.unescape().map_err(|e| ExtractError::Docx(e.to_string()))?;
                line.push_str(&text);
            }
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"t" => in_text = false,
                b"p" => {
                    if !line.trim().is_empty() {
                        out.push_str(line.trim_end());
                        out.push('\n');
                    }
                    line.clear();
                }
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(e) => return Err(ExtractError::Docx(e.to_string())),
            _ => {}
        }
        buf.clear();
    }

    if !line.trim().is_empty() {
        out.push_str(line.trim_end());
        out.push('\n');
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn docx_bytes(document_xml: &str) -> Vec<u8> {
        let mut buf = std::io::Cursor::new(Vec::new());
        {
            let mut zip = zip::ZipWriter::new(&mut buf);
            let options = zip::write::SimpleFileOptions::default();
            zip.start_file("word/document.xml", options).unwrap();
            zip.write_all(document_xml.as_bytes()).unwrap();
            zip.finish().unwrap();
        }
        buf.into_inner()
    }

    #[test]
    fn test_content_types() {
        assert_eq!(content_type_for_extension("md"), Some(MIME_MARKDOWN));
        assert_eq!(content_type_for_extension("TXT"), Some(MIME_TEXT));
        assert_eq!(content_type_for_extension("pdf"), Some(MIME_PDF));
        assert_eq!(content_type_for_extension("docx"), Some(MIME_DOCX));
        assert_eq!(content_type_for_extension("png"), None);
    }

    #[test]
    fn test_plain_text() {
        let text = extract_text("héllo".as_bytes().to_vec(), MIME_TEXT).unwrap();
        assert_eq!(text, "héllo");
    }

    #[test]
    fn test_invalid_utf8_is_an_error() {
        let err = extract_text(vec![0xff, 0xfe, 0x00], MIME_TEXT).unwrap_err();
        assert!(matches!(err, ExtractError::InvalidUtf8(_)));
    }

    #[test]
    fn test_unsupported_content_type() {
        let err = extract_text(b"foo".to_vec(), "application/octet-stream").unwrap_err();
        assert!(matches!(err, ExtractError::UnsupportedContentType(_)));
    }

    #[test]
    fn test_invalid_pdf() {
        let err = extract_text(b"not a pdf".to_vec(), MIME_PDF).unwrap_err();
        assert!(matches!(err, ExtractError::Pdf(_)));
    }

    #[test]
    fn test_invalid_docx() {
        let err = extract_text(b"not a zip".to_vec(), MIME_DOCX).unwrap_err();
        assert!(matches!(err, ExtractError::Docx(_)));
    }

    #[test]
    fn test_docx_paragraphs() {
        let xml = r#"<?xml version="1.0"?>
<w:document xmlns:w="http://schemas.openxmlformats.org/wordprocessingml/2006/main">
  <w:body>
    <w:p><w:r><w:t>Cats are</w:t></w:r><w:r><w:t xml:space="preserve"> small &amp; furry.</w:t></w:r></w:p>
    <w:p><w:r><w:t>They purr.</w:t></w:r></w:p>
  </w:body>
</w:document>"#;
        let text = extract_text(docx_bytes(xml), MIME_DOCX).unwrap();
        assert_eq!(text, "Cats are small & furry.\nThey purr.\n");
    }
}
