use crate::chunking::normalize_whitespace;
use crate::error::IngestError;
use lopdf::Document;
use std::fs;
use std::path::Path;

pub const SUPPORTED_EXTENSIONS: [&str; 4] = ["txt", "md", "markdown", "pdf"];

#[derive(Debug, Clone)]
pub struct PageText {
    pub number: u32,
    pub text: String,
}

pub trait PdfExtractor {
    fn extract_pages(&self, path: &Path) -> Result<Vec<PageText>, IngestError>;
}

#[derive(Default)]
pub struct LopdfExtractor;

impl PdfExtractor for LopdfExtractor {
    fn extract_pages(&self, path: &Path) -> Result<Vec<PageText>, IngestError> {
        let document = Document::load(path).map_err(|error| IngestError::PdfParse(error.to_string()))?;

        let mut pages = Vec::new();
        for (page_no, _page_id) in document.get_pages() {
            let text = document
                .extract_text(&[page_no])
                .map_err(|error| IngestError::PdfParse(error.to_string()))?;

            if !text.trim().is_empty() {
                pages.push(PageText {
                    number: page_no,
                    text,
                });
            }
        }

        if pages.is_empty() {
            return Err(IngestError::PdfParse(format!(
                "pdf had no readable page text: {}",
                path.display()
            )));
        }

        Ok(pages)
    }
}

pub fn is_supported(path: &Path) -> bool {
    extension(path).is_some_and(|ext| SUPPORTED_EXTENSIONS.contains(&ext.as_str()))
}

/// Plain text of one file. PDF pages are whitespace-normalized and joined
/// with blank lines; text formats are read verbatim.
pub fn extract_text(path: &Path) -> Result<String, IngestError> {
    match extension(path).as_deref() {
        Some("pdf") => {
            let pages = LopdfExtractor.extract_pages(path)?;
            Ok(pages
                .iter()
                .map(|page| normalize_whitespace(&page.text))
                .collect::<Vec<_>>()
                .join("\n\n"))
        }
        Some("txt" | "md" | "markdown") => {
            let bytes = fs::read(path)?;
            String::from_utf8(bytes)
                .map_err(|_| IngestError::InvalidEncoding(path.display().to_string()))
        }
        _ => Err(IngestError::InvalidArgument(format!(
            "unsupported file type: {}",
            path.display()
        ))),
    }
}

fn extension(path: &Path) -> Option<String> {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_ascii_lowercase())
}
