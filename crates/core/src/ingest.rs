use crate::error::IngestError;
use crate::extractor::{extract_text, is_supported};
use crate::models::{Document, DocumentMetadata};
use chrono::Utc;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use walkdir::WalkDir;

/// Supported files under `path`, sorted. A file path is returned as is when
/// its extension is supported.
pub fn discover_documents(path: &Path) -> Vec<PathBuf> {
    if path.is_file() {
        return if is_supported(path) {
            vec![path.to_path_buf()]
        } else {
            Vec::new()
        };
    }

    let mut files: Vec<PathBuf> = WalkDir::new(path)
        .into_iter()
        .filter_map(|item| item.ok())
        .filter(|entry| entry.file_type().is_file() && is_supported(entry.path()))
        .map(|entry| entry.path().to_path_buf())
        .collect();

    files.sort_unstable();
    files
}

pub fn digest_file(path: &Path) -> Result<String, IngestError> {
    let bytes = fs::read(path)?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Ok(format!("{:x}", hasher.finalize()))
}

pub fn load_document(path: &Path) -> Result<Document, IngestError> {
    let name = path
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| {
            IngestError::MissingFileName(format!("path missing filename: {}", path.display()))
        })?;
    let checksum = digest_file(path)?;
    let text = extract_text(path)?;

    let mut extra = BTreeMap::new();
    extra.insert("file_name".to_string(), name.to_string());

    Ok(Document {
        document_id: generate_document_id(path),
        text,
        metadata: DocumentMetadata {
            source_path: Some(path.to_string_lossy().to_string()),
            checksum: Some(checksum),
            ingested_at: Utc::now(),
            extra,
        },
    })
}

#[derive(Debug)]
pub struct SkippedFile {
    pub path: PathBuf,
    pub reason: String,
}

#[derive(Debug, Default)]
pub struct IngestionReport {
    pub documents: Vec<Document>,
    pub skipped_files: Vec<SkippedFile>,
}

pub fn load_documents(path: &Path) -> Result<Vec<Document>, IngestError> {
    let report = load_documents_best_effort(path)?;
    Ok(report.documents)
}

/// Loads every supported file under `path`, recording unreadable ones
/// instead of failing.
pub fn load_documents_best_effort(path: &Path) -> Result<IngestionReport, IngestError> {
    if !path.exists() {
        return Err(IngestError::InvalidArgument(format!(
            "path does not exist: {}",
            path.display()
        )));
    }

    let files = discover_documents(path);
    if files.is_empty() {
        return Err(IngestError::InvalidArgument(format!(
            "no supported documents found in {}",
            path.display()
        )));
    }

    let mut report = IngestionReport::default();
    for file in files {
        match load_document(&file) {
            Ok(document) => report.documents.push(document),
            Err(error) => {
                warn!(path = %file.display(), error = %error, "skipping unreadable document");
                report.skipped_files.push(SkippedFile {
                    path: file,
                    reason: error.to_string(),
                });
            }
        }
    }

    info!(
        loaded = report.documents.len(),
        skipped = report.skipped_files.len(),
        "documents loaded"
    );
    Ok(report)
}

fn generate_document_id(path: &Path) -> String {
    let mut hasher = Sha256::new();
    hasher.update(path.to_string_lossy().as_bytes());
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::{self, File};
    use std::io::Write;
    use tempfile::tempdir;

    #[test]
    fn discovery_is_recursive_and_filtered() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let base = dir.path();
        let nested = base.join("nested");
        fs::create_dir(&nested)?;

        File::create(base.join("a.txt")).and_then(|mut file| file.write_all(b"alpha"))?;
        File::create(nested.join("b.md")).and_then(|mut file| file.write_all(b"beta"))?;
        File::create(nested.join("c.png")).and_then(|mut file| file.write_all(b"\x89PNG"))?;

        let files = discover_documents(base);
        assert_eq!(files, vec![base.join("a.txt"), nested.join("b.md")]);
        assert_eq!(discover_documents(&base.join("a.txt")).len(), 1);
        Ok(())
    }

    #[test]
    fn checksum_is_reproducible() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let file_path = dir.path().join("a.txt");
        fs::write(&file_path, b"abc")?;

        let first = digest_file(&file_path)?;
        let second = digest_file(&file_path)?;
        assert_eq!(first, second);
        Ok(())
    }

    #[test]
    fn loaded_document_carries_source_and_checksum() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let path = dir.path().join("pumps.txt");
        fs::write(&path, "Hydraulic pumps move fluid.")?;

        let document = load_document(&path)?;
        assert_eq!(document.text, "Hydraulic pumps move fluid.");
        assert_eq!(document.metadata.checksum, Some(digest_file(&path)?));
        assert_eq!(
            document.metadata.source_path,
            Some(path.to_string_lossy().to_string())
        );
        assert_eq!(document.document_id, load_document(&path)?.document_id);
        Ok(())
    }

    #[test]
    fn loading_fails_without_documents() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let result = load_documents_best_effort(dir.path());
        assert!(matches!(result, Err(IngestError::InvalidArgument(_))));
        Ok(())
    }

    #[test]
    fn best_effort_skips_unreadable_files() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        fs::write(dir.path().join("good.txt"), "readable")?;
        fs::write(dir.path().join("unreadable.pdf"), b"%PDF-1.4\n%broken")?;

        let report = load_documents_best_effort(dir.path())?;

        assert_eq!(report.documents.len(), 1);
        assert_eq!(report.skipped_files.len(), 1);
        assert_eq!(
            report.skipped_files[0]
                .path
                .file_name()
                .and_then(|name| name.to_str()),
            Some("unreadable.pdf")
        );
        Ok(())
    }
}
