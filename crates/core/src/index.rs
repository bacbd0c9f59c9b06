use crate::chunking::Chunker;
use crate::error::{RagError, Result};
use crate::models::{Chunk, Document, DocumentMetadata, EmbeddingRecord};
use crate::resilience::CallPolicy;
use crate::traits::Embedder;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info};

pub const INDEX_FILE: &str = "index.json";
const STAGING_FILE: &str = "index.json.staging";
const FORMAT_VERSION: u32 = 1;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct VectorIndex {
    dimension: Option<usize>,
    documents: BTreeMap<String, DocumentMetadata>,
    records: Vec<EmbeddingRecord>,
}

#[derive(Debug, Clone, Copy)]
pub struct SearchHit<'a> {
    pub record: &'a EmbeddingRecord,
    pub score: f32,
}

impl VectorIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn dimension(&self) -> Option<usize> {
        self.dimension
    }

    pub fn records(&self) -> &[EmbeddingRecord] {
        &self.records
    }

    pub fn document(&self, document_id: &str) -> Option<&DocumentMetadata> {
        self.documents.get(document_id)
    }

    pub fn document_ids(&self) -> impl Iterator<Item = &str> {
        self.documents.keys().map(String::as_str)
    }

    /// True when `document` is indexed with the same content checksum.
    pub fn contains_unchanged(&self, document: &Document) -> bool {
        match (
            self.documents.get(&document.document_id),
            document.metadata.checksum.as_deref(),
        ) {
            (Some(indexed), Some(checksum)) => indexed.checksum.as_deref() == Some(checksum),
            _ => false,
        }
    }

    pub fn add(&mut self, chunk: Chunk, vector: Vec<f32>, metadata: &DocumentMetadata) -> Result<()> {
        let expected = self.dimension.unwrap_or(vector.len());
        if vector.is_empty() || vector.len() != expected {
            return Err(RagError::DimensionMismatch {
                expected,
                actual: vector.len(),
            });
        }
        if vector.iter().any(|value| !value.is_finite()) {
            return Err(RagError::InvalidRequest(format!(
                "embedding for chunk {} contains non-finite values",
                chunk.chunk_id
            )));
        }

        self.dimension = Some(expected);
        self.documents
            .entry(chunk.document_id.clone())
            .or_insert_with(|| metadata.clone());
        self.records.push(EmbeddingRecord { chunk, vector });
        Ok(())
    }

    /// Drops every record of `document_id`; returns how many were removed.
    pub fn remove_document(&mut self, document_id: &str) -> usize {
        let before = self.records.len();
        self.records
            .retain(|record| record.chunk.document_id != document_id);
        self.documents.remove(document_id);
        if self.records.is_empty() {
            self.dimension = None;
        }
        before - self.records.len()
    }

    /// Cosine similarity ranking. Ties keep insertion order and `k` is
    /// clamped to the index size.
    pub fn search(&self, query: &[f32], k: usize) -> Result<Vec<SearchHit<'_>>> {
        let Some(dimension) = self.dimension else {
            return Ok(Vec::new());
        };
        if query.len() != dimension {
            return Err(RagError::DimensionMismatch {
                expected: dimension,
                actual: query.len(),
            });
        }

        let query_norm = l2_norm(query);
        let mut hits: Vec<SearchHit<'_>> = self
            .records
            .iter()
            .map(|record| SearchHit {
                record,
                score: cosine_similarity(query, query_norm, &record.vector),
            })
            .collect();

        // sort_by is stable, which gives the insertion-order tie-break.
        hits.sort_by(|left, right| right.score.total_cmp(&left.score));
        hits.truncate(k.min(self.records.len()));
        Ok(hits)
    }

    pub fn persist(&self, dir: &Path) -> Result<PathBuf> {
        let staged = self.stage(dir)?;
        let target = dir.join(INDEX_FILE);
        if let Err(error) = fs::rename(&staged, &target) {
            let _ = fs::remove_file(&staged);
            return Err(error.into());
        }
        debug!(path = %target.display(), records = self.records.len(), "index persisted");
        Ok(target)
    }

    pub fn load(dir: &Path) -> Result<Self> {
        let bytes = fs::read(dir.join(INDEX_FILE))?;
        let persisted: PersistedIndex = serde_json::from_slice(&bytes)
            .map_err(|error| RagError::CorruptIndex(format!("unreadable index file: {error}")))?;

        if persisted.format_version != FORMAT_VERSION {
            return Err(RagError::CorruptIndex(format!(
                "unsupported format version {}",
                persisted.format_version
            )));
        }

        let checksum = content_checksum(&persisted.documents, &persisted.records)?;
        if checksum != persisted.checksum {
            return Err(RagError::CorruptIndex(
                "checksum does not match index contents".to_string(),
            ));
        }

        if let Some(dimension) = persisted.dimension {
            if let Some(record) = persisted
                .records
                .iter()
                .find(|record| record.vector.len() != dimension)
            {
                return Err(RagError::CorruptIndex(format!(
                    "record {} has {} dimensions, index declares {dimension}",
                    record.chunk.chunk_id,
                    record.vector.len()
                )));
            }
        } else if !persisted.records.is_empty() {
            return Err(RagError::CorruptIndex(
                "records present but no dimension declared".to_string(),
            ));
        }

        Ok(Self {
            dimension: persisted.dimension,
            documents: persisted.documents,
            records: persisted.records,
        })
    }

    pub fn exists(dir: &Path) -> bool {
        dir.join(INDEX_FILE).is_file()
    }

    fn stage(&self, dir: &Path) -> Result<PathBuf> {
        fs::create_dir_all(dir)?;
        let staged = dir.join(STAGING_FILE);

        let write = || -> Result<()> {
            let payload = PersistedIndexRef {
                format_version: FORMAT_VERSION,
                dimension: self.dimension,
                built_at: Utc::now(),
                checksum: content_checksum(&self.documents, &self.records)?,
                documents: &self.documents,
                records: &self.records,
            };
            let mut file = fs::File::create(&staged)?;
            serde_json::to_writer(&mut file, &payload)?;
            file.flush()?;
            file.sync_all()?;
            Ok(())
        };

        if let Err(error) = write() {
            let _ = fs::remove_file(&staged);
            return Err(error);
        }
        Ok(staged)
    }
}

#[derive(Serialize)]
struct PersistedIndexRef<'a> {
    format_version: u32,
    dimension: Option<usize>,
    built_at: DateTime<Utc>,
    checksum: String,
    documents: &'a BTreeMap<String, DocumentMetadata>,
    records: &'a [EmbeddingRecord],
}

#[derive(Deserialize)]
struct PersistedIndex {
    format_version: u32,
    dimension: Option<usize>,
    #[allow(dead_code)]
    built_at: DateTime<Utc>,
    checksum: String,
    documents: BTreeMap<String, DocumentMetadata>,
    records: Vec<EmbeddingRecord>,
}

fn content_checksum(
    documents: &BTreeMap<String, DocumentMetadata>,
    records: &[EmbeddingRecord],
) -> Result<String> {
    let mut hasher = Sha256::new();
    hasher.update(serde_json::to_vec(documents)?);
    hasher.update(serde_json::to_vec(records)?);
    Ok(format!("{:x}", hasher.finalize()))
}

fn l2_norm(vector: &[f32]) -> f32 {
    vector.iter().map(|value| value * value).sum::<f32>().sqrt()
}

fn cosine_similarity(query: &[f32], query_norm: f32, candidate: &[f32]) -> f32 {
    let candidate_norm = l2_norm(candidate);
    if query_norm == 0.0 || candidate_norm == 0.0 {
        return 0.0;
    }
    let dot: f32 = query.iter().zip(candidate).map(|(a, b)| a * b).sum();
    dot / (query_norm * candidate_norm)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BuildReport {
    pub documents_indexed: usize,
    pub documents_skipped: usize,
    /// Previously indexed documents whose new text produced no chunks.
    pub documents_removed: usize,
    pub chunks_indexed: usize,
    pub total_records: usize,
    pub dimension: Option<usize>,
}

struct EmbeddedDocument {
    document_id: String,
    metadata: DocumentMetadata,
    chunks: Vec<(Chunk, Vec<f32>)>,
}

/// The active index. Readers clone an `Arc` snapshot; writers build a new
/// index off to the side and swap it in.
pub struct IndexHandle {
    active: RwLock<Arc<VectorIndex>>,
    writer: Mutex<()>,
    persist_dir: Option<PathBuf>,
}

impl IndexHandle {
    pub fn in_memory() -> Self {
        Self::from_index(VectorIndex::new(), None)
    }

    pub fn from_index(index: VectorIndex, persist_dir: Option<PathBuf>) -> Self {
        Self {
            active: RwLock::new(Arc::new(index)),
            writer: Mutex::new(()),
            persist_dir,
        }
    }

    /// Loads the index under `dir`, or starts empty when none was persisted.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        let index = if VectorIndex::exists(&dir) {
            let index = VectorIndex::load(&dir)?;
            info!(path = %dir.display(), records = index.len(), "loaded vector index");
            index
        } else {
            VectorIndex::new()
        };
        Ok(Self::from_index(index, Some(dir)))
    }

    pub fn persist_dir(&self) -> Option<&Path> {
        self.persist_dir.as_deref()
    }

    pub fn snapshot(&self) -> Arc<VectorIndex> {
        Arc::clone(&self.active.read())
    }

    /// Replaces the whole index. On failure the active index, in memory and
    /// on disk, is left as it was.
    pub async fn rebuild(
        &self,
        documents: &[Document],
        chunker: &Chunker,
        embedder: &dyn Embedder,
        policy: &CallPolicy,
    ) -> Result<BuildReport> {
        match self.rebuild_staged(documents, chunker, embedder, policy).await {
            Ok(report) => {
                info!(
                    documents = report.documents_indexed,
                    chunks = report.chunks_indexed,
                    "index rebuilt"
                );
                Ok(report)
            }
            Err(cause) => {
                error!(error = %cause, "index rebuild failed, keeping previous index");
                Err(RagError::RebuildFailed(Box::new(cause)))
            }
        }
    }

    async fn rebuild_staged(
        &self,
        documents: &[Document],
        chunker: &Chunker,
        embedder: &dyn Embedder,
        policy: &CallPolicy,
    ) -> Result<BuildReport> {
        let embedded = embed_documents(documents.iter(), chunker, embedder, policy).await?;

        let mut staged = VectorIndex::new();
        let mut report = BuildReport::default();
        for document in embedded {
            if document.chunks.is_empty() {
                report.documents_skipped += 1;
                continue;
            }
            report.documents_indexed += 1;
            for (chunk, vector) in document.chunks {
                staged.add(chunk, vector, &document.metadata)?;
                report.chunks_indexed += 1;
            }
        }

        let _guard = self.writer.lock().await;
        let staged = Arc::new(staged);
        self.commit(Arc::clone(&staged)).await?;
        report.total_records = staged.len();
        report.dimension = staged.dimension();
        self.install(staged);
        Ok(report)
    }

    /// Appends documents. Documents already indexed with the same checksum
    /// are skipped; changed ones replace their previous records, and a
    /// changed document whose text is now empty is removed.
    pub async fn ingest(
        &self,
        documents: &[Document],
        chunker: &Chunker,
        embedder: &dyn Embedder,
        policy: &CallPolicy,
    ) -> Result<BuildReport> {
        let current = self.snapshot();
        let pending: Vec<&Document> = documents
            .iter()
            .filter(|document| !current.contains_unchanged(document))
            .collect();
        let mut report = BuildReport {
            documents_skipped: documents.len() - pending.len(),
            ..BuildReport::default()
        };
        drop(current);

        let embedded = embed_documents(pending.into_iter(), chunker, embedder, policy).await?;

        let _guard = self.writer.lock().await;
        let mut next = VectorIndex::clone(&self.snapshot());
        for document in embedded {
            let replaced = next.remove_document(&document.document_id);
            if document.chunks.is_empty() {
                if replaced > 0 {
                    debug!(document_id = %document.document_id, replaced, "document emptied");
                    report.documents_removed += 1;
                } else {
                    report.documents_skipped += 1;
                }
                continue;
            }
            if replaced > 0 {
                debug!(document_id = %document.document_id, replaced, "superseding document");
            }
            report.documents_indexed += 1;
            for (chunk, vector) in document.chunks {
                next.add(chunk, vector, &document.metadata)?;
                report.chunks_indexed += 1;
            }
        }

        let next = Arc::new(next);
        self.commit(Arc::clone(&next)).await?;
        report.total_records = next.len();
        report.dimension = next.dimension();
        self.install(next);

        info!(
            indexed = report.documents_indexed,
            skipped = report.documents_skipped,
            removed = report.documents_removed,
            chunks = report.chunks_indexed,
            "documents ingested"
        );
        Ok(report)
    }

    pub async fn remove_document(&self, document_id: &str) -> Result<usize> {
        let _guard = self.writer.lock().await;
        let mut next = VectorIndex::clone(&self.snapshot());
        let removed = next.remove_document(document_id);
        if removed > 0 {
            let next = Arc::new(next);
            self.commit(Arc::clone(&next)).await?;
            self.install(next);
        }
        Ok(removed)
    }

    async fn commit(&self, index: Arc<VectorIndex>) -> Result<()> {
        let Some(dir) = self.persist_dir.clone() else {
            return Ok(());
        };
        tokio::task::spawn_blocking(move || index.persist(&dir))
            .await
            .map_err(|error| RagError::Io(std::io::Error::other(error)))??;
        Ok(())
    }

    fn install(&self, index: Arc<VectorIndex>) {
        *self.active.write() = index;
    }
}

async fn embed_documents<'a>(
    documents: impl Iterator<Item = &'a Document>,
    chunker: &Chunker,
    embedder: &dyn Embedder,
    policy: &CallPolicy,
) -> Result<Vec<EmbeddedDocument>> {
    let batch_size = embedder.max_batch_size().max(1);
    let mut embedded = Vec::new();
    for document in documents {
        let chunks = chunker.chunk_document(document);
        if chunks.is_empty() {
            debug!(document_id = %document.document_id, "document has no text");
        }

        let texts: Vec<&str> = chunks.iter().map(|chunk| chunk.text.as_str()).collect();
        let mut vectors = Vec::with_capacity(chunks.len());
        for batch in texts.chunks(batch_size) {
            let batch_vectors = policy
                .run("embed", move || embedder.embed_batch(batch))
                .await?;
            if batch_vectors.len() != batch.len() {
                return Err(RagError::EmbeddingUnavailable(format!(
                    "embedder returned {} vectors for a batch of {} chunks of document {}",
                    batch_vectors.len(),
                    batch.len(),
                    document.document_id
                )));
            }
            vectors.extend(batch_vectors);
        }

        embedded.push(EmbeddedDocument {
            document_id: document.document_id.clone(),
            metadata: document.metadata.clone(),
            chunks: chunks.into_iter().zip(vectors).collect(),
        });
    }
    Ok(embedded)
}
