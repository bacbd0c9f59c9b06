use crate::error::{RagError, Result};
use crate::models::{Chunk, Document};
use sha2::{Digest, Sha256};

/// Window geometry in `char`s (Unicode scalar values).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkingConfig {
    pub chunk_size: usize,
    pub chunk_overlap: usize,
}

impl ChunkingConfig {
    pub fn new(chunk_size: usize, chunk_overlap: usize) -> Result<Self> {
        let config = Self {
            chunk_size,
            chunk_overlap,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.chunk_overlap == 0 || self.chunk_overlap >= self.chunk_size {
            return Err(RagError::InvalidConfiguration(format!(
                "chunk_overlap ({}) must be greater than zero and less than chunk_size ({})",
                self.chunk_overlap, self.chunk_size
            )));
        }
        Ok(())
    }

    pub fn step(&self) -> usize {
        self.chunk_size - self.chunk_overlap
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Chunker {
    config: ChunkingConfig,
}

impl Chunker {
    pub fn new(chunk_size: usize, chunk_overlap: usize) -> Result<Self> {
        Ok(Self {
            config: ChunkingConfig::new(chunk_size, chunk_overlap)?,
        })
    }

    pub fn config(&self) -> ChunkingConfig {
        self.config
    }

    pub fn chunk_document(&self, document: &Document) -> Vec<Chunk> {
        split_validated(&document.document_id, &document.text, self.config)
    }
}

impl TryFrom<ChunkingConfig> for Chunker {
    type Error = RagError;

    fn try_from(config: ChunkingConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }
}

pub fn chunk(
    document_id: &str,
    text: &str,
    chunk_size: usize,
    chunk_overlap: usize,
) -> Result<Vec<Chunk>> {
    let config = ChunkingConfig::new(chunk_size, chunk_overlap)?;
    Ok(split_validated(document_id, text, config))
}

fn split_validated(document_id: &str, text: &str, config: ChunkingConfig) -> Vec<Chunk> {
    let chars: Vec<char> = text.chars().collect();
    let mut chunks = Vec::new();
    let mut start = 0usize;
    let mut index = 0u64;

    while start < chars.len() {
        let end = (start + config.chunk_size).min(chars.len());
        let piece: String = chars[start..end].iter().collect();

        chunks.push(Chunk {
            chunk_id: make_chunk_id(document_id, index, &piece),
            document_id: document_id.to_string(),
            chunk_index: index,
            start,
            end,
            text: piece,
        });

        if end == chars.len() {
            break;
        }
        start += config.step();
        index += 1;
    }

    chunks
}

/// Reassembles the source text by dropping the shared prefix of every chunk
/// after the first.
pub fn stitch(chunks: &[Chunk], chunk_overlap: usize) -> String {
    let mut text = String::new();
    for (position, chunk) in chunks.iter().enumerate() {
        if position == 0 {
            text.push_str(&chunk.text);
        } else {
            text.extend(chunk.text.chars().skip(chunk_overlap));
        }
    }
    text
}

pub fn normalize_whitespace(text: &str) -> String {
    text.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .replace('\u{a0}', " ")
}

fn make_chunk_id(document_id: &str, index: u64, text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(document_id.as_bytes());
    hasher.update(index.to_le_bytes());
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const FOX: &str = "The quick brown fox. The lazy dog sleeps.";

    #[test]
    fn whitespace_is_normalized() {
        let input = "A  \t  lot\nof   spacing";
        let normalized = normalize_whitespace(input);
        assert_eq!(normalized, "A lot of spacing");
    }

    #[test]
    fn fox_sentence_splits_into_three_windows() {
        let chunks = chunk("doc-1", FOX, 20, 5).unwrap();

        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].text, "The quick brown fox.");
        assert_eq!(chunks[0].text.chars().count(), 20);
        assert_eq!(chunks[1].start, 15);
        assert_eq!(chunks[1].text, " fox. The lazy dog s");
        assert_eq!(&chunks[0].text[15..], &chunks[1].text[..5]);
        assert_eq!(chunks[2].start, 30);
        assert!(chunks[2].text.chars().count() < 20);
        assert_eq!(chunks[2].text, "dog sleeps.");
        assert!(chunks.iter().all(|chunk| chunk.document_id == "doc-1"));
        assert_eq!(
            chunks.iter().map(|chunk| chunk.chunk_index).collect::<Vec<_>>(),
            vec![0, 1, 2]
        );
    }

    #[test]
    fn short_text_is_a_single_chunk() {
        let chunks = chunk("doc-1", "tiny", 20, 5).unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].text, "tiny");
        assert_eq!((chunks[0].start, chunks[0].end), (0, 4));
    }

    #[test]
    fn empty_text_has_no_chunks() {
        assert!(chunk("doc-1", "", 20, 5).unwrap().is_empty());
    }

    #[test]
    fn overlap_must_be_between_zero_and_size() {
        for (size, overlap) in [(20, 0), (20, 20), (20, 25), (0, 0)] {
            let error = chunk("doc-1", FOX, size, overlap).unwrap_err();
            assert!(matches!(error, RagError::InvalidConfiguration(_)));
        }
    }

    #[test]
    fn offsets_count_characters_not_bytes() {
        let text = "héllo wörld ünïcode";
        let chunks = chunk("doc-1", text, 8, 3).unwrap();
        for piece in &chunks {
            let expected: String = text.chars().skip(piece.start).take(piece.end - piece.start).collect();
            assert_eq!(piece.text, expected);
        }
        assert_eq!(stitch(&chunks, 3), text);
    }

    #[test]
    fn chunker_matches_free_function() {
        let chunker = Chunker::new(20, 5).unwrap();
        let document = crate::models::Document::new("doc-1", FOX);
        assert_eq!(chunker.chunk_document(&document), chunk("doc-1", FOX, 20, 5).unwrap());
    }

    fn text_and_geometry() -> impl Strategy<Value = (String, usize, usize)> {
        (2usize..48).prop_flat_map(|size| {
            (".{0,400}", Just(size), 1..size)
        })
    }

    proptest! {
        #[test]
        fn rechunking_is_deterministic((text, size, overlap) in text_and_geometry()) {
            let first = chunk("doc", &text, size, overlap).unwrap();
            let second = chunk("doc", &text, size, overlap).unwrap();
            prop_assert_eq!(first, second);
        }

        #[test]
        fn stitching_reconstructs_the_source((text, size, overlap) in text_and_geometry()) {
            let chunks = chunk("doc", &text, size, overlap).unwrap();
            prop_assert_eq!(stitch(&chunks, overlap), text);
        }

        #[test]
        fn consecutive_chunks_share_exactly_the_overlap((text, size, overlap) in text_and_geometry()) {
            let chunks = chunk("doc", &text, size, overlap).unwrap();
            for pair in chunks.windows(2) {
                let head: Vec<char> = pair[0].text.chars().collect();
                prop_assert_eq!(head.len(), size);
                let tail: String = head[size - overlap..].iter().collect();
                let next: String = pair[1].text.chars().take(overlap).collect();
                prop_assert_eq!(tail, next);
            }
            if let Some(last) = chunks.last() {
                prop_assert!(last.text.chars().count() <= size);
            }
        }
    }
}
