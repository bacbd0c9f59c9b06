use crate::error::Result;
use crate::traits::Embedder;
use async_trait::async_trait;

pub const DEFAULT_EMBEDDING_DIMENSIONS: usize = 128;

const WORD_WEIGHT: f32 = 1.0;
const TRIGRAM_WEIGHT: f32 = 0.5;

/// Feature hashing over words and their boundary-padded character trigrams,
/// so "pump" and "pumps" land close together. Needs no model server, so it
/// backs offline runs and tests.
#[derive(Debug, Clone, Copy)]
pub struct CharacterNgramEmbedder {
    pub dimensions: usize,
}

impl Default for CharacterNgramEmbedder {
    fn default() -> Self {
        Self {
            dimensions: DEFAULT_EMBEDDING_DIMENSIONS,
        }
    }
}

#[derive(Clone, Copy)]
enum Feature {
    Word,
    Trigram,
}

impl CharacterNgramEmbedder {
    /// Unit-length, non-negative vector; all zeros when `text` has no
    /// alphanumeric content.
    pub fn embed_sync(&self, text: &str) -> Vec<f32> {
        let width = self.dimensions.max(1);
        let mut vector = vec![0f32; width];

        for word in words(text) {
            vector[bucket(Feature::Word, &word, width)] += WORD_WEIGHT;

            let padded: Vec<char> = std::iter::once('^')
                .chain(word.chars())
                .chain(std::iter::once('$'))
                .collect();
            for trigram in padded.windows(3) {
                let trigram: String = trigram.iter().collect();
                vector[bucket(Feature::Trigram, &trigram, width)] += TRIGRAM_WEIGHT;
            }
        }

        let norm = vector.iter().map(|value| value * value).sum::<f32>().sqrt();
        if norm > 0.0 {
            vector.iter_mut().for_each(|value| *value /= norm);
        }
        vector
    }
}

fn words(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|word| !word.is_empty())
        .map(str::to_lowercase)
}

/// FNV-1a over the feature's chars, salted by kind so a one-letter word and
/// a trigram never share a hash by construction.
fn bucket(kind: Feature, feature: &str, width: usize) -> usize {
    const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;

    let salt = match kind {
        Feature::Word => 0x57,
        Feature::Trigram => 0x54,
    };
    let hash = std::iter::once(salt)
        .chain(feature.chars().map(u64::from))
        .fold(OFFSET, |hash, unit| (hash ^ unit).wrapping_mul(PRIME));
    (hash % width as u64) as usize
}

#[async_trait]
impl Embedder for CharacterNgramEmbedder {
    fn dimensions(&self) -> usize {
        self.dimensions.max(1)
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        Ok(self.embed_sync(text))
    }
}
