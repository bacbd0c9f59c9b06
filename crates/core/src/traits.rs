use crate::error::Result;
use crate::models::{Generation, GenerationRequest};
use async_trait::async_trait;
use futures::stream::{self, Stream};
use std::pin::Pin;

pub const DEFAULT_EMBED_BATCH_SIZE: usize = 32;

/// Text deltas of a streamed generation, in order.
pub type TextStream = Pin<Box<dyn Stream<Item = Result<String>> + Send>>;

#[async_trait]
pub trait Embedder: Send + Sync {
    /// Length of every vector this embedder returns.
    fn dimensions(&self) -> usize;

    /// Most texts handed to one `embed_batch` call during ingestion.
    fn max_batch_size(&self) -> usize {
        DEFAULT_EMBED_BATCH_SIZE
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>>;

    async fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
        let mut vectors = Vec::with_capacity(texts.len());
        for text in texts {
            vectors.push(self.embed(text).await?);
        }
        Ok(vectors)
    }
}

#[async_trait]
pub trait TextGenerator: Send + Sync {
    async fn generate(&self, request: &GenerationRequest) -> Result<Generation>;

    /// Streams the answer as it is produced. Generators without native
    /// streaming yield the whole answer as a single delta.
    async fn generate_stream(&self, request: &GenerationRequest) -> Result<TextStream> {
        let generation = self.generate(request).await?;
        Ok(Box::pin(stream::once(async move { Ok(generation.text) })))
    }
}
