pub mod chunking;
pub mod config;
pub mod conversation;
pub mod embeddings;
pub mod error;
pub mod extractor;
pub mod index;
pub mod ingest;
pub mod models;
pub mod orchestrator;
pub mod providers;
pub mod resilience;
pub mod retriever;
pub mod traits;

pub use chunking::{chunk, normalize_whitespace, stitch, Chunker, ChunkingConfig};
pub use config::{CallConfig, EmbeddingConfig, GenerationConfig, ServiceConfig};
pub use conversation::ConversationLog;
pub use embeddings::{CharacterNgramEmbedder, DEFAULT_EMBEDDING_DIMENSIONS};
pub use error::{IngestError, RagError, Result};
pub use extractor::{extract_text, LopdfExtractor, PageText, PdfExtractor};
pub use index::{BuildReport, IndexHandle, SearchHit, VectorIndex};
pub use ingest::{
    digest_file, discover_documents, load_document, load_documents, load_documents_best_effort,
    IngestionReport, SkippedFile,
};
pub use models::{
    ChatTurn, Chunk, CompletionRequest, CompletionResponse, Document, DocumentMetadata,
    EmbeddingRecord, Generation, GenerationRequest, RetrievalResult, RetrievedChunk, Role,
    TokenUsage,
};
pub use orchestrator::{CompletionOrchestrator, CompletionSettings, CompletionStream};
pub use providers::{OpenAiChatGenerator, OpenAiEmbedder};
pub use resilience::CallPolicy;
pub use retriever::Retriever;
pub use traits::{Embedder, TextGenerator, TextStream, DEFAULT_EMBED_BATCH_SIZE};
