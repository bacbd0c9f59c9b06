mod server;

use anyhow::Context;
use chrono::Utc;
use clap::{Parser, Subcommand};
use futures::StreamExt;
use rag_service_core::{
    load_documents_best_effort, CharacterNgramEmbedder, CompletionOrchestrator,
    CompletionRequest, Embedder, IndexHandle, OpenAiChatGenerator, OpenAiEmbedder, Retriever,
    ServiceConfig, VectorIndex,
};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "rag-service", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// YAML configuration file; defaults apply when it is missing.
    #[arg(long, global = true, default_value = "config.yaml")]
    config: PathBuf,

    /// Directory holding the persisted vector index.
    #[arg(long, global = true, env = "RAG_INDEX_DIR", default_value = "./vector_db")]
    index_dir: PathBuf,

    /// Overrides `embedding.base_url`.
    #[arg(long, global = true)]
    embedding_url: Option<String>,

    /// Overrides `generation.base_url`.
    #[arg(long, global = true)]
    generation_url: Option<String>,

    /// Bearer token sent to the embedding and generation servers.
    #[arg(long, global = true, env = "OPENAI_API_KEY", hide_env_values = true)]
    api_key: Option<String>,

    /// Embed with the built-in character n-gram embedder instead of a server.
    #[arg(long, global = true, default_value_t = false)]
    local_embedder: bool,
}

#[derive(Subcommand)]
enum Command {
    /// Chunk, embed and index a document or a folder of documents.
    Ingest {
        /// File or folder (txt, md, markdown, pdf).
        #[arg(long)]
        document: PathBuf,
        /// Chunk length in characters.
        #[arg(long)]
        chunk_size: Option<usize>,
        /// Characters shared by consecutive chunks.
        #[arg(long)]
        chunk_overlap: Option<usize>,
        /// Replace the whole index instead of appending.
        #[arg(long, default_value_t = false)]
        force_rebuild: bool,
    },
    /// Print the chunks most similar to a query.
    Query {
        #[arg(long)]
        query: String,
        #[arg(long)]
        top_k: Option<usize>,
        /// Minimum cosine similarity.
        #[arg(long)]
        threshold: Option<f32>,
    },
    /// Answer a query with retrieved context.
    Complete {
        #[arg(long)]
        query: String,
        #[arg(long)]
        threshold: Option<f32>,
        #[arg(long)]
        top_k: Option<usize>,
        /// Print the retrieved chunks with the answer.
        #[arg(long, default_value_t = false)]
        return_context: bool,
        /// Print the answer as it is generated.
        #[arg(long, default_value_t = false)]
        stream: bool,
    },
    /// Serve the completion API over HTTP.
    Serve {
        #[arg(long, default_value = "127.0.0.1")]
        host: String,
        #[arg(long, default_value = "8000")]
        port: u16,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let app_version = env!("CARGO_PKG_VERSION");

    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env())
        .with(fmt::layer())
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli)?;

    info!(
        version = app_version,
        started_at = %Utc::now().to_rfc3339(),
        index_dir = %cli.index_dir.display(),
        "rag-service boot"
    );

    match &cli.command {
        Command::Ingest {
            document,
            chunk_size,
            chunk_overlap,
            force_rebuild,
        } => {
            let mut config = config;
            if let Some(chunk_size) = chunk_size {
                config.chunk_size = *chunk_size;
            }
            if let Some(chunk_overlap) = chunk_overlap {
                config.chunk_overlap = *chunk_overlap;
            }
            let chunker = config.chunker()?;

            let report = load_documents_best_effort(document)?;
            for skipped in &report.skipped_files {
                warn!(path = %skipped.path.display(), reason = %skipped.reason, "skipped document");
            }
            if report.documents.is_empty() {
                println!("0 documents ingested (all files were skipped)");
                return Ok(());
            }

            let embedder = build_embedder(&cli, &config)?;
            let handle = open_index(&cli.index_dir)?;
            let rebuild = *force_rebuild || !VectorIndex::exists(&cli.index_dir);
            let build = if rebuild {
                handle
                    .rebuild(&report.documents, &chunker, embedder.as_ref(), &config.call_policy())
                    .await?
            } else {
                handle
                    .ingest(&report.documents, &chunker, embedder.as_ref(), &config.call_policy())
                    .await?
            };

            println!(
                "{} documents indexed, {} skipped, {} removed, {} chunks added, {} records total ({})",
                build.documents_indexed,
                build.documents_skipped,
                build.documents_removed,
                build.chunks_indexed,
                build.total_records,
                if rebuild { "rebuilt" } else { "appended" }
            );
        }
        Command::Query {
            query,
            top_k,
            threshold,
        } => {
            let retriever = build_retriever(&cli, &config)?;
            let result = retriever
                .retrieve(
                    query,
                    threshold.unwrap_or(config.similarity_threshold),
                    top_k.unwrap_or(config.top_k),
                )
                .await?;

            if result.is_empty() {
                println!("no chunks cleared the similarity threshold");
            }
            for (rank, hit) in result.hits.iter().enumerate() {
                println!(
                    "[{}] score={:.4} chunk={} document_id={}",
                    rank + 1,
                    hit.score,
                    hit.chunk_index,
                    hit.document_id
                );
                if let Some(source) = &hit.source_path {
                    println!("  source={source}");
                }
                println!("  chunk_text:\n{}", hit.text);
            }
        }
        Command::Complete {
            query,
            threshold,
            top_k,
            return_context,
            stream,
        } => {
            let orchestrator = build_orchestrator(&cli, &config)?;
            let request = CompletionRequest {
                similarity_threshold: *threshold,
                top_k: *top_k,
                return_context: *return_context,
                ..CompletionRequest::new(query.as_str())
            };
            if !*stream {
                let response = orchestrator.complete(&request).await?;
                println!("{}", serde_json::to_string_pretty(&response)?);
                return Ok(());
            }

            let mut streamed = orchestrator.complete_stream(&request).await?;
            if let Some(context) = &streamed.context {
                println!("{}", serde_json::to_string_pretty(context)?);
            }
            if !streamed.grounded {
                eprintln!("(no chunk cleared the similarity threshold)");
            }
            let mut stdout = std::io::stdout();
            while let Some(delta) = streamed.deltas.next().await {
                write!(stdout, "{}", delta?)?;
                stdout.flush()?;
            }
            writeln!(stdout)?;
        }
        Command::Serve { host, port } => {
            let orchestrator = build_orchestrator(&cli, &config)?;
            let state = server::AppState {
                orchestrator: Arc::new(orchestrator),
            };
            server::run_server(state, host, *port).await?;
        }
    }

    Ok(())
}

fn load_config(cli: &Cli) -> anyhow::Result<ServiceConfig> {
    let mut config = ServiceConfig::load(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    if let Some(url) = &cli.embedding_url {
        config.embedding.base_url = url.clone();
    }
    if let Some(url) = &cli.generation_url {
        config.generation.base_url = url.clone();
    }
    config.validate()?;
    Ok(config)
}

fn open_index(dir: &Path) -> anyhow::Result<Arc<IndexHandle>> {
    let handle = IndexHandle::open(dir)
        .with_context(|| format!("opening index in {}", dir.display()))?;
    Ok(Arc::new(handle))
}

fn build_embedder(cli: &Cli, config: &ServiceConfig) -> anyhow::Result<Arc<dyn Embedder>> {
    if cli.local_embedder {
        return Ok(Arc::new(CharacterNgramEmbedder::default()));
    }
    Ok(Arc::new(OpenAiEmbedder::new(
        &config.embedding,
        cli.api_key.clone(),
    )?))
}

fn build_retriever(cli: &Cli, config: &ServiceConfig) -> anyhow::Result<Retriever> {
    let handle = open_index(&cli.index_dir)?;
    if handle.snapshot().is_empty() {
        warn!(index_dir = %cli.index_dir.display(), "index is empty, run `ingest` first");
    }
    Ok(Retriever::new(build_embedder(cli, config)?, handle).with_policy(config.call_policy()))
}

fn build_orchestrator(cli: &Cli, config: &ServiceConfig) -> anyhow::Result<CompletionOrchestrator> {
    let generator = OpenAiChatGenerator::new(&config.generation, cli.api_key.clone())?;
    Ok(CompletionOrchestrator::new(
        build_retriever(cli, config)?,
        Arc::new(generator),
        config.completion_settings(),
    )
    .with_policy(config.call_policy()))
}
