use anyhow::Context;
use chrono::Utc;
use clap::{Parser, Subcommand, ValueEnum};
use procurement_rag_core::{
    AnswerGenerator, CancellationFlag, CharacterNgramEmbedder, ChunkLocation, Chunker, ChunkingConfig,
    CommandTableDetector, ConfigError, DocumentKind, DocumentLoader, DocumentOutcome, Embedder,
    EmbeddingProvider, GeminiConfig, GeminiEmbeddingProvider, GeminiGenerator, IndexError,
    IndexOptions, IndexSummary, Indexer, IngestError, LocalVectorStore, QueryEngine, QueryOptions,
    QueryRequest, QueryResponse, SearchError, SearchFilter, StoreError, TableDetectionError,
    TableDetectionOptions, TableDetector,
};
use std::future::Future;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const EXIT_FATAL: u8 = 1;
const EXIT_PARTIAL: u8 = 2;
const EXIT_CONFIG: u8 = 3;
/// Shell convention for termination by SIGINT.
const EXIT_INTERRUPTED: i32 = 130;

#[derive(Parser)]
#[command(name = "procurement-rag", version, about = "Index procurement documents and query them with sources.")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Embedding provider.
    #[arg(long, value_enum, default_value = "gemini", env = "RAG_PROVIDER", global = true)]
    provider: Provider,

    /// Vector size of the local provider.
    #[arg(long, default_value_t = 256, global = true)]
    local_dimensions: usize,
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Provider {
    /// Hosted Gemini embeddings; needs GOOGLE_API_KEY.
    Gemini,
    /// Offline character-trigram hashing.
    Local,
}

#[derive(Clone, Copy, ValueEnum)]
enum KindArg {
    Csv,
    Pdf,
    Text,
}

impl From<KindArg> for DocumentKind {
    fn from(value: KindArg) -> Self {
        match value {
            KindArg::Csv => DocumentKind::Csv,
            KindArg::Pdf => DocumentKind::Pdf,
            KindArg::Text => DocumentKind::Text,
        }
    }
}

#[derive(Subcommand)]
enum Command {
    /// Index documents into a persistent collection.
    IndexDocs {
        /// Folder with PDFs, CSVs and text files.
        #[arg(long, default_value = "data")]
        data_dir: PathBuf,
        /// Storage path for collections.
        #[arg(long, default_value = "chroma")]
        persist_dir: PathBuf,
        #[arg(long, default_value = "procurement_docs")]
        collection: String,
        /// Chunk size in chars.
        #[arg(long, default_value_t = 1000)]
        chunk_size: usize,
        /// Chunk overlap in chars.
        #[arg(long, default_value_t = 150)]
        overlap: usize,
        /// Embedding batch size.
        #[arg(long, default_value_t = 32)]
        batch_size: usize,
        /// Documents processed in parallel.
        #[arg(long, default_value_t = 4)]
        concurrency: usize,
        /// Reset collection before indexing.
        #[arg(long, default_value_t = false)]
        reset: bool,
        /// Remove documents that are no longer in the data directory.
        #[arg(long, default_value_t = false)]
        prune: bool,
    },
    /// Query the index and answer from the retrieved context.
    Query {
        /// User question.
        #[arg(long)]
        query: String,
        #[arg(long, default_value = "chroma")]
        persist_dir: PathBuf,
        #[arg(long, default_value = "procurement_docs")]
        collection: String,
        /// Number of chunks to retrieve.
        #[arg(long, default_value_t = 4)]
        top_k: usize,
        /// Print source paths.
        #[arg(long, default_value_t = false)]
        show_sources: bool,
        /// Print retrieved chunks instead of asking the model.
        #[arg(long, default_value_t = false)]
        no_answer: bool,
        /// Only search documents of this kind.
        #[arg(long, value_enum)]
        kind: Option<KindArg>,
        /// Only search sources under this path prefix.
        #[arg(long)]
        path_prefix: Option<String>,
        #[arg(long, default_value_t = 30)]
        timeout_secs: u64,
        #[arg(long, default_value_t = 8000)]
        max_context_chars: usize,
    },
    /// Run table detection on a document image.
    DetectTables {
        /// Path to input image (PNG/JPG).
        #[arg(long)]
        image: PathBuf,
        #[arg(long, default_value = "outputs")]
        out_dir: PathBuf,
        /// Detector program.
        #[arg(long, default_value = "python3", env = "TABLE_DETECTOR")]
        detector: String,
        /// Leading detector arguments, repeatable.
        #[arg(long = "detector-arg", default_value = "cv/table_detect.py")]
        detector_args: Vec<String>,
        /// Adaptive threshold block size (odd).
        #[arg(long, default_value_t = 25)]
        block_size: u32,
        #[arg(long, default_value_t = 15, allow_negative_numbers = true)]
        c_value: i32,
        #[arg(long, default_value_t = 30)]
        kernel_scale: u32,
        #[arg(long, default_value_t = 2)]
        dilate_iters: u32,
        /// Min area as ratio of image area.
        #[arg(long, default_value_t = 0.01)]
        min_area_ratio: f64,
        #[arg(long, default_value_t = 120)]
        min_width: u32,
        #[arg(long, default_value_t = 80)]
        min_height: u32,
        #[arg(long, default_value_t = 0.3)]
        min_aspect: f64,
        #[arg(long, default_value_t = 6.0)]
        max_aspect: f64,
    },
    /// Validate GOOGLE_API_KEY with one embedding call.
    CheckKey,
}

#[tokio::main]
async fn main() -> ExitCode {
    let _ = dotenvy::dotenv();

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    info!(
        version = env!("CARGO_PKG_VERSION"),
        started_at = %Utc::now().to_rfc3339(),
        "procurement-rag boot"
    );

    match run(cli).await {
        Ok(code) => ExitCode::from(code),
        Err(error) => {
            eprintln!("error: {error:#}");
            ExitCode::from(exit_code(&error))
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<u8> {
    match cli.command {
        Command::IndexDocs {
            data_dir,
            persist_dir,
            collection,
            chunk_size,
            overlap,
            batch_size,
            concurrency,
            reset,
            prune,
        } => {
            let provider = embedding_provider(cli.provider, cli.local_dimensions)?;
            let chunker = Chunker::new(ChunkingConfig {
                chunk_size,
                overlap,
            })?;
            let store = LocalVectorStore::open(&persist_dir)?;

            println!("Loading documents from: {}", data_dir.display());
            println!("Persist dir: {}", persist_dir.display());
            println!("Collection: {collection}");

            let indexer = Indexer::new(
                DocumentLoader::default(),
                chunker,
                Embedder::new(provider).with_batch_size(batch_size),
                Arc::new(store),
            )
            .with_options(IndexOptions {
                concurrency,
                prune_missing: prune,
            });

            if reset {
                indexer.reset_collection(&collection).await?;
            }

            let cancel = CancellationFlag::new();
            let on_interrupt = cancel.clone();
            tokio::spawn(async move {
                if watch_interrupts(on_interrupt, tokio::signal::ctrl_c).await {
                    eprintln!("aborted");
                    std::process::exit(EXIT_INTERRUPTED);
                }
            });

            let summary = indexer
                .index_directory(&data_dir, &collection, &cancel)
                .await?;
            print_summary(&summary);

            Ok(summary_exit_code(&summary))
        }
        Command::Query {
            query,
            persist_dir,
            collection,
            top_k,
            show_sources,
            no_answer,
            kind,
            path_prefix,
            timeout_secs,
            max_context_chars,
        } => {
            let provider = embedding_provider(cli.provider, cli.local_dimensions)?;
            let generator: Option<Box<dyn AnswerGenerator>> = if no_answer {
                None
            } else {
                Some(Box::new(GeminiGenerator::new(GeminiConfig::from_env()?)))
            };

            if !persist_dir.is_dir() {
                return Err(ConfigError::Invalid(format!(
                    "persist directory not found: {}",
                    persist_dir.display()
                ))
                .into());
            }
            println!("Loading index from: {}", persist_dir.display());
            println!("Collection: {collection}");

            let engine = QueryEngine::new(
                Embedder::new(provider),
                Arc::new(LocalVectorStore::open(&persist_dir)?),
            )
            .with_options(QueryOptions {
                timeout: Duration::from_secs(timeout_secs),
                max_context_chars,
            });

            let mut request = QueryRequest::new(query, collection, top_k).with_sources(show_sources);
            if kind.is_some() || path_prefix.is_some() {
                request = request.with_filter(SearchFilter {
                    kind: kind.map(DocumentKind::from),
                    path_prefix,
                    ..SearchFilter::default()
                });
            }

            match generator {
                Some(generator) => {
                    let answer = engine.answer(&request, generator.as_ref()).await?;
                    match answer.text {
                        Some(text) => {
                            println!("\nAnswer:\n");
                            println!("{text}");
                            if show_sources {
                                print_sources(&answer.response);
                            }
                        }
                        None => println!("\nNo results."),
                    }
                }
                None => {
                    let response = engine.query(&request).await?;
                    print_results(&response, show_sources);
                }
            }
            Ok(0)
        }
        Command::DetectTables {
            image,
            out_dir,
            detector,
            detector_args,
            block_size,
            c_value,
            kernel_scale,
            dilate_iters,
            min_area_ratio,
            min_width,
            min_height,
            min_aspect,
            max_aspect,
        } => {
            println!("Loading image: {}", image.display());
            println!("Output dir: {}", out_dir.display());

            let detector = CommandTableDetector::new(detector, &out_dir)
                .with_args(detector_args)
                .with_options(TableDetectionOptions {
                    block_size,
                    c_value,
                    kernel_scale,
                    dilate_iterations: dilate_iters,
                    min_area_ratio,
                    min_width,
                    min_height,
                    min_aspect,
                    max_aspect,
                });
            let detection = detector.detect(&image).await?;

            println!("Table detection complete.");
            println!("- Boxes JSON: {}", out_dir.join("tables.json").display());
            if let Some(overlay) = &detection.debug_overlay {
                println!("- Overlay: {}", overlay.display());
            }
            println!("- Tables found: {}", detection.tables.len());
            for (index, table) in detection.tables.iter().enumerate() {
                println!(
                    "  [{}] x={} y={} w={} h={} area={:.0} aspect={:.2}",
                    index + 1,
                    table.x,
                    table.y,
                    table.w,
                    table.h,
                    table.area,
                    table.aspect
                );
            }
            Ok(0)
        }
        Command::CheckKey => {
            let config = GeminiConfig::from_env()?;
            let embedder = Embedder::new(Arc::new(GeminiEmbeddingProvider::new(config)));
            let vector = embedder
                .embed_query("key validation")
                .await
                .context("embedding call failed")?;
            println!("OK");
            println!("Embedding dimensions: {}", vector.len());
            Ok(0)
        }
    }
}

/// Credentials are resolved here, before any document is touched.
fn embedding_provider(
    provider: Provider,
    local_dimensions: usize,
) -> Result<Arc<dyn EmbeddingProvider>, ConfigError> {
    match provider {
        Provider::Gemini => {
            let config = GeminiConfig::from_env()?;
            info!(
                model = %config.embedding_model,
                dimensions = config.embedding_dimensions,
                "using gemini embeddings"
            );
            Ok(Arc::new(GeminiEmbeddingProvider::new(config)))
        }
        Provider::Local => {
            if local_dimensions == 0 {
                return Err(ConfigError::Invalid(
                    "--local-dimensions must be positive".to_string(),
                ));
            }
            Ok(Arc::new(CharacterNgramEmbedder {
                dimensions: local_dimensions,
            }))
        }
    }
}

fn print_summary(summary: &IndexSummary) {
    println!();
    println!("{:<10} {:>6}  SOURCE", "STATUS", "CHUNKS");
    for report in &summary.documents {
        let chunks = match &report.outcome {
            DocumentOutcome::Indexed { chunks } => chunks.to_string(),
            _ => "-".to_string(),
        };
        match &report.outcome {
            DocumentOutcome::Failed { kind, reason } => println!(
                "{:<10} {:>6}  {} ({}: {})",
                report.outcome.label(),
                chunks,
                report.source_path,
                kind.as_str(),
                reason
            ),
            _ => println!(
                "{:<10} {:>6}  {}",
                report.outcome.label(),
                chunks,
                report.source_path
            ),
        }
    }
    println!();
    println!(
        "indexed={} skipped={} failed={} cancelled={} removed={}",
        summary.indexed(),
        summary.skipped(),
        summary.failed(),
        summary.cancelled(),
        summary.removed
    );
}

fn print_results(response: &QueryResponse, show_sources: bool) {
    if response.is_empty() {
        println!("No results.");
        return;
    }

    for (rank, result) in response.results.iter().enumerate() {
        println!(
            "[{}] score={:.4} chunk={} document_id={}",
            rank + 1,
            result.score,
            result.chunk_id,
            result.document_id
        );
        if show_sources {
            if let Some(path) = &result.source_path {
                println!("  source={path}{}", location_suffix(result.location));
            }
        }
        println!("{}\n", result.text);
    }
}

fn print_sources(response: &QueryResponse) {
    println!("\nSources:");
    for result in &response.results {
        if let Some(path) = &result.source_path {
            println!(
                "- {path}{} (chunk {}, score {:.4})",
                location_suffix(result.location),
                result.chunk_id,
                result.score
            );
        }
    }
}

fn location_suffix(location: ChunkLocation) -> String {
    match location {
        ChunkLocation::Text => String::new(),
        ChunkLocation::Rows { first, last } => format!(" rows {}-{}", first + 1, last + 1),
        ChunkLocation::Pages { first, last } if first == last => format!(" page {first}"),
        ChunkLocation::Pages { first, last } => format!(" pages {first}-{last}"),
    }
}

/// 3 for configuration problems, 1 for everything else.
/// The first interrupt cancels the run; returns `true` if a second one
/// arrives before the run finishes.
async fn watch_interrupts<F, Fut>(cancel: CancellationFlag, mut next_signal: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::io::Result<()>>,
{
    if next_signal().await.is_err() {
        return false;
    }
    warn!("interrupt received, finishing documents in progress (Ctrl-C again to abort)");
    cancel.cancel();
    next_signal().await.is_ok()
}

/// Failed and interrupted runs both leave documents unindexed.
fn summary_exit_code(summary: &IndexSummary) -> u8 {
    if summary.is_complete() {
        0
    } else {
        EXIT_PARTIAL
    }
}

fn exit_code(error: &anyhow::Error) -> u8 {
    for cause in error.chain() {
        if cause.downcast_ref::<ConfigError>().is_some() {
            return EXIT_CONFIG;
        }
        if let Some(error) = cause.downcast_ref::<IndexError>() {
            return match error {
                IndexError::Config(_)
                | IndexError::DimensionMismatch { .. }
                | IndexError::InvalidArgument(_) => EXIT_CONFIG,
                IndexError::Store(_) => EXIT_FATAL,
            };
        }
        if let Some(error) = cause.downcast_ref::<SearchError>() {
            return match error {
                SearchError::DimensionMismatch { .. } | SearchError::Request(_) => EXIT_CONFIG,
                SearchError::Store(StoreError::InvalidCollectionName(_)) => EXIT_CONFIG,
                _ => EXIT_FATAL,
            };
        }
        if let Some(error) = cause.downcast_ref::<StoreError>() {
            return match error {
                StoreError::DimensionMismatch { .. } | StoreError::InvalidCollectionName(_) => {
                    EXIT_CONFIG
                }
                _ => EXIT_FATAL,
            };
        }
        if let Some(IngestError::InvalidChunkConfig(_)) = cause.downcast_ref::<IngestError>() {
            return EXIT_CONFIG;
        }
        if let Some(error) = cause.downcast_ref::<TableDetectionError>() {
            return match error {
                TableDetectionError::InvalidOptions(_) | TableDetectionError::ImageNotFound(_) => {
                    EXIT_CONFIG
                }
                _ => EXIT_FATAL,
            };
        }
    }
    EXIT_FATAL
}
