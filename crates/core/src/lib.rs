pub mod chunking;
pub mod config;
pub mod embeddings;
pub mod error;
pub mod extractor;
pub mod gemini;
pub mod indexer;
pub mod ingest;
pub mod models;
pub mod query;
pub mod store;
pub mod stores;
pub mod tables;
pub mod traits;

pub use chunking::{normalize_whitespace, Chunker, ChunkingConfig};
pub use config::GeminiConfig;
pub use embeddings::{
    CharacterNgramEmbedder, Embedder, EmbeddingTask, RetryPolicy, DEFAULT_EMBEDDING_DIMENSIONS,
};
pub use error::{
    ConfigError, EmbeddingError, IndexError, IngestError, SearchError, StoreError,
    TableDetectionError,
};
pub use extractor::{extract_page_texts, LopdfExtractor, PageText, PdfExtractor};
pub use gemini::{GeminiEmbeddingProvider, GeminiGenerator};
pub use indexer::{CancellationFlag, Indexer};
pub use ingest::{content_hash, discover_documents, document_id_for, DocumentLoader, SourceFile};
pub use models::{
    Answer, Chunk, ChunkLocation, Document, DocumentKind, DocumentOutcome, DocumentReport,
    DocumentStructure, FailureKind, IndexEntry, IndexOptions, IndexSummary, QueryOptions,
    QueryRequest, QueryResponse, RetrievalResult, SearchFilter,
};
pub use query::{build_context, build_prompt, QueryEngine};
pub use store::{CollectionInfo, DistanceMetric, DocumentRecord, ScoredEntry};
pub use stores::LocalVectorStore;
pub use tables::{
    parse_detection_report, BoundingBox, CommandTableDetector, TableDetection,
    TableDetectionOptions,
};
pub use traits::{AnswerGenerator, EmbeddingProvider, TableDetector, VectorStore};
