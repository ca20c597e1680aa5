use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum DocumentKind {
    Csv,
    Pdf,
    Text,
    Image,
}

impl DocumentKind {
    pub fn from_path(path: &Path) -> Option<Self> {
        let ext = path.extension()?.to_str()?.to_ascii_lowercase();
        match ext.as_str() {
            "csv" => Some(Self::Csv),
            "pdf" => Some(Self::Pdf),
            "txt" | "md" => Some(Self::Text),
            "png" | "jpg" | "jpeg" => Some(Self::Image),
            _ => None,
        }
    }

    /// Images only feed table detection, never the text pipeline.
    pub fn is_indexable(self) -> bool {
        !matches!(self, Self::Image)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Csv => "csv",
            Self::Pdf => "pdf",
            Self::Text => "text",
            Self::Image => "image",
        }
    }
}

/// Char range `[start, end)` into `Document::raw_text`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct TextSpan {
    pub start: usize,
    pub end: usize,
}

impl TextSpan {
    pub fn len(&self) -> usize {
        self.end.saturating_sub(self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct PageSpan {
    pub number: u32,
    pub span: TextSpan,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "layout", rename_all = "snake_case")]
pub enum DocumentStructure {
    Plain,
    /// Row-oriented source; rows are never split across chunks.
    Rows { rows: Vec<TextSpan> },
    Pages { pages: Vec<PageSpan> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Document {
    pub id: String,
    pub source_path: String,
    pub kind: DocumentKind,
    pub raw_text: String,
    pub structure: DocumentStructure,
    pub content_hash: String,
}

impl Document {
    pub fn char_len(&self) -> usize {
        self.raw_text.chars().count()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "unit", rename_all = "snake_case")]
pub enum ChunkLocation {
    Text,
    Rows { first: usize, last: usize },
    Pages { first: u32, last: u32 },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Chunk {
    pub id: String,
    pub document_id: String,
    pub sequence_index: u64,
    pub text: String,
    pub start_offset: usize,
    pub end_offset: usize,
    pub location: ChunkLocation,
}

/// The persisted unit: a chunk, its vector and its provenance.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IndexEntry {
    pub chunk: Chunk,
    #[serde(with = "crate::store::vector_codec")]
    pub embedding: Vec<f32>,
    pub source_path: String,
    pub kind: DocumentKind,
    pub content_hash: String,
    pub indexed_at: DateTime<Utc>,
}

impl IndexEntry {
    pub fn id(&self) -> &str {
        &self.chunk.id
    }

    pub fn document_id(&self) -> &str {
        &self.chunk.document_id
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct SearchFilter {
    pub document_id: Option<String>,
    pub kind: Option<DocumentKind>,
    pub path_prefix: Option<String>,
}

impl SearchFilter {
    pub fn matches(&self, entry: &IndexEntry) -> bool {
        if let Some(document_id) = &self.document_id {
            if entry.document_id() != document_id {
                return false;
            }
        }
        if let Some(kind) = self.kind {
            if entry.kind != kind {
                return false;
            }
        }
        if let Some(prefix) = &self.path_prefix {
            if !entry.source_path.starts_with(prefix.as_str()) {
                return false;
            }
        }
        true
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetrievalResult {
    pub chunk_id: String,
    pub document_id: String,
    pub sequence_index: u64,
    pub text: String,
    pub score: f32,
    /// Present only when sources were requested.
    pub source_path: Option<String>,
    pub location: ChunkLocation,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryRequest {
    pub text: String,
    pub top_k: usize,
    pub collection: String,
    pub filter: Option<SearchFilter>,
    pub show_sources: bool,
}

impl QueryRequest {
    pub fn new(text: impl Into<String>, collection: impl Into<String>, top_k: usize) -> Self {
        Self {
            text: text.into(),
            top_k,
            collection: collection.into(),
            filter: None,
            show_sources: false,
        }
    }

    pub fn with_sources(mut self, show_sources: bool) -> Self {
        self.show_sources = show_sources;
        self
    }

    pub fn with_filter(mut self, filter: SearchFilter) -> Self {
        self.filter = Some(filter);
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueryResponse {
    pub query: String,
    pub results: Vec<RetrievalResult>,
    pub context: String,
}

impl QueryResponse {
    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Answer {
    /// `None` when retrieval found nothing to ground an answer in.
    pub text: Option<String>,
    pub response: QueryResponse,
}

#[derive(Debug, Clone)]
pub struct IndexOptions {
    /// Documents processed at the same time.
    pub concurrency: usize,
    /// Remove entries of documents no longer present in the data directory.
    pub prune_missing: bool,
}

impl Default for IndexOptions {
    fn default() -> Self {
        Self {
            concurrency: 4,
            prune_missing: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct QueryOptions {
    pub timeout: Duration,
    pub max_context_chars: usize,
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            max_context_chars: 8_000,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    UnsupportedFormat,
    CorruptSource,
    EmbeddingUnavailable,
    EmbeddingRejected,
}

impl FailureKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::UnsupportedFormat => "unsupported_format",
            Self::CorruptSource => "corrupt_source",
            Self::EmbeddingUnavailable => "embedding_unavailable",
            Self::EmbeddingRejected => "embedding_rejected",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum DocumentOutcome {
    Indexed { chunks: usize },
    Skipped,
    Failed { kind: FailureKind, reason: String },
    Cancelled,
}

impl DocumentOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Indexed { .. } => "indexed",
            Self::Skipped => "unchanged",
            Self::Failed { .. } => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DocumentReport {
    pub source_path: String,
    pub document_id: String,
    pub outcome: DocumentOutcome,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct IndexSummary {
    pub collection: String,
    pub documents: Vec<DocumentReport>,
    pub removed: usize,
}

impl IndexSummary {
    pub fn indexed(&self) -> usize {
        self.count(|outcome| matches!(outcome, DocumentOutcome::Indexed { .. }))
    }

    pub fn skipped(&self) -> usize {
        self.count(|outcome| matches!(outcome, DocumentOutcome::Skipped))
    }

    pub fn failed(&self) -> usize {
        self.count(|outcome| matches!(outcome, DocumentOutcome::Failed { .. }))
    }

    pub fn cancelled(&self) -> usize {
        self.count(|outcome| matches!(outcome, DocumentOutcome::Cancelled))
    }

    pub fn failures(&self) -> impl Iterator<Item = &DocumentReport> {
        self.documents
            .iter()
            .filter(|report| matches!(report.outcome, DocumentOutcome::Failed { .. }))
    }

    pub fn is_partial_failure(&self) -> bool {
        self.failed() > 0
    }

    /// Every discovered document was either indexed or already current.
    pub fn is_complete(&self) -> bool {
        self.failed() == 0 && self.cancelled() == 0
    }

    fn count(&self, predicate: impl Fn(&DocumentOutcome) -> bool) -> usize {
        self.documents
            .iter()
            .filter(|report| predicate(&report.outcome))
            .count()
    }
}
