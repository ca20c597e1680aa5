use crate::chunking::Chunker;
use crate::embeddings::Embedder;
use crate::ingest::{discover_documents, document_id_for, DocumentLoader, SourceFile};
use crate::models::{
    Chunk, Document, DocumentOutcome, DocumentReport, FailureKind, IndexEntry, IndexOptions,
    IndexSummary,
};
use crate::store::DocumentRecord;
use crate::traits::VectorStore;
use crate::{EmbeddingError, IndexError, IngestError, StoreError};
use chrono::Utc;
use futures::{stream, StreamExt, TryStreamExt};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{info, warn};

/// Shared stop signal checked before each document starts.
#[derive(Debug, Clone, Default)]
pub struct CancellationFlag(Arc<AtomicBool>);

impl CancellationFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

type DocumentLocks = Mutex<HashMap<(String, String), Arc<tokio::sync::Mutex<()>>>>;

pub struct Indexer {
    loader: DocumentLoader,
    chunker: Chunker,
    embedder: Embedder,
    store: Arc<dyn VectorStore>,
    options: IndexOptions,
    locks: DocumentLocks,
}

impl Indexer {
    pub fn new(
        loader: DocumentLoader,
        chunker: Chunker,
        embedder: Embedder,
        store: Arc<dyn VectorStore>,
    ) -> Self {
        Self {
            loader,
            chunker,
            embedder,
            store,
            options: IndexOptions::default(),
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_options(mut self, options: IndexOptions) -> Self {
        self.options = options;
        self
    }

    pub fn options(&self) -> &IndexOptions {
        &self.options
    }

    /// Drops the collection and everything in it.
    pub async fn reset_collection(&self, collection: &str) -> Result<bool, IndexError> {
        let removed = self.store.delete_collection(collection).await?;
        if removed {
            info!(collection, "collection reset");
        }
        Ok(removed)
    }

    /// Index every supported file under `data_dir`.
    ///
    /// Per-document load and embedding failures are recorded in the summary.
    /// Store failures and dimension conflicts abort the batch.
    pub async fn index_directory(
        &self,
        data_dir: &Path,
        collection: &str,
        cancel: &CancellationFlag,
    ) -> Result<IndexSummary, IndexError> {
        if !data_dir.is_dir() {
            return Err(IndexError::InvalidArgument(format!(
                "data directory not found: {}",
                data_dir.display()
            )));
        }

        self.store
            .open_collection(collection, self.embedder.dimensions())
            .await
            .map_err(|error| match error {
                StoreError::DimensionMismatch {
                    expected, actual, ..
                } => IndexError::DimensionMismatch { expected, actual },
                other => IndexError::Store(other),
            })?;

        let sources = discover_documents(data_dir);
        info!(
            collection,
            documents = sources.len(),
            model = self.embedder.model(),
            "indexing started"
        );

        let documents = stream::iter(sources.iter())
            .map(|source| self.index_document(source, collection, cancel))
            .buffered(self.options.concurrency.max(1))
            .try_collect::<Vec<_>>()
            .await?;

        let mut summary = IndexSummary {
            collection: collection.to_string(),
            documents,
            removed: 0,
        };

        if self.options.prune_missing && !cancel.is_cancelled() {
            summary.removed = self.prune(collection, &sources).await?;
        }

        info!(
            collection,
            indexed = summary.indexed(),
            skipped = summary.skipped(),
            failed = summary.failed(),
            cancelled = summary.cancelled(),
            removed = summary.removed,
            "indexing finished"
        );
        Ok(summary)
    }

    async fn index_document(
        &self,
        source: &SourceFile,
        collection: &str,
        cancel: &CancellationFlag,
    ) -> Result<DocumentReport, IndexError> {
        let document_id = document_id_for(&source.relative);
        let report = |outcome| DocumentReport {
            source_path: source.path.to_string_lossy().to_string(),
            document_id: document_id.clone(),
            outcome,
        };

        if cancel.is_cancelled() {
            return Ok(report(DocumentOutcome::Cancelled));
        }

        let lease = self.document_lock(collection, &document_id);
        let _guard = lease.lock.lock().await;

        let document = match self.load(source).await {
            Ok(document) => document,
            Err(error) => {
                warn!(path = %source.path.display(), error = %error, "failed to load document");
                return Ok(report(DocumentOutcome::Failed {
                    kind: ingest_failure_kind(&error),
                    reason: error.to_string(),
                }));
            }
        };

        if let Some(record) = self.store.document_record(collection, &document.id).await? {
            if record.content_hash == document.content_hash {
                info!(path = %source.path.display(), "unchanged");
                return Ok(report(DocumentOutcome::Skipped));
            }
        }

        let chunks = self.chunker.chunks(&document).collect::<Vec<_>>();
        let entries = match self.embed(&document, chunks).await {
            Ok(entries) => entries,
            Err(EmbeddingError::DimensionMismatch { expected, actual }) => {
                return Err(IndexError::DimensionMismatch { expected, actual })
            }
            Err(error) => {
                warn!(path = %source.path.display(), error = %error, "failed to embed document");
                let kind = match error {
                    EmbeddingError::Rejected(_) => FailureKind::EmbeddingRejected,
                    _ => FailureKind::EmbeddingUnavailable,
                };
                return Ok(report(DocumentOutcome::Failed {
                    kind,
                    reason: error.to_string(),
                }));
            }
        };

        let record = DocumentRecord::from_entries(
            &document.id,
            &document.source_path,
            &document.content_hash,
            &entries,
        );
        self.store
            .replace_document(collection, record, &entries)
            .await?;

        info!(path = %source.path.display(), chunks = entries.len(), "indexed");
        Ok(report(DocumentOutcome::Indexed {
            chunks: entries.len(),
        }))
    }

    async fn load(&self, source: &SourceFile) -> Result<Document, IngestError> {
        let loader = self.loader.clone();
        let source = source.clone();
        tokio::task::spawn_blocking(move || loader.load(&source))
            .await
            .map_err(|error| IngestError::Io(std::io::Error::other(error)))?
    }

    async fn embed(
        &self,
        document: &Document,
        chunks: Vec<Chunk>,
    ) -> Result<Vec<IndexEntry>, EmbeddingError> {
        let texts = chunks
            .iter()
            .map(|chunk| chunk.text.clone())
            .collect::<Vec<_>>();
        let vectors = self.embedder.embed(&texts).await?;
        let indexed_at = Utc::now();

        Ok(chunks
            .into_iter()
            .zip(vectors)
            .map(|(chunk, embedding)| IndexEntry {
                chunk,
                embedding,
                source_path: document.source_path.clone(),
                kind: document.kind,
                content_hash: document.content_hash.clone(),
                indexed_at,
            })
            .collect())
    }

    /// Returns the number of documents removed.
    async fn prune(&self, collection: &str, present: &[SourceFile]) -> Result<usize, IndexError> {
        let present = present
            .iter()
            .map(|source| document_id_for(&source.relative))
            .collect::<HashSet<_>>();

        let mut removed = 0;
        for document_id in self.store.document_ids(collection).await? {
            if present.contains(&document_id) {
                continue;
            }
            let lease = self.document_lock(collection, &document_id);
            let _guard = lease.lock.lock().await;
            let entries = self.store.remove_document(collection, &document_id).await?;
            info!(collection, document_id, entries, "removed missing document");
            removed += 1;
        }
        Ok(removed)
    }

    fn document_lock(&self, collection: &str, document_id: &str) -> DocumentLease<'_> {
        let key = (collection.to_string(), document_id.to_string());
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        let lock = locks.entry(key.clone()).or_default().clone();
        DocumentLease {
            locks: &self.locks,
            key,
            lock,
        }
    }
}

/// A handle on one document's lock. The map entry is dropped together with
/// the last lease.
struct DocumentLease<'a> {
    locks: &'a DocumentLocks,
    key: (String, String),
    lock: Arc<tokio::sync::Mutex<()>>,
}

impl Drop for DocumentLease<'_> {
    fn drop(&mut self) {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        // Clones only happen under the map lock: two owners means the map and us.
        if Arc::strong_count(&self.lock) == 2 {
            locks.remove(&self.key);
        }
    }
}

fn ingest_failure_kind(error: &IngestError) -> FailureKind {
    match error {
        IngestError::UnsupportedFormat { .. } => FailureKind::UnsupportedFormat,
        IngestError::CorruptSource { .. }
        | IngestError::Io(_)
        | IngestError::InvalidChunkConfig(_) => FailureKind::CorruptSource,
    }
}
