use crate::embeddings::EmbeddingTask;
use crate::store::{CollectionInfo, DocumentRecord, ScoredEntry};
use crate::tables::TableDetection;
use crate::{
    EmbeddingError, IndexEntry, SearchError, SearchFilter, StoreError, TableDetectionError,
};
use async_trait::async_trait;
use std::path::Path;

/// Raw access to an embedding backend. Retry, batching and timeouts live in
/// [`crate::Embedder`]; implementations only classify their failures as
/// [`EmbeddingError::Transient`] or [`EmbeddingError::Rejected`].
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    fn model(&self) -> &str;

    fn dimensions(&self) -> usize;

    /// Largest number of inputs accepted by one request.
    fn max_batch_size(&self) -> usize {
        100
    }

    async fn embed_batch(
        &self,
        texts: &[String],
        task: EmbeddingTask,
    ) -> Result<Vec<Vec<f32>>, EmbeddingError>;
}

/// A persistent set of named, dimension-fixed collections.
///
/// Every method is atomic with respect to the persisted state: either the
/// whole call is durably applied or nothing is.
#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Create the collection if needed. Fails with `DimensionMismatch` when it
    /// already exists with another dimension.
    async fn open_collection(
        &self,
        name: &str,
        dimension: usize,
    ) -> Result<CollectionInfo, StoreError>;

    async fn collection_info(&self, name: &str) -> Result<Option<CollectionInfo>, StoreError>;

    async fn delete_collection(&self, name: &str) -> Result<bool, StoreError>;

    /// Insert or overwrite entries by chunk id.
    async fn upsert(&self, collection: &str, entries: &[IndexEntry]) -> Result<(), StoreError>;

    async fn delete(&self, collection: &str, ids: &[String]) -> Result<usize, StoreError>;

    async fn get(&self, collection: &str, id: &str) -> Result<Option<IndexEntry>, StoreError>;

    async fn document_record(
        &self,
        collection: &str,
        document_id: &str,
    ) -> Result<Option<DocumentRecord>, StoreError>;

    async fn document_ids(&self, collection: &str) -> Result<Vec<String>, StoreError>;

    /// Remove every prior entry of `record.document_id` and insert `entries`
    /// as one step.
    async fn replace_document(
        &self,
        collection: &str,
        record: DocumentRecord,
        entries: &[IndexEntry],
    ) -> Result<(), StoreError>;

    async fn remove_document(&self, collection: &str, document_id: &str)
        -> Result<usize, StoreError>;

    /// At most `k` entries, best first; ties keep ingestion order. A missing
    /// collection yields no results.
    async fn search(
        &self,
        collection: &str,
        vector: &[f32],
        k: usize,
        filter: Option<&SearchFilter>,
    ) -> Result<Vec<ScoredEntry>, StoreError>;
}

#[async_trait]
pub trait AnswerGenerator: Send + Sync {
    async fn generate(&self, prompt: &str) -> Result<String, SearchError>;
}

#[async_trait]
pub trait TableDetector: Send + Sync {
    async fn detect(&self, image: &Path) -> Result<TableDetection, TableDetectionError>;
}
