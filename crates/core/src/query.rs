use crate::embeddings::Embedder;
use crate::models::{Answer, QueryOptions, QueryRequest, QueryResponse, RetrievalResult};
use crate::traits::{AnswerGenerator, VectorStore};
use crate::SearchError;
use std::sync::Arc;
use tracing::{debug, info};

const NO_CONTEXT: &str = "No context available.";
const CONTEXT_SEPARATOR: &str = "\n\n";

pub struct QueryEngine {
    embedder: Embedder,
    store: Arc<dyn VectorStore>,
    options: QueryOptions,
}

impl QueryEngine {
    pub fn new(embedder: Embedder, store: Arc<dyn VectorStore>) -> Self {
        Self {
            embedder,
            store,
            options: QueryOptions::default(),
        }
    }

    pub fn with_options(mut self, options: QueryOptions) -> Self {
        self.options = options;
        self
    }

    /// One embedding call and one search, bounded by the query timeout. An
    /// empty or missing collection is an empty response, not an error.
    pub async fn query(&self, request: &QueryRequest) -> Result<QueryResponse, SearchError> {
        let text = request.text.trim();
        if text.is_empty() {
            return Err(SearchError::Request("query is empty".to_string()));
        }
        if request.top_k == 0 {
            return Err(SearchError::Request("top_k must be at least 1".to_string()));
        }

        let empty = || QueryResponse {
            query: text.to_string(),
            results: Vec::new(),
            context: String::new(),
        };

        let info = match self.store.collection_info(&request.collection).await? {
            Some(info) => info,
            None => {
                info!(collection = %request.collection, "collection does not exist yet");
                return Ok(empty());
            }
        };

        let actual = self.embedder.dimensions();
        if info.dimension != actual {
            return Err(SearchError::DimensionMismatch {
                collection: info.name,
                expected: info.dimension,
                actual,
            });
        }
        if info.entry_count == 0 {
            info!(collection = %request.collection, "collection is empty");
            return Ok(empty());
        }

        let retrieval = async {
            let vector = self.embedder.embed_query(text).await?;
            let hits = self
                .store
                .search(
                    &request.collection,
                    &vector,
                    request.top_k,
                    request.filter.as_ref(),
                )
                .await?;
            Ok::<_, SearchError>(hits)
        };
        let hits = tokio::time::timeout(self.options.timeout, retrieval)
            .await
            .map_err(|_| SearchError::Timeout(self.options.timeout))??;
        debug!(collection = %request.collection, hits = hits.len(), "search finished");

        let results = hits
            .into_iter()
            .map(|hit| RetrievalResult {
                chunk_id: hit.entry.chunk.id.clone(),
                document_id: hit.entry.chunk.document_id.clone(),
                sequence_index: hit.entry.chunk.sequence_index,
                location: hit.entry.chunk.location,
                source_path: request.show_sources.then(|| hit.entry.source_path.clone()),
                text: hit.entry.chunk.text,
                score: hit.score,
            })
            .collect::<Vec<_>>();

        let context = build_context(&results, self.options.max_context_chars);
        Ok(QueryResponse {
            query: text.to_string(),
            results,
            context,
        })
    }

    /// Retrieve, then ask `generator` for an answer grounded in the context.
    /// Without results the generator is not called and `text` is `None`.
    pub async fn answer(
        &self,
        request: &QueryRequest,
        generator: &dyn AnswerGenerator,
    ) -> Result<Answer, SearchError> {
        let response = self.query(request).await?;
        if response.is_empty() {
            return Ok(Answer {
                text: None,
                response,
            });
        }
        let prompt = build_prompt(&response.query, &response.context);

        let text = tokio::time::timeout(self.options.timeout, generator.generate(&prompt))
            .await
            .map_err(|_| SearchError::Timeout(self.options.timeout))??;

        Ok(Answer {
            text: Some(text.trim().to_string()),
            response,
        })
    }
}

/// Ranked chunk texts separated by a blank line, at most `max_chars` chars.
/// Lower-ranked chunks are dropped first; a top chunk that is too long on
/// its own is cut at a char boundary.
pub fn build_context(results: &[RetrievalResult], max_chars: usize) -> String {
    let separator_len = CONTEXT_SEPARATOR.chars().count();
    let mut kept = Vec::new();
    let mut used = 0;

    for result in results {
        let len = result.text.chars().count();
        let needed = if kept.is_empty() {
            len
        } else {
            len + separator_len
        };
        if used + needed > max_chars {
            break;
        }
        kept.push(result.text.as_str());
        used += needed;
    }

    match (kept.is_empty(), results.first()) {
        (true, Some(top)) => top.text.chars().take(max_chars).collect(),
        _ => kept.join(CONTEXT_SEPARATOR),
    }
}

pub fn build_prompt(question: &str, context: &str) -> String {
    let context = if context.trim().is_empty() {
        NO_CONTEXT
    } else {
        context
    };

    format!(
        "You are a procurement analyst. Answer using only the provided context. \
         If the answer is not in the context, say 'I don't know'.\n\n\
         Context:\n{context}\n\n\
         Question: {question}\n\
         Answer:"
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embeddings::{CharacterNgramEmbedder, EmbeddingTask};
    use crate::models::{Chunk, ChunkLocation, DocumentKind, IndexEntry};
    use crate::store::{CollectionInfo, DistanceMetric, DocumentRecord, ScoredEntry};
    use crate::traits::EmbeddingProvider;
    use crate::{EmbeddingError, SearchFilter, StoreError};
    use async_trait::async_trait;
    use chrono::Utc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    struct FixedStore {
        info: Option<CollectionInfo>,
        hits: Vec<ScoredEntry>,
        searches: AtomicUsize,
    }

    impl FixedStore {
        fn new(dimension: Option<usize>, hits: Vec<ScoredEntry>) -> Self {
            Self {
                info: dimension.map(|dimension| CollectionInfo {
                    name: "docs".to_string(),
                    dimension,
                    metric: DistanceMetric::Cosine,
                    entry_count: hits.len(),
                    document_count: hits.len(),
                    created_at: Utc::now(),
                }),
                hits,
                searches: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl VectorStore for FixedStore {
        async fn open_collection(
            &self,
            _name: &str,
            _dimension: usize,
        ) -> Result<CollectionInfo, StoreError> {
            self.info
                .clone()
                .ok_or_else(|| StoreError::CollectionNotFound("docs".to_string()))
        }

        async fn collection_info(&self, _name: &str) -> Result<Option<CollectionInfo>, StoreError> {
            Ok(self.info.clone())
        }

        async fn delete_collection(&self, _name: &str) -> Result<bool, StoreError> {
            Ok(false)
        }

        async fn upsert(&self, _collection: &str, _entries: &[IndexEntry]) -> Result<(), StoreError> {
            Ok(())
        }

        async fn delete(&self, _collection: &str, _ids: &[String]) -> Result<usize, StoreError> {
            Ok(0)
        }

        async fn get(&self, _collection: &str, _id: &str) -> Result<Option<IndexEntry>, StoreError> {
            Ok(None)
        }

        async fn document_record(
            &self,
            _collection: &str,
            _document_id: &str,
        ) -> Result<Option<DocumentRecord>, StoreError> {
            Ok(None)
        }

        async fn document_ids(&self, _collection: &str) -> Result<Vec<String>, StoreError> {
            Ok(Vec::new())
        }

        async fn replace_document(
            &self,
            _collection: &str,
            _record: DocumentRecord,
            _entries: &[IndexEntry],
        ) -> Result<(), StoreError> {
            Ok(())
        }

        async fn remove_document(
            &self,
            _collection: &str,
            _document_id: &str,
        ) -> Result<usize, StoreError> {
            Ok(0)
        }

        async fn search(
            &self,
            _collection: &str,
            _vector: &[f32],
            k: usize,
            _filter: Option<&SearchFilter>,
        ) -> Result<Vec<ScoredEntry>, StoreError> {
            self.searches.fetch_add(1, Ordering::SeqCst);
            Ok(self.hits.iter().take(k).cloned().collect())
        }
    }

    struct CountingProvider {
        dimensions: usize,
        delay: Duration,
        calls: AtomicUsize,
    }

    impl CountingProvider {
        fn new(dimensions: usize) -> Self {
            Self {
                dimensions,
                delay: Duration::ZERO,
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl EmbeddingProvider for CountingProvider {
        fn model(&self) -> &str {
            "counting"
        }

        fn dimensions(&self) -> usize {
            self.dimensions
        }

        async fn embed_batch(
            &self,
            texts: &[String],
            _task: EmbeddingTask,
        ) -> Result<Vec<Vec<f32>>, EmbeddingError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            Ok(vec![vec![1.0; self.dimensions]; texts.len()])
        }
    }

    struct CapturingGenerator {
        prompts: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl AnswerGenerator for CapturingGenerator {
        async fn generate(&self, prompt: &str) -> Result<String, SearchError> {
            self.prompts.lock().unwrap().push(prompt.to_string());
            Ok("  Acme Corp.\n".to_string())
        }
    }

    struct OfflineGenerator {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl AnswerGenerator for OfflineGenerator {
        async fn generate(&self, _prompt: &str) -> Result<String, SearchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(SearchError::Generation("network down".to_string()))
        }
    }

    fn hit(text: &str, score: f32, sequence: u64) -> ScoredEntry {
        ScoredEntry {
            entry: IndexEntry {
                chunk: Chunk {
                    id: format!("chunk-{sequence}"),
                    document_id: "doc".to_string(),
                    sequence_index: sequence,
                    text: text.to_string(),
                    start_offset: 0,
                    end_offset: text.chars().count(),
                    location: ChunkLocation::Text,
                },
                embedding: vec![1.0, 0.0, 0.0, 0.0],
                source_path: "data/orders.csv".to_string(),
                kind: DocumentKind::Csv,
                content_hash: "hash".to_string(),
                indexed_at: Utc::now(),
            },
            score,
            sequence,
        }
    }

    fn result(text: &str) -> RetrievalResult {
        RetrievalResult {
            chunk_id: text.to_string(),
            document_id: "doc".to_string(),
            sequence_index: 0,
            text: text.to_string(),
            score: 1.0,
            source_path: None,
            location: ChunkLocation::Text,
        }
    }

    fn engine(provider: Arc<dyn EmbeddingProvider>, store: Arc<dyn VectorStore>) -> QueryEngine {
        QueryEngine::new(Embedder::new(provider), store)
    }

    #[tokio::test]
    async fn blank_queries_and_zero_k_are_rejected() {
        let engine = engine(
            Arc::new(CharacterNgramEmbedder { dimensions: 4 }),
            Arc::new(FixedStore::new(Some(4), Vec::new())),
        );
        let blank = engine.query(&QueryRequest::new("   ", "docs", 4)).await;
        assert!(matches!(blank, Err(SearchError::Request(_))));

        let zero = engine.query(&QueryRequest::new("acme", "docs", 0)).await;
        assert!(matches!(zero, Err(SearchError::Request(_))));
    }

    #[tokio::test]
    async fn missing_or_empty_collections_return_no_results() -> Result<(), SearchError> {
        for store in [FixedStore::new(None, Vec::new()), FixedStore::new(Some(4), Vec::new())] {
            let store = Arc::new(store);
            let engine = engine(Arc::new(CountingProvider::new(4)), store.clone());
            let response = engine.query(&QueryRequest::new("acme", "docs", 4)).await?;
            assert!(response.is_empty());
            assert!(response.context.is_empty());
            assert_eq!(store.searches.load(Ordering::SeqCst), 0);
        }
        Ok(())
    }

    #[tokio::test]
    async fn dimension_mismatch_fails_before_embedding_or_search() {
        let store = Arc::new(FixedStore::new(Some(768), vec![hit("acme", 0.9, 0)]));
        let provider = Arc::new(CountingProvider::new(384));
        let engine = engine(provider.clone(), store.clone());

        let result = engine.query(&QueryRequest::new("acme", "docs", 4)).await;
        assert!(matches!(
            result,
            Err(SearchError::DimensionMismatch {
                expected: 768,
                actual: 384,
                ..
            })
        ));
        assert_eq!(provider.calls.load(Ordering::SeqCst), 0);
        assert_eq!(store.searches.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn sources_are_attached_only_on_request() -> Result<(), SearchError> {
        let store = Arc::new(FixedStore::new(
            Some(4),
            vec![hit("Acme Corp | 500", 0.9, 0), hit("Globex | 20", 0.5, 1)],
        ));
        let engine = engine(Arc::new(CountingProvider::new(4)), store);

        let plain = engine.query(&QueryRequest::new("acme", "docs", 4)).await?;
        assert_eq!(plain.results.len(), 2);
        assert!(plain.results.iter().all(|result| result.source_path.is_none()));
        assert_eq!(plain.context, "Acme Corp | 500\n\nGlobex | 20");

        let sourced = engine
            .query(&QueryRequest::new("acme", "docs", 1).with_sources(true))
            .await?;
        assert_eq!(sourced.results.len(), 1);
        assert_eq!(sourced.results[0].chunk_id, "chunk-0");
        assert_eq!(
            sourced.results[0].source_path.as_deref(),
            Some("data/orders.csv")
        );
        Ok(())
    }

    #[tokio::test]
    async fn hung_provider_hits_the_query_timeout() {
        let provider = CountingProvider {
            dimensions: 4,
            delay: Duration::from_secs(5),
            calls: AtomicUsize::new(0),
        };
        let engine = engine(
            Arc::new(provider),
            Arc::new(FixedStore::new(Some(4), vec![hit("acme", 0.9, 0)])),
        )
        .with_options(QueryOptions {
            timeout: Duration::from_millis(20),
            ..QueryOptions::default()
        });

        let result = engine.query(&QueryRequest::new("acme", "docs", 4)).await;
        assert!(matches!(result, Err(SearchError::Timeout(_))));
    }

    #[tokio::test]
    async fn answers_are_grounded_in_the_context() -> Result<(), SearchError> {
        let engine = engine(
            Arc::new(CountingProvider::new(4)),
            Arc::new(FixedStore::new(Some(4), vec![hit("Vendor Acme Corp", 0.9, 0)])),
        );
        let generator = CapturingGenerator {
            prompts: Mutex::new(Vec::new()),
        };

        let answer = engine
            .answer(&QueryRequest::new("Which vendor?", "docs", 4), &generator)
            .await?;
        assert_eq!(answer.text.as_deref(), Some("Acme Corp."));
        assert_eq!(answer.response.results.len(), 1);

        let prompts = generator.prompts.lock().unwrap();
        assert!(prompts[0].contains("Context:\nVendor Acme Corp\n\n"));
        assert!(prompts[0].ends_with("Question: Which vendor?\nAnswer:"));
        Ok(())
    }

    #[tokio::test]
    async fn empty_collections_skip_answer_generation() -> Result<(), SearchError> {
        for store in [FixedStore::new(None, Vec::new()), FixedStore::new(Some(4), Vec::new())] {
            let engine = engine(Arc::new(CountingProvider::new(4)), Arc::new(store));
            let generator = OfflineGenerator {
                calls: AtomicUsize::new(0),
            };

            let answer = engine
                .answer(&QueryRequest::new("who?", "docs", 4), &generator)
                .await?;
            assert!(answer.text.is_none());
            assert!(answer.response.is_empty());
            assert_eq!(generator.calls.load(Ordering::SeqCst), 0);
        }
        Ok(())
    }

    #[test]
    fn context_drops_lowest_ranked_chunks_first() {
        let results = vec![result("first"), result("second"), result("third")];
        assert_eq!(build_context(&results, 100), "first\n\nsecond\n\nthird");
        assert_eq!(build_context(&results, 15), "first\n\nsecond");
        assert_eq!(build_context(&results, 12), "first");
        assert_eq!(build_context(&results, 3), "fir");
        assert_eq!(build_context(&[], 10), "");
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        let results = vec![result("Décembre")];
        assert_eq!(build_context(&results, 2), "Dé");
    }

    #[test]
    fn prompt_falls_back_when_context_is_empty() {
        let prompt = build_prompt("Who?", "");
        assert!(prompt.starts_with("You are a procurement analyst."));
        assert!(prompt.contains("Context:\nNo context available.\n\n"));
        assert!(prompt.contains("say 'I don't know'."));
    }
}
