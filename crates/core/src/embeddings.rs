use crate::traits::EmbeddingProvider;
use crate::EmbeddingError;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

const DEFAULT: usize = 128;

pub const DEFAULT_EMBEDDING_DIMENSIONS: usize = DEFAULT;

/// Providers may embed documents and queries differently.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmbeddingTask {
    Document,
    Query,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(10),
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Delay after the given failed attempt (1-based).
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(30) as i32;
        let scaled = self.initial_backoff.as_secs_f64() * self.multiplier.max(1.0).powi(exponent);
        Duration::from_secs_f64(scaled.min(self.max_backoff.as_secs_f64()))
    }
}

/// Order-preserving, batched, retrying front for an [`EmbeddingProvider`].
#[derive(Clone)]
pub struct Embedder {
    provider: Arc<dyn EmbeddingProvider>,
    retry: RetryPolicy,
    request_timeout: Duration,
    batch_size: usize,
}

impl Embedder {
    pub fn new(provider: Arc<dyn EmbeddingProvider>) -> Self {
        let batch_size = provider.max_batch_size().max(1);
        Self {
            provider,
            retry: RetryPolicy::default(),
            request_timeout: Duration::from_secs(30),
            batch_size,
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Capped by the provider's own batch limit.
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.clamp(1, self.provider.max_batch_size().max(1));
        self
    }

    pub fn dimensions(&self) -> usize {
        self.provider.dimensions()
    }

    pub fn model(&self) -> &str {
        self.provider.model()
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        let mut vectors = Vec::with_capacity(texts.len());
        for batch in texts.chunks(self.batch_size) {
            debug!(model = self.model(), batch_size = batch.len(), "embedding batch");
            vectors.extend(self.embed_batch(batch, EmbeddingTask::Document).await?);
        }
        Ok(vectors)
    }

    pub async fn embed_query(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        let input = [text.to_string()];
        let mut vectors = self.embed_batch(&input, EmbeddingTask::Query).await?;
        vectors
            .pop()
            .ok_or_else(|| EmbeddingError::Rejected("provider returned no vector".to_string()))
    }

    async fn embed_batch(
        &self,
        batch: &[String],
        task: EmbeddingTask,
    ) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        let vectors = self.call_with_retry(batch, task).await?;

        if vectors.len() != batch.len() {
            return Err(EmbeddingError::Rejected(format!(
                "provider returned {} vectors for {} inputs",
                vectors.len(),
                batch.len()
            )));
        }

        let expected = self.dimensions();
        if let Some(vector) = vectors.iter().find(|vector| vector.len() != expected) {
            return Err(EmbeddingError::DimensionMismatch {
                expected,
                actual: vector.len(),
            });
        }

        Ok(vectors)
    }

    async fn call_with_retry(
        &self,
        batch: &[String],
        task: EmbeddingTask,
    ) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        let max_attempts = self.retry.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;
            let call = self.provider.embed_batch(batch, task);
            let result = match tokio::time::timeout(self.request_timeout, call).await {
                Ok(result) => result,
                Err(_) => Err(EmbeddingError::Transient(format!(
                    "request timed out after {:?}",
                    self.request_timeout
                ))),
            };

            match result {
                Ok(vectors) => return Ok(vectors),
                Err(EmbeddingError::Transient(reason)) if attempt < max_attempts => {
                    let delay = self.retry.backoff_for(attempt);
                    warn!(
                        model = self.model(),
                        attempt,
                        max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        reason = %reason,
                        "transient embedding failure, backing off"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(EmbeddingError::Transient(reason)) => {
                    return Err(EmbeddingError::Unavailable {
                        attempts: attempt,
                        reason,
                    })
                }
                Err(error) => return Err(error),
            }
        }
    }
}

/// Deterministic, offline embedder hashing character trigrams into buckets.
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

impl CharacterNgramEmbedder {
    pub fn embed_text(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0f32; self.dimensions.max(1)];
        let lowered = text.to_lowercase();
        let chars: Vec<char> = lowered.chars().collect();

        if chars.is_empty() {
            return vector;
        }

        for window in chars.windows(3) {
            let token = window.iter().collect::<String>();
            let mut hash = 1469598103934665603u64;
            for byte in token.bytes() {
                hash ^= byte as u64;
                hash = hash.wrapping_mul(1099511628211);
            }
            let bucket = (hash % vector.len() as u64) as usize;
            vector[bucket] += 1.0;
        }

        let magnitude = vector.iter().map(|value| value * value).sum::<f32>().sqrt();
        if magnitude > 0.0 {
            for value in &mut vector {
                *value /= magnitude;
            }
        }

        vector
    }
}

#[async_trait]
impl EmbeddingProvider for CharacterNgramEmbedder {
    fn model(&self) -> &str {
        "char-trigram"
    }

    fn dimensions(&self) -> usize {
        self.dimensions.max(1)
    }

    async fn embed_batch(
        &self,
        texts: &[String],
        _task: EmbeddingTask,
    ) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        Ok(texts.iter().map(|text| self.embed_text(text)).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    fn fast_retry(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(2),
            multiplier: 2.0,
        }
    }

    /// Fails transiently `failures` times, then succeeds.
    struct FlakyProvider {
        failures: usize,
        calls: AtomicUsize,
        batches: Mutex<Vec<usize>>,
    }

    impl FlakyProvider {
        fn new(failures: usize) -> Self {
            Self {
                failures,
                calls: AtomicUsize::new(0),
                batches: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl EmbeddingProvider for FlakyProvider {
        fn model(&self) -> &str {
            "flaky"
        }

        fn dimensions(&self) -> usize {
            2
        }

        fn max_batch_size(&self) -> usize {
            3
        }

        async fn embed_batch(
            &self,
            texts: &[String],
            _task: EmbeddingTask,
        ) -> Result<Vec<Vec<f32>>, EmbeddingError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                return Err(EmbeddingError::Transient("429 too many requests".to_string()));
            }
            self.batches.lock().unwrap().push(texts.len());
            Ok(texts
                .iter()
                .map(|text| vec![text.len() as f32, 1.0])
                .collect())
        }
    }

    struct RejectingProvider {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl EmbeddingProvider for RejectingProvider {
        fn model(&self) -> &str {
            "rejecting"
        }

        fn dimensions(&self) -> usize {
            2
        }

        async fn embed_batch(
            &self,
            _texts: &[String],
            _task: EmbeddingTask,
        ) -> Result<Vec<Vec<f32>>, EmbeddingError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(EmbeddingError::Rejected("401 invalid api key".to_string()))
        }
    }

    struct SlowProvider;

    #[async_trait]
    impl EmbeddingProvider for SlowProvider {
        fn model(&self) -> &str {
            "slow"
        }

        fn dimensions(&self) -> usize {
            2
        }

        async fn embed_batch(
            &self,
            texts: &[String],
            _task: EmbeddingTask,
        ) -> Result<Vec<Vec<f32>>, EmbeddingError> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(vec![vec![0.0, 0.0]; texts.len()])
        }
    }

    fn texts(values: &[&str]) -> Vec<String> {
        values.iter().map(|value| value.to_string()).collect()
    }

    #[tokio::test]
    async fn local_vectors_are_stable_across_tasks() -> Result<(), EmbeddingError> {
        let embedder = Embedder::new(Arc::new(CharacterNgramEmbedder { dimensions: 32 }));
        let invoice = "Invoice 2024-117: Globex shipped 40 pallets to Rotterdam";

        let documents = embedder.embed(&texts(&[invoice, invoice])).await?;
        let query = embedder.embed_query(invoice).await?;
        assert_eq!(documents[0].len(), 32);
        assert_eq!(documents[0], documents[1]);
        assert_eq!(documents[0], query);
        Ok(())
    }

    #[test]
    fn backoff_grows_and_is_capped() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff_for(1), Duration::from_millis(500));
        assert_eq!(policy.backoff_for(2), Duration::from_secs(1));
        assert_eq!(policy.backoff_for(3), Duration::from_secs(2));
        assert_eq!(policy.backoff_for(20), Duration::from_secs(10));
    }

    #[tokio::test]
    async fn batches_preserve_input_order() {
        let provider = Arc::new(FlakyProvider::new(0));
        let embedder = Embedder::new(provider.clone()).with_batch_size(32);
        assert_eq!(embedder.batch_size(), 3);

        let inputs = texts(&["a", "bb", "ccc", "dddd", "eeeee", "ffffff", "g"]);
        let vectors = embedder.embed(&inputs).await.unwrap();

        let lengths = vectors.iter().map(|vector| vector[0] as usize).collect::<Vec<_>>();
        assert_eq!(lengths, vec![1, 2, 3, 4, 5, 6, 1]);
        assert_eq!(*provider.batches.lock().unwrap(), vec![3, 3, 1]);
    }

    #[tokio::test]
    async fn transient_failures_are_retried() {
        let provider = Arc::new(FlakyProvider::new(2));
        let embedder = Embedder::new(provider.clone()).with_retry(fast_retry(3));

        let vectors = embedder.embed(&texts(&["acme"])).await.unwrap();
        assert_eq!(vectors.len(), 1);
        assert_eq!(provider.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn exhausted_retries_report_unavailable() {
        let provider = Arc::new(FlakyProvider::new(10));
        let embedder = Embedder::new(provider.clone()).with_retry(fast_retry(3));

        let result = embedder.embed(&texts(&["acme"])).await;
        assert!(matches!(
            result,
            Err(EmbeddingError::Unavailable { attempts: 3, .. })
        ));
        assert_eq!(provider.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn rejection_is_not_retried() {
        let provider = Arc::new(RejectingProvider {
            calls: AtomicUsize::new(0),
        });
        let embedder = Embedder::new(provider.clone()).with_retry(fast_retry(5));

        let result = embedder.embed_query("acme").await;
        assert!(matches!(result, Err(EmbeddingError::Rejected(_))));
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn timeouts_count_towards_the_retry_budget() {
        let embedder = Embedder::new(Arc::new(SlowProvider))
            .with_retry(fast_retry(2))
            .with_request_timeout(Duration::from_millis(10));

        let result = embedder.embed_query("acme").await;
        assert!(matches!(
            result,
            Err(EmbeddingError::Unavailable { attempts: 2, .. })
        ));
    }

    #[tokio::test]
    async fn wrong_vector_length_is_a_dimension_mismatch() {
        struct Misconfigured;

        #[async_trait]
        impl EmbeddingProvider for Misconfigured {
            fn model(&self) -> &str {
                "misconfigured"
            }

            fn dimensions(&self) -> usize {
                4
            }

            async fn embed_batch(
                &self,
                texts: &[String],
                _task: EmbeddingTask,
            ) -> Result<Vec<Vec<f32>>, EmbeddingError> {
                Ok(vec![vec![0.0; 3]; texts.len()])
            }
        }

        let result = Embedder::new(Arc::new(Misconfigured)).embed_query("x").await;
        assert!(matches!(
            result,
            Err(EmbeddingError::DimensionMismatch {
                expected: 4,
                actual: 3
            })
        ));
    }
}
