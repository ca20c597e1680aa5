//! Gemini REST client: batch embeddings and grounded answer generation.

use crate::config::GeminiConfig;
use crate::embeddings::EmbeddingTask;
use crate::traits::{AnswerGenerator, EmbeddingProvider};
use crate::{EmbeddingError, SearchError};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, error};
use url::Url;

/// Inputs accepted by one `batchEmbedContents` call.
const MAX_BATCH_SIZE: usize = 100;
const ANSWER_TEMPERATURE: f64 = 0.2;

#[derive(Deserialize)]
struct BatchEmbedResponse {
    #[serde(default)]
    embeddings: Vec<ContentEmbedding>,
}

#[derive(Deserialize)]
struct ContentEmbedding {
    values: Vec<f32>,
}

#[derive(Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Deserialize)]
struct Candidate {
    content: Option<CandidateContent>,
}

#[derive(Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Deserialize)]
struct Part {
    text: Option<String>,
}

#[derive(Deserialize)]
struct ErrorResponse {
    error: ErrorDetail,
}

#[derive(Deserialize)]
struct ErrorDetail {
    message: String,
}

pub struct GeminiEmbeddingProvider {
    client: Client,
    config: GeminiConfig,
}

impl GeminiEmbeddingProvider {
    pub fn new(config: GeminiConfig) -> Self {
        Self {
            client: Client::new(),
            config,
        }
    }

    fn request_body(&self, texts: &[String], task: EmbeddingTask) -> Value {
        let model = format!("models/{}", self.config.embedding_model);
        let requests = texts
            .iter()
            .map(|text| {
                json!({
                    "model": model,
                    "content": { "parts": [{ "text": text }] },
                    "taskType": task_type(task),
                    "outputDimensionality": self.config.embedding_dimensions,
                })
            })
            .collect::<Vec<_>>();

        json!({ "requests": requests })
    }
}

#[async_trait]
impl EmbeddingProvider for GeminiEmbeddingProvider {
    fn model(&self) -> &str {
        &self.config.embedding_model
    }

    fn dimensions(&self) -> usize {
        self.config.embedding_dimensions
    }

    fn max_batch_size(&self) -> usize {
        MAX_BATCH_SIZE
    }

    async fn embed_batch(
        &self,
        texts: &[String],
        task: EmbeddingTask,
    ) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let url = endpoint(&self.config, &self.config.embedding_model, "batchEmbedContents")
            .map_err(|error| EmbeddingError::Rejected(error.to_string()))?;
        debug!(model = %self.config.embedding_model, batch_size = texts.len(), "gemini embed request");

        let response = self
            .client
            .post(url)
            .header("x-goog-api-key", self.config.api_key())
            .json(&self.request_body(texts, task))
            .send()
            .await
            .map_err(transport_error)?;

        let status = response.status();
        let body = response.text().await.map_err(transport_error)?;
        if !status.is_success() {
            error!(provider = "gemini", %status, "embedding request failed");
            return Err(classify_status(status, error_detail(&body)));
        }

        let parsed: BatchEmbedResponse = serde_json::from_str(&body).map_err(|error| {
            EmbeddingError::Rejected(format!("unexpected embedding response: {error}"))
        })?;
        Ok(parsed
            .embeddings
            .into_iter()
            .map(|embedding| embedding.values)
            .collect())
    }
}

pub struct GeminiGenerator {
    client: Client,
    config: GeminiConfig,
}

impl GeminiGenerator {
    pub fn new(config: GeminiConfig) -> Self {
        Self {
            client: Client::new(),
            config,
        }
    }
}

#[async_trait]
impl AnswerGenerator for GeminiGenerator {
    async fn generate(&self, prompt: &str) -> Result<String, SearchError> {
        let url = endpoint(&self.config, &self.config.answer_model, "generateContent")
            .map_err(|error| SearchError::Generation(error.to_string()))?;
        let body = json!({
            "contents": [{ "role": "user", "parts": [{ "text": prompt }] }],
            "generationConfig": { "temperature": ANSWER_TEMPERATURE },
        });

        let response = self
            .client
            .post(url)
            .header("x-goog-api-key", self.config.api_key())
            .json(&body)
            .send()
            .await
            .map_err(|error| SearchError::Generation(error.to_string()))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|error| SearchError::Generation(error.to_string()))?;
        if !status.is_success() {
            error!(provider = "gemini", %status, "generation request failed");
            return Err(SearchError::Generation(format!(
                "{status}: {}",
                error_detail(&text)
            )));
        }

        answer_text(&text)
    }
}

fn endpoint(config: &GeminiConfig, model: &str, method: &str) -> Result<Url, url::ParseError> {
    config
        .base_url
        .join(&format!("v1beta/models/{model}:{method}"))
}

fn task_type(task: EmbeddingTask) -> &'static str {
    match task {
        EmbeddingTask::Document => "RETRIEVAL_DOCUMENT",
        EmbeddingTask::Query => "RETRIEVAL_QUERY",
    }
}

/// Rate limits, request timeouts and server errors are worth retrying;
/// everything else is the caller's fault.
fn classify_status(status: StatusCode, detail: String) -> EmbeddingError {
    let message = format!("{status}: {detail}");
    if status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
        || status.is_server_error()
    {
        EmbeddingError::Transient(message)
    } else {
        EmbeddingError::Rejected(message)
    }
}

fn transport_error(error: reqwest::Error) -> EmbeddingError {
    if error.is_builder() {
        EmbeddingError::Rejected(error.to_string())
    } else {
        EmbeddingError::Transient(error.to_string())
    }
}

fn error_detail(body: &str) -> String {
    serde_json::from_str::<ErrorResponse>(body)
        .map(|response| response.error.message)
        .unwrap_or_else(|_| body.trim().to_string())
}

fn answer_text(body: &str) -> Result<String, SearchError> {
    let parsed: GenerateResponse = serde_json::from_str(body)
        .map_err(|error| SearchError::Generation(format!("unexpected response: {error}")))?;

    let text = parsed
        .candidates
        .into_iter()
        .next()
        .and_then(|candidate| candidate.content)
        .map(|content| {
            content
                .parts
                .into_iter()
                .filter_map(|part| part.text)
                .collect::<String>()
        })
        .unwrap_or_default();

    if text.trim().is_empty() {
        return Err(SearchError::Generation(
            "model returned no answer text".to_string(),
        ));
    }
    Ok(text)
}
