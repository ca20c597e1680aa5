use crate::ConfigError;
use std::fmt;
use url::Url;

pub const API_KEY_VAR: &str = "GOOGLE_API_KEY";
pub const BASE_URL_VAR: &str = "GEMINI_BASE_URL";
pub const EMBEDDING_MODEL_VAR: &str = "GEMINI_EMBEDDING_MODEL";
pub const EMBEDDING_DIMENSIONS_VAR: &str = "GEMINI_EMBEDDING_DIMENSIONS";
pub const ANSWER_MODEL_VAR: &str = "GEMINI_ANSWER_MODEL";

pub const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com/";
pub const DEFAULT_EMBEDDING_MODEL: &str = "text-embedding-004";
pub const DEFAULT_GEMINI_DIMENSIONS: usize = 768;
pub const DEFAULT_ANSWER_MODEL: &str = "gemini-2.5-flash";

/// Credential and model selection for the hosted provider. Built once at
/// startup and handed to the providers.
#[derive(Clone)]
pub struct GeminiConfig {
    api_key: String,
    pub base_url: Url,
    pub embedding_model: String,
    pub embedding_dimensions: usize,
    pub answer_model: String,
}

impl fmt::Debug for GeminiConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GeminiConfig")
            .field("api_key", &"<redacted>")
            .field("base_url", &self.base_url.as_str())
            .field("embedding_model", &self.embedding_model)
            .field("embedding_dimensions", &self.embedding_dimensions)
            .field("answer_model", &self.answer_model)
            .finish()
    }
}

impl GeminiConfig {
    pub fn new(api_key: impl Into<String>) -> Result<Self, ConfigError> {
        let api_key = api_key.into().trim().to_string();
        if api_key.is_empty() {
            return Err(ConfigError::MissingCredential(API_KEY_VAR));
        }

        Ok(Self {
            api_key,
            base_url: Url::parse(DEFAULT_BASE_URL)?,
            embedding_model: DEFAULT_EMBEDDING_MODEL.to_string(),
            embedding_dimensions: DEFAULT_GEMINI_DIMENSIONS,
            answer_model: DEFAULT_ANSWER_MODEL.to_string(),
        })
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Blank values are treated as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let read = |name: &str| {
            lookup(name)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        let api_key = read(API_KEY_VAR).ok_or(ConfigError::MissingCredential(API_KEY_VAR))?;
        let mut config = Self::new(api_key)?;

        if let Some(base_url) = read(BASE_URL_VAR) {
            config = config.with_base_url(&base_url)?;
        }
        if let Some(model) = read(EMBEDDING_MODEL_VAR) {
            config.embedding_model = model;
        }
        if let Some(dimensions) = read(EMBEDDING_DIMENSIONS_VAR) {
            config.embedding_dimensions = parse_dimensions(&dimensions)?;
        }
        if let Some(model) = read(ANSWER_MODEL_VAR) {
            config.answer_model = model;
        }

        Ok(config)
    }

    /// A trailing slash is added so relative endpoints resolve under the
    /// given path.
    pub fn with_base_url(mut self, base_url: &str) -> Result<Self, ConfigError> {
        let mut url = Url::parse(base_url)?;
        if !url.path().ends_with('/') {
            let path = format!("{}/", url.path());
            url.set_path(&path);
        }
        self.base_url = url;
        Ok(self)
    }

    pub fn api_key(&self) -> &str {
        &self.api_key
    }
}

fn parse_dimensions(value: &str) -> Result<usize, ConfigError> {
    match value.parse::<usize>() {
        Ok(dimensions) if dimensions > 0 => Ok(dimensions),
        _ => Err(ConfigError::Invalid(format!(
            "{EMBEDDING_DIMENSIONS_VAR} must be a positive integer, got {value:?}"
        ))),
    }
}
