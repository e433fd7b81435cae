//! Concrete [`EmbeddingService`] implementations.
//!
//! - **[`DisabledService`]**: fails with a configuration error; used when
//!   embeddings are not configured.
//! - **[`OpenAIService`]**: `POST /v1/embeddings`, batched.
//! - **[`OllamaService`]**: `POST /api/embed` on a local Ollama instance.
//! - **[`HashService`]**: deterministic feature-hashing embedder. Needs no
//!   network or model files, which makes it useful offline and in tests.
//! - **`LocalService`**: fastembed inference (feature `local-embeddings`).
//!
//! # Error Classification
//!
//! Services make one attempt per call and classify failures so that the
//! caller's [`RetryPolicy`](crate::retry::RetryPolicy) can decide:
//! - HTTP 429 and 5xx, network errors → `TransientProvider`
//! - other HTTP 4xx, malformed responses → `Provider`
//! - missing API key or model → `Configuration`
//!
//! # Service Selection
//!
//! ```rust
//! # use memex::config::EmbeddingConfig;
//! # use memex::embedding::create_service;
//! let config = EmbeddingConfig::default(); // provider = "disabled"
//! let service = create_service(&config).unwrap();
//! assert_eq!(service.model_name(), "disabled");
//! ```

use std::sync::Arc;

use async_trait::async_trait;
use memex_core::embedding::{normalize, EmbeddingService};
use memex_core::{MemexError, Result};
use sha2::{Digest, Sha256};

use crate::config::EmbeddingConfig;

const OPENAI_EMBEDDINGS_URL: &str = "https://api.openai.com/v1/embeddings";
const DEFAULT_OLLAMA_URL: &str = "http://localhost:11434";

// ============ Disabled ============

pub struct DisabledService;

#[async_trait]
impl EmbeddingService for DisabledService {
    fn model_name(&self) -> &str {
        "disabled"
    }

    fn dimension(&self) -> usize {
        0
    }

    async fn embed_texts(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Err(MemexError::configuration(
            "embedding provider is disabled; set [embedding] provider in the config",
        ))
    }
}

// ============ OpenAI ============

/// Embeddings via the OpenAI API. Requires `OPENAI_API_KEY`.
pub struct OpenAIService {
    model: String,
    dims: usize,
    api_key: String,
    client: reqwest::Client,
}

impl OpenAIService {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| MemexError::configuration("embedding.model required for OpenAI provider"))?;
        let dims = config
            .dims
            .ok_or_else(|| MemexError::configuration("embedding.dims required for OpenAI provider"))?;
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| MemexError::configuration("OPENAI_API_KEY environment variable not set"))?;
        let client = reqwest::Client::builder()
            .timeout(config.timeout())
            .build()
            .map_err(|e| MemexError::configuration(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            model,
            dims,
            api_key,
            client,
        })
    }
}

#[async_trait]
impl EmbeddingService for OpenAIService {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn dimension(&self) -> usize {
        self.dims
    }

    async fn embed_texts(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let body = serde_json::json!({
            "model": self.model,
            "input": texts,
        });

        let response = self
            .client
            .post(OPENAI_EMBEDDINGS_URL)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&body)
            .send()
            .await
            .map_err(|e| classify_network_error("openai", e))?;

        let json = read_json_response("openai", response).await?;
        parse_openai_response(&json)
    }
}

/// Extract `data[].embedding`, ordered by `data[].index`.
fn parse_openai_response(json: &serde_json::Value) -> Result<Vec<Vec<f32>>> {
    let data = json
        .get("data")
        .and_then(|d| d.as_array())
        .ok_or_else(|| MemexError::provider("openai", "invalid response: missing data array"))?;

    let mut indexed = Vec::with_capacity(data.len());
    for (position, item) in data.iter().enumerate() {
        let index = item
            .get("index")
            .and_then(|i| i.as_u64())
            .map(|i| i as usize)
            .unwrap_or(position);
        let embedding = item
            .get("embedding")
            .and_then(|e| e.as_array())
            .ok_or_else(|| MemexError::provider("openai", "invalid response: missing embedding"))?;
        indexed.push((index, json_floats(embedding)));
    }
    indexed.sort_by_key(|(i, _)| *i);
    Ok(indexed.into_iter().map(|(_, v)| v).collect())
}

// ============ Ollama ============

/// Embeddings via a local Ollama instance (`POST /api/embed`).
pub struct OllamaService {
    model: String,
    dims: usize,
    url: String,
    client: reqwest::Client,
}

impl OllamaService {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| MemexError::configuration("embedding.model required for Ollama provider"))?;
        let dims = config
            .dims
            .ok_or_else(|| MemexError::configuration("embedding.dims required for Ollama provider"))?;
        let url = config
            .url
            .clone()
            .unwrap_or_else(|| DEFAULT_OLLAMA_URL.to_string());
        let client = reqwest::Client::builder()
            .timeout(config.timeout())
            .build()
            .map_err(|e| MemexError::configuration(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            model,
            dims,
            url,
            client,
        })
    }
}

#[async_trait]
impl EmbeddingService for OllamaService {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn dimension(&self) -> usize {
        self.dims
    }

    async fn embed_texts(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let body = serde_json::json!({
            "model": self.model,
            "input": texts,
        });

        let response = self
            .client
            .post(format!("{}/api/embed", self.url.trim_end_matches('/')))
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                MemexError::transient(
                    "ollama",
                    format!("connection error (is Ollama running at {}?): {}", self.url, e),
                )
            })?;

        let json = read_json_response("ollama", response).await?;
        parse_ollama_response(&json)
    }
}

fn parse_ollama_response(json: &serde_json::Value) -> Result<Vec<Vec<f32>>> {
    let embeddings = json
        .get("embeddings")
        .and_then(|e| e.as_array())
        .ok_or_else(|| MemexError::provider("ollama", "invalid response: missing embeddings array"))?;

    embeddings
        .iter()
        .map(|embedding| {
            embedding
                .as_array()
                .map(|values| json_floats(values))
                .ok_or_else(|| MemexError::provider("ollama", "invalid response: embedding is not an array"))
        })
        .collect()
}

// ============ Hashing ============

/// Deterministic bag-of-words embedder.
///
/// Each lower-cased alphanumeric token is hashed into one of `dims`
/// buckets with a sign bit; the resulting vector is L2-normalised. Texts
/// sharing vocabulary land close together under cosine distance.
pub struct HashService {
    model: String,
    dims: usize,
}

impl HashService {
    pub fn new(model: impl Into<String>, dims: usize) -> Result<Self> {
        if dims == 0 {
            return Err(MemexError::configuration("embedding.dims must be > 0"));
        }
        Ok(Self {
            model: model.into(),
            dims,
        })
    }

    pub fn embed(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dims];
        for token in tokenize(text) {
            let digest = Sha256::digest(token.as_bytes());
            let mut bucket_bytes = [0u8; 8];
            bucket_bytes.copy_from_slice(&digest[..8]);
            let bucket = (u64::from_le_bytes(bucket_bytes) % self.dims as u64) as usize;
            let sign = if digest[8] & 1 == 0 { 1.0 } else { -1.0 };
            vector[bucket] += sign;
        }
        normalize(&mut vector);
        vector
    }
}

#[async_trait]
impl EmbeddingService for HashService {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn dimension(&self) -> usize {
        self.dims
    }

    async fn embed_texts(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| self.embed(t)).collect())
    }
}

fn tokenize(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_lowercase())
}

// ============ Local (fastembed) ============

/// Local inference via fastembed. The model is downloaded on first use
/// and cached; later calls run offline.
#[cfg(feature = "local-embeddings")]
pub struct LocalService {
    model_name: String,
    dims: usize,
    batch_size: usize,
    model: Arc<std::sync::Mutex<Option<fastembed::TextEmbedding>>>,
}

#[cfg(feature = "local-embeddings")]
impl LocalService {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let model_name = config
            .model
            .clone()
            .unwrap_or_else(|| "all-minilm-l6-v2".to_string());
        // Validate the name up front so a typo fails at construction.
        fastembed_model(&model_name)?;
        let dims = config.dims.unwrap_or(match model_name.as_str() {
            "bge-base-en-v1.5" | "nomic-embed-text-v1" | "nomic-embed-text-v1.5" => 768,
            "bge-large-en-v1.5" => 1024,
            _ => 384,
        });
        Ok(Self {
            model_name,
            dims,
            batch_size: config.batch_size,
            model: Arc::new(std::sync::Mutex::new(None)),
        })
    }
}

#[cfg(feature = "local-embeddings")]
fn fastembed_model(name: &str) -> Result<fastembed::EmbeddingModel> {
    match name {
        "all-minilm-l6-v2" => Ok(fastembed::EmbeddingModel::AllMiniLML6V2),
        "bge-small-en-v1.5" => Ok(fastembed::EmbeddingModel::BGESmallENV15),
        "bge-base-en-v1.5" => Ok(fastembed::EmbeddingModel::BGEBaseENV15),
        "bge-large-en-v1.5" => Ok(fastembed::EmbeddingModel::BGELargeENV15),
        "nomic-embed-text-v1" => Ok(fastembed::EmbeddingModel::NomicEmbedTextV1),
        "nomic-embed-text-v1.5" => Ok(fastembed::EmbeddingModel::NomicEmbedTextV15),
        other => Err(MemexError::configuration(format!(
            "Unknown local embedding model: '{}'. Supported models: \
             all-minilm-l6-v2, bge-small-en-v1.5, bge-base-en-v1.5, bge-large-en-v1.5, \
             nomic-embed-text-v1, nomic-embed-text-v1.5",
            other
        ))),
    }
}

#[cfg(feature = "local-embeddings")]
#[async_trait]
impl EmbeddingService for LocalService {
    fn model_name(&self) -> &str {
        &self.model_name
    }

    fn dimension(&self) -> usize {
        self.dims
    }

    async fn embed_texts(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let model_name = self.model_name.clone();
        let batch_size = self.batch_size;
        let slot = Arc::clone(&self.model);
        let texts = texts.to_vec();

        tokio::task::spawn_blocking(move || {
            let mut guard = slot
                .lock()
                .map_err(|_| MemexError::provider("local", "model lock poisoned"))?;
            if guard.is_none() {
                let options = fastembed::InitOptions::new(fastembed_model(&model_name)?)
                    .with_show_download_progress(true);
                let model = fastembed::TextEmbedding::try_new(options).map_err(|e| {
                    MemexError::provider("local", format!("failed to initialize model: {}", e))
                })?;
                *guard = Some(model);
            }
            let model = guard
                .as_mut()
                .ok_or_else(|| MemexError::provider("local", "model not initialized"))?;
            model
                .embed(texts, Some(batch_size))
                .map_err(|e| MemexError::provider("local", format!("embedding failed: {}", e)))
        })
        .await
        .map_err(|e| MemexError::provider("local", format!("embedding task failed: {}", e)))?
    }
}

// ============ Shared HTTP helpers ============

pub(crate) fn classify_network_error(provider: &str, err: reqwest::Error) -> MemexError {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        MemexError::transient(provider, err.to_string())
    } else {
        MemexError::provider(provider, err.to_string())
    }
}

/// Read a JSON body, classifying non-success statuses.
pub(crate) async fn read_json_response(
    provider: &str,
    response: reqwest::Response,
) -> Result<serde_json::Value> {
    let status = response.status();
    if status.is_success() {
        return response
            .json()
            .await
            .map_err(|e| MemexError::provider(provider, format!("invalid JSON response: {}", e)));
    }

    let body = response.text().await.unwrap_or_default();
    let message = format!("API error {}: {}", status, body);
    if status.as_u16() == 429 || status.is_server_error() {
        Err(MemexError::transient(provider, message))
    } else {
        Err(MemexError::provider(provider, message))
    }
}

fn json_floats(values: &[serde_json::Value]) -> Vec<f32> {
    values
        .iter()
        .map(|v| v.as_f64().unwrap_or(0.0) as f32)
        .collect()
}

/// Create the configured [`EmbeddingService`].
///
/// | Config Value | Service |
/// |-------------|---------|
/// | `"disabled"` | [`DisabledService`] |
/// | `"openai"` | [`OpenAIService`] |
/// | `"ollama"` | [`OllamaService`] |
/// | `"hash"` | [`HashService`] |
/// | `"local"` | `LocalService` (feature `local-embeddings`) |
pub fn create_service(config: &EmbeddingConfig) -> Result<Arc<dyn EmbeddingService>> {
    match config.provider.as_str() {
        "disabled" => Ok(Arc::new(DisabledService)),
        "openai" => Ok(Arc::new(OpenAIService::new(config)?)),
        "ollama" => Ok(Arc::new(OllamaService::new(config)?)),
        "hash" => {
            let model = config.model.clone().unwrap_or_else(|| "hash-v1".to_string());
            let dims = config
                .dims
                .ok_or_else(|| MemexError::configuration("embedding.dims required for hash provider"))?;
            Ok(Arc::new(HashService::new(model, dims)?))
        }
        #[cfg(feature = "local-embeddings")]
        "local" => Ok(Arc::new(LocalService::new(config)?)),
        #[cfg(not(feature = "local-embeddings"))]
        "local" => Err(MemexError::configuration(
            "Local embedding provider requires building with --features local-embeddings",
        )),
        other => Err(MemexError::configuration(format!(
            "Unknown embedding provider: {}",
            other
        ))),
    }
}
