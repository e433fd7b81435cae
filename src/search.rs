//! Semantic search over indexed chunks.
//!
//! [`SemanticSearchEngine`] embeds the query text and hands the vector to
//! [`memex_core::search::rank`], which does candidate retrieval, score
//! normalization, thresholding, filtering, and ordering against the
//! configured [`VectorStore`].
//!
//! An empty or whitespace-only query returns no results without calling
//! the embedding service.

use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use memex_core::embedding::{check_dimension, EmbeddingService};
use memex_core::models::SearchResult;
use memex_core::search::{filtered, rank, similar_to};
use memex_core::store::{Filters, VectorStore};
use memex_core::Result;

pub use memex_core::search::SearchOptions;

use crate::config::Config;
use crate::retry::RetryPolicy;

pub struct SemanticSearchEngine {
    embedder: Arc<dyn EmbeddingService>,
    store: Arc<dyn VectorStore>,
    retry: RetryPolicy,
    embed_timeout: Duration,
    defaults: SearchOptions,
}

impl SemanticSearchEngine {
    pub fn new(embedder: Arc<dyn EmbeddingService>, store: Arc<dyn VectorStore>) -> Self {
        Self {
            embedder,
            store,
            retry: RetryPolicy::default(),
            embed_timeout: Duration::from_secs(30),
            defaults: SearchOptions::default(),
        }
    }

    pub fn from_config(
        config: &Config,
        embedder: Arc<dyn EmbeddingService>,
        store: Arc<dyn VectorStore>,
    ) -> Self {
        let defaults = SearchOptions {
            max_results: config.retrieval.max_results,
            similarity_threshold: config.retrieval.similarity_threshold,
            candidate_multiplier: config.retrieval.candidate_multiplier,
            ..SearchOptions::default()
        };
        Self::new(embedder, store)
            .with_retry(RetryPolicy::from_config(&config.retry))
            .with_embed_timeout(config.embedding.timeout())
            .with_defaults(defaults)
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_embed_timeout(mut self, timeout: Duration) -> Self {
        self.embed_timeout = timeout;
        self
    }

    pub fn with_defaults(mut self, defaults: SearchOptions) -> Self {
        self.defaults = defaults;
        self
    }

    /// Options built from the configured retrieval defaults.
    pub fn default_options(&self) -> SearchOptions {
        self.defaults.clone()
    }

    /// Rank stored chunks against `query`, best first.
    pub async fn search(&self, query: &str, opts: &SearchOptions) -> Result<Vec<SearchResult>> {
        if query.trim().is_empty() {
            return Ok(Vec::new());
        }

        let embedder = &self.embedder;
        let query_vec = self
            .retry
            .run("query embedding", self.embed_timeout, move || embedder.embed_text(query))
            .await?;
        check_dimension(&query_vec, self.embedder.dimension())?;

        let results = rank(self.store.as_ref(), &query_vec, opts).await?;
        debug!(
            query,
            results = results.len(),
            threshold = opts.similarity_threshold,
            "semantic search"
        );
        Ok(results)
    }

    /// Chunks matching metadata `filters` alone, newest first, each with
    /// score `1.0`. No embedding call is made.
    pub async fn search_by_filters(
        &self,
        filters: &Filters,
        max_results: usize,
    ) -> Result<Vec<SearchResult>> {
        let results = filtered(self.store.as_ref(), filters, max_results).await?;
        debug!(filters = filters.len(), results = results.len(), "filter search");
        Ok(results)
    }

    /// Chunks similar to a stored chunk, excluding the chunk itself.
    ///
    /// Fails with `NotFound` if the chunk has no stored vector.
    pub async fn find_similar_documents(
        &self,
        chunk_id: &str,
        max_results: usize,
        similarity_threshold: f64,
    ) -> Result<Vec<SearchResult>> {
        let opts = SearchOptions {
            max_results,
            similarity_threshold,
            ..self.default_options()
        };
        similar_to(self.store.as_ref(), chunk_id, &opts).await
    }
}
