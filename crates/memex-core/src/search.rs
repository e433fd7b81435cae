//! Vector ranking over a [`VectorStore`].
//!
//! The app crate embeds the query; everything after that lives here and
//! operates only through the store trait.
//!
//! # Ranking
//!
//! 1. Query the store for `max_results × candidate_multiplier` neighbours.
//! 2. Convert each native distance to a similarity in `[0, 1]` using the
//!    store's [`DistanceMetric`](crate::store::DistanceMetric).
//! 3. Drop hits below `similarity_threshold`.
//! 4. Apply metadata filters (at the store if supported, else here).
//! 5. Sort by score (desc), `updated_at` (desc), chunk id (asc).
//! 6. Truncate to `max_results`.

use crate::error::{MemexError, Result};
use crate::models::{MetaValue, SearchResult, SourceKind};
use crate::store::{matches_filters, Filters, Neighbor, VectorRecord, VectorStore};

/// Candidate headroom over `max_results` fetched from the store.
pub const DEFAULT_CANDIDATE_MULTIPLIER: usize = 2;

#[derive(Debug, Clone)]
pub struct SearchOptions {
    pub max_results: usize,
    /// Minimum similarity in `[0, 1]`.
    pub similarity_threshold: f64,
    pub filters: Filters,
    pub candidate_multiplier: usize,
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self {
            max_results: 10,
            similarity_threshold: 0.7,
            filters: Filters::new(),
            candidate_multiplier: DEFAULT_CANDIDATE_MULTIPLIER,
        }
    }
}

impl SearchOptions {
    fn candidate_k(&self) -> usize {
        self.max_results
            .saturating_mul(self.candidate_multiplier.max(1))
            .max(self.max_results)
    }
}

/// Rank stored chunks against a query vector.
pub async fn rank<S: VectorStore + ?Sized>(
    store: &S,
    query_vec: &[f32],
    opts: &SearchOptions,
) -> Result<Vec<SearchResult>> {
    rank_excluding(store, query_vec, opts, None).await
}

/// Rank chunks similar to a stored chunk, excluding the chunk itself.
///
/// Fails with `NotFound` if `chunk_id` has no stored vector.
pub async fn similar_to<S: VectorStore + ?Sized>(
    store: &S,
    chunk_id: &str,
    opts: &SearchOptions,
) -> Result<Vec<SearchResult>> {
    let records = store.get(&[chunk_id.to_string()]).await?;
    let record = records
        .into_iter()
        .next()
        .ok_or_else(|| MemexError::not_found(format!("chunk {}", chunk_id)))?;
    rank_excluding(store, &record.embedding, opts, Some(chunk_id)).await
}

/// Records matching `filters` without a query vector, newest first. Every
/// result scores `1.0`.
pub async fn filtered<S: VectorStore + ?Sized>(
    store: &S,
    filters: &Filters,
    max_results: usize,
) -> Result<Vec<SearchResult>> {
    if max_results == 0 {
        return Ok(Vec::new());
    }
    let records = store.scan(filters, max_results).await?;
    Ok(records.into_iter().map(record_result).collect())
}

fn record_result(r: VectorRecord) -> SearchResult {
    to_result(
        Neighbor {
            id: r.id,
            document_id: r.document_id,
            distance: 0.0,
            text: r.text,
            metadata: r.metadata,
        },
        1.0,
    )
}

async fn rank_excluding<S: VectorStore + ?Sized>(
    store: &S,
    query_vec: &[f32],
    opts: &SearchOptions,
    exclude: Option<&str>,
) -> Result<Vec<SearchResult>> {
    if opts.max_results == 0 {
        return Ok(Vec::new());
    }

    let mut k = opts.candidate_k();
    if exclude.is_some() {
        k = k.saturating_add(1);
    }

    let store_filters = if store.supports_filters() {
        opts.filters.clone()
    } else {
        Filters::new()
    };
    let neighbors = store.query(query_vec, k, &store_filters).await?;
    let metric = store.metric();

    let mut results: Vec<SearchResult> = neighbors
        .into_iter()
        .filter(|n| exclude != Some(n.id.as_str()))
        .filter(|n| matches_filters(&n.metadata, &opts.filters))
        .map(|n| {
            let score = metric.to_similarity(n.distance);
            to_result(n, score)
        })
        .filter(|r| r.score >= opts.similarity_threshold)
        .collect();

    sort_results(&mut results);
    results.truncate(opts.max_results);
    Ok(results)
}

/// Sort by score (desc), `updated_at` (desc), chunk id (asc).
pub fn sort_results(results: &mut [SearchResult]) {
    results.sort_by(|a, b| {
        b.score
            .total_cmp(&a.score)
            .then(b.updated_at.cmp(&a.updated_at))
            .then_with(|| a.chunk_id.cmp(&b.chunk_id))
    });
}

fn to_result(n: Neighbor, score: f64) -> SearchResult {
    let source = n
        .metadata
        .get("source")
        .and_then(MetaValue::as_str)
        .and_then(|s| s.parse::<SourceKind>().ok());
    let updated_at = n
        .metadata
        .get("updated_at")
        .and_then(MetaValue::as_i64)
        .unwrap_or(0);
    SearchResult {
        chunk_id: n.id,
        document_id: n.document_id,
        text: n.text,
        score,
        source,
        updated_at,
        metadata: n.metadata,
    }
}
