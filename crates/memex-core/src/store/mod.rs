//! Storage abstractions for vectors and the index ledger.
//!
//! [`VectorStore`] persists chunk vectors with their text and metadata and
//! answers nearest-neighbour queries. [`IndexLedger`] persists what has
//! been indexed ([`DocumentRecord`]s and [`IndexEntry`]s) so that sync can
//! tell added, changed, and unchanged documents apart. A single backend
//! object may implement both, as the in-memory and SQLite stores do.
//!
//! Implementations must be `Send + Sync` to work with async runtimes.
//!
//! | Trait | Method | Purpose |
//! |-------|--------|---------|
//! | `VectorStore` | [`add`](VectorStore::add) | Upsert records by id |
//! | `VectorStore` | [`query`](VectorStore::query) | k nearest neighbours, optionally filtered |
//! | `VectorStore` | [`get`](VectorStore::get) | Fetch stored records by id |
//! | `VectorStore` | [`delete`](VectorStore::delete) | Remove records by id |
//! | `VectorStore` | [`replace`](VectorStore::replace) | Upsert and remove as one write |
//! | `VectorStore` | [`scan`](VectorStore::scan) | Filtered records, newest first |
//! | `IndexLedger` | [`commit`](IndexLedger::commit) | Replace a document's record and entries |
//! | `IndexLedger` | [`remove`](IndexLedger::remove) | Drop a document's record and entries |

pub mod memory;

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::Serialize;

use crate::error::Result;
use crate::models::{DocumentRecord, IndexEntry, MetaValue, Metadata, SourceKind};

/// Exact-match metadata predicates, all of which must hold.
pub type Filters = BTreeMap<String, MetaValue>;

/// Whether `metadata` satisfies every predicate in `filters`.
pub fn matches_filters(metadata: &Metadata, filters: &Filters) -> bool {
    filters
        .iter()
        .all(|(key, want)| metadata.get(key).is_some_and(|have| have == want))
}

/// One stored chunk vector.
#[derive(Debug, Clone, PartialEq)]
pub struct VectorRecord {
    /// Chunk id.
    pub id: String,
    pub document_id: String,
    pub embedding: Vec<f32>,
    pub text: String,
    pub metadata: Metadata,
}

/// A query hit with the backend's native distance.
#[derive(Debug, Clone)]
pub struct Neighbor {
    pub id: String,
    pub document_id: String,
    pub distance: f32,
    pub text: String,
    pub metadata: Metadata,
}

/// Distance metric reported by a store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DistanceMetric {
    /// `1 - cos(a, b)`, in `[0, 2]`.
    Cosine,
    /// L2 distance, in `[0, ∞)`.
    Euclidean,
}

impl DistanceMetric {
    /// Map a native distance to a similarity in `[0, 1]`. Monotonically
    /// decreasing in distance for both metrics.
    pub fn to_similarity(&self, distance: f32) -> f64 {
        let d = distance as f64;
        if d.is_nan() {
            return 0.0;
        }
        match self {
            DistanceMetric::Cosine => (1.0 - d).clamp(0.0, 1.0),
            DistanceMetric::Euclidean => 1.0 / (1.0 + d.max(0.0)),
        }
    }
}

#[async_trait]
pub trait VectorStore: Send + Sync {
    fn metric(&self) -> DistanceMetric;

    /// Whether [`query`](Self::query) honours `filters`. When `false` the
    /// store ignores them and callers must post-filter.
    fn supports_filters(&self) -> bool;

    /// Insert or replace records by id. Each record becomes visible to
    /// readers as a whole.
    async fn add(&self, records: Vec<VectorRecord>) -> Result<()>;

    /// Up to `k` nearest records, closest first.
    async fn query(&self, embedding: &[f32], k: usize, filters: &Filters) -> Result<Vec<Neighbor>>;

    /// Records for the given ids. Unknown ids are skipped.
    async fn get(&self, ids: &[String]) -> Result<Vec<VectorRecord>>;

    /// Delete records by id, returning how many existed.
    async fn delete(&self, ids: &[String]) -> Result<usize>;

    /// Upsert `records` and delete `remove` in one write. An id present in
    /// both stays stored. Backends that can should make both changes
    /// visible to readers at once; the default runs [`add`](Self::add) then
    /// [`delete`](Self::delete).
    async fn replace(&self, records: Vec<VectorRecord>, remove: &[String]) -> Result<()> {
        let remove: Vec<String> = remove
            .iter()
            .filter(|id| !records.iter().any(|r| &r.id == *id))
            .cloned()
            .collect();
        self.add(records).await?;
        if !remove.is_empty() {
            self.delete(&remove).await?;
        }
        Ok(())
    }

    /// Up to `limit` records matching `filters`, newest `updated_at`
    /// metadata first, ties broken by id.
    async fn scan(&self, filters: &Filters, limit: usize) -> Result<Vec<VectorRecord>>;

    async fn count(&self) -> Result<usize>;
}

/// `updated_at` metadata of a record, `0` when absent.
pub fn updated_at(metadata: &Metadata) -> i64 {
    match metadata.get("updated_at") {
        Some(MetaValue::Int(ts)) => *ts,
        _ => 0,
    }
}

#[async_trait]
pub trait IndexLedger: Send + Sync {
    async fn document(&self, document_id: &str) -> Result<Option<DocumentRecord>>;

    async fn entries(&self, document_id: &str) -> Result<Vec<IndexEntry>>;

    /// Ids of all indexed documents, optionally restricted to one source.
    async fn document_ids(&self, source: Option<SourceKind>) -> Result<Vec<String>>;

    /// Replace the record and the full entry set of one document.
    async fn commit(&self, record: &DocumentRecord, entries: &[IndexEntry]) -> Result<()>;

    async fn remove(&self, document_id: &str) -> Result<()>;
}
