//! In-memory [`VectorStore`] + [`IndexLedger`] for tests and embedding
//! into other programs.
//!
//! All state sits behind one `std::sync::RwLock`, so a record's vector,
//! text, and metadata are always written together. Queries are
//! brute-force over every stored vector.

use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;

use crate::embedding::{cosine_distance, euclidean_distance};
use crate::error::{MemexError, Result};
use crate::models::{DocumentRecord, IndexEntry, SourceKind};

use super::{matches_filters, updated_at, DistanceMetric, Filters, IndexLedger, Neighbor, VectorRecord, VectorStore};

#[derive(Default)]
struct State {
    vectors: HashMap<String, VectorRecord>,
    documents: HashMap<String, DocumentRecord>,
    entries: HashMap<String, Vec<IndexEntry>>,
}

pub struct InMemoryStore {
    metric: DistanceMetric,
    state: RwLock<State>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::with_metric(DistanceMetric::Cosine)
    }

    pub fn with_metric(metric: DistanceMetric) -> Self {
        Self {
            metric,
            state: RwLock::new(State::default()),
        }
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, State>> {
        self.state
            .read()
            .map_err(|_| MemexError::storage("in-memory store lock poisoned"))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, State>> {
        self.state
            .write()
            .map_err(|_| MemexError::storage("in-memory store lock poisoned"))
    }

    fn distance(&self, a: &[f32], b: &[f32]) -> f32 {
        match self.metric {
            DistanceMetric::Cosine => cosine_distance(a, b),
            DistanceMetric::Euclidean => euclidean_distance(a, b),
        }
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl VectorStore for InMemoryStore {
    fn metric(&self) -> DistanceMetric {
        self.metric
    }

    fn supports_filters(&self) -> bool {
        true
    }

    async fn add(&self, records: Vec<VectorRecord>) -> Result<()> {
        let mut state = self.write()?;
        for record in records {
            state.vectors.insert(record.id.clone(), record);
        }
        Ok(())
    }

    async fn query(&self, embedding: &[f32], k: usize, filters: &Filters) -> Result<Vec<Neighbor>> {
        let state = self.read()?;
        let mut hits: Vec<Neighbor> = state
            .vectors
            .values()
            .filter(|r| matches_filters(&r.metadata, filters))
            .map(|r| Neighbor {
                id: r.id.clone(),
                document_id: r.document_id.clone(),
                distance: self.distance(embedding, &r.embedding),
                text: r.text.clone(),
                metadata: r.metadata.clone(),
            })
            .collect();
        hits.sort_by(|a, b| a.distance.total_cmp(&b.distance).then_with(|| a.id.cmp(&b.id)));
        hits.truncate(k);
        Ok(hits)
    }

    async fn get(&self, ids: &[String]) -> Result<Vec<VectorRecord>> {
        let state = self.read()?;
        Ok(ids.iter().filter_map(|id| state.vectors.get(id).cloned()).collect())
    }

    async fn delete(&self, ids: &[String]) -> Result<usize> {
        let mut state = self.write()?;
        Ok(ids.iter().filter(|id| state.vectors.remove(*id).is_some()).count())
    }

    async fn replace(&self, records: Vec<VectorRecord>, remove: &[String]) -> Result<()> {
        let mut state = self.write()?;
        for id in remove {
            state.vectors.remove(id);
        }
        for record in records {
            state.vectors.insert(record.id.clone(), record);
        }
        Ok(())
    }

    async fn scan(&self, filters: &Filters, limit: usize) -> Result<Vec<VectorRecord>> {
        let state = self.read()?;
        let mut records: Vec<VectorRecord> = state
            .vectors
            .values()
            .filter(|r| matches_filters(&r.metadata, filters))
            .cloned()
            .collect();
        records.sort_by(|a, b| {
            updated_at(&b.metadata)
                .cmp(&updated_at(&a.metadata))
                .then_with(|| a.id.cmp(&b.id))
        });
        records.truncate(limit);
        Ok(records)
    }

    async fn count(&self) -> Result<usize> {
        Ok(self.read()?.vectors.len())
    }
}

#[async_trait]
impl IndexLedger for InMemoryStore {
    async fn document(&self, document_id: &str) -> Result<Option<DocumentRecord>> {
        Ok(self.read()?.documents.get(document_id).cloned())
    }

    async fn entries(&self, document_id: &str) -> Result<Vec<IndexEntry>> {
        Ok(self
            .read()?
            .entries
            .get(document_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn document_ids(&self, source: Option<SourceKind>) -> Result<Vec<String>> {
        let state = self.read()?;
        let mut ids: Vec<String> = state
            .documents
            .values()
            .filter(|r| source.map_or(true, |s| r.source == s))
            .map(|r| r.document_id.clone())
            .collect();
        ids.sort();
        Ok(ids)
    }

    async fn commit(&self, record: &DocumentRecord, entries: &[IndexEntry]) -> Result<()> {
        let mut state = self.write()?;
        state
            .documents
            .insert(record.document_id.clone(), record.clone());
        state
            .entries
            .insert(record.document_id.clone(), entries.to_vec());
        Ok(())
    }

    async fn remove(&self, document_id: &str) -> Result<()> {
        let mut state = self.write()?;
        state.documents.remove(document_id);
        state.entries.remove(document_id);
        Ok(())
    }
}
