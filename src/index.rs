//! Incremental indexing: chunk, embed, and store documents.
//!
//! [`IndexManager::sync`] compares each incoming [`Document`] with its
//! ledger record and only re-embeds what changed:
//!
//! | Ledger state | Outcome |
//! |--------------|---------|
//! | no record | chunk, embed, store → `added` |
//! | hash or embedding model differs | replace → `updated` |
//! | same hash and model | skip → `unchanged` |
//! | same, but a stored vector is missing | re-index → `repaired` |
//!
//! Embedding is batched across documents. A document is committed as soon
//! as all of its chunk vectors are available: new vectors are upserted,
//! stale chunk ids deleted, then the ledger is written. A batch that fails
//! after retries fails every document with chunks in it; those documents
//! keep their previous entries. Committed documents are never rolled back.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, info, warn};

use memex_core::chunk::Chunker;
use memex_core::embedding::{check_dimension, EmbeddingService};
use memex_core::models::{
    Chunk, Document, DocumentRecord, FailedDocument, IndexEntry, IndexReport, SourceKind,
};
use memex_core::store::{IndexLedger, VectorRecord, VectorStore};
use memex_core::{MemexError, Result};

use crate::config::Config;
use crate::retry::RetryPolicy;

#[derive(Debug, Clone, Default)]
pub struct SyncOptions {
    /// Remove indexed documents that are absent from the input.
    pub prune: bool,
    /// Restrict pruning to documents from this source.
    pub prune_source: Option<SourceKind>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Change {
    Added,
    Updated,
    Repaired,
}

struct Pending {
    doc: Document,
    change: Change,
    chunks: Vec<Chunk>,
    vectors: Vec<Option<Vec<f32>>>,
    /// Chunk ids recorded for the previous version of the document.
    previous_ids: Vec<String>,
    error: Option<String>,
    committed: bool,
}

impl Pending {
    fn ready(&self) -> bool {
        !self.committed && self.error.is_none() && self.vectors.iter().all(Option::is_some)
    }
}

pub struct IndexManager {
    chunker: Chunker,
    embedder: Arc<dyn EmbeddingService>,
    vectors: Arc<dyn VectorStore>,
    ledger: Arc<dyn IndexLedger>,
    retry: RetryPolicy,
    batch_size: usize,
    embed_timeout: Duration,
    verify: bool,
}

impl IndexManager {
    pub fn new(
        chunker: Chunker,
        embedder: Arc<dyn EmbeddingService>,
        vectors: Arc<dyn VectorStore>,
        ledger: Arc<dyn IndexLedger>,
    ) -> Self {
        Self {
            chunker,
            embedder,
            vectors,
            ledger,
            retry: RetryPolicy::default(),
            batch_size: 64,
            embed_timeout: Duration::from_secs(30),
            verify: true,
        }
    }

    /// Build a manager with chunking, batching, retry, and verify settings
    /// taken from the config.
    pub fn from_config(
        config: &Config,
        embedder: Arc<dyn EmbeddingService>,
        vectors: Arc<dyn VectorStore>,
        ledger: Arc<dyn IndexLedger>,
    ) -> Result<Self> {
        let chunker = Chunker::new(
            config.chunking.chunk_size,
            config.chunking.chunk_overlap,
            config.chunking.max_tokens_per_chunk,
        )?;
        Ok(Self::new(chunker, embedder, vectors, ledger)
            .with_retry(RetryPolicy::from_config(&config.retry))
            .with_batch_size(config.embedding.batch_size)
            .with_embed_timeout(config.embedding.timeout())
            .with_verify(config.index.verify))
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn with_embed_timeout(mut self, timeout: Duration) -> Self {
        self.embed_timeout = timeout;
        self
    }

    pub fn with_verify(mut self, verify: bool) -> Self {
        self.verify = verify;
        self
    }

    /// Bring the index in line with `documents`.
    ///
    /// Only a `Configuration` error aborts the run; per-document failures
    /// are reported in [`IndexReport::failed`].
    pub async fn sync(&self, documents: Vec<Document>, opts: &SyncOptions) -> Result<IndexReport> {
        let documents = dedup_last_wins(documents);
        let input_ids: HashSet<String> = documents.iter().map(|d| d.id.clone()).collect();
        let mut report = IndexReport::default();

        let mut pending = Vec::new();
        for doc in documents {
            match self.classify(&doc).await? {
                Some((change, previous_ids)) => {
                    let chunks = self.chunker.chunk(&doc);
                    debug!(
                        document_id = %doc.id,
                        change = ?change,
                        chunks = chunks.len(),
                        "document needs indexing"
                    );
                    pending.push(Pending {
                        vectors: vec![None; chunks.len()],
                        doc,
                        change,
                        chunks,
                        previous_ids,
                        error: None,
                        committed: false,
                    });
                }
                None => report.unchanged += 1,
            }
        }

        // Documents without chunks are ready immediately.
        for p in pending.iter_mut() {
            self.commit_if_ready(p, &mut report).await;
        }

        let queue: Vec<(usize, usize)> = pending
            .iter()
            .enumerate()
            .flat_map(|(d, p)| (0..p.chunks.len()).map(move |c| (d, c)))
            .collect();

        let mut cursor = 0;
        while cursor < queue.len() {
            let mut batch = Vec::with_capacity(self.batch_size);
            while cursor < queue.len() && batch.len() < self.batch_size {
                let (d, c) = queue[cursor];
                cursor += 1;
                if pending[d].error.is_none() {
                    batch.push((d, c));
                }
            }
            if batch.is_empty() {
                continue;
            }

            let texts: Vec<String> = batch
                .iter()
                .map(|&(d, c)| pending[d].chunks[c].text.clone())
                .collect();

            match self.embed_batch(&texts).await {
                Ok(vectors) if vectors.len() == texts.len() => {
                    let dimension = self.embedder.dimension();
                    for (&(d, c), vector) in batch.iter().zip(vectors) {
                        match check_dimension(&vector, dimension) {
                            Ok(()) => pending[d].vectors[c] = Some(vector),
                            Err(e) => fail(&mut pending[d], &e),
                        }
                    }
                }
                Ok(vectors) => {
                    let err = MemexError::provider(
                        self.embedder.model_name(),
                        format!("returned {} vectors for {} texts", vectors.len(), texts.len()),
                    );
                    for &(d, _) in &batch {
                        fail(&mut pending[d], &err);
                    }
                }
                Err(e @ MemexError::Configuration(_)) => return Err(e),
                Err(e) => {
                    warn!(error = %e, texts = texts.len(), "embedding batch failed");
                    for &(d, _) in &batch {
                        fail(&mut pending[d], &e);
                    }
                }
            }

            let touched: Vec<usize> = dedup_sorted(batch.iter().map(|&(d, _)| d));
            for d in touched {
                self.commit_if_ready(&mut pending[d], &mut report).await;
            }
        }

        for p in &pending {
            if let Some(error) = &p.error {
                report.failed.push(FailedDocument {
                    document_id: p.doc.id.clone(),
                    error: error.clone(),
                });
            }
        }

        if opts.prune {
            for id in self.ledger.document_ids(opts.prune_source).await? {
                if !input_ids.contains(&id) && self.remove_document(&id).await? {
                    report.removed += 1;
                }
            }
        }

        info!(
            added = report.added,
            updated = report.updated,
            unchanged = report.unchanged,
            repaired = report.repaired,
            removed = report.removed,
            failed = report.failed.len(),
            "sync complete"
        );
        Ok(report)
    }

    /// Delete a document's vectors and ledger rows. Returns whether the
    /// document was indexed.
    pub async fn remove_document(&self, document_id: &str) -> Result<bool> {
        let record = self.ledger.document(document_id).await?;
        let entries = self.ledger.entries(document_id).await?;
        if record.is_none() && entries.is_empty() {
            return Ok(false);
        }

        let ids: Vec<String> = entries.into_iter().map(|e| e.chunk_id).collect();
        if !ids.is_empty() {
            self.vectors.delete(&ids).await?;
        }
        self.ledger.remove(document_id).await?;
        debug!(document_id, chunks = ids.len(), "removed document");
        Ok(true)
    }

    /// Decide whether `doc` needs indexing, returning the kind of change
    /// and the chunk ids of its previous version.
    async fn classify(&self, doc: &Document) -> Result<Option<(Change, Vec<String>)>> {
        let Some(record) = self.ledger.document(&doc.id).await? else {
            return Ok(Some((Change::Added, Vec::new())));
        };

        let entries = self.ledger.entries(&doc.id).await?;
        let previous_ids: Vec<String> = entries.iter().map(|e| e.chunk_id.clone()).collect();

        if record.content_hash != doc.content_hash
            || record.embedding_model_name != self.embedder.model_name()
        {
            return Ok(Some((Change::Updated, previous_ids)));
        }

        if self.verify && !entries.is_empty() {
            let stored = self.vectors.get(&previous_ids).await?;
            if stored.len() < previous_ids.len() {
                let present: HashSet<&str> = stored.iter().map(|r| r.id.as_str()).collect();
                if let Some(missing) = previous_ids.iter().find(|id| !present.contains(id.as_str())) {
                    let err = MemexError::IndexConsistency {
                        document_id: doc.id.clone(),
                        chunk_id: missing.clone(),
                    };
                    warn!(error = %err, "repairing document");
                }
                return Ok(Some((Change::Repaired, previous_ids)));
            }
        }

        Ok(None)
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let embedder = &self.embedder;
        self.retry
            .run("embedding", self.embed_timeout, move || embedder.embed_texts(texts))
            .await
    }

    async fn commit_if_ready(&self, pending: &mut Pending, report: &mut IndexReport) {
        if !pending.ready() {
            return;
        }
        match self.commit(pending).await {
            Ok(()) => {
                pending.committed = true;
                match pending.change {
                    Change::Added => report.added += 1,
                    Change::Updated => report.updated += 1,
                    Change::Repaired => report.repaired += 1,
                }
            }
            Err(e) => {
                warn!(document_id = %pending.doc.id, error = %e, "failed to store document");
                fail(pending, &e);
            }
        }
    }

    async fn commit(&self, pending: &Pending) -> Result<()> {
        let doc = &pending.doc;
        let model = self.embedder.model_name().to_string();
        let dimension = self.embedder.dimension();
        let now = Utc::now();

        let records: Vec<VectorRecord> = pending
            .chunks
            .iter()
            .zip(pending.vectors.iter().flatten())
            .map(|(chunk, vector)| VectorRecord {
                id: chunk.id.clone(),
                document_id: doc.id.clone(),
                embedding: vector.clone(),
                text: chunk.text.clone(),
                metadata: chunk.metadata.clone(),
            })
            .collect();
        let current: HashSet<&str> = pending.chunks.iter().map(|c| c.id.as_str()).collect();
        let stale: Vec<String> = pending
            .previous_ids
            .iter()
            .filter(|id| !current.contains(id.as_str()))
            .cloned()
            .collect();
        self.vectors.replace(records, &stale).await?;

        let entries: Vec<IndexEntry> = pending
            .chunks
            .iter()
            .map(|chunk| IndexEntry {
                chunk_id: chunk.id.clone(),
                document_id: doc.id.clone(),
                content_hash: doc.content_hash.clone(),
                embedding_model_name: model.clone(),
                embedding_dimension: dimension,
                indexed_at: now,
            })
            .collect();
        let record = DocumentRecord {
            document_id: doc.id.clone(),
            source: doc.source,
            content_hash: doc.content_hash.clone(),
            chunk_count: pending.chunks.len(),
            embedding_model_name: model,
            indexed_at: now,
        };
        self.ledger.commit(&record, &entries).await?;

        debug!(
            document_id = %doc.id,
            chunks = pending.chunks.len(),
            stale = stale.len(),
            "committed document"
        );
        Ok(())
    }
}

fn fail(pending: &mut Pending, err: &MemexError) {
    if pending.error.is_none() {
        pending.error = Some(err.to_string());
    }
}

/// Keep only the last occurrence of each document id, in input order.
fn dedup_last_wins(documents: Vec<Document>) -> Vec<Document> {
    let last: HashMap<String, usize> = documents
        .iter()
        .enumerate()
        .map(|(i, d)| (d.id.clone(), i))
        .collect();
    documents
        .into_iter()
        .enumerate()
        .filter(|(i, d)| last.get(&d.id) == Some(i))
        .map(|(_, d)| d)
        .collect()
}

fn dedup_sorted(items: impl Iterator<Item = usize>) -> Vec<usize> {
    let mut v: Vec<usize> = items.collect();
    v.sort_unstable();
    v.dedup();
    v
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::HashService;
    use memex_core::store::memory::InMemoryStore;

    fn manager(store: Arc<InMemoryStore>) -> IndexManager {
        let chunker = Chunker::new(100, 20, 8000).unwrap();
        let embedder = Arc::new(HashService::new("hash-v1", 32).unwrap());
        IndexManager::new(chunker, embedder, store.clone(), store).with_retry(RetryPolicy::no_retry())
    }

    fn doc(id: &str, content: &str) -> Document {
        Document::new(id, SourceKind::LocalFile, id, content)
    }

    #[test]
    fn test_dedup_keeps_last_occurrence() {
        let docs = vec![doc("a", "one"), doc("b", "two"), doc("a", "three")];
        let deduped = dedup_last_wins(docs);
        let pairs: Vec<(&str, &str)> = deduped
            .iter()
            .map(|d| (d.id.as_str(), d.content.as_str()))
            .collect();
        assert_eq!(pairs, vec![("b", "two"), ("a", "three")]);
    }

    #[tokio::test]
    async fn test_empty_document_is_recorded_and_unchanged_next_time() {
        let store = Arc::new(InMemoryStore::new());
        let mgr = manager(store.clone());

        let report = mgr.sync(vec![doc("empty", "   ")], &SyncOptions::default()).await.unwrap();
        assert_eq!(report.added, 1);
        assert_eq!(store.count().await.unwrap(), 0);

        let report = mgr.sync(vec![doc("empty", "   ")], &SyncOptions::default()).await.unwrap();
        assert_eq!(report.unchanged, 1);
        assert_eq!(report.added, 0);
    }

    #[tokio::test]
    async fn test_model_change_counts_as_update() {
        let store = Arc::new(InMemoryStore::new());
        manager(store.clone())
            .sync(vec![doc("a", "some text here")], &SyncOptions::default())
            .await
            .unwrap();

        let chunker = Chunker::new(100, 20, 8000).unwrap();
        let other = Arc::new(HashService::new("hash-v2", 32).unwrap());
        let mgr = IndexManager::new(chunker, other, store.clone(), store.clone());
        let report = mgr
            .sync(vec![doc("a", "some text here")], &SyncOptions::default())
            .await
            .unwrap();
        assert_eq!(report.updated, 1);
        let record = store.document("a").await.unwrap().unwrap();
        assert_eq!(record.embedding_model_name, "hash-v2");
    }

    #[tokio::test]
    async fn test_remove_document() {
        let store = Arc::new(InMemoryStore::new());
        let mgr = manager(store.clone());
        mgr.sync(vec![doc("a", &"word ".repeat(60))], &SyncOptions::default())
            .await
            .unwrap();
        assert!(store.count().await.unwrap() > 0);

        assert!(mgr.remove_document("a").await.unwrap());
        assert_eq!(store.count().await.unwrap(), 0);
        assert!(store.document("a").await.unwrap().is_none());
        assert!(!mgr.remove_document("a").await.unwrap());
    }
}
