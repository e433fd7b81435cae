//! Incremental indexing against the SQLite store.
//!
//! Covers idempotent re-sync, change detection, pruning, repair of missing
//! vectors, and per-document failure isolation.

use async_trait::async_trait;
use memex::db::connect_path;
use memex::embedding::HashService;
use memex::index::{IndexManager, SyncOptions};
use memex::migrate::migrate_pool;
use memex::retry::RetryPolicy;
use memex::sqlite_store::SqliteStore;
use memex_core::chunk::Chunker;
use memex_core::embedding::EmbeddingService;
use memex_core::models::{Document, SourceKind};
use memex_core::store::{IndexLedger, VectorStore};
use memex_core::{MemexError, Result};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

// ─── Test embedders ─────────────────────────────────────────────────

/// Wraps [`HashService`], counting calls and failing on demand.
struct TestEmbedder {
    inner: HashService,
    calls: AtomicUsize,
    /// Texts containing this marker fail the whole call permanently.
    poison: Option<&'static str>,
    /// Number of leading calls that fail with a transient error.
    transient_failures: usize,
    /// Extra components appended to every vector.
    extra_dims: usize,
}

impl TestEmbedder {
    fn new() -> Self {
        Self {
            inner: HashService::new("hash-v1", 32).unwrap(),
            calls: AtomicUsize::new(0),
            poison: None,
            transient_failures: 0,
            extra_dims: 0,
        }
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EmbeddingService for TestEmbedder {
    fn model_name(&self) -> &str {
        self.inner.model_name()
    }

    fn dimension(&self) -> usize {
        self.inner.dimension()
    }

    async fn embed_texts(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        if n < self.transient_failures {
            return Err(MemexError::transient("test", "503 service unavailable"));
        }
        if let Some(marker) = self.poison {
            if texts.iter().any(|t| t.contains(marker)) {
                return Err(MemexError::provider("test", "400 bad input"));
            }
        }
        let mut vectors = self.inner.embed_texts(texts).await?;
        for v in vectors.iter_mut() {
            v.extend(std::iter::repeat(0.0).take(self.extra_dims));
        }
        Ok(vectors)
    }
}

// ─── Helpers ────────────────────────────────────────────────────────

async fn setup() -> (TempDir, Arc<SqliteStore>) {
    let tmp = TempDir::new().unwrap();
    let pool = connect_path(&tmp.path().join("memex.sqlite")).await.unwrap();
    migrate_pool(&pool).await.unwrap();
    (tmp, Arc::new(SqliteStore::new(pool)))
}

fn manager(store: &Arc<SqliteStore>, embedder: Arc<TestEmbedder>) -> IndexManager {
    let fast_retry = RetryPolicy {
        max_attempts: 3,
        base_delay: Duration::ZERO,
        max_delay: Duration::ZERO,
    };
    IndexManager::new(
        Chunker::new(1000, 200, 8000).unwrap(),
        embedder,
        store.clone(),
        store.clone(),
    )
    .with_retry(fast_retry)
}

fn file(name: &str, content: &str) -> Document {
    Document::new(
        format!("local_file:{}", name),
        SourceKind::LocalFile,
        name,
        content,
    )
}

fn corpus() -> Vec<Document> {
    vec![
        file("alpha.md", "Alpha notes about Rust, cargo, and crates."),
        file("beta.md", &"Beta covers Python and machine learning. ".repeat(60)),
        Document::new("gmail:42", SourceKind::Gmail, "42", "Dinner with Sam on Friday."),
    ]
}

async fn chunk_ids(store: &SqliteStore, document_id: &str) -> Vec<String> {
    store
        .entries(document_id)
        .await
        .unwrap()
        .into_iter()
        .map(|e| e.chunk_id)
        .collect()
}

// ─── Tests ──────────────────────────────────────────────────────────

#[tokio::test]
async fn test_sync_is_idempotent() {
    let (_tmp, store) = setup().await;
    let embedder = Arc::new(TestEmbedder::new());
    let mgr = manager(&store, embedder.clone());

    let first = mgr.sync(corpus(), &SyncOptions::default()).await.unwrap();
    assert_eq!(first.added, 3);
    assert!(first.failed.is_empty());
    let vectors = store.count().await.unwrap();
    let calls = embedder.calls();
    assert!(vectors >= 4, "beta should span several chunks");

    let second = mgr.sync(corpus(), &SyncOptions::default()).await.unwrap();
    assert_eq!(second.unchanged, 3);
    assert_eq!(second.added + second.updated + second.removed + second.repaired, 0);
    assert_eq!(embedder.calls(), calls, "unchanged documents must not be re-embedded");
    assert_eq!(store.count().await.unwrap(), vectors);
}

#[tokio::test]
async fn test_changed_document_replaces_its_chunks() {
    let (_tmp, store) = setup().await;
    let mgr = manager(&store, Arc::new(TestEmbedder::new()));
    mgr.sync(corpus(), &SyncOptions::default()).await.unwrap();

    let old_ids = chunk_ids(&store, "local_file:alpha.md").await;
    let beta_ids = chunk_ids(&store, "local_file:beta.md").await;

    let mut docs = corpus();
    docs[0] = file("alpha.md", "Alpha now talks about borrow checking instead.");
    let report = mgr.sync(docs, &SyncOptions::default()).await.unwrap();
    assert_eq!(report.updated, 1);
    assert_eq!(report.unchanged, 2);

    let new_ids = chunk_ids(&store, "local_file:alpha.md").await;
    assert_eq!(new_ids.len(), 1);
    assert_ne!(new_ids, old_ids);
    assert!(store.get(&old_ids).await.unwrap().is_empty());
    assert_eq!(store.get(&new_ids).await.unwrap().len(), 1);
    assert_eq!(chunk_ids(&store, "local_file:beta.md").await, beta_ids);
}

#[tokio::test]
async fn test_duplicate_ids_last_occurrence_wins() {
    let (_tmp, store) = setup().await;
    let mgr = manager(&store, Arc::new(TestEmbedder::new()));
    let docs = vec![file("a.md", "first version"), file("a.md", "second version")];
    let report = mgr.sync(docs, &SyncOptions::default()).await.unwrap();
    assert_eq!(report.added, 1);

    let ids = chunk_ids(&store, "local_file:a.md").await;
    let records = store.get(&ids).await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].text, "second version");
}

#[tokio::test]
async fn test_prune_removes_missing_documents() {
    let (_tmp, store) = setup().await;
    let mgr = manager(&store, Arc::new(TestEmbedder::new()));
    mgr.sync(corpus(), &SyncOptions::default()).await.unwrap();
    let beta_ids = chunk_ids(&store, "local_file:beta.md").await;

    let only_alpha = vec![corpus().remove(0)];

    let report = mgr.sync(only_alpha.clone(), &SyncOptions::default()).await.unwrap();
    assert_eq!(report.removed, 0, "nothing is removed without prune");

    let opts = SyncOptions {
        prune: true,
        prune_source: Some(SourceKind::LocalFile),
    };
    let report = mgr.sync(only_alpha, &opts).await.unwrap();
    assert_eq!(report.removed, 1);
    assert!(store.document("local_file:beta.md").await.unwrap().is_none());
    assert!(store.get(&beta_ids).await.unwrap().is_empty());
    assert!(
        store.document("gmail:42").await.unwrap().is_some(),
        "pruning is scoped to the requested source"
    );
}

#[tokio::test]
async fn test_missing_vector_is_repaired() {
    let (_tmp, store) = setup().await;
    let embedder = Arc::new(TestEmbedder::new());
    let mgr = manager(&store, embedder.clone());
    mgr.sync(corpus(), &SyncOptions::default()).await.unwrap();

    let ids = chunk_ids(&store, "local_file:beta.md").await;
    store.delete(&ids[..1]).await.unwrap();

    let report = mgr.sync(corpus(), &SyncOptions::default()).await.unwrap();
    assert_eq!(report.repaired, 1);
    assert_eq!(report.unchanged, 2);
    assert_eq!(store.get(&ids).await.unwrap().len(), ids.len());

    let again = mgr.sync(corpus(), &SyncOptions::default()).await.unwrap();
    assert_eq!(again.unchanged, 3);
}

#[tokio::test]
async fn test_verify_disabled_skips_repair() {
    let (_tmp, store) = setup().await;
    let mgr = manager(&store, Arc::new(TestEmbedder::new())).with_verify(false);
    mgr.sync(corpus(), &SyncOptions::default()).await.unwrap();

    let ids = chunk_ids(&store, "local_file:alpha.md").await;
    store.delete(&ids).await.unwrap();

    let report = mgr.sync(corpus(), &SyncOptions::default()).await.unwrap();
    assert_eq!(report.repaired, 0);
    assert_eq!(report.unchanged, 3);
}

#[tokio::test]
async fn test_failed_batch_keeps_previous_entries() {
    let (_tmp, store) = setup().await;
    manager(&store, Arc::new(TestEmbedder::new()))
        .sync(corpus(), &SyncOptions::default())
        .await
        .unwrap();
    let old_alpha = chunk_ids(&store, "local_file:alpha.md").await;

    let mut docs = corpus();
    docs[0] = file("alpha.md", "Alpha rewritten with a POISON marker.");
    docs.push(file("delta.md", "Delta is brand new."));

    let embedder = Arc::new(TestEmbedder {
        poison: Some("POISON"),
        ..TestEmbedder::new()
    });
    let mgr = manager(&store, embedder).with_batch_size(1);
    let report = mgr.sync(docs, &SyncOptions::default()).await.unwrap();

    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].document_id, "local_file:alpha.md");
    assert!(report.failed[0].error.contains("400 bad input"));
    assert_eq!(report.added, 1, "other documents still commit");
    assert_eq!(chunk_ids(&store, "local_file:alpha.md").await, old_alpha);
    assert_eq!(store.get(&old_alpha).await.unwrap().len(), old_alpha.len());
}

#[tokio::test]
async fn test_shared_batch_failure_fails_every_member() {
    let (_tmp, store) = setup().await;
    let embedder = Arc::new(TestEmbedder {
        poison: Some("POISON"),
        ..TestEmbedder::new()
    });
    let mgr = manager(&store, embedder).with_batch_size(64);
    let docs = vec![file("ok.md", "fine text"), file("bad.md", "POISON here")];

    let report = mgr.sync(docs, &SyncOptions::default()).await.unwrap();
    assert_eq!(report.added, 0);
    assert_eq!(report.failed.len(), 2);
    assert_eq!(store.count().await.unwrap(), 0);
}

#[tokio::test]
async fn test_transient_failures_are_retried() {
    let (_tmp, store) = setup().await;
    let embedder = Arc::new(TestEmbedder {
        transient_failures: 2,
        ..TestEmbedder::new()
    });
    let mgr = manager(&store, embedder.clone());
    let report = mgr
        .sync(vec![file("a.md", "short note")], &SyncOptions::default())
        .await
        .unwrap();
    assert_eq!(report.added, 1);
    assert_eq!(embedder.calls(), 3);
}

#[tokio::test]
async fn test_wrong_dimension_fails_document() {
    let (_tmp, store) = setup().await;
    let embedder = Arc::new(TestEmbedder {
        extra_dims: 1,
        ..TestEmbedder::new()
    });
    let mgr = manager(&store, embedder);
    let report = mgr
        .sync(vec![file("a.md", "short note")], &SyncOptions::default())
        .await
        .unwrap();
    assert_eq!(report.failed.len(), 1);
    assert!(report.failed[0].error.contains("Validation"));
    assert!(store.document("local_file:a.md").await.unwrap().is_none());
}

#[tokio::test]
async fn test_remove_document_deletes_chunks_and_entries() {
    let (_tmp, store) = setup().await;
    let mgr = manager(&store, Arc::new(TestEmbedder::new()));
    mgr.sync(corpus(), &SyncOptions::default()).await.unwrap();
    let ids = chunk_ids(&store, "gmail:42").await;

    assert!(mgr.remove_document("gmail:42").await.unwrap());
    assert!(store.get(&ids).await.unwrap().is_empty());
    assert!(store.entries("gmail:42").await.unwrap().is_empty());
    assert!(store.document("gmail:42").await.unwrap().is_none());
}
