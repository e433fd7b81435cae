//! Index statistics.
//!
//! Summarizes what is indexed: documents and chunks per source, stored
//! vectors, embedding models in use, and when each source was last
//! indexed. Used by `memex stats`.

use anyhow::Result;
use serde::Serialize;
use sqlx::{Row, SqlitePool};

use crate::config::Config;
use crate::db;

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct SourceStats {
    pub source: String,
    pub documents: i64,
    pub chunks: i64,
    pub last_indexed_at: Option<i64>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct IndexStats {
    pub documents: i64,
    /// Chunks recorded in the ledger.
    pub chunks: i64,
    /// Vectors present in the store. Differs from `chunks` only after an
    /// interrupted write; the next sync repairs it.
    pub vectors: i64,
    pub models: Vec<(String, i64)>,
    pub sources: Vec<SourceStats>,
}

pub async fn gather_stats(pool: &SqlitePool) -> Result<IndexStats> {
    let documents: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM index_documents")
        .fetch_one(pool)
        .await?;
    let chunks: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM index_entries")
        .fetch_one(pool)
        .await?;
    let vectors: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chunk_vectors")
        .fetch_one(pool)
        .await?;

    let model_rows = sqlx::query(
        "SELECT embedding_model, COUNT(*) AS n FROM index_entries \
         GROUP BY embedding_model ORDER BY n DESC, embedding_model",
    )
    .fetch_all(pool)
    .await?;
    let models = model_rows
        .iter()
        .map(|row| (row.get::<String, _>("embedding_model"), row.get::<i64, _>("n")))
        .collect();

    let source_rows = sqlx::query(
        r#"
        SELECT
            source,
            COUNT(*) AS documents,
            COALESCE(SUM(chunk_count), 0) AS chunks,
            MAX(indexed_at) AS last_indexed_at
        FROM index_documents
        GROUP BY source
        ORDER BY documents DESC, source
        "#,
    )
    .fetch_all(pool)
    .await?;
    let sources = source_rows
        .iter()
        .map(|row| SourceStats {
            source: row.get("source"),
            documents: row.get("documents"),
            chunks: row.get("chunks"),
            last_indexed_at: row.get("last_indexed_at"),
        })
        .collect();

    Ok(IndexStats {
        documents,
        chunks,
        vectors,
        models,
        sources,
    })
}

/// Run the stats command: query the database and print a summary.
pub async fn run_stats(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    let stats = gather_stats(&pool).await?;
    pool.close().await;

    let db_size = std::fs::metadata(&config.db.path)
        .map(|m| m.len())
        .unwrap_or(0);

    println!("Memex Index Stats");
    println!("=================");
    println!();
    println!("  Database:    {}", config.db.path.display());
    println!("  Size:        {}", format_bytes(db_size));
    println!();
    println!("  Documents:   {}", stats.documents);
    println!("  Chunks:      {}", stats.chunks);
    println!("  Vectors:     {}", stats.vectors);

    if !stats.models.is_empty() {
        println!();
        println!("  Embedding models:");
        for (model, count) in &stats.models {
            println!("    {:<32} {:>8} chunks", model, count);
        }
    }

    if !stats.sources.is_empty() {
        println!();
        println!("  {:<16} {:>6} {:>8}   LAST INDEXED", "SOURCE", "DOCS", "CHUNKS");
        for s in &stats.sources {
            let last = s
                .last_indexed_at
                .map(format_ts_relative)
                .unwrap_or_else(|| "never".to_string());
            println!(
                "  {:<16} {:>6} {:>8}   {}",
                s.source, s.documents, s.chunks, last
            );
        }
    }

    println!();
    Ok(())
}

fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}

/// Format a Unix timestamp relative to now, e.g. "3 hours ago".
fn format_ts_relative(ts: i64) -> String {
    let delta = chrono::Utc::now().timestamp() - ts;
    if delta < 0 {
        return format_ts_iso(ts);
    }

    if delta < 60 {
        "just now".to_string()
    } else if delta < 3600 {
        let mins = delta / 60;
        format!("{} min{} ago", mins, if mins == 1 { "" } else { "s" })
    } else if delta < 86400 {
        let hours = delta / 3600;
        format!("{} hour{} ago", hours, if hours == 1 { "" } else { "s" })
    } else if delta < 86400 * 30 {
        let days = delta / 86400;
        format!("{} day{} ago", days, if days == 1 { "" } else { "s" })
    } else {
        format_ts_iso(ts)
    }
}

fn format_ts_iso(ts: i64) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| ts.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::connect_path;
    use crate::embedding::HashService;
    use crate::index::{IndexManager, SyncOptions};
    use crate::migrate::migrate_pool;
    use crate::sqlite_store::SqliteStore;
    use memex_core::chunk::Chunker;
    use memex_core::models::{Document, SourceKind};
    use std::sync::Arc;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_gather_stats_counts_by_source() {
        let tmp = TempDir::new().unwrap();
        let pool = connect_path(&tmp.path().join("memex.sqlite")).await.unwrap();
        migrate_pool(&pool).await.unwrap();

        let store = Arc::new(SqliteStore::new(pool.clone()));
        let embedder = Arc::new(HashService::new("hash-v1", 16).unwrap());
        let manager = IndexManager::new(
            Chunker::new(1000, 200, 8000).unwrap(),
            embedder,
            store.clone(),
            store,
        );
        manager
            .sync(
                vec![
                    Document::new("local_file:a.md", SourceKind::LocalFile, "a.md", "alpha"),
                    Document::new("local_file:b.md", SourceKind::LocalFile, "b.md", "beta"),
                    Document::new("gmail:1", SourceKind::Gmail, "1", "gamma"),
                ],
                &SyncOptions::default(),
            )
            .await
            .unwrap();

        let stats = gather_stats(&pool).await.unwrap();
        assert_eq!(stats.documents, 3);
        assert_eq!(stats.chunks, 3);
        assert_eq!(stats.vectors, 3);
        assert_eq!(stats.models, vec![("hash-v1".to_string(), 3)]);
        assert_eq!(stats.sources[0].source, "local_file");
        assert_eq!(stats.sources[0].documents, 2);
        assert_eq!(stats.sources[1].source, "gmail");
        assert!(stats.sources[1].last_indexed_at.is_some());
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(2048), "2.0 KB");
        assert_eq!(format_bytes(3 * 1024 * 1024), "3.0 MB");
    }
}
