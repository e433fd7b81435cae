//! SQLite-backed [`VectorStore`] and [`IndexLedger`].
//!
//! Vectors live in `chunk_vectors` as little-endian f32 BLOBs next to the
//! chunk text and its metadata JSON. Nearest-neighbour queries are
//! brute-force cosine over the rows that pass the metadata filters, which
//! are pushed down to SQL with `json_extract`.
//!
//! Multi-row writes run inside a transaction, so concurrent readers never
//! observe a partially written batch.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool, Transaction};

use memex_core::embedding::{blob_to_vec, cosine_distance, vec_to_blob};
use memex_core::models::{DocumentRecord, IndexEntry, MetaValue, Metadata, SourceKind};
use memex_core::store::{DistanceMetric, Filters, IndexLedger, Neighbor, VectorRecord, VectorStore};
use memex_core::{MemexError, Result};

pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn db_err(e: sqlx::Error) -> MemexError {
    MemexError::storage(e.to_string())
}

fn from_timestamp(ts: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(ts, 0).unwrap_or_default()
}

fn parse_metadata(json: &str) -> Metadata {
    serde_json::from_str(json).unwrap_or_default()
}

fn parse_source(value: &str) -> Result<SourceKind> {
    value
        .parse()
        .map_err(|_| MemexError::storage(format!("unknown source '{}' in index", value)))
}

/// JSON path for a top-level metadata key.
fn json_path(key: &str) -> String {
    format!("$.\"{}\"", key.replace('"', "\\\""))
}

fn push_filters<'a>(qb: &mut QueryBuilder<'a, Sqlite>, filters: &'a Filters) {
    let mut first = true;
    for (key, value) in filters {
        qb.push(if first { " WHERE " } else { " AND " });
        first = false;
        qb.push("json_extract(metadata_json, ");
        qb.push_bind(json_path(key));
        qb.push(") = ");
        match value {
            MetaValue::Text(s) => qb.push_bind(s.as_str()),
            MetaValue::Int(i) => qb.push_bind(*i),
            MetaValue::Float(x) => qb.push_bind(*x),
            MetaValue::Bool(b) => qb.push_bind(i64::from(*b)),
        };
    }
}

async fn upsert_vector(tx: &mut Transaction<'_, Sqlite>, record: &VectorRecord) -> Result<()> {
    let metadata_json = serde_json::to_string(&record.metadata)?;
    sqlx::query(
        r#"
        INSERT INTO chunk_vectors (chunk_id, document_id, text, metadata_json, dims, embedding)
        VALUES (?, ?, ?, ?, ?, ?)
        ON CONFLICT(chunk_id) DO UPDATE SET
            document_id = excluded.document_id,
            text = excluded.text,
            metadata_json = excluded.metadata_json,
            dims = excluded.dims,
            embedding = excluded.embedding
        "#,
    )
    .bind(&record.id)
    .bind(&record.document_id)
    .bind(&record.text)
    .bind(&metadata_json)
    .bind(record.embedding.len() as i64)
    .bind(vec_to_blob(&record.embedding))
    .execute(&mut **tx)
    .await
    .map_err(db_err)?;
    Ok(())
}

fn row_to_record(row: &SqliteRow) -> VectorRecord {
    let blob: Vec<u8> = row.get("embedding");
    let metadata_json: String = row.get("metadata_json");
    VectorRecord {
        id: row.get("chunk_id"),
        document_id: row.get("document_id"),
        embedding: blob_to_vec(&blob),
        text: row.get("text"),
        metadata: parse_metadata(&metadata_json),
    }
}

#[async_trait]
impl VectorStore for SqliteStore {
    fn metric(&self) -> DistanceMetric {
        DistanceMetric::Cosine
    }

    fn supports_filters(&self) -> bool {
        true
    }

    async fn add(&self, records: Vec<VectorRecord>) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        for record in &records {
            upsert_vector(&mut tx, record).await?;
        }
        tx.commit().await.map_err(db_err)?;
        Ok(())
    }

    async fn replace(&self, records: Vec<VectorRecord>, remove: &[String]) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        for id in remove {
            sqlx::query("DELETE FROM chunk_vectors WHERE chunk_id = ?")
                .bind(id)
                .execute(&mut *tx)
                .await
                .map_err(db_err)?;
        }
        for record in &records {
            upsert_vector(&mut tx, record).await?;
        }
        tx.commit().await.map_err(db_err)?;
        Ok(())
    }

    async fn scan(&self, filters: &Filters, limit: usize) -> Result<Vec<VectorRecord>> {
        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(
            "SELECT chunk_id, document_id, text, metadata_json, embedding FROM chunk_vectors",
        );
        push_filters(&mut qb, filters);
        qb.push(
            " ORDER BY COALESCE(json_extract(metadata_json, '$.updated_at'), 0) DESC, chunk_id ASC LIMIT ",
        );
        qb.push_bind(limit as i64);

        let rows = qb.build().fetch_all(&self.pool).await.map_err(db_err)?;
        Ok(rows.iter().map(row_to_record).collect())
    }

    async fn query(&self, embedding: &[f32], k: usize, filters: &Filters) -> Result<Vec<Neighbor>> {
        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(
            "SELECT chunk_id, document_id, text, metadata_json, embedding FROM chunk_vectors",
        );
        push_filters(&mut qb, filters);

        let rows = qb.build().fetch_all(&self.pool).await.map_err(db_err)?;

        let mut neighbors: Vec<Neighbor> = rows
            .iter()
            .map(|row| {
                let record = row_to_record(row);
                Neighbor {
                    distance: cosine_distance(embedding, &record.embedding),
                    id: record.id,
                    document_id: record.document_id,
                    text: record.text,
                    metadata: record.metadata,
                }
            })
            .collect();

        neighbors.sort_by(|a, b| a.distance.total_cmp(&b.distance).then_with(|| a.id.cmp(&b.id)));
        neighbors.truncate(k);
        Ok(neighbors)
    }

    async fn get(&self, ids: &[String]) -> Result<Vec<VectorRecord>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(
            "SELECT chunk_id, document_id, text, metadata_json, embedding FROM chunk_vectors WHERE chunk_id IN (",
        );
        let mut separated = qb.separated(", ");
        for id in ids {
            separated.push_bind(id.as_str());
        }
        separated.push_unseparated(")");

        let rows = qb.build().fetch_all(&self.pool).await.map_err(db_err)?;
        let mut records: Vec<VectorRecord> = rows.iter().map(row_to_record).collect();
        records.sort_by_key(|r| ids.iter().position(|id| *id == r.id));
        Ok(records)
    }

    async fn delete(&self, ids: &[String]) -> Result<usize> {
        if ids.is_empty() {
            return Ok(0);
        }
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let mut removed = 0;
        for id in ids {
            let result = sqlx::query("DELETE FROM chunk_vectors WHERE chunk_id = ?")
                .bind(id)
                .execute(&mut *tx)
                .await
                .map_err(db_err)?;
            removed += result.rows_affected() as usize;
        }
        tx.commit().await.map_err(db_err)?;
        Ok(removed)
    }

    async fn count(&self) -> Result<usize> {
        let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chunk_vectors")
            .fetch_one(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(n as usize)
    }
}

#[async_trait]
impl IndexLedger for SqliteStore {
    async fn document(&self, document_id: &str) -> Result<Option<DocumentRecord>> {
        let row = sqlx::query(
            "SELECT document_id, source, content_hash, chunk_count, embedding_model, indexed_at \
             FROM index_documents WHERE document_id = ?",
        )
        .bind(document_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        let Some(row) = row else {
            return Ok(None);
        };
        let source: String = row.get("source");
        let chunk_count: i64 = row.get("chunk_count");
        Ok(Some(DocumentRecord {
            document_id: row.get("document_id"),
            source: parse_source(&source)?,
            content_hash: row.get("content_hash"),
            chunk_count: chunk_count as usize,
            embedding_model_name: row.get("embedding_model"),
            indexed_at: from_timestamp(row.get("indexed_at")),
        }))
    }

    async fn entries(&self, document_id: &str) -> Result<Vec<IndexEntry>> {
        let rows = sqlx::query(
            "SELECT chunk_id, document_id, content_hash, embedding_model, embedding_dimension, indexed_at \
             FROM index_entries WHERE document_id = ? ORDER BY chunk_id",
        )
        .bind(document_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(rows
            .iter()
            .map(|row| {
                let dims: i64 = row.get("embedding_dimension");
                IndexEntry {
                    chunk_id: row.get("chunk_id"),
                    document_id: row.get("document_id"),
                    content_hash: row.get("content_hash"),
                    embedding_model_name: row.get("embedding_model"),
                    embedding_dimension: dims as usize,
                    indexed_at: from_timestamp(row.get("indexed_at")),
                }
            })
            .collect())
    }

    async fn document_ids(&self, source: Option<SourceKind>) -> Result<Vec<String>> {
        let ids = match source {
            Some(source) => {
                sqlx::query_scalar(
                    "SELECT document_id FROM index_documents WHERE source = ? ORDER BY document_id",
                )
                .bind(source.as_str())
                .fetch_all(&self.pool)
                .await
            }
            None => {
                sqlx::query_scalar("SELECT document_id FROM index_documents ORDER BY document_id")
                    .fetch_all(&self.pool)
                    .await
            }
        }
        .map_err(db_err)?;
        Ok(ids)
    }

    async fn commit(&self, record: &DocumentRecord, entries: &[IndexEntry]) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        sqlx::query("DELETE FROM index_entries WHERE document_id = ?")
            .bind(&record.document_id)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;

        for entry in entries {
            sqlx::query(
                r#"
                INSERT INTO index_entries (chunk_id, document_id, content_hash, embedding_model,
                                           embedding_dimension, indexed_at)
                VALUES (?, ?, ?, ?, ?, ?)
                ON CONFLICT(chunk_id) DO UPDATE SET
                    document_id = excluded.document_id,
                    content_hash = excluded.content_hash,
                    embedding_model = excluded.embedding_model,
                    embedding_dimension = excluded.embedding_dimension,
                    indexed_at = excluded.indexed_at
                "#,
            )
            .bind(&entry.chunk_id)
            .bind(&entry.document_id)
            .bind(&entry.content_hash)
            .bind(&entry.embedding_model_name)
            .bind(entry.embedding_dimension as i64)
            .bind(entry.indexed_at.timestamp())
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        }

        sqlx::query(
            r#"
            INSERT INTO index_documents (document_id, source, content_hash, chunk_count,
                                         embedding_model, indexed_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(document_id) DO UPDATE SET
                source = excluded.source,
                content_hash = excluded.content_hash,
                chunk_count = excluded.chunk_count,
                embedding_model = excluded.embedding_model,
                indexed_at = excluded.indexed_at
            "#,
        )
        .bind(&record.document_id)
        .bind(record.source.as_str())
        .bind(&record.content_hash)
        .bind(record.chunk_count as i64)
        .bind(&record.embedding_model_name)
        .bind(record.indexed_at.timestamp())
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        tx.commit().await.map_err(db_err)?;
        Ok(())
    }

    async fn remove(&self, document_id: &str) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        sqlx::query("DELETE FROM index_entries WHERE document_id = ?")
            .bind(document_id)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        sqlx::query("DELETE FROM index_documents WHERE document_id = ?")
            .bind(document_id)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        tx.commit().await.map_err(db_err)?;
        Ok(())
    }
}
