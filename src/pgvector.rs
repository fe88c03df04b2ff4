//! pgvector (PostgreSQL) vector store backend.
//!
//! Provides [`PgVectorStore`], a [`VectorStore`] implementation using
//! [sqlx](https://docs.rs/sqlx) with the
//! [pgvector](https://github.com/pgvector/pgvector) extension for
//! nearest-neighbor ordering and Postgres full-text search for keyword
//! ranking.
//!
//! # Tenant isolation
//!
//! Every operation runs inside its own transaction that first sets the
//! `app.current_org_id` GUC with `set_config(..., true)` — local to that
//! transaction, never shared across pooled connections — so the row-level
//! security policy created by [`PgVectorStore::migrate`] narrows rows
//! server-side. On top of that, every query filters on a bound
//! `organization_id` parameter; ids, serialized vectors, and sanitized
//! keyword strings are always bound, never interpolated.
//!
//! # Prerequisites
//!
//! - PostgreSQL with the `vector` extension available
//! - `CREATE EXTENSION` privileges for [`PgVectorStore::migrate`]

use async_trait::async_trait;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::debug;
use uuid::Uuid;

use crate::config::SearchOptions;
use crate::error::{Result, RetrievalError};
use crate::types::{
    EMBEDDING_DIM, HybridSearchResult, NewChunk, SearchResult, combine_scores, validate_embedding,
    validate_uuid,
};
use crate::vectorstore::{
    VectorStore, sanitize_keyword_query, validate_new_chunk, validate_search_inputs,
};

/// A [`VectorStore`] backed by PostgreSQL with the pgvector extension.
pub struct PgVectorStore {
    pool: PgPool,
}

impl PgVectorStore {
    /// Connect to the given database URL with a small pool.
    pub async fn new(database_url: &str) -> std::result::Result<Self, sqlx::Error> {
        let pool = PgPoolOptions::new().max_connections(5).connect(database_url).await?;
        Ok(Self { pool })
    }

    /// Create a store from an existing connection pool.
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    fn map_err(e: sqlx::Error) -> RetrievalError {
        RetrievalError::Store { backend: "pgvector".to_string(), message: e.to_string() }
    }

    /// Create the schema: sources and chunks tables, vector and full-text
    /// indexes, and the row-level-security policy bound to the
    /// `app.current_org_id` session setting.
    pub async fn migrate(&self) -> Result<()> {
        let statements = [
            "CREATE EXTENSION IF NOT EXISTS vector",
            "CREATE TABLE IF NOT EXISTS kb_sources (\
                id UUID NOT NULL, \
                organization_id UUID NOT NULL, \
                title TEXT NOT NULL DEFAULT '', \
                deleted_at TIMESTAMPTZ, \
                created_at TIMESTAMPTZ NOT NULL DEFAULT now(), \
                PRIMARY KEY (id, organization_id)\
            )",
            "CREATE TABLE IF NOT EXISTS kb_chunks (\
                id UUID PRIMARY KEY, \
                source_id UUID NOT NULL, \
                organization_id UUID NOT NULL, \
                text TEXT NOT NULL, \
                token_count INTEGER NOT NULL, \
                chunk_index INTEGER NOT NULL, \
                embedding vector(768) NOT NULL, \
                text_hash TEXT NOT NULL, \
                page_number INTEGER, \
                section_header TEXT, \
                metadata JSONB NOT NULL DEFAULT '{}'::jsonb, \
                text_tsv tsvector GENERATED ALWAYS AS (to_tsvector('english', text)) STORED, \
                created_at TIMESTAMPTZ NOT NULL DEFAULT now(), \
                FOREIGN KEY (source_id, organization_id) \
                    REFERENCES kb_sources (id, organization_id) ON DELETE CASCADE\
            )",
            "CREATE INDEX IF NOT EXISTS kb_chunks_org_source_idx \
                ON kb_chunks (organization_id, source_id)",
            "CREATE INDEX IF NOT EXISTS kb_chunks_dedup_idx \
                ON kb_chunks (organization_id, source_id, text_hash)",
            "CREATE INDEX IF NOT EXISTS kb_chunks_tsv_idx ON kb_chunks USING GIN (text_tsv)",
            "CREATE INDEX IF NOT EXISTS kb_chunks_embedding_idx \
                ON kb_chunks USING ivfflat (embedding vector_cosine_ops) WITH (lists = 100)",
            "ALTER TABLE kb_chunks ENABLE ROW LEVEL SECURITY",
            "DROP POLICY IF EXISTS kb_chunks_tenant_policy ON kb_chunks",
            "CREATE POLICY kb_chunks_tenant_policy ON kb_chunks \
                USING (organization_id = current_setting('app.current_org_id', true)::uuid)",
            "ALTER TABLE kb_sources ENABLE ROW LEVEL SECURITY",
            "DROP POLICY IF EXISTS kb_sources_tenant_policy ON kb_sources",
            "CREATE POLICY kb_sources_tenant_policy ON kb_sources \
                USING (organization_id = current_setting('app.current_org_id', true)::uuid)",
        ];
        for sql in statements {
            sqlx::query(sql).execute(&self.pool).await.map_err(Self::map_err)?;
        }
        debug!("pgvector schema migrated");
        Ok(())
    }

    /// Begin a transaction with the tenant context set for its duration.
    ///
    /// `set_config(..., is_local = true)` scopes the GUC to this
    /// transaction, so pooled connections never leak one request's tenant
    /// into another's.
    async fn tenant_tx(&self, organization_id: Uuid) -> Result<Transaction<'_, Postgres>> {
        let mut tx = self.pool.begin().await.map_err(Self::map_err)?;
        sqlx::query("SELECT set_config('app.current_org_id', $1, true)")
            .bind(organization_id.to_string())
            .execute(&mut *tx)
            .await
            .map_err(Self::map_err)?;
        Ok(tx)
    }

    /// Serialize an embedding into the pgvector literal format.
    ///
    /// Strict, validated serialization: anything but a 768-length array of
    /// finite numbers is rejected. The literal is then bound as a
    /// parameter, never interpolated.
    fn vector_literal(embedding: &[f32]) -> Result<String> {
        validate_embedding(embedding)?;
        let mut out = String::with_capacity(EMBEDDING_DIM * 10);
        out.push('[');
        for (i, v) in embedding.iter().enumerate() {
            if i > 0 {
                out.push(',');
            }
            out.push_str(&v.to_string());
        }
        out.push(']');
        Ok(out)
    }

    fn parse_source_filter(options: &SearchOptions) -> Result<Option<Vec<Uuid>>> {
        match &options.source_ids {
            Some(ids) => {
                let mut parsed = Vec::with_capacity(ids.len());
                for id in ids {
                    parsed.push(validate_uuid(id, "source_id")?);
                }
                Ok(Some(parsed))
            }
            None => Ok(None),
        }
    }

    fn row_to_result(row: &PgRow, similarity: f32) -> SearchResult {
        let id: Uuid = row.get("id");
        let source_id: Uuid = row.get("source_id");
        let page_number: Option<i32> = row.get("page_number");
        SearchResult {
            chunk_id: id.to_string(),
            source_id: source_id.to_string(),
            source_title: row.get("title"),
            text: row.get("text"),
            page_number: page_number.map(|p| p as u32),
            section_header: row.get("section_header"),
            chunk_index: row.get::<i32, _>("chunk_index") as u32,
            similarity,
        }
    }

    async fn insert_in_tx(
        tx: &mut Transaction<'_, Postgres>,
        chunk: &NewChunk,
        org: Uuid,
        source: Uuid,
    ) -> Result<Uuid> {
        let id = Uuid::new_v4();
        let embedding = Self::vector_literal(&chunk.embedding)?;
        let metadata = serde_json::to_string(&chunk.metadata)
            .map_err(|e| RetrievalError::validation(format!("unserializable metadata: {e}")))?;

        sqlx::query(
            "INSERT INTO kb_chunks \
                (id, source_id, organization_id, text, token_count, chunk_index, \
                 embedding, text_hash, page_number, section_header, metadata) \
             VALUES ($1, $2, $3, $4, $5, $6, $7::vector, $8, $9, $10, $11::jsonb)",
        )
        .bind(id)
        .bind(source)
        .bind(org)
        .bind(&chunk.text)
        .bind(chunk.token_count as i32)
        .bind(chunk.chunk_index as i32)
        .bind(&embedding)
        .bind(&chunk.text_hash)
        .bind(chunk.page_number.map(|p| p as i32))
        .bind(&chunk.section_header)
        .bind(&metadata)
        .execute(&mut **tx)
        .await
        .map_err(Self::map_err)?;
        Ok(id)
    }
}

#[async_trait]
impl VectorStore for PgVectorStore {
    async fn register_source(
        &self,
        organization_id: &str,
        source_id: &str,
        title: &str,
    ) -> Result<()> {
        let org = validate_uuid(organization_id, "organization_id")?;
        let source = validate_uuid(source_id, "source_id")?;
        let mut tx = self.tenant_tx(org).await?;
        sqlx::query(
            "INSERT INTO kb_sources (id, organization_id, title) VALUES ($1, $2, $3) \
             ON CONFLICT (id, organization_id) DO UPDATE SET title = EXCLUDED.title",
        )
        .bind(source)
        .bind(org)
        .bind(title)
        .execute(&mut *tx)
        .await
        .map_err(Self::map_err)?;
        tx.commit().await.map_err(Self::map_err)
    }

    async fn soft_delete_source(&self, organization_id: &str, source_id: &str) -> Result<bool> {
        let org = validate_uuid(organization_id, "organization_id")?;
        let source = validate_uuid(source_id, "source_id")?;
        let mut tx = self.tenant_tx(org).await?;
        let result = sqlx::query(
            "UPDATE kb_sources SET deleted_at = now() \
             WHERE id = $1 AND organization_id = $2 AND deleted_at IS NULL",
        )
        .bind(source)
        .bind(org)
        .execute(&mut *tx)
        .await
        .map_err(Self::map_err)?;
        tx.commit().await.map_err(Self::map_err)?;
        Ok(result.rows_affected() > 0)
    }

    async fn insert(&self, chunk: &NewChunk) -> Result<String> {
        validate_new_chunk(chunk)?;
        let org = validate_uuid(&chunk.organization_id, "organization_id")?;
        let source = validate_uuid(&chunk.source_id, "source_id")?;
        let mut tx = self.tenant_tx(org).await?;
        let id = Self::insert_in_tx(&mut tx, chunk, org, source).await?;
        tx.commit().await.map_err(Self::map_err)?;
        debug!(organization_id = %org, source_id = %source, "inserted chunk");
        Ok(id.to_string())
    }

    async fn insert_batch(&self, chunks: &[NewChunk]) -> Result<Vec<String>> {
        let Some(first) = chunks.first() else { return Ok(Vec::new()) };
        for chunk in chunks {
            validate_new_chunk(chunk)?;
            if chunk.organization_id != first.organization_id {
                return Err(RetrievalError::validation(
                    "batch insert requires all chunks to share one organization",
                ));
            }
        }
        let org = validate_uuid(&first.organization_id, "organization_id")?;

        // One transaction: either every chunk lands or none do.
        let mut tx = self.tenant_tx(org).await?;
        let mut ids = Vec::with_capacity(chunks.len());
        for chunk in chunks {
            let source = validate_uuid(&chunk.source_id, "source_id")?;
            let id = Self::insert_in_tx(&mut tx, chunk, org, source).await?;
            ids.push(id.to_string());
        }
        tx.commit().await.map_err(Self::map_err)?;
        debug!(organization_id = %org, count = ids.len(), "batch inserted chunks");
        Ok(ids)
    }

    async fn search(
        &self,
        organization_id: &str,
        embedding: &[f32],
        options: &SearchOptions,
    ) -> Result<Vec<SearchResult>> {
        validate_search_inputs(organization_id, embedding, options)?;
        let org = validate_uuid(organization_id, "organization_id")?;
        let source_filter = Self::parse_source_filter(options)?;
        let query_vector = Self::vector_literal(embedding)?;

        let mut tx = self.tenant_tx(org).await?;
        let rows = sqlx::query(
            "SELECT c.id, c.source_id, s.title, c.text, c.page_number, c.section_header, \
                    c.chunk_index, \
                    (1 - (c.embedding <=> $2::vector))::float8 AS similarity \
             FROM kb_chunks c \
             JOIN kb_sources s \
               ON s.id = c.source_id AND s.organization_id = c.organization_id \
             WHERE c.organization_id = $1 \
               AND s.deleted_at IS NULL \
               AND ($3::uuid[] IS NULL OR c.source_id = ANY($3)) \
             ORDER BY c.embedding <=> $2::vector \
             LIMIT $4",
        )
        .bind(org)
        .bind(&query_vector)
        .bind(&source_filter)
        .bind(options.top_k as i64)
        .fetch_all(&mut *tx)
        .await
        .map_err(Self::map_err)?;
        tx.commit().await.map_err(Self::map_err)?;

        let results = rows
            .iter()
            .map(|row| {
                let similarity = row.get::<f64, _>("similarity") as f32;
                Self::row_to_result(row, similarity)
            })
            .filter(|r| r.similarity >= options.min_score)
            .collect();
        Ok(results)
    }

    async fn hybrid_search(
        &self,
        organization_id: &str,
        query: &str,
        embedding: &[f32],
        options: &SearchOptions,
    ) -> Result<Vec<HybridSearchResult>> {
        validate_search_inputs(organization_id, embedding, options)?;
        let org = validate_uuid(organization_id, "organization_id")?;
        let source_filter = Self::parse_source_filter(options)?;
        let query_vector = Self::vector_literal(embedding)?;
        let keyword_query = sanitize_keyword_query(query);
        // Candidate pool is the union of the vector top 2*top_k and the
        // keyword top 2*top_k, so a strong keyword match with a weak vector
        // rank can still surface before the final cut.
        let candidate_limit = (options.top_k * 2).max(options.top_k) as i64;

        let mut tx = self.tenant_tx(org).await?;
        let rows = sqlx::query(
            "WITH vector_candidates AS (\
                 SELECT c.id \
                 FROM kb_chunks c \
                 JOIN kb_sources s \
                   ON s.id = c.source_id AND s.organization_id = c.organization_id \
                 WHERE c.organization_id = $1 \
                   AND s.deleted_at IS NULL \
                   AND ($4::uuid[] IS NULL OR c.source_id = ANY($4)) \
                 ORDER BY c.embedding <=> $2::vector \
                 LIMIT $5\
             ), keyword_candidates AS (\
                 SELECT c.id, \
                        ts_rank_cd(c.text_tsv, plainto_tsquery('english', $3))::float8 \
                            AS keyword_score \
                 FROM kb_chunks c \
                 JOIN kb_sources s \
                   ON s.id = c.source_id AND s.organization_id = c.organization_id \
                 WHERE c.organization_id = $1 \
                   AND s.deleted_at IS NULL \
                   AND ($4::uuid[] IS NULL OR c.source_id = ANY($4)) \
                   AND c.text_tsv @@ plainto_tsquery('english', $3) \
                 ORDER BY keyword_score DESC \
                 LIMIT $5\
             ), candidates AS (\
                 SELECT id FROM vector_candidates \
                 UNION \
                 SELECT id FROM keyword_candidates\
             ) \
             SELECT c.id, c.source_id, s.title, c.text, c.page_number, c.section_header, \
                    c.chunk_index, \
                    (1 - (c.embedding <=> $2::vector))::float8 AS vector_score, \
                    COALESCE(k.keyword_score, 0)::float8 AS keyword_score \
             FROM candidates cand \
             JOIN kb_chunks c ON c.id = cand.id AND c.organization_id = $1 \
             JOIN kb_sources s \
               ON s.id = c.source_id AND s.organization_id = c.organization_id \
             LEFT JOIN keyword_candidates k ON k.id = cand.id",
        )
        .bind(org)
        .bind(&query_vector)
        .bind(&keyword_query)
        .bind(&source_filter)
        .bind(candidate_limit)
        .fetch_all(&mut *tx)
        .await
        .map_err(Self::map_err)?;
        tx.commit().await.map_err(Self::map_err)?;

        let mut results: Vec<HybridSearchResult> = rows
            .iter()
            .map(|row| {
                let vector_score = row.get::<f64, _>("vector_score") as f32;
                let keyword_score = row.get::<f64, _>("keyword_score") as f32;
                let final_score =
                    combine_scores(options.vector_weight, vector_score, keyword_score);
                HybridSearchResult {
                    result: Self::row_to_result(row, final_score),
                    vector_score,
                    keyword_score,
                    final_score,
                }
            })
            .collect();
        results.sort_by(|a, b| {
            b.final_score.partial_cmp(&a.final_score).unwrap_or(std::cmp::Ordering::Equal)
        });
        results.truncate(options.top_k);
        results.retain(|r| r.final_score >= options.min_score);
        Ok(results)
    }

    async fn delete_by_source(&self, organization_id: &str, source_id: &str) -> Result<u64> {
        let org = validate_uuid(organization_id, "organization_id")?;
        let source = validate_uuid(source_id, "source_id")?;
        let mut tx = self.tenant_tx(org).await?;
        let result =
            sqlx::query("DELETE FROM kb_chunks WHERE organization_id = $1 AND source_id = $2")
                .bind(org)
                .bind(source)
                .execute(&mut *tx)
                .await
                .map_err(Self::map_err)?;
        tx.commit().await.map_err(Self::map_err)?;
        debug!(organization_id = %org, source_id = %source, removed = result.rows_affected(), "deleted chunks by source");
        Ok(result.rows_affected())
    }

    async fn delete_chunk(&self, organization_id: &str, chunk_id: &str) -> Result<bool> {
        let org = validate_uuid(organization_id, "organization_id")?;
        let chunk = validate_uuid(chunk_id, "chunk_id")?;
        let mut tx = self.tenant_tx(org).await?;
        let result = sqlx::query("DELETE FROM kb_chunks WHERE organization_id = $1 AND id = $2")
            .bind(org)
            .bind(chunk)
            .execute(&mut *tx)
            .await
            .map_err(Self::map_err)?;
        tx.commit().await.map_err(Self::map_err)?;
        Ok(result.rows_affected() > 0)
    }

    async fn has_duplicate(
        &self,
        organization_id: &str,
        source_id: &str,
        text_hash: &str,
    ) -> Result<bool> {
        let org = validate_uuid(organization_id, "organization_id")?;
        let source = validate_uuid(source_id, "source_id")?;
        let mut tx = self.tenant_tx(org).await?;
        let row = sqlx::query(
            "SELECT EXISTS(\
                 SELECT 1 FROM kb_chunks \
                 WHERE organization_id = $1 AND source_id = $2 AND text_hash = $3\
             ) AS present",
        )
        .bind(org)
        .bind(source)
        .bind(text_hash)
        .fetch_one(&mut *tx)
        .await
        .map_err(Self::map_err)?;
        tx.commit().await.map_err(Self::map_err)?;
        Ok(row.get::<bool, _>("present"))
    }

    async fn count_by_source(&self, organization_id: &str, source_id: &str) -> Result<u64> {
        let org = validate_uuid(organization_id, "organization_id")?;
        let source = validate_uuid(source_id, "source_id")?;
        let mut tx = self.tenant_tx(org).await?;
        let row = sqlx::query(
            "SELECT COUNT(*) AS total FROM kb_chunks \
             WHERE organization_id = $1 AND source_id = $2",
        )
        .bind(org)
        .bind(source)
        .fetch_one(&mut *tx)
        .await
        .map_err(Self::map_err)?;
        tx.commit().await.map_err(Self::map_err)?;
        Ok(row.get::<i64, _>("total") as u64)
    }

    async fn count_by_organization(&self, organization_id: &str) -> Result<u64> {
        let org = validate_uuid(organization_id, "organization_id")?;
        let mut tx = self.tenant_tx(org).await?;
        let row = sqlx::query("SELECT COUNT(*) AS total FROM kb_chunks WHERE organization_id = $1")
            .bind(org)
            .fetch_one(&mut *tx)
            .await
            .map_err(Self::map_err)?;
        tx.commit().await.map_err(Self::map_err)?;
        Ok(row.get::<i64, _>("total") as u64)
    }
}
