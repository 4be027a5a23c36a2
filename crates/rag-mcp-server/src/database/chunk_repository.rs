use super::{ChunkHit, DbPool, PageDocument};
use anyhow::Result;
use async_trait::async_trait;
use pgvector::Vector;
use tracing::debug;

/// Read-side access to the indexed documentation corpus.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ChunkStore: Send + Sync {
    /// ANN nearest neighbors by cosine distance. May return fewer than `limit`.
    async fn semantic_search(&self, embedding: Vec<f32>, limit: i64) -> Result<Vec<ChunkHit>>;

    /// Lexical ranking with the `simple` text-search configuration.
    async fn keyword_search(&self, query: &str, limit: i64) -> Result<Vec<ChunkHit>>;

    /// Assemble a full page from its chunks, or None if the URL is unknown.
    async fn get_page_by_url(&self, url: &str) -> Result<Option<PageDocument>>;
}

pub struct ChunkRepository {
    pool: DbPool,
}

impl ChunkRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ChunkStore for ChunkRepository {
    async fn semantic_search(&self, embedding: Vec<f32>, limit: i64) -> Result<Vec<ChunkHit>> {
        let vector = Vector::from(embedding);

        let chunks = sqlx::query_as::<_, ChunkHit>(
            r#"SELECT
                id,
                url,
                title,
                content,
                chunk_index,
                total_chunks,
                (1 - (embedding <=> $1))::real AS score
               FROM doc_chunks
               ORDER BY embedding <=> $1
               LIMIT $2"#,
        )
        .bind(vector)
        .bind(limit)
        .fetch_all(self.pool.get_pool())
        .await?;

        debug!("Semantic search returned {} chunks", chunks.len());

        Ok(chunks)
    }

    async fn keyword_search(&self, query: &str, limit: i64) -> Result<Vec<ChunkHit>> {
        // `simple` config: case-folded, split on non-alphanumeric, no stemming,
        // no stop-list.
        let chunks = sqlx::query_as::<_, ChunkHit>(
            r#"SELECT
                id,
                url,
                title,
                content,
                chunk_index,
                total_chunks,
                ts_rank_cd(lexeme, query)::real AS score
               FROM doc_chunks, plainto_tsquery('simple', $1) AS query
               WHERE lexeme @@ query
               ORDER BY score DESC, id ASC
               LIMIT $2"#,
        )
        .bind(query)
        .bind(limit)
        .fetch_all(self.pool.get_pool())
        .await?;

        debug!("Keyword search returned {} chunks", chunks.len());

        Ok(chunks)
    }

    async fn get_page_by_url(&self, url: &str) -> Result<Option<PageDocument>> {
        let page = sqlx::query_as::<_, PageDocument>(
            r#"SELECT
                MIN(id) AS id,
                MAX(title) AS title,
                STRING_AGG(content, E'\n\n' ORDER BY chunk_index) AS content
               FROM doc_chunks
               WHERE url = $1
               GROUP BY url"#,
        )
        .bind(url)
        .fetch_optional(self.pool.get_pool())
        .await?;

        Ok(page)
    }
}
