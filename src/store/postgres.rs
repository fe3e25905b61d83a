//! Postgres implementation of the source, task and canonical stores.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};
use tracing::{debug, info, instrument};

use crate::error::Result;
use crate::models::{CanonicalRecord, CrawlStatus, CrawlTask, NewsSource, ParsedRecord};
use crate::store::{
    CanonicalStore, NewSource, ProgressUpdate, SourceStore, TaskFilter, TaskStore, UpsertOutcome,
};

const SCHEMA: &str = include_str!("../../migrations/0001_init.sql");

const TASK_COLUMNS: &str = "task_id, source_id, source_name, mode, since, max_pages, status, \
     progress, pages_crawled, articles_found, errors, started_at, completed_at, error_message, \
     created_at, updated_at";

const NEWS_COLUMNS: &str = "id, hash, task_id, source_id, source_code, url, title, content, \
     publish_time, crawl_time, created_at, updated_at";

/// Shared pool behind every store trait.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Open a pool against `dsn`. Failing here is a startup failure.
    pub async fn connect(dsn: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(dsn)
            .await?;
        debug!(max_connections, "Connected to Postgres");
        Ok(Self::new(pool))
    }

    /// Apply the bundled schema. Safe to run repeatedly.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::raw_sql(SCHEMA).execute(&self.pool).await?;
        info!("Schema is up to date");
        Ok(())
    }
}

fn task_from_row(row: &PgRow) -> Result<CrawlTask> {
    let mode: String = row.try_get("mode")?;
    let status: String = row.try_get("status")?;
    Ok(CrawlTask {
        task_id: row.try_get("task_id")?,
        source_id: row.try_get("source_id")?,
        source_name: row.try_get("source_name")?,
        mode: mode.parse()?,
        since: row.try_get("since")?,
        max_pages: row.try_get("max_pages")?,
        status: status.parse()?,
        progress: row.try_get("progress")?,
        pages_crawled: row.try_get("pages_crawled")?,
        articles_found: row.try_get("articles_found")?,
        errors: row.try_get("errors")?,
        started_at: row.try_get("started_at")?,
        completed_at: row.try_get("completed_at")?,
        error_message: row.try_get("error_message")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

#[async_trait]
impl SourceStore for PgStore {
    async fn get_source(&self, id: i64) -> Result<Option<NewsSource>> {
        let source = sqlx::query_as::<_, NewsSource>("SELECT * FROM news_sources WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(source)
    }

    async fn list_sources(&self) -> Result<Vec<NewsSource>> {
        let sources = sqlx::query_as::<_, NewsSource>("SELECT * FROM news_sources ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        Ok(sources)
    }

    async fn create_source(&self, source: &NewSource) -> Result<NewsSource> {
        let created = sqlx::query_as::<_, NewsSource>(
            r#"
            INSERT INTO news_sources (
                name, code, base_url, language, category, enabled,
                crawl_interval_minutes, max_concurrency
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            RETURNING *
            "#,
        )
        .bind(&source.name)
        .bind(&source.code)
        .bind(&source.base_url)
        .bind(&source.language)
        .bind(&source.category)
        .bind(source.enabled)
        .bind(source.crawl_interval_minutes)
        .bind(source.max_concurrency)
        .fetch_one(&self.pool)
        .await?;
        Ok(created)
    }

    async fn set_enabled(&self, id: i64, enabled: bool) -> Result<bool> {
        let result =
            sqlx::query("UPDATE news_sources SET enabled = $2, updated_at = NOW() WHERE id = $1")
                .bind(id)
                .bind(enabled)
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn record_crawl(&self, id: i64, status: CrawlStatus) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE news_sources
            SET last_crawl_at = NOW(), last_crawl_status = $2, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(status.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl TaskStore for PgStore {
    async fn create_task(&self, task: &CrawlTask) -> Result<()> {
        sqlx::query(&format!(
            "INSERT INTO crawl_tasks ({TASK_COLUMNS}) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)"
        ))
        .bind(&task.task_id)
        .bind(task.source_id)
        .bind(&task.source_name)
        .bind(task.mode.as_str())
        .bind(task.since)
        .bind(task.max_pages)
        .bind(task.status.as_str())
        .bind(task.progress)
        .bind(task.pages_crawled)
        .bind(task.articles_found)
        .bind(task.errors)
        .bind(task.started_at)
        .bind(task.completed_at)
        .bind(&task.error_message)
        .bind(task.created_at)
        .bind(task.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_task(&self, task_id: &str) -> Result<Option<CrawlTask>> {
        let row = sqlx::query(&format!(
            "SELECT {TASK_COLUMNS} FROM crawl_tasks WHERE task_id = $1"
        ))
        .bind(task_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(task_from_row).transpose()
    }

    async fn list_tasks(&self, filter: &TaskFilter) -> Result<Vec<CrawlTask>> {
        let rows = sqlx::query(&format!(
            "SELECT {TASK_COLUMNS} FROM crawl_tasks \
             WHERE ($1::BIGINT IS NULL OR source_id = $1) \
               AND ($2::TEXT IS NULL OR status = $2) \
             ORDER BY created_at DESC LIMIT $3"
        ))
        .bind(filter.source_id)
        .bind(filter.status.map(|s| s.as_str()))
        .bind(filter.limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(task_from_row).collect()
    }

    #[instrument(level = "debug", skip(self))]
    async fn update_status(
        &self,
        task_id: &str,
        status: CrawlStatus,
        message: Option<&str>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE crawl_tasks
            SET status = $2,
                error_message = COALESCE($3, error_message),
                started_at = CASE WHEN $2 = 'running' THEN COALESCE(started_at, NOW()) ELSE started_at END,
                completed_at = CASE WHEN $2 IN ('completed', 'failed', 'stopped') THEN NOW() ELSE completed_at END,
                updated_at = NOW()
            WHERE task_id = $1 AND status NOT IN ('completed', 'failed', 'stopped')
            "#,
        )
        .bind(task_id)
        .bind(status.as_str())
        .bind(message)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    #[instrument(level = "debug", skip(self))]
    async fn update_status_and_progress(
        &self,
        task_id: &str,
        update: &ProgressUpdate,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE crawl_tasks
            SET status = $2,
                progress = GREATEST(progress, $3),
                pages_crawled = $4,
                articles_found = $5,
                errors = $6,
                started_at = CASE WHEN $2 = 'running' THEN COALESCE(started_at, NOW()) ELSE started_at END,
                completed_at = CASE WHEN $2 IN ('completed', 'failed', 'stopped') THEN NOW() ELSE completed_at END,
                updated_at = NOW()
            WHERE task_id = $1 AND status NOT IN ('completed', 'failed', 'stopped')
            "#,
        )
        .bind(task_id)
        .bind(update.status.as_str())
        .bind(update.progress)
        .bind(update.pages_crawled)
        .bind(update.articles_found)
        .bind(update.errors)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }
}

#[async_trait]
impl CanonicalStore for PgStore {
    #[instrument(level = "debug", skip(self, record), fields(hash = %record.hash, url = %record.url))]
    async fn upsert(&self, record: &ParsedRecord) -> Result<UpsertOutcome> {
        // updated_at stays distinct across rows written in one transaction
        let row = sqlx::query(
            r#"
            INSERT INTO news (
                id, hash, task_id, source_id, source_code, url, title, content,
                publish_time, crawl_time, created_at, updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, clock_timestamp(), clock_timestamp())
            ON CONFLICT (hash) DO UPDATE SET
                title = EXCLUDED.title,
                content = EXCLUDED.content,
                publish_time = EXCLUDED.publish_time,
                crawl_time = EXCLUDED.crawl_time,
                updated_at = clock_timestamp()
            RETURNING (xmax = 0) AS inserted
            "#,
        )
        .bind(&record.id)
        .bind(&record.hash)
        .bind(&record.task_id)
        .bind(record.source_id)
        .bind(&record.source_code)
        .bind(&record.url)
        .bind(&record.title)
        .bind(&record.content)
        .bind(record.publish_time)
        .bind(record.crawl_time)
        .fetch_one(&self.pool)
        .await?;

        let inserted: bool = row.try_get("inserted")?;
        Ok(if inserted {
            UpsertOutcome::Inserted
        } else {
            UpsertOutcome::Updated
        })
    }

    async fn changed_since(
        &self,
        watermark: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<CanonicalRecord>> {
        let rows = sqlx::query_as::<_, CanonicalRecord>(&format!(
            "SELECT {NEWS_COLUMNS} FROM news WHERE updated_at > $1 ORDER BY updated_at ASC LIMIT $2"
        ))
        .bind(watermark)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn missing_fingerprints(&self, limit: i64) -> Result<Vec<CanonicalRecord>> {
        let rows = sqlx::query_as::<_, CanonicalRecord>(&format!(
            "SELECT {NEWS_COLUMNS} FROM news WHERE hash IS NULL ORDER BY created_at ASC LIMIT $1"
        ))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn set_fingerprint(&self, id: &str, hash: &str) -> Result<()> {
        sqlx::query("UPDATE news SET hash = $2, updated_at = clock_timestamp() WHERE id = $1")
            .bind(id)
            .bind(hash)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn has_url_since(&self, url: &str, since: DateTime<Utc>) -> Result<bool> {
        let row = sqlx::query(
            "SELECT EXISTS (SELECT 1 FROM news WHERE url = $1 AND crawl_time >= $2) AS seen",
        )
        .bind(url)
        .bind(since)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.try_get("seen")?)
    }
}
