//! Persistence traits for sources, crawl tasks and the canonical article table.
//!
//! The store layer is split into focused traits:
//! - [`SourceStore`]: configured news sites, read-only to the task engine
//! - [`TaskStore`]: crawl task rows and their guarded lifecycle writes
//! - [`CanonicalStore`]: the hash-keyed article table and its sync cursor
//!
//! [`postgres::PgStore`] implements all three; tests use an in-memory store.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::models::{CanonicalRecord, CrawlStatus, CrawlTask, NewsSource, ParsedRecord};

#[cfg(test)]
pub(crate) mod memory;
pub mod postgres;

/// Fields of a source supplied when it is registered.
#[derive(Debug, Clone, PartialEq)]
pub struct NewSource {
    pub name: String,
    pub code: String,
    pub base_url: String,
    pub language: String,
    pub category: String,
    pub enabled: bool,
    pub crawl_interval_minutes: i32,
    pub max_concurrency: i32,
}

/// Filters for [`TaskStore::list_tasks`]. Results are newest first.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskFilter {
    pub source_id: Option<i64>,
    pub status: Option<CrawlStatus>,
    pub limit: i64,
}

impl Default for TaskFilter {
    fn default() -> Self {
        Self {
            source_id: None,
            status: None,
            limit: 100,
        }
    }
}

/// A combined status and counter write for a running task.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProgressUpdate {
    pub status: CrawlStatus,
    pub progress: f64,
    pub pages_crawled: i32,
    pub articles_found: i32,
    pub errors: i32,
}

/// What an upsert did to the canonical table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    /// First sight of the hash; a new row was created.
    Inserted,
    /// The hash was already stored; its mutable fields were overwritten.
    Updated,
}

#[async_trait]
pub trait SourceStore: Send + Sync {
    async fn get_source(&self, id: i64) -> Result<Option<NewsSource>>;

    /// All sources ordered by id.
    async fn list_sources(&self) -> Result<Vec<NewsSource>>;

    async fn create_source(&self, source: &NewSource) -> Result<NewsSource>;

    /// Returns `false` when no such source exists.
    async fn set_enabled(&self, id: i64, enabled: bool) -> Result<bool>;

    /// Record when the source was last crawled and how that crawl ended.
    async fn record_crawl(&self, id: i64, status: CrawlStatus) -> Result<()>;
}

/// Crawl task persistence.
///
/// Status writes are guarded: once a task is terminal every further write is
/// a no-op reported as `false`. Stored progress never decreases. Repeating a
/// write with identical arguments leaves the row unchanged apart from
/// `updated_at`.
#[async_trait]
pub trait TaskStore: Send + Sync {
    async fn create_task(&self, task: &CrawlTask) -> Result<()>;

    async fn get_task(&self, task_id: &str) -> Result<Option<CrawlTask>>;

    async fn list_tasks(&self, filter: &TaskFilter) -> Result<Vec<CrawlTask>>;

    /// Move the task to `status`, recording `message` as its error message.
    ///
    /// Sets `started_at` on the first move to `running` and `completed_at` on
    /// the move to a terminal state. Returns whether the write applied.
    async fn update_status(
        &self,
        task_id: &str,
        status: CrawlStatus,
        message: Option<&str>,
    ) -> Result<bool>;

    /// Write status and counters together. Returns whether the write applied.
    async fn update_status_and_progress(
        &self,
        task_id: &str,
        update: &ProgressUpdate,
    ) -> Result<bool>;
}

/// The canonical article table, keyed by fingerprint.
#[async_trait]
pub trait CanonicalStore: Send + Sync {
    /// Insert the record, or overwrite the mutable fields of the row already
    /// holding its hash. Provenance and `created_at` keep their first values.
    async fn upsert(&self, record: &ParsedRecord) -> Result<UpsertOutcome>;

    /// Up to `limit` rows with `updated_at` strictly after `watermark`,
    /// ascending by `updated_at`.
    async fn changed_since(
        &self,
        watermark: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<CanonicalRecord>>;

    /// Up to `limit` legacy rows without a hash, oldest first.
    async fn missing_fingerprints(&self, limit: i64) -> Result<Vec<CanonicalRecord>>;

    /// Store `hash` on the row `id` and bump its `updated_at`.
    async fn set_fingerprint(&self, id: &str, hash: &str) -> Result<()>;

    /// Whether a row for `url` was crawled at or after `since`.
    async fn has_url_since(&self, url: &str, since: DateTime<Utc>) -> Result<bool>;
}
