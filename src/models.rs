//! Data models shared by the task engine and the raw → parsed → canonical → search pipeline.
//!
//! This module defines the core data structures used throughout the application:
//! - [`NewsSource`]: A configured site to crawl, read-only to the engine
//! - [`CrawlTask`]: One crawl run and its lifecycle state
//! - [`RawFetchEvent`]: A fetched page as published on the `raw` topic
//! - [`Article`]: The fields a parser extracts from a page
//! - [`ParsedRecord`]: An article with provenance and fingerprint, published on `parsed`
//! - [`CanonicalRecord`]: The deduplicated row held by the canonical store

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::IngestError;
use crate::fingerprint::fingerprint;

/// How much of a source a task should cover.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CrawlMode {
    /// Every planned page is fetched.
    Full,
    /// Pages already stored since the task's `since` bound are skipped.
    Incremental,
}

impl CrawlMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            CrawlMode::Full => "full",
            CrawlMode::Incremental => "incremental",
        }
    }
}

impl fmt::Display for CrawlMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CrawlMode {
    type Err = IngestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "full" => Ok(CrawlMode::Full),
            "incremental" => Ok(CrawlMode::Incremental),
            other => Err(IngestError::InvalidMode(other.to_string())),
        }
    }
}

/// Lifecycle state of a [`CrawlTask`].
///
/// ```text
/// pending --start--> running --success--> completed
///                    running --error----> failed
/// pending/running --stop request--------> stopped
/// ```
///
/// `completed`, `failed` and `stopped` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CrawlStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Stopped,
}

impl CrawlStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CrawlStatus::Pending => "pending",
            CrawlStatus::Running => "running",
            CrawlStatus::Completed => "completed",
            CrawlStatus::Failed => "failed",
            CrawlStatus::Stopped => "stopped",
        }
    }

    /// Terminal tasks accept no further status or progress writes.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            CrawlStatus::Completed | CrawlStatus::Failed | CrawlStatus::Stopped
        )
    }
}

impl fmt::Display for CrawlStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CrawlStatus {
    type Err = IngestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(CrawlStatus::Pending),
            "running" => Ok(CrawlStatus::Running),
            "completed" => Ok(CrawlStatus::Completed),
            "failed" => Ok(CrawlStatus::Failed),
            "stopped" => Ok(CrawlStatus::Stopped),
            other => Err(IngestError::InvalidRequest(format!(
                "unknown task status {other:?}"
            ))),
        }
    }
}

/// A configured news site.
///
/// The `code` selects the parser used for the site's pages; `max_concurrency`
/// bounds how many fetches run at once across all of the source's tasks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct NewsSource {
    pub id: i64,
    pub name: String,
    pub code: String,
    pub base_url: String,
    pub language: String,
    pub category: String,
    pub enabled: bool,
    pub crawl_interval_minutes: i32,
    pub max_concurrency: i32,
    pub last_crawl_at: Option<DateTime<Utc>>,
    pub last_crawl_status: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A single crawl run over one source.
///
/// Created in `pending` by the submitter, afterwards mutated only by the task
/// engine. `progress` is a percentage of planned pages and never decreases.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrawlTask {
    pub task_id: String,
    pub source_id: i64,
    pub source_name: String,
    pub mode: CrawlMode,
    pub since: Option<DateTime<Utc>>,
    pub max_pages: Option<i32>,
    pub status: CrawlStatus,
    pub progress: f64,
    pub pages_crawled: i32,
    pub articles_found: i32,
    pub errors: i32,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CrawlTask {
    /// Build a fresh `pending` task for `source`.
    pub fn pending(
        source: &NewsSource,
        mode: CrawlMode,
        since: Option<DateTime<Utc>>,
        max_pages: Option<i32>,
    ) -> Self {
        let now = Utc::now();
        Self {
            task_id: Uuid::new_v4().to_string(),
            source_id: source.id,
            source_name: source.name.clone(),
            mode,
            since,
            max_pages,
            status: CrawlStatus::Pending,
            progress: 0.0,
            pages_crawled: 0,
            articles_found: 0,
            errors: 0,
            started_at: None,
            completed_at: None,
            error_message: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// A fetched page, published once per fetch on the `raw` topic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawFetchEvent {
    pub task_id: String,
    pub source_id: i64,
    pub source_code: String,
    pub url: String,
    pub status_code: u16,
    /// Leading bytes of the response body, cut on a character boundary.
    pub body_snippet: String,
}

/// The fields a parser extracts from one page.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Article {
    pub title: String,
    pub content: String,
    /// `None` when no candidate text matched a known layout.
    pub publish_time: Option<DateTime<Utc>>,
}

/// An extracted article with provenance, published on the `parsed` topic and
/// upserted into the canonical store by its `hash`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParsedRecord {
    pub id: String,
    pub task_id: String,
    pub source_id: i64,
    pub source_code: String,
    pub url: String,
    pub title: String,
    pub content: String,
    pub publish_time: Option<DateTime<Utc>>,
    pub crawl_time: DateTime<Utc>,
    pub hash: String,
}

impl ParsedRecord {
    /// Attach provenance to `article` and fingerprint it.
    pub fn from_article(raw: &RawFetchEvent, article: Article, crawl_time: DateTime<Utc>) -> Self {
        let hash = fingerprint(&raw.url, &article.title, article.publish_time);
        Self {
            id: Uuid::new_v4().to_string(),
            task_id: raw.task_id.clone(),
            source_id: raw.source_id,
            source_code: raw.source_code.clone(),
            url: raw.url.clone(),
            title: article.title,
            content: article.content,
            publish_time: article.publish_time,
            crawl_time,
            hash,
        }
    }
}

/// A deduplicated article row in the canonical store.
///
/// `id`, `created_at`, `task_id` and `source_id` are fixed at first insert;
/// later writes with the same `hash` overwrite the content fields.
/// `hash` is `None` only on legacy rows awaiting backfill.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct CanonicalRecord {
    pub id: String,
    pub hash: Option<String>,
    pub task_id: String,
    pub source_id: i64,
    pub source_code: String,
    pub url: String,
    pub title: String,
    pub content: String,
    pub publish_time: Option<DateTime<Utc>>,
    pub crawl_time: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CanonicalRecord {
    /// The id the search index addresses this row by.
    pub fn document_id(&self) -> &str {
        match self.hash.as_deref() {
            Some(hash) if !hash.is_empty() => hash,
            _ => &self.id,
        }
    }
}
