//! In-memory store used by tests. Mirrors the guarded writes of the Postgres
//! implementation and records every applied task write.

use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use crate::error::{IngestError, Result};
use crate::models::{CanonicalRecord, CrawlStatus, CrawlTask, NewsSource, ParsedRecord};
use crate::store::{
    CanonicalStore, NewSource, ProgressUpdate, SourceStore, TaskFilter, TaskStore, UpsertOutcome,
};

/// One applied task write: status and progress after the write.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TaskWrite {
    pub status: CrawlStatus,
    pub progress: f64,
}

#[derive(Default)]
struct Inner {
    sources: BTreeMap<i64, NewsSource>,
    tasks: BTreeMap<String, CrawlTask>,
    writes: BTreeMap<String, Vec<TaskWrite>>,
    news: Vec<CanonicalRecord>,
    last_tick: Option<DateTime<Utc>>,
    fail_upserts: usize,
    fail_source_reads: usize,
    fail_url_checks: usize,
    /// Task writes left before every further one fails; `None` is unlimited.
    task_writes_left: Option<usize>,
    fail_fingerprint_for: Option<String>,
}

impl Inner {
    fn take_task_write(&mut self) -> Result<()> {
        match self.task_writes_left.as_mut() {
            Some(0) => Err(IngestError::Storage(sqlx::Error::PoolTimedOut)),
            Some(left) => {
                *left -= 1;
                Ok(())
            }
            None => Ok(()),
        }
    }

    /// Strictly increasing timestamps, so `updated_at` ordering is total.
    fn tick(&mut self) -> DateTime<Utc> {
        let now = Utc::now();
        let next = match self.last_tick {
            Some(last) if now <= last => last + Duration::microseconds(1),
            _ => now,
        };
        self.last_tick = Some(next);
        next
    }

    fn apply_status(
        &mut self,
        task_id: &str,
        status: CrawlStatus,
        message: Option<&str>,
    ) -> Option<&mut CrawlTask> {
        let now = self.tick();
        let task = self.tasks.get_mut(task_id)?;
        if task.status.is_terminal() {
            return None;
        }
        task.status = status;
        if let Some(message) = message {
            task.error_message = Some(message.to_string());
        }
        if status == CrawlStatus::Running && task.started_at.is_none() {
            task.started_at = Some(now);
        }
        if status.is_terminal() {
            task.completed_at = Some(now);
        }
        task.updated_at = now;
        Some(task)
    }
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a source with the given id, code and concurrency bound.
    pub fn add_source(&self, id: i64, code: &str, base_url: &str, max_concurrency: i32) -> NewsSource {
        let now = Utc::now();
        let source = NewsSource {
            id,
            name: format!("{code} source"),
            code: code.to_string(),
            base_url: base_url.to_string(),
            language: "zh".to_string(),
            category: "military".to_string(),
            enabled: true,
            crawl_interval_minutes: 60,
            max_concurrency,
            last_crawl_at: None,
            last_crawl_status: None,
            created_at: now,
            updated_at: now,
        };
        self.inner
            .lock()
            .unwrap()
            .sources
            .insert(id, source.clone());
        source
    }

    /// Applied writes for `task_id`, in order.
    pub fn writes(&self, task_id: &str) -> Vec<TaskWrite> {
        self.inner
            .lock()
            .unwrap()
            .writes
            .get(task_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn news(&self) -> Vec<CanonicalRecord> {
        self.inner.lock().unwrap().news.clone()
    }

    /// Insert a row as-is, bypassing the hash-keyed upsert.
    pub fn seed_news(&self, mut record: CanonicalRecord) -> CanonicalRecord {
        let mut inner = self.inner.lock().unwrap();
        let now = inner.tick();
        record.created_at = now;
        record.updated_at = now;
        inner.news.push(record.clone());
        record
    }

    /// Make the next `n` upserts fail with a storage error.
    pub fn fail_next_upserts(&self, n: usize) {
        self.inner.lock().unwrap().fail_upserts = n;
    }

    /// Make the next `n` `get_source` calls fail with a storage error.
    pub fn fail_next_source_reads(&self, n: usize) {
        self.inner.lock().unwrap().fail_source_reads = n;
    }

    pub fn pending_source_read_failures(&self) -> usize {
        self.inner.lock().unwrap().fail_source_reads
    }

    /// Make the next `n` `has_url_since` calls fail with a storage error.
    pub fn fail_next_url_checks(&self, n: usize) {
        self.inner.lock().unwrap().fail_url_checks = n;
    }

    /// Let `n` more task status writes through, then fail every later one.
    pub fn fail_task_writes_after(&self, n: usize) {
        self.inner.lock().unwrap().task_writes_left = Some(n);
    }

    pub fn allow_task_writes(&self) {
        self.inner.lock().unwrap().task_writes_left = None;
    }

    /// Make `set_fingerprint` fail for row `id`.
    pub fn fail_fingerprint_for(&self, id: &str) {
        self.inner.lock().unwrap().fail_fingerprint_for = Some(id.to_string());
    }
}

#[async_trait]
impl SourceStore for MemoryStore {
    async fn get_source(&self, id: i64) -> Result<Option<NewsSource>> {
        let mut inner = self.inner.lock().unwrap();
        if inner.fail_source_reads > 0 {
            inner.fail_source_reads -= 1;
            return Err(IngestError::Storage(sqlx::Error::PoolTimedOut));
        }
        Ok(inner.sources.get(&id).cloned())
    }

    async fn list_sources(&self) -> Result<Vec<NewsSource>> {
        Ok(self.inner.lock().unwrap().sources.values().cloned().collect())
    }

    async fn create_source(&self, source: &NewSource) -> Result<NewsSource> {
        let mut inner = self.inner.lock().unwrap();
        let id = inner.sources.keys().max().copied().unwrap_or(0) + 1;
        let now = inner.tick();
        let created = NewsSource {
            id,
            name: source.name.clone(),
            code: source.code.clone(),
            base_url: source.base_url.clone(),
            language: source.language.clone(),
            category: source.category.clone(),
            enabled: source.enabled,
            crawl_interval_minutes: source.crawl_interval_minutes,
            max_concurrency: source.max_concurrency,
            last_crawl_at: None,
            last_crawl_status: None,
            created_at: now,
            updated_at: now,
        };
        inner.sources.insert(id, created.clone());
        Ok(created)
    }

    async fn set_enabled(&self, id: i64, enabled: bool) -> Result<bool> {
        let mut inner = self.inner.lock().unwrap();
        let now = inner.tick();
        Ok(match inner.sources.get_mut(&id) {
            Some(source) => {
                source.enabled = enabled;
                source.updated_at = now;
                true
            }
            None => false,
        })
    }

    async fn record_crawl(&self, id: i64, status: CrawlStatus) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let now = inner.tick();
        if let Some(source) = inner.sources.get_mut(&id) {
            source.last_crawl_at = Some(now);
            source.last_crawl_status = Some(status.to_string());
        }
        Ok(())
    }
}

#[async_trait]
impl TaskStore for MemoryStore {
    async fn create_task(&self, task: &CrawlTask) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.tasks.insert(task.task_id.clone(), task.clone());
        inner.writes.entry(task.task_id.clone()).or_default().push(TaskWrite {
            status: task.status,
            progress: task.progress,
        });
        Ok(())
    }

    async fn get_task(&self, task_id: &str) -> Result<Option<CrawlTask>> {
        Ok(self.inner.lock().unwrap().tasks.get(task_id).cloned())
    }

    async fn list_tasks(&self, filter: &TaskFilter) -> Result<Vec<CrawlTask>> {
        let inner = self.inner.lock().unwrap();
        let mut tasks: Vec<CrawlTask> = inner
            .tasks
            .values()
            .filter(|t| filter.source_id.is_none_or(|id| t.source_id == id))
            .filter(|t| filter.status.is_none_or(|s| t.status == s))
            .cloned()
            .collect();
        tasks.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        tasks.truncate(filter.limit.max(0) as usize);
        Ok(tasks)
    }

    async fn update_status(
        &self,
        task_id: &str,
        status: CrawlStatus,
        message: Option<&str>,
    ) -> Result<bool> {
        let mut inner = self.inner.lock().unwrap();
        inner.take_task_write()?;
        let Some(task) = inner.apply_status(task_id, status, message) else {
            return Ok(false);
        };
        let write = TaskWrite {
            status: task.status,
            progress: task.progress,
        };
        inner.writes.entry(task_id.to_string()).or_default().push(write);
        Ok(true)
    }

    async fn update_status_and_progress(
        &self,
        task_id: &str,
        update: &ProgressUpdate,
    ) -> Result<bool> {
        let mut inner = self.inner.lock().unwrap();
        inner.take_task_write()?;
        let Some(task) = inner.apply_status(task_id, update.status, None) else {
            return Ok(false);
        };
        task.progress = task.progress.max(update.progress);
        task.pages_crawled = update.pages_crawled;
        task.articles_found = update.articles_found;
        task.errors = update.errors;
        let write = TaskWrite {
            status: task.status,
            progress: task.progress,
        };
        inner.writes.entry(task_id.to_string()).or_default().push(write);
        Ok(true)
    }
}

#[async_trait]
impl CanonicalStore for MemoryStore {
    async fn upsert(&self, record: &ParsedRecord) -> Result<UpsertOutcome> {
        let mut inner = self.inner.lock().unwrap();
        if inner.fail_upserts > 0 {
            inner.fail_upserts -= 1;
            return Err(IngestError::Timeout(std::time::Duration::from_secs(1)));
        }
        let now = inner.tick();
        if let Some(row) = inner
            .news
            .iter_mut()
            .find(|row| row.hash.as_deref() == Some(record.hash.as_str()))
        {
            row.title = record.title.clone();
            row.content = record.content.clone();
            row.publish_time = record.publish_time;
            row.crawl_time = record.crawl_time;
            row.updated_at = now;
            return Ok(UpsertOutcome::Updated);
        }
        inner.news.push(CanonicalRecord {
            id: record.id.clone(),
            hash: Some(record.hash.clone()),
            task_id: record.task_id.clone(),
            source_id: record.source_id,
            source_code: record.source_code.clone(),
            url: record.url.clone(),
            title: record.title.clone(),
            content: record.content.clone(),
            publish_time: record.publish_time,
            crawl_time: record.crawl_time,
            created_at: now,
            updated_at: now,
        });
        Ok(UpsertOutcome::Inserted)
    }

    async fn changed_since(
        &self,
        watermark: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<CanonicalRecord>> {
        let inner = self.inner.lock().unwrap();
        let mut rows: Vec<CanonicalRecord> = inner
            .news
            .iter()
            .filter(|row| row.updated_at > watermark)
            .cloned()
            .collect();
        rows.sort_by_key(|row| row.updated_at);
        rows.truncate(limit.max(0) as usize);
        Ok(rows)
    }

    async fn missing_fingerprints(&self, limit: i64) -> Result<Vec<CanonicalRecord>> {
        let inner = self.inner.lock().unwrap();
        let mut rows: Vec<CanonicalRecord> = inner
            .news
            .iter()
            .filter(|row| row.hash.is_none())
            .cloned()
            .collect();
        rows.sort_by_key(|row| row.created_at);
        rows.truncate(limit.max(0) as usize);
        Ok(rows)
    }

    async fn set_fingerprint(&self, id: &str, hash: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if inner.fail_fingerprint_for.as_deref() == Some(id) {
            return Err(IngestError::Storage(sqlx::Error::PoolTimedOut));
        }
        let now = inner.tick();
        if let Some(row) = inner.news.iter_mut().find(|row| row.id == id) {
            row.hash = Some(hash.to_string());
            row.updated_at = now;
        }
        Ok(())
    }

    async fn has_url_since(&self, url: &str, since: DateTime<Utc>) -> Result<bool> {
        let mut inner = self.inner.lock().unwrap();
        if inner.fail_url_checks > 0 {
            inner.fail_url_checks -= 1;
            return Err(IngestError::Storage(sqlx::Error::PoolTimedOut));
        }
        Ok(inner
            .news
            .iter()
            .any(|row| row.url == url && row.crawl_time >= since))
    }
}

/// A legacy row without a hash, for backfill and sync tests.
pub fn legacy_row(url: &str, title: &str) -> CanonicalRecord {
    let now = Utc::now();
    CanonicalRecord {
        id: Uuid::new_v4().to_string(),
        hash: None,
        task_id: "legacy".to_string(),
        source_id: 1,
        source_code: "people_military".to_string(),
        url: url.to_string(),
        title: title.to_string(),
        content: format!("{title} body"),
        publish_time: None,
        crawl_time: now,
        created_at: now,
        updated_at: now,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::CrawlMode;

    #[tokio::test]
    async fn test_terminal_tasks_reject_writes() {
        let store = MemoryStore::new();
        let source = store.add_source(1, "people_military", "http://a.example/", 1);
        let task = CrawlTask::pending(&source, CrawlMode::Full, None, None);
        store.create_task(&task).await.unwrap();

        assert!(store.update_status(&task.task_id, CrawlStatus::Running, None).await.unwrap());
        assert!(
            store
                .update_status(&task.task_id, CrawlStatus::Stopped, Some("operator"))
                .await
                .unwrap()
        );
        assert!(!store.update_status(&task.task_id, CrawlStatus::Completed, None).await.unwrap());

        let stored = store.get_task(&task.task_id).await.unwrap().unwrap();
        assert_eq!(stored.status, CrawlStatus::Stopped);
        assert_eq!(stored.error_message.as_deref(), Some("operator"));
        assert!(stored.started_at.is_some());
        assert!(stored.completed_at.is_some());
    }

    #[tokio::test]
    async fn test_progress_never_decreases() {
        let store = MemoryStore::new();
        let source = store.add_source(1, "people_military", "http://a.example/", 1);
        let task = CrawlTask::pending(&source, CrawlMode::Full, None, None);
        store.create_task(&task).await.unwrap();

        let mut update = ProgressUpdate {
            status: CrawlStatus::Running,
            progress: 60.0,
            pages_crawled: 3,
            articles_found: 3,
            errors: 0,
        };
        store.update_status_and_progress(&task.task_id, &update).await.unwrap();
        update.progress = 40.0;
        store.update_status_and_progress(&task.task_id, &update).await.unwrap();

        let stored = store.get_task(&task.task_id).await.unwrap().unwrap();
        assert_eq!(stored.progress, 60.0);
    }
}
