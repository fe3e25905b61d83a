//! Crawl task lifecycle engine.
//!
//! The engine owns every running [`CrawlTask`]: it validates submissions,
//! starts tasks in the background, honours stop requests at iteration
//! boundaries and is the only writer of a running task's row.
//!
//! # Task Lifecycle
//!
//! ```text
//! submit ──► pending ──start──► running ──► completed
//!               │                  ├──────► failed
//!               └──────stop────────┴──────► stopped
//! ```
//!
//! # One Crawl Run
//!
//! 1. Fetch the source's base URL. Failing here fails the task.
//! 2. Plan pages: same-host article links on the base page, at most
//!    `max_pages` of them; the base page itself when it has no links.
//!    Incremental runs drop pages already stored since `since`.
//! 3. Per page: check for a stop, take a source permit and a global permit,
//!    fetch with retry, emit a [`RawFetchEvent`] on the raw topic, write
//!    progress as a percentage of planned pages.
//! 4. Complete, or fail when every page failed.
//!
//! All status and progress writes of a running task go through its
//! [`writer::StatusWriter`], so a stop can never be overwritten by a late
//! progress or completion write.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex as AsyncMutex;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, warn};

use crate::broker::{TopicPublisher, publish_json};
use crate::error::{IngestError, Result};
use crate::fetcher::{FetchedPage, PageFetcher, discover_article_links};
use crate::models::{CrawlMode, CrawlStatus, CrawlTask, NewsSource, RawFetchEvent};
use crate::retry::{Backoff, with_timeout};
use crate::store::{CanonicalStore, ProgressUpdate, SourceStore, TaskFilter, TaskStore};
use crate::utils::bounded_snippet;

pub mod limits;
pub mod writer;

use limits::ConcurrencyLimits;
use writer::{StatusCommand, StatusWriter, StopReason, WriterHandle};

/// Error message of a `running` row failed by [`TaskEngine::fail_orphaned`].
pub const ORPHANED_REASON: &str = "run ended without recording a final status";

/// Tunables for crawl runs.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Topic raw fetch events are published to.
    pub topic_raw: String,
    /// Largest body snippet carried by a raw event, in bytes.
    pub snippet_bytes: usize,
    /// Page budget for tasks submitted without `max_pages`.
    pub default_max_pages: i32,
    /// Bound on a single fetch attempt.
    pub fetch_timeout: Duration,
    /// Retry policy for fetches, raw event publishes and store reads during a
    /// run.
    pub fetch_backoff: Backoff,
    /// Fetches in flight across all tasks.
    pub global_max_fetches: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            topic_raw: "news.raw".to_string(),
            snippet_bytes: 4096,
            default_max_pages: 5,
            fetch_timeout: Duration::from_secs(15),
            fetch_backoff: Backoff::new(3, Duration::from_millis(500)),
            global_max_fetches: 16,
        }
    }
}

/// Collaborators the engine drives.
#[derive(Clone)]
pub struct EngineParts {
    pub sources: Arc<dyn SourceStore>,
    pub tasks: Arc<dyn TaskStore>,
    pub canonical: Arc<dyn CanonicalStore>,
    pub fetcher: Arc<dyn PageFetcher>,
    pub publisher: Arc<dyn TopicPublisher>,
}

/// A task submission.
#[derive(Debug, Clone, PartialEq)]
pub struct SubmitRequest {
    pub source_id: i64,
    pub mode: CrawlMode,
    pub since: Option<DateTime<Utc>>,
    pub max_pages: Option<i32>,
}

/// Validate `request` and persist a new `pending` task for it.
///
/// # Errors
///
/// - [`IngestError::SourceNotFound`] / [`IngestError::SourceDisabled`] for a
///   missing or switched-off source
/// - [`IngestError::InvalidMode`] for an incremental request without `since`
/// - [`IngestError::InvalidRequest`] for a non-positive `max_pages`
pub async fn submit_task(
    sources: &dyn SourceStore,
    tasks: &dyn TaskStore,
    request: SubmitRequest,
) -> Result<CrawlTask> {
    let source = sources
        .get_source(request.source_id)
        .await?
        .ok_or(IngestError::SourceNotFound(request.source_id))?;
    if !source.enabled {
        return Err(IngestError::SourceDisabled(source.id));
    }
    if request.mode == CrawlMode::Incremental && request.since.is_none() {
        return Err(IngestError::InvalidMode(
            "incremental mode requires a since bound".to_string(),
        ));
    }
    if let Some(max_pages) = request.max_pages.filter(|&n| n <= 0) {
        return Err(IngestError::InvalidRequest(format!(
            "max_pages must be positive, got {max_pages}"
        )));
    }

    let task = CrawlTask::pending(&source, request.mode, request.since, request.max_pages);
    tasks.create_task(&task).await?;
    info!(task_id = %task.task_id, source_code = %source.code, mode = %task.mode, "Task submitted");
    Ok(task)
}

/// Stop a task this process is not running by writing `stopped` directly.
///
/// An engine running the task elsewhere sees its next write refused and winds
/// the run down. Terminal tasks are returned unchanged.
pub async fn stop_task(tasks: &dyn TaskStore, task_id: &str, reason: &str) -> Result<CrawlTask> {
    let task = tasks
        .get_task(task_id)
        .await?
        .ok_or_else(|| IngestError::NotFound(task_id.to_string()))?;
    if task.status.is_terminal() {
        return Ok(task);
    }
    tasks
        .update_status(task_id, CrawlStatus::Stopped, Some(reason))
        .await?;
    tasks
        .get_task(task_id)
        .await?
        .ok_or_else(|| IngestError::NotFound(task_id.to_string()))
}

#[derive(Clone)]
struct RunningTask {
    token: CancellationToken,
    stop_reason: StopReason,
    writer: WriterHandle,
    finished: CancellationToken,
}

struct EngineInner {
    parts: EngineParts,
    config: EngineConfig,
    limits: ConcurrencyLimits,
    running: AsyncMutex<HashMap<String, RunningTask>>,
    shutdown: CancellationToken,
}

/// Handle to the task engine. Cheap to clone.
#[derive(Clone)]
pub struct TaskEngine {
    inner: Arc<EngineInner>,
}

/// Counters of one crawl run.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
struct RunCounters {
    planned: usize,
    done: usize,
    pages_crawled: i32,
    articles_found: i32,
    errors: i32,
}

impl RunCounters {
    fn progress(&self) -> f64 {
        if self.planned == 0 {
            return 100.0;
        }
        (100.0 * self.done as f64 / self.planned as f64).round()
    }

    fn update(&self, status: CrawlStatus) -> ProgressUpdate {
        ProgressUpdate {
            status,
            progress: self.progress(),
            pages_crawled: self.pages_crawled,
            articles_found: self.articles_found,
            errors: self.errors,
        }
    }
}

enum RunOutcome {
    Completed(RunCounters),
    Stopped,
}

impl TaskEngine {
    pub fn new(parts: EngineParts, config: EngineConfig) -> Self {
        let limits = ConcurrencyLimits::new(config.global_max_fetches);
        Self {
            inner: Arc::new(EngineInner {
                parts,
                config,
                limits,
                running: AsyncMutex::new(HashMap::new()),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// See [`submit_task`].
    pub async fn submit(&self, request: SubmitRequest) -> Result<CrawlTask> {
        submit_task(
            self.inner.parts.sources.as_ref(),
            self.inner.parts.tasks.as_ref(),
            request,
        )
        .await
    }

    /// Move a `pending` task to `running` and crawl it in the background.
    ///
    /// Returns the task as stored after the transition; does not wait for the
    /// crawl. A task whose source was disabled since submission is failed
    /// instead and [`IngestError::SourceDisabled`] is returned.
    pub async fn start(&self, task_id: &str) -> Result<CrawlTask> {
        let inner = &self.inner;
        let mut running = inner.running.lock().await;
        if inner.shutdown.is_cancelled() {
            return Err(IngestError::ShuttingDown);
        }

        let task = self.get_status(task_id).await?;
        if running.contains_key(task_id) || task.status != CrawlStatus::Pending {
            return Err(IngestError::InvalidTransition {
                task_id: task_id.to_string(),
                from: task.status,
                to: CrawlStatus::Running,
            });
        }

        let source = inner
            .parts
            .sources
            .get_source(task.source_id)
            .await?
            .ok_or(IngestError::SourceNotFound(task.source_id))?;
        if !source.enabled {
            let err = IngestError::SourceDisabled(source.id);
            inner
                .parts
                .tasks
                .update_status(task_id, CrawlStatus::Failed, Some(&err.to_string()))
                .await?;
            return Err(err);
        }

        let applied = inner
            .parts
            .tasks
            .update_status(task_id, CrawlStatus::Running, None)
            .await?;
        let task = self.get_status(task_id).await?;
        if !applied {
            return Err(IngestError::InvalidTransition {
                task_id: task_id.to_string(),
                from: task.status,
                to: CrawlStatus::Running,
            });
        }

        let token = inner.shutdown.child_token();
        let stop_reason: StopReason = Arc::new(Mutex::new(None));
        let (writer, writer_join) = StatusWriter::new(
            task_id,
            Arc::clone(&inner.parts.tasks),
            token.clone(),
            Arc::clone(&stop_reason),
        )
        .spawn();
        let handle = RunningTask {
            token,
            stop_reason,
            writer,
            finished: CancellationToken::new(),
        };
        running.insert(task_id.to_string(), handle.clone());
        drop(running);

        info!(task_id, source_code = %source.code, mode = %task.mode, "Task started");
        let engine = self.clone();
        let key = task_id.to_string();
        let span = info_span!("crawl", task_id, source_code = %source.code);
        let run_task = task.clone();
        tokio::spawn(
            async move {
                engine.run(run_task, source, &handle).await;
                engine.inner.running.lock().await.remove(&key);
                let RunningTask {
                    writer, finished, ..
                } = handle;
                drop(writer);
                let _ = writer_join.await;
                finished.cancel();
            }
            .instrument(span),
        );
        Ok(task)
    }

    /// Ask a task to stop, recording `reason` as its error message.
    ///
    /// A running task observes the request at its next iteration boundary;
    /// once this returns, no write other than the final `stopped` one is made
    /// for it. A pending task is stopped directly. Terminal tasks are returned
    /// unchanged.
    pub async fn request_stop(&self, task_id: &str, reason: &str) -> Result<CrawlTask> {
        let running = self.inner.running.lock().await;
        if let Some(handle) = running.get(task_id) {
            *handle
                .stop_reason
                .lock()
                .unwrap_or_else(|e| e.into_inner()) = Some(reason.to_string());
            handle.token.cancel();
            handle.writer.send(StatusCommand::Stop).await;
        } else {
            stop_task(self.inner.parts.tasks.as_ref(), task_id, reason).await?;
        }
        drop(running);

        info!(task_id, reason, "Stop requested");
        self.get_status(task_id).await
    }

    /// Current stored snapshot of a task.
    pub async fn get_status(&self, task_id: &str) -> Result<CrawlTask> {
        self.inner
            .parts
            .tasks
            .get_task(task_id)
            .await?
            .ok_or_else(|| IngestError::NotFound(task_id.to_string()))
    }

    pub async fn list_tasks(&self, filter: &TaskFilter) -> Result<Vec<CrawlTask>> {
        self.inner.parts.tasks.list_tasks(filter).await
    }

    /// Start up to `limit` pending tasks, oldest first. Returns how many started.
    pub async fn resume_pending(&self, limit: i64) -> Result<usize> {
        let filter = TaskFilter {
            status: Some(CrawlStatus::Pending),
            limit,
            ..TaskFilter::default()
        };
        let mut pending = self.list_tasks(&filter).await?;
        pending.reverse();

        let mut started = 0;
        for task in pending {
            match self.start(&task.task_id).await {
                Ok(_) => started += 1,
                Err(IngestError::ShuttingDown) => break,
                Err(e) => warn!(task_id = %task.task_id, error = %e, "Could not start pending task"),
            }
        }
        Ok(started)
    }

    /// Fail `running` rows this engine is not running: their run died, or
    /// its final write never reached the store. Serve calls this once at
    /// startup, while no other engine runs tasks.
    pub async fn fail_orphaned(&self) -> Result<usize> {
        let filter = TaskFilter {
            status: Some(CrawlStatus::Running),
            limit: i64::MAX,
            ..TaskFilter::default()
        };
        let candidates = self.list_tasks(&filter).await?;
        let running = self.inner.running.lock().await;
        let mut failed = 0;
        for task in candidates {
            if running.contains_key(&task.task_id) {
                continue;
            }
            let applied = self
                .inner
                .parts
                .tasks
                .update_status(&task.task_id, CrawlStatus::Failed, Some(ORPHANED_REASON))
                .await?;
            if applied {
                warn!(task_id = %task.task_id, "Orphaned running task marked failed");
                failed += 1;
            }
        }
        Ok(failed)
    }

    /// Submit a full crawl for every enabled source whose crawl interval has
    /// elapsed and which has no pending or running task.
    pub async fn schedule_due(&self, now: DateTime<Utc>) -> Result<Vec<CrawlTask>> {
        let parts = &self.inner.parts;
        let mut submitted = Vec::new();
        for source in parts.sources.list_sources().await? {
            if !source.enabled || !is_due(&source, now) {
                continue;
            }
            if self.has_active_task(source.id).await? {
                debug!(source_code = %source.code, "Source already has an active task");
                continue;
            }
            let request = SubmitRequest {
                source_id: source.id,
                mode: CrawlMode::Full,
                since: None,
                max_pages: None,
            };
            submitted.push(self.submit(request).await?);
        }
        Ok(submitted)
    }

    async fn has_active_task(&self, source_id: i64) -> Result<bool> {
        for status in [CrawlStatus::Pending, CrawlStatus::Running] {
            let filter = TaskFilter {
                source_id: Some(source_id),
                status: Some(status),
                limit: 1,
            };
            if !self.list_tasks(&filter).await?.is_empty() {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Wait until the task's background run, including its final write, is
    /// over. Returns immediately for tasks this engine is not running.
    pub async fn wait(&self, task_id: &str) -> Result<CrawlTask> {
        let finished = self
            .inner
            .running
            .lock()
            .await
            .get(task_id)
            .map(|handle| handle.finished.clone());
        if let Some(finished) = finished {
            finished.cancelled().await;
        }
        self.get_status(task_id).await
    }

    /// Refuse new starts, stop every running task and wait for them to end.
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        let finished: Vec<CancellationToken> = self
            .inner
            .running
            .lock()
            .await
            .values()
            .map(|handle| handle.finished.clone())
            .collect();
        info!(running = finished.len(), "Engine shutting down");
        for token in finished {
            token.cancelled().await;
        }
    }

    async fn run(&self, task: CrawlTask, source: NewsSource, handle: &RunningTask) {
        let writer = &handle.writer;
        match self.crawl(&task, &source, handle).await {
            Ok(RunOutcome::Completed(counters)) => {
                if writer.progress(counters.update(CrawlStatus::Completed)).await {
                    info!(
                        pages_crawled = counters.pages_crawled,
                        articles_found = counters.articles_found,
                        errors = counters.errors,
                        "Task completed"
                    );
                }
            }
            Ok(RunOutcome::Stopped) => {
                writer.send(StatusCommand::Stop).await;
            }
            Err(e) => {
                error!(error = %e, "Task failed");
                writer
                    .send(StatusCommand::Status {
                        status: CrawlStatus::Failed,
                        message: Some(e.to_string()),
                    })
                    .await;
            }
        }

        let parts = &self.inner.parts;
        match parts.tasks.get_task(&task.task_id).await {
            Ok(Some(stored)) => {
                if let Err(e) = parts.sources.record_crawl(source.id, stored.status).await {
                    warn!(error = %e, "Could not record crawl on source");
                }
            }
            Ok(None) => {}
            Err(e) => warn!(error = %e, "Could not read final task state"),
        }
    }

    async fn crawl(
        &self,
        task: &CrawlTask,
        source: &NewsSource,
        handle: &RunningTask,
    ) -> Result<RunOutcome> {
        let token = &handle.token;
        let config = &self.inner.config;

        let Some(index) = self.fetch(source, &source.base_url, token).await? else {
            return Ok(RunOutcome::Stopped);
        };
        let links = discover_article_links(&source.base_url, &index.body)?;
        let mut planned = if links.is_empty() {
            vec![source.base_url.clone()]
        } else {
            links
        };
        if let (CrawlMode::Incremental, Some(since)) = (task.mode, task.since) {
            planned = self.unseen_since(planned, since).await?;
        }
        let budget = task.max_pages.unwrap_or(config.default_max_pages).max(1) as usize;
        planned.truncate(budget);
        debug!(planned = planned.len(), "Pages planned");

        let mut counters = RunCounters {
            planned: planned.len(),
            ..RunCounters::default()
        };
        let mut prefetched = Some(index);

        for url in &planned {
            if token.is_cancelled() {
                return Ok(RunOutcome::Stopped);
            }
            let current = self.ensure_enabled(source.id).await?;

            let reuse = if *url == source.base_url {
                prefetched.take()
            } else {
                None
            };
            let page = match reuse {
                Some(page) => Ok(page),
                None => match self.fetch(&current, url, token).await {
                    Ok(Some(page)) => Ok(page),
                    Ok(None) => return Ok(RunOutcome::Stopped),
                    Err(e) => Err(e),
                },
            };

            match page {
                Ok(page) => {
                    if token.is_cancelled() {
                        return Ok(RunOutcome::Stopped);
                    }
                    counters.pages_crawled += 1;
                    match self.emit(task, source, &page).await {
                        Ok(()) if (200..300).contains(&page.status) => counters.articles_found += 1,
                        Ok(()) => debug!(url = %page.url, status = page.status, "Non-success page emitted"),
                        Err(e) => {
                            counters.errors += 1;
                            warn!(url = %page.url, error = %e, "Raw event not published");
                        }
                    }
                }
                Err(e) => {
                    counters.errors += 1;
                    warn!(url = %url, error = %e, "Page fetch failed; skipping");
                }
            }

            counters.done += 1;
            if !handle.writer.progress(counters.update(CrawlStatus::Running)).await {
                return Ok(RunOutcome::Stopped);
            }
        }

        if counters.planned > 0 && counters.pages_crawled == 0 {
            return Err(IngestError::Fetch {
                url: source.base_url.clone(),
                reason: format!("all {} planned pages failed", counters.planned),
            });
        }
        Ok(RunOutcome::Completed(counters))
    }

    /// Fetch `url` under the concurrency limits. `None` when cancelled while
    /// waiting for a permit.
    async fn fetch(
        &self,
        source: &NewsSource,
        url: &str,
        token: &CancellationToken,
    ) -> Result<Option<FetchedPage>> {
        let Some(_permit) = self.inner.limits.acquire(source, token).await else {
            return Ok(None);
        };
        let config = &self.inner.config;
        let fetcher = self.inner.parts.fetcher.as_ref();
        let page = config
            .fetch_backoff
            .retry("fetch page", || with_timeout(config.fetch_timeout, fetcher.fetch(url)))
            .await?;
        Ok(Some(page))
    }

    async fn emit(&self, task: &CrawlTask, source: &NewsSource, page: &FetchedPage) -> Result<()> {
        let config = &self.inner.config;
        let event = RawFetchEvent {
            task_id: task.task_id.clone(),
            source_id: source.id,
            source_code: source.code.clone(),
            url: page.url.clone(),
            status_code: page.status,
            body_snippet: bounded_snippet(&page.body, config.snippet_bytes),
        };
        let publisher = self.inner.parts.publisher.as_ref();
        config
            .fetch_backoff
            .retry("publish raw event", || {
                publish_json(publisher, &config.topic_raw, &event)
            })
            .await
    }

    /// The source's current row, or an error once it is disabled or gone.
    async fn ensure_enabled(&self, source_id: i64) -> Result<NewsSource> {
        let sources = self.inner.parts.sources.as_ref();
        let current = self
            .inner
            .config
            .fetch_backoff
            .retry("read source", || sources.get_source(source_id))
            .await?;
        match current {
            Some(source) if source.enabled => Ok(source),
            _ => Err(IngestError::SourceDisabled(source_id)),
        }
    }

    async fn unseen_since(&self, urls: Vec<String>, since: DateTime<Utc>) -> Result<Vec<String>> {
        let canonical = self.inner.parts.canonical.as_ref();
        let backoff = &self.inner.config.fetch_backoff;
        let mut unseen = Vec::with_capacity(urls.len());
        for url in urls {
            let seen = backoff
                .retry("check stored url", || canonical.has_url_since(&url, since))
                .await?;
            if seen {
                debug!(url = %url, "Already stored since bound; skipping");
            } else {
                unseen.push(url);
            }
        }
        Ok(unseen)
    }
}

fn is_due(source: &NewsSource, now: DateTime<Utc>) -> bool {
    let interval = chrono::Duration::minutes(i64::from(source.crawl_interval_minutes.max(1)));
    source
        .last_crawl_at
        .is_none_or(|last| last + interval <= now)
}
