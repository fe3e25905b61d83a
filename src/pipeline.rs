//! Topic consumers between the task engine and the canonical store.
//!
//! ```text
//! raw ──► ParseStage ──► parsed ──► SinkStage ──► canonical store
//!  └────► TapStage (logs only)
//! ```
//!
//! Each consumer implements [`Stage`] and is driven by [`run_stage`]. A
//! message is acknowledged once its stage returns, unless the stage failed
//! with a transient error; then it is handed back for redelivery. Malformed
//! messages are logged and acknowledged. Delivery may repeat, so every stage
//! is idempotent: parsing is pure and the sink upserts by fingerprint.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::broker::{Settlement, TopicPublisher, TopicSubscriber, publish_json};
use crate::error::Result;
use crate::fingerprint::fingerprint;
use crate::models::{Article, ParsedRecord, RawFetchEvent};
use crate::retry::Backoff;
use crate::scrapers::ContentRouter;
use crate::store::{CanonicalStore, UpsertOutcome};
use crate::utils::truncate_for_log;

/// What a stage did with one message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Done,
    /// Deliberately ignored, e.g. a raw event for an error page.
    Skipped,
}

/// Per-run message counts of a stage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StageStats {
    pub received: u64,
    pub handled: u64,
    pub skipped: u64,
    /// Messages rejected as malformed or unsupported.
    pub rejected: u64,
    /// Messages handed back for redelivery after transient failures
    /// outlasted their retries.
    pub failed: u64,
}

/// A consumer of one topic.
#[async_trait]
pub trait Stage: Send + Sync {
    fn name(&self) -> &'static str;

    async fn handle(&self, payload: &[u8]) -> Result<Disposition>;
}

/// Feed messages from `subscriber` to `stage` until `shutdown` fires or the
/// subscription closes.
pub async fn run_stage(
    stage: &dyn Stage,
    subscriber: &mut dyn TopicSubscriber,
    shutdown: &CancellationToken,
) -> StageStats {
    let name = stage.name();
    let mut stats = StageStats::default();
    info!(stage = name, "Stage consuming");

    loop {
        let delivery = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            delivery = subscriber.next_message() => match delivery {
                Some(delivery) => delivery,
                None => break,
            },
        };
        stats.received += 1;

        let settlement = match stage.handle(&delivery.payload).await {
            Ok(Disposition::Done) => {
                stats.handled += 1;
                Settlement::Ack
            }
            Ok(Disposition::Skipped) => {
                stats.skipped += 1;
                Settlement::Ack
            }
            Err(e) if e.is_transient() => {
                stats.failed += 1;
                error!(stage = name, topic = %delivery.topic, error = %e, "Handling failed; message will be redelivered");
                Settlement::Retry
            }
            Err(e) => {
                stats.rejected += 1;
                warn!(
                    stage = name,
                    topic = %delivery.topic,
                    error = %e,
                    payload = %truncate_for_log(&String::from_utf8_lossy(&delivery.payload), 200),
                    "Skipping message"
                );
                Settlement::Ack
            }
        };
        if let Err(e) = subscriber.settle(&delivery, settlement).await {
            warn!(stage = name, topic = %delivery.topic, error = %e, "Could not settle message; it will be redelivered");
        }
    }

    info!(
        stage = name,
        received = stats.received,
        handled = stats.handled,
        skipped = stats.skipped,
        rejected = stats.rejected,
        failed = stats.failed,
        "Stage stopped"
    );
    stats
}

/// Turns raw fetch events into fingerprinted [`ParsedRecord`]s on `parsed`.
pub struct ParseStage {
    router: Arc<ContentRouter>,
    publisher: Arc<dyn TopicPublisher>,
    topic_parsed: String,
    backoff: Backoff,
}

impl ParseStage {
    pub fn new(
        router: Arc<ContentRouter>,
        publisher: Arc<dyn TopicPublisher>,
        topic_parsed: impl Into<String>,
        backoff: Backoff,
    ) -> Self {
        Self {
            router,
            publisher,
            topic_parsed: topic_parsed.into(),
            backoff,
        }
    }

    /// Parse one raw event and publish the result. `None` for events that
    /// carry an error page.
    #[instrument(level = "debug", skip_all)]
    pub async fn process(&self, payload: &[u8]) -> Result<Option<ParsedRecord>> {
        let raw: RawFetchEvent = serde_json::from_slice(payload)?;
        if !(200..300).contains(&raw.status_code) {
            debug!(url = %raw.url, status = raw.status_code, "Ignoring error page");
            return Ok(None);
        }

        let article = self.router.parse(&raw.source_code, &raw.body_snippet)?;
        let record = ParsedRecord::from_article(&raw, article, Utc::now());

        let publisher = self.publisher.as_ref();
        self.backoff
            .retry("publish parsed record", || {
                publish_json(publisher, &self.topic_parsed, &record)
            })
            .await?;
        info!(
            task_id = %record.task_id,
            url = %record.url,
            hash = %record.hash,
            title = %truncate_for_log(&record.title, 80),
            "Parsed record published"
        );
        Ok(Some(record))
    }
}

#[async_trait]
impl Stage for ParseStage {
    fn name(&self) -> &'static str {
        "parse"
    }

    async fn handle(&self, payload: &[u8]) -> Result<Disposition> {
        Ok(match self.process(payload).await? {
            Some(_) => Disposition::Done,
            None => Disposition::Skipped,
        })
    }
}

/// Upserts parsed records into the canonical store.
pub struct SinkStage {
    store: Arc<dyn CanonicalStore>,
    backoff: Backoff,
}

impl SinkStage {
    pub fn new(store: Arc<dyn CanonicalStore>, backoff: Backoff) -> Self {
        Self { store, backoff }
    }

    #[instrument(level = "debug", skip_all)]
    pub async fn process(&self, payload: &[u8]) -> Result<UpsertOutcome> {
        let mut record: ParsedRecord = serde_json::from_slice(payload)?;
        if record.hash.is_empty() {
            record.hash = fingerprint(&record.url, &record.title, record.publish_time);
        }

        let outcome = self
            .backoff
            .retry("upsert canonical record", || self.store.upsert(&record))
            .await?;
        info!(url = %record.url, hash = %record.hash, ?outcome, "Canonical record stored");
        Ok(outcome)
    }
}

#[async_trait]
impl Stage for SinkStage {
    fn name(&self) -> &'static str {
        "sink"
    }

    async fn handle(&self, payload: &[u8]) -> Result<Disposition> {
        self.process(payload).await?;
        Ok(Disposition::Done)
    }
}

/// Logs every raw event and, for sources with a parser, what it extracts.
pub struct TapStage {
    router: Arc<ContentRouter>,
}

impl TapStage {
    pub fn new(router: Arc<ContentRouter>) -> Self {
        Self { router }
    }

    pub fn process(&self, payload: &[u8]) -> Result<Option<Article>> {
        let raw: RawFetchEvent = serde_json::from_slice(payload)?;
        info!(
            task_id = %raw.task_id,
            source_code = %raw.source_code,
            url = %raw.url,
            status = raw.status_code,
            snippet_bytes = raw.body_snippet.len(),
            "Raw event"
        );
        if !self.router.supports(&raw.source_code) {
            return Ok(None);
        }
        let article = self.router.parse(&raw.source_code, &raw.body_snippet)?;
        info!(
            title = %truncate_for_log(&article.title, 80),
            publish_time = ?article.publish_time,
            content_bytes = article.content.len(),
            "Extracted"
        );
        Ok(Some(article))
    }
}

#[async_trait]
impl Stage for TapStage {
    fn name(&self) -> &'static str {
        "tap"
    }

    async fn handle(&self, payload: &[u8]) -> Result<Disposition> {
        Ok(match self.process(payload)? {
            Some(_) => Disposition::Done,
            None => Disposition::Skipped,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::testing::MemoryBroker;
    use crate::error::IngestError;
    use crate::store::memory::MemoryStore;
    use bytes::Bytes;
    use std::time::Duration;

    const URL: &str = "http://military.people.com.cn/n1/2024/0301/c1011-1.html";

    fn quick() -> Backoff {
        Backoff::new(2, Duration::from_millis(1)).with_jitter(Duration::ZERO)
    }

    fn people_page(body: &str) -> String {
        format!(
            r#"<html><body><h1>演训场上的新战法</h1>
            <div class="rm_txt_time">2024年03月01日 10:30</div>
            <div id="rwb_zw"><p>{body}</p></div></body></html>"#
        )
    }

    fn raw(source_code: &str, url: &str, status_code: u16, body: &str) -> Vec<u8> {
        serde_json::to_vec(&RawFetchEvent {
            task_id: "task-1".to_string(),
            source_id: 1,
            source_code: source_code.to_string(),
            url: url.to_string(),
            status_code,
            body_snippet: body.to_string(),
        })
        .unwrap()
    }

    fn parse_stage(broker: &Arc<MemoryBroker>) -> ParseStage {
        let router = Arc::new(ContentRouter::with_builtin_sources().unwrap());
        ParseStage::new(router, broker.clone(), "news.parsed", quick())
    }

    #[tokio::test]
    async fn test_same_article_fetched_twice_collapses_to_one_row() {
        let broker = Arc::new(MemoryBroker::new());
        let parse = parse_stage(&broker);
        let store = Arc::new(MemoryStore::new());
        let sink = SinkStage::new(store.clone(), quick());

        let first = parse
            .process(&raw("people_military", URL, 200, &people_page("第一次抓取")))
            .await
            .unwrap()
            .unwrap();
        let second = parse
            .process(&raw("people_military", URL, 200, &people_page("第二次抓取")))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.hash, second.hash);

        let published = broker.published("news.parsed");
        assert_eq!(sink.process(&published[0].payload).await.unwrap(), UpsertOutcome::Inserted);
        assert_eq!(sink.process(&published[1].payload).await.unwrap(), UpsertOutcome::Updated);

        let rows = store.news();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].content, "第二次抓取");
        assert_eq!(rows[0].id, first.id);
        assert_eq!(rows[0].hash.as_deref(), Some(first.hash.as_str()));
    }

    #[tokio::test]
    async fn test_repeated_upsert_is_idempotent() {
        let broker = Arc::new(MemoryBroker::new());
        let parse = parse_stage(&broker);
        let store = Arc::new(MemoryStore::new());
        let sink = SinkStage::new(store.clone(), quick());

        parse
            .process(&raw("people_military", URL, 200, &people_page("正文")))
            .await
            .unwrap();
        let payload = broker.published("news.parsed")[0].payload.clone();

        sink.process(&payload).await.unwrap();
        let once = store.news();
        sink.process(&payload).await.unwrap();
        let twice = store.news();

        assert_eq!(twice.len(), 1);
        let mut normalized = twice[0].clone();
        normalized.updated_at = once[0].updated_at;
        assert_eq!(normalized, once[0]);
        assert!(twice[0].updated_at > once[0].updated_at);
    }

    #[tokio::test]
    async fn test_unknown_source_is_skipped_and_next_event_processed() {
        let broker = Arc::new(MemoryBroker::new());
        let mut subscription = broker.subscribe("news.raw", "parse");
        broker
            .publish("news.raw", raw("unknown_site", "http://x.example/1", 200, "<html></html>").into())
            .await
            .unwrap();
        broker
            .publish("news.raw", raw("people_military", URL, 200, &people_page("正文")).into())
            .await
            .unwrap();

        let stage = parse_stage(&broker);
        let shutdown = CancellationToken::new();
        let token = shutdown.clone();
        let consumer = tokio::spawn(async move { run_stage(&stage, &mut subscription, &token).await });

        tokio::time::timeout(Duration::from_secs(5), async {
            while broker.published("news.parsed").is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        shutdown.cancel();
        let stats = consumer.await.unwrap();

        assert_eq!(stats.received, 2);
        assert_eq!(stats.rejected, 1);
        assert_eq!(stats.handled, 1);
        let records: Vec<ParsedRecord> = broker.decoded("news.parsed");
        assert_eq!(records[0].url, URL);
    }

    async fn wait_until(check: impl Fn() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !check() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_records_published_before_the_sink_subscribes_are_stored() {
        let broker = Arc::new(MemoryBroker::new());
        parse_stage(&broker)
            .process(&raw("people_military", URL, 200, &people_page("正文")))
            .await
            .unwrap();

        let store = Arc::new(MemoryStore::new());
        let sink = SinkStage::new(store.clone(), quick());
        let mut subscription = broker.subscribe("news.parsed", "sink");
        let shutdown = CancellationToken::new();
        let token = shutdown.clone();
        let consumer = tokio::spawn(async move { run_stage(&sink, &mut subscription, &token).await });

        wait_until(|| store.news().len() == 1).await;
        shutdown.cancel();
        let stats = consumer.await.unwrap();

        assert_eq!(stats.handled, 1);
        assert_eq!(store.news()[0].url, URL);
        assert_eq!(broker.acked("news.parsed", "sink"), 1);
    }

    #[tokio::test]
    async fn test_transient_failure_is_redelivered_then_handled() {
        let broker = Arc::new(MemoryBroker::new());
        parse_stage(&broker)
            .process(&raw("people_military", URL, 200, &people_page("正文")))
            .await
            .unwrap();

        let store = Arc::new(MemoryStore::new());
        // first delivery exhausts the sink's retries
        store.fail_next_upserts(quick().max_retries() + 1);
        let sink = SinkStage::new(store.clone(), quick());
        let mut subscription = broker.subscribe("news.parsed", "sink");
        let shutdown = CancellationToken::new();
        let token = shutdown.clone();
        let consumer = tokio::spawn(async move { run_stage(&sink, &mut subscription, &token).await });

        wait_until(|| store.news().len() == 1).await;
        shutdown.cancel();
        let stats = consumer.await.unwrap();

        assert_eq!(stats.received, 2);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.handled, 1);
        assert_eq!(broker.acked("news.parsed", "sink"), 1);
    }

    #[tokio::test]
    async fn test_rejected_messages_are_acked() {
        let broker = Arc::new(MemoryBroker::new());
        broker.publish("news.raw", Bytes::from_static(b"{not json")).await.unwrap();
        let stage = parse_stage(&broker);
        let mut subscription = broker.subscribe("news.raw", "parse");
        let shutdown = CancellationToken::new();
        let token = shutdown.clone();
        let consumer = tokio::spawn(async move { run_stage(&stage, &mut subscription, &token).await });

        wait_until(|| broker.acked("news.raw", "parse") == 1).await;
        shutdown.cancel();
        let stats = consumer.await.unwrap();
        assert_eq!(stats.rejected, 1);
        assert_eq!(stats.received, 1);
    }

    #[tokio::test]
    async fn test_parse_reports_unsupported_source() {
        let broker = Arc::new(MemoryBroker::new());
        let result = parse_stage(&broker)
            .process(&raw("unknown_site", "http://x.example/1", 200, ""))
            .await;
        assert!(matches!(result, Err(IngestError::UnsupportedSource(code)) if code == "unknown_site"));
        assert!(broker.published("news.parsed").is_empty());
    }

    #[tokio::test]
    async fn test_error_pages_are_skipped() {
        let broker = Arc::new(MemoryBroker::new());
        let stage = parse_stage(&broker);
        let outcome = stage
            .handle(&raw("people_military", URL, 404, "<html>Not Found</html>"))
            .await
            .unwrap();
        assert_eq!(outcome, Disposition::Skipped);
        assert!(broker.published("news.parsed").is_empty());
    }

    #[tokio::test]
    async fn test_malformed_payload_is_not_transient() {
        let broker = Arc::new(MemoryBroker::new());
        let err = parse_stage(&broker).process(b"{not json").await.unwrap_err();
        assert!(matches!(err, IngestError::Decode(_)));
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn test_publish_is_retried() {
        let broker = Arc::new(MemoryBroker::new());
        broker.fail_next(2);
        let record = parse_stage(&broker)
            .process(&raw("people_military", URL, 200, &people_page("正文")))
            .await
            .unwrap();
        assert!(record.is_some());
        assert_eq!(broker.published("news.parsed").len(), 1);
    }

    #[tokio::test]
    async fn test_sink_fills_missing_hash() {
        let store = Arc::new(MemoryStore::new());
        let sink = SinkStage::new(store.clone(), quick());
        let payload = serde_json::json!({
            "id": "rec-1",
            "task_id": "task-1",
            "source_id": 1,
            "source_code": "gmw_military",
            "url": "https://junshi.gmw.cn/2024-05/06/content_1.htm",
            "title": "标题",
            "content": "正文",
            "publish_time": null,
            "crawl_time": "2024-05-06T08:00:00Z",
            "hash": ""
        });
        sink.process(&serde_json::to_vec(&payload).unwrap()).await.unwrap();

        let expected = fingerprint("https://junshi.gmw.cn/2024-05/06/content_1.htm", "标题", None);
        assert_eq!(store.news()[0].hash.as_deref(), Some(expected.as_str()));
    }

    #[tokio::test]
    async fn test_sink_retries_transient_store_errors() {
        let store = Arc::new(MemoryStore::new());
        store.fail_next_upserts(1);
        let broker = Arc::new(MemoryBroker::new());
        parse_stage(&broker)
            .process(&raw("people_military", URL, 200, &people_page("正文")))
            .await
            .unwrap();
        let sink = SinkStage::new(store.clone(), quick());
        let outcome = sink.process(&broker.published("news.parsed")[0].payload).await.unwrap();
        assert_eq!(outcome, UpsertOutcome::Inserted);
    }

    #[tokio::test]
    async fn test_tap_extracts_known_sources_only() {
        let router = Arc::new(ContentRouter::with_builtin_sources().unwrap());
        let tap = TapStage::new(router);
        let article = tap
            .process(&raw("people_military", URL, 200, &people_page("正文")))
            .unwrap()
            .unwrap();
        assert_eq!(article.title, "演训场上的新战法");
        assert!(tap.process(&raw("unknown_site", URL, 200, "")).unwrap().is_none());
    }
}
