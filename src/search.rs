//! Search index replica of the canonical store.
//!
//! Documents are addressed by fingerprint (the row id only for legacy rows
//! without one), so indexing the same row twice overwrites one document. The
//! index is derived data: it is never read back into the canonical store.
//!
//! [`ElasticIndex`] talks to Elasticsearch's REST API directly:
//!
//! | Operation | Endpoint |
//! |-----------|----------|
//! | [`SearchIndex::bulk_index`] | `POST /_bulk` (NDJSON `index` actions) |
//! | [`SearchIndex::search`] | `POST /{index}/_search` (`multi_match` on `title^2`, `content`) |
//! | [`ElasticIndex::ensure_index`] | `HEAD` / `PUT /{index}` |

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, info, instrument, warn};

use crate::error::{IngestError, Result};
use crate::models::CanonicalRecord;
use crate::utils::truncate_for_log;

/// Default page size of a search.
pub const DEFAULT_SEARCH_SIZE: usize = 20;

/// One indexed article.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchDocument {
    pub id: String,
    /// Empty for legacy rows without a fingerprint.
    #[serde(default)]
    pub hash: String,
    pub task_id: String,
    pub source_id: i64,
    pub source_code: String,
    pub url: String,
    pub title: String,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub publish_time: Option<DateTime<Utc>>,
    pub crawl_time: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SearchDocument {
    pub fn from_record(record: &CanonicalRecord) -> Self {
        Self {
            id: record.id.clone(),
            hash: record.hash.clone().unwrap_or_default(),
            task_id: record.task_id.clone(),
            source_id: record.source_id,
            source_code: record.source_code.clone(),
            url: record.url.clone(),
            title: record.title.clone(),
            content: record.content.clone(),
            publish_time: record.publish_time,
            crawl_time: record.crawl_time,
            updated_at: record.updated_at,
        }
    }

    /// The index `_id`: the hash, or the row id when there is none.
    pub fn document_id(&self) -> &str {
        if self.hash.is_empty() {
            &self.id
        } else {
            &self.hash
        }
    }
}

/// A document the index refused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RejectedDoc {
    pub id: String,
    pub reason: String,
}

/// Per-document result of a bulk request that reached the index.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BulkOutcome {
    pub indexed: usize,
    pub rejected: Vec<RejectedDoc>,
}

/// Full-text query over title and content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchQuery {
    pub query: String,
    pub source_code: Option<String>,
    pub from: usize,
    pub size: usize,
}

impl SearchQuery {
    /// A first-page query. Blank queries are refused.
    pub fn new(query: &str) -> Result<Self> {
        let query = query.trim();
        if query.is_empty() {
            return Err(IngestError::InvalidRequest("query is required".to_string()));
        }
        Ok(Self {
            query: query.to_string(),
            source_code: None,
            from: 0,
            size: DEFAULT_SEARCH_SIZE,
        })
    }

    fn to_body(&self) -> Value {
        let filter: Vec<Value> = self
            .source_code
            .iter()
            .map(|code| json!({ "term": { "source_code": code } }))
            .collect();
        json!({
            "from": self.from,
            "size": self.size,
            "track_total_hits": true,
            "query": {
                "bool": {
                    "must": [{
                        "multi_match": {
                            "query": self.query,
                            "fields": ["title^2", "content"]
                        }
                    }],
                    "filter": filter
                }
            }
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SearchHit {
    pub id: String,
    pub score: Option<f64>,
    pub document: SearchDocument,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SearchResults {
    pub total: u64,
    pub hits: Vec<SearchHit>,
}

#[async_trait]
pub trait SearchIndex: Send + Sync {
    /// Index `docs` in one request.
    ///
    /// `Err` means the outcome is unknown (transport failure, error status or
    /// unreadable response) and the whole batch should be sent again.
    /// Documents refused individually are listed in [`BulkOutcome::rejected`].
    async fn bulk_index(&self, docs: &[SearchDocument]) -> Result<BulkOutcome>;

    async fn search(&self, query: &SearchQuery) -> Result<SearchResults>;
}

/// Connection settings for [`ElasticIndex`].
#[derive(Debug, Clone)]
pub struct ElasticConfig {
    pub address: String,
    pub username: String,
    pub password: String,
    pub index: String,
    pub timeout: Duration,
}

/// [`SearchIndex`] over the Elasticsearch REST API.
#[derive(Debug, Clone)]
pub struct ElasticIndex {
    client: reqwest::Client,
    config: ElasticConfig,
}

#[derive(Debug, Deserialize)]
struct BulkResponse {
    #[serde(default)]
    items: Vec<HashMap<String, BulkItem>>,
}

#[derive(Debug, Deserialize)]
struct BulkItem {
    #[serde(rename = "_id", default)]
    id: String,
    #[serde(default)]
    status: u16,
    #[serde(default)]
    error: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    hits: HitsEnvelope,
}

#[derive(Debug, Deserialize)]
struct HitsEnvelope {
    #[serde(default)]
    total: Option<TotalHits>,
    #[serde(default)]
    hits: Vec<RawHit>,
}

#[derive(Debug, Deserialize)]
struct TotalHits {
    value: u64,
}

#[derive(Debug, Deserialize)]
struct RawHit {
    #[serde(rename = "_id")]
    id: String,
    #[serde(rename = "_score", default)]
    score: Option<f64>,
    #[serde(rename = "_source")]
    source: SearchDocument,
}

fn bulk_body(index: &str, docs: &[SearchDocument]) -> Result<String> {
    let mut body = String::new();
    for doc in docs {
        let action = json!({ "index": { "_index": index, "_id": doc.document_id() } });
        body.push_str(&serde_json::to_string(&action)?);
        body.push('\n');
        body.push_str(&serde_json::to_string(doc)?);
        body.push('\n');
    }
    Ok(body)
}

fn bulk_outcome(response: BulkResponse) -> BulkOutcome {
    let mut outcome = BulkOutcome::default();
    for item in response.items.into_iter().flat_map(|entry| entry.into_values()) {
        match item.error {
            Some(error) => outcome.rejected.push(RejectedDoc {
                id: item.id,
                reason: error
                    .get("reason")
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .unwrap_or_else(|| error.to_string()),
            }),
            None if item.status >= 300 => outcome.rejected.push(RejectedDoc {
                id: item.id,
                reason: format!("status {}", item.status),
            }),
            None => outcome.indexed += 1,
        }
    }
    outcome
}

impl ElasticIndex {
    pub fn new(config: ElasticConfig) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(config.timeout).build()?;
        Ok(Self { client, config })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.config.address.trim_end_matches('/'), path)
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let builder = self.client.request(method, self.url(path));
        if self.config.username.is_empty() {
            builder
        } else {
            builder.basic_auth(&self.config.username, Some(&self.config.password))
        }
    }

    /// Create the index with keyword mappings for exact-match fields unless it
    /// already exists.
    pub async fn ensure_index(&self) -> Result<()> {
        let index = &self.config.index;
        let exists = self.request(reqwest::Method::HEAD, index).send().await?;
        if exists.status().is_success() {
            debug!(index = %index, "Search index exists");
            return Ok(());
        }

        let mappings = json!({
            "mappings": {
                "properties": {
                    "id": { "type": "keyword" },
                    "hash": { "type": "keyword" },
                    "task_id": { "type": "keyword" },
                    "source_id": { "type": "long" },
                    "source_code": { "type": "keyword" },
                    "url": { "type": "keyword" },
                    "title": { "type": "text" },
                    "content": { "type": "text" },
                    "publish_time": { "type": "date" },
                    "crawl_time": { "type": "date" },
                    "updated_at": { "type": "date" }
                }
            }
        });
        let response = self
            .request(reqwest::Method::PUT, index)
            .json(&mappings)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(IngestError::Search(format!(
                "create index {index}: status {status}: {}",
                truncate_for_log(&body, 300)
            )));
        }
        info!(index = %index, "Search index created");
        Ok(())
    }
}

#[async_trait]
impl SearchIndex for ElasticIndex {
    #[instrument(level = "debug", skip_all, fields(docs = docs.len()))]
    async fn bulk_index(&self, docs: &[SearchDocument]) -> Result<BulkOutcome> {
        if docs.is_empty() {
            return Ok(BulkOutcome::default());
        }
        let body = bulk_body(&self.config.index, docs)?;
        let response = self
            .request(reqwest::Method::POST, "_bulk")
            .header(reqwest::header::CONTENT_TYPE, "application/x-ndjson")
            .body(body)
            .send()
            .await?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| IngestError::Search(format!("reading bulk response: {e}")))?;
        if !status.is_success() {
            return Err(IngestError::Search(format!(
                "bulk request returned {status}: {}",
                truncate_for_log(&text, 300)
            )));
        }
        let parsed: BulkResponse = serde_json::from_str(&text)
            .map_err(|e| IngestError::Search(format!("unreadable bulk response: {e}")))?;

        let outcome = bulk_outcome(parsed);
        if !outcome.rejected.is_empty() {
            warn!(
                rejected = outcome.rejected.len(),
                indexed = outcome.indexed,
                "Bulk request partially rejected"
            );
        }
        Ok(outcome)
    }

    #[instrument(level = "debug", skip(self))]
    async fn search(&self, query: &SearchQuery) -> Result<SearchResults> {
        let path = format!("{}/_search", self.config.index);
        let response = self
            .request(reqwest::Method::POST, &path)
            .json(&query.to_body())
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(IngestError::Search(format!(
                "search returned {status}: {}",
                truncate_for_log(&body, 300)
            )));
        }
        let parsed: SearchResponse = response.json().await?;
        Ok(SearchResults {
            total: parsed
                .hits
                .total
                .map(|t| t.value)
                .unwrap_or(parsed.hits.hits.len() as u64),
            hits: parsed
                .hits
                .hits
                .into_iter()
                .map(|hit| SearchHit {
                    id: hit.id,
                    score: hit.score,
                    document: hit.source,
                })
                .collect(),
        })
    }
}
