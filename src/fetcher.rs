//! Page fetching and article link discovery.
//!
//! A crawl task fetches its source's index page first, discovers article links
//! on it, then fetches those links one per iteration. Fetching sits behind
//! [`PageFetcher`] so the engine can be driven by scripted pages in tests.

use std::time::Duration;

use async_trait::async_trait;
use itertools::Itertools;
use scraper::{Html, Selector};
use tracing::{debug, instrument};
use url::Url;

use crate::error::{IngestError, Result};

/// A fetched HTTP response.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchedPage {
    pub url: String,
    pub status: u16,
    pub body: String,
}

/// Fetches one page.
#[async_trait]
pub trait PageFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<FetchedPage>;
}

/// [`PageFetcher`] over `reqwest`.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl PageFetcher for HttpFetcher {
    #[instrument(level = "debug", skip(self))]
    async fn fetch(&self, url: &str) -> Result<FetchedPage> {
        let response = self.client.get(url).send().await?;
        let status = response.status();
        // 5xx is worth another attempt; 4xx pages are passed on as fetched
        if status.is_server_error() {
            return Err(IngestError::Fetch {
                url: url.to_string(),
                reason: format!("server responded {status}"),
            });
        }
        let body = response.text().await?;
        debug!(status = status.as_u16(), bytes = body.len(), "Fetched page");
        Ok(FetchedPage {
            url: url.to_string(),
            status: status.as_u16(),
            body,
        })
    }
}

/// Article links on an index page.
///
/// Every `a[href]` is resolved against `base_url`; links to other hosts, to
/// non-HTTP schemes and back to the index itself are dropped. Fragments are
/// stripped and duplicates removed, keeping document order.
pub fn discover_article_links(base_url: &str, html: &str) -> Result<Vec<String>> {
    let base = Url::parse(base_url).map_err(|e| IngestError::Fetch {
        url: base_url.to_string(),
        reason: format!("invalid base url: {e}"),
    })?;
    let anchor = Selector::parse("a[href]").map_err(|e| IngestError::Selector {
        selector: "a[href]".to_string(),
        reason: e.to_string(),
    })?;

    let document = Html::parse_document(html);
    let links = document
        .select(&anchor)
        .filter_map(|element| element.value().attr("href"))
        .filter_map(|href| base.join(href.trim()).ok())
        .filter(|url| matches!(url.scheme(), "http" | "https"))
        .filter(|url| url.host_str() == base.host_str())
        .map(|mut url| {
            url.set_fragment(None);
            url
        })
        .filter(|url| url.as_str() != base.as_str())
        .map(|url| url.to_string())
        .unique()
        .collect();
    Ok(links)
}
