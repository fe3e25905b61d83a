//! Typed errors shared by every stage of the ingest pipeline.
//!
//! Loops decide between retrying and skipping with [`IngestError::is_transient`]:
//! transient I/O is retried, malformed input is logged and dropped.

use std::time::Duration;

use thiserror::Error;

use crate::models::CrawlStatus;

/// Errors raised by the task engine, the pipeline stages and their stores.
#[derive(Debug, Error)]
pub enum IngestError {
    /// No source with this id exists.
    #[error("source not found: {0}")]
    SourceNotFound(i64),

    /// The source exists but is switched off.
    #[error("source {0} is disabled")]
    SourceDisabled(i64),

    /// Unknown crawl mode, or a mode used without its required bounds.
    #[error("invalid crawl mode: {0}")]
    InvalidMode(String),

    /// A submission argument other than the mode is out of range.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// No task with this id exists.
    #[error("task not found: {0}")]
    NotFound(String),

    /// The task is not in a state that allows the requested transition.
    #[error("task {task_id} cannot move from {from} to {to}")]
    InvalidTransition {
        task_id: String,
        from: CrawlStatus,
        to: CrawlStatus,
    },

    /// No parser is registered for this source code.
    #[error("unsupported source code: {0}")]
    UnsupportedSource(String),

    /// A parser rule could not be compiled.
    #[error("invalid selector {selector:?}: {reason}")]
    Selector { selector: String, reason: String },

    /// The page could not be fetched.
    #[error("fetch failed for {url}: {reason}")]
    Fetch { url: String, reason: String },

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),

    #[error("broker error: {0}")]
    Broker(String),

    #[error("search index error: {0}")]
    Search(String),

    /// A message payload could not be decoded.
    #[error("decode error: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("engine is shutting down")]
    ShuttingDown,
}

impl IngestError {
    /// Whether retrying the same operation later can succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            IngestError::Fetch { .. }
                | IngestError::Http(_)
                | IngestError::Storage(_)
                | IngestError::Broker(_)
                | IngestError::Search(_)
                | IngestError::Timeout(_)
        )
    }
}

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, IngestError>;
