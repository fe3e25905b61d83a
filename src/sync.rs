//! Incremental replication of the canonical store into the search index.
//!
//! The synchronizer owns a watermark: the greatest `updated_at` it has handed
//! to the index. Each cycle reads the next batch of rows changed after it, in
//! `updated_at` order, and sends them in one bulk request.
//!
//! * Transport failure, error status or an unreadable response: nothing
//!   advances and the same batch is read again after the error pause.
//! * Individual rejections: the watermark advances past the batch and the
//!   rejected documents go to a retry queue that rides along with later
//!   cycles. After `max_attempts` they move to the dead-letter list.
//!
//! The watermark lives in memory and starts at the epoch, so a restart
//! re-indexes everything. Documents are keyed by fingerprint, which makes
//! that safe.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::Result;
use crate::search::{SearchDocument, SearchIndex};
use crate::store::CanonicalStore;

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub batch_size: i64,
    /// Pause after a cycle that found no changed rows.
    pub idle_interval: Duration,
    /// Pause after a failed cycle.
    pub error_interval: Duration,
    /// Bulk attempts per document before it is dead-lettered.
    pub max_attempts: u32,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            batch_size: 500,
            idle_interval: Duration::from_secs(10),
            error_interval: Duration::from_secs(5),
            max_attempts: 5,
        }
    }
}

/// A document the index kept refusing.
#[derive(Debug, Clone, PartialEq)]
pub struct DeadLetter {
    pub document: SearchDocument,
    pub reason: String,
    pub attempts: u32,
}

#[derive(Debug, Clone)]
struct Queued {
    document: SearchDocument,
    attempts: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    /// No changed rows and nothing queued.
    Idle,
    Indexed {
        /// Changed rows read this cycle.
        rows: usize,
        indexed: usize,
        rejected: usize,
        dead_lettered: usize,
    },
}

pub struct Synchronizer {
    store: Arc<dyn CanonicalStore>,
    index: Arc<dyn SearchIndex>,
    config: SyncConfig,
    watermark: DateTime<Utc>,
    retry: BTreeMap<String, Queued>,
    dead_letters: Vec<DeadLetter>,
}

impl Synchronizer {
    pub fn new(store: Arc<dyn CanonicalStore>, index: Arc<dyn SearchIndex>, config: SyncConfig) -> Self {
        Self {
            store,
            index,
            config,
            watermark: DateTime::<Utc>::UNIX_EPOCH,
            retry: BTreeMap::new(),
            dead_letters: Vec::new(),
        }
    }

    /// Start from `watermark` instead of the epoch.
    pub fn starting_at(mut self, watermark: DateTime<Utc>) -> Self {
        self.watermark = watermark;
        self
    }

    pub fn watermark(&self) -> DateTime<Utc> {
        self.watermark
    }

    pub fn queued(&self) -> usize {
        self.retry.len()
    }

    pub fn dead_letters(&self) -> &[DeadLetter] {
        &self.dead_letters
    }

    /// Run one read, index and advance step.
    ///
    /// An `Err` leaves the watermark and the retry queue untouched.
    pub async fn run_cycle(&mut self) -> Result<CycleOutcome> {
        let rows = self
            .store
            .changed_since(self.watermark, self.config.batch_size)
            .await?;
        if rows.is_empty() && self.retry.is_empty() {
            return Ok(CycleOutcome::Idle);
        }

        // A fresh read of a row supersedes its queued copy.
        let mut batch: BTreeMap<String, Queued> = self
            .retry
            .iter()
            .map(|(id, queued)| (id.clone(), queued.clone()))
            .collect();
        for row in &rows {
            let document = SearchDocument::from_record(row);
            let attempts = batch.get(row.document_id()).map_or(0, |q| q.attempts);
            batch.insert(row.document_id().to_string(), Queued { document, attempts });
        }
        let documents: Vec<SearchDocument> = batch.values().map(|q| q.document.clone()).collect();

        let outcome = self.index.bulk_index(&documents).await?;

        let mut rejected: BTreeMap<String, String> = outcome
            .rejected
            .into_iter()
            .map(|r| (r.id, r.reason))
            .collect();
        let mut dead_lettered = 0;
        let mut retry = BTreeMap::new();
        for (id, mut queued) in batch {
            let Some(reason) = rejected.remove(&id) else {
                continue;
            };
            queued.attempts += 1;
            if queued.attempts >= self.config.max_attempts {
                error!(id = %id, attempts = queued.attempts, reason = %reason, "Document dead-lettered");
                self.dead_letters.push(DeadLetter {
                    document: queued.document,
                    reason,
                    attempts: queued.attempts,
                });
                dead_lettered += 1;
            } else {
                warn!(id = %id, attempts = queued.attempts, reason = %reason, "Document rejected; queued for retry");
                retry.insert(id, queued);
            }
        }
        let rejected_count = retry.len() + dead_lettered;
        self.retry = retry;

        if let Some(last) = rows.iter().map(|row| row.updated_at).max() {
            self.watermark = self.watermark.max(last);
        }

        Ok(CycleOutcome::Indexed {
            rows: rows.len(),
            indexed: outcome.indexed,
            rejected: rejected_count,
            dead_lettered,
        })
    }

    /// Cycle until `shutdown` fires.
    pub async fn run(&mut self, shutdown: CancellationToken) {
        info!(
            batch_size = self.config.batch_size,
            watermark = %self.watermark.to_rfc3339(),
            "Search sync started"
        );
        loop {
            let result = tokio::select! {
                biased;
                _ = shutdown.cancelled() => None,
                result = self.run_cycle() => Some(result),
            };
            let Some(result) = result else { break };
            let pause = match result {
                Ok(CycleOutcome::Idle) => {
                    debug!("No changes");
                    Some(self.config.idle_interval)
                }
                Ok(CycleOutcome::Indexed { rows, indexed, rejected, dead_lettered }) => {
                    info!(
                        rows,
                        indexed,
                        rejected,
                        dead_lettered,
                        watermark = %self.watermark.to_rfc3339(),
                        "Synced batch"
                    );
                    (rows == 0).then_some(self.config.idle_interval)
                }
                Err(e) => {
                    error!(error = %e, "Sync cycle failed; batch will be retried");
                    Some(self.config.error_interval)
                }
            };
            if let Some(pause) = pause {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(pause) => {}
                }
            }
        }
        info!(
            watermark = %self.watermark.to_rfc3339(),
            queued = self.retry.len(),
            dead_letters = self.dead_letters.len(),
            "Search sync stopped"
        );
    }
}
