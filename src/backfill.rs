//! One-shot fingerprint backfill for rows stored before hashing existed.
//!
//! Rows without a hash are read in batches, oldest first, and given the
//! fingerprint of their url, title and publish time. Any failure aborts the
//! run; rows already updated keep their hash and a rerun picks up the rest.

use std::sync::Arc;

use tracing::{debug, info};

use crate::error::Result;
use crate::fingerprint::fingerprint;
use crate::store::CanonicalStore;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BackfillReport {
    pub updated: usize,
    pub batches: usize,
}

pub struct Backfill {
    store: Arc<dyn CanonicalStore>,
    batch_size: i64,
}

impl Backfill {
    pub fn new(store: Arc<dyn CanonicalStore>, batch_size: i64) -> Self {
        Self {
            store,
            batch_size: batch_size.max(1),
        }
    }

    pub async fn run(&self) -> Result<BackfillReport> {
        let mut report = BackfillReport::default();
        loop {
            let rows = self.store.missing_fingerprints(self.batch_size).await?;
            if rows.is_empty() {
                break;
            }
            for row in &rows {
                let hash = fingerprint(&row.url, &row.title, row.publish_time);
                self.store.set_fingerprint(&row.id, &hash).await?;
                debug!(id = %row.id, hash = %hash, "Fingerprint set");
                report.updated += 1;
            }
            report.batches += 1;
            info!(batch = report.batches, rows = rows.len(), total = report.updated, "Backfilled batch");
        }
        info!(updated = report.updated, batches = report.batches, "Backfill complete");
        Ok(report)
    }
}
