//! Fetch concurrency limits shared by every running task.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::models::NewsSource;

/// A global fetch cap plus one cap per source, sized by the source's
/// `max_concurrency` (at least one). When a source row arrives with a new
/// `max_concurrency` its cap is replaced; fetches holding permits of the old
/// cap finish under it.
#[derive(Debug)]
pub struct ConcurrencyLimits {
    global: Arc<Semaphore>,
    per_source: Mutex<HashMap<i64, SourceLimit>>,
}

#[derive(Debug)]
struct SourceLimit {
    size: usize,
    semaphore: Arc<Semaphore>,
}

impl SourceLimit {
    fn new(size: usize) -> Self {
        Self {
            size,
            semaphore: Arc::new(Semaphore::new(size)),
        }
    }
}

/// Held for the duration of one fetch.
#[derive(Debug)]
pub struct FetchPermit {
    _source: OwnedSemaphorePermit,
    _global: OwnedSemaphorePermit,
}

impl ConcurrencyLimits {
    pub fn new(global_max: usize) -> Self {
        Self {
            global: Arc::new(Semaphore::new(global_max.max(1))),
            per_source: Mutex::new(HashMap::new()),
        }
    }

    fn source_semaphore(&self, source: &NewsSource) -> Arc<Semaphore> {
        let mut per_source = self.per_source.lock().unwrap_or_else(|e| e.into_inner());
        let size = source.max_concurrency.max(1) as usize;
        let limit = per_source
            .entry(source.id)
            .or_insert_with(|| SourceLimit::new(size));
        if limit.size != size {
            debug!(source_id = source.id, from = limit.size, to = size, "Source concurrency changed");
            *limit = SourceLimit::new(size);
        }
        Arc::clone(&limit.semaphore)
    }

    /// Wait for a source permit, then a global one. Returns `None` if `cancel`
    /// fires first.
    pub async fn acquire(
        &self,
        source: &NewsSource,
        cancel: &CancellationToken,
    ) -> Option<FetchPermit> {
        let source_semaphore = self.source_semaphore(source);
        let source_permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => return None,
            permit = source_semaphore.acquire_owned() => permit.ok()?,
        };
        let global_permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => return None,
            permit = Arc::clone(&self.global).acquire_owned() => permit.ok()?,
        };
        Some(FetchPermit {
            _source: source_permit,
            _global: global_permit,
        })
    }
}
