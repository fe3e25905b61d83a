//! Single writer for one running task's status and progress.
//!
//! Every write for a running task goes through its [`StatusWriter`], one
//! command at a time. Once the task's cancellation token has fired, the next
//! command of any kind becomes the final `stopped` write, and nothing is
//! written after a terminal write. A write the store refuses means another
//! process already ended the task; the writer then cancels the token so the
//! crawl loop winds down.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::error::Result;
use crate::models::CrawlStatus;
use crate::retry::Backoff;
use crate::store::{ProgressUpdate, TaskStore};

/// Reason recorded when a task is stopped without an explicit request.
pub const SHUTDOWN_REASON: &str = "engine shutdown";

/// Stop reason shared between the engine and the writer.
pub type StopReason = Arc<Mutex<Option<String>>>;

#[derive(Debug, Clone, PartialEq)]
pub enum StatusCommand {
    /// Status and counters; a terminal status here is the task's last write.
    Progress(ProgressUpdate),
    /// Status with an optional error message.
    Status {
        status: CrawlStatus,
        message: Option<String>,
    },
    /// Write `stopped` with the recorded reason.
    Stop,
}

struct Envelope {
    command: StatusCommand,
    ack: oneshot::Sender<bool>,
}

/// Sending side of a task's writer.
#[derive(Debug, Clone)]
pub struct WriterHandle {
    tx: mpsc::Sender<Envelope>,
}

impl WriterHandle {
    /// Submit `command` and wait for it to be applied. Returns `false` once
    /// the task has ended and the write was dropped.
    pub async fn send(&self, command: StatusCommand) -> bool {
        let (ack, done) = oneshot::channel();
        if self.tx.send(Envelope { command, ack }).await.is_err() {
            return false;
        }
        done.await.unwrap_or(false)
    }

    pub async fn progress(&self, update: ProgressUpdate) -> bool {
        self.send(StatusCommand::Progress(update)).await
    }
}

/// Consumes commands for one task and applies them to the store in order.
pub struct StatusWriter {
    task_id: String,
    store: Arc<dyn TaskStore>,
    token: CancellationToken,
    stop_reason: StopReason,
    backoff: Backoff,
    last_progress: f64,
    ended: bool,
}

impl StatusWriter {
    pub fn new(
        task_id: impl Into<String>,
        store: Arc<dyn TaskStore>,
        token: CancellationToken,
        stop_reason: StopReason,
    ) -> Self {
        Self {
            task_id: task_id.into(),
            store,
            token,
            stop_reason,
            backoff: Backoff::new(3, Duration::from_millis(200)),
            last_progress: 0.0,
            ended: false,
        }
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// Spawn the writer loop and return its handle.
    pub fn spawn(self) -> (WriterHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(16);
        let join = tokio::spawn(self.run(rx));
        (WriterHandle { tx }, join)
    }

    async fn run(mut self, mut rx: mpsc::Receiver<Envelope>) {
        while let Some(Envelope { command, ack }) = rx.recv().await {
            let applied = if self.ended {
                false
            } else {
                self.apply(command).await
            };
            let _ = ack.send(applied);
        }
        debug!(task_id = %self.task_id, "Status writer closed");
    }

    fn recorded_reason(&self) -> String {
        self.stop_reason
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .unwrap_or_else(|| SHUTDOWN_REASON.to_string())
    }

    async fn apply(&mut self, command: StatusCommand) -> bool {
        if self.token.is_cancelled() {
            return self.write_stop().await;
        }

        let (status, result) = match command {
            StatusCommand::Stop => return self.write_stop().await,
            StatusCommand::Progress(mut update) => {
                update.progress = update.progress.max(self.last_progress);
                let result = self
                    .backoff
                    .retry("write task progress", || {
                        self.store.update_status_and_progress(&self.task_id, &update)
                    })
                    .await;
                if matches!(result, Ok(true)) {
                    self.last_progress = update.progress;
                }
                (update.status, result)
            }
            StatusCommand::Status { status, message } => {
                let result = self.try_write_status(status, message.as_deref()).await;
                (status, result)
            }
        };

        if status.is_terminal() {
            self.ended = true;
        }
        match result {
            Ok(true) => true,
            Ok(false) => {
                // the row is already terminal: another process ended the task
                info!(task_id = %self.task_id, "Task ended elsewhere; cancelling");
                self.ended = true;
                self.token.cancel();
                false
            }
            Err(e) if status.is_terminal() => {
                error!(
                    task_id = %self.task_id,
                    %status,
                    error = %e,
                    "Final task write failed; the row stays running until the next engine start fails it"
                );
                false
            }
            Err(e) => {
                error!(task_id = %self.task_id, %status, error = %e, "Task write failed");
                true
            }
        }
    }

    async fn write_stop(&mut self) -> bool {
        let reason = self.recorded_reason();
        self.ended = true;
        let applied = match self
            .try_write_status(CrawlStatus::Stopped, Some(reason.as_str()))
            .await
        {
            Ok(applied) => applied,
            Err(e) => {
                error!(
                    task_id = %self.task_id,
                    error = %e,
                    "Stop write failed; the row stays running until the next engine start fails it"
                );
                false
            }
        };
        if applied {
            info!(task_id = %self.task_id, reason = %reason, "Task stopped");
        }
        applied
    }

    async fn try_write_status(&self, status: CrawlStatus, message: Option<&str>) -> Result<bool> {
        self.backoff
            .retry("write task status", || {
                self.store.update_status(&self.task_id, status, message)
            })
            .await
    }
}
