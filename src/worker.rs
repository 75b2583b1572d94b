//! Worker job loop
//!
//! One worker process runs one object at a time: lease a message, run the
//! transfer engine, and settle the lease. The queue's visibility timeout is
//! the only cross-process coordination. A message is deleted only when the
//! object landed DONE, so TIMEOUT and ERR surface it to another worker and
//! eventually to the dead-letter queue.

use crate::bookkeeping::BookkeepingTable;
use crate::engine::Engine;
use crate::queue::{LeasedMessage, WorkQueue};
use crate::types::{AttemptOutcome, JobDescriptor, QueueMessage, TerminalStatus};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Sleep between polls when the queue is empty.
const IDLE_SLEEP: Duration = Duration::from_secs(60);
/// Sleep after an unexpected error before re-entering the loop.
const ERROR_SLEEP: Duration = Duration::from_secs(5);

/// What one poll did. Drives the loop and makes it testable in isolation.
#[derive(Debug, PartialEq, Eq)]
pub enum Polled {
    /// No message available.
    Idle,
    /// A message was leased and handled; true when it was deleted.
    Handled { deleted: bool },
    /// The queue failed; back off.
    QueueError,
}

/// The worker loop: engine plus queue plumbing.
pub struct JobWorker {
    engine: Arc<Engine>,
    queue: Arc<dyn WorkQueue>,
    table: Arc<dyn BookkeepingTable>,
    des_bucket_default: String,
    des_prefix_default: String,
    max_retry: u32,
}

impl JobWorker {
    pub fn new(
        engine: Arc<Engine>,
        queue: Arc<dyn WorkQueue>,
        table: Arc<dyn BookkeepingTable>,
        des_bucket_default: impl Into<String>,
        des_prefix_default: impl Into<String>,
        max_retry: u32,
    ) -> Self {
        Self {
            engine,
            queue,
            table,
            des_bucket_default: des_bucket_default.into(),
            des_prefix_default: des_prefix_default.into(),
            max_retry,
        }
    }

    /// Run until the shutdown token fires.
    pub async fn run(&self, shutdown: CancellationToken) {
        info!(worker_id = self.engine.worker_id(), "worker loop started");
        loop {
            if shutdown.is_cancelled() {
                break;
            }

            let polled = tokio::select! {
                _ = shutdown.cancelled() => break,
                polled = self.poll_once() => polled,
            };

            let nap = match polled {
                Polled::Idle => Some(IDLE_SLEEP),
                Polled::QueueError => Some(ERROR_SLEEP),
                Polled::Handled { .. } => None,
            };
            if let Some(nap) = nap {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(nap) => {}
                }
            }
        }
        info!(worker_id = self.engine.worker_id(), "worker loop stopped");
    }

    /// Lease and handle at most one message.
    pub async fn poll_once(&self) -> Polled {
        let leased = match self.queue.receive().await {
            Ok(Some(message)) => message,
            Ok(None) => {
                match self.queue.approximate_in_flight().await {
                    Ok(0) => warn!("queue empty and nothing in flight"),
                    Ok(in_flight) => {
                        info!(in_flight, "queue empty, waiting for in-flight messages")
                    }
                    Err(e) => warn!(error = %e, "failed to read queue attributes"),
                }
                return Polled::Idle;
            }
            Err(e) => {
                error!(error = %e, "failed to receive from queue");
                return Polled::QueueError;
            }
        };

        let deleted = self.handle_message(&leased).await;
        Polled::Handled { deleted }
    }

    /// Handle one leased message; returns true when the message was deleted.
    async fn handle_message(&self, leased: &LeasedMessage) -> bool {
        let message = match QueueMessage::parse(&leased.body) {
            Ok(message) => message,
            Err(e) => {
                // Leave the message; redelivery will shunt a poison message
                // to the dead-letter queue
                warn!(error = %e, body = %leased.body, "unparseable queue message");
                return false;
            }
        };

        let jobs = message.into_jobs(&self.des_bucket_default, &self.des_prefix_default);
        if jobs.is_empty() {
            // Zero-size entries are acknowledged and dropped
            info!("message carried no transferable objects, acknowledging");
            return self.delete_with_retry(leased).await;
        }

        let mut all_done = true;
        for job in &jobs {
            let outcome = self.engine.run_job(job).await;
            let status = outcome.status();
            match &outcome {
                AttemptOutcome::Done { etag } => {
                    info!(job = %job, etag = %etag, "job finished")
                }
                AttemptOutcome::Timeout => {
                    warn!(job = %job, "job timed out, leaving message for redelivery")
                }
                AttemptOutcome::Err { reason } => {
                    warn!(job = %job, reason = %reason, "job failed, leaving message for redelivery")
                }
            }

            self.record_end(job, status).await;
            if status != TerminalStatus::Done {
                all_done = false;
            }
        }

        if all_done {
            self.delete_with_retry(leased).await
        } else {
            false
        }
    }

    /// Record the terminal status; never fatal.
    async fn record_end(&self, job: &JobDescriptor, status: TerminalStatus) {
        let identity = job.identity();
        for attempt in 1..=self.max_retry {
            let now = chrono::Utc::now().timestamp();
            match self.table.record_attempt_end(&identity, status, now).await {
                Ok(()) => return,
                Err(e) => {
                    warn!(job = %job, attempt, error = %e, "failed to record attempt end");
                    if attempt < self.max_retry {
                        tokio::time::sleep(Duration::from_secs(5 * attempt as u64)).await;
                    }
                }
            }
        }
        error!(job = %job, "giving up on bookkeeping end record");
    }

    /// Delete the leased message, retrying transient failures. On exhaustion
    /// the message redelivers; the next worker's probe will find the
    /// finalized object and the producer's delta filter will skip it.
    async fn delete_with_retry(&self, leased: &LeasedMessage) -> bool {
        for attempt in 1..=self.max_retry {
            match self.queue.delete(&leased.receipt).await {
                Ok(()) => return true,
                Err(e) => {
                    warn!(attempt, error = %e, "failed to delete queue message");
                    if attempt < self.max_retry {
                        tokio::time::sleep(Duration::from_secs(5 * attempt as u64)).await;
                    }
                }
            }
        }
        error!("giving up on deleting queue message; it will redeliver");
        false
    }
}
