//! Work queue adapters
//!
//! The queue provides the fleet's mutual exclusion: a leased message is
//! invisible to other workers for the visibility timeout, and is deleted
//! only when the object landed DONE. TIMEOUT and ERR leave the message for
//! redelivery (and eventually the dead-letter queue).

use async_trait::async_trait;
use aws_sdk_sqs::types::{QueueAttributeName, SendMessageBatchRequestEntry};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::warn;

/// Errors from queue operations
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue error: {0}")]
    Queue(String),
}

/// One leased message. The receipt is the exclusive lease handle.
#[derive(Debug, Clone)]
pub struct LeasedMessage {
    pub body: String,
    pub receipt: String,
}

/// Abstract at-least-once work queue
#[async_trait]
pub trait WorkQueue: Send + Sync {
    /// Long-poll for a single message.
    async fn receive(&self) -> Result<Option<LeasedMessage>, QueueError>;

    /// Delete a message by its lease receipt. Only called on DONE.
    async fn delete(&self, receipt: &str) -> Result<(), QueueError>;

    /// Approximate number of leased-but-undeleted messages fleet-wide.
    async fn approximate_in_flight(&self) -> Result<u64, QueueError>;

    /// Enqueue a batch of message bodies (at most 10 per call).
    async fn send_batch(&self, bodies: &[String]) -> Result<(), QueueError>;
}

/// SQS-backed work queue
pub struct SqsQueue {
    client: aws_sdk_sqs::Client,
    queue_url: String,
}

impl SqsQueue {
    /// Resolve the queue URL by name, waiting until the queue exists.
    /// Infrastructure provisioning may still be in flight when a worker
    /// boots, so this blocks rather than fails.
    pub async fn connect(client: aws_sdk_sqs::Client, queue_name: &str) -> Self {
        loop {
            match client.get_queue_url().queue_name(queue_name).send().await {
                Ok(response) => {
                    if let Some(queue_url) = response.queue_url {
                        return Self { client, queue_url };
                    }
                    warn!(queue_name, "get_queue_url returned no URL, retrying");
                }
                Err(e) => {
                    warn!(queue_name, error = %e, "waiting for queue availability");
                }
            }
            tokio::time::sleep(Duration::from_secs(10)).await;
        }
    }
}

#[async_trait]
impl WorkQueue for SqsQueue {
    async fn receive(&self) -> Result<Option<LeasedMessage>, QueueError> {
        let response = self
            .client
            .receive_message()
            .queue_url(&self.queue_url)
            .max_number_of_messages(1)
            .wait_time_seconds(20)
            .send()
            .await
            .map_err(|e| QueueError::Queue(format!("receive_message failed: {e}")))?;

        let message = response.messages.and_then(|mut m| {
            if m.is_empty() {
                None
            } else {
                Some(m.remove(0))
            }
        });

        Ok(message.and_then(|m| {
            match (m.body, m.receipt_handle) {
                (Some(body), Some(receipt)) => Some(LeasedMessage { body, receipt }),
                _ => None,
            }
        }))
    }

    async fn delete(&self, receipt: &str) -> Result<(), QueueError> {
        self.client
            .delete_message()
            .queue_url(&self.queue_url)
            .receipt_handle(receipt)
            .send()
            .await
            .map_err(|e| QueueError::Queue(format!("delete_message failed: {e}")))?;
        Ok(())
    }

    async fn approximate_in_flight(&self) -> Result<u64, QueueError> {
        let response = self
            .client
            .get_queue_attributes()
            .queue_url(&self.queue_url)
            .attribute_names(QueueAttributeName::ApproximateNumberOfMessagesNotVisible)
            .send()
            .await
            .map_err(|e| QueueError::Queue(format!("get_queue_attributes failed: {e}")))?;

        let count = response
            .attributes
            .as_ref()
            .and_then(|attrs| {
                attrs.get(&QueueAttributeName::ApproximateNumberOfMessagesNotVisible)
            })
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        Ok(count)
    }

    async fn send_batch(&self, bodies: &[String]) -> Result<(), QueueError> {
        let mut entries = Vec::with_capacity(bodies.len());
        for (i, body) in bodies.iter().enumerate() {
            let entry = SendMessageBatchRequestEntry::builder()
                .id(i.to_string())
                .message_body(body)
                .build()
                .map_err(|e| QueueError::Queue(format!("invalid batch entry: {e}")))?;
            entries.push(entry);
        }

        self.client
            .send_message_batch()
            .queue_url(&self.queue_url)
            .set_entries(Some(entries))
            .send()
            .await
            .map_err(|e| QueueError::Queue(format!("send_message_batch failed: {e}")))?;
        Ok(())
    }
}

/// In-memory queue with visibility-timeout semantics, for local development
/// and the test suite.
pub struct MemoryQueue {
    state: Mutex<MemoryQueueState>,
    visibility: Duration,
    batch_sizes: Mutex<Vec<usize>>,
}

struct MemoryQueueState {
    visible: VecDeque<String>,
    in_flight: HashMap<String, (String, Instant)>,
    receipt_counter: u64,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::with_visibility(Duration::from_secs(300))
    }

    pub fn with_visibility(visibility: Duration) -> Self {
        Self {
            state: Mutex::new(MemoryQueueState {
                visible: VecDeque::new(),
                in_flight: HashMap::new(),
                receipt_counter: 0,
            }),
            visibility,
            batch_sizes: Mutex::new(Vec::new()),
        }
    }

    pub fn push(&self, body: impl Into<String>) {
        self.state.lock().visible.push_back(body.into());
    }

    /// Visible message count (after expiring lapsed leases).
    pub fn visible_len(&self) -> usize {
        let mut state = self.state.lock();
        Self::requeue_expired(&mut state);
        state.visible.len()
    }

    /// Batch sizes recorded by `send_batch`, for producer tests.
    pub fn recorded_batch_sizes(&self) -> Vec<usize> {
        self.batch_sizes.lock().clone()
    }

    fn requeue_expired(state: &mut MemoryQueueState) {
        let now = Instant::now();
        let expired: Vec<String> = state
            .in_flight
            .iter()
            .filter(|(_, (_, due))| *due <= now)
            .map(|(receipt, _)| receipt.clone())
            .collect();
        for receipt in expired {
            if let Some((body, _)) = state.in_flight.remove(&receipt) {
                state.visible.push_back(body);
            }
        }
    }
}

impl Default for MemoryQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl WorkQueue for MemoryQueue {
    async fn receive(&self) -> Result<Option<LeasedMessage>, QueueError> {
        let mut state = self.state.lock();
        Self::requeue_expired(&mut state);
        let Some(body) = state.visible.pop_front() else {
            return Ok(None);
        };
        state.receipt_counter += 1;
        let receipt = format!("receipt-{}", state.receipt_counter);
        let due = Instant::now() + self.visibility;
        state.in_flight.insert(receipt.clone(), (body.clone(), due));
        Ok(Some(LeasedMessage { body, receipt }))
    }

    async fn delete(&self, receipt: &str) -> Result<(), QueueError> {
        let mut state = self.state.lock();
        state
            .in_flight
            .remove(receipt)
            .map(|_| ())
            .ok_or_else(|| QueueError::Queue(format!("unknown receipt: {receipt}")))
    }

    async fn approximate_in_flight(&self) -> Result<u64, QueueError> {
        let mut state = self.state.lock();
        Self::requeue_expired(&mut state);
        Ok(state.in_flight.len() as u64)
    }

    async fn send_batch(&self, bodies: &[String]) -> Result<(), QueueError> {
        self.batch_sizes.lock().push(bodies.len());
        let mut state = self.state.lock();
        for body in bodies {
            state.visible.push_back(body.clone());
        }
        Ok(())
    }
}
