//! Job producer
//!
//! Lists the source prefix, computes the delta against the destination, and
//! enqueues one job per missing object. Destination objects with a matching
//! key (minus the destination prefix) and equal size are skipped.

use crate::bookkeeping::BookkeepingTable;
use crate::queue::WorkQueue;
use crate::storage::{ObjectEntry, ObjectStore, StorageError};
use crate::types::{join_key, JobDescriptor};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

/// SQS caps batch sends at ten entries.
const QUEUE_BATCH: usize = 10;

#[derive(Debug, Error)]
pub enum ProducerError {
    #[error("failed to list source bucket: {0}")]
    SourceListing(StorageError),

    #[error("failed to list destination bucket: {0}")]
    DestinationListing(StorageError),
}

/// Source/destination naming for one producer run
#[derive(Debug, Clone)]
pub struct ProducerParams {
    pub src_bucket: String,
    pub src_prefix: String,
    pub des_bucket: String,
    pub des_prefix: String,
    pub max_retry: u32,
}

pub struct Producer {
    source: Arc<dyn ObjectStore>,
    destination: Arc<dyn ObjectStore>,
    queue: Arc<dyn WorkQueue>,
    table: Arc<dyn BookkeepingTable>,
    params: ProducerParams,
}

impl Producer {
    pub fn new(
        source: Arc<dyn ObjectStore>,
        destination: Arc<dyn ObjectStore>,
        queue: Arc<dyn WorkQueue>,
        table: Arc<dyn BookkeepingTable>,
        params: ProducerParams,
    ) -> Self {
        Self {
            source,
            destination,
            queue,
            table,
            params,
        }
    }

    /// List both sides, compute the delta, and enqueue it.
    pub async fn run(&self) -> Result<usize, ProducerError> {
        info!(
            bucket = %self.params.src_bucket,
            prefix = %self.params.src_prefix,
            "listing source bucket"
        );
        let src_entries = self
            .source
            .list_objects(&self.params.src_bucket, &self.params.src_prefix)
            .await
            .map_err(ProducerError::SourceListing)?;

        info!(
            bucket = %self.params.des_bucket,
            prefix = %self.params.des_prefix,
            "listing destination bucket"
        );
        let des_entries = self
            .destination
            .list_objects(&self.params.des_bucket, &self.params.des_prefix)
            .await
            .map_err(ProducerError::DestinationListing)?;

        let jobs = delta_jobs(&src_entries, &des_entries, &self.params);
        info!(
            source = src_entries.len(),
            destination = des_entries.len(),
            delta = jobs.len(),
            "computed delta job list"
        );

        self.enqueue(&jobs).await;
        Ok(jobs.len())
    }

    /// Write bookkeeping records and push jobs to the queue in batches.
    async fn enqueue(&self, jobs: &[JobDescriptor]) {
        let mut batch: Vec<String> = Vec::with_capacity(QUEUE_BATCH);
        for job in jobs {
            self.put_job_with_retry(job).await;

            match serde_json::to_string(job) {
                Ok(body) => batch.push(body),
                Err(e) => {
                    warn!(job = %job, error = %e, "failed to serialize job");
                    continue;
                }
            }
            if batch.len() == QUEUE_BATCH {
                self.send_batch_with_retry(&batch).await;
                batch.clear();
            }
        }
        if !batch.is_empty() {
            self.send_batch_with_retry(&batch).await;
        }
        info!(jobs = jobs.len(), "finished enqueueing jobs");
    }

    async fn put_job_with_retry(&self, job: &JobDescriptor) {
        for attempt in 1..=self.params.max_retry {
            match self.table.put_job(job).await {
                Ok(()) => return,
                Err(e) => {
                    warn!(job = %job, attempt, error = %e, "failed to write bookkeeping record");
                    if attempt < self.params.max_retry {
                        tokio::time::sleep(Duration::from_secs(5 * attempt as u64)).await;
                    }
                }
            }
        }
        warn!(job = %job, "giving up on bookkeeping record, job still enqueued");
    }

    async fn send_batch_with_retry(&self, batch: &[String]) {
        for attempt in 1..=self.params.max_retry {
            match self.queue.send_batch(batch).await {
                Ok(()) => return,
                Err(e) => {
                    warn!(attempt, error = %e, "failed to send job batch");
                    if attempt < self.params.max_retry {
                        tokio::time::sleep(Duration::from_secs(5 * attempt as u64)).await;
                    }
                }
            }
        }
        warn!(batch = batch.len(), "giving up on job batch");
    }
}

/// A source object needs a job unless the destination already holds
/// `des_prefix/key` at the same size. Zero-size source keys are dropped:
/// directory markers and empty files never reach the transfer engine.
pub fn delta_jobs(
    src_entries: &[ObjectEntry],
    des_entries: &[ObjectEntry],
    params: &ProducerParams,
) -> Vec<JobDescriptor> {
    let prefix = params.des_prefix.trim_end_matches('/');
    let existing: HashMap<&str, u64> = des_entries
        .iter()
        .filter_map(|entry| {
            if prefix.is_empty() {
                Some((entry.key.as_str(), entry.size))
            } else {
                entry
                    .key
                    .strip_prefix(prefix)
                    .and_then(|rest| rest.strip_prefix('/'))
                    .map(|stripped| (stripped, entry.size))
            }
        })
        .collect();

    src_entries
        .iter()
        .filter(|entry| {
            if entry.size == 0 {
                warn!(
                    bucket = %params.src_bucket,
                    key = %entry.key,
                    "zero size object, skipping"
                );
                return false;
            }
            existing.get(entry.key.as_str()) != Some(&entry.size)
        })
        .map(|entry| JobDescriptor {
            src_bucket: params.src_bucket.clone(),
            src_key: entry.key.clone(),
            size: entry.size,
            des_bucket: params.des_bucket.clone(),
            des_key: join_key(&params.des_prefix, &entry.key),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> ProducerParams {
        ProducerParams {
            src_bucket: "src".into(),
            src_prefix: "".into(),
            des_bucket: "des".into(),
            des_prefix: "mirrored".into(),
            max_retry: 2,
        }
    }

    fn entry(key: &str, size: u64) -> ObjectEntry {
        ObjectEntry {
            key: key.into(),
            size,
        }
    }

    #[test]
    fn test_delta_skips_existing_same_size() {
        let src = vec![entry("a.bin", 100), entry("b.bin", 200)];
        let des = vec![entry("mirrored/a.bin", 100)];

        let jobs = delta_jobs(&src, &des, &params());
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].src_key, "b.bin");
        assert_eq!(jobs[0].des_key, "mirrored/b.bin");
    }

    #[test]
    fn test_delta_requeues_size_mismatch() {
        let src = vec![entry("a.bin", 100)];
        let des = vec![entry("mirrored/a.bin", 99)];

        let jobs = delta_jobs(&src, &des, &params());
        assert_eq!(jobs.len(), 1);
    }

    #[test]
    fn test_delta_drops_zero_size() {
        let src = vec![entry("marker/", 0), entry("a.bin", 100)];
        let jobs = delta_jobs(&src, &[], &params());
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].src_key, "a.bin");
    }

    #[test]
    fn test_delta_empty_destination_prefix() {
        let mut p = params();
        p.des_prefix = String::new();
        let src = vec![entry("a.bin", 100), entry("b.bin", 50)];
        let des = vec![entry("a.bin", 100)];

        let jobs = delta_jobs(&src, &des, &p);
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].des_key, "b.bin");
    }
}
