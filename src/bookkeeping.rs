//! Durable per-job bookkeeping
//!
//! Every attempt on an object updates one record in an external table:
//! attempt counter, the set of workers that touched it, start and finish
//! times, and the terminal statuses observed. Bookkeeping is an audit
//! trail; write failures are logged by callers and never block the
//! transfer itself.

use crate::types::{JobDescriptor, TerminalStatus};
use async_trait::async_trait;
use aws_sdk_dynamodb::types::AttributeValue;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use thiserror::Error;

/// Errors from bookkeeping operations
#[derive(Debug, Error)]
pub enum TableError {
    #[error("table error: {0}")]
    Table(String),
}

/// Abstract bookkeeping table keyed by job identity (`src_bucket/src_key`)
#[async_trait]
pub trait BookkeepingTable: Send + Sync {
    /// Record the start of an attempt: bump the attempt counter, add the
    /// worker to the worker set, and set the start timestamp.
    async fn record_attempt_start(
        &self,
        identity: &str,
        worker_id: &str,
        start_time: i64,
    ) -> Result<(), TableError>;

    /// Record an attempt's terminal status and total elapsed seconds.
    async fn record_attempt_end(
        &self,
        identity: &str,
        status: TerminalStatus,
        finish_time: i64,
    ) -> Result<(), TableError>;

    /// Seed the record for a job the producer is about to enqueue.
    async fn put_job(&self, job: &JobDescriptor) -> Result<(), TableError>;
}

/// DynamoDB-backed bookkeeping table
pub struct DynamoTable {
    client: aws_sdk_dynamodb::Client,
    table_name: String,
}

impl DynamoTable {
    pub fn new(client: aws_sdk_dynamodb::Client, table_name: impl Into<String>) -> Self {
        Self {
            client,
            table_name: table_name.into(),
        }
    }
}

#[async_trait]
impl BookkeepingTable for DynamoTable {
    async fn record_attempt_start(
        &self,
        identity: &str,
        worker_id: &str,
        start_time: i64,
    ) -> Result<(), TableError> {
        self.client
            .update_item()
            .table_name(&self.table_name)
            .key("Key", AttributeValue::S(identity.to_string()))
            .update_expression("ADD instance_id :id, retry_times :t SET start_time = :s")
            .expression_attribute_values(":id", AttributeValue::Ss(vec![worker_id.to_string()]))
            .expression_attribute_values(":t", AttributeValue::N("1".to_string()))
            .expression_attribute_values(":s", AttributeValue::N(start_time.to_string()))
            .send()
            .await
            .map_err(|e| TableError::Table(format!("update_item (start) failed: {e}")))?;
        Ok(())
    }

    async fn record_attempt_end(
        &self,
        identity: &str,
        status: TerminalStatus,
        finish_time: i64,
    ) -> Result<(), TableError> {
        self.client
            .update_item()
            .table_name(&self.table_name)
            .key("Key", AttributeValue::S(identity.to_string()))
            .update_expression("SET spent_time = :s - start_time ADD job_status :done")
            .expression_attribute_values(":done", AttributeValue::Ss(vec![status.as_str().to_string()]))
            .expression_attribute_values(":s", AttributeValue::N(finish_time.to_string()))
            .send()
            .await
            .map_err(|e| TableError::Table(format!("update_item (end) failed: {e}")))?;
        Ok(())
    }

    async fn put_job(&self, job: &JobDescriptor) -> Result<(), TableError> {
        self.client
            .put_item()
            .table_name(&self.table_name)
            .item("Key", AttributeValue::S(job.identity()))
            .item("Src_bucket", AttributeValue::S(job.src_bucket.clone()))
            .item("Des_bucket", AttributeValue::S(job.des_bucket.clone()))
            .item("Des_key", AttributeValue::S(job.des_key.clone()))
            .item("Size", AttributeValue::N(job.size.to_string()))
            .send()
            .await
            .map_err(|e| TableError::Table(format!("put_item failed: {e}")))?;
        Ok(())
    }
}

/// One record in the in-memory table
#[derive(Debug, Clone, Default)]
pub struct BookkeepingRecord {
    pub retry_times: u32,
    pub instance_ids: HashSet<String>,
    pub start_time: i64,
    pub spent_time: i64,
    pub job_status: HashSet<String>,
}

/// In-memory bookkeeping table for local development and tests
#[derive(Default)]
pub struct MemoryTable {
    records: Mutex<HashMap<String, BookkeepingRecord>>,
}

impl MemoryTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, identity: &str) -> Option<BookkeepingRecord> {
        self.records.lock().get(identity).cloned()
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }
}

#[async_trait]
impl BookkeepingTable for MemoryTable {
    async fn record_attempt_start(
        &self,
        identity: &str,
        worker_id: &str,
        start_time: i64,
    ) -> Result<(), TableError> {
        let mut records = self.records.lock();
        let record = records.entry(identity.to_string()).or_default();
        record.retry_times += 1;
        record.instance_ids.insert(worker_id.to_string());
        record.start_time = start_time;
        Ok(())
    }

    async fn record_attempt_end(
        &self,
        identity: &str,
        status: TerminalStatus,
        finish_time: i64,
    ) -> Result<(), TableError> {
        let mut records = self.records.lock();
        let record = records.entry(identity.to_string()).or_default();
        record.spent_time = finish_time - record.start_time;
        record.job_status.insert(status.as_str().to_string());
        Ok(())
    }

    async fn put_job(&self, job: &JobDescriptor) -> Result<(), TableError> {
        self.records.lock().entry(job.identity()).or_default();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_attempt_lifecycle() {
        let table = MemoryTable::new();
        table
            .record_attempt_start("bucket/key", "worker-a", 100)
            .await
            .unwrap();
        table
            .record_attempt_end("bucket/key", TerminalStatus::Timeout, 130)
            .await
            .unwrap();
        table
            .record_attempt_start("bucket/key", "worker-b", 200)
            .await
            .unwrap();
        table
            .record_attempt_end("bucket/key", TerminalStatus::Done, 260)
            .await
            .unwrap();

        let record = table.record("bucket/key").unwrap();
        assert_eq!(record.retry_times, 2);
        assert_eq!(record.instance_ids.len(), 2);
        assert_eq!(record.spent_time, 60);
        assert!(record.job_status.contains("TIMEOUT"));
        assert!(record.job_status.contains("DONE"));
    }
}
