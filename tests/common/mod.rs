//! Shared test fixtures: a fault-injecting object store wrapper and a
//! bookkeeping table that always fails.

#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use s3_shuttle::bookkeeping::{BookkeepingTable, TableError};
use s3_shuttle::digest::{content_md5, part_md5};
use s3_shuttle::storage::{
    CompletedPartRecord, MemoryStore, ObjectEntry, ObjectStore, PartRecord, StorageError,
    UploadRecord,
};
use s3_shuttle::types::{JobDescriptor, TerminalStatus};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Object store wrapper with injectable faults, layered over [`MemoryStore`].
///
/// Wrap the source to slow down or fail downloads; wrap the destination to
/// corrupt uploads, record uploaded part numbers, or simulate a rival worker
/// finalizing the upload mid-flight.
pub struct HookedStore {
    inner: Arc<MemoryStore>,
    get_delay: Option<Duration>,
    fail_gets: AtomicU32,
    corrupt_uploads: AtomicU32,
    rival_completes_after: Option<u32>,
    upload_count: AtomicU32,
    uploads_seen: Mutex<Vec<u32>>,
}

impl HookedStore {
    pub fn new(inner: Arc<MemoryStore>) -> Self {
        Self {
            inner,
            get_delay: None,
            fail_gets: AtomicU32::new(0),
            corrupt_uploads: AtomicU32::new(0),
            rival_completes_after: None,
            upload_count: AtomicU32::new(0),
            uploads_seen: Mutex::new(Vec::new()),
        }
    }

    /// Every ranged GET sleeps this long before returning.
    pub fn with_get_delay(mut self, delay: Duration) -> Self {
        self.get_delay = Some(delay);
        self
    }

    /// Fail the next `count` ranged GETs with a transient error.
    pub fn with_failing_gets(self, count: u32) -> Self {
        self.fail_gets.store(count, Ordering::SeqCst);
        self
    }

    /// Corrupt the next `count` part uploads. The corrupted body is stored
    /// with a self-consistent Content-MD5, modeling corruption upstream of
    /// hashing, the kind only the composite digest check can catch.
    pub fn with_corrupt_uploads(self, count: u32) -> Self {
        self.corrupt_uploads.store(count, Ordering::SeqCst);
        self
    }

    /// After `count` part uploads have been forwarded, a rival worker
    /// completes the upload out from under the caller.
    pub fn with_rival_completion_after(mut self, count: u32) -> Self {
        self.rival_completes_after = Some(count);
        self
    }

    /// Part numbers that were actually uploaded through this wrapper.
    pub fn uploaded_part_numbers(&self) -> Vec<u32> {
        let mut parts = self.uploads_seen.lock().clone();
        parts.sort_unstable();
        parts
    }

    async fn rival_complete(&self, bucket: &str, key: &str, upload_id: &str) {
        let parts = self
            .inner
            .list_parts(bucket, key, upload_id)
            .await
            .expect("rival lists parts");
        let completed: Vec<CompletedPartRecord> = parts
            .into_iter()
            .map(|p| CompletedPartRecord {
                part_number: p.part_number,
                etag: p.etag,
            })
            .collect();
        self.inner
            .complete_multipart_upload(bucket, key, upload_id, &completed)
            .await
            .expect("rival completes upload");
    }
}

#[async_trait]
impl ObjectStore for HookedStore {
    async fn get_range(
        &self,
        bucket: &str,
        key: &str,
        offset: u64,
        length: u64,
    ) -> Result<Bytes, StorageError> {
        if let Some(delay) = self.get_delay {
            tokio::time::sleep(delay).await;
        }
        if self
            .fail_gets
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(StorageError::S3("injected download failure".to_string()));
        }
        self.inner.get_range(bucket, key, offset, length).await
    }

    async fn list_objects(
        &self,
        bucket: &str,
        prefix: &str,
    ) -> Result<Vec<ObjectEntry>, StorageError> {
        self.inner.list_objects(bucket, prefix).await
    }

    async fn create_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        storage_class: Option<&str>,
    ) -> Result<String, StorageError> {
        self.inner
            .create_multipart_upload(bucket, key, storage_class)
            .await
    }

    async fn upload_part(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        part_number: u32,
        body: Bytes,
        content_md5_header: &str,
    ) -> Result<(), StorageError> {
        let (body, header) = if self
            .corrupt_uploads
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            let mut corrupted = body.to_vec();
            corrupted[0] ^= 0xFF;
            let digest = part_md5(&corrupted);
            (Bytes::from(corrupted), content_md5(&digest))
        } else {
            (body, content_md5_header.to_string())
        };

        self.inner
            .upload_part(bucket, key, upload_id, part_number, body, &header)
            .await?;

        self.uploads_seen.lock().push(part_number);
        let count = self.upload_count.fetch_add(1, Ordering::SeqCst) + 1;
        if self.rival_completes_after == Some(count) {
            self.rival_complete(bucket, key, upload_id).await;
        }
        Ok(())
    }

    async fn list_multipart_uploads(
        &self,
        bucket: &str,
        key_prefix: &str,
    ) -> Result<Vec<UploadRecord>, StorageError> {
        self.inner.list_multipart_uploads(bucket, key_prefix).await
    }

    async fn list_parts(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
    ) -> Result<Vec<PartRecord>, StorageError> {
        self.inner.list_parts(bucket, key, upload_id).await
    }

    async fn complete_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPartRecord],
    ) -> Result<String, StorageError> {
        self.inner
            .complete_multipart_upload(bucket, key, upload_id, parts)
            .await
    }

    async fn abort_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
    ) -> Result<(), StorageError> {
        self.inner.abort_multipart_upload(bucket, key, upload_id).await
    }

    async fn delete_object(&self, bucket: &str, key: &str) -> Result<(), StorageError> {
        self.inner.delete_object(bucket, key).await
    }
}

/// A bookkeeping table that rejects every write. The transfer must not care.
pub struct FailingTable;

#[async_trait]
impl BookkeepingTable for FailingTable {
    async fn record_attempt_start(
        &self,
        _identity: &str,
        _worker_id: &str,
        _start_time: i64,
    ) -> Result<(), TableError> {
        Err(TableError::Table("injected table outage".to_string()))
    }

    async fn record_attempt_end(
        &self,
        _identity: &str,
        _status: TerminalStatus,
        _finish_time: i64,
    ) -> Result<(), TableError> {
        Err(TableError::Table("injected table outage".to_string()))
    }

    async fn put_job(&self, _job: &JobDescriptor) -> Result<(), TableError> {
        Err(TableError::Table("injected table outage".to_string()))
    }
}

/// Seed a source object with deterministic, position-dependent bytes.
pub fn seed_source(store: &MemoryStore, bucket: &str, key: &str, size: usize) -> Vec<u8> {
    let data: Vec<u8> = (0..size).map(|i| (i % 251) as u8).collect();
    store.put_object(bucket, key, data.clone());
    data
}

/// Upload parts of `data` under an existing upload id, simulating work left
/// behind by a crashed worker.
pub async fn upload_parts(
    store: &MemoryStore,
    bucket: &str,
    key: &str,
    upload_id: &str,
    data: &[u8],
    chunk: usize,
    part_numbers: &[u32],
) {
    for &pn in part_numbers {
        let start = (pn as usize - 1) * chunk;
        let end = (start + chunk).min(data.len());
        let body = Bytes::copy_from_slice(&data[start..end]);
        let digest = part_md5(&body);
        store
            .upload_part(bucket, key, upload_id, pn, body, &content_md5(&digest))
            .await
            .expect("seeded part upload");
    }
}
