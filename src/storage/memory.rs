//! In-memory object store with real multipart semantics
//!
//! Used for local development and the test suite. Parts are buffered in
//! memory until complete-multipart assembles them into an object; composite
//! ETags follow the S3 formula so integrity checks behave exactly as they
//! do against a real destination.

use super::traits::{
    CompletedPartRecord, ObjectEntry, ObjectStore, PartRecord, StorageError, UploadRecord,
};
use crate::digest::{content_md5, part_md5};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Duration, Utc};
use md5::{Digest, Md5};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// Data for a single uploaded part
#[derive(Clone)]
struct PartData {
    data: Bytes,
    md5_hex: String,
    md5_raw: [u8; 16],
}

/// State for an in-progress multipart upload
struct MultipartUpload {
    bucket: String,
    key: String,
    initiated: DateTime<Utc>,
    parts: HashMap<u32, PartData>,
}

/// A finalized object
#[derive(Clone)]
struct StoredObject {
    data: Bytes,
    etag: String,
}

/// Thread-safe in-memory store
#[derive(Default)]
pub struct MemoryStore {
    objects: RwLock<HashMap<(String, String), StoredObject>>,
    uploads: RwLock<HashMap<String, MultipartUpload>>,
    id_counter: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed or overwrite an object directly (producer input, test fixtures).
    pub fn put_object(&self, bucket: &str, key: &str, data: impl Into<Bytes>) {
        let data = data.into();
        let etag = format!("\"{}\"", hex::encode(part_md5(&data)));
        self.objects
            .write()
            .insert((bucket.to_string(), key.to_string()), StoredObject { data, etag });
    }

    /// Read a whole object back, if present.
    pub fn get_object(&self, bucket: &str, key: &str) -> Option<Bytes> {
        self.objects
            .read()
            .get(&(bucket.to_string(), key.to_string()))
            .map(|o| o.data.clone())
    }

    /// ETag of a finalized object, if present.
    pub fn object_etag(&self, bucket: &str, key: &str) -> Option<String> {
        self.objects
            .read()
            .get(&(bucket.to_string(), key.to_string()))
            .map(|o| o.etag.clone())
    }

    pub fn object_exists(&self, bucket: &str, key: &str) -> bool {
        self.objects
            .read()
            .contains_key(&(bucket.to_string(), key.to_string()))
    }

    /// Number of in-progress uploads (all buckets).
    pub fn open_upload_count(&self) -> usize {
        self.uploads.read().len()
    }

    fn next_upload_id(&self) -> String {
        let counter = self.id_counter.fetch_add(1, Ordering::SeqCst);
        format!("upload-{counter:08x}")
    }

    /// Strictly increasing initiation timestamps so "latest upload" selection
    /// is deterministic even when two uploads are created back to back.
    fn next_initiated(&self) -> DateTime<Utc> {
        let counter = self.id_counter.load(Ordering::SeqCst) as i64;
        Utc::now() + Duration::microseconds(counter)
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn get_range(
        &self,
        bucket: &str,
        key: &str,
        offset: u64,
        length: u64,
    ) -> Result<Bytes, StorageError> {
        let objects = self.objects.read();
        let object = objects
            .get(&(bucket.to_string(), key.to_string()))
            .ok_or_else(|| StorageError::NotFound(format!("{bucket}/{key}")))?;

        let len = object.data.len() as u64;
        if offset >= len {
            return Err(StorageError::S3(format!(
                "range start {offset} beyond object size {len}"
            )));
        }
        // S3 clamps ranges that run past the end of the object
        let end = (offset + length).min(len);
        Ok(object.data.slice(offset as usize..end as usize))
    }

    async fn list_objects(
        &self,
        bucket: &str,
        prefix: &str,
    ) -> Result<Vec<ObjectEntry>, StorageError> {
        let objects = self.objects.read();
        let mut entries: Vec<ObjectEntry> = objects
            .iter()
            .filter(|((b, k), _)| b == bucket && k.starts_with(prefix))
            .map(|((_, k), o)| ObjectEntry {
                key: k.clone(),
                size: o.data.len() as u64,
            })
            .collect();
        entries.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(entries)
    }

    async fn create_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        _storage_class: Option<&str>,
    ) -> Result<String, StorageError> {
        let upload_id = self.next_upload_id();
        let upload = MultipartUpload {
            bucket: bucket.to_string(),
            key: key.to_string(),
            initiated: self.next_initiated(),
            parts: HashMap::new(),
        };
        self.uploads.write().insert(upload_id.clone(), upload);
        Ok(upload_id)
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
        if !(1..=10000).contains(&part_number) {
            return Err(StorageError::InvalidPart(format!(
                "part number {part_number} out of range"
            )));
        }

        let md5_raw = part_md5(&body);
        // The destination verifies Content-MD5 exactly as S3 does
        if content_md5(&md5_raw) != content_md5_header {
            return Err(StorageError::InvalidPart(format!(
                "Content-MD5 mismatch on part {part_number}"
            )));
        }

        let mut uploads = self.uploads.write();
        let upload = uploads
            .get_mut(upload_id)
            .filter(|u| u.bucket == bucket && u.key == key)
            .ok_or_else(|| StorageError::NoSuchUpload(upload_id.to_string()))?;

        // Overwrite semantics: re-uploading the same part number replaces it
        upload.parts.insert(
            part_number,
            PartData {
                md5_hex: hex::encode(md5_raw),
                md5_raw,
                data: body,
            },
        );

        Ok(())
    }

    async fn list_multipart_uploads(
        &self,
        bucket: &str,
        key_prefix: &str,
    ) -> Result<Vec<UploadRecord>, StorageError> {
        let uploads = self.uploads.read();
        let mut records: Vec<UploadRecord> = uploads
            .iter()
            .filter(|(_, u)| u.bucket == bucket && u.key.starts_with(key_prefix))
            .map(|(id, u)| UploadRecord {
                key: u.key.clone(),
                upload_id: id.clone(),
                initiated: u.initiated,
            })
            .collect();
        records.sort_by(|a, b| a.key.cmp(&b.key).then(a.initiated.cmp(&b.initiated)));
        Ok(records)
    }

    async fn list_parts(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
    ) -> Result<Vec<PartRecord>, StorageError> {
        let uploads = self.uploads.read();
        let upload = uploads
            .get(upload_id)
            .filter(|u| u.bucket == bucket && u.key == key)
            .ok_or_else(|| StorageError::NoSuchUpload(upload_id.to_string()))?;

        let mut records: Vec<PartRecord> = upload
            .parts
            .iter()
            .map(|(&num, pd)| PartRecord {
                part_number: num,
                etag: format!("\"{}\"", pd.md5_hex),
                size: pd.data.len() as u64,
            })
            .collect();
        records.sort_by_key(|p| p.part_number);
        Ok(records)
    }

    async fn complete_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPartRecord],
    ) -> Result<String, StorageError> {
        let mut uploads = self.uploads.write();
        let upload = uploads
            .get(upload_id)
            .filter(|u| u.bucket == bucket && u.key == key)
            .ok_or_else(|| StorageError::NoSuchUpload(upload_id.to_string()))?;

        if parts.is_empty() {
            return Err(StorageError::InvalidPart(
                "at least one part is required".to_string(),
            ));
        }

        // Ascending part-number order is mandatory
        for window in parts.windows(2) {
            if window[0].part_number >= window[1].part_number {
                return Err(StorageError::InvalidPart("part order".to_string()));
            }
        }

        let mut md5_concat = Vec::with_capacity(parts.len() * 16);
        let mut assembled = BytesMut::new();

        for requested in parts {
            let part = upload.parts.get(&requested.part_number).ok_or_else(|| {
                StorageError::InvalidPart(format!(
                    "part {} has not been uploaded",
                    requested.part_number
                ))
            })?;
            if requested.etag.trim_matches('"') != part.md5_hex {
                return Err(StorageError::InvalidPart(format!(
                    "ETag mismatch for part {}",
                    requested.part_number
                )));
            }
            md5_concat.extend_from_slice(&part.md5_raw);
            assembled.extend_from_slice(&part.data);
        }

        // S3-compatible multipart ETag: MD5(concat of part MD5 raw bytes)-N
        let final_md5 = Md5::digest(&md5_concat);
        let etag = format!("\"{}-{}\"", hex::encode(final_md5), parts.len());

        self.objects.write().insert(
            (bucket.to_string(), key.to_string()),
            StoredObject {
                data: assembled.freeze(),
                etag: etag.clone(),
            },
        );
        uploads.remove(upload_id);

        Ok(etag)
    }

    async fn abort_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
    ) -> Result<(), StorageError> {
        let mut uploads = self.uploads.write();
        uploads
            .get(upload_id)
            .filter(|u| u.bucket == bucket && u.key == key)
            .ok_or_else(|| StorageError::NoSuchUpload(upload_id.to_string()))?;
        uploads.remove(upload_id);
        Ok(())
    }

    async fn delete_object(&self, bucket: &str, key: &str) -> Result<(), StorageError> {
        // S3 delete is idempotent; deleting a missing key succeeds
        self.objects
            .write()
            .remove(&(bucket.to_string(), key.to_string()));
        Ok(())
    }
}
