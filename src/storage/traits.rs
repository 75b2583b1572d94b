//! Object store trait definitions

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use thiserror::Error;

/// Errors that can occur during object store operations
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Object not found: {0}")]
    NotFound(String),

    #[error("No such upload: {0}")]
    NoSuchUpload(String),

    #[error("Invalid part: {0}")]
    InvalidPart(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("S3 error: {0}")]
    S3(String),

    #[error("Storage error: {0}")]
    Other(String),
}

impl StorageError {
    /// True when the destination reports the upload id as gone, the
    /// concurrent-completion race signal.
    pub fn is_no_such_upload(&self) -> bool {
        matches!(self, StorageError::NoSuchUpload(_))
    }
}

/// A listed object
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectEntry {
    pub key: String,
    pub size: u64,
}

/// An in-progress multipart upload discovered on the destination
#[derive(Debug, Clone)]
pub struct UploadRecord {
    pub key: String,
    pub upload_id: String,
    pub initiated: DateTime<Utc>,
}

/// One already-uploaded part of an in-progress upload
#[derive(Debug, Clone)]
pub struct PartRecord {
    pub part_number: u32,
    pub etag: String,
    pub size: u64,
}

/// Part identity submitted to complete-multipart
#[derive(Debug, Clone)]
pub struct CompletedPartRecord {
    pub part_number: u32,
    pub etag: String,
}

/// Abstract S3-like object store.
///
/// This trait is object-safe and shared behind `Arc<dyn ObjectStore>` by all
/// part workers of an object; implementations must be safe for concurrent
/// use. Listing operations paginate internally and return complete results.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Ranged read of `[offset, offset + length)` from one object.
    async fn get_range(
        &self,
        bucket: &str,
        key: &str,
        offset: u64,
        length: u64,
    ) -> Result<Bytes, StorageError>;

    /// List all objects under a prefix, fully paginated.
    async fn list_objects(&self, bucket: &str, prefix: &str) -> Result<Vec<ObjectEntry>, StorageError>;

    /// Initiate a multipart upload; returns the upload id.
    async fn create_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        storage_class: Option<&str>,
    ) -> Result<String, StorageError>;

    /// Upload one part with its Content-MD5 integrity header.
    async fn upload_part(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        part_number: u32,
        body: Bytes,
        content_md5: &str,
    ) -> Result<(), StorageError>;

    /// List in-progress multipart uploads whose key starts with `key_prefix`,
    /// fully paginated.
    async fn list_multipart_uploads(
        &self,
        bucket: &str,
        key_prefix: &str,
    ) -> Result<Vec<UploadRecord>, StorageError>;

    /// List already-uploaded parts of one upload id, fully paginated.
    async fn list_parts(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
    ) -> Result<Vec<PartRecord>, StorageError>;

    /// Merge the parts into the final object; returns the destination ETag.
    async fn complete_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPartRecord],
    ) -> Result<String, StorageError>;

    /// Abort one in-progress upload, discarding its parts.
    async fn abort_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
    ) -> Result<(), StorageError>;

    /// Delete one object.
    async fn delete_object(&self, bucket: &str, key: &str) -> Result<(), StorageError>;
}
