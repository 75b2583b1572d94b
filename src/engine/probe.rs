//! Resume probe: discover resumable multipart state on the destination.
//!
//! Listing failures are never retried here. Starting fresh is always
//! correct; the probe only exists to save re-upload work.

use crate::storage::{ObjectStore, UploadRecord};
use std::collections::HashSet;
use tracing::{info, warn};

/// In-progress uploads discovered for one exact key.
#[derive(Debug, Default)]
pub struct DiscoveredUploads {
    uploads: Vec<UploadRecord>,
}

impl DiscoveredUploads {
    pub fn is_empty(&self) -> bool {
        self.uploads.is_empty()
    }

    /// The upload to adopt: the one with the latest initiation timestamp.
    pub fn latest(&self) -> Option<&UploadRecord> {
        self.uploads.iter().max_by_key(|u| u.initiated)
    }

    /// Upload ids discovered but not adopted, left over from earlier dead
    /// attempts. The state machine aborts these during cleanup.
    pub fn stale_ids(&self) -> Vec<String> {
        let adopted = self.latest().map(|u| u.upload_id.clone());
        self.uploads
            .iter()
            .filter(|u| Some(&u.upload_id) != adopted.as_ref())
            .map(|u| u.upload_id.clone())
            .collect()
    }

    /// Every discovered upload id, for the clean-unfinished-upload debug path.
    pub fn all_ids(&self) -> Vec<String> {
        self.uploads.iter().map(|u| u.upload_id.clone()).collect()
    }

    pub fn clear(&mut self) {
        self.uploads.clear();
    }
}

/// List in-progress multipart uploads for exactly `key` on the destination.
pub async fn discover_uploads(
    store: &dyn ObjectStore,
    bucket: &str,
    key: &str,
) -> DiscoveredUploads {
    match store.list_multipart_uploads(bucket, key).await {
        Ok(records) => {
            let uploads: Vec<UploadRecord> =
                records.into_iter().filter(|u| u.key == key).collect();
            if !uploads.is_empty() {
                info!(bucket, key, count = uploads.len(), "found unfinished uploads");
            }
            DiscoveredUploads { uploads }
        }
        Err(e) => {
            // No resumable state; the caller creates a fresh upload
            warn!(bucket, key, error = %e, "failed to list multipart uploads, starting fresh");
            DiscoveredUploads::default()
        }
    }
}

/// Part numbers already uploaded under `upload_id`.
///
/// Failures return an empty set: part upload is idempotent by
/// `(upload_id, part_number)` with Content-MD5, so re-uploading is safe.
pub async fn completed_parts(
    store: &dyn ObjectStore,
    bucket: &str,
    key: &str,
    upload_id: &str,
) -> HashSet<u32> {
    match store.list_parts(bucket, key, upload_id).await {
        Ok(parts) => {
            let numbers: HashSet<u32> = parts.iter().map(|p| p.part_number).collect();
            if !numbers.is_empty() {
                info!(bucket, key, uploaded = numbers.len(), "found uploaded parts");
            }
            numbers
        }
        Err(e) => {
            warn!(bucket, key, upload_id, error = %e, "failed to list parts, re-uploading all");
            HashSet::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::digest::{content_md5, part_md5};
    use crate::storage::MemoryStore;
    use bytes::Bytes;

    #[tokio::test]
    async fn test_discover_filters_exact_key() {
        let store = MemoryStore::new();
        store
            .create_multipart_upload("bucket", "data/a.bin", None)
            .await
            .unwrap();
        store
            .create_multipart_upload("bucket", "data/a.bin.bak", None)
            .await
            .unwrap();

        let discovered = discover_uploads(&store, "bucket", "data/a.bin").await;
        assert_eq!(discovered.all_ids().len(), 1);
    }

    #[tokio::test]
    async fn test_latest_upload_adopted_rest_stale() {
        let store = MemoryStore::new();
        let old = store
            .create_multipart_upload("bucket", "k", None)
            .await
            .unwrap();
        let newer = store
            .create_multipart_upload("bucket", "k", None)
            .await
            .unwrap();

        let discovered = discover_uploads(&store, "bucket", "k").await;
        assert_eq!(discovered.latest().unwrap().upload_id, newer);
        assert_eq!(discovered.stale_ids(), vec![old]);
    }

    #[tokio::test]
    async fn test_completed_parts_lists_numbers() {
        let store = MemoryStore::new();
        let upload_id = store
            .create_multipart_upload("bucket", "k", None)
            .await
            .unwrap();
        for pn in [1u32, 3] {
            let body = Bytes::from(vec![pn as u8; 10]);
            let md5 = part_md5(&body);
            store
                .upload_part("bucket", "k", &upload_id, pn, body, &content_md5(&md5))
                .await
                .unwrap();
        }

        let parts = completed_parts(&store, "bucket", "k", &upload_id).await;
        assert_eq!(parts, [1u32, 3].into_iter().collect());
    }

    #[tokio::test]
    async fn test_unknown_upload_yields_empty_set() {
        let store = MemoryStore::new();
        let parts = completed_parts(&store, "bucket", "k", "missing-id").await;
        assert!(parts.is_empty());
    }
}
