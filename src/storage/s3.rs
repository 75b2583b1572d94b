//! S3 object store implementation using the AWS SDK

use super::traits::{
    CompletedPartRecord, ObjectEntry, ObjectStore, PartRecord, StorageError, UploadRecord,
};
use crate::config::S3TargetConfig;
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_credential_types::Credentials;
use aws_sdk_s3::error::{ProvideErrorMetadata, SdkError};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart, StorageClass};
use aws_sdk_s3::Client;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use tracing::debug;

/// S3 store for one side of the transfer (source or destination).
///
/// The underlying SDK client pools HTTP connections and is safe to share
/// across all part workers of an object.
pub struct S3Store {
    client: Client,
}

impl S3Store {
    /// Build a store from per-side settings, optionally with explicit
    /// credentials for the peer trust domain. `None` uses the default
    /// credential chain (instance role, env, profile).
    pub async fn new(config: &S3TargetConfig, credentials: Option<Credentials>) -> Self {
        let mut config_loader = aws_config::defaults(BehaviorVersion::latest())
            .region(aws_sdk_s3::config::Region::new(config.region.clone()));

        // Custom endpoint for MinIO or other S3-compatible vendors
        if let Some(ref ep) = config.endpoint {
            config_loader = config_loader.endpoint_url(ep);
        }

        if let Some(creds) = credentials {
            config_loader = config_loader.credentials_provider(creds);
        }

        let sdk_config = config_loader.load().await;

        let s3_config = aws_sdk_s3::config::Builder::from(&sdk_config)
            .force_path_style(config.force_path_style)
            .build();

        debug!(region = %config.region, "S3Store initialized");

        Self {
            client: Client::from_conf(s3_config),
        }
    }
}

/// Map an SDK error onto our storage error kinds via its error metadata.
/// `NoSuchUpload` must survive the mapping: it is the concurrent-completion
/// race signal the state machine branches on.
fn classify<E, R>(err: SdkError<E, R>, context: &str) -> StorageError
where
    E: ProvideErrorMetadata + std::fmt::Debug,
    R: std::fmt::Debug,
{
    match err.code() {
        Some("NoSuchUpload") => StorageError::NoSuchUpload(context.to_string()),
        Some("NoSuchKey") => StorageError::NotFound(context.to_string()),
        _ => StorageError::S3(format!("{context} failed: {err}")),
    }
}

fn to_chrono(dt: &aws_sdk_s3::primitives::DateTime) -> DateTime<Utc> {
    DateTime::from_timestamp(dt.secs(), dt.subsec_nanos()).unwrap_or_default()
}

#[async_trait]
impl ObjectStore for S3Store {
    async fn get_range(
        &self,
        bucket: &str,
        key: &str,
        offset: u64,
        length: u64,
    ) -> Result<Bytes, StorageError> {
        let range = format!("bytes={}-{}", offset, offset + length - 1);
        let response = self
            .client
            .get_object()
            .bucket(bucket)
            .key(key)
            .range(&range)
            .send()
            .await
            .map_err(|e| classify(e, &format!("get_object {bucket}/{key} {range}")))?;

        let data = response
            .body
            .collect()
            .await
            .map_err(|e| StorageError::S3(format!("failed to read response body: {e}")))?
            .into_bytes();

        debug!(bucket, key, range = %range, bytes = data.len(), "S3 ranged GET");
        Ok(data)
    }

    async fn list_objects(
        &self,
        bucket: &str,
        prefix: &str,
    ) -> Result<Vec<ObjectEntry>, StorageError> {
        let mut entries = Vec::new();
        let mut continuation_token: Option<String> = None;

        loop {
            let mut request = self
                .client
                .list_objects_v2()
                .bucket(bucket)
                .prefix(prefix)
                .max_keys(1000);

            if let Some(token) = continuation_token {
                request = request.continuation_token(token);
            }

            let response = request
                .send()
                .await
                .map_err(|e| classify(e, &format!("list_objects_v2 {bucket}/{prefix}")))?;

            if let Some(contents) = response.contents {
                for object in contents {
                    if let (Some(key), Some(size)) = (object.key, object.size) {
                        entries.push(ObjectEntry {
                            key,
                            size: size as u64,
                        });
                    }
                }
            }

            if response.is_truncated.unwrap_or(false) {
                continuation_token = response.next_continuation_token;
            } else {
                break;
            }
        }

        Ok(entries)
    }

    async fn create_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        storage_class: Option<&str>,
    ) -> Result<String, StorageError> {
        let mut request = self.client.create_multipart_upload().bucket(bucket).key(key);
        if let Some(class) = storage_class {
            request = request.storage_class(StorageClass::from(class));
        }

        let response = request
            .send()
            .await
            .map_err(|e| classify(e, &format!("create_multipart_upload {bucket}/{key}")))?;

        response
            .upload_id
            .ok_or_else(|| StorageError::S3("create_multipart_upload returned no upload id".into()))
    }

    async fn upload_part(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        part_number: u32,
        body: Bytes,
        content_md5: &str,
    ) -> Result<(), StorageError> {
        self.client
            .upload_part()
            .bucket(bucket)
            .key(key)
            .upload_id(upload_id)
            .part_number(part_number as i32)
            .content_md5(content_md5)
            .body(ByteStream::from(body))
            .send()
            .await
            .map_err(|e| classify(e, &format!("upload_part {bucket}/{key} #{part_number}")))?;

        debug!(bucket, key, part_number, "S3 part uploaded");
        Ok(())
    }

    async fn list_multipart_uploads(
        &self,
        bucket: &str,
        key_prefix: &str,
    ) -> Result<Vec<UploadRecord>, StorageError> {
        let mut records = Vec::new();
        let mut key_marker: Option<String> = None;
        let mut upload_id_marker: Option<String> = None;

        loop {
            let mut request = self
                .client
                .list_multipart_uploads()
                .bucket(bucket)
                .prefix(key_prefix)
                .max_uploads(1000);

            if let Some(marker) = key_marker.take() {
                request = request.key_marker(marker);
            }
            if let Some(marker) = upload_id_marker.take() {
                request = request.upload_id_marker(marker);
            }

            let response = request
                .send()
                .await
                .map_err(|e| classify(e, &format!("list_multipart_uploads {bucket}/{key_prefix}")))?;

            if let Some(uploads) = response.uploads {
                for upload in uploads {
                    if let (Some(key), Some(upload_id)) = (upload.key, upload.upload_id) {
                        records.push(UploadRecord {
                            key,
                            upload_id,
                            initiated: upload.initiated.as_ref().map(to_chrono).unwrap_or_default(),
                        });
                    }
                }
            }

            if response.is_truncated.unwrap_or(false) {
                key_marker = response.next_key_marker;
                upload_id_marker = response.next_upload_id_marker;
            } else {
                break;
            }
        }

        Ok(records)
    }

    async fn list_parts(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
    ) -> Result<Vec<PartRecord>, StorageError> {
        let mut records = Vec::new();
        let mut marker: Option<String> = None;

        loop {
            let mut request = self
                .client
                .list_parts()
                .bucket(bucket)
                .key(key)
                .upload_id(upload_id)
                .max_parts(1000);

            if let Some(m) = marker.take() {
                request = request.part_number_marker(m);
            }

            let response = request
                .send()
                .await
                .map_err(|e| classify(e, &format!("list_parts {bucket}/{key}")))?;

            if let Some(parts) = response.parts {
                for part in parts {
                    if let (Some(part_number), Some(etag)) = (part.part_number, part.e_tag) {
                        records.push(PartRecord {
                            part_number: part_number as u32,
                            etag,
                            size: part.size.unwrap_or(0) as u64,
                        });
                    }
                }
            }

            if response.is_truncated.unwrap_or(false) {
                marker = response.next_part_number_marker;
            } else {
                break;
            }
        }

        Ok(records)
    }

    async fn complete_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPartRecord],
    ) -> Result<String, StorageError> {
        let completed_parts: Vec<CompletedPart> = parts
            .iter()
            .map(|p| {
                CompletedPart::builder()
                    .part_number(p.part_number as i32)
                    .e_tag(&p.etag)
                    .build()
            })
            .collect();

        let response = self
            .client
            .complete_multipart_upload()
            .bucket(bucket)
            .key(key)
            .upload_id(upload_id)
            .multipart_upload(
                CompletedMultipartUpload::builder()
                    .set_parts(Some(completed_parts))
                    .build(),
            )
            .send()
            .await
            .map_err(|e| classify(e, &format!("complete_multipart_upload {bucket}/{key}")))?;

        response
            .e_tag
            .ok_or_else(|| StorageError::S3("complete_multipart_upload returned no ETag".into()))
    }

    async fn abort_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
    ) -> Result<(), StorageError> {
        self.client
            .abort_multipart_upload()
            .bucket(bucket)
            .key(key)
            .upload_id(upload_id)
            .send()
            .await
            .map_err(|e| classify(e, &format!("abort_multipart_upload {bucket}/{key}")))?;

        debug!(bucket, key, upload_id, "aborted multipart upload");
        Ok(())
    }

    async fn delete_object(&self, bucket: &str, key: &str) -> Result<(), StorageError> {
        self.client
            .delete_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| classify(e, &format!("delete_object {bucket}/{key}")))?;

        debug!(bucket, key, "S3 DELETE");
        Ok(())
    }
}
