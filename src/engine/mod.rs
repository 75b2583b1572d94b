//! Per-object transfer engine
//!
//! The state machine for one object attempt:
//! probe -> plan -> transfer -> finalize -> (verify) -> cleanup.
//! Only an [`AttemptOutcome`] escapes; every error kind inside is mapped to
//! a terminal status, and bookkeeping failures never block the transfer.

pub mod pool;
pub mod probe;

use crate::bookkeeping::BookkeepingTable;
use crate::config::Config;
use crate::digest::etag_matches;
use crate::planner::plan_parts;
use crate::storage::{CompletedPartRecord, ObjectStore};
use crate::types::{AttemptOutcome, JobDescriptor};
use pool::{TransferOutcome, TransferSettings};
use probe::DiscoveredUploads;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{info, warn};

/// Whole-object restarts allowed on composite digest mismatch.
const DIGEST_ATTEMPTS: u32 = 3;

/// Engine knobs, extracted from [`Config`] at start-up.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub chunk_size: u64,
    pub resumable_threshold: u64,
    pub max_retry: u32,
    pub max_concurrency: usize,
    pub job_timeout: Duration,
    pub verify_digest_twice: bool,
    pub storage_class: Option<String>,
    pub clean_unfinished_upload: bool,
}

impl EngineSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            chunk_size: config.chunk_size,
            resumable_threshold: config.resumable_threshold,
            max_retry: config.max_retry,
            max_concurrency: config.max_concurrency,
            job_timeout: Duration::from_secs(config.job_timeout),
            verify_digest_twice: config.verify_digest_twice,
            storage_class: if config.storage_class.is_empty() {
                None
            } else {
                Some(config.storage_class.clone())
            },
            clean_unfinished_upload: config.clean_unfinished_upload,
        }
    }
}

enum FinalizeResult {
    Completed(String),
    RaceLost,
    Failed(String),
}

/// The transfer engine: adapters plus settings, shared by reference into
/// every object attempt. No process-wide state.
pub struct Engine {
    source: Arc<dyn ObjectStore>,
    destination: Arc<dyn ObjectStore>,
    table: Arc<dyn BookkeepingTable>,
    settings: EngineSettings,
    worker_id: String,
}

impl Engine {
    pub fn new(
        source: Arc<dyn ObjectStore>,
        destination: Arc<dyn ObjectStore>,
        table: Arc<dyn BookkeepingTable>,
        settings: EngineSettings,
        worker_id: impl Into<String>,
    ) -> Self {
        Self {
            source,
            destination,
            table,
            settings,
            worker_id: worker_id.into(),
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    fn transfer_settings(&self) -> TransferSettings {
        TransferSettings {
            max_concurrency: self.settings.max_concurrency,
            max_retry: self.settings.max_retry,
            job_timeout: self.settings.job_timeout,
            verify_digest_twice: self.settings.verify_digest_twice,
        }
    }

    /// Run the object state machine for one job.
    pub async fn run_job(&self, job: &JobDescriptor) -> AttemptOutcome {
        info!(job = %job, "starting object attempt");

        // Bookkeeping start; the audit trail never blocks the transfer
        let now = chrono::Utc::now().timestamp();
        if let Err(e) = self
            .table
            .record_attempt_start(&job.identity(), &self.worker_id, now)
            .await
        {
            warn!(job = %job, error = %e, "failed to record attempt start");
        }

        // Probe for resumable state; skipped for small objects where the
        // probe costs more than re-uploading
        let mut discovered = if job.size > self.settings.resumable_threshold {
            probe::discover_uploads(self.destination.as_ref(), &job.des_bucket, &job.des_key).await
        } else {
            DiscoveredUploads::default()
        };

        // Debug path: force a fresh upload by aborting everything open for
        // this key
        if self.settings.clean_unfinished_upload && !discovered.is_empty() {
            warn!(
                job = %job,
                count = discovered.all_ids().len(),
                "clean_unfinished_upload set, aborting open uploads for this key"
            );
            for upload_id in discovered.all_ids() {
                if let Err(e) = self
                    .destination
                    .abort_multipart_upload(&job.des_bucket, &job.des_key, &upload_id)
                    .await
                {
                    warn!(job = %job, upload_id = %upload_id, error = %e, "failed to abort upload");
                }
            }
            discovered.clear();
        }

        let stale_ids = discovered.stale_ids();

        let outcome = 'attempts: {
            for digest_attempt in 1..=DIGEST_ATTEMPTS {
                // Adopt the latest discovered upload, or initiate a fresh one
                let (upload_id, already_uploaded) = match discovered.latest() {
                    Some(record) => {
                        info!(job = %job, upload_id = %record.upload_id, "resuming unfinished upload");
                        let parts = probe::completed_parts(
                            self.destination.as_ref(),
                            &job.des_bucket,
                            &job.des_key,
                            &record.upload_id,
                        )
                        .await;
                        (record.upload_id.clone(), parts)
                    }
                    None => match self.initiate_upload(job).await {
                        Ok(upload_id) => (upload_id, HashSet::new()),
                        Err(reason) => break 'attempts AttemptOutcome::err(reason),
                    },
                };

                let plan = plan_parts(job.size, self.settings.chunk_size);

                let transfer = pool::transfer_parts(
                    self.source.clone(),
                    self.destination.clone(),
                    job,
                    &plan,
                    &upload_id,
                    &already_uploaded,
                    &self.transfer_settings(),
                )
                .await;

                let composite = match transfer {
                    // The upload id stays open and discoverable for the next
                    // lease; no finalize, no cleanup
                    TransferOutcome::Timeout => return AttemptOutcome::Timeout,
                    TransferOutcome::PartFailed => {
                        break 'attempts AttemptOutcome::err("part transfer exhausted retries")
                    }
                    TransferOutcome::Completed { composite_etag } => composite_etag,
                };

                let etag = match self.finalize(job, &upload_id, plan.len()).await {
                    FinalizeResult::Completed(etag) => etag,
                    FinalizeResult::RaceLost => {
                        break 'attempts AttemptOutcome::err(
                            "another worker already finalized this object",
                        )
                    }
                    FinalizeResult::Failed(reason) => break 'attempts AttemptOutcome::err(reason),
                };
                info!(job = %job, etag = %etag, "finalized multipart upload");

                match composite {
                    Some(computed) if self.settings.verify_digest_twice => {
                        if etag_matches(&etag, &computed) {
                            info!(job = %job, etag = %etag, "composite digest verified");
                            break 'attempts AttemptOutcome::Done { etag };
                        }
                        warn!(
                            job = %job,
                            destination = %etag,
                            computed = %computed,
                            attempt = digest_attempt,
                            "composite digest mismatch, deleting destination object"
                        );
                        if let Err(e) = self
                            .destination
                            .delete_object(&job.des_bucket, &job.des_key)
                            .await
                        {
                            warn!(job = %job, error = %e, "failed to delete mismatched object");
                        }
                        // Discard the handle and restart with a fresh upload
                        discovered.clear();
                    }
                    _ => break 'attempts AttemptOutcome::Done { etag },
                }
            }
            AttemptOutcome::err(format!(
                "composite digest mismatch after {DIGEST_ATTEMPTS} attempts"
            ))
        };

        // Housekeeping: abort leftovers from earlier dead attempts. The
        // adopted upload is never touched here.
        self.cleanup_stale(job, &stale_ids).await;

        outcome
    }

    /// Initiate a fresh multipart upload with the configured storage class.
    async fn initiate_upload(&self, job: &JobDescriptor) -> Result<String, String> {
        for attempt in 1..=3u32 {
            match self
                .destination
                .create_multipart_upload(
                    &job.des_bucket,
                    &job.des_key,
                    self.settings.storage_class.as_deref(),
                )
                .await
            {
                Ok(upload_id) => {
                    info!(job = %job, upload_id = %upload_id, "created multipart upload");
                    return Ok(upload_id);
                }
                Err(e) => {
                    warn!(job = %job, attempt, error = %e, "failed to create multipart upload");
                    if attempt < 3 {
                        sleep(Duration::from_secs(5 * attempt as u64)).await;
                    }
                }
            }
        }
        Err("failed to create multipart upload".to_string())
    }

    /// Gather the destination's part list and submit complete-multipart.
    ///
    /// `NoSuchUpload` at either step means another worker finalized the same
    /// object concurrently; this attempt loses the race and must not retry.
    async fn finalize(
        &self,
        job: &JobDescriptor,
        upload_id: &str,
        expected_parts: usize,
    ) -> FinalizeResult {
        let mut listed = None;
        for attempt in 1..=self.settings.max_retry {
            match self
                .destination
                .list_parts(&job.des_bucket, &job.des_key, upload_id)
                .await
            {
                Ok(parts) => {
                    listed = Some(parts);
                    break;
                }
                Err(e) if e.is_no_such_upload() => {
                    warn!(job = %job, "upload id gone at finalize, likely a duplicated job");
                    return FinalizeResult::RaceLost;
                }
                Err(e) => {
                    warn!(job = %job, attempt, error = %e, "failed to list parts for finalize");
                    if attempt < self.settings.max_retry {
                        sleep(Duration::from_secs(5 * attempt as u64)).await;
                    }
                }
            }
        }
        let Some(mut parts) = listed else {
            return FinalizeResult::Failed("failed to list parts for finalize".to_string());
        };

        if parts.len() != expected_parts {
            return FinalizeResult::Failed(format!(
                "uploaded part count {} does not match plan length {}",
                parts.len(),
                expected_parts
            ));
        }

        parts.sort_by_key(|p| p.part_number);
        let completed: Vec<CompletedPartRecord> = parts
            .into_iter()
            .map(|p| CompletedPartRecord {
                part_number: p.part_number,
                etag: p.etag,
            })
            .collect();

        for attempt in 1..=self.settings.max_retry {
            match self
                .destination
                .complete_multipart_upload(&job.des_bucket, &job.des_key, upload_id, &completed)
                .await
            {
                Ok(etag) => return FinalizeResult::Completed(etag),
                Err(e) if e.is_no_such_upload() => {
                    warn!(job = %job, "upload id gone at complete, likely a duplicated job");
                    return FinalizeResult::RaceLost;
                }
                Err(e) => {
                    warn!(job = %job, attempt, error = %e, "failed to complete multipart upload");
                    if attempt < self.settings.max_retry {
                        sleep(Duration::from_secs(5 * attempt as u64)).await;
                    }
                }
            }
        }
        FinalizeResult::Failed("failed to complete multipart upload".to_string())
    }

    /// Abort upload ids discovered during probe but not adopted.
    async fn cleanup_stale(&self, job: &JobDescriptor, stale_ids: &[String]) {
        for upload_id in stale_ids {
            match self
                .destination
                .abort_multipart_upload(&job.des_bucket, &job.des_key, upload_id)
                .await
            {
                Ok(()) => info!(job = %job, upload_id = %upload_id, "aborted stale upload"),
                Err(e) => {
                    warn!(job = %job, upload_id = %upload_id, error = %e, "failed to abort stale upload")
                }
            }
        }
    }
}
