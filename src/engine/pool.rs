//! Bounded-concurrency part worker pool
//!
//! One tokio task per part, gated by a semaphore. A shared cancellation
//! token is the stop signal: part-retry exhaustion and the per-object
//! deadline both trip it, and every suspension point races against it so
//! workers stand down without further I/O.

use crate::digest::{content_md5, part_md5, PartDigests};
use crate::planner::{PartPlan, PartRange};
use crate::storage::{ObjectStore, StorageError};
use crate::types::JobDescriptor;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Pool configuration for one object attempt
#[derive(Debug, Clone)]
pub struct TransferSettings {
    pub max_concurrency: usize,
    pub max_retry: u32,
    pub job_timeout: Duration,
    pub verify_digest_twice: bool,
}

/// Result of running the pool over one plan
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferOutcome {
    /// Every part accounted for within the deadline. The composite digest is
    /// `None` when parts were skipped in dry-run (no digest available).
    Completed { composite_etag: Option<String> },
    /// Deadline expired with parts still in flight.
    Timeout,
    /// A part exhausted its retry budget and stopped the attempt.
    PartFailed,
}

#[derive(Debug)]
enum PartStatus {
    Done,
    Skipped,
    Cancelled,
    Failed,
}

struct PartResult {
    part_number: u32,
    digest: Option<[u8; 16]>,
    status: PartStatus,
}

/// Shared state for all part workers of one attempt
struct PartContext {
    source: Arc<dyn ObjectStore>,
    destination: Arc<dyn ObjectStore>,
    job: JobDescriptor,
    upload_id: String,
    cancel: CancellationToken,
    max_retry: u32,
    completed: Mutex<HashSet<u32>>,
    total: usize,
}

enum Attempted<T> {
    Ok(T),
    Cancelled,
    Exhausted,
}

/// Retry `op` with linear backoff (`5 * attempt` seconds), checking the
/// cancellation token before each attempt and racing every await against it.
async fn with_retries<T, F, Fut>(
    cancel: &CancellationToken,
    max_retry: u32,
    what: &str,
    mut op: F,
) -> Attempted<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StorageError>>,
{
    for attempt in 1..=max_retry {
        if cancel.is_cancelled() {
            return Attempted::Cancelled;
        }
        let result = tokio::select! {
            _ = cancel.cancelled() => return Attempted::Cancelled,
            r = op() => r,
        };
        match result {
            Ok(value) => return Attempted::Ok(value),
            Err(e) => {
                warn!(what, attempt, error = %e, "part I/O failed, retrying");
                if attempt < max_retry {
                    let backoff = Duration::from_secs(5 * attempt as u64);
                    tokio::select! {
                        _ = cancel.cancelled() => return Attempted::Cancelled,
                        _ = tokio::time::sleep(backoff) => {}
                    }
                }
            }
        }
    }
    Attempted::Exhausted
}

/// Download one part, optionally re-upload it, and return its digest.
async fn run_part(ctx: Arc<PartContext>, range: PartRange, dryrun: bool) -> PartResult {
    let part_number = range.part_number;
    let cancelled = || PartResult {
        part_number,
        digest: None,
        status: PartStatus::Cancelled,
    };
    let failed = || PartResult {
        part_number,
        digest: None,
        status: PartStatus::Failed,
    };

    if ctx.cancel.is_cancelled() {
        return cancelled();
    }

    if dryrun {
        debug!(part_number, "downloading already-uploaded part for digest verification");
    } else {
        debug!(
            src = %ctx.job.src_bucket, key = %ctx.job.src_key,
            part_number, total = ctx.total, "downloading part"
        );
    }

    let body = match with_retries(&ctx.cancel, ctx.max_retry, "download", || {
        ctx.source
            .get_range(&ctx.job.src_bucket, &ctx.job.src_key, range.offset, range.length)
    })
    .await
    {
        Attempted::Ok(body) => body,
        Attempted::Cancelled => return cancelled(),
        Attempted::Exhausted => {
            warn!(part_number, "download retries exhausted, stopping object attempt");
            ctx.cancel.cancel();
            return failed();
        }
    };

    let digest = part_md5(&body);

    if !dryrun {
        let header = content_md5(&digest);
        let upload = with_retries(&ctx.cancel, ctx.max_retry, "upload", || {
            ctx.destination.upload_part(
                &ctx.job.des_bucket,
                &ctx.job.des_key,
                &ctx.upload_id,
                part_number,
                body.clone(),
                &header,
            )
        })
        .await;
        match upload {
            Attempted::Ok(()) => {}
            Attempted::Cancelled => return cancelled(),
            Attempted::Exhausted => {
                warn!(part_number, "upload retries exhausted, stopping object attempt");
                ctx.cancel.cancel();
                return failed();
            }
        }
    }

    if ctx.cancel.is_cancelled() {
        return cancelled();
    }

    let done;
    {
        let mut completed = ctx.completed.lock();
        completed.insert(part_number);
        done = completed.len();
    }
    if !dryrun {
        info!(
            des = %ctx.job.des_bucket, key = %ctx.job.des_key,
            part_number, done, total = ctx.total,
            "part complete"
        );
    }

    PartResult {
        part_number,
        digest: Some(digest),
        status: PartStatus::Done,
    }
}

/// Run the plan through the pool.
///
/// Parts listed in `already_uploaded` are skipped outright, unless digest
/// verification is on, in which case they are re-downloaded (not re-uploaded)
/// to feed the composite digest.
pub async fn transfer_parts(
    source: Arc<dyn ObjectStore>,
    destination: Arc<dyn ObjectStore>,
    job: &JobDescriptor,
    plan: &PartPlan,
    upload_id: &str,
    already_uploaded: &HashSet<u32>,
    settings: &TransferSettings,
) -> TransferOutcome {
    let cancel = CancellationToken::new();
    let semaphore = Arc::new(Semaphore::new(settings.max_concurrency));
    let ctx = Arc::new(PartContext {
        source,
        destination,
        job: job.clone(),
        upload_id: upload_id.to_string(),
        cancel: cancel.clone(),
        max_retry: settings.max_retry,
        completed: Mutex::new(HashSet::new()),
        total: plan.len(),
    });

    let mut results: Vec<PartResult> = Vec::with_capacity(plan.len());
    let mut join_set = JoinSet::new();

    for range in &plan.ranges {
        let dryrun = already_uploaded.contains(&range.part_number);
        if dryrun && !settings.verify_digest_twice {
            // Nothing to do and no digest to contribute
            results.push(PartResult {
                part_number: range.part_number,
                digest: None,
                status: PartStatus::Skipped,
            });
            continue;
        }

        let ctx = ctx.clone();
        let semaphore = semaphore.clone();
        let token = cancel.clone();
        let range = *range;
        join_set.spawn(async move {
            let _permit = tokio::select! {
                _ = token.cancelled() => {
                    return PartResult {
                        part_number: range.part_number,
                        digest: None,
                        status: PartStatus::Cancelled,
                    };
                }
                permit = semaphore.acquire_owned() => match permit {
                    Ok(p) => p,
                    Err(_) => {
                        return PartResult {
                            part_number: range.part_number,
                            digest: None,
                            status: PartStatus::Cancelled,
                        };
                    }
                },
            };
            run_part(ctx, range, dryrun).await
        });
    }

    let deadline = tokio::time::timeout(settings.job_timeout, async {
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok(result) => results.push(result),
                Err(e) => {
                    warn!(error = %e, "part worker panicked, stopping object attempt");
                    cancel.cancel();
                }
            }
        }
    })
    .await;

    if deadline.is_err() {
        warn!(
            timeout_secs = settings.job_timeout.as_secs(),
            job = %job, "deadline expired, cancelling outstanding parts"
        );
        cancel.cancel();
        // Drain so every worker observes the cancellation before we hand the
        // upload id back for the next lease
        while join_set.join_next().await.is_some() {}
        return TransferOutcome::Timeout;
    }

    if results.len() != plan.len()
        || results
            .iter()
            .any(|r| matches!(r.status, PartStatus::Failed | PartStatus::Cancelled))
    {
        return TransferOutcome::PartFailed;
    }

    info!(job = %job, parts = plan.len(), "all parts transferred");

    // Composite digest is undefined if any part was skipped in dry-run
    if results.iter().any(|r| matches!(r.status, PartStatus::Skipped)) {
        return TransferOutcome::Completed {
            composite_etag: None,
        };
    }

    let mut digests = PartDigests::new(plan.len());
    for result in &results {
        if let Some(digest) = result.digest {
            digests.set(result.part_number, digest);
        }
    }
    TransferOutcome::Completed {
        composite_etag: digests.composite(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::planner::plan_parts;
    use crate::storage::MemoryStore;

    fn job(size: u64) -> JobDescriptor {
        JobDescriptor {
            src_bucket: "src".into(),
            src_key: "data.bin".into(),
            size,
            des_bucket: "des".into(),
            des_key: "data.bin".into(),
        }
    }

    fn settings() -> TransferSettings {
        TransferSettings {
            max_concurrency: 4,
            max_retry: 2,
            job_timeout: Duration::from_secs(30),
            verify_digest_twice: false,
        }
    }

    #[tokio::test]
    async fn test_transfer_all_parts() {
        let source = Arc::new(MemoryStore::new());
        let destination = Arc::new(MemoryStore::new());
        let data: Vec<u8> = (0..100u32).flat_map(|i| i.to_le_bytes()).collect();
        source.put_object("src", "data.bin", data.clone());

        let job = job(data.len() as u64);
        let plan = plan_parts(job.size, 64);
        let upload_id = destination
            .create_multipart_upload("des", "data.bin", None)
            .await
            .unwrap();

        let outcome = transfer_parts(
            source,
            destination.clone(),
            &job,
            &plan,
            &upload_id,
            &HashSet::new(),
            &settings(),
        )
        .await;

        let TransferOutcome::Completed { composite_etag } = outcome else {
            panic!("expected completion, got {outcome:?}");
        };
        let composite = composite_etag.unwrap();
        assert!(composite.ends_with(&format!("-{}", plan.len())));

        // Every planned part is on the destination with the planned size
        let parts = destination
            .list_parts("des", "data.bin", &upload_id)
            .await
            .unwrap();
        assert_eq!(parts.len(), plan.len());
        for (record, range) in parts.iter().zip(&plan.ranges) {
            assert_eq!(record.part_number, range.part_number);
            assert_eq!(record.size, range.length);
        }
    }

    #[tokio::test]
    async fn test_already_uploaded_parts_skipped() {
        let source = Arc::new(MemoryStore::new());
        let destination = Arc::new(MemoryStore::new());
        source.put_object("src", "data.bin", vec![9u8; 300]);

        let job = job(300);
        let plan = plan_parts(300, 100);
        let upload_id = destination
            .create_multipart_upload("des", "data.bin", None)
            .await
            .unwrap();

        let outcome = transfer_parts(
            source,
            destination.clone(),
            &job,
            &plan,
            &upload_id,
            &[1u32, 2].into_iter().collect(),
            &settings(),
        )
        .await;

        // Dry-run skips leave the composite undefined
        assert_eq!(
            outcome,
            TransferOutcome::Completed {
                composite_etag: None
            }
        );
        // Only the missing part was uploaded
        let parts = destination
            .list_parts("des", "data.bin", &upload_id)
            .await
            .unwrap();
        assert_eq!(parts.len(), 1);
        assert_eq!(parts[0].part_number, 3);
    }

    #[tokio::test]
    async fn test_verify_redownloads_but_does_not_reupload() {
        let source = Arc::new(MemoryStore::new());
        let destination = Arc::new(MemoryStore::new());
        let data = vec![5u8; 200];
        source.put_object("src", "data.bin", data.clone());

        let job = job(200);
        let plan = plan_parts(200, 100);
        let upload_id = destination
            .create_multipart_upload("des", "data.bin", None)
            .await
            .unwrap();
        // Part 1 uploaded by a previous attempt
        let body = bytes::Bytes::copy_from_slice(&data[..100]);
        let d = part_md5(&body);
        destination
            .upload_part("des", "data.bin", &upload_id, 1, body, &content_md5(&d))
            .await
            .unwrap();

        let mut s = settings();
        s.verify_digest_twice = true;
        let outcome = transfer_parts(
            source,
            destination.clone(),
            &job,
            &plan,
            &upload_id,
            &[1u32].into_iter().collect(),
            &s,
        )
        .await;

        // Composite is defined because the dry-run part was re-downloaded
        let TransferOutcome::Completed { composite_etag } = outcome else {
            panic!("expected completion");
        };
        assert!(composite_etag.is_some());
        // Part 1 was not re-uploaded: still exactly two parts total
        let parts = destination
            .list_parts("des", "data.bin", &upload_id)
            .await
            .unwrap();
        assert_eq!(parts.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_download_failure_stops_attempt() {
        let source = Arc::new(MemoryStore::new());
        let destination = Arc::new(MemoryStore::new());
        // Source object missing entirely: every download fails
        let job = job(300);
        let plan = plan_parts(300, 100);
        let upload_id = destination
            .create_multipart_upload("des", "data.bin", None)
            .await
            .unwrap();

        let outcome = transfer_parts(
            source,
            destination,
            &job,
            &plan,
            &upload_id,
            &HashSet::new(),
            &settings(),
        )
        .await;
        assert_eq!(outcome, TransferOutcome::PartFailed);
    }
}
