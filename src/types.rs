//! Core types for the migration engine: job descriptors, queue message
//! shapes, and attempt outcomes.

use serde::{Deserialize, Serialize};
use std::fmt;

/// One unit of work: copy a single object from source to destination.
///
/// Wire names match the queue message format produced by the job producer
/// and consumed across the worker fleet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobDescriptor {
    #[serde(rename = "Src_bucket")]
    pub src_bucket: String,
    #[serde(rename = "Src_key")]
    pub src_key: String,
    #[serde(rename = "Size")]
    pub size: u64,
    #[serde(rename = "Des_bucket")]
    pub des_bucket: String,
    #[serde(rename = "Des_key")]
    pub des_key: String,
}

impl JobDescriptor {
    /// Bookkeeping identity key shared by every attempt on this object.
    pub fn identity(&self) -> String {
        format!("{}/{}", self.src_bucket, self.src_key)
    }
}

impl fmt::Display for JobDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{} -> {}/{} ({} bytes)",
            self.src_bucket, self.src_key, self.des_bucket, self.des_key, self.size
        )
    }
}

/// Join a destination prefix and a source key with POSIX path semantics:
/// an empty prefix leaves the key untouched.
pub fn join_key(prefix: &str, key: &str) -> String {
    let prefix = prefix.trim_end_matches('/');
    if prefix.is_empty() {
        key.to_string()
    } else {
        format!("{}/{}", prefix, key)
    }
}

/// A queue message body, parsed at the queue boundary.
///
/// Messages arrive in two shapes: the canonical job descriptor written by
/// the producer, or an S3 event notification delivered when a bucket
/// notification feeds the queue directly. The engine only ever sees
/// [`JobDescriptor`] values.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum QueueMessage {
    Job(JobDescriptor),
    Event(S3EventNotification),
}

/// S3 bucket-notification envelope (the fields we consume).
#[derive(Debug, Deserialize)]
pub struct S3EventNotification {
    #[serde(rename = "Records")]
    pub records: Vec<EventRecord>,
}

#[derive(Debug, Deserialize)]
pub struct EventRecord {
    pub s3: Option<S3Entity>,
}

#[derive(Debug, Deserialize)]
pub struct S3Entity {
    pub bucket: BucketEntity,
    pub object: ObjectEntity,
}

#[derive(Debug, Deserialize)]
pub struct BucketEntity {
    pub name: String,
}

#[derive(Debug, Deserialize)]
pub struct ObjectEntity {
    pub key: String,
    pub size: u64,
}

impl QueueMessage {
    /// Parse a raw message body.
    pub fn parse(body: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(body)
    }

    /// Normalize into canonical job descriptors.
    ///
    /// Event-notification records get the configured default destination
    /// bucket and key prefix, and their keys are URL-decoded (`+` is a
    /// space in S3 event keys). Zero-size entries are dropped; callers
    /// acknowledge the message without engaging the engine.
    pub fn into_jobs(self, des_bucket_default: &str, des_prefix_default: &str) -> Vec<JobDescriptor> {
        match self {
            QueueMessage::Job(job) => {
                if job.size == 0 {
                    return Vec::new();
                }
                vec![job]
            }
            QueueMessage::Event(event) => event
                .records
                .into_iter()
                .filter_map(|record| record.s3)
                .filter(|entity| entity.object.size > 0)
                .map(|entity| {
                    let src_key = decode_event_key(&entity.object.key);
                    JobDescriptor {
                        src_bucket: entity.bucket.name,
                        des_bucket: des_bucket_default.to_string(),
                        des_key: join_key(des_prefix_default, &src_key),
                        src_key,
                        size: entity.object.size,
                    }
                })
                .collect(),
        }
    }
}

/// S3 event keys are URL-encoded with `+` for spaces.
fn decode_event_key(key: &str) -> String {
    let plus_decoded = key.replace('+', " ");
    urlencoding::decode(&plus_decoded)
        .map(|cow| cow.into_owned())
        .unwrap_or(plus_decoded)
}

/// Terminal status of one attempt, as recorded in bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TerminalStatus {
    Done,
    Timeout,
    Err,
}

impl TerminalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TerminalStatus::Done => "DONE",
            TerminalStatus::Timeout => "TIMEOUT",
            TerminalStatus::Err => "ERR",
        }
    }
}

impl fmt::Display for TerminalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of one object state-machine attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptOutcome {
    /// Finalized on the destination; carries the destination-reported ETag.
    Done { etag: String },
    /// Deadline expired; the upload id is left open for the next lease.
    Timeout,
    /// Unrecoverable for this attempt.
    Err { reason: String },
}

impl AttemptOutcome {
    pub fn status(&self) -> TerminalStatus {
        match self {
            AttemptOutcome::Done { .. } => TerminalStatus::Done,
            AttemptOutcome::Timeout => TerminalStatus::Timeout,
            AttemptOutcome::Err { .. } => TerminalStatus::Err,
        }
    }

    pub fn err(reason: impl Into<String>) -> Self {
        AttemptOutcome::Err {
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_direct_job() {
        let body = r#"{
            "Src_bucket": "legacy-data",
            "Src_key": "genomes/chr1.fa",
            "Size": 262144000,
            "Des_bucket": "archive",
            "Des_key": "mirrored/genomes/chr1.fa"
        }"#;
        let jobs = QueueMessage::parse(body)
            .unwrap()
            .into_jobs("unused", "unused");
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].src_bucket, "legacy-data");
        assert_eq!(jobs[0].des_key, "mirrored/genomes/chr1.fa");
        assert_eq!(jobs[0].identity(), "legacy-data/genomes/chr1.fa");
    }

    #[test]
    fn test_parse_event_notification() {
        let body = r#"{
            "Records": [
                {"s3": {"bucket": {"name": "ingest"}, "object": {"key": "new+folder/report%3A2024.pdf", "size": 1024}}}
            ]
        }"#;
        let jobs = QueueMessage::parse(body).unwrap().into_jobs("archive", "mirrored");
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].src_bucket, "ingest");
        assert_eq!(jobs[0].src_key, "new folder/report:2024.pdf");
        assert_eq!(jobs[0].des_bucket, "archive");
        assert_eq!(jobs[0].des_key, "mirrored/new folder/report:2024.pdf");
    }

    #[test]
    fn test_zero_size_dropped() {
        let body = r#"{
            "Records": [
                {"s3": {"bucket": {"name": "ingest"}, "object": {"key": "folder/", "size": 0}}}
            ]
        }"#;
        let jobs = QueueMessage::parse(body).unwrap().into_jobs("archive", "");
        assert!(jobs.is_empty());

        let body = r#"{"Src_bucket": "a", "Src_key": "k", "Size": 0, "Des_bucket": "b", "Des_key": "k"}"#;
        let jobs = QueueMessage::parse(body).unwrap().into_jobs("", "");
        assert!(jobs.is_empty());
    }

    #[test]
    fn test_malformed_message_rejected() {
        assert!(QueueMessage::parse("not json").is_err());
        assert!(QueueMessage::parse(r#"{"hello": "world"}"#).is_err());
    }

    #[test]
    fn test_join_key() {
        assert_eq!(join_key("", "a/b.bin"), "a/b.bin");
        assert_eq!(join_key("mirrored", "a/b.bin"), "mirrored/a/b.bin");
        assert_eq!(join_key("mirrored/", "a/b.bin"), "mirrored/a/b.bin");
    }

    #[test]
    fn test_attempt_outcome_status() {
        assert_eq!(
            AttemptOutcome::Done { etag: "x".into() }.status(),
            TerminalStatus::Done
        );
        assert_eq!(AttemptOutcome::Timeout.status(), TerminalStatus::Timeout);
        assert_eq!(AttemptOutcome::err("boom").status(), TerminalStatus::Err);
        assert_eq!(TerminalStatus::Timeout.as_str(), "TIMEOUT");
    }
}
