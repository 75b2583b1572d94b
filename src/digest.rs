//! Composite digest bookkeeping for multipart uploads.
//!
//! S3 reports a multipart object's ETag as `md5(concat(part_md5s))-N`. By
//! hashing each part as it flows through the worker pool we can reconstruct
//! that value independently and compare it against the destination after
//! finalize.

use md5::{Digest, Md5};

/// One MD5 digest per part, indexed by `part_number - 1`.
///
/// Slots stay empty for parts skipped in dry-run; a single empty slot makes
/// the composite digest undefined for the attempt.
#[derive(Debug, Clone)]
pub struct PartDigests {
    slots: Vec<Option<[u8; 16]>>,
}

impl PartDigests {
    pub fn new(parts: usize) -> Self {
        Self {
            slots: vec![None; parts],
        }
    }

    pub fn set(&mut self, part_number: u32, digest: [u8; 16]) {
        self.slots[(part_number - 1) as usize] = Some(digest);
    }

    /// Composite ETag over all parts, or `None` when any slot is missing.
    pub fn composite(&self) -> Option<String> {
        let mut concat = Vec::with_capacity(self.slots.len() * 16);
        for slot in &self.slots {
            concat.extend_from_slice(&(*slot)?);
        }
        let full = Md5::digest(&concat);
        Some(format!("{}-{}", hex::encode(full), self.slots.len()))
    }
}

/// MD5 of one part body, as raw bytes.
pub fn part_md5(body: &[u8]) -> [u8; 16] {
    Md5::digest(body).into()
}

/// Base64 Content-MD5 header value for a part digest.
pub fn content_md5(digest: &[u8; 16]) -> String {
    use base64::Engine;
    base64::engine::general_purpose::STANDARD.encode(digest)
}

/// Compare two ETags ignoring surrounding quotes.
pub fn etag_matches(a: &str, b: &str) -> bool {
    a.trim_matches('"') == b.trim_matches('"')
}
