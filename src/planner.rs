//! Part planning: split an object size into multipart byte ranges.

use tracing::info;

/// Hard multipart part-count limit imposed by the S3 protocol.
pub const MAX_PARTS: u64 = 10_000;

/// One byte range of the plan. `part_number` starts at 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartRange {
    pub part_number: u32,
    pub offset: u64,
    pub length: u64,
}

impl PartRange {
    /// Inclusive HTTP Range header value for this part.
    pub fn http_range(&self) -> String {
        format!("bytes={}-{}", self.offset, self.offset + self.length - 1)
    }
}

/// Ordered, gap-free split of `[0, size)` into at most 10,000 parts.
#[derive(Debug, Clone)]
pub struct PartPlan {
    pub ranges: Vec<PartRange>,
    /// Part length actually used; equals the requested chunk size unless the
    /// part cap forced it upward.
    pub chunk_size: u64,
}

impl PartPlan {
    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }
}

/// Split `size` bytes into ranges of `target_chunk` bytes each.
///
/// When the requested chunk size would exceed the 10,000-part cap, the chunk
/// size is bumped to `size / 10_000 + 1024` so the plan always fits. The
/// final range holds the remainder. Deterministic for given inputs.
///
/// `size` must be positive; zero-size objects are filtered out before the
/// transfer engine.
pub fn plan_parts(size: u64, target_chunk: u64) -> PartPlan {
    debug_assert!(size > 0, "zero-size objects never reach the planner");
    debug_assert!(target_chunk > 0);

    let mut chunk = target_chunk;
    if size.div_ceil(chunk) > MAX_PARTS {
        chunk = size / MAX_PARTS + 1024;
        info!(size, chunk, "part count exceeds limit, raising chunk size");
    }

    let mut ranges = Vec::with_capacity(size.div_ceil(chunk) as usize);
    let mut offset = 0u64;
    let mut part_number = 1u32;
    while offset < size {
        let length = chunk.min(size - offset);
        ranges.push(PartRange {
            part_number,
            offset,
            length,
        });
        offset += length;
        part_number += 1;
    }

    PartPlan {
        ranges,
        chunk_size: chunk,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_single_part() {
        let plan = plan_parts(1_048_576, 5 * 1024 * 1024);
        assert_eq!(plan.len(), 1);
        assert_eq!(plan.chunk_size, 5 * 1024 * 1024);
        assert_eq!(
            plan.ranges[0],
            PartRange {
                part_number: 1,
                offset: 0,
                length: 1_048_576
            }
        );
    }

    #[test]
    fn test_exact_multiple_has_no_empty_tail() {
        let plan = plan_parts(10 * 1024, 1024);
        assert_eq!(plan.len(), 10);
        assert_eq!(plan.ranges.last().unwrap().length, 1024);
    }

    #[test]
    fn test_remainder_in_last_part() {
        let plan = plan_parts(10 * 1024 + 7, 1024);
        assert_eq!(plan.len(), 11);
        assert_eq!(plan.ranges.last().unwrap().length, 7);
        assert_eq!(plan.ranges.last().unwrap().offset, 10 * 1024);
    }

    #[test]
    fn test_part_cap_raises_chunk_size() {
        // 60 GB at 5 MiB would need 11,445 parts; the planner raises the
        // chunk to size/10000 + 1024 and lands at 9,999 parts.
        let size: u64 = 60_000_000_000;
        let plan = plan_parts(size, 5 * 1024 * 1024);
        assert_eq!(plan.chunk_size, 6_001_024);
        assert_eq!(plan.len(), 9_999);
        assert!(plan.chunk_size >= 5 * 1024 * 1024);
        for r in &plan.ranges[..plan.len() - 1] {
            assert_eq!(r.length, 6_001_024);
        }
        let last = plan.ranges.last().unwrap();
        assert_eq!(last.length, size - 9_998 * 6_001_024);
        assert_eq!(
            plan.ranges.iter().map(|r| r.length).sum::<u64>(),
            size
        );
    }

    #[test]
    fn test_http_range_is_inclusive() {
        let plan = plan_parts(100, 40);
        assert_eq!(plan.ranges[0].http_range(), "bytes=0-39");
        assert_eq!(plan.ranges[1].http_range(), "bytes=40-79");
        assert_eq!(plan.ranges[2].http_range(), "bytes=80-99");
    }

    #[test]
    fn test_determinism() {
        let a = plan_parts(123_456_789, 8 * 1024 * 1024);
        let b = plan_parts(123_456_789, 8 * 1024 * 1024);
        assert_eq!(a.ranges, b.ranges);
        assert_eq!(a.chunk_size, b.chunk_size);
    }

    proptest! {
        /// Ranges cover [0, size) exactly once, in order, within the part cap.
        #[test]
        fn prop_plan_totality(size in 1u64..1u64 << 40, chunk in 1u64..64 * 1024 * 1024) {
            let plan = plan_parts(size, chunk);

            prop_assert!(plan.len() as u64 <= MAX_PARTS);
            prop_assert!(!plan.is_empty());

            let mut expected_offset = 0u64;
            for (i, r) in plan.ranges.iter().enumerate() {
                prop_assert_eq!(r.part_number as usize, i + 1);
                prop_assert_eq!(r.offset, expected_offset);
                prop_assert!(r.length > 0);
                prop_assert!(r.length <= plan.chunk_size);
                expected_offset += r.length;
            }
            prop_assert_eq!(expected_offset, size);

            // Every part except the last is exactly one chunk.
            for r in &plan.ranges[..plan.len() - 1] {
                prop_assert_eq!(r.length, plan.chunk_size);
            }
        }

        /// The effective chunk never shrinks below the request.
        #[test]
        fn prop_chunk_never_shrinks(size in 1u64..1u64 << 40, chunk in 1u64..64 * 1024 * 1024) {
            let plan = plan_parts(size, chunk);
            prop_assert!(plan.chunk_size >= chunk);
        }
    }
}
