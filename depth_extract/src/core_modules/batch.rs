// THEORY:
// A `FrameBatch` is the temporal analogue of a spatial chunk: a contiguous slice
// of a recording processed as one unit. Batching bounds memory, and it is what
// makes temporal filters possible at all, since they need a stack of frames
// rather than a single one.
//
// Key architectural principles:
// 1.  **Lookback Overlap**: Every batch after the first starts `chunk_overlap`
//     frames before its nominal start. Those leading frames exist only to warm up
//     the stateful stages and are discarded before writing (`offset`).
// 2.  **Exact Cover**: The retained ranges of all batches tile `[0, total)` with
//     no gaps and no duplicates.
// 3.  **Data Container**: Like `Chunk`, a batch is a dumb description of indices.
//     It does not read or own frames.

use std::ops::Range;

/// A half-open range of frame indices plus the number of leading warm-up frames.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameBatch {
    /// Position of this batch in the partition.
    pub index: usize,
    /// First frame read for this batch, including the lookback frames.
    pub start: usize,
    /// One past the last frame of this batch.
    pub end: usize,
    /// Leading frames of the result that are discarded before writing.
    pub offset: usize,
}

impl FrameBatch {
    /// Partitions `[0, total)` into batches of `chunk_size` nominal frames, each
    /// batch after the first reaching back `chunk_overlap` frames.
    pub fn partition(total: usize, chunk_size: usize, chunk_overlap: usize) -> Vec<FrameBatch> {
        if chunk_size == 0 {
            return Vec::new();
        }
        (0..total.div_ceil(chunk_size))
            .map(|index| {
                let nominal_start = index * chunk_size;
                let offset = if index == 0 { 0 } else { chunk_overlap.min(nominal_start) };
                FrameBatch {
                    index,
                    start: nominal_start - offset,
                    end: (nominal_start + chunk_size).min(total),
                    offset,
                }
            })
            .collect()
    }

    /// Number of frames read for this batch.
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.end == self.start
    }

    /// Every frame read for this batch.
    pub fn frames(&self) -> Range<usize> {
        self.start..self.end
    }

    /// The frames this batch writes.
    pub fn retained(&self) -> Range<usize> {
        self.start + self.offset..self.end
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_batch_has_no_offset() {
        let batches = FrameBatch::partition(20, 10, 2);
        assert_eq!(batches[0], FrameBatch { index: 0, start: 0, end: 10, offset: 0 });
        assert_eq!(batches[1], FrameBatch { index: 1, start: 8, end: 20, offset: 2 });
    }

    #[test]
    fn later_batches_trim_exactly_the_overlap() {
        let batches = FrameBatch::partition(1000, 64, 7);
        for batch in &batches[1..] {
            assert_eq!(batch.offset, 7);
            assert_eq!(batch.retained().start, batch.index * 64);
        }
    }

    #[test]
    fn retained_ranges_tile_the_recording() {
        for (total, chunk, overlap) in [(20, 10, 2), (23, 10, 2), (7, 10, 3), (101, 9, 0), (50, 5, 4)] {
            let mut seen = vec![0usize; total];
            for batch in FrameBatch::partition(total, chunk, overlap) {
                for i in batch.retained() {
                    seen[i] += 1;
                }
            }
            assert!(seen.iter().all(|&count| count == 1), "{total}/{chunk}/{overlap}: {seen:?}");
        }
    }

    #[test]
    fn remainder_batch_is_short() {
        let batches = FrameBatch::partition(23, 10, 2);
        assert_eq!(batches.len(), 3);
        let last = batches.last().unwrap();
        assert_eq!(last.frames(), 18..23);
        assert_eq!(last.retained(), 20..23);
    }

    #[test]
    fn empty_recording_has_no_batches() {
        assert!(FrameBatch::partition(0, 10, 2).is_empty());
    }
}
