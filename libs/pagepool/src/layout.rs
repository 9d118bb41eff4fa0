//! Segment Layout
//!
//! The on-disk/in-memory shape of one pool segment, described explicitly and
//! validated at attach time rather than recomputed ad hoc by every mapper:
//!
//! ```text
//! ┌────────────────┬──────────────────────────────┬───────────────────────┐
//! │ SegmentHeader  │ stack region                 │ page payload region   │
//! │ (32 bytes)     │ head, level, slots[capacity] │ capacity × page_size  │
//! └────────────────┴──────────────────────────────┴───────────────────────┘
//! ```
//!
//! Both variable regions start on a cache-line boundary. Capacity and page
//! size are fixed at creation; a segment is never resized.

use crate::{PoolError, Result};
use zerocopy::{AsBytes, FromBytes, FromZeroes};

/// First word of every segment
pub const SEGMENT_MAGIC: u32 = 0x5746_5050; // "WFPP"

/// Bumped whenever the segment shape changes incompatibly
pub const LAYOUT_VERSION: u32 = 1;

const CACHE_LINE: usize = 64;

/// Fixed-size segment header, written once at creation and checked by every
/// attach. Field order keeps the struct free of padding.
#[repr(C)]
#[derive(Debug, Clone, Copy, AsBytes, FromBytes, FromZeroes)]
pub struct SegmentHeader {
    pub magic: u32,
    pub version: u32,
    pub pool: u32,
    pub capacity: u32,
    pub page_size: u32,
    pub reserved: u32,
    pub total_size: u64,
}

impl SegmentHeader {
    pub const SIZE: usize = 32;

    pub fn new(pool: u32, capacity: u32, page_size: u32, total_size: u64) -> Self {
        Self {
            magic: SEGMENT_MAGIC,
            version: LAYOUT_VERSION,
            pool,
            capacity,
            page_size,
            reserved: 0,
            total_size,
        }
    }

    /// Reject segments we did not write or cannot interpret
    pub fn validate(&self, mapped_len: usize) -> Result<()> {
        if self.magic != SEGMENT_MAGIC {
            return Err(PoolError::layout(format!(
                "bad magic: expected {SEGMENT_MAGIC:#010x}, got {:#010x}",
                self.magic
            )));
        }
        if self.version != LAYOUT_VERSION {
            return Err(PoolError::layout(format!(
                "unsupported layout version {} (want {LAYOUT_VERSION})",
                self.version
            )));
        }
        if self.capacity == 0 || self.page_size == 0 {
            return Err(PoolError::layout("zero capacity or page size"));
        }

        let expected = SegmentLayout::new(self.capacity, self.page_size).total_size();
        if self.total_size != expected as u64 || mapped_len < expected {
            return Err(PoolError::layout(format!(
                "size mismatch: header claims {}, layout needs {expected}, mapping holds {mapped_len}",
                self.total_size
            )));
        }
        Ok(())
    }
}

/// Byte offsets of every region for a given capacity/page-size pair
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentLayout {
    pub capacity: u32,
    pub page_size: u32,
}

const fn align_up(offset: usize, align: usize) -> usize {
    (offset + align - 1) & !(align - 1)
}

impl SegmentLayout {
    pub fn new(capacity: u32, page_size: u32) -> Self {
        Self {
            capacity,
            page_size,
        }
    }

    /// Start of the stack region: head word, level word, then the slot array
    pub fn stack_offset(&self) -> usize {
        align_up(SegmentHeader::SIZE, CACHE_LINE)
    }

    pub fn stack_size(&self) -> usize {
        // head + level + one link word per slot
        2 * 4 + self.capacity as usize * 4
    }

    /// Start of the page payload region
    pub fn data_offset(&self) -> usize {
        align_up(self.stack_offset() + self.stack_size(), CACHE_LINE)
    }

    /// Whole-segment size in bytes
    pub fn total_size(&self) -> usize {
        self.data_offset() + self.capacity as usize * self.page_size as usize
    }

    /// Offset of one page's payload; `number` is 1-based
    pub fn page_offset(&self, number: u32) -> usize {
        debug_assert!(number >= 1 && number <= self.capacity);
        self.data_offset() + (number as usize - 1) * self.page_size as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_is_exactly_32_bytes() {
        assert_eq!(std::mem::size_of::<SegmentHeader>(), SegmentHeader::SIZE);
    }

    #[test]
    fn regions_are_cache_line_aligned_and_disjoint() {
        let layout = SegmentLayout::new(100, 4096);
        assert_eq!(layout.stack_offset() % CACHE_LINE, 0);
        assert_eq!(layout.data_offset() % CACHE_LINE, 0);
        assert!(layout.stack_offset() >= SegmentHeader::SIZE);
        assert!(layout.data_offset() >= layout.stack_offset() + layout.stack_size());
        assert_eq!(
            layout.total_size(),
            layout.data_offset() + 100 * 4096
        );
    }

    #[test]
    fn page_offsets_do_not_overlap() {
        let layout = SegmentLayout::new(8, 512);
        for number in 1..8 {
            assert_eq!(
                layout.page_offset(number + 1) - layout.page_offset(number),
                512
            );
        }
    }

    #[test]
    fn validate_accepts_own_header() {
        let layout = SegmentLayout::new(16, 1024);
        let header = SegmentHeader::new(7, 16, 1024, layout.total_size() as u64);
        header.validate(layout.total_size()).unwrap();
    }

    #[test]
    fn validate_rejects_foreign_magic() {
        let layout = SegmentLayout::new(16, 1024);
        let mut header = SegmentHeader::new(7, 16, 1024, layout.total_size() as u64);
        header.magic = 0xdead_beef;
        assert!(header.validate(layout.total_size()).is_err());
    }

    #[test]
    fn validate_rejects_short_mapping() {
        let layout = SegmentLayout::new(16, 1024);
        let header = SegmentHeader::new(7, 16, 1024, layout.total_size() as u64);
        assert!(header.validate(layout.total_size() - 1).is_err());
    }
}
