//! Pool Segments
//!
//! Creation and attachment of memory-mapped pool segments, and
//! capability-gated access to page payload bytes. One process creates the
//! segment (normally the Coordinator, before any strand registers); every
//! other process attaches and validates the header before touching a byte.

use crate::layout::{SegmentHeader, SegmentLayout};
use crate::stack::{PageId, PageStack, PoolId};
use crate::{PoolError, Result};
use memmap2::MmapMut;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use zerocopy::{AsBytes, FromBytes};

/// One attached pool segment.
///
/// The mapping is kept alive for the lifetime of the pool; the embedded
/// [`PageStack`] points into it.
pub struct PagePool {
    path: PathBuf,
    map: MmapMut,
    layout: SegmentLayout,
    stack: PageStack,
    pool: PoolId,
}

// SAFETY: all shared mutation goes through the stack's atomics; page bytes
// are only reachable through the PageId capability.
unsafe impl Send for PagePool {}
unsafe impl Sync for PagePool {}

impl PagePool {
    /// Create and initialize a new segment file, replacing any stale one.
    ///
    /// Capacity and page size are fixed forever; the segment is never
    /// resized.
    pub fn create(path: &Path, pool: PoolId, capacity: u32, page_size: u32) -> Result<Self> {
        if capacity == 0 || page_size == 0 {
            return Err(PoolError::config(format!(
                "{pool} needs nonzero capacity and page size"
            )));
        }

        let layout = SegmentLayout::new(capacity, page_size);
        let total = layout.total_size();

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .map_err(|e| PoolError::io(format!("creating segment {}", path.display()), e))?;
        file.set_len(total as u64)
            .map_err(|e| PoolError::io(format!("sizing segment {}", path.display()), e))?;

        // SAFETY: the file is freshly truncated and exclusively ours until
        // the header is published below.
        let mut map = unsafe { MmapMut::map_mut(&file) }
            .map_err(|e| PoolError::io(format!("mapping segment {}", path.display()), e))?;

        let header = SegmentHeader::new(pool.0, capacity, page_size, total as u64);
        map[..SegmentHeader::SIZE].copy_from_slice(header.as_bytes());

        // SAFETY: stack_offset is inside the mapping we just sized, and no
        // other process can have attached yet.
        let stack = unsafe {
            PageStack::init(pool, capacity, map.as_mut_ptr().add(layout.stack_offset()))
        };

        info!(
            pool = %pool,
            capacity,
            page_size,
            path = %path.display(),
            "created page pool segment"
        );

        Ok(Self {
            path: path.to_path_buf(),
            map,
            layout,
            stack,
            pool,
        })
    }

    /// Attach to an existing segment, validating its layout first
    pub fn attach(path: &Path, pool: PoolId) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| PoolError::io(format!("opening segment {}", path.display()), e))?;

        // SAFETY: shared mapping of a segment owned by this instance; all
        // cross-process mutation goes through the atomics.
        let mut map = unsafe { MmapMut::map_mut(&file) }
            .map_err(|e| PoolError::io(format!("mapping segment {}", path.display()), e))?;

        let header = SegmentHeader::read_from_prefix(&map[..])
            .ok_or_else(|| PoolError::layout("segment shorter than its header"))?;
        header.validate(map.len())?;
        if header.pool != pool.0 {
            return Err(PoolError::layout(format!(
                "segment belongs to pool-{}, expected {pool}",
                header.pool
            )));
        }

        let layout = SegmentLayout::new(header.capacity, header.page_size);
        // SAFETY: the validated header vouches for the region's shape
        let stack = unsafe {
            PageStack::attach(
                pool,
                header.capacity,
                map.as_mut_ptr().add(layout.stack_offset()),
            )
        };

        debug!(pool = %pool, path = %path.display(), "attached page pool segment");

        Ok(Self {
            path: path.to_path_buf(),
            map,
            layout,
            stack,
            pool,
        })
    }

    pub fn pool(&self) -> PoolId {
        self.pool
    }

    pub fn capacity(&self) -> u32 {
        self.layout.capacity
    }

    pub fn page_size(&self) -> u32 {
        self.layout.page_size
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Advisory free-page count; see [`PageStack::level_hint`]
    pub fn level_hint(&self) -> i32 {
        self.stack.level_hint()
    }

    /// Claim a page, or `None` when the pool is currently empty
    pub fn pop(&self) -> Option<PageId> {
        self.stack.pop()
    }

    /// Release a claimed page; clears the caller's capability.
    /// Panics on capability misuse (see [`PageStack::push`]).
    pub fn push(&self, page: &mut PageId) {
        self.stack.push(page);
    }

    /// The payload bytes of a held page.
    ///
    /// # Safety
    /// The caller must hold the (unique) popped capability for `page`;
    /// aliasing two slices for the same live page is undefined behavior, as
    /// is touching the bytes after pushing the page back.
    pub unsafe fn page_bytes_mut(&self, page: &PageId) -> &mut [u8] {
        assert!(page.is_set(), "accessed an unset page id");
        assert_eq!(page.pool, self.pool, "page {page} from foreign {}", self.pool);
        assert!(
            page.number <= self.layout.capacity,
            "page {page} outside capacity {}",
            self.layout.capacity
        );

        let offset = self.layout.page_offset(page.number);
        std::slice::from_raw_parts_mut(
            self.map.as_ptr().add(offset) as *mut u8,
            self.layout.page_size as usize,
        )
    }
}

impl std::fmt::Debug for PagePool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PagePool")
            .field("pool", &self.pool)
            .field("path", &self.path)
            .field("capacity", &self.layout.capacity)
            .field("page_size", &self.layout.page_size)
            .field("level_hint", &self.level_hint())
            .finish()
    }
}
