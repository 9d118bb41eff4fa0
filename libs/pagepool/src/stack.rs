//! Lock-Free Free-Page Stack
//!
//! A Treiber-style free list over the slot array of a mapped segment. Each
//! slot stores either the index of the next free slot, the nil sentinel
//! terminating the chain, or the taken marker while its page is out on loan.
//! `head` names the first free slot. The chain invariant: following `head`
//! through slot links visits every currently-free slot exactly once and ends
//! at nil; a popped slot is marked taken and unreachable from `head` until
//! pushed back.
//!
//! The `level` counter is advisory only. It is updated outside the
//! compare-and-swap and is eventually consistent; nothing correctness-bearing
//! may read it.

use std::fmt;
use std::sync::atomic::{AtomicI32, AtomicU32, Ordering};

/// End-of-chain sentinel stored in slot links and `head`
const NIL: u32 = u32::MAX;

/// Marker stored in a slot whose page is currently popped
const TAKEN: u32 = u32::MAX - 1;

/// Identifies one pool instance; pages from different pools never mix
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PoolId(pub u32);

impl fmt::Display for PoolId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pool-{}", self.0)
    }
}

/// Capability for one page: {pool, 1-based page number}; number zero means
/// "no page". Holding a set PageId entitles the holder to the page bytes and
/// obligates a later push.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PageId {
    pub pool: PoolId,
    pub number: u32,
}

impl PageId {
    /// The "no page" value for a pool
    pub fn none(pool: PoolId) -> Self {
        Self { pool, number: 0 }
    }

    pub fn is_set(&self) -> bool {
        self.number != 0
    }
}

impl fmt::Display for PageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_set() {
            write!(f, "{}/page-{}", self.pool, self.number)
        } else {
            write!(f, "{}/none", self.pool)
        }
    }
}

/// The atomic stack region of one mapped segment.
///
/// Holds raw pointers into the mapping; the owning [`crate::PagePool`] keeps
/// the mapping alive for as long as this exists.
pub struct PageStack {
    pool: PoolId,
    capacity: u32,
    head: *const AtomicU32,
    level: *const AtomicI32,
    slots: *const AtomicU32,
}

// SAFETY: every word behind these pointers is atomic and the region is
// shared across processes by design; &self access is as safe as the atomics.
unsafe impl Send for PageStack {}
unsafe impl Sync for PageStack {}

impl PageStack {
    /// Overlay an existing, already-initialized stack region.
    ///
    /// # Safety
    /// `base` must point at a stack region of exactly `capacity` slots laid
    /// out as head word, level word, slot array, all within a live mapping
    /// that outlives the returned value.
    pub unsafe fn attach(pool: PoolId, capacity: u32, base: *mut u8) -> Self {
        debug_assert!(capacity > 0 && capacity < TAKEN);
        let words = base as *const AtomicU32;
        Self {
            pool,
            capacity,
            head: words,
            level: words.add(1) as *const AtomicI32,
            slots: words.add(2),
        }
    }

    /// Initialize a freshly created stack region: every slot linked into one
    /// free chain ending at nil, head at the front, level full.
    ///
    /// # Safety
    /// Same layout requirements as [`PageStack::attach`]; additionally no
    /// other process may touch the region until this returns.
    pub unsafe fn init(pool: PoolId, capacity: u32, base: *mut u8) -> Self {
        let stack = Self::attach(pool, capacity, base);
        for index in 0..capacity {
            let next = if index + 1 < capacity { index + 1 } else { NIL };
            stack.slot(index).store(next, Ordering::Relaxed);
        }
        stack.head().store(0, Ordering::Relaxed);
        stack.level().store(capacity as i32, Ordering::Release);
        stack
    }

    fn head(&self) -> &AtomicU32 {
        // SAFETY: pointer validity guaranteed by the attach contract
        unsafe { &*self.head }
    }

    fn level(&self) -> &AtomicI32 {
        // SAFETY: pointer validity guaranteed by the attach contract
        unsafe { &*self.level }
    }

    fn slot(&self, index: u32) -> &AtomicU32 {
        debug_assert!(index < self.capacity);
        // SAFETY: index bounds checked against the fixed capacity
        unsafe { &*self.slots.add(index as usize) }
    }

    pub fn pool(&self) -> PoolId {
        self.pool
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Advisory count of free pages; eventually consistent, never exact
    pub fn level_hint(&self) -> i32 {
        self.level().load(Ordering::Relaxed)
    }

    /// Claim a free page without blocking. Returns `None` when the chain is
    /// empty at the moment of the read.
    pub fn pop(&self) -> Option<PageId> {
        let head = self.head();
        let mut observed = head.load(Ordering::Acquire);
        loop {
            if observed == NIL {
                return None;
            }
            let next = self.slot(observed).load(Ordering::Acquire);
            match head.compare_exchange_weak(
                observed,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    self.slot(observed).store(TAKEN, Ordering::Release);
                    self.level().fetch_sub(1, Ordering::Relaxed);
                    return Some(PageId {
                        pool: self.pool,
                        number: observed + 1,
                    });
                }
                // another racer moved head first; reload and retry
                Err(current) => observed = current,
            }
        }
    }

    /// Return a previously popped page to the free chain and clear the
    /// caller's capability so it cannot be used after release.
    ///
    /// Panics on capability misuse: an unset id, a foreign pool's id, an
    /// out-of-range number, or a page that is already free.
    pub fn push(&self, page: &mut PageId) {
        assert!(page.is_set(), "pushed an unset page id");
        assert_eq!(
            page.pool, self.pool,
            "page {page} pushed into foreign {}",
            self.pool
        );
        assert!(
            page.number <= self.capacity,
            "page {page} outside capacity {}",
            self.capacity
        );

        let index = page.number - 1;
        let slot = self.slot(index);
        assert_eq!(
            slot.load(Ordering::Acquire),
            TAKEN,
            "page {page} pushed while free"
        );

        let head = self.head();
        let mut observed = head.load(Ordering::Acquire);
        loop {
            slot.store(observed, Ordering::Release);
            match head.compare_exchange_weak(
                observed,
                index,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(current) => observed = current,
            }
        }
        self.level().fetch_add(1, Ordering::Relaxed);
        *page = PageId::none(self.pool);
    }
}

impl fmt::Debug for PageStack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PageStack")
            .field("pool", &self.pool)
            .field("capacity", &self.capacity)
            .field("level_hint", &self.level_hint())
            .finish()
    }
}
