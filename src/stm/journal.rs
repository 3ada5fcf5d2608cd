//! The journal object for keeping undo logs
//!
//! A journal consists of one or more pages, each providing a fixed number
//! of log slots (`PAGE_LOG_SLOTS`). Pages are allocated from the pool heap
//! and chained newest-first from the `journal_head` word in the pool
//! header, so a journal left behind by a crash is found again on the next
//! open and rolled back before anything else touches the pool.
//!
//! Rollback replays slots newest-first: the head page from its last slot
//! backwards, then the next page, and so on. Commit performs the deferred
//! frees and then releases every page and scratch block.

use crate::alloc::heap::Heap;
use crate::stm::log::*;

/// Number of log slots per journal page
pub const PAGE_LOG_SLOTS: usize = 128;

/// Allocator type number of journal pages
pub const JOURNAL_TYPE_NUM: u32 = 10;

/// Allocator type number of data-log scratch blocks
pub const LOG_SCRATCH_TYPE_NUM: u32 = 11;

/// One page of the journal chain
#[repr(C)]
pub struct JournalPage {
    /// Payload offset of the next (older) page, 0 if none
    pub next: u64,
    /// Number of occupied slots
    pub len: u64,
    pub slots: [LogSlot; PAGE_LOG_SLOTS],
}

/// A view of the journal rooted at the `journal_head` word at `head_off`
///
/// Like [`Heap`], this is a borrowed view into the mapping, created on
/// demand by the pool binding.
#[derive(Clone, Copy)]
pub struct Journal {
    base: *mut u8,
    head_off: u64,
    heap: Heap,
}

impl Journal {
    pub(crate) fn new(base: *mut u8, head_off: u64, heap: Heap) -> Self {
        Journal { base, head_off, heap }
    }

    #[inline]
    fn head(&self) -> &mut u64 {
        unsafe { &mut *(self.base.add(self.head_off as usize) as *mut u64) }
    }

    #[inline]
    unsafe fn page(&self, off: u64) -> &mut JournalPage {
        &mut *(self.base.add(off as usize) as *mut JournalPage)
    }

    /// True if no transaction left logs behind
    pub fn is_empty(&self) -> bool {
        *self.head() == 0
    }

    /// Appends a log slot, growing the chain by a page when needed
    ///
    /// Page allocation bypasses the transactional wrappers: journal pages
    /// are torn down by commit, rollback, and recovery alike, so they log
    /// nothing about themselves.
    pub fn write(&self, slot: LogSlot) -> crate::err::Result<()> {
        let head = *self.head();
        let page_off = if head == 0 || unsafe { self.page(head).len } as usize == PAGE_LOG_SLOTS {
            let off = self.heap.zalloc(std::mem::size_of::<JournalPage>(), JOURNAL_TYPE_NUM)?;
            unsafe {
                let p = self.page(off);
                p.next = head;
                p.len = 0;
            }
            *self.head() = off;
            off
        } else {
            head
        };
        unsafe {
            let p = self.page(page_off);
            p.slots[p.len as usize] = slot;
            p.len += 1;
        }
        Ok(())
    }

    /// Reverts every logged change, newest first
    pub fn rollback(&self) {
        let mut off = *self.head();
        while off != 0 {
            let p = unsafe { self.page(off) };
            for i in (0..p.len as usize).rev() {
                p.slots[i].rollback(self.base, &self.heap);
            }
            off = p.next;
        }
    }

    /// Performs the deferred frees recorded for commit
    pub fn commit(&self) {
        let mut off = *self.head();
        while off != 0 {
            let p = unsafe { self.page(off) };
            for i in 0..p.len as usize {
                p.slots[i].commit(&self.heap);
            }
            off = p.next;
        }
    }

    /// Releases scratch blocks and pages and clears the chain
    pub fn clear(&self) {
        let mut off = *self.head();
        while off != 0 {
            let next = {
                let p = unsafe { self.page(off) };
                for i in 0..p.len as usize {
                    p.slots[i].clear(&self.heap);
                }
                p.next
            };
            self.heap.free(off);
            off = next;
        }
        *self.head() = 0;
    }

    /// Number of live log slots, for diagnostics
    pub fn log_count(&self) -> usize {
        let mut n = 0;
        let mut off = *self.head();
        while off != 0 {
            let p = unsafe { self.page(off) };
            n += p.len as usize;
            off = p.next;
        }
        n
    }
}
