//! Persistent memory pool binding
//!
//! A pool is a file mapped read-write into the process. The binding owns
//! the mapping and provides everything the memory manager builds on:
//! object-id translation, typed block allocation, the transaction
//! machinery (begin/commit/abort plus `snapshot_range`), and the durability
//! points. Durability uses `msync` through the mapping, the mapping-file
//! flavor of cache-line write-back.
//!
//! A pool has a single mutator: none of this is thread-safe, by design.

use crate::alloc::heap::{Heap, HeapState};
use crate::err::{Error, Result};
use crate::stm::journal::{Journal, JOURNAL_TYPE_NUM, LOG_SCRATCH_TYPE_NUM};
use crate::stm::log::LogSlot;
use crate::utils::{align16, rand64};
use memmap::MmapMut;
use std::cell::{Cell, RefCell};
use std::fs::OpenOptions;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

/// Layout signature stamped into every pool file
pub const POOL_SIGNATURE: &[u8; 16] = b"pmemobj-rs-0001\0";

/// Default pool memory size to be used while creating a new pool
pub const DEFAULT_POOL_SIZE: u64 = 8 * 1024 * 1024;

/// Smallest pool file `create` accepts
pub const MIN_POOL_SIZE: u64 = 1024 * 1024;

/// An opaque persistent pointer: the pool UUID and a byte offset
///
/// `OID_NULL` denotes "no object". `DUMMY_OID` is reserved as the
/// tombstone of the dictionary and set tables; it can never be produced by
/// the allocator because no payload lives below the pool header.
#[repr(C)]
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct Oid {
    pub pool: u64,
    pub off: u64,
}

/// The null object-id
pub const OID_NULL: Oid = Oid { pool: 0, off: 0 };

/// The tombstone object-id used by dict and set tables
pub const DUMMY_OID: Oid = Oid { pool: 0, off: 10 };

impl Oid {
    #[inline]
    pub fn is_null(&self) -> bool {
        *self == OID_NULL
    }

    #[inline]
    pub fn is_dummy(&self) -> bool {
        *self == DUMMY_OID
    }
}

/// The fixed-offset pool root structure
#[repr(C)]
pub struct PoolHeader {
    pub signature: [u8; 16],
    pub uuid_lo: u64,
    pub size: u64,
    /// Persistent list of class names; indices are type codes
    pub type_table: Oid,
    /// The user-visible root object
    pub root_object: Oid,
    /// Hidden slot: array of interned singleton OIDs
    pub singletons: Oid,
    /// Offset of the newest journal page, 0 when no transaction is open
    pub journal_head: u64,
    /// 1 iff the last close was clean
    pub clean_shutdown: u8,
    pub _pad: [u8; 7],
    pub heap: HeapState,
}

/// An open, mapped pool file
pub struct PoolBase {
    path: PathBuf,
    map: MmapMut,
    base: *mut u8,
    size: u64,
    tx_depth: Cell<u32>,
    tx_tainted: Cell<bool>,
    /// Ranges already covered by a data log of the running transaction
    snapshots: RefCell<Vec<(u64, u64)>>,
}

impl PoolBase {
    /// Creates and formats a new pool file
    pub fn create<P: AsRef<Path>>(path: P, pool_size: u64, mode: u32) -> Result<PoolBase> {
        if pool_size < MIN_POOL_SIZE {
            return Err(Error::InvalidArgument(format!(
                "pool size {} below minimum {}",
                pool_size, MIN_POOL_SIZE
            )));
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .mode(mode)
            .open(path.as_ref())?;
        file.set_len(pool_size)?;
        let mut map = unsafe { MmapMut::map_mut(&file)? };
        let base = map.as_mut_ptr();

        let pool = PoolBase {
            path: path.as_ref().to_path_buf(),
            map,
            base,
            size: pool_size,
            tx_depth: Cell::new(0),
            tx_tainted: Cell::new(false),
            snapshots: RefCell::new(Vec::new()),
        };

        let uuid = loop {
            let u = rand64();
            if u != 0 {
                break u;
            }
        };
        let h = pool.header();
        h.signature = *POOL_SIGNATURE;
        h.uuid_lo = uuid;
        h.size = pool_size;
        h.type_table = OID_NULL;
        h.root_object = OID_NULL;
        h.singletons = OID_NULL;
        h.journal_head = 0;
        h.clean_shutdown = 0;
        let start = align16(std::mem::size_of::<PoolHeader>() as u64);
        pool.heap().init(start, pool_size);
        pool.flush_all()?;
        Ok(pool)
    }

    /// Maps an existing pool file and replays a torn transaction, if any
    pub fn open<P: AsRef<Path>>(path: P) -> Result<PoolBase> {
        let file = OpenOptions::new().read(true).write(true).open(path.as_ref())?;
        let len = file.metadata()?.len();
        let mut map = unsafe { MmapMut::map_mut(&file)? };
        let base = map.as_mut_ptr();

        let pool = PoolBase {
            path: path.as_ref().to_path_buf(),
            map,
            base,
            size: len,
            tx_depth: Cell::new(0),
            tx_tainted: Cell::new(false),
            snapshots: RefCell::new(Vec::new()),
        };

        let h = pool.header();
        if &h.signature != POOL_SIGNATURE {
            return Err(Error::Corruption(format!(
                "{} is not a pool file (bad layout signature)",
                pool.path.display()
            )));
        }
        if h.size > len {
            return Err(Error::Corruption(format!(
                "pool claims {} bytes but the file holds {}",
                h.size, len
            )));
        }

        pool.heap().rebuild_free_list();

        // A non-empty journal means the last process died mid-transaction.
        let journal = pool.journal();
        if !journal.is_empty() {
            crate::trace!(Magenta, "RECOVER", "rolling back {} logs", journal.log_count());
            journal.rollback();
            journal.clear();
            pool.heap().rebuild_free_list();
            pool.flush_all()?;
        }
        Ok(pool)
    }

    /// The file this pool is mapped from
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[inline]
    pub(crate) fn header(&self) -> &mut PoolHeader {
        unsafe { &mut *(self.base as *mut PoolHeader) }
    }

    /// UUID distinguishing this pool's OIDs
    #[inline]
    pub fn uuid(&self) -> u64 {
        self.header().uuid_lo
    }

    #[inline]
    pub(crate) fn heap(&self) -> Heap {
        let state_off = &self.header().heap as *const HeapState as u64 - self.base as u64;
        Heap::new(self.base, state_off)
    }

    #[inline]
    pub(crate) fn journal(&self) -> Journal {
        let head_off = &self.header().journal_head as *const u64 as u64 - self.base as u64;
        Journal::new(self.base, head_off, self.heap())
    }

    /// Translates a pool offset to a direct pointer
    #[inline]
    pub fn direct(&self, off: u64) -> *mut u8 {
        debug_assert!(off < self.size, "offset 0x{:x} out of pool", off);
        unsafe { self.base.add(off as usize) }
    }

    /// Translates a direct pointer back to a pool offset
    #[inline]
    pub fn off_of<T: ?Sized>(&self, p: *const T) -> u64 {
        let addr = p as *const u8 as u64;
        debug_assert!(
            addr >= self.base as u64 && addr < self.base as u64 + self.size,
            "pointer {:p} outside the mapping",
            p
        );
        addr - self.base as u64
    }

    /// Flushes a byte range of the mapping to media
    pub fn flush_range(&self, off: u64, len: u64) -> Result<()> {
        self.map.flush_range(off as usize, len as usize)?;
        Ok(())
    }

    /// Flushes the whole mapping
    pub fn flush_all(&self) -> Result<()> {
        self.map.flush()?;
        Ok(())
    }

    /// True while a transaction is open and not aborted
    #[inline]
    pub fn in_tx(&self) -> bool {
        self.tx_depth.get() > 0 && !self.tx_tainted.get()
    }

    /// True while any transaction nesting level is open
    #[inline]
    pub fn tx_active(&self) -> bool {
        self.tx_depth.get() > 0
    }

    /// Opens a transaction, joining the running one if any
    pub fn tx_begin(&self) {
        let depth = self.tx_depth.get();
        if depth == 0 {
            debug_assert!(self.journal().is_empty(), "stale journal at begin");
            self.snapshots.borrow_mut().clear();
            self.tx_tainted.set(false);
        }
        self.tx_depth.set(depth + 1);
    }

    /// Commits one nesting level; the outermost commit publishes
    pub fn tx_commit(&self) -> Result<()> {
        let depth = self.tx_depth.get();
        if depth == 0 {
            return Err(Error::Usage("commit without a running transaction"));
        }
        if self.tx_tainted.get() {
            self.tx_depth.set(depth - 1);
            if depth == 1 {
                self.tx_tainted.set(false);
            }
            return Err(Error::Usage("commit inside an aborted transaction"));
        }
        if depth > 1 {
            self.tx_depth.set(depth - 1);
            return Ok(());
        }
        crate::trace!(White, "COMMIT", "{} logs", self.journal().log_count());

        // Data must be durable before the undo log disappears.
        self.flush_all()?;
        let journal = self.journal();
        journal.commit();
        journal.clear();
        self.flush_all()?;
        self.tx_depth.set(0);
        self.snapshots.borrow_mut().clear();
        Ok(())
    }

    /// Aborts the whole joined transaction
    ///
    /// The rollback runs at the first abort; enclosing levels observe the
    /// transaction as tainted until the nest unwinds. Returns whether this
    /// call performed the rollback.
    pub fn tx_abort(&self) -> Result<bool> {
        let depth = self.tx_depth.get();
        if depth == 0 {
            return Err(Error::Usage("abort without a running transaction"));
        }
        let mut rolled = false;
        if !self.tx_tainted.get() {
            crate::trace!(White, "ROLLBACK", "{} logs", self.journal().log_count());
            let journal = self.journal();
            journal.rollback();
            journal.clear();
            self.flush_all()?;
            self.tx_tainted.set(true);
            self.snapshots.borrow_mut().clear();
            rolled = true;
        }
        self.tx_depth.set(depth - 1);
        if depth == 1 {
            self.tx_tainted.set(false);
        }
        Ok(rolled)
    }

    /// Enrolls `off..off+len` in the undo log of the running transaction
    ///
    /// A range already covered by a log of this transaction is skipped:
    /// the existing pre-image captures any later write within it.
    pub fn snapshot_range(&self, off: u64, len: u64) -> Result<()> {
        if !self.in_tx() {
            return Err(Error::Usage("persistent mutation outside a transaction"));
        }
        debug_assert!(len > 0 && off + len <= self.size);
        {
            let covered = self.snapshots.borrow();
            if covered.iter().any(|&(o, l)| o <= off && off + len <= o + l) {
                return Ok(());
            }
        }
        crate::trace!(Yellow, "LOG", "({:x}..{:x}) = {}", off, off + len, len);
        let scratch = self.heap().alloc(len as usize, LOG_SCRATCH_TYPE_NUM)?;
        unsafe {
            std::ptr::copy_nonoverlapping(
                self.direct(off),
                self.direct(scratch),
                len as usize,
            );
        }
        self.flush_range(scratch, len)?;
        self.journal().write(LogSlot::data(off, scratch, len))?;
        self.snapshots.borrow_mut().push((off, len));
        Ok(())
    }

    /// Allocates a typed block inside the running transaction
    ///
    /// The allocation is dropped if the transaction aborts.
    pub fn alloc(&self, size: usize, type_num: u32) -> Result<u64> {
        if !self.in_tx() {
            return Err(Error::Usage("allocation outside a transaction"));
        }
        debug_assert!(type_num != JOURNAL_TYPE_NUM && type_num != LOG_SCRATCH_TYPE_NUM);
        let off = self.heap().alloc(size, type_num)?;
        crate::trace!(White, "ALLOC", "{} bytes at {:x} (type {})", size, off, type_num);
        self.journal().write(LogSlot::drop_on_abort(off, size as u64))?;
        Ok(off)
    }

    /// Allocates a zeroed typed block inside the running transaction
    pub fn zalloc(&self, size: usize, type_num: u32) -> Result<u64> {
        let off = self.alloc(size, type_num)?;
        unsafe {
            std::ptr::write_bytes(self.direct(off), 0, self.heap().payload_size(off));
        }
        Ok(off)
    }

    /// Frees a block inside the running transaction
    ///
    /// The free is deferred to commit so that an abort keeps the block.
    pub fn free(&self, off: u64) -> Result<()> {
        if !self.in_tx() {
            return Err(Error::Usage("free outside a transaction"));
        }
        crate::trace!(White, "FREE", "block at {:x}", off);
        let len = self.heap().payload_size(off) as u64;
        self.journal().write(LogSlot::drop_on_commit(off, len))?;
        Ok(())
    }

    /// Frees a block immediately, bypassing the journal
    ///
    /// Only the recovery sweep uses this; it never runs inside a
    /// transaction.
    pub(crate) fn free_now(&self, off: u64) {
        debug_assert!(!self.in_tx());
        self.heap().free(off);
    }
}
