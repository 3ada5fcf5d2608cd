//! The memory manager: the single authority for transactions, refcounts,
//! snapshots, allocation, resurrection, primitive persistence, and type
//! codes
//!
//! Every persistent object starts with a [`PObject`] header carrying a
//! reference count and a type code. Type codes index the pool's persistent
//! type table, a [`PersistentList`] of class-name strings whose slot 0 is
//! reserved for the layout tag. The manager owns the undo-log discipline:
//! all of its helpers snapshot a range before writing it, and refuse to run
//! outside a transaction.
//!
//! Reference counts are exact between transactions: every non-null OID
//! stored in a persistent field contributes one to its target. Reaching
//! zero schedules the object on the deallocation queue, which the manager
//! drains immediately inside the enclosing transaction — children decrefs
//! may push more work, so the queue makes deep graphs iterative instead of
//! recursive.
//!
//! Crash recovery is a mark-and-sweep over the whole heap: the undo log
//! (replayed by the pool binding) rewinds torn transactions, and the sweep
//! reclaims leaked blocks and repairs stale counts, which the log cannot
//! know about.

use crate::alloc::heap::Heap;
use crate::alloc::pool::{Oid, PoolBase, DEFAULT_POOL_SIZE, OID_NULL};
use crate::dict::PersistentDict;
use crate::err::{Error, Result};
use crate::list::{PersistentList, PListObject, LIST_POBJPTR_ARRAY_TYPE_NUM};
use crate::object::{ClassEntry, PersistentClass, PersistentObject, RecordState};
use crate::set::{PersistentFrozenSet, PersistentSet, SET_POBJPTR_ARRAY_TYPE_NUM};
use crate::dict::PDICTKEYSOBJECT_TYPE_NUM;
use crate::stm::journal::{JOURNAL_TYPE_NUM, LOG_SCRATCH_TYPE_NUM};
use crate::tuple::{PersistentTuple, TUPLE_POBJPTR_ARRAY_TYPE_NUM};
use crate::value::{InternKey, Value};
use std::cell::{Cell, RefCell};
use std::collections::{HashMap, HashSet};
use std::mem;
use std::path::Path;
use std::ptr;
use std::rc::{Rc, Weak};

/// Allocator type number of object bodies (header + typed body)
pub(crate) const POBJECT_TYPE_NUM: u32 = 20;

/// Allocator type number of the hidden singleton-OID table
pub(crate) const SINGLETON_TABLE_TYPE_NUM: u32 = 70;

pub(crate) const TYPE_NONE: &str = "NoneType";
pub(crate) const TYPE_BOOL: &str = "bool";
pub(crate) const TYPE_INT: &str = "int";
pub(crate) const TYPE_FLOAT: &str = "float";
pub(crate) const TYPE_STR: &str = "str";
pub(crate) const TYPE_BYTES: &str = "bytes";
pub(crate) const TYPE_LIST: &str = "PersistentList";
pub(crate) const TYPE_DICT: &str = "PersistentDict";
pub(crate) const TYPE_SET: &str = "PersistentSet";
pub(crate) const TYPE_FROZENSET: &str = "PersistentFrozenSet";
pub(crate) const TYPE_TUPLE: &str = "PersistentTuple";

const SMALL_INT_MIN: i64 = -5;
const SMALL_INT_MAX: i64 = 256;
const SINGLETON_COUNT: usize = 3 + (SMALL_INT_MAX - SMALL_INT_MIN + 1) as usize;

/// Strings and byte literals up to this length are interned
const INTERN_MAX_LEN: usize = 64;

/// Header prefixed to every persistent object
#[repr(C)]
pub(crate) struct PObject {
    pub ob_refcnt: u64,
    pub ob_type: u32,
    pub _pad: u32,
}

/// Header of variable-size bodies (str, bytes, list, tuple)
#[repr(C)]
pub(crate) struct PVarObject {
    pub ob_base: PObject,
    pub ob_size: u64,
}

#[repr(C)]
pub(crate) struct PIntObject {
    pub ob_base: PObject,
    pub value: i64,
}

#[repr(C)]
pub(crate) struct PFloatObject {
    pub ob_base: PObject,
    pub value: f64,
}

/// What a type code dispatches to
#[derive(Clone, PartialEq, Debug)]
pub(crate) enum TypeKind {
    None,
    Bool,
    Int,
    Float,
    Str,
    Bytes,
    List,
    Dict,
    Set,
    FrozenSet,
    Tuple,
    Record(String),
}

pub(crate) fn kind_of(name: &str) -> TypeKind {
    match name {
        TYPE_NONE => TypeKind::None,
        TYPE_BOOL => TypeKind::Bool,
        TYPE_INT => TypeKind::Int,
        TYPE_FLOAT => TypeKind::Float,
        TYPE_STR => TypeKind::Str,
        TYPE_BYTES => TypeKind::Bytes,
        TYPE_LIST => TypeKind::List,
        TYPE_DICT => TypeKind::Dict,
        TYPE_SET => TypeKind::Set,
        TYPE_FROZENSET => TypeKind::FrozenSet,
        TYPE_TUPLE => TypeKind::Tuple,
        other => TypeKind::Record(other.to_string()),
    }
}

/// Report of a mark-and-sweep pass
#[derive(Debug, Default, Clone, Copy)]
pub struct GcStats {
    /// Objects reachable from the root structures
    pub live_objects: usize,
    /// Unreachable object bodies reclaimed
    pub freed_objects: usize,
    /// Orphaned auxiliary blocks (items arrays, key tables) reclaimed
    pub freed_substructures: usize,
    /// Reference counts that disagreed with the observed in-edges
    pub refcount_fixes: usize,
}

impl GcStats {
    /// True if the pass found nothing to reclaim or repair
    pub fn clean(&self) -> bool {
        self.freed_objects == 0 && self.freed_substructures == 0 && self.refcount_fixes == 0
    }
}

pub(crate) struct MmInner {
    pub(crate) pool: PoolBase,
    uuid: u64,
    debug: bool,
    closed: Cell<bool>,
    /// code -> class name, mirror of the persistent type table
    type_names: RefCell<Vec<String>>,
    /// class name -> code (slot 0, the layout tag, is not mapped)
    type_codes: RefCell<HashMap<String, u32>>,
    /// volatile class registry, seeded before open
    pub(crate) registry: HashMap<String, ClassEntry>,
    /// primitive interning: structural key -> existing OID
    intern: RefCell<HashMap<InternKey, Oid>>,
    intern_rev: RefCell<HashMap<u64, InternKey>>,
    /// resurrection cache: record OID -> shared volatile state
    pub(crate) records: RefCell<HashMap<u64, Weak<RecordState>>>,
    deallocs: RefCell<Vec<Oid>>,
    draining: Cell<bool>,
}

/// Cheaply clonable handle on the pool's memory manager
///
/// Persistent container handles each hold one of these; all state lives in
/// the shared inner value.
#[derive(Clone)]
pub struct MemoryManager {
    pub(crate) inner: Rc<MmInner>,
}

impl MemoryManager {
    fn wrap(pool: PoolBase, debug: bool, classes: Vec<ClassEntry>) -> MemoryManager {
        let uuid = pool.uuid();
        let mut registry = HashMap::new();
        for c in classes {
            registry.insert(c.name.to_string(), c);
        }
        MemoryManager {
            inner: Rc::new(MmInner {
                pool,
                uuid,
                debug,
                closed: Cell::new(false),
                type_names: RefCell::new(Vec::new()),
                type_codes: RefCell::new(HashMap::new()),
                registry,
                intern: RefCell::new(HashMap::new()),
                intern_rev: RefCell::new(HashMap::new()),
                records: RefCell::new(HashMap::new()),
                deallocs: RefCell::new(Vec::new()),
                draining: Cell::new(false),
            }),
        }
    }

    #[inline]
    pub(crate) fn pool(&self) -> &PoolBase {
        &self.inner.pool
    }

    #[inline]
    pub(crate) fn same_pool(&self, other: &MemoryManager) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    pub(crate) fn check_open(&self) -> Result<()> {
        if self.inner.closed.get() {
            Err(Error::Usage("pool is closed"))
        } else {
            Ok(())
        }
    }

    pub(crate) fn debug_checks(&self) -> bool {
        self.inner.debug
    }

    /// Wraps a pool offset into this pool's OID space
    #[inline]
    pub(crate) fn oid(&self, off: u64) -> Oid {
        Oid { pool: self.inner.uuid, off }
    }

    /// Translates an OID to a direct pointer
    #[inline]
    pub(crate) fn direct(&self, oid: Oid) -> *mut u8 {
        debug_assert_eq!(oid.pool, self.inner.uuid, "OID from a different pool");
        self.inner.pool.direct(oid.off)
    }

    // ----------------------------------------------------------------
    // transactions

    pub fn begin(&self) -> Result<()> {
        self.check_open()?;
        self.inner.pool.tx_begin();
        Ok(())
    }

    pub fn commit(&self) -> Result<()> {
        self.check_open()?;
        self.inner.pool.tx_commit()
    }

    pub fn abort(&self) -> Result<()> {
        self.check_open()?;
        if self.inner.pool.tx_abort()? {
            // The rollback may have unwound blocks the volatile caches
            // point at.
            self.inner.intern.borrow_mut().clear();
            self.inner.intern_rev.borrow_mut().clear();
            self.inner.records.borrow_mut().clear();
            self.inner.deallocs.borrow_mut().clear();
            self.reload_type_cache()?;
        }
        Ok(())
    }

    /// Runs `body` inside a transaction that commits on success and aborts
    /// when an error propagates out
    pub fn transaction<T, F: FnOnce() -> Result<T>>(&self, body: F) -> Result<T> {
        self.begin()?;
        match body() {
            Ok(v) => {
                self.commit()?;
                Ok(v)
            }
            Err(e) => {
                let _ = self.abort();
                Err(e)
            }
        }
    }

    // ----------------------------------------------------------------
    // snapshots and raw allocation

    pub(crate) fn snapshot_range(&self, off: u64, len: usize) -> Result<()> {
        self.inner.pool.snapshot_range(off, len as u64)
    }

    /// Snapshots the bytes of the object `p` points into
    pub(crate) fn snapshot<T>(&self, p: *const T) -> Result<()> {
        let off = self.inner.pool.off_of(p);
        self.snapshot_range(off, mem::size_of::<T>())
    }

    pub(crate) fn zalloc(&self, size: usize, type_num: u32) -> Result<Oid> {
        Ok(self.oid(self.inner.pool.zalloc(size, type_num)?))
    }

    pub(crate) fn free(&self, oid: Oid) -> Result<()> {
        debug_assert!(!oid.is_null() && !oid.is_dummy());
        self.inner.pool.free(oid.off)
    }

    // ----------------------------------------------------------------
    // reference counting

    pub(crate) fn incref(&self, oid: Oid) -> Result<()> {
        let p = self.direct(oid) as *mut PObject;
        unsafe {
            self.snapshot(&(*p).ob_refcnt)?;
            (*p).ob_refcnt += 1;
        }
        Ok(())
    }

    pub(crate) fn decref(&self, oid: Oid) -> Result<()> {
        let p = self.direct(oid) as *mut PObject;
        unsafe {
            self.snapshot(&(*p).ob_refcnt)?;
            debug_assert!((*p).ob_refcnt > 0, "decref of a dead object at {:x}", oid.off);
            (*p).ob_refcnt -= 1;
            if (*p).ob_refcnt == 0 {
                self.schedule_dealloc(oid)?;
            }
        }
        Ok(())
    }

    /// `decref` unless the OID is null or the tombstone
    pub(crate) fn xdecref(&self, oid: Oid) -> Result<()> {
        if oid.is_null() || oid.is_dummy() {
            Ok(())
        } else {
            self.decref(oid)
        }
    }

    fn schedule_dealloc(&self, oid: Oid) -> Result<()> {
        self.inner.deallocs.borrow_mut().push(oid);
        if self.inner.draining.get() {
            return Ok(());
        }
        self.inner.draining.set(true);
        let res = (|| loop {
            let next = self.inner.deallocs.borrow_mut().pop();
            match next {
                Some(o) => self.deallocate(o)?,
                None => return Ok(()),
            }
        })();
        self.inner.draining.set(false);
        res
    }

    /// Tears one unreachable object down: children are decref'ed, owned
    /// auxiliary blocks and the body are freed
    fn deallocate(&self, oid: Oid) -> Result<()> {
        let kind = self.type_kind_at(oid)?;
        crate::trace!(White, "DEALLOC", "{:x} ({:?})", oid.off, kind);
        match kind {
            TypeKind::List => crate::list::deallocate(self, oid)?,
            TypeKind::Tuple => crate::tuple::deallocate(self, oid)?,
            TypeKind::Dict => crate::dict::deallocate(self, oid)?,
            TypeKind::Set | TypeKind::FrozenSet => crate::set::deallocate(self, oid)?,
            TypeKind::Record(_) => crate::object::deallocate(self, oid)?,
            _ => {
                // A primitive: forget its interning slot, if any.
                if let Some(key) = self.inner.intern_rev.borrow_mut().remove(&oid.off) {
                    self.inner.intern.borrow_mut().remove(&key);
                }
            }
        }
        self.inner.records.borrow_mut().remove(&oid.off);
        self.free(oid)
    }

    // ----------------------------------------------------------------
    // type registry

    fn reload_type_cache(&self) -> Result<()> {
        let tt = self.inner.pool.header().type_table;
        if tt.is_null() {
            return Err(Error::Corruption("pool has no type table".into()));
        }
        let mut names = Vec::new();
        let body = self.direct(tt) as *const PListObject;
        unsafe {
            let len = (*body).ob_base.ob_size as usize;
            let items = self.direct((*body).ob_items) as *const Oid;
            for i in 0..len {
                names.push(self.read_str(*items.add(i))?);
            }
        }
        let mut codes = HashMap::new();
        for (i, name) in names.iter().enumerate().skip(1) {
            codes.insert(name.clone(), i as u32);
        }
        *self.inner.type_names.borrow_mut() = names;
        *self.inner.type_codes.borrow_mut() = codes;
        Ok(())
    }

    /// Returns the type code for `name`, assigning a fresh one on first use
    pub(crate) fn get_type_code(&self, name: &str) -> Result<u32> {
        if let Some(&code) = self.inner.type_codes.borrow().get(name) {
            return Ok(code);
        }
        let tt = self.type_table();
        self.transaction(|| tt.append(Value::Str(name.to_string())))?;
        let code = self.inner.type_names.borrow().len() as u32;
        self.inner.type_names.borrow_mut().push(name.to_string());
        self.inner.type_codes.borrow_mut().insert(name.to_string(), code);
        Ok(code)
    }

    pub(crate) fn type_name(&self, code: u32) -> Result<String> {
        self.inner
            .type_names
            .borrow()
            .get(code as usize)
            .cloned()
            .ok_or_else(|| Error::Corruption(format!("unknown type code {}", code)))
    }

    fn type_table(&self) -> PersistentList {
        PersistentList::from_oid(self.clone(), self.inner.pool.header().type_table)
    }

    pub(crate) fn type_kind_at(&self, oid: Oid) -> Result<TypeKind> {
        let p = self.direct(oid) as *const PObject;
        let code = unsafe { (*p).ob_type };
        Ok(kind_of(&self.type_name(code)?))
    }

    // ----------------------------------------------------------------
    // persist / resurrect

    fn singleton_oid(&self, idx: usize) -> Oid {
        debug_assert!(idx < SINGLETON_COUNT);
        let table = self.inner.pool.header().singletons;
        unsafe { *(self.direct(table) as *const Oid).add(idx) }
    }

    /// Converts a volatile value into a persistent body and returns its OID
    ///
    /// Interned values come back with their existing OID. `persist` does
    /// not incref: the caller does, once the persistent field actually
    /// points at the result.
    pub(crate) fn persist(&self, v: &Value) -> Result<Oid> {
        match v {
            Value::None => Ok(self.singleton_oid(0)),
            Value::Bool(b) => Ok(self.singleton_oid(1 + *b as usize)),
            Value::Int(i) if (SMALL_INT_MIN..=SMALL_INT_MAX).contains(i) => {
                Ok(self.singleton_oid(3 + (*i - SMALL_INT_MIN) as usize))
            }
            Value::Int(i) => self.persist_interned(InternKey::Int(*i), |mm| mm.alloc_int(*i)),
            Value::Float(f) => self.alloc_float(*f),
            Value::Str(s) if s.len() <= INTERN_MAX_LEN => {
                self.persist_interned(InternKey::Str(s.clone()), |mm| mm.alloc_str(s))
            }
            Value::Str(s) => self.alloc_str(s),
            Value::Bytes(b) if b.len() <= INTERN_MAX_LEN => {
                self.persist_interned(InternKey::Bytes(b.clone()), |mm| mm.alloc_bytes(b))
            }
            Value::Bytes(b) => self.alloc_bytes(b),
            Value::List(h) => self.own_handle(&h.mm, h.oid),
            Value::Dict(h) => self.own_handle(&h.mm, h.oid),
            Value::Set(h) => self.own_handle(&h.mm, h.oid),
            Value::FrozenSet(h) => self.own_handle(&h.mm, h.oid),
            Value::Tuple(h) => self.own_handle(&h.mm, h.oid),
            Value::Object(h) => self.own_handle(&h.mm, h.oid),
        }
    }

    fn own_handle(&self, mm: &MemoryManager, oid: Oid) -> Result<Oid> {
        if !self.same_pool(mm) {
            return Err(Error::InvalidArgument(
                "value belongs to a different pool".into(),
            ));
        }
        Ok(oid)
    }

    fn persist_interned<F: FnOnce(&MemoryManager) -> Result<Oid>>(
        &self,
        key: InternKey,
        make: F,
    ) -> Result<Oid> {
        if let Some(&oid) = self.inner.intern.borrow().get(&key) {
            return Ok(oid);
        }
        let oid = make(self)?;
        self.inner.intern.borrow_mut().insert(key.clone(), oid);
        self.inner.intern_rev.borrow_mut().insert(oid.off, key);
        Ok(oid)
    }

    fn alloc_int(&self, i: i64) -> Result<Oid> {
        let code = self.get_type_code(TYPE_INT)?;
        let oid = self.zalloc(mem::size_of::<PIntObject>(), POBJECT_TYPE_NUM)?;
        let p = self.direct(oid) as *mut PIntObject;
        unsafe {
            (*p).ob_base.ob_type = code;
            (*p).value = i;
        }
        Ok(oid)
    }

    fn alloc_bool(&self, b: bool) -> Result<Oid> {
        let code = self.get_type_code(TYPE_BOOL)?;
        let oid = self.zalloc(mem::size_of::<PIntObject>(), POBJECT_TYPE_NUM)?;
        let p = self.direct(oid) as *mut PIntObject;
        unsafe {
            (*p).ob_base.ob_type = code;
            (*p).value = b as i64;
        }
        Ok(oid)
    }

    fn alloc_float(&self, f: f64) -> Result<Oid> {
        let code = self.get_type_code(TYPE_FLOAT)?;
        let oid = self.zalloc(mem::size_of::<PFloatObject>(), POBJECT_TYPE_NUM)?;
        let p = self.direct(oid) as *mut PFloatObject;
        unsafe {
            (*p).ob_base.ob_type = code;
            (*p).value = f;
        }
        Ok(oid)
    }

    fn alloc_var_body(&self, code: u32, payload: &[u8]) -> Result<Oid> {
        let oid = self.zalloc(mem::size_of::<PVarObject>() + payload.len().max(1), POBJECT_TYPE_NUM)?;
        let p = self.direct(oid) as *mut PVarObject;
        unsafe {
            (*p).ob_base.ob_type = code;
            (*p).ob_size = payload.len() as u64;
            ptr::copy_nonoverlapping(
                payload.as_ptr(),
                (p as *mut u8).add(mem::size_of::<PVarObject>()),
                payload.len(),
            );
        }
        Ok(oid)
    }

    fn alloc_str(&self, s: &str) -> Result<Oid> {
        let code = self.get_type_code(TYPE_STR)?;
        self.alloc_var_body(code, s.as_bytes())
    }

    fn alloc_bytes(&self, b: &[u8]) -> Result<Oid> {
        let code = self.get_type_code(TYPE_BYTES)?;
        self.alloc_var_body(code, b)
    }

    pub(crate) fn read_str(&self, oid: Oid) -> Result<String> {
        let bytes = self.read_var_payload(oid);
        String::from_utf8(bytes).map_err(|_| Error::Corruption("string body is not utf-8".into()))
    }

    fn read_var_payload(&self, oid: Oid) -> Vec<u8> {
        let p = self.direct(oid) as *const PVarObject;
        unsafe {
            let len = (*p).ob_size as usize;
            let data = (p as *const u8).add(mem::size_of::<PVarObject>());
            std::slice::from_raw_parts(data, len).to_vec()
        }
    }

    /// Reconstructs the volatile handle or value for an existing body
    ///
    /// Container handles are `(manager, oid)` pairs, so resurrecting the
    /// same OID twice trivially yields the same identity; records
    /// additionally share their volatile state through the resurrection
    /// cache.
    pub(crate) fn resurrect(&self, oid: Oid) -> Result<Value> {
        if oid.is_null() {
            return Ok(Value::None);
        }
        debug_assert!(!oid.is_dummy(), "resurrect of the tombstone");
        match self.type_kind_at(oid)? {
            TypeKind::None => Ok(Value::None),
            TypeKind::Bool => {
                let p = self.direct(oid) as *const PIntObject;
                Ok(Value::Bool(unsafe { (*p).value } != 0))
            }
            TypeKind::Int => {
                let p = self.direct(oid) as *const PIntObject;
                Ok(Value::Int(unsafe { (*p).value }))
            }
            TypeKind::Float => {
                let p = self.direct(oid) as *const PFloatObject;
                Ok(Value::Float(unsafe { (*p).value }))
            }
            TypeKind::Str => Ok(Value::Str(self.read_str(oid)?)),
            TypeKind::Bytes => Ok(Value::Bytes(self.read_var_payload(oid))),
            TypeKind::List => Ok(Value::List(PersistentList::from_oid(self.clone(), oid))),
            TypeKind::Dict => Ok(Value::Dict(PersistentDict::from_oid(self.clone(), oid))),
            TypeKind::Set => Ok(Value::Set(PersistentSet::from_oid(self.clone(), oid))),
            TypeKind::FrozenSet => Ok(Value::FrozenSet(PersistentFrozenSet::from_oid(
                self.clone(),
                oid,
            ))),
            TypeKind::Tuple => Ok(Value::Tuple(PersistentTuple::from_oid(self.clone(), oid))),
            TypeKind::Record(name) => Ok(Value::Object(crate::object::resurrect_record(
                self, oid, &name,
            )?)),
        }
    }

    /// Children OIDs the object at `oid` owns, for the sweep and teardown
    pub(crate) fn traverse(&self, oid: Oid) -> Result<Vec<Oid>> {
        match self.type_kind_at(oid)? {
            TypeKind::List => crate::list::traverse(self, oid),
            TypeKind::Tuple => crate::tuple::traverse(self, oid),
            TypeKind::Dict => crate::dict::traverse(self, oid),
            TypeKind::Set | TypeKind::FrozenSet => crate::set::traverse(self, oid),
            TypeKind::Record(_) => crate::object::traverse(self, oid),
            _ => Ok(Vec::new()),
        }
    }

    /// Owned auxiliary blocks of the object at `oid`
    pub(crate) fn substructures(&self, oid: Oid) -> Result<Vec<(Oid, u32)>> {
        match self.type_kind_at(oid)? {
            TypeKind::List => crate::list::substructures(self, oid),
            TypeKind::Tuple => crate::tuple::substructures(self, oid),
            TypeKind::Dict => crate::dict::substructures(self, oid),
            TypeKind::Set | TypeKind::FrozenSet => crate::set::substructures(self, oid),
            _ => Ok(Vec::new()),
        }
    }

    // ----------------------------------------------------------------
    // root object

    pub fn root(&self) -> Result<Value> {
        self.check_open()?;
        let root = self.inner.pool.header().root_object;
        self.resurrect(root)
    }

    pub fn set_root(&self, v: &Value) -> Result<()> {
        self.check_open()?;
        self.transaction(|| {
            let oid = self.persist(v)?;
            self.incref(oid)?;
            let h = self.inner.pool.header();
            let old = h.root_object;
            self.snapshot(&h.root_object)?;
            h.root_object = oid;
            self.xdecref(old)
        })
    }

    // ----------------------------------------------------------------
    // constructors

    pub fn new_list(&self) -> Result<PersistentList> {
        self.check_open()?;
        PersistentList::new(self)
    }

    pub fn new_list_from(&self, items: &[Value]) -> Result<PersistentList> {
        self.check_open()?;
        self.transaction(|| {
            let list = PersistentList::new(self)?;
            for v in items {
                list.append(v.clone())?;
            }
            Ok(list)
        })
    }

    pub fn new_dict(&self) -> Result<PersistentDict> {
        self.check_open()?;
        PersistentDict::new(self)
    }

    pub fn new_dict_from(&self, pairs: &[(Value, Value)]) -> Result<PersistentDict> {
        self.check_open()?;
        self.transaction(|| {
            let dict = PersistentDict::new(self)?;
            for (k, v) in pairs {
                dict.set(k.clone(), v.clone())?;
            }
            Ok(dict)
        })
    }

    pub fn new_set(&self) -> Result<PersistentSet> {
        self.check_open()?;
        PersistentSet::new(self)
    }

    pub fn new_set_from(&self, items: &[Value]) -> Result<PersistentSet> {
        self.check_open()?;
        self.transaction(|| {
            let set = PersistentSet::new(self)?;
            for v in items {
                set.add(v.clone())?;
            }
            Ok(set)
        })
    }

    pub fn new_frozen_set(&self, items: &[Value]) -> Result<PersistentFrozenSet> {
        self.check_open()?;
        PersistentFrozenSet::new(self, items)
    }

    pub fn new_tuple(&self, items: &[Value]) -> Result<PersistentTuple> {
        self.check_open()?;
        PersistentTuple::new(self, items)
    }

    pub fn new_object<T: PersistentClass>(&self, args: &[Value]) -> Result<PersistentObject> {
        self.check_open()?;
        crate::object::new_record::<T>(self, args)
    }

    // ----------------------------------------------------------------
    // lifecycle

    fn bootstrap(&self) -> Result<()> {
        self.begin()?;
        let res = self.bootstrap_inner();
        match res {
            Ok(()) => self.commit(),
            Err(e) => {
                let _ = self.abort();
                Err(e)
            }
        }
    }

    fn bootstrap_inner(&self) -> Result<()> {
        // The type table is a PersistentList, so its own type code has to
        // exist before the list machinery can run: seed slot 0 with the
        // layout tag, slot 1 with "str", slot 2 with "PersistentList" by
        // hand, in first-seen order.
        let tag = String::from_utf8_lossy(crate::alloc::pool::POOL_SIGNATURE)
            .trim_end_matches('\0')
            .to_string();
        let list_code = 2u32;
        let str_code = 1u32;

        let seeds = [tag.as_str(), TYPE_STR, TYPE_LIST];
        let mut seed_oids = [OID_NULL; 3];
        for (i, s) in seeds.iter().enumerate() {
            let oid = self.zalloc(mem::size_of::<PVarObject>() + s.len().max(1), POBJECT_TYPE_NUM)?;
            let p = self.direct(oid) as *mut PVarObject;
            unsafe {
                (*p).ob_base.ob_refcnt = 1; // the table's reference
                (*p).ob_base.ob_type = str_code;
                (*p).ob_size = s.len() as u64;
                ptr::copy_nonoverlapping(
                    s.as_ptr(),
                    (p as *mut u8).add(mem::size_of::<PVarObject>()),
                    s.len(),
                );
            }
            seed_oids[i] = oid;
        }

        let tt = self.zalloc(mem::size_of::<PListObject>(), POBJECT_TYPE_NUM)?;
        let items = self.zalloc(seeds.len() * mem::size_of::<Oid>(), LIST_POBJPTR_ARRAY_TYPE_NUM)?;
        unsafe {
            let body = self.direct(tt) as *mut PListObject;
            (*body).ob_base.ob_base.ob_refcnt = 1; // the header's reference
            (*body).ob_base.ob_base.ob_type = list_code;
            (*body).ob_base.ob_size = seeds.len() as u64;
            (*body).ob_items = items;
            (*body).allocated = seeds.len() as u64;
            let slots = self.direct(items) as *mut Oid;
            for (i, oid) in seed_oids.iter().enumerate() {
                *slots.add(i) = *oid;
            }
        }

        {
            let h = self.inner.pool.header();
            self.snapshot(&h.type_table)?;
            h.type_table = tt;
        }
        *self.inner.type_names.borrow_mut() =
            vec![tag, TYPE_STR.to_string(), TYPE_LIST.to_string()];
        let mut codes = HashMap::new();
        codes.insert(TYPE_STR.to_string(), str_code);
        codes.insert(TYPE_LIST.to_string(), list_code);
        *self.inner.type_codes.borrow_mut() = codes;

        // Eager singletons: none, the booleans, and the small ints, each
        // kept alive by one reference from the hidden table.
        let mut singleton_oids = Vec::with_capacity(SINGLETON_COUNT);
        let none_code = self.get_type_code(TYPE_NONE)?;
        let none = self.zalloc(mem::size_of::<PObject>(), POBJECT_TYPE_NUM)?;
        unsafe {
            let p = self.direct(none) as *mut PObject;
            (*p).ob_refcnt = 1;
            (*p).ob_type = none_code;
        }
        singleton_oids.push(none);
        for b in &[false, true] {
            let oid = self.alloc_bool(*b)?;
            unsafe { (*(self.direct(oid) as *mut PObject)).ob_refcnt = 1 };
            singleton_oids.push(oid);
        }
        for i in SMALL_INT_MIN..=SMALL_INT_MAX {
            let oid = self.alloc_int(i)?;
            unsafe { (*(self.direct(oid) as *mut PObject)).ob_refcnt = 1 };
            singleton_oids.push(oid);
        }

        let table = self.zalloc(
            SINGLETON_COUNT * mem::size_of::<Oid>(),
            SINGLETON_TABLE_TYPE_NUM,
        )?;
        unsafe {
            let slots = self.direct(table) as *mut Oid;
            for (i, oid) in singleton_oids.iter().enumerate() {
                *slots.add(i) = *oid;
            }
        }
        let h = self.inner.pool.header();
        self.snapshot(&h.singletons)?;
        h.singletons = table;
        Ok(())
    }

    /// Mark-and-sweep over the whole heap
    ///
    /// Marks from the root block (type table, root object, singleton
    /// table), frees every unmarked block, and resets each marked object's
    /// refcount to the number of in-edges observed during the mark pass.
    pub fn gc(&self) -> Result<GcStats> {
        self.check_open()?;
        if self.inner.pool.tx_active() {
            return Err(Error::Usage("gc inside a transaction"));
        }
        self.gc_sweep()
    }

    fn gc_sweep(&self) -> Result<GcStats> {
        let heap: Heap = self.inner.pool.heap();
        let blocks: Vec<(u64, u32)> = heap.blocks().collect();

        let mut incoming: HashMap<u64, u64> = HashMap::new();
        let mut reachable_subs: HashSet<u64> = HashSet::new();
        let mut visited: HashSet<u64> = HashSet::new();
        let mut work: Vec<Oid> = Vec::new();

        let root_edge = |oid: Oid, incoming: &mut HashMap<u64, u64>, work: &mut Vec<Oid>| {
            if !oid.is_null() {
                *incoming.entry(oid.off).or_insert(0) += 1;
                work.push(oid);
            }
        };

        let h = self.inner.pool.header();
        root_edge(h.type_table, &mut incoming, &mut work);
        root_edge(h.root_object, &mut incoming, &mut work);
        if !h.singletons.is_null() {
            reachable_subs.insert(h.singletons.off);
            let slots = self.direct(h.singletons) as *const Oid;
            for i in 0..SINGLETON_COUNT {
                root_edge(unsafe { *slots.add(i) }, &mut incoming, &mut work);
            }
        }

        while let Some(oid) = work.pop() {
            if !visited.insert(oid.off) {
                continue;
            }
            for child in self.traverse(oid)? {
                debug_assert!(!child.is_dummy());
                *incoming.entry(child.off).or_insert(0) += 1;
                if !visited.contains(&child.off) {
                    work.push(child);
                }
            }
            for (sub, _tn) in self.substructures(oid)? {
                reachable_subs.insert(sub.off);
            }
        }

        let mut stats = GcStats::default();
        for (off, tn) in blocks {
            match tn {
                POBJECT_TYPE_NUM => {
                    if visited.contains(&off) {
                        stats.live_objects += 1;
                        let want = incoming[&off];
                        let p = self.inner.pool.direct(off) as *mut PObject;
                        if unsafe { (*p).ob_refcnt } != want {
                            crate::trace!(Magenta, "GC", "refcount {:x}: {} -> {}",
                                off, unsafe { (*p).ob_refcnt }, want);
                            unsafe { (*p).ob_refcnt = want };
                            stats.refcount_fixes += 1;
                        }
                    } else {
                        crate::trace!(Magenta, "GC", "freeing unreachable object {:x}", off);
                        if let Some(key) = self.inner.intern_rev.borrow_mut().remove(&off) {
                            self.inner.intern.borrow_mut().remove(&key);
                        }
                        self.inner.records.borrow_mut().remove(&off);
                        self.inner.pool.free_now(off);
                        stats.freed_objects += 1;
                    }
                }
                LIST_POBJPTR_ARRAY_TYPE_NUM
                | PDICTKEYSOBJECT_TYPE_NUM
                | TUPLE_POBJPTR_ARRAY_TYPE_NUM
                | SET_POBJPTR_ARRAY_TYPE_NUM
                | SINGLETON_TABLE_TYPE_NUM => {
                    if !reachable_subs.contains(&off) {
                        crate::trace!(Magenta, "GC", "freeing orphan substructure {:x}", off);
                        self.inner.pool.free_now(off);
                        stats.freed_substructures += 1;
                    }
                }
                JOURNAL_TYPE_NUM | LOG_SCRATCH_TYPE_NUM => {
                    // No transaction is running, so these are leftovers.
                    self.inner.pool.free_now(off);
                    stats.freed_substructures += 1;
                }
                _ => {
                    return Err(Error::Corruption(format!(
                        "block at {:x} has unknown type number {}",
                        off, tn
                    )));
                }
            }
        }
        self.inner.pool.heap().rebuild_free_list();
        self.inner.pool.flush_all()?;
        Ok(stats)
    }

    fn close(&self) -> Result<()> {
        self.check_open()?;
        if self.inner.pool.tx_active() {
            return Err(Error::Usage("close inside a transaction"));
        }
        self.transaction(|| {
            let h = self.inner.pool.header();
            self.snapshot(&h.clean_shutdown)?;
            h.clean_shutdown = 1;
            Ok(())
        })?;
        self.inner.closed.set(true);
        self.inner.intern.borrow_mut().clear();
        self.inner.intern_rev.borrow_mut().clear();
        self.inner.records.borrow_mut().clear();
        Ok(())
    }
}

// --------------------------------------------------------------------
// pool surface

/// Options accepted by [`create`](fn.create.html)
pub struct CreateOptions {
    pool_size: u64,
    mode: u32,
    debug: bool,
    classes: Vec<ClassEntry>,
}

impl Default for CreateOptions {
    fn default() -> Self {
        CreateOptions {
            pool_size: DEFAULT_POOL_SIZE,
            mode: 0o666,
            debug: false,
            classes: Vec::new(),
        }
    }
}

impl CreateOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Size of the pool file in bytes
    pub fn pool_size(mut self, size: u64) -> Self {
        self.pool_size = size;
        self
    }

    /// Permission bits of the created file
    pub fn mode(mut self, mode: u32) -> Self {
        self.mode = mode;
        self
    }

    /// Enables extra invariant checking in the containers
    pub fn debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    /// Seeds the volatile class registry with a record class
    pub fn register<T: PersistentClass>(mut self) -> Self {
        self.classes.push(ClassEntry::of::<T>());
        self
    }
}

/// Options accepted by [`open`](fn.open.html)
#[derive(Default)]
pub struct OpenOptions {
    debug: bool,
    classes: Vec<ClassEntry>,
}

impl OpenOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    pub fn register<T: PersistentClass>(mut self) -> Self {
        self.classes.push(ClassEntry::of::<T>());
        self
    }
}

/// An open persistent object pool
///
/// All mutation goes through transactions; the container operations open
/// one implicitly when none is running. Dropping the pool without calling
/// [`close`](#method.close) is equivalent to a crash: the next open will
/// roll back a torn transaction and run the recovery sweep.
pub struct ObjectPool {
    mm: MemoryManager,
}

/// Creates and formats a new pool file
pub fn create<P: AsRef<Path>>(path: P, opts: CreateOptions) -> Result<ObjectPool> {
    let pool = PoolBase::create(path, opts.pool_size, opts.mode)?;
    let mm = MemoryManager::wrap(pool, opts.debug, opts.classes);
    mm.bootstrap()?;
    Ok(ObjectPool { mm })
}

/// Opens an existing pool file, running crash recovery if needed
pub fn open<P: AsRef<Path>>(path: P, opts: OpenOptions) -> Result<ObjectPool> {
    let pool = PoolBase::open(path)?;
    let mm = MemoryManager::wrap(pool, opts.debug, opts.classes);
    mm.reload_type_cache()?;

    // Fail fast if the pool references record classes this program did
    // not register: silently losing dispatch is worse.
    for name in mm.inner.type_names.borrow().iter().skip(1) {
        if let TypeKind::Record(class) = kind_of(name) {
            if !mm.inner.registry.contains_key(&class) {
                return Err(Error::Corruption(format!(
                    "pool references unregistered class '{}'",
                    class
                )));
            }
        }
    }

    let h = mm.inner.pool.header();
    if h.clean_shutdown == 1 {
        h.clean_shutdown = 0;
        mm.inner.pool.flush_all()?;
    } else {
        crate::trace!(Magenta, "RECOVER", "unclean shutdown, sweeping");
        mm.gc_sweep()?;
    }
    Ok(ObjectPool { mm })
}

impl ObjectPool {
    /// The memory manager surface of this pool
    pub fn mm(&self) -> &MemoryManager {
        &self.mm
    }

    /// Marks the shutdown clean and detaches the pool
    pub fn close(&self) -> Result<()> {
        self.mm.close()
    }

    /// The user-visible root object, `Value::None` when unset
    pub fn root(&self) -> Result<Value> {
        self.mm.root()
    }

    /// Replaces the root object, dropping the reference to the old one
    pub fn set_root(&self, v: Value) -> Result<()> {
        self.mm.set_root(&v)
    }

    pub fn begin(&self) -> Result<()> {
        self.mm.begin()
    }

    pub fn commit(&self) -> Result<()> {
        self.mm.commit()
    }

    pub fn abort(&self) -> Result<()> {
        self.mm.abort()
    }

    pub fn transaction<T, F: FnOnce() -> Result<T>>(&self, body: F) -> Result<T> {
        self.mm.transaction(body)
    }

    pub fn new_list(&self) -> Result<PersistentList> {
        self.mm.new_list()
    }

    pub fn new_list_from(&self, items: &[Value]) -> Result<PersistentList> {
        self.mm.new_list_from(items)
    }

    pub fn new_dict(&self) -> Result<PersistentDict> {
        self.mm.new_dict()
    }

    pub fn new_dict_from(&self, pairs: &[(Value, Value)]) -> Result<PersistentDict> {
        self.mm.new_dict_from(pairs)
    }

    pub fn new_set(&self) -> Result<PersistentSet> {
        self.mm.new_set()
    }

    pub fn new_set_from(&self, items: &[Value]) -> Result<PersistentSet> {
        self.mm.new_set_from(items)
    }

    pub fn new_frozen_set(&self, items: &[Value]) -> Result<PersistentFrozenSet> {
        self.mm.new_frozen_set(items)
    }

    pub fn new_tuple(&self, items: &[Value]) -> Result<PersistentTuple> {
        self.mm.new_tuple(items)
    }

    pub fn new_object<T: PersistentClass>(&self, args: &[Value]) -> Result<PersistentObject> {
        self.mm.new_object::<T>(args)
    }

    /// Runs the mark-and-sweep pass; exposed for testing
    pub fn gc(&self) -> Result<GcStats> {
        self.mm.gc()
    }

    /// Number of live blocks in the pool, for diagnostics and tests
    pub fn allocated_blocks(&self) -> usize {
        self.mm.inner.pool.heap().allocated_blocks()
    }
}
