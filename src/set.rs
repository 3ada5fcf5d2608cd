//! Open-addressed persistent hash sets
//!
//! The table stores `(hash, key)` entries sized as a power of two, minimum
//! 64. Hash values double as slot states: `HASH_UNUSED` (0) marks an
//! empty slot and `HASH_DUMMY` (all ones) a tombstone; the stable hash
//! never produces either sentinel. Probing checks the bucket, then the
//! next `LINEAR_PROBES` slots for cache friendliness, then reperturbs.
//!
//! A frozen set shares the layout and caches its own hash in the body
//! (`HASH_INVALID` until first computed); its mutators are rejected at the
//! type surface.

use crate::alloc::pool::{Oid, OID_NULL};
use crate::err::{Error, Result};
use crate::list::PersistentList;
use crate::mm::{MemoryManager, PObject, POBJECT_TYPE_NUM, TYPE_FROZENSET, TYPE_SET};
use crate::tuple::PersistentTuple;
use crate::value::{digest_bytes, fixed_hash, Value};
use std::fmt;
use std::mem;

/// Allocator type number of set entry tables
pub(crate) const SET_POBJPTR_ARRAY_TYPE_NUM: u32 = 60;

/// Smallest table a set allocates
const PERM_SET_MINSIZE: u64 = 64;

/// Slot state: never used
const HASH_UNUSED: u64 = 0;
/// Slot state: tombstone of a discarded key
const HASH_DUMMY: u64 = u64::MAX;
/// Body state: frozen-set hash not yet computed
const HASH_INVALID: u64 = HASH_DUMMY;

/// Slots probed linearly past the bucket before reperturbing
const LINEAR_PROBES: u64 = 9;

const PERTURB_SHIFT: u32 = 5;

#[repr(C)]
pub(crate) struct PSetObject {
    pub ob_base: PObject,
    /// Active entries plus tombstones
    pub fill: u64,
    /// Active entries
    pub used: u64,
    /// Table size minus one
    pub mask: u64,
    /// Cached hash of a frozen set, `HASH_INVALID` until computed
    pub hash: u64,
    /// Search cursor reserved for pop-style operations
    pub finger: u64,
    /// OID of the entry table
    pub table: Oid,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub(crate) struct PSetEntry {
    pub hash: u64,
    pub key: Oid,
}

#[derive(Clone, Copy, PartialEq, Debug)]
enum Probe {
    Restart,
    FoundUnused(usize),
    FoundDummy(usize),
    FoundActive(usize),
}

/// Anything a set operation can take as "the other side"
pub trait ValueIterable {
    fn to_values(&self) -> Result<Vec<Value>>;
}

impl ValueIterable for [Value] {
    fn to_values(&self) -> Result<Vec<Value>> {
        Ok(self.to_vec())
    }
}

impl ValueIterable for Vec<Value> {
    fn to_values(&self) -> Result<Vec<Value>> {
        Ok(self.clone())
    }
}

impl ValueIterable for PersistentSet {
    fn to_values(&self) -> Result<Vec<Value>> {
        self.values()
    }
}

impl ValueIterable for PersistentFrozenSet {
    fn to_values(&self) -> Result<Vec<Value>> {
        self.values()
    }
}

impl ValueIterable for PersistentList {
    fn to_values(&self) -> Result<Vec<Value>> {
        self.values()
    }
}

impl ValueIterable for PersistentTuple {
    fn to_values(&self) -> Result<Vec<Value>> {
        self.values()
    }
}

// --------------------------------------------------------------------
// shared core over (manager, oid)

#[inline]
fn body_ptr(mm: &MemoryManager, oid: Oid) -> *mut PSetObject {
    mm.direct(oid) as *mut PSetObject
}

#[inline]
fn table_ptr(mm: &MemoryManager, table: Oid) -> *mut PSetEntry {
    mm.direct(table) as *mut PSetEntry
}

fn new_set_body(mm: &MemoryManager, type_name: &str) -> Result<Oid> {
    mm.transaction(|| {
        let code = mm.get_type_code(type_name)?;
        let oid = mm.zalloc(mem::size_of::<PSetObject>(), POBJECT_TYPE_NUM)?;
        let table = mm.zalloc(
            PERM_SET_MINSIZE as usize * mem::size_of::<PSetEntry>(),
            SET_POBJPTR_ARRAY_TYPE_NUM,
        )?;
        unsafe {
            let body = body_ptr(mm, oid);
            (*body).ob_base.ob_type = code;
            (*body).mask = PERM_SET_MINSIZE - 1;
            (*body).hash = HASH_INVALID;
            (*body).table = table;
        }
        Ok(oid)
    })
}

/// Places a key known to be absent into a freshly allocated table
///
/// The table never contains tombstones and no compare can run, so this
/// writes directly; the whole table is dropped if the transaction aborts.
fn insert_clean(mm: &MemoryManager, table: Oid, mask: u64, key_oid: Oid, khash: u64) {
    let ep0 = table_ptr(mm, table);
    let mut perturb = khash;
    let mut i = khash & mask;
    let found = 'outer: loop {
        unsafe {
            if (*ep0.add(i as usize)).hash == HASH_UNUSED {
                break i;
            }
            for j in i + 1..=(i + LINEAR_PROBES).min(mask) {
                if (*ep0.add(j as usize)).hash == HASH_UNUSED {
                    break 'outer j;
                }
            }
        }
        perturb >>= PERTURB_SHIFT;
        i = (i * 5 + 1 + perturb) & mask;
    };
    unsafe {
        (*ep0.add(found as usize)).hash = khash;
        (*ep0.add(found as usize)).key = key_oid;
    }
}

/// Reallocates the table to hold at least `minused` active entries
fn table_resize(mm: &MemoryManager, oid: Oid, minused: u64) -> Result<()> {
    let minused = if minused > 50000 { minused << 1 } else { minused << 2 };
    let mut newsize = PERM_SET_MINSIZE;
    while newsize <= minused {
        newsize <<= 1;
    }
    mm.transaction(|| {
        let body = body_ptr(mm, oid);
        let (oldtable, oldmask) = unsafe { ((*body).table, (*body).mask) };
        let newtable = mm.zalloc(
            newsize as usize * mem::size_of::<PSetEntry>(),
            SET_POBJPTR_ARRAY_TYPE_NUM,
        )?;
        let newmask = newsize - 1;
        let old_ep0 = table_ptr(mm, oldtable);
        for i in 0..=oldmask {
            let e = unsafe { *old_ep0.add(i as usize) };
            if e.hash == HASH_UNUSED || e.hash == HASH_DUMMY {
                continue;
            }
            insert_clean(mm, newtable, newmask, e.key, e.hash);
        }
        let body = body_ptr(mm, oid);
        unsafe {
            snapshot_body_tail(mm, body)?;
            (*body).mask = newmask;
            (*body).fill = (*body).used; // tombstones dropped on rehash
            (*body).table = newtable;
        }
        mm.free(oldtable)
    })
}

/// Snapshots the mutable tail of the set body (everything past the
/// object header)
unsafe fn snapshot_body_tail(mm: &MemoryManager, body: *mut PSetObject) -> Result<()> {
    let off = mm.pool().off_of(&(*body).fill);
    mm.snapshot_range(off, mem::size_of::<PSetObject>() - mem::size_of::<PObject>())
}

/// Finds the slot for `key`, or where an insert should put it
fn get_available_slot(mm: &MemoryManager, oid: Oid, key: &Value, khash: u64) -> Result<Probe> {
    let body = body_ptr(mm, oid);
    let (mask, table_oid) = unsafe { ((*body).mask, (*body).table) };
    let ep0 = table_ptr(mm, table_oid);
    let mut i = khash & mask;
    let mut entry = unsafe { *ep0.add(i as usize) };
    if entry.hash == HASH_UNUSED {
        return Ok(Probe::FoundUnused(i as usize));
    }
    let mut perturb = khash;
    let mut freeslot: Option<usize> = None;
    loop {
        if entry.hash == khash {
            let startkey = entry.key;
            let matched = mm.resurrect(startkey)? == *key; // compare may mutate the set
            let now = unsafe { *ep0.add(i as usize) };
            if unsafe { (*body_ptr(mm, oid)).table } != table_oid || now.key != startkey {
                return Ok(Probe::Restart);
            }
            if matched {
                return Ok(Probe::FoundActive(i as usize));
            }
        } else if entry.hash == HASH_DUMMY && freeslot.is_none() {
            freeslot = Some(i as usize);
        }
        for j in i + 1..=(i + LINEAR_PROBES).min(mask) {
            entry = unsafe { *ep0.add(j as usize) };
            if entry.hash == HASH_UNUSED {
                return Ok(match freeslot {
                    None => Probe::FoundUnused(j as usize),
                    Some(f) => Probe::FoundDummy(f),
                });
            }
            if entry.hash == khash {
                let startkey = entry.key;
                let matched = mm.resurrect(startkey)? == *key;
                let now = unsafe { *ep0.add(j as usize) };
                if unsafe { (*body_ptr(mm, oid)).table } != table_oid || now.key != startkey {
                    return Ok(Probe::Restart);
                }
                if matched {
                    return Ok(Probe::FoundActive(j as usize));
                }
            } else if entry.hash == HASH_DUMMY && freeslot.is_none() {
                freeslot = Some(j as usize);
            }
        }
        perturb >>= PERTURB_SHIFT;
        i = (i * 5 + 1 + perturb) & mask;
        entry = unsafe { *ep0.add(i as usize) };
        if entry.hash == HASH_UNUSED {
            return Ok(match freeslot {
                None => Probe::FoundUnused(i as usize),
                Some(f) => Probe::FoundDummy(f),
            });
        }
    }
}

fn add_impl(mm: &MemoryManager, oid: Oid, key: &Value) -> Result<()> {
    let khash = fixed_hash(key)?;
    mm.transaction(|| {
        let slot = loop {
            match get_available_slot(mm, oid, key, khash)? {
                Probe::Restart => continue,
                found => break found,
            }
        };
        let index = match slot {
            Probe::FoundUnused(i) | Probe::FoundDummy(i) => i,
            _ => return Ok(()), // already present
        };
        let k_oid = mm.persist(key)?;
        mm.incref(k_oid)?;
        let body = body_ptr(mm, oid);
        unsafe {
            let ep = table_ptr(mm, (*body).table).add(index);
            mm.snapshot(ep)?;
            (*ep).key = k_oid;
            (*ep).hash = khash;
            snapshot_body_tail(mm, body)?;
            (*body).used += 1;
            if let Probe::FoundUnused(_) = slot {
                (*body).fill += 1;
                if (*body).fill * 3 >= (*body).mask * 2 {
                    table_resize(mm, oid, (*body).used)?;
                }
            }
            if mm.debug_checks() {
                let body = body_ptr(mm, oid);
                assert!(
                    (*body).used <= (*body).fill && (*body).fill <= (*body).mask + 1,
                    "set invariant violated: used {} fill {} mask {}",
                    (*body).used,
                    (*body).fill,
                    (*body).mask
                );
            }
        }
        Ok(())
    })
}

/// Finds the slot of `key`, `None` if absent
fn lookkey(mm: &MemoryManager, oid: Oid, key: &Value, khash: u64) -> Result<Option<usize>> {
    'restart: loop {
        let body = body_ptr(mm, oid);
        let (mask, table_oid) = unsafe { ((*body).mask, (*body).table) };
        let ep0 = table_ptr(mm, table_oid);
        let mut i = khash & mask;
        let mut entry = unsafe { *ep0.add(i as usize) };
        if entry.hash == HASH_UNUSED {
            return Ok(None);
        }
        let mut perturb = khash;
        loop {
            if entry.hash == khash {
                let startkey = entry.key;
                let matched = mm.resurrect(startkey)? == *key;
                let now = unsafe { *ep0.add(i as usize) };
                if unsafe { (*body_ptr(mm, oid)).table } != table_oid || now.key != startkey {
                    continue 'restart;
                }
                if matched {
                    return Ok(Some(i as usize));
                }
            }
            for j in i + 1..=(i + LINEAR_PROBES).min(mask) {
                entry = unsafe { *ep0.add(j as usize) };
                if entry.hash == HASH_UNUSED {
                    return Ok(None);
                }
                if entry.hash == khash {
                    let startkey = entry.key;
                    let matched = mm.resurrect(startkey)? == *key;
                    let now = unsafe { *ep0.add(j as usize) };
                    if unsafe { (*body_ptr(mm, oid)).table } != table_oid || now.key != startkey {
                        continue 'restart;
                    }
                    if matched {
                        return Ok(Some(j as usize));
                    }
                }
            }
            perturb >>= PERTURB_SHIFT;
            i = (i * 5 + 1 + perturb) & mask;
            entry = unsafe { *ep0.add(i as usize) };
            if entry.hash == HASH_UNUSED {
                return Ok(None);
            }
        }
    }
}

fn discard_impl(mm: &MemoryManager, oid: Oid, key: &Value) -> Result<bool> {
    let khash = fixed_hash(key)?;
    mm.transaction(|| match lookkey(mm, oid, key, khash)? {
        None => Ok(false),
        Some(index) => {
            let body = body_ptr(mm, oid);
            unsafe {
                let ep = table_ptr(mm, (*body).table).add(index);
                mm.snapshot(ep)?;
                mm.decref((*ep).key)?;
                (*ep).key = OID_NULL;
                (*ep).hash = HASH_DUMMY;
                snapshot_body_tail(mm, body)?;
                (*body).used -= 1;
            }
            Ok(true)
        }
    })
}

fn contains_impl(mm: &MemoryManager, oid: Oid, key: &Value) -> Result<bool> {
    Ok(lookkey(mm, oid, key, fixed_hash(key)?)?.is_some())
}

fn len_impl(mm: &MemoryManager, oid: Oid) -> usize {
    unsafe { (*body_ptr(mm, oid)).used as usize }
}

fn values_impl(mm: &MemoryManager, oid: Oid) -> Result<Vec<Value>> {
    let body = body_ptr(mm, oid);
    let (mask, table_oid) = unsafe { ((*body).mask, (*body).table) };
    let ep0 = table_ptr(mm, table_oid);
    let mut out = Vec::new();
    for i in 0..=mask {
        let e = unsafe { *ep0.add(i as usize) };
        if e.hash == HASH_UNUSED || e.hash == HASH_DUMMY {
            continue;
        }
        out.push(mm.resurrect(e.key)?);
    }
    Ok(out)
}

/// Builds a new set body of `type_name` seeded with `items`
fn make_new_set(mm: &MemoryManager, type_name: &str, items: &[Value]) -> Result<Oid> {
    mm.transaction(|| {
        let oid = new_set_body(mm, type_name)?;
        for v in items {
            add_impl(mm, oid, v)?;
        }
        Ok(oid)
    })
}

fn union_impl<T: ValueIterable + ?Sized>(
    mm: &MemoryManager,
    oid: Oid,
    other: &T,
    type_name: &str,
) -> Result<Oid> {
    mm.transaction(|| {
        let new = make_new_set(mm, type_name, &values_impl(mm, oid)?)?;
        for v in other.to_values()? {
            add_impl(mm, new, &v)?;
        }
        Ok(new)
    })
}

fn intersection_impl<T: ValueIterable + ?Sized>(
    mm: &MemoryManager,
    oid: Oid,
    other: &T,
    type_name: &str,
) -> Result<Oid> {
    mm.transaction(|| {
        let new = make_new_set(mm, type_name, &[])?;
        let other = other.to_values()?;
        for v in values_impl(mm, oid)? {
            if other.contains(&v) {
                add_impl(mm, new, &v)?;
            }
        }
        Ok(new)
    })
}

fn difference_impl<T: ValueIterable + ?Sized>(
    mm: &MemoryManager,
    oid: Oid,
    other: &T,
    type_name: &str,
) -> Result<Oid> {
    mm.transaction(|| {
        let new = make_new_set(mm, type_name, &[])?;
        let other = other.to_values()?;
        for v in values_impl(mm, oid)? {
            if !other.contains(&v) {
                add_impl(mm, new, &v)?;
            }
        }
        Ok(new)
    })
}

fn symmetric_difference_impl<T: ValueIterable + ?Sized>(
    mm: &MemoryManager,
    oid: Oid,
    other: &T,
    type_name: &str,
) -> Result<Oid> {
    mm.transaction(|| {
        let new = make_new_set(mm, type_name, &values_impl(mm, oid)?)?;
        for v in other.to_values()? {
            if contains_impl(mm, oid, &v)? {
                discard_impl(mm, new, &v)?;
            } else {
                add_impl(mm, new, &v)?;
            }
        }
        Ok(new)
    })
}

fn isdisjoint_impl<T: ValueIterable + ?Sized>(
    mm: &MemoryManager,
    oid: Oid,
    other: &T,
) -> Result<bool> {
    let other = other.to_values()?;
    for v in values_impl(mm, oid)? {
        if other.contains(&v) {
            return Ok(false);
        }
    }
    Ok(true)
}

fn issubset_impl<T: ValueIterable + ?Sized>(
    mm: &MemoryManager,
    oid: Oid,
    other: &T,
) -> Result<bool> {
    let other = other.to_values()?;
    for v in values_impl(mm, oid)? {
        if !other.contains(&v) {
            return Ok(false);
        }
    }
    Ok(true)
}

fn issuperset_impl<T: ValueIterable + ?Sized>(
    mm: &MemoryManager,
    oid: Oid,
    other: &T,
) -> Result<bool> {
    for v in other.to_values()? {
        if !contains_impl(mm, oid, &v)? {
            return Ok(false);
        }
    }
    Ok(true)
}

// --------------------------------------------------------------------
// public surfaces

/// Persistent version of a mutable hash set
#[derive(Clone)]
pub struct PersistentSet {
    pub(crate) mm: MemoryManager,
    pub(crate) oid: Oid,
}

impl PersistentSet {
    pub(crate) fn new(mm: &MemoryManager) -> Result<PersistentSet> {
        Ok(PersistentSet {
            mm: mm.clone(),
            oid: new_set_body(mm, TYPE_SET)?,
        })
    }

    pub(crate) fn from_oid(mm: MemoryManager, oid: Oid) -> PersistentSet {
        PersistentSet { mm, oid }
    }

    pub fn len(&self) -> usize {
        len_impl(&self.mm, self.oid)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Adds `key`; a no-op if it is already present
    pub fn add(&self, key: Value) -> Result<()> {
        add_impl(&self.mm, self.oid, &key)
    }

    /// Removes `key` if present
    pub fn discard(&self, key: &Value) -> Result<()> {
        discard_impl(&self.mm, self.oid, key).map(|_| ())
    }

    /// Removes `key`, failing if it is absent
    pub fn remove(&self, key: &Value) -> Result<()> {
        if discard_impl(&self.mm, self.oid, key)? {
            Ok(())
        } else {
            Err(Error::NotFound(format!("set member {:?}", key)))
        }
    }

    pub fn contains(&self, key: &Value) -> Result<bool> {
        contains_impl(&self.mm, self.oid, key)
    }

    /// The members, in table order
    pub fn values(&self) -> Result<Vec<Value>> {
        values_impl(&self.mm, self.oid)
    }

    /// Adds every value of `other`
    pub fn update<T: ValueIterable + ?Sized>(&self, other: &T) -> Result<()> {
        self.mm.transaction(|| {
            for v in other.to_values()? {
                add_impl(&self.mm, self.oid, &v)?;
            }
            Ok(())
        })
    }

    pub fn union<T: ValueIterable + ?Sized>(&self, other: &T) -> Result<PersistentSet> {
        union_impl(&self.mm, self.oid, other, TYPE_SET)
            .map(|oid| PersistentSet::from_oid(self.mm.clone(), oid))
    }

    pub fn intersection<T: ValueIterable + ?Sized>(&self, other: &T) -> Result<PersistentSet> {
        intersection_impl(&self.mm, self.oid, other, TYPE_SET)
            .map(|oid| PersistentSet::from_oid(self.mm.clone(), oid))
    }

    pub fn difference<T: ValueIterable + ?Sized>(&self, other: &T) -> Result<PersistentSet> {
        difference_impl(&self.mm, self.oid, other, TYPE_SET)
            .map(|oid| PersistentSet::from_oid(self.mm.clone(), oid))
    }

    pub fn symmetric_difference<T: ValueIterable + ?Sized>(
        &self,
        other: &T,
    ) -> Result<PersistentSet> {
        symmetric_difference_impl(&self.mm, self.oid, other, TYPE_SET)
            .map(|oid| PersistentSet::from_oid(self.mm.clone(), oid))
    }

    pub fn isdisjoint<T: ValueIterable + ?Sized>(&self, other: &T) -> Result<bool> {
        isdisjoint_impl(&self.mm, self.oid, other)
    }

    pub fn issubset<T: ValueIterable + ?Sized>(&self, other: &T) -> Result<bool> {
        issubset_impl(&self.mm, self.oid, other)
    }

    pub fn issuperset<T: ValueIterable + ?Sized>(&self, other: &T) -> Result<bool> {
        issuperset_impl(&self.mm, self.oid, other)
    }
}

impl fmt::Debug for PersistentSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PersistentSet(0x{:x})", self.oid.off)
    }
}

/// Persistent version of an immutable hash set
#[derive(Clone)]
pub struct PersistentFrozenSet {
    pub(crate) mm: MemoryManager,
    pub(crate) oid: Oid,
}

impl PersistentFrozenSet {
    pub(crate) fn new(mm: &MemoryManager, items: &[Value]) -> Result<PersistentFrozenSet> {
        Ok(PersistentFrozenSet {
            mm: mm.clone(),
            oid: make_new_set(mm, TYPE_FROZENSET, items)?,
        })
    }

    pub(crate) fn from_oid(mm: MemoryManager, oid: Oid) -> PersistentFrozenSet {
        PersistentFrozenSet { mm, oid }
    }

    pub fn len(&self) -> usize {
        len_impl(&self.mm, self.oid)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Frozen sets reject mutation
    pub fn add(&self, _key: Value) -> Result<()> {
        Err(Error::NotAllowed("PersistentFrozenSet has no 'add'"))
    }

    /// Frozen sets reject mutation
    pub fn discard(&self, _key: &Value) -> Result<()> {
        Err(Error::NotAllowed("PersistentFrozenSet has no 'discard'"))
    }

    /// Frozen sets reject mutation
    pub fn remove(&self, _key: &Value) -> Result<()> {
        Err(Error::NotAllowed("PersistentFrozenSet has no 'remove'"))
    }

    pub fn contains(&self, key: &Value) -> Result<bool> {
        contains_impl(&self.mm, self.oid, key)
    }

    pub fn values(&self) -> Result<Vec<Value>> {
        values_impl(&self.mm, self.oid)
    }

    /// The stable hash, computed once and cached in the body
    pub(crate) fn cached_hash(&self) -> Result<u64> {
        let body = body_ptr(&self.mm, self.oid);
        let cached = unsafe { (*body).hash };
        if cached != HASH_INVALID {
            return Ok(cached);
        }
        let mut hashes = Vec::new();
        for v in self.values()? {
            hashes.push(fixed_hash(&v)?);
        }
        hashes.sort_unstable();
        let mut buf = vec![b'{'];
        for h in hashes {
            buf.extend_from_slice(&h.to_be_bytes());
        }
        buf.push(b'}');
        let h = digest_bytes(&buf);
        self.mm.transaction(|| unsafe {
            self.mm.snapshot(&(*body).hash)?;
            (*body).hash = h;
            Ok(())
        })?;
        Ok(h)
    }

    pub fn union<T: ValueIterable + ?Sized>(&self, other: &T) -> Result<PersistentFrozenSet> {
        union_impl(&self.mm, self.oid, other, TYPE_FROZENSET)
            .map(|oid| PersistentFrozenSet::from_oid(self.mm.clone(), oid))
    }

    pub fn intersection<T: ValueIterable + ?Sized>(
        &self,
        other: &T,
    ) -> Result<PersistentFrozenSet> {
        intersection_impl(&self.mm, self.oid, other, TYPE_FROZENSET)
            .map(|oid| PersistentFrozenSet::from_oid(self.mm.clone(), oid))
    }

    pub fn difference<T: ValueIterable + ?Sized>(&self, other: &T) -> Result<PersistentFrozenSet> {
        difference_impl(&self.mm, self.oid, other, TYPE_FROZENSET)
            .map(|oid| PersistentFrozenSet::from_oid(self.mm.clone(), oid))
    }

    pub fn symmetric_difference<T: ValueIterable + ?Sized>(
        &self,
        other: &T,
    ) -> Result<PersistentFrozenSet> {
        symmetric_difference_impl(&self.mm, self.oid, other, TYPE_FROZENSET)
            .map(|oid| PersistentFrozenSet::from_oid(self.mm.clone(), oid))
    }

    pub fn isdisjoint<T: ValueIterable + ?Sized>(&self, other: &T) -> Result<bool> {
        isdisjoint_impl(&self.mm, self.oid, other)
    }

    pub fn issubset<T: ValueIterable + ?Sized>(&self, other: &T) -> Result<bool> {
        issubset_impl(&self.mm, self.oid, other)
    }

    pub fn issuperset<T: ValueIterable + ?Sized>(&self, other: &T) -> Result<bool> {
        issuperset_impl(&self.mm, self.oid, other)
    }
}

impl fmt::Debug for PersistentFrozenSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PersistentFrozenSet(0x{:x})", self.oid.off)
    }
}

// --------------------------------------------------------------------
// value-level infix operators

fn set_operands<'a>(
    lhs: &'a Value,
    rhs: &'a Value,
    op: &str,
) -> Result<(&'a MemoryManager, Oid, Vec<Value>, &'static str)> {
    let (mm, oid, name) = match lhs {
        Value::Set(s) => (&s.mm, s.oid, TYPE_SET),
        Value::FrozenSet(s) => (&s.mm, s.oid, TYPE_FROZENSET),
        other => {
            return Err(Error::TypeMismatch(format!(
                "unsupported operand type for {}: {:?}",
                op, other
            )))
        }
    };
    let rhs_values = match rhs {
        Value::Set(s) => s.values()?,
        Value::FrozenSet(s) => s.values()?,
        other => {
            return Err(Error::TypeMismatch(format!(
                "unsupported operand type for {}: {:?}",
                op, other
            )))
        }
    };
    Ok((mm, oid, rhs_values, name))
}

fn wrap_set_result(mm: &MemoryManager, oid: Oid, name: &str) -> Value {
    if name == TYPE_SET {
        Value::Set(PersistentSet::from_oid(mm.clone(), oid))
    } else {
        Value::FrozenSet(PersistentFrozenSet::from_oid(mm.clone(), oid))
    }
}

impl std::ops::BitOr for &Value {
    type Output = Result<Value>;

    fn bitor(self, rhs: &Value) -> Result<Value> {
        let (mm, oid, other, name) = set_operands(self, rhs, "|")?;
        union_impl(mm, oid, &other, name).map(|o| wrap_set_result(mm, o, name))
    }
}

impl std::ops::BitAnd for &Value {
    type Output = Result<Value>;

    fn bitand(self, rhs: &Value) -> Result<Value> {
        let (mm, oid, other, name) = set_operands(self, rhs, "&")?;
        intersection_impl(mm, oid, &other, name).map(|o| wrap_set_result(mm, o, name))
    }
}

impl std::ops::Sub for &Value {
    type Output = Result<Value>;

    fn sub(self, rhs: &Value) -> Result<Value> {
        let (mm, oid, other, name) = set_operands(self, rhs, "-")?;
        difference_impl(mm, oid, &other, name).map(|o| wrap_set_result(mm, o, name))
    }
}

impl std::ops::BitXor for &Value {
    type Output = Result<Value>;

    fn bitxor(self, rhs: &Value) -> Result<Value> {
        let (mm, oid, other, name) = set_operands(self, rhs, "^")?;
        symmetric_difference_impl(mm, oid, &other, name).map(|o| wrap_set_result(mm, o, name))
    }
}

// --------------------------------------------------------------------
// manager protocol

pub(crate) fn traverse(mm: &MemoryManager, oid: Oid) -> Result<Vec<Oid>> {
    let body = body_ptr(mm, oid);
    let (mask, table_oid) = unsafe { ((*body).mask, (*body).table) };
    let ep0 = table_ptr(mm, table_oid);
    let mut out = Vec::new();
    for i in 0..=mask {
        let e = unsafe { *ep0.add(i as usize) };
        if e.hash == HASH_UNUSED || e.hash == HASH_DUMMY {
            continue;
        }
        out.push(e.key);
    }
    Ok(out)
}

pub(crate) fn substructures(mm: &MemoryManager, oid: Oid) -> Result<Vec<(Oid, u32)>> {
    let body = body_ptr(mm, oid);
    Ok(vec![(unsafe { (*body).table }, SET_POBJPTR_ARRAY_TYPE_NUM)])
}

pub(crate) fn deallocate(mm: &MemoryManager, oid: Oid) -> Result<()> {
    for key in traverse(mm, oid)? {
        mm.decref(key)?;
    }
    let body = body_ptr(mm, oid);
    mm.free(unsafe { (*body).table })
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::mm::{create, CreateOptions};
    use tempfile::TempDir;

    fn fresh() -> (TempDir, crate::mm::ObjectPool) {
        let dir = TempDir::new().unwrap();
        let pool = create(dir.path().join("set.pool"), CreateOptions::new().debug(true)).unwrap();
        (dir, pool)
    }

    fn charset(pool: &crate::mm::ObjectPool, word: &str) -> PersistentSet {
        let values: Vec<Value> = word.chars().map(|c| Value::Str(c.to_string())).collect();
        pool.new_set_from(&values).unwrap()
    }

    fn chars(word: &str) -> Vec<Value> {
        word.chars().map(|c| Value::Str(c.to_string())).collect()
    }

    #[test]
    fn add_contains_discard() {
        let (_dir, pool) = fresh();
        let s = pool.new_set().unwrap();
        s.add(Value::Int(1)).unwrap();
        s.add(Value::Int(1)).unwrap();
        s.add(Value::from("x")).unwrap();
        assert_eq!(s.len(), 2);
        assert!(s.contains(&Value::Int(1)).unwrap());
        assert!(!s.contains(&Value::Int(2)).unwrap());
        s.discard(&Value::Int(1)).unwrap();
        assert_eq!(s.len(), 1);
        // Discard of an absent member is a no-op.
        s.discard(&Value::Int(1)).unwrap();
        assert_eq!(s.len(), 1);
    }

    #[test]
    fn remove_missing_is_not_found() {
        let (_dir, pool) = fresh();
        let s = pool.new_set().unwrap();
        match s.remove(&Value::Int(9)) {
            Err(Error::NotFound(_)) => {}
            other => panic!("expected NotFound, got {:?}", other),
        }
    }

    #[test]
    fn tombstone_slot_is_reused() {
        let (_dir, pool) = fresh();
        let s = pool.new_set().unwrap();
        s.add(Value::from("k")).unwrap();
        s.discard(&Value::from("k")).unwrap();
        s.add(Value::from("k")).unwrap();
        assert_eq!(s.len(), 1);
        assert!(s.contains(&Value::from("k")).unwrap());
    }

    #[test]
    fn resize_keeps_members_findable() {
        let (_dir, pool) = fresh();
        let s = pool.new_set().unwrap();
        // fill * 3 >= mask * 2 fires at 42 entries in a 64-slot table.
        for i in 0..100 {
            s.add(Value::Int(i)).unwrap();
        }
        assert_eq!(s.len(), 100);
        for i in 0..100 {
            assert!(s.contains(&Value::Int(i)).unwrap(), "lost member {}", i);
        }
    }

    #[test]
    fn set_algebra() {
        let (_dir, pool) = fresh();
        let s = charset(&pool, "simsalabim");
        assert_eq!(s.len(), 6); // s i m a l b

        let t = chars("madagascar"); // m a d g s c r

        let u = s.union(&t).unwrap();
        assert_eq!(u.len(), 10); // s i m a l b + d g c r

        let i = s.intersection(&t).unwrap();
        let mut got: Vec<String> = i
            .values()
            .unwrap()
            .iter()
            .map(|v| v.as_str().unwrap().to_string())
            .collect();
        got.sort();
        assert_eq!(got, vec!["a", "m", "s"]);

        let d = s.difference(&t).unwrap();
        let mut got: Vec<String> = d
            .values()
            .unwrap()
            .iter()
            .map(|v| v.as_str().unwrap().to_string())
            .collect();
        got.sort();
        assert_eq!(got, vec!["b", "i", "l"]);

        let x = s.symmetric_difference(&t).unwrap();
        assert_eq!(x.len(), 10 - 3); // union minus intersection
    }

    #[test]
    fn subset_superset_disjoint() {
        let (_dir, pool) = fresh();
        let s = charset(&pool, "abc");
        assert!(s.issubset(&chars("abcd")).unwrap());
        assert!(!s.issubset(&chars("ab")).unwrap());
        assert!(s.issuperset(&chars("ab")).unwrap());
        assert!(s.isdisjoint(&chars("xyz")).unwrap());
        assert!(!s.isdisjoint(&chars("cx")).unwrap());
    }

    #[test]
    fn operators_require_sets() {
        let (_dir, pool) = fresh();
        let a = Value::Set(charset(&pool, "ab"));
        let b = Value::Set(charset(&pool, "bc"));

        let u = (&a | &b).unwrap();
        assert_eq!(u.as_set().unwrap().len(), 3);
        let i = (&a & &b).unwrap();
        assert_eq!(i.as_set().unwrap().len(), 1);
        let d = (&a - &b).unwrap();
        assert_eq!(d.as_set().unwrap().len(), 1);
        let x = (&a ^ &b).unwrap();
        assert_eq!(x.as_set().unwrap().len(), 2);

        match &a | &Value::Int(3) {
            Err(Error::TypeMismatch(_)) => {}
            other => panic!("expected TypeMismatch, got {:?}", other),
        }
    }

    #[test]
    fn frozen_set_rejects_mutation() {
        let (_dir, pool) = fresh();
        let f = pool.new_frozen_set(&chars("abc")).unwrap();
        assert_eq!(f.len(), 3);
        assert!(f.contains(&Value::from("a")).unwrap());
        match f.add(Value::from("d")) {
            Err(Error::NotAllowed(_)) => {}
            other => panic!("expected NotAllowed, got {:?}", other),
        }
        match f.discard(&Value::from("a")) {
            Err(Error::NotAllowed(_)) => {}
            other => panic!("expected NotAllowed, got {:?}", other),
        }
    }

    #[test]
    fn frozen_set_hash_is_order_independent() {
        let (_dir, pool) = fresh();
        let a = pool.new_frozen_set(&chars("abc")).unwrap();
        let b = pool.new_frozen_set(&chars("cba")).unwrap();
        assert_eq!(a.cached_hash().unwrap(), b.cached_hash().unwrap());

        // Usable as a dict key.
        let d = pool.new_dict().unwrap();
        d.set(Value::FrozenSet(a), Value::Int(1)).unwrap();
        assert_eq!(d.get(&Value::FrozenSet(b)).unwrap(), Value::Int(1));
    }

    #[test]
    fn frozen_set_hash_is_written_back_once() {
        let (_dir, pool) = fresh();
        let f = pool.new_frozen_set(&chars("xyz")).unwrap();
        assert_eq!(
            unsafe { (*body_ptr(&f.mm, f.oid)).hash },
            HASH_INVALID,
            "fresh frozen set carries the invalid sentinel"
        );
        let h = f.cached_hash().unwrap();
        assert_eq!(
            unsafe { (*body_ptr(&f.mm, f.oid)).hash },
            h,
            "first computation lands in the body"
        );
        assert_eq!(f.cached_hash().unwrap(), h);
    }
}
