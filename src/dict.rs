//! An open-addressed persistent hash table with perturb probing
//!
//! The layout follows CPython's combined-table dictionary: a small body
//! (`ma_used`, `ma_keys`, and the reserved split-table slot `ma_values`,
//! always null here) plus a separately allocated keys-object whose
//! trailing flexible array holds `dk_size` entries of
//! `(me_hash, me_key, me_value)`. An empty slot has a null `me_key`; a
//! deleted one holds the tombstone `DUMMY_OID`.
//!
//! Key comparison resurrects the stored key, and comparing a persistent
//! value can in principle mutate the dictionary underneath the probe, so
//! every compare is followed by re-reading `ma_keys` and the entry; a
//! change restarts the lookup from the top.

use crate::alloc::pool::{Oid, DUMMY_OID, OID_NULL};
use crate::err::{Error, Result};
use crate::mm::{MemoryManager, PObject, POBJECT_TYPE_NUM, TYPE_DICT};
use crate::value::{fixed_hash, Value};
use std::fmt;
use std::mem;

/// Allocator type number of dict keys-objects
pub(crate) const PDICTKEYSOBJECT_TYPE_NUM: u32 = 40;

/// Smallest keys-object a combined dict allocates
const MIN_SIZE_COMBINED: u64 = 8;

const PERTURB_SHIFT: u32 = 5;

#[repr(C)]
pub(crate) struct PDictObject {
    pub ob_base: PObject,
    /// Number of live entries
    pub ma_used: u64,
    /// OID of the keys-object
    pub ma_keys: Oid,
    /// Reserved for a split-table layout; always `OID_NULL`
    pub ma_values: Oid,
}

#[repr(C)]
pub(crate) struct PDictKeysObject {
    pub dk_refcnt: u64,
    /// Table size, a power of two >= 8
    pub dk_size: u64,
    /// Insertions left before a resize
    pub dk_usable: u64,
    // dk_size entries of PDictKeyEntry follow
}

#[repr(C)]
#[derive(Clone, Copy)]
pub(crate) struct PDictKeyEntry {
    pub me_hash: u64,
    pub me_key: Oid,
    pub me_value: Oid,
}

#[inline]
fn usable_fraction(n: u64) -> u64 {
    (2 * n + 1) / 3
}

/// Persistent version of a mutable mapping
#[derive(Clone)]
pub struct PersistentDict {
    pub(crate) mm: MemoryManager,
    pub(crate) oid: Oid,
}

impl PersistentDict {
    pub(crate) fn new(mm: &MemoryManager) -> Result<PersistentDict> {
        mm.transaction(|| {
            let code = mm.get_type_code(TYPE_DICT)?;
            let oid = mm.zalloc(mem::size_of::<PDictObject>(), POBJECT_TYPE_NUM)?;
            let dict = PersistentDict { mm: mm.clone(), oid };
            let keys = dict.new_keys_object(MIN_SIZE_COMBINED)?;
            unsafe {
                let body = dict.body();
                (*body).ob_base.ob_type = code;
                (*body).ma_keys = keys;
                (*body).ma_values = OID_NULL;
            }
            Ok(dict)
        })
    }

    pub(crate) fn from_oid(mm: MemoryManager, oid: Oid) -> PersistentDict {
        PersistentDict { mm, oid }
    }

    #[inline]
    fn body(&self) -> *mut PDictObject {
        self.mm.direct(self.oid) as *mut PDictObject
    }

    #[inline]
    fn keys_oid(&self) -> Oid {
        unsafe { (*self.body()).ma_keys }
    }

    #[inline]
    fn keys_object(&self) -> *mut PDictKeysObject {
        self.mm.direct(self.keys_oid()) as *mut PDictKeysObject
    }

    #[inline]
    unsafe fn entries_of(&self, keys: *mut PDictKeysObject) -> *mut PDictKeyEntry {
        (keys as *mut u8).add(mem::size_of::<PDictKeysObject>()) as *mut PDictKeyEntry
    }

    #[inline]
    fn entry_ptr(&self, slot: usize) -> *mut PDictKeyEntry {
        unsafe { self.entries_of(self.keys_object()).add(slot) }
    }

    /// Number of live entries
    pub fn len(&self) -> usize {
        unsafe { (*self.body()).ma_used as usize }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Allocates a zeroed keys-object of `size` slots
    ///
    /// Zeroed memory already encodes empty entries: null keys, null
    /// values, hash 0.
    fn new_keys_object(&self, size: u64) -> Result<Oid> {
        debug_assert!(size >= MIN_SIZE_COMBINED && size.is_power_of_two());
        let bytes =
            mem::size_of::<PDictKeysObject>() + size as usize * mem::size_of::<PDictKeyEntry>();
        let oid = self.mm.zalloc(bytes, PDICTKEYSOBJECT_TYPE_NUM)?;
        unsafe {
            let dk = self.mm.direct(oid) as *mut PDictKeysObject;
            (*dk).dk_refcnt = 1;
            (*dk).dk_size = size;
            (*dk).dk_usable = usable_fraction(size);
        }
        Ok(oid)
    }

    /// Decrefs every key and value and frees the keys-object
    fn free_keys_object(&self, oid: Oid) -> Result<()> {
        let dk = self.mm.direct(oid) as *mut PDictKeysObject;
        unsafe {
            let size = (*dk).dk_size as usize;
            let ep0 = self.entries_of(dk);
            for i in 0..size {
                let ep = *ep0.add(i);
                self.mm.xdecref(ep.me_key)?;
                self.mm.xdecref(ep.me_value)?;
            }
        }
        self.mm.free(oid)
    }

    /// Generalized key lookup: returns the slot of the match, or the slot
    /// an insert should use
    fn lookdict(&self, key: &Value, khash: u64) -> Result<usize> {
        'restart: loop {
            let keys_oid = self.keys_oid();
            let keys = self.keys_object();
            let (mask, ep0) = unsafe { ((*keys).dk_size - 1, self.entries_of(keys)) };
            let mut i = khash & mask;
            let mut ep = unsafe { *ep0.add(i as usize) };
            let mut freeslot: Option<u64> = None;
            if ep.me_key.is_null() {
                return Ok(i as usize);
            }
            if ep.me_key.is_dummy() {
                freeslot = Some(i);
            } else if ep.me_hash == khash {
                let me_key = ep.me_key;
                let matched = self.mm.resurrect(me_key)? == *key; // dict could mutate
                if self.keys_oid() == keys_oid
                    && unsafe { (*ep0.add((i & mask) as usize)).me_key } == me_key
                {
                    if matched {
                        return Ok(i as usize);
                    }
                } else {
                    continue 'restart;
                }
            }
            let mut perturb = khash;
            loop {
                i = i
                    .wrapping_shl(2)
                    .wrapping_add(i)
                    .wrapping_add(perturb)
                    .wrapping_add(1);
                let slot = (i & mask) as usize;
                ep = unsafe { *ep0.add(slot) };
                if ep.me_key.is_null() {
                    return Ok(freeslot.map(|f| (f & mask) as usize).unwrap_or(slot));
                }
                if ep.me_hash == khash && !ep.me_key.is_dummy() {
                    let me_key = ep.me_key;
                    let matched = self.mm.resurrect(me_key)? == *key; // dict could mutate
                    if self.keys_oid() == keys_oid && unsafe { (*ep0.add(slot)).me_key } == me_key {
                        if matched {
                            return Ok(slot);
                        }
                    } else {
                        continue 'restart;
                    }
                } else if ep.me_key.is_dummy() && freeslot.is_none() {
                    freeslot = Some(i);
                }
                perturb >>= PERTURB_SHIFT;
                // Once perturb reaches zero the probe visits every slot,
                // so an empty one is eventually found.
            }
        }
    }

    /// Finds a slot from the hash alone, assuming the key is absent
    ///
    /// Used by the rehash path, which never needs a compare.
    fn find_empty_slot(&self, khash: u64) -> usize {
        let keys = self.keys_object();
        let (mask, ep0) = unsafe { ((*keys).dk_size - 1, self.entries_of(keys)) };
        let mut i = khash & mask;
        let mut perturb = khash;
        while !unsafe { (*ep0.add((i & mask) as usize)).me_key }.is_null() {
            i = i
                .wrapping_shl(2)
                .wrapping_add(i)
                .wrapping_add(perturb)
                .wrapping_add(1);
            perturb >>= PERTURB_SHIFT;
        }
        (i & mask) as usize
    }

    fn growth_rate(&self) -> u64 {
        unsafe { (*self.body()).ma_used * 2 + ((*self.keys_object()).dk_size >> 1) }
    }

    /// Swaps in a bigger keys-object and rehashes every live entry
    ///
    /// Refcounts belong to the dict as a whole, not to the keys-object:
    /// rehashing moves ownership without incref/decref churn, and the old
    /// keys-object is freed without touching children.
    fn insertion_resize(&self) -> Result<()> {
        let minused = self.growth_rate();
        let mut newsize = MIN_SIZE_COMBINED;
        while newsize <= minused {
            newsize <<= 1;
        }
        self.mm.transaction(|| {
            let oldkeys_oid = self.keys_oid();
            let oldsize = unsafe { (*self.keys_object()).dk_size as usize };

            self.mm.snapshot(self.body())?;
            let new_oid = self.new_keys_object(newsize)?;
            unsafe { (*self.body()).ma_keys = new_oid };

            let old_dk = self.mm.direct(oldkeys_oid) as *mut PDictKeysObject;
            unsafe {
                let old_ep0 = self.entries_of(old_dk);
                for i in 0..oldsize {
                    let old_ep = *old_ep0.add(i);
                    if !old_ep.me_value.is_null() {
                        debug_assert!(!old_ep.me_key.is_dummy());
                        let slot = self.find_empty_slot(old_ep.me_hash);
                        let new_ep = self.entry_ptr(slot);
                        (*new_ep).me_key = old_ep.me_key;
                        (*new_ep).me_hash = old_ep.me_hash;
                        (*new_ep).me_value = old_ep.me_value;
                    }
                }
                (*self.keys_object()).dk_usable -= (*self.body()).ma_used;
            }
            self.mm.free(oldkeys_oid)
        })
    }

    /// Inserts or replaces `key -> value`
    pub fn set(&self, key: Value, value: Value) -> Result<()> {
        let khash = fixed_hash(&key)?;
        let slot = self.lookdict(&key, khash)?;
        self.mm.transaction(|| {
            let v_oid = self.mm.persist(&value)?;
            let ep = self.entry_ptr(slot);
            let (me_key, old_v) = unsafe { ((*ep).me_key, (*ep).me_value) };
            if !old_v.is_null() {
                debug_assert!(!me_key.is_null() && !me_key.is_dummy());
                self.mm.snapshot(ep)?;
                unsafe { (*ep).me_value = v_oid };
                self.mm.incref(v_oid)?;
                self.mm.decref(old_v)?;
                return Ok(());
            }
            let k_oid = self.mm.persist(&key)?;
            let ep = if me_key.is_null() {
                if unsafe { (*self.keys_object()).dk_usable } == 0 {
                    self.insertion_resize()?;
                }
                let slot = self.find_empty_slot(khash);
                unsafe {
                    let keys = self.keys_object();
                    self.mm.snapshot(&(*keys).dk_usable)?;
                    (*keys).dk_usable -= 1;
                }
                let ep = self.entry_ptr(slot);
                self.mm.snapshot(ep)?;
                unsafe {
                    (*ep).me_key = k_oid;
                    (*ep).me_hash = khash;
                }
                self.mm.incref(k_oid)?;
                ep
            } else {
                debug_assert!(me_key.is_dummy());
                self.mm.snapshot(ep)?;
                unsafe {
                    (*ep).me_key = k_oid;
                    (*ep).me_hash = khash;
                }
                self.mm.incref(k_oid)?;
                ep
            };
            unsafe {
                let body = self.body();
                self.mm.snapshot(&(*body).ma_used)?;
                (*body).ma_used += 1;
                (*ep).me_value = v_oid;
            }
            self.mm.incref(v_oid)?;
            if self.mm.debug_checks() {
                self.check_invariants();
            }
            Ok(())
        })
    }

    /// Returns the value stored under `key`
    pub fn get(&self, key: &Value) -> Result<Value> {
        let khash = fixed_hash(key)?;
        let slot = self.lookdict(key, khash)?;
        let ep = unsafe { *self.entry_ptr(slot) };
        if ep.me_value.is_null() {
            return Err(Error::NotFound(format!("key {:?}", key)));
        }
        self.mm.resurrect(ep.me_value)
    }

    /// Whether `key` is present
    pub fn contains_key(&self, key: &Value) -> Result<bool> {
        let khash = fixed_hash(key)?;
        let slot = self.lookdict(key, khash)?;
        Ok(!unsafe { *self.entry_ptr(slot) }.me_value.is_null())
    }

    /// Removes `key`, leaving a tombstone in its slot
    pub fn del(&self, key: &Value) -> Result<()> {
        let khash = fixed_hash(key)?;
        let slot = self.lookdict(key, khash)?;
        let ep = self.entry_ptr(slot);
        if unsafe { (*ep).me_value }.is_null() {
            return Err(Error::NotFound(format!("key {:?}", key)));
        }
        self.mm.transaction(|| {
            self.mm.snapshot(ep)?;
            let (old_key, old_value) = unsafe {
                let old_value = (*ep).me_value;
                (*ep).me_value = OID_NULL;
                let old_key = (*ep).me_key;
                (*ep).me_key = DUMMY_OID;
                (old_key, old_value)
            };
            unsafe {
                let body = self.body();
                self.mm.snapshot(&(*body).ma_used)?;
                (*body).ma_used -= 1;
            }
            self.mm.decref(old_value)?;
            self.mm.decref(old_key)
        })
    }

    /// The keys, in table order
    pub fn keys(&self) -> Result<Vec<Value>> {
        let mut out = Vec::with_capacity(self.len());
        let keys = self.keys_object();
        unsafe {
            let size = (*keys).dk_size as usize;
            let ep0 = self.entries_of(keys);
            for i in 0..size {
                let ep = *ep0.add(i);
                if ep.me_key.is_null() || ep.me_key.is_dummy() {
                    continue;
                }
                out.push(self.mm.resurrect(ep.me_key)?);
            }
        }
        Ok(out)
    }

    /// The `(key, value)` pairs, in table order
    pub fn items(&self) -> Result<Vec<(Value, Value)>> {
        let mut out = Vec::with_capacity(self.len());
        let keys = self.keys_object();
        unsafe {
            let size = (*keys).dk_size as usize;
            let ep0 = self.entries_of(keys);
            for i in 0..size {
                let ep = *ep0.add(i);
                if ep.me_key.is_null() || ep.me_key.is_dummy() {
                    continue;
                }
                out.push((
                    self.mm.resurrect(ep.me_key)?,
                    self.mm.resurrect(ep.me_value)?,
                ));
            }
        }
        Ok(out)
    }

    /// Drops every entry, swapping in a fresh minimum-size keys-object
    pub fn clear(&self) -> Result<()> {
        self.mm.transaction(|| {
            let old = self.keys_oid();
            self.mm.snapshot(self.body())?;
            let fresh = self.new_keys_object(MIN_SIZE_COMBINED)?;
            unsafe {
                let body = self.body();
                (*body).ma_keys = fresh;
                (*body).ma_used = 0;
            }
            self.free_keys_object(old)
        })
    }

    fn check_invariants(&self) {
        unsafe {
            let keys = self.keys_object();
            let used = (*self.body()).ma_used;
            assert!(
                (*keys).dk_usable + used <= usable_fraction((*keys).dk_size),
                "dict invariant violated: usable {} + used {} > {}",
                (*keys).dk_usable,
                used,
                usable_fraction((*keys).dk_size)
            );
        }
    }
}

impl fmt::Debug for PersistentDict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PersistentDict(0x{:x})", self.oid.off)
    }
}

pub(crate) fn traverse(mm: &MemoryManager, oid: Oid) -> Result<Vec<Oid>> {
    let body = mm.direct(oid) as *const PDictObject;
    let mut out = Vec::new();
    unsafe {
        let keys = mm.direct((*body).ma_keys) as *const PDictKeysObject;
        let size = (*keys).dk_size as usize;
        let ep0 =
            (keys as *const u8).add(mem::size_of::<PDictKeysObject>()) as *const PDictKeyEntry;
        for i in 0..size {
            let ep = *ep0.add(i);
            if ep.me_key.is_null() || ep.me_key.is_dummy() {
                continue;
            }
            out.push(ep.me_key);
            out.push(ep.me_value);
        }
    }
    Ok(out)
}

pub(crate) fn substructures(mm: &MemoryManager, oid: Oid) -> Result<Vec<(Oid, u32)>> {
    let body = mm.direct(oid) as *const PDictObject;
    Ok(vec![(unsafe { (*body).ma_keys }, PDICTKEYSOBJECT_TYPE_NUM)])
}

pub(crate) fn deallocate(mm: &MemoryManager, oid: Oid) -> Result<()> {
    let dict = PersistentDict::from_oid(mm.clone(), oid);
    dict.free_keys_object(dict.keys_oid())
}

#[cfg(test)]
mod test {
    use crate::err::Error;
    use crate::mm::{create, CreateOptions};
    use crate::value::Value;
    use tempfile::TempDir;

    fn fresh() -> (TempDir, crate::mm::ObjectPool) {
        let dir = TempDir::new().unwrap();
        let pool = create(dir.path().join("dict.pool"), CreateOptions::new().debug(true)).unwrap();
        (dir, pool)
    }

    #[test]
    fn set_get_one_item() {
        let (_dir, pool) = fresh();
        let d = pool.new_dict().unwrap();
        d.set(Value::from("a"), Value::Int(1)).unwrap();
        assert_eq!(d.get(&Value::from("a")).unwrap(), Value::Int(1));
        assert_eq!(d.len(), 1);
    }

    #[test]
    fn get_unknown_key() {
        let (_dir, pool) = fresh();
        let d = pool.new_dict().unwrap();
        match d.get(&Value::from("a")) {
            Err(Error::NotFound(_)) => {}
            other => panic!("expected NotFound, got {:?}", other),
        }
        d.set(Value::from("a"), Value::Int(1)).unwrap();
        assert!(d.get(&Value::from("aa")).is_err());
    }

    #[test]
    fn mixed_key_types() {
        let (_dir, pool) = fresh();
        let d = pool.new_dict().unwrap();
        let data: Vec<(Value, Value)> = vec![
            (Value::from("a"), Value::Int(1)),
            (Value::Int(2), Value::Float(3.7)),
            (Value::Float(4.1), Value::Int(3)),
            (Value::from("something"), Value::from("somewhere")),
            (Value::from("főo"), Value::from("bàr")),
        ];
        for (k, v) in &data {
            d.set(k.clone(), v.clone()).unwrap();
            assert_eq!(&d.get(k).unwrap(), v);
        }
        assert_eq!(d.len(), 5);
        for (k, v) in &data {
            assert_eq!(&d.get(k).unwrap(), v);
        }
    }

    #[test]
    fn replace_value() {
        let (_dir, pool) = fresh();
        let d = pool.new_dict().unwrap();
        d.set(Value::from("a"), Value::Int(1)).unwrap();
        d.set(Value::from("a"), Value::from("foo")).unwrap();
        assert_eq!(d.get(&Value::from("a")).unwrap(), Value::from("foo"));
        assert_eq!(d.len(), 1);
    }

    #[test]
    fn delitem() {
        let (_dir, pool) = fresh();
        let d = pool.new_dict().unwrap();
        d.set(Value::from("a"), Value::Int(1)).unwrap();
        d.del(&Value::from("a")).unwrap();
        assert_eq!(d.len(), 0);
        assert!(d.get(&Value::from("a")).is_err());
        match d.del(&Value::from("a")) {
            Err(Error::NotFound(_)) => {}
            other => panic!("expected NotFound, got {:?}", other),
        }
    }

    #[test]
    fn delete_then_reinsert_reuses_tombstone() {
        let (_dir, pool) = fresh();
        let d = pool.new_dict().unwrap();
        d.set(Value::from("k"), Value::Int(1)).unwrap();
        d.del(&Value::from("k")).unwrap();
        d.set(Value::from("k"), Value::Int(2)).unwrap();
        assert_eq!(d.get(&Value::from("k")).unwrap(), Value::Int(2));
        assert_eq!(d.len(), 1);
    }

    #[test]
    fn resize_at_usable_exhaustion() {
        let (_dir, pool) = fresh();
        let d = pool.new_dict().unwrap();
        // A size-8 table has 5 usable slots; the 6th new key forces a
        // rehash into a size-16 table.
        for i in 0..6 {
            d.set(Value::Int(i * 1000), Value::Int(i)).unwrap();
        }
        assert_eq!(d.len(), 6);
        for i in 0..6 {
            assert_eq!(d.get(&Value::Int(i * 1000)).unwrap(), Value::Int(i));
        }
    }

    #[test]
    fn survives_many_inserts_and_deletes() {
        let (_dir, pool) = fresh();
        let d = pool.new_dict().unwrap();
        for i in 0..200 {
            d.set(Value::Int(i), Value::Int(i * 2)).unwrap();
        }
        for i in (0..200).step_by(2) {
            d.del(&Value::Int(i)).unwrap();
        }
        assert_eq!(d.len(), 100);
        for i in 0..200 {
            if i % 2 == 0 {
                assert!(d.get(&Value::Int(i)).is_err());
            } else {
                assert_eq!(d.get(&Value::Int(i)).unwrap(), Value::Int(i * 2));
            }
        }
    }

    #[test]
    fn iteration_yields_live_keys() {
        let (_dir, pool) = fresh();
        let d = pool.new_dict().unwrap();
        d.set(Value::Int(1), Value::Int(2)).unwrap();
        d.set(Value::Int(45), Value::Int(7)).unwrap();
        d.set(Value::from("a"), Value::from("b")).unwrap();
        d.del(&Value::Int(45)).unwrap();
        let keys = d.keys().unwrap();
        assert_eq!(keys.len(), 2);
        assert!(keys.contains(&Value::Int(1)));
        assert!(keys.contains(&Value::from("a")));
    }

    #[test]
    fn clear_empties_and_stays_usable() {
        let (_dir, pool) = fresh();
        let d = pool
            .new_dict_from(&[
                (Value::from("a"), Value::Int(1)),
                (Value::from("b"), Value::Int(2)),
            ])
            .unwrap();
        d.clear().unwrap();
        assert_eq!(d.len(), 0);
        d.set(Value::Int(1), Value::Int(7)).unwrap();
        assert_eq!(d.get(&Value::Int(1)).unwrap(), Value::Int(7));
    }

    #[test]
    fn unhashable_key_rejected() {
        let (_dir, pool) = fresh();
        let d = pool.new_dict().unwrap();
        let l = pool.new_list().unwrap();
        match d.set(Value::List(l), Value::Int(1)) {
            Err(Error::InvalidArgument(_)) => {}
            other => panic!("expected InvalidArgument, got {:?}", other),
        }
        match d.get(&Value::from("")) {
            Err(Error::InvalidArgument(_)) => {}
            other => panic!("expected InvalidArgument, got {:?}", other),
        }
    }

    #[test]
    fn tuple_keys_work() {
        let (_dir, pool) = fresh();
        let d = pool.new_dict().unwrap();
        let k1 = pool
            .new_tuple(&[Value::Int(1), Value::from("x")])
            .unwrap();
        d.set(Value::Tuple(k1), Value::Int(10)).unwrap();
        // An equal tuple built separately finds the same entry.
        let k2 = pool
            .new_tuple(&[Value::Int(1), Value::from("x")])
            .unwrap();
        assert_eq!(d.get(&Value::Tuple(k2)).unwrap(), Value::Int(10));
    }
}
