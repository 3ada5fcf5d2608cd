//! A contiguous growable persistent array of object-ids
//!
//! The list body holds the logical length, the OID of an external items
//! array, and the array's capacity. Growth reallocates the items array
//! with the amortized-doubling schedule `len + 1 + (len >> 3) + 6`;
//! insertion and removal shift the tail one slot, snapshotting the
//! affected range first.

use crate::alloc::pool::{Oid, OID_NULL};
use crate::err::{Error, Result};
use crate::mm::{MemoryManager, PVarObject, POBJECT_TYPE_NUM, TYPE_LIST};
use crate::value::Value;
use std::fmt;
use std::mem;
use std::ptr;

/// Allocator type number of list items arrays
pub(crate) const LIST_POBJPTR_ARRAY_TYPE_NUM: u32 = 30;

/// Capacity floor for a growing list
const LIST_MIN_ALLOC: u64 = 8;

#[repr(C)]
pub(crate) struct PListObject {
    pub ob_base: PVarObject,
    /// OID of the external OID array, `OID_NULL` while empty
    pub ob_items: Oid,
    /// Capacity of the items array in slots
    pub allocated: u64,
}

/// Persistent version of a growable array
#[derive(Clone)]
pub struct PersistentList {
    pub(crate) mm: MemoryManager,
    pub(crate) oid: Oid,
}

impl PersistentList {
    pub(crate) fn new(mm: &MemoryManager) -> Result<PersistentList> {
        mm.transaction(|| {
            let code = mm.get_type_code(TYPE_LIST)?;
            let oid = mm.zalloc(mem::size_of::<PListObject>(), POBJECT_TYPE_NUM)?;
            unsafe {
                (*(mm.direct(oid) as *mut PListObject)).ob_base.ob_base.ob_type = code;
            }
            Ok(PersistentList { mm: mm.clone(), oid })
        })
    }

    pub(crate) fn from_oid(mm: MemoryManager, oid: Oid) -> PersistentList {
        PersistentList { mm, oid }
    }

    #[inline]
    fn body(&self) -> *mut PListObject {
        self.mm.direct(self.oid) as *mut PListObject
    }

    #[inline]
    fn items(&self) -> *mut Oid {
        let items = unsafe { (*self.body()).ob_items };
        debug_assert!(!items.is_null());
        self.mm.direct(items) as *mut Oid
    }

    /// Logical length of the list
    pub fn len(&self) -> usize {
        unsafe { (*self.body()).ob_base.ob_size as usize }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the element at `index`
    pub fn get(&self, index: usize) -> Result<Value> {
        if index >= self.len() {
            return Err(Error::NotFound(format!("list index {} out of range", index)));
        }
        let oid = unsafe { *self.items().add(index) };
        self.mm.resurrect(oid)
    }

    /// Replaces the element at `index`
    ///
    /// The old element is decref'ed after the new one is stored.
    pub fn set(&self, index: usize, v: Value) -> Result<()> {
        if index >= self.len() {
            return Err(Error::NotFound(format!("list index {} out of range", index)));
        }
        self.mm.transaction(|| {
            let v_oid = self.mm.persist(&v)?;
            let slot = unsafe { self.items().add(index) };
            self.mm.snapshot(slot)?;
            let old = unsafe { *slot };
            unsafe { *slot = v_oid };
            self.mm.incref(v_oid)?;
            self.mm.decref(old)
        })
    }

    /// Appends an element
    pub fn append(&self, v: Value) -> Result<()> {
        self.insert(self.len(), v)
    }

    /// Appends every element of `items`
    pub fn extend(&self, items: &[Value]) -> Result<()> {
        self.mm.transaction(|| {
            for v in items {
                self.append(v.clone())?;
            }
            Ok(())
        })
    }

    /// Inserts an element at `index`, shifting `[index..len)` one slot
    /// right; an index past the end appends
    pub fn insert(&self, index: usize, v: Value) -> Result<()> {
        self.mm.transaction(|| {
            let v_oid = self.mm.persist(&v)?;
            self.reserve_for_insert()?;
            let n = self.len();
            let index = index.min(n);
            self.mm.snapshot(self.body())?;
            let items = self.items();
            unsafe {
                let tail = self.mm.pool().off_of(items.add(index));
                self.mm
                    .snapshot_range(tail, (n - index + 1) * mem::size_of::<Oid>())?;
                ptr::copy(items.add(index), items.add(index + 1), n - index);
                *items.add(index) = v_oid;
                (*self.body()).ob_base.ob_size = (n + 1) as u64;
            }
            self.mm.incref(v_oid)
        })
    }

    /// Removes and returns the element at `index`, shifting the tail left
    pub fn pop(&self, index: usize) -> Result<Value> {
        if index >= self.len() {
            return Err(Error::NotFound(format!("list index {} out of range", index)));
        }
        self.mm.transaction(|| {
            let v = self.get(index)?;
            let n = self.len();
            self.mm.snapshot(self.body())?;
            let items = self.items();
            unsafe {
                let tail = self.mm.pool().off_of(items.add(index));
                self.mm
                    .snapshot_range(tail, (n - index) * mem::size_of::<Oid>())?;
                let old = *items.add(index);
                ptr::copy(items.add(index + 1), items.add(index), n - index - 1);
                (*self.body()).ob_base.ob_size = (n - 1) as u64;
                self.mm.decref(old)?;
            }
            Ok(v)
        })
    }

    /// Removes the element at `index`
    pub fn del_item(&self, index: usize) -> Result<()> {
        self.pop(index).map(|_| ())
    }

    /// Drops every element and releases the items array
    pub fn clear(&self) -> Result<()> {
        self.mm.transaction(|| {
            let n = self.len();
            self.mm.snapshot(self.body())?;
            for i in 0..n {
                let oid = unsafe { *self.items().add(i) };
                self.mm.decref(oid)?;
            }
            unsafe {
                let body = self.body();
                let old = (*body).ob_items;
                (*body).ob_base.ob_size = 0;
                (*body).allocated = 0;
                (*body).ob_items = OID_NULL;
                if !old.is_null() {
                    self.mm.free(old)?;
                }
            }
            Ok(())
        })
    }

    /// Collects the elements into a volatile vector
    pub fn values(&self) -> Result<Vec<Value>> {
        (0..self.len()).map(|i| self.get(i)).collect()
    }

    /// Whether some element compares equal to `v`
    pub fn contains(&self, v: &Value) -> Result<bool> {
        for i in 0..self.len() {
            if self.get(i)? == *v {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Index of the first element equal to `v`
    pub fn index(&self, v: &Value) -> Result<Option<usize>> {
        for i in 0..self.len() {
            if self.get(i)? == *v {
                return Ok(Some(i));
            }
        }
        Ok(None)
    }

    pub fn iter(&self) -> ListIter<'_> {
        ListIter { list: self, index: 0 }
    }

    /// Grows the items array when it is full
    fn reserve_for_insert(&self) -> Result<()> {
        let body = self.body();
        let (size, allocated, old_items) = unsafe {
            ((*body).ob_base.ob_size, (*body).allocated, (*body).ob_items)
        };
        if allocated > size {
            return Ok(());
        }
        let new_allocated = (size + 1 + (size >> 3) + 6).max(LIST_MIN_ALLOC);
        let new_items = self.mm.zalloc(
            new_allocated as usize * mem::size_of::<Oid>(),
            LIST_POBJPTR_ARRAY_TYPE_NUM,
        )?;
        unsafe {
            if !old_items.is_null() {
                ptr::copy_nonoverlapping(
                    self.mm.direct(old_items) as *const Oid,
                    self.mm.direct(new_items) as *mut Oid,
                    size as usize,
                );
            }
            // Re-derive the body pointer: the allocation went through the
            // journal, nothing moved, but keep the discipline visible.
            let body = self.body();
            self.mm.snapshot(body)?;
            (*body).ob_items = new_items;
            (*body).allocated = new_allocated;
            if !old_items.is_null() {
                self.mm.free(old_items)?;
            }
        }
        Ok(())
    }
}

pub struct ListIter<'a> {
    list: &'a PersistentList,
    index: usize,
}

impl<'a> Iterator for ListIter<'a> {
    type Item = Result<Value>;

    fn next(&mut self) -> Option<Result<Value>> {
        if self.index >= self.list.len() {
            None
        } else {
            self.index += 1;
            Some(self.list.get(self.index - 1))
        }
    }
}

impl fmt::Debug for PersistentList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PersistentList(0x{:x})", self.oid.off)
    }
}

pub(crate) fn traverse(mm: &MemoryManager, oid: Oid) -> Result<Vec<Oid>> {
    let body = mm.direct(oid) as *const PListObject;
    let mut out = Vec::new();
    unsafe {
        let n = (*body).ob_base.ob_size as usize;
        if n > 0 {
            let items = mm.direct((*body).ob_items) as *const Oid;
            for i in 0..n {
                out.push(*items.add(i));
            }
        }
    }
    Ok(out)
}

pub(crate) fn substructures(mm: &MemoryManager, oid: Oid) -> Result<Vec<(Oid, u32)>> {
    let body = mm.direct(oid) as *const PListObject;
    let items = unsafe { (*body).ob_items };
    Ok(if items.is_null() {
        Vec::new()
    } else {
        vec![(items, LIST_POBJPTR_ARRAY_TYPE_NUM)]
    })
}

pub(crate) fn deallocate(mm: &MemoryManager, oid: Oid) -> Result<()> {
    for child in traverse(mm, oid)? {
        mm.decref(child)?;
    }
    let body = mm.direct(oid) as *const PListObject;
    let items = unsafe { (*body).ob_items };
    if !items.is_null() {
        mm.free(items)?;
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use crate::mm::{create, CreateOptions};
    use crate::value::Value;
    use tempfile::TempDir;

    fn fresh() -> (TempDir, crate::mm::ObjectPool) {
        let dir = TempDir::new().unwrap();
        let pool = create(dir.path().join("list.pool"), CreateOptions::new().debug(true)).unwrap();
        (dir, pool)
    }

    #[test]
    fn append_and_get() {
        let (_dir, pool) = fresh();
        let list = pool.new_list().unwrap();
        assert!(list.is_empty());
        list.append(Value::Int(1)).unwrap();
        list.append(Value::from("two")).unwrap();
        list.append(Value::Float(3.0)).unwrap();
        assert_eq!(list.len(), 3);
        assert_eq!(list.get(0).unwrap(), Value::Int(1));
        assert_eq!(list.get(1).unwrap(), Value::from("two"));
        assert_eq!(list.get(2).unwrap(), Value::Float(3.0));
        assert!(list.get(3).is_err());
    }

    #[test]
    fn insert_at_zero_shifts_right() {
        let (_dir, pool) = fresh();
        let list = pool
            .new_list_from(&[Value::Int(10), Value::Int(20), Value::Int(30)])
            .unwrap();
        list.insert(0, Value::Int(5)).unwrap();
        assert_eq!(list.len(), 4);
        assert_eq!(
            list.values().unwrap(),
            vec![Value::Int(5), Value::Int(10), Value::Int(20), Value::Int(30)]
        );
    }

    #[test]
    fn set_replaces_in_place() {
        let (_dir, pool) = fresh();
        let list = pool.new_list_from(&[Value::Int(1), Value::Int(2)]).unwrap();
        list.set(1, Value::from("swapped")).unwrap();
        assert_eq!(list.get(1).unwrap(), Value::from("swapped"));
        assert_eq!(list.len(), 2);
    }

    #[test]
    fn pop_shifts_left() {
        let (_dir, pool) = fresh();
        let list = pool
            .new_list_from(&[Value::Int(1), Value::Int(2), Value::Int(3)])
            .unwrap();
        let v = list.pop(1).unwrap();
        assert_eq!(v, Value::Int(2));
        assert_eq!(list.values().unwrap(), vec![Value::Int(1), Value::Int(3)]);
        assert!(list.pop(5).is_err());
    }

    #[test]
    fn growth_preserves_contents() {
        let (_dir, pool) = fresh();
        let list = pool.new_list().unwrap();
        // Push through several capacity doublings.
        for i in 0..100 {
            list.append(Value::Int(i)).unwrap();
        }
        assert_eq!(list.len(), 100);
        for i in 0..100 {
            assert_eq!(list.get(i as usize).unwrap(), Value::Int(i));
        }
    }

    #[test]
    fn clear_empties_the_list() {
        let (_dir, pool) = fresh();
        let list = pool
            .new_list_from(&[Value::Int(1), Value::from("x")])
            .unwrap();
        list.clear().unwrap();
        assert_eq!(list.len(), 0);
        // Still usable afterwards.
        list.append(Value::Int(7)).unwrap();
        assert_eq!(list.get(0).unwrap(), Value::Int(7));
    }

    #[test]
    fn contains_and_index() {
        let (_dir, pool) = fresh();
        let list = pool
            .new_list_from(&[Value::from("a"), Value::Int(3)])
            .unwrap();
        assert!(list.contains(&Value::from("a")).unwrap());
        assert!(!list.contains(&Value::from("b")).unwrap());
        assert_eq!(list.index(&Value::Int(3)).unwrap(), Some(1));
        assert_eq!(list.index(&Value::Int(4)).unwrap(), None);
    }
}
