//! An immutable fixed-length persistent array of object-ids
//!
//! The body reuses the list layout; the items array is sized exactly at
//! construction and every mutating operation is rejected.

use crate::alloc::pool::Oid;
use crate::err::{Error, Result};
use crate::list::PListObject;
use crate::mm::{MemoryManager, POBJECT_TYPE_NUM, TYPE_TUPLE};
use crate::value::Value;
use std::fmt;
use std::mem;

/// Allocator type number of tuple items arrays
pub(crate) const TUPLE_POBJPTR_ARRAY_TYPE_NUM: u32 = 50;

/// Persistent version of an immutable sequence
#[derive(Clone)]
pub struct PersistentTuple {
    pub(crate) mm: MemoryManager,
    pub(crate) oid: Oid,
}

impl PersistentTuple {
    pub(crate) fn new(mm: &MemoryManager, items: &[Value]) -> Result<PersistentTuple> {
        mm.transaction(|| {
            let code = mm.get_type_code(TYPE_TUPLE)?;
            let oid = mm.zalloc(mem::size_of::<PListObject>(), POBJECT_TYPE_NUM)?;
            unsafe {
                (*(mm.direct(oid) as *mut PListObject)).ob_base.ob_base.ob_type = code;
            }
            if !items.is_empty() {
                let items_oid = mm.zalloc(
                    items.len() * mem::size_of::<Oid>(),
                    TUPLE_POBJPTR_ARRAY_TYPE_NUM,
                )?;
                for (i, v) in items.iter().enumerate() {
                    let v_oid = mm.persist(v)?;
                    unsafe { *(mm.direct(items_oid) as *mut Oid).add(i) = v_oid };
                    mm.incref(v_oid)?;
                }
                unsafe {
                    let body = mm.direct(oid) as *mut PListObject;
                    (*body).ob_items = items_oid;
                    (*body).ob_base.ob_size = items.len() as u64;
                    (*body).allocated = items.len() as u64;
                }
            }
            Ok(PersistentTuple { mm: mm.clone(), oid })
        })
    }

    pub(crate) fn from_oid(mm: MemoryManager, oid: Oid) -> PersistentTuple {
        PersistentTuple { mm, oid }
    }

    #[inline]
    fn body(&self) -> *const PListObject {
        self.mm.direct(self.oid) as *const PListObject
    }

    /// Number of elements
    pub fn len(&self) -> usize {
        unsafe { (*self.body()).ob_base.ob_size as usize }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the element at `index`
    pub fn get(&self, index: usize) -> Result<Value> {
        if index >= self.len() {
            return Err(Error::NotFound(format!(
                "tuple index {} out of range",
                index
            )));
        }
        let items = unsafe { (*self.body()).ob_items };
        let oid = unsafe { *(self.mm.direct(items) as *const Oid).add(index) };
        self.mm.resurrect(oid)
    }

    /// Collects the elements into a volatile vector
    pub fn values(&self) -> Result<Vec<Value>> {
        (0..self.len()).map(|i| self.get(i)).collect()
    }

    pub fn contains(&self, v: &Value) -> Result<bool> {
        for i in 0..self.len() {
            if self.get(i)? == *v {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Tuples reject item assignment
    pub fn set(&self, _index: usize, _v: Value) -> Result<()> {
        Err(Error::NotAllowed(
            "PersistentTuple does not support item assignment",
        ))
    }

    /// Tuples reject item deletion
    pub fn del_item(&self, _index: usize) -> Result<()> {
        Err(Error::NotAllowed(
            "PersistentTuple does not support item deletion",
        ))
    }

    /// Tuples reject insertion
    pub fn insert(&self, _index: usize, _v: Value) -> Result<()> {
        Err(Error::NotAllowed("PersistentTuple does not support insertion"))
    }

    /// Tuples reject append
    pub fn append(&self, _v: Value) -> Result<()> {
        Err(Error::NotAllowed("PersistentTuple does not support append"))
    }

    /// Tuples reject clearing
    pub fn clear(&self) -> Result<()> {
        Err(Error::NotAllowed("PersistentTuple does not support clear"))
    }
}

impl fmt::Debug for PersistentTuple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PersistentTuple(0x{:x})", self.oid.off)
    }
}

pub(crate) fn traverse(mm: &MemoryManager, oid: Oid) -> Result<Vec<Oid>> {
    crate::list::traverse(mm, oid)
}

pub(crate) fn substructures(mm: &MemoryManager, oid: Oid) -> Result<Vec<(Oid, u32)>> {
    let body = mm.direct(oid) as *const PListObject;
    let items = unsafe { (*body).ob_items };
    Ok(if items.is_null() {
        Vec::new()
    } else {
        vec![(items, TUPLE_POBJPTR_ARRAY_TYPE_NUM)]
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
