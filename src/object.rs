//! Records: user-defined persistent classes
//!
//! A record's persistent body holds a single OID: the attribute dict. The
//! class itself is volatile code, resolved through a registry the program
//! seeds before opening the pool; the persistent type table stores the
//! registered dotted name. Methods and class constants are ordinary Rust
//! `impl` items — only instance attributes live in the pool.
//!
//! The `_p_`/`_v_` prefix protocol of the source becomes an explicit
//! interface here: the persistence protocol is the [`PersistentClass`]
//! trait, volatile per-instance state is an any-map shared through the
//! resurrection cache, and ordinary attributes go through
//! [`get_attr`]/[`set_attr`]/[`del_attr`].
//!
//! [`get_attr`]: struct.PersistentObject.html#method.get_attr
//! [`set_attr`]: struct.PersistentObject.html#method.set_attr
//! [`del_attr`]: struct.PersistentObject.html#method.del_attr

use crate::alloc::pool::Oid;
use crate::dict::PersistentDict;
use crate::err::{Error, Result};
use crate::mm::{MemoryManager, PObject, POBJECT_TYPE_NUM};
use crate::value::Value;
use std::any::Any;
use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::mem;
use std::rc::Rc;

#[repr(C)]
pub(crate) struct PObjectObject {
    pub ob_base: PObject,
    /// OID of the attribute dict
    pub ob_dict: Oid,
}

/// A user-defined record class
///
/// `NAME` is the dotted name stored in the pool's type table; it must be
/// registered (via the create/open options) in every program that opens
/// the pool. `init` runs exactly once, at first construction, with the
/// caller's arguments; `v_init` runs at construction and again on every
/// resurrection, to restore volatile resources.
pub trait PersistentClass {
    const NAME: &'static str;

    fn init(obj: &PersistentObject, args: &[Value]) -> Result<()>;

    fn v_init(_obj: &PersistentObject) {}
}

/// A registered class, as function pointers the manager can dispatch to
pub(crate) struct ClassEntry {
    pub name: &'static str,
    pub init: fn(&PersistentObject, &[Value]) -> Result<()>,
    pub v_init: fn(&PersistentObject),
}

impl ClassEntry {
    pub(crate) fn of<T: PersistentClass>() -> ClassEntry {
        ClassEntry {
            name: T::NAME,
            init: T::init,
            v_init: T::v_init,
        }
    }
}

/// Volatile side of a record, shared between every handle on the same OID
#[derive(Default)]
pub(crate) struct RecordState {
    volatile: RefCell<HashMap<String, Box<dyn Any>>>,
}

/// A handle on a persistent record instance
#[derive(Clone)]
pub struct PersistentObject {
    pub(crate) mm: MemoryManager,
    pub(crate) oid: Oid,
    state: Rc<RecordState>,
}

impl PersistentObject {
    /// The pool's memory manager, for building nested containers in
    /// `init` and methods
    pub fn mm(&self) -> &MemoryManager {
        &self.mm
    }

    #[inline]
    fn body(&self) -> *mut PObjectObject {
        self.mm.direct(self.oid) as *mut PObjectObject
    }

    /// The record's attribute dict
    pub fn attrs(&self) -> PersistentDict {
        PersistentDict::from_oid(self.mm.clone(), unsafe { (*self.body()).ob_dict })
    }

    /// Reads an attribute, failing with `NotFound` when absent
    pub fn get_attr(&self, name: &str) -> Result<Value> {
        self.attrs().get(&Value::from(name)).map_err(|e| match e {
            Error::NotFound(_) => Error::NotFound(format!("attribute '{}'", name)),
            e => e,
        })
    }

    /// Writes an attribute inside a transaction
    pub fn set_attr(&self, name: &str, v: Value) -> Result<()> {
        self.attrs().set(Value::from(name), v)
    }

    /// Deletes an attribute, failing with `NotFound` when absent
    pub fn del_attr(&self, name: &str) -> Result<()> {
        self.attrs().del(&Value::from(name)).map_err(|e| match e {
            Error::NotFound(_) => Error::NotFound(format!("attribute '{}'", name)),
            e => e,
        })
    }

    /// Whether the attribute exists
    pub fn has_attr(&self, name: &str) -> Result<bool> {
        self.attrs().contains_key(&Value::from(name))
    }

    /// The volatile attribute bag, shared by every handle on this OID
    ///
    /// Not persisted; typically populated by `v_init` with things like
    /// open terminals or sockets.
    pub fn volatile(&self) -> &RefCell<HashMap<String, Box<dyn Any>>> {
        &self.state.volatile
    }
}

impl fmt::Debug for PersistentObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PersistentObject(0x{:x})", self.oid.off)
    }
}

pub(crate) fn new_record<T: PersistentClass>(
    mm: &MemoryManager,
    args: &[Value],
) -> Result<PersistentObject> {
    if !mm.inner.registry.contains_key(T::NAME) {
        return Err(Error::Usage("record class not registered with this pool"));
    }
    mm.transaction(|| {
        let code = mm.get_type_code(T::NAME)?;
        let oid = mm.zalloc(mem::size_of::<PObjectObject>(), POBJECT_TYPE_NUM)?;
        let dict = PersistentDict::new(mm)?;
        unsafe {
            let body = mm.direct(oid) as *mut PObjectObject;
            (*body).ob_base.ob_type = code;
            (*body).ob_dict = dict.oid;
        }
        mm.incref(dict.oid)?;
        let state = Rc::new(RecordState::default());
        mm.inner
            .records
            .borrow_mut()
            .insert(oid.off, Rc::downgrade(&state));
        let obj = PersistentObject {
            mm: mm.clone(),
            oid,
            state,
        };
        T::init(&obj, args)?;
        T::v_init(&obj);
        Ok(obj)
    })
}

/// Re-attaches a volatile handle to an existing record body
///
/// The handle is inserted into the resurrection cache before `v_init`
/// runs, so cyclic graphs resurrect without looping.
pub(crate) fn resurrect_record(
    mm: &MemoryManager,
    oid: Oid,
    class_name: &str,
) -> Result<PersistentObject> {
    if let Some(state) = mm
        .inner
        .records
        .borrow()
        .get(&oid.off)
        .and_then(std::rc::Weak::upgrade)
    {
        return Ok(PersistentObject {
            mm: mm.clone(),
            oid,
            state,
        });
    }
    let v_init = mm
        .inner
        .registry
        .get(class_name)
        .map(|entry| entry.v_init)
        .ok_or_else(|| Error::Corruption(format!("unregistered class '{}'", class_name)))?;
    let state = Rc::new(RecordState::default());
    mm.inner
        .records
        .borrow_mut()
        .insert(oid.off, Rc::downgrade(&state));
    let obj = PersistentObject {
        mm: mm.clone(),
        oid,
        state,
    };
    v_init(&obj);
    Ok(obj)
}

pub(crate) fn traverse(mm: &MemoryManager, oid: Oid) -> Result<Vec<Oid>> {
    let body = mm.direct(oid) as *const PObjectObject;
    Ok(vec![unsafe { (*body).ob_dict }])
}

pub(crate) fn deallocate(mm: &MemoryManager, oid: Oid) -> Result<()> {
    let body = mm.direct(oid) as *const PObjectObject;
    mm.decref(unsafe { (*body).ob_dict })
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::mm::{create, CreateOptions};
    use tempfile::TempDir;

    struct Point;

    impl PersistentClass for Point {
        const NAME: &'static str = "test.Point";

        fn init(obj: &PersistentObject, args: &[Value]) -> Result<()> {
            if args.len() != 2 {
                return Err(Error::InvalidArgument(format!(
                    "Point takes 2 arguments, {} given",
                    args.len()
                )));
            }
            obj.set_attr("x", args[0].clone())?;
            obj.set_attr("y", args[1].clone())
        }

        fn v_init(obj: &PersistentObject) {
            obj.volatile()
                .borrow_mut()
                .insert("awake".to_string(), Box::new(true));
        }
    }

    fn fresh() -> (TempDir, crate::mm::ObjectPool) {
        let dir = TempDir::new().unwrap();
        let pool = create(
            dir.path().join("object.pool"),
            CreateOptions::new().register::<Point>(),
        )
        .unwrap();
        (dir, pool)
    }

    #[test]
    fn attributes_roundtrip() {
        let (_dir, pool) = fresh();
        let p = pool
            .new_object::<Point>(&[Value::Int(3), Value::Int(4)])
            .unwrap();
        assert_eq!(p.get_attr("x").unwrap(), Value::Int(3));
        assert_eq!(p.get_attr("y").unwrap(), Value::Int(4));
        p.set_attr("x", Value::Int(5)).unwrap();
        assert_eq!(p.get_attr("x").unwrap(), Value::Int(5));
    }

    #[test]
    fn missing_attribute_is_not_found() {
        let (_dir, pool) = fresh();
        let p = pool
            .new_object::<Point>(&[Value::Int(0), Value::Int(0)])
            .unwrap();
        match p.get_attr("z") {
            Err(Error::NotFound(_)) => {}
            other => panic!("expected NotFound, got {:?}", other),
        }
        p.del_attr("x").unwrap();
        match p.del_attr("x") {
            Err(Error::NotFound(_)) => {}
            other => panic!("expected NotFound, got {:?}", other),
        }
    }

    #[test]
    fn wrong_arity_fails_construction() {
        let (_dir, pool) = fresh();
        match pool.new_object::<Point>(&[Value::Int(1)]) {
            Err(Error::InvalidArgument(_)) => {}
            other => panic!("expected InvalidArgument, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn unregistered_class_is_rejected() {
        struct Ghost;
        impl PersistentClass for Ghost {
            const NAME: &'static str = "test.Ghost";
            fn init(_obj: &PersistentObject, _args: &[Value]) -> Result<()> {
                Ok(())
            }
        }
        let (_dir, pool) = fresh();
        match pool.new_object::<Ghost>(&[]) {
            Err(Error::Usage(_)) => {}
            other => panic!("expected Usage, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn resurrection_shares_volatile_state() {
        let (_dir, pool) = fresh();
        let p = pool
            .new_object::<Point>(&[Value::Int(1), Value::Int(2)])
            .unwrap();
        assert!(p.volatile().borrow().contains_key("awake"));
        pool.set_root(Value::Object(p.clone())).unwrap();

        // A second handle resurrected from the root sees the same bag.
        p.volatile()
            .borrow_mut()
            .insert("mark".to_string(), Box::new(7i32));
        let again = match pool.root().unwrap() {
            Value::Object(o) => o,
            other => panic!("root is {:?}", other),
        };
        assert!(again.volatile().borrow().contains_key("mark"));
    }
}
