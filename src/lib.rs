//! *pmemobj* is a persistent object store: typed, mutable containers
//! whose in-memory representation is identical to their on-media
//! representation in a memory-mapped pool file. Programs open a pool,
//! obtain a single durable root object, and mutate rich object graphs
//! through ordinary container operations; every mutation is grouped into
//! a transaction that either becomes durable as a whole or is undone on
//! the next open.
//!
//! # Object model
//!
//! Persistent values are addressed by opaque 128-bit object-ids and carry
//! a header with a reference count and a type code. The store provides:
//!
//! * [`PersistentList`]: a contiguous growable array
//! * [`PersistentDict`]: an open-addressed hash table with perturb probing
//! * [`PersistentSet`] / [`PersistentFrozenSet`]: open-addressed hash sets
//! * [`PersistentTuple`]: an immutable fixed-length array
//! * [`PersistentObject`]: a record with a dict-backed attribute bag and
//!   dispatch to a volatile class registered via [`PersistentClass`]
//!
//! Primitive values (none, booleans, integers, floats, strings, byte
//! strings) are interned where it pays: the singletons are allocated once
//! per pool and reused.
//!
//! # Transactions and recovery
//!
//! All mutation runs under an undo log: each container operation opens a
//! transaction (joining the running one, if any), snapshots every byte
//! range it is about to write, and commits on success. An abort, or a
//! crash, rewinds every snapshotted range and drops the blocks the
//! transaction allocated. A pool that was not closed cleanly additionally
//! gets a mark-and-sweep pass on open, reclaiming leaked blocks and
//! repairing reference counts the undo log cannot know about.
//!
//! # Examples
//!
//! ```no_run
//! use pmemobj::{create, CreateOptions, Value};
//!
//! fn main() -> pmemobj::Result<()> {
//!     let pool = create("example.pool", CreateOptions::new())?;
//!
//!     let todo = pool.new_list()?;
//!     pool.set_root(Value::List(todo.clone()))?;
//!
//!     pool.transaction(|| {
//!         todo.append(Value::from("write the docs"))?;
//!         todo.append(Value::from("ship it"))
//!     })?;
//!
//!     pool.close()
//! }
//! ```
//!
//! A pool has a single active mutator: nothing here is thread-safe, by
//! design. Embedding the store in a threaded host requires external
//! serialization.
//!
//! [`PersistentList`]: struct.PersistentList.html
//! [`PersistentDict`]: struct.PersistentDict.html
//! [`PersistentSet`]: struct.PersistentSet.html
//! [`PersistentFrozenSet`]: struct.PersistentFrozenSet.html
//! [`PersistentTuple`]: struct.PersistentTuple.html
//! [`PersistentObject`]: struct.PersistentObject.html
//! [`PersistentClass`]: trait.PersistentClass.html

pub mod alloc;
pub mod err;
pub mod stm;
pub mod utils;

mod dict;
mod list;
mod mm;
mod object;
mod set;
mod tests;
mod tuple;
mod value;

pub use alloc::pool::{Oid, DEFAULT_POOL_SIZE, DUMMY_OID, MIN_POOL_SIZE, OID_NULL};
pub use dict::PersistentDict;
pub use err::{Error, Result};
pub use list::PersistentList;
pub use mm::{create, open, CreateOptions, GcStats, MemoryManager, ObjectPool, OpenOptions};
pub use object::{PersistentClass, PersistentObject};
pub use set::{PersistentFrozenSet, PersistentSet, ValueIterable};
pub use tuple::PersistentTuple;
pub use value::Value;
