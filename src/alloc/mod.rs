//! Pool binding: file mapping, typed block allocation, transactions

pub mod heap;
pub mod pool;

pub use heap::Heap;
pub use pool::{Oid, PoolBase, PoolHeader, DEFAULT_POOL_SIZE, DUMMY_OID, MIN_POOL_SIZE, OID_NULL};
