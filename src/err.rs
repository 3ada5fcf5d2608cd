//! Error taxonomy of the object store

use std::error;
use std::fmt::{self, Display, Formatter};
use std::io;

/// Errors reported by the pool, the memory manager, and the persistent
/// containers.
///
/// Errors coming from the operating system while mapping, flushing, or
/// growing the pool file are translated by inspecting `errno`: `EINVAL`
/// maps to [`InvalidArgument`], `ENOMEM` to [`OutOfMemory`], and everything
/// else to [`Io`].
///
/// [`InvalidArgument`]: #variant.InvalidArgument
/// [`OutOfMemory`]: #variant.OutOfMemory
/// [`Io`]: #variant.Io
#[derive(Debug)]
pub enum Error {
    /// A key, index, or attribute is absent.
    NotFound(String),

    /// The pool allocator cannot satisfy an allocation request.
    OutOfMemory,

    /// The hashable contract was violated, a pool size is out of range, or
    /// a constructor received the wrong arguments.
    InvalidArgument(String),

    /// A mutating operation was invoked on an immutable container.
    NotAllowed(&'static str),

    /// A set operator was applied to a non-set operand, or two persistent
    /// values of incompatible types were combined.
    TypeMismatch(String),

    /// The pool contents cannot be reconstructed into a consistent
    /// reachable graph.
    Corruption(String),

    /// The pool file cannot be mapped, flushed, or closed.
    Io(io::Error),

    /// The store API was misused: a persistent mutation outside a
    /// transaction, a commit without a begin, or a double close.
    Usage(&'static str),
}

impl Display for Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Error::NotFound(what) => write!(f, "not found: {}", what),
            Error::OutOfMemory => write!(f, "out of pool memory"),
            Error::InvalidArgument(what) => write!(f, "invalid argument: {}", what),
            Error::NotAllowed(what) => write!(f, "operation not allowed: {}", what),
            Error::TypeMismatch(what) => write!(f, "type mismatch: {}", what),
            Error::Corruption(what) => write!(f, "pool corruption: {}", what),
            Error::Io(e) => write!(f, "pool i/o error: {}", e),
            Error::Usage(what) => write!(f, "usage error: {}", what),
        }
    }
}

impl error::Error for Error {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        match e.raw_os_error() {
            Some(libc::EINVAL) => Error::InvalidArgument(e.to_string()),
            Some(libc::ENOMEM) => Error::OutOfMemory,
            _ => Error::Io(e),
        }
    }
}

/// A `Result` type carrying the store's [`Error`](enum.Error.html)
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn errno_translation() {
        let e: Error = io::Error::from_raw_os_error(libc::EINVAL).into();
        match e {
            Error::InvalidArgument(_) => {}
            other => panic!("expected InvalidArgument, got {:?}", other),
        }
        let e: Error = io::Error::from_raw_os_error(libc::ENOMEM).into();
        match e {
            Error::OutOfMemory => {}
            other => panic!("expected OutOfMemory, got {:?}", other),
        }
        let e: Error = io::Error::from_raw_os_error(libc::EACCES).into();
        match e {
            Error::Io(_) => {}
            other => panic!("expected Io, got {:?}", other),
        }
    }
}
