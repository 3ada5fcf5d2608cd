//! The volatile value universe and the stable portable hash
//!
//! A [`Value`] is what the application exchanges with the store: either a
//! plain primitive or a handle on a persistent container. Primitives are
//! compared structurally; containers compare by contents, except records,
//! which compare by identity.
//!
//! The host language's hash is not stable across processes, so keys are
//! hashed by rendering them to a canonical byte string (a type tag plus
//! the value, recursing through tuples and frozen sets), taking a 128-bit
//! MD5, and folding the two halves together with XOR. A result that would
//! collide with a set-table sentinel is remapped to a neighboring value.

use crate::dict::PersistentDict;
use crate::err::{Error, Result};
use crate::list::PersistentList;
use crate::object::PersistentObject;
use crate::set::{PersistentFrozenSet, PersistentSet};
use crate::tuple::PersistentTuple;
use std::convert::TryInto;

/// Structural key of an interned primitive
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub(crate) enum InternKey {
    Int(i64),
    Str(String),
    Bytes(Vec<u8>),
}

/// A value the pool understands
#[derive(Clone, Debug)]
pub enum Value {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Bytes(Vec<u8>),
    List(PersistentList),
    Dict(PersistentDict),
    Set(PersistentSet),
    FrozenSet(PersistentFrozenSet),
    Tuple(PersistentTuple),
    Object(PersistentObject),
}

impl Value {
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&PersistentList> {
        match self {
            Value::List(l) => Some(l),
            _ => None,
        }
    }

    pub fn as_dict(&self) -> Option<&PersistentDict> {
        match self {
            Value::Dict(d) => Some(d),
            _ => None,
        }
    }

    pub fn as_set(&self) -> Option<&PersistentSet> {
        match self {
            Value::Set(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_tuple(&self) -> Option<&PersistentTuple> {
        match self {
            Value::Tuple(t) => Some(t),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&PersistentObject> {
        match self {
            Value::Object(o) => Some(o),
            _ => None,
        }
    }

    pub fn is_none(&self) -> bool {
        matches!(self, Value::None)
    }

    fn type_name(&self) -> &'static str {
        match self {
            Value::None => "NoneType",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Str(_) => "str",
            Value::Bytes(_) => "bytes",
            Value::List(_) => "PersistentList",
            Value::Dict(_) => "PersistentDict",
            Value::Set(_) => "PersistentSet",
            Value::FrozenSet(_) => "PersistentFrozenSet",
            Value::Tuple(_) => "PersistentTuple",
            Value::Object(_) => "PersistentObject",
        }
    }
}

impl From<()> for Value {
    fn from(_: ()) -> Value {
        Value::None
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Value {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Value {
        Value::Int(i)
    }
}

impl From<i32> for Value {
    fn from(i: i32) -> Value {
        Value::Int(i as i64)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Value {
        Value::Float(f)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Value {
        Value::Str(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Value {
        Value::Str(s)
    }
}

impl From<Vec<u8>> for Value {
    fn from(b: Vec<u8>) -> Value {
        Value::Bytes(b)
    }
}

impl From<PersistentList> for Value {
    fn from(h: PersistentList) -> Value {
        Value::List(h)
    }
}

impl From<PersistentDict> for Value {
    fn from(h: PersistentDict) -> Value {
        Value::Dict(h)
    }
}

impl From<PersistentSet> for Value {
    fn from(h: PersistentSet) -> Value {
        Value::Set(h)
    }
}

impl From<PersistentFrozenSet> for Value {
    fn from(h: PersistentFrozenSet) -> Value {
        Value::FrozenSet(h)
    }
}

impl From<PersistentTuple> for Value {
    fn from(h: PersistentTuple) -> Value {
        Value::Tuple(h)
    }
}

impl From<PersistentObject> for Value {
    fn from(h: PersistentObject) -> Value {
        Value::Object(h)
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Value) -> bool {
        use Value::*;
        match (self, other) {
            (None, None) => true,
            (Bool(a), Bool(b)) => a == b,
            (Int(a), Int(b)) => a == b,
            (Float(a), Float(b)) => a == b,
            (Int(a), Float(b)) | (Float(b), Int(a)) => *a as f64 == *b,
            (Str(a), Str(b)) => a == b,
            (Bytes(a), Bytes(b)) => a == b,
            (Tuple(a), Tuple(b)) => seq_eq(&a.values(), &b.values()),
            (List(a), List(b)) => seq_eq(&a.values(), &b.values()),
            (Set(a), Set(b)) => set_eq(&a.values(), a.len(), &b.values(), b.len()),
            (Set(a), FrozenSet(b)) | (FrozenSet(b), Set(a)) => {
                set_eq(&a.values(), a.len(), &b.values(), b.len())
            }
            (FrozenSet(a), FrozenSet(b)) => set_eq(&a.values(), a.len(), &b.values(), b.len()),
            (Dict(a), Dict(b)) => dict_eq(a, b),
            (Object(a), Object(b)) => a.oid == b.oid && a.mm.same_pool(&b.mm),
            _ => false,
        }
    }
}

fn seq_eq(a: &Result<Vec<Value>>, b: &Result<Vec<Value>>) -> bool {
    match (a, b) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}

fn set_eq(a: &Result<Vec<Value>>, alen: usize, b: &Result<Vec<Value>>, blen: usize) -> bool {
    match (a, b) {
        (Ok(a), Ok(b)) => alen == blen && a.iter().all(|x| b.contains(x)),
        _ => false,
    }
}

fn dict_eq(a: &PersistentDict, b: &PersistentDict) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let keys = match a.keys() {
        Ok(k) => k,
        Err(_) => return false,
    };
    for k in keys {
        match (a.get(&k), b.get(&k)) {
            (Ok(x), Ok(y)) if x == y => {}
            _ => return false,
        }
    }
    true
}

/// Whether the value satisfies the hashable contract
///
/// Zero-length values are rejected, like the source's `len(s) > 0` rule;
/// mutable containers and records never qualify.
pub(crate) fn is_hashable(v: &Value) -> bool {
    match v {
        Value::None | Value::Bool(_) | Value::Int(_) | Value::Float(_) => true,
        Value::Str(s) => !s.is_empty(),
        Value::Bytes(b) => !b.is_empty(),
        Value::Tuple(t) => {
            t.len() > 0
                && match t.values() {
                    Ok(vs) => vs.iter().all(is_hashable),
                    Err(_) => false,
                }
        }
        Value::FrozenSet(s) => s.len() > 0,
        _ => false,
    }
}

/// Renders `v` to its canonical, unambiguous byte string
fn canonical_bytes(v: &Value, out: &mut Vec<u8>) -> Result<()> {
    match v {
        Value::None => out.push(b'N'),
        Value::Bool(true) => out.push(b'T'),
        Value::Bool(false) => out.push(b'F'),
        Value::Int(i) => {
            out.push(b'i');
            out.extend_from_slice(i.to_string().as_bytes());
        }
        Value::Float(f) => {
            out.push(b'f');
            out.extend_from_slice(format!("{:?}", f).as_bytes());
        }
        Value::Str(s) => {
            out.push(b's');
            out.extend_from_slice(s.as_bytes());
        }
        Value::Bytes(b) => {
            out.push(b'b');
            out.extend_from_slice(b);
        }
        Value::Tuple(t) => {
            out.push(b'(');
            for item in t.values()? {
                out.extend_from_slice(&fixed_hash(&item)?.to_be_bytes());
            }
            out.push(b')');
        }
        Value::FrozenSet(s) => {
            out.push(b'{');
            let mut hashes = Vec::new();
            for item in s.values()? {
                hashes.push(fixed_hash(&item)?);
            }
            hashes.sort_unstable();
            for h in hashes {
                out.extend_from_slice(&h.to_be_bytes());
            }
            out.push(b'}');
        }
        _ => {
            return Err(Error::InvalidArgument(format!(
                "{} is not hashable",
                v.type_name()
            )));
        }
    }
    Ok(())
}

/// Digests the canonical bytes and folds the halves
pub(crate) fn digest_bytes(buf: &[u8]) -> u64 {
    let digest = md5::compute(buf);
    let hi = u64::from_be_bytes(digest.0[..8].try_into().unwrap());
    let lo = u64::from_be_bytes(digest.0[8..].try_into().unwrap());
    remap_sentinel(hi ^ lo)
}

/// Keeps real hashes away from the set-table sentinels
pub(crate) fn remap_sentinel(h: u64) -> u64 {
    if h == 0 {
        1
    } else if h == u64::MAX {
        u64::MAX - 1
    } else {
        h
    }
}

/// The stable portable hash of a key
pub(crate) fn fixed_hash(v: &Value) -> Result<u64> {
    if !is_hashable(v) {
        return Err(Error::InvalidArgument(format!(
            "key of type {} is not hashable",
            v.type_name()
        )));
    }
    if let Value::FrozenSet(s) = v {
        // Frozen sets cache their hash in the persistent body.
        return s.cached_hash();
    }
    let mut buf = Vec::new();
    canonical_bytes(v, &mut buf)?;
    Ok(digest_bytes(&buf))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn primitive_equality() {
        assert_eq!(Value::Int(3), Value::Int(3));
        assert_ne!(Value::Int(3), Value::Int(4));
        assert_eq!(Value::Int(2), Value::Float(2.0));
        assert_ne!(Value::Int(2), Value::Float(2.5));
        assert_eq!(Value::from("abc"), Value::Str("abc".to_string()));
        assert_ne!(Value::from("abc"), Value::Bytes(b"abc".to_vec()));
        assert_eq!(Value::None, Value::None);
        assert_ne!(Value::None, Value::Bool(false));
    }

    #[test]
    fn hash_is_deterministic() {
        let h1 = fixed_hash(&Value::from("simsalabim")).unwrap();
        let h2 = fixed_hash(&Value::from("simsalabim")).unwrap();
        assert_eq!(h1, h2);
        assert_ne!(h1, fixed_hash(&Value::from("madagascar")).unwrap());
    }

    #[test]
    fn hash_discriminates_types() {
        // "2" as int, float, str, and bytes are four different keys.
        let hi = fixed_hash(&Value::Int(2)).unwrap();
        let hf = fixed_hash(&Value::Float(2.0)).unwrap();
        let hs = fixed_hash(&Value::from("2")).unwrap();
        let hb = fixed_hash(&Value::Bytes(b"2".to_vec())).unwrap();
        assert_ne!(hi, hf);
        assert_ne!(hi, hs);
        assert_ne!(hs, hb);
    }

    #[test]
    fn hash_never_hits_sentinels() {
        assert_eq!(remap_sentinel(0), 1);
        assert_eq!(remap_sentinel(u64::MAX), u64::MAX - 1);
        assert_eq!(remap_sentinel(7), 7);
        for i in 0..1000i64 {
            let h = fixed_hash(&Value::Int(i)).unwrap();
            assert_ne!(h, 0);
            assert_ne!(h, u64::MAX);
        }
    }

    #[test]
    fn unhashable_values_are_rejected() {
        match fixed_hash(&Value::from("")) {
            Err(Error::InvalidArgument(_)) => {}
            other => panic!("expected InvalidArgument, got {:?}", other),
        }
        match fixed_hash(&Value::Bytes(Vec::new())) {
            Err(Error::InvalidArgument(_)) => {}
            other => panic!("expected InvalidArgument, got {:?}", other),
        }
    }
}
