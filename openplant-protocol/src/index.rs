//! Key lists sent in the `Indexes` property.
//!
//! The list travels as one extension record tagged `16 + element type`:
//! concatenated big-endian integers for int keys, consecutive MessagePack
//! strings for string keys.

use crate::error::ProtocolError;
use crate::msgpack::{self, MsgValue, Reader};
use crate::types::{INT32_ARRAY, INT64_ARRAY, STRING_ARRAY};
use crate::value::Value;
use bytes::{BufMut, Bytes};
use std::collections::HashSet;
use std::hash::Hash;

/// A typed list of lookup keys.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IndexKeys {
    Int32(Vec<i32>),
    Int64(Vec<i64>),
    Str(Vec<String>),
}

impl IndexKeys {
    /// Extension tag of this key list.
    pub fn tag(&self) -> i8 {
        match self {
            IndexKeys::Int32(_) => INT32_ARRAY,
            IndexKeys::Int64(_) => INT64_ARRAY,
            IndexKeys::Str(_) => STRING_ARRAY,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            IndexKeys::Int32(v) => v.len(),
            IndexKeys::Int64(v) => v.len(),
            IndexKeys::Str(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns an empty list of the same key type.
    pub fn empty_like(&self) -> Self {
        match self {
            IndexKeys::Int32(_) => IndexKeys::Int32(Vec::new()),
            IndexKeys::Int64(_) => IndexKeys::Int64(Vec::new()),
            IndexKeys::Str(_) => IndexKeys::Str(Vec::new()),
        }
    }

    /// Keys as values, in list order.
    pub fn values(&self) -> Vec<Value> {
        match self {
            IndexKeys::Int32(v) => v.iter().map(|k| Value::Int32(*k)).collect(),
            IndexKeys::Int64(v) => v.iter().map(|k| Value::Int64(*k)).collect(),
            IndexKeys::Str(v) => v.iter().map(|k| Value::String(k.clone())).collect(),
        }
    }

    fn mismatch(&self, other: &IndexKeys) -> ProtocolError {
        ProtocolError::malformed(
            "index keys",
            format!("cannot mix tag {} with tag {}", self.tag(), other.tag()),
        )
    }

    /// Appends the keys of `other` not already present, keeping order.
    pub fn union_with(&mut self, other: &IndexKeys) -> Result<(), ProtocolError> {
        fn merge<T: Clone + Eq + Hash>(dst: &mut Vec<T>, src: &[T]) {
            let mut seen: HashSet<T> = dst.iter().cloned().collect();
            for k in src {
                if seen.insert(k.clone()) {
                    dst.push(k.clone());
                }
            }
        }
        if self.tag() != other.tag() {
            return Err(self.mismatch(other));
        }
        match (self, other) {
            (IndexKeys::Int32(a), IndexKeys::Int32(b)) => merge(a, b),
            (IndexKeys::Int64(a), IndexKeys::Int64(b)) => merge(a, b),
            (IndexKeys::Str(a), IndexKeys::Str(b)) => merge(a, b),
            _ => {}
        }
        Ok(())
    }

    /// Removes every key present in `other`.
    pub fn subtract(&mut self, other: &IndexKeys) -> Result<(), ProtocolError> {
        fn remove<T: Eq + Hash>(dst: &mut Vec<T>, src: &[T]) {
            let gone: HashSet<&T> = src.iter().collect();
            dst.retain(|k| !gone.contains(k));
        }
        if self.tag() != other.tag() {
            return Err(self.mismatch(other));
        }
        match (self, other) {
            (IndexKeys::Int32(a), IndexKeys::Int32(b)) => remove(a, b),
            (IndexKeys::Int64(a), IndexKeys::Int64(b)) => remove(a, b),
            (IndexKeys::Str(a), IndexKeys::Str(b)) => remove(a, b),
            _ => {}
        }
        Ok(())
    }

    fn payload(&self) -> Vec<u8> {
        let mut out = Vec::new();
        match self {
            IndexKeys::Int32(v) => v.iter().for_each(|k| out.put_i32(*k)),
            IndexKeys::Int64(v) => v.iter().for_each(|k| out.put_i64(*k)),
            IndexKeys::Str(v) => v.iter().for_each(|k| msgpack::write_str(&mut out, k)),
        }
        out
    }

    pub fn encode(&self, out: &mut impl BufMut) {
        msgpack::write_ext(out, self.tag(), &self.payload());
    }

    /// Parses an extension record body.
    pub fn from_ext(tag: i8, data: &[u8]) -> Result<Self, ProtocolError> {
        let mut r = Reader::new(data);
        match tag {
            INT32_ARRAY => {
                let mut keys = Vec::with_capacity(data.len() / 4);
                while !r.is_empty() {
                    keys.push(r.read_i32()?);
                }
                Ok(IndexKeys::Int32(keys))
            }
            INT64_ARRAY => {
                let mut keys = Vec::with_capacity(data.len() / 8);
                while !r.is_empty() {
                    keys.push(r.read_i64()?);
                }
                Ok(IndexKeys::Int64(keys))
            }
            STRING_ARRAY => {
                let mut keys = Vec::new();
                while !r.is_empty() {
                    keys.push(r.read_str()?.to_string());
                }
                Ok(IndexKeys::Str(keys))
            }
            found => Err(ProtocolError::UnexpectedExtension {
                expected: INT32_ARRAY,
                found,
            }),
        }
    }

    pub fn decode(r: &mut Reader<'_>) -> Result<Self, ProtocolError> {
        let (tag, len) = r.read_ext_header()?;
        Self::from_ext(tag, r.read_bytes(len)?)
    }

    /// Reads a decoded `Indexes` property.
    pub fn from_msg(value: &MsgValue) -> Result<Self, ProtocolError> {
        match value {
            MsgValue::Ext(tag, data) => Self::from_ext(*tag, data),
            _ => Err(ProtocolError::malformed("indexes", "not an extension record")),
        }
    }

    /// The encoded extension record as a property value.
    pub fn to_msg(&self) -> MsgValue {
        MsgValue::Ext(self.tag(), Bytes::from(self.payload()))
    }
}

impl From<Vec<i32>> for IndexKeys {
    fn from(v: Vec<i32>) -> Self {
        IndexKeys::Int32(v)
    }
}

impl From<Vec<i64>> for IndexKeys {
    fn from(v: Vec<i64>) -> Self {
        IndexKeys::Int64(v)
    }
}

impl From<Vec<String>> for IndexKeys {
    fn from(v: Vec<String>) -> Self {
        IndexKeys::Str(v)
    }
}

impl From<Vec<&str>> for IndexKeys {
    fn from(v: Vec<&str>) -> Self {
        IndexKeys::Str(v.into_iter().map(str::to_string).collect())
    }
}

/// Key column plus the keys to look up in it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Indexes {
    pub key: String,
    pub keys: IndexKeys,
}

impl Indexes {
    pub fn new(key: impl Into<String>, keys: impl Into<IndexKeys>) -> Self {
        Self {
            key: key.into(),
            keys: keys.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_int32_layout() {
        let keys = IndexKeys::from(vec![1024, 1025]);
        let mut out = Vec::new();
        keys.encode(&mut out);
        assert_eq!(out[0], msgpack::marker::FIXEXT8);
        assert_eq!(out[1] as i8, INT32_ARRAY);
        assert_eq!(&out[2..], &[0, 0, 4, 0, 0, 0, 4, 1]);
    }

    #[test]
    fn test_round_trip_each_type() {
        for keys in [
            IndexKeys::from(vec![-1, 0, 7]),
            IndexKeys::from(vec![1i64 << 40]),
            IndexKeys::from(vec!["W3.N.P1", "", "设备"]),
            IndexKeys::Int32(Vec::new()),
        ] {
            let mut out = Vec::new();
            keys.encode(&mut out);
            let back = IndexKeys::decode(&mut Reader::new(&out)).unwrap();
            assert_eq!(back, keys);
            assert_eq!(IndexKeys::from_msg(&keys.to_msg()).unwrap(), keys);
        }
    }

    #[test]
    fn test_unknown_tag() {
        assert!(matches!(
            IndexKeys::from_ext(3, &[]),
            Err(ProtocolError::UnexpectedExtension { found: 3, .. })
        ));
    }

    #[test]
    fn test_set_operations() {
        let mut keys = IndexKeys::from(vec![1024, 1025]);
        keys.union_with(&IndexKeys::from(vec![1025, 1026])).unwrap();
        assert_eq!(keys, IndexKeys::from(vec![1024, 1025, 1026]));
        keys.subtract(&IndexKeys::from(vec![1024, 9])).unwrap();
        assert_eq!(keys, IndexKeys::from(vec![1025, 1026]));
        assert!(keys.union_with(&IndexKeys::from(vec!["a"])).is_err());
        assert!(keys.subtract(&IndexKeys::from(vec![1i64])).is_err());
    }

    #[test]
    fn test_set_operations_large() {
        let mut keys = IndexKeys::from((0..50_000).collect::<Vec<i32>>());
        keys.union_with(&IndexKeys::from((25_000..75_000).chain([7, 7]).collect::<Vec<i32>>()))
            .unwrap();
        assert_eq!(keys, IndexKeys::from((0..75_000).collect::<Vec<i32>>()));
        keys.subtract(&IndexKeys::from((0..75_000).step_by(2).collect::<Vec<i32>>()))
            .unwrap();
        assert_eq!(keys.len(), 37_500);
        assert_eq!(keys.values()[0], Value::Int32(1));

        let mut names = IndexKeys::from(vec!["W3.A", "W3.B"]);
        names.union_with(&IndexKeys::from(vec!["W3.B", "W3.C", "W3.C"])).unwrap();
        assert_eq!(names, IndexKeys::from(vec!["W3.A", "W3.B", "W3.C"]));
    }

    #[test]
    fn test_truncated_ints() {
        assert!(IndexKeys::from_ext(INT32_ARRAY, &[0, 0, 1]).is_err());
    }
}
