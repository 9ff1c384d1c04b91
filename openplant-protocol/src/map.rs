//! Typed key/value maps (`VarType::Map`).
//!
//! ```text
//! map  := <bin-header> <keyType:1> <valueType:1> <pair>*
//! pair := <key> <value>
//! ```
//!
//! Fixed-width keys and values are inlined big-endian; variable ones carry a
//! bin header. Decoding builds one of three key indexes pointing at packed
//! `pos << 32 | len` tokens into the retained body.

use crate::error::ProtocolError;
use crate::msgpack::{self, Reader};
use crate::types::VarType;
use crate::value::Value;
use bytes::{BufMut, Bytes, BytesMut};
use std::collections::HashMap;
use std::fmt;

/// Body offset of the first pair.
const PAIRS_START: usize = 2;

fn token(pos: usize, len: usize) -> u64 {
    ((pos as u64) << 32) | len as u64
}

fn span(token: u64) -> (usize, usize) {
    ((token >> 32) as usize, (token & 0xffff_ffff) as usize)
}

#[derive(Debug, Clone)]
enum PairIndex {
    Int(HashMap<i64, u64>),
    Float(HashMap<u64, u64>),
    Str(HashMap<String, u64>),
}

/// A decoded map.
#[derive(Clone)]
pub struct OpMap {
    body: Bytes,
    key: VarType,
    value: VarType,
    index: PairIndex,
    /// `(key token, value token)` in wire order.
    order: Vec<(u64, u64)>,
}

fn put_element(vt: VarType, value: &Value, out: &mut BytesMut) {
    match vt.fixed_width() {
        Some(width) => value.encode_fixed(width, out),
        None => value.encode_variable(vt, out),
    }
}

/// Reads one key or value, returning its body span relative to `base`.
fn read_element(r: &mut Reader<'_>, vt: VarType, base: usize) -> Result<u64, ProtocolError> {
    let len = match vt.fixed_width() {
        Some(width) => width,
        None => r.read_bin_len()?,
    };
    let pos = base + r.position();
    r.skip(len)?;
    Ok(token(pos, len))
}

impl OpMap {
    /// Builds a map, coercing keys to `key` and values to `value`.
    pub fn from_pairs(key: VarType, value: VarType, pairs: &[(Value, Value)]) -> Result<Self, ProtocolError> {
        if !key.is_map_key() {
            return Err(ProtocolError::UnsupportedKeyType(key));
        }
        let mut body = BytesMut::new();
        body.put_u8(key.code());
        body.put_u8(value.code());
        for (k, v) in pairs {
            put_element(key, &k.coerce(key)?, &mut body);
            put_element(value, &v.coerce(value)?, &mut body);
        }
        Self::from_body(body.freeze())
    }

    /// Parses a body (`<keyType><valueType><pair>*`), taking ownership of it.
    pub fn from_body(body: Bytes) -> Result<Self, ProtocolError> {
        if body.len() < PAIRS_START {
            return Err(ProtocolError::malformed("map", "missing key/value types"));
        }
        let key = VarType::try_from(body[0])?;
        let value = VarType::try_from(body[1])?;
        if !key.is_map_key() {
            return Err(ProtocolError::UnsupportedKeyType(key));
        }

        let mut index = match key {
            VarType::String => PairIndex::Str(HashMap::new()),
            VarType::Float | VarType::Double => PairIndex::Float(HashMap::new()),
            _ => PairIndex::Int(HashMap::new()),
        };
        let mut order = Vec::new();
        let mut r = Reader::new(&body[PAIRS_START..]);
        while !r.is_empty() {
            let k = read_element(&mut r, key, PAIRS_START)?;
            let v = read_element(&mut r, value, PAIRS_START)?;
            let (pos, len) = span(k);
            let key_value = Value::decode_body(key, body.slice(pos..pos + len))?;
            match &mut index {
                PairIndex::Int(m) => {
                    m.insert(key_value.to_i64()?, v);
                }
                PairIndex::Float(m) => {
                    m.insert(key_value.to_f64()?.to_bits(), v);
                }
                PairIndex::Str(m) => {
                    m.insert(key_value.to_text(), v);
                }
            }
            order.push((k, v));
        }
        Ok(Self {
            body,
            key,
            value,
            index,
            order,
        })
    }

    /// Decodes `<bin-header><body>`; the empty sentinel yields `None`.
    pub fn decode(data: &[u8]) -> Result<Option<Self>, ProtocolError> {
        let body = Reader::new(data).read_bin()?;
        if body.is_empty() {
            return Ok(None);
        }
        Self::from_body(Bytes::copy_from_slice(body)).map(Some)
    }

    pub fn encode(&self, out: &mut impl BufMut) {
        msgpack::write_bin(out, &self.body);
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    pub fn key_type(&self) -> VarType {
        self.key
    }

    pub fn value_type(&self) -> VarType {
        self.value
    }

    /// Number of pairs on the wire, duplicates included.
    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    fn value_at(&self, token: u64) -> Result<Value, ProtocolError> {
        let (pos, len) = span(token);
        Value::decode_body(self.value, self.body.slice(pos..pos + len))
    }

    /// Looks up an integer key. Errors when the map is not int-keyed.
    pub fn get_int(&self, key: i64) -> Result<Option<Value>, ProtocolError> {
        match &self.index {
            PairIndex::Int(m) => m.get(&key).map(|t| self.value_at(*t)).transpose(),
            _ => Err(ProtocolError::Coercion {
                from: VarType::Int64,
                to: self.key,
            }),
        }
    }

    pub fn get_float(&self, key: f64) -> Result<Option<Value>, ProtocolError> {
        match &self.index {
            PairIndex::Float(m) => m.get(&key.to_bits()).map(|t| self.value_at(*t)).transpose(),
            _ => Err(ProtocolError::Coercion {
                from: VarType::Double,
                to: self.key,
            }),
        }
    }

    pub fn get_str(&self, key: &str) -> Result<Option<Value>, ProtocolError> {
        match &self.index {
            PairIndex::Str(m) => m.get(key).map(|t| self.value_at(*t)).transpose(),
            _ => Err(ProtocolError::Coercion {
                from: VarType::String,
                to: self.key,
            }),
        }
    }

    /// Looks up a key of any type, coercing it to the map's key type first.
    pub fn get(&self, key: &Value) -> Result<Option<Value>, ProtocolError> {
        match &self.index {
            PairIndex::Int(_) => self.get_int(key.to_i64()?),
            PairIndex::Float(_) if self.key == VarType::Float => self.get_float(key.to_f32()? as f64),
            PairIndex::Float(_) => self.get_float(key.to_f64()?),
            PairIndex::Str(_) => self.get_str(&key.coerce(VarType::String)?.to_text()),
        }
    }

    /// Pairs in wire order.
    pub fn iter(&self) -> impl Iterator<Item = (Value, Result<Value, ProtocolError>)> + '_ {
        self.order.iter().map(move |&(k, v)| {
            let (pos, len) = span(k);
            let key = Value::decode_body(self.key, self.body.slice(pos..pos + len)).unwrap_or_default();
            (key, self.value_at(v))
        })
    }
}

impl PartialEq for OpMap {
    fn eq(&self, other: &Self) -> bool {
        self.body == other.body
    }
}

impl fmt::Debug for OpMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpMap")
            .field("key", &self.key)
            .field("value", &self.value)
            .field("len", &self.order.len())
            .finish()
    }
}

impl fmt::Display for OpMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&Value::Map(self.clone()), f)
    }
}
