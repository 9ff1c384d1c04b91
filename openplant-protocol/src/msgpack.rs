//! The MessagePack subset spoken by OpenPlant.
//!
//! Integers are width-compressed on write (smallest marker that fits) and
//! width-expanded on read: [`Reader::read_int`] returns `i64` whatever the
//! wire width was. Typed arrays travel as extension records.
//!
//! Readers report a short buffer as [`ProtocolError::Incomplete`], which the
//! incremental decoders in [`crate::message`] turn into "need more bytes".

use crate::error::ProtocolError;
use bytes::{BufMut, Bytes};

pub mod marker {
    pub const POS_FIXINT_MAX: u8 = 0x7f;
    pub const FIXMAP: u8 = 0x80;
    pub const FIXARRAY: u8 = 0x90;
    pub const FIXSTR: u8 = 0xa0;
    pub const NIL: u8 = 0xc0;
    pub const FALSE: u8 = 0xc2;
    pub const TRUE: u8 = 0xc3;
    pub const BIN8: u8 = 0xc4;
    pub const BIN16: u8 = 0xc5;
    pub const BIN32: u8 = 0xc6;
    pub const EXT8: u8 = 0xc7;
    pub const EXT16: u8 = 0xc8;
    pub const EXT32: u8 = 0xc9;
    pub const FLOAT32: u8 = 0xca;
    pub const FLOAT64: u8 = 0xcb;
    pub const UINT8: u8 = 0xcc;
    pub const UINT16: u8 = 0xcd;
    pub const UINT32: u8 = 0xce;
    pub const UINT64: u8 = 0xcf;
    pub const INT8: u8 = 0xd0;
    pub const INT16: u8 = 0xd1;
    pub const INT32: u8 = 0xd2;
    pub const INT64: u8 = 0xd3;
    pub const FIXEXT1: u8 = 0xd4;
    pub const FIXEXT2: u8 = 0xd5;
    pub const FIXEXT4: u8 = 0xd6;
    pub const FIXEXT8: u8 = 0xd7;
    pub const FIXEXT16: u8 = 0xd8;
    pub const STR8: u8 = 0xd9;
    pub const STR16: u8 = 0xda;
    pub const STR32: u8 = 0xdb;
    pub const ARRAY16: u8 = 0xdc;
    pub const ARRAY32: u8 = 0xdd;
    pub const MAP16: u8 = 0xde;
    pub const MAP32: u8 = 0xdf;
    pub const NEG_FIXINT: u8 = 0xe0;
}

/// Maximum nesting accepted by [`Reader::read_value`].
pub const MAX_DEPTH: usize = 64;

/// The two-byte empty binary (`bin8 00`) used for empty and unset cells.
pub const EMPTY_BIN: [u8; 2] = [marker::BIN8, 0];

// ============================================================================
// Writers
// ============================================================================

pub fn write_nil(out: &mut impl BufMut) {
    out.put_u8(marker::NIL);
}

pub fn write_bool(out: &mut impl BufMut, v: bool) {
    out.put_u8(if v { marker::TRUE } else { marker::FALSE });
}

/// Writes a signed integer with the smallest marker that holds it.
pub fn write_int(out: &mut impl BufMut, v: i64) {
    if v >= 0 {
        write_uint(out, v as u64);
    } else if v >= -32 {
        out.put_i8(v as i8);
    } else if v >= i8::MIN as i64 {
        out.put_u8(marker::INT8);
        out.put_i8(v as i8);
    } else if v >= i16::MIN as i64 {
        out.put_u8(marker::INT16);
        out.put_i16(v as i16);
    } else if v >= i32::MIN as i64 {
        out.put_u8(marker::INT32);
        out.put_i32(v as i32);
    } else {
        out.put_u8(marker::INT64);
        out.put_i64(v);
    }
}

pub fn write_uint(out: &mut impl BufMut, v: u64) {
    if v <= marker::POS_FIXINT_MAX as u64 {
        out.put_u8(v as u8);
    } else if v <= u8::MAX as u64 {
        out.put_u8(marker::UINT8);
        out.put_u8(v as u8);
    } else if v <= u16::MAX as u64 {
        out.put_u8(marker::UINT16);
        out.put_u16(v as u16);
    } else if v <= u32::MAX as u64 {
        out.put_u8(marker::UINT32);
        out.put_u32(v as u32);
    } else {
        out.put_u8(marker::UINT64);
        out.put_u64(v);
    }
}

pub fn write_f32(out: &mut impl BufMut, v: f32) {
    out.put_u8(marker::FLOAT32);
    out.put_f32(v);
}

pub fn write_f64(out: &mut impl BufMut, v: f64) {
    out.put_u8(marker::FLOAT64);
    out.put_f64(v);
}

pub fn write_str(out: &mut impl BufMut, s: &str) {
    let len = s.len();
    if len <= 31 {
        out.put_u8(marker::FIXSTR | len as u8);
    } else if len <= u8::MAX as usize {
        out.put_u8(marker::STR8);
        out.put_u8(len as u8);
    } else if len <= u16::MAX as usize {
        out.put_u8(marker::STR16);
        out.put_u16(len as u16);
    } else {
        out.put_u8(marker::STR32);
        out.put_u32(len as u32);
    }
    out.put_slice(s.as_bytes());
}

/// Writes a `bin8`/`bin16`/`bin32` length header.
pub fn write_bin_header(out: &mut impl BufMut, len: usize) {
    if len <= u8::MAX as usize {
        out.put_u8(marker::BIN8);
        out.put_u8(len as u8);
    } else if len <= u16::MAX as usize {
        out.put_u8(marker::BIN16);
        out.put_u16(len as u16);
    } else {
        out.put_u8(marker::BIN32);
        out.put_u32(len as u32);
    }
}

/// Size in bytes of the bin header chosen for a payload of `len` bytes.
pub fn bin_header_len(len: usize) -> usize {
    if len <= u8::MAX as usize {
        2
    } else if len <= u16::MAX as usize {
        3
    } else {
        5
    }
}

pub fn write_bin(out: &mut impl BufMut, data: &[u8]) {
    write_bin_header(out, data.len());
    out.put_slice(data);
}

pub fn write_array_len(out: &mut impl BufMut, len: u32) {
    if len <= 15 {
        out.put_u8(marker::FIXARRAY | len as u8);
    } else if len <= u16::MAX as u32 {
        out.put_u8(marker::ARRAY16);
        out.put_u16(len as u16);
    } else {
        out.put_u8(marker::ARRAY32);
        out.put_u32(len);
    }
}

pub fn write_map_len(out: &mut impl BufMut, len: u32) {
    if len <= 15 {
        out.put_u8(marker::FIXMAP | len as u8);
    } else if len <= u16::MAX as u32 {
        out.put_u8(marker::MAP16);
        out.put_u16(len as u16);
    } else {
        out.put_u8(marker::MAP32);
        out.put_u32(len);
    }
}

/// Writes an extension header; payloads of 1, 2, 4, 8 or 16 bytes use fixext.
pub fn write_ext_header(out: &mut impl BufMut, tag: i8, len: usize) {
    match len {
        1 => out.put_u8(marker::FIXEXT1),
        2 => out.put_u8(marker::FIXEXT2),
        4 => out.put_u8(marker::FIXEXT4),
        8 => out.put_u8(marker::FIXEXT8),
        16 => out.put_u8(marker::FIXEXT16),
        _ if len <= u8::MAX as usize => {
            out.put_u8(marker::EXT8);
            out.put_u8(len as u8);
        }
        _ if len <= u16::MAX as usize => {
            out.put_u8(marker::EXT16);
            out.put_u16(len as u16);
        }
        _ => {
            out.put_u8(marker::EXT32);
            out.put_u32(len as u32);
        }
    }
    out.put_i8(tag);
}

pub fn write_ext(out: &mut impl BufMut, tag: i8, data: &[u8]) {
    write_ext_header(out, tag, data.len());
    out.put_slice(data);
}

// ============================================================================
// Reader
// ============================================================================

/// Cursor over a borrowed byte slice.
#[derive(Debug, Clone)]
pub struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

macro_rules! read_be {
    ($name:ident, $ty:ty) => {
        pub fn $name(&mut self) -> Result<$ty, ProtocolError> {
            let bytes = self.read_bytes(std::mem::size_of::<$ty>())?;
            let mut arr = [0u8; std::mem::size_of::<$ty>()];
            arr.copy_from_slice(bytes);
            Ok(<$ty>::from_be_bytes(arr))
        }
    };
}

impl<'a> Reader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// Bytes consumed so far.
    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    /// The unread tail of the buffer.
    pub fn rest(&self) -> &'a [u8] {
        &self.buf[self.pos..]
    }

    fn need(&self, n: usize) -> Result<(), ProtocolError> {
        let remaining = self.remaining();
        if remaining < n {
            return Err(ProtocolError::Incomplete {
                needed: n - remaining,
            });
        }
        Ok(())
    }

    pub fn peek_u8(&self) -> Result<u8, ProtocolError> {
        self.need(1)?;
        Ok(self.buf[self.pos])
    }

    pub fn read_u8(&mut self) -> Result<u8, ProtocolError> {
        let b = self.peek_u8()?;
        self.pos += 1;
        Ok(b)
    }

    pub fn read_bytes(&mut self, n: usize) -> Result<&'a [u8], ProtocolError> {
        self.need(n)?;
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    pub fn skip(&mut self, n: usize) -> Result<(), ProtocolError> {
        self.read_bytes(n).map(|_| ())
    }

    read_be!(read_u16, u16);
    read_be!(read_u32, u32);
    read_be!(read_u64, u64);
    read_be!(read_i8, i8);
    read_be!(read_i16, i16);
    read_be!(read_i32, i32);
    read_be!(read_i64, i64);
    read_be!(read_f32, f32);
    read_be!(read_f64, f64);

    /// Consumes a `nil` if one is next; returns whether it did.
    pub fn try_read_nil(&mut self) -> Result<bool, ProtocolError> {
        if self.peek_u8()? == marker::NIL {
            self.pos += 1;
            return Ok(true);
        }
        Ok(false)
    }

    pub fn read_nil(&mut self) -> Result<(), ProtocolError> {
        match self.read_u8()? {
            marker::NIL => Ok(()),
            found => Err(ProtocolError::UnexpectedMarker {
                expected: "nil",
                found,
            }),
        }
    }

    pub fn read_bool(&mut self) -> Result<bool, ProtocolError> {
        match self.read_u8()? {
            marker::TRUE => Ok(true),
            marker::FALSE => Ok(false),
            found => Err(ProtocolError::UnexpectedMarker {
                expected: "bool",
                found,
            }),
        }
    }

    /// Reads any integer marker and widens it to `i64`.
    pub fn read_int(&mut self) -> Result<i64, ProtocolError> {
        let m = self.read_u8()?;
        self.read_int_body(m)
    }

    fn read_int_body(&mut self, m: u8) -> Result<i64, ProtocolError> {
        match m {
            0x00..=marker::POS_FIXINT_MAX => Ok(m as i64),
            marker::NEG_FIXINT..=0xff => Ok(m as i8 as i64),
            marker::UINT8 => Ok(self.read_u8()? as i64),
            marker::UINT16 => Ok(self.read_u16()? as i64),
            marker::UINT32 => Ok(self.read_u32()? as i64),
            marker::UINT64 => Ok(self.read_u64()? as i64),
            marker::INT8 => Ok(self.read_i8()? as i64),
            marker::INT16 => Ok(self.read_i16()? as i64),
            marker::INT32 => Ok(self.read_i32()? as i64),
            marker::INT64 => self.read_i64(),
            found => Err(ProtocolError::UnexpectedMarker {
                expected: "integer",
                found,
            }),
        }
    }

    /// Reads a float or an integer as `f64`.
    pub fn read_float(&mut self) -> Result<f64, ProtocolError> {
        match self.peek_u8()? {
            marker::FLOAT32 => {
                self.pos += 1;
                Ok(self.read_f32()? as f64)
            }
            marker::FLOAT64 => {
                self.pos += 1;
                self.read_f64()
            }
            _ => self.read_int().map(|v| v as f64),
        }
    }

    fn read_str_len(&mut self) -> Result<usize, ProtocolError> {
        match self.read_u8()? {
            m @ marker::FIXSTR..=0xbf => Ok((m & 0x1f) as usize),
            marker::STR8 => Ok(self.read_u8()? as usize),
            marker::STR16 => Ok(self.read_u16()? as usize),
            marker::STR32 => Ok(self.read_u32()? as usize),
            found => Err(ProtocolError::UnexpectedMarker {
                expected: "string",
                found,
            }),
        }
    }

    pub fn read_str(&mut self) -> Result<&'a str, ProtocolError> {
        let len = self.read_str_len()?;
        let bytes = self.read_bytes(len)?;
        std::str::from_utf8(bytes).map_err(|_| ProtocolError::InvalidUtf8)
    }

    /// Reads a `bin8`/`bin16`/`bin32` header and returns the payload length.
    pub fn read_bin_len(&mut self) -> Result<usize, ProtocolError> {
        match self.read_u8()? {
            marker::BIN8 => Ok(self.read_u8()? as usize),
            marker::BIN16 => Ok(self.read_u16()? as usize),
            marker::BIN32 => Ok(self.read_u32()? as usize),
            found => Err(ProtocolError::UnexpectedMarker {
                expected: "bin",
                found,
            }),
        }
    }

    pub fn read_bin(&mut self) -> Result<&'a [u8], ProtocolError> {
        let len = self.read_bin_len()?;
        self.read_bytes(len)
    }

    pub fn read_array_len(&mut self) -> Result<u32, ProtocolError> {
        match self.read_u8()? {
            m @ marker::FIXARRAY..=0x9f => Ok((m & 0x0f) as u32),
            marker::ARRAY16 => Ok(self.read_u16()? as u32),
            marker::ARRAY32 => self.read_u32(),
            found => Err(ProtocolError::UnexpectedMarker {
                expected: "array",
                found,
            }),
        }
    }

    pub fn read_map_len(&mut self) -> Result<u32, ProtocolError> {
        match self.read_u8()? {
            m @ marker::FIXMAP..=0x8f => Ok((m & 0x0f) as u32),
            marker::MAP16 => Ok(self.read_u16()? as u32),
            marker::MAP32 => self.read_u32(),
            found => Err(ProtocolError::UnexpectedMarker {
                expected: "map",
                found,
            }),
        }
    }

    /// Reads an extension header, returning `(tag, payload length)`.
    pub fn read_ext_header(&mut self) -> Result<(i8, usize), ProtocolError> {
        let len = match self.read_u8()? {
            marker::FIXEXT1 => 1,
            marker::FIXEXT2 => 2,
            marker::FIXEXT4 => 4,
            marker::FIXEXT8 => 8,
            marker::FIXEXT16 => 16,
            marker::EXT8 => self.read_u8()? as usize,
            marker::EXT16 => self.read_u16()? as usize,
            marker::EXT32 => self.read_u32()? as usize,
            found => {
                return Err(ProtocolError::UnexpectedMarker {
                    expected: "ext",
                    found,
                })
            }
        };
        Ok((self.read_i8()?, len))
    }

    /// Reads one complete value of any kind.
    pub fn read_value(&mut self) -> Result<MsgValue, ProtocolError> {
        self.read_value_at(0)
    }

    fn read_value_at(&mut self, depth: usize) -> Result<MsgValue, ProtocolError> {
        if depth > MAX_DEPTH {
            return Err(ProtocolError::malformed("value", "nesting too deep"));
        }
        let m = self.peek_u8()?;
        match m {
            marker::NIL => {
                self.pos += 1;
                Ok(MsgValue::Nil)
            }
            marker::TRUE | marker::FALSE => Ok(MsgValue::Bool(self.read_bool()?)),
            marker::FLOAT32 | marker::FLOAT64 => Ok(MsgValue::Float(self.read_float()?)),
            marker::FIXSTR..=0xbf | marker::STR8 | marker::STR16 | marker::STR32 => {
                Ok(MsgValue::Str(self.read_str()?.to_string()))
            }
            marker::BIN8 | marker::BIN16 | marker::BIN32 => {
                Ok(MsgValue::Bin(Bytes::copy_from_slice(self.read_bin()?)))
            }
            marker::FIXARRAY..=0x9f | marker::ARRAY16 | marker::ARRAY32 => {
                let len = self.read_array_len()? as usize;
                let mut items = Vec::with_capacity(len.min(1024));
                for _ in 0..len {
                    items.push(self.read_value_at(depth + 1)?);
                }
                Ok(MsgValue::Array(items))
            }
            marker::FIXMAP..=0x8f | marker::MAP16 | marker::MAP32 => {
                let len = self.read_map_len()? as usize;
                let mut entries = Vec::with_capacity(len.min(1024));
                for _ in 0..len {
                    let k = self.read_value_at(depth + 1)?;
                    let v = self.read_value_at(depth + 1)?;
                    entries.push((k, v));
                }
                Ok(MsgValue::Map(entries))
            }
            marker::EXT8
            | marker::EXT16
            | marker::EXT32
            | marker::FIXEXT1
            | marker::FIXEXT2
            | marker::FIXEXT4
            | marker::FIXEXT8
            | marker::FIXEXT16 => {
                let (tag, len) = self.read_ext_header()?;
                let data = self.read_bytes(len)?;
                Ok(MsgValue::Ext(tag, Bytes::copy_from_slice(data)))
            }
            _ => Ok(MsgValue::Int(self.read_int()?)),
        }
    }
}

// ============================================================================
// Generic value tree
// ============================================================================

/// A decoded MessagePack value, used for property bags.
#[derive(Debug, Clone, PartialEq)]
pub enum MsgValue {
    Nil,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Bin(Bytes),
    Array(Vec<MsgValue>),
    Map(Vec<(MsgValue, MsgValue)>),
    Ext(i8, Bytes),
}

impl MsgValue {
    pub fn encode(&self, out: &mut impl BufMut) {
        match self {
            MsgValue::Nil => write_nil(out),
            MsgValue::Bool(v) => write_bool(out, *v),
            MsgValue::Int(v) => write_int(out, *v),
            MsgValue::Float(v) => write_f64(out, *v),
            MsgValue::Str(s) => write_str(out, s),
            MsgValue::Bin(b) => write_bin(out, b),
            MsgValue::Array(items) => {
                write_array_len(out, items.len() as u32);
                for item in items {
                    item.encode(out);
                }
            }
            MsgValue::Map(entries) => {
                write_map_len(out, entries.len() as u32);
                for (k, v) in entries {
                    k.encode(out);
                    v.encode(out);
                }
            }
            MsgValue::Ext(tag, data) => write_ext(out, *tag, data),
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            MsgValue::Int(v) => Some(*v),
            MsgValue::Float(v) => Some(*v as i64),
            MsgValue::Bool(v) => Some(*v as i64),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            MsgValue::Float(v) => Some(*v),
            MsgValue::Int(v) => Some(*v as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            MsgValue::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[MsgValue]> {
        match self {
            MsgValue::Array(items) => Some(items),
            _ => None,
        }
    }

    /// Looks up a string key in a map value.
    pub fn get(&self, key: &str) -> Option<&MsgValue> {
        match self {
            MsgValue::Map(entries) => entries
                .iter()
                .find(|(k, _)| k.as_str() == Some(key))
                .map(|(_, v)| v),
            _ => None,
        }
    }

    pub fn is_nil(&self) -> bool {
        matches!(self, MsgValue::Nil)
    }
}

impl From<&str> for MsgValue {
    fn from(v: &str) -> Self {
        MsgValue::Str(v.to_string())
    }
}

impl From<String> for MsgValue {
    fn from(v: String) -> Self {
        MsgValue::Str(v)
    }
}

impl From<i64> for MsgValue {
    fn from(v: i64) -> Self {
        MsgValue::Int(v)
    }
}

impl From<i32> for MsgValue {
    fn from(v: i32) -> Self {
        MsgValue::Int(v as i64)
    }
}

impl From<bool> for MsgValue {
    fn from(v: bool) -> Self {
        MsgValue::Bool(v)
    }
}

impl From<f64> for MsgValue {
    fn from(v: f64) -> Self {
        MsgValue::Float(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;
    use proptest::prelude::*;

    fn encoded(f: impl FnOnce(&mut BytesMut)) -> Vec<u8> {
        let mut buf = BytesMut::new();
        f(&mut buf);
        buf.to_vec()
    }

    #[test]
    fn test_int_width_compression() {
        assert_eq!(encoded(|b| write_int(b, 5)), vec![0x05]);
        assert_eq!(encoded(|b| write_int(b, -1)), vec![0xff]);
        assert_eq!(encoded(|b| write_int(b, -33)), vec![0xd0, 0xdf]);
        assert_eq!(encoded(|b| write_int(b, 200)), vec![0xcc, 200]);
        assert_eq!(encoded(|b| write_int(b, 1024)), vec![0xcd, 0x04, 0x00]);
        assert_eq!(encoded(|b| write_int(b, -1000)), vec![0xd1, 0xfc, 0x18]);
        assert_eq!(encoded(|b| write_int(b, 70_000)).len(), 5);
        assert_eq!(encoded(|b| write_int(b, i64::MIN)).len(), 9);
    }

    #[test]
    fn test_bin_header_widths() {
        assert_eq!(encoded(|b| write_bin_header(b, 0)), EMPTY_BIN.to_vec());
        assert_eq!(encoded(|b| write_bin_header(b, 255)), vec![0xc4, 0xff]);
        assert_eq!(encoded(|b| write_bin_header(b, 256)), vec![0xc5, 0x01, 0x00]);
        assert_eq!(
            encoded(|b| write_bin_header(b, 70_000)),
            vec![0xc6, 0x00, 0x01, 0x11, 0x70]
        );
        for len in [0, 255, 256, 65535, 65536] {
            assert_eq!(
                encoded(|b| write_bin_header(b, len)).len(),
                bin_header_len(len)
            );
        }
    }

    #[test]
    fn test_end_of_stream_array_header() {
        let bytes = encoded(|b| write_array_len(b, u32::MAX));
        assert_eq!(bytes, vec![0xdd, 0xff, 0xff, 0xff, 0xff]);
        assert_eq!(Reader::new(&bytes).read_array_len().unwrap(), u32::MAX);
    }

    #[test]
    fn test_fixext_selection() {
        assert_eq!(encoded(|b| write_ext_header(b, 20, 4)), vec![0xd6, 20]);
        assert_eq!(encoded(|b| write_ext_header(b, 32, 3)), vec![0xc7, 3, 32]);
    }

    #[test]
    fn test_incomplete_reports_missing_bytes() {
        let bytes = encoded(|b| write_str(b, "hello"));
        let mut reader = Reader::new(&bytes[..3]);
        let err = reader.read_str().unwrap_err();
        assert!(matches!(err, ProtocolError::Incomplete { needed: 3 }));
    }

    #[test]
    fn test_unexpected_marker() {
        let mut reader = Reader::new(&[0xc0]);
        assert!(matches!(
            reader.read_bin_len(),
            Err(ProtocolError::UnexpectedMarker { found: 0xc0, .. })
        ));
    }

    #[test]
    fn test_value_tree_round_trip() {
        let value = MsgValue::Map(vec![
            (MsgValue::from("Table"), MsgValue::from("Realtime")),
            (MsgValue::from("Limit"), MsgValue::Int(10)),
            (
                MsgValue::from("Columns"),
                MsgValue::Array(vec![MsgValue::Map(vec![(
                    MsgValue::from("Name"),
                    MsgValue::from("ID"),
                )])]),
            ),
            (MsgValue::from("Keys"), MsgValue::Ext(20, Bytes::from_static(&[0, 0, 4, 0]))),
            (MsgValue::from("Flag"), MsgValue::Bool(true)),
            (MsgValue::from("Nothing"), MsgValue::Nil),
        ]);
        let bytes = encoded(|b| value.encode(b));
        let mut reader = Reader::new(&bytes);
        assert_eq!(reader.read_value().unwrap(), value);
        assert!(reader.is_empty());
        assert_eq!(value.get("Limit").and_then(MsgValue::as_int), Some(10));
    }

    #[test]
    fn test_depth_limit() {
        let bytes = vec![0x91; MAX_DEPTH + 2];
        let err = Reader::new(&bytes).read_value().unwrap_err();
        assert!(matches!(err, ProtocolError::Malformed { .. }));
    }

    proptest! {
        #[test]
        fn prop_int_round_trip(v in any::<i64>()) {
            let bytes = encoded(|b| write_int(b, v));
            prop_assert_eq!(Reader::new(&bytes).read_int().unwrap(), v);
        }

        #[test]
        fn prop_str_round_trip(s in ".{0,300}") {
            let bytes = encoded(|b| write_str(b, &s));
            prop_assert_eq!(Reader::new(&bytes).read_str().unwrap(), s.as_str());
        }

        #[test]
        fn prop_f64_bits_round_trip(v in any::<f64>().prop_filter("not nan", |v| !v.is_nan())) {
            let bytes = encoded(|b| write_f64(b, v));
            prop_assert_eq!(Reader::new(&bytes).read_float().unwrap().to_bits(), v.to_bits());
        }
    }
}
