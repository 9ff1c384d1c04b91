//! Dynamically typed values and the conversion lattice between them.
//!
//! Every typed getter in the crate goes through [`Value`]: an exact type
//! match reads directly, anything else is coerced with the rules below.
//!
//! | from \ to         | numeric              | bool        | datetime     | string   |
//! |-------------------|----------------------|-------------|--------------|----------|
//! | numeric / bool    | truncating `as` cast | non-zero    | epoch secs   | Display  |
//! | datetime          | epoch secs (+frac)   | non-zero    | exact        | Display  |
//! | string            | error                | error       | error        | exact    |
//! | slice/map/struct  | error                | non-empty   | error        | renderer |
//!
//! When a conversion fails the reported error stands in for the value; the
//! best-effort value is always the target type's default, so
//! `unwrap_or_default()` recovers it.

use crate::error::ProtocolError;
use crate::map::OpMap;
use crate::msgpack;
use crate::slice::OpSlice;
use crate::structure::OpStructure;
use crate::types::VarType;
use bytes::{BufMut, Bytes};
use chrono::{DateTime, TimeZone, Utc};
use serde::ser::{SerializeMap, SerializeSeq};
use serde::{Serialize, Serializer};
use std::fmt;

/// Format used when rendering timestamps as text.
pub const DATETIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f";

/// A single OpenPlant value.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Int8(i8),
    Int16(i16),
    Int32(i32),
    Int64(i64),
    Float(f32),
    Double(f64),
    DateTime(DateTime<Utc>),
    String(String),
    Binary(Bytes),
    Slice(OpSlice),
    Map(OpMap),
    Structure(OpStructure),
}

enum Num {
    Int(i64),
    Float(f64),
}

/// Converts seconds since the epoch into a timestamp with microsecond precision.
pub fn datetime_from_secs(secs: f64) -> Result<DateTime<Utc>, ProtocolError> {
    if !secs.is_finite() {
        return Err(ProtocolError::malformed("datetime", "not a finite number"));
    }
    let whole = secs.floor();
    let micros = ((secs - whole) * 1e6).round() as i64;
    let (whole, micros) = if micros >= 1_000_000 {
        (whole as i64 + 1, micros - 1_000_000)
    } else {
        (whole as i64, micros)
    };
    Utc.timestamp_opt(whole, (micros * 1000) as u32)
        .single()
        .ok_or_else(|| ProtocolError::malformed("datetime", format!("{secs} out of range")))
}

/// Seconds since the epoch, fractional part carrying the sub-second time.
pub fn datetime_to_secs(dt: &DateTime<Utc>) -> f64 {
    dt.timestamp() as f64 + dt.timestamp_subsec_nanos() as f64 / 1e9
}

impl Value {
    /// Returns the type tag this value encodes as.
    pub fn var_type(&self) -> VarType {
        match self {
            Value::Null => VarType::Null,
            Value::Bool(_) => VarType::Bool,
            Value::Int8(_) => VarType::Int8,
            Value::Int16(_) => VarType::Int16,
            Value::Int32(_) => VarType::Int32,
            Value::Int64(_) => VarType::Int64,
            Value::Float(_) => VarType::Float,
            Value::Double(_) => VarType::Double,
            Value::DateTime(_) => VarType::DateTime,
            Value::String(_) => VarType::String,
            Value::Binary(_) => VarType::Binary,
            Value::Slice(_) => VarType::Slice,
            Value::Map(_) => VarType::Map,
            Value::Structure(_) => VarType::Structure,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    fn coercion_error(&self, to: VarType) -> ProtocolError {
        ProtocolError::Coercion {
            from: self.var_type(),
            to,
        }
    }

    fn num(&self, to: VarType, float_target: bool) -> Result<Num, ProtocolError> {
        Ok(match self {
            Value::Null => Num::Int(0),
            Value::Bool(v) => Num::Int(*v as i64),
            Value::Int8(v) => Num::Int(*v as i64),
            Value::Int16(v) => Num::Int(*v as i64),
            Value::Int32(v) => Num::Int(*v as i64),
            Value::Int64(v) => Num::Int(*v),
            Value::Float(v) => Num::Float(*v as f64),
            Value::Double(v) => Num::Float(*v),
            Value::DateTime(dt) if float_target => Num::Float(datetime_to_secs(dt)),
            Value::DateTime(dt) => Num::Int(dt.timestamp()),
            _ => return Err(self.coercion_error(to)),
        })
    }

    pub fn to_bool(&self) -> Result<bool, ProtocolError> {
        match self {
            Value::Bool(v) => Ok(*v),
            Value::Binary(b) => Ok(!b.is_empty()),
            Value::Slice(s) => Ok(!s.is_empty()),
            Value::Map(m) => Ok(!m.is_empty()),
            Value::Structure(s) => Ok(!s.is_empty()),
            _ => match self.num(VarType::Bool, false)? {
                Num::Int(v) => Ok(v != 0),
                Num::Float(v) => Ok(v != 0.0),
            },
        }
    }

    pub fn to_i8(&self) -> Result<i8, ProtocolError> {
        match self.num(VarType::Int8, false)? {
            Num::Int(v) => Ok(v as i8),
            Num::Float(v) => Ok(v as i8),
        }
    }

    pub fn to_i16(&self) -> Result<i16, ProtocolError> {
        match self.num(VarType::Int16, false)? {
            Num::Int(v) => Ok(v as i16),
            Num::Float(v) => Ok(v as i16),
        }
    }

    pub fn to_i32(&self) -> Result<i32, ProtocolError> {
        match self.num(VarType::Int32, false)? {
            Num::Int(v) => Ok(v as i32),
            Num::Float(v) => Ok(v as i32),
        }
    }

    pub fn to_i64(&self) -> Result<i64, ProtocolError> {
        match self.num(VarType::Int64, false)? {
            Num::Int(v) => Ok(v),
            Num::Float(v) => Ok(v as i64),
        }
    }

    pub fn to_f32(&self) -> Result<f32, ProtocolError> {
        match self.num(VarType::Float, true)? {
            Num::Int(v) => Ok(v as f32),
            Num::Float(v) => Ok(v as f32),
        }
    }

    pub fn to_f64(&self) -> Result<f64, ProtocolError> {
        match self.num(VarType::Double, true)? {
            Num::Int(v) => Ok(v as f64),
            Num::Float(v) => Ok(v),
        }
    }

    pub fn to_datetime(&self) -> Result<DateTime<Utc>, ProtocolError> {
        match self {
            Value::DateTime(dt) => Ok(*dt),
            Value::Bool(_) => Err(self.coercion_error(VarType::DateTime)),
            _ => match self.num(VarType::DateTime, true)? {
                Num::Int(secs) => Utc
                    .timestamp_opt(secs, 0)
                    .single()
                    .ok_or_else(|| self.coercion_error(VarType::DateTime)),
                Num::Float(secs) => datetime_from_secs(secs),
            },
        }
    }

    /// Text rendering; never fails.
    pub fn to_text(&self) -> String {
        match self {
            Value::Null => String::new(),
            Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }

    pub fn to_bytes(&self) -> Result<Bytes, ProtocolError> {
        match self {
            Value::Null => Ok(Bytes::new()),
            Value::Binary(b) => Ok(b.clone()),
            Value::String(s) => Ok(Bytes::copy_from_slice(s.as_bytes())),
            Value::Slice(s) => Ok(s.body().clone()),
            Value::Map(m) => Ok(m.body().clone()),
            Value::Structure(s) => Ok(s.body().clone()),
            _ => Err(self.coercion_error(VarType::Binary)),
        }
    }

    /// Returns the slice, `None` for a nil compound.
    pub fn to_slice(&self) -> Result<Option<OpSlice>, ProtocolError> {
        match self {
            Value::Null => Ok(None),
            Value::Slice(s) => Ok(Some(s.clone())),
            _ => Err(self.coercion_error(VarType::Slice)),
        }
    }

    pub fn to_map(&self) -> Result<Option<OpMap>, ProtocolError> {
        match self {
            Value::Null => Ok(None),
            Value::Map(m) => Ok(Some(m.clone())),
            _ => Err(self.coercion_error(VarType::Map)),
        }
    }

    pub fn to_structure(&self) -> Result<Option<OpStructure>, ProtocolError> {
        match self {
            Value::Null => Ok(None),
            Value::Structure(s) => Ok(Some(s.clone())),
            _ => Err(self.coercion_error(VarType::Structure)),
        }
    }

    /// Converts this value into one whose tag is `target`.
    ///
    /// `Object` accepts anything, and `Null` passes through every target.
    pub fn coerce(&self, target: VarType) -> Result<Value, ProtocolError> {
        if self.is_null() || target == VarType::Object || self.var_type() == target {
            return Ok(self.clone());
        }
        Ok(match target {
            VarType::Null => Value::Null,
            VarType::Bool => Value::Bool(self.to_bool()?),
            VarType::Int8 => Value::Int8(self.to_i8()?),
            VarType::Int16 => Value::Int16(self.to_i16()?),
            VarType::Int32 => Value::Int32(self.to_i32()?),
            VarType::Int64 => Value::Int64(self.to_i64()?),
            VarType::Float => Value::Float(self.to_f32()?),
            VarType::Double => Value::Double(self.to_f64()?),
            VarType::DateTime => Value::DateTime(self.to_datetime()?),
            VarType::String => Value::String(self.to_text()),
            VarType::Binary => Value::Binary(self.to_bytes()?),
            VarType::Object | VarType::Slice | VarType::Map | VarType::Structure => {
                return Err(self.coercion_error(target))
            }
        })
    }

    // ------------------------------------------------------------------------
    // Cell codec
    // ------------------------------------------------------------------------

    /// Writes the value into a fixed slot of `width` bytes.
    ///
    /// The value must already carry the slot's type (see [`Value::coerce`]).
    pub fn encode_fixed(&self, width: usize, out: &mut impl BufMut) {
        match self {
            Value::Bool(v) => out.put_u8(*v as u8),
            Value::Int8(v) => out.put_i8(*v),
            Value::Int16(v) => out.put_i16(*v),
            Value::Int32(v) => out.put_i32(*v),
            Value::Int64(v) => out.put_i64(*v),
            Value::Float(v) => out.put_f32(*v),
            Value::Double(v) => out.put_f64(*v),
            Value::DateTime(dt) => out.put_f64(datetime_to_secs(dt)),
            Value::String(s) => put_padded(out, s.as_bytes(), width),
            Value::Binary(b) => put_padded(out, b, width),
            _ => out.put_bytes(0, width),
        }
    }

    /// Length of the variable-length body of this value.
    pub fn body_len(&self) -> usize {
        match self {
            Value::String(s) => s.len(),
            Value::Binary(b) => b.len(),
            Value::Slice(s) => s.body().len(),
            Value::Map(m) => m.body().len(),
            Value::Structure(s) => s.body().len(),
            Value::Null => 0,
            other => other.var_type().fixed_width().unwrap_or(0),
        }
    }

    /// Writes the variable-length body (no length header).
    pub fn encode_body(&self, out: &mut impl BufMut) {
        match self {
            Value::String(s) => out.put_slice(s.as_bytes()),
            Value::Binary(b) => out.put_slice(b),
            Value::Slice(s) => out.put_slice(s.body()),
            Value::Map(m) => out.put_slice(m.body()),
            Value::Structure(s) => out.put_slice(s.body()),
            Value::Null => {}
            other => other.encode_fixed(other.body_len(), out),
        }
    }

    /// Writes `<bin-header><body>` for a variable slot of type `vt`.
    ///
    /// An `Object` slot self-describes: `<bin-header><innerType:1><value>`.
    pub fn encode_variable(&self, vt: VarType, out: &mut impl BufMut) {
        if vt == VarType::Object {
            if self.is_null() {
                out.put_slice(&msgpack::EMPTY_BIN);
                return;
            }
            msgpack::write_bin_header(out, 1 + self.body_len());
            out.put_u8(self.var_type().code());
        } else {
            msgpack::write_bin_header(out, self.body_len());
        }
        self.encode_body(out);
    }

    /// Decodes a fixed slot.
    pub fn decode_fixed(vt: VarType, data: &[u8]) -> Result<Value, ProtocolError> {
        let mut r = msgpack::Reader::new(data);
        Ok(match vt {
            VarType::Null => Value::Null,
            VarType::Bool => Value::Bool(r.read_u8()? != 0),
            VarType::Int8 => Value::Int8(r.read_i8()?),
            VarType::Int16 => Value::Int16(r.read_i16()?),
            VarType::Int32 => Value::Int32(r.read_i32()?),
            VarType::Int64 => Value::Int64(r.read_i64()?),
            VarType::Float => Value::Float(r.read_f32()?),
            VarType::Double => Value::Double(r.read_f64()?),
            VarType::DateTime => Value::DateTime(datetime_from_secs(r.read_f64()?)?),
            VarType::String => {
                let end = data.iter().rposition(|&b| b != 0).map_or(0, |p| p + 1);
                let s = std::str::from_utf8(&data[..end]).map_err(|_| ProtocolError::InvalidUtf8)?;
                Value::String(s.to_string())
            }
            VarType::Binary => Value::Binary(Bytes::copy_from_slice(data)),
            other => return Value::decode_body(other, Bytes::copy_from_slice(data)),
        })
    }

    /// Decodes a variable-length body of type `vt`. Empty compound bodies
    /// decode to `Null`.
    pub fn decode_body(vt: VarType, body: Bytes) -> Result<Value, ProtocolError> {
        if let Some(width) = vt.fixed_width() {
            if body.len() < width {
                return Err(ProtocolError::Incomplete {
                    needed: width - body.len(),
                });
            }
            return Value::decode_fixed(vt, &body[..width]);
        }
        Ok(match vt {
            VarType::Null => Value::Null,
            VarType::String => Value::String(
                String::from_utf8(body.to_vec()).map_err(|_| ProtocolError::InvalidUtf8)?,
            ),
            VarType::Binary => Value::Binary(body),
            VarType::Slice if body.is_empty() => Value::Null,
            VarType::Slice => Value::Slice(OpSlice::from_body(body)?),
            VarType::Map if body.is_empty() => Value::Null,
            VarType::Map => Value::Map(OpMap::from_body(body)?),
            VarType::Structure if body.is_empty() => Value::Null,
            VarType::Structure => Value::Structure(OpStructure::from_body(body)?),
            VarType::Object if body.is_empty() => Value::Null,
            VarType::Object => {
                let inner = VarType::try_from(body[0])?;
                if inner == VarType::Object {
                    return Err(ProtocolError::malformed("object", "nested object tag"));
                }
                Value::decode_body(inner, body.slice(1..))?
            }
            other => return Err(ProtocolError::malformed("cell", format!("no body codec for {other}"))),
        })
    }

    /// Multi-line rendering of compound values.
    pub fn to_pretty_string(&self) -> String {
        let mut out = String::new();
        render(self, &mut out, true, 0);
        out
    }
}

fn put_padded(out: &mut impl BufMut, data: &[u8], width: usize) {
    let n = data.len().min(width);
    out.put_slice(&data[..n]);
    out.put_bytes(0, width - n);
}

// ============================================================================
// Rendering
// ============================================================================

fn push_indent(out: &mut String, indent: usize) {
    for _ in 0..indent {
        out.push_str("  ");
    }
}

fn render_nested(value: &Value, out: &mut String, pretty: bool, indent: usize) {
    match value {
        Value::String(s) => out.push_str(&format!("{s:?}")),
        other => render(other, out, pretty, indent),
    }
}

fn render_entries<I>(out: &mut String, open: char, close: char, entries: I, pretty: bool, indent: usize)
where
    I: Iterator<Item = (Option<String>, Result<Value, ProtocolError>)>,
{
    out.push(open);
    let mut first = true;
    for (label, value) in entries {
        if !first {
            out.push(',');
            if !pretty {
                out.push(' ');
            }
        }
        first = false;
        if pretty {
            out.push('\n');
            push_indent(out, indent + 1);
        }
        if let Some(label) = label {
            out.push_str(&label);
            out.push_str(": ");
        }
        match value {
            Ok(v) => render_nested(&v, out, pretty, indent + 1),
            Err(_) => out.push_str("<invalid>"),
        }
    }
    if pretty && !first {
        out.push('\n');
        push_indent(out, indent);
    }
    out.push(close);
}

pub(crate) fn render(value: &Value, out: &mut String, pretty: bool, indent: usize) {
    match value {
        Value::Slice(s) => render_entries(out, '[', ']', s.iter().map(|v| (None, v)), pretty, indent),
        Value::Map(m) => render_entries(
            out,
            '{',
            '}',
            m.iter().map(|(k, v)| {
                let key = match k {
                    Value::String(s) => format!("{s:?}"),
                    other => other.to_string(),
                };
                (Some(key), v)
            }),
            pretty,
            indent,
        ),
        Value::Structure(s) => render_entries(
            out,
            '{',
            '}',
            s.iter().map(|(name, v)| (Some(name.to_string()), v)),
            pretty,
            indent,
        ),
        other => out.push_str(&other.to_string()),
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.write_str("null"),
            Value::Bool(v) => write!(f, "{v}"),
            Value::Int8(v) => write!(f, "{v}"),
            Value::Int16(v) => write!(f, "{v}"),
            Value::Int32(v) => write!(f, "{v}"),
            Value::Int64(v) => write!(f, "{v}"),
            Value::Float(v) => write!(f, "{v}"),
            Value::Double(v) => write!(f, "{v}"),
            Value::DateTime(dt) => write!(f, "{}", dt.format(DATETIME_FORMAT)),
            Value::String(s) => f.write_str(s),
            Value::Binary(b) => {
                f.write_str("0x")?;
                for byte in b.iter() {
                    write!(f, "{byte:02x}")?;
                }
                Ok(())
            }
            compound => {
                let mut out = String::new();
                render(compound, &mut out, false, 0);
                f.write_str(&out)
            }
        }
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Value::Null => serializer.serialize_unit(),
            Value::Bool(v) => serializer.serialize_bool(*v),
            Value::Int8(v) => serializer.serialize_i8(*v),
            Value::Int16(v) => serializer.serialize_i16(*v),
            Value::Int32(v) => serializer.serialize_i32(*v),
            Value::Int64(v) => serializer.serialize_i64(*v),
            Value::Float(v) => serializer.serialize_f32(*v),
            Value::Double(v) => serializer.serialize_f64(*v),
            Value::DateTime(dt) => serializer.serialize_str(&dt.format(DATETIME_FORMAT).to_string()),
            Value::String(s) => serializer.serialize_str(s),
            Value::Binary(b) => serializer.serialize_bytes(b),
            Value::Slice(s) => {
                let mut seq = serializer.serialize_seq(Some(s.len()))?;
                for item in s.iter() {
                    seq.serialize_element(&item.unwrap_or_default())?;
                }
                seq.end()
            }
            Value::Map(m) => {
                let mut map = serializer.serialize_map(Some(m.len()))?;
                for (k, v) in m.iter() {
                    map.serialize_entry(&k.to_text(), &v.unwrap_or_default())?;
                }
                map.end()
            }
            Value::Structure(s) => {
                let mut map = serializer.serialize_map(Some(s.len()))?;
                for (name, v) in s.iter() {
                    map.serialize_entry(name, &v.unwrap_or_default())?;
                }
                map.end()
            }
        }
    }
}

macro_rules! value_from {
    ($ty:ty, $variant:ident) => {
        impl From<$ty> for Value {
            fn from(v: $ty) -> Self {
                Value::$variant(v)
            }
        }
    };
}

value_from!(bool, Bool);
value_from!(i8, Int8);
value_from!(i16, Int16);
value_from!(i32, Int32);
value_from!(i64, Int64);
value_from!(f32, Float);
value_from!(f64, Double);
value_from!(DateTime<Utc>, DateTime);
value_from!(String, String);
value_from!(Bytes, Binary);
value_from!(OpSlice, Slice);
value_from!(OpMap, Map);
value_from!(OpStructure, Structure);

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Binary(Bytes::from(v))
    }
}
