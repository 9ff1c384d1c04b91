//! Row predicates sent in the `Filters` property.
//!
//! Each filter goes out as a four-entry map `{L, O, R, Or}`; `Or` joins the
//! filter to the next one. Typed right-hand values are rendered to text once,
//! at serialization.

use crate::error::ProtocolError;
use crate::msgpack::{self, MsgValue};
use crate::value::{Value, DATETIME_FORMAT};
use bytes::BufMut;
use chrono::{DateTime, Timelike, Utc};
use std::fmt;

/// Comparison operator of a filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FilterOp {
    Eq = 1,
    Ne = 2,
    Gt = 3,
    Lt = 4,
    Ge = 5,
    Le = 6,
    In = 7,
    NotIn = 8,
    Like = 9,
    NotLike = 10,
    Regexp = 11,
}

impl FilterOp {
    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn symbol(self) -> &'static str {
        match self {
            FilterOp::Eq => "=",
            FilterOp::Ne => "!=",
            FilterOp::Gt => ">",
            FilterOp::Lt => "<",
            FilterOp::Ge => ">=",
            FilterOp::Le => "<=",
            FilterOp::In => "in",
            FilterOp::NotIn => "not in",
            FilterOp::Like => "like",
            FilterOp::NotLike => "not like",
            FilterOp::Regexp => "regexp",
        }
    }
}

impl TryFrom<i64> for FilterOp {
    type Error = ProtocolError;

    fn try_from(code: i64) -> Result<Self, Self::Error> {
        Ok(match code {
            1 => FilterOp::Eq,
            2 => FilterOp::Ne,
            3 => FilterOp::Gt,
            4 => FilterOp::Lt,
            5 => FilterOp::Ge,
            6 => FilterOp::Le,
            7 => FilterOp::In,
            8 => FilterOp::NotIn,
            9 => FilterOp::Like,
            10 => FilterOp::NotLike,
            11 => FilterOp::Regexp,
            other => return Err(ProtocolError::malformed("filter", format!("unknown operator {other}"))),
        })
    }
}

/// How a filter joins to the next one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Relation {
    #[default]
    And = 0,
    Or = 1,
}

/// Typed right-hand side of a filter.
#[derive(Debug, Clone, PartialEq)]
pub enum FilterValue {
    Int(i64),
    Float(f64),
    Str(String),
    Time(DateTime<Utc>),
    List(Vec<FilterValue>),
}

fn render_time(dt: &DateTime<Utc>) -> String {
    if dt.nanosecond() == 0 {
        dt.format("%Y-%m-%d %H:%M:%S").to_string()
    } else {
        dt.format(DATETIME_FORMAT).to_string()
    }
}

impl FilterValue {
    /// Wire text of the value.
    pub fn render(&self) -> String {
        match self {
            FilterValue::Int(v) => v.to_string(),
            FilterValue::Float(v) => v.to_string(),
            FilterValue::Str(s) => s.clone(),
            FilterValue::Time(dt) => render_time(dt),
            FilterValue::List(items) => items
                .iter()
                .map(|item| match item {
                    FilterValue::Str(s) => format!("'{}'", s.replace('\'', "''")),
                    FilterValue::Time(dt) => format!("'{}'", render_time(dt)),
                    other => other.render(),
                })
                .collect::<Vec<_>>()
                .join(","),
        }
    }
}

impl fmt::Display for FilterValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render())
    }
}

macro_rules! filter_value_from {
    ($($ty:ty => $variant:ident as $conv:ty),* $(,)?) => {
        $(impl From<$ty> for FilterValue {
            fn from(v: $ty) -> Self {
                FilterValue::$variant(v as $conv)
            }
        })*
    };
}

filter_value_from!(
    i8 => Int as i64,
    i16 => Int as i64,
    i32 => Int as i64,
    i64 => Int as i64,
    u32 => Int as i64,
    f32 => Float as f64,
    f64 => Float as f64,
);

impl From<&str> for FilterValue {
    fn from(v: &str) -> Self {
        FilterValue::Str(v.to_string())
    }
}

impl From<String> for FilterValue {
    fn from(v: String) -> Self {
        FilterValue::Str(v)
    }
}

impl From<DateTime<Utc>> for FilterValue {
    fn from(v: DateTime<Utc>) -> Self {
        FilterValue::Time(v)
    }
}

impl<T: Into<FilterValue>> From<Vec<T>> for FilterValue {
    fn from(v: Vec<T>) -> Self {
        FilterValue::List(v.into_iter().map(Into::into).collect())
    }
}

impl From<&Value> for FilterValue {
    fn from(v: &Value) -> Self {
        match v {
            Value::Bool(b) => FilterValue::Int(*b as i64),
            Value::Int8(_) | Value::Int16(_) | Value::Int32(_) | Value::Int64(_) => {
                FilterValue::Int(v.to_i64().unwrap_or_default())
            }
            Value::Float(_) | Value::Double(_) => FilterValue::Float(v.to_f64().unwrap_or_default()),
            Value::DateTime(dt) => FilterValue::Time(*dt),
            Value::Slice(s) => FilterValue::List(s.iter().map(|e| FilterValue::from(&e.unwrap_or_default())).collect()),
            other => FilterValue::Str(other.to_text()),
        }
    }
}

/// One predicate.
#[derive(Debug, Clone, PartialEq)]
pub struct Filter {
    pub left: String,
    pub op: FilterOp,
    pub right: FilterValue,
    pub relation: Relation,
}

/// Wire form of a decoded filter; the right side is already text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawFilter {
    pub left: String,
    pub op: FilterOp,
    pub right: String,
    pub relation: Relation,
}

/// Ordered filter list.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Filters(Vec<Filter>);

impl Filters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a filter joined to the next one with AND.
    pub fn and(mut self, left: &str, op: FilterOp, right: impl Into<FilterValue>) -> Self {
        self.push(left, op, right.into(), Relation::And);
        self
    }

    /// Appends a filter joined to the next one with OR.
    pub fn or(mut self, left: &str, op: FilterOp, right: impl Into<FilterValue>) -> Self {
        self.push(left, op, right.into(), Relation::Or);
        self
    }

    fn push(&mut self, left: &str, op: FilterOp, right: FilterValue, relation: Relation) {
        self.0.push(Filter {
            left: left.to_string(),
            op,
            right,
            relation,
        });
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Filter> {
        self.0.iter()
    }

    pub fn encode(&self, out: &mut impl BufMut) {
        msgpack::write_array_len(out, self.0.len() as u32);
        for f in &self.0 {
            msgpack::write_map_len(out, 4);
            msgpack::write_str(out, "L");
            msgpack::write_str(out, &f.left);
            msgpack::write_str(out, "O");
            msgpack::write_int(out, f.op.code() as i64);
            msgpack::write_str(out, "R");
            msgpack::write_str(out, &f.right.render());
            msgpack::write_str(out, "Or");
            msgpack::write_int(out, f.relation as i64);
        }
    }

    /// Reads a decoded `Filters` property back into wire filters.
    pub fn decode(value: &MsgValue) -> Result<Vec<RawFilter>, ProtocolError> {
        let items = value
            .as_array()
            .ok_or_else(|| ProtocolError::malformed("filters", "not an array"))?;
        items
            .iter()
            .map(|item| {
                let left = item.get("L").and_then(MsgValue::as_str).unwrap_or_default();
                let op = item
                    .get("O")
                    .and_then(MsgValue::as_int)
                    .ok_or_else(|| ProtocolError::malformed("filter", "missing operator"))?;
                let right = item.get("R").and_then(MsgValue::as_str).unwrap_or_default();
                let relation = match item.get("Or").and_then(MsgValue::as_int) {
                    Some(1) => Relation::Or,
                    _ => Relation::And,
                };
                Ok(RawFilter {
                    left: left.to_string(),
                    op: FilterOp::try_from(op)?,
                    right: right.to_string(),
                    relation,
                })
            })
            .collect()
    }
}

impl<'a> IntoIterator for &'a Filters {
    type Item = &'a Filter;
    type IntoIter = std::slice::Iter<'a, Filter>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}
