//! Named, heterogeneously typed records (`VarType::Structure`).
//!
//! ```text
//! structure := <bin-header> <field>*
//! field     := <type:1> <bin-header> <nameLen:1> <name> <tagFlag:1> [<tagLen:1> <tag>] <value>
//! ```
//!
//! The field's bin length covers everything from `nameLen` to the end of the
//! value, so the value is the remainder of the field.

use crate::error::ProtocolError;
use crate::msgpack::{self, Reader};
use crate::types::VarType;
use crate::value::Value;
use bytes::{BufMut, Bytes, BytesMut};
use std::collections::HashMap;
use std::fmt;

#[derive(Debug, Clone)]
struct FieldSpan {
    name: String,
    vtype: VarType,
    tag: Option<String>,
    pos: usize,
    len: usize,
}

/// A decoded structure; field access is O(1) by name.
#[derive(Clone)]
pub struct OpStructure {
    body: Bytes,
    fields: Vec<FieldSpan>,
    by_name: HashMap<String, usize>,
}

fn read_short_str<'a>(r: &mut Reader<'a>, what: &'static str) -> Result<&'a str, ProtocolError> {
    let len = r.read_u8()? as usize;
    let raw = r.read_bytes(len)?;
    std::str::from_utf8(raw).map_err(|_| ProtocolError::malformed(what, "invalid UTF-8"))
}

impl OpStructure {
    pub fn builder() -> StructureBuilder {
        StructureBuilder::default()
    }

    /// Parses a body (`<field>*`), taking ownership of it.
    pub fn from_body(body: Bytes) -> Result<Self, ProtocolError> {
        let mut fields = Vec::new();
        let mut by_name = HashMap::new();
        let mut r = Reader::new(&body);
        while !r.is_empty() {
            let vtype = VarType::try_from(r.read_u8()?)?;
            let field_len = r.read_bin_len()?;
            let field_end = r.position() + field_len;
            if field_end > body.len() {
                return Err(ProtocolError::Incomplete {
                    needed: field_end - body.len(),
                });
            }
            let mut f = Reader::new(&body[..field_end]);
            f.skip(r.position())?;
            let name = read_short_str(&mut f, "structure field name")?.to_string();
            let tag = match f.read_u8()? {
                0 => None,
                _ => Some(read_short_str(&mut f, "structure field tag")?.to_string()),
            };
            let pos = f.position();
            let len = field_end - pos;
            if let Some(width) = vtype.fixed_width() {
                if len != width {
                    return Err(ProtocolError::malformed(
                        "structure field",
                        format!("{name}: {vtype} value of {len} bytes"),
                    ));
                }
            }
            by_name.insert(name.clone(), fields.len());
            fields.push(FieldSpan {
                name,
                vtype,
                tag,
                pos,
                len,
            });
            r.skip(field_len)?;
        }
        Ok(Self {
            body,
            fields,
            by_name,
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

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Field names in wire order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|f| f.name.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.by_name.contains_key(name)
    }

    pub fn field_type(&self, name: &str) -> Option<VarType> {
        self.by_name.get(name).map(|&i| self.fields[i].vtype)
    }

    pub fn tag(&self, name: &str) -> Option<&str> {
        self.by_name
            .get(name)
            .and_then(|&i| self.fields[i].tag.as_deref())
    }

    fn value_of(&self, field: &FieldSpan) -> Result<Value, ProtocolError> {
        Value::decode_body(field.vtype, self.body.slice(field.pos..field.pos + field.len))
    }

    /// Returns the value of field `name`, `None` when absent.
    pub fn get(&self, name: &str) -> Result<Option<Value>, ProtocolError> {
        self.by_name
            .get(name)
            .map(|&i| self.value_of(&self.fields[i]))
            .transpose()
    }

    /// Fields in wire order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, Result<Value, ProtocolError>)> + '_ {
        self.fields
            .iter()
            .map(move |f| (f.name.as_str(), self.value_of(f)))
    }
}

impl PartialEq for OpStructure {
    fn eq(&self, other: &Self) -> bool {
        self.body == other.body
    }
}

impl fmt::Debug for OpStructure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpStructure")
            .field("fields", &self.fields.iter().map(|f| &f.name).collect::<Vec<_>>())
            .finish()
    }
}

impl fmt::Display for OpStructure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&Value::Structure(self.clone()), f)
    }
}

/// Incrementally assembles an [`OpStructure`].
#[derive(Debug, Default)]
pub struct StructureBuilder {
    body: BytesMut,
    error: Option<ProtocolError>,
}

impl StructureBuilder {
    /// Adds a field typed after its value.
    pub fn field(self, name: &str, value: impl Into<Value>) -> Self {
        let value = value.into();
        let vt = value.var_type();
        self.push(name, None, vt, value)
    }

    /// Adds a field with an explicit type, coercing the value.
    pub fn typed_field(self, name: &str, vtype: VarType, value: impl Into<Value>) -> Self {
        self.push(name, None, vtype, value.into())
    }

    /// Adds a field carrying a tag string.
    pub fn tagged_field(self, name: &str, tag: &str, value: impl Into<Value>) -> Self {
        let value = value.into();
        let vt = value.var_type();
        self.push(name, Some(tag), vt, value)
    }

    fn push(mut self, name: &str, tag: Option<&str>, vtype: VarType, value: Value) -> Self {
        if self.error.is_some() {
            return self;
        }
        if let Err(e) = self.try_push(name, tag, vtype, value) {
            self.error = Some(e);
        }
        self
    }

    fn try_push(&mut self, name: &str, tag: Option<&str>, vtype: VarType, value: Value) -> Result<(), ProtocolError> {
        if name.len() > u8::MAX as usize || tag.is_some_and(|t| t.len() > u8::MAX as usize) {
            return Err(ProtocolError::malformed("structure field", format!("{name}: name or tag too long")));
        }
        if vtype == VarType::Null {
            return Err(ProtocolError::malformed("structure field", format!("{name}: null type")));
        }
        let value = value.coerce(vtype)?;
        let mut field = BytesMut::new();
        field.put_u8(name.len() as u8);
        field.put_slice(name.as_bytes());
        match tag {
            Some(tag) => {
                field.put_u8(1);
                field.put_u8(tag.len() as u8);
                field.put_slice(tag.as_bytes());
            }
            None => field.put_u8(0),
        }
        match vtype.fixed_width() {
            Some(width) => value.encode_fixed(width, &mut field),
            None if vtype == VarType::Object && !value.is_null() => {
                field.put_u8(value.var_type().code());
                value.encode_body(&mut field);
            }
            None => value.encode_body(&mut field),
        }
        self.body.put_u8(vtype.code());
        msgpack::write_bin(&mut self.body, &field);
        Ok(())
    }

    pub fn build(self) -> Result<OpStructure, ProtocolError> {
        match self.error {
            Some(e) => Err(e),
            None => OpStructure::from_body(self.body.freeze()),
        }
    }
}
