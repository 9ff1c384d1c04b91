//! Column schemas and the row builder.
//!
//! Row layout:
//!
//! ```text
//! row := <fixed prefix: fixed_len bytes> <set bitmap: bit_len bytes> <variable cell>*
//! ```
//!
//! Fixed columns occupy the prefix in declaration order. Each variable
//! column contributes one bin-prefixed cell, in declaration order. Bit `i`
//! (LSB first within byte `i / 8`) marks column `i` as explicitly set.

use crate::error::ProtocolError;
use crate::hash;
use crate::map::OpMap;
use crate::msgpack;
use crate::row::{Row, RowView};
use crate::slice::OpSlice;
use crate::structure::OpStructure;
use crate::types::VarType;
use crate::value::Value;
use bytes::{BufMut, Bytes, BytesMut};
use chrono::{DateTime, Utc};

/// One column of a table schema.
#[derive(Debug, Clone, PartialEq)]
pub struct Column {
    pub name: String,
    pub vtype: VarType,
    /// Declared length; 0 for variable columns.
    pub length: usize,
    pub mask: u32,
    pub default: Option<Value>,
    pub ext: Option<Bytes>,
    cell: Option<usize>,
    offset: usize,
    end: usize,
}

impl Column {
    /// Width of the fixed slot a column of this type and declared length
    /// occupies, `None` for variable columns.
    pub fn fixed_width_of(vtype: VarType, length: usize) -> Option<usize> {
        match vtype {
            VarType::String | VarType::Binary if length > 0 => Some(length),
            vt => vt.fixed_width(),
        }
    }

    pub fn is_fixed(&self) -> bool {
        self.cell.is_none()
    }

    /// Ordinal among the table's variable columns.
    pub fn cell(&self) -> Option<usize> {
        self.cell
    }

    /// Byte offset in the fixed prefix.
    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn end(&self) -> usize {
        self.end
    }
}

/// A table schema plus the rows built against it.
#[derive(Debug, Clone, Default)]
pub struct Table {
    name: String,
    id: u32,
    columns: Vec<Column>,
    fixed_len: usize,
    bit_len: usize,
    variable_len: usize,
    fixed_buf: Vec<u8>,
    bit_buf: Vec<u8>,
    variable_buf: Vec<Option<Bytes>>,
    rows: Vec<Bytes>,
    row_count: usize,
    errors: Vec<ProtocolError>,
    pending_errors: usize,
}

impl Table {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            id: hash::table_id(&name),
            name,
            ..Default::default()
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Hash id derived from the first four name bytes.
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Schema fingerprint over column names and types.
    pub fn fingerprint(&self) -> u64 {
        hash::fingerprint(self.columns.iter().map(|c| (c.name.as_str(), c.vtype.code())))
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn column(&self, index: usize) -> Result<&Column, ProtocolError> {
        self.columns.get(index).ok_or(ProtocolError::ColumnOutOfRange {
            index,
            count: self.columns.len(),
        })
    }

    /// Case-insensitive column lookup.
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns
            .iter()
            .position(|c| c.name.eq_ignore_ascii_case(name))
    }

    pub fn fixed_len(&self) -> usize {
        self.fixed_len
    }

    pub fn bit_len(&self) -> usize {
        self.bit_len
    }

    pub fn variable_len(&self) -> usize {
        self.variable_len
    }

    /// Appends a column and returns its index.
    ///
    /// Fails once rows have been bound: the layout of existing rows would
    /// no longer match.
    pub fn add_column(&mut self, name: impl Into<String>, vtype: VarType, length: usize) -> Result<usize, ProtocolError> {
        if self.row_count > 0 || !self.rows.is_empty() {
            return Err(ProtocolError::SchemaFrozen(self.name.clone()));
        }
        let (cell, offset, end, length) = match Column::fixed_width_of(vtype, length) {
            Some(width) => {
                let offset = self.fixed_len;
                self.fixed_len += width;
                (None, offset, offset + width, width)
            }
            None => {
                let cell = self.variable_len;
                self.variable_len += 1;
                (Some(cell), self.fixed_len, self.fixed_len, 0)
            }
        };
        self.columns.push(Column {
            name: name.into(),
            vtype,
            length,
            mask: 0,
            default: None,
            ext: None,
            cell,
            offset,
            end,
        });
        self.bit_len = self.columns.len().div_ceil(8);
        self.reset_scratch();
        Ok(self.columns.len() - 1)
    }

    /// Attaches extension bytes to a column.
    pub fn add_column_extension(&mut self, col: usize, ext: impl Into<Bytes>) -> Result<(), ProtocolError> {
        self.column_mut(col)?.ext = Some(ext.into());
        Ok(())
    }

    pub fn set_column_mask(&mut self, col: usize, mask: u32) -> Result<(), ProtocolError> {
        self.column_mut(col)?.mask = mask;
        Ok(())
    }

    /// Sets the value readers substitute when the column is unset in a row.
    pub fn set_column_default(&mut self, col: usize, default: impl Into<Value>) -> Result<(), ProtocolError> {
        let vtype = self.column(col)?.vtype;
        let default = default.into().coerce(vtype)?;
        self.column_mut(col)?.default = Some(default);
        Ok(())
    }

    fn column_mut(&mut self, index: usize) -> Result<&mut Column, ProtocolError> {
        let count = self.columns.len();
        self.columns
            .get_mut(index)
            .ok_or(ProtocolError::ColumnOutOfRange { index, count })
    }

    fn reset_scratch(&mut self) {
        self.fixed_buf.clear();
        self.fixed_buf.resize(self.fixed_len, 0);
        self.bit_buf.clear();
        self.bit_buf.resize(self.bit_len, 0);
        self.variable_buf.clear();
        self.variable_buf.resize(self.variable_len, None);
    }

    fn record(&mut self, err: ProtocolError) {
        self.pending_errors += 1;
        self.errors.push(err);
    }

    fn write_cell(&mut self, col: usize, value: &Value) -> Result<(), ProtocolError> {
        let column = self.column(col)?;
        let value = value.coerce(column.vtype)?;
        let (vtype, cell, offset, end) = (column.vtype, column.cell, column.offset, column.end);
        match cell {
            None => {
                let mut slot = &mut self.fixed_buf[offset..end];
                value.encode_fixed(end - offset, &mut slot);
            }
            Some(cell) => {
                let mut buf = BytesMut::with_capacity(msgpack::bin_header_len(value.body_len()) + value.body_len() + 1);
                value.encode_variable(vtype, &mut buf);
                self.variable_buf[cell] = Some(buf.freeze());
            }
        }
        self.bit_buf[col >> 3] |= 1 << (col & 7);
        Ok(())
    }

    fn set(&mut self, col: usize, value: Value) -> &mut Self {
        if let Err(e) = self.write_cell(col, &value) {
            self.record(e);
        }
        self
    }

    pub fn set_bool(&mut self, col: usize, v: bool) -> &mut Self {
        self.set(col, Value::Bool(v))
    }

    pub fn set_i8(&mut self, col: usize, v: i8) -> &mut Self {
        self.set(col, Value::Int8(v))
    }

    pub fn set_i16(&mut self, col: usize, v: i16) -> &mut Self {
        self.set(col, Value::Int16(v))
    }

    pub fn set_i32(&mut self, col: usize, v: i32) -> &mut Self {
        self.set(col, Value::Int32(v))
    }

    pub fn set_i64(&mut self, col: usize, v: i64) -> &mut Self {
        self.set(col, Value::Int64(v))
    }

    pub fn set_f32(&mut self, col: usize, v: f32) -> &mut Self {
        self.set(col, Value::Float(v))
    }

    pub fn set_f64(&mut self, col: usize, v: f64) -> &mut Self {
        self.set(col, Value::Double(v))
    }

    pub fn set_datetime(&mut self, col: usize, v: DateTime<Utc>) -> &mut Self {
        self.set(col, Value::DateTime(v))
    }

    pub fn set_str(&mut self, col: usize, v: &str) -> &mut Self {
        self.set(col, Value::String(v.to_string()))
    }

    pub fn set_bytes(&mut self, col: usize, v: impl Into<Bytes>) -> &mut Self {
        self.set(col, Value::Binary(v.into()))
    }

    pub fn set_slice(&mut self, col: usize, v: OpSlice) -> &mut Self {
        self.set(col, Value::Slice(v))
    }

    pub fn set_map(&mut self, col: usize, v: OpMap) -> &mut Self {
        self.set(col, Value::Map(v))
    }

    pub fn set_structure(&mut self, col: usize, v: OpStructure) -> &mut Self {
        self.set(col, Value::Structure(v))
    }

    /// Sets any value, coercing it to the column type.
    pub fn set_value(&mut self, col: usize, v: impl Into<Value>) -> &mut Self {
        self.set(col, v.into())
    }

    /// Sets a dynamically typed value on an `Object` column; the cell
    /// records the value's own type tag.
    pub fn set_object(&mut self, col: usize, v: impl Into<Value>) -> &mut Self {
        let v = v.into();
        match self.column(col) {
            Ok(c) if c.vtype == VarType::Object => self.set(col, v),
            Ok(c) => {
                let err = ProtocolError::Coercion {
                    from: v.var_type(),
                    to: c.vtype,
                };
                self.record(err);
                self
            }
            Err(e) => {
                self.record(e);
                self
            }
        }
    }

    /// Marks the column set with an empty payload (`c4 00` for variable
    /// columns, zeros for fixed ones).
    pub fn set_empty(&mut self, col: usize) -> &mut Self {
        let column = match self.column(col) {
            Ok(c) => c,
            Err(e) => {
                self.record(e);
                return self;
            }
        };
        match column.cell {
            None => {
                let (offset, end) = (column.offset, column.end);
                self.fixed_buf[offset..end].fill(0);
            }
            Some(cell) => self.variable_buf[cell] = Some(Bytes::from_static(&msgpack::EMPTY_BIN)),
        }
        self.bit_buf[col >> 3] |= 1 << (col & 7);
        self
    }

    /// Finalizes the scratch row.
    ///
    /// The row count always advances. When setters failed since the last
    /// bind, no bytes are appended and `RowRejected` is returned; the
    /// individual errors stay in [`Table::errors`] until [`Table::clear`].
    pub fn bind_row(&mut self) -> Result<(), ProtocolError> {
        let row = self.row_count;
        self.row_count += 1;
        if self.pending_errors > 0 {
            let errors = self.pending_errors;
            self.pending_errors = 0;
            self.reset_scratch();
            return Err(ProtocolError::RowRejected { row, errors });
        }

        let variable: usize = self
            .variable_buf
            .iter()
            .map(|c| c.as_ref().map_or(msgpack::EMPTY_BIN.len(), |b| b.len()))
            .sum();
        let mut out = BytesMut::with_capacity(self.fixed_len + self.bit_len + variable);
        out.put_slice(&self.fixed_buf);
        out.put_slice(&self.bit_buf);
        for cell in &self.variable_buf {
            match cell {
                Some(bytes) => out.put_slice(bytes),
                None => out.put_slice(&msgpack::EMPTY_BIN),
            }
        }
        self.rows.push(out.freeze());
        self.reset_scratch();
        Ok(())
    }

    /// Appends a row produced elsewhere after checking it against the schema.
    pub fn append_raw(&mut self, row: impl Into<Bytes>) -> Result<(), ProtocolError> {
        let row = row.into();
        Row::parse(self, row.clone())?;
        self.rows.push(row);
        self.row_count += 1;
        Ok(())
    }

    /// Drops all rows, errors and scratch state. The schema is kept.
    pub fn clear(&mut self) {
        self.rows.clear();
        self.row_count = 0;
        self.errors.clear();
        self.pending_errors = 0;
        self.reset_scratch();
    }

    /// Setter errors recorded since the last [`Table::clear`].
    pub fn errors(&self) -> &[ProtocolError] {
        &self.errors
    }

    /// Rows bound so far, including rejected ones.
    pub fn row_count(&self) -> usize {
        self.row_count
    }

    /// Encoded rows, rejected ones excluded.
    pub fn rows(&self) -> &[Bytes] {
        &self.rows
    }

    /// Parses stored row `index`.
    pub fn row(&self, index: usize) -> Result<Row, ProtocolError> {
        let data = self.rows.get(index).ok_or(ProtocolError::ColumnOutOfRange {
            index,
            count: self.rows.len(),
        })?;
        Row::parse(self, data.clone())
    }

    /// Returns a copy of the schema without rows.
    pub fn schema(&self) -> Table {
        let mut t = Table {
            name: self.name.clone(),
            id: self.id,
            columns: self.columns.clone(),
            fixed_len: self.fixed_len,
            bit_len: self.bit_len,
            variable_len: self.variable_len,
            ..Default::default()
        };
        t.reset_scratch();
        t
    }

    /// Borrows a parsed row as a view together with this schema.
    pub fn view<'a>(&'a self, row: &'a Row) -> Result<RowView<'a>, ProtocolError> {
        RowView::new(self, row)
    }
}
