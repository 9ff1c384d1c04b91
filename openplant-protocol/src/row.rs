//! Parsed rows and typed cell access.

use crate::error::ProtocolError;
use crate::map::OpMap;
use crate::msgpack::Reader;
use crate::slice::OpSlice;
use crate::structure::OpStructure;
use crate::table::Table;
use crate::value::Value;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

/// A row materialised as column name to value.
pub type Record = BTreeMap<String, Value>;

/// Raw row bytes plus the location of each variable cell.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    data: Bytes,
    /// `(header start, body start, body end)` per variable cell.
    cells: Vec<(usize, usize, usize)>,
}

impl Row {
    /// Splits `data` according to `table`'s layout.
    pub fn parse(table: &Table, data: Bytes) -> Result<Self, ProtocolError> {
        let prefix = table.fixed_len() + table.bit_len();
        if data.len() < prefix {
            return Err(ProtocolError::Incomplete {
                needed: prefix - data.len(),
            });
        }
        let mut cells = Vec::with_capacity(table.variable_len());
        let mut r = Reader::new(&data[prefix..]);
        for _ in 0..table.variable_len() {
            let header = prefix + r.position();
            let len = r.read_bin_len()?;
            let body = prefix + r.position();
            r.skip(len)?;
            cells.push((header, body, body + len));
        }
        if !r.is_empty() {
            return Err(ProtocolError::malformed(
                "row",
                format!("{} trailing bytes", r.remaining()),
            ));
        }
        Ok(Self { data, cells })
    }

    pub fn bytes(&self) -> &Bytes {
        &self.data
    }

    /// Encoded length of variable cell `cell`, header included.
    pub fn cell_len(&self, cell: usize) -> usize {
        self.cells
            .get(cell)
            .map_or(0, |&(header, _, end)| end - header)
    }
}

/// A row read through its table schema.
#[derive(Debug, Clone, Copy)]
pub struct RowView<'a> {
    table: &'a Table,
    row: &'a Row,
}

impl<'a> RowView<'a> {
    /// Pairs `row` with `table`, checking the row was split for this layout.
    pub fn new(table: &'a Table, row: &'a Row) -> Result<Self, ProtocolError> {
        let mismatch = |reason: String| ProtocolError::RowSchemaMismatch {
            table: table.name().to_string(),
            reason,
        };
        let prefix = table.fixed_len() + table.bit_len();
        if row.data.len() < prefix {
            return Err(mismatch(format!(
                "{} row bytes, layout needs at least {}",
                row.data.len(),
                prefix
            )));
        }
        if row.cells.len() != table.variable_len() {
            return Err(mismatch(format!(
                "{} variable cells, layout has {}",
                row.cells.len(),
                table.variable_len()
            )));
        }
        Ok(Self { table, row })
    }

    pub fn table(&self) -> &'a Table {
        self.table
    }

    /// Returns whether column `col` was explicitly set when the row was built.
    pub fn is_set(&self, col: usize) -> Result<bool, ProtocolError> {
        self.table.column(col)?;
        let byte = self.row.data[self.table.fixed_len() + (col >> 3)];
        Ok(byte & (1 << (col & 7)) != 0)
    }

    /// Decodes column `col` as stored.
    pub fn get_value(&self, col: usize) -> Result<Value, ProtocolError> {
        let column = self.table.column(col)?;
        match column.cell() {
            None => Value::decode_fixed(column.vtype, &self.row.data[column.offset()..column.end()]),
            Some(cell) => {
                let (_, start, end) = self.row.cells[cell];
                Value::decode_body(column.vtype, self.row.data.slice(start..end))
            }
        }
    }

    /// Like [`RowView::get_value`], substituting the column default when
    /// the column was not set in this row.
    pub fn get_value_or_default(&self, col: usize) -> Result<Value, ProtocolError> {
        if !self.is_set(col)? {
            if let Some(default) = &self.table.column(col)?.default {
                return Ok(default.clone());
            }
        }
        self.get_value(col)
    }

    pub fn get_by_name(&self, name: &str) -> Result<Value, ProtocolError> {
        let col = self
            .table
            .column_index(name)
            .ok_or_else(|| ProtocolError::UnknownColumn(name.to_string()))?;
        self.get_value(col)
    }

    pub fn get_bool(&self, col: usize) -> Result<bool, ProtocolError> {
        self.get_value(col)?.to_bool()
    }

    pub fn get_i8(&self, col: usize) -> Result<i8, ProtocolError> {
        self.get_value(col)?.to_i8()
    }

    pub fn get_i16(&self, col: usize) -> Result<i16, ProtocolError> {
        self.get_value(col)?.to_i16()
    }

    pub fn get_i32(&self, col: usize) -> Result<i32, ProtocolError> {
        self.get_value(col)?.to_i32()
    }

    pub fn get_i64(&self, col: usize) -> Result<i64, ProtocolError> {
        self.get_value(col)?.to_i64()
    }

    pub fn get_f32(&self, col: usize) -> Result<f32, ProtocolError> {
        self.get_value(col)?.to_f32()
    }

    pub fn get_f64(&self, col: usize) -> Result<f64, ProtocolError> {
        self.get_value(col)?.to_f64()
    }

    pub fn get_datetime(&self, col: usize) -> Result<DateTime<Utc>, ProtocolError> {
        self.get_value(col)?.to_datetime()
    }

    pub fn get_string(&self, col: usize) -> Result<String, ProtocolError> {
        Ok(self.get_value(col)?.to_text())
    }

    pub fn get_bytes(&self, col: usize) -> Result<Bytes, ProtocolError> {
        self.get_value(col)?.to_bytes()
    }

    pub fn get_slice(&self, col: usize) -> Result<Option<OpSlice>, ProtocolError> {
        self.get_value(col)?.to_slice()
    }

    pub fn get_map(&self, col: usize) -> Result<Option<OpMap>, ProtocolError> {
        self.get_value(col)?.to_map()
    }

    pub fn get_structure(&self, col: usize) -> Result<Option<OpStructure>, ProtocolError> {
        self.get_value(col)?.to_structure()
    }

    /// All columns keyed by name, defaults applied to unset columns.
    pub fn to_record(&self) -> Result<Record, ProtocolError> {
        let mut record = Record::new();
        for (i, column) in self.table.columns().iter().enumerate() {
            record.insert(column.name.clone(), self.get_value_or_default(i)?);
        }
        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::VarType;
    use chrono::TimeZone;

    fn table() -> Table {
        let mut t = Table::new("Realtime");
        t.add_column("ID", VarType::Int32, 0).unwrap();
        t.add_column("TM", VarType::DateTime, 0).unwrap();
        t.add_column("DS", VarType::Int16, 0).unwrap();
        t.add_column("AV", VarType::Object, 0).unwrap();
        t.add_column("GN", VarType::String, 0).unwrap();
        t
    }

    #[test]
    fn test_typed_getters() {
        let mut t = table();
        let tm = Utc.timestamp_opt(1_700_000_000, 500_000_000).unwrap();
        t.set_i32(0, 1024)
            .set_datetime(1, tm)
            .set_i16(2, -3)
            .set_object(3, 22.5f64)
            .set_str(4, "W3.N.P1");
        t.bind_row().unwrap();

        let row = t.row(0).unwrap();
        let view = t.view(&row).unwrap();
        assert_eq!(view.get_i32(0).unwrap(), 1024);
        assert_eq!(view.get_datetime(1).unwrap(), tm);
        assert_eq!(view.get_i16(2).unwrap(), -3);
        assert_eq!(view.get_f64(3).unwrap(), 22.5);
        assert_eq!(view.get_string(4).unwrap(), "W3.N.P1");
        assert_eq!(view.get_by_name("av").unwrap(), Value::Double(22.5));
    }

    #[test]
    fn test_cross_type_getters() {
        let mut t = table();
        t.set_i32(0, 70000).set_object(3, 3.9f64).set_str(4, "abc");
        t.bind_row().unwrap();
        let row = t.row(0).unwrap();
        let view = t.view(&row).unwrap();

        assert_eq!(view.get_i16(0).unwrap(), 70000i32 as i16);
        assert_eq!(view.get_i64(3).unwrap(), 3);
        assert!(view.get_bool(0).unwrap());
        assert_eq!(view.get_string(0).unwrap(), "70000");
        assert!(view.get_i32(4).is_err());
        assert_eq!(view.get_i32(4).unwrap_or_default(), 0);
        assert_eq!(view.get_f64(1).unwrap(), 0.0);
    }

    #[test]
    fn test_out_of_range() {
        let mut t = table();
        t.bind_row().unwrap();
        let row = t.row(0).unwrap();
        let view = t.view(&row).unwrap();
        assert!(matches!(
            view.get_i32(9),
            Err(ProtocolError::ColumnOutOfRange { index: 9, count: 5 })
        ));
        assert!(matches!(
            view.get_by_name("missing"),
            Err(ProtocolError::UnknownColumn(_))
        ));
    }

    #[test]
    fn test_unset_object_is_null() {
        let mut t = table();
        t.set_i32(0, 1).bind_row().unwrap();
        let row = t.row(0).unwrap();
        let view = t.view(&row).unwrap();
        assert!(!view.is_set(3).unwrap());
        assert_eq!(view.get_value(3).unwrap(), Value::Null);
        assert_eq!(view.get_f64(3).unwrap(), 0.0);
    }

    #[test]
    fn test_explicit_empty_vs_unset() {
        let mut t = table();
        t.set_empty(4).bind_row().unwrap();
        t.bind_row().unwrap();
        let first = t.row(0).unwrap();
        let second = t.row(1).unwrap();
        let bitmap = t.fixed_len();
        assert_eq!(first.bytes()[bitmap], 0b1_0000);
        assert_eq!(second.bytes()[bitmap], 0);
        assert_eq!(first.bytes()[bitmap + 1..], second.bytes()[bitmap + 1..]);
        assert!(t.view(&first).unwrap().is_set(4).unwrap());
        assert!(!t.view(&second).unwrap().is_set(4).unwrap());
        assert_eq!(t.view(&first).unwrap().get_string(4).unwrap(), "");
    }

    #[test]
    fn test_defaults_for_unset_columns() {
        let mut t = table();
        t.set_column_default(2, 192i32).unwrap();
        t.set_i16(2, 0).bind_row().unwrap();
        t.bind_row().unwrap();

        let set = t.row(0).unwrap();
        let unset = t.row(1).unwrap();
        assert_eq!(t.view(&set).unwrap().get_value_or_default(2).unwrap(), Value::Int16(0));
        assert_eq!(t.view(&unset).unwrap().get_value_or_default(2).unwrap(), Value::Int16(192));
        assert_eq!(t.view(&unset).unwrap().get_value(2).unwrap(), Value::Int16(0));

        let record = t.view(&unset).unwrap().to_record().unwrap();
        assert_eq!(record["DS"], Value::Int16(192));
        assert_eq!(record["AV"], Value::Null);
    }

    #[test]
    fn test_parse_rejects_trailing_bytes() {
        let mut t = table();
        t.bind_row().unwrap();
        let mut raw = t.rows()[0].to_vec();
        raw.push(0);
        assert!(Row::parse(&t, Bytes::from(raw)).is_err());
    }

    #[test]
    fn test_view_rejects_foreign_schema() {
        let mut named = Table::new("Point");
        named.add_column("ID", VarType::Int32, 0).unwrap();
        named.add_column("GN", VarType::String, 0).unwrap();
        named.set_i32(0, 7).set_str(1, "W3.N.P1").bind_row().unwrap();
        let row = named.row(0).unwrap();

        let mut ids = Table::new("Point");
        ids.add_column("ID", VarType::Int32, 0).unwrap();
        let err = ids.view(&row).unwrap_err();
        assert!(matches!(err, ProtocolError::RowSchemaMismatch { .. }));
        assert_eq!(err.kind(), crate::error::ErrorKind::Schema);

        // a wider fixed section than the row carries
        let err = table().view(&row).unwrap_err();
        assert!(matches!(err, ProtocolError::RowSchemaMismatch { .. }));

        assert_eq!(named.view(&row).unwrap().get_i32(0).unwrap(), 7);
    }
}
