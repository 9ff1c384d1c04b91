//! Request and response message bodies.
//!
//! ```text
//! message := <props map> nil [<page>* ]
//! page    := <array header: n> <ext VT_ROW row>{n}   (n = 0xFFFFFFFF ends the stream)
//! ```
//!
//! Requests carry at most one page of rows and no end marker. Responses with
//! a result set stream any number of pages followed by the end marker.

use crate::error::ProtocolError;
use crate::filter::{Filters, RawFilter};
use crate::index::{IndexKeys, Indexes};
use crate::msgpack::{self, marker, MsgValue, Reader};
use crate::props::{key, Action, Props, SERVICE_NAME};
use crate::table::Table;
use crate::types::{VarType, VT_ROW};
use bytes::{BufMut, Bytes};
use std::ops::Range;

/// Array length announcing the end of a result stream.
pub const END_OF_STREAM: u32 = 0xFFFF_FFFF;

/// Rows per page written by [`Response::encode`] unless configured.
pub const DEFAULT_PAGE_ROWS: usize = 1000;

/// Maps an incomplete parse to `None`.
fn need_more<T>(res: Result<T, ProtocolError>) -> Result<Option<T>, ProtocolError> {
    match res {
        Ok(v) => Ok(Some(v)),
        Err(ProtocolError::Incomplete { .. }) => Ok(None),
        Err(e) => Err(e),
    }
}

// ============================================================================
// Column descriptors
// ============================================================================

/// A column as described in the `Columns` property.
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnDesc {
    pub name: String,
    pub vtype: VarType,
    pub length: usize,
    pub ext: Option<Bytes>,
}

impl ColumnDesc {
    /// Select-list entry: name only, type and length zero.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            vtype: VarType::Null,
            length: 0,
            ext: None,
        }
    }

    fn encode(&self, out: &mut impl BufMut) {
        msgpack::write_map_len(out, if self.ext.is_some() { 4 } else { 3 });
        msgpack::write_str(out, "Name");
        msgpack::write_str(out, &self.name);
        msgpack::write_str(out, "Type");
        msgpack::write_int(out, self.vtype.code() as i64);
        msgpack::write_str(out, "Length");
        msgpack::write_int(out, self.length as i64);
        if let Some(ext) = &self.ext {
            msgpack::write_str(out, "Ext");
            msgpack::write_bin(out, ext);
        }
    }

    fn from_msg(value: &MsgValue) -> Result<Self, ProtocolError> {
        let name = value
            .get("Name")
            .and_then(MsgValue::as_str)
            .ok_or(ProtocolError::MissingProperty("Columns.Name"))?;
        let code = value.get("Type").and_then(MsgValue::as_int).unwrap_or(0);
        let vtype = u8::try_from(code)
            .map_err(|_| ProtocolError::malformed("column", format!("type {code}")))
            .and_then(VarType::try_from)?;
        let length = value.get("Length").and_then(MsgValue::as_int).unwrap_or(0).max(0) as usize;
        let ext = match value.get("Ext") {
            Some(MsgValue::Bin(b)) => Some(b.clone()),
            Some(MsgValue::Str(s)) => Some(Bytes::copy_from_slice(s.as_bytes())),
            _ => None,
        };
        Ok(Self {
            name: name.to_string(),
            vtype,
            length,
            ext,
        })
    }
}

/// Descriptors for every column of `table`.
pub fn describe_columns(table: &Table) -> Vec<ColumnDesc> {
    table
        .columns()
        .iter()
        .map(|c| ColumnDesc {
            name: c.name.clone(),
            vtype: c.vtype,
            length: c.length,
            ext: c.ext.clone(),
        })
        .collect()
}

/// Rebuilds a table schema from descriptors.
pub fn table_from_columns(name: &str, columns: &[ColumnDesc]) -> Result<Table, ProtocolError> {
    let mut table = Table::new(name);
    for desc in columns {
        let col = table.add_column(desc.name.clone(), desc.vtype, desc.length)?;
        if let Some(ext) = &desc.ext {
            table.add_column_extension(col, ext.clone())?;
        }
    }
    Ok(table)
}

fn encode_columns(columns: &[ColumnDesc], out: &mut impl BufMut) {
    msgpack::write_array_len(out, columns.len() as u32);
    for c in columns {
        c.encode(out);
    }
}

fn decode_columns(value: &MsgValue) -> Result<Vec<ColumnDesc>, ProtocolError> {
    value
        .as_array()
        .ok_or_else(|| ProtocolError::malformed("columns", "not an array"))?
        .iter()
        .map(ColumnDesc::from_msg)
        .collect()
}

// ============================================================================
// Pages and row records
// ============================================================================

/// Array header preceding a page of rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageHeader {
    Rows(u32),
    End,
}

pub fn encode_page_header(out: &mut impl BufMut, header: PageHeader) {
    match header {
        PageHeader::Rows(n) => msgpack::write_array_len(out, n),
        PageHeader::End => msgpack::write_array_len(out, END_OF_STREAM),
    }
}

/// Decodes a page header; `Ok(None)` if more data is needed.
pub fn decode_page_header(buf: &[u8]) -> Result<Option<(PageHeader, usize)>, ProtocolError> {
    let mut r = Reader::new(buf);
    Ok(need_more(r.read_array_len())?.map(|n| {
        let header = if n == END_OF_STREAM {
            PageHeader::End
        } else {
            PageHeader::Rows(n)
        };
        (header, r.position())
    }))
}

pub fn encode_row_record(out: &mut impl BufMut, row: &[u8]) {
    msgpack::write_ext(out, VT_ROW, row);
}

/// Decodes one row record, returning the row's byte range within `buf` and
/// the bytes consumed; `Ok(None)` if more data is needed.
pub fn decode_row_record(buf: &[u8]) -> Result<Option<(Range<usize>, usize)>, ProtocolError> {
    let mut r = Reader::new(buf);
    let Some((tag, len)) = need_more(r.read_ext_header())? else {
        return Ok(None);
    };
    if tag != VT_ROW {
        return Err(ProtocolError::UnexpectedExtension {
            expected: VT_ROW,
            found: tag,
        });
    }
    let start = r.position();
    if r.remaining() < len {
        return Ok(None);
    }
    Ok(Some((start..start + len, start + len)))
}

// ============================================================================
// Message head
// ============================================================================

/// The property map of a message, with `Columns` parsed out.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MessageHead {
    pub props: Props,
    pub columns: Vec<ColumnDesc>,
}

/// Head of a server response.
pub type ResponseHead = MessageHead;

impl MessageHead {
    /// Decodes the property map and its `nil` terminator.
    ///
    /// Returns `Ok(Some((head, consumed)))` once the whole head is present,
    /// `Ok(None)` if more data is needed.
    pub fn decode(buf: &[u8]) -> Result<Option<(Self, usize)>, ProtocolError> {
        need_more(Self::decode_complete(buf))
    }

    fn decode_complete(buf: &[u8]) -> Result<(Self, usize), ProtocolError> {
        let mut r = Reader::new(buf);
        let entries = r.read_map_len()?;
        let mut head = MessageHead::default();
        for _ in 0..entries {
            let k = r.read_str()?.to_string();
            let v = r.read_value()?;
            if k == key::COLUMNS {
                head.columns = decode_columns(&v)?;
            } else {
                head.props.insert_raw(k, v);
            }
        }
        match r.peek_u8()? {
            marker::NIL => r.read_nil()?,
            found => {
                return Err(ProtocolError::UnexpectedMarker {
                    expected: "nil",
                    found,
                })
            }
        }
        Ok((head, r.position()))
    }

    /// Server error number; 0 means success.
    pub fn errno(&self) -> i32 {
        self.props.get_int(key::ERRNO).unwrap_or(0) as i32
    }

    pub fn error(&self) -> &str {
        self.props.get_str(key::ERROR).unwrap_or_default()
    }

    pub fn reqid(&self) -> Option<i64> {
        self.props.get_int(key::REQID)
    }

    pub fn action(&self) -> Option<Action> {
        self.props.get_str(key::ACTION).and_then(|a| a.parse().ok())
    }

    pub fn table_name(&self) -> &str {
        self.props.get_str(key::TABLE).unwrap_or_default()
    }

    /// Rebuilds the result schema.
    pub fn table(&self) -> Result<Table, ProtocolError> {
        table_from_columns(self.table_name(), &self.columns)
    }

    pub fn indexes(&self) -> Result<Option<Indexes>, ProtocolError> {
        let Some(value) = self.props.get(key::INDEXES) else {
            return Ok(None);
        };
        let keys = IndexKeys::from_msg(value)?;
        let key = self.props.get_str(key::KEY).unwrap_or_default();
        Ok(Some(Indexes::new(key, keys)))
    }

    pub fn filters(&self) -> Result<Vec<RawFilter>, ProtocolError> {
        match self.props.get(key::FILTERS) {
            Some(value) => Filters::decode(value),
            None => Ok(Vec::new()),
        }
    }
}

// ============================================================================
// Request
// ============================================================================

/// A request ready to be encoded.
#[derive(Debug, Clone)]
pub struct Request {
    action: Action,
    props: Props,
    columns: Vec<ColumnDesc>,
    filters: Option<Filters>,
    indexes: Option<Indexes>,
    table: Option<Table>,
}

impl Request {
    pub fn new(action: Action) -> Self {
        let mut props = Props::new();
        props
            .set(key::SERVICE, SERVICE_NAME)
            .set(key::ACTION, action.as_str());
        Self {
            action,
            props,
            columns: Vec::new(),
            filters: None,
            indexes: None,
            table: None,
        }
    }

    pub fn exec_sql(sql: &str) -> Self {
        let mut req = Self::new(Action::ExecSql);
        req.props.set(key::SQL, sql);
        req
    }

    /// Select from `table`; all columns unless narrowed with
    /// [`Request::with_columns`].
    pub fn select(table: &str) -> Self {
        Self::new(Action::Select)
            .with_prop(key::TABLE, table)
            .with_columns(&["*"])
    }

    /// Insert, update, replace or delete the rows of `table`.
    pub fn write(action: Action, table: Table) -> Self {
        let mut req = Self::new(action).with_prop(key::TABLE, table.name().to_string());
        req.columns = describe_columns(&table);
        req.table = Some(table);
        req
    }

    pub fn with_columns(mut self, names: &[&str]) -> Self {
        self.columns = names.iter().map(|n| ColumnDesc::named(*n)).collect();
        self
    }

    pub fn with_filters(mut self, filters: Filters) -> Self {
        self.filters = Some(filters);
        self
    }

    pub fn with_indexes(mut self, indexes: Indexes) -> Self {
        self.indexes = Some(indexes);
        self
    }

    pub fn with_limit(self, limit: i64) -> Self {
        self.with_prop(key::LIMIT, limit)
    }

    pub fn with_order_by(self, order_by: &str) -> Self {
        self.with_prop(key::ORDER_BY, order_by)
    }

    pub fn with_async(self, enabled: bool) -> Self {
        self.with_prop(key::ASYNC, enabled as i64)
    }

    pub fn with_snapshot(self, enabled: bool) -> Self {
        self.with_prop(key::SNAPSHOT, enabled as i64)
    }

    pub fn with_subscribe(self, enabled: bool) -> Self {
        self.with_prop(key::SUBSCRIBE, enabled as i64)
    }

    pub fn with_prop(mut self, key: &str, value: impl Into<MsgValue>) -> Self {
        self.props.set(key, value);
        self
    }

    pub fn action(&self) -> Action {
        self.action
    }

    pub fn props(&self) -> &Props {
        &self.props
    }

    pub fn props_mut(&mut self) -> &mut Props {
        &mut self.props
    }

    pub fn columns(&self) -> &[ColumnDesc] {
        &self.columns
    }

    pub fn filters(&self) -> Option<&Filters> {
        self.filters.as_ref()
    }

    pub fn indexes(&self) -> Option<&Indexes> {
        self.indexes.as_ref()
    }

    pub fn set_indexes(&mut self, indexes: Option<Indexes>) {
        self.indexes = indexes;
    }

    pub fn table(&self) -> Option<&Table> {
        self.table.as_ref()
    }

    pub fn reqid(&self) -> Option<i64> {
        self.props.get_int(key::REQID)
    }

    pub fn set_reqid(&mut self, id: i64) {
        self.props.set(key::REQID, id);
    }

    /// Writes the full message body.
    pub fn encode(&self, out: &mut impl BufMut) -> Result<(), ProtocolError> {
        let mut entries = self.props.len();
        let columns = !self.columns.is_empty() && !self.props.contains(key::COLUMNS);
        entries += columns as usize;
        entries += self.filters.is_some() as usize;
        entries += 2 * self.indexes.is_some() as usize;

        msgpack::write_map_len(out, entries as u32);
        self.props.encode_entries(out);
        if columns {
            msgpack::write_str(out, key::COLUMNS);
            encode_columns(&self.columns, out);
        }
        if let Some(filters) = &self.filters {
            msgpack::write_str(out, key::FILTERS);
            filters.encode(out);
        }
        if let Some(indexes) = &self.indexes {
            msgpack::write_str(out, key::KEY);
            msgpack::write_str(out, &indexes.key);
            msgpack::write_str(out, key::INDEXES);
            indexes.keys.encode(out);
        }
        msgpack::write_nil(out);

        if let Some(table) = &self.table {
            if table.rows().len() > u32::MAX as usize - 1 {
                return Err(ProtocolError::malformed("request", "too many rows"));
            }
            if !table.rows().is_empty() {
                encode_page_header(out, PageHeader::Rows(table.rows().len() as u32));
                for row in table.rows() {
                    encode_row_record(out, row);
                }
            }
        }
        Ok(())
    }

    /// Decodes a complete request body, as a server sees it.
    pub fn decode(buf: &[u8]) -> Result<DecodedRequest, ProtocolError> {
        let (head, mut pos) = MessageHead::decode_complete(buf)?;
        let mut rows = Vec::new();
        if pos < buf.len() {
            let (header, n) = decode_page_header(&buf[pos..])?
                .ok_or(ProtocolError::Incomplete { needed: 1 })?;
            pos += n;
            if let PageHeader::Rows(count) = header {
                for _ in 0..count {
                    let (range, n) = decode_row_record(&buf[pos..])?
                        .ok_or(ProtocolError::Incomplete { needed: 1 })?;
                    rows.push(Bytes::copy_from_slice(&buf[pos + range.start..pos + range.end]));
                    pos += n;
                }
            }
        }
        Ok(DecodedRequest { head, rows })
    }
}

/// A request parsed back from the wire.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedRequest {
    pub head: MessageHead,
    pub rows: Vec<Bytes>,
}

// ============================================================================
// Response
// ============================================================================

/// A response ready to be encoded, as a server would produce it.
#[derive(Debug, Clone)]
pub struct Response {
    props: Props,
    table: Option<Table>,
    page_rows: usize,
}

impl Default for Response {
    fn default() -> Self {
        Self::ok()
    }
}

impl Response {
    pub fn ok() -> Self {
        let mut props = Props::new();
        props.set(key::ERRNO, 0i64);
        Self {
            props,
            table: None,
            page_rows: DEFAULT_PAGE_ROWS,
        }
    }

    pub fn error(errno: i32, message: &str) -> Self {
        let mut resp = Self::ok();
        resp.props
            .set(key::ERRNO, errno as i64)
            .set(key::ERROR, message);
        resp
    }

    /// Attaches a result set; its rows are streamed in pages.
    pub fn with_table(mut self, table: Table) -> Self {
        self.props.set(key::TABLE, table.name().to_string());
        self.table = Some(table);
        self
    }

    pub fn with_prop(mut self, key: &str, value: impl Into<MsgValue>) -> Self {
        self.props.set(key, value);
        self
    }

    pub fn with_page_rows(mut self, rows: usize) -> Self {
        self.page_rows = rows.max(1);
        self
    }

    pub fn encode(&self, out: &mut impl BufMut) {
        let columns = self.table.as_ref().map(describe_columns).unwrap_or_default();
        let with_columns = !columns.is_empty();
        msgpack::write_map_len(out, (self.props.len() + with_columns as usize) as u32);
        self.props.encode_entries(out);
        if with_columns {
            msgpack::write_str(out, key::COLUMNS);
            encode_columns(&columns, out);
        }
        msgpack::write_nil(out);

        if let Some(table) = &self.table {
            for page in table.rows().chunks(self.page_rows) {
                encode_page_header(out, PageHeader::Rows(page.len() as u32));
                for row in page {
                    encode_row_record(out, row);
                }
            }
            encode_page_header(out, PageHeader::End);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::FilterOp;
    use crate::row::Row;

    fn realtime_rows() -> Table {
        let mut t = Table::new("Realtime");
        t.add_column("ID", VarType::Int32, 0).unwrap();
        t.add_column("AV", VarType::Object, 0).unwrap();
        for i in 0..3 {
            t.set_i32(0, 1024 + i).set_object(1, i as f64 * 1.5);
            t.bind_row().unwrap();
        }
        t
    }

    #[test]
    fn test_exec_sql_layout() {
        let mut req = Request::exec_sql("select * from Realtime limit 10");
        req.set_reqid(7);
        let mut buf = Vec::new();
        req.encode(&mut buf).unwrap();
        assert_eq!(*buf.last().unwrap(), marker::NIL);

        let decoded = Request::decode(&buf).unwrap();
        assert_eq!(decoded.head.props.get_str(key::SERVICE), Some("openplant"));
        assert_eq!(decoded.head.action(), Some(Action::ExecSql));
        assert_eq!(
            decoded.head.props.get_str(key::SQL),
            Some("select * from Realtime limit 10")
        );
        assert_eq!(decoded.head.reqid(), Some(7));
        assert!(decoded.rows.is_empty());
    }

    #[test]
    fn test_select_with_filters_and_indexes() {
        let req = Request::select("Realtime")
            .with_columns(&["ID", "AV"])
            .with_indexes(Indexes::new("ID", vec![1024, 1025]))
            .with_filters(Filters::new().and("DS", FilterOp::Eq, 0))
            .with_limit(5)
            .with_async(true)
            .with_snapshot(true);
        let mut buf = Vec::new();
        req.encode(&mut buf).unwrap();

        let head = Request::decode(&buf).unwrap().head;
        assert_eq!(head.table_name(), "Realtime");
        assert_eq!(
            head.columns,
            vec![ColumnDesc::named("ID"), ColumnDesc::named("AV")]
        );
        assert_eq!(
            head.indexes().unwrap(),
            Some(Indexes::new("ID", vec![1024, 1025]))
        );
        assert_eq!(head.filters().unwrap()[0].right, "0");
        assert_eq!(head.props.get_int(key::LIMIT), Some(5));
        assert_eq!(head.props.get_int(key::ASYNC), Some(1));
        assert_eq!(head.props.get_int(key::SNAPSHOT), Some(1));
    }

    #[test]
    fn test_write_request_rows() {
        let table = realtime_rows();
        let req = Request::write(Action::Insert, table.clone());
        let mut buf = Vec::new();
        req.encode(&mut buf).unwrap();

        let decoded = Request::decode(&buf).unwrap();
        assert_eq!(decoded.head.action(), Some(Action::Insert));
        assert_eq!(decoded.rows, table.rows().to_vec());
        let schema = decoded.head.table().unwrap();
        assert_eq!(schema.fingerprint(), table.fingerprint());
        assert_eq!(schema.columns()[1].vtype, VarType::Object);
    }

    #[test]
    fn test_response_stream() {
        let table = realtime_rows();
        let resp = Response::ok().with_table(table.clone()).with_page_rows(2);
        let mut buf = Vec::new();
        resp.encode(&mut buf);

        let (head, mut pos) = MessageHead::decode(&buf).unwrap().unwrap();
        assert_eq!(head.errno(), 0);
        let schema = head.table().unwrap();
        assert_eq!(schema.name(), "Realtime");

        let mut rows = Vec::new();
        loop {
            let (page, n) = decode_page_header(&buf[pos..]).unwrap().unwrap();
            pos += n;
            let PageHeader::Rows(count) = page else { break };
            for _ in 0..count {
                let (range, n) = decode_row_record(&buf[pos..]).unwrap().unwrap();
                let data = Bytes::copy_from_slice(&buf[pos + range.start..pos + range.end]);
                rows.push(Row::parse(&schema, data).unwrap());
                pos += n;
            }
        }
        assert_eq!(pos, buf.len());
        assert_eq!(rows.len(), 3);
        assert_eq!(schema.view(&rows[2]).unwrap().get_i32(0).unwrap(), 1026);
        assert_eq!(schema.view(&rows[1]).unwrap().get_f64(1).unwrap(), 1.5);
    }

    #[test]
    fn test_error_response() {
        let mut buf = Vec::new();
        Response::error(-105, "table not found").encode(&mut buf);
        let (head, n) = MessageHead::decode(&buf).unwrap().unwrap();
        assert_eq!(n, buf.len());
        assert_eq!(head.errno(), -105);
        assert_eq!(head.error(), "table not found");
    }

    #[test]
    fn test_incremental_head() {
        let mut buf = Vec::new();
        Response::ok().with_table(realtime_rows()).encode(&mut buf);
        let (_, full) = MessageHead::decode(&buf).unwrap().unwrap();
        for cut in 0..full {
            assert!(MessageHead::decode(&buf[..cut]).unwrap().is_none(), "cut {cut}");
        }
    }

    #[test]
    fn test_incremental_row_record() {
        let mut buf = Vec::new();
        encode_row_record(&mut buf, &[1, 2, 3, 4, 5]);
        assert!(decode_row_record(&buf[..buf.len() - 1]).unwrap().is_none());
        let (range, n) = decode_row_record(&buf).unwrap().unwrap();
        assert_eq!(&buf[range], &[1, 2, 3, 4, 5]);
        assert_eq!(n, buf.len());
    }

    #[test]
    fn test_head_requires_nil() {
        let mut buf = Vec::new();
        msgpack::write_map_len(&mut buf, 0);
        msgpack::write_int(&mut buf, 1);
        assert!(matches!(
            MessageHead::decode(&buf),
            Err(ProtocolError::UnexpectedMarker { expected: "nil", .. })
        ));
    }

    #[test]
    fn test_wrong_record_tag() {
        let mut buf = Vec::new();
        msgpack::write_ext(&mut buf, 5, &[0]);
        assert!(matches!(
            decode_row_record(&buf),
            Err(ProtocolError::UnexpectedExtension { expected: 32, found: 5 })
        ));
    }
}
