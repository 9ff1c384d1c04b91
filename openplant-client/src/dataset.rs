//! Streaming result cursor.

use crate::connection::Connection;
use crate::error::ClientError;
use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Utc};
use openplant_protocol::message::{decode_page_header, decode_row_record, PageHeader};
use openplant_protocol::{
    Column, MessageHead, OpMap, OpSlice, OpStructure, ProtocolError, Record, ResponseHead, Row, RowView, Table, Value,
};
use serde::Serialize;

/// A fully materialised result.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ResultSet {
    #[serde(skip)]
    pub columns: Vec<Column>,
    pub rows: Vec<Record>,
}

impl ResultSet {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }
}

/// Decodes a complete response message into its head and rows.
pub fn decode_response(payload: Bytes) -> Result<(ResponseHead, ResultSet), ProtocolError> {
    let incomplete = || ProtocolError::Incomplete { needed: 1 };
    let (head, mut pos) = MessageHead::decode(&payload)?.ok_or_else(incomplete)?;
    let table = head.table()?;
    let mut rows = Vec::new();
    while pos < payload.len() {
        let (page, n) = decode_page_header(&payload[pos..])?.ok_or_else(incomplete)?;
        pos += n;
        let PageHeader::Rows(count) = page else { break };
        for _ in 0..count {
            let (range, n) = decode_row_record(&payload[pos..])?.ok_or_else(incomplete)?;
            let row = Row::parse(&table, payload.slice(pos + range.start..pos + range.end))?;
            rows.push(table.view(&row)?.to_record()?);
            pos += n;
        }
    }
    let result = ResultSet {
        columns: table.columns().to_vec(),
        rows,
    };
    Ok((head, result))
}

macro_rules! typed_getters {
    ($($(#[$doc:meta])* $name:ident -> $ty:ty),* $(,)?) => {
        $(
            $(#[$doc])*
            pub fn $name(&self, col: usize) -> Result<$ty, ClientError> {
                Ok(self.view()?.$name(col)?)
            }
        )*
    };
}

/// Cursor over the rows of a response.
///
/// Rows are decoded page by page as frames arrive. Dropping the cursor early
/// is allowed: the connection discards the unread rest before its next
/// request.
pub struct DataSet<'c> {
    conn: &'c mut Connection,
    head: ResponseHead,
    table: Table,
    buf: BytesMut,
    eof: bool,
    page_left: u32,
    done: bool,
    row: Option<Row>,
    rows_read: usize,
}

impl<'c> DataSet<'c> {
    pub(crate) fn new(
        conn: &'c mut Connection,
        head: ResponseHead,
        buf: BytesMut,
        eof: bool,
    ) -> Result<Self, ClientError> {
        let table = head.table()?;
        Ok(Self {
            conn,
            head,
            table,
            buf,
            eof,
            page_left: 0,
            done: false,
            row: None,
            rows_read: 0,
        })
    }

    pub fn head(&self) -> &ResponseHead {
        &self.head
    }

    /// Schema of the result.
    pub fn table(&self) -> &Table {
        &self.table
    }

    pub fn columns(&self) -> &[Column] {
        self.table.columns()
    }

    pub fn rows_read(&self) -> usize {
        self.rows_read
    }

    async fn fill(&mut self) -> Result<(), ClientError> {
        if self.eof {
            return Err(ProtocolError::Incomplete { needed: 1 }.into());
        }
        let (payload, eof) = self.conn.read_frame().await?;
        self.buf.extend_from_slice(&payload);
        self.eof = eof;
        Ok(())
    }

    /// Advances to the next row. Returns `false` once the stream has ended.
    pub async fn next(&mut self) -> Result<bool, ClientError> {
        self.row = None;
        loop {
            if self.done {
                return Ok(false);
            }
            if self.page_left > 0 {
                match decode_row_record(&self.buf)? {
                    Some((range, consumed)) => {
                        let data = self.buf.split_to(consumed).freeze().slice(range);
                        self.row = Some(Row::parse(&self.table, data)?);
                        self.page_left -= 1;
                        self.rows_read += 1;
                        return Ok(true);
                    }
                    None => self.fill().await?,
                }
                continue;
            }
            if self.buf.is_empty() && self.eof {
                // a response without a row stream
                self.done = true;
                continue;
            }
            match decode_page_header(&self.buf)? {
                Some((PageHeader::End, consumed)) => {
                    let _ = self.buf.split_to(consumed);
                    self.done = true;
                }
                Some((PageHeader::Rows(n), consumed)) => {
                    let _ = self.buf.split_to(consumed);
                    self.page_left = n;
                }
                None => self.fill().await?,
            }
        }
    }

    /// The current row, if positioned on one.
    pub fn row(&self) -> Option<&Row> {
        self.row.as_ref()
    }

    fn view(&self) -> Result<RowView<'_>, ClientError> {
        let row = self
            .row
            .as_ref()
            .ok_or_else(|| ClientError::InvalidArgument("no current row".into()))?;
        Ok(self.table.view(row)?)
    }

    pub fn get_value(&self, col: usize) -> Result<Value, ClientError> {
        Ok(self.view()?.get_value(col)?)
    }

    pub fn get_by_name(&self, name: &str) -> Result<Value, ClientError> {
        Ok(self.view()?.get_by_name(name)?)
    }

    pub fn is_set(&self, col: usize) -> Result<bool, ClientError> {
        Ok(self.view()?.is_set(col)?)
    }

    typed_getters! {
        get_bool -> bool,
        get_i8 -> i8,
        get_i16 -> i16,
        get_i32 -> i32,
        get_i64 -> i64,
        get_f32 -> f32,
        get_f64 -> f64,
        get_datetime -> DateTime<Utc>,
        get_string -> String,
        get_bytes -> Bytes,
        get_slice -> Option<OpSlice>,
        get_map -> Option<OpMap>,
        get_structure -> Option<OpStructure>,
    }

    /// The current row keyed by column name.
    pub fn record(&self) -> Result<Record, ClientError> {
        Ok(self.view()?.to_record()?)
    }

    /// Reads all remaining rows.
    pub async fn collect(mut self) -> Result<ResultSet, ClientError> {
        let mut rows = Vec::new();
        while self.next().await? {
            rows.push(self.record()?);
        }
        let columns = self.table.columns().to_vec();
        self.close().await?;
        Ok(ResultSet { columns, rows })
    }

    /// Discards any unread rows, leaving the connection ready for reuse.
    pub async fn close(mut self) -> Result<(), ClientError> {
        while !self.eof {
            let (_, eof) = self.conn.read_frame().await?;
            self.eof = eof;
        }
        Ok(())
    }
}
