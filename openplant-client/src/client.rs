//! High-level client API.

use crate::config::ClientConfig;
use crate::connection::{Connection, ConnectionConfig};
use crate::dataset::ResultSet;
use crate::error::ClientError;
use crate::subscription::{SubscribeOptions, Subscription};
use chrono::{DateTime, Utc};
use openplant_protocol::{
    Action, FilterOp, Filters, IndexKeys, Indexes, ProtocolError, Record, Request, Table, Value, VarType,
};
use serde::Serialize;
use std::fmt;
use std::str::FromStr;
use tokio::sync::{Mutex, MutexGuard};

/// Realtime value table.
pub const REALTIME_TABLE: &str = "Realtime";
/// Archive value table.
pub const ARCHIVE_TABLE: &str = "Archive";
/// Statistics table.
pub const STAT_TABLE: &str = "Stat";

/// One sample of a point.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RealValue {
    pub id: i32,
    pub time: DateTime<Utc>,
    /// Quality/status word.
    pub status: i16,
    pub value: Value,
}

impl RealValue {
    pub fn new(id: i32, time: DateTime<Utc>, value: impl Into<Value>) -> Self {
        Self {
            id,
            time,
            status: 0,
            value: value.into(),
        }
    }

    pub fn with_status(mut self, status: i16) -> Self {
        self.status = status;
        self
    }

    fn from_record(rec: &Record) -> Result<Self, ClientError> {
        Ok(Self {
            id: field(rec, "ID")?.to_i32()?,
            time: field(rec, "TM")?.to_datetime()?,
            status: rec.get("DS").map(Value::to_i16).transpose()?.unwrap_or_default(),
            value: rec.get("AV").cloned().unwrap_or_default(),
        })
    }
}

/// Aggregates of one point over one interval.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatValue {
    pub id: i32,
    pub time: DateTime<Utc>,
    pub status: i16,
    pub flow: f64,
    pub max: f64,
    pub min: f64,
    pub max_time: Option<DateTime<Utc>>,
    pub min_time: Option<DateTime<Utc>>,
    pub avg: f64,
    pub mean: f64,
    pub stdev: f64,
    pub sum: f64,
}

impl StatValue {
    fn from_record(rec: &Record) -> Result<Self, ClientError> {
        let num = |name: &str| -> Result<f64, ClientError> {
            Ok(rec.get(name).map(Value::to_f64).transpose()?.unwrap_or_default())
        };
        let time = |name: &str| -> Result<Option<DateTime<Utc>>, ClientError> {
            match rec.get(name) {
                None | Some(Value::Null) => Ok(None),
                Some(v) => Ok(Some(v.to_datetime()?)),
            }
        };
        Ok(Self {
            id: field(rec, "ID")?.to_i32()?,
            time: field(rec, "TM")?.to_datetime()?,
            status: rec.get("DS").map(Value::to_i16).transpose()?.unwrap_or_default(),
            flow: num("FLOW")?,
            max: num("MAX")?,
            min: num("MIN")?,
            max_time: time("MAXTIME")?,
            min_time: time("MINTIME")?,
            avg: num("AVG")?,
            mean: num("MEAN")?,
            stdev: num("STDEV")?,
            sum: num("SUM")?,
        })
    }
}

fn field<'a>(rec: &'a Record, name: &str) -> Result<&'a Value, ClientError> {
    rec.get(name)
        .ok_or_else(|| ProtocolError::UnknownColumn(name.to_string()).into())
}

/// Sampling applied by the server to archive reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ArchiveMode {
    /// Stored samples as-is.
    #[default]
    Raw,
    Arch,
    /// Interpolated at fixed steps.
    Span,
    Plot,
    Flow,
    Max,
    Min,
    Avg,
    Mean,
    Stdev,
    Sum,
}

impl ArchiveMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ArchiveMode::Raw => "raw",
            ArchiveMode::Arch => "arch",
            ArchiveMode::Span => "span",
            ArchiveMode::Plot => "plot",
            ArchiveMode::Flow => "flow",
            ArchiveMode::Max => "max",
            ArchiveMode::Min => "min",
            ArchiveMode::Avg => "avg",
            ArchiveMode::Mean => "mean",
            ArchiveMode::Stdev => "stdev",
            ArchiveMode::Sum => "sum",
        }
    }
}

impl fmt::Display for ArchiveMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ArchiveMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.to_ascii_lowercase().as_str() {
            "raw" => ArchiveMode::Raw,
            "arch" => ArchiveMode::Arch,
            "span" => ArchiveMode::Span,
            "plot" => ArchiveMode::Plot,
            "flow" => ArchiveMode::Flow,
            "max" => ArchiveMode::Max,
            "min" => ArchiveMode::Min,
            "avg" => ArchiveMode::Avg,
            "mean" => ArchiveMode::Mean,
            "stdev" => ArchiveMode::Stdev,
            "sum" => ArchiveMode::Sum,
            other => return Err(format!("unknown archive mode: {other}")),
        })
    }
}

/// Parameters of a table select.
#[derive(Debug, Clone, Default)]
pub struct SelectOptions {
    pub table: String,
    /// Empty selects all columns.
    pub columns: Vec<String>,
    pub indexes: Option<Indexes>,
    pub filters: Option<Filters>,
    pub limit: Option<i64>,
    pub order_by: Option<String>,
}

impl SelectOptions {
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            ..Default::default()
        }
    }

    pub fn columns(mut self, columns: &[&str]) -> Self {
        self.columns = columns.iter().map(|c| c.to_string()).collect();
        self
    }

    pub fn indexes(mut self, key: &str, keys: impl Into<IndexKeys>) -> Self {
        self.indexes = Some(Indexes::new(key, keys));
        self
    }

    pub fn filters(mut self, filters: Filters) -> Self {
        self.filters = Some(filters);
        self
    }

    pub fn limit(mut self, limit: i64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn order_by(mut self, order_by: impl Into<String>) -> Self {
        self.order_by = Some(order_by.into());
        self
    }

    fn into_request(self) -> Request {
        let mut req = Request::select(&self.table);
        if !self.columns.is_empty() {
            let names: Vec<&str> = self.columns.iter().map(String::as_str).collect();
            req = req.with_columns(&names);
        }
        if let Some(indexes) = self.indexes {
            req = req.with_indexes(indexes);
        }
        if let Some(filters) = self.filters {
            req = req.with_filters(filters);
        }
        if let Some(limit) = self.limit {
            req = req.with_limit(limit);
        }
        if let Some(order_by) = &self.order_by {
            req = req.with_order_by(order_by);
        }
        req
    }
}

/// Schema shared by the realtime and archive tables.
fn value_table(name: &str) -> Result<Table, ProtocolError> {
    let mut table = Table::new(name);
    table.add_column("ID", VarType::Int32, 0)?;
    table.add_column("TM", VarType::DateTime, 0)?;
    table.add_column("DS", VarType::Int16, 0)?;
    table.add_column("AV", VarType::Object, 0)?;
    Ok(table)
}

fn value_rows(name: &str, values: &[RealValue]) -> Result<Table, ClientError> {
    let mut table = value_table(name)?;
    for v in values {
        table
            .set_i32(0, v.id)
            .set_datetime(1, v.time)
            .set_i16(2, v.status)
            .set_object(3, v.value.clone())
            .bind_row()?;
    }
    Ok(table)
}

fn history_filters(ids: &[i32], begin: DateTime<Utc>, end: DateTime<Utc>) -> Filters {
    Filters::new()
        .and("ID", FilterOp::In, ids.to_vec())
        .and("TM", FilterOp::Ge, begin)
        .and("TM", FilterOp::Le, end)
}

/// High-level client for OpenPlant.
///
/// Requests are serialized over one connection.
pub struct Client {
    conn: Mutex<Connection>,
    subscribe: SubscribeOptions,
}

impl Client {
    /// Connects and logs in.
    pub async fn connect(config: ConnectionConfig) -> Result<Self, ClientError> {
        let conn = Connection::connect(config).await?;
        Ok(Self {
            conn: Mutex::new(conn),
            subscribe: SubscribeOptions::default(),
        })
    }

    /// Connects using a loaded client configuration.
    pub async fn from_config(config: &ClientConfig) -> Result<Self, ClientError> {
        config.validate()?;
        let mut client = Self::connect(config.connection_config()).await?;
        client.subscribe = config.subscribe_options();
        Ok(client)
    }

    /// Exclusive access to the connection, for streaming reads.
    pub async fn connection(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().await
    }

    /// Closes the connection.
    pub async fn close(&self) -> Result<(), ClientError> {
        self.conn.lock().await.close().await
    }

    // =========================================================================
    // Helper methods
    // =========================================================================

    async fn fetch(&self, request: Request) -> Result<ResultSet, ClientError> {
        let mut conn = self.conn.lock().await;
        conn.query(request).await?.collect().await
    }

    async fn write(&self, action: Action, table: Table) -> Result<(), ClientError> {
        if table.rows().is_empty() {
            return Ok(());
        }
        let rows = table.rows().len();
        self.conn
            .lock()
            .await
            .execute(Request::write(action, table))
            .await?;
        tracing::debug!(%action, rows, "write acknowledged");
        Ok(())
    }

    // =========================================================================
    // System operations
    // =========================================================================

    /// Checks the connection with a heartbeat.
    pub async fn alive(&self) -> Result<(), ClientError> {
        self.conn.lock().await.alive().await
    }

    /// Re-dials a broken connection.
    pub async fn reconnect(&self) -> Result<(), ClientError> {
        self.conn.lock().await.reconnect().await
    }

    // =========================================================================
    // Table operations
    // =========================================================================

    /// Runs SQL on the server.
    pub async fn exec_sql(&self, sql: &str) -> Result<ResultSet, ClientError> {
        self.fetch(Request::exec_sql(sql)).await
    }

    pub async fn select(&self, options: SelectOptions) -> Result<ResultSet, ClientError> {
        self.fetch(options.into_request()).await
    }

    pub async fn insert(&self, table: Table) -> Result<(), ClientError> {
        self.write(Action::Insert, table).await
    }

    pub async fn update(&self, table: Table) -> Result<(), ClientError> {
        self.write(Action::Update, table).await
    }

    pub async fn replace(&self, table: Table) -> Result<(), ClientError> {
        self.write(Action::Replace, table).await
    }

    /// Deletes the rows matching the key columns of `table`.
    pub async fn delete(&self, table: Table) -> Result<(), ClientError> {
        self.write(Action::Delete, table).await
    }

    // =========================================================================
    // Point values
    // =========================================================================

    pub async fn write_realtime(&self, values: &[RealValue]) -> Result<(), ClientError> {
        self.insert(value_rows(REALTIME_TABLE, values)?).await
    }

    /// Current values of the given points, in server order.
    pub async fn read_realtime(&self, ids: &[i32]) -> Result<Vec<RealValue>, ClientError> {
        let options = SelectOptions::new(REALTIME_TABLE)
            .columns(&["ID", "TM", "DS", "AV"])
            .indexes("ID", ids.to_vec());
        let rs = self.select(options).await?;
        rs.rows.iter().map(RealValue::from_record).collect()
    }

    pub async fn write_archive(&self, values: &[RealValue]) -> Result<(), ClientError> {
        self.insert(value_rows(ARCHIVE_TABLE, values)?).await
    }

    /// Historical values in `[begin, end]`. `interval` is in seconds and only
    /// matters for the sampled modes.
    pub async fn read_archive(
        &self,
        ids: &[i32],
        begin: DateTime<Utc>,
        end: DateTime<Utc>,
        mode: ArchiveMode,
        interval: i64,
    ) -> Result<Vec<RealValue>, ClientError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let filters = history_filters(ids, begin, end)
            .and("MODE", FilterOp::Eq, mode.as_str())
            .and("INTERVAL", FilterOp::Eq, interval);
        let options = SelectOptions::new(ARCHIVE_TABLE)
            .columns(&["ID", "TM", "DS", "AV"])
            .filters(filters);
        let rs = self.select(options).await?;
        rs.rows.iter().map(RealValue::from_record).collect()
    }

    /// Aggregates per `interval` seconds over `[begin, end]`.
    pub async fn read_stat(
        &self,
        ids: &[i32],
        begin: DateTime<Utc>,
        end: DateTime<Utc>,
        interval: i64,
    ) -> Result<Vec<StatValue>, ClientError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let filters = history_filters(ids, begin, end).and("INTERVAL", FilterOp::Eq, interval);
        let rs = self.select(SelectOptions::new(STAT_TABLE).filters(filters)).await?;
        rs.rows.iter().map(StatValue::from_record).collect()
    }

    // =========================================================================
    // Subscriptions
    // =========================================================================

    /// Subscribes to `table` rows keyed by `key` on a dedicated connection.
    pub async fn subscribe(
        &self,
        table: &str,
        key: &str,
        keys: impl Into<IndexKeys>,
    ) -> Result<Subscription, ClientError> {
        self.subscribe_with(table, key, keys, self.subscribe.clone()).await
    }

    pub async fn subscribe_with(
        &self,
        table: &str,
        key: &str,
        keys: impl Into<IndexKeys>,
        options: SubscribeOptions,
    ) -> Result<Subscription, ClientError> {
        let keys = keys.into();
        let conn = self.conn.lock().await;
        conn.subscribe(table, key, keys, options).await
    }

    /// Subscribes to realtime values of the given points.
    pub async fn subscribe_realtime(&self, ids: &[i32]) -> Result<Subscription, ClientError> {
        self.subscribe(REALTIME_TABLE, "ID", ids.to_vec()).await
    }
}
