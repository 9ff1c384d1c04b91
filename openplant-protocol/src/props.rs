//! Request and response property bags.

use crate::error::ProtocolError;
use crate::msgpack::{self, MsgValue};
use bytes::BufMut;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Recognized property keys.
pub mod key {
    pub const REQID: &str = "Reqid";
    pub const SERVICE: &str = "Service";
    pub const TABLE: &str = "Table";
    pub const ACTION: &str = "Action";
    pub const SUBJECT: &str = "Subject";
    pub const OPTION: &str = "Option";
    pub const ORDER_BY: &str = "OrderBy";
    pub const LIMIT: &str = "Limit";
    pub const ASYNC: &str = "Async";
    pub const COLUMNS: &str = "Columns";
    pub const KEY: &str = "Key";
    pub const INDEXES: &str = "Indexes";
    pub const FILTERS: &str = "Filters";
    pub const ERROR: &str = "Error";
    pub const ERRNO: &str = "Errno";
    pub const SQL: &str = "SQL";
    pub const TOKEN: &str = "Token";
    pub const DB: &str = "db";
    pub const TIME: &str = "Time";
    pub const SNAPSHOT: &str = "Snapshot";
    pub const SUBSCRIBE: &str = "Subscribe";
}

/// Service name sent with every request.
pub const SERVICE_NAME: &str = "openplant";

/// Request action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    Create,
    Select,
    Insert,
    Update,
    Replace,
    Delete,
    ExecSql,
    Commit,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Create => "Create",
            Action::Select => "Select",
            Action::Insert => "Insert",
            Action::Update => "Update",
            Action::Replace => "Replace",
            Action::Delete => "Delete",
            Action::ExecSql => "ExecSQL",
            Action::Commit => "Commit",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Action {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        [
            Action::Create,
            Action::Select,
            Action::Insert,
            Action::Update,
            Action::Replace,
            Action::Delete,
            Action::ExecSql,
            Action::Commit,
        ]
        .into_iter()
        .find(|a| a.as_str().eq_ignore_ascii_case(s))
        .ok_or_else(|| ProtocolError::malformed("action", s.to_string()))
    }
}

/// String-keyed property map.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Props(BTreeMap<String, MsgValue>);

impl Props {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, key: &str, value: impl Into<MsgValue>) -> &mut Self {
        self.0.insert(key.to_string(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&MsgValue> {
        self.0.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(MsgValue::as_str)
    }

    pub fn get_int(&self, key: &str) -> Option<i64> {
        self.get(key).and_then(MsgValue::as_int)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn remove(&mut self, key: &str) -> Option<MsgValue> {
        self.0.remove(key)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &MsgValue)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub(crate) fn insert_raw(&mut self, key: String, value: MsgValue) {
        self.0.insert(key, value);
    }

    /// Writes the entries (without a map header).
    pub fn encode_entries(&self, out: &mut impl BufMut) {
        for (k, v) in &self.0 {
            msgpack::write_str(out, k);
            v.encode(out);
        }
    }
}
