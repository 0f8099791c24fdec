//! Row and group types shared by the function surface.

use serde::Serialize;
use serde_json::{Map, Value};

/// One input row, keyed by column name.
pub type Row = Map<String, Value>;

/// The rows of one aggregate group, in input order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Group {
    /// Display key, used in results and error messages
    pub key: String,
    pub rows: Vec<Row>,
}

impl Group {
    pub fn new(key: impl Into<String>, rows: Vec<Row>) -> Self {
        Self { key: key.into(), rows }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// A row selected by an aggregate, with its position in the group.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RowRef {
    pub index: usize,
    pub row: Row,
}

/// The result of an aggregate for one group.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GroupResult<T> {
    pub key: String,
    pub value: T,
}
