//! Contains structs for fields, rows and assembled query results
use std::sync::Arc;

use bytes::Bytes;

use crate::decode::{Value, decode_value};

/// A column definition parsed from a field package
#[derive(Debug, Clone)]
pub struct Field {
    /// The table the column belongs to, as aliased in the query
    pub table: String,
    /// The column name, as aliased in the query
    pub name: String,
    /// Character set of the column
    pub charset: u16,
    /// Maximum display length of the column
    pub column_length: u32,
    /// The type of the column, see [crate::constants::type_]
    pub r#type: u8,
    /// Column flags, see [crate::constants::column_flag]
    pub flags: u16,
    /// Number of decimals of the column
    pub decimals: u8,
}

/// A row returned by a query
///
/// The field list is shared between all rows of a result set.
#[derive(Debug, Clone)]
pub struct Row {
    /// Columns of the result set the row belongs to
    fields: Arc<Vec<Field>>,
    /// Decoded values, one per column in declared order
    values: Vec<Value>,
}

impl Row {
    /// Decode a row from the raw values of a row package
    pub(crate) fn new(fields: Arc<Vec<Field>>, raw: Vec<Option<Bytes>>) -> Self {
        let values = fields
            .iter()
            .zip(raw)
            .map(|(f, v)| decode_value(f, v.as_deref()))
            .collect();
        Row { fields, values }
    }

    /// Return the value of the column with the given name
    pub fn get(&self, name: &str) -> Option<&Value> {
        let idx = self.fields.iter().position(|f| f.name == name)?;
        self.values.get(idx)
    }

    /// Return the value at the given column index
    pub fn value(&self, idx: usize) -> Option<&Value> {
        self.values.get(idx)
    }

    /// Return all values in declared column order
    pub fn values(&self) -> &[Value] {
        &self.values
    }

    /// Return the columns of the result set the row belongs to
    pub fn fields(&self) -> &[Field] {
        &self.fields
    }
}

/// One result set of a statement
///
/// A rowless statement outcome (INSERT, UPDATE, ...) is a result set with an
/// empty field list carrying the affected row count and insert id.
#[derive(Debug)]
pub struct ResultSet {
    /// Columns of the result set, empty for rowless outcomes
    pub fields: Arc<Vec<Field>>,
    /// The rows of the result set
    pub rows: Vec<Row>,
    /// Number of rows affected, for rowless outcomes
    pub affected_rows: u64,
    /// Id of the last inserted row, for rowless outcomes
    pub last_insert_id: u64,
    /// Warning count reported by the server
    pub warnings: u16,
}

/// The assembled outcome of one statement
///
/// Most statements produce exactly one result set; multi-statement queries
/// append one entry per set in server order.
#[derive(Debug)]
pub struct QueryResult {
    /// All result sets of the statement in server order
    pub sets: Vec<ResultSet>,
}

impl QueryResult {
    /// Return the rows of the first result set
    pub fn rows(&self) -> &[Row] {
        self.sets.first().map(|s| s.rows.as_slice()).unwrap_or(&[])
    }

    /// Return the fields of the first result set
    pub fn fields(&self) -> &[Field] {
        self.sets
            .first()
            .map(|s| s.fields.as_slice())
            .unwrap_or(&[])
    }

    /// Return the affected row count of the first result set
    pub fn affected_rows(&self) -> u64 {
        self.sets.first().map(|s| s.affected_rows).unwrap_or(0)
    }

    /// Return the last insert id of the first result set
    pub fn last_insert_id(&self) -> u64 {
        self.sets.first().map(|s| s.last_insert_id).unwrap_or(0)
    }
}
