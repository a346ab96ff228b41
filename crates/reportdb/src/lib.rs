use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use reporting_contracts::{DbValue, OrderedRow, ordered};

mod error;
pub mod introspect;
#[cfg(any(test, feature = "testing"))]
pub mod memory;
pub mod pg;
pub mod query;
pub mod report;

pub use error::{DbError, ErrorKind, ReportingError};
pub use pg::{PgReportingDb, PoolSettings};

/// Result rows as produced by a driver: each row is an unordered association,
/// `columns` carries the authoritative field order of the result set.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawRows {
    pub columns: Vec<String>,
    pub rows: Vec<HashMap<String, DbValue>>,
}

impl RawRows {
    pub fn new(columns: &[&str]) -> Self {
        Self {
            columns: columns.iter().map(|c| c.to_string()).collect(),
            rows: Vec::new(),
        }
    }

    /// Appends a row given positionally in `columns` order.
    pub fn with_row(mut self, values: Vec<DbValue>) -> Self {
        let row = self.columns.iter().cloned().zip(values).collect();
        self.rows.push(row);
        self
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn into_ordered(self) -> Vec<OrderedRow> {
        ordered::project_rows(&self.columns, self.rows)
    }
}

/// Database handle owned by a session.
#[async_trait]
pub trait ReportingDb: Send + Sync {
    /// Runs one statement with positional string parameters bound as `$1..$n`.
    async fn query(&self, sql: &str, params: &[String]) -> Result<RawRows, DbError>;

    async fn begin(&self) -> Result<Box<dyn ReportTransaction>, DbError>;
}

/// A transaction that can only ever be rolled back.
#[async_trait]
pub trait ReportTransaction: Send {
    async fn set_statement_timeout(&mut self, timeout: Duration) -> Result<(), DbError>;

    /// Executes a multi-statement script with no parameters.
    async fn execute_script(&mut self, sql: &str) -> Result<(), DbError>;

    async fn query(&mut self, sql: &str, params: &[String]) -> Result<RawRows, DbError>;

    async fn rollback(&mut self) -> Result<(), DbError>;
}
