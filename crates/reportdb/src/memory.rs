//! In-memory `ReportingDb` that answers from canned results and records calls.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::{DbError, RawRows, ReportTransaction, ReportingDb};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DbCall {
    Query { sql: String, params: Vec<String> },
    Begin,
    SetStatementTimeout(Duration),
    ExecuteScript(String),
    TxQuery { sql: String, params: Vec<String> },
    Rollback,
}

type Canned = Result<RawRows, String>;

#[derive(Default)]
struct State {
    queries: Vec<(String, Canned)>,
    scripts: Vec<(String, Result<(), String>)>,
    fail_begin: Option<String>,
    calls: Vec<DbCall>,
}

#[derive(Clone, Default)]
pub struct MemoryDb {
    state: Arc<Mutex<State>>,
}

impl MemoryDb {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answers every query whose SQL contains `needle`. Earlier registrations win.
    pub fn on_query(self, needle: &str, result: Result<RawRows, &str>) -> Self {
        self.with_state(|state| {
            state
                .queries
                .push((needle.to_string(), result.map_err(str::to_string)))
        });
        self
    }

    /// Scripts succeed unless a registered needle matches.
    pub fn on_script(self, needle: &str, result: Result<(), &str>) -> Self {
        self.with_state(|state| {
            state
                .scripts
                .push((needle.to_string(), result.map_err(str::to_string)))
        });
        self
    }

    pub fn fail_begin(self, message: &str) -> Self {
        self.with_state(|state| state.fail_begin = Some(message.to_string()));
        self
    }

    pub fn calls(&self) -> Vec<DbCall> {
        self.with_state(|state| state.calls.clone())
    }

    pub fn count(&self, matches: impl Fn(&DbCall) -> bool) -> usize {
        self.with_state(|state| state.calls.iter().filter(|c| matches(c)).count())
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut State) -> T) -> T {
        let mut guard = match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut guard)
    }

    fn answer(&self, call: DbCall, sql: &str) -> Result<RawRows, DbError> {
        self.with_state(|state| {
            state.calls.push(call);
            match state.queries.iter().find(|(needle, _)| sql.contains(needle.as_str())) {
                Some((_, Ok(rows))) => Ok(rows.clone()),
                Some((_, Err(message))) => Err(DbError::Backend(message.clone())),
                None => Err(DbError::Backend(format!("unexpected query {}", sql))),
            }
        })
    }
}

#[async_trait]
impl ReportingDb for MemoryDb {
    async fn query(&self, sql: &str, params: &[String]) -> Result<RawRows, DbError> {
        let call = DbCall::Query {
            sql: sql.to_string(),
            params: params.to_vec(),
        };
        self.answer(call, sql)
    }

    async fn begin(&self) -> Result<Box<dyn ReportTransaction>, DbError> {
        let failure = self.with_state(|state| {
            state.calls.push(DbCall::Begin);
            state.fail_begin.clone()
        });
        match failure {
            Some(message) => Err(DbError::Backend(message)),
            None => Ok(Box::new(MemoryTransaction { db: self.clone() })),
        }
    }
}

struct MemoryTransaction {
    db: MemoryDb,
}

#[async_trait]
impl ReportTransaction for MemoryTransaction {
    async fn set_statement_timeout(&mut self, timeout: Duration) -> Result<(), DbError> {
        self.db
            .with_state(|state| state.calls.push(DbCall::SetStatementTimeout(timeout)));
        Ok(())
    }

    async fn execute_script(&mut self, sql: &str) -> Result<(), DbError> {
        self.db.with_state(|state| {
            state.calls.push(DbCall::ExecuteScript(sql.to_string()));
            match state.scripts.iter().find(|(needle, _)| sql.contains(needle.as_str())) {
                Some((_, Err(message))) => Err(DbError::Backend(message.clone())),
                _ => Ok(()),
            }
        })
    }

    async fn query(&mut self, sql: &str, params: &[String]) -> Result<RawRows, DbError> {
        let call = DbCall::TxQuery {
            sql: sql.to_string(),
            params: params.to_vec(),
        };
        self.db.answer(call, sql)
    }

    async fn rollback(&mut self) -> Result<(), DbError> {
        self.db.with_state(|state| state.calls.push(DbCall::Rollback));
        Ok(())
    }
}
