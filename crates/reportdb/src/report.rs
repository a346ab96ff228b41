use std::collections::BTreeMap;
use std::time::Duration;

use reporting_contracts::Dialect;

use crate::{ErrorKind, RawRows, ReportTransaction, ReportingDb, ReportingError};

/// LDP Classic reports resolve unqualified names against these schemas.
pub const LDP_SEARCH_PATH_PREFIX: &str = "SET search_path = local, public;\n";

const FUNCTION_TAG: &str = ":function";

/// Dialect and function name declared by a `--<dialect>:function <name>` line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptMarker {
    pub dialect: Dialect,
    pub function: String,
}

pub fn parse_marker(script: &str) -> Result<ScriptMarker, ReportingError> {
    for line in script.lines() {
        let Some(start) = line.find("--") else {
            continue;
        };
        let comment = &line[start + 2..];
        let Some(tag_end) = comment.find(FUNCTION_TAG) else {
            continue;
        };
        let tag = comment[..tag_end].trim();
        let rest = &comment[tag_end + FUNCTION_TAG.len()..];
        if tag.is_empty() || !rest.starts_with(char::is_whitespace) {
            continue;
        }
        let function = rest.trim();
        if function.is_empty() {
            continue;
        }

        let Some(dialect) = Dialect::from_marker(tag) else {
            return Err(ReportingError::new(
                ErrorKind::MalformedScript,
                format!("unrecognized dialect {} in report function marker", tag),
            ));
        };
        return Ok(ScriptMarker {
            dialect,
            function: function.to_string(),
        });
    }

    Err(ReportingError::new(
        ErrorKind::MalformedScript,
        "could not extract SQL function name",
    ))
}

/// A report ready to run: registration script plus invocation statement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedReport {
    pub marker: ScriptMarker,
    pub script: String,
    pub invocation: String,
    pub params: Vec<String>,
}

/// Validates a fetched script against the session dialect and builds its invocation.
pub fn prepare_report(
    script: &str,
    dialect: Dialect,
    params: &BTreeMap<String, String>,
    limit: u64,
) -> Result<PreparedReport, ReportingError> {
    let marker = parse_marker(script)?;
    if marker.dialect != dialect {
        return Err(ReportingError::new(
            ErrorKind::DialectMismatch,
            format!(
                "cannot run {} report in {}",
                marker.dialect.display_name(),
                dialect.display_name()
            ),
        ));
    }

    let script = match dialect {
        Dialect::Ldp => format!("{}{}", LDP_SEARCH_PATH_PREFIX, script),
        Dialect::MetaDb => script.to_string(),
    };
    let (invocation, params) = build_invocation(&marker.function, params, limit);

    Ok(PreparedReport {
        marker,
        script,
        invocation,
        params,
    })
}

/// `SELECT * FROM <function>(<name> => $1, ...)`, binding values in map order.
pub fn build_invocation(
    function: &str,
    params: &BTreeMap<String, String>,
    limit: u64,
) -> (String, Vec<String>) {
    let mut args = Vec::with_capacity(params.len());
    let mut values = Vec::with_capacity(params.len());
    for (idx, (name, value)) in params.iter().enumerate() {
        args.push(format!("{} => ${}", name, idx + 1));
        values.push(value.clone());
    }

    let mut sql = format!("SELECT * FROM {}({})", function, args.join(", "));
    if limit != 0 {
        sql.push_str(&format!(" LIMIT {}", limit));
    }
    (sql, values)
}

/// Registers the report function and invokes it inside one transaction.
///
/// The transaction is rolled back on every path, so the function never
/// outlives the call.
pub async fn run_report(
    db: &dyn ReportingDb,
    report: &PreparedReport,
    statement_timeout: Duration,
) -> Result<RawRows, ReportingError> {
    tracing::info!(
        function = %report.marker.function,
        sql = %report.invocation,
        param_count = report.params.len(),
        "running report"
    );

    let mut tx = db.begin().await.map_err(|err| {
        err.into_reporting(ErrorKind::ExecutionError, "could not open transaction")
    })?;

    let result = register_and_invoke(tx.as_mut(), report, statement_timeout).await;

    if let Err(err) = tx.rollback().await {
        tracing::warn!(error = %err, "report transaction rollback failed");
    }

    result
}

async fn register_and_invoke(
    tx: &mut dyn ReportTransaction,
    report: &PreparedReport,
    statement_timeout: Duration,
) -> Result<RawRows, ReportingError> {
    tx.set_statement_timeout(statement_timeout)
        .await
        .map_err(|err| {
            err.into_reporting(ErrorKind::ExecutionError, "could not set statement timeout")
        })?;

    tx.execute_script(&report.script).await.map_err(|err| {
        err.into_reporting(
            ErrorKind::RegistrationError,
            "could not register SQL function",
        )
    })?;

    tx.query(&report.invocation, &report.params)
        .await
        .map_err(|err| {
            err.into_reporting(ErrorKind::ExecutionError, "could not execute SQL from report")
        })
}
