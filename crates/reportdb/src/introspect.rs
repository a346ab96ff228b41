use std::collections::HashMap;

use reporting_contracts::{
    ColumnDescriptor, DbProcess, DbValue, DbVersion, Dialect, LogEntry, TableRef, TableUpdate,
};

use crate::{ErrorKind, RawRows, ReportingDb, ReportingError};

/// Column every reporting table carries with the raw source record; never exposed.
pub const RESERVED_DATA_COLUMN: &str = "data";

const DIALECT_PROBE_SQL: &str = "SELECT 1 FROM pg_class c JOIN pg_namespace n ON c.relnamespace=n.oid WHERE n.nspname='dbsystem' AND c.relname='main'";

const METADB_TABLES_SQL: &str = "SELECT schema_name::text AS schema_name, table_name::text AS table_name FROM metadb.base_table \
UNION \
SELECT 'folio_derived', t.table_name::text FROM metadb.table_update t \
JOIN pg_class c ON c.relname=t.table_name \
JOIN pg_namespace n ON n.oid=c.relnamespace AND n.nspname=t.schema_name \
WHERE t.schema_name='folio_derived'";

const LDP_TABLES_SQL: &str = "SELECT table_name::text AS table_name, table_schema::text AS schema_name FROM information_schema.tables WHERE table_schema IN ('local', 'public', 'folio_reporting')";

const COLUMNS_SQL: &str = "SELECT column_name::text AS column_name, data_type::text AS data_type, ordinal_position::integer AS ordinal_position, table_schema::text AS table_schema, table_name::text AS table_name \
FROM information_schema.columns \
WHERE table_schema::text = $1 AND table_name::text = $2 AND column_name::text <> $3";

const LOGS_SQL: &str = "SELECT log_time, error_severity::text AS error_severity, message::text AS message FROM metadb.log";
const VERSION_SQL: &str = "SELECT mdbversion()::text AS mdbversion";
const UPDATES_SQL: &str = "SELECT schema_name::text AS schema_name, table_name::text AS table_name, last_update, elapsed_real_time::float8 AS elapsed_real_time FROM metadb.table_update ORDER BY elapsed_real_time DESC";
const PROCESSES_SQL: &str = "SELECT p.dbname::text AS dbname, p.username::text AS username, p.state::text AS state, p.realtime::text AS realtime, p.query::text AS query FROM ps() p ORDER BY p.realtime DESC";

/// Classifies the database behind `db`.
///
/// LDP Classic keeps its bookkeeping in `dbsystem.main`; anything without
/// that relation is treated as MetaDB.
pub async fn detect_dialect(db: &dyn ReportingDb) -> Result<Dialect, ReportingError> {
    let rows = db.query(DIALECT_PROBE_SQL, &[]).await.map_err(|err| {
        err.into_reporting(
            ErrorKind::IntrospectionError,
            "could not determine database dialect",
        )
    })?;

    let dialect = if rows.is_empty() {
        Dialect::MetaDb
    } else {
        Dialect::Ldp
    };
    tracing::debug!(dialect = dialect.as_str(), "dialect probe finished");
    Ok(dialect)
}

pub async fn list_tables(
    db: &dyn ReportingDb,
    dialect: Dialect,
) -> Result<Vec<TableRef>, ReportingError> {
    let sql = match dialect {
        Dialect::MetaDb => METADB_TABLES_SQL,
        Dialect::Ldp => LDP_TABLES_SQL,
    };
    let rows = db.query(sql, &[]).await.map_err(|err| {
        err.into_reporting(
            ErrorKind::IntrospectionError,
            "could not fetch tables from reporting DB",
        )
    })?;

    Ok(rows
        .rows
        .iter()
        .map(|row| TableRef {
            schema_name: text(row, "schema_name"),
            table_name: text(row, "table_name"),
        })
        .collect())
}

pub async fn list_columns(
    db: &dyn ReportingDb,
    schema: &str,
    table: &str,
) -> Result<Vec<ColumnDescriptor>, ReportingError> {
    let params = [
        schema.to_string(),
        table.to_string(),
        RESERVED_DATA_COLUMN.to_string(),
    ];
    let rows = db.query(COLUMNS_SQL, &params).await.map_err(|err| {
        err.into_reporting(
            ErrorKind::IntrospectionError,
            format!("could not fetch columns for {}.{}", schema, table),
        )
    })?;

    Ok(rows
        .rows
        .iter()
        .map(|row| ColumnDescriptor {
            column_name: text(row, "column_name"),
            data_type: text(row, "data_type"),
            table_schema: text(row, "table_schema"),
            table_name: text(row, "table_name"),
            ordinal_position: text(row, "ordinal_position"),
        })
        .collect())
}

pub fn require_metadb(dialect: Dialect) -> Result<(), ReportingError> {
    match dialect {
        Dialect::MetaDb => Ok(()),
        Dialect::Ldp => Err(ReportingError::new(
            ErrorKind::UnsupportedOnDialect,
            "Implemented only for MetaDB, not LDP",
        )),
    }
}

pub async fn fetch_logs(
    db: &dyn ReportingDb,
    dialect: Dialect,
) -> Result<Vec<LogEntry>, ReportingError> {
    require_metadb(dialect)?;
    let rows = status_query(db, LOGS_SQL, "could not fetch logs from reporting DB").await?;
    Ok(rows
        .rows
        .iter()
        .map(|row| LogEntry {
            log_time: text(row, "log_time"),
            error_severity: text(row, "error_severity"),
            message: text(row, "message"),
        })
        .collect())
}

pub async fn fetch_version(
    db: &dyn ReportingDb,
    dialect: Dialect,
) -> Result<DbVersion, ReportingError> {
    require_metadb(dialect)?;
    let rows = status_query(db, VERSION_SQL, "could not fetch version from reporting DB").await?;
    let raw = rows
        .rows
        .first()
        .map(|row| text(row, "mdbversion"))
        .unwrap_or_default();
    Ok(DbVersion::from_raw(raw))
}

pub async fn fetch_updates(
    db: &dyn ReportingDb,
    dialect: Dialect,
) -> Result<Vec<TableUpdate>, ReportingError> {
    require_metadb(dialect)?;
    let rows = status_query(db, UPDATES_SQL, "could not fetch updates from reporting DB").await?;
    Ok(rows
        .rows
        .iter()
        .map(|row| TableUpdate {
            table_schema: text(row, "schema_name"),
            table_name: text(row, "table_name"),
            last_update: text(row, "last_update"),
            elapsed_real_time: float(row, "elapsed_real_time"),
        })
        .collect())
}

pub async fn fetch_processes(
    db: &dyn ReportingDb,
    dialect: Dialect,
) -> Result<Vec<DbProcess>, ReportingError> {
    require_metadb(dialect)?;
    let rows =
        status_query(db, PROCESSES_SQL, "could not fetch processes from reporting DB").await?;
    Ok(rows
        .rows
        .iter()
        .map(|row| DbProcess {
            database_name: text(row, "dbname"),
            user_name: text(row, "username"),
            state: text(row, "state"),
            real_time: text(row, "realtime"),
            query: text(row, "query"),
        })
        .collect())
}

async fn status_query(
    db: &dyn ReportingDb,
    sql: &str,
    context: &str,
) -> Result<RawRows, ReportingError> {
    db.query(sql, &[])
        .await
        .map_err(|err| err.into_reporting(ErrorKind::IntrospectionError, context))
}

fn text(row: &HashMap<String, DbValue>, key: &str) -> String {
    match row.get(key) {
        None | Some(DbValue::Null) => String::new(),
        Some(DbValue::Text(s)) => s.clone(),
        Some(DbValue::Int(v)) => v.to_string(),
        Some(DbValue::Float(v)) => v.to_string(),
        Some(DbValue::Bool(v)) => v.to_string(),
        Some(other) => match other.clone().into_json() {
            serde_json::Value::String(s) => s,
            value => value.to_string(),
        },
    }
}

fn float(row: &HashMap<String, DbValue>, key: &str) -> f64 {
    match row.get(key) {
        Some(DbValue::Float(v)) => *v,
        Some(DbValue::Int(v)) => *v as f64,
        Some(DbValue::Text(s)) => s.parse().unwrap_or_default(),
        _ => 0.0,
    }
}
