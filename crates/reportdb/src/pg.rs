use std::collections::HashMap;
use std::future::Future;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::SecondsFormat;
use reporting_contracts::{DbValue, format_uuid};
use rust_decimal::Decimal;
use serde_json::Value;
use sqlx::postgres::types::{Oid, PgInterval, PgMoney, PgTimeTz};
use sqlx::postgres::{PgConnectOptions, PgConnection, PgPoolOptions, PgRow, PgTypeKind};
use sqlx::types::Uuid;
use sqlx::types::ipnet::IpNet;
use sqlx::{Column, Decode, Either, Executor, Postgres, Row, Statement, Type, TypeInfo, ValueRef};

use crate::{DbError, RawRows, ReportTransaction, ReportingDb};

#[derive(Debug, Clone, Copy)]
pub struct PoolSettings {
    pub max_connections: u32,
    pub connect_timeout: Duration,
    pub query_timeout: Duration,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_connections: 4,
            connect_timeout: Duration::from_secs(5),
            query_timeout: Duration::from_secs(60),
        }
    }
}

#[derive(Clone)]
pub struct PgReportingDb {
    pool: sqlx::PgPool,
    query_timeout: Duration,
}

impl PgReportingDb {
    pub async fn connect(
        url: &str,
        user: &str,
        pass: &str,
        settings: PoolSettings,
    ) -> Result<Self, DbError> {
        let options = PgConnectOptions::from_str(url)?
            .username(user)
            .password(pass);

        let pool = tokio::time::timeout(
            settings.connect_timeout,
            PgPoolOptions::new()
                .max_connections(settings.max_connections)
                .acquire_timeout(settings.connect_timeout)
                .connect_with(options),
        )
        .await
        .map_err(|_| DbError::Timeout(settings.connect_timeout))??;

        Ok(Self::from_pool(pool, settings.query_timeout))
    }

    pub fn from_pool(pool: sqlx::PgPool, query_timeout: Duration) -> Self {
        Self {
            pool,
            query_timeout,
        }
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[async_trait]
impl ReportingDb for PgReportingDb {
    async fn query(&self, sql: &str, params: &[String]) -> Result<RawRows, DbError> {
        bounded(self.query_timeout, async {
            let mut conn = self.pool.acquire().await?;
            fetch_with_text_params(&mut conn, sql, params).await
        })
        .await
    }

    async fn begin(&self) -> Result<Box<dyn ReportTransaction>, DbError> {
        let tx = bounded(self.query_timeout, async {
            self.pool.begin().await.map_err(DbError::from)
        })
        .await?;

        Ok(Box::new(PgReportTransaction {
            tx: Some(tx),
            query_timeout: self.query_timeout,
        }))
    }
}

/// Holds the transaction until `rollback`; dropping it unresolved also rolls back.
struct PgReportTransaction {
    tx: Option<sqlx::Transaction<'static, Postgres>>,
    query_timeout: Duration,
}

impl PgReportTransaction {
    fn conn(&mut self) -> Result<&mut PgConnection, DbError> {
        match self.tx.as_mut() {
            Some(tx) => Ok(&mut **tx),
            None => Err(DbError::Backend(
                "transaction already rolled back".to_string(),
            )),
        }
    }
}

#[async_trait]
impl ReportTransaction for PgReportTransaction {
    async fn set_statement_timeout(&mut self, timeout: Duration) -> Result<(), DbError> {
        let limit = self.query_timeout;
        let conn = self.conn()?;
        bounded(limit, async {
            sqlx::query("SELECT set_config('statement_timeout', $1, true)")
                .bind(format!("{}ms", timeout.as_millis()))
                .execute(&mut *conn)
                .await?;
            Ok::<(), DbError>(())
        })
        .await
    }

    async fn execute_script(&mut self, sql: &str) -> Result<(), DbError> {
        let limit = self.query_timeout;
        let conn = self.conn()?;
        bounded(limit, execute_raw(conn, sql)).await
    }

    async fn query(&mut self, sql: &str, params: &[String]) -> Result<RawRows, DbError> {
        let limit = self.query_timeout;
        let conn = self.conn()?;
        bounded(limit, fetch_with_text_params(conn, sql, params)).await
    }

    async fn rollback(&mut self) -> Result<(), DbError> {
        let Some(tx) = self.tx.take() else {
            return Ok(());
        };
        bounded(self.query_timeout, async {
            tx.rollback().await.map_err(DbError::from)
        })
        .await
    }
}

async fn execute_raw(conn: &mut PgConnection, sql: &str) -> Result<(), DbError> {
    conn.execute(sqlx::raw_sql(sql)).await?;
    Ok(())
}

async fn bounded<T, F>(limit: Duration, fut: F) -> Result<T, DbError>
where
    F: Future<Output = Result<T, DbError>>,
{
    tokio::time::timeout(limit, fut)
        .await
        .map_err(|_| DbError::Timeout(limit))?
}

/// Runs `sql` with every parameter bound as text.
///
/// Parameters the server would type as something other than text get an
/// explicit `::type` cast so the text value is converted server side.
async fn fetch_with_text_params(
    conn: &mut PgConnection,
    sql: &str,
    params: &[String],
) -> Result<RawRows, DbError> {
    if params.is_empty() {
        let rows = sqlx::query(sql).fetch_all(&mut *conn).await?;
        return decode_rows(&rows);
    }

    let statement = (&mut *conn).prepare(sql).await?;
    let inferred: Vec<String> = match statement.parameters() {
        Some(Either::Left(types)) => types.iter().map(|t| t.name().to_string()).collect(),
        _ => Vec::new(),
    };
    let rewritten = cast_text_placeholders(sql, &inferred);
    tracing::debug!(
        param_count = params.len(),
        inferred = ?inferred,
        "binding text parameters"
    );

    let mut query = sqlx::query(&rewritten);
    for value in params {
        query = query.bind(value.as_str());
    }
    let rows = query.fetch_all(&mut *conn).await?;
    decode_rows(&rows)
}

fn needs_cast(type_name: &str) -> bool {
    if matches!(
        type_name,
        "TEXT" | "VARCHAR" | "CHAR" | "NAME" | "UNKNOWN" | "CITEXT" | "citext"
    ) {
        return false;
    }
    !type_name.is_empty()
        && type_name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '[' | ']'))
}

/// SQL spelling of a server type name; `CHAR` is blank-padded `bpchar`, not `char(1)`.
fn cast_target(type_name: &str) -> String {
    match type_name {
        "CHAR[]" => "bpchar[]".to_string(),
        other => other.to_ascii_lowercase(),
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Lexical {
    Code,
    Literal,
    QuotedIdent,
    LineComment,
    BlockComment,
}

/// Appends `::<type>` to each `$n` placeholder whose inferred type is not text-like.
///
/// Placeholders inside string literals, quoted identifiers and comments are
/// left alone.
pub fn cast_text_placeholders(sql: &str, inferred: &[String]) -> String {
    let bytes = sql.as_bytes();
    let mut out = String::with_capacity(sql.len() + inferred.len() * 8);
    let mut state = Lexical::Code;
    let mut idx = 0;
    let mut copied = 0;

    while idx < bytes.len() {
        let b = bytes[idx];
        let next = bytes.get(idx + 1).copied();
        match state {
            Lexical::Literal => {
                if b == b'\'' {
                    state = Lexical::Code;
                }
                idx += 1;
                continue;
            }
            Lexical::QuotedIdent => {
                if b == b'"' {
                    state = Lexical::Code;
                }
                idx += 1;
                continue;
            }
            Lexical::LineComment => {
                if b == b'\n' {
                    state = Lexical::Code;
                }
                idx += 1;
                continue;
            }
            Lexical::BlockComment => {
                if b == b'*' && next == Some(b'/') {
                    state = Lexical::Code;
                    idx += 2;
                } else {
                    idx += 1;
                }
                continue;
            }
            Lexical::Code => {}
        }

        match (b, next) {
            (b'\'', _) => state = Lexical::Literal,
            (b'"', _) => state = Lexical::QuotedIdent,
            (b'-', Some(b'-')) => state = Lexical::LineComment,
            (b'/', Some(b'*')) => state = Lexical::BlockComment,
            _ => {}
        }
        if state != Lexical::Code {
            idx += match state {
                Lexical::LineComment | Lexical::BlockComment => 2,
                _ => 1,
            };
            continue;
        }
        if b != b'$' {
            idx += 1;
            continue;
        }
        let preceded_by_ident = idx > 0
            && (bytes[idx - 1].is_ascii_alphanumeric() || bytes[idx - 1] == b'_');
        let digits_end = bytes[idx + 1..]
            .iter()
            .position(|c| !c.is_ascii_digit())
            .map(|p| idx + 1 + p)
            .unwrap_or(bytes.len());
        if preceded_by_ident || digits_end == idx + 1 {
            idx += 1;
            continue;
        }

        let position = sql[idx + 1..digits_end].parse::<usize>().unwrap_or(0);
        out.push_str(&sql[copied..digits_end]);
        copied = digits_end;
        if let Some(type_name) = position.checked_sub(1).and_then(|p| inferred.get(p))
            && needs_cast(type_name)
        {
            out.push_str("::");
            out.push_str(&cast_target(type_name));
        }
        idx = digits_end;
    }

    out.push_str(&sql[copied..]);
    out
}

fn decode_rows(rows: &[PgRow]) -> Result<RawRows, DbError> {
    let columns: Vec<String> = rows
        .first()
        .map(|row| {
            row.columns()
                .iter()
                .map(|c| c.name().to_string())
                .collect()
        })
        .unwrap_or_default();

    let mut decoded = Vec::with_capacity(rows.len());
    for row in rows {
        let mut values = HashMap::with_capacity(columns.len());
        for (idx, column) in row.columns().iter().enumerate() {
            values.insert(column.name().to_string(), decode_value(row, idx)?);
        }
        decoded.push(values);
    }

    Ok(RawRows {
        columns,
        rows: decoded,
    })
}

fn get<'r, T>(row: &'r PgRow, idx: usize) -> Result<T, DbError>
where
    T: Decode<'r, Postgres> + Type<Postgres>,
{
    row.try_get::<T, _>(idx)
        .map_err(|err| DbError::Decode(format!("column {}: {}", column_name(row, idx), err)))
}

fn decode_value(row: &PgRow, idx: usize) -> Result<DbValue, DbError> {
    let raw = row.try_get_raw(idx)?;
    if raw.is_null() {
        return Ok(DbValue::Null);
    }
    let type_info = raw.type_info().into_owned();
    let type_name = type_info.name();

    let value = match type_name {
        "BOOL" => DbValue::Bool(get::<bool>(row, idx)?),
        "INT2" => DbValue::Int(i64::from(get::<i16>(row, idx)?)),
        "INT4" => DbValue::Int(i64::from(get::<i32>(row, idx)?)),
        "INT8" => DbValue::Int(get::<i64>(row, idx)?),
        "OID" => DbValue::Int(i64::from(get::<Oid>(row, idx)?.0)),
        "FLOAT4" => DbValue::Float(f64::from(get::<f32>(row, idx)?)),
        "FLOAT8" => DbValue::Float(get::<f64>(row, idx)?),
        "NUMERIC" => DbValue::Json(exact_number(&get::<Decimal>(row, idx)?)?),
        "MONEY" => DbValue::Json(exact_number(&get::<PgMoney>(row, idx)?.to_decimal(2))?),
        "TEXT" | "VARCHAR" | "CHAR" | "NAME" | "CITEXT" | "citext" => {
            DbValue::Text(get::<String>(row, idx)?)
        }
        "\"CHAR\"" => DbValue::Text(char::from(get::<i8>(row, idx)? as u8).to_string()),
        "BYTEA" => DbValue::Text(format!("\\x{}", hex::encode(get::<Vec<u8>>(row, idx)?))),
        "JSON" | "JSONB" => DbValue::Json(get::<serde_json::Value>(row, idx)?),
        "UUID" => DbValue::Binary16(*get::<Uuid>(row, idx)?.as_bytes()),
        "INET" => DbValue::Text(format_inet(&get::<IpNet>(row, idx)?)),
        "CIDR" => DbValue::Text(get::<IpNet>(row, idx)?.to_string()),
        "TIMESTAMPTZ" => DbValue::Text(
            get::<chrono::DateTime<chrono::Utc>>(row, idx)?
                .to_rfc3339_opts(SecondsFormat::AutoSi, true),
        ),
        "TIMESTAMP" => DbValue::Text(
            get::<chrono::NaiveDateTime>(row, idx)?
                .format("%Y-%m-%dT%H:%M:%S%.f")
                .to_string(),
        ),
        "DATE" => DbValue::Text(get::<chrono::NaiveDate>(row, idx)?.to_string()),
        "TIME" => DbValue::Text(get::<chrono::NaiveTime>(row, idx)?.to_string()),
        "TIMETZ" => {
            let value = get::<PgTimeTz<chrono::NaiveTime, chrono::FixedOffset>>(row, idx)?;
            DbValue::Text(format!("{}{}", value.time, value.offset))
        }
        "INTERVAL" => DbValue::Text(format_interval(&get::<PgInterval>(row, idx)?)),
        "TEXT[]" | "VARCHAR[]" | "CHAR[]" | "NAME[]" => {
            DbValue::Json(Value::from(get::<Vec<String>>(row, idx)?))
        }
        "BOOL[]" => DbValue::Json(Value::from(get::<Vec<bool>>(row, idx)?)),
        "INT2[]" => DbValue::Json(Value::from(get::<Vec<i16>>(row, idx)?)),
        "INT4[]" => DbValue::Json(Value::from(get::<Vec<i32>>(row, idx)?)),
        "INT8[]" => DbValue::Json(Value::from(get::<Vec<i64>>(row, idx)?)),
        "FLOAT4[]" => DbValue::Json(Value::from(get::<Vec<f32>>(row, idx)?)),
        "FLOAT8[]" => DbValue::Json(Value::from(get::<Vec<f64>>(row, idx)?)),
        "NUMERIC[]" => DbValue::Json(Value::Array(
            get::<Vec<Decimal>>(row, idx)?
                .iter()
                .map(exact_number)
                .collect::<Result<_, _>>()?,
        )),
        "UUID[]" => DbValue::Json(Value::from(
            get::<Vec<Uuid>>(row, idx)?
                .iter()
                .map(|id| format_uuid(id.as_bytes()))
                .collect::<Vec<_>>(),
        )),
        "JSON[]" | "JSONB[]" => DbValue::Json(Value::from(get::<Vec<Value>>(row, idx)?)),
        _ if matches!(type_info.kind(), PgTypeKind::Enum(_)) => {
            let label = raw.as_str().map_err(|err| {
                DbError::Decode(format!("column {}: {}", column_name(row, idx), err))
            })?;
            DbValue::Text(label.to_string())
        }
        _ => {
            return Err(DbError::Decode(format!(
                "column {}: unsupported type {}",
                column_name(row, idx),
                type_name
            )));
        }
    };

    Ok(value)
}

/// Keeps every digit of `decimal`; the value stays a JSON number.
fn exact_number(decimal: &Decimal) -> Result<Value, DbError> {
    serde_json::Number::from_str(&decimal.to_string())
        .map(Value::Number)
        .map_err(|err| DbError::Decode(format!("numeric {}: {}", decimal, err)))
}

/// Host addresses print without their full-length prefix, as `inet` output does.
fn format_inet(network: &IpNet) -> String {
    if network.prefix_len() == network.max_prefix_len() {
        network.addr().to_string()
    } else {
        network.to_string()
    }
}

/// Renders an interval the way the server's default `postgres` style does,
/// e.g. `1 year 2 mons -3 days +04:05:06.5`.
pub fn format_interval(interval: &PgInterval) -> String {
    let mut out = String::new();
    let mut is_zero = true;
    let mut is_before = false;

    let years = interval.months / 12;
    let months = interval.months % 12;
    for (value, unit) in [
        (i64::from(years), "year"),
        (i64::from(months), "mon"),
        (i64::from(interval.days), "day"),
    ] {
        if value == 0 {
            continue;
        }
        if !is_zero {
            out.push(' ');
        }
        if is_before && value > 0 {
            out.push('+');
        }
        out.push_str(&format!("{} {}", value, unit));
        if value != 1 {
            out.push('s');
        }
        is_before = value < 0;
        is_zero = false;
    }

    let micros = interval.microseconds;
    if is_zero || micros != 0 {
        if !is_zero {
            out.push(' ');
        }
        if micros < 0 {
            out.push('-');
        } else if is_before {
            out.push('+');
        }
        let total = micros.unsigned_abs();
        let seconds = total / 1_000_000;
        let fraction = total % 1_000_000;
        out.push_str(&format!(
            "{:02}:{:02}:{:02}",
            seconds / 3600,
            seconds / 60 % 60,
            seconds % 60
        ));
        if fraction != 0 {
            let digits = format!("{:06}", fraction);
            out.push('.');
            out.push_str(digits.trim_end_matches('0'));
        }
    }
    out
}

fn column_name(row: &PgRow, idx: usize) -> String {
    row.columns()
        .get(idx)
        .map(|c| c.name().to_string())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn types(names: &[&str]) -> Vec<String> {
        names.iter().map(|n| n.to_string()).collect()
    }

    #[test]
    fn uuid_and_numeric_placeholders_are_cast() {
        let sql = cast_text_placeholders(
            "SELECT * FROM \"s\".\"t\" WHERE id = $1 AND n > $2 AND name = $3",
            &types(&["UUID", "INT4", "TEXT"]),
        );
        assert_eq!(
            sql,
            "SELECT * FROM \"s\".\"t\" WHERE id = $1::uuid AND n > $2::int4 AND name = $3"
        );
    }

    #[test]
    fn multi_digit_placeholders_are_matched_whole() {
        let mut inferred = types(&["TEXT"; 9]);
        inferred.push("DATE".to_string());
        let sql = cast_text_placeholders("SELECT f(a => $1, j => $10)", &inferred);
        assert_eq!(sql, "SELECT f(a => $1, j => $10::date)");
    }

    #[test]
    fn literals_and_identifiers_are_untouched() {
        let sql = cast_text_placeholders(
            "SELECT '$1' AS x, col$1 FROM t WHERE a = $1",
            &types(&["BOOL"]),
        );
        assert_eq!(sql, "SELECT '$1' AS x, col$1 FROM t WHERE a = $1::bool");
    }

    #[test]
    fn placeholders_without_inferred_type_are_left_alone() {
        let sql = cast_text_placeholders("SELECT $1, $2, $", &types(&["UNKNOWN"]));
        assert_eq!(sql, "SELECT $1, $2, $");
    }

    #[test]
    fn array_and_timestamp_types_lowercase() {
        let sql = cast_text_placeholders(
            "SELECT * FROM t WHERE a = ANY($1) AND b < $2",
            &types(&["INT8[]", "TIMESTAMPTZ"]),
        );
        assert_eq!(
            sql,
            "SELECT * FROM t WHERE a = ANY($1::int8[]) AND b < $2::timestamptz"
        );
    }

    #[test]
    fn quoted_type_names_are_not_cast() {
        assert!(!needs_cast("\"CHAR\""));
        assert!(needs_cast("UUID"));
        assert!(!needs_cast("VARCHAR"));
    }

    #[test]
    fn blank_padded_char_is_not_truncated_by_a_cast() {
        let sql = cast_text_placeholders(
            "SELECT * FROM t WHERE code = $1 AND codes @> $2",
            &types(&["CHAR", "CHAR[]"]),
        );
        assert_eq!(
            sql,
            "SELECT * FROM t WHERE code = $1 AND codes @> $2::bpchar[]"
        );
    }

    #[test]
    fn apostrophe_in_quoted_identifier_does_not_hide_later_placeholders() {
        let sql = cast_text_placeholders(
            "SELECT \"it's\" FROM t WHERE id = $1",
            &types(&["UUID"]),
        );
        assert_eq!(sql, "SELECT \"it's\" FROM t WHERE id = $1::uuid");
    }

    #[test]
    fn comments_are_skipped_without_swallowing_the_next_line() {
        let sql = cast_text_placeholders(
            "SELECT * FROM t -- don't cast $1 here\nWHERE id = $1 /* nor $2 */ AND n = $2",
            &types(&["UUID", "INT4"]),
        );
        assert_eq!(
            sql,
            "SELECT * FROM t -- don't cast $1 here\nWHERE id = $1::uuid /* nor $2 */ AND n = $2::int4"
        );
    }

    #[test]
    fn doubled_quotes_stay_inside_the_literal() {
        let sql = cast_text_placeholders(
            "SELECT 'it''s $1' FROM t WHERE a = $1",
            &types(&["BOOL"]),
        );
        assert_eq!(sql, "SELECT 'it''s $1' FROM t WHERE a = $1::bool");
    }

    fn interval(months: i32, days: i32, microseconds: i64) -> PgInterval {
        PgInterval {
            months,
            days,
            microseconds,
        }
    }

    #[test]
    fn intervals_render_in_postgres_style() {
        assert_eq!(format_interval(&interval(0, 2, 0)), "2 days");
        assert_eq!(format_interval(&interval(0, 0, 0)), "00:00:00");
        assert_eq!(format_interval(&interval(0, 1, 0)), "1 day");
        assert_eq!(format_interval(&interval(-1, 0, 0)), "-1 mons");
        assert_eq!(
            format_interval(&interval(14, -3, 14_706_500_000)),
            "1 year 2 mons -3 days +04:05:06.5"
        );
        assert_eq!(format_interval(&interval(0, 1, -1_000_000)), "1 day -00:00:01");
        assert_eq!(format_interval(&interval(0, 0, 90_000_000_000)), "25:00:00");
    }

    #[test]
    fn numerics_keep_every_digit() {
        let big = Decimal::from_str("12345678901234567.89").expect("decimal");
        assert_eq!(
            serde_json::to_string(&exact_number(&big).expect("number")).expect("serialize"),
            "12345678901234567.89"
        );
        let scaled = Decimal::from_str("1.50").expect("decimal");
        assert_eq!(
            exact_number(&scaled).expect("number").to_string(),
            "1.50"
        );
    }

    #[test]
    fn inet_hosts_drop_their_full_prefix() {
        let host = IpNet::from_str("10.0.0.1/32").expect("inet");
        let net = IpNet::from_str("10.0.0.0/8").expect("inet");
        let v6 = IpNet::from_str("::1/128").expect("inet");
        assert_eq!(format_inet(&host), "10.0.0.1");
        assert_eq!(format_inet(&net), "10.0.0.0/8");
        assert_eq!(format_inet(&v6), "::1");
    }
}
