use std::sync::LazyLock;

use regex::Regex;
use reporting_contracts::{ColumnDescriptor, QueryFilter, QueryOrder, QueryTable, TableQuery};

use crate::{ErrorKind, ReportingError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledQuery {
    pub sql: String,
    pub params: Vec<String>,
}

/// Returns the only table of a descriptor, rejecting anything else.
pub fn single_table(query: &TableQuery) -> Result<&QueryTable, ReportingError> {
    match query.tables.as_slice() {
        [table] => Ok(table),
        _ => Err(ReportingError::new(
            ErrorKind::InvalidQuery,
            "query must have exactly one table",
        )),
    }
}

/// Compiles a single-table descriptor into parameterized SQL.
///
/// `columns` is the metadata of the target table and is used to validate
/// filter keys and values. Identifiers are concatenated as given; only
/// filter values are bound.
pub fn compile(
    query: &TableQuery,
    columns: &[ColumnDescriptor],
) -> Result<CompiledQuery, ReportingError> {
    let table = single_table(query)?;

    let mut sql = String::new();
    sql.push_str("SELECT ");
    sql.push_str(&select_list(&table.columns));
    sql.push_str(" FROM \"");
    sql.push_str(&table.schema);
    sql.push_str("\".\"");
    sql.push_str(&table.table_name);
    sql.push('"');

    let (condition, params) = conditions(&table.filters, columns)
        .map_err(|err| err.context("could not construct condition"))?;
    if !condition.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&condition);
    }

    let order = ordering(&table.order);
    if !order.is_empty() {
        sql.push_str(" ORDER BY ");
        sql.push_str(&order);
    }

    if table.limit != 0 {
        sql.push_str(&format!(" LIMIT {}", table.limit));
    }

    Ok(CompiledQuery { sql, params })
}

fn select_list(columns: &[String]) -> String {
    if columns.is_empty() {
        "*".to_string()
    } else {
        columns.join(", ")
    }
}

fn conditions(
    filters: &[QueryFilter],
    columns: &[ColumnDescriptor],
) -> Result<(String, Vec<String>), ReportingError> {
    let mut clauses = Vec::new();
    let mut params = Vec::new();

    for (idx, filter) in filters.iter().enumerate() {
        if filter.key.is_empty() {
            continue;
        }

        let Some(column) = columns.iter().find(|c| c.column_name == filter.key) else {
            return Err(ReportingError::new(
                ErrorKind::UnknownColumn,
                format!("filter on invalid column {}", filter.key),
            ));
        };

        if column.data_type == "uuid" && !is_canonical_uuid(&filter.value) {
            return Err(ReportingError::new(
                ErrorKind::InvalidValue,
                format!(
                    "invalid value for field {} ({}): invalid UUID {}",
                    filter.key, filter.value, filter.value
                ),
            ));
        }

        let op = if filter.op.is_empty() {
            "="
        } else {
            filter.op.as_str()
        };
        // Placeholder numbers follow the position in the original list.
        clauses.push(format!("{} {} ${}", filter.key, op, idx + 1));
        params.push(filter.value.clone());
    }

    Ok((clauses.join(" AND "), params))
}

fn ordering(order: &[QueryOrder]) -> String {
    order
        .iter()
        .filter(|o| !o.key.is_empty())
        .map(|o| {
            let nulls = if o.nulls.eq_ignore_ascii_case("first")
                || o.nulls.eq_ignore_ascii_case("start")
            {
                "FIRST"
            } else {
                "LAST"
            };
            format!("{} {} NULLS {}", o.key, o.direction, nulls)
        })
        .collect::<Vec<_>>()
        .join(", ")
}

static UUID_PATTERN: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(
        "^[0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12}$",
    )
    .ok()
});

/// Canonical 8-4-4-4-12 hexadecimal form, either case.
pub fn is_canonical_uuid(value: &str) -> bool {
    UUID_PATTERN
        .as_ref()
        .is_some_and(|pattern| pattern.is_match(value))
}
