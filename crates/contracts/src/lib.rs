use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

pub mod ordered;

pub use ordered::{DbValue, OrderedRow, format_uuid};

/// Schema convention of a reporting database, detected once per session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dialect {
    /// The consolidated MetaDB schema.
    MetaDb,
    /// The legacy LDP Classic schema.
    Ldp,
}

impl Dialect {
    /// Tag used in report-script markers (`--<tag>:function <name>`).
    pub fn as_str(self) -> &'static str {
        match self {
            Dialect::MetaDb => "metadb",
            Dialect::Ldp => "ldp",
        }
    }

    pub fn from_marker(tag: &str) -> Option<Self> {
        match tag {
            "metadb" => Some(Dialect::MetaDb),
            "ldp" => Some(Dialect::Ldp),
            _ => None,
        }
    }

    pub fn display_name(self) -> &'static str {
        match self {
            Dialect::MetaDb => "MetaDB",
            Dialect::Ldp => "LDP Classic",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableRef {
    #[serde(rename = "tableSchema")]
    pub schema_name: String,
    #[serde(rename = "tableName")]
    pub table_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDescriptor {
    #[serde(rename = "columnName")]
    pub column_name: String,
    pub data_type: String,
    #[serde(rename = "tableSchema")]
    pub table_schema: String,
    #[serde(rename = "tableName")]
    pub table_name: String,
    #[serde(rename = "ordinalPosition")]
    pub ordinal_position: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableQuery {
    #[serde(default)]
    pub tables: Vec<QueryTable>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryTable {
    #[serde(default)]
    pub schema: String,
    #[serde(default, rename = "tableName")]
    pub table_name: String,
    #[serde(default, rename = "columnFilters")]
    pub filters: Vec<QueryFilter>,
    #[serde(default, rename = "showColumns")]
    pub columns: Vec<String>,
    #[serde(default, rename = "orderBy")]
    pub order: Vec<QueryOrder>,
    #[serde(default)]
    pub limit: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryFilter {
    #[serde(default)]
    pub key: String,
    #[serde(default)]
    pub op: String,
    #[serde(default)]
    pub value: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryOrder {
    #[serde(default)]
    pub key: String,
    #[serde(default)]
    pub direction: String,
    #[serde(default)]
    pub nulls: String,
}

/// Request to run a report script fetched from `url`.
///
/// Parameters are kept in a `BTreeMap`, so they bind to placeholders in name
/// order. Callers must not rely on any particular placeholder numbering.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportRequest {
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub params: BTreeMap<String, String>,
    #[serde(default)]
    pub limit: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReportResponse {
    #[serde(rename = "totalRecords")]
    pub total_records: usize,
    pub records: Vec<OrderedRow>,
}

impl ReportResponse {
    pub fn from_records(records: Vec<OrderedRow>) -> Self {
        Self {
            total_records: records.len(),
            records,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub log_time: String,
    pub error_severity: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DbVersion {
    #[serde(rename = "rawVersion")]
    pub raw_version: String,
    pub version: String,
}

impl DbVersion {
    pub fn from_raw(raw_version: impl Into<String>) -> Self {
        let raw_version = raw_version.into();
        let version = raw_version.replacen("Metadb v", "", 1);
        Self {
            raw_version,
            version,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableUpdate {
    #[serde(rename = "tableSchema")]
    pub table_schema: String,
    #[serde(rename = "tableName")]
    pub table_name: String,
    #[serde(rename = "lastUpdate")]
    pub last_update: String,
    #[serde(rename = "elapsedRealTime")]
    pub elapsed_real_time: f64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DbProcess {
    #[serde(rename = "databaseName")]
    pub database_name: String,
    #[serde(rename = "userName")]
    pub user_name: String,
    pub state: String,
    #[serde(rename = "realTime")]
    pub real_time: String,
    pub query: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_query_defaults_missing_fields() {
        let query: TableQuery = serde_json::from_str(
            r#"{ "tables": [{ "schema": "folio_users", "tableName": "users", "columnFilters": [{}] }] }"#,
        )
        .expect("query should parse");

        assert_eq!(query.tables.len(), 1);
        let table = &query.tables[0];
        assert_eq!(table.schema, "folio_users");
        assert_eq!(table.table_name, "users");
        assert_eq!(table.filters, vec![QueryFilter::default()]);
        assert!(table.columns.is_empty());
        assert_eq!(table.limit, 0);
    }

    #[test]
    fn table_query_rejects_non_array_tables() {
        assert!(serde_json::from_str::<TableQuery>(r#"{ "tables": 42 }"#).is_err());
        assert!(serde_json::from_str::<TableQuery>(r#"{ "tables": ["water"] }"#).is_err());
    }

    #[test]
    fn column_descriptor_uses_wire_names() {
        let column = ColumnDescriptor {
            column_name: "id".to_string(),
            data_type: "uuid".to_string(),
            table_schema: "folio_users".to_string(),
            table_name: "users".to_string(),
            ordinal_position: "6".to_string(),
        };

        assert_eq!(
            serde_json::to_string(&column).expect("serialize"),
            r#"{"columnName":"id","data_type":"uuid","tableSchema":"folio_users","tableName":"users","ordinalPosition":"6"}"#
        );
    }

    #[test]
    fn version_strips_metadb_prefix() {
        let version = DbVersion::from_raw("Metadb v1.2.7");
        assert_eq!(version.version, "1.2.7");
        assert_eq!(
            serde_json::to_string(&version).expect("serialize"),
            r#"{"rawVersion":"Metadb v1.2.7","version":"1.2.7"}"#
        );
    }

    #[test]
    fn dialect_marker_tags_round_trip() {
        for dialect in [Dialect::MetaDb, Dialect::Ldp] {
            assert_eq!(Dialect::from_marker(dialect.as_str()), Some(dialect));
        }
        assert_eq!(Dialect::from_marker("sqlite"), None);
    }
}
