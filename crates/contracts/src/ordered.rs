use std::collections::HashMap;

use serde::ser::{Serialize, SerializeMap, Serializer};

/// A single value as decoded from a result row, before projection.
#[derive(Debug, Clone, PartialEq)]
pub enum DbValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Json(serde_json::Value),
    /// Fixed-size 128-bit binary value; Postgres `uuid` columns decode to this.
    Binary16([u8; 16]),
}

impl DbValue {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            DbValue::Text(s) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn into_json(self) -> serde_json::Value {
        match self {
            DbValue::Null => serde_json::Value::Null,
            DbValue::Bool(v) => serde_json::Value::Bool(v),
            DbValue::Int(v) => serde_json::Value::Number(v.into()),
            DbValue::Float(v) => serde_json::Number::from_f64(v)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            DbValue::Text(v) => serde_json::Value::String(v),
            DbValue::Json(v) => v,
            DbValue::Binary16(bytes) => serde_json::Value::String(format_uuid(&bytes)),
        }
    }
}

/// Lower-case hyphenated 8-4-4-4-12 rendering of a 16-byte value.
pub fn format_uuid(bytes: &[u8; 16]) -> String {
    uuid::Uuid::from_bytes(*bytes).hyphenated().to_string()
}

/// A result row whose JSON object keys keep the order they were inserted in.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OrderedRow {
    pairs: Vec<(String, serde_json::Value)>,
}

impl OrderedRow {
    /// Builds a row from an unordered association and an explicit key order.
    ///
    /// Keys in `order` that are missing from `values` are skipped; keys in
    /// `values` that are not in `order` are dropped. A key listed twice in
    /// `order` is emitted twice.
    pub fn from_map(values: HashMap<String, DbValue>, order: &[String]) -> Self {
        let mut pairs = Vec::with_capacity(order.len());
        for key in order {
            if let Some(value) = values.get(key) {
                pairs.push((key.clone(), value.clone().into_json()));
            }
        }
        Self { pairs }
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.pairs.iter().map(|(k, _)| k.as_str())
    }

    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.pairs.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }
}

impl Serialize for OrderedRow {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.pairs.len()))?;
        for (key, value) in &self.pairs {
            map.serialize_entry(key, value)?;
        }
        map.end()
    }
}

/// Projects raw rows into ordered rows following the driver's column order.
pub fn project_rows(columns: &[String], rows: Vec<HashMap<String, DbValue>>) -> Vec<OrderedRow> {
    rows.into_iter()
        .map(|row| OrderedRow::from_map(row, columns))
        .collect()
}
