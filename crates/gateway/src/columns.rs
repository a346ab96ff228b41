use std::collections::HashMap;
use std::sync::Arc;

use reporting_contracts::ColumnDescriptor;
use reporting_db::{ReportingError, introspect};
use tokio::sync::{OnceCell, RwLock};

use crate::sessions::{Session, SessionKey};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ColumnCacheKey {
    pub session: SessionKey,
    pub schema: String,
    pub table: String,
}

type ColumnSlot = Arc<OnceCell<Arc<Vec<ColumnDescriptor>>>>;

/// Column metadata per (session, schema, table). Entries are never refreshed.
#[derive(Clone, Default)]
pub struct ColumnCache {
    entries: Arc<RwLock<HashMap<ColumnCacheKey, ColumnSlot>>>,
}

impl ColumnCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get_columns(
        &self,
        session: &Session,
        schema: &str,
        table: &str,
    ) -> Result<Arc<Vec<ColumnDescriptor>>, ReportingError> {
        let key = ColumnCacheKey {
            session: session.key.clone(),
            schema: schema.to_string(),
            table: table.to_string(),
        };
        let slot = self.slot(key.clone()).await;

        let result = slot
            .get_or_try_init(|| async {
                tracing::debug!(
                    session_id = %session.log_id,
                    schema = %schema,
                    table = %table,
                    "column cache miss"
                );
                introspect::list_columns(session.db.as_ref(), schema, table)
                    .await
                    .map(Arc::new)
            })
            .await;
        match result {
            Ok(columns) => Ok(columns.clone()),
            Err(err) => {
                let mut entries = self.entries.write().await;
                if entries
                    .get(&key)
                    .is_some_and(|current| Arc::ptr_eq(current, &slot) && !current.initialized())
                {
                    entries.remove(&key);
                }
                Err(err)
            }
        }
    }

    pub async fn evict(&self, session: &SessionKey, schema: &str, table: &str) -> bool {
        let key = ColumnCacheKey {
            session: session.clone(),
            schema: schema.to_string(),
            table: table.to_string(),
        };
        self.entries.write().await.remove(&key).is_some()
    }

    /// Drops every cached table for one session; returns how many were removed.
    pub async fn evict_session(&self, session: &SessionKey) -> usize {
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|key, _| &key.session != session);
        before - entries.len()
    }

    async fn slot(&self, key: ColumnCacheKey) -> ColumnSlot {
        if let Some(slot) = self.entries.read().await.get(&key) {
            return slot.clone();
        }
        let mut entries = self.entries.write().await;
        entries.entry(key).or_default().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reporting_contracts::{DbValue, Dialect};
    use reporting_db::memory::{DbCall, MemoryDb};
    use reporting_db::{ErrorKind, RawRows};

    fn columns_rows() -> RawRows {
        RawRows::new(&[
            "column_name",
            "data_type",
            "ordinal_position",
            "table_schema",
            "table_name",
        ])
        .with_row(vec![
            DbValue::Text("id".into()),
            DbValue::Text("uuid".into()),
            DbValue::Int(1),
            DbValue::Text("folio_users".into()),
            DbValue::Text("users".into()),
        ])
    }

    fn session(db: &MemoryDb, token: &str) -> Session {
        Session::new(
            SessionKey::new("diku", "http://okapi:9130", token),
            Arc::new(db.clone()),
            Dialect::MetaDb,
        )
    }

    fn column_queries(db: &MemoryDb) -> usize {
        db.count(|c| matches!(c, DbCall::Query { sql, .. } if sql.contains("information_schema.columns")))
    }

    #[tokio::test]
    async fn second_lookup_is_served_from_cache() {
        let db = MemoryDb::new().on_query("information_schema.columns", Ok(columns_rows()));
        let cache = ColumnCache::new();
        let session = session(&db, "token");

        let (a, b) = tokio::join!(
            cache.get_columns(&session, "folio_users", "users"),
            cache.get_columns(&session, "folio_users", "users")
        );
        assert_eq!(a.expect("columns"), b.expect("columns"));
        let again = cache
            .get_columns(&session, "folio_users", "users")
            .await
            .expect("columns");
        assert_eq!(again[0].column_name, "id");
        assert_eq!(column_queries(&db), 1);
    }

    #[tokio::test]
    async fn cache_is_keyed_by_session_and_table() {
        let db = MemoryDb::new().on_query("information_schema.columns", Ok(columns_rows()));
        let cache = ColumnCache::new();

        cache
            .get_columns(&session(&db, "a"), "folio_users", "users")
            .await
            .expect("columns");
        cache
            .get_columns(&session(&db, "b"), "folio_users", "users")
            .await
            .expect("columns");
        cache
            .get_columns(&session(&db, "a"), "folio_users", "groups")
            .await
            .expect("columns");
        assert_eq!(column_queries(&db), 3);

        let key_a = SessionKey::new("diku", "http://okapi:9130", "a");
        assert_eq!(cache.evict_session(&key_a).await, 2);
        assert!(!cache.evict(&key_a, "folio_users", "users").await);
        cache
            .get_columns(&session(&db, "a"), "folio_users", "users")
            .await
            .expect("columns");
        assert_eq!(column_queries(&db), 4);
    }

    #[tokio::test]
    async fn failed_lookup_is_retried() {
        let failing = MemoryDb::new().on_query("information_schema.columns", Err("timeout"));
        let cache = ColumnCache::new();
        let err = cache
            .get_columns(&session(&failing, "t"), "s", "t")
            .await
            .expect_err("must fail");
        assert_eq!(err.kind, ErrorKind::IntrospectionError);

        let working = MemoryDb::new().on_query("information_schema.columns", Ok(columns_rows()));
        let columns = cache
            .get_columns(&session(&working, "t"), "s", "t")
            .await
            .expect("columns");
        assert_eq!(columns.len(), 1);
    }

    #[tokio::test]
    async fn failed_lookups_leave_no_entries_behind() {
        let failing = MemoryDb::new().on_query("information_schema.columns", Err("timeout"));
        let cache = ColumnCache::new();
        let session = session(&failing, "t");

        for n in 0..100 {
            cache
                .get_columns(&session, "s", &format!("missing_{}", n))
                .await
                .expect_err("must fail");
        }
        assert_eq!(cache.entries.read().await.len(), 0);
    }
}
