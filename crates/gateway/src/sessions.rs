use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use hex::ToHex;
use reporting_contracts::Dialect;
use reporting_db::{ErrorKind, PgReportingDb, PoolSettings, ReportingDb, ReportingError, introspect};
use sha2::Digest;
use tokio::sync::{OnceCell, RwLock};

use crate::config::DbCredentials;
use crate::settings::SettingsClient;

/// Exact-match identity of a caller session.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct SessionKey {
    pub tenant: String,
    pub gateway_url: String,
    pub token: String,
}

impl SessionKey {
    pub fn new(
        tenant: impl Into<String>,
        gateway_url: impl Into<String>,
        token: impl Into<String>,
    ) -> Self {
        Self {
            tenant: tenant.into(),
            gateway_url: gateway_url.into(),
            token: token.into(),
        }
    }

    /// Short stable identifier safe to put in logs.
    pub fn log_id(&self) -> String {
        let mut hasher = sha2::Sha256::new();
        hasher.update(self.tenant.as_bytes());
        hasher.update(b":");
        hasher.update(self.gateway_url.as_bytes());
        hasher.update(b":");
        hasher.update(self.token.as_bytes());
        let digest: String = hasher.finalize().encode_hex();
        digest[..16].to_string()
    }
}

impl std::fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionKey")
            .field("tenant", &self.tenant)
            .field("gateway_url", &self.gateway_url)
            .field("token", &"<redacted>")
            .finish()
    }
}

pub struct Session {
    pub key: SessionKey,
    pub log_id: String,
    pub db: Arc<dyn ReportingDb>,
    pub dialect: Dialect,
}

impl Session {
    pub fn new(key: SessionKey, db: Arc<dyn ReportingDb>, dialect: Dialect) -> Self {
        let log_id = key.log_id();
        Self {
            key,
            log_id,
            db,
            dialect,
        }
    }
}

/// Opens a database handle from resolved credentials.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, credentials: &DbCredentials)
    -> Result<Arc<dyn ReportingDb>, ReportingError>;
}

pub struct PgConnector {
    settings: PoolSettings,
}

impl PgConnector {
    pub fn new(settings: PoolSettings) -> Self {
        Self { settings }
    }
}

#[async_trait]
impl Connector for PgConnector {
    async fn connect(
        &self,
        credentials: &DbCredentials,
    ) -> Result<Arc<dyn ReportingDb>, ReportingError> {
        let db = PgReportingDb::connect(
            &credentials.url,
            &credentials.user,
            &credentials.pass,
            self.settings,
        )
        .await
        .map_err(|err| {
            ReportingError::new(
                ErrorKind::ConnectionError,
                format!("failed to connect to reporting database: {}", err),
            )
        })?;
        Ok(Arc::new(db))
    }
}

type SessionSlot = Arc<OnceCell<Arc<Session>>>;

/// Process-wide map from caller identity to an open reporting session.
///
/// Entries live for the process lifetime. Concurrent first use of one key
/// runs a single resolve; a failed resolve removes its slot again.
#[derive(Clone)]
pub struct SessionRegistry {
    sessions: Arc<RwLock<HashMap<SessionKey, SessionSlot>>>,
    connector: Arc<dyn Connector>,
    settings: SettingsClient,
    env_credentials: Option<DbCredentials>,
}

impl SessionRegistry {
    pub fn new(
        connector: Arc<dyn Connector>,
        settings: SettingsClient,
        env_credentials: Option<DbCredentials>,
    ) -> Self {
        Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
            connector,
            settings,
            env_credentials,
        }
    }

    pub async fn resolve(&self, key: SessionKey) -> Result<Arc<Session>, ReportingError> {
        let slot = self.slot(&key).await;
        match slot.get_or_try_init(|| self.open(key.clone())).await {
            Ok(session) => Ok(session.clone()),
            Err(err) => {
                self.discard_empty(&key, &slot).await;
                Err(err)
            }
        }
    }

    /// Drops a session so the next request for `key` reconnects.
    pub async fn evict(&self, key: &SessionKey) -> bool {
        self.sessions.write().await.remove(key).is_some()
    }

    /// Registers an already-open session, replacing any existing entry.
    pub async fn insert(&self, session: Arc<Session>) {
        let key = session.key.clone();
        let slot = Arc::new(OnceCell::new_with(Some(session)));
        self.sessions.write().await.insert(key, slot);
    }

    pub async fn len(&self) -> usize {
        let sessions = self.sessions.read().await;
        sessions.values().filter(|slot| slot.initialized()).count()
    }

    async fn slot(&self, key: &SessionKey) -> SessionSlot {
        if let Some(slot) = self.sessions.read().await.get(key) {
            return slot.clone();
        }
        let mut sessions = self.sessions.write().await;
        sessions.entry(key.clone()).or_default().clone()
    }

    /// Removes `slot` unless it was replaced or filled in the meantime.
    async fn discard_empty(&self, key: &SessionKey, slot: &SessionSlot) {
        let mut sessions = self.sessions.write().await;
        if sessions
            .get(key)
            .is_some_and(|current| Arc::ptr_eq(current, slot) && !current.initialized())
        {
            sessions.remove(key);
        }
    }

    async fn open(&self, key: SessionKey) -> Result<Arc<Session>, ReportingError> {
        let log_id = key.log_id();
        let credentials = self.credentials(&key).await?;
        tracing::info!(
            session_id = %log_id,
            tenant = %key.tenant,
            db_user = %credentials.user,
            "opening reporting database session"
        );

        let db = self.connector.connect(&credentials).await?;
        let dialect = introspect::detect_dialect(db.as_ref()).await?;
        crate::metrics::inc_sessions_opened();
        tracing::info!(
            session_id = %log_id,
            dialect = dialect.as_str(),
            "reporting database session ready"
        );

        Ok(Arc::new(Session::new(key, db, dialect)))
    }

    async fn credentials(&self, key: &SessionKey) -> Result<DbCredentials, ReportingError> {
        if let Some(credentials) = &self.env_credentials {
            return Ok(credentials.clone());
        }

        let stored = self
            .settings
            .fetch_db_credentials(&key.gateway_url, &key.tenant, &key.token)
            .await
            .map_err(|err| {
                ReportingError::new(
                    ErrorKind::NoDbConfig,
                    format!("could not read reporting DB settings: {}", err),
                )
            })?;

        stored.ok_or_else(|| {
            ReportingError::new(
                ErrorKind::NoDbConfig,
                "no reporting database configured in environment or tenant settings",
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use axum::http::HeaderMap;
    use axum::routing::get;
    use axum::{Json, Router, extract::State};
    use tokio::net::TcpListener;
    use tokio::sync::oneshot;

    use reporting_contracts::DbValue;
    use reporting_db::RawRows;
    use reporting_db::memory::MemoryDb;

    struct CountingConnector {
        connects: AtomicUsize,
        db: MemoryDb,
        seen: std::sync::Mutex<Vec<DbCredentials>>,
    }

    #[async_trait]
    impl Connector for CountingConnector {
        async fn connect(
            &self,
            credentials: &DbCredentials,
        ) -> Result<Arc<dyn ReportingDb>, ReportingError> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            self.seen.lock().expect("lock").push(credentials.clone());
            tokio::time::sleep(Duration::from_millis(20)).await;
            Ok(Arc::new(self.db.clone()))
        }
    }

    struct RefusingConnector;

    #[async_trait]
    impl Connector for RefusingConnector {
        async fn connect(
            &self,
            _credentials: &DbCredentials,
        ) -> Result<Arc<dyn ReportingDb>, ReportingError> {
            Err(ReportingError::new(
                ErrorKind::ConnectionError,
                "failed to connect to reporting database: connection refused",
            ))
        }
    }

    fn env_credentials() -> DbCredentials {
        DbCredentials {
            url: "postgres://metadb.example.com:12345/db".to_string(),
            user: "mike".to_string(),
            pass: "swordfish".to_string(),
        }
    }

    fn ldp_db() -> MemoryDb {
        MemoryDb::new().on_query(
            "dbsystem",
            Ok(RawRows::new(&["?column?"]).with_row(vec![DbValue::Int(1)])),
        )
    }

    fn counting(db: MemoryDb) -> Arc<CountingConnector> {
        Arc::new(CountingConnector {
            connects: AtomicUsize::new(0),
            db,
            seen: std::sync::Mutex::new(Vec::new()),
        })
    }

    fn settings() -> SettingsClient {
        SettingsClient::new(Duration::from_millis(500)).expect("client")
    }

    #[tokio::test]
    async fn connects_once_per_distinct_triple() {
        let connector = counting(ldp_db());
        let registry =
            SessionRegistry::new(connector.clone(), settings(), Some(env_credentials()));

        let key = SessionKey::new("diku", "http://okapi:9130", "token-a");
        let (a, b) = tokio::join!(registry.resolve(key.clone()), registry.resolve(key.clone()));
        let a = a.expect("resolve");
        let b = b.expect("resolve");
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.dialect, Dialect::Ldp);
        assert_eq!(connector.connects.load(Ordering::SeqCst), 1);

        registry
            .resolve(SessionKey::new("diku", "http://okapi:9130", "token-b"))
            .await
            .expect("resolve");
        assert_eq!(connector.connects.load(Ordering::SeqCst), 2);
        assert_eq!(registry.len().await, 2);

        assert_eq!(connector.seen.lock().expect("lock")[0], env_credentials());
    }

    #[tokio::test]
    async fn eviction_forces_a_reconnect() {
        let connector = counting(ldp_db());
        let registry =
            SessionRegistry::new(connector.clone(), settings(), Some(env_credentials()));
        let key = SessionKey::new("diku", "http://okapi:9130", "token");

        registry.resolve(key.clone()).await.expect("resolve");
        assert!(registry.evict(&key).await);
        registry.resolve(key).await.expect("resolve");
        assert_eq!(connector.connects.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn connection_failure_is_not_cached() {
        let registry = SessionRegistry::new(
            Arc::new(RefusingConnector),
            settings(),
            Some(env_credentials()),
        );
        let key = SessionKey::new("diku", "http://okapi:9130", "token");

        let err = registry.resolve(key.clone()).await.err().expect("must fail");
        assert_eq!(err.kind, ErrorKind::ConnectionError);
        assert!(err.message.contains("failed to connect"));
        assert_eq!(registry.len().await, 0);
    }

    #[tokio::test]
    async fn failed_resolves_leave_no_entries_behind() {
        let registry = SessionRegistry::new(
            Arc::new(RefusingConnector),
            settings(),
            Some(env_credentials()),
        );

        for n in 0..200 {
            let key = SessionKey::new("diku", "http://okapi:9130", format!("bad-token-{}", n));
            registry.resolve(key).await.err().expect("must fail");
        }
        assert_eq!(registry.len().await, 0);
        assert_eq!(registry.sessions.read().await.len(), 0);
    }

    #[tokio::test]
    async fn concurrent_failures_on_one_key_leave_no_entry() {
        let registry = SessionRegistry::new(
            Arc::new(RefusingConnector),
            settings(),
            Some(env_credentials()),
        );
        let key = SessionKey::new("diku", "http://okapi:9130", "token");

        let (a, b) = tokio::join!(registry.resolve(key.clone()), registry.resolve(key.clone()));
        assert!(a.is_err() && b.is_err());
        assert_eq!(registry.sessions.read().await.len(), 0);
    }

    #[tokio::test]
    async fn unreachable_settings_service_is_no_db_config() {
        let registry = SessionRegistry::new(counting(ldp_db()), settings(), None);
        // Nothing listens on port 9 locally, so the settings lookup fails.
        let key = SessionKey::new("diku", "http://127.0.0.1:9", "token");

        let err = registry.resolve(key).await.err().expect("must fail");
        assert_eq!(err.kind, ErrorKind::NoDbConfig);
    }

    async fn spawn_mock_settings(
        body: serde_json::Value,
    ) -> (SocketAddr, oneshot::Sender<()>, tokio::task::JoinHandle<()>) {
        async fn entries(
            State(body): State<serde_json::Value>,
            headers: HeaderMap,
        ) -> Json<serde_json::Value> {
            let token_ok = headers
                .get("x-okapi-token")
                .and_then(|v| v.to_str().ok())
                == Some("tenant-token");
            if token_ok {
                Json(body)
            } else {
                Json(serde_json::json!({ "items": [] }))
            }
        }

        let app = Router::new()
            .route("/settings/entries", get(entries))
            .with_state(body);

        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind should succeed");
        let addr = listener.local_addr().expect("local_addr should succeed");

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let handle = tokio::spawn(async move {
            let _ = axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                })
                .await;
        });

        (addr, shutdown_tx, handle)
    }

    #[tokio::test]
    async fn tenant_settings_supply_credentials_without_environment() {
        let (addr, shutdown_tx, handle) = spawn_mock_settings(serde_json::json!({
            "items": [{
                "value": {
                    "url": "postgres://ldp.example.com:5432/ldp",
                    "user": "ldpreport",
                    "pass": "tenant-secret"
                }
            }]
        }))
        .await;

        let connector = counting(ldp_db());
        let registry = SessionRegistry::new(connector.clone(), settings(), None);
        let session = registry
            .resolve(SessionKey::new("diku", format!("http://{}", addr), "tenant-token"))
            .await
            .expect("resolve");
        assert_eq!(session.dialect, Dialect::Ldp);
        assert_eq!(
            connector.seen.lock().expect("lock").as_slice(),
            &[DbCredentials {
                url: "postgres://ldp.example.com:5432/ldp".to_string(),
                user: "ldpreport".to_string(),
                pass: "tenant-secret".to_string(),
            }]
        );

        let _ = shutdown_tx.send(());
        let _ = handle.await;
    }

    #[tokio::test]
    async fn empty_tenant_settings_are_no_db_config() {
        let (addr, shutdown_tx, handle) =
            spawn_mock_settings(serde_json::json!({ "items": [] })).await;

        let connector = counting(ldp_db());
        let registry = SessionRegistry::new(connector.clone(), settings(), None);
        let err = registry
            .resolve(SessionKey::new("diku", format!("http://{}", addr), "tenant-token"))
            .await
            .err()
            .expect("must fail");
        assert_eq!(err.kind, ErrorKind::NoDbConfig);
        assert_eq!(connector.connects.load(Ordering::SeqCst), 0);
        assert_eq!(registry.sessions.read().await.len(), 0);

        let _ = shutdown_tx.send(());
        let _ = handle.await;
    }

    #[tokio::test]
    async fn probe_failure_surfaces_as_introspection_error() {
        let connector = counting(MemoryDb::new().on_query("dbsystem", Err("boom")));
        let registry = SessionRegistry::new(connector, settings(), Some(env_credentials()));

        let err = registry
            .resolve(SessionKey::new("t", "u", "k"))
            .await
            .err()
            .expect("must fail");
        assert_eq!(err.kind, ErrorKind::IntrospectionError);
    }

    #[test]
    fn log_id_hides_the_token() {
        let key = SessionKey::new("diku", "http://okapi:9130", "secret-token");
        let id = key.log_id();
        assert_eq!(id.len(), 16);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(id, SessionKey::new("diku", "http://okapi:9130", "other").log_id());
        assert!(!format!("{:?}", key).contains("secret-token"));
    }
}
