use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::http::{HeaderMap, HeaderValue, Method, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use reporting_contracts::{ReportRequest, TableQuery};
use reporting_db::{ErrorKind, ReportingError};
use serde::{Deserialize, Serialize};
use serde::de::DeserializeOwned;
use tracing::Instrument;

use crate::columns::ColumnCache;
use crate::config::{GatewayConfig, StartupError};
use crate::report_source::ReportSource;
use crate::reporting::Reporting;
use crate::sessions::{PgConnector, Session, SessionKey, SessionRegistry};
use crate::settings::SettingsClient;

const TENANT_HEADER: &str = "x-okapi-tenant";
const URL_HEADER: &str = "x-okapi-url";
const TOKEN_HEADER: &str = "x-okapi-token";

#[derive(Clone)]
pub struct AppState {
    sessions: SessionRegistry,
    reporting: Reporting,
}

impl AppState {
    pub fn new(sessions: SessionRegistry, reporting: Reporting) -> Self {
        Self {
            sessions,
            reporting,
        }
    }
}

pub fn router(config: GatewayConfig) -> Result<Router, StartupError> {
    let settings = SettingsClient::new(Duration::from_millis(config.settings_timeout_ms))
        .map_err(|err| StartupError {
            code: "ERR_HTTP_CLIENT",
            message: format!("failed to initialize settings client: {}", err),
        })?;

    let reports = ReportSource::new(
        config.report_url_whitelist.clone(),
        config.report_file_root.clone(),
        Duration::from_millis(config.report_fetch_timeout_ms),
    )
    .map_err(|err| StartupError {
        code: "ERR_HTTP_CLIENT",
        message: format!("failed to initialize report fetch client: {}", err),
    })?;

    let sessions = SessionRegistry::new(
        Arc::new(PgConnector::new(config.pool_settings())),
        settings,
        config.db_credentials.clone(),
    );
    let reporting = Reporting::new(ColumnCache::new(), reports, config.query_timeout());

    Ok(router_with_state(AppState::new(sessions, reporting)))
}

pub fn router_with_state(state: AppState) -> Router {
    Router::new()
        .route("/admin/health", get(health))
        .route("/metrics", get(metrics))
        .route("/ldp/db/tables", get(tables))
        .route("/ldp/db/columns", get(columns))
        .route("/ldp/db/query", post(query))
        .route("/ldp/db/reports", post(report))
        .route("/ldp/db/log", get(logs))
        .route("/ldp/db/version", get(version))
        .route("/ldp/db/updates", get(updates))
        .route("/ldp/db/processes", get(processes))
        .with_state(state)
}

async fn health() -> &'static str {
    "OK"
}

async fn metrics() -> impl IntoResponse {
    match crate::metrics::render() {
        Ok((body, content_type)) => {
            let mut headers = HeaderMap::new();
            if let Ok(value) = HeaderValue::from_str(content_type.as_str()) {
                headers.insert(header::CONTENT_TYPE, value);
            }
            (headers, body).into_response()
        }
        Err(_) => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
    }
}

async fn tables(State(state): State<AppState>, headers: HeaderMap) -> Response {
    handle(state, Method::GET, "/ldp/db/tables", &headers, |r, s| async move {
        r.tables(&s).await
    })
    .await
}

#[derive(Debug, Default, Deserialize)]
struct ColumnsParams {
    #[serde(default)]
    schema: String,
    #[serde(default)]
    table: String,
}

async fn columns(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<ColumnsParams>,
) -> Response {
    handle(state, Method::GET, "/ldp/db/columns", &headers, |r, s| async move {
        r.columns(&s, &params.schema, &params.table).await
    })
    .await
}

async fn query(State(state): State<AppState>, headers: HeaderMap, body: Bytes) -> Response {
    const ROUTE: &str = "/ldp/db/query";
    let request: TableQuery = match parse_body(&body) {
        Ok(request) => request,
        Err(err) => return reject(Method::POST, ROUTE, err),
    };
    handle(state, Method::POST, ROUTE, &headers, |r, s| async move {
        r.query(&s, &request).await
    })
    .await
}

async fn report(State(state): State<AppState>, headers: HeaderMap, body: Bytes) -> Response {
    const ROUTE: &str = "/ldp/db/reports";
    let request: ReportRequest = match parse_body(&body) {
        Ok(request) => request,
        Err(err) => return reject(Method::POST, ROUTE, err),
    };
    handle(state, Method::POST, ROUTE, &headers, |r, s| async move {
        r.report(&s, &request).await
    })
    .await
}

async fn logs(State(state): State<AppState>, headers: HeaderMap) -> Response {
    handle(state, Method::GET, "/ldp/db/log", &headers, |r, s| async move {
        r.logs(&s).await
    })
    .await
}

async fn version(State(state): State<AppState>, headers: HeaderMap) -> Response {
    handle(state, Method::GET, "/ldp/db/version", &headers, |r, s| async move {
        r.version(&s).await
    })
    .await
}

async fn updates(State(state): State<AppState>, headers: HeaderMap) -> Response {
    handle(state, Method::GET, "/ldp/db/updates", &headers, |r, s| async move {
        r.updates(&s).await
    })
    .await
}

async fn processes(State(state): State<AppState>, headers: HeaderMap) -> Response {
    handle(state, Method::GET, "/ldp/db/processes", &headers, |r, s| async move {
        r.processes(&s).await
    })
    .await
}

/// Resolves the caller's session, runs `op` inside a request span, and
/// renders either the JSON payload or the error as plain text.
async fn handle<T, F, Fut>(
    state: AppState,
    method: Method,
    route: &'static str,
    headers: &HeaderMap,
    op: F,
) -> Response
where
    T: Serialize,
    F: FnOnce(Reporting, Arc<Session>) -> Fut,
    Fut: Future<Output = Result<T, ReportingError>>,
{
    let key = session_key(headers);
    let span = tracing::info_span!(
        "reporting.request",
        route = route,
        method = %method,
        session_id = %key.log_id(),
        latency_ms = tracing::field::Empty,
        outcome = tracing::field::Empty,
    );
    let started = Instant::now();

    let result = async move {
        let outcome = match state.sessions.resolve(key).await {
            Ok(session) => op(state.reporting.clone(), session).await,
            Err(err) => Err(err),
        };

        let latency_ms = started.elapsed().as_millis() as u64;
        tracing::Span::current().record("latency_ms", latency_ms);
        match &outcome {
            Ok(_) => {
                tracing::Span::current().record("outcome", "ok");
            }
            Err(err) => {
                tracing::Span::current().record("outcome", err.code());
                tracing::error!(path = route, code = err.code(), error = %err.message, "request failed");
            }
        }
        outcome
    }
    .instrument(span)
    .await;

    let response = match result {
        Ok(payload) => Json(payload).into_response(),
        Err(err) => error_response(&err),
    };
    crate::metrics::observe_http_request(
        route,
        method.as_str(),
        response.status().as_u16(),
        started.elapsed(),
    );
    response
}

fn reject(method: Method, route: &'static str, err: ReportingError) -> Response {
    tracing::error!(path = route, code = err.code(), error = %err.message, "request rejected");
    let response = error_response(&err);
    crate::metrics::observe_http_request(
        route,
        method.as_str(),
        response.status().as_u16(),
        Duration::ZERO,
    );
    response
}

fn parse_body<T: DeserializeOwned>(body: &[u8]) -> Result<T, ReportingError> {
    serde_json::from_slice(body).map_err(|err| {
        ReportingError::new(
            ErrorKind::InvalidQuery,
            format!("could not deserialize JSON: {}", err),
        )
    })
}

fn error_response(err: &ReportingError) -> Response {
    let status =
        StatusCode::from_u16(err.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let mut headers = HeaderMap::new();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    (status, headers, err.message.clone()).into_response()
}

fn session_key(headers: &HeaderMap) -> SessionKey {
    SessionKey::new(
        header_text(headers, TENANT_HEADER),
        header_text(headers, URL_HEADER),
        header_text(headers, TOKEN_HEADER),
    )
}

fn header_text(headers: &HeaderMap, name: &str) -> String {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .to_string()
}
