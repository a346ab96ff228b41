use std::time::Duration;

use reporting_contracts::{
    ColumnDescriptor, DbProcess, DbVersion, LogEntry, OrderedRow, ReportRequest, ReportResponse,
    TableQuery, TableRef, TableUpdate,
};
use reporting_db::{ErrorKind, ReportingError, introspect, query, report};

use crate::columns::ColumnCache;
use crate::report_source::ReportSource;
use crate::sessions::Session;

/// The reporting operations, each run against an already resolved session.
#[derive(Clone)]
pub struct Reporting {
    columns: ColumnCache,
    reports: ReportSource,
    query_timeout: Duration,
}

impl Reporting {
    pub fn new(columns: ColumnCache, reports: ReportSource, query_timeout: Duration) -> Self {
        Self {
            columns,
            reports,
            query_timeout,
        }
    }

    pub fn column_cache(&self) -> &ColumnCache {
        &self.columns
    }

    pub async fn tables(&self, session: &Session) -> Result<Vec<TableRef>, ReportingError> {
        introspect::list_tables(session.db.as_ref(), session.dialect).await
    }

    pub async fn columns(
        &self,
        session: &Session,
        schema: &str,
        table: &str,
    ) -> Result<Vec<ColumnDescriptor>, ReportingError> {
        if schema.is_empty() || table.is_empty() {
            return Err(ReportingError::new(
                ErrorKind::InvalidQuery,
                "must specify both schema and table",
            ));
        }
        let columns = self.columns.get_columns(session, schema, table).await?;
        Ok(columns.as_ref().clone())
    }

    pub async fn query(
        &self,
        session: &Session,
        request: &TableQuery,
    ) -> Result<Vec<OrderedRow>, ReportingError> {
        let table = query::single_table(request)?;
        let columns = self
            .columns
            .get_columns(session, &table.schema, &table.table_name)
            .await
            .map_err(|err| {
                err.context(format!(
                    "could not obtain columns for {}.{}",
                    table.schema, table.table_name
                ))
            })?;

        let compiled = query::compile(request, &columns)?;
        tracing::info!(
            session_id = %session.log_id,
            schema = %table.schema,
            table = %table.table_name,
            sql = %compiled.sql,
            param_count = compiled.params.len(),
            "running table query"
        );

        let rows = session
            .db
            .query(&compiled.sql, &compiled.params)
            .await
            .map_err(|err| err.into_reporting(ErrorKind::ExecutionError, "could not execute SQL"))?;
        Ok(rows.into_ordered())
    }

    pub async fn report(
        &self,
        session: &Session,
        request: &ReportRequest,
    ) -> Result<ReportResponse, ReportingError> {
        let result = self.run_report(session, request).await;
        let outcome = match &result {
            Ok(_) => "ok",
            Err(err) => err.code(),
        };
        crate::metrics::observe_report_run(outcome);
        result
    }

    async fn run_report(
        &self,
        session: &Session,
        request: &ReportRequest,
    ) -> Result<ReportResponse, ReportingError> {
        let script = self.reports.load(&request.url).await?;
        let prepared =
            report::prepare_report(&script, session.dialect, &request.params, request.limit)?;
        tracing::info!(
            session_id = %session.log_id,
            url = %request.url,
            function = %prepared.marker.function,
            "report script accepted"
        );

        let rows = report::run_report(session.db.as_ref(), &prepared, self.query_timeout).await?;
        Ok(ReportResponse::from_records(rows.into_ordered()))
    }

    pub async fn logs(&self, session: &Session) -> Result<Vec<LogEntry>, ReportingError> {
        introspect::fetch_logs(session.db.as_ref(), session.dialect).await
    }

    pub async fn version(&self, session: &Session) -> Result<DbVersion, ReportingError> {
        introspect::fetch_version(session.db.as_ref(), session.dialect).await
    }

    pub async fn updates(&self, session: &Session) -> Result<Vec<TableUpdate>, ReportingError> {
        introspect::fetch_updates(session.db.as_ref(), session.dialect).await
    }

    pub async fn processes(&self, session: &Session) -> Result<Vec<DbProcess>, ReportingError> {
        introspect::fetch_processes(session.db.as_ref(), session.dialect).await
    }
}
