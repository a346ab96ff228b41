use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    InvalidQuery,
    UnknownColumn,
    InvalidValue,
    IntrospectionError,
    NoDbConfig,
    ConnectionError,
    WhitelistRejected,
    FetchError,
    MalformedScript,
    DialectMismatch,
    RegistrationError,
    ExecutionError,
    UnsupportedOnDialect,
}

impl ErrorKind {
    pub fn code(self) -> &'static str {
        match self {
            ErrorKind::InvalidQuery => "ERR_INVALID_QUERY",
            ErrorKind::UnknownColumn => "ERR_UNKNOWN_COLUMN",
            ErrorKind::InvalidValue => "ERR_INVALID_VALUE",
            ErrorKind::IntrospectionError => "ERR_INTROSPECTION",
            ErrorKind::NoDbConfig => "ERR_NO_DB_CONFIG",
            ErrorKind::ConnectionError => "ERR_DB_CONNECTION",
            ErrorKind::WhitelistRejected => "ERR_WHITELIST_REJECTED",
            ErrorKind::FetchError => "ERR_REPORT_FETCH",
            ErrorKind::MalformedScript => "ERR_MALFORMED_SCRIPT",
            ErrorKind::DialectMismatch => "ERR_DIALECT_MISMATCH",
            ErrorKind::RegistrationError => "ERR_REPORT_REGISTRATION",
            ErrorKind::ExecutionError => "ERR_EXECUTION",
            ErrorKind::UnsupportedOnDialect => "ERR_UNSUPPORTED_ON_DIALECT",
        }
    }

    /// HTTP status the request boundary should answer with.
    pub fn http_status(self) -> u16 {
        match self {
            ErrorKind::UnsupportedOnDialect => 501,
            _ => 500,
        }
    }
}

/// Error surfaced by every core operation, carrying an actionable message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportingError {
    pub kind: ErrorKind,
    pub message: String,
}

impl ReportingError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn code(&self) -> &'static str {
        self.kind.code()
    }

    pub fn http_status(&self) -> u16 {
        self.kind.http_status()
    }

    /// Prefixes the message with the calling operation's context.
    pub fn context(mut self, context: impl std::fmt::Display) -> Self {
        self.message = format!("{}: {}", context, self.message);
        self
    }
}

impl std::fmt::Display for ReportingError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for ReportingError {}

#[derive(Debug)]
pub enum DbError {
    Timeout(Duration),
    Sqlx(sqlx::Error),
    Decode(String),
    Backend(String),
}

impl DbError {
    /// Wraps this failure as a `ReportingError` of the given kind.
    pub fn into_reporting(self, kind: ErrorKind, context: impl std::fmt::Display) -> ReportingError {
        ReportingError::new(kind, format!("{}: {}", context, self))
    }
}

impl std::fmt::Display for DbError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DbError::Timeout(limit) => write!(
                f,
                "database operation timed out after {}ms",
                limit.as_millis()
            ),
            DbError::Sqlx(err) => write!(f, "{}", err),
            DbError::Decode(msg) => write!(f, "could not decode result value: {}", msg),
            DbError::Backend(msg) => f.write_str(msg),
        }
    }
}

impl std::error::Error for DbError {}

impl From<sqlx::Error> for DbError {
    fn from(value: sqlx::Error) -> Self {
        DbError::Sqlx(value)
    }
}
