use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use regex::Regex;
use reporting_db::PoolSettings;

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub bind_addr: SocketAddr,
    pub query_timeout_secs: u64,
    pub report_url_whitelist: Vec<Regex>,
    pub report_file_root: PathBuf,
    pub settings_timeout_ms: u64,
    pub report_fetch_timeout_ms: u64,
    pub db_max_connections: u32,
    pub db_connect_timeout_ms: u64,
    pub db_credentials: Option<DbCredentials>,
}

/// Connection details for a reporting database.
#[derive(Clone, PartialEq, Eq)]
pub struct DbCredentials {
    pub url: String,
    pub user: String,
    pub pass: String,
}

impl std::fmt::Debug for DbCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DbCredentials")
            .field("url", &self.url)
            .field("user", &self.user)
            .field("pass", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartupError {
    pub code: &'static str,
    pub message: String,
}

impl std::fmt::Display for StartupError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for StartupError {}

impl GatewayConfig {
    pub fn load() -> Result<Self, StartupError> {
        let mut merged = HashMap::new();

        if let Ok(config_path) = std::env::var("REPORTING_CONFIG_PATH") {
            let config_path = config_path.trim();
            if !config_path.is_empty() {
                let file_kv = parse_env_file(config_path)?;
                merged.extend(file_kv);
            }
        }

        merged.extend(std::env::vars());

        Self::from_kv(&merged)
    }

    pub fn from_kv(kv: &HashMap<String, String>) -> Result<Self, StartupError> {
        let bind_addr = parse_socket_addr(
            kv.get("REPORTING_BIND_ADDR"),
            SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 12369),
            "REPORTING_BIND_ADDR",
        )?;

        let timeout_value = kv
            .get("REPORTING_QUERY_TIMEOUT_SECS")
            .filter(|v| !v.trim().is_empty())
            .or_else(|| kv.get("MOD_REPORTING_QUERY_TIMEOUT"));
        let query_timeout_secs =
            parse_u64(timeout_value, 60, "REPORTING_QUERY_TIMEOUT_SECS")?;
        if query_timeout_secs == 0 {
            return Err(StartupError {
                code: "ERR_INVALID_CONFIG",
                message: "REPORTING_QUERY_TIMEOUT_SECS must be >= 1".to_string(),
            });
        }

        let report_url_whitelist = parse_whitelist(kv.get("REPORTING_REPORT_URL_WHITELIST"))?;

        let report_file_root: PathBuf = kv
            .get("REPORTING_FILE_ROOT")
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .unwrap_or(".")
            .into();

        let settings_timeout_ms = parse_positive_u64(
            kv.get("REPORTING_SETTINGS_TIMEOUT_MS"),
            5000,
            "REPORTING_SETTINGS_TIMEOUT_MS",
        )?;
        let report_fetch_timeout_ms = parse_positive_u64(
            kv.get("REPORTING_REPORT_FETCH_TIMEOUT_MS"),
            30_000,
            "REPORTING_REPORT_FETCH_TIMEOUT_MS",
        )?;

        let db_max_connections = parse_u32(
            kv.get("REPORTING_DB_MAX_CONNECTIONS"),
            4,
            "REPORTING_DB_MAX_CONNECTIONS",
        )?;
        if db_max_connections == 0 {
            return Err(StartupError {
                code: "ERR_INVALID_CONFIG",
                message: "REPORTING_DB_MAX_CONNECTIONS must be >= 1".to_string(),
            });
        }
        let db_connect_timeout_ms = parse_positive_u64(
            kv.get("REPORTING_DB_CONNECT_TIMEOUT_MS"),
            5000,
            "REPORTING_DB_CONNECT_TIMEOUT_MS",
        )?;

        let db_credentials = parse_db_credentials(kv);

        Ok(Self {
            bind_addr,
            query_timeout_secs,
            report_url_whitelist,
            report_file_root,
            settings_timeout_ms,
            report_fetch_timeout_ms,
            db_max_connections,
            db_connect_timeout_ms,
            db_credentials,
        })
    }

    pub fn query_timeout(&self) -> Duration {
        Duration::from_secs(self.query_timeout_secs)
    }

    pub fn pool_settings(&self) -> PoolSettings {
        PoolSettings {
            max_connections: self.db_max_connections,
            connect_timeout: Duration::from_millis(self.db_connect_timeout_ms),
            query_timeout: self.query_timeout(),
        }
    }
}

fn parse_env_file(path: &str) -> Result<HashMap<String, String>, StartupError> {
    let contents = std::fs::read_to_string(path).map_err(|_| StartupError {
        code: "ERR_CONFIG_FILE_READ",
        message: format!("failed to read config file at {}", path),
    })?;

    let mut kv = HashMap::new();

    for (idx, raw_line) in contents.lines().enumerate() {
        let line = raw_line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let (key, value) = line.split_once('=').ok_or_else(|| StartupError {
            code: "ERR_CONFIG_FILE_PARSE",
            message: format!("invalid config line {} (expected KEY=VALUE)", idx + 1),
        })?;

        let key = key.trim();
        if key.is_empty() {
            return Err(StartupError {
                code: "ERR_CONFIG_FILE_PARSE",
                message: format!("invalid config line {} (empty key)", idx + 1),
            });
        }

        kv.insert(key.to_string(), strip_quotes(value.trim()));
    }

    Ok(kv)
}

fn strip_quotes(s: &str) -> String {
    let bytes = s.as_bytes();
    if bytes.len() >= 2 {
        let first = bytes[0];
        let last = bytes[bytes.len() - 1];
        if (first == b'"' && last == b'"') || (first == b'\'' && last == b'\'') {
            return s[1..bytes.len() - 1].to_string();
        }
    }
    s.to_string()
}

fn parse_whitelist(value: Option<&String>) -> Result<Vec<Regex>, StartupError> {
    let Some(value) = value else {
        return Ok(Vec::new());
    };

    value
        .split_whitespace()
        .map(|pattern| {
            Regex::new(pattern).map_err(|err| StartupError {
                code: "ERR_INVALID_CONFIG",
                message: format!(
                    "REPORTING_REPORT_URL_WHITELIST entry {} is not a valid regex: {}",
                    pattern, err
                ),
            })
        })
        .collect()
}

/// Environment credentials are used only when all three values are present.
fn parse_db_credentials(kv: &HashMap<String, String>) -> Option<DbCredentials> {
    let get = |key: &str| {
        kv.get(key)
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .map(|s| s.to_string())
    };

    Some(DbCredentials {
        url: get("REPORTING_DB_URL")?,
        user: get("REPORTING_DB_USER")?,
        pass: get("REPORTING_DB_PASS")?,
    })
}

fn parse_socket_addr(
    value: Option<&String>,
    default: SocketAddr,
    key: &'static str,
) -> Result<SocketAddr, StartupError> {
    match value {
        None => Ok(default),
        Some(v) if v.trim().is_empty() => Ok(default),
        Some(v) => v.trim().parse::<SocketAddr>().map_err(|_| StartupError {
            code: "ERR_INVALID_CONFIG",
            message: format!("{} must be a valid host:port socket address", key),
        }),
    }
}

fn parse_u64(value: Option<&String>, default: u64, key: &'static str) -> Result<u64, StartupError> {
    match value {
        None => Ok(default),
        Some(v) if v.trim().is_empty() => Ok(default),
        Some(v) => v.trim().parse::<u64>().map_err(|_| StartupError {
            code: "ERR_INVALID_CONFIG",
            message: format!("{} must be an integer", key),
        }),
    }
}

fn parse_positive_u64(
    value: Option<&String>,
    default: u64,
    key: &'static str,
) -> Result<u64, StartupError> {
    let parsed = parse_u64(value, default, key)?;
    if parsed == 0 {
        return Err(StartupError {
            code: "ERR_INVALID_CONFIG",
            message: format!("{} must be >= 1", key),
        });
    }
    Ok(parsed)
}

fn parse_u32(value: Option<&String>, default: u32, key: &'static str) -> Result<u32, StartupError> {
    match value {
        None => Ok(default),
        Some(v) if v.trim().is_empty() => Ok(default),
        Some(v) => v.trim().parse::<u32>().map_err(|_| StartupError {
            code: "ERR_INVALID_CONFIG",
            message: format!("{} must be an integer", key),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn empty_environment_uses_defaults() {
        let config = GatewayConfig::from_kv(&HashMap::new()).expect("defaults should load");
        assert_eq!(config.bind_addr, "127.0.0.1:12369".parse::<SocketAddr>().unwrap());
        assert_eq!(config.query_timeout(), Duration::from_secs(60));
        assert!(config.report_url_whitelist.is_empty());
        assert_eq!(config.report_file_root, PathBuf::from("."));
        assert_eq!(config.db_max_connections, 4);
        assert!(config.db_credentials.is_none());
    }

    #[test]
    fn legacy_timeout_key_is_honoured() {
        let config = GatewayConfig::from_kv(&env(&[("MOD_REPORTING_QUERY_TIMEOUT", "15")]))
            .expect("config should load");
        assert_eq!(config.query_timeout_secs, 15);

        let config = GatewayConfig::from_kv(&env(&[
            ("MOD_REPORTING_QUERY_TIMEOUT", "15"),
            ("REPORTING_QUERY_TIMEOUT_SECS", "30"),
        ]))
        .expect("config should load");
        assert_eq!(config.query_timeout_secs, 30);
    }

    #[test]
    fn zero_query_timeout_fails() {
        let err = GatewayConfig::from_kv(&env(&[("REPORTING_QUERY_TIMEOUT_SECS", "0")]))
            .unwrap_err();
        assert_eq!(err.code, "ERR_INVALID_CONFIG");

        let err = GatewayConfig::from_kv(&env(&[("REPORTING_SETTINGS_TIMEOUT_MS", "0")]))
            .unwrap_err();
        assert_eq!(err.code, "ERR_INVALID_CONFIG");
    }

    #[test]
    fn whitelist_entries_are_compiled_in_order() {
        let config = GatewayConfig::from_kv(&env(&[(
            "REPORTING_REPORT_URL_WHITELIST",
            "^https://raw\\.githubusercontent\\.com/folio-org/  ^https://gitlab\\.com/",
        )]))
        .expect("config should load");
        let patterns: Vec<&str> = config
            .report_url_whitelist
            .iter()
            .map(|r| r.as_str())
            .collect();
        assert_eq!(
            patterns,
            vec![
                "^https://raw\\.githubusercontent\\.com/folio-org/",
                "^https://gitlab\\.com/"
            ]
        );
    }

    #[test]
    fn invalid_whitelist_regex_fails() {
        let err = GatewayConfig::from_kv(&env(&[("REPORTING_REPORT_URL_WHITELIST", "^https://(")]))
            .unwrap_err();
        assert_eq!(err.code, "ERR_INVALID_CONFIG");
        assert!(err.message.contains("REPORTING_REPORT_URL_WHITELIST"));
    }

    #[test]
    fn db_credentials_need_all_three_values() {
        let config = GatewayConfig::from_kv(&env(&[
            ("REPORTING_DB_URL", "postgres://metadb.example.com:12345/db"),
            ("REPORTING_DB_USER", "mike"),
            ("REPORTING_DB_PASS", "swordfish"),
        ]))
        .expect("config should load");
        let creds = config.db_credentials.expect("credentials");
        assert_eq!(creds.user, "mike");
        assert!(!format!("{:?}", creds).contains("swordfish"));

        let config = GatewayConfig::from_kv(&env(&[
            ("REPORTING_DB_URL", "postgres://metadb.example.com:12345/db"),
            ("REPORTING_DB_USER", "mike"),
            ("REPORTING_DB_PASS", ""),
        ]))
        .expect("config should load");
        assert!(config.db_credentials.is_none());
    }

    #[test]
    fn env_file_lines_are_parsed() {
        let path = std::env::temp_dir().join(format!(
            "reporting-config-{}-{}.env",
            std::process::id(),
            ulid::Ulid::new()
        ));
        std::fs::write(
            &path,
            "# comment\nREPORTING_BIND_ADDR = \"0.0.0.0:9000\"\n\nREPORTING_FILE_ROOT='reports'\n",
        )
        .expect("write temp config");

        let kv = parse_env_file(path.to_str().expect("utf-8 path")).expect("parse");
        assert_eq!(kv.get("REPORTING_BIND_ADDR").map(String::as_str), Some("0.0.0.0:9000"));
        assert_eq!(kv.get("REPORTING_FILE_ROOT").map(String::as_str), Some("reports"));

        std::fs::write(&path, "NOT A PAIR\n").expect("write temp config");
        let err = parse_env_file(path.to_str().expect("utf-8 path")).unwrap_err();
        assert_eq!(err.code, "ERR_CONFIG_FILE_PARSE");

        let _ = std::fs::remove_file(&path);
    }
}
