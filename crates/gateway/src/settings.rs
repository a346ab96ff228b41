use std::time::Duration;

use serde::Deserialize;

use crate::config::DbCredentials;

/// Settings-store query selecting the reporting database entry.
pub const DBINFO_QUERY: &str = r#"scope=="ui-ldp.admin" and key=="dbinfo""#;

#[derive(Debug)]
pub enum SettingsError {
    Timeout,
    Http(reqwest::Error),
    BadStatus(reqwest::StatusCode),
    InvalidResponse(String),
}

impl std::fmt::Display for SettingsError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SettingsError::Timeout => write!(f, "settings request timed out"),
            SettingsError::Http(err) => write!(f, "settings HTTP error: {}", err),
            SettingsError::BadStatus(status) => {
                write!(f, "settings service returned status {}", status)
            }
            SettingsError::InvalidResponse(reason) => {
                write!(f, "settings service returned invalid response: {}", reason)
            }
        }
    }
}

impl std::error::Error for SettingsError {}

impl From<reqwest::Error> for SettingsError {
    fn from(value: reqwest::Error) -> Self {
        if value.is_timeout() {
            SettingsError::Timeout
        } else {
            SettingsError::Http(value)
        }
    }
}

#[derive(Deserialize)]
struct SettingsEntries {
    #[serde(default)]
    items: Vec<SettingsItem>,
}

#[derive(Deserialize)]
struct SettingsItem {
    #[serde(default)]
    value: serde_json::Value,
}

#[derive(Deserialize)]
struct StoredDbInfo {
    #[serde(default)]
    url: String,
    #[serde(default)]
    user: String,
    #[serde(default)]
    pass: String,
}

/// Client for the tenant key/value settings service behind the gateway URL.
#[derive(Clone)]
pub struct SettingsClient {
    http: reqwest::Client,
}

impl SettingsClient {
    pub fn new(timeout: Duration) -> Result<Self, SettingsError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(SettingsError::Http)?;
        Ok(Self { http })
    }

    /// Looks up the stored reporting database credentials for a tenant.
    ///
    /// Returns `Ok(None)` when the tenant has no `dbinfo` entry.
    pub async fn fetch_db_credentials(
        &self,
        gateway_url: &str,
        tenant: &str,
        token: &str,
    ) -> Result<Option<DbCredentials>, SettingsError> {
        let url = format!("{}/settings/entries", gateway_url.trim_end_matches('/'));
        let resp = self
            .http
            .get(url)
            .query(&[("query", DBINFO_QUERY)])
            .header("X-Okapi-Tenant", tenant)
            .header("X-Okapi-Token", token)
            .send()
            .await?;

        if !resp.status().is_success() {
            return Err(SettingsError::BadStatus(resp.status()));
        }

        let entries = resp
            .json::<SettingsEntries>()
            .await
            .map_err(|err| SettingsError::InvalidResponse(err.to_string()))?;

        let Some(item) = entries.items.into_iter().next() else {
            return Ok(None);
        };

        parse_db_info(item.value).map(Some)
    }
}

/// The stored value is either an object or a string holding its JSON.
fn parse_db_info(value: serde_json::Value) -> Result<DbCredentials, SettingsError> {
    let value = match value {
        serde_json::Value::String(raw) => serde_json::from_str(&raw)
            .map_err(|err| SettingsError::InvalidResponse(format!("dbinfo value: {}", err)))?,
        other => other,
    };

    let info: StoredDbInfo = serde_json::from_value(value)
        .map_err(|err| SettingsError::InvalidResponse(format!("dbinfo value: {}", err)))?;

    Ok(DbCredentials {
        url: info.url,
        user: info.user,
        pass: info.pass,
    })
}
