use std::path::{Path, PathBuf};
use std::time::Duration;

use regex::Regex;
use reporting_db::{ErrorKind, ReportingError};

/// Decides which report URLs may be loaded and fetches their SQL.
#[derive(Clone)]
pub struct ReportSource {
    whitelist: Vec<Regex>,
    file_root: PathBuf,
    http: reqwest::Client,
}

impl ReportSource {
    pub fn new(
        whitelist: Vec<Regex>,
        file_root: PathBuf,
        fetch_timeout: Duration,
    ) -> Result<Self, reqwest::Error> {
        let http = reqwest::Client::builder().timeout(fetch_timeout).build()?;
        Ok(Self {
            whitelist,
            file_root,
            http,
        })
    }

    /// Accepts `url` if the whitelist is empty or any pattern matches it.
    pub fn check_whitelist(&self, url: &str) -> Result<(), ReportingError> {
        if self.whitelist.is_empty() {
            tracing::info!(url = %url, "no report URL whitelist configured; accepting");
            return Ok(());
        }

        if let Some(pattern) = self.whitelist.iter().find(|re| re.is_match(url)) {
            tracing::info!(url = %url, pattern = %pattern.as_str(), "report URL matched whitelist");
            return Ok(());
        }

        Err(ReportingError::new(
            ErrorKind::WhitelistRejected,
            format!(
                "query may not be loaded from {}: report URL did not match any whitelist regular expression",
                url
            ),
        ))
    }

    pub async fn fetch(&self, url: &str) -> Result<String, ReportingError> {
        let scheme = url::Url::parse(url)
            .map(|parsed| parsed.scheme().to_string())
            .unwrap_or_default();

        match scheme.as_str() {
            "http" | "https" => self.fetch_http(url).await,
            "file" => self.read_file(url).await,
            _ => Err(fetch_error(url, "unsupported protocol scheme")),
        }
    }

    /// Whitelist check followed by fetch.
    pub async fn load(&self, url: &str) -> Result<String, ReportingError> {
        self.check_whitelist(url)?;
        self.fetch(url).await
    }

    async fn fetch_http(&self, url: &str) -> Result<String, ReportingError> {
        let resp = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|err| fetch_error(url, err))?;

        let status = resp.status();
        if status != reqwest::StatusCode::OK {
            return Err(fetch_error(url, status));
        }

        resp.text().await.map_err(|err| {
            ReportingError::new(
                ErrorKind::FetchError,
                format!("could not read report: {}", err),
            )
        })
    }

    async fn read_file(&self, url: &str) -> Result<String, ReportingError> {
        let raw = url.strip_prefix("file://").unwrap_or_default();
        let rel = Path::new(raw);
        if raw.is_empty() || !is_safe_rel_path(rel) {
            return Err(fetch_error(
                url,
                "file reports must name a relative path without '..'",
            ));
        }

        tokio::fs::read_to_string(self.file_root.join(rel))
            .await
            .map_err(|err| fetch_error(url, err))
    }
}

fn fetch_error(url: &str, reason: impl std::fmt::Display) -> ReportingError {
    ReportingError::new(
        ErrorKind::FetchError,
        format!("could not fetch report from {}: {}", url, reason),
    )
}

fn is_safe_rel_path(path: &Path) -> bool {
    use std::path::Component;
    path.components().all(|c| match c {
        Component::Normal(_) => true,
        Component::CurDir => true,
        Component::ParentDir => false,
        Component::RootDir => false,
        Component::Prefix(_) => false,
    })
}
