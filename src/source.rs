//! Identifier sources.
//!
//! A source produces the full, ordered list of item identifiers for one run.
//! Any failure here is fatal: without the list no chunk can be computed.

use crate::dispatch::WorkItem;
use crate::error::{DispatchError, Result};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, instrument};

/// Timeout for fetching identifiers over HTTP.
pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(30);

/// Supplies the ordered item list.
#[allow(async_fn_in_trait)]
pub trait IdentifierSource {
    async fn fetch(&self) -> Result<Vec<WorkItem>>;
}

/// Identifiers from a local file.
///
/// Accepts a JSON array (`["A", "B", 17]`) or one identifier per line, with
/// blank lines and `#` comments ignored.
#[derive(Debug, Clone)]
pub struct FileSource {
    path: PathBuf,
}

impl FileSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl IdentifierSource for FileSource {
    #[instrument(level = "debug", skip(self), fields(path = %self.path.display()))]
    async fn fetch(&self) -> Result<Vec<WorkItem>> {
        let content = tokio::fs::read_to_string(&self.path).await.map_err(|e| {
            DispatchError::Source(format!("cannot read {}: {}", self.path.display(), e))
        })?;
        let items = parse_identifiers(&content)?;
        debug!(count = items.len(), "Loaded identifiers");
        Ok(items)
    }
}

/// Identifiers from an HTTP endpoint returning a JSON array.
#[derive(Debug, Clone)]
pub struct HttpSource {
    url: String,
    timeout: Duration,
}

impl HttpSource {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            timeout: DEFAULT_FETCH_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

impl IdentifierSource for HttpSource {
    #[instrument(level = "debug", skip(self), fields(url = %self.url))]
    async fn fetch(&self) -> Result<Vec<WorkItem>> {
        let client = reqwest::Client::builder().timeout(self.timeout).build()?;
        let response = client.get(&self.url).send().await?;

        if !response.status().is_success() {
            return Err(DispatchError::Source(format!(
                "{} returned HTTP {}",
                self.url,
                response.status()
            )));
        }

        let body = response.text().await?;
        let items: Vec<WorkItem> = serde_json::from_str(&body).map_err(|e| {
            DispatchError::Source(format!("{} did not return a JSON array of ids: {}", self.url, e))
        })?;
        debug!(count = items.len(), "Fetched identifiers");
        Ok(items)
    }
}

/// Identifiers given directly on the command line.
#[derive(Debug, Clone, Default)]
pub struct StaticSource {
    items: Vec<WorkItem>,
}

impl StaticSource {
    pub fn new<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            items: ids.into_iter().map(WorkItem::new).collect(),
        }
    }
}

impl IdentifierSource for StaticSource {
    async fn fetch(&self) -> Result<Vec<WorkItem>> {
        Ok(self.items.clone())
    }
}

/// The source selected on the command line.
#[derive(Debug, Clone)]
pub enum Source {
    File(FileSource),
    Http(HttpSource),
    Static(StaticSource),
}

impl IdentifierSource for Source {
    async fn fetch(&self) -> Result<Vec<WorkItem>> {
        match self {
            Self::File(source) => source.fetch().await,
            Self::Http(source) => source.fetch().await,
            Self::Static(source) => source.fetch().await,
        }
    }
}

/// Parse a JSON array or a newline-separated list of identifiers.
pub fn parse_identifiers(content: &str) -> Result<Vec<WorkItem>> {
    let trimmed = content.trim_start();
    if trimmed.starts_with('[') {
        return serde_json::from_str(trimmed)
            .map_err(|e| DispatchError::Source(format!("invalid identifier array: {}", e)));
    }

    Ok(content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(WorkItem::new)
        .collect())
}
