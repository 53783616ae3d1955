//! Fetches the raw resource text of a source.

use std::path::{Path, PathBuf};
use std::time::Duration;

use reqwest::Url;

use crate::config::SourceConfig;
use crate::error::ResourceError;
use crate::resource::ProxyIp;

const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(30);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Where a source's `load_url` points.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadSource {
    /// `http://` or `https://` endpoint of the supplier.
    Http(Url),
    File(PathBuf),
    /// The configured string is the resource list itself.
    Inline(String),
}

impl LoadSource {
    pub fn detect(load_url: &str) -> Result<Self, ResourceError> {
        let url = load_url.trim();
        let lower = url.to_ascii_lowercase();
        if lower.starts_with("http://") || lower.starts_with("https://") {
            let parsed = Url::parse(url).map_err(|_| ResourceError::Url(url.to_string()))?;
            if parsed.host_str().is_none() {
                return Err(ResourceError::Url(url.to_string()));
            }
            return Ok(LoadSource::Http(parsed));
        }
        let path = Path::new(url);
        if !url.contains(['\n', ',']) && path.is_file() {
            return Ok(LoadSource::File(path.to_path_buf()));
        }
        Ok(LoadSource::Inline(url.to_string()))
    }

    pub async fn fetch(&self) -> Result<String, ResourceError> {
        match self {
            LoadSource::Http(url) => fetch_http(url).await,
            LoadSource::File(path) => Ok(tokio::fs::read_to_string(path).await?),
            LoadSource::Inline(text) => Ok(text.clone()),
        }
    }
}

/// Downloads and parses the resource list of `config`.
pub async fn load(config: &SourceConfig) -> Result<Vec<ProxyIp>, ResourceError> {
    let text = LoadSource::detect(&config.load_url)?.fetch().await?;
    config.resource_format.parse(&text)
}

async fn fetch_http(url: &Url) -> Result<String, ResourceError> {
    // supplier APIs are reached directly, never through the environment's proxy
    let client = reqwest::Client::builder()
        .timeout(DOWNLOAD_TIMEOUT)
        .connect_timeout(CONNECT_TIMEOUT)
        .no_proxy()
        .build()?;

    let response = client.get(url.clone()).send().await.map_err(|err| {
        if err.is_timeout() {
            ResourceError::Download(format!("{} timed out", url))
        } else {
            ResourceError::Http(err)
        }
    })?;
    if !response.status().is_success() {
        return Err(ResourceError::Status(response.status()));
    }
    Ok(response.text().await?)
}
