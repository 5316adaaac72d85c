//! Source byte retrieval
//!
//! Locators are `http(s)://` URLs, `file://` URLs, base64 `data:` URLs or
//! plain filesystem paths. Every fetch is a single attempt, and no source
//! is buffered past `fetch.max_source_bytes`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use futures::StreamExt;
use reqwest::{Client, StatusCode};
use tokio::io::AsyncReadExt;
use tracing::debug;
use url::Url;

use crate::config::FetchConfig;
use crate::errors::FetchError;

#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Read the complete source behind `locator`.
    async fn fetch(&self, locator: &str) -> Result<Vec<u8>, FetchError>;
}

/// Where a locator points.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceLocation {
    Remote(Url),
    File(PathBuf),
    Inline(Vec<u8>),
}

/// Label used in errors instead of echoing an inline payload.
const INLINE_LABEL: &str = "<data URL>";

impl SourceLocation {
    /// `max_bytes` bounds inline payloads, which are decoded here.
    pub fn parse(locator: &str, max_bytes: u64) -> Result<Self, FetchError> {
        if let Some(rest) = locator.strip_prefix("data:") {
            return decode_data_url(locator, rest, max_bytes).map(Self::Inline);
        }

        match Url::parse(locator) {
            Ok(url) => match url.scheme() {
                "http" | "https" => Ok(Self::Remote(url)),
                "file" => url
                    .to_file_path()
                    .map(Self::File)
                    .map_err(|_| FetchError::invalid_source(locator, "not a local file path")),
                scheme => Err(FetchError::invalid_source(
                    locator,
                    format!("unsupported scheme '{}'", scheme),
                )),
            },
            Err(url::ParseError::RelativeUrlWithoutBase) => Ok(Self::File(PathBuf::from(locator))),
            Err(e) => Err(FetchError::invalid_source(locator, e.to_string())),
        }
    }
}

fn decode_data_url(locator: &str, rest: &str, max_bytes: u64) -> Result<Vec<u8>, FetchError> {
    let (header, payload) = rest
        .split_once(',')
        .ok_or_else(|| FetchError::invalid_source(locator, "data URL without payload"))?;

    if !header.split(';').any(|part| part.eq_ignore_ascii_case("base64")) {
        return Err(FetchError::invalid_source(
            locator,
            "only base64 data URLs are supported",
        ));
    }

    let payload = payload.trim();
    if (payload.len() / 4 * 3) as u64 > max_bytes {
        return Err(FetchError::too_large(INLINE_LABEL, max_bytes));
    }

    let data = STANDARD
        .decode(payload)
        .map_err(|e| FetchError::invalid_source(locator, e.to_string()))?;
    if data.len() as u64 > max_bytes {
        return Err(FetchError::too_large(INLINE_LABEL, max_bytes));
    }
    Ok(data)
}

/// Production fetcher: `reqwest` for remote sources, `tokio::fs` for local ones.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: Client,
    max_source_bytes: u64,
}

impl HttpFetcher {
    pub fn new(config: &FetchConfig) -> Result<Self, FetchError> {
        let mut builder = Client::builder().user_agent(config.user_agent.clone());
        if let Some(seconds) = config.timeout_secs {
            builder = builder.timeout(Duration::from_secs(seconds));
        }

        let client = builder
            .build()
            .map_err(|e| FetchError::network("<client>", e.to_string()))?;
        Ok(Self {
            client,
            max_source_bytes: config.max_source_bytes,
        })
    }

    async fn fetch_remote(&self, url: Url) -> Result<Vec<u8>, FetchError> {
        let response = self
            .client
            .get(url.clone())
            .send()
            .await
            .map_err(|e| FetchError::network(url.as_str(), e.to_string()))?;

        if response.status() != StatusCode::OK {
            return Err(FetchError::Status {
                url: url.to_string(),
                status: response.status().as_u16(),
            });
        }

        let limit = self.max_source_bytes;
        if response.content_length().is_some_and(|length| length > limit) {
            return Err(FetchError::too_large(url.as_str(), limit));
        }

        // The header is advisory; the streamed length is what gets enforced.
        let mut body = Vec::new();
        let mut chunks = response.bytes_stream();
        while let Some(chunk) = chunks.next().await {
            let chunk = chunk.map_err(|e| FetchError::network(url.as_str(), e.to_string()))?;
            if (body.len() + chunk.len()) as u64 > limit {
                return Err(FetchError::too_large(url.as_str(), limit));
            }
            body.extend_from_slice(&chunk);
        }
        Ok(body)
    }

    async fn fetch_file(&self, path: &Path) -> Result<Vec<u8>, FetchError> {
        let read_error =
            |e: std::io::Error| FetchError::read(path.display().to_string(), e.to_string());
        let limit = self.max_source_bytes;

        let file = tokio::fs::File::open(path).await.map_err(read_error)?;
        let mut data = Vec::new();
        file.take(limit.saturating_add(1))
            .read_to_end(&mut data)
            .await
            .map_err(read_error)?;

        if data.len() as u64 > limit {
            return Err(FetchError::too_large(path.display().to_string(), limit));
        }
        Ok(data)
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, locator: &str) -> Result<Vec<u8>, FetchError> {
        let data = match SourceLocation::parse(locator, self.max_source_bytes)? {
            SourceLocation::Remote(url) => self.fetch_remote(url).await?,
            SourceLocation::File(path) => self.fetch_file(&path).await?,
            SourceLocation::Inline(data) => data,
        };
        debug!(bytes = data.len(), "Fetched source");
        Ok(data)
    }
}
