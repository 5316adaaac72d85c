//! Wire and domain types shared by the loader, the cache and the web layer

use serde::{Deserialize, Serialize};
use std::fmt;

/// Geometric transform requested for an image.
///
/// Field names follow the client message format (`maxWidth`, `maxHeight`).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransformOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scale: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_width: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_height: Option<u32>,
    /// Clockwise quarter turns, 0..=3.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub orientation: Option<u8>,
}

impl TransformOptions {
    /// Quarter turns normalized into 0..=3.
    pub fn quarter_turns(&self) -> u8 {
        self.orientation.unwrap_or(0) % 4
    }
}

/// Inbound message from a client.
///
/// A message with `cancel: true` cancels the in-flight task with the same
/// `(clientId, taskId)` instead of creating a new one.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageRequest {
    pub client_id: String,
    pub task_id: u64,
    #[serde(default)]
    pub url: String,
    #[serde(flatten)]
    pub options: TransformOptions,
    #[serde(default)]
    pub cache: bool,
    /// Source version (modification timestamp). Without it nothing is
    /// read from or written to the persistent cache.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<i32>,
    #[serde(default)]
    pub cancel: bool,
}

impl ImageRequest {
    pub fn key(&self) -> RequestKey {
        RequestKey::new(self.client_id.clone(), self.task_id)
    }

    pub fn cache_key(&self) -> CacheKey {
        CacheKey::from_request(self)
    }
}

/// Identity of an in-flight job.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RequestKey {
    pub client_id: String,
    pub task_id: u64,
}

impl RequestKey {
    pub fn new<S: Into<String>>(client_id: S, task_id: u64) -> Self {
        Self {
            client_id: client_id.into(),
            task_id,
        }
    }
}

impl fmt::Display for RequestKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.client_id, self.task_id)
    }
}

/// Cache key derived from the visually significant part of a request.
///
/// Orientation is not part of the key; rotated variants share one entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CacheKeyFields<'a> {
    url: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    scale: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    width: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    height: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_width: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_height: Option<u32>,
}

impl CacheKey {
    pub fn from_request(request: &ImageRequest) -> Self {
        let fields = CacheKeyFields {
            url: &request.url,
            scale: request.options.scale,
            width: request.options.width,
            height: request.options.height,
            max_width: request.options.max_width,
            max_height: request.options.max_height,
        };
        // Serializing plain strings and numbers cannot fail.
        Self(serde_json::to_string(&fields).unwrap_or_else(|_| request.url.clone()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for CacheKey {
    fn from(key: &str) -> Self {
        Self(key.to_string())
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Outbound message to a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum ImageResponse {
    Success {
        #[serde(rename = "taskId")]
        task_id: u64,
        /// Encoded image as a base64 `data:` URL.
        data: String,
    },
    Error {
        #[serde(rename = "taskId")]
        task_id: u64,
    },
}

impl ImageResponse {
    pub fn task_id(&self) -> u64 {
        match self {
            Self::Success { task_id, .. } | Self::Error { task_id } => *task_id,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }
}
