use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::errors::{AppError, AppResult};

/// Default byte budget for the persistent cache (250 MiB).
pub const DEFAULT_CACHE_BUDGET_BYTES: u64 = 250 * 1024 * 1024;

/// Default minimum amount reclaimed by one eviction pass (50 MiB).
pub const DEFAULT_EVICTION_CHUNK_BYTES: u64 = 50 * 1024 * 1024;

/// Default maximum number of downloads in flight.
pub const DEFAULT_MAX_IN_PARALLEL: usize = 5;

/// Priority used when a request does not carry one. 0 is the most urgent.
pub const DEFAULT_PRIORITY: i32 = 2;

/// Default JPEG quality for the lossy encoding candidate.
pub const DEFAULT_JPEG_QUALITY: u8 = 90;

/// Default ceiling on the pixel count of a transformed image (40 megapixels).
pub const DEFAULT_MAX_OUTPUT_PIXELS: u64 = 40_000_000;

/// Default ceiling on the size of a fetched source (64 MiB).
pub const DEFAULT_MAX_SOURCE_BYTES: u64 = 64 * 1024 * 1024;

/// Prefix for environment overrides, e.g. `IMAGE_LOADER__WEB__PORT=9000`.
pub const ENV_PREFIX: &str = "IMAGE_LOADER";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub database: DatabaseConfig,
    pub web: WebConfig,
    pub cache: CacheConfig,
    pub worker: WorkerConfig,
    pub fetch: FetchConfig,
    pub codec: CodecConfig,
    pub loader: LoaderConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    pub budget_bytes: u64,
    pub eviction_chunk_bytes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    pub max_in_parallel: usize,
    pub default_priority: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchConfig {
    pub user_agent: String,
    /// Off by default: a stalled download keeps its worker slot.
    pub timeout_secs: Option<u64>,
    /// Sources larger than this fail instead of being buffered.
    pub max_source_bytes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CodecConfig {
    pub jpeg_quality: u8,
    /// Upper bound on `width * height` of a rendered image.
    pub max_output_pixels: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoaderConfig {
    /// Client ids permitted to submit work. Empty accepts every client.
    pub allowed_clients: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database: DatabaseConfig {
                url: "sqlite://./image-loader.db".to_string(),
                max_connections: Some(5),
            },
            web: WebConfig {
                host: "127.0.0.1".to_string(),
                port: 8080,
            },
            cache: CacheConfig::default(),
            worker: WorkerConfig::default(),
            fetch: FetchConfig::default(),
            codec: CodecConfig::default(),
            loader: LoaderConfig {
                allowed_clients: Vec::new(),
            },
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            budget_bytes: DEFAULT_CACHE_BUDGET_BYTES,
            eviction_chunk_bytes: DEFAULT_EVICTION_CHUNK_BYTES,
        }
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            max_in_parallel: DEFAULT_MAX_IN_PARALLEL,
            default_priority: DEFAULT_PRIORITY,
        }
    }
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            user_agent: format!("image-loader/{}", env!("CARGO_PKG_VERSION")),
            timeout_secs: None,
            max_source_bytes: DEFAULT_MAX_SOURCE_BYTES,
        }
    }
}

impl Default for CodecConfig {
    fn default() -> Self {
        Self {
            jpeg_quality: DEFAULT_JPEG_QUALITY,
            max_output_pixels: DEFAULT_MAX_OUTPUT_PIXELS,
        }
    }
}

impl Config {
    /// Load configuration: built-in defaults, then the TOML file at
    /// `config_file` if it exists, then `IMAGE_LOADER__*` environment variables.
    pub fn load(config_file: &str) -> Result<Self> {
        let defaults = toml::to_string_pretty(&Self::default())?;

        let mut builder = config::Config::builder()
            .add_source(config::File::from_str(&defaults, config::FileFormat::Toml));

        if Path::new(config_file).exists() {
            builder = builder.add_source(
                config::File::new(config_file, config::FileFormat::Toml).required(true),
            );
        }

        let config: Self = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    /// Reject settings the cache and worker cannot operate with.
    pub fn validate(&self) -> AppResult<()> {
        if self.cache.budget_bytes == 0 {
            return Err(AppError::configuration("cache.budget_bytes must be positive"));
        }
        if self.worker.max_in_parallel == 0 {
            return Err(AppError::configuration(
                "worker.max_in_parallel must be at least 1",
            ));
        }
        if !(1..=100).contains(&self.codec.jpeg_quality) {
            return Err(AppError::configuration(
                "codec.jpeg_quality must be between 1 and 100",
            ));
        }
        if self.codec.max_output_pixels == 0 {
            return Err(AppError::configuration(
                "codec.max_output_pixels must be positive",
            ));
        }
        if self.fetch.max_source_bytes == 0 {
            return Err(AppError::configuration(
                "fetch.max_source_bytes must be positive",
            ));
        }
        Ok(())
    }
}
