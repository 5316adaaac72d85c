//! Request front door, job pipeline and scheduler

pub mod request;
pub mod worker;

pub use request::{ImageJob, JobOutcome, JobState, PipelineContext};
pub use worker::{Worker, WorkerState, WorkerStats};

use std::collections::HashSet;
use std::sync::Arc;

use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::cache::CacheStore;
use crate::codec::RasterTransformer;
use crate::config::{Config, DatabaseConfig, LoaderConfig, WorkerConfig};
use crate::errors::{AppError, AppResult};
use crate::fetch::HttpFetcher;
use crate::models::{ImageRequest, ImageResponse};

/// What happened to an inbound message.
#[derive(Debug)]
pub enum Dispatch {
    /// Queued; the response arrives on the receiver unless the job is
    /// cancelled, in which case the receiver reports a closed channel.
    Accepted(oneshot::Receiver<ImageResponse>),
    /// A cancel message was forwarded to the worker.
    Cancelled,
    /// The sender is not on the allow-list; nothing was done.
    Rejected,
}

/// Entry point shared by every transport.
#[derive(Clone)]
pub struct ImageLoaderService {
    worker: Worker,
    store: CacheStore,
    allowed_clients: Arc<HashSet<String>>,
    default_priority: i32,
}

impl ImageLoaderService {
    /// Build the service from configuration, open the cache and start the
    /// worker. A cache that fails to open only disables persistence.
    pub async fn from_config(config: &Config) -> AppResult<Self> {
        let fetcher = HttpFetcher::new(&config.fetch)
            .map_err(|e| AppError::configuration(format!("HTTP client: {}", e)))?;

        let context = PipelineContext {
            store: CacheStore::new(config.cache.clone()),
            fetcher: Arc::new(fetcher),
            transformer: Arc::new(RasterTransformer::new(&config.codec)),
        };

        let service = Self::with_context(&config.loader, &config.worker, context);
        service.start(&config.database).await;
        Ok(service)
    }

    /// Build around the given collaborators. The worker buffers requests
    /// until [`start`](Self::start) or [`Worker::start`] is called.
    pub fn with_context(
        loader: &LoaderConfig,
        worker: &WorkerConfig,
        context: PipelineContext,
    ) -> Self {
        let store = context.store.clone();
        Self {
            worker: Worker::spawn(worker, context),
            store,
            allowed_clients: Arc::new(loader.allowed_clients.iter().cloned().collect()),
            default_priority: worker.default_priority,
        }
    }

    /// Open the cache database, then let the worker run.
    pub async fn start(&self, database: &DatabaseConfig) {
        let persistent = self.store.initialize(database).await;
        info!(persistent, "Image loader starting");
        self.worker.start();
    }

    pub fn worker(&self) -> &Worker {
        &self.worker
    }

    pub fn store(&self) -> &CacheStore {
        &self.store
    }

    pub fn is_allowed(&self, client_id: &str) -> bool {
        self.allowed_clients.is_empty() || self.allowed_clients.contains(client_id)
    }

    /// Route one client message to the worker.
    pub fn handle_message(&self, request: ImageRequest) -> Dispatch {
        if !self.is_allowed(&request.client_id) {
            warn!(client_id = %request.client_id, "Ignoring message from unknown client");
            return Dispatch::Rejected;
        }

        if request.cancel {
            debug!(key = %request.key(), "Cancel requested");
            self.worker.cancel(request.key());
            return Dispatch::Cancelled;
        }

        let (job, receiver) = ImageJob::new(request, self.default_priority);
        debug!(key = %job.key(), priority = job.priority, url = %job.request.url, "Image requested");
        self.worker.add(job);
        Dispatch::Accepted(receiver)
    }
}
