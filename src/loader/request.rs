//! A single image job: cache check, download, transform, respond, persist

use std::sync::Arc;
use std::time::Instant;

use tokio::sync::oneshot;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::cache::{CacheLookup, CacheStore, StoreOutcome};
use crate::codec::{transform_blocking, EncodedImage, ImageTransformer};
use crate::errors::{LoaderError, LoaderResult};
use crate::fetch::Fetcher;
use crate::models::{CacheKey, ImageRequest, ImageResponse, RequestKey};

/// Collaborators shared by every job.
#[derive(Clone)]
pub struct PipelineContext {
    pub store: CacheStore,
    pub fetcher: Arc<dyn Fetcher>,
    pub transformer: Arc<dyn ImageTransformer>,
}

/// How a job ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    FromCache,
    Downloaded,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Created,
    CacheCheck,
    Done(JobOutcome),
}

/// A request plus the channel its single response goes to.
///
/// Dropping a job without answering it closes the channel; that is how
/// cancellation looks from the receiving side.
pub struct ImageJob {
    pub id: Uuid,
    pub request: ImageRequest,
    pub priority: i32,
    pub cache_key: CacheKey,
    state: JobState,
    responder: Option<oneshot::Sender<ImageResponse>>,
}

impl ImageJob {
    pub fn new(
        request: ImageRequest,
        default_priority: i32,
    ) -> (Self, oneshot::Receiver<ImageResponse>) {
        let (responder, receiver) = oneshot::channel();
        let job = Self {
            id: Uuid::new_v4(),
            priority: request.priority.unwrap_or(default_priority),
            cache_key: request.cache_key(),
            request,
            state: JobState::Created,
            responder: Some(responder),
        };
        (job, receiver)
    }

    pub fn key(&self) -> RequestKey {
        self.request.key()
    }

    pub fn state(&self) -> JobState {
        self.state
    }

    /// Source version to persist under, when the result may be cached.
    fn persist_version(&self) -> Option<i64> {
        if self.request.cache {
            self.request.timestamp
        } else {
            None
        }
    }

    /// Deliver the response. A receiver that has gone away is not an error.
    fn respond(&mut self, response: ImageResponse) {
        if let Some(responder) = self.responder.take() {
            if responder.send(response).is_err() {
                debug!(key = %self.request.key(), "Client stopped listening, response dropped");
            }
        }
    }

    /// Try to answer from the cache. Returns true when the job is complete.
    ///
    /// Requests with caching disabled purge any stored entry for their key
    /// first. Requests without a source version skip the cache entirely.
    pub async fn check_cache(&mut self, context: &PipelineContext) -> bool {
        self.state = JobState::CacheCheck;

        if !self.request.cache {
            if context.store.remove(&self.cache_key).await {
                debug!(key = %self.key(), "Removed cached entry for uncached request");
            }
            return false;
        }

        let Some(version) = self.request.timestamp else {
            return false;
        };

        match context.store.lookup(&self.cache_key, version).await {
            CacheLookup::Hit(data) => {
                let image = EncodedImage::from_bytes(data);
                debug!(
                    key = %self.key(),
                    bytes = image.data.len(),
                    "Served image from cache"
                );
                self.respond(ImageResponse::Success {
                    task_id: self.request.task_id,
                    data: image.to_data_url(),
                });
                self.state = JobState::Done(JobOutcome::FromCache);
                true
            }
            CacheLookup::Miss => false,
        }
    }

    async fn process(&self, context: &PipelineContext) -> LoaderResult<EncodedImage> {
        let source = context.fetcher.fetch(&self.request.url).await?;
        transform_blocking(
            context.transformer.clone(),
            source,
            self.request.options.clone(),
        )
        .await
    }

    /// Fetch, transform and answer; persist successful results when eligible.
    pub async fn download_and_process(mut self, context: &PipelineContext) -> JobOutcome {
        let started = Instant::now();

        match self.process(context).await {
            Ok(image) => {
                self.respond(ImageResponse::Success {
                    task_id: self.request.task_id,
                    data: image.to_data_url(),
                });
                if let Some(version) = self.persist_version() {
                    self.persist(context, &image, version).await;
                }
                info!(
                    key = %self.key(),
                    mime = image.mime.as_str(),
                    bytes = image.data.len(),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Image processed"
                );
                JobOutcome::Downloaded
            }
            Err(e) => {
                warn!(key = %self.key(), url = %self.request.url, error = %e, "Image request failed");
                self.respond(ImageResponse::Error {
                    task_id: self.request.task_id,
                });
                JobOutcome::Failed
            }
        }
    }

    async fn persist(&self, context: &PipelineContext, image: &EncodedImage, version: i64) {
        match context.store.store(&self.cache_key, &image.data, version).await {
            StoreOutcome::Stored { evicted } => {
                debug!(
                    key = %self.key(),
                    evicted_entries = evicted.entries,
                    "Cached processed image"
                );
            }
            StoreOutcome::AlreadyPresent => {}
            StoreOutcome::Rejected => {
                let reason = LoaderError::AdmissionRejected {
                    size: image.data.len() as u64,
                    budget: context.store.budget(),
                };
                debug!(key = %self.key(), reason = %reason, "Processed image not cached");
            }
            StoreOutcome::Unavailable => {}
        }
    }
}
