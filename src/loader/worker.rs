//! Priority-ordered, concurrency-limited job scheduler
//!
//! The worker runs as a single task that owns three queues: `new` (jobs
//! received before [`Worker::start`]), `pending` (cache misses waiting for a
//! download slot, ordered by priority) and `active` (downloads in flight).
//! All mutations arrive as commands on one channel, so queue operations never
//! interleave.

use std::collections::HashMap;

use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};
use uuid::Uuid;

use super::request::{ImageJob, PipelineContext};
use crate::config::WorkerConfig;
use crate::models::RequestKey;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    NotStarted,
    Running,
}

/// Queue lengths at one instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct WorkerStats {
    pub state: WorkerState,
    pub new: usize,
    pub pending: usize,
    pub active: usize,
}

enum WorkerCommand {
    Add(ImageJob),
    Start,
    Cancel(RequestKey),
    Stats(oneshot::Sender<WorkerStats>),
}

/// Handle to the scheduler task. Cheap to clone.
#[derive(Clone)]
pub struct Worker {
    commands: mpsc::UnboundedSender<WorkerCommand>,
}

impl Worker {
    /// Spawn the scheduler task in the `NotStarted` state.
    pub fn spawn(config: &WorkerConfig, context: PipelineContext) -> Self {
        let (commands, receiver) = mpsc::unbounded_channel();
        let (finished_tx, finished_rx) = mpsc::unbounded_channel();

        let scheduler = Scheduler {
            state: WorkerState::NotStarted,
            max_in_parallel: config.max_in_parallel.max(1),
            context,
            new_jobs: Vec::new(),
            pending: Vec::new(),
            active: HashMap::new(),
            finished_tx,
        };
        tokio::spawn(scheduler.run(receiver, finished_rx));

        Self { commands }
    }

    fn send(&self, command: WorkerCommand) {
        if self.commands.send(command).is_err() {
            error!("Image worker is not running, command dropped");
        }
    }

    /// Queue a job. Before `start` it is only buffered.
    pub fn add(&self, job: ImageJob) {
        self.send(WorkerCommand::Add(job));
    }

    /// Begin processing. Later calls are ignored.
    pub fn start(&self) {
        self.send(WorkerCommand::Start);
    }

    /// Cancel every queued or running job with this key.
    pub fn cancel(&self, key: RequestKey) {
        self.send(WorkerCommand::Cancel(key));
    }

    pub async fn stats(&self) -> Option<WorkerStats> {
        let (reply, receiver) = oneshot::channel();
        self.send(WorkerCommand::Stats(reply));
        receiver.await.ok()
    }
}

struct ActiveJob {
    key: RequestKey,
    handle: JoinHandle<()>,
}

struct Scheduler {
    state: WorkerState,
    max_in_parallel: usize,
    context: PipelineContext,
    new_jobs: Vec<ImageJob>,
    pending: Vec<ImageJob>,
    active: HashMap<Uuid, ActiveJob>,
    finished_tx: mpsc::UnboundedSender<Uuid>,
}

impl Scheduler {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<WorkerCommand>,
        mut finished: mpsc::UnboundedReceiver<Uuid>,
    ) {
        debug!(max_in_parallel = self.max_in_parallel, "Image worker spawned");

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.handle(command).await,
                    None => break,
                },
                Some(id) = finished.recv() => self.finish(id),
            }
        }

        for (_, job) in self.active.drain() {
            job.handle.abort();
        }
        info!("Image worker stopped");
    }

    async fn handle(&mut self, command: WorkerCommand) {
        match command {
            WorkerCommand::Add(job) => match self.state {
                WorkerState::NotStarted => self.new_jobs.push(job),
                WorkerState::Running => {
                    self.admit(job).await;
                    self.drain();
                }
            },
            WorkerCommand::Start => self.start().await,
            WorkerCommand::Cancel(key) => self.cancel(&key),
            WorkerCommand::Stats(reply) => {
                let _ = reply.send(self.stats());
            }
        }
    }

    async fn start(&mut self) {
        if self.state == WorkerState::Running {
            return;
        }
        self.state = WorkerState::Running;

        let buffered = std::mem::take(&mut self.new_jobs);
        info!(buffered = buffered.len(), "Image worker started");
        for job in buffered {
            self.admit(job).await;
        }
        self.drain();
    }

    /// Answer from the cache, or queue for download.
    async fn admit(&mut self, mut job: ImageJob) {
        if job.check_cache(&self.context).await {
            return;
        }
        self.pending.push(job);
        // Stable: equal priorities keep arrival order.
        self.pending.sort_by_key(|job| job.priority);
    }

    /// Move pending jobs into free download slots.
    fn drain(&mut self) {
        while self.active.len() < self.max_in_parallel && !self.pending.is_empty() {
            let job = self.pending.remove(0);
            self.launch(job);
        }
    }

    fn launch(&mut self, job: ImageJob) {
        let id = job.id;
        let key = job.key();
        let context = self.context.clone();
        let finished = self.finished_tx.clone();

        debug!(key = %key, priority = job.priority, active = self.active.len() + 1, "Starting download");
        let handle = tokio::spawn(async move {
            job.download_and_process(&context).await;
            let _ = finished.send(id);
        });
        self.active.insert(id, ActiveJob { key, handle });
    }

    fn finish(&mut self, id: Uuid) {
        // Jobs cancelled while running already gave their slot back.
        if self.active.remove(&id).is_some() {
            self.drain();
        }
    }

    fn cancel(&mut self, key: &RequestKey) {
        let queued = self.new_jobs.len() + self.pending.len();
        self.new_jobs.retain(|job| &job.key() != key);
        self.pending.retain(|job| &job.key() != key);
        let dequeued = queued - self.new_jobs.len() - self.pending.len();

        let running: Vec<Uuid> = self
            .active
            .iter()
            .filter(|(_, job)| &job.key == key)
            .map(|(id, _)| *id)
            .collect();
        for id in &running {
            if let Some(job) = self.active.remove(id) {
                job.handle.abort();
            }
        }

        if dequeued + running.len() > 0 {
            debug!(key = %key, dequeued, aborted = running.len(), "Cancelled image request");
            self.drain();
        }
    }

    fn stats(&self) -> WorkerStats {
        WorkerStats {
            state: self.state,
            new: self.new_jobs.len(),
            pending: self.pending.len(),
            active: self.active.len(),
        }
    }
}
