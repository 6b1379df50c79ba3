//! Worker: prewarms process data once, then runs one task per room job.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, error, info, info_span, warn};
use uuid::Uuid;

use nomi_core::config::Config;
use nomi_core::error::NomiError;
use nomi_media::room::Room;

use crate::room::{AutoSubscribe, RoomConnector};

/// Boxed job future returned by an entrypoint.
pub type JobFuture = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>>;

/// Per-job entrypoint.
pub type Entrypoint<D> = Arc<dyn Fn(JobContext<D>) -> JobFuture + Send + Sync>;

/// The worker process as seen by the prewarm hook.
#[derive(Debug, Clone)]
pub struct JobProcess {
    pid: u32,
    config: Arc<Config>,
}

impl JobProcess {
    pub fn new(config: Arc<Config>) -> Self {
        Self {
            pid: std::process::id(),
            config,
        }
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn config(&self) -> &Arc<Config> {
        &self.config
    }
}

/// How the worker prepares the process and runs each job.
pub struct WorkerOptions<D> {
    /// Runs once per process before any job; the result is shared by all jobs.
    pub prewarm: fn(&JobProcess) -> anyhow::Result<D>,
    pub entrypoint: Entrypoint<D>,
    pub connector: Arc<dyn RoomConnector>,
}

impl<D: 'static> WorkerOptions<D> {
    pub fn new<F, Fut>(
        prewarm: fn(&JobProcess) -> anyhow::Result<D>,
        entrypoint: F,
        connector: Arc<dyn RoomConnector>,
    ) -> Self
    where
        F: Fn(JobContext<D>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        Self {
            prewarm,
            entrypoint: Arc::new(move |ctx| -> JobFuture { Box::pin(entrypoint(ctx)) }),
            connector,
        }
    }
}

/// A request to run the agent in a room.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobRequest {
    pub room: String,
}

impl JobRequest {
    pub fn new(room: impl Into<String>) -> Self {
        Self { room: room.into() }
    }
}

/// Everything a job's entrypoint gets to work with.
pub struct JobContext<D> {
    job_id: Uuid,
    room_name: String,
    proc_data: Arc<D>,
    connector: Arc<dyn RoomConnector>,
    cancel: CancellationToken,
}

impl<D> JobContext<D> {
    pub fn new(
        room_name: impl Into<String>,
        proc_data: Arc<D>,
        connector: Arc<dyn RoomConnector>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            job_id: Uuid::new_v4(),
            room_name: room_name.into(),
            proc_data,
            connector,
            cancel,
        }
    }

    pub fn job_id(&self) -> Uuid {
        self.job_id
    }

    pub fn room_name(&self) -> &str {
        &self.room_name
    }

    /// Process data produced by the prewarm hook.
    pub fn proc(&self) -> &Arc<D> {
        &self.proc_data
    }

    /// Cancelled when the worker shuts down.
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub async fn connect(&self, subscribe: AutoSubscribe) -> anyhow::Result<Arc<dyn Room>> {
        self.connector.connect(&self.room_name, subscribe).await
    }
}

/// Runs jobs against shared, prewarmed process data.
pub struct Worker<D> {
    options: WorkerOptions<D>,
    process: JobProcess,
    cancel: CancellationToken,
}

impl<D: Send + Sync + 'static> Worker<D> {
    pub fn new(options: WorkerOptions<D>, process: JobProcess) -> Self {
        Self {
            options,
            process,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_cancel_token(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Prewarm, then dispatch jobs until the channel closes and every job
    /// finishes, or until cancelled.
    pub async fn run(self, mut jobs: mpsc::Receiver<JobRequest>) -> anyhow::Result<()> {
        let started = Instant::now();
        let proc_data = (self.options.prewarm)(&self.process)
            .map_err(|e| NomiError::Job(format!("prewarm failed: {e}")))?;
        let proc_data = Arc::new(proc_data);
        info!(
            pid = self.process.pid(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Worker prewarmed"
        );

        let mut running = JoinSet::new();
        let mut accepting = true;

        while accepting || !running.is_empty() {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    info!(running = running.len(), "Worker shutting down");
                    running.abort_all();
                    while running.join_next().await.is_some() {}
                    break;
                }
                request = jobs.recv(), if accepting => match request {
                    Some(request) => self.dispatch(&mut running, request, proc_data.clone()),
                    None => {
                        info!("Job channel closed, waiting for running jobs");
                        accepting = false;
                    }
                },
                Some(joined) = running.join_next() => {
                    if let Err(e) = joined {
                        if !e.is_cancelled() {
                            error!(error = %e, "Job task panicked");
                        }
                    }
                }
            }
        }

        info!("Worker stopped");
        Ok(())
    }

    fn dispatch(&self, running: &mut JoinSet<()>, request: JobRequest, proc_data: Arc<D>) {
        let ctx = JobContext::new(
            request.room,
            proc_data,
            self.options.connector.clone(),
            self.cancel.child_token(),
        );
        let span = info_span!("job", job_id = %ctx.job_id(), room = %ctx.room_name());
        let entrypoint = self.options.entrypoint.clone();

        running.spawn(
            async move {
                info!("Job started");
                match entrypoint(ctx).await {
                    Ok(()) => info!("Job finished"),
                    Err(e) => warn!(error = %e, "Job failed"),
                }
            }
            .instrument(span),
        );
    }
}
