//! Bounded preview generation queue.
//!
//! Per output path a preview is *absent*, *in flight* or *present*. A
//! submission for a present output is skipped. With one worker the
//! conversion runs on the caller, who sees the result. With more workers
//! the job goes onto a bounded queue of `workers * queue_factor` slots and
//! the caller only waits for a free slot; failures are logged by the worker
//! and the job is dropped, since a later request for the missing preview
//! submits it again.
//!
//! By default the on-disk existence check is the only deduplication, so two
//! submissions racing before the first conversion finishes may both run.
//! Converters must tolerate that. Setting `dedupe_in_flight` adds a set of
//! claimed outputs that makes the deduplication exact.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use dashmap::DashSet;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use super::converter::{Converter, PreviewError, PreviewRequest};

/// Default number of workers.
pub const DEFAULT_WORKERS: usize = 2;

/// Default queue slots per worker.
pub const DEFAULT_QUEUE_FACTOR: usize = 100;

/// Pipeline sizing and deduplication mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineOptions {
    /// Number of workers; 1 converts synchronously on the caller.
    pub workers: usize,
    /// Queue slots per worker.
    pub queue_factor: usize,
    /// Track claimed outputs to skip duplicate in-flight jobs.
    pub dedupe_in_flight: bool,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            workers: DEFAULT_WORKERS,
            queue_factor: DEFAULT_QUEUE_FACTOR,
            dedupe_in_flight: false,
        }
    }
}

impl PipelineOptions {
    /// Queue capacity.
    pub fn capacity(&self) -> usize {
        self.workers.max(1) * self.queue_factor.max(1)
    }
}

/// What happened to a submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// The preview already exists or is already being produced.
    Skipped,
    /// Converted synchronously.
    Converted,
    /// Handed to a worker.
    Queued,
}

/// Outputs currently claimed by a submission.
type Claims = Arc<DashSet<PathBuf>>;

/// Preview generation pipeline.
pub struct PreviewPipeline {
    converter: Arc<Converter>,
    options: PipelineOptions,
    /// Present when `workers > 1`.
    queue: Option<mpsc::Sender<PreviewRequest>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    claims: Option<Claims>,
    shutdown: CancellationToken,
}

impl PreviewPipeline {
    /// Creates the pipeline and, for more than one worker, spawns the
    /// workers on the current Tokio runtime.
    pub fn new(converter: Converter, options: PipelineOptions) -> Self {
        let converter = Arc::new(converter);
        let claims = options.dedupe_in_flight.then(|| Arc::new(DashSet::new()));
        let shutdown = CancellationToken::new();

        let (queue, workers) = if options.workers > 1 {
            let (tx, rx) = mpsc::channel(options.capacity());
            let rx = Arc::new(tokio::sync::Mutex::new(rx));
            let handles = (0..options.workers)
                .map(|id| {
                    tokio::spawn(worker_loop(
                        id,
                        Arc::clone(&rx),
                        Arc::clone(&converter),
                        claims.clone(),
                        shutdown.clone(),
                    ))
                })
                .collect();
            (Some(tx), handles)
        } else {
            (None, Vec::new())
        };

        info!(
            "Preview pipeline started ({} workers, queue capacity {}, exact dedupe {})",
            options.workers,
            if queue.is_some() { options.capacity() } else { 0 },
            options.dedupe_in_flight
        );

        Self {
            converter,
            options,
            queue,
            workers: Mutex::new(workers),
            claims,
            shutdown,
        }
    }

    /// Sizing and deduplication mode.
    pub fn options(&self) -> PipelineOptions {
        self.options
    }

    /// Whether submissions convert on the caller.
    pub fn is_synchronous(&self) -> bool {
        self.queue.is_none()
    }

    /// Submits a conversion.
    ///
    /// Returns `Skipped` if the output exists (or, with exact dedupe, is
    /// already claimed). In synchronous mode the conversion result is
    /// returned. Otherwise the call waits for a free queue slot and returns
    /// `Queued`.
    pub async fn submit(&self, request: PreviewRequest) -> Result<SubmitOutcome, PreviewError> {
        if request.output.exists() {
            return Ok(SubmitOutcome::Skipped);
        }
        if self.shutdown.is_cancelled() {
            return Err(PreviewError::QueueClosed);
        }
        if let Some(claims) = &self.claims {
            if !claims.insert(request.output.clone()) {
                debug!("Preview {:?} already in flight", request.output);
                return Ok(SubmitOutcome::Skipped);
            }
        }

        let Some(queue) = &self.queue else {
            let result = self.converter.run(&request).await;
            release(&self.claims, &request.output);
            return result.map(|()| SubmitOutcome::Converted);
        };

        match queue.send(request).await {
            Ok(()) => Ok(SubmitOutcome::Queued),
            Err(mpsc::error::SendError(request)) => {
                release(&self.claims, &request.output);
                Err(PreviewError::QueueClosed)
            }
        }
    }

    /// Removes a stale preview so the next submission regenerates it.
    ///
    /// Returns whether a preview was removed.
    pub async fn invalidate(&self, output: &Path) -> Result<bool, PreviewError> {
        match tokio::fs::remove_file(output).await {
            Ok(()) => {
                debug!("Invalidated preview {:?}", output);
                Ok(true)
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Number of outputs currently claimed (always 0 without exact dedupe).
    pub fn in_flight(&self) -> usize {
        self.claims.as_ref().map_or(0, |claims| claims.len())
    }

    /// Stops the workers.
    ///
    /// Workers finish the conversion they are running and then exit; jobs
    /// still queued are dropped and their claims released. Further
    /// submissions fail with `QueueClosed`.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let handles = match self.workers.lock() {
            Ok(mut workers) => std::mem::take(&mut *workers),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        };
        for handle in handles {
            if let Err(e) = handle.await {
                error!("Preview worker panicked: {}", e);
            }
        }
        if let Some(claims) = &self.claims {
            if !claims.is_empty() {
                debug!("Dropping {} queued previews", claims.len());
            }
            claims.clear();
        }
        info!("Preview pipeline stopped");
    }
}

fn release(claims: &Option<Claims>, output: &Path) {
    if let Some(claims) = claims {
        claims.remove(output);
    }
}

async fn worker_loop(
    id: usize,
    queue: Arc<tokio::sync::Mutex<mpsc::Receiver<PreviewRequest>>>,
    converter: Arc<Converter>,
    claims: Option<Claims>,
    shutdown: CancellationToken,
) {
    loop {
        let next = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            next = async { queue.lock().await.recv().await } => next,
        };
        let Some(request) = next else {
            break;
        };

        // The output may have appeared while the job was queued.
        if request.output.exists() {
            debug!("Worker {} skipping existing preview {:?}", id, request.output);
        } else if let Err(e) = converter.run(&request).await {
            error!(
                "Worker {} failed to convert {:?}: {}",
                id, request.input, e
            );
        }
        release(&claims, &request.output);
    }
    debug!("Preview worker {} exiting", id);
}
