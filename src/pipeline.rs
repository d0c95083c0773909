use std::panic;
use std::sync::Arc;
use std::sync::mpsc::{self, Sender};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::aggregate::{Aggregator, RunSummary};
use crate::backend::{Backend, BackendChain, build_backends};
use crate::cancel::CancelToken;
use crate::config::PipelineConfig;
use crate::domain::{ArtifactRequest, PDF_CONTENT_TYPE, PaperRecord};
use crate::error::{FailureReason, HarvestError};
use crate::layout::Layout;
use crate::output::ProgressSink;
use crate::pool::{DownloadOutcome, LOCAL_BACKEND, spawn_workers};
use crate::queue::{Enqueue, TaskQueue};
use crate::tracker::{ArtifactState, ResumeTracker};

pub struct RunContext {
    pub config: PipelineConfig,
    pub layout: Layout,
    pub tracker: ResumeTracker,
    pub backends: BackendChain,
    pub cancel: CancelToken,
}

impl RunContext {
    pub fn new(config: PipelineConfig, backends: Vec<Arc<dyn Backend>>, cancel: CancelToken) -> Self {
        let layout = Layout::new(config.root.clone());
        Self {
            tracker: ResumeTracker::new(layout.clone()),
            layout,
            backends: BackendChain::new(backends),
            config,
            cancel,
        }
    }
}

pub struct Pipeline {
    config: PipelineConfig,
    backends: Vec<Arc<dyn Backend>>,
}

impl Pipeline {
    pub fn new(config: PipelineConfig, backends: Vec<Arc<dyn Backend>>) -> Result<Self, HarvestError> {
        config.validate()?;
        if backends.is_empty() {
            return Err(HarvestError::InvalidConfig(
                "at least one backend is required".to_string(),
            ));
        }
        Ok(Self { config, backends })
    }

    pub fn from_config(config: PipelineConfig) -> Result<Self, HarvestError> {
        let backends = build_backends(&config.backends)?;
        Self::new(config, backends)
    }

    /// Acquires every record's PDF. Per-request failures end up in the
    /// summary; only an unusable destination root fails the run.
    pub fn run<I>(
        &self,
        records: I,
        cancel: &CancelToken,
        sink: &dyn ProgressSink,
    ) -> Result<RunSummary, HarvestError>
    where
        I: IntoIterator<Item = PaperRecord>,
    {
        let started = Instant::now();
        let ctx = RunContext::new(self.config.clone(), self.backends.clone(), cancel.clone());
        ctx.layout.ensure_root()?;
        info!(
            root = %ctx.layout.root(),
            workers = ctx.config.workers,
            max_attempts = ctx.config.max_attempts,
            backend = ctx.backends.active_name().unwrap_or("none"),
            "starting run"
        );

        let queue = TaskQueue::new(ctx.config.queue_capacity);
        let (outcomes, received) = mpsc::channel();

        let mut summary = thread::scope(|scope| {
            let layout = &ctx.layout;
            let aggregator = scope.spawn(move || Aggregator::new(layout, sink).consume(received));
            let workers = spawn_workers(scope, ctx.config.workers, &ctx, &queue, &outcomes);

            let requested = feed(records, &ctx, &queue, &outcomes);
            drop(outcomes);

            for worker in workers {
                if let Err(payload) = worker.join() {
                    panic::resume_unwind(payload);
                }
            }
            let mut summary = match aggregator.join() {
                Ok(summary) => summary,
                Err(payload) => panic::resume_unwind(payload),
            };
            summary.requested = requested;
            summary
        });

        summary.elapsed = started.elapsed();
        if ctx.backends.demotions() > 0 {
            debug!(demotions = ctx.backends.demotions(), "backend demotions this run");
        }
        Ok(summary)
    }
}

pub fn request_for(layout: &Layout, paper: PaperRecord) -> ArtifactRequest {
    ArtifactRequest {
        id: paper.id.clone(),
        source_url: paper.pdf_url.clone(),
        target: layout.pdf_path(&paper.id, paper.published),
        content_type: PDF_CONTENT_TYPE.to_string(),
        expected_size: paper.pdf_size,
        paper,
    }
}

fn feed<I>(records: I, ctx: &RunContext, queue: &TaskQueue, outcomes: &Sender<DownloadOutcome>) -> usize
where
    I: IntoIterator<Item = PaperRecord>,
{
    let mut requested = 0;
    for paper in records {
        if ctx.cancel.is_cancelled() {
            break;
        }
        let request = request_for(&ctx.layout, paper);
        if let Err(err) = ctx.tracker.seed(&request) {
            warn!(id = %request.id, %err, "could not inspect existing files");
            requested += 1;
            let _ = outcomes.send(DownloadOutcome::failed(
                Arc::new(request),
                FailureReason::Io(err.to_string()),
                Duration::ZERO,
            ));
            continue;
        }
        match queue.push(request, &ctx.cancel) {
            Enqueue::Accepted => requested += 1,
            Enqueue::Duplicate => debug!("duplicate identity ignored"),
            Enqueue::Full | Enqueue::Closed => break,
        }
    }

    if ctx.cancel.is_cancelled() {
        for request in queue.cancel() {
            let _ = outcomes.send(discarded(ctx, request));
        }
    } else {
        queue.close();
    }
    requested
}

pub(crate) fn discarded(ctx: &RunContext, request: Arc<ArtifactRequest>) -> DownloadOutcome {
    let state = ctx.tracker.state(&request.id).unwrap_or(ArtifactState::Pending);
    debug!(id = %request.id, "discarding queued request");
    DownloadOutcome {
        request,
        state,
        attempts: 0,
        elapsed: Duration::ZERO,
        backend: LOCAL_BACKEND.to_string(),
        bytes: 0,
        already_present: false,
        error: Some(FailureReason::CancelledByCaller),
    }
}
