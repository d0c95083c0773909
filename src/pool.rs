use std::sync::Arc;
use std::sync::mpsc::Sender;
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use crate::attempt::{AttemptMachine, AttemptResult, Step};
use crate::backend::{FetchJob, FetchOutcome};
use crate::domain::{ArtifactRequest, PaperId};
use crate::error::FailureReason;
use crate::pipeline::{RunContext, discarded};
use crate::queue::TaskQueue;
use crate::tracker::{ArtifactState, Claim};

pub const LOCAL_BACKEND: &str = "local";

#[derive(Debug, Clone)]
pub struct DownloadOutcome {
    pub request: Arc<ArtifactRequest>,
    pub state: ArtifactState,
    pub attempts: u32,
    pub elapsed: Duration,
    pub backend: String,
    pub bytes: u64,
    pub already_present: bool,
    pub error: Option<FailureReason>,
}

impl DownloadOutcome {
    pub fn id(&self) -> &PaperId {
        &self.request.id
    }

    pub fn is_verified(&self) -> bool {
        self.state == ArtifactState::Verified
    }

    pub fn was_retried(&self) -> bool {
        self.is_verified() && self.attempts > 1
    }

    pub fn failed(request: Arc<ArtifactRequest>, reason: FailureReason, elapsed: Duration) -> Self {
        Self {
            request,
            state: ArtifactState::FailedTerminal(reason.clone()),
            attempts: 0,
            elapsed,
            backend: LOCAL_BACKEND.to_string(),
            bytes: 0,
            already_present: false,
            error: Some(reason),
        }
    }
}

pub fn spawn_workers<'scope, 'env>(
    scope: &'scope thread::Scope<'scope, 'env>,
    workers: usize,
    ctx: &'env RunContext,
    queue: &'env TaskQueue,
    outcomes: &Sender<DownloadOutcome>,
) -> Vec<thread::ScopedJoinHandle<'scope, ()>> {
    (0..workers)
        .map(|index| {
            let outcomes = outcomes.clone();
            scope.spawn(move || Worker::new(index, ctx).run(queue, outcomes))
        })
        .collect()
}

pub struct Worker<'a> {
    index: usize,
    ctx: &'a RunContext,
}

impl<'a> Worker<'a> {
    pub fn new(index: usize, ctx: &'a RunContext) -> Self {
        Self { index, ctx }
    }

    pub fn run(&self, queue: &TaskQueue, outcomes: Sender<DownloadOutcome>) {
        debug!(worker = self.index, "worker started");
        while let Some(request) = queue.pop() {
            let outcome = if self.ctx.cancel.is_cancelled() {
                Some(discarded(self.ctx, request))
            } else {
                self.process(request)
            };
            if let Some(outcome) = outcome {
                if outcomes.send(outcome).is_err() {
                    break;
                }
            }
        }
        debug!(worker = self.index, "worker finished");
    }

    /// Drives one request to a final outcome. `None` when another worker owns
    /// or already reported the identity.
    pub fn process(&self, request: Arc<ArtifactRequest>) -> Option<DownloadOutcome> {
        let started = Instant::now();
        let tracker = &self.ctx.tracker;

        let resume_from = match tracker.claim(&request.id) {
            Claim::Owned { resume_from } => resume_from,
            Claim::AlreadyVerified => {
                let bytes = std::fs::metadata(request.target.as_std_path())
                    .map(|meta| meta.len())
                    .unwrap_or(0);
                debug!(id = %request.id, "already verified on disk, skipping");
                return Some(DownloadOutcome {
                    request,
                    state: ArtifactState::Verified,
                    attempts: 0,
                    elapsed: started.elapsed(),
                    backend: LOCAL_BACKEND.to_string(),
                    bytes,
                    already_present: true,
                    error: None,
                });
            }
            Claim::Busy | Claim::Settled => {
                debug!(id = %request.id, worker = self.index, "identity owned elsewhere");
                return None;
            }
        };

        if resume_from > 0 && request.expected_size == Some(resume_from) {
            if let Ok(bytes) = tracker.verify(&request, None) {
                return Some(DownloadOutcome {
                    request,
                    state: ArtifactState::Verified,
                    attempts: 0,
                    elapsed: started.elapsed(),
                    backend: LOCAL_BACKEND.to_string(),
                    bytes,
                    already_present: false,
                    error: None,
                });
            }
        }

        let mut machine = AttemptMachine::new(self.ctx.config.max_attempts, self.ctx.config.backoff);
        let mut backend = LOCAL_BACKEND.to_string();
        loop {
            match machine.step().clone() {
                Step::Attempt(number) => {
                    machine.begin();
                    if self.ctx.cancel.is_cancelled() {
                        return Some(self.cancelled(request, &machine, started, backend));
                    }
                    if let Err(err) = tracker.transition(&request.id, ArtifactState::InProgress) {
                        warn!(id = %request.id, %err, "identity settled concurrently; not retrying");
                        return None;
                    }
                    debug!(id = %request.id, worker = self.index, attempt = number, "starting attempt");
                    let (result, used) = self.attempt(&request);
                    backend = used;
                    match result {
                        Some(result) => {
                            machine.record(result);
                        }
                        None => return Some(self.cancelled(request, &machine, started, backend)),
                    }
                }
                Step::Backoff { next_attempt, delay } => {
                    warn!(
                        id = %request.id,
                        next_attempt,
                        max_attempts = self.ctx.config.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        "attempt failed, retrying"
                    );
                    if !self.ctx.cancel.sleep(delay) {
                        return Some(self.cancelled(request, &machine, started, backend));
                    }
                    machine.resume();
                }
                Step::Verified { attempts, bytes } => {
                    info!(id = %request.id, attempts, bytes, backend = %backend, "artifact verified");
                    return Some(DownloadOutcome {
                        request,
                        state: ArtifactState::Verified,
                        attempts,
                        elapsed: started.elapsed(),
                        backend,
                        bytes,
                        already_present: false,
                        error: None,
                    });
                }
                Step::Failed { attempts, reason } => {
                    error!(id = %request.id, attempts, reason = %reason, "artifact failed permanently");
                    let state = ArtifactState::FailedTerminal(reason.clone());
                    if let Err(err) = tracker.transition(&request.id, state.clone()) {
                        warn!(id = %request.id, %err, "could not record failure");
                    }
                    return Some(DownloadOutcome {
                        request,
                        state,
                        attempts,
                        elapsed: started.elapsed(),
                        backend,
                        bytes: 0,
                        already_present: false,
                        error: Some(reason),
                    });
                }
            }
        }
    }

    fn attempt(&self, request: &ArtifactRequest) -> (Option<AttemptResult>, String) {
        let tracker = &self.ctx.tracker;
        let partial = self.ctx.layout.partial_path(&request.id);
        let resume_from = std::fs::metadata(partial.as_std_path())
            .map(|meta| meta.len())
            .unwrap_or(0);
        let job = FetchJob {
            request,
            partial: &partial,
            resume_from,
            timeout: self.ctx.config.attempt_timeout,
            cancel: &self.ctx.cancel,
        };

        let (outcome, backend) = self.ctx.backends.fetch(&job);
        let result = match outcome {
            FetchOutcome::Success { total_size } => match tracker.verify(request, total_size) {
                Ok(bytes) => AttemptResult::Verified { bytes },
                Err(reason) => AttemptResult::Retryable(reason),
            },
            FetchOutcome::Retryable(reason) => {
                if let Err(err) = tracker.settle_partial(request) {
                    return (Some(AttemptResult::Fatal(FailureReason::Io(err.to_string()))), backend);
                }
                AttemptResult::Retryable(reason)
            }
            FetchOutcome::Fatal(reason) => {
                if let Err(err) = self.ctx.layout.discard_partial(&request.id) {
                    warn!(id = %request.id, %err, "could not discard partial file");
                }
                AttemptResult::Fatal(reason)
            }
            FetchOutcome::Unavailable(message) => {
                AttemptResult::Fatal(FailureReason::BackendUnavailable(message))
            }
            FetchOutcome::Cancelled => return (None, backend),
        };
        (Some(result), backend)
    }

    fn cancelled(
        &self,
        request: Arc<ArtifactRequest>,
        machine: &AttemptMachine,
        started: Instant,
        backend: String,
    ) -> DownloadOutcome {
        let state = self
            .ctx
            .tracker
            .settle_partial(&request)
            .unwrap_or(ArtifactState::Pending);
        info!(id = %request.id, state = %state, "attempt cancelled");
        DownloadOutcome {
            request,
            state,
            attempts: machine.attempts(),
            elapsed: started.elapsed(),
            backend,
            bytes: 0,
            already_present: false,
            error: Some(FailureReason::CancelledByCaller),
        }
    }
}
