use std::sync::mpsc::Receiver;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{error, info};

use crate::error::{FailureReason, HarvestError};
use crate::layout::{Layout, LayoutEntry, PaperInfo};
use crate::output::{ProgressEvent, ProgressSink};
use crate::pool::DownloadOutcome;
use crate::tracker::ArtifactState;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailedArtifact {
    #[serde(rename = "identity")]
    pub id: String,
    pub reason: String,
    pub detail: String,
    pub attempts: u32,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RunSummary {
    pub requested: usize,
    pub verified: usize,
    pub already_present: usize,
    pub retried_success: usize,
    pub failed: Vec<FailedArtifact>,
    pub cancelled: Vec<String>,
    pub entries: Vec<LayoutEntry>,
    #[serde(serialize_with = "as_secs")]
    pub elapsed: Duration,
}

fn as_secs<S: serde::Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_f64(value.as_secs_f64())
}

pub struct Aggregator<'a> {
    layout: &'a Layout,
    sink: &'a dyn ProgressSink,
    summary: RunSummary,
    started: Instant,
}

impl<'a> Aggregator<'a> {
    pub fn new(layout: &'a Layout, sink: &'a dyn ProgressSink) -> Self {
        Self {
            layout,
            sink,
            summary: RunSummary::default(),
            started: Instant::now(),
        }
    }

    pub fn consume(mut self, outcomes: Receiver<DownloadOutcome>) -> RunSummary {
        for outcome in outcomes {
            self.record(outcome);
        }
        self.finish()
    }

    pub fn record(&mut self, outcome: DownloadOutcome) {
        if outcome.error == Some(FailureReason::CancelledByCaller) {
            self.summary.cancelled.push(outcome.id().to_string());
            self.emit(format!("{} cancelled ({})", outcome.id(), outcome.state), &outcome);
            return;
        }

        match &outcome.state {
            ArtifactState::Verified => match self.place(&outcome) {
                Ok(entry) => {
                    self.summary.verified += 1;
                    if outcome.already_present {
                        self.summary.already_present += 1;
                    } else if outcome.was_retried() {
                        self.summary.retried_success += 1;
                    }
                    self.emit(
                        format!("{} verified via {} ({} bytes)", outcome.id(), outcome.backend, outcome.bytes),
                        &outcome,
                    );
                    self.summary.entries.push(entry);
                }
                Err(err) => {
                    error!(id = %outcome.id(), %err, "could not place verified artifact");
                    self.fail(&outcome, FailureReason::Io(err.to_string()));
                }
            },
            ArtifactState::FailedTerminal(reason) => {
                let reason = reason.clone();
                self.fail(&outcome, reason);
            }
            other => {
                // Non-terminal without cancellation means the worker gave up on it.
                let reason = outcome
                    .error
                    .clone()
                    .unwrap_or_else(|| FailureReason::Io(format!("left in state {other}")));
                self.fail(&outcome, reason);
            }
        }
    }

    pub fn finish(mut self) -> RunSummary {
        self.summary.elapsed = self.started.elapsed();
        self.summary
            .entries
            .sort_by(|a, b| b.published.cmp(&a.published).then_with(|| a.id.cmp(&b.id)));
        self.summary.failed.sort_by(|a, b| a.id.cmp(&b.id));
        self.summary.cancelled.sort();
        info!(
            verified = self.summary.verified,
            already_present = self.summary.already_present,
            retried_success = self.summary.retried_success,
            failed = self.summary.failed.len(),
            cancelled = self.summary.cancelled.len(),
            "run finished"
        );
        self.summary
    }

    /// Metadata first, the PDF move last: a crash in between leaves the
    /// verified file in the partial area, never a half-placed artifact.
    fn place(&self, outcome: &DownloadOutcome) -> Result<LayoutEntry, HarvestError> {
        let request = &outcome.request;
        let date = request.publish_date();
        let info_path = self.layout.info_path(&request.id, date);
        let entry = LayoutEntry {
            id: request.id.to_string(),
            published: date.format("%Y-%m-%d").to_string(),
            pdf_path: request.target.clone(),
            info_path: info_path.clone(),
        };

        if outcome.already_present {
            if !info_path.as_std_path().exists() {
                Layout::write_metadata(&info_path, &PaperInfo::from(&request.paper))?;
            }
            return Ok(entry);
        }

        Layout::write_metadata(&info_path, &PaperInfo::from(&request.paper))?;
        let partial = self.layout.partial_path(&request.id);
        self.layout.promote(&partial, &request.target)?;
        Ok(entry)
    }

    fn fail(&mut self, outcome: &DownloadOutcome, reason: FailureReason) {
        self.summary.failed.push(FailedArtifact {
            id: outcome.id().to_string(),
            reason: reason.kind().to_string(),
            detail: reason.to_string(),
            attempts: outcome.attempts,
        });
        self.emit(format!("{} failed: {reason}", outcome.id()), outcome);
    }

    fn emit(&self, message: String, outcome: &DownloadOutcome) {
        self.sink.event(ProgressEvent {
            message,
            elapsed: Some(outcome.elapsed),
        });
    }
}
