use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use crate::backend::tool::{ToolRun, run_with_deadline};
use crate::backend::{Backend, FetchJob, FetchOutcome};
use crate::cancel::Deadline;
use crate::error::FailureReason;

const TOOL: &str = "idm";
const INSTALL_PATHS: &[&str] = &[
    r"C:\Program Files (x86)\Internet Download Manager\IDMan.exe",
    r"C:\Program Files\Internet Download Manager\IDMan.exe",
];
const SETTLE_INTERVAL: Duration = Duration::from_secs(1);

/// Hands the transfer to an installed download manager, then waits for the
/// file to appear with a stable size. The manager's exit status says nothing
/// about completion.
#[derive(Debug, Clone)]
pub struct ManagedDownloader {
    program: Option<PathBuf>,
}

impl ManagedDownloader {
    pub fn new() -> Self {
        let program = INSTALL_PATHS
            .iter()
            .map(PathBuf::from)
            .find(|path| path.exists())
            .or_else(|| which::which("IDMan").ok());
        Self { program }
    }

    pub fn with_program(program: PathBuf) -> Self {
        Self {
            program: Some(program),
        }
    }

    fn args(job: &FetchJob<'_>) -> Vec<String> {
        let dir = job
            .partial
            .parent()
            .map(|dir| dir.to_string())
            .unwrap_or_else(|| ".".to_string());
        let name = job.partial.file_name().unwrap_or_default().to_string();
        vec![
            "/d".to_string(),
            job.request.source_url.clone(),
            "/p".to_string(),
            dir,
            "/f".to_string(),
            name,
            "/q".to_string(),
            "/n".to_string(),
        ]
    }

    fn wait_for_file(job: &FetchJob<'_>, deadline: Deadline) -> FetchOutcome {
        let mut last_len = None;
        loop {
            let len = fs::metadata(job.partial.as_std_path())
                .ok()
                .map(|meta| meta.len());
            if let (Some(len), Some(previous)) = (len, last_len) {
                if len > 0 && len == previous {
                    return FetchOutcome::Success { total_size: None };
                }
            }
            last_len = len;
            if deadline.is_past() {
                return FetchOutcome::failed(FailureReason::Timeout(job.timeout));
            }
            if !job.cancel.sleep(SETTLE_INTERVAL) {
                return FetchOutcome::Cancelled;
            }
        }
    }
}

impl Default for ManagedDownloader {
    fn default() -> Self {
        Self::new()
    }
}

impl Backend for ManagedDownloader {
    fn name(&self) -> &str {
        TOOL
    }

    fn supports_resume(&self) -> bool {
        false
    }

    fn fetch(&self, job: &FetchJob<'_>) -> FetchOutcome {
        let Some(program) = &self.program else {
            return FetchOutcome::Unavailable("download manager not installed".to_string());
        };
        let deadline = Deadline::after(job.timeout);
        match run_with_deadline(program, &Self::args(job), job.timeout, job.cancel) {
            ToolRun::Exited { status, stderr } if !status.success() => {
                FetchOutcome::failed(FailureReason::ToolFailed {
                    tool: TOOL.to_string(),
                    message: if stderr.is_empty() {
                        status.to_string()
                    } else {
                        stderr
                    },
                    retryable: true,
                })
            }
            ToolRun::Exited { .. } => Self::wait_for_file(job, deadline),
            ToolRun::Missing(message) => FetchOutcome::Unavailable(message),
            ToolRun::TimedOut => FetchOutcome::failed(FailureReason::Timeout(job.timeout)),
            ToolRun::Cancelled => FetchOutcome::Cancelled,
            ToolRun::Failed(message) => FetchOutcome::failed(FailureReason::ToolFailed {
                tool: TOOL.to_string(),
                message,
                retryable: true,
            }),
        }
    }
}
