use std::path::PathBuf;

use crate::backend::tool::{ToolRun, run_with_deadline};
use crate::backend::{Backend, FetchJob, FetchOutcome};
use crate::error::FailureReason;

const TOOL: &str = "aria2c";

#[derive(Debug, Clone)]
pub struct SegmentedDownloader {
    program: Option<PathBuf>,
    connections: u32,
}

impl SegmentedDownloader {
    pub fn new() -> Self {
        Self {
            program: which::which(TOOL).ok(),
            connections: 16,
        }
    }

    pub fn with_program(program: PathBuf) -> Self {
        Self {
            program: Some(program),
            connections: 16,
        }
    }

    fn args(&self, job: &FetchJob<'_>) -> Vec<String> {
        let dir = job
            .partial
            .parent()
            .map(|dir| dir.to_string())
            .unwrap_or_else(|| ".".to_string());
        let name = job.partial.file_name().unwrap_or_default().to_string();
        let mut args = vec![
            format!("--max-connection-per-server={}", self.connections),
            format!("--split={}", self.connections),
            "--min-split-size=1M".to_string(),
            "--file-allocation=none".to_string(),
            "--max-tries=1".to_string(),
            "--connect-timeout=10".to_string(),
            format!("--timeout={}", job.timeout.as_secs().max(1)),
            "--auto-file-renaming=false".to_string(),
            "--allow-overwrite=true".to_string(),
            "--quiet=true".to_string(),
            "--console-log-level=error".to_string(),
            format!("--dir={dir}"),
            format!("--out={name}"),
        ];
        if job.resume_from > 0 {
            args.push("--continue=true".to_string());
        }
        args.push(job.request.source_url.clone());
        args
    }
}

impl Default for SegmentedDownloader {
    fn default() -> Self {
        Self::new()
    }
}

impl Backend for SegmentedDownloader {
    fn name(&self) -> &str {
        TOOL
    }

    fn supports_resume(&self) -> bool {
        true
    }

    fn fetch(&self, job: &FetchJob<'_>) -> FetchOutcome {
        let Some(program) = &self.program else {
            return FetchOutcome::Unavailable(format!("{TOOL} not found on PATH"));
        };
        match run_with_deadline(program, &self.args(job), job.timeout, job.cancel) {
            ToolRun::Exited { status, stderr } => match status.code() {
                Some(0) => FetchOutcome::Success { total_size: None },
                code => classify_exit(code, stderr),
            },
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

fn classify_exit(code: Option<i32>, stderr: String) -> FetchOutcome {
    let message = if stderr.is_empty() {
        format!("exit status {}", code.map(|c| c.to_string()).unwrap_or_else(|| "signal".to_string()))
    } else {
        stderr
    };
    let reason = match code {
        Some(3) | Some(4) => FailureReason::NotFound(message),
        Some(24) => FailureReason::PermissionDenied(message),
        Some(9) | Some(16) | Some(17) | Some(18) => FailureReason::Io(message),
        Some(2) | Some(6) | Some(19) => FailureReason::TransientNetwork(message),
        code => FailureReason::ToolFailed {
            tool: TOOL.to_string(),
            message,
            // 28: aria2c rejected its own options.
            retryable: code != Some(28),
        },
    };
    FetchOutcome::failed(reason)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use camino::Utf8PathBuf;
    use chrono::NaiveDate;

    use super::*;
    use crate::cancel::CancelToken;
    use crate::domain::{ArtifactRequest, PDF_CONTENT_TYPE, PaperRecord};

    fn request() -> ArtifactRequest {
        let paper = PaperRecord {
            id: "2401.00001".parse().unwrap(),
            title: "A paper".to_string(),
            authors: vec![],
            summary: String::new(),
            categories: vec![],
            pdf_url: "https://arxiv.org/pdf/2401.00001".to_string(),
            published: NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
            updated: None,
            comment: None,
            doi: None,
            pdf_size: None,
        };
        ArtifactRequest {
            id: paper.id.clone(),
            source_url: paper.pdf_url.clone(),
            target: Utf8PathBuf::from("/tmp/pdfs/2024-01-01/2401.00001.pdf"),
            content_type: PDF_CONTENT_TYPE.to_string(),
            expected_size: None,
            paper,
        }
    }

    #[test]
    fn args_write_into_partial_area() {
        let request = request();
        let partial = Utf8PathBuf::from("/tmp/.partial/2401.00001.pdf.part");
        let cancel = CancelToken::new();
        let job = FetchJob {
            request: &request,
            partial: &partial,
            resume_from: 10,
            timeout: Duration::from_secs(30),
            cancel: &cancel,
        };
        let args = SegmentedDownloader::with_program(PathBuf::from("aria2c")).args(&job);
        assert!(args.contains(&"--dir=/tmp/.partial".to_string()));
        assert!(args.contains(&"--out=2401.00001.pdf.part".to_string()));
        assert!(args.contains(&"--continue=true".to_string()));
        assert_eq!(args.last().unwrap(), "https://arxiv.org/pdf/2401.00001");
    }

    #[test]
    fn not_found_exit_is_fatal() {
        let outcome = classify_exit(Some(3), String::new());
        assert_eq!(
            outcome,
            FetchOutcome::Fatal(FailureReason::NotFound("exit status 3".to_string()))
        );
        assert!(matches!(
            classify_exit(Some(6), "network".to_string()),
            FetchOutcome::Retryable(_)
        ));
    }

    #[test]
    fn bad_option_exit_is_fatal_tool_failure() {
        assert!(matches!(
            classify_exit(Some(28), "unrecognized option".to_string()),
            FetchOutcome::Fatal(FailureReason::ToolFailed { retryable: false, .. })
        ));
        assert!(matches!(
            classify_exit(Some(1), String::new()),
            FetchOutcome::Retryable(FailureReason::ToolFailed { retryable: true, .. })
        ));
    }

    #[test]
    fn missing_tool_is_unavailable() {
        let backend = SegmentedDownloader {
            program: None,
            connections: 16,
        };
        let request = request();
        let partial = Utf8PathBuf::from("/tmp/.partial/2401.00001.pdf.part");
        let cancel = CancelToken::new();
        let job = FetchJob {
            request: &request,
            partial: &partial,
            resume_from: 0,
            timeout: Duration::from_secs(1),
            cancel: &cancel,
        };
        assert!(matches!(backend.fetch(&job), FetchOutcome::Unavailable(_)));
    }
}
