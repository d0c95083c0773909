use std::fs::OpenOptions;
use std::io::{self, Read, Write};
use std::time::Duration;

use reqwest::StatusCode;
use reqwest::blocking::{Client, Response};
use reqwest::header::{
    CONTENT_LENGTH, CONTENT_RANGE, HeaderMap, HeaderValue, RANGE, USER_AGENT,
};
use tracing::debug;

use crate::backend::{Backend, FetchJob, FetchOutcome};
use crate::error::{FailureReason, HarvestError};

const NAME: &str = "direct";
const CHUNK_SIZE: usize = 64 * 1024;

#[derive(Clone)]
pub struct DirectTransfer {
    client: Client,
}

impl DirectTransfer {
    pub fn new() -> Result<Self, HarvestError> {
        let client = Self::client_builder()?
            .build()
            .map_err(|err| HarvestError::HttpClient(err.to_string()))?;
        Ok(Self { client })
    }

    pub fn without_proxy() -> Result<Self, HarvestError> {
        let client = Self::client_builder()?
            .no_proxy()
            .build()
            .map_err(|err| HarvestError::HttpClient(err.to_string()))?;
        Ok(Self { client })
    }

    fn client_builder() -> Result<reqwest::blocking::ClientBuilder, HarvestError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!("paper-harvest/{}", env!("CARGO_PKG_VERSION")))
                .map_err(|err| HarvestError::HttpClient(err.to_string()))?,
        );
        Ok(Client::builder()
            .default_headers(headers)
            .connect_timeout(Duration::from_secs(10)))
    }

    fn get(&self, job: &FetchJob<'_>, resume_from: u64) -> Result<Response, FetchOutcome> {
        let mut request = self
            .client
            .get(&job.request.source_url)
            .timeout(job.timeout);
        if resume_from > 0 {
            request = request.header(RANGE, format!("bytes={resume_from}-"));
        }
        request.send().map_err(|err| classify_error(&err, job.timeout))
    }

    fn restart(&self, job: &FetchJob<'_>) -> FetchOutcome {
        let response = match self.get(job, 0) {
            Ok(response) => response,
            Err(outcome) => return outcome,
        };
        let status = response.status();
        if status.is_success() {
            self.write_body(response, job, false)
        } else {
            classify_status(status.as_u16(), &job.request.source_url)
        }
    }

    fn write_body(
        &self,
        mut response: Response,
        job: &FetchJob<'_>,
        append: bool,
    ) -> FetchOutcome {
        let offset = if append { job.resume_from } else { 0 };
        let total_size = total_size(response.headers(), offset);

        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .append(append)
            .truncate(!append)
            .open(job.partial.as_std_path());
        let mut file = match file {
            Ok(file) => file,
            Err(err) => return FetchOutcome::failed(io_reason(err)),
        };

        let mut buffer = vec![0u8; CHUNK_SIZE];
        loop {
            if job.cancel.is_cancelled() {
                let _ = file.flush();
                return FetchOutcome::Cancelled;
            }
            let read = match response.read(&mut buffer) {
                Ok(0) => break,
                Ok(read) => read,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    let _ = file.flush();
                    return FetchOutcome::failed(read_reason(err, job.timeout));
                }
            };
            if let Err(err) = file.write_all(&buffer[..read]) {
                return FetchOutcome::failed(io_reason(err));
            }
        }
        if let Err(err) = file.flush() {
            return FetchOutcome::failed(io_reason(err));
        }
        FetchOutcome::Success { total_size }
    }
}

impl Backend for DirectTransfer {
    fn name(&self) -> &str {
        NAME
    }

    fn supports_resume(&self) -> bool {
        true
    }

    fn fetch(&self, job: &FetchJob<'_>) -> FetchOutcome {
        let response = match self.get(job, job.resume_from) {
            Ok(response) => response,
            Err(outcome) => return outcome,
        };

        let status = response.status();
        debug!(id = %job.request.id, status = status.as_u16(), resume_from = job.resume_from, "direct response");
        match status {
            StatusCode::PARTIAL_CONTENT if job.resume_from > 0 => {
                if range_start(response.headers()) == Some(job.resume_from) {
                    self.write_body(response, job, true)
                } else {
                    debug!(id = %job.request.id, "range reply does not continue the partial file, restarting");
                    self.restart(job)
                }
            }
            StatusCode::RANGE_NOT_SATISFIABLE if job.resume_from > 0 => {
                match range_total(response.headers()) {
                    Some(total) if total == job.resume_from => FetchOutcome::Success {
                        total_size: Some(total),
                    },
                    _ => {
                        debug!(id = %job.request.id, "partial file does not match the remote length, restarting");
                        self.restart(job)
                    }
                }
            }
            status if status.is_success() => self.write_body(response, job, false),
            status => classify_status(status.as_u16(), &job.request.source_url),
        }
    }
}

pub(crate) fn classify_status(status: u16, url: &str) -> FetchOutcome {
    FetchOutcome::failed(match status {
        404 | 410 => FailureReason::NotFound(url.to_string()),
        401 | 403 => FailureReason::PermissionDenied(format!("{url} returned {status}")),
        status => FailureReason::HttpStatus(status),
    })
}

fn classify_error(err: &reqwest::Error, timeout: Duration) -> FetchOutcome {
    FetchOutcome::failed(if err.is_builder() {
        FailureReason::MalformedUrl(err.to_string())
    } else if err.is_timeout() {
        FailureReason::Timeout(timeout)
    } else {
        FailureReason::TransientNetwork(err.to_string())
    })
}

fn read_reason(err: io::Error, timeout: Duration) -> FailureReason {
    if err.kind() == io::ErrorKind::TimedOut {
        FailureReason::Timeout(timeout)
    } else {
        FailureReason::TransientNetwork(err.to_string())
    }
}

fn io_reason(err: io::Error) -> FailureReason {
    if err.kind() == io::ErrorKind::PermissionDenied {
        FailureReason::PermissionDenied(err.to_string())
    } else {
        FailureReason::Io(err.to_string())
    }
}

fn total_size(headers: &HeaderMap, offset: u64) -> Option<u64> {
    range_total(headers).or_else(|| {
        headers
            .get(CONTENT_LENGTH)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.trim().parse::<u64>().ok())
            .map(|len| offset + len)
    })
}

fn range_start(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(CONTENT_RANGE)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().strip_prefix("bytes "))
        .and_then(|value| value.split_once('-'))
        .and_then(|(start, _)| start.trim().parse::<u64>().ok())
}

fn range_total(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(CONTENT_RANGE)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.rsplit_once('/'))
        .and_then(|(_, total)| total.trim().parse::<u64>().ok())
}
