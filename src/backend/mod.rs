mod direct;
mod managed;
mod segmented;
mod tool;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use camino::Utf8Path;
use reqwest::Url;
use tracing::{debug, warn};

pub use direct::DirectTransfer;
pub use managed::ManagedDownloader;
pub use segmented::SegmentedDownloader;

use crate::cancel::CancelToken;
use crate::domain::{ArtifactRequest, BackendKind};
use crate::error::{FailureReason, HarvestError};

#[derive(Debug)]
pub struct FetchJob<'a> {
    pub request: &'a ArtifactRequest,
    /// File the backend writes into; never the final path.
    pub partial: &'a Utf8Path,
    pub resume_from: u64,
    pub timeout: Duration,
    pub cancel: &'a CancelToken,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome {
    Success { total_size: Option<u64> },
    Retryable(FailureReason),
    Fatal(FailureReason),
    /// The tool is missing or cannot be launched; demote, do not count the attempt.
    Unavailable(String),
    Cancelled,
}

impl FetchOutcome {
    pub fn failed(reason: FailureReason) -> Self {
        if reason.is_retryable() {
            FetchOutcome::Retryable(reason)
        } else {
            FetchOutcome::Fatal(reason)
        }
    }
}

pub trait Backend: Send + Sync {
    fn name(&self) -> &str;

    fn supports_resume(&self) -> bool;

    fn fetch(&self, job: &FetchJob<'_>) -> FetchOutcome;
}

pub fn build_backends(kinds: &[BackendKind]) -> Result<Vec<Arc<dyn Backend>>, HarvestError> {
    kinds
        .iter()
        .map(|kind| -> Result<Arc<dyn Backend>, HarvestError> {
            Ok(match kind {
                BackendKind::Segmented => Arc::new(SegmentedDownloader::new()),
                BackendKind::Managed => Arc::new(ManagedDownloader::new()),
                BackendKind::Direct => Arc::new(DirectTransfer::new()?),
            })
        })
        .collect()
}

pub struct BackendChain {
    backends: Vec<Arc<dyn Backend>>,
    active: AtomicUsize,
    demotions: AtomicUsize,
}

impl BackendChain {
    pub fn new(backends: Vec<Arc<dyn Backend>>) -> Self {
        Self {
            backends,
            active: AtomicUsize::new(0),
            demotions: AtomicUsize::new(0),
        }
    }

    pub fn active_name(&self) -> Option<&str> {
        self.backends
            .get(self.active.load(Ordering::SeqCst))
            .map(|backend| backend.name())
    }

    pub fn demotions(&self) -> usize {
        self.demotions.load(Ordering::SeqCst)
    }

    pub fn fetch(&self, job: &FetchJob<'_>) -> (FetchOutcome, String) {
        if let Err(err) = Url::parse(&job.request.source_url) {
            return (
                FetchOutcome::failed(FailureReason::MalformedUrl(format!(
                    "{}: {err}",
                    job.request.source_url
                ))),
                "none".to_string(),
            );
        }

        loop {
            let index = self.active.load(Ordering::SeqCst);
            let Some(backend) = self.backends.get(index) else {
                return (
                    FetchOutcome::Fatal(FailureReason::BackendUnavailable(
                        "no usable backend left".to_string(),
                    )),
                    "none".to_string(),
                );
            };

            let mut resume_from = job.resume_from;
            if resume_from > 0 && !backend.supports_resume() {
                debug!(id = %job.request.id, backend = backend.name(), "backend cannot resume; discarding partial");
                if let Err(err) = std::fs::remove_file(job.partial.as_std_path()) {
                    if err.kind() != std::io::ErrorKind::NotFound {
                        return (
                            FetchOutcome::failed(FailureReason::Io(err.to_string())),
                            backend.name().to_string(),
                        );
                    }
                }
                resume_from = 0;
            }

            let attempt = FetchJob {
                resume_from,
                ..*job
            };
            match backend.fetch(&attempt) {
                FetchOutcome::Unavailable(message) => self.demote(index, &message),
                outcome => return (outcome, backend.name().to_string()),
            }
        }
    }

    fn demote(&self, from: usize, message: &str) {
        if self
            .active
            .compare_exchange(from, from + 1, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            self.demotions.fetch_add(1, Ordering::SeqCst);
            let next = self
                .backends
                .get(from + 1)
                .map(|backend| backend.name())
                .unwrap_or("none");
            warn!(
                backend = self.backends[from].name(),
                next,
                reason = message,
                "backend unavailable, demoting for the rest of the run"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use camino::Utf8PathBuf;
    use chrono::NaiveDate;

    use super::*;
    use crate::domain::{PDF_CONTENT_TYPE, PaperRecord};

    struct MockBackend {
        name: &'static str,
        outcome: FetchOutcome,
        calls: Mutex<usize>,
    }

    impl MockBackend {
        fn new(name: &'static str, outcome: FetchOutcome) -> Arc<Self> {
            Arc::new(Self {
                name,
                outcome,
                calls: Mutex::new(0),
            })
        }

        fn calls(&self) -> usize {
            *self.calls.lock().unwrap()
        }
    }

    impl Backend for MockBackend {
        fn name(&self) -> &str {
            self.name
        }

        fn supports_resume(&self) -> bool {
            true
        }

        fn fetch(&self, _job: &FetchJob<'_>) -> FetchOutcome {
            *self.calls.lock().unwrap() += 1;
            self.outcome.clone()
        }
    }

    fn request(url: &str) -> ArtifactRequest {
        let paper = PaperRecord {
            id: "2410.00001".parse().unwrap(),
            title: "Chained".to_string(),
            authors: vec![],
            summary: String::new(),
            categories: vec![],
            pdf_url: url.to_string(),
            published: NaiveDate::from_ymd_opt(2024, 10, 1).unwrap(),
            updated: None,
            comment: None,
            doi: None,
            pdf_size: None,
        };
        ArtifactRequest {
            id: paper.id.clone(),
            source_url: paper.pdf_url.clone(),
            target: Utf8PathBuf::from("/tmp/pdfs/2024-10-01/2410.00001.pdf"),
            content_type: PDF_CONTENT_TYPE.to_string(),
            expected_size: None,
            paper,
        }
    }

    fn run(chain: &BackendChain, url: &str) -> (FetchOutcome, String) {
        let request = request(url);
        let partial = Utf8PathBuf::from("/tmp/.partial/2410.00001.pdf.part");
        let cancel = CancelToken::new();
        chain.fetch(&FetchJob {
            request: &request,
            partial: &partial,
            resume_from: 0,
            timeout: Duration::from_secs(1),
            cancel: &cancel,
        })
    }

    #[test]
    fn demotes_once_and_sticks() {
        let missing = MockBackend::new("aria2c", FetchOutcome::Unavailable("missing".to_string()));
        let direct = MockBackend::new("direct", FetchOutcome::Success { total_size: None });
        let chain = BackendChain::new(vec![missing.clone(), direct.clone()]);

        for _ in 0..3 {
            let (outcome, used) = run(&chain, "https://arxiv.org/pdf/2410.00001");
            assert_eq!(outcome, FetchOutcome::Success { total_size: None });
            assert_eq!(used, "direct");
        }
        assert_eq!(missing.calls(), 1);
        assert_eq!(direct.calls(), 3);
        assert_eq!(chain.demotions(), 1);
        assert_eq!(chain.active_name(), Some("direct"));
    }

    #[test]
    fn exhausted_chain_is_fatal() {
        let missing = MockBackend::new("aria2c", FetchOutcome::Unavailable("missing".to_string()));
        let chain = BackendChain::new(vec![missing]);
        let (outcome, _) = run(&chain, "https://arxiv.org/pdf/2410.00001");
        assert!(matches!(
            outcome,
            FetchOutcome::Fatal(FailureReason::BackendUnavailable(_))
        ));
    }

    #[test]
    fn malformed_url_never_reaches_a_backend() {
        let direct = MockBackend::new("direct", FetchOutcome::Success { total_size: None });
        let chain = BackendChain::new(vec![direct.clone()]);
        let (outcome, _) = run(&chain, "not a url");
        assert!(matches!(outcome, FetchOutcome::Fatal(FailureReason::MalformedUrl(_))));
        assert_eq!(direct.calls(), 0);
    }
}
