use std::fs;
use std::sync::Arc;
use std::thread;

use assert_matches::assert_matches;
use camino::Utf8PathBuf;
use chrono::NaiveDate;

use paper_harvest::domain::{ArtifactRequest, PaperRecord};
use paper_harvest::error::{FailureReason, HarvestError};
use paper_harvest::layout::Layout;
use paper_harvest::pipeline::request_for;
use paper_harvest::tracker::{ArtifactState, Claim, ResumeTracker};

fn setup() -> (tempfile::TempDir, Layout) {
    let temp = tempfile::tempdir().unwrap();
    let root = Utf8PathBuf::from_path_buf(temp.path().join("papers")).unwrap();
    let layout = Layout::new(root);
    layout.ensure_root().unwrap();
    (temp, layout)
}

fn request(layout: &Layout, id: &str, expected_size: Option<u64>) -> ArtifactRequest {
    let paper = PaperRecord {
        id: id.parse().unwrap(),
        title: "Tracked".to_string(),
        authors: Vec::new(),
        summary: String::new(),
        categories: Vec::new(),
        pdf_url: format!("https://arxiv.org/pdf/{id}"),
        published: NaiveDate::from_ymd_opt(2024, 6, 10).unwrap(),
        updated: None,
        comment: None,
        doi: None,
        pdf_size: expected_size,
    };
    request_for(layout, paper)
}

fn pdf(len: usize) -> Vec<u8> {
    let mut bytes = b"%PDF-1.4\n".to_vec();
    bytes.resize(len, b'0');
    bytes
}

fn place_final(request: &ArtifactRequest, bytes: &[u8]) {
    fs::create_dir_all(request.target.parent().unwrap().as_std_path()).unwrap();
    fs::write(request.target.as_std_path(), bytes).unwrap();
}

#[test]
fn fresh_identity_seeds_pending() {
    let (_temp, layout) = setup();
    let tracker = ResumeTracker::new(layout.clone());
    let request = request(&layout, "2406.00001", None);
    assert_eq!(tracker.seed(&request).unwrap(), ArtifactState::Pending);
    assert_eq!(tracker.claim(&request.id), Claim::Owned { resume_from: 0 });
    assert_eq!(tracker.state(&request.id), Some(ArtifactState::InProgress));
}

#[test]
fn complete_final_file_seeds_verified() {
    let (_temp, layout) = setup();
    let tracker = ResumeTracker::new(layout.clone());
    let request = request(&layout, "2406.00002", Some(1000));
    place_final(&request, &pdf(1000));

    assert_eq!(tracker.seed(&request).unwrap(), ArtifactState::Verified);
    assert_eq!(tracker.claim(&request.id), Claim::AlreadyVerified);
    assert_eq!(tracker.claim(&request.id), Claim::Settled);
}

#[test]
fn short_final_file_moves_back_to_partial_area() {
    let (_temp, layout) = setup();
    let tracker = ResumeTracker::new(layout.clone());
    let request = request(&layout, "2406.00003", Some(1000));
    place_final(&request, &pdf(400));

    assert_eq!(tracker.seed(&request).unwrap(), ArtifactState::PartialOnDisk(400));
    assert!(!request.target.as_std_path().exists());
    assert_eq!(
        fs::metadata(layout.partial_path(&request.id).as_std_path()).unwrap().len(),
        400
    );
    assert_eq!(tracker.claim(&request.id), Claim::Owned { resume_from: 400 });
}

#[test]
fn corrupt_final_file_is_removed() {
    let (_temp, layout) = setup();
    let tracker = ResumeTracker::new(layout.clone());
    let request = request(&layout, "2406.00004", None);
    place_final(&request, b"<!DOCTYPE html><title>Error</title>");

    assert_eq!(tracker.seed(&request).unwrap(), ArtifactState::Pending);
    assert!(!request.target.as_std_path().exists());
}

#[test]
fn empty_partial_is_discarded() {
    let (_temp, layout) = setup();
    let tracker = ResumeTracker::new(layout.clone());
    let request = request(&layout, "2406.00005", None);
    let partial = layout.partial_path(&request.id);
    fs::write(partial.as_std_path(), b"").unwrap();

    assert_eq!(tracker.seed(&request).unwrap(), ArtifactState::Pending);
    assert!(!partial.as_std_path().exists());
}

#[test]
fn only_one_claim_wins() {
    let (_temp, layout) = setup();
    let tracker = Arc::new(ResumeTracker::new(layout.clone()));
    let request = request(&layout, "2406.00006", None);
    tracker.seed(&request).unwrap();

    let claims: Vec<Claim> = (0..8)
        .map(|_| {
            let tracker = tracker.clone();
            let id = request.id.clone();
            thread::spawn(move || tracker.claim(&id))
        })
        .collect::<Vec<_>>()
        .into_iter()
        .map(|handle| handle.join().unwrap())
        .collect();

    let owned = claims
        .iter()
        .filter(|claim| matches!(claim, Claim::Owned { .. }))
        .count();
    assert_eq!(owned, 1);
    assert!(
        claims
            .iter()
            .all(|claim| matches!(claim, Claim::Owned { .. } | Claim::Busy))
    );
}

#[test]
fn verify_accepts_complete_pdf() {
    let (_temp, layout) = setup();
    let tracker = ResumeTracker::new(layout.clone());
    let request = request(&layout, "2406.00007", Some(64));
    tracker.seed(&request).unwrap();
    tracker.claim(&request.id);
    fs::write(layout.partial_path(&request.id).as_std_path(), pdf(64)).unwrap();

    assert_eq!(tracker.verify(&request, None).unwrap(), 64);
    assert_eq!(tracker.state(&request.id), Some(ArtifactState::Verified));
}

#[test]
fn verify_uses_size_learned_from_server() {
    let (_temp, layout) = setup();
    let tracker = ResumeTracker::new(layout.clone());
    let request = request(&layout, "2406.00008", None);
    tracker.seed(&request).unwrap();
    tracker.claim(&request.id);
    fs::write(layout.partial_path(&request.id).as_std_path(), pdf(50)).unwrap();

    let reason = tracker.verify(&request, Some(80)).unwrap_err();
    assert_matches!(
        reason,
        FailureReason::IntegrityMismatch {
            expected: Some(80),
            actual: 50,
            bad_magic: false
        }
    );
    assert!(reason.is_retryable());
    assert_eq!(tracker.state(&request.id), Some(ArtifactState::PartialOnDisk(50)));
}

#[test]
fn oversized_partial_is_discarded() {
    let (_temp, layout) = setup();
    let tracker = ResumeTracker::new(layout.clone());
    let request = request(&layout, "2406.00009", Some(10));
    tracker.seed(&request).unwrap();
    tracker.claim(&request.id);
    let partial = layout.partial_path(&request.id);
    fs::write(partial.as_std_path(), pdf(20)).unwrap();

    assert!(tracker.verify(&request, None).is_err());
    assert_eq!(tracker.state(&request.id), Some(ArtifactState::Pending));
    assert!(!partial.as_std_path().exists());
}

#[test]
fn verified_identity_is_never_reopened() {
    let (_temp, layout) = setup();
    let tracker = ResumeTracker::new(layout.clone());
    let request = request(&layout, "2406.00010", None);
    place_final(&request, &pdf(32));
    tracker.seed(&request).unwrap();

    let err = tracker
        .transition(&request.id, ArtifactState::InProgress)
        .unwrap_err();
    assert_matches!(err, HarvestError::StateTransition { .. });
    assert_eq!(tracker.state(&request.id), Some(ArtifactState::Verified));
}

#[test]
fn settle_partial_reflects_bytes_on_disk() {
    let (_temp, layout) = setup();
    let tracker = ResumeTracker::new(layout.clone());
    let request = request(&layout, "2406.00011", None);
    tracker.seed(&request).unwrap();
    tracker.claim(&request.id);

    assert_eq!(tracker.settle_partial(&request).unwrap(), ArtifactState::Pending);
    tracker.transition(&request.id, ArtifactState::InProgress).unwrap();
    fs::write(layout.partial_path(&request.id).as_std_path(), pdf(12)).unwrap();
    assert_eq!(
        tracker.settle_partial(&request).unwrap(),
        ArtifactState::PartialOnDisk(12)
    );
}

#[test]
fn uninspectable_identity_is_settled_failed() {
    let (_temp, layout) = setup();
    let tracker = ResumeTracker::new(layout.clone());
    let request = request(&layout, "2406.00090", None);
    // A directory squatting on the final path cannot be inspected or removed.
    fs::create_dir_all(request.target.as_std_path()).unwrap();

    let err = tracker.seed(&request).unwrap_err();
    assert_matches!(err, HarvestError::Filesystem(_));
    assert_matches!(
        tracker.state(&request.id),
        Some(ArtifactState::FailedTerminal(FailureReason::Io(_)))
    );

    // A repeated record for the same identity is never handed to a worker.
    assert_matches!(
        tracker.seed(&request),
        Ok(ArtifactState::FailedTerminal(_))
    );
    assert_eq!(tracker.claim(&request.id), Claim::Settled);
}

#[test]
fn seeding_one_identity_leaves_other_gates_usable() {
    let (_temp, layout) = setup();
    let tracker = Arc::new(ResumeTracker::new(layout.clone()));
    let busy = request(&layout, "2406.00091", Some(1000));
    tracker.seed(&busy).unwrap();
    assert_eq!(tracker.claim(&busy.id), Claim::Owned { resume_from: 0 });

    let handles: Vec<_> = (0..4)
        .map(|n| {
            let tracker = tracker.clone();
            let request = request(&layout, &format!("2406.{:05}", 100 + n), Some(1000));
            thread::spawn(move || {
                place_final(&request, &pdf(1000));
                tracker.seed(&request).unwrap()
            })
        })
        .collect();
    for handle in handles {
        assert_eq!(handle.join().unwrap(), ArtifactState::Verified);
    }
    tracker.transition(&busy.id, ArtifactState::Pending).unwrap();
    assert_eq!(tracker.state(&busy.id), Some(ArtifactState::Pending));
}
