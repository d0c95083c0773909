//! Resume and integrity bookkeeping.
//!
//! The tracker is the only writer of [`ArtifactState`]. Each identity has its
//! own gate; the shared map is locked only to look a gate up, never across
//! disk work. At most one worker can hold a paper `InProgress`.

use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::io::{self, Read};
use std::sync::{Arc, Mutex, MutexGuard};

use camino::Utf8Path;
use tracing::{debug, warn};

use crate::domain::{ArtifactRequest, PaperId};
use crate::error::{FailureReason, HarvestError};
use crate::layout::Layout;

const PDF_MAGIC: &[u8; 4] = b"%PDF";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArtifactState {
    Pending,
    InProgress,
    PartialOnDisk(u64),
    Verified,
    FailedTerminal(FailureReason),
}

impl ArtifactState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ArtifactState::Verified | ArtifactState::FailedTerminal(_))
    }

    pub fn can_transition_to(&self, next: &ArtifactState) -> bool {
        use ArtifactState::*;
        match (self, next) {
            (Verified, Verified) | (FailedTerminal(_), FailedTerminal(_)) => true,
            (Verified | FailedTerminal(_), _) => false,
            (Pending, Pending | InProgress | FailedTerminal(_)) => true,
            (PartialOnDisk(_), InProgress | PartialOnDisk(_) | Pending | Verified) => true,
            (PartialOnDisk(_), FailedTerminal(_)) => true,
            (InProgress, InProgress | Pending | PartialOnDisk(_) | FailedTerminal(_)) => true,
            _ => false,
        }
    }
}

impl fmt::Display for ArtifactState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArtifactState::Pending => write!(f, "pending"),
            ArtifactState::InProgress => write!(f, "in-progress"),
            ArtifactState::PartialOnDisk(bytes) => write!(f, "partial({bytes})"),
            ArtifactState::Verified => write!(f, "verified"),
            ArtifactState::FailedTerminal(reason) => write!(f, "failed({})", reason.kind()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Claim {
    Owned { resume_from: u64 },
    AlreadyVerified,
    Busy,
    Settled,
}

#[derive(Debug)]
struct Slot {
    state: ArtifactState,
    claimed: bool,
}

#[derive(Debug)]
pub struct ResumeTracker {
    layout: Layout,
    slots: Mutex<HashMap<PaperId, Arc<Mutex<Slot>>>>,
}

impl ResumeTracker {
    pub fn new(layout: Layout) -> Self {
        Self {
            layout,
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// Seeds the state of a newly seen identity from what is already on disk.
    /// Seeding an identity twice returns the current state unchanged. When the
    /// files cannot be inspected the identity is settled as failed.
    pub fn seed(&self, request: &ArtifactRequest) -> Result<ArtifactState, HarvestError> {
        let slot = Arc::new(Mutex::new(Slot {
            state: ArtifactState::Pending,
            claimed: false,
        }));
        let mut guard = {
            let mut slots = lock(&self.slots);
            if let Some(existing) = slots.get(&request.id) {
                let existing = existing.clone();
                drop(slots);
                let state = lock(&existing).state.clone();
                return Ok(state);
            }
            slots.insert(request.id.clone(), slot.clone());
            lock(&slot)
        };

        match self.inspect(request) {
            Ok(state) => {
                debug!(id = %request.id, state = %state, "seeded artifact state");
                guard.state = state.clone();
                Ok(state)
            }
            Err(err) => {
                guard.state = ArtifactState::FailedTerminal(FailureReason::Io(err.to_string()));
                Err(err)
            }
        }
    }

    pub fn state(&self, id: &PaperId) -> Option<ArtifactState> {
        let slot = lock(&self.slots).get(id).cloned()?;
        let state = lock(&slot).state.clone();
        Some(state)
    }

    pub fn claim(&self, id: &PaperId) -> Claim {
        let slot = self.slot_or_pending(id);
        let mut slot = lock(&slot);
        if slot.claimed {
            return if slot.state.is_terminal() {
                Claim::Settled
            } else {
                Claim::Busy
            };
        }
        match slot.state {
            ArtifactState::InProgress => Claim::Busy,
            ArtifactState::Verified => {
                slot.claimed = true;
                Claim::AlreadyVerified
            }
            ArtifactState::FailedTerminal(_) => {
                slot.claimed = true;
                Claim::Settled
            }
            ArtifactState::Pending => {
                slot.claimed = true;
                slot.state = ArtifactState::InProgress;
                Claim::Owned { resume_from: 0 }
            }
            ArtifactState::PartialOnDisk(bytes) => {
                slot.claimed = true;
                slot.state = ArtifactState::InProgress;
                Claim::Owned { resume_from: bytes }
            }
        }
    }

    pub fn transition(&self, id: &PaperId, next: ArtifactState) -> Result<(), HarvestError> {
        let slot = self.slot_or_pending(id);
        let mut slot = lock(&slot);
        apply(id, &mut slot, next)
    }

    pub fn settle_partial(&self, request: &ArtifactRequest) -> Result<ArtifactState, HarvestError> {
        let slot = self.slot_or_pending(&request.id);
        let mut slot = lock(&slot);
        let next = match file_len(self.layout.partial_path(&request.id).as_std_path()) {
            Some(bytes) if bytes > 0 => ArtifactState::PartialOnDisk(bytes),
            _ => ArtifactState::Pending,
        };
        apply(&request.id, &mut slot, next.clone())?;
        Ok(next)
    }

    /// Checks the partial file written by a successful attempt. The state moves
    /// through `PartialOnDisk` and ends `Verified` on success. A truncated file
    /// stays for resume; an empty, oversized or non-PDF file is discarded.
    pub fn verify(
        &self,
        request: &ArtifactRequest,
        learned_size: Option<u64>,
    ) -> Result<u64, FailureReason> {
        let slot = self.slot_or_pending(&request.id);
        let mut slot = lock(&slot);
        let partial = self.layout.partial_path(&request.id);

        let check = check_integrity(&partial, request, learned_size)
            .map_err(|err| FailureReason::Io(err.to_string()))?;
        if slot.state == ArtifactState::InProgress {
            let written = file_len(partial.as_std_path()).unwrap_or(0);
            apply(&request.id, &mut slot, ArtifactState::PartialOnDisk(written))
                .map_err(|err| FailureReason::Io(err.to_string()))?;
        }
        let next = match &check {
            Integrity::Intact(_) => ArtifactState::Verified,
            Integrity::Truncated(reason) => ArtifactState::PartialOnDisk(mismatch_bytes(reason)),
            Integrity::Corrupt(_) => {
                self.layout
                    .discard_partial(&request.id)
                    .map_err(|err| FailureReason::Io(err.to_string()))?;
                ArtifactState::Pending
            }
        };
        apply(&request.id, &mut slot, next).map_err(|err| FailureReason::Io(err.to_string()))?;

        match check {
            Integrity::Intact(bytes) => Ok(bytes),
            Integrity::Truncated(reason) | Integrity::Corrupt(reason) => {
                warn!(id = %request.id, %reason, "downloaded file failed verification");
                Err(reason)
            }
        }
    }

    fn slot_or_pending(&self, id: &PaperId) -> Arc<Mutex<Slot>> {
        lock(&self.slots)
            .entry(id.clone())
            .or_insert_with(|| {
                Arc::new(Mutex::new(Slot {
                    state: ArtifactState::Pending,
                    claimed: false,
                }))
            })
            .clone()
    }

    fn inspect(&self, request: &ArtifactRequest) -> Result<ArtifactState, HarvestError> {
        let partial = self.layout.partial_path(&request.id);

        if request.target.as_std_path().exists() {
            let check = check_integrity(&request.target, request, None)
                .map_err(|err| HarvestError::Filesystem(err.to_string()))?;
            match check {
                Integrity::Intact(_) => return Ok(ArtifactState::Verified),
                Integrity::Truncated(_) => {
                    // Never leave a short file under the final name.
                    self.layout.demote(&request.target, &partial)?;
                }
                Integrity::Corrupt(_) => {
                    fs::remove_file(request.target.as_std_path())
                        .map_err(|err| HarvestError::Filesystem(err.to_string()))?;
                }
            }
        }

        match file_len(partial.as_std_path()) {
            Some(0) => {
                self.layout.discard_partial(&request.id)?;
                Ok(ArtifactState::Pending)
            }
            Some(bytes) => Ok(ArtifactState::PartialOnDisk(bytes)),
            None => Ok(ArtifactState::Pending),
        }
    }
}

fn apply(id: &PaperId, slot: &mut Slot, next: ArtifactState) -> Result<(), HarvestError> {
    if !slot.state.can_transition_to(&next) {
        return Err(HarvestError::StateTransition {
            id: id.to_string(),
            from: slot.state.to_string(),
            to: next.to_string(),
        });
    }
    slot.state = next;
    Ok(())
}

#[derive(Debug)]
enum Integrity {
    Intact(u64),
    Truncated(FailureReason),
    Corrupt(FailureReason),
}

fn mismatch_bytes(reason: &FailureReason) -> u64 {
    match reason {
        FailureReason::IntegrityMismatch { actual, .. } => *actual,
        _ => 0,
    }
}

fn check_integrity(
    path: &Utf8Path,
    request: &ArtifactRequest,
    learned_size: Option<u64>,
) -> io::Result<Integrity> {
    let actual = file_len(path.as_std_path()).unwrap_or(0);
    let expected = request.expected_size.or(learned_size);
    let mismatch = |bad_magic| FailureReason::IntegrityMismatch {
        expected,
        actual,
        bad_magic,
    };

    if actual == 0 {
        return Ok(Integrity::Corrupt(mismatch(false)));
    }
    if request.expects_pdf() && actual >= PDF_MAGIC.len() as u64 {
        let mut head = [0u8; 4];
        fs::File::open(path.as_std_path())?.read_exact(&mut head)?;
        if &head != PDF_MAGIC {
            return Ok(Integrity::Corrupt(mismatch(true)));
        }
    }
    match expected {
        Some(size) if actual < size => Ok(Integrity::Truncated(mismatch(false))),
        Some(size) if actual > size => Ok(Integrity::Corrupt(mismatch(false))),
        None if request.expects_pdf() && actual < PDF_MAGIC.len() as u64 => {
            Ok(Integrity::Corrupt(mismatch(true)))
        }
        _ => Ok(Integrity::Intact(actual)),
    }
}

fn file_len(path: &std::path::Path) -> Option<u64> {
    fs::metadata(path).ok().filter(|meta| meta.is_file()).map(|meta| meta.len())
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
