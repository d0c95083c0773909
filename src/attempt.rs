use std::time::Duration;

use crate::config::BackoffPolicy;
use crate::error::FailureReason;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptResult {
    Verified { bytes: u64 },
    Retryable(FailureReason),
    Fatal(FailureReason),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    Attempt(u32),
    Backoff { next_attempt: u32, delay: Duration },
    Verified { attempts: u32, bytes: u64 },
    Failed { attempts: u32, reason: FailureReason },
}

impl Step {
    pub fn is_final(&self) -> bool {
        matches!(self, Step::Verified { .. } | Step::Failed { .. })
    }
}

#[derive(Debug, Clone)]
pub struct AttemptMachine {
    max_attempts: u32,
    backoff: BackoffPolicy,
    attempts: u32,
    step: Step,
}

impl AttemptMachine {
    pub fn new(max_attempts: u32, backoff: BackoffPolicy) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff,
            attempts: 0,
            step: Step::Attempt(1),
        }
    }

    pub fn step(&self) -> &Step {
        &self.step
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn begin(&mut self) -> Option<u32> {
        match self.step {
            Step::Attempt(n) if self.attempts < n => {
                self.attempts = n;
                Some(n)
            }
            _ => None,
        }
    }

    pub fn record(&mut self, result: AttemptResult) -> &Step {
        if self.step.is_final() {
            return &self.step;
        }
        self.step = match result {
            AttemptResult::Verified { bytes } => Step::Verified {
                attempts: self.attempts,
                bytes,
            },
            AttemptResult::Fatal(reason) => Step::Failed {
                attempts: self.attempts,
                reason,
            },
            AttemptResult::Retryable(reason) if self.attempts >= self.max_attempts => {
                Step::Failed {
                    attempts: self.attempts,
                    reason,
                }
            }
            AttemptResult::Retryable(_) => {
                let next_attempt = self.attempts + 1;
                Step::Backoff {
                    next_attempt,
                    delay: self.backoff.delay_before(next_attempt),
                }
            }
        };
        &self.step
    }

    pub fn resume(&mut self) {
        if let Step::Backoff { next_attempt, .. } = self.step {
            self.step = Step::Attempt(next_attempt);
        }
    }
}
