use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::Duration;

use crate::cancel::CancelToken;
use crate::domain::{ArtifactRequest, PaperId};

const BACKPRESSURE_POLL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enqueue {
    Accepted,
    Duplicate,
    Full,
    Closed,
}

#[derive(Debug, Default)]
struct QueueState {
    items: VecDeque<Arc<ArtifactRequest>>,
    seen: HashSet<PaperId>,
    closed: bool,
}

#[derive(Debug)]
pub struct TaskQueue {
    capacity: usize,
    state: Mutex<QueueState>,
    not_empty: Condvar,
    not_full: Condvar,
}

impl TaskQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            state: Mutex::new(QueueState::default()),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
        }
    }

    /// Enqueues, blocking while the queue is full. Gives up with `Closed` once
    /// `cancel` fires.
    pub fn push(&self, request: ArtifactRequest, cancel: &CancelToken) -> Enqueue {
        let mut state = self.lock();
        loop {
            if state.closed || cancel.is_cancelled() {
                return Enqueue::Closed;
            }
            if state.seen.contains(&request.id) {
                return Enqueue::Duplicate;
            }
            if state.items.len() < self.capacity {
                break;
            }
            state = self
                .not_full
                .wait_timeout(state, BACKPRESSURE_POLL)
                .map(|(guard, _)| guard)
                .unwrap_or_else(|poisoned| poisoned.into_inner().0);
        }
        state.seen.insert(request.id.clone());
        state.items.push_back(Arc::new(request));
        self.not_empty.notify_one();
        Enqueue::Accepted
    }

    pub fn try_push(&self, request: ArtifactRequest) -> Enqueue {
        let mut state = self.lock();
        if state.closed {
            return Enqueue::Closed;
        }
        if state.seen.contains(&request.id) {
            return Enqueue::Duplicate;
        }
        if state.items.len() >= self.capacity {
            return Enqueue::Full;
        }
        state.seen.insert(request.id.clone());
        state.items.push_back(Arc::new(request));
        self.not_empty.notify_one();
        Enqueue::Accepted
    }

    pub fn pop(&self) -> Option<Arc<ArtifactRequest>> {
        let mut state = self.lock();
        loop {
            if let Some(request) = state.items.pop_front() {
                self.not_full.notify_one();
                return Some(request);
            }
            if state.closed {
                return None;
            }
            state = self
                .not_empty
                .wait(state)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }
    }

    pub fn close(&self) {
        self.lock().closed = true;
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }

    pub fn cancel(&self) -> Vec<Arc<ArtifactRequest>> {
        let mut state = self.lock();
        state.closed = true;
        let discarded = state.items.drain(..).collect();
        self.not_empty.notify_all();
        self.not_full.notify_all();
        discarded
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
