use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crossbeam_channel::{Receiver, Sender};
use tracing::{debug, info};

/// Leadership transitions delivered to a latch holder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeadershipEvent {
    Elected,
    Revoked,
}

/// Membership in one election. Leadership is relinquished when the latch is
/// dropped.
pub struct LeaderLatch {
    path: String,
    candidate: String,
    is_leader: Arc<AtomicBool>,
    events: Receiver<LeadershipEvent>,
    release: Option<Box<dyn FnOnce() + Send>>,
}

impl LeaderLatch {
    pub fn new(
        path: impl Into<String>,
        candidate: impl Into<String>,
        is_leader: Arc<AtomicBool>,
        events: Receiver<LeadershipEvent>,
        release: Box<dyn FnOnce() + Send>,
    ) -> Self {
        Self {
            path: path.into(),
            candidate: candidate.into(),
            is_leader,
            events,
            release: Some(release),
        }
    }

    /// Current leadership, checked without waiting for events.
    pub fn is_leader(&self) -> bool {
        self.is_leader.load(Ordering::Acquire)
    }

    pub fn events(&self) -> &Receiver<LeadershipEvent> {
        &self.events
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn candidate(&self) -> &str {
        &self.candidate
    }
}

impl fmt::Debug for LeaderLatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LeaderLatch")
            .field("path", &self.path)
            .field("candidate", &self.candidate)
            .field("is_leader", &self.is_leader())
            .finish()
    }
}

impl Drop for LeaderLatch {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

struct Candidate {
    id: u64,
    name: String,
    is_leader: Arc<AtomicBool>,
    events: Sender<LeadershipEvent>,
}

impl Candidate {
    fn promote(&self, path: &str) {
        self.is_leader.store(true, Ordering::Release);
        let _ = self.events.send(LeadershipEvent::Elected);
        info!(path, candidate = %self.name, "leadership acquired");
    }

    fn demote(&self, path: &str) {
        self.is_leader.store(false, Ordering::Release);
        let _ = self.events.send(LeadershipEvent::Revoked);
        info!(path, candidate = %self.name, "leadership revoked");
    }
}

#[derive(Default)]
struct ElectionState {
    next_id: u64,
    elections: HashMap<String, VecDeque<Candidate>>,
}

/// In-process elections keyed by path. Candidates queue in join order; the
/// head of the queue leads. Shared by every backend that runs in a single
/// process, so all nodes of an embedded cluster see the same leader.
#[derive(Clone, Default)]
pub struct ElectionRegistry {
    state: Arc<Mutex<ElectionState>>,
}

impl ElectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn join(&self, path: &str, candidate: &str) -> LeaderLatch {
        let (tx, rx) = crossbeam_channel::unbounded();
        let is_leader = Arc::new(AtomicBool::new(false));

        let id = {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            let id = state.next_id;
            state.next_id += 1;
            let queue = state.elections.entry(path.to_string()).or_default();
            queue.push_back(Candidate {
                id,
                name: candidate.to_string(),
                is_leader: is_leader.clone(),
                events: tx,
            });
            debug!(path, candidate, queued = queue.len(), "joined election");
            if queue.len() == 1 {
                queue[0].promote(path);
            }
            id
        };

        let registry = self.clone();
        let release_path = path.to_string();
        LeaderLatch::new(
            path,
            candidate,
            is_leader,
            rx,
            Box::new(move || registry.leave(&release_path, id)),
        )
    }

    /// Strip leadership from the current leader and send it to the back of
    /// the queue, as when its session expires. With a single candidate the
    /// same candidate is re-elected.
    pub fn revoke(&self, path: &str) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let Some(queue) = state.elections.get_mut(path) else {
            return;
        };
        let Some(leader) = queue.pop_front() else {
            return;
        };
        leader.demote(path);
        queue.push_back(leader);
        queue[0].promote(path);
    }

    /// Name of the current leader at `path`, if any.
    pub fn leader(&self, path: &str) -> Option<String> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state
            .elections
            .get(path)
            .and_then(|queue| queue.front())
            .map(|c| c.name.clone())
    }

    fn leave(&self, path: &str, id: u64) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let Some(queue) = state.elections.get_mut(path) else {
            return;
        };
        let Some(position) = queue.iter().position(|c| c.id == id) else {
            return;
        };
        if let Some(gone) = queue.remove(position) {
            gone.is_leader.store(false, Ordering::Release);
            debug!(path, candidate = %gone.name, "left election");
        }
        if position == 0 {
            if let Some(next) = queue.front() {
                next.promote(path);
            }
        }
        if queue.is_empty() {
            state.elections.remove(path);
        }
    }
}
