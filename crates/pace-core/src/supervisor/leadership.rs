use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvError, RecvTimeoutError, Sender};
use tracing::{debug, info, warn};

use crate::balancer::BalancerJob;
use crate::error::{PaceError, Result};
use crate::store::{LeaderLatch, LeadershipEvent};

/// Delay before retrying a failed attempt to join the election.
const ELECTION_RETRY: Duration = Duration::from_secs(1);

enum BalancerCommand {
    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LeadershipState {
    Follower,
    Leader { next_run: Instant },
}

/// Runs the [`BalancerJob`] on whichever node holds the election. Every node
/// runs one; followers only wait for leadership, and a node stops running
/// the job as soon as leadership is revoked.
pub struct BalancerSupervisor {
    commands: Sender<BalancerCommand>,
    leading: Arc<AtomicBool>,
    thread: Option<thread::JoinHandle<()>>,
}

impl BalancerSupervisor {
    #[tracing::instrument(skip_all, fields(candidate = %candidate, leader_path = %leader_path))]
    pub fn spawn(
        job: BalancerJob,
        leader_path: String,
        candidate: String,
        interval: Duration,
    ) -> Result<Self> {
        let (tx, rx) = crossbeam_channel::bounded(1);
        let leading = Arc::new(AtomicBool::new(false));
        let loop_leading = leading.clone();
        let thread = thread::Builder::new()
            .name("pace-balancer".to_string())
            .spawn(move || {
                let mut supervisor = BalancerLoop {
                    job,
                    leader_path,
                    candidate,
                    interval,
                    commands: rx,
                    latch: None,
                    state: LeadershipState::Follower,
                    leading: loop_leading,
                    running: true,
                };
                supervisor.run();
            })
            .map_err(|e| PaceError::SupervisorSpawn(e.to_string()))?;

        info!("balancer supervisor started");

        Ok(Self {
            commands: tx,
            leading,
            thread: Some(thread),
        })
    }

    /// Whether this node is currently running the balancer.
    pub fn is_leader(&self) -> bool {
        self.leading.load(Ordering::Acquire)
    }

    /// Leave the election and wait for the thread to exit.
    #[tracing::instrument(skip_all)]
    pub fn shutdown(mut self) -> Result<()> {
        let _ = self.commands.send(BalancerCommand::Shutdown);
        if let Some(thread) = self.thread.take() {
            thread.join().map_err(|_| PaceError::SupervisorPanicked)?;
        }
        info!("balancer supervisor stopped");
        Ok(())
    }
}

impl Drop for BalancerSupervisor {
    fn drop(&mut self) {
        if let Some(thread) = self.thread.take() {
            let _ = self.commands.send(BalancerCommand::Shutdown);
            let _ = thread.join();
        }
    }
}

enum Wake {
    Event(std::result::Result<LeadershipEvent, RecvError>),
    Command(std::result::Result<BalancerCommand, RecvError>),
    Timeout,
}

struct BalancerLoop {
    job: BalancerJob,
    leader_path: String,
    candidate: String,
    interval: Duration,
    commands: Receiver<BalancerCommand>,
    latch: Option<LeaderLatch>,
    state: LeadershipState,
    leading: Arc<AtomicBool>,
    running: bool,
}

impl BalancerLoop {
    fn run(&mut self) {
        while self.running {
            let Some(latch) = &self.latch else {
                self.join_election();
                continue;
            };

            let timeout = match self.state {
                LeadershipState::Follower => self.interval,
                LeadershipState::Leader { next_run } => {
                    next_run.saturating_duration_since(Instant::now())
                }
            };
            let wake = crossbeam_channel::select! {
                recv(latch.events()) -> event => Wake::Event(event),
                recv(self.commands) -> cmd => Wake::Command(cmd),
                default(timeout) => Wake::Timeout,
            };

            match wake {
                Wake::Event(Ok(LeadershipEvent::Elected)) => self.become_leader(),
                Wake::Event(Ok(LeadershipEvent::Revoked)) => self.become_follower(),
                Wake::Event(Err(_)) => {
                    warn!(candidate = %self.candidate, "election session lost, rejoining");
                    self.become_follower();
                    self.latch = None;
                }
                Wake::Command(Ok(BalancerCommand::Shutdown)) | Wake::Command(Err(_)) => {
                    self.running = false;
                }
                Wake::Timeout => self.run_if_due(),
            }
        }

        self.become_follower();
        // Dropping the latch hands leadership to the next candidate.
        self.latch = None;
        debug!(candidate = %self.candidate, "balancer loop exited");
    }

    fn join_election(&mut self) {
        match self
            .job
            .store()
            .elect_leader(&self.leader_path, &self.candidate)
        {
            Ok(latch) => {
                debug!(candidate = %self.candidate, "joined leader election");
                self.latch = Some(latch);
            }
            Err(e) => {
                warn!(candidate = %self.candidate, error = %e, "failed to join leader election");
                match self.commands.recv_timeout(ELECTION_RETRY) {
                    Ok(BalancerCommand::Shutdown) | Err(RecvTimeoutError::Disconnected) => {
                        self.running = false;
                    }
                    Err(RecvTimeoutError::Timeout) => {}
                }
            }
        }
    }

    fn become_leader(&mut self) {
        if matches!(self.state, LeadershipState::Follower) {
            info!(candidate = %self.candidate, "elected balancer leader");
        }
        self.state = LeadershipState::Leader {
            next_run: Instant::now(),
        };
        self.leading.store(true, Ordering::Release);
    }

    fn become_follower(&mut self) {
        if matches!(self.state, LeadershipState::Leader { .. }) {
            info!(candidate = %self.candidate, "balancer leadership lost");
        }
        self.state = LeadershipState::Follower;
        self.leading.store(false, Ordering::Release);
    }

    fn run_if_due(&mut self) {
        let LeadershipState::Leader { next_run } = self.state else {
            return;
        };
        if Instant::now() < next_run {
            return;
        }
        let Some(latch) = &self.latch else {
            return;
        };
        // The revocation event may still be queued.
        if latch.is_leader() {
            self.job.run(&|| latch.is_leader());
        }
        self.state = LeadershipState::Leader {
            next_run: Instant::now() + self.interval,
        };
    }
}
