use std::collections::BTreeMap;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use tracing::{debug, info};

use crate::error::{PaceError, Result};

const COMMAND_CHANNEL_CAPACITY: usize = 1024;

/// Work driven by a [`PeriodicSupervisor`] once per interval.
pub trait Tick: Send + Sync {
    fn tick(&self);
}

/// Proof of a successful registration. Only its holder can unregister the
/// task, so a rejected duplicate can never remove the live one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registration {
    key: String,
    id: u64,
}

impl Registration {
    pub fn key(&self) -> &str {
        &self.key
    }
}

enum SupervisorCommand {
    Register {
        key: String,
        task: Arc<dyn Tick>,
        reply: Sender<Result<Registration>>,
    },
    Unregister {
        registration: Registration,
        reply: Sender<bool>,
    },
    Shutdown,
}

/// Cloneable handle for registering tasks with a running supervisor.
#[derive(Clone)]
pub struct SupervisorHandle {
    commands: Sender<SupervisorCommand>,
}

impl SupervisorHandle {
    /// Start ticking `task` under `key`. Fails with `DuplicateRegistration`
    /// if the key is already taken.
    pub fn register(&self, key: impl Into<String>, task: Arc<dyn Tick>) -> Result<Registration> {
        let (reply, response) = crossbeam_channel::bounded(1);
        self.commands
            .send(SupervisorCommand::Register {
                key: key.into(),
                task,
                reply,
            })
            .map_err(|_| PaceError::SupervisorStopped)?;
        response.recv().map_err(|_| PaceError::SupervisorStopped)?
    }

    /// Stop ticking the registered task. Once this returns, the task will
    /// not be ticked again. Returns whether it was still registered.
    pub fn unregister(&self, registration: &Registration) -> bool {
        let (reply, response) = crossbeam_channel::bounded(1);
        let sent = self.commands.send(SupervisorCommand::Unregister {
            registration: registration.clone(),
            reply,
        });
        sent.is_ok() && response.recv().unwrap_or(false)
    }
}

/// Owns a named thread that ticks every registered task once per interval.
/// Registration and unregistration are processed on the same thread as the
/// ticks, so a task is never ticked after its unregistration returns.
pub struct PeriodicSupervisor {
    name: String,
    handle: SupervisorHandle,
    thread: Option<thread::JoinHandle<()>>,
}

impl PeriodicSupervisor {
    #[tracing::instrument(skip_all, fields(supervisor = %name))]
    pub fn spawn(name: &str, interval: Duration) -> Result<Self> {
        let (tx, rx) = crossbeam_channel::bounded(COMMAND_CHANNEL_CAPACITY);
        let thread_name = name.to_string();
        let thread = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                let mut supervisor = SupervisorLoop::new(thread_name, interval, rx);
                supervisor.run();
            })
            .map_err(|e| PaceError::SupervisorSpawn(e.to_string()))?;

        info!(interval_ms = interval.as_millis() as u64, "supervisor started");

        Ok(Self {
            name: name.to_string(),
            handle: SupervisorHandle { commands: tx },
            thread: Some(thread),
        })
    }

    pub fn handle(&self) -> SupervisorHandle {
        self.handle.clone()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Stop ticking and wait for the thread to exit.
    #[tracing::instrument(skip_all, fields(supervisor = %self.name))]
    pub fn shutdown(mut self) -> Result<()> {
        let _ = self.handle.commands.send(SupervisorCommand::Shutdown);
        if let Some(thread) = self.thread.take() {
            thread.join().map_err(|_| PaceError::SupervisorPanicked)?;
        }
        info!("supervisor stopped");
        Ok(())
    }
}

impl Drop for PeriodicSupervisor {
    fn drop(&mut self) {
        if let Some(thread) = self.thread.take() {
            let _ = self.handle.commands.send(SupervisorCommand::Shutdown);
            let _ = thread.join();
        }
    }
}

struct SupervisorLoop {
    name: String,
    interval: Duration,
    inbound: Receiver<SupervisorCommand>,
    tasks: BTreeMap<String, (u64, Arc<dyn Tick>)>,
    next_id: u64,
    running: bool,
}

impl SupervisorLoop {
    fn new(name: String, interval: Duration, inbound: Receiver<SupervisorCommand>) -> Self {
        Self {
            name,
            interval,
            inbound,
            tasks: BTreeMap::new(),
            next_id: 0,
            running: true,
        }
    }

    fn run(&mut self) {
        let mut next_tick = Instant::now() + self.interval;
        while self.running {
            let timeout = next_tick.saturating_duration_since(Instant::now());
            match self.inbound.recv_timeout(timeout) {
                Ok(cmd) => self.handle_command(cmd),
                Err(RecvTimeoutError::Timeout) => {
                    self.tick_all();
                    next_tick += self.interval;
                    let now = Instant::now();
                    if next_tick < now {
                        // Ticks overran the interval; don't try to catch up.
                        next_tick = now + self.interval;
                    }
                }
                Err(RecvTimeoutError::Disconnected) => self.running = false,
            }
        }
        debug!(supervisor = %self.name, tasks = self.tasks.len(), "supervisor loop exited");
    }

    fn handle_command(&mut self, cmd: SupervisorCommand) {
        match cmd {
            SupervisorCommand::Register { key, task, reply } => {
                let result = if self.tasks.contains_key(&key) {
                    Err(PaceError::DuplicateRegistration(key))
                } else {
                    debug!(supervisor = %self.name, %key, "task registered");
                    let id = self.next_id;
                    self.next_id += 1;
                    self.tasks.insert(key.clone(), (id, task));
                    Ok(Registration { key, id })
                };
                let _ = reply.send(result);
            }
            SupervisorCommand::Unregister { registration, reply } => {
                let owned = self
                    .tasks
                    .get(&registration.key)
                    .is_some_and(|(id, _)| *id == registration.id);
                if owned {
                    self.tasks.remove(&registration.key);
                    debug!(supervisor = %self.name, key = %registration.key, "task unregistered");
                }
                let _ = reply.send(owned);
            }
            SupervisorCommand::Shutdown => self.running = false,
        }
    }

    fn tick_all(&self) {
        for (_, task) in self.tasks.values() {
            task.tick();
        }
    }
}
