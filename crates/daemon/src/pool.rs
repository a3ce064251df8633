// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Pool of live worker processes.
//!
//! Workers are spawned for a first event, kept around IDLE for reuse, bulk
//! SIGTERMed on reload/shutdown and SIGKILLed when they hang. A reaped pid is
//! purged from the pool before any new worker may reuse it.

use crate::queue::{Event, EventQueue, EventState};
use devd_core::{Device, Seqnum};
use std::collections::BTreeMap;
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, error};

/// Supervisor-held send side of one worker's device channel. The receiving
/// side lives in the child process; a failed send means the worker is gone.
pub trait DeviceLink: Send {
    fn send(&self, dev: &Device) -> std::io::Result<()>;
}

/// Signal used against a worker process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KillSignal {
    Term,
    Kill,
}

/// How a reaped worker exited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitOutcome {
    Clean,
    Exited(i32),
    Signaled(i32),
}

impl ExitOutcome {
    pub fn is_failure(&self) -> bool {
        !matches!(self, ExitOutcome::Clean)
    }
}

#[derive(Debug, Error)]
pub enum SpawnError {
    #[error("failed to spawn worker: {0}")]
    Io(#[from] std::io::Error),
}

/// A freshly spawned worker process: its pid and the supervisor's send side
/// of the device channel.
pub struct SpawnedWorker {
    pub pid: i32,
    pub link: Box<dyn DeviceLink>,
}

/// Creates, signals and reaps worker processes. Production forks/execs the
/// daemon binary in worker mode; tests substitute a fake.
pub trait WorkerSpawner: Send {
    fn spawn(&mut self, initial: &Device) -> Result<SpawnedWorker, SpawnError>;

    /// Non-blocking wait for exited children; drained on SIGCHLD.
    fn reap(&mut self) -> Vec<(i32, ExitOutcome)>;

    fn kill(&self, pid: i32, signal: KillSignal);

    /// Property overrides inherited by workers spawned from here on.
    fn set_properties(&mut self, _properties: &BTreeMap<String, Option<String>>) {}

    /// Log level inherited by workers spawned from here on.
    fn set_log_level(&mut self, _level: &str) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Running,
    Idle,
    Killed,
}

/// Descriptor of one live child process.
pub struct Worker {
    pub pid: i32,
    pub state: WorkerState,
    /// Seqnum of the attached event; non-None exactly while RUNNING.
    pub event: Option<Seqnum>,
    link: Box<dyn DeviceLink>,
}

/// Mapping pid → worker.
#[derive(Default)]
pub struct WorkerPool {
    workers: BTreeMap<i32, Worker>,
}

impl WorkerPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    pub fn get(&self, pid: i32) -> Option<&Worker> {
        self.workers.get(&pid)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Worker> {
        self.workers.values()
    }

    pub fn pids(&self) -> Vec<i32> {
        self.workers.keys().copied().collect()
    }

    /// Start `seqnum` on an existing idle worker or a fresh one.
    ///
    /// Idle workers are tried in pool order; one that refuses the send is
    /// dead and gets SIGKILLed on the spot. When no idle worker accepts and
    /// the pool is below `children_max`, a new worker is spawned with the
    /// event as its initial device. Otherwise the event stays QUEUED.
    ///
    /// Returns true when the event ended up attached to a worker.
    pub fn dispatch(
        &mut self,
        spawner: &mut dyn WorkerSpawner,
        queue: &mut EventQueue,
        seqnum: Seqnum,
        children_max: u32,
        now: Instant,
    ) -> bool {
        let idle: Vec<i32> = self
            .workers
            .values()
            .filter(|w| w.state == WorkerState::Idle)
            .map(|w| w.pid)
            .collect();

        for pid in idle {
            let Some(worker) = self.workers.get_mut(&pid) else {
                continue;
            };
            let Some(event) = queue.get(seqnum) else {
                return false;
            };
            match worker.link.send(&event.dev) {
                Ok(()) => {
                    attach(worker, queue, seqnum, now);
                    return true;
                }
                Err(e) => {
                    error!(pid, error = %e, "worker did not accept message, kill it");
                    spawner.kill(pid, KillSignal::Kill);
                    worker.state = WorkerState::Killed;
                }
            }
        }

        if self.workers.len() >= children_max as usize {
            if children_max > 1 {
                debug!(children_max, "maximum number of children reached");
            }
            return false;
        }

        let Some(event) = queue.get(seqnum) else {
            return false;
        };
        match spawner.spawn(&event.dev) {
            Ok(spawned) => {
                debug!(seqnum, pid = spawned.pid, "forked new worker");
                let pid = spawned.pid;
                let worker = Worker {
                    pid,
                    state: WorkerState::Running,
                    event: None,
                    link: spawned.link,
                };
                self.workers.insert(pid, worker);
                if let Some(worker) = self.workers.get_mut(&pid) {
                    attach(worker, queue, seqnum, now);
                }
                true
            }
            Err(e) => {
                // the event stays QUEUED and is retried next scheduling pass
                error!(seqnum, error = %e, "spawn of worker failed");
                false
            }
        }
    }

    /// SIGTERM every worker not already killed.
    pub fn kill_all(&mut self, spawner: &dyn WorkerSpawner) {
        for worker in self.workers.values_mut() {
            if worker.state == WorkerState::Killed {
                continue;
            }
            worker.state = WorkerState::Killed;
            spawner.kill(worker.pid, KillSignal::Term);
        }
    }

    /// SIGKILL one hanging worker.
    pub fn sigkill(&mut self, spawner: &dyn WorkerSpawner, pid: i32) {
        if let Some(worker) = self.workers.get_mut(&pid) {
            worker.state = WorkerState::Killed;
            spawner.kill(pid, KillSignal::Kill);
        }
    }

    /// A worker posted its completion message: back to IDLE (unless it was
    /// already killed) and detach its event. Returns the finished seqnum so
    /// the caller can drop the event from the queue.
    pub fn finish(&mut self, pid: i32) -> Option<Seqnum> {
        let worker = self.workers.get_mut(&pid)?;
        if worker.state != WorkerState::Killed {
            worker.state = WorkerState::Idle;
        }
        worker.event.take()
    }

    /// Remove a reaped worker from the pool entirely. Returns the worker so
    /// the caller can recover its attached event.
    pub fn remove(&mut self, pid: i32) -> Option<Worker> {
        self.workers.remove(&pid)
    }

    /// Pids of RUNNING workers whose event started before the given
    /// deadline check, paired with their event seqnum.
    pub fn running(&self) -> impl Iterator<Item = (i32, Seqnum)> + '_ {
        self.workers
            .values()
            .filter(|w| w.state == WorkerState::Running)
            .filter_map(|w| w.event.map(|seq| (w.pid, seq)))
    }
}

/// Attach an event to a worker. Legal only while both sides are free.
fn attach(worker: &mut Worker, queue: &mut EventQueue, seqnum: Seqnum, now: Instant) {
    debug_assert!(worker.event.is_none());
    let Some(event) = queue.get_mut(seqnum) else {
        return;
    };
    debug_assert!(event.worker.is_none());
    worker.state = WorkerState::Running;
    worker.event = Some(seqnum);
    event.state = EventState::Running;
    event.worker = Some(worker.pid);
    event.started_at = Some(now);
    event.warned = false;
}

/// Detach an event from its worker when the event is freed first (queue
/// cleanup of a RUNNING event at shutdown).
pub fn detach_worker(pool: &mut WorkerPool, event: &Event) {
    if let Some(pid) = event.worker {
        if let Some(worker) = pool.workers.get_mut(&pid) {
            if worker.event == Some(event.seqnum) {
                worker.event = None;
            }
        }
    }
}

#[cfg(test)]
#[path = "pool_tests.rs"]
mod tests;
