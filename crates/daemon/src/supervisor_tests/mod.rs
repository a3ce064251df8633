// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Supervisor scenario tests: handlers driven directly against fakes.

mod control;
mod failures;
mod inotify;
mod scheduling;
mod shutdown;

use super::*;
use crate::pool::{ExitOutcome, KillSignal, WorkerState};
use crate::test_support::{
    block_device, device, FakeCompletions, FakeMonitor, FakeSpawner, MonitorState, SpawnerState,
};
use devd_core::FakeClock;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use tempfile::TempDir;
use tokio::sync::oneshot;

pub(super) struct TestDaemon {
    pub daemon: Daemon<FakeMonitor, FakeCompletions, FakeSpawner, FakeClock>,
    pub monitor: Arc<Mutex<MonitorState>>,
    pub completions: Arc<Mutex<VecDeque<i32>>>,
    pub spawner: Arc<Mutex<SpawnerState>>,
    pub clock: FakeClock,
    pub runtime: TempDir,
    pub sysfs_dir: TempDir,
}

pub(super) fn test_daemon() -> TestDaemon {
    test_daemon_with(8)
}

pub(super) fn test_daemon_with(children_max: u32) -> TestDaemon {
    let runtime = TempDir::new().unwrap();
    let sysfs_dir = TempDir::new().unwrap();
    let (monitor, monitor_state) = FakeMonitor::new();
    let (completions, completions_state) = FakeCompletions::new();
    let (spawner, spawner_state) = FakeSpawner::new();
    let clock = FakeClock::new();
    let (_ctrl_tx, ctrl_rx) = mpsc::channel(16);

    let settings = Settings {
        runtime_dir: runtime.path().to_path_buf(),
        rules_dirs: vec![runtime.path().join("rules.d")],
        children_max,
        event_timeout: Duration::from_secs(180),
        event_timeout_warn: Duration::from_secs(60),
        cgroup: None,
    };

    let daemon = Daemon::new(DaemonDeps {
        monitor,
        completions,
        spawner,
        clock: clock.clone(),
        signals: None,
        ctrl_rx,
        cancel: CancellationToken::new(),
        log_handle: LogHandle::disabled(),
        sysfs: Sysfs::new(sysfs_dir.path()),
        settings,
    });

    TestDaemon {
        daemon,
        monitor: monitor_state,
        completions: completions_state,
        spawner: spawner_state,
        clock,
        runtime,
        sysfs_dir,
    }
}

impl TestDaemon {
    pub fn push_uevent(&self, dev: Device) {
        self.monitor.lock().incoming.push_back(dev);
    }

    /// One receive-and-dispatch pass, like a supervisor iteration with only
    /// netlink readiness.
    pub fn receive_and_schedule(&mut self) {
        self.daemon.drain_uevents();
        self.daemon.start_queued_events();
        self.assert_invariants();
    }

    /// A worker posts its completion message.
    pub fn complete(&mut self, pid: i32) {
        self.completions.lock().push_back(pid);
        self.daemon.drain_completions();
        self.assert_invariants();
    }

    /// Reap a worker with the given outcome.
    pub fn reap(&mut self, pid: i32, outcome: ExitOutcome) {
        self.spawner.lock().pending_reaps.push_back((pid, outcome));
        self.daemon.on_sigchld();
        self.assert_invariants();
    }

    /// Deliver one control request; the reply receiver is returned so the
    /// test can observe when (and whether) it was answered.
    pub fn ctrl(&mut self, request: Request) -> oneshot::Receiver<Response> {
        let (reply, rx) = oneshot::channel();
        self.daemon.on_ctrl(CtrlRequest { request, reply });
        rx
    }

    pub fn spawned_pids(&self) -> Vec<i32> {
        self.spawner.lock().spawned.clone()
    }

    pub fn marker_exists(&self) -> bool {
        self.runtime.path().join("queue").exists()
    }

    /// The structural invariants that must hold between loop iterations.
    pub fn assert_invariants(&self) {
        let daemon = &self.daemon;

        // worker/event attachment is symmetric
        for worker in daemon.pool.iter() {
            if worker.state == WorkerState::Running {
                let seqnum = worker.event.unwrap_or_else(|| {
                    panic!("running worker {} has no event", worker.pid)
                });
                let event = daemon.queue.get(seqnum).unwrap_or_else(|| {
                    panic!("worker {} attached to missing event {}", worker.pid, seqnum)
                });
                assert_eq!(event.state, EventState::Running);
                assert_eq!(event.worker, Some(worker.pid));
            }
        }

        // a RUNNING event always has its worker in the pool
        let mut previous_seqnum = 0;
        for event in daemon.queue.iter() {
            assert!(event.seqnum > previous_seqnum, "queue must stay seqnum-ordered");
            previous_seqnum = event.seqnum;
            if event.state == EventState::Running {
                let pid = event.worker.unwrap_or_else(|| {
                    panic!("running event {} has no worker", event.seqnum)
                });
                let worker = daemon
                    .pool
                    .get(pid)
                    .unwrap_or_else(|| panic!("event {} worker {} not pooled", event.seqnum, pid));
                assert_eq!(worker.event, Some(event.seqnum));
            }
        }

        // pool never exceeds the cap
        assert!(daemon.pool.len() <= daemon.children_max as usize);

        // no two overlapping devpaths running at once
        let running: Vec<&str> = daemon
            .queue
            .iter()
            .filter(|e| e.state == EventState::Running)
            .map(|e| e.devpath())
            .collect();
        for (i, a) in running.iter().enumerate() {
            for b in running.iter().skip(i + 1) {
                let related = a == b
                    || a.strip_prefix(*b).is_some_and(|rest| rest.starts_with('/'))
                    || b.strip_prefix(*a).is_some_and(|rest| rest.starts_with('/'));
                assert!(!related, "overlapping devpaths running: {} and {}", a, b);
            }
        }
    }
}
