// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Fakes for the supervisor's OS-facing seams.

use crate::channel::CompletionChannel;
use crate::monitor::Monitor;
use crate::pool::{
    DeviceLink, ExitOutcome, KillSignal, SpawnError, SpawnedWorker, WorkerSpawner,
};
use async_trait::async_trait;
use devd_core::{Action, Device, Devnum, Seqnum};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::io;
use std::sync::Arc;

pub fn device(seqnum: Seqnum, devpath: &str) -> Device {
    Device::new(seqnum, Action::Add, devpath)
}

pub fn block_device(seqnum: Seqnum, devpath: &str, devnum: Devnum) -> Device {
    let mut dev = device(seqnum, devpath);
    dev.subsystem = Some("block".into());
    dev.devtype = Some("disk".into());
    dev.devnum = Some(devnum);
    dev
}

#[derive(Default)]
pub struct FakeLinkState {
    pub sent: Vec<Seqnum>,
    pub fail: bool,
}

pub struct FakeLink(pub Arc<Mutex<FakeLinkState>>);

impl DeviceLink for FakeLink {
    fn send(&self, dev: &Device) -> io::Result<()> {
        let mut state = self.0.lock();
        if state.fail {
            return Err(io::ErrorKind::BrokenPipe.into());
        }
        state.sent.push(dev.seqnum);
        Ok(())
    }
}

pub struct SpawnerState {
    next_pid: i32,
    pub spawned: Vec<i32>,
    pub kills: Vec<(i32, KillSignal)>,
    pub links: HashMap<i32, Arc<Mutex<FakeLinkState>>>,
    pub pending_reaps: VecDeque<(i32, ExitOutcome)>,
    pub fail_next_spawn: bool,
    pub properties: BTreeMap<String, Option<String>>,
    pub log_level: Option<String>,
}

impl Default for SpawnerState {
    fn default() -> Self {
        Self {
            next_pid: 100,
            spawned: Vec::new(),
            kills: Vec::new(),
            links: HashMap::new(),
            pending_reaps: VecDeque::new(),
            fail_next_spawn: false,
            properties: BTreeMap::new(),
            log_level: None,
        }
    }
}

impl SpawnerState {
    /// Pids a given signal was sent to.
    pub fn killed_with(&self, signal: KillSignal) -> Vec<i32> {
        self.kills.iter().filter(|(_, s)| *s == signal).map(|(pid, _)| *pid).collect()
    }
}

/// Spawner whose workers are bookkeeping entries, not processes.
pub struct FakeSpawner(pub Arc<Mutex<SpawnerState>>);

impl FakeSpawner {
    pub fn new() -> (Self, Arc<Mutex<SpawnerState>>) {
        let state = Arc::new(Mutex::new(SpawnerState::default()));
        (Self(Arc::clone(&state)), state)
    }
}

impl WorkerSpawner for FakeSpawner {
    fn spawn(&mut self, initial: &Device) -> Result<SpawnedWorker, SpawnError> {
        let mut state = self.0.lock();
        if state.fail_next_spawn {
            state.fail_next_spawn = false;
            return Err(SpawnError::Io(io::ErrorKind::WouldBlock.into()));
        }
        let pid = state.next_pid;
        state.next_pid += 1;
        let link = Arc::new(Mutex::new(FakeLinkState {
            sent: vec![initial.seqnum],
            fail: false,
        }));
        state.spawned.push(pid);
        state.links.insert(pid, Arc::clone(&link));
        Ok(SpawnedWorker { pid, link: Box::new(FakeLink(link)) })
    }

    fn reap(&mut self) -> Vec<(i32, ExitOutcome)> {
        self.0.lock().pending_reaps.drain(..).collect()
    }

    fn kill(&self, pid: i32, signal: KillSignal) {
        self.0.lock().kills.push((pid, signal));
    }

    fn set_properties(&mut self, properties: &BTreeMap<String, Option<String>>) {
        self.0.lock().properties = properties.clone();
    }

    fn set_log_level(&mut self, level: &str) {
        self.0.lock().log_level = Some(level.to_string());
    }
}

#[derive(Default)]
pub struct MonitorState {
    pub incoming: VecDeque<Device>,
    pub broadcasts: Vec<Device>,
}

/// Monitor fed by hand instead of by the kernel.
pub struct FakeMonitor(pub Arc<Mutex<MonitorState>>);

impl FakeMonitor {
    pub fn new() -> (Self, Arc<Mutex<MonitorState>>) {
        let state = Arc::new(Mutex::new(MonitorState::default()));
        (Self(Arc::clone(&state)), state)
    }
}

#[async_trait]
impl Monitor for FakeMonitor {
    async fn readable(&self) -> io::Result<()> {
        if self.0.lock().incoming.is_empty() {
            std::future::pending::<io::Result<()>>().await
        } else {
            Ok(())
        }
    }

    fn try_receive(&mut self) -> io::Result<Option<Device>> {
        Ok(self.0.lock().incoming.pop_front())
    }

    fn broadcast(&self, dev: &Device) -> io::Result<()> {
        self.0.lock().broadcasts.push(dev.clone());
        Ok(())
    }
}

/// Completion channel fed by hand.
pub struct FakeCompletions(pub Arc<Mutex<VecDeque<i32>>>);

impl FakeCompletions {
    pub fn new() -> (Self, Arc<Mutex<VecDeque<i32>>>) {
        let state = Arc::new(Mutex::new(VecDeque::new()));
        (Self(Arc::clone(&state)), state)
    }
}

#[async_trait]
impl CompletionChannel for FakeCompletions {
    async fn readable(&self) -> io::Result<()> {
        if self.0.lock().is_empty() {
            std::future::pending::<io::Result<()>>().await
        } else {
            Ok(())
        }
    }

    fn try_receive(&mut self) -> io::Result<Option<i32>> {
        Ok(self.0.lock().pop_front())
    }
}
