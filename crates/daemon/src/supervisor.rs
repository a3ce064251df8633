// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Supervisor: the single-threaded multiplexer driving the whole daemon.
//!
//! One loop iteration waits on six sources (worker completions, kernel
//! uevents, signals, device-node watches, control requests, the sweep
//! timeout), then runs the handlers in a fixed order. Each fd-backed source
//! is drained until it would block, every iteration, so no source can
//! starve another. The order is deliberate: inotify-synthesized events are
//! pulled in and the queue marker refreshed *before* a control message is
//! answered, so a client that triggered a change sees it reflected.

use crate::channel::CompletionChannel;
use crate::db::DeviceDb;
use crate::logging::LogHandle;
use crate::monitor::Monitor;
use crate::pool::{self, WorkerPool, WorkerSpawner};
use crate::process;
use crate::protocol::{Request, Response};
use crate::queue::{CleanupFilter, Event, EventQueue, EventState, QueueMarker};
use crate::rules::Rules;
use crate::signals::{SignalEvent, Signals};
use crate::watch::{self, Sysfs, WatchHandler, WatchKind};
use devd_core::{Action, Clock, Device, Seqnum};
use std::collections::BTreeMap;
use std::io;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Sweep cadence while events or workers are outstanding.
const SWEEP_INTERVAL: Duration = Duration::from_secs(3);
/// Rules-change poll is throttled to this.
const CONFIG_POLL_INTERVAL: Duration = Duration::from_secs(3);
/// Budget for workers to finish after exit is requested.
const EXIT_DRAIN_BUDGET: Duration = Duration::from_secs(30);

/// One control request plus its reply slot. The reply for `Exit` is parked
/// until cleanup completes, which is what blocks the client until exit.
pub struct CtrlRequest {
    pub request: Request,
    pub reply: oneshot::Sender<Response>,
}

#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("timeout, giving up waiting for workers to finish")]
    DrainTimeout,

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Tunables resolved at startup.
#[derive(Debug, Clone)]
pub struct Settings {
    pub runtime_dir: PathBuf,
    pub rules_dirs: Vec<PathBuf>,
    pub children_max: u32,
    pub event_timeout: Duration,
    pub event_timeout_warn: Duration,
    /// Cgroup dir swept for stragglers while idle; None disables the sweep.
    pub cgroup: Option<PathBuf>,
}

/// Everything the supervisor multiplexes over, injected so tests can fake
/// the OS-facing pieces.
pub struct DaemonDeps<M, W, P, C> {
    pub monitor: M,
    pub completions: W,
    pub spawner: P,
    pub clock: C,
    pub signals: Option<Signals>,
    pub ctrl_rx: mpsc::Receiver<CtrlRequest>,
    pub cancel: CancellationToken,
    pub log_handle: LogHandle,
    pub sysfs: Sysfs,
    pub settings: Settings,
}

/// The daemon aggregate: queue, pool, flags and all six event sources.
pub struct Daemon<M, W, P, C>
where
    M: Monitor,
    W: CompletionChannel,
    P: WorkerSpawner,
    C: Clock,
{
    pub(crate) queue: EventQueue,
    pub(crate) pool: WorkerPool,
    pub(crate) monitor: Option<M>,
    pub(crate) completions: W,
    pub(crate) spawner: P,
    pub(crate) clock: C,
    pub(crate) watch: WatchHandler,
    pub(crate) sysfs: Sysfs,
    pub(crate) db: DeviceDb,
    signals: Option<Signals>,
    ctrl_rx: Option<mpsc::Receiver<CtrlRequest>>,
    cancel: CancellationToken,
    log_handle: LogHandle,

    pub(crate) children_max: u32,
    event_timeout: Duration,
    event_timeout_warn: Duration,
    rules_dirs: Vec<PathBuf>,
    cgroup: Option<PathBuf>,

    pub(crate) rules: Option<Rules>,
    pub(crate) properties: BTreeMap<String, Option<String>>,
    pub(crate) stop_exec_queue: bool,
    pub(crate) reload: bool,
    pub(crate) exit_requested: bool,
    exit_reply: Option<oneshot::Sender<Response>>,
    exit_deadline: Option<Instant>,
    last_config_check: Option<Instant>,
}

#[derive(Default)]
struct Wake {
    timed_out: bool,
    signal: Option<SignalEvent>,
    ctrl: Option<CtrlRequest>,
    ctrl_closed: bool,
    inotify: Option<notify::Event>,
}

impl<M, W, P, C> Daemon<M, W, P, C>
where
    M: Monitor,
    W: CompletionChannel,
    P: WorkerSpawner,
    C: Clock,
{
    pub fn new(deps: DaemonDeps<M, W, P, C>) -> Self {
        let DaemonDeps {
            monitor,
            completions,
            spawner,
            clock,
            signals,
            ctrl_rx,
            cancel,
            log_handle,
            sysfs,
            settings,
        } = deps;
        let marker = QueueMarker::new(settings.runtime_dir.join("queue"));
        let db = DeviceDb::new(&settings.runtime_dir);
        Self {
            queue: EventQueue::new(marker),
            pool: WorkerPool::new(),
            monitor: Some(monitor),
            completions,
            spawner,
            clock,
            watch: WatchHandler::new(),
            sysfs,
            db,
            signals,
            ctrl_rx: Some(ctrl_rx),
            cancel,
            log_handle,
            children_max: settings.children_max,
            event_timeout: settings.event_timeout,
            event_timeout_warn: settings.event_timeout_warn,
            rules_dirs: settings.rules_dirs,
            cgroup: settings.cgroup,
            rules: None,
            properties: BTreeMap::new(),
            stop_exec_queue: false,
            reload: false,
            exit_requested: false,
            exit_reply: None,
            exit_deadline: None,
            last_config_check: None,
        }
    }

    /// Run until clean shutdown or drain-timeout.
    pub async fn run(&mut self) -> Result<(), DaemonError> {
        let result = self.run_loop().await;
        self.shutdown_cleanup();
        result
    }

    async fn run_loop(&mut self) -> Result<(), DaemonError> {
        loop {
            let timeout = match self.prepare_phase() {
                Phase::Done => return Ok(()),
                Phase::Wait(timeout) => timeout,
            };

            self.queue.update_marker();

            let wake = self.wait(timeout).await;

            if wake.timed_out {
                self.on_timeout()?;
            }
            if wake.ctrl_closed {
                self.ctrl_rx = None;
            }

            self.check_config_stamp();
            if self.reload {
                self.do_reload();
            }

            self.drain_completions();
            self.drain_uevents();
            self.start_queued_events();

            if let Some(signal) = wake.signal {
                self.on_signal(signal);
            }

            // shutting down: sources below feed new work and are skipped
            if self.exit_requested {
                continue;
            }

            self.drain_inotify(wake.inotify);

            // marker must be current before a PING is answered
            self.queue.update_marker();

            if let Some(ctrl) = wake.ctrl {
                self.on_ctrl(ctrl);
            }
        }
    }

    /// Phase transition at the top of each iteration: pick the wait budget
    /// and, once exit is requested, stop taking new work and wind down.
    fn prepare_phase(&mut self) -> Phase {
        if self.exit_requested {
            self.close_event_sources();

            let cancelled = self.queue.cleanup(CleanupFilter::Queued);
            for event in &cancelled {
                pool::detach_worker(&mut self.pool, event);
            }
            self.pool.kill_all(&self.spawner);

            if self.queue.is_empty() && self.pool.is_empty() {
                return Phase::Done;
            }

            let now = self.clock.now();
            let deadline = *self.exit_deadline.get_or_insert(now + EXIT_DRAIN_BUDGET);
            let remaining = deadline
                .checked_duration_since(now)
                .unwrap_or(Duration::from_millis(1));
            Phase::Wait(Some(remaining))
        } else if self.queue.is_empty() && self.pool.is_empty() {
            if let Some(cgroup) = &self.cgroup {
                process::kill_cgroup_stragglers(cgroup);
            }
            Phase::Wait(None)
        } else {
            Phase::Wait(Some(SWEEP_INTERVAL))
        }
    }

    async fn wait(&mut self, timeout: Option<Duration>) -> Wake {
        let mut wake = Wake::default();
        let exiting = self.exit_requested;

        tokio::select! {
            result = self.completions.readable() => {
                if let Err(e) = result {
                    error!(error = %e, "completion channel wait failed");
                }
            }
            result = monitor_readable(&self.monitor) => {
                if let Err(e) = result {
                    error!(error = %e, "uevent source wait failed");
                }
            }
            signal = signal_recv(&mut self.signals) => {
                wake.signal = Some(signal);
            }
            event = self.watch.next(), if !exiting => {
                wake.inotify = event;
            }
            ctrl = ctrl_recv(&mut self.ctrl_rx), if !exiting => {
                match ctrl {
                    Some(msg) => wake.ctrl = Some(msg),
                    None => wake.ctrl_closed = true,
                }
            }
            _ = sleep_opt(timeout) => {
                wake.timed_out = true;
            }
        }

        wake
    }

    /// Wait budget expired: fatal during the exit drain, otherwise retire
    /// idle workers and escalate on hanging events.
    fn on_timeout(&mut self) -> Result<(), DaemonError> {
        if self.exit_requested {
            return Err(DaemonError::DrainTimeout);
        }

        if self.queue.is_empty() {
            debug!("cleanup idle workers");
            self.pool.kill_all(&self.spawner);
        }

        self.sweep_hanging_events();
        Ok(())
    }

    /// Warn once per event past the warn threshold; SIGKILL past the kill
    /// threshold. The killed worker is then handled like any crash via
    /// SIGCHLD.
    pub(crate) fn sweep_hanging_events(&mut self) {
        let now = self.clock.now();
        let running: Vec<(i32, Seqnum)> = self.pool.running().collect();
        for (pid, seqnum) in running {
            let Some((age, warned, devpath)) = self.queue.get(seqnum).and_then(|event| {
                let started = event.started_at?;
                Some((now.duration_since(started), event.warned, event.devpath().to_string()))
            }) else {
                continue;
            };

            if age <= self.event_timeout_warn {
                continue;
            }
            if age > self.event_timeout {
                error!(pid, devpath = %devpath, "event timeout, killing worker");
                self.pool.sigkill(&self.spawner, pid);
            } else if !warned {
                warn!(pid, devpath = %devpath, "worker is taking a long time");
                if let Some(event) = self.queue.get_mut(seqnum) {
                    event.warned = true;
                }
            }
        }
    }

    /// Throttled poll for changed rules files.
    fn check_config_stamp(&mut self) {
        let now = self.clock.now();
        let due = self
            .last_config_check
            .is_none_or(|last| now.duration_since(last) > CONFIG_POLL_INTERVAL);
        if !due {
            return;
        }
        self.last_config_check = Some(now);
        if let Some(rules) = self.rules.as_mut() {
            if rules.check_timestamp() {
                self.reload = true;
            }
        }
    }

    /// Reload: retire the current workers and drop the rule set so the next
    /// dispatch cycle re-reads everything.
    fn do_reload(&mut self) {
        info!("reloading rules, restarting workers");
        self.pool.kill_all(&self.spawner);
        self.rules = None;
        self.reload = false;
    }

    /// Drain worker completion messages.
    pub(crate) fn drain_completions(&mut self) {
        loop {
            match self.completions.try_receive() {
                Ok(Some(pid)) => self.on_worker_done(pid),
                Ok(None) => break,
                Err(e) => {
                    error!(error = %e, "failed to receive worker message");
                    break;
                }
            }
        }
    }

    pub(crate) fn on_worker_done(&mut self, pid: i32) {
        if self.pool.get(pid).is_none() {
            debug!(pid, "worker returned, but is no longer tracked");
            return;
        }
        if let Some(seqnum) = self.pool.finish(pid) {
            debug!(pid, seqnum, "event processed");
            if let Some(event) = self.queue.remove(seqnum) {
                self.maintain_watch(&event.dev);
            }
        }
    }

    /// Keep device-node watches in step with processed events: watch block
    /// devices that now exist, drop watches for removed ones.
    fn maintain_watch(&mut self, dev: &Device) {
        if dev.action == Action::Remove {
            if let Some(node) = dev.devnode().map(PathBuf::from) {
                self.watch.end(&node);
            }
        } else if dev.is_block() {
            self.watch.begin(dev);
        }
    }

    /// Drain the kernel uevent source into the queue.
    pub(crate) fn drain_uevents(&mut self) {
        loop {
            let received = match self.monitor.as_mut() {
                Some(monitor) => monitor.try_receive(),
                None => return,
            };
            match received {
                Ok(Some(mut dev)) => {
                    dev.properties
                        .entry("USEC_INITIALIZED".to_string())
                        .or_insert_with(|| self.clock.epoch_usec().to_string());
                    self.queue.insert(dev);
                }
                Ok(None) => break,
                Err(e) => {
                    error!(error = %e, "failed to receive uevent");
                    break;
                }
            }
        }
    }

    /// Scheduler: walk the queue in order and hand every unblocked QUEUED
    /// event to the pool.
    pub(crate) fn start_queued_events(&mut self) {
        if self.queue.is_empty() || self.exit_requested || self.stop_exec_queue {
            return;
        }

        if self.rules.is_none() {
            self.rules = Some(Rules::load(&self.rules_dirs));
        }

        let now = self.clock.now();
        let pending: Vec<Seqnum> = self
            .queue
            .iter()
            .filter(|e| e.state == EventState::Queued)
            .map(|e| e.seqnum)
            .collect();
        for seqnum in pending {
            if self.queue.get(seqnum).map(|e| e.state) != Some(EventState::Queued) {
                continue;
            }
            if self.queue.is_devpath_busy(seqnum) {
                continue;
            }
            self.pool.dispatch(&mut self.spawner, &mut self.queue, seqnum, self.children_max, now);
        }
    }

    pub(crate) fn on_signal(&mut self, signal: SignalEvent) {
        match signal {
            SignalEvent::Exit => self.on_request_exit(),
            SignalEvent::Reload => self.on_request_reload(),
            SignalEvent::Child => self.on_sigchld(),
        }
    }

    pub(crate) fn on_request_exit(&mut self) {
        self.exit_requested = true;
    }

    pub(crate) fn on_request_reload(&mut self) {
        self.reload = true;
    }

    /// Reap exited workers. An abnormal exit with an event attached scrubs
    /// the device's persisted state and re-publishes the raw kernel event so
    /// listeners still see it.
    pub(crate) fn on_sigchld(&mut self) {
        for (pid, outcome) in self.spawner.reap() {
            match outcome {
                crate::pool::ExitOutcome::Clean => debug!(pid, "worker exited"),
                crate::pool::ExitOutcome::Exited(code) => {
                    warn!(pid, code, "worker exited with return code")
                }
                crate::pool::ExitOutcome::Signaled(signal) => {
                    warn!(pid, signal, "worker terminated by signal")
                }
            }

            let Some(worker) = self.pool.remove(pid) else {
                warn!(pid, "worker is unknown, ignoring");
                continue;
            };

            let Some(seqnum) = worker.event else {
                continue;
            };
            let Some(event) = self.queue.remove(seqnum) else {
                continue;
            };
            if outcome.is_failure() {
                error!(pid, devpath = event.devpath(), "worker failed while handling event");
                self.db.delete(&event.dev);
                self.db.untag(&event.dev);
                self.forward_kernel_event(&event);
            }
        }
    }

    fn forward_kernel_event(&self, event: &Event) {
        let Some(monitor) = &self.monitor else {
            return;
        };
        if let Err(e) = monitor.broadcast(&event.dev_kernel) {
            warn!(error = %e, "could not forward raw kernel event");
        }
    }

    /// Handle a batch of device-node notifications, then immediately pull
    /// the uevents any synthesized `change` produced so queue state is
    /// coherent for settle and control clients.
    pub(crate) fn drain_inotify(&mut self, first: Option<notify::Event>) {
        let mut next = first.or_else(|| self.watch.try_next());
        while let Some(event) = next {
            self.handle_inotify(event);
            next = self.watch.try_next();
        }
    }

    pub(crate) fn handle_inotify(&mut self, event: notify::Event) {
        let Some(kind) = watch::classify(&event.kind) else {
            return;
        };
        for path in &event.paths {
            let Some(dev) = self.watch.lookup(path).cloned() else {
                continue;
            };
            debug!(node = %path.display(), ?kind, "device node notification");
            match kind {
                WatchKind::CloseWrite => {
                    if let Err(e) = watch::synthesize_change(&dev, &self.sysfs) {
                        debug!(error = %e, "could not synthesize change event");
                    }
                    self.drain_uevents();
                }
                WatchKind::Gone => self.watch.end(path),
            }
        }
    }

    /// Apply one control message and reply. The `Exit` reply is parked.
    pub(crate) fn on_ctrl(&mut self, msg: CtrlRequest) {
        let CtrlRequest { request, reply } = msg;
        let response = match request {
            Request::Ping => {
                debug!("control message (PING)");
                Response::Ok
            }
            Request::SetLogLevel { level } => {
                debug!(level, "control message (SET_LOG_LEVEL)");
                self.log_handle.set_level(&level);
                self.spawner.set_log_level(&level);
                self.pool.kill_all(&self.spawner);
                Response::Ok
            }
            Request::StopExecQueue => {
                debug!("control message (STOP_EXEC_QUEUE)");
                self.stop_exec_queue = true;
                Response::Ok
            }
            Request::StartExecQueue => {
                debug!("control message (START_EXEC_QUEUE)");
                self.stop_exec_queue = false;
                Response::Ok
            }
            Request::Reload => {
                debug!("control message (RELOAD)");
                self.reload = true;
                Response::Ok
            }
            Request::SetEnv { assignment } => self.on_set_env(&assignment),
            Request::SetChildrenMax { max } => {
                debug!(max, "control message (SET_MAX_CHILDREN)");
                self.children_max = max;
                Response::Ok
            }
            Request::Exit => {
                debug!("control message (EXIT)");
                self.exit_requested = true;
                // park the reply to block the client until we exit
                self.exit_reply = Some(reply);
                return;
            }
        };
        let _ = reply.send(response);
    }

    fn on_set_env(&mut self, assignment: &str) -> Response {
        let Some((key, value)) = assignment.split_once('=') else {
            error!(assignment, "wrong key format");
            return Response::Error { message: format!("wrong key format '{}'", assignment) };
        };
        if key.is_empty() {
            error!(assignment, "wrong key format");
            return Response::Error { message: format!("wrong key format '{}'", assignment) };
        }
        if value.is_empty() {
            debug!(key, "control message (SET_ENV), unset");
            self.properties.insert(key.to_string(), None);
        } else {
            debug!(key, value, "control message (SET_ENV), set");
            self.properties.insert(key.to_string(), Some(value.to_string()));
        }
        self.spawner.set_properties(&self.properties);
        self.pool.kill_all(&self.spawner);
        Response::Ok
    }

    /// Unregister the sources that feed new work; buffered input is dropped.
    fn close_event_sources(&mut self) {
        if self.monitor.take().is_some() {
            debug!("closed uevent source");
        }
        self.watch.close();
        self.ctrl_rx = None;
        self.cancel.cancel();
    }

    /// Final cleanup, run on both the clean and the drain-timeout path. The
    /// parked EXIT reply is answered only here, after queue and pool state
    /// is gone and right before the process exits.
    fn shutdown_cleanup(&mut self) {
        let leftover = self.queue.cleanup(CleanupFilter::All);
        for event in &leftover {
            pool::detach_worker(&mut self.pool, event);
        }
        self.queue.update_marker();
        self.cancel.cancel();
        if let Some(reply) = self.exit_reply.take() {
            let _ = reply.send(Response::Ok);
        }
        info!("daemon stopped");
    }
}

enum Phase {
    Done,
    Wait(Option<Duration>),
}

async fn monitor_readable<M: Monitor>(monitor: &Option<M>) -> io::Result<()> {
    match monitor {
        Some(monitor) => monitor.readable().await,
        None => std::future::pending().await,
    }
}

async fn signal_recv(signals: &mut Option<Signals>) -> SignalEvent {
    match signals {
        Some(signals) => signals.recv().await,
        None => std::future::pending().await,
    }
}

async fn ctrl_recv(rx: &mut Option<mpsc::Receiver<CtrlRequest>>) -> Option<CtrlRequest> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn sleep_opt(timeout: Option<Duration>) {
    match timeout {
        Some(timeout) => tokio::time::sleep(timeout).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
#[path = "supervisor_tests/mod.rs"]
mod tests;
