// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Ordered queue of pending device events and the busy predicate that
//! decides which of them may run in parallel.
//!
//! Events enter in kernel seqnum order and stay in the queue while RUNNING;
//! the busy predicate walks earlier entries (queued or running) to enforce
//! per-device-tree serialization while disjoint subtrees proceed freely.

use devd_core::{Device, Devnum, Seqnum};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Instant;
use tracing::{debug, warn};

/// Lifecycle of one queued event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventState {
    Queued,
    Running,
}

/// One pending device event. Immutable after insert apart from its
/// scheduling bookkeeping (`state`, `delaying_seqnum`, worker attachment).
#[derive(Debug)]
pub struct Event {
    pub seqnum: Seqnum,
    pub state: EventState,
    /// Earliest queued predecessor known to block this event; 0 when none
    /// has been found yet. Only ever moves forward.
    pub delaying_seqnum: Seqnum,
    pub devnum: Option<Devnum>,
    pub is_block: bool,
    pub ifindex: u32,
    /// Pid of the worker handling this event while RUNNING.
    pub worker: Option<i32>,
    pub started_at: Option<Instant>,
    pub warned: bool,
    /// Full device snapshot handed to the worker.
    pub dev: Device,
    /// Raw kernel form, forwarded unamended if the worker dies.
    pub dev_kernel: Device,
}

impl Event {
    fn from_device(dev: Device) -> Self {
        let dev_kernel = dev.kernel_clone();
        Self {
            seqnum: dev.seqnum,
            state: EventState::Queued,
            delaying_seqnum: 0,
            devnum: dev.devnum,
            is_block: dev.is_block(),
            ifindex: dev.ifindex,
            worker: None,
            started_at: None,
            warned: false,
            dev,
            dev_kernel,
        }
    }

    pub fn devpath(&self) -> &str {
        &self.dev.devpath
    }

    pub fn devpath_old(&self) -> Option<&str> {
        self.dev.devpath_old.as_deref()
    }
}

/// Externally visible marker telling `settle` clients whether work is
/// pending: the file exists iff the queue is non-empty.
#[derive(Debug, Clone)]
pub struct QueueMarker {
    path: PathBuf,
}

impl QueueMarker {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn update(&self, non_empty: bool) {
        if non_empty {
            if let Err(e) = std::fs::OpenOptions::new().create(true).append(true).open(&self.path)
            {
                warn!(path = %self.path.display(), error = %e, "could not touch queue marker");
            }
        } else if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %self.path.display(), error = %e, "could not unlink queue marker");
            }
        }
    }
}

/// Which events `cleanup` removes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CleanupFilter {
    All,
    Queued,
}

/// Ordered event queue. Iteration order is insertion order, which is seqnum
/// order because the kernel assigns seqnums monotonically.
pub struct EventQueue {
    events: BTreeMap<Seqnum, Event>,
    marker: QueueMarker,
}

impl EventQueue {
    pub fn new(marker: QueueMarker) -> Self {
        Self { events: BTreeMap::new(), marker }
    }

    /// Append a new event built from the received device. The queue takes
    /// ownership of the snapshot and its kernel clone.
    pub fn insert(&mut self, dev: Device) -> Option<Seqnum> {
        let seqnum = dev.seqnum;
        if let Some(&last) = self.events.keys().next_back() {
            if seqnum <= last {
                warn!(seqnum, last, "out-of-order seqnum, dropping event");
                return None;
            }
        }
        debug!(seqnum, action = %dev.action, subsystem = dev.subsystem.as_deref(), "event queued");
        self.events.insert(seqnum, Event::from_device(dev));
        self.marker.update(true);
        Some(seqnum)
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn get(&self, seqnum: Seqnum) -> Option<&Event> {
        self.events.get(&seqnum)
    }

    pub fn get_mut(&mut self, seqnum: Seqnum) -> Option<&mut Event> {
        self.events.get_mut(&seqnum)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Event> {
        self.events.values()
    }

    /// Unlink one event, releasing its device snapshots. The caller is
    /// responsible for detaching any worker back-reference.
    pub fn remove(&mut self, seqnum: Seqnum) -> Option<Event> {
        let event = self.events.remove(&seqnum);
        if self.events.is_empty() {
            self.marker.update(false);
        }
        event
    }

    /// Remove all events matching the filter. Returns the removed events so
    /// the caller can detach workers.
    pub fn cleanup(&mut self, filter: CleanupFilter) -> Vec<Event> {
        let victims: Vec<Seqnum> = self
            .events
            .values()
            .filter(|e| filter == CleanupFilter::All || e.state == EventState::Queued)
            .map(|e| e.seqnum)
            .collect();
        let removed: Vec<Event> =
            victims.into_iter().filter_map(|s| self.events.remove(&s)).collect();
        if self.events.is_empty() {
            self.marker.update(false);
        }
        removed
    }

    /// Re-assert the marker so settle clients observe the current state.
    pub fn update_marker(&self) {
        self.marker.update(!self.events.is_empty());
    }

    /// Check whether an earlier queued or running event must finish before
    /// this one may be dispatched. Memoizes the blocking seqnum so repeated
    /// scheduling passes skip everything already proven harmless.
    pub fn is_devpath_busy(&mut self, seqnum: Seqnum) -> bool {
        let verdict = match self.events.get(&seqnum) {
            Some(target) => find_blocker(self.events.values(), target),
            None => return false,
        };
        match verdict {
            Verdict::NotBusy => false,
            Verdict::Busy { memo } => {
                if let (Some(memo), Some(target)) = (memo, self.events.get_mut(&seqnum)) {
                    target.delaying_seqnum = memo;
                }
                true
            }
        }
    }
}

enum Verdict {
    NotBusy,
    Busy { memo: Option<Seqnum> },
}

/// Walk the queue in order and decide whether `target` is blocked.
///
/// Blocking relations, checked per earlier event: shared significant devnum
/// with the same block/char class, shared non-zero ifindex, an event still
/// occupying `target`'s old name, and devpath overlap (identical path,
/// ancestor, or descendant). Identical paths are treated as unrelated when
/// devnum or ifindex prove the path was reused by a different device.
fn find_blocker<'a>(events: impl Iterator<Item = &'a Event>, target: &Event) -> Verdict {
    for earlier in events {
        // a previous pass already proved events below the memo cannot block
        if earlier.seqnum < target.delaying_seqnum {
            continue;
        }

        // the remembered blocker is still queued
        if earlier.seqnum == target.delaying_seqnum {
            return Verdict::Busy { memo: None };
        }

        // walked past ourselves; no later event can block
        if earlier.seqnum >= target.seqnum {
            break;
        }

        if let (Some(a), Some(b)) = (target.devnum, earlier.devnum) {
            if a.is_significant() && a == b && target.is_block == earlier.is_block {
                return Verdict::Busy { memo: None };
            }
        }

        if target.ifindex != 0 && target.ifindex == earlier.ifindex {
            return Verdict::Busy { memo: None };
        }

        if let Some(old) = target.devpath_old() {
            if earlier.devpath() == old {
                return Verdict::Busy { memo: Some(earlier.seqnum) };
            }
        }

        let a = target.devpath().as_bytes();
        let b = earlier.devpath().as_bytes();
        let common = a.len().min(b.len());

        // unrelated subtree
        if a[..common] != b[..common] {
            continue;
        }

        // identical device path
        if a.len() == b.len() {
            // names might have been reused by a different device in the
            // meantime; devnum/ifindex disagreement proves it
            if let Some(devnum) = target.devnum.filter(Devnum::is_significant) {
                if earlier.devnum != Some(devnum) || target.is_block != earlier.is_block {
                    continue;
                }
            }
            if target.ifindex != 0 && target.ifindex != earlier.ifindex {
                continue;
            }
            return Verdict::Busy { memo: Some(earlier.seqnum) };
        }

        // strict parent/child relationship requires a '/' at the split
        if a.len() > common && a[common] == b'/' {
            return Verdict::Busy { memo: Some(earlier.seqnum) };
        }
        if b.len() > common && b[common] == b'/' {
            return Verdict::Busy { memo: Some(earlier.seqnum) };
        }
    }

    Verdict::NotBusy
}

#[cfg(test)]
#[path = "queue_tests.rs"]
mod tests;
