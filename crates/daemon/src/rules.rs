// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Rules-set freshness tracking.
//!
//! Parsing and executing rules happens inside the workers; the supervisor
//! only needs to know *that* a rule set is loaded and *when* it went stale,
//! so reload can tear workers down and let the next dispatch cycle pick up
//! the new files.

use std::path::PathBuf;
use std::time::SystemTime;
use tracing::{debug, info};

pub struct Rules {
    dirs: Vec<PathBuf>,
    newest: Option<SystemTime>,
    file_count: usize,
}

impl Rules {
    /// Take stock of the rules directories.
    pub fn load(dirs: &[PathBuf]) -> Self {
        let (newest, file_count) = scan(dirs);
        info!(files = file_count, "rules inventory loaded");
        Self { dirs: dirs.to_vec(), newest, file_count }
    }

    pub fn file_count(&self) -> usize {
        self.file_count
    }

    /// Re-scan the directories; true when any rules file appeared,
    /// disappeared or changed since the last scan.
    pub fn check_timestamp(&mut self) -> bool {
        let (newest, file_count) = scan(&self.dirs);
        let changed = newest != self.newest || file_count != self.file_count;
        if changed {
            debug!("rules directories changed, reload needed");
            self.newest = newest;
            self.file_count = file_count;
        }
        changed
    }
}

fn scan(dirs: &[PathBuf]) -> (Option<SystemTime>, usize) {
    let mut newest = None;
    let mut count = 0;
    for dir in dirs {
        let Ok(entries) = std::fs::read_dir(dir) else {
            continue;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().is_none_or(|ext| ext != "rules") {
                continue;
            }
            count += 1;
            if let Ok(mtime) = entry.metadata().and_then(|m| m.modified()) {
                newest = newest.max(Some(mtime));
            }
        }
    }
    (newest, count)
}

#[cfg(test)]
#[path = "rules_tests.rs"]
mod tests;
