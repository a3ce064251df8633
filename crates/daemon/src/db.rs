// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Persisted per-device state under `<runtime_dir>/data/` plus the tag
//! index under `<runtime_dir>/tags/`.
//!
//! Workers write a record after processing a device; the supervisor scrubs
//! it when a worker dies mid-event so listeners never see half-applied
//! state alongside the re-forwarded raw event.

use devd_core::Device;
use std::io;
use std::path::{Path, PathBuf};
use tracing::debug;

pub struct DeviceDb {
    data_dir: PathBuf,
    tags_dir: PathBuf,
}

impl DeviceDb {
    pub fn new(runtime_dir: &Path) -> Self {
        Self { data_dir: runtime_dir.join("data"), tags_dir: runtime_dir.join("tags") }
    }

    fn record_path(&self, dev: &Device) -> PathBuf {
        self.data_dir.join(dev.device_id())
    }

    /// Persist the device's property set, one `KEY=VALUE` per line.
    pub fn write(&self, dev: &Device) -> io::Result<()> {
        std::fs::create_dir_all(&self.data_dir)?;
        let mut record = String::new();
        for (key, value) in &dev.properties {
            record.push_str(key);
            record.push('=');
            record.push_str(value);
            record.push('\n');
        }
        std::fs::write(self.record_path(dev), record)
    }

    /// Drop the persisted record. Missing records are fine.
    pub fn delete(&self, dev: &Device) {
        let path = self.record_path(dev);
        match std::fs::remove_file(&path) {
            Ok(()) => debug!(path = %path.display(), "deleted device db entry"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => debug!(path = %path.display(), error = %e, "could not delete db entry"),
        }
    }

    /// Remove the device from every tag directory it was indexed under.
    /// Tags live in the `TAGS` property as a `:`-separated list.
    pub fn untag(&self, dev: &Device) {
        let Some(tags) = dev.property("TAGS") else {
            return;
        };
        let id = dev.device_id();
        for tag in tags.split(':').filter(|t| !t.is_empty()) {
            let _ = std::fs::remove_file(self.tags_dir.join(tag).join(&id));
        }
    }

    /// Index the device under its tags; used by workers after processing.
    pub fn tag(&self, dev: &Device) -> io::Result<()> {
        let Some(tags) = dev.property("TAGS") else {
            return Ok(());
        };
        let id = dev.device_id();
        for tag in tags.split(':').filter(|t| !t.is_empty()) {
            let dir = self.tags_dir.join(tag);
            std::fs::create_dir_all(&dir)?;
            std::fs::write(dir.join(&id), b"")?;
        }
        Ok(())
    }
}

#[cfg(test)]
#[path = "db_tests.rs"]
mod tests;
