// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Logging setup with a runtime-reloadable filter, so the control plane can
//! retighten the log level without a restart.

use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::reload;
use tracing_subscriber::{fmt, prelude::*, Registry};

/// Handle onto the active filter. The disabled variant is for tests and
/// worker children, which inherit their level through the environment.
pub struct LogHandle(Option<reload::Handle<EnvFilter, Registry>>);

impl LogHandle {
    pub fn disabled() -> Self {
        Self(None)
    }

    /// Swap the active filter, e.g. on a SET_LOG_LEVEL control message.
    pub fn set_level(&self, level: &str) {
        let Some(handle) = &self.0 else {
            return;
        };
        match EnvFilter::try_new(level) {
            Ok(filter) => {
                if handle.reload(filter).is_err() {
                    tracing::warn!(level, "could not reload log filter");
                }
            }
            Err(e) => tracing::warn!(level, error = %e, "invalid log level ignored"),
        }
    }
}

/// Install the global subscriber. `DEVD_LOG` overrides the default level;
/// `DEVD_LOG_FILE` redirects output from stderr to a file (non-blocking,
/// guard must stay alive).
pub fn init(default_level: &str) -> (LogHandle, Option<tracing_appender::non_blocking::WorkerGuard>) {
    let filter = EnvFilter::try_from_env("DEVD_LOG")
        .unwrap_or_else(|_| EnvFilter::new(default_level));
    let (filter, handle) = reload::Layer::new(filter);

    let (writer, guard) = match std::env::var("DEVD_LOG_FILE").ok().map(std::path::PathBuf::from)
    {
        Some(path) => {
            let dir = path.parent().unwrap_or(std::path::Path::new(".")).to_path_buf();
            let file = path.file_name().map(|f| f.to_os_string()).unwrap_or_default();
            let appender = tracing_appender::rolling::never(dir, file);
            let (non_blocking, guard) = tracing_appender::non_blocking(appender);
            (BoxMakeWriter::new(non_blocking), Some(guard))
        }
        None => (BoxMakeWriter::new(std::io::stderr), None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_ansi(false).with_writer(writer))
        .init();

    (LogHandle(Some(handle)), guard)
}
