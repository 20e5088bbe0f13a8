// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Process-wide lifecycle controller (spec §4.7): one-time initialization,
//! fork reset, and connection teardown on exit.
//!
//! Grounded directly in `original_source/init.c`'s `init_tcpsnitch` /
//! `reset_tcpsnitch` / `cleanup` trio, replacing the global mutable statics
//! and a `pthread_mutex_t` with a single state machine behind one `Mutex`.

use crate::config::Configuration;
use crate::connection::Connection;
use crate::error::LifecycleError;
use crate::json_sink;
use crate::logging::{Logging, MAIN_LOG_FILE};
use crate::registry::Registry;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, OnceLock};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Uninitialized,
    Initializing,
    Initialized,
}

struct Inner {
    state: State,
    config: Option<Configuration>,
    logs_dir: Option<PathBuf>,
}

/// The process-wide instance. `Logging` is split out into its own
/// `OnceLock` because installing a `tracing` global subscriber can only
/// happen once per process, even across a fork-reset cycle (spec §4.7
/// "Fork reset" resets severities and sinks, not the subscriber itself).
pub struct Lifecycle {
    inner: Mutex<Inner>,
    logging: OnceLock<Logging>,
    registry: Registry,
    next_connection_id: AtomicU64,
}

impl Lifecycle {
    const fn new() -> Self {
        Lifecycle {
            inner: Mutex::new(Inner {
                state: State::Uninitialized,
                config: None,
                logs_dir: None,
            }),
            logging: OnceLock::new(),
            registry: Registry::new(),
            next_connection_id: AtomicU64::new(0),
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn next_connection_id(&self) -> u64 {
        self.next_connection_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn is_initialized(&self) -> bool {
        self.inner.lock().unwrap().state == State::Initialized
    }

    pub fn config(&self) -> Option<Configuration> {
        self.inner.lock().unwrap().config.clone()
    }

    pub fn logs_dir(&self) -> Option<PathBuf> {
        self.inner.lock().unwrap().logs_dir.clone()
    }

    /// Idempotent; a second call while already `Initialized` is a no-op,
    /// matching the original's early `if (initialized) goto exit;` (spec
    /// §4.7 step 0).
    pub fn init(&self) -> Result<(), LifecycleError> {
        let mut guard = self.inner.lock().unwrap();
        if guard.state != State::Uninitialized {
            return Ok(());
        }
        guard.state = State::Initializing;
        drop(guard);

        let logging = self
            .logging
            .get_or_init(|| Logging::bootstrap(crate::config::LogLevel::Warn));
        // SAFETY: registers a no-argument, no-return extern "C" function as
        // an atexit handler, as the original does with `cleanup` (spec
        // §4.7 step 2). `atexit_cleanup` touches only process-global state
        // behind its own synchronization.
        unsafe {
            libc::atexit(atexit_cleanup);
        }

        let config = match Configuration::from_env() {
            Ok(config) => config,
            Err(e) => {
                tracing::error!(error = %e, "configuration unavailable, nothing will be written to disk");
                let mut guard = self.inner.lock().unwrap();
                guard.state = State::Initialized;
                return Ok(());
            }
        };

        if std::fs::read_dir(&config.logs_root).is_err() {
            tracing::error!(
                error = %LifecycleError::LogsRootUnreadable,
                logs_root = %config.logs_root.display(),
                "nothing will be written to disk"
            );
            let mut guard = self.inner.lock().unwrap();
            guard.config = Some(config);
            guard.state = State::Initialized;
            return Ok(());
        }

        let logs_dir = match create_numbered_logs_dir(&config.logs_root) {
            Ok(dir) => dir,
            Err(e) => {
                tracing::error!(error = %e, "failed to create numbered logs subdirectory, nothing will be written to disk");
                let mut guard = self.inner.lock().unwrap();
                guard.config = Some(config);
                guard.state = State::Initialized;
                return Ok(());
            }
        };

        let log_file_path = logs_dir.join(MAIN_LOG_FILE);
        if let Err(e) = logging.reconfigure(&log_file_path, config.log_file_level, config.log_stderr_level) {
            tracing::error!(error = %e, "failed to open main log file, continuing with stderr only");
        }

        let mut guard = self.inner.lock().unwrap();
        guard.logs_dir = Some(logs_dir);
        guard.config = Some(config);
        guard.state = State::Initialized;
        Ok(())
    }

    /// Resets all process-global state after a `fork()` (spec §4.7 "Fork
    /// reset"): the child must not share the parent's connections, log
    /// file, or configuration strings. Grounded in `reset_tcpsnitch`.
    pub fn reset_after_fork(&self) {
        let mut guard = self.inner.lock().unwrap();
        if guard.state == State::Uninitialized {
            return;
        }
        if let Some(logging) = self.logging.get() {
            logging.reset_to_bootstrap();
        }
        self.registry.reset();
        self.next_connection_id.store(0, Ordering::Relaxed);
        guard.config = None;
        guard.logs_dir = None;
        guard.state = State::Uninitialized;
    }

    /// Flushes and drops every still-open connection, without tearing
    /// down the registry's capacity (spec §4.7 "close-all"). Used both by
    /// the `atexit` handler and by an explicit `shutdown_all` call.
    pub fn close_all_open_connections(&self) {
        for fd in 0..self.registry.size() as i32 {
            if !self.registry.present(fd) {
                continue;
            }
            if let Some(mut connection) = self.registry.take(fd) {
                close_connection(&mut connection);
            }
        }
    }
}

/// Flushes a connection's final JSON and stops its capture session, if
/// any. Shared by `close_all_open_connections` and (once written)
/// `record_close`'s own single-fd path.
pub fn close_connection(connection: &mut Connection) {
    if let Err(e) = json_sink::flush(connection, true) {
        tracing::warn!(connection_id = connection.id, error = %e, "failed to flush final JSON on close");
    }
    if let Some(capture) = connection.capture_session.take() {
        let linger = Duration::from_micros(connection.rtt as u64 * 2);
        capture.stop(linger);
    }
}

/// Finds the first `base/0`, `base/1`, ... that does not already exist and
/// creates it (spec §4.7 step 5; grounded in `init.c`'s `create_logs_dir`,
/// which resolves Open Question O4 by keeping this path separate from
/// `Configuration::logs_root`).
fn create_numbered_logs_dir(base: &Path) -> Result<PathBuf, LifecycleError> {
    let mut i: u32 = 0;
    loop {
        let candidate = base.join(i.to_string());
        match std::fs::create_dir(&candidate) {
            Ok(()) => return Ok(candidate),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                i += 1;
                continue;
            }
            Err(e) => return Err(LifecycleError::CreateLogsDir(e)),
        }
    }
}

pub static LIFECYCLE: Lifecycle = Lifecycle::new();

extern "C" fn atexit_cleanup() {
    tracing::info!("performing library cleanup before end of process");
    LIFECYCLE.close_all_open_connections();
}

/// Explicit, non-`atexit` entry point for callers that want to flush and
/// stop every open connection without waiting for process exit.
pub fn shutdown_all() {
    LIFECYCLE.close_all_open_connections();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{make_event, EventPayload};

    #[test]
    fn numbered_logs_dir_skips_existing_entries() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::create_dir(tmp.path().join("0")).unwrap();
        std::fs::create_dir(tmp.path().join("1")).unwrap();
        let created = create_numbered_logs_dir(tmp.path()).unwrap();
        assert_eq!(created, tmp.path().join("2"));
    }

    #[test]
    fn numbered_logs_dir_starts_at_zero_when_empty() {
        let tmp = tempfile::tempdir().unwrap();
        let created = create_numbered_logs_dir(tmp.path()).unwrap();
        assert_eq!(created, tmp.path().join("0"));
    }

    #[test]
    fn close_connection_flushes_json_even_without_capture() {
        let tmp = tempfile::tempdir().unwrap();
        let mut con = Connection::new(0, Some(tmp.path().to_path_buf()));
        con.append(make_event(EventPayload::Listen { backlog: 1 }, 0, None, 0));
        close_connection(&mut con);
        assert!(tmp.path().join(json_sink::EVENTS_FILE_NAME).exists());
        assert!(con.capture_session.is_none());
    }

    #[test]
    fn registry_and_id_counter_are_independent_instances_per_test() {
        // Each test gets its own view into the shared LIFECYCLE statics
        // only through its side effects; exercise the counter directly
        // instead of asserting on shared global state.
        let lifecycle = Lifecycle::new();
        assert_eq!(lifecycle.next_connection_id(), 0);
        assert_eq!(lifecycle.next_connection_id(), 1);
    }
}
