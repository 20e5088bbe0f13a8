// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Resolves the immutable, process-wide `Configuration` from environment
//! variables (spec §3 "Configuration", §6.4).

use std::path::PathBuf;

/// Log severity, mirroring `datadog-log`'s `LogEventLevel` numbering so the
/// `OPT_L`/`OPT_F` integers map directly onto it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(i64)]
pub enum LogLevel {
    Trace = 0,
    Debug = 1,
    Info = 2,
    Warn = 3,
    Error = 4,
}

impl LogLevel {
    fn from_i64(v: i64) -> Self {
        match v {
            0 => LogLevel::Trace,
            1 => LogLevel::Debug,
            2 => LogLevel::Info,
            4 => LogLevel::Error,
            _ => LogLevel::Warn,
        }
    }

    pub fn to_tracing_level(self) -> tracing::Level {
        match self {
            LogLevel::Trace => tracing::Level::TRACE,
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Error => tracing::Level::ERROR,
        }
    }
}

/// Resolved, immutable configuration (spec §3, §6.4).
///
/// `logs_root` is the directory named by `OPT_D` as the caller provided it.
/// Resolves spec Open Question O4: the original overwrites its one
/// `conf_opt_d` global with the numbered subdirectory `init_tcpsnitch`
/// creates, leaking the original value. Here the numbered subdirectory is
/// tracked separately by `Lifecycle` (see `lifecycle::Lifecycle::logs_dir`)
/// so `logs_root` always reflects what the environment actually asked for.
#[derive(Debug, Clone, PartialEq)]
pub struct Configuration {
    pub bytes_threshold: i64,
    pub tcp_info_time_threshold_us: i64,
    pub json_flush_every_events: u64,
    pub log_file_level: LogLevel,
    pub log_stderr_level: LogLevel,
    pub logs_root: PathBuf,
    pub capture_device: Option<String>,
    pub opt_c: i64,
    pub opt_p: i64,
    pub opt_v: i64,
}

const OPT_B: &str = "OPT_B";
const OPT_C: &str = "OPT_C";
const OPT_D: &str = "OPT_D";
const OPT_E: &str = "OPT_E";
const OPT_F: &str = "OPT_F";
const OPT_I: &str = "OPT_I";
const OPT_L: &str = "OPT_L";
const OPT_P: &str = "OPT_P";
const OPT_U: &str = "OPT_U";
const OPT_V: &str = "OPT_V";

fn get_long_opt_or_default(key: &str, default: i64) -> i64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl Configuration {
    /// Parses the `OPT_*` environment keys from spec §6.4. Pure: does no
    /// filesystem access, so `OPT_D`'s readability is checked later by
    /// `Lifecycle::init` (spec §4.7 step 4), not here.
    pub fn from_env() -> anyhow::Result<Configuration> {
        let logs_root = std::env::var(OPT_D)
            .map(PathBuf::from)
            .map_err(|_| anyhow::anyhow!("{OPT_D} not set"))?;

        Ok(Configuration {
            bytes_threshold: get_long_opt_or_default(OPT_B, 4096),
            tcp_info_time_threshold_us: get_long_opt_or_default(OPT_U, 0),
            json_flush_every_events: get_long_opt_or_default(OPT_E, 1000).max(0) as u64,
            log_file_level: LogLevel::from_i64(get_long_opt_or_default(OPT_L, LogLevel::Warn as i64)),
            log_stderr_level: LogLevel::from_i64(get_long_opt_or_default(OPT_F, LogLevel::Warn as i64)),
            logs_root,
            capture_device: std::env::var(OPT_I).ok(),
            opt_c: get_long_opt_or_default(OPT_C, 0),
            opt_p: get_long_opt_or_default(OPT_P, 0),
            opt_v: get_long_opt_or_default(OPT_V, 0),
        })
    }

    #[cfg(test)]
    pub fn default_for_tests() -> Configuration {
        Configuration {
            bytes_threshold: 4096,
            tcp_info_time_threshold_us: 0,
            json_flush_every_events: 1000,
            log_file_level: LogLevel::Warn,
            log_stderr_level: LogLevel::Warn,
            logs_root: PathBuf::from("/tmp/netspy-test"),
            capture_device: None,
            opt_c: 0,
            opt_p: 0,
            opt_v: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // Environment variables are process-global; serialize tests that touch
    // them to avoid cross-test interference.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    #[test]
    fn defaults_match_spec_table() {
        let _guard = ENV_LOCK.lock().unwrap();
        for key in [OPT_B, OPT_C, OPT_D, OPT_E, OPT_F, OPT_I, OPT_L, OPT_P, OPT_U, OPT_V] {
            std::env::remove_var(key);
        }
        std::env::set_var(OPT_D, "/tmp/netspy-defaults");
        let config = Configuration::from_env().unwrap();
        assert_eq!(config.bytes_threshold, 4096);
        assert_eq!(config.json_flush_every_events, 1000);
        assert_eq!(config.tcp_info_time_threshold_us, 0);
        assert_eq!(config.log_file_level, LogLevel::Warn);
        assert_eq!(config.log_stderr_level, LogLevel::Warn);
        assert_eq!(config.capture_device, None);
        std::env::remove_var(OPT_D);
    }

    #[test]
    fn missing_opt_d_is_an_error() {
        let _guard = ENV_LOCK.lock().unwrap();
        std::env::remove_var(OPT_D);
        assert!(Configuration::from_env().is_err());
    }

    #[test]
    fn explicit_values_override_defaults() {
        let _guard = ENV_LOCK.lock().unwrap();
        std::env::set_var(OPT_D, "/tmp/netspy-explicit");
        std::env::set_var(OPT_B, "1000");
        std::env::set_var(OPT_E, "5");
        std::env::set_var(OPT_I, "eth0");
        let config = Configuration::from_env().unwrap();
        assert_eq!(config.bytes_threshold, 1000);
        assert_eq!(config.json_flush_every_events, 5);
        assert_eq!(config.capture_device.as_deref(), Some("eth0"));
        for key in [OPT_D, OPT_B, OPT_E, OPT_I] {
            std::env::remove_var(key);
        }
    }
}
