// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Configuration surface (`spec.md` §6 "Configuration surface"):
//! `HOSTNAME`, `ETCD_ADDR`, `IFACE_PREFIX`, and the three log-level
//! sinks. Values arrive as plain string key/value pairs from the
//! datastore (global config dir overlaid by per-host overrides) and are
//! merged into one [`Config`], loaded once at startup -- a config
//! change is a restart, never a live reload (matches the Non-goal that
//! dynamic reconfiguration is out of scope).

#![forbid(unsafe_code)]

use std::collections::BTreeMap;

/// Default etcd port when `ETCD_ADDR` names a bare host with no port.
pub const DEFAULT_ETCD_PORT: u16 = 4001;

/// Severity of one of the three log sinks (file/screen/syslog).
#[derive(Copy, Clone, Debug, Eq, PartialEq, Default)]
pub enum LogLevel {
    Debug,
    #[default]
    Info,
    Warning,
    Error,
    Critical,
    None,
}

impl LogLevel {
    /// Parse one of the recognized severity strings, case-insensitively.
    /// Unrecognized values leave the current setting in place -- callers
    /// log and move on rather than fail config loading over a typo.
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.to_ascii_lowercase().as_str() {
            "debug" => Some(LogLevel::Debug),
            "info" => Some(LogLevel::Info),
            "warning" | "warn" => Some(LogLevel::Warning),
            "error" => Some(LogLevel::Error),
            "critical" | "fatal" => Some(LogLevel::Critical),
            "none" | "off" => Some(LogLevel::None),
            _ => None,
        }
    }

    /// The `tracing_subscriber::EnvFilter` directive this level maps to.
    #[must_use]
    pub fn as_filter_directive(self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warning => "warn",
            LogLevel::Error => "error",
            LogLevel::Critical => "error",
            LogLevel::None => "off",
        }
    }
}

/// Fully-resolved agent configuration. Unknown datastore keys are
/// tolerated (logged and ignored), per `spec.md` §6.
#[derive(Clone, Debug)]
pub struct Config {
    pub hostname: String,
    pub etcd_addr: String,
    pub iface_prefix: String,
    pub log_file: Option<String>,
    pub log_severity_file: LogLevel,
    pub log_severity_screen: LogLevel,
    pub log_severity_syslog: LogLevel,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            hostname: String::new(),
            etcd_addr: format!("127.0.0.1:{DEFAULT_ETCD_PORT}"),
            iface_prefix: "cali".to_string(),
            log_file: None,
            log_severity_file: LogLevel::default(),
            log_severity_screen: LogLevel::default(),
            log_severity_syslog: LogLevel::default(),
        }
    }
}

impl Config {
    /// Merge a flat key/value map into this config. Call once with the
    /// global config dir, then again with the per-host overrides --
    /// later calls win, matching `spec.md` §4.10's "per-host keys
    /// override global".
    pub fn apply_raw(&mut self, raw: &BTreeMap<String, String>) {
        for (key, value) in raw {
            match key.as_str() {
                "HOSTNAME" => self.hostname = value.clone(),
                "ETCD_ADDR" => self.etcd_addr = normalize_etcd_addr(value),
                "IFACE_PREFIX" => self.iface_prefix = value.clone(),
                "LOGFILE" => self.log_file = Some(value.clone()),
                "LOGSEVERITYFILE" => self.set_if_recognized(value, |c, l| c.log_severity_file = l),
                "LOGSEVERITYSCREEN" => self.set_if_recognized(value, |c, l| c.log_severity_screen = l),
                "LOGSEVERITYSYS" => self.set_if_recognized(value, |c, l| c.log_severity_syslog = l),
                other => tracing::debug!(key = %other, "ignoring unrecognized config key"),
            }
        }
    }

    fn set_if_recognized(&mut self, raw: &str, set: impl FnOnce(&mut Self, LogLevel)) {
        match LogLevel::parse(raw) {
            Some(level) => set(self, level),
            None => tracing::warn!(value = %raw, "ignoring unrecognized log severity"),
        }
    }
}

fn normalize_etcd_addr(raw: &str) -> String {
    if raw.contains(':') {
        raw.to_string()
    } else {
        format!("{raw}:{DEFAULT_ETCD_PORT}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_host_gets_default_port() {
        let mut cfg = Config::default();
        cfg.apply_raw(&BTreeMap::from([("ETCD_ADDR".to_string(), "etcd.example".to_string())]));
        assert_eq!(cfg.etcd_addr, "etcd.example:4001");
    }

    #[test]
    fn explicit_port_is_preserved() {
        let mut cfg = Config::default();
        cfg.apply_raw(&BTreeMap::from([(
            "ETCD_ADDR".to_string(),
            "etcd.example:12345".to_string(),
        )]));
        assert_eq!(cfg.etcd_addr, "etcd.example:12345");
    }

    #[test]
    fn per_host_overrides_global() {
        let mut cfg = Config::default();
        cfg.apply_raw(&BTreeMap::from([("IFACE_PREFIX".to_string(), "cali".to_string())]));
        cfg.apply_raw(&BTreeMap::from([("IFACE_PREFIX".to_string(), "tap".to_string())]));
        assert_eq!(cfg.iface_prefix, "tap");
    }

    #[test]
    fn unrecognized_key_is_tolerated() {
        let mut cfg = Config::default();
        cfg.apply_raw(&BTreeMap::from([("SOME_FUTURE_KEY".to_string(), "x".to_string())]));
        assert_eq!(cfg.hostname, "");
    }

    #[test]
    fn unrecognized_log_level_leaves_previous_value() {
        let mut cfg = Config::default();
        cfg.apply_raw(&BTreeMap::from([(
            "LOGSEVERITYSCREEN".to_string(),
            "very-loud".to_string(),
        )]));
        assert_eq!(cfg.log_severity_screen, LogLevel::Info);
    }
}
