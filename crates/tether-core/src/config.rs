//! Runtime configuration
//!
//! Defaults can be overridden from the environment:
//! - `TETHER_IO_BACKEND`: `auto`, `epoll`, `poll`, `kqueue` or `uring`
//! - `TETHER_EVENT_CAPACITY`: maximum events reported per backend wait

use crate::{Error, Result};
use std::fmt;
use std::str::FromStr;

/// Environment variable selecting the I/O backend
pub const BACKEND_ENV: &str = "TETHER_IO_BACKEND";

/// Environment variable setting the event buffer capacity
pub const EVENT_CAPACITY_ENV: &str = "TETHER_EVENT_CAPACITY";

/// Default number of events reported per backend wait
pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

/// Which OS polling strategy to use
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackendKind {
    /// Best available for the platform
    #[default]
    Auto,
    /// epoll (Linux)
    Epoll,
    /// poll (any Unix)
    Poll,
    /// kqueue (macOS, BSD)
    Kqueue,
    /// io_uring (Linux, `uring` feature)
    Uring,
}

impl BackendKind {
    /// Every kind compiled in for this platform, excluding `Auto`
    pub fn available() -> Vec<BackendKind> {
        let mut kinds = vec![BackendKind::Poll];
        if cfg!(target_os = "linux") {
            kinds.push(BackendKind::Epoll);
        }
        if cfg!(any(
            target_os = "macos",
            target_os = "ios",
            target_os = "freebsd",
            target_os = "netbsd",
            target_os = "openbsd",
            target_os = "dragonfly"
        )) {
            kinds.push(BackendKind::Kqueue);
        }
        if cfg!(all(target_os = "linux", feature = "uring")) {
            kinds.push(BackendKind::Uring);
        }
        kinds
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BackendKind::Auto => "auto",
            BackendKind::Epoll => "epoll",
            BackendKind::Poll => "poll",
            BackendKind::Kqueue => "kqueue",
            BackendKind::Uring => "uring",
        };
        f.write_str(name)
    }
}

impl FromStr for BackendKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "auto" => Ok(BackendKind::Auto),
            "epoll" => Ok(BackendKind::Epoll),
            "poll" => Ok(BackendKind::Poll),
            "kqueue" => Ok(BackendKind::Kqueue),
            "uring" | "io_uring" | "io-uring" => Ok(BackendKind::Uring),
            other => Err(Error::Config(format!("unknown I/O backend '{}'", other))),
        }
    }
}

/// Runtime configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeConfig {
    /// Backend to build
    pub backend: BackendKind,
    /// Maximum events reported per backend wait
    pub event_capacity: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::Auto,
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }
}

impl RuntimeConfig {
    /// Defaults overridden by `TETHER_*` environment variables
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overridden by whatever `lookup` returns for each variable
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(value) = lookup(BACKEND_ENV) {
            config.backend = value.parse()?;
        }

        if let Some(value) = lookup(EVENT_CAPACITY_ENV) {
            config.event_capacity = value
                .trim()
                .parse::<usize>()
                .ok()
                .filter(|n| *n > 0)
                .ok_or_else(|| Error::Config(format!("{} must be a positive integer, got '{}'", EVENT_CAPACITY_ENV, value)))?;
        }

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_parse_backend_kind() {
        assert_eq!("epoll".parse::<BackendKind>().unwrap(), BackendKind::Epoll);
        assert_eq!(" POLL ".parse::<BackendKind>().unwrap(), BackendKind::Poll);
        assert_eq!("io_uring".parse::<BackendKind>().unwrap(), BackendKind::Uring);
        assert_eq!("".parse::<BackendKind>().unwrap(), BackendKind::Auto);
        assert!(matches!("select".parse::<BackendKind>(), Err(Error::Config(_))));
    }

    #[test]
    fn test_display_round_trips() {
        for kind in [BackendKind::Auto, BackendKind::Epoll, BackendKind::Poll, BackendKind::Kqueue, BackendKind::Uring] {
            assert_eq!(kind.to_string().parse::<BackendKind>().unwrap(), kind);
        }
    }

    #[test]
    fn test_config_defaults() {
        let config = RuntimeConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, RuntimeConfig::default());
        assert_eq!(config.event_capacity, DEFAULT_EVENT_CAPACITY);
    }

    #[test]
    fn test_config_overrides() {
        let config = RuntimeConfig::from_lookup(lookup(&[(BACKEND_ENV, "poll"), (EVENT_CAPACITY_ENV, "32")])).unwrap();
        assert_eq!(config.backend, BackendKind::Poll);
        assert_eq!(config.event_capacity, 32);
    }

    #[test]
    fn test_config_rejects_bad_capacity() {
        assert!(RuntimeConfig::from_lookup(lookup(&[(EVENT_CAPACITY_ENV, "0")])).is_err());
        assert!(RuntimeConfig::from_lookup(lookup(&[(EVENT_CAPACITY_ENV, "lots")])).is_err());
    }

    #[test]
    fn test_poll_always_available() {
        assert!(BackendKind::available().contains(&BackendKind::Poll));
        assert!(!BackendKind::available().contains(&BackendKind::Auto));
    }
}
