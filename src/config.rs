//! Controller configuration.
//!
//! Timeouts that bound every wait on a live-state transition. Values come
//! from defaults, then `ICADMIN_*` environment variables, then the command line.

use std::time::Duration;

use crate::controller::error::{Error, Result};

/// Default time to wait for a group to apply a member's transactions.
pub const DEFAULT_GTID_WAIT_TIMEOUT: Duration = Duration::from_secs(60);
/// Default time to wait for a joining member to become ONLINE.
pub const DEFAULT_JOIN_TIMEOUT: Duration = Duration::from_secs(300);
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

const ENV_GTID_WAIT_TIMEOUT: &str = "ICADMIN_GTID_WAIT_TIMEOUT_SECS";
const ENV_JOIN_TIMEOUT: &str = "ICADMIN_JOIN_TIMEOUT_SECS";
const ENV_POLL_INTERVAL: &str = "ICADMIN_POLL_INTERVAL_MS";
const ENV_CONNECT_TIMEOUT: &str = "ICADMIN_CONNECT_TIMEOUT_SECS";

/// Timeouts and polling settings for controller operations.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AdminConfig {
    /// Equivalent of `dba.gtidWaitTimeout`.
    pub gtid_wait_timeout: Duration,
    pub join_timeout: Duration,
    pub poll_interval: Duration,
    pub connect_timeout: Duration,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            gtid_wait_timeout: DEFAULT_GTID_WAIT_TIMEOUT,
            join_timeout: DEFAULT_JOIN_TIMEOUT,
            poll_interval: DEFAULT_POLL_INTERVAL,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }
}

impl AdminConfig {
    /// Defaults overridden by the `ICADMIN_*` environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Same as [`AdminConfig::from_env`] with an injectable lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();
        if let Some(v) = lookup(ENV_GTID_WAIT_TIMEOUT) {
            config.gtid_wait_timeout = Duration::from_secs(parse_u64(ENV_GTID_WAIT_TIMEOUT, &v)?);
        }
        if let Some(v) = lookup(ENV_JOIN_TIMEOUT) {
            config.join_timeout = Duration::from_secs(parse_u64(ENV_JOIN_TIMEOUT, &v)?);
        }
        if let Some(v) = lookup(ENV_POLL_INTERVAL) {
            let ms = parse_u64(ENV_POLL_INTERVAL, &v)?;
            if ms == 0 {
                return Err(Error::Argument(format!(
                    "Invalid value for {ENV_POLL_INTERVAL}: must be greater than 0"
                )));
            }
            config.poll_interval = Duration::from_millis(ms);
        }
        if let Some(v) = lookup(ENV_CONNECT_TIMEOUT) {
            config.connect_timeout = Duration::from_secs(parse_u64(ENV_CONNECT_TIMEOUT, &v)?);
        }
        Ok(config)
    }

    pub fn with_gtid_wait_timeout(mut self, timeout: Duration) -> Self {
        self.gtid_wait_timeout = timeout;
        self
    }

    pub fn with_join_timeout(mut self, timeout: Duration) -> Self {
        self.join_timeout = timeout;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

fn parse_u64(name: &str, value: &str) -> Result<u64> {
    value.trim().parse::<u64>().map_err(|_| {
        Error::Argument(format!(
            "Invalid value for {name}: '{value}' is not a non-negative integer"
        ))
    })
}
