//! Pool configuration

use std::time::Duration;

use serde::Deserialize;

use crate::constants::{
    DEFAULT_ACQUIRE_TIMEOUT, DEFAULT_CONNECT_TIMEOUT, DEFAULT_ESL_PASSWORD, DEFAULT_ESL_PORT,
    DEFAULT_EVICTION_INTERVAL, DEFAULT_HEALTH_CHECK_INTERVAL, DEFAULT_IDLE_TIMEOUT,
    DEFAULT_PROBE_TIMEOUT, DEFAULT_READ_TIMEOUT, DEFAULT_WRITE_TIMEOUT,
};
use crate::error::{EslError, EslResult};

/// Default upper bound on open transports.
pub const DEFAULT_MAX_OPEN: usize = 10;

/// Default idle-set capacity.
pub const DEFAULT_MAX_IDLE: usize = 5;

/// Settings shared by a [`Pool`](crate::Pool) and every transport it creates.
///
/// Deserializable from application config; missing fields take their
/// defaults and durations are given in milliseconds:
///
/// ```
/// let config: freeswitch_esl_pool::PoolConfig = serde_json::from_str(
///     r#"{"host": "10.0.0.5", "max_open": 4, "max_idle": 2, "acquire_timeout": 2500}"#,
/// )
/// .unwrap();
/// assert_eq!(config.port, 8021);
/// assert_eq!(config.acquire_timeout.as_millis(), 2500);
/// ```
#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// FreeSWITCH host.
    pub host: String,
    /// ESL port. Default: 8021.
    pub port: u16,
    /// Shared secret sent in `auth`.
    pub password: String,
    /// Upper bound on transports in existence, idle or checked out.
    pub max_open: usize,
    /// Capacity of the idle set.
    pub max_idle: usize,
    /// How long [`Pool::get`](crate::Pool::get) waits.
    #[serde(with = "duration_ms")]
    pub acquire_timeout: Duration,
    /// Idle transports older than this are discarded by the background scans.
    #[serde(with = "duration_ms")]
    pub idle_timeout: Duration,
    #[serde(with = "duration_ms")]
    pub connect_timeout: Duration,
    #[serde(with = "duration_ms")]
    pub read_timeout: Duration,
    #[serde(with = "duration_ms")]
    pub write_timeout: Duration,
    /// Deadline for each half of the liveness probe.
    #[serde(with = "duration_ms")]
    pub probe_timeout: Duration,
    #[serde(with = "duration_ms")]
    pub health_check_interval: Duration,
    #[serde(with = "duration_ms")]
    pub eviction_interval: Duration,
    /// Transports created when the pool starts, capped at `max_idle`.
    /// Defaults to the default `max_idle`, so a pool starts with a full idle
    /// set; set to 0 to dial lazily.
    pub warm_up: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: DEFAULT_ESL_PORT,
            password: DEFAULT_ESL_PASSWORD.to_string(),
            max_open: DEFAULT_MAX_OPEN,
            max_idle: DEFAULT_MAX_IDLE,
            acquire_timeout: DEFAULT_ACQUIRE_TIMEOUT,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            read_timeout: DEFAULT_READ_TIMEOUT,
            write_timeout: DEFAULT_WRITE_TIMEOUT,
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
            health_check_interval: DEFAULT_HEALTH_CHECK_INTERVAL,
            eviction_interval: DEFAULT_EVICTION_INTERVAL,
            warm_up: DEFAULT_MAX_IDLE,
        }
    }
}

impl std::fmt::Debug for PoolConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("password", &"[REDACTED]")
            .field("max_open", &self.max_open)
            .field("max_idle", &self.max_idle)
            .field("acquire_timeout", &self.acquire_timeout)
            .field("idle_timeout", &self.idle_timeout)
            .field("connect_timeout", &self.connect_timeout)
            .field("read_timeout", &self.read_timeout)
            .field("write_timeout", &self.write_timeout)
            .field("probe_timeout", &self.probe_timeout)
            .field("health_check_interval", &self.health_check_interval)
            .field("eviction_interval", &self.eviction_interval)
            .field("warm_up", &self.warm_up)
            .finish()
    }
}

impl PoolConfig {
    /// Config for `host:port` with every other field at its default.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            ..Self::default()
        }
    }

    /// `host:port` as dialed.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Check the invariants the pool relies on.
    pub fn validate(&self) -> EslResult<()> {
        if self
            .host
            .trim()
            .is_empty()
        {
            return Err(EslError::invalid_config("host must not be empty"));
        }
        if self.max_open == 0 {
            return Err(EslError::invalid_config("max_open must be at least 1"));
        }
        if self.max_idle > self.max_open {
            return Err(EslError::invalid_config(format!(
                "max_idle ({}) exceeds max_open ({})",
                self.max_idle, self.max_open
            )));
        }
        for (name, value) in [
            ("health_check_interval", self.health_check_interval),
            ("eviction_interval", self.eviction_interval),
        ] {
            if value.is_zero() {
                return Err(EslError::invalid_config(format!("{} must be non-zero", name)));
            }
        }
        Ok(())
    }
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        let config = PoolConfig::default();
        assert!(config
            .validate()
            .is_ok());
        assert_eq!(config.addr(), "localhost:8021");
        assert_eq!(config.warm_up, config.max_idle);
    }

    #[test]
    fn test_validate_rejects_bad_bounds() {
        let mut config = PoolConfig::new("127.0.0.1", 8021);
        config.max_open = 0;
        config.max_idle = 0;
        assert!(matches!(
            config.validate(),
            Err(EslError::InvalidConfig { .. })
        ));

        let mut config = PoolConfig::new("127.0.0.1", 8021);
        config.max_open = 2;
        config.max_idle = 3;
        assert!(matches!(
            config.validate(),
            Err(EslError::InvalidConfig { .. })
        ));

        let config = PoolConfig::new("  ", 8021);
        assert!(matches!(
            config.validate(),
            Err(EslError::InvalidConfig { .. })
        ));
    }

    #[test]
    fn test_validate_rejects_zero_interval() {
        let mut config = PoolConfig::default();
        config.eviction_interval = Duration::ZERO;
        assert!(config
            .validate()
            .is_err());
    }

    #[test]
    fn test_debug_redacts_password() {
        let mut config = PoolConfig::default();
        config.password = "s3cret".to_string();
        let debug = format!("{:?}", config);
        assert!(!debug.contains("s3cret"));
        assert!(debug.contains("[REDACTED]"));
    }

    #[test]
    fn test_deserialize_partial_json() {
        let config: PoolConfig = serde_json::from_str(
            r#"{"host":"fs1","port":8022,"max_open":2,"max_idle":2,"idle_timeout":1500,"warm_up":2}"#,
        )
        .unwrap();
        assert_eq!(config.addr(), "fs1:8022");
        assert_eq!(config.max_open, 2);
        assert_eq!(config.idle_timeout, Duration::from_millis(1500));
        assert_eq!(config.warm_up, 2);
        assert_eq!(config.password, DEFAULT_ESL_PASSWORD);
        assert_eq!(config.read_timeout, DEFAULT_READ_TIMEOUT);
    }
}
