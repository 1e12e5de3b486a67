use std::env;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Tunables of a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SessionConfig {
    /// Send an empty `poll` request whenever the session is idle for `poll_frequency_ms`
    pub poll_server: bool,
    pub poll_frequency_ms: u64,
    /// How long a blocking call waits before its request is abandoned; forever if `None`
    pub timeout_ms: Option<u64>,
    /// Receive granularity while a blocking call waits
    pub wait_interval_ms: u64,
    pub send_digest: bool,
    pub verify_digest: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            poll_server: false,
            poll_frequency_ms: 5000,
            timeout_ms: None,
            wait_interval_ms: 10,
            send_digest: false,
            verify_digest: true,
        }
    }
}

impl SessionConfig {
    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|e| Error::Config(format!("Invalid session config: {}", e)))
    }

    /// Defaults overridden by any `QPROXY_*` variables that are set
    pub fn from_env() -> Result<Self> {
        let mut config = SessionConfig::default();
        if let Some(v) = read_env("QPROXY_POLL_SERVER")? {
            config.poll_server = parse_bool("QPROXY_POLL_SERVER", &v)?;
        }
        if let Some(v) = read_env("QPROXY_POLL_FREQUENCY_MS")? {
            config.poll_frequency_ms = parse_u64("QPROXY_POLL_FREQUENCY_MS", &v)?;
        }
        if let Some(v) = read_env("QPROXY_TIMEOUT_MS")? {
            config.timeout_ms = Some(parse_u64("QPROXY_TIMEOUT_MS", &v)?);
        }
        if let Some(v) = read_env("QPROXY_SEND_DIGEST")? {
            config.send_digest = parse_bool("QPROXY_SEND_DIGEST", &v)?;
        }
        if let Some(v) = read_env("QPROXY_VERIFY_DIGEST")? {
            config.verify_digest = parse_bool("QPROXY_VERIFY_DIGEST", &v)?;
        }
        Ok(config)
    }

    pub fn poll_frequency(&self) -> Duration {
        Duration::from_millis(self.poll_frequency_ms)
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }

    pub fn wait_interval(&self) -> Duration {
        Duration::from_millis(self.wait_interval_ms.max(1))
    }
}

fn read_env(name: &str) -> Result<Option<String>> {
    match env::var(name) {
        Ok(value) => Ok(Some(value)),
        Err(env::VarError::NotPresent) => Ok(None),
        Err(env::VarError::NotUnicode(_)) => Err(Error::Config(format!("{} is not valid unicode", name))),
    }
}

fn parse_bool(name: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(Error::Config(format!("{} must be a boolean, got {:?}", name, other))),
    }
}

fn parse_u64(name: &str, value: &str) -> Result<u64> {
    value
        .trim()
        .parse::<u64>()
        .map_err(|e| Error::Config(format!("{} must be a number: {}", name, e)))
}
