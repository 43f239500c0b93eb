//! Client configuration.
//!
//! Loaded from environment variables layered over defaults; the binary adds
//! command-line overrides on top.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::env;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::room::TopologyMode;

pub const DEFAULT_SIGNALING_URL: &str = "ws://127.0.0.1:8080";

pub const DEFAULT_ICE_SERVER: &str = "stun:stun.l.google.com:19302";

/// Time a link may spend negotiating before the watchdog re-initiates it.
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 15;

pub const DEFAULT_INITIAL_BACKOFF_MS: u64 = 1000;

pub const DEFAULT_MAX_BACKOFF_SECS: u64 = 30;

pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub signaling_url: String,
    pub ice_servers: Vec<String>,
    /// Topology used when this client creates a meeting. Joiners adopt the
    /// room's mode.
    pub mode: TopologyMode,
    /// Newly captured tracks start disabled.
    pub start_muted: bool,
    /// Ask for a camera as well as a microphone.
    pub request_video: bool,
    pub reconnect: ReconnectPolicy,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            signaling_url: DEFAULT_SIGNALING_URL.to_string(),
            ice_servers: vec![DEFAULT_ICE_SERVER.to_string()],
            mode: TopologyMode::Mesh,
            start_muted: true,
            request_video: true,
            reconnect: ReconnectPolicy::default(),
        }
    }
}

/// What happens to links that fail or never connect.
///
/// The default does nothing on its own: a failed link is only re-initiated
/// when the roster changes again.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectPolicy {
    /// Re-initiate as soon as a link we are responsible for goes terminal.
    pub reinitiate_on_failure: bool,
    pub watchdog: Option<WatchdogConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WatchdogConfig {
    pub connect_timeout: Duration,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub max_attempts: u32,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS),
            initial_backoff: Duration::from_millis(DEFAULT_INITIAL_BACKOFF_MS),
            max_backoff: Duration::from_secs(DEFAULT_MAX_BACKOFF_SECS),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

impl WatchdogConfig {
    /// Delay before retry number `attempt` (1-based), doubling from the
    /// initial backoff and capped at the maximum.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.initial_backoff
            .saturating_mul(1u32 << exponent)
            .min(self.max_backoff)
    }

    /// How often the session should check for stalled links.
    pub fn tick_interval(&self) -> Duration {
        (self.connect_timeout / 4).max(Duration::from_millis(100))
    }
}

impl ClientConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_vars(&env::vars().collect())
    }

    /// Load configuration from a `HashMap` (for testing).
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self> {
        let mut config = ClientConfig::default();

        if let Some(url) = vars.get("MEETING_SIGNALING_URL") {
            config.signaling_url = url.clone();
        }

        if let Some(mode) = vars.get("MEETING_MODE") {
            config.mode = mode.parse().map_err(Error::Config)?;
        }

        if let Some(servers) = vars.get("MEETING_ICE_SERVERS") {
            config.ice_servers = servers
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect();
        }

        if let Some(flag) = vars.get("MEETING_START_MUTED") {
            config.start_muted = parse_bool("MEETING_START_MUTED", flag)?;
        }

        if let Some(flag) = vars.get("MEETING_RECONNECT") {
            config.reconnect.reinitiate_on_failure = parse_bool("MEETING_RECONNECT", flag)?;
        }

        // Zero disables the watchdog.
        if let Some(secs) = vars.get("MEETING_WATCHDOG_SECS") {
            let secs: u64 = secs.parse().map_err(|_| {
                Error::Config(format!("MEETING_WATCHDOG_SECS must be seconds, got {secs}"))
            })?;
            config.reconnect.watchdog = (secs > 0).then(|| WatchdogConfig {
                connect_timeout: Duration::from_secs(secs),
                ..WatchdogConfig::default()
            });
        }

        Ok(config)
    }
}

fn parse_bool(name: &str, value: &str) -> Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(Error::Config(format!("{name} must be a boolean, got {other}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn defaults_without_env() {
        let config = ClientConfig::from_vars(&HashMap::new()).unwrap();
        assert_eq!(config, ClientConfig::default());
        assert!(config.start_muted);
        assert!(config.reconnect.watchdog.is_none());
        assert!(!config.reconnect.reinitiate_on_failure);
    }

    #[test]
    fn env_overrides() {
        let config = ClientConfig::from_vars(&vars(&[
            ("MEETING_SIGNALING_URL", "wss://signal.example/ws"),
            ("MEETING_MODE", "sfu"),
            ("MEETING_ICE_SERVERS", "stun:a:3478, turn:b:3478,"),
            ("MEETING_WATCHDOG_SECS", "10"),
            ("MEETING_RECONNECT", "yes"),
        ]))
        .unwrap();

        assert_eq!(config.signaling_url, "wss://signal.example/ws");
        assert_eq!(config.mode, TopologyMode::Delegated);
        assert_eq!(config.ice_servers, vec!["stun:a:3478", "turn:b:3478"]);
        assert!(config.reconnect.reinitiate_on_failure);
        let watchdog = config.reconnect.watchdog.unwrap();
        assert_eq!(watchdog.connect_timeout, Duration::from_secs(10));
    }

    #[test]
    fn rejects_bad_values() {
        assert!(ClientConfig::from_vars(&vars(&[("MEETING_MODE", "ring")])).is_err());
        assert!(ClientConfig::from_vars(&vars(&[("MEETING_WATCHDOG_SECS", "soon")])).is_err());
        assert!(ClientConfig::from_vars(&vars(&[("MEETING_RECONNECT", "maybe")])).is_err());
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let watchdog = WatchdogConfig {
            connect_timeout: Duration::from_secs(5),
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(5),
            max_attempts: 10,
        };
        assert_eq!(watchdog.backoff(1), Duration::from_secs(1));
        assert_eq!(watchdog.backoff(2), Duration::from_secs(2));
        assert_eq!(watchdog.backoff(3), Duration::from_secs(4));
        assert_eq!(watchdog.backoff(4), Duration::from_secs(5));
        assert_eq!(watchdog.backoff(40), Duration::from_secs(5));
    }
}
