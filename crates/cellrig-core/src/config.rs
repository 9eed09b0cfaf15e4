//! Harness configuration
//!
//! A [`HarnessConfig`] is created once per test suite and passed explicitly
//! into groups and assertions. It carries the polling defaults, the startup
//! and teardown budgets, and the addresses of shared components (store,
//! router, file server) that scenarios need to reach.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

use crate::error::{HarnessError, Result};
use crate::signal::Signal;

/// Default `eventually` timeout
pub const DEFAULT_EVENTUALLY_TIMEOUT: Duration = Duration::from_secs(1);

/// Default `consistently` duration
pub const DEFAULT_CONSISTENTLY_DURATION: Duration = Duration::from_millis(100);

/// Default interval between polls
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Default time a group member gets to become ready
pub const DEFAULT_READINESS_TIMEOUT: Duration = Duration::from_secs(5);

/// Default time members get to exit after a teardown signal before being killed
pub const DEFAULT_TEARDOWN_GRACE: Duration = Duration::from_secs(5);

/// Environment variable prefix for overrides
pub const ENV_PREFIX: &str = "CELLRIG_";

/// Harness configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HarnessConfig {
    /// How long `eventually` polls before giving up
    pub eventually_timeout_ms: u64,
    /// How long `consistently` keeps polling
    pub consistently_duration_ms: u64,
    /// Pause between two polls
    pub poll_interval_ms: u64,
    /// Time a group member gets to report ready
    pub readiness_timeout_ms: u64,
    /// Time members get to exit after teardown before escalation to SIGKILL
    pub teardown_grace_ms: u64,
    /// Signal forwarded to the survivors when a member faults
    pub fault_signal: Signal,
    /// Mirror member output to stderr with a `[name]` prefix
    pub mirror_output: bool,
    /// Addresses of shared components, keyed by component name
    pub addresses: BTreeMap<String, String>,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            eventually_timeout_ms: DEFAULT_EVENTUALLY_TIMEOUT.as_millis() as u64,
            consistently_duration_ms: DEFAULT_CONSISTENTLY_DURATION.as_millis() as u64,
            poll_interval_ms: DEFAULT_POLL_INTERVAL.as_millis() as u64,
            readiness_timeout_ms: DEFAULT_READINESS_TIMEOUT.as_millis() as u64,
            teardown_grace_ms: DEFAULT_TEARDOWN_GRACE.as_millis() as u64,
            fault_signal: Signal::Terminate,
            mirror_output: false,
            addresses: BTreeMap::new(),
        }
    }
}

impl HarnessConfig {
    /// Create a configuration for local testing
    ///
    /// Short budgets so that a broken scenario fails in seconds.
    pub fn local_test() -> Self {
        Self {
            eventually_timeout_ms: 2_000,
            readiness_timeout_ms: 2_000,
            teardown_grace_ms: 1_000,
            ..Default::default()
        }
    }

    /// Load defaults and apply `CELLRIG_*` environment overrides
    pub fn from_env() -> Result<Self> {
        Self::default().with_env_from(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary lookup
    ///
    /// Durations accept humantime syntax (`250ms`, `2s`, `1m 30s`).
    /// Recognised keys: `EVENTUALLY_TIMEOUT`, `CONSISTENTLY_DURATION`,
    /// `POLL_INTERVAL`, `READINESS_TIMEOUT`, `TEARDOWN_GRACE`, `FAULT_SIGNAL`,
    /// `MIRROR_OUTPUT`, all with the `CELLRIG_` prefix.
    pub fn with_env_from<F>(mut self, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(&format!("{}{}", ENV_PREFIX, name));

        let durations: [(&str, &mut u64); 5] = [
            ("EVENTUALLY_TIMEOUT", &mut self.eventually_timeout_ms),
            ("CONSISTENTLY_DURATION", &mut self.consistently_duration_ms),
            ("POLL_INTERVAL", &mut self.poll_interval_ms),
            ("READINESS_TIMEOUT", &mut self.readiness_timeout_ms),
            ("TEARDOWN_GRACE", &mut self.teardown_grace_ms),
        ];
        for (name, slot) in durations {
            if let Some(raw) = get(name) {
                *slot = parse_duration(name, &raw)?.as_millis() as u64;
            }
        }

        if let Some(raw) = get("FAULT_SIGNAL") {
            self.fault_signal = raw.parse()?;
        }
        if let Some(raw) = get("MIRROR_OUTPUT") {
            self.mirror_output = matches!(raw.trim(), "1" | "true" | "yes");
        }

        self.validate()?;
        Ok(self)
    }

    /// Check invariants between the fields
    pub fn validate(&self) -> Result<()> {
        if self.poll_interval_ms == 0 {
            return Err(HarnessError::Config("poll interval must be non-zero".into()));
        }
        if self.poll_interval_ms > self.eventually_timeout_ms {
            return Err(HarnessError::Config(format!(
                "poll interval {}ms exceeds eventually timeout {}ms",
                self.poll_interval_ms, self.eventually_timeout_ms
            )));
        }
        Ok(())
    }

    /// Register the address of a shared component
    pub fn with_address(mut self, component: impl Into<String>, address: impl Into<String>) -> Self {
        self.addresses.insert(component.into(), address.into());
        self
    }

    /// Look up the address of a shared component
    pub fn address(&self, component: &str) -> Result<&str> {
        self.addresses
            .get(component)
            .map(String::as_str)
            .ok_or_else(|| HarnessError::Config(format!("no address configured for `{}`", component)))
    }

    pub fn eventually_timeout(&self) -> Duration {
        Duration::from_millis(self.eventually_timeout_ms)
    }

    pub fn consistently_duration(&self) -> Duration {
        Duration::from_millis(self.consistently_duration_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn readiness_timeout(&self) -> Duration {
        Duration::from_millis(self.readiness_timeout_ms)
    }

    pub fn teardown_grace(&self) -> Duration {
        Duration::from_millis(self.teardown_grace_ms)
    }
}

fn parse_duration(name: &str, raw: &str) -> Result<Duration> {
    humantime::parse_duration(raw.trim()).map_err(|e| {
        HarnessError::Config(format!("{}{}: invalid duration `{}`: {}", ENV_PREFIX, name, raw, e))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_config_defaults() {
        let config = HarnessConfig::default();
        assert_eq!(config.eventually_timeout(), Duration::from_secs(1));
        assert_eq!(config.poll_interval(), Duration::from_millis(10));
        assert_eq!(config.consistently_duration(), Duration::from_millis(100));
        assert_eq!(config.fault_signal, Signal::Terminate);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_env_overrides() {
        let config = HarnessConfig::default()
            .with_env_from(lookup(&[
                ("CELLRIG_EVENTUALLY_TIMEOUT", "2s 500ms"),
                ("CELLRIG_POLL_INTERVAL", "50ms"),
                ("CELLRIG_FAULT_SIGNAL", "SIGKILL"),
                ("CELLRIG_MIRROR_OUTPUT", "true"),
            ]))
            .unwrap();

        assert_eq!(config.eventually_timeout_ms, 2_500);
        assert_eq!(config.poll_interval_ms, 50);
        assert_eq!(config.fault_signal, Signal::Kill);
        assert!(config.mirror_output);
    }

    #[test]
    fn test_env_rejects_bad_duration() {
        let err = HarnessConfig::default()
            .with_env_from(lookup(&[("CELLRIG_READINESS_TIMEOUT", "soon")]))
            .unwrap_err();
        assert!(err.to_string().contains("CELLRIG_READINESS_TIMEOUT"));
    }

    #[test]
    fn test_validate_interval_larger_than_timeout() {
        let config = HarnessConfig {
            poll_interval_ms: 5_000,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_component_addresses() {
        let config = HarnessConfig::local_test().with_address("bbs", "127.0.0.1:8889");
        assert_eq!(config.address("bbs").unwrap(), "127.0.0.1:8889");
        assert!(config.address("router").is_err());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: HarnessConfig =
            serde_json::from_str(r#"{"poll_interval_ms": 25, "fault_signal": "kill"}"#).unwrap();
        assert_eq!(config.poll_interval_ms, 25);
        assert_eq!(config.fault_signal, Signal::Kill);
        assert_eq!(config.eventually_timeout_ms, 1_000);
    }
}
