//! Controller configuration: defaults plus environment overrides.

use cwmp_bridge::{BridgeConfig, BusyPolicy, DeadlineOrigin};
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationSeconds};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::str::FromStr;
use std::time::Duration;
use tracing::{info, warn};

/// Controller configuration
#[serde_as]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    /// REST listen address
    pub rest_host: IpAddr,
    /// REST listen port
    pub rest_port: u16,
    /// Overall HTTP request timeout
    #[serde_as(as = "DurationSeconds<u64>")]
    pub request_timeout: Duration,
    /// Device Command Bridge settings
    pub bridge: BridgeConfig,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            rest_host: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            rest_port: 8000,
            request_timeout: Duration::from_secs(30),
            bridge: BridgeConfig::default(),
        }
    }
}

impl ControllerConfig {
    pub fn rest_addr(&self) -> SocketAddr {
        SocketAddr::new(self.rest_host, self.rest_port)
    }
}

/// Load configuration from the process environment.
pub fn load_config() -> ControllerConfig {
    let mut config = ControllerConfig::default();
    apply_env(&mut config, |key| std::env::var(key).ok());
    config
}

/// Apply overrides from `lookup`. Values that fail to parse are logged
/// and ignored.
pub fn apply_env(config: &mut ControllerConfig, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(port) = parse_var::<u16>(&lookup, "REST_API_PORT") {
        config.rest_port = port;
    }
    if let Some(secs) = parse_var::<u64>(&lookup, "REQUEST_TIMEOUT") {
        config.request_timeout = Duration::from_secs(secs);
    }
    if let Some(secs) = parse_var::<u64>(&lookup, "DEVICE_ANSWER_TIMEOUT") {
        config.bridge.device_answer_timeout = Duration::from_secs(secs);
    }
    if let Some(secs) = parse_var::<u64>(&lookup, "KEEP_ALIVE_INTERVAL") {
        config.bridge.keep_alive_interval = Duration::from_secs(secs);
    }
    if let Some(depth) = parse_var::<usize>(&lookup, "DEVICE_QUEUE_DEPTH") {
        config.bridge.max_queue_depth = depth;
    }
    if let Some(ms) = parse_var::<u64>(&lookup, "BRIDGE_SWEEP_INTERVAL_MS") {
        config.bridge.sweep_interval = Duration::from_millis(ms);
    }

    if let Some(policy) = lookup("DEVICE_BUSY_POLICY") {
        match policy.to_ascii_lowercase().as_str() {
            "queue" => config.bridge.busy_policy = BusyPolicy::Queue,
            "reject" => config.bridge.busy_policy = BusyPolicy::Reject,
            other => warn!(value = other, "DEVICE_BUSY_POLICY must be 'queue' or 'reject'"),
        }
    }
    if let Some(origin) = lookup("DEADLINE_ORIGIN") {
        match origin.to_ascii_lowercase().as_str() {
            "admission" => config.bridge.deadline_origin = DeadlineOrigin::Admission,
            "enqueue" => config.bridge.deadline_origin = DeadlineOrigin::Enqueue,
            other => warn!(value = other, "DEADLINE_ORIGIN must be 'admission' or 'enqueue'"),
        }
    }
}

fn parse_var<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = lookup(key)?;
    match raw.trim().parse() {
        Ok(value) => {
            info!(key, value = %raw.trim(), "Loaded setting from environment");
            Some(value)
        }
        Err(_) => {
            warn!(key, value = %raw, "Ignoring unparsable environment setting");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = ControllerConfig::default();
        assert_eq!(config.rest_port, 8000);
        assert_eq!(config.request_timeout, Duration::from_secs(30));
        assert_eq!(config.bridge.device_answer_timeout, Duration::from_secs(10));
        assert_eq!(config.bridge.keep_alive_interval, Duration::from_secs(300));
        assert_eq!(config.rest_addr().to_string(), "0.0.0.0:8000");
    }

    #[test]
    fn test_env_overrides() {
        let mut config = ControllerConfig::default();
        apply_env(
            &mut config,
            env(&[
                ("REST_API_PORT", "9000"),
                ("REQUEST_TIMEOUT", "45"),
                ("DEVICE_ANSWER_TIMEOUT", "20"),
                ("KEEP_ALIVE_INTERVAL", "120"),
                ("DEVICE_BUSY_POLICY", "Reject"),
                ("DEVICE_QUEUE_DEPTH", "2"),
                ("DEADLINE_ORIGIN", "enqueue"),
                ("BRIDGE_SWEEP_INTERVAL_MS", "250"),
            ]),
        );

        assert_eq!(config.rest_port, 9000);
        assert_eq!(config.request_timeout, Duration::from_secs(45));
        assert_eq!(config.bridge.device_answer_timeout, Duration::from_secs(20));
        assert_eq!(config.bridge.keep_alive_interval, Duration::from_secs(120));
        assert_eq!(config.bridge.busy_policy, BusyPolicy::Reject);
        assert_eq!(config.bridge.max_queue_depth, 2);
        assert_eq!(config.bridge.deadline_origin, DeadlineOrigin::Enqueue);
        assert_eq!(config.bridge.sweep_interval, Duration::from_millis(250));
    }

    #[test]
    fn test_invalid_values_ignored() {
        let mut config = ControllerConfig::default();
        apply_env(
            &mut config,
            env(&[
                ("REST_API_PORT", "eighty"),
                ("DEVICE_ANSWER_TIMEOUT", "-1"),
                ("DEVICE_BUSY_POLICY", "drop"),
            ]),
        );
        assert_eq!(config, ControllerConfig::default());
    }
}
