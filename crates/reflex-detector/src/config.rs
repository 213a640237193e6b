//! reflex.toml configuration parser.
//!
//! ```toml
//! [thresholds]
//! lower_limit = 3
//! upper_limit = 10
//! buffer_length = 5
//!
//! [detector]
//! policy = "latch"
//! state_mapping = "established_close"
//! key_kind = "netns"
//! keys = [4026532281]
//!
//! [daemon]
//! rearm_after = "5s"
//! report_interval = "2s"
//! ```
//!
//! `[thresholds]` is mandatory and validated while parsing; the other
//! sections fall back to defaults.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::detector::HysteresisDetector;
use crate::error::{DetectorError, DetectorResult};
use crate::types::{DebouncePolicy, StateMapping, Thresholds, TrackedKey};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReflexConfig {
    pub thresholds: Thresholds,
    #[serde(default)]
    pub detector: DetectorConfig,
    #[serde(default)]
    pub daemon: DaemonConfig,
}

/// What the keys mean.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyKind {
    /// Network namespace inode numbers.
    #[default]
    Netns,
    /// TCP destination ports.
    Port,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DetectorConfig {
    #[serde(default)]
    pub policy: DebouncePolicy,
    #[serde(default)]
    pub state_mapping: StateMapping,
    #[serde(default)]
    pub key_kind: KeyKind,
    /// Keys registered before any event is processed.
    #[serde(default)]
    pub keys: Vec<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// How long a latched key stays latched after its signal is handled.
    pub rearm_after: Option<String>,
    /// Interval between connection-count reports.
    pub report_interval: Option<String>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            rearm_after: Some("5s".to_string()),
            report_interval: Some("2s".to_string()),
        }
    }
}

impl DaemonConfig {
    pub fn rearm_after(&self) -> DetectorResult<Duration> {
        self.rearm_after
            .as_deref()
            .map_or(Ok(Duration::from_secs(5)), parse_duration)
    }

    pub fn report_interval(&self) -> DetectorResult<Duration> {
        self.report_interval
            .as_deref()
            .map_or(Ok(Duration::from_secs(2)), parse_duration)
    }
}

impl DetectorConfig {
    pub fn netns_keys(&self) -> Vec<u32> {
        self.keys.clone()
    }

    /// Keys narrowed to port numbers.
    pub fn port_keys(&self) -> DetectorResult<Vec<u16>> {
        self.keys
            .iter()
            .map(|&k| u16::try_from(k).map_err(|_| DetectorError::PortOutOfRange(k)))
            .collect()
    }
}

impl ReflexConfig {
    pub fn from_file(path: &Path) -> DetectorResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> DetectorResult<Self> {
        let config: ReflexConfig =
            toml::from_str(content).map_err(|e| DetectorError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Checks that are not expressible in the serde layer.
    pub fn validate(&self) -> DetectorResult<()> {
        if self.detector.key_kind == KeyKind::Port {
            self.detector.port_keys()?;
        }
        self.daemon.rearm_after()?;
        self.daemon.report_interval()?;
        Ok(())
    }

    pub fn to_toml_string(&self) -> DetectorResult<String> {
        toml::to_string_pretty(self).map_err(|e| DetectorError::Parse(e.to_string()))
    }

    /// Build an empty detector with this config's thresholds, policy and
    /// state mapping. Keys are registered by the caller.
    pub fn build_detector<K: TrackedKey>(&self) -> HysteresisDetector<K> {
        HysteresisDetector::new(self.thresholds)
            .with_policy(self.detector.policy)
            .with_state_mapping(self.detector.state_mapping)
    }
}

/// Parse a duration string like "500ms", "30s", "5m". A bare number is seconds.
pub fn parse_duration(s: &str) -> DetectorResult<Duration> {
    let s = s.trim();
    let invalid = || DetectorError::InvalidDuration(s.to_string());

    let (digits, scale_ms) = if let Some(ms) = s.strip_suffix("ms") {
        (ms, 1)
    } else if let Some(secs) = s.strip_suffix('s') {
        (secs, 1_000)
    } else if let Some(mins) = s.strip_suffix('m') {
        (mins, 60_000)
    } else {
        (s, 1_000)
    };

    let value: u64 = digits.trim().parse().map_err(|_| invalid())?;
    value
        .checked_mul(scale_ms)
        .map(Duration::from_millis)
        .ok_or_else(invalid)
}

#[cfg(test)]
mod tests {
    use super::*;

    const FULL: &str = r#"
[thresholds]
lower_limit = 3
upper_limit = 10
buffer_length = 5

[detector]
policy = "latch"
state_mapping = "fin_wait_last_ack"
key_kind = "port"
keys = [8080, 9090]

[daemon]
rearm_after = "250ms"
report_interval = "1m"
"#;

    #[test]
    fn parse_full() {
        let config = ReflexConfig::from_toml(FULL).unwrap();
        assert_eq!(config.thresholds.buffer_length(), 5);
        assert_eq!(config.detector.policy, DebouncePolicy::Latch);
        assert_eq!(config.detector.state_mapping, StateMapping::FinWaitLastAck);
        assert_eq!(config.detector.port_keys().unwrap(), vec![8080, 9090]);
        assert_eq!(config.daemon.rearm_after().unwrap(), Duration::from_millis(250));
        assert_eq!(config.daemon.report_interval().unwrap(), Duration::from_secs(60));
    }

    #[test]
    fn parse_minimal_uses_defaults() {
        let config = ReflexConfig::from_toml(
            r#"
[thresholds]
lower_limit = 0
upper_limit = 4
buffer_length = 1
"#,
        )
        .unwrap();
        assert_eq!(config.detector.policy, DebouncePolicy::AutoReset);
        assert_eq!(config.detector.key_kind, KeyKind::Netns);
        assert!(config.detector.keys.is_empty());
        assert_eq!(config.daemon.rearm_after().unwrap(), Duration::from_secs(5));
    }

    #[test]
    fn missing_thresholds_rejected() {
        let err = ReflexConfig::from_toml("[detector]\nkeys = [1]\n").unwrap_err();
        assert!(matches!(err, DetectorError::Parse(_)));

        let err = ReflexConfig::from_toml(
            "[thresholds]\nlower_limit = 3\nupper_limit = 10\n",
        )
        .unwrap_err();
        assert!(matches!(err, DetectorError::Parse(_)));
    }

    #[test]
    fn invalid_thresholds_rejected() {
        let err = ReflexConfig::from_toml(
            "[thresholds]\nlower_limit = 10\nupper_limit = 3\nbuffer_length = 5\n",
        )
        .unwrap_err();
        assert!(err.to_string().contains("lower limit 10"));

        let err = ReflexConfig::from_toml(
            "[thresholds]\nlower_limit = 1\nupper_limit = 3\nbuffer_length = 0\n",
        )
        .unwrap_err();
        assert!(err.to_string().contains("buffer length"));
    }

    #[test]
    fn oversized_port_rejected() {
        let err = ReflexConfig::from_toml(
            r#"
[thresholds]
lower_limit = 1
upper_limit = 3
buffer_length = 1

[detector]
key_kind = "port"
keys = [70000]
"#,
        )
        .unwrap_err();
        assert!(matches!(err, DetectorError::PortOutOfRange(70000)));
    }

    #[test]
    fn toml_round_trip_keeps_thresholds() {
        let config = ReflexConfig::from_toml(FULL).unwrap();
        let again = ReflexConfig::from_toml(&config.to_toml_string().unwrap()).unwrap();
        assert_eq!(again.thresholds, config.thresholds);
    }

    #[test]
    fn detector_picks_up_policy() {
        let config = ReflexConfig::from_toml(FULL).unwrap();
        let d = config.build_detector::<u16>();
        assert_eq!(d.policy(), DebouncePolicy::Latch);
        assert_eq!(d.state_mapping(), StateMapping::FinWaitLastAck);
        assert!(d.tracked_keys().is_empty());
    }

    #[test]
    fn example_config_parses() {
        let config = ReflexConfig::from_toml(include_str!("../../../reflex.example.toml")).unwrap();
        assert_eq!(config.thresholds, Thresholds::new(3, 10, 5).unwrap());
        assert_eq!(config.detector.policy, DebouncePolicy::Latch);
    }

    #[test]
    fn parse_duration_values() {
        assert_eq!(parse_duration("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration("750ms").unwrap(), Duration::from_millis(750));
        assert_eq!(parse_duration("7").unwrap(), Duration::from_secs(7));
        assert!(parse_duration("soon").is_err());
        assert!(parse_duration("").is_err());
    }
}
