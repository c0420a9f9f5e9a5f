use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::ConfigError;

/// How the managed Service ports are derived from the Deployment's container ports.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum PortPolicy {
    #[default]
    AllContainerPorts,
    FirstContainerPort,
    /// Only the container port carrying this name.
    Named(String),
}

impl FromStr for PortPolicy {
    type Err = ConfigError;

    /// Accepts `all`, `first` or `named:<port-name>`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "all" => Ok(PortPolicy::AllContainerPorts),
            "first" => Ok(PortPolicy::FirstContainerPort),
            other => match other.strip_prefix("named:") {
                Some(name) if !name.is_empty() => Ok(PortPolicy::Named(name.to_string())),
                _ => Err(ConfigError::PortPolicy(s.to_string())),
            },
        }
    }
}

/// Controller settings, passed explicitly to every component constructor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControllerConfig {
    /// Restrict the watch to one namespace; `None` watches all.
    pub namespace: Option<String>,
    pub workers: usize,
    /// Capacity of the watcher -> cache mirror channel.
    pub queue_cap: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Failed attempts after which a key is dropped and reported.
    pub max_attempts: u32,
    /// Overall retry budget across all keys, in retries per second. 0 disables it.
    pub retry_qps: u32,
    /// Retries allowed above `retry_qps` in a burst.
    pub retry_burst: u32,
    pub port_policy: PortPolicy,
    pub fallback_port_name: String,
    pub fallback_port: i32,
    pub field_manager: String,
    /// Periodic re-enqueue of every cached key. `None` disables it.
    pub resync_period: Option<Duration>,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            namespace: None,
            workers: 2,
            queue_cap: 2048,
            base_delay: Duration::from_millis(5),
            max_delay: Duration::from_secs(1000),
            max_attempts: 15,
            retry_qps: 10,
            retry_burst: 100,
            port_policy: PortPolicy::default(),
            fallback_port_name: "http".to_string(),
            fallback_port: 80,
            field_manager: "ekspose".to_string(),
            resync_period: Some(Duration::from_secs(600)),
        }
    }
}

impl ControllerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.workers == 0 {
            return Err(ConfigError::NoWorkers);
        }
        if self.max_attempts == 0 {
            return Err(ConfigError::NoAttempts);
        }
        if self.base_delay > self.max_delay {
            return Err(ConfigError::DelayOrder { base: self.base_delay, max: self.max_delay });
        }
        if self.retry_qps > 0 && self.retry_burst == 0 {
            return Err(ConfigError::NoRetryBurst);
        }
        if !(1..=65535).contains(&self.fallback_port) {
            return Err(ConfigError::FallbackPort(self.fallback_port));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        assert_eq!(ControllerConfig::default().validate(), Ok(()));
    }

    #[test]
    fn rejects_inverted_delays() {
        let cfg = ControllerConfig { base_delay: Duration::from_secs(10), max_delay: Duration::from_secs(1), ..Default::default() };
        assert!(matches!(cfg.validate(), Err(ConfigError::DelayOrder { .. })));
        let cfg = ControllerConfig { workers: 0, ..Default::default() };
        assert_eq!(cfg.validate(), Err(ConfigError::NoWorkers));
    }

    #[test]
    fn retry_budget_needs_a_burst_unless_disabled() {
        let cfg = ControllerConfig { retry_burst: 0, ..Default::default() };
        assert_eq!(cfg.validate(), Err(ConfigError::NoRetryBurst));
        let cfg = ControllerConfig { retry_qps: 0, retry_burst: 0, ..Default::default() };
        assert_eq!(cfg.validate(), Ok(()));
    }

    #[test]
    fn parses_port_policies() {
        assert_eq!("all".parse::<PortPolicy>(), Ok(PortPolicy::AllContainerPorts));
        assert_eq!("first".parse::<PortPolicy>(), Ok(PortPolicy::FirstContainerPort));
        assert_eq!("named:metrics".parse::<PortPolicy>(), Ok(PortPolicy::Named("metrics".into())));
        assert!("named:".parse::<PortPolicy>().is_err());
        assert!("bogus".parse::<PortPolicy>().is_err());
    }
}
