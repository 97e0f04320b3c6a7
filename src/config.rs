// src/config.rs
//
// =============================================================================
// SUNBENCH: SERVER SETTINGS
// =============================================================================
//
// Precedence, lowest first:
// 1. Built-in defaults.
// 2. Optional YAML file (`--config`).
// 3. Command-line flags (applied by the binary).

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    /// Broker address. Unused by `LocalBus`; kept for a networked `Bus`.
    pub mqtthost: String,
    pub port: u16,
    /// Prefix of the bus client id; a random suffix is appended.
    pub client_id_prefix: String,
    /// How long a run waits for `daq/init`, in seconds.
    pub daq_timeout_s: f64,
    /// Controller-board connect timeout on the e-stop path, in seconds.
    pub estop_timeout_s: f64,
    /// Connect timeout for utility-task instruments, in seconds.
    pub utility_timeout_s: f64,
    /// Connect timeout for measurement instruments, in seconds.
    pub instrument_timeout_s: f64,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            mqtthost: "127.0.0.1".into(),
            port: 1883,
            client_id_prefix: "measure".into(),
            daq_timeout_s: 30.0,
            estop_timeout_s: 10.0,
            utility_timeout_s: 1.0,
            instrument_timeout_s: 10.0,
        }
    }
}

impl ServerSettings {
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Reading settings from {}", path.display()))?;
        Self::from_yaml(&text).with_context(|| format!("Parsing {}", path.display()))
    }

    pub fn from_yaml(text: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(text)?)
    }

    pub fn client_id(&self) -> String {
        format!("{}-{}", self.client_id_prefix, uuid::Uuid::new_v4().simple())
    }

    pub fn daq_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.daq_timeout_s)
    }

    pub fn estop_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.estop_timeout_s)
    }

    pub fn utility_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.utility_timeout_s)
    }

    pub fn instrument_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.instrument_timeout_s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_yaml_keeps_defaults() {
        let s = ServerSettings::from_yaml("mqtthost: broker.lab\ndaq_timeout_s: 5\n").unwrap();
        assert_eq!(s.mqtthost, "broker.lab");
        assert_eq!(s.daq_timeout(), Duration::from_secs(5));
        assert_eq!(s.port, 1883);
        assert_eq!(s.estop_timeout(), Duration::from_secs(10));
    }

    #[test]
    fn client_ids_are_unique() {
        let s = ServerSettings::default();
        let a = s.client_id();
        assert!(a.starts_with("measure-"));
        assert_ne!(a, s.client_id());
    }
}
