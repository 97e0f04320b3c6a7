// src/logs.rs
//
// =============================================================================
// SUNBENCH: LOGGING
// =============================================================================
//
// Two audiences:
// 1. The operator's terminal: `log` macros rendered by env_logger.
// 2. Bus clients: numeric severities carried inside log events.

use chrono::Local;
use log::Level;
use serde::{Serialize, Serializer};
use std::io::Write;

// ============================================================================
// 1. SEVERITY (Bus Levels)
// ============================================================================

/// Numeric severity understood by bus clients (10/20/30/40).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Debug,
    Info,
    Warning,
    Error,
}

impl Severity {
    pub fn value(self) -> u8 {
        match self {
            Severity::Debug => 10,
            Severity::Info => 20,
            Severity::Warning => 30,
            Severity::Error => 40,
        }
    }

    pub fn as_log_level(self) -> Level {
        match self {
            Severity::Debug => Level::Debug,
            Severity::Info => Level::Info,
            Severity::Warning => Level::Warn,
            Severity::Error => Level::Error,
        }
    }
}

impl From<Level> for Severity {
    fn from(level: Level) -> Self {
        match level {
            Level::Error => Severity::Error,
            Level::Warn => Severity::Warning,
            Level::Info => Severity::Info,
            Level::Debug | Level::Trace => Severity::Debug,
        }
    }
}

impl Serialize for Severity {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(self.value())
    }
}

// ============================================================================
// 2. TERMINAL SINK
// ============================================================================

/// Initializes env_logger. `RUST_LOG` still wins when set.
pub fn init(debug: bool) {
    let default = if debug { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default))
        .format(|buf, record| {
            // Trim "sunbench::sequencer" down to "sequencer"
            let target = record.target();
            let target = target.split("::").last().unwrap_or(target);
            writeln!(
                buf,
                "{}|{}|{}|{}",
                Local::now().format("%Y-%m-%d %H:%M:%S%.3f"),
                target,
                record.level(),
                record.args()
            )
        })
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn severities_use_bus_numbers() {
        let values: Vec<u8> = [
            Severity::Debug,
            Severity::Info,
            Severity::Warning,
            Severity::Error,
        ]
        .into_iter()
        .map(Severity::value)
        .collect();
        assert_eq!(values, vec![10, 20, 30, 40]);
        assert!(Severity::Warning > Severity::Info);
    }

    #[test]
    fn log_levels_map_onto_bus_levels() {
        assert_eq!(Severity::from(Level::Warn).value(), 30);
        assert_eq!(Severity::from(Level::Trace), Severity::Debug);
        assert_eq!(Severity::Error.as_log_level(), Level::Error);
        assert_eq!(serde_json::to_string(&Severity::Warning).unwrap(), "30");
    }
}
