use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::geometry::{Axis, Position};

/// Convergence tolerance between expected and reported position, mm.
pub const POSITION_TOLERANCE_MM: f64 = 0.1;

/// Closed interval of permitted travel on one axis, mm.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AxisRange {
    pub min: f64,
    pub max: f64,
}

impl AxisRange {
    pub fn new(min: f64, max: f64) -> AxisRange {
        AxisRange { min, max }
    }

    /// Endpoints are inside the range.
    pub fn contains(&self, value: f64) -> bool {
        value >= self.min && value <= self.max
    }

    pub fn span(&self) -> f64 {
        self.max - self.min
    }
}

/// Host-side travel envelope. Immutable once the controller is configured.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SoftLimits {
    pub x: AxisRange,
    pub y: AxisRange,
    pub z: AxisRange,
}

impl SoftLimits {
    pub fn axis(&self, axis: Axis) -> AxisRange {
        match axis {
            Axis::X => self.x,
            Axis::Y => self.y,
            Axis::Z => self.z,
        }
    }

    pub fn contains(&self, position: &Position) -> bool {
        Axis::ALL.iter().all(|&axis| self.axis(axis).contains(position.axis(axis)))
    }
}

impl Default for SoftLimits {
    fn default() -> SoftLimits {
        SoftLimits {
            x: AxisRange::new(0.0, 300.0),
            y: AxisRange::new(0.0, 300.0),
            z: AxisRange::new(0.0, 100.0),
        }
    }
}

/// Rate caps applied by the validator and the pre-flight checks, mm/min
/// except acceleration (mm/s²) and spindle speed (rpm).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SpeedLimits {
    pub max_feed_rate: f64,
    pub max_jog_rate: f64,
    pub max_acceleration: f64,
    pub max_spindle_speed: f64,
}

impl Default for SpeedLimits {
    fn default() -> SpeedLimits {
        SpeedLimits {
            max_feed_rate: 3000.0,
            max_jog_rate: 5000.0,
            max_acceleration: 500.0,
            max_spindle_speed: 24000.0,
        }
    }
}

/// Everything the controller needs from the embedding application.
#[derive(Debug, Clone)]
pub struct HostConfig {
    pub soft_limits: SoftLimits,
    pub speed_limits: SpeedLimits,
    pub connect_timeout: Duration,
    pub poll_interval: Duration,
}

impl Default for HostConfig {
    fn default() -> HostConfig {
        HostConfig {
            soft_limits: SoftLimits::default(),
            speed_limits: SpeedLimits::default(),
            connect_timeout: Duration::from_secs(5),
            poll_interval: Duration::from_millis(250),
        }
    }
}

fn default_baud() -> u32 {
    115_200
}
fn default_data_bits() -> u8 {
    8
}
fn default_stop_bits() -> u8 {
    1
}
fn default_tcp_port() -> u16 {
    23
}
fn default_tcp_timeout_ms() -> u64 {
    5000
}
fn default_bt_channel() -> u8 {
    1
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Parity {
    #[default]
    None,
    Even,
    Odd,
}

/// Link configuration supplied by the embedding application. The concrete
/// transports live outside the core; these are the parameters they consume.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TransportConfig {
    Serial {
        port: String,
        #[serde(default = "default_baud")]
        baud_rate: u32,
        #[serde(default = "default_data_bits")]
        data_bits: u8,
        #[serde(default = "default_stop_bits")]
        stop_bits: u8,
        #[serde(default)]
        parity: Parity,
    },
    Tcp {
        host: String,
        #[serde(default = "default_tcp_port")]
        port: u16,
        #[serde(default = "default_tcp_timeout_ms")]
        timeout_ms: u64,
    },
    Bluetooth {
        address: String,
        #[serde(default = "default_bt_channel")]
        channel: u8,
    },
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn default_envelope_matches_machine() {
        let limits = SoftLimits::default();
        assert!(limits.contains(&Position::new(0.0, 300.0, 100.0)));
        assert!(!limits.contains(&Position::new(-0.001, 0.0, 0.0)));
    }

    #[test]
    fn serial_config_fills_defaults() {
        let config: TransportConfig =
            serde_json::from_str(r#"{"kind": "serial", "port": "/dev/ttyUSB0"}"#).unwrap();
        match config {
            TransportConfig::Serial { baud_rate, data_bits, stop_bits, parity, .. } => {
                assert_eq!(baud_rate, 115_200);
                assert_eq!(data_bits, 8);
                assert_eq!(stop_bits, 1);
                assert_eq!(parity, Parity::None);
            }
            other => panic!("expected serial config, got {:?}", other),
        }
    }

    #[test]
    fn tcp_config_fills_defaults() {
        let config: TransportConfig =
            serde_json::from_str(r#"{"kind": "tcp", "host": "machine.local"}"#).unwrap();
        assert_eq!(
            config,
            TransportConfig::Tcp { host: "machine.local".to_string(), port: 23, timeout_ms: 5000 }
        );
    }
}
