//! simulation tools for the dust link

pub mod config;
pub mod scenarios;

use std::time::Duration;
use dust_link::RadioConfig;

pub use config::{ConfigError, SimConfig};

pub struct SimulationPresets;

impl SimulationPresets {
    pub fn good_conditions() -> RadioConfig {
        RadioConfig {
            bandwidth_bps: 1_000_000,
            packet_loss: 0.02,
            latency: Duration::from_millis(2),
            latency_jitter: Duration::from_millis(1),
            ..Default::default()
        }
    }

    pub fn average_conditions() -> RadioConfig {
        RadioConfig {
            bandwidth_bps: 1_000_000,
            packet_loss: 0.10,
            latency: Duration::from_millis(5),
            latency_jitter: Duration::from_millis(3),
            ..Default::default()
        }
    }

    pub fn poor_conditions() -> RadioConfig {
        RadioConfig {
            bandwidth_bps: 250_000,
            packet_loss: 0.30,
            latency: Duration::from_millis(10),
            latency_jitter: Duration::from_millis(8),
            ..Default::default()
        }
    }

    // crowded 2.4 GHz band, most frames collide
    pub fn extreme_conditions() -> RadioConfig {
        RadioConfig {
            bandwidth_bps: 100_000,
            packet_loss: 0.60,
            latency: Duration::from_millis(20),
            latency_jitter: Duration::from_millis(15),
            ..Default::default()
        }
    }

    pub fn by_name(name: &str) -> Option<RadioConfig> {
        match name {
            "good" => Some(Self::good_conditions()),
            "average" => Some(Self::average_conditions()),
            "poor" => Some(Self::poor_conditions()),
            "extreme" => Some(Self::extreme_conditions()),
            _ => None,
        }
    }
}
