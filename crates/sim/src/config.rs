//! Simulation config: defaults, then an optional TOML file, then env vars.
//!
//! File path: first command-line argument, else `DUST_SIM_CONFIG`.
//! Env overrides: `DUST_SIM_PEER`, `DUST_SIM_MESSAGE`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use dust_link::{LinkConfig, LinkError, PeerAddress};
use serde::Deserialize;
use thiserror::Error;

pub const DEFAULT_MASTER: PeerAddress = PeerAddress::new([0xC8, 0xC9, 0xA3, 0xC5, 0xFA, 0x98]);
pub const DEFAULT_NODE: PeerAddress = PeerAddress::new([0x24, 0x0A, 0xC4, 0x00, 0x00, 0x01]);

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("{var}: {reason}")]
    Env { var: &'static str, reason: String },

    #[error("unknown channel preset {0:?}")]
    UnknownPreset(String),

    #[error("[link] section: {0}")]
    Link(#[source] LinkError),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SimConfig {
    /// Station the node talks to.
    #[serde(default = "default_peer")]
    pub peer: PeerAddress,
    #[serde(default = "default_node")]
    pub node: PeerAddress,
    #[serde(default = "default_message")]
    pub message: String,
    /// Frames sent by the burst scenario.
    #[serde(default = "default_burst")]
    pub burst: usize,
    /// Channel presets to run, in order.
    #[serde(default = "default_presets")]
    pub presets: Vec<String>,
    #[serde(default)]
    pub link: LinkSection,
}

/// Link tuning in plain milliseconds.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LinkSection {
    pub ack_timeout_ms: u64,
    pub base_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub max_attempts: u32,
    pub transmit_timeout_ms: u64,
    pub tick_ms: u64,
}

impl Default for LinkSection {
    fn default() -> Self {
        let link = LinkConfig::default();
        Self {
            ack_timeout_ms: link.ack_timeout.as_millis() as u64,
            base_backoff_ms: link.base_backoff.as_millis() as u64,
            max_backoff_ms: link.max_backoff.as_millis() as u64,
            max_attempts: link.max_attempts,
            transmit_timeout_ms: link.transmit_timeout.as_millis() as u64,
            tick_ms: link.tick.as_millis() as u64,
        }
    }
}

impl LinkSection {
    pub fn to_link_config(&self) -> LinkConfig {
        LinkConfig {
            ack_timeout: Duration::from_millis(self.ack_timeout_ms),
            base_backoff: Duration::from_millis(self.base_backoff_ms),
            max_backoff: Duration::from_millis(self.max_backoff_ms),
            max_attempts: self.max_attempts,
            transmit_timeout: Duration::from_millis(self.transmit_timeout_ms),
            tick: Duration::from_millis(self.tick_ms),
            ..LinkConfig::default()
        }
    }
}

fn default_peer() -> PeerAddress {
    DEFAULT_MASTER
}
fn default_node() -> PeerAddress {
    DEFAULT_NODE
}
fn default_message() -> String {
    "HELLO".to_string()
}
fn default_burst() -> usize {
    50
}
fn default_presets() -> Vec<String> {
    ["good", "average", "poor", "extreme"].map(String::from).to_vec()
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            peer: default_peer(),
            node: default_node(),
            message: default_message(),
            burst: default_burst(),
            presets: default_presets(),
            link: LinkSection::default(),
        }
    }
}

impl SimConfig {
    /// Load from `path` when given, then apply env overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_overrides(|var| std::env::var(var).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.link.to_link_config().validate().map_err(ConfigError::Link)
    }

    /// Config file path from the command line or `DUST_SIM_CONFIG`.
    pub fn path_from_env(mut args: impl Iterator<Item = String>) -> Option<PathBuf> {
        args.next()
            .or_else(|| std::env::var("DUST_SIM_CONFIG").ok())
            .map(PathBuf::from)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<(), ConfigError> {
        if let Some(s) = lookup("DUST_SIM_PEER") {
            self.peer = s.parse().map_err(|e: LinkError| ConfigError::Env {
                var: "DUST_SIM_PEER",
                reason: e.to_string(),
            })?;
        }
        if let Some(s) = lookup("DUST_SIM_MESSAGE") {
            self.message = s;
        }
        Ok(())
    }
}
