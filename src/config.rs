//! TOML configuration
//!
//! One `[[interface]]` table per emulated link, `[[stream]]` tables bound
//! to interfaces by name, and an optional `[capture]` section. Link-level
//! knobs deserialize straight into the engine's `LinkConfig`.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

use netblast_io::LinkConfig;
use netblast_stream::MutationDescriptor;

pub type ConfigResult<T> = Result<T, ConfigError>;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("interface {0} is defined twice")]
    DuplicateInterface(String),

    #[error("stream {stream} references unknown interface {interface}")]
    UnknownStreamInterface { stream: String, interface: String },

    #[error("stream {stream}: template is not valid hex: {source}")]
    BadTemplate {
        stream: String,
        #[source]
        source: hex::FromHexError,
    },
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CaptureConfig {
    pub file: PathBuf,
    #[serde(default)]
    pub include_streams: bool,
}

fn default_stream_burst() -> u32 {
    1
}

/// One synthetic flow bound to an egress interface.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StreamConfig {
    pub interface: String,
    pub name: String,
    pub rate_pps: f64,
    #[serde(default = "default_stream_burst")]
    pub burst: u32,
    /// Complete template frame as a hex string.
    pub template: String,
    #[serde(default)]
    pub seq_offset: Option<usize>,
    #[serde(default)]
    pub timestamp_offset: Option<usize>,
    #[serde(default)]
    pub checksum_offset: Option<usize>,
}

impl StreamConfig {
    pub fn mutation(&self) -> MutationDescriptor {
        MutationDescriptor {
            seq_offset: self.seq_offset,
            timestamp_offset: self.timestamp_offset,
            checksum_offset: self.checksum_offset,
        }
    }

    pub fn template_bytes(&self) -> ConfigResult<Vec<u8>> {
        hex::decode(self.template.trim()).map_err(|source| ConfigError::BadTemplate {
            stream: self.name.clone(),
            source,
        })
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub capture: Option<CaptureConfig>,
    #[serde(default, rename = "interface")]
    pub interfaces: Vec<LinkConfig>,
    #[serde(default, rename = "stream")]
    pub streams: Vec<StreamConfig>,
}

impl Config {
    pub fn validate(&self) -> ConfigResult<()> {
        let mut names = HashSet::new();
        for link in &self.interfaces {
            if !names.insert(link.name.as_str()) {
                return Err(ConfigError::DuplicateInterface(link.name.clone()));
            }
        }
        for stream in &self.streams {
            if !names.contains(stream.interface.as_str()) {
                return Err(ConfigError::UnknownStreamInterface {
                    stream: stream.name.clone(),
                    interface: stream.interface.clone(),
                });
            }
            stream.template_bytes()?;
        }
        Ok(())
    }
}

pub fn load_config(path: &Path) -> ConfigResult<Config> {
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let config: Config = toml::from_str(&text).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use netblast_io::IoMode;

    const EXAMPLE: &str = r#"
[capture]
file = "/tmp/netblast.pcapng"
include_streams = true

[[interface]]
name = "veth-a"
mode = "shared-ring"
tx_interval_ns = 500000
stream_burst = 64

[[interface]]
name = "veth-b"
mode = "worker-thread"

[[stream]]
interface = "veth-a"
name = "bulk-up"
rate_pps = 10000.0
burst = 32
template = "ffffffffffff02000000000108004500002e000000004011000000000000000000000000"
seq_offset = 14
"#;

    #[test]
    fn parses_full_example() {
        let config: Config = toml::from_str(EXAMPLE).unwrap();
        config.validate().unwrap();
        assert_eq!(config.interfaces.len(), 2);
        assert_eq!(config.interfaces[0].stream_burst, 64);
        assert_eq!(config.interfaces[0].tx_interval_ns, 500_000);
        assert_eq!(config.interfaces[1].mode, IoMode::WorkerThread);
        assert!(config.capture.as_ref().unwrap().include_streams);
        let stream = &config.streams[0];
        assert_eq!(stream.burst, 32);
        assert_eq!(stream.template_bytes().unwrap().len(), 36);
        assert_eq!(stream.mutation().seq_offset, Some(14));
    }

    #[test]
    fn duplicate_interface_is_rejected() {
        let config: Config = toml::from_str(
            r#"
[[interface]]
name = "veth-a"
[[interface]]
name = "veth-a"
"#,
        )
        .unwrap();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::DuplicateInterface(_))
        ));
    }

    #[test]
    fn stream_must_reference_an_interface() {
        let config: Config = toml::from_str(
            r#"
[[stream]]
interface = "missing"
name = "s"
rate_pps = 1.0
template = "00"
"#,
        )
        .unwrap();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::UnknownStreamInterface { .. })
        ));
    }

    #[test]
    fn bad_hex_template_is_rejected() {
        let config: Config = toml::from_str(
            r#"
[[interface]]
name = "veth-a"
[[stream]]
interface = "veth-a"
name = "s"
rate_pps = 1.0
template = "zz"
"#,
        )
        .unwrap();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::BadTemplate { .. })
        ));
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert!(toml::from_str::<Config>("nonsense = 1").is_err());
    }
}
