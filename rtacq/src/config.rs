//! Acquisition module configuration.
//!
//! An [`AcquisitionConfig`] describes one receiver or transmitter board: its
//! datagram layout, sequence tolerance, buffering mode and receiver thread
//! placement. Configs are plain serde types, usually loaded from JSON:
//!
//! ```json
//! {
//!   "name": "magnetics",
//!   "role": "receiver",
//!   "payload_size": 256,
//!   "listen_port": 44488,
//!   "max_data_age_us": 2000,
//!   "max_lost_packets": 5,
//!   "producer_period_us": 1000,
//!   "buffering": { "mode": "scan", "slots": 8, "units_per_packet": 4 }
//! }
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, Result};
use crate::sequence::TrackerConfig;

/// Whether a module consumes or produces the stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModuleRole {
    /// Receives datagrams and serves `get_data`.
    Receiver,
    /// Serves `write_data` and sends datagrams.
    Transmitter,
}

impl ModuleRole {
    /// Lowercase name, as used in the config file.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Receiver => "receiver",
            Self::Transmitter => "transmitter",
        }
    }
}

/// Ring variant used between the receiver thread and the consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum Buffering {
    /// Three-slot trailing rotation; the consumer always gets the newest
    /// complete sample but one.
    #[default]
    Trailing,
    /// Lock/free-scan ring; every datagram is split into `units_per_packet`
    /// units, each stored in its own slot.
    Scan {
        /// Ring size.
        slots: usize,
        /// Units carried by one datagram.
        units_per_packet: usize,
    },
}

/// Timing synchronization on the arrival of new data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Longest `poll` wait in milliseconds.
    pub timeout_ms: u64,
}

/// Configuration of one acquisition module.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcquisitionConfig {
    /// Module name, used in logs and errors.
    pub name: String,
    /// Receiver or transmitter.
    pub role: ModuleRole,
    /// Payload bytes per datagram, after the header.
    pub payload_size: usize,
    /// Max capture-to-arrival age in µs; 0 disables the age check.
    #[serde(default)]
    pub max_data_age_us: u64,
    /// Largest sequence gap treated as loss rather than rollover.
    #[serde(default = "default_max_lost_packets")]
    pub max_lost_packets: u32,
    /// Declared producer period in µs.
    #[serde(default)]
    pub producer_period_us: Option<u64>,
    /// Allowed arrival deviation from the producer period, percent.
    #[serde(default = "default_period_tolerance_pct")]
    pub period_tolerance_pct: u32,
    /// CPUs the receiver thread may run on (bit n = CPU n).
    #[serde(default)]
    pub cpu_mask: Option<u64>,
    /// `SCHED_FIFO` priority of the receiver thread.
    #[serde(default)]
    pub receiver_priority: Option<i32>,
    /// Transmitter destination, `host:port`.
    #[serde(default)]
    pub destination: Option<String>,
    /// Receiver UDP port.
    #[serde(default)]
    pub listen_port: Option<u16>,
    /// Send and expect payload words in big-endian order.
    #[serde(default)]
    pub normalize_byte_order: bool,
    /// Sequence ids wrap at `2^sequence_bits`.
    #[serde(default = "default_sequence_bits")]
    pub sequence_bits: u8,
    /// Ring variant.
    #[serde(default)]
    pub buffering: Buffering,
    /// Enables `poll` synchronization.
    #[serde(default)]
    pub sync: Option<SyncConfig>,
    /// Receive timeout; bounds how long a disable waits for the receiver.
    #[serde(default = "default_recv_timeout_ms")]
    pub recv_timeout_ms: u64,
    /// Minimum interval between two warnings of one class.
    #[serde(default = "default_warning_interval_ms")]
    pub warning_interval_ms: u64,
}

fn default_max_lost_packets() -> u32 {
    10
}

fn default_period_tolerance_pct() -> u32 {
    25
}

fn default_sequence_bits() -> u8 {
    32
}

fn default_recv_timeout_ms() -> u64 {
    100
}

fn default_warning_interval_ms() -> u64 {
    1_000
}

impl AcquisitionConfig {
    /// A receiver with default tuning.
    pub fn receiver(name: impl Into<String>, listen_port: u16, payload_size: usize) -> Self {
        Self {
            listen_port: Some(listen_port),
            ..Self::base(name.into(), ModuleRole::Receiver, payload_size)
        }
    }

    /// A transmitter with default tuning.
    pub fn transmitter(
        name: impl Into<String>,
        destination: impl Into<String>,
        payload_size: usize,
    ) -> Self {
        Self {
            destination: Some(destination.into()),
            ..Self::base(name.into(), ModuleRole::Transmitter, payload_size)
        }
    }

    fn base(name: String, role: ModuleRole, payload_size: usize) -> Self {
        Self {
            name,
            role,
            payload_size,
            max_data_age_us: 0,
            max_lost_packets: default_max_lost_packets(),
            producer_period_us: None,
            period_tolerance_pct: default_period_tolerance_pct(),
            cpu_mask: None,
            receiver_priority: None,
            destination: None,
            listen_port: None,
            normalize_byte_order: false,
            sequence_bits: default_sequence_bits(),
            buffering: Buffering::Trailing,
            sync: None,
            recv_timeout_ms: default_recv_timeout_ms(),
            warning_interval_ms: default_warning_interval_ms(),
        }
    }

    /// Loads and validates a JSON config file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Load`] or [`ConfigError::Parse`] if the file
    /// cannot be read or parsed, and any [`validate`](Self::validate) error.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Load {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Checks the configuration for consistency.
    ///
    /// # Errors
    ///
    /// Returns the first [`ConfigError`] found.
    pub fn validate(&self) -> Result<()> {
        if self.payload_size == 0 {
            return Err(ConfigError::InvalidPayloadSize {
                size: 0,
                reason: "payload cannot be empty".to_string(),
            }
            .into());
        }

        if self.normalize_byte_order && self.payload_size % 4 != 0 {
            return Err(ConfigError::InvalidPayloadSize {
                size: self.payload_size,
                reason: "byte-order normalization needs whole 32-bit words".to_string(),
            }
            .into());
        }

        if !(1..=32).contains(&self.sequence_bits) {
            return Err(ConfigError::InvalidSequenceBits {
                bits: self.sequence_bits,
            }
            .into());
        }

        let modulus = self.sequence_modulus();
        if u64::from(self.max_lost_packets) >= modulus {
            return Err(ConfigError::InvalidMaxLost {
                max_lost: self.max_lost_packets,
                modulus,
            }
            .into());
        }

        match self.role {
            ModuleRole::Receiver => match self.listen_port {
                None => {
                    return Err(ConfigError::InvalidPort {
                        reason: "a receiver needs listen_port".to_string(),
                    }
                    .into());
                }
                Some(0) => {
                    return Err(ConfigError::InvalidPort {
                        reason: "listen_port cannot be zero".to_string(),
                    }
                    .into());
                }
                Some(_) => {}
            },
            ModuleRole::Transmitter => self.validate_destination()?,
        }

        self.validate_buffering()?;

        if self.producer_period_us == Some(0) {
            return Err(ConfigError::InvalidPeriod {
                reason: "producer_period_us cannot be zero".to_string(),
            }
            .into());
        }

        if self.period_tolerance_pct > 100 {
            return Err(ConfigError::InvalidPeriod {
                reason: format!(
                    "period_tolerance_pct ({}) must be <= 100",
                    self.period_tolerance_pct
                ),
            }
            .into());
        }

        Ok(())
    }

    fn validate_destination(&self) -> Result<()> {
        let invalid = || ConfigError::InvalidAddress {
            address: self.destination.clone().unwrap_or_default(),
        };
        let destination = self.destination.as_deref().ok_or_else(invalid)?;
        let (host, port) = destination.rsplit_once(':').ok_or_else(invalid)?;

        if host.is_empty() {
            return Err(invalid().into());
        }
        match port.parse::<u16>() {
            Ok(0) => Err(ConfigError::InvalidPort {
                reason: format!("destination port of '{destination}' cannot be zero"),
            }
            .into()),
            Ok(_) => Ok(()),
            Err(_) => Err(invalid().into()),
        }
    }

    fn validate_buffering(&self) -> Result<()> {
        let Buffering::Scan {
            slots,
            units_per_packet,
        } = self.buffering
        else {
            return Ok(());
        };

        if slots == 0 || u32::try_from(slots).is_err() {
            return Err(ConfigError::InvalidBuffering {
                reason: format!("slot count {slots} out of range"),
            }
            .into());
        }

        if units_per_packet == 0 || self.payload_size % units_per_packet != 0 {
            return Err(ConfigError::InvalidBuffering {
                reason: format!(
                    "payload of {} bytes cannot be split into {units_per_packet} units",
                    self.payload_size
                ),
            }
            .into());
        }

        if self.normalize_byte_order && self.unit_size() % 4 != 0 {
            return Err(ConfigError::InvalidBuffering {
                reason: format!(
                    "unit of {} bytes is not whole 32-bit words",
                    self.unit_size()
                ),
            }
            .into());
        }

        Ok(())
    }

    /// Sequence ids wrap at this value.
    pub fn sequence_modulus(&self) -> u64 {
        1u64 << self.sequence_bits.min(32)
    }

    /// Units per datagram: 1 in trailing mode.
    pub fn units_per_packet(&self) -> usize {
        match self.buffering {
            Buffering::Trailing => 1,
            Buffering::Scan {
                units_per_packet, ..
            } => units_per_packet.max(1),
        }
    }

    /// Bytes per unit, the buffer size `get_data` expects.
    pub fn unit_size(&self) -> usize {
        self.payload_size / self.units_per_packet()
    }

    /// Full datagram size, header included.
    pub fn datagram_size(&self) -> usize {
        crate::packet::HEADER_SIZE + self.payload_size
    }

    /// Receive timeout of the transport.
    pub fn recv_timeout(&self) -> Duration {
        Duration::from_millis(self.recv_timeout_ms)
    }

    /// Tuning for the packet sequence tracker.
    pub fn tracker_config(&self) -> TrackerConfig {
        TrackerConfig {
            max_lost_packets: self.max_lost_packets,
            sequence_bits: self.sequence_bits,
            max_data_age_us: self.max_data_age_us,
            producer_period_us: self.producer_period_us,
            period_tolerance_pct: self.period_tolerance_pct,
            warning_interval_us: self.warning_interval_ms.saturating_mul(1_000),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;
    use crate::error::AcqError;

    fn config_error(config: &AcquisitionConfig) -> ConfigError {
        match config.validate() {
            Err(AcqError::Config(e)) => e,
            other => panic!("expected config error, got {other:?}"),
        }
    }

    #[test]
    fn test_defaults_from_minimal_json() {
        let json = r#"{"name":"a","role":"receiver","payload_size":8,"listen_port":9000}"#;
        let config: AcquisitionConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config, AcquisitionConfig::receiver("a", 9000, 8));
        assert_eq!(config.buffering, Buffering::Trailing);
        assert_eq!(config.sequence_modulus(), 1 << 32);
        config.validate().unwrap();
    }

    #[test]
    fn test_scan_buffering_json() {
        let json = r#"{"name":"a","role":"receiver","payload_size":64,"listen_port":9000,
                       "buffering":{"mode":"scan","slots":8,"units_per_packet":4}}"#;
        let config: AcquisitionConfig = serde_json::from_str(json).unwrap();
        assert_eq!(
            config.buffering,
            Buffering::Scan {
                slots: 8,
                units_per_packet: 4
            }
        );
        assert_eq!(config.unit_size(), 16);
        assert_eq!(config.datagram_size(), 80);
    }

    #[test]
    fn test_from_json_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        let config = AcquisitionConfig::transmitter("tx", "127.0.0.1:9000", 16);
        file.write_all(serde_json::to_string(&config).unwrap().as_bytes())
            .unwrap();

        let loaded = AcquisitionConfig::from_json_file(file.path()).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_from_json_file_errors() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing.json");
        assert!(matches!(
            AcquisitionConfig::from_json_file(&missing),
            Err(AcqError::Config(ConfigError::Load { .. }))
        ));

        let bad = dir.path().join("bad.json");
        std::fs::write(&bad, "{not json").unwrap();
        assert!(matches!(
            AcquisitionConfig::from_json_file(&bad),
            Err(AcqError::Config(ConfigError::Parse { .. }))
        ));
    }

    #[test]
    fn test_payload_validation() {
        let mut config = AcquisitionConfig::receiver("a", 9000, 0);
        assert!(matches!(
            config_error(&config),
            ConfigError::InvalidPayloadSize { size: 0, .. }
        ));

        config.payload_size = 6;
        config.normalize_byte_order = true;
        assert!(matches!(
            config_error(&config),
            ConfigError::InvalidPayloadSize { size: 6, .. }
        ));
    }

    #[test]
    fn test_sequence_validation() {
        let mut config = AcquisitionConfig::receiver("a", 9000, 4);
        config.sequence_bits = 33;
        assert!(matches!(
            config_error(&config),
            ConfigError::InvalidSequenceBits { bits: 33 }
        ));

        config.sequence_bits = 3;
        config.max_lost_packets = 8;
        assert!(matches!(
            config_error(&config),
            ConfigError::InvalidMaxLost {
                max_lost: 8,
                modulus: 8
            }
        ));

        config.max_lost_packets = 7;
        config.validate().unwrap();
    }

    #[test]
    fn test_role_endpoints() {
        let mut rx = AcquisitionConfig::receiver("a", 0, 4);
        assert!(matches!(config_error(&rx), ConfigError::InvalidPort { .. }));
        rx.listen_port = None;
        assert!(matches!(config_error(&rx), ConfigError::InvalidPort { .. }));

        for bad in ["nohost", ":9000", "host:notaport"] {
            let tx = AcquisitionConfig::transmitter("b", bad, 4);
            assert!(
                matches!(config_error(&tx), ConfigError::InvalidAddress { .. }),
                "{bad}"
            );
        }
        let tx = AcquisitionConfig::transmitter("b", "host:0", 4);
        assert!(matches!(config_error(&tx), ConfigError::InvalidPort { .. }));

        AcquisitionConfig::transmitter("b", "[::1]:9000", 4)
            .validate()
            .unwrap();
    }

    #[test]
    fn test_buffering_validation() {
        let mut config = AcquisitionConfig::receiver("a", 9000, 24);
        for (slots, units) in [(0, 1), (4, 0), (4, 5)] {
            config.buffering = Buffering::Scan {
                slots,
                units_per_packet: units,
            };
            assert!(matches!(
                config_error(&config),
                ConfigError::InvalidBuffering { .. }
            ));
        }

        config.normalize_byte_order = true;
        config.buffering = Buffering::Scan {
            slots: 4,
            units_per_packet: 4,
        };
        // 6-byte units are not whole words.
        assert!(matches!(
            config_error(&config),
            ConfigError::InvalidBuffering { .. }
        ));

        config.buffering = Buffering::Scan {
            slots: 4,
            units_per_packet: 3,
        };
        config.validate().unwrap();
    }

    #[test]
    fn test_period_validation() {
        let mut config = AcquisitionConfig::receiver("a", 9000, 4);
        config.producer_period_us = Some(0);
        assert!(matches!(config_error(&config), ConfigError::InvalidPeriod { .. }));

        config.producer_period_us = Some(1_000);
        config.period_tolerance_pct = 101;
        assert!(matches!(config_error(&config), ConfigError::InvalidPeriod { .. }));
    }

    #[test]
    fn test_tracker_config_mapping() {
        let mut config = AcquisitionConfig::receiver("a", 9000, 4);
        config.max_data_age_us = 500;
        config.warning_interval_ms = 250;
        let tracker = config.tracker_config();
        assert_eq!(tracker.max_data_age_us, 500);
        assert_eq!(tracker.warning_interval_us, 250_000);
        assert_eq!(tracker.sequence_bits, 32);
    }
}
