use crate::bus::Level;
use crate::protocol::AddressWidth;
use serde::{Deserialize, Serialize};

/// Settings for the slave-side transport device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    pub handshake: HandshakeConfig,
    pub outbound_capacity: usize,
    pub inbound_capacity: usize,
    /// Abort an in-flight transfer after this long without bus activity.
    /// Unset means wait forever.
    #[serde(default)]
    pub stall_timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandshakeConfig {
    pub pin: u8,
    pub active_level: Level,
}

/// Settings for the master-side bridge daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub spi: SpiConfig,
    pub handshake: HandshakeInputConfig,
    pub polling: PollingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpiConfig {
    pub device: String,
    pub speed_hz: u32,
    pub mode: u8,
    #[serde(default)]
    pub address_bits: AddressWidth,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandshakeInputConfig {
    /// sysfs GPIO number of the handshake line.
    pub gpio: u64,
    pub active_level: Level,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollingConfig {
    pub interval_ms: u64,
    /// Upper bound on handshakes serviced per poll.
    #[serde(default = "default_max_polls")]
    pub max_polls: usize,
}

fn default_max_polls() -> usize {
    256
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            handshake: HandshakeConfig {
                pin: 5,
                active_level: Level::High,
            },
            outbound_capacity: 128,
            inbound_capacity: 128,
            stall_timeout_ms: None,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            spi: SpiConfig {
                device: "/dev/spidev0.0".to_string(),
                speed_hz: 1_000_000,
                mode: 0,
                address_bits: AddressWidth::Bits8,
            },
            handshake: HandshakeInputConfig {
                gpio: 48,
                active_level: Level::High,
            },
            polling: PollingConfig {
                interval_ms: 10,
                max_polls: default_max_polls(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_daemon_config() {
        let yaml = r#"
spi:
  device: /dev/spidev1.0
  speed_hz: 4000000
  mode: 0
  address_bits: bits32
handshake:
  gpio: 60
  active_level: low
polling:
  interval_ms: 5
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.spi.device, "/dev/spidev1.0");
        assert_eq!(config.spi.address_bits, AddressWidth::Bits32);
        assert_eq!(config.handshake.active_level, Level::Low);
        assert_eq!(config.polling.max_polls, 256);
    }

    #[test]
    fn test_parse_transport_config() {
        let yaml = r#"
handshake:
  pin: 4
  active_level: high
outbound_capacity: 256
inbound_capacity: 64
"#;
        let config: TransportConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.handshake.pin, 4);
        assert_eq!(config.inbound_capacity, 64);
        assert_eq!(config.stall_timeout_ms, None);
    }
}
