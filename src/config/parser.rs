//! meshlink configuration file parser
//!
//! INI-style `.conf` files with one [Interface] section and any number of
//! [Peer] sections.

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use ipnet::Ipv4Net;

use crate::error::ConfigError;

/// Seconds allowed for a handshake when the config does not say
pub const DEFAULT_HANDSHAKE_TIMEOUT: u64 = 10;

/// Default TUN MTU
pub const DEFAULT_MTU: u16 = 1400;

/// Complete node configuration
#[derive(Debug, Clone)]
pub struct MeshConfig {
    /// Local node settings
    pub interface: InterfaceConfig,
    /// Seed peers dialed at startup
    pub peers: Vec<PeerConfig>,
}

/// Interface (local) configuration
#[derive(Clone)]
pub struct InterfaceConfig {
    /// Our private IP with the overlay network prefix
    pub address: Ipv4Net,
    /// TCP port the listener binds
    pub listen_port: u16,
    /// Shared network key (32 bytes)
    pub network_key: [u8; 32],
    /// Deadline for a whole handshake, in seconds
    pub handshake_timeout: u64,
    pub mtu: u16,
}

/// Seed peer configuration
#[derive(Debug, Clone)]
pub struct PeerConfig {
    /// Transport address to dial
    pub endpoint: SocketAddr,
}

impl InterfaceConfig {
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout)
    }
}

impl std::fmt::Debug for InterfaceConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InterfaceConfig")
            .field("address", &self.address)
            .field("listen_port", &self.listen_port)
            .field("handshake_timeout", &self.handshake_timeout)
            .field("mtu", &self.mtu)
            .finish_non_exhaustive()
    }
}

impl MeshConfig {
    /// Parse a configuration from a file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ConfigError::FileNotFound {
                    path: path.display().to_string(),
                }
            } else {
                ConfigError::Io(e)
            }
        })?;
        Self::parse(&content)
    }

    /// Parse a configuration from a string
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let mut interface = InterfaceBuilder::default();
        let mut seen_interface = false;
        let mut peers: Vec<PeerConfig> = Vec::new();
        let mut current_section: Option<Section> = None;
        let mut current_peer: Option<PeerBuilder> = None;

        for (line_num, line) in content.lines().enumerate() {
            let line_num = line_num + 1;
            let line = strip_comment(line).trim();

            if line.is_empty() {
                continue;
            }

            if line.eq_ignore_ascii_case("[interface]") {
                if let Some(peer) = current_peer.take() {
                    peers.push(peer.build()?);
                }
                if seen_interface {
                    return Err(ConfigError::ParseError {
                        line: line_num,
                        message: "Duplicate [Interface] section".to_string(),
                    });
                }
                seen_interface = true;
                current_section = Some(Section::Interface);
                continue;
            } else if line.eq_ignore_ascii_case("[peer]") {
                if let Some(peer) = current_peer.take() {
                    peers.push(peer.build()?);
                }
                current_section = Some(Section::Peer);
                current_peer = Some(PeerBuilder::default());
                continue;
            }

            let Some((key, value)) = line.split_once('=') else {
                return Err(ConfigError::ParseError {
                    line: line_num,
                    message: format!("Expected 'key = value', got: {}", line),
                });
            };

            let key = key.trim().to_lowercase();
            let value = value.trim();

            match current_section {
                Some(Section::Interface) => match key.as_str() {
                    "address" => {
                        interface.address =
                            Some(value.parse().map_err(|_| ConfigError::InvalidCidr {
                                value: value.to_string(),
                            })?);
                    }
                    "listenport" => {
                        interface.listen_port = Some(parse_number(value, "ListenPort", line_num)?);
                    }
                    "networkkey" => {
                        interface.network_key = Some(parse_key(value, "NetworkKey")?);
                    }
                    "handshaketimeout" => {
                        let seconds = parse_number(value, "HandshakeTimeout", line_num)?;
                        if seconds == 0 {
                            return Err(ConfigError::ParseError {
                                line: line_num,
                                message: "HandshakeTimeout must be at least 1 second".to_string(),
                            });
                        }
                        interface.handshake_timeout = Some(seconds);
                    }
                    "mtu" => {
                        interface.mtu = Some(parse_number(value, "MTU", line_num)?);
                    }
                    _ => {
                        tracing::debug!("Unknown interface key: {}", key);
                    }
                },
                Some(Section::Peer) => {
                    let peer = current_peer.as_mut().ok_or(ConfigError::ParseError {
                        line: line_num,
                        message: "Peer value outside of [Peer] section".to_string(),
                    })?;

                    match key.as_str() {
                        "endpoint" => {
                            peer.endpoint = Some(parse_endpoint(value)?);
                        }
                        _ => {
                            tracing::debug!("Unknown peer key: {}", key);
                        }
                    }
                }
                None => {
                    return Err(ConfigError::ParseError {
                        line: line_num,
                        message: "Configuration value outside of any section".to_string(),
                    });
                }
            }
        }

        if let Some(peer) = current_peer.take() {
            peers.push(peer.build()?);
        }

        if !seen_interface {
            return Err(ConfigError::MissingField {
                field: "[Interface] section".to_string(),
            });
        }

        Ok(MeshConfig {
            interface: interface.build()?,
            peers,
        })
    }
}

#[derive(Clone, Copy)]
enum Section {
    Interface,
    Peer,
}

#[derive(Default)]
struct InterfaceBuilder {
    address: Option<Ipv4Net>,
    listen_port: Option<u16>,
    network_key: Option<[u8; 32]>,
    handshake_timeout: Option<u64>,
    mtu: Option<u16>,
}

impl InterfaceBuilder {
    fn build(self) -> Result<InterfaceConfig, ConfigError> {
        let address = self.address.ok_or(ConfigError::MissingField {
            field: "Address".to_string(),
        })?;
        // The network and broadcast addresses cannot be a node's private IP
        let reserved = address.addr() == address.network() || address.addr() == address.broadcast();
        if reserved && address.prefix_len() < 31 {
            return Err(ConfigError::InvalidAddress {
                value: address.to_string(),
            });
        }

        Ok(InterfaceConfig {
            address,
            listen_port: self.listen_port.ok_or(ConfigError::MissingField {
                field: "ListenPort".to_string(),
            })?,
            network_key: self.network_key.ok_or(ConfigError::MissingField {
                field: "NetworkKey".to_string(),
            })?,
            handshake_timeout: self.handshake_timeout.unwrap_or(DEFAULT_HANDSHAKE_TIMEOUT),
            mtu: self.mtu.unwrap_or(DEFAULT_MTU),
        })
    }
}

#[derive(Default)]
struct PeerBuilder {
    endpoint: Option<SocketAddr>,
}

impl PeerBuilder {
    fn build(self) -> Result<PeerConfig, ConfigError> {
        let endpoint = self.endpoint.ok_or(ConfigError::MissingField {
            field: "Endpoint in [Peer]".to_string(),
        })?;
        Ok(PeerConfig { endpoint })
    }
}

/// Drop a trailing `#` comment; base64 never contains '#'
fn strip_comment(line: &str) -> &str {
    match line.find('#') {
        Some(pos) => &line[..pos],
        None => line,
    }
}

fn parse_number<T: std::str::FromStr>(
    value: &str,
    field_name: &str,
    line: usize,
) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::ParseError {
        line,
        message: format!("Invalid {}: {}", field_name, value),
    })
}

/// Parse a base64-encoded 32-byte key
fn parse_key(value: &str, field_name: &str) -> Result<[u8; 32], ConfigError> {
    let bytes = BASE64
        .decode(value)
        .map_err(|_| ConfigError::InvalidKey {
            field: field_name.to_string(),
        })?;

    if bytes.len() != 32 {
        return Err(ConfigError::InvalidKey {
            field: field_name.to_string(),
        });
    }

    let mut key = [0u8; 32];
    key.copy_from_slice(&bytes);
    Ok(key)
}

/// Parse an endpoint (ip:port); hostnames are not resolved
fn parse_endpoint(value: &str) -> Result<SocketAddr, ConfigError> {
    value.parse().map_err(|_| ConfigError::InvalidAddress {
        value: value.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::net::Ipv4Addr;

    const NETWORK_KEY: &str = "UOvtcWdILFwjb1UnsnK+a9lcqYvNTmtPv+fvqIVOz3w=";

    fn config_text() -> String {
        format!(
            r#"
# node A
[Interface]
Address = 10.0.0.1/24
ListenPort = 7000
NetworkKey = {NETWORK_KEY}
HandshakeTimeout = 5   # seconds

[Peer]
Endpoint = 203.0.113.7:7000

[Peer]
Endpoint = 198.51.100.2:7001
"#
        )
    }

    #[test]
    fn test_parse_config() {
        let config = MeshConfig::parse(&config_text()).unwrap();

        assert_eq!(config.interface.address.addr(), Ipv4Addr::new(10, 0, 0, 1));
        assert_eq!(config.interface.address.prefix_len(), 24);
        assert_eq!(config.interface.listen_port, 7000);
        assert_eq!(config.interface.handshake_timeout(), Duration::from_secs(5));
        assert_eq!(config.interface.mtu, DEFAULT_MTU);

        assert_eq!(config.peers.len(), 2);
        assert_eq!(config.peers[0].endpoint.to_string(), "203.0.113.7:7000");
        assert_eq!(config.peers[1].endpoint.port(), 7001);
    }

    #[test]
    fn test_defaults() {
        let text = format!("[Interface]\nAddress = 10.1.0.5/16\nListenPort = 1\nNetworkKey = {NETWORK_KEY}\n");
        let config = MeshConfig::parse(&text).unwrap();
        assert_eq!(config.interface.handshake_timeout, DEFAULT_HANDSHAKE_TIMEOUT);
        assert!(config.peers.is_empty());
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(config_text().as_bytes()).unwrap();

        let config = MeshConfig::from_file(file.path()).unwrap();
        assert_eq!(config.interface.listen_port, 7000);
    }

    #[test]
    fn test_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let result = MeshConfig::from_file(dir.path().join("absent.conf"));
        assert!(matches!(result, Err(ConfigError::FileNotFound { .. })));
    }

    #[test]
    fn test_invalid_key() {
        assert!(parse_key("invalid-base64!", "NetworkKey").is_err());
        assert!(parse_key("dG9vIHNob3J0", "NetworkKey").is_err());
    }

    #[test]
    fn test_missing_fields() {
        assert!(matches!(
            MeshConfig::parse("[Peer]\nEndpoint = 1.2.3.4:5\n"),
            Err(ConfigError::MissingField { .. })
        ));

        let no_key = "[Interface]\nAddress = 10.0.0.1/24\nListenPort = 7000\n";
        assert!(matches!(
            MeshConfig::parse(no_key),
            Err(ConfigError::MissingField { field }) if field == "NetworkKey"
        ));

        let text = format!(
            "[Interface]\nAddress = 10.0.0.1/24\nListenPort = 7000\nNetworkKey = {NETWORK_KEY}\n[Peer]\n"
        );
        assert!(MeshConfig::parse(&text).is_err());
    }

    #[test]
    fn test_network_address_rejected() {
        let text = format!("[Interface]\nAddress = 10.0.0.0/24\nListenPort = 7000\nNetworkKey = {NETWORK_KEY}\n");
        assert!(matches!(
            MeshConfig::parse(&text),
            Err(ConfigError::InvalidAddress { .. })
        ));
    }

    #[test]
    fn test_bad_values_report_line() {
        let text = format!("[Interface]\nAddress = 10.0.0.1/24\nListenPort = seventy\nNetworkKey = {NETWORK_KEY}\n");
        assert!(matches!(
            MeshConfig::parse(&text),
            Err(ConfigError::ParseError { line: 3, .. })
        ));

        assert!(matches!(
            MeshConfig::parse("[Interface]\nAddress = 10.0.0.1\n"),
            Err(ConfigError::InvalidCidr { .. })
        ));
        assert!(matches!(
            MeshConfig::parse("[Peer]\nEndpoint = example.com:7000\n"),
            Err(ConfigError::InvalidAddress { .. })
        ));
    }

    #[test]
    fn test_debug_hides_network_key() {
        let config = MeshConfig::parse(&config_text()).unwrap();
        let printed = format!("{:?}", config.interface);
        assert!(!printed.contains("network_key"));
    }
}
