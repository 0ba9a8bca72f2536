//! Error types for meshlink

use thiserror::Error;

/// Main error type for meshlink
#[derive(Error, Debug)]
pub enum MeshError {
    /// Configuration errors
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    /// Cryptographic errors
    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// Protocol errors
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Network (transport) errors
    #[error("Network error: {0}")]
    Network(#[from] NetworkError),

    /// Tunnel errors
    #[error("Tunnel error: {0}")]
    Tunnel(#[from] TunnelError),

    /// System I/O errors
    #[error("System error: {0}")]
    System(#[from] std::io::Error),
}

/// Configuration parsing errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("File not found: {path}")]
    FileNotFound { path: String },

    #[error("Invalid config format at line {line}: {message}")]
    ParseError { line: usize, message: String },

    #[error("Invalid base64 key: {field}")]
    InvalidKey { field: String },

    #[error("Invalid address: {value}")]
    InvalidAddress { value: String },

    #[error("Missing required field: {field}")]
    MissingField { field: String },

    #[error("Invalid CIDR notation: {value}")]
    InvalidCidr { value: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Cryptographic operation errors
#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("Encryption failed")]
    Encryption,

    #[error("Decryption failed: invalid ciphertext or authentication tag")]
    Decryption,
}

/// Protocol-level errors
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Handshake timeout after {seconds}s")]
    HandshakeTimeout { seconds: u64 },

    #[error("Malformed message: {reason}")]
    MalformedMessage { reason: String },

    #[error("Invalid magic bytes")]
    InvalidMagic,

    #[error("Invalid message length: expected {expected}, got {got}")]
    InvalidMessageLength { expected: usize, got: usize },

    #[error("Replay detected: expected counter {expected}, got {counter}")]
    ReplayDetected { expected: u64, counter: u64 },

    #[error("Counter exhausted, session must be re-established")]
    SessionExpired,

    #[error("Peer advertised our own private IP {ip}")]
    SelfConnection { ip: std::net::Ipv4Addr },
}

/// Network-level errors
#[derive(Error, Debug)]
pub enum NetworkError {
    #[error("Dial to {endpoint} failed: {reason}")]
    DialFailed { endpoint: String, reason: String },

    #[error("Socket bind failed on {addr}: {reason}")]
    BindFailed { addr: String, reason: String },

    #[error("Accept failed: {reason}")]
    AcceptFailed { reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Tunnel errors (packet device and per-peer tunnel)
#[derive(Error, Debug)]
pub enum TunnelError {
    #[error("Failed to create TUN device: {reason}")]
    CreateFailed { reason: String },

    #[error("TUN read failed: {reason}")]
    ReadFailed { reason: String },

    #[error("TUN write failed: {reason}")]
    WriteFailed { reason: String },

    #[error("Tunnel to {ip} is closed")]
    TunnelClosed { ip: std::net::Ipv4Addr },

    #[error("Insufficient privileges: {message}")]
    InsufficientPrivileges { message: String },

    #[error("Node is shutting down")]
    ShuttingDown,
}

impl ProtocolError {
    pub(crate) fn malformed(reason: impl Into<String>) -> Self {
        Self::MalformedMessage {
            reason: reason.into(),
        }
    }
}

impl MeshError {
    /// Get a user-friendly error message with suggested action
    pub fn user_message(&self) -> String {
        match self {
            Self::Tunnel(TunnelError::InsufficientPrivileges { .. }) => {
                #[cfg(target_os = "linux")]
                return "Insufficient privileges. Run with sudo or grant CAP_NET_ADMIN:\n  \
                        sudo setcap cap_net_admin=eip ./meshlink"
                    .to_string();
                #[cfg(not(target_os = "linux"))]
                return "Insufficient privileges. Run with sudo:\n  \
                        sudo ./meshlink -c meshlink.conf"
                    .to_string();
            }

            Self::Config(ConfigError::FileNotFound { path }) => {
                format!(
                    "Config file not found: {}\n  Check the path and try again.",
                    path
                )
            }

            Self::Config(ConfigError::InvalidKey { field }) => {
                format!(
                    "Invalid {} in config. Expected 32-byte base64-encoded key.",
                    field
                )
            }

            Self::Network(NetworkError::BindFailed { addr, .. }) => {
                format!(
                    "Could not listen on {}.\n  Check that the port is free.",
                    addr
                )
            }

            _ => format!("{}", self),
        }
    }

    /// Check if this error only concerns a single connection attempt
    pub fn is_recoverable(&self) -> bool {
        match self {
            // Fatal errors
            Self::Config(_) => false,
            Self::Tunnel(TunnelError::InsufficientPrivileges { .. }) => false,
            Self::Tunnel(TunnelError::CreateFailed { .. }) => false,
            Self::Network(NetworkError::BindFailed { .. }) => false,

            // Per-connection errors
            Self::Protocol(_) => true,
            Self::Crypto(_) => true,
            Self::Network(_) => true,
            Self::Tunnel(TunnelError::TunnelClosed { .. }) => true,

            _ => false,
        }
    }

    /// Get the exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Config(_) => 1,
            Self::Tunnel(TunnelError::InsufficientPrivileges { .. }) => 2,
            Self::Network(_) => 3,
            Self::Protocol(_) => 4,
            Self::Crypto(_) => 5,
            Self::Tunnel(_) => 6,
            Self::System(_) => 7,
        }
    }
}
