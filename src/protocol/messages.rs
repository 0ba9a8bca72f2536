//! meshlink handshake wire formats
//!
//! Every handshake-phase message starts with the same header:
//!
//! ```text
//! magic(4) = "MSHL" | version(1) | type(1)
//! ```
//!
//! followed by a type-specific body:
//! - Type 1: Handshake (key_len(2, BE) | session_key(key_len))
//! - Type 2: Ok (status(1), 0 = accepted)
//! - Type 3: PeerInfo (private_ip(4))

use std::io::ErrorKind;
use std::net::Ipv4Addr;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{MeshError, NetworkError, ProtocolError};

/// Protocol magic bytes
pub const MAGIC: [u8; 4] = *b"MSHL";

/// Protocol version carried in every header
pub const VERSION: u8 = 1;

/// Size of the common message header
pub const HEADER_LEN: usize = 6;

/// Upper bound for the session key carried in a Handshake
pub const MAX_SESSION_KEY_LEN: usize = 64;

/// Ok status meaning the handshake was accepted
pub const STATUS_ACCEPTED: u8 = 0;

/// Handshake message types
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Handshake = 1,
    Ok = 2,
    PeerInfo = 3,
}

impl TryFrom<u8> for MessageType {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::Handshake),
            2 => Ok(Self::Ok),
            3 => Ok(Self::PeerInfo),
            _ => Err(ProtocolError::malformed(format!(
                "unknown message type {}",
                value
            ))),
        }
    }
}

/// Check that `bytes` start with our magic and protocol version.
///
/// This is a predicate, not an error path: callers decide what an
/// invalid magic means.
pub fn is_magic_valid(bytes: &[u8]) -> bool {
    bytes.len() > MAGIC.len() && bytes[..MAGIC.len()] == MAGIC && bytes[MAGIC.len()] == VERSION
}

/// Common message header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Header {
    magic: [u8; 4],
    version: u8,
    msg_type: u8,
}

impl Header {
    fn new(msg_type: MessageType) -> Self {
        Self {
            magic: MAGIC,
            version: VERSION,
            msg_type: msg_type as u8,
        }
    }

    fn to_bytes(self) -> [u8; HEADER_LEN] {
        let mut buf = [0u8; HEADER_LEN];
        buf[..4].copy_from_slice(&self.magic);
        buf[4] = self.version;
        buf[5] = self.msg_type;
        buf
    }

    fn from_bytes(buf: [u8; HEADER_LEN]) -> Self {
        let mut magic = [0u8; 4];
        magic.copy_from_slice(&buf[..4]);
        Self {
            magic,
            version: buf[4],
            msg_type: buf[5],
        }
    }

    /// Reject anything that is not `expected` from a peer speaking our protocol
    fn expect(self, expected: MessageType) -> Result<(), ProtocolError> {
        if !is_magic_valid(&self.to_bytes()) {
            return Err(ProtocolError::malformed("bad magic or version"));
        }
        self.expect_type(expected)
    }

    fn expect_type(self, expected: MessageType) -> Result<(), ProtocolError> {
        let got = MessageType::try_from(self.msg_type)?;
        if got != expected {
            return Err(ProtocolError::malformed(format!(
                "expected {:?}, got {:?}",
                expected, got
            )));
        }
        Ok(())
    }
}

/// Handshake message (initiator -> responder, first)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeMessage {
    magic: [u8; 4],
    version: u8,
    session_key: Vec<u8>,
}

impl HandshakeMessage {
    /// Create a handshake carrying `session_key` with our magic and version
    pub fn new(session_key: Vec<u8>) -> Self {
        Self {
            magic: MAGIC,
            version: VERSION,
            session_key,
        }
    }

    /// Session key entropy sent by the initiator
    pub fn session_key(&self) -> &[u8] {
        &self.session_key
    }

    /// Consume the message, keeping the session key
    pub fn into_session_key(self) -> Vec<u8> {
        self.session_key
    }

    /// Serialize to bytes
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HEADER_LEN + 2 + self.session_key.len());
        buf.extend_from_slice(&self.magic);
        buf.push(self.version);
        buf.push(MessageType::Handshake as u8);
        buf.extend_from_slice(&(self.session_key.len() as u16).to_be_bytes());
        buf.extend_from_slice(&self.session_key);
        buf
    }
}

/// Peer info message, exchanged in both directions after Ok
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerInfo {
    pub private_ip: Ipv4Addr,
}

impl PeerInfo {
    /// Size of the encoded message
    pub const SIZE: usize = HEADER_LEN + 4;

    pub fn new(private_ip: Ipv4Addr) -> Self {
        Self { private_ip }
    }

    /// Serialize to bytes
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[..HEADER_LEN].copy_from_slice(&Header::new(MessageType::PeerInfo).to_bytes());
        buf[HEADER_LEN..].copy_from_slice(&self.private_ip.octets());
        buf
    }
}

/// Write a Handshake message
pub async fn write_handshake<W: AsyncWrite + Unpin>(
    writer: &mut W,
    msg: &HandshakeMessage,
) -> Result<(), MeshError> {
    if msg.session_key.is_empty() || msg.session_key.len() > MAX_SESSION_KEY_LEN {
        return Err(ProtocolError::InvalidMessageLength {
            expected: MAX_SESSION_KEY_LEN,
            got: msg.session_key.len(),
        }
        .into());
    }
    write_all(writer, &msg.to_bytes()).await
}

/// Read a Handshake message.
///
/// Magic and version are returned as received; check them with
/// [`is_magic_valid`] on [`HandshakeMessage::to_bytes`].
pub async fn read_handshake<R: AsyncRead + Unpin>(
    reader: &mut R,
) -> Result<HandshakeMessage, MeshError> {
    let header = read_header(reader).await?;
    header.expect_type(MessageType::Handshake)?;

    let mut len_buf = [0u8; 2];
    read_exact(reader, &mut len_buf).await?;
    let key_len = u16::from_be_bytes(len_buf) as usize;
    if key_len == 0 || key_len > MAX_SESSION_KEY_LEN {
        return Err(ProtocolError::malformed(format!("session key length {}", key_len)).into());
    }

    let mut session_key = vec![0u8; key_len];
    read_exact(reader, &mut session_key).await?;

    Ok(HandshakeMessage {
        magic: header.magic,
        version: header.version,
        session_key,
    })
}

/// Write an Ok acknowledgement
pub async fn write_ok<W: AsyncWrite + Unpin>(writer: &mut W) -> Result<(), MeshError> {
    let mut buf = [0u8; HEADER_LEN + 1];
    buf[..HEADER_LEN].copy_from_slice(&Header::new(MessageType::Ok).to_bytes());
    buf[HEADER_LEN] = STATUS_ACCEPTED;
    write_all(writer, &buf).await
}

/// Read an Ok acknowledgement
pub async fn read_ok<R: AsyncRead + Unpin>(reader: &mut R) -> Result<(), MeshError> {
    read_header(reader).await?.expect(MessageType::Ok)?;

    let mut status = [0u8; 1];
    read_exact(reader, &mut status).await?;
    if status[0] != STATUS_ACCEPTED {
        return Err(ProtocolError::malformed(format!("handshake status {}", status[0])).into());
    }
    Ok(())
}

/// Write a PeerInfo message advertising `private_ip`
pub async fn write_peer_info<W: AsyncWrite + Unpin>(
    writer: &mut W,
    private_ip: Ipv4Addr,
) -> Result<(), MeshError> {
    write_all(writer, &PeerInfo::new(private_ip).to_bytes()).await
}

/// Read a PeerInfo message
pub async fn read_peer_info<R: AsyncRead + Unpin>(reader: &mut R) -> Result<PeerInfo, MeshError> {
    read_header(reader).await?.expect(MessageType::PeerInfo)?;

    let mut octets = [0u8; 4];
    read_exact(reader, &mut octets).await?;
    Ok(PeerInfo::new(Ipv4Addr::from(octets)))
}

async fn read_header<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Header, MeshError> {
    let mut buf = [0u8; HEADER_LEN];
    read_exact(reader, &mut buf).await?;
    Ok(Header::from_bytes(buf))
}

/// `read_exact` where EOF mid-message is a malformed message, not an I/O failure
async fn read_exact<R: AsyncRead + Unpin>(reader: &mut R, buf: &mut [u8]) -> Result<(), MeshError> {
    match reader.read_exact(buf).await {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => {
            Err(ProtocolError::malformed("stream closed mid-message").into())
        }
        Err(e) => Err(NetworkError::Io(e).into()),
    }
}

async fn write_all<W: AsyncWrite + Unpin>(writer: &mut W, buf: &[u8]) -> Result<(), MeshError> {
    writer.write_all(buf).await.map_err(NetworkError::Io)?;
    writer.flush().await.map_err(NetworkError::Io)?;
    Ok(())
}
