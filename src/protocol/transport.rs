//! Tunnel frame encryption
//!
//! After the handshake every IP packet travels as one frame on the
//! connection's byte stream:
//!
//! ```text
//! len(2, BE) | counter(8, LE) | ciphertext(len - 8)
//! ```
//!
//! `len` and `counter` are authenticated as associated data. The stream is
//! ordered, so counters must arrive strictly in sequence.

use std::io::ErrorKind;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::crypto::aead::{self, KEY_LEN, TAG_LEN};
use crate::crypto::keys::TunnelKeys;
use crate::error::{CryptoError, MeshError, NetworkError, ProtocolError};
use crate::protocol::handshake::Role;

/// Size of the frame header (length + counter)
pub const FRAME_HEADER_LEN: usize = 10;

/// Largest IP packet that fits in one frame
pub const MAX_PACKET_SIZE: usize = u16::MAX as usize - 8 - TAG_LEN;

/// Maximum counter value before the session must be replaced
pub const REJECT_AFTER_MESSAGES: u64 = u64::MAX - 8192;

/// Build the authenticated frame header
fn frame_header(ciphertext_len: usize, counter: u64) -> [u8; FRAME_HEADER_LEN] {
    let mut header = [0u8; FRAME_HEADER_LEN];
    header[..2].copy_from_slice(&((ciphertext_len + 8) as u16).to_be_bytes());
    header[2..].copy_from_slice(&counter.to_le_bytes());
    header
}

/// Encrypt an IP packet into a complete frame
pub fn encrypt_frame(
    key: &[u8; KEY_LEN],
    counter: u64,
    plaintext: &[u8],
) -> Result<Vec<u8>, MeshError> {
    if counter >= REJECT_AFTER_MESSAGES {
        return Err(ProtocolError::SessionExpired.into());
    }
    if plaintext.len() > MAX_PACKET_SIZE {
        return Err(ProtocolError::InvalidMessageLength {
            expected: MAX_PACKET_SIZE,
            got: plaintext.len(),
        }
        .into());
    }

    let header = frame_header(plaintext.len() + TAG_LEN, counter);
    let ciphertext = aead::encrypt(key, counter, plaintext, &header)?;

    let mut frame = Vec::with_capacity(FRAME_HEADER_LEN + ciphertext.len());
    frame.extend_from_slice(&header);
    frame.extend_from_slice(&ciphertext);
    Ok(frame)
}

/// Decrypt a frame given its header and ciphertext
///
/// Returns (counter, decrypted IP packet)
pub fn decrypt_frame(
    key: &[u8; KEY_LEN],
    header: &[u8; FRAME_HEADER_LEN],
    ciphertext: &[u8],
) -> Result<(u64, Vec<u8>), MeshError> {
    if ciphertext.len() < TAG_LEN {
        return Err(CryptoError::Decryption.into());
    }

    let mut counter_bytes = [0u8; 8];
    counter_bytes.copy_from_slice(&header[2..]);
    let counter = u64::from_le_bytes(counter_bytes);
    let plaintext = aead::decrypt(key, counter, ciphertext, header)?;
    Ok((counter, plaintext))
}

/// One frame as read from the stream, still encrypted
#[derive(Debug)]
pub struct RawFrame {
    pub header: [u8; FRAME_HEADER_LEN],
    pub ciphertext: Vec<u8>,
}

/// Read one frame.
///
/// Returns `Ok(None)` when the stream ends cleanly on a frame boundary.
pub async fn read_frame<R: AsyncRead + Unpin>(
    reader: &mut R,
) -> Result<Option<RawFrame>, MeshError> {
    let mut header = [0u8; FRAME_HEADER_LEN];

    // First byte separately so a clean close is not an error
    let n = reader.read(&mut header[..1]).await.map_err(NetworkError::Io)?;
    if n == 0 {
        return Ok(None);
    }
    read_exact(reader, &mut header[1..]).await?;

    let len = u16::from_be_bytes([header[0], header[1]]) as usize;
    if len < 8 + TAG_LEN {
        return Err(ProtocolError::malformed(format!("frame length {}", len)).into());
    }

    let mut ciphertext = vec![0u8; len - 8];
    read_exact(reader, &mut ciphertext).await?;
    Ok(Some(RawFrame { header, ciphertext }))
}

/// Write one complete frame
pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    frame: &[u8],
) -> Result<(), MeshError> {
    writer.write_all(frame).await.map_err(NetworkError::Io)?;
    writer.flush().await.map_err(NetworkError::Io)?;
    Ok(())
}

async fn read_exact<R: AsyncRead + Unpin>(reader: &mut R, buf: &mut [u8]) -> Result<(), MeshError> {
    match reader.read_exact(buf).await {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => {
            Err(ProtocolError::malformed("stream closed mid-frame").into())
        }
        Err(e) => Err(NetworkError::Io(e).into()),
    }
}

/// Outgoing direction of a tunnel
pub struct TransportSender {
    key: [u8; KEY_LEN],
    counter: u64,
}

impl TransportSender {
    /// Encrypt a packet and increment the counter
    pub fn encrypt(&mut self, plaintext: &[u8]) -> Result<Vec<u8>, MeshError> {
        let frame = encrypt_frame(&self.key, self.counter, plaintext)?;
        self.counter += 1;
        Ok(frame)
    }

    pub fn counter(&self) -> u64 {
        self.counter
    }
}

/// Incoming direction of a tunnel
pub struct TransportReceiver {
    key: [u8; KEY_LEN],
    /// Counter expected on the next frame
    counter: u64,
}

impl TransportReceiver {
    /// Decrypt a frame and check it is the next in sequence
    pub fn decrypt(&mut self, frame: &RawFrame) -> Result<Vec<u8>, MeshError> {
        let (counter, plaintext) = decrypt_frame(&self.key, &frame.header, &frame.ciphertext)?;

        if counter != self.counter {
            return Err(ProtocolError::ReplayDetected {
                expected: self.counter,
                counter,
            }
            .into());
        }
        self.counter += 1;

        Ok(plaintext)
    }
}

/// Transport state for one established tunnel
pub struct TransportState {
    sending: TransportSender,
    receiving: TransportReceiver,
}

impl TransportState {
    /// Pick sending/receiving keys according to our handshake role
    pub fn new(keys: &TunnelKeys, role: Role) -> Self {
        let (sending_key, receiving_key) = match role {
            Role::Initiator => (keys.initiator_to_responder, keys.responder_to_initiator),
            Role::Responder => (keys.responder_to_initiator, keys.initiator_to_responder),
        };
        Self {
            sending: TransportSender {
                key: sending_key,
                counter: 0,
            },
            receiving: TransportReceiver {
                key: receiving_key,
                counter: 0,
            },
        }
    }

    pub fn encrypt(&mut self, plaintext: &[u8]) -> Result<Vec<u8>, MeshError> {
        self.sending.encrypt(plaintext)
    }

    pub fn decrypt(&mut self, frame: &RawFrame) -> Result<Vec<u8>, MeshError> {
        self.receiving.decrypt(frame)
    }

    pub fn sending_counter(&self) -> u64 {
        self.sending.counter
    }

    /// Separate the two directions so each can be driven independently
    pub fn split(self) -> (TransportSender, TransportReceiver) {
        (self.sending, self.receiving)
    }
}

impl std::fmt::Debug for TransportState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportState")
            .field("sending_counter", &self.sending.counter)
            .field("receiving_counter", &self.receiving.counter)
            .finish()
    }
}
