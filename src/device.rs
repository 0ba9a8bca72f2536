//! Local packet interface
//!
//! The tunnel side of the virtual network device: peers write decrypted
//! packets into it, the router reads outgoing packets from it.

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};

use crate::error::{MeshError, TunnelError};

/// Source and sink of raw IP packets
#[async_trait]
pub trait PacketDevice: Send + Sync {
    /// Read one outgoing packet into `buf`, returning its length
    async fn read_packet(&self, buf: &mut [u8]) -> Result<usize, MeshError>;

    /// Deliver one incoming packet to the local stack
    async fn write_packet(&self, packet: &[u8]) -> Result<(), MeshError>;
}

/// In-memory packet device backed by channels
///
/// Packets pushed into the injector come out of `read_packet`; packets
/// passed to `write_packet` come out of the delivery receiver.
pub struct MemoryDevice {
    outgoing: Mutex<mpsc::Receiver<Vec<u8>>>,
    delivered: mpsc::UnboundedSender<Vec<u8>>,
}

impl MemoryDevice {
    /// Returns (device, injector for outgoing packets, receiver of delivered packets)
    pub fn new(
        capacity: usize,
    ) -> (
        Self,
        mpsc::Sender<Vec<u8>>,
        mpsc::UnboundedReceiver<Vec<u8>>,
    ) {
        let (inject_tx, inject_rx) = mpsc::channel(capacity);
        let (deliver_tx, deliver_rx) = mpsc::unbounded_channel();
        let device = Self {
            outgoing: Mutex::new(inject_rx),
            delivered: deliver_tx,
        };
        (device, inject_tx, deliver_rx)
    }
}

#[async_trait]
impl PacketDevice for MemoryDevice {
    async fn read_packet(&self, buf: &mut [u8]) -> Result<usize, MeshError> {
        let packet = self
            .outgoing
            .lock()
            .await
            .recv()
            .await
            .ok_or_else(|| TunnelError::ReadFailed {
                reason: "device closed".to_string(),
            })?;

        if packet.len() > buf.len() {
            return Err(TunnelError::ReadFailed {
                reason: format!("packet of {} bytes exceeds buffer", packet.len()),
            }
            .into());
        }
        buf[..packet.len()].copy_from_slice(&packet);
        Ok(packet.len())
    }

    async fn write_packet(&self, packet: &[u8]) -> Result<(), MeshError> {
        self.delivered
            .send(packet.to_vec())
            .map_err(|_| TunnelError::WriteFailed {
                reason: "device closed".to_string(),
            })?;
        Ok(())
    }
}
