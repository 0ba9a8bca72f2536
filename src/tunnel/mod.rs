//! TUN device
//!
//! The OS-facing [`PacketDevice`]: the router reads packets the local
//! stack sends into the overlay, peers write packets arriving from it.

use std::ops::Deref;

use async_trait::async_trait;
use ipnet::Ipv4Net;
use tun_rs::{AsyncDevice, DeviceBuilder};

use crate::device::PacketDevice;
use crate::error::{MeshError, TunnelError};

/// Async TUN device wrapper
pub struct TunDevice {
    device: AsyncDevice,
    /// Device name (e.g., "utun5", "tun0")
    name: String,
}

impl TunDevice {
    /// Create a TUN device holding our private IP on the overlay network
    pub async fn create(address: Ipv4Net, mtu: u16) -> Result<Self, MeshError> {
        check_privileges()?;

        let device = DeviceBuilder::new()
            .ipv4(address.addr(), address.prefix_len(), None)
            .mtu(mtu)
            .build_async()
            .map_err(|e| TunnelError::CreateFailed {
                reason: e.to_string(),
            })?;

        let name = device.deref().name().map_err(|e| TunnelError::CreateFailed {
            reason: format!("Failed to get device name: {}", e),
        })?;

        tracing::info!("Created TUN device: {} with address {}", name, address);

        Ok(Self { device, name })
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

#[async_trait]
impl PacketDevice for TunDevice {
    async fn read_packet(&self, buf: &mut [u8]) -> Result<usize, MeshError> {
        self.device.recv(buf).await.map_err(|e| {
            TunnelError::ReadFailed {
                reason: e.to_string(),
            }
            .into()
        })
    }

    async fn write_packet(&self, packet: &[u8]) -> Result<(), MeshError> {
        self.device
            .send(packet)
            .await
            .map_err(|e| TunnelError::WriteFailed {
                reason: e.to_string(),
            })?;
        Ok(())
    }
}

/// Check for the privileges needed to create TUN devices
fn check_privileges() -> Result<(), MeshError> {
    #[cfg(unix)]
    {
        if unsafe { libc::geteuid() } != 0 {
            #[cfg(target_os = "linux")]
            {
                // Creation still succeeds with CAP_NET_ADMIN
                tracing::warn!("Running without root. TUN creation may fail.");
                tracing::warn!("Either run with sudo or grant CAP_NET_ADMIN:");
                tracing::warn!("  sudo setcap cap_net_admin=eip ./meshlink");
            }

            #[cfg(target_os = "macos")]
            {
                return Err(TunnelError::InsufficientPrivileges {
                    message: "Root privileges required on macOS. Run with sudo.".to_string(),
                }
                .into());
            }
        }
    }

    Ok(())
}
