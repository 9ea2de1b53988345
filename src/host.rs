//! Owning endpoint contract and local address detection

use crate::types::{MappingError, Result};
use std::net::{IpAddr, UdpSocket};

/// The endpoint that owns the mapping manager
///
/// Typically a VoIP endpoint that re-registers with its signalling peer once
/// its externally visible address is known.
pub trait HostEndpoint: Send + Sync + 'static {
    /// Announce that NAT traversal is available, optionally naming the device
    fn set_available(&self, device_name: Option<&str>);

    /// Push a newly learned public address
    fn set_external_address(&self, addr: IpAddr);

    /// Local port used for the self-test mapping
    fn base_port(&self) -> u16;

    /// Ask the signalling layer to re-register with updated addressing
    fn force_re_registration(&self);
}

/// Get the local IP address used to reach the gateway
///
/// Connects an unbound UDP socket towards a public address; nothing is sent,
/// the kernel only picks the outgoing interface.
pub fn detect_local_ip() -> Result<IpAddr> {
    let socket = UdpSocket::bind("0.0.0.0:0")
        .map_err(|e| MappingError::Internal(format!("Failed to create socket: {}", e)))?;

    socket
        .connect("8.8.8.8:80")
        .map_err(|e| MappingError::Internal(format!("Failed to connect: {}", e)))?;

    let local_addr = socket
        .local_addr()
        .map_err(|e| MappingError::Internal(format!("Failed to get local address: {}", e)))?;

    match local_addr.ip() {
        ip @ IpAddr::V4(_) => Ok(ip),
        IpAddr::V6(_) => Err(MappingError::Internal(
            "UPnP requires IPv4 address".to_string(),
        )),
    }
}
