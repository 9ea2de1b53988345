//! UDP sockets tied to gateway mappings
//!
//! A [`MappedSocket`] reports the masqueraded external address as its local
//! address and asks the manager to remove its mapping when dropped. The socket
//! only remembers the external port; the manager keeps ownership of the entry.

use crate::types::{MappingError, Result};
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Weak};
use tokio::net::UdpSocket;
use tracing::{debug, warn};

/// Releases a mapping on behalf of a socket that is going away
pub(crate) trait ReleaseMapping: Send + Sync {
    fn release_mapping(self: Arc<Self>, external_port: u16);
}

/// Local UDP port range used for RTP socket pairs
///
/// Hands out ports round-robin, wrapping from `max` back to `base`.
#[derive(Debug, Clone)]
pub struct PortRange {
    base: u16,
    max: u16,
    current: u16,
}

impl PortRange {
    /// Range `[base, max]`; validity is checked when ports are requested
    pub fn new(base: u16, max: u16) -> Self {
        Self {
            base,
            max,
            current: max,
        }
    }

    /// First port of the range
    pub fn base(&self) -> u16 {
        self.base
    }

    /// Last port of the range
    pub fn max(&self) -> u16 {
        self.max
    }

    /// Number of ports in the range (zero when invalid)
    pub fn len(&self) -> usize {
        if self.is_valid() {
            (self.max - self.base) as usize + 1
        } else {
            0
        }
    }

    /// True when the range holds no usable port
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn is_valid(&self) -> bool {
        self.base != 0 && self.base <= self.max
    }

    /// Advance the cursor, wrapping inside the range
    pub fn next_port(&mut self) -> u16 {
        self.current = match self.current.checked_add(1) {
            Some(next) if next >= self.base && next <= self.max => next,
            _ => self.base,
        };
        self.current
    }

    /// Bind a UDP socket on the next free port of the range
    pub fn open_socket(&mut self, binding: IpAddr) -> Result<std::net::UdpSocket> {
        if !self.is_valid() {
            return Err(MappingError::InvalidPortRange {
                base: self.base,
                max: self.max,
            });
        }

        for _ in 0..self.len() {
            let port = self.next_port();
            match std::net::UdpSocket::bind(SocketAddr::new(binding, port)) {
                Ok(socket) => return Ok(socket),
                Err(e) => debug!("UDP port {} unavailable: {}", port, e),
            }
        }

        warn!(
            "Failed to bind to local UDP port in range {}-{}",
            self.base, self.max
        );
        Err(MappingError::Io(io::Error::new(
            io::ErrorKind::AddrInUse,
            format!("no free UDP port in {}-{}", self.base, self.max),
        )))
    }

    /// Bind two sockets on consecutive ports (data, control)
    pub fn open_pair(
        &mut self,
        binding: IpAddr,
    ) -> Result<(std::net::UdpSocket, std::net::UdpSocket)> {
        if !self.is_valid() {
            warn!("Invalid local UDP port range {}-{}", self.base, self.max);
            return Err(MappingError::InvalidPortRange {
                base: self.base,
                max: self.max,
            });
        }

        for _ in 0..self.len() {
            let data = self.open_socket(binding)?;
            let control = self.open_socket(binding)?;
            let data_port = data.local_addr()?.port();
            if control.local_addr()?.port() == data_port.wrapping_add(1) {
                return Ok((data, control));
            }
        }

        Err(MappingError::Io(io::Error::new(
            io::ErrorKind::AddrInUse,
            format!(
                "no consecutive UDP port pair in {}-{}",
                self.base, self.max
            ),
        )))
    }
}

/// UDP socket whose mapping lives as long as the socket
pub struct MappedSocket {
    socket: UdpSocket,
    masquerade: Option<SocketAddr>,
    release: Option<Weak<dyn ReleaseMapping>>,
}

impl MappedSocket {
    pub(crate) fn mapped(
        socket: std::net::UdpSocket,
        external: SocketAddr,
        release: Weak<dyn ReleaseMapping>,
    ) -> io::Result<Self> {
        socket.set_nonblocking(true)?;
        Ok(Self {
            socket: UdpSocket::from_std(socket)?,
            masquerade: Some(external),
            release: Some(release),
        })
    }

    /// Wrap a socket that has no mapping; local address queries are not masqueraded
    pub fn unmapped(socket: UdpSocket) -> Self {
        Self {
            socket,
            masquerade: None,
            release: None,
        }
    }

    /// Address peers should use: the external mapping if any, else the bind address
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        match self.masquerade {
            Some(addr) => Ok(addr),
            None => self.socket.local_addr(),
        }
    }

    /// Address the socket is actually bound to
    pub fn bind_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// External address tag, if mapped
    pub fn masquerade_addr(&self) -> Option<SocketAddr> {
        self.masquerade
    }

    /// Underlying tokio socket
    pub fn socket(&self) -> &UdpSocket {
        &self.socket
    }

    /// Send a datagram to `target`
    pub async fn send_to(&self, buf: &[u8], target: SocketAddr) -> io::Result<usize> {
        self.socket.send_to(buf, target).await
    }

    /// Receive a datagram
    pub async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        self.socket.recv_from(buf).await
    }
}

impl Drop for MappedSocket {
    fn drop(&mut self) {
        let (Some(external), Some(release)) = (self.masquerade, self.release.take()) else {
            return;
        };
        if let Some(manager) = release.upgrade() {
            manager.release_mapping(external.port());
        }
    }
}

impl std::fmt::Debug for MappedSocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MappedSocket")
            .field("bind", &self.socket.local_addr().ok())
            .field("masquerade", &self.masquerade)
            .finish()
    }
}
