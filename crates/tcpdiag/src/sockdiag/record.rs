//! The connection record handed to sinks.

use std::fmt;
use std::net::{IpAddr, SocketAddr};

use serde::{Deserialize, Serialize};

use super::types::{AddressFamily, TcpState};

/// One TCP socket as reported by the kernel.
///
/// Ports are in host byte order. Addresses keep their network-order octets
/// inside [`IpAddr`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConnectionRecord {
    /// Socket owner UID.
    pub uid: u32,
    /// Inode number.
    pub inode: u32,
    /// Address family of the socket.
    pub family: AddressFamily,
    /// Local address.
    pub local: IpAddr,
    /// Remote address.
    pub remote: IpAddr,
    /// Local port.
    pub local_port: u16,
    /// Remote port.
    pub remote_port: u16,
    /// Socket state.
    pub state: TcpState,
}

impl ConnectionRecord {
    /// Local address and port.
    pub fn local_addr(&self) -> SocketAddr {
        SocketAddr::new(self.local, self.local_port)
    }

    /// Remote address and port.
    pub fn remote_addr(&self) -> SocketAddr {
        SocketAddr::new(self.remote, self.remote_port)
    }

    /// Local address as an integer whose big-endian bytes are the wire bytes.
    pub fn local_address_bits(&self) -> u128 {
        address_bits(self.local)
    }

    /// Remote address as an integer whose big-endian bytes are the wire bytes.
    pub fn remote_address_bits(&self) -> u128 {
        address_bits(self.remote)
    }

    /// Local IPv4 address as a host-order `u32`; `None` for IPv6.
    pub fn local_ipv4_bits(&self) -> Option<u32> {
        ipv4_bits(self.local)
    }

    /// Remote IPv4 address as a host-order `u32`; `None` for IPv6.
    pub fn remote_ipv4_bits(&self) -> Option<u32> {
        ipv4_bits(self.remote)
    }

    /// Check if this is a listening socket.
    pub fn is_listening(&self) -> bool {
        self.state == TcpState::Listen
    }

    /// Check if this is a connected socket.
    pub fn is_established(&self) -> bool {
        self.state == TcpState::Established
    }
}

fn address_bits(addr: IpAddr) -> u128 {
    match addr {
        IpAddr::V4(v4) => u32::from(v4) as u128,
        IpAddr::V6(v6) => u128::from(v6),
    }
}

fn ipv4_bits(addr: IpAddr) -> Option<u32> {
    match addr {
        IpAddr::V4(v4) => Some(u32::from(v4)),
        IpAddr::V6(_) => None,
    }
}

impl fmt::Display for ConnectionRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.local_addr(), self.remote_addr())
    }
}
