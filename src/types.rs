//! Common types for the mapping manager

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;
use thiserror::Error;

/// A forwarding rule on the gateway
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PortMapping {
    /// External IP reported by the gateway (`None` until confirmed)
    pub external_ip: Option<IpAddr>,
    /// External port on the gateway, unique key within a table
    pub external_port: u16,
    /// Port on the internal client the rule forwards to
    pub internal_port: u16,
    /// Transport protocol of the rule
    pub protocol: IpProtocol,
    /// Address of the local host the rule forwards to
    pub internal_client: IpAddr,
    /// Whether the rule is active
    pub enabled: bool,
    /// Opaque tag identifying the owning application
    pub description: String,
}

impl PortMapping {
    /// Build an enabled mapping request that has not been confirmed yet
    pub fn request(
        protocol: IpProtocol,
        external_port: u16,
        internal_client: IpAddr,
        internal_port: u16,
        description: impl Into<String>,
    ) -> Self {
        Self {
            external_ip: None,
            external_port,
            internal_port,
            protocol,
            internal_client,
            enabled: true,
            description: description.into(),
        }
    }
}

/// IP protocol numbers
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum IpProtocol {
    /// TCP protocol
    TCP = 6,
    /// UDP protocol
    UDP = 17,
}

impl fmt::Display for IpProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IpProtocol::TCP => f.write_str("TCP"),
            IpProtocol::UDP => f.write_str("UDP"),
        }
    }
}

/// Lifecycle of the manager's background worker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManagerState {
    /// Subscribing to gateway notifications
    Init,
    /// Searching for an Internet Gateway Device
    Discovering,
    /// Running the exploratory create+remove cycle
    SelfTesting,
    /// Capability available, reconciliation loop active
    Running,
    /// Draining mappings and releasing the gateway
    ShuttingDown,
    /// Terminal state
    Stopped,
}

/// Whether RTP media can be carried through the gateway
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RtpSupport {
    /// Mappings can be created for media channels
    Supported,
    /// No usable gateway
    Unsupported,
}

/// Errors that can occur during port mapping
#[derive(Debug, Error)]
pub enum MappingError {
    /// No gateway found on network
    #[error("No gateway found")]
    NoGateway,

    /// Gateway was found but rejected the exploratory mapping
    #[error("Port mapping self-test failed")]
    SelfTestFailed,

    /// Gateway returned an error
    #[error("Gateway error: {0}")]
    GatewayError(String),

    /// Only some legs of a paired mapping could be created
    #[error("Paired mapping incomplete: {created} of 2 legs created")]
    PartialPair {
        /// Number of legs the gateway accepted
        created: usize,
    },

    /// Port space exhausted above the base port
    #[error("No free external port above {0}")]
    NoFreePort(u16),

    /// Local UDP port range is unusable
    #[error("Invalid local UDP port range {base}-{max}")]
    InvalidPortRange {
        /// First port of the range
        base: u16,
        /// Last port of the range
        max: u16,
    },

    /// Manager has released its gateway session
    #[error("Mapping manager is closed")]
    Closed,

    /// Configuration could not be loaded or is inconsistent
    #[error("Config error: {0}")]
    Config(String),

    /// IO error during communication
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias for mapping operations
pub type Result<T> = std::result::Result<T, MappingError>;
