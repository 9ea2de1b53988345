//! upnp-nat - UPnP port mapping for paired media channels
//!
//! This library lets a host behind a NAT gateway obtain reachable public UDP
//! endpoints by discovering an Internet Gateway Device and programming
//! temporary port mappings on it:
//! - `manager` - discovery, self-test, create/remove, reconciliation, shutdown
//! - `allocator` / `table` - conflict-free external port allocation
//! - `igd` - gateway client backed by `igd-next`
//! - `socket` - UDP socket pairs whose mappings follow the socket lifetime

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod allocator;
pub mod config;
pub mod events;
pub mod gateway;
pub mod host;
pub mod igd;
pub mod manager;
pub mod socket;
pub mod table;
pub mod types;

// Re-export commonly used types
pub use config::{ManagerConfig, PairPolicy};
pub use events::EventBridge;
pub use gateway::{DeviceId, GatewayClient, GatewayEvents, Subscription, IGD_DEVICE_TYPE};
pub use host::HostEndpoint;
pub use igd::IgdGateway;
pub use manager::MappingManager;
pub use socket::{MappedSocket, PortRange};
pub use table::MappingTable;
pub use types::{IpProtocol, ManagerState, MappingError, PortMapping, Result, RtpSupport};

/// Initialize logging for binaries and demos
///
/// Honors `RUST_LOG`, defaulting to `info`.
pub fn init() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

#[cfg(test)]
mod tests;
