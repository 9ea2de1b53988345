//! Gateway control-plane abstraction
//!
//! [`GatewayClient`] is the seam between the mapping manager and the protocol
//! that actually talks to the gateway device. Calls are blocking; the manager
//! runs them on tokio's blocking pool while holding its table lock.

use crate::types::{IpProtocol, PortMapping, Result};
use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;

/// UPnP device type searched for during discovery
pub const IGD_DEVICE_TYPE: &str = "urn:schemas-upnp-org:device:InternetGatewayDevice:1";

/// Identifier of a discovered gateway device
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeviceId(pub String);

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Receiver of asynchronous gateway notifications
///
/// Implementations are invoked from whatever thread the gateway client uses
/// for eventing and must not block.
pub trait GatewayEvents: Send + Sync {
    /// The gateway's public address changed
    fn on_external_ip_changed(&self, addr: IpAddr);

    /// The number of port mapping entries on the gateway changed
    fn on_entry_count_changed(&self, count: u32);
}

/// Handle for an active notification subscription
///
/// Released exactly once: either by [`Subscription::unsubscribe`] or on drop.
pub struct Subscription {
    release: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    /// Wrap a release action
    pub fn new<F>(release: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self {
            release: Some(Box::new(release)),
        }
    }

    /// A subscription with nothing to release
    pub fn noop() -> Self {
        Self { release: None }
    }

    /// Stop receiving notifications
    pub fn unsubscribe(mut self) {
        self.release_once();
    }

    fn release_once(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.release_once();
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.release.is_some())
            .finish()
    }
}

/// Control-plane operations on a gateway device
pub trait GatewayClient: Send + Sync + 'static {
    /// Find devices of `device_type`; an empty list means none answered
    fn discover(&self, device_type: &str) -> Result<Vec<DeviceId>>;

    /// Create `mapping` on the gateway and return the external IP it reports
    fn add_mapping(&self, mapping: &PortMapping) -> Result<IpAddr>;

    /// Delete the mapping on `external_port`
    fn remove_mapping(&self, external_port: u16, protocol: IpProtocol) -> Result<()>;

    /// Lazily walk every mapping currently on the gateway
    ///
    /// Each call starts a fresh walk.
    fn enumerate_mappings(&self) -> Result<Box<dyn Iterator<Item = PortMapping> + '_>>;

    /// Register for external IP and entry count notifications
    fn subscribe(&self, events: Arc<dyn GatewayEvents>) -> Result<Subscription>;

    /// Drop any session state held for the discovered device
    fn release(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_subscription_released_once_on_unsubscribe() {
        let count = Arc::new(AtomicUsize::new(0));
        let counter = count.clone();
        let sub = Subscription::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        sub.unsubscribe();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_subscription_released_on_drop() {
        let count = Arc::new(AtomicUsize::new(0));
        let counter = count.clone();
        {
            let _sub = Subscription::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
