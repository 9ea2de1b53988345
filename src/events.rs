//! Bridge from gateway notifications to manager signals

use crate::gateway::GatewayEvents;
use crate::host::HostEndpoint;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use tokio::sync::Notify;
use tracing::{debug, info};

/// Flags and wake condition shared by the manager, its worker and the bridge
#[derive(Debug, Default)]
pub(crate) struct Signals {
    mirror_stale: AtomicBool,
    shutdown: AtomicBool,
    wake: Notify,
    external_ip: RwLock<Option<IpAddr>>,
}

impl Signals {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Flag the mirror for refresh and wake the loop
    pub(crate) fn mark_mirror_stale(&self) {
        self.mirror_stale.store(true, Ordering::SeqCst);
        self.wake.notify_one();
    }

    /// Flag the mirror for refresh on the next regular wake
    pub(crate) fn defer_mirror_refresh(&self) {
        self.mirror_stale.store(true, Ordering::SeqCst);
    }

    pub(crate) fn is_mirror_stale(&self) -> bool {
        self.mirror_stale.load(Ordering::SeqCst)
    }

    pub(crate) fn clear_mirror_stale(&self) {
        self.mirror_stale.store(false, Ordering::SeqCst);
    }

    /// Set the shutdown flag and wake the loop
    pub(crate) fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.wake.notify_one();
    }

    pub(crate) fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    pub(crate) fn wake(&self) -> &Notify {
        &self.wake
    }

    pub(crate) fn external_ip(&self) -> Option<IpAddr> {
        *self.external_ip.read().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn set_external_ip(&self, addr: IpAddr) {
        *self.external_ip.write().unwrap_or_else(|e| e.into_inner()) = Some(addr);
    }
}

/// Receives gateway notifications on behalf of a mapping manager
///
/// External IP changes are applied immediately; entry count changes only mark
/// the mirror stale so the reconciliation loop refreshes it under the table
/// lock.
pub struct EventBridge {
    signals: Arc<Signals>,
    host: Arc<dyn HostEndpoint>,
}

impl EventBridge {
    pub(crate) fn new(signals: Arc<Signals>, host: Arc<dyn HostEndpoint>) -> Self {
        Self { signals, host }
    }
}

impl GatewayEvents for EventBridge {
    fn on_external_ip_changed(&self, addr: IpAddr) {
        info!("UPnP: detected external IP address {}", addr);
        self.signals.set_external_ip(addr);
        self.host.set_external_address(addr);
    }

    fn on_entry_count_changed(&self, count: u32) {
        debug!("UPnP: gateway now reports {} mapping entries", count);
        self.signals.mark_mirror_stale();
    }
}
