//! UPnP IGD (Internet Gateway Device) client built on `igd-next`
//!
//! Uses SSDP to discover the IGD on the local network and SOAP to manage its
//! static port mapping table. `igd-next` does not expose GENA eventing, so
//! notifications are produced by a small thread that polls the external
//! address and the number of mapping entries and reports changes.

use crate::config::ManagerConfig;
use crate::gateway::{DeviceId, GatewayClient, GatewayEvents, Subscription};
use crate::types::{IpProtocol, MappingError, PortMapping, Result};
use igd_next::{Gateway, PortMappingProtocol, SearchOptions};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Lease duration for created mappings (0 = until removed or reboot)
const LEASE_DURATION_SECS: u32 = 0;

/// [`GatewayClient`] talking to a real router through `igd-next`
#[derive(Debug, Clone)]
pub struct IgdGateway {
    search_timeout: Duration,
    poll_interval: Duration,
    gateway: Arc<Mutex<Option<Gateway>>>,
}

impl IgdGateway {
    /// Create a client with explicit timeouts
    pub fn new(search_timeout: Duration, poll_interval: Duration) -> Self {
        Self {
            search_timeout,
            poll_interval,
            gateway: Arc::new(Mutex::new(None)),
        }
    }

    /// Create a client using the timeouts from `config`
    pub fn from_config(config: &ManagerConfig) -> Self {
        Self::new(config.search_timeout(), config.event_poll_interval())
    }

    fn current(&self) -> Result<Gateway> {
        current_gateway(&self.gateway).ok_or(MappingError::NoGateway)
    }
}

fn current_gateway(slot: &Mutex<Option<Gateway>>) -> Option<Gateway> {
    slot.lock().unwrap_or_else(|e| e.into_inner()).clone()
}

fn to_igd_protocol(protocol: IpProtocol) -> PortMappingProtocol {
    match protocol {
        IpProtocol::TCP => PortMappingProtocol::TCP,
        IpProtocol::UDP => PortMappingProtocol::UDP,
    }
}

fn from_igd_protocol(protocol: PortMappingProtocol) -> IpProtocol {
    match protocol {
        PortMappingProtocol::TCP => IpProtocol::TCP,
        PortMappingProtocol::UDP => IpProtocol::UDP,
    }
}

/// Reject external addresses that cannot be reached from outside
fn usable_external_ip(ip: IpAddr) -> bool {
    !ip.is_unspecified() && !ip.is_loopback()
}

impl GatewayClient for IgdGateway {
    fn discover(&self, device_type: &str) -> Result<Vec<DeviceId>> {
        debug!("Searching for UPnP IGD gateway ({})...", device_type);
        let gateway = match igd_next::search_gateway(SearchOptions {
            timeout: Some(self.search_timeout),
            ..Default::default()
        }) {
            Ok(gateway) => gateway,
            Err(e) => {
                debug!("UPnP gateway search failed: {}", e);
                return Ok(Vec::new());
            }
        };

        let device = DeviceId(format!("http://{}{}", gateway.addr, gateway.root_url));
        info!("Found UPnP gateway {}", device);
        *self.gateway.lock().unwrap_or_else(|e| e.into_inner()) = Some(gateway);

        Ok(vec![device])
    }

    fn add_mapping(&self, mapping: &PortMapping) -> Result<IpAddr> {
        let gateway = self.current()?;
        let protocol = to_igd_protocol(mapping.protocol);
        let local_addr = SocketAddr::new(mapping.internal_client, mapping.internal_port);

        debug!(
            "Adding port mapping: {} {} -> {}",
            mapping.protocol, mapping.external_port, local_addr
        );

        gateway
            .add_port(
                protocol,
                mapping.external_port,
                local_addr,
                LEASE_DURATION_SECS,
                &mapping.description,
            )
            .map_err(|e| {
                MappingError::GatewayError(format!("AddPortMapping failed: {}", e))
            })?;

        let external_ip = match gateway.get_external_ip() {
            Ok(ip) if usable_external_ip(ip) => ip,
            Ok(ip) => {
                let _ = gateway.remove_port(protocol, mapping.external_port);
                return Err(MappingError::GatewayError(format!(
                    "Gateway reported unusable external address {}",
                    ip
                )));
            }
            Err(e) => {
                // Clean up the mapping if we can't get external IP
                let _ = gateway.remove_port(protocol, mapping.external_port);
                return Err(MappingError::GatewayError(format!(
                    "GetExternalIPAddress failed: {}",
                    e
                )));
            }
        };

        Ok(external_ip)
    }

    fn remove_mapping(&self, external_port: u16, protocol: IpProtocol) -> Result<()> {
        self.current()?
            .remove_port(to_igd_protocol(protocol), external_port)
            .map_err(|e| MappingError::GatewayError(format!("DeletePortMapping failed: {}", e)))
    }

    fn enumerate_mappings(&self) -> Result<Box<dyn Iterator<Item = PortMapping> + '_>> {
        Ok(Box::new(EntryIter::new(self.current()?)))
    }

    fn subscribe(&self, events: Arc<dyn GatewayEvents>) -> Result<Subscription> {
        let (stop_tx, stop_rx) = mpsc::channel::<()>();
        let slot = self.gateway.clone();
        let interval = self.poll_interval;

        std::thread::Builder::new()
            .name("upnp-events".to_string())
            .spawn(move || poll_events(slot, interval, events, stop_rx))?;

        Ok(Subscription::new(move || drop(stop_tx)))
    }

    fn release(&self) {
        if self.gateway.lock().unwrap_or_else(|e| e.into_inner()).take().is_some() {
            debug!("UPnP gateway session released");
        }
    }
}

/// Walks `GetGenericPortMappingEntry` from index 0 until the gateway refuses
struct EntryIter {
    gateway: Gateway,
    index: u32,
    done: bool,
}

impl EntryIter {
    fn new(gateway: Gateway) -> Self {
        Self {
            gateway,
            index: 0,
            done: false,
        }
    }
}

impl Iterator for EntryIter {
    type Item = PortMapping;

    fn next(&mut self) -> Option<PortMapping> {
        if self.done {
            return None;
        }

        match self.gateway.get_generic_port_mapping_entry(self.index) {
            Ok(entry) => {
                self.index += 1;
                let internal_client = entry.internal_client.parse().unwrap_or_else(|_| {
                    debug!(
                        "Unparseable internal client {:?} on port {}",
                        entry.internal_client, entry.external_port
                    );
                    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
                });
                Some(PortMapping {
                    external_ip: None,
                    external_port: entry.external_port,
                    internal_port: entry.internal_port,
                    protocol: from_igd_protocol(entry.protocol),
                    internal_client,
                    enabled: entry.enabled,
                    description: entry.port_mapping_description,
                })
            }
            Err(e) => {
                // Index past the end is how the list terminates
                debug!("Mapping enumeration stopped at index {}: {}", self.index, e);
                self.done = true;
                None
            }
        }
    }
}

/// Poll the gateway and report external IP / entry count changes
fn poll_events(
    slot: Arc<Mutex<Option<Gateway>>>,
    interval: Duration,
    events: Arc<dyn GatewayEvents>,
    stop: mpsc::Receiver<()>,
) {
    let mut last_ip: Option<IpAddr> = None;
    let mut last_count: Option<u32> = None;

    loop {
        if let Some(gateway) = current_gateway(&slot) {
            match gateway.get_external_ip() {
                Ok(ip) if last_ip != Some(ip) => {
                    last_ip = Some(ip);
                    events.on_external_ip_changed(ip);
                }
                Ok(_) => {}
                Err(e) => warn!("UPnP: external IP poll failed: {}", e),
            }

            let count = EntryIter::new(gateway).count() as u32;
            if last_count != Some(count) {
                last_count = Some(count);
                events.on_entry_count_changed(count);
            }
        }

        match stop.recv_timeout(interval) {
            Err(RecvTimeoutError::Timeout) => continue,
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    debug!("UPnP event polling stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_conversion() {
        assert_eq!(
            from_igd_protocol(to_igd_protocol(IpProtocol::UDP)),
            IpProtocol::UDP
        );
        assert_eq!(
            from_igd_protocol(to_igd_protocol(IpProtocol::TCP)),
            IpProtocol::TCP
        );
    }

    #[test]
    fn test_usable_external_ip() {
        assert!(usable_external_ip("203.0.113.7".parse().unwrap()));
        assert!(!usable_external_ip("0.0.0.0".parse().unwrap()));
        assert!(!usable_external_ip("127.0.0.1".parse().unwrap()));
    }

    #[test]
    fn test_operations_without_gateway_fail() {
        let client = IgdGateway::new(Duration::from_millis(10), Duration::from_secs(1));
        let mapping = PortMapping::request(
            IpProtocol::UDP,
            55001,
            "192.168.1.20".parse().unwrap(),
            5000,
            "test",
        );

        assert!(matches!(client.add_mapping(&mapping), Err(MappingError::NoGateway)));
        assert!(matches!(
            client.remove_mapping(55001, IpProtocol::UDP),
            Err(MappingError::NoGateway)
        ));
        assert!(client.enumerate_mappings().is_err());
    }

    struct Silent;

    impl GatewayEvents for Silent {
        fn on_external_ip_changed(&self, _addr: IpAddr) {}
        fn on_entry_count_changed(&self, _count: u32) {}
    }

    #[test]
    fn test_event_poller_stops_when_sender_dropped() {
        let (stop_tx, stop_rx) = mpsc::channel::<()>();
        let slot = Arc::new(Mutex::new(None));
        let events: Arc<dyn GatewayEvents> = Arc::new(Silent);
        let poller = std::thread::spawn(move || {
            poll_events(slot, Duration::from_secs(60), events, stop_rx)
        });

        drop(stop_tx);
        poller.join().unwrap();
    }

    #[test]
    fn test_unsubscribe_without_gateway() {
        let client = IgdGateway::new(Duration::from_millis(10), Duration::from_millis(10));
        let subscription = client.subscribe(Arc::new(Silent)).unwrap();
        subscription.unsubscribe();
        client.release();
    }
}
