// Shared fixtures: an in-memory gateway and a host that records callbacks

use crate::gateway::{DeviceId, GatewayClient, GatewayEvents, Subscription};
use crate::host::HostEndpoint;
use crate::types::{IpProtocol, ManagerState, MappingError, PortMapping, Result};
use crate::{ManagerConfig, MappingManager};
use std::collections::{BTreeMap, HashSet};
use std::net::{IpAddr, Ipv4Addr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const LOCAL_IP: IpAddr = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 5));
pub const EXTERNAL_IP: IpAddr = IpAddr::V4(Ipv4Addr::new(203, 0, 113, 10));
pub const HOST_BASE_PORT: u16 = 5000;

#[derive(Default)]
pub struct MockState {
    pub devices: Vec<DeviceId>,
    pub mappings: BTreeMap<(u16, IpProtocol), PortMapping>,
    pub fail_add_ports: HashSet<u16>,
    pub fail_remove: bool,
    pub fail_enumerate: bool,
    pub remove_delay: Option<Duration>,
    pub add_calls: Vec<PortMapping>,
    pub remove_calls: Vec<(u16, IpProtocol)>,
    pub enumerate_calls: usize,
    pub released: bool,
    pub unsubscribed: usize,
    pub events: Option<Arc<dyn GatewayEvents>>,
}

/// Gateway double; clones share state so tests can inspect calls
#[derive(Clone, Default)]
pub struct MockGateway {
    state: Arc<Mutex<MockState>>,
}

impl MockGateway {
    /// Gateway that answers discovery with one device
    pub fn with_device() -> Self {
        let mock = Self::default();
        mock.state().devices = vec![DeviceId("Test IGD".to_string())];
        mock
    }

    pub fn state(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().unwrap()
    }

    /// Insert a mapping as if another agent created it
    pub fn add_foreign(&self, external_port: u16, protocol: IpProtocol) {
        let mut mapping = PortMapping::request(
            protocol,
            external_port,
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, 99)),
            external_port,
            "other-app",
        );
        mapping.external_ip = Some(EXTERNAL_IP);
        self.state().mappings.insert((external_port, protocol), mapping);
    }

    pub fn fire_entry_count_changed(&self) {
        let (events, count) = {
            let state = self.state();
            (state.events.clone(), state.mappings.len() as u32)
        };
        events.expect("not subscribed").on_entry_count_changed(count);
    }

    pub fn fire_external_ip_changed(&self, addr: IpAddr) {
        let events = self.state().events.clone();
        events.expect("not subscribed").on_external_ip_changed(addr);
    }

    pub fn add_ports(&self) -> Vec<u16> {
        self.state().add_calls.iter().map(|m| m.external_port).collect()
    }

    pub fn removed_ports(&self) -> Vec<u16> {
        self.state().remove_calls.iter().map(|(port, _)| *port).collect()
    }
}

impl GatewayClient for MockGateway {
    fn discover(&self, _device_type: &str) -> Result<Vec<DeviceId>> {
        Ok(self.state().devices.clone())
    }

    fn add_mapping(&self, mapping: &PortMapping) -> Result<IpAddr> {
        let mut state = self.state();
        state.add_calls.push(mapping.clone());
        if state.fail_add_ports.contains(&mapping.external_port) {
            return Err(MappingError::GatewayError("ConflictInMappingEntry".to_string()));
        }
        let mut stored = mapping.clone();
        stored.external_ip = Some(EXTERNAL_IP);
        state
            .mappings
            .insert((mapping.external_port, mapping.protocol), stored);
        Ok(EXTERNAL_IP)
    }

    fn remove_mapping(&self, external_port: u16, protocol: IpProtocol) -> Result<()> {
        let delay = {
            let mut state = self.state();
            state.remove_calls.push((external_port, protocol));
            state.remove_delay
        };
        if let Some(delay) = delay {
            std::thread::sleep(delay);
        }

        let mut state = self.state();
        if state.fail_remove {
            return Err(MappingError::GatewayError("gateway unreachable".to_string()));
        }
        state.mappings.remove(&(external_port, protocol));
        Ok(())
    }

    fn enumerate_mappings(&self) -> Result<Box<dyn Iterator<Item = PortMapping> + '_>> {
        let mut state = self.state();
        state.enumerate_calls += 1;
        if state.fail_enumerate {
            return Err(MappingError::GatewayError("enumeration failed".to_string()));
        }
        let snapshot: Vec<PortMapping> = state.mappings.values().cloned().collect();
        Ok(Box::new(snapshot.into_iter()))
    }

    fn subscribe(&self, events: Arc<dyn GatewayEvents>) -> Result<Subscription> {
        self.state().events = Some(events);
        let state = self.state.clone();
        Ok(Subscription::new(move || {
            let mut state = state.lock().unwrap();
            state.unsubscribed += 1;
            state.events = None;
        }))
    }

    fn release(&self) {
        self.state().released = true;
    }
}

#[derive(Default)]
pub struct RecordingHost {
    pub available: Mutex<Vec<Option<String>>>,
    pub external: Mutex<Vec<IpAddr>>,
    pub re_registrations: AtomicUsize,
}

impl RecordingHost {
    pub fn re_registrations(&self) -> usize {
        self.re_registrations.load(Ordering::SeqCst)
    }
}

impl HostEndpoint for RecordingHost {
    fn set_available(&self, device_name: Option<&str>) {
        self.available
            .lock()
            .unwrap()
            .push(device_name.map(str::to_string));
    }

    fn set_external_address(&self, addr: IpAddr) {
        self.external.lock().unwrap().push(addr);
    }

    fn base_port(&self) -> u16 {
        HOST_BASE_PORT
    }

    fn force_re_registration(&self) {
        self.re_registrations.fetch_add(1, Ordering::SeqCst);
    }
}

pub fn test_config() -> ManagerConfig {
    ManagerConfig {
        local_address: Some(LOCAL_IP),
        ..ManagerConfig::default()
    }
}

pub fn new_manager(
    mock: &MockGateway,
    config: ManagerConfig,
) -> (MappingManager<MockGateway>, Arc<RecordingHost>) {
    let host = Arc::new(RecordingHost::default());
    let manager = MappingManager::new(mock.clone(), host.clone(), config);
    (manager, host)
}

pub async fn wait_for_state(manager: &MappingManager<MockGateway>, state: ManagerState) {
    let mut rx = manager.subscribe_state();
    tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|s| *s == state))
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {:?}", state))
        .expect("state channel closed");
}

/// Poll `condition` until it holds or two seconds pass
pub async fn eventually<F: Fn() -> bool>(condition: F) -> bool {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
