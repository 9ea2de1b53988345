//! UPnP mapping manager
//!
//! [`MappingManager`] owns the mapping tables and a background worker that:
//! - subscribes to gateway notifications
//! - discovers an Internet Gateway Device (once per lifetime)
//! - runs a paired create+remove self-test before announcing availability
//! - refreshes the mirror table whenever the gateway reports a change
//! - removes every mapping it created on shutdown
//!
//! All table access and every gateway call go through one async mutex, so at
//! most one gateway operation is in flight per manager.

use crate::allocator::next_free_port;
use crate::config::{ManagerConfig, PairPolicy};
use crate::events::{EventBridge, Signals};
use crate::gateway::{DeviceId, GatewayClient, GatewayEvents, Subscription};
use crate::host::{HostEndpoint, detect_local_ip};
use crate::socket::{MappedSocket, PortRange, ReleaseMapping};
use crate::table::MappingTable;
use crate::types::{IpProtocol, ManagerState, MappingError, PortMapping, Result, RtpSupport};
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// UPnP port mapping manager with background reconciliation
///
/// # Example
///
/// ```no_run
/// use std::sync::Arc;
/// use upnp_nat::{HostEndpoint, IgdGateway, IpProtocol, ManagerConfig, MappingManager};
///
/// # async fn example(host: Arc<dyn HostEndpoint>) -> Result<(), Box<dyn std::error::Error>> {
/// let config = ManagerConfig::default();
/// let manager = MappingManager::new(IgdGateway::from_config(&config), host, config);
/// manager.start().await;
///
/// let external = manager
///     .create_map(true, IpProtocol::UDP, "192.168.1.20".parse()?, 5000)
///     .await?;
/// println!("RTP reachable at {}, RTCP at port {}", external, external.port() + 1);
///
/// manager.remove_map(external.port()).await?;
/// manager.remove_map(external.port() + 1).await?;
/// manager.shutdown().await;
/// # Ok(())
/// # }
/// ```
pub struct MappingManager<G: GatewayClient> {
    inner: Arc<Inner<G>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

pub(crate) struct Inner<G: GatewayClient> {
    gateway: Arc<G>,
    host: Arc<dyn HostEndpoint>,
    config: ManagerConfig,
    table: Mutex<MappingTable>,
    signals: Arc<Signals>,
    available: AtomicBool,
    closed: AtomicBool,
    state: watch::Sender<ManagerState>,
    ports: std::sync::Mutex<PortRange>,
}

impl<G: GatewayClient> MappingManager<G> {
    /// Create a manager; nothing talks to the gateway until [`start`](Self::start)
    pub fn new(gateway: G, host: Arc<dyn HostEndpoint>, config: ManagerConfig) -> Self {
        let (state, _) = watch::channel(ManagerState::Init);
        let ports = PortRange::new(config.rtp_port_base, config.rtp_port_max);

        Self {
            inner: Arc::new(Inner {
                gateway: Arc::new(gateway),
                host,
                config,
                table: Mutex::new(MappingTable::new()),
                signals: Arc::new(Signals::new()),
                available: AtomicBool::new(false),
                closed: AtomicBool::new(false),
                state,
                ports: std::sync::Mutex::new(ports),
            }),
            worker: Mutex::new(None),
        }
    }

    /// Spawn the background worker
    ///
    /// Calling this more than once has no effect.
    pub async fn start(&self) {
        let mut worker = self.worker.lock().await;
        if worker.is_some() || self.inner.closed.load(Ordering::SeqCst) {
            return;
        }

        info!(
            "Starting UPnP mapping manager (base port {})",
            self.inner.config.external_base_port
        );
        let inner = self.inner.clone();
        *worker = Some(tokio::spawn(async move { inner.run().await }));
    }

    /// Stop the worker, removing every mapping this manager created
    ///
    /// Waits at most `shutdown_timeout_ms` for the drain; after that the worker
    /// is aborted and remaining state is released regardless.
    pub async fn shutdown(&self) {
        info!("Shutting down UPnP mapping manager");
        self.inner.signals.request_shutdown();

        let timeout = self.inner.config.shutdown_timeout();
        let task = self.worker.lock().await.take();
        match task {
            Some(mut task) => {
                match tokio::time::timeout(timeout, &mut task).await {
                    Ok(Ok(())) => debug!("UPnP worker stopped"),
                    Ok(Err(e)) => {
                        error!("UPnP worker failed: {}", e);
                        self.inner.force_close().await;
                    }
                    Err(_) => {
                        warn!("UPnP worker did not drain within {:?}, aborting", timeout);
                        task.abort();
                        self.inner.force_close().await;
                    }
                }
            }
            None => {
                // Never started: drain inline under the same bound
                if tokio::time::timeout(timeout, self.inner.close(None))
                    .await
                    .is_err()
                {
                    warn!("UPnP drain did not finish within {:?}", timeout);
                }
                self.inner.force_close().await;
            }
        }
    }

    /// Create a mapping (or contiguous pair) towards `local_addr:local_port`
    ///
    /// Returns the external address of the first leg the gateway accepted. For
    /// a complete pair the second leg is on the next external port.
    pub async fn create_map(
        &self,
        pair: bool,
        protocol: IpProtocol,
        local_addr: IpAddr,
        local_port: u16,
    ) -> Result<SocketAddr> {
        self.inner
            .create_map(pair, protocol, local_addr, local_port)
            .await
    }

    /// Remove a mapping this manager created
    ///
    /// Ports that are not ours (or already removed) succeed without touching
    /// the gateway. The local entry is dropped even if the gateway call fails.
    pub async fn remove_map(&self, external_port: u16) -> Result<()> {
        self.inner.remove_map(external_port).await
    }

    /// Replace the mirror with the UDP mappings the gateway currently reports
    pub async fn refresh_mirror(&self) -> Result<usize> {
        self.inner.refresh_mirror().await
    }

    /// Search for gateway devices of the configured type
    pub async fn discover(&self) -> Result<Vec<DeviceId>> {
        self.inner.discover().await
    }

    /// Run the exploratory paired create+remove cycle
    pub async fn self_test(&self) -> bool {
        self.inner.self_test().await
    }

    /// Bind two UDP sockets on consecutive local ports and map them as a pair
    ///
    /// The returned sockets report their external address from
    /// [`MappedSocket::local_addr`] and remove their mapping when dropped.
    pub async fn create_socket_pair(&self, binding: IpAddr) -> Result<(MappedSocket, MappedSocket)> {
        let (data, control) = {
            let mut ports = self
                .inner
                .ports
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            ports.open_pair(binding)?
        };

        let local_port = data.local_addr()?.port();
        let internal = if binding.is_unspecified() {
            self.inner.local_address()?
        } else {
            binding
        };

        let legs = match self
            .inner
            .create_legs(true, IpProtocol::UDP, internal, local_port)
            .await
        {
            Ok(legs) if legs.len() == 2 => legs,
            Ok(legs) => {
                // Both sockets need their own mapping
                warn!("UPnP: only one leg of the socket pair was mapped, aborting");
                self.inner.release_legs(&legs).await;
                return Err(MappingError::PartialPair {
                    created: legs.len(),
                });
            }
            Err(e) => {
                warn!("UPnP: error mapping ports, aborting socket pair: {}", e);
                return Err(e);
            }
        };

        let data_external = external_addr(&legs[0])?;
        let control_external = external_addr(&legs[1])?;
        info!(
            "UPnP: UDP mapped ports {} {}-{} to {} {}-{}",
            internal,
            local_port,
            local_port + 1,
            data_external.ip(),
            data_external.port(),
            control_external.port()
        );

        let inner: Arc<dyn ReleaseMapping> = self.inner.clone();
        let release = Arc::downgrade(&inner);
        let sockets = MappedSocket::mapped(data, data_external, release.clone()).and_then(
            |data| Ok((data, MappedSocket::mapped(control, control_external, release)?)),
        );
        match sockets {
            Ok(pair) => Ok(pair),
            Err(e) => {
                self.inner.release_legs(&legs).await;
                Err(e.into())
            }
        }
    }

    /// Whether the self-test passed and the manager is not shut down
    pub fn is_available(&self) -> bool {
        self.inner.available.load(Ordering::SeqCst)
    }

    /// Public address learned from the gateway, once available
    pub fn external_address(&self) -> Option<IpAddr> {
        if self.is_available() {
            self.inner.signals.external_ip()
        } else {
            None
        }
    }

    /// Whether media can be routed through the gateway
    pub fn rtp_support(&self) -> RtpSupport {
        if self.is_available() {
            RtpSupport::Supported
        } else {
            RtpSupport::Unsupported
        }
    }

    /// Current worker state
    pub fn state(&self) -> ManagerState {
        *self.inner.state.borrow()
    }

    /// Subscribe to worker state changes
    pub fn subscribe_state(&self) -> watch::Receiver<ManagerState> {
        self.inner.state.subscribe()
    }

    /// Snapshot of the mappings this manager owns
    pub async fn local_mappings(&self) -> Vec<PortMapping> {
        self.inner.table.lock().await.local_mappings()
    }

    /// Snapshot of the gateway's UDP mappings as last refreshed
    pub async fn mirror_mappings(&self) -> Vec<PortMapping> {
        self.inner.table.lock().await.mirror_mappings()
    }

    /// Active configuration
    pub fn config(&self) -> &ManagerConfig {
        &self.inner.config
    }
}

impl<G: GatewayClient> Drop for MappingManager<G> {
    fn drop(&mut self) {
        // The worker holds its own reference and drains on its own.
        self.inner.signals.request_shutdown();
    }
}

impl<G: GatewayClient> Inner<G> {
    /// Worker body: the full state machine from Init to Stopped
    async fn run(self: Arc<Self>) {
        self.set_state(ManagerState::Init);
        let bridge: Arc<dyn GatewayEvents> =
            Arc::new(EventBridge::new(self.signals.clone(), self.host.clone()));
        let subscription = match self.gateway_call(move |gw| gw.subscribe(bridge)).await {
            Ok(subscription) => Some(subscription),
            Err(e) => {
                warn!("UPnP: failed to register gateway callbacks: {}", e);
                None
            }
        };

        if subscription.is_some() && !self.signals.is_shutdown() {
            self.set_state(ManagerState::Discovering);
            match self.discover().await {
                Ok(devices) if !self.signals.is_shutdown() => {
                    self.set_state(ManagerState::SelfTesting);
                    if self.self_test().await {
                        self.announce_available(&devices[0]);
                        self.set_state(ManagerState::Running);
                        self.reconcile().await;
                    } else {
                        warn!("UPnP: {}", MappingError::SelfTestFailed);
                    }
                }
                Ok(_) => {}
                Err(e) => info!("UPnP: discovery failed: {}", e),
            }
        }

        self.set_state(ManagerState::ShuttingDown);
        self.close(subscription).await;
        self.set_state(ManagerState::Stopped);
    }

    /// Running state: refresh the mirror whenever it is flagged stale
    async fn reconcile(&self) {
        let wake_interval = self.config.wake_interval();

        while !self.signals.is_shutdown() {
            if self.signals.is_mirror_stale() {
                self.signals.clear_mirror_stale();
                match self.refresh_mirror().await {
                    Ok(kept) => debug!("UPnP: mirror refreshed, {} UDP mappings", kept),
                    Err(e) => {
                        warn!("UPnP: could not enumerate gateway mappings: {}", e);
                        self.signals.defer_mirror_refresh();
                    }
                }
            }

            let _ = tokio::time::timeout(wake_interval, self.signals.wake().notified()).await;
        }
    }

    async fn discover(&self) -> Result<Vec<DeviceId>> {
        let device_type = self.config.device_type.clone();
        debug!("UPnP: searching for {}", device_type);

        let devices = self
            .gateway_call(move |gw| gw.discover(&device_type))
            .await?;
        if devices.is_empty() {
            info!("UPnP: no IGD device found");
            return Err(MappingError::NoGateway);
        }

        for device in &devices {
            debug!("UPnP: device detected {}", device);
        }
        Ok(devices)
    }

    async fn self_test(&self) -> bool {
        info!("UPnP: performing port mapping test");

        let local_addr = match self.local_address() {
            Ok(addr) => addr,
            Err(e) => {
                warn!("UPnP: cannot determine local address for test: {}", e);
                return false;
            }
        };
        let local_port = self.host.base_port();

        match self
            .create_legs(true, IpProtocol::UDP, local_addr, local_port)
            .await
        {
            Ok(legs) => {
                self.release_legs(&legs).await;
                info!("UPnP: port mapping test successful");
                true
            }
            Err(e) => {
                warn!("UPnP: error in port mapping test: {}", e);
                false
            }
        }
    }

    fn announce_available(&self, device: &DeviceId) {
        if self.signals.is_shutdown() {
            return;
        }

        info!("UPnP: available via {}", device);
        self.available.store(true, Ordering::SeqCst);
        self.host.set_available(Some(&device.0));
        // External address may just have become known upstream.
        self.host.force_re_registration();
    }

    /// Address of the first leg the gateway accepted
    async fn create_map(
        &self,
        pair: bool,
        protocol: IpProtocol,
        local_addr: IpAddr,
        local_port: u16,
    ) -> Result<SocketAddr> {
        let legs = self
            .create_legs(pair, protocol, local_addr, local_port)
            .await?;
        match legs.first() {
            Some(first) => external_addr(first),
            None => Err(MappingError::Internal("no mapping created".to_string())),
        }
    }

    /// Create the mapping legs, returning those the gateway accepted in port order
    async fn create_legs(
        &self,
        pair: bool,
        protocol: IpProtocol,
        local_addr: IpAddr,
        local_port: u16,
    ) -> Result<Vec<PortMapping>> {
        if self.is_closing() {
            return Err(MappingError::Closed);
        }

        let mut table = self.table.lock().await;
        // A drain may have run while this call waited for the lock
        if self.is_closing() {
            return Err(MappingError::Closed);
        }

        let base = self.config.external_base_port;
        let port = next_free_port(&table, pair, base).ok_or(MappingError::NoFreePort(base))?;
        let legs: u16 = if pair { 2 } else { 1 };

        let mut created: Vec<PortMapping> = Vec::with_capacity(legs as usize);
        let mut last_error = None;
        for i in 0..legs {
            let Some(internal_port) = local_port.checked_add(i) else {
                last_error = Some(MappingError::Internal(format!(
                    "Internal port {} + {} out of range",
                    local_port, i
                )));
                continue;
            };

            let mut mapping = PortMapping::request(
                protocol,
                port + i,
                local_addr,
                internal_port,
                self.config.description.clone(),
            );
            let request = mapping.clone();
            match self.gateway_call(move |gw| gw.add_mapping(&request)).await {
                Ok(external_ip) => {
                    mapping.external_ip = Some(external_ip);
                    debug!(
                        "UPnP: created map {} {}:{} to {}:{}",
                        protocol, local_addr, internal_port, external_ip, mapping.external_port
                    );
                    table.insert_local(mapping.clone());
                    created.push(mapping);
                }
                Err(e) => {
                    warn!(
                        "UPnP: AddPortMapping {} {} -> {}:{} failed: {}",
                        protocol,
                        port + i,
                        local_addr,
                        internal_port,
                        e
                    );
                    last_error = Some(e);
                }
            }
        }

        if created.is_empty() {
            return Err(last_error.unwrap_or_else(|| {
                MappingError::GatewayError("no mapping created".to_string())
            }));
        }

        if created.len() < legs as usize {
            if self.config.pair_policy == PairPolicy::AllOrNothing {
                for mapping in &created {
                    table.remove_local(mapping.external_port);
                    let (ext_port, proto) = (mapping.external_port, mapping.protocol);
                    if let Err(e) = self
                        .gateway_call(move |gw| gw.remove_mapping(ext_port, proto))
                        .await
                    {
                        warn!("UPnP: rollback of mapping {} failed: {}", ext_port, e);
                    }
                }
                return Err(MappingError::PartialPair {
                    created: created.len(),
                });
            }
            warn!(
                "UPnP: paired mapping at {} only partially created ({} of {} legs)",
                port,
                created.len(),
                legs
            );
        }

        Ok(created)
    }

    /// Remove legs that no caller will own
    async fn release_legs(&self, legs: &[PortMapping]) {
        for leg in legs {
            if let Err(e) = self.remove_map(leg.external_port).await {
                debug!("UPnP: mapping {} not released: {}", leg.external_port, e);
            }
        }
    }

    async fn remove_map(&self, external_port: u16) -> Result<()> {
        let mut table = self.table.lock().await;

        let Some(mapping) = table.remove_local(external_port) else {
            debug!("UPnP: no local mapping on port {}", external_port);
            return Ok(());
        };

        let protocol = mapping.protocol;
        let result = self
            .gateway_call(move |gw| gw.remove_mapping(external_port, protocol))
            .await;
        match &result {
            Ok(()) => debug!("UPnP: map removed {} {}", protocol, external_port),
            Err(e) => warn!("UPnP: DeletePortMapping {} failed: {}", external_port, e),
        }
        result
    }

    async fn refresh_mirror(&self) -> Result<usize> {
        let mut table = self.table.lock().await;

        let mappings = self
            .gateway_call(|gw| Ok(gw.enumerate_mappings()?.collect::<Vec<_>>()))
            .await?;
        Ok(table.replace_mirror(mappings))
    }

    /// ShuttingDown state: best-effort removal of everything we created
    async fn close(&self, subscription: Option<Subscription>) {
        if let Some(subscription) = subscription {
            subscription.unsubscribe();
        }

        let mut table = self.table.lock().await;
        for mapping in table.drain_local() {
            let (port, protocol) = (mapping.external_port, mapping.protocol);
            match self
                .gateway_call(move |gw| gw.remove_mapping(port, protocol))
                .await
            {
                Ok(()) => debug!("UPnP: mapping {} removed on shutdown", port),
                Err(e) => warn!("UPnP: failed to remove mapping {}: {}", port, e),
            }
        }
        table.clear();
        drop(table);

        self.release_gateway().await;
    }

    /// Release whatever the drain did not, without waiting on the table lock
    async fn force_close(&self) {
        if let Ok(mut table) = self.table.try_lock() {
            let leaked = table.local_len();
            if leaked > 0 {
                warn!("UPnP: {} mappings left on gateway", leaked);
            }
            table.clear();
        }
        self.release_gateway().await;
        self.set_state(ManagerState::Stopped);
    }

    async fn release_gateway(&self) {
        self.available.store(false, Ordering::SeqCst);
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self
            .gateway_call(|gw| {
                gw.release();
                Ok(())
            })
            .await;
    }

    fn is_closing(&self) -> bool {
        self.signals.is_shutdown() || self.closed.load(Ordering::SeqCst)
    }

    fn local_address(&self) -> Result<IpAddr> {
        match self.config.local_address {
            Some(addr) => Ok(addr),
            None => detect_local_ip(),
        }
    }

    fn set_state(&self, state: ManagerState) {
        debug!("UPnP: state {:?}", state);
        self.state.send_replace(state);
    }

    /// Run a blocking gateway call on the blocking pool
    async fn gateway_call<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&G) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let gateway = self.gateway.clone();
        tokio::task::spawn_blocking(move || f(&gateway))
            .await
            .map_err(|e| MappingError::Internal(format!("Task join error: {}", e)))?
    }
}

fn external_addr(mapping: &PortMapping) -> Result<SocketAddr> {
    mapping
        .external_ip
        .map(|ip| SocketAddr::new(ip, mapping.external_port))
        .ok_or_else(|| {
            MappingError::Internal(format!(
                "Mapping {} has no external address",
                mapping.external_port
            ))
        })
}

impl<G: GatewayClient> ReleaseMapping for Inner<G> {
    fn release_mapping(self: Arc<Self>, external_port: u16) {
        if self.signals.is_shutdown() {
            return;
        }

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = self.remove_map(external_port).await {
                        debug!("UPnP: release of mapping {} failed: {}", external_port, e);
                    }
                });
            }
            Err(_) => debug!(
                "UPnP: no runtime to release mapping {}, left for shutdown",
                external_port
            ),
        }
    }
}
