//! Manager configuration

use crate::allocator::DEFAULT_BASE_PORT;
use crate::gateway::IGD_DEVICE_TYPE;
use crate::types::{MappingError, Result};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::time::Duration;

/// What `create_map` reports when only one leg of a pair is accepted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PairPolicy {
    /// Succeed if at least one leg was created
    #[default]
    Lenient,
    /// Roll back created legs and fail unless every leg was created
    AllOrNothing,
}

/// Configuration for [`MappingManager`](crate::MappingManager)
///
/// Stored as JSON. Missing fields take their default values.
///
/// # Example
/// ```rust,no_run
/// use upnp_nat::ManagerConfig;
///
/// let config = ManagerConfig::load("upnp.json").expect("Failed to load");
/// println!("Allocating from port {}", config.external_base_port);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    /// First external port tried by the allocator
    pub external_base_port: u16,
    /// Description tag attached to every mapping
    pub description: String,
    /// UPnP device type to discover
    pub device_type: String,
    /// SSDP search timeout in milliseconds
    pub search_timeout_ms: u64,
    /// Upper bound between reconciliation loop wakes in milliseconds
    pub wake_interval_ms: u64,
    /// How long shutdown waits for the drain in milliseconds
    pub shutdown_timeout_ms: u64,
    /// Gateway notification poll interval in milliseconds
    pub event_poll_interval_ms: u64,
    /// Internal client address override (detected when unset)
    pub local_address: Option<IpAddr>,
    /// Handling of half-created pairs
    pub pair_policy: PairPolicy,
    /// First local RTP port for socket pairs
    pub rtp_port_base: u16,
    /// Last local RTP port for socket pairs
    pub rtp_port_max: u16,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            external_base_port: DEFAULT_BASE_PORT,
            description: "upnp-nat".to_string(),
            device_type: IGD_DEVICE_TYPE.to_string(),
            search_timeout_ms: 5_000,
            wake_interval_ms: 200,
            shutdown_timeout_ms: 2_000,
            event_poll_interval_ms: 5_000,
            local_address: None,
            pair_policy: PairPolicy::Lenient,
            rtp_port_base: 5000,
            rtp_port_max: 5999,
        }
    }
}

impl ManagerConfig {
    /// Load configuration from a JSON file
    ///
    /// Returns the defaults when the file does not exist or is empty.
    pub fn load<P: AsRef<std::path::Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            return Ok(Self::default());
        }

        let data = std::fs::read_to_string(path)
            .map_err(|e| MappingError::Config(format!("Failed to read config: {}", e)))?;

        if data.trim().is_empty() {
            return Ok(Self::default());
        }

        let config: Self = serde_json::from_str(&data)
            .map_err(|e| MappingError::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;

        Ok(config)
    }

    /// Save configuration to a JSON file, creating parent directories
    pub fn save<P: AsRef<std::path::Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                MappingError::Config(format!("Failed to create config directory: {}", e))
            })?;
        }

        let json = serde_json::to_string_pretty(self)
            .map_err(|e| MappingError::Config(format!("Failed to serialize config: {}", e)))?;

        std::fs::write(path, json)
            .map_err(|e| MappingError::Config(format!("Failed to write config: {}", e)))?;

        Ok(())
    }

    /// Reject values the manager cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.external_base_port == 0 {
            return Err(MappingError::Config(
                "external_base_port must be non-zero".to_string(),
            ));
        }
        if self.wake_interval_ms == 0 {
            return Err(MappingError::Config(
                "wake_interval_ms must be non-zero".to_string(),
            ));
        }
        if self.rtp_port_base == 0 || self.rtp_port_base > self.rtp_port_max {
            return Err(MappingError::InvalidPortRange {
                base: self.rtp_port_base,
                max: self.rtp_port_max,
            });
        }
        Ok(())
    }

    /// Reconciliation loop wake bound
    pub fn wake_interval(&self) -> Duration {
        Duration::from_millis(self.wake_interval_ms)
    }

    /// Bounded wait for the shutdown drain
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    /// SSDP search timeout
    pub fn search_timeout(&self) -> Duration {
        Duration::from_millis(self.search_timeout_ms)
    }

    /// Gateway notification poll interval
    pub fn event_poll_interval(&self) -> Duration {
        Duration::from_millis(self.event_poll_interval_ms)
    }
}
