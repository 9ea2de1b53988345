use crate::config::{ManagerConfig, PairPolicy};
use crate::types::MappingError;
use std::io::Write;
use std::net::IpAddr;
use tempfile::{tempdir, NamedTempFile};

#[test]
fn test_default_config() {
    let config = ManagerConfig::default();
    assert_eq!(config.external_base_port, 55001);
    assert_eq!(
        config.device_type,
        "urn:schemas-upnp-org:device:InternetGatewayDevice:1"
    );
    assert_eq!(config.wake_interval_ms, 200);
    assert_eq!(config.shutdown_timeout_ms, 2000);
    assert_eq!(config.pair_policy, PairPolicy::Lenient);
    assert!(config.local_address.is_none());
    assert!(config.validate().is_ok());
}

#[test]
fn test_load_missing_file_returns_defaults() {
    let dir = tempdir().unwrap();
    let config = ManagerConfig::load(dir.path().join("missing.json")).unwrap();
    assert_eq!(config, ManagerConfig::default());
}

#[test]
fn test_load_empty_file_returns_defaults() {
    let file = NamedTempFile::new().unwrap();
    let config = ManagerConfig::load(file.path()).unwrap();
    assert_eq!(config, ManagerConfig::default());
}

#[test]
fn test_save_and_load() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("nested").join("upnp.json");

    let config = ManagerConfig {
        external_base_port: 60000,
        description: "softphone".to_string(),
        local_address: Some("192.168.1.20".parse::<IpAddr>().unwrap()),
        pair_policy: PairPolicy::AllOrNothing,
        ..ManagerConfig::default()
    };
    config.save(&path).unwrap();

    let loaded = ManagerConfig::load(&path).unwrap();
    assert_eq!(loaded, config);
}

#[test]
fn test_partial_file_fills_defaults() {
    let mut file = NamedTempFile::new().unwrap();
    write!(file, r#"{{ "external_base_port": 40000, "pair_policy": "all_or_nothing" }}"#).unwrap();

    let config = ManagerConfig::load(file.path()).unwrap();
    assert_eq!(config.external_base_port, 40000);
    assert_eq!(config.pair_policy, PairPolicy::AllOrNothing);
    assert_eq!(config.wake_interval_ms, 200);
}

#[test]
fn test_load_rejects_invalid_values() {
    let mut file = NamedTempFile::new().unwrap();
    write!(file, r#"{{ "rtp_port_base": 6000, "rtp_port_max": 5000 }}"#).unwrap();
    assert!(matches!(
        ManagerConfig::load(file.path()),
        Err(MappingError::InvalidPortRange { base: 6000, max: 5000 })
    ));

    let mut file = NamedTempFile::new().unwrap();
    write!(file, "not json").unwrap();
    assert!(matches!(
        ManagerConfig::load(file.path()),
        Err(MappingError::Config(_))
    ));
}

#[test]
fn test_validate_rejects_zero_wake_interval() {
    let config = ManagerConfig {
        wake_interval_ms: 0,
        ..ManagerConfig::default()
    };
    assert!(matches!(config.validate(), Err(MappingError::Config(_))));
}
