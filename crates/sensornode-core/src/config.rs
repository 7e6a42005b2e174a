use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::transport::PublishQos;

/// Fixed for the lifetime of the process; built once at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceIdentity {
    pub id: String,
    pub name: String,
    pub firmware_version: String,
    pub device_type: String,
}

impl DeviceIdentity {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            firmware_version: env!("CARGO_PKG_VERSION").to_string(),
            device_type: "environmental-node".to_string(),
        }
    }
}

/// QoS and retain knobs that differed between firmware variants with no
/// stated rationale; kept as configuration rather than constants.
#[derive(Debug, Clone)]
pub struct PublishPolicy {
    pub data_qos: PublishQos,
    pub status_qos: PublishQos,
    pub status_retain: bool,
    pub discovery_qos: PublishQos,
    pub discovery_retain: bool,
    pub gps_qos: PublishQos,
}

impl Default for PublishPolicy {
    fn default() -> Self {
        Self {
            data_qos: PublishQos::AtMostOnce,
            status_qos: PublishQos::AtMostOnce,
            status_retain: true,
            discovery_qos: PublishQos::AtLeastOnce,
            discovery_retain: false,
            gps_qos: PublishQos::AtLeastOnce,
        }
    }
}

#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub data_interval: Duration,
    pub heartbeat_interval: Duration,
    pub discovery_interval: Duration,
    pub reconnect_interval: Duration,
    pub display_interval: Duration,
    pub jitter_min: Duration,
    pub jitter_max: Duration,
    pub publish: PublishPolicy,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            data_interval: Duration::from_millis(2000),
            heartbeat_interval: Duration::from_secs(30),
            discovery_interval: Duration::from_secs(300),
            reconnect_interval: Duration::from_millis(5000),
            display_interval: Duration::from_millis(500),
            jitter_min: Duration::from_millis(100),
            jitter_max: Duration::from_millis(1000),
            publish: PublishPolicy::default(),
        }
    }
}
