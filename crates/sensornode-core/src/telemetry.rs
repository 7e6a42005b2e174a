use chrono::Utc;
use serde_json::{json, Value};

use crate::config::DeviceIdentity;
use crate::link::ConnectivityState;
use crate::sensor::{GpsFix, SensorBank, SensorKind, SensorSnapshot};

/// Broadcast discovery request shared by every device on the broker.
pub const BROADCAST_DISCOVER_TOPIC: &str = "devices/discover/all";

pub fn data_topic(device_id: &str) -> String {
    format!("devices/{device_id}/data")
}

pub fn status_topic(device_id: &str) -> String {
    format!("devices/{device_id}/status")
}

pub fn heartbeat_topic(device_id: &str) -> String {
    format!("devices/{device_id}/heartbeat")
}

pub fn gps_topic(device_id: &str) -> String {
    format!("devices/{device_id}/gps")
}

pub fn discovery_response_topic(device_id: &str) -> String {
    format!("devices/{device_id}/discovery/response")
}

pub fn control_response_topic(device_id: &str) -> String {
    format!("devices/{device_id}/control/response")
}

pub fn discover_topic(device_id: &str) -> String {
    format!("devices/{device_id}/discover")
}

/// Topics the session handshake subscribes to.
pub fn subscriptions(device_id: &str) -> Vec<String> {
    vec![
        format!("devices/{device_id}/control/#"),
        format!("devices/{device_id}/config/#"),
        discover_topic(device_id),
        BROADCAST_DISCOVER_TOPIC.to_string(),
    ]
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

/// Current values for every sensor in the snapshot.
pub fn data_message(identity: &DeviceIdentity, snapshot: &SensorSnapshot, bank: &SensorBank) -> Value {
    let sensors: Vec<Value> = snapshot
        .readings
        .iter()
        .map(|(kind, reading)| {
            let spec = bank.spec(*kind);
            json!({
                "sensor_id": spec.map(|s| s.id.as_str()).unwrap_or(kind.as_str()),
                "sensor_type": kind.as_str(),
                "sensor_name": spec.map(|s| s.name.as_str()).unwrap_or(""),
                "value": reading.value.map(round2),
                "unit": reading.unit,
                "is_valid": reading.valid,
                "status": reading.status,
            })
        })
        .collect();

    json!({
        "device_id": identity.id,
        "timestamp": snapshot.taken_at.to_rfc3339(),
        "sensors": sensors,
    })
}

pub fn status_message(
    identity: &DeviceIdentity,
    state: ConnectivityState,
    uptime_s: u64,
    snapshot: Option<&SensorSnapshot>,
    bank: &SensorBank,
) -> Value {
    let rssi = snapshot
        .and_then(|s| s.readings.get(&SensorKind::WifiSignal))
        .and_then(|r| r.value);

    json!({
        "device_id": identity.id,
        "device_name": identity.name,
        "device_type": identity.device_type,
        "firmware_version": identity.firmware_version,
        "status": "online",
        "link": state.as_str(),
        "uptime_seconds": uptime_s,
        "wifi_rssi": rssi,
        "total_sensors": bank.specs().filter(|s| s.active).count(),
        "timestamp": Utc::now().to_rfc3339(),
    })
}

/// Liveness only; deliberately minimal.
pub fn heartbeat_message(identity: &DeviceIdentity, uptime_s: u64) -> Value {
    json!({
        "device_id": identity.id,
        "alive": true,
        "uptime_seconds": uptime_s,
        "timestamp": Utc::now().to_rfc3339(),
    })
}

/// Full capability manifest used by external systems to auto-register the
/// device. Safe to repeat.
pub fn discovery_message(
    identity: &DeviceIdentity,
    bank: &SensorBank,
    snapshot: Option<&SensorSnapshot>,
) -> Value {
    let sensors: Vec<Value> = bank
        .specs()
        .filter(|spec| spec.active)
        .map(|spec| {
            let value = snapshot
                .and_then(|s| s.readings.get(&spec.kind))
                .and_then(|r| r.value)
                .map(round2);
            json!({
                "sensor_id": spec.id,
                "sensor_type": spec.kind.as_str(),
                "sensor_name": spec.name,
                "model": spec.model,
                "unit": spec.unit,
                "accuracy": spec.accuracy,
                "location": spec.location,
                "thresholds": { "min": spec.min_threshold, "max": spec.max_threshold },
                "enabled": spec.active,
                "value": value,
            })
        })
        .collect();

    let mut capabilities = vec!["telemetry", "heartbeat", "discovery", "control", "config"];
    if bank.spec(SensorKind::GpsFix).map(|s| s.active).unwrap_or(false) {
        capabilities.push("gps");
    }

    json!({
        "device_id": identity.id,
        "device_name": identity.name,
        "device_type": identity.device_type,
        "firmware_version": identity.firmware_version,
        "capabilities": capabilities,
        "network": {
            "client_id": identity.id,
            "wifi_rssi": snapshot
                .and_then(|s| s.readings.get(&SensorKind::WifiSignal))
                .and_then(|r| r.value),
        },
        "sensors": sensors,
        "timestamp": Utc::now().to_rfc3339(),
    })
}

pub fn gps_message(identity: &DeviceIdentity, fix: &GpsFix) -> Value {
    json!({
        "device_id": identity.id,
        "location": {
            "latitude": fix.latitude,
            "longitude": fix.longitude,
            "altitude_m": fix.altitude_m,
            "speed_kmh": fix.speed_kmh,
            "satellites": fix.satellites,
            "valid": fix.valid,
        },
        "timestamp": Utc::now().to_rfc3339(),
    })
}

pub fn control_response(identity: &DeviceIdentity, command: &str, ok: bool, detail: &str) -> Value {
    json!({
        "device_id": identity.id,
        "command": command,
        "ok": ok,
        "detail": detail,
        "timestamp": Utc::now().to_rfc3339(),
    })
}
