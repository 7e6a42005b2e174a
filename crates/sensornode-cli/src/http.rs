use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::Json;
use axum::routing::get;
use axum::Router;
use sensornode_core::sensor::{SensorBank, SensorKind, SensorSource};
use sensornode_core::DeviceIdentity;
use serde_json::{json, Value};
use tokio::sync::RwLock;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

const ENDPOINTS: [&str; 6] = [
    "/",
    "/api/info",
    "/sensors",
    "/sensors/registry",
    "/sensors/{id|type}",
    "/status",
];

pub struct ApiState {
    pub identity: DeviceIdentity,
    pub bank: SensorBank,
    pub started: Instant,
}

pub type SharedState = Arc<RwLock<ApiState>>;

pub fn router(state: SharedState) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/api/info", get(info))
        .route("/sensors", get(sensors))
        .route("/sensors/registry", get(registry))
        .route("/sensors/:key", get(sensor_detail))
        .route("/status", get(status))
        .fallback(not_found)
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Serve the pull API while a background task keeps the sensor bank fresh.
pub async fn run_server<S: SensorSource + 'static>(
    identity: DeviceIdentity,
    bank: SensorBank,
    mut source: S,
    sample_interval: Duration,
    bind: &str,
) -> Result<()> {
    let state: SharedState = Arc::new(RwLock::new(ApiState {
        identity,
        bank,
        started: Instant::now(),
    }));

    let sampler_state = Arc::clone(&state);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(sample_interval);
        loop {
            ticker.tick().await;
            let mut guard = sampler_state.write().await;
            guard.bank.read_all(&mut source).await;
        }
    });

    let app = router(state);
    let listener = tokio::net::TcpListener::bind(bind).await?;
    info!(bind, "serving sensor api");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = %err, "ctrl-c handler failed");
            }
        })
        .await?;

    Ok(())
}

async fn index(State(state): State<SharedState>) -> Json<Value> {
    let guard = state.read().await;
    Json(index_body(&guard.identity))
}

async fn info(State(state): State<SharedState>) -> Json<Value> {
    let guard = state.read().await;
    let uptime = guard.started.elapsed().as_secs();
    Json(info_body(&guard.identity, &guard.bank, uptime))
}

async fn sensors(State(state): State<SharedState>) -> Json<Value> {
    let guard = state.read().await;
    Json(sensors_body(&guard.identity, &guard.bank))
}

async fn registry(State(state): State<SharedState>) -> Json<Value> {
    let guard = state.read().await;
    Json(registry_body(&guard.bank))
}

async fn sensor_detail(
    State(state): State<SharedState>,
    Path(key): Path<String>,
) -> (StatusCode, Json<Value>) {
    let guard = state.read().await;
    match sensor_lookup(&guard.bank, &key) {
        Ok(body) => (StatusCode::OK, Json(body)),
        Err(body) => (StatusCode::NOT_FOUND, Json(body)),
    }
}

async fn status(State(state): State<SharedState>) -> Json<Value> {
    let guard = state.read().await;
    let uptime = guard.started.elapsed().as_secs();
    Json(status_body(&guard.identity, &guard.bank, uptime, free_memory_bytes()))
}

/// Host analogue of the firmware's free-heap report.
fn free_memory_bytes() -> Option<u64> {
    let mut sys = sysinfo::System::new();
    sys.refresh_memory();
    Some(sys.available_memory())
}

async fn not_found() -> (StatusCode, Json<Value>) {
    (StatusCode::NOT_FOUND, Json(not_found_body()))
}

pub fn index_body(identity: &DeviceIdentity) -> Value {
    json!({
        "device_id": identity.id,
        "device_name": identity.name,
        "message": "environmental sensor node",
        "endpoints": ENDPOINTS,
    })
}

pub fn info_body(identity: &DeviceIdentity, bank: &SensorBank, uptime_s: u64) -> Value {
    json!({
        "device_id": identity.id,
        "device_name": identity.name,
        "device_type": identity.device_type,
        "firmware_version": identity.firmware_version,
        "uptime_seconds": uptime_s,
        "total_sensors": bank.specs().filter(|s| s.active).count(),
        "routes": [
            { "path": "/", "method": "GET", "description": "api summary and route map" },
            { "path": "/api/info", "method": "GET", "description": "device info and route documentation" },
            { "path": "/sensors", "method": "GET", "description": "all sensors, current value and status" },
            { "path": "/sensors/registry", "method": "GET", "description": "sensor configurations, no live data" },
            { "path": "/sensors/{id}", "method": "GET", "description": "one sensor's full record" },
            { "path": "/sensors/{type}", "method": "GET", "description": "all sensors of a type (temperature/humidity/light/...)" },
            { "path": "/status", "method": "GET", "description": "device status and uptime" },
        ],
    })
}

/// The latest read cycle, same shape as the push-side data message.
pub fn sensors_body(identity: &DeviceIdentity, bank: &SensorBank) -> Value {
    let readings: Vec<Value> = bank
        .last_snapshot()
        .map(|snapshot| {
            snapshot
                .readings
                .iter()
                .map(|(kind, reading)| {
                    let spec = bank.spec(*kind);
                    json!({
                        "sensor_id": spec.map(|s| s.id.as_str()).unwrap_or(kind.as_str()),
                        "sensor_type": kind.as_str(),
                        "value": reading.value,
                        "unit": reading.unit,
                        "is_valid": reading.valid,
                        "status": reading.status,
                        "thresholds": spec.map(|s| json!({
                            "min": s.min_threshold,
                            "max": s.max_threshold,
                        })),
                    })
                })
                .collect()
        })
        .unwrap_or_default();

    json!({
        "device_id": identity.id,
        "timestamp": bank.last_snapshot().map(|s| s.taken_at.to_rfc3339()),
        "sensors": readings,
    })
}

pub fn registry_body(bank: &SensorBank) -> Value {
    let sensors: Vec<Value> = bank
        .specs()
        .map(|spec| {
            json!({
                "sensor_id": spec.id,
                "sensor_type": spec.kind.as_str(),
                "sensor_name": spec.name,
                "model": spec.model,
                "unit": spec.unit,
                "location": spec.location,
                "accuracy": spec.accuracy,
                "thresholds": { "min": spec.min_threshold, "max": spec.max_threshold },
                "calibration_offset": spec.calibration_offset,
                "enabled": spec.active,
            })
        })
        .collect();
    json!({ "sensors": sensors })
}

fn sensor_record(bank: &SensorBank, spec: &sensornode_core::SensorSpec) -> Value {
    let reading = bank
        .last_snapshot()
        .and_then(|snapshot| snapshot.readings.get(&spec.kind));
    let stats = bank.stats(spec.kind);

    json!({
        "sensor_id": spec.id,
        "sensor_type": spec.kind.as_str(),
        "sensor_name": spec.name,
        "unit": spec.unit,
        "location": spec.location,
        "enabled": spec.active,
        "current_value": reading.and_then(|r| r.value),
        "is_valid": reading.map(|r| r.valid).unwrap_or(false),
        "status": reading.map(|r| r.status),
        "thresholds": { "min": spec.min_threshold, "max": spec.max_threshold },
        "stats": stats.map(|s| json!({
            "count": s.count,
            "min": s.min,
            "max": s.max,
            "average": s.average(),
        })),
    })
}

/// Resolve `key` as a sensor id first, then as a sensor type name (which
/// returns every sensor of that type). The error body is the
/// sensor-not-found shape clients match on.
pub fn sensor_lookup(bank: &SensorBank, key: &str) -> Result<Value, Value> {
    if let Some(spec) = bank.spec_by_id(key) {
        return Ok(sensor_record(bank, spec));
    }

    if let Some(kind) = SensorKind::parse(key) {
        let records: Vec<Value> = bank
            .specs()
            .filter(|spec| spec.kind == kind)
            .map(|spec| sensor_record(bank, spec))
            .collect();
        if !records.is_empty() {
            return Ok(json!({
                "sensor_type": kind.as_str(),
                "count": records.len(),
                "sensors": records,
            }));
        }
    }

    Err(json!({ "error": "Sensor not found", "sensor_id": key }))
}

pub fn status_body(
    identity: &DeviceIdentity,
    bank: &SensorBank,
    uptime_s: u64,
    free_memory: Option<u64>,
) -> Value {
    let snapshot = bank.last_snapshot();
    let valid = snapshot
        .map(|s| s.readings.values().filter(|r| r.valid).count())
        .unwrap_or(0);
    let total = snapshot.map(|s| s.readings.len()).unwrap_or(0);
    let wifi = snapshot.and_then(|s| s.readings.get(&SensorKind::WifiSignal));

    json!({
        "device_id": identity.id,
        "status": "online",
        "wifi_connected": wifi.map(|r| r.valid).unwrap_or(false),
        "wifi_rssi": wifi.and_then(|r| r.value),
        "uptime_seconds": uptime_s,
        "free_memory_bytes": free_memory,
        "sensors_reporting": valid,
        "sensors_total": total,
        "last_read": snapshot.map(|s| s.taken_at.to_rfc3339()),
    })
}

pub fn not_found_body() -> Value {
    json!({
        "error": "Not found",
        "available_endpoints": ENDPOINTS,
    })
}
