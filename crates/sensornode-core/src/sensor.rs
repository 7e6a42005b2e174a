use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

pub const STATS_WINDOW: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SensorKind {
    Temperature,
    Humidity,
    Light,
    Potentiometer,
    WifiSignal,
    Battery,
    GpsFix,
}

impl SensorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SensorKind::Temperature => "temperature",
            SensorKind::Humidity => "humidity",
            SensorKind::Light => "light",
            SensorKind::Potentiometer => "potentiometer",
            SensorKind::WifiSignal => "wifi_signal",
            SensorKind::Battery => "battery",
            SensorKind::GpsFix => "gps_fix",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "temperature" => Some(SensorKind::Temperature),
            "humidity" => Some(SensorKind::Humidity),
            "light" => Some(SensorKind::Light),
            "potentiometer" => Some(SensorKind::Potentiometer),
            "wifi_signal" => Some(SensorKind::WifiSignal),
            "battery" => Some(SensorKind::Battery),
            "gps_fix" => Some(SensorKind::GpsFix),
            _ => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum SensorError {
    #[error("checksum mismatch")]
    Checksum,
    #[error("sensor timed out")]
    Timeout,
    #[error("sensor not attached")]
    NotAttached,
    #[error("read failed: {0}")]
    Io(String),
}

/// A raw sample as the peripheral hands it over, before any conversion.
#[derive(Debug, Clone, Copy)]
pub enum RawReading {
    /// ADC counts against the converter's full-scale value; mapped to 0-100 %.
    Analog { counts: u16, full_scale: u16 },
    /// Already in engineering units (e.g. DHT degrees Celsius).
    Physical(f64),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GpsFix {
    pub latitude: f64,
    pub longitude: f64,
    pub altitude_m: f64,
    pub speed_kmh: f64,
    pub satellites: u32,
    pub valid: bool,
}

/// The attached peripherals. A failed sample for one kind must not prevent
/// the others from being read in the same cycle.
#[async_trait]
pub trait SensorSource: Send {
    fn kinds(&self) -> Vec<SensorKind>;
    async fn sample(&mut self, kind: SensorKind) -> Result<RawReading, SensorError>;
    async fn gps(&mut self) -> Option<GpsFix> {
        None
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadingStatus {
    Normal,
    Warning,
    Invalid,
}

/// One sensor's value for one cycle. Invalid readings carry no number at
/// all; the firmware's -1/-999 sentinels do not survive here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reading {
    pub value: Option<f64>,
    pub unit: String,
    pub valid: bool,
    pub status: ReadingStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Reading {
    fn ok(value: f64, unit: &str, warning: bool) -> Self {
        Self {
            value: Some(value),
            unit: unit.to_string(),
            valid: true,
            status: if warning {
                ReadingStatus::Warning
            } else {
                ReadingStatus::Normal
            },
            error: None,
        }
    }

    fn invalid(unit: &str, error: String) -> Self {
        Self {
            value: None,
            unit: unit.to_string(),
            valid: false,
            status: ReadingStatus::Invalid,
            error: Some(error),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SensorSpec {
    pub id: String,
    pub name: String,
    pub model: String,
    pub kind: SensorKind,
    pub unit: String,
    pub location: String,
    pub min_threshold: f64,
    pub max_threshold: f64,
    pub calibration_offset: f64,
    pub accuracy: f64,
    pub active: bool,
}

/// Rolling statistics over a fixed circular window.
#[derive(Debug, Clone)]
pub struct SensorStats {
    window: [f64; STATS_WINDOW],
    next: usize,
    pub count: u64,
    pub min: f64,
    pub max: f64,
}

impl Default for SensorStats {
    fn default() -> Self {
        Self {
            window: [0.0; STATS_WINDOW],
            next: 0,
            count: 0,
            min: f64::MAX,
            max: f64::MIN,
        }
    }
}

impl SensorStats {
    pub fn record(&mut self, value: f64) {
        self.window[self.next] = value;
        self.next = (self.next + 1) % STATS_WINDOW;
        self.count += 1;
        if value < self.min {
            self.min = value;
        }
        if value > self.max {
            self.max = value;
        }
    }

    /// Arithmetic mean over the full window, zero-initialised slots
    /// included. Not meaningful until `count >= STATS_WINDOW`; callers that
    /// care must check. Kept as the firmware computed it.
    pub fn average(&self) -> f64 {
        self.window.iter().sum::<f64>() / STATS_WINDOW as f64
    }
}

/// A full read cycle's output. Overwritten in place on each cycle; a kind is
/// either valid or explicitly invalid, never silently stale.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SensorSnapshot {
    pub taken_at: DateTime<Utc>,
    pub readings: BTreeMap<SensorKind, Reading>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gps: Option<GpsFix>,
}

impl SensorSnapshot {
    pub fn empty() -> Self {
        Self {
            taken_at: Utc::now(),
            readings: BTreeMap::new(),
            gps: None,
        }
    }
}

pub struct SensorBank {
    specs: BTreeMap<SensorKind, SensorSpec>,
    stats: BTreeMap<SensorKind, SensorStats>,
    last: Option<SensorSnapshot>,
}

impl SensorBank {
    pub fn new(specs: Vec<SensorSpec>) -> Self {
        let specs = specs.into_iter().map(|s| (s.kind, s)).collect();
        Self {
            specs,
            stats: BTreeMap::new(),
            last: None,
        }
    }

    /// The registry the reference firmware shipped with.
    pub fn standard() -> Self {
        let spec = |id: &str,
                    name: &str,
                    model: &str,
                    kind: SensorKind,
                    unit: &str,
                    location: &str,
                    min: f64,
                    max: f64,
                    accuracy: f64| SensorSpec {
            id: id.to_string(),
            name: name.to_string(),
            model: model.to_string(),
            kind,
            unit: unit.to_string(),
            location: location.to_string(),
            min_threshold: min,
            max_threshold: max,
            calibration_offset: 0.0,
            accuracy,
            active: true,
        };

        Self::new(vec![
            spec(
                "temp_01",
                "Temperature Sensor",
                "DHT22",
                SensorKind::Temperature,
                "celsius",
                "Room A",
                -10.0,
                50.0,
                0.5,
            ),
            spec(
                "hum_01",
                "Humidity Sensor",
                "DHT22",
                SensorKind::Humidity,
                "percent",
                "Room A",
                20.0,
                80.0,
                2.0,
            ),
            spec(
                "light_01",
                "Light Sensor",
                "LDR GL5528",
                SensorKind::Light,
                "percent",
                "Window",
                0.0,
                100.0,
                5.0,
            ),
            spec(
                "pot_01",
                "Potentiometer",
                "B10K",
                SensorKind::Potentiometer,
                "percent",
                "Panel",
                0.0,
                100.0,
                1.0,
            ),
            spec(
                "wifi_01",
                "WiFi Signal",
                "ESP32 RSSI",
                SensorKind::WifiSignal,
                "dBm",
                "Internal",
                -90.0,
                -30.0,
                1.0,
            ),
            spec(
                "batt_01",
                "Battery Level",
                "ADC Divider",
                SensorKind::Battery,
                "percent",
                "Internal",
                10.0,
                100.0,
                2.0,
            ),
            spec(
                "gps_01",
                "GPS Fix",
                "NEO-6M",
                SensorKind::GpsFix,
                "count",
                "External",
                0.0,
                32.0,
                1.0,
            ),
        ])
    }

    pub fn specs(&self) -> impl Iterator<Item = &SensorSpec> {
        self.specs.values()
    }

    pub fn spec(&self, kind: SensorKind) -> Option<&SensorSpec> {
        self.specs.get(&kind)
    }

    pub fn spec_by_id(&self, id: &str) -> Option<&SensorSpec> {
        self.specs.values().find(|s| s.id == id)
    }

    pub fn stats(&self, kind: SensorKind) -> Option<&SensorStats> {
        self.stats.get(&kind)
    }

    pub fn last_snapshot(&self) -> Option<&SensorSnapshot> {
        self.last.as_ref()
    }

    pub fn set_calibration_by_id(&mut self, id: &str, offset: f64) -> bool {
        for spec in self.specs.values_mut() {
            if spec.id == id {
                spec.calibration_offset = offset;
                return true;
            }
        }
        false
    }

    pub fn set_active_by_id(&mut self, id: &str, active: bool) -> bool {
        for spec in self.specs.values_mut() {
            if spec.id == id {
                spec.active = active;
                return true;
            }
        }
        false
    }

    /// One full read cycle. Partial success is the norm: a failing kind is
    /// recorded as invalid and the remaining kinds are still read.
    pub async fn read_all(&mut self, source: &mut dyn SensorSource) -> SensorSnapshot {
        let mut readings = BTreeMap::new();

        for kind in source.kinds() {
            let Some(spec) = self.specs.get(&kind) else {
                continue;
            };
            if !spec.active {
                continue;
            }
            let unit = spec.unit.clone();
            let offset = spec.calibration_offset;
            let (min, max) = (spec.min_threshold, spec.max_threshold);

            let reading = match source.sample(kind).await {
                Ok(raw) => {
                    let value = convert_raw(raw) + offset;
                    let warning = value < min || value > max;
                    self.stats.entry(kind).or_default().record(value);
                    Reading::ok(value, &unit, warning)
                }
                Err(err) => {
                    warn!(kind = kind.as_str(), error = %err, "sensor read failed");
                    Reading::invalid(&unit, err.to_string())
                }
            };
            readings.insert(kind, reading);
        }

        let snapshot = SensorSnapshot {
            taken_at: Utc::now(),
            readings,
            gps: source.gps().await,
        };
        self.last = Some(snapshot.clone());
        snapshot
    }
}

fn convert_raw(raw: RawReading) -> f64 {
    match raw {
        RawReading::Analog { counts, full_scale } => adc_to_percent(counts, full_scale),
        RawReading::Physical(v) => v,
    }
}

/// Linear map from the converter's native range to 0-100 %.
pub fn adc_to_percent(counts: u16, full_scale: u16) -> f64 {
    if full_scale == 0 {
        return 0.0;
    }
    (counts as f64 / full_scale as f64 * 100.0).clamp(0.0, 100.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct ScriptedSource {
        results: BTreeMap<SensorKind, Result<RawReading, SensorError>>,
    }

    #[async_trait]
    impl SensorSource for ScriptedSource {
        fn kinds(&self) -> Vec<SensorKind> {
            self.results.keys().copied().collect()
        }

        async fn sample(&mut self, kind: SensorKind) -> Result<RawReading, SensorError> {
            match self.results.get(&kind) {
                Some(Ok(raw)) => Ok(*raw),
                Some(Err(_)) => Err(SensorError::Checksum),
                None => Err(SensorError::NotAttached),
            }
        }
    }

    fn scripted(entries: Vec<(SensorKind, Result<RawReading, SensorError>)>) -> ScriptedSource {
        ScriptedSource {
            results: entries.into_iter().collect(),
        }
    }

    #[tokio::test]
    async fn failed_read_does_not_corrupt_other_kinds() {
        let mut bank = SensorBank::standard();
        let mut source = scripted(vec![
            (SensorKind::Temperature, Err(SensorError::Checksum)),
            (SensorKind::Humidity, Ok(RawReading::Physical(41.5))),
            (
                SensorKind::Light,
                Ok(RawReading::Analog {
                    counts: 2048,
                    full_scale: 4095,
                }),
            ),
        ]);

        let snapshot = bank.read_all(&mut source).await;

        let temp = &snapshot.readings[&SensorKind::Temperature];
        assert!(!temp.valid);
        assert_eq!(temp.status, ReadingStatus::Invalid);
        assert_eq!(temp.value, None);

        let hum = &snapshot.readings[&SensorKind::Humidity];
        assert!(hum.valid);
        assert_eq!(hum.value, Some(41.5));

        let light = &snapshot.readings[&SensorKind::Light];
        assert!(light.valid);
        let pct = light.value.expect("valid reading has a value");
        assert!((pct - 50.0).abs() < 0.1, "adc midpoint maps near 50%, got {pct}");
    }

    #[tokio::test]
    async fn calibration_offset_applied_before_threshold_check() {
        let mut bank = SensorBank::standard();
        assert!(bank.set_calibration_by_id("temp_01", 30.0));
        let mut source = scripted(vec![(
            SensorKind::Temperature,
            Ok(RawReading::Physical(25.0)),
        )]);

        let snapshot = bank.read_all(&mut source).await;
        let temp = &snapshot.readings[&SensorKind::Temperature];
        assert_eq!(temp.value, Some(55.0));
        // 55 exceeds the 50 C max threshold only because the offset landed first.
        assert_eq!(temp.status, ReadingStatus::Warning);
    }

    #[tokio::test]
    async fn inactive_sensor_is_skipped() {
        let mut bank = SensorBank::standard();
        assert!(bank.set_active_by_id("hum_01", false));
        let mut source = scripted(vec![(SensorKind::Humidity, Ok(RawReading::Physical(40.0)))]);

        let snapshot = bank.read_all(&mut source).await;
        assert!(!snapshot.readings.contains_key(&SensorKind::Humidity));
    }

    #[test]
    fn rolling_average_matches_full_window() {
        let mut stats = SensorStats::default();
        for v in 0..10 {
            stats.record(v as f64);
        }
        // (0 + 1 + ... + 9) / 10
        assert!((stats.average() - 4.5).abs() < f64::EPSILON);

        // Eleventh write overwrites v0.
        stats.record(20.0);
        assert!((stats.average() - 6.5).abs() < f64::EPSILON);
    }

    #[test]
    fn partially_filled_window_averages_over_zero_slots() {
        let mut stats = SensorStats::default();
        stats.record(10.0);
        // Documented limitation: zeros in unwritten slots dilute the mean.
        assert!((stats.average() - 1.0).abs() < f64::EPSILON);
        assert_eq!(stats.count, 1);
    }

    #[test]
    fn adc_map_covers_native_range() {
        assert_eq!(adc_to_percent(0, 4095), 0.0);
        assert_eq!(adc_to_percent(4095, 4095), 100.0);
        assert_eq!(adc_to_percent(0, 0), 0.0);
    }
}
