use async_trait::async_trait;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use sensornode_core::sensor::{GpsFix, RawReading, SensorError, SensorKind, SensorSource};

/// Simulated hardware: values wander around a baseline, the temperature and
/// humidity probe occasionally drops a cycle the way a flaky DHT does, and
/// the GPS reports a slow drift around a fixed point.
pub struct SimulatedSensors {
    rng: SmallRng,
    temperature: f64,
    humidity: f64,
    light: f64,
    potentiometer: u16,
    latitude: f64,
    longitude: f64,
    /// Probability per sample that the climate probe fails a read.
    dropout: f64,
}

impl SimulatedSensors {
    pub fn new() -> Self {
        Self {
            rng: SmallRng::from_entropy(),
            temperature: 22.5,
            humidity: 48.0,
            light: 55.0,
            potentiometer: 2048,
            latitude: -23.5505,
            longitude: -46.6333,
            dropout: 0.03,
        }
    }

    fn wander(&mut self, value: f64, step: f64, lo: f64, hi: f64) -> f64 {
        let delta = self.rng.gen_range(-step..=step);
        (value + delta).clamp(lo, hi)
    }
}

impl Default for SimulatedSensors {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SensorSource for SimulatedSensors {
    fn kinds(&self) -> Vec<SensorKind> {
        vec![
            SensorKind::Temperature,
            SensorKind::Humidity,
            SensorKind::Light,
            SensorKind::Potentiometer,
            SensorKind::WifiSignal,
            SensorKind::Battery,
        ]
    }

    async fn sample(&mut self, kind: SensorKind) -> Result<RawReading, SensorError> {
        match kind {
            SensorKind::Temperature => {
                if self.rng.gen_bool(self.dropout) {
                    return Err(SensorError::Checksum);
                }
                self.temperature = self.wander(self.temperature, 0.2, 15.0, 35.0);
                Ok(RawReading::Physical(self.temperature))
            }
            SensorKind::Humidity => {
                if self.rng.gen_bool(self.dropout) {
                    return Err(SensorError::Timeout);
                }
                self.humidity = self.wander(self.humidity, 0.5, 20.0, 90.0);
                Ok(RawReading::Physical(self.humidity))
            }
            SensorKind::Light => {
                self.light = self.wander(self.light, 2.0, 0.0, 100.0);
                Ok(RawReading::Analog {
                    counts: (self.light / 100.0 * 4095.0) as u16,
                    full_scale: 4095,
                })
            }
            SensorKind::Potentiometer => {
                let delta = self.rng.gen_range(-40i32..=40);
                self.potentiometer =
                    (self.potentiometer as i32 + delta).clamp(0, 4095) as u16;
                Ok(RawReading::Analog {
                    counts: self.potentiometer,
                    full_scale: 4095,
                })
            }
            SensorKind::WifiSignal => {
                Ok(RawReading::Physical(self.rng.gen_range(-75.0..=-45.0)))
            }
            SensorKind::Battery => Ok(RawReading::Physical(self.rng.gen_range(92.0..=100.0))),
            SensorKind::GpsFix => Err(SensorError::NotAttached),
        }
    }

    async fn gps(&mut self) -> Option<GpsFix> {
        self.latitude += self.rng.gen_range(-0.00005..=0.00005);
        self.longitude += self.rng.gen_range(-0.00005..=0.00005);
        Some(GpsFix {
            latitude: self.latitude,
            longitude: self.longitude,
            altitude_m: 760.0 + self.rng.gen_range(-2.0..=2.0),
            speed_kmh: 0.0,
            satellites: self.rng.gen_range(6..=11),
            valid: true,
        })
    }
}
