use std::time::{Duration, Instant};

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::config::{DeviceIdentity, NodeConfig};
use crate::link::{classify, ConnectivityManager, ConnectivityState, Route};
use crate::sensor::{SensorBank, SensorSnapshot, SensorSource};
use crate::telemetry;
use crate::transport::{InboundMessage, MessageTransport, PublishQos};

/// Local presentation refreshed from loop step 6 on its own interval.
pub trait DisplaySink: Send {
    fn render(&mut self, snapshot: Option<&SensorSnapshot>, state: ConnectivityState);
}

/// What one loop iteration did; consumed by logging and tests.
#[derive(Debug, Clone, Copy)]
pub struct TickReport {
    pub state: ConnectivityState,
    pub inbound: usize,
    pub published_data: bool,
    pub published_status: bool,
    pub published_heartbeat: bool,
    pub published_discovery: bool,
}

/// Uniform random delay before answering a broadcast discovery request, so
/// that many devices sharing the broadcast topic do not respond at once.
pub fn jitter_delay(min: Duration, max: Duration, rng: &mut impl Rng) -> Duration {
    if max <= min {
        return min;
    }
    let span = (max - min).as_millis() as u64;
    min + Duration::from_millis(rng.gen_range(0..=span))
}

#[derive(Debug, Default)]
struct ScheduleState {
    last_data: Option<Instant>,
    last_heartbeat: Option<Instant>,
    last_discovery: Option<Instant>,
    last_display: Option<Instant>,
}

/// "Has at least `interval` elapsed since the last fire?" A slow iteration
/// delays the next eligible fire, never skips ahead.
fn due(slot: &mut Option<Instant>, interval: Duration, now: Instant) -> bool {
    let fire = slot.map_or(true, |last| now.duration_since(last) >= interval);
    if fire {
        *slot = Some(now);
    }
    fire
}

/// The single-threaded cooperative loop: drain inbound, drive connectivity,
/// then fire the interval-gated publishes in fixed order.
pub struct Agent<S: SensorSource, T: MessageTransport> {
    identity: DeviceIdentity,
    config: NodeConfig,
    bank: SensorBank,
    source: S,
    link: ConnectivityManager<T>,
    schedule: ScheduleState,
    started: Instant,
    pending_discovery: Option<Instant>,
    led_on: bool,
    display: Option<Box<dyn DisplaySink>>,
    rng: SmallRng,
}

impl<S: SensorSource, T: MessageTransport> Agent<S, T> {
    pub fn new(
        identity: DeviceIdentity,
        config: NodeConfig,
        bank: SensorBank,
        source: S,
        transport: T,
    ) -> Self {
        let subscriptions = telemetry::subscriptions(&identity.id);
        let link = ConnectivityManager::new(transport, subscriptions, config.reconnect_interval);
        Self {
            identity,
            config,
            bank,
            source,
            link,
            schedule: ScheduleState::default(),
            started: Instant::now(),
            pending_discovery: None,
            led_on: false,
            display: None,
            rng: SmallRng::from_entropy(),
        }
    }

    pub fn with_display(mut self, display: Box<dyn DisplaySink>) -> Self {
        self.display = Some(display);
        self
    }

    pub fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    pub fn bank(&self) -> &SensorBank {
        &self.bank
    }

    pub fn state(&self) -> ConnectivityState {
        self.link.state()
    }

    pub fn led_on(&self) -> bool {
        self.led_on
    }

    fn uptime_s(&self, now: Instant) -> u64 {
        now.duration_since(self.started).as_secs()
    }

    /// One loop iteration, in the fixed order: service transport and route
    /// inbound, drive connectivity, then data/status, heartbeat, discovery,
    /// display — each gated by its own elapsed-interval check.
    pub async fn tick(&mut self, now: Instant) -> TickReport {
        let inbound = self.link.drain().await;
        let inbound_count = inbound.len();
        for msg in inbound {
            self.route_inbound(msg, now).await;
        }

        let state = self.link.ensure_connected(now).await;

        let mut report = TickReport {
            state,
            inbound: inbound_count,
            published_data: false,
            published_status: false,
            published_heartbeat: false,
            published_discovery: false,
        };

        if state != ConnectivityState::SessionUp {
            self.refresh_display(now, state);
            return report;
        }

        // A freshly established session owes the broker one announcement.
        if self.link.take_session_established() {
            report.published_discovery = self.publish_discovery().await;
            self.schedule.last_discovery = Some(now);
        }

        if due(&mut self.schedule.last_data, self.config.data_interval, now) {
            let snapshot = self.bank.read_all(&mut self.source).await;

            let data = telemetry::data_message(&self.identity, &snapshot, &self.bank);
            report.published_data = self
                .publish_json(
                    &telemetry::data_topic(&self.identity.id),
                    &data,
                    self.config.publish.data_qos,
                    false,
                )
                .await;

            let status = telemetry::status_message(
                &self.identity,
                state,
                self.uptime_s(now),
                Some(&snapshot),
                &self.bank,
            );
            report.published_status = self
                .publish_json(
                    &telemetry::status_topic(&self.identity.id),
                    &status,
                    self.config.publish.status_qos,
                    self.config.publish.status_retain,
                )
                .await;

            if let Some(fix) = snapshot.gps.as_ref() {
                let gps = telemetry::gps_message(&self.identity, fix);
                self.publish_json(
                    &telemetry::gps_topic(&self.identity.id),
                    &gps,
                    self.config.publish.gps_qos,
                    false,
                )
                .await;
            }
        }

        if due(
            &mut self.schedule.last_heartbeat,
            self.config.heartbeat_interval,
            now,
        ) {
            let heartbeat = telemetry::heartbeat_message(&self.identity, self.uptime_s(now));
            report.published_heartbeat = self
                .publish_json(
                    &telemetry::heartbeat_topic(&self.identity.id),
                    &heartbeat,
                    PublishQos::AtMostOnce,
                    false,
                )
                .await;
        }

        let jitter_ready = self
            .pending_discovery
            .map(|deadline| now >= deadline)
            .unwrap_or(false);
        if jitter_ready
            || due(
                &mut self.schedule.last_discovery,
                self.config.discovery_interval,
                now,
            )
        {
            self.pending_discovery = None;
            self.schedule.last_discovery = Some(now);
            // Discovery carries a capability+current-value snapshot.
            self.bank.read_all(&mut self.source).await;
            report.published_discovery |= self.publish_discovery().await;
        }

        self.refresh_display(now, state);
        report
    }

    fn refresh_display(&mut self, now: Instant, state: ConnectivityState) {
        if self.display.is_none() {
            return;
        }
        if due(
            &mut self.schedule.last_display,
            self.config.display_interval,
            now,
        ) {
            let snapshot = self.bank.last_snapshot();
            if let Some(display) = self.display.as_mut() {
                display.render(snapshot, state);
            }
        }
    }

    async fn route_inbound(&mut self, msg: InboundMessage, now: Instant) {
        match classify(&self.identity.id, &msg.topic) {
            Route::ControlLed => self.handle_led(&msg.payload).await,
            Route::ConfigCalibration => self.handle_calibration(&msg.payload),
            Route::ConfigSensor => self.handle_sensor_config(&msg.payload),
            Route::DiscoverDevice => {
                // Device-scoped requests answer immediately, no jitter.
                info!("discovery requested for this device");
                self.bank.read_all(&mut self.source).await;
                self.publish_discovery().await;
            }
            Route::DiscoverBroadcast => {
                let delay = jitter_delay(self.config.jitter_min, self.config.jitter_max, &mut self.rng);
                let deadline = now + delay;
                // Keep the earliest deadline if a request is already queued.
                let deadline = match self.pending_discovery {
                    Some(existing) if existing <= deadline => existing,
                    _ => deadline,
                };
                info!(delay_ms = delay.as_millis() as u64, "broadcast discovery requested");
                self.pending_discovery = Some(deadline);
            }
            Route::Unknown => {
                debug!(topic = %msg.topic, "unhandled inbound topic");
            }
        }
    }

    async fn handle_led(&mut self, payload: &[u8]) {
        let parsed: Result<Value, _> = serde_json::from_slice(payload);
        let state = parsed
            .ok()
            .and_then(|v| v.get("state").and_then(|s| s.as_str().map(str::to_string)));

        match state.as_deref() {
            Some("on") | Some("off") => {
                self.led_on = state.as_deref() == Some("on");
                info!(led_on = self.led_on, "led control applied");
                let ack = telemetry::control_response(
                    &self.identity,
                    "led",
                    true,
                    if self.led_on { "on" } else { "off" },
                );
                self.publish_json(
                    &telemetry::control_response_topic(&self.identity.id),
                    &ack,
                    PublishQos::AtMostOnce,
                    false,
                )
                .await;
            }
            _ => warn!("malformed led control payload, ignored"),
        }
    }

    fn handle_calibration(&mut self, payload: &[u8]) {
        let parsed: Result<Value, _> = serde_json::from_slice(payload);
        let Ok(value) = parsed else {
            warn!("malformed calibration payload, ignored");
            return;
        };
        let (Some(sensor_id), Some(offset)) = (
            value.get("sensor_id").and_then(|v| v.as_str()),
            value.get("offset").and_then(|v| v.as_f64()),
        ) else {
            warn!("calibration payload missing sensor_id/offset, ignored");
            return;
        };

        if self.bank.set_calibration_by_id(sensor_id, offset) {
            info!(sensor_id, offset, "calibration offset updated");
        } else {
            warn!(sensor_id, "calibration update for unknown sensor, ignored");
        }
    }

    fn handle_sensor_config(&mut self, payload: &[u8]) {
        let parsed: Result<Value, _> = serde_json::from_slice(payload);
        let Ok(value) = parsed else {
            warn!("malformed sensor config payload, ignored");
            return;
        };
        let (Some(sensor_id), Some(enabled)) = (
            value.get("sensor_id").and_then(|v| v.as_str()),
            value.get("enabled").and_then(|v| v.as_bool()),
        ) else {
            warn!("sensor config payload missing sensor_id/enabled, ignored");
            return;
        };

        if self.bank.set_active_by_id(sensor_id, enabled) {
            info!(sensor_id, enabled, "sensor config updated");
        } else {
            warn!(sensor_id, "sensor config for unknown sensor, ignored");
        }
    }

    async fn publish_discovery(&mut self) -> bool {
        let manifest =
            telemetry::discovery_message(&self.identity, &self.bank, self.bank.last_snapshot());
        self.publish_json(
            &telemetry::discovery_response_topic(&self.identity.id),
            &manifest,
            self.config.publish.discovery_qos,
            self.config.publish.discovery_retain,
        )
        .await
    }

    async fn publish_json(
        &mut self,
        topic: &str,
        body: &Value,
        qos: PublishQos,
        retain: bool,
    ) -> bool {
        match serde_json::to_vec(body) {
            Ok(payload) => self.link.publish(topic, payload, qos, retain).await,
            Err(err) => {
                warn!(topic, error = %err, "message encoding failed");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use rand::rngs::SmallRng;
    use rand::SeedableRng;

    use super::*;
    use crate::sensor::{RawReading, SensorError, SensorKind};
    use crate::transport::fake::FakeTransport;

    struct FixedSource;

    #[async_trait]
    impl SensorSource for FixedSource {
        fn kinds(&self) -> Vec<SensorKind> {
            vec![SensorKind::Temperature, SensorKind::Humidity]
        }

        async fn sample(&mut self, kind: SensorKind) -> Result<RawReading, SensorError> {
            match kind {
                SensorKind::Temperature => Ok(RawReading::Physical(23.4)),
                SensorKind::Humidity => Ok(RawReading::Physical(45.0)),
                _ => Err(SensorError::NotAttached),
            }
        }
    }

    fn agent(transport: FakeTransport) -> Agent<FixedSource, FakeTransport> {
        Agent::new(
            DeviceIdentity::new("ESP32-DEV-001", "Bench Node"),
            NodeConfig::default(),
            SensorBank::standard(),
            FixedSource,
            transport,
        )
    }

    fn published_topics(agent: &mut Agent<FixedSource, FakeTransport>) -> Vec<String> {
        agent
            .link
            .transport_mut()
            .published
            .iter()
            .map(|p| p.topic.clone())
            .collect()
    }

    #[tokio::test]
    async fn nothing_is_published_while_disconnected() {
        let mut a = agent(FakeTransport {
            link_failures_remaining: u32::MAX,
            ..FakeTransport::default()
        });

        let report = a.tick(Instant::now()).await;
        assert_eq!(report.state, ConnectivityState::Disconnected);
        assert!(!report.published_data);
        assert!(published_topics(&mut a).is_empty());
    }

    #[tokio::test]
    async fn first_connected_tick_announces_then_publishes_data_and_status() {
        let mut a = agent(FakeTransport::default());
        let t0 = Instant::now();

        let report = a.tick(t0).await;
        assert_eq!(report.state, ConnectivityState::SessionUp);
        assert!(report.published_discovery, "session entry announces discovery");
        assert!(report.published_data);
        assert!(report.published_status);

        let topics = published_topics(&mut a);
        assert_eq!(topics[0], "devices/ESP32-DEV-001/discovery/response");
        assert!(topics.contains(&"devices/ESP32-DEV-001/data".to_string()));
        assert!(topics.contains(&"devices/ESP32-DEV-001/status".to_string()));
    }

    #[tokio::test]
    async fn data_publish_respects_its_interval() {
        let mut a = agent(FakeTransport::default());
        let t0 = Instant::now();

        a.tick(t0).await;
        let before = published_topics(&mut a).len();

        let report = a.tick(t0 + Duration::from_millis(500)).await;
        assert!(!report.published_data, "interval not yet elapsed");
        assert_eq!(published_topics(&mut a).len(), before);

        let report = a.tick(t0 + Duration::from_millis(2000)).await;
        assert!(report.published_data);
    }

    #[tokio::test]
    async fn device_scoped_discovery_answers_immediately() {
        let mut a = agent(FakeTransport::default());
        let t0 = Instant::now();
        a.tick(t0).await;

        a.link
            .transport_mut()
            .push_inbound("devices/ESP32-DEV-001/discover", b"{}");
        a.tick(t0 + Duration::from_millis(100)).await;

        let discoveries = published_topics(&mut a)
            .iter()
            .filter(|t| t.ends_with("/discovery/response"))
            .count();
        assert_eq!(discoveries, 2, "announcement plus the immediate response");
        assert!(a.pending_discovery.is_none());
    }

    #[tokio::test]
    async fn broadcast_discovery_is_jittered_within_the_configured_range() {
        let mut a = agent(FakeTransport::default());
        let t0 = Instant::now();
        a.tick(t0).await;

        let t1 = t0 + Duration::from_millis(100);
        a.link.transport_mut().push_inbound("devices/discover/all", b"{}");
        a.tick(t1).await;

        let deadline = a.pending_discovery.expect("jittered response queued");
        let delay = deadline.duration_since(t1);
        assert!(delay >= Duration::from_millis(100), "delay {delay:?} below jitter floor");
        assert!(delay <= Duration::from_millis(1000), "delay {delay:?} above jitter ceiling");

        let before = published_topics(&mut a)
            .iter()
            .filter(|t| t.ends_with("/discovery/response"))
            .count();
        assert_eq!(before, 1, "no response before the jitter deadline");

        let report = a.tick(t1 + Duration::from_millis(1000)).await;
        assert!(report.published_discovery);
        assert!(a.pending_discovery.is_none());
    }

    #[tokio::test]
    async fn malformed_config_payload_changes_nothing() {
        let mut a = agent(FakeTransport::default());
        let t0 = Instant::now();
        a.tick(t0).await;

        a.link
            .transport_mut()
            .push_inbound("devices/ESP32-DEV-001/config/calibration", b"not json");
        a.link
            .transport_mut()
            .push_inbound("devices/ESP32-DEV-001/config/calibration", b"{\"offset\": 3.0}");
        a.tick(t0 + Duration::from_millis(100)).await;

        let spec = a.bank.spec_by_id("temp_01").expect("registered sensor");
        assert_eq!(spec.calibration_offset, 0.0);
    }

    #[tokio::test]
    async fn calibration_update_applies_to_the_named_sensor() {
        let mut a = agent(FakeTransport::default());
        let t0 = Instant::now();
        a.tick(t0).await;

        a.link.transport_mut().push_inbound(
            "devices/ESP32-DEV-001/config/calibration",
            br#"{"sensor_id": "temp_01", "offset": 1.5}"#,
        );
        a.tick(t0 + Duration::from_millis(100)).await;

        let spec = a.bank.spec_by_id("temp_01").expect("registered sensor");
        assert_eq!(spec.calibration_offset, 1.5);
    }

    #[tokio::test]
    async fn led_control_toggles_state_and_acks() {
        let mut a = agent(FakeTransport::default());
        let t0 = Instant::now();
        a.tick(t0).await;

        a.link.transport_mut().push_inbound(
            "devices/ESP32-DEV-001/control/led",
            br#"{"state": "on"}"#,
        );
        a.tick(t0 + Duration::from_millis(100)).await;

        assert!(a.led_on());
        assert!(published_topics(&mut a)
            .contains(&"devices/ESP32-DEV-001/control/response".to_string()));
    }

    #[test]
    fn jitter_delay_stays_in_range() {
        let mut rng = SmallRng::seed_from_u64(7);
        let min = Duration::from_millis(100);
        let max = Duration::from_millis(1000);
        for _ in 0..1000 {
            let d = jitter_delay(min, max, &mut rng);
            assert!(d >= min && d <= max);
        }
        // Degenerate range collapses to the floor.
        assert_eq!(jitter_delay(min, min, &mut rng), min);
    }
}
