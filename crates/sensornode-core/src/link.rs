use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::transport::{InboundMessage, MessageTransport, PublishQos, TransportEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivityState {
    Disconnected,
    LinkUp,
    SessionUp,
}

impl ConnectivityState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectivityState::Disconnected => "disconnected",
            ConnectivityState::LinkUp => "link_up",
            ConnectivityState::SessionUp => "session_up",
        }
    }
}

/// Where an inbound topic is dispatched. Exact-topic matching against the
/// fixed handler set; everything else is diagnosed and dropped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    ControlLed,
    ConfigCalibration,
    ConfigSensor,
    DiscoverDevice,
    DiscoverBroadcast,
    Unknown,
}

pub fn classify(device_id: &str, topic: &str) -> Route {
    if topic == format!("devices/{device_id}/control/led") {
        Route::ControlLed
    } else if topic == format!("devices/{device_id}/config/calibration") {
        Route::ConfigCalibration
    } else if topic == format!("devices/{device_id}/config/sensors") {
        Route::ConfigSensor
    } else if topic == format!("devices/{device_id}/discover") {
        Route::DiscoverDevice
    } else if topic == crate::telemetry::BROADCAST_DISCOVER_TOPIC {
        Route::DiscoverBroadcast
    } else {
        Route::Unknown
    }
}

/// Owns the link/session lifecycle and the only mutable connectivity state.
/// Detected losses demote the state here; actual reconnection happens on a
/// later `ensure_connected` call, debounced by the reconnect interval.
pub struct ConnectivityManager<T: MessageTransport> {
    transport: T,
    state: ConnectivityState,
    subscriptions: Vec<String>,
    reconnect_interval: Duration,
    last_attempt: Option<Instant>,
    session_established: bool,
    publishes_ok: u64,
    publishes_err: u64,
    sessions_established: u64,
}

impl<T: MessageTransport> ConnectivityManager<T> {
    pub fn new(transport: T, subscriptions: Vec<String>, reconnect_interval: Duration) -> Self {
        Self {
            transport,
            state: ConnectivityState::Disconnected,
            subscriptions,
            reconnect_interval,
            last_attempt: None,
            session_established: false,
            publishes_ok: 0,
            publishes_err: 0,
            sessions_established: 0,
        }
    }

    pub fn state(&self) -> ConnectivityState {
        self.state
    }

    #[cfg(test)]
    pub(crate) fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn publish_counts(&self) -> (u64, u64) {
        (self.publishes_ok, self.publishes_err)
    }

    /// Total sessions brought up over the process lifetime. The first
    /// connection counts; subtract one for the number of recoveries.
    pub fn sessions_established(&self) -> u64 {
        self.sessions_established
    }

    /// True exactly once per newly established session; entry into
    /// `SessionUp` owes the broker one discovery announcement.
    pub fn take_session_established(&mut self) -> bool {
        std::mem::take(&mut self.session_established)
    }

    /// Drive the state toward `SessionUp`: at most one link attempt and one
    /// session attempt per call, and no attempt at all until the reconnect
    /// interval has elapsed since the previous one.
    pub async fn ensure_connected(&mut self, now: Instant) -> ConnectivityState {
        if self.state == ConnectivityState::SessionUp {
            return self.state;
        }

        if let Some(last) = self.last_attempt {
            if now.duration_since(last) < self.reconnect_interval {
                return self.state;
            }
        }
        self.last_attempt = Some(now);

        if self.state == ConnectivityState::Disconnected {
            match self.transport.connect_link().await {
                Ok(()) => {
                    info!("link up");
                    self.state = ConnectivityState::LinkUp;
                }
                Err(err) => {
                    warn!(error = %err, "link attempt failed");
                    return self.state;
                }
            }
        }

        if self.state == ConnectivityState::LinkUp {
            match self.transport.connect_session(&self.subscriptions).await {
                Ok(()) => {
                    info!(subscriptions = self.subscriptions.len(), "session up");
                    self.state = ConnectivityState::SessionUp;
                    self.session_established = true;
                    self.sessions_established += 1;
                }
                Err(err) => {
                    warn!(error = %err, "session attempt failed");
                    if !self.transport.link_up() {
                        self.state = ConnectivityState::Disconnected;
                    }
                }
            }
        }

        self.state
    }

    /// One send attempt. Failures are logged and reported; the next
    /// scheduled interval is the retry.
    pub async fn publish(
        &mut self,
        topic: &str,
        payload: Vec<u8>,
        qos: PublishQos,
        retain: bool,
    ) -> bool {
        if self.state != ConnectivityState::SessionUp {
            debug!(topic, "publish skipped while not connected");
            return false;
        }

        match self.transport.publish(topic, payload, qos, retain).await {
            Ok(()) => {
                self.publishes_ok += 1;
                true
            }
            Err(err) => {
                warn!(topic, error = %err, "publish failed");
                self.publishes_err += 1;
                false
            }
        }
    }

    /// Service the transport and collect inbound messages. Loss events
    /// demote the state one level at a time.
    pub async fn drain(&mut self) -> Vec<InboundMessage> {
        let mut inbound = Vec::new();
        for event in self.transport.drain().await {
            match event {
                TransportEvent::Message(msg) => inbound.push(msg),
                TransportEvent::SessionLost => {
                    if self.state == ConnectivityState::SessionUp {
                        warn!("session lost");
                        self.state = ConnectivityState::LinkUp;
                    }
                }
                TransportEvent::LinkLost => {
                    if self.state != ConnectivityState::Disconnected {
                        warn!("link lost");
                        self.state = ConnectivityState::Disconnected;
                    }
                }
            }
        }
        inbound
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::subscriptions;
    use crate::transport::fake::FakeTransport;
    use crate::transport::TransportEvent;

    const RECONNECT: Duration = Duration::from_millis(5000);

    fn manager(transport: FakeTransport) -> ConnectivityManager<FakeTransport> {
        ConnectivityManager::new(transport, subscriptions("ESP32-DEV-001"), RECONNECT)
    }

    fn transport(mgr: &ConnectivityManager<FakeTransport>) -> &FakeTransport {
        &mgr.transport
    }

    #[tokio::test]
    async fn link_up_is_always_the_intermediate_state() {
        let mut mgr = manager(FakeTransport {
            session_failures_remaining: 1,
            ..FakeTransport::default()
        });
        let t0 = Instant::now();

        // Link succeeds, session refused: must stop at LinkUp, never jump
        // from Disconnected to SessionUp.
        assert_eq!(mgr.ensure_connected(t0).await, ConnectivityState::LinkUp);
        assert_eq!(
            mgr.ensure_connected(t0 + RECONNECT).await,
            ConnectivityState::SessionUp
        );
    }

    #[tokio::test]
    async fn reconnect_attempts_are_debounced() {
        let mut mgr = manager(FakeTransport {
            link_failures_remaining: u32::MAX,
            ..FakeTransport::default()
        });
        let t0 = Instant::now();

        mgr.ensure_connected(t0).await;
        mgr.ensure_connected(t0 + Duration::from_millis(100)).await;
        mgr.ensure_connected(t0 + Duration::from_millis(4900)).await;
        assert_eq!(transport(&mgr).link_attempts, 1, "attempts inside the interval are swallowed");

        mgr.ensure_connected(t0 + RECONNECT).await;
        assert_eq!(transport(&mgr).link_attempts, 2);
    }

    #[tokio::test]
    async fn session_establishment_is_reported_once() {
        let mut mgr = manager(FakeTransport::default());
        let t0 = Instant::now();

        mgr.ensure_connected(t0).await;
        assert!(mgr.take_session_established());
        assert!(!mgr.take_session_established());

        mgr.ensure_connected(t0 + RECONNECT).await;
        assert!(!mgr.take_session_established(), "steady state sets no new flag");
    }

    #[tokio::test]
    async fn loss_events_demote_one_level_at_a_time() {
        let mut mgr = manager(FakeTransport::default());
        mgr.ensure_connected(Instant::now()).await;
        assert_eq!(mgr.state(), ConnectivityState::SessionUp);

        mgr.transport.events.push_back(TransportEvent::SessionLost);
        mgr.drain().await;
        assert_eq!(mgr.state(), ConnectivityState::LinkUp);

        mgr.transport.events.push_back(TransportEvent::LinkLost);
        mgr.drain().await;
        assert_eq!(mgr.state(), ConnectivityState::Disconnected);
    }

    #[tokio::test]
    async fn publish_failure_is_reported_and_not_retried() {
        let mut mgr = manager(FakeTransport {
            fail_publish: true,
            ..FakeTransport::default()
        });
        mgr.ensure_connected(Instant::now()).await;
        assert_eq!(mgr.state(), ConnectivityState::SessionUp);

        let sent = mgr
            .publish("devices/ESP32-DEV-001/data", b"{}".to_vec(), PublishQos::AtMostOnce, false)
            .await;
        assert!(!sent);
        assert_eq!(mgr.publish_counts(), (0, 1));
        // One attempt only; the next scheduled interval is the retry.
        assert!(transport(&mgr).published.is_empty());
        assert_eq!(mgr.state(), ConnectivityState::SessionUp, "a failed send does not demote");
    }

    #[tokio::test]
    async fn session_counter_includes_the_first_connection() {
        let mut mgr = manager(FakeTransport::default());
        let t0 = Instant::now();

        mgr.ensure_connected(t0).await;
        assert_eq!(mgr.sessions_established(), 1);

        mgr.transport.events.push_back(TransportEvent::SessionLost);
        mgr.drain().await;
        mgr.ensure_connected(t0 + RECONNECT).await;
        assert_eq!(mgr.sessions_established(), 2, "one initial connect plus one recovery");
    }

    #[tokio::test]
    async fn publish_is_refused_while_disconnected() {
        let mut mgr = manager(FakeTransport::default());
        let sent = mgr
            .publish("devices/ESP32-DEV-001/data", b"{}".to_vec(), PublishQos::AtMostOnce, false)
            .await;
        assert!(!sent);
        assert!(transport(&mgr).published.is_empty());
    }

    #[test]
    fn classification_is_exact_topic_match() {
        let id = "ESP32-DEV-001";
        assert_eq!(classify(id, "devices/ESP32-DEV-001/control/led"), Route::ControlLed);
        assert_eq!(
            classify(id, "devices/ESP32-DEV-001/config/calibration"),
            Route::ConfigCalibration
        );
        assert_eq!(classify(id, "devices/ESP32-DEV-001/config/sensors"), Route::ConfigSensor);
        assert_eq!(classify(id, "devices/ESP32-DEV-001/discover"), Route::DiscoverDevice);
        assert_eq!(classify(id, "devices/discover/all"), Route::DiscoverBroadcast);
        assert_eq!(classify(id, "devices/OTHER/discover"), Route::Unknown);
        assert_eq!(classify(id, "devices/ESP32-DEV-001/control/led/extra"), Route::Unknown);
    }
}
