use std::collections::VecDeque;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use rumqttc::{AsyncClient, ConnectReturnCode, Event, EventLoop, LastWill, MqttOptions, Packet, QoS};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::transport::{
    InboundMessage, MessageTransport, PublishQos, TransportError, TransportEvent,
};

const CONNACK_TIMEOUT: Duration = Duration::from_secs(10);
const DRAIN_BUDGET: Duration = Duration::from_millis(50);
const POLL_SLICE: Duration = Duration::from_millis(10);

#[derive(Debug, Clone)]
pub struct MqttTransportConfig {
    pub broker_host: String,
    pub broker_port: u16,
    pub client_id: String,
    pub keep_alive: Duration,
    /// Retained "offline" marker the broker publishes if we vanish.
    pub lwt_topic: Option<String>,
}

/// `MessageTransport` over rumqttc. The broker CONNACK stands in for the
/// firmware's radio association (link), completed subscriptions for the
/// messaging session.
pub struct MqttTransport {
    config: MqttTransportConfig,
    conn: Option<(AsyncClient, EventLoop)>,
    link_up: bool,
    pending: VecDeque<TransportEvent>,
}

impl MqttTransport {
    pub fn new(config: MqttTransportConfig) -> Self {
        Self {
            config,
            conn: None,
            link_up: false,
            pending: VecDeque::new(),
        }
    }

}

fn to_qos(qos: PublishQos) -> QoS {
    match qos {
        PublishQos::AtMostOnce => QoS::AtMostOnce,
        PublishQos::AtLeastOnce => QoS::AtLeastOnce,
    }
}

#[async_trait]
impl MessageTransport for MqttTransport {
    async fn connect_link(&mut self) -> Result<(), TransportError> {
        let mut options = MqttOptions::new(
            &self.config.client_id,
            &self.config.broker_host,
            self.config.broker_port,
        );
        options.set_keep_alive(self.config.keep_alive);
        if let Some(topic) = &self.config.lwt_topic {
            options.set_last_will(LastWill::new(
                topic,
                b"offline".to_vec(),
                QoS::AtLeastOnce,
                true,
            ));
        }

        let (client, mut eventloop) = AsyncClient::new(options, 32);

        let connack = timeout(CONNACK_TIMEOUT, async {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                        if ack.code == ConnectReturnCode::Success {
                            return Ok(());
                        }
                        return Err(TransportError::Connect(format!(
                            "broker refused connection: {:?}",
                            ack.code
                        )));
                    }
                    Ok(_) => {}
                    Err(err) => return Err(TransportError::Connect(err.to_string())),
                }
            }
        })
        .await;

        match connack {
            Ok(Ok(())) => {
                info!(
                    broker = %self.config.broker_host,
                    port = self.config.broker_port,
                    "connected to broker"
                );
                self.conn = Some((client, eventloop));
                self.link_up = true;
                Ok(())
            }
            Ok(Err(err)) => Err(err),
            Err(_) => Err(TransportError::Connect(
                "timed out waiting for connack".to_string(),
            )),
        }
    }

    fn link_up(&self) -> bool {
        self.link_up
    }

    async fn connect_session(&mut self, subscriptions: &[String]) -> Result<(), TransportError> {
        let Some((client, eventloop)) = self.conn.as_mut() else {
            return Err(TransportError::LinkDown);
        };

        for topic in subscriptions {
            client
                .subscribe(topic, QoS::AtLeastOnce)
                .await
                .map_err(|err| TransportError::Connect(err.to_string()))?;
        }

        // Wait for the suback flight; inbound traffic seen along the way is
        // queued for the next drain.
        let mut acked = 0;
        let mut seen = Vec::new();
        let mut failure: Option<String> = None;
        let deadline = Instant::now() + CONNACK_TIMEOUT;
        while acked < subscriptions.len() && Instant::now() < deadline {
            match timeout(Duration::from_millis(100), eventloop.poll()).await {
                Ok(Ok(Event::Incoming(Packet::SubAck(_)))) => acked += 1,
                Ok(Ok(Event::Incoming(Packet::Publish(publish)))) => {
                    seen.push(TransportEvent::Message(InboundMessage {
                        topic: publish.topic,
                        payload: publish.payload.to_vec(),
                    }));
                }
                Ok(Ok(_)) => {}
                Ok(Err(err)) => {
                    failure = Some(err.to_string());
                    break;
                }
                Err(_) => {}
            }
        }
        self.pending.extend(seen);

        if let Some(err) = failure {
            self.conn = None;
            self.link_up = false;
            self.pending.push_back(TransportEvent::LinkLost);
            return Err(TransportError::Connect(err));
        }
        if acked < subscriptions.len() {
            return Err(TransportError::Connect(format!(
                "only {acked}/{} subscriptions acknowledged",
                subscriptions.len()
            )));
        }
        Ok(())
    }

    async fn publish(
        &mut self,
        topic: &str,
        payload: Vec<u8>,
        qos: PublishQos,
        retain: bool,
    ) -> Result<(), TransportError> {
        let Some((client, _)) = self.conn.as_ref() else {
            return Err(TransportError::LinkDown);
        };
        client
            .publish(topic, to_qos(qos), retain, payload)
            .await
            .map_err(|err| TransportError::Publish(err.to_string()))
    }

    async fn drain(&mut self) -> Vec<TransportEvent> {
        let mut events: Vec<TransportEvent> = self.pending.drain(..).collect();
        let Some((_, eventloop)) = self.conn.as_mut() else {
            return events;
        };

        let mut lost = false;
        let deadline = Instant::now() + DRAIN_BUDGET;
        while Instant::now() < deadline {
            match timeout(POLL_SLICE, eventloop.poll()).await {
                Ok(Ok(Event::Incoming(Packet::Publish(publish)))) => {
                    debug!(topic = %publish.topic, "inbound message");
                    events.push(TransportEvent::Message(InboundMessage {
                        topic: publish.topic,
                        payload: publish.payload.to_vec(),
                    }));
                }
                Ok(Ok(Event::Incoming(Packet::Disconnect))) => {
                    warn!("broker sent disconnect");
                    events.push(TransportEvent::SessionLost);
                }
                Ok(Ok(_)) => {}
                Ok(Err(err)) => {
                    warn!(error = %err, "event loop error, dropping connection");
                    lost = true;
                    break;
                }
                // Nothing ready inside the slice; stay bounded.
                Err(_) => break,
            }
        }

        if lost {
            self.conn = None;
            self.link_up = false;
            events.push(TransportEvent::LinkLost);
        }
        events
    }
}
