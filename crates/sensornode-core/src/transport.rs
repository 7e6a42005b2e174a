use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishQos {
    AtMostOnce,
    AtLeastOnce,
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("link down")]
    LinkDown,
    #[error("session down")]
    SessionDown,
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("publish failed: {0}")]
    Publish(String),
    #[error("transport error: {0}")]
    Other(String),
}

#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

#[derive(Debug)]
pub enum TransportEvent {
    Message(InboundMessage),
    SessionLost,
    LinkLost,
}

/// The messaging transport behind the connectivity manager. Implementations
/// must never block beyond a short bounded duration outside `connect_link`;
/// the scheduler loop calls `drain` every iteration.
#[async_trait]
pub trait MessageTransport: Send {
    /// One attempt to bring the underlying link up. Startup may call this
    /// in a blocking retry; steady-state callers are debounced.
    async fn connect_link(&mut self) -> Result<(), TransportError>;

    fn link_up(&self) -> bool;

    /// One attempt at the session handshake: subscribe to the given topics.
    async fn connect_session(&mut self, subscriptions: &[String]) -> Result<(), TransportError>;

    /// One send attempt, no internal retry.
    async fn publish(
        &mut self,
        topic: &str,
        payload: Vec<u8>,
        qos: PublishQos,
        retain: bool,
    ) -> Result<(), TransportError>;

    /// Service the transport: flush outbound, collect inbound and loss
    /// events. Bounded-time.
    async fn drain(&mut self) -> Vec<TransportEvent>;
}

#[cfg(test)]
pub(crate) mod fake {
    use std::collections::VecDeque;

    use super::*;

    #[derive(Debug, Clone)]
    pub struct PublishedRecord {
        pub topic: String,
        pub payload: Vec<u8>,
        pub qos: PublishQos,
        pub retain: bool,
    }

    /// Scriptable in-memory transport for connectivity and scheduler tests.
    #[derive(Default)]
    pub struct FakeTransport {
        pub link_up: bool,
        pub session_up: bool,
        pub link_failures_remaining: u32,
        pub session_failures_remaining: u32,
        pub fail_publish: bool,
        pub link_attempts: u32,
        pub session_attempts: u32,
        pub subscriptions: Vec<String>,
        pub published: Vec<PublishedRecord>,
        pub events: VecDeque<TransportEvent>,
    }

    impl FakeTransport {
        pub fn push_inbound(&mut self, topic: &str, payload: &[u8]) {
            self.events.push_back(TransportEvent::Message(InboundMessage {
                topic: topic.to_string(),
                payload: payload.to_vec(),
            }));
        }
    }

    #[async_trait]
    impl MessageTransport for FakeTransport {
        async fn connect_link(&mut self) -> Result<(), TransportError> {
            self.link_attempts += 1;
            if self.link_failures_remaining > 0 {
                self.link_failures_remaining -= 1;
                return Err(TransportError::Connect("link refused".to_string()));
            }
            self.link_up = true;
            Ok(())
        }

        fn link_up(&self) -> bool {
            self.link_up
        }

        async fn connect_session(
            &mut self,
            subscriptions: &[String],
        ) -> Result<(), TransportError> {
            self.session_attempts += 1;
            if !self.link_up {
                return Err(TransportError::LinkDown);
            }
            if self.session_failures_remaining > 0 {
                self.session_failures_remaining -= 1;
                return Err(TransportError::Connect("session refused".to_string()));
            }
            self.session_up = true;
            self.subscriptions = subscriptions.to_vec();
            Ok(())
        }

        async fn publish(
            &mut self,
            topic: &str,
            payload: Vec<u8>,
            qos: PublishQos,
            retain: bool,
        ) -> Result<(), TransportError> {
            if self.fail_publish {
                return Err(TransportError::Publish("broker gone".to_string()));
            }
            self.published.push(PublishedRecord {
                topic: topic.to_string(),
                payload,
                qos,
                retain,
            });
            Ok(())
        }

        async fn drain(&mut self) -> Vec<TransportEvent> {
            let mut events = Vec::new();
            while let Some(ev) = self.events.pop_front() {
                match &ev {
                    TransportEvent::SessionLost => self.session_up = false,
                    TransportEvent::LinkLost => {
                        self.session_up = false;
                        self.link_up = false;
                    }
                    TransportEvent::Message(_) => {}
                }
                events.push(ev);
            }
            events
        }
    }
}
