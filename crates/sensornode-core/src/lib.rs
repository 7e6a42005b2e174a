pub mod agent;
pub mod config;
pub mod link;
pub mod mqtt;
pub mod sensor;
pub mod telemetry;
pub mod transport;

pub use agent::{Agent, DisplaySink, TickReport};
pub use config::{DeviceIdentity, NodeConfig, PublishPolicy};
pub use link::{ConnectivityManager, ConnectivityState};
pub use mqtt::{MqttTransport, MqttTransportConfig};
pub use sensor::{
    GpsFix, RawReading, Reading, ReadingStatus, SensorBank, SensorError, SensorKind,
    SensorSnapshot, SensorSource, SensorSpec, SensorStats,
};
pub use transport::{InboundMessage, MessageTransport, PublishQos, TransportError};
