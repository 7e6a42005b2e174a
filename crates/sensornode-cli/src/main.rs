use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use sensornode_core::sensor::SensorBank;
use sensornode_core::{
    Agent, ConnectivityState, DeviceIdentity, DisplaySink, MqttTransport, MqttTransportConfig,
    NodeConfig, PublishPolicy, PublishQos, SensorSnapshot,
};
use tokio::time::{interval_at, Instant};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

mod http;
mod sim;
mod viewer;

#[derive(Debug, Parser)]
#[command(name = "sensornoded")]
#[command(about = "Environmental sensor node daemon (MQTT push / HTTP pull)")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    #[arg(long, default_value = "localhost")]
    broker_host: String,

    #[arg(long, default_value_t = 1883)]
    broker_port: u16,

    #[arg(long, default_value = "ESP32-DEV-001")]
    device_id: String,

    #[arg(long, default_value = "Environmental Node")]
    device_name: String,

    #[arg(long, default_value_t = 2000)]
    data_interval_ms: u64,

    #[arg(long, default_value_t = 30)]
    heartbeat_interval_s: u64,

    #[arg(long, default_value_t = 300)]
    discovery_interval_s: u64,

    #[arg(long, default_value_t = 5000)]
    reconnect_interval_ms: u64,

    #[arg(long, default_value_t = 100)]
    jitter_min_ms: u64,

    #[arg(long, default_value_t = 1000)]
    jitter_max_ms: u64,

    #[arg(long, value_enum, default_value = "q0")]
    data_qos: Qos,

    #[arg(long, value_enum, default_value = "q1")]
    discovery_qos: Qos,

    /// Publish status messages without the retained flag.
    #[arg(long)]
    no_status_retain: bool,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Connect to the broker and publish telemetry until interrupted.
    Run {
        #[arg(long, value_enum, default_value = "human")]
        format: OutputFormat,
    },
    /// One read cycle, printed to stdout.
    Once {
        #[arg(long, value_enum, default_value = "json")]
        format: OutputFormat,
    },
    /// Serve readings over HTTP instead of pushing them.
    Serve {
        #[arg(long, default_value = "0.0.0.0:8080")]
        bind: String,
    },
    /// Live terminal dashboard on top of the running agent.
    View {
        #[arg(long, default_value_t = 180.0)]
        window_sec: f64,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum OutputFormat {
    Human,
    Json,
    Ndjson,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Qos {
    Q0,
    Q1,
}

impl From<Qos> for PublishQos {
    fn from(qos: Qos) -> Self {
        match qos {
            Qos::Q0 => PublishQos::AtMostOnce,
            Qos::Q1 => PublishQos::AtLeastOnce,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let cli = Cli::parse();

    let identity = DeviceIdentity::new(cli.device_id.clone(), cli.device_name.clone());
    let config = NodeConfig {
        data_interval: Duration::from_millis(cli.data_interval_ms),
        heartbeat_interval: Duration::from_secs(cli.heartbeat_interval_s),
        discovery_interval: Duration::from_secs(cli.discovery_interval_s),
        reconnect_interval: Duration::from_millis(cli.reconnect_interval_ms),
        display_interval: Duration::from_millis(500),
        jitter_min: Duration::from_millis(cli.jitter_min_ms),
        jitter_max: Duration::from_millis(cli.jitter_max_ms),
        publish: PublishPolicy {
            data_qos: cli.data_qos.into(),
            status_retain: !cli.no_status_retain,
            discovery_qos: cli.discovery_qos.into(),
            ..PublishPolicy::default()
        },
    };

    let transport = MqttTransport::new(MqttTransportConfig {
        broker_host: cli.broker_host.clone(),
        broker_port: cli.broker_port,
        client_id: identity.id.clone(),
        keep_alive: Duration::from_secs(30),
        lwt_topic: Some(sensornode_core::telemetry::status_topic(&identity.id)),
    });

    match cli.command {
        Command::Run { format } => {
            let mut agent = Agent::new(
                identity,
                config,
                SensorBank::standard(),
                sim::SimulatedSensors::new(),
                transport,
            );
            if matches!(format, OutputFormat::Human) {
                agent = agent.with_display(Box::new(ConsoleDisplay));
            }
            stream_loop(&mut agent, format).await?;
        }
        Command::Once { format } => {
            let mut bank = SensorBank::standard();
            let mut source = sim::SimulatedSensors::new();
            let snapshot = bank.read_all(&mut source).await;
            let message = sensornode_core::telemetry::data_message(&identity, &snapshot, &bank);
            match format {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&message)?),
                OutputFormat::Ndjson => println!("{}", serde_json::to_string(&message)?),
                OutputFormat::Human => print_snapshot(&snapshot),
            }
        }
        Command::Serve { bind } => {
            http::run_server(
                identity,
                SensorBank::standard(),
                sim::SimulatedSensors::new(),
                config.data_interval,
                &bind,
            )
            .await?;
        }
        Command::View { window_sec } => {
            let mut agent = Agent::new(
                identity,
                config,
                SensorBank::standard(),
                sim::SimulatedSensors::new(),
                transport,
            );
            viewer::run_viewer(&mut agent, Duration::from_millis(250), window_sec).await?;
        }
    }

    Ok(())
}

const LOOP_CADENCE: Duration = Duration::from_millis(100);

async fn stream_loop<S, T>(agent: &mut Agent<S, T>, format: OutputFormat) -> Result<()>
where
    S: sensornode_core::SensorSource,
    T: sensornode_core::MessageTransport,
{
    let start = Instant::now() + Duration::from_millis(50);
    let mut ticker = interval_at(start, LOOP_CADENCE);

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                warn!("received ctrl-c, stopping");
                break;
            }
            _ = ticker.tick() => {
                let report = agent.tick(std::time::Instant::now()).await;
                if report.published_data {
                    info!(
                        state = report.state.as_str(),
                        heartbeat = report.published_heartbeat,
                        discovery = report.published_discovery,
                        "published telemetry"
                    );
                    if matches!(format, OutputFormat::Ndjson) {
                        if let Some(snapshot) = agent.bank().last_snapshot() {
                            println!("{}", serde_json::to_string(snapshot)?);
                        }
                    }
                }
            }
        }
    }

    Ok(())
}

struct ConsoleDisplay;

impl DisplaySink for ConsoleDisplay {
    fn render(&mut self, snapshot: Option<&SensorSnapshot>, state: ConnectivityState) {
        let Some(snapshot) = snapshot else {
            println!("[{}] waiting for first read cycle", state.as_str());
            return;
        };
        let line = snapshot
            .readings
            .iter()
            .map(|(kind, reading)| match reading.value {
                Some(value) => format!("{}={:.1}{}", kind.as_str(), value, reading.unit),
                None => format!("{}=--", kind.as_str()),
            })
            .collect::<Vec<_>>()
            .join("  ");
        println!("[{}] {}", state.as_str(), line);
    }
}

fn print_snapshot(snapshot: &SensorSnapshot) {
    println!("=== Sensor Snapshot ===");
    println!("Time:  {}", snapshot.taken_at.to_rfc3339());
    for (kind, reading) in &snapshot.readings {
        match reading.value {
            Some(value) => println!(
                "{:<14} {:>8.2} {}  [{}]",
                kind.as_str(),
                value,
                reading.unit,
                match reading.status {
                    sensornode_core::sensor::ReadingStatus::Normal => "ok",
                    sensornode_core::sensor::ReadingStatus::Warning => "out of range",
                    sensornode_core::sensor::ReadingStatus::Invalid => "invalid",
                }
            ),
            None => println!(
                "{:<14} {:>8} {}  [{}]",
                kind.as_str(),
                "--",
                reading.unit,
                reading.error.as_deref().unwrap_or("invalid")
            ),
        }
    }
    if let Some(fix) = &snapshot.gps {
        println!(
            "gps            {:.5}, {:.5}  alt={:.0}m sats={} {}",
            fix.latitude,
            fix.longitude,
            fix.altitude_m,
            fix.satellites,
            if fix.valid { "fix" } else { "searching" }
        );
    }
}
