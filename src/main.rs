// src/main.rs
//
// =============================================================================
// SUNBENCH: MEASUREMENT SERVER ENTRY POINT
// =============================================================================
//
// Boots the dispatch engine on an in-process broker and bridges it to
// stdio, one JSON line per message:
//
//   stdin:  {"topic": "measurement/run", "payload": {...}, "retain": false}
//   stdout: every message the broker carries, same shape.
//
// Key Features:
// - Last wills mark the bench Offline with no live devices.
// - Ctrl-C stops a running job (teardown included) before exiting.

use anyhow::{Context, Result};
use clap::Parser;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use sunbench::bus::{topics, OutgoingMessage};
use sunbench::{Bus, InstrumentFactory, LocalBus, Server, ServerSettings, Status};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

// ============================================================================
// 1. CLI DEFINITION
// ============================================================================

#[derive(Parser)]
#[command(
    name = "sunbench",
    version,
    about = "Measurement server for photovoltaic test benches"
)]
struct Cli {
    /// Broker host. Only logged: the binary runs on the in-process
    /// LocalBus until a broker-backed `Bus` exists.
    #[arg(long)]
    mqtthost: Option<String>,

    /// Broker port. Only logged, like `--mqtthost`.
    #[arg(long)]
    port: Option<u16>,

    /// Log at debug level.
    #[arg(long)]
    debug: bool,

    /// YAML settings file.
    #[arg(long)]
    config: Option<PathBuf>,
}

#[derive(Serialize, Deserialize)]
struct Line {
    topic: String,
    payload: Value,
    #[serde(default)]
    retain: bool,
}

// ============================================================================
// 2. ENTRY POINT
// ============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    sunbench::logs::init(cli.debug);

    let mut settings = match &cli.config {
        Some(path) => ServerSettings::from_yaml_file(path)?,
        None => ServerSettings::default(),
    };
    if let Some(host) = cli.mqtthost {
        settings.mqtthost = host;
    }
    if let Some(port) = cli.port {
        settings.port = port;
    }

    let broker = LocalBus::new();
    let client_id = settings.client_id();
    let wills = vec![
        OutgoingMessage::json(topics::STATUS, &Status::Offline, true)?,
        OutgoingMessage::json(topics::LIVE_DEVICES, &Vec::<String>::new(), true)?,
    ];
    let session = Arc::new(broker.connect(&client_id, wills));

    let echo = tokio::spawn(echo_to_stdout(broker.clone()));
    let server = Server::start(session.clone(), InstrumentFactory::simulated(), settings.clone())
        .await
        .context("Starting measurement server")?;
    log::info!(
        "{} connected! (broker {}:{})",
        client_id,
        settings.mqtthost,
        settings.port
    );

    tokio::select! {
        res = read_stdin(broker.clone()) => res?,
        _ = tokio::signal::ctrl_c() => log::info!("Interrupted"),
    }

    server.shutdown().await;
    // A clean exit discards the wills
    session.disconnect();
    echo.abort();
    Ok(())
}

// ============================================================================
// 3. STDIO BRIDGE
// ============================================================================

async fn read_stdin(bus: LocalBus) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<Line>(&line) {
            Ok(msg) => {
                let out = OutgoingMessage::json(msg.topic, &msg.payload, msg.retain)?;
                bus.publish(out).await?;
            }
            Err(e) => log::warn!("Ignoring stdin line: {}", e),
        }
    }
    log::info!("stdin closed");
    Ok(())
}

async fn echo_to_stdout(bus: LocalBus) -> Result<()> {
    let mut sub = bus.subscribe("#").await?;
    let mut stdout = tokio::io::stdout();
    while let Some(delivery) = sub.recv().await {
        let payload = delivery
            .json()
            .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&delivery.payload).into()));
        let line = Line {
            topic: delivery.topic,
            payload,
            retain: delivery.retained,
        };
        let mut text = serde_json::to_string(&line)?;
        text.push('\n');
        stdout.write_all(text.as_bytes()).await?;
        stdout.flush().await?;
    }
    Ok(())
}
