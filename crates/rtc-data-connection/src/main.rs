//! Loopback demo: two connections in one process
//!
//! Usage:
//!   rtc-loopback [--unreliable] [--mock] [--message TEXT] [--config PATH]
//!
//! The responder sends the message once its channel opens; the initiator
//! prints what it receives. Logging follows RUST_LOG, default
//! `rtc_data_connection=info`.

use anyhow::{bail, Context, Result};
use clap::Parser;
use rtc_data_connection::{
    Connection, ConnectionConfig, ConnectionEvent, LoopbackRelay, MockNetwork,
    PeerConnectionFactory, Role, WebRtcFactory,
};
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::info;

#[derive(Parser)]
#[command(name = "rtc-loopback")]
#[command(about = "Open a data channel between two local connections", long_about = None)]
struct Cli {
    /// Unordered, best-effort data channel
    #[arg(long)]
    unreliable: bool,

    /// Use the in-memory transport instead of WebRTC
    #[arg(long)]
    mock: bool,

    /// Message the responder sends once open
    #[arg(long, default_value = "hello, world!")]
    message: String,

    /// Connection config file (.toml or .json)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Give up if the channel is not open by then
    #[arg(long, default_value_t = 30)]
    timeout_secs: u64,
}

async fn wait_for_open(events: &mut UnboundedReceiver<ConnectionEvent>, name: &str) -> Result<()> {
    while let Some(event) = events.recv().await {
        match event {
            ConnectionEvent::Open => {
                println!("connected {}", name);
                return Ok(());
            }
            ConnectionEvent::Error(e) => bail!("{} failed: {}", name, e),
            _ => {}
        }
    }
    bail!("{} dropped its event stream", name)
}

async fn wait_for_message(events: &mut UnboundedReceiver<ConnectionEvent>) -> Result<String> {
    while let Some(event) = events.recv().await {
        if let ConnectionEvent::Message(msg) = event {
            return Ok(String::from_utf8_lossy(&msg.data).into_owned());
        }
    }
    bail!("event stream ended before a message arrived")
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("rtc_data_connection=info".parse()?),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => ConnectionConfig::load(path)?,
        None => ConnectionConfig::default(),
    };
    if cli.unreliable {
        config.reliable = false;
    }

    let factory: Box<dyn PeerConnectionFactory> = if cli.mock {
        Box::new(MockNetwork::new().factory())
    } else {
        Box::new(WebRtcFactory::new())
    };
    info!(
        "Starting loopback ({} transport, reliable: {})",
        if cli.mock { "mock" } else { "webrtc" },
        config.reliable
    );

    let d1 = Connection::new(Role::Initiator, config.clone(), factory.as_ref()).await?;
    let d2 = Connection::new(Role::Responder, config, factory.as_ref()).await?;
    let mut d1_events = d1.events();
    let mut d2_events = d2.events();

    let relay = LoopbackRelay::connect(&d1, &d2);
    d1.create_offer().await.context("Failed to create offer")?;

    let timeout = Duration::from_secs(cli.timeout_secs);
    tokio::time::timeout(timeout, async {
        wait_for_open(&mut d2_events, "2->1").await?;
        d2.send_text(cli.message.clone()).await?;
        wait_for_open(&mut d1_events, "1->2").await?;
        let received = wait_for_message(&mut d1_events).await?;
        println!("message from 2: {}", received);
        anyhow::Ok(())
    })
    .await
    .context("Timed out waiting for the data channel")??;

    drop(relay);
    d1.close().await?;
    d2.close().await?;
    println!("disconnected");

    Ok(())
}
