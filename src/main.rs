//! Process bootstrap: config, listeners, fan-out, relay engine.

use anyhow::Context;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};

use gateproxy::codec::ClearCodec;
use gateproxy::relay::RelayEngine;
use gateproxy::{config, fanout};

/// Sized for bursts where one socket read decodes into many packets.
const MIRROR_LANE_CAPACITY: usize = 512;
const COMMAND_LANE_CAPACITY: usize = 64;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // install global collector configured based on RUST_LOG env var.
    tracing_subscriber::fmt::init();

    let config = config::load_or_create()?;

    let client_listener = TcpListener::bind(config.client_listen_addr())
        .await
        .with_context(|| format!("failed to bind {}", config.client_listen_addr()))?;
    let observer_listener = TcpListener::bind(config.observer_listen_addr())
        .await
        .with_context(|| format!("failed to bind {}", config.observer_listen_addr()))?;

    ::tracing::info!("redirect the game client to 127.0.0.1:{}", config.client_bind);
    ::tracing::info!("redirect the bot to 127.0.0.1:{}", config.observer_bind);

    let (mirror_tx, mirror_rx) = mpsc::channel(MIRROR_LANE_CAPACITY);
    let (command_tx, command_rx) = mpsc::channel(COMMAND_LANE_CAPACITY);
    tokio::spawn(fanout::run(observer_listener, mirror_rx, command_tx));

    let engine = RelayEngine::new(
        &config,
        client_listener,
        mirror_tx,
        command_rx,
        ClearCodec::factory,
    )?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            ::tracing::info!("shutdown requested");
            let _ = shutdown_tx.send(true);
        }
    });

    engine.run(shutdown_rx).await
}
