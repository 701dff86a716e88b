//! Walk through a full link lifecycle against the simulated radio
//!
//! Run with: cargo run --example simulated_session

use roottap_link::{
    LinkConfig, PermissionGate, ReconnectPolicy, Result, ScanFilter, SessionOrchestrator,
    SimPeripheral, SimulatedRadio,
};
use std::sync::Arc;
use std::time::Duration;

async fn pause() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("roottap_link=debug".parse().unwrap()),
        )
        .init();

    let radio = Arc::new(SimulatedRadio::with_peripheral(SimPeripheral::roottap(
        "5C:F3:70:00:00:01",
    )));
    let gate = PermissionGate::default();
    let session = SessionOrchestrator::new(
        radio.clone(),
        gate.clone(),
        LinkConfig::default().with_reconnect(ReconnectPolicy::default().with_max_attempts(3)),
    );

    // Scanning is refused until the host grants the radio permission
    if let Err(e) = session.start_scan(ScanFilter::roottap()).await {
        println!("Before permission: {}", e);
    }
    gate.grant();

    session.start_scan(ScanFilter::roottap()).await?;
    radio.advertise("5C:F3:70:00:00:02", Some("roottap-up"), -80);
    radio.advertise("11:22:33:44:55:66", Some("headphones"), -40);
    pause().await;

    for peer in session.peers_by_signal() {
        println!("Found {} ({} dBm)", peer.address, peer.rssi);
    }

    session.connect("5C:F3:70:00:00:01").await?;
    pause().await;
    println!(
        "State: {}, notifications armed: {}",
        session.state(),
        session.is_notify_ready()
    );

    for _ in 0..3 {
        radio.press();
        pause().await;
    }
    println!("Acknowledged {} presses", session.protocol_stats().acknowledged);

    println!("Dropping the link...");
    radio.drop_link();
    tokio::time::sleep(Duration::from_millis(500)).await;
    println!("State after reconnect: {}", session.state());

    session.disconnect();
    println!("State after disconnect: {}", session.state());

    session.shutdown().await;
    Ok(())
}
