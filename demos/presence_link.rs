//! Link with the closest RootTap button and acknowledge its presses
//!
//! Run with: cargo run --example presence_link

use roottap_link::{
    ConnectionState, LinkConfig, PermissionGate, PlatformRadio, ReconnectPolicy, Result,
    ScanFilter, SessionOrchestrator,
};
use std::sync::Arc;
use std::time::Duration;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("roottap_link=info".parse().unwrap()),
        )
        .init();

    let radio = Arc::new(PlatformRadio::new().await?);
    let config = LinkConfig::default().with_reconnect(
        ReconnectPolicy::default()
            .with_max_attempts(10)
            .with_backoff(Duration::from_millis(500), Duration::from_secs(10), 2.0),
    );
    let session = SessionOrchestrator::new(radio, PermissionGate::granted_gate(), config);

    println!("Looking for a RootTap button...");
    session.start_scan(ScanFilter::roottap()).await?;

    let peer = loop {
        if let Some(peer) = session.peers_by_signal().into_iter().next() {
            break peer;
        }
        if let Some(error) = session.last_error() {
            println!("Scan failed: {}", error);
            session.shutdown().await;
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(250)).await;
    };

    println!("Linking with {} ({} dBm)", peer.address, peer.rssi);
    let mut events = session.subscribe();
    session.connect(peer.address.as_str()).await?;

    println!("Press the button. Ctrl+C to quit.\n");

    let mut stats_tick = tokio::time::interval(Duration::from_secs(5));

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                println!("\nInterrupted!");
                break;
            }
            event = events.recv() => {
                let Ok(event) = event else { break };
                println!("Link: {}", event.state);
                if event.state == ConnectionState::Disconnected && session.target().is_none() {
                    if let Some(error) = session.last_error() {
                        println!("Link lost: {}", error);
                    }
                    break;
                }
            }
            _ = stats_tick.tick() => {
                let stats = session.protocol_stats();
                println!(
                    "Presses: {} acknowledged, {} ignored, {} failed writes",
                    stats.acknowledged, stats.ignored, stats.write_failures
                );
            }
        }
    }

    session.shutdown().await;
    println!("Done!");

    Ok(())
}
