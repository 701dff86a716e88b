//! Basic example: Discover nearby RootTap buttons
//!
//! Run with: cargo run --example discover_peers

use roottap_link::{PermissionGate, PlatformRadio, Result, ScanFilter, SessionOrchestrator};
use std::sync::Arc;
use std::time::Duration;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("roottap_link=debug".parse().unwrap()),
        )
        .init();

    println!("Starting RootTap discovery...");

    let radio = Arc::new(PlatformRadio::new().await?);
    let session =
        SessionOrchestrator::new(radio, PermissionGate::granted_gate(), Default::default());

    let mut sightings = session.subscribe_peers();
    session.start_scan(ScanFilter::roottap()).await?;

    println!("Scanning for 30 seconds...");
    println!("Press Ctrl+C to exit early.\n");

    let deadline = tokio::time::sleep(Duration::from_secs(30));
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            _ = &mut deadline => break,
            _ = tokio::signal::ctrl_c() => {
                println!("\nInterrupted!");
                break;
            }
            sighting = sightings.recv() => match sighting {
                Ok(peer) => println!("  {} {:?} ({} dBm)", peer.address, peer.name, peer.rssi),
                Err(_) => break,
            },
        }
    }

    println!("\n--- Scan Complete ---");
    if let Some(error) = session.last_error() {
        println!("Scan error: {}", error);
    }

    let peers = session.peers_by_signal();
    println!("Total buttons found: {}", peers.len());
    for peer in &peers {
        println!(
            "  {} - {} dBm (last seen {})",
            peer.address,
            peer.rssi,
            peer.last_seen.format("%H:%M:%S")
        );
    }

    session.shutdown().await;
    println!("\nDone!");

    Ok(())
}
