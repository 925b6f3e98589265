//! Example: Scanning for BLE peripherals
//!
//! Scans for ten seconds and prints every sighting the session delivers.
//! Pass service UUIDs as arguments to restrict the scan, e.g.
//! `cargo run --example scan_devices -- 180d 180f`
//!
//! Run with: `cargo run --example scan_devices`

use std::time::Duration;

use blekit_core::{BleSession, BtleplugBackend, ScanEvent, ScanFilter};
use tokio::time::timeout;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt::init();

    let services: Vec<String> = std::env::args().skip(1).collect();
    let filter = if services.is_empty() {
        ScanFilter::new()
    } else {
        ScanFilter::for_services(&services)?
    };

    let backend = BtleplugBackend::new().await?;
    let session = BleSession::new(backend);

    println!("Scanning for 10 seconds...");
    println!();

    let mut stream = session.start_scan(filter).await?;
    let deadline = Duration::from_secs(10);
    let mut count = 0usize;

    while let Ok(Some(event)) = timeout(deadline, stream.recv()).await {
        match event {
            ScanEvent::Sighting(record) => {
                count += 1;
                let name = record.name.as_deref().unwrap_or("Unknown");
                let rssi = record
                    .rssi()
                    .map(|r| format!("{r} dBm"))
                    .unwrap_or_else(|| "N/A".to_string());
                println!("  {} [{}]", name, record.id);
                println!("    RSSI: {rssi}");
                if let Some(services) = &record.advertisement.service_uuids {
                    for uuid in services {
                        println!("    Service: {uuid}");
                    }
                }
                println!();
            }
            ScanEvent::Failed(error) => {
                eprintln!("Scan failed: {error}");
                break;
            }
            _ => {}
        }
    }

    session.stop_scan().await?;
    println!("Scan complete. {count} sighting(s).");
    Ok(())
}
