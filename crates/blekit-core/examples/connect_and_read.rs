//! Example: Connect to a peripheral and read its battery level
//!
//! Set the BLEKIT_DEVICE environment variable to the device identifier
//! (a MAC address on Linux/Windows, a CoreBluetooth UUID on macOS):
//! `BLEKIT_DEVICE="AA:BB:CC:DD:EE:FF" cargo run --example connect_and_read`

use std::time::Duration;

use blekit_core::{BleSession, BtleplugBackend};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt::init();

    let device_id = std::env::var("BLEKIT_DEVICE")
        .map_err(|_| "set BLEKIT_DEVICE to the identifier of the target device")?;

    let backend = BtleplugBackend::new().await?;
    let session = BleSession::new(backend);

    println!("Looking for {device_id}...");
    session
        .find_and_connect(&device_id, Duration::from_secs(30))
        .await?;
    println!("Connected.");

    session.discover_services(&device_id).await?;
    let services = session.services(&device_id).await?;
    println!("Services:");
    for service in &services {
        println!("  {}", service.uuid);
        for characteristic in session
            .characteristics(&device_id, &service.uuid.to_string())
            .await?
        {
            println!("    {}", characteristic.uuid);
        }
    }

    // Battery level, if the device exposes it
    match session.read_characteristic(&device_id, "180f", "2a19").await {
        Ok(value) if !value.is_empty() => println!("Battery: {}%", value[0]),
        Ok(_) => println!("Battery characteristic returned no data"),
        Err(err) => println!("No battery reading: {err}"),
    }

    session.disconnect(&device_id).await?;
    println!("Disconnected.");
    Ok(())
}
