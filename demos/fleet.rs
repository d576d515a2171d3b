/**
 * Fleet Listener
 *
 * Loads a JSON array of device descriptors, registers them all with a
 * Manager and prints the merged event stream.
 *
 * Usage: cargo run --example fleet -- devices.json
 */
use tokio_stream::StreamExt;
use tuya_lan::{ClientConfig, DeviceDescriptor, EventKind, Manager};

#[tokio::main]
async fn main() -> tuya_lan::error::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let path = std::env::args().nth(1).unwrap_or_else(|| "devices.json".to_string());
    let text = std::fs::read_to_string(&path)?;
    let entries: Vec<serde_json::Value> = serde_json::from_str(&text)?;

    Manager::maximize_fd_limit()?;
    let manager = Manager::new();
    let stream = manager.stream();
    tokio::pin!(stream);

    for entry in entries {
        let descriptor = match DeviceDescriptor::from_json(&entry.to_string()) {
            Ok(d) => d,
            Err(e) => {
                println!("Skipping {}: {}", entry, e);
                continue;
            }
        };
        if let Err(e) = manager.add(descriptor, ClientConfig::default()).await {
            println!("Could not add device: {}", e);
        }
    }
    println!("--- Listening to {} devices ---", manager.len().await);

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = stream.next() => match event {
                Some(event) if event.kind == EventKind::Connected => {
                    if let Some(client) = manager.get(&event.device_id).await {
                        let _ = client.status().await;
                    }
                    println!("{}", event.to_json());
                }
                Some(event) => println!("{}", event.to_json()),
                None => break,
            },
        }
    }

    manager.shutdown().await;
    Ok(())
}
