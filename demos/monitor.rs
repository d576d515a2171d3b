/**
 * Single Device Monitor
 *
 * Connects to one device, queries its status, flips DP 1 and prints every
 * event as JSON until Ctrl-C.
 *
 * Usage: cargo run --example monitor -- '{"id":"...","ip":"192.168.1.20","version":"3.5","local_key":"..."}'
 */
use serde_json::json;
use tokio_stream::StreamExt;
use tuya_lan::{Client, ClientConfig, DeviceDescriptor};

#[tokio::main]
async fn main() -> tuya_lan::error::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let Some(arg) = std::env::args().nth(1) else {
        eprintln!("usage: monitor '<device descriptor JSON>'");
        return Ok(());
    };
    let descriptor = DeviceDescriptor::from_json(&arg)?;
    println!("--- Monitoring {} (v{}) ---", descriptor.id, descriptor.version);

    let client = Client::new(descriptor, ClientConfig::default())?;
    let stream = client.stream();
    tokio::pin!(stream);
    client.start()?;

    if let Err(e) = client.status().await {
        println!("Status request failed: {}", e);
    }
    if let Err(e) = client.set_dps(json!({"1": true})).await {
        println!("Control request failed: {}", e);
    }

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = stream.next() => match event {
                Some(event) => println!("{}", event.to_json()),
                None => break,
            },
        }
    }

    client.stop().await;
    println!("Done!");
    Ok(())
}
