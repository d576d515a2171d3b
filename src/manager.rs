//! High-level management of multiple Tuya devices.
//! Provides a merged event stream and system-level tuning (FD limit).

use crate::client::{Client, ConnectionStatus};
use crate::config::{ClientConfig, DeviceDescriptor};
use crate::error::{Result, TuyaError};
use crate::event::{ClientEvent, DEFAULT_EVENT_CAPACITY};
use futures_util::Stream;
use log::{debug, info, warn};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{RwLock, broadcast};
use tokio_util::sync::CancellationToken;

struct Managed {
    client: Client,
    token: CancellationToken,
}

struct ManagerInner {
    devices: RwLock<HashMap<String, Managed>>,
    event_tx: broadcast::Sender<ClientEvent>,
    cancel_token: CancellationToken,
}

/// A registry of device clients keyed by device id.
///
/// Every client's events are forwarded into one stream.
#[derive(Clone)]
pub struct Manager {
    inner: Arc<ManagerInner>,
}

impl Default for Manager {
    fn default() -> Self {
        Self::new()
    }
}

impl Manager {
    /// Maximizes the file descriptor limit for the current process.
    ///
    /// Useful with thousands of devices on Unix-like systems. Does nothing elsewhere.
    pub fn maximize_fd_limit() -> Result<()> {
        #[cfg(unix)]
        {
            let (soft, hard) = rlimit::getrlimit(rlimit::Resource::NOFILE)
                .map_err(|e| TuyaError::Io(format!("Failed to get rlimit: {}", e)))?;

            if soft < hard {
                rlimit::setrlimit(rlimit::Resource::NOFILE, hard, hard)
                    .map_err(|e| TuyaError::Io(format!("Failed to set rlimit: {}", e)))?;
                info!("File descriptor limit increased from {} to {}", soft, hard);
            }
        }
        Ok(())
    }

    pub fn new() -> Self {
        let (event_tx, _) = broadcast::channel(DEFAULT_EVENT_CAPACITY * 4);
        Self {
            inner: Arc::new(ManagerInner {
                devices: RwLock::new(HashMap::new()),
                event_tx,
                cancel_token: CancellationToken::new(),
            }),
        }
    }

    /// Events from all managed devices.
    pub fn stream(&self) -> impl Stream<Item = ClientEvent> + Send + 'static {
        let mut rx = self.inner.event_tx.subscribe();
        async_stream::stream! {
            loop {
                match rx.recv().await {
                    Ok(event) => yield event,
                    Err(broadcast::error::RecvError::Closed) => break,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("Manager stream lagged, {} events skipped", n);
                        continue;
                    }
                }
            }
        }
    }

    /// Create, register and start a client.
    ///
    /// Fails with `DuplicateDevice` if the id is already managed.
    pub async fn add(&self, descriptor: DeviceDescriptor, config: ClientConfig) -> Result<Client> {
        let mut devices = self.inner.devices.write().await;
        if devices.contains_key(&descriptor.id) {
            return Err(TuyaError::DuplicateDevice(descriptor.id));
        }

        let client = Client::new(descriptor, config)?;
        let token = self.inner.cancel_token.child_token();
        // Subscribe before starting so the first CONNECTED is not missed.
        self.spawn_forwarder(&client, token.clone());
        if let Err(e) = client.start() {
            token.cancel();
            return Err(e);
        }

        info!("Device {} added to manager", client.id());
        devices.insert(
            client.id().to_string(),
            Managed {
                client: client.clone(),
                token,
            },
        );
        Ok(client)
    }

    fn spawn_forwarder(&self, client: &Client, token: CancellationToken) {
        let mut rx = client.subscribe();
        let event_tx = self.inner.event_tx.clone();
        let device_id = client.id().to_string();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    res = rx.recv() => match res {
                        Ok(event) => {
                            let _ = event_tx.send(event);
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            warn!("Forwarding for {} lagged, {} events skipped", device_id, n);
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
            debug!("Event forwarding for {} stopped", device_id);
        });
    }

    /// Stop a client and forget it.
    pub async fn remove(&self, id: &str) -> Result<()> {
        let managed = self
            .inner
            .devices
            .write()
            .await
            .remove(id)
            .ok_or_else(|| TuyaError::DeviceNotFound(id.to_string()))?;

        managed.token.cancel();
        managed.client.stop().await;
        info!("Device {} removed from manager", id);
        Ok(())
    }

    pub async fn get(&self, id: &str) -> Option<Client> {
        self.inner
            .devices
            .read()
            .await
            .get(id)
            .map(|m| m.client.clone())
    }

    /// Device id -> current connection status (no network traffic).
    pub async fn list(&self) -> HashMap<String, ConnectionStatus> {
        self.inner
            .devices
            .read()
            .await
            .iter()
            .map(|(id, m)| (id.clone(), m.client.connection_status()))
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.inner.devices.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.devices.read().await.is_empty()
    }

    /// Stop every client and clear the registry.
    pub async fn shutdown(&self) {
        self.inner.cancel_token.cancel();
        let drained: Vec<Managed> = self
            .inner
            .devices
            .write()
            .await
            .drain()
            .map(|(_, m)| m)
            .collect();

        for managed in drained {
            managed.client.stop().await;
        }
        info!("Manager shut down");
    }
}

impl Drop for ManagerInner {
    fn drop(&mut self) {
        self.cancel_token.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventKind;
    use crate::protocol::Version;
    use futures_util::StreamExt;
    use std::time::Duration;

    async fn unused_port() -> u16 {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    }

    fn descriptor(id: &str, port: u16) -> DeviceDescriptor {
        let mut d = DeviceDescriptor::new(id, "127.0.0.1", "0123456789abcdef", Version::V3_3);
        d.port = Some(port);
        d
    }

    #[tokio::test]
    async fn test_add_remove_and_duplicates() {
        let manager = Manager::new();
        let port = unused_port().await;

        manager.add(descriptor("a", port), ClientConfig::default()).await.unwrap();
        assert_eq!(
            manager
                .add(descriptor("a", port), ClientConfig::default())
                .await
                .unwrap_err(),
            TuyaError::DuplicateDevice("a".into())
        );
        assert!(manager.get("a").await.is_some());
        assert_eq!(manager.list().await.len(), 1);

        manager.remove("a").await.unwrap();
        assert!(manager.is_empty().await);
        assert_eq!(
            manager.remove("a").await,
            Err(TuyaError::DeviceNotFound("a".into()))
        );
    }

    #[tokio::test]
    async fn test_stream_merges_client_events() {
        let manager = Manager::new();
        let stream = manager.stream();
        tokio::pin!(stream);

        let port = unused_port().await;
        manager.add(descriptor("b", port), ClientConfig::default()).await.unwrap();

        let event = tokio::time::timeout(Duration::from_secs(5), stream.next())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.device_id, "b");
        assert_eq!(event.kind, EventKind::ConnectionError);

        manager.shutdown().await;
        assert!(manager.is_empty().await);
    }
}
