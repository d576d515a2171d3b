//! Connection events and their delivery.
//!
//! Events fan out two ways: a tokio broadcast channel for async consumers and
//! an observer registry for synchronous callbacks. Callbacks run on the
//! client task and must not block.

use crate::error::{TuyaError, get_error_message};
use crate::protocol::Frame;
use log::debug;
use parking_lot::RwLock;
use serde_json::{Value, json};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::broadcast;

pub const DEFAULT_EVENT_CAPACITY: usize = 32;

const ERR_CODE: &str = "Err";
const ERR_MSG: &str = "Error";
const PAYLOAD_STR: &str = "payload_str";
const PAYLOAD_RAW: &str = "payload_raw";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Connected,
    Disconnected,
    ConnectionError,
    ConnectionErrorWithinRetry,
    MessageReceived,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Connected => "CONNECTED",
            EventKind::Disconnected => "DISCONNECTED",
            EventKind::ConnectionError => "CONNECTION_ERROR",
            EventKind::ConnectionErrorWithinRetry => "CONNECTION_ERROR_WITHIN_RETRY",
            EventKind::MessageReceived => "MESSAGE_RECEIVED",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One observable connection event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientEvent {
    pub device_id: String,
    pub kind: EventKind,
    /// Set for `MessageReceived`
    pub frame: Option<Frame>,
    /// Set for the two error kinds
    pub error: Option<TuyaError>,
}

impl ClientEvent {
    pub fn new(device_id: &str, kind: EventKind) -> Self {
        Self {
            device_id: device_id.to_string(),
            kind,
            frame: None,
            error: None,
        }
    }

    pub fn message(device_id: &str, frame: Frame) -> Self {
        Self {
            frame: Some(frame),
            ..Self::new(device_id, EventKind::MessageReceived)
        }
    }

    pub fn failure(device_id: &str, kind: EventKind, error: TuyaError) -> Self {
        Self {
            error: Some(error),
            ..Self::new(device_id, kind)
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(
            self.kind,
            EventKind::ConnectionError | EventKind::ConnectionErrorWithinRetry
        )
    }

    /// Flatten into a JSON object.
    ///
    /// Errors use the `Err`/`Error` code-and-message pair; a frame payload is
    /// inlined when it is JSON and hex-encoded otherwise.
    pub fn to_json(&self) -> Value {
        let mut out = json!({
            "id": self.device_id,
            "event": self.kind.as_str(),
        });

        if let Some(err) = &self.error {
            let code = err.code();
            out[ERR_MSG] = get_error_message(code).into();
            out[ERR_CODE] = code.to_string().into();
            out[PAYLOAD_STR] = err.to_string().into();
        }

        if let Some(frame) = &self.frame {
            out["seqno"] = frame.seqno.into();
            out["cmd"] = format!("{:?}", frame.cmd).into();
            if let Some(rc) = frame.retcode {
                out["retcode"] = rc.into();
            }
            match frame.payload_json() {
                Ok(Value::Object(obj)) => {
                    if let Some(map) = out.as_object_mut() {
                        map.extend(obj);
                    }
                }
                Ok(other) => out["payload"] = other,
                Err(_) if frame.payload.is_empty() => {}
                Err(_) => out[PAYLOAD_RAW] = hex::encode(&frame.payload).into(),
            }
        }
        out
    }
}

pub type SubscriptionId = u64;

type Handler = Arc<dyn Fn(&ClientEvent) + Send + Sync>;

struct Observer {
    id: SubscriptionId,
    kind: Option<EventKind>,
    handler: Handler,
}

/// Delivers events to broadcast subscribers and registered observers.
pub struct EventHub {
    tx: broadcast::Sender<ClientEvent>,
    observers: RwLock<Vec<Observer>>,
    next_id: AtomicU64,
}

impl EventHub {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            tx,
            observers: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Receiver for every event emitted from now on. Drop it to unsubscribe.
    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.tx.subscribe()
    }

    /// Call `handler` for each event of `kind`.
    pub fn on<F>(&self, kind: EventKind, handler: F) -> SubscriptionId
    where
        F: Fn(&ClientEvent) + Send + Sync + 'static,
    {
        self.register(Some(kind), Arc::new(handler))
    }

    /// Call `handler` for every event.
    pub fn on_any<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(&ClientEvent) + Send + Sync + 'static,
    {
        self.register(None, Arc::new(handler))
    }

    fn register(&self, kind: Option<EventKind>, handler: Handler) -> SubscriptionId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.observers.write().push(Observer { id, kind, handler });
        id
    }

    /// Remove an observer. Returns false if `id` was not registered.
    pub fn off(&self, id: SubscriptionId) -> bool {
        let mut observers = self.observers.write();
        let before = observers.len();
        observers.retain(|o| o.id != id);
        observers.len() != before
    }

    pub fn emit(&self, event: ClientEvent) {
        debug!("Event {} for {}", event.kind, event.device_id);

        // Handlers may call `off`, so they run without the lock held.
        let handlers: Vec<Handler> = self
            .observers
            .read()
            .iter()
            .filter(|o| o.kind.is_none_or(|k| k == event.kind))
            .map(|o| o.handler.clone())
            .collect();
        for handler in handlers {
            handler(&event);
        }

        let _ = self.tx.send(event);
    }
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::CommandKind;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_observers_filter_by_kind_and_unsubscribe() {
        let hub = EventHub::default();
        let hits = Arc::new(AtomicUsize::new(0));

        let counter = hits.clone();
        let id = hub.on(EventKind::Connected, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        hub.emit(ClientEvent::new("dev", EventKind::Connected));
        hub.emit(ClientEvent::new("dev", EventKind::Disconnected));
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        assert!(hub.off(id));
        assert!(!hub.off(id));
        hub.emit(ClientEvent::new("dev", EventKind::Connected));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_broadcast_subscribers_receive_events() {
        let hub = EventHub::default();
        let mut rx = hub.subscribe();
        hub.emit(ClientEvent::failure(
            "dev",
            EventKind::ConnectionError,
            TuyaError::Timeout,
        ));
        let event = rx.recv().await.unwrap();
        assert!(event.is_error());
        assert_eq!(event.error, Some(TuyaError::Timeout));
    }

    #[test]
    fn test_to_json() {
        let err = ClientEvent::failure("dev", EventKind::ConnectionError, TuyaError::Timeout);
        let value = err.to_json();
        assert_eq!(value["event"], "CONNECTION_ERROR");
        assert_eq!(value["Err"], "902");
        assert_eq!(value["Error"], "Timeout Waiting for Device");

        let frame = Frame::new(CommandKind::Status, 3, "{\"dps\":{\"1\":true}}").with_retcode(0);
        let value = ClientEvent::message("dev", frame).to_json();
        assert_eq!(value["dps"]["1"], true);
        assert_eq!(value["cmd"], "Status");

        let binary = Frame::new(CommandKind::Status, 3, vec![0xff, 0x01]);
        let value = ClientEvent::message("dev", binary).to_json();
        assert_eq!(value["payload_raw"], "ff01");
    }
}
