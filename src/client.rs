//! Connection manager for a single device.
//! Owns the socket, the command queue, heartbeats and the retry policy.
//!
//! All mutable connection state lives in one background task. Public calls
//! reach it over a channel, socket reads arrive from a per-connection reader
//! task, and heartbeats and scheduled retries are timers inside the same
//! `select!` loop, so no two of them ever touch the socket at once.

use crate::config::{ClientConfig, DeviceDescriptor};
use crate::error::{Result, TuyaError};
use crate::event::{ClientEvent, EventKind, EventHub, SubscriptionId};
use crate::negotiator::{generate_nonce, negotiate};
use crate::payload;
use crate::protocol::{CommandKind, Frame, FrameCodec, Version};
use crate::queue::{Admission, QueueItem};
use crate::state::{LinkState, RetryDecision};
use crate::transport::{connect_stream, read_frame, write_frame};
use futures_core::stream::Stream;
use futures_util::StreamExt;
use log::{debug, error, info, warn};
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval_at, sleep_until};
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_util::sync::CancellationToken;

/// Consecutive undecodable frames tolerated before the link is torn down.
const MAX_INVALID_FRAMES: u32 = 3;
const COMMAND_CHANNEL_CAPACITY: usize = 32;
const READER_CHANNEL_CAPACITY: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Handshaking,
    Connected,
    /// Waiting for a scheduled reconnect after a failure
    Retrying,
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

enum Command {
    Send {
        item: QueueItem,
        resp: oneshot::Sender<Result<()>>,
    },
}

/// State shared between the public handle and the background task.
struct Core {
    descriptor: DeviceDescriptor,
    config: ClientConfig,
    events: EventHub,
    status: RwLock<ConnectionStatus>,
    cancel: CancellationToken,
}

impl Core {
    fn set_status(&self, status: ConnectionStatus) {
        let mut current = self.status.write();
        if *current != status {
            debug!("Device {}: {} -> {}", self.descriptor.id, *current, status);
            *current = status;
        }
    }
}

#[derive(Default)]
struct Lifecycle {
    tx: Option<mpsc::Sender<Command>>,
    task: Option<JoinHandle<()>>,
    stopped: bool,
}

struct Inner {
    core: Arc<Core>,
    lifecycle: Mutex<Lifecycle>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.core.cancel.cancel();
    }
}

/// Asynchronous client for one Tuya device on the local network.
///
/// Cloning is cheap; all clones drive the same connection. Dropping the last
/// clone stops the background task.
#[derive(Clone)]
pub struct Client {
    inner: Arc<Inner>,
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("id", &self.id())
            .field("version", &self.version())
            .field("status", &self.connection_status())
            .finish()
    }
}

impl Client {
    /// Create a client. Nothing happens on the network until [`start`](Self::start).
    pub fn new(descriptor: DeviceDescriptor, config: ClientConfig) -> Result<Self> {
        descriptor.validate()?;
        let events = EventHub::new(config.event_capacity);
        let core = Core {
            descriptor,
            config,
            events,
            status: RwLock::new(ConnectionStatus::Disconnected),
            cancel: CancellationToken::new(),
        };
        Ok(Self {
            inner: Arc::new(Inner {
                core: Arc::new(core),
                lifecycle: Mutex::new(Lifecycle::default()),
            }),
        })
    }

    pub fn id(&self) -> &str {
        &self.inner.core.descriptor.id
    }

    pub fn version(&self) -> Version {
        self.inner.core.descriptor.version
    }

    pub fn descriptor(&self) -> &DeviceDescriptor {
        &self.inner.core.descriptor
    }

    pub fn connection_status(&self) -> ConnectionStatus {
        *self.inner.core.status.read()
    }

    pub fn is_online(&self) -> bool {
        self.connection_status() == ConnectionStatus::Connected
    }

    /// Spawn the background task and begin connecting.
    ///
    /// Calling it again while running does nothing. A stopped client cannot
    /// be restarted.
    pub fn start(&self) -> Result<()> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| TuyaError::Config(format!("start requires a tokio runtime: {}", e)))?;

        let mut lifecycle = self.inner.lifecycle.lock();
        if lifecycle.stopped {
            return Err(TuyaError::Stopped);
        }
        if lifecycle.task.is_some() {
            return Ok(());
        }

        let (tx, rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let worker = Worker::new(self.inner.core.clone(), rx);
        lifecycle.task = Some(runtime.spawn(worker.run()));
        lifecycle.tx = Some(tx);
        info!("Client for device {} started", self.id());
        Ok(())
    }

    /// Stop the background task and close the socket.
    ///
    /// Returns once the task has exited; nothing is written afterwards.
    pub async fn stop(&self) {
        let task = {
            let mut lifecycle = self.inner.lifecycle.lock();
            lifecycle.stopped = true;
            lifecycle.tx = None;
            lifecycle.task.take()
        };
        self.inner.core.cancel.cancel();

        if let Some(task) = task {
            info!("Stopping client for device {}", self.id());
            if let Err(e) = task.await {
                warn!("Client task for {} ended abnormally: {}", self.id(), e);
            }
        }
    }

    /// Queue a raw application payload.
    ///
    /// Resolves once the command is queued, not when the device answers;
    /// replies arrive as `MessageReceived` events.
    pub async fn send<P: Into<Vec<u8>>>(&self, payload: P, kind: CommandKind) -> Result<()> {
        self.send_item(QueueItem::new(kind, payload)).await
    }

    pub async fn send_item(&self, item: QueueItem) -> Result<()> {
        let tx = {
            let lifecycle = self.inner.lifecycle.lock();
            if lifecycle.stopped {
                return Err(TuyaError::Stopped);
            }
            lifecycle.tx.clone().ok_or(TuyaError::Offline)?
        };

        let (resp_tx, resp_rx) = oneshot::channel();
        tx.send(Command::Send {
            item,
            resp: resp_tx,
        })
        .await
        .map_err(|_| TuyaError::Stopped)?;
        resp_rx.await.map_err(|_| TuyaError::Stopped)?
    }

    /// Query all data points.
    pub async fn status(&self) -> Result<()> {
        let item = payload::dp_query(self.id(), self.version(), payload::timestamp())?;
        self.send_item(item).await
    }

    /// Write several data points, e.g. `json!({"1": true, "2": 50})`.
    pub async fn set_dps(&self, dps: Value) -> Result<()> {
        let item = payload::control(self.id(), self.version(), dps, payload::timestamp())?;
        self.send_item(item).await
    }

    pub async fn set_value<V: Into<Value>>(&self, dp: u32, value: V) -> Result<()> {
        self.set_dps(serde_json::json!({ dp.to_string(): value.into() }))
            .await
    }

    /// Receiver for every event from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.inner.core.events.subscribe()
    }

    /// Events as a `Stream`. Pin it before polling.
    pub fn stream(&self) -> impl Stream<Item = ClientEvent> + Send + 'static {
        let id = self.id().to_string();
        BroadcastStream::new(self.subscribe()).filter_map(move |event| {
            let id = id.clone();
            async move {
                match event {
                    Ok(event) => Some(event),
                    Err(BroadcastStreamRecvError::Lagged(n)) => {
                        warn!("Event stream for {} lagged, {} events skipped", id, n);
                        None
                    }
                }
            }
        })
    }

    /// Register a callback for one event kind. It runs on the client task.
    pub fn on<F>(&self, kind: EventKind, handler: F) -> SubscriptionId
    where
        F: Fn(&ClientEvent) + Send + Sync + 'static,
    {
        self.inner.core.events.on(kind, handler)
    }

    pub fn off(&self, id: SubscriptionId) -> bool {
        self.inner.core.events.off(id)
    }
}

enum ReaderEvent {
    Frame(Frame),
    Invalid(TuyaError),
    /// Stream ended; `None` for a clean EOF
    Closed(Option<TuyaError>),
}

struct Connection {
    writer: OwnedWriteHalf,
    codec: Arc<FrameCodec>,
    events: mpsc::Receiver<ReaderEvent>,
    cancel: CancellationToken,
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn read_loop(
    device_id: String,
    mut reader: OwnedReadHalf,
    codec: Arc<FrameCodec>,
    tx: mpsc::Sender<ReaderEvent>,
    cancel: CancellationToken,
    io_timeout: Duration,
) {
    loop {
        let result = tokio::select! {
            _ = cancel.cancelled() => break,
            r = read_frame(&mut reader, codec.version(), io_timeout) => r,
        };

        let event = match result {
            Ok(Some(raw)) => {
                debug!("Received from {}: {}", device_id, hex::encode(&raw));
                match codec.decode(&raw) {
                    Ok(frame) => ReaderEvent::Frame(frame),
                    Err(e) => ReaderEvent::Invalid(e),
                }
            }
            Ok(None) => ReaderEvent::Closed(None),
            Err(e @ TuyaError::Parse(_)) => ReaderEvent::Invalid(e),
            Err(e) => ReaderEvent::Closed(Some(e)),
        };

        let closing = matches!(event, ReaderEvent::Closed(_));
        if tx.send(event).await.is_err() || closing {
            break;
        }
    }
    debug!("Reader task for {} stopped", device_id);
}

async fn next_reader_event(conn: &mut Option<Connection>) -> ReaderEvent {
    match conn {
        Some(conn) => conn
            .events
            .recv()
            .await
            .unwrap_or(ReaderEvent::Closed(None)),
        None => std::future::pending().await,
    }
}

async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(at) => sleep_until(at).await,
        None => std::future::pending().await,
    }
}

struct Worker {
    core: Arc<Core>,
    commands: mpsc::Receiver<Command>,
    state: LinkState,
    conn: Option<Connection>,
    /// Scheduled reconnect after a failure within the retry budget
    retry_at: Option<Instant>,
    /// Failed connects outside the retry policy (start, idle reconnect)
    idle_failures: u32,
    idle_retry_at: Option<Instant>,
    invalid_frames: u32,
}

impl Worker {
    fn new(core: Arc<Core>, commands: mpsc::Receiver<Command>) -> Self {
        let state = LinkState::new(
            core.config.queue_capacity,
            core.config.heartbeat_limit,
            core.config.max_retries,
        );
        Self {
            core,
            commands,
            state,
            conn: None,
            retry_at: None,
            idle_failures: 0,
            idle_retry_at: None,
            invalid_frames: 0,
        }
    }

    fn id(&self) -> &str {
        &self.core.descriptor.id
    }

    fn emit(&self, event: ClientEvent) {
        self.core.events.emit(event);
    }

    async fn run(mut self) {
        debug!("Connection task for {} started", self.id());
        if let Err(e) = self.connect().await {
            self.on_idle_connect_failure(e);
        }

        let period = self.core.config.heartbeat_interval;
        let mut heartbeat = interval_at(Instant::now() + period, period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            self.flush().await;

            tokio::select! {
                _ = self.core.cancel.cancelled() => break,
                command = self.commands.recv() => match command {
                    Some(Command::Send { item, resp }) => {
                        let result = self.enqueue(item).await;
                        let _ = resp.send(result);
                    }
                    None => {
                        debug!("All handles for {} dropped", self.core.descriptor.id);
                        break;
                    }
                },
                _ = heartbeat.tick() => self.on_heartbeat().await,
                event = next_reader_event(&mut self.conn) => self.on_reader_event(event),
                _ = sleep_until_deadline(self.retry_at) => {
                    self.retry_at = None;
                    self.retry().await;
                }
            }
        }

        self.conn = None;
        self.core.set_status(ConnectionStatus::Disconnected);
        debug!("Connection task for {} exited", self.id());
    }

    async fn connect(&mut self) -> Result<()> {
        self.conn = None;
        self.core.set_status(ConnectionStatus::Connecting);

        let cancel = self.core.cancel.clone();
        let result = tokio::select! {
            _ = cancel.cancelled() => Err(TuyaError::Stopped),
            r = self.open() => r,
        };

        match result {
            Ok(conn) => {
                info!("Connected to device {}", self.id());
                self.conn = Some(conn);
                self.idle_failures = 0;
                self.idle_retry_at = None;
                self.invalid_frames = 0;
                self.core.set_status(ConnectionStatus::Connected);
                self.emit(ClientEvent::new(self.id(), EventKind::Connected));
                Ok(())
            }
            Err(e) => {
                self.core.set_status(ConnectionStatus::Disconnected);
                Err(e)
            }
        }
    }

    async fn open(&mut self) -> Result<Connection> {
        let core = self.core.clone();
        let descriptor = &core.descriptor;
        let port = descriptor.port.unwrap_or(core.config.port);

        info!(
            "Connecting to device {} at {}:{} (v{})",
            descriptor.id, descriptor.ip, port, descriptor.version
        );
        let mut stream = connect_stream(&descriptor.ip, port, core.config.connect_timeout).await?;
        self.state.on_connected();

        let local_key = descriptor.local_key.as_bytes();
        let key = if descriptor.version.needs_session_key() {
            core.set_status(ConnectionStatus::Handshaking);
            let session = negotiate(
                &mut stream,
                local_key,
                self.state.seqno_mut(),
                generate_nonce(),
                &core.config.handshake,
            )
            .await?;
            session.as_bytes().to_vec()
        } else {
            local_key.to_vec()
        };
        let codec = Arc::new(FrameCodec::new(descriptor.version, &key)?);

        let (reader, writer) = stream.into_split();
        let (tx, rx) = mpsc::channel(READER_CHANNEL_CAPACITY);
        let cancel = core.cancel.child_token();
        tokio::spawn(read_loop(
            descriptor.id.clone(),
            reader,
            codec.clone(),
            tx,
            cancel.clone(),
            core.config.io_timeout,
        ));

        Ok(Connection {
            writer,
            codec,
            events: rx,
            cancel,
        })
    }

    fn drop_connection(&mut self) {
        self.conn = None;
        self.state.on_disconnected();
    }

    /// Write the queue head if the link is up and nothing is in flight.
    async fn flush(&mut self) {
        let Some(conn) = self.conn.as_mut() else {
            return;
        };
        let Some(item) = self.state.writable_head().cloned() else {
            return;
        };

        let frame = Frame::new(item.command, self.state.next_seqno(), item.payload);
        let result = match conn.codec.encode(&frame) {
            Ok(data) => {
                debug!(
                    "Sending {:?} (seq {}) to {}: {}",
                    frame.cmd,
                    frame.seqno,
                    self.core.descriptor.id,
                    hex::encode(&data)
                );
                write_frame(&mut conn.writer, &data, self.core.config.io_timeout).await
            }
            Err(e) => Err(e),
        };

        match result {
            Ok(()) => self.state.mark_written(),
            Err(e) => {
                warn!("Write to {} failed: {}", self.id(), e);
                self.on_link_failure(e);
            }
        }
    }

    async fn enqueue(&mut self, item: QueueItem) -> Result<()> {
        if self.conn.is_none() && self.retry_at.is_none() {
            if let Err(e) = self.connect().await {
                self.on_idle_connect_failure(e.clone());
                return Err(e);
            }
        }

        match self.state.offer(item) {
            Ok(_) => Ok(()),
            Err(TuyaError::QueueOverflow) => {
                error!("Send queue for {} overflowed", self.id());
                if self.conn.is_some() {
                    self.drop_connection();
                    self.core.set_status(ConnectionStatus::Disconnected);
                }
                self.emit(ClientEvent::failure(
                    self.id(),
                    EventKind::ConnectionError,
                    TuyaError::QueueOverflow,
                ));
                Err(TuyaError::QueueOverflow)
            }
            Err(e) => Err(e),
        }
    }

    async fn on_heartbeat(&mut self) {
        if self.conn.is_none() {
            let due = self.idle_retry_at.is_none_or(|at| Instant::now() >= at);
            if self.retry_at.is_none() && due {
                debug!("Idle reconnect for {}", self.id());
                if let Err(e) = self.connect().await {
                    self.on_idle_connect_failure(e);
                }
            }
            return;
        }

        if self.state.heartbeat_overdue() {
            warn!(
                "Device {} left {} heartbeats unanswered, dropping connection",
                self.id(),
                self.state.outstanding_heartbeats()
            );
            self.on_link_failure(TuyaError::Timeout);
            return;
        }

        let offered = payload::heartbeat(&self.core.descriptor.id)
            .and_then(|item| self.state.offer(item));
        match offered {
            Ok(Admission::HeartbeatDropped) => {
                debug!("Queue for {} is busy, heartbeat skipped", self.id())
            }
            Ok(Admission::Queued { .. }) => {}
            Err(e) => warn!("Could not queue heartbeat for {}: {}", self.id(), e),
        }
    }

    fn on_reader_event(&mut self, event: ReaderEvent) {
        match event {
            ReaderEvent::Frame(frame) => {
                self.invalid_frames = 0;
                if let Some(done) = self.state.on_frame_received(frame.cmd) {
                    debug!("{:?} answered by {}", done.command, self.id());
                }
                if let Some(rc) = frame.retcode.filter(|&rc| rc != 0) {
                    warn!("Device {} returned code {} for {:?}", self.id(), rc, frame.cmd);
                }
                self.emit(ClientEvent::message(self.id(), frame));
            }
            ReaderEvent::Invalid(err) => {
                self.invalid_frames += 1;
                warn!(
                    "Discarding undecodable frame from {} ({}/{}): {}",
                    self.id(),
                    self.invalid_frames,
                    MAX_INVALID_FRAMES,
                    err
                );
                if let Some(done) = self.state.on_undecodable_frame() {
                    warn!("Reply to {:?} from {} was unreadable", done.command, self.id());
                }
                if self.invalid_frames >= MAX_INVALID_FRAMES {
                    self.invalid_frames = 0;
                    self.on_link_failure(err);
                }
            }
            ReaderEvent::Closed(None) if !self.state.awaiting_reply() => {
                info!("Device {} closed the connection", self.id());
                self.drop_connection();
                self.core.set_status(ConnectionStatus::Disconnected);
                self.emit(ClientEvent::new(self.id(), EventKind::Disconnected));
            }
            ReaderEvent::Closed(None) => self.on_link_failure(TuyaError::Io(
                "connection closed while awaiting reply".into(),
            )),
            ReaderEvent::Closed(Some(err)) => self.on_link_failure(err),
        }
    }

    async fn retry(&mut self) {
        info!("Retrying connection to {}", self.id());
        match self.connect().await {
            Ok(()) | Err(TuyaError::Stopped) => {}
            Err(e) => self.on_link_failure(e),
        }
    }

    /// Failure of an established link or a scheduled reconnect.
    fn on_link_failure(&mut self, err: TuyaError) {
        self.drop_connection();

        match self.state.register_failure() {
            RetryDecision::WithinRetry { attempt } => {
                warn!(
                    "Connection to {} failed ({}), retry {}/{}",
                    self.id(),
                    err,
                    attempt,
                    self.core.config.max_retries
                );
                self.retry_at = Some(Instant::now() + self.core.config.retry_delay);
                self.core.set_status(ConnectionStatus::Retrying);
                self.emit(ClientEvent::failure(
                    self.id(),
                    EventKind::ConnectionErrorWithinRetry,
                    err,
                ));
            }
            RetryDecision::Exhausted { dropped } => {
                error!("Giving up on {} after repeated failures: {}", self.id(), err);
                if let Some(item) = dropped {
                    warn!("Dropped pending {:?} for {}", item.command, self.id());
                }
                self.retry_at = None;
                // Further reconnects go through the idle backoff.
                self.idle_failures += 1;
                self.idle_retry_at =
                    Some(Instant::now() + self.core.config.backoff(self.idle_failures));
                self.core.set_status(ConnectionStatus::Disconnected);
                self.emit(ClientEvent::failure(self.id(), EventKind::ConnectionError, err));
            }
        }
    }

    /// Failed connect on start or idle reconnect: no retry budget is spent.
    fn on_idle_connect_failure(&mut self, err: TuyaError) {
        if err == TuyaError::Stopped {
            return;
        }
        self.idle_failures += 1;
        let wait = self.core.config.backoff(self.idle_failures);
        self.idle_retry_at = Some(Instant::now() + wait);
        warn!(
            "Connection to {} failed ({}), next attempt in {:?}",
            self.id(),
            err,
            wait
        );
        self.emit(ClientEvent::failure(self.id(), EventKind::ConnectionError, err));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor() -> DeviceDescriptor {
        DeviceDescriptor::new("dev1", "127.0.0.1", "0123456789abcdef", Version::V3_3)
    }

    #[test]
    fn test_rejects_bad_key() {
        let bad = DeviceDescriptor::new("dev1", "127.0.0.1", "short", Version::V3_3);
        assert!(matches!(
            Client::new(bad, ClientConfig::default()),
            Err(TuyaError::Config(_))
        ));
    }

    #[test]
    fn test_start_needs_runtime() {
        let client = Client::new(descriptor(), ClientConfig::default()).unwrap();
        assert!(matches!(client.start(), Err(TuyaError::Config(_))));
    }

    #[tokio::test]
    async fn test_send_before_start_is_offline() {
        let client = Client::new(descriptor(), ClientConfig::default()).unwrap();
        assert_eq!(
            client.send("{}", CommandKind::DpQuery).await,
            Err(TuyaError::Offline)
        );
        assert!(!client.is_online());
        assert_eq!(client.connection_status(), ConnectionStatus::Disconnected);
    }

    #[tokio::test]
    async fn test_stop_without_start_then_send() {
        let client = Client::new(descriptor(), ClientConfig::default()).unwrap();
        client.stop().await;
        client.stop().await;
        assert_eq!(client.status().await, Err(TuyaError::Stopped));
        assert_eq!(client.start(), Err(TuyaError::Stopped));
    }
}
