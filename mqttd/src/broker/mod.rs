//! QoS 0 MQTT broker core.
//!
//! The broker owns the client table, the subscription table and the
//! authorization hook. It does not accept connections itself: listeners hand
//! it accepted streams through [`Broker::serve_connection`], so the same core
//! serves plain TCP, TLS and websocket clients at once.
//!
//! ## Features
//!
//! - MQTT 3.1.1 and 5.0, detected from the CONNECT packet
//! - Authentication and ACL on every CONNECT, PUBLISH and SUBSCRIBE
//! - MQTT 5.0 topic aliases (with configurable limit)
//! - Session takeover: a second connection with the same client id replaces
//!   the first
//! - Inline client: publish and subscribe from inside the process
//! - `$SYS/broker/info` published periodically while serving

mod protocol;
mod session;
mod types;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::error::{Error, Result};
use crate::topic;

pub use protocol::MAX_PACKET_SIZE;
pub use types::{
    AllowAll, Authenticator, ClientInfo, ConnInfo, Handler, Message, ProtocolVersion,
    SubscriptionInfo, SystemInfo,
};

/// Default maximum topic aliases per client (MQTT 5.0).
pub const DEFAULT_MAX_TOPIC_ALIAS: u16 = 65535;

/// Default per-connection read buffer (4 KiB).
pub const DEFAULT_BUFFER_SIZE: usize = 4 * 1024;

/// Topic the system snapshot is published to.
pub const SYS_INFO_TOPIC: &str = "$SYS/broker/info";

/// Outbound queue depth per client.
const CLIENT_QUEUE: usize = 100;

/// Broker configuration.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Initial read buffer capacity per connection, in bytes.
    pub buffer_size: usize,
    /// Maximum topic aliases per client (MQTT 5.0).
    pub max_topic_alias: u16,
    /// Allow in-process publish and subscribe.
    pub inline_client: bool,
    /// Period of `$SYS/broker/info` publication; `None` disables it.
    pub sys_interval: Option<Duration>,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            buffer_size: DEFAULT_BUFFER_SIZE,
            max_topic_alias: DEFAULT_MAX_TOPIC_ALIAS,
            inline_client: false,
            sys_interval: Some(Duration::from_secs(30)),
        }
    }
}

impl BrokerConfig {
    /// Set the per-connection read buffer capacity.
    pub fn buffer_size(mut self, bytes: usize) -> Self {
        self.buffer_size = bytes;
        self
    }

    /// Set maximum topic aliases per client (MQTT 5.0).
    pub fn max_topic_alias(mut self, max: u16) -> Self {
        self.max_topic_alias = max;
        self
    }

    /// Enable or disable the inline client.
    pub fn inline_client(mut self, enabled: bool) -> Self {
        self.inline_client = enabled;
        self
    }

    /// Set the `$SYS/broker/info` period.
    pub fn sys_interval(mut self, interval: Option<Duration>) -> Self {
        self.sys_interval = interval;
        self
    }
}

/// Builder for Broker.
pub struct BrokerBuilder {
    config: BrokerConfig,
    authenticator: Option<Arc<dyn Authenticator>>,
}

impl BrokerBuilder {
    /// Create a new broker builder.
    pub fn new(config: BrokerConfig) -> Self {
        Self {
            config,
            authenticator: None,
        }
    }

    /// Set the authenticator.
    pub fn authenticator<A: Authenticator + 'static>(mut self, auth: A) -> Self {
        self.authenticator = Some(Arc::new(auth));
        self
    }

    /// Set an already shared authenticator.
    pub fn shared_authenticator(mut self, auth: Arc<dyn Authenticator>) -> Self {
        self.authenticator = Some(auth);
        self
    }

    /// Build the broker.
    pub fn build(self) -> Broker {
        Broker {
            inner: Arc::new(Shared {
                config: self.config,
                authenticator: self.authenticator.unwrap_or_else(|| Arc::new(AllowAll)),
                clients: RwLock::new(HashMap::new()),
                subscriptions: RwLock::new(HashMap::new()),
                stats: Arc::new(Stats::default()),
                started: Utc::now(),
                running: AtomicBool::new(false),
                shutdown: CancellationToken::new(),
                next_client: AtomicU64::new(1),
            }),
        }
    }
}

/// Broker counters, updated lock-free from connection tasks.
#[derive(Debug, Default)]
pub(crate) struct Stats {
    bytes_received: AtomicU64,
    bytes_sent: AtomicU64,
    packets_received: AtomicU64,
    packets_sent: AtomicU64,
    messages_received: AtomicU64,
    messages_sent: AtomicU64,
    messages_dropped: AtomicU64,
    clients_total: AtomicU64,
    clients_disconnected: AtomicU64,
    clients_maximum: AtomicU64,
}

impl Stats {
    pub fn bytes_received(&self, n: usize) {
        self.bytes_received.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn bytes_sent(&self, n: usize) {
        self.bytes_sent.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn packet_received(&self) {
        self.packets_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn packet_sent(&self) {
        self.packets_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn message_received(&self) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn message_sent(&self) {
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
    }

    fn message_dropped(&self) {
        self.messages_dropped.fetch_add(1, Ordering::Relaxed);
    }
}

/// Who receives messages for a filter.
#[derive(Clone)]
enum Subscriber {
    /// A network client. The sender is compared by pointer so a stale session
    /// never removes the subscriptions of the session that replaced it.
    Client {
        client_id: Arc<str>,
        tx: Arc<mpsc::Sender<Message>>,
    },
    /// An in-process subscription.
    Inline { id: String, handler: Arc<dyn Handler> },
}

impl Subscriber {
    fn same_sender(&self, other: &Arc<mpsc::Sender<Message>>) -> bool {
        matches!(self, Subscriber::Client { tx, .. } if Arc::ptr_eq(tx, other))
    }
}

/// A registered network session.
struct ClientEntry {
    tx: Arc<mpsc::Sender<Message>>,
    cancel: CancellationToken,
    info: ClientInfo,
}

pub(crate) struct Shared {
    config: BrokerConfig,
    authenticator: Arc<dyn Authenticator>,
    clients: RwLock<HashMap<String, ClientEntry>>,
    /// Filter -> subscribers.
    subscriptions: RwLock<HashMap<String, Vec<Subscriber>>>,
    stats: Arc<Stats>,
    started: DateTime<Utc>,
    running: AtomicBool,
    shutdown: CancellationToken,
    next_client: AtomicU64,
}

/// QoS 0 MQTT broker supporting both v4 and v5.
///
/// Cloning is cheap; clones share the same core.
#[derive(Clone)]
pub struct Broker {
    inner: Arc<Shared>,
}

impl std::fmt::Debug for Broker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Broker")
            .field("config", &self.inner.config)
            .field("running", &self.is_running())
            .finish()
    }
}

impl Broker {
    /// Create a new broker with the given config.
    pub fn new(config: BrokerConfig) -> Self {
        BrokerBuilder::new(config).build()
    }

    /// Create a builder for this broker.
    pub fn builder(config: BrokerConfig) -> BrokerBuilder {
        BrokerBuilder::new(config)
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.inner.config
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Start the broker's background work.
    ///
    /// Returns immediately. Connections may be served before or after this
    /// call; `serve` only starts the `$SYS` publisher and marks the broker
    /// running.
    pub fn serve(&self) -> Result<()> {
        if self.inner.shutdown.is_cancelled() {
            return Err(Error::ShuttingDown);
        }
        if self
            .inner
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(Error::AlreadyRunning);
        }

        if let Some(interval) = self.inner.config.sys_interval {
            let broker = self.clone();
            tokio::spawn(async move { broker.publish_sys_info(interval).await });
        }

        info!("broker serving");
        Ok(())
    }

    async fn publish_sys_info(&self, period: Duration) {
        let mut ticker = tokio::time::interval(period);
        loop {
            tokio::select! {
                _ = self.inner.shutdown.cancelled() => return,
                _ = ticker.tick() => {}
            }
            match serde_json::to_vec(&self.info()) {
                Ok(payload) => {
                    self.inner.route(&Message::new(SYS_INFO_TOPIC, payload));
                }
                Err(e) => warn!(error = %e, "failed to encode system info"),
            }
        }
    }

    /// Close every session and stop background work.
    ///
    /// A closed broker refuses new connections and cannot be served again.
    pub fn close(&self) {
        if !self.inner.shutdown.is_cancelled() {
            info!(clients = self.inner.clients.read().len(), "closing broker");
        }
        self.inner.shutdown.cancel();
        self.inner.running.store(false, Ordering::SeqCst);
    }

    /// Disconnect every client that arrived through `listener`.
    ///
    /// Returns the number of sessions told to close.
    pub fn close_clients(&self, listener: &str) -> usize {
        let clients = self.inner.clients.read();
        let mut closed = 0;
        for entry in clients.values().filter(|e| e.info.listener == listener) {
            entry.cancel.cancel();
            closed += 1;
        }
        if closed > 0 {
            debug!(listener, closed, "closing listener clients");
        }
        closed
    }

    /// Run an MQTT session over an accepted stream until it ends.
    ///
    /// `listener` is the id of the accepting listener, recorded with the
    /// client and passed to the authenticator.
    pub async fn serve_connection<S>(&self, stream: S, listener: &str, remote: SocketAddr) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        if self.inner.shutdown.is_cancelled() {
            return Err(Error::ShuttingDown);
        }
        session::run(Arc::clone(&self.inner), stream, listener, remote).await
    }

    /// Snapshot of connected clients.
    pub fn clients(&self) -> Vec<ClientInfo> {
        self.inner
            .clients
            .read()
            .values()
            .map(|entry| entry.info.clone())
            .collect()
    }

    /// Snapshot of broker counters.
    pub fn info(&self) -> SystemInfo {
        let inner = &self.inner;
        let now = Utc::now();
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        let subscriptions = inner.subscriptions.read().values().map(|s| s.len() as u64).sum();
        SystemInfo {
            version: env!("CARGO_PKG_VERSION").to_string(),
            started: inner.started.timestamp(),
            time: now.timestamp(),
            uptime: (now - inner.started).num_seconds(),
            bytes_received: load(&inner.stats.bytes_received),
            bytes_sent: load(&inner.stats.bytes_sent),
            clients_connected: inner.clients.read().len() as u64,
            clients_disconnected: load(&inner.stats.clients_disconnected),
            clients_maximum: load(&inner.stats.clients_maximum),
            clients_total: load(&inner.stats.clients_total),
            messages_received: load(&inner.stats.messages_received),
            messages_sent: load(&inner.stats.messages_sent),
            messages_dropped: load(&inner.stats.messages_dropped),
            packets_received: load(&inner.stats.packets_received),
            packets_sent: load(&inner.stats.packets_sent),
            subscriptions,
        }
    }

    /// Publish a message from inside the process.
    pub fn publish(&self, topic: &str, payload: impl Into<Bytes>) -> Result<()> {
        self.inline_allowed()?;
        if topic.is_empty() || topic.contains(['+', '#']) {
            return Err(Error::Protocol(format!("invalid publish topic: {topic:?}")));
        }
        self.inner.stats.message_received();
        self.inner.route(&Message::new(topic, payload.into()));
        Ok(())
    }

    /// Subscribe an in-process handler to `filter` under `id`.
    ///
    /// Subscribing again with the same filter and id replaces the handler.
    pub fn subscribe<H: Handler + 'static>(&self, filter: &str, id: &str, handler: H) -> Result<()> {
        self.inline_allowed()?;
        topic::validate_filter(filter)?;
        let mut subs = self.inner.subscriptions.write();
        let entry = subs.entry(filter.to_string()).or_default();
        entry.retain(|s| !matches!(s, Subscriber::Inline { id: existing, .. } if existing == id));
        entry.push(Subscriber::Inline {
            id: id.to_string(),
            handler: Arc::new(handler),
        });
        debug!(filter, id, "inline subscription added");
        Ok(())
    }

    /// Remove the in-process subscription `id` from `filter`.
    pub fn unsubscribe(&self, filter: &str, id: &str) -> Result<()> {
        self.inline_allowed()?;
        let mut subs = self.inner.subscriptions.write();
        if let Some(entry) = subs.get_mut(filter) {
            entry.retain(|s| !matches!(s, Subscriber::Inline { id: existing, .. } if existing == id));
            if entry.is_empty() {
                subs.remove(filter);
            }
        }
        Ok(())
    }

    fn inline_allowed(&self) -> Result<()> {
        if self.inner.config.inline_client {
            Ok(())
        } else {
            Err(Error::InlineClientDisabled)
        }
    }
}

/// Whether routing delivers `topic` to a subscription on `filter`.
///
/// Filters starting with a wildcard never receive `$` topics.
pub fn route_matches(topic: &str, filter: &str) -> bool {
    if topic.starts_with('$') && (filter.starts_with('+') || filter.starts_with('#')) {
        return false;
    }
    topic::matches(topic, filter)
}

impl Shared {
    fn client_id_for(&self, requested: &str) -> String {
        if requested.is_empty() {
            let n = self.next_client.fetch_add(1, Ordering::Relaxed);
            format!("mqttd-{n}")
        } else {
            requested.to_string()
        }
    }

    /// Register a session, replacing any session with the same client id.
    fn register(&self, info: ClientInfo, tx: Arc<mpsc::Sender<Message>>) -> CancellationToken {
        let cancel = self.shutdown.child_token();
        let previous = {
            let mut clients = self.clients.write();
            let previous = clients.insert(
                info.id.clone(),
                ClientEntry {
                    tx,
                    cancel: cancel.clone(),
                    info,
                },
            );
            let connected = clients.len() as u64;
            self.stats.clients_maximum.fetch_max(connected, Ordering::Relaxed);
            previous
        };
        self.stats.clients_total.fetch_add(1, Ordering::Relaxed);

        if let Some(previous) = previous {
            debug!(client = %previous.info.id, "session taken over");
            previous.cancel.cancel();
        }
        cancel
    }

    /// Remove a session's client entry and subscriptions.
    ///
    /// The client entry is only removed if it still belongs to `tx`.
    fn unregister(&self, client_id: &str, tx: &Arc<mpsc::Sender<Message>>) {
        {
            let mut clients = self.clients.write();
            if clients.get(client_id).is_some_and(|e| Arc::ptr_eq(&e.tx, tx)) {
                clients.remove(client_id);
            }
        }

        let mut subs = self.subscriptions.write();
        subs.retain(|_, subscribers| {
            subscribers.retain(|s| !s.same_sender(tx));
            !subscribers.is_empty()
        });
        drop(subs);

        self.stats.clients_disconnected.fetch_add(1, Ordering::Relaxed);
    }

    fn subscribe_client(&self, client_id: &str, filter: &str, tx: &Arc<mpsc::Sender<Message>>) {
        {
            let mut subs = self.subscriptions.write();
            let entry = subs.entry(filter.to_string()).or_default();
            if !entry.iter().any(|s| s.same_sender(tx)) {
                entry.push(Subscriber::Client {
                    client_id: Arc::from(client_id),
                    tx: Arc::clone(tx),
                });
            }
        }

        let mut clients = self.clients.write();
        if let Some(entry) = clients.get_mut(client_id).filter(|e| Arc::ptr_eq(&e.tx, tx)) {
            let subs = &mut entry.info.subscriptions;
            if !subs.iter().any(|s| s.filter == filter) {
                subs.push(SubscriptionInfo {
                    filter: filter.to_string(),
                    qos: 0,
                });
            }
        }
    }

    fn unsubscribe_client(&self, client_id: &str, filter: &str, tx: &Arc<mpsc::Sender<Message>>) {
        {
            let mut subs = self.subscriptions.write();
            if let Some(entry) = subs.get_mut(filter) {
                entry.retain(|s| !s.same_sender(tx));
                if entry.is_empty() {
                    subs.remove(filter);
                }
            }
        }

        let mut clients = self.clients.write();
        if let Some(entry) = clients.get_mut(client_id).filter(|e| Arc::ptr_eq(&e.tx, tx)) {
            entry.info.subscriptions.retain(|s| s.filter != filter);
        }
    }

    /// Deliver `msg` to every matching subscriber.
    ///
    /// Client queues are never awaited; a full queue drops the message for
    /// that client.
    fn route(&self, msg: &Message) {
        let targets: Vec<Subscriber> = {
            let subs = self.subscriptions.read();
            subs.iter()
                .filter(|(filter, _)| route_matches(&msg.topic, filter))
                .flat_map(|(_, subscribers)| subscribers.iter().cloned())
                .collect()
        };

        let mut delivered: Vec<&Arc<mpsc::Sender<Message>>> = Vec::new();
        for target in &targets {
            match target {
                Subscriber::Client { client_id, tx } => {
                    // One copy per client even when several filters match.
                    if delivered.iter().any(|seen| Arc::ptr_eq(seen, tx)) {
                        continue;
                    }
                    delivered.push(tx);
                    if let Err(e) = tx.try_send(msg.clone()) {
                        self.stats.message_dropped();
                        debug!(client = %client_id, error = %e, "message dropped");
                    }
                }
                Subscriber::Inline { id, handler } => handler.handle(id, msg),
            }
        }
        trace!(topic = %msg.topic, receivers = targets.len(), "routed");
    }
}
