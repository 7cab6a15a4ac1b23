//! Types shared between the broker core and its hooks.

use std::net::SocketAddr;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Serialize;

/// MQTT protocol version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProtocolVersion {
    /// MQTT 3.1.1
    #[default]
    V4,
    /// MQTT 5.0
    V5,
}

impl ProtocolVersion {
    /// Protocol level byte as sent in CONNECT.
    pub fn level(self) -> u8 {
        match self {
            ProtocolVersion::V4 => 4,
            ProtocolVersion::V5 => 5,
        }
    }
}

impl std::fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProtocolVersion::V4 => write!(f, "MQTT 3.1.1"),
            ProtocolVersion::V5 => write!(f, "MQTT 5.0"),
        }
    }
}

/// MQTT message.
#[derive(Debug, Clone)]
pub struct Message {
    /// Topic name.
    pub topic: String,
    /// Message payload.
    pub payload: Bytes,
    /// Retain flag.
    pub retain: bool,
}

impl Message {
    /// Create a new message.
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            retain: false,
        }
    }
}

/// Identity of a connection, handed to [`Authenticator`] hooks.
#[derive(Debug, Clone)]
pub struct ConnInfo {
    pub client_id: String,
    /// Empty when the client sent no credentials.
    pub username: String,
    pub remote: SocketAddr,
    /// Id of the listener that accepted the connection.
    pub listener: String,
}

/// Authentication and authorization for MQTT clients.
pub trait Authenticator: Send + Sync {
    /// Authenticate a client connection.
    ///
    /// Called when a client sends CONNECT packet.
    /// Returns true to allow the connection.
    fn authenticate(&self, conn: &ConnInfo, password: &[u8]) -> bool;

    /// Check ACL permissions.
    ///
    /// - `write=true`: client is publishing to the topic
    /// - `write=false`: client is subscribing to the topic filter
    fn acl(&self, conn: &ConnInfo, topic: &str, write: bool) -> bool;
}

/// Allow-all authenticator, installed when auth is disabled.
#[derive(Debug, Default, Clone)]
pub struct AllowAll;

impl Authenticator for AllowAll {
    fn authenticate(&self, _conn: &ConnInfo, _password: &[u8]) -> bool {
        true
    }

    fn acl(&self, _conn: &ConnInfo, _topic: &str, _write: bool) -> bool {
        true
    }
}

/// Receiver for messages routed to an inline subscription.
pub trait Handler: Send + Sync {
    /// Called for every message matching the subscription, with the id the
    /// subscription was registered under.
    fn handle(&self, subscription_id: &str, msg: &Message);
}

impl<F> Handler for F
where
    F: Fn(&str, &Message) + Send + Sync,
{
    fn handle(&self, subscription_id: &str, msg: &Message) {
        self(subscription_id, msg)
    }
}

/// One subscription held by a client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubscriptionInfo {
    pub filter: String,
    pub qos: u8,
}

/// Snapshot of a connected client.
#[derive(Debug, Clone, Serialize)]
pub struct ClientInfo {
    pub id: String,
    pub remote: String,
    pub listener: String,
    pub protocol_version: u8,
    pub username: String,
    pub clean_session: bool,
    pub keep_alive: u16,
    pub connected_at: DateTime<Utc>,
    pub subscriptions: Vec<SubscriptionInfo>,
}

/// Snapshot of broker counters.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SystemInfo {
    pub version: String,
    /// Unix seconds.
    pub started: i64,
    /// Unix seconds at the time of the snapshot.
    pub time: i64,
    /// Seconds since start.
    pub uptime: i64,
    pub bytes_received: u64,
    pub bytes_sent: u64,
    pub clients_connected: u64,
    pub clients_disconnected: u64,
    pub clients_maximum: u64,
    pub clients_total: u64,
    pub messages_received: u64,
    pub messages_sent: u64,
    pub messages_dropped: u64,
    pub packets_received: u64,
    pub packets_sent: u64,
    pub subscriptions: u64,
}
