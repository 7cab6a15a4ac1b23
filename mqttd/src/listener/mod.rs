//! Network listeners bound to a shared broker.
//!
//! Every listener binds its socket when constructed, serves until closed,
//! and closes exactly once: new connections are refused immediately, open
//! connections get a grace period, and whatever is left is then dropped.

mod http;
mod mqtt;
mod websocket;

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{info, warn};

use crate::broker::Broker;

pub use http::HttpListener;
pub use mqtt::{Framing, MqttListener};
pub use websocket::WsStream;

/// The four listener kinds a server can run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ListenerKind {
    /// MQTT over TCP.
    Mqtt,
    /// MQTT over TLS.
    MqttTls,
    /// MQTT over websocket, with or without TLS.
    WebSocket,
    /// HTTP status endpoints.
    HttpStatus,
}

impl ListenerKind {
    /// Start order used by the server.
    pub const ALL: [ListenerKind; 4] = [
        ListenerKind::MqttTls,
        ListenerKind::Mqtt,
        ListenerKind::WebSocket,
        ListenerKind::HttpStatus,
    ];

    /// Stable listener id, recorded with every client.
    pub fn id(self) -> &'static str {
        match self {
            ListenerKind::Mqtt => "mqtt",
            ListenerKind::MqttTls => "mqtt+tls",
            ListenerKind::WebSocket => "ws",
            ListenerKind::HttpStatus => "web",
        }
    }
}

impl std::fmt::Display for ListenerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.id())
    }
}

/// A network endpoint serving the broker.
#[async_trait]
pub trait Listener: Send + Sync {
    fn id(&self) -> &str;

    fn kind(&self) -> ListenerKind;

    /// Address the socket is bound to.
    fn local_addr(&self) -> SocketAddr;

    /// Transport name for logs: `tcp`, `tls`, `ws`, `wss` or `http`.
    fn protocol(&self) -> &'static str;

    /// Accept and serve connections until the listener is closed.
    ///
    /// A fatal accept error closes the listener.
    async fn serve(self: Arc<Self>, broker: Broker);

    /// Close the listener.
    ///
    /// Returns true for the call that released the listener's resources;
    /// every later or concurrent call returns false.
    async fn close(&self, broker: &Broker) -> bool;
}

/// Close state shared by the listener implementations.
pub(crate) struct Shutdown {
    id: &'static str,
    closed: AtomicBool,
    /// Stops the accept loop.
    accept: CancellationToken,
    /// Drops connections still open after the grace period.
    force: CancellationToken,
    /// Cancelled once a serving accept loop has dropped its socket.
    released: CancellationToken,
    tracker: TaskTracker,
    grace: Duration,
}

impl Shutdown {
    pub fn new(id: &'static str, grace: Duration) -> Self {
        Self {
            id,
            closed: AtomicBool::new(false),
            accept: CancellationToken::new(),
            force: CancellationToken::new(),
            released: CancellationToken::new(),
            tracker: TaskTracker::new(),
            grace,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Claim the close. Only the first caller gets true.
    pub fn begin(&self) -> bool {
        if self
            .closed
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return false;
        }
        self.accept.cancel();
        true
    }

    /// Release the listening socket, or wait for the accept loop that took it.
    pub async fn release_socket(&self, socket: &parking_lot::Mutex<Option<TcpListener>>) {
        let idle = socket.lock().take();
        if idle.is_none() {
            self.released.cancelled().await;
        }
    }

    /// Wait for tracked tasks, forcing them closed after the grace period.
    pub async fn drain(&self) {
        self.tracker.close();
        if tokio::time::timeout(self.grace, self.tracker.wait()).await.is_err() {
            warn!(
                listener = self.id,
                open = self.tracker.len(),
                grace = ?self.grace,
                "grace period elapsed, forcing connections closed"
            );
            self.force.cancel();
            self.tracker.wait().await;
        }
        info!(listener = self.id, "listener closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_ids() {
        let ids: Vec<_> = ListenerKind::ALL.iter().map(|k| k.id()).collect();
        assert_eq!(ids, ["mqtt+tls", "mqtt", "ws", "web"]);
        assert_eq!(ListenerKind::WebSocket.to_string(), "ws");
    }

    #[tokio::test]
    async fn test_shutdown_begins_once() {
        let shutdown = Shutdown::new("test", Duration::from_millis(10));
        assert!(shutdown.begin());
        assert!(!shutdown.begin());
        assert!(shutdown.is_closed());
        assert!(shutdown.accept.is_cancelled());
        shutdown.drain().await;
        assert!(!shutdown.force.is_cancelled());
    }

    #[tokio::test]
    async fn test_drain_forces_after_grace() {
        let shutdown = Shutdown::new("test", Duration::from_millis(20));
        let force = shutdown.force.clone();
        shutdown.tracker.spawn(async move {
            tokio::select! {
                _ = force.cancelled() => {}
                _ = tokio::time::sleep(Duration::from_secs(60)) => {}
            }
        });
        assert!(shutdown.begin());
        tokio::time::timeout(Duration::from_secs(5), shutdown.drain())
            .await
            .unwrap();
        assert!(shutdown.force.is_cancelled());
    }
}
