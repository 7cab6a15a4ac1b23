//! MQTT listener over TCP, optionally wrapped in TLS and/or websocket framing.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rustls::ServerConfig;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info};

use super::{Listener, ListenerKind, Shutdown, websocket};
use crate::broker::Broker;
use crate::error::{Error, Result};

/// Time allowed for a TLS or websocket handshake.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// How MQTT packets are carried over the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    /// Packets directly on the stream.
    Raw,
    /// Packets in binary websocket frames.
    WebSocket,
}

/// Listener for MQTT clients.
pub struct MqttListener {
    kind: ListenerKind,
    addr: SocketAddr,
    framing: Framing,
    tls: Option<TlsAcceptor>,
    socket: Mutex<Option<TcpListener>>,
    shutdown: Shutdown,
}

impl std::fmt::Debug for MqttListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MqttListener")
            .field("kind", &self.kind)
            .field("addr", &self.addr)
            .field("framing", &self.framing)
            .field("tls", &self.tls.is_some())
            .finish()
    }
}

impl MqttListener {
    /// Bind a listener of `kind` to `addr`.
    ///
    /// [`ListenerKind::Mqtt`] uses raw framing, [`ListenerKind::MqttTls`] raw
    /// framing over TLS, and [`ListenerKind::WebSocket`] websocket framing
    /// over TLS when `tls` is given.
    pub async fn bind(
        kind: ListenerKind,
        addr: SocketAddr,
        tls: Option<Arc<ServerConfig>>,
        grace: Duration,
    ) -> Result<Self> {
        let framing = match kind {
            ListenerKind::Mqtt | ListenerKind::MqttTls => Framing::Raw,
            ListenerKind::WebSocket => Framing::WebSocket,
            ListenerKind::HttpStatus => {
                return Err(Error::InvalidConfig(
                    "http status listener cannot serve MQTT".to_string(),
                ));
            }
        };
        let tls = match (kind, tls) {
            (ListenerKind::Mqtt, _) => None,
            (ListenerKind::MqttTls, None) => {
                return Err(Error::InvalidConfig(
                    "mqtt+tls listener needs a TLS configuration".to_string(),
                ));
            }
            (_, tls) => tls.map(TlsAcceptor::from),
        };

        let bind_error = |source: io::Error| Error::Bind {
            id: kind.id().to_string(),
            addr: addr.to_string(),
            source,
        };
        let socket = TcpListener::bind(addr).await.map_err(bind_error)?;
        let addr = socket.local_addr().map_err(bind_error)?;

        Ok(Self {
            kind,
            addr,
            framing,
            tls,
            socket: Mutex::new(Some(socket)),
            shutdown: Shutdown::new(kind.id(), grace),
        })
    }

    fn spawn_connection(&self, stream: TcpStream, remote: SocketAddr, broker: &Broker) {
        let broker = broker.clone();
        let id = self.kind.id();
        let tls = self.tls.clone();
        let framing = self.framing;
        let force = self.shutdown.force.clone();

        self.shutdown.tracker.spawn(async move {
            tokio::select! {
                _ = force.cancelled() => debug!(listener = id, %remote, "connection force-closed"),
                result = serve_accepted(stream, tls, framing, &broker, id, remote) => {
                    if let Err(e) = result {
                        debug!(listener = id, %remote, error = %e, "connection ended");
                    }
                }
            }
        });
    }
}

async fn serve_accepted(
    stream: TcpStream,
    tls: Option<TlsAcceptor>,
    framing: Framing,
    broker: &Broker,
    id: &str,
    remote: SocketAddr,
) -> Result<()> {
    match tls {
        Some(acceptor) => {
            let stream = tokio::time::timeout(HANDSHAKE_TIMEOUT, acceptor.accept(stream))
                .await
                .map_err(|_| Error::Timeout("tls handshake".to_string()))??;
            serve_stream(stream, framing, broker, id, remote).await
        }
        None => serve_stream(stream, framing, broker, id, remote).await,
    }
}

async fn serve_stream<S>(
    stream: S,
    framing: Framing,
    broker: &Broker,
    id: &str,
    remote: SocketAddr,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    match framing {
        Framing::Raw => broker.serve_connection(stream, id, remote).await,
        Framing::WebSocket => {
            let ws = tokio::time::timeout(HANDSHAKE_TIMEOUT, websocket::accept(stream))
                .await
                .map_err(|_| Error::Timeout("websocket handshake".to_string()))??;
            broker.serve_connection(ws, id, remote).await
        }
    }
}

/// Accept errors that concern one connection rather than the socket.
fn is_transient(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
    )
}

#[async_trait]
impl Listener for MqttListener {
    fn id(&self) -> &str {
        self.kind.id()
    }

    fn kind(&self) -> ListenerKind {
        self.kind
    }

    fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    fn protocol(&self) -> &'static str {
        match (self.framing, self.tls.is_some()) {
            (Framing::Raw, false) => "tcp",
            (Framing::Raw, true) => "tls",
            (Framing::WebSocket, false) => "ws",
            (Framing::WebSocket, true) => "wss",
        }
    }

    async fn serve(self: Arc<Self>, broker: Broker) {
        let Some(socket) = self.socket.lock().take() else {
            debug!(listener = self.id(), "listener closed or already serving");
            return;
        };
        info!(listener = self.id(), protocol = self.protocol(), addr = %self.addr, "listening");

        let fatal = loop {
            tokio::select! {
                _ = self.shutdown.accept.cancelled() => break false,
                accepted = socket.accept() => match accepted {
                    Ok((stream, remote)) => {
                        debug!(listener = self.id(), %remote, "accepted connection");
                        self.spawn_connection(stream, remote, &broker);
                    }
                    Err(e) if is_transient(&e) => {
                        debug!(listener = self.id(), error = %e, "accept failed");
                    }
                    Err(e) => {
                        error!(listener = self.id(), error = %e, "accept error, closing listener");
                        break true;
                    }
                },
            }
        };

        drop(socket);
        self.shutdown.released.cancel();
        if fatal {
            self.close(&broker).await;
        }
    }

    async fn close(&self, broker: &Broker) -> bool {
        if !self.shutdown.begin() {
            return false;
        }
        self.shutdown.release_socket(&self.socket).await;
        broker.close_clients(self.id());
        self.shutdown.drain().await;
        true
    }
}
